//! Thread-blocking synchronization primitives.
//!
//! # Primitives
//!
//! - __[`QueuedLock`]__: a single-word exclusive/shared lock. The word holds
//!   either the shared-owner count or, under contention, a pointer to an
//!   intrusive list of stack-allocated wait blocks. Approximate FIFO among
//!   blocked waiters; adjacent shared waiters wake as a batch.
//! - __[`RundownProtect`]__: a single-word pin/drain primitive for safe
//!   teardown of resources still in use by other threads.
//!
//! Both are value types embedded directly in their owner structures; they
//! require no teardown call and hold no heap state. Neither supports
//! cancellation or timeouts; a wait returns only when the condition it
//! waits for arrives. Callers needing timeouts must layer them externally.

mod event;
mod queued;
mod rundown;

pub(crate) use self::event::PulseEvent;
pub use self::queued::{ExclusiveGuard, QueuedLock, SharedGuard};
pub use self::rundown::RundownProtect;
