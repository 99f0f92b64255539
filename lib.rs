//! # Process Diagnostics Runtime Core
//!
//! The concurrency and object-lifetime primitives that the rest of the
//! diagnostics tool is built on. Every refcounted entity in the host
//! application (strings, lists, provider items) is an "object" allocated
//! through this crate, and every cross-boundary reference to one travels as
//! an opaque handle minted by this crate.
//!
//! ## Design goals
//!
//! __Single-word state machines__
//! Each lock and lifetime primitive keeps its entire state in one machine
//! word, driven by compare-and-swap loops; no OS synchronization object is
//! touched on an uncontended path.
//!
//! __Explicit teardown__
//! Nothing is garbage collected. Objects die when their last reference is
//! released, rundown-protected resources die when their last pin is dropped,
//! and both moments are observable and testable.
//!
//! __Blocking, not async__
//! Contended waits block the calling OS thread on a stack-allocated wait
//! block. None of the primitives are coroutine- or executor-aware.
//!
//! ## Components
//!
//! __Synchronization__ (the [`sync`] module):
//!
//! - __[`QueuedLock`]__: an exclusive/shared lock whose ownership, waiter
//!   presence, and wait queue all fit in one word. Contention is handled by
//!   an intrusive list of stack-allocated wait blocks.
//! - __[`RundownProtect`]__: a pin/drain primitive. Many threads cheaply pin
//!   a resource in use; one thread later waits for all pins to clear before
//!   tearing the resource down.
//!
//! __Object manager__ (the [`object`] module):
//!
//! Manual, type-aware reference counting in lieu of a garbage collector.
//! An object is a header and body in one contiguous allocation; the body
//! pointer is the object's identity. Per-type delete procedures run exactly
//! once, strictly after the reference count irrevocably reaches zero, either
//! inline or on a deferred reaper thread.
//!
//! __Handle table__ (the [`handle`] module):
//!
//! A sparse, three-level, lock-striped table mapping small integer handles
//! to object pointers plus an access mask, for use where object references
//! must cross a trust boundary as opaque values.
//!
//! [`QueuedLock`]: sync::QueuedLock
//! [`RundownProtect`]: sync::RundownProtect

pub mod handle;
pub mod object;
pub mod sync;
