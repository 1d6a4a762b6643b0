//! Memory and stream plumbing for the tracing JIT.
//!
//! This crate owns the two resources every kernel launch touches:
//! - the process-wide [`Allocator`] with its five memory flavors, power-of-two
//!   free lists and per-stream release chains, and
//! - per-(device, stream) [`Stream`] handles with monotone [`EventSignal`]s
//!   used to order completion against deferred memory reuse.

pub mod allocator;
pub mod error;
pub mod stream;
pub mod sync;

pub use allocator::{AllocStats, Allocator};
pub use error::{Error, Result};
pub use stream::{Stream, StreamKey};
pub use sync::EventSignal;

#[cfg(test)]
mod test;
