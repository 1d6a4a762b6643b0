//! Tracing JIT runtime.
//!
//! Records arithmetic and memory statements over typed arrays, fuses queued
//! computation into per-size kernels, and dispatches them over per-device
//! streams. Variables are reference counted twice over (external holders
//! vs. dependent statements), structurally identical statements are
//! deduplicated, and freed device memory is recycled asynchronously through
//! per-stream release chains.
//!
//! The [`api`] module exposes the flat call surface; everything else backs
//! it.
//!
//! ```no_run
//! use smelt_runtime as jit;
//! use smelt_runtime::VarType;
//!
//! jit::init(true, false);
//! jit::device_set(-1, 0).unwrap();
//!
//! let values = [1i32, 2, 3];
//! let a = unsafe { jit::var_copy(VarType::Int32, values.as_ptr() as *const u8, 3) }.unwrap();
//! let b = jit::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", a, a).unwrap();
//! jit::eval().unwrap();
//!
//! let mut out = [0u8; 4];
//! jit::var_read(b, 0, &mut out).unwrap();
//! assert_eq!(i32::from_ne_bytes(out), 2);
//!
//! jit::var_dec_ref_ext(a);
//! jit::var_dec_ref_ext(b);
//! jit::shutdown(true);
//! ```

pub mod api;
pub mod error;
pub mod eval;
pub mod kernel;
pub mod log;
pub mod primitives;
pub mod registry;
pub mod state;
pub mod trace;

pub use api::*;
pub use error::{Error, Result};
pub use log::LogLevel;
pub use primitives::{all, any, fill, make_permutation, memcpy, memcpy_async, reduce, scan};
pub use state::{DeviceInfo, LlvmTarget};

// Re-export the types the API surface speaks in.
pub use smelt_dtype::{AllocType, ReduceOp, VarType};

#[cfg(test)]
mod test;
