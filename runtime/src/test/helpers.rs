//! Shared scaffolding for tests that drive the global runtime.

use parking_lot::Mutex;
use smelt_dtype::VarType;

use crate::api;
use crate::state::STATE;

/// The runtime is process-wide; tests touching it run one at a time.
static GUARD: Mutex<()> = Mutex::new(());

/// Hold off every other runtime test. For tests that need to assert on the
/// state around their own init/shutdown sequence.
pub fn lock_runtime() -> parking_lot::MutexGuard<'static, ()> {
    GUARD.lock()
}

/// Initialize a fresh host-only runtime, run `f`, and shut down again.
/// Tests must release every external reference they take, or the shutdown
/// leak report fires.
pub fn with_runtime<R>(f: impl FnOnce() -> R) -> R {
    let _guard = lock_runtime();
    api::init(true, false);
    api::device_set(-1, 0).unwrap();
    let result = f();
    api::shutdown(true);
    result
}

pub fn live_variables() -> usize {
    STATE.lock().store.len()
}

pub fn cse_entries() -> usize {
    STATE.lock().store.cse_len()
}

pub fn kernel_cache_hits() -> u64 {
    STATE.lock().kernels.hits()
}

pub fn allocator_hits() -> u64 {
    STATE.lock().alloc.stats().hits
}

pub fn copy_i32(values: &[i32]) -> u32 {
    unsafe { api::var_copy(VarType::Int32, values.as_ptr() as *const u8, values.len() as u32) }.unwrap()
}

pub fn copy_u32(values: &[u32]) -> u32 {
    unsafe { api::var_copy(VarType::UInt32, values.as_ptr() as *const u8, values.len() as u32) }.unwrap()
}

pub fn copy_f32(values: &[f32]) -> u32 {
    unsafe { api::var_copy(VarType::Float32, values.as_ptr() as *const u8, values.len() as u32) }.unwrap()
}

pub fn read_i32(id: u32, offset: u32) -> i32 {
    let mut bytes = [0u8; 4];
    api::var_read(id, offset, &mut bytes).unwrap();
    i32::from_ne_bytes(bytes)
}

pub fn read_f32(id: u32, offset: u32) -> f32 {
    let mut bytes = [0u8; 4];
    api::var_read(id, offset, &mut bytes).unwrap();
    f32::from_ne_bytes(bytes)
}
