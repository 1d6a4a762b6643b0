//! The flat API surface.
//!
//! Free functions mirroring the C-callable interface of the original
//! library: thin wrappers that lock the global [`State`](crate::state::State)
//! for the duration of the call. Blocking synchronization (`sync_stream`,
//! `sync_device`, the element-wise `var_read`/`var_write` slow paths) waits
//! on the stream's event *outside* the lock, so other threads keep making
//! progress; any variable data is re-fetched after the lock is re-acquired.

use std::borrow::Cow;

use smelt_dtype::{AllocType, VarType};

use crate::error::Result;
use crate::log::{self, LogLevel};
use crate::state::{DeviceInfo, STATE};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialize the runtime; `llvm`/`cuda` select the back-ends to bring up.
/// Idempotent until the next [`shutdown`].
pub fn init(llvm: bool, cuda: bool) {
    log::install();
    STATE.lock().init(llvm, cuda);
}

/// Run [`init`] on a detached thread and return immediately. Safe to call
/// other API functions concurrently; they serialize on the global lock.
pub fn init_async(llvm: bool, cuda: bool) {
    std::thread::spawn(move || init(llvm, cuda));
}

pub fn has_llvm() -> bool {
    STATE.lock().has_llvm
}

pub fn has_cuda() -> bool {
    STATE.lock().has_cuda
}

/// Release runtime resources and report leaks. With `light` the back-end
/// configuration survives for a cheap re-`init`.
pub fn shutdown(light: bool) {
    STATE.lock().shutdown(light);
}

/// Number of usable GPU devices (the host back-end is not counted).
pub fn device_count() -> i32 {
    STATE.lock().device_count()
}

/// Select the active device (`-1` = host) and stream for this thread.
pub fn device_set(device: i32, stream: u32) -> Result<()> {
    STATE.lock().device_set(device, stream)
}

/// Record a GPU reported by an external driver loader. Returns its device
/// index, or `None` when required capabilities are missing.
pub fn register_device(device: DeviceInfo) -> Option<i32> {
    STATE.lock().register_device(device)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Override the LLVM back-end's target CPU, feature set and vector width.
pub fn llvm_set_target(cpu: &str, features: &str, vector_width: u32) {
    let mut state = STATE.lock();
    state.llvm_target.cpu = cpu.to_string();
    state.llvm_target.features = features.to_string();
    state.llvm_target.vector_width = vector_width;
}

/// Whether the configured vector width is at least `vector_width` and the
/// configured feature string contains `feature`.
pub fn llvm_if_at_least(vector_width: u32, feature: &str) -> bool {
    let state = STATE.lock();
    state.llvm_target.vector_width >= vector_width && state.llvm_target.features.contains(feature)
}

/// Dispatch independent kernels of one evaluation to parallel workers?
pub fn parallel_set_dispatch(enable: bool) {
    STATE.lock().parallel_dispatch = enable;
}

pub fn parallel_dispatch() -> bool {
    STATE.lock().parallel_dispatch
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// Wait for everything queued on the active stream to complete.
pub fn sync_stream() -> Result<()> {
    let (signal, fence) = STATE.lock().stream_event()?;
    signal.wait(fence);
    Ok(())
}

/// Wait for every stream of the active device to complete.
pub fn sync_device() -> Result<()> {
    let events = STATE.lock().device_events()?;
    for (signal, fence) in events {
        signal.wait(fence);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

pub fn log_set_stderr(level: LogLevel) {
    log::set_stderr_level(level);
}

pub fn log_stderr() -> LogLevel {
    log::stderr_level()
}

pub fn set_log_callback(level: LogLevel, callback: Option<Box<dyn Fn(LogLevel, &str) + Send + Sync>>) {
    log::set_callback(level, callback);
}

pub fn log_callback() -> LogLevel {
    log::callback_level()
}

// ---------------------------------------------------------------------------
// Memory allocation
// ---------------------------------------------------------------------------

/// Allocate memory of the given flavor through the pooling allocator.
pub fn malloc(flavor: AllocType, size: usize) -> Result<*mut u8> {
    Ok(STATE.lock().malloc(flavor, size)? as *mut u8)
}

/// Release a pointer. GPU-accessible flavors are parked on the active
/// stream's release chain and recycled once the stream's event fires.
pub fn free(ptr: *mut u8) -> Result<()> {
    STATE.lock().free_ptr(ptr as usize)
}

/// Change the flavor of an allocation, returning the new pointer.
pub fn malloc_migrate(ptr: *mut u8, flavor: AllocType) -> Result<*mut u8> {
    Ok(STATE.lock().migrate_ptr(ptr as usize, flavor)? as *mut u8)
}

/// Return all cached memory to the OS.
pub fn malloc_trim() {
    STATE.lock().alloc.trim();
}

/// Prefetch a managed allocation onto `device` (`-1` = host, `-2` = all
/// GPUs).
pub fn malloc_prefetch(ptr: *mut u8, device: i32) -> Result<()> {
    Ok(STATE.lock().alloc.prefetch(ptr as usize, device)?)
}

// ---------------------------------------------------------------------------
// Pointer registry
// ---------------------------------------------------------------------------

/// Register `ptr` under `domain` and return its dense id (>= 1; the null
/// pointer maps to 0). `domain` must be a program-lifetime string — it is
/// compared by address.
pub fn registry_put(domain: &'static str, ptr: *const u8) -> Result<u32> {
    STATE.lock().registry.put(domain, ptr as usize)
}

pub fn registry_remove(ptr: *const u8) -> Result<()> {
    STATE.lock().registry.remove(ptr as usize)
}

pub fn registry_get_id(ptr: *const u8) -> Result<u32> {
    STATE.lock().registry.get_id(ptr as usize)
}

pub fn registry_get_domain(ptr: *const u8) -> Result<&'static str> {
    STATE.lock().registry.get_domain(ptr as usize)
}

pub fn registry_get_ptr(domain: &'static str, id: u32) -> Result<*const u8> {
    Ok(STATE.lock().registry.get_ptr(domain, id)? as *const u8)
}

pub fn registry_get_max(domain: &'static str) -> u32 {
    STATE.lock().registry.get_max(domain)
}

pub fn registry_trim() {
    STATE.lock().registry.trim();
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Register an existing memory region as a variable; with `take_ownership`
/// the region is freed when the variable dies.
pub fn var_map(ty: VarType, ptr: *mut u8, size: u32, take_ownership: bool) -> Result<u32> {
    STATE.lock().var_map(ty, ptr as usize, size, take_ownership)
}

/// Copy `size` elements from host memory onto the active device and
/// register the result.
///
/// # Safety
///
/// `ptr` must point at `size` elements of type `ty`.
pub unsafe fn var_copy(ty: VarType, ptr: *const u8, size: u32) -> Result<u32> {
    unsafe { STATE.lock().var_copy(ty, ptr as usize, size) }
}

/// Register a pointer literal variable, deduplicated by value.
pub fn var_copy_ptr(ptr: *const u8) -> Result<u32> {
    STATE.lock().var_copy_ptr(ptr as usize)
}

/// Append a statement without operands to the trace.
pub fn trace_append_0(ty: VarType, stmt: impl Into<Cow<'static, str>>, size: u32) -> Result<u32> {
    STATE.lock().trace_append_0(ty, stmt.into(), size)
}

/// Append a one-operand statement to the trace.
pub fn trace_append_1(ty: VarType, stmt: impl Into<Cow<'static, str>>, op1: u32) -> Result<u32> {
    STATE.lock().trace_append(ty, stmt.into(), &[op1])
}

/// Append a two-operand statement to the trace.
pub fn trace_append_2(ty: VarType, stmt: impl Into<Cow<'static, str>>, op1: u32, op2: u32) -> Result<u32> {
    STATE.lock().trace_append(ty, stmt.into(), &[op1, op2])
}

/// Append a three-operand statement to the trace.
pub fn trace_append_3(ty: VarType, stmt: impl Into<Cow<'static, str>>, op1: u32, op2: u32, op3: u32) -> Result<u32> {
    STATE.lock().trace_append(ty, stmt.into(), &[op1, op2, op3])
}

pub fn var_inc_ref_ext(id: u32) {
    STATE.lock().store.inc_ref_ext(id);
}

pub fn var_dec_ref_ext(id: u32) {
    STATE.lock().var_dec_ref_ext(id);
}

/// Address of the variable's materialized storage, or null.
pub fn var_ptr(id: u32) -> *mut u8 {
    STATE.lock().var_ptr(id) as *mut u8
}

pub fn var_size(id: u32) -> u32 {
    STATE.lock().var_size(id)
}

/// Resize a variable; see the trace recorder for the precise rules.
pub fn var_set_size(id: u32, size: u32, copy: bool) -> Result<u32> {
    STATE.lock().var_set_size(id, size, copy)
}

pub fn var_set_label(id: u32, label: &str) {
    STATE.lock().var_set_label(id, label);
}

pub fn var_label(id: u32) -> Option<String> {
    STATE.lock().var_label(id)
}

/// Migrate a variable's storage to another memory flavor.
pub fn var_migrate(id: u32, flavor: AllocType) -> Result<u32> {
    STATE.lock().var_migrate(id, flavor)
}

pub fn var_mark_side_effect(id: u32) {
    STATE.lock().var_mark_side_effect(id);
}

pub fn var_mark_dirty(id: u32) {
    STATE.lock().var_mark_dirty(id);
}

/// Attach an extra lifetime dependency to a variable.
pub fn var_set_extra_dep(id: u32, dep: u32) {
    STATE.lock().var_set_extra_dep(id, dep);
}

/// Select the operand picked up as the extra dependency of the next
/// write-form statement (scatter / atomic add).
pub fn set_scatter_gather_operand(id: u32) {
    STATE.lock().set_scatter_gather_operand(id);
}

pub fn var_is_all_false(id: u32) -> bool {
    STATE.lock().var_is_all_false(id)
}

pub fn var_is_all_true(id: u32) -> bool {
    STATE.lock().var_is_all_true(id)
}

/// Human-readable summary of all registered variables.
pub fn var_whos() -> String {
    STATE.lock().whos()
}

/// Human-readable contents of a variable (forces evaluation).
pub fn var_str(id: u32) -> Result<String> {
    let (signal, fence) = {
        let mut state = STATE.lock();
        state.ensure_evaluated(id)?;
        state.stream_event()?
    };
    signal.wait(fence);
    STATE.lock().var_str(id)
}

/// Read one element into `dst` (`dst.len()` must equal the element size).
/// A documented slow path: fully synchronizes the stream.
pub fn var_read(id: u32, offset: u32, dst: &mut [u8]) -> Result<()> {
    let (signal, fence) = {
        let mut state = STATE.lock();
        state.ensure_evaluated(id)?;
        state.stream_event()?
    };
    signal.wait(fence);
    STATE.lock().element_read(id, offset, dst)
}

/// Write one element from `src`. A documented slow path: fully
/// synchronizes the stream.
pub fn var_write(id: u32, offset: u32, src: &[u8]) -> Result<()> {
    let (signal, fence) = {
        let mut state = STATE.lock();
        state.ensure_evaluated(id)?;
        state.stream_event()?
    };
    signal.wait(fence);
    STATE.lock().element_write(id, offset, src)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate all computation queued on the active stream.
pub fn eval() -> Result<()> {
    STATE.lock().eval()
}

/// Evaluate only if `id` requires it (unevaluated or dirty).
pub fn var_eval(id: u32) -> Result<()> {
    STATE.lock().var_eval(id)
}
