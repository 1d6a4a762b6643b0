//! Process-wide runtime state.
//!
//! Every subsystem — variable store, allocator, streams, registry, kernel
//! cache — lives in one [`State`] value behind a global mutex. API wrappers
//! lock it for the duration of a call; blocking waits clone the stream's
//! event out and wait outside the lock. The *active* stream is thread-local
//! and re-read on each API entry, so threads drive distinct streams in
//! parallel.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use smelt_device::{Allocator, EventSignal, Stream, StreamKey};
use smelt_dtype::AllocType;
use smelt_ir::{VarId, VariableStore};
use snafu::ensure;
use tracing::{debug, error, info, trace, warn};

use crate::error::{InvalidDeviceSnafu, NoActiveStreamSnafu, Result};
use crate::kernel::KernelCache;
use crate::registry::Registry;

pub(crate) static STATE: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::new()));

thread_local! {
    static ACTIVE_STREAM: Cell<Option<StreamKey>> = const { Cell::new(None) };
}

/// Properties of one GPU as reported by the driver loader.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub compute_capability: u32,
    pub unified_addressing: bool,
    pub managed_memory: bool,
}

/// Code-generation parameters of the LLVM back-end.
#[derive(Debug, Clone)]
pub struct LlvmTarget {
    pub cpu: String,
    pub features: String,
    pub vector_width: u32,
}

impl Default for LlvmTarget {
    fn default() -> Self {
        Self { cpu: "native".to_string(), features: String::new(), vector_width: 8 }
    }
}

pub struct State {
    pub store: VariableStore,
    pub alloc: Allocator,
    pub streams: HashMap<StreamKey, Stream>,
    pub registry: Registry,
    pub kernels: KernelCache,
    pub devices: Vec<DeviceInfo>,
    pub has_llvm: bool,
    pub has_cuda: bool,
    pub parallel_dispatch: bool,
    /// Source/target operand picked up by the next write-form statement.
    pub scatter_gather_operand: VarId,
    pub llvm_target: LlvmTarget,
    /// Per-user directory for compiled kernel artifacts.
    pub cache_dir: Option<PathBuf>,
}

impl State {
    fn new() -> Self {
        Self {
            store: VariableStore::new(),
            alloc: Allocator::new(),
            streams: HashMap::new(),
            registry: Registry::new(),
            kernels: KernelCache::new(),
            devices: Vec::new(),
            has_llvm: false,
            has_cuda: false,
            parallel_dispatch: true,
            scatter_gather_operand: 0,
            llvm_target: LlvmTarget::default(),
            cache_dir: None,
        }
    }

    /// Initialize the runtime. Does nothing when initialization already
    /// happened or neither back-end is requested.
    pub fn init(&mut self, llvm: bool, cuda: bool) {
        if self.has_llvm || self.has_cuda || (!llvm && !cuda) {
            return;
        }

        let base = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
        let dir = base.join(".smelt");
        if let Err(err) = std::fs::create_dir_all(&dir) {
            error!(path = %dir.display(), %err, "could not create kernel cache directory");
            panic!("init(): creation of directory {:?} failed: {err}", dir);
        }
        self.cache_dir = Some(dir);

        info!("init(): detecting devices");
        self.has_llvm = llvm;
        self.has_cuda = cuda && !self.devices.is_empty();
        if cuda && self.devices.is_empty() {
            warn!("no GPU devices registered; continuing with the host back-end only");
        }
        for (index, device) in self.devices.iter().enumerate() {
            info!(
                index,
                name = %device.name,
                compute_capability = device.compute_capability,
                "found device"
            );
        }
    }

    /// Record a device reported by an external driver loader. Devices
    /// lacking required capabilities are skipped with a warning; the rest of
    /// the system proceeds without them.
    pub fn register_device(&mut self, device: DeviceInfo) -> Option<i32> {
        if !device.unified_addressing {
            warn!(name = %device.name, "device does not support unified addressing, skipping");
            return None;
        }
        if !device.managed_memory {
            warn!(name = %device.name, "device does not support managed memory, skipping");
            return None;
        }
        self.devices.push(device);
        Some(self.devices.len() as i32 - 1)
    }

    pub fn device_count(&self) -> i32 {
        self.devices.len() as i32
    }

    /// Select the active device and stream for the calling thread, lazily
    /// creating the stream.
    pub fn device_set(&mut self, device: i32, index: u32) -> Result<()> {
        let valid = device == -1 || (device >= 0 && (device as usize) < self.devices.len());
        ensure!(valid, InvalidDeviceSnafu { device });

        let key = StreamKey::new(device, index);
        if self.streams.contains_key(&key) {
            trace!(device, stream = index, "selecting stream");
        } else {
            trace!(device, stream = index, "creating stream");
            self.streams.insert(key, Stream::new(key));
        }
        ACTIVE_STREAM.set(Some(key));
        Ok(())
    }

    /// Key of the calling thread's active stream.
    pub fn active_key(&self) -> Result<StreamKey> {
        ACTIVE_STREAM
            .get()
            .filter(|key| self.streams.contains_key(key))
            .ok_or_else(|| NoActiveStreamSnafu.build())
    }

    pub fn active_stream(&self) -> Result<&Stream> {
        Ok(&self.streams[&self.active_key()?])
    }

    /// Event and fence of the active stream, for waiting outside the lock.
    pub fn stream_event(&self) -> Result<(Arc<EventSignal>, u64)> {
        let stream = self.active_stream()?;
        Ok((Arc::clone(&stream.signal), stream.fence))
    }

    /// Events of every stream on the active device.
    pub fn device_events(&self) -> Result<Vec<(Arc<EventSignal>, u64)>> {
        let device = self.active_key()?.device;
        Ok(self
            .streams
            .values()
            .filter(|s| s.key.device == device)
            .map(|s| (Arc::clone(&s.signal), s.fence))
            .collect())
    }

    /// `(stream key, current fence)` of the active stream, if any. Used to
    /// route frees onto the stream's release chain.
    pub fn release_target(&self) -> Option<(StreamKey, u64)> {
        let key = self.active_key().ok()?;
        Some((key, self.streams[&key].fence))
    }

    /// Allocate through the pooling allocator on behalf of the active
    /// stream, draining its release chain first.
    pub fn malloc(&mut self, flavor: AllocType, size: usize) -> Result<usize> {
        let device = match self.active_key() {
            Ok(key) => {
                self.alloc.drain_releases(key, self.streams[&key].signal.value());
                key.device
            }
            Err(_) => -1,
        };
        Ok(self.alloc.alloc(flavor, device, size)?)
    }

    /// Free through the active stream's release chain.
    pub fn free_ptr(&mut self, addr: usize) -> Result<()> {
        let target = self.release_target();
        Ok(self.alloc.free(addr, target)?)
    }

    pub fn migrate_ptr(&mut self, addr: usize, flavor: AllocType) -> Result<usize> {
        let device = self.active_key().map(|key| key.device).unwrap_or(-1);
        let target = self.release_target();
        Ok(self.alloc.migrate(addr, flavor, device, target)?)
    }

    /// Release owned storage collected from destroyed variables.
    pub fn release_dead(&mut self, dead: Vec<usize>) {
        if dead.is_empty() {
            return;
        }
        let target = self.release_target();
        for addr in dead {
            if let Err(err) = self.alloc.free(addr, target) {
                warn!(%err, "released variable owned untracked storage");
            }
        }
    }

    /// Drop one external reference from the API, routing owned storage to
    /// the allocator and keeping the active schedule consistent.
    pub fn var_dec_ref_ext(&mut self, id: VarId) {
        let mut dead = Vec::new();
        let todo = ACTIVE_STREAM.get().and_then(|key| self.streams.get_mut(&key)).map(|s| &mut s.todo);
        self.store.dec_ref_ext(id, &mut dead, todo);
        self.release_dead(dead);
    }

    /// Release all resources; with `light == false` the back-end
    /// configuration is reset as well. Reports reference leaks.
    pub fn shutdown(&mut self, light: bool) {
        if !self.streams.is_empty() {
            info!(count = self.streams.len(), "shutdown(): releasing streams");
            let keys: Vec<StreamKey> = self.streams.keys().copied().collect();
            for key in keys {
                let reached = self.streams[&key].signal.value();
                self.alloc.drain_releases(key, reached);
            }
            self.streams.clear();
        }
        ACTIVE_STREAM.set(None);

        self.kernels.clear();

        let leaked = self.store.ids();
        if !leaked.is_empty() {
            warn!("shutdown(): detected variable leaks:");
            for (count, &id) in leaked.iter().enumerate() {
                if count < 10 {
                    let v = self.store.var(id);
                    warn!(
                        id,
                        ext = v.ref_count_ext,
                        int = v.ref_count_int,
                        "variable is still being referenced"
                    );
                } else {
                    warn!("(skipping remainder)");
                    break;
                }
            }
            warn!(count = leaked.len(), "shutdown(): variables are still referenced");
        }

        if self.store.is_empty() && self.store.cse_len() != 0 {
            error!(entries = self.store.cse_len(), "common subexpression cache leak");
            panic!("shutdown(): detected a common subexpression elimination cache leak");
        }
        if self.store.is_empty() && self.store.literal_len() != 0 {
            error!(entries = self.store.literal_len(), "pointer literal leak");
            panic!("shutdown(): detected a pointer-literal leak");
        }

        let dead = self.store.clear();
        for addr in dead {
            let _ = self.alloc.free(addr, None);
        }

        self.registry.shutdown();
        self.alloc.shutdown();
        self.devices.clear();
        self.has_cuda = false;
        self.has_llvm = false;
        self.scatter_gather_operand = 0;
        if !light {
            self.llvm_target = LlvmTarget::default();
        }
        self.cache_dir = None;
        debug!("shutdown(): done");
    }
}

/// Format a byte count the way the `whos()` report prints memory.
pub(crate) fn mem_string(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{bytes} B") } else { format!("{value:.3} {}", UNITS[unit]) }
}
