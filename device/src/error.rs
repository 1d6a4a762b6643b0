use smelt_dtype::AllocType;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Native allocation failed even after draining the free lists.
    #[snafu(display("out of memory: failed to allocate {size} bytes of {flavor:?} memory"))]
    OutOfMemory { flavor: AllocType, size: usize },

    /// Allocations must cover at least one byte.
    #[snafu(display("allocation size must be nonzero"))]
    EmptyAllocation,

    /// The pointer was not handed out by this allocator.
    #[snafu(display("unknown pointer {addr:#x}"))]
    UnknownPointer { addr: usize },

    /// Prefetching is only defined for managed memory.
    #[snafu(display("cannot prefetch {flavor:?} memory (only managed flavors migrate on demand)"))]
    PrefetchFlavor { flavor: AllocType },

    /// A wait on a stream event ran out of time.
    #[snafu(display("timed out after {timeout_ms}ms waiting for event value {target} (current {current})"))]
    EventTimeout { target: u64, current: u64, timeout_ms: u64 },
}
