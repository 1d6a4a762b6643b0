use smelt_dtype::{ReduceOp, VarType};
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No active stream: device_set() was never called on this thread.
    #[snafu(display("device and stream must be set (call device_set() beforehand)"))]
    NoActiveStream,

    /// A trace statement referenced the null variable.
    #[snafu(display("arithmetic involving an uninitialized variable"))]
    UninitializedOperand,

    /// Operands violate the broadcast rule.
    #[snafu(display("arithmetic involving arrays of incompatible size {sizes:?}; the statement was \"{stmt}\""))]
    IncompatibleSizes { sizes: Vec<u32>, stmt: String },

    /// Variables must hold at least one element.
    #[snafu(display("variable size must be greater than zero"))]
    EmptySize,

    /// Resizing is only possible for unevaluated, unreferenced variables or
    /// materialized scalars with copy semantics.
    #[snafu(display(
        "attempted to resize variable {id}, which was already allocated (current size {current}, requested {requested})"
    ))]
    Resize { id: u32, current: u32, requested: u32 },

    /// Element access past the end of a variable.
    #[snafu(display("offset {offset} is out of bounds for variable of size {size}"))]
    OutOfBounds { offset: u32, size: u32 },

    /// Host buffer does not match the element size.
    #[snafu(display("element transfer expects {expected} bytes, got {actual}"))]
    ElementSize { expected: usize, actual: usize },

    /// The variable has no materialized storage to read from.
    #[snafu(display("variable {id} has no materialized storage"))]
    NotMaterialized { id: u32 },

    /// Invalid device index.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: i32 },

    /// The pointer is already present in the registry.
    #[snafu(display("pointer {addr:#x} is already registered"))]
    AlreadyRegistered { addr: usize },

    /// The pointer is not present in the registry.
    #[snafu(display("pointer {addr:#x} is not registered"))]
    NotRegistered { addr: usize },

    /// No registry entry for the given domain and id.
    #[snafu(display("no pointer registered under domain \"{domain}\" with id {id}"))]
    UnknownRegistryEntry { domain: String, id: u32 },

    /// The back-end does not understand a statement.
    #[snafu(display("unsupported opcode \"{opcode}\""))]
    UnsupportedOpcode { opcode: String },

    /// A kernel line failed to parse.
    #[snafu(display("malformed kernel statement \"{line}\""))]
    MalformedStatement { line: String },

    /// The reduction operator is not defined for the element type.
    #[snafu(display("reduction {op:?} is not defined for {ty:?}"))]
    InvalidReduction { ty: VarType, op: ReduceOp },

    /// A bucket value exceeds the declared bucket count.
    #[snafu(display("value {value} exceeds bucket count {bucket_count}"))]
    BucketRange { value: u32, bucket_count: u32 },

    /// Error from the allocator or stream layer.
    #[snafu(display("device error: {source}"))]
    Device { source: smelt_device::Error },
}

impl From<smelt_device::Error> for Error {
    fn from(source: smelt_device::Error) -> Self {
        Error::Device { source }
    }
}
