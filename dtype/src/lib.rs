//! Element types and allocation flavors shared across the smelt crates.

/// Element types supported by the trace recorder and the back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum VarType {
    Int8 = 0,
    UInt8 = 1,
    Int16 = 2,
    UInt16 = 3,
    Int32 = 4,
    UInt32 = 5,
    Int64 = 6,
    UInt64 = 7,
    Float16 = 8,
    Float32 = 9,
    Float64 = 10,
    Bool = 11,
    Pointer = 12,
}

impl VarType {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 | Self::Bool => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::Pointer => 8,
        }
    }

    /// Short type suffix substituted for `$tN` placeholders.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Int8 => "i8",
            Self::UInt8 => "u8",
            Self::Int16 => "i16",
            Self::UInt16 => "u16",
            Self::Int32 => "i32",
            Self::UInt32 => "u32",
            Self::Int64 => "i64",
            Self::UInt64 => "u64",
            Self::Float16 => "f16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::Bool => "msk",
            Self::Pointer => "ptr",
        }
    }

    /// Generic bit-pattern suffix substituted for `$bN` placeholders.
    pub const fn bit_name(&self) -> &'static str {
        match self.size() {
            1 => "b8",
            2 => "b16",
            4 => "b32",
            _ => "b64",
        }
    }

    /// Inverse of [`VarType::name`], used when parsing kernel text.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "i8" => Self::Int8,
            "u8" => Self::UInt8,
            "i16" => Self::Int16,
            "u16" => Self::UInt16,
            "i32" => Self::Int32,
            "u32" => Self::UInt32,
            "i64" => Self::Int64,
            "u64" => Self::UInt64,
            "f16" => Self::Float16,
            "f32" => Self::Float32,
            "f64" => Self::Float64,
            "msk" => Self::Bool,
            "ptr" => Self::Pointer,
            _ => return None,
        })
    }

    pub const fn is_integral(&self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::UInt8
                | Self::Int16
                | Self::UInt16
                | Self::Int32
                | Self::UInt32
                | Self::Int64
                | Self::UInt64
        )
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::Float32 | Self::Float64)
    }

    pub const fn is_arithmetic(&self) -> bool {
        self.is_integral() || self.is_float()
    }

    pub const fn is_mask(&self) -> bool {
        matches!(self, Self::Bool)
    }
}

/// Memory flavors understood by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AllocType {
    /// Plain host memory.
    Host = 0,
    /// Page-locked host memory, usable as a staging area for async copies.
    HostPinned = 1,
    /// Memory local to one device.
    Device = 2,
    /// Memory mapped into the address space of the host and all devices.
    Managed = 3,
    /// Like `Managed`, tuned for read-mostly access patterns.
    ManagedReadMostly = 4,
}

impl AllocType {
    pub const COUNT: usize = 5;

    pub const ALL: [AllocType; Self::COUNT] =
        [Self::Host, Self::HostPinned, Self::Device, Self::Managed, Self::ManagedReadMostly];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::HostPinned => "host-pinned",
            Self::Device => "device",
            Self::Managed => "managed",
            Self::ManagedReadMostly => "managed-read-mostly",
        }
    }

    /// Flavors that a running kernel may still be using when they are freed.
    /// Releases of such memory are deferred until the stream's event fires.
    pub const fn deferred_release(&self) -> bool {
        !matches!(self, Self::Host)
    }
}

/// Reduction operators accepted by the tuned reduction primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
}
