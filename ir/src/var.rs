use std::borrow::Cow;

use smelt_dtype::VarType;

/// Variable identifier. Ids are handed out from a monotonically increasing
/// counter; `0` is reserved as the null id.
pub type VarId = u32;

/// One node of the trace graph.
///
/// A node is either *unevaluated* — `stmt` holds an IR fragment with
/// `$r`/`$t`/`$b` placeholders and `data == 0` — or *materialized*, in which
/// case `data` points at storage of `size` elements and the statement has
/// been dropped.
#[derive(Debug, Clone)]
pub struct Variable {
    pub ty: VarType,
    /// Element count (not bytes). A size-1 variable broadcasts.
    pub size: u32,
    /// IR statement template. `Cow::Borrowed` statements live in static
    /// storage and cost nothing to discard on a deduplication hit.
    pub stmt: Option<Cow<'static, str>>,
    /// Operand ids; slot `i` backs the `$r{i+1}` placeholder.
    pub dep: [VarId; 3],
    /// Additional variable that must outlive this one (scatter/gather
    /// targets). Holds an *external* reference on the target.
    pub extra_dep: VarId,
    /// Address of materialized storage, or 0.
    pub data: usize,
    /// Whether the node owns `data` and must release it on destruction.
    pub free_variable: bool,
    /// The node is a registered pointer literal: `data` is the pointer
    /// *value*, not a buffer.
    pub direct_pointer: bool,
    /// Evaluation of this node is observable (scatter/atomic write); it is
    /// kept schedulable even with no external holders.
    pub side_effect: bool,
    /// The backing memory was scatter-modified since the last evaluation;
    /// consumers must force an evaluation before reading it.
    pub dirty: bool,
    /// References held by client code.
    pub ref_count_ext: u32,
    /// References held by other variables through `dep`.
    pub ref_count_int: u32,
    /// Cumulative subtree size: a cheap upper bound on the number of trace
    /// nodes below this one.
    pub tsize: u32,
    pub label: Option<String>,
}

impl Variable {
    pub fn new(ty: VarType, size: u32) -> Self {
        Self {
            ty,
            size,
            stmt: None,
            dep: [0; 3],
            extra_dep: 0,
            data: 0,
            free_variable: false,
            direct_pointer: false,
            side_effect: false,
            dirty: false,
            ref_count_ext: 0,
            ref_count_int: 0,
            tsize: 1,
            label: None,
        }
    }

    pub fn evaluated(&self) -> bool {
        self.data != 0
    }

    /// Size of the materialized storage in bytes.
    pub fn mem_size(&self) -> usize {
        self.size as usize * self.ty.size()
    }
}
