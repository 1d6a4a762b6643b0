use std::borrow::Cow;

use smelt_dtype::VarType;

use crate::var::{VarId, Variable};

/// Structural fingerprint of a traced statement.
///
/// Two trace nodes collide only when their statement bytes and operand ids
/// are identical; broadcast-size-1 operands do not change the key because
/// operands enter by id, not by size. The statement text is deliberately not
/// canonicalized — back-ends may depend on the exact bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableKey {
    ty: VarType,
    size: u32,
    stmt: Cow<'static, str>,
    dep: [VarId; 3],
    extra_dep: VarId,
}

impl VariableKey {
    /// Fingerprint of a variable, or `None` for registered memory regions
    /// and pointer literals, which are never deduplicated structurally.
    pub fn of(v: &Variable) -> Option<Self> {
        v.stmt.as_ref().map(|stmt| Self {
            ty: v.ty,
            size: v.size,
            stmt: stmt.clone(),
            dep: v.dep,
            extra_dep: v.extra_dep,
        })
    }
}
