use std::collections::{BTreeSet, HashMap};

use tracing::{error, trace};

use crate::key::VariableKey;
use crate::var::{VarId, Variable};

/// Storage for all live trace nodes.
///
/// Besides the id → [`Variable`] map this owns the two deduplication
/// indexes: the CSE index over statement fingerprints and the
/// pointer-literal index over registered pointer values.
///
/// Reference-count mutations cascade: destroying a node releases its
/// dependencies, which may destroy further nodes. Owned storage addresses of
/// destroyed nodes are collected into a caller-provided drain list — the
/// runtime hands them to the allocator, which this crate knows nothing
/// about.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: HashMap<VarId, Variable>,
    cse: HashMap<VariableKey, VarId>,
    literals: HashMap<usize, VarId>,
    next_id: VarId,
}

impl VariableStore {
    pub fn new() -> Self {
        Self { vars: HashMap::new(), cse: HashMap::new(), literals: HashMap::new(), next_id: 1 }
    }

    /// Access a variable. Unknown ids are an unrecoverable internal error.
    pub fn var(&self, id: VarId) -> &Variable {
        match self.vars.get(&id) {
            Some(v) => v,
            None => fail(id),
        }
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        match self.vars.get_mut(&id) {
            Some(v) => v,
            None => fail(id),
        }
    }

    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(&id)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn cse_len(&self) -> usize {
        self.cse.len()
    }

    pub fn literal_len(&self) -> usize {
        self.literals.len()
    }

    /// Live ids in ascending (creation) order.
    pub fn ids(&self) -> Vec<VarId> {
        let mut ids: Vec<_> = self.vars.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Id of the pointer-literal variable registered for `addr`, if any.
    pub fn literal(&self, addr: usize) -> Option<VarId> {
        self.literals.get(&addr).copied()
    }

    /// Insert a variable, deduplicating traced statements structurally.
    ///
    /// Returns `(id, true)` for a fresh node. On a fingerprint collision the
    /// candidate is discarded — including its statement allocation — and the
    /// existing id is returned with `false`; no reference count changes.
    /// Variables without a statement (registered memory, pointer literals)
    /// always insert fresh.
    pub fn insert_or_dedupe(&mut self, v: Variable) -> (VarId, bool) {
        let key = VariableKey::of(&v);
        if let Some(key) = &key
            && let Some(&existing) = self.cse.get(key)
        {
            return (existing, false);
        }

        let id = self.next_id;
        self.next_id += 1;
        if let Some(key) = key {
            self.cse.insert(key, id);
        }
        if v.direct_pointer {
            self.literals.insert(v.data, id);
        }
        self.vars.insert(id, v);
        (id, true)
    }

    /// Overwrite a variable's size, keeping the CSE index consistent.
    ///
    /// The variable's old fingerprint entry is removed; the new one is only
    /// added when no other node already claims it.
    pub fn update_size(&mut self, id: VarId, size: u32) {
        let old_key = VariableKey::of(self.var(id));
        self.var_mut(id).size = size;
        let new_key = VariableKey::of(self.var(id));
        self.reindex(id, old_key, new_key);
    }

    /// Replace a variable's extra dependency, keeping the CSE index
    /// consistent (the extra dependency is part of the fingerprint).
    /// Returns the previous extra dependency; the caller owns the reference
    /// bookkeeping for both.
    pub fn replace_extra_dep(&mut self, id: VarId, dep: VarId) -> VarId {
        let old_key = VariableKey::of(self.var(id));
        let old = std::mem::replace(&mut self.var_mut(id).extra_dep, dep);
        let new_key = VariableKey::of(self.var(id));
        self.reindex(id, old_key, new_key);
        old
    }

    fn reindex(&mut self, id: VarId, old_key: Option<VariableKey>, new_key: Option<VariableKey>) {
        if old_key == new_key {
            return;
        }
        if let Some(key) = old_key
            && self.cse.get(&key) == Some(&id)
        {
            self.cse.remove(&key);
        }
        if let Some(key) = new_key {
            self.cse.entry(key).or_insert(id);
        }
    }

    /// Transition a node to its materialized form: record the storage
    /// address, retire the statement from the CSE index and detach the
    /// dependency slots.
    ///
    /// Returns the detached `(dep, extra_dep)` ids; the caller must release
    /// them through [`dec_ref_int`](Self::dec_ref_int) /
    /// [`dec_ref_ext`](Self::dec_ref_ext) once it is done mutating.
    pub fn materialize(&mut self, id: VarId, data: usize, owned: bool) -> ([VarId; 3], VarId) {
        if let Some(key) = VariableKey::of(self.var(id))
            && self.cse.get(&key) == Some(&id)
        {
            self.cse.remove(&key);
        }
        let v = self.var_mut(id);
        v.stmt = None;
        if data != 0 {
            v.data = data;
            v.free_variable = owned;
        }
        v.tsize = 1;
        let deps = std::mem::take(&mut v.dep);
        let extra = std::mem::take(&mut v.extra_dep);
        (deps, extra)
    }

    pub fn inc_ref_ext(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        v.ref_count_ext += 1;
        trace!(id, refs = v.ref_count_ext, "inc_ref_ext");
    }

    pub fn inc_ref_int(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        v.ref_count_int += 1;
        trace!(id, refs = v.ref_count_int, "inc_ref_int");
    }

    /// Drop one external reference. When both counts reach zero the node is
    /// destroyed; owned storage is pushed onto `dead` and the id is removed
    /// from `todo` once no external holder remains.
    ///
    /// Decrementing the null id, or any id after the store has been emptied
    /// by shutdown, is a no-op.
    pub fn dec_ref_ext(&mut self, id: VarId, dead: &mut Vec<usize>, mut todo: Option<&mut BTreeSet<VarId>>) {
        if id == 0 || self.vars.is_empty() {
            return;
        }
        let Some(v) = self.vars.get_mut(&id) else {
            return;
        };
        if v.ref_count_ext == 0 {
            error!(id, "external reference count underflow");
            panic!("dec_ref_ext({id}): no external references");
        }
        v.ref_count_ext -= 1;
        trace!(id, refs = v.ref_count_ext, "dec_ref_ext");

        if v.ref_count_ext == 0 {
            if let Some(todo) = todo.as_deref_mut() {
                todo.remove(&id);
            }
            if v.ref_count_int == 0 {
                self.destroy(id, dead, todo);
            }
        }
    }

    /// Drop one internal reference; see [`dec_ref_ext`](Self::dec_ref_ext).
    pub fn dec_ref_int(&mut self, id: VarId, dead: &mut Vec<usize>, todo: Option<&mut BTreeSet<VarId>>) {
        if id == 0 || self.vars.is_empty() {
            return;
        }
        let Some(v) = self.vars.get_mut(&id) else {
            return;
        };
        if v.ref_count_int == 0 {
            error!(id, "internal reference count underflow");
            panic!("dec_ref_int({id}): no internal references");
        }
        v.ref_count_int -= 1;
        trace!(id, refs = v.ref_count_int, "dec_ref_int");

        if v.ref_count_int == 0 && v.ref_count_ext == 0 {
            self.destroy(id, dead, todo);
        }
    }

    /// Drop every variable and both indexes, returning the storage
    /// addresses of owned data. The id counter keeps running so ids stay
    /// unique across re-initialization.
    pub fn clear(&mut self) -> Vec<usize> {
        let dead = self
            .vars
            .values()
            .filter(|v| v.free_variable && v.data != 0)
            .map(|v| v.data)
            .collect();
        self.vars.clear();
        self.cse.clear();
        self.literals.clear();
        dead
    }

    /// Clear the dirty flag of every variable. Called once an evaluation has
    /// fully synchronized the stream.
    pub fn clear_dirty(&mut self) {
        for v in self.vars.values_mut() {
            v.dirty = false;
        }
    }

    fn destroy(&mut self, id: VarId, dead: &mut Vec<usize>, mut todo: Option<&mut BTreeSet<VarId>>) {
        let v = self.vars.remove(&id).unwrap_or_else(|| fail(id));
        trace!(id, data = format_args!("{:#x}", v.data), "destroying variable");

        if let Some(key) = VariableKey::of(&v)
            && self.cse.get(&key) == Some(&id)
        {
            self.cse.remove(&key);
        }
        if v.direct_pointer && self.literals.remove(&v.data).is_none() {
            error!(id, "pointer literal missing from index");
            panic!("destroy({id}): pointer literal missing from index");
        }
        if v.free_variable && v.data != 0 {
            dead.push(v.data);
        }

        for dep in v.dep {
            self.dec_ref_int(dep, dead, todo.as_deref_mut());
        }
        self.dec_ref_ext(v.extra_dep, dead, todo);
    }
}

#[cold]
fn fail(id: VarId) -> ! {
    error!(id, "unknown variable");
    panic!("unknown variable {id}");
}
