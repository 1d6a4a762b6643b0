use std::borrow::Cow;
use std::collections::BTreeSet;

use smelt_dtype::VarType;

use crate::store::VariableStore;
use crate::var::{VarId, Variable};

fn traced(ty: VarType, stmt: &'static str, deps: &[VarId], store: &mut VariableStore) -> VarId {
    let mut v = Variable::new(ty, 1);
    v.stmt = Some(Cow::Borrowed(stmt));
    for (slot, &dep) in deps.iter().enumerate() {
        v.dep[slot] = dep;
    }
    let (id, fresh) = store.insert_or_dedupe(v);
    if fresh {
        for &dep in deps {
            store.inc_ref_int(dep);
        }
    }
    store.inc_ref_ext(id);
    id
}

#[test]
fn ids_start_at_one_and_are_monotone() {
    let mut store = VariableStore::new();
    let a = traced(VarType::Int32, "mov.$t0 $r0, 1", &[], &mut store);
    let b = traced(VarType::Int32, "mov.$t0 $r0, 2", &[], &mut store);
    assert_eq!(a, 1);
    assert_eq!(b, 2);
}

#[test]
fn identical_statements_deduplicate() {
    let mut store = VariableStore::new();
    let a = traced(VarType::Int32, "mov.$t0 $r0, 1", &[], &mut store);
    let b = traced(VarType::Int32, "mov.$t0 $r0, 1", &[], &mut store);
    let c = traced(VarType::Int32, "mov.$t0 $r0, 2", &[], &mut store);

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(store.var(a).ref_count_ext, 2);
    assert_eq!(store.len(), 2);
    assert_eq!(store.cse_len(), 2);
}

#[test]
fn dedup_keys_on_operand_ids() {
    let mut store = VariableStore::new();
    let a = traced(VarType::Int32, "mov.$t0 $r0, 1", &[], &mut store);
    let b = traced(VarType::Int32, "mov.$t0 $r0, 2", &[], &mut store);

    let s1 = traced(VarType::Int32, "add.$t0 $r0, $r1, $r2", &[a, b], &mut store);
    let s2 = traced(VarType::Int32, "add.$t0 $r0, $r1, $r2", &[a, b], &mut store);
    let s3 = traced(VarType::Int32, "add.$t0 $r0, $r1, $r2", &[b, a], &mut store);

    assert_eq!(s1, s2);
    assert_ne!(s1, s3, "operand order is part of the fingerprint");
    // The collision did not double-count operand references.
    assert_eq!(store.var(a).ref_count_int, 2);
    assert_eq!(store.var(b).ref_count_int, 2);
}

#[test]
fn different_types_do_not_collide() {
    let mut store = VariableStore::new();
    let a = traced(VarType::Int32, "mov.$t0 $r0, 1", &[], &mut store);
    let b = traced(VarType::UInt32, "mov.$t0 $r0, 1", &[], &mut store);
    assert_ne!(a, b);
}

#[test]
fn destruction_cascades_to_dependencies() {
    let mut store = VariableStore::new();
    let mut dead = Vec::new();

    let a = traced(VarType::Int32, "mov.$t0 $r0, 1", &[], &mut store);
    let b = traced(VarType::Int32, "mov.$t0 $r0, 2", &[], &mut store);
    let c = traced(VarType::Int32, "add.$t0 $r0, $r1, $r2", &[a, b], &mut store);

    // Dropping the operand handles keeps them alive through `c`.
    store.dec_ref_ext(a, &mut dead, None);
    store.dec_ref_ext(b, &mut dead, None);
    assert_eq!(store.len(), 3);

    // Dropping `c` collapses the whole subgraph.
    store.dec_ref_ext(c, &mut dead, None);
    assert!(store.is_empty());
    assert_eq!(store.cse_len(), 0);
    assert!(dead.is_empty(), "no node owned storage");
}

#[test]
fn owned_storage_is_drained_on_destroy() {
    let mut store = VariableStore::new();
    let mut dead = Vec::new();

    let mut v = Variable::new(VarType::Float32, 8);
    v.data = 0x1000;
    v.free_variable = true;
    let (id, fresh) = store.insert_or_dedupe(v);
    assert!(fresh);
    store.inc_ref_ext(id);

    store.dec_ref_ext(id, &mut dead, None);
    assert_eq!(dead, vec![0x1000]);
    assert!(store.is_empty());
}

#[test]
fn mapped_buffers_never_deduplicate() {
    let mut store = VariableStore::new();

    let mut v1 = Variable::new(VarType::Float32, 8);
    v1.data = 0x1000;
    let mut v2 = Variable::new(VarType::Float32, 8);
    v2.data = 0x2000;

    let (a, _) = store.insert_or_dedupe(v1);
    let (b, _) = store.insert_or_dedupe(v2);
    assert_ne!(a, b);
}

#[test]
fn pointer_literals_are_indexed() {
    let mut store = VariableStore::new();
    let mut dead = Vec::new();

    let mut v = Variable::new(VarType::Pointer, 1);
    v.data = 0x4000;
    v.direct_pointer = true;
    v.tsize = 0;
    let (id, _) = store.insert_or_dedupe(v);
    store.inc_ref_ext(id);

    assert_eq!(store.literal(0x4000), Some(id));
    assert_eq!(store.literal_len(), 1);

    store.dec_ref_ext(id, &mut dead, None);
    assert_eq!(store.literal(0x4000), None);
    assert_eq!(store.literal_len(), 0);
}

#[test]
fn ext_release_removes_from_todo() {
    let mut store = VariableStore::new();
    let mut dead = Vec::new();
    let mut todo = BTreeSet::new();

    let a = traced(VarType::Int32, "mov.$t0 $r0, 1", &[], &mut store);
    let b = traced(VarType::Int32, "neg.$t0 $r0, $r1", &[a], &mut store);
    todo.insert(a);
    todo.insert(b);

    // `a` keeps living through `b`, but leaves the schedule.
    store.dec_ref_ext(a, &mut dead, Some(&mut todo));
    assert!(!todo.contains(&a));
    assert_eq!(store.len(), 2);

    store.dec_ref_ext(b, &mut dead, Some(&mut todo));
    assert!(todo.is_empty());
    assert!(store.is_empty());
}

#[test]
fn materialize_detaches_dependencies() {
    let mut store = VariableStore::new();
    let mut dead = Vec::new();

    let a = traced(VarType::Int32, "mov.$t0 $r0, 1", &[], &mut store);
    let b = traced(VarType::Int32, "neg.$t0 $r0, $r1", &[a], &mut store);
    store.dec_ref_ext(a, &mut dead, None);

    let (deps, extra) = store.materialize(b, 0x2000, true);
    assert_eq!(deps, [a, 0, 0]);
    assert_eq!(extra, 0);
    assert!(store.var(b).evaluated());
    assert!(store.var(b).stmt.is_none());
    assert_eq!(store.cse_len(), 1, "only the statement entry of `a` remains");

    for dep in deps {
        store.dec_ref_int(dep, &mut dead, None);
    }
    assert_eq!(store.len(), 1, "the detached operand was collected");

    store.dec_ref_ext(b, &mut dead, None);
    assert_eq!(dead, vec![0x2000]);
    assert!(store.is_empty());
}

#[test]
fn update_size_reindexes_the_fingerprint() {
    let mut store = VariableStore::new();
    let mut dead = Vec::new();

    let a = traced(VarType::Int32, "mov.$t0 $r0, 7", &[], &mut store);
    store.update_size(a, 16);
    assert_eq!(store.var(a).size, 16);

    // A fresh scalar trace of the same statement must not collide with the
    // resized node; it lives under the scalar fingerprint again.
    let b = traced(VarType::Int32, "mov.$t0 $r0, 7", &[], &mut store);
    assert_ne!(a, b);
    assert_eq!(store.var(b).size, 1);

    store.dec_ref_ext(a, &mut dead, None);
    store.dec_ref_ext(b, &mut dead, None);
    assert!(store.is_empty());
    assert_eq!(store.cse_len(), 0);
}
