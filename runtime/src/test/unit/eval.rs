use crate::api;
use crate::test::helpers::*;
use smelt_dtype::VarType;

#[test]
fn fused_kernels_reuse_cached_parses() {
    // Identical traces over fresh buffers renumber to the same kernel text.
    with_runtime(|| {
        let run = |values: &[i32]| {
            let a = copy_i32(values);
            let b = copy_i32(&[1, 1, 1]);
            let c = api::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", a, b).unwrap();
            api::eval().unwrap();
            let result = read_i32(c, 0);
            for id in [a, b, c] {
                api::var_dec_ref_ext(id);
            }
            result
        };

        assert_eq!(run(&[10, 20, 30]), 11);
        let hits_before = kernel_cache_hits();
        assert_eq!(run(&[100, 200, 300]), 101);
        assert!(kernel_cache_hits() > hits_before, "second evaluation reuses the kernel");
    });
}

#[test]
fn unevaluated_scalars_are_inlined() {
    // A broadcast constant feeding a larger kernel is re-emitted inside it;
    // the two partitions stay independent.
    with_runtime(|| {
        let b = copy_i32(&[1, 2, 3, 4]);
        let k = api::trace_append_0(VarType::Int32, "mov.$t0 $r0, 7", 1).unwrap();
        let d = api::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", k, b).unwrap();
        api::eval().unwrap();

        for i in 0..4 {
            assert_eq!(read_i32(d, i), 8 + i as i32);
        }
        // The scalar itself materialized through its own size-1 kernel.
        assert_eq!(read_i32(k, 0), 7);

        for id in [b, k, d] {
            api::var_dec_ref_ext(id);
        }
        assert_eq!(live_variables(), 0);
    });
}

#[test]
fn purely_internal_scalars_never_materialize() {
    with_runtime(|| {
        let b = copy_i32(&[1, 2, 3, 4]);
        let k = api::trace_append_0(VarType::Int32, "mov.$t0 $r0, 5", 1).unwrap();
        let d = api::trace_append_2(VarType::Int32, "mul.$t0 $r0, $r1, $r2", k, b).unwrap();
        // Drop our handle: the constant lives on through `d` alone.
        api::var_dec_ref_ext(k);

        api::eval().unwrap();
        assert_eq!(read_i32(d, 3), 20);

        api::var_dec_ref_ext(b);
        api::var_dec_ref_ext(d);
        assert_eq!(live_variables(), 0);
    });
}

#[test]
fn size_classes_dispatch_separate_kernels() {
    with_runtime(|| {
        let small = copy_i32(&[1, 2]);
        let large = copy_i32(&[10, 20, 30, 40, 50]);
        let double_small = api::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", small, small).unwrap();
        let double_large = api::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", large, large).unwrap();
        api::eval().unwrap();

        assert_eq!(read_i32(double_small, 1), 4);
        assert_eq!(read_i32(double_large, 4), 100);

        for id in [small, large, double_small, double_large] {
            api::var_dec_ref_ext(id);
        }
    });
}

#[test]
fn serial_dispatch_matches_parallel_dispatch() {
    with_runtime(|| {
        api::parallel_set_dispatch(false);
        assert!(!api::parallel_dispatch());

        let small = copy_i32(&[1, 2]);
        let large = copy_i32(&[3, 4, 5]);
        let a = api::trace_append_1(VarType::Int32, "neg.$t0 $r0, $r1", small).unwrap();
        let b = api::trace_append_1(VarType::Int32, "neg.$t0 $r0, $r1", large).unwrap();
        api::eval().unwrap();

        assert_eq!(read_i32(a, 0), -1);
        assert_eq!(read_i32(b, 2), -5);

        for id in [small, large, a, b] {
            api::var_dec_ref_ext(id);
        }
        api::parallel_set_dispatch(true);
    });
}

#[test]
fn chained_traces_fuse_into_one_kernel() {
    with_runtime(|| {
        let a = copy_i32(&[1, 2, 3]);
        let b = api::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", a, a).unwrap();
        let c = api::trace_append_2(VarType::Int32, "mul.$t0 $r0, $r1, $r2", b, b).unwrap();
        let d = api::trace_append_1(VarType::Int32, "neg.$t0 $r0, $r1", c).unwrap();
        api::eval().unwrap();

        assert_eq!(read_i32(d, 2), -36);

        // Intermediates with live handles materialized alongside.
        assert_eq!(read_i32(b, 2), 6);

        for id in [a, b, c, d] {
            api::var_dec_ref_ext(id);
        }
        assert_eq!(live_variables(), 0);
    });
}

#[test]
fn intermediates_without_holders_stay_in_registers() {
    with_runtime(|| {
        let a = copy_i32(&[2, 3, 4]);
        let b = api::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", a, a).unwrap();
        let c = api::trace_append_2(VarType::Int32, "mul.$t0 $r0, $r1, $r2", b, b).unwrap();
        // Only the final result keeps an external handle.
        api::var_dec_ref_ext(b);

        api::eval().unwrap();
        assert_eq!(read_i32(c, 0), 16);
        {
            let state = crate::state::STATE.lock();
            assert!(state.store.get(b).is_none(), "register-only intermediate was collected");
        }

        api::var_dec_ref_ext(a);
        api::var_dec_ref_ext(c);
        assert_eq!(live_variables(), 0);
    });
}

#[test]
fn gather_reads_through_pointer_literals() {
    with_runtime(|| {
        let src = copy_i32(&[10, 20, 30, 40]);
        let src_ptr = api::var_copy_ptr(api::var_ptr(src) as *const u8).unwrap();
        let idx = copy_u32(&[3, 2, 1, 0]);

        let g = api::trace_append_2(VarType::Int32, "ld.global.$t0 $r0, [$r1 + $r2]", src_ptr, idx).unwrap();
        api::var_set_extra_dep(g, src);
        api::eval().unwrap();

        assert_eq!(read_i32(g, 0), 40);
        assert_eq!(read_i32(g, 3), 10);

        for id in [src, src_ptr, idx, g] {
            api::var_dec_ref_ext(id);
        }
        assert_eq!(live_variables(), 0);
    });
}

#[test]
fn scatter_runs_for_its_side_effect() {
    with_runtime(|| {
        let target = copy_i32(&[0, 0, 0, 0]);
        let target_ptr = api::var_copy_ptr(api::var_ptr(target) as *const u8).unwrap();
        let idx = copy_u32(&[0, 1, 2, 3]);
        let val = copy_i32(&[5, 6, 7, 8]);

        api::set_scatter_gather_operand(target);
        let scatter =
            api::trace_append_3(VarType::Int32, "st.global.$t3 [$r1 + $r2], $r3", target_ptr, idx, val).unwrap();
        api::var_mark_side_effect(scatter);
        api::var_mark_dirty(target);
        // The caller has no use for the scatter node itself.
        api::var_dec_ref_ext(scatter);
        assert!(live_variables() > 0);

        api::eval().unwrap();

        for i in 0..4 {
            assert_eq!(read_i32(target, i), 5 + i as i32);
        }
        {
            let state = crate::state::STATE.lock();
            assert!(state.store.get(scatter).is_none(), "side-effect node retired after emission");
        }

        for id in [target, target_ptr, idx, val] {
            api::var_dec_ref_ext(id);
        }
        assert_eq!(live_variables(), 0);
    });
}

#[test]
fn dirty_targets_force_evaluation_before_reuse() {
    with_runtime(|| {
        let target = copy_i32(&[1, 1, 1, 1]);
        let target_ptr = api::var_copy_ptr(api::var_ptr(target) as *const u8).unwrap();
        let idx = copy_u32(&[0, 1, 2, 3]);
        let val = copy_i32(&[9, 9, 9, 9]);

        api::set_scatter_gather_operand(target);
        let scatter =
            api::trace_append_3(VarType::Int32, "st.global.$t3 [$r1 + $r2], $r3", target_ptr, idx, val).unwrap();
        api::var_mark_side_effect(scatter);
        api::var_mark_dirty(target);
        api::var_dec_ref_ext(scatter);

        // Consuming the dirty target inside a new trace flushes the pending
        // scatter first; the doubled values see the scattered nines.
        let doubled = api::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", target, target).unwrap();
        api::eval().unwrap();
        assert_eq!(read_i32(doubled, 0), 18);

        for id in [target, target_ptr, idx, val, doubled] {
            api::var_dec_ref_ext(id);
        }
        assert_eq!(live_variables(), 0);
    });
}

#[test]
fn eval_with_empty_schedule_is_a_no_op() {
    with_runtime(|| {
        api::eval().unwrap();
        api::sync_stream().unwrap();
        api::sync_device().unwrap();
    });
}

#[test]
fn var_eval_only_runs_when_needed() {
    with_runtime(|| {
        let a = copy_i32(&[4, 5]);
        // Already materialized: nothing to do.
        api::var_eval(a).unwrap();

        let b = api::trace_append_1(VarType::Int32, "neg.$t0 $r0, $r1", a).unwrap();
        api::var_eval(b).unwrap();
        assert_eq!(read_i32(b, 1), -5);

        api::var_dec_ref_ext(a);
        api::var_dec_ref_ext(b);
    });
}

#[test]
fn evaluation_recycles_intermediate_storage() {
    // Freed intermediates travel the release chain and come back out of the
    // allocator cache.
    with_runtime(|| {
        let a = copy_i32(&[1, 2, 3, 4]);
        let b = api::trace_append_2(VarType::Int32, "add.$t0 $r0, $r1, $r2", a, a).unwrap();
        api::eval().unwrap();
        let b_addr = api::var_ptr(b) as usize;

        // Dropping `b` defers its buffer onto the release chain; the next
        // same-size allocation reuses it.
        api::var_dec_ref_ext(b);
        let hits = allocator_hits();
        let c = api::trace_append_2(VarType::Int32, "mul.$t0 $r0, $r1, $r2", a, a).unwrap();
        api::eval().unwrap();
        assert_eq!(api::var_ptr(c) as usize, b_addr, "storage was recycled");
        assert!(allocator_hits() > hits);

        api::var_dec_ref_ext(a);
        api::var_dec_ref_ext(c);
    });
}
