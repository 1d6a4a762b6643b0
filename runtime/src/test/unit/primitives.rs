use smelt_dtype::{ReduceOp, VarType};
use test_case::test_case;

use crate::primitives;

#[test]
fn fill_replicates_one_element() {
    let value = 0x1234_5678u32;
    let mut out = [0u32; 5];
    unsafe {
        primitives::fill(VarType::UInt32, out.as_mut_ptr() as *mut u8, 5, &value as *const u32 as *const u8);
    }
    assert_eq!(out, [value; 5]);
}

#[test]
fn memcpy_copies_bytes() {
    let src = [1u8, 2, 3, 4];
    let mut dst = [0u8; 4];
    unsafe {
        primitives::memcpy(dst.as_mut_ptr(), src.as_ptr(), 4);
    }
    assert_eq!(dst, src);

    let mut dst2 = [0u8; 4];
    unsafe {
        primitives::memcpy_async(dst2.as_mut_ptr(), src.as_ptr(), 4);
    }
    assert_eq!(dst2, src);
}

#[test_case(ReduceOp::Add, 10; "sum")]
#[test_case(ReduceOp::Mul, 24; "product")]
#[test_case(ReduceOp::Min, 1; "minimum")]
#[test_case(ReduceOp::Max, 4; "maximum")]
fn reduce_i32(op: ReduceOp, expected: i32) {
    let values = [3i32, 1, 4, 2];
    let mut out = 0i32;
    unsafe {
        primitives::reduce(VarType::Int32, op, values.as_ptr() as *const u8, 4, &mut out as *mut i32 as *mut u8)
            .unwrap();
    }
    assert_eq!(out, expected);
}

#[test]
fn reduce_bitwise_over_masks() {
    let values = [0xffu8, 0x0f, 0x3f];
    let mut out = 0u8;
    unsafe {
        primitives::reduce(VarType::UInt8, ReduceOp::And, values.as_ptr(), 3, &mut out).unwrap();
    }
    assert_eq!(out, 0x0f);
    unsafe {
        primitives::reduce(VarType::UInt8, ReduceOp::Or, values.as_ptr(), 3, &mut out).unwrap();
    }
    assert_eq!(out, 0xff);
}

#[test]
fn reduce_floats() {
    let values = [1.5f32, -2.0, 4.0];
    let mut out = 0.0f32;
    let src = values.as_ptr() as *const u8;
    let dst = &mut out as *mut f32 as *mut u8;

    unsafe { primitives::reduce(VarType::Float32, ReduceOp::Add, src, 3, dst) }.unwrap();
    assert_eq!(out, 3.5);

    unsafe { primitives::reduce(VarType::Float32, ReduceOp::Min, src, 3, dst) }.unwrap();
    assert_eq!(out, -2.0);

    // Bitwise folds are undefined for floats.
    let result = unsafe { primitives::reduce(VarType::Float32, ReduceOp::And, src, 3, dst) };
    assert!(result.is_err());
}

#[test]
fn scan_is_an_exclusive_prefix_sum() {
    // S6.
    let input = [3u32, 1, 4, 1, 5];
    let mut output = [0u32; 5];
    unsafe {
        primitives::scan(input.as_ptr(), output.as_mut_ptr(), 5);
    }
    assert_eq!(output, [0, 3, 4, 8, 9]);
}

#[test]
fn scan_works_in_place() {
    let mut values = [3u32, 1, 4, 1, 5];
    unsafe {
        primitives::scan(values.as_ptr(), values.as_mut_ptr(), 5);
    }
    assert_eq!(values, [0, 3, 4, 8, 9]);
}

#[test]
fn all_and_any_over_byte_masks() {
    let ones = [1u8, 2, 255];
    let mixed = [1u8, 0, 1];
    let zeros = [0u8; 3];
    unsafe {
        assert!(primitives::all(ones.as_ptr(), 3));
        assert!(!primitives::all(mixed.as_ptr(), 3));
        assert!(primitives::any(mixed.as_ptr(), 3));
        assert!(!primitives::any(zeros.as_ptr(), 3));
        // Empty ranges: `all` is vacuously true, `any` false.
        assert!(primitives::all(ones.as_ptr(), 0));
        assert!(!primitives::any(ones.as_ptr(), 0));
    }
}

#[test]
fn make_permutation_groups_buckets() {
    let values = [2u32, 0, 2, 1, 0, 2];
    let mut perm = [0u32; 6];
    let mut offsets = [0u32; 4 * 4 + 1];

    let unique = unsafe {
        primitives::make_permutation(values.as_ptr(), 6, 4, perm.as_mut_ptr(), Some(offsets.as_mut_ptr())).unwrap()
    };
    assert_eq!(unique, 3, "bucket 3 is empty");

    // The permutation visits every index once, in ascending bucket order.
    let mut seen = [false; 6];
    for i in 0..5 {
        assert!(values[perm[i] as usize] <= values[perm[i + 1] as usize]);
    }
    for &p in &perm {
        assert!(!seen[p as usize]);
        seen[p as usize] = true;
    }

    // Quadruples enumerate exactly the non-empty buckets.
    let quads: Vec<_> = (0..unique as usize).map(|i| (offsets[i * 4], offsets[i * 4 + 1], offsets[i * 4 + 2])).collect();
    assert_eq!(quads, vec![(0, 0, 2), (1, 2, 1), (2, 3, 3)]);
    assert_eq!(quads.iter().map(|q| q.2).sum::<u32>(), 6);
}

#[test]
fn make_permutation_without_offsets_returns_zero() {
    let values = [1u32, 0];
    let mut perm = [0u32; 2];
    let unique = unsafe { primitives::make_permutation(values.as_ptr(), 2, 2, perm.as_mut_ptr(), None).unwrap() };
    assert_eq!(unique, 0);
    assert_eq!(perm, [1, 0]);
}

#[test]
fn make_permutation_rejects_out_of_range_values() {
    let values = [5u32];
    let mut perm = [0u32; 1];
    let result = unsafe { primitives::make_permutation(values.as_ptr(), 1, 4, perm.as_mut_ptr(), None) };
    assert!(result.is_err());
}
