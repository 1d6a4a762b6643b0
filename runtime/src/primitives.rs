//! Tuned primitives.
//!
//! Fixed operations over raw buffers that bypass the tracer entirely: fill,
//! copies, reductions, an exclusive prefix sum, boolean folds and a
//! bucket-partition permutation. The GPU renditions of these belong to the
//! out-of-scope back-ends; these host implementations define the contracts.

use smelt_dtype::{ReduceOp, VarType};
use snafu::ensure;
use tracing::trace;

use crate::error::{BucketRangeSnafu, InvalidReductionSnafu, Result};

/// Write `size` copies of the element behind `src` to `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for `size` elements of type `ty`; `src` must point at
/// one element of that type.
pub unsafe fn fill(ty: VarType, ptr: *mut u8, size: u32, src: *const u8) {
    let es = ty.size();
    trace!(ty = ty.name(), size, "fill");
    unsafe {
        for i in 0..size as usize {
            std::ptr::copy_nonoverlapping(src, ptr.add(i * es), es);
        }
    }
}

/// Synchronous copy between non-overlapping regions.
///
/// # Safety
///
/// Both regions must be valid for `size` bytes and must not overlap.
pub unsafe fn memcpy(dst: *mut u8, src: *const u8, size: usize) {
    unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
}

/// Copy enqueued on the active stream. The host back-end completes copies
/// before returning, so this only differs from [`memcpy`] on devices.
///
/// # Safety
///
/// As for [`memcpy`].
pub unsafe fn memcpy_async(dst: *mut u8, src: *const u8, size: usize) {
    trace!(size, "memcpy_async");
    unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
}

macro_rules! reduce_integer {
    ($ty:ty, $ptr:expr, $size:expr, $op:expr, $out:expr) => {{
        // SAFETY: caller guarantees `$size` elements behind `$ptr`.
        let values = unsafe { std::slice::from_raw_parts($ptr as *const $ty, $size) };
        let result: $ty = match $op {
            ReduceOp::Add => values.iter().fold(0, |acc, &v| acc.wrapping_add(v)),
            ReduceOp::Mul => values.iter().fold(1, |acc, &v| acc.wrapping_mul(v)),
            ReduceOp::Min => values.iter().copied().fold(<$ty>::MAX, <$ty>::min),
            ReduceOp::Max => values.iter().copied().fold(<$ty>::MIN, <$ty>::max),
            ReduceOp::And => values.iter().fold(!0, |acc, &v| acc & v),
            ReduceOp::Or => values.iter().fold(0, |acc, &v| acc | v),
        };
        // SAFETY: caller guarantees `$out` points at one element.
        unsafe { ($out as *mut $ty).write_unaligned(result) };
    }};
}

macro_rules! reduce_float {
    ($ty:ty, $ptr:expr, $size:expr, $op:expr, $out:expr) => {{
        // SAFETY: caller guarantees `$size` elements behind `$ptr`.
        let values = unsafe { std::slice::from_raw_parts($ptr as *const $ty, $size) };
        let result: $ty = match $op {
            ReduceOp::Add => values.iter().sum(),
            ReduceOp::Mul => values.iter().product(),
            ReduceOp::Min => values.iter().copied().fold(<$ty>::INFINITY, <$ty>::min),
            ReduceOp::Max => values.iter().copied().fold(<$ty>::NEG_INFINITY, <$ty>::max),
            ReduceOp::And | ReduceOp::Or => unreachable!("rejected above"),
        };
        // SAFETY: caller guarantees `$out` points at one element.
        unsafe { ($out as *mut $ty).write_unaligned(result) };
    }};
}

/// Combine `size` elements into a single value written to `out`.
///
/// `And`/`Or` are bitwise folds and only defined for integer and mask
/// types.
///
/// # Safety
///
/// `ptr` must be valid for `size` elements of type `ty`; `out` must be
/// valid for one element of type `ty`.
pub unsafe fn reduce(ty: VarType, op: ReduceOp, ptr: *const u8, size: u32, out: *mut u8) -> Result<()> {
    ensure!(
        !(matches!(op, ReduceOp::And | ReduceOp::Or) && ty.is_float()),
        InvalidReductionSnafu { ty, op }
    );
    trace!(ty = ty.name(), op = ?op, size, "reduce");

    let n = size as usize;
    match ty {
        VarType::Int8 => reduce_integer!(i8, ptr, n, op, out),
        VarType::UInt8 | VarType::Bool => reduce_integer!(u8, ptr, n, op, out),
        VarType::Int16 => reduce_integer!(i16, ptr, n, op, out),
        VarType::UInt16 => reduce_integer!(u16, ptr, n, op, out),
        VarType::Int32 => reduce_integer!(i32, ptr, n, op, out),
        VarType::UInt32 => reduce_integer!(u32, ptr, n, op, out),
        VarType::Int64 => reduce_integer!(i64, ptr, n, op, out),
        VarType::UInt64 | VarType::Pointer => reduce_integer!(u64, ptr, n, op, out),
        VarType::Float16 => {
            // SAFETY: caller guarantees `n` elements behind `ptr`.
            let values = unsafe { std::slice::from_raw_parts(ptr as *const u16, n) };
            let folded = values.iter().map(|&bits| half::f16::from_bits(bits).to_f32());
            let result = match op {
                ReduceOp::Add => folded.sum(),
                ReduceOp::Mul => folded.product(),
                ReduceOp::Min => folded.fold(f32::INFINITY, f32::min),
                ReduceOp::Max => folded.fold(f32::NEG_INFINITY, f32::max),
                ReduceOp::And | ReduceOp::Or => unreachable!("rejected above"),
            };
            // SAFETY: caller guarantees `out` points at one element.
            unsafe { (out as *mut u16).write_unaligned(half::f16::from_f32(result).to_bits()) };
        }
        VarType::Float32 => reduce_float!(f32, ptr, n, op, out),
        VarType::Float64 => reduce_float!(f64, ptr, n, op, out),
    }
    Ok(())
}

/// Exclusive prefix sum over `u32`, usable in place (`input == output`).
///
/// # Safety
///
/// Both pointers must be valid for `size` elements.
pub unsafe fn scan(input: *const u32, output: *mut u32, size: u32) {
    let mut acc = 0u32;
    unsafe {
        for i in 0..size as usize {
            let value = input.add(i).read_unaligned();
            output.add(i).write_unaligned(acc);
            acc = acc.wrapping_add(value);
        }
    }
}

/// Whether every byte of the array is nonzero.
///
/// # Safety
///
/// `values` must be valid for `size` bytes.
pub unsafe fn all(values: *const u8, size: u32) -> bool {
    // SAFETY: caller guarantees the range.
    let values = unsafe { std::slice::from_raw_parts(values, size as usize) };
    values.iter().all(|&v| v != 0)
}

/// Whether any byte of the array is nonzero.
///
/// # Safety
///
/// `values` must be valid for `size` bytes.
pub unsafe fn any(values: *const u8, size: u32) -> bool {
    // SAFETY: caller guarantees the range.
    let values = unsafe { std::slice::from_raw_parts(values, size as usize) };
    values.iter().any(|&v| v != 0)
}

/// Bucket-partition permutation.
///
/// Writes to `perm` a permutation of `[0, size)` grouping together the
/// indices of equal values in ascending bucket order (a counting sort, much
/// cheaper than actually sorting when `bucket_count` is small). With
/// `offsets` present, one `(bucket, start, length, 0)` quadruple per
/// non-empty bucket is recorded and their count returned; without it the
/// result is 0.
///
/// # Safety
///
/// `values` and `perm` must be valid for `size` elements; `offsets`, when
/// present, for `bucket_count * 4 + 1` elements.
pub unsafe fn make_permutation(
    values: *const u32,
    size: u32,
    bucket_count: u32,
    perm: *mut u32,
    offsets: Option<*mut u32>,
) -> Result<u32> {
    // SAFETY: caller guarantees `size` elements behind `values`.
    let values = unsafe { std::slice::from_raw_parts(values, size as usize) };

    // Pass 1: histogram.
    let mut counts = vec![0u32; bucket_count as usize];
    for &v in values {
        ensure!(v < bucket_count, BucketRangeSnafu { value: v, bucket_count });
        counts[v as usize] += 1;
    }

    // Exclusive scan over the histogram yields each bucket's start.
    let mut starts = vec![0u32; bucket_count as usize];
    let mut acc = 0u32;
    for (start, &count) in starts.iter_mut().zip(&counts) {
        *start = acc;
        acc += count;
    }

    // Pass 2: scatter indices into their buckets.
    let mut cursor = starts.clone();
    unsafe {
        for (i, &v) in values.iter().enumerate() {
            let slot = cursor[v as usize];
            cursor[v as usize] += 1;
            perm.add(slot as usize).write_unaligned(i as u32);
        }
    }

    let Some(offsets) = offsets else {
        return Ok(0);
    };
    let mut unique = 0u32;
    unsafe {
        for bucket in 0..bucket_count {
            let count = counts[bucket as usize];
            if count == 0 {
                continue;
            }
            let base = (unique as usize) * 4;
            offsets.add(base).write_unaligned(bucket);
            offsets.add(base + 1).write_unaligned(starts[bucket as usize]);
            offsets.add(base + 2).write_unaligned(count);
            offsets.add(base + 3).write_unaligned(0);
            unique += 1;
        }
    }
    Ok(unique)
}
