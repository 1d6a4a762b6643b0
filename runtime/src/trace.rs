//! The trace recorder.
//!
//! Client code describes computation as IR statements over existing
//! variables; each call appends one node to the graph, consults the CSE
//! index, and queues the node on the active stream. Registered memory
//! regions (`var_map`, `var_copy`) and pointer literals enter the graph
//! already materialized.

use std::borrow::Cow;
use std::fmt::Write as _;

use smallvec::SmallVec;
use smelt_dtype::{AllocType, VarType};
use smelt_ir::stmt::{ALL_FALSE_STMT, ALL_TRUE_STMT, is_write_form};
use smelt_ir::{VarId, Variable};
use snafu::ensure;
use tracing::debug;

use crate::error::{
    ElementSizeSnafu, EmptySizeSnafu, IncompatibleSizesSnafu, NotMaterializedSnafu, OutOfBoundsSnafu, ResizeSnafu,
    Result, UninitializedOperandSnafu,
};
use crate::state::{State, mem_string};

impl State {
    /// Append a statement with `ops.len()` operands to the instruction
    /// trace and return the id of its result variable. The result size is
    /// the maximum operand size.
    pub fn trace_append(&mut self, ty: VarType, stmt: Cow<'static, str>, ops: &[VarId]) -> Result<VarId> {
        self.trace_append_impl(ty, stmt, ops, 1)
    }

    /// Append a statement without operands; the result size is explicit.
    pub fn trace_append_0(&mut self, ty: VarType, stmt: Cow<'static, str>, size: u32) -> Result<VarId> {
        ensure!(size > 0, EmptySizeSnafu);
        self.trace_append_impl(ty, stmt, &[], size)
    }

    fn trace_append_impl(&mut self, ty: VarType, stmt: Cow<'static, str>, ops: &[VarId], base_size: u32) -> Result<VarId> {
        debug_assert!(ops.len() <= 3);
        let skey = self.active_key()?;
        ensure!(ops.iter().all(|&op| op != 0), UninitializedOperandSnafu);

        // A dirty operand was scatter-modified since its evaluation; force a
        // round of evaluation before recording a statement that reads it.
        let dirty = ops.iter().any(|&op| self.store.var(op).dirty);
        if dirty {
            self.eval()?;
        }

        let mut size = base_size;
        let mut tsize = 1u32;
        let mut sizes: SmallVec<[u32; 3]> = SmallVec::new();
        for &op in ops {
            let v = self.store.var(op);
            sizes.push(v.size);
            size = size.max(v.size);
            tsize = tsize.saturating_add(v.tsize);
        }
        if dirty {
            // Materialized operands no longer contribute their subtrees.
            tsize = ops.len() as u32 + 1;
        }
        ensure!(
            sizes.iter().all(|&s| s == 1 || s == size),
            IncompatibleSizesSnafu { sizes: sizes.to_vec(), stmt: stmt.to_string() }
        );

        let write_form = ops.len() == 3 && is_write_form(&stmt);
        let mut v = Variable::new(ty, size);
        v.stmt = Some(stmt);
        v.tsize = tsize;
        for (slot, &op) in ops.iter().enumerate() {
            v.dep[slot] = op;
        }
        if write_form {
            v.extra_dep = self.scatter_gather_operand;
        }
        let extra_dep = v.extra_dep;

        let (id, fresh) = self.store.insert_or_dedupe(v);
        if fresh {
            for &op in ops {
                self.store.inc_ref_int(op);
            }
            self.store.inc_ref_ext(extra_dep);
        }
        self.store.inc_ref_ext(id);
        self.streams.get_mut(&skey).expect("active stream").todo.insert(id);

        debug!(id, ops = ?ops, reused = !fresh, stmt = %self.store.var(id).stmt.as_deref().unwrap_or(""), "trace_append");
        Ok(id)
    }

    /// Register an existing memory region as a materialized variable. With
    /// `take_ownership` the region is released through the allocator once
    /// the variable dies.
    pub fn var_map(&mut self, ty: VarType, addr: usize, size: u32, take_ownership: bool) -> Result<VarId> {
        ensure!(size > 0, EmptySizeSnafu);
        let mut v = Variable::new(ty, size);
        v.data = addr;
        v.free_variable = take_ownership;
        let (id, _) = self.store.insert_or_dedupe(v);
        self.store.inc_ref_ext(id);
        debug!(id, addr = format_args!("{addr:#x}"), size, free = take_ownership, "var_map");
        Ok(id)
    }

    /// Copy a host memory region onto the active device through a pinned
    /// staging buffer and register the result.
    ///
    /// # Safety
    ///
    /// `src` must point at `size` elements of type `ty`.
    pub unsafe fn var_copy(&mut self, ty: VarType, src: usize, size: u32) -> Result<VarId> {
        self.active_key()?;
        ensure!(size > 0, EmptySizeSnafu);

        let total = size as usize * ty.size();
        let staging = self.malloc(AllocType::HostPinned, total)?;
        let device_ptr = self.malloc(AllocType::Device, total)?;
        // SAFETY: caller guarantees `src`; staging and device blocks were
        // just allocated with `total` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, staging as *mut u8, total);
            std::ptr::copy_nonoverlapping(staging as *const u8, device_ptr as *mut u8, total);
        }
        self.free_ptr(staging)?;

        let id = self.var_map(ty, device_ptr, size, true)?;
        debug!(id, size, "var_copy");
        Ok(id)
    }

    /// Register a pointer literal, deduplicated by pointer value.
    pub fn var_copy_ptr(&mut self, addr: usize) -> Result<VarId> {
        if let Some(id) = self.store.literal(addr) {
            self.store.inc_ref_ext(id);
            return Ok(id);
        }

        let mut v = Variable::new(VarType::Pointer, 1);
        v.data = addr;
        v.direct_pointer = true;
        v.tsize = 0;
        let (id, _) = self.store.insert_or_dedupe(v);
        self.store.inc_ref_ext(id);
        debug!(id, addr = format_args!("{addr:#x}"), "var_copy_ptr");
        Ok(id)
    }

    pub fn var_ptr(&self, id: VarId) -> usize {
        self.store.var(id).data
    }

    pub fn var_size(&self, id: VarId) -> u32 {
        self.store.var(id).size
    }

    /// Change a variable's size.
    ///
    /// Unevaluated variables without internal users resize in place.
    /// Materialized (or internally referenced) scalars spawn a broadcast
    /// `mov` trace of the requested size when `copy` is set; everything else
    /// fails.
    pub fn var_set_size(&mut self, id: VarId, size: u32, copy: bool) -> Result<VarId> {
        ensure!(size > 0, EmptySizeSnafu);
        let v = self.store.var(id);
        if v.size == size {
            return Ok(id);
        }

        if v.data != 0 || v.ref_count_int > 0 {
            if v.size == 1 && copy {
                let ty = v.ty;
                let resized = self.trace_append(ty, Cow::Borrowed("mov.$t0 $r0, $r1"), &[id])?;
                self.store.update_size(resized, size);
                self.var_dec_ref_ext(id);
                return Ok(resized);
            }
            return ResizeSnafu { id, current: v.size, requested: size }.fail();
        }

        self.store.update_size(id, size);
        debug!(id, size, "var_set_size");
        Ok(id)
    }

    pub fn var_set_label(&mut self, id: VarId, label: &str) {
        self.store.var_mut(id).label = Some(label.to_string());
        debug!(id, label, "var_set_label");
    }

    pub fn var_label(&self, id: VarId) -> Option<String> {
        self.store.var(id).label.clone()
    }

    /// Asynchronously migrate a variable's storage to another memory
    /// flavor. Re-migrating into the flavor the variable already uses only
    /// takes another external reference.
    pub fn var_migrate(&mut self, id: VarId, flavor: AllocType) -> Result<VarId> {
        if id == 0 {
            return Ok(0);
        }
        self.ensure_evaluated(id)?;

        let addr = self.store.var(id).data;
        let migrated = self.migrate_ptr(addr, flavor)?;
        if migrated == addr {
            self.store.inc_ref_ext(id);
        } else {
            self.store.var_mut(id).data = migrated;
        }
        debug!(id, flavor = flavor.name(), moved = migrated != addr, "var_migrate");
        Ok(id)
    }

    /// Mark a variable as observable I/O: it stays schedulable (pinned by
    /// an extra external reference) until it has been emitted.
    pub fn var_mark_side_effect(&mut self, id: VarId) {
        let v = self.store.var_mut(id);
        if !v.side_effect {
            v.side_effect = true;
            self.store.inc_ref_ext(id);
        }
        debug!(id, "var_mark_side_effect");
    }

    /// Flag scatter-modified storage; the next read of the variable forces
    /// an evaluation first.
    pub fn var_mark_dirty(&mut self, id: VarId) {
        self.store.var_mut(id).dirty = true;
        debug!(id, "var_mark_dirty");
    }

    /// Attach an extra lifetime dependency: `dep` is kept alive at least as
    /// long as `id` needs it (until evaluation for traced nodes, until
    /// destruction for materialized ones).
    pub fn var_set_extra_dep(&mut self, id: VarId, dep: VarId) {
        self.store.inc_ref_ext(dep);
        let old = self.store.replace_extra_dep(id, dep);
        if old != 0 {
            let mut dead = Vec::new();
            self.store.dec_ref_ext(old, &mut dead, None);
            self.release_dead(dead);
        }
        debug!(id, dep, "var_set_extra_dep");
    }

    pub fn set_scatter_gather_operand(&mut self, id: VarId) {
        self.scatter_gather_operand = id;
    }

    /// Syntactic check for the canonical all-zero mask constant. Never
    /// triggers an evaluation.
    pub fn var_is_all_false(&self, id: VarId) -> bool {
        let v = self.store.var(id);
        v.ty == VarType::Bool && !v.evaluated() && v.stmt.as_deref() == Some(ALL_FALSE_STMT)
    }

    /// Syntactic check for the canonical all-one mask constant.
    pub fn var_is_all_true(&self, id: VarId) -> bool {
        let v = self.store.var(id);
        v.ty == VarType::Bool && !v.evaluated() && v.stmt.as_deref() == Some(ALL_TRUE_STMT)
    }

    /// Force evaluation when `id` is unevaluated or dirty, then require
    /// materialized storage.
    pub fn ensure_evaluated(&mut self, id: VarId) -> Result<()> {
        let v = self.store.var(id);
        if !v.evaluated() || v.dirty {
            self.eval()?;
        }
        ensure!(self.store.var(id).evaluated(), NotMaterializedSnafu { id });
        Ok(())
    }

    /// Copy one element into `dst`. The variable must be materialized; the
    /// API layer forces evaluation and synchronizes beforehand.
    pub fn element_read(&self, id: VarId, offset: u32, dst: &mut [u8]) -> Result<()> {
        let v = self.store.var(id);
        ensure!(v.evaluated(), NotMaterializedSnafu { id });
        ensure!(offset < v.size, OutOfBoundsSnafu { offset, size: v.size });
        let es = v.ty.size();
        ensure!(dst.len() == es, ElementSizeSnafu { expected: es, actual: dst.len() });
        // SAFETY: bounds were checked against the materialized storage.
        unsafe {
            std::ptr::copy_nonoverlapping((v.data + offset as usize * es) as *const u8, dst.as_mut_ptr(), es);
        }
        Ok(())
    }

    /// Copy one element from `src` into the variable's storage.
    pub fn element_write(&mut self, id: VarId, offset: u32, src: &[u8]) -> Result<()> {
        let v = self.store.var(id);
        ensure!(v.evaluated(), NotMaterializedSnafu { id });
        ensure!(offset < v.size, OutOfBoundsSnafu { offset, size: v.size });
        let es = v.ty.size();
        ensure!(src.len() == es, ElementSizeSnafu { expected: es, actual: src.len() });
        // SAFETY: bounds were checked against the materialized storage.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), (v.data + offset as usize * es) as *mut u8, es);
        }
        Ok(())
    }

    /// Human-readable table of all live variables plus memory statistics.
    pub fn whos(&self) -> String {
        let mut out = String::new();
        out.push_str("\n  ID        Type   E/I Refs   Size        Memory      Ready    Label");
        out.push_str("\n  ==================================================================\n");

        let mut ready = 0usize;
        let mut scheduled = 0usize;
        let mut arith = 0usize;

        for id in self.store.ids() {
            let v = self.store.var(id);
            let mem = v.mem_size();
            let refs = format!("{} / {}", v.ref_count_ext, v.ref_count_int);
            let _ = writeln!(
                out,
                "  {:<9} {:<6} {:<10} {:<11} {:<11} [{}]      {}",
                id,
                v.ty.name(),
                refs,
                v.size,
                mem_string(mem),
                if v.evaluated() { 'x' } else { ' ' },
                v.label.as_deref().unwrap_or(""),
            );
            if v.evaluated() {
                ready += mem;
            } else if v.ref_count_ext == 0 {
                arith += mem;
            } else {
                scheduled += mem;
            }
        }

        out.push_str("  ==================================================================\n\n");
        out.push_str("  JIT compiler\n  ============\n");
        let _ = writeln!(out, "   - Memory usage (ready)     : {}.", mem_string(ready));
        let _ = writeln!(
            out,
            "   - Memory usage (scheduled) : {} + {} = {}.",
            mem_string(ready),
            mem_string(scheduled),
            mem_string(ready + scheduled)
        );
        let _ = writeln!(out, "   - Memory savings           : {}.\n", mem_string(arith));

        out.push_str("  Memory allocator\n  ================\n");
        let stats = self.alloc.stats();
        for flavor in AllocType::ALL {
            let _ = writeln!(
                out,
                "   - {:<20}: {} used (max. {}).",
                flavor.name(),
                mem_string(stats.usage[flavor as usize]),
                mem_string(stats.watermark[flavor as usize]),
            );
        }
        out
    }

    /// Human-readable contents of a variable. Forces evaluation.
    pub fn var_str(&mut self, id: VarId) -> Result<String> {
        self.ensure_evaluated(id)?;
        let v = self.store.var(id);
        let mut out = String::from("[");
        for i in 0..v.size as usize {
            if i > 0 {
                out.push_str(", ");
            }
            if i == 128 {
                out.push_str("..");
                break;
            }
            let addr = v.data + i * v.ty.size();
            // SAFETY: `i` is within the materialized storage.
            unsafe { format_element(&mut out, v.ty, addr) };
        }
        out.push(']');
        Ok(out)
    }
}

unsafe fn format_element(out: &mut String, ty: VarType, addr: usize) {
    unsafe {
        let _ = match ty {
            VarType::Int8 => write!(out, "{}", (addr as *const i8).read()),
            VarType::UInt8 => write!(out, "{}", (addr as *const u8).read()),
            VarType::Int16 => write!(out, "{}", (addr as *const i16).read_unaligned()),
            VarType::UInt16 => write!(out, "{}", (addr as *const u16).read_unaligned()),
            VarType::Int32 => write!(out, "{}", (addr as *const i32).read_unaligned()),
            VarType::UInt32 => write!(out, "{}", (addr as *const u32).read_unaligned()),
            VarType::Int64 => write!(out, "{}", (addr as *const i64).read_unaligned()),
            VarType::UInt64 => write!(out, "{}", (addr as *const u64).read_unaligned()),
            VarType::Float16 => {
                write!(out, "{}", half::f16::from_bits((addr as *const u16).read_unaligned()))
            }
            VarType::Float32 => write!(out, "{}", (addr as *const f32).read_unaligned()),
            VarType::Float64 => write!(out, "{}", (addr as *const f64).read_unaligned()),
            VarType::Bool => write!(out, "{}", (addr as *const u8).read() != 0),
            VarType::Pointer => write!(out, "{:#x}", (addr as *const u64).read_unaligned()),
        };
    }
}
