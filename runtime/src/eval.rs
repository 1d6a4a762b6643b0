//! The scheduler and evaluator.
//!
//! Evaluation turns the active stream's pending variables into fused
//! kernels: close over unevaluated ancestors, partition by output size (only
//! equally sized variables can share a kernel), order each partition by id —
//! ids are monotone with creation, so ascending id order is a topological
//! order — emit kernel text with substituted placeholders, allocate output
//! storage, dispatch, and finally transition every stored variable into its
//! materialized form.
//!
//! Unevaluated size-1 ancestors of a larger partition are *inlined*: their
//! statements are re-emitted inside the consuming kernel, so partitions
//! never depend on each other and can dispatch concurrently.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use smallvec::SmallVec;
use smelt_device::StreamKey;
use smelt_dtype::{AllocType, VarType};
use smelt_ir::stmt::expand;
use smelt_ir::VarId;
use tracing::{debug, trace};

use crate::error::Result;
use crate::kernel::Kernel;
use crate::state::State;

struct KernelPlan {
    kernel: Arc<Kernel>,
    size: u32,
    args: SmallVec<[usize; 8]>,
    /// Variables materialized by this kernel and their output storage.
    stores: Vec<(VarId, usize)>,
    /// Side-effect variables retired by this kernel.
    effects: Vec<VarId>,
}

impl State {
    /// Evaluate everything queued on the active stream.
    pub fn eval(&mut self) -> Result<()> {
        let skey = self.active_key()?;
        let taken: Vec<VarId> = {
            let stream = self.streams.get_mut(&skey).expect("active stream");
            std::mem::take(&mut stream.todo).into_iter().collect()
        };

        let result = self.eval_inner(skey, &taken);
        if result.is_err() {
            // Failed evaluations leave the schedule as it was.
            let stream = self.streams.get_mut(&skey).expect("active stream");
            for &id in &taken {
                if self.store.get(id).is_some() {
                    stream.todo.insert(id);
                }
            }
        }
        result
    }

    /// Evaluate only when `id` is unevaluated or dirty.
    pub fn var_eval(&mut self, id: VarId) -> Result<()> {
        let v = self.store.var(id);
        if !v.evaluated() || v.dirty {
            self.eval()?;
        }
        Ok(())
    }

    fn eval_inner(&mut self, skey: StreamKey, roots: &[VarId]) -> Result<()> {
        // 1. Close over unevaluated ancestors.
        let mut scheduled: BTreeSet<VarId> = BTreeSet::new();
        let mut stack: Vec<VarId> = roots.iter().copied().filter(|&id| !self.store.var(id).evaluated()).collect();
        while let Some(id) = stack.pop() {
            if !scheduled.insert(id) {
                continue;
            }
            let v = self.store.var(id);
            for dep in v.dep.into_iter().chain([v.extra_dep]) {
                if dep != 0 && !self.store.var(dep).evaluated() && !scheduled.contains(&dep) {
                    stack.push(dep);
                }
            }
        }

        if scheduled.is_empty() {
            self.finish(skey);
            return Ok(());
        }

        // 2. Partition by output size; iteration order of `scheduled` keeps
        // each partition sorted by id.
        let mut groups: BTreeMap<u32, Vec<VarId>> = BTreeMap::new();
        for &id in &scheduled {
            groups.entry(self.store.var(id).size).or_default().push(id);
        }

        // Completed release chains free up blocks for the output
        // allocations below.
        let reached = self.streams[&skey].signal.value();
        self.alloc.drain_releases(skey, reached);

        // 3.-5. Emit one kernel per partition and allocate its outputs.
        let mut plans = Vec::new();
        let build = (|| -> Result<()> {
            for (&size, members) in &groups {
                if let Some(plan) = self.build_kernel(skey, size, members)? {
                    plans.push(plan);
                }
            }
            Ok(())
        })();
        if let Err(err) = build {
            for plan in &plans {
                for &(_, addr) in &plan.stores {
                    let _ = self.alloc.free(addr, None);
                }
            }
            return Err(err);
        }
        debug!(kernels = plans.len(), scheduled = scheduled.len(), "eval");

        // 6. Dispatch. Kernels of one evaluation are independent by
        // construction; with parallel dispatch enabled they run concurrently.
        let (signal, final_fence) = {
            let stream = self.streams.get_mut(&skey).expect("active stream");
            let mut fence = stream.fence;
            for _ in &plans {
                fence = stream.next_fence();
            }
            (Arc::clone(&stream.signal), fence)
        };

        if self.parallel_dispatch && plans.len() > 1 {
            rayon::scope(|scope| {
                for plan in &plans {
                    scope.spawn(move |_| {
                        // SAFETY: argument addresses point at buffers that
                        // stay alive for the whole evaluation; independent
                        // kernels never write the same buffer.
                        unsafe { plan.kernel.execute(plan.size, &plan.args) };
                    });
                }
            });
        } else {
            for plan in &plans {
                // SAFETY: as above.
                unsafe { plan.kernel.execute(plan.size, &plan.args) };
            }
        }
        signal.signal(final_fence);

        // 7. Transition emitted variables.
        let mut dead = Vec::new();
        for plan in &plans {
            for &(id, addr) in &plan.stores {
                let (deps, extra) = self.store.materialize(id, addr, true);
                self.drop_dependencies(skey, deps, extra, &mut dead);
            }
            for &id in &plan.effects {
                let (deps, extra) = self.store.materialize(id, 0, false);
                self.drop_dependencies(skey, deps, extra, &mut dead);
                // Release the side-effect pin; running the kernel was the
                // variable's purpose.
                let todo = &mut self.streams.get_mut(&skey).expect("active stream").todo;
                self.store.dec_ref_ext(id, &mut dead, Some(todo));
            }
        }
        self.release_dead(dead);

        self.finish(skey);
        Ok(())
    }

    fn drop_dependencies(&mut self, skey: StreamKey, deps: [VarId; 3], extra: VarId, dead: &mut Vec<usize>) {
        let todo = &mut self.streams.get_mut(&skey).expect("active stream").todo;
        for dep in deps {
            self.store.dec_ref_int(dep, dead, Some(&mut *todo));
        }
        self.store.dec_ref_ext(extra, dead, Some(todo));
    }

    /// Recycle completed release chains and retire dirty flags: after an
    /// evaluation the stream is synchronized, so scatter targets are
    /// consistent again.
    fn finish(&mut self, skey: StreamKey) {
        let reached = self.streams[&skey].signal.value();
        self.alloc.drain_releases(skey, reached);
        self.store.clear_dirty();
    }

    /// Emit the kernel for one size class. Returns `None` when the
    /// partition produces neither stored outputs nor side effects.
    fn build_kernel(&mut self, skey: StreamKey, size: u32, members: &[VarId]) -> Result<Option<KernelPlan>> {
        // Kernel variables: the partition members plus inlined unevaluated
        // broadcast ancestors; evaluated dependencies become inputs.
        let mut slots: BTreeSet<VarId> = members.iter().copied().collect();
        let mut stack: Vec<VarId> = members.to_vec();
        while let Some(id) = stack.pop() {
            for dep in self.store.var(id).dep {
                if dep == 0 {
                    continue;
                }
                let dv = self.store.var(dep);
                if dv.evaluated() {
                    slots.insert(dep);
                } else if dv.size == 1 && size != 1 && slots.insert(dep) {
                    stack.push(dep);
                } else {
                    debug_assert!(
                        dv.size == size || slots.contains(&dep),
                        "unevaluated dependency outside its size class"
                    );
                }
            }
        }

        let reg_of: HashMap<VarId, u32> =
            slots.iter().enumerate().map(|(reg, &id)| (id, reg as u32)).collect();

        let mut source = String::new();
        let mut args: SmallVec<[usize; 8]> = SmallVec::new();
        for &id in &slots {
            let v = self.store.var(id);
            let reg = reg_of[&id];
            if v.direct_pointer {
                let _ = writeln!(source, "mov.ptr %r{reg}, arg{}", args.len());
                args.push(v.data);
            } else if v.evaluated() {
                let bcast = if v.size == 1 && size != 1 { ".bcast" } else { "" };
                let _ = writeln!(source, "ld.arg{bcast}.{} %r{reg}, arg{}", v.ty.name(), args.len());
                args.push(v.data);
            } else {
                let mut regs = [reg, 0, 0, 0];
                let mut types = [v.ty; 4];
                for (i, dep) in v.dep.into_iter().enumerate() {
                    if dep != 0 {
                        regs[i + 1] = reg_of[&dep];
                        types[i + 1] = self.store.var(dep).ty;
                    }
                }
                let stmt = self.store.var(id).stmt.as_deref().expect("unevaluated variable has a statement");
                let line = expand(stmt, &regs, &types);
                source.push_str(&line);
                source.push('\n');
            }
        }

        // Output stores: materialize every member some external holder can
        // still observe. Side-effect members run for their writes alone.
        let mut stores = Vec::new();
        let mut effects = Vec::new();
        let mut outputs: Vec<(VarId, VarType, usize)> = Vec::new();
        for &id in members {
            let v = self.store.var(id);
            if v.side_effect {
                effects.push(id);
            } else if v.ref_count_ext > 0 {
                outputs.push((id, v.ty, v.mem_size()));
            }
        }
        if outputs.is_empty() && effects.is_empty() {
            trace!(size, "partition has no observable outputs, skipped");
            return Ok(None);
        }
        for (id, ty, mem_size) in outputs {
            let addr = self.alloc.alloc(AllocType::Device, skey.device, mem_size)?;
            let _ = writeln!(source, "st.arg.{} arg{}, %r{}", ty.name(), args.len(), reg_of[&id]);
            args.push(addr);
            stores.push((id, addr));
        }

        let kernel = self.kernels.get_or_compile(skey.device, &source)?;
        Ok(Some(KernelPlan { kernel, size, args, stores, effects }))
    }
}
