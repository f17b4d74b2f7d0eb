//! Kernel invocation: launch validation, program-scope storage and the
//! work-group dispatch loop.
//!
//! Work-groups are independent units of work. They are handed out from a
//! shared counter to a fixed pool of workers, each of which builds, runs and
//! drops one group at a time.

use crate::context::Context;
use crate::diagnostic::{Diagnostic, EntityCoords};
use crate::error::{Result, SimError};
use crate::ir::{AddressSpace, GlobalId, Module};
use crate::kernel::Kernel;
use crate::launch::{LaunchConfig, Size3};
use crate::memory::MemFlags;
use crate::plugin::Allocation;
use crate::workgroup::WorkGroup;
use clgrind_tracing::perf_span;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Totals reported when an invocation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvocationSummary {
    pub groups_executed: u64,
    pub work_items_executed: u64,
    pub instructions_executed: u64,
    /// Diagnostics surfaced by the context during this invocation
    pub diagnostics: usize,
    /// Error diagnostics recorded during this invocation
    pub errors: usize,
    pub duration_us: u64,
}

/// Clears the context's active flag when the invocation ends, however it
/// ends.
struct InvocationGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InvocationGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SimError::InvocationInProgress)?;
        Ok(Self { flag })
    }
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One running kernel launch.
pub struct KernelInvocation<'c> {
    context: &'c Context,
    kernel: &'c Kernel,
    launch: LaunchConfig,
    num_groups: Size3,
    num_workers: usize,
    globals: Vec<Option<u64>>,
    groups_executed: AtomicU64,
    work_items_executed: AtomicU64,
    instructions_executed: AtomicU64,
}

impl<'c> KernelInvocation<'c> {
    /// Validate and execute `kernel` over `launch` on `context`.
    pub(crate) fn run(context: &'c Context, kernel: &'c Kernel, launch: LaunchConfig) -> Result<InvocationSummary> {
        let _guard = InvocationGuard::acquire(&context.invocation_active)?;

        kernel.validate_args()?;
        launch.validate(kernel.info().uniform_work_groups)?;
        if let Some(required) = kernel.info().required_work_group_size {
            if launch.local_size != Size3::from(required) {
                return Err(SimError::invalid_launch(format!(
                    "kernel requires work-group size {} but launch uses {}",
                    Size3::from(required),
                    launch.local_size
                )));
            }
        }

        let num_workers = if context.plugins().all_thread_safe() {
            context.config().num_workers.max(1)
        } else {
            1
        };

        let mut invocation = Self {
            context,
            kernel,
            launch,
            num_groups: launch.num_groups(),
            num_workers,
            globals: vec![None; kernel.module().globals.len()],
            groups_executed: AtomicU64::new(0),
            work_items_executed: AtomicU64::new(0),
            instructions_executed: AtomicU64::new(0),
        };

        let diagnostics_before = context.diagnostic_count();
        let errors_before = context.error_count();
        let span = perf_span!(
            "kernel_invocation",
            kernel = kernel.name(),
            groups = invocation.num_groups.volume(),
            workers = num_workers
        );

        if let Err(err) = invocation.allocate_globals() {
            invocation.release_globals();
            return Err(err);
        }
        context.set_active_kernel(Some(kernel.name()));
        context.plugins().kernel_begin(&invocation);

        let dispatched = invocation.dispatch();

        context.plugins().kernel_end(&invocation);
        invocation.release_globals();
        context.set_active_kernel(None);
        dispatched?;

        let summary = InvocationSummary {
            groups_executed: invocation.groups_executed.load(Ordering::Relaxed),
            work_items_executed: invocation.work_items_executed.load(Ordering::Relaxed),
            instructions_executed: invocation.instructions_executed.load(Ordering::Relaxed),
            diagnostics: context.diagnostic_count().saturating_sub(diagnostics_before),
            errors: context.error_count().saturating_sub(errors_before),
            duration_us: span.elapsed_us(),
        };
        clgrind_tracing::performance::record_kernel_invocation(
            kernel.name(),
            summary.groups_executed,
            summary.work_items_executed,
            num_workers,
            summary.duration_us,
        );
        tracing::info!(
            kernel = kernel.name(),
            groups = summary.groups_executed,
            work_items = summary.work_items_executed,
            errors = summary.errors,
            "kernel invocation complete"
        );
        Ok(summary)
    }

    pub fn context(&self) -> &'c Context {
        self.context
    }

    pub fn kernel(&self) -> &'c Kernel {
        self.kernel
    }

    pub fn module(&self) -> &'c Module {
        self.kernel.module()
    }

    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn num_groups(&self) -> Size3 {
        self.num_groups
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn kernel_name(&self) -> &'c str {
        self.kernel.name()
    }

    /// Address of a global or constant program-scope variable.
    pub fn global_address(&self, id: GlobalId) -> Option<u64> {
        self.globals.get(id.index()).copied().flatten()
    }

    // ============================================================================================
    // Program-Scope Storage
    // ============================================================================================

    fn allocate_globals(&mut self) -> Result<()> {
        let memory = self.context.global_memory();
        for (index, global) in self.module().globals.iter().enumerate() {
            if global.space == AddressSpace::Local {
                continue;
            }
            let size = global.ty.size_bytes().max(1);
            let flags = if global.space == AddressSpace::Constant {
                MemFlags::READ_ONLY
            } else {
                MemFlags::empty()
            };
            let address = memory.allocate(size, flags)?;
            if let Some(init) = &global.initializer {
                memory.host_write(address, init)?;
            }
            self.context.plugins().memory_allocated(&Allocation {
                memory,
                address,
                size,
                flags,
                init: global.initializer.as_deref(),
                owner: None,
            });
            self.globals[index] = Some(address);
        }
        Ok(())
    }

    fn release_globals(&mut self) {
        let memory = self.context.global_memory();
        for address in self.globals.iter_mut().filter_map(Option::take) {
            if let Err(err) = memory.deallocate(address) {
                tracing::warn!(error = %err, address, "failed to release program-scope variable");
                continue;
            }
            self.context.plugins().memory_deallocated(memory, address, None);
        }
    }

    // ============================================================================================
    // Dispatch
    // ============================================================================================

    /// Linear indices of the groups this invocation executes.
    fn schedule(&self) -> Vec<usize> {
        let total = self.num_groups.volume();
        if self.context.config().quick && total > 2 {
            vec![0, total - 1]
        } else {
            (0..total).collect()
        }
    }

    fn dispatch(&self) -> Result<()> {
        let schedule = self.schedule();
        let next = AtomicUsize::new(0);

        if self.num_workers == 1 {
            self.worker_loop(0, &schedule, &next);
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_workers)
            .thread_name(|i| format!("clgrind-worker-{i}"))
            .build()
            .map_err(|err| SimError::WorkerPool(err.to_string()))?;

        pool.scope(|scope| {
            for worker in 0..self.num_workers {
                let (schedule, next) = (&schedule, &next);
                scope.spawn(move |_| self.worker_loop(worker, schedule, next));
            }
        });
        Ok(())
    }

    fn worker_loop(&self, worker: usize, schedule: &[usize], next: &AtomicUsize) {
        loop {
            if self.context.config().stop_on_error && self.context.error_seen() {
                tracing::debug!(worker, "error seen, stopping dispatch");
                return;
            }
            let Some(&index) = schedule.get(next.fetch_add(1, Ordering::Relaxed)) else {
                return;
            };
            self.run_group(Size3::unflatten(index, self.num_groups), worker);
        }
    }

    fn run_group(&self, group_id: Size3, worker: usize) {
        let span = perf_span!("run_group", worker = worker);
        let mut group = match WorkGroup::new(self, group_id, worker) {
            Ok(group) => group,
            Err(err) => {
                self.context.log(
                    Diagnostic::from_error(&err).with_entity(EntityCoords::WorkGroup { group: group_id }),
                );
                return;
            }
        };

        let stats = group.run(self);
        self.groups_executed.fetch_add(1, Ordering::Relaxed);
        self.work_items_executed.fetch_add(stats.work_items as u64, Ordering::Relaxed);
        self.instructions_executed.fetch_add(stats.instructions, Ordering::Relaxed);
        clgrind_tracing::performance::record_work_group(
            group.group_index(),
            stats.work_items,
            stats.instructions,
            span.elapsed_us(),
        );
    }
}

impl std::fmt::Debug for KernelInvocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelInvocation")
            .field("kernel", &self.kernel.name())
            .field("launch", &self.launch)
            .field("num_groups", &self.num_groups)
            .field("num_workers", &self.num_workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use crate::ir::{FunctionBuilder, KernelArgInfo, ModuleBuilder, Type};
    use std::sync::Arc;

    fn empty_kernel(uniform: bool) -> Kernel {
        let mut module = ModuleBuilder::new("test");
        let mut f = FunctionBuilder::new("noop", &[], Type::Void);
        f.ret_void();
        module.add_kernel(f.finish(), Vec::<KernelArgInfo>::new(), uniform);
        Kernel::new(Arc::new(module.build().unwrap()), "noop").unwrap()
    }

    #[test]
    fn test_runs_every_group() {
        let context = Context::new(SimulatorConfig::serial());
        let kernel = empty_kernel(false);
        let summary = context.run_kernel(&kernel, LaunchConfig::new_1d(10, 4)).unwrap();
        assert_eq!(summary.groups_executed, 3);
        assert_eq!(summary.work_items_executed, 10);
        assert_eq!(summary.errors, 0);
        assert!(!context.invocation_active.load(Ordering::Acquire));
    }

    #[test]
    fn test_uniform_launch_rejected() {
        let context = Context::new(SimulatorConfig::serial());
        let kernel = empty_kernel(true);
        let err = context.run_kernel(&kernel, LaunchConfig::new_1d(8, 3)).unwrap_err();
        assert!(matches!(err, SimError::InvalidLaunch(_)));
        assert!(!context.invocation_active.load(Ordering::Acquire));
    }

    #[test]
    fn test_quick_mode_runs_first_and_last() {
        let context = Context::new(SimulatorConfig {
            quick: true,
            ..SimulatorConfig::serial()
        });
        let kernel = empty_kernel(false);
        let summary = context.run_kernel(&kernel, LaunchConfig::new_1d(16, 2)).unwrap();
        assert_eq!(summary.groups_executed, 2);
        assert_eq!(summary.work_items_executed, 4);
    }

    #[test]
    fn test_parallel_workers() {
        let context = Context::new(SimulatorConfig::default().with_workers(4));
        let kernel = empty_kernel(false);
        let summary = context.run_kernel(&kernel, LaunchConfig::new_1d(64, 4)).unwrap();
        assert_eq!(summary.groups_executed, 16);
        assert_eq!(summary.work_items_executed, 64);
    }

    #[test]
    fn test_concurrent_invocation_rejected() {
        let context = Context::new(SimulatorConfig::serial());
        let _guard = InvocationGuard::acquire(&context.invocation_active).unwrap();
        let kernel = empty_kernel(false);
        assert!(matches!(
            context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)),
            Err(SimError::InvocationInProgress)
        ));
    }
}
