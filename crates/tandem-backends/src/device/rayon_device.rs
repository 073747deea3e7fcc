//! Multi-threaded host device.
//!
//! Workgroups are distributed over a rayon pool; the lanes of one workgroup
//! run in order on the worker that owns it, sharing one local frame.
//! Atomic adds are compare-and-swap loops on the `f32` bit pattern.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tandem_tracing::{perf_event, perf_span};

use super::memory::MemoryManager;
use super::{BufferBinding, BufferHandle, ComputeDevice, DeviceConfig};
use crate::error::Result;
use crate::kernel::{self, CompiledKernel, KernelMemory, KernelModule, Scalar};
use crate::launch::{GridDim, LaunchConfig};

#[derive(Debug)]
pub struct RayonDevice {
    memory: RwLock<MemoryManager>,
    pool: Option<ThreadPool>,
}

impl RayonDevice {
    /// Device on rayon's global pool.
    pub fn new() -> Self {
        Self {
            memory: RwLock::new(MemoryManager::new()),
            pool: None,
        }
    }

    pub fn with_config(config: &DeviceConfig) -> Result<Self> {
        let pool = match config.threads {
            Some(threads) => Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("tandem-device-{i}"))
                    .build()?,
            ),
            None => None,
        };
        tracing::debug!(threads = ?config.threads, "created rayon device");
        Ok(Self {
            memory: RwLock::new(MemoryManager::new()),
            pool,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::with_config(&DeviceConfig::from_env())
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, ThreadPool::current_num_threads)
    }

    pub fn buffer_count(&self) -> usize {
        self.memory.read().buffer_count()
    }
}

impl Default for RayonDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for RayonDevice {
    fn kind(&self) -> &'static str {
        "rayon"
    }

    fn allocate(&self, label: &str, len: usize) -> Result<BufferHandle> {
        let handle = self.memory.write().allocate(label, len);
        tracing::trace!(%handle, label, len, "allocated buffer");
        Ok(handle)
    }

    fn free(&self, handle: BufferHandle) -> Result<()> {
        self.memory.write().free(handle)
    }

    fn buffer_len(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.memory.read().get(handle)?.len())
    }

    fn write(&self, handle: BufferHandle, offset: usize, data: &[f32]) -> Result<()> {
        self.memory.read().get(handle)?.write(offset, data)
    }

    fn read(&self, handle: BufferHandle, out: &mut [f32]) -> Result<()> {
        self.memory.read().get(handle)?.read(out)
    }

    fn fill(&self, handle: BufferHandle, value: f32) -> Result<()> {
        self.memory.read().get(handle)?.fill(value);
        Ok(())
    }

    fn compile(&self, module: &KernelModule) -> Result<Arc<CompiledKernel>> {
        let kernel = kernel::compile(module)?;
        perf_event!("kernel_compiled", kernel = module.name.as_str(), device = self.kind());
        Ok(Arc::new(kernel))
    }

    fn dispatch(
        &self,
        kernel: &CompiledKernel,
        extent: GridDim,
        uniforms: &[Scalar],
        bindings: &[BufferBinding],
    ) -> Result<()> {
        kernel.check_uniforms(uniforms)?;
        let launch = LaunchConfig::covering(extent, kernel.workgroup());
        launch.validate()?;
        if extent.total() == 0 {
            return Ok(());
        }

        let memory = self.memory.read().bind(bindings)?;
        let _span = perf_span!("rayon_dispatch", kernel = kernel.name(), lanes = launch.total_lanes());
        tracing::trace!(kernel = kernel.name(), %launch, "dispatch");

        let (groups_x, _) = launch.workgroups();
        let workgroup = launch.workgroup;
        let groups_x = u64::from(groups_x);
        let run = || {
            (0..launch.total_workgroups())
                .into_par_iter()
                .for_each_init(
                    || kernel.new_frame(),
                    |frame, group| {
                        // Group ids fit in u32 per axis, so both casts are lossless.
                        let base_x = (group % groups_x) as u32 * workgroup.x;
                        let base_y = (group / groups_x) as u32 * workgroup.y;
                        let memory: &dyn KernelMemory = &memory;
                        for lane_y in 0..workgroup.y {
                            for lane_x in 0..workgroup.x {
                                kernel.invoke(
                                    frame,
                                    [base_x.wrapping_add(lane_x), base_y.wrapping_add(lane_y)],
                                    uniforms,
                                    memory,
                                );
                            }
                        }
                    },
                );
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }

        match memory.take_fault() {
            Some(fault) => Err(fault.into_error(kernel.name())),
            None => Ok(()),
        }
    }

    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::kernel::{Access, Axis, BindingId, Expr, KernelBuilder, ScalarType, UniformId};
    use crate::launch::WorkgroupSize;

    const OUT: BindingId = BindingId(0);
    const COUNT: UniformId = UniformId(0);

    fn counting_module(workgroup: WorkgroupSize) -> KernelModule {
        let mut k = KernelBuilder::new();
        let x = k.let_int("x", Expr::invocation(Axis::X));
        let y = k.let_int("y", Expr::invocation(Axis::Y));
        k.return_if(x.clone().greater_equal(Expr::uniform(COUNT)));
        k.atomic_add(OUT, x + y * Expr::uniform(COUNT), 1.0f32);
        KernelModule::new("count", workgroup)
            .binding(OUT, "hits", Access::ReadWrite)
            .uniform(COUNT, "width", ScalarType::Int)
            .with_body(k.finish())
    }

    #[test]
    fn every_invocation_runs_exactly_once() {
        let device = RayonDevice::new();
        let kernel = device.compile(&counting_module(WorkgroupSize::new(8, 4))).unwrap();
        let hits = device.allocate("hits", 13 * 9).unwrap();

        device
            .dispatch(
                &kernel,
                GridDim::new(13, 9),
                &[Scalar::Int(13)],
                &[BufferBinding::new(OUT, hits)],
            )
            .unwrap();
        device.barrier();

        assert!(device.read_vec(hits).unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn overshoot_lanes_past_the_buffer_fault() {
        let device = RayonDevice::new();
        let mut k = KernelBuilder::new();
        k.store(OUT, Expr::invocation(Axis::X), 2.0f32);
        let module = KernelModule::new("unguarded", WorkgroupSize::new(4, 1))
            .binding(OUT, "out", Access::WriteOnly)
            .with_body(k.finish());
        let kernel = device.compile(&module).unwrap();
        let out = device.allocate("out", 6).unwrap();

        let result = device.dispatch(&kernel, GridDim::linear(6), &[], &[BufferBinding::new(OUT, out)]);
        assert!(matches!(
            result,
            Err(BackendError::KernelOutOfBounds { len: 6, index, .. }) if index == 6 || index == 7
        ));
        assert_eq!(device.read_vec(out).unwrap(), vec![2.0; 6]);
    }

    #[test]
    fn contended_atomic_adds_are_not_lost() {
        let device = RayonDevice::with_config(&DeviceConfig { threads: Some(4) }).unwrap();
        assert_eq!(device.threads(), 4);
        let mut k = KernelBuilder::new();
        k.atomic_add(OUT, 0, 0.5f32);
        let module = KernelModule::new("sum", WorkgroupSize::new(64, 1))
            .binding(OUT, "sum", Access::ReadWrite)
            .with_body(k.finish());
        let kernel = device.compile(&module).unwrap();
        let sum = device.allocate("sum", 1).unwrap();

        device
            .dispatch(&kernel, GridDim::linear(4096), &[], &[BufferBinding::new(OUT, sum)])
            .unwrap();
        device.barrier();

        assert_eq!(device.read_vec(sum).unwrap(), vec![2048.0]);
    }

    #[test]
    fn dispatch_checks_uniforms_and_handles() {
        let device = RayonDevice::new();
        let kernel = device.compile(&counting_module(WorkgroupSize::new(4, 1))).unwrap();
        let hits = device.allocate("hits", 4).unwrap();
        let binding = [BufferBinding::new(OUT, hits)];

        assert!(matches!(
            device.dispatch(&kernel, GridDim::linear(4), &[Scalar::Float(1.0)], &binding),
            Err(BackendError::UniformMismatch { .. })
        ));

        device.free(hits).unwrap();
        assert!(matches!(
            device.dispatch(&kernel, GridDim::linear(4), &[Scalar::Int(4)], &binding),
            Err(BackendError::InvalidBufferHandle(_))
        ));
    }

    #[test]
    fn empty_extent_is_a_no_op() {
        let device = RayonDevice::new();
        let kernel = device.compile(&counting_module(WorkgroupSize::new(4, 1))).unwrap();
        assert!(device.dispatch(&kernel, GridDim::new(0, 3), &[Scalar::Int(0)], &[]).is_ok());
    }
}
