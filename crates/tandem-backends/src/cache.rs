//! Process-wide kernel cache.
//!
//! Compiled kernels are keyed by everything that shapes their source: the
//! phase they implement, the device that compiled them, the batch size, the
//! element count they cover, the full source text, and (for activations)
//! whether rows are processed as a unit. Entries are created lazily and
//! never evicted.
//!
//! ```text
//! use tandem_backends::cache::{KernelCache, KernelKey};
//!
//! static FORWARD: KernelCache = KernelCache::new();
//!
//! let kernel = FORWARD.get_or_try_insert(&key, || device.compile(&module))?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::Result;
use crate::kernel::CompiledKernel;

/// Training phase a kernel implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Clear,
    Forward,
    Activation,
    ActivationBackward,
    Evaluate,
    Backward,
    Normalize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub kind: KernelKind,
    pub device: &'static str,
    pub batch_size: usize,
    /// Outputs for forward/activation/evaluate kernels, weights for backward.
    pub extent: usize,
    pub source: Arc<str>,
    pub interdependent: bool,
}

/// Thread-safe map from [`KernelKey`] to compiled kernels.
///
/// Compilation happens under the write lock after a second lookup, so a key
/// is compiled at most once even when threads race on a cold entry.
#[derive(Debug)]
pub struct KernelCache {
    kernels: OnceLock<RwLock<HashMap<KernelKey, Arc<CompiledKernel>>>>,
    compilations: AtomicU64,
}

impl KernelCache {
    pub const fn new() -> Self {
        Self {
            kernels: OnceLock::new(),
            compilations: AtomicU64::new(0),
        }
    }

    fn map(&self) -> &RwLock<HashMap<KernelKey, Arc<CompiledKernel>>> {
        self.kernels.get_or_init(|| RwLock::new(HashMap::new()))
    }

    /// Return the cached kernel for `key`, compiling it with `compile` on a miss.
    pub fn get_or_try_insert<F>(&self, key: &KernelKey, compile: F) -> Result<Arc<CompiledKernel>>
    where
        F: FnOnce() -> Result<Arc<CompiledKernel>>,
    {
        let map = self.map();

        if let Some(kernel) = map.read().get(key) {
            return Ok(Arc::clone(kernel));
        }

        let mut write_guard = map.write();
        if let Some(kernel) = write_guard.get(key) {
            return Ok(Arc::clone(kernel));
        }

        tracing::debug!(kind = ?key.kind, batch = key.batch_size, extent = key.extent, "kernel cache miss");
        let kernel = compile()?;
        self.compilations.fetch_add(1, Ordering::Relaxed);
        write_guard.insert(key.clone(), Arc::clone(&kernel));
        Ok(kernel)
    }

    pub fn get(&self, key: &KernelKey) -> Option<Arc<CompiledKernel>> {
        self.kernels.get().and_then(|map| map.read().get(key).cloned())
    }

    pub fn contains(&self, key: &KernelKey) -> bool {
        self.kernels.get().is_some_and(|map| map.read().contains_key(key))
    }

    /// Number of compilations performed through this cache.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.kernels.get().map_or(0, |map| map.read().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::kernel::{compile, KernelBuilder, KernelModule};
    use crate::launch::WorkgroupSize;
    use std::sync::atomic::AtomicUsize;

    fn key(source: &str) -> KernelKey {
        KernelKey {
            kind: KernelKind::Forward,
            device: "test",
            batch_size: 4,
            extent: 8,
            source: Arc::from(source),
            interdependent: false,
        }
    }

    fn empty_kernel(name: &str) -> Result<Arc<CompiledKernel>> {
        let module = KernelModule::new(name, WorkgroupSize::new(1, 1)).with_body(KernelBuilder::new().finish());
        compile(&module).map(Arc::new)
    }

    #[test]
    fn second_lookup_reuses_the_first_compilation() {
        let cache = KernelCache::new();
        let first = cache.get_or_try_insert(&key("a"), || empty_kernel("first")).unwrap();
        let second = cache.get_or_try_insert(&key("a"), || empty_kernel("second")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name(), "first");
        assert_eq!(cache.compilations(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn every_key_field_distinguishes_entries() {
        let cache = KernelCache::new();
        let base = key("a");
        let variants = [
            KernelKey {
                batch_size: 5,
                ..base.clone()
            },
            KernelKey {
                extent: 9,
                ..base.clone()
            },
            KernelKey {
                interdependent: true,
                ..base.clone()
            },
            KernelKey {
                kind: KernelKind::Backward,
                ..base.clone()
            },
            key("b"),
            base,
        ];
        for variant in &variants {
            cache.get_or_try_insert(variant, || empty_kernel("k")).unwrap();
        }
        assert_eq!(cache.len(), variants.len());
    }

    #[test]
    fn failed_compilation_is_not_cached() {
        let cache = KernelCache::new();
        let result = cache.get_or_try_insert(&key("bad"), || Err(BackendError::invalid_launch("boom")));
        assert!(result.is_err());
        assert!(!cache.contains(&key("bad")));
        assert!(cache.get_or_try_insert(&key("bad"), || empty_kernel("ok")).is_ok());
    }

    #[test]
    fn racing_threads_compile_once() {
        let cache = KernelCache::new();
        let calls = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .get_or_try_insert(&key("shared"), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            empty_kernel("shared")
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
