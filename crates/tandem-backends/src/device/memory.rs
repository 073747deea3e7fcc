//! Device buffer storage.
//!
//! Elements are `f32` bit patterns held in `AtomicU32`, so any number of
//! workers can load, store and accumulate into the same buffer without
//! locking. Ordering between dispatches comes from the device barrier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{BufferBinding, BufferHandle};
use crate::error::{BackendError, Result};
use crate::kernel::{BindingId, KernelMemory, MemoryFault, MAX_BINDINGS};

/// A fixed-length array of floats shared between workers.
#[derive(Debug)]
pub struct DeviceBuffer {
    label: String,
    data: Box<[AtomicU32]>,
}

impl DeviceBuffer {
    pub fn new(label: &str, len: usize) -> Self {
        Self {
            label: label.to_string(),
            data: (0..len).map(|_| AtomicU32::new(0.0f32.to_bits())).collect(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn element(&self, index: i32) -> Option<&AtomicU32> {
        usize::try_from(index).ok().and_then(|i| self.data.get(i))
    }

    pub fn write(&self, offset: usize, values: &[f32]) -> Result<()> {
        let end = offset.checked_add(values.len()).filter(|&end| end <= self.len());
        let Some(end) = end else {
            return Err(BackendError::BufferOutOfBounds {
                offset,
                size: values.len(),
                buffer_size: self.len(),
            });
        };
        for (slot, value) in self.data[offset..end].iter().zip(values) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn read(&self, out: &mut [f32]) -> Result<()> {
        if out.len() > self.len() {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: out.len(),
                buffer_size: self.len(),
            });
        }
        for (value, slot) in out.iter_mut().zip(self.data.iter()) {
            *value = f32::from_bits(slot.load(Ordering::Relaxed));
        }
        Ok(())
    }

    pub fn fill(&self, value: f32) {
        let bits = value.to_bits();
        for slot in self.data.iter() {
            slot.store(bits, Ordering::Relaxed);
        }
    }
}

/// Buffer table of a device.
#[derive(Debug)]
pub struct MemoryManager {
    buffers: HashMap<u64, Arc<DeviceBuffer>>,
    next_buffer_id: u64,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_buffer_id: 1,
        }
    }

    pub fn allocate(&mut self, label: &str, len: usize) -> BufferHandle {
        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(id, Arc::new(DeviceBuffer::new(label, len)));
        BufferHandle::new(id)
    }

    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        match self.buffers.remove(&handle.id()) {
            Some(_) => Ok(()),
            None => Err(BackendError::InvalidBufferHandle(handle.id())),
        }
    }

    pub fn get(&self, handle: BufferHandle) -> Result<&Arc<DeviceBuffer>> {
        self.buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Resolve the bindings of one dispatch.
    pub(crate) fn bind(&self, bindings: &[BufferBinding]) -> Result<BoundBuffers> {
        let mut bound = BoundBuffers::default();
        for binding in bindings {
            let buffer = self.get(binding.buffer)?;
            let slot = bound
                .slots
                .get_mut(usize::from(binding.binding.0))
                .ok_or(BackendError::UnknownBinding(binding.binding))?;
            *slot = Some(Arc::clone(buffer));
        }
        Ok(bound)
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffers attached to binding slots for a single dispatch.
#[derive(Debug, Default)]
pub(crate) struct BoundBuffers {
    slots: [Option<Arc<DeviceBuffer>>; MAX_BINDINGS],
    fault: Mutex<Option<MemoryFault>>,
}

impl BoundBuffers {
    fn element(&self, binding: BindingId, index: i32) -> Option<&AtomicU32> {
        let buffer = self.slots.get(usize::from(binding.0)).and_then(Option::as_ref);
        let element = buffer.and_then(|buffer| buffer.element(index));
        if element.is_none() {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(MemoryFault {
                    binding,
                    index: i64::from(index),
                    len: buffer.map_or(0, |buffer| buffer.len()),
                });
            }
        }
        element
    }

    pub(crate) fn take_fault(&self) -> Option<MemoryFault> {
        self.fault.lock().take()
    }
}

impl KernelMemory for BoundBuffers {
    fn load(&self, binding: BindingId, index: i32) -> f32 {
        self.element(binding, index)
            .map_or(0.0, |slot| f32::from_bits(slot.load(Ordering::Relaxed)))
    }

    fn store(&self, binding: BindingId, index: i32, value: f32) {
        if let Some(slot) = self.element(binding, index) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    fn atomic_add(&self, binding: BindingId, index: i32, value: f32) {
        if let Some(slot) = self.element(binding, index) {
            let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f32::from_bits(bits) + value).to_bits())
            });
        }
    }
}
