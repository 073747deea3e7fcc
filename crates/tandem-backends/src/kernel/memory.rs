//! Buffer access for running kernels.
//!
//! Accesses follow robust-buffer-access rules: an out-of-range load yields
//! `0.0`, an out-of-range store or atomic add is dropped, and the first such
//! access is remembered so the caller can turn it into an error after the
//! dispatch.

use std::cell::Cell;

use super::{BindingId, MAX_BINDINGS};
use crate::error::{BackendError, Result};

/// Storage seen by a running kernel.
pub trait KernelMemory {
    fn load(&self, binding: BindingId, index: i32) -> f32;
    fn store(&self, binding: BindingId, index: i32, value: f32);
    fn atomic_add(&self, binding: BindingId, index: i32, value: f32);
}

/// First out-of-range access observed during a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFault {
    pub binding: BindingId,
    pub index: i64,
    pub len: usize,
}

impl MemoryFault {
    pub fn into_error(self, kernel: &str) -> BackendError {
        BackendError::KernelOutOfBounds {
            kernel: kernel.to_string(),
            binding: self.binding,
            index: self.index,
            len: self.len,
        }
    }
}

/// Host slices bound to binding slots, for single-threaded execution.
///
/// The same slice may be bound to several slots; `Cell` makes that aliasing
/// sound.
#[derive(Debug, Default)]
pub struct SliceMemory<'a> {
    slots: [Option<&'a [Cell<f32>]>; MAX_BINDINGS],
    fault: Cell<Option<MemoryFault>>,
}

impl<'a> SliceMemory<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, binding: BindingId, data: &'a [Cell<f32>]) -> Self {
        if let Some(slot) = self.slots.get_mut(binding.0 as usize) {
            *slot = Some(data);
        }
        self
    }

    pub fn fault(&self) -> Option<MemoryFault> {
        self.fault.get()
    }

    /// Report the first recorded fault as an error naming `kernel`.
    pub fn check(&self, kernel: &str) -> Result<()> {
        match self.fault.get() {
            Some(fault) => Err(fault.into_error(kernel)),
            None => Ok(()),
        }
    }

    fn cell(&self, binding: BindingId, index: i32) -> Option<&'a Cell<f32>> {
        let data = self.slots.get(binding.0 as usize).copied().flatten();
        let cell = data.and_then(|data| usize::try_from(index).ok().and_then(|i| data.get(i)));
        if cell.is_none() && self.fault.get().is_none() {
            self.fault.set(Some(MemoryFault {
                binding,
                index: i64::from(index),
                len: data.map_or(0, <[Cell<f32>]>::len),
            }));
        }
        cell
    }
}

impl KernelMemory for SliceMemory<'_> {
    fn load(&self, binding: BindingId, index: i32) -> f32 {
        self.cell(binding, index).map_or(0.0, Cell::get)
    }

    fn store(&self, binding: BindingId, index: i32, value: f32) {
        if let Some(cell) = self.cell(binding, index) {
            cell.set(value);
        }
    }

    fn atomic_add(&self, binding: BindingId, index: i32, value: f32) {
        if let Some(cell) = self.cell(binding, index) {
            cell.set(cell.get() + value);
        }
    }
}

/// View a mutable slice as cells so it can be bound more than once.
pub fn as_cells(data: &mut [f32]) -> &[Cell<f32>] {
    Cell::from_mut(data).as_slice_of_cells()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliased_slots_see_each_others_writes() {
        let mut data = vec![1.0, 2.0, 3.0];
        let cells = as_cells(&mut data);
        let memory = SliceMemory::new().bind(BindingId(0), cells).bind(BindingId(1), cells);

        memory.store(BindingId(0), 1, 5.0);
        memory.atomic_add(BindingId(1), 1, 0.5);
        assert_eq!(memory.load(BindingId(0), 1), 5.5);
        assert!(memory.check("alias").is_ok());
        assert_eq!(data, vec![1.0, 5.5, 3.0]);
    }

    #[test]
    fn out_of_range_access_records_first_fault() {
        let mut data = vec![0.0; 4];
        let memory = SliceMemory::new().bind(BindingId(2), as_cells(&mut data));

        assert_eq!(memory.load(BindingId(2), 9), 0.0);
        memory.store(BindingId(2), -1, 1.0);
        assert_eq!(
            memory.fault(),
            Some(MemoryFault {
                binding: BindingId(2),
                index: 9,
                len: 4
            })
        );
        assert!(matches!(
            memory.check("probe"),
            Err(BackendError::KernelOutOfBounds { index: 9, len: 4, .. })
        ));
    }

    #[test]
    fn unbound_slot_faults_with_zero_length() {
        let memory = SliceMemory::new();
        memory.atomic_add(BindingId(3), 0, 1.0);
        assert_eq!(memory.fault().map(|f| f.len), Some(0));
    }
}
