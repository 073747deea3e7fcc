//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tandem_core::{Backend, CpuNetwork, GpuNetwork, Network, NetworkLayout, Result};

/// The same layout on both backends.
pub fn both(layout: NetworkLayout, batch_size: usize) -> Result<(CpuNetwork, GpuNetwork)> {
    tandem_tracing::init_test_tracing();
    let layout = Arc::new(layout);
    Ok((
        CpuNetwork::new(Arc::clone(&layout), batch_size)?,
        GpuNetwork::new(layout, batch_size)?,
    ))
}

/// Stage one batch row of inputs.
pub fn set_row<B: Backend>(network: &mut Network<B>, bi: usize, values: &[f32]) -> Result<()> {
    for (ni, &value) in values.iter().enumerate() {
        network.set_input(bi, ni, value)?;
    }
    Ok(())
}

pub fn set_target_row<B: Backend>(network: &mut Network<B>, bi: usize, values: &[f32]) -> Result<()> {
    for (no, &value) in values.iter().enumerate() {
        network.set_target(bi, no, value)?;
    }
    Ok(())
}

/// Fill every input and target with uniform noise from `seed`.
pub fn fill_random<B: Backend>(network: &mut Network<B>, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let layout = Arc::clone(network.layout());
    for bi in 0..network.batch_size() {
        for ni in 0..layout.num_inputs() {
            network.set_input(bi, ni, rng.gen_range(-1.0..1.0))?;
        }
        for no in 0..layout.num_outputs() {
            network.set_target(bi, no, rng.gen_range(0.0..1.0))?;
        }
    }
    Ok(())
}
