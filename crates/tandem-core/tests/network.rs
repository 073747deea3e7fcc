//! Network construction, staging and inspection on both backends.

mod common;

use std::sync::Arc;

use tandem_backends::{ComputeDevice, DeviceConfig, KernelKind, RayonDevice};
use tandem_core::activation::{Identity, Sigmoid, SoftMax};
use tandem_core::layers::{Conv1d, FullyConnected};
use tandem_core::network::kernel_cache;
use tandem_core::{Backend, CpuNetwork, Error, GpuNetwork, LearningParams, Network, NetworkLayout, Result};

fn classifier() -> Result<NetworkLayout> {
    NetworkLayout::new()
        .with_layer(FullyConnected::new(4, 6, Sigmoid)?)?
        .with_layer(FullyConnected::new(6, 3, SoftMax::new())?)
}

// ============================================================================
// Prediction
// ============================================================================

fn predict_twice<B: Backend>(network: &mut Network<B>) -> Result<()> {
    network.initialize_weights(5)?;
    common::fill_random(network, 9)?;
    network.predict()?;
    let first = network.inspect_activated()?;
    network.predict()?;
    assert_eq!(first, network.inspect_activated()?);
    Ok(())
}

#[test]
fn test_predict_is_idempotent() -> Result<()> {
    let (mut cpu, mut gpu) = common::both(classifier()?, 3)?;
    predict_twice(&mut cpu)?;
    predict_twice(&mut gpu)?;
    Ok(())
}

fn softmax_rows<B: Backend>(network: &mut Network<B>) -> Result<()> {
    network.initialize_weights(8)?;
    common::fill_random(network, 4)?;
    network.predict()?;
    let outputs = network.inspect_outputs()?;
    assert_eq!(outputs.len(), network.batch_size() * 3);
    for row in outputs.chunks(3) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "row {row:?} sums to {sum}");
        assert!(row.iter().all(|&p| p > 0.0));
    }
    Ok(())
}

#[test]
fn test_outputs_are_the_last_layer_rows() -> Result<()> {
    let (mut cpu, mut gpu) = common::both(classifier()?, 4)?;
    softmax_rows(&mut cpu)?;
    softmax_rows(&mut gpu)?;

    let activated = cpu.inspect_activated()?;
    assert_eq!(cpu.inspect_outputs()?, activated[6 * 4..]);
    Ok(())
}

#[test]
fn test_batch_rows_are_independent() -> Result<()> {
    let layout = Arc::new(classifier()?);
    let mut single = CpuNetwork::new(Arc::clone(&layout), 1)?;
    let mut batched = GpuNetwork::new(layout, 3)?;
    single.initialize_weights(21)?;
    batched.initialize_weights(21)?;

    let row = [0.25, -0.5, 0.75, 1.0];
    common::set_row(&mut single, 0, &row)?;
    common::set_row(&mut batched, 1, &row)?;
    single.predict()?;
    batched.predict()?;

    let expected = single.inspect_outputs()?;
    let outputs = batched.inspect_outputs()?;
    for (e, g) in expected.iter().zip(&outputs[3..6]) {
        assert!((e - g).abs() < 1e-5, "{expected:?} vs {outputs:?}");
    }
    Ok(())
}

// ============================================================================
// Weights
// ============================================================================

#[test]
fn test_initial_weights_respect_fan_in() -> Result<()> {
    let layout = NetworkLayout::new()
        .with_layer(FullyConnected::new(16, 4, Sigmoid)?)?
        .with_layer(Conv1d::new(4, 1, 3, true, 1, Identity)?)?;
    let mut network = CpuNetwork::new(layout, 1)?;
    network.initialize_weights(42)?;
    let weights = network.inspect_weights()?;
    assert_eq!(weights.len(), 64 + 3);

    let dense_bound = 1.0 / 16f32.sqrt();
    let conv_bound = 1.0 / 3f32.sqrt();
    assert!(weights[..64].iter().all(|w| w.abs() <= dense_bound));
    assert!(weights[64..].iter().all(|w| w.abs() <= conv_bound));
    assert!(weights.iter().any(|&w| w != 0.0));
    Ok(())
}

#[test]
fn test_initialization_is_seeded() -> Result<()> {
    let (mut cpu, mut gpu) = common::both(classifier()?, 2)?;
    cpu.initialize_weights(3)?;
    gpu.initialize_weights(3)?;
    assert_eq!(cpu.inspect_weights()?, gpu.inspect_weights()?);

    gpu.initialize_weights(4)?;
    assert_ne!(cpu.inspect_weights()?, gpu.inspect_weights()?);
    Ok(())
}

#[test]
fn test_set_weights_round_trips() -> Result<()> {
    let (mut cpu, mut gpu) = common::both(classifier()?, 1)?;
    let weights: Vec<f32> = (0..42).map(|i| i as f32 * 0.01).collect();
    cpu.set_weights(&weights)?;
    gpu.set_weights(&weights)?;
    assert_eq!(cpu.inspect_weights()?, weights);
    assert_eq!(gpu.inspect_weights()?, weights);
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_layout_rejects_mismatched_layers() -> Result<()> {
    let result = NetworkLayout::new()
        .with_layer(FullyConnected::new(4, 6, Sigmoid)?)?
        .with_layer(FullyConnected::new(5, 2, Identity)?);
    assert!(matches!(
        result,
        Err(Error::ShapeMismatch {
            layer: 1,
            expected: 6,
            actual: 5
        })
    ));
    Ok(())
}

#[test]
fn test_empty_layout_and_zero_batch_are_rejected() -> Result<()> {
    assert!(matches!(CpuNetwork::new(NetworkLayout::new(), 1), Err(Error::EmptyLayout)));
    assert!(matches!(GpuNetwork::new(NetworkLayout::new(), 1), Err(Error::EmptyLayout)));
    assert!(matches!(CpuNetwork::new(classifier()?, 0), Err(Error::InvalidBatchSize(0))));
    assert!(matches!(GpuNetwork::new(classifier()?, 0), Err(Error::InvalidBatchSize(0))));
    Ok(())
}

fn staging_errors<B: Backend>(network: &mut Network<B>) {
    assert!(matches!(
        network.set_input(2, 0, 1.0),
        Err(Error::IndexOutOfRange { what: "batch", .. })
    ));
    assert!(matches!(
        network.set_input(0, 4, 1.0),
        Err(Error::IndexOutOfRange { what: "input", .. })
    ));
    assert!(matches!(
        network.set_target(0, 3, 1.0),
        Err(Error::IndexOutOfRange { what: "output", .. })
    ));
    assert!(matches!(
        network.set_weights(&[0.0; 41]),
        Err(Error::WeightCountMismatch {
            expected: 42,
            actual: 41
        })
    ));
}

#[test]
fn test_staging_checks_indices() -> Result<()> {
    let (mut cpu, mut gpu) = common::both(classifier()?, 2)?;
    staging_errors(&mut cpu);
    staging_errors(&mut gpu);
    Ok(())
}

fn poisoned_learn<B: Backend>(network: &mut Network<B>) -> Result<()> {
    network.initialize_weights(1)?;
    network.set_input(0, 2, f32::NAN)?;
    let result = network.learn(&LearningParams::default(), false);
    assert!(matches!(result, Err(Error::NonFiniteInput { .. })), "{result:?}");
    Ok(())
}

#[test]
fn test_non_finite_input_fails_learning() -> Result<()> {
    let (mut cpu, mut gpu) = common::both(classifier()?, 1)?;
    poisoned_learn(&mut cpu)?;
    poisoned_learn(&mut gpu)?;
    Ok(())
}

fn overflowing_hidden_layer<B: Backend>(network: &mut Network<B>) -> Result<()> {
    network.set_weights(&[1e30, 1.0])?;
    network.set_input(0, 0, 1e30)?;
    network.set_target(0, 0, 0.0)?;
    let weights = network.inspect_weights()?;

    match network.learn(&LearningParams::default(), false) {
        Err(Error::NonFiniteInput { layer, index, value }) => {
            assert_eq!((layer, index), (1, 0));
            assert!(value.is_infinite());
        }
        other => panic!("{} backend: expected NonFiniteInput, got {other:?}", network.backend().name()),
    }
    // The failing layer runs no backward, so its weights are untouched.
    assert_eq!(network.inspect_weights()?[1], weights[1]);
    Ok(())
}

#[test]
fn test_non_finite_hidden_activation_fails_learning() -> Result<()> {
    let layout = NetworkLayout::new()
        .with_layer(FullyConnected::new(1, 1, Identity)?)?
        .with_layer(FullyConnected::new(1, 1, Identity)?)?;
    let (mut cpu, mut gpu) = common::both(layout, 1)?;
    overflowing_hidden_layer(&mut cpu)?;
    overflowing_hidden_layer(&mut gpu)?;
    Ok(())
}

// ============================================================================
// Kernel sharing
// ============================================================================

#[test]
fn test_equal_shapes_share_compiled_kernels() -> Result<()> {
    let first = GpuNetwork::new(classifier()?, 2)?;
    let second = GpuNetwork::new(classifier()?, 2)?;
    let other_batch = GpuNetwork::new(classifier()?, 5)?;

    let forward = |network: &GpuNetwork, index| {
        network
            .backend()
            .layer_kernels(index)
            .map(|kernels| Arc::clone(&kernels.forward))
            .ok_or(Error::IndexOutOfRange {
                what: "layer",
                index,
                len: 2,
            })
    };
    assert!(Arc::ptr_eq(&forward(&first, 0)?, &forward(&second, 0)?));
    assert!(Arc::ptr_eq(&forward(&first, 1)?, &forward(&second, 1)?));
    assert!(!Arc::ptr_eq(&forward(&first, 0)?, &forward(&other_batch, 0)?));
    assert!(!kernel_cache(KernelKind::Forward).is_empty());
    Ok(())
}

#[test]
fn test_explicit_device_owns_network_buffers() -> Result<()> {
    let device = Arc::new(RayonDevice::with_config(&DeviceConfig::default())?);
    let shared: Arc<dyn ComputeDevice> = device.clone();
    let network = GpuNetwork::with_device(classifier()?, 2, shared)?;
    assert_eq!(device.buffer_count(), 5);
    drop(network);
    assert_eq!(device.buffer_count(), 0);
    Ok(())
}
