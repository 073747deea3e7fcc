//! Flattening of a layer chain into one node and weight address space.
//!
//! Nodes are numbered in layer order; layer `l` owns outputs
//! `[output, output + num_outputs)` and reads the previous layer's outputs,
//! which end exactly where its own begin. Weights are packed the same way.
//!
//! ```text
//!   nodes:    | layer 0 out | layer 1 out | layer 2 out |
//!                            ^ layer 1 input window = layer 0 out
//!   weights:  | layer 0     | layer 1     | layer 2     |
//! ```

use crate::error::{Error, Result};
use crate::layers::{Layer, LayerOffsets};

/// An ordered, append-only chain of layers.
#[derive(Debug, Default)]
pub struct NetworkLayout {
    layers: Vec<(Box<dyn Layer>, LayerOffsets)>,
    num_nodes: usize,
    num_weights: usize,
}

impl NetworkLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `layer`, assigning its offsets.
    ///
    /// Fails with [`Error::ShapeMismatch`] when the layer does not consume
    /// exactly what the current last layer produces.
    pub fn add_layer(&mut self, layer: impl Layer + 'static) -> Result<&LayerOffsets> {
        if let Some((previous, _)) = self.layers.last() {
            if previous.num_outputs() != layer.num_inputs() {
                return Err(Error::ShapeMismatch {
                    layer: self.layers.len(),
                    expected: previous.num_outputs(),
                    actual: layer.num_inputs(),
                });
            }
        }

        let num_nodes = self
            .num_nodes
            .checked_add(layer.num_outputs())
            .ok_or_else(|| Error::invalid_shape("node count overflows"))?;
        let num_weights = self
            .num_weights
            .checked_add(layer.num_weights())
            .ok_or_else(|| Error::invalid_shape("weight count overflows"))?;

        let offsets = LayerOffsets {
            input: self.num_nodes as isize - layer.num_inputs() as isize,
            output: self.num_nodes,
            weight: self.num_weights,
        };
        tracing::debug!(
            layer = layer.name(),
            index = self.layers.len(),
            inputs = layer.num_inputs(),
            outputs = layer.num_outputs(),
            weights = layer.num_weights(),
            ?offsets,
            "layer appended"
        );

        self.num_nodes = num_nodes;
        self.num_weights = num_weights;
        self.layers.push((Box::new(layer), offsets));
        Ok(&self.layers[self.layers.len() - 1].1)
    }

    /// Builder form of [`NetworkLayout::add_layer`].
    pub fn with_layer(mut self, layer: impl Layer + 'static) -> Result<Self> {
        self.add_layer(layer)?;
        Ok(self)
    }

    pub fn layers(&self) -> impl ExactSizeIterator<Item = (&dyn Layer, &LayerOffsets)> + '_ {
        self.layers.iter().map(|(layer, offsets)| (layer.as_ref(), offsets))
    }

    pub fn layer(&self, index: usize) -> Option<(&dyn Layer, &LayerOffsets)> {
        self.layers.get(index).map(|(layer, offsets)| (layer.as_ref(), offsets))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Inputs of the first layer, 0 when empty.
    pub fn num_inputs(&self) -> usize {
        self.layers.first().map_or(0, |(layer, _)| layer.num_inputs())
    }

    /// Outputs of the last layer, 0 when empty.
    pub fn num_outputs(&self) -> usize {
        self.layers.last().map_or(0, |(layer, _)| layer.num_outputs())
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_weights(&self) -> usize {
        self.num_weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{Identity, Sigmoid};
    use crate::layers::{Conv1d, FullyConnected};
    use proptest::prelude::*;

    #[test]
    fn offsets_follow_the_chain() {
        let layout = NetworkLayout::new()
            .with_layer(FullyConnected::new(4, 3, Sigmoid).unwrap())
            .unwrap()
            .with_layer(FullyConnected::new(3, 2, Identity).unwrap())
            .unwrap();

        assert_eq!(layout.num_inputs(), 4);
        assert_eq!(layout.num_outputs(), 2);
        assert_eq!(layout.num_nodes(), 5);
        assert_eq!(layout.num_weights(), 12 + 6);

        let (_, first) = layout.layer(0).unwrap();
        assert_eq!(*first, LayerOffsets { input: -4, output: 0, weight: 0 });
        let (_, second) = layout.layer(1).unwrap();
        assert_eq!(*second, LayerOffsets { input: 0, output: 3, weight: 12 });
    }

    #[test]
    fn mismatched_append_is_rejected() {
        let mut layout = NetworkLayout::new();
        layout.add_layer(FullyConnected::new(4, 3, Sigmoid).unwrap()).unwrap();
        let err = layout.add_layer(Conv1d::new(10, 1, 3, false, 1, Identity).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                layer: 1,
                expected: 3,
                actual: 10
            }
        ));
        assert_eq!(layout.len(), 1);
        assert_eq!(layout.num_nodes(), 3);
    }

    #[test]
    fn empty_layout_has_no_shape() {
        let layout = NetworkLayout::new();
        assert!(layout.is_empty());
        assert_eq!(layout.num_inputs(), 0);
        assert_eq!(layout.num_outputs(), 0);
        assert!(layout.layer(0).is_none());
    }

    proptest! {
        #[test]
        fn chains_tile_nodes_and_weights(widths in prop::collection::vec(1usize..12, 2..7)) {
            let mut layout = NetworkLayout::new();
            for pair in widths.windows(2) {
                layout.add_layer(FullyConnected::new(pair[0], pair[1], Identity).unwrap()).unwrap();
            }

            let mut nodes = 0usize;
            let mut weights = 0usize;
            for (index, (layer, offsets)) in layout.layers().enumerate() {
                prop_assert_eq!(offsets.output, nodes);
                prop_assert_eq!(offsets.weight, weights);
                prop_assert_eq!(offsets.input, nodes as isize - layer.num_inputs() as isize);
                if index == 0 {
                    prop_assert!(offsets.input < 0);
                } else {
                    prop_assert!(offsets.input >= 0);
                }
                nodes += layer.num_outputs();
                weights += layer.num_weights();
            }
            prop_assert_eq!(layout.num_nodes(), nodes);
            prop_assert_eq!(layout.num_weights(), weights);
            prop_assert_eq!(layout.num_inputs(), widths[0]);
            prop_assert_eq!(layout.num_outputs(), widths[widths.len() - 1]);
        }
    }
}
