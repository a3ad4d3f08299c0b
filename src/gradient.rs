use nalgebra::{DMatrix, DVector};

use crate::nn::NetConfig;

/// Summed gradients for one mini batch, shaped like the network's
/// parameters, plus the output of the most recent forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub(crate) hidden_weights: DMatrix<f64>,
    pub(crate) hidden_biases: DVector<f64>,
    pub(crate) output_weights: DMatrix<f64>,
    pub(crate) output_biases: DVector<f64>,
    pub(crate) output: DVector<f64>,
}

impl Gradients {
    pub fn new(config: NetConfig) -> Self {
        Self {
            hidden_weights: DMatrix::zeros(config.n_hidden, config.n_input),
            hidden_biases: DVector::zeros(config.n_hidden),
            output_weights: DMatrix::zeros(config.n_output, config.n_hidden),
            output_biases: DVector::zeros(config.n_output),
            output: DVector::zeros(config.n_output),
        }
    }

    pub fn config(&self) -> NetConfig {
        NetConfig {
            n_input: self.hidden_weights.ncols(),
            n_hidden: self.hidden_weights.nrows(),
            n_output: self.output_weights.nrows(),
        }
    }

    /// Zero the four gradient tensors. The output slot is left alone, it
    /// is overwritten by every forward pass.
    pub fn reset(&mut self) {
        self.hidden_weights.fill(0.);
        self.hidden_biases.fill(0.);
        self.output_weights.fill(0.);
        self.output_biases.fill(0.);
    }

    /// Output activation of the last sample passed through
    /// [`Network::forward_backward`](crate::nn::Network::forward_backward).
    pub fn output(&self) -> &DVector<f64> {
        &self.output
    }

    /// Add another accumulator's sums into this one. The other's output
    /// becomes the last output.
    pub fn merge(&mut self, other: &Gradients) {
        self.hidden_weights += &other.hidden_weights;
        self.hidden_biases += &other.hidden_biases;
        self.output_weights += &other.output_weights;
        self.output_biases += &other.output_biases;
        self.output.copy_from(&other.output);
    }
}
