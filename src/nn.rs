use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
    str::SplitWhitespace,
};

use crate::{
    error::{Error, Result},
    gradient::Gradients,
};

/// Layer sizes of a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub n_input: usize,
    pub n_hidden: usize,
    pub n_output: usize,
}

/// A sigmoid hidden layer followed by a softmax output layer, trained
/// against the cross-entropy loss.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    hidden_weights: DMatrix<f64>,
    hidden_biases: DVector<f64>,
    output_weights: DMatrix<f64>,
    output_biases: DVector<f64>,
}

impl Network {
    /// Weights and biases of each layer are drawn uniformly from
    /// `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    pub fn new<R: Rng + ?Sized>(config: NetConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;

        let hidden = fan_in(config.n_input)?;
        let output = fan_in(config.n_hidden)?;

        Ok(Self {
            hidden_weights: DMatrix::from_fn(config.n_hidden, config.n_input, |_, _| {
                hidden.sample(rng)
            }),
            hidden_biases: DVector::from_fn(config.n_hidden, |_, _| hidden.sample(rng)),
            output_weights: DMatrix::from_fn(config.n_output, config.n_hidden, |_, _| {
                output.sample(rng)
            }),
            output_biases: DVector::from_fn(config.n_output, |_, _| output.sample(rng)),
        })
    }

    /// A network with every parameter set to zero.
    pub fn zeros(config: NetConfig) -> Self {
        Self {
            hidden_weights: DMatrix::zeros(config.n_hidden, config.n_input),
            hidden_biases: DVector::zeros(config.n_hidden),
            output_weights: DMatrix::zeros(config.n_output, config.n_hidden),
            output_biases: DVector::zeros(config.n_output),
        }
    }

    pub fn config(&self) -> NetConfig {
        NetConfig {
            n_input: self.hidden_weights.ncols(),
            n_hidden: self.hidden_weights.nrows(),
            n_output: self.output_weights.nrows(),
        }
    }

    fn hidden(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut z = &self.hidden_weights * x;
        z += &self.hidden_biases;
        z.apply(|v| *v = sigmoid(*v));
        z
    }

    fn output(&self, hidden: &DVector<f64>) -> DVector<f64> {
        softmax(&self.output_weights * hidden + &self.output_biases)
    }

    /// Class probabilities for input `x`.
    pub fn predict(&self, x: &DVector<f64>) -> DVector<f64> {
        self.output(&self.hidden(x))
    }

    /// Index of the most probable class.
    pub fn classify(&self, x: &DVector<f64>) -> usize {
        argmax(&self.predict(x))
    }

    /// Cross-entropy of the prediction for `x` against class `label`.
    pub fn loss(&self, x: &DVector<f64>, label: usize) -> f64 {
        -self.predict(x)[label].ln()
    }

    /// Run `x` forward, then add the gradient of the loss against `label`
    /// into `grads`. Returns the output activation, which is also kept in
    /// the accumulator.
    ///
    /// # Panics
    ///
    /// If `label` is not below the output size.
    pub fn forward_backward<'g>(
        &self,
        x: &DVector<f64>,
        label: usize,
        grads: &'g mut Gradients,
    ) -> &'g DVector<f64> {
        let n_output = self.output_biases.len();
        assert!(
            label < n_output,
            "label index {label} out of range for {n_output} classes"
        );

        let hidden = self.hidden(x);
        grads.output = self.output(&hidden);

        // softmax with cross-entropy: dL/dz = output - one_hot(label)
        let mut delta_out = grads.output.clone();
        delta_out[label] -= 1.;

        let sigmoid_prime = hidden.map(|h| h * (1. - h));
        let delta_hidden = self.output_weights.tr_mul(&delta_out).component_mul(&sigmoid_prime);

        grads.output_weights.ger(1., &delta_out, &hidden, 1.);
        grads.output_biases += &delta_out;
        grads.hidden_weights.ger(1., &delta_hidden, x, 1.);
        grads.hidden_biases += &delta_hidden;

        &grads.output
    }

    /// `params -= rate * grads` for every tensor. Summed gradients are
    /// averaged by passing `rate / batch_size`.
    pub fn apply_update(&mut self, grads: &Gradients, rate: f64) {
        self.hidden_weights -= &grads.hidden_weights * rate;
        self.hidden_biases -= &grads.hidden_biases * rate;
        self.output_weights -= &grads.output_weights * rate;
        self.output_biases -= &grads.output_biases * rate;
    }

    /// Text format: `n_input n_hidden n_output` on the first line, then the
    /// hidden weights (row-major), output weights (row-major), hidden biases
    /// and output biases, one tensor per line.
    pub fn write_to(&self, mut w: impl Write) -> Result<()> {
        let config = self.config();
        writeln!(w, "{} {} {}", config.n_input, config.n_hidden, config.n_output)?;

        for weights in [&self.hidden_weights, &self.output_weights] {
            for row in weights.row_iter() {
                for v in row.iter() {
                    write!(w, "{v} ")?;
                }
            }
            writeln!(w)?;
        }

        for v in self.hidden_biases.iter() {
            write!(w, "{v} ")?;
        }
        writeln!(w)?;
        for v in self.output_biases.iter() {
            write!(w, "{v} ")?;
        }
        writeln!(w)?;

        w.flush()?;
        Ok(())
    }

    pub fn read_from(mut r: impl Read) -> Result<Self> {
        let mut text = String::new();
        r.read_to_string(&mut text)?;
        let mut tokens = text.split_whitespace();

        let config = NetConfig {
            n_input: next_token(&mut tokens, "input size")?,
            n_hidden: next_token(&mut tokens, "hidden size")?,
            n_output: next_token(&mut tokens, "output size")?,
        };
        config.validate()?;

        let mut values = |n: usize, what: &str| -> Result<Vec<f64>> {
            (0..n).map(|_| next_token(&mut tokens, what)).collect()
        };

        let area = |rows: usize, cols: usize| {
            rows.checked_mul(cols)
                .ok_or_else(|| Error::Parse(format!("{rows}x{cols} matrix is too large")))
        };
        let hidden_area = area(config.n_hidden, config.n_input)?;
        let output_area = area(config.n_output, config.n_hidden)?;

        let hidden_weights = values(hidden_area, "hidden weight")?;
        let output_weights = values(output_area, "output weight")?;
        let hidden_biases = values(config.n_hidden, "hidden bias")?;
        let output_biases = values(config.n_output, "output bias")?;

        if let Some(extra) = tokens.next() {
            return Err(Error::Parse(format!("unexpected trailing value {extra:?}")));
        }

        Ok(Self {
            hidden_weights: DMatrix::from_row_slice(config.n_hidden, config.n_input, &hidden_weights),
            hidden_biases: DVector::from_vec(hidden_biases),
            output_weights: DMatrix::from_row_slice(config.n_output, config.n_hidden, &output_weights),
            output_biases: DVector::from_vec(output_biases),
        })
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(Error::io(path))?;
        self.write_to(BufWriter::new(file))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(Error::io(path))?;
        Self::read_from(BufReader::new(file))
    }
}

impl NetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_input == 0 || self.n_hidden == 0 || self.n_output == 0 {
            return Err(Error::InvalidConfig(format!(
                "layer sizes must be positive, got {self:?}"
            )));
        }
        Ok(())
    }
}

fn fan_in(n: usize) -> Result<Uniform<f64>> {
    let bound = 1. / (n as f64).sqrt();
    Uniform::new_inclusive(-bound, bound)
        .map_err(|e| Error::InvalidConfig(format!("weight range for fan-in {n}: {e}")))
}

fn next_token<T: std::str::FromStr>(tokens: &mut SplitWhitespace<'_>, what: &str) -> Result<T> {
    let token = tokens
        .next()
        .ok_or_else(|| Error::Parse(format!("missing {what}")))?;
    token
        .parse()
        .map_err(|_| Error::Parse(format!("bad {what} {token:?}")))
}

/// The sigmoid function.
pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Softmax, shifted by the maximum so large inputs do not overflow.
pub fn softmax(mut z: DVector<f64>) -> DVector<f64> {
    let max = z.max();
    z.apply(|v| *v = (*v - max).exp());
    let sum = z.sum();
    z / sum
}

/// Index of the largest value, the first one on ties.
pub fn argmax(v: &DVector<f64>) -> usize {
    v.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, max), (i, &x)| {
            if x > max {
                (i, x)
            } else {
                (best, max)
            }
        })
        .0
}
