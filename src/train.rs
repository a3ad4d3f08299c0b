use indicatif::{ProgressBar, ProgressIterator, ProgressStyle};
use nalgebra::DVector;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use std::{path::PathBuf, time::Instant};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    gradient::Gradients,
    mnist::{normalize, Dataset},
    nn::{argmax, NetConfig, Network},
};

/// Where the data lives and how the network is shaped.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub train_images: PathBuf,
    pub train_labels: PathBuf,
    pub test_images: PathBuf,
    pub test_labels: PathBuf,
    pub hidden_layer_size: usize,
    pub sample_factor: usize,
    /// `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainParams {
    pub batch_size: usize,
    pub batch_count: usize,
    pub base_rate: f64,
    /// Log every batch's accuracy at info level.
    pub verbose: bool,
    pub progress: bool,
    /// Workers used to accumulate a batch's gradients. 1 runs inline.
    pub threads: usize,
}

impl TrainParams {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".into()));
        }
        if !(self.base_rate > 0.) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.base_rate
            )));
        }
        if self.threads == 0 {
            return Err(Error::InvalidConfig("thread count must be positive".into()));
        }
        Ok(())
    }
}

/// Learning rate for batch `t`: `base / (1 + ln(1 + t))`.
pub fn learning_rate(base: f64, t: usize) -> f64 {
    base / (1. + (t as f64).ln_1p())
}

/// Maps raw label bytes onto class indices `0..n_classes`, with the
/// smallest training label at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelMapping {
    offset: u8,
    n_classes: usize,
}

impl LabelMapping {
    pub fn from_labels(labels: &[u8]) -> Result<Self> {
        let min = *labels.iter().min().ok_or(Error::EmptyDataset)?;
        let max = *labels.iter().max().ok_or(Error::EmptyDataset)?;
        Ok(Self {
            offset: min,
            n_classes: (max - min) as usize + 1,
        })
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// `None` for labels outside the training range.
    pub fn index(&self, raw: u8) -> Option<usize> {
        raw.checked_sub(self.offset)
            .map(usize::from)
            .filter(|&i| i < self.n_classes)
    }

    pub fn label(&self, index: usize) -> u8 {
        self.offset + index as u8
    }
}

/// One evaluated sample, labels in raw form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub expected: u8,
    pub predicted: u8,
    pub expected_prob: Option<f64>,
    pub predicted_prob: f64,
}

impl Prediction {
    pub fn is_correct(&self) -> bool {
        self.expected == self.predicted
    }
}

pub struct Trainer {
    train_set: Dataset,
    test_set: Dataset,
    labels: LabelMapping,
    network: Network,
    grads: Gradients,
    rng: StdRng,
}

impl Trainer {
    pub fn init(config: &TrainerConfig) -> Result<Self> {
        let train_set = Dataset::load(&config.train_images, &config.train_labels, config.sample_factor)?;
        let test_set = Dataset::load(&config.test_images, &config.test_labels, config.sample_factor)?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self::from_datasets(train_set, test_set, config.hidden_layer_size, rng)
    }

    pub fn from_datasets(
        train_set: Dataset,
        test_set: Dataset,
        hidden_layer_size: usize,
        mut rng: StdRng,
    ) -> Result<Self> {
        let labels = LabelMapping::from_labels(train_set.labels())?;
        let config = NetConfig {
            n_input: train_set.input_size(),
            n_hidden: hidden_layer_size,
            n_output: labels.n_classes(),
        };

        if test_set.input_size() != config.n_input {
            return Err(Error::ShapeMismatch {
                expected: (config.n_input, config.n_output),
                found: (test_set.input_size(), config.n_output),
            });
        }

        let network = Network::new(config, &mut rng)?;

        info!(
            vectors = train_set.len(),
            input_size = config.n_input,
            min_label = labels.offset(),
            max_label = labels.label(config.n_output - 1),
            hidden_size = config.n_hidden,
            "dataset loaded"
        );

        Ok(Self {
            train_set,
            test_set,
            labels,
            network,
            grads: Gradients::new(config),
            rng,
        })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn labels(&self) -> LabelMapping {
        self.labels
    }

    pub fn train_set(&self) -> &Dataset {
        &self.train_set
    }

    pub fn test_set(&self) -> &Dataset {
        &self.test_set
    }

    /// Run `batch_count` mini batches of SGD, returning each batch's
    /// training accuracy.
    pub fn train(&mut self, params: &TrainParams) -> Result<Vec<f64>> {
        params.validate()?;

        info!(
            batches = params.batch_count,
            batch_size = params.batch_size,
            rate = params.base_rate,
            threads = params.threads,
            "starting training"
        );

        let pool = if params.threads > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(params.threads)
                    .build()?,
            )
        } else {
            None
        };

        let bar = if params.progress {
            ProgressBar::new(params.batch_count as u64).with_style(
                ProgressStyle::with_template(
                    "[{elapsed:.green}] [{wide_bar:.cyan/red}] {pos:.red}/{len:.green} ({eta})",
                )?
                .progress_chars("=> "),
            )
        } else {
            ProgressBar::hidden()
        };

        let start = Instant::now();
        let mut accuracies = Vec::with_capacity(params.batch_count);
        let mut samples = Vec::with_capacity(params.batch_size);

        for t in (0..params.batch_count).progress_with(bar) {
            let rate = learning_rate(params.base_rate, t);

            samples.clear();
            samples.extend(
                (0..params.batch_size).map(|_| self.rng.random_range(0..self.train_set.len())),
            );

            self.grads.reset();
            let correct = match &pool {
                Some(pool) => pool.install(|| self.accumulate_par(&samples, params.threads)),
                None => self.accumulate(&samples),
            };

            let accuracy = correct as f64 / params.batch_size as f64;
            if params.verbose {
                info!(batch = t, accuracy, "batch complete");
            } else {
                debug!(batch = t, accuracy, rate, "batch complete");
            }
            accuracies.push(accuracy);

            self.network
                .apply_update(&self.grads, rate / params.batch_size as f64);
        }

        info!(elapsed = ?start.elapsed(), "training finished");
        Ok(accuracies)
    }

    fn accumulate(&mut self, samples: &[usize]) -> usize {
        let mut correct = 0;
        for &sample in samples {
            let (x, label) = self.training_pair(sample);
            let output = self.network.forward_backward(&x, label, &mut self.grads);
            if argmax(output) == label {
                correct += 1;
            }
        }
        correct
    }

    fn accumulate_par(&mut self, samples: &[usize], threads: usize) -> usize {
        let config = self.network.config();
        let chunk = samples.len().div_ceil(threads);
        let this = &*self;

        let partials: Vec<(Gradients, usize)> = samples
            .par_chunks(chunk)
            .map(|chunk| {
                let mut grads = Gradients::new(config);
                let mut correct = 0;
                for &sample in chunk {
                    let (x, label) = this.training_pair(sample);
                    if argmax(this.network.forward_backward(&x, label, &mut grads)) == label {
                        correct += 1;
                    }
                }
                (grads, correct)
            })
            .collect();

        // merged in sample order, so the last output is the last sample's
        let mut correct = 0;
        for (grads, chunk_correct) in &partials {
            self.grads.merge(grads);
            correct += chunk_correct;
        }
        correct
    }

    fn training_pair(&self, index: usize) -> (DVector<f64>, usize) {
        let x = normalize(&self.train_set.images()[index]);
        let raw = self.train_set.labels()[index];
        let label = self.labels.index(raw).unwrap_or_default();
        (x, label)
    }

    /// Predict every sample of `dataset` in order.
    pub fn predictions(&self, dataset: &Dataset) -> Vec<Prediction> {
        dataset
            .images()
            .par_iter()
            .zip(dataset.labels().par_iter())
            .map(|(image, &expected)| {
                let probs = self.network.predict(&normalize(image));
                let predicted = argmax(&probs);
                Prediction {
                    expected,
                    predicted: self.labels.label(predicted),
                    expected_prob: self.labels.index(expected).map(|i| probs[i]),
                    predicted_prob: probs[predicted],
                }
            })
            .collect()
    }

    /// Fraction of `dataset` classified correctly.
    pub fn evaluate(&self, dataset: &Dataset, verbose: bool) -> Result<f64> {
        if dataset.is_empty() {
            return Err(Error::EmptyDataset);
        }

        let predictions = self.predictions(dataset);
        let mut correct = 0;
        for (i, p) in predictions.iter().enumerate() {
            if p.is_correct() {
                correct += 1;
            }
            if verbose {
                match (p.is_correct(), p.expected_prob) {
                    (true, _) => info!(test = i, expect = p.expected, prob = p.predicted_prob, "correct"),
                    (false, expected_prob) => info!(
                        test = i,
                        expect = p.expected,
                        expected_prob,
                        got = p.predicted,
                        prob = p.predicted_prob,
                        "wrong"
                    ),
                }
            }
        }

        let accuracy = correct as f64 / dataset.len() as f64;
        if verbose {
            info!(accuracy, "test accuracy");
        }
        Ok(accuracy)
    }

    pub fn test(&self, verbose: bool) -> Result<f64> {
        self.evaluate(&self.test_set, verbose)
    }

    pub fn test_on_train(&self, verbose: bool) -> Result<f64> {
        self.evaluate(&self.train_set, verbose)
    }

    pub fn save_network(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.network.save_to(path)
    }

    /// Replace the network with one read from `path`. Its input and output
    /// sizes must match the data.
    pub fn load_network(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let network = Network::load_from(path)?;
        let config = network.config();
        let expected = (self.train_set.input_size(), self.labels.n_classes());

        if (config.n_input, config.n_output) != expected {
            return Err(Error::ShapeMismatch {
                expected,
                found: (config.n_input, config.n_output),
            });
        }

        self.grads = Gradients::new(config);
        self.network = network;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Two classes, raw labels 3 and 4. Class 3 is bright on the left,
    /// class 4 bright on the right.
    fn toy_dataset(n: usize) -> Dataset {
        let mut images = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let noise = (i * 37 % 50) as u8;
            if i % 2 == 0 {
                images.push(vec![200 + noise, 180 + noise, 10 + noise, noise]);
                labels.push(3);
            } else {
                images.push(vec![noise, 10 + noise, 180 + noise, 200 + noise]);
                labels.push(4);
            }
        }
        Dataset::from_parts(images, labels, 2, 2).unwrap()
    }

    fn trainer(seed: u64) -> Trainer {
        Trainer::from_datasets(toy_dataset(64), toy_dataset(20), 6, StdRng::seed_from_u64(seed)).unwrap()
    }

    fn params(threads: usize) -> TrainParams {
        TrainParams {
            batch_size: 16,
            batch_count: 300,
            base_rate: 2.0,
            verbose: false,
            progress: false,
            threads,
        }
    }

    #[test]
    fn rate_schedule() {
        assert_eq!(learning_rate(0.25, 0), 0.25);
        let rates: Vec<_> = (0..1000).map(|t| learning_rate(0.25, t)).collect();
        assert!(rates.windows(2).all(|w| w[1] < w[0]));
        assert!(rates.iter().all(|&r| r > 0.));
    }

    #[test]
    fn label_mapping() {
        let labels = LabelMapping::from_labels(&[5, 3, 9, 4]).unwrap();
        assert_eq!(labels.offset(), 3);
        assert_eq!(labels.n_classes(), 7);
        assert_eq!(labels.index(3), Some(0));
        assert_eq!(labels.index(9), Some(6));
        assert_eq!(labels.index(2), None);
        assert_eq!(labels.index(10), None);
        assert_eq!(labels.label(6), 9);
        assert!(matches!(LabelMapping::from_labels(&[]), Err(Error::EmptyDataset)));
    }

    #[test]
    fn shapes_come_from_data() {
        let trainer = trainer(1);
        assert_eq!(
            trainer.network().config(),
            NetConfig {
                n_input: 4,
                n_hidden: 6,
                n_output: 2,
            }
        );
        assert_eq!(trainer.labels().offset(), 3);
    }

    #[test]
    fn learns_separable_data() {
        let mut trainer = trainer(2);
        let accuracies = trainer.train(&params(1)).unwrap();

        assert_eq!(accuracies.len(), 300);
        let early: f64 = accuracies[..20].iter().sum::<f64>() / 20.;
        let late: f64 = accuracies[280..].iter().sum::<f64>() / 20.;
        assert!(late >= early);
        assert!(late >= 0.95, "late accuracy {late}");

        assert!(trainer.test(false).unwrap() >= 0.95);
        assert!(trainer.test_on_train(true).unwrap() >= 0.95);
    }

    #[test]
    fn parallel_matches_sequential() {
        let mut sequential = trainer(9);
        let mut parallel = trainer(9);
        let short = TrainParams {
            batch_count: 20,
            ..params(1)
        };

        let a = sequential.train(&short).unwrap();
        let b = parallel.train(&TrainParams { threads: 3, ..short }).unwrap();

        assert_eq!(a, b);
        let x = normalize(&[120, 30, 200, 90]);
        let pa = sequential.network().predict(&x);
        let pb = parallel.network().predict(&x);
        assert!((pa - pb).abs().max() < 1e-9);
    }

    #[test]
    fn parallel_keeps_last_sample_output() {
        let mut sequential = trainer(12);
        let mut parallel = trainer(12);
        let samples = [3, 10, 41, 7, 22, 58, 1];

        sequential.grads.reset();
        let a = sequential.accumulate(&samples);
        parallel.grads.reset();
        let b = parallel.accumulate_par(&samples, 3);

        assert_eq!(a, b);
        assert_eq!(parallel.grads.output(), sequential.grads.output());
        let last = sequential.network().predict(&normalize(&toy_dataset(64).images()[1]));
        assert_eq!(parallel.grads.output(), &last);
        let diff = (&parallel.grads.hidden_weights - &sequential.grads.hidden_weights).abs().max();
        assert!(diff < 1e-12);
    }

    #[test]
    fn seeded_runs_repeat() {
        let short = TrainParams {
            batch_count: 10,
            ..params(1)
        };
        let mut a = trainer(4);
        let mut b = trainer(4);
        a.train(&short).unwrap();
        b.train(&short).unwrap();
        assert_eq!(a.network(), b.network());
    }

    #[test]
    fn bad_params_rejected() {
        let mut trainer = trainer(0);
        let zero_batch = TrainParams {
            batch_size: 0,
            ..params(1)
        };
        let zero_rate = TrainParams {
            base_rate: 0.,
            ..params(1)
        };
        assert!(matches!(trainer.train(&zero_batch), Err(Error::InvalidConfig(_))));
        assert!(matches!(trainer.train(&zero_rate), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn unseen_test_labels_are_misses() {
        let test = Dataset::from_parts(vec![vec![200, 180, 10, 0], vec![0, 0, 0, 0]], vec![3, 7], 2, 2).unwrap();
        let trainer = Trainer::from_datasets(toy_dataset(10), test, 4, StdRng::seed_from_u64(0)).unwrap();

        let predictions = trainer.predictions(trainer.test_set());
        assert_eq!(predictions[1].expected, 7);
        assert_eq!(predictions[1].expected_prob, None);
        assert!(!predictions[1].is_correct());
        assert!(trainer.test(true).unwrap() <= 0.5);
    }

    #[test]
    fn save_and_reload() {
        let mut trained = trainer(6);
        trained
            .train(&TrainParams {
                batch_count: 50,
                ..params(1)
            })
            .unwrap();

        let path = std::env::temp_dir().join(format!("trainer-save-{}.txt", std::process::id()));
        trained.save_network(&path).unwrap();

        let mut fresh = trainer(7);
        assert_ne!(fresh.network(), trained.network());
        fresh.load_network(&path).unwrap();

        for image in toy_dataset(8).images() {
            let x = normalize(image);
            let diff = (trained.network().predict(&x) - fresh.network().predict(&x)).abs().max();
            assert!(diff < 1e-12);
        }

        let wide = Network::zeros(NetConfig {
            n_input: 5,
            n_hidden: 6,
            n_output: 2,
        });
        wide.save_to(&path).unwrap();
        assert!(matches!(
            fresh.load_network(&path),
            Err(Error::ShapeMismatch {
                expected: (4, 2),
                found: (5, 2)
            })
        ));

        std::fs::remove_file(&path).unwrap();
    }
}
