use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::{
    error::{Error, Result},
    train::{TrainParams, TrainerConfig},
};

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// Run settings. Every field is optional so a YAML file and command line
/// overrides can be layered with [`AppConfig::merge`].
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Directory holding the four idx files
    pub data_dir: Option<PathBuf>,
    pub hidden_layer_size: Option<usize>,
    pub sample_factor: Option<usize>,
    pub batch_size: Option<usize>,
    pub batch_count: Option<usize>,
    pub base_rate: Option<f64>,
    pub seed: Option<u64>,
    pub threads: Option<usize>,
    /// Where the trained network is written
    pub output: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(Error::io(path))?;
        Ok(serde_yaml::from_str(&text)?)
    }

    // merge configs where the second overwrites the first
    pub fn merge(self, other: Self) -> Self {
        Self {
            data_dir: other.data_dir.or(self.data_dir),
            hidden_layer_size: other.hidden_layer_size.or(self.hidden_layer_size),
            sample_factor: other.sample_factor.or(self.sample_factor),
            batch_size: other.batch_size.or(self.batch_size),
            batch_count: other.batch_count.or(self.batch_count),
            base_rate: other.base_rate.or(self.base_rate),
            seed: other.seed.or(self.seed),
            threads: other.threads.or(self.threads),
            output: other.output.or(self.output),
        }
    }

    pub fn trainer_config(&self) -> Result<TrainerConfig> {
        let dir = self.data_dir.clone().unwrap_or_else(|| PathBuf::from("dataset"));
        let config = TrainerConfig {
            train_images: dir.join(TRAIN_IMAGES),
            train_labels: dir.join(TRAIN_LABELS),
            test_images: dir.join(TEST_IMAGES),
            test_labels: dir.join(TEST_LABELS),
            hidden_layer_size: self.hidden_layer_size.unwrap_or(512),
            sample_factor: self.sample_factor.unwrap_or(1),
            seed: self.seed,
        };

        if config.hidden_layer_size == 0 {
            return Err(Error::InvalidConfig("hidden layer size must be positive".into()));
        }
        if config.sample_factor == 0 {
            return Err(Error::InvalidConfig("sample factor must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn train_params(&self, verbose: bool) -> TrainParams {
        TrainParams {
            batch_size: self.batch_size.unwrap_or(128),
            batch_count: self.batch_count.unwrap_or(16384),
            base_rate: self.base_rate.unwrap_or(0.25),
            verbose,
            progress: !verbose,
            threads: self.threads.unwrap_or(1),
        }
    }

    pub fn output(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| PathBuf::from("network.txt"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        let trainer = config.trainer_config().unwrap();
        let params = config.train_params(false);

        assert_eq!(trainer.train_images, Path::new("dataset/train-images-idx3-ubyte"));
        assert_eq!(trainer.test_labels, Path::new("dataset/t10k-labels-idx1-ubyte"));
        assert_eq!(trainer.hidden_layer_size, 512);
        assert_eq!(trainer.sample_factor, 1);
        assert_eq!(trainer.seed, None);
        assert_eq!((params.batch_size, params.batch_count), (128, 16384));
        assert_eq!(params.base_rate, 0.25);
        assert_eq!(params.threads, 1);
        assert_eq!(config.output(), Path::new("network.txt"));
    }

    #[test]
    fn later_config_wins() {
        let file: AppConfig = serde_yaml::from_str("hidden_layer_size: 64\nsample_factor: 2\nseed: 9\n").unwrap();
        let cli = AppConfig {
            sample_factor: Some(4),
            data_dir: Some("/data/mnist".into()),
            ..Default::default()
        };

        let merged = file.merge(cli).trainer_config().unwrap();

        assert_eq!(merged.hidden_layer_size, 64);
        assert_eq!(merged.sample_factor, 4);
        assert_eq!(merged.seed, Some(9));
        assert_eq!(merged.train_labels, Path::new("/data/mnist/train-labels-idx1-ubyte"));
    }

    #[test]
    fn rejects_unknown_and_zero() {
        assert!(serde_yaml::from_str::<AppConfig>("hiden_layer_size: 3").is_err());

        let zero = AppConfig {
            sample_factor: Some(0),
            ..Default::default()
        };
        assert!(matches!(zero.trainer_config(), Err(Error::InvalidConfig(_))));
    }
}
