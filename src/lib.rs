pub mod config;
pub mod error;
pub mod gradient;
pub mod mnist;
pub mod nn;
pub mod train;
pub mod utils;

pub use error::{Error, Result};
pub use gradient::Gradients;
pub use mnist::Dataset;
pub use nn::{NetConfig, Network};
pub use train::{learning_rate, LabelMapping, TrainParams, Trainer, TrainerConfig};
