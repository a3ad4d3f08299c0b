use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("bad magic number in {what}: expected {expected}, found {found}")]
    Format {
        what: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("bad header in {what}: {reason}")]
    Header { what: &'static str, reason: String },

    #[error("{images} images but {labels} labels")]
    SizeMismatch { images: usize, labels: usize },

    #[error("network shape {found:?} does not fit the data, expected {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("malformed network file: {0}")]
    Parse(String),

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config file error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("progress bar template error: {0}")]
    Progress(#[from] indicatif::style::TemplateError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}
