use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TracesError {
    #[error("this exporter requires specific features")]
    InvalidFeaturesError,
}
