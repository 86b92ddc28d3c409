pub mod filter;
pub mod material;
pub mod normalizer;
pub mod processor;
pub mod services;
pub mod takeoff;

pub mod errors {
    use thiserror::Error;

    use takeoff_io::IoError;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error(transparent)]
        Io(#[from] IoError),
        #[error("invalid layer exclusion pattern {pattern:?}: {source}")]
        InvalidPattern {
            pattern: String,
            #[source]
            source: regex::Error,
        },
        #[error("{service} failed: {message}")]
        Service {
            service: &'static str,
            message: String,
        },
    }
}

pub use errors::EngineError;
pub use takeoff::{TakeoffEngine, TakeoffOptions, TakeoffReport};
