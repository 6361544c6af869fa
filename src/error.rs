use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort startup. Anything that goes wrong after the daemon
/// enters its loop is recovered locally instead; a best-effort iteration
/// beats a dead balancer.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid threshold {0}: must be greater than 0 and at most 100")]
    Threshold(f64),

    #[error("no CPUs found under {0}")]
    NoCpus(PathBuf),

    #[error("can't read proximity config {path}: {source}")]
    PxmConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
