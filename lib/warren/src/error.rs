use crate::tun::TunError;
use thiserror::Error;

/// Errors surfaced by engine setup and shutdown. Per-packet conditions never
/// reach this type; they are expressed as filter verdicts and counters.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("key material error: {0}")]
    Keys(#[from] sett::keys::KeyError),

    #[error("logging error: {0}")]
    Log(#[from] sett::logging::LogError),

    #[error("tun device error: {0}")]
    Tun(#[from] TunError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
