use thiserror::Error;

/// Errors produced by the analysis core.
///
/// Per-packet variants (`MalformedPacket`, `AllocBudgetExceeded`,
/// `FragmentOverlap`, `TcpInvalidTransition`) are absorbed by the pipeline
/// and counted; they never propagate past the call that produced them.
/// `Config` and `Fatal` propagate to `main`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("allocation budget exceeded (allocated {allocated}, requested {requested}, budget {budget})")]
    AllocBudgetExceeded { allocated: usize, requested: usize, budget: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("fragment overlap violation")]
    FragmentOverlap,

    #[error("invalid TCP transition")]
    TcpInvalidTransition,

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
