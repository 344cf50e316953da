use thiserror::Error;

use crate::types::TypeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize profile: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("address {0:#x} is not a live tracked allocation")]
    UntrackedAddress(usize),

    #[error("type {0} was never announced")]
    UnknownType(TypeId),
}

pub type Result<T> = std::result::Result<T, Error>;
