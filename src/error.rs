//! Error types for the silo field monitor.
//!
//! One enum per failure domain the spec distinguishes (transport, protocol,
//! validation, persistence, configuration), following `comsrv`'s `ComSrvError`
//! shape of one `thiserror` variant per classifier rather than a single
//! catch-all string.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SilodError>;

#[derive(Error, Debug)]
pub enum SilodError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serial transport error: {0}")]
    Transport(String),

    #[error("modbus protocol error: {0}")]
    Protocol(String),

    #[error("value out of range: {value} (range: {min}-{max})")]
    Validation { value: u16, min: u16, max: u16 },

    #[error("database error: {0}")]
    Database(String),

    #[error("device {0} not found")]
    UnknownDevice(u8),

    #[error("persistence is disabled")]
    PersistenceDisabled,

    #[error("alerts are disabled")]
    AlertsDisabled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SilodError {
    pub fn validation(value: u16, min: u16, max: u16) -> Self {
        SilodError::Validation { value, min, max }
    }
}
