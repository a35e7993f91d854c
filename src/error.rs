//! Typed error surface for the driver core (see spec §7). The CLI binary
//! wraps these in `anyhow::Context` at its boundary; library code below
//! `main.rs` never uses `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("could not open AOA transport: {0}")]
    TransportOpen(String),

    #[error("transport failed: {0}")]
    TransportFatal(String),

    #[error("failed to load Ed25519 key: {0}")]
    AuthKeyLoad(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
