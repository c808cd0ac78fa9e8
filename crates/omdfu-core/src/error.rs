//! Upgrade error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

use crate::image::ImageFormatError;
use crate::module::{Component, FwVersion};
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    ImageFormat(#[from] ImageFormatError),

    #[error("Invalid firmware location: {}", .0.display())]
    InvalidFirmwareLocation(PathBuf),

    #[error("No {component} binary matching {pattern} under {}", .dir.display())]
    MissingBinary {
        component: Component,
        pattern: &'static str,
        dir: PathBuf,
    },

    #[error("Version verification failed for {component}: incorrect slot (still {slot})")]
    SlotUnchanged { component: Component, slot: char },

    #[error("Version verification failed for {component}: expected {expected}, found {actual}")]
    VersionMismatch {
        component: Component,
        expected: FwVersion,
        actual: FwVersion,
    },

    #[error("Unrecognized module state value 0x{0:02x}")]
    UnknownModuleState(u8),

    #[error("Retimer DFU timed out.")]
    RetimerTimeout,

    #[error("Firmware upgrade not supported on target. Please check if module is Active.")]
    NotSupported,

    #[error("Invalid firmware flags 0x{flags:02x} for {component}")]
    InvalidFirmwareFlags { component: Component, flags: u8 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpgradeError {
    /// Human explanation where a status-code lookup knows one.
    pub fn explanation(&self) -> Option<&'static str> {
        match self {
            UpgradeError::Protocol(e) => e.explanation(),
            _ => None,
        }
    }
}
