//! CDB status byte parsing and failure explanations.

use std::fmt;

use super::constants::{
    CDB_STATUS_BUSY, CDB_STATUS_SUCCESS, CMD_ABORT, CMD_START_DOWNLOAD,
};

/// A CDB status byte read from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdbStatus(pub u8);

impl CdbStatus {
    /// Status reported when the busy-poll window expires. Never a
    /// valid success code.
    pub const TIMED_OUT: CdbStatus = CdbStatus(0x00);

    pub fn is_busy(&self) -> bool {
        self.0 & CDB_STATUS_BUSY != 0
    }

    pub fn is_success(&self) -> bool {
        self.0 == CDB_STATUS_SUCCESS
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for CdbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Human explanation for a failed command, keyed on the command code
/// and the status the device reported.
pub fn explain_failure(cmd: u16, status: u8) -> Option<&'static str> {
    match (cmd, status) {
        (CMD_ABORT, _) => Some("Previous DFU aborted! Please restart DFU."),
        (CMD_START_DOWNLOAD, 0x7F) => {
            Some("Incorrect image slot. Provide binary for other image slot.")
        }
        (CMD_START_DOWNLOAD, 0x7C) => Some("Image is corrupted!"),
        (CMD_START_DOWNLOAD, 0x46) => Some("No password or incorrect password."),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_success_flags() {
        assert!(CdbStatus(0x81).is_busy());
        assert!(!CdbStatus(0x01).is_busy());
        assert!(CdbStatus(0x01).is_success());
        assert!(!CdbStatus::TIMED_OUT.is_success());
    }

    #[test]
    fn failure_explanations() {
        assert!(explain_failure(CMD_ABORT, 0x44).is_some());
        assert_eq!(
            explain_failure(CMD_START_DOWNLOAD, 0x7C),
            Some("Image is corrupted!")
        );
        assert_eq!(explain_failure(CMD_START_DOWNLOAD, 0x02), None);
        assert_eq!(explain_failure(0x0107, 0x7F), None);
    }
}
