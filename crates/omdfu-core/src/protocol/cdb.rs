//! CDB command channel.
//!
//! Frames commands into the paged register space, computes the check
//! code, triggers execution and polls for completion. The device runs
//! the command asynchronously after the trigger write; this layer owns
//! both the integrity check and the temporal contract (settle delay
//! plus bounded busy-poll).

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, WriteBytesExt};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::CdbTiming;
use crate::transport::{RegisterTransport, TransportError};

use super::constants::{
    CDB_COMMAND, CDB_LPL, CDB_STATUS_1, CDB_STATUS_2, CMD_COMPLETE, CMD_FW_INFO,
    CMD_START_DOWNLOAD, CMD_WRITE_CHUNK, Reg,
};
use super::status::{CdbStatus, explain_failure};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("CMD {cmd:04x} failed: 0x{status:02x}")]
    CommandFailed { cmd: u16, status: u8 },

    #[error("Invalid CDB block {0}")]
    InvalidBlock(u8),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// Human explanation for a failed command, where one is known.
    pub fn explanation(&self) -> Option<&'static str> {
        match self {
            ProtocolError::CommandFailed { cmd, status } => explain_failure(*cmd, *status),
            _ => None,
        }
    }
}

/// One's-complement sum check code: `255 - (sum(bytes) mod 256)`.
pub fn check_code(data: &[u8]) -> u8 {
    let total: u32 = data.iter().map(|&b| u32::from(b)).sum();
    255 - (total & 0xFF) as u8
}

/// Apply the upper-half register window remap: offsets at or above
/// 128 on any page other than 0 are shifted down by 128 before
/// transmission.
pub fn remap(reg: Reg) -> (u8, u8) {
    if reg.page != 0 && reg.offset >= 128 {
        (reg.page, reg.offset - 128)
    } else {
        (reg.page, reg.offset)
    }
}

/// CDB command channel over a register transport.
pub struct CdbChannel<T: RegisterTransport> {
    transport: T,
    chunk_size: usize,
    timing: CdbTiming,
}

impl<T: RegisterTransport> CdbChannel<T> {
    pub fn new(transport: T, chunk_size: usize, timing: CdbTiming) -> Self {
        Self {
            transport,
            chunk_size,
            timing,
        }
    }

    /// Read a single register byte.
    pub fn read_reg(&mut self, reg: Reg) -> Result<u8, ProtocolError> {
        let (page, offset) = remap(reg);
        let data = self.transport.read(page, offset, 1)?;
        Ok(data.first().copied().unwrap_or(0))
    }

    /// Write bytes to a register location, split into chunk-size
    /// transactions with the offset advanced per chunk.
    pub fn write_reg(&mut self, reg: Reg, data: &[u8]) -> Result<(), ProtocolError> {
        let (page, mut offset) = remap(reg);
        for chunk in data.chunks(self.chunk_size) {
            self.transport.write(page, offset, chunk)?;
            offset = offset.wrapping_add(self.chunk_size as u8);
        }
        Ok(())
    }

    /// Send a CDB command and wait for its result.
    ///
    /// The LPL payload is staged first; writing the command-fields
    /// block triggers execution. With `skip_status_check` set, the
    /// caller trusts the settle delays and no status poll happens.
    pub fn send(
        &mut self,
        cmd: u16,
        lpl: &[u8],
        rlpl_len: u8,
        skip_status_check: bool,
    ) -> Result<(), ProtocolError> {
        debug!(cmd = format_args!("{cmd:04X}h"), lpl_len = lpl.len(), "CDB command");

        let lpl_len = lpl.len() as u8;

        // Check code covers the command fields followed by the LPL,
        // with the check-code byte held at zero. The RLPL length byte
        // is also held at zero during summation even though the final
        // frame carries the real value; the register spec is vague
        // here and the device expects this form.
        let mut covered = Vec::with_capacity(8 + lpl.len());
        covered.write_u16::<BigEndian>(cmd).unwrap();
        covered.write_u16::<BigEndian>(0).unwrap(); // EPL length
        covered.push(lpl_len);
        covered.push(0); // check code slot
        covered.push(0); // RLPL length slot
        covered.push(0); // RLPL check code
        covered.extend_from_slice(lpl);

        let code = check_code(&covered);

        let mut fields = Vec::with_capacity(8);
        fields.write_u16::<BigEndian>(cmd).unwrap();
        fields.write_u16::<BigEndian>(0).unwrap();
        fields.push(lpl_len);
        fields.push(code);
        fields.push(rlpl_len);
        fields.push(0);

        if !lpl.is_empty() {
            // Single register transactions are size-limited, and the
            // command takes effect when the fields are written. Stage
            // all of the LPL first, then trigger.
            self.write_reg(CDB_LPL, lpl)?;
        }
        self.write_reg(CDB_COMMAND, &fields)?;

        // 0101h performs a full erase of the target partition which
        // stalls the module's internal bus; register traffic must
        // hold off until it finishes. 0103h flash writes get a tiny
        // headroom for the same reason.
        let settle_ms = match cmd {
            CMD_START_DOWNLOAD => self.timing.erase_settle_ms,
            CMD_WRITE_CHUNK => self.timing.write_settle_ms,
            CMD_COMPLETE | CMD_FW_INFO => self.timing.complete_settle_ms,
            _ => 0,
        };
        if settle_ms > 0 {
            thread::sleep(Duration::from_millis(settle_ms));
        }

        if !skip_status_check {
            trace!(cmd = format_args!("{cmd:04X}h"), "checking CDB status");
            let status = self.wait_ready(1)?;
            if !status.is_success() {
                return Err(ProtocolError::CommandFailed {
                    cmd,
                    status: status.value(),
                });
            }
        }

        Ok(())
    }

    /// Read the CDB status byte for the given block.
    pub fn status(&mut self, block: u8) -> Result<CdbStatus, ProtocolError> {
        let reg = match block {
            1 => CDB_STATUS_1,
            2 => CDB_STATUS_2,
            other => return Err(ProtocolError::InvalidBlock(other)),
        };
        Ok(CdbStatus(self.read_reg(reg)?))
    }

    /// Busy-wait for the CDB mailbox to come free. Expiry of the poll
    /// budget yields `CdbStatus::TIMED_OUT`, never a success code.
    fn wait_ready(&mut self, block: u8) -> Result<CdbStatus, ProtocolError> {
        let timeout = Duration::from_millis(self.timing.status_timeout_ms);
        let step = Duration::from_millis(self.timing.poll_interval_ms);
        let start = Instant::now();

        let mut status = self.status(block)?;
        while status.is_busy() {
            trace!(status = %status, "waiting for CDB to come free");
            if start.elapsed() > timeout {
                return Ok(CdbStatus::TIMED_OUT);
            }
            thread::sleep(step);
            status = self.status(block)?;
        }

        Ok(status)
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{CDB_STATUS_SUCCESS, CMD_RUN_IMAGE};
    use crate::transport::MockModule;

    fn fast_timing() -> CdbTiming {
        CdbTiming {
            poll_interval_ms: 1,
            status_timeout_ms: 20,
            erase_settle_ms: 0,
            write_settle_ms: 0,
            complete_settle_ms: 0,
        }
    }

    fn channel(mock: &MockModule) -> CdbChannel<MockModule> {
        CdbChannel::new(mock.clone(), 64, fast_timing())
    }

    #[test]
    fn check_code_law() {
        assert_eq!(check_code(&[]), 255);
        assert_eq!(check_code(&[1, 2, 3]), 255 - 6);
        // Sum wraps at 256.
        assert_eq!(check_code(&[0xFF, 0x02]), 255 - 1);
        let payload: Vec<u8> = (0u16..300).map(|v| (v & 0xFF) as u8).collect();
        let total: u32 = payload.iter().map(|&b| u32::from(b)).sum();
        assert_eq!(check_code(&payload), 255 - (total % 256) as u8);
    }

    #[test]
    fn frame_round_trips_through_verifier() {
        let mock = MockModule::new();
        mock.set_reg(0x00, 37, CDB_STATUS_SUCCESS);
        let mut ch = channel(&mock);

        let lpl = [0x00, 0x00, 0x00, 0x64];
        ch.send(CMD_RUN_IMAGE, &lpl, 0, false).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        // LPL staged first, then the trigger write.
        assert_eq!(writes[0], (0x9F, 8, lpl.to_vec()));
        let (page, offset, fields) = &writes[1];
        assert_eq!((*page, *offset), (0x9F, 0));
        assert_eq!(fields.len(), 8);
        assert_eq!(&fields[..2], &[0x01, 0x09]);
        assert_eq!(&fields[2..4], &[0x00, 0x00]);
        assert_eq!(fields[4], 4);

        // Recompute the check code over the frame with the check
        // fields zeroed; it must match the embedded value.
        let mut verify = fields.clone();
        verify[5] = 0;
        verify[6] = 0;
        verify[7] = 0;
        verify.extend_from_slice(&lpl);
        assert_eq!(fields[5], check_code(&verify));
        // 1 + 9 + 4 (lpl_len) + 0x64 = 114
        assert_eq!(fields[5], 255 - 114);
    }

    #[test]
    fn command_without_lpl_writes_only_fields() {
        let mock = MockModule::new();
        mock.set_reg(0x00, 37, CDB_STATUS_SUCCESS);
        let mut ch = channel(&mock);
        ch.send(0x0102, &[], 0, false).unwrap();
        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, 0);
    }

    #[test]
    fn status_timeout_reports_status_zero() {
        let mock = MockModule::new();
        // Busy bit never clears.
        mock.set_reg(0x00, 37, 0x81);
        let mut ch = channel(&mock);

        let err = ch.send(CMD_WRITE_CHUNK, &[0; 8], 0, false).unwrap_err();
        match err {
            ProtocolError::CommandFailed { cmd, status } => {
                assert_eq!(cmd, 0x0103);
                assert_eq!(status, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn skip_status_check_ignores_busy() {
        let mock = MockModule::new();
        mock.set_reg(0x00, 37, 0x81);
        let mut ch = channel(&mock);
        ch.send(0x0102, &[], 0, true).unwrap();
    }

    #[test]
    fn failure_status_is_reported_with_command() {
        let mock = MockModule::new();
        mock.set_reg(0x00, 37, 0x46);
        let mut ch = channel(&mock);
        let err = ch.send(CMD_START_DOWNLOAD, &[0; 4], 0, false).unwrap_err();
        match &err {
            ProtocolError::CommandFailed { cmd, status } => {
                assert_eq!(*cmd, 0x0101);
                assert_eq!(*status, 0x46);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.explanation(), Some("No password or incorrect password."));
    }

    #[test]
    fn invalid_block_is_rejected() {
        let mock = MockModule::new();
        let mut ch = channel(&mock);
        assert!(matches!(ch.status(3), Err(ProtocolError::InvalidBlock(3))));
    }

    #[test]
    fn remap_rule() {
        assert_eq!(remap(Reg::new(0x00, 200)), (0x00, 200)); // page 0 exempt
        assert_eq!(remap(Reg::new(0x01, 194)), (0x01, 66));
        assert_eq!(remap(Reg::new(0x01, 100)), (0x01, 100));
        assert_eq!(remap(Reg::new(0x9F, 128)), (0x9F, 0));
        assert_eq!(remap(Reg::new(0x9F, 136)), (0x9F, 8));
    }

    #[test]
    fn chunked_write_advances_offset() {
        let mock = MockModule::new();
        let mut ch = channel(&mock);
        let data: Vec<u8> = (0..150).collect();
        ch.write_reg(CDB_LPL, &data).unwrap();

        let writes = mock.writes();
        // ceil(150 / 64) = 3 chunks, offset stepped by chunk_size.
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].1, 8);
        assert_eq!(writes[1].1, 72);
        assert_eq!(writes[2].1, 136);
        assert_eq!(writes[0].2.len(), 64);
        assert_eq!(writes[1].2.len(), 64);
        assert_eq!(writes[2].2.len(), 22);
        let rejoined: Vec<u8> = writes.iter().flat_map(|(_, _, d)| d.clone()).collect();
        assert_eq!(rejoined, data);
    }
}
