//! Mock register transport for testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

use super::traits::{RegisterTransport, TransportError};

#[derive(Default)]
struct Inner {
    /// Sparse register map. Unwritten registers read as zero.
    regs: HashMap<(u8, u8), u8>,
    /// Captured writes as (page, offset, data).
    write_log: Vec<(u8, u8, Vec<u8>)>,
    /// Register updates applied when a given command is triggered,
    /// standing in for the device's RLPL response.
    replies: Vec<(u16, u8, u8, Vec<u8>)>,
    connected: bool,
}

/// Mock module for unit testing protocol and orchestrator logic.
///
/// Clones share the same register map and write log, so a test can
/// keep a handle while the upgrader owns another. Offsets seen here
/// are post-remap, i.e. what a real bus would receive.
#[derive(Clone)]
pub struct MockModule {
    inner: Arc<Mutex<Inner>>,
}

impl MockModule {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connected: true,
                ..Inner::default()
            })),
        }
    }

    /// Preload a register value.
    pub fn set_reg(&self, page: u8, offset: u8, value: u8) {
        self.inner.lock().unwrap().regs.insert((page, offset), value);
    }

    pub fn get_reg(&self, page: u8, offset: u8) -> u8 {
        *self
            .inner
            .lock()
            .unwrap()
            .regs
            .get(&(page, offset))
            .unwrap_or(&0)
    }

    /// All captured writes.
    pub fn writes(&self) -> Vec<(u8, u8, Vec<u8>)> {
        self.inner.lock().unwrap().write_log.clone()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().unwrap().write_log.clear();
    }

    /// Command codes extracted from writes to the CDB command-fields
    /// mailbox (page 9Fh, bus offset 0).
    pub fn commands_sent(&self) -> Vec<u16> {
        self.inner
            .lock()
            .unwrap()
            .write_log
            .iter()
            .filter(|(page, offset, data)| *page == 0x9F && *offset == 0 && data.len() >= 2)
            .map(|(_, _, data)| BigEndian::read_u16(&data[..2]))
            .collect()
    }

    /// Program register bytes the device deposits whenever `cmd` is
    /// triggered. The real module answers some commands through the
    /// RLPL area, which overlays the LPL staging registers.
    pub fn set_command_reply(&self, cmd: u16, page: u8, offset: u8, data: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .replies
            .push((cmd, page, offset, data.to_vec()));
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.inner.lock().unwrap().connected = false;
    }
}

impl Default for MockModule {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterTransport for MockModule {
    fn read(&mut self, page: u8, offset: u8, count: usize) -> Result<Vec<u8>, TransportError> {
        let inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::Disconnected);
        }
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let off = offset.wrapping_add(i as u8);
            out.push(*inner.regs.get(&(page, off)).unwrap_or(&0));
        }
        Ok(out)
    }

    fn write(&mut self, page: u8, offset: u8, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::Disconnected);
        }
        for (i, &b) in data.iter().enumerate() {
            let off = offset.wrapping_add(i as u8);
            inner.regs.insert((page, off), b);
        }
        inner.write_log.push((page, offset, data.to_vec()));

        // A write to the command-fields mailbox triggers execution;
        // deposit any programmed reply bytes.
        if page == 0x9F && offset == 0 && data.len() >= 2 {
            let cmd = BigEndian::read_u16(&data[..2]);
            let replies: Vec<(u8, u8, Vec<u8>)> = inner
                .replies
                .iter()
                .filter(|(c, _, _, _)| *c == cmd)
                .map(|(_, p, o, d)| (*p, *o, d.clone()))
                .collect();
            for (p, o, d) in replies {
                for (i, &b) in d.iter().enumerate() {
                    inner.regs.insert((p, o.wrapping_add(i as u8)), b);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_read_back() {
        let mock = MockModule::new();
        let mut t = mock.clone();
        t.write(0x00, 122, &[0x88, 0x88, 0x88, 0x88]).unwrap();
        assert_eq!(t.read(0x00, 122, 4).unwrap(), vec![0x88; 4]);
        assert_eq!(t.read(0x00, 0, 1).unwrap(), vec![0]);
    }

    #[test]
    fn write_capture_is_shared() {
        let mock = MockModule::new();
        let mut t = mock.clone();
        t.write(0x9F, 0, &[0x01, 0x02]).unwrap();
        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (0x9F, 0, vec![0x01, 0x02]));
        assert_eq!(mock.commands_sent(), vec![0x0102]);
    }

    #[test]
    fn command_reply_is_deposited_on_trigger() {
        let mock = MockModule::new();
        mock.set_command_reply(0x0100, 0x9F, 8, &[0x01]);
        let mut t = mock.clone();
        // Staging traffic may overwrite the RLPL area first.
        t.write(0x9F, 8, &[0xAA]).unwrap();
        assert_eq!(mock.get_reg(0x9F, 8), 0xAA);
        t.write(0x9F, 0, &[0x01, 0x00, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(mock.get_reg(0x9F, 8), 0x01);
    }

    #[test]
    fn disconnect_fails_io() {
        let mock = MockModule::new();
        let mut t = mock.clone();
        mock.disconnect();
        assert!(t.read(0, 0, 1).is_err());
        assert!(t.write(0, 0, &[0]).is_err());
    }
}
