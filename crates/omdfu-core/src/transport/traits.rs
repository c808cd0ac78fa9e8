//! Register transport abstraction.
//!
//! Defines the `RegisterTransport` trait for the paged register bus,
//! allowing different implementations (hardware drivers, mock).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Read failed at page {page:02X}h offset {offset}: {message}")]
    ReadFailed { page: u8, offset: u8, message: String },

    #[error("Write failed at page {page:02X}h offset {offset}: {message}")]
    WriteFailed { page: u8, offset: u8, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract register bus interface.
///
/// A transport addresses registers by (page, offset) and moves raw
/// bytes. Offset remapping for upper-half pages is handled above this
/// trait by the protocol layer; implementations transmit the offset
/// they are given.
///
/// One upgrade session owns one transport handle for its lifetime.
pub trait RegisterTransport: Send {
    /// Read `count` bytes starting at (page, offset).
    fn read(&mut self, page: u8, offset: u8, count: usize) -> Result<Vec<u8>, TransportError>;

    /// Write `data` starting at (page, offset).
    fn write(&mut self, page: u8, offset: u8, data: &[u8]) -> Result<(), TransportError>;
}
