//! In-flash image state record.
//!
//! STM32 images carry a fixed 2048-byte state section at a known
//! offset tracking the lifecycle of the flash slot. Other image
//! formats have no state section; loading one of those yields "no
//! state" with the offset pinned to end-of-file.

use std::fmt;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use super::ImageFormatError;

/// Must match IMAGE_STATE_MAGIC in the module's common/image_info.h.
pub const IMAGE_STATE_MAGIC: u32 = 0x0BED_FACE;

/// Total bytes in a state section.
pub const STATE_SECTION_SIZE: usize = 2048;

/// Offset from the start of an image file to the state section.
/// Derived from the module's linker memory map:
/// image_a_state origin minus image_a origin.
pub const STATE_OFFSET: usize = 0x0803_F800 - 0x0801_C800;

/// Size of the state common prefix, padded to entry alignment.
const STATE_HEADER_SIZE: usize = 8;

/// Size of one state array entry (state byte plus pad).
const STATE_ENTRY_SIZE: usize = 8;

/// Lifecycle state of a flash image slot. Values must match the
/// fw_state_t enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FwState {
    Default = 0,
    Writing = 1,
    Verified = 2,
    Aborted = 3,
    Deprecated = 4,
    Committed = 5,
    Erased = 0xFF,
}

impl FwState {
    pub fn from_u8(value: u8) -> Option<FwState> {
        match value {
            0 => Some(FwState::Default),
            1 => Some(FwState::Writing),
            2 => Some(FwState::Verified),
            3 => Some(FwState::Aborted),
            4 => Some(FwState::Deprecated),
            5 => Some(FwState::Committed),
            0xFF => Some(FwState::Erased),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FwState::Default => "default",
            FwState::Writing => "writing",
            FwState::Verified => "verified",
            FwState::Aborted => "aborted",
            FwState::Deprecated => "deprecated",
            FwState::Committed => "committed",
            FwState::Erased => "erased",
        }
    }

    pub fn from_name(name: &str) -> Option<FwState> {
        match name {
            "default" => Some(FwState::Default),
            "writing" => Some(FwState::Writing),
            "verified" => Some(FwState::Verified),
            "aborted" => Some(FwState::Aborted),
            "deprecated" => Some(FwState::Deprecated),
            "committed" => Some(FwState::Committed),
            "erased" => Some(FwState::Erased),
            _ => None,
        }
    }
}

impl fmt::Display for FwState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed (or absent) image state section.
#[derive(Debug, Clone)]
pub struct ImageState {
    path: Option<PathBuf>,
    pub version: u8,
    pub size: u8,
    /// Raw state values of the used array entries, in order.
    pub entries: Vec<u8>,
    /// Offset of the section from the start of the file; equals the
    /// file length when no section is present.
    offset: usize,
    present: bool,
}

impl ImageState {
    /// Load the state section of a firmware binary.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageFormatError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let mut state = Self::from_bytes(&bytes)?;
        state.path = Some(path.to_path_buf());
        Ok(state)
    }

    /// Parse the state section out of a whole image file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageFormatError> {
        let absent = Self {
            path: None,
            version: 0,
            size: 0,
            entries: Vec::new(),
            offset: bytes.len(),
            present: false,
        };

        if bytes.len() < STATE_OFFSET + STATE_HEADER_SIZE {
            return Ok(absent);
        }
        let section = &bytes[STATE_OFFSET..(STATE_OFFSET + STATE_SECTION_SIZE).min(bytes.len())];

        let magic = LittleEndian::read_u32(&section[0..4]);
        if magic != IMAGE_STATE_MAGIC {
            // Not every image format carries a state section.
            return Ok(absent);
        }
        let version = section[4];
        if version != 1 {
            return Err(ImageFormatError::UnsupportedStateVersion(version));
        }
        let size = section[5];

        // Entries are 8-byte aligned past the common header; a 0xFF
        // state byte is the unused sentinel.
        let mut entries = Vec::new();
        let mut at = STATE_HEADER_SIZE;
        while at + STATE_ENTRY_SIZE <= section.len() {
            let state = section[at];
            if state == FwState::Erased as u8 {
                break;
            }
            entries.push(state);
            at += STATE_ENTRY_SIZE;
        }

        Ok(Self {
            path: None,
            version,
            size,
            entries,
            offset: STATE_OFFSET,
            present: true,
        })
    }

    /// Whether the file actually carries a state section.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Offset to the start of the state section from the start of the
    /// file. If there is no state section, the size of the file.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reset the section to a single entry with the given state.
    pub fn update(&mut self, state: FwState) {
        self.version = 1;
        self.size = STATE_HEADER_SIZE as u8;
        self.entries = vec![state as u8];
        self.present = true;
    }

    /// Serialize the full 2048-byte section.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATE_SECTION_SIZE);
        let mut magic = [0u8; 4];
        LittleEndian::write_u32(&mut magic, IMAGE_STATE_MAGIC);
        buf.extend_from_slice(&magic);
        buf.push(self.version);
        buf.push(self.size);
        buf.resize(STATE_HEADER_SIZE, 0);
        for &state in &self.entries {
            buf.push(state);
            buf.resize(buf.len() + (STATE_ENTRY_SIZE - 1), 0);
        }
        buf.resize(STATE_SECTION_SIZE, 0xFF);
        buf
    }

    /// Write the section back to its file at the fixed offset, or the
    /// bare section to a new file.
    pub fn write(&self, filename: Option<&Path>) -> Result<(), ImageFormatError> {
        match filename {
            None => {
                let path = self.path.as_ref().ok_or_else(|| {
                    ImageFormatError::Io(std::io::Error::other("state section has no backing file"))
                })?;
                let mut file = fs::OpenOptions::new().write(true).open(path)?;
                file.seek(SeekFrom::Start(STATE_OFFSET as u64))?;
                file.write_all(&self.to_bytes())?;
            }
            Some(path) => {
                fs::write(path, self.to_bytes())?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.present {
            return f.write_str("No Image State");
        }
        writeln!(f, "Image State ({} bytes):", STATE_SECTION_SIZE)?;
        writeln!(f, "  magic:    0x{:08x}", IMAGE_STATE_MAGIC)?;
        writeln!(f, "  version:  0x{:02x}", self.version)?;
        writeln!(f, "  size:     0x{0:02x} ({0})", self.size)?;
        let capacity = (STATE_SECTION_SIZE - STATE_HEADER_SIZE) / STATE_ENTRY_SIZE;
        write!(f, "  states:   {} of {} used", self.entries.len(), capacity)?;
        for (index, state) in self.entries.iter().enumerate() {
            write!(f, "\n    [{index}]:    0x{state:02x}")?;
        }
        Ok(())
    }
}
