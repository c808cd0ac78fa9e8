//! Versioned firmware image header.
//!
//! Little-endian, CRC-protected. `header_crc` covers the full header
//! with the CRC field itself zeroed; `image_crc` covers the image data
//! up to the start of the state section (trailing state bytes are not
//! part of the delivered image).

use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use super::state::ImageState;
use super::ImageFormatError;
use crate::module::FwVersion;

/// Must match IMAGE_HEADER_MAGIC in the module's common/image_info.h.
pub const IMAGE_HEADER_MAGIC: u32 = 0xBEEF_CAFE;

/// Size of the prefix common to all header versions.
pub const COMMON_HEADER_SIZE: usize = 6;

/// Full size of a version 1 header.
pub const HEADER_V1_SIZE: usize = 72;

// Target device values, matching the target_device_t enumeration.
pub const TARGET_DEVICE_STM: u8 = 1;
pub const TARGET_DEVICE_TAURUS: u8 = 2;
pub const TARGET_DEVICE_TAURUS1: u8 = 3;

// Firmware identifier values, matching the fw_identifier_t enumeration.
pub const FW_ID_APPLICATION_A: u8 = 1;
pub const FW_ID_APPLICATION_B: u8 = 2;
pub const FW_ID_CMIS_REG_SLOT: u8 = 3;
pub const FW_ID_TAURUS_OSFP: u8 = 4;
pub const FW_ID_TAURUS_QDD: u8 = 5;
pub const FW_ID_TAURUS1: u8 = 6;

pub fn target_device_name(value: u8) -> Option<&'static str> {
    match value {
        TARGET_DEVICE_STM => Some("stm32"),
        TARGET_DEVICE_TAURUS => Some("taurus"),
        TARGET_DEVICE_TAURUS1 => Some("taurus1"),
        _ => None,
    }
}

pub fn target_device_value(name: &str) -> Option<u8> {
    match name {
        "stm32" => Some(TARGET_DEVICE_STM),
        "taurus" => Some(TARGET_DEVICE_TAURUS),
        "taurus1" => Some(TARGET_DEVICE_TAURUS1),
        _ => None,
    }
}

pub fn fw_identifier_name(value: u8) -> Option<&'static str> {
    match value {
        FW_ID_APPLICATION_A => Some("a"),
        FW_ID_APPLICATION_B => Some("b"),
        FW_ID_CMIS_REG_SLOT => Some("crs"),
        FW_ID_TAURUS_OSFP => Some("taurus_osfp"),
        FW_ID_TAURUS_QDD => Some("taurus_qdd"),
        FW_ID_TAURUS1 => Some("taurus1"),
        _ => None,
    }
}

pub fn fw_identifier_value(name: &str) -> Option<u8> {
    match name {
        "a" => Some(FW_ID_APPLICATION_A),
        "b" => Some(FW_ID_APPLICATION_B),
        "crs" => Some(FW_ID_CMIS_REG_SLOT),
        "taurus_osfp" => Some(FW_ID_TAURUS_OSFP),
        "taurus_qdd" => Some(FW_ID_TAURUS_QDD),
        "taurus1" => Some(FW_ID_TAURUS1),
        _ => None,
    }
}

/// A version 1 image header together with the image data it fronts.
#[derive(Debug, Clone)]
pub struct ImageHeader {
    path: PathBuf,
    pub magic: u32,
    pub version: u8,
    pub size: u8,
    pub target_device: u8,
    pub fw_identifier: u8,
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub extra: [u8; 32],
    pub image_size: u32,
    pub image_crc: u32,
    pub git_sha: [u8; 12],
    pub header_crc: u32,
    pub pad: [u8; 4],
    /// Image data following the header.
    data: Vec<u8>,
    /// Offset into `data` where CRC coverage stops.
    covered: usize,
}

impl ImageHeader {
    fn blank(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            magic: IMAGE_HEADER_MAGIC,
            version: 1,
            size: HEADER_V1_SIZE as u8,
            target_device: 0,
            fw_identifier: 0,
            major: 0,
            minor: 0,
            build: 0,
            extra: [0; 32],
            image_size: 0,
            image_crc: 0,
            git_sha: [0; 12],
            header_crc: 0,
            pad: [0; 4],
            data: Vec::new(),
            covered: 0,
        }
    }

    /// Load a header and its image data from a firmware binary.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageFormatError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        if bytes.len() < COMMON_HEADER_SIZE {
            return Err(ImageFormatError::FileTooSmall {
                actual: bytes.len(),
                minimum: COMMON_HEADER_SIZE,
            });
        }

        let mut cursor = Cursor::new(&bytes);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != IMAGE_HEADER_MAGIC {
            return Err(ImageFormatError::BadMagic {
                expected: IMAGE_HEADER_MAGIC,
                actual: magic,
            });
        }
        let version = cursor.read_u8()?;
        if version != 1 {
            return Err(ImageFormatError::UnsupportedHeaderVersion(version));
        }
        let size = cursor.read_u8()?;
        if bytes.len() < size as usize || (size as usize) < HEADER_V1_SIZE {
            return Err(ImageFormatError::FileTooSmall {
                actual: bytes.len(),
                minimum: HEADER_V1_SIZE,
            });
        }

        let mut header = Self::blank(path);
        header.magic = magic;
        header.version = version;
        header.size = size;
        header.target_device = cursor.read_u8()?;
        header.fw_identifier = cursor.read_u8()?;
        header.major = cursor.read_u8()?;
        header.minor = cursor.read_u8()?;
        header.build = cursor.read_u16::<LittleEndian>()?;
        cursor.read_exact(&mut header.extra)?;
        header.image_size = cursor.read_u32::<LittleEndian>()?;
        header.image_crc = cursor.read_u32::<LittleEndian>()?;
        cursor.read_exact(&mut header.git_sha)?;
        header.header_crc = cursor.read_u32::<LittleEndian>()?;
        cursor.read_exact(&mut header.pad)?;

        header.data = bytes[size as usize..].to_vec();

        // The state section, when present, sits past the end of the
        // delivered image; its offset bounds the CRC-covered range.
        // Images without one are covered end to end. A malformed state
        // section doesn't matter here, only where coverage stops.
        let state_offset = match ImageState::from_bytes(&bytes) {
            Ok(state) => state.offset(),
            Err(_) => bytes.len(),
        };
        header.covered = state_offset
            .saturating_sub(size as usize)
            .min(header.data.len());
        debug!(covered = header.covered, "image CRC coverage");

        Ok(header)
    }

    /// Add a header to an image that doesn't already have one, and
    /// write the result back to the file.
    ///
    /// A raw binary carries no state section, so the whole file is
    /// CRC-covered.
    pub fn create<P: AsRef<Path>>(
        path: P,
        image_id: &str,
        image_target: &str,
    ) -> Result<Self, ImageFormatError> {
        let path = path.as_ref();
        let data = fs::read(path)?;

        let mut header = Self::blank(path);
        header.covered = data.len();
        header.data = data;
        header.fw_identifier = fw_identifier_value(image_id)
            .ok_or_else(|| ImageFormatError::UnknownIdentifier(image_id.to_string()))?;
        header.target_device = target_device_value(image_target)
            .ok_or_else(|| ImageFormatError::UnknownTarget(image_target.to_string()))?;
        header.update_crc();

        let mut file = fs::File::create(path)?;
        file.write_all(&header.header_bytes())?;
        file.write_all(&header.data)?;

        Ok(header)
    }

    /// Update version and identity fields and recompute both CRCs.
    pub fn update(
        &mut self,
        image_id: Option<&str>,
        image_target: Option<&str>,
    ) -> Result<(), ImageFormatError> {
        if let Some(id) = image_id {
            self.fw_identifier = fw_identifier_value(id)
                .ok_or_else(|| ImageFormatError::UnknownIdentifier(id.to_string()))?;
        }
        if let Some(target) = image_target {
            self.target_device = target_device_value(target)
                .ok_or_else(|| ImageFormatError::UnknownTarget(target.to_string()))?;
        }
        self.update_crc();
        Ok(())
    }

    pub fn set_version(&mut self, major: Option<u8>, minor: Option<u8>, build: Option<u16>) {
        if let Some(major) = major {
            self.major = major;
        }
        if let Some(minor) = minor {
            self.minor = minor;
        }
        if let Some(build) = build {
            self.build = build;
        }
        self.update_crc();
    }

    /// Rewrite the header in place, or write it to a new file.
    pub fn write(&self, filename: Option<&Path>) -> Result<(), ImageFormatError> {
        match filename {
            None => {
                let mut file = fs::OpenOptions::new().write(true).open(&self.path)?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&self.header_bytes())?;
            }
            Some(path) => {
                fs::write(path, self.header_bytes())?;
            }
        }
        Ok(())
    }

    /// Recompute `image_size`, `image_crc` and `header_crc` from the
    /// current field values and covered data range.
    fn update_crc(&mut self) {
        self.image_size = self.covered as u32;
        self.image_crc = crc32fast::hash(&self.data[..self.covered]);
        self.header_crc = crc32fast::hash(&self.serialize(0));
    }

    /// Serialize the header with the given value in the header-CRC
    /// field.
    fn serialize(&self, header_crc: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_V1_SIZE);
        buf.write_u32::<LittleEndian>(self.magic).unwrap();
        buf.push(self.version);
        buf.push(self.size);
        buf.push(self.target_device);
        buf.push(self.fw_identifier);
        buf.push(self.major);
        buf.push(self.minor);
        buf.write_u16::<LittleEndian>(self.build).unwrap();
        buf.extend_from_slice(&self.extra);
        buf.write_u32::<LittleEndian>(self.image_size).unwrap();
        buf.write_u32::<LittleEndian>(self.image_crc).unwrap();
        buf.extend_from_slice(&self.git_sha);
        buf.write_u32::<LittleEndian>(header_crc).unwrap();
        buf.extend_from_slice(&self.pad);
        buf
    }

    /// The full serialized header.
    pub fn header_bytes(&self) -> Vec<u8> {
        self.serialize(self.header_crc)
    }

    /// Image data following the header, including any state section.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The CRC-covered slice of the image data.
    pub fn covered_data(&self) -> &[u8] {
        &self.data[..self.covered]
    }

    pub fn covered_len(&self) -> usize {
        self.covered
    }

    pub fn fw_version(&self) -> FwVersion {
        FwVersion::new(self.major, self.minor, self.build)
    }

    /// CRC of the covered image data as currently loaded.
    pub fn compute_image_crc(&self) -> u32 {
        crc32fast::hash(&self.data[..self.covered])
    }

    pub fn target_name(&self) -> &'static str {
        target_device_name(self.target_device).unwrap_or("unknown")
    }

    pub fn id_name(&self) -> &'static str {
        fw_identifier_name(self.fw_identifier).unwrap_or("unknown")
    }
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image Header ({} bytes):", HEADER_V1_SIZE)?;
        writeln!(f, "  magic:          0x{:08x}", self.magic)?;
        writeln!(f, "  header version: 0x{:02x}", self.version)?;
        writeln!(f, "  header size:    0x{0:02x} ({0}) padded", self.size)?;
        writeln!(
            f,
            "  target:         0x{:02x} ({})",
            self.target_device,
            self.target_name()
        )?;
        writeln!(
            f,
            "  firmware ID:    0x{:02x} ({})",
            self.fw_identifier,
            self.id_name()
        )?;
        writeln!(f, "  major version:  0x{:02x}", self.major)?;
        writeln!(f, "  minor version:  0x{:02x}", self.minor)?;
        writeln!(f, "  build:          0x{:04x}", self.build)?;
        writeln!(f, "  image size:     0x{0:08x} ({0})", self.image_size)?;
        writeln!(f, "  image CRC:      0x{:08x}", self.image_crc)?;
        writeln!(f, "  git SHA:        {:02x?}", self.git_sha)?;
        write!(f, "  header CRC:     0x{:08x}", self.header_crc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_image(data: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        fs::write(&path, data).unwrap();
        (dir, path)
    }

    #[test]
    fn create_then_load_round_trips_crc() {
        let payload: Vec<u8> = (0u16..1000).map(|v| (v % 251) as u8).collect();
        let (_dir, path) = temp_image(&payload);

        let created = ImageHeader::create(&path, "a", "stm32").unwrap();
        assert_eq!(created.image_crc, crc32fast::hash(&payload));

        let loaded = ImageHeader::load(&path).unwrap();
        assert_eq!(loaded.image_crc, crc32fast::hash(&payload));
        assert_eq!(loaded.compute_image_crc(), loaded.image_crc);
        assert_eq!(loaded.image_size as usize, payload.len());
        assert_eq!(loaded.covered_data(), &payload[..]);
        assert_eq!(loaded.id_name(), "a");
        assert_eq!(loaded.target_name(), "stm32");
    }

    #[test]
    fn header_crc_is_idempotent() {
        let (_dir, path) = temp_image(&[0xAB; 256]);
        let mut header = ImageHeader::create(&path, "crs", "taurus").unwrap();
        let first = header.header_crc;
        header.update(None, None).unwrap();
        assert_eq!(header.header_crc, first);
        header.update(None, None).unwrap();
        assert_eq!(header.header_crc, first);
    }

    #[test]
    fn header_crc_covers_itself_zeroed() {
        let (_dir, path) = temp_image(&[1, 2, 3, 4]);
        let header = ImageHeader::create(&path, "b", "stm32").unwrap();
        assert_eq!(header.header_crc, crc32fast::hash(&header.serialize(0)));
    }

    #[test]
    fn set_version_recomputes_header_crc() {
        let (_dir, path) = temp_image(&[9; 64]);
        let mut header = ImageHeader::create(&path, "a", "stm32").unwrap();
        let before = header.header_crc;
        header.set_version(Some(1), Some(2), Some(300));
        assert_ne!(header.header_crc, before);
        assert_eq!(header.fw_version(), FwVersion::new(1, 2, 300));
        // Image data unchanged, so the image CRC is stable.
        assert_eq!(header.image_crc, crc32fast::hash(&[9; 64]));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (_dir, path) = temp_image(&[0u8; 80]);
        match ImageHeader::load(&path) {
            Err(ImageFormatError::BadMagic { expected, actual }) => {
                assert_eq!(expected, IMAGE_HEADER_MAGIC);
                assert_eq!(actual, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unsupported_version_names_found_version() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGE_HEADER_MAGIC.to_le_bytes());
        bytes.push(2); // header version
        bytes.push(72);
        bytes.resize(80, 0);
        let (_dir, path) = temp_image(&bytes);
        match ImageHeader::load(&path) {
            Err(ImageFormatError::UnsupportedHeaderVersion(2)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn image_without_state_is_covered_end_to_end() {
        let payload = vec![0x5A; 500];
        let (_dir, path) = temp_image(&payload);
        ImageHeader::create(&path, "taurus_osfp", "taurus").unwrap();
        let loaded = ImageHeader::load(&path).unwrap();
        assert_eq!(loaded.covered_len(), payload.len());
        assert_eq!(loaded.data().len(), payload.len());
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        let (_dir, path) = temp_image(&[0; 16]);
        match ImageHeader::create(&path, "zz", "stm32") {
            Err(ImageFormatError::UnknownIdentifier(id)) => assert_eq!(id, "zz"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
