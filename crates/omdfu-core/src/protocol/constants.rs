//! CDB protocol constants and the module register map.
//!
//! Page/offset pairs follow the CMIS paged register layout. Offsets at
//! or above 128 on non-zero pages address the upper-half register
//! window and are remapped by the channel before transmission.

/// A register location in the paged address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    pub page: u8,
    pub offset: u8,
}

impl Reg {
    pub const fn new(page: u8, offset: u8) -> Self {
        Self { page, offset }
    }
}

// ============================================================================
// CDB Command Codes
// ============================================================================

/// Request firmware info.
pub const CMD_FW_INFO: u16 = 0x0100;
/// Start firmware download. Erases the target partition.
pub const CMD_START_DOWNLOAD: u16 = 0x0101;
/// Abort an in-progress firmware download.
pub const CMD_ABORT: u16 = 0x0102;
/// Write one image chunk at a running byte address.
pub const CMD_WRITE_CHUNK: u16 = 0x0103;
/// Firmware download complete.
pub const CMD_COMPLETE: u16 = 0x0107;
/// Run image (reset into the freshly written slot).
pub const CMD_RUN_IMAGE: u16 = 0x0109;
/// Commit the running image as the boot default.
pub const CMD_COMMIT: u16 = 0x010A;

// ============================================================================
// CDB Status
// ============================================================================

/// Status register for CDB block 1.
pub const CDB_STATUS_1: Reg = Reg::new(0x00, 37);
/// Status register for CDB block 2.
pub const CDB_STATUS_2: Reg = Reg::new(0x00, 38);

/// Busy flag in the CDB status byte.
pub const CDB_STATUS_BUSY: u8 = 0x80;
/// The single success code.
pub const CDB_STATUS_SUCCESS: u8 = 0x01;

// ============================================================================
// CDB Mailbox
// ============================================================================

/// Command-fields block. Writing this triggers execution.
pub const CDB_COMMAND: Reg = Reg::new(0x9F, 128);
/// LPL payload region, written before the command fields.
pub const CDB_LPL: Reg = Reg::new(0x9F, 136);

// ============================================================================
// Module Registers (lower page 00h)
// ============================================================================

/// Bit 0x80 set here means firmware upgrade is not supported.
pub const UPGRADE_SUPPORT: Reg = Reg::new(0x00, 2);
/// Module state, bits 1..3.
pub const MODULE_STATE: Reg = Reg::new(0x00, 3);
/// Module controls: bit 0x10 low-power request, bit 0x08 software reset.
pub const MODULE_CONTROL: Reg = Reg::new(0x00, 26);
/// Manufacturer password entry, 4 bytes.
pub const PASSWORD_ENTRY: Reg = Reg::new(0x00, 122);

pub const LOW_POWER_BIT: u8 = 0x10;
pub const SOFT_RESET_BIT: u8 = 0x08;
pub const UPGRADE_UNSUPPORTED_BIT: u8 = 0x80;

// ============================================================================
// Firmware Info Registers
// ============================================================================

/// MCU running-image flags: low nibble image A, high nibble image B.
pub const MCU_FW_FLAGS: Reg = Reg::new(0x9F, 136);

// CMIS spec defined version registers, kept for backward compatibility.
pub const MCU_MAJOR: Reg = Reg::new(0x00, 39);
pub const MCU_MINOR: Reg = Reg::new(0x00, 40);
// Firmware below 0.23 reported its build number in the wrong registers.
pub const MCU_BUILD_HI_LEGACY: Reg = Reg::new(0x00, 41);
pub const MCU_BUILD_LO_LEGACY: Reg = Reg::new(0x00, 42);
pub const MCU_BUILD_HI: Reg = Reg::new(0x00, 64);
pub const MCU_BUILD_LO: Reg = Reg::new(0x00, 65);

pub const DSP_MAJOR: Reg = Reg::new(0x01, 194);
pub const DSP_MINOR: Reg = Reg::new(0x01, 195);
pub const DSP_BUILD_LO: Reg = Reg::new(0x01, 196);
pub const DSP_BUILD_HI: Reg = Reg::new(0x01, 197);

// MSA version registers moved in firmware 0.27.
pub const MSA_MAJOR_LEGACY: Reg = Reg::new(0x01, 191);
pub const MSA_MINOR_LEGACY: Reg = Reg::new(0x01, 192);
pub const MSA_BUILD_LEGACY: Reg = Reg::new(0x01, 193);
pub const MSA_MAJOR: Reg = Reg::new(0x01, 204);
pub const MSA_MINOR: Reg = Reg::new(0x01, 205);
pub const MSA_BUILD: Reg = Reg::new(0x01, 206);

/// MSA active-slot flags: bit 0x01 slot A, bit 0x02 slot B.
pub const MSA_SLOT_FLAGS: Reg = Reg::new(0x01, 202);

// ============================================================================
// Vendor Registers
// ============================================================================

/// One-byte MSA slot selector, holds ASCII 'A' or 'B'.
pub const MSA_SLOT_SELECT: Reg = Reg::new(0xF0, 149);
/// Retimer firmware-load trigger flag.
pub const DSP_FW_LOAD: Reg = Reg::new(0xF0, 221);

/// Operation mode register offset. The page it lives on moved from
/// B0h to D0h in firmware 0.27.
pub const OP_MODE_OFFSET: u8 = 254;
pub const OP_MODE_PAGE_LEGACY: u8 = 0xB0;
pub const OP_MODE_PAGE: u8 = 0xD0;
/// Reading this back after a password write confirms the unlock.
pub const OP_MODE_DEBUG: u8 = 0x09;
