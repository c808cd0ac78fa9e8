//! Device-level types: components, groups, slots, module status and
//! per-component firmware metadata.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One of the module's upgradeable firmware components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Microcontroller image.
    Mcu,
    /// CMIS register-slot image.
    Msa,
    /// Retimer/DSP image.
    Dsp,
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Component::Mcu => "MCU",
            Component::Msa => "MSA",
            Component::Dsp => "DSP",
        }
    }

    /// Whether this component stores its firmware in A/B slots.
    pub fn has_slots(&self) -> bool {
        matches!(self, Component::Mcu | Component::Msa)
    }

    /// Filename glob for this component's upgrade binary. The MCU
    /// pattern depends on which slot is currently running.
    pub fn file_pattern(&self, inactive: Option<Slot>) -> &'static str {
        match (self, inactive) {
            (Component::Mcu, Some(Slot::B)) => "*_module_fw_v*_b.bin",
            (Component::Mcu, _) => "*_module_fw_v*_a.bin",
            (Component::Msa, _) => "*_cmis_fw*_v*.bin",
            (Component::Dsp, _) => "*_retimer_fw_v*.bin",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A component group as requested by the caller. The arguments from
/// the user are group designations rather than actual components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    All,
    Mcu,
    Sup,
    Msa,
    Dsp,
}

impl Group {
    /// The fixed group-to-components expansion.
    pub fn components(&self) -> &'static [Component] {
        match self {
            Group::All => &[Component::Mcu, Component::Msa, Component::Dsp],
            Group::Mcu => &[Component::Mcu, Component::Msa],
            Group::Sup => &[Component::Mcu],
            Group::Msa => &[Component::Msa],
            Group::Dsp => &[Component::Dsp],
        }
    }

    /// The component whose firmware info represents the group.
    pub fn representative(&self) -> Component {
        match self {
            Group::All | Group::Mcu | Group::Sup => Component::Mcu,
            Group::Msa => Component::Msa,
            Group::Dsp => Component::Dsp,
        }
    }
}

impl FromStr for Group {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(Group::All),
            "MCU" => Ok(Group::Mcu),
            "SUP" => Ok(Group::Sup),
            "MSA" => Ok(Group::Msa),
            "DSP" => Ok(Group::Dsp),
            other => Err(format!("unknown component group: {other}")),
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::All => f.write_str("ALL"),
            Group::Mcu => f.write_str("MCU"),
            Group::Sup => f.write_str("SUP"),
            Group::Msa => f.write_str("MSA"),
            Group::Dsp => f.write_str("DSP"),
        }
    }
}

/// One of the two redundant firmware storage locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(&self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Slot::A => 'A',
            Slot::B => 'B',
        }
    }

    pub fn from_char(c: char) -> Option<Slot> {
        match c {
            'A' => Some(Slot::A),
            'B' => Some(Slot::B),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Module state as decoded from bits 1..3 of the state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    LowPower = 1,
    PowerUp = 2,
    Ready = 3,
    PowerDown = 4,
    /// Terminal condition; surfaced but never recovered automatically.
    Fault = 5,
}

impl ModuleStatus {
    /// Decode a raw state-register byte.
    pub fn from_register(raw: u8) -> Option<ModuleStatus> {
        match (raw & 0x0E) >> 1 {
            1 => Some(ModuleStatus::LowPower),
            2 => Some(ModuleStatus::PowerUp),
            3 => Some(ModuleStatus::Ready),
            4 => Some(ModuleStatus::PowerDown),
            5 => Some(ModuleStatus::Fault),
            _ => None,
        }
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::LowPower => f.write_str("LowPower"),
            ModuleStatus::PowerUp => f.write_str("PowerUp"),
            ModuleStatus::Ready => f.write_str("Ready"),
            ModuleStatus::PowerDown => f.write_str("PowerDown"),
            ModuleStatus::Fault => f.write_str("Fault"),
        }
    }
}

/// A firmware version triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FwVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl FwVersion {
    pub fn new(major: u8, minor: u8, build: u16) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    /// The 4-byte big-endian form used in station reports.
    pub fn as_bytes(&self) -> [u8; 4] {
        [
            self.major,
            self.minor,
            (self.build >> 8) as u8,
            (self.build & 0xFF) as u8,
        ]
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Per-component firmware metadata, built once per upgrade session and
/// refreshed by `update_firmware_info`.
#[derive(Debug, Clone)]
pub struct FirmwareInfo {
    pub component: Component,
    pub version: FwVersion,
    /// Running image slot. `None` for the DSP, which has no slots.
    pub active_image: Option<Slot>,
    /// Accumulated transfer CRCs, one big-endian 4-byte word appended
    /// per completed transfer.
    pub crc: Vec<u8>,
    /// Binary used in the last transfer, if any.
    pub filename: Option<PathBuf>,
}

impl FirmwareInfo {
    pub fn new(component: Component) -> Self {
        Self {
            component,
            version: FwVersion::default(),
            active_image: match component {
                Component::Dsp => None,
                _ => Some(Slot::A),
            },
            crc: Vec::new(),
            filename: None,
        }
    }

    pub fn version_bytes(&self) -> [u8; 4] {
        self.version.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_expansion() {
        assert_eq!(
            Group::All.components(),
            &[Component::Mcu, Component::Msa, Component::Dsp]
        );
        assert_eq!(Group::Mcu.components(), &[Component::Mcu, Component::Msa]);
        assert_eq!(Group::Sup.components(), &[Component::Mcu]);
        assert_eq!(Group::Msa.components(), &[Component::Msa]);
        assert_eq!(Group::Dsp.components(), &[Component::Dsp]);
    }

    #[test]
    fn group_parse_is_case_insensitive() {
        assert_eq!("sup".parse::<Group>().unwrap(), Group::Sup);
        assert_eq!("All".parse::<Group>().unwrap(), Group::All);
        assert!("XYZ".parse::<Group>().is_err());
    }

    #[test]
    fn module_status_decode() {
        assert_eq!(ModuleStatus::from_register(0x02), Some(ModuleStatus::LowPower));
        assert_eq!(ModuleStatus::from_register(0x06), Some(ModuleStatus::Ready));
        // Bits outside 1..3 are masked off.
        assert_eq!(ModuleStatus::from_register(0xF6), Some(ModuleStatus::Ready));
        assert_eq!(ModuleStatus::from_register(0x00), None);
    }

    #[test]
    fn version_bytes_are_big_endian() {
        let v = FwVersion::new(1, 2, 0x1234);
        assert_eq!(v.as_bytes(), [1, 2, 0x12, 0x34]);
        assert_eq!(v.to_string(), "1.2.4660");
    }

    #[test]
    fn mcu_pattern_targets_inactive_slot() {
        assert_eq!(
            Component::Mcu.file_pattern(Some(Slot::B)),
            "*_module_fw_v*_b.bin"
        );
        assert_eq!(
            Component::Mcu.file_pattern(Some(Slot::A)),
            "*_module_fw_v*_a.bin"
        );
        assert_eq!(Component::Dsp.file_pattern(None), "*_retimer_fw_v*.bin");
    }
}
