//! Upgrade orchestrator.
//!
//! Owns per-component firmware metadata and drives the end-to-end
//! upgrade sequence: unlock, abort any stale transfer, locate
//! binaries, chunked per-component DFU, restart/commit, retimer load,
//! metadata refresh and post-upgrade verification, wrapped in a
//! fixed-attempt retry loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use tracing::{error, info, warn};

use crate::config::UpgraderConfig;
use crate::error::UpgradeError;
use crate::events::{NullObserver, TracingObserver, UpgradeEvent, UpgradeObserver, UpgradePhase};
use crate::image::ImageHeader;
use crate::module::{Component, FirmwareInfo, FwVersion, Group, ModuleStatus, Slot};
use crate::protocol::constants::{
    CMD_ABORT, CMD_COMMIT, CMD_COMPLETE, CMD_FW_INFO, CMD_RUN_IMAGE, CMD_START_DOWNLOAD,
    CMD_WRITE_CHUNK, DSP_FW_LOAD, DSP_BUILD_HI, DSP_BUILD_LO, DSP_MAJOR, DSP_MINOR, LOW_POWER_BIT,
    MCU_BUILD_HI, MCU_BUILD_HI_LEGACY, MCU_BUILD_LO, MCU_BUILD_LO_LEGACY, MCU_FW_FLAGS, MCU_MAJOR,
    MCU_MINOR, MODULE_CONTROL, MODULE_STATE, MSA_BUILD, MSA_BUILD_LEGACY, MSA_MAJOR,
    MSA_MAJOR_LEGACY, MSA_MINOR, MSA_MINOR_LEGACY, MSA_SLOT_FLAGS, MSA_SLOT_SELECT,
    OP_MODE_DEBUG, OP_MODE_OFFSET, OP_MODE_PAGE, OP_MODE_PAGE_LEGACY, PASSWORD_ENTRY, Reg,
    SOFT_RESET_BIT, UPGRADE_SUPPORT, UPGRADE_UNSUPPORTED_BIT,
};
use crate::protocol::CdbChannel;
use crate::transport::RegisterTransport;

/// Engine version reported to station software.
pub const UPGRADER_VERSION: (u8, u8) = (1, 4);

/// Summary of a binary's header, for station reporting.
#[derive(Debug, Clone)]
pub struct HeaderInfo {
    pub target: &'static str,
    pub device_id: &'static str,
    pub version: FwVersion,
    pub crc: u32,
}

/// Per-component firmware metadata for one session.
#[derive(Debug, Clone)]
struct FwTable {
    mcu: FirmwareInfo,
    msa: FirmwareInfo,
    dsp: FirmwareInfo,
}

impl FwTable {
    fn new() -> Self {
        Self {
            mcu: FirmwareInfo::new(Component::Mcu),
            msa: FirmwareInfo::new(Component::Msa),
            dsp: FirmwareInfo::new(Component::Dsp),
        }
    }

    fn get(&self, component: Component) -> &FirmwareInfo {
        match component {
            Component::Mcu => &self.mcu,
            Component::Msa => &self.msa,
            Component::Dsp => &self.dsp,
        }
    }

    fn get_mut(&mut self, component: Component) -> &mut FirmwareInfo {
        match component {
            Component::Mcu => &mut self.mcu,
            Component::Msa => &mut self.msa,
            Component::Dsp => &mut self.dsp,
        }
    }
}

/// A firmware upgrade session bound to one transport handle and one
/// component group.
pub struct FirmwareUpgrader<T: RegisterTransport> {
    channel: CdbChannel<T>,
    group: Group,
    config: UpgraderConfig,
    observer: Arc<dyn UpgradeObserver>,
    fw_info: FwTable,
    /// Module state at construction, restored after an upgrade.
    module_state: Option<ModuleStatus>,
    skip_status_check: bool,
    // Cached MCU version for the legacy register relocations.
    mcu_major: u8,
    mcu_minor: u8,
}

impl<T: RegisterTransport> std::fmt::Debug for FirmwareUpgrader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareUpgrader")
            .field("group", &self.group)
            .field("config", &self.config)
            .field("fw_info", &self.fw_info)
            .field("module_state", &self.module_state)
            .field("skip_status_check", &self.skip_status_check)
            .field("mcu_major", &self.mcu_major)
            .field("mcu_minor", &self.mcu_minor)
            .finish_non_exhaustive()
    }
}

impl<T: RegisterTransport> FirmwareUpgrader<T> {
    /// Create a session logging through tracing.
    pub fn new(transport: T, group: Group, config: UpgraderConfig) -> Result<Self, UpgradeError> {
        Self::with_observer(transport, group, config, Arc::new(TracingObserver))
    }

    /// Create a session reporting to a quiet observer.
    pub fn silent(transport: T, group: Group, config: UpgraderConfig) -> Result<Self, UpgradeError> {
        Self::with_observer(transport, group, config, Arc::new(NullObserver))
    }

    /// Create a session with a custom observer.
    ///
    /// Construction probes the device: transport failure here is
    /// fatal, as is the upgrade-unsupported flag. The unlock read-back
    /// is best-effort.
    pub fn with_observer(
        transport: T,
        group: Group,
        config: UpgraderConfig,
        observer: Arc<dyn UpgradeObserver>,
    ) -> Result<Self, UpgradeError> {
        let channel = CdbChannel::new(transport, config.chunk_size, config.cdb.clone());
        let mut upgrader = Self {
            channel,
            group,
            config,
            observer,
            fw_info: FwTable::new(),
            module_state: None,
            skip_status_check: false,
            mcu_major: 0,
            mcu_minor: 0,
        };

        // Snapshot the starting module state to return to after DFU.
        upgrader.module_state = upgrader.raw_module_status()?;

        let support = upgrader.channel.read_reg(UPGRADE_SUPPORT)?;
        if support & UPGRADE_UNSUPPORTED_BIT != 0 {
            return Err(UpgradeError::NotSupported);
        }

        upgrader.unlock()?;
        if upgrader.components().contains(&Component::Dsp)
            && !upgrader.set_low_power_mode(false, true)?
        {
            warn!("module did not reach Ready before session start");
        }
        upgrader.update_firmware_info()?;

        Ok(upgrader)
    }

    pub fn group(&self) -> Group {
        self.group
    }

    /// Components covered by this session's group.
    pub fn components(&self) -> &'static [Component] {
        self.group.components()
    }

    pub fn upgrader_version(&self) -> (u8, u8) {
        UPGRADER_VERSION
    }

    /// Skip CDB status polling, trusting the settle delays alone.
    pub fn set_skip_status_check(&mut self, skip: bool) {
        self.skip_status_check = skip;
    }

    fn resolve(&self, component: Option<Component>) -> Component {
        component.unwrap_or_else(|| self.group.representative())
    }

    /// Current firmware metadata for a component, defaulting to the
    /// group's representative.
    pub fn firmware_info(&self, component: Option<Component>) -> &FirmwareInfo {
        self.fw_info.get(self.resolve(component))
    }

    /// Re-read and return the version of a component as the 4-byte
    /// station report form.
    pub fn get_firmware_version(
        &mut self,
        component: Option<Component>,
    ) -> Result<[u8; 4], UpgradeError> {
        self.update_firmware_info()?;
        Ok(self.firmware_info(component).version_bytes())
    }

    pub fn get_active_image(&self, component: Option<Component>) -> Option<Slot> {
        self.firmware_info(component).active_image
    }

    /// Accumulated CRC bytes of the latest transfers.
    pub fn get_crc(&self, component: Option<Component>) -> &[u8] {
        &self.firmware_info(component).crc
    }

    /// Path of the binary used in the last DFU attempt.
    pub fn get_dfu_filename(&self, component: Option<Component>) -> Option<&Path> {
        self.firmware_info(component).filename.as_deref()
    }

    /// Header summary of a firmware binary on disk.
    pub fn file_header_info<P: AsRef<Path>>(path: P) -> Result<HeaderInfo, UpgradeError> {
        let image = ImageHeader::load(path)?;
        Ok(HeaderInfo {
            target: image.target_name(),
            device_id: image.id_name(),
            version: image.fw_version(),
            crc: image.compute_image_crc(),
        })
    }

    // ------------------------------------------------------------------
    // Module status and power helpers
    // ------------------------------------------------------------------

    fn raw_module_status(&mut self) -> Result<Option<ModuleStatus>, UpgradeError> {
        let raw = self.channel.read_reg(MODULE_STATE)?;
        Ok(ModuleStatus::from_register(raw))
    }

    /// Current module state from the status register.
    pub fn get_module_status(&mut self) -> Result<ModuleStatus, UpgradeError> {
        let raw = self.channel.read_reg(MODULE_STATE)?;
        ModuleStatus::from_register(raw).ok_or(UpgradeError::UnknownModuleState(raw))
    }

    /// Request low-power or normal mode. With `wait`, polls until the
    /// target state is reached and reports whether it was.
    pub fn set_low_power_mode(&mut self, lp_mode: bool, wait: bool) -> Result<bool, UpgradeError> {
        let controls = self.channel.read_reg(MODULE_CONTROL)?;
        let (value, target) = if lp_mode {
            (controls | LOW_POWER_BIT, ModuleStatus::LowPower)
        } else {
            (controls & !LOW_POWER_BIT, ModuleStatus::Ready)
        };
        self.channel.write_reg(MODULE_CONTROL, &[value])?;

        if !wait {
            return Ok(true);
        }
        for _ in 0..self.config.power_wait_attempts {
            if self.raw_module_status()? == Some(target) {
                return Ok(true);
            }
            thread::sleep(Duration::from_millis(self.config.power_wait_interval_ms));
        }
        Ok(false)
    }

    /// Full software reset to the bootloader.
    pub fn reset_module(&mut self) -> Result<(), UpgradeError> {
        self.channel.write_reg(MODULE_CONTROL, &[SOFT_RESET_BIT])?;
        Ok(())
    }

    /// Wait for the retimer to return to Ready after a firmware load.
    fn poll_retimer(&mut self) -> Result<bool, UpgradeError> {
        info!("updating DSP firmware");
        for attempt in 0..self.config.retimer_wait_attempts {
            if self.raw_module_status()? == Some(ModuleStatus::Ready) {
                return Ok(true);
            }
            self.observer.on_event(&UpgradeEvent::Progress {
                component: Component::Dsp,
                sent: attempt as usize,
                total: self.config.retimer_wait_attempts as usize,
            });
            thread::sleep(Duration::from_millis(self.config.retimer_wait_interval_ms));
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Unlock / lock
    // ------------------------------------------------------------------

    fn op_mode_reg(&self) -> Reg {
        // The operation mode register moved pages in firmware 0.27.
        let page = if self.mcu_major == 0 && self.mcu_minor < 27 {
            OP_MODE_PAGE_LEGACY
        } else {
            OP_MODE_PAGE
        };
        Reg::new(page, OP_MODE_OFFSET)
    }

    /// Unlock the module to enable CDB commands. A read-back mismatch
    /// means a bad password; it is logged and the session continues
    /// best-effort.
    pub fn unlock(&mut self) -> Result<(), UpgradeError> {
        let password = self.config.password;
        self.channel.write_reg(PASSWORD_ENTRY, &password)?;

        self.mcu_major = self.channel.read_reg(MCU_MAJOR)?;
        self.mcu_minor = self.channel.read_reg(MCU_MINOR)?;

        let reg = self.op_mode_reg();
        self.channel.write_reg(reg, &[OP_MODE_DEBUG])?;
        if self.channel.read_reg(reg)? != OP_MODE_DEBUG {
            error!("Error: Incorrect password.");
        }
        Ok(())
    }

    /// Lock the module to disable CDB commands.
    pub fn lock(&mut self) -> Result<(), UpgradeError> {
        self.channel.write_reg(PASSWORD_ENTRY, &[0, 0, 0, 0])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Firmware info
    // ------------------------------------------------------------------

    /// Refresh the per-component firmware metadata from the device.
    ///
    /// DSP version info is invalid while the module sits in low power.
    pub fn update_firmware_info(&mut self) -> Result<(), UpgradeError> {
        self.channel
            .send(CMD_FW_INFO, &[], 0, self.skip_status_check)?;

        let flags = self.channel.read_reg(MCU_FW_FLAGS)?;
        let a_flags = flags & 0x0F;
        let b_flags = (flags >> 4) & 0x0F;
        let mcu_slot = if a_flags & 0x01 != 0 {
            Slot::A
        } else if b_flags & 0x01 != 0 {
            Slot::B
        } else {
            return Err(UpgradeError::InvalidFirmwareFlags {
                component: Component::Mcu,
                flags,
            });
        };

        self.mcu_major = self.channel.read_reg(MCU_MAJOR)?;
        self.mcu_minor = self.channel.read_reg(MCU_MINOR)?;
        // Firmware below 0.23 reported its build in the wrong registers.
        let mcu_build = if self.mcu_major == 0 && self.mcu_minor < 23 {
            (u16::from(self.channel.read_reg(MCU_BUILD_HI_LEGACY)?) << 8)
                | u16::from(self.channel.read_reg(MCU_BUILD_LO_LEGACY)?)
        } else {
            (u16::from(self.channel.read_reg(MCU_BUILD_HI)?) << 8)
                | u16::from(self.channel.read_reg(MCU_BUILD_LO)?)
        };
        let mcu = self.fw_info.get_mut(Component::Mcu);
        mcu.version = FwVersion::new(self.mcu_major, self.mcu_minor, mcu_build);
        mcu.active_image = Some(mcu_slot);

        let dsp_major = self.channel.read_reg(DSP_MAJOR)?;
        let dsp_minor = self.channel.read_reg(DSP_MINOR)?;
        let dsp_build = (u16::from(self.channel.read_reg(DSP_BUILD_HI)?) << 8)
            | u16::from(self.channel.read_reg(DSP_BUILD_LO)?);
        let dsp = self.fw_info.get_mut(Component::Dsp);
        dsp.version = FwVersion::new(dsp_major, dsp_minor, dsp_build);

        // MSA version registers moved in firmware 0.27.
        let (msa_major, msa_minor, msa_build) = if self.mcu_major == 0 && self.mcu_minor < 27 {
            (
                self.channel.read_reg(MSA_MAJOR_LEGACY)?,
                self.channel.read_reg(MSA_MINOR_LEGACY)?,
                u16::from(self.channel.read_reg(MSA_BUILD_LEGACY)?),
            )
        } else {
            (
                self.channel.read_reg(MSA_MAJOR)?,
                self.channel.read_reg(MSA_MINOR)?,
                u16::from(self.channel.read_reg(MSA_BUILD)?),
            )
        };
        let slot_flags = self.channel.read_reg(MSA_SLOT_FLAGS)?;
        let msa_slot = if slot_flags & 0x01 != 0 {
            Slot::A
        } else if slot_flags & 0x02 != 0 {
            Slot::B
        } else {
            return Err(UpgradeError::InvalidFirmwareFlags {
                component: Component::Msa,
                flags: slot_flags,
            });
        };
        let msa = self.fw_info.get_mut(Component::Msa);
        msa.version = FwVersion::new(msa_major, msa_minor, msa_build);
        msa.active_image = Some(msa_slot);

        Ok(())
    }

    // ------------------------------------------------------------------
    // DFU primitives
    // ------------------------------------------------------------------

    /// Abort any in-progress download. Failure means there was nothing
    /// to abort; it is logged, not propagated.
    pub fn dfu_abort(&mut self) {
        if let Err(err) = self.channel.send(CMD_ABORT, &[], 0, self.skip_status_check) {
            error!("Previous attempt failed with: {err}");
        }
    }

    /// Run-image command with the given reset delay.
    pub fn dfu_restart(&mut self, delay_ms: u16) -> Result<(), UpgradeError> {
        let mut lpl = Vec::with_capacity(4);
        lpl.push(0); // reserved
        lpl.push(0); // reset mode
        lpl.write_u16::<BigEndian>(delay_ms).unwrap();
        info!("Resetting ...");
        self.channel
            .send(CMD_RUN_IMAGE, &lpl, 0, self.skip_status_check)?;
        Ok(())
    }

    /// Commit the running image as the boot default.
    pub fn dfu_commit(&mut self) -> Result<(), UpgradeError> {
        info!("Committing image.");
        self.channel
            .send(CMD_COMMIT, &[], 0, self.skip_status_check)?;
        Ok(())
    }

    /// Chunked DFU transfer of one parsed image. Returns the CRC of
    /// the transferred data.
    fn transfer(&mut self, component: Component, image: &ImageHeader) -> Result<u32, UpgradeError> {
        let header = image.header_bytes();
        // The state section never travels; only the covered range.
        let data = image.covered_data();

        let mut lpl = Vec::with_capacity(8 + header.len());
        lpl.write_u32::<BigEndian>((data.len() + header.len()) as u32)
            .unwrap();
        lpl.extend_from_slice(&[0; 4]); // reserved
        lpl.extend_from_slice(&header); // vendor data
        self.channel
            .send(CMD_START_DOWNLOAD, &lpl, 0, self.skip_status_check)?;

        let chunk_size = self.config.chunk_size;
        let total = data.len().div_ceil(chunk_size).max(1);
        let mut address: u32 = 0;
        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            self.observer.on_event(&UpgradeEvent::Progress {
                component,
                sent: index + 1,
                total,
            });
            let mut lpl = Vec::with_capacity(4 + chunk.len());
            lpl.write_u32::<BigEndian>(address).unwrap();
            lpl.extend_from_slice(chunk);
            self.channel
                .send(CMD_WRITE_CHUNK, &lpl, chunk.len() as u8, self.skip_status_check)?;
            address += chunk.len() as u32;
        }

        self.channel
            .send(CMD_COMPLETE, &[], 0, self.skip_status_check)?;

        Ok(image.compute_image_crc())
    }

    // ------------------------------------------------------------------
    // Upgrade sequence
    // ------------------------------------------------------------------

    fn phase(&self, phase: UpgradePhase) {
        self.observer.on_event(&UpgradeEvent::PhaseChanged { phase });
    }

    /// Locate the upgrade binary for one component under `dir`.
    fn find_binary(&self, component: Component, dir: &Path) -> Result<PathBuf, UpgradeError> {
        let inactive = self
            .fw_info
            .get(Component::Mcu)
            .active_image
            .map(|slot| slot.other());
        let pattern = component.file_pattern(inactive);

        let full = format!("{}/**/{}", dir.display(), pattern);
        let mut matches = glob::glob(&full)
            .map_err(|_| UpgradeError::InvalidFirmwareLocation(dir.to_path_buf()))?
            .filter_map(Result::ok);
        matches.next().ok_or(UpgradeError::MissingBinary {
            component,
            pattern,
            dir: dir.to_path_buf(),
        })
    }

    fn upgrade_attempt(&mut self, dir: &Path, verify: bool) -> Result<(), UpgradeError> {
        let mut expected: HashMap<Component, FwVersion> = HashMap::new();
        let mut old_slots: HashMap<Component, Slot> = HashMap::new();

        if self.components().contains(&Component::Dsp)
            && !self.set_low_power_mode(false, true)?
        {
            warn!("module did not reach Ready before transfer");
        }
        self.update_firmware_info()?;

        if !dir.exists() {
            error!("Invalid firmware location.");
            return Err(UpgradeError::InvalidFirmwareLocation(dir.to_path_buf()));
        }
        // A file path means "use its directory"; the binaries are
        // picked per component by pattern.
        let dir = if dir.is_dir() {
            dir.to_path_buf()
        } else {
            dir.parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| UpgradeError::InvalidFirmwareLocation(dir.to_path_buf()))?
        };
        if !dir.is_dir() {
            return Err(UpgradeError::InvalidFirmwareLocation(dir));
        }

        // Clean slate in case a previous DFU was cut off mid-transfer.
        self.phase(UpgradePhase::AbortStale);
        self.dfu_abort();

        self.phase(UpgradePhase::LocateFiles);
        for &component in self.components() {
            let file = self.find_binary(component, &dir)?;
            self.fw_info.get_mut(component).filename = Some(file);
        }

        self.phase(UpgradePhase::Transfer);
        for &component in self.components() {
            let file = match &self.fw_info.get(component).filename {
                Some(file) => file.clone(),
                None => return Err(UpgradeError::MissingBinary {
                    component,
                    pattern: component.file_pattern(None),
                    dir: dir.clone(),
                }),
            };
            info!("Initiating FW upgrade using binary file: {}", file.display());
            self.observer.on_event(&UpgradeEvent::ComponentStarted {
                component,
                filename: file.display().to_string(),
            });

            let image = ImageHeader::load(&file)?;
            if verify {
                expected.insert(component, image.fw_version());
                // Hold onto the original slot for verification.
                if component.has_slots() {
                    if let Some(slot) = self.fw_info.get(component).active_image {
                        old_slots.insert(component, slot);
                    }
                }
            }

            let crc = self.transfer(component, &image)?;
            // Transfers concatenate: one big-endian word per transfer.
            self.fw_info
                .get_mut(component)
                .crc
                .extend_from_slice(&crc.to_be_bytes());
            info!("File CRC: 0x{crc:X}");
        }

        self.phase(UpgradePhase::Restart);
        if self.components().contains(&Component::Mcu) {
            self.dfu_restart(100)?;
        } else {
            self.reset_module()?;
        }

        thread::sleep(Duration::from_millis(self.config.reset_delay_ms));
        self.unlock()?;

        if self.components().contains(&Component::Mcu) {
            self.dfu_commit()?;
        }

        if self.components().contains(&Component::Dsp) {
            // Trigger the retimer firmware load and wait for Ready.
            self.channel.write_reg(DSP_FW_LOAD, &[1])?;
            self.set_low_power_mode(false, false)?;
            if !self.poll_retimer()? {
                return Err(UpgradeError::RetimerTimeout);
            }
        }

        self.phase(UpgradePhase::Refresh);
        self.update_firmware_info()?;

        // Return the module to its pre-upgrade power state.
        if let Some(initial) = self.module_state {
            if self.raw_module_status()? != Some(initial) {
                if initial == ModuleStatus::LowPower {
                    self.set_low_power_mode(true, false)?;
                } else {
                    self.set_low_power_mode(false, true)?;
                }
            }
        }

        if verify {
            self.phase(UpgradePhase::Verify);
            for &component in self.components() {
                let info = self.fw_info.get(component);
                let actual = info.version;

                if component.has_slots() {
                    let old = old_slots.get(&component).copied();
                    if old.is_some() && old == info.active_image {
                        let slot = old.map(|s| s.as_char()).unwrap_or('?');
                        error!(
                            component = %component,
                            old_slot = %slot,
                            "active slot did not change"
                        );
                        return Err(UpgradeError::SlotUnchanged { component, slot });
                    }
                }

                let wanted = expected.get(&component).copied().unwrap_or_default();
                if wanted != actual {
                    error!("Expected Version : {wanted}");
                    error!("New Version : {actual}");
                    return Err(UpgradeError::VersionMismatch {
                        component,
                        expected: wanted,
                        actual,
                    });
                }
                self.observer
                    .on_event(&UpgradeEvent::ComponentVerified { component });
            }
        }

        self.phase(UpgradePhase::Complete);
        Ok(())
    }

    /// Upgrade the session's components from binaries under
    /// `upgrade_path`, retrying the whole sequence on any failure up
    /// to the configured attempt budget.
    ///
    /// On success returns the firmware info of the group's
    /// representative component.
    pub fn upgrade_firmware(
        &mut self,
        upgrade_path: &Path,
        verify: bool,
    ) -> Result<FirmwareInfo, UpgradeError> {
        let mut remaining = self.config.dfu_attempts.max(1);

        loop {
            match self.upgrade_attempt(upgrade_path, verify) {
                Ok(()) => break,
                Err(err) => {
                    remaining -= 1;
                    self.observer.on_event(&UpgradeEvent::RetryScheduled {
                        remaining,
                        message: err.to_string(),
                        explanation: err.explanation(),
                    });
                    if remaining == 0 {
                        return Err(err);
                    }
                }
            }
        }

        self.observer.on_event(&UpgradeEvent::Complete);
        Ok(self.firmware_info(None).clone())
    }

    /// Switch a slot-bearing component to its unused firmware slot.
    ///
    /// The MCU boots the other slot directly via run-image; the MSA
    /// flips its slot selector and resets the module.
    pub fn switch_slot(&mut self, component: Option<Component>) -> Result<(), UpgradeError> {
        match self.resolve(component) {
            Component::Mcu => self.dfu_restart(100)?,
            Component::Msa => {
                let current = self.channel.read_reg(MSA_SLOT_SELECT)?;
                let next = match Slot::from_char(current as char) {
                    Some(Slot::A) => Slot::B,
                    _ => Slot::A,
                };
                self.channel
                    .write_reg(MSA_SLOT_SELECT, &[next.as_char() as u8])?;
                self.reset_module()?;
            }
            Component::Dsp => return Ok(()),
        }

        thread::sleep(Duration::from_millis(self.config.reset_delay_ms));
        if !self.set_low_power_mode(false, true)? {
            warn!("module did not return to Ready after slot switch");
        }
        Ok(())
    }

    /// Hand the transport back, ending the session.
    pub fn into_transport(self) -> T {
        self.channel.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CdbTiming;
    use crate::transport::MockModule;
    use std::fs;
    use std::sync::Mutex;

    struct CapturingObserver {
        events: Mutex<Vec<UpgradeEvent>>,
    }

    impl CapturingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn retries(&self) -> Vec<u32> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    UpgradeEvent::RetryScheduled { remaining, .. } => Some(*remaining),
                    _ => None,
                })
                .collect()
        }
    }

    impl UpgradeObserver for CapturingObserver {
        fn on_event(&self, event: &UpgradeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn fast_config() -> UpgraderConfig {
        UpgraderConfig {
            reset_delay_ms: 0,
            power_wait_attempts: 2,
            power_wait_interval_ms: 0,
            retimer_wait_attempts: 3,
            retimer_wait_interval_ms: 0,
            cdb: CdbTiming {
                poll_interval_ms: 1,
                status_timeout_ms: 20,
                erase_settle_ms: 0,
                write_settle_ms: 0,
                complete_settle_ms: 0,
            },
            ..UpgraderConfig::default()
        }
    }

    /// A mock module in Ready state with sane firmware info registers.
    /// MCU 1.27.1 keeps all register reads on the current-layout path.
    fn ready_module() -> MockModule {
        let mock = MockModule::new();
        mock.set_reg(0x00, 3, 0x06); // Ready
        mock.set_reg(0x00, 37, 0x01); // CDB success
        // The firmware-info reply lands in the RLPL area, which the
        // LPL staging traffic overwrites between commands.
        mock.set_command_reply(CMD_FW_INFO, 0x9F, 8, &[0x01]); // image A running
        mock.set_reg(0x00, 39, 1); // MCU major
        mock.set_reg(0x00, 40, 27); // MCU minor
        mock.set_reg(0x00, 65, 1); // MCU build
        mock.set_reg(0x01, 66, 2); // DSP major
        mock.set_reg(0x01, 67, 5); // DSP minor
        mock.set_reg(0x01, 68, 9); // DSP build lo
        mock.set_reg(0x01, 76, 1); // MSA major
        mock.set_reg(0x01, 77, 2); // MSA minor
        mock.set_reg(0x01, 78, 3); // MSA build
        mock.set_reg(0x01, 74, 0x01); // MSA slot A
        mock
    }

    fn session(mock: &MockModule, group: Group) -> FirmwareUpgrader<MockModule> {
        FirmwareUpgrader::silent(mock.clone(), group, fast_config()).unwrap()
    }

    /// Write a firmware binary with a valid header and version.
    fn make_image(dir: &Path, name: &str, id: &str, version: (u8, u8, u16)) -> PathBuf {
        let path = dir.join(name);
        let payload: Vec<u8> = (0u16..300).map(|v| (v % 241) as u8).collect();
        fs::write(&path, &payload).unwrap();
        let mut header = ImageHeader::create(&path, id, "stm32").unwrap();
        header.set_version(Some(version.0), Some(version.1), Some(version.2));
        header.write(None).unwrap();
        path
    }

    #[test]
    fn construction_reads_metadata() {
        let mock = ready_module();
        let up = session(&mock, Group::All);
        assert_eq!(up.components().len(), 3);
        let mcu = up.firmware_info(Some(Component::Mcu));
        assert_eq!(mcu.version, FwVersion::new(1, 27, 1));
        assert_eq!(mcu.active_image, Some(Slot::A));
        let msa = up.firmware_info(Some(Component::Msa));
        assert_eq!(msa.version, FwVersion::new(1, 2, 3));
        let dsp = up.firmware_info(Some(Component::Dsp));
        assert_eq!(dsp.version, FwVersion::new(2, 5, 9));
        assert_eq!(dsp.active_image, None);
    }

    #[test]
    fn construction_fails_when_upgrade_unsupported() {
        let mock = ready_module();
        mock.set_reg(0x00, 2, 0x80);
        let err = FirmwareUpgrader::silent(mock.clone(), Group::Sup, fast_config()).unwrap_err();
        assert!(matches!(err, UpgradeError::NotSupported));
    }

    #[test]
    fn group_expansion_in_session() {
        let mock = ready_module();
        assert_eq!(session(&mock, Group::Sup).components(), &[Component::Mcu]);
        assert_eq!(
            session(&mock, Group::All).components(),
            &[Component::Mcu, Component::Msa, Component::Dsp]
        );
    }

    #[test]
    fn unlock_writes_password_and_debug_mode() {
        let mock = ready_module();
        let _up = session(&mock, Group::Msa);
        assert_eq!(mock.get_reg(0x00, 122), 0x88);
        // MCU 1.27 puts the operation mode register on page D0h.
        assert_eq!(mock.get_reg(0xD0, 126), OP_MODE_DEBUG);
    }

    #[test]
    fn retry_bound_is_three_attempts() {
        let mock = ready_module();
        let observer = CapturingObserver::new();
        let mut up = FirmwareUpgrader::with_observer(
            mock.clone(),
            Group::Msa,
            fast_config(),
            observer.clone(),
        )
        .unwrap();
        mock.clear_writes();

        let missing = Path::new("/nonexistent/firmware/dir");
        let err = up.upgrade_firmware(missing, false).unwrap_err();
        assert!(matches!(err, UpgradeError::InvalidFirmwareLocation(_)));

        // One firmware-info request per attempt, exactly three attempts.
        let info_requests = mock
            .commands_sent()
            .iter()
            .filter(|&&cmd| cmd == CMD_FW_INFO)
            .count();
        assert_eq!(info_requests, 3);
        assert_eq!(observer.retries(), vec![2, 1, 0]);
    }

    #[test]
    fn upgrade_transfers_and_reports_crc() {
        let mock = ready_module();
        let dir = tempfile::tempdir().unwrap();
        let file = make_image(dir.path(), "acme_cmis_fw_x_v1.2.3.bin", "crs", (1, 2, 3));

        let mut up = session(&mock, Group::Msa);
        let info = up.upgrade_firmware(dir.path(), false).unwrap();

        assert_eq!(info.component, Component::Msa);
        assert_eq!(info.filename.as_deref(), Some(file.as_path()));
        let expected_crc = ImageHeader::load(&file).unwrap().compute_image_crc();
        assert_eq!(info.crc, expected_crc.to_be_bytes().to_vec());

        let commands = mock.commands_sent();
        assert!(commands.contains(&CMD_ABORT));
        assert!(commands.contains(&CMD_START_DOWNLOAD));
        assert!(commands.contains(&CMD_WRITE_CHUNK));
        assert!(commands.contains(&CMD_COMPLETE));
        // MSA-only upgrades reset the module instead of run-image.
        assert!(!commands.contains(&CMD_RUN_IMAGE));
        assert!(!commands.contains(&CMD_COMMIT));
    }

    #[test]
    fn mcu_upgrade_targets_inactive_slot_and_commits() {
        let mock = ready_module();
        let dir = tempfile::tempdir().unwrap();
        make_image(dir.path(), "acme_module_fw_v1.27.2_a.bin", "a", (1, 27, 2));
        let b_file = make_image(dir.path(), "acme_module_fw_v1.27.2_b.bin", "b", (1, 27, 2));

        let mut up = session(&mock, Group::Sup);
        let info = up.upgrade_firmware(dir.path(), false).unwrap();

        // Image A is running, so the B binary is selected.
        assert_eq!(info.filename.as_deref(), Some(b_file.as_path()));
        let commands = mock.commands_sent();
        assert!(commands.contains(&CMD_RUN_IMAGE));
        assert!(commands.contains(&CMD_COMMIT));
    }

    #[test]
    fn slot_unchanged_fails_verification() {
        let mock = ready_module();
        let dir = tempfile::tempdir().unwrap();
        // Register versions agree with the binary, but the mock never
        // flips the active slot.
        make_image(dir.path(), "acme_cmis_fw_x_v1.2.3.bin", "crs", (1, 2, 3));

        let mut up = session(&mock, Group::Msa);
        let err = up.upgrade_firmware(dir.path(), true).unwrap_err();
        match err {
            UpgradeError::SlotUnchanged { component, slot } => {
                assert_eq!(component, Component::Msa);
                assert_eq!(slot, 'A');
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn version_mismatch_fails_verification() {
        let mock = ready_module();
        // Registers report DSP 1.2.299 while the binary declares 1.2.300.
        mock.set_reg(0x01, 66, 1);
        mock.set_reg(0x01, 67, 2);
        mock.set_reg(0x01, 68, (299u16 & 0xFF) as u8);
        mock.set_reg(0x01, 69, (299u16 >> 8) as u8);
        let dir = tempfile::tempdir().unwrap();
        make_image(dir.path(), "acme_retimer_fw_v1.2.300.bin", "taurus_osfp", (1, 2, 300));

        let mut up = session(&mock, Group::Dsp);
        let err = up.upgrade_firmware(dir.path(), true).unwrap_err();
        match err {
            UpgradeError::VersionMismatch {
                component,
                expected,
                actual,
            } => {
                assert_eq!(component, Component::Dsp);
                assert_eq!(expected, FwVersion::new(1, 2, 300));
                assert_eq!(actual, FwVersion::new(1, 2, 299));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_binary_is_an_input_error() {
        let mock = ready_module();
        let dir = tempfile::tempdir().unwrap();
        let mut up = session(&mock, Group::Dsp);
        let err = up.upgrade_firmware(dir.path(), false).unwrap_err();
        match err {
            UpgradeError::MissingBinary { component, .. } => {
                assert_eq!(component, Component::Dsp)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn low_power_wait_reports_failure() {
        let mock = ready_module();
        let mut up = session(&mock, Group::Msa);
        // The mock stays in Ready, so Low Power is never reached.
        assert!(!up.set_low_power_mode(true, true).unwrap());
        // Disabling reaches the (already current) Ready state.
        assert!(up.set_low_power_mode(false, true).unwrap());
    }

    #[test]
    fn msa_slot_switch_flips_selector_and_resets() {
        let mock = ready_module();
        mock.set_reg(0xF0, 21, b'A');
        let mut up = session(&mock, Group::Msa);
        up.switch_slot(None).unwrap();
        assert_eq!(mock.get_reg(0xF0, 21), b'B');
        // Soft reset was issued via the module control register.
        assert!(mock
            .writes()
            .iter()
            .any(|(page, offset, data)| *page == 0 && *offset == 26 && data == &[SOFT_RESET_BIT]));
    }

    #[test]
    fn dsp_retimer_load_sets_flag() {
        let mock = ready_module();
        let dir = tempfile::tempdir().unwrap();
        make_image(dir.path(), "acme_retimer_fw_v2.5.9.bin", "taurus_osfp", (2, 5, 9));
        let mut up = session(&mock, Group::Dsp);
        up.upgrade_firmware(dir.path(), true).unwrap();
        assert_eq!(mock.get_reg(0xF0, 93), 1);
    }
}
