//! omdfu-core: firmware upgrade engine for CDB-managed optical modules.
//!
//! Drives multi-component firmware upgrades (MCU, MSA register slot,
//! retimer/DSP) over a register-addressed command channel following the
//! CMIS CDB mailbox conventions.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: Register bus abstraction (plus a mock for tests)
//! - **Protocol**: CDB command framing, check codes, status polling
//! - **Image**: Firmware binary header and in-flash state section
//! - **Module**: Components, groups, slots and firmware metadata
//! - **Events**: Observer pattern for front-end decoupling
//! - **Upgrader**: High-level orchestrator with retry and verification
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use omdfu_core::{FirmwareUpgrader, Group, UpgraderConfig};
//! # use omdfu_core::MockModule;
//!
//! # let transport = MockModule::new();
//! let config = UpgraderConfig::default();
//! let mut upgrader = FirmwareUpgrader::new(transport, Group::All, config)?;
//! let info = upgrader.upgrade_firmware(Path::new("firmware/"), true)?;
//! println!("upgraded to {}", info.version);
//! # Ok::<(), omdfu_core::UpgradeError>(())
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod image;
pub mod module;
pub mod protocol;
pub mod transport;
pub mod upgrader;

// Re-exports for convenience
pub use config::{CdbTiming, UpgraderConfig};
pub use error::UpgradeError;
pub use events::{NullObserver, TracingObserver, UpgradeEvent, UpgradeObserver, UpgradePhase};
pub use image::{FwState, ImageFormatError, ImageHeader, ImageState};
pub use module::{Component, FirmwareInfo, FwVersion, Group, ModuleStatus, Slot};
pub use protocol::{CdbChannel, CdbStatus, ProtocolError};
pub use transport::{MockModule, RegisterTransport, TransportError};
pub use upgrader::{FirmwareUpgrader, HeaderInfo, UPGRADER_VERSION};
