//! CDB command protocol layer.

pub mod cdb;
pub mod constants;
pub mod status;

pub use cdb::{CdbChannel, ProtocolError, check_code, remap};
pub use status::{CdbStatus, explain_failure};
