//! Register transport abstraction and implementations.

pub mod mock;
pub mod traits;

pub use mock::MockModule;
pub use traits::{RegisterTransport, TransportError};
