// conclave-common: protocol, error kinds and timeout hierarchy shared by the
// daemon and the shim.

pub mod confidence;
pub mod error;
pub mod protocol;
pub mod timeout;

pub use confidence::Confidence;
pub use error::ErrorKind;
pub use timeout::{clamped_setting_duration, setting_duration, ConfigError, TimeoutConfig};
