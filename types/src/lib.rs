pub mod envelope;
pub mod error_code;
pub mod identity;

pub use envelope::ErrorEnvelope;
pub use error_code::ErrorCode;
pub use identity::{normalize_role, Identity};
