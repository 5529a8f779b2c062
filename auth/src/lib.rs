//! Bearer token validation for the Phos gateway.
//!
//! - [`TokenValidator`] verifies signature, issuer, audience and expiry using
//!   exactly one strategy chosen at startup (JWKS or shared secret).
//! - [`JwksCache`] owns the identity provider's key set with TTL, a refresh
//!   ceiling and single-flight refresh.
//! - [`RoleExtractor`] turns a [`ValidatedToken`] into a normalized
//!   [`phos_types::Identity`].

pub mod claims;
pub mod error;
pub mod jwks;
pub mod validator;

pub use claims::RoleExtractor;
pub use error::{JwksError, TokenError};
pub use jwks::{JwksCache, JwksSettings, KeyKind, SigningKey};
pub use validator::{TokenValidator, ValidatedToken};
