//! YubiKey one-time-password validation.
//!
//! Two validation modes share one façade:
//! - **Self-hosted**: OTPs decrypt and validate entirely offline against a
//!   locally stored per-device AES-128 secret, with replay defense over the
//!   device's `(counter, session)` pair persisted in a device-record store.
//! - **Yubico cloud**: validation is delegated to the Yubico Validation
//!   Protocol V2.0 servers, with signed requests and response-signature
//!   verification.
//!
//! ```no_run
//! use ykotp::YubiAuth;
//!
//! # fn main() -> ykotp::Result<()> {
//! let mut auth = YubiAuth::new("file:/var/lib/ykotp/devices.db")?;
//! auth.set_token("6782a7960cf0jhvhgtetkdektuiucfgijuitkjjtdngt");
//! let user = auth.validate()?;
//! println!("validated device of {}", user.email);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod otp;
pub mod status;
pub mod store;
pub mod yubico;

#[cfg(test)]
pub(crate) mod testdata;

pub use auth::YubiAuth;
pub use otp::{parse_token, validate_otp, Token, OTP_SIZE, PUB_LEN};
pub use status::{AuthError, Result, Status};
pub use store::{MemoryStore, SecretCodec, SqliteStore, UserStore, YubiUser};
pub use yubico::{verify_default, VerifyRequest, VerifyResponse, YubiClient, YubicoConfig};
