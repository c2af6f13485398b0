//! YubiKey OTP token structure and parsing.
//!
//! A token as emitted by a key press is 12 ModHex characters of public id
//! followed by 32 ModHex characters of AES-encrypted payload. See
//! <https://developers.yubico.com/OTP/OTPs_Explained.html>.

pub mod modhex;
mod validate;

pub use modhex::{crc16, modhex_decode, modhex_encode, CRC_OK_RESIDUE, MODHEX_MAP};
pub use validate::validate_otp;

use crate::status::{Result, Status};

/// Length of the device private identity inside the decrypted payload.
pub const UID_SIZE: usize = 6;

/// Length of the public id prefix of a full token.
pub const PUB_LEN: usize = 12;

/// AES-128 key and block size.
pub const AES_SIZE: usize = 16;

/// Length of the encrypted OTP half of a token, in ModHex characters.
pub const OTP_SIZE: usize = 32;

/// The decrypted contents of an OTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Token {
    /// Private secret id. Compared only implicitly: a wrong key or wrong
    /// device fails the CRC check.
    pub uid: [u8; UID_SIZE],
    /// Non-volatile usage counter, incremented on device power-up.
    pub ctr: u16,
    /// Internal timestamp, low 16 bits.
    pub tstpl: u16,
    /// Internal timestamp, high 8 bits.
    pub tstph: u8,
    /// Volatile session usage counter, incremented on each touch.
    pub usage: u8,
    /// Random filler.
    pub rnd: u16,
    /// CRC trailer. Validated by the residue test, never compared directly.
    pub crc: u16,
}

/// Split a full token into its public-id and OTP halves.
///
/// Whitespace is trimmed before measurement. The last [`OTP_SIZE`]
/// characters are the OTP; everything before them is the public id, which
/// must be 1 to [`OTP_SIZE`] characters long.
pub fn parse_token(token: &str) -> Result<(&str, &str)> {
    let token = token.trim();
    if !token.is_ascii() {
        return Err(Status::BadOtp.into());
    }
    let len = token.len();
    if len <= OTP_SIZE {
        return Err(Status::BadOtp.into());
    }

    // where the otp starts in the token
    let canary = len - OTP_SIZE;
    if canary < 1 || canary > OTP_SIZE {
        return Err(Status::BadOtp.into());
    }

    Ok((&token[..canary], &token[canary..]))
}
