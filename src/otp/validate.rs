//! Offline (self-hosted) OTP validation against a stored device record.

use aes::cipher::{BlockDecrypt, KeyInit};
use aes::{Aes128, Block};
use anyhow::anyhow;

use crate::otp::modhex::{crc16, modhex_decode, CRC_OK_RESIDUE};
use crate::otp::{Token, AES_SIZE, OTP_SIZE, PUB_LEN, UID_SIZE};
use crate::status::{AuthError, Result, Status};
use crate::store::YubiUser;

/// Deserialize the decrypted 16-byte payload after checking the CRC residue.
fn extract_otp(buf: &[u8]) -> Result<Token> {
    if buf.len() != AES_SIZE || crc16(buf) != CRC_OK_RESIDUE {
        return Err(Status::CrcFailure.into());
    }

    let mut uid = [0u8; UID_SIZE];
    uid.copy_from_slice(&buf[..UID_SIZE]);

    Ok(Token {
        uid,
        ctr: u16::from_le_bytes([buf[6], buf[7]]),
        tstpl: u16::from_le_bytes([buf[8], buf[9]]),
        tstph: buf[10],
        usage: buf[11],
        rnd: u16::from_le_bytes([buf[12], buf[13]]),
        crc: u16::from_le_bytes([buf[14], buf[15]]),
    })
}

/// ModHex-decode and AES-128-ECB single-block decrypt an OTP, then extract
/// the token fields.
fn decipher_otp(otp: &[u8], key: &[u8; AES_SIZE]) -> Result<Token> {
    let buf = modhex_decode(otp);
    if buf.len() != AES_SIZE {
        return Err(Status::CrcFailure.into());
    }

    let cipher = Aes128::new(&(*key).into());
    let mut block = Block::clone_from_slice(&buf);
    cipher.decrypt_block(&mut block);

    extract_otp(&block)
}

/// Validate an OTP against a device record without touching the store.
///
/// `otp` should NOT include the leading public id. Decrypts with the
/// record's AES-128 secret, checks the CRC residue, then tests counter
/// ordering against the record's persisted `(counter, session)` pair.
/// Accepting callers are expected to persist the returned token's counters.
pub fn validate_otp(user: &YubiUser, otp: &str) -> Result<Token> {
    let priv_key = hex::decode(user.secret.trim()).map_err(|e| {
        AuthError::with_source(
            Status::BackendError,
            anyhow!("device secret is not valid hex: {e}"),
        )
    })?;
    if priv_key.len() != AES_SIZE {
        return Err(AuthError::with_source(
            Status::BackendError,
            anyhow!(
                "device secret must be {AES_SIZE} bytes, got {}",
                priv_key.len()
            ),
        ));
    }
    let mut key = [0u8; AES_SIZE];
    key.copy_from_slice(&priv_key);

    let otp_bytes = otp.as_bytes();
    let token = match decipher_otp(otp_bytes, &key) {
        Ok(token) => token,
        Err(err) if otp_bytes.len() == PUB_LEN + OTP_SIZE => {
            // The caller may have passed a full token (public + otp).
            // Retry once with the public prefix stripped.
            decipher_otp(&otp_bytes[PUB_LEN..], &key).map_err(|_| {
                AuthError::with_source(
                    err.status(),
                    anyhow!("otp length suggests it includes public"),
                )
            })?
        }
        Err(err) => return Err(err),
    };

    // check token validity
    if token.ctr < user.counter as u16 {
        return Err(Status::ReplayedOtp.into());
    }
    if token.ctr == user.counter as u16 && token.usage <= user.session as u8 {
        return Err(Status::ReplayedOtp.into());
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::TEST_TOKENS;

    fn test_user() -> YubiUser {
        let mut user = YubiUser::new(TEST_TOKENS[0].public, TEST_TOKENS[0].secret);
        user.counter = 0;
        user.session = 0;
        user
    }

    #[test]
    fn first_otp_validates() {
        let user = test_user();
        let token = validate_otp(&user, TEST_TOKENS[0].otps[0]).unwrap();
        assert_eq!(token.ctr, 0);
        assert_eq!(token.usage, 1);
    }

    #[test]
    fn session_counters_increment_across_otps() {
        let user = test_user();
        for (i, otp) in TEST_TOKENS[0].otps.iter().enumerate() {
            let token = validate_otp(&user, otp).unwrap();
            assert_eq!(token.usage, i as u8 + 1);
        }
    }

    #[test]
    fn replay_at_same_counters_rejects() {
        let mut user = test_user();
        let token = validate_otp(&user, TEST_TOKENS[0].otps[0]).unwrap();
        user.counter = i64::from(token.ctr);
        user.session = i64::from(token.usage);

        let err = validate_otp(&user, TEST_TOKENS[0].otps[0]).unwrap_err();
        assert_eq!(err.status(), Status::ReplayedOtp);

        // a later OTP still clears the advanced record
        let next = validate_otp(&user, TEST_TOKENS[0].otps[1]).unwrap();
        assert_eq!(next.usage, 2);
    }

    #[test]
    fn stale_counter_rejects() {
        let mut user = test_user();
        user.counter = 1;
        let err = validate_otp(&user, TEST_TOKENS[0].otps[0]).unwrap_err();
        assert_eq!(err.status(), Status::ReplayedOtp);
    }

    #[test]
    fn full_token_falls_back_to_last_32_chars() {
        let user = test_user();
        let full = TEST_TOKENS[0].token(0);
        assert_eq!(full.len(), PUB_LEN + OTP_SIZE);
        let token = validate_otp(&user, &full).unwrap();
        assert_eq!(token.usage, 1);
    }

    #[test]
    fn corrupted_otp_fails_crc() {
        let user = test_user();
        let mut otp = TEST_TOKENS[0].otps[0].to_string();
        otp.replace_range(0..1, if otp.starts_with('c') { "b" } else { "c" });
        let err = validate_otp(&user, &otp).unwrap_err();
        assert_eq!(err.status(), Status::CrcFailure);
    }

    #[test]
    fn wrong_device_secret_fails_crc() {
        let mut user = test_user();
        user.secret = TEST_TOKENS[1].secret.to_string();
        let err = validate_otp(&user, TEST_TOKENS[0].otps[0]).unwrap_err();
        assert_eq!(err.status(), Status::CrcFailure);
    }

    #[test]
    fn malformed_secret_is_backend_error() {
        let mut user = test_user();
        user.secret = "not hex at all".to_string();
        let err = validate_otp(&user, TEST_TOKENS[0].otps[0]).unwrap_err();
        assert_eq!(err.status(), Status::BackendError);

        user.secret = "9a78".to_string();
        let err = validate_otp(&user, TEST_TOKENS[0].otps[0]).unwrap_err();
        assert_eq!(err.status(), Status::BackendError);
    }
}
