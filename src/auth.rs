//! The authentication façade.
//!
//! [`YubiAuth`] accumulates token bytes from an input source (a key press
//! ends with `\r`), extracts the public id, looks the device up in the
//! configured store, and dispatches validation:
//! - records carrying a secret validate offline (self-hosted)
//! - records without one, or a façade with no store, validate against the
//!   Yubico cloud servers
//!
//! On success the accepted `(counter, session)` pair is committed back to
//! the store.

use std::borrow::Cow;
use std::io::Read;

use anyhow::anyhow;

use crate::otp::{self, Token, PUB_LEN};
use crate::status::{AuthError, Result, Status};
use crate::store::{self, UserStore, YubiUser};
use crate::yubico::{YubiClient, YubicoConfig};

/// A YubiKey authenticator. Not safe for concurrent validation; hold one
/// instance per input source.
pub struct YubiAuth {
    store: Option<Box<dyn UserStore>>,
    yubico: Option<YubiClient>,
    token: Vec<u8>,
    done: bool,
    resets: u32,
}

impl YubiAuth {
    /// Create an authenticator. A non-empty `dsn` selects a store of
    /// self-hosted device records (see [`store::open`]); an empty one means
    /// tokens are validated by the Yubico cloud services.
    pub fn new(dsn: &str) -> Result<Self> {
        let store = if dsn.is_empty() {
            None
        } else {
            Some(store::open(dsn)?)
        };
        Ok(Self::from_parts(store))
    }

    /// Create an authenticator over an existing store.
    pub fn with_store(store: Box<dyn UserStore>) -> Self {
        Self::from_parts(Some(store))
    }

    fn from_parts(store: Option<Box<dyn UserStore>>) -> Self {
        Self {
            store,
            yubico: None,
            token: Vec::new(),
            done: false,
            resets: 0,
        }
    }

    /// Install a preconfigured cloud client instead of the lazily
    /// env-configured one.
    pub fn set_yubico_client(&mut self, client: YubiClient) {
        self.yubico = Some(client);
    }

    pub fn store(&self) -> Option<&dyn UserStore> {
        self.store.as_deref()
    }

    /// The accumulated token text.
    pub fn token(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.token)
    }

    pub fn token_bytes(&self) -> &[u8] {
        &self.token
    }

    /// The public part of the token: its first 12 characters, or all of it
    /// when shorter.
    pub fn public(&self) -> String {
        self.token().chars().take(PUB_LEN).collect()
    }

    /// Finished reading the token?
    pub fn done(&self) -> bool {
        self.done
    }

    /// The number of times [`YubiAuth::reset`] has been called.
    pub fn reset_count(&self) -> u32 {
        self.resets
    }

    /// Make ready to read the next token.
    pub fn reset(&mut self) {
        self.resets += 1;
        self.done = false;
        self.token.clear();
    }

    /// Is the error worth prompting the user again for?
    pub fn retryable(&self, err: &AuthError) -> bool {
        matches!(
            err.status(),
            Status::BadOtp
                | Status::UnregisteredUser
                | Status::EmptyYubiToken
                | Status::NoSuchClient
        )
    }

    /// Append all currently available bytes from `reader`. A trailing `\r`
    /// marks the end of the token; it is stripped and the accumulator
    /// becomes complete. Further reads are refused once complete.
    pub fn read_token_data(&mut self, reader: &mut dyn Read) -> bool {
        if self.done {
            tracing::error!("yubi token is already complete");
            return self.done;
        }

        let mut chunk = Vec::new();
        match reader.read_to_end(&mut chunk) {
            Ok(_) => {
                self.token.extend_from_slice(&chunk);
                if self.token.last() == Some(&b'\r') {
                    self.token.pop();
                    self.done = true;
                    tracing::debug!("read full yubi token");
                }
            }
            Err(e) => tracing::error!("unable to read token data: {e}"),
        }

        self.done
    }

    /// Set the token from a string instead of reading it from input.
    pub fn set_token(&mut self, token: &str) {
        self.token.clear();
        self.token.extend_from_slice(token.as_bytes());
        self.done = true;
    }

    /// Verify an OTP against a given record, without consulting the store
    /// and without committing counters. Prefer [`YubiAuth::validate`].
    ///
    /// Records carrying a secret are validated offline; otherwise the whole
    /// token goes to the Yubico cloud and the returned token carries the
    /// counters the server echoed.
    pub fn verify_token(&mut self, user: &YubiUser, token: &str) -> Result<Token> {
        if !user.secret.is_empty() {
            let (_public, otp) = otp::parse_token(token)?;
            return otp::validate_otp(user, otp);
        }

        let resp = self.yubico_client()?.verify_otp(token)?;
        Ok(Token {
            ctr: resp.session_counter,
            usage: resp.session_use,
            ..Token::default()
        })
    }

    /// Validate the accumulated token.
    ///
    /// With a store configured, looks up the device record by public id,
    /// verifies the OTP (offline when the record has a secret, via Yubico
    /// otherwise), and on success commits the new counters. Without a
    /// store, validates via Yubico and returns a synthetic record carrying
    /// only the extracted counters.
    pub fn validate(&mut self) -> Result<YubiUser> {
        tracing::debug!("validating yubi token");
        if self.token.is_empty() {
            return Err(Status::BadOtp.into());
        }
        let token = self.token().into_owned();

        let looked_up = match &self.store {
            Some(store) => Some(
                store
                    .get(&self.public())?
                    .ok_or_else(|| AuthError::new(Status::UnregisteredUser))?,
            ),
            None => None,
        };

        match looked_up {
            Some(mut user) => {
                if !user.is_enabled {
                    return Err(Status::UnregisteredUser.into());
                }

                let accepted = self.verify_token(&user, &token)?;
                user.counter = i64::from(accepted.ctr);
                user.session = i64::from(accepted.usage);
                if let Some(store) = &self.store {
                    store.update_counts(&user)?;
                }
                Ok(user)
            }
            None => {
                // no store also indicates not self-hosted
                let synthetic = YubiUser::new("", "");
                let accepted = self.verify_token(&synthetic, &token)?;
                let mut user = synthetic;
                user.counter = i64::from(accepted.ctr);
                user.session = i64::from(accepted.usage);
                Ok(user)
            }
        }
    }

    fn yubico_client(&mut self) -> Result<&YubiClient> {
        if self.yubico.is_none() {
            self.yubico = Some(YubiClient::new(YubicoConfig::from_env()?)?);
        }
        self.yubico
            .as_ref()
            .ok_or_else(|| AuthError::backend(anyhow!("yubico client unavailable")))
    }
}
