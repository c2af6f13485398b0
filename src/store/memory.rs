//! Map-backed device-record store.
//!
//! Same contract as the SQLite store minus durability; intended for tests
//! and for small fixed deployments seeded from a key map file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::status::{AuthError, Result, Status};
use crate::store::{KeyProvider, SecretCodec, UserStore, YubiUser};

/// Non-durable [`UserStore`] over an in-memory map keyed by public id.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    codec: Mutex<Option<SecretCodec>>,
}

#[derive(Default)]
struct Inner {
    recs: HashMap<String, YubiUser>,
    next_id: i64,
}

/// One record of a JSON seed file: `{"keys": [{"yubi_id": ...}, ...]}`.
#[derive(Debug, Deserialize)]
struct SeedKey {
    yubi_id: String,
    yubi_secret: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    keys: Vec<SeedKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the column codec installed, seeded from the JSON file
    /// named by the `YUBI_KEY_MAP` environment variable when it is set.
    pub fn from_env(provider: KeyProvider) -> Self {
        let store = Self::new();
        store.set_secret_key_provider(provider);
        match std::env::var("YUBI_KEY_MAP") {
            Ok(path) if !path.is_empty() => {
                if let Err(e) = store.load_seed(Path::new(&path)) {
                    tracing::error!("failed loading yubi key map: {e:#}");
                }
            }
            _ => tracing::warn!("YUBI_KEY_MAP env not set"),
        }
        store
    }

    /// Load registered devices from a JSON seed file. Seeded records are
    /// enabled with zeroed counters. The key provider must be installed
    /// first; seed secrets pass through the codec like any other write.
    pub fn load_seed(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(AuthError::backend)?;
        let seed: SeedFile = serde_json::from_slice(&data)
            .context("parsing yubi key map")
            .map_err(AuthError::backend)?;

        for key in &seed.keys {
            let mut user = YubiUser::new(&key.yubi_id, &key.yubi_secret);
            user.description = key.description.clone();
            self.add(&user)?;
        }
        tracing::debug!(records = seed.keys.len(), "loaded yubi key map");
        Ok(())
    }

    fn encode_secret(&self, secret: &str) -> Result<String> {
        if secret.is_empty() {
            return Ok(String::new());
        }
        let codec = self.codec.lock();
        match codec.as_ref() {
            Some(codec) => codec.encrypt(secret.as_bytes()),
            None => Err(AuthError::backend(anyhow!(
                "secret key provider not installed"
            ))),
        }
    }

    fn decode_secret(&self, stored: &str) -> Result<String> {
        if stored.is_empty() {
            return Ok(String::new());
        }
        let codec = self.codec.lock();
        let codec = codec.as_ref().ok_or_else(|| {
            AuthError::backend(anyhow!("secret key provider not installed"))
        })?;
        let plain = codec.decrypt(stored)?;
        String::from_utf8(plain)
            .map_err(|e| AuthError::backend(anyhow!("decrypted secret is not UTF-8: {e}")))
    }
}

impl UserStore for MemoryStore {
    fn add(&self, user: &YubiUser) -> Result<()> {
        let secret = self.encode_secret(&user.secret)?;
        let mut inner = self.inner.lock();
        if inner.recs.contains_key(&user.public) {
            return Err(AuthError::backend(anyhow!(
                "yubikey '{}' is already registered",
                user.public
            )));
        }

        inner.next_id += 1;
        let now = Utc::now();
        let mut rec = user.clone();
        rec.id = inner.next_id;
        rec.created_at = now;
        rec.updated_at = now;
        rec.counter = 0;
        rec.session = 0;
        rec.secret = secret;
        inner.recs.insert(rec.public.clone(), rec);
        Ok(())
    }

    fn get(&self, public_id: &str) -> Result<Option<YubiUser>> {
        let rec = self.inner.lock().recs.get(public_id).cloned();
        match rec {
            Some(mut user) => {
                user.secret = self.decode_secret(&user.secret)?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<YubiUser>> {
        let mut users: Vec<YubiUser> = self.inner.lock().recs.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        for user in &mut users {
            user.secret = self.decode_secret(&user.secret)?;
        }
        Ok(users)
    }

    fn update_counts(&self, user: &YubiUser) -> Result<()> {
        let mut inner = self.inner.lock();
        let rec = inner.recs.get_mut(&user.public).ok_or_else(|| {
            AuthError::backend(anyhow!("unknown yubikey '{}'", user.public))
        })?;

        let advanced = user.counter > rec.counter
            || (user.counter == rec.counter && user.session > rec.session);
        if !advanced {
            tracing::warn!(public = %user.public, "counter update lost to a concurrent accept");
            return Err(Status::ReplayedOtp.into());
        }

        rec.counter = user.counter;
        rec.session = user.session;
        rec.updated_at = Utc::now();
        Ok(())
    }

    fn update_user(&self, user: &YubiUser) -> Result<()> {
        let mut inner = self.inner.lock();
        let rec = inner.recs.get_mut(&user.public).ok_or_else(|| {
            AuthError::backend(anyhow!("unknown yubikey '{}'", user.public))
        })?;

        rec.email = user.email.clone();
        rec.is_admin = user.is_admin;
        rec.is_enabled = user.is_enabled;
        rec.description = user.description.clone();
        rec.updated_at = Utc::now();
        Ok(())
    }

    fn set_secret_key_provider(&self, provider: KeyProvider) {
        *self.codec.lock() = Some(SecretCodec::new(provider));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.set_secret_key_provider(Arc::new(|| "foobar".to_string()));
        store
    }

    fn sample_user() -> YubiUser {
        YubiUser::new("6782a7960cf0", "9a781c53532db8eb0c51ed87188cae98")
    }

    #[test]
    fn add_get_round_trip() {
        let store = test_store();
        store.add(&sample_user()).unwrap();

        let user = store.get("6782a7960cf0").unwrap().unwrap();
        assert_eq!(user.secret, "9a781c53532db8eb0c51ed87188cae98");
        assert_eq!(user.id, 1);
        assert!(store.get("ccccccj00000").unwrap().is_none());
    }

    #[test]
    fn duplicate_public_id_rejected() {
        let store = test_store();
        store.add(&sample_user()).unwrap();
        assert!(store.add(&sample_user()).is_err());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn update_counts_enforces_monotone_advance() {
        let store = test_store();
        store.add(&sample_user()).unwrap();

        let mut user = store.get("6782a7960cf0").unwrap().unwrap();
        user.counter = 0;
        user.session = 1;
        store.update_counts(&user).unwrap();

        let err = store.update_counts(&user).unwrap_err();
        assert_eq!(err.status(), Status::ReplayedOtp);

        user.counter = 1;
        user.session = 0;
        store.update_counts(&user).unwrap();
        let stored = store.get(&user.public).unwrap().unwrap();
        assert_eq!((stored.counter, stored.session), (1, 0));
    }

    #[test]
    fn codec_applies_when_installed() {
        let store = test_store();
        store.add(&sample_user()).unwrap();

        // held encrypted, surfaced as plaintext
        let raw = store.inner.lock().recs["6782a7960cf0"].secret.clone();
        assert_ne!(raw, "9a781c53532db8eb0c51ed87188cae98");
        let user = store.get("6782a7960cf0").unwrap().unwrap();
        assert_eq!(user.secret, "9a781c53532db8eb0c51ed87188cae98");
    }

    #[test]
    fn secret_requires_key_provider() {
        let store = MemoryStore::new();

        let err = store.add(&sample_user()).unwrap_err();
        assert!(err.to_string().contains("key provider"));

        // records without a secret do not need the codec
        let mut user = sample_user();
        user.secret = String::new();
        store.add(&user).unwrap();
        assert!(store.get(&user.public).unwrap().is_some());
    }

    #[test]
    fn seed_file_loads_enabled_records() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("keys.json");
        std::fs::write(
            &path,
            r#"{"keys": [
                {"yubi_id": "6782a7960cf0",
                 "yubi_secret": "9a781c53532db8eb0c51ed87188cae98",
                 "description": "desk key"},
                {"yubi_id": "8e76172284d4",
                 "yubi_secret": "4cf039957d01a7a11ce59b6c10d27d50"}
            ]}"#,
        )
        .unwrap();

        let store = test_store();
        store.load_seed(&path).unwrap();

        let users = store.list().unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|u| u.is_enabled));
        assert_eq!(users[0].description, "desk key");

        assert!(store.load_seed(&tmp.path().join("missing.json")).is_err());
    }
}
