//! Yubico Cloud verification client (Validation Protocol V2.0).
//!
//! Works out of the box with factory-configured yubikey slot #1:
//! - signed HTTPS GET against one of the public verify servers
//! - `key=value` response-body parsing
//! - HMAC-SHA1 response-signature verification over the sorted key set
//! - OTP/nonce cross-checks binding the response to the request
//!
//! See <https://developers.yubico.com/yubikey-val/Validation_Protocol_V2.0.html>.
//! You must use your own client id and API key to use the public servers;
//! see [`YubicoConfig::from_env`].

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use serde::Serialize;
use sha1::Sha1;

use crate::status::{AuthError, Result, Status};

type HmacSha1 = Hmac<Sha1>;

/// The public Yubico verify servers; one is picked at random per request.
pub const YUBICO_SERVERS: [&str; 5] = [
    "https://api.yubico.com/wsapi/2.0/verify",
    "https://api2.yubico.com/wsapi/2.0/verify",
    "https://api3.yubico.com/wsapi/2.0/verify",
    "https://api4.yubico.com/wsapi/2.0/verify",
    "https://api5.yubico.com/wsapi/2.0/verify",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_BYTES: u64 = 4 * 1024;
const NONCE_MAX_LEN: usize = 40;

/// Yubico API credentials and server selection.
#[derive(Clone)]
pub struct YubicoConfig {
    /// The Yubico client id associated with the API key.
    pub client_id: String,
    /// The raw (base64-decoded) API key. Empty disables request signing
    /// and response-signature verification.
    pub api_key: Vec<u8>,
    /// Verify servers to choose from.
    pub servers: Vec<String>,
}

impl YubicoConfig {
    /// Credentials from the `YUBICO_API_CLIENT_ID` and (base64-encoded)
    /// `YUBICO_API_SECRET_KEY` environment variables.
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("YUBICO_API_CLIENT_ID").unwrap_or_default();
        let api_key = std::env::var("YUBICO_API_SECRET_KEY").unwrap_or_default();
        if client_id.is_empty() || api_key.is_empty() {
            return Err(AuthError::backend(anyhow!(
                "requires YUBICO_API_CLIENT_ID and YUBICO_API_SECRET_KEY environment variables"
            )));
        }
        Self::with_credentials(client_id, &api_key)
    }

    /// Explicit credentials. The key must be base64-encoded, as presented
    /// by the Yubico API key signup.
    pub fn with_credentials(client_id: impl Into<String>, api_key_b64: &str) -> Result<Self> {
        let api_key = BASE64
            .decode(api_key_b64)
            .map_err(|e| AuthError::backend(anyhow!("api key is not valid base64: {e}")))?;
        Ok(Self {
            client_id: client_id.into(),
            api_key,
            servers: YUBICO_SERVERS.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Replace the default server list.
    pub fn servers(mut self, servers: Vec<String>) -> Self {
        self.servers = servers;
        self
    }
}

/// A request to verify an OTP.
#[derive(Debug, Clone, Default)]
pub struct VerifyRequest {
    /// Client id; defaults to the configured one when empty.
    pub id: String,
    /// The OTP to validate, newlines tolerated.
    pub otp: String,
    /// Ask the server for timestamp and session counter info.
    pub timestamp: bool,
    /// 16 to 40 characters of random unique data.
    pub nonce: String,
    /// Sync level: percentage 0-100, or `fast`/`secure` for
    /// server-configured values. Empty lets the server decide.
    pub sl: String,
    /// Seconds to wait for sync responses; 0 lets the server decide.
    pub timeout: u32,
}

impl VerifyRequest {
    fn to_params(&self) -> BTreeMap<&'static str, String> {
        let mut params = BTreeMap::new();
        params.insert("id", self.id.clone());
        params.insert("otp", self.otp.clone());
        params.insert("nonce", self.nonce.clone());
        if self.timestamp {
            params.insert("timestamp", "1".to_string());
        }
        if !self.sl.is_empty() {
            params.insert("sl", self.sl.clone());
        }
        if self.timeout != 0 {
            params.insert("timeout", self.timeout.to_string());
        }
        params
    }
}

/// A parsed verify response.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    /// The OTP, echoed from the request.
    pub otp: String,
    /// The nonce, echoed from the request.
    pub nonce: String,
    /// Raw response signature.
    #[serde(skip)]
    pub h: Vec<u8>,
    /// Server timestamp in UTC.
    pub t: DateTime<Utc>,
    /// Status of the operation.
    pub status: Status,
    /// YubiKey internal timestamp value when the key was pressed.
    pub timestamp: u32,
    /// YubiKey usage counter when the key was pressed.
    pub session_counter: u16,
    /// YubiKey session usage counter when the key was pressed.
    pub session_use: u8,
    /// Percentage of validation servers that replied successfully.
    pub sl: i32,
}

/// Encode parameters in sorted key order, form-urlencoded. This exact
/// string is both signed and sent.
fn encode_params(params: &BTreeMap<&str, String>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Compute the request signature and attach it as the `h` parameter.
fn sign_request(params: &mut BTreeMap<&'static str, String>, key: &[u8]) -> Result<()> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| AuthError::backend(anyhow!("bad api key: {e}")))?;
    mac.update(encode_params(params).as_bytes());
    let sig = BASE64.encode(mac.finalize().into_bytes());
    params.insert("h", sig);
    Ok(())
}

/// Verify the response signature: HMAC-SHA1 over all keys except `h`,
/// ASCII-ascending, joined as `k1=v1&k2=v2&...`. Accepts when no API key is
/// configured or the response carries no `h`.
fn is_valid_response_hash(fields: &BTreeMap<String, String>, key: &[u8]) -> bool {
    let provided = match fields.get("h") {
        Some(h) if !h.is_empty() => h,
        _ => return true,
    };
    if key.is_empty() {
        return true;
    }

    let expected = match BASE64.decode(provided) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    let mut first = true;
    for (k, v) in fields {
        if k == "h" {
            continue;
        }
        if !first {
            mac.update(b"&");
        }
        mac.update(k.as_bytes());
        mac.update(b"=");
        mac.update(v.as_bytes());
        first = false;
    }

    mac.verify_slice(&expected).is_ok()
}

/// Parse the `t` field: `YYYY-MM-DDTHH:MM:SSZ0mmm`, the final three digits
/// being milliseconds.
fn parse_timestamp(t: &str) -> Result<DateTime<Utc>> {
    if t.len() < 3 {
        return Err(AuthError::backend(anyhow!("time is short")));
    }
    let (rest, milli) = t.split_at(t.len() - 3);
    let milli: i64 = milli
        .parse()
        .map_err(|e| AuthError::backend(anyhow!("error parsing response timestamp: {e}")))?;

    let rest = rest
        .strip_suffix("Z0")
        .or_else(|| rest.strip_suffix('Z'))
        .unwrap_or(rest);
    let naive = NaiveDateTime::parse_from_str(rest, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| AuthError::backend(anyhow!("error parsing response timestamp: {e}")))?;

    Ok(Utc.from_utc_datetime(&naive) + chrono::Duration::milliseconds(milli))
}

/// Yubico verification client. Reusable across requests; build one per
/// credential set.
pub struct YubiClient {
    config: YubicoConfig,
    http: reqwest::blocking::Client,
}

impl YubiClient {
    pub fn new(config: YubicoConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(AuthError::backend)?;
        Ok(Self { config, http })
    }

    /// Generic request; see [`YubiClient::verify_otp`] for the common case.
    pub fn verify(&self, req: &VerifyRequest) -> Result<VerifyResponse> {
        if self.config.servers.is_empty() {
            return Err(AuthError::backend(anyhow!("no verify servers configured")));
        }
        let server = {
            let idx = rand::thread_rng().gen_range(0..self.config.servers.len());
            &self.config.servers[idx]
        };

        let mut req = req.clone();
        if req.id.is_empty() {
            req.id = self.config.client_id.clone();
        }
        req.otp = req.otp.trim_matches('\n').to_string();

        let mut params = req.to_params();
        if !self.config.api_key.is_empty() {
            sign_request(&mut params, &self.config.api_key)?;
        }

        let url = format!("{server}?{}", encode_params(&params));
        tracing::debug!(server = %server, "verifying otp against yubico");

        let resp = self.http.get(&url).send().map_err(AuthError::backend)?;
        let mut body = String::new();
        resp.take(MAX_RESPONSE_BYTES)
            .read_to_string(&mut body)
            .map_err(AuthError::backend)?;

        let response = self.response_from_body(&body)?;

        if response.otp != req.otp {
            return Err(AuthError::backend(anyhow!("response OTP does not match")));
        }
        if response.nonce != req.nonce {
            return Err(AuthError::backend(anyhow!("response nonce does not match")));
        }

        Ok(response)
    }

    /// Format and send a verify request for an OTP. Returns an error if it
    /// could not be validated for any reason, carrying the server's status
    /// when one was returned.
    pub fn verify_otp(&self, otp: &str) -> Result<VerifyResponse> {
        let mut nonce_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let mut nonce = hex::encode(nonce_bytes);
        nonce.truncate(NONCE_MAX_LEN);

        let req = VerifyRequest {
            otp: otp.to_string(),
            timestamp: true,
            nonce,
            sl: "0".to_string(),
            ..Default::default()
        };

        let resp = self.verify(&req)?;
        if resp.status != Status::Ok {
            return Err(AuthError::new(resp.status));
        }
        Ok(resp)
    }

    fn response_from_body(&self, body: &str) -> Result<VerifyResponse> {
        let mut fields = BTreeMap::new();
        for line in body.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            fields.insert(key.to_string(), value.to_string());
        }

        if !is_valid_response_hash(&fields, &self.config.api_key) {
            return Err(AuthError::with_source(
                Status::BadSignature,
                anyhow!("invalid response signature"),
            ));
        }

        let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();

        // decode error ignored: the signature check above already accepted it
        let h = BASE64.decode(field("h")).unwrap_or_default();
        let t = parse_timestamp(field("t"))?;
        let status = Status::from_wire(field("status"));

        let mut response = VerifyResponse {
            otp: field("otp").to_string(),
            nonce: field("nonce").to_string(),
            h,
            t,
            status,
            timestamp: 0,
            session_counter: 0,
            session_use: 0,
            sl: 0,
        };

        if let Some(sl) = fields.get("sl") {
            response.sl = sl
                .parse()
                .map_err(|e| AuthError::backend(anyhow!("error parsing response `sl`: {e}")))?;
        }
        if let Some(ts) = fields.get("timestamp") {
            response.timestamp = ts
                .parse()
                .map_err(|e| AuthError::backend(anyhow!("error parsing timestamp: {e}")))?;
        }
        if let Some(sc) = fields.get("sessioncounter") {
            response.session_counter = sc.parse().map_err(|e| {
                AuthError::backend(anyhow!("error parsing sessioncounter: {e}"))
            })?;
        }
        if let Some(su) = fields.get("sessionuse") {
            response.session_use = su
                .parse()
                .map_err(|e| AuthError::backend(anyhow!("error parsing sessionuse: {e}")))?;
        }

        Ok(response)
    }
}

/// One-shot OTP validation using env-configured credentials and default
/// servers. Prefer building a [`YubiClient`] when validating more than one
/// OTP.
pub fn verify_default(otp: &str) -> Result<VerifyResponse> {
    YubiClient::new(YubicoConfig::from_env()?)?.verify_otp(otp)
}
