//! Symmetric protection of device fingerprints.
//!
//! Blobs are `hex(iv || AES-256-CBC(json))` keyed with the client's
//! fingerprint secret. Older sensors omit the IV and reuse the first 16
//! bytes of the secret instead; those are only read when explicitly
//! allowed.

use super::errors::OAuthError;
use super::model::{Activation, DeviceSignature};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

pub struct FingerprintCodec {
    key: [u8; KEY_LEN],
    legacy_iv: [u8; IV_LEN],
    accept_legacy_fixed_iv: bool,
}

impl std::fmt::Debug for FingerprintCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintCodec")
            .field("accept_legacy_fixed_iv", &self.accept_legacy_fixed_iv)
            .finish_non_exhaustive()
    }
}

impl FingerprintCodec {
    pub fn new(secret: &str, accept_legacy_fixed_iv: bool) -> Result<Self, OAuthError> {
        let bytes = secret.as_bytes();
        if bytes.len() < KEY_LEN {
            return Err(OAuthError::Misconfigured(
                "Invalid argument: client fingerprint secret must be at least 32 bytes".into(),
            ));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        let mut legacy_iv = [0u8; IV_LEN];
        legacy_iv.copy_from_slice(&bytes[..IV_LEN]);

        Ok(Self {
            key,
            legacy_iv,
            accept_legacy_fixed_iv,
        })
    }

    /// Encrypts `value` as JSON under a fresh random IV.
    pub fn encrypt<T: Serialize>(&self, value: &T) -> Result<String, OAuthError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = self.seal(&iv, &serde_json::to_vec(value).map_err(internal)?)?;

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Encrypts `value` the way legacy sensors do, with the key-derived IV.
    pub fn encrypt_with_fixed_iv<T: Serialize>(&self, value: &T) -> Result<String, OAuthError> {
        let ciphertext = self.seal(
            &self.legacy_iv,
            &serde_json::to_vec(value).map_err(internal)?,
        )?;
        Ok(hex::encode(ciphertext))
    }

    /// Decrypts a blob back into its JSON document.
    pub fn decrypt(&self, blob: &str) -> Result<Value, OAuthError> {
        let bytes = hex::decode(blob).map_err(|_| malformed())?;
        if bytes.is_empty() || bytes.len() % IV_LEN != 0 {
            return Err(malformed());
        }

        if bytes.len() >= 2 * IV_LEN {
            let (iv, ciphertext) = bytes.split_at(IV_LEN);
            if let Some(value) = self.open_json(iv, ciphertext) {
                return Ok(value);
            }
        }

        if self.accept_legacy_fixed_iv {
            if let Some(value) = self.open_json(&self.legacy_iv, &bytes) {
                debug!("Accepted fingerprint encrypted with the legacy fixed IV");
                return Ok(value);
            }
        }

        Err(malformed())
    }

    pub fn decrypt_as<T: DeserializeOwned>(&self, blob: &str) -> Result<T, OAuthError> {
        serde_json::from_value(self.decrypt(blob)?).map_err(|_| malformed())
    }

    fn seal(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, OAuthError> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, iv)
            .map_err(|e| OAuthError::Misconfigured(format!("Invalid argument: {e}")))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn open_json(&self, iv: &[u8], ciphertext: &[u8]) -> Option<Value> {
        let cipher = Aes256CbcDec::new_from_slices(&self.key, iv).ok()?;
        let plaintext = cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }
}

fn malformed() -> OAuthError {
    OAuthError::InvalidArgument("Invalid parameter: `requestId`".into())
}

fn internal(e: serde_json::Error) -> OAuthError {
    OAuthError::ServerError(e.into())
}

/// A decoded, unexpired device fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorPayload {
    pub device: DeviceSignature,
    pub exp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawSensorPayload {
    hwid: Option<String>,
    arch: Option<String>,
    cpus: Option<Vec<String>>,
    endianness: Option<String>,
    platform: Option<String>,
    username: Option<String>,
    hostname: Option<String>,
    exp: Option<Value>,
}

fn required(field: Option<String>, name: &str) -> Result<String, OAuthError> {
    match field {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(OAuthError::InvalidArgument(format!(
            "Invalid argument: fingerprint is missing `{name}`"
        ))),
    }
}

/// Sensors send `exp` either as epoch milliseconds or as an ISO 8601 date.
fn parse_exp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

/// Decrypts `blob` and checks that every fingerprint field is present and
/// that the blob itself has not expired.
pub fn decode_sensor_data(
    codec: &FingerprintCodec,
    blob: &str,
    now: DateTime<Utc>,
) -> Result<SensorPayload, OAuthError> {
    let raw: RawSensorPayload = codec.decrypt_as(blob)?;

    let exp = raw.exp.ok_or_else(|| {
        OAuthError::InvalidArgument("Invalid argument: fingerprint is missing `exp`".into())
    })?;
    let exp = parse_exp(&exp).ok_or_else(|| {
        OAuthError::InvalidArgument("Invalid argument: fingerprint `exp` is not a date".into())
    })?;
    if exp < now {
        return Err(OAuthError::InvalidArgument(
            "Invalid argument: fingerprint has expired".into(),
        ));
    }

    let cpus = raw.cpus.ok_or_else(|| {
        OAuthError::InvalidArgument("Invalid argument: fingerprint is missing `cpus`".into())
    })?;

    Ok(SensorPayload {
        device: DeviceSignature {
            hwid: required(raw.hwid, "hwid")?,
            arch: required(raw.arch, "arch")?,
            cpus,
            endianness: required(raw.endianness, "endianness")?,
            platform: required(raw.platform, "platform")?,
            username: required(raw.username, "username")?,
            hostname: required(raw.hostname, "hostname")?,
        },
        exp,
    })
}

fn mismatched_fields(a: &DeviceSignature, b: &DeviceSignature) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if a.hwid != b.hwid {
        fields.push("hwid");
    }
    if a.arch != b.arch {
        fields.push("arch");
    }
    if a.cpus != b.cpus {
        fields.push("cpus");
    }
    if a.endianness != b.endianness {
        fields.push("endianness");
    }
    if a.platform != b.platform {
        fields.push("platform");
    }
    if a.username != b.username {
        fields.push("username");
    }
    if a.hostname != b.hostname {
        fields.push("hostname");
    }
    fields
}

/// A changed machine signature is never treated as the same device.
pub fn validate_activation(
    payload: &SensorPayload,
    activation: &Activation,
) -> Result<(), OAuthError> {
    let mismatched = mismatched_fields(&payload.device, &activation.device);
    if mismatched.is_empty() {
        return Ok(());
    }

    debug!(
        activation_id = %activation.id,
        fields = ?mismatched,
        "Device signature does not match activation"
    );
    Err(OAuthError::InvalidArgument(
        "Invalid argument: device signature does not match activation".into(),
    ))
}

/// Encrypted activation claim embedded in access tokens.
pub fn encrypt_activation(
    codec: &FingerprintCodec,
    activation: &Activation,
) -> Result<String, OAuthError> {
    codec.encrypt(&activation.device)
}

pub fn decrypt_activation(
    codec: &FingerprintCodec,
    blob: &str,
) -> Result<DeviceSignature, OAuthError> {
    codec.decrypt_as(blob)
}
