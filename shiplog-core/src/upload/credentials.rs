//! Device-identity credentials for the upload channel.
//!
//! A device authenticates with a connection string
//! (`Endpoint=...;DeviceId=...;SharedAccessKey=<base64>`). The key never
//! goes on the wire: short-lived shared-access signatures are minted from
//! it and refreshed proactively at 80% of their lifetime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::error::{AgentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Fraction of the token lifetime after which a fresh one is minted.
const REFRESH_AT_FRACTION: f64 = 0.8;

/// A ready-to-use authorization value with its expiry.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Value for the `Authorization` header.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Source of upload credentials. Implementations refresh internally;
/// callers just ask again before every attempt.
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    async fn get(&self) -> Result<Credential>;
}

/// Parsed device connection string.
#[derive(Clone)]
pub struct ConnectionString {
    pub endpoint: String,
    pub device_id: String,
    shared_access_key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("device_id", &self.device_id)
            .field("shared_access_key", &"<redacted>")
            .finish()
    }
}

impl ConnectionString {
    /// Parse `Endpoint=...;DeviceId=...;SharedAccessKey=...`. Order of the
    /// segments does not matter; unknown segments are rejected so typos
    /// surface at startup instead of as auth failures.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut device_id = None;
        let mut key = None;

        for segment in raw.split(';').filter(|s| !s.trim().is_empty()) {
            let (name, value) = segment.split_once('=').ok_or_else(|| {
                AgentError::Credential("connection string segment without '='".to_string())
            })?;
            match name.trim() {
                "Endpoint" => endpoint = Some(value.trim().trim_end_matches('/').to_string()),
                "DeviceId" => device_id = Some(value.trim().to_string()),
                "SharedAccessKey" => {
                    let decoded = STANDARD.decode(value.trim()).map_err(|e| {
                        AgentError::Credential(format!("shared access key is not base64: {e}"))
                    })?;
                    key = Some(Zeroizing::new(decoded));
                }
                other => {
                    return Err(AgentError::Credential(format!(
                        "unknown connection string segment: {other}"
                    )));
                }
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AgentError::Credential("connection string missing Endpoint".to_string()))?;
        let device_id = device_id
            .filter(|d| !d.is_empty())
            .ok_or_else(|| AgentError::Credential("connection string missing DeviceId".to_string()))?;
        let shared_access_key = key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                AgentError::Credential("connection string missing SharedAccessKey".to_string())
            })?;

        Ok(Self {
            endpoint,
            device_id,
            shared_access_key,
        })
    }

    /// Mint a shared-access signature valid until `expires_at`.
    fn sign(&self, expires_at: DateTime<Utc>) -> Result<String> {
        let expiry = expires_at.timestamp();
        let to_sign = format!("{}\n{}\n{}", self.endpoint, self.device_id, expiry);
        let mut mac = HmacSha256::new_from_slice(&self.shared_access_key)
            .map_err(|e| AgentError::Credential(format!("invalid key length: {e}")))?;
        mac.update(to_sign.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!(
            "SharedAccessSignature sr={}&did={}&se={expiry}&sig={signature}",
            self.endpoint, self.device_id
        ))
    }
}

/// Mints SAS tokens and refreshes them at 80% of their lifetime.
pub struct SasCredentialProvider {
    connection: ConnectionString,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    cached: tokio::sync::Mutex<Option<Credential>>,
}

impl fmt::Debug for SasCredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasCredentialProvider")
            .field("device_id", &self.connection.device_id)
            .field("ttl_secs", &self.ttl.as_secs())
            .finish()
    }
}

impl SasCredentialProvider {
    pub fn new(connection: ConnectionString, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            connection,
            ttl,
            clock,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.connection.device_id
    }

    pub fn endpoint(&self) -> &str {
        &self.connection.endpoint
    }

    fn needs_refresh(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        let lifetime = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        let refresh_at = credential.expires_at
            - chrono::Duration::milliseconds(
                (lifetime.num_milliseconds() as f64 * (1.0 - REFRESH_AT_FRACTION)) as i64,
            );
        now >= refresh_at
    }
}

#[async_trait]
impl CredentialProvider for SasCredentialProvider {
    async fn get(&self) -> Result<Credential> {
        let now = self.clock.now();
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if !self.needs_refresh(credential, now) {
                return Ok(credential.clone());
            }
        }

        let expires_at = now
            + chrono::Duration::from_std(self.ttl)
                .map_err(|e| AgentError::Credential(format!("token ttl out of range: {e}")))?;
        let token = self.connection.sign(expires_at)?;
        debug!(device_id = %self.connection.device_id, %expires_at, "minted fresh access token");
        let credential = Credential { token, expires_at };
        *cached = Some(credential.clone());
        Ok(credential)
    }
}

/// Long-lived static token (a pre-issued connection credential). No
/// refresh; the expiry is far in the future.
#[derive(Clone)]
pub struct StaticCredentialProvider {
    token: String,
}

impl fmt::Debug for StaticCredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentialProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl StaticCredentialProvider {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get(&self) -> Result<Credential> {
        Ok(Credential {
            token: self.token.clone(),
            expires_at: DateTime::<Utc>::MAX_UTC,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn connection() -> ConnectionString {
        let key = STANDARD.encode(b"super-secret-device-key");
        ConnectionString::parse(&format!(
            "Endpoint=https://store.example;DeviceId=press-07;SharedAccessKey={key}"
        ))
        .unwrap()
    }

    #[test]
    fn parses_well_formed_connection_strings() {
        let parsed = connection();
        assert_eq!(parsed.endpoint, "https://store.example");
        assert_eq!(parsed.device_id, "press-07");
    }

    #[test]
    fn rejects_malformed_connection_strings() {
        assert!(ConnectionString::parse("Endpoint=https://x;DeviceId=d").is_err());
        assert!(ConnectionString::parse("Endpoint=https://x;DeviceId=d;SharedAccessKey=@@@").is_err());
        assert!(
            ConnectionString::parse("Endpoint=https://x;DeviceId=d;SharedAccessKey=YQ==;Bogus=1")
                .is_err()
        );
    }

    #[test]
    fn debug_never_leaks_the_key() {
        let rendered = format!("{:?}", connection());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("super-secret"));
    }

    #[tokio::test]
    async fn tokens_are_cached_until_eighty_percent_of_lifetime() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap(),
        ));
        let provider = SasCredentialProvider::new(
            connection(),
            Duration::from_secs(1000),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        let first = provider.get().await.unwrap();
        clock.advance(chrono::Duration::seconds(700));
        let second = provider.get().await.unwrap();
        assert_eq!(first.token, second.token, "within 80%: cached");

        clock.advance(chrono::Duration::seconds(150));
        let third = provider.get().await.unwrap();
        assert_ne!(first.token, third.token, "past 80%: refreshed");
        assert!(third.expires_at > first.expires_at);
    }

    #[test]
    fn signature_binds_endpoint_device_and_expiry() {
        let parsed = connection();
        let expires = Utc.with_ymd_and_hms(2024, 5, 2, 13, 0, 0).unwrap();
        let a = parsed.sign(expires).unwrap();
        let b = parsed.sign(expires).unwrap();
        assert_eq!(a, b, "signing is deterministic");
        let later = parsed.sign(expires + chrono::Duration::seconds(1)).unwrap();
        assert_ne!(a, later);
        assert!(a.starts_with("SharedAccessSignature sr=https://store.example&did=press-07&se="));
    }
}
