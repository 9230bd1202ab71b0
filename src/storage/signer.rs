//! HMAC-signed artifact URLs
//!
//! `sign` produces `{base}/api/artifacts/{key}?expires={unix}&sig={hex}`;
//! `verify` checks both the expiry and the signature before the artifact
//! route serves any bytes.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signed url expired")]
    Expired,

    #[error("signature rejected")]
    BadSignature,
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    base_url: String,
    ttl: Duration,
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: &str, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
        }
    }

    pub fn sign(&self, key: &str, now: DateTime<Utc>) -> String {
        let expires = now.timestamp() + self.ttl.as_secs() as i64;
        let sig = self.mac_hex(key, expires);
        format!(
            "{}/api/artifacts/{}?expires={}&sig={}",
            self.base_url, key, expires, sig
        )
    }

    pub fn verify(
        &self,
        key: &str,
        expires: i64,
        sig: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let raw = hex::decode(sig).map_err(|_| SignatureError::BadSignature)?;
        self.mac(key, expires)
            .verify_slice(&raw)
            .map_err(|_| SignatureError::BadSignature)?;

        if expires < now.timestamp() {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }

    fn mac(&self, key: &str, expires: i64) -> HmacSha256 {
        // HMAC accepts keys of any length, so this cannot fail
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac key");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    fn mac_hex(&self, key: &str, expires: i64) -> String {
        hex::encode(self.mac(key, expires).finalize().into_bytes())
    }
}
