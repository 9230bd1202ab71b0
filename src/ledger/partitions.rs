//! Key layout for the ledger partitions
//!
//! - `jobs`: job:{job_id} -> JobRecord (JSON)
//! - `idempotency`: idem:{key} -> IdempotencyRecord (JSON)
//! - `metadata`: meta:{key} -> value (string)

/// Encode a job key: job:{job_id}
pub fn encode_job_key(job_id: &str) -> Vec<u8> {
    format!("job:{job_id}").into_bytes()
}

/// Decode a job key: job:{job_id} -> job_id
pub fn decode_job_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix("job:").map(String::from)
}

/// Encode an idempotency key: idem:{key}
pub fn encode_idem_key(key: &str) -> Vec<u8> {
    format!("idem:{key}").into_bytes()
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{key}").into_bytes()
}
