//! Versioned, gzip-compressed cache entry encoding.

use std::io::{Read, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::orchestration::checksum::ContentChecksum;
use crate::orchestration::finding::Finding;

use super::CacheCategory;

const PAYLOAD_VERSION: u16 = 1;

/// What is persisted for every cached scan result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CachedPayload {
    pub version: u16,
    pub scanner: String,
    pub target: PathBuf,
    pub category: CacheCategory,
    pub checksum: ContentChecksum,
    pub stored_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub findings: Vec<Finding>,
}

impl CachedPayload {
    pub fn new(
        scanner: &str,
        target: PathBuf,
        category: CacheCategory,
        checksum: ContentChecksum,
        ttl_secs: u64,
        findings: Vec<Finding>,
    ) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            scanner: scanner.to_string(),
            target,
            category,
            checksum,
            stored_at: Utc::now(),
            ttl_secs,
            findings,
        }
    }

    pub fn encode(&self, level: u32) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| ScanError::CacheCorruption {
            key: key.to_string(),
            reason,
        };
        let mut json = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut json)
            .map_err(|e| corrupt(format!("decompression failed: {e}")))?;
        let payload: CachedPayload = serde_json::from_slice(&json)
            .map_err(|e| corrupt(format!("payload decode failed: {e}")))?;
        if payload.version != PAYLOAD_VERSION {
            return Err(corrupt(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        Ok(payload)
    }
}
