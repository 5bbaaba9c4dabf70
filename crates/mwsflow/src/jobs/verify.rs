//! Content digests for downloaded results.
//!
//! The remote service reports digests base64-encoded (MD5 unless configured
//! otherwise); hex-encoded digests are accepted as well.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "").as_str() {
            "md5" => Some(DigestAlgorithm::Md5),
            "sha256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    fn raw(&self, content: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Md5 => Md5::digest(content).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(content).to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("remote did not supply a content digest")]
    MissingDigest,

    #[error("{algorithm} digest mismatch: expected {expected}, computed {actual}")]
    Mismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },
}

/// Base64 digest of `content`.
pub fn compute_digest(algorithm: DigestAlgorithm, content: &[u8]) -> String {
    BASE64.encode(algorithm.raw(content))
}

pub fn verify_content(
    algorithm: DigestAlgorithm,
    content: &[u8],
    expected: Option<&str>,
) -> Result<(), VerifyError> {
    let expected = match expected.map(str::trim) {
        Some(e) if !e.is_empty() => e,
        _ => return Err(VerifyError::MissingDigest),
    };

    let raw = algorithm.raw(content);
    let actual = BASE64.encode(&raw);
    if expected == actual || expected.eq_ignore_ascii_case(&hex::encode(&raw)) {
        return Ok(());
    }

    Err(VerifyError::Mismatch {
        algorithm: algorithm.as_str(),
        expected: expected.to_string(),
        actual,
    })
}
