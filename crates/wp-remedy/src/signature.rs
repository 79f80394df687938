//! Content hashing shared by backups (checksums) and evidence (signatures).
//!
//! Both subsystems go through [`digest`] so the algorithm can be swapped from
//! configuration without touching call sites.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl SignatureAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            other => Err(Error::Config(format!(
                "unsupported signature algorithm '{other}'; expected sha256 or sha512"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: SignatureAlgorithm,
    /// `"<algorithm>:<hex digest>"`
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    /// UTF-8 byte length of the signed content.
    pub content_length: usize,
}

pub fn digest(bytes: &[u8], algorithm: SignatureAlgorithm) -> String {
    match algorithm {
        SignatureAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
        SignatureAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
    }
}

fn digest_reader<D: Digest>(mut r: impl Read) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streams a local file through the hasher; returns `(hex digest, byte count)`.
pub fn digest_file(path: &Path, algorithm: SignatureAlgorithm) -> Result<(String, u64)> {
    let file = File::open(path)
        .map_err(|e| Error::Storage(format!("failed to open {}: {e}", path.display())))?;
    let size = file
        .metadata()
        .map_err(|e| Error::Storage(format!("failed to stat {}: {e}", path.display())))?
        .len();
    let hex = match algorithm {
        SignatureAlgorithm::Sha256 => digest_reader::<Sha256>(file),
        SignatureAlgorithm::Sha512 => digest_reader::<Sha512>(file),
    }
    .map_err(|e| Error::Storage(format!("failed to hash {}: {e}", path.display())))?;
    Ok((hex, size))
}

pub fn sign(content: &str, algorithm: SignatureAlgorithm) -> Signature {
    Signature {
        algorithm,
        hash: format!("{}:{}", algorithm, digest(content.as_bytes(), algorithm)),
        timestamp: Utc::now(),
        content_length: content.len(),
    }
}

/// Splits `"<algorithm>:<hex>"`. Returns `None` for malformed input.
pub fn parse_signature(raw: &str) -> Option<(SignatureAlgorithm, &str)> {
    let (alg, hex) = raw.split_once(':')?;
    let alg = alg.parse().ok()?;
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((alg, hex))
}

pub fn verify(content: &str, signature: &str) -> bool {
    match parse_signature(signature) {
        Some((alg, hex)) => digest(content.as_bytes(), alg).eq_ignore_ascii_case(hex),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            digest(b"abc", SignatureAlgorithm::Sha256),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sign_is_deterministic_and_input_sensitive() {
        let a = sign("wp-config contents", SignatureAlgorithm::Sha256);
        let b = sign("wp-config contents", SignatureAlgorithm::Sha256);
        let c = sign("wp-config content", SignatureAlgorithm::Sha256);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.content_length, b.content_length);
        assert_ne!(a.hash, c.hash);
        assert!(a.hash.starts_with("sha256:"));
    }

    #[test]
    fn content_length_counts_utf8_bytes() {
        let sig = sign("héllo", SignatureAlgorithm::Sha256);
        assert_eq!(sig.content_length, 6);
    }

    #[test]
    fn sha512_is_swappable() {
        let sig = sign("x", SignatureAlgorithm::Sha512);
        assert!(sig.hash.starts_with("sha512:"));
        assert_eq!(sig.hash.len(), "sha512:".len() + 128);
        assert!(verify("x", &sig.hash));
        assert!(!verify("y", &sig.hash));
    }

    #[test]
    fn digest_file_matches_in_memory_digest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("blob");
        std::fs::write(&p, b"0123456789").expect("write");
        let (hex, size) = digest_file(&p, SignatureAlgorithm::Sha256).expect("digest");
        assert_eq!(size, 10);
        assert_eq!(hex, digest(b"0123456789", SignatureAlgorithm::Sha256));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(parse_signature("nocolon").is_none());
        assert!(parse_signature("md5:abcd").is_none());
        assert!(parse_signature("sha256:zz").is_none());
    }
}
