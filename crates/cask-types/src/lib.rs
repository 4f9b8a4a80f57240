//! Shared types and configuration for cask.
//!
//! This crate defines the types used across the cask workspace:
//! the content address ([`ChunkId`]), the process-wide digest
//! selection ([`Digest`]), per-store tuning ([`StoreOptions`]), and
//! the persisted tool configuration ([`Config`]).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512_256};

// ---------------------------------------------------------------------------
// Digest selection
// ---------------------------------------------------------------------------

/// Digest algorithm used to derive chunk IDs.
///
/// SHA-512/256 is the casync default; SHA-256 is kept for stores
/// written by older tools. The algorithm is selected once per process
/// with [`set_digest`] and frozen on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Digest {
    /// SHA-512/256 (default).
    Sha512_256,
    /// SHA-256.
    Sha256,
}

static DIGEST: OnceLock<Digest> = OnceLock::new();

/// Select the process-wide digest algorithm.
///
/// Must be called before any chunk ID is computed. Returns `false` if
/// the algorithm was already frozen to a different value.
pub fn set_digest(algorithm: Digest) -> bool {
    *DIGEST.get_or_init(|| algorithm) == algorithm
}

/// The currently selected digest algorithm, freezing the default if
/// none was chosen yet.
pub fn digest() -> Digest {
    *DIGEST.get_or_init(|| Digest::Sha512_256)
}

// ---------------------------------------------------------------------------
// ChunkId
// ---------------------------------------------------------------------------

/// Content-addressed identifier for a chunk: the digest of its
/// uncompressed bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChunkId([u8; 32]);

impl ChunkId {
    /// Compute the ID of a blob of data with the process-wide digest.
    pub fn from_data(data: &[u8]) -> Self {
        match digest() {
            Digest::Sha512_256 => Self(Sha512_256::digest(data).into()),
            Digest::Sha256 => Self(Sha256::digest(data).into()),
        }
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for ChunkId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ChunkId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({self})")
    }
}

/// Error parsing a hex string into a [`ChunkId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChunkIdError(());

impl fmt::Display for ParseChunkIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk ID must be 64 lowercase hex characters")
    }
}

impl std::error::Error for ParseChunkIdError {}

impl FromStr for ChunkId {
    type Err = ParseChunkIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ParseChunkIdError(()));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = hex_nibble(s.as_bytes()[i * 2]).ok_or(ParseChunkIdError(()))?;
            let lo = hex_nibble(s.as_bytes()[i * 2 + 1]).ok_or(ParseChunkIdError(()))?;
            *byte = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Store options
// ---------------------------------------------------------------------------

fn default_concurrency() -> usize {
    10
}

/// Per-store tuning knobs, configured in the config file per location
/// base and applied store-wide.
///
/// `uncompressed` and `skip_verify` are store-wide invariants: a store
/// holds either raw or zstd chunk files, never a mix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreOptions {
    /// Number of concurrent operations against this store.
    pub n: usize,
    /// Path to a client certificate for TLS authentication.
    pub client_cert: String,
    /// Path to the client key for TLS authentication.
    pub client_key: String,
    /// Trust authorities in this file instead of the OS trust store.
    pub ca_cert: String,
    /// Accept invalid TLS certificates.
    pub trust_insecure: bool,
    /// Request timeout, stored as integer nanoseconds in the config file.
    #[serde(with = "duration_nanos")]
    pub timeout: Option<Duration>,
    /// How often transient errors are retried before giving up.
    pub error_retry: u32,
    /// Don't verify chunk IDs on read.
    pub skip_verify: bool,
    /// The store holds raw chunk files instead of zstd-compressed ones.
    pub uncompressed: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            n: default_concurrency(),
            client_cert: String::new(),
            client_key: String::new(),
            ca_cert: String::new(),
            trust_insecure: false,
            timeout: None,
            error_retry: 0,
            skip_verify: false,
            uncompressed: false,
        }
    }
}

/// Serialize `Option<Duration>` as integer nanoseconds, the encoding
/// the original config file format uses for timeouts.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.map_or(0, |d| d.as_nanos() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok((nanos > 0).then(|| Duration::from_nanos(nanos)))
    }
}

// ---------------------------------------------------------------------------
// Tool configuration
// ---------------------------------------------------------------------------

/// Credentials (or references to an AWS credentials file) for an S3
/// location base. The S3 transport itself lives outside this
/// workspace; the schema is part of the config surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct S3Creds {
    pub access_key: String,
    pub secret_key: String,
    pub aws_credentials_file: String,
    pub aws_profile: String,
    /// An explicit region avoids a lookup round-trip in most SDKs.
    pub aws_region: String,
}

/// Static credentials resolved from the environment or the config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// The persisted tool configuration, loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Legacy HTTP timeout, applied to HTTP stores without their own
    /// `timeout` option.
    #[serde(with = "duration_nanos")]
    pub http_timeout: Option<Duration>,
    /// Legacy HTTP retry count, same fallback rule as `http_timeout`.
    pub http_error_retry: u32,
    /// S3 credentials keyed by `scheme://host` of the store location.
    pub s3_credentials: HashMap<String, S3Creds>,
    /// Store options keyed by location base.
    pub store_options: HashMap<String, StoreOptions>,
}

impl Config {
    /// Load the configuration from a JSON file.
    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(std::io::Error::other)
    }

    /// Look up store options for a location. The config key must match
    /// the location exactly, up to a trailing slash.
    pub fn store_options_for(&self, location: &str) -> StoreOptions {
        for (key, opt) in &self.store_options {
            if location_match(key, location) {
                return opt.clone();
            }
        }
        StoreOptions::default()
    }

    /// Resolve S3 credentials and region for a store URL.
    ///
    /// `S3_ACCESS_KEY`, `S3_SECRET_KEY` and `S3_REGION` in the
    /// environment take precedence over the config file. Config
    /// entries are keyed by `scheme://host` with the `s3+` scheme
    /// prefix stripped.
    pub fn s3_credentials_for(&self, location: &url::Url) -> (S3Credentials, S3Creds) {
        let access_key = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret_key = std::env::var("S3_SECRET_KEY").unwrap_or_default();
        let region = std::env::var("S3_REGION").unwrap_or_default();
        if !access_key.is_empty() || !secret_key.is_empty() {
            return (
                S3Credentials {
                    access_key,
                    secret_key,
                    region,
                },
                S3Creds::default(),
            );
        }

        let scheme = location.scheme().trim_start_matches("s3+");
        let key = match location.port() {
            Some(port) => format!("{scheme}://{}:{port}", location.host_str().unwrap_or("")),
            None => format!("{scheme}://{}", location.host_str().unwrap_or("")),
        };
        let creds = self.s3_credentials.get(&key).cloned().unwrap_or_default();
        (
            S3Credentials {
                access_key: creds.access_key.clone(),
                secret_key: creds.secret_key.clone(),
                region: creds.aws_region.clone(),
            },
            creds,
        )
    }
}

/// Compare a config key against a store location, tolerating a
/// trailing slash on either side.
fn location_match(key: &str, location: &str) -> bool {
    key.trim_end_matches('/') == location.trim_end_matches('/')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_deterministic() {
        let id1 = ChunkId::from_data(b"hello chunk");
        let id2 = ChunkId::from_data(b"hello chunk");
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_chunk_id_different_data_different_id() {
        assert_ne!(ChunkId::from_data(b"a"), ChunkId::from_data(b"b"));
    }

    #[test]
    fn test_default_digest_is_sha512_256() {
        // The digest selector is process-wide, so this is the only
        // test in the workspace that pins the default value.
        assert_eq!(digest(), Digest::Sha512_256);
        let expected: [u8; 32] = Sha512_256::digest(b"x").into();
        assert_eq!(ChunkId::from_data(b"x").as_bytes(), &expected);
    }

    #[test]
    fn test_set_digest_frozen_after_first_use() {
        let _ = digest();
        assert!(!set_digest(Digest::Sha256));
        assert!(set_digest(Digest::Sha512_256));
    }

    #[test]
    fn test_display_outputs_lowercase_hex() {
        let bytes = [
            0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f, 0x60, 0x71, 0x82, 0x93, 0xa4, 0xb5, 0xc6, 0xd7,
            0xe8, 0xf9, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb,
            0xcc, 0xdd, 0xee, 0xff,
        ];
        let id = ChunkId::from(bytes);
        assert_eq!(
            id.to_string(),
            "0a1b2c3d4e5f60718293a4b5c6d7e8f900112233445566778899aabbccddeeff"
        );
    }

    #[test]
    fn test_from_str_roundtrip() {
        let id = ChunkId::from_data(b"roundtrip");
        let parsed: ChunkId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_from_str_rejects_bad_input() {
        assert!("".parse::<ChunkId>().is_err());
        assert!("abcd".parse::<ChunkId>().is_err());
        // Uppercase is rejected; stable string form is lowercase.
        let upper = "A".repeat(64);
        assert!(upper.parse::<ChunkId>().is_err());
        let bad = "zz".repeat(32);
        assert!(bad.parse::<ChunkId>().is_err());
    }

    #[test]
    fn test_store_options_defaults() {
        let opt = StoreOptions::default();
        assert_eq!(opt.n, 10);
        assert!(!opt.uncompressed);
        assert!(!opt.skip_verify);
        assert_eq!(opt.timeout, None);
        assert_eq!(opt.error_retry, 0);
    }

    #[test]
    fn test_store_options_json_field_names() {
        let json = r#"{
            "n": 4,
            "error-retry": 3,
            "timeout": 60000000000,
            "skip-verify": true,
            "uncompressed": true
        }"#;
        let opt: StoreOptions = serde_json::from_str(json).unwrap();
        assert_eq!(opt.n, 4);
        assert_eq!(opt.error_retry, 3);
        assert_eq!(opt.timeout, Some(Duration::from_secs(60)));
        assert!(opt.skip_verify);
        assert!(opt.uncompressed);
    }

    #[test]
    fn test_config_store_options_lookup() {
        let json = r#"{
            "store-options": {
                "https://chunks.example.com/store/": {
                    "error-retry": 2,
                    "uncompressed": true
                }
            }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();

        let opt = cfg.store_options_for("https://chunks.example.com/store");
        assert!(opt.uncompressed);
        assert_eq!(opt.error_retry, 2);

        let other = cfg.store_options_for("https://other.example.com/store");
        assert_eq!(other, StoreOptions::default());
    }

    #[test]
    fn test_config_s3_credentials_lookup() {
        let json = r#"{
            "s3-credentials": {
                "https://s3.example.com": {
                    "access-key": "AKID",
                    "secret-key": "SECRET",
                    "aws-region": "eu-west-1"
                }
            }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        let u = url::Url::parse("s3+https://s3.example.com/bucket/prefix").unwrap();
        let (creds, raw) = cfg.s3_credentials_for(&u);
        assert_eq!(creds.access_key, "AKID");
        assert_eq!(creds.secret_key, "SECRET");
        assert_eq!(creds.region, "eu-west-1");
        assert_eq!(raw.aws_credentials_file, "");
    }

    #[test]
    fn test_config_defaults_empty() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.http_timeout, None);
        assert_eq!(cfg.http_error_retry, 0);
        assert!(cfg.s3_credentials.is_empty());
        assert!(cfg.store_options.is_empty());
    }
}
