//! Content identifiers
//!
//! Every block is named by a CIDv1 over the SHA-256 digest of its bytes.
//! Anything fetched from a remote peer is checked against the identifier
//! it was requested under before it is trusted.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Multicodec code for sha2-256
pub const SHA256_CODE: u64 = 0x12;

/// Multicodec code for raw binary blocks
pub const RAW_CODEC: u64 = 0x55;

const SHA256_DIGEST_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// SHA-256 digest of `data`
pub fn content_hash(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Compute the content identifier for `data`
pub fn content_cid(data: &[u8]) -> Result<Cid, CidError> {
    let hash = content_hash(data);

    let mh = Multihash::wrap(SHA256_CODE, &hash)
        .map_err(|e| CidError::Multihash(format!("Failed to create multihash: {}", e)))?;

    Ok(Cid::new_v1(RAW_CODEC, mh))
}

/// Check that `cid` is structurally something this node can verify:
/// a CIDv1 carrying a full-length SHA-256 multihash.
pub fn validate_cid(cid: &Cid) -> Result<(), CidError> {
    if cid.version() != cid::Version::V1 {
        return Err(CidError::InvalidCid(format!(
            "{}: only CIDv1 is supported",
            cid
        )));
    }

    let mh = cid.hash();
    if mh.code() != SHA256_CODE {
        return Err(CidError::InvalidCid(format!(
            "{}: unsupported hash function 0x{:x}",
            cid,
            mh.code()
        )));
    }

    if mh.digest().len() != SHA256_DIGEST_LEN {
        return Err(CidError::InvalidCid(format!(
            "{}: truncated digest ({} bytes)",
            cid,
            mh.digest().len()
        )));
    }

    Ok(())
}

/// Verify `data` hashes to `expected_cid`. Only the multihash is compared,
/// so any codec over a SHA-256 digest of the bytes is accepted.
pub fn verify_content(data: &[u8], expected_cid: &Cid) -> Result<(), CidError> {
    let expected = expected_cid.hash();
    if expected.code() != SHA256_CODE {
        return Err(CidError::InvalidCid(format!(
            "{}: unsupported hash function 0x{:x}",
            expected_cid,
            expected.code()
        )));
    }

    let computed = content_hash(data);
    if expected.digest() != computed.as_slice() {
        let actual = content_cid(data)?;
        return Err(CidError::HashMismatch {
            expected: expected_cid.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(())
}

/// Parse a CID from its binary form
pub fn parse_cid(bytes: &[u8]) -> Result<Cid, CidError> {
    Cid::try_from(bytes).map_err(|e| CidError::InvalidCid(e.to_string()))
}

/// Parse a CID from its string form
pub fn parse_cid_str(s: &str) -> Result<Cid, CidError> {
    s.parse().map_err(|e| CidError::InvalidCid(format!("{}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let hash = content_hash(b"hello world");
        assert_eq!(hash.len(), 32);
        assert_eq!(
            hex::encode(&hash),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_ne!(hash, content_hash(b"goodbye world"));
    }

    #[test]
    fn test_content_cid() {
        let cid = content_cid(b"hello world").unwrap();

        assert_eq!(cid.version(), cid::Version::V1);
        assert_eq!(cid.codec(), RAW_CODEC);
        assert_eq!(cid.hash().code(), SHA256_CODE);
        assert_eq!(cid, content_cid(b"hello world").unwrap());
    }

    #[test]
    fn test_verify_content() {
        let cid = content_cid(b"hello world").unwrap();

        assert!(verify_content(b"hello world", &cid).is_ok());

        match verify_content(b"goodbye world", &cid) {
            Err(CidError::HashMismatch { .. }) => {}
            other => panic!("Expected HashMismatch error, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_content_ignores_codec() {
        const DAG_CBOR: u64 = 0x71;
        let raw = content_cid(b"hello world").unwrap();
        let cbor = Cid::new_v1(DAG_CBOR, *raw.hash());

        assert!(validate_cid(&cbor).is_ok());
        assert!(verify_content(b"hello world", &cbor).is_ok());
        assert!(matches!(
            verify_content(b"goodbye world", &cbor),
            Err(CidError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_cid_accepts_content_cids() {
        let cid = content_cid(b"some block").unwrap();
        assert!(validate_cid(&cid).is_ok());
    }

    #[test]
    fn test_validate_cid_rejects_other_hashes() {
        // identity multihash, not something we can verify
        let mh = Multihash::wrap(0x00, b"inline").unwrap();
        let cid = Cid::new_v1(RAW_CODEC, mh);

        assert!(matches!(validate_cid(&cid), Err(CidError::InvalidCid(_))));
    }

    #[test]
    fn test_validate_cid_rejects_truncated_digest() {
        let mh = Multihash::wrap(SHA256_CODE, &[1, 2, 3, 4]).unwrap();
        let cid = Cid::new_v1(RAW_CODEC, mh);

        assert!(matches!(validate_cid(&cid), Err(CidError::InvalidCid(_))));
    }

    #[test]
    fn test_parse_cid_forms() {
        let cid = content_cid(b"hello world").unwrap();

        assert_eq!(parse_cid(&cid.to_bytes()).unwrap(), cid);
        assert_eq!(parse_cid_str(&cid.to_string()).unwrap(), cid);
        assert!(parse_cid(&[0xff, 0x00]).is_err());
        assert!(parse_cid_str("not-a-cid").is_err());
    }
}
