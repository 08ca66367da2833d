//! Key material storage
//!
//! Named secrets (the node identity key, mostly) live in a keystore. The
//! filesystem keystore writes one file per key under the repo path.

use libp2p::identity::Keypair;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Name under which the libp2p identity is stored
pub const IDENTITY_KEY: &str = "identity";

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("Invalid key name: {0}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key decoding failed: {0}")]
    Decoding(#[from] libp2p::identity::DecodingError),
}

pub trait Keystore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, KeystoreError>;

    fn put(&self, name: &str, key: &[u8]) -> Result<(), KeystoreError>;

    fn list(&self) -> Result<Vec<String>, KeystoreError>;
}

fn check_name(name: &str) -> Result<(), KeystoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(KeystoreError::InvalidName(name.to_string()))
    }
}

#[derive(Default)]
pub struct MemKeystore {
    keys: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemKeystore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keystore for MemKeystore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, KeystoreError> {
        check_name(name)?;
        Ok(self.keys.read().get(name).cloned())
    }

    fn put(&self, name: &str, key: &[u8]) -> Result<(), KeystoreError> {
        check_name(name)?;
        self.keys.write().insert(name.to_string(), key.to_vec());
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, KeystoreError> {
        let mut names: Vec<_> = self.keys.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// One file per key inside `dir`
pub struct FsKeystore {
    dir: PathBuf,
}

impl FsKeystore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeystoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl Keystore for FsKeystore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, KeystoreError> {
        check_name(name)?;
        match fs::read(self.dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, name: &str, key: &[u8]) -> Result<(), KeystoreError> {
        check_name(name)?;
        fs::write(self.dir.join(name), key)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, KeystoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if check_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Load the node identity, generating and persisting a fresh ed25519 key
/// the first time.
pub fn load_or_create_identity(keystore: &dyn Keystore) -> Result<Keypair, KeystoreError> {
    if let Some(bytes) = keystore.get(IDENTITY_KEY)? {
        let keypair = Keypair::from_protobuf_encoding(&bytes)?;
        info!(peer_id = %keypair.public().to_peer_id(), "Loaded node identity");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair.to_protobuf_encoding()?;
    keystore.put(IDENTITY_KEY, &encoded)?;
    info!(peer_id = %keypair.public().to_peer_id(), "Generated new node identity");

    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_keystore() {
        let ks = MemKeystore::new();
        assert_eq!(ks.get("wallet").unwrap(), None);

        ks.put("wallet", b"secret").unwrap();
        assert_eq!(ks.get("wallet").unwrap(), Some(b"secret".to_vec()));
        assert_eq!(ks.list().unwrap(), vec!["wallet".to_string()]);
    }

    #[test]
    fn test_rejects_path_like_names() {
        let ks = MemKeystore::new();
        assert!(matches!(
            ks.put("../escape", b"x"),
            Err(KeystoreError::InvalidName(_))
        ));
        assert!(ks.get("").is_err());
    }

    #[test]
    fn test_fs_keystore() {
        let dir = tempfile::tempdir().unwrap();
        let ks = FsKeystore::open(dir.path().join("keys")).unwrap();

        ks.put("alpha", b"one").unwrap();
        ks.put("beta", b"two").unwrap();

        assert_eq!(ks.get("alpha").unwrap(), Some(b"one".to_vec()));
        assert_eq!(ks.get("gamma").unwrap(), None);
        assert_eq!(ks.list().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let ks = FsKeystore::open(dir.path()).unwrap();

        let first = load_or_create_identity(&ks).unwrap();
        let second = load_or_create_identity(&ks).unwrap();

        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }
}
