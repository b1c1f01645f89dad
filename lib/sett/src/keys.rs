use crate::crypto;
use crate::encoding::base64;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("i/o error reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("malformed key material in {path}: {detail}")]
    Malformed { path: PathBuf, detail: String },

    #[error("secret key does not convert to an exchange key")]
    WeakSecret,
}

/// Long-term Ed25519 identity of a node. The secret half never leaves this struct;
/// the derived Curve25519 exchange secret is computed once at load time.
pub struct Identity {
    public: [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
    secret: [u8; crypto::SIGN_SECRET_KEY_SIZE],
    exchange_secret: [u8; crypto::EXCHANGE_KEY_SIZE],
}

impl Identity {
    /// Generates a fresh identity.
    pub fn generate() -> Result<Identity, KeyError> {
        let (public, secret) = crypto::sign_keypair();
        Self::assemble(public, secret)
    }

    /// Loads an identity from `<dir>/<name>.pub` and `<dir>/<name>.sec`,
    /// both base64 text files.
    pub fn load(dir: &Path, name: &str) -> Result<Identity, KeyError> {
        let mut public = [0u8; crypto::SIGN_PUBLIC_KEY_SIZE];
        let mut secret = [0u8; crypto::SIGN_SECRET_KEY_SIZE];

        read_key_file(&dir.join(format!("{}.pub", name)), &mut public)?;
        read_key_file(&dir.join(format!("{}.sec", name)), &mut secret)?;

        Self::assemble(public, secret)
    }

    /// Writes the identity out as `<dir>/<name>.pub` and `<dir>/<name>.sec`.
    pub fn save(&self, dir: &Path, name: &str) -> Result<(), KeyError> {
        write_key_file(&dir.join(format!("{}.pub", name)), &self.public)?;
        write_key_file(&dir.join(format!("{}.sec", name)), &self.secret)
    }

    #[inline]
    pub fn public(&self) -> &[u8; crypto::SIGN_PUBLIC_KEY_SIZE] {
        &self.public
    }

    #[inline]
    pub fn exchange_secret(&self) -> &[u8; crypto::EXCHANGE_KEY_SIZE] {
        &self.exchange_secret
    }

    fn assemble(
        public: [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
        secret: [u8; crypto::SIGN_SECRET_KEY_SIZE],
    ) -> Result<Identity, KeyError> {
        let exchange_secret = crypto::secret_to_exchange(&secret).ok_or(KeyError::WeakSecret)?;

        Ok(Identity {
            public,
            secret,
            exchange_secret,
        })
    }
}

fn read_key_file(path: &Path, out: &mut [u8]) -> Result<(), KeyError> {
    let text = fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    base64::decode_exact(&text, out).map_err(|detail| KeyError::Malformed {
        path: path.to_path_buf(),
        detail,
    })
}

fn write_key_file(path: &Path, key: &[u8]) -> Result<(), KeyError> {
    fs::write(path, format!("{}\n", base64::encode(key))).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("sett-keys-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = scratch_dir("roundtrip");

        let identity = Identity::generate().unwrap();
        identity.save(&dir, "node").unwrap();

        let loaded = Identity::load(&dir, "node").unwrap();

        assert_eq!(loaded.public(), identity.public());
        assert_eq!(loaded.exchange_secret(), identity.exchange_secret());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let dir = scratch_dir("missing");

        assert!(Identity::load(&dir, "absent").is_err());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_truncated_key() {
        let dir = scratch_dir("truncated");

        fs::write(dir.join("bad.pub"), "AAAA\n").unwrap();
        fs::write(dir.join("bad.sec"), "AAAA\n").unwrap();

        match Identity::load(&dir, "bad") {
            Err(KeyError::Malformed { .. }) => (),
            other => panic!("unexpected result: {:?}", other.err()),
        }

        fs::remove_dir_all(&dir).unwrap();
    }
}
