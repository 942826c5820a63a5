//! Symmetric encryption for the replication transport.
//!
//! AES-128 in CFB mode with a fresh random IV prepended to every
//! ciphertext. The cipher itself is not authenticated; authentication
//! comes from the challenge-response handshake layered above it, and
//! replay protection from the per-session random challenge.

use std::io;
use std::path::Path;

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;

use crate::error::{Error, Result};

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

/// AES default key length.
pub const KEY_LEN: usize = 16;

/// One cipher block; the size of the per-message IV.
pub const IV_LEN: usize = 16;

/// The pre-shared replication key, identical on every node of a
/// deployment. Read-only once loaded; shared freely across connections.
#[derive(Clone)]
pub struct SharedKey {
    key: [u8; KEY_LEN],
}

impl SharedKey {
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        SharedKey { key }
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        SharedKey { key }
    }

    /// Load a hex-encoded key from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let bytes = hex::decode(contents.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("key file: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("key file: expected {} bytes, got {}", KEY_LEN, bytes.len()),
            )
        })?;
        Ok(SharedKey { key })
    }

    /// Save the key hex-encoded, owner-readable only.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(self.key))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Load the key, or generate and persist one when the file is absent.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("generating new replication key at {:?}", path);
            let key = Self::generate();
            key.save(path)?;
            Ok(key)
        }
    }

    /// Encrypt a buffer. Returns `iv || ciphertext` with a fresh random
    /// 16-byte IV each call.
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut out = Vec::with_capacity(IV_LEN + plain.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(plain);
        Aes128CfbEnc::new(&self.key.into(), &iv.into()).encrypt(&mut out[IV_LEN..]);
        out
    }

    /// Decrypt an `iv || ciphertext` buffer produced by [`SharedKey::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < IV_LEN {
            return Err(Error::Protocol(format!(
                "encrypted blob of {} bytes is shorter than one IV",
                blob.len()
            )));
        }
        let (iv, ciphertext) = blob.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().expect("split_at length");
        let mut out = ciphertext.to_vec();
        Aes128CfbDec::new(&self.key.into(), &iv.into()).decrypt(&mut out);
        Ok(out)
    }
}
