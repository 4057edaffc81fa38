//! Key file management.

use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::info;

use hopwire_crypto::ReceiverKeypair;

use crate::paths::expand_path;
use crate::{KeystoreError, Result};

fn read_key_bytes(path: &Path) -> Result<Option<[u8; 32]>> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = std::fs::read(path).map_err(KeystoreError::Read)?;
    if bytes.len() != 32 {
        return Err(KeystoreError::InvalidFormat(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(Some(key))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(KeystoreError::CreateDir)?;
        }
    }
    Ok(())
}

/// Load an existing receiver (x25519) keypair from disk, or generate and
/// persist a new one. The file holds the raw 32-byte secret.
pub fn load_or_generate_receiver_key(keyfile: &Path) -> Result<ReceiverKeypair> {
    let path = expand_path(keyfile);
    ensure_parent(&path)?;

    if let Some(bytes) = read_key_bytes(&path)? {
        let keypair = ReceiverKeypair::from_bytes(bytes);
        info!(path = %path.display(), "loaded existing receiver keypair");
        return Ok(keypair);
    }

    let keypair = ReceiverKeypair::generate();
    std::fs::write(&path, keypair.to_bytes()).map_err(KeystoreError::Write)?;

    info!(path = %path.display(), "generated new receiver keypair");
    Ok(keypair)
}

/// Load an existing ed25519 signing keypair from disk, or generate and
/// persist a new one.
pub fn load_or_generate_signing_key(keyfile: &Path) -> Result<SigningKey> {
    let path = expand_path(keyfile);
    ensure_parent(&path)?;

    if let Some(bytes) = read_key_bytes(&path)? {
        let key = SigningKey::from_bytes(&bytes);
        info!(path = %path.display(), "loaded existing signing keypair");
        return Ok(key);
    }

    let key = SigningKey::generate(&mut OsRng);
    std::fs::write(&path, key.to_bytes()).map_err(KeystoreError::Write)?;

    info!(path = %path.display(), "generated new signing keypair");
    Ok(key)
}
