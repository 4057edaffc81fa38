//! Hopwire Keystore
//!
//! Load-or-generate key files and the JSON settings file for a hopwire
//! node. Keys are stored as raw 32-byte secrets; settings default to a
//! sensible configuration on first load and are written back so the
//! operator has a file to edit.

mod keyfile;
mod paths;
mod settings;

pub use keyfile::{load_or_generate_receiver_key, load_or_generate_signing_key};
pub use paths::{default_config_dir, default_keystore_dir, expand_path};
pub use settings::{ChannelPolicy, PaymentsSettings, TunnelSettings};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read file: {0}")]
    Read(std::io::Error),

    #[error("Failed to write file: {0}")]
    Write(std::io::Error),

    #[error("Failed to create directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Invalid key file format: {0}")]
    InvalidFormat(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
