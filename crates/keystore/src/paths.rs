//! Path utilities for cross-platform support.

use std::path::{Path, PathBuf};

/// Expand a path, replacing a leading `~` with the user's home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Ok(stripped) = path.strip_prefix("~") {
            if let Some(home) = home_dir() {
                return home.join(stripped);
            }
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

/// Default keystore directory for the current platform.
pub fn default_keystore_dir() -> PathBuf {
    default_config_dir().join("keys")
}

/// Default config directory for the current platform.
///
/// - Linux: `~/.config/hopwire` (honors `XDG_CONFIG_HOME`)
/// - macOS: `~/Library/Application Support/Hopwire`
/// - Windows: `%APPDATA%\Hopwire`
pub fn default_config_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home_dir()
            .map(|h| h.join("Library/Application Support/Hopwire"))
            .unwrap_or_else(|| PathBuf::from(".hopwire"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("hopwire")
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("Hopwire")
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        home_dir()
            .map(|h| h.join(".hopwire"))
            .unwrap_or_else(|| PathBuf::from(".hopwire"))
    }
}
