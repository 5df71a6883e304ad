//! Keyring integration for secure API key storage
//! Falls back to file storage if keyring is unavailable

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

const SERVICE_NAME: &str = "voicebridge";

fn named_secret_file_path(name: &str) -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voicebridge", "voicebridge").context("Failed to get project directories")?;
    let dir = base.config_dir();
    fs::create_dir_all(dir).context("Failed to create config directory")?;
    Ok(dir.join(format!("{name}.secret")))
}

/// Store a named secret (e.g. "carrier-api-key", "provider-realtime-api-key").
pub fn set_named_secret(name: &str, value: &str) -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, name) {
        if entry.set_password(value).is_ok() {
            let _ = save_named_secret_to_file(name, value);
            return Ok(());
        }
    }
    save_named_secret_to_file(name, value)
}

fn save_named_secret_to_file(name: &str, value: &str) -> Result<()> {
    let path = named_secret_file_path(name)?;
    fs::write(&path, value).context("Failed to write secret file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).context("Failed to set file permissions")?;
    }

    Ok(())
}

/// Resolve a named secret previously stored with `set_named_secret`.
pub fn get_named_secret(name: &str) -> Result<String> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, name) {
        if let Ok(value) = entry.get_password() {
            return Ok(value);
        }
    }

    let path = named_secret_file_path(name)?;
    let value = fs::read_to_string(&path).with_context(|| format!("secret '{name}' not configured"))?;
    Ok(value.trim().to_string())
}

pub fn has_named_secret(name: &str) -> bool {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, name) {
        if entry.get_password().is_ok() {
            return true;
        }
    }
    named_secret_file_path(name).map(|p| p.exists()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_secret_file_path_scopes_by_name() {
        let a = named_secret_file_path("carrier-api-key").unwrap();
        let b = named_secret_file_path("sms-api-key").unwrap();
        assert_ne!(a, b);
    }
}
