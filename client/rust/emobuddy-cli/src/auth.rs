//! API key lookup for the live endpoint.

use anyhow::{Context, Result};
use std::path::Path;

pub const API_KEY_VARS: [&str; 2] = ["EMOBUDDY_API_KEY", "API_KEY"];

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Value of `key` in a dotenv file, if the file exists and sets it.
pub fn read_env_value(path: &Path, key: &str) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let entries = dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to read env file: {}", path.display()))?;
    for entry in entries {
        let (name, value) =
            entry.with_context(|| format!("Failed to parse env file: {}", path.display()))?;
        if name == key {
            return Ok(non_empty(Some(value)));
        }
    }
    Ok(None)
}

/// Checks `.env.<env>` then `.env` under `base_dir` for any of the key names.
pub fn load_key_from_env_files(base_dir: &Path, env_name: Option<&str>) -> Result<Option<String>> {
    let env_name = env_name.unwrap_or("development");
    let candidates = [format!(".env.{env_name}"), ".env".to_string()];

    for file_name in candidates {
        let path = base_dir.join(file_name);
        for key in API_KEY_VARS {
            if let Some(value) = read_env_value(&path, key)? {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

/// `--api-key`, then `EMOBUDDY_API_KEY`, then `API_KEY`, then env files.
/// `None` means connect without credentials.
pub fn resolve_api_key(
    explicit: Option<&str>,
    base_dir: &Path,
    env_name: Option<&str>,
) -> Result<Option<String>> {
    if let Some(key) = non_empty(explicit.map(str::to_string)) {
        return Ok(Some(key));
    }
    for var in API_KEY_VARS {
        if let Some(key) = non_empty(std::env::var(var).ok()) {
            return Ok(Some(key));
        }
    }
    load_key_from_env_files(base_dir, env_name)
}
