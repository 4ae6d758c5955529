//! `aegis init` — write the default configuration.

use aegis_config::AppConfig;
use anyhow::Context;
use std::path::Path;

pub fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));

    if write_default_config(&config_path)? {
        println!("Created config at: {}", config_path.display());
        println!("Run `aegis chat --new-session` to start a persisted conversation.");
    } else {
        println!("Config already exists at: {}", config_path.display());
        println!("Edit it manually or delete it and re-run init.");
    }
    Ok(())
}

/// Returns `false` when a config file is already present.
fn write_default_config(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}
