//! Initialize the configuration directory: create ~/.caduceus, a default config with a fresh
//! token secret, an empty identity store and the orders tree.

use anyhow::{Context, Result};
use base64::Engine;
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::executor::OrdersTree;

/// Ensure the configuration directory has been initialized (config file and work directory exist).
pub fn require_initialized(config_path: &Path, config: &Config) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `caduceus init` first (config file not found: {})",
            config_path.display()
        );
    }
    let work_dir = config::resolve_work_dir(config, config_path);
    if !OrdersTree::new(&work_dir).orders_dir().exists() {
        anyhow::bail!(
            "configuration not initialized; run `caduceus init` first (orders directory not found under {})",
            work_dir.display()
        );
    }
    Ok(())
}

/// 32 random bytes, base64url. Used as the default token secret.
pub fn generate_secret() -> Result<String> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow::anyhow!("generating secret: {}", e))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// Create the config directory and default files if they do not exist.
/// - Writes `config.json` with a generated `auth.secret` if missing.
/// - Creates the work directory with the orders tree (`orders/`, `orders-archive/`, `responses/`, `outbox/`).
/// - Writes an empty `users.json` if the identity store does not exist yet.
///
/// Existing files are left alone.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config::config_dir(config_path);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let mut default_config = Config::default();
        default_config.auth.secret = Some(generate_secret()?);
        let body = serde_json::to_string_pretty(&default_config).context("encoding default config")?;
        std::fs::write(config_path, body)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        restrict_permissions(config_path);
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;

    let tree = OrdersTree::new(config::resolve_work_dir(&config, config_path));
    for dir in [
        tree.orders_dir(),
        tree.archive_dir(),
        tree.responses_dir(),
        tree.outbox_dir(),
    ] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            log::info!("created {}", dir.display());
        }
    }

    let store_path = config::resolve_store_path(&config, config_path);
    if !store_path.exists() {
        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&store_path, b"{\"users\":[]}")
            .with_context(|| format!("writing empty identity store to {}", store_path.display()))?;
        restrict_permissions(&store_path);
        log::info!("created identity store at {}", store_path.display());
    } else {
        log::debug!("identity store already exists at {}, skipping", store_path.display());
    }

    Ok(config_dir)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        log::warn!("could not restrict permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
