//! CLI configuration commands.
//!
//! Values live in `~/.visionary/config.toml`. Only the keys in [`KNOWN_KEYS`]
//! are accepted.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::output::{self, OutputFormat};

pub const API_URL_KEY: &str = "api-url";
pub const WAIT_TIMEOUT_KEY: &str = "wait-timeout-secs";

const KNOWN_KEYS: [&str; 2] = [API_URL_KEY, WAIT_TIMEOUT_KEY];

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a configuration value
    Set {
        /// Configuration key (api-url, wait-timeout-secs)
        key: String,
        value: String,
    },

    /// Get a configuration value
    Get { key: String },

    /// Show all configuration
    Show,

    /// Remove the configuration file
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".visionary").join("config.toml"))
}

fn load_config() -> Result<CliConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn save_config(cfg: &CliConfig) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn validate(key: &str, value: &str) -> Result<()> {
    match key {
        API_URL_KEY => {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                anyhow::bail!("{} must start with http:// or https://", API_URL_KEY);
            }
        }
        WAIT_TIMEOUT_KEY => {
            value
                .parse::<u64>()
                .with_context(|| format!("{} must be a whole number of seconds", WAIT_TIMEOUT_KEY))?;
        }
        _ => anyhow::bail!("Unknown key '{}', expected one of: {}", key, KNOWN_KEYS.join(", ")),
    }
    Ok(())
}

/// Read a stored value, ignoring an unreadable config file.
pub fn load_value(key: &str) -> Option<String> {
    load_config().ok().and_then(|cfg| cfg.values.get(key).cloned())
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Set { key, value } => {
            validate(&key, &value)?;
            let mut cfg = load_config()?;
            cfg.values.insert(key.clone(), value.clone());
            save_config(&cfg)?;

            match format {
                OutputFormat::Table => output::print_success(&format!("{} = {}", key, value)),
                _ => output::print_item(&serde_json::json!({ "key": key, "value": value }), format),
            }
        }

        ConfigCommands::Get { key } => {
            let cfg = load_config()?;
            match cfg.values.get(&key) {
                Some(value) => match format {
                    OutputFormat::Table => println!("{}", value),
                    _ => output::print_item(&serde_json::json!({ "key": key, "value": value }), format),
                },
                None => anyhow::bail!("Key '{}' not set", key),
            }
        }

        ConfigCommands::Show => {
            let cfg = load_config()?;
            if cfg.values.is_empty() {
                output::print_info("No configuration values set.");
                return Ok(());
            }
            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    for (k, v) in &cfg.values {
                        output::print_detail(k, v);
                    }
                }
                _ => output::print_item(&cfg.values, format),
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This will reset all CLI configuration. Use --force to confirm.");
                return Ok(());
            }
            let path = config_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}
