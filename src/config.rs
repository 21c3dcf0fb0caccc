//! Configuration management for tensix-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`TENSIX_EMU_ARCH`, `TENSIX_EMU_WORKER_L1_SIZE`,
//!    `TENSIX_EMU_DRAM_BANK_SIZE`)
//! 2. Project-local config file (`./tensix-emu.toml`)
//! 3. User config file (`~/.config/tensix-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # tensix-emu.toml
//!
//! # Architecture preset: "grayskull" or "small"
//! arch = "small"
//!
//! # Memory size overrides in bytes
//! worker_l1_size = 1048576
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::device::arch_config::{GridArch, GridLayout};
use crate::error::{EmuError, Result};

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Preset used when nothing is configured.
pub const DEFAULT_ARCH: &str = "grayskull";

/// tensix-emu configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Architecture preset name.
    pub arch: Option<String>,

    /// L1 size of every worker core, in bytes.
    pub worker_l1_size: Option<u32>,

    /// Size of every DRAM channel bank, in bytes.
    pub dram_bank_size: Option<u32>,

    /// Full mesh description. Replaces the preset when present; fields left
    /// out take their Grayskull values, including the ARC core at (0, 2).
    pub grid: Option<GridLayout>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `tensix-emu.toml`
    /// 3. User config `~/.config/tensix-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Preset name, with fallback to the default.
    pub fn arch_name(&self) -> &str {
        self.arch.as_deref().unwrap_or(DEFAULT_ARCH)
    }

    /// Resolve the grid layout with memory size overrides applied.
    pub fn layout(&self) -> Result<GridLayout> {
        let mut layout = match &self.grid {
            Some(grid) => grid.clone(),
            None => GridLayout::preset(self.arch_name())
                .ok_or_else(|| EmuError::config(format!("unknown architecture preset '{}'", self.arch_name())))?,
        };
        if let Some(size) = self.worker_l1_size {
            layout.worker_l1_size = size;
        }
        if let Some(size) = self.dram_bank_size {
            layout.dram_bank_size = size;
        }
        Ok(layout)
    }

    /// Build the architecture this configuration describes.
    pub fn build_arch(&self) -> Result<GridArch> {
        GridArch::new(self.layout()?)
    }

    /// Load user configuration from ~/.config/tensix-emu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./tensix-emu.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("tensix-emu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("tensix-emu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.arch.is_some() {
            self.arch = other.arch;
        }
        if other.worker_l1_size.is_some() {
            self.worker_l1_size = other.worker_l1_size;
        }
        if other.dram_bank_size.is_some() {
            self.dram_bank_size = other.dram_bank_size;
        }
        if other.grid.is_some() {
            self.grid = other.grid;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(arch) = std::env::var("TENSIX_EMU_ARCH") {
            log::info!("Using TENSIX_EMU_ARCH from environment: {}", arch);
            self.arch = Some(arch);
            // an explicit preset wins over a file grid
            self.grid = None;
        }
        if let Some(size) = env_size("TENSIX_EMU_WORKER_L1_SIZE") {
            self.worker_l1_size = Some(size);
        }
        if let Some(size) = env_size("TENSIX_EMU_DRAM_BANK_SIZE") {
            self.dram_bank_size = Some(size);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tensix-emu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# tensix-emu configuration
# Place this file at ~/.config/tensix-emu/config.toml or ./tensix-emu.toml

# Architecture preset: "grayskull" (13x12 mesh) or "small" (4x4 mesh)
arch = "grayskull"

# Memory size overrides in bytes (optional)
# worker_l1_size = 1048576
# dram_bank_size = 1073741824

# Custom mesh (optional, replaces the preset)
# [grid]
# name = "custom"
# size_x = 4
# size_y = 4
# worker_columns = [1, 2, 3]
# worker_rows = [1, 2, 3]
# dram_cores = [[1, 0], [2, 0]]
# pcie_core = [0, 0]
"#
        .to_string()
    }
}

/// Byte count from the environment, decimal or `0x` hex.
fn env_size(var: &str) -> Option<u32> {
    let raw = std::env::var(var).ok()?;
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    match parsed {
        Ok(size) => {
            log::info!("Using {} from environment: {}", var, size);
            Some(size)
        }
        Err(e) => {
            log::warn!("Ignoring {}={}: {}", var, raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::arch_config::{NocArch, SocArch};

    #[test]
    fn test_default_arch() {
        let config = Config::default();
        assert_eq!(config.arch_name(), "grayskull");
        let arch = config.build_arch().unwrap();
        assert_eq!(arch.noc_size_x(), 13);
        assert_eq!(arch.num_dram_channels(), 8);
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            arch: Some("grayskull".to_string()),
            worker_l1_size: Some(512 * 1024),
            dram_bank_size: None,
            grid: None,
        };

        let overlay = Config {
            arch: Some("small".to_string()),
            worker_l1_size: None,
            dram_bank_size: Some(1 << 20),
            grid: None,
        };

        base.merge(overlay);

        assert_eq!(base.arch.as_deref(), Some("small"));
        // worker_l1_size unchanged (overlay was None)
        assert_eq!(base.worker_l1_size, Some(512 * 1024));
        assert_eq!(base.dram_bank_size, Some(1 << 20));

        let layout = base.layout().unwrap();
        assert_eq!(layout.name, "small");
        assert_eq!(layout.worker_l1_size, 512 * 1024);
        assert_eq!(layout.dram_bank_size, 1 << 20);
    }

    #[test]
    fn test_unknown_preset() {
        let config = Config { arch: Some("wormhole".to_string()), ..Config::default() };
        assert!(matches!(config.build_arch(), Err(EmuError::Configuration(_))));
    }

    #[test]
    fn test_grid_table() {
        let config: Config = toml::from_str(
            r#"
            [grid]
            name = "tiny"
            size_x = 3
            size_y = 3
            worker_columns = [1, 2]
            worker_rows = [1]
            dram_cores = [[0, 1]]
            pcie_core = [0, 0]
            "#,
        )
        .unwrap();
        let arch = config.build_arch().unwrap();
        assert_eq!(arch.name(), "tiny");
        assert_eq!(arch.worker_x_size(), 2);
        assert_eq!(arch.num_dram_banks(), 1);
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(config.arch_name(), "grayskull");
    }
}
