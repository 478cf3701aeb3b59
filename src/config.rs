//! Configuration for the transactional memory core.
//!
//! Parameters live in the `[transactional_memory]` section of a TOML file
//! and are read once at startup. Sources in priority order:
//!
//! 1. Environment variables (`TM_EMU_*`)
//! 2. Project-local config file (`./tm-emu.toml`)
//! 3. User config file (`~/.config/tm-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # tm-emu.toml
//! [transactional_memory]
//! versioning = true
//! conflict_detection = true
//! cache_line_size = 64
//! nack_stall_cycles = 10
//! abort_exp_backoff = 2
//! rng_seed = 12345
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<TmConfig> = OnceLock::new();

/// The `transactional_memory` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmConfig {
    /// Eager (true) or lazy (false) versioning model.
    pub versioning: bool,
    /// Eager (true) or lazy (false) conflict detection.
    pub conflict_detection: bool,
    /// Conflict-detection granularity in bytes; a power of two.
    pub cache_line_size: u32,
    /// Number of simulated CPUs.
    pub num_cpus: usize,
    /// Cycles to stall after a NACK.
    pub nack_stall_cycles: u64,
    /// Base + per-write-set-line stall for the primary slow path
    /// (abort under eager versioning, commit under lazy).
    pub primary_base_stall_cycles: u64,
    pub primary_var_stall_cycles: u64,
    /// Likewise for the secondary slow path.
    pub secondary_base_stall_cycles: u64,
    pub secondary_var_stall_cycles: u64,
    /// Exponent base for post-abort backoff; 0 selects linear backoff.
    pub abort_exp_backoff: u64,
    /// Upper bound for the linear-backoff uniform draw.
    pub abort_lin_backoff: u64,
    /// Whether stalls get symmetric random jitter.
    pub apply_randomization: bool,
    /// Optional cap on consecutive aborts per process; absent = unbounded.
    pub abort_max: Option<u32>,
    /// Seed for the backoff RNG; absent = OS entropy.
    pub rng_seed: Option<u64>,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            versioning: true,
            conflict_detection: true,
            cache_line_size: 64,
            num_cpus: 32,
            nack_stall_cycles: 10,
            primary_base_stall_cycles: 100,
            primary_var_stall_cycles: 10,
            secondary_base_stall_cycles: 50,
            secondary_var_stall_cycles: 5,
            abort_exp_backoff: 2,
            abort_lin_backoff: 16,
            apply_randomization: false,
            abort_max: None,
            rng_seed: None,
        }
    }
}

/// On-disk layout: the section table inside the config file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    transactional_memory: Option<TmConfig>,
}

impl TmConfig {
    /// Load configuration from all sources.
    pub fn load() -> Self {
        // Project-local file wins over the user file.
        let mut config = Self::load_local_config()
            .or_else(Self::load_user_config)
            .unwrap_or_default();

        // Environment variables override everything.
        config.apply_env_overrides();
        config
    }

    /// Get the cached global configuration, loading it on first call.
    pub fn get() -> &'static TmConfig {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Load from `~/.config/tm-emu/config.toml`.
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("tm-emu").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load from `./tm-emu.toml`.
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("tm-emu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("tm-emu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load the `transactional_memory` section from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<ConfigFile>(&content) {
                Ok(file) => {
                    log::info!("Loaded config from {}", path.display());
                    file.transactional_memory
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

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_flag("TM_EMU_VERSIONING") {
            self.versioning = v;
        }
        if let Some(v) = env_flag("TM_EMU_CONFLICT_DETECTION") {
            self.conflict_detection = v;
        }
        if let Ok(v) = std::env::var("TM_EMU_RNG_SEED") {
            match v.parse() {
                Ok(seed) => self.rng_seed = Some(seed),
                Err(_) => log::warn!("Ignoring unparsable TM_EMU_RNG_SEED: {}", v),
            }
        }
        if let Ok(v) = std::env::var("TM_EMU_NUM_CPUS") {
            match v.parse() {
                Ok(n) => self.num_cpus = n,
                Err(_) => log::warn!("Ignoring unparsable TM_EMU_NUM_CPUS: {}", v),
            }
        }
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# tm-emu configuration
# Place this file at ~/.config/tm-emu/config.toml or ./tm-emu.toml

[transactional_memory]
# Versioning / conflict-detection model. Supported combinations:
#   versioning = true,  conflict_detection = true   (eager/eager)
#   versioning = false, conflict_detection = true   (eager detection, lazy stall roles)
#   versioning = false, conflict_detection = false  (lazy/lazy)
versioning = true
conflict_detection = true

cache_line_size = 64
num_cpus = 32

# Stall timing (cycles)
nack_stall_cycles = 10
primary_base_stall_cycles = 100
primary_var_stall_cycles = 10
secondary_base_stall_cycles = 50
secondary_var_stall_cycles = 5

# Post-abort backoff: exponential with this base, or linear when 0
abort_exp_backoff = 2
abort_lin_backoff = 16
apply_randomization = false

# Deterministic runs
# rng_seed = 12345

# Give up retrying a transaction after this many consecutive aborts
# abort_max = 64
"#
        .to_string()
    }
}

/// Parse a 0/1 or true/false environment flag.
fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        other => {
            log::warn!("Ignoring unparsable {}: {}", name, other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_eager_eager() {
        let config = TmConfig::default();
        assert!(config.versioning);
        assert!(config.conflict_detection);
        assert_eq!(config.cache_line_size, 64);
        assert!(config.abort_max.is_none());
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = TmConfig::sample_config();
        let file: ConfigFile = toml::from_str(&sample).expect("sample config should parse");
        let config = file.transactional_memory.expect("section present");
        assert_eq!(config.nack_stall_cycles, 10);
        assert_eq!(config.abort_lin_backoff, 16);
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let content = r#"
[transactional_memory]
versioning = false
conflict_detection = false
rng_seed = 99
"#;
        let file: ConfigFile = toml::from_str(content).unwrap();
        let config = file.transactional_memory.unwrap();
        assert!(!config.versioning);
        assert_eq!(config.rng_seed, Some(99));
        // Untouched keys keep their defaults.
        assert_eq!(config.num_cpus, 32);
        assert_eq!(config.primary_base_stall_cycles, 100);
    }
}
