use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::{MemoryCacheLimits, default_cache_root};
use crate::models::CachePricing;
use crate::utils::NumberFormatOptions;

pub const ENV_PREFIX: &str = "SESSION_STATS_";
const MAX_ROLLUP_NAME_CHARS: usize = 50;
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub pricing: PricingConfig,
    pub processing: ProcessingConfig,
    pub logging: LoggingConfig,
    pub formatting: FormattingConfig,
    /// Rollup name to canonical directory.
    pub rollups: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_projects: usize,
    pub max_mb_per_project: u64,
    /// Defaults to `~/.session-stats/cache`.
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    pub cache_read_multiplier: f64,
    pub cache_write_multiplier: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    pub warm_on_startup: usize,
    pub enable_background: bool,
    pub max_date_range_days: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FormattingConfig {
    pub number_comma: bool,
    pub number_human: bool,
    pub locale: String,
    pub decimal_places: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_projects: 5,
            max_mb_per_project: 500,
            directory: None,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        let pricing = CachePricing::default();
        Self {
            cache_read_multiplier: pricing.read_multiplier,
            cache_write_multiplier: pricing.write_multiplier,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            warm_on_startup: 3,
            enable_background: true,
            max_date_range_days: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            number_comma: true,
            number_human: false,
            locale: "en".to_string(),
            decimal_places: 2,
        }
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".session-stats.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    /// File (or defaults) with environment overrides applied on top.
    pub fn load_effective() -> Result<Config> {
        let mut config = Self::load()?.unwrap_or_default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, silent: bool) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        if !silent {
            println!("✅ Configuration saved to: {}", config_path.display());
        }

        Ok(())
    }

    /// Applies `SESSION_STATS_*` variables. Values that do not parse leave
    /// the current setting alone.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("CACHE_MAX_PROJECTS").and_then(|v| v.trim().parse().ok()) {
            self.cache.max_projects = v;
        }
        if let Some(v) = var("CACHE_MAX_MB_PER_PROJECT").and_then(|v| v.trim().parse().ok()) {
            self.cache.max_mb_per_project = v;
        }
        if let Some(v) = var("CACHE_DIR").filter(|v| !v.trim().is_empty()) {
            self.cache.directory = Some(PathBuf::from(v));
        }
        if let Some(v) = var("WARM_ON_STARTUP").and_then(|v| v.trim().parse().ok()) {
            self.processing.warm_on_startup = v;
        }
        if let Some(v) = var("ENABLE_BACKGROUND_PROCESSING") {
            self.processing.enable_background = parse_flag(&v);
        }
        if let Some(v) = var("MAX_DATE_RANGE_DAYS").and_then(|v| v.trim().parse().ok()) {
            self.processing.max_date_range_days = v;
        }
        if let Some(v) = var("LOG_LEVEL").and_then(|v| normalize_log_level(&v)) {
            self.logging.level = v;
        }
    }

    pub fn memory_limits(&self) -> MemoryCacheLimits {
        MemoryCacheLimits::from_mb(self.cache.max_projects, self.cache.max_mb_per_project)
    }

    pub fn cache_pricing(&self) -> CachePricing {
        CachePricing {
            read_multiplier: self.pricing.cache_read_multiplier,
            write_multiplier: self.pricing.cache_write_multiplier,
        }
    }

    pub fn cache_root(&self) -> Result<PathBuf> {
        match &self.cache.directory {
            Some(dir) => Ok(expand_home(dir)),
            None => default_cache_root(),
        }
    }

    pub fn format_options(&self) -> NumberFormatOptions {
        NumberFormatOptions {
            use_comma: self.formatting.number_comma,
            use_human: self.formatting.number_human,
            locale: self.formatting.locale.clone(),
            decimal_places: self.formatting.decimal_places,
        }
    }

    /// Registers a rollup and returns the canonical directory it points at.
    pub fn add_rollup(&mut self, name: &str, path: &Path) -> Result<PathBuf> {
        validate_rollup_name(name)?;
        let canonical = validate_rollup_path(path)?;

        if let Some((existing, _)) = self
            .rollups
            .iter()
            .find(|(other, p)| **p == canonical && other.as_str() != name)
        {
            anyhow::bail!(
                "Path '{}' is already used by rollup '{}'",
                canonical.display(),
                existing
            );
        }

        self.rollups.insert(name.to_string(), canonical.clone());
        Ok(canonical)
    }

    pub fn remove_rollup(&mut self, name: &str) -> bool {
        self.rollups.remove(name).is_some()
    }

    pub fn rollup_path(&self, name: &str) -> Option<&Path> {
        self.rollups.get(name).map(PathBuf::as_path)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn normalize_log_level(value: &str) -> Option<String> {
    let level = value.trim().to_ascii_lowercase();
    let level = if level == "warning" { "warn".to_string() } else { level };
    LOG_LEVELS.contains(&level.as_str()).then_some(level)
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

pub fn validate_rollup_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("Rollup name cannot be empty");
    }
    if name.chars().count() > MAX_ROLLUP_NAME_CHARS {
        anyhow::bail!("Rollup name cannot exceed {MAX_ROLLUP_NAME_CHARS} characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_')
    {
        anyhow::bail!(
            "Rollup name can only contain letters, numbers, spaces, hyphens, and underscores"
        );
    }
    Ok(())
}

fn validate_rollup_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("Rollup path cannot be empty");
    }
    let expanded = expand_home(path);
    if !expanded.exists() {
        anyhow::bail!("Directory does not exist: {}", path.display());
    }
    if !expanded.is_dir() {
        anyhow::bail!("Path is not a directory: {}", path.display());
    }
    expanded
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))
}

// CLI helper functions
pub fn create_default_config(overwrite: bool) -> Result<()> {
    let config = Config::default();
    if !std::fs::exists(Config::config_path()?)? || overwrite {
        config.save(true)?;

        println!("📝 Created default configuration file.");
        println!("📍 Adjust cache limits or add rollups with:");
        println!("   session-stats config set cache-max-projects 10");
        println!("   session-stats config rollup-add <name> <dir>");
        println!("or edit");
        println!("   {}", Config::config_path()?.display());
    } else {
        println!("Configuration already exists.  Pass `--overwrite` to overwrite.");
    }

    Ok(())
}

pub fn show_config() -> Result<()> {
    match Config::load()? {
        Some(config) => {
            println!("🔧 Current configuration:");
            println!("   Cache Max Projects: {}", config.cache.max_projects);
            println!(
                "   Cache Max MB Per Project: {}",
                config.cache.max_mb_per_project
            );
            println!(
                "   Cache Directory: {}",
                config
                    .cache
                    .directory
                    .as_ref()
                    .map_or_else(|| "default".to_string(), |d| d.display().to_string())
            );
            println!(
                "   Cache Read Multiplier: {}",
                config.pricing.cache_read_multiplier
            );
            println!(
                "   Cache Write Multiplier: {}",
                config.pricing.cache_write_multiplier
            );
            println!("   Warm On Startup: {}", config.processing.warm_on_startup);
            println!(
                "   Background Processing: {}",
                config.processing.enable_background
            );
            println!("   Log Level: {}", config.logging.level);
            if config.rollups.is_empty() {
                println!("   Rollups: none");
            } else {
                println!("   Rollups:");
                for (name, path) in &config.rollups {
                    println!("     {name} -> {}", path.display());
                }
            }
        }
        None => {
            println!("❌ No configuration file found.");
            println!("   Run 'session-stats config init' to create one.");
        }
    }
    Ok(())
}

pub fn set_config_value(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();

    match key {
        "cache-max-projects" => {
            config.cache.max_projects = value.parse::<usize>().context("Invalid number value")?;
        }
        "cache-max-mb-per-project" => {
            config.cache.max_mb_per_project =
                value.parse::<u64>().context("Invalid number value")?;
        }
        "cache-dir" => {
            config.cache.directory = Some(PathBuf::from(value));
        }
        "cache-read-multiplier" => {
            config.pricing.cache_read_multiplier =
                parse_multiplier(value).context("Invalid multiplier value")?;
        }
        "cache-write-multiplier" => {
            config.pricing.cache_write_multiplier =
                parse_multiplier(value).context("Invalid multiplier value")?;
        }
        "warm-on-startup" => {
            config.processing.warm_on_startup =
                value.parse::<usize>().context("Invalid number value")?;
        }
        "background-processing" => {
            config.processing.enable_background = value
                .parse::<bool>()
                .context("Invalid boolean value. Use 'true' or 'false'")?;
        }
        "log-level" => {
            config.logging.level = normalize_log_level(value).with_context(|| {
                format!("Invalid log level. Use one of: {}", LOG_LEVELS.join(", "))
            })?;
        }
        "number-comma" => {
            config.formatting.number_comma = value
                .parse::<bool>()
                .context("Invalid boolean value. Use 'true' or 'false'")?;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }

    config.save(false)?;
    Ok(())
}

fn parse_multiplier(value: &str) -> Result<f64> {
    let parsed = value.parse::<f64>()?;
    if !parsed.is_finite() || parsed < 0.0 {
        anyhow::bail!("multiplier must be a non-negative number");
    }
    Ok(parsed)
}

pub fn add_rollup(name: &str, path: &Path) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();
    let canonical = config.add_rollup(name, path)?;
    config.save(true)?;
    println!("✅ Rollup '{name}' -> {}", canonical.display());
    Ok(())
}

pub fn remove_rollup(name: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();
    if config.remove_rollup(name) {
        config.save(true)?;
        println!("🗑️  Removed rollup '{name}'");
    } else {
        println!("No rollup named '{name}'");
    }
    Ok(())
}
