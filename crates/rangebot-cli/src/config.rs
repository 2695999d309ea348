//! Configuration Vault – reads/writes `~/.rangebot/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use rangebot_hal::drivers::ads1115::{self, Ads1115Config};
use rangebot_hal::drivers::arduino_range::{self, ArduinoRangeConfig};
use rangebot_hal::drivers::htu21d::{self, Htu21dConfig};
use rangebot_hal::drivers::pca9685::{self, Pca9685Config};
use rangebot_hal::drivers::srf08::{self, Srf08Config};
use rangebot_hal::drivers::vcnl4000::{self, Vcnl4000Config};
use rangebot_hal::PowerLawConverter;
use rangebot_runtime::SweepConfig;

/// One I2C peripheral: where it lives and how its driver is tuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection<C> {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// 7-bit slave address.
    pub address: u16,
    #[serde(default)]
    pub settings: C,
}

impl<C: Default> DeviceSection<C> {
    fn at(address: u16) -> Self {
        Self {
            enabled: true,
            address,
            settings: C::default(),
        }
    }

    fn disabled_at(address: u16) -> Self {
        Self {
            enabled: false,
            ..Self::at(address)
        }
    }
}

fn enabled() -> bool {
    true
}

/// Analog IR ranger sampled through one ADC channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IrRanger {
    pub enabled: bool,
    pub channel: u8,
    pub curve: PowerLawConverter,
}

impl Default for IrRanger {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: 0,
            curve: PowerLawConverter::default(),
        }
    }
}

/// Persisted configuration stored in `~/.rangebot/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bus carrying the sensors and the servo controller.
    #[serde(default = "default_bus")]
    pub bus: String,

    /// Bus carrying the humidity sensor.  Its fixed address collides with the
    /// servo controller's default, so it needs a bus of its own.
    #[serde(default = "default_climate_bus")]
    pub climate_bus: String,

    /// Period of the stale-device check.
    #[serde(default = "default_diagnostic_interval_ms")]
    pub diagnostic_interval_ms: u64,

    #[serde(default = "default_adc")]
    pub adc: DeviceSection<Ads1115Config>,

    #[serde(default)]
    pub ir_ranger: IrRanger,

    #[serde(default = "default_proximity")]
    pub proximity: DeviceSection<Vcnl4000Config>,

    /// The range sensor that feeds the sweep.
    #[serde(default = "default_sonar")]
    pub sonar: DeviceSection<Srf08Config>,

    #[serde(default = "default_climate")]
    pub climate: DeviceSection<Htu21dConfig>,

    #[serde(default = "default_bridge")]
    pub bridge: DeviceSection<ArduinoRangeConfig>,

    #[serde(default = "default_servo")]
    pub servo: DeviceSection<Pca9685Config>,

    #[serde(default)]
    pub sweep: SweepConfig,
}

fn default_bus() -> String {
    "I2C1".to_string()
}
fn default_climate_bus() -> String {
    "I2C0".to_string()
}
fn default_diagnostic_interval_ms() -> u64 {
    30_000
}
fn default_adc() -> DeviceSection<Ads1115Config> {
    DeviceSection::at(ads1115::DEFAULT_ADDRESS)
}
fn default_proximity() -> DeviceSection<Vcnl4000Config> {
    DeviceSection::at(vcnl4000::DEFAULT_ADDRESS)
}
fn default_sonar() -> DeviceSection<Srf08Config> {
    DeviceSection::at(srf08::DEFAULT_ADDRESS)
}
fn default_climate() -> DeviceSection<Htu21dConfig> {
    DeviceSection::at(htu21d::DEFAULT_ADDRESS)
}
fn default_bridge() -> DeviceSection<ArduinoRangeConfig> {
    DeviceSection::disabled_at(arduino_range::DEFAULT_ADDRESS)
}
fn default_servo() -> DeviceSection<Pca9685Config> {
    DeviceSection::at(pca9685::DEFAULT_ADDRESS)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: default_bus(),
            climate_bus: default_climate_bus(),
            diagnostic_interval_ms: default_diagnostic_interval_ms(),
            adc: default_adc(),
            ir_ranger: IrRanger::default(),
            proximity: default_proximity(),
            sonar: default_sonar(),
            climate: default_climate(),
            bridge: default_bridge(),
            servo: default_servo(),
            sweep: SweepConfig::default(),
        }
    }
}

/// Return the path to `~/.rangebot/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rangebot").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `RANGEBOT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `RANGEBOT_BUS` | `bus` |
/// | `RANGEBOT_SWEEP_MIN` | `sweep.min` |
/// | `RANGEBOT_SWEEP_MAX` | `sweep.max` |
/// | `RANGEBOT_SONAR_INTERVAL_MS` | `sonar.settings.poll_interval_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("RANGEBOT_BUS") {
        cfg.bus = v;
    }
    if let Some(min) = var("RANGEBOT_SWEEP_MIN").and_then(|v| v.parse().ok()) {
        cfg.sweep.min = min;
    }
    if let Some(max) = var("RANGEBOT_SWEEP_MAX").and_then(|v| v.parse().ok()) {
        cfg.sweep.max = max;
    }
    if let Some(ms) = var("RANGEBOT_SONAR_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        cfg.sonar.settings.poll_interval_ms = ms;
    }
}

/// Save the config to disk, creating `~/.rangebot/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
