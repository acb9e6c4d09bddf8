use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::tariff::Provider;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub device: DeviceConfig,
    pub tariff: TariffConfig,
    pub heating: HeatingConfig,
    pub sources: SourcesConfig,
    pub daemon: DaemonConfig,
    pub dispatch: DispatchConfig,
}

/// Target relay device and how its output is wired.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Base URL of the device RPC endpoint
    pub endpoint: String,
    /// Switch component id on the device
    pub relay_id: u8,
    /// Inverted wiring: scheduled hours switch the relay off instead of on
    /// (required by Nibe/Thermia style heat pump inputs)
    pub inverted: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://192.168.1.40".to_string(),
            relay_id: 0,
            inverted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TariffConfig {
    /// Transmission plan the meter is billed under
    pub provider: Provider,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Vork2,
        }
    }
}

/// Heating plan parameters. Loaded once per cycle and treated as a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatingConfig {
    /// Planning period length in hours; 0 selects whole-day threshold mode
    pub period_hours: u8,
    /// Cheapest hours to activate within each period
    pub hours_per_period: u8,
    /// Keep the relay on for any hour priced below this (EUR/MWh)
    pub always_on_below: f64,
    /// Never heat in an hour priced above this (EUR/MWh)
    pub always_off_above: f64,
    pub forecast: ForecastConfig,
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            period_hours: 24,
            hours_per_period: 10,
            always_on_below: 1.0,
            always_off_above: 300.0,
            forecast: ForecastConfig::default(),
        }
    }
}

/// Weather-forecast-driven heating duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Derive the per-period heating duration from the forecast
    pub enabled: bool,
    /// Shift the heating curve left/right; one step is one hour of heat
    pub curve_shift: i8,
    /// Curve steepness, 0.0 (flat) to 1.0 (steep)
    pub power_factor: f64,
    /// Outdoor temperature above which no heating is needed
    pub baseline_temp: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            curve_shift: 0,
            power_factor: 0.5,
            baseline_temp: 16.0,
        }
    }
}

/// Upstream HTTP data sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Day-ahead market price endpoint (CSV or JSON)
    pub price_url: String,
    /// Market area code appended to the price query
    pub price_region: String,
    /// Hourly apparent-temperature forecast endpoint
    pub forecast_url: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            price_url: "https://dashboard.elering.ee/api/nps/price/csv".to_string(),
            price_region: "ee".to_string(),
            forecast_url: "https://api.open-meteo.com/v1/forecast".to_string(),
            latitude: 59.437,
            longitude: 24.754,
            timeout_secs: 10,
        }
    }
}

/// Control loop timing and the watchdog contact surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between control loop wakes
    pub wake_interval_secs: u64,
    /// Failsafe auto-revert timer duration, minutes
    pub failsafe_minutes: u32,
    /// How many times to poll for a valid device clock before degrading
    pub clock_attempts: u32,
    /// Seconds between clock polls
    pub clock_poll_secs: u64,
    /// Pidfile the watchdog observes for controller liveness
    pub pidfile: PathBuf,
    /// Seconds between watchdog liveness polls
    pub watchdog_poll_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            wake_interval_secs: 300,
            failsafe_minutes: 60,
            clock_attempts: 30,
            clock_poll_secs: 1,
            pidfile: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("spotheat")
                .join("spotheat.pid"),
            watchdog_poll_secs: 5,
        }
    }
}

/// Remote operation pipelining limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Hard ceiling of concurrent RPC calls the transport allows
    pub rpc_ceiling: usize,
    /// Slots kept free for control traffic
    pub reserved_slots: usize,
    /// Milliseconds between queue drain polls
    pub poll_interval_ms: u64,
    /// Dispatch attempts per task before it is dropped
    pub max_attempts: u8,
    /// Device-side schedule slot limit
    pub device_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            rpc_ceiling: 6,
            reserved_slots: 1,
            poll_interval_ms: 1000,
            max_attempts: 3,
            device_capacity: 20,
        }
    }
}

impl DispatchConfig {
    /// Operations allowed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.rpc_ceiling.saturating_sub(self.reserved_slots).max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            device: DeviceConfig::default(),
            tariff: TariffConfig::default(),
            heating: HeatingConfig::default(),
            sources: SourcesConfig::default(),
            daemon: DaemonConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir
                .join(project_name)
                .join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!(
                            "Failed to load config from {}: {}",
                            primary_config.display(),
                            e
                        );
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!(
                        "Failed to load config from {}: {}",
                        fallback_config.display(),
                        e
                    );
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
