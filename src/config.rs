use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use dotenv::dotenv;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::ml::{AutoencoderConfig, IsolationForestConfig};
use crate::models::Modality;

/// Default configuration file, read when `SENTINEL_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "sentinel.toml";

/// One value per modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerModality<T> {
    pub sensor: T,
    pub touch_drag: T,
    pub touch_pressure: T,
}

impl<T: Copy> PerModality<T> {
    pub fn uniform(value: T) -> Self {
        PerModality {
            sensor: value,
            touch_drag: value,
            touch_pressure: value,
        }
    }

    pub fn get(&self, modality: Modality) -> T {
        match modality {
            Modality::Sensor => self.sensor,
            Modality::TouchDrag => self.touch_drag,
            Modality::TouchPressure => self.touch_pressure,
        }
    }

    pub fn set(&mut self, modality: Modality, value: T) {
        match modality {
            Modality::Sensor => self.sensor = value,
            Modality::TouchDrag => self.touch_drag = value,
            Modality::TouchPressure => self.touch_pressure = value,
        }
    }
}

/// Density (isolation forest) manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    pub initial_samples: PerModality<usize>,
    pub retrain_interval: usize,
    pub forest: IsolationForestConfig,
    /// Fraction of training decision scores below the threshold
    pub anomaly_percentile: f64,
    pub margin: f64,
}

impl Default for DensityConfig {
    fn default() -> Self {
        DensityConfig {
            initial_samples: PerModality::uniform(1000),
            retrain_interval: 10_000,
            forest: IsolationForestConfig::default(),
            anomaly_percentile: 0.005,
            margin: 0.002,
        }
    }
}

/// Sequence (LSTM autoencoder) manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub initial_samples: PerModality<usize>,
    pub retrain_interval: usize,
    pub seq_len: PerModality<usize>,
    pub network: AutoencoderConfig,
    /// Multiplier on the 1st-percentile training error giving the lower bound
    pub low_multiplier: f64,
    /// Multiplier on the 99th-percentile training error giving the upper bound
    pub high_multiplier: f64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        SequenceConfig {
            initial_samples: PerModality::uniform(1000),
            retrain_interval: 10_000,
            seq_len: PerModality::uniform(20),
            network: AutoencoderConfig::default(),
            low_multiplier: 0.5,
            high_multiplier: 1.5,
        }
    }
}

/// Configuration for the scoring engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model_dir: PathBuf,
    pub log_level: String,
    pub density: DensityConfig,
    pub sequence: SequenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            model_dir: PathBuf::from("models"),
            log_level: "info".to_string(),
            density: DensityConfig::default(),
            sequence: SequenceConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let density = &self.density;
        let sequence = &self.sequence;

        if !(density.forest.contamination > 0.0 && density.forest.contamination <= 0.5) {
            bail!("contamination must be in (0, 0.5], got {}", density.forest.contamination);
        }
        if density.forest.n_estimators == 0 || density.forest.max_samples == 0 {
            bail!("n_estimators and max_samples must be positive");
        }
        if !(0.0..=1.0).contains(&density.anomaly_percentile) {
            bail!("anomaly_percentile must be in [0, 1], got {}", density.anomaly_percentile);
        }
        if !density.margin.is_finite() {
            bail!("margin must be finite");
        }
        if sequence.network.hidden_dim == 0 || sequence.network.latent_dim == 0 || sequence.network.batch_size == 0 {
            bail!("hidden_dim, latent_dim and batch_size must be positive");
        }
        if !(sequence.network.learning_rate > 0.0 && sequence.network.learning_rate.is_finite()) {
            bail!("learning_rate must be positive, got {}", sequence.network.learning_rate);
        }
        if !(sequence.low_multiplier >= 0.0 && sequence.high_multiplier.is_finite()) {
            bail!("band multipliers must be finite and non-negative");
        }

        for modality in Modality::ALL {
            if density.initial_samples.get(modality) == 0 || sequence.initial_samples.get(modality) == 0 {
                bail!("initial_samples for {} must be positive", modality);
            }
            if sequence.seq_len.get(modality) < 2 {
                bail!("seq_len for {} must be at least 2", modality);
            }
        }
        if density.retrain_interval == 0 || sequence.retrain_interval == 0 {
            bail!("retrain_interval must be positive");
        }

        Ok(())
    }
}

/// Load configuration: defaults, then the TOML file, then `.env` and process environment
pub fn load_config() -> Result<Config> {
    // Load .env file if it exists
    dotenv().ok();

    let mut config = Config::default();

    let (path, explicit) = match env::var("SENTINEL_CONFIG") {
        Ok(path) => (PathBuf::from(path), true),
        Err(_) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    if path.exists() {
        config = load_from_file(&path)?;
        info!("Loaded configuration from {}", path.display());
    } else if explicit {
        bail!("Configuration file not found: {}", path.display());
    } else {
        debug!("No configuration file at {}, using defaults", path.display());
    }

    apply_env_overrides(&mut config, env::vars());
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

/// Load configuration from a TOML file; missing keys keep their defaults
pub fn load_from_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse configuration file {}", path.display()))?;
    Ok(config)
}

/// Apply `KEY=value` overrides; unparseable values are logged and skipped
pub fn apply_env_overrides<I>(config: &mut Config, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let value = value.trim();
        match key.as_str() {
            "MODEL_DIR" => config.model_dir = PathBuf::from(value),
            "LOG_LEVEL" => config.log_level = value.to_string(),
            "RETRAIN_INTERVAL" => {
                if let Some(interval) = parse(&key, value) {
                    config.density.retrain_interval = interval;
                    config.sequence.retrain_interval = interval;
                }
            }
            "DENSITY_RETRAIN_INTERVAL" => {
                if let Some(interval) = parse(&key, value) {
                    config.density.retrain_interval = interval;
                }
            }
            "SEQUENCE_RETRAIN_INTERVAL" => {
                if let Some(interval) = parse(&key, value) {
                    config.sequence.retrain_interval = interval;
                }
            }
            "N_ESTIMATORS" => {
                if let Some(n) = parse(&key, value) {
                    config.density.forest.n_estimators = n;
                }
            }
            "CONTAMINATION" => {
                if let Some(c) = parse(&key, value) {
                    config.density.forest.contamination = c;
                }
            }
            "ANOMALY_PERCENTILE" => {
                if let Some(p) = parse(&key, value) {
                    config.density.anomaly_percentile = p;
                }
            }
            "MARGIN" => {
                if let Some(m) = parse(&key, value) {
                    config.density.margin = m;
                }
            }
            "EPOCHS" => {
                if let Some(e) = parse(&key, value) {
                    config.sequence.network.epochs = e;
                }
            }
            "LEARNING_RATE" => {
                if let Some(lr) = parse(&key, value) {
                    config.sequence.network.learning_rate = lr;
                }
            }
            "HIDDEN_DIM" => {
                if let Some(h) = parse(&key, value) {
                    config.sequence.network.hidden_dim = h;
                }
            }
            "LATENT_DIM" => {
                if let Some(l) = parse(&key, value) {
                    config.sequence.network.latent_dim = l;
                }
            }
            "BATCH_SIZE" => {
                if let Some(b) = parse(&key, value) {
                    config.sequence.network.batch_size = b;
                }
            }
            "SEED" => {
                if let Some(seed) = parse(&key, value) {
                    config.density.forest.seed = seed;
                    config.sequence.network.seed = seed;
                }
            }
            _ => {
                if let Some(suffix) = key.strip_prefix("INITIAL_SAMPLES_") {
                    if let (Some(modality), Some(n)) = (modality_suffix(suffix), parse(&key, value)) {
                        config.density.initial_samples.set(modality, n);
                        config.sequence.initial_samples.set(modality, n);
                    }
                } else if let Some(suffix) = key.strip_prefix("SEQ_LEN_") {
                    if let (Some(modality), Some(n)) = (modality_suffix(suffix), parse(&key, value)) {
                        config.sequence.seq_len.set(modality, n);
                    }
                }
            }
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring {}: cannot parse {:?}", key, value);
            None
        }
    }
}

fn modality_suffix(suffix: &str) -> Option<Modality> {
    suffix.to_lowercase().parse().ok()
}
