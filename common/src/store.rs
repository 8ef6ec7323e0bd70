use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use crate::config::{Config, ConfigError};

#[derive(Debug)]
pub struct ConfigStore {
    config: Config,
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(config: Config, path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            path: path.into(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match fs::read(&path) {
            Ok(raw) => Config::from_slice(&raw).unwrap_or_else(|err| {
                warn!("ignoring invalid config at {}: {err}", path.display());
                Config::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("no config at {}; using defaults", path.display());
                Config::default()
            }
            Err(err) => {
                warn!("failed to read config at {}: {err}", path.display());
                Config::default()
            }
        };
        Self { config, path }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn apply_candidate(&mut self, candidate: serde_json::Value) -> Result<bool, ConfigError> {
        let config = Config::from_value(candidate)?;
        if config == self.config {
            return Ok(false);
        }

        self.config = config;
        info!("accepted new config: {}", summarize(&self.config));
        if let Err(err) = self.save() {
            warn!("failed to persist config to {}: {err}", self.path.display());
        }
        Ok(true)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        write_json(&self.path, &self.config)
    }
}

fn summarize(config: &Config) -> String {
    let duty = &config.lights.duty;
    format!(
        "lights {}-{} rgbw {}/{}/{}/{} fan {}/{} gmt{:+}",
        config.lights.timer.on,
        config.lights.timer.off,
        duty.red,
        duty.green,
        duty.blue,
        duty.white,
        config.fan.duty.when_lights_on,
        config.fan.duty.when_lights_off,
        config.time_zone.gmt_offset,
    )
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(path, payload)?;
    Ok(())
}
