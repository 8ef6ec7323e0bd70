use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RED_MAX: u8 = 200;
pub const GREEN_MAX: u8 = 89;
pub const BLUE_MAX: u8 = 94;
pub const WHITE_MAX: u8 = 146;
pub const FAN_MAX: u8 = 255;

pub const GMT_OFFSET_MIN: i8 = -11;
pub const GMT_OFFSET_MAX: i8 = 13;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("invalid time of day `{0}`, expected 24h HH:MM")]
    InvalidTime(String),
    #[error("config i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts `H:MM` or `HH:MM` with hours 0-23, and always prints as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    minutes: u16,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then(|| Self {
            minutes: hour as u16 * 60 + minute as u16,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidTime(raw.to_string());

        let (hour, minute) = raw.split_once(':').ok_or_else(invalid)?;
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(hour) || hour.len() > 2 || !all_digits(minute) || minute.len() != 2 {
            return Err(invalid());
        }

        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }

    pub fn hour(self) -> u8 {
        (self.minutes / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.minutes % 60) as u8
    }

    pub fn seconds_since_midnight(self) -> u32 {
        self.minutes as u32 * 60
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightTimer {
    pub on: TimeOfDay,
    pub off: TimeOfDay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightDuty {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lights {
    pub timer: LightTimer,
    pub duty: LightDuty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanDuty {
    #[serde(rename = "when lights on")]
    pub when_lights_on: u8,
    #[serde(rename = "when lights off")]
    pub when_lights_off: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fan {
    pub duty: FanDuty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeZone {
    #[serde(rename = "GMT offset")]
    pub gmt_offset: i8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub lights: Lights,
    pub fan: Fan,
    #[serde(rename = "time zone")]
    pub time_zone: TimeZone,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lights: Lights {
                timer: LightTimer {
                    on: TimeOfDay { minutes: 7 * 60 },
                    off: TimeOfDay { minutes: 19 * 60 },
                },
                duty: LightDuty {
                    red: 72,
                    green: 60,
                    blue: 44,
                    white: 52,
                },
            },
            fan: Fan {
                duty: FanDuty {
                    when_lights_on: 255,
                    when_lights_off: 128,
                },
            },
            time_zone: TimeZone { gmt_offset: 0 },
        }
    }
}

impl Config {
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let candidate: Config = serde_json::from_value(value)?;
        candidate.validate()?;
        Ok(candidate)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, ConfigError> {
        let candidate: Config = serde_json::from_slice(raw)?;
        candidate.validate()?;
        Ok(candidate)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let duty = &self.lights.duty;
        check_max("lights.duty.red", duty.red, RED_MAX)?;
        check_max("lights.duty.green", duty.green, GREEN_MAX)?;
        check_max("lights.duty.blue", duty.blue, BLUE_MAX)?;
        check_max("lights.duty.white", duty.white, WHITE_MAX)?;

        let offset = self.time_zone.gmt_offset;
        if !(GMT_OFFSET_MIN..=GMT_OFFSET_MAX).contains(&offset) {
            return Err(ConfigError::OutOfRange {
                field: "time_zone.gmt_offset",
                value: offset as i64,
                min: GMT_OFFSET_MIN as i64,
                max: GMT_OFFSET_MAX as i64,
            });
        }

        Ok(())
    }
}

fn check_max(field: &'static str, value: u8, max: u8) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: value as i64,
            min: 0,
            max: max as i64,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCredentials {
    #[serde(rename = "NETWORK_NAME")]
    pub network_name: String,
    #[serde(rename = "NETWORK_PASSWORD")]
    pub network_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub loop_interval_ms: u64,
    pub log_retention: usize,
    pub queue_capacity: usize,
    pub max_jitter_secs: u64,
    pub flush_pacing_ms: u64,
    pub bench_power_threshold_v: f32,
    pub cloud_base_url: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            loop_interval_ms: 2_000,
            log_retention: 30,
            queue_capacity: 48,
            max_jitter_secs: 120,
            flush_pacing_ms: 500,
            bench_power_threshold_v: 18.0,
            cloud_base_url: "http://growingbeyond.earth".to_string(),
        }
    }
}
