use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::{
    config::Config,
    drivers::{AirReading, PowerReading, SoilReading},
    schedule::DutyLevels,
};

pub const CONSOLE_HEADER: &str =
    "------DATE ----TIME  RED-GRN-BLU-WHT  LED-V---mA-----W  FAN--RPM  -TEMP--HUMI-MOIS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub board_id: String,
    pub mac_address: Option<String>,
    pub firmware_version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudInfo {
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub startup_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Red,
    Green,
    Blue,
    White,
    Volts,
    Milliamps,
    Watts,
    Fan,
    FanRpm,
    Temperature,
    Humidity,
    SoilTemperature,
    SoilMoisture,
}

impl Metric {
    pub const COUNT: usize = 13;

    pub const ALL: [Metric; Metric::COUNT] = [
        Metric::Red,
        Metric::Green,
        Metric::Blue,
        Metric::White,
        Metric::Volts,
        Metric::Milliamps,
        Metric::Watts,
        Metric::Fan,
        Metric::FanRpm,
        Metric::Temperature,
        Metric::Humidity,
        Metric::SoilTemperature,
        Metric::SoilMoisture,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp: NaiveDateTime,
    pub duty: DutyLevels,
    pub power: PowerReading,
    pub fan_rpm: f32,
    pub soil: SoilReading,
    pub air: AirReading,
    pub config: Config,
}

impl StatusSnapshot {
    pub fn watts(&self) -> f32 {
        self.power.milliwatts / 1_000.0
    }

    pub fn metric(&self, metric: Metric) -> f64 {
        let value = match metric {
            Metric::Red => self.duty.red as f32,
            Metric::Green => self.duty.green as f32,
            Metric::Blue => self.duty.blue as f32,
            Metric::White => self.duty.white as f32,
            Metric::Volts => self.power.volts,
            Metric::Milliamps => self.power.milliamps,
            Metric::Watts => self.watts(),
            Metric::Fan => self.duty.fan as f32,
            Metric::FanRpm => self.fan_rpm,
            Metric::Temperature => self.air.temperature_c,
            Metric::Humidity => self.air.humidity,
            Metric::SoilTemperature => self.soil.temperature_c,
            Metric::SoilMoisture => self.soil.moisture,
        };
        value as f64
    }

    pub fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }

    pub fn hour_minute(&self) -> String {
        self.timestamp.format("%H:%M").to_string()
    }

    pub fn console_line(&self) -> String {
        let temperature = if self.air.temperature_c == 0.0 {
            self.soil.temperature_c
        } else {
            self.air.temperature_c
        };
        format!(
            concat!(
                "{}  {:>3} {:>3} {:>3} {:>3}  {:>5.2} {:>4.0} {:>5.2}",
                "  {:>3} {:>4.0}  {:>5.2} {:>5.2} {:>4.0}",
            ),
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.duty.red,
            self.duty.green,
            self.duty.blue,
            self.duty.white,
            self.power.volts,
            self.power.milliamps,
            self.watts(),
            self.duty.fan,
            self.fan_rpm,
            temperature,
            self.air.humidity,
            self.soil.moisture,
        )
    }
}
