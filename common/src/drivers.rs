use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("device not present")]
    NotPresent,
    #[error("bus error: {0}")]
    Bus(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("clock error: {0}")]
    Clock(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red,
    Green,
    Blue,
    White,
    Fan,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Red,
        Channel::Green,
        Channel::Blue,
        Channel::White,
        Channel::Fan,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
            Self::White => "white",
            Self::Fan => "fan",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerReading {
    pub volts: f32,
    pub milliamps: f32,
    pub milliwatts: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SoilReading {
    pub moisture: f32,
    pub temperature_c: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AirReading {
    pub temperature_c: f32,
    pub humidity: f32,
}

/// The MCU's own wall clock. Holds local time, not UTC.
pub trait SystemClock {
    fn now(&self) -> Result<NaiveDateTime, DriverError>;
    fn set(&mut self, local: NaiveDateTime) -> Result<(), DriverError>;
    fn uptime_ms(&self) -> u64;
}

pub trait HardwareClock {
    fn read(&mut self) -> Result<NaiveDateTime, DriverError>;
    fn write(&mut self, local: NaiveDateTime) -> Result<(), DriverError>;
}

pub trait NetworkTime {
    fn fetch_utc(&mut self) -> Result<DateTime<Utc>, DriverError>;
}

pub trait Uplink {
    fn is_connected(&mut self) -> bool;
    fn get(&mut self, path_and_query: &str) -> Result<String, DriverError>;
}

pub trait CurrentSensor {
    fn read(&mut self) -> Result<PowerReading, DriverError>;
}

pub trait SoilSensor {
    fn read(&mut self) -> Result<SoilReading, DriverError>;
}

pub trait AirSensor {
    fn read(&mut self) -> Result<AirReading, DriverError>;
}

pub trait PwmBank {
    /// `duty` spans the full 16-bit range of the peripheral.
    fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<(), DriverError>;
}
