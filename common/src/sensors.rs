use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::{
    config::Config,
    drivers::{AirSensor, CurrentSensor, DriverError, SoilSensor},
    schedule::DutyLevels,
    types::{Metric, StatusSnapshot},
};

#[derive(Debug, Default)]
pub struct FanPulseCounter(AtomicU32);

impl FanPulseCounter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn record_pulse(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// The tachometer emits two pulses per revolution.
pub fn fan_rpm(pulses: u32, elapsed_ms: u64) -> f32 {
    if elapsed_ms == 0 {
        return 0.0;
    }
    pulses as f32 / elapsed_ms as f32 * 30_000.0
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HourlyAverage {
    samples: u32,
    values: [f64; Metric::COUNT],
}

impl HourlyAverage {
    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn get(&self, metric: Metric) -> f64 {
        self.values[metric as usize]
    }

    pub fn update(&mut self, snapshot: &StatusSnapshot) {
        self.samples += 1;
        let n = self.samples as f64;
        for metric in Metric::ALL {
            let avg = &mut self.values[metric as usize];
            *avg += (snapshot.metric(metric) - *avg) / n;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct SensorAggregator {
    current: Option<Box<dyn CurrentSensor>>,
    soil: Option<Box<dyn SoilSensor>>,
    air: Option<Box<dyn AirSensor>>,
    fan_pulses: Arc<FanPulseCounter>,
    last_sample_ms: u64,
    average: HourlyAverage,
    warmed_up: bool,
}

impl SensorAggregator {
    pub fn new(
        current: Option<Box<dyn CurrentSensor>>,
        soil: Option<Box<dyn SoilSensor>>,
        air: Option<Box<dyn AirSensor>>,
        fan_pulses: Arc<FanPulseCounter>,
    ) -> Self {
        Self {
            current,
            soil,
            air,
            fan_pulses,
            last_sample_ms: 0,
            average: HourlyAverage::default(),
            warmed_up: false,
        }
    }

    pub fn has_current_sensor(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_first_sample(&self) -> bool {
        !self.warmed_up
    }

    pub fn average(&self) -> &HourlyAverage {
        &self.average
    }

    pub fn sample(
        &mut self,
        timestamp: NaiveDateTime,
        uptime_ms: u64,
        duty: DutyLevels,
        config: &Config,
    ) -> StatusSnapshot {
        let power = self
            .current
            .as_mut()
            .map(|sensor| or_default("current sensor", sensor.read()))
            .unwrap_or_default();
        let soil = self
            .soil
            .as_mut()
            .map(|sensor| or_default("soil sensor", sensor.read()))
            .unwrap_or_default();
        let air = self
            .air
            .as_mut()
            .map(|sensor| or_default("air sensor", sensor.read()))
            .unwrap_or_default();

        let pulses = self.fan_pulses.take();
        let elapsed_ms = uptime_ms.saturating_sub(self.last_sample_ms);
        self.last_sample_ms = uptime_ms;

        StatusSnapshot {
            timestamp,
            duty,
            power,
            fan_rpm: fan_rpm(pulses, elapsed_ms),
            soil,
            air,
            config: config.clone(),
        }
    }

    /// Adds `snapshot` to the hourly average. The very first snapshot after
    /// boot is dropped so the fan speed reading can settle. Returns whether
    /// the snapshot was counted.
    pub fn fold(&mut self, snapshot: &StatusSnapshot) -> bool {
        if !self.warmed_up {
            self.warmed_up = true;
            info!("skipping first sample while fan speed settles");
            return false;
        }
        self.average.update(snapshot);
        true
    }

    pub fn reset_average(&mut self) {
        self.average.reset();
    }
}

fn or_default<T: Default>(label: &str, reading: Result<T, DriverError>) -> T {
    reading.unwrap_or_else(|err| {
        debug!("{label} read failed: {err}");
        T::default()
    })
}
