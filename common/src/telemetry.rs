use std::{collections::VecDeque, thread, time::Duration};

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::{
    drivers::Uplink,
    sensors::HourlyAverage,
    store::ConfigStore,
    types::{CloudInfo, DeviceIdentity, Metric, StatusSnapshot},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub trigger_time: NaiveDateTime,
    pub attempted: bool,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub remaining: usize,
    pub config_changed: bool,
}

#[derive(Debug)]
pub struct TelemetryQueue {
    records: VecDeque<TelemetryRecord>,
    capacity: usize,
    pacing: Duration,
}

impl TelemetryQueue {
    pub fn new(capacity: usize, pacing: Duration) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity + 1),
            capacity,
            pacing,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.records.iter()
    }

    pub fn enqueue(&mut self, now: NaiveDateTime, payload: String, jitter_secs: i64) {
        self.records.push_back(TelemetryRecord {
            trigger_time: now + chrono::Duration::seconds(jitter_secs),
            attempted: false,
            payload,
        });
        while self.records.len() > self.capacity {
            if let Some(dropped) = self.records.pop_front() {
                debug!("telemetry backlog full; dropped record due {}", dropped.trigger_time);
            }
        }
    }

    /// The newest record's trigger has passed and it has not been tried.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.records
            .back()
            .map(|record| !record.attempted && record.trigger_time < now)
            .unwrap_or(false)
    }

    pub fn flush(&mut self, uplink: &mut dyn Uplink, store: &mut ConfigStore) -> FlushReport {
        let mut report = FlushReport::default();
        if let Some(newest) = self.records.back_mut() {
            newest.attempted = true;
        }

        while let Some(record) = self.records.front() {
            let request = format!("log.php?{}", record.payload);
            match uplink.get(&request) {
                Ok(body) => {
                    self.records.pop_front();
                    report.delivered += 1;
                    report.config_changed |= apply_response(&body, store);
                    if !self.records.is_empty() && !self.pacing.is_zero() {
                        thread::sleep(self.pacing);
                    }
                }
                Err(err) => {
                    warn!(
                        "telemetry upload failed after {} record(s): {err}",
                        report.delivered
                    );
                    break;
                }
            }
        }

        report.remaining = self.records.len();
        if report.remaining == 0 {
            info!("uploaded {} telemetry record(s)", report.delivered);
        }
        report
    }
}

fn apply_response(body: &str, store: &mut ConfigStore) -> bool {
    let value = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value,
        Err(err) => {
            debug!("telemetry response is not JSON: {err}");
            return false;
        }
    };
    match store.apply_candidate(value) {
        Ok(changed) => changed,
        Err(err) => {
            info!("ignoring config from server: {err}");
            false
        }
    }
}

fn whole(value: f64) -> i64 {
    value.round() as i64
}

pub fn hourly_query(
    identity: &DeviceIdentity,
    snapshot: &StatusSnapshot,
    average: &HourlyAverage,
) -> String {
    let config = &snapshot.config;
    let duty = &config.lights.duty;
    format!(
        "boa={}&sof={}&dat={}&tim={}&red={}&gre={}&blu={}&whi={}&vol={:.2}&mam={}&wat={:.2}\
         &fan={}&rpm={}&tem={:.2}&hum={:.2}&sst={:.2}&ssm={}&con={}&cof={}&cf0={}&cf1={}\
         &cre={}&cgr={}&cbl={}&cwh={}&ctz={}",
        identity.board_id,
        identity.firmware_version,
        snapshot.date(),
        snapshot.hour_minute(),
        whole(average.get(Metric::Red)),
        whole(average.get(Metric::Green)),
        whole(average.get(Metric::Blue)),
        whole(average.get(Metric::White)),
        average.get(Metric::Volts),
        whole(average.get(Metric::Milliamps)),
        average.get(Metric::Watts),
        whole(average.get(Metric::Fan)),
        whole(average.get(Metric::FanRpm)),
        average.get(Metric::Temperature),
        average.get(Metric::Humidity),
        average.get(Metric::SoilTemperature),
        whole(average.get(Metric::SoilMoisture)),
        config.lights.timer.on,
        config.lights.timer.off,
        config.fan.duty.when_lights_off,
        config.fan.duty.when_lights_on,
        duty.red,
        duty.green,
        duty.blue,
        duty.white,
        config.time_zone.gmt_offset,
    )
}

pub fn discover(uplink: &mut dyn Uplink, identity: &DeviceIdentity) -> Option<CloudInfo> {
    if !uplink.is_connected() {
        return None;
    }
    let request = format!(
        "phonehome.php?boa={}&mac={}&sof={}",
        identity.board_id,
        identity.mac_address.as_deref().unwrap_or(""),
        identity.firmware_version
    );
    match uplink.get(&request) {
        Ok(body) => match serde_json::from_str::<CloudInfo>(&body) {
            Ok(info) => {
                info!("connected to cloud service");
                Some(info)
            }
            Err(err) => {
                warn!("unexpected check-in response: {err}");
                None
            }
        },
        Err(err) => {
            warn!("unable to reach cloud service: {err}");
            None
        }
    }
}
