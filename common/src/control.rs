use std::{
    path::Path,
    sync::Arc,
    thread,
    time::Duration,
};

use chrono::{NaiveDateTime, Timelike};
use rand::{rngs::StdRng, Rng};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::{Config, ControllerSettings},
    drivers::{
        AirSensor, CurrentSensor, DriverError, HardwareClock, NetworkTime, PwmBank, SoilSensor,
        SystemClock, Uplink,
    },
    hourly_log::HourlyLog,
    schedule::ActuatorController,
    sensors::{FanPulseCounter, HourlyAverage, SensorAggregator},
    store::ConfigStore,
    telemetry::{discover, hourly_query, TelemetryQueue},
    time_source::{SyncState, TimeSource},
    types::{DeviceIdentity, StatusSnapshot, CONSOLE_HEADER},
};

pub const CONFIG_FILE: &str = "config/gbe_settings.json";
pub const NETWORK_FILE: &str = "config/wifi_settings.json";
pub const LOG_DIR: &str = "logs";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no usable clock: {0}")]
    Clock(#[source] DriverError),
    #[error("failed to drive outputs: {0}")]
    Actuator(#[source] DriverError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Supply voltage at boot was too low for the LED panel. Terminal.
    HaltedOnBenchPower,
}

pub struct Drivers {
    pub clock: Box<dyn SystemClock>,
    pub rtc: Option<Box<dyn HardwareClock>>,
    pub ntp: Box<dyn NetworkTime>,
    pub uplink: Box<dyn Uplink>,
    pub pwm: Box<dyn PwmBank>,
    pub current: Option<Box<dyn CurrentSensor>>,
    pub soil: Option<Box<dyn SoilSensor>>,
    pub air: Option<Box<dyn AirSensor>>,
    pub fan_pulses: Arc<FanPulseCounter>,
}

pub struct ControlLoop {
    identity: DeviceIdentity,
    settings: ControllerSettings,
    store: ConfigStore,
    time: TimeSource,
    actuator: ActuatorController,
    sensors: SensorAggregator,
    queue: TelemetryQueue,
    log: HourlyLog,
    uplink: Box<dyn Uplink>,
    rng: StdRng,
    log_hour: Option<u32>,
}

impl ControlLoop {
    pub fn start(
        identity: DeviceIdentity,
        settings: ControllerSettings,
        data_dir: &Path,
        drivers: Drivers,
        rng: StdRng,
    ) -> Self {
        let mut actuator = ActuatorController::new(drivers.pwm);
        if let Err(err) = actuator.lights_off() {
            warn!("failed to clear lights at boot: {err}");
        }

        let store = ConfigStore::load(data_dir.join(CONFIG_FILE));
        let log = HourlyLog::new(data_dir.join(LOG_DIR), settings.log_retention);
        let queue = TelemetryQueue::new(
            settings.queue_capacity,
            Duration::from_millis(settings.flush_pacing_ms),
        );
        let sensors =
            SensorAggregator::new(drivers.current, drivers.soil, drivers.air, drivers.fan_pulses);
        let mut time = TimeSource::new(drivers.clock, drivers.rtc, drivers.ntp);
        let mut uplink = drivers.uplink;

        let connected = uplink.is_connected();
        time.synchronize(connected, store.config().time_zone.gmt_offset);

        let cloud = discover(uplink.as_mut(), &identity).unwrap_or_default();
        info!(
            "device name: {}",
            cloud.site_name.as_deref().unwrap_or("unregistered")
        );
        info!("hardware id: {}", identity.board_id);
        if let Some(mac) = &identity.mac_address {
            info!("mac address: {mac}");
        }
        info!("firmware: {}", identity.firmware_version);
        if let Some(message) = cloud.startup_message.as_deref() {
            info!("{message}");
        }

        let log_hour = time.now().ok().map(|now| now.hour());

        Self {
            identity,
            settings,
            store,
            time,
            actuator,
            sensors,
            queue,
            log,
            uplink,
            rng,
            log_hour,
        }
    }

    pub fn config(&self) -> &Config {
        self.store.config()
    }

    pub fn sync_state(&self) -> SyncState {
        self.time.state()
    }

    pub fn average(&self) -> &HourlyAverage {
        self.sensors.average()
    }

    pub fn queue(&self) -> &TelemetryQueue {
        &self.queue
    }

    pub fn step(&mut self) -> Result<LoopState, ControlError> {
        let now = self.time.now().map_err(ControlError::Clock)?;
        let config = self.store.config().clone();
        let duty = self
            .actuator
            .apply(now.time(), &config)
            .map_err(ControlError::Actuator)?;

        let snapshot = self
            .sensors
            .sample(now, self.time.uptime_ms(), duty, &config);
        info!(target: "status", "{}", snapshot.console_line());

        if self.sensors.is_first_sample() && self.on_bench_power(&snapshot) {
            warn!(
                "supply at {:.2} V is below {:.1} V; assuming bench power and halting",
                snapshot.power.volts, self.settings.bench_power_threshold_v
            );
            if let Err(err) = self.actuator.lights_off() {
                warn!("failed to clear lights: {err}");
            }
            return Ok(LoopState::HaltedOnBenchPower);
        }
        self.sensors.fold(&snapshot);

        match self.log_hour {
            None => self.log_hour = Some(now.hour()),
            Some(hour) if hour != now.hour() => self.close_hour(now, &snapshot),
            Some(_) => {}
        }

        if self.queue.is_due(now) && self.uplink.is_connected() {
            let report = self.queue.flush(self.uplink.as_mut(), &mut self.store);
            if report.remaining > 0 {
                info!("{} telemetry record(s) still queued", report.remaining);
            }
        }

        Ok(LoopState::Running)
    }

    pub fn run(&mut self) {
        let interval = Duration::from_millis(self.settings.loop_interval_ms);
        info!(target: "status", "{CONSOLE_HEADER}");
        loop {
            match self.step() {
                Ok(LoopState::Running) => {}
                Ok(LoopState::HaltedOnBenchPower) => return,
                Err(err) => warn!("control loop iteration failed, retrying: {err}"),
            }
            thread::sleep(interval);
        }
    }

    fn on_bench_power(&self, snapshot: &StatusSnapshot) -> bool {
        self.sensors.has_current_sensor()
            && snapshot.power.volts < self.settings.bench_power_threshold_v
    }

    fn close_hour(&mut self, now: NaiveDateTime, snapshot: &StatusSnapshot) {
        self.log_hour = Some(now.hour());

        let average = self.sensors.average();
        if let Err(err) = self.log.append(snapshot, average) {
            warn!("failed to write hourly log: {err}");
        }
        let payload = hourly_query(&self.identity, snapshot, average);
        let jitter = self.rng.gen_range(0..=self.settings.max_jitter_secs) as i64;
        self.queue.enqueue(now, payload, jitter);

        if let Err(err) = self.log.prune() {
            warn!("failed to prune log directory: {err}");
        }
        self.sensors.reset_average();

        let connected = self.uplink.is_connected();
        self.time
            .hourly_maintenance(connected, self.store.config().time_zone.gmt_offset);
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    use super::*;
    use crate::{
        drivers::{Channel, PowerReading},
        hourly_log::HEADER,
        testing::{at, scratch_dir, FakeClock, FakeNtp, FakePwm, FakeRtc, FakeUplink, Scripted},
    };

    struct Rig {
        clock: FakeClock,
        rtc: FakeRtc,
        uplink: FakeUplink,
        pwm: FakePwm,
        dir: PathBuf,
    }

    impl Rig {
        fn new(name: &str, now: NaiveDateTime) -> Self {
            Self {
                clock: FakeClock::at(now),
                rtc: FakeRtc::default(),
                uplink: FakeUplink::default(),
                pwm: FakePwm::default(),
                dir: scratch_dir(name),
            }
        }

        fn start(&self, current: Option<Vec<f32>>) -> ControlLoop {
            let current = current.map(|volts| {
                let readings = volts
                    .into_iter()
                    .map(|volts| {
                        Ok(PowerReading {
                            volts,
                            milliamps: 500.0,
                            milliwatts: volts * 500.0,
                        })
                    })
                    .collect();
                Box::new(Scripted::new(readings)) as Box<dyn CurrentSensor>
            });
            let drivers = Drivers {
                clock: Box::new(self.clock.clone()),
                rtc: Some(Box::new(self.rtc.clone())),
                ntp: Box::new(FakeNtp::unreachable()),
                uplink: Box::new(self.uplink.clone()),
                pwm: Box::new(self.pwm.clone()),
                current,
                soil: None,
                air: None,
                fan_pulses: Arc::new(FanPulseCounter::new()),
            };
            let identity = DeviceIdentity {
                board_id: "e6614c311b2e5c2f".into(),
                mac_address: None,
                firmware_version: "0.1.0".into(),
            };
            ControlLoop::start(
                identity,
                ControllerSettings {
                    flush_pacing_ms: 0,
                    ..ControllerSettings::default()
                },
                &self.dir,
                drivers,
                StdRng::seed_from_u64(7),
            )
        }
    }

    #[test]
    fn low_supply_on_first_sample_halts_with_lights_off() {
        let rig = Rig::new("control-bench", at(2024, 4, 1, 12, 0, 0));
        let mut control = rig.start(Some(vec![12.0]));

        assert_eq!(control.step().unwrap(), LoopState::HaltedOnBenchPower);
        for channel in [Channel::Red, Channel::Green, Channel::Blue, Channel::White] {
            assert_eq!(rig.pwm.duty(channel), 0);
        }
    }

    #[test]
    fn bench_check_only_applies_at_boot() {
        let rig = Rig::new("control-bench-once", at(2024, 4, 1, 12, 0, 0));
        let mut control = rig.start(Some(vec![24.0, 11.0]));

        assert_eq!(control.step().unwrap(), LoopState::Running);
        rig.clock.advance_secs(2);
        assert_eq!(control.step().unwrap(), LoopState::Running);
        assert_eq!(rig.pwm.duty(Channel::Red), 72 * 256);
    }

    #[test]
    fn unsynced_clock_still_produces_snapshots() {
        let rig = Rig::new("control-unsynced", at(2000, 1, 1, 12, 0, 0));
        rig.uplink.0.lock().unwrap().connected = true;
        let mut control = rig.start(None);
        assert_eq!(control.sync_state(), SyncState::Unsynced);

        for _ in 0..3 {
            assert_eq!(control.step().unwrap(), LoopState::Running);
            rig.clock.advance_secs(2);
        }

        assert_eq!(control.average().samples(), 2);
    }

    #[test]
    fn hour_boundary_logs_enqueues_and_later_flushes() {
        let rig = Rig::new("control-hour", at(2024, 4, 1, 9, 59, 58));
        let mut control = rig.start(None);

        control.step().unwrap();
        rig.clock.advance_secs(2);
        control.step().unwrap();

        let contents = fs::read_to_string(rig.dir.join("logs/2024-04-01.txt")).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("2024-04-01\t10:00\t72\t60\t44\t52\t"));
        assert_eq!(control.queue().len(), 1);
        assert_eq!(control.average().samples(), 0);

        rig.uplink.0.lock().unwrap().connected = true;
        rig.uplink.push_response(Ok("OK"));
        rig.clock.advance_secs(121);
        control.step().unwrap();

        assert!(control.queue().is_empty());
        let requests = rig.uplink.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0]
            .starts_with("log.php?boa=e6614c311b2e5c2f&sof=0.1.0&dat=2024-04-01&tim=10:00&"));
    }

    #[test]
    fn clock_recovering_mid_hour_waits_for_the_next_boundary() {
        let rig = Rig::new("control-clock-late", at(2024, 4, 1, 9, 10, 0));
        rig.clock.0.lock().unwrap().fail_reads = true;
        let mut control = rig.start(None);
        assert!(matches!(control.step(), Err(ControlError::Clock(_))));

        rig.clock.0.lock().unwrap().fail_reads = false;
        assert_eq!(control.step().unwrap(), LoopState::Running);
        assert!(control.queue().is_empty());
        assert!(!rig.dir.join("logs/2024-04-01.txt").exists());

        rig.clock.advance_secs(50 * 60);
        control.step().unwrap();

        assert_eq!(control.queue().len(), 1);
        let contents = fs::read_to_string(rig.dir.join("logs/2024-04-01.txt")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn each_record_triggers_within_two_minutes_of_its_hour() {
        let rig = Rig::new("control-jitter", at(2024, 4, 1, 9, 59, 58));
        let mut control = rig.start(None);
        control.step().unwrap();
        rig.clock.advance_secs(2);

        let mut boundaries = Vec::new();
        for _ in 0..5 {
            boundaries.push(rig.clock.0.lock().unwrap().now.unwrap());
            control.step().unwrap();
            rig.clock.advance_secs(3_600);
        }

        assert_eq!(control.queue().len(), boundaries.len());
        for (record, boundary) in control.queue().records().zip(boundaries) {
            let delay = (record.trigger_time - boundary).num_seconds();
            assert!((0..=120).contains(&delay), "trigger {delay}s after {boundary}");
        }
    }

    #[test]
    fn backlog_waits_offline_and_flushes_once_link_returns() {
        let rig = Rig::new("control-gate", at(2024, 4, 1, 9, 59, 58));
        let mut control = rig.start(None);
        control.step().unwrap();
        rig.clock.advance_secs(2);
        control.step().unwrap();

        rig.clock.advance_secs(200);
        control.step().unwrap();
        assert!(rig.uplink.requests().is_empty());
        assert_eq!(control.queue().len(), 1);

        rig.uplink.0.lock().unwrap().connected = true;
        rig.uplink.push_response(Ok("OK"));
        rig.clock.advance_secs(2);
        control.step().unwrap();

        assert!(control.queue().is_empty());
        assert_eq!(rig.uplink.requests().len(), 1);
    }

    #[test]
    fn hardware_clock_is_rewritten_at_each_hour_boundary() {
        let rig = Rig::new("control-rtc", at(2024, 4, 1, 9, 59, 58));
        let mut control = rig.start(None);
        let writes = || rig.rtc.0.lock().unwrap().writes.clone();
        assert_eq!(writes().len(), 1);

        control.step().unwrap();
        assert_eq!(writes().len(), 1);

        rig.clock.advance_secs(2);
        control.step().unwrap();
        assert_eq!(writes(), vec![at(2024, 4, 1, 9, 59, 58), at(2024, 4, 1, 10, 0, 0)]);

        rig.clock.advance_secs(2);
        control.step().unwrap();
        assert_eq!(writes().len(), 2);

        rig.clock.advance_secs(3_598);
        control.step().unwrap();
        assert_eq!(writes().last(), Some(&at(2024, 4, 1, 11, 0, 0)));
        assert_eq!(writes().len(), 3);
    }

    #[test]
    fn actuator_fault_is_reported_then_recovers() {
        let rig = Rig::new("control-pwm", at(2024, 4, 1, 8, 0, 0));
        let mut control = rig.start(None);

        rig.pwm.0.lock().unwrap().fail = true;
        assert!(matches!(control.step(), Err(ControlError::Actuator(_))));

        rig.pwm.0.lock().unwrap().fail = false;
        assert_eq!(control.step().unwrap(), LoopState::Running);
        assert_eq!(rig.pwm.duty(Channel::Fan), 255 * 256);
    }

    #[test]
    fn stored_schedule_is_loaded_at_boot() {
        let rig = Rig::new("control-config", at(2024, 4, 1, 8, 0, 0));
        let mut config = Config::default();
        config.lights.duty.red = 10;
        crate::store::write_json(&rig.dir.join(CONFIG_FILE), &config).unwrap();

        let mut control = rig.start(None);
        control.step().unwrap();

        assert_eq!(control.config().lights.duty.red, 10);
        assert_eq!(rig.pwm.duty(Channel::Red), 10 * 256);
    }
}
