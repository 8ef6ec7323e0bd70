use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::drivers::{
    AirReading, AirSensor, Channel, CurrentSensor, DriverError, HardwareClock, NetworkTime,
    PowerReading, PwmBank, SoilReading, SoilSensor, SystemClock, Uplink,
};

pub fn scratch_dir(name: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "growbox-{name}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(hour, minute, second)
        .unwrap()
}

#[derive(Debug, Default)]
pub struct ClockState {
    pub now: Option<NaiveDateTime>,
    pub uptime_ms: u64,
    pub fail_reads: bool,
    pub fail_sets: bool,
    pub sets: Vec<NaiveDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeClock(pub Arc<Mutex<ClockState>>);

impl FakeClock {
    pub fn at(now: NaiveDateTime) -> Self {
        let clock = Self::default();
        clock.0.lock().unwrap().now = Some(now);
        clock
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut state = self.0.lock().unwrap();
        state.now = state.now.map(|now| now + chrono::Duration::seconds(secs));
        state.uptime_ms += secs as u64 * 1_000;
    }
}

impl SystemClock for FakeClock {
    fn now(&self) -> Result<NaiveDateTime, DriverError> {
        let state = self.0.lock().unwrap();
        if state.fail_reads {
            return Err(DriverError::Clock("internal clock stopped".into()));
        }
        state
            .now
            .ok_or_else(|| DriverError::Clock("internal clock unset".into()))
    }

    fn set(&mut self, local: NaiveDateTime) -> Result<(), DriverError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_sets {
            return Err(DriverError::Clock("internal clock rejected value".into()));
        }
        state.now = Some(local);
        state.sets.push(local);
        Ok(())
    }

    fn uptime_ms(&self) -> u64 {
        self.0.lock().unwrap().uptime_ms
    }
}

#[derive(Debug, Default)]
pub struct RtcState {
    pub value: Option<NaiveDateTime>,
    pub fail: bool,
    pub writes: Vec<NaiveDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeRtc(pub Arc<Mutex<RtcState>>);

impl FakeRtc {
    pub fn holding(value: NaiveDateTime) -> Self {
        let rtc = Self::default();
        rtc.0.lock().unwrap().value = Some(value);
        rtc
    }

    pub fn failing() -> Self {
        let rtc = Self::default();
        rtc.0.lock().unwrap().fail = true;
        rtc
    }
}

impl HardwareClock for FakeRtc {
    fn read(&mut self) -> Result<NaiveDateTime, DriverError> {
        let state = self.0.lock().unwrap();
        if state.fail {
            return Err(DriverError::Bus("rtc nack".into()));
        }
        state.value.ok_or(DriverError::NotPresent)
    }

    fn write(&mut self, local: NaiveDateTime) -> Result<(), DriverError> {
        let mut state = self.0.lock().unwrap();
        if state.fail {
            return Err(DriverError::Bus("rtc nack".into()));
        }
        state.value = Some(local);
        state.writes.push(local);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeNtp(pub Arc<Mutex<Option<DateTime<Utc>>>>);

impl FakeNtp {
    pub fn serving(utc: NaiveDateTime) -> Self {
        Self(Arc::new(Mutex::new(Some(utc.and_utc()))))
    }

    pub fn unreachable() -> Self {
        Self::default()
    }
}

impl NetworkTime for FakeNtp {
    fn fetch_utc(&mut self) -> Result<DateTime<Utc>, DriverError> {
        self.0
            .lock()
            .unwrap()
            .ok_or_else(|| DriverError::Transport("ntp timeout".into()))
    }
}

#[derive(Debug, Default)]
pub struct UplinkState {
    pub connected: bool,
    pub responses: VecDeque<Result<String, DriverError>>,
    pub requests: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeUplink(pub Arc<Mutex<UplinkState>>);

impl FakeUplink {
    pub fn connected() -> Self {
        let uplink = Self::default();
        uplink.0.lock().unwrap().connected = true;
        uplink
    }

    pub fn push_response(&self, response: Result<&str, DriverError>) {
        self.0
            .lock()
            .unwrap()
            .responses
            .push_back(response.map(str::to_string));
    }

    pub fn requests(&self) -> Vec<String> {
        self.0.lock().unwrap().requests.clone()
    }
}

impl Uplink for FakeUplink {
    fn is_connected(&mut self) -> bool {
        self.0.lock().unwrap().connected
    }

    fn get(&mut self, path_and_query: &str) -> Result<String, DriverError> {
        let mut state = self.0.lock().unwrap();
        state.requests.push(path_and_query.to_string());
        state
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(DriverError::Transport("connection refused".into())))
    }
}

#[derive(Debug, Default)]
pub struct PwmState {
    pub duties: [u16; 5],
    pub fail: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakePwm(pub Arc<Mutex<PwmState>>);

impl FakePwm {
    pub fn duty(&self, channel: Channel) -> u16 {
        self.0.lock().unwrap().duties[channel as usize]
    }
}

impl PwmBank for FakePwm {
    fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<(), DriverError> {
        let mut state = self.0.lock().unwrap();
        if state.fail {
            return Err(DriverError::Bus("pwm peripheral fault".into()));
        }
        state.duties[channel as usize] = duty;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Scripted<T>(pub Arc<Mutex<VecDeque<Result<T, DriverError>>>>);

impl<T: Clone> Scripted<T> {
    pub fn new(readings: Vec<Result<T, DriverError>>) -> Self {
        Self(Arc::new(Mutex::new(readings.into())))
    }

    pub fn steady(reading: T) -> Self {
        Self::new(vec![Ok(reading)])
    }

    fn next(&self) -> Result<T, DriverError> {
        let mut queue = self.0.lock().unwrap();
        match queue.len() {
            0 => Err(DriverError::NotPresent),
            1 => queue[0].clone(),
            _ => queue.pop_front().unwrap(),
        }
    }
}

impl CurrentSensor for Scripted<PowerReading> {
    fn read(&mut self) -> Result<PowerReading, DriverError> {
        self.next()
    }
}

impl SoilSensor for Scripted<SoilReading> {
    fn read(&mut self) -> Result<SoilReading, DriverError> {
        self.next()
    }
}

impl AirSensor for Scripted<AirReading> {
    fn read(&mut self) -> Result<AirReading, DriverError> {
        self.next()
    }
}
