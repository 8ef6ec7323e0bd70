use chrono::{Datelike, Duration, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::drivers::{DriverError, HardwareClock, NetworkTime, SystemClock};

/// Clock readings from this year or earlier mean the clock was never set.
pub const MIN_PLAUSIBLE_YEAR: i32 = 2021;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    RtcOnly,
    NtpSynced,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsynced => "UNSYNCED",
            Self::RtcOnly => "RTC_ONLY",
            Self::NtpSynced => "NTP_SYNCED",
        }
    }
}

pub fn is_plausible(time: NaiveDateTime) -> bool {
    time.year() > MIN_PLAUSIBLE_YEAR
}

pub struct TimeSource {
    clock: Box<dyn SystemClock>,
    rtc: Option<Box<dyn HardwareClock>>,
    ntp: Box<dyn NetworkTime>,
    state: SyncState,
    last_known: Option<NaiveDateTime>,
}

impl TimeSource {
    pub fn new(
        clock: Box<dyn SystemClock>,
        rtc: Option<Box<dyn HardwareClock>>,
        ntp: Box<dyn NetworkTime>,
    ) -> Self {
        Self {
            clock,
            rtc,
            ntp,
            state: SyncState::Unsynced,
            last_known: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn synchronize(&mut self, connected: bool, gmt_offset: i8) -> SyncState {
        let mut best = None;

        if let Some(rtc) = self.rtc.as_mut() {
            match rtc.read() {
                Ok(time) if is_plausible(time) => {
                    info!("hardware clock reads {time}");
                    best = Some(time);
                    self.state = SyncState::RtcOnly;
                }
                Ok(time) => warn!("hardware clock holds implausible time {time}"),
                Err(err) => warn!("hardware clock unavailable: {err}"),
            }
        } else {
            debug!("no hardware clock attached");
        }

        if best.is_none() {
            match self.clock.now() {
                Ok(time) if is_plausible(time) => {
                    info!("internal clock already set to {time}");
                    best = Some(time);
                }
                Ok(time) => warn!("internal clock not set ({time})"),
                Err(err) => warn!("internal clock unreadable: {err}"),
            }
        }

        if connected {
            if let Some(local) = self.fetch_network_local(gmt_offset) {
                best = Some(local);
                self.state = SyncState::NtpSynced;
            }
        } else {
            info!("network unavailable; skipping network time");
        }

        if let Some(time) = best {
            match self.clock.set(time) {
                Ok(()) => self.last_known = Some(time),
                Err(err) => warn!("failed to set internal clock: {err}"),
            }
        }
        self.push_to_hardware_clock();

        info!("clock state {}", self.state.as_str());
        self.state
    }

    pub fn hourly_maintenance(&mut self, connected: bool, gmt_offset: i8) {
        if connected && self.state != SyncState::NtpSynced {
            if let Some(local) = self.fetch_network_local(gmt_offset) {
                match self.clock.set(local) {
                    Ok(()) => {
                        self.last_known = Some(local);
                        self.state = SyncState::NtpSynced;
                        info!("clock re-synced from network time");
                    }
                    Err(err) => warn!("failed to set internal clock: {err}"),
                }
            }
        }
        self.push_to_hardware_clock();
    }

    pub fn now(&mut self) -> Result<NaiveDateTime, DriverError> {
        match self.clock.now() {
            Ok(time) => {
                self.last_known = Some(time);
                Ok(time)
            }
            Err(err) => match self.last_known {
                Some(time) => {
                    warn!("internal clock unreadable ({err}); reusing {time}");
                    Ok(time)
                }
                None => Err(err),
            },
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.clock.uptime_ms()
    }

    fn fetch_network_local(&mut self, gmt_offset: i8) -> Option<NaiveDateTime> {
        match self.ntp.fetch_utc() {
            Ok(utc) => {
                let local = utc.naive_utc() + Duration::hours(gmt_offset as i64);
                info!("network time {utc}, local {local} (GMT{gmt_offset:+})");
                Some(local)
            }
            Err(err) => {
                warn!("network time unavailable: {err}");
                None
            }
        }
    }

    fn push_to_hardware_clock(&mut self) {
        let Some(rtc) = self.rtc.as_mut() else {
            return;
        };
        let time = match self.clock.now() {
            Ok(time) => time,
            Err(err) => {
                warn!("cannot mirror internal clock to hardware clock: {err}");
                return;
            }
        };
        if let Err(err) = rtc.write(time) {
            warn!("failed to write hardware clock: {err}");
        }
    }
}
