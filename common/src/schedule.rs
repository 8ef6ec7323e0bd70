use chrono::{NaiveTime, Timelike};
use tracing::debug;

use crate::{
    config::{Config, BLUE_MAX, FAN_MAX, GREEN_MAX, RED_MAX, WHITE_MAX},
    drivers::{Channel, DriverError, PwmBank},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DutyLevels {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
    pub fan: u8,
}

impl DutyLevels {
    pub fn level(&self, channel: Channel) -> u8 {
        match channel {
            Channel::Red => self.red,
            Channel::Green => self.green,
            Channel::Blue => self.blue,
            Channel::White => self.white,
            Channel::Fan => self.fan,
        }
    }
}

/// Lights are on for `on <= now < off`. A window whose off time is earlier
/// than its on time never turns the lights on.
pub fn lights_on(seconds_since_midnight: u32, config: &Config) -> bool {
    let on = config.lights.timer.on.seconds_since_midnight();
    let off = config.lights.timer.off.seconds_since_midnight();
    on <= seconds_since_midnight && seconds_since_midnight < off
}

pub fn scheduled_levels(seconds_since_midnight: u32, config: &Config) -> DutyLevels {
    let fan = &config.fan.duty;
    if lights_on(seconds_since_midnight, config) {
        let duty = &config.lights.duty;
        DutyLevels {
            red: duty.red.min(RED_MAX),
            green: duty.green.min(GREEN_MAX),
            blue: duty.blue.min(BLUE_MAX),
            white: duty.white.min(WHITE_MAX),
            fan: fan.when_lights_on.min(FAN_MAX),
        }
    } else {
        DutyLevels {
            fan: fan.when_lights_off.min(FAN_MAX),
            ..DutyLevels::default()
        }
    }
}

pub fn to_pwm(level: u8) -> u16 {
    level as u16 * 256
}

pub struct ActuatorController {
    pwm: Box<dyn PwmBank>,
    applied: Option<DutyLevels>,
}

impl ActuatorController {
    pub fn new(pwm: Box<dyn PwmBank>) -> Self {
        Self { pwm, applied: None }
    }

    pub fn lights_off(&mut self) -> Result<(), DriverError> {
        for channel in [Channel::Red, Channel::Green, Channel::Blue, Channel::White] {
            self.pwm.set_duty(channel, 0)?;
        }
        Ok(())
    }

    pub fn apply(&mut self, now: NaiveTime, config: &Config) -> Result<DutyLevels, DriverError> {
        let levels = scheduled_levels(now.num_seconds_from_midnight(), config);
        for channel in Channel::ALL {
            self.pwm.set_duty(channel, to_pwm(levels.level(channel)))?;
        }

        if self.applied != Some(levels) {
            debug!("applied duty levels {levels:?}");
            self.applied = Some(levels);
        }
        Ok(levels)
    }
}
