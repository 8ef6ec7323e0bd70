use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, warn};

use growbox_common::{
    drivers::{
        AirReading, AirSensor, CurrentSensor, NetworkTime, PowerReading, PwmBank, SoilReading,
        SoilSensor, SystemClock, Uplink,
    },
    store::read_json,
    Channel, ControlLoop, ControllerSettings, DeviceIdentity, DriverError, Drivers,
    FanPulseCounter,
};

const SETTINGS_FILE: &str = "config/controller_settings.json";
const FAN_MAX_RPM: f32 = 1_800.0;
const SUPPLY_VOLTS: f32 = 24.0;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("GROWBOX_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.growbox"));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let settings = load_settings(&data_dir)?;
    let offline = std::env::var("GROWBOX_OFFLINE").is_ok_and(|value| value != "0");

    let identity = DeviceIdentity {
        board_id: std::env::var("GROWBOX_BOARD_ID").unwrap_or_else(|_| "host-simulator".into()),
        mac_address: None,
        firmware_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let outputs = Arc::new(SimulatedOutputs::default());
    let fan_pulses = Arc::new(FanPulseCounter::new());
    spawn_fan_tachometer(outputs.clone(), fan_pulses.clone());

    let uplink = HttpUplink::new(&settings.cloud_base_url, offline);
    info!(
        "simulated controller using {} ({})",
        data_dir.display(),
        if offline { "offline" } else { settings.cloud_base_url.as_str() }
    );

    let drivers = Drivers {
        clock: Box::new(HostClock::new()),
        rtc: None,
        ntp: Box::new(SystemNtp),
        uplink: Box::new(uplink),
        pwm: Box::new(SimulatedPwm(outputs.clone())),
        current: Some(Box::new(SimulatedPower(outputs))),
        soil: Some(Box::new(SimulatedSoil::default())),
        air: Some(Box::new(SimulatedAir::default())),
        fan_pulses,
    };

    let mut control = ControlLoop::start(
        identity,
        settings,
        &data_dir,
        drivers,
        StdRng::from_entropy(),
    );
    control.run();
    warn!("control loop halted");
    Ok(())
}

fn load_settings(data_dir: &Path) -> anyhow::Result<ControllerSettings> {
    let path = data_dir.join(SETTINGS_FILE);
    let mut settings: ControllerSettings = read_json(&path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .unwrap_or_default();
    if let Ok(url) = std::env::var("GROWBOX_CLOUD_URL") {
        settings.cloud_base_url = url;
    }
    Ok(settings)
}

/// Wall clock as an offset from system time, so setting it never touches the
/// host's real clock.
struct HostClock {
    offset: chrono::Duration,
    started: Instant,
}

impl HostClock {
    fn new() -> Self {
        Self {
            offset: chrono::Duration::zero(),
            started: Instant::now(),
        }
    }
}

impl SystemClock for HostClock {
    fn now(&self) -> Result<NaiveDateTime, DriverError> {
        Ok(Utc::now().naive_utc() + self.offset)
    }

    fn set(&mut self, local: NaiveDateTime) -> Result<(), DriverError> {
        self.offset = local - Utc::now().naive_utc();
        Ok(())
    }

    fn uptime_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// The host's own clock is assumed to be NTP-disciplined already.
struct SystemNtp;

impl NetworkTime for SystemNtp {
    fn fetch_utc(&mut self) -> Result<DateTime<Utc>, DriverError> {
        Ok(Utc::now())
    }
}

struct HttpUplink {
    agent: ureq::Agent,
    base_url: String,
    offline: bool,
}

impl HttpUplink {
    fn new(base_url: &str, offline: bool) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            offline,
        }
    }
}

impl Uplink for HttpUplink {
    fn is_connected(&mut self) -> bool {
        !self.offline
    }

    fn get(&mut self, path_and_query: &str) -> Result<String, DriverError> {
        let url = format!("{}/{path_and_query}", self.base_url);
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|err| DriverError::Transport(err.to_string()))?;
        response
            .into_string()
            .map_err(|err| DriverError::Transport(err.to_string()))
    }
}

/// Last duty written per channel, shared with the simulated sensors so they
/// respond to what the loop drives.
#[derive(Default)]
struct SimulatedOutputs {
    duties: [AtomicU16; 5],
}

impl SimulatedOutputs {
    fn duty(&self, channel: Channel) -> u16 {
        self.duties[channel as usize].load(Ordering::Relaxed)
    }
}

struct SimulatedPwm(Arc<SimulatedOutputs>);

impl PwmBank for SimulatedPwm {
    fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<(), DriverError> {
        self.0.duties[channel as usize].store(duty, Ordering::Relaxed);
        Ok(())
    }
}

/// LED panel draw scales with the summed light duty.
struct SimulatedPower(Arc<SimulatedOutputs>);

impl CurrentSensor for SimulatedPower {
    fn read(&mut self) -> Result<PowerReading, DriverError> {
        let light: f32 = [Channel::Red, Channel::Green, Channel::Blue, Channel::White]
            .into_iter()
            .map(|channel| self.0.duty(channel) as f32 / 65_535.0)
            .sum();
        let fan = self.0.duty(Channel::Fan) as f32 / 65_535.0;
        let volts = SUPPLY_VOLTS + rand::thread_rng().gen_range(-0.05..0.05);
        let milliamps = light * 900.0 + fan * 80.0 + 15.0;
        Ok(PowerReading {
            volts,
            milliamps,
            milliwatts: volts * milliamps,
        })
    }
}

#[derive(Default)]
struct SimulatedSoil {
    moisture: Option<f32>,
}

impl SoilSensor for SimulatedSoil {
    fn read(&mut self) -> Result<SoilReading, DriverError> {
        let mut rng = rand::thread_rng();
        let moisture = self.moisture.unwrap_or(650.0) - rng.gen_range(0.0..0.05);
        self.moisture = Some(if moisture < 350.0 { 650.0 } else { moisture });
        Ok(SoilReading {
            moisture,
            temperature_c: 21.0 + rng.gen_range(-0.2..0.2),
        })
    }
}

#[derive(Default)]
struct SimulatedAir;

impl AirSensor for SimulatedAir {
    fn read(&mut self) -> Result<AirReading, DriverError> {
        let mut rng = rand::thread_rng();
        Ok(AirReading {
            temperature_c: 23.5 + rng.gen_range(-0.3..0.3),
            humidity: 55.0 + rng.gen_range(-1.0..1.0),
        })
    }
}

/// Stands in for the tachometer interrupt: two pulses per revolution at a
/// speed proportional to the fan duty.
fn spawn_fan_tachometer(outputs: Arc<SimulatedOutputs>, pulses: Arc<FanPulseCounter>) {
    const TICK: Duration = Duration::from_millis(50);
    thread::spawn(move || {
        let mut owed = 0.0_f32;
        loop {
            thread::sleep(TICK);
            let rpm = outputs.duty(Channel::Fan) as f32 / 65_535.0 * FAN_MAX_RPM;
            owed += rpm * 2.0 / 60.0 * TICK.as_secs_f32();
            while owed >= 1.0 {
                pulses.record_pulse();
                owed -= 1.0;
            }
        }
    });
}
