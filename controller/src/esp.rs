use core::{convert::TryInto, ffi::c_void};
use std::{
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDateTime, Utc};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{Input, InputPin, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    peripheral::Peripheral,
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use rand::{rngs::StdRng, SeedableRng};

use growbox_common::{
    control::NETWORK_FILE,
    drivers::{NetworkTime, PwmBank, SystemClock, Uplink},
    store::read_json,
    Channel, ControlLoop, ControllerSettings, DeviceIdentity, DriverError, Drivers,
    FanPulseCounter, NetworkCredentials,
};

const DATA_DIR: &str = "/data";
const MAX_HTTP_BODY: usize = 4096;
const HTTP_TIMEOUT_SEC: u64 = 15;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
const SNTP_TIMEOUT: Duration = Duration::from_secs(15);
const PWM_FREQUENCY_KHZ: u32 = 20;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, ledc, pins, ..
    } = Peripherals::take()?;

    if let Err(err) = mount_storage() {
        warn!("{err:#}; settings and logs will not persist");
    }
    let data_dir = Path::new(DATA_DIR);

    let timer_config = TimerConfig::new()
        .frequency(PWM_FREQUENCY_KHZ.kHz().into())
        .resolution(Resolution::Bits10);
    // Shared by every channel for the life of the program.
    let timer = &*Box::leak(Box::new(LedcTimerDriver::new(ledc.timer0, &timer_config)?));
    let mut pwm = LedcPwm {
        channels: [
            LedcDriver::new(ledc.channel0, timer, pins.gpio4)?,
            LedcDriver::new(ledc.channel1, timer, pins.gpio5)?,
            LedcDriver::new(ledc.channel2, timer, pins.gpio6)?,
            LedcDriver::new(ledc.channel3, timer, pins.gpio7)?,
            LedcDriver::new(ledc.channel4, timer, pins.gpio15)?,
        ],
    };
    for channel in Channel::ALL {
        if let Err(err) = pwm.set_duty(channel, 0) {
            warn!("failed to clear {} output: {err}", channel.as_str());
        }
    }

    let fan_pulses = Arc::new(FanPulseCounter::new());
    let _tachometer = match attach_fan_tachometer(pins.gpio16, fan_pulses.clone()) {
        Ok(driver) => Some(driver),
        Err(err) => {
            warn!("failed to attach fan tachometer interrupt, fan speed will read 0: {err:#}");
            None
        }
    };

    let credentials: Option<NetworkCredentials> = read_json(&data_dir.join(NETWORK_FILE))
        .unwrap_or_else(|err| {
            warn!("failed to read network settings: {err}");
            None
        });
    let wifi = match credentials {
        Some(credentials) => match connect_wifi(modem, sys_loop, nvs_partition, &credentials) {
            Ok(wifi) => Some(wifi),
            Err(err) => {
                warn!("wifi startup failed, running offline: {err:#}");
                None
            }
        },
        None => {
            warn!("no network settings at {DATA_DIR}/{NETWORK_FILE}; running offline");
            None
        }
    };

    let settings = ControllerSettings::default();
    let drivers = Drivers {
        clock: Box::new(EspClock),
        rtc: None,
        ntp: Box::new(EspNtp),
        uplink: Box::new(EspUplink::new(&settings.cloud_base_url, wifi.is_some())),
        pwm: Box::new(pwm),
        current: None,
        soil: None,
        air: None,
        fan_pulses,
    };

    let mut control = ControlLoop::start(
        device_identity(),
        settings,
        data_dir,
        drivers,
        StdRng::from_entropy(),
    );
    control.run();

    // Keep wifi and the tachometer alive; the outputs stay dark.
    let _wifi = wifi;
    warn!("control loop halted");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn mount_storage() -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_vfs_fat_mount_config_t {
        format_if_mount_failed: true,
        max_files: 8,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut handle: esp_idf_svc::sys::wl_handle_t = -1;
    let rc = unsafe {
        esp_idf_svc::sys::esp_vfs_fat_spiflash_mount_rw_wl(
            c"/data".as_ptr(),
            c"storage".as_ptr(),
            &config,
            &mut handle,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("mounting {DATA_DIR} failed with code {rc}"));
    }
    info!("mounted storage partition at {DATA_DIR}");
    Ok(())
}

fn device_identity() -> DeviceIdentity {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read factory MAC: esp_err_t={rc}");
    }
    let hex: Vec<String> = mac.iter().map(|byte| format!("{byte:02x}")).collect();
    DeviceIdentity {
        board_id: hex.concat(),
        mac_address: Some(hex.join(":")),
        firmware_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    credentials: &NetworkCredentials,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))
        .context("failed to create wifi driver")?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if credentials.network_password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: credentials
            .network_name
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("network name too long"))?,
        password: credentials
            .network_password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("network password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start().context("failed to start wifi")?;
    info!("wifi started, connecting to `{}`", credentials.network_name);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}")
            }
        }
        let _ = wifi.disconnect();
        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
    }

    warn!(
        "wifi unavailable after {WIFI_CONNECT_ATTEMPTS} attempts; \
         will keep retrying in the background"
    );
    drop(wifi);
    Ok(esp_wifi)
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

/// The system clock holds local wall time, not UTC.
struct EspClock;

impl SystemClock for EspClock {
    fn now(&self) -> Result<NaiveDateTime, DriverError> {
        Ok(Utc::now().naive_utc())
    }

    fn set(&mut self, local: NaiveDateTime) -> Result<(), DriverError> {
        let tv = esp_idf_svc::sys::timeval {
            tv_sec: local.and_utc().timestamp() as _,
            tv_usec: 0,
        };
        let rc = unsafe { esp_idf_svc::sys::settimeofday(&tv, core::ptr::null()) };
        if rc != 0 {
            return Err(DriverError::Clock(format!("settimeofday returned {rc}")));
        }
        Ok(())
    }

    fn uptime_ms(&self) -> u64 {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        (micros / 1_000).try_into().unwrap_or(0)
    }
}

/// SNTP sets the system clock to UTC while it runs. The clock holds local
/// time again only once the caller sets it from the returned value.
struct EspNtp;

impl NetworkTime for EspNtp {
    fn fetch_utc(&mut self) -> Result<DateTime<Utc>, DriverError> {
        let sntp = EspSntp::new_default().map_err(|err| DriverError::Transport(err.to_string()))?;
        let deadline = Instant::now() + SNTP_TIMEOUT;
        while sntp.get_sync_status() != SyncStatus::Completed {
            if Instant::now() >= deadline {
                return Err(DriverError::Transport("SNTP sync timed out".into()));
            }
            thread::sleep(Duration::from_millis(200));
        }
        let utc = Utc::now();
        drop(sntp);
        Ok(utc)
    }
}

struct EspUplink {
    base_url: String,
    enabled: bool,
    last_reconnect: Option<Instant>,
}

impl EspUplink {
    fn new(base_url: &str, enabled: bool) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            enabled,
            last_reconnect: None,
        }
    }
}

impl Uplink for EspUplink {
    fn is_connected(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if is_wifi_station_connected() {
            return true;
        }
        let due = self
            .last_reconnect
            .map_or(true, |at| at.elapsed() >= WIFI_RECONNECT_INTERVAL);
        if due {
            self.last_reconnect = Some(Instant::now());
            let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
            if rc != esp_idf_svc::sys::ESP_OK {
                warn!("wifi reconnect request failed: esp_err_t={rc}");
            }
        }
        false
    }

    fn get(&mut self, path_and_query: &str) -> Result<String, DriverError> {
        let transport = |err: String| DriverError::Transport(err);
        let url = format!("{}/{path_and_query}", self.base_url);
        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(HTTP_TIMEOUT_SEC)),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf).map_err(|e| transport(e.to_string()))?;
        let mut client = HttpClient::wrap(connection);
        let request = client
            .request(Method::Get, &url, &[])
            .map_err(|e| transport(format!("{e:?}")))?;
        let mut response = request.submit().map_err(|e| transport(format!("{e:?}")))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(transport(format!("HTTP {status}")));
        }

        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|e| transport(format!("{e:?}")))?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_HTTP_BODY {
                return Err(transport(format!("response exceeds {MAX_HTTP_BODY} bytes")));
            }
            body.extend_from_slice(&chunk[..read]);
        }
        String::from_utf8(body).map_err(|e| transport(e.to_string()))
    }
}

struct LedcPwm {
    channels: [LedcDriver<'static>; 5],
}

impl PwmBank for LedcPwm {
    fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<(), DriverError> {
        let driver = &mut self.channels[channel as usize];
        let scaled = duty as u32 * driver.get_max_duty() / u16::MAX as u32;
        driver
            .set_duty(scaled)
            .map_err(|err| DriverError::Bus(err.to_string()))
    }
}

unsafe extern "C" fn fan_pulse_isr(arg: *mut c_void) {
    let counter = &*(arg as *const FanPulseCounter);
    counter.record_pulse();
}

/// Counts falling edges on the tachometer line. The returned pin driver must
/// stay alive for the pull-up to remain configured.
fn attach_fan_tachometer<P>(
    pin: impl Peripheral<P = P> + 'static,
    counter: Arc<FanPulseCounter>,
) -> anyhow::Result<PinDriver<'static, P, Input>>
where
    P: InputPin,
{
    let mut driver = PinDriver::input(pin)?;
    driver.set_pull(Pull::Up)?;
    let gpio = driver.pin();

    let rc = unsafe { esp_idf_svc::sys::gpio_install_isr_service(0) };
    if rc != esp_idf_svc::sys::ESP_OK && rc != esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Err(anyhow!("gpio_install_isr_service failed with code {rc}"));
    }
    unsafe {
        esp_idf_svc::sys::esp!(esp_idf_svc::sys::gpio_set_intr_type(
            gpio,
            esp_idf_svc::sys::gpio_int_type_t_GPIO_INTR_NEGEDGE,
        ))?;
        // The counter reference is handed to the ISR and never reclaimed.
        esp_idf_svc::sys::esp!(esp_idf_svc::sys::gpio_isr_handler_add(
            gpio,
            Some(fan_pulse_isr),
            Arc::into_raw(counter) as *mut c_void,
        ))?;
        esp_idf_svc::sys::esp!(esp_idf_svc::sys::gpio_intr_enable(gpio))?;
    }
    info!("fan tachometer on GPIO{gpio}");
    Ok(driver)
}
