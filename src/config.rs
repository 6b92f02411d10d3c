// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use config::FileFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use crate::error::Error;
use crate::instruments::{Instrument, InstrumentKind, Instruments, PublishPolicy};
use crate::protocol::command::DeviceParameter;
use crate::scripts::LaunchMode;
use crate::tod::Windows;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawGateway {
    who: Option<String>,
    channel: Option<String>,
    sync: Option<bool>,
    n_max: Option<usize>,
    upload_period: Option<u64>,
    keepalive: Option<u64>,
    rtc_delta: Option<u64>,
    rtc_period: Option<u64>,
    host_rtc: Option<bool>,
    probe_addr: Option<String>,
    host_clock_cmd: Option<String>,
    poweroff_cmd: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSerial {
    port: Option<String>,
    baud: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMqtt {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUdp {
    rx_port: Option<u16>,
    tx_port: Option<u16>,
    multicast: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawHtml {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTod {
    intervals: Option<String>,
    aux_mode: Option<String>,
    poweroff: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRoof {
    script: Option<String>,
    script_mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawVoltmeter {
    threshold: Option<f64>,
    delta: Option<f64>,
    time: Option<u64>,
    offset: Option<f64>,
    script: Option<String>,
    script_mode: Option<String>,
    publish_where: Option<String>,
    publish_what: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInstrument {
    height: Option<f64>,
    offset: Option<f64>,
    threshold: Option<f64>,
    average_threshold: Option<f64>,
    gain: Option<f64>,
    calibration: Option<f64>,
    delta_threshold: Option<f64>,
    publish_where: Option<String>,
    publish_what: Option<String>,
}

impl RawInstrument {
    fn value(&self, name: &str) -> Option<f64> {
        match name {
            "height" => self.height,
            "offset" => self.offset,
            "threshold" => self.threshold,
            "average_threshold" => self.average_threshold,
            "gain" => self.gain,
            "calibration" => self.calibration,
            "delta_threshold" => self.delta_threshold,
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    gateway: RawGateway,
    serial: RawSerial,
    mqtt: Option<RawMqtt>,
    udp: Option<RawUdp>,
    html: RawHtml,
    tod: RawTod,
    roof: RawRoof,
    voltmeter: RawVoltmeter,
    barometer: RawInstrument,
    rain: RawInstrument,
    cloud: RawInstrument,
    pyranometer: RawInstrument,
    photometer: RawInstrument,
    thermometer: RawInstrument,
    anemometer: RawInstrument,
    pluviometer: RawInstrument,
    thermopile: RawInstrument,
}

/// How the aux relay is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxMode {
    /// The gateway never touches the aux relay
    Never,
    /// Aux relay follows the device's programmed on/off times
    Timed,
    /// Aux relay follows the configured time-of-day windows
    Auto,
}

impl FromStr for AuxMode {
    type Err = String;

    fn from_str(s: &str) -> Result<AuxMode, String> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(AuxMode::Never),
            "timed" => Ok(AuxMode::Timed),
            "auto" => Ok(AuxMode::Auto),
            other => Err(format!("unknown aux relay mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub rx_port: u16,
    pub tx_port: u16,
    pub multicast: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScriptConfig {
    pub path: Option<PathBuf>,
    pub mode: LaunchMode,
}

#[derive(Debug, Clone, Copy)]
pub struct VoltConfig {
    /// Alarm threshold in V, before the delta is added
    pub threshold: f64,
    /// Safety margin added to the threshold
    pub delta: f64,
    /// Sliding window length in samples
    pub time: usize,
}

/// Configured device-side values and publish policy of one instrument.
#[derive(Debug, Clone)]
pub struct InstrumentSettings {
    pub kind: InstrumentKind,
    pub configured: Vec<(&'static DeviceParameter, f64)>,
    pub policy: PublishPolicy,
}

/// The validated configuration, threaded through construction of every
/// component; there are no process-wide singletons.
#[derive(Debug, Clone)]
pub struct Config {
    pub who: String,
    pub channel: String,
    pub sync: bool,
    pub n_max: usize,
    pub upload_period: Duration,
    pub keepalive: Duration,
    pub rtc_delta: Duration,
    pub rtc_period: Duration,
    pub host_rtc: bool,
    pub probe_addr: String,
    pub host_clock_cmd: String,
    pub poweroff_cmd: String,
    pub serial_port: String,
    pub baud: u32,
    pub mqtt: Option<MqttConfig>,
    pub udp: Option<UdpConfig>,
    pub html_path: Option<PathBuf>,
    pub windows: Windows,
    pub aux_mode: AuxMode,
    pub tod_poweroff: bool,
    pub roof_script: ScriptConfig,
    pub low_volt_script: ScriptConfig,
    pub voltmeter: VoltConfig,
    pub instruments: Vec<InstrumentSettings>,
    source: PathBuf,
    mtime: Option<SystemTime>,
}

fn parse_policy(
    section: &str,
    publish_where: Option<&str>,
    publish_what: Option<&str>,
) -> Result<PublishPolicy, Error> {
    let mut policy = PublishPolicy {
        mqtt: false,
        html: false,
        current: false,
        average: false,
    };
    match publish_where {
        None => policy.mqtt = true,
        Some(spec) => {
            for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                match token.to_ascii_lowercase().as_str() {
                    "mqtt" => policy.mqtt = true,
                    "html" => policy.html = true,
                    "none" => {}
                    other => {
                        return Err(Error::Config(format!(
                            "{}.publish_where: unknown sink '{}'",
                            section, other
                        )))
                    }
                }
            }
        }
    }
    match publish_what {
        None => {
            policy.current = true;
            policy.average = true;
        }
        Some(spec) => {
            for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                match token.to_ascii_lowercase().as_str() {
                    "current" => policy.current = true,
                    "average" => policy.average = true,
                    other => {
                        return Err(Error::Config(format!(
                            "{}.publish_what: unknown value '{}'",
                            section, other
                        )))
                    }
                }
            }
        }
    }
    Ok(policy)
}

fn parse_script_mode(section: &str, mode: Option<&str>) -> Result<LaunchMode, Error> {
    match mode {
        None => Ok(LaunchMode::Never),
        Some(spec) => spec
            .parse()
            .map_err(|e| Error::Config(format!("{}.script_mode: {}", section, e))),
    }
}

fn configured_parameters(
    kind: InstrumentKind,
    value_of: &dyn Fn(&str) -> Option<f64>,
) -> Result<Vec<(&'static DeviceParameter, f64)>, Error> {
    let mut configured = Vec::new();
    for parameter in kind.parameters() {
        if let Some(value) = value_of(parameter.name) {
            if !parameter.in_range(value) {
                return Err(Error::Config(format!(
                    "{}.{} = {} out of range [{}, {}]",
                    kind.label(),
                    parameter.name,
                    value,
                    parameter.min,
                    parameter.max
                )));
            }
            configured.push((parameter, value));
        }
    }
    Ok(configured)
}

impl Config {
    /// Load and validate the INI configuration file.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(FileFormat::Ini))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        let raw: RawConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Config::validate(raw, path.to_path_buf(), mtime)
    }

    fn validate(
        raw: RawConfig,
        source: PathBuf,
        mtime: Option<SystemTime>,
    ) -> Result<Config, Error> {
        let who = raw.gateway.who.unwrap_or_else(|| "ema".to_string());
        let channel = raw.gateway.channel.unwrap_or_else(|| who.clone());

        let n_max = raw.gateway.n_max.unwrap_or(2);
        if n_max < 1 {
            return Err(Error::Config("gateway.n_max must be at least 1".to_string()));
        }
        let upload_period = raw.gateway.upload_period.unwrap_or(60);
        if upload_period < 1 {
            return Err(Error::Config(
                "gateway.upload_period must be at least 1 second".to_string(),
            ));
        }
        let keepalive = raw.gateway.keepalive.unwrap_or(200);
        if keepalive < 20 {
            return Err(Error::Config(
                "gateway.keepalive must be at least 20 seconds".to_string(),
            ));
        }

        let serial_port = raw
            .serial
            .port
            .ok_or_else(|| Error::Config("serial.port is required".to_string()))?;
        let baud = raw.serial.baud.unwrap_or(9600);
        if baud != 9600 && baud != 57600 {
            return Err(Error::Config(format!(
                "serial.baud must be 9600 or 57600, got {}",
                baud
            )));
        }

        let mqtt = raw.mqtt.map(|m| MqttConfig {
            host: m.host.unwrap_or_else(|| "localhost".to_string()),
            port: m.port.unwrap_or(1883),
            client_id: m.client_id.unwrap_or_else(|| who.clone()),
            username: m.username,
            password: m.password,
        });

        let udp = match raw.udp {
            None => None,
            Some(u) => {
                let rx_port = u
                    .rx_port
                    .ok_or_else(|| Error::Config("udp.rx_port is required".to_string()))?;
                let tx_port = u
                    .tx_port
                    .ok_or_else(|| Error::Config("udp.tx_port is required".to_string()))?;
                if let Some(group) = &u.multicast {
                    let addr: std::net::Ipv4Addr = group.parse().map_err(|_| {
                        Error::Config(format!("udp.multicast '{}' is not an IPv4 address", group))
                    })?;
                    if !addr.is_multicast() {
                        return Err(Error::Config(format!(
                            "udp.multicast '{}' is not a multicast group",
                            group
                        )));
                    }
                }
                Some(UdpConfig {
                    rx_port,
                    tx_port,
                    multicast: u.multicast,
                })
            }
        };

        let windows =
            Windows::parse(raw.tod.intervals.as_deref().unwrap_or("")).map_err(|e| {
                Error::Config(format!("tod.intervals: {}", e))
            })?;
        // The aux relay mode is never guessed: with windows configured it
        // must be stated explicitly.
        let aux_mode = match raw.tod.aux_mode.as_deref() {
            Some(spec) => spec
                .parse()
                .map_err(|e: String| Error::Config(format!("tod.aux_mode: {}", e)))?,
            None if windows.is_empty() => AuxMode::Never,
            None => {
                return Err(Error::Config(
                    "tod.aux_mode is required when tod.intervals is set".to_string(),
                ))
            }
        };

        let roof_script = ScriptConfig {
            path: raw.roof.script.map(PathBuf::from),
            mode: parse_script_mode("roof", raw.roof.script_mode.as_deref())?,
        };
        let low_volt_script = ScriptConfig {
            path: raw.voltmeter.script.clone().map(PathBuf::from),
            mode: parse_script_mode("voltmeter", raw.voltmeter.script_mode.as_deref())?,
        };

        let volt_time = raw.voltmeter.time.unwrap_or(30);
        if volt_time < 1 {
            return Err(Error::Config(
                "voltmeter.time must be at least 1 sample".to_string(),
            ));
        }
        let voltmeter = VoltConfig {
            threshold: raw.voltmeter.threshold.unwrap_or(11.8),
            delta: raw.voltmeter.delta.unwrap_or(0.2),
            time: volt_time as usize,
        };

        let mut instruments = Vec::new();
        for kind in InstrumentKind::ALL.iter().copied() {
            let (configured, policy) = match kind {
                InstrumentKind::Voltmeter => {
                    let section = &raw.voltmeter;
                    let configured = configured_parameters(kind, &|name| match name {
                        "threshold" => section.threshold,
                        "offset" => section.offset,
                        _ => None,
                    })?;
                    let policy = parse_policy(
                        kind.label(),
                        section.publish_where.as_deref(),
                        section.publish_what.as_deref(),
                    )?;
                    (configured, policy)
                }
                _ => {
                    let section = match kind {
                        InstrumentKind::Barometer => &raw.barometer,
                        InstrumentKind::RainDetector => &raw.rain,
                        InstrumentKind::CloudSensor => &raw.cloud,
                        InstrumentKind::Pyranometer => &raw.pyranometer,
                        InstrumentKind::Photometer => &raw.photometer,
                        InstrumentKind::Thermometer => &raw.thermometer,
                        InstrumentKind::Anemometer => &raw.anemometer,
                        InstrumentKind::Pluviometer => &raw.pluviometer,
                        InstrumentKind::Thermopile => &raw.thermopile,
                        InstrumentKind::Voltmeter => unreachable!(),
                    };
                    let configured =
                        configured_parameters(kind, &|name| section.value(name))?;
                    let policy = parse_policy(
                        kind.label(),
                        section.publish_where.as_deref(),
                        section.publish_what.as_deref(),
                    )?;
                    (configured, policy)
                }
            };
            instruments.push(InstrumentSettings {
                kind,
                configured,
                policy,
            });
        }

        Ok(Config {
            who,
            channel,
            sync: raw.gateway.sync.unwrap_or(true),
            n_max,
            upload_period: Duration::from_secs(upload_period),
            keepalive: Duration::from_secs(keepalive),
            rtc_delta: Duration::from_secs(raw.gateway.rtc_delta.unwrap_or(5)),
            rtc_period: Duration::from_secs(raw.gateway.rtc_period.unwrap_or(12 * 3600)),
            host_rtc: raw.gateway.host_rtc.unwrap_or(false),
            probe_addr: raw
                .gateway
                .probe_addr
                .unwrap_or_else(|| "1.1.1.1:53".to_string()),
            host_clock_cmd: raw
                .gateway
                .host_clock_cmd
                .unwrap_or_else(|| "date".to_string()),
            poweroff_cmd: raw
                .gateway
                .poweroff_cmd
                .unwrap_or_else(|| "/sbin/shutdown -h now".to_string()),
            serial_port,
            baud,
            mqtt,
            udp,
            html_path: raw.html.path.map(PathBuf::from),
            windows,
            aux_mode,
            tod_poweroff: raw.tod.poweroff.unwrap_or(false),
            roof_script,
            low_volt_script,
            voltmeter,
            instruments,
            source,
            mtime,
        })
    }

    /// Build the instrument set from the configured parameters and policies.
    pub fn build_instruments(&self) -> Instruments {
        let mut items = Vec::new();
        for settings in &self.instruments {
            let mut instrument = Instrument::new(
                settings.kind,
                settings.policy,
                settings.configured.clone(),
            );
            if settings.kind == InstrumentKind::Voltmeter {
                instrument = instrument.with_volt_watch(
                    self.voltmeter.time,
                    self.voltmeter.threshold + self.voltmeter.delta,
                );
            }
            items.push(instrument);
        }
        Instruments::new(items)
    }

    /// Re-read the file if it changed on disk and fold the reloadable
    /// sections into this configuration. Returns whether anything was
    /// re-applied. Serial, broker, UDP and identity settings require a
    /// restart and are deliberately left untouched.
    pub fn reload(&mut self) -> Result<bool, Error> {
        let mtime = std::fs::metadata(&self.source)
            .and_then(|m| m.modified())
            .ok();
        if mtime == self.mtime {
            return Ok(false);
        }
        let fresh = Config::load(&self.source)?;
        self.sync = fresh.sync;
        self.upload_period = fresh.upload_period;
        self.keepalive = fresh.keepalive;
        self.rtc_delta = fresh.rtc_delta;
        self.rtc_period = fresh.rtc_period;
        self.host_rtc = fresh.host_rtc;
        self.probe_addr = fresh.probe_addr;
        self.host_clock_cmd = fresh.host_clock_cmd;
        self.poweroff_cmd = fresh.poweroff_cmd;
        self.windows = fresh.windows;
        self.aux_mode = fresh.aux_mode;
        self.tod_poweroff = fresh.tod_poweroff;
        self.roof_script = fresh.roof_script;
        self.low_volt_script = fresh.low_volt_script;
        self.voltmeter = fresh.voltmeter;
        self.instruments = fresh.instruments;
        self.mtime = fresh.mtime;
        Ok(true)
    }
}
