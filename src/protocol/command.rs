// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use crate::instruments::InstrumentKind;

/// Default per-command deadline; refreshed on every retransmission.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);
/// Default number of retransmissions after the first attempt.
pub const DEFAULT_RETRIES: u32 = 2;

const RTC_FORMAT: &str = "%H:%M:%S %d/%m/%Y";

static AUX_MODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(S\d{3}\)$").expect("aux mode pattern"));
static AUX_ON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(Son\d{4}\)$").expect("aux on-time pattern"));
static AUX_OFF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(Sof\d{4}\)$").expect("aux off-time pattern"));
static RTC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(Y (\d{2}:\d{2}:\d{2} \d{2}/\d{2}/\d{4})\)$").expect("rtc pattern"));
static MINMAX_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(T\d{2} .+\)$").expect("minmax line pattern"));
static AVERAGE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(D\d{3} .+\)$").expect("average line pattern"));
static WATCHDOG_PERIOD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(K(\d{3})\)$").expect("watchdog period pattern"));
// Unknown passthrough tokens expect a single short response; bulletins and
// multi-word responses contain spaces and therefore never match this.
static GENERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(\S*\)$").expect("generic response pattern"));

/// Number of entries in a historic min/max dump (one per hour).
pub const MINMAX_ENTRIES: usize = 24;
/// Number of entries in a historic averages dump (one per 5 minutes).
pub const AVERAGE_ENTRIES: usize = 288;

/// Watchdog keep-alive period, held by the device as any other parameter.
pub static WATCHDOG_PERIOD: DeviceParameter = DeviceParameter {
    name: "period",
    units: "s",
    letter: 'K',
    get_request: "(k)",
    width: 3,
    signed: false,
    divisor: 1.0,
    min: 10.0,
    max: 999.0,
};

/// A device-side parameter: how to read it, write it and recognize its value
/// on the wire.
#[derive(Debug)]
pub struct DeviceParameter {
    /// Parameter name within its instrument (e.g. "height")
    pub name: &'static str,
    /// Unit of the decoded value
    pub units: &'static str,
    /// Response letter (`(M0700)` carries letter `M`)
    pub letter: char,
    /// Request token that reads the parameter back
    pub get_request: &'static str,
    /// Digit count of the wire value
    pub width: usize,
    /// Whether the wire value carries a mandatory sign
    pub signed: bool,
    /// Wire value = decoded value × divisor
    pub divisor: f64,
    /// Lowest acceptable decoded value
    pub min: f64,
    /// Highest acceptable decoded value
    pub max: f64,
}

impl DeviceParameter {
    /// Regex matching the value response, with the raw value captured.
    pub fn response_pattern(&self) -> Regex {
        let body = if self.signed {
            format!(r"[+-]\d{{{}}}", self.width)
        } else {
            format!(r"\d{{{}}}", self.width)
        };
        Regex::new(&format!(r"^\({}({})\)$", self.letter, body))
            .expect("parameter pattern is well-formed")
    }

    /// Build the set-request token carrying `value`.
    pub fn encode_set(&self, value: f64) -> String {
        let raw = (value.abs() * self.divisor).round() as u32;
        if self.signed {
            let sign = if value < 0.0 { '-' } else { '+' };
            format!("({}{}{:0width$})", self.letter, sign, raw, width = self.width)
        } else {
            format!("({}{:0width$})", self.letter, raw, width = self.width)
        }
    }

    /// Extract the decoded value from a response frame.
    pub fn decode_value(&self, frame: &str) -> Option<f64> {
        let caps = self.response_pattern().captures(frame)?;
        let raw: f64 = caps.get(1)?.as_str().parse().ok()?;
        Some(raw / self.divisor)
    }

    /// Smallest value step representable on the wire.
    pub fn quantum(&self) -> f64 {
        1.0 / self.divisor
    }

    /// Whether a device-reported value and a configured value are the same
    /// once rounded to the wire quantum.
    pub fn agrees(&self, device: f64, configured: f64) -> bool {
        (device - configured).abs() < self.quantum() / 2.0 + 1e-9
    }

    /// Whether a configured value is inside the parameter's valid range.
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// One request/response exchange with the device.
///
/// A command completes when each of its response patterns has matched one
/// inbound frame, in declared order; intervening status bulletins never
/// match and flow through to the decoder.
#[derive(Debug, Clone)]
pub struct Command {
    /// Short human name, used in logs
    pub name: &'static str,
    /// Request token transmitted on the wire
    pub request: String,
    /// Expected responses, in order
    pub responses: Vec<Regex>,
    /// Deadline per transmission
    pub timeout: Duration,
    /// Retransmissions allowed after the first attempt
    pub retries: u32,
}

fn echo_pattern(request: &str) -> Regex {
    Regex::new(&format!("^{}$", regex::escape(request))).expect("echo pattern is well-formed")
}

impl Command {
    fn new(name: &'static str, request: String, responses: Vec<Regex>) -> Command {
        Command {
            name,
            request,
            responses,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    fn echo(name: &'static str, request: &str) -> Command {
        let pattern = echo_pattern(request);
        Command::new(name, request.to_string(), vec![pattern])
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Command {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Command {
        self.retries = retries;
        self
    }

    /// Force the roof relay open.
    pub fn roof_open() -> Command {
        Command::echo("roof open", "(X007)")
    }

    /// Force the roof relay closed.
    pub fn roof_close() -> Command {
        Command::echo("roof close", "(X000)")
    }

    /// Read the aux relay mode, on-time and off-time (three responses).
    pub fn aux_status() -> Command {
        Command::new(
            "aux status",
            "(s)".to_string(),
            vec![AUX_MODE_RE.clone(), AUX_ON_RE.clone(), AUX_OFF_RE.clone()],
        )
    }

    pub fn aux_force_on() -> Command {
        Command::echo("aux force on", "(S005)")
    }

    pub fn aux_force_off() -> Command {
        Command::echo("aux force off", "(S004)")
    }

    pub fn aux_timed_mode() -> Command {
        Command::echo("aux timed mode", "(S009)")
    }

    /// Program the aux relay switch-on time (HHMM).
    pub fn aux_set_on_time(hour: u32, minute: u32) -> Command {
        let request = format!("(Son{:02}{:02})", hour, minute);
        let pattern = echo_pattern(&request);
        Command::new("aux set on-time", request, vec![pattern])
    }

    /// Program the aux relay switch-off time (HHMM).
    pub fn aux_set_off_time(hour: u32, minute: u32) -> Command {
        let request = format!("(Sof{:02}{:02})", hour, minute);
        let pattern = echo_pattern(&request);
        Command::new("aux set off-time", request, vec![pattern])
    }

    /// Watchdog keep-alive ping.
    pub fn watchdog_ping() -> Command {
        Command::echo("watchdog ping", "(r)")
    }

    /// Read the device real-time clock.
    pub fn rtc_get() -> Command {
        Command::new("rtc read", "(y)".to_string(), vec![RTC_RE.clone()])
    }

    /// Set the device real-time clock.
    pub fn rtc_set(time: DateTime<Utc>) -> Command {
        let request = format!("(Y {})", time.format(RTC_FORMAT));
        let pattern = echo_pattern(&request);
        Command::new("rtc set", request, vec![pattern])
    }

    /// Dump the 24 hourly (max, min) historic vectors.
    pub fn historic_minmax() -> Command {
        Command::new(
            "historic minmax",
            "(t)".to_string(),
            vec![MINMAX_LINE_RE.clone(); MINMAX_ENTRIES],
        )
        .with_timeout(Duration::from_secs(30))
    }

    /// Dump the 288 five-minute average vectors.
    pub fn historic_averages() -> Command {
        Command::new(
            "historic averages",
            "(d)".to_string(),
            vec![AVERAGE_LINE_RE.clone(); AVERAGE_ENTRIES],
        )
        .with_timeout(Duration::from_secs(120))
    }

    /// Read a device-side parameter back.
    pub fn get_parameter(parameter: &DeviceParameter) -> Command {
        Command::new(
            "parameter read",
            parameter.get_request.to_string(),
            vec![parameter.response_pattern()],
        )
    }

    /// Write a device-side parameter.
    pub fn set_parameter(parameter: &DeviceParameter, value: f64) -> Command {
        let request = parameter.encode_set(value);
        let pattern = echo_pattern(&request);
        Command::new("parameter write", request, vec![pattern])
    }

    /// Classify a raw protocol token received from the companion CLI.
    ///
    /// Known read requests get their real response patterns so multi-line
    /// answers are relayed whole; anything else is assumed to echo a single
    /// short response.
    pub fn from_token(token: &str) -> Command {
        match token {
            "(s)" => return Command::aux_status(),
            "(y)" => return Command::rtc_get(),
            "(t)" => return Command::historic_minmax(),
            "(d)" => return Command::historic_averages(),
            "(k)" => {
                return Command::new(
                    "watchdog period read",
                    token.to_string(),
                    vec![WATCHDOG_PERIOD_RE.clone()],
                )
            }
            _ => {}
        }
        for kind in InstrumentKind::ALL.iter() {
            for parameter in kind.parameters() {
                if parameter.get_request == token {
                    return Command::get_parameter(parameter);
                }
            }
        }
        if token.starts_with("(Y ") {
            // RTC set: the only spaced request, echoed verbatim.
            let pattern = echo_pattern(token);
            return Command::new("passthrough", token.to_string(), vec![pattern]);
        }
        // Set/force tokens are echoed and unknown reads answer with one short
        // value frame; the generic pattern covers both.
        Command::new("passthrough", token.to_string(), vec![GENERIC_RE.clone()])
    }
}

/// Extract the timestamp from an RTC read response.
pub fn parse_rtc(frame: &str) -> Option<DateTime<Utc>> {
    let caps = RTC_RE.captures(frame)?;
    let naive = NaiveDateTime::parse_from_str(caps.get(1)?.as_str(), RTC_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
