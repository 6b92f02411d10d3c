// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use std::collections::VecDeque;

use crate::protocol::command::DeviceParameter;
use crate::protocol::status::Reading;

/// The ten virtual instruments carried by the station controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    Voltmeter,
    Barometer,
    RainDetector,
    CloudSensor,
    Pyranometer,
    Photometer,
    Thermometer,
    Anemometer,
    Pluviometer,
    Thermopile,
}

static VOLTMETER_PARAMS: [DeviceParameter; 2] = [
    DeviceParameter {
        name: "threshold",
        units: "V",
        letter: 'F',
        get_request: "(f)",
        width: 3,
        signed: false,
        divisor: 10.0,
        min: 0.0,
        max: 25.5,
    },
    DeviceParameter {
        name: "offset",
        units: "V",
        letter: 'G',
        get_request: "(g)",
        width: 2,
        signed: true,
        divisor: 10.0,
        min: -9.9,
        max: 9.9,
    },
];

static BAROMETER_PARAMS: [DeviceParameter; 2] = [
    DeviceParameter {
        name: "height",
        units: "m",
        letter: 'M',
        get_request: "(m)",
        width: 4,
        signed: false,
        divisor: 1.0,
        min: 0.0,
        max: 9999.0,
    },
    DeviceParameter {
        name: "offset",
        units: "hPa",
        letter: 'B',
        get_request: "(b)",
        width: 3,
        signed: true,
        divisor: 10.0,
        min: -99.9,
        max: 99.9,
    },
];

static RAIN_PARAMS: [DeviceParameter; 1] = [DeviceParameter {
    name: "threshold",
    units: "%",
    letter: 'U',
    get_request: "(u)",
    width: 3,
    signed: false,
    divisor: 1.0,
    min: 0.0,
    max: 100.0,
}];

static CLOUD_PARAMS: [DeviceParameter; 2] = [
    DeviceParameter {
        name: "threshold",
        units: "%",
        letter: 'N',
        get_request: "(n)",
        width: 3,
        signed: false,
        divisor: 1.0,
        min: 0.0,
        max: 100.0,
    },
    DeviceParameter {
        name: "gain",
        units: "",
        letter: 'I',
        get_request: "(i)",
        width: 3,
        signed: false,
        divisor: 10.0,
        min: 0.0,
        max: 99.9,
    },
];

static PYRANOMETER_PARAMS: [DeviceParameter; 1] = [DeviceParameter {
    name: "gain",
    units: "",
    letter: 'J',
    get_request: "(j)",
    width: 3,
    signed: false,
    divisor: 10.0,
    min: 0.0,
    max: 99.9,
}];

static PHOTOMETER_PARAMS: [DeviceParameter; 2] = [
    DeviceParameter {
        name: "threshold",
        units: "mag",
        letter: 'H',
        get_request: "(h)",
        width: 3,
        signed: false,
        divisor: 10.0,
        min: 0.0,
        max: 99.9,
    },
    DeviceParameter {
        name: "offset",
        units: "mag",
        letter: 'O',
        get_request: "(o)",
        width: 2,
        signed: true,
        divisor: 10.0,
        min: -9.9,
        max: 9.9,
    },
];

static THERMOMETER_PARAMS: [DeviceParameter; 1] = [DeviceParameter {
    name: "delta_threshold",
    units: "°C",
    letter: 'C',
    get_request: "(c)",
    width: 3,
    signed: false,
    divisor: 10.0,
    min: 0.0,
    max: 99.9,
}];

static ANEMOMETER_PARAMS: [DeviceParameter; 2] = [
    DeviceParameter {
        name: "threshold",
        units: "km/h",
        letter: 'W',
        get_request: "(w)",
        width: 3,
        signed: false,
        divisor: 1.0,
        min: 0.0,
        max: 999.0,
    },
    DeviceParameter {
        name: "average_threshold",
        units: "km/h",
        letter: 'A',
        get_request: "(a)",
        width: 3,
        signed: false,
        divisor: 1.0,
        min: 0.0,
        max: 999.0,
    },
];

static PLUVIOMETER_PARAMS: [DeviceParameter; 1] = [DeviceParameter {
    name: "calibration",
    units: "",
    letter: 'P',
    get_request: "(p)",
    width: 4,
    signed: false,
    divisor: 1.0,
    min: 0.0,
    max: 9999.0,
}];

static THERMOPILE_PARAMS: [DeviceParameter; 1] = [DeviceParameter {
    name: "gain",
    units: "",
    letter: 'E',
    get_request: "(e)",
    width: 3,
    signed: false,
    divisor: 10.0,
    min: 0.0,
    max: 99.9,
}];

impl InstrumentKind {
    /// Every instrument kind, in canonical order.
    pub const ALL: [InstrumentKind; 10] = [
        InstrumentKind::Voltmeter,
        InstrumentKind::Barometer,
        InstrumentKind::RainDetector,
        InstrumentKind::CloudSensor,
        InstrumentKind::Pyranometer,
        InstrumentKind::Photometer,
        InstrumentKind::Thermometer,
        InstrumentKind::Anemometer,
        InstrumentKind::Pluviometer,
        InstrumentKind::Thermopile,
    ];

    pub fn label(self) -> &'static str {
        match self {
            InstrumentKind::Voltmeter => "voltmeter",
            InstrumentKind::Barometer => "barometer",
            InstrumentKind::RainDetector => "rain",
            InstrumentKind::CloudSensor => "cloud",
            InstrumentKind::Pyranometer => "pyranometer",
            InstrumentKind::Photometer => "photometer",
            InstrumentKind::Thermometer => "thermometer",
            InstrumentKind::Anemometer => "anemometer",
            InstrumentKind::Pluviometer => "pluviometer",
            InstrumentKind::Thermopile => "thermopile",
        }
    }

    /// Device-side parameters owned by this instrument.
    pub fn parameters(self) -> &'static [DeviceParameter] {
        match self {
            InstrumentKind::Voltmeter => &VOLTMETER_PARAMS,
            InstrumentKind::Barometer => &BAROMETER_PARAMS,
            InstrumentKind::RainDetector => &RAIN_PARAMS,
            InstrumentKind::CloudSensor => &CLOUD_PARAMS,
            InstrumentKind::Pyranometer => &PYRANOMETER_PARAMS,
            InstrumentKind::Photometer => &PHOTOMETER_PARAMS,
            InstrumentKind::Thermometer => &THERMOMETER_PARAMS,
            InstrumentKind::Anemometer => &ANEMOMETER_PARAMS,
            InstrumentKind::Pluviometer => &PLUVIOMETER_PARAMS,
            InstrumentKind::Thermopile => &THERMOPILE_PARAMS,
        }
    }

    /// Reading-vector channels fed by this instrument, with their values.
    fn extract(self, reading: &Reading) -> Vec<(&'static str, Option<f64>)> {
        match self {
            InstrumentKind::Voltmeter => vec![("voltage", reading.voltage)],
            InstrumentKind::Barometer => vec![
                ("absolute_pressure", reading.absolute_pressure),
                ("calibrated_pressure", reading.calibrated_pressure),
            ],
            InstrumentKind::RainDetector => vec![("probability", reading.rain_probability)],
            InstrumentKind::CloudSensor => vec![("level", reading.cloud_level)],
            InstrumentKind::Pyranometer => vec![("level", reading.pyranometer_level)],
            InstrumentKind::Photometer => vec![("frequency", reading.photometer_frequency)],
            InstrumentKind::Thermometer => vec![
                ("temperature", reading.ambient_temperature),
                ("humidity", reading.humidity),
                ("dew_point", reading.dew_point),
            ],
            InstrumentKind::Anemometer => vec![
                ("speed", reading.wind_speed),
                ("speed_average", reading.wind_speed_average.map(f64::from)),
                ("direction", reading.wind_direction.map(f64::from)),
            ],
            InstrumentKind::Pluviometer => vec![
                ("level", reading.pluviometer_level),
                ("accumulated", reading.pluviometer_accumulated.map(f64::from)),
            ],
            // The thermopile feeds the cloud computation inside the device
            // and surfaces no channel of its own.
            InstrumentKind::Thermopile => Vec::new(),
        }
    }
}

/// Where and what an instrument publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    pub mqtt: bool,
    pub html: bool,
    pub current: bool,
    pub average: bool,
}

impl Default for PublishPolicy {
    fn default() -> PublishPolicy {
        PublishPolicy {
            mqtt: true,
            html: false,
            current: true,
            average: true,
        }
    }
}

/// One instrument channel value pair taken at an upload boundary.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSnapshot {
    pub instrument: &'static str,
    pub channel: &'static str,
    pub current: Option<f64>,
    /// `None` when no sample arrived during the period
    pub average: Option<f64>,
    pub policy: PublishPolicy,
}

/// Low supply voltage alarm payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowVoltage {
    pub average: f64,
    pub threshold: f64,
    pub samples: usize,
}

struct Channel {
    name: &'static str,
    current: Option<f64>,
    sum: f64,
    count: u64,
}

impl Channel {
    fn new(name: &'static str) -> Channel {
        Channel {
            name,
            current: None,
            sum: 0.0,
            count: 0,
        }
    }
}

/// Sliding window behind the low-voltage alarm, separate from the upload
/// accumulator. Edge-triggered: one event per excursion below the threshold.
struct VoltWatch {
    window: VecDeque<f64>,
    size: usize,
    threshold: f64,
    below: bool,
}

impl VoltWatch {
    fn push(&mut self, value: f64) -> Option<LowVoltage> {
        self.window.push_back(value);
        if self.window.len() > self.size {
            self.window.pop_front();
        }
        if self.window.len() < self.size {
            return None;
        }
        let average = self.window.iter().sum::<f64>() / self.window.len() as f64;
        if average < self.threshold {
            if !self.below {
                self.below = true;
                return Some(LowVoltage {
                    average,
                    threshold: self.threshold,
                    samples: self.window.len(),
                });
            }
        } else {
            self.below = false;
        }
        None
    }
}

/// A virtual instrument: current values, upload accumulators, configured
/// device-side parameters and a publish policy.
pub struct Instrument {
    kind: InstrumentKind,
    policy: PublishPolicy,
    configured: Vec<(&'static DeviceParameter, f64)>,
    channels: Vec<Channel>,
    volt: Option<VoltWatch>,
}

impl Instrument {
    pub fn new(
        kind: InstrumentKind,
        policy: PublishPolicy,
        configured: Vec<(&'static DeviceParameter, f64)>,
    ) -> Instrument {
        let channels = kind
            .extract(&EMPTY_READING)
            .into_iter()
            .map(|(name, _)| Channel::new(name))
            .collect();
        Instrument {
            kind,
            policy,
            configured,
            channels,
            volt: None,
        }
    }

    /// Attach the sliding low-voltage watch (voltmeter only).
    ///
    /// * `samples` - Window length in samples (one per bulletin).
    /// * `threshold` - Alarm level, already including the configured delta.
    pub fn with_volt_watch(mut self, samples: usize, threshold: f64) -> Instrument {
        self.volt = Some(VoltWatch {
            window: VecDeque::with_capacity(samples),
            size: samples.max(1),
            threshold,
            below: false,
        });
        self
    }

    /// Replace the volt watch parameters (configuration reload); the
    /// sampled window restarts empty.
    pub fn configure_volt_watch(&mut self, samples: usize, threshold: f64) {
        self.volt = Some(VoltWatch {
            window: VecDeque::with_capacity(samples),
            size: samples.max(1),
            threshold,
            below: false,
        });
    }

    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    pub fn policy(&self) -> PublishPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: PublishPolicy) {
        self.policy = policy;
    }

    /// Configured (parameter, value) pairs to reconcile with the device.
    pub fn configured_parameters(&self) -> &[(&'static DeviceParameter, f64)] {
        &self.configured
    }

    pub fn set_configured_parameters(&mut self, configured: Vec<(&'static DeviceParameter, f64)>) {
        self.configured = configured;
    }

    /// Fold one reading into current values and accumulators.
    pub fn update(&mut self, reading: &Reading) -> Option<LowVoltage> {
        let values = self.kind.extract(reading);
        for (channel, (_, value)) in self.channels.iter_mut().zip(values.iter()) {
            channel.current = *value;
            if let Some(v) = value {
                channel.sum += v;
                channel.count += 1;
            }
        }
        match (&mut self.volt, reading.voltage) {
            (Some(watch), Some(voltage)) => watch.push(voltage),
            _ => None,
        }
    }

    /// Emit (current, average) per channel and reset the accumulators.
    pub fn snapshot(&mut self) -> Vec<ChannelSnapshot> {
        let instrument = self.kind.label();
        let policy = self.policy;
        self.channels
            .iter_mut()
            .map(|channel| {
                let average = if channel.count > 0 {
                    Some(channel.sum / channel.count as f64)
                } else {
                    None
                };
                channel.sum = 0.0;
                channel.count = 0;
                ChannelSnapshot {
                    instrument,
                    channel: channel.name,
                    current: channel.current,
                    average,
                    policy,
                }
            })
            .collect()
    }
}

static EMPTY_READING: Reading = Reading {
    roof_relay: 'C',
    aux_relay: 'e',
    voltage: None,
    rain_probability: None,
    cloud_level: None,
    absolute_pressure: None,
    calibrated_pressure: None,
    pluviometer_level: None,
    pluviometer_accumulated: None,
    pyranometer_level: None,
    photometer_frequency: None,
    ambient_temperature: None,
    humidity: None,
    dew_point: None,
    wind_speed: None,
    wind_speed_average: None,
    wind_direction: None,
};

/// The full instrument set, updated from the frame-delivery path and
/// snapshotted from the scheduler only.
pub struct Instruments {
    items: Vec<Instrument>,
}

impl Instruments {
    pub fn new(items: Vec<Instrument>) -> Instruments {
        Instruments { items }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Instrument> {
        self.items.iter_mut()
    }

    /// Fold one reading into every instrument; surfaces at most one
    /// low-voltage event per excursion.
    pub fn update(&mut self, reading: &Reading) -> Option<LowVoltage> {
        let mut alarm = None;
        for instrument in self.items.iter_mut() {
            if let Some(event) = instrument.update(reading) {
                alarm = Some(event);
            }
        }
        alarm
    }

    /// Snapshot every instrument at an upload boundary.
    pub fn snapshot_all(&mut self) -> Vec<ChannelSnapshot> {
        self.items
            .iter_mut()
            .flat_map(|instrument| instrument.snapshot())
            .collect()
    }

    /// Full parameter inventory, published once at startup on `register`.
    pub fn inventory(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .items
            .iter()
            .flat_map(|instrument| {
                let label = instrument.kind().label();
                instrument.configured_parameters().iter().map(move |(p, v)| {
                    serde_json::json!({
                        "instrument": label,
                        "parameter": p.name,
                        "units": p.units,
                        "value": v,
                    })
                })
            })
            .collect();
        serde_json::Value::Array(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status;

    fn sample_reading(voltage: f64) -> Reading {
        let frame = format!(
            "(C E {:03} 000 125 10132 09987 0000 000 100 46000 +185 530 +093 0050 002 270)",
            (voltage * 10.0).round() as u32
        );
        status::decode(&frame).expect("test frame decodes")
    }

    #[test]
    fn accumulators_average_and_reset() {
        let mut instrument = Instrument::new(
            InstrumentKind::Thermometer,
            PublishPolicy::default(),
            Vec::new(),
        );
        instrument.update(&sample_reading(12.0));
        instrument.update(&sample_reading(12.0));
        let snaps = instrument.snapshot();
        let temp = snaps
            .iter()
            .find(|s| s.channel == "temperature")
            .expect("temperature channel exists");
        assert_eq!(temp.current, Some(18.5));
        assert_eq!(temp.average, Some(18.5));

        // After the snapshot the accumulator starts over.
        let snaps = instrument.snapshot();
        let temp = snaps
            .iter()
            .find(|s| s.channel == "temperature")
            .expect("temperature channel exists");
        assert_eq!(temp.average, None);
    }

    #[test]
    fn missing_fields_do_not_count() {
        let mut instrument = Instrument::new(
            InstrumentKind::Barometer,
            PublishPolicy::default(),
            Vec::new(),
        );
        let mut reading = sample_reading(12.0);
        reading.absolute_pressure = None;
        instrument.update(&reading);
        instrument.update(&sample_reading(12.0));
        let snaps = instrument.snapshot();
        let abs = snaps
            .iter()
            .find(|s| s.channel == "absolute_pressure")
            .expect("absolute pressure channel exists");
        // One of the two samples was missing; the average uses the other.
        assert_eq!(abs.average, Some(1013.2));
    }

    #[test]
    fn low_voltage_fires_once_per_excursion() {
        let mut instrument = Instrument::new(
            InstrumentKind::Voltmeter,
            PublishPolicy::default(),
            Vec::new(),
        )
        .with_volt_watch(30, 12.0);

        let mut events = Vec::new();
        for _ in 0..30 {
            if let Some(event) = instrument.update(&sample_reading(11.8)) {
                events.push(event);
            }
        }
        assert_eq!(events.len(), 1);
        let event = events[0];
        assert!((event.average - 11.8).abs() < 1e-9);
        assert!((event.threshold - 12.0).abs() < 1e-9);
        assert_eq!(event.samples, 30);

        // Staying low does not re-fire.
        for _ in 0..10 {
            assert_eq!(instrument.update(&sample_reading(11.8)), None);
        }
        // Recovery re-arms the alarm.
        for _ in 0..30 {
            instrument.update(&sample_reading(12.6));
        }
        let mut refired = 0;
        for _ in 0..30 {
            if instrument.update(&sample_reading(11.5)).is_some() {
                refired += 1;
            }
        }
        assert_eq!(refired, 1);
    }

    #[test]
    fn window_shorter_than_size_stays_quiet() {
        let mut instrument = Instrument::new(
            InstrumentKind::Voltmeter,
            PublishPolicy::default(),
            Vec::new(),
        )
        .with_volt_watch(30, 12.0);
        for _ in 0..29 {
            assert_eq!(instrument.update(&sample_reading(11.0)), None);
        }
    }

    #[test]
    fn inventory_lists_configured_parameters() {
        let height = &InstrumentKind::Barometer.parameters()[0];
        let instruments = Instruments::new(vec![Instrument::new(
            InstrumentKind::Barometer,
            PublishPolicy::default(),
            vec![(height, 700.0)],
        )]);
        let inventory = instruments.inventory();
        let entries = inventory.as_array().expect("inventory is an array");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["instrument"], "barometer");
        assert_eq!(entries[0]["parameter"], "height");
        assert_eq!(entries[0]["value"], 700.0);
    }
}
