// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

#[macro_use]
extern crate log;

/// Configuration file loading and validation
pub mod config;
/// Serial protocol engine (framing, command matching, pacing, retries)
pub mod engine;
mod error;
/// Virtual instruments and their accumulators
pub mod instruments;
/// Wire protocol: framer, status decoder, commands
pub mod protocol;
/// MQTT and HTML sinks
pub mod publisher;
/// Device/host clock disciplining
pub mod rtc;
/// Periodic duty loop
pub mod scheduler;
/// Alarm script launching
pub mod scripts;
/// Device-side parameter reconciliation
pub mod sync;
/// Time-of-day windows
pub mod tod;
/// Companion CLI datagram proxy
pub mod udp;

pub use error::Error;

use serial::prelude::*;
use std::fs::File;
use std::sync::mpsc::Sender;
use std::time::Duration;

use config::Config;
use engine::{Engine, EngineHandle, EngineSettings};
use protocol::status::Reading;
use publisher::Publisher;
use scheduler::Scheduler;

/// Serial read poll granularity; bounds the engine loop latency.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Open and configure the serial port named by the configuration.
pub fn open_port(cfg: &Config) -> Result<serial::SystemPort, Error> {
    info!("opening {}", cfg.serial_port);
    let mut port = serial::open(&cfg.serial_port)?;
    let baud = if cfg.baud == 57600 {
        serial::Baud57600
    } else {
        serial::Baud9600
    };
    port.reconfigure(&|settings| {
        settings.set_char_size(serial::Bits8);
        settings.set_parity(serial::ParityNone);
        settings.set_stop_bits(serial::Stop1);
        settings.set_flow_control(serial::FlowNone);
        settings.set_baud_rate(baud)
    })?;
    port.set_timeout(READ_TIMEOUT)?;
    Ok(port)
}

/// Wire every component together and run the gateway.
///
/// * `cfg` - Validated configuration.
/// * `capture` - Optional capture file; every inbound frame is appended to it.
///
/// Returns when the serial link dies or the protocol desyncs beyond repair;
/// the scheduler, proxy and publisher threads wind down with it.
pub fn run(cfg: Config, capture: Option<File>) -> Result<(), Error> {
    let port = open_port(&cfg)?;

    let (job_tx, job_rx) = std::sync::mpsc::channel();
    let (reading_tx, reading_rx) = std::sync::mpsc::channel();
    let (event_tx, event_rx) = std::sync::mpsc::channel();
    let handle = EngineHandle::new(job_tx);

    let settings = EngineSettings {
        max_inflight: cfg.n_max,
        ..EngineSettings::default()
    };
    let mut engine = Engine::new(port, settings, job_rx, reading_tx).with_event_tap(event_tx);
    if let Some(file) = capture {
        engine = engine.with_capture(file);
    }

    if let Some(udp_cfg) = &cfg.udp {
        udp::spawn_proxy(udp_cfg, handle.clone())?;
        if let Some(group) = &udp_cfg.multicast {
            let (bulletin_tx, bulletin_rx) = std::sync::mpsc::channel();
            engine = engine.with_bulletin_tap(bulletin_tx);
            udp::spawn_multicast(group, udp_cfg.tx_port, bulletin_rx)?;
        }
    }

    let publisher = Publisher::connect(
        cfg.who.clone(),
        cfg.channel.clone(),
        cfg.mqtt.as_ref(),
        cfg.html_path.clone(),
    );
    let farewell = publisher.clone();

    let engine_thread = std::thread::Builder::new()
        .name("engine".to_string())
        .spawn(move || engine.run())?;

    Scheduler::new(cfg, handle, reading_rx, event_rx, publisher).run();

    let result = match engine_thread.join() {
        Ok(result) => result,
        Err(_) => Err(Error::Desync("engine thread panicked".to_string())),
    };
    if let Err(e) = &result {
        // Last chance for observers to learn why the gateway is going down;
        // give the connection thread a moment to flush it out.
        farewell.publish_event("error", &e.to_string());
        std::thread::sleep(Duration::from_millis(500));
    }
    result
}

/// Replay a bulletin capture file through the decoder and send the readings
/// through a channel.
///
/// * `file` - Capture produced by `run --record`.
/// * `tx` - Sender of a channel.
/// * `enable_time_simulation` - If `true`, bulletins are delivered at the
///   device's natural ~1 Hz pace; if `false`, as fast as possible.
///
/// This is meant to be run in a dedicated thread.
pub fn replay(file: File, tx: Sender<Reading>, enable_time_simulation: bool) {
    use std::io::{BufRead, BufReader};

    let reader = BufReader::new(file);
    let bulletin_period = Duration::from_secs(1);

    for line in reader.lines() {
        match line {
            Ok(line) => match protocol::status::decode(line.trim_end()) {
                Some(reading) => {
                    if enable_time_simulation {
                        std::thread::sleep(bulletin_period);
                    }
                    if tx.send(reading).is_err() {
                        return;
                    }
                }
                None => debug!("skipping non-bulletin capture line"),
            },
            Err(e) => {
                warn!("capture read failed: {}", e);
                return;
            }
        }
    }
}
