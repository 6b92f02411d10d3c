// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use crate::engine::{CommandResult, EngineHandle};
use crate::instruments::{Instruments, LowVoltage};
use crate::protocol::command::{Command, DeviceParameter, WATCHDOG_PERIOD};
use crate::protocol::status::Reading;

const POLL_SLEEP: Duration = Duration::from_millis(20);

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    /// Parameters with a configured value that were checked
    pub checked: usize,
    /// Parameters that disagreed and were corrected and verified
    pub corrected: usize,
    /// Parameters that could not be read, written or verified
    pub failed: usize,
    /// Low-voltage excursions observed while readings drained during sync
    pub alarms: Vec<LowVoltage>,
}

impl SyncReport {
    pub fn degraded(&self) -> bool {
        self.failed > 0
    }
}

/// Wait for a command outcome while keeping the status stream folded into
/// the instruments, so a long reconciliation never starves the decoders.
fn await_reply(
    rx: &Receiver<CommandResult>,
    instruments: &mut Instruments,
    readings: &Receiver<Reading>,
    alarms: &mut Vec<LowVoltage>,
) -> Option<Vec<String>> {
    loop {
        while let Ok(reading) = readings.try_recv() {
            if let Some(alarm) = instruments.update(&reading) {
                alarms.push(alarm);
            }
        }
        match rx.try_recv() {
            Ok(Ok(responses)) => return Some(responses),
            Ok(Err(_)) => return None,
            Err(TryRecvError::Empty) => std::thread::sleep(POLL_SLEEP),
            Err(TryRecvError::Disconnected) => return None,
        }
    }
}

fn read_value(
    handle: &EngineHandle,
    parameter: &'static DeviceParameter,
    instruments: &mut Instruments,
    readings: &Receiver<Reading>,
    alarms: &mut Vec<LowVoltage>,
) -> Option<f64> {
    let rx = handle.submit(Command::get_parameter(parameter));
    let responses = await_reply(&rx, instruments, readings, alarms)?;
    responses.first().and_then(|r| parameter.decode_value(r))
}

/// Reconcile every configured device-side parameter with the device.
///
/// Each disagreement is corrected with a set-command and verified with a
/// follow-up read. Failures are logged and counted, never fatal: the caller
/// keeps running in degraded mode and the daily sync duty tries again.
pub fn reconcile(
    handle: &EngineHandle,
    instruments: &mut Instruments,
    readings: &Receiver<Reading>,
    watchdog_period: f64,
) -> SyncReport {
    let mut jobs: Vec<(&'static str, &'static DeviceParameter, f64)> = instruments
        .iter()
        .flat_map(|instrument| {
            let label = instrument.kind().label();
            instrument
                .configured_parameters()
                .iter()
                .map(move |(parameter, value)| (label, *parameter, *value))
                .collect::<Vec<_>>()
        })
        .collect();
    jobs.push(("watchdog", &WATCHDOG_PERIOD, watchdog_period));

    let mut report = SyncReport::default();
    let mut alarms = Vec::new();
    for (label, parameter, configured) in jobs {
        report.checked += 1;
        let device = match read_value(handle, parameter, instruments, readings, &mut alarms) {
            Some(value) => value,
            None => {
                warn!("sync: could not read {}.{}", label, parameter.name);
                report.failed += 1;
                continue;
            }
        };
        if parameter.agrees(device, configured) {
            debug!(
                "sync: {}.{} already {} {}",
                label, parameter.name, device, parameter.units
            );
            continue;
        }
        info!(
            "sync: {}.{} is {} {}, setting {}",
            label, parameter.name, device, parameter.units, configured
        );
        let rx = handle.submit(Command::set_parameter(parameter, configured));
        if await_reply(&rx, instruments, readings, &mut alarms).is_none() {
            warn!("sync: set of {}.{} got no echo", label, parameter.name);
            report.failed += 1;
            continue;
        }
        match read_value(handle, parameter, instruments, readings, &mut alarms) {
            Some(verified) if parameter.agrees(verified, configured) => {
                report.corrected += 1;
            }
            Some(verified) => {
                warn!(
                    "sync: {}.{} reads back {} after setting {}",
                    label, parameter.name, verified, configured
                );
                report.failed += 1;
            }
            None => {
                warn!("sync: could not verify {}.{}", label, parameter.name);
                report.failed += 1;
            }
        }
    }
    report.alarms = alarms;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::CommandJob;
    use crate::instruments::{Instrument, InstrumentKind, PublishPolicy};
    use std::io::Write;
    use std::sync::mpsc;

    /// A device stub answering parameter traffic on the engine channel.
    fn spawn_device(rx: mpsc::Receiver<CommandJob>, mut height: f64) {
        std::thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                let request = job.command.request.clone();
                let response = if request == "(m)" {
                    format!("(M{:04})", height as u32)
                } else if request.starts_with("(M") {
                    // Set: accept the value and echo.
                    height = request[2..6].parse::<f64>().unwrap_or(height);
                    request.clone()
                } else if request == "(k)" {
                    "(K200)".to_string()
                } else {
                    request.clone()
                };
                let _ = job.reply.send(Ok(vec![response]));
            }
        });
    }

    fn barometer_only() -> Instruments {
        let height = InstrumentKind::Barometer
            .parameters()
            .iter()
            .find(|p| p.name == "height")
            .expect("height parameter exists");
        Instruments::new(vec![Instrument::new(
            InstrumentKind::Barometer,
            PublishPolicy::default(),
            vec![(height, 700.0)],
        )])
    }

    #[test]
    fn mismatch_is_set_and_verified() {
        let (job_tx, job_rx) = mpsc::channel();
        let (_reading_tx, reading_rx) = mpsc::channel();
        spawn_device(job_rx, 650.0);

        let handle = EngineHandle::new(job_tx);
        let mut instruments = barometer_only();
        let report = reconcile(&handle, &mut instruments, &reading_rx, 200.0);
        assert_eq!(report.checked, 2); // height + watchdog period
        assert_eq!(report.corrected, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn agreement_issues_no_set() {
        let (job_tx, job_rx) = mpsc::channel();
        let (_reading_tx, reading_rx) = mpsc::channel();
        spawn_device(job_rx, 700.0);

        let handle = EngineHandle::new(job_tx);
        let mut instruments = barometer_only();
        let report = reconcile(&handle, &mut instruments, &reading_rx, 200.0);
        assert_eq!(report.corrected, 0);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn dead_engine_degrades_gracefully() {
        let (job_tx, job_rx) = mpsc::channel();
        let (_reading_tx, reading_rx) = mpsc::channel();
        drop(job_rx);

        let handle = EngineHandle::new(job_tx);
        let mut instruments = barometer_only();
        let report = reconcile(&handle, &mut instruments, &reading_rx, 200.0);
        assert_eq!(report.failed, report.checked);
    }

    #[test]
    fn readings_are_folded_while_waiting() {
        let (job_tx, job_rx) = mpsc::channel();
        let (reading_tx, reading_rx) = mpsc::channel();
        spawn_device(job_rx, 700.0);

        let frame =
            "(C E 118 000 125 10132 09987 0000 000 100 46000 +185 530 +093 0000 000 270)";
        let reading = crate::protocol::status::decode(frame).expect("frame decodes");
        reading_tx.send(reading).expect("queue a reading");

        let handle = EngineHandle::new(job_tx);
        let mut instruments = barometer_only();
        reconcile(&handle, &mut instruments, &reading_rx, 200.0);
        let snaps = instruments.snapshot_all();
        let abs = snaps
            .iter()
            .find(|s| s.channel == "absolute_pressure")
            .expect("pressure channel exists");
        assert_eq!(abs.current, Some(1013.2));
    }

    // Keep the config-driven path honest end to end: a full config with a
    // configured barometer height flows into the jobs list.
    #[test]
    fn config_built_instruments_flow_into_sync() {
        let path = std::env::temp_dir().join(format!(
            "ema-gateway-sync-{}.ini",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).expect("create temp config");
        file.write_all(b"[serial]\nport = /dev/ttyUSB0\n[barometer]\nheight = 700\n")
            .expect("write temp config");
        drop(file);
        let cfg = Config::load(&path).expect("config loads");

        let (job_tx, job_rx) = mpsc::channel();
        let (_reading_tx, reading_rx) = mpsc::channel();
        spawn_device(job_rx, 650.0);

        let handle = EngineHandle::new(job_tx);
        let mut instruments = cfg.build_instruments();
        let report = reconcile(&handle, &mut instruments, &reading_rx, 200.0);
        assert_eq!(report.corrected, 1);
        let _ = std::fs::remove_file(path);
    }
}
