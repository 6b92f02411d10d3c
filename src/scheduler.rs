// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use chrono::{DateTime, TimeZone, Utc};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use crate::config::{AuxMode, Config};
use crate::engine::{CommandError, CommandResult, EngineEvent, EngineHandle};
use crate::instruments::{Instruments, LowVoltage};
use crate::protocol::command::{self, Command};
use crate::protocol::status::Reading;
use crate::publisher::{HistoricKind, Publisher};
use crate::rtc::{self, Master};
use crate::scripts::{self, ScriptLauncher};
use crate::sync;
use crate::tod::{TodEvent, TodState};

const TOD_PERIOD: Duration = Duration::from_secs(60);
const RELOAD_PERIOD: Duration = Duration::from_secs(60);
const SYNC_PERIOD: Duration = Duration::from_secs(24 * 3600);
const LOOP_SLICE: Duration = Duration::from_millis(250);
const INTERNET_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Host shutdown leads the end of its window by this margin.
const POWEROFF_LEAD_MINUTES: u16 = 2;

/// Which duty a pending command outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Duty {
    Watchdog,
    RtcRead,
    RtcSet,
    HistoricMinmax,
    HistoricAverages,
    AuxOn,
    AuxOff,
    AuxProgram,
}

impl Duty {
    fn name(self) -> &'static str {
        match self {
            Duty::Watchdog => "watchdog ping",
            Duty::RtcRead => "rtc read",
            Duty::RtcSet => "rtc set",
            Duty::HistoricMinmax => "historic minmax pull",
            Duty::HistoricAverages => "historic averages pull",
            Duty::AuxOn => "aux relay on",
            Duty::AuxOff => "aux relay off",
            Duty::AuxProgram => "aux relay programming",
        }
    }
}

struct Pending {
    duty: Duty,
    rx: Receiver<CommandResult>,
}

/// Single-threaded cooperative loop driving the periodic duties.
///
/// Sole owner of the instruments, the TOD/RTC state and the script
/// launchers; readings arrive in order from the engine and duties submit
/// commands without blocking, collecting outcomes on later ticks. A duty
/// whose previous command is still in flight is skipped, not duplicated.
pub struct Scheduler {
    cfg: Config,
    handle: EngineHandle,
    readings: Receiver<Reading>,
    engine_events: Receiver<EngineEvent>,
    publisher: Publisher,
    instruments: Instruments,
    roof_launcher: ScriptLauncher,
    volt_launcher: ScriptLauncher,
    tod: TodState,
    pending: Vec<Pending>,
    next_upload: Instant,
    next_watchdog: Instant,
    next_rtc: Instant,
    next_tod: Instant,
    next_reload: Instant,
    next_sync: Instant,
    poweroff_at: Option<DateTime<Utc>>,
    last_roof: Option<char>,
    last_aux: Option<char>,
    relays: (char, char),
}

impl Scheduler {
    pub fn new(
        cfg: Config,
        handle: EngineHandle,
        readings: Receiver<Reading>,
        engine_events: Receiver<EngineEvent>,
        publisher: Publisher,
    ) -> Scheduler {
        let now = Instant::now();
        let instruments = cfg.build_instruments();
        let roof_launcher =
            ScriptLauncher::new(cfg.roof_script.path.clone(), cfg.roof_script.mode);
        let volt_launcher =
            ScriptLauncher::new(cfg.low_volt_script.path.clone(), cfg.low_volt_script.mode);
        Scheduler {
            next_upload: now + cfg.upload_period,
            next_watchdog: now,
            next_rtc: now + cfg.rtc_period,
            next_tod: now,
            next_reload: now + RELOAD_PERIOD,
            next_sync: now + SYNC_PERIOD,
            cfg,
            handle,
            readings,
            engine_events,
            publisher,
            instruments,
            roof_launcher,
            volt_launcher,
            tod: TodState::new(),
            pending: Vec::new(),
            poweroff_at: None,
            last_roof: None,
            last_aux: None,
            relays: ('C', 'e'),
        }
    }

    /// Startup duties, then the loop; returns when the engine goes away.
    pub fn run(mut self) {
        info!("scheduler started");
        self.publisher.publish_register(self.instruments.inventory());
        if self.cfg.sync {
            self.run_sync();
        }
        self.program_aux_times();
        self.submit_duty(Duty::RtcRead, Command::rtc_get());

        loop {
            match self.readings.recv_timeout(LOOP_SLICE) {
                Ok(reading) => self.on_reading(reading),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("engine stopped, scheduler exiting");
                    return;
                }
            }
            self.tick(Instant::now(), Utc::now());
        }
    }

    fn run_sync(&mut self) {
        let report = sync::reconcile(
            &self.handle,
            &mut self.instruments,
            &self.readings,
            self.cfg.keepalive.as_secs() as f64,
        );
        info!(
            "parameter sync: {} checked, {} corrected, {} failed",
            report.checked, report.corrected, report.failed
        );
        if report.degraded() {
            self.publisher.publish_event(
                "warning",
                &format!(
                    "parameter sync degraded: {} of {} parameters failed",
                    report.failed, report.checked
                ),
            );
        }
        for alarm in report.alarms {
            self.on_low_voltage(alarm);
        }
    }

    /// In Timed mode the device itself drives the aux relay; program its
    /// on/off times from the first time-of-day window.
    fn program_aux_times(&mut self) {
        if self.cfg.aux_mode != AuxMode::Timed || self.cfg.windows.is_empty() {
            return;
        }
        let window = self.cfg.windows.interval(0);
        info!(
            "programming aux relay times {:02}:{:02}-{:02}:{:02}",
            window.start / 60,
            window.start % 60,
            window.end / 60,
            window.end % 60
        );
        let commands = [
            Command::aux_timed_mode(),
            Command::aux_set_on_time(u32::from(window.start / 60), u32::from(window.start % 60)),
            Command::aux_set_off_time(u32::from(window.end / 60), u32::from(window.end % 60)),
        ];
        for command in commands {
            let rx = self.handle.submit(command);
            self.pending.push(Pending {
                duty: Duty::AuxProgram,
                rx,
            });
        }
    }

    /// Fold one reading in: relay tracking, accumulators, low-voltage watch.
    fn on_reading(&mut self, reading: Reading) {
        self.track_relays(&reading);
        if let Some(alarm) = self.instruments.update(&reading) {
            self.on_low_voltage(alarm);
        }
    }

    fn track_relays(&mut self, reading: &Reading) {
        if let Some(previous) = self.last_roof {
            if previous != reading.roof_relay {
                let reason = match reading.roof_relay {
                    'O' => "roof relay open",
                    'C' => "roof relay closed",
                    _ => "roof relay changed",
                };
                info!("{} ({} -> {})", reason, previous, reading.roof_relay);
                self.publisher.publish_event("info", reason);
                self.roof_launcher
                    .launch(&scripts::roof_args(reading.roof_relay, reason));
            }
        }
        if let Some(previous) = self.last_aux {
            if previous != reading.aux_relay {
                info!("aux relay {} -> {}", previous, reading.aux_relay);
                self.publisher.publish_event(
                    "info",
                    &format!("aux relay {} -> {}", previous, reading.aux_relay),
                );
            }
        }
        self.last_roof = Some(reading.roof_relay);
        self.last_aux = Some(reading.aux_relay);
        self.relays = (reading.roof_relay, reading.aux_relay);
    }

    fn on_low_voltage(&mut self, alarm: LowVoltage) {
        warn!(
            "low voltage: average {:.2} V under {:.2} V over {} samples",
            alarm.average, alarm.threshold, alarm.samples
        );
        self.publisher.publish_event(
            "warning",
            &format!(
                "low voltage: average {:.2} V under {:.2} V over {} samples",
                alarm.average, alarm.threshold, alarm.samples
            ),
        );
        self.volt_launcher.launch(&scripts::low_volt_args(
            alarm.average,
            alarm.threshold,
            alarm.samples,
        ));
    }

    /// One cooperative tick: collect outcomes, then run whatever is due.
    fn tick(&mut self, now: Instant, utc: DateTime<Utc>) {
        self.poll_engine_events();
        self.poll_pending();
        self.roof_launcher.reap();
        self.volt_launcher.reap();

        if now >= self.next_upload {
            self.next_upload = now + self.cfg.upload_period;
            let snapshots = self.instruments.snapshot_all();
            self.publisher.publish_state(&snapshots, self.relays);
        }
        if now >= self.next_watchdog {
            self.next_watchdog = now + self.cfg.keepalive / 2;
            self.submit_duty(Duty::Watchdog, Command::watchdog_ping());
        }
        if now >= self.next_rtc {
            self.next_rtc = now + self.cfg.rtc_period;
            self.submit_duty(Duty::RtcRead, Command::rtc_get());
        }
        if now >= self.next_tod {
            self.next_tod = now + TOD_PERIOD;
            self.tod_duty(utc);
        }
        if now >= self.next_reload {
            self.next_reload = now + RELOAD_PERIOD;
            self.reload_duty();
        }
        if now >= self.next_sync {
            self.next_sync = now + SYNC_PERIOD;
            if self.cfg.sync {
                self.run_sync();
            }
        }
        if let Some(at) = self.poweroff_at {
            if utc >= at {
                self.poweroff_at = None;
                self.poweroff();
            }
        }
    }

    /// Submit a duty command unless the previous one is still unresolved.
    fn submit_duty(&mut self, duty: Duty, command: Command) {
        if self.pending.iter().any(|p| p.duty == duty) {
            debug!("{} still in flight, skipping this period", duty.name());
            return;
        }
        let rx = self.handle.submit(command);
        self.pending.push(Pending { duty, rx });
    }

    /// Mirror engine conditions (desync resets) onto the events topic.
    fn poll_engine_events(&mut self) {
        while let Ok(event) = self.engine_events.try_recv() {
            self.publisher.publish_event(event.level, &event.message);
        }
    }

    fn poll_pending(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            match self.pending[i].rx.try_recv() {
                Ok(result) => {
                    let entry = self.pending.remove(i);
                    self.complete(entry.duty, result);
                }
                Err(TryRecvError::Empty) => i += 1,
                Err(TryRecvError::Disconnected) => {
                    let entry = self.pending.remove(i);
                    warn!("{} lost its engine", entry.duty.name());
                }
            }
        }
    }

    fn complete(&mut self, duty: Duty, result: CommandResult) {
        match result {
            Ok(responses) => self.complete_ok(duty, responses),
            Err(CommandError::TimedOut { attempts }) => {
                warn!("{} failed after {} transmissions", duty.name(), attempts);
                if duty == Duty::Watchdog {
                    self.publisher
                        .publish_event("warning", "watchdog keep-alive failed");
                }
            }
        }
    }

    fn complete_ok(&mut self, duty: Duty, responses: Vec<String>) {
        match duty {
            Duty::Watchdog => debug!("watchdog keep-alive acknowledged"),
            Duty::RtcRead => self.rtc_check(&responses),
            Duty::RtcSet => info!("device clock set from host"),
            Duty::HistoricMinmax => {
                info!("historic minmax: {} entries", responses.len());
                self.publisher
                    .publish_historic(HistoricKind::MinMax, &responses);
            }
            Duty::HistoricAverages => {
                info!("historic averages: {} entries", responses.len());
                self.publisher
                    .publish_historic(HistoricKind::Average, &responses);
            }
            Duty::AuxOn => info!("aux relay asserted"),
            Duty::AuxOff => info!("aux relay de-asserted"),
            Duty::AuxProgram => debug!("aux relay time accepted"),
        }
    }

    /// Compare device and host clocks and discipline the slave side.
    fn rtc_check(&mut self, responses: &[String]) {
        let device_time = match responses.first().and_then(|r| command::parse_rtc(r)) {
            Some(time) => time,
            None => {
                warn!("rtc read returned an unparseable time");
                return;
            }
        };
        let host_time = Utc::now();
        let skew = (device_time - host_time).num_seconds().abs() as u64;
        if skew <= self.cfg.rtc_delta.as_secs() {
            debug!("clocks agree within {} s", skew);
            return;
        }
        // A host with its own RTC never needs the probe.
        let internet = !self.cfg.host_rtc
            && rtc::internet_reachable(&self.cfg.probe_addr, INTERNET_PROBE_TIMEOUT);
        match rtc::select_master(self.cfg.host_rtc, internet) {
            Master::Host => {
                info!("device clock is {} s off, setting from host", skew);
                self.submit_duty(Duty::RtcSet, Command::rtc_set(Utc::now()));
            }
            Master::Device => {
                info!("host clock is {} s off, setting from device", skew);
                rtc::set_host_clock(&self.cfg.host_clock_cmd, device_time);
            }
        }
    }

    /// Evaluate the time-of-day windows and drive their side effects.
    fn tod_duty(&mut self, utc: DateTime<Utc>) {
        if self.cfg.windows.is_empty() {
            return;
        }
        match self.tod.evaluate(&self.cfg.windows, utc) {
            Some(TodEvent::Activated(index)) => {
                info!("time-of-day window {} active", index);
                self.publisher
                    .publish_event("info", "time-of-day window active");
                if self.cfg.aux_mode != AuxMode::Never {
                    self.submit_duty(Duty::AuxOn, Command::aux_force_on());
                }
                if self.tod.take_pull(index) {
                    self.submit_duty(Duty::HistoricMinmax, Command::historic_minmax());
                    self.submit_duty(Duty::HistoricAverages, Command::historic_averages());
                }
                if self.cfg.tod_poweroff {
                    self.schedule_poweroff(index, utc);
                }
            }
            Some(TodEvent::Deactivated(index)) => {
                info!("time-of-day window {} over", index);
                self.publisher
                    .publish_event("info", "time-of-day window over");
                if self.cfg.aux_mode != AuxMode::Never {
                    self.submit_duty(Duty::AuxOff, Command::aux_force_off());
                }
            }
            None => {}
        }
    }

    fn schedule_poweroff(&mut self, index: usize, utc: DateTime<Utc>) {
        let end = self.cfg.windows.interval(index).end;
        let minute = end.saturating_sub(POWEROFF_LEAD_MINUTES);
        let at = match utc
            .date_naive()
            .and_hms_opt(u32::from(minute / 60), u32::from(minute % 60), 0)
        {
            Some(naive) => Utc.from_utc_datetime(&naive),
            None => return,
        };
        if at <= utc {
            debug!("window too far gone to schedule a poweroff");
            return;
        }
        info!("host poweroff scheduled for {}", at);
        self.poweroff_at = Some(at);
    }

    fn poweroff(&mut self) {
        warn!("time-of-day window ending, powering the host off");
        self.publisher
            .publish_event("warning", "host poweroff initiated");
        let mut parts = self.cfg.poweroff_cmd.split_whitespace();
        if let Some(program) = parts.next() {
            if let Err(e) = std::process::Command::new(program).args(parts).spawn() {
                warn!("could not run poweroff command: {}", e);
            }
        }
    }

    /// Re-read the configuration file when it changed and fold the
    /// reloadable sections into the running components.
    fn reload_duty(&mut self) {
        match self.cfg.reload() {
            Ok(false) => {}
            Ok(true) => {
                info!("configuration reloaded");
                for settings in self.cfg.instruments.clone() {
                    for instrument in self.instruments.iter_mut() {
                        if instrument.kind() == settings.kind {
                            instrument.set_policy(settings.policy);
                            instrument.set_configured_parameters(settings.configured.clone());
                        }
                    }
                }
                for instrument in self.instruments.iter_mut() {
                    if instrument.kind() == crate::instruments::InstrumentKind::Voltmeter {
                        instrument.configure_volt_watch(
                            self.cfg.voltmeter.time,
                            self.cfg.voltmeter.threshold + self.cfg.voltmeter.delta,
                        );
                    }
                }
                self.roof_launcher.reconfigure(
                    self.cfg.roof_script.path.clone(),
                    self.cfg.roof_script.mode,
                );
                self.volt_launcher.reconfigure(
                    self.cfg.low_volt_script.path.clone(),
                    self.cfg.low_volt_script.mode,
                );
                self.publisher
                    .publish_event("info", "configuration reloaded");
            }
            Err(e) => {
                warn!("configuration reload failed: {}", e);
                self.publisher
                    .publish_event("warning", "configuration reload failed");
            }
        }
    }
}
