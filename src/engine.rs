// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::protocol::command::Command;
use crate::protocol::framer::Framer;
use crate::protocol::status::{self, Reading};

/// Why a submitted command did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Every transmission ran out its deadline
    #[error("command timed out after {attempts} transmissions")]
    TimedOut { attempts: u32 },
}

/// What a requester gets back: the collected responses, in pattern order.
pub type CommandResult = Result<Vec<String>, CommandError>;

/// A command together with the channel its outcome travels back on.
pub struct CommandJob {
    pub command: Command,
    pub reply: Sender<CommandResult>,
}

/// Engine condition mirrored to observers on the events topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub level: &'static str,
    pub message: String,
}

/// Cloneable submission side of the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<CommandJob>,
}

impl EngineHandle {
    pub fn new(tx: Sender<CommandJob>) -> EngineHandle {
        EngineHandle { tx }
    }

    /// Queue a command; the returned receiver resolves with its outcome.
    /// If the engine is gone the receiver reads as disconnected.
    pub fn submit(&self, command: Command) -> Receiver<CommandResult> {
        let (reply, rx) = std::sync::mpsc::channel();
        if let Err(e) = self.tx.send(CommandJob { command, reply }) {
            debug!("engine is gone, dropping command {}", e.0.command.name);
        }
        rx
    }
}

/// Knobs of the protocol engine.
pub struct EngineSettings {
    /// Minimum spacing between two writes to the device
    pub write_pace: Duration,
    /// Concurrent in-flight command ceiling
    pub max_inflight: usize,
    /// Consecutive unrecognizable frames before the framer buffer is reset
    pub desync_limit: u32,
    /// Consecutive resets (without any valid frame) before giving up
    pub reset_limit: u32,
}

impl Default for EngineSettings {
    fn default() -> EngineSettings {
        EngineSettings {
            write_pace: Duration::from_secs(1),
            max_inflight: 2,
            desync_limit: 10,
            reset_limit: 5,
        }
    }
}

struct Inflight {
    id: u64,
    job: CommandJob,
    index: usize,
    collected: Vec<String>,
    attempts: u32,
    /// Armed when the request bytes hit the wire; `None` while queued for
    /// (re)transmission.
    deadline: Option<Instant>,
}

impl Inflight {
    fn new(id: u64, job: CommandJob) -> Inflight {
        Inflight {
            id,
            job,
            index: 0,
            collected: Vec::new(),
            attempts: 0,
            deadline: None,
        }
    }
}

/// The serial protocol engine: sole owner of the serial link, the framer and
/// the in-flight command list.
///
/// Every inbound frame is offered to the in-flight commands in submission
/// order first; the frame that none of them expects is a status bulletin (or
/// garbage, which counts toward desync). Outbound requests flow through a
/// FIFO observing the device's 1-second write pacing.
pub struct Engine<L: Read + Write> {
    link: L,
    framer: Framer,
    settings: EngineSettings,
    jobs: Receiver<CommandJob>,
    readings: Sender<Reading>,
    bulletin_tap: Option<Sender<String>>,
    event_tap: Option<Sender<EngineEvent>>,
    capture: Option<BufWriter<File>>,
    backlog: VecDeque<Inflight>,
    inflight: Vec<Inflight>,
    write_queue: VecDeque<u64>,
    next_id: u64,
    last_write: Option<Instant>,
    desync: u32,
    resets: u32,
}

impl<L: Read + Write> Engine<L> {
    pub fn new(
        link: L,
        settings: EngineSettings,
        jobs: Receiver<CommandJob>,
        readings: Sender<Reading>,
    ) -> Engine<L> {
        Engine {
            link,
            framer: Framer::new(),
            settings,
            jobs,
            readings,
            bulletin_tap: None,
            event_tap: None,
            capture: None,
            backlog: VecDeque::new(),
            inflight: Vec::new(),
            write_queue: VecDeque::new(),
            next_id: 0,
            last_write: None,
            desync: 0,
            resets: 0,
        }
    }

    /// Replicate raw bulletin lines to an extra consumer (multicast).
    pub fn with_bulletin_tap(mut self, tx: Sender<String>) -> Engine<L> {
        self.bulletin_tap = Some(tx);
        self
    }

    /// Mirror engine conditions (desync resets) to an events consumer.
    pub fn with_event_tap(mut self, tx: Sender<EngineEvent>) -> Engine<L> {
        self.event_tap = Some(tx);
        self
    }

    /// Append every inbound frame to a capture file, one per line.
    pub fn with_capture(mut self, file: File) -> Engine<L> {
        self.capture = Some(BufWriter::new(file));
        self
    }

    /// Consume the engine and pump it until every requester is gone or the
    /// link dies.
    pub fn run(mut self) -> Result<(), Error> {
        info!("protocol engine started");
        loop {
            if !self.admit() {
                info!("all requesters gone, engine stopping");
                return Ok(());
            }
            self.promote();
            self.service_write(Instant::now())?;
            let frames = self.read_chunk()?;
            for frame in frames {
                self.record(&frame);
                if !self.handle_frame(&frame) {
                    info!("reading consumer gone, engine stopping");
                    return Ok(());
                }
            }
            if self.resets >= self.settings.reset_limit {
                return Err(Error::Desync(format!(
                    "{} framer resets without a single valid frame",
                    self.resets
                )));
            }
            self.check_timeouts(Instant::now());
        }
    }

    /// Pull newly submitted jobs into the backlog. Returns false when every
    /// handle is gone and nothing remains to finish.
    fn admit(&mut self) -> bool {
        loop {
            match self.jobs.try_recv() {
                Ok(job) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.backlog.push_back(Inflight::new(id, job));
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    return !(self.inflight.is_empty() && self.backlog.is_empty());
                }
            }
        }
    }

    /// Move backlog entries into the in-flight list up to the ceiling.
    fn promote(&mut self) {
        while self.inflight.len() < self.settings.max_inflight {
            match self.backlog.pop_front() {
                Some(entry) => {
                    self.write_queue.push_back(entry.id);
                    self.inflight.push(entry);
                }
                None => break,
            }
        }
    }

    /// Transmit at most one queued request, respecting the write pace.
    /// Arms the command's deadline at the moment its bytes are written.
    fn service_write(&mut self, now: Instant) -> Result<(), Error> {
        let due = match self.last_write {
            Some(t) => now.saturating_duration_since(t) >= self.settings.write_pace,
            None => true,
        };
        if !due {
            return Ok(());
        }
        let id = match self.write_queue.pop_front() {
            Some(id) => id,
            None => return Ok(()),
        };
        // The command may have completed while its retransmission waited.
        let entry = match self.inflight.iter_mut().find(|c| c.id == id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        self.link.write_all(entry.job.command.request.as_bytes())?;
        self.link.write_all(b"\r\n")?;
        self.link.flush()?;
        debug!("→ {}", entry.job.command.request);
        entry.attempts += 1;
        entry.deadline = Some(now + entry.job.command.timeout);
        self.last_write = Some(now);
        Ok(())
    }

    /// Read whatever the link has and return the frames it completed.
    fn read_chunk(&mut self) -> Result<Vec<String>, Error> {
        let mut buf = [0u8; 256];
        match self.link.read(&mut buf) {
            Ok(0) => Ok(Vec::new()),
            Ok(n) => Ok(self.framer.push(&buf[..n])),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn record(&mut self, frame: &str) {
        if let Some(capture) = self.capture.as_mut() {
            if writeln!(capture, "{}", frame).and_then(|_| capture.flush()).is_err() {
                warn!("capture file write failed, disabling capture");
                self.capture = None;
            }
        }
    }

    /// Route one frame: in-flight commands first (insertion order,
    /// first-submitted wins), then the status decoder. Returns false when
    /// the reading consumer disappeared.
    fn handle_frame(&mut self, frame: &str) -> bool {
        debug!("← {}", frame);
        let mut matched = None;
        for (pos, entry) in self.inflight.iter_mut().enumerate() {
            if entry.attempts == 0 {
                // Not transmitted yet; the device cannot be answering it.
                continue;
            }
            if entry.job.command.responses[entry.index].is_match(frame) {
                entry.collected.push(frame.to_string());
                entry.index += 1;
                matched = Some(pos);
                break;
            }
        }
        if let Some(pos) = matched {
            self.desync = 0;
            self.resets = 0;
            if self.inflight[pos].index == self.inflight[pos].job.command.responses.len() {
                let entry = self.inflight.remove(pos);
                if entry.job.reply.send(Ok(entry.collected)).is_err() {
                    debug!("requester of {} went away", entry.job.command.name);
                }
            }
            return true;
        }
        if let Some(reading) = status::decode(frame) {
            self.desync = 0;
            self.resets = 0;
            let tap_gone = match &self.bulletin_tap {
                Some(tap) => tap.send(frame.to_string()).is_err(),
                None => false,
            };
            if tap_gone {
                self.bulletin_tap = None;
            }
            return self.readings.send(reading).is_ok();
        }
        self.desync += 1;
        if self.desync >= self.settings.desync_limit {
            error!(
                "{} consecutive unrecognizable frames, resetting framer",
                self.desync
            );
            let message = format!(
                "protocol desync: framer reset after {} unrecognizable frames",
                self.desync
            );
            self.framer.reset();
            self.desync = 0;
            self.resets += 1;
            self.notify("error", message);
        }
        true
    }

    /// Hand an engine condition to the events consumer, if any.
    fn notify(&mut self, level: &'static str, message: String) {
        let tap_gone = match &self.event_tap {
            Some(tap) => tap.send(EngineEvent { level, message }).is_err(),
            None => false,
        };
        if tap_gone {
            self.event_tap = None;
        }
    }

    /// Expire overdue commands: requeue while retries remain, fail after.
    fn check_timeouts(&mut self, now: Instant) {
        let mut pos = 0;
        while pos < self.inflight.len() {
            let overdue = match self.inflight[pos].deadline {
                Some(deadline) => now >= deadline,
                None => false,
            };
            if !overdue {
                pos += 1;
                continue;
            }
            let entry = &mut self.inflight[pos];
            if entry.attempts <= entry.job.command.retries {
                debug!(
                    "{} timed out, retransmitting (attempt {} of {})",
                    entry.job.command.name,
                    entry.attempts + 1,
                    entry.job.command.retries + 1
                );
                entry.deadline = None;
                entry.index = 0;
                entry.collected.clear();
                self.write_queue.push_back(entry.id);
                pos += 1;
            } else {
                let entry = self.inflight.remove(pos);
                warn!(
                    "{} failed after {} transmissions",
                    entry.job.command.name, entry.attempts
                );
                let _ = entry
                    .job
                    .reply
                    .send(Err(CommandError::TimedOut {
                        attempts: entry.attempts,
                    }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// In-memory stand-in for the serial port.
    struct FakeLink {
        inbound: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl FakeLink {
        fn new() -> FakeLink {
            FakeLink {
                inbound: VecDeque::new(),
                written: Vec::new(),
            }
        }
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let mut n = 0;
            while n < buf.len() {
                match self.inbound.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const BULLETIN: &str =
        "(C E 118 000 125 10132 09987 0000 000 100 46000 +185 530 +093 0000 000 270)";

    fn test_engine(
        max_inflight: usize,
    ) -> (
        Engine<FakeLink>,
        EngineHandle,
        mpsc::Receiver<Reading>,
    ) {
        let (job_tx, job_rx) = mpsc::channel();
        let (reading_tx, reading_rx) = mpsc::channel();
        let settings = EngineSettings {
            max_inflight,
            ..EngineSettings::default()
        };
        let engine = Engine::new(FakeLink::new(), settings, job_rx, reading_tx);
        (engine, EngineHandle::new(job_tx), reading_rx)
    }

    fn written_lines(engine: &Engine<FakeLink>) -> Vec<String> {
        String::from_utf8_lossy(&engine.link.written)
            .split("\r\n")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn command_completes_under_status_storm() {
        let (mut engine, handle, readings) = test_engine(2);
        let reply = handle.submit(Command::aux_status());
        let t0 = Instant::now();

        engine.admit();
        engine.promote();
        engine.service_write(t0).unwrap();
        assert_eq!(written_lines(&engine), vec!["(s)".to_string()]);

        // Responses arrive interleaved with a storm of bulletins.
        for frame in [
            BULLETIN, BULLETIN, "(S009)", BULLETIN, "(Son2030)", BULLETIN, BULLETIN,
            "(Sof0600)", BULLETIN,
        ] {
            assert!(engine.handle_frame(frame));
        }

        let responses = reply.try_recv().expect("command resolved").expect("done");
        assert_eq!(responses, vec!["(S009)", "(Son2030)", "(Sof0600)"]);
        // Every bulletin was decoded and delivered in order.
        assert_eq!(readings.try_iter().count(), 6);
        assert!(engine.inflight.is_empty());
    }

    #[test]
    fn out_of_order_responses_do_not_match() {
        let (mut engine, handle, _readings) = test_engine(2);
        let reply = handle.submit(Command::aux_status());
        engine.admit();
        engine.promote();
        engine.service_write(Instant::now()).unwrap();

        // Off-time before mode: neither frame is the currently expected one,
        // so both count as unrecognizable, and the command stays in flight.
        engine.handle_frame("(Sof0600)");
        assert_eq!(engine.inflight[0].index, 0);
        engine.handle_frame("(S009)");
        assert_eq!(engine.inflight[0].index, 1);
        assert!(reply.try_recv().is_err());
    }

    #[test]
    fn retry_then_succeed() {
        let (mut engine, handle, _readings) = test_engine(2);
        let reply = handle.submit(Command::roof_open());
        let t0 = Instant::now();

        engine.admit();
        engine.promote();
        engine.service_write(t0).unwrap();
        assert_eq!(engine.inflight[0].attempts, 1);

        // First deadline passes silently.
        engine.check_timeouts(t0 + Duration::from_secs(4));
        engine.service_write(t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(engine.inflight[0].attempts, 2);

        // Second deadline passes too.
        engine.check_timeouts(t0 + Duration::from_secs(8));
        engine.service_write(t0 + Duration::from_secs(8)).unwrap();
        assert_eq!(engine.inflight[0].attempts, 3);

        // The third transmission finally gets its echo.
        assert!(engine.handle_frame("(X007)"));
        let responses = reply.try_recv().expect("resolved").expect("done");
        assert_eq!(responses, vec!["(X007)"]);
        assert_eq!(written_lines(&engine).len(), 3);
    }

    #[test]
    fn failed_command_was_transmitted_exactly_retries_plus_one_times() {
        let (mut engine, handle, _readings) = test_engine(2);
        let reply = handle.submit(Command::roof_close());
        let t0 = Instant::now();

        engine.admit();
        engine.promote();
        for i in 0..3u64 {
            engine
                .service_write(t0 + Duration::from_secs(4 * i))
                .unwrap();
            engine.check_timeouts(t0 + Duration::from_secs(4 * (i + 1)));
        }

        match reply.try_recv().expect("resolved") {
            Err(CommandError::TimedOut { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(written_lines(&engine).len(), 3);
        assert!(engine.inflight.is_empty());
    }

    #[test]
    fn writes_observe_the_pace() {
        let (mut engine, handle, _readings) = test_engine(2);
        let _r1 = handle.submit(Command::watchdog_ping());
        let _r2 = handle.submit(Command::roof_open());
        let t0 = Instant::now();

        engine.admit();
        engine.promote();
        engine.service_write(t0).unwrap();
        assert_eq!(written_lines(&engine).len(), 1);
        engine.service_write(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(written_lines(&engine).len(), 1);
        engine.service_write(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(written_lines(&engine).len(), 2);
    }

    #[test]
    fn first_submitted_wins_ties() {
        let (mut engine, handle, _readings) = test_engine(2);
        let first = handle.submit(Command::watchdog_ping());
        let second = handle.submit(Command::watchdog_ping());
        let t0 = Instant::now();

        engine.admit();
        engine.promote();
        engine.service_write(t0).unwrap();
        engine.service_write(t0 + Duration::from_secs(1)).unwrap();

        engine.handle_frame("(r)");
        assert!(first.try_recv().expect("first resolved").is_ok());
        assert!(second.try_recv().is_err());
        engine.handle_frame("(r)");
        assert!(second.try_recv().expect("second resolved").is_ok());
    }

    #[test]
    fn inflight_ceiling_is_respected() {
        let (mut engine, handle, _readings) = test_engine(1);
        let _r1 = handle.submit(Command::watchdog_ping());
        let _r2 = handle.submit(Command::roof_open());

        engine.admit();
        engine.promote();
        assert_eq!(engine.inflight.len(), 1);
        assert_eq!(engine.backlog.len(), 1);

        engine.service_write(Instant::now()).unwrap();
        engine.handle_frame("(r)");
        engine.promote();
        assert_eq!(engine.inflight.len(), 1);
        assert_eq!(engine.inflight[0].job.command.name, "roof open");
    }

    #[test]
    fn garbage_run_resets_the_framer() {
        let (mut engine, _handle, _readings) = test_engine(2);
        for _ in 0..9 {
            engine.handle_frame("not a frame");
        }
        assert_eq!(engine.resets, 0);
        engine.handle_frame("not a frame");
        assert_eq!(engine.resets, 1);
        assert_eq!(engine.desync, 0);

        // A valid bulletin clears the reset streak.
        engine.handle_frame(BULLETIN);
        assert_eq!(engine.resets, 0);
    }

    #[test]
    fn desync_reset_is_mirrored_to_the_event_tap() {
        let (mut engine, _handle, _readings) = test_engine(2);
        let (event_tx, event_rx) = mpsc::channel();
        engine.event_tap = Some(event_tx);
        for _ in 0..10 {
            engine.handle_frame("not a frame");
        }
        let event = event_rx.try_recv().expect("reset event was mirrored");
        assert_eq!(event.level, "error");
        assert!(event.message.contains("desync"));
        assert!(event_rx.try_recv().is_err());
    }

    #[test]
    fn untransmitted_command_never_consumes_frames() {
        let (mut engine, handle, _readings) = test_engine(2);
        let reply = handle.submit(Command::watchdog_ping());
        engine.admit();
        engine.promote();
        // Request not written yet; a stray echo must not complete it.
        engine.handle_frame("(r)");
        assert!(reply.try_recv().is_err());
        assert_eq!(engine.inflight[0].index, 0);
    }

    #[test]
    fn retransmission_restarts_response_collection() {
        let (mut engine, handle, _readings) = test_engine(2);
        let reply = handle.submit(Command::aux_status());
        let t0 = Instant::now();

        engine.admit();
        engine.promote();
        engine.service_write(t0).unwrap();
        engine.handle_frame("(S009)");
        assert_eq!(engine.inflight[0].index, 1);

        // Deadline passes with a partial answer; collection starts over.
        engine.check_timeouts(t0 + Duration::from_secs(4));
        assert_eq!(engine.inflight[0].index, 0);
        engine.service_write(t0 + Duration::from_secs(4)).unwrap();
        for frame in ["(S009)", "(Son2030)", "(Sof0600)"] {
            engine.handle_frame(frame);
        }
        let responses = reply.try_recv().expect("resolved").expect("done");
        assert_eq!(responses.len(), 3);
    }
}
