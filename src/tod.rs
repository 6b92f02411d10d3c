// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use chrono::{DateTime, NaiveDate, Timelike, Utc};

/// Shortest total coverage accepted from the configured windows.
const MIN_COVERAGE_MINUTES: u16 = 15;

/// One `HH:MM-HH:MM` window as minutes of the UTC day, start < end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u16,
    pub end: u16,
}

/// The sorted, non-overlapping set of active intervals of a UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Windows {
    intervals: Vec<Interval>,
}

fn parse_minute(s: &str) -> Result<u16, String> {
    let mut parts = s.splitn(2, ':');
    let hour: u16 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| format!("bad hour in '{}'", s))?;
    let minute: u16 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| format!("bad minute in '{}'", s))?;
    if hour > 23 || minute > 59 {
        return Err(format!("time '{}' out of range", s));
    }
    Ok(hour * 60 + minute)
}

impl Windows {
    /// Parse a comma-separated interval list, e.g. `12:00-12:15,20:00-20:15`.
    ///
    /// An empty string yields an empty set (time-of-day features disabled).
    pub fn parse(spec: &str) -> Result<Windows, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Windows::default());
        }
        let mut intervals = Vec::new();
        for chunk in spec.split(',') {
            let chunk = chunk.trim();
            let mut ends = chunk.splitn(2, '-');
            let start = parse_minute(ends.next().unwrap_or(""))?;
            let end = parse_minute(ends.next().ok_or_else(|| format!("missing '-' in '{}'", chunk))?)?;
            if start >= end {
                return Err(format!("interval '{}' must have start < end", chunk));
            }
            intervals.push(Interval { start, end });
        }
        intervals.sort_by_key(|i| i.start);
        for pair in intervals.windows(2) {
            if pair[1].start < pair[0].end {
                return Err("intervals overlap".to_string());
            }
        }
        let coverage: u16 = intervals.iter().map(|i| i.end - i.start).sum();
        if coverage < MIN_COVERAGE_MINUTES {
            return Err(format!(
                "intervals cover {} minutes, need at least {}",
                coverage, MIN_COVERAGE_MINUTES
            ));
        }
        Ok(Windows { intervals })
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn interval(&self, index: usize) -> Interval {
        self.intervals[index]
    }

    /// Index of the interval containing this minute of the day, if any.
    pub fn active_at(&self, minute: u16) -> Option<usize> {
        self.intervals
            .iter()
            .position(|i| minute >= i.start && minute < i.end)
    }
}

/// Minute of the UTC day for an instant.
pub fn minute_of_day(time: &DateTime<Utc>) -> u16 {
    (time.hour() * 60 + time.minute()) as u16
}

/// Window activation edge reported by [`TodState::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TodEvent {
    /// Entered the interval with this index
    Activated(usize),
    /// Left the interval with this index
    Deactivated(usize),
}

/// Inside/outside tracker; flips only at interval boundaries and resets its
/// per-day one-shot bookkeeping at UTC midnight.
pub struct TodState {
    active: Option<usize>,
    day: Option<NaiveDate>,
    pulled: Vec<bool>,
}

impl TodState {
    pub fn new() -> TodState {
        TodState {
            active: None,
            day: None,
            pulled: Vec::new(),
        }
    }

    /// Evaluate the windows at `now`, returning at most one edge.
    pub fn evaluate(&mut self, windows: &Windows, now: DateTime<Utc>) -> Option<TodEvent> {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.pulled = vec![false; windows.len()];
        }
        let current = windows.active_at(minute_of_day(&now));
        match (self.active, current) {
            (None, Some(index)) => {
                self.active = Some(index);
                Some(TodEvent::Activated(index))
            }
            (Some(index), None) => {
                self.active = None;
                Some(TodEvent::Deactivated(index))
            }
            (Some(previous), Some(index)) if previous != index => {
                // Back-to-back intervals: report the new activation.
                self.active = Some(index);
                Some(TodEvent::Activated(index))
            }
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// One-shot latch for the historic pulls of an interval; returns true
    /// the first time it is taken for this interval today.
    pub fn take_pull(&mut self, index: usize) -> bool {
        if let Some(flag) = self.pulled.get_mut(index) {
            if !*flag {
                *flag = true;
                return true;
            }
        }
        false
    }
}

impl Default for TodState {
    fn default() -> TodState {
        TodState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, h, m, s).unwrap()
    }

    #[test]
    fn parse_and_sort() {
        let windows = Windows::parse("20:00-20:15, 12:00-12:15").expect("valid windows");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows.interval(0), Interval { start: 720, end: 735 });
        assert_eq!(windows.interval(1), Interval { start: 1200, end: 1215 });
    }

    #[test]
    fn parse_rejects_bad_specs() {
        assert!(Windows::parse("12:00").is_err());
        assert!(Windows::parse("12:30-12:00").is_err());
        assert!(Windows::parse("24:00-24:15").is_err());
        assert!(Windows::parse("12:00-12:20,12:10-12:30").is_err());
        // Coverage below the 15-minute floor.
        assert!(Windows::parse("12:00-12:10").is_err());
    }

    #[test]
    fn empty_spec_disables_windows() {
        let windows = Windows::parse("").expect("empty spec is fine");
        assert!(windows.is_empty());
        assert_eq!(windows.active_at(720), None);
    }

    #[test]
    fn exactly_one_of_inside_or_outside_holds() {
        let windows = Windows::parse("12:00-12:15,20:00-20:15").expect("valid windows");
        for minute in 0..1440u16 {
            let inside = windows.active_at(minute).is_some();
            let expected = (720..735).contains(&minute) || (1200..1215).contains(&minute);
            assert_eq!(inside, expected, "minute {}", minute);
        }
    }

    #[test]
    fn state_flips_only_at_boundaries() {
        let windows = Windows::parse("12:00-12:15,20:00-20:15").expect("valid windows");
        let mut state = TodState::new();
        assert_eq!(state.evaluate(&windows, at(11, 59, 59)), None);
        assert!(!state.is_active());
        assert_eq!(
            state.evaluate(&windows, at(12, 0, 1)),
            Some(TodEvent::Activated(0))
        );
        assert_eq!(state.evaluate(&windows, at(12, 5, 0)), None);
        assert_eq!(
            state.evaluate(&windows, at(12, 15, 0)),
            Some(TodEvent::Deactivated(0))
        );
        assert_eq!(
            state.evaluate(&windows, at(20, 0, 0)),
            Some(TodEvent::Activated(1))
        );
    }

    #[test]
    fn pull_latch_is_once_per_interval_per_day() {
        let windows = Windows::parse("12:00-12:15").expect("valid windows");
        let mut state = TodState::new();
        state.evaluate(&windows, at(12, 1, 0));
        assert!(state.take_pull(0));
        assert!(!state.take_pull(0));

        // A new UTC day resets the latch.
        let tomorrow = Utc.with_ymd_and_hms(2026, 8, 2, 12, 1, 0).unwrap();
        state.evaluate(&windows, tomorrow);
        assert!(state.take_pull(0));
    }
}
