// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use std::path::PathBuf;
use std::process::{Child, Command};
use std::str::FromStr;

/// When a configured alarm script may be (re)launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Never launch
    Never,
    /// Launch at most once per process lifetime
    Once,
    /// Launch whenever no previous invocation is still running
    Many,
}

impl FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<LaunchMode, String> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(LaunchMode::Never),
            "once" => Ok(LaunchMode::Once),
            "many" => Ok(LaunchMode::Many),
            other => Err(format!("unknown script mode '{}'", other)),
        }
    }
}

/// Launches one external alarm script and tracks its liveness.
pub struct ScriptLauncher {
    path: Option<PathBuf>,
    mode: LaunchMode,
    launched: bool,
    child: Option<Child>,
}

impl ScriptLauncher {
    pub fn new(path: Option<PathBuf>, mode: LaunchMode) -> ScriptLauncher {
        ScriptLauncher {
            path,
            mode,
            launched: false,
            child: None,
        }
    }

    /// Replace path and mode (configuration reload). Lifetime-once state and
    /// a running child are kept.
    pub fn reconfigure(&mut self, path: Option<PathBuf>, mode: LaunchMode) {
        self.path = path;
        self.mode = mode;
    }

    /// Launch the script with `args` if the mode allows it right now.
    /// Returns whether a child was actually spawned.
    pub fn launch(&mut self, args: &[String]) -> bool {
        self.reap();
        let path = match (&self.path, self.mode) {
            (_, LaunchMode::Never) | (None, _) => return false,
            (Some(path), LaunchMode::Once) if self.launched => {
                debug!("script {} already launched once, skipping", path.display());
                return false;
            }
            (Some(path), LaunchMode::Many) if self.child.is_some() => {
                debug!(
                    "script {} still running, suppressing overlapping launch",
                    path.display()
                );
                return false;
            }
            (Some(path), _) => path.clone(),
        };
        match Command::new(&path).args(args).spawn() {
            Ok(child) => {
                info!("launched {} {}", path.display(), args.join(" "));
                self.launched = true;
                self.child = Some(child);
                true
            }
            Err(e) => {
                error!("could not launch {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Collect a finished child, logging its exit status.
    pub fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        debug!("alarm script exited with {}", status);
                    } else {
                        warn!("alarm script exited with {}", status);
                    }
                    self.child = None;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("could not poll alarm script: {}", e);
                    self.child = None;
                }
            }
        }
    }
}

/// Argument vector for the low-voltage script.
pub fn low_volt_args(average: f64, threshold: f64, samples: usize) -> Vec<String> {
    vec![
        "-v".to_string(),
        format!("{:.2}", average),
        "-t".to_string(),
        format!("{:.2}", threshold),
        "-s".to_string(),
        samples.to_string(),
    ]
}

/// Argument vector for the roof-relay script.
pub fn roof_args(code: char, reason: &str) -> Vec<String> {
    vec![
        "-c".to_string(),
        code.to_string(),
        "-m".to_string(),
        reason.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("Never".parse::<LaunchMode>(), Ok(LaunchMode::Never));
        assert_eq!("once".parse::<LaunchMode>(), Ok(LaunchMode::Once));
        assert_eq!("MANY".parse::<LaunchMode>(), Ok(LaunchMode::Many));
        assert!("sometimes".parse::<LaunchMode>().is_err());
    }

    #[test]
    fn never_mode_is_a_no_op() {
        let mut launcher = ScriptLauncher::new(Some(PathBuf::from("/bin/true")), LaunchMode::Never);
        assert!(!launcher.launch(&[]));
    }

    #[test]
    fn unconfigured_script_is_a_no_op() {
        let mut launcher = ScriptLauncher::new(None, LaunchMode::Many);
        assert!(!launcher.launch(&[]));
    }

    #[test]
    fn once_mode_spawns_at_most_once() {
        let mut launcher = ScriptLauncher::new(Some(PathBuf::from("/bin/true")), LaunchMode::Once);
        assert!(launcher.launch(&[]));
        assert!(!launcher.launch(&[]));
        assert!(!launcher.launch(&[]));
    }

    #[test]
    fn many_mode_suppresses_overlap() {
        let mut launcher = ScriptLauncher::new(Some(PathBuf::from("/bin/sleep")), LaunchMode::Many);
        assert!(launcher.launch(&["5".to_string()]));
        // The sleep child is still alive.
        assert!(!launcher.launch(&["5".to_string()]));
    }

    #[test]
    fn many_mode_relaunches_after_exit() {
        let mut launcher = ScriptLauncher::new(Some(PathBuf::from("/bin/true")), LaunchMode::Many);
        assert!(launcher.launch(&[]));
        // Give the child a moment to exit, then reap and relaunch.
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(launcher.launch(&[]));
    }

    #[test]
    fn failed_exec_does_not_poison_the_launcher() {
        let mut launcher = ScriptLauncher::new(
            Some(PathBuf::from("/nonexistent/alarm-script")),
            LaunchMode::Many,
        );
        assert!(!launcher.launch(&[]));
        assert!(!launcher.launch(&[]));
    }

    #[test]
    fn alarm_argv_shapes() {
        assert_eq!(
            low_volt_args(11.8, 12.0, 30),
            vec!["-v", "11.80", "-t", "12.00", "-s", "30"]
        );
        assert_eq!(roof_args('O', "roof relay open"), vec!["-c", "O", "-m", "roof relay open"]);
    }
}
