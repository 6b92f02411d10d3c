// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use chrono::{DateTime, Utc};
use std::net::TcpStream;
use std::process::Command;
use std::time::Duration;

/// Which side's clock is authoritative for this check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Master {
    Host,
    Device,
}

/// The host clock is authoritative whenever it has a hardware RTC of its own
/// or can discipline itself from the Internet; only a host with neither
/// follows the device.
pub fn select_master(host_rtc: bool, internet: bool) -> Master {
    if host_rtc || internet {
        Master::Host
    } else {
        Master::Device
    }
}

/// Probe Internet reachability with a short TCP connect.
pub fn internet_reachable(probe_addr: &str, timeout: Duration) -> bool {
    use std::net::ToSocketAddrs;

    let addrs = match probe_addr.to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!("could not resolve probe address {}: {}", probe_addr, e);
            return false;
        }
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

/// Drive the host clock from the device (device-master case) by invoking the
/// configured clock command with `-u -s <time>` semantics.
pub fn set_host_clock(command: &str, device_time: DateTime<Utc>) {
    let stamp = device_time.format("%Y-%m-%d %H:%M:%S").to_string();
    match Command::new(command)
        .arg("-u")
        .arg("-s")
        .arg(&stamp)
        .status()
    {
        Ok(status) if status.success() => {
            info!("host clock set from device to {} UTC", stamp);
        }
        Ok(status) => {
            warn!("host clock command exited with {}", status);
        }
        Err(e) => {
            warn!("could not run host clock command '{}': {}", command, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_selection_truth_table() {
        assert_eq!(select_master(true, true), Master::Host);
        assert_eq!(select_master(true, false), Master::Host);
        assert_eq!(select_master(false, true), Master::Host);
        assert_eq!(select_master(false, false), Master::Device);
    }

    #[test]
    fn unresolvable_probe_address_is_unreachable() {
        assert!(!internet_reachable("not-an-address", Duration::from_millis(100)));
    }
}
