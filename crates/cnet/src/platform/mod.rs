//! Host platform facts and helpers.

pub mod exec;
pub mod sysctl;

pub use exec::{Exec, ExecError};
pub use sysctl::Sysctl;

use std::time::{Duration, SystemTime};

/// Time of the last host boot, derived from `/proc/uptime`.
pub fn last_reboot_time() -> std::io::Result<SystemTime> {
    let content = std::fs::read_to_string("/proc/uptime")?;
    let uptime_secs: f64 = content
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| std::io::Error::other("malformed /proc/uptime"))?;
    Ok(SystemTime::now() - Duration::from_secs_f64(uptime_secs))
}

/// Drop any platform-held network configuration before a post-reboot
/// rebuild. Linux keeps nothing outside the kernel state that vanished with
/// the reboot, so there is nothing to clear; the hook exists so the manager's
/// rebuild protocol reads the same on every platform.
pub fn clear_network_configuration() {
    tracing::info!("no platform network configuration to clear");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_reboot_time_is_in_the_past() {
        let boot = last_reboot_time().unwrap();
        assert!(boot < SystemTime::now());
    }
}
