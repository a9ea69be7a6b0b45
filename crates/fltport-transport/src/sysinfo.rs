//! Host concurrency probe.

use std::num::NonZeroUsize;

/// Default number of monitor workers for this host.
///
/// The scheduler-reported concurrency (which honours affinity masks and
/// cgroup quotas) clamped by the number of online cores.
pub fn default_concurrency() -> usize {
    let scheduling = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    match online_cores() {
        Some(cores) => scheduling.min(cores).max(1),
        None => scheduling,
    }
}

#[cfg(unix)]
fn online_cores() -> Option<usize> {
    // SAFETY: sysconf has no preconditions and only reads system configuration.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        Some(n as usize)
    } else {
        None
    }
}

#[cfg(windows)]
fn online_cores() -> Option<usize> {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    // SAFETY: SYSTEM_INFO is plain data; GetSystemInfo fills the provided struct.
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    match info.dwNumberOfProcessors {
        0 => None,
        n => Some(n as usize),
    }
}

#[cfg(not(any(unix, windows)))]
fn online_cores() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_concurrency_is_positive_and_bounded() {
        let n = default_concurrency();
        assert!(n >= 1);
        let scheduling = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        assert!(n <= scheduling);
    }
}
