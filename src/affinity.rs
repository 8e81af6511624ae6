//! CPU affinity for selector and worker threads
//!
//! When [`ReactorConfig::pin_threads`](crate::ReactorConfig::pin_threads) is
//! set, every reactor-owned thread pins itself to one core as its first
//! action. Selector threads take the low cores and workers the following
//! ones, wrapping around when there are more threads than cores.

use std::io;

/// Number of CPU cores available to this process, at least one.
pub fn get_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Core assigned to the thread with global index `index`.
///
/// Selector thread `i` has index `i`; worker `j` has index
/// `reactor_threads + j`.
pub fn cpu_for(index: usize) -> usize {
    index % get_cpu_count()
}

/// Pins the calling thread to `cpu`
///
/// # Platform Support
///
/// - **Linux/Android/FreeBSD**: `sched_setaffinity`
/// - **Other platforms**: no-op
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
            pin_to_cpu_unix(cpu)
        } else {
            let _ = cpu;
            Ok(())
        }
    }
}

/// Pins the calling thread when `enabled`, logging instead of failing.
///
/// A thread that cannot be pinned still runs correctly, so failures are
/// reported and swallowed.
pub(crate) fn pin_current(enabled: bool, index: usize, role: &str) {
    if !enabled {
        return;
    }
    let cpu = cpu_for(index);
    match pin_to_cpu(cpu) {
        Ok(()) => log::debug!("{role} thread pinned to cpu {cpu}"),
        Err(e) => log::warn!("failed to pin {role} thread to cpu {cpu}: {e}"),
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn pin_to_cpu_unix(cpu: usize) -> io::Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};

    if cpu >= 1024 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "CPU number too large (max 1023)",
        ));
    }

    unsafe {
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(cpu, &mut set);

        if sched_setaffinity(0, std::mem::size_of::<cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}
