//! Reactor configuration and socket tuning
//!
//! This module collects every knob of the reactor in one plain struct,
//! [`ReactorConfig`]. It sizes the selector threads, the worker pool and its
//! rings, the timing wheel and the per-channel read path, and it carries the
//! [`SocketOptions`] applied to every accepted or connected socket.
//!
//! # Sizing
//!
//! - `reactor_threads`: selector threads, always rounded up to a power of two
//!   so that `hash(channel_id) & (n - 1)` picks the owning thread
//! - `worker_threads`: threads executing read and write tasks
//! - `ring_capacity`: slots in each worker's lock-free ring
//!
//! # Timeouts
//!
//! Timeouts are expressed in wheel ticks. One tick lasts `tick_ms`
//! milliseconds, so `idle_timeout_ticks: Some(300)` with the default tick
//! closes nothing by itself but reports an idle channel after 30 seconds.
//!
//! # Examples
//!
//! ```rust
//! use horizon_reactor::ReactorConfig;
//!
//! let cfg = ReactorConfig {
//!     reactor_threads: Some(2),
//!     worker_threads: Some(4),
//!     idle_timeout_ticks: Some(600),
//!     ..Default::default()
//! };
//! assert_eq!(cfg.reactor_thread_count(), 2);
//! ```

use std::io;

use crate::error::{Error, Result};
use crate::raw;

/// Largest wheel the timer accepts; bigger requests are capped.
pub const MAX_WHEEL_SIZE: usize = 1 << 16;

/// Most selector threads a reactor starts.
pub const MAX_REACTOR_THREADS: usize = 1024;

/// Default bytes read from a socket in one burst before the pipeline runs.
pub const DEFAULT_THROTTLE: usize = 256 * 1024;

/// Socket options applied to accepted and connected TCP sockets
///
/// All fields are optional tuning; platform-specific options are ignored on
/// platforms that lack them.
#[derive(Clone, Debug, PartialEq)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    ///
    /// **Default**: `true`
    pub tcp_nodelay: bool,

    /// Enable TCP_QUICKACK (Linux only).
    ///
    /// **Default**: `false`
    pub tcp_quickack: bool,

    /// Enable SO_REUSEPORT on listeners (Linux/BSD only).
    ///
    /// **Default**: `false`
    pub reuse_port: bool,

    /// SO_BUSY_POLL timeout in microseconds (Linux only).
    ///
    /// **Default**: `None`
    pub busy_poll: Option<u32>,

    /// Socket receive buffer size in bytes.
    ///
    /// **Default**: `None` (kernel default)
    pub recv_buf: Option<usize>,

    /// Socket send buffer size in bytes.
    ///
    /// **Default**: `None` (kernel default)
    pub send_buf: Option<usize>,

    /// IP Type of Service / DSCP marking.
    ///
    /// **Default**: `None`
    pub tos: Option<u32>,

    /// TCP listen backlog.
    ///
    /// **Default**: `1024`
    pub tcp_backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_quickack: false,
            reuse_port: false,
            busy_poll: None,
            recv_buf: None,
            send_buf: None,
            tos: None,
            tcp_backlog: 1024,
        }
    }
}

/// Complete reactor configuration
///
/// Every field has a default suited to a general-purpose server; the presets
/// [`ReactorConfig::low_latency`], [`ReactorConfig::high_throughput`] and
/// [`ReactorConfig::power_efficient`] shift the trade-offs.
#[derive(Clone, Debug, PartialEq)]
pub struct ReactorConfig {
    /// Number of selector threads.
    ///
    /// Rounded up to a power of two. `None` picks the smallest power of two
    /// not below the number of available CPU cores.
    ///
    /// **Default**: `None`
    pub reactor_threads: Option<usize>,

    /// Number of worker threads executing read and write tasks.
    ///
    /// `None` uses the number of available CPU cores.
    ///
    /// **Default**: `None`
    pub worker_threads: Option<usize>,

    /// Slots in each worker's task ring.
    ///
    /// **Default**: `4096`
    pub ring_capacity: usize,

    /// Slots in each of a selector thread's intake queues.
    ///
    /// **Default**: `1024`
    pub intake_capacity: usize,

    /// Readiness events fetched per multiplexer wait.
    ///
    /// **Default**: `1024`
    pub events_capacity: usize,

    /// Upper bound on a single multiplexer wait, in milliseconds.
    ///
    /// Also bounds how late a selector thread notices its own wheel ticks.
    ///
    /// **Default**: `Some(10)`
    pub poll_timeout_ms: Option<u64>,

    /// Duration of one timing-wheel tick in milliseconds.
    ///
    /// **Default**: `100`
    pub tick_ms: u64,

    /// Requested timing-wheel size (rounded up to a power of two, capped at
    /// [`MAX_WHEEL_SIZE`]).
    ///
    /// **Default**: `512`
    pub wheel_size: usize,

    /// Size of each buffer a read task fills from the socket.
    ///
    /// **Default**: `16384`
    pub read_buffer_size: usize,

    /// Bytes buffered per read burst before the pipeline runs; services may
    /// override it.
    ///
    /// **Default**: [`DEFAULT_THROTTLE`]
    pub throttle: usize,

    /// Ticks without read or write activity before the idle callback fires.
    ///
    /// **Default**: `None` (disabled)
    pub idle_timeout_ticks: Option<u64>,

    /// Ticks a partially received message may stay incomplete.
    ///
    /// **Default**: `None` (disabled)
    pub read_timeout_ticks: Option<u64>,

    /// Ticks an outbound connect may stay pending.
    ///
    /// **Default**: `Some(100)` (ten seconds with the default tick)
    pub connect_timeout_ticks: Option<u64>,

    /// Pin selector and worker threads to CPU cores.
    ///
    /// **Default**: `false`
    pub pin_threads: bool,

    /// Options applied to every accepted or connected socket.
    pub socket: SocketOptions,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            reactor_threads: None,
            worker_threads: None,
            ring_capacity: 4096,
            intake_capacity: 1024,
            events_capacity: 1024,
            poll_timeout_ms: Some(10),
            tick_ms: 100,
            wheel_size: 512,
            read_buffer_size: 16 * 1024,
            throttle: DEFAULT_THROTTLE,
            idle_timeout_ticks: None,
            read_timeout_ticks: None,
            connect_timeout_ticks: Some(100),
            pin_threads: false,
            socket: SocketOptions::default(),
        }
    }
}

impl ReactorConfig {
    /// Preset for latency-sensitive services
    ///
    /// Short polls and ticks, pinned threads, small socket buffers and busy
    /// polling. Costs CPU.
    pub fn low_latency() -> Self {
        Self {
            ring_capacity: 1024,
            poll_timeout_ms: Some(1),
            tick_ms: 10,
            read_buffer_size: 4 * 1024,
            throttle: 64 * 1024,
            pin_threads: true,
            socket: SocketOptions {
                tcp_nodelay: true,
                tcp_quickack: true,
                busy_poll: Some(50),
                recv_buf: Some(256 * 1024),
                send_buf: Some(256 * 1024),
                tos: Some(0x10),
                tcp_backlog: 512,
                ..SocketOptions::default()
            },
            ..Self::default()
        }
    }

    /// Preset for bulk transfer
    ///
    /// Deep rings, large read bursts and socket buffers, Nagle enabled.
    pub fn high_throughput() -> Self {
        Self {
            ring_capacity: 16 * 1024,
            events_capacity: 4096,
            poll_timeout_ms: Some(50),
            read_buffer_size: 64 * 1024,
            throttle: 4 << 20,
            socket: SocketOptions {
                tcp_nodelay: false,
                reuse_port: true,
                recv_buf: Some(16 << 20),
                send_buf: Some(16 << 20),
                tos: Some(0x08),
                tcp_backlog: 2048,
                ..SocketOptions::default()
            },
            ..Self::default()
        }
    }

    /// Preset that minimises wake-ups
    pub fn power_efficient() -> Self {
        Self {
            reactor_threads: Some(1),
            worker_threads: Some(2),
            ring_capacity: 1024,
            poll_timeout_ms: Some(100),
            tick_ms: 500,
            socket: SocketOptions {
                recv_buf: Some(512 * 1024),
                send_buf: Some(512 * 1024),
                tcp_backlog: 256,
                ..SocketOptions::default()
            },
            ..Self::default()
        }
    }

    /// Selector threads actually started: a power of two between one and
    /// [`MAX_REACTOR_THREADS`].
    pub fn reactor_thread_count(&self) -> usize {
        self.reactor_threads
            .unwrap_or_else(crate::affinity::get_cpu_count)
            .clamp(1, MAX_REACTOR_THREADS)
            .next_power_of_two()
    }

    /// Worker threads actually started, at least one.
    pub fn worker_thread_count(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(crate::affinity::get_cpu_count)
            .max(1)
    }

    /// Timing-wheel capacity: next power of two of `wheel_size`, capped.
    pub fn wheel_capacity(&self) -> usize {
        wheel_capacity(self.wheel_size)
    }

    /// Rejects configurations the reactor cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.ring_capacity, "ring_capacity"),
            (self.intake_capacity, "intake_capacity"),
            (self.events_capacity, "events_capacity"),
            (self.wheel_size, "wheel_size"),
            (self.read_buffer_size, "read_buffer_size"),
            (self.throttle, "throttle"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.tick_ms == 0 {
            return Err(Error::Config("tick_ms must be greater than zero".into()));
        }
        if matches!(self.reactor_threads, Some(0)) || matches!(self.worker_threads, Some(0)) {
            return Err(Error::Config("thread counts must be greater than zero".into()));
        }
        if let Some(n) = self.reactor_threads.filter(|&n| n > MAX_REACTOR_THREADS) {
            return Err(Error::Config(format!(
                "reactor_threads must be at most {MAX_REACTOR_THREADS}, got {n}"
            )));
        }
        Ok(())
    }
}

/// Next power of two of `requested`, at least 2, capped at [`MAX_WHEEL_SIZE`].
pub fn wheel_capacity(requested: usize) -> usize {
    requested.clamp(2, MAX_WHEEL_SIZE).next_power_of_two()
}

/// Applies [`SocketOptions`] to a connected or listening TCP socket
///
/// `ipv6` selects the TOS option family. Buffer sizes and TCP_NODELAY are
/// reported as errors; best-effort Linux options (busy poll, quick ack) are
/// ignored when the kernel refuses them.
pub fn apply_socket_options(os: raw::OsSocket, ipv6: bool, opts: &SocketOptions) -> io::Result<()> {
    apply_datagram_options(os, ipv6, opts)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if opts.tcp_quickack {
            let _ = raw::set_tcp_quickack(os, true);
        }
    }

    raw::set_tcp_nodelay(os, opts.tcp_nodelay)
}

/// Applies the protocol-independent subset of [`SocketOptions`]: buffer
/// sizes, TOS and busy polling. Used as is for UDP sockets.
pub fn apply_datagram_options(os: raw::OsSocket, ipv6: bool, opts: &SocketOptions) -> io::Result<()> {
    if let Some(sz) = opts.recv_buf {
        raw::set_recv_buffer(os, sz as i32)?;
    }
    if let Some(sz) = opts.send_buf {
        raw::set_send_buffer(os, sz as i32)?;
    }
    if let Some(tos) = opts.tos {
        if ipv6 {
            raw::set_tos_v6(os, tos as i32)?;
        } else {
            raw::set_tos_v4(os, tos as i32)?;
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Some(us) = opts.busy_poll {
            let _ = raw::set_busy_poll(os, us);
        }
    }

    Ok(())
}
