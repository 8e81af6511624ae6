//! Fluent construction of a [`Reactor`]
//!
//! ```rust,no_run
//! use horizon_reactor::builder::ReactorBuilder;
//!
//! let reactor = ReactorBuilder::low_latency()
//!     .reactor_threads(2)
//!     .worker_threads(4)
//!     .idle_timeout_ticks(600)
//!     .build()?;
//! # Ok::<(), horizon_reactor::Error>(())
//! ```
//!
//! Setters consume the builder and return it; nothing is validated until
//! [`ReactorBuilder::config`] or [`ReactorBuilder::build`].

use crate::config::{ReactorConfig, SocketOptions};
use crate::error::Result;
use crate::reactor::Reactor;

/// Builder for [`ReactorConfig`] and [`Reactor`]
#[derive(Debug, Clone, Default)]
pub struct ReactorBuilder {
    config: ReactorConfig,
}

impl ReactorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from [`ReactorConfig::low_latency`].
    pub fn low_latency() -> Self {
        Self::from_config(ReactorConfig::low_latency())
    }

    /// Starts from [`ReactorConfig::high_throughput`].
    pub fn high_throughput() -> Self {
        Self::from_config(ReactorConfig::high_throughput())
    }

    /// Starts from [`ReactorConfig::power_efficient`].
    pub fn power_efficient() -> Self {
        Self::from_config(ReactorConfig::power_efficient())
    }

    pub fn from_config(config: ReactorConfig) -> Self {
        Self { config }
    }

    /// Selector thread count; rounded up to a power of two.
    pub fn reactor_threads(mut self, threads: usize) -> Self {
        self.config.reactor_threads = Some(threads);
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = Some(threads);
        self
    }

    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.config.ring_capacity = capacity;
        self
    }

    pub fn intake_capacity(mut self, capacity: usize) -> Self {
        self.config.intake_capacity = capacity;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    /// `None` lets a selector wait for events indefinitely.
    pub fn poll_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.config.poll_timeout_ms = timeout_ms;
        self
    }

    pub fn tick_ms(mut self, tick_ms: u64) -> Self {
        self.config.tick_ms = tick_ms;
        self
    }

    pub fn wheel_size(mut self, size: usize) -> Self {
        self.config.wheel_size = size;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn throttle(mut self, bytes: usize) -> Self {
        self.config.throttle = bytes;
        self
    }

    pub fn idle_timeout_ticks(mut self, ticks: u64) -> Self {
        self.config.idle_timeout_ticks = Some(ticks);
        self
    }

    pub fn read_timeout_ticks(mut self, ticks: u64) -> Self {
        self.config.read_timeout_ticks = Some(ticks);
        self
    }

    /// `None` disables the connect deadline.
    pub fn connect_timeout_ticks(mut self, ticks: Option<u64>) -> Self {
        self.config.connect_timeout_ticks = ticks;
        self
    }

    pub fn pin_threads(mut self, pin: bool) -> Self {
        self.config.pin_threads = pin;
        self
    }

    pub fn socket_options(mut self, socket: SocketOptions) -> Self {
        self.config.socket = socket;
        self
    }

    pub fn nodelay(mut self, enable: bool) -> Self {
        self.config.socket.tcp_nodelay = enable;
        self
    }

    pub fn quickack(mut self, enable: bool) -> Self {
        self.config.socket.tcp_quickack = enable;
        self
    }

    pub fn reuse_port(mut self, enable: bool) -> Self {
        self.config.socket.reuse_port = enable;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.socket.tcp_backlog = backlog;
        self
    }

    /// Sets both socket buffer sizes.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.socket.recv_buf = Some(size);
        self.config.socket.send_buf = Some(size);
        self
    }

    pub fn busy_poll(mut self, microseconds: u32) -> Self {
        self.config.socket.busy_poll = Some(microseconds);
        self
    }

    pub fn tos(mut self, tos: u32) -> Self {
        self.config.socket.tos = Some(tos);
        self
    }

    /// The validated configuration.
    pub fn config(self) -> Result<ReactorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Starts a reactor with the built configuration.
    pub fn build(self) -> Result<Reactor> {
        Reactor::start(self.config()?)
    }
}
