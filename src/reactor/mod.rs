//! Selector-thread reactor
//!
//! A [`Reactor`] runs a power-of-two number of selector threads, a worker
//! pool and a timeout ticker. Each channel belongs to exactly one selector,
//! `id & (threads - 1)`, fixed for its lifetime; only that selector ever
//! touches the channel's readiness interest, so no lock guards it.
//!
//! Other threads ask a selector for changes through its intake queues
//! (register, connect, read interest, write interest, close) and wake it.
//! A full queue is never a dropped request: the submitter logs a capacity
//! warning and retries until a slot frees up.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use horizon_reactor::filter::codec::LengthFieldFilter;
//! use horizon_reactor::{Channel, FilterChain, Message, Reactor, ReactorConfig, Result, Service};
//!
//! struct Echo {
//!     chain: FilterChain,
//! }
//!
//! impl Service for Echo {
//!     fn filter_chain(&self) -> &FilterChain {
//!         &self.chain
//!     }
//!
//!     fn on_message_received(&self, channel: &Channel, msg: Message) -> Result<()> {
//!         channel.write(msg)
//!     }
//! }
//!
//! let chain = FilterChain::new();
//! chain.add_last("length", Arc::new(LengthFieldFilter::new(4)))?;
//! let reactor = Reactor::start(ReactorConfig::default())?;
//! let acceptor = reactor.bind("0.0.0.0:7000".parse().unwrap(), Arc::new(Echo { chain }))?;
//! println!("echo on {}", acceptor.local_addr()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod selector;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{debug, info, warn};
use mio::{Poll, Token, Waker};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelId, ChannelOptions};
use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::service::Service;
use crate::tcp::{self, AcceptorShared, ListenerControl, TcpAcceptor};
use crate::timer::TimeoutTimer;
use crate::transport::{TcpTransport, UdpTransport};
use crate::worker::{Task, WorkerPool};

use selector::Selector;

/// Token reserved for a selector's waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Spins before a blocked intake push starts yielding.
const SPIN_LIMIT: u32 = 64;

/// What a channel needs from the reactor it lives on
///
/// Every `on_*_required` call only queues a request for the channel's
/// selector thread and returns; the change happens on the next loop turn.
pub trait ReactorAdmin: Send + Sync + 'static {
    /// Adds an accepted (or otherwise connected) channel to its selector,
    /// which then opens it.
    fn on_register_required(&self, channel: &Channel) -> Result<()>;

    /// Adds a channel with a connect in progress; it opens once the socket
    /// reports writable.
    fn on_connect_required(&self, channel: &Channel) -> Result<()>;

    fn on_read_required(&self, channel: &Channel) -> Result<()>;

    fn on_write_required(&self, channel: &Channel) -> Result<()>;

    /// Drops the channel from its selector. Never blocks on a shut down
    /// reactor.
    fn on_close_required(&self, channel: &Channel);

    /// Runs `task` on a worker; `key` spreads tasks over workers.
    fn submit(&self, key: u64, task: Task) -> Result<()>;

    /// Timer for idle and read timeouts, if timeouts are supported.
    fn timer(&self) -> Option<&TimeoutTimer<ChannelId>> {
        None
    }
}

/// Requests queued for one selector thread
pub(crate) struct Intake {
    pub(crate) register: ArrayQueue<Channel>,
    pub(crate) connect: ArrayQueue<Channel>,
    pub(crate) read: ArrayQueue<Channel>,
    pub(crate) write: ArrayQueue<Channel>,
    pub(crate) close: ArrayQueue<Channel>,
    pub(crate) listen: ArrayQueue<Arc<AcceptorShared>>,
    pub(crate) unlisten: ArrayQueue<Arc<AcceptorShared>>,
    waker: Waker,
}

impl Intake {
    fn new(capacity: usize, waker: Waker) -> Self {
        Self {
            register: ArrayQueue::new(capacity),
            connect: ArrayQueue::new(capacity),
            read: ArrayQueue::new(capacity),
            write: ArrayQueue::new(capacity),
            close: ArrayQueue::new(capacity),
            listen: ArrayQueue::new(capacity),
            unlisten: ArrayQueue::new(capacity),
            waker,
        }
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake selector: {e}");
        }
    }
}

pub(crate) struct ReactorInner {
    pub(crate) config: ReactorConfig,
    pub(crate) intakes: Box<[Arc<Intake>]>,
    workers: WorkerPool,
    timer: TimeoutTimer<ChannelId>,
    pub(crate) running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_listener: AtomicUsize,
}

impl ReactorInner {
    pub(crate) fn owner(&self, channel: &Channel) -> usize {
        (channel.id().as_u64() as usize) & (self.intakes.len() - 1)
    }

    /// Pushes into a bounded intake queue, waiting for room if needed.
    fn push<T>(&self, selector: usize, queue: &ArrayQueue<T>, what: &str, item: T) -> Result<()> {
        let mut item = item;
        let mut attempts = 0u32;
        loop {
            if !self.running.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            match queue.push(item) {
                Ok(()) => break,
                Err(rejected) => {
                    if attempts == 0 {
                        warn!("selector {selector} {what} queue full ({} slots), waiting", queue.capacity());
                    }
                    item = rejected;
                    attempts = attempts.saturating_add(1);
                    if attempts < SPIN_LIMIT {
                        std::hint::spin_loop();
                    } else {
                        thread::yield_now();
                    }
                }
            }
        }
        self.intakes[selector].wake();
        Ok(())
    }

    fn request(&self, channel: &Channel, what: &str, pick: fn(&Intake) -> &ArrayQueue<Channel>) -> Result<()> {
        let selector = self.owner(channel);
        self.push(selector, pick(&self.intakes[selector]), what, channel.clone())
    }
}

impl ReactorAdmin for ReactorInner {
    fn on_register_required(&self, channel: &Channel) -> Result<()> {
        self.request(channel, "register", |intake| &intake.register)
    }

    fn on_connect_required(&self, channel: &Channel) -> Result<()> {
        self.request(channel, "connect", |intake| &intake.connect)
    }

    fn on_read_required(&self, channel: &Channel) -> Result<()> {
        self.request(channel, "read", |intake| &intake.read)
    }

    fn on_write_required(&self, channel: &Channel) -> Result<()> {
        self.request(channel, "write", |intake| &intake.write)
    }

    fn on_close_required(&self, channel: &Channel) {
        // Selectors close everything they own on the way out
        if let Err(err) = self.request(channel, "close", |intake| &intake.close) {
            debug!("close of channel {} not queued: {err}", channel.id());
        }
    }

    fn submit(&self, key: u64, task: Task) -> Result<()> {
        let index = (key % self.workers.len() as u64) as usize;
        self.workers.submit_to(index, task)
    }

    fn timer(&self) -> Option<&TimeoutTimer<ChannelId>> {
        Some(&self.timer)
    }
}

impl ListenerControl for ReactorInner {
    fn unlisten(&self, acceptor: Arc<AcceptorShared>) {
        let selector = acceptor.selector;
        if let Err(err) = self.push(selector, &self.intakes[selector].unlisten, "unlisten", acceptor) {
            debug!("unlisten not queued: {err}");
        }
    }
}

/// Running reactor: selector threads, workers and the timeout ticker
///
/// Dropping the reactor shuts it down.
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    /// Validates `config` and starts every thread.
    pub fn start(config: ReactorConfig) -> Result<Reactor> {
        config.validate()?;
        let selectors = config.reactor_thread_count();
        let workers = config.worker_thread_count();

        let mut polls = Vec::with_capacity(selectors);
        let mut intakes = Vec::with_capacity(selectors);
        for _ in 0..selectors {
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
            intakes.push(Arc::new(Intake::new(config.intake_capacity, waker)));
            polls.push(poll);
        }

        let pin_offset = config.pin_threads.then_some(selectors);
        let inner = Arc::new(ReactorInner {
            workers: WorkerPool::start(workers, config.ring_capacity, pin_offset)?,
            timer: TimeoutTimer::new(config.wheel_capacity()),
            intakes: intakes.into_boxed_slice(),
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::with_capacity(selectors)),
            next_listener: AtomicUsize::new(0),
            config,
        });
        let reactor = Reactor { inner };
        reactor
            .inner
            .timer
            .start_ticker(Duration::from_millis(reactor.inner.config.tick_ms))?;

        for (index, poll) in polls.into_iter().enumerate() {
            let selector = Selector::new(index, poll, reactor.inner.clone());
            let pin = reactor.inner.config.pin_threads;
            let handle = thread::Builder::new()
                .name(format!("horizon-selector-{index}"))
                .spawn(move || {
                    crate::affinity::pin_current(pin, index, "selector");
                    selector.run();
                })?;
            reactor.inner.threads.lock().push(handle);
        }

        info!("reactor started: {selectors} selector thread(s), {workers} worker(s)");
        Ok(reactor)
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn selector_count(&self) -> usize {
        self.inner.intakes.len()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Starts a non-blocking connect to `addr`.
    ///
    /// The returned channel is `Connecting`; writes are queued until it opens.
    /// If the connect does not complete within the configured number of ticks,
    /// the service's connect timeout callback fires and the channel closes.
    pub fn connect(&self, addr: SocketAddr, service: Arc<dyn Service>) -> Result<Channel> {
        self.ensure_running()?;
        let transport = TcpTransport::connect(addr, &self.inner.config.socket)?;
        let channel = self.channel(Box::new(transport), service);
        debug!("channel {} connecting to {addr}", channel.id());
        self.inner.on_connect_required(&channel)?;
        Ok(channel)
    }

    /// Opens a channel over a UDP socket bound to `local` and connected to
    /// `peer`; every datagram is one read.
    pub fn connect_udp(&self, local: SocketAddr, peer: SocketAddr, service: Arc<dyn Service>) -> Result<Channel> {
        self.ensure_running()?;
        let transport = UdpTransport::connect(local, peer, &self.inner.config.socket)?;
        let channel = self.channel(Box::new(transport), service);
        self.inner.on_register_required(&channel)?;
        Ok(channel)
    }

    /// Listens on `addr`; accepted connections become channels of `service`.
    pub fn bind(&self, addr: SocketAddr, service: Arc<dyn Service>) -> Result<TcpAcceptor> {
        self.ensure_running()?;
        let listener = tcp::listen(addr, &self.inner.config.socket)?;
        let selector = self.inner.next_listener.fetch_add(1, Ordering::Relaxed) & (self.inner.intakes.len() - 1);
        let shared = Arc::new(AcceptorShared::new(listener, service, selector));
        self.inner
            .push(selector, &self.inner.intakes[selector].listen, "listen", shared.clone())?;

        let control: Weak<dyn ListenerControl> = Arc::downgrade(&self.inner) as Weak<ReactorInner>;
        let acceptor = TcpAcceptor::new(shared, control);
        info!("listening on {:?} (selector {selector})", acceptor.local_addr().ok());
        Ok(acceptor)
    }

    /// Runs `task` on a worker thread.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.workers.submit(task)
    }

    /// Stops selectors, the ticker and the workers, closing every channel.
    ///
    /// Idempotent. Safe to call from a worker or selector thread; that thread
    /// is simply not joined.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("reactor shutting down");
        for intake in self.inner.intakes.iter() {
            intake.wake();
        }
        let current = thread::current().id();
        let handles: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("selector thread panicked");
            }
        }
        self.inner.timer.stop_ticker();
        self.inner.workers.shutdown();
        info!("reactor stopped");
    }

    fn channel(&self, transport: Box<dyn crate::transport::Transport>, service: Arc<dyn Service>) -> Channel {
        let admin: Arc<dyn ReactorAdmin> = self.inner.clone();
        Channel::new(transport, service, admin, ChannelOptions::from(&self.inner.config))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::Shutdown)
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("selectors", &self.selector_count())
            .field("workers", &self.worker_count())
            .field("running", &self.is_running())
            .finish()
    }
}
