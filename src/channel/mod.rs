//! Channels: one connection each
//!
//! A [`Channel`] is a cheap, clonable handle to one connection. It moves
//! through [`ChannelState::Connecting`], [`ChannelState::Open`],
//! [`ChannelState::Closing`] and [`ChannelState::Closed`]; exactly one call
//! to [`Channel::close`] performs the teardown.
//!
//! Reads and writes never run on a selector thread. The selector submits a
//! read task when the socket is readable and a write task when it is
//! writable; at most one of each is outstanding per channel at any time:
//!
//! - a read task only exists between a readable event and the re-arm of
//!   read interest at its end;
//! - a write task is only submitted by whoever flips the `writing` flag of
//!   the outbound queue.

mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::filter::{ChainSnapshot, Message};
use crate::reactor::ReactorAdmin;
use crate::service::Service;
use crate::timer::{NotifierState, TimeoutNotifier};
use crate::transport::{Reader, Transport, MAX_DATAGRAM};

pub(crate) use pipeline::FilterContext;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically assigned channel id
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Channel lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Per-channel settings derived from the reactor configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    pub read_buffer_size: usize,
    pub throttle: usize,
    pub idle_timeout_ticks: Option<u64>,
    pub read_timeout_ticks: Option<u64>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from(&ReactorConfig::default())
    }
}

impl From<&ReactorConfig> for ChannelOptions {
    fn from(config: &ReactorConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            throttle: config.throttle,
            idle_timeout_ticks: config.idle_timeout_ticks,
            read_timeout_ticks: config.read_timeout_ticks,
        }
    }
}

pub type SharedAny = Arc<dyn Any + Send + Sync>;

/// A message queued for departure: the chain it was written against and the
/// stage below which it still has to travel.
struct Pending {
    msg: Message,
    chain: ChainSnapshot,
    index: usize,
}

/// Remainder of a message the socket did not fully accept.
struct Partial {
    remaining: Bytes,
    original: Message,
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Pending>,
    partial: Option<Partial>,
    writing: bool,
}

#[derive(Clone, Copy, Debug)]
enum TimeoutKind {
    Idle,
    Read,
}

struct ChannelInner {
    id: ChannelId,
    state: AtomicU8,
    transport: Box<dyn Transport>,
    service: Arc<dyn Service>,
    admin: Arc<dyn ReactorAdmin>,
    options: ChannelOptions,
    /// Selector slab key; `usize::MAX` while unregistered.
    token: AtomicUsize,
    attachment: Mutex<Option<SharedAny>>,
    attributes: Mutex<HashMap<String, SharedAny>>,
    filter_states: Mutex<HashMap<usize, Box<dyn Any + Send>>>,
    contexts: Mutex<HashMap<usize, FilterContext>>,
    outbound: Mutex<Outbound>,
    idle: Option<TimeoutNotifier<ChannelId>>,
    read_timeout: Option<TimeoutNotifier<ChannelId>>,
}

/// Handle to one connection
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        service: Arc<dyn Service>,
        admin: Arc<dyn ReactorAdmin>,
        options: ChannelOptions,
    ) -> Channel {
        let id = ChannelId::next();
        let timer = admin.timer();
        let idle = options
            .idle_timeout_ticks
            .and_then(|_| timer.map(|t| t.create_notifier(id)));
        let read_timeout = options
            .read_timeout_ticks
            .and_then(|_| timer.map(|t| t.create_notifier(id)));

        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id,
                state: AtomicU8::new(ChannelState::Connecting as u8),
                transport,
                service,
                admin,
                options,
                token: AtomicUsize::new(usize::MAX),
                attachment: Mutex::new(None),
                attributes: Mutex::new(HashMap::new()),
                filter_states: Mutex::new(HashMap::new()),
                contexts: Mutex::new(HashMap::new()),
                outbound: Mutex::new(Outbound::default()),
                idle,
                read_timeout,
            }),
        };
        if let Some(notifier) = &channel.inner.idle {
            channel.install_timeout(notifier, TimeoutKind::Idle);
        }
        if let Some(notifier) = &channel.inner.read_timeout {
            channel.install_timeout(notifier, TimeoutKind::Read);
        }
        trace!("channel {id} created");
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() >= ChannelState::Closing
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.transport.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.inner.service
    }

    /// Stores `value` in the single attachment slot, returning the previous one.
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: T) -> Option<SharedAny> {
        self.inner.attachment.lock().replace(Arc::new(value))
    }

    /// The attachment, if there is one of type `T`.
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.inner.attachment.lock().clone();
        slot.and_then(|value| value.downcast::<T>().ok())
    }

    pub fn take_attachment(&self) -> Option<SharedAny> {
        self.inner.attachment.lock().take()
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Option<SharedAny> {
        self.inner.attributes.lock().insert(key.into(), Arc::new(value))
    }

    /// The attribute under `key`, if present and of type `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.attributes.lock().get(key).cloned();
        value.and_then(|value| value.downcast::<T>().ok())
    }

    pub fn remove_attribute(&self, key: &str) -> Option<SharedAny> {
        self.inner.attributes.lock().remove(key)
    }

    pub fn attribute_keys(&self) -> Vec<String> {
        self.inner.attributes.lock().keys().cloned().collect()
    }

    /// Messages waiting in the outbound queue, a partially flushed one included.
    pub fn pending_writes(&self) -> usize {
        let out = self.inner.outbound.lock();
        out.queue.len() + usize::from(out.partial.is_some())
    }

    /// Bytes of partially received messages held by the filter chain.
    pub fn buffered_input(&self) -> usize {
        self.inner
            .contexts
            .lock()
            .values()
            .map(FilterContext::pending_len)
            .sum()
    }

    /// Queues `msg` for departure through the whole filter chain.
    ///
    /// Messages are flushed in the order they were written. Writes made
    /// while connecting are held until the channel opens.
    pub fn write(&self, msg: impl Into<Message>) -> Result<()> {
        let chain = self.inner.service.filter_chain().snapshot();
        let index = chain.len();
        self.enqueue(msg.into(), chain, index)
    }

    /// Closes the channel.
    ///
    /// Returns `true` for the one call that performed the teardown. Queued
    /// writes and partially received input are discarded, timeouts are
    /// cancelled and the selector forgets the socket; tasks already running
    /// notice the state change and stop.
    pub fn close(&self) -> bool {
        let inner = &self.inner;
        let mut current = inner.state.load(Ordering::Acquire);
        loop {
            if current >= ChannelState::Closing as u8 {
                return false;
            }
            match inner.state.compare_exchange(
                current,
                ChannelState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        debug!("closing channel {}", inner.id);

        for notifier in [&inner.idle, &inner.read_timeout].into_iter().flatten() {
            notifier.close();
        }
        let dropped = {
            let mut out = inner.outbound.lock();
            let dropped = out.queue.len() + usize::from(out.partial.is_some());
            out.queue.clear();
            out.partial = None;
            dropped
        };
        if dropped > 0 {
            debug!("dropped {dropped} unsent message(s) on channel {}", inner.id);
        }
        inner.contexts.lock().clear();

        inner.admin.on_close_required(self);
        if let Err(e) = inner.transport.shutdown() {
            debug!("shutdown of channel {} failed: {e}", inner.id);
        }
        inner.state.store(ChannelState::Closed as u8, Ordering::Release);
        self.notify("on_channel_closed", |service| service.on_channel_closed(self));
        true
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    pub(crate) fn token(&self) -> usize {
        self.inner.token.load(Ordering::Acquire)
    }

    pub(crate) fn set_token(&self, token: usize) {
        self.inner.token.store(token, Ordering::Release);
    }

    pub(crate) fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// `Connecting -> Open`: arms the idle timeout, tells the service, asks
    /// for read interest and flushes writes queued while connecting.
    pub(crate) fn open(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                ChannelState::Connecting as u8,
                ChannelState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        debug!("channel {} open", self.inner.id);
        self.touch();
        self.notify("on_channel_opened", |service| service.on_channel_opened(self));
        if !self.is_open() {
            return;
        }
        if let Err(err) = self.inner.admin.on_read_required(self) {
            self.raise(err);
            return;
        }
        self.kick_writes();
    }

    /// Worker task run after a writable event on a connecting channel.
    pub(crate) fn complete_connect(&self) {
        if self.state() != ChannelState::Connecting {
            return;
        }
        match self.inner.transport.finish_connect() {
            Ok(true) => self.open(),
            Ok(false) => {
                trace!("spurious connect event on channel {}", self.inner.id);
                if let Err(err) = self.inner.admin.on_write_required(self) {
                    self.raise(err);
                }
            }
            Err(e) => {
                debug!("connect of channel {} failed: {e}", self.inner.id);
                self.raise(Error::Io(e));
            }
        }
    }

    /// Called by the selector when the connect deadline passes.
    pub(crate) fn connect_timed_out(&self) {
        if self.state() != ChannelState::Connecting {
            return;
        }
        debug!("connect of channel {} timed out", self.inner.id);
        self.notify("on_channel_connect_timed_out", |service| {
            service.on_channel_connect_timed_out(self)
        });
        self.close();
    }

    /// Reports `err` to the service; fatal errors close the channel.
    pub(crate) fn raise(&self, err: Error) {
        let fatal = err.is_fatal();
        debug!("channel {} error (fatal: {fatal}): {err}", self.inner.id);
        let service = self.inner.service.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| service.on_channel_exception(self, &err))) {
            error!(
                "on_channel_exception panicked on channel {}: {}",
                self.inner.id,
                Error::from_panic(payload)
            );
        }
        if fatal {
            self.close();
        }
    }

    /// Runs a service callback, reporting a panic as a channel exception.
    fn notify(&self, callback: &str, f: impl FnOnce(&dyn Service)) {
        let service = self.inner.service.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(service.as_ref()))) {
            let err = Error::from_panic(payload);
            error!("{callback} panicked on channel {}: {err}", self.inner.id);
            self.raise(err);
        }
    }

    pub(crate) fn submit_read(&self) {
        let channel = self.clone();
        if let Err(err) = self
            .inner
            .admin
            .submit(self.inner.id.0, Box::new(move || channel.read_task()))
        {
            debug!("read task for channel {} not submitted: {err}", self.inner.id);
        }
    }

    pub(crate) fn submit_write(&self) {
        let channel = self.clone();
        if let Err(err) = self
            .inner
            .admin
            .submit(self.inner.id.0, Box::new(move || channel.write_task()))
        {
            debug!("write task for channel {} not submitted: {err}", self.inner.id);
            self.inner.outbound.lock().writing = false;
        }
    }

    pub(crate) fn submit_connect(&self) {
        let channel = self.clone();
        if let Err(err) = self
            .inner
            .admin
            .submit(self.inner.id.0, Box::new(move || channel.complete_connect()))
        {
            debug!("connect task for channel {} not submitted: {err}", self.inner.id);
        }
    }

    /// Drains the socket up to the throttle and runs the inbound pipeline.
    pub(crate) fn read_task(&self) {
        if !self.is_open() {
            return;
        }
        let inner = &self.inner;
        let factory = inner.service.buffer_factory();
        let throttle = inner.service.throttle().unwrap_or(inner.options.throttle).max(1);
        let chunk = inner.options.read_buffer_size.max(1);

        let datagram = inner.transport.is_datagram();

        let mut reader = Reader(inner.transport.as_ref());
        let mut fragments = Vec::new();
        let mut total = 0;
        let mut eof = false;
        let mut failure = None;
        while total < throttle {
            let mut buf = factory.acquire();
            // A datagram must land in one read or the kernel truncates it
            let want = if datagram {
                MAX_DATAGRAM
            } else {
                chunk.min(throttle - total)
            };
            let result = loop {
                match buf.read_from(&mut reader, want) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            };
            match result {
                Ok(n) if datagram => {
                    // empty datagrams still count against the throttle
                    total += n.max(1);
                    fragments.push(Bytes::copy_from_slice(buf.as_slice()));
                    factory.release(buf);
                }
                Ok(0) => {
                    factory.release(buf);
                    eof = true;
                    break;
                }
                Ok(n) => {
                    total += n;
                    fragments.push(buf.freeze());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    factory.release(buf);
                    break;
                }
                Err(e) => {
                    factory.release(buf);
                    failure = Some(e);
                    break;
                }
            }
        }

        if !fragments.is_empty() {
            trace!("read {} fragment(s) on channel {}", fragments.len(), inner.id);
            self.touch();
            if let Err(err) = self.receive(fragments) {
                self.raise(err);
                return;
            }
        }
        if let Some(e) = failure {
            self.raise(Error::Io(e));
            return;
        }
        if eof {
            debug!("channel {} reached end of stream", inner.id);
            self.close();
            return;
        }
        if !self.is_open() {
            return;
        }
        self.update_read_timeout();
        if let Err(err) = inner.admin.on_read_required(self) {
            self.raise(err);
        }
    }

    fn receive(&self, fragments: Vec<Bytes>) -> Result<()> {
        let chain = self.inner.service.filter_chain().snapshot();
        pipeline::receive(self, &chain, fragments)
    }

    /// Runs `data` through the inbound pipeline as one read.
    #[cfg(test)]
    pub(crate) fn feed(&self, data: &[u8]) {
        if let Err(err) = self.receive(vec![Bytes::copy_from_slice(data)]) {
            self.raise(err);
        }
    }

    pub(crate) fn enqueue(&self, msg: Message, chain: ChainSnapshot, index: usize) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(self.inner.id));
        }
        self.inner
            .outbound
            .lock()
            .queue
            .push_back(Pending { msg, chain, index });
        if self.is_open() {
            self.kick_writes();
        }
        Ok(())
    }

    /// Submits a write task unless one is already draining the queue.
    fn kick_writes(&self) {
        let submit = {
            let mut out = self.inner.outbound.lock();
            let has_work = !out.queue.is_empty() || out.partial.is_some();
            if has_work && !out.writing {
                out.writing = true;
                true
            } else {
                false
            }
        };
        if submit {
            self.submit_write();
        }
    }

    /// Departs and flushes queued messages until the queue is empty or the
    /// socket stops accepting bytes.
    pub(crate) fn write_task(&self) {
        loop {
            if !self.is_open() {
                return;
            }
            let (resume, pending) = {
                let mut out = self.inner.outbound.lock();
                match out.partial.take() {
                    Some(partial) => (Some(partial), None),
                    None => match out.queue.pop_front() {
                        Some(pending) => (None, Some(pending)),
                        None => {
                            out.writing = false;
                            return;
                        }
                    },
                }
            };

            let (bytes, original) = match (resume, pending) {
                (Some(partial), _) => (partial.remaining, partial.original),
                (None, Some(Pending { msg, chain, index })) => {
                    let original = msg.clone();
                    match pipeline::depart(self, &chain, index, msg) {
                        Ok(Some(bytes)) => (bytes, original),
                        Ok(None) => continue,
                        Err(err) => {
                            self.raise(err);
                            continue;
                        }
                    }
                }
                (None, None) => return,
            };

            match self.flush(bytes) {
                Ok(None) => {
                    self.touch();
                    self.notify("on_message_sent", |service| service.on_message_sent(self, original));
                }
                Ok(Some(remaining)) => {
                    trace!(
                        "socket full on channel {}, {} bytes left",
                        self.inner.id,
                        remaining.len()
                    );
                    self.inner.outbound.lock().partial = Some(Partial { remaining, original });
                    if let Err(err) = self.inner.admin.on_write_required(self) {
                        self.raise(err);
                    }
                    return;
                }
                Err(e) => {
                    self.raise(Error::Io(e));
                    return;
                }
            }
        }
    }

    /// Writes `bytes` until done; `Ok(Some(rest))` when the socket is full.
    fn flush(&self, mut bytes: Bytes) -> io::Result<Option<Bytes>> {
        while !bytes.is_empty() {
            match self.inner.transport.write(&bytes) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => bytes.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Some(bytes)),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub(crate) fn with_filter_state<T, R, F>(&self, slot: usize, f: F) -> R
    where
        T: Default + Send + 'static,
        F: FnOnce(&mut T) -> R,
    {
        let taken = self.inner.filter_states.lock().remove(&slot);
        let mut state: Box<T> = match taken.map(|state| state.downcast::<T>()) {
            Some(Ok(state)) => state,
            Some(Err(_)) => {
                warn!(
                    "filter state in slot {slot} of channel {} changed type, starting fresh",
                    self.inner.id
                );
                Box::default()
            }
            None => Box::default(),
        };
        let result = f(&mut *state);
        self.inner.filter_states.lock().insert(slot, state);
        result
    }

    pub(crate) fn clear_filter_state(&self, slot: usize) {
        self.inner.filter_states.lock().remove(&slot);
    }

    pub(crate) fn take_context(&self, slot: usize) -> Option<FilterContext> {
        self.inner.contexts.lock().remove(&slot)
    }

    pub(crate) fn store_context(&self, slot: usize, context: FilterContext) {
        if self.is_closed() {
            return;
        }
        self.inner.contexts.lock().insert(slot, context);
    }

    /// Restarts the idle countdown.
    fn touch(&self) {
        if let (Some(notifier), Some(ticks)) = (&self.inner.idle, self.inner.options.idle_timeout_ticks) {
            notifier.schedule(ticks);
        }
    }

    /// Arms the read timeout while a message is partially received.
    fn update_read_timeout(&self) {
        let (Some(notifier), Some(ticks)) = (&self.inner.read_timeout, self.inner.options.read_timeout_ticks) else {
            return;
        };
        if self.inner.contexts.lock().is_empty() {
            notifier.cancel();
        } else if notifier.state() != NotifierState::Scheduled {
            notifier.schedule(ticks);
        }
    }

    fn install_timeout(&self, notifier: &TimeoutNotifier<ChannelId>, kind: TimeoutKind) {
        let weak = Arc::downgrade(&self.inner);
        notifier.listener(move |id: &ChannelId| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let channel = Channel { inner };
            if !channel.is_open() {
                return;
            }
            let task = channel.clone();
            if let Err(err) = channel
                .inner
                .admin
                .submit(id.0, Box::new(move || task.timed_out(kind)))
            {
                debug!("timeout task for channel {id} not submitted: {err}");
            }
        });
    }

    fn timed_out(&self, kind: TimeoutKind) {
        if !self.is_open() {
            return;
        }
        debug!("channel {} {kind:?} timeout", self.inner.id);
        match kind {
            TimeoutKind::Idle => {
                self.notify("on_channel_idle_timed_out", |service| {
                    service.on_channel_idle_timed_out(self)
                });
            }
            TimeoutKind::Read => {
                if self.inner.contexts.lock().is_empty() {
                    return;
                }
                self.notify("on_channel_read_timed_out", |service| {
                    service.on_channel_read_timed_out(self)
                });
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::testing::{Harness, ManualAdmin, Recorder};
    use super::*;
    use crate::config::SocketOptions;
    use crate::transport::UdpTransport;
    use crate::filter::codec::{payload, LengthFieldFilter};
    use crate::filter::{Filter, FilterChain, Session};

    fn length_chain() -> FilterChain {
        let chain = FilterChain::new();
        chain.add_last("length", Arc::new(LengthFieldFilter::new(4))).unwrap();
        chain
    }

    fn sent(h: &Harness) -> Vec<Vec<u8>> {
        h.service.sent.lock().iter().map(|m| payload(m).to_vec()).collect()
    }

    /// Swallows outbound messages that say "secret".
    struct Censor;

    impl Filter for Censor {
        fn on_msg_depart(&self, _session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
            if payload(&msg) == b"secret" {
                return Ok(false);
            }
            output.push(msg);
            Ok(true)
        }
    }

    /// An open channel over a UDP socket connected to `peer`, with no filters.
    fn udp_channel(peer: &std::net::UdpSocket, options: ChannelOptions) -> (Channel, Arc<Recorder>) {
        let transport = UdpTransport::connect(
            "127.0.0.1:0".parse().unwrap(),
            peer.local_addr().unwrap(),
            &SocketOptions::default(),
        )
        .unwrap();
        let service = Arc::new(Recorder::with_chain(FilterChain::new()));
        let admin = Arc::new(ManualAdmin::default());
        let channel = Channel::new(Box::new(transport), service.clone(), admin.clone(), options);
        channel.open();
        admin.run_all();
        (channel, service)
    }

    fn read_until(channel: &Channel, service: &Recorder, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while service.received.lock().len() < count && Instant::now() < deadline {
            channel.read_task();
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_datagram_larger_than_read_buffer_arrives_whole() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let options = ChannelOptions {
            read_buffer_size: 4,
            throttle: 4,
            ..ChannelOptions::default()
        };
        let (channel, service) = udp_channel(&peer, options);

        peer.send_to(b"0123456789", channel.local_addr().unwrap()).unwrap();
        peer.send_to(b"abcdefgh", channel.local_addr().unwrap()).unwrap();
        read_until(&channel, &service, 2);

        assert_eq!(service.payloads(), vec![b"0123456789".to_vec(), b"abcdefgh".to_vec()]);
        assert!(channel.is_open());
    }

    #[test]
    fn test_empty_datagram_does_not_close_the_channel() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let (channel, service) = udp_channel(&peer, ChannelOptions::default());

        peer.send_to(b"", channel.local_addr().unwrap()).unwrap();
        peer.send_to(b"after", channel.local_addr().unwrap()).unwrap();
        read_until(&channel, &service, 2);

        assert!(channel.is_open());
        assert_eq!(service.closed.load(Ordering::SeqCst), 0);
        assert_eq!(service.payloads(), vec![Vec::new(), b"after".to_vec()]);
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = testing::detached_channel();
        let b = testing::detached_channel();
        assert!(b.id() > a.id());
        assert_eq!(a.state(), ChannelState::Connecting);
    }

    #[test]
    fn test_writes_before_open_are_held_then_flushed_in_order() {
        let h = Harness::new(length_chain());
        h.channel.write("a").unwrap();
        h.channel.write("bc").unwrap();
        assert_eq!(h.admin.queued(), 0);
        assert_eq!(h.channel.pending_writes(), 2);

        let h = h.open();
        assert_eq!(h.service.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.socket.written(), vec![0, 0, 0, 1, b'a', 0, 0, 0, 2, b'b', b'c']);
        assert_eq!(sent(&h), vec![b"a".to_vec(), b"bc".to_vec()]);
        assert_eq!(h.channel.pending_writes(), 0);
    }

    #[test]
    fn test_partial_write_resumes_on_writable() {
        let h = Harness::new(FilterChain::new()).open();
        h.socket.set_write_budget(Some(3));

        h.channel.write("hello").unwrap();
        h.admin.run_all();
        assert_eq!(h.socket.written(), b"hel");
        assert_eq!(h.admin.writes.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.pending_writes(), 1);
        assert!(sent(&h).is_empty());

        // A write task is still in flight, so no second one is submitted
        h.channel.write("world").unwrap();
        assert_eq!(h.admin.queued(), 0);

        h.socket.set_write_budget(None);
        h.channel.write_task();
        assert_eq!(h.socket.written(), b"helloworld");
        assert_eq!(sent(&h), vec![b"hello".to_vec(), b"world".to_vec()]);
        assert_eq!(h.channel.pending_writes(), 0);

        h.channel.write("!").unwrap();
        assert_eq!(h.admin.queued(), 1);
    }

    #[test]
    fn test_departing_filter_can_drop_a_message() {
        let chain = FilterChain::new();
        chain.add_last("censor", Arc::new(Censor)).unwrap();
        let h = Harness::new(chain).open();

        h.channel.write("secret").unwrap();
        h.channel.write("public").unwrap();
        h.admin.run_all();
        assert_eq!(h.socket.written(), b"public");
        assert_eq!(sent(&h), vec![b"public".to_vec()]);
        assert!(h.channel.is_open());
    }

    #[test]
    fn test_unencoded_object_is_fatal() {
        let h = Harness::new(FilterChain::new()).open();
        h.channel.write(Message::object(42u32)).unwrap();
        h.admin.run_all();

        assert!(h.channel.is_closed());
        assert!(h.socket.written().is_empty());
        let errors = h.service.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("not encoded"), "{errors:?}");
    }

    #[test]
    fn test_concurrent_close_runs_once() {
        let h = Harness::new(FilterChain::new()).open();
        h.channel.write("never sent").unwrap();

        let winners: usize = (0..8)
            .map(|_| {
                let channel = h.channel.clone();
                thread::spawn(move || channel.close())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| usize::from(t.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(h.channel.state(), ChannelState::Closed);
        assert_eq!(h.service.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.admin.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.pending_writes(), 0);
        assert!(!h.channel.close());
        assert!(matches!(h.channel.write("late"), Err(Error::Closed(id)) if id == h.channel.id()));

        // The write task submitted before the close finds the channel closed
        h.admin.run_all();
        assert!(h.socket.written().is_empty());
    }

    #[test]
    fn test_read_task_delivers_and_rearms() {
        let h = Harness::new(length_chain()).open();
        assert_eq!(h.admin.reads.load(Ordering::SeqCst), 1);

        h.socket.push_inbound(&[0, 0, 0, 2, b'h', b'i', 0, 0]);
        h.socket.push_inbound(&[0, 1, b'!']);
        h.channel.read_task();
        assert_eq!(h.service.payloads(), vec![b"hi".to_vec(), b"!".to_vec()]);
        assert_eq!(h.admin.reads.load(Ordering::SeqCst), 2);

        h.socket.set_eof();
        h.channel.read_task();
        assert!(h.channel.is_closed());
        assert_eq!(h.admin.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_task_honours_throttle() {
        let options = ChannelOptions {
            read_buffer_size: 2,
            throttle: 4,
            ..ChannelOptions::default()
        };
        let h = Harness::build(FilterChain::new(), ManualAdmin::default(), options).open();
        h.socket.push_inbound(b"abcdefghij");

        h.channel.read_task();
        assert_eq!(h.service.payloads(), vec![b"ab".to_vec(), b"cd".to_vec()]);
        h.channel.read_task();
        assert_eq!(h.service.payloads().concat(), b"abcdefgh");
    }

    #[test]
    fn test_idle_timeout_fires_after_inactivity() {
        let options = ChannelOptions {
            idle_timeout_ticks: Some(2),
            ..ChannelOptions::default()
        };
        let h = Harness::build(FilterChain::new(), ManualAdmin::with_timer(16), options).open();
        let timer = h.admin.timer.as_ref().unwrap();

        timer.tick();
        h.admin.run_all();
        assert_eq!(h.service.idle.load(Ordering::SeqCst), 0);

        timer.tick();
        h.admin.run_all();
        assert_eq!(h.service.idle.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_activity_postpones_idle_timeout() {
        let options = ChannelOptions {
            idle_timeout_ticks: Some(2),
            ..ChannelOptions::default()
        };
        let h = Harness::build(FilterChain::new(), ManualAdmin::with_timer(16), options).open();
        let timer = h.admin.timer.as_ref().unwrap();

        timer.tick();
        h.socket.push_inbound(b"ping");
        h.channel.read_task();
        timer.tick();
        h.admin.run_all();
        assert_eq!(h.service.idle.load(Ordering::SeqCst), 0);

        timer.tick();
        h.admin.run_all();
        assert_eq!(h.service.idle.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_timeout_only_while_a_message_is_incomplete() {
        let options = ChannelOptions {
            read_timeout_ticks: Some(3),
            ..ChannelOptions::default()
        };
        let h = Harness::build(length_chain(), ManualAdmin::with_timer(16), options).open();
        let timer = h.admin.timer.as_ref().unwrap();

        h.socket.push_inbound(&[0, 0, 0, 1, b'x']);
        h.channel.read_task();
        for _ in 0..4 {
            timer.tick();
        }
        h.admin.run_all();
        assert_eq!(h.service.read_timeouts.load(Ordering::SeqCst), 0);

        h.socket.push_inbound(&[0, 0, 0, 5, b'x']);
        h.channel.read_task();
        for _ in 0..3 {
            timer.tick();
        }
        h.admin.run_all();
        assert_eq!(h.service.read_timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_completion_and_timeout() {
        let h = Harness::new(FilterChain::new());
        h.channel.complete_connect();
        h.admin.run_all();
        assert!(h.channel.is_open());
        assert_eq!(h.service.opened.load(Ordering::SeqCst), 1);

        let late = Harness::new(FilterChain::new());
        late.channel.connect_timed_out();
        assert_eq!(late.service.connect_timeouts.load(Ordering::SeqCst), 1);
        assert!(late.channel.is_closed());
        assert_eq!(late.service.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attachment_and_attributes() {
        let channel = testing::detached_channel();
        assert!(channel.attachment::<String>().is_none());
        channel.set_attachment(String::from("session-7"));
        assert_eq!(channel.attachment::<String>().as_deref().map(String::as_str), Some("session-7"));
        assert!(channel.attachment::<u32>().is_none());
        assert!(channel.take_attachment().is_some());
        assert!(channel.attachment::<String>().is_none());

        channel.set_attribute("user", String::from("ada"));
        channel.set_attribute("retries", 3u8);
        assert_eq!(channel.attribute::<u8>("retries").map(|v| *v), Some(3));
        assert!(channel.attribute::<u16>("retries").is_none());
        let mut keys = channel.attribute_keys();
        keys.sort();
        assert_eq!(keys, vec!["retries".to_string(), "user".to_string()]);
        assert!(channel.remove_attribute("user").is_some());
        assert!(channel.attribute::<String>("user").is_none());
    }
}
