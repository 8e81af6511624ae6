//! One selector thread: a mio `Poll`, the channels it owns and their
//! connect deadlines.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use super::{Intake, ReactorAdmin, ReactorInner, WAKE_TOKEN};
use crate::channel::{Channel, ChannelOptions, ChannelState};
use crate::error::Error;
use crate::tcp::AcceptorShared;
use crate::timer::{TimerHandle, TimingWheel};
use crate::transport::TcpTransport;

struct ChannelEntry {
    channel: Channel,
    /// Interest currently registered with the poll; `None` when deregistered.
    interest: Option<Interest>,
    connect_timer: Option<TimerHandle>,
}

impl ChannelEntry {
    /// Drops the connect deadline once the channel has left `Connecting`.
    fn settle_connect(&mut self, deadlines: &mut TimingWheel<Channel>) {
        if self.channel.state() == ChannelState::Connecting {
            return;
        }
        if let Some(handle) = self.connect_timer.take() {
            deadlines.cancel(handle);
        }
    }
}

enum Registration {
    Channel(ChannelEntry),
    Listener(Arc<AcceptorShared>),
}

pub(crate) struct Selector {
    index: usize,
    poll: Poll,
    intake: Arc<Intake>,
    reactor: Arc<ReactorInner>,
    registrations: Slab<Registration>,
    /// Connect deadlines; only this thread touches it.
    deadlines: TimingWheel<Channel>,
    tick: Duration,
    last_tick: Instant,
}

impl Selector {
    pub(crate) fn new(index: usize, poll: Poll, reactor: Arc<ReactorInner>) -> Self {
        let intake = reactor.intakes[index].clone();
        let tick = Duration::from_millis(reactor.config.tick_ms);
        Self {
            index,
            poll,
            intake,
            deadlines: TimingWheel::new(reactor.config.wheel_capacity()),
            registrations: Slab::with_capacity(1024),
            tick,
            last_tick: Instant::now(),
            reactor,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("selector {} running", self.index);
        let mut events = Events::with_capacity(self.reactor.config.events_capacity);
        let timeout = self.reactor.config.poll_timeout_ms.map(Duration::from_millis);

        while self.reactor.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("selector {} poll failed: {e}", self.index);
                break;
            }

            self.drain_intake();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let key = event.token().0;
                let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(key, event)));
                if let Err(payload) = outcome {
                    let err = Error::from_panic(payload);
                    error!("selector {} failed handling key {key}: {err}", self.index);
                    self.fail(key, err);
                }
            }
            self.advance_deadlines();
        }

        self.teardown();
        debug!("selector {} stopped", self.index);
    }

    fn drain_intake(&mut self) {
        let intake = self.intake.clone();
        while let Some(acceptor) = intake.listen.pop() {
            self.listen(acceptor);
        }
        while let Some(acceptor) = intake.unlisten.pop() {
            self.unlisten(&acceptor);
        }
        while let Some(channel) = intake.connect.pop() {
            self.connect(channel);
        }
        while let Some(channel) = intake.register.pop() {
            self.register(channel);
        }
        while let Some(channel) = intake.read.pop() {
            self.want(&channel, Interest::READABLE);
        }
        while let Some(channel) = intake.write.pop() {
            self.want(&channel, Interest::WRITABLE);
        }
        while let Some(channel) = intake.close.pop() {
            self.forget(&channel);
        }
    }

    fn dispatch(&mut self, key: usize, event: &Event) {
        let acceptor = match self.registrations.get(key) {
            Some(Registration::Listener(acceptor)) => Some(acceptor.clone()),
            Some(Registration::Channel(_)) => None,
            None => {
                trace!("selector {} event for stale key {key}", self.index);
                return;
            }
        };
        if let Some(acceptor) = acceptor {
            self.accept(&acceptor);
            return;
        }
        let Some(Registration::Channel(entry)) = self.registrations.get(key) else {
            return;
        };

        let Some(current) = entry.interest else {
            return;
        };
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable() || event.is_write_closed() || event.is_error();
        let channel = entry.channel.clone();
        let connecting = channel.state() == ChannelState::Connecting;

        let mut remaining = Some(current);
        let mut read = false;
        let mut write = false;
        if readable && current.is_readable() && !connecting {
            remaining = remaining.and_then(|i| i.remove(Interest::READABLE));
            read = true;
        }
        if writable && current.is_writable() {
            remaining = remaining.and_then(|i| i.remove(Interest::WRITABLE));
            write = true;
        }
        if !read && !write {
            return;
        }

        if let Err(e) = self.set_interest(key, remaining) {
            self.fail(key, Error::Io(e));
            return;
        }
        if read {
            channel.submit_read();
        }
        if write {
            if connecting {
                channel.submit_connect();
            } else {
                channel.submit_write();
            }
        }
    }

    fn accept(&mut self, acceptor: &Arc<AcceptorShared>) {
        if acceptor.is_closed() {
            return;
        }
        let reactor = self.reactor.clone();
        let config = &reactor.config;
        loop {
            let (stream, peer) = match acceptor.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("selector {} accept failed: {e}", self.index);
                    return;
                }
            };
            let transport = match TcpTransport::accepted(stream, &config.socket) {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("dropping connection from {peer}: {e}");
                    continue;
                }
            };
            let admin: Arc<dyn ReactorAdmin> = reactor.clone();
            let channel = Channel::new(
                Box::new(transport),
                acceptor.service.clone(),
                admin,
                ChannelOptions::from(config),
            );
            debug!("accepted {peer} as channel {}", channel.id());

            // Queueing to ourselves could wait on a queue only we drain
            if reactor.owner(&channel) == self.index {
                self.register(channel);
            } else if let Err(err) = reactor.on_register_required(&channel) {
                debug!("channel {} not registered: {err}", channel.id());
            }
        }
    }

    fn listen(&mut self, acceptor: Arc<AcceptorShared>) {
        if acceptor.is_closed() {
            return;
        }
        let entry = self.registrations.vacant_entry();
        let key = entry.key();
        let fd = acceptor.listener_fd();
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(key), Interest::READABLE)
        {
            Ok(()) => {
                acceptor.token.store(key, Ordering::Release);
                entry.insert(Registration::Listener(acceptor));
            }
            Err(e) => error!("selector {} cannot watch listener: {e}", self.index),
        }
    }

    fn unlisten(&mut self, acceptor: &Arc<AcceptorShared>) {
        let key = acceptor.token.load(Ordering::Acquire);
        let matches = matches!(
            self.registrations.get(key),
            Some(Registration::Listener(current)) if Arc::ptr_eq(current, acceptor)
        );
        if !matches {
            return;
        }
        let fd = acceptor.listener_fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!("selector {} deregistering listener: {e}", self.index);
        }
        self.registrations.remove(key);
    }

    fn insert(&mut self, channel: Channel) -> usize {
        let key = self.registrations.insert(Registration::Channel(ChannelEntry {
            channel: channel.clone(),
            interest: None,
            connect_timer: None,
        }));
        channel.set_token(key);
        key
    }

    /// Takes ownership of a connected channel and opens it on a worker.
    fn register(&mut self, channel: Channel) {
        if channel.is_closed() {
            return;
        }
        self.insert(channel.clone());
        trace!("selector {} registered channel {}", self.index, channel.id());
        let task = channel.clone();
        if let Err(err) = self
            .reactor
            .submit(channel.id().as_u64(), Box::new(move || task.open()))
        {
            debug!("channel {} not opened: {err}", channel.id());
        }
    }

    fn connect(&mut self, channel: Channel) {
        if channel.is_closed() {
            return;
        }
        let key = self.insert(channel.clone());
        if let Err(e) = self.set_interest(key, Some(Interest::WRITABLE)) {
            self.fail(key, Error::Io(e));
            return;
        }
        if let Some(ticks) = self.reactor.config.connect_timeout_ticks {
            let handle = self.deadlines.schedule(channel, ticks);
            if let Some(Registration::Channel(entry)) = self.registrations.get_mut(key) {
                entry.connect_timer = Some(handle);
            }
        }
    }

    fn want(&mut self, channel: &Channel, interest: Interest) {
        let Some(key) = self.key_of(channel) else {
            return;
        };
        if channel.is_closed() {
            return;
        }
        let current = match &mut self.registrations[key] {
            Registration::Channel(entry) => {
                entry.settle_connect(&mut self.deadlines);
                entry.interest
            }
            Registration::Listener(_) => return,
        };
        let wanted = current.map_or(interest, |i| i.add(interest));
        if let Err(e) = self.set_interest(key, Some(wanted)) {
            self.fail(key, Error::Io(e));
        }
    }

    /// Drops a closed channel's registration and deadline.
    fn forget(&mut self, channel: &Channel) {
        let Some(key) = self.key_of(channel) else {
            return;
        };
        if let Err(e) = self.set_interest(key, None) {
            debug!("selector {} deregistering channel {}: {e}", self.index, channel.id());
        }
        if let Registration::Channel(entry) = self.registrations.remove(key) {
            if let Some(handle) = entry.connect_timer {
                self.deadlines.cancel(handle);
            }
        }
        channel.set_token(usize::MAX);
        trace!("selector {} forgot channel {}", self.index, channel.id());
    }

    fn key_of(&self, channel: &Channel) -> Option<usize> {
        let key = channel.token();
        match self.registrations.get(key) {
            Some(Registration::Channel(entry)) if entry.channel.same(channel) => Some(key),
            _ => None,
        }
    }

    fn set_interest(&mut self, key: usize, wanted: Option<Interest>) -> io::Result<()> {
        let Some(Registration::Channel(entry)) = self.registrations.get_mut(key) else {
            return Ok(());
        };
        let fd = entry.channel.transport().raw_fd();
        let registry = self.poll.registry();
        match (entry.interest, wanted) {
            (None, Some(interest)) => registry.register(&mut SourceFd(&fd), Token(key), interest)?,
            (Some(_), Some(interest)) => registry.reregister(&mut SourceFd(&fd), Token(key), interest)?,
            (Some(_), None) => registry.deregister(&mut SourceFd(&fd))?,
            (None, None) => {}
        }
        entry.interest = wanted;
        Ok(())
    }

    /// Hands a failure on key `key` to a worker; closing from here could
    /// wait on our own close queue.
    fn fail(&self, key: usize, err: Error) {
        let Some(Registration::Channel(entry)) = self.registrations.get(key) else {
            return;
        };
        let channel = entry.channel.clone();
        let task = channel.clone();
        if let Err(e) = self
            .reactor
            .submit(channel.id().as_u64(), Box::new(move || task.raise(err)))
        {
            debug!("failure of channel {} not reported: {e}", channel.id());
        }
    }

    fn advance_deadlines(&mut self) {
        let elapsed = self.last_tick.elapsed();
        let mut due = elapsed.as_millis() / self.tick.as_millis().max(1);
        while due > 0 {
            self.last_tick += self.tick;
            due -= 1;
            for (handle, channel) in self.deadlines.tick() {
                if let Some(key) = self.key_of(&channel) {
                    if let Registration::Channel(entry) = &mut self.registrations[key] {
                        if entry.connect_timer == Some(handle) {
                            entry.connect_timer = None;
                        }
                    }
                }
                if channel.state() != ChannelState::Connecting {
                    continue;
                }
                let task = channel.clone();
                if let Err(err) = self
                    .reactor
                    .submit(channel.id().as_u64(), Box::new(move || task.connect_timed_out()))
                {
                    debug!("connect timeout of channel {} not delivered: {err}", channel.id());
                }
            }
        }
    }

    /// Closes everything this selector owns; runs once the reactor stops.
    fn teardown(&mut self) {
        self.deadlines.clear();
        let registrations: Vec<_> = self.registrations.drain().collect();
        let mut closed = 0;
        for registration in registrations {
            match registration {
                Registration::Channel(entry) => {
                    if entry.interest.is_some() {
                        let fd = entry.channel.transport().raw_fd();
                        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                    }
                    if entry.channel.close() {
                        closed += 1;
                    }
                }
                Registration::Listener(acceptor) => {
                    let fd = acceptor.listener_fd();
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
            }
        }
        if closed > 0 {
            debug!("selector {} closed {closed} channel(s) on shutdown", self.index);
        }
    }
}
