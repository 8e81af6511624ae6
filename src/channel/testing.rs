//! Channels without a reactor, for unit tests
//!
//! [`ManualAdmin`] queues submitted tasks instead of running them and counts
//! interest requests; [`Recorder`] is a service that remembers every
//! callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Channel, ChannelId, ChannelOptions};
use crate::error::{Error, Result};
use crate::filter::{FilterChain, Message};
use crate::reactor::ReactorAdmin;
use crate::service::Service;
use crate::timer::TimeoutTimer;
use crate::transport::mock::{MockState, MockTransport};
use crate::worker::Task;

#[derive(Default)]
pub(crate) struct ManualAdmin {
    tasks: Mutex<VecDeque<Task>>,
    pub(crate) registers: AtomicUsize,
    pub(crate) reads: AtomicUsize,
    pub(crate) writes: AtomicUsize,
    pub(crate) closes: AtomicUsize,
    pub(crate) timer: Option<TimeoutTimer<ChannelId>>,
}

impl ManualAdmin {
    pub(crate) fn with_timer(wheel_size: usize) -> Self {
        Self {
            timer: Some(TimeoutTimer::new(wheel_size)),
            ..Self::default()
        }
    }

    pub(crate) fn queued(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Runs queued tasks, including ones they submit, until none are left.
    pub(crate) fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.tasks.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl ReactorAdmin for ManualAdmin {
    fn on_register_required(&self, _channel: &Channel) -> Result<()> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_connect_required(&self, _channel: &Channel) -> Result<()> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_read_required(&self, _channel: &Channel) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_write_required(&self, _channel: &Channel) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_close_required(&self, _channel: &Channel) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn submit(&self, _key: u64, task: Task) -> Result<()> {
        self.tasks.lock().push_back(task);
        Ok(())
    }

    fn timer(&self) -> Option<&TimeoutTimer<ChannelId>> {
        self.timer.as_ref()
    }
}

/// Service remembering what happened to its channels
#[derive(Default)]
pub(crate) struct Recorder {
    pub(crate) chain: FilterChain,
    pub(crate) received: Mutex<Vec<Message>>,
    pub(crate) sent: Mutex<Vec<Message>>,
    pub(crate) errors: Mutex<Vec<String>>,
    pub(crate) opened: AtomicUsize,
    pub(crate) closed: AtomicUsize,
    pub(crate) idle: AtomicUsize,
    pub(crate) read_timeouts: AtomicUsize,
    pub(crate) connect_timeouts: AtomicUsize,
    /// Panic in `on_message_received` for payloads equal to this.
    pub(crate) panic_on: Mutex<Option<Vec<u8>>>,
    /// Close the channel after recording each received message.
    pub(crate) close_on_receive: AtomicBool,
}

impl Recorder {
    pub(crate) fn with_chain(chain: FilterChain) -> Self {
        Self {
            chain,
            ..Self::default()
        }
    }

    pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| m.as_bytes().map(|b| b.to_vec()))
            .collect()
    }
}

impl Service for Recorder {
    fn filter_chain(&self) -> &FilterChain {
        &self.chain
    }

    fn on_channel_opened(&self, _channel: &Channel) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_channel_closed(&self, _channel: &Channel) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message_received(&self, channel: &Channel, msg: Message) -> Result<()> {
        if let (Some(bad), Some(bytes)) = (self.panic_on.lock().as_deref(), msg.as_bytes()) {
            if bad == &bytes[..] {
                panic!("refusing {:?}", String::from_utf8_lossy(bad));
            }
        }
        self.received.lock().push(msg);
        if self.close_on_receive.load(Ordering::SeqCst) {
            channel.close();
        }
        Ok(())
    }

    fn on_message_sent(&self, _channel: &Channel, msg: Message) {
        self.sent.lock().push(msg);
    }

    fn on_channel_exception(&self, _channel: &Channel, err: &Error) {
        self.errors.lock().push(err.to_string());
    }

    fn on_channel_idle_timed_out(&self, _channel: &Channel) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    fn on_channel_connect_timed_out(&self, _channel: &Channel) {
        self.connect_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_channel_read_timed_out(&self, _channel: &Channel) {
        self.read_timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a pipeline test needs to drive one channel by hand
pub(crate) struct Harness {
    pub(crate) channel: Channel,
    pub(crate) service: Arc<Recorder>,
    pub(crate) admin: Arc<ManualAdmin>,
    pub(crate) socket: Arc<MockState>,
}

impl Harness {
    pub(crate) fn new(chain: FilterChain) -> Self {
        Self::build(chain, ManualAdmin::default(), ChannelOptions::default())
    }

    pub(crate) fn build(chain: FilterChain, admin: ManualAdmin, options: ChannelOptions) -> Self {
        let service = Arc::new(Recorder::with_chain(chain));
        let admin = Arc::new(admin);
        let socket = Arc::new(MockState::default());
        let channel = Channel::new(
            Box::new(MockTransport(socket.clone())),
            service.clone(),
            admin.clone(),
            options,
        );
        Self {
            channel,
            service,
            admin,
            socket,
        }
    }

    /// Opens the channel and runs whatever that submitted.
    pub(crate) fn open(self) -> Self {
        self.channel.open();
        self.admin.run_all();
        self
    }
}

/// An unopened channel on a mock socket with an empty chain.
pub(crate) fn detached_channel() -> Channel {
    Harness::new(FilterChain::new()).channel
}
