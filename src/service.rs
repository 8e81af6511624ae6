//! Service contract
//!
//! A [`Service`] owns the filter chain of its channels and receives their
//! lifecycle and message callbacks. Callbacks run on worker threads; a panic
//! inside one is caught, logged and reported through
//! [`Service::on_channel_exception`].
//!
//! Every callback except [`Service::filter_chain`] has a default. The
//! timeout defaults close the channel; the exception default logs and closes.

use std::sync::{Arc, OnceLock};

use log::warn;

use crate::buffer::{BufferFactory, PooledBufferFactory};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::filter::{FilterChain, Message};

/// Process-wide read buffer pool used by services that do not supply one.
pub fn default_buffer_factory() -> Arc<dyn BufferFactory> {
    static POOL: OnceLock<Arc<PooledBufferFactory>> = OnceLock::new();
    POOL.get_or_init(|| Arc::new(PooledBufferFactory::default()))
        .clone()
}

/// Callbacks and resources of one network service
pub trait Service: Send + Sync + 'static {
    /// Chain applied to every channel of this service.
    fn filter_chain(&self) -> &FilterChain;

    /// Source of read buffers for this service's channels.
    fn buffer_factory(&self) -> Arc<dyn BufferFactory> {
        default_buffer_factory()
    }

    /// Bytes read per burst before the pipeline runs; `None` uses the
    /// reactor-wide setting.
    fn throttle(&self) -> Option<usize> {
        None
    }

    fn on_channel_opened(&self, _channel: &Channel) {}

    /// Called exactly once per channel.
    fn on_channel_closed(&self, _channel: &Channel) {}

    /// A complete message made it through the whole chain.
    fn on_message_received(&self, _channel: &Channel, _msg: Message) -> Result<()> {
        Ok(())
    }

    /// `msg` (as originally written) has been flushed to the socket.
    fn on_message_sent(&self, _channel: &Channel, _msg: Message) {}

    /// Framing, i/o and handler failures. Fatal errors close the channel
    /// after this returns regardless of what the service does.
    fn on_channel_exception(&self, channel: &Channel, err: &Error) {
        warn!("channel {} failed: {err}", channel.id());
        channel.close();
    }

    fn on_channel_idle_timed_out(&self, channel: &Channel) {
        channel.close();
    }

    /// The channel is closed after this returns.
    fn on_channel_connect_timed_out(&self, _channel: &Channel) {}

    fn on_channel_read_timed_out(&self, channel: &Channel) {
        channel.close();
    }
}
