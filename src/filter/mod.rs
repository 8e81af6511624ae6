//! Filters and filter chains
//!
//! A [`Filter`] is one protocol stage between the socket and a service. On
//! the way in it first tells the pipeline where a message ends
//! ([`Filter::tell_boundary`]) and then transforms each complete message
//! ([`Filter::on_msg_arrive`]); on the way out it transforms messages headed
//! for the socket ([`Filter::on_msg_depart`]).
//!
//! Filters are shared by every channel of a service and hold no
//! per-connection state of their own. State that must survive between
//! messages of one connection lives in the channel, in a slot reserved for
//! the filter when it joined the chain; [`Session::with_state`] reaches it.
//!
//! A [`FilterChain`] is the ordered, uniquely named list of filters of one
//! service. Editing the chain publishes a new immutable array; pipelines
//! already running keep the snapshot they started with.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use horizon_reactor::filter::FilterChain;
//! use horizon_reactor::filter::codec::{LengthFieldFilter, LineFilter};
//!
//! let chain = FilterChain::new();
//! chain.add_last("frame", Arc::new(LengthFieldFilter::new(4))).unwrap();
//! chain.add_first("lines", Arc::new(LineFilter::new())).unwrap();
//! assert_eq!(chain.names(), vec!["lines", "frame"]);
//! assert!(chain.add_last("frame", Arc::new(LineFilter::new())).is_err());
//! ```

pub mod codec;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::error::{Error, Result};

/// Unit of data travelling through a filter chain
///
/// Only `Bytes` messages are subject to boundary detection. `Object`
/// messages are produced by decoding filters and go straight to the next
/// stage's [`Filter::on_msg_arrive`]; they must be encoded back to bytes
/// before they reach the socket.
#[derive(Clone)]
pub enum Message {
    Bytes(Bytes),
    Object(Arc<dyn Any + Send + Sync>),
}

impl Message {
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Message::Object(Arc::new(value))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Message::Bytes(b) => Some(b),
            Message::Object(_) => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Message::Bytes(b) => Some(b),
            Message::Object(_) => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Message::Object(o) => o.downcast_ref(),
            Message::Bytes(_) => None,
        }
    }

    /// Byte length of a `Bytes` message, zero for objects.
    pub fn len(&self) -> usize {
        self.as_bytes().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            Message::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Bytes(b)
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Message {
    fn from(s: &'static [u8]) -> Self {
        Message::Bytes(Bytes::from_static(s))
    }
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self {
        Message::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Bytes(Bytes::from(s))
    }
}

impl From<Buffer> for Message {
    fn from(b: Buffer) -> Self {
        Message::Bytes(b.freeze())
    }
}

/// Answer of [`Filter::tell_boundary`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boundary {
    /// Not enough bytes to know the message length yet.
    Underflow,
    /// The input is corrupt; the channel will be closed.
    Error,
    /// The next message is this many bytes long. `Length(0)` counts as
    /// underflow.
    Length(usize),
}

/// One protocol stage of a filter chain
///
/// The defaults make a pass-through filter: all buffered bytes form one
/// message, and messages travel unchanged in both directions.
///
/// `on_msg_arrive` and `on_msg_depart` return `Ok(true)` to pass their
/// output on. Returning `Ok(false)` on arrival with no output rejects the
/// input and closes the channel; returning `Ok(false)` with output sends that
/// output back towards the socket, departing through the filters before this
/// one (a handshake reply, for instance). Returning `Ok(false)` on departure
/// drops the message.
pub trait Filter: Send + Sync + 'static {
    /// Bytes that must be buffered before `tell_boundary` is consulted.
    fn msg_min_size(&self) -> usize {
        0
    }

    fn tell_boundary(&self, _session: &Session<'_>, data: &[u8]) -> Boundary {
        if data.is_empty() {
            Boundary::Underflow
        } else {
            Boundary::Length(data.len())
        }
    }

    fn on_msg_arrive(&self, _session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
        output.push(msg);
        Ok(true)
    }

    fn on_msg_depart(&self, _session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
        output.push(msg);
        Ok(true)
    }
}

/// A filter together with its name and state slot
#[derive(Clone)]
pub struct FilterEntry {
    name: Arc<str>,
    slot: usize,
    filter: Arc<dyn Filter>,
}

impl FilterEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the filter's per-channel state slot; never reused by the chain.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn filter(&self) -> &Arc<dyn Filter> {
        &self.filter
    }
}

impl fmt::Debug for FilterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterEntry")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Immutable view of a chain, taken before each pipeline cycle.
pub type ChainSnapshot = Arc<[FilterEntry]>;

/// Ordered set of uniquely named filters shared by a service's channels
pub struct FilterChain {
    entries: RwLock<ChainSnapshot>,
    next_slot: AtomicUsize,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::from(Vec::new())),
            next_slot: AtomicUsize::new(0),
        }
    }

    /// Builds a chain from `(name, filter)` pairs, first pair closest to the
    /// socket.
    pub fn from_filters<I, N>(filters: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, Arc<dyn Filter>)>,
        N: Into<String>,
    {
        let chain = Self::new();
        for (name, filter) in filters {
            chain.add_last(name, filter)?;
        }
        Ok(chain)
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.to_string()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|e| &*e.name == name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.entries
            .read()
            .iter()
            .find(|e| &*e.name == name)
            .map(|e| e.filter.clone())
    }

    /// Adds a filter nearest the socket.
    pub fn add_first(&self, name: impl Into<String>, filter: Arc<dyn Filter>) -> Result<()> {
        self.insert(name.into(), filter, |_| Ok(0))
    }

    /// Adds a filter nearest the service.
    pub fn add_last(&self, name: impl Into<String>, filter: Arc<dyn Filter>) -> Result<()> {
        self.insert(name.into(), filter, |entries| Ok(entries.len()))
    }

    pub fn add_before(&self, base: &str, name: impl Into<String>, filter: Arc<dyn Filter>) -> Result<()> {
        self.insert(name.into(), filter, |entries| position(entries, base))
    }

    pub fn add_after(&self, base: &str, name: impl Into<String>, filter: Arc<dyn Filter>) -> Result<()> {
        self.insert(name.into(), filter, |entries| position(entries, base).map(|i| i + 1))
    }

    /// Removes a filter and returns it.
    pub fn remove(&self, name: &str) -> Result<Arc<dyn Filter>> {
        let mut entries = self.entries.write();
        let index = position(&entries, name)?;
        let mut next = entries.to_vec();
        let removed = next.remove(index);
        *entries = Arc::from(next);
        Ok(removed.filter)
    }

    /// Swaps the filter registered under `name`, returning the old one.
    ///
    /// The replacement gets a fresh state slot, so state left by the old
    /// filter is never seen by the new one.
    pub fn replace(&self, name: &str, filter: Arc<dyn Filter>) -> Result<Arc<dyn Filter>> {
        let mut entries = self.entries.write();
        let index = position(&entries, name)?;
        let mut next = entries.to_vec();
        let old = std::mem::replace(
            &mut next[index],
            FilterEntry {
                name: Arc::from(name),
                slot: self.next_slot.fetch_add(1, Ordering::Relaxed),
                filter,
            },
        );
        *entries = Arc::from(next);
        Ok(old.filter)
    }

    fn insert<F>(&self, name: String, filter: Arc<dyn Filter>, at: F) -> Result<()>
    where
        F: FnOnce(&[FilterEntry]) -> Result<usize>,
    {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| *e.name == *name) {
            return Err(Error::DuplicateFilter(name));
        }
        let index = at(&entries)?;
        let mut next = entries.to_vec();
        next.insert(
            index,
            FilterEntry {
                name: Arc::from(name),
                slot: self.next_slot.fetch_add(1, Ordering::Relaxed),
                filter,
            },
        );
        *entries = Arc::from(next);
        Ok(())
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn position(entries: &[FilterEntry], name: &str) -> Result<usize> {
    entries
        .iter()
        .position(|e| &*e.name == name)
        .ok_or_else(|| Error::UnknownFilter(name.to_string()))
}

/// What a filter sees of the channel it is working for
pub struct Session<'a> {
    channel: &'a Channel,
    entry: &'a FilterEntry,
}

impl<'a> Session<'a> {
    pub(crate) fn new(channel: &'a Channel, entry: &'a FilterEntry) -> Self {
        Self { channel, entry }
    }

    pub fn channel(&self) -> &Channel {
        self.channel
    }

    pub fn filter_name(&self) -> &str {
        self.entry.name()
    }

    /// Runs `f` on this filter's private state for this channel, creating it
    /// with `T::default()` on first use.
    pub fn with_state<T, R, F>(&self, f: F) -> R
    where
        T: Default + Send + 'static,
        F: FnOnce(&mut T) -> R,
    {
        self.channel.with_filter_state(self.entry.slot, f)
    }

    /// Drops this filter's private state for this channel.
    pub fn clear_state(&self) {
        self.channel.clear_filter_state(self.entry.slot);
    }

    /// Queues `msg` for departure through the whole chain.
    pub fn write(&self, msg: impl Into<Message>) -> Result<()> {
        self.channel.write(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Filter for Nop {}

    fn nop() -> Arc<dyn Filter> {
        Arc::new(Nop)
    }

    #[test]
    fn test_chain_editing() {
        let chain = FilterChain::new();
        chain.add_last("b", nop()).unwrap();
        chain.add_first("a", nop()).unwrap();
        chain.add_after("b", "d", nop()).unwrap();
        chain.add_before("d", "c", nop()).unwrap();
        assert_eq!(chain.names(), vec!["a", "b", "c", "d"]);

        chain.remove("b").unwrap();
        assert_eq!(chain.names(), vec!["a", "c", "d"]);
        assert!(!chain.contains("b"));
        assert!(chain.get("c").is_some());
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_names_are_unique() {
        let chain = FilterChain::new();
        chain.add_last("x", nop()).unwrap();
        assert!(matches!(chain.add_first("x", nop()), Err(Error::DuplicateFilter(n)) if n == "x"));
        assert!(matches!(chain.add_before("missing", "y", nop()), Err(Error::UnknownFilter(_))));
        assert!(matches!(chain.remove("missing"), Err(Error::UnknownFilter(_))));
    }

    #[test]
    fn test_slots_are_never_reused() {
        let chain = FilterChain::new();
        chain.add_last("a", nop()).unwrap();
        chain.add_last("b", nop()).unwrap();
        let before: Vec<_> = chain.snapshot().iter().map(FilterEntry::slot).collect();
        chain.remove("a").unwrap();
        chain.add_last("a", nop()).unwrap();
        chain.replace("b", nop()).unwrap();
        let after: Vec<_> = chain.snapshot().iter().map(FilterEntry::slot).collect();
        assert_eq!(before, vec![0, 1]);
        assert_eq!(after, vec![3, 2]);
    }

    #[test]
    fn test_snapshot_is_isolated_from_edits() {
        let chain = FilterChain::from_filters([("a", nop()), ("b", nop())]).unwrap();
        let snapshot = chain.snapshot();
        chain.remove("a").unwrap();
        chain.add_last("c", nop()).unwrap();
        let names: Vec<_> = snapshot.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(chain.names(), vec!["b", "c"]);
    }

    #[test]
    fn test_message_accessors() {
        let bytes = Message::from("abc");
        assert_eq!(bytes.len(), 3);
        assert_eq!(bytes.as_bytes().map(|b| &b[..]), Some(&b"abc"[..]));
        assert!(bytes.downcast_ref::<u32>().is_none());

        let object = Message::object(7u32);
        assert_eq!(object.downcast_ref::<u32>(), Some(&7));
        assert!(object.is_empty());
        assert!(object.into_bytes().is_none());
    }
}
