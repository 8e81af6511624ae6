#![deny(unsafe_op_in_unsafe_fn)]

//! Selector-thread reactor with a filter-chain message pipeline
//!
//! Selector threads own the sockets and only ever detect readiness; reading,
//! filtering, service callbacks and writing run on a pool of worker threads.
//! Every channel passes its traffic through the [`FilterChain`] of its
//! [`Service`], and idle/read/connect timeouts are driven by timing wheels.

pub mod affinity;
pub mod buffer;
pub mod builder;
pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod list;
pub mod raw; // OS-level socket helpers (unix)
pub mod reactor;
pub mod service;
pub mod tcp;
pub mod timer;
pub mod transport;
pub mod worker;

/// Convenience re-exports
pub use buffer::{Buffer, BufferFactory, HeapBufferFactory, PooledBufferFactory};
pub use builder::ReactorBuilder;
pub use channel::{Channel, ChannelId, ChannelOptions, ChannelState};
pub use config::{ReactorConfig, SocketOptions};
pub use error::{Error, Result};
pub use filter::{Boundary, Filter, FilterChain, Message, Session};
pub use reactor::{Reactor, ReactorAdmin};
pub use service::Service;
pub use tcp::TcpAcceptor;
pub use timer::{NotifierState, TimeoutNotifier, TimeoutTimer};
pub use transport::{TcpTransport, Transport, UdpTransport};
pub use worker::{Task, WorkerPool};
