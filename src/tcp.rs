//! TCP listening sockets
//!
//! [`listen`] builds a non-blocking listener with the reactor's socket
//! options already applied, so accepted sockets inherit buffer sizes and
//! TOS from it. A [`TcpAcceptor`] is the handle a service gets back from
//! [`Reactor::bind`](crate::reactor::Reactor::bind): the listener lives on a
//! selector thread, which accepts connections and hands each one to the
//! selector owning the new channel.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::debug;

use crate::config::{apply_datagram_options, SocketOptions};
use crate::raw;
use crate::service::Service;

/// Creates a non-blocking TCP listener on `addr`.
///
/// `SO_REUSEADDR` is always set; `SO_REUSEPORT`, buffer sizes and TOS follow
/// `opts`. The socket is configured before `bind` so the options also apply
/// to the listen queue.
pub fn listen(addr: SocketAddr, opts: &SocketOptions) -> io::Result<mio::net::TcpListener> {
    let listener = raw::tcp_listener(addr, opts.tcp_backlog, |os| {
        #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
        {
            if opts.reuse_port {
                raw::set_reuse_port(os, true)?;
            }
        }
        apply_datagram_options(os, addr.is_ipv6(), opts)
    })?;
    Ok(mio::net::TcpListener::from_std(listener))
}

/// State shared between an acceptor handle and its selector thread.
pub(crate) struct AcceptorShared {
    pub(crate) listener: mio::net::TcpListener,
    pub(crate) service: Arc<dyn Service>,
    pub(crate) selector: usize,
    /// Selector slab key; `usize::MAX` until registered.
    pub(crate) token: AtomicUsize,
    closed: AtomicBool,
}

impl AcceptorShared {
    pub(crate) fn new(listener: mio::net::TcpListener, service: Arc<dyn Service>, selector: usize) -> Self {
        Self {
            listener,
            service,
            selector,
            token: AtomicUsize::new(usize::MAX),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Something that can stop a listener on the selector it lives on.
pub(crate) trait ListenerControl: Send + Sync {
    fn unlisten(&self, acceptor: Arc<AcceptorShared>);
}

/// A listening socket accepting connections for one service
///
/// Dropping the acceptor stops listening; channels already accepted are not
/// affected.
pub struct TcpAcceptor {
    shared: Arc<AcceptorShared>,
    control: Weak<dyn ListenerControl>,
}

impl TcpAcceptor {
    pub(crate) fn new(shared: Arc<AcceptorShared>, control: Weak<dyn ListenerControl>) -> Self {
        Self { shared, control }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.listener.local_addr()
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.shared.service
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stops accepting. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("closing acceptor on {:?}", self.local_addr().ok());
        if let Some(control) = self.control.upgrade() {
            control.unlisten(self.shared.clone());
        }
        true
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("local_addr", &self.local_addr().ok())
            .field("selector", &self.shared.selector)
            .field("closed", &self.is_closed())
            .finish()
    }
}
