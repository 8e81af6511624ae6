//! Low-level socket option helpers
//!
//! Thin `setsockopt` wrappers used by [`crate::config::apply_socket_options`]
//! and the listener constructor used by the TCP acceptor. Sockets are
//! addressed by their raw descriptor so the helpers work on `mio` and `std`
//! sockets alike.
//!
//! # Safety
//!
//! `unsafe` is limited to the libc calls themselves; every helper takes a
//! descriptor that the caller keeps open for the duration of the call, and
//! [`tcp_listener`] wraps its new descriptor in an `OwnedFd` immediately.

use std::io;
use std::net::SocketAddr;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

        /// Raw socket handle.
        pub type OsSocket = RawFd;

        /// Raw handle of any socket type.
        pub fn os_socket<S: AsRawFd>(socket: &S) -> OsSocket {
            socket.as_raw_fd()
        }

        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz) }
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz) }
        pub fn set_tos_v4(os: OsSocket, tos: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IP, libc::IP_TOS, tos) }
        pub fn set_tos_v6(os: OsSocket, tc: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tc) }
        pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32) }

        /// Allow several listeners on one port.
        #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
        pub fn set_reuse_port(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as i32) }

        // TCP_QUICKACK and SO_BUSY_POLL have no libc constant on every target
        #[cfg(any(target_os = "linux", target_os = "android"))]
        pub fn set_tcp_quickack(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, 12, on as i32) }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        pub fn set_busy_poll(os: OsSocket, usec: u32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, 46, usec as i32) }

        /// Creates a non-blocking TCP listener on `addr`
        ///
        /// `configure` runs on the raw socket after SO_REUSEADDR is set and
        /// before `bind`, which is where SO_REUSEPORT and buffer sizes must be
        /// applied to be inherited by accepted sockets.
        pub fn tcp_listener<F>(addr: SocketAddr, backlog: i32, configure: F) -> io::Result<std::net::TcpListener>
        where
            F: FnOnce(OsSocket) -> io::Result<()>,
        {
            let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
            let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            // Owned from here on: every early return closes the descriptor
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };

            set_cloexec(fd)?;
            set_nonblocking(fd)?;
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
            configure(fd)?;
            bind_raw(fd, addr)?;
            if unsafe { libc::listen(fd, backlog) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(std::net::TcpListener::from(owned))
        }

        fn set_nonblocking(os: OsSocket) -> io::Result<()> {
            unsafe {
                let flags = libc::fcntl(os, libc::F_GETFL);
                if flags < 0 { return Err(io::Error::last_os_error()); }
                if libc::fcntl(os, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 { return Err(io::Error::last_os_error()); }
            }
            Ok(())
        }

        fn set_cloexec(os: OsSocket) -> io::Result<()> {
            if unsafe { libc::fcntl(os, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn bind_raw(os: OsSocket, addr: SocketAddr) -> io::Result<()> {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let len = match addr {
                SocketAddr::V4(a) => {
                    let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                    sin.sin_family = libc::AF_INET as _;
                    sin.sin_port = a.port().to_be();
                    sin.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) };
                    std::mem::size_of::<libc::sockaddr_in>()
                }
                SocketAddr::V6(a) => {
                    let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                    sin6.sin6_family = libc::AF_INET6 as _;
                    sin6.sin6_port = a.port().to_be();
                    sin6.sin6_flowinfo = a.flowinfo();
                    sin6.sin6_scope_id = a.scope_id();
                    sin6.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
                    std::mem::size_of::<libc::sockaddr_in6>()
                }
            };
            let rc = unsafe {
                libc::bind(os, &storage as *const _ as *const libc::sockaddr, len as libc::socklen_t)
            };
            if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }

        fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
            let v = val as libc::c_int;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    opt,
                    &v as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }
    } else {
        compile_error!("horizon_reactor registers sockets by raw descriptor and supports unix targets only");
    }
}
