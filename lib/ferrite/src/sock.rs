//! Socket plumbing for the server: listener construction, per-socket option
//! tuning and the passive/active data-channel endpoints.

use crate::support::{NetError, NetResult};
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;

pub const LISTEN_BACKLOG: i32 = 10;

// Ephemeral range scanned for passive-mode listeners.
const PASV_PORT_FIRST: u16 = 49152;
const PASV_PORT_LAST: u16 = 65534;

/// Binds the control listener on all IPv4 interfaces. Address reuse is
/// enabled so a restarted server can rebind while old sessions linger.
pub fn listen(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;

    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Binds a passive-mode data listener on the first free ephemeral port.
pub fn listen_passive() -> io::Result<(TcpListener, u16)> {
    for port in PASV_PORT_FIRST..=PASV_PORT_LAST {
        let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));

        match TcpListener::bind(addr) {
            Ok(listener) => return Ok((listener, port)),
            Err(ref err) if err.kind() == io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(err),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "No free passive port",
    ))
}

/// Accepts one pending connection, retrying through signal interruptions.
pub fn accept(listener: &TcpListener) -> NetResult<(TcpStream, SocketAddr)> {
    loop {
        match listener.accept() {
            Ok(pair) => return Ok(pair),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(NetError::from(err)),
        }
    }
}

/// Starts a non-blocking connect towards a PORT endpoint. Completion is
/// signalled by the first writable readiness event on the stream.
pub fn connect(addr: SocketAddrV4) -> io::Result<TcpStream> {
    TcpStream::connect(SocketAddr::V4(addr))
}

/// Applies the control-socket options: linger so queued replies survive the
/// close, a bounded send timeout, and no Nagle delay for short replies.
pub fn tune_control(stream: &TcpStream) -> io::Result<()> {
    let fd = stream.as_raw_fd();

    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 15,
    };
    set_option(fd, libc::SOL_SOCKET, libc::SO_LINGER, &linger)?;

    let send_timeout = libc::timeval {
        tv_sec: 5,
        tv_usec: 0,
    };
    set_option(fd, libc::SOL_SOCKET, libc::SO_SNDTIMEO, &send_timeout)?;

    set_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &1i32)
}

fn set_option<T>(fd: i32, level: i32, name: i32, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_binds_ephemeral() {
        let listener = listen(0).unwrap();
        let addr = listener.local_addr().unwrap();

        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_listen_passive_stays_in_range() {
        let (_listener, port) = listen_passive().unwrap();

        assert!(port >= PASV_PORT_FIRST && port <= PASV_PORT_LAST);
    }

    #[test]
    fn test_tune_control_applies() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let stream = TcpStream::from_std(accepted);

        tune_control(&stream).unwrap();
    }
}
