//! Per-client control-channel state. A `Session` owns the control socket,
//! the transient data sockets and every piece of FTP state the handlers
//! mutate. All replies go through the write queue so a stalled socket never
//! blocks the event loop.

use crate::buffer::Buffer;
use crate::support::{NetError, NetResult};
use crate::transfer::Transfer;
use flux::logging;
use mio::net::{TcpListener, TcpStream};
use std::io::Read;
use std::net::{SocketAddr, SocketAddrV4};

const WRITE_QUEUE_SIZE: usize = 8192;

// Commands longer than this without a line break are dropped as noise.
const MAX_LINE: usize = 4096;

/// Control-channel authentication state.
#[derive(Debug, Eq, PartialEq)]
pub enum ControlState {
    /// Connected, greeting sent, no USER seen yet.
    Greeting,
    /// A login attempt failed; waiting for a fresh USER.
    AwaitingUser,
    /// USER received, waiting for PASS.
    AwaitingPass(String),
    Authenticated,
    /// QUIT acknowledged; the session dies once the queue drains.
    Closed,
}

pub struct Session {
    pub(crate) control: TcpStream,
    pub(crate) peer: SocketAddr,

    /// Connected data socket, active or accepted passive.
    pub(crate) data: Option<TcpStream>,
    /// Passive listener awaiting the client's data connection.
    pub(crate) pasv: Option<TcpListener>,
    /// True while an active-mode connect is still in flight.
    pub(crate) data_connecting: bool,

    pub(crate) state: ControlState,
    pub(crate) cwd: String,
    pub(crate) type_binary: bool,
    pub(crate) rest_offset: u64,
    pub(crate) rename_from: Option<String>,
    pub(crate) pasv_endpoint: Option<SocketAddrV4>,
    pub(crate) port_endpoint: Option<SocketAddrV4>,
    pub(crate) transfer: Option<Transfer>,
    pub(crate) last_cmd: String,

    // Partial command line carried across readiness events.
    pub(crate) line_buf: Vec<u8>,
    pub(crate) write_queue: Buffer,

    pub(crate) log: logging::Logger,
}

impl Session {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        control: TcpStream,
        peer: SocketAddr,
        log: L,
    ) -> Session {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("peer" => peer.to_string())),
            None => logging::discard(),
        };

        Session {
            control,
            peer,
            data: None,
            pasv: None,
            data_connecting: false,
            state: ControlState::Greeting,
            cwd: "/".to_string(),
            type_binary: true,
            rest_offset: 0,
            rename_from: None,
            pasv_endpoint: None,
            port_endpoint: None,
            transfer: None,
            last_cmd: String::new(),
            line_buf: Vec::new(),
            write_queue: Buffer::new(WRITE_QUEUE_SIZE),
            log,
        }
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.state == ControlState::Authenticated
    }

    /// Queues the connect greeting.
    pub fn greet(&mut self) {
        self.send_code(220, "Welcome to ferrite.", true);
        self.send_code(220, "FTP Ready.", false);
    }

    /// Formats `NNN message` (final) or `NNN-message` (continuation) and
    /// appends it to the write queue.
    pub fn send_code(&mut self, code: u16, message: &str, multi: bool) {
        let separator = if multi { '-' } else { ' ' };

        logging::trace!(self.log, "queueing reply";
                        "code" => code,
                        "multi" => multi);

        let line = format!("{}{}{}\r\n", code, separator, message);
        self.write_queue.push(line.as_bytes());
    }

    /// Single-line final reply.
    #[inline]
    pub fn response(&mut self, code: u16, message: &str) {
        self.send_code(code, message, false);
    }

    /// Raw continuation line, for FEAT-style feature listings.
    pub fn send_line(&mut self, line: &str) {
        self.write_queue.push(line.as_bytes());
        self.write_queue.push(b"\r\n");
    }

    /// Drains the write queue into the control socket.
    pub fn flush(&mut self) -> NetResult<usize> {
        if self.write_queue.is_empty() {
            return Ok(0);
        }

        match self.write_queue.egress(&mut self.control) {
            Ok(sent) => Ok(sent),
            Err(err) => Err(NetError::from(err)),
        }
    }

    /// Reads everything currently available on the control socket into the
    /// line buffer. Returns `Closed` when the peer has hung up.
    pub fn fill_from_control(&mut self, scratch: &mut [u8]) -> NetResult<usize> {
        let mut total = 0;

        loop {
            match self.control.read(scratch) {
                Ok(0) => return Err(NetError::Closed),
                Ok(count) => {
                    self.line_buf.extend_from_slice(&scratch[..count]);
                    total += count;

                    if self.line_buf.len() > MAX_LINE && !self.line_buf.contains(&b'\n') {
                        logging::warn!(self.log, "dropping oversized command line";
                                       "length" => self.line_buf.len());
                        self.response(500, "Line too long.");
                        self.line_buf.clear();
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let err = NetError::from(err);
                    match err {
                        NetError::Wait => return Ok(total),
                        other => return Err(other),
                    }
                }
            }
        }
    }

    /// Splits the next complete command off the line buffer. The line is
    /// assembled in `scratch` where the verb is uppercased in place; the
    /// argument string is everything after the first space, verbatim.
    /// Trailing CR is stripped so bare-LF clients work too.
    pub fn next_line(&mut self, scratch: &mut Vec<u8>) -> Option<(String, String)> {
        let pos = self.line_buf.iter().position(|&b| b == b'\n')?;

        scratch.clear();
        scratch.extend(self.line_buf.drain(..=pos));

        while let Some(&last) = scratch.last() {
            if last == b'\n' || last == b'\r' {
                scratch.pop();
            } else {
                break;
            }
        }

        let split = scratch
            .iter()
            .position(|&b| b == b' ')
            .unwrap_or_else(|| scratch.len());

        scratch[..split].make_ascii_uppercase();

        let verb = String::from_utf8_lossy(&scratch[..split]).into_owned();
        let args = if split < scratch.len() {
            String::from_utf8_lossy(&scratch[split + 1..]).into_owned()
        } else {
            String::new()
        };

        Some((verb, args))
    }

    /// True when a started transfer is waiting for its data socket to be
    /// driven.
    #[inline]
    pub(crate) fn transfer_ready(&self) -> bool {
        self.data.is_some() && self.transfer.as_ref().map_or(false, |t| t.started)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use mio::net::TcpStream;
    use std::net::SocketAddr;

    /// A connected loopback pair: non-blocking mio server end plus the
    /// blocking std client end.
    pub fn tcp_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        (TcpStream::from_std(accepted), peer, client)
    }
}
