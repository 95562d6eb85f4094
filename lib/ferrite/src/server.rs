//! The event loop. One thread owns the listener, every session and every
//! data socket; readiness events are routed by token, where each token
//! encodes the owning session slot and which of its sockets fired. Sessions
//! live in a stable arena with a free list so tokens stay valid for the
//! lifetime of a connection.

use crate::command::{Authenticator, CommandSet, Ctx};
use crate::fs::Vfs;
use crate::session::{ControlState, Session};
use crate::sock;
use crate::support::NetError;
use crate::transfer;
use flux::logging;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use std::error;
use std::fmt;
use std::io;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// Token layout: the low two bits name the socket kind, the rest the slot.
// Data-socket lookups can therefore never alias control-socket lookups.
pub(crate) const KIND_CONTROL: usize = 1;
pub(crate) const KIND_PASV: usize = 2;
pub(crate) const KIND_DATA: usize = 3;

const TOKEN_LISTENER: Token = Token(0);

#[inline]
pub(crate) fn token(slot: usize, kind: usize) -> Token {
    Token(slot << 2 | kind)
}

#[inline]
fn token_parts(token: Token) -> (usize, usize) {
    (token.0 >> 2, token.0 & 3)
}

// Poll timeout; bounds how long a stop request can go unnoticed.
const TICK: Duration = Duration::from_millis(1000);

const CONTROL_BUF: usize = 2048;
const DATA_BUF: usize = 64 * 1024;

/// Shared scratch space, allocated while at least one session exists and
/// released when the last one leaves. Handlers must not hold slices into it
/// across a poll.
pub(crate) struct Scratch {
    /// Staging for control-channel reads.
    pub(crate) control: Box<[u8]>,
    /// Staging for data-channel chunks, both directions.
    pub(crate) data: Box<[u8]>,
    /// Assembly area for one command line.
    pub(crate) command: Vec<u8>,
}

impl Scratch {
    pub(crate) fn new() -> Scratch {
        Scratch {
            control: vec![0u8; CONTROL_BUF].into_boxed_slice(),
            data: vec![0u8; DATA_BUF].into_boxed_slice(),
            command: Vec::with_capacity(512),
        }
    }
}

/// Hook back into the host application. `is_running` is polled every tick
/// and a false answer shuts the server down; `request_exit` is invoked when
/// the loop dies on a fatal error.
pub trait Lifecycle: Send + Sync {
    fn is_running(&self) -> bool;
    fn request_exit(&self);
}

#[derive(Debug)]
pub enum ServerError {
    Bind(io::Error),
    Poll(io::Error),
    Listener(io::Error),
}

impl ServerError {
    /// Process exit code surfaced to the host.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Bind(_) => 1,
            ServerError::Poll(_) => 2,
            ServerError::Listener(_) => 3,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(err) => write!(f, "failed to bind listener: {}", err),
            ServerError::Poll(err) => write!(f, "poll failed: {}", err),
            ServerError::Listener(err) => write!(f, "listener failed: {}", err),
        }
    }
}

impl error::Error for ServerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ServerError::Bind(err) | ServerError::Poll(err) | ServerError::Listener(err) => {
                Some(err)
            }
        }
    }
}

pub struct ServerConfig {
    pub port: u16,
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: 21,
            max_sessions: 64,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct EventInfo {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_sessions: usize,

    poll: Poll,
    registry: Registry,
    events: Events,
    batch: Vec<EventInfo>,

    sessions: Vec<Option<Session>>,
    free: Vec<usize>,
    // Slots freed this tick; quarantined so stale events in the same batch
    // cannot reach a recycled session.
    dead: Vec<usize>,
    num_sessions: usize,
    scratch: Option<Scratch>,

    commands: CommandSet,
    vfs: Box<dyn Vfs>,
    auth: Box<dyn Authenticator>,
    host: Arc<dyn Lifecycle>,

    running: bool,
    log: logging::Logger,
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: ServerConfig,
        vfs: Box<dyn Vfs>,
        auth: Box<dyn Authenticator>,
        host: Arc<dyn Lifecycle>,
        log: L,
    ) -> Result<Server, ServerError> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let poll = Poll::new().map_err(ServerError::Poll)?;
        let registry = poll.registry().try_clone().map_err(ServerError::Poll)?;

        let mut listener = match sock::listen(config.port) {
            Ok(listener) => listener,
            Err(err) => {
                logging::error!(log, "bind failed"; "port" => config.port, "error" => err.to_string());
                host.request_exit();
                return Err(ServerError::Bind(err));
            }
        };
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        registry
            .register(&mut listener, TOKEN_LISTENER, Interest::READABLE)
            .map_err(ServerError::Poll)?;

        Ok(Server {
            listener,
            local_addr,
            max_sessions: config.max_sessions,
            poll,
            registry,
            events: Events::with_capacity(1024),
            batch: Vec::new(),
            sessions: Vec::new(),
            free: Vec::new(),
            dead: Vec::new(),
            num_sessions: 0,
            scratch: None,
            commands: CommandSet::new(),
            vfs,
            auth,
            host,
            running: false,
            log,
        })
    }

    /// The bound listener address; useful when constructed with port 0.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Swaps in a vendor SITE handler before the loop starts.
    pub fn register_site(&mut self, handler: crate::command::Handler) {
        self.commands.register_site(handler);
    }

    /// Runs the event loop until the host stops it or a fatal error occurs.
    /// On fatal errors the host is notified through `request_exit` and the
    /// error carries the process exit code.
    pub fn run(&mut self) -> Result<(), ServerError> {
        logging::info!(self.log, "server listening"; "addr" => self.local_addr.to_string());

        self.running = true;
        let result = self.serve();
        self.running = false;

        self.teardown();

        match &result {
            Ok(()) => logging::info!(self.log, "server stopped"),
            Err(err) => {
                logging::error!(self.log, "server terminated";
                                "error" => err.to_string(),
                                "exit_code" => err.exit_code());
                self.host.request_exit();
            }
        }

        result
    }

    fn serve(&mut self) -> Result<(), ServerError> {
        loop {
            if !self.host.is_running() {
                return Ok(());
            }

            if let Err(err) = self.poll.poll(&mut self.events, Some(TICK)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                return Err(ServerError::Poll(err));
            }

            self.batch.clear();
            for event in self.events.iter() {
                self.batch.push(EventInfo {
                    token: event.token(),
                    readable: event.is_readable() || event.is_read_closed(),
                    writable: event.is_writable(),
                    error: event.is_error(),
                });
            }

            for index in 0..self.batch.len() {
                let ev = self.batch[index];

                if ev.token == TOKEN_LISTENER {
                    if ev.error {
                        return Err(ServerError::Listener(io::Error::new(
                            io::ErrorKind::Other,
                            "listener readiness error",
                        )));
                    }

                    self.accept_pending();
                    continue;
                }

                let (slot, kind) = token_parts(ev.token);
                self.on_session_event(slot, kind, ev);
            }

            // Recycled slots become reusable only once the batch is spent.
            self.free.append(&mut self.dead);
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let (mut stream, peer) = match sock::accept(&self.listener) {
                Ok(pair) => pair,
                Err(NetError::Wait) => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => err.to_string());
                    break;
                }
            };

            if let Err(err) = sock::tune_control(&stream) {
                logging::warn!(self.log, "socket tuning failed"; "error" => err.to_string());
            }

            if self.num_sessions >= self.max_sessions {
                logging::warn!(self.log, "connection refused, session limit reached";
                               "peer" => peer.to_string());
                let _ = stream.write(b"421 Too many connections.\r\n");
                continue;
            }

            let slot = match self.free.pop() {
                Some(slot) => slot,
                None => {
                    self.sessions.push(None);
                    self.sessions.len() - 1
                }
            };

            let interest = Interest::READABLE | Interest::WRITABLE;

            if let Err(err) = self
                .registry
                .register(&mut stream, token(slot, KIND_CONTROL), interest)
            {
                logging::warn!(self.log, "control registration failed";
                               "error" => err.to_string());
                self.free.push(slot);
                continue;
            }

            if self.num_sessions == 0 {
                self.scratch = Some(Scratch::new());
            }
            self.num_sessions += 1;

            logging::debug!(self.log, "client connected";
                            "slot" => slot,
                            "peer" => peer.to_string());

            let mut session = Session::new(stream, peer, &self.log);
            session.greet();
            let _ = session.flush();

            self.sessions[slot] = Some(session);
        }
    }

    fn on_session_event(&mut self, slot: usize, kind: usize, ev: EventInfo) {
        let mut session = match self.sessions.get_mut(slot).and_then(Option::take) {
            Some(session) => session,
            // Stale event for a slot already torn down this tick.
            None => return,
        };

        let scratch = self
            .scratch
            .as_mut()
            .expect("scratch buffers live while sessions exist");
        let registry = &self.registry;
        let vfs = &*self.vfs;
        let auth = &*self.auth;
        let commands = &self.commands;

        let mut remove = false;

        match kind {
            KIND_CONTROL => {
                if ev.error {
                    remove = true;
                }

                if !remove && ev.writable {
                    if let Err(err) = session.flush() {
                        remove = err.is_fatal();
                    }
                }

                if !remove && ev.readable {
                    if session.fill_from_control(&mut scratch.control).is_err() {
                        remove = true;
                    }
                }

                if !remove {
                    while let Some((verb, args)) = session.next_line(&mut scratch.command) {
                        if verb.is_empty() {
                            continue;
                        }

                        let mut ctx = Ctx {
                            session: &mut session,
                            slot,
                            registry,
                            vfs,
                            auth,
                        };

                        commands.dispatch(&mut ctx, &verb, &args);

                        if session.state == ControlState::Closed {
                            break;
                        }
                    }

                    // A transfer whose data socket was already connected has
                    // no pending edge to wake it; kick it once here.
                    if session.transfer_ready() {
                        transfer::drive(&mut session, scratch, registry);
                    }
                }
            }
            KIND_PASV => {
                if ev.readable {
                    transfer::on_pasv_readable(&mut session, scratch, registry, slot);
                }
            }
            KIND_DATA => {
                transfer::on_data_event(&mut session, scratch, registry, ev.error, ev.writable);
            }
            _ => (),
        }

        if !remove {
            match session.flush() {
                Ok(_) | Err(NetError::Wait) => (),
                Err(_) => remove = true,
            }
        }

        if !remove && session.state == ControlState::Closed && session.write_queue.is_empty() {
            remove = true;
        }

        if remove {
            self.remove(slot, session);
        } else {
            self.sessions[slot] = Some(session);
        }
    }

    fn remove(&mut self, slot: usize, mut session: Session) {
        logging::debug!(self.log, "closing session";
                        "slot" => slot,
                        "peer" => session.peer.to_string());

        let _ = self.registry.deregister(&mut session.control);
        transfer::close_data(&mut session, &self.registry);
        drop(session);

        self.dead.push(slot);
        self.num_sessions -= 1;

        if self.num_sessions == 0 {
            self.scratch = None;
        }
    }

    fn teardown(&mut self) {
        for slot in 0..self.sessions.len() {
            if let Some(mut session) = self.sessions[slot].take() {
                let _ = self.registry.deregister(&mut session.control);
                transfer::close_data(&mut session, &self.registry);
            }
        }

        self.sessions.clear();
        self.free.clear();
        self.dead.clear();
        self.num_sessions = 0;
        self.scratch = None;

        let _ = self.registry.deregister(&mut self.listener);
    }
}
