//! The data-channel engine. A transfer is a tagged descriptor over
//! {Send, Recv, List} driven chunk-by-chunk from readiness events, so the
//! event loop regains control between chunks and control traffic is never
//! starved. Every transfer ends with exactly one terminal reply on the
//! control channel.

use crate::buffer::Buffer;
use crate::fs::{self, Entry};
use crate::server::{token, Scratch, KIND_DATA};
use crate::session::Session;
use crate::sock;
use crate::support::NetError;
use flux::logging;
use mio::net::TcpStream;
use mio::{Interest, Registry};
use std::io;
use std::io::{Read, Write};

/// Chunk moved per fill, sized to amortise syscalls without hogging the loop.
pub const CHUNK_SIZE: usize = 64 * 1024;

pub enum Payload {
    /// RETR: stream a file out, already positioned at the REST offset.
    Send { source: Box<dyn Read + Send> },
    /// LIST/NLST: render directory entries lazily as they are pulled.
    List {
        entries: Box<dyn Iterator<Item = Entry> + Send>,
        names_only: bool,
        now: u64,
    },
    /// STOR/APPE: receive into a file handle.
    Recv { sink: Box<dyn Write + Send> },
}

pub struct Transfer {
    pub(crate) payload: Payload,
    /// Unsent tail kept between events; no new source bytes are pulled
    /// until it drains.
    pub(crate) staged: Buffer,
    pub(crate) eof: bool,
    /// Set once the data channel is open and the 150 reply went out.
    pub(crate) started: bool,
    pub(crate) banner: String,
    pub(crate) moved: u64,
}

impl Transfer {
    fn new(payload: Payload, banner: String) -> Transfer {
        Transfer {
            payload,
            staged: Buffer::new(CHUNK_SIZE),
            eof: false,
            started: false,
            banner,
            moved: 0,
        }
    }

    pub fn send(source: Box<dyn Read + Send>, banner: String) -> Transfer {
        Transfer::new(Payload::Send { source }, banner)
    }

    pub fn list(
        entries: Box<dyn Iterator<Item = Entry> + Send>,
        names_only: bool,
        now: u64,
        banner: String,
    ) -> Transfer {
        Transfer::new(
            Payload::List {
                entries,
                names_only,
                now,
            },
            banner,
        )
    }

    pub fn recv(sink: Box<dyn Write + Send>, banner: String) -> Transfer {
        Transfer::new(Payload::Recv { sink }, banner)
    }
}

enum Step {
    Wait,
    Done(u16, &'static str),
}

/// Attaches a prepared transfer to the session's data channel. Passive
/// transfers park until the listener accepts; active mode starts a
/// non-blocking connect whose completion arrives as a writable event.
pub fn start(session: &mut Session, registry: &Registry, slot: usize, transfer: Transfer) {
    if session.transfer.is_some() || session.data_connecting {
        session.response(425, "Transfer already in progress.");
        return;
    }

    if session.pasv_endpoint.is_some() {
        session.transfer = Some(transfer);

        if session.data.is_some() {
            begin(session);
        }

        return;
    }

    if let Some(endpoint) = session.port_endpoint {
        match sock::connect(endpoint) {
            Ok(mut stream) => {
                let interest = Interest::READABLE | Interest::WRITABLE;

                if registry
                    .register(&mut stream, token(slot, KIND_DATA), interest)
                    .is_err()
                {
                    session.response(425, "Cannot open data connection.");
                    return;
                }

                logging::debug!(session.log, "connecting data channel";
                                "endpoint" => endpoint.to_string());

                session.data = Some(stream);
                session.data_connecting = true;
                session.transfer = Some(transfer);
            }
            Err(_) => session.response(425, "Cannot open data connection."),
        }

        return;
    }

    session.response(425, "Use PORT or PASV first.");
}

/// Emits the 150 reply and marks the transfer live.
fn begin(session: &mut Session) {
    let banner = match session.transfer.as_mut() {
        Some(transfer) if !transfer.started => {
            transfer.started = true;
            transfer.banner.clone()
        }
        _ => return,
    };

    session.send_code(150, &banner, false);
    logging::debug!(session.log, "transfer started");
}

/// Readiness on the passive listener: accept the client's data connection,
/// then retire the listener. A parked transfer starts immediately.
pub fn on_pasv_readable(
    session: &mut Session,
    scratch: &mut Scratch,
    registry: &Registry,
    slot: usize,
) {
    let listener = match session.pasv.as_ref() {
        Some(listener) => listener,
        None => return,
    };

    match sock::accept(listener) {
        Ok((mut stream, peer)) => {
            logging::debug!(session.log, "passive data connection accepted";
                            "data_peer" => peer.to_string());

            let interest = Interest::READABLE | Interest::WRITABLE;

            if registry
                .register(&mut stream, token(slot, KIND_DATA), interest)
                .is_err()
            {
                return;
            }

            let mut listener = session.pasv.take().expect("passive listener present");
            let _ = registry.deregister(&mut listener);

            session.data = Some(stream);

            if session.transfer.is_some() {
                begin(session);
                drive(session, scratch, registry);
            }
        }
        Err(NetError::Wait) => (),
        Err(err) => {
            logging::warn!(session.log, "passive accept failed"; "error" => err.to_string());
        }
    }
}

/// Readiness on the data socket itself: finish a pending active-mode
/// connect, then hand over to the drive loop.
pub fn on_data_event(
    session: &mut Session,
    scratch: &mut Scratch,
    registry: &Registry,
    error: bool,
    writable: bool,
) {
    if session.data_connecting {
        match connect_outcome(session.data.as_ref(), error, writable) {
            ConnectOutcome::Pending => return,
            ConnectOutcome::Failed => {
                session.transfer = None;
                close_data(session, registry);
                session.response(425, "Cannot open data connection.");
                return;
            }
            ConnectOutcome::Connected => {
                session.data_connecting = false;
                begin(session);
            }
        }
    }

    if session.transfer.is_some() {
        drive(session, scratch, registry);
    } else if error {
        // A pre-claimed passive connection died before any command used it.
        close_data(session, registry);
    }
}

enum ConnectOutcome {
    Pending,
    Connected,
    Failed,
}

fn connect_outcome(stream: Option<&TcpStream>, error: bool, writable: bool) -> ConnectOutcome {
    let stream = match stream {
        Some(stream) => stream,
        None => return ConnectOutcome::Failed,
    };

    if error || matches!(stream.take_error(), Ok(Some(_)) | Err(_)) {
        return ConnectOutcome::Failed;
    }

    if !writable {
        return ConnectOutcome::Pending;
    }

    match stream.peer_addr() {
        Ok(_) => ConnectOutcome::Connected,
        Err(ref err) if err.kind() == io::ErrorKind::NotConnected => ConnectOutcome::Pending,
        Err(_) => ConnectOutcome::Failed,
    }
}

/// Tears down the data channel and both endpoint captures. Emits nothing.
pub(crate) fn close_data(session: &mut Session, registry: &Registry) {
    if let Some(mut stream) = session.data.take() {
        let _ = registry.deregister(&mut stream);
    }

    if let Some(mut listener) = session.pasv.take() {
        let _ = registry.deregister(&mut listener);
    }

    session.pasv_endpoint = None;
    session.port_endpoint = None;
    session.data_connecting = false;
}

/// Drops any in-flight transfer and its data channel. Returns true when a
/// transfer was actually interrupted.
pub fn abort(session: &mut Session, registry: &Registry) -> bool {
    let active = session.transfer.take().is_some();
    close_data(session, registry);

    if active {
        logging::debug!(session.log, "transfer aborted");
    }

    active
}

/// Moves as much data as the socket allows, then either waits for the next
/// readiness event or finishes the transfer with its terminal reply.
pub fn drive(session: &mut Session, scratch: &mut Scratch, registry: &Registry) {
    if session.data.is_none() || !session.transfer.as_ref().map_or(false, |t| t.started) {
        return;
    }

    if let Step::Done(code, message) = run(session, scratch) {
        let moved = session.transfer.as_ref().map_or(0, |t| t.moved);

        logging::debug!(session.log, "transfer finished";
                        "code" => code,
                        "bytes" => moved);

        session.transfer = None;
        close_data(session, registry);
        session.response(code, message);
    }
}

fn run(session: &mut Session, scratch: &mut Scratch) -> Step {
    let stream = match session.data.as_mut() {
        Some(stream) => stream,
        None => return Step::Wait,
    };
    let transfer = match session.transfer.as_mut() {
        Some(transfer) => transfer,
        None => return Step::Wait,
    };

    if let Payload::Recv { sink } = &mut transfer.payload {
        return drive_in(stream, sink, &mut transfer.moved, scratch);
    }

    loop {
        if transfer.staged.is_empty() && !transfer.eof {
            let failed = match &mut transfer.payload {
                Payload::Send { source } => {
                    fill_from_source(source, &mut transfer.staged, &mut transfer.eof, scratch)
                }
                Payload::List {
                    entries,
                    names_only,
                    now,
                } => {
                    fill_from_listing(
                        entries,
                        *names_only,
                        *now,
                        &mut transfer.staged,
                        &mut transfer.eof,
                    );
                    false
                }
                Payload::Recv { .. } => unreachable!("recv handled above"),
            };

            if failed {
                return Step::Done(451, "Local error, transfer failed.");
            }
        }

        if transfer.staged.is_empty() {
            return Step::Done(226, "Transfer complete.");
        }

        match stream.write(transfer.staged.data()) {
            Ok(0) => return Step::Done(426, "Transfer aborted."),
            Ok(count) => {
                transfer.staged.consume(count);
                transfer.moved += count as u64;
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Step::Wait,
            Err(_) => return Step::Done(426, "Transfer aborted."),
        }
    }
}

/// Pulls one chunk from the file into the staging buffer. Returns true on a
/// read failure.
fn fill_from_source(
    source: &mut Box<dyn Read + Send>,
    staged: &mut Buffer,
    eof: &mut bool,
    scratch: &mut Scratch,
) -> bool {
    while staged.room() > 0 && !*eof {
        let want = staged.room().min(scratch.data.len());

        match source.read(&mut scratch.data[..want]) {
            Ok(0) => *eof = true,
            Ok(count) => staged.push(&scratch.data[..count]),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }

    false
}

/// Renders directory entries into the staging buffer until a chunk's worth
/// is queued or the iterator runs dry.
fn fill_from_listing(
    entries: &mut Box<dyn Iterator<Item = Entry> + Send>,
    names_only: bool,
    now: u64,
    staged: &mut Buffer,
    eof: &mut bool,
) {
    while staged.room() > 0 && !*eof {
        match entries.next() {
            Some(entry) => {
                let line = if names_only {
                    fs::render_name(&entry)
                } else {
                    fs::render_long(&entry, now)
                };

                staged.push(line.as_bytes());
            }
            None => *eof = true,
        }
    }
}

fn drive_in(
    stream: &mut TcpStream,
    sink: &mut Box<dyn Write + Send>,
    moved: &mut u64,
    scratch: &mut Scratch,
) -> Step {
    loop {
        match stream.read(&mut scratch.data[..]) {
            Ok(0) => {
                // Peer half-closed: everything arrived.
                return match sink.flush() {
                    Ok(()) => Step::Done(226, "Transfer complete."),
                    Err(_) => Step::Done(451, "Local error, transfer failed."),
                };
            }
            Ok(count) => {
                if sink.write_all(&scratch.data[..count]).is_err() {
                    return Step::Done(451, "Local error, transfer failed.");
                }

                *moved += count as u64;
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Step::Wait,
            Err(_) => return Step::Done(426, "Transfer aborted."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EntryKind, Metadata};
    use crate::session::test_util::tcp_pair;
    use crate::session::Session;
    use mio::Poll;
    use std::io::Cursor;
    use std::net::Shutdown;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn harness() -> (Session, std::net::TcpStream, std::net::TcpStream, Registry, Scratch) {
        let (control, peer, control_client) = tcp_pair();
        let (data, _, data_client) = tcp_pair();

        let mut session = Session::new(control, peer, None);
        session.data = Some(data);

        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();

        (
            session,
            control_client,
            data_client,
            registry,
            Scratch::new(),
        )
    }

    fn read_all(stream: &mut std::net::TcpStream) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut out = Vec::new();
        let _ = std::io::Read::read_to_end(stream, &mut out);
        out
    }

    #[test]
    fn test_send_small_payload_completes() {
        let (mut session, _cc, mut data_client, registry, mut scratch) = harness();

        let payload: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let mut transfer = Transfer::send(
            Box::new(Cursor::new(payload.clone())),
            "sending".to_string(),
        );
        transfer.started = true;
        session.transfer = Some(transfer);

        drive(&mut session, &mut scratch, &registry);

        assert!(session.transfer.is_none());
        assert!(session.data.is_none());
        assert!(session
            .write_queue
            .data()
            .ends_with(b"226 Transfer complete.\r\n"));

        assert_eq!(read_all(&mut data_client), payload);
    }

    #[test]
    fn test_recv_collects_until_half_close() {
        let (mut session, _cc, mut data_client, registry, mut scratch) = harness();

        let sink = Arc::new(Mutex::new(Vec::new()));

        struct SharedSink(Arc<Mutex<Vec<u8>>>);

        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut transfer = Transfer::recv(
            Box::new(SharedSink(sink.clone())),
            "receiving".to_string(),
        );
        transfer.started = true;
        session.transfer = Some(transfer);

        std::io::Write::write_all(&mut data_client, b"uploaded contents").unwrap();
        data_client.shutdown(Shutdown::Write).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        drive(&mut session, &mut scratch, &registry);

        assert!(session.transfer.is_none());
        assert_eq!(&sink.lock().unwrap()[..], b"uploaded contents");
        assert!(session
            .write_queue
            .data()
            .ends_with(b"226 Transfer complete.\r\n"));
    }

    #[test]
    fn test_listing_renders_lines() {
        let (mut session, _cc, mut data_client, registry, mut scratch) = harness();

        let entries = vec![
            Entry {
                name: "dir".to_string(),
                meta: Metadata {
                    kind: EntryKind::Dir,
                    size: 0,
                    mtime: 0,
                    mode_bits: 0o755,
                    owner: "root".to_string(),
                    group: "root".to_string(),
                    nlink: 1,
                },
            },
            Entry {
                name: "a.txt".to_string(),
                meta: Metadata {
                    kind: EntryKind::File,
                    size: 5,
                    mtime: 0,
                    mode_bits: 0o644,
                    owner: "root".to_string(),
                    group: "root".to_string(),
                    nlink: 1,
                },
            },
        ];

        let mut transfer = Transfer::list(
            Box::new(entries.into_iter()),
            false,
            1000,
            "listing".to_string(),
        );
        transfer.started = true;
        session.transfer = Some(transfer);

        drive(&mut session, &mut scratch, &registry);

        let listing = read_all(&mut data_client);

        assert_eq!(
            listing,
            b"drwxr-xr-x 1 root root 0 Jan 01 00:00 dir\r\n\
              -rw-r--r-- 1 root root 5 Jan 01 00:00 a.txt\r\n" as &[u8]
        );
    }

    #[test]
    fn test_abort_clears_channel_state() {
        let (mut session, _cc, _data_client, registry, _scratch) = harness();

        let mut transfer = Transfer::send(Box::new(Cursor::new(vec![0u8; 16])), String::new());
        transfer.started = true;
        session.transfer = Some(transfer);
        session.port_endpoint = Some("127.0.0.1:2021".parse().unwrap());

        assert!(abort(&mut session, &registry));

        assert!(session.transfer.is_none());
        assert!(session.data.is_none());
        assert!(session.port_endpoint.is_none());

        // A second ABOR finds nothing in flight.
        assert!(!abort(&mut session, &registry));
    }
}
