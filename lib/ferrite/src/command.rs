//! Verb dispatch. The table maps uppercased verbs to handler functions and
//! is built once at startup; the dispatcher itself enforces the pre-auth
//! whitelist so individual handlers never re-check login state.

use crate::fs::{self, Entry, EntryKind, Vfs, WriteMode};
use crate::server::{token, KIND_PASV};
use crate::session::{ControlState, Session};
use crate::sock;
use crate::transfer::{self, Transfer};
use flux::logging;
use flux::time::timestamp_secs;
use hashbrown::HashMap;
use mio::{Interest, Registry};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Credential check supplied by the host.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, user: &str, pass: &str) -> bool;
}

/// Everything a handler may touch: the issuing session plus the shared
/// collaborators owned by the server.
pub struct Ctx<'a> {
    pub session: &'a mut Session,
    pub slot: usize,
    pub registry: &'a Registry,
    pub vfs: &'a dyn Vfs,
    pub auth: &'a dyn Authenticator,
}

pub type Handler = fn(&mut Ctx<'_>, &str);

struct CmdSpec {
    handler: Handler,
    /// Callable before authentication.
    pre_auth: bool,
    /// Dispatcher answers 501 when the argument string is empty.
    needs_arg: bool,
}

pub struct CommandSet {
    table: HashMap<&'static str, CmdSpec>,
}

fn spec(handler: Handler, pre_auth: bool, needs_arg: bool) -> CmdSpec {
    CmdSpec {
        handler,
        pre_auth,
        needs_arg,
    }
}

impl CommandSet {
    pub fn new() -> CommandSet {
        let mut table = HashMap::new();

        table.insert("USER", spec(cmd_user as Handler, true, true));
        table.insert("PASS", spec(cmd_pass, true, false));
        table.insert("QUIT", spec(cmd_quit, true, false));
        table.insert("NOOP", spec(cmd_noop, true, false));
        table.insert("SYST", spec(cmd_syst, true, false));
        table.insert("FEAT", spec(cmd_feat, true, false));
        table.insert("HELP", spec(cmd_help, true, false));
        table.insert("AUTH", spec(cmd_auth, true, false));

        table.insert("TYPE", spec(cmd_type, false, true));
        table.insert("STRU", spec(cmd_stru, false, true));
        table.insert("MODE", spec(cmd_mode, false, true));
        table.insert("PWD", spec(cmd_pwd, false, false));
        table.insert("CWD", spec(cmd_cwd, false, true));
        table.insert("CDUP", spec(cmd_cdup, false, false));
        table.insert("MKD", spec(cmd_mkd, false, true));
        table.insert("RMD", spec(cmd_rmd, false, true));
        table.insert("DELE", spec(cmd_dele, false, true));
        table.insert("RNFR", spec(cmd_rnfr, false, true));
        table.insert("RNTO", spec(cmd_rnto, false, true));
        table.insert("SIZE", spec(cmd_size, false, true));
        table.insert("MDTM", spec(cmd_mdtm, false, true));
        table.insert("REST", spec(cmd_rest, false, true));
        table.insert("PORT", spec(cmd_port, false, true));
        table.insert("PASV", spec(cmd_pasv, false, false));
        table.insert("LIST", spec(cmd_list, false, false));
        table.insert("NLST", spec(cmd_nlst, false, false));
        table.insert("RETR", spec(cmd_retr, false, true));
        table.insert("STOR", spec(cmd_stor, false, true));
        table.insert("APPE", spec(cmd_appe, false, true));
        table.insert("ABOR", spec(cmd_abor, false, false));
        table.insert("SITE", spec(cmd_site, false, false));

        CommandSet { table }
    }

    /// Replaces the stock 502 SITE handler with a vendor extension.
    pub fn register_site(&mut self, handler: Handler) {
        self.table.insert("SITE", spec(handler, false, false));
    }

    pub fn dispatch(&self, ctx: &mut Ctx<'_>, verb: &str, args: &str) {
        let shown = if verb == "PASS" { "****" } else { args };
        logging::debug!(ctx.session.log, "command received";
                        "verb" => verb,
                        "args" => shown,
                        "prev" => ctx.session.last_cmd.as_str());

        // A captured RNFR source survives only until the next command,
        // unless that command is the matching RNTO.
        if verb != "RNFR" && verb != "RNTO" {
            ctx.session.rename_from = None;
        }

        match self.table.get(verb) {
            None => ctx.session.response(500, "Unknown command."),
            Some(spec) if !spec.pre_auth && !ctx.session.is_authenticated() => {
                ctx.session.response(530, "Not logged in.")
            }
            Some(spec) if spec.needs_arg && args.is_empty() => {
                ctx.session.response(501, "Missing argument.")
            }
            Some(spec) => (spec.handler)(ctx, args),
        }

        ctx.session.last_cmd = verb.to_string();
    }
}

fn cmd_user(ctx: &mut Ctx<'_>, args: &str) {
    ctx.session.state = ControlState::AwaitingPass(args.trim().to_string());
    ctx.session.response(331, "Username ok, send password.");
}

fn cmd_pass(ctx: &mut Ctx<'_>, args: &str) {
    match mem::replace(&mut ctx.session.state, ControlState::AwaitingUser) {
        ControlState::AwaitingPass(user) => {
            if ctx.auth.authenticate(&user, args) {
                logging::info!(ctx.session.log, "login accepted"; "user" => user.as_str());
                ctx.session.state = ControlState::Authenticated;
                ctx.session.response(230, "User logged in.");
            } else {
                logging::warn!(ctx.session.log, "login rejected"; "user" => user.as_str());
                ctx.session.response(530, "Login incorrect.");
            }
        }
        state => {
            // Dispatch records the verb only after the handler returns, so
            // last_cmd still names the command before this PASS.
            let message = match &state {
                ControlState::Authenticated => "Already logged in.",
                _ if ctx.session.last_cmd == "PASS" => "Login failed, send USER first.",
                _ => "Login with USER first.",
            };

            ctx.session.state = state;
            ctx.session.response(503, message);
        }
    }
}

fn cmd_quit(ctx: &mut Ctx<'_>, _args: &str) {
    ctx.session.state = ControlState::Closed;
    ctx.session.response(221, "Goodbye.");
}

fn cmd_noop(ctx: &mut Ctx<'_>, _args: &str) {
    ctx.session.response(200, "NOOP ok.");
}

fn cmd_syst(ctx: &mut Ctx<'_>, _args: &str) {
    ctx.session.response(215, "UNIX Type: L8");
}

fn cmd_feat(ctx: &mut Ctx<'_>, _args: &str) {
    ctx.session.send_code(211, "Features:", true);
    ctx.session.send_line(" SIZE");
    ctx.session.send_line(" MDTM");
    ctx.session.send_line(" REST STREAM");
    ctx.session.send_line(" PASV");
    ctx.session.send_code(211, "End", false);
}

fn cmd_help(ctx: &mut Ctx<'_>, _args: &str) {
    ctx.session.send_code(214, "Commands supported:", true);
    ctx.session
        .send_line(" USER PASS QUIT NOOP SYST FEAT HELP AUTH TYPE STRU MODE");
    ctx.session
        .send_line(" PWD CWD CDUP MKD RMD DELE RNFR RNTO SIZE MDTM REST");
    ctx.session
        .send_line(" PORT PASV LIST NLST RETR STOR APPE ABOR SITE");
    ctx.session.send_code(214, "HELP ok.", false);
}

fn cmd_auth(ctx: &mut Ctx<'_>, _args: &str) {
    ctx.session.response(502, "TLS not supported.");
}

fn cmd_type(ctx: &mut Ctx<'_>, args: &str) {
    match args.trim().to_ascii_uppercase().as_str() {
        "I" | "L 8" | "L8" => {
            ctx.session.type_binary = true;
            ctx.session.response(200, "TYPE set to I.");
        }
        "A" | "A N" => {
            ctx.session.type_binary = false;
            ctx.session.response(200, "TYPE set to A.");
        }
        _ => ctx.session.response(504, "Type not supported."),
    }
}

fn cmd_stru(ctx: &mut Ctx<'_>, args: &str) {
    match args.trim().to_ascii_uppercase().as_str() {
        "F" => ctx.session.response(200, "STRU set to F."),
        _ => ctx.session.response(504, "Structure not supported."),
    }
}

fn cmd_mode(ctx: &mut Ctx<'_>, args: &str) {
    match args.trim().to_ascii_uppercase().as_str() {
        "S" => ctx.session.response(200, "MODE set to S."),
        _ => ctx.session.response(504, "Mode not supported."),
    }
}

fn quote(path: &str) -> String {
    path.replace('"', "\"\"")
}

fn cmd_pwd(ctx: &mut Ctx<'_>, _args: &str) {
    let message = format!("\"{}\" is the current directory.", quote(&ctx.session.cwd));
    ctx.session.response(257, &message);
}

fn change_dir(ctx: &mut Ctx<'_>, arg: &str) {
    let path = fs::resolve(&ctx.session.cwd, arg);

    match ctx.vfs.stat(&path) {
        Ok(meta) if meta.kind == EntryKind::Dir => {
            ctx.session.cwd = path;
            ctx.session.response(250, "Directory changed.");
        }
        _ => ctx.session.response(550, "No such directory."),
    }
}

fn cmd_cwd(ctx: &mut Ctx<'_>, args: &str) {
    change_dir(ctx, args);
}

fn cmd_cdup(ctx: &mut Ctx<'_>, _args: &str) {
    change_dir(ctx, "..");
}

fn cmd_mkd(ctx: &mut Ctx<'_>, args: &str) {
    let path = fs::resolve(&ctx.session.cwd, args);

    match ctx.vfs.mkdir(&path) {
        Ok(()) => {
            let message = format!("\"{}\" created.", quote(&path));
            ctx.session.response(257, &message);
        }
        Err(_) => ctx.session.response(550, "Cannot create directory."),
    }
}

fn cmd_rmd(ctx: &mut Ctx<'_>, args: &str) {
    let path = fs::resolve(&ctx.session.cwd, args);

    match ctx.vfs.rmdir(&path) {
        Ok(()) => ctx.session.response(250, "Directory removed."),
        Err(_) => ctx.session.response(550, "Cannot remove directory."),
    }
}

fn cmd_dele(ctx: &mut Ctx<'_>, args: &str) {
    let path = fs::resolve(&ctx.session.cwd, args);

    match ctx.vfs.unlink(&path) {
        Ok(()) => ctx.session.response(250, "File removed."),
        Err(_) => ctx.session.response(550, "Cannot remove file."),
    }
}

fn cmd_rnfr(ctx: &mut Ctx<'_>, args: &str) {
    let path = fs::resolve(&ctx.session.cwd, args);

    match ctx.vfs.stat(&path) {
        Ok(_) => {
            ctx.session.rename_from = Some(path);
            ctx.session.response(350, "Ready for destination name.");
        }
        Err(_) => ctx.session.response(550, "No such file or directory."),
    }
}

fn cmd_rnto(ctx: &mut Ctx<'_>, args: &str) {
    match ctx.session.rename_from.take() {
        Some(from) => {
            let to = fs::resolve(&ctx.session.cwd, args);

            match ctx.vfs.rename(&from, &to) {
                Ok(()) => ctx.session.response(250, "Rename successful."),
                Err(_) => ctx.session.response(550, "Rename failed."),
            }
        }
        None => {
            // An RNFR that answered 550 captured nothing; say so instead of
            // pretending the client never sent one.
            let message = if ctx.session.last_cmd == "RNFR" {
                "RNFR did not select a source."
            } else {
                "RNFR required first."
            };

            ctx.session.response(503, message);
        }
    }
}

fn cmd_size(ctx: &mut Ctx<'_>, args: &str) {
    let path = fs::resolve(&ctx.session.cwd, args);

    match ctx.vfs.stat(&path) {
        Ok(meta) if meta.kind == EntryKind::File => {
            let message = format!("{}", meta.size);
            ctx.session.response(213, &message);
        }
        _ => ctx.session.response(550, "Could not get file size."),
    }
}

fn cmd_mdtm(ctx: &mut Ctx<'_>, args: &str) {
    let path = fs::resolve(&ctx.session.cwd, args);

    match ctx.vfs.stat(&path) {
        Ok(meta) => {
            let message = fs::mdtm_stamp(meta.mtime);
            ctx.session.response(213, &message);
        }
        Err(_) => ctx.session.response(550, "Could not get file time."),
    }
}

fn cmd_rest(ctx: &mut Ctx<'_>, args: &str) {
    match args.trim().parse::<u64>() {
        Ok(offset) => {
            ctx.session.rest_offset = offset;
            let message = format!("Restarting at {}.", offset);
            ctx.session.response(350, &message);
        }
        Err(_) => ctx.session.response(501, "Invalid restart offset."),
    }
}

fn parse_port_args(args: &str) -> Option<SocketAddrV4> {
    let mut parts = args.trim().split(',');
    let mut fields = [0u8; 6];

    for field in fields.iter_mut() {
        *field = parts.next()?.trim().parse().ok()?;
    }

    if parts.next().is_some() {
        return None;
    }

    let ip = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    let port = u16::from(fields[4]) << 8 | u16::from(fields[5]);

    Some(SocketAddrV4::new(ip, port))
}

fn cmd_port(ctx: &mut Ctx<'_>, args: &str) {
    match parse_port_args(args) {
        Some(endpoint) => {
            ctx.session.port_endpoint = Some(endpoint);
            ctx.session.response(200, "PORT command successful.");
        }
        None => ctx.session.response(501, "Invalid PORT arguments."),
    }
}

fn cmd_pasv(ctx: &mut Ctx<'_>, _args: &str) {
    if ctx.session.transfer.is_some() || ctx.session.data_connecting {
        ctx.session.response(425, "Transfer already in progress.");
        return;
    }

    // A repeated PASV retires any previous endpoint first.
    transfer::close_data(ctx.session, ctx.registry);

    let local_ip = match ctx.session.control.local_addr() {
        Ok(SocketAddr::V4(addr)) => *addr.ip(),
        _ => {
            ctx.session.response(425, "Cannot open passive port.");
            return;
        }
    };

    match sock::listen_passive() {
        Ok((mut listener, port)) => {
            if ctx
                .registry
                .register(
                    &mut listener,
                    token(ctx.slot, KIND_PASV),
                    Interest::READABLE,
                )
                .is_err()
            {
                ctx.session.response(425, "Cannot open passive port.");
                return;
            }

            ctx.session.pasv = Some(listener);
            ctx.session.pasv_endpoint = Some(SocketAddrV4::new(local_ip, port));

            let octets = local_ip.octets();
            let message = format!(
                "Entering Passive Mode ({},{},{},{},{},{}).",
                octets[0],
                octets[1],
                octets[2],
                octets[3],
                port >> 8,
                port & 0xff
            );
            ctx.session.response(227, &message);
        }
        Err(_) => ctx.session.response(425, "Cannot open passive port."),
    }
}

/// Clients habitually pass `ls` flags before the path; drop them.
fn strip_list_flags(args: &str) -> &str {
    let mut rest = args.trim_start();

    while rest.starts_with('-') {
        match rest.find(' ') {
            Some(pos) => rest = rest[pos + 1..].trim_start(),
            None => return "",
        }
    }

    rest
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or("").to_string()
}

fn start_listing(ctx: &mut Ctx<'_>, args: &str, names_only: bool) {
    let target = strip_list_flags(args);
    let path = fs::resolve(&ctx.session.cwd, target);

    let entries: Box<dyn Iterator<Item = Entry> + Send> = match ctx.vfs.stat(&path) {
        Ok(meta) if meta.kind == EntryKind::Dir => match ctx.vfs.list(&path) {
            Ok(entries) => entries,
            Err(_) => {
                ctx.session.response(451, "Could not read directory.");
                return;
            }
        },
        Ok(meta) => Box::new(std::iter::once(Entry {
            name: basename(&path),
            meta,
        })),
        Err(_) => {
            ctx.session.response(451, "No such file or directory.");
            return;
        }
    };

    let transfer = Transfer::list(
        entries,
        names_only,
        timestamp_secs(),
        "Opening ASCII mode data connection for file list.".to_string(),
    );

    transfer::start(ctx.session, ctx.registry, ctx.slot, transfer);
}

fn cmd_list(ctx: &mut Ctx<'_>, args: &str) {
    start_listing(ctx, args, false);
}

fn cmd_nlst(ctx: &mut Ctx<'_>, args: &str) {
    start_listing(ctx, args, true);
}

fn cmd_retr(ctx: &mut Ctx<'_>, args: &str) {
    let path = fs::resolve(&ctx.session.cwd, args);

    let meta = match ctx.vfs.stat(&path) {
        Ok(meta) if meta.kind == EntryKind::File => meta,
        _ => {
            ctx.session.response(550, "No such file.");
            return;
        }
    };

    let offset = mem::replace(&mut ctx.session.rest_offset, 0);

    let source = match ctx.vfs.open_read(&path, offset) {
        Ok(source) => source,
        Err(_) => {
            ctx.session.response(550, "Could not open file.");
            return;
        }
    };

    let mode = if ctx.session.type_binary {
        "BINARY"
    } else {
        "ASCII"
    };
    let banner = format!(
        "Opening {} mode data connection for {} ({} bytes).",
        mode,
        path,
        meta.size.saturating_sub(offset)
    );

    transfer::start(
        ctx.session,
        ctx.registry,
        ctx.slot,
        Transfer::send(source, banner),
    );
}

fn start_upload(ctx: &mut Ctx<'_>, args: &str, mode: WriteMode) {
    let path = fs::resolve(&ctx.session.cwd, args);

    let offset = match mode {
        WriteMode::Truncate => mem::replace(&mut ctx.session.rest_offset, 0),
        WriteMode::Append => {
            ctx.session.rest_offset = 0;
            0
        }
    };

    let sink = match ctx.vfs.open_write(&path, mode, offset) {
        Ok(sink) => sink,
        Err(_) => {
            ctx.session.response(550, "Could not open file for writing.");
            return;
        }
    };

    let word = if ctx.session.type_binary {
        "BINARY"
    } else {
        "ASCII"
    };
    let banner = format!("Opening {} mode data connection for {}.", word, path);

    transfer::start(
        ctx.session,
        ctx.registry,
        ctx.slot,
        Transfer::recv(sink, banner),
    );
}

fn cmd_stor(ctx: &mut Ctx<'_>, args: &str) {
    start_upload(ctx, args, WriteMode::Truncate);
}

fn cmd_appe(ctx: &mut Ctx<'_>, args: &str) {
    start_upload(ctx, args, WriteMode::Append);
}

fn cmd_abor(ctx: &mut Ctx<'_>, _args: &str) {
    if transfer::abort(ctx.session, ctx.registry) {
        ctx.session.response(426, "Transfer aborted.");
    }

    ctx.session.response(226, "ABOR ok.");
}

fn cmd_site(ctx: &mut Ctx<'_>, _args: &str) {
    ctx.session.response(502, "SITE not implemented.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Metadata, VfsError, VfsResult};
    use crate::session::test_util::tcp_pair;
    use mio::Poll;
    use std::collections::{HashMap as StdHashMap, HashSet};
    use std::io;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MockVfs {
        files: Arc<Mutex<StdHashMap<String, Vec<u8>>>>,
        dirs: Arc<Mutex<HashSet<String>>>,
    }

    impl MockVfs {
        fn new() -> MockVfs {
            let vfs = MockVfs::default();
            vfs.dirs.lock().unwrap().insert("/".to_string());
            vfs
        }

        fn add_file(&self, path: &str, data: &[u8]) {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), data.to_vec());
        }

        fn add_dir(&self, path: &str) {
            self.dirs.lock().unwrap().insert(path.to_string());
        }

        fn file_meta(size: u64) -> Metadata {
            Metadata {
                kind: EntryKind::File,
                size,
                mtime: 0,
                mode_bits: 0o644,
                owner: "root".to_string(),
                group: "root".to_string(),
                nlink: 1,
            }
        }

        fn dir_meta() -> Metadata {
            Metadata {
                kind: EntryKind::Dir,
                size: 0,
                mtime: 0,
                mode_bits: 0o755,
                owner: "root".to_string(),
                group: "root".to_string(),
                nlink: 1,
            }
        }
    }

    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) => "/",
            Some(pos) => &path[..pos],
            None => "/",
        }
    }

    impl Vfs for MockVfs {
        fn stat(&self, path: &str) -> VfsResult<Metadata> {
            if self.dirs.lock().unwrap().contains(path) {
                return Ok(MockVfs::dir_meta());
            }

            match self.files.lock().unwrap().get(path) {
                Some(data) => Ok(MockVfs::file_meta(data.len() as u64)),
                None => Err(VfsError::NotFound),
            }
        }

        fn list(&self, path: &str) -> VfsResult<Box<dyn Iterator<Item = Entry> + Send>> {
            if !self.dirs.lock().unwrap().contains(path) {
                return Err(VfsError::NotFound);
            }

            let mut entries = Vec::new();

            for dir in self.dirs.lock().unwrap().iter() {
                if dir != "/" && parent_of(dir) == path {
                    entries.push(Entry {
                        name: basename(dir),
                        meta: MockVfs::dir_meta(),
                    });
                }
            }

            for (file, data) in self.files.lock().unwrap().iter() {
                if parent_of(file) == path {
                    entries.push(Entry {
                        name: basename(file),
                        meta: MockVfs::file_meta(data.len() as u64),
                    });
                }
            }

            entries.sort_by(|a, b| a.name.cmp(&b.name));

            Ok(Box::new(entries.into_iter()))
        }

        fn open_read(&self, path: &str, offset: u64) -> VfsResult<Box<dyn io::Read + Send>> {
            match self.files.lock().unwrap().get(path) {
                Some(data) => {
                    let from = (offset as usize).min(data.len());
                    Ok(Box::new(Cursor::new(data[from..].to_vec())))
                }
                None => Err(VfsError::NotFound),
            }
        }

        fn open_write(
            &self,
            path: &str,
            mode: WriteMode,
            offset: u64,
        ) -> VfsResult<Box<dyn io::Write + Send>> {
            let existing = self
                .files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or_default();

            let initial = match mode {
                WriteMode::Truncate => {
                    let keep = (offset as usize).min(existing.len());
                    existing[..keep].to_vec()
                }
                WriteMode::Append => existing,
            };

            struct MockWriter {
                files: Arc<Mutex<StdHashMap<String, Vec<u8>>>>,
                path: String,
                buf: Vec<u8>,
            }

            impl io::Write for MockWriter {
                fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                    self.buf.extend_from_slice(buf);
                    Ok(buf.len())
                }

                fn flush(&mut self) -> io::Result<()> {
                    Ok(())
                }
            }

            impl Drop for MockWriter {
                fn drop(&mut self) {
                    self.files
                        .lock()
                        .unwrap()
                        .insert(self.path.clone(), mem::take(&mut self.buf));
                }
            }

            Ok(Box::new(MockWriter {
                files: self.files.clone(),
                path: path.to_string(),
                buf: initial,
            }))
        }

        fn mkdir(&self, path: &str) -> VfsResult<()> {
            self.dirs.lock().unwrap().insert(path.to_string());
            Ok(())
        }

        fn rmdir(&self, path: &str) -> VfsResult<()> {
            if self.dirs.lock().unwrap().remove(path) {
                Ok(())
            } else {
                Err(VfsError::NotFound)
            }
        }

        fn unlink(&self, path: &str) -> VfsResult<()> {
            if self.files.lock().unwrap().remove(path).is_some() {
                Ok(())
            } else {
                Err(VfsError::NotFound)
            }
        }

        fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
            let mut files = self.files.lock().unwrap();

            match files.remove(from) {
                Some(data) => {
                    files.insert(to.to_string(), data);
                    Ok(())
                }
                None => Err(VfsError::NotFound),
            }
        }
    }

    struct OneUser;

    impl Authenticator for OneUser {
        fn authenticate(&self, user: &str, pass: &str) -> bool {
            user == "bob" && pass == "secret"
        }
    }

    struct Harness {
        _poll: Poll,
        registry: Registry,
        session: Session,
        _client: std::net::TcpStream,
        vfs: MockVfs,
        auth: OneUser,
        commands: CommandSet,
    }

    impl Harness {
        fn new() -> Harness {
            let (stream, peer, client) = tcp_pair();
            let poll = Poll::new().unwrap();
            let registry = poll.registry().try_clone().unwrap();

            Harness {
                _poll: poll,
                registry,
                session: Session::new(stream, peer, None),
                _client: client,
                vfs: MockVfs::new(),
                auth: OneUser,
                commands: CommandSet::new(),
            }
        }

        fn dispatch(&mut self, verb: &str, args: &str) {
            let mut ctx = Ctx {
                session: &mut self.session,
                slot: 0,
                registry: &self.registry,
                vfs: &self.vfs,
                auth: &self.auth,
            };

            self.commands.dispatch(&mut ctx, verb, args);
        }

        fn replies(&mut self) -> String {
            let out = String::from_utf8_lossy(self.session.write_queue.data()).into_owned();
            self.session.write_queue.clear();
            out
        }

        fn login(&mut self) {
            self.dispatch("USER", "bob");
            self.dispatch("PASS", "secret");
            let replies = self.replies();
            assert!(replies.contains("230 "), "login failed: {}", replies);
        }
    }

    #[test]
    fn test_unknown_verb() {
        let mut h = Harness::new();

        h.dispatch("XYZZY", "");

        assert_eq!(h.replies(), "500 Unknown command.\r\n");
    }

    #[test]
    fn test_auth_gate_rejects_before_login() {
        let mut h = Harness::new();

        h.dispatch("LIST", "");
        assert_eq!(h.replies(), "530 Not logged in.\r\n");

        h.dispatch("STOR", "/a.txt");
        assert_eq!(h.replies(), "530 Not logged in.\r\n");
    }

    #[test]
    fn test_login_flow_wrong_password() {
        let mut h = Harness::new();

        h.dispatch("USER", "bob");
        assert_eq!(h.replies(), "331 Username ok, send password.\r\n");

        h.dispatch("PASS", "wrong");
        assert_eq!(h.replies(), "530 Login incorrect.\r\n");

        // Still gated.
        h.dispatch("LIST", "");
        assert_eq!(h.replies(), "530 Not logged in.\r\n");
    }

    #[test]
    fn test_login_flow_accepts() {
        let mut h = Harness::new();

        h.dispatch("USER", "bob");
        h.dispatch("PASS", "secret");

        assert!(h.replies().ends_with("230 User logged in.\r\n"));
        assert!(h.session.is_authenticated());
    }

    #[test]
    fn test_pass_without_user() {
        let mut h = Harness::new();

        h.dispatch("PASS", "secret");

        assert_eq!(h.replies(), "503 Login with USER first.\r\n");
    }

    #[test]
    fn test_pass_after_failed_pass() {
        let mut h = Harness::new();

        h.dispatch("USER", "bob");
        h.dispatch("PASS", "wrong");
        h.replies();

        // A bare retry without a fresh USER gets the failure-specific text.
        h.dispatch("PASS", "secret");
        assert_eq!(h.replies(), "503 Login failed, send USER first.\r\n");
    }

    #[test]
    fn test_pass_when_already_logged_in() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("PASS", "secret");

        assert_eq!(h.replies(), "503 Already logged in.\r\n");
        assert!(h.session.is_authenticated());
    }

    #[test]
    fn test_missing_argument() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("CWD", "");

        assert_eq!(h.replies(), "501 Missing argument.\r\n");
    }

    #[test]
    fn test_pwd_and_cwd() {
        let mut h = Harness::new();
        h.login();
        h.vfs.add_dir("/music");

        h.dispatch("PWD", "");
        assert_eq!(h.replies(), "257 \"/\" is the current directory.\r\n");

        h.dispatch("CWD", "music");
        assert_eq!(h.replies(), "250 Directory changed.\r\n");

        h.dispatch("PWD", "");
        assert_eq!(h.replies(), "257 \"/music\" is the current directory.\r\n");

        h.dispatch("CDUP", "");
        assert_eq!(h.replies(), "250 Directory changed.\r\n");
        assert_eq!(h.session.cwd, "/");
    }

    #[test]
    fn test_cwd_missing_directory() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("CWD", "nope");

        assert_eq!(h.replies(), "550 No such directory.\r\n");
        assert_eq!(h.session.cwd, "/");
    }

    #[test]
    fn test_mkd_rmd_dele() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("MKD", "stuff");
        assert_eq!(h.replies(), "257 \"/stuff\" created.\r\n");

        h.dispatch("RMD", "stuff");
        assert_eq!(h.replies(), "250 Directory removed.\r\n");

        h.vfs.add_file("/junk.bin", b"x");
        h.dispatch("DELE", "junk.bin");
        assert_eq!(h.replies(), "250 File removed.\r\n");

        h.dispatch("DELE", "junk.bin");
        assert_eq!(h.replies(), "550 Cannot remove file.\r\n");
    }

    #[test]
    fn test_rename_happy_path() {
        let mut h = Harness::new();
        h.login();
        h.vfs.add_file("/a.txt", b"hello");

        h.dispatch("RNFR", "/a.txt");
        assert_eq!(h.replies(), "350 Ready for destination name.\r\n");

        h.dispatch("RNTO", "/b.txt");
        assert_eq!(h.replies(), "250 Rename successful.\r\n");

        assert!(matches!(h.vfs.stat("/a.txt"), Err(VfsError::NotFound)));
        assert_eq!(h.vfs.stat("/b.txt").unwrap().size, 5);
    }

    #[test]
    fn test_rename_source_cleared_by_intervening_command() {
        let mut h = Harness::new();
        h.login();
        h.vfs.add_file("/a.txt", b"hello");

        h.dispatch("RNFR", "/a.txt");
        h.dispatch("NOOP", "");
        h.dispatch("RNTO", "/b.txt");

        assert!(h.replies().ends_with("503 RNFR required first.\r\n"));
        assert!(h.vfs.stat("/a.txt").is_ok());
    }

    #[test]
    fn test_rnfr_missing_source() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("RNFR", "/nope.txt");

        assert_eq!(h.replies(), "550 No such file or directory.\r\n");
    }

    #[test]
    fn test_rnto_after_failed_rnfr() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("RNFR", "/nope.txt");
        h.replies();

        h.dispatch("RNTO", "/b.txt");

        assert_eq!(h.replies(), "503 RNFR did not select a source.\r\n");
    }

    #[test]
    fn test_size_and_mdtm() {
        let mut h = Harness::new();
        h.login();
        h.vfs.add_file("/a.bin", &[0u8; 1000]);
        h.vfs.add_dir("/d");

        h.dispatch("SIZE", "/a.bin");
        assert_eq!(h.replies(), "213 1000\r\n");

        h.dispatch("SIZE", "/d");
        assert_eq!(h.replies(), "550 Could not get file size.\r\n");

        h.dispatch("MDTM", "/a.bin");
        assert_eq!(h.replies(), "213 19700101000000\r\n");
    }

    #[test]
    fn test_rest_sets_offset() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("REST", "400");
        assert_eq!(h.replies(), "350 Restarting at 400.\r\n");
        assert_eq!(h.session.rest_offset, 400);

        h.dispatch("REST", "bogus");
        assert_eq!(h.replies(), "501 Invalid restart offset.\r\n");
    }

    #[test]
    fn test_port_parsing() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("PORT", "10,0,0,1,195,80");
        assert_eq!(h.replies(), "200 PORT command successful.\r\n");
        assert_eq!(
            h.session.port_endpoint,
            Some("10.0.0.1:50000".parse().unwrap())
        );

        h.dispatch("PORT", "10,0,0,1,195");
        assert_eq!(h.replies(), "501 Invalid PORT arguments.\r\n");

        h.dispatch("PORT", "500,0,0,1,195,80");
        assert_eq!(h.replies(), "501 Invalid PORT arguments.\r\n");
    }

    #[test]
    fn test_pasv_announces_control_address() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("PASV", "");
        let reply = h.replies();

        assert!(
            reply.starts_with("227 Entering Passive Mode (127,0,0,1,"),
            "unexpected reply: {}",
            reply
        );
        assert!(h.session.pasv.is_some());

        let endpoint = h.session.pasv_endpoint.unwrap();
        let hi = endpoint.port() >> 8;
        let lo = endpoint.port() & 0xff;
        assert!(reply.contains(&format!("{},{}).", hi, lo)));
    }

    #[test]
    fn test_retr_without_data_endpoint() {
        let mut h = Harness::new();
        h.login();
        h.vfs.add_file("/a.txt", b"hello");

        h.dispatch("RETR", "/a.txt");

        assert_eq!(h.replies(), "425 Use PORT or PASV first.\r\n");
    }

    #[test]
    fn test_retr_missing_file() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("RETR", "/nope.txt");

        assert_eq!(h.replies(), "550 No such file.\r\n");
    }

    #[test]
    fn test_rest_consumed_by_retr() {
        let mut h = Harness::new();
        h.login();
        h.vfs.add_file("/a.bin", &[7u8; 100]);

        h.dispatch("REST", "40");
        h.dispatch("RETR", "/a.bin");
        h.replies();

        assert_eq!(h.session.rest_offset, 0);
    }

    #[test]
    fn test_type_stru_mode() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("TYPE", "A");
        assert_eq!(h.replies(), "200 TYPE set to A.\r\n");
        assert!(!h.session.type_binary);

        h.dispatch("TYPE", "I");
        assert_eq!(h.replies(), "200 TYPE set to I.\r\n");
        assert!(h.session.type_binary);

        h.dispatch("TYPE", "X");
        assert_eq!(h.replies(), "504 Type not supported.\r\n");

        h.dispatch("STRU", "F");
        assert_eq!(h.replies(), "200 STRU set to F.\r\n");

        h.dispatch("MODE", "B");
        assert_eq!(h.replies(), "504 Mode not supported.\r\n");
    }

    #[test]
    fn test_abor_without_transfer() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("ABOR", "");

        assert_eq!(h.replies(), "226 ABOR ok.\r\n");
    }

    #[test]
    fn test_quit_closes_session() {
        let mut h = Harness::new();

        h.dispatch("QUIT", "");

        assert_eq!(h.replies(), "221 Goodbye.\r\n");
        assert_eq!(h.session.state, ControlState::Closed);
    }

    #[test]
    fn test_feat_is_multiline() {
        let mut h = Harness::new();

        h.dispatch("FEAT", "");

        assert_eq!(
            h.replies(),
            "211-Features:\r\n SIZE\r\n MDTM\r\n REST STREAM\r\n PASV\r\n211 End\r\n"
        );
    }

    #[test]
    fn test_site_hook_registration() {
        let mut h = Harness::new();
        h.login();

        h.dispatch("SITE", "WHO");
        assert_eq!(h.replies(), "502 SITE not implemented.\r\n");

        fn site_who(ctx: &mut Ctx<'_>, _args: &str) {
            ctx.session.response(200, "SITE ok.");
        }

        h.commands.register_site(site_who);
        h.dispatch("SITE", "WHO");
        assert_eq!(h.replies(), "200 SITE ok.\r\n");
    }

    #[test]
    fn test_strip_list_flags() {
        assert_eq!(strip_list_flags("-la"), "");
        assert_eq!(strip_list_flags("-l dir"), "dir");
        assert_eq!(strip_list_flags("my file"), "my file");
    }
}
