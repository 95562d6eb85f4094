//! The filesystem seam. The server core never touches a real filesystem;
//! every handler goes through the `Vfs` trait and the host supplies the
//! implementation. Virtual paths are absolute, `/`-separated strings.

use chrono::DateTime;
use std::io;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

/// Stat result for a single path.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time, unix seconds.
    pub mtime: u64,
    pub mode_bits: u32,
    pub owner: String,
    pub group: String,
    pub nlink: u32,
}

/// A named directory entry, as produced by `Vfs::list`.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub meta: Metadata,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteMode {
    Truncate,
    Append,
}

#[derive(Debug)]
pub enum VfsError {
    NotFound,
    NotADirectory,
    Denied,
    Io(io::ErrorKind),
}

impl From<io::Error> for VfsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => VfsError::NotFound,
            io::ErrorKind::PermissionDenied => VfsError::Denied,
            kind => VfsError::Io(kind),
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

/// Abstract filesystem operations invoked by the command handlers. Read and
/// write handles are plain `io::Read`/`io::Write` trait objects; dropping a
/// handle closes it.
pub trait Vfs: Send {
    fn stat(&self, path: &str) -> VfsResult<Metadata>;
    fn list(&self, path: &str) -> VfsResult<Box<dyn Iterator<Item = Entry> + Send>>;
    fn open_read(&self, path: &str, offset: u64) -> VfsResult<Box<dyn io::Read + Send>>;
    fn open_write(
        &self,
        path: &str,
        mode: WriteMode,
        offset: u64,
    ) -> VfsResult<Box<dyn io::Write + Send>>;
    fn mkdir(&self, path: &str) -> VfsResult<()>;
    fn rmdir(&self, path: &str) -> VfsResult<()>;
    fn unlink(&self, path: &str) -> VfsResult<()>;
    fn rename(&self, from: &str, to: &str) -> VfsResult<()>;
}

/// Joins `arg` onto `cwd` and normalises the result. `.` and empty segments
/// vanish, `..` pops (clamped at the root), and the returned path is always
/// absolute.
pub fn resolve(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else if arg.is_empty() {
        cwd.to_string()
    } else {
        format!("{}/{}", cwd, arg)
    };

    let mut parts: Vec<&str> = Vec::new();

    for part in joined.split('/') {
        match part {
            "" | "." => (),
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }

    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// The leading `drwxr-xr-x` column of a long listing line.
pub fn mode_string(kind: EntryKind, mode_bits: u32) -> String {
    const FLAGS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];

    let mut out = String::with_capacity(10);

    out.push(match kind {
        EntryKind::Dir => 'd',
        _ => '-',
    });

    for &(bit, ch) in FLAGS.iter() {
        out.push(if mode_bits & bit != 0 { ch } else { '-' });
    }

    out
}

// Entries younger than this show HH:MM, older ones show the year.
const RECENT_SECS: u64 = 180 * 24 * 3600;

/// One `ls -l` style line, CRLF terminated.
pub fn render_long(entry: &Entry, now: u64) -> String {
    let meta = &entry.meta;

    let stamp = match DateTime::from_timestamp(meta.mtime as i64, 0) {
        Some(when) if now.saturating_sub(meta.mtime) < RECENT_SECS => {
            when.format("%b %d %H:%M").to_string()
        }
        Some(when) => when.format("%b %d  %Y").to_string(),
        None => "Jan 01 00:00".to_string(),
    };

    format!(
        "{} {} {} {} {} {} {}\r\n",
        mode_string(meta.kind, meta.mode_bits),
        meta.nlink,
        meta.owner,
        meta.group,
        meta.size,
        stamp,
        entry.name
    )
}

/// One bare-name line for NLST, CRLF terminated.
pub fn render_name(entry: &Entry) -> String {
    format!("{}\r\n", entry.name)
}

/// MDTM timestamp, `YYYYMMDDhhmmss` in UTC.
pub fn mdtm_stamp(mtime: u64) -> String {
    match DateTime::from_timestamp(mtime as i64, 0) {
        Some(when) => when.format("%Y%m%d%H%M%S").to_string(),
        None => "19700101000000".to_string(),
    }
}
