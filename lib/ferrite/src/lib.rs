//! ferrite is a small single-threaded FTP server core. The event loop in
//! `server` owns every socket and drives per-session state machines in
//! `session`, verb handlers in `command` and streaming transfers in
//! `transfer`; the host supplies the filesystem, the credential check and
//! the lifecycle flag.

#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod command;
pub mod fs;
pub mod server;
pub mod session;
pub mod sock;
pub mod support;
pub mod transfer;

pub use crate::command::{Authenticator, CommandSet, Ctx, Handler};
pub use crate::fs::{Entry, EntryKind, Metadata, Vfs, VfsError, VfsResult, WriteMode};
pub use crate::server::{Lifecycle, Server, ServerConfig, ServerError};
pub use crate::support::{NetError, NetResult};
