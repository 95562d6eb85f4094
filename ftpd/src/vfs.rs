//! Disk-backed filesystem adapter. Virtual paths arrive already normalised
//! from the server core and are grafted under the configured root; `..`
//! segments never reach this layer, but they are dropped here anyway so the
//! root cannot be escaped.

use ferrite::fs::{Entry, EntryKind, Metadata, Vfs, VfsResult, WriteMode};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub struct DiskVfs {
    root: PathBuf,
    owner: String,
    group: String,
}

impl DiskVfs {
    pub fn new<P: AsRef<Path>>(root: P) -> std::io::Result<DiskVfs> {
        Ok(DiskVfs {
            root: root.as_ref().canonicalize()?,
            owner: "root".to_string(),
            group: "root".to_string(),
        })
    }

    fn real(&self, vpath: &str) -> PathBuf {
        let mut real = self.root.clone();

        for part in vpath.split('/') {
            match part {
                "" | "." | ".." => (),
                part => real.push(part),
            }
        }

        real
    }
}

fn convert(meta: &std::fs::Metadata, owner: &str, group: &str) -> Metadata {
    let kind = if meta.is_dir() {
        EntryKind::Dir
    } else if meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    let mtime = meta
        .modified()
        .ok()
        .and_then(|when| when.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    Metadata {
        kind,
        size: meta.len(),
        mtime,
        mode_bits: meta.permissions().mode() & 0o7777,
        owner: owner.to_string(),
        group: group.to_string(),
        nlink: meta.nlink() as u32,
    }
}

impl Vfs for DiskVfs {
    fn stat(&self, path: &str) -> VfsResult<Metadata> {
        let meta = std::fs::metadata(self.real(path))?;
        Ok(convert(&meta, &self.owner, &self.group))
    }

    fn list(&self, path: &str) -> VfsResult<Box<dyn Iterator<Item = Entry> + Send>> {
        let reader = std::fs::read_dir(self.real(path))?;
        let owner = self.owner.clone();
        let group = self.group.clone();

        let entries = reader.filter_map(move |entry| {
            let entry = entry.ok()?;
            let meta = entry.metadata().ok()?;
            let name = entry.file_name().into_string().ok()?;

            Some(Entry {
                name,
                meta: convert(&meta, &owner, &group),
            })
        });

        Ok(Box::new(entries))
    }

    fn open_read(&self, path: &str, offset: u64) -> VfsResult<Box<dyn Read + Send>> {
        let mut file = File::open(self.real(path))?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }

        Ok(Box::new(file))
    }

    fn open_write(
        &self,
        path: &str,
        mode: WriteMode,
        offset: u64,
    ) -> VfsResult<Box<dyn Write + Send>> {
        let real = self.real(path);

        let file = match mode {
            WriteMode::Append => OpenOptions::new().append(true).create(true).open(real)?,
            WriteMode::Truncate if offset == 0 => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(real)?,
            WriteMode::Truncate => {
                let mut file = OpenOptions::new().write(true).create(true).open(real)?;
                file.set_len(offset)?;
                file.seek(SeekFrom::Start(offset))?;
                file
            }
        };

        Ok(Box::new(file))
    }

    fn mkdir(&self, path: &str) -> VfsResult<()> {
        std::fs::create_dir(self.real(path))?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        std::fs::remove_dir(self.real(path))?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        std::fs::remove_file(self.real(path))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        std::fs::rename(self.real(from), self.real(to))?;
        Ok(())
    }
}
