//! FUSE adapter: translates fuser callbacks into cache operations.
//!
//! Strictly read-only; every mutating operation answers EROFS. Attributes
//! never expire from the kernel cache faster than one hour because the
//! mount never invalidates (the image cannot change underneath).

use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, Request,
};
use libc::{EISDIR, ENOTDIR, EROFS};
use log::{debug, error, info};

use crate::amiga::dos_error;
use crate::cache::{Entry, InodeCache, ROOT_INO};
use crate::error::AmiError;

const TTL: Duration = Duration::from_secs(3600);

/// Largest legal AmigaDOS file name.
const NAME_MAX: u32 = 107;

pub struct AmigaFs {
    cache: std::sync::Arc<InodeCache>,
    uid: u32,
    gid: u32,
    block_size: u32,
}

impl AmigaFs {
    pub fn new(cache: std::sync::Arc<InodeCache>, block_size: u32) -> Self {
        Self {
            cache,
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            block_size,
        }
    }

    fn attr(&self, entry: &Entry) -> FileAttr {
        let mtime = UNIX_EPOCH + Duration::from_secs(entry.mtime_secs);
        FileAttr {
            ino: entry.ino,
            size: entry.size,
            blocks: entry.size.div_ceil(u64::from(self.block_size)),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: entry.mode(),
            nlink: if entry.is_dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            flags: 0,
            blksize: self.block_size,
        }
    }
}

/// Context-sensitive errno for "object wrong type".
fn errno_for(e: &AmiError, wrong_type: i32) -> i32 {
    match e {
        AmiError::Packet(code) if *code == dos_error::OBJECT_WRONG_TYPE as i32 => wrong_type,
        other => other.errno(),
    }
}

impl Filesystem for AmigaFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.cache.lookup(parent, name) {
            Ok(entry) => reply.entry(&TTL, &self.attr(&entry), entry.generation),
            Err(e) => reply.error(errno_for(&e, ENOTDIR)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.cache.entry(ino) {
            Some(entry) => reply.attr(&TTL, &self.attr(&entry)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.cache.readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno_for(&e, ENOTDIR));
                return;
            }
        };
        let mut cookie = offset;
        if cookie == 0 {
            cookie = 1;
            if reply.add(ino, cookie, FileType::Directory, ".") {
                reply.ok();
                return;
            }
        }
        if cookie == 1 {
            cookie = 2;
            if reply.add(ROOT_INO, cookie, FileType::Directory, "..") {
                reply.ok();
                return;
            }
        }
        for entry in entries.iter().skip((cookie - 2) as usize) {
            cookie += 1;
            let kind = if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            if reply.add(entry.ino, cookie, kind, &entry.name) {
                break; // reply buffer full
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            reply.error(EROFS);
            return;
        }
        match self.cache.open(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno_for(&e, EISDIR)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.cache.read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.cache.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                debug!("release failed: {e}");
                reply.ok(); // nothing the kernel can do with an error here
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.cache.statfs() {
            Ok(info) => reply.statfs(
                info.total_blocks,
                0, // bfree: read-only volume
                0, // bavail
                0,
                0,
                info.block_size,
                NAME_MAX,
                info.block_size,
            ),
            Err(e) => {
                error!("statfs failed: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            reply.error(EROFS);
            return;
        }
        if self.cache.entry(ino).is_some() {
            reply.ok();
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn destroy(&mut self) {
        info!("unmounting: flushing handles and releasing locks");
        self.cache.shutdown();
    }

    // Everything below mutates; the mount is read-only.

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(EROFS);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EROFS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(EROFS);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(EROFS);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(EROFS);
    }
}
