//! Lock/inode cache.
//!
//! Packet round-trips dominate every FUSE operation, so this layer shadows
//! the handler's view: paths map to inode entries (kind, size, protection,
//! dates), directory listings are cached with a completeness flag, and
//! AmigaDOS locks are held only while they are likely to be useful. The
//! mount is read-only and the image never changes underneath, so entries
//! are never invalidated.
//!
//! The map lock here is short-lived and never held across a packet call;
//! packet traffic serializes on the bridge's CPU lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace, warn};

use crate::amiga::{datestamp_to_unix, dos_error, prot};
use crate::bridge::{Bridge, FibData, FileToken, VolumeInfo};
use crate::error::{AmiError, Result};

/// Guest file handles kept open at once; least recently used handles are
/// closed on the handler side and transparently reopened.
const MAX_OPEN_HANDLES: usize = 8;

/// Largest single ACTION_READ issued to the handler.
const READ_CHUNK: u32 = 128 * 1024;

pub const ROOT_INO: u64 = 1;

/// Host indexing daemons hammer these names on every mount; answering
/// them locally keeps the packet channel quiet.
pub fn is_host_metadata(name: &str) -> bool {
    matches!(
        name,
        ".DS_Store" | ".Spotlight-V100" | ".Trashes" | ".fseventsd" | ".hidden"
            | ".metadata_never_index"
    ) || name.starts_with("._")
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub ino: u64,
    /// Root-relative Amiga path, case preserved; empty for the root.
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub protection: u32,
    pub mtime_secs: u64,
    pub comment: String,
    pub generation: u64,
}

impl Entry {
    /// POSIX mode bits: write access never appears on a read-only mount.
    pub fn mode(&self) -> u16 {
        if self.is_dir {
            return 0o555;
        }
        let mut mode = 0;
        if self.protection & prot::READ == 0 {
            mode |= 0o444;
        }
        if self.protection & prot::EXECUTE == 0 {
            mode |= 0o111;
        }
        mode
    }
}

struct Node {
    entry: Entry,
    lock: Option<u32>,
    children: Option<Vec<u64>>,
    complete: bool,
}

struct Handle {
    path: String,
    token: Option<FileToken>,
    pos: u64,
}

struct Inner {
    by_path: HashMap<String, u64>,
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    handles: HashMap<u64, Handle>,
    next_handle: u64,
    /// Handles with a live guest token, most recently used last.
    lru: Vec<u64>,
    seek_unsupported: bool,
    generation: u64,
}

pub struct InodeCache {
    bridge: Arc<Bridge>,
    inner: Mutex<Inner>,
}

impl InodeCache {
    /// Prime the cache with the volume root.
    pub fn new(bridge: Arc<Bridge>) -> Result<InodeCache> {
        let root_fib = bridge.with_vm(|vm| {
            let lock = vm.root_lock;
            vm.examine(lock)
        })?;
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                entry: Entry {
                    ino: ROOT_INO,
                    path: String::new(),
                    name: root_fib.name.clone(),
                    is_dir: true,
                    size: 0,
                    protection: 0,
                    mtime_secs: datestamp_to_unix(root_fib.days, root_fib.minute, root_fib.tick),
                    comment: String::new(),
                    generation: 0,
                },
                lock: None, // the root lock itself lives on the vm
                children: None,
                complete: false,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(String::new(), ROOT_INO);
        debug!("volume root is {:?}", root_fib.name);
        Ok(InodeCache {
            bridge,
            inner: Mutex::new(Inner {
                by_path,
                nodes,
                next_ino: 2,
                handles: HashMap::new(),
                next_handle: 1,
                lru: Vec::new(),
                seek_unsupported: false,
                generation: 0,
            }),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn volume_name(&self) -> String {
        self.lock_inner().nodes[&ROOT_INO].entry.name.clone()
    }

    pub fn entry(&self, ino: u64) -> Option<Entry> {
        self.lock_inner().nodes.get(&ino).map(|n| n.entry.clone())
    }

    /// Resolve a child name under a directory inode, issuing packets on a
    /// cache miss. Host metadata names never reach the handler.
    pub fn lookup(&self, parent: u64, name: &str) -> Result<Entry> {
        if is_host_metadata(name) {
            trace!("rejecting host metadata name {name:?}");
            return Err(AmiError::Packet(dos_error::OBJECT_NOT_FOUND as i32));
        }
        let parent_path = {
            let inner = self.lock_inner();
            let node = inner
                .nodes
                .get(&parent)
                .ok_or_else(|| AmiError::Packet(dos_error::OBJECT_NOT_FOUND as i32))?;
            if !node.entry.is_dir {
                return Err(AmiError::Packet(dos_error::OBJECT_WRONG_TYPE as i32));
            }
            let key = lower_join(&node.entry.path, name);
            if let Some(&ino) = inner.by_path.get(&key) {
                return Ok(inner.nodes[&ino].entry.clone());
            }
            // A fully enumerated directory cannot contain unseen names.
            if node.complete {
                return Err(AmiError::Packet(dos_error::OBJECT_NOT_FOUND as i32));
            }
            node.entry.path.clone()
        };

        let path = join(&parent_path, name);
        let (fib, lock) = self.bridge.with_vm(|vm| {
            let lock = vm.locate(&path)?;
            match vm.examine(lock) {
                // Hold directory locks: the parent listing is incomplete
                // (checked above), so a readdir of this entry is likely.
                Ok(fib) if fib.is_dir => Ok((fib, Some(lock))),
                Ok(fib) => {
                    vm.free_lock(lock)?;
                    Ok((fib, None))
                }
                Err(e) => {
                    let _ = vm.free_lock(lock);
                    Err(e)
                }
            }
        })?;

        let (entry, leftover) = {
            let mut inner = self.lock_inner();
            inner.insert(&parent_path, fib, lock)
        };
        self.free_locks(leftover);
        Ok(entry)
    }

    /// Directory listing, fully cached after the first enumeration.
    pub fn readdir(&self, ino: u64) -> Result<Vec<Entry>> {
        let (path, cached_lock) = {
            let mut inner = self.lock_inner();
            let node = inner
                .nodes
                .get_mut(&ino)
                .ok_or_else(|| AmiError::Packet(dos_error::OBJECT_NOT_FOUND as i32))?;
            if !node.entry.is_dir {
                return Err(AmiError::Packet(dos_error::OBJECT_WRONG_TYPE as i32));
            }
            let cached = if node.complete {
                node.children.clone()
            } else {
                None
            };
            if let Some(children) = cached {
                return Ok(children
                    .iter()
                    .filter_map(|c| inner.nodes.get(c).map(|n| n.entry.clone()))
                    .collect());
            }
            match inner.nodes.get_mut(&ino) {
                Some(node) => (node.entry.path.clone(), node.lock.take()),
                None => return Err(AmiError::Packet(dos_error::OBJECT_NOT_FOUND as i32)),
            }
        };

        let listing = self.bridge.with_vm(|vm| {
            let (lock, temporary) = match cached_lock {
                Some(l) => (l, true), // speculative lock, freed below
                None if ino == ROOT_INO => (vm.root_lock, false),
                None => (vm.locate(&path)?, true),
            };
            let r = vm.read_dir(lock);
            if temporary {
                let _ = vm.free_lock(lock);
            }
            r
        })?;

        let (out, leftovers) = {
            let mut inner = self.lock_inner();
            let mut children = Vec::with_capacity(listing.len());
            let mut out = Vec::with_capacity(listing.len());
            let mut leftovers = Vec::new();
            for fib in listing {
                let (entry, leftover) = inner.insert(&path, fib, None);
                children.push(entry.ino);
                out.push(entry);
                leftovers.extend(leftover);
            }
            if let Some(node) = inner.nodes.get_mut(&ino) {
                node.children = Some(children);
                node.complete = true;
            }
            (out, leftovers)
        };
        self.free_locks(leftovers);
        Ok(out)
    }

    /// Open for reading; returns a host handle token.
    pub fn open(&self, ino: u64) -> Result<u64> {
        let path = {
            let inner = self.lock_inner();
            let node = inner
                .nodes
                .get(&ino)
                .ok_or_else(|| AmiError::Packet(dos_error::OBJECT_NOT_FOUND as i32))?;
            if node.entry.is_dir {
                return Err(AmiError::Packet(dos_error::OBJECT_WRONG_TYPE as i32));
            }
            node.entry.path.clone()
        };
        let token = self.bridge.with_vm(|vm| vm.open_input(&path))?;
        let (fh, victims) = {
            let mut inner = self.lock_inner();
            let fh = inner.next_handle;
            inner.next_handle += 1;
            inner.handles.insert(
                fh,
                Handle {
                    path,
                    token: Some(token),
                    pos: 0,
                },
            );
            inner.lru.push(fh);
            let victims = inner.evict();
            (fh, victims)
        };
        self.close_tokens(victims)?;
        Ok(fh)
    }

    /// Read `size` bytes at `offset`. Sequential reads ride the handler's
    /// file position; random reads use ACTION_SEEK when the handler
    /// supports it and reopen-and-discard otherwise.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let (path, token, mut pos, seekless) = {
            let mut inner = self.lock_inner();
            let h = inner
                .handles
                .get(&fh)
                .ok_or_else(|| AmiError::Protocol(format!("unknown file handle {fh}")))?;
            let tuple = (h.path.clone(), h.token, h.pos, inner.seek_unsupported);
            if tuple.1.is_some() {
                touch(&mut inner.lru, fh);
            }
            tuple
        };

        // Reopen if the LRU closed this handle on the guest side.
        let mut t = match token {
            Some(t) => t,
            None => {
                trace!("reopening evicted handle for {path:?}");
                pos = 0;
                self.bridge.with_vm(|vm| vm.open_input(&path))?
            }
        };

        if pos != offset {
            if !seekless {
                match self.bridge.with_vm(|vm| vm.seek(&t, offset as u32))? {
                    Some(_) => pos = offset,
                    None => {
                        debug!("handler lacks ACTION_SEEK; linearizing reads");
                        self.lock_inner().seek_unsupported = true;
                    }
                }
            }
            if pos != offset {
                if offset < pos {
                    // Reopen from zero and discard forward.
                    self.bridge.with_vm(|vm| vm.close(t))?;
                    t = self.bridge.with_vm(|vm| vm.open_input(&path))?;
                    pos = 0;
                }
                while pos < offset {
                    let skip = (offset - pos).min(u64::from(READ_CHUNK)) as u32;
                    let got = self.bridge.with_vm(|vm| vm.read(&t, skip))?;
                    if got.is_empty() {
                        break; // EOF before the requested offset
                    }
                    pos += got.len() as u64;
                }
            }
        }

        let mut out = Vec::with_capacity(size as usize);
        while (out.len() as u32) < size {
            let want = (size - out.len() as u32).min(READ_CHUNK);
            let got = self.bridge.with_vm(|vm| vm.read(&t, want))?;
            if got.is_empty() {
                break;
            }
            pos += got.len() as u64;
            out.extend_from_slice(&got);
        }

        let victims = {
            let mut inner = self.lock_inner();
            if let Some(h) = inner.handles.get_mut(&fh) {
                h.token = Some(t);
                h.pos = pos;
            }
            touch(&mut inner.lru, fh);
            inner.evict()
        };
        self.close_tokens(victims)?;
        Ok(out)
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = {
            let mut inner = self.lock_inner();
            let h = inner.handles.remove(&fh);
            inner.lru.retain(|&x| x != fh);
            h
        };
        if let Some(Handle { token: Some(t), .. }) = handle {
            self.bridge.with_vm(|vm| vm.close(t))?;
        }
        Ok(())
    }

    pub fn statfs(&self) -> Result<VolumeInfo> {
        self.bridge.with_vm(|vm| vm.volume_info())
    }

    /// Unmount path: close every open guest handle, release cached locks,
    /// then let the vm drop the root lock and halt.
    pub fn shutdown(&self) {
        let (handles, locks): (Vec<_>, Vec<_>) = {
            let mut inner = self.lock_inner();
            let handles: Vec<_> = inner.handles.drain().filter_map(|(_, h)| h.token).collect();
            inner.lru.clear();
            let locks: Vec<_> = inner
                .nodes
                .values_mut()
                .filter_map(|n| n.lock.take())
                .collect();
            (handles, locks)
        };
        let r = self.bridge.with_vm(|vm| {
            for t in handles {
                if let Err(e) = vm.close(t) {
                    warn!("closing handle during unmount failed: {e}");
                }
            }
            for l in locks {
                if let Err(e) = vm.free_lock(l) {
                    warn!("freeing lock during unmount failed: {e}");
                }
            }
            vm.shutdown();
            Ok(())
        });
        if let Err(e) = r {
            warn!("unmount cleanup failed: {e}");
        }
    }

    fn close_tokens(&self, tokens: Vec<FileToken>) -> Result<()> {
        for t in tokens {
            self.bridge.with_vm(|vm| vm.close(t))?;
        }
        Ok(())
    }

    fn free_locks(&self, locks: Vec<u32>) {
        for l in locks {
            if let Err(e) = self.bridge.with_vm(|vm| vm.free_lock(l)) {
                warn!("freeing redundant lock failed: {e}");
            }
        }
    }
}

impl Inner {
    /// Record a FIB under its parent path, reusing the inode for a path
    /// seen before. Returns the entry and any lock that became redundant
    /// (caller frees it outside the map lock).
    fn insert(&mut self, parent_path: &str, fib: FibData, lock: Option<u32>) -> (Entry, Vec<u32>) {
        let path = join(parent_path, &fib.name);
        let key = path.to_lowercase();
        let ino = match self.by_path.get(&key) {
            Some(&ino) => ino,
            None => {
                let ino = self.next_ino;
                self.next_ino += 1;
                self.by_path.insert(key, ino);
                ino
            }
        };
        self.generation += 1;
        let entry = Entry {
            ino,
            path,
            name: fib.name,
            is_dir: fib.is_dir,
            size: u64::from(fib.size),
            protection: fib.protection,
            mtime_secs: datestamp_to_unix(fib.days, fib.minute, fib.tick),
            comment: fib.comment,
            generation: self.generation,
        };
        let mut leftover = Vec::new();
        match self.nodes.entry(ino) {
            std::collections::hash_map::Entry::Occupied(mut o) => {
                let node = o.get_mut();
                node.entry = entry.clone();
                match (node.lock, lock) {
                    (Some(_), Some(new)) => leftover.push(new),
                    (None, Some(new)) => node.lock = Some(new),
                    _ => {}
                }
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(Node {
                    entry: entry.clone(),
                    lock,
                    children: None,
                    complete: false,
                });
            }
        }
        (entry, leftover)
    }

    /// Trim the guest-handle LRU to its cap; returns tokens to close.
    fn evict(&mut self) -> Vec<FileToken> {
        let mut victims = Vec::new();
        while self.lru.len() > MAX_OPEN_HANDLES {
            let fh = self.lru.remove(0);
            if let Some(h) = self.handles.get_mut(&fh) {
                if let Some(t) = h.token.take() {
                    trace!("evicting guest handle for {:?}", h.path);
                    victims.push(t);
                }
                h.pos = 0;
            }
        }
        victims
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn lower_join(parent: &str, name: &str) -> String {
    join(parent, name).to_lowercase()
}

fn touch(lru: &mut Vec<u64>, fh: u64) {
    lru.retain(|&x| x != fh);
    lru.push(fh);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_names_are_rejected_locally() {
        assert!(is_host_metadata(".DS_Store"));
        assert!(is_host_metadata("._readme.txt"));
        assert!(is_host_metadata(".Spotlight-V100"));
        assert!(is_host_metadata(".fseventsd"));
        assert!(!is_host_metadata("readme.txt"));
        assert!(!is_host_metadata(".profile"));
    }

    #[test]
    fn path_join_handles_root() {
        assert_eq!(join("", "System"), "System");
        assert_eq!(join("System", "Libs"), "System/Libs");
        assert_eq!(lower_join("System", "LIBS"), "system/libs");
    }

    #[test]
    fn lru_touch_moves_to_back() {
        let mut lru = vec![1, 2, 3];
        touch(&mut lru, 1);
        assert_eq!(lru, vec![2, 3, 1]);
        touch(&mut lru, 4);
        assert_eq!(lru, vec![2, 3, 1, 4]);
    }

    #[test]
    fn mode_mapping_masks_denied_bits() {
        let mut e = Entry {
            ino: 2,
            path: "f".into(),
            name: "f".into(),
            is_dir: false,
            size: 0,
            protection: prot::EXECUTE, // execute denied
            mtime_secs: 0,
            comment: String::new(),
            generation: 0,
        };
        assert_eq!(e.mode(), 0o444);
        e.protection = prot::EXECUTE | prot::READ;
        assert_eq!(e.mode(), 0);
        e.protection = 0; // everything allowed
        assert_eq!(e.mode(), 0o555);
        e.is_dir = true;
        assert_eq!(e.mode(), 0o555);
    }
}
