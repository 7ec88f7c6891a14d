//! End-to-end bridge tests against a scripted handler.
//!
//! The scripted core stands in for a real m68k filesystem handler: it is a
//! [`CpuCore`] that, instead of executing instructions, services DosPackets
//! straight out of guest RAM, and uses genuine A-line traps for WaitPort,
//! OpenDevice and DoIO so the whole kernel/bridge/device protocol is
//! exercised exactly as a real handler would drive it.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use amifuse::amiga::{
    self, DOSTRUE, action, devicenode, dos_error, filehandle, fssm, infodata, ioreq, msgport,
    node, node_type, packet, prot, td_cmd,
};
use amifuse::boot::{BootConfig, boot};
use amifuse::bridge::Bridge;
use amifuse::cache::{InodeCache, ROOT_INO};
use amifuse::cpu::{CpuCore, Exit, RegFile};
use amifuse::error::AmiError;
use amifuse::exec::{add_tail, list_head, remove_node};
use amifuse::mem::{Mem, bptr_to_addr};

// ---- fixture volume ----

#[derive(Clone)]
struct VNode {
    name: &'static str,
    is_dir: bool,
    data: Vec<u8>,
    protection: u32,
    children: Vec<usize>,
}

fn fixture_volume() -> Vec<VNode> {
    let mut data_bin = vec![0u8; 64 * 1024];
    for (i, b) in data_bin.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    vec![
        VNode {
            name: "Work",
            is_dir: true,
            data: Vec::new(),
            protection: 0,
            children: vec![1, 2, 3, 4, 5],
        },
        VNode {
            name: "System",
            is_dir: true,
            data: Vec::new(),
            protection: 0,
            children: vec![6],
        },
        VNode {
            name: "Programs",
            is_dir: true,
            data: Vec::new(),
            protection: 0,
            children: Vec::new(),
        },
        VNode {
            name: "empty.txt",
            is_dir: false,
            data: Vec::new(),
            protection: prot::EXECUTE,
            children: Vec::new(),
        },
        VNode {
            name: "readme.txt",
            is_dir: false,
            data: b"Hello Amiga\n".to_vec(),
            protection: prot::EXECUTE,
            children: Vec::new(),
        },
        VNode {
            name: "data.bin",
            is_dir: false,
            data: data_bin,
            protection: 0,
            children: Vec::new(),
        },
        VNode {
            name: "startup-sequence",
            is_dir: false,
            data: b"; boot script\n".to_vec(),
            protection: prot::EXECUTE,
            children: Vec::new(),
        },
    ]
}

// ---- the scripted handler core ----

const SCRATCH: u32 = 0x00F0_0000;

enum Step {
    Idle,
    StartupOpenDevice { pkt: u32, msg: u32 },
    StartupDoIo { pkt: u32, msg: u32 },
}

struct ScriptedHandler {
    volume: Vec<VNode>,
    support_seek: bool,
    step: Step,
    locks: HashMap<u32, usize>,
    next_lock: u32,
    cursors: HashMap<u32, usize>,
    files: HashMap<u32, (usize, usize)>,
    next_arg1: u32,
}

impl ScriptedHandler {
    fn new(volume: Vec<VNode>, support_seek: bool) -> Self {
        Self {
            volume,
            support_seek,
            step: Step::Idle,
            locks: HashMap::new(),
            next_lock: 0x0C00_0000,
            cursors: HashMap::new(),
            files: HashMap::new(),
            next_arg1: 0x1000,
        }
    }

    fn exec_base(mem: &Mem) -> u32 {
        mem.read_long(4).unwrap()
    }

    fn own_port(mem: &Mem) -> u32 {
        let exec = Self::exec_base(mem);
        let task = mem.read_long(exec + amiga::EXECBASE_THISTASK).unwrap();
        task + amiga::process::PR_MSGPORT
    }

    /// Arrange for the kernel to see a library call: point the PC at the
    /// vector and hand back its trap opcode.
    fn trap(mem: &Mem, regs: &mut RegFile, lvo: i32) -> Exit {
        let base = Self::exec_base(mem);
        let at = (base as i64 + i64::from(lvo)) as u32;
        regs.pc = at;
        Exit::ALineTrap {
            opcode: mem.read_word(at).unwrap(),
        }
    }

    fn new_lock(&mut self, idx: usize) -> u32 {
        let l = self.next_lock;
        self.next_lock += 4;
        self.locks.insert(l, idx);
        l
    }

    fn resolve(&self, base: u32, path: &[u8]) -> Option<usize> {
        let mut at = if base == 0 {
            0
        } else {
            *self.locks.get(&base)?
        };
        let path = String::from_utf8_lossy(path).into_owned();
        for comp in path.split('/') {
            if comp.is_empty() {
                continue;
            }
            if !self.volume[at].is_dir {
                return None;
            }
            at = *self.volume[at]
                .children
                .iter()
                .find(|&&c| self.volume[c].name.eq_ignore_ascii_case(comp))?;
        }
        Some(at)
    }

    fn write_fib(&self, mem: &mut Mem, fib: u32, idx: usize) {
        use amiga::fib as f;
        mem.fill(fib, f::SIZE, 0).unwrap();
        mem.write_long(fib + f::DISKKEY, idx as u32).unwrap();
        let vn = &self.volume[idx];
        let entry_type: i32 = if idx == 0 {
            1 // ST_ROOT
        } else if vn.is_dir {
            2 // ST_USERDIR
        } else {
            -3 // ST_FILE
        };
        mem.write_long(fib + f::DIRENTRYTYPE, entry_type as u32)
            .unwrap();
        mem.write_bstr(fib + f::FILENAME, vn.name.as_bytes()).unwrap();
        mem.write_long(fib + f::PROTECTION, vn.protection).unwrap();
        mem.write_long(fib + f::SIZE_FIELD, vn.data.len() as u32)
            .unwrap();
        mem.write_long(fib + f::DATE_DAYS, 7000).unwrap();
        mem.write_long(fib + f::DATE_MINUTE, 100).unwrap();
        mem.write_long(fib + f::DATE_TICK, 0).unwrap();
        mem.write_bstr(fib + f::COMMENT, b"").unwrap();
    }

    fn reply(&self, mem: &mut Mem, pkt: u32, msg: u32, res1: u32, res2: u32) {
        mem.write_long(pkt + packet::DP_RES1, res1).unwrap();
        mem.write_long(pkt + packet::DP_RES2, res2).unwrap();
        mem.write_byte(msg + node::LN_TYPE, node_type::NT_REPLYMSG)
            .unwrap();
        let reply_port = mem.read_long(pkt + packet::DP_PORT).unwrap();
        add_tail(mem, reply_port + msgport::MP_MSGLIST, msg).unwrap();
    }

    fn arg(mem: &Mem, pkt: u32, n: u32) -> u32 {
        mem.read_long(pkt + packet::DP_ARG1 + 4 * n).unwrap()
    }

    fn handle_packet(&mut self, mem: &mut Mem, pkt: u32, msg: u32) {
        let act = mem.read_long(pkt + packet::DP_TYPE).unwrap() as i32;
        let (res1, res2) = match act {
            action::LOCATE_OBJECT => {
                let base = Self::arg(mem, pkt, 0);
                let name = mem.read_bstr(bptr_to_addr(Self::arg(mem, pkt, 1))).unwrap();
                match self.resolve(base, &name) {
                    Some(idx) => (self.new_lock(idx), 0),
                    None => (0, dos_error::OBJECT_NOT_FOUND),
                }
            }
            action::FREE_LOCK => {
                let lock = Self::arg(mem, pkt, 0);
                self.locks.remove(&lock);
                self.cursors.remove(&lock);
                (DOSTRUE, 0)
            }
            action::COPY_DIR => {
                let lock = Self::arg(mem, pkt, 0);
                match self.locks.get(&lock).copied() {
                    Some(idx) => (self.new_lock(idx), 0),
                    None => (0, dos_error::OBJECT_NOT_FOUND),
                }
            }
            action::PARENT => {
                let lock = Self::arg(mem, pkt, 0);
                match self.locks.get(&lock).copied() {
                    Some(0) => (0, 0), // root has no parent
                    Some(idx) => {
                        let parent = (0..self.volume.len())
                            .find(|&p| self.volume[p].children.contains(&idx))
                            .unwrap_or(0);
                        (self.new_lock(parent), 0)
                    }
                    None => (0, dos_error::OBJECT_NOT_FOUND),
                }
            }
            action::EXAMINE_OBJECT => {
                let lock = Self::arg(mem, pkt, 0);
                let fib = bptr_to_addr(Self::arg(mem, pkt, 1));
                match self.locks.get(&lock).copied() {
                    Some(idx) => {
                        self.write_fib(mem, fib, idx);
                        self.cursors.insert(lock, 0);
                        (DOSTRUE, 0)
                    }
                    None => (0, dos_error::OBJECT_NOT_FOUND),
                }
            }
            action::EXAMINE_NEXT => {
                let lock = Self::arg(mem, pkt, 0);
                let fib = bptr_to_addr(Self::arg(mem, pkt, 1));
                match self.locks.get(&lock).copied() {
                    Some(idx) => {
                        let cursor = self.cursors.get(&lock).copied().unwrap_or(0);
                        if cursor >= self.volume[idx].children.len() {
                            (0, dos_error::NO_MORE_ENTRIES)
                        } else {
                            let child = self.volume[idx].children[cursor];
                            self.cursors.insert(lock, cursor + 1);
                            self.write_fib(mem, fib, child);
                            (DOSTRUE, 0)
                        }
                    }
                    None => (0, dos_error::OBJECT_NOT_FOUND),
                }
            }
            action::FINDINPUT => {
                let fh = bptr_to_addr(Self::arg(mem, pkt, 0));
                let base = Self::arg(mem, pkt, 1);
                let name = mem.read_bstr(bptr_to_addr(Self::arg(mem, pkt, 2))).unwrap();
                match self.resolve(base, &name) {
                    Some(idx) if !self.volume[idx].is_dir => {
                        let arg1 = self.next_arg1;
                        self.next_arg1 += 4;
                        self.files.insert(arg1, (idx, 0));
                        mem.write_long(fh + filehandle::FH_ARG1, arg1).unwrap();
                        (DOSTRUE, 0)
                    }
                    Some(_) => (0, dos_error::OBJECT_WRONG_TYPE),
                    None => (0, dos_error::OBJECT_NOT_FOUND),
                }
            }
            action::READ => {
                let arg1 = Self::arg(mem, pkt, 0);
                let buf = Self::arg(mem, pkt, 1);
                let len = Self::arg(mem, pkt, 2) as usize;
                match self.files.get(&arg1).copied() {
                    Some((idx, pos)) => {
                        let data = &self.volume[idx].data;
                        let n = len.min(data.len().saturating_sub(pos));
                        mem.write_bytes(buf, &data[pos..pos + n]).unwrap();
                        self.files.insert(arg1, (idx, pos + n));
                        (n as u32, 0)
                    }
                    None => (0xFFFF_FFFF, dos_error::OBJECT_NOT_FOUND),
                }
            }
            action::SEEK => {
                if !self.support_seek {
                    (0xFFFF_FFFF, dos_error::ACTION_NOT_KNOWN)
                } else {
                    let arg1 = Self::arg(mem, pkt, 0);
                    let to = Self::arg(mem, pkt, 1) as i32;
                    let mode = Self::arg(mem, pkt, 2) as i32;
                    match self.files.get(&arg1).copied() {
                        Some((idx, pos)) => {
                            let len = self.volume[idx].data.len() as i64;
                            let new = match mode {
                                -1 => i64::from(to),
                                0 => pos as i64 + i64::from(to),
                                _ => len + i64::from(to),
                            };
                            if new < 0 || new > len {
                                (0xFFFF_FFFF, dos_error::SEEK_ERROR)
                            } else {
                                self.files.insert(arg1, (idx, new as usize));
                                (pos as u32, 0)
                            }
                        }
                        None => (0xFFFF_FFFF, dos_error::OBJECT_NOT_FOUND),
                    }
                }
            }
            action::END => {
                let arg1 = Self::arg(mem, pkt, 0);
                self.files.remove(&arg1);
                (DOSTRUE, 0)
            }
            action::IS_FILESYSTEM => (DOSTRUE, 0),
            action::DISK_INFO => {
                let id = bptr_to_addr(Self::arg(mem, pkt, 0));
                mem.write_long(id + infodata::NUM_BLOCKS, 1000).unwrap();
                mem.write_long(id + infodata::NUM_BLOCKS_USED, 250).unwrap();
                mem.write_long(id + infodata::BYTES_PER_BLOCK, 512).unwrap();
                (DOSTRUE, 0)
            }
            _ => (0, dos_error::ACTION_NOT_KNOWN),
        };
        self.reply(mem, pkt, msg, res1, res2);
    }
}

impl CpuCore for ScriptedHandler {
    fn execute(&mut self, mem: &mut Mem, regs: &mut RegFile, _budget: u32) -> Exit {
        regs.cycles += 25;
        loop {
            match std::mem::replace(&mut self.step, Step::Idle) {
                Step::Idle => {
                    let port = Self::own_port(mem);
                    let msg = {
                        let head = list_head(mem, port + msgport::MP_MSGLIST).unwrap();
                        if head != 0 {
                            remove_node(mem, head).unwrap();
                        }
                        head
                    };
                    if msg == 0 {
                        // Nothing queued: wait like a real handler.
                        regs.a[0] = port;
                        return Self::trap(mem, regs, -384); // WaitPort
                    }
                    let pkt = mem.read_long(msg + node::LN_NAME).unwrap();
                    let act = mem.read_long(pkt + packet::DP_TYPE).unwrap() as i32;
                    if act == action::STARTUP {
                        // Register as the device's task, then probe the
                        // disk through the exec I/O path before replying.
                        let dn = bptr_to_addr(Self::arg(mem, pkt, 2));
                        mem.write_long(dn + devicenode::DN_TASK, port).unwrap();
                        let fssm_at = bptr_to_addr(Self::arg(mem, pkt, 1));
                        let env = bptr_to_addr(mem.read_long(fssm_at + fssm::ENVIRON).unwrap());
                        let block_size =
                            mem.read_long(env + amiga::envec::SIZE_BLOCK).unwrap() * 4;
                        assert!(block_size >= 512);

                        mem.fill(SCRATCH, 0x400, 0).unwrap();
                        mem.write_bytes(SCRATCH + 0x100, b"trackdisk.device\0")
                            .unwrap();
                        regs.a[0] = SCRATCH + 0x100;
                        regs.a[1] = SCRATCH;
                        regs.d[0] = 0;
                        regs.d[1] = 0;
                        self.step = Step::StartupOpenDevice { pkt, msg };
                        return Self::trap(mem, regs, -444); // OpenDevice
                    }
                    self.handle_packet(mem, pkt, msg);
                }
                Step::StartupOpenDevice { pkt, msg } => {
                    assert_eq!(regs.d[0], 0, "OpenDevice(trackdisk.device) failed");
                    mem.write_word(SCRATCH + ioreq::IO_COMMAND, td_cmd::CMD_READ)
                        .unwrap();
                    mem.write_long(SCRATCH + ioreq::IO_OFFSET, 0).unwrap();
                    mem.write_long(SCRATCH + ioreq::IO_LENGTH, 512).unwrap();
                    mem.write_long(SCRATCH + ioreq::IO_DATA, SCRATCH + 0x200)
                        .unwrap();
                    regs.a[1] = SCRATCH;
                    self.step = Step::StartupDoIo { pkt, msg };
                    return Self::trap(mem, regs, -456); // DoIO
                }
                Step::StartupDoIo { pkt, msg } => {
                    let ok = regs.d[0] == 0
                        && mem.read_long(SCRATCH + ioreq::IO_ACTUAL).unwrap() == 512;
                    if ok {
                        self.reply(mem, pkt, msg, DOSTRUE, 0);
                    } else {
                        self.reply(mem, pkt, msg, 0, dos_error::NOT_A_DOS_DISK);
                    }
                }
            }
        }
    }
}

/// A core that never answers anything: the boot budget must trip.
struct DeadHandler;

impl CpuCore for DeadHandler {
    fn execute(&mut self, _mem: &mut Mem, regs: &mut RegFile, budget: u32) -> Exit {
        regs.cycles += u64::from(budget);
        Exit::Budget
    }
}

// ---- fixtures ----

fn tiny_driver() -> Vec<u8> {
    let mut out = Vec::new();
    let mut long = |v: u32| out.extend_from_slice(&v.to_be_bytes());
    long(0x3F3); // HUNK_HEADER
    long(0); // no resident names
    long(1);
    long(0);
    long(0);
    long(2); // one hunk of two longwords
    long(0x3E9); // HUNK_CODE
    long(2);
    long(0x4E71_4E71); // NOP; NOP
    long(0x4E75_0000); // RTS
    long(0x3F2); // HUNK_END
    out
}

fn fixture_image() -> (std::fs::File, u64) {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    let mut content = vec![0u8; 64 * 512];
    content[0..4].copy_from_slice(b"PFS\x01");
    f.write_all(&content).unwrap();
    f.flush().unwrap();
    let file = f.reopen().unwrap();
    let len = content.len() as u64;
    std::mem::forget(f);
    (file, len)
}

fn mount_fixture(support_seek: bool) -> (Arc<Bridge>, Arc<InodeCache>) {
    let (image, len) = fixture_image();
    let env = amifuse::rdb::probe(&image, len, None, false).unwrap();
    let cfg = BootConfig::new(tiny_driver(), image, len, env);
    let core = ScriptedHandler::new(fixture_volume(), support_seek);
    let vm = boot(cfg, Box::new(core)).expect("boot should succeed");
    let bridge = Arc::new(Bridge::new(vm));
    let cache = Arc::new(InodeCache::new(bridge.clone()).unwrap());
    (bridge, cache)
}

// ---- scenarios ----

#[test]
fn boots_and_lists_the_root() {
    let (_bridge, cache) = mount_fixture(true);
    assert_eq!(cache.volume_name(), "Work");
    let mut names: Vec<String> = cache
        .readdir(ROOT_INO)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(
        names,
        ["Programs", "System", "data.bin", "empty.txt", "readme.txt"]
    );
}

#[test]
fn empty_file_stats_as_mode_0444() {
    let (_bridge, cache) = mount_fixture(true);
    let entry = cache.lookup(ROOT_INO, "empty.txt").unwrap();
    assert!(!entry.is_dir);
    assert_eq!(entry.size, 0);
    assert_eq!(entry.mode(), 0o444);
}

#[test]
fn reads_whole_file_then_eof() {
    let (_bridge, cache) = mount_fixture(true);
    let entry = cache.lookup(ROOT_INO, "readme.txt").unwrap();
    let fh = cache.open(entry.ino).unwrap();
    let data = cache.read(fh, 0, 4096).unwrap();
    assert_eq!(data, b"Hello Amiga\n");
    let eof = cache.read(fh, 12, 4096).unwrap();
    assert!(eof.is_empty());
    cache.release(fh).unwrap();
}

#[test]
fn host_metadata_needs_zero_packets() {
    let (bridge, cache) = mount_fixture(true);
    let before = bridge.packets_sent();
    let err = cache.lookup(ROOT_INO, ".DS_Store").unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
    assert_eq!(bridge.packets_sent(), before);
}

#[test]
fn missing_name_costs_exactly_one_locate() {
    let (bridge, cache) = mount_fixture(true);
    let before = bridge.packets_sent();
    let err = cache.lookup(ROOT_INO, "NonExistent").unwrap_err();
    match err {
        AmiError::Packet(code) => assert_eq!(code, dos_error::OBJECT_NOT_FOUND as i32),
        other => panic!("expected packet error, got {other:?}"),
    }
    assert_eq!(bridge.packets_sent(), before + 1);
}

#[test]
fn lookup_is_case_insensitive_and_case_preserving() {
    let (_bridge, cache) = mount_fixture(true);
    let entry = cache.lookup(ROOT_INO, "SYSTEM").unwrap();
    assert_eq!(entry.name, "System");
    assert!(entry.is_dir);
    // Nested lookup through the cached directory.
    let child = cache.lookup(entry.ino, "Startup-Sequence").unwrap();
    assert_eq!(child.name, "startup-sequence");
}

#[test]
fn second_readdir_is_served_from_cache() {
    let (bridge, cache) = mount_fixture(true);
    cache.readdir(ROOT_INO).unwrap();
    let after_first = bridge.packets_sent();
    let listing = cache.readdir(ROOT_INO).unwrap();
    assert_eq!(listing.len(), 5);
    assert_eq!(bridge.packets_sent(), after_first);
    // Lookups of listed names are also free now.
    cache.lookup(ROOT_INO, "readme.txt").unwrap();
    assert_eq!(bridge.packets_sent(), after_first);
}

#[test]
fn random_reads_with_seek_support() {
    let (_bridge, cache) = mount_fixture(true);
    let entry = cache.lookup(ROOT_INO, "data.bin").unwrap();
    let fh = cache.open(entry.ino).unwrap();
    let at = 40_000u64;
    let data = cache.read(fh, at, 256).unwrap();
    let expect: Vec<u8> = (at..at + 256).map(|i| (i % 251) as u8).collect();
    assert_eq!(data, expect);
    // Backwards too.
    let data = cache.read(fh, 100, 16).unwrap();
    let expect: Vec<u8> = (100u64..116).map(|i| (i % 251) as u8).collect();
    assert_eq!(data, expect);
    cache.release(fh).unwrap();
}

#[test]
fn random_reads_without_seek_are_linearized() {
    let (_bridge, cache) = mount_fixture(false);
    let entry = cache.lookup(ROOT_INO, "data.bin").unwrap();
    let fh = cache.open(entry.ino).unwrap();
    let at = 50_000u64;
    let data = cache.read(fh, at, 128).unwrap();
    let expect: Vec<u8> = (at..at + 128).map(|i| (i % 251) as u8).collect();
    assert_eq!(data, expect);
    let data = cache.read(fh, 10, 8).unwrap();
    let expect: Vec<u8> = (10u64..18).map(|i| (i % 251) as u8).collect();
    assert_eq!(data, expect);
    cache.release(fh).unwrap();
}

#[test]
fn statfs_comes_from_disk_info() {
    let (_bridge, cache) = mount_fixture(true);
    let info = cache.statfs().unwrap();
    assert_eq!(info.total_blocks, 1000);
    assert_eq!(info.used_blocks, 250);
    assert_eq!(info.block_size, 512);
}

#[test]
fn packets_are_conserved_at_quiescence() {
    let (bridge, cache) = mount_fixture(true);
    cache.readdir(ROOT_INO).unwrap();
    let entry = cache.lookup(ROOT_INO, "readme.txt").unwrap();
    let fh = cache.open(entry.ino).unwrap();
    cache.read(fh, 0, 64).unwrap();
    cache.release(fh).unwrap();
    bridge
        .with_vm(|vm| {
            assert_eq!(vm.packets_live(), 0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn bridge_lock_primitives_round_trip() {
    let (bridge, _cache) = mount_fixture(true);
    bridge
        .with_vm(|vm| {
            let root = vm.root_lock;
            let dup = vm.dup_lock(root)?;
            assert_ne!(dup, 0);
            assert_ne!(dup, root);
            let sys = vm.locate("System")?;
            let parent = vm.parent(sys)?;
            assert_ne!(parent, 0);
            vm.free_lock(parent)?;
            vm.free_lock(sys)?;
            vm.free_lock(dup)?;
            // Root's parent is "no lock" with no error.
            assert_eq!(vm.parent(root)?, 0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn handle_lru_survives_many_open_files() {
    let (_bridge, cache) = mount_fixture(true);
    // Open the same small set repeatedly to push past the guest LRU cap.
    let readme = cache.lookup(ROOT_INO, "readme.txt").unwrap();
    let mut handles = Vec::new();
    for _ in 0..12 {
        handles.push(cache.open(readme.ino).unwrap());
    }
    // Every handle must still read correctly, evicted or not.
    for &fh in &handles {
        let data = cache.read(fh, 0, 64).unwrap();
        assert_eq!(data, b"Hello Amiga\n");
    }
    for fh in handles {
        cache.release(fh).unwrap();
    }
}

#[test]
fn dead_handler_fails_boot_within_budget() {
    let (image, len) = fixture_image();
    let env = amifuse::rdb::probe(&image, len, None, false).unwrap();
    let cfg = BootConfig::new(tiny_driver(), image, len, env);
    match boot(cfg, Box::new(DeadHandler)) {
        Err(AmiError::HandlerBoot(_)) => {}
        other => panic!("expected HandlerBoot, got {other:?}"),
    }
}

#[test]
fn corrupt_driver_fails_as_handler_load() {
    let (image, len) = fixture_image();
    let env = amifuse::rdb::probe(&image, len, None, false).unwrap();
    let mut driver = tiny_driver();
    driver[0] = 0x12; // clobber the hunk magic
    let cfg = BootConfig::new(driver, image, len, env);
    match boot(cfg, Box::new(ScriptedHandler::new(fixture_volume(), true))) {
        Err(AmiError::HandlerLoad(_)) => {}
        other => panic!("expected HandlerLoad, got {other:?}"),
    }
}

#[test]
fn shutdown_releases_everything() {
    let (bridge, cache) = mount_fixture(true);
    let entry = cache.lookup(ROOT_INO, "readme.txt").unwrap();
    let _fh = cache.open(entry.ino).unwrap();
    cache.shutdown();
    bridge
        .with_vm(|vm| {
            assert_eq!(vm.root_lock, 0);
            assert_eq!(vm.packets_live(), 0);
            Ok(())
        })
        .unwrap();
}
