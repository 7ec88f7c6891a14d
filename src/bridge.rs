//! The AmigaDOS packet bridge.
//!
//! Synchronous RPC against the running handler: build a DosPacket in guest
//! RAM, enqueue it on the handler's port, drive the CPU in bounded slices
//! until the reply lands on the bridge's reply port, decode the result
//! longs. A single CPU lock serializes everything; FUSE threads queue on
//! the mutex around [`HandlerVm`].

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::amiga::{
    DOSFALSE, action, dos_error, filehandle, infodata, lock_mode, message, msgport, node, packet,
    seek_mode,
};
use crate::cpu::{Exit, Machine};
use crate::device::Trackdisk;
use crate::error::{AmiError, Result};
use crate::exec::{Kernel, TrapResult, list_head, remove_node};
use crate::mem::addr_to_bptr;

/// Instructions per driver-loop slice.
pub const SLICE: u32 = 10_000;

/// Cycle budget for a single packet round-trip.
pub const PACKET_BUDGET: u64 = 100_000_000;

/// Wall-clock ceiling for a single packet round-trip.
pub const PACKET_WALL: Duration = Duration::from_secs(10);

/// AmigaDOS path components longer than this cannot exist on any volume.
const MAX_NAME: usize = 107;

/// Why the driver loop stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveExit {
    /// The handler blocked with no deliverable signal.
    Idle,
    /// The handler's entry function returned.
    Exited,
}

/// Decoded FileInfoBlock contents.
#[derive(Debug, Clone)]
pub struct FibData {
    pub name: String,
    pub is_dir: bool,
    pub size: u32,
    pub protection: u32,
    pub days: u32,
    pub minute: u32,
    pub tick: u32,
    pub comment: String,
    pub disk_key: u32,
}

/// An open file on the handler side.
#[derive(Debug, Clone, Copy)]
pub struct FileToken {
    /// Guest address of the FileHandle structure we allocated.
    pub fh: u32,
    /// The handler's fh_Arg1 cookie, used by READ/SEEK/END.
    pub arg1: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeInfo {
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub block_size: u32,
}

/// The emulated machine plus everything needed to converse with the
/// handler. Exactly one exists per mount, owned by [`Bridge`]'s mutex.
pub struct HandlerVm {
    pub machine: Machine,
    pub kernel: Kernel,
    pub disk: Trackdisk,
    pub reply_port: u32,
    pub handler_port: u32,
    pub root_lock: u32,
    /// Pooled DosPacket+Message pairs.
    pkt_pool: Vec<(u32, u32)>,
    pkt_live: u32,
    pub packets_sent: u64,
}

impl HandlerVm {
    pub fn new(machine: Machine, kernel: Kernel, disk: Trackdisk, reply_port: u32) -> Self {
        Self {
            machine,
            kernel,
            disk,
            reply_port,
            handler_port: 0,
            root_lock: 0,
            pkt_pool: Vec::new(),
            pkt_live: 0,
            packets_sent: 0,
        }
    }

    /// Run the CPU until the handler blocks, exits, or the budget runs out.
    pub fn drive(&mut self, budget: u64, deadline: Option<Instant>) -> Result<DriveExit> {
        let start = self.machine.cycles();
        loop {
            match self.machine.run_slice(SLICE) {
                Exit::ALineTrap { opcode } => {
                    let m = &mut self.machine;
                    match self
                        .kernel
                        .dispatch(&mut m.mem, &mut m.regs, &mut self.disk, opcode)?
                    {
                        TrapResult::Continue => {}
                        TrapResult::Blocked => {
                            if self.kernel.handler_runnable(&self.machine.mem)? {
                                continue; // a wanted signal is already up
                            }
                            return Ok(DriveExit::Idle);
                        }
                        TrapResult::HandlerExit => return Ok(DriveExit::Exited),
                    }
                }
                Exit::Budget => {
                    if self.machine.cycles() - start >= budget {
                        return Err(AmiError::PacketTimeout);
                    }
                    if let Some(d) = deadline {
                        if Instant::now() > d {
                            return Err(AmiError::PacketTimeout);
                        }
                    }
                }
                Exit::BusError { addr, pc } => {
                    return Err(AmiError::Bus { addr, pc });
                }
                Exit::Illegal { opcode, pc } => {
                    return Err(AmiError::Protocol(format!(
                        "handler hit unimplemented opcode {opcode:#06x} at {pc:#010x}"
                    )));
                }
                Exit::Stopped => {
                    return Err(AmiError::Protocol("handler stopped the CPU".into()));
                }
            }
        }
    }

    fn get_packet(&mut self) -> Result<(u32, u32)> {
        self.pkt_live += 1;
        if let Some(pair) = self.pkt_pool.pop() {
            return Ok(pair);
        }
        let pkt = self.alloc(packet::SIZE)?;
        let msg = self.alloc(message::SIZE)?;
        Ok((pkt, msg))
    }

    fn put_packet(&mut self, pair: (u32, u32)) {
        self.pkt_live = self.pkt_live.saturating_sub(1);
        self.pkt_pool.push(pair);
    }

    /// Packets currently outstanding; zero at quiescence.
    pub fn packets_live(&self) -> u32 {
        self.pkt_live
    }

    fn alloc(&mut self, size: u32) -> Result<u32> {
        self.kernel
            .heap
            .alloc(size, 4)
            .ok_or_else(|| AmiError::Protocol(format!("guest heap exhausted ({size} bytes)")))
    }

    fn free(&mut self, addr: u32, size: u32) {
        self.kernel.heap.free(addr, size);
    }

    /// Marshal a BSTR into the heap; returns (address, allocation size).
    fn alloc_bstr(&mut self, s: &[u8]) -> Result<(u32, u32)> {
        let size = s.len() as u32 + 1;
        let addr = self.alloc(size)?;
        self.machine.mem.write_bstr(addr, s)?;
        Ok((addr, size))
    }

    /// Build a packet, post it to the handler port and drive until the
    /// matching reply arrives. Returns (res1, res2).
    pub fn sync_packet(&mut self, act: i32, args: &[u32]) -> Result<(u32, u32)> {
        let port = self.handler_port;
        if port == 0 {
            return Err(AmiError::Protocol("no handler port".into()));
        }
        self.sync_packet_to(port, act, args)
    }

    pub fn sync_packet_to(&mut self, port: u32, act: i32, args: &[u32]) -> Result<(u32, u32)> {
        debug_assert!(args.len() <= 7);
        let (pkt, msg) = self.get_packet()?;
        let mem = &mut self.machine.mem;
        mem.fill(pkt, packet::SIZE, 0)?;
        mem.fill(msg, message::SIZE, 0)?;
        mem.write_long(pkt + packet::DP_LINK, msg)?;
        mem.write_long(pkt + packet::DP_PORT, self.reply_port)?;
        mem.write_long(pkt + packet::DP_TYPE, act as u32)?;
        for (i, v) in args.iter().enumerate() {
            mem.write_long(pkt + packet::DP_ARG1 + 4 * i as u32, *v)?;
        }
        mem.write_long(msg + node::LN_NAME, pkt)?;
        mem.write_long(msg + message::MN_REPLYPORT, self.reply_port)?;

        self.kernel.put_msg(&mut self.machine.mem, port, msg)?;
        self.packets_sent += 1;
        trace!("packet {act} sent ({} args)", args.len());

        let deadline = Instant::now() + PACKET_WALL;
        let result = loop {
            if self.take_reply(msg, pkt)? {
                let mem = &self.machine.mem;
                let res1 = mem.read_long(pkt + packet::DP_RES1)?;
                let res2 = mem.read_long(pkt + packet::DP_RES2)?;
                break Ok((res1, res2));
            }
            match self.drive(PACKET_BUDGET, Some(deadline)) {
                Ok(DriveExit::Idle) => {
                    if !self.has_reply()? {
                        break Err(AmiError::Protocol(
                            "handler went idle without replying to the packet".into(),
                        ));
                    }
                    // The reply is queued; the next loop turn consumes it.
                }
                Ok(DriveExit::Exited) => {
                    break Err(AmiError::Protocol(
                        "handler exited while a packet was in flight".into(),
                    ));
                }
                Err(e) => break Err(e),
            }
        };
        self.put_packet((pkt, msg));
        result
    }

    fn has_reply(&self) -> Result<bool> {
        Ok(list_head(&self.machine.mem, self.reply_port + msgport::MP_MSGLIST)? != 0)
    }

    /// Look for our reply on the reply port; on a hit, dequeue it. A foreign
    /// message on the reply port is a protocol violation.
    fn take_reply(&mut self, msg: u32, pkt: u32) -> Result<bool> {
        let mem = &mut self.machine.mem;
        let head = list_head(mem, self.reply_port + msgport::MP_MSGLIST)?;
        if head == 0 {
            return Ok(false);
        }
        let named = mem.read_long(head + node::LN_NAME)?;
        if head != msg && named != pkt {
            return Err(AmiError::Protocol(format!(
                "unmatched reply message {head:#x} on the bridge reply port"
            )));
        }
        remove_node(mem, head)?;
        Ok(true)
    }

    // ---- higher-level packet operations ----

    /// Validate and marshal a root-relative Amiga path for LOCATE-class
    /// packets. Over-long components are rejected without a round-trip.
    fn check_path(path: &str) -> Result<()> {
        for comp in path.split('/') {
            if comp.len() > MAX_NAME {
                return Err(AmiError::Packet(dos_error::OBJECT_NOT_FOUND as i32));
            }
        }
        Ok(())
    }

    /// Acquire a shared lock on a path relative to the volume root.
    pub fn locate(&mut self, path: &str) -> Result<u32> {
        Self::check_path(path)?;
        let (name, nsize) = self.alloc_bstr(path.as_bytes())?;
        let r = self.sync_packet(
            action::LOCATE_OBJECT,
            &[self.root_lock, addr_to_bptr(name), lock_mode::SHARED],
        );
        self.free(name, nsize);
        let (res1, res2) = r?;
        if res1 == 0 {
            return Err(AmiError::Packet(res2 as i32));
        }
        Ok(res1)
    }

    pub fn free_lock(&mut self, lock: u32) -> Result<()> {
        if lock == 0 {
            return Ok(());
        }
        self.sync_packet(action::FREE_LOCK, &[lock])?;
        Ok(())
    }

    pub fn dup_lock(&mut self, lock: u32) -> Result<u32> {
        let (res1, res2) = self.sync_packet(action::COPY_DIR, &[lock])?;
        if res1 == 0 {
            return Err(AmiError::Packet(res2 as i32));
        }
        Ok(res1)
    }

    pub fn parent(&mut self, lock: u32) -> Result<u32> {
        let (res1, _res2) = self.sync_packet(action::PARENT, &[lock])?;
        Ok(res1) // 0 with no error means "already the root"
    }

    pub fn examine(&mut self, lock: u32) -> Result<FibData> {
        let fib = self.alloc(crate::amiga::fib::SIZE)?;
        self.machine.mem.fill(fib, crate::amiga::fib::SIZE, 0)?;
        let r = self.sync_packet(action::EXAMINE_OBJECT, &[lock, addr_to_bptr(fib)]);
        let out = match r {
            Ok((res1, _)) if res1 != 0 => self.parse_fib(fib),
            Ok((_, res2)) => Err(AmiError::Packet(res2 as i32)),
            Err(e) => Err(e),
        };
        self.free(fib, crate::amiga::fib::SIZE);
        out
    }

    /// Full directory enumeration: EXAMINE_OBJECT then EXAMINE_NEXT until
    /// ERROR_NO_MORE_ENTRIES. The FileInfoBlock persists across the whole
    /// iteration; the handler keeps its cursor inside it.
    pub fn read_dir(&mut self, lock: u32) -> Result<Vec<FibData>> {
        let fib = self.alloc(crate::amiga::fib::SIZE)?;
        self.machine.mem.fill(fib, crate::amiga::fib::SIZE, 0)?;
        let out = self.read_dir_inner(lock, fib);
        self.free(fib, crate::amiga::fib::SIZE);
        out
    }

    fn read_dir_inner(&mut self, lock: u32, fib: u32) -> Result<Vec<FibData>> {
        let (res1, res2) = self.sync_packet(action::EXAMINE_OBJECT, &[lock, addr_to_bptr(fib)])?;
        if res1 == 0 {
            return Err(AmiError::Packet(res2 as i32));
        }
        let own = self.parse_fib(fib)?;
        if !own.is_dir {
            return Err(AmiError::Packet(dos_error::OBJECT_WRONG_TYPE as i32));
        }
        let mut entries = Vec::new();
        loop {
            let (res1, res2) = self.sync_packet(action::EXAMINE_NEXT, &[lock, addr_to_bptr(fib)])?;
            if res1 == 0 {
                if res2 == dos_error::NO_MORE_ENTRIES {
                    break; // end of listing, not an error
                }
                return Err(AmiError::Packet(res2 as i32));
            }
            entries.push(self.parse_fib(fib)?);
        }
        Ok(entries)
    }

    /// ACTION_FINDINPUT: open a file for reading.
    pub fn open_input(&mut self, path: &str) -> Result<FileToken> {
        Self::check_path(path)?;
        let fh = self.alloc(filehandle::SIZE)?;
        self.machine.mem.fill(fh, filehandle::SIZE, 0)?;
        self.machine
            .mem
            .write_long(fh + filehandle::FH_TYPE, self.handler_port)?;
        let (name, nsize) = self.alloc_bstr(path.as_bytes())?;
        let r = self.sync_packet(
            action::FINDINPUT,
            &[addr_to_bptr(fh), self.root_lock, addr_to_bptr(name)],
        );
        self.free(name, nsize);
        match r {
            Ok((res1, _)) if res1 != 0 => {
                let arg1 = self.machine.mem.read_long(fh + filehandle::FH_ARG1)?;
                Ok(FileToken { fh, arg1 })
            }
            Ok((_, res2)) => {
                self.free(fh, filehandle::SIZE);
                Err(AmiError::Packet(res2 as i32))
            }
            Err(e) => {
                self.free(fh, filehandle::SIZE);
                Err(e)
            }
        }
    }

    /// ACTION_READ into a host buffer. An empty result is end-of-file.
    pub fn read(&mut self, token: &FileToken, len: u32) -> Result<Vec<u8>> {
        let buf = self.alloc(len.max(4))?;
        let r = self.sync_packet(action::READ, &[token.arg1, buf, len]);
        let out = match r {
            Ok((res1, res2)) => {
                if res1 == 0xFFFF_FFFF {
                    Err(AmiError::Packet(res2 as i32))
                } else {
                    let n = res1.min(len);
                    Ok(self.machine.mem.read_bytes(buf, n)?.to_vec())
                }
            }
            Err(e) => Err(e),
        };
        self.free(buf, len.max(4));
        out
    }

    /// ACTION_SEEK from the beginning. `Ok(None)` means the handler does
    /// not implement SEEK and callers must linearize.
    pub fn seek(&mut self, token: &FileToken, pos: u32) -> Result<Option<u32>> {
        let (res1, res2) =
            self.sync_packet(action::SEEK, &[token.arg1, pos, seek_mode::BEGINNING as u32])?;
        if res1 == 0xFFFF_FFFF {
            if res2 == dos_error::ACTION_NOT_KNOWN {
                return Ok(None);
            }
            return Err(AmiError::Packet(res2 as i32));
        }
        Ok(Some(res1))
    }

    /// ACTION_END: close a handle and release its FileHandle allocation.
    pub fn close(&mut self, token: FileToken) -> Result<()> {
        let r = self.sync_packet(action::END, &[token.arg1]);
        self.free(token.fh, filehandle::SIZE);
        r.map(|_| ())
    }

    pub fn is_filesystem(&mut self) -> Result<bool> {
        let (res1, _) = self.sync_packet(action::IS_FILESYSTEM, &[])?;
        Ok(res1 != DOSFALSE)
    }

    /// ACTION_DISK_INFO; falls back to device geometry when unsupported.
    pub fn volume_info(&mut self) -> Result<VolumeInfo> {
        let id = self.alloc(infodata::SIZE)?;
        self.machine.mem.fill(id, infodata::SIZE, 0)?;
        let r = self.sync_packet(action::DISK_INFO, &[addr_to_bptr(id)]);
        let out = match r {
            Ok((res1, _)) if res1 != 0 => {
                let mem = &self.machine.mem;
                Ok(VolumeInfo {
                    total_blocks: u64::from(mem.read_long(id + infodata::NUM_BLOCKS)?),
                    used_blocks: u64::from(mem.read_long(id + infodata::NUM_BLOCKS_USED)?),
                    block_size: mem.read_long(id + infodata::BYTES_PER_BLOCK)?,
                })
            }
            _ => {
                debug!("DISK_INFO unsupported; using device geometry");
                Ok(VolumeInfo {
                    total_blocks: self.disk.total_blocks(),
                    used_blocks: self.disk.total_blocks(),
                    block_size: self.disk.block_size(),
                })
            }
        };
        self.free(id, infodata::SIZE);
        out
    }

    fn parse_fib(&self, fib: u32) -> Result<FibData> {
        use crate::amiga::fib as f;
        let mem = &self.machine.mem;
        // Handlers fill fib_FileName BCPL-style: length byte then chars.
        let name = mem.read_bstr(fib + f::FILENAME)?;
        let comment = mem.read_bstr(fib + f::COMMENT)?;
        let entry_type = mem.read_long(fib + f::DIRENTRYTYPE)? as i32;
        Ok(FibData {
            name: String::from_utf8_lossy(&name).into_owned(),
            is_dir: entry_type >= 0,
            size: mem.read_long(fib + f::SIZE_FIELD)?,
            protection: mem.read_long(fib + f::PROTECTION)?,
            days: mem.read_long(fib + f::DATE_DAYS)?,
            minute: mem.read_long(fib + f::DATE_MINUTE)?,
            tick: mem.read_long(fib + f::DATE_TICK)?,
            comment: String::from_utf8_lossy(&comment).into_owned(),
            disk_key: mem.read_long(fib + f::DISKKEY)?,
        })
    }

    /// Release the root lock and stop the machine. Open handles are closed
    /// by the cache before this runs.
    pub fn shutdown(&mut self) {
        if self.root_lock != 0 {
            let lock = self.root_lock;
            self.root_lock = 0;
            if let Err(e) = self.free_lock(lock) {
                warn!("releasing root lock failed: {e}");
            }
        }
        debug!(
            "machine halted after {} cycles, {} packets",
            self.machine.cycles(),
            self.packets_sent
        );
    }
}

/// Thread-safe facade: the CPU lock of the concurrency model. Every FUSE
/// thread serializes here; packet calls never nest.
pub struct Bridge {
    vm: Mutex<HandlerVm>,
}

impl Bridge {
    pub fn new(vm: HandlerVm) -> Self {
        Self { vm: Mutex::new(vm) }
    }

    /// Run `f` holding the CPU lock.
    pub fn with_vm<T>(&self, f: impl FnOnce(&mut HandlerVm) -> Result<T>) -> Result<T> {
        let mut vm = self.vm.lock().map_err(|_| {
            AmiError::Protocol("CPU lock poisoned by a panicked FUSE thread".into())
        })?;
        f(&mut vm)
    }

    pub fn packets_sent(&self) -> u64 {
        self.vm.lock().map(|vm| vm.packets_sent).unwrap_or(0)
    }

    pub fn block_size(&self) -> u32 {
        self.vm.lock().map(|vm| vm.disk.block_size()).unwrap_or(512)
    }
}

/// Drive-loop helper shared by startup and reply waits during boot, where
/// the packet machinery is not available yet.
pub fn wait_reply(
    vm: &mut HandlerVm,
    msg: u32,
    pkt: u32,
    budget: u64,
    deadline: Instant,
) -> Result<(u32, u32)> {
    loop {
        let mem = &mut vm.machine.mem;
        let head = list_head(mem, vm.reply_port + msgport::MP_MSGLIST)?;
        if head != 0 {
            let named = mem.read_long(head + node::LN_NAME)?;
            if head == msg || named == pkt {
                remove_node(mem, head)?;
                let res1 = mem.read_long(pkt + packet::DP_RES1)?;
                let res2 = mem.read_long(pkt + packet::DP_RES2)?;
                return Ok((res1, res2));
            }
            return Err(AmiError::Protocol(format!(
                "unexpected message {head:#x} on the reply port during boot"
            )));
        }
        match vm.drive(budget, Some(deadline))? {
            DriveExit::Idle => {
                // Check once more; if the port is still empty the handler
                // is stuck waiting on something we will never deliver.
                let mem = &vm.machine.mem;
                if list_head(mem, vm.reply_port + msgport::MP_MSGLIST)? == 0 {
                    return Err(AmiError::HandlerBoot(
                        "handler blocked without answering the startup packet".into(),
                    ));
                }
            }
            DriveExit::Exited => {
                return Err(AmiError::HandlerBoot(
                    "handler exited before answering the startup packet".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_component_length_cap() {
        assert!(HandlerVm::check_path("Dir/File").is_ok());
        let long = "x".repeat(108);
        match HandlerVm::check_path(&long) {
            Err(AmiError::Packet(code)) => {
                assert_eq!(code, dos_error::OBJECT_NOT_FOUND as i32)
            }
            other => panic!("expected packet error, got {other:?}"),
        }
        // 107 exactly is allowed.
        assert!(HandlerVm::check_path(&"y".repeat(107)).is_ok());
    }
}
