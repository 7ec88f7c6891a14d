//! The virtual Exec kernel.
//!
//! Implements the subset of exec.library (plus slivers of dos.library and
//! utility.library) that filesystem handlers actually call. Library bases
//! live in guest RAM with A-line trap opcodes in their jump tables; the
//! bridge's driver loop feeds each trap into [`Kernel::dispatch`], which
//! performs the call host-side and resumes the CPU.
//!
//! All Exec objects (ports, messages, tasks) are plain big-endian structures
//! in guest RAM; their mutual references are guest addresses, never host
//! pointers. The kernel only keeps host-side bookkeeping: the trap table,
//! the named-port registry and the startup rendezvous state.

pub mod lvo;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};

pub use lvo::{Lib, Vector, vector_for};

use crate::amiga::{
    ABS_EXEC_BASE, AMIGA_EPOCH_OFFSET, EXECBASE_THISTASK, TICKS_PER_SECOND, io_error, ioreq, list,
    memf, msgport, node, node_type, process, task,
};
use crate::cpu::RegFile;
use crate::device::{Trackdisk, service_null};
use crate::error::{AmiError, Result};
use crate::mem::{Arena, Mem};

/// Guest RAM layout: kernel objects, handler segments, dynamic heap.
pub const KERNEL_BASE: u32 = 0x0000_1000;
pub const KERNEL_LIMIT: u32 = 0x0004_0000;
pub const SEG_BASE: u32 = KERNEL_LIMIT;
pub const SEG_LIMIT: u32 = 0x0040_0000;
pub const HEAP_BASE: u32 = SEG_LIMIT;

/// The A-line opcode planted at the address a handler returns to when its
/// entry function falls off the end.
pub const EXIT_OPCODE: u16 = 0xAFFF;

/// Outcome of dispatching one trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapResult {
    /// Call complete; the CPU resumes after the trap.
    Continue,
    /// The handler blocked in Wait/WaitPort with nothing deliverable. The
    /// PC still points at the trap, so delivering a message and re-running
    /// the CPU re-evaluates the call.
    Blocked,
    /// The handler's entry function returned.
    HandlerExit,
}

pub struct Kernel {
    pub exec_base: u32,
    pub dos_base: u32,
    pub utility_base: u32,
    pub exit_stub: u32,
    pub kernel_arena: Arena,
    pub seg_arena: Arena,
    pub heap: Arena,
    traps: HashMap<u16, (Lib, i32)>,
    named_ports: HashMap<Vec<u8>, u32>,
    trackdisk_base: u32,
    null_base: u32,
    /// The handler's Process structure.
    pub handler_task: u32,
    /// Startup message awaiting the rendezvous of the handler's first port.
    startup: Option<u32>,
    /// The port the startup packet was delivered to.
    pub provisional_port: Option<u32>,
    next_sigbit: u8,
}

impl Kernel {
    pub fn new(mem: &mut Mem) -> Result<Kernel> {
        let mut kernel = Kernel {
            exec_base: 0,
            dos_base: 0,
            utility_base: 0,
            exit_stub: 0,
            kernel_arena: Arena::new(KERNEL_BASE, KERNEL_LIMIT),
            seg_arena: Arena::new(SEG_BASE, SEG_LIMIT),
            heap: Arena::new(HEAP_BASE, mem.size()),
            traps: HashMap::new(),
            named_ports: HashMap::new(),
            trackdisk_base: 0,
            null_base: 0,
            handler_task: 0,
            startup: None,
            provisional_port: None,
            next_sigbit: 16,
        };
        let mut next_trap: u16 = 0;
        kernel.exec_base = kernel.build_library(mem, Lib::Exec, 0x120, &mut next_trap)?;
        kernel.dos_base = kernel.build_library(mem, Lib::Dos, 70, &mut next_trap)?;
        kernel.utility_base = kernel.build_library(mem, Lib::Utility, 36, &mut next_trap)?;
        mem.write_long(ABS_EXEC_BASE, kernel.exec_base)?;

        let stub = kernel.alloc_kernel(4)?;
        mem.write_word(stub, EXIT_OPCODE)?;
        kernel.exit_stub = stub;

        // Device bases only tag io_Device so DoIO can route requests.
        kernel.trackdisk_base = kernel.alloc_kernel(36)?;
        kernel.null_base = kernel.alloc_kernel(36)?;
        debug!(
            "kernel ready: exec {:#x}, dos {:#x}, utility {:#x}, {} traps",
            kernel.exec_base,
            kernel.dos_base,
            kernel.utility_base,
            kernel.traps.len()
        );
        Ok(kernel)
    }

    fn alloc_kernel(&mut self, size: u32) -> Result<u32> {
        self.kernel_arena
            .alloc(size, 4)
            .ok_or_else(|| AmiError::Protocol("kernel arena exhausted".into()))
    }

    fn build_library(
        &mut self,
        mem: &mut Mem,
        lib: Lib,
        positive_size: u32,
        next_trap: &mut u16,
    ) -> Result<u32> {
        let span = lib.lvo_span();
        let block = self.alloc_kernel(span + positive_size)?;
        let base = block + span;
        let mut offset = 6i32;
        while offset <= span as i32 {
            let opcode = 0xA000 | *next_trap;
            *next_trap += 1;
            let at = base - offset as u32;
            mem.write_word(at, opcode)?;
            mem.write_word(at + 2, 0x4E75)?; // RTS
            self.traps.insert(opcode, (lib, -offset));
            offset += 6;
        }
        mem.write_word(base + 20, 40)?; // lib_Version
        Ok(base)
    }

    /// Allocate the handler's Process: task node, stack and the embedded
    /// pr_MsgPort, registered as ThisTask.
    pub fn create_process(&mut self, mem: &mut Mem, name: &str, stack_size: u32) -> Result<u32> {
        let proc = self.alloc_kernel(process::SIZE)?;
        mem.fill(proc, process::SIZE, 0)?;
        mem.write_byte(proc + node::LN_TYPE, node_type::NT_PROCESS)?;
        let name_buf = self.alloc_kernel(name.len() as u32 + 1)?;
        mem.write_bytes(name_buf, name.as_bytes())?;
        mem.write_byte(name_buf + name.len() as u32, 0)?;
        mem.write_long(proc + node::LN_NAME, name_buf)?;

        let stack = self.alloc_kernel(stack_size)?;
        mem.write_long(proc + task::TC_SPLOWER, stack)?;
        mem.write_long(proc + task::TC_SPUPPER, stack + stack_size)?;
        mem.write_long(proc + task::TC_SPREG, stack + stack_size)?;
        mem.write_long(proc + task::TC_SIGALLOC, 0x0000_FFFF)?;

        let port = proc + process::PR_MSGPORT;
        mem.write_byte(port + node::LN_TYPE, node_type::NT_MSGPORT)?;
        mem.write_byte(port + msgport::MP_SIGBIT, 8)?;
        mem.write_long(port + msgport::MP_SIGTASK, proc)?;
        new_list(mem, port + msgport::MP_MSGLIST)?;

        mem.write_long(proc + process::PR_STACKSIZE, stack_size)?;
        mem.write_long(self.exec_base + EXECBASE_THISTASK, proc)?;
        self.handler_task = proc;
        Ok(proc)
    }

    /// A host-owned reply port: no signal task, polled by the driver loop.
    pub fn create_host_port(&mut self, mem: &mut Mem) -> Result<u32> {
        let port = self.alloc_kernel(msgport::SIZE)?;
        mem.fill(port, msgport::SIZE, 0)?;
        mem.write_byte(port + node::LN_TYPE, node_type::NT_MSGPORT)?;
        new_list(mem, port + msgport::MP_MSGLIST)?;
        Ok(port)
    }

    /// Park the startup message until the handler reveals its packet port.
    pub fn stage_startup(&mut self, msg: u32) {
        self.startup = Some(msg);
    }

    pub fn startup_pending(&self) -> bool {
        self.startup.is_some()
    }

    fn deliver_startup(&mut self, mem: &mut Mem, port: u32) -> Result<()> {
        if let Some(msg) = self.startup.take() {
            debug!("startup packet rendezvous: delivering to port {port:#x}");
            self.put_msg(mem, port, msg)?;
            self.provisional_port = Some(port);
        }
        Ok(())
    }

    /// Enqueue a message and raise the owning task's signal.
    pub fn put_msg(&mut self, mem: &mut Mem, port: u32, msg: u32) -> Result<()> {
        mem.write_byte(msg + node::LN_TYPE, node_type::NT_MESSAGE)?;
        add_tail(mem, port + msgport::MP_MSGLIST, msg)?;
        let sig_task = mem.read_long(port + msgport::MP_SIGTASK)?;
        if sig_task != 0 {
            let bit = mem.read_byte(port + msgport::MP_SIGBIT)?;
            let recvd = mem.read_long(sig_task + task::TC_SIGRECVD)?;
            mem.write_long(sig_task + task::TC_SIGRECVD, recvd | 1 << bit)?;
        }
        Ok(())
    }

    /// True when the handler task has a wanted signal pending, i.e. a
    /// blocked Wait/WaitPort would now complete.
    pub fn handler_runnable(&self, mem: &Mem) -> Result<bool> {
        if self.handler_task == 0 {
            return Ok(false);
        }
        let recvd = mem.read_long(self.handler_task + task::TC_SIGRECVD)?;
        let wait = mem.read_long(self.handler_task + task::TC_SIGWAIT)?;
        Ok(recvd & wait != 0)
    }

    pub fn trackdisk_base(&self) -> u32 {
        self.trackdisk_base
    }

    /// Dispatch one A-line trap.
    pub fn dispatch(
        &mut self,
        mem: &mut Mem,
        regs: &mut RegFile,
        disk: &mut Trackdisk,
        opcode: u16,
    ) -> Result<TrapResult> {
        if opcode == EXIT_OPCODE {
            return Ok(TrapResult::HandlerExit);
        }
        let &(lib, offset) = self.traps.get(&opcode).ok_or_else(|| {
            AmiError::Protocol(format!(
                "A-line opcode {opcode:#06x} at pc {:#010x} maps to no library vector",
                regs.pc
            ))
        })?;
        let vector = vector_for(lib, offset).ok_or_else(|| {
            AmiError::Protocol(format!("handler called unimplemented {lib:?} vector {offset}"))
        })?;
        trace!("trap {vector:?} (pc {:#010x})", regs.pc);
        let out = self.call(vector, mem, regs, disk)?;
        if out == TrapResult::Continue {
            regs.pc = regs.pc.wrapping_add(2);
        }
        Ok(out)
    }

    fn call(
        &mut self,
        vector: Vector,
        mem: &mut Mem,
        regs: &mut RegFile,
        disk: &mut Trackdisk,
    ) -> Result<TrapResult> {
        use Vector::*;
        match vector {
            Disable | Enable | Forbid | Permit | CacheClearU | InitSemaphore
            | ObtainSemaphore | ReleaseSemaphore => {}
            AttemptSemaphore => regs.d[0] = 1,

            AllocMem => {
                let size = regs.d[0];
                let flags = regs.d[1];
                regs.d[0] = match self.heap.alloc(size, 4) {
                    Some(addr) => {
                        if flags & memf::CLEAR != 0 {
                            mem.fill(addr, size, 0)?;
                        }
                        addr
                    }
                    None => {
                        warn!("AllocMem({size}) failed: heap exhausted");
                        0
                    }
                };
            }
            FreeMem => {
                if regs.a[1] != 0 {
                    self.heap.free(regs.a[1], regs.d[0]);
                }
            }
            AllocVec => {
                let size = regs.d[0];
                let flags = regs.d[1];
                regs.d[0] = match self.heap.alloc(size + 8, 4) {
                    Some(addr) => {
                        mem.write_long(addr, size + 8)?;
                        if flags & memf::CLEAR != 0 {
                            mem.fill(addr + 8, size, 0)?;
                        }
                        addr + 8
                    }
                    None => 0,
                };
            }
            FreeVec => {
                if regs.a[1] != 0 {
                    let total = mem.read_long(regs.a[1] - 8)?;
                    self.heap.free(regs.a[1] - 8, total);
                }
            }
            AvailMem => regs.d[0] = mem.size() - HEAP_BASE - self.heap.bytes_used(),
            TypeOfMem => regs.d[0] = memf::PUBLIC | memf::FAST,

            AddHead => add_head(mem, regs.a[0], regs.a[1])?,
            AddTail => add_tail(mem, regs.a[0], regs.a[1])?,
            Remove => remove_node(mem, regs.a[1])?,
            RemHead => regs.d[0] = rem_head(mem, regs.a[0])?,
            RemTail => regs.d[0] = rem_tail(mem, regs.a[0])?,
            Enqueue => enqueue(mem, regs.a[0], regs.a[1])?,
            FindName => regs.d[0] = find_name(mem, regs.a[0], regs.a[1])?,

            FindTask => {
                // Only the handler task exists; any lookup lands on it.
                regs.d[0] = self.handler_task;
            }
            SetSignal => {
                let t = self.handler_task;
                let old = mem.read_long(t + task::TC_SIGRECVD)?;
                let new = (old & !regs.d[1]) | (regs.d[0] & regs.d[1]);
                mem.write_long(t + task::TC_SIGRECVD, new)?;
                regs.d[0] = old;
            }
            Wait => {
                let t = self.handler_task;
                let mask = regs.d[0];
                let recvd = mem.read_long(t + task::TC_SIGRECVD)?;
                let hit = recvd & mask;
                if hit != 0 {
                    mem.write_long(t + task::TC_SIGRECVD, recvd & !hit)?;
                    mem.write_long(t + task::TC_SIGWAIT, 0)?;
                    regs.d[0] = hit;
                } else {
                    mem.write_long(t + task::TC_SIGWAIT, mask)?;
                    return Ok(TrapResult::Blocked);
                }
            }
            Signal => {
                let target = if regs.a[1] != 0 {
                    regs.a[1]
                } else {
                    self.handler_task
                };
                let recvd = mem.read_long(target + task::TC_SIGRECVD)?;
                mem.write_long(target + task::TC_SIGRECVD, recvd | regs.d[0])?;
            }
            AllocSignal => {
                let want = regs.d[0];
                let bit = if want == 0xFFFF_FFFF {
                    if self.next_sigbit > 31 {
                        regs.d[0] = 0xFFFF_FFFF;
                        return Ok(TrapResult::Continue);
                    }
                    let b = self.next_sigbit;
                    self.next_sigbit += 1;
                    u32::from(b)
                } else {
                    want & 31
                };
                let t = self.handler_task;
                let alloc = mem.read_long(t + task::TC_SIGALLOC)?;
                mem.write_long(t + task::TC_SIGALLOC, alloc | 1 << bit)?;
                regs.d[0] = bit;
            }
            FreeSignal => {
                if regs.d[0] <= 31 {
                    let t = self.handler_task;
                    let alloc = mem.read_long(t + task::TC_SIGALLOC)?;
                    mem.write_long(t + task::TC_SIGALLOC, alloc & !(1 << regs.d[0]))?;
                }
            }

            AddPort => {
                let port = regs.a[1];
                new_list(mem, port + msgport::MP_MSGLIST)?;
                mem.write_byte(port + node::LN_TYPE, node_type::NT_MSGPORT)?;
                let name_ptr = mem.read_long(port + node::LN_NAME)?;
                if name_ptr != 0 {
                    let name = mem.read_cstr(name_ptr, 64)?;
                    debug!(
                        "AddPort {:#x} ({})",
                        port,
                        String::from_utf8_lossy(&name)
                    );
                    self.named_ports.insert(name, port);
                }
            }
            RemPort => {
                let port = regs.a[1];
                self.named_ports.retain(|_, &mut p| p != port);
            }
            PutMsg => {
                let (port, msg) = (regs.a[0], regs.a[1]);
                self.put_msg(mem, port, msg)?;
            }
            GetMsg => {
                let port = regs.a[0];
                self.deliver_startup(mem, port)?;
                regs.d[0] = rem_head(mem, port + msgport::MP_MSGLIST)?;
            }
            ReplyMsg => {
                let msg = regs.a[1];
                mem.write_byte(msg + node::LN_TYPE, node_type::NT_REPLYMSG)?;
                let reply_port = mem.read_long(msg + crate::amiga::message::MN_REPLYPORT)?;
                if reply_port != 0 {
                    add_tail(mem, reply_port + msgport::MP_MSGLIST, msg)?;
                    let sig_task = mem.read_long(reply_port + msgport::MP_SIGTASK)?;
                    if sig_task != 0 {
                        let bit = mem.read_byte(reply_port + msgport::MP_SIGBIT)?;
                        let recvd = mem.read_long(sig_task + task::TC_SIGRECVD)?;
                        mem.write_long(sig_task + task::TC_SIGRECVD, recvd | 1 << bit)?;
                    }
                }
            }
            WaitPort => {
                let port = regs.a[0];
                self.deliver_startup(mem, port)?;
                let head = list_head(mem, port + msgport::MP_MSGLIST)?;
                if head == 0 {
                    // Consume any stale port signal before sleeping, the
                    // way WaitPort's inner Wait() would.
                    let bit = mem.read_byte(port + msgport::MP_SIGBIT)?;
                    let t = self.handler_task;
                    let recvd = mem.read_long(t + task::TC_SIGRECVD)?;
                    mem.write_long(t + task::TC_SIGRECVD, recvd & !(1 << bit))?;
                    mem.write_long(t + task::TC_SIGWAIT, 1 << bit)?;
                    return Ok(TrapResult::Blocked);
                }
                regs.d[0] = head;
            }
            FindPort => {
                let name = mem.read_cstr(regs.a[1], 64)?;
                regs.d[0] = self.named_ports.get(&name).copied().unwrap_or(0);
            }
            CreateMsgPort => {
                let port = match self.heap.alloc(msgport::SIZE, 4) {
                    Some(p) => p,
                    None => {
                        regs.d[0] = 0;
                        return Ok(TrapResult::Continue);
                    }
                };
                mem.fill(port, msgport::SIZE, 0)?;
                mem.write_byte(port + node::LN_TYPE, node_type::NT_MSGPORT)?;
                let bit = if self.next_sigbit <= 31 {
                    let b = self.next_sigbit;
                    self.next_sigbit += 1;
                    b
                } else {
                    16
                };
                mem.write_byte(port + msgport::MP_SIGBIT, bit)?;
                mem.write_long(port + msgport::MP_SIGTASK, self.handler_task)?;
                new_list(mem, port + msgport::MP_MSGLIST)?;
                self.deliver_startup(mem, port)?;
                regs.d[0] = port;
            }
            DeleteMsgPort => {
                if regs.a[0] != 0 {
                    self.heap.free(regs.a[0], msgport::SIZE);
                }
            }

            OldOpenLibrary | OpenLibrary => {
                let name = mem.read_cstr(regs.a[1], 64)?;
                regs.d[0] = match name.as_slice() {
                    b"exec.library" => self.exec_base,
                    b"dos.library" => self.dos_base,
                    b"utility.library" => self.utility_base,
                    other => {
                        debug!(
                            "OpenLibrary({}) refused",
                            String::from_utf8_lossy(other)
                        );
                        0
                    }
                };
            }
            CloseLibrary => {}

            OpenDevice => {
                let name = mem.read_cstr(regs.a[0], 64)?;
                let req = regs.a[1];
                let base = match name.as_slice() {
                    b"trackdisk.device" | b"amifuse.device" | b"scsi.device" => {
                        self.trackdisk_base
                    }
                    b"timer.device" | b"input.device" => self.null_base,
                    other => {
                        warn!(
                            "OpenDevice({}) refused",
                            String::from_utf8_lossy(other)
                        );
                        0
                    }
                };
                if base == 0 {
                    mem.write_byte(req + ioreq::IO_ERROR, io_error::OPENFAIL as u8)?;
                    regs.d[0] = io_error::OPENFAIL as u32;
                } else {
                    mem.write_long(req + ioreq::IO_DEVICE, base)?;
                    mem.write_long(req + ioreq::IO_UNIT, regs.d[0])?;
                    mem.write_byte(req + ioreq::IO_ERROR, 0)?;
                    regs.d[0] = 0;
                }
            }
            CloseDevice => {
                mem.write_long(regs.a[1] + ioreq::IO_DEVICE, 0)?;
            }
            DoIO => {
                let req = regs.a[1];
                self.service_io(mem, disk, req)?;
                regs.d[0] = mem.read_byte(req + ioreq::IO_ERROR)? as i8 as u32;
            }
            SendIO => {
                // Serviced inline like DoIO, but completion is observed
                // through the request's reply port.
                let req = regs.a[1];
                self.service_io(mem, disk, req)?;
                let flags = mem.read_byte(req + ioreq::IO_FLAGS)?;
                mem.write_byte(req + ioreq::IO_FLAGS, flags & !ioreq::IOF_QUICK)?;
                mem.write_byte(req + node::LN_TYPE, node_type::NT_REPLYMSG)?;
                let reply_port = mem.read_long(req + crate::amiga::message::MN_REPLYPORT)?;
                if reply_port != 0 {
                    add_tail(mem, reply_port + msgport::MP_MSGLIST, req)?;
                    let sig_task = mem.read_long(reply_port + msgport::MP_SIGTASK)?;
                    if sig_task != 0 {
                        let bit = mem.read_byte(reply_port + msgport::MP_SIGBIT)?;
                        let recvd = mem.read_long(sig_task + task::TC_SIGRECVD)?;
                        mem.write_long(sig_task + task::TC_SIGRECVD, recvd | 1 << bit)?;
                    }
                }
            }
            CheckIO => {
                let req = regs.a[1];
                let flags = mem.read_byte(req + ioreq::IO_FLAGS)?;
                let ty = mem.read_byte(req + node::LN_TYPE)?;
                regs.d[0] = if flags & ioreq::IOF_QUICK != 0 || ty == node_type::NT_REPLYMSG {
                    req
                } else {
                    0
                };
            }
            WaitIO => {
                let req = regs.a[1];
                let flags = mem.read_byte(req + ioreq::IO_FLAGS)?;
                if flags & ioreq::IOF_QUICK == 0
                    && mem.read_byte(req + node::LN_TYPE)? == node_type::NT_REPLYMSG
                {
                    remove_node(mem, req)?;
                }
                regs.d[0] = mem.read_byte(req + ioreq::IO_ERROR)? as i8 as u32;
            }
            AbortIO => regs.d[0] = 0,
            CreateIORequest => {
                let size = regs.d[0].max(ioreq::SIZE);
                regs.d[0] = match self.heap.alloc(size, 4) {
                    Some(req) => {
                        mem.fill(req, size, 0)?;
                        mem.write_long(req + crate::amiga::message::MN_REPLYPORT, regs.a[0])?;
                        mem.write_word(
                            req + crate::amiga::message::MN_LENGTH,
                            size as u16,
                        )?;
                        req
                    }
                    None => 0,
                };
            }
            DeleteIORequest => {
                if regs.a[0] != 0 {
                    let size = mem.read_word(regs.a[0] + crate::amiga::message::MN_LENGTH)?;
                    self.heap
                        .free(regs.a[0], u32::from(size).max(ioreq::SIZE));
                }
            }

            CopyMem | CopyMemQuick => {
                let data = mem.read_bytes(regs.a[0], regs.d[0])?.to_vec();
                mem.write_bytes(regs.a[1], &data)?;
            }
            RawDoFmt => {
                // Debug formatting inside the handler; nothing to print to.
                trace!("RawDoFmt ignored");
            }

            IoErr => {
                regs.d[0] = mem.read_long(self.handler_task + process::PR_RESULT2)?;
            }
            DateStamp => {
                let at = regs.d[1];
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
                    .saturating_sub(AMIGA_EPOCH_OFFSET);
                mem.write_long(at, (now / 86_400) as u32)?;
                mem.write_long(at + 4, (now % 86_400 / 60) as u32)?;
                mem.write_long(at + 8, (now % 60) as u32 * TICKS_PER_SECOND)?;
            }
            Delay => {}

            FindTagItem => regs.d[0] = 0,
            GetTagData => {
                // Walk the tag list; fall back to the supplied default.
                let (tag, default, mut list_at) = (regs.d[0], regs.d[1], regs.a[0]);
                let mut value = default;
                let mut guard = 0;
                while list_at != 0 && guard < 256 {
                    let t = mem.read_long(list_at)?;
                    match t {
                        0 => break,                                    // TAG_DONE
                        2 => list_at = mem.read_long(list_at + 4)?,    // TAG_MORE
                        1 => list_at += 8,                             // TAG_IGNORE
                        _ => {
                            if t == tag {
                                value = mem.read_long(list_at + 4)?;
                                break;
                            }
                            list_at += 8;
                        }
                    }
                    guard += 1;
                }
                regs.d[0] = value;
            }
            Amiga2Date => {
                // struct ClockData: zeroed out; handlers only use this for
                // display formatting.
                mem.fill(regs.a[0], 14, 0)?;
            }
            Date2Amiga => regs.d[0] = 0,
            SMult32 => regs.d[0] = (regs.d[0] as i32).wrapping_mul(regs.d[1] as i32) as u32,
            UMult32 => regs.d[0] = regs.d[0].wrapping_mul(regs.d[1]),
            SDivMod32 => {
                let (a, b) = (regs.d[0] as i32, regs.d[1] as i32);
                if b == 0 {
                    regs.d[0] = 0;
                    regs.d[1] = 0;
                } else {
                    regs.d[0] = a.wrapping_div(b) as u32;
                    regs.d[1] = a.wrapping_rem(b) as u32;
                }
            }
            UDivMod32 => {
                let (a, b) = (regs.d[0], regs.d[1]);
                if b == 0 {
                    regs.d[0] = 0;
                    regs.d[1] = 0;
                } else {
                    regs.d[0] = a / b;
                    regs.d[1] = a % b;
                }
            }
            Stricmp => {
                let a = mem.read_cstr(regs.a[0], 256)?;
                let b = mem.read_cstr(regs.a[1], 256)?;
                regs.d[0] = stricmp(&a, &b) as u32;
            }
            Strnicmp => {
                let n = regs.d[0] as usize;
                let mut a = mem.read_cstr(regs.a[0], 256)?;
                let mut b = mem.read_cstr(regs.a[1], 256)?;
                a.truncate(n);
                b.truncate(n);
                regs.d[0] = stricmp(&a, &b) as u32;
            }
            ToUpper => regs.d[0] = u32::from((regs.d[0] as u8).to_ascii_uppercase()),
            ToLower => regs.d[0] = u32::from((regs.d[0] as u8).to_ascii_lowercase()),
        }
        Ok(TrapResult::Continue)
    }

    fn service_io(&mut self, mem: &mut Mem, disk: &mut Trackdisk, req: u32) -> Result<()> {
        let device = mem.read_long(req + ioreq::IO_DEVICE)?;
        if device == self.trackdisk_base {
            disk.service(mem, req)
        } else if device == self.null_base {
            service_null(mem, req)
        } else {
            warn!("I/O request {req:#x} for unknown device {device:#x}");
            mem.write_byte(req + ioreq::IO_ERROR, io_error::NOCMD as u8)?;
            Ok(())
        }
    }
}

fn stricmp(a: &[u8], b: &[u8]) -> i32 {
    let la = a.iter().map(|c| c.to_ascii_lowercase());
    let lb = b.iter().map(|c| c.to_ascii_lowercase());
    match la.cmp(lb) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

// ---- exec list operations, all in guest RAM ----

pub fn new_list(mem: &mut Mem, list_at: u32) -> Result<()> {
    mem.write_long(list_at + list::LH_HEAD, list_at + list::LH_TAIL)?;
    mem.write_long(list_at + list::LH_TAIL, 0)?;
    mem.write_long(list_at + list::LH_TAILPRED, list_at)?;
    Ok(())
}

pub fn add_tail(mem: &mut Mem, list_at: u32, node_at: u32) -> Result<()> {
    let pred = mem.read_long(list_at + list::LH_TAILPRED)?;
    mem.write_long(node_at + node::LN_SUCC, list_at + list::LH_TAIL)?;
    mem.write_long(node_at + node::LN_PRED, pred)?;
    mem.write_long(pred + node::LN_SUCC, node_at)?;
    mem.write_long(list_at + list::LH_TAILPRED, node_at)?;
    Ok(())
}

pub fn add_head(mem: &mut Mem, list_at: u32, node_at: u32) -> Result<()> {
    let head = mem.read_long(list_at + list::LH_HEAD)?;
    mem.write_long(node_at + node::LN_SUCC, head)?;
    mem.write_long(node_at + node::LN_PRED, list_at)?;
    mem.write_long(head + node::LN_PRED, node_at)?;
    mem.write_long(list_at + list::LH_HEAD, node_at)?;
    Ok(())
}

/// First node, or 0 when the list is empty.
pub fn list_head(mem: &Mem, list_at: u32) -> Result<u32> {
    let head = mem.read_long(list_at + list::LH_HEAD)?;
    let succ = mem.read_long(head + node::LN_SUCC)?;
    Ok(if succ == 0 { 0 } else { head })
}

pub fn rem_head(mem: &mut Mem, list_at: u32) -> Result<u32> {
    let head = mem.read_long(list_at + list::LH_HEAD)?;
    let succ = mem.read_long(head + node::LN_SUCC)?;
    if succ == 0 {
        return Ok(0);
    }
    mem.write_long(list_at + list::LH_HEAD, succ)?;
    mem.write_long(succ + node::LN_PRED, list_at)?;
    Ok(head)
}

pub fn rem_tail(mem: &mut Mem, list_at: u32) -> Result<u32> {
    let tail = mem.read_long(list_at + list::LH_TAILPRED)?;
    if tail == list_at {
        return Ok(0);
    }
    remove_node(mem, tail)?;
    Ok(tail)
}

pub fn remove_node(mem: &mut Mem, node_at: u32) -> Result<()> {
    let succ = mem.read_long(node_at + node::LN_SUCC)?;
    let pred = mem.read_long(node_at + node::LN_PRED)?;
    mem.write_long(pred + node::LN_SUCC, succ)?;
    mem.write_long(succ + node::LN_PRED, pred)?;
    Ok(())
}

fn enqueue(mem: &mut Mem, list_at: u32, node_at: u32) -> Result<()> {
    let pri = mem.read_byte(node_at + node::LN_PRI)? as i8;
    let mut cursor = mem.read_long(list_at + list::LH_HEAD)?;
    loop {
        let succ = mem.read_long(cursor + node::LN_SUCC)?;
        if succ == 0 {
            break; // reached the tail sentinel
        }
        let cpri = mem.read_byte(cursor + node::LN_PRI)? as i8;
        if cpri < pri {
            break;
        }
        cursor = succ;
    }
    // Insert before `cursor`.
    let pred = mem.read_long(cursor + node::LN_PRED)?;
    mem.write_long(node_at + node::LN_SUCC, cursor)?;
    mem.write_long(node_at + node::LN_PRED, pred)?;
    mem.write_long(pred + node::LN_SUCC, node_at)?;
    mem.write_long(cursor + node::LN_PRED, node_at)?;
    Ok(())
}

fn find_name(mem: &Mem, list_at: u32, name_at: u32) -> Result<u32> {
    let wanted = mem.read_cstr(name_at, 64)?;
    let mut cursor = mem.read_long(list_at + list::LH_HEAD)?;
    loop {
        let succ = mem.read_long(cursor + node::LN_SUCC)?;
        if succ == 0 {
            return Ok(0);
        }
        let name_ptr = mem.read_long(cursor + node::LN_NAME)?;
        if name_ptr != 0 && mem.read_cstr(name_ptr, 64)? == wanted {
            return Ok(cursor);
        }
        cursor = succ;
    }
}
