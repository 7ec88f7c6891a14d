//! Handler bootstrap.
//!
//! Loads the handler binary, fabricates the DOS mount environment
//! (DosEnvec, FileSysStartupMsg, DeviceNode), stages the ACTION_STARTUP
//! packet for the rendezvous with the handler's first port, and runs the
//! CPU until the handler answers. A handler that fails to reply inside the
//! boot budget aborts the mount.

use std::fs::File;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::amiga::{action, devicenode, envec, fssm, message, node, packet, process};
use crate::bridge::{HandlerVm, wait_reply};
use crate::cpu::{CpuCore, Machine};
use crate::device::Trackdisk;
use crate::error::{AmiError, Result};
use crate::exec::Kernel;
use crate::hunk;
use crate::mem::{DEFAULT_RAM_SIZE, addr_to_bptr};
use crate::rdb::DiskEnv;

/// Cycle budget for the whole bootstrap.
pub const BOOT_BUDGET: u64 = 200_000_000;

/// Wall-clock ceiling for the bootstrap.
pub const BOOT_WALL: Duration = Duration::from_secs(5);

pub struct BootConfig {
    pub driver: Vec<u8>,
    pub image: File,
    pub image_len: u64,
    pub env: DiskEnv,
    /// AmigaDOS device name in the startup packet, e.g. "DH0".
    pub device_name: String,
    pub ram_size: u32,
    pub stack_size: u32,
}

impl BootConfig {
    pub fn new(driver: Vec<u8>, image: File, image_len: u64, env: DiskEnv) -> Self {
        Self {
            driver,
            image,
            image_len,
            env,
            device_name: "DH0".into(),
            ram_size: DEFAULT_RAM_SIZE,
            stack_size: 0x8000,
        }
    }
}

/// Boot the handler and return a machine ready for packet traffic, with
/// the handler port discovered and the volume root lock held.
pub fn boot(cfg: BootConfig, core: Box<dyn CpuCore + Send>) -> Result<HandlerVm> {
    let mut machine = Machine::new(core, cfg.ram_size);
    let mut kernel = Kernel::new(&mut machine.mem)?;

    let image = hunk::load(&mut machine.mem, &mut kernel.seg_arena, &cfg.driver)?;
    let entry = image.entry;

    let proc = kernel.create_process(&mut machine.mem, "amifuse_handler", cfg.stack_size)?;
    let reply_port = kernel.create_host_port(&mut machine.mem)?;

    // Static mount structures, alive for the whole session.
    let alloc = |k: &mut Kernel, size: u32| -> Result<u32> {
        k.kernel_arena
            .alloc(size, 4)
            .ok_or_else(|| AmiError::HandlerBoot("kernel arena exhausted".into()))
    };

    let devname = alloc(&mut kernel, cfg.device_name.len() as u32 + 2)?;
    machine
        .mem
        .write_bstr(devname, cfg.device_name.as_bytes())?;

    let env_at = alloc(&mut kernel, envec::SIZE)?;
    write_envec(&mut machine.mem, env_at, &cfg.env)?;

    let fssm_at = alloc(&mut kernel, fssm::SIZE)?;
    machine.mem.write_long(fssm_at + fssm::UNIT, 0)?;
    machine
        .mem
        .write_long(fssm_at + fssm::DEVICE, addr_to_bptr(devname))?;
    machine
        .mem
        .write_long(fssm_at + fssm::ENVIRON, addr_to_bptr(env_at))?;
    machine.mem.write_long(fssm_at + fssm::FLAGS, 0)?;

    let dn = alloc(&mut kernel, devicenode::SIZE)?;
    machine.mem.fill(dn, devicenode::SIZE, 0)?;
    machine
        .mem
        .write_long(dn + devicenode::DN_STACKSIZE, cfg.stack_size)?;
    machine.mem.write_long(dn + devicenode::DN_PRIORITY, 10)?;
    machine
        .mem
        .write_long(dn + devicenode::DN_STARTUP, addr_to_bptr(fssm_at))?;
    machine
        .mem
        .write_long(dn + devicenode::DN_SEGLIST, image.seglist)?;
    machine
        .mem
        .write_long(dn + devicenode::DN_GLOBALVEC, 0xFFFF_FFFF)?;
    machine
        .mem
        .write_long(dn + devicenode::DN_NAME, addr_to_bptr(devname))?;

    // The startup packet itself.
    let pkt = alloc(&mut kernel, packet::SIZE)?;
    let msg = alloc(&mut kernel, message::SIZE)?;
    machine.mem.fill(pkt, packet::SIZE, 0)?;
    machine.mem.fill(msg, message::SIZE, 0)?;
    machine.mem.write_long(pkt + packet::DP_LINK, msg)?;
    machine.mem.write_long(pkt + packet::DP_PORT, reply_port)?;
    machine
        .mem
        .write_long(pkt + packet::DP_TYPE, action::STARTUP as u32)?;
    machine
        .mem
        .write_long(pkt + packet::DP_ARG1, addr_to_bptr(devname))?;
    machine
        .mem
        .write_long(pkt + packet::DP_ARG2, addr_to_bptr(fssm_at))?;
    machine
        .mem
        .write_long(pkt + packet::DP_ARG3, addr_to_bptr(dn))?;
    machine.mem.write_long(msg + node::LN_NAME, pkt)?;
    machine
        .mem
        .write_long(msg + message::MN_REPLYPORT, reply_port)?;
    kernel.stage_startup(msg);

    // Registers per the handler calling convention: A0 carries the startup
    // structure, A6 the Exec base, and the return address on the stack
    // lands on the exit stub.
    let stack_top = machine
        .mem
        .read_long(proc + crate::amiga::task::TC_SPREG)?;
    let sp = stack_top - 4;
    machine.mem.write_long(sp, kernel.exit_stub)?;
    machine.regs.set_sp(sp);
    machine.regs.pc = entry;
    machine.regs.a[0] = fssm_at;
    machine.regs.a[6] = kernel.exec_base;
    machine.regs.d[0] = 0;

    let disk = Trackdisk::new(cfg.image, cfg.image_len, cfg.env.clone());
    let mut vm = HandlerVm::new(machine, kernel, disk, reply_port);
    vm.packets_sent += 1; // the startup packet

    debug!("running handler until startup reply (entry {entry:#010x})");
    let deadline = Instant::now() + BOOT_WALL;
    let (res1, res2) = wait_reply(&mut vm, msg, pkt, BOOT_BUDGET, deadline).map_err(|e| {
        match e {
            AmiError::PacketTimeout => {
                AmiError::HandlerBoot("boot budget exhausted before the startup reply".into())
            }
            AmiError::HandlerBoot(m) => AmiError::HandlerBoot(m),
            other => AmiError::HandlerBoot(other.to_string()),
        }
    })?;
    if res1 == 0 {
        return Err(AmiError::HandlerBoot(format!(
            "handler rejected the startup packet (error {res2})"
        )));
    }

    // The packet port for everything after startup: dn_Task if the handler
    // registered it, else the port the startup packet was delivered to,
    // else the process port.
    let dn_task = vm.machine.mem.read_long(dn + devicenode::DN_TASK)?;
    vm.handler_port = if dn_task != 0 {
        dn_task
    } else if let Some(port) = vm.kernel.provisional_port {
        port
    } else {
        vm.kernel.handler_task + process::PR_MSGPORT
    };
    debug!("handler port {:#010x}", vm.handler_port);

    // Root lock: from the startup reply when the handler provides it,
    // otherwise via an explicit LOCATE of the volume root.
    vm.root_lock = if res2 != 0 {
        res2
    } else {
        vm.locate("")
            .map_err(|e| AmiError::HandlerBoot(format!("root lock unavailable: {e}")))?
    };

    match vm.is_filesystem() {
        Ok(true) => {}
        Ok(false) => warn!("handler answered IS_FILESYSTEM with false"),
        Err(e) => debug!("IS_FILESYSTEM probe failed: {e}"),
    }

    info!(
        "handler up: port {:#010x}, root lock {:#010x}",
        vm.handler_port, vm.root_lock
    );
    Ok(vm)
}

fn write_envec(mem: &mut crate::mem::Mem, at: u32, env: &DiskEnv) -> Result<()> {
    mem.fill(at, envec::SIZE, 0)?;
    mem.write_long(at + envec::TABLE_SIZE, 16)?;
    mem.write_long(at + envec::SIZE_BLOCK, env.block_size / 4)?;
    mem.write_long(at + envec::SURFACES, env.surfaces)?;
    mem.write_long(at + envec::SECTOR_PER_BLOCK, 1)?;
    mem.write_long(at + envec::BLOCKS_PER_TRACK, env.blocks_per_track)?;
    mem.write_long(at + envec::RESERVED, env.reserved)?;
    mem.write_long(at + envec::LOW_CYL, env.low_cyl)?;
    mem.write_long(at + envec::HIGH_CYL, env.high_cyl)?;
    mem.write_long(at + envec::NUM_BUFFERS, env.num_buffers)?;
    mem.write_long(at + envec::BUF_MEM_TYPE, 1)?;
    mem.write_long(at + envec::MAX_TRANSFER, env.max_transfer)?;
    mem.write_long(at + envec::MASK, env.mask)?;
    mem.write_long(at + envec::BOOT_PRI, env.boot_pri as u32)?;
    mem.write_long(at + envec::DOS_TYPE, env.dos_type)?;
    Ok(())
}
