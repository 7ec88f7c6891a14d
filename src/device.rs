//! Virtual trackdisk.device backed by the host image file.
//!
//! The handler addresses the raw device in bytes (AmigaOS 2.x+ byte
//! addressing); partitioning is the handler's business via the startup
//! environment, so reads here are absolute image offsets. The mount is
//! read-only: every write command is rejected with `IOERR_NOCMD`.

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::{debug, trace, warn};

use crate::amiga::{io_error, ioreq, node_type, td_cmd};
use crate::error::Result;
use crate::mem::Mem;
use crate::rdb::DiskEnv;

const IOERR_NOCMD: u8 = io_error::NOCMD as u8;
const TDERR_SEEK_ERROR: u8 = 30;

/// struct DriveGeometry (devices/trackdisk.h), 32 bytes.
mod geometry {
    pub const SECTOR_SIZE: u32 = 0;
    pub const TOTAL_SECTORS: u32 = 4;
    pub const CYLINDERS: u32 = 8;
    pub const CYL_SECTORS: u32 = 12;
    pub const HEADS: u32 = 16;
    pub const TRACK_SECTORS: u32 = 20;
    pub const BUF_MEM_TYPE: u32 = 24;
    pub const DEVICE_TYPE: u32 = 28;
    pub const FLAGS: u32 = 29;
    pub const SIZE: u32 = 32;
}

pub struct Trackdisk {
    image: File,
    image_len: u64,
    env: DiskEnv,
    change_num: u32,
    write_warned: bool,
    /// Disk reads serviced, for diagnostics and tests.
    pub reads: u64,
}

impl Trackdisk {
    pub fn new(image: File, image_len: u64, env: DiskEnv) -> Self {
        Self {
            image,
            image_len,
            env,
            change_num: 1,
            write_warned: false,
            reads: 0,
        }
    }

    pub fn env(&self) -> &DiskEnv {
        &self.env
    }

    pub fn block_size(&self) -> u32 {
        self.env.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.env.total_blocks(self.image_len)
    }

    pub fn image_len(&self) -> u64 {
        self.image_len
    }

    /// Service the I/O request at `req` in guest RAM, filling `io_Actual`
    /// and `io_Error`. Called inline from the kernel's DoIO/SendIO traps;
    /// the CPU lock is already held.
    pub fn service(&mut self, mem: &mut Mem, req: u32) -> Result<()> {
        let command = mem.read_word(req + ioreq::IO_COMMAND)?;
        let mut actual = 0u32;
        let mut error = 0u8;
        match command {
            td_cmd::CMD_READ => {
                let offset = mem.read_long(req + ioreq::IO_OFFSET)?;
                let length = mem.read_long(req + ioreq::IO_LENGTH)?;
                let data = mem.read_long(req + ioreq::IO_DATA)?;
                trace!("CMD_READ offset={offset:#x} len={length:#x}");
                match self.read_span(u64::from(offset), length) {
                    Ok(buf) => {
                        mem.write_bytes(data, &buf)?;
                        actual = buf.len() as u32;
                        self.reads += 1;
                    }
                    Err(e) => {
                        warn!("disk read at {offset:#x} failed: {e}");
                        error = TDERR_SEEK_ERROR;
                    }
                }
            }
            td_cmd::CMD_WRITE => {
                if !self.write_warned {
                    warn!("handler issued CMD_WRITE on a read-only mount; rejecting");
                    self.write_warned = true;
                }
                error = IOERR_NOCMD;
            }
            td_cmd::CMD_UPDATE | td_cmd::CMD_CLEAR | td_cmd::TD_MOTOR => {}
            td_cmd::TD_CHANGENUM => actual = self.change_num,
            td_cmd::TD_CHANGESTATE => actual = 0, // disk present
            td_cmd::TD_PROTSTATUS => actual = 1,  // write protected
            td_cmd::TD_ADDCHANGEINT | td_cmd::TD_REMCHANGEINT => {}
            td_cmd::TD_GETGEOMETRY => {
                let data = mem.read_long(req + ioreq::IO_DATA)?;
                self.write_geometry(mem, data)?;
                actual = geometry::SIZE;
            }
            other => {
                debug!("unsupported trackdisk command {other}");
                error = IOERR_NOCMD;
            }
        }
        mem.write_long(req + ioreq::IO_ACTUAL, actual)?;
        mem.write_byte(req + ioreq::IO_ERROR, error)?;
        let flags = mem.read_byte(req + ioreq::IO_FLAGS)?;
        mem.write_byte(req + ioreq::IO_FLAGS, flags | ioreq::IOF_QUICK)?;
        Ok(())
    }

    fn read_span(&self, offset: u64, length: u32) -> std::io::Result<Vec<u8>> {
        if offset >= self.image_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of image",
            ));
        }
        let avail = (self.image_len - offset).min(u64::from(length)) as usize;
        let mut buf = vec![0u8; avail];
        self.image.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_geometry(&self, mem: &mut Mem, at: u32) -> Result<()> {
        let cylinders = self.env.high_cyl - self.env.low_cyl + 1;
        let cyl_sectors = self.env.surfaces * self.env.blocks_per_track;
        mem.fill(at, geometry::SIZE, 0)?;
        mem.write_long(at + geometry::SECTOR_SIZE, self.env.block_size)?;
        mem.write_long(at + geometry::TOTAL_SECTORS, self.total_blocks() as u32)?;
        mem.write_long(at + geometry::CYLINDERS, cylinders)?;
        mem.write_long(at + geometry::CYL_SECTORS, cyl_sectors)?;
        mem.write_long(at + geometry::HEADS, self.env.surfaces)?;
        mem.write_long(at + geometry::TRACK_SECTORS, self.env.blocks_per_track)?;
        mem.write_long(at + geometry::BUF_MEM_TYPE, 1)?; // MEMF_PUBLIC
        mem.write_byte(at + geometry::DEVICE_TYPE, 0)?; // DG_DIRECT_ACCESS
        mem.write_byte(at + geometry::FLAGS, 0)?;
        Ok(())
    }
}

/// The null device: bound to devices the bridge does not model (timer,
/// input). Every request succeeds immediately with no side effects.
pub fn service_null(mem: &mut Mem, req: u32) -> Result<()> {
    mem.write_byte(req + ioreq::IO_ERROR, 0)?;
    mem.write_long(req + ioreq::IO_ACTUAL, 0)?;
    let flags = mem.read_byte(req + ioreq::IO_FLAGS)?;
    mem.write_byte(req + ioreq::IO_FLAGS, flags | ioreq::IOF_QUICK)?;
    mem.write_byte(req + crate::amiga::node::LN_TYPE, node_type::NT_REPLYMSG)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn disk_with(content: &[u8]) -> Trackdisk {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        let len = content.len() as u64;
        let file = f.reopen().unwrap();
        let env = DiskEnv {
            block_size: 512,
            surfaces: 1,
            blocks_per_track: 16,
            low_cyl: 0,
            high_cyl: 0,
            reserved: 2,
            num_buffers: 30,
            max_transfer: 0x00FF_FFFF,
            mask: 0xFFFF_FFFE,
            boot_pri: 0,
            dos_type: 0x444F_5300,
            drive_name: None,
            from_rdb: false,
        };
        // keep the tempfile alive for the duration of the test
        std::mem::forget(f);
        Trackdisk::new(file, len, env)
    }

    fn build_request(mem: &mut Mem, req: u32, command: u16, offset: u32, len: u32, data: u32) {
        mem.write_word(req + ioreq::IO_COMMAND, command).unwrap();
        mem.write_long(req + ioreq::IO_OFFSET, offset).unwrap();
        mem.write_long(req + ioreq::IO_LENGTH, len).unwrap();
        mem.write_long(req + ioreq::IO_DATA, data).unwrap();
    }

    #[test]
    fn read_copies_image_bytes_into_ram() {
        let mut content = vec![0u8; 2048];
        content[512..524].copy_from_slice(b"Hello Amiga\n");
        let mut disk = disk_with(&content);
        let mut mem = Mem::new(0x10000);
        build_request(&mut mem, 0x100, td_cmd::CMD_READ, 512, 12, 0x2000);
        disk.service(&mut mem, 0x100).unwrap();
        assert_eq!(mem.read_bytes(0x2000, 12).unwrap(), b"Hello Amiga\n");
        assert_eq!(mem.read_long(0x100 + ioreq::IO_ACTUAL).unwrap(), 12);
        assert_eq!(mem.read_byte(0x100 + ioreq::IO_ERROR).unwrap(), 0);
        assert_eq!(disk.reads, 1);
    }

    #[test]
    fn write_is_rejected() {
        let mut disk = disk_with(&[0u8; 1024]);
        let mut mem = Mem::new(0x10000);
        build_request(&mut mem, 0x100, td_cmd::CMD_WRITE, 0, 512, 0x2000);
        disk.service(&mut mem, 0x100).unwrap();
        assert_eq!(
            mem.read_byte(0x100 + ioreq::IO_ERROR).unwrap() as i8,
            -3 // IOERR_NOCMD
        );
    }

    #[test]
    fn read_past_end_is_a_seek_error() {
        let mut disk = disk_with(&[0u8; 1024]);
        let mut mem = Mem::new(0x10000);
        build_request(&mut mem, 0x100, td_cmd::CMD_READ, 4096, 512, 0x2000);
        disk.service(&mut mem, 0x100).unwrap();
        assert_eq!(
            mem.read_byte(0x100 + ioreq::IO_ERROR).unwrap(),
            TDERR_SEEK_ERROR
        );
    }

    #[test]
    fn protstatus_reports_write_protected() {
        let mut disk = disk_with(&[0u8; 1024]);
        let mut mem = Mem::new(0x10000);
        build_request(&mut mem, 0x100, td_cmd::TD_PROTSTATUS, 0, 0, 0);
        disk.service(&mut mem, 0x100).unwrap();
        assert_eq!(mem.read_long(0x100 + ioreq::IO_ACTUAL).unwrap(), 1);
    }

    #[test]
    fn geometry_is_synthesized_from_the_environment() {
        let mut disk = disk_with(&vec![0u8; 512 * 32]);
        let mut mem = Mem::new(0x10000);
        build_request(&mut mem, 0x100, td_cmd::TD_GETGEOMETRY, 0, 0, 0x3000);
        disk.service(&mut mem, 0x100).unwrap();
        assert_eq!(mem.read_long(0x3000 + geometry::SECTOR_SIZE).unwrap(), 512);
        assert_eq!(mem.read_long(0x3000 + geometry::TOTAL_SECTORS).unwrap(), 32);
        assert_eq!(mem.read_long(0x3000 + geometry::HEADS).unwrap(), 1);
    }

    #[test]
    fn null_device_always_succeeds() {
        let mut mem = Mem::new(0x1000);
        mem.write_byte(0x100 + ioreq::IO_ERROR, 0x7F).unwrap();
        service_null(&mut mem, 0x100).unwrap();
        assert_eq!(mem.read_byte(0x100 + ioreq::IO_ERROR).unwrap(), 0);
        assert_ne!(
            mem.read_byte(0x100 + ioreq::IO_FLAGS).unwrap() & ioreq::IOF_QUICK,
            0
        );
    }
}
