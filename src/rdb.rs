//! Rigid Disk Block parsing.
//!
//! An RDB-partitioned image carries an `RDSK` block in its first 16 sectors,
//! pointing at a chain of `PART` blocks. Only the first partition is used;
//! its DosEnvec supplies the true block size, geometry and DosType for the
//! handler's startup environment. Images without an RDB get a synthesized
//! environment covering the whole file.

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::{debug, warn};

use crate::error::{AmiError, Result};

const RDSK_ID: &[u8; 4] = b"RDSK";
const PART_ID: &[u8; 4] = b"PART";

/// RDBs live somewhere in the first 16 blocks of the device.
const RDB_LOCATION_LIMIT: u64 = 16;

/// The scan stride; RDSK pointers are in units of this regardless of the
/// partition block size.
const RDB_BLOCK: u64 = 512;

/// Everything the startup environment vector needs, from the RDB's first
/// partition or synthesized from the image size.
#[derive(Debug, Clone)]
pub struct DiskEnv {
    pub block_size: u32,
    pub surfaces: u32,
    pub blocks_per_track: u32,
    pub low_cyl: u32,
    pub high_cyl: u32,
    pub reserved: u32,
    pub num_buffers: u32,
    pub max_transfer: u32,
    pub mask: u32,
    pub boot_pri: i32,
    pub dos_type: u32,
    pub drive_name: Option<String>,
    pub from_rdb: bool,
}

impl DiskEnv {
    pub fn total_blocks(&self, image_len: u64) -> u64 {
        if self.from_rdb {
            u64::from(self.high_cyl - self.low_cyl + 1)
                * u64::from(self.surfaces)
                * u64::from(self.blocks_per_track)
        } else {
            image_len / u64::from(self.block_size)
        }
    }
}

fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// AmigaOS block checksum: the longword sum over the block is zero.
fn checksum_ok(buf: &[u8], size_longs: u32) -> bool {
    let longs = (size_longs as usize).min(buf.len() / 4);
    let mut sum = 0u32;
    for i in 0..longs {
        sum = sum.wrapping_add(be32(buf, i * 4));
    }
    sum == 0
}

/// Probe the image for an RDB and derive the startup environment.
///
/// Precedence for the block size is RDB > CLI > 512; `prefer_cli` inverts
/// the first two for images whose RDB is known to lie.
pub fn probe(
    image: &File,
    image_len: u64,
    cli_block_size: Option<u32>,
    prefer_cli: bool,
) -> Result<DiskEnv> {
    if let Some(mut env) = find_rdb(image, image_len)? {
        if prefer_cli {
            if let Some(bs) = cli_block_size {
                debug!(
                    "overriding RDB block size {} with {} from the command line",
                    env.block_size, bs
                );
                env.block_size = bs;
            }
        }
        return Ok(env);
    }
    Ok(synthesize(image, image_len, cli_block_size.unwrap_or(512)))
}

fn read_block(image: &File, image_len: u64, block: u64) -> Result<Option<[u8; 512]>> {
    let off = block * RDB_BLOCK;
    if off + RDB_BLOCK > image_len {
        return Ok(None);
    }
    let mut buf = [0u8; 512];
    image
        .read_exact_at(&mut buf, off)
        .map_err(|e| AmiError::Image(format!("read at {off}: {e}")))?;
    Ok(Some(buf))
}

fn find_rdb(image: &File, image_len: u64) -> Result<Option<DiskEnv>> {
    for block in 0..RDB_LOCATION_LIMIT {
        let Some(buf) = read_block(image, image_len, block)? else {
            break;
        };
        if &buf[0..4] != RDSK_ID {
            continue;
        }
        if !checksum_ok(&buf, be32(&buf, 4)) {
            warn!("RDSK block {block} has a bad checksum; trusting it anyway");
        }
        let part_list = be32(&buf, 28);
        debug!("RDSK at block {block}, first PART at block {part_list}");
        if part_list == 0xFFFF_FFFF {
            return Err(AmiError::Image("RDB has no partitions".into()));
        }
        return parse_part(image, image_len, u64::from(part_list)).map(Some);
    }
    Ok(None)
}

fn parse_part(image: &File, image_len: u64, block: u64) -> Result<DiskEnv> {
    let buf = read_block(image, image_len, block)?
        .ok_or_else(|| AmiError::Image(format!("PART block {block} beyond end of image")))?;
    if &buf[0..4] != PART_ID {
        return Err(AmiError::Image(format!(
            "block {block} is not a PART block"
        )));
    }
    if !checksum_ok(&buf, be32(&buf, 4)) {
        warn!("PART block {block} has a bad checksum; trusting it anyway");
    }

    // Drive name: BSTR at offset 36, up to 31 characters.
    let name_len = (buf[36] as usize).min(31);
    let drive_name = if name_len > 0 {
        Some(String::from_utf8_lossy(&buf[37..37 + name_len]).into_owned())
    } else {
        None
    };

    // DosEnvec starts at offset 128.
    let e = |idx: usize| be32(&buf, 128 + idx * 4);
    let size_block_longs = e(1);
    if size_block_longs == 0 || size_block_longs > 16384 {
        return Err(AmiError::Image(format!(
            "PART block {block} has implausible block size ({size_block_longs} longwords)"
        )));
    }
    let env = DiskEnv {
        block_size: size_block_longs * 4,
        surfaces: e(3),
        blocks_per_track: e(5),
        reserved: e(6),
        low_cyl: e(9),
        high_cyl: e(10),
        num_buffers: e(11),
        max_transfer: e(13),
        mask: e(14),
        boot_pri: e(15) as i32,
        dos_type: e(16),
        drive_name,
        from_rdb: true,
    };
    debug!(
        "partition {:?}: block size {}, cyl {}-{}, {} surfaces, {} blocks/track, dostype {:#010x}",
        env.drive_name,
        env.block_size,
        env.low_cyl,
        env.high_cyl,
        env.surfaces,
        env.blocks_per_track,
        env.dos_type
    );
    Ok(env)
}

/// Build an environment for a bare (non-RDB) image: one partition spanning
/// the whole file with a flat synthetic geometry. The DosType is lifted from
/// the image's boot block when it looks like one.
fn synthesize(image: &File, image_len: u64, block_size: u32) -> DiskEnv {
    let total_blocks = image_len / u64::from(block_size);
    let sectors: u32 = 16;
    let cylinders = ((total_blocks / u64::from(sectors)) as u32).max(1);
    let dos_type = sniff_dos_type(image).unwrap_or(0x444F_5300); // 'DOS\0'
    DiskEnv {
        block_size,
        surfaces: 1,
        blocks_per_track: sectors,
        reserved: 2,
        low_cyl: 0,
        high_cyl: cylinders - 1,
        num_buffers: 30,
        max_transfer: 0x00FF_FFFF,
        mask: 0xFFFF_FFFE,
        boot_pri: 0,
        dos_type,
        drive_name: None,
        from_rdb: false,
    }
}

/// A filesystem's boot block starts with its DosType: three printable
/// characters and a small revision byte (e.g. 'DOS\1', 'PFS\1').
fn sniff_dos_type(image: &File) -> Option<u32> {
    let mut buf = [0u8; 4];
    image.read_exact_at(&mut buf, 0).ok()?;
    let printable = buf[..3].iter().all(|b| b.is_ascii_uppercase());
    if printable && buf[3] < 8 {
        Some(u32::from_be_bytes(buf))
    } else {
        None
    }
}
