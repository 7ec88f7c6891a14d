//! Amiga hunk executable loader.
//!
//! Parses the handler binary (HUNK_HEADER, CODE/DATA/BSS segments,
//! RELOC32 fixups), places each segment in the segment arena and links
//! them into the BPTR seglist chain AmigaDOS hands to a handler.

use log::debug;

use crate::error::{AmiError, Result};
use crate::mem::{Arena, Mem, addr_to_bptr};

pub const HUNK_NAME: u32 = 0x3E8;
pub const HUNK_CODE: u32 = 0x3E9;
pub const HUNK_DATA: u32 = 0x3EA;
pub const HUNK_BSS: u32 = 0x3EB;
pub const HUNK_RELOC32: u32 = 0x3EC;
pub const HUNK_SYMBOL: u32 = 0x3F0;
pub const HUNK_DEBUG: u32 = 0x3F1;
pub const HUNK_END: u32 = 0x3F2;
pub const HUNK_HEADER: u32 = 0x3F3;
pub const HUNK_DREL32: u32 = 0x3F7;
pub const HUNK_RELOC32SHORT: u32 = 0x3FC;

const HUNKF_ADVISORY: u32 = 0x2000_0000;

#[derive(Debug)]
pub struct LoadedSeg {
    /// Address of the segment's first data byte.
    pub addr: u32,
    pub size: u32,
}

#[derive(Debug)]
pub struct LoadedImage {
    /// BPTR to the first seglist node (the next-pointer longword).
    pub seglist: u32,
    /// Entry point: the first segment's data start.
    pub entry: u32,
    pub segments: Vec<LoadedSeg>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn long(&mut self) -> Result<u32> {
        if self.pos + 4 > self.bytes.len() {
            return Err(AmiError::HandlerLoad(format!(
                "truncated hunk file at offset {}",
                self.pos
            )));
        }
        let v = u32::from_be_bytes([
            self.bytes[self.pos],
            self.bytes[self.pos + 1],
            self.bytes[self.pos + 2],
            self.bytes[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn word(&mut self) -> Result<u16> {
        if self.pos + 2 > self.bytes.len() {
            return Err(AmiError::HandlerLoad(format!(
                "truncated hunk file at offset {}",
                self.pos
            )));
        }
        let v = u16::from_be_bytes([self.bytes[self.pos], self.bytes[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn skip_longs(&mut self, n: u32) -> Result<()> {
        let n = n as usize * 4;
        if self.pos + n > self.bytes.len() {
            return Err(AmiError::HandlerLoad(format!(
                "truncated hunk file at offset {}",
                self.pos
            )));
        }
        self.pos += n;
        Ok(())
    }

    fn data(&mut self, longs: u32) -> Result<&'a [u8]> {
        let n = longs as usize * 4;
        if self.pos + n > self.bytes.len() {
            return Err(AmiError::HandlerLoad(format!(
                "truncated hunk data at offset {}",
                self.pos
            )));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn align_long(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

/// Load a hunk executable into the segment arena and build its seglist.
pub fn load(mem: &mut Mem, arena: &mut Arena, bytes: &[u8]) -> Result<LoadedImage> {
    let mut r = Reader::new(bytes);
    let magic = r.long()?;
    if magic != HUNK_HEADER {
        return Err(AmiError::HandlerLoad(format!(
            "not a hunk executable (magic {magic:#x})"
        )));
    }
    // Resident library names: unused in load files, must be empty strings.
    loop {
        let n = r.long()?;
        if n == 0 {
            break;
        }
        r.skip_longs(n)?;
    }
    let table_size = r.long()?;
    let first = r.long()?;
    let last = r.long()?;
    if last < first || last - first + 1 > table_size || table_size > 1024 {
        return Err(AmiError::HandlerLoad(format!(
            "implausible hunk table ({first}..{last} of {table_size})"
        )));
    }
    let count = (last - first + 1) as usize;

    // Allocate every segment up front so relocations can target any hunk.
    // Seglist node layout: [length][BPTR next][data...]; the BPTR points at
    // the next-pointer longword.
    let mut segments = Vec::with_capacity(count);
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let size_long = r.long()?;
        if size_long >> 30 == 3 {
            r.long()?; // extended memory flags
        }
        let size = (size_long & 0x3FFF_FFFF)
            .checked_mul(4)
            .ok_or_else(|| AmiError::HandlerLoad("segment size overflow".into()))?;
        let alloc = arena
            .alloc(size + 8, 4)
            .ok_or_else(|| AmiError::HandlerLoad("out of segment arena".into()))?;
        mem.write_long(alloc, size + 8).map_err(fault)?;
        mem.write_long(alloc + 4, 0).map_err(fault)?;
        mem.fill(alloc + 8, size, 0).map_err(fault)?;
        nodes.push(alloc);
        segments.push(LoadedSeg {
            addr: alloc + 8,
            size,
        });
    }
    for i in 0..count.saturating_sub(1) {
        mem.write_long(nodes[i] + 4, addr_to_bptr(nodes[i + 1] + 4))
            .map_err(fault)?;
    }

    // Walk the hunks, filling segments and applying relocations.
    let mut current = 0usize;
    while !r.at_end() && current < count {
        let word = r.long()?;
        let kind = word & 0x3FFF_FFFF;
        match kind & !HUNKF_ADVISORY {
            HUNK_CODE | HUNK_DATA => {
                let longs = r.long()?;
                let data = r.data(longs)?;
                let seg = &segments[current];
                if data.len() as u32 > seg.size {
                    return Err(AmiError::HandlerLoad(format!(
                        "hunk {current} data ({} bytes) exceeds its header size ({})",
                        data.len(),
                        seg.size
                    )));
                }
                mem.write_bytes(seg.addr, data).map_err(fault)?;
            }
            HUNK_BSS => {
                r.long()?; // size repeated; segment is already zeroed
            }
            HUNK_RELOC32 => loop {
                let n = r.long()?;
                if n == 0 {
                    break;
                }
                let target = r.long()?;
                let base = reloc_target(&segments, first, target)?;
                for _ in 0..n {
                    let off = r.long()?;
                    apply_reloc32(mem, &segments[current], off, base)?;
                }
            },
            HUNK_RELOC32SHORT | HUNK_DREL32 => {
                loop {
                    let n = u32::from(r.word()?);
                    if n == 0 {
                        break;
                    }
                    let target = u32::from(r.word()?);
                    let base = reloc_target(&segments, first, target)?;
                    for _ in 0..n {
                        let off = u32::from(r.word()?);
                        apply_reloc32(mem, &segments[current], off, base)?;
                    }
                }
                r.align_long();
            }
            HUNK_SYMBOL => loop {
                let n = r.long()?;
                if n == 0 {
                    break;
                }
                r.skip_longs(n + 1)?; // name + value
            },
            HUNK_DEBUG | HUNK_NAME => {
                let n = r.long()?;
                r.skip_longs(n)?;
            }
            HUNK_END => {
                current += 1;
            }
            other if kind & HUNKF_ADVISORY != 0 => {
                let n = r.long()?;
                debug!("skipping advisory hunk {other:#x} ({n} longwords)");
                r.skip_longs(n)?;
            }
            other => {
                return Err(AmiError::HandlerLoad(format!(
                    "unsupported hunk type {other:#x}"
                )));
            }
        }
    }

    let image = LoadedImage {
        seglist: addr_to_bptr(nodes[0] + 4),
        entry: segments[0].addr,
        segments,
    };
    debug!(
        "loaded {} segment(s), entry {:#010x}, {} bytes of code+data",
        image.segments.len(),
        image.entry,
        image.segments.iter().map(|s| s.size).sum::<u32>()
    );
    Ok(image)
}

fn reloc_target(segments: &[LoadedSeg], first: u32, target: u32) -> Result<u32> {
    let idx = target
        .checked_sub(first)
        .map(|i| i as usize)
        .filter(|&i| i < segments.len())
        .ok_or_else(|| AmiError::HandlerLoad(format!("relocation targets bad hunk {target}")))?;
    Ok(segments[idx].addr)
}

fn apply_reloc32(mem: &mut Mem, seg: &LoadedSeg, off: u32, base: u32) -> Result<()> {
    if off + 4 > seg.size {
        return Err(AmiError::HandlerLoad(format!(
            "relocation offset {off:#x} outside segment of {} bytes",
            seg.size
        )));
    }
    let v = mem.read_long(seg.addr + off).map_err(fault)?;
    mem.write_long(seg.addr + off, v.wrapping_add(base))
        .map_err(fault)?;
    Ok(())
}

fn fault(f: crate::mem::BusFault) -> AmiError {
    AmiError::HandlerLoad(format!("segment placement faulted: {f}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HunkBuilder(Vec<u8>);

    impl HunkBuilder {
        fn new() -> Self {
            Self(Vec::new())
        }

        fn long(mut self, v: u32) -> Self {
            self.0.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn longs(mut self, vs: &[u32]) -> Self {
            for v in vs {
                self.0.extend_from_slice(&v.to_be_bytes());
            }
            self
        }
    }

    fn two_hunk_binary() -> Vec<u8> {
        // Hunk 0: code, 2 longwords, one reloc into hunk 1.
        // Hunk 1: bss, 4 longwords.
        HunkBuilder::new()
            .long(HUNK_HEADER)
            .long(0) // no resident names
            .long(2) // table size
            .long(0) // first
            .long(1) // last
            .longs(&[2, 4]) // sizes in longwords
            .long(HUNK_CODE)
            .long(2)
            .longs(&[0x4E75_0000, 0x0000_0010]) // RTS; pointer-to-be
            .long(HUNK_RELOC32)
            .long(1) // one offset
            .long(1) // into hunk 1
            .long(4) // at byte offset 4
            .long(0) // end of reloc groups
            .long(HUNK_END)
            .long(HUNK_BSS)
            .long(4)
            .long(HUNK_END)
            .0
    }

    #[test]
    fn loads_segments_and_applies_relocs() {
        let mut mem = Mem::new(0x10000);
        let mut arena = Arena::new(0x1000, 0x8000);
        let img = load(&mut mem, &mut arena, &two_hunk_binary()).unwrap();
        assert_eq!(img.segments.len(), 2);
        assert_eq!(img.entry, img.segments[0].addr);
        // Relocated longword = original 0x10 + hunk 1 base.
        let fixed = mem.read_long(img.segments[0].addr + 4).unwrap();
        assert_eq!(fixed, 0x10 + img.segments[1].addr);
        // Seglist chain: node 0 links to node 1, node 1 terminates.
        let node0 = crate::mem::bptr_to_addr(img.seglist);
        let next = mem.read_long(node0).unwrap();
        assert_eq!(crate::mem::bptr_to_addr(next), img.segments[1].addr - 4);
        assert_eq!(
            mem.read_long(crate::mem::bptr_to_addr(next)).unwrap(),
            0
        );
    }

    #[test]
    fn bss_is_zeroed() {
        let mut mem = Mem::new(0x10000);
        let mut arena = Arena::new(0x1000, 0x8000);
        let img = load(&mut mem, &mut arena, &two_hunk_binary()).unwrap();
        let bss = &img.segments[1];
        assert_eq!(mem.read_bytes(bss.addr, bss.size).unwrap(), &[0u8; 16]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut mem = Mem::new(0x10000);
        let mut arena = Arena::new(0x1000, 0x8000);
        let bytes = HunkBuilder::new().long(0x3E9).long(0).0;
        match load(&mut mem, &mut arena, &bytes) {
            Err(AmiError::HandlerLoad(_)) => {}
            other => panic!("expected HandlerLoad, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_file() {
        let mut mem = Mem::new(0x10000);
        let mut arena = Arena::new(0x1000, 0x8000);
        let mut bytes = two_hunk_binary();
        bytes.truncate(32);
        assert!(matches!(
            load(&mut mem, &mut arena, &bytes),
            Err(AmiError::HandlerLoad(_))
        ));
    }

    #[test]
    fn rejects_reloc_outside_segment() {
        let mut mem = Mem::new(0x10000);
        let mut arena = Arena::new(0x1000, 0x8000);
        let bytes = HunkBuilder::new()
            .long(HUNK_HEADER)
            .long(0)
            .long(1)
            .long(0)
            .long(0)
            .long(1) // one longword
            .long(HUNK_CODE)
            .long(1)
            .long(0x4E75_0000)
            .long(HUNK_RELOC32)
            .long(1)
            .long(0)
            .long(0x100) // offset beyond the 4-byte segment
            .long(0)
            .long(HUNK_END)
            .0;
        assert!(matches!(
            load(&mut mem, &mut arena, &bytes),
            Err(AmiError::HandlerLoad(_))
        ));
    }
}
