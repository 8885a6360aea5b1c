//! Segmented guest memory: a flat 32-bit address space backed by a small
//! list of R/W/X segments rather than a byte-level permission map.

use thiserror::Error;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perms: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

impl From<elf::Perms> for Perms {
    fn from(p: elf::Perms) -> Self {
        let mut perms = Perms::empty();
        if p.read() {
            perms |= Perms::READ;
        }
        if p.write() {
            perms |= Perms::WRITE;
        }
        if p.exec() {
            perms |= Perms::EXEC;
        }
        perms
    }
}

/// What kind of access was being attempted when a [`MemoryFault`] occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Execute => "execute",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryFault {
    #[error("address {addr:#010x} is not mapped by any segment")]
    NoSegment { addr: u32 },
    #[error("{kind} access to {addr:#010x} denied (segment permissions do not allow it)")]
    PermissionDenied { addr: u32, kind: AccessKind },
    #[error("misaligned instruction fetch at {addr:#010x}")]
    MisalignedFetch { addr: u32 },
    #[error("access at {addr:#010x} of length {len} runs out of mapped memory")]
    OutOfBounds { addr: u32, len: u32 },
    #[error("segment [{new_start:#010x}, {new_end:#010x}) overlaps an existing segment")]
    OverlappingSegment { new_start: u32, new_end: u32 },
}

type Result<T> = std::result::Result<T, MemoryFault>;

/// A single mapped region of guest memory.
pub struct Segment {
    pub addr: u32,
    pub size: u32,
    pub perms: Perms,
    data: Vec<u8>,
}

impl Segment {
    pub fn new(addr: u32, size: u32, perms: Perms) -> Self {
        Segment {
            addr,
            size,
            perms,
            data: vec![0u8; size as usize],
        }
    }

    fn contains(&self, addr: u32) -> bool {
        addr >= self.addr && addr < self.addr.wrapping_add(self.size)
    }

    fn end(&self) -> u64 {
        self.addr as u64 + self.size as u64
    }
}

/// A flat 32-bit address space made up of a handful of non-overlapping
/// [`Segment`]s. Lookups are a linear scan, which is fine for the small
/// number of segments an ELF program header table produces.
#[derive(Default)]
pub struct Memory {
    segments: Vec<Segment>,
}

impl Memory {
    pub fn new() -> Self {
        Memory { segments: Vec::new() }
    }

    pub fn add_segment(&mut self, seg: Segment) -> Result<()> {
        let new_start = seg.addr;
        let new_end = seg.end();

        for existing in &self.segments {
            let existing_end = existing.end();
            if (new_start as u64) < existing_end && (existing.addr as u64) < new_end {
                return Err(MemoryFault::OverlappingSegment {
                    new_start,
                    new_end: new_end as u32,
                });
            }
        }

        tracing::debug!(
            addr = format_args!("{:#010x}", seg.addr),
            size = seg.size,
            perms = ?seg.perms,
            "added segment"
        );

        self.segments.push(seg);
        Ok(())
    }

    fn find_segment(&self, addr: u32) -> Option<&Segment> {
        self.segments.iter().find(|seg| seg.contains(addr))
    }

    fn find_segment_mut(&mut self, addr: u32) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|seg| seg.contains(addr))
    }

    /// Bulk copy used by the loader; bypasses permission checks.
    pub fn write_bytes(&mut self, addr: u32, src: &[u8]) -> Result<()> {
        let len = src.len() as u32;
        let seg = self
            .find_segment(addr)
            .ok_or(MemoryFault::NoSegment { addr })?;

        if (addr as u64) + (len as u64) > seg.end() {
            return Err(MemoryFault::OutOfBounds { addr, len });
        }

        let seg = self.find_segment_mut(addr).unwrap();
        let off = (addr - seg.addr) as usize;
        seg.data[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn raw_read8(&self, addr: u32, kind: AccessKind, required: Perms) -> Result<u8> {
        let seg = self
            .find_segment(addr)
            .ok_or(MemoryFault::NoSegment { addr })?;

        if !seg.perms.contains(required) {
            return Err(MemoryFault::PermissionDenied { addr, kind });
        }

        Ok(seg.data[(addr - seg.addr) as usize])
    }

    pub fn read8(&self, addr: u32) -> Result<u8> {
        self.raw_read8(addr, AccessKind::Read, Perms::READ)
    }

    pub fn read16_le(&self, addr: u32) -> Result<u16> {
        if addr % 2 != 0 {
            tracing::warn!(addr = format_args!("{addr:#010x}"), "misaligned half-word read");
        }
        let lo = self.raw_read8(addr, AccessKind::Read, Perms::READ)? as u16;
        let hi = self.raw_read8(addr.wrapping_add(1), AccessKind::Read, Perms::READ)? as u16;
        Ok(lo | (hi << 8))
    }

    pub fn read32_le(&self, addr: u32) -> Result<u32> {
        if addr % 4 != 0 {
            tracing::warn!(addr = format_args!("{addr:#010x}"), "misaligned word read");
        }
        let mut v = 0u32;
        for i in 0..4u32 {
            let byte = self.raw_read8(addr.wrapping_add(i), AccessKind::Read, Perms::READ)?;
            v |= (byte as u32) << (8 * i);
        }
        Ok(v)
    }

    /// Instruction fetch: requires Execute, and misalignment is a hard fault
    /// (unlike ordinary data loads).
    pub fn fetch_instr(&self, addr: u32) -> Result<u32> {
        if addr % 4 != 0 {
            return Err(MemoryFault::MisalignedFetch { addr });
        }

        let seg = self
            .find_segment(addr)
            .ok_or(MemoryFault::NoSegment { addr })?;

        if !seg.perms.contains(Perms::EXEC) {
            return Err(MemoryFault::PermissionDenied { addr, kind: AccessKind::Execute });
        }

        if (addr as u64) + 4 > seg.end() {
            return Err(MemoryFault::OutOfBounds { addr, len: 4 });
        }

        let off = (addr - seg.addr) as usize;
        Ok(u32::from_le_bytes(seg.data[off..off + 4].try_into().unwrap()))
    }

    fn raw_write8(&mut self, addr: u32, value: u8) -> Result<()> {
        let seg = self
            .find_segment(addr)
            .ok_or(MemoryFault::NoSegment { addr })?;

        if !seg.perms.contains(Perms::WRITE) {
            return Err(MemoryFault::PermissionDenied { addr, kind: AccessKind::Write });
        }

        let seg = self.find_segment_mut(addr).unwrap();
        let off = (addr - seg.addr) as usize;
        seg.data[off] = value;
        Ok(())
    }

    pub fn write8(&mut self, addr: u32, value: u8) -> Result<()> {
        self.raw_write8(addr, value)
    }

    pub fn write16_le(&mut self, addr: u32, value: u16) -> Result<()> {
        if addr % 2 != 0 {
            tracing::warn!(addr = format_args!("{addr:#010x}"), "misaligned half-word write");
        }
        self.raw_write8(addr, value as u8)?;
        self.raw_write8(addr.wrapping_add(1), (value >> 8) as u8)?;
        Ok(())
    }

    pub fn write32_le(&mut self, addr: u32, value: u32) -> Result<()> {
        if addr % 4 != 0 {
            tracing::warn!(addr = format_args!("{addr:#010x}"), "misaligned word write");
        }
        for i in 0..4u32 {
            self.raw_write8(addr.wrapping_add(i), (value >> (8 * i)) as u8)?;
        }
        Ok(())
    }
}
