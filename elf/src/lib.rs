//! Parsing and validation for 32-bit little-endian RISC-V ELF executables.
//!
//! This only understands enough of the ELF32 format to load a static
//! `ET_EXEC` binary: the file header, the program header table, and
//! `PT_LOAD` segments. Section headers are located only to validate their
//! entry size; they are never read.

use thiserror::Error;

const EI_MAG0: usize = 0;
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const ELFCLASS32: u8 = 1;
const EI_DATA: usize = 5;
const ELFDATA2LSB: u8 = 1;
const EI_VERSION: usize = 6;
const EI_OSABI: usize = 7;
const ELFOSABI_NONE: u8 = 0;
const EI_ABIVERSION: usize = 8;
const EV_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 0xf3;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

/// Everything that can go wrong parsing or validating an ELF file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ElfError {
    #[error("not an ELF binary (file too small)")]
    FileTooSmall,
    #[error("not an ELF binary (bad magic number)")]
    InvalidMagic,
    #[error("sorry, this emulator only supports 32-bit executables")]
    UnsupportedBits,
    #[error("sorry, this emulator only supports little-endian")]
    UnsupportedEndianness,
    #[error("invalid ELF version")]
    InvalidElfVersion,
    #[error("invalid ELF header size")]
    InvalidHeaderSize,
    #[error("invalid program header size")]
    InvalidProgramHeaderSize,
    #[error("invalid section header size")]
    InvalidSectionHeaderSize,
    #[error("unsupported ELF type (must be ET_EXEC)")]
    UnsupportedElfType,
    #[error("sorry, this emulator only supports RISC-V")]
    UnsupportedMachineType,
    #[error("p_vaddr is not aligned to p_align in program header {0}")]
    UnalignedVAddr(usize),
    #[error("p_memsz is smaller than p_filesz in program header {0}")]
    InvalidMemSize(usize),
    #[error("file data exceeds ELF file size in program header {0}")]
    ProgramDataFileOutOfBounds(usize),
    #[error("virtual address range exceeds target memory bounds in program header {0}")]
    ProgramDataVAddrOutOfBounds(usize),
}

type Result<T> = std::result::Result<T, ElfError>;

/// Read/write/execute permission bits for a loaded segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perms(u8);

impl Perms {
    const READ: u8 = 0b001;
    const WRITE: u8 = 0b010;
    const EXEC: u8 = 0b100;

    /// Builds a permission set directly from R/W/X flags (mainly useful to
    /// callers building [`LoadSegment`]s outside of [`load`], e.g. tests).
    pub fn new(read: bool, write: bool, exec: bool) -> Self {
        let mut bits = 0u8;
        if read {
            bits |= Self::READ;
        }
        if write {
            bits |= Self::WRITE;
        }
        if exec {
            bits |= Self::EXEC;
        }
        Perms(bits)
    }

    pub fn read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn exec(self) -> bool {
        self.0 & Self::EXEC != 0
    }

    fn from_p_flags(p_flags: u32) -> Self {
        let mut bits = 0u8;
        if p_flags & PF_R != 0 {
            bits |= Self::READ;
        }
        if p_flags & PF_W != 0 {
            bits |= Self::WRITE;
        }
        if p_flags & PF_X != 0 {
            bits |= Self::READ | Self::EXEC;
        }
        Perms(bits)
    }
}

impl std::fmt::Debug for Perms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = if self.read() { 'R' } else { '-' };
        let w = if self.write() { 'W' } else { '-' };
        let x = if self.exec() { 'X' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// A single `PT_LOAD` segment, with its file contents already copied in and
/// its BSS tail already zero-padded out to `size` bytes.
pub struct LoadSegment {
    pub addr: u32,
    pub size: u32,
    pub perms: Perms,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for LoadSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadSegment")
            .field("addr", &format_args!("{:#010x}", self.addr))
            .field("size", &self.size)
            .field("perms", &self.perms)
            .finish()
    }
}

/// The result of loading an ELF file: where execution starts, and the
/// segments to populate guest memory with.
#[derive(Debug)]
pub struct LoadedElf {
    pub entry: u32,
    pub segments: Vec<LoadSegment>,
}

fn u32_le(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn u16_le(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

struct Ehdr {
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
}

struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

fn parse_ehdr(data: &[u8]) -> Result<Ehdr> {
    if data.len() < EHDR_SIZE {
        return Err(ElfError::FileTooSmall);
    }

    if data[EI_MAG0..EI_MAG0 + 4] != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }

    if data[EI_CLASS] != ELFCLASS32 {
        return Err(ElfError::UnsupportedBits);
    }

    if data[EI_DATA] != ELFDATA2LSB {
        return Err(ElfError::UnsupportedEndianness);
    }

    let e_type = u16_le(data, 16);
    let e_machine = u16_le(data, 18);
    let e_version = u32_le(data, 20);
    let e_entry = u32_le(data, 24);
    let e_phoff = u32_le(data, 28);
    let e_flags = u32_le(data, 36);
    let e_ehsize = u16_le(data, 40);
    let e_phentsize = u16_le(data, 42);
    let e_phnum = u16_le(data, 44);
    let e_shentsize = u16_le(data, 46);

    if e_ehsize as usize != EHDR_SIZE {
        return Err(ElfError::InvalidHeaderSize);
    }

    if e_phentsize as usize != PHDR_SIZE {
        return Err(ElfError::InvalidProgramHeaderSize);
    }

    if e_shentsize as usize != SHDR_SIZE {
        return Err(ElfError::InvalidSectionHeaderSize);
    }

    if data[EI_VERSION] != EV_CURRENT {
        return Err(ElfError::InvalidElfVersion);
    }

    if data[EI_OSABI] != ELFOSABI_NONE {
        tracing::warn!("unsupported ELF OSABI (0x{:02x})", data[EI_OSABI]);
    }

    if data[EI_ABIVERSION] != 0 {
        tracing::warn!("unsupported ELF ABIVERSION (0x{:02x})", data[EI_ABIVERSION]);
    }

    if e_type != ET_EXEC {
        return Err(ElfError::UnsupportedElfType);
    }

    if e_machine != EM_RISCV {
        return Err(ElfError::UnsupportedMachineType);
    }

    if e_version != EV_CURRENT as u32 {
        return Err(ElfError::InvalidElfVersion);
    }

    if e_flags != 0 {
        tracing::warn!("ignoring non-zero flags in ELF header");
    }

    let phdrs_end = e_phoff as usize + e_phnum as usize * e_phentsize as usize;
    if data.len() < phdrs_end {
        return Err(ElfError::FileTooSmall);
    }

    Ok(Ehdr {
        e_type,
        e_machine,
        e_version,
        e_entry,
        e_phoff,
        e_flags,
        e_ehsize,
        e_phentsize,
        e_phnum,
        e_shentsize,
    })
}

fn parse_phdr(data: &[u8], off: usize) -> Phdr {
    Phdr {
        p_type: u32_le(data, off),
        p_offset: u32_le(data, off + 4),
        p_vaddr: u32_le(data, off + 8),
        p_paddr: u32_le(data, off + 12),
        p_filesz: u32_le(data, off + 16),
        p_memsz: u32_le(data, off + 20),
        p_flags: u32_le(data, off + 24),
        p_align: u32_le(data, off + 28),
    }
}

fn is_pow2(v: u32) -> bool {
    v != 0 && v & (v - 1) == 0
}

fn segment_from_phdr(phdr: &Phdr, phdr_n: usize, data: &[u8]) -> Result<LoadSegment> {
    tracing::debug!(phdr_n, "loading program header into memory");

    if phdr.p_align > 1 {
        if !is_pow2(phdr.p_align) {
            tracing::warn!(phdr_n, "p_align is not a power of 2");
        }
        if phdr.p_vaddr % phdr.p_align != phdr.p_offset % phdr.p_align {
            return Err(ElfError::UnalignedVAddr(phdr_n));
        }
    }

    if phdr.p_paddr != phdr.p_vaddr {
        tracing::warn!(
            phdr_n,
            p_paddr = format_args!("{:#x}", phdr.p_paddr),
            "ignoring p_paddr value different from p_vaddr"
        );
    }

    if phdr.p_memsz < phdr.p_filesz {
        return Err(ElfError::InvalidMemSize(phdr_n));
    }

    let file_end = phdr.p_offset as u64 + phdr.p_filesz as u64;
    if file_end > data.len() as u64 {
        return Err(ElfError::ProgramDataFileOutOfBounds(phdr_n));
    }

    let vaddr_end = phdr.p_vaddr as u64 + phdr.p_memsz as u64;
    if vaddr_end > u32::MAX as u64 + 1 {
        return Err(ElfError::ProgramDataVAddrOutOfBounds(phdr_n));
    }

    let perms = Perms::from_p_flags(phdr.p_flags);

    let mut seg_data = vec![0u8; phdr.p_memsz as usize];
    let src = &data[phdr.p_offset as usize..phdr.p_offset as usize + phdr.p_filesz as usize];
    seg_data[..phdr.p_filesz as usize].copy_from_slice(src);

    Ok(LoadSegment {
        addr: phdr.p_vaddr,
        size: phdr.p_memsz,
        perms,
        data: seg_data,
    })
}

/// Parses and validates an ELF32-LE RISC-V `ET_EXEC` binary out of `data`,
/// and builds the list of segments a memory model should be populated with.
pub fn load(data: &[u8]) -> Result<LoadedElf> {
    let ehdr = parse_ehdr(data)?;

    let mut segments = Vec::new();
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        let phdr = parse_phdr(data, off);

        if phdr.p_type != PT_LOAD {
            continue;
        }

        segments.push(segment_from_phdr(&phdr, i, data)?);
    }

    Ok(LoadedElf {
        entry: ehdr.e_entry,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_elf(phdrs: &[(u32, u32, u32, u32, u32, u32, u32)], body: &[u8]) -> Vec<u8> {
        // phdrs: (p_type, p_offset, p_vaddr, p_paddr, p_filesz, p_memsz, p_flags)
        let phoff = EHDR_SIZE;
        let phnum = phdrs.len();
        let body_off = phoff + phnum * PHDR_SIZE;

        let mut buf = vec![0u8; body_off + body.len()];

        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[EI_CLASS] = ELFCLASS32;
        buf[EI_DATA] = ELFDATA2LSB;
        buf[EI_VERSION] = EV_CURRENT;
        buf[EI_OSABI] = ELFOSABI_NONE;
        buf[EI_ABIVERSION] = 0;

        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        buf[20..24].copy_from_slice(&(EV_CURRENT as u32).to_le_bytes());
        buf[24..28].copy_from_slice(&0x1000u32.to_le_bytes()); // e_entry
        buf[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
        buf[36..40].copy_from_slice(&0u32.to_le_bytes()); // e_flags
        buf[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        buf[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        buf[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());
        buf[46..48].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());

        for (i, &(p_type, p_offset, p_vaddr, p_paddr, p_filesz, p_memsz, p_flags)) in
            phdrs.iter().enumerate()
        {
            let o = phoff + i * PHDR_SIZE;
            buf[o..o + 4].copy_from_slice(&p_type.to_le_bytes());
            buf[o + 4..o + 8].copy_from_slice(&p_offset.to_le_bytes());
            buf[o + 8..o + 12].copy_from_slice(&p_vaddr.to_le_bytes());
            buf[o + 12..o + 16].copy_from_slice(&p_paddr.to_le_bytes());
            buf[o + 16..o + 20].copy_from_slice(&p_filesz.to_le_bytes());
            buf[o + 20..o + 24].copy_from_slice(&p_memsz.to_le_bytes());
            buf[o + 24..o + 28].copy_from_slice(&p_flags.to_le_bytes());
            buf[o + 28..o + 32].copy_from_slice(&1u32.to_le_bytes()); // p_align
        }

        buf[body_off..].copy_from_slice(body);
        buf
    }

    #[test]
    fn rejects_truncated_file() {
        let data = vec![0u8; 10];
        assert_eq!(load(&data), Err(ElfError::FileTooSmall));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_elf(&[], &[]);
        data[0] = 0;
        assert_eq!(load(&data), Err(ElfError::InvalidMagic));
    }

    #[test]
    fn loads_single_text_segment_with_bss() {
        let body = [0xaa, 0xbb, 0xcc, 0xdd];
        let data = build_elf(
            &[(PT_LOAD, EHDR_SIZE as u32 + PHDR_SIZE as u32, 0x1000, 0x1000, 4, 8, PF_R | PF_X)],
            &body,
        );

        let loaded = load(&data).unwrap();
        assert_eq!(loaded.entry, 0x1000);
        assert_eq!(loaded.segments.len(), 1);

        let seg = &loaded.segments[0];
        assert_eq!(seg.addr, 0x1000);
        assert_eq!(seg.size, 8);
        assert!(seg.perms.read());
        assert!(seg.perms.exec());
        assert!(!seg.perms.write());
        assert_eq!(&seg.data[..4], &body);
        assert_eq!(&seg.data[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn ignores_non_load_segments() {
        let data = build_elf(&[(0x6474e551, 0, 0, 0, 0, 0, 0)], &[]);
        let loaded = load(&data).unwrap();
        assert!(loaded.segments.is_empty());
    }

    #[test]
    fn rejects_memsz_smaller_than_filesz() {
        let body = [1, 2, 3, 4];
        let data = build_elf(
            &[(PT_LOAD, EHDR_SIZE as u32 + PHDR_SIZE as u32, 0x1000, 0x1000, 4, 2, PF_R)],
            &body,
        );
        assert_eq!(load(&data), Err(ElfError::InvalidMemSize(0)));
    }

    #[test]
    fn rejects_file_offset_out_of_bounds() {
        let data = build_elf(&[(PT_LOAD, 10_000, 0x1000, 0x1000, 4, 4, PF_R)], &[]);
        assert_eq!(load(&data), Err(ElfError::ProgramDataFileOutOfBounds(0)));
    }
}
