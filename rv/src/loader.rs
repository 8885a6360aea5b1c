//! Adapts an [`elf::LoadedElf`] into a populated [`Memory`].

use crate::memory::{Memory, MemoryFault, Perms, Segment};

/// Builds a fresh [`Memory`] from the segments an ELF file asked to be
/// loaded, and returns it alongside the entry PC.
pub fn load_into_memory(loaded: &elf::LoadedElf) -> Result<(Memory, u32), MemoryFault> {
    let mut mem = Memory::new();

    for seg in &loaded.segments {
        let perms = Perms::from(seg.perms);
        mem.add_segment(Segment::new(seg.addr, seg.size, perms))?;
        mem.write_bytes(seg.addr, &seg.data)?;
        tracing::debug!(
            addr = format_args!("{:#010x}", seg.addr),
            size = seg.size,
            "loaded segment into guest memory"
        );
    }

    Ok((mem, loaded.entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populates_memory_from_segments() {
        let loaded = elf::LoadedElf {
            entry: 0x1000,
            segments: vec![elf::LoadSegment {
                addr: 0x1000,
                size: 8,
                perms: elf::Perms::new(true, false, true),
                data: vec![1, 2, 3, 4, 0, 0, 0, 0],
            }],
        };

        let (mem, entry) = load_into_memory(&loaded).unwrap();
        assert_eq!(entry, 0x1000);
        assert_eq!(mem.read32_le(0x1000).unwrap(), 0x04030201);
    }
}
