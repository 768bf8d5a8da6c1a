//! Segment-descriptor parsing.
//!
//! The live-capture path reads segment bases, limits, and access rights
//! straight out of the GDT, converting the descriptor attribute bytes into
//! the VMCS access-rights layout.

use {
    bit_field::BitField,
    x86::{dtables::DescriptorTablePointer, segmentation::SegmentSelector},
};

/// Access-rights value marking a segment unusable (VMCS AR bit 16).
pub const UNUSABLE: u32 = 1 << 16;

/// A GDT entry unpacked into the pieces the VMCS wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

impl SegmentDescriptor {
    /// Parses the descriptor `selector` refers to out of the table at `gdtr`.
    ///
    /// Null selectors and LDT-relative selectors come back unusable. System
    /// descriptors (TSS, LDT) are 16 bytes in IA-32e mode; the upper half of
    /// their base lives in the following table slot.
    pub fn from_selector(selector: SegmentSelector, gdtr: &DescriptorTablePointer<u64>) -> Self {
        let index = (selector.bits() >> 3) as usize;

        if index == 0 || selector.bits().get_bit(2) {
            return Self { base: 0, limit: 0, access_rights: UNUSABLE };
        }

        let entry = unsafe { core::ptr::read((gdtr.base as *const u64).add(index)) };

        let mut limit = (entry.get_bits(0..16) | (entry.get_bits(48..52) << 16)) as u32;
        if entry.get_bit(55) {
            // 4 KiB granularity
            limit = (limit << 12) | 0xFFF;
        }

        let mut base = entry.get_bits(16..40) | (entry.get_bits(56..64) << 24);

        // S = 0: system descriptor, 16 bytes in IA-32e mode
        if !entry.get_bit(44) {
            let upper = unsafe { core::ptr::read((gdtr.base as *const u64).add(index + 1)) };
            base |= upper.get_bits(0..32) << 32;
        }

        // Descriptor attribute bits 47:40 and 55:52 map onto VMCS AR bits
        // 7:0 and 15:12.
        let access_rights = (entry.get_bits(40..48) | (entry.get_bits(52..56) << 12)) as u32;

        Self { base, limit, access_rights }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[u64]) -> DescriptorTablePointer<u64> {
        DescriptorTablePointer::new_from_slice(entries)
    }

    #[test]
    fn null_selector_is_unusable() {
        let gdt = [0u64, 0x00AF_9B00_0000_FFFF];
        let descriptor = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0), &table(&gdt));

        assert_eq!(descriptor.access_rights, UNUSABLE);
        assert_eq!(descriptor.base, 0);
    }

    #[test]
    fn parses_a_long_mode_code_descriptor() {
        let gdt = [0u64, 0x00AF_9B00_0000_FFFF];
        let descriptor = SegmentDescriptor::from_selector(SegmentSelector::from_raw(1 << 3), &table(&gdt));

        assert_eq!(descriptor.base, 0);
        assert_eq!(descriptor.limit, 0xFFFF_FFFF);
        assert_eq!(descriptor.access_rights, 0xA09B);
    }

    #[test]
    fn parses_a_sixteen_byte_tss_descriptor() {
        // Busy 64-bit TSS, byte-granular limit 0x67, base 0xFFFF_E000_0000_2000.
        let gdt = [0u64, 0x0000_8B00_2000_0067, 0x0000_0000_FFFF_E000];
        let descriptor = SegmentDescriptor::from_selector(SegmentSelector::from_raw(1 << 3), &table(&gdt));

        assert_eq!(descriptor.base, 0xFFFF_E000_0000_2000);
        assert_eq!(descriptor.limit, 0x67);
        assert_eq!(descriptor.access_rights, 0x8B);
    }
}
