//! Guest address space: flat RAM, memory-mapped I/O and optional MMU translation.
//!
//! Every access goes through [`MemoryManager`]. With the MMU enabled the
//! address is translated first and a miss surfaces as a [`PageFault`] value.
//! The physical address then classifies as RAM (one bounds check, direct
//! big-endian load/store), a registered MMIO region (delegated to its handler)
//! or unmapped (open-bus read, ignored write).

/// MMIO region table and physical address classification.
pub mod map;
/// Page translation table.
pub mod mmu;

pub use map::{
    AccessWidth, MmioHandler, MmioMap, MmioRange, MmioRegionId, Region, SharedHandler,
};
pub use mmu::{Protection, TranslationTable, PAGE_SIZE};

use self::mmu::PAGE_OFFSET_MASK;

use crate::diag::FaultCounters;
use crate::{AccessKind, FaultCode, MemoryError, MmioError, PageFault};

/// Default RAM size (24 MiB).
pub const DEFAULT_RAM_SIZE: u32 = 0x0180_0000;

/// Value returned for unmapped reads unless a collaborator supplies another.
pub const DEFAULT_OPEN_BUS: u64 = 0;

/// Address-space parameters supplied by the platform collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MemoryConfig {
    /// Physical address of the first RAM byte.
    pub ram_base: u32,
    /// RAM size in bytes.
    pub ram_size: u32,
    /// Value read from unmapped physical addresses, truncated to the access width.
    pub open_bus: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ram_base: 0,
            ram_size: DEFAULT_RAM_SIZE,
            open_bus: DEFAULT_OPEN_BUS,
        }
    }
}

/// Guest address-space manager.
#[derive(Debug)]
pub struct MemoryManager {
    ram: Box<[u8]>,
    ram_base: u32,
    open_bus: u64,
    mmio: MmioMap,
    mmu: TranslationTable,
    mmu_enabled: bool,
    faults: FaultCounters,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryManager {
    /// Allocates zeroed RAM and an empty MMIO table. The MMU starts disabled.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        let ram_size = usize::try_from(config.ram_size).unwrap_or(usize::MAX);
        Self {
            ram: vec![0; ram_size].into_boxed_slice(),
            ram_base: config.ram_base,
            open_bus: config.open_bus,
            mmio: MmioMap::default(),
            mmu: TranslationTable::new(),
            mmu_enabled: false,
            faults: FaultCounters::default(),
        }
    }

    /// Enables or disables MMU translation for subsequent accesses.
    pub fn set_mmu_enabled(&mut self, enabled: bool) {
        self.mmu_enabled = enabled;
    }

    /// Returns `true` when accesses are translated.
    #[must_use]
    pub const fn mmu_enabled(&self) -> bool {
        self.mmu_enabled
    }

    /// Translation table consulted while the MMU is enabled.
    #[must_use]
    pub const fn translation_table(&self) -> &TranslationTable {
        &self.mmu
    }

    /// Mutable translation table, for the MMU collaborator to populate.
    pub fn translation_table_mut(&mut self) -> &mut TranslationTable {
        &mut self.mmu
    }

    /// Registers an MMIO handler for `range`.
    ///
    /// # Errors
    ///
    /// Fails when the range is empty, wraps, or overlaps RAM or another region.
    pub fn register_mmio(
        &mut self,
        name: &'static str,
        range: MmioRange,
        handler: &SharedHandler,
    ) -> Result<MmioRegionId, MmioError> {
        let ram = u32::try_from(self.ram.len())
            .ok()
            .filter(|len| *len > 0)
            .map(|len| MmioRange::new(self.ram_base, len));
        self.mmio.register(name, range, handler, ram)
    }

    /// Removes an MMIO registration.
    pub fn unregister_mmio(&mut self, id: MmioRegionId) -> bool {
        self.mmio.unregister(id)
    }

    /// Removes every MMIO registration.
    pub fn clear_mmio(&mut self) {
        self.mmio.clear();
    }

    /// Registered MMIO regions.
    #[must_use]
    pub const fn mmio(&self) -> &MmioMap {
        &self.mmio
    }

    /// Classifies a physical address.
    #[must_use]
    pub fn classify(&self, paddr: u32) -> Region {
        if let Some(offset) = self.ram_offset(paddr, 1) {
            return Region::Ram { offset };
        }
        self.mmio
            .lookup(paddr)
            .map_or(Region::Unmapped, Region::Mmio)
    }

    /// Translates `addr` when the MMU is enabled, otherwise returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] on a translation miss or protection violation.
    #[inline]
    pub fn translate(&mut self, addr: u32, kind: AccessKind) -> Result<u32, PageFault> {
        if !self.mmu_enabled {
            return Ok(addr);
        }
        self.mmu.translate(addr, kind).inspect_err(|fault| {
            self.faults.record(FaultCode::PageFault);
            log::trace!("memory: {fault}");
        })
    }

    /// Reads an 8-bit value.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[inline]
    pub fn read_u8(&mut self, addr: u32) -> Result<u8, PageFault> {
        self.load::<1>(addr, AccessWidth::Byte).map(u8::from_be_bytes)
    }

    /// Reads a big-endian 16-bit value.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[inline]
    pub fn read_u16(&mut self, addr: u32) -> Result<u16, PageFault> {
        self.load::<2>(addr, AccessWidth::Half).map(u16::from_be_bytes)
    }

    /// Reads a big-endian 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[inline]
    pub fn read_u32(&mut self, addr: u32) -> Result<u32, PageFault> {
        self.load::<4>(addr, AccessWidth::Word).map(u32::from_be_bytes)
    }

    /// Reads a big-endian 64-bit value.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[inline]
    pub fn read_u64(&mut self, addr: u32) -> Result<u64, PageFault> {
        self.load::<8>(addr, AccessWidth::Double)
            .map(u64::from_be_bytes)
    }

    /// Writes an 8-bit value.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[inline]
    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), PageFault> {
        self.store(addr, AccessWidth::Byte, value.to_be_bytes())
    }

    /// Writes a big-endian 16-bit value.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[inline]
    pub fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), PageFault> {
        self.store(addr, AccessWidth::Half, value.to_be_bytes())
    }

    /// Writes a big-endian 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[inline]
    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), PageFault> {
        self.store(addr, AccessWidth::Word, value.to_be_bytes())
    }

    /// Writes a big-endian 64-bit value.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[inline]
    pub fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), PageFault> {
        self.store(addr, AccessWidth::Double, value.to_be_bytes())
    }

    /// Width-generic read, zero-extended to 64 bits.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    pub fn read(&mut self, addr: u32, width: AccessWidth) -> Result<u64, PageFault> {
        match width {
            AccessWidth::Byte => self.read_u8(addr).map(u64::from),
            AccessWidth::Half => self.read_u16(addr).map(u64::from),
            AccessWidth::Word => self.read_u32(addr).map(u64::from),
            AccessWidth::Double => self.read_u64(addr),
        }
    }

    /// Width-generic write; `value` is truncated to `width`.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when MMU translation fails.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&mut self, addr: u32, width: AccessWidth, value: u64) -> Result<(), PageFault> {
        match width {
            AccessWidth::Byte => self.write_u8(addr, value as u8),
            AccessWidth::Half => self.write_u16(addr, value as u16),
            AccessWidth::Word => self.write_u32(addr, value as u32),
            AccessWidth::Double => self.write_u64(addr, value),
        }
    }

    /// Copies `data` into RAM at physical address `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfRange`] unless the whole window is RAM.
    pub fn copy_to_guest(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let offset = self
            .ram_offset(addr, data.len())
            .ok_or(MemoryError::OutOfRange {
                addr,
                len: data.len(),
            })?;
        self.ram[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copies RAM at physical address `addr` into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfRange`] unless the whole window is RAM.
    pub fn copy_from_guest(&self, addr: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        let offset = self
            .ram_offset(addr, out.len())
            .ok_or(MemoryError::OutOfRange {
                addr,
                len: out.len(),
            })?;
        out.copy_from_slice(&self.ram[offset..offset + out.len()]);
        Ok(())
    }

    /// Flat RAM contents.
    #[must_use]
    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Mutable flat RAM contents.
    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    /// Zeroes RAM.
    pub fn clear_ram(&mut self) {
        self.ram.fill(0);
    }

    /// Fault counters recorded by this address space.
    #[must_use]
    pub const fn faults(&self) -> &FaultCounters {
        &self.faults
    }

    /// Drops RAM, translations and MMIO registrations. Later accesses read open bus.
    pub(crate) fn release(&mut self) {
        self.mmio.clear();
        self.mmu.clear();
        self.ram = Box::default();
    }

    #[inline]
    fn ram_offset(&self, paddr: u32, len: usize) -> Option<usize> {
        let offset = paddr.wrapping_sub(self.ram_base) as usize;
        (offset.checked_add(len)? <= self.ram.len()).then_some(offset)
    }

    #[inline]
    fn load<const N: usize>(
        &mut self,
        addr: u32,
        width: AccessWidth,
    ) -> Result<[u8; N], PageFault> {
        if self.crosses_page(addr, N) {
            return self.load_split(addr);
        }
        let paddr = self.translate(addr, AccessKind::Read)?;
        let mut bytes = [0; N];
        if let Some(offset) = self.ram_offset(paddr, N) {
            bytes.copy_from_slice(&self.ram[offset..offset + N]);
        } else {
            let value = self.load_slow(paddr, width);
            bytes.copy_from_slice(&value.to_be_bytes()[8 - N..]);
        }
        Ok(bytes)
    }

    #[inline]
    fn store<const N: usize>(
        &mut self,
        addr: u32,
        width: AccessWidth,
        bytes: [u8; N],
    ) -> Result<(), PageFault> {
        if self.crosses_page(addr, N) {
            return self.store_split(addr, bytes);
        }
        let paddr = self.translate(addr, AccessKind::Write)?;
        if let Some(offset) = self.ram_offset(paddr, N) {
            self.ram[offset..offset + N].copy_from_slice(&bytes);
        } else {
            let mut wide = [0; 8];
            wide[8 - N..].copy_from_slice(&bytes);
            self.store_slow(paddr, width, u64::from_be_bytes(wide));
        }
        Ok(())
    }

    #[inline]
    const fn crosses_page(&self, addr: u32, len: usize) -> bool {
        self.mmu_enabled && (addr & PAGE_OFFSET_MASK) as usize + len > PAGE_SIZE as usize
    }

    /// Translates both pages touched by a page-crossing access before any
    /// byte moves. Returns the two physical starts and the bytes left in the
    /// first page.
    fn split_pages(
        &mut self,
        addr: u32,
        kind: AccessKind,
    ) -> Result<(u32, u32, u32), PageFault> {
        let head = PAGE_SIZE - (addr & PAGE_OFFSET_MASK);
        let first = self.translate(addr, kind)?;
        let second = self.translate(addr.wrapping_add(head), kind)?;
        Ok((first, second, head))
    }

    #[cold]
    fn load_split<const N: usize>(&mut self, addr: u32) -> Result<[u8; N], PageFault> {
        let (first, second, head) = self.split_pages(addr, AccessKind::Read)?;
        let mut bytes = [0; N];
        for (byte, step) in bytes.iter_mut().zip(0u32..) {
            let paddr = if step < head {
                first.wrapping_add(step)
            } else {
                second.wrapping_add(step - head)
            };
            *byte = match self.ram_offset(paddr, 1) {
                Some(offset) => self.ram[offset],
                None => self.load_slow(paddr, AccessWidth::Byte).to_be_bytes()[7],
            };
        }
        Ok(bytes)
    }

    #[cold]
    fn store_split<const N: usize>(
        &mut self,
        addr: u32,
        bytes: [u8; N],
    ) -> Result<(), PageFault> {
        let (first, second, head) = self.split_pages(addr, AccessKind::Write)?;
        for (byte, step) in bytes.into_iter().zip(0u32..) {
            let paddr = if step < head {
                first.wrapping_add(step)
            } else {
                second.wrapping_add(step - head)
            };
            match self.ram_offset(paddr, 1) {
                Some(offset) => self.ram[offset] = byte,
                None => self.store_slow(paddr, AccessWidth::Byte, u64::from(byte)),
            }
        }
        Ok(())
    }

    #[cold]
    fn load_slow(&mut self, paddr: u32, width: AccessWidth) -> u64 {
        if let Some(value) = self.mmio.read(paddr, width) {
            return value;
        }
        self.faults.record(FaultCode::UnmappedAccess);
        log::trace!("memory: unmapped {width:?} read at {paddr:#010x}");
        self.open_bus & width.mask()
    }

    #[cold]
    fn store_slow(&mut self, paddr: u32, width: AccessWidth, value: u64) {
        if self.mmio.write(paddr, width, value) {
            return;
        }
        self.faults.record(FaultCode::UnmappedAccess);
        log::trace!("memory: unmapped {width:?} write of {value:#x} at {paddr:#010x}");
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryConfig, MemoryManager, Region, DEFAULT_RAM_SIZE};
    use crate::{FaultCode, MemoryError};

    fn small() -> MemoryManager {
        MemoryManager::new(MemoryConfig {
            ram_base: 0,
            ram_size: 0x1000,
            open_bus: 0xA5A5_A5A5_A5A5_A5A5,
        })
    }

    #[test]
    fn default_backing_store_is_zeroed() {
        let memory = MemoryManager::default();
        assert_eq!(memory.ram().len(), DEFAULT_RAM_SIZE as usize);
        assert!(memory.ram().iter().all(|byte| *byte == 0));
        assert!(!memory.mmu_enabled());
    }

    #[test]
    fn ram_accesses_are_big_endian() {
        let mut memory = small();
        memory.write_u32(0x10, 0x1122_3344).expect("mmu off");

        assert_eq!(memory.read_u8(0x10), Ok(0x11));
        assert_eq!(memory.read_u16(0x12), Ok(0x3344));
        assert_eq!(memory.ram()[0x10..0x14], [0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn access_straddling_ram_end_reads_open_bus() {
        let mut memory = small();
        assert_eq!(memory.read_u32(0x0FFE), Ok(0xA5A5_A5A5));
        assert_eq!(memory.faults().count(FaultCode::UnmappedAccess), 1);
    }

    #[test]
    fn classify_reports_ram_offset_relative_to_base() {
        let memory = MemoryManager::new(MemoryConfig {
            ram_base: 0x1000_0000,
            ram_size: 0x100,
            open_bus: 0,
        });
        assert_eq!(memory.classify(0x1000_0010), Region::Ram { offset: 0x10 });
        assert_eq!(memory.classify(0x0FFF_FFFF), Region::Unmapped);
        assert_eq!(memory.classify(0x1000_0100), Region::Unmapped);
    }

    #[test]
    fn bulk_copy_requires_ram_window() {
        let mut memory = small();
        memory
            .copy_to_guest(0x0FF0, &[1, 2, 3, 4])
            .expect("inside ram");
        let mut out = [0; 4];
        memory.copy_from_guest(0x0FF0, &mut out).expect("inside ram");
        assert_eq!(out, [1, 2, 3, 4]);

        assert_eq!(
            memory.copy_to_guest(0x0FFE, &[0; 4]),
            Err(MemoryError::OutOfRange {
                addr: 0x0FFE,
                len: 4
            })
        );
    }

    #[test]
    fn release_turns_every_access_into_open_bus() {
        let mut memory = small();
        memory.write_u8(0, 0x42).expect("mmu off");
        memory.release();

        assert_eq!(memory.read_u8(0), Ok(0xA5));
        assert!(memory.ram().is_empty());
    }
}
