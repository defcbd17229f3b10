//! Memory-mapped I/O region table and physical address classification.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::MmioError;

/// Width of a single guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Half,
    /// 32-bit access.
    Word,
    /// 64-bit access.
    Double,
}

impl AccessWidth {
    /// Number of bytes touched by the access.
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Half => 2,
            Self::Word => 4,
            Self::Double => 8,
        }
    }

    /// Mask selecting the low `bytes()` bytes of a 64-bit value.
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Self::Byte => 0xFF,
            Self::Half => 0xFFFF,
            Self::Word => 0xFFFF_FFFF,
            Self::Double => u64::MAX,
        }
    }
}

/// Device register handler invoked for accesses inside a registered region.
///
/// `addr` is the full physical address of the access. Read results are
/// truncated to the access width by the caller.
pub trait MmioHandler: Send {
    /// Reads a register value.
    fn read(&mut self, addr: u32, width: AccessWidth) -> u64;

    /// Writes a register value.
    fn write(&mut self, addr: u32, width: AccessWidth, value: u64);
}

/// Shared, lockable handle to a device's register state.
///
/// The owning manager keeps the strong reference; the region table only
/// keeps a [`Weak`] one.
pub type SharedHandler = Arc<Mutex<dyn MmioHandler>>;

/// Contiguous guest physical range `start..start + len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MmioRange {
    /// Inclusive start address.
    pub start: u32,
    /// Length in bytes.
    pub len: u32,
}

impl MmioRange {
    /// Creates a range from a start address and a byte length.
    #[must_use]
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// Inclusive end address, or `None` when the range is empty or wraps.
    #[must_use]
    pub const fn end(self) -> Option<u32> {
        if self.len == 0 {
            return None;
        }
        self.start.checked_add(self.len - 1)
    }

    /// Returns `true` when `addr` lies inside the range.
    #[must_use]
    pub const fn contains(self, addr: u32) -> bool {
        addr >= self.start && addr - self.start < self.len
    }

    const fn intersects(self, start: u32, end: u32) -> bool {
        match self.end() {
            Some(own_end) => self.start <= end && start <= own_end,
            None => false,
        }
    }
}

/// Identifier returned by a successful MMIO registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MmioRegionId(u32);

/// Classification of a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Backed by RAM at `offset` bytes into the flat buffer.
    Ram {
        /// Byte offset into RAM.
        offset: usize,
    },
    /// Inside a registered MMIO region.
    Mmio(MmioRegionId),
    /// Neither RAM nor MMIO.
    Unmapped,
}

struct MmioRegion {
    id: MmioRegionId,
    name: &'static str,
    range: MmioRange,
    handler: Weak<Mutex<dyn MmioHandler>>,
}

/// Sorted, non-overlapping table of MMIO regions.
#[derive(Default)]
pub struct MmioMap {
    regions: Vec<MmioRegion>,
    next_id: u32,
}

impl std::fmt::Debug for MmioMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.regions
                    .iter()
                    .map(|region| (region.name, region.range.start, region.range.len)),
            )
            .finish()
    }
}

impl MmioMap {
    /// Registers `handler` for `range`.
    ///
    /// `reserved` is a range no region may overlap (RAM).
    ///
    /// # Errors
    ///
    /// Returns [`MmioError::InvalidRange`] for empty or wrapping ranges and
    /// [`MmioError::Overlap`] when the range collides with `reserved` or an
    /// existing region.
    pub fn register(
        &mut self,
        name: &'static str,
        range: MmioRange,
        handler: &SharedHandler,
        reserved: Option<MmioRange>,
    ) -> Result<MmioRegionId, MmioError> {
        let end = range.end().ok_or(MmioError::InvalidRange {
            start: range.start,
            len: range.len,
        })?;

        if reserved.is_some_and(|ram| ram.intersects(range.start, end)) {
            return Err(MmioError::Overlap {
                start: range.start,
                end,
                existing: "ram",
            });
        }

        if let Some(existing) = self
            .regions
            .iter()
            .find(|region| region.range.intersects(range.start, end))
        {
            return Err(MmioError::Overlap {
                start: range.start,
                end,
                existing: existing.name,
            });
        }

        let id = MmioRegionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let index = self
            .regions
            .partition_point(|region| region.range.start < range.start);
        self.regions.insert(
            index,
            MmioRegion {
                id,
                name,
                range,
                handler: Arc::downgrade(handler),
            },
        );
        log::debug!(
            "mmio: registered {name} at {:#010x}..={end:#010x}",
            range.start
        );
        Ok(id)
    }

    /// Removes a region. Returns `false` when `id` is not registered.
    pub fn unregister(&mut self, id: MmioRegionId) -> bool {
        let before = self.regions.len();
        self.regions.retain(|region| region.id != id);
        before != self.regions.len()
    }

    /// Drops every registration.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Number of registered regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns `true` when no region is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Finds the region containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: u32) -> Option<MmioRegionId> {
        self.find(addr).map(|region| region.id)
    }

    /// Returns the name a region was registered under.
    #[must_use]
    pub fn name(&self, id: MmioRegionId) -> Option<&'static str> {
        self.regions
            .iter()
            .find(|region| region.id == id)
            .map(|region| region.name)
    }

    /// Dispatches a read. `None` means no live handler covers `addr`.
    pub fn read(&self, addr: u32, width: AccessWidth) -> Option<u64> {
        let handler = self.find(addr)?.handler.upgrade()?;
        let mut device = handler.lock().unwrap_or_else(PoisonError::into_inner);
        Some(device.read(addr, width) & width.mask())
    }

    /// Dispatches a write. Returns `false` when no live handler covers `addr`.
    pub fn write(&self, addr: u32, width: AccessWidth, value: u64) -> bool {
        let Some(handler) = self.find(addr).and_then(|region| region.handler.upgrade()) else {
            return false;
        };
        let mut device = handler.lock().unwrap_or_else(PoisonError::into_inner);
        device.write(addr, width, value & width.mask());
        true
    }

    fn find(&self, addr: u32) -> Option<&MmioRegion> {
        let index = self
            .regions
            .partition_point(|region| region.range.start <= addr);
        let candidate = self.regions.get(index.checked_sub(1)?)?;
        candidate.range.contains(addr).then_some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{AccessWidth, MmioHandler, MmioMap, MmioRange, SharedHandler};
    use crate::MmioError;

    struct Latch {
        last_write: Option<(u32, u64)>,
        value: u64,
    }

    impl MmioHandler for Latch {
        fn read(&mut self, _addr: u32, _width: AccessWidth) -> u64 {
            self.value
        }

        fn write(&mut self, addr: u32, _width: AccessWidth, value: u64) {
            self.last_write = Some((addr, value));
        }
    }

    fn latch(value: u64) -> SharedHandler {
        Arc::new(Mutex::new(Latch {
            last_write: None,
            value,
        }))
    }

    #[test]
    fn range_end_rejects_empty_and_wrapping() {
        assert_eq!(MmioRange::new(0x10, 0).end(), None);
        assert_eq!(MmioRange::new(u32::MAX, 2).end(), None);
        assert_eq!(MmioRange::new(u32::MAX, 1).end(), Some(u32::MAX));
        assert_eq!(MmioRange::new(0x1000, 0x10).end(), Some(0x100F));
    }

    #[test]
    fn lookup_finds_region_at_boundaries_only() {
        let mut map = MmioMap::default();
        let handler = latch(0);
        let id = map
            .register("vi", MmioRange::new(0x0C00_2000, 0x100), &handler, None)
            .expect("free range");

        assert_eq!(map.lookup(0x0C00_1FFF), None);
        assert_eq!(map.lookup(0x0C00_2000), Some(id));
        assert_eq!(map.lookup(0x0C00_20FF), Some(id));
        assert_eq!(map.lookup(0x0C00_2100), None);
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let mut map = MmioMap::default();
        let handler = latch(0);
        map.register("pi", MmioRange::new(0x0C00_3000, 0x100), &handler, None)
            .expect("free range");

        let err = map
            .register("dsp", MmioRange::new(0x0C00_30F0, 0x20), &handler, None)
            .expect_err("overlap");
        assert!(matches!(err, MmioError::Overlap { existing: "pi", .. }));
    }

    #[test]
    fn ram_overlap_is_rejected() {
        let mut map = MmioMap::default();
        let handler = latch(0);
        let err = map
            .register(
                "bad",
                MmioRange::new(0x0000_1000, 0x10),
                &handler,
                Some(MmioRange::new(0, 0x0180_0000)),
            )
            .expect_err("inside ram");
        assert!(matches!(err, MmioError::Overlap { existing: "ram", .. }));
    }

    #[test]
    fn reads_are_truncated_to_width() {
        let mut map = MmioMap::default();
        let handler = latch(0x1122_3344_5566_7788);
        map.register("si", MmioRange::new(0x0C00_6400, 0x100), &handler, None)
            .expect("free range");

        assert_eq!(map.read(0x0C00_6400, AccessWidth::Byte), Some(0x88));
        assert_eq!(map.read(0x0C00_6400, AccessWidth::Half), Some(0x7788));
        assert_eq!(map.read(0x0C00_6400, AccessWidth::Word), Some(0x5566_7788));
        assert_eq!(
            map.read(0x0C00_6400, AccessWidth::Double),
            Some(0x1122_3344_5566_7788)
        );
    }

    #[test]
    fn dropped_handler_behaves_as_unmapped() {
        let mut map = MmioMap::default();
        let handler = latch(7);
        map.register("exi", MmioRange::new(0x0C00_6800, 0x40), &handler, None)
            .expect("free range");
        drop(handler);

        assert_eq!(map.read(0x0C00_6800, AccessWidth::Word), None);
        assert!(!map.write(0x0C00_6800, AccessWidth::Word, 1));
    }

    #[test]
    fn unregister_frees_the_range() {
        let mut map = MmioMap::default();
        let handler = latch(0);
        let id = map
            .register("ai", MmioRange::new(0x0C00_6C00, 0x20), &handler, None)
            .expect("free range");

        assert!(map.unregister(id));
        assert!(!map.unregister(id));
        assert!(map.is_empty());
        map.register("ai", MmioRange::new(0x0C00_6C00, 0x20), &handler, None)
            .expect("range is free again");
    }
}
