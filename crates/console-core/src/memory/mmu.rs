//! Virtual-to-physical page translation used while the MMU is enabled.

use std::collections::HashMap;

use crate::{AccessKind, PageFault, PageFaultReason};

/// Log2 of the translation page size.
pub const PAGE_SHIFT: u32 = 12;
/// Translation page size in bytes (4 KiB).
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
/// Mask selecting the offset within a page.
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;

/// Access permissions of a mapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Protection {
    /// Loads succeed, stores fault.
    ReadOnly,
    /// Loads and stores succeed.
    ReadWrite,
}

impl Protection {
    const fn allows(self, kind: AccessKind) -> bool {
        match (self, kind) {
            (Self::ReadWrite, _) | (Self::ReadOnly, AccessKind::Read) => true,
            (Self::ReadOnly, AccessKind::Write) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageEntry {
    physical_page: u32,
    protection: Protection,
}

/// Page table mapping virtual page numbers to physical page numbers.
///
/// A one-entry cache short-circuits repeated hits on the same page.
#[derive(Debug, Clone, Default)]
pub struct TranslationTable {
    pages: HashMap<u32, PageEntry>,
    last_hit: Option<(u32, PageEntry)>,
}

impl TranslationTable {
    /// Creates an empty table; every translation faults until pages are mapped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the page containing `vaddr` onto the page containing `paddr`.
    pub fn map_page(&mut self, vaddr: u32, paddr: u32, protection: Protection) {
        let entry = PageEntry {
            physical_page: paddr >> PAGE_SHIFT,
            protection,
        };
        self.pages.insert(vaddr >> PAGE_SHIFT, entry);
        self.last_hit = None;
    }

    /// Maps `len` bytes starting at `vaddr` page by page (rounded out to whole pages).
    pub fn map_range(&mut self, vaddr: u32, paddr: u32, len: u32, protection: Protection) {
        if len == 0 {
            return;
        }
        let first = vaddr >> PAGE_SHIFT;
        let last = vaddr.saturating_add(len - 1) >> PAGE_SHIFT;
        for (index, vpage) in (first..=last).enumerate() {
            let Ok(step) = u32::try_from(index) else {
                break;
            };
            let ppage = (paddr >> PAGE_SHIFT).wrapping_add(step);
            self.map_page(vpage << PAGE_SHIFT, ppage << PAGE_SHIFT, protection);
        }
    }

    /// Removes the mapping for the page containing `vaddr`.
    pub fn unmap_page(&mut self, vaddr: u32) -> bool {
        self.last_hit = None;
        self.pages.remove(&(vaddr >> PAGE_SHIFT)).is_some()
    }

    /// Removes every mapping.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.last_hit = None;
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` when no page is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Translates `vaddr` for an access of `kind`.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] when the page is unmapped or the protection
    /// forbids the access.
    pub fn translate(&mut self, vaddr: u32, kind: AccessKind) -> Result<u32, PageFault> {
        let vpage = vaddr >> PAGE_SHIFT;
        let entry = match self.last_hit {
            Some((cached, entry)) if cached == vpage => entry,
            _ => {
                let entry = *self.pages.get(&vpage).ok_or(PageFault {
                    vaddr,
                    kind,
                    reason: PageFaultReason::NotMapped,
                })?;
                self.last_hit = Some((vpage, entry));
                entry
            }
        };

        if !entry.protection.allows(kind) {
            return Err(PageFault {
                vaddr,
                kind,
                reason: PageFaultReason::Protection,
            });
        }

        Ok((entry.physical_page << PAGE_SHIFT) | (vaddr & PAGE_OFFSET_MASK))
    }
}

#[cfg(test)]
mod tests {
    use super::{Protection, TranslationTable, PAGE_SIZE};
    use crate::{AccessKind, PageFaultReason};

    #[test]
    fn empty_table_faults_every_access() {
        let mut table = TranslationTable::new();
        let fault = table
            .translate(0x8000_0000, AccessKind::Read)
            .expect_err("nothing mapped");
        assert_eq!(fault.vaddr, 0x8000_0000);
        assert_eq!(fault.reason, PageFaultReason::NotMapped);
    }

    #[test]
    fn translation_preserves_page_offset() {
        let mut table = TranslationTable::new();
        table.map_page(0x8000_1000, 0x0004_2000, Protection::ReadWrite);

        assert_eq!(
            table.translate(0x8000_1ABC, AccessKind::Read),
            Ok(0x0004_2ABC)
        );
        assert_eq!(
            table.translate(0x8000_1FFF, AccessKind::Write),
            Ok(0x0004_2FFF)
        );
        assert!(table.translate(0x8000_2000, AccessKind::Read).is_err());
    }

    #[test]
    fn read_only_pages_fault_on_store() {
        let mut table = TranslationTable::new();
        table.map_page(0x9000_0000, 0x0000_0000, Protection::ReadOnly);

        assert!(table.translate(0x9000_0010, AccessKind::Read).is_ok());
        let fault = table
            .translate(0x9000_0010, AccessKind::Write)
            .expect_err("read-only");
        assert_eq!(fault.reason, PageFaultReason::Protection);
        assert_eq!(fault.kind, AccessKind::Write);
    }

    #[test]
    fn map_range_covers_partial_pages() {
        let mut table = TranslationTable::new();
        table.map_range(0x8000_0800, 0x0000_0800, PAGE_SIZE, Protection::ReadWrite);

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.translate(0x8000_1010, AccessKind::Read),
            Ok(0x0000_1010)
        );
    }

    #[test]
    fn unmap_invalidates_cached_translation() {
        let mut table = TranslationTable::new();
        table.map_page(0x8000_0000, 0x0000_0000, Protection::ReadWrite);
        assert!(table.translate(0x8000_0004, AccessKind::Read).is_ok());

        assert!(table.unmap_page(0x8000_0000));
        assert!(table.translate(0x8000_0004, AccessKind::Read).is_err());
        assert!(!table.unmap_page(0x8000_0000));
    }
}
