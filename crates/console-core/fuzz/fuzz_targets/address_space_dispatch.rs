#![no_main]

use std::sync::{Arc, Mutex};

use console_core::{
    AccessWidth, MemoryConfig, MemoryManager, MmioHandler, MmioRange, Protection, SharedHandler,
};
use libfuzzer_sys::fuzz_target;

const MMIO_BASE: u32 = 0x0C00_0000;

struct Echo;

impl MmioHandler for Echo {
    fn read(&mut self, addr: u32, width: AccessWidth) -> u64 {
        u64::from(addr) & width.mask()
    }

    fn write(&mut self, _addr: u32, _width: AccessWidth, _value: u64) {}
}

fn width(selector: u8) -> AccessWidth {
    match selector & 3 {
        0 => AccessWidth::Byte,
        1 => AccessWidth::Half,
        2 => AccessWidth::Word,
        _ => AccessWidth::Double,
    }
}

fuzz_target!(|data: &[u8]| {
    let mut memory = MemoryManager::new(MemoryConfig {
        ram_base: 0,
        ram_size: 0x1_0000,
        open_bus: 0xFFFF_FFFF_FFFF_FFFF,
    });
    let handler: SharedHandler = Arc::new(Mutex::new(Echo));
    let _ = memory.register_mmio("echo", MmioRange::new(MMIO_BASE, 0x100), &handler);
    memory
        .translation_table_mut()
        .map_page(0x8000_0000, 0x0000_0000, Protection::ReadWrite);

    // Each record: flags, 4 address bytes, 8 value bytes.
    for record in data.chunks_exact(13) {
        let flags = record[0];
        let addr = u32::from_be_bytes([record[1], record[2], record[3], record[4]]);
        let mut value = [0u8; 8];
        value.copy_from_slice(&record[5..]);
        let value = u64::from_be_bytes(value);
        let width = width(flags);

        memory.set_mmu_enabled(flags & 0x08 != 0);
        if flags & 0x04 == 0 {
            if let Ok(read) = memory.read(addr, width) {
                assert_eq!(read & !width.mask(), 0);
            }
        } else {
            let _ = memory.write(addr, width, value);
        }
        let _ = memory.classify(addr);
    }
});
