//! Memory subsystem for the MERA-400
//!
//! Physical memory is organized as up to 16 modules of up to 8 segments,
//! each segment holding 4096 16-bit words. The CPU and the I/O channels see
//! 16 address-space blocks (NB values); each block is divided into 16
//! sub-blocks of 4096 words. A two-level map associates (block, sub-block)
//! with a concrete physical segment, which makes translation O(1) and allows
//! one segment to appear under several blocks (aliasing is legal).
//!
//! Accesses that miss the map answer with [`MemFault`]; the CPU turns that
//! into the no-memory interrupt, I/O channels turn it into their own error
//! interrupts.
//!
//! With the "mega boot" option the machine starts executing at 0xF000 from
//! a boot segment pre-mapped at block 0, sub-block 15.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Number of physical memory modules
pub const MODULE_MAX: usize = 16;
/// Segments per module
pub const SEGMENT_MAX: usize = 8;
/// Words per segment
pub const SEGMENT_SIZE: usize = 4096;
/// Number of address-space blocks (NB values)
pub const BLOCK_MAX: usize = 16;
/// Sub-blocks per block
pub const SUBBLOCK_MAX: usize = 16;

/// Address where execution starts when mega boot is enabled
pub const MEGA_BOOT_IC: u16 = 0xF000;

/// Answer missing from memory (no mapping at the given address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault;

/// Configuration-time memory errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("no such memory module: {0}")]
    BadModule(usize),
    #[error("no such segment: {0}")]
    BadSegment(usize),
    #[error("no such block: {0}")]
    BadBlock(usize),
    #[error("module {0} has too many segments: {1} (max {SEGMENT_MAX})")]
    TooManySegments(usize, usize),
}

/// One 4 Kiword physical segment.
///
/// Words are atomic so channel worker threads can access memory through the
/// same API as the CPU thread.
pub struct Segment {
    words: Box<[AtomicU16]>,
}

impl Segment {
    fn new() -> Arc<Self> {
        let mut words = Vec::with_capacity(SEGMENT_SIZE);
        words.resize_with(SEGMENT_SIZE, || AtomicU16::new(0));
        Arc::new(Self {
            words: words.into_boxed_slice(),
        })
    }

    #[inline]
    fn read(&self, offset: usize) -> u16 {
        self.words[offset].load(Ordering::Relaxed)
    }

    #[inline]
    fn write(&self, offset: usize, val: u16) {
        self.words[offset].store(val, Ordering::Relaxed);
    }
}

type BlockMap = [[Option<Arc<Segment>>; SUBBLOCK_MAX]; BLOCK_MAX];

/// The memory subsystem: physical modules plus the block map.
pub struct Memory {
    modules: [Vec<Arc<Segment>>; MODULE_MAX],
    map: RwLock<BlockMap>,
    mega_boot: bool,
}

impl Memory {
    /// Build physical modules from the configuration and install the
    /// hardwired boot mapping (module 0 segment 0 at block 0 sub-block 0;
    /// the top segment of module 0 at block 0 sub-block 15 for mega boot).
    pub fn new(cfg: &crate::cfg::MemConfig) -> Result<Self, MemError> {
        let mut mem = Self {
            modules: Default::default(),
            map: RwLock::new(Default::default()),
            mega_boot: cfg.mega_boot,
        };
        for (module, &segments) in cfg.modules.iter().enumerate() {
            if segments > 0 {
                mem.add_module(module, segments as usize)?;
            }
        }
        mem.install_boot_map();
        Ok(mem)
    }

    fn add_module(&mut self, module: usize, segments: usize) -> Result<(), MemError> {
        if module >= MODULE_MAX {
            return Err(MemError::BadModule(module));
        }
        if segments > SEGMENT_MAX {
            return Err(MemError::TooManySegments(module, segments));
        }
        self.modules[module] = (0..segments).map(|_| Segment::new()).collect();
        log::debug!(target: "mem", "module {} configured: {} segments", module, segments);
        Ok(())
    }

    fn install_boot_map(&self) {
        let mut map = self.map.write().unwrap();
        if let Some(seg) = self.modules[0].first() {
            map[0][0] = Some(Arc::clone(seg));
        }
        if self.mega_boot {
            if let Some(seg) = self.modules[0].last() {
                map[0][SUBBLOCK_MAX - 1] = Some(Arc::clone(seg));
            }
        }
    }

    /// Whether the machine boots from the top segment (IC = 0xF000).
    pub fn mega_boot(&self) -> bool {
        self.mega_boot
    }

    /// Install a mapping: (block, sub-block) -> (module, segment).
    pub fn add_map(
        &self,
        block: usize,
        sub: usize,
        module: usize,
        segment: usize,
    ) -> Result<(), MemError> {
        if block >= BLOCK_MAX || sub >= SUBBLOCK_MAX {
            return Err(MemError::BadBlock(block));
        }
        let seg = self
            .modules
            .get(module)
            .ok_or(MemError::BadModule(module))?
            .get(segment)
            .ok_or(MemError::BadSegment(segment))?;
        self.map.write().unwrap()[block][sub] = Some(Arc::clone(seg));
        log::debug!(
            target: "mem",
            "map: block {}:{} -> module {} segment {}",
            block, sub, module, segment
        );
        Ok(())
    }

    /// Drop all mappings and reinstall the hardwired boot map.
    pub fn remove_maps(&self) {
        {
            let mut map = self.map.write().unwrap();
            for block in map.iter_mut() {
                for sub in block.iter_mut() {
                    *sub = None;
                }
            }
        }
        self.install_boot_map();
    }

    /// Memory reset on master clear: user mappings go away, contents stay.
    pub fn reset(&self) {
        self.remove_maps();
    }

    #[inline]
    fn segment(&self, block: u16, addr: u16) -> Result<Arc<Segment>, MemFault> {
        let map = self.map.read().unwrap();
        map[(block as usize) & (BLOCK_MAX - 1)][(addr >> 12) as usize]
            .as_ref()
            .map(Arc::clone)
            .ok_or(MemFault)
    }

    /// Read one word. Block 0 means absolute addressing.
    pub fn get(&self, block: u16, addr: u16) -> Result<u16, MemFault> {
        Ok(self.segment(block, addr)?.read((addr & 0xFFF) as usize))
    }

    /// Write one word.
    pub fn put(&self, block: u16, addr: u16, val: u16) -> Result<(), MemFault> {
        self.segment(block, addr)?.write((addr & 0xFFF) as usize, val);
        Ok(())
    }

    /// Bulk read. Stops at the first unmapped word; returns the number of
    /// words transferred.
    pub fn mget(&self, block: u16, addr: u16, buf: &mut [u16]) -> usize {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.get(block, addr.wrapping_add(i as u16)) {
                Ok(w) => *slot = w,
                Err(_) => return i,
            }
        }
        buf.len()
    }

    /// Bulk write. Stops at the first unmapped word; returns the number of
    /// words transferred.
    pub fn mput(&self, block: u16, addr: u16, buf: &[u16]) -> usize {
        for (i, &w) in buf.iter().enumerate() {
            if self.put(block, addr.wrapping_add(i as u16), w).is_err() {
                return i;
            }
        }
        buf.len()
    }

    /// Read one byte. `byte_addr` is a 17-bit quantity: the word lives at
    /// `byte_addr >> 1`, bit 0 selects the half (0 = left/high byte).
    pub fn get_byte(&self, block: u16, byte_addr: u32) -> Result<u8, MemFault> {
        let word = self.get(block, (byte_addr >> 1) as u16)?;
        if byte_addr & 1 == 0 {
            Ok((word >> 8) as u8)
        } else {
            Ok(word as u8)
        }
    }

    /// Write one byte, leaving the other half of the word intact.
    pub fn put_byte(&self, block: u16, byte_addr: u32, val: u8) -> Result<(), MemFault> {
        let addr = (byte_addr >> 1) as u16;
        let word = self.get(block, addr)?;
        let word = if byte_addr & 1 == 0 {
            (word & 0x00FF) | ((val as u16) << 8)
        } else {
            (word & 0xFF00) | val as u16
        };
        self.put(block, addr, word)
    }

    /// Load a binary image (a stream of big-endian 16-bit words) at address
    /// 0 of the given block. Returns the number of words written; the load
    /// stops at the first unmapped word.
    pub fn load_image(&self, block: u16, data: &[u8]) -> usize {
        let mut words = 0;
        for (i, pair) in data.chunks(2).enumerate() {
            let word = match pair {
                [hi, lo] => u16::from_be_bytes([*hi, *lo]),
                [hi] => (*hi as u16) << 8,
                _ => unreachable!(),
            };
            if self.put(block, i as u16, word).is_err() {
                break;
            }
            words += 1;
        }
        log::debug!(target: "mem", "image loaded: {} words @ block {}", words, block);
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::MemConfig;
    use proptest::prelude::*;

    fn mem() -> Memory {
        Memory::new(&MemConfig::default()).unwrap()
    }

    #[test]
    fn test_boot_map() {
        let m = mem();
        // block 0 sub-block 0 is hardwired to module 0 segment 0
        assert!(m.put(0, 0x0123, 0xBEEF).is_ok());
        assert_eq!(m.get(0, 0x0123), Ok(0xBEEF));
        // other sub-blocks of block 0 start unmapped
        assert_eq!(m.get(0, 0x1000), Err(MemFault));
    }

    #[test]
    fn test_mega_boot_map() {
        let cfg = MemConfig {
            mega_boot: true,
            ..MemConfig::default()
        };
        let m = Memory::new(&cfg).unwrap();
        assert!(m.mega_boot());
        // the boot segment answers at 0xF000
        assert!(m.put(0, MEGA_BOOT_IC, 0x1234).is_ok());
        assert_eq!(m.get(0, MEGA_BOOT_IC), Ok(0x1234));
    }

    #[test]
    fn test_map_and_fault() {
        let m = mem();
        assert_eq!(m.get(1, 0x0010), Err(MemFault));
        m.add_map(1, 0, 0, 1).unwrap();
        assert!(m.put(1, 0x0010, 0xABCD).is_ok());
        assert_eq!(m.get(1, 0x0010), Ok(0xABCD));
        // offset 0x1000 is sub-block 1, still unmapped
        assert_eq!(m.get(1, 0x1010), Err(MemFault));
    }

    #[test]
    fn test_aliasing() {
        let m = mem();
        m.add_map(2, 0, 0, 3).unwrap();
        m.add_map(5, 4, 0, 3).unwrap();
        m.put(2, 0x0040, 0x5555).unwrap();
        assert_eq!(m.get(5, 0x4040), Ok(0x5555));
    }

    #[test]
    fn test_remove_maps_keeps_boot() {
        let m = mem();
        m.add_map(1, 0, 0, 1).unwrap();
        m.put(0, 7, 0x0707).unwrap();
        m.remove_maps();
        assert_eq!(m.get(1, 0), Err(MemFault));
        // hardwired map reinstalled, contents preserved
        assert_eq!(m.get(0, 7), Ok(0x0707));
    }

    #[test]
    fn test_bad_map_args() {
        let m = mem();
        assert_eq!(m.add_map(16, 0, 0, 0), Err(MemError::BadBlock(16)));
        assert_eq!(m.add_map(1, 0, 0, 8), Err(MemError::BadSegment(8)));
        assert_eq!(m.add_map(1, 0, 9, 0), Err(MemError::BadModule(9)));
    }

    #[test]
    fn test_mget_mput_stop_at_fault() {
        let m = mem();
        // last two words of the mapped sub-block, then a hole
        let addr = 0x0FFE;
        assert_eq!(m.mput(0, addr, &[1, 2, 3, 4]), 2);
        let mut buf = [0u16; 4];
        assert_eq!(m.mget(0, addr, &mut buf), 2);
        assert_eq!(&buf[..2], &[1, 2]);
    }

    #[test]
    fn test_byte_access() {
        let m = mem();
        m.put(0, 0x0020, 0xAB12).unwrap();
        assert_eq!(m.get_byte(0, 0x0040), Ok(0xAB));
        assert_eq!(m.get_byte(0, 0x0041), Ok(0x12));
        m.put_byte(0, 0x0040, 0xCD).unwrap();
        assert_eq!(m.get(0, 0x0020), Ok(0xCD12));
        m.put_byte(0, 0x0041, 0x34).unwrap();
        assert_eq!(m.get(0, 0x0020), Ok(0xCD34));
    }

    #[test]
    fn test_load_image() {
        let m = mem();
        let image = [0x12, 0x34, 0x56, 0x78, 0x9A];
        assert_eq!(m.load_image(0, &image), 3);
        assert_eq!(m.get(0, 0), Ok(0x1234));
        assert_eq!(m.get(0, 1), Ok(0x5678));
        // odd trailing byte becomes the high half of the last word
        assert_eq!(m.get(0, 2), Ok(0x9A00));
    }

    proptest! {
        #[test]
        fn prop_read_returns_last_write(addr in 0u16..0x1000, a: u16, b: u16) {
            let m = mem();
            m.put(0, addr, a).unwrap();
            m.put(0, addr, b).unwrap();
            prop_assert_eq!(m.get(0, addr), Ok(b));
        }

        #[test]
        fn prop_unmapped_faults(block in 1u16..16, addr: u16) {
            let m = mem();
            prop_assert_eq!(m.get(block, addr), Err(MemFault));
            prop_assert_eq!(m.put(block, addr, 1), Err(MemFault));
        }
    }
}
