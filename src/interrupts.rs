//! Interrupt controller
//!
//! 32 prioritized interrupt sources; source 0 has the highest priority.
//! Pending state lives in one atomic word with source *n* at bit `31 - n`,
//! so finding the highest-priority pending interrupt is a count of leading
//! zeros. `set()` is the only entry other threads (channels, the clock) may
//! call on the CPU side; it also pokes the control panel so a CPU blocked
//! in STOP or WAIT re-evaluates.
//!
//! The software mask register RM is 10 bits wide; each bit gates a group of
//! sources. Sources 0..3 are never maskable.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::panel::ControlPanel;

/// Interrupt source numbers, in priority order.
pub mod src {
    /// Power supply failure
    pub const POWER_FAIL: usize = 0;
    /// Memory parity error
    pub const MEM_PARITY: usize = 1;
    /// Access to unmapped memory
    pub const NO_MEM: usize = 2;
    /// Second CPU, high priority
    pub const CPU2_HIGH: usize = 3;
    /// Interface power failure
    pub const IFACE_POWER: usize = 4;
    /// Arithmetic extension unit fault
    pub const AWP_FAULT: usize = 5;
    /// Illegal instruction
    pub const ILLEGAL: usize = 6;
    /// Software interrupt, upper
    pub const SOFT_U: usize = 7;
    /// Software interrupt, lower
    pub const SOFT_L: usize = 8;
    /// Timer
    pub const CLOCK: usize = 9;
    /// Second CPU, low priority
    pub const CPU2_LOW: usize = 10;
    /// Timer when the CPU modifications option is active
    pub const EXTRA: usize = 11;
    /// First of the 16 channel interrupts
    pub const CHAN0: usize = 12;

    /// Source number for channel `n`.
    pub fn chan(n: usize) -> usize {
        CHAN0 + n
    }

    /// Channel number if `n` is a channel source.
    pub fn as_chan(n: usize) -> Option<usize> {
        if (CHAN0..CHAN0 + 16).contains(&n) {
            Some(n - CHAN0)
        } else {
            None
        }
    }
}

/// Address of the interrupt vector for source *n*: `VECTOR_BASE + n`.
pub const VECTOR_BASE: u16 = 0x40;
/// Address of the EXL (supervisor call) vector.
pub const EXL_VECTOR: u16 = 0x60;
/// Address of the word holding the process stack pointer.
pub const STACK_POINTER: u16 = 0x61;

/// RM value that masks out only the lowest-priority group (used by EXL).
pub const MASK_9: u16 = 0b11_1111_1110;

#[inline]
fn bit(n: usize) -> u32 {
    1 << (31 - n)
}

const CHAN_BITS: u32 = {
    let mut bits = 0;
    let mut c = 0;
    while c < 16 {
        bits |= 1 << (31 - (src::CHAN0 + c));
        c += 1;
    }
    bits
};

const NON_MASKABLE: u32 = 0xF000_0000;

/// Sources gated by RM bit *k* (MSB-first: bit 0 is the widest group's
/// highest-priority neighbour).
const RM_GROUPS: [&[usize]; 10] = [
    &[4],
    &[5],
    &[6],
    &[7, 8],
    &[9, 10, 11],
    &[12, 13, 14, 15],
    &[16, 17, 18, 19],
    &[20, 21, 22, 23],
    &[24, 25, 26, 27],
    &[28, 29, 30, 31],
];

fn expand_rm(rm: u16) -> u32 {
    let mut mask = NON_MASKABLE;
    for (k, sources) in RM_GROUPS.iter().enumerate() {
        if rm & (1 << (9 - k)) != 0 {
            for &n in *sources {
                mask |= bit(n);
            }
        }
    }
    mask
}

/// RM group index of source `n`, or `None` for the non-maskable sources.
fn rm_group(n: usize) -> Option<usize> {
    RM_GROUPS.iter().position(|g| g.contains(&n))
}

/// The RM value applied when serving source `n`: only groups of strictly
/// higher priority stay open, so equal and lower lines cannot re-enter.
pub fn serve_mask(n: usize) -> u16 {
    let cutoff = match rm_group(n) {
        Some(g) => g,
        None => 0,
    };
    let mut mask = 0;
    for k in 0..cutoff {
        mask |= 1 << (9 - k);
    }
    mask
}

/// The interrupt controller.
pub struct InterruptController {
    pending: AtomicU32,
    mask: AtomicU32,
    clock_src: AtomicU32,
    panel: Arc<ControlPanel>,
}

impl InterruptController {
    pub fn new(panel: Arc<ControlPanel>) -> Self {
        Self {
            pending: AtomicU32::new(0),
            mask: AtomicU32::new(expand_rm(0)),
            clock_src: AtomicU32::new(src::CLOCK as u32),
            panel,
        }
    }

    /// Raise interrupt `n`. Safe to call from any thread.
    pub fn set(&self, n: usize) {
        log::trace!(target: "int", "set: {}", n);
        self.pending.fetch_or(bit(n), Ordering::SeqCst);
        self.panel.notify();
    }

    /// Clear interrupt `n`.
    pub fn clear(&self, n: usize) {
        self.pending.fetch_and(!bit(n), Ordering::SeqCst);
    }

    /// Clear every pending interrupt.
    pub fn clear_all(&self) {
        self.pending.store(0, Ordering::SeqCst);
    }

    /// Install a new 10-bit RM value.
    pub fn update_mask(&self, rm: u16) {
        self.mask.store(expand_rm(rm), Ordering::SeqCst);
    }

    /// Whether any unmasked interrupt is pending.
    pub fn any_deliverable(&self) -> bool {
        self.pending.load(Ordering::SeqCst) & self.mask.load(Ordering::SeqCst) != 0
    }

    /// Highest-priority pending unmasked source.
    pub fn highest_deliverable(&self) -> Option<usize> {
        let w = self.pending.load(Ordering::SeqCst) & self.mask.load(Ordering::SeqCst);
        if w == 0 {
            None
        } else {
            Some(w.leading_zeros() as usize)
        }
    }

    /// Whether `n` is pending (masked or not).
    pub fn is_pending(&self, n: usize) -> bool {
        self.pending.load(Ordering::SeqCst) & bit(n) != 0
    }

    /// Snapshot the 16 channel interrupt bits into a word (channel 0 in the
    /// most significant bit) and clear them. Backs the KI instruction.
    pub fn get_nchan(&self) -> u16 {
        let w = self.pending.fetch_and(!CHAN_BITS, Ordering::SeqCst);
        let mut out = 0;
        for c in 0..16 {
            if w & bit(src::chan(c)) != 0 {
                out |= 1 << (15 - c);
            }
        }
        out
    }

    /// Re-raise channel interrupts from a word. Backs the FI instruction.
    pub fn put_nchan(&self, word: u16) {
        let mut bits = 0;
        for c in 0..16 {
            if word & (1 << (15 - c)) != 0 {
                bits |= bit(src::chan(c));
            }
        }
        self.pending.fetch_or(bits, Ordering::SeqCst);
        self.panel.notify();
    }

    /// Select which source the external clock raises (CLOCK, or EXTRA when
    /// the CPU modifications option is active).
    pub fn set_clock_source(&self, n: usize) {
        self.clock_src.store(n as u32, Ordering::SeqCst);
    }

    /// Raise the current clock interrupt; for the external timer thread.
    pub fn clock_tick(&self) {
        self.set(self.clock_src.load(Ordering::SeqCst) as usize);
    }
}
