//! Instruction-level test suites
//!
//! `modes` covers argument preparation (long/register/short/byte forms,
//! B/D-modification, the MD pre-mod chain), `instructions` covers handler
//! semantics against small in-memory programs.


use crate::cfg::Config;
use crate::emu::Emu;

/// A fresh emulator with the default configuration (block 0 mapped).
pub(crate) fn emu() -> Emu {
    Emu::new(&Config::default()).unwrap()
}

/// A fresh emulator with a program loaded at address 0 of block 0.
pub(crate) fn emu_with(program: &[u16]) -> Emu {
    let e = emu();
    for (i, &w) in program.iter().enumerate() {
        e.memory().put(0, i as u16, w).unwrap();
    }
    e
}

/// Assemble an instruction word from its fields.
pub(crate) fn word(op6: u16, d: u16, a: u16, b: u16, c: u16) -> u16 {
    op6 << 10 | d << 9 | a << 6 | b << 3 | c
}
