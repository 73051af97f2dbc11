//! Instruction decoder
//!
//! A 65536-entry decision table built once at init: every possible
//! instruction word maps to a handler id, argument-form flags, a nominal
//! execution time in nanoseconds and the ineffectiveness mask/result pair
//! (conditional jumps are "ineffective" rather than branching, which is
//! also how skip semantics fall out of the main loop).
//!
//! The table is hot: one flat array indexed by the raw instruction word,
//! dispatch is a `match` on [`Op`] in `execute`.

use bitflags::bitflags;

use super::flags as r0;

bitflags! {
    /// Decode-time properties of an instruction word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u16 {
        /// Normal argument: register C, or a second instruction word
        const ARG_NORM = 1 << 0;
        /// Short signed argument in the T field
        const ARG_SHORT = 1 << 1;
        /// Byte argument in the low 8 bits
        const ARG_BYTE = 1 << 2;
        /// Not a legal instruction word
        const ILLEGAL = 1 << 3;
        /// Legal only with Q clear
        const USER_ILLEGAL = 1 << 4;
        /// Member of the MD modification chain
        const MD = 1 << 5;
    }
}

/// Handler identifiers. Conditional jumps share the plain jump handlers;
/// their conditions live in the ineffectiveness masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // 020..036
    Lw, Tw, Ls, Ri, Rw, Pw, Rj, Is, Bb, Bm, Bs, Bc, Bn, Ou, In,
    // 037: arithmetic extension
    Ad, Sd, Mw, Dw, Af, Sf, Mf, Df,
    // 040..057
    Aw, Ac, Sw, Cw, Or, Om, Nr, Nm, Er, Em, Xr, Xm, Cl, Lb, Rb, Cb,
    // 060..067
    Awt, Trb, Irb, Drb, Cwt, Lwt, Lws, Rws,
    // 070: short jumps
    Ujs, Jvs,
    // 071
    Blc, Exl, Brc, Nrf,
    // 072: register group
    Ric, Zlb, Sxu, Nga, Slz, Sly, Slx, Sry, Ngl, Rpc, Shc,
    Rky, Zrb, Sxl, Ngc, Svz, Svy, Svx, Srx, Srz, Lpc,
    // 073
    Hlt, Mcl, SoftInt, Giu, Lip, Gil, Cron,
    // 074: long jumps
    Uj, Lj,
    // 075/076: multi-register transfers
    Ld, Lf, La, Ll, Td, Tf, Ta, Tl,
    Rd, Rf, Ra, Rl, Pd, Pf, Pa, Pl,
    // 077
    Mb, Im, Ki, Fi, Sp, Md, Rz, Ib,
    /// Placeholder for illegal words; never dispatched
    Illegal,
}

/// Argument-preparation and bookkeeping time shares, in nanoseconds.
pub mod time {
    /// Fetch of a long argument word
    pub const MEM_ARG: u32 = 1300;
    /// Pre-modification add
    pub const PREMOD: u32 = 800;
    /// B-register indexing
    pub const BMOD: u32 = 800;
    /// Indirect argument fetch
    pub const DMOD: u32 = 1300;
    /// Memory that did not answer during fetch
    pub const NOANS_IF: u32 = 1300;
    /// Ineffective instruction epilogue
    pub const P: u32 = 600;
    /// Interrupt service
    pub const INT_SERVE: u32 = 5800;
    /// One bit of SHC shifting
    pub const SHIFT: u32 = 330;
}

/// One decoded instruction word.
#[derive(Debug, Clone, Copy)]
pub struct Opcode {
    pub op: Op,
    pub flags: OpFlags,
    /// Base execution time in nanoseconds
    pub time: u32,
    /// Instruction executes only when `(R0 & nef_mask) == nef_result`
    pub nef_mask: u16,
    pub nef_result: u16,
}

const fn entry(op: Op, flags: OpFlags, time: u32) -> Opcode {
    Opcode {
        op,
        flags,
        time,
        nef_mask: 0,
        nef_result: 0,
    }
}

fn norm(op: Op, time: u32) -> Opcode {
    entry(op, OpFlags::ARG_NORM, time)
}

fn norm_priv(op: Op, time: u32) -> Opcode {
    entry(op, OpFlags::ARG_NORM.union(OpFlags::USER_ILLEGAL), time)
}

fn short(op: Op, time: u32) -> Opcode {
    entry(op, OpFlags::ARG_SHORT, time)
}

fn byte(op: Op, time: u32) -> Opcode {
    entry(op, OpFlags::ARG_BYTE, time)
}

fn none(op: Op, time: u32) -> Opcode {
    entry(op, OpFlags::empty(), time)
}

fn none_priv(op: Op, time: u32) -> Opcode {
    entry(op, OpFlags::USER_ILLEGAL, time)
}

fn illegal() -> Opcode {
    entry(Op::Illegal, OpFlags::ILLEGAL, 0)
}

fn jump(mut base: Opcode, mask: u16, result: u16) -> Opcode {
    base.nef_mask = mask;
    base.nef_result = result;
    base
}

/// The complete decode table.
pub struct OpTable(Box<[Opcode]>);

impl OpTable {
    #[inline]
    pub fn get(&self, ir: u16) -> &Opcode {
        &self.0[ir as usize]
    }
}

/// Build the table. `user_io_illegal` decides whether IN/OU are privileged.
pub fn build(user_io_illegal: bool) -> OpTable {
    let mut table = Vec::with_capacity(0x10000);
    for ir in 0..=0xFFFFu16 {
        table.push(decode(ir, user_io_illegal));
    }
    OpTable(table.into_boxed_slice())
}

fn decode(ir: u16, user_io_illegal: bool) -> Opcode {
    let a = ((ir >> 6) & 0b111) as usize;
    match (ir >> 10) & 0o77 {
        0o20 => norm(Op::Lw, 1500),
        0o21 => norm(Op::Tw, 3500),
        0o22 => norm(Op::Ls, 1800),
        0o23 => norm(Op::Ri, 3800),
        0o24 => norm(Op::Rw, 3500),
        0o25 => norm(Op::Pw, 3500),
        0o26 => norm(Op::Rj, 1800),
        0o27 => norm(Op::Is, 5200),
        0o30 => norm(Op::Bb, 1500),
        0o31 => norm(Op::Bm, 3500),
        0o32 => norm(Op::Bs, 1500),
        0o33 => norm(Op::Bc, 1500),
        0o34 => norm(Op::Bn, 1500),
        0o35 if user_io_illegal => norm_priv(Op::Ou, 12000),
        0o35 => norm(Op::Ou, 12000),
        0o36 if user_io_illegal => norm_priv(Op::In, 12000),
        0o36 => norm(Op::In, 12000),
        0o37 => {
            let op = [Op::Ad, Op::Sd, Op::Mw, Op::Dw, Op::Af, Op::Sf, Op::Mf, Op::Df][a];
            norm(op, 14000)
        }
        0o40 => norm(Op::Aw, 1900),
        0o41 => norm(Op::Ac, 1900),
        0o42 => norm(Op::Sw, 1900),
        0o43 => norm(Op::Cw, 1700),
        0o44 => norm(Op::Or, 1600),
        0o45 => norm(Op::Om, 4300),
        0o46 => norm(Op::Nr, 1600),
        0o47 => norm(Op::Nm, 4300),
        0o50 => norm(Op::Er, 1600),
        0o51 => norm(Op::Em, 4300),
        0o52 => norm(Op::Xr, 1600),
        0o53 => norm(Op::Xm, 4300),
        0o54 => norm(Op::Cl, 1700),
        0o55 => norm(Op::Lb, 4200),
        0o56 => norm(Op::Rb, 4200),
        0o57 => norm(Op::Cb, 4200),
        0o60 => short(Op::Awt, 1900),
        0o61 => short(Op::Trb, 2100),
        0o62 => short(Op::Irb, 2100),
        0o63 => short(Op::Drb, 2100),
        0o64 => short(Op::Cwt, 1700),
        0o65 => short(Op::Lwt, 1500),
        0o66 => short(Op::Lws, 3500),
        0o67 => short(Op::Rws, 3500),
        0o70 => {
            let base = if a == 4 {
                short(Op::Jvs, 1800)
            } else {
                short(Op::Ujs, 1800)
            };
            match a {
                0 => base,
                1 => jump(base, r0::L, r0::L),
                2 => jump(base, r0::E, r0::E),
                3 => jump(base, r0::G, r0::G),
                4 => jump(base, r0::V, r0::V),
                5 => jump(base, r0::X, r0::X),
                6 => jump(base, r0::Y, r0::Y),
                _ => jump(base, r0::C, r0::C),
            }
        }
        // the byte argument is the low 8 bits, so the sub-op selector is
        // bits 9..8 (D plus the top bit of A)
        0o71 => match (ir >> 8) & 0b11 {
            0 => byte(Op::Blc, 1500),
            1 => byte(Op::Exl, 8000),
            2 => byte(Op::Brc, 1500),
            _ => byte(Op::Nrf, 14000),
        },
        0o72 => match ir & 0o77 {
            0o00 => none(Op::Ric, 1500),
            0o01 => none(Op::Zlb, 1500),
            0o02 => none(Op::Sxu, 1500),
            0o03 => none(Op::Nga, 1800),
            0o04 => none(Op::Slz, 1400),
            0o05 => none(Op::Sly, 1400),
            0o06 => none(Op::Slx, 1400),
            0o07 => none(Op::Sry, 1400),
            0o10 => none(Op::Ngl, 1600),
            0o11 => none(Op::Rpc, 1500),
            0o20..=0o27 => none(Op::Shc, 1400),
            0o40 => none(Op::Rky, 1500),
            0o41 => none(Op::Zrb, 1500),
            0o42 => none(Op::Sxl, 1500),
            0o43 => none(Op::Ngc, 1800),
            0o44 => none(Op::Svz, 1400),
            0o45 => none(Op::Svy, 1400),
            0o46 => none(Op::Svx, 1400),
            0o47 => none(Op::Srx, 1400),
            0o50 => none(Op::Srz, 1400),
            0o51 => none(Op::Lpc, 1500),
            _ => illegal(),
        },
        0o73 => match a {
            0 => entry(
                Op::Hlt,
                OpFlags::ARG_SHORT.union(OpFlags::USER_ILLEGAL),
                2000,
            ),
            1 => none_priv(Op::Mcl, 6000),
            2 => none_priv(Op::SoftInt, 2200),
            3 => none_priv(Op::Giu, 2000),
            4 => none_priv(Op::Lip, 7200),
            5 => none_priv(Op::Gil, 2000),
            6 => none_priv(Op::Cron, 2000),
            _ => illegal(),
        },
        0o74 => {
            let base = if a == 7 {
                norm(Op::Lj, 4200)
            } else {
                norm(Op::Uj, 1800)
            };
            match a {
                0 | 7 => base,
                1 => jump(base, r0::L, r0::L),
                2 => jump(base, r0::E, r0::E),
                3 => jump(base, r0::G, r0::G),
                4 => jump(base, r0::Z, r0::Z),
                5 => jump(base, r0::M, r0::M),
                _ => jump(base, r0::E, 0),
            }
        }
        0o75 => {
            let op = [Op::Ld, Op::Lf, Op::La, Op::Ll, Op::Td, Op::Tf, Op::Ta, Op::Tl][a];
            norm(op, 7000)
        }
        0o76 => {
            let op = [Op::Rd, Op::Rf, Op::Ra, Op::Rl, Op::Pd, Op::Pf, Op::Pa, Op::Pl][a];
            norm(op, 7000)
        }
        0o77 => match a {
            0 => norm_priv(Op::Mb, 4200),
            1 => norm_priv(Op::Im, 4200),
            2 => norm_priv(Op::Ki, 4200),
            3 => norm_priv(Op::Fi, 4200),
            4 => norm_priv(Op::Sp, 7800),
            5 => {
                let mut e = norm(Op::Md, 1200);
                e.flags |= OpFlags::MD;
                e
            }
            6 => norm(Op::Rz, 3800),
            _ => norm(Op::Ib, 5200),
        },
        _ => illegal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_total_and_consistent() {
        let table = build(true);
        for ir in 0..=0xFFFFu16 {
            let op = table.get(ir);
            // at most one argument form
            let forms = [
                op.flags.contains(OpFlags::ARG_NORM),
                op.flags.contains(OpFlags::ARG_SHORT),
                op.flags.contains(OpFlags::ARG_BYTE),
            ]
            .iter()
            .filter(|&&f| f)
            .count();
            assert!(forms <= 1, "ir {:04x} has {} argument forms", ir, forms);
            // illegal entries carry no argument
            if op.flags.contains(OpFlags::ILLEGAL) {
                assert_eq!(forms, 0, "ir {:04x} illegal with argument", ir);
                assert_eq!(op.op, Op::Illegal);
            } else {
                assert_ne!(op.op, Op::Illegal, "ir {:04x} legal but unmapped", ir);
            }
        }
    }

    #[test]
    fn test_basic_opcodes() {
        let table = build(true);
        assert_eq!(table.get(0o20 << 10).op, Op::Lw);
        assert_eq!(table.get(0o21 << 10).op, Op::Tw);
        assert_eq!(table.get(0o77 << 10 | 5 << 6).op, Op::Md);
        assert!(table.get(0o77 << 10 | 5 << 6).flags.contains(OpFlags::MD));
        assert_eq!(table.get(0o70 << 10).op, Op::Ujs);
        assert_eq!(table.get(0).op, Op::Illegal);
    }

    #[test]
    fn test_conditional_jump_masks() {
        let table = build(true);
        // JLS: effective only with L set
        let jls = table.get(0o70 << 10 | 1 << 6);
        assert_eq!((jls.nef_mask, jls.nef_result), (r0::L, r0::L));
        // JN: effective only with E clear
        let jn = table.get(0o74 << 10 | 6 << 6);
        assert_eq!((jn.nef_mask, jn.nef_result), (r0::E, 0));
        // UJ: unconditional
        let uj = table.get(0o74 << 10);
        assert_eq!((uj.nef_mask, uj.nef_result), (0, 0));
    }

    #[test]
    fn test_user_io_illegal_config() {
        let strict = build(true);
        let lax = build(false);
        let ou = (0o35 << 10) as u16;
        assert!(strict.get(ou).flags.contains(OpFlags::USER_ILLEGAL));
        assert!(!lax.get(ou).flags.contains(OpFlags::USER_ILLEGAL));
        // MB stays privileged either way
        let mb = (0o77 << 10) as u16;
        assert!(lax.get(mb).flags.contains(OpFlags::USER_ILLEGAL));
    }

    #[test]
    fn test_register_group_decode() {
        let table = build(true);
        assert_eq!(table.get(0o72 << 10).op, Op::Ric);
        assert_eq!(table.get(0o72 << 10 | 0o44).op, Op::Svz);
        assert_eq!(table.get(0o72 << 10 | 0o21).op, Op::Shc);
        assert_eq!(table.get(0o72 << 10 | 0o52).op, Op::Illegal);
    }
}
