//! Instruction handlers
//!
//! One handler per mnemonic, dispatched from the decode table. Handlers see
//! the already-prepared argument in AC and the raw instruction word fields;
//! they update registers, memory, flags, IC and the interrupt controller.
//! Memory faults inside a handler raise the no-memory interrupt through the
//! access helpers and simply cut the handler short.

use crate::emu::{AwpOp, Emu};
use crate::interrupts::{src, EXL_VECTOR, MASK_9};
use crate::io::IoDir;
use crate::panel::CpuState;

use super::flags;
use super::iset::Op;

impl Emu {
    pub(crate) fn execute(&mut self, op: Op) {
        match op {
            Op::Lw => self.op_lw(),
            Op::Tw => self.op_tw(),
            Op::Ls => self.op_ls(),
            Op::Ri => self.op_ri(),
            Op::Rw => self.op_rw(),
            Op::Pw => self.op_pw(),
            Op::Rj => self.op_rj(),
            Op::Is => self.op_is(),
            Op::Bb => self.op_bb(),
            Op::Bm => self.op_bm(),
            Op::Bs => self.op_bs(),
            Op::Bc => self.op_bc(),
            Op::Bn => self.op_bn(),
            Op::Ou => self.op_io(IoDir::Out),
            Op::In => self.op_io(IoDir::In),
            Op::Ad => self.awp_dispatch(AwpOp::Ad, self.cpu.ac),
            Op::Sd => self.awp_dispatch(AwpOp::Sd, self.cpu.ac),
            Op::Mw => self.awp_dispatch(AwpOp::Mw, self.cpu.ac),
            Op::Dw => self.awp_dispatch(AwpOp::Dw, self.cpu.ac),
            Op::Af => self.awp_dispatch(AwpOp::Af, self.cpu.ac),
            Op::Sf => self.awp_dispatch(AwpOp::Sf, self.cpu.ac),
            Op::Mf => self.awp_dispatch(AwpOp::Mf, self.cpu.ac),
            Op::Df => self.awp_dispatch(AwpOp::Df, self.cpu.ac),
            Op::Aw | Op::Awt => {
                let a = self.cpu.r[self.cpu.ir_a()];
                self.cpu.alu_add(a, self.cpu.ac, 0);
            }
            Op::Ac => {
                let a = self.cpu.r[self.cpu.ir_a()];
                let carry = self.cpu.flag(flags::C) as u16;
                self.cpu.alu_add(a, self.cpu.ac, carry);
            }
            Op::Sw => {
                let a = self.cpu.r[self.cpu.ir_a()];
                self.cpu.alu_sub(a, self.cpu.ac);
            }
            Op::Cw | Op::Cwt => {
                let a = self.cpu.r[self.cpu.ir_a()] as i16;
                self.cpu.set_leg(a.cmp(&(self.cpu.ac as i16)));
            }
            Op::Cl => {
                let a = self.cpu.r[self.cpu.ir_a()];
                self.cpu.set_leg(a.cmp(&self.cpu.ac));
            }
            Op::Or => self.op_or(),
            Op::Om => self.op_om(),
            Op::Nr => self.op_nr(),
            Op::Nm => self.op_nm(),
            Op::Er => self.op_er(),
            Op::Em => self.op_em(),
            Op::Xr => self.op_xr(),
            Op::Xm => self.op_xm(),
            Op::Lb => self.op_lb(),
            Op::Rb => self.op_rb(),
            Op::Cb => self.op_cb(),
            Op::Trb => self.op_trb(),
            Op::Irb => self.op_irb(),
            Op::Drb => self.op_drb(),
            Op::Lwt => self.op_lw(),
            Op::Lws => self.op_lws(),
            Op::Rws => self.op_rws(),
            Op::Ujs => {
                self.cpu.ic = self.cpu.ic.wrapping_add(self.cpu.ac);
            }
            Op::Jvs => {
                self.cpu.ic = self.cpu.ic.wrapping_add(self.cpu.ac);
                self.cpu.flag_set(flags::V, false);
            }
            Op::Blc => {
                let b = self.cpu.ac;
                if (self.cpu.r[0] >> 8) & b != b {
                    self.cpu.p = true;
                }
            }
            Op::Exl => self.op_exl(),
            Op::Brc => {
                let b = self.cpu.ac;
                if self.cpu.r[0] & b != b {
                    self.cpu.p = true;
                }
            }
            Op::Nrf => {
                let variant = (self.cpu.ir_a() & 0b011) as u8;
                self.awp_dispatch(AwpOp::Nrf(variant), self.cpu.ir_byte());
            }
            Op::Ric => {
                let ic = self.cpu.ic;
                self.cpu.reg_write(self.cpu.ir_a(), ic);
            }
            Op::Zlb => {
                let a = self.cpu.ir_a();
                let val = self.cpu.r[a] & 0x00FF;
                self.cpu.reg_write(a, val);
            }
            Op::Zrb => {
                let a = self.cpu.ir_a();
                let val = self.cpu.r[a] & 0xFF00;
                self.cpu.reg_write(a, val);
            }
            Op::Sxu => {
                let sign = self.cpu.r[self.cpu.ir_a()] & 0x8000 != 0;
                self.cpu.flag_set(flags::X, sign);
            }
            Op::Sxl => {
                let low = self.cpu.r[self.cpu.ir_a()] & 1 != 0;
                self.cpu.flag_set(flags::X, low);
            }
            Op::Nga => {
                let a = self.cpu.r[self.cpu.ir_a()];
                self.cpu.alu_add(!a, 0, 1);
            }
            Op::Ngc => {
                let a = self.cpu.r[self.cpu.ir_a()];
                let carry = self.cpu.flag(flags::C) as u16;
                self.cpu.alu_add(!a, 0, carry);
            }
            Op::Ngl => {
                let a = self.cpu.ir_a();
                let result = !self.cpu.r[a];
                self.cpu.set_z(result);
                self.cpu.r[a] = result;
            }
            Op::Slz => self.cpu.shift_left(0, false),
            Op::Sly => {
                let y = self.cpu.flag(flags::Y) as u16;
                self.cpu.shift_left(y, false);
            }
            Op::Slx => {
                let x = self.cpu.flag(flags::X) as u16;
                self.cpu.shift_left(x, false);
            }
            Op::Svz => self.cpu.shift_left(0, true),
            Op::Svy => {
                let y = self.cpu.flag(flags::Y) as u16;
                self.cpu.shift_left(y, true);
            }
            Op::Svx => {
                let x = self.cpu.flag(flags::X) as u16;
                self.cpu.shift_left(x, true);
            }
            Op::Sry => {
                let y = (self.cpu.flag(flags::Y) as u16) << 15;
                self.cpu.shift_right(y);
            }
            Op::Srx => {
                let x = (self.cpu.flag(flags::X) as u16) << 15;
                self.cpu.shift_right(x);
            }
            Op::Srz => self.cpu.shift_right(0),
            Op::Shc => self.op_shc(),
            Op::Rpc => {
                let r0 = self.cpu.r[0];
                self.cpu.reg_write(self.cpu.ir_a(), r0);
            }
            Op::Lpc => {
                self.cpu.r[0] = self.cpu.r[self.cpu.ir_a()];
            }
            Op::Rky => {
                let keys = self.panel.keys();
                self.cpu.reg_write(self.cpu.ir_a(), keys);
            }
            Op::Hlt => self.op_hlt(),
            Op::Mcl => {
                self.panel
                    .request_state(CpuState::ClearMaster, Some(CpuState::Run));
            }
            Op::SoftInt => self.op_softint(),
            // second CPU not emulated
            Op::Giu | Op::Gil => {}
            Op::Lip => self.op_lip(),
            Op::Cron => {
                if self.cpu.mod_present {
                    self.cpu_mod_on();
                }
                // CRON is an illegal instruction either way
                self.ints.set(src::ILLEGAL);
            }
            Op::Uj => {
                self.cpu.ic = self.cpu.ac;
            }
            Op::Lj => self.op_lj(),
            Op::Ld => self.op_mget(true, 1, 2),
            Op::Lf => self.op_mget(true, 1, 3),
            Op::La => self.op_mget(true, 1, 7),
            Op::Ll => self.op_mget(true, 5, 3),
            Op::Td => self.op_mget(false, 1, 2),
            Op::Tf => self.op_mget(false, 1, 3),
            Op::Ta => self.op_mget(false, 1, 7),
            Op::Tl => self.op_mget(false, 5, 3),
            Op::Rd => self.op_mput(true, 1, 2),
            Op::Rf => self.op_mput(true, 1, 3),
            Op::Ra => self.op_mput(true, 1, 7),
            Op::Rl => self.op_mput(true, 5, 3),
            Op::Pd => self.op_mput(false, 1, 2),
            Op::Pf => self.op_mput(false, 1, 3),
            Op::Pa => self.op_mput(false, 1, 7),
            Op::Pl => self.op_mput(false, 5, 3),
            Op::Mb => self.op_mb(),
            Op::Im => self.op_im(),
            Op::Ki => self.op_ki(),
            Op::Fi => self.op_fi(),
            Op::Sp => self.op_sp(),
            Op::Md => self.op_md(),
            Op::Rz => {
                let block = self.cpu.qnb();
                self.mem_put(block, self.cpu.ac, 0);
            }
            Op::Ib => self.op_ib(),
            Op::Illegal => {}
        }
    }

    /// Byte address for LB/RB/CB: ZC17 from the modification chain supplies
    /// bit 17.
    fn byte_addr(&self) -> u32 {
        ((self.cpu.zc17 as u32) << 16) | self.cpu.ac as u32
    }

    fn op_lw(&mut self) {
        let ac = self.cpu.ac;
        self.cpu.reg_write(self.cpu.ir_a(), ac);
    }

    fn op_tw(&mut self) {
        let block = self.cpu.nb;
        if let Some(data) = self.mem_get(block, self.cpu.ac) {
            self.cpu.reg_write(self.cpu.ir_a(), data);
        }
    }

    fn op_ls(&mut self) {
        let a = self.cpu.ir_a();
        let mask = self.cpu.r[7];
        let val = (self.cpu.r[a] & !mask) | (self.cpu.ac & mask);
        self.cpu.reg_write(a, val);
    }

    fn op_ri(&mut self) {
        let a = self.cpu.ir_a();
        let block = self.cpu.qnb();
        let addr = self.cpu.r[a];
        let ac = self.cpu.ac;
        if self.mem_put(block, addr, ac) {
            let next = self.cpu.r[a].wrapping_add(1);
            self.cpu.reg_write(a, next);
        }
    }

    fn op_rw(&mut self) {
        let block = self.cpu.qnb();
        let val = self.cpu.r[self.cpu.ir_a()];
        self.mem_put(block, self.cpu.ac, val);
    }

    fn op_pw(&mut self) {
        let block = self.cpu.nb;
        let val = self.cpu.r[self.cpu.ir_a()];
        self.mem_put(block, self.cpu.ac, val);
    }

    fn op_rj(&mut self) {
        let ic = self.cpu.ic;
        self.cpu.reg_write(self.cpu.ir_a(), ic);
        self.cpu.ic = self.cpu.ac;
    }

    fn op_is(&mut self) {
        let block = self.cpu.nb;
        let addr = self.cpu.ac;
        let mask = self.cpu.r[self.cpu.ir_a()];
        if let Some(data) = self.mem_get(block, addr) {
            if data & mask == mask {
                self.cpu.p = true;
            } else {
                self.mem_put(block, addr, data | mask);
            }
        }
    }

    fn op_bb(&mut self) {
        let mask = self.cpu.ac;
        if self.cpu.r[self.cpu.ir_a()] & mask == mask {
            self.cpu.p = true;
        }
    }

    fn op_bm(&mut self) {
        let block = self.cpu.nb;
        let mask = self.cpu.r[self.cpu.ir_a()];
        if let Some(data) = self.mem_get(block, self.cpu.ac) {
            if data & mask == mask {
                self.cpu.p = true;
            }
        }
    }

    fn op_bs(&mut self) {
        let mask = self.cpu.r[7];
        if self.cpu.r[self.cpu.ir_a()] & mask == self.cpu.ac & mask {
            self.cpu.p = true;
        }
    }

    fn op_bc(&mut self) {
        let mask = self.cpu.ac;
        if self.cpu.r[self.cpu.ir_a()] & mask != mask {
            self.cpu.p = true;
        }
    }

    fn op_bn(&mut self) {
        if self.cpu.r[self.cpu.ir_a()] & self.cpu.ac == 0 {
            self.cpu.p = true;
        }
    }

    /// OU/IN: dispatch, then continue at one of the four return vectors
    /// following the instruction, selected by the bus answer.
    fn op_io(&mut self, dir: IoDir) {
        let a = self.cpu.ir_a();
        let mut reg = self.cpu.r[a];
        let res = self.io.dispatch(dir, self.cpu.ac, &mut reg);
        self.cpu.r[a] = reg;
        let block = self.cpu.qnb();
        let vector = self.cpu.ic.wrapping_add(res.skip_offset());
        if let Some(data) = self.mem_get(block, vector) {
            self.cpu.ic = data;
        }
    }

    fn op_or(&mut self) {
        let a = self.cpu.ir_a();
        let result = self.cpu.r[a] | self.cpu.ac;
        self.cpu.set_z(result);
        self.cpu.reg_write(a, result);
    }

    fn op_om(&mut self) {
        let block = self.cpu.nb;
        let addr = self.cpu.ac;
        let mask = self.cpu.r[self.cpu.ir_a()];
        if let Some(data) = self.mem_get(block, addr) {
            let data = data | mask;
            if self.mem_put(block, addr, data) {
                self.cpu.set_z(data);
            }
        }
    }

    fn op_nr(&mut self) {
        let a = self.cpu.ir_a();
        let result = self.cpu.r[a] & self.cpu.ac;
        self.cpu.set_z(result);
        self.cpu.reg_write(a, result);
    }

    fn op_nm(&mut self) {
        let block = self.cpu.nb;
        let addr = self.cpu.ac;
        let mask = self.cpu.r[self.cpu.ir_a()];
        if let Some(data) = self.mem_get(block, addr) {
            let data = data & mask;
            if self.mem_put(block, addr, data) {
                self.cpu.set_z(data);
            }
        }
    }

    fn op_er(&mut self) {
        let a = self.cpu.ir_a();
        let result = self.cpu.r[a] & !self.cpu.ac;
        self.cpu.set_z(result);
        self.cpu.reg_write(a, result);
    }

    fn op_em(&mut self) {
        let block = self.cpu.nb;
        let addr = self.cpu.ac;
        let mask = self.cpu.r[self.cpu.ir_a()];
        if let Some(data) = self.mem_get(block, addr) {
            let data = data & !mask;
            if self.mem_put(block, addr, data) {
                self.cpu.set_z(data);
            }
        }
    }

    fn op_xr(&mut self) {
        let a = self.cpu.ir_a();
        let result = self.cpu.r[a] ^ self.cpu.ac;
        self.cpu.set_z(result);
        self.cpu.reg_write(a, result);
    }

    fn op_xm(&mut self) {
        let block = self.cpu.nb;
        let addr = self.cpu.ac;
        let mask = self.cpu.r[self.cpu.ir_a()];
        if let Some(data) = self.mem_get(block, addr) {
            let data = data ^ mask;
            if self.mem_put(block, addr, data) {
                self.cpu.set_z(data);
            }
        }
    }

    fn op_lb(&mut self) {
        let block = self.cpu.nb;
        let addr = self.byte_addr();
        if let Some(byte) = self.mem_get_byte(block, addr) {
            let a = self.cpu.ir_a();
            let val = (self.cpu.r[a] & 0xFF00) | byte as u16;
            self.cpu.reg_write(a, val);
        }
    }

    fn op_rb(&mut self) {
        let block = self.cpu.nb;
        let addr = self.byte_addr();
        let val = self.cpu.r[self.cpu.ir_a()] as u8;
        self.mem_put_byte(block, addr, val);
    }

    fn op_cb(&mut self) {
        let block = self.cpu.nb;
        let addr = self.byte_addr();
        if let Some(byte) = self.mem_get_byte(block, addr) {
            let a = self.cpu.r[self.cpu.ir_a()] as u8;
            self.cpu.set_leg(a.cmp(&byte));
        }
    }

    fn op_trb(&mut self) {
        let a = self.cpu.ir_a();
        let val = self.cpu.r[a].wrapping_add(self.cpu.ac);
        self.cpu.reg_write(a, val);
        if self.cpu.r[a] == 0 {
            self.cpu.p = true;
        }
    }

    fn op_irb(&mut self) {
        let a = self.cpu.ir_a();
        let val = self.cpu.r[a].wrapping_add(1);
        self.cpu.reg_write(a, val);
        if self.cpu.r[a] != 0 {
            self.cpu.ic = self.cpu.ic.wrapping_add(self.cpu.ac);
        }
    }

    fn op_drb(&mut self) {
        let a = self.cpu.ir_a();
        let val = self.cpu.r[a].wrapping_sub(1);
        self.cpu.reg_write(a, val);
        if self.cpu.r[a] != 0 {
            self.cpu.ic = self.cpu.ic.wrapping_add(self.cpu.ac);
        }
    }

    fn op_lws(&mut self) {
        let block = self.cpu.qnb();
        let addr = self.cpu.ic.wrapping_add(self.cpu.ac);
        if let Some(data) = self.mem_get(block, addr) {
            self.cpu.reg_write(self.cpu.ir_a(), data);
        }
    }

    fn op_rws(&mut self) {
        let block = self.cpu.qnb();
        let addr = self.cpu.ic.wrapping_add(self.cpu.ac);
        let val = self.cpu.r[self.cpu.ir_a()];
        self.mem_put(block, addr, val);
    }

    /// EXL: supervisor call through the vector at absolute address 96.
    fn op_exl(&mut self) {
        log::debug!(target: "cpu", "EXL: {} (r4: 0x{:04x})", self.cpu.ac, self.cpu.r[4]);
        if let Some(vector) = self.mem_get(0, EXL_VECTOR) {
            let arg = self.cpu.ac;
            self.ctx_switch(arg, vector, MASK_9);
        }
    }

    fn op_shc(&mut self) {
        let t = self.cpu.ir_shift();
        if t == 0 {
            return;
        }
        let a = self.cpu.ir_a();
        let val = self.cpu.r[a];
        let falling = (val & ((1 << t) - 1)) << (16 - t);
        self.cpu.reg_write(a, (val >> t) | falling);
    }

    fn op_hlt(&mut self) {
        log::debug!(
            target: "cpu",
            "HALT 0{:02o} (alarm: {})",
            self.cpu.ac, self.cpu.r[6] & 0xFF
        );
        self.panel.request_state(CpuState::Wait, Some(CpuState::Run));
    }

    /// CIT/SIL/SIU/SIT plus the SINT/SIND variants on modified CPUs.
    fn op_softint(&mut self) {
        let c = self.cpu.ir_c();
        if c & 3 == 0 {
            self.ints.clear(src::SOFT_U);
            self.ints.clear(src::SOFT_L);
        } else {
            if c & 1 != 0 {
                self.ints.set(src::SOFT_L);
            }
            if c & 2 != 0 {
                self.ints.set(src::SOFT_U);
            }
        }
        if self.cpu.mod_present && c & 4 != 0 {
            self.ints.set(src::CLOCK);
        }
    }

    fn op_lip(&mut self) {
        self.ctx_restore(false);
        log::debug!(target: "cpu", "LIP: context restored, IC 0x{:04x}", self.cpu.ic);
    }

    fn op_lj(&mut self) {
        let block = self.cpu.qnb();
        let ic = self.cpu.ic;
        if self.mem_put(block, self.cpu.ac, ic) {
            self.cpu.ic = self.cpu.ac.wrapping_add(1);
        }
    }

    fn op_mget(&mut self, through_q: bool, first: usize, n: usize) {
        let block = if through_q {
            self.cpu.qnb()
        } else {
            self.cpu.nb
        };
        self.mem_mget_regs(block, self.cpu.ac, first, n);
    }

    fn op_mput(&mut self, through_q: bool, first: usize, n: usize) {
        let block = if through_q {
            self.cpu.qnb()
        } else {
            self.cpu.nb
        };
        self.mem_mput_regs(block, self.cpu.ac, first, n);
    }

    fn op_mb(&mut self) {
        let block = self.cpu.qnb();
        if let Some(data) = self.mem_get(block, self.cpu.ac) {
            self.cpu.q = data & 0b100000 != 0;
            self.cpu.bs = data & 0b010000 != 0;
            self.cpu.nb = data & 0b001111;
        }
    }

    fn op_im(&mut self) {
        let block = self.cpu.qnb();
        if let Some(data) = self.mem_get(block, self.cpu.ac) {
            self.cpu.rm = (data >> 6) & 0x3FF;
            self.ints.update_mask(self.cpu.rm);
        }
    }

    fn op_ki(&mut self) {
        let block = self.cpu.qnb();
        let data = self.ints.get_nchan();
        self.mem_put(block, self.cpu.ac, data);
    }

    fn op_fi(&mut self) {
        let block = self.cpu.qnb();
        if let Some(data) = self.mem_get(block, self.cpu.ac) {
            self.ints.put_nchan(data);
        }
    }

    /// SP: load a full {IC, R0, SR} context from memory at NB:AC.
    fn op_sp(&mut self) {
        let block = self.cpu.nb;
        let mut ctx = [0u16; 3];
        if self.mem_mget_buf(block, self.cpu.ac, &mut ctx) != 3 {
            return;
        }
        self.cpu.ic = ctx[0];
        self.cpu.r[0] = ctx[1];
        self.cpu.sr_write(ctx[2]);
        self.ints.update_mask(self.cpu.rm);
        log::debug!(target: "cpu", "SP: context @ 0x{:04x}", self.cpu.ac);
    }

    fn op_md(&mut self) {
        if self.cpu.mc >= 3 {
            self.ints.set(src::ILLEGAL);
            self.cpu.mc = 0;
            return;
        }
        self.cpu.mc += 1;
    }

    fn op_ib(&mut self) {
        let block = self.cpu.qnb();
        let addr = self.cpu.ac;
        if let Some(data) = self.mem_get(block, addr) {
            let data = data.wrapping_add(1);
            if self.mem_put(block, addr, data) && data == 0 {
                self.cpu.p = true;
            }
        }
    }
}
