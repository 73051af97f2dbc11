//! Emulator orchestrator
//!
//! Owns the CPU, the decode table, memory, the interrupt controller and the
//! I/O dispatcher, and runs the CPU state machine: the loop observes the
//! control panel's state variable and executes, serves interrupts, clears,
//! binary-loads or idles accordingly.
//!
//! When real-speed throttling is on, every cycle reports its nominal
//! execution time; the loop accumulates it and sleeps toward an absolute
//! monotonic target so rounding never drifts. A cycle may ask to skip
//! throttling entirely (OU does) so a directly following HLT cannot miss
//! the completion interrupt it is about to wait for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::cfg::Config;
use crate::cpu::iset::{self, time, Op, OpFlags, OpTable};
use crate::cpu::Cpu;
use crate::interrupts::{self, src, InterruptController, STACK_POINTER, VECTOR_BASE};
use crate::io::{Io, IoDir, IoResult};
use crate::memory::{MemError, Memory, MEGA_BOOT_IC};
use crate::panel::{ControlPanel, CpuState};

/// Fatal initialization errors. Everything that happens after init maps to
/// guest-visible interrupts instead.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("memory configuration: {0}")]
    Mem(#[from] MemError),
}

/// What one machine cycle cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Nominal execution time in nanoseconds
    pub time: u32,
    /// Do not throttle on this cycle (set after OU)
    pub skip_throttle: bool,
}

impl CycleOutcome {
    fn idle() -> Self {
        Self {
            time: 0,
            skip_throttle: false,
        }
    }
}

/// Operations delegated to the arithmetic extension unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwpOp {
    /// Normalize, variant 0..3
    Nrf(u8),
    Ad,
    Sd,
    Mw,
    Dw,
    Af,
    Sf,
    Mf,
    Df,
}

/// Error inside the extension unit; raises its interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwpFault;

/// The arithmetic extension unit, supplied by the embedder.
pub trait AwpUnit: Send {
    fn dispatch(
        &mut self,
        op: AwpOp,
        arg: u16,
        cpu: &mut Cpu,
        mem: &Memory,
    ) -> Result<(), AwpFault>;
}

#[derive(Default)]
struct BinLoader {
    words: u32,
    buf: [u8; 3],
    cnt: usize,
}

/// End-of-load marker: a position-0 byte of the 01xxxxxx class.
fn bin_is_end(b: u8) -> bool {
    b & 0xC0 == 0x40
}

/// Data byte; zero bytes are tape leader and are skipped.
fn bin_is_valid(b: u8) -> bool {
    b != 0 && !bin_is_end(b)
}

/// Three tape bytes pack 4+6+6 bits into one word.
fn bin_word(b: &[u8; 3]) -> u16 {
    ((b[0] & 0x0F) as u16) << 12 | ((b[1] & 0x3F) as u16) << 6 | (b[2] & 0x3F) as u16
}

/// The emulator core aggregate.
pub struct Emu {
    pub(crate) cpu: Cpu,
    pub(crate) table: OpTable,
    pub(crate) mem: Arc<Memory>,
    pub(crate) ints: Arc<InterruptController>,
    pub(crate) panel: Arc<ControlPanel>,
    pub(crate) io: Io,
    awp: Option<Box<dyn AwpUnit>>,
    awp_enabled: bool,
    nomem_stop: bool,
    speed_real: bool,
    sound_enabled: bool,
    delay_factor: f64,
    /// Throttling granularity in nanoseconds
    throttle_granularity: u64,
    timer: Instant,
    time_cumulative: u64,
    ips: Arc<AtomicU64>,
    bin: BinLoader,
}

impl Emu {
    pub fn new(cfg: &Config) -> Result<Self, InitError> {
        let panel = Arc::new(ControlPanel::new(cfg.cpu.kb));
        let ints = Arc::new(InterruptController::new(Arc::clone(&panel)));
        let mem = Arc::new(Memory::new(&cfg.mem)?);

        let mut cpu = Cpu::new(cfg.cpu.modifications);
        // checked only at power-on
        cpu.ic = if mem.mega_boot() { MEGA_BOOT_IC } else { 0 };

        let mut sound_enabled = cfg.sound.enabled;
        if sound_enabled
            && (!cfg.cpu.speed_real
                || !(0.1..=2.0).contains(&cfg.cpu.speed_factor))
        {
            log::error!(
                target: "cpu",
                "buzzer needs speed_real=true and 0.1 <= speed_factor <= 2.0; disabling sound"
            );
            sound_enabled = false;
        }

        ints.update_mask(0);
        ints.set_clock_source(src::CLOCK);

        log::debug!(
            target: "cpu",
            "CPU initialized. AWP: {}, KB=0x{:04x}, modifications: {}, user I/O: {}, stop on nomem: {}",
            cfg.cpu.awp, cfg.cpu.kb, cfg.cpu.modifications, cfg.cpu.user_io_illegal,
            cfg.cpu.stop_on_nomem
        );

        Ok(Self {
            cpu,
            table: iset::build(cfg.cpu.user_io_illegal),
            mem,
            ints,
            panel,
            io: Io::new(),
            awp: None,
            awp_enabled: cfg.cpu.awp,
            nomem_stop: cfg.cpu.stop_on_nomem,
            speed_real: cfg.cpu.speed_real,
            sound_enabled,
            delay_factor: 1.0 / cfg.cpu.speed_factor as f64,
            throttle_granularity: cfg.cpu.throttle_granularity as u64 * 1000,
            timer: Instant::now(),
            time_cumulative: 0,
            ips: Arc::new(AtomicU64::new(0)),
            bin: BinLoader::default(),
        })
    }

    // ========== Handles for the embedder ==========

    pub fn memory(&self) -> Arc<Memory> {
        Arc::clone(&self.mem)
    }

    pub fn interrupts(&self) -> Arc<InterruptController> {
        Arc::clone(&self.ints)
    }

    pub fn panel(&self) -> Arc<ControlPanel> {
        Arc::clone(&self.panel)
    }

    pub fn io(&self) -> &Io {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut Io {
        &mut self.io
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    /// Plug in an arithmetic extension unit.
    pub fn set_awp(&mut self, unit: Box<dyn AwpUnit>) {
        self.awp = Some(unit);
    }

    /// Executed-instructions counter, for the front panel.
    pub fn ips_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.ips)
    }

    pub fn sound_enabled(&self) -> bool {
        self.sound_enabled
    }

    // ========== Memory paths ==========

    /// Memory did not answer. `barnb` marks accesses made on behalf of the
    /// controller through NB; those do not latch the alarm.
    pub(crate) fn mem_fail(&mut self, barnb: bool) {
        self.ints.set(src::NO_MEM);
        if !barnb {
            self.cpu.ralarm = true;
            if self.nomem_stop {
                self.panel.request_state(CpuState::Stop, None);
            }
        }
    }

    /// Controller-path read: through NB when `barnb`, absolute otherwise.
    pub(crate) fn ctl_mem_read(&mut self, barnb: bool, addr: u16) -> Option<u16> {
        let block = if barnb { self.cpu.nb } else { 0 };
        match self.mem.get(block, addr) {
            Ok(w) => Some(w),
            Err(_) => {
                self.mem_fail(barnb);
                None
            }
        }
    }

    pub(crate) fn ctl_mem_write(&mut self, barnb: bool, addr: u16, val: u16) -> bool {
        let block = if barnb { self.cpu.nb } else { 0 };
        if self.mem.put(block, addr, val).is_err() {
            self.mem_fail(barnb);
            return false;
        }
        true
    }

    /// Handler-path access: explicit block, fault always latches the alarm.
    pub(crate) fn mem_get(&mut self, block: u16, addr: u16) -> Option<u16> {
        match self.mem.get(block, addr) {
            Ok(w) => Some(w),
            Err(_) => {
                self.mem_fail(false);
                None
            }
        }
    }

    pub(crate) fn mem_put(&mut self, block: u16, addr: u16, val: u16) -> bool {
        if self.mem.put(block, addr, val).is_err() {
            self.mem_fail(false);
            return false;
        }
        true
    }

    pub(crate) fn mem_get_byte(&mut self, block: u16, byte_addr: u32) -> Option<u8> {
        match self.mem.get_byte(block, byte_addr) {
            Ok(b) => Some(b),
            Err(_) => {
                self.mem_fail(false);
                None
            }
        }
    }

    pub(crate) fn mem_put_byte(&mut self, block: u16, byte_addr: u32, val: u8) -> bool {
        if self.mem.put_byte(block, byte_addr, val).is_err() {
            self.mem_fail(false);
            return false;
        }
        true
    }

    /// Load consecutive words into R`first`.., stopping at the first fault.
    pub(crate) fn mem_mget_regs(&mut self, block: u16, addr: u16, first: usize, n: usize) {
        for i in 0..n {
            match self.mem.get(block, addr.wrapping_add(i as u16)) {
                Ok(w) => self.cpu.r[first + i] = w,
                Err(_) => {
                    self.mem_fail(false);
                    return;
                }
            }
        }
    }

    /// Store R`first`.. to consecutive words, stopping at the first fault.
    pub(crate) fn mem_mput_regs(&mut self, block: u16, addr: u16, first: usize, n: usize) {
        for i in 0..n {
            let val = self.cpu.r[first + i];
            if self.mem.put(block, addr.wrapping_add(i as u16), val).is_err() {
                self.mem_fail(false);
                return;
            }
        }
    }

    pub(crate) fn mem_mget_buf(&mut self, block: u16, addr: u16, buf: &mut [u16]) -> usize {
        let n = self.mem.mget(block, addr, buf);
        if n != buf.len() {
            self.mem_fail(false);
        }
        n
    }

    // ========== Context switching ==========

    /// Push {IC, R0, SR, arg} onto the process stack at the word pointed to
    /// by the stack pointer cell, then advance the cell. AR walks the frame.
    fn ctx_push(&mut self, arg: u16) -> bool {
        let Some(sp) = self.ctl_mem_read(false, STACK_POINTER) else {
            return false;
        };
        self.cpu.ar = sp;
        log::debug!(
            target: "cpu",
            "store ctx [IC 0x{:04x}, R0 0x{:04x}, SR 0x{:04x}, 0x{:04x}] @ 0x{:04x}",
            self.cpu.ic, self.cpu.r[0], self.cpu.sr_read(), arg, sp
        );
        let vector = [self.cpu.ic, self.cpu.r[0], self.cpu.sr_read(), arg];
        for word in vector {
            if !self.ctl_mem_write(false, self.cpu.ar, word) {
                return false;
            }
            self.cpu.ar = self.cpu.ar.wrapping_add(1);
        }
        self.ctl_mem_write(false, STACK_POINTER, self.cpu.ar)
    }

    fn ctx_commit(&mut self, new_ic: u16, int_mask: u16) {
        self.cpu.r[0] = 0;
        self.cpu.ic = new_ic;
        self.cpu.q = false;
        self.cpu.rm &= int_mask;
        self.ints.update_mask(self.cpu.rm);
    }

    /// Full context switch: push the current context, enter system mode at
    /// `new_ic` with RM narrowed by `int_mask`.
    pub(crate) fn ctx_switch(&mut self, arg: u16, new_ic: u16, int_mask: u16) {
        if self.ctx_push(arg) {
            self.ctx_commit(new_ic, int_mask);
        }
    }

    /// Undo an interrupt frame push whose vector fetch failed.
    pub(crate) fn sp_rewind(&mut self) {
        let Some(sp) = self.ctl_mem_read(false, STACK_POINTER) else {
            return;
        };
        self.ctl_mem_write(false, STACK_POINTER, sp.wrapping_sub(4));
    }

    /// Restore {IC, R0, SR} from the three words at AR. A fault mid-vector
    /// leaves the remaining words unread: targets already written stay
    /// written, SR and the interrupt mask are only updated when all three
    /// reads answered. This mirrors the original hardware-debugged flow and
    /// is covered by an explicit test.
    pub(crate) fn ctx_restore(&mut self, barnb: bool) {
        let Some(ic) = self.ctl_mem_read(barnb, self.cpu.ar) else {
            return;
        };
        self.cpu.ic = ic;
        self.cpu.ar = self.cpu.ar.wrapping_add(1);
        let Some(r0) = self.ctl_mem_read(barnb, self.cpu.ar) else {
            return;
        };
        self.cpu.r[0] = r0;
        self.cpu.ar = self.cpu.ar.wrapping_add(1);
        let Some(sr) = self.ctl_mem_read(barnb, self.cpu.ar) else {
            return;
        };
        self.cpu.ar = self.cpu.ar.wrapping_add(1);
        self.cpu.sr_write(sr);
        self.ints.update_mask(self.cpu.rm);
    }

    // ========== Interrupt service ==========

    fn int_serve(&mut self) {
        let Some(n) = self.ints.highest_deliverable() else {
            return;
        };
        let spec = match src::as_chan(n) {
            Some(chan) => self.io.intspec(chan),
            None => n as u16,
        };
        log::debug!(target: "cpu", "serving interrupt {} spec 0x{:04x}", n, spec);
        if !self.ctx_push(spec) {
            return;
        }
        let Some(new_ic) = self.ctl_mem_read(false, VECTOR_BASE + n as u16) else {
            self.sp_rewind();
            return;
        };
        self.ctx_commit(new_ic, interrupts::serve_mask(n));
        self.ints.clear(n);
    }

    // ========== Extension unit ==========

    pub(crate) fn awp_dispatch(&mut self, op: AwpOp, arg: u16) {
        match (&mut self.awp, self.awp_enabled) {
            (Some(unit), true) => {
                if unit.dispatch(op, arg, &mut self.cpu, &self.mem).is_err() {
                    self.ints.set(src::AWP_FAULT);
                }
            }
            _ => self.ints.set(src::ILLEGAL),
        }
    }

    // ========== Modifications option ==========

    pub(crate) fn cpu_mod_on(&mut self) {
        self.cpu.mod_active = true;
        self.ints.set_clock_source(src::EXTRA);
    }

    pub(crate) fn cpu_mod_off(&mut self) {
        self.cpu.mod_active = false;
        self.ints.set_clock_source(src::CLOCK);
    }

    // ========== Execution ==========

    fn ineffective(&mut self, time_so_far: u32) -> CycleOutcome {
        self.cpu.p = false;
        self.cpu.mc = 0;
        CycleOutcome {
            time: time_so_far + time::P,
            skip_throttle: false,
        }
    }

    /// One instruction cycle: fetch, decode, prepare the argument with the
    /// modification chain, execute.
    pub(crate) fn cycle(&mut self) -> CycleOutcome {
        let mut t = 0u32;
        self.ips.fetch_add(1, Ordering::Relaxed);

        // fetch
        let Some(ir) = self.ctl_mem_read(self.cpu.q, self.cpu.ic) else {
            log::debug!(target: "cpu", "no mem, instruction fetch @ 0x{:04x}", self.cpu.ic);
            return self.ineffective(time::NOANS_IF);
        };
        self.cpu.ic = self.cpu.ic.wrapping_add(1);
        self.cpu.ir = ir;
        let op = *self.table.get(ir);

        // effectiveness: a pending skip or an unmet jump condition skips the
        // instruction, including the long argument of a 2-word form
        if self.cpu.p || (self.cpu.r[0] & op.nef_mask) != op.nef_result {
            if op.flags.contains(OpFlags::ARG_NORM) && self.cpu.ir_c() == 0 {
                self.cpu.ic = self.cpu.ic.wrapping_add(1);
            }
            return self.ineffective(t);
        }

        // legality; the argument of illegal 2-word forms is not skipped
        if op.flags.contains(OpFlags::ILLEGAL) {
            log::debug!(target: "cpu", "illegal: 0x{:04x}", ir);
            self.ints.set(src::ILLEGAL);
            return self.ineffective(t);
        }
        if self.cpu.q && op.flags.contains(OpFlags::USER_ILLEGAL) {
            log::debug!(target: "cpu", "user illegal: 0x{:04x}", ir);
            self.ints.set(src::ILLEGAL);
            return self.ineffective(t);
        }
        if op.op == Op::Md && self.cpu.mc == 3 {
            log::debug!(target: "cpu", "illegal: 4th consecutive MD");
            self.ints.set(src::ILLEGAL);
            return self.ineffective(t);
        }

        // argument
        if op.flags.contains(OpFlags::ARG_NORM) {
            if self.cpu.ir_c() != 0 {
                self.cpu.ac = self.cpu.r[self.cpu.ir_c()];
            } else {
                let Some(arg) = self.ctl_mem_read(self.cpu.q, self.cpu.ic) else {
                    log::debug!(target: "cpu", "no mem, long arg fetch");
                    return self.ineffective(t + time::NOANS_IF);
                };
                self.cpu.ac = arg;
                self.cpu.ic = self.cpu.ic.wrapping_add(1);
                t += time::MEM_ARG;
            }
        } else if op.flags.contains(OpFlags::ARG_SHORT) {
            self.cpu.ac = self.cpu.ir_t() as u16;
        } else if op.flags.contains(OpFlags::ARG_BYTE) {
            self.cpu.ac = self.cpu.ir_byte();
        }

        // pre-mod
        if self.cpu.mc > 0 {
            self.cpu.zc17 = self.cpu.ac as u32 + self.cpu.ar as u32 > 0xFFFF;
            self.cpu.ac = self.cpu.ac.wrapping_add(self.cpu.ar);
            t += time::PREMOD;
        } else {
            self.cpu.zc17 = false;
        }

        // B-mod
        if op.flags.contains(OpFlags::ARG_NORM) && self.cpu.ir_b() != 0 {
            let idx = self.cpu.r[self.cpu.ir_b()];
            self.cpu.zc17 = self.cpu.ac as u32 + idx as u32 > 0xFFFF;
            self.cpu.ac = self.cpu.ac.wrapping_add(idx);
            t += time::BMOD;
        }

        self.cpu.ar = self.cpu.ac;

        // D-mod
        if op.flags.contains(OpFlags::ARG_NORM) && self.cpu.ir_d() {
            let Some(ind) = self.ctl_mem_read(self.cpu.q, self.cpu.ac) else {
                log::debug!(target: "cpu", "no mem, indirect arg fetch");
                return self.ineffective(t + time::NOANS_IF);
            };
            self.cpu.ac = ind;
            self.cpu.ar = ind;
            t += time::DMOD;
        }

        self.execute(op.op);
        t += op.time;

        if op.op != Op::Md {
            self.cpu.mc = 0;
        }
        if op.op == Op::Shc {
            t += self.cpu.ir_shift() as u32 * time::SHIFT;
        }

        CycleOutcome {
            time: t,
            skip_throttle: op.op == Op::Ou,
        }
    }

    /// One RUN tick: serve a deliverable interrupt, or execute one cycle.
    pub fn run_tick(&mut self) -> CycleOutcome {
        if self.ints.any_deliverable() && !self.cpu.p && self.cpu.mc == 0 {
            self.int_serve();
            CycleOutcome {
                time: time::INT_SERVE,
                skip_throttle: false,
            }
        } else {
            self.cycle()
        }
    }

    // ========== Binary load ==========

    fn bin_start(&mut self) {
        log::debug!(target: "cpu", "binary load initiated @ 0x{:04x}", self.cpu.ar);
        self.bin = BinLoader::default();
    }

    fn bin_step(&mut self) -> bool {
        let mut data = 0u16;
        if self.io.dispatch(IoDir::In, self.cpu.ic, &mut data) != IoResult::Ok {
            return false;
        }
        let byte = data as u8;
        if self.bin.cnt == 0 && bin_is_end(byte) {
            log::debug!(target: "cpu", "binary load done, {} words", self.bin.words);
            return true;
        }
        if bin_is_valid(byte) {
            self.bin.buf[self.bin.cnt] = byte;
            self.bin.cnt += 1;
            if self.bin.cnt >= 3 {
                self.bin.cnt = 0;
                let word = bin_word(&self.bin.buf);
                if self.ctl_mem_write(self.cpu.q, self.cpu.ar, word) {
                    self.bin.words += 1;
                    self.cpu.ar = self.cpu.ar.wrapping_add(1);
                }
            }
        }
        false
    }

    // ========== Master/operator clear ==========

    fn do_clear(&mut self, operator: bool) {
        // I/O first, so nothing changes CPU state behind the clear
        self.io.reset();
        self.mem.reset();
        self.cpu_mod_off();
        self.cpu.r[0] = 0;
        self.cpu.sr_write(0);
        self.ints.update_mask(self.cpu.rm);
        self.ints.clear_all();
        if operator {
            self.cpu.ralarm = false;
            self.cpu.mc = 0;
        }
    }

    // ========== Timekeeping ==========

    fn timekeeping(&mut self, outcome: CycleOutcome) {
        let t = (outcome.time as f64 * self.delay_factor) as u64;
        self.time_cumulative += t;
        if !outcome.skip_throttle && self.time_cumulative >= self.throttle_granularity {
            self.timer += Duration::from_nanos(self.time_cumulative);
            self.time_cumulative = 0;
            let now = Instant::now();
            if self.timer > now {
                thread::sleep(self.timer - now);
            }
        }
    }

    // ========== The loop ==========

    /// The CPU thread body. Returns when the state goes OFF.
    pub fn run_loop(&mut self) {
        self.panel.request_state(CpuState::Stop, None);
        self.timer = Instant::now();

        loop {
            let mut outcome = CycleOutcome::idle();

            match self.panel.state() {
                CpuState::Cycle => {
                    self.panel.request_state(CpuState::Stop, Some(CpuState::Cycle));
                    outcome = self.run_tick();
                }
                CpuState::Run => {
                    outcome = self.run_tick();
                }
                CpuState::Off => {
                    log::debug!(target: "cpu", "powering off");
                    return;
                }
                CpuState::ClearMaster => {
                    self.do_clear(false);
                    self.panel
                        .request_state(CpuState::Run, Some(CpuState::ClearMaster));
                }
                CpuState::ClearOperator => {
                    self.do_clear(true);
                    self.panel
                        .request_state(CpuState::Stop, Some(CpuState::ClearOperator));
                }
                CpuState::BinLoad => {
                    if self.bin_step() {
                        self.panel
                            .request_state(CpuState::Stop, Some(CpuState::BinLoad));
                    }
                }
                CpuState::Stop => {
                    log::debug!(target: "cpu", "idling in state STOP");
                    let res = self.panel.wait_while_stopped();
                    if self.speed_real && res == CpuState::Run {
                        self.timer = Instant::now();
                        self.time_cumulative = 0;
                    } else if res == CpuState::BinLoad {
                        self.bin_start();
                    }
                }
                CpuState::Wait => {
                    if self.speed_real {
                        if self.ints.any_deliverable() && !self.cpu.p && self.cpu.mc == 0 {
                            self.panel.request_state(CpuState::Run, Some(CpuState::Wait));
                        } else {
                            outcome.time = self.throttle_granularity as u32;
                        }
                    } else {
                        log::debug!(target: "cpu", "idling in state WAIT");
                        let ints = Arc::clone(&self.ints);
                        let (p, mc) = (self.cpu.p, self.cpu.mc);
                        self.panel
                            .wait_while_idle(move || ints.any_deliverable() && !p && mc == 0);
                    }
                }
            }

            if self.speed_real {
                self.timekeeping(outcome);
            }
        }
    }
}

impl Drop for Emu {
    fn drop(&mut self) {
        self.io.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::flags;

    pub(crate) fn emu() -> Emu {
        Emu::new(&Config::default()).unwrap()
    }

    #[test]
    fn test_bin_byte_classes() {
        assert!(bin_is_end(0x40));
        assert!(bin_is_end(0x7F));
        assert!(!bin_is_end(0x01));
        assert!(!bin_is_valid(0x00));
        assert!(bin_is_valid(0x01));
        assert!(bin_is_valid(0xC1));
        assert!(!bin_is_valid(0x41));
    }

    #[test]
    fn test_bin_word_packing() {
        assert_eq!(bin_word(&[0x01, 0x02, 0x03]), 0x1083);
        assert_eq!(bin_word(&[0x0F, 0x3F, 0x3F]), 0xFFFF);
    }

    #[test]
    fn test_ctx_switch_and_restore_roundtrip() {
        let mut e = emu();
        e.mem.put(0, STACK_POINTER, 0x0100).unwrap();
        e.cpu.ic = 0x1234;
        e.cpu.r[0] = flags::Z | flags::C;
        e.cpu.rm = 0x3FF;
        e.cpu.q = true;
        e.cpu.nb = 0; // block 0 stays addressable in user mode for the test
        let sr = e.cpu.sr_read();

        e.ctx_switch(0xBEEF, 0x0200, interrupts::MASK_9);
        assert_eq!(e.cpu.ic, 0x0200);
        assert_eq!(e.cpu.r[0], 0);
        assert!(!e.cpu.q);
        assert_eq!(e.cpu.rm, 0x3FF & interrupts::MASK_9);
        // frame on the stack
        assert_eq!(e.mem.get(0, 0x0100), Ok(0x1234));
        assert_eq!(e.mem.get(0, 0x0101), Ok(flags::Z | flags::C));
        assert_eq!(e.mem.get(0, 0x0102), Ok(sr));
        assert_eq!(e.mem.get(0, 0x0103), Ok(0xBEEF));
        assert_eq!(e.mem.get(0, STACK_POINTER), Ok(0x0104));

        // restore from the frame
        e.cpu.ar = 0x0100;
        e.ctx_restore(false);
        assert_eq!(e.cpu.ic, 0x1234);
        assert_eq!(e.cpu.r[0], flags::Z | flags::C);
        assert_eq!(e.cpu.sr_read(), sr);
    }

    #[test]
    fn test_ctx_restore_fault_mid_vector() {
        let mut e = emu();
        // IC word mapped, the rest of the vector is off the map
        e.mem.put(0, 0x0FFF, 0x4321).unwrap();
        e.cpu.ar = 0x0FFF;
        e.cpu.r[0] = 0x1111;
        let rm_before = e.cpu.rm;

        e.ctx_restore(true);
        // first word landed, the remaining two were skipped
        assert_eq!(e.cpu.ic, 0x4321);
        assert_eq!(e.cpu.r[0], 0x1111);
        assert_eq!(e.cpu.rm, rm_before);
        // the barnb path raises the interrupt but does not latch the alarm
        assert!(e.ints.is_pending(src::NO_MEM));
        assert!(!e.cpu.ralarm);
    }

    #[test]
    fn test_sp_rewind() {
        let mut e = emu();
        e.mem.put(0, STACK_POINTER, 0x0104).unwrap();
        e.sp_rewind();
        assert_eq!(e.mem.get(0, STACK_POINTER), Ok(0x0100));
    }

    #[test]
    fn test_serve_uses_priority_and_masks_rm() {
        let mut e = emu();
        e.cpu.rm = 0x3FF;
        e.ints.update_mask(0x3FF);
        e.mem.put(0, STACK_POINTER, 0x0100).unwrap();
        // vectors
        e.mem
            .put(0, VECTOR_BASE + src::ILLEGAL as u16, 0x0300)
            .unwrap();
        e.mem.put(0, VECTOR_BASE + src::CLOCK as u16, 0x0400).unwrap();

        e.ints.set(src::CLOCK);
        e.ints.set(src::ILLEGAL);
        e.int_serve();
        // highest priority first
        assert_eq!(e.cpu.ic, 0x0300);
        assert!(!e.ints.is_pending(src::ILLEGAL));
        assert!(e.ints.is_pending(src::CLOCK));
        // serving interrupt 6 (group 2) leaves only groups 0..1 open
        assert_eq!(e.cpu.rm, 0b11_0000_0000);
        // saved spec for a non-channel interrupt is its number
        assert_eq!(e.mem.get(0, 0x0103), Ok(src::ILLEGAL as u16));
    }

    #[test]
    fn test_serve_frame_fault_commits_nothing() {
        let mut e = emu();
        e.cpu.rm = 0;
        e.ints.update_mask(0);
        // the frame would land in unmapped memory
        e.mem.put(0, STACK_POINTER, 0x1000).unwrap();
        e.ints.set(src::NO_MEM);
        e.int_serve();
        assert_eq!(e.cpu.ic, 0);
        assert_eq!(e.cpu.r[0], 0);
    }

    #[test]
    fn test_awp_absent_is_illegal() {
        let mut e = emu();
        e.awp_dispatch(AwpOp::Ad, 0x100);
        assert!(e.ints.is_pending(src::ILLEGAL));
    }

    #[test]
    fn test_do_clear_scopes() {
        let mut e = emu();
        e.cpu.ralarm = true;
        e.cpu.mc = 2;
        e.cpu.r[0] = 0xFFFF;
        e.do_clear(false);
        assert_eq!(e.cpu.r[0], 0);
        // master clear leaves the alarm and MC alone
        assert!(e.cpu.ralarm);
        assert_eq!(e.cpu.mc, 2);
        e.do_clear(true);
        assert!(!e.cpu.ralarm);
        assert_eq!(e.cpu.mc, 0);
    }
}
