//! Line protocols and the device surface
//!
//! A protocol interprets channel commands for one logical line; a unit is
//! the byte-oriented device behind the physical line. Protocols run on the
//! line's worker thread and answer every command with the interrupt code
//! the channel should enqueue.
//!
//! The magnetic tape protocol is a placeholder: it accepts configuration
//! but has no command functions, so every command addressed to it is
//! rejected by the channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::line::{dir, phy};
use super::{irq, MxCmd, MxInner};

/// Byte-oriented device bound to a physical line.
pub trait Unit: Send {
    fn name(&self) -> &'static str;
    fn reset(&mut self);
    /// Next input byte, `None` when drained.
    fn read_byte(&mut self) -> Option<u8>;
    /// Consume one output byte; `false` when the device cannot take it.
    fn write_byte(&mut self, byte: u8) -> bool;
}

/// An in-memory unit: reads from a preloaded buffer, collects writes.
pub struct BufferUnit {
    input: VecDeque<u8>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl BufferUnit {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input: input.into(),
            output: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to everything written to the unit.
    pub fn output(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.output)
    }
}

impl Unit for BufferUnit {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn reset(&mut self) {}

    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn write_byte(&mut self, byte: u8) -> bool {
        self.output.lock().unwrap().push(byte);
        true
    }
}

/// What a protocol command handler sees: the channel's memory surface, the
/// logical line number, the command data address and the line's unit.
pub struct LineCtx<'a> {
    pub(crate) chan: &'a MxInner,
    pub log_n: usize,
    pub addr: u16,
    pub(crate) unit: Option<&'a mut Box<dyn Unit>>,
}

impl LineCtx<'_> {
    /// Read words from guest memory (absolute block). Dropped while the
    /// channel is uninitialized.
    pub fn mem_read(&self, addr: u16, buf: &mut [u16]) -> bool {
        self.chan.mem_read_words(0, addr, buf)
    }

    /// Write words to guest memory (absolute block).
    pub fn mem_write(&self, addr: u16, words: &[u16]) -> bool {
        self.chan.mem_write_words(0, addr, words)
    }

    pub fn unit(&mut self) -> Option<&mut dyn Unit> {
        self.unit.as_mut().map(|u| u.as_mut() as &mut dyn Unit)
    }
}

/// A line protocol.
pub trait Protocol: Send {
    fn name(&self) -> &'static str;
    /// Direction bits the physical line must provide.
    fn dir(&self) -> u16;
    /// Physical line types the protocol accepts.
    fn phy_types(&self) -> &'static [u16];
    /// Consume the three protocol-specific configuration words.
    fn init(&mut self, args: &[u16]) -> Result<(), u8>;
    /// Whether the protocol has a function for the command at all.
    fn supports(&self, cmd: MxCmd) -> bool;
    /// Execute a command; returns the completion interrupt code.
    fn run(&mut self, cmd: MxCmd, ctx: &mut LineCtx) -> u8;
}

/// Protocol numbers understood by SETCFG.
pub const PROTO_PUNCH_READER: u16 = 0;
pub const PROTO_WINCHESTER: u16 = 5;
pub const PROTO_MTAPE: u16 = 6;

/// Protocol registry.
pub(crate) fn proto_new(num: u16) -> Option<Box<dyn Protocol>> {
    match num {
        PROTO_PUNCH_READER => Some(Box::new(PunchReader)),
        PROTO_WINCHESTER => Some(Box::new(Winchester)),
        PROTO_MTAPE => Some(Box::new(MTape)),
        _ => None,
    }
}

/// Punched tape reader: an input USART line. The transmit descriptor is
/// two words at the command address: destination address and word count.
/// Unit bytes are packed big-endian, two per word.
struct PunchReader;

impl Protocol for PunchReader {
    fn name(&self) -> &'static str {
        "punch reader"
    }

    fn dir(&self) -> u16 {
        dir::INPUT
    }

    fn phy_types(&self) -> &'static [u16] {
        &[phy::USART_SYNC, phy::USART_ASYNC]
    }

    fn init(&mut self, _args: &[u16]) -> Result<(), u8> {
        Ok(())
    }

    fn supports(&self, cmd: MxCmd) -> bool {
        matches!(
            cmd,
            MxCmd::Attach | MxCmd::Detach | MxCmd::Transmit | MxCmd::Abort
        )
    }

    fn run(&mut self, cmd: MxCmd, ctx: &mut LineCtx) -> u8 {
        match cmd {
            MxCmd::Attach => irq::IDOLI,
            MxCmd::Detach => irq::IODLI,
            MxCmd::Abort => irq::IABTR,
            MxCmd::Transmit => self.transmit(ctx),
            _ => irq::INTRA,
        }
    }
}

impl PunchReader {
    fn transmit(&self, ctx: &mut LineCtx) -> u8 {
        let mut desc = [0u16; 2];
        if !ctx.mem_read(ctx.addr, &mut desc) {
            return irq::INPAO;
        }
        let [dest, count] = desc;
        log::debug!(
            target: "mx",
            "line {}: transmit {} words to 0x{:04x}",
            ctx.log_n, count, dest
        );
        let Some(unit) = ctx.unit() else {
            return irq::INTRA;
        };
        let mut words = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(hi) = unit.read_byte() else { break };
            let lo = unit.read_byte().unwrap_or(0);
            words.push((hi as u16) << 8 | lo as u16);
        }
        if !ctx.mem_write(dest, &words) {
            return irq::INPAO;
        }
        irq::IETRA
    }
}

/// Winchester disk line: attach/detach bookkeeping only; transfers are not
/// emulated on this protocol.
struct Winchester;

impl Protocol for Winchester {
    fn name(&self) -> &'static str {
        "winchester"
    }

    fn dir(&self) -> u16 {
        dir::NONE
    }

    fn phy_types(&self) -> &'static [u16] {
        &[phy::WINCHESTER]
    }

    fn init(&mut self, _args: &[u16]) -> Result<(), u8> {
        Ok(())
    }

    fn supports(&self, cmd: MxCmd) -> bool {
        matches!(cmd, MxCmd::Attach | MxCmd::Detach)
    }

    fn run(&mut self, cmd: MxCmd, _ctx: &mut LineCtx) -> u8 {
        match cmd {
            MxCmd::Attach => irq::IDOLI,
            MxCmd::Detach => irq::IODLI,
            _ => irq::INTRA,
        }
    }
}

/// Magnetic tape formatter: configuration-only stub, no command functions.
struct MTape;

impl Protocol for MTape {
    fn name(&self) -> &'static str {
        "tape"
    }

    fn dir(&self) -> u16 {
        dir::NONE
    }

    fn phy_types(&self) -> &'static [u16] {
        &[phy::MTAPE]
    }

    fn init(&mut self, _args: &[u16]) -> Result<(), u8> {
        Ok(())
    }

    fn supports(&self, _cmd: MxCmd) -> bool {
        false
    }

    fn run(&mut self, _cmd: MxCmd, _ctx: &mut LineCtx) -> u8 {
        irq::INTRA
    }
}
