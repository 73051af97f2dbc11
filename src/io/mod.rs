//! I/O dispatcher
//!
//! Routes IN/OU operands to channel drivers. The channel number sits in
//! bits 4..1 of the operand word; everything else is interpreted by the
//! addressed channel. Calls are synchronous and answer with one of the
//! four bus replies; completions arrive later through the interrupt
//! controller.

pub mod multix;

/// Transfer direction of an I/O instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    /// OU
    Out,
    /// IN
    In,
}

/// The four possible bus answers to an I/O instruction. The numeric value
/// selects one of the four return vectors following the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResult {
    /// Done
    Ok,
    /// Channel engaged, retry later
    Engaged,
    /// Nothing answered at this address
    NoDevice,
    /// Parity or transmission error
    ParityError,
}

impl IoResult {
    /// Offset into the OK/EN/NE/PE return-vector chain.
    pub fn skip_offset(self) -> u16 {
        match self {
            IoResult::Ok => 0,
            IoResult::Engaged => 1,
            IoResult::NoDevice => 2,
            IoResult::ParityError => 3,
        }
    }
}

/// Number of channel slots.
pub const CHAN_MAX: usize = 16;

/// A channel driver. Each driver owns its concurrency; the CPU thread only
/// ever calls these entries.
pub trait ChanDriver: Send {
    fn name(&self) -> &'static str;

    /// Channel reset (operator clear, or the channel RESET command).
    fn reset(&self);

    /// Synchronous command entry. `n_arg` is the full operand word,
    /// `r_arg` the A-register of the I/O instruction (read and/or written
    /// depending on the command).
    fn cmd(&self, dir: IoDir, n_arg: u16, r_arg: &mut u16) -> IoResult;

    /// Read-and-clear the latched interrupt specification.
    fn intspec(&self) -> u16 {
        0
    }

    /// Structured teardown; must stop the driver's threads.
    fn shutdown(&self);
}

/// A configured channel slot with no real controller behind it.
pub struct NullChannel;

impl ChanDriver for NullChannel {
    fn name(&self) -> &'static str {
        "none"
    }

    fn reset(&self) {}

    fn cmd(&self, _dir: IoDir, _n_arg: u16, _r_arg: &mut u16) -> IoResult {
        IoResult::NoDevice
    }

    fn shutdown(&self) {}
}

/// The per-channel driver table.
pub struct Io {
    channels: [Option<Box<dyn ChanDriver>>; CHAN_MAX],
}

impl Io {
    pub fn new() -> Self {
        Self {
            channels: Default::default(),
        }
    }

    /// Install a driver in a channel slot.
    pub fn attach(&mut self, chan: usize, driver: Box<dyn ChanDriver>) {
        log::debug!(target: "io", "channel {}: {}", chan, driver.name());
        self.channels[chan] = Some(driver);
    }

    /// Route an I/O instruction to its channel.
    pub fn dispatch(&self, dir: IoDir, n_arg: u16, r_arg: &mut u16) -> IoResult {
        let chan = ((n_arg >> 1) & 0xF) as usize;
        let res = match &self.channels[chan] {
            Some(driver) => driver.cmd(dir, n_arg, r_arg),
            None => IoResult::NoDevice,
        };
        log::trace!(
            target: "io",
            "dispatch {:?} chan {} n 0x{:04x} -> {:?}",
            dir, chan, n_arg, res
        );
        res
    }

    /// Interrupt specification of a channel (consumed during interrupt
    /// service).
    pub fn intspec(&self, chan: usize) -> u16 {
        match &self.channels[chan] {
            Some(driver) => driver.intspec(),
            None => 0,
        }
    }

    /// Reset every configured channel.
    pub fn reset(&self) {
        for driver in self.channels.iter().flatten() {
            driver.reset();
        }
    }

    /// Tear down every configured channel.
    pub fn shutdown(&mut self) {
        for slot in self.channels.iter_mut() {
            if let Some(driver) = slot.take() {
                driver.shutdown();
            }
        }
    }
}

impl Default for Io {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;

    struct Probe {
        last: Arc<AtomicU16>,
    }

    impl ChanDriver for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }
        fn reset(&self) {}
        fn cmd(&self, _dir: IoDir, n_arg: u16, _r_arg: &mut u16) -> IoResult {
            self.last.store(n_arg, Ordering::Relaxed);
            IoResult::Ok
        }
        fn shutdown(&self) {}
    }

    #[test]
    fn test_dispatch_routes_by_channel_bits() {
        let last = Arc::new(AtomicU16::new(0));
        let mut io = Io::new();
        io.attach(3, Box::new(Probe { last: Arc::clone(&last) }));

        let mut r = 0;
        // channel number lives in bits 4..1
        let n = 3 << 1;
        assert_eq!(io.dispatch(IoDir::Out, n, &mut r), IoResult::Ok);
        assert_eq!(last.load(Ordering::Relaxed), n);

        // unconfigured channel answers NE
        assert_eq!(io.dispatch(IoDir::Out, 5 << 1, &mut r), IoResult::NoDevice);
    }

    #[test]
    fn test_null_channel() {
        let mut io = Io::new();
        io.attach(0, Box::new(NullChannel));
        let mut r = 0;
        assert_eq!(io.dispatch(IoDir::In, 0, &mut r), IoResult::NoDevice);
    }

    #[test]
    fn test_skip_offsets() {
        assert_eq!(IoResult::Ok.skip_offset(), 0);
        assert_eq!(IoResult::Engaged.skip_offset(), 1);
        assert_eq!(IoResult::NoDevice.skip_offset(), 2);
        assert_eq!(IoResult::ParityError.skip_offset(), 3);
    }
}
