//! Physical and logical lines
//!
//! A physical line carries a direction, a used bit, a device type and an
//! optional backing unit. Binding a protocol to a physical line makes it a
//! logical line with its own command queue and worker thread. The status
//! word is guarded by a per-line mutex; the channel holds that mutex across
//! a status write and the matching interrupt enqueue so the word the CPU
//! reads is the one the interrupt describes.

use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;
use std::thread::JoinHandle;

use bitflags::bitflags;

use super::proto::{Protocol, Unit};
use super::{MxCmd, MxEvent};
use crate::event_list::EventList;

/// Line transfer directions (3-bit field in the physical descriptor).
pub mod dir {
    pub const NONE: u16 = 0b000;
    pub const INPUT: u16 = 0b010;
    pub const OUTPUT: u16 = 0b100;
    pub const HALF_DUPLEX: u16 = 0b110;
    pub const FULL_DUPLEX: u16 = 0b111;
}

/// Physical line types.
pub mod phy {
    pub const USART_SYNC: u16 = 0;
    pub const USART_ASYNC: u16 = 1;
    pub const P8255: u16 = 2;
    pub const WINCHESTER: u16 = 3;
    pub const MTAPE: u16 = 4;
    pub const FLOPPY: u16 = 5;
    /// Number of known types
    pub const COUNT: u16 = 6;
}

bitflags! {
    /// Line status word. The low 16 bits are reported to the OS by the
    /// STATUS command; the high bits track commands in flight.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineStatus: u32 {
        const ATTACHED = 1 << 0;
        const TRANS = 1 << 1;
        const CMD_ATTACH = 1 << 16;
        const CMD_DETACH = 1 << 17;
        const CMD_ABORT = 1 << 18;
    }
}

/// Marker for "no logical number assigned".
pub(crate) const LOG_NONE: usize = usize::MAX;

/// Physical-line configuration installed by SETCFG.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LineConf {
    pub dir: u16,
    pub used: bool,
    pub typ: u16,
}

/// One physical line slot.
pub(crate) struct Line {
    pub conf: Mutex<LineConf>,
    pub status: Mutex<LineStatus>,
    pub devq: EventList<MxEvent>,
    pub proto: Mutex<Option<Box<dyn Protocol>>>,
    pub unit: Mutex<Option<Box<dyn Unit>>>,
    pub log_n: AtomicUsize,
    pub thread: Mutex<Option<JoinHandle<()>>>,
}

impl Line {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            conf: Mutex::new(LineConf::default()),
            status: Mutex::new(LineStatus::empty()),
            devq: EventList::new(queue_capacity),
            proto: Mutex::new(None),
            unit: Mutex::new(None),
            log_n: AtomicUsize::new(LOG_NONE),
            thread: Mutex::new(None),
        }
    }
}

/// Status bits a command sets while it is in flight.
pub(crate) fn cmd_state(cmd: MxCmd) -> LineStatus {
    match cmd {
        MxCmd::Attach => LineStatus::CMD_ATTACH,
        MxCmd::Detach => LineStatus::CMD_DETACH,
        MxCmd::Transmit => LineStatus::TRANS,
        MxCmd::Abort => LineStatus::CMD_ABORT,
        _ => LineStatus::empty(),
    }
}

/// Whether the line's current status permits the command.
pub(crate) fn cmd_allowed(status: LineStatus, cmd: MxCmd) -> bool {
    match cmd {
        MxCmd::Attach => !status.intersects(LineStatus::ATTACHED | LineStatus::CMD_ATTACH),
        MxCmd::Detach => !status.intersects(LineStatus::TRANS | LineStatus::CMD_DETACH),
        MxCmd::Transmit => {
            status.contains(LineStatus::ATTACHED) && !status.contains(LineStatus::TRANS)
        }
        MxCmd::Abort => status.contains(LineStatus::TRANS),
        _ => true,
    }
}

/// Status update once the protocol finished a command. `done` tells whether
/// the completion interrupt is the success variant.
pub(crate) fn apply_completion(status: &mut LineStatus, cmd: MxCmd, done: bool) {
    match cmd {
        MxCmd::Attach => {
            status.remove(LineStatus::CMD_ATTACH);
            if done {
                status.insert(LineStatus::ATTACHED);
            }
        }
        MxCmd::Detach => {
            status.remove(LineStatus::CMD_DETACH | LineStatus::ATTACHED);
        }
        MxCmd::Transmit => {
            status.remove(LineStatus::TRANS);
        }
        MxCmd::Abort => {
            status.remove(LineStatus::CMD_ABORT | LineStatus::TRANS);
        }
        _ => {}
    }
}
