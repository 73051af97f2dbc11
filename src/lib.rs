//! MERA-400 Emulator Core
//!
//! This crate emulates the core of a MERA-400 minicomputer: the 16-bit CPU
//! with its instruction set and modification chain, segmented memory with
//! virtual-block remapping, the prioritized interrupt system and the
//! intelligent multi-line I/O channel serving concurrently with the CPU.
//! Bootstrap, configuration parsing and the front panel UI belong to the
//! embedding program.
//!
//! # Architecture
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `memory`     | Module/segment allocation and the block map           |
//! | `interrupts` | 32-source prioritized controller with the RM mask     |
//! | `event_list` | Bounded priority queue shared by the channel threads  |
//! | `panel`      | Operator state surface (RUN/STOP/... plus the keys)   |
//! | `cpu`        | Register file, decode table, ALU, instruction set     |
//! | `emu`        | State machine, execution loop, throttling, binary load|
//! | `io`         | Channel dispatch and the multiplexer                  |
//!
//! # Threads
//!
//! One CPU thread runs [`Emu::run_loop`]; each multiplexer channel adds an
//! event worker plus one protocol worker per configured logical line. The
//! only CPU-side entry other threads use is `InterruptController::set`.

pub mod cfg;
pub mod cpu;
pub mod emu;
pub mod event_list;
pub mod interrupts;
pub mod io;
pub mod memory;
pub mod panel;

pub use cfg::Config;
pub use emu::{AwpFault, AwpOp, AwpUnit, CycleOutcome, Emu, InitError};
pub use panel::{ControlPanel, CpuState};
