//! Emulator configuration
//!
//! Plain data consumed at init time. Parsing a configuration file into these
//! structs is the job of the embedding program; the core only validates the
//! few combinations it cares about (see `Emu::new`).

/// CPU options.
#[derive(Debug, Clone)]
pub struct CpuConfig {
    /// Arithmetic extension unit present
    pub awp: bool,
    /// Initial state of the operator key register
    pub kb: u16,
    /// CPU modifications option installed (MX-16 changes)
    pub modifications: bool,
    /// I/O instructions are illegal in user mode
    pub user_io_illegal: bool,
    /// Unserviced memory fault stops the CPU
    pub stop_on_nomem: bool,
    /// Throttle execution to real MERA-400 speed
    pub speed_real: bool,
    /// Throttling granularity in microseconds
    pub throttle_granularity: u32,
    /// Speed multiplier relative to real hardware (0.1 .. 2.0 with sound)
    pub speed_factor: f32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            awp: true,
            kb: 0,
            modifications: false,
            user_io_illegal: true,
            stop_on_nomem: true,
            speed_real: false,
            throttle_granularity: 10,
            speed_factor: 1.0,
        }
    }
}

/// Sound (CPU buzzer) options. The driver itself lives outside the core.
#[derive(Debug, Clone, Default)]
pub struct SoundConfig {
    pub enabled: bool,
}

/// Physical memory configuration.
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// Segment count for each of the 16 physical modules (0 = not installed)
    pub modules: [u8; 16],
    /// Boot from the top segment: forces IC = 0xF000 at power-on and maps
    /// the boot segment at block 0, sub-block 15
    pub mega_boot: bool,
}

impl Default for MemConfig {
    fn default() -> Self {
        let mut modules = [0; 16];
        modules[0] = 8;
        Self {
            modules,
            mega_boot: false,
        }
    }
}

/// Complete core configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub cpu: CpuConfig,
    pub sound: SoundConfig,
    pub mem: MemConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.cpu.awp);
        assert_eq!(cfg.cpu.kb, 0);
        assert!(cfg.cpu.user_io_illegal);
        assert!(!cfg.cpu.speed_real);
        assert_eq!(cfg.mem.modules[0], 8);
        assert!(!cfg.mem.mega_boot);
        assert!(!cfg.sound.enabled);
    }
}
