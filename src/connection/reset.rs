//! Strategies for getting the target into its boot ROM
//!
//! The boot pin is sampled while the chip comes out of reset, so every
//! strategy is some arrangement of "assert boot, pulse reset, wait". Boards
//! differ in line polarity and in whether they need a full power cycle first,
//! which is what the knobs on [`ResetConfig`] express.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, transport::Transport};

/// Magic written to vendor USB serial bridges to make the on-board MCU
/// perform the boot/reset sequence on the host's behalf.
const USB_BRIDGE_MAGIC: &[u8] = b"BOUFFALOLAB5555RESET";

/// Line timing for the reset and power-cycle sequences.
#[derive(Debug, Clone, Copy)]
pub struct ResetConfig {
    /// How long the reset line is held asserted, in milliseconds.
    pub hold_ms: u64,
    /// Settle time between releasing reset and the first sync burst.
    pub shake_delay_ms: u64,
    /// Invert the reset line polarity.
    pub reset_revert: bool,
    /// Power-cut duration before the reset pulse; 0 disables the power cycle.
    pub cutoff_ms: u64,
    /// Invert the power line polarity.
    pub cutoff_revert: bool,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            hold_ms: 100,
            shake_delay_ms: 100,
            reset_revert: true,
            cutoff_ms: 0,
            cutoff_revert: false,
        }
    }
}

/// Some strategy for resetting a target device into its boot ROM.
pub trait ResetStrategy {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error>;
}

/// Classic sequence over the reset/boot lines: boot asserted, then the reset
/// line pulsed twice with the configured hold and settle times.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    hold_ms: u64,
    shake_delay_ms: u64,
    revert: bool,
    pulses: u32,
}

impl ClassicReset {
    /// Hold times above one second encode a pulse count in their upper
    /// digits: 2500 means 2 pulses of 500 ms each.
    pub fn new(config: &ResetConfig) -> Self {
        let (pulses, hold_ms) = if config.hold_ms > 1000 {
            ((config.hold_ms / 1000) as u32, config.hold_ms % 1000)
        } else {
            (2, config.hold_ms)
        };

        Self {
            hold_ms,
            shake_delay_ms: config.shake_delay_ms,
            revert: config.reset_revert,
            pulses,
        }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!(
            "Using classic reset: {} pulse(s), hold {}ms, settle {}ms",
            self.pulses, self.hold_ms, self.shake_delay_ms
        );

        let asserted = !self.revert;

        transport.set_boot(true)?;
        for _ in 0..self.pulses {
            transport.set_reset(asserted)?;
            sleep(Duration::from_millis(self.hold_ms));
            transport.set_reset(!asserted)?;
            sleep(Duration::from_millis(self.shake_delay_ms));
        }

        Ok(())
    }
}

/// Cuts power to the target before the reset pulse, for boards where the
/// boot/power line feeds the chip's supply rail.
#[derive(Debug, Clone, Copy)]
pub struct PowerCycleReset {
    cutoff_ms: u64,
    revert: bool,
    classic: ClassicReset,
}

impl PowerCycleReset {
    /// Cutoff times above one second invert the power polarity and keep the
    /// remainder as the actual cut duration.
    pub fn new(config: &ResetConfig) -> Self {
        let (revert, cutoff_ms) = if config.cutoff_ms > 1000 {
            (!config.cutoff_revert, config.cutoff_ms - 1000)
        } else {
            (config.cutoff_revert, config.cutoff_ms)
        };

        Self {
            cutoff_ms,
            revert,
            classic: ClassicReset::new(config),
        }
    }
}

impl ResetStrategy for PowerCycleReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Power-cycling target for {}ms", self.cutoff_ms);

        transport.set_reset(true)?;
        sleep(Duration::from_millis(200));
        transport.set_reset(false)?;
        sleep(Duration::from_millis(50));
        transport.set_reset(true)?;

        // Cut power, then restore it.
        transport.set_boot(self.revert)?;
        sleep(Duration::from_millis(self.cutoff_ms));
        transport.set_boot(!self.revert)?;
        sleep(Duration::from_millis(100));

        self.classic.reset(transport)
    }
}

/// Hands the whole sequence to a vendor USB serial bridge, which drives the
/// boot and reset pins itself after receiving the magic.
#[derive(Debug, Clone, Copy)]
pub struct UsbBridgeReset {
    boot_revert: bool,
    reset_revert: bool,
}

impl UsbBridgeReset {
    pub fn new(config: &ResetConfig) -> Self {
        Self {
            boot_revert: config.cutoff_revert,
            reset_revert: config.reset_revert,
        }
    }

    /// The frame the bridge firmware expects: magic, then one byte each for
    /// the boot and reset polarities.
    fn frame(&self) -> Vec<u8> {
        let mut frame = USB_BRIDGE_MAGIC.to_vec();
        frame.push(self.boot_revert as u8);
        frame.push(self.reset_revert as u8);
        frame
    }
}

impl ResetStrategy for UsbBridgeReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Requesting reset from USB serial bridge");

        transport.write_all(&self.frame())?;
        transport.flush()?;
        sleep(Duration::from_millis(500));

        Ok(())
    }
}

/// Pick the strategies to try, in order, for a handshake.
///
/// A detected vendor bridge gets the bridge magic first; otherwise the power
/// cycle (when configured) runs before each plain reset pulse.
pub fn reset_strategy_sequence(
    config: &ResetConfig,
    usb_bridge: bool,
) -> Vec<Box<dyn ResetStrategy>> {
    let mut sequence: Vec<Box<dyn ResetStrategy>> = Vec::new();

    if usb_bridge {
        sequence.push(Box::new(UsbBridgeReset::new(config)));
    }
    if config.cutoff_ms > 0 {
        sequence.push(Box::new(PowerCycleReset::new(config)));
    } else {
        sequence.push(Box::new(ClassicReset::new(config)));
    }

    sequence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_hold_time_encodes_pulse_count() {
        let classic = ClassicReset::new(&ResetConfig {
            hold_ms: 3200,
            ..ResetConfig::default()
        });
        assert_eq!(classic.pulses, 3);
        assert_eq!(classic.hold_ms, 200);

        let classic = ClassicReset::new(&ResetConfig::default());
        assert_eq!(classic.pulses, 2);
        assert_eq!(classic.hold_ms, 100);
    }

    #[test]
    fn long_cutoff_time_inverts_power_polarity() {
        let cycle = PowerCycleReset::new(&ResetConfig {
            cutoff_ms: 1300,
            cutoff_revert: false,
            ..ResetConfig::default()
        });
        assert!(cycle.revert);
        assert_eq!(cycle.cutoff_ms, 300);
    }

    #[test]
    fn bridge_frame_appends_polarity_bytes() {
        let bridge = UsbBridgeReset::new(&ResetConfig {
            reset_revert: true,
            cutoff_revert: false,
            ..ResetConfig::default()
        });
        let frame = bridge.frame();
        assert!(frame.starts_with(b"BOUFFALOLAB5555RESET"));
        assert_eq!(&frame[20..], &[0, 1]);
    }

    #[test]
    fn sequence_prefers_bridge_when_detected() {
        let config = ResetConfig::default();
        assert_eq!(reset_strategy_sequence(&config, true).len(), 2);
        assert_eq!(reset_strategy_sequence(&config, false).len(), 1);
    }
}
