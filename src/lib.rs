// ─────────────────────────────────────────────────────────────────────────────
//  vuflash  —  public library API  (used by the CLI and GUI integrations)
// ─────────────────────────────────────────────────────────────────────────────

pub mod builder;
pub mod config;
pub mod driver;
pub mod error;
pub mod mcu;
pub mod programmer;
pub mod sequence;
pub mod usb;

pub use config::DeviceConfig;
pub use error::{FlashError, Result};
pub use mcu::McuProfile;
pub use programmer::{AvrdudeSession, Fuse, Programmer, SessionConfig, Timeouts};
pub use sequence::{run_sequence, FlashPlan, Outcome, Stage};
pub use usb::{find_device, DeviceStatus, SystemEnumerator, UsbDevice, UsbEnumerator};

/// One-shot: provision a board over an ISP programmer.
///
/// ```no_run
/// use vuflash::{provision, FlashPlan, SessionConfig};
///
/// let config = SessionConfig {
///     port: "/dev/ttyUSB0".into(),
///     ..SessionConfig::default()
/// };
///
/// let plan = FlashPlan::new("atmega328p", "bootloader_atmega328p.hex");
/// let outcome = provision(config, &plan).unwrap();
/// assert!(outcome.succeeded());
/// ```
pub fn provision(config: SessionConfig, plan: &FlashPlan) -> Result<Outcome> {
    let mut session = AvrdudeSession::new(config, &plan.mcu_id)?;
    run_sequence(&mut session, plan)
}
