// ─────────────────────────────────────────────────────────────────────────────
//  vuflash :: sequence  —  provisioning sequence state machine
//
//  Orders programmer primitives into the full provisioning procedure:
//
//    Start → Backup → SetFuses → WriteFlash → Verify → Done
//                                                    ↘ Aborted
//
//  Fatality is deliberately asymmetric:
//    · a failed backup never blocks provisioning (the target may be blank
//      or bricked and unreadable);
//    · a failed fuse write aborts before any flash write — a partially
//      fused device is in an ambiguous electrical state;
//    · a failed verify is advisory — the image is already committed and
//      there is no rollback.
//
//  Every failure, fatal or not, lands in the outcome's diagnostics list.
//  There are no retries at this layer.
// ─────────────────────────────────────────────────────────────────────────────

use std::fmt;
use std::path::PathBuf;

use crate::error::{FlashError, Result};
use crate::mcu::McuProfile;
use crate::programmer::Programmer;

// ─────────────────────────────────────────────────────────────────────────────
//  Plan / state / outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Inputs to one provisioning run.
#[derive(Debug, Clone)]
pub struct FlashPlan {
    pub mcu_id: String,
    /// Compiled bootloader image (Intel hex), treated as an opaque blob.
    pub image: PathBuf,
    /// Read the current flash to a backup file before touching anything.
    pub backup: bool,
    /// Backup destination; defaults to bootloader_backup_<mcu>.hex.
    pub backup_path: Option<PathBuf>,
    /// Write the profile's fuse bytes before flashing.
    pub set_fuses: bool,
}

impl FlashPlan {
    pub fn new(mcu_id: &str, image: impl Into<PathBuf>) -> Self {
        FlashPlan {
            mcu_id: mcu_id.to_owned(),
            image: image.into(),
            backup: true,
            backup_path: None,
            set_fuses: true,
        }
    }

    fn backup_path(&self) -> PathBuf {
        self.backup_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("bootloader_backup_{}.hex", self.mcu_id)))
    }
}

/// Sequence stages.  `Aborted` is terminal and reachable from any non-final
/// stage; `Done` is the only successful terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Backup,
    SetFuses,
    WriteFlash,
    Verify,
    Done,
    Aborted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::Backup => "backup",
            Stage::SetFuses => "set-fuses",
            Stage::WriteFlash => "write-flash",
            Stage::Verify => "verify",
            Stage::Done => "done",
            Stage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Structured result of one provisioning run — enough for a caller to render
/// a summary without re-deriving the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub final_stage:      Stage,
    pub backup_performed: bool,
    pub fuses_applied:    bool,
    pub write_succeeded:  bool,
    pub verify_succeeded: bool,
    pub backup_path:      Option<PathBuf>,
    pub diagnostics:      Vec<String>,
}

impl Outcome {
    fn new() -> Self {
        Outcome {
            final_stage: Stage::Start,
            backup_performed: false,
            fuses_applied: false,
            write_succeeded: false,
            verify_succeeded: false,
            backup_path: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.final_stage == Stage::Done
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  The sequence
// ─────────────────────────────────────────────────────────────────────────────

/// Run the full provisioning sequence against one target.
///
/// Fails fast — before any hardware contact — on an unknown MCU or a missing
/// image file.  Once primitives start running, stage failures are resolved
/// per the fatality rules above and reported through the returned `Outcome`.
pub fn run_sequence(programmer: &mut dyn Programmer, plan: &FlashPlan) -> Result<Outcome> {
    let profile = McuProfile::lookup(&plan.mcu_id)?;

    if !plan.image.exists() {
        return Err(FlashError::ImageNotFound(plan.image.display().to_string()));
    }

    let mut outcome = Outcome::new();
    let mut stage = Stage::Start;

    loop {
        stage = match stage {
            Stage::Start => {
                if plan.backup {
                    Stage::Backup
                } else {
                    Stage::SetFuses
                }
            }

            Stage::Backup => {
                let dest = plan.backup_path();
                match programmer.read_flash(&dest) {
                    Ok(()) => {
                        outcome.backup_performed = true;
                        outcome.backup_path = Some(dest.clone());
                        outcome
                            .diagnostics
                            .push(format!("backup saved to {}", dest.display()));
                    }
                    // Non-fatal: a missing backup must never block
                    // provisioning of a blank or bricked device.
                    Err(e) => {
                        log::warn!("backup failed, continuing: {}", e);
                        outcome
                            .diagnostics
                            .push(format!("backup failed, continuing: {}", e));
                    }
                }
                Stage::SetFuses
            }

            Stage::SetFuses => {
                if !plan.set_fuses {
                    Stage::WriteFlash
                } else {
                    match apply_fuses(programmer, profile, &mut outcome) {
                        Ok(()) => {
                            outcome.fuses_applied = true;
                            Stage::WriteFlash
                        }
                        Err(e) => {
                            outcome
                                .diagnostics
                                .push(format!("fuse setting failed, aborting: {}", e));
                            Stage::Aborted
                        }
                    }
                }
            }

            Stage::WriteFlash => match programmer.write_flash(&plan.image) {
                Ok(()) => {
                    outcome.write_succeeded = true;
                    outcome
                        .diagnostics
                        .push(format!("flashed {}", plan.image.display()));
                    Stage::Verify
                }
                Err(e) => {
                    outcome.diagnostics.push(format!("flash failed: {}", e));
                    Stage::Aborted
                }
            },

            Stage::Verify => {
                match programmer.verify_flash(&plan.image) {
                    Ok(()) => {
                        outcome.verify_succeeded = true;
                        outcome.diagnostics.push("verification passed".into());
                    }
                    // Non-fatal either way: the image is already committed
                    // and may still be functionally correct.
                    Err(e) => {
                        log::warn!("verification failed: {}", e);
                        outcome
                            .diagnostics
                            .push(format!("verification failed (non-fatal): {}", e));
                    }
                }
                Stage::Done
            }

            Stage::Done | Stage::Aborted => {
                outcome.final_stage = stage;
                return Ok(outcome);
            }
        };
    }
}

/// Write the profile's low/high/extended fuse bytes in order, stopping at
/// the first failure.
fn apply_fuses(
    programmer: &mut dyn Programmer,
    profile: &McuProfile,
    outcome: &mut Outcome,
) -> Result<()> {
    for (fuse, value) in profile.provisioning_fuses() {
        programmer.write_fuse(fuse, value)?;
        outcome
            .diagnostics
            .push(format!("{} = 0x{:02x}", fuse.memory_name(), value));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programmer::Fuse;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::path::Path;

    /// Scripted programmer: records every primitive call in order and fails
    /// exactly the operations it is told to fail.
    #[derive(Default)]
    struct Scripted {
        calls: Vec<String>,
        fail_read: bool,
        fail_write: bool,
        fail_fuse: Option<Fuse>,
        verify_mismatch: bool,
    }

    impl Scripted {
        fn err(op: &'static str) -> FlashError {
            FlashError::Programmer {
                op,
                port: "/dev/ttyUSB0".into(),
                output: "scripted failure".into(),
            }
        }
    }

    impl Programmer for Scripted {
        fn read_flash(&mut self, dest: &Path) -> crate::error::Result<()> {
            self.calls.push(format!("read:{}", dest.display()));
            if self.fail_read {
                return Err(Self::err("read_flash"));
            }
            Ok(())
        }

        fn write_flash(&mut self, image: &Path) -> crate::error::Result<()> {
            self.calls.push(format!("write:{}", image.display()));
            if self.fail_write {
                return Err(Self::err("write_flash"));
            }
            Ok(())
        }

        fn write_fuse(&mut self, fuse: Fuse, value: u8) -> crate::error::Result<()> {
            self.calls
                .push(format!("fuse:{}:0x{:02x}", fuse.memory_name(), value));
            if self.fail_fuse == Some(fuse) {
                return Err(Self::err("write_fuse"));
            }
            Ok(())
        }

        fn verify_flash(&mut self, image: &Path) -> crate::error::Result<()> {
            self.calls.push(format!("verify:{}", image.display()));
            if self.verify_mismatch {
                return Err(FlashError::VerifyMismatch {
                    output: "verification error, first mismatch at byte 0x0000".into(),
                });
            }
            Ok(())
        }
    }

    fn temp_image() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, ":00000001FF").unwrap();
        f
    }

    #[test]
    fn happy_path_reaches_done() {
        let image = temp_image();
        let plan = FlashPlan::new("atmega328p", image.path());
        let mut prog = Scripted::default();

        let outcome = run_sequence(&mut prog, &plan).unwrap();

        assert_eq!(outcome.final_stage, Stage::Done);
        assert!(outcome.backup_performed);
        assert!(outcome.fuses_applied);
        assert!(outcome.write_succeeded);
        assert!(outcome.verify_succeeded);
        assert!(outcome.succeeded());

        // Full primitive order: backup, three fuses, write, verify
        assert_eq!(prog.calls.len(), 6);
        assert!(prog.calls[0].starts_with("read:"));
        assert_eq!(prog.calls[1], "fuse:lfuse:0xdf");
        assert_eq!(prog.calls[2], "fuse:hfuse:0xda");
        assert_eq!(prog.calls[3], "fuse:efuse:0x05");
        assert!(prog.calls[4].starts_with("write:"));
        assert!(prog.calls[5].starts_with("verify:"));
    }

    #[test]
    fn failed_backup_is_non_fatal() {
        let image = temp_image();
        let plan = FlashPlan::new("atmega328p", image.path());
        let mut prog = Scripted {
            fail_read: true,
            ..Scripted::default()
        };

        let outcome = run_sequence(&mut prog, &plan).unwrap();

        assert_eq!(outcome.final_stage, Stage::Done);
        assert!(!outcome.backup_performed);
        assert!(outcome.write_succeeded);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| d.contains("backup failed")));
    }

    #[test]
    fn failed_fuse_aborts_before_any_flash_write() {
        let image = temp_image();
        let plan = FlashPlan::new("atmega328p", image.path());
        let mut prog = Scripted {
            fail_fuse: Some(Fuse::High),
            ..Scripted::default()
        };

        let outcome = run_sequence(&mut prog, &plan).unwrap();

        assert_eq!(outcome.final_stage, Stage::Aborted);
        assert!(!outcome.fuses_applied);
        assert!(!outcome.write_succeeded);
        assert!(!outcome.succeeded());
        // write_flash must never run after a fuse failure
        assert!(!prog.calls.iter().any(|c| c.starts_with("write:")));
        assert!(!prog.calls.iter().any(|c| c.starts_with("verify:")));
    }

    #[test]
    fn failed_write_aborts_without_verify() {
        let image = temp_image();
        let plan = FlashPlan::new("atmega328p", image.path());
        let mut prog = Scripted {
            fail_write: true,
            ..Scripted::default()
        };

        let outcome = run_sequence(&mut prog, &plan).unwrap();

        assert_eq!(outcome.final_stage, Stage::Aborted);
        assert!(!outcome.write_succeeded);
        assert!(!prog.calls.iter().any(|c| c.starts_with("verify:")));
    }

    #[test]
    fn verify_mismatch_still_reaches_done() {
        let image = temp_image();
        let plan = FlashPlan::new("atmega328p", image.path());
        let mut prog = Scripted {
            verify_mismatch: true,
            ..Scripted::default()
        };

        let outcome = run_sequence(&mut prog, &plan).unwrap();

        assert_eq!(outcome.final_stage, Stage::Done);
        assert!(outcome.write_succeeded);
        assert!(!outcome.verify_succeeded);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| d.contains("non-fatal")));
    }

    #[test]
    fn skipping_backup_and_fuses_goes_straight_to_write() {
        let image = temp_image();
        let mut plan = FlashPlan::new("atmega328p", image.path());
        plan.backup = false;
        plan.set_fuses = false;
        let mut prog = Scripted::default();

        let outcome = run_sequence(&mut prog, &plan).unwrap();

        assert_eq!(outcome.final_stage, Stage::Done);
        assert!(!outcome.backup_performed);
        assert!(!outcome.fuses_applied);
        assert!(prog.calls[0].starts_with("write:"));
    }

    #[test]
    fn unknown_mcu_fails_before_hardware_contact() {
        let image = temp_image();
        let plan = FlashPlan::new("z80", image.path());
        let mut prog = Scripted::default();

        match run_sequence(&mut prog, &plan) {
            Err(FlashError::UnknownMcu(id)) => assert_eq!(id, "z80"),
            other => panic!("expected UnknownMcu, got {:?}", other),
        }
        assert!(prog.calls.is_empty());
    }

    #[test]
    fn missing_image_fails_before_hardware_contact() {
        let plan = FlashPlan::new("atmega328p", "/nonexistent/bootloader.hex");
        let mut prog = Scripted::default();

        match run_sequence(&mut prog, &plan) {
            Err(FlashError::ImageNotFound(_)) => {}
            other => panic!("expected ImageNotFound, got {:?}", other),
        }
        assert!(prog.calls.is_empty());
    }

    #[test]
    fn rerun_is_idempotent() {
        let image = temp_image();
        let plan = FlashPlan::new("attiny85", image.path());

        let mut first = Scripted::default();
        let out_a = run_sequence(&mut first, &plan).unwrap();

        let mut second = Scripted::default();
        let out_b = run_sequence(&mut second, &plan).unwrap();

        assert_eq!(out_a.final_stage, out_b.final_stage);
        assert_eq!(first.calls, second.calls);
    }

    #[test]
    fn default_backup_path_is_derived_from_mcu() {
        let plan = FlashPlan::new("atmega32u4", "image.hex");
        assert_eq!(
            plan.backup_path(),
            PathBuf::from("bootloader_backup_atmega32u4.hex")
        );
    }
}
