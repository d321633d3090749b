// ─────────────────────────────────────────────────────────────────────────────
//  vuflash :: programmer  —  avrdude ISP programmer session
//
//  One AvrdudeSession is one connection to an external hardware programmer.
//  Every primitive maps to exactly one avrdude invocation with a bounded
//  timeout:
//
//    read_flash    avrdude … -U flash:r:<dest>:i
//    write_flash   avrdude … -U flash:w:<image>:i
//    write_fuse    avrdude … -U <fuse>:w:0x<byte>:m
//    verify_flash  avrdude … -U flash:v:<image>:i
//
//  avrdude's diagnostic text is carried verbatim in the error — callers
//  render it for the operator but never branch on its content.
// ─────────────────────────────────────────────────────────────────────────────

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{FlashError, Result};

// ─────────────────────────────────────────────────────────────────────────────
//  Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// AVR fuse memories addressable through the programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fuse {
    Low,
    High,
    Extended,
    Lock,
}

impl Fuse {
    /// The avrdude memory name for this fuse.
    pub fn memory_name(self) -> &'static str {
        match self {
            Fuse::Low => "lfuse",
            Fuse::High => "hfuse",
            Fuse::Extended => "efuse",
            Fuse::Lock => "lock",
        }
    }
}

/// Per-operation timeout bounds, in line with how long each avrdude run can
/// legitimately take (verify scans the full image, fuse writes are quick).
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub read:   Duration,
    pub write:  Duration,
    pub fuse:   Duration,
    pub verify: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            read:   Duration::from_secs(30),
            write:  Duration::from_secs(60),
            fuse:   Duration::from_secs(30),
            verify: Duration::from_secs(60),
        }
    }
}

/// Connection parameters for the external programmer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// avrdude programmer id, e.g. "avrisp", "usbasp", "stk500v1".
    pub programmer_type: String,
    /// Serial port — required for any stateful operation.
    pub port: String,
    pub baud: u32,
    pub timeouts: Timeouts,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            programmer_type: "avrisp".into(),
            port: String::new(),
            baud: 19200,
            timeouts: Timeouts::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Programmer trait — the seam the orchestrator drives
// ─────────────────────────────────────────────────────────────────────────────

pub trait Programmer {
    /// Read the target's flash into `dest` (Intel hex).
    fn read_flash(&mut self, dest: &Path) -> Result<()>;

    /// Write `image` to the target's flash.
    fn write_flash(&mut self, image: &Path) -> Result<()>;

    /// Write a single fuse byte.
    fn write_fuse(&mut self, fuse: Fuse, value: u8) -> Result<()>;

    /// Compare the target's flash against `image`.  A byte disagreement is
    /// `FlashError::VerifyMismatch`; any other tool failure is
    /// `FlashError::Programmer`.
    fn verify_flash(&mut self, image: &Path) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
//  AvrdudeSession
// ─────────────────────────────────────────────────────────────────────────────

pub struct AvrdudeSession {
    config: SessionConfig,
    mcu:    String,
}

impl AvrdudeSession {
    /// Open a session for `mcu` over the configured port.  Fails up front if
    /// the port is empty — that is a precondition failure, not a hardware
    /// failure.
    pub fn new(config: SessionConfig, mcu: &str) -> Result<Self> {
        if config.port.trim().is_empty() {
            return Err(FlashError::MissingPort);
        }
        Ok(AvrdudeSession {
            config,
            mcu: mcu.to_owned(),
        })
    }

    pub fn port(&self) -> &str {
        &self.config.port
    }

    /// Run one avrdude invocation for the given -U memory spec.
    fn run_avrdude(
        &self,
        op: &'static str,
        mem_spec: &str,
        timeout: Duration,
    ) -> Result<String> {
        let mut cmd = Command::new("avrdude");
        cmd.args([
            "-c", &self.config.programmer_type,
            "-p", &self.mcu,
            "-P", &self.config.port,
            "-b", &self.config.baud.to_string(),
            "-U", mem_spec,
        ]);

        log::debug!("{}: avrdude -U {}", op, mem_spec);

        let captured = run_with_timeout(&mut cmd, timeout)?;

        if captured.timed_out {
            return Err(FlashError::Timeout {
                op,
                port: self.config.port.clone(),
                seconds: timeout.as_secs(),
            });
        }

        if !captured.success {
            return Err(FlashError::Programmer {
                op,
                port: self.config.port.clone(),
                output: captured.output,
            });
        }

        Ok(captured.output)
    }
}

impl Programmer for AvrdudeSession {
    fn read_flash(&mut self, dest: &Path) -> Result<()> {
        let spec = format!("flash:r:{}:i", dest.display());
        self.run_avrdude("read_flash", &spec, self.config.timeouts.read)?;
        Ok(())
    }

    fn write_flash(&mut self, image: &Path) -> Result<()> {
        let spec = format!("flash:w:{}:i", image.display());
        self.run_avrdude("write_flash", &spec, self.config.timeouts.write)?;
        Ok(())
    }

    fn write_fuse(&mut self, fuse: Fuse, value: u8) -> Result<()> {
        let spec = format!("{}:w:0x{:02x}:m", fuse.memory_name(), value);
        self.run_avrdude("write_fuse", &spec, self.config.timeouts.fuse)?;
        Ok(())
    }

    fn verify_flash(&mut self, image: &Path) -> Result<()> {
        let spec = format!("flash:v:{}:i", image.display());
        match self.run_avrdude("verify_flash", &spec, self.config.timeouts.verify) {
            Ok(_) => Ok(()),
            // avrdude prints "verification error, first mismatch at byte …"
            // when the content disagrees; anything else is a tool failure.
            Err(FlashError::Programmer { output, .. })
                if output.to_lowercase().contains("verification error") =>
            {
                Err(FlashError::VerifyMismatch { output })
            }
            Err(e) => Err(e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Subprocess plumbing
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct Captured {
    pub(crate) success:   bool,
    pub(crate) timed_out: bool,
    /// stderr followed by stdout, trimmed — avrdude writes its diagnostics
    /// to stderr.
    pub(crate) output: String,
}

/// Run `cmd` to completion or until `timeout`, capturing stdout + stderr.
/// On expiry the child is killed; there is no way to cancel mid-run.
pub(crate) fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Captured> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain the pipes from threads so the child can't block on a full pipe
    // while we poll for exit.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_thread = std::thread::spawn(move || read_all(stdout));
    let err_thread = std::thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;

    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None if Instant::now() >= deadline => {
                timed_out = true;
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    };

    let stdout_text = out_thread.join().unwrap_or_default();
    let stderr_text = err_thread.join().unwrap_or_default();

    Ok(Captured {
        success: status.map(|s| s.success()).unwrap_or(false),
        timed_out,
        output: format!("{}\n{}", stderr_text, stdout_text).trim().to_owned(),
    })
}

fn read_all<R: Read>(reader: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut r) = reader {
        let mut bytes = Vec::new();
        if r.read_to_end(&mut bytes).is_ok() {
            buf = String::from_utf8_lossy(&bytes).to_string();
        }
    }
    buf
}

/// Check that avrdude is installed and runnable.
pub fn check_avrdude() -> Result<()> {
    match Command::new("avrdude")
        .arg("-?")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        // avrdude -? exits non-zero on some versions; spawning at all is
        // enough to know it is installed.
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(FlashError::AvrdudeNotFound)
        }
        Err(e) => Err(e.into()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fuse_memory_names() {
        assert_eq!(Fuse::Low.memory_name(), "lfuse");
        assert_eq!(Fuse::High.memory_name(), "hfuse");
        assert_eq!(Fuse::Extended.memory_name(), "efuse");
        assert_eq!(Fuse::Lock.memory_name(), "lock");
    }

    #[test]
    fn empty_port_is_a_precondition_failure() {
        let config = SessionConfig::default();
        match AvrdudeSession::new(config, "atmega328p") {
            Err(FlashError::MissingPort) => {}
            other => panic!("expected MissingPort, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn session_opens_with_a_port() {
        let config = SessionConfig {
            port: "/dev/ttyUSB0".into(),
            ..SessionConfig::default()
        };
        let session = AvrdudeSession::new(config, "atmega328p").unwrap();
        assert_eq!(session.port(), "/dev/ttyUSB0");
    }

    #[test]
    fn default_config_matches_isp_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.programmer_type, "avrisp");
        assert_eq!(config.baud, 19200);
        assert_eq!(config.timeouts.write, Duration::from_secs(60));
        assert_eq!(config.timeouts.fuse, Duration::from_secs(30));
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let captured = run_with_timeout(&mut cmd, Duration::from_secs(5)).unwrap();
        assert!(captured.success);
        assert!(!captured.timed_out);
        assert!(captured.output.contains("out"));
        assert!(captured.output.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_kills_a_hung_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let t0 = Instant::now();
        let captured = run_with_timeout(&mut cmd, Duration::from_millis(200)).unwrap();
        assert!(captured.timed_out);
        assert!(!captured.success);
        assert!(t0.elapsed() < Duration::from_secs(10));
    }
}
