// ─────────────────────────────────────────────────────────────────────────────
//  vuflash :: error
// ─────────────────────────────────────────────────────────────────────────────

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Unknown MCU '{0}' — run `vuflash mcus` for the supported list")]
    UnknownMcu(String),

    #[error("No serial port configured\n  Hint: pass --port /dev/ttyUSB0 (or COM3 on Windows)")]
    MissingPort,

    #[error("Invalid USB identifier '{0}' — expected up to 4 hex digits, e.g. 0x16c0")]
    InvalidUsbId(String),

    #[error("{op} failed on {port}:\n{output}")]
    Programmer {
        op:     &'static str,
        port:   String,
        output: String,
    },

    #[error("Verification mismatch:\n{output}")]
    VerifyMismatch { output: String },

    #[error("{op} timed out after {seconds}s on {port}")]
    Timeout {
        op:      &'static str,
        port:    String,
        seconds: u64,
    },

    #[error("Firmware image not found: {0}")]
    ImageNotFound(String),

    #[error("avrdude not found\n  Install with:\n    Ubuntu/Debian: sudo apt-get install avrdude\n    macOS: brew install avrdude\n    Windows: install Arduino IDE or WinAVR")]
    AvrdudeNotFound,

    #[error("Missing build tools: {0}\n  Hint: install gcc-avr, avr-libc and make")]
    BuildToolsMissing(String),

    #[error("Bootloader build failed:\n{output}")]
    BuildFailed { output: String },

    #[error("V-USB source tree not found: {0}")]
    VusbSourceNotFound(String),

    #[error("Device '{0}' not found in device config — run `vuflash devices` for the list")]
    UnknownDevice(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FlashError>;
