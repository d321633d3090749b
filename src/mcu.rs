// ─────────────────────────────────────────────────────────────────────────────
//  vuflash :: mcu  —  supported MCU profile registry
//
//  One entry per microcontroller variant: clock speed, V-USB fuse bytes and
//  the port/pin pair the USB data lines hang off.  The fuse values encode
//  physical constraints of the silicon and are never configuration choices;
//  everything that needs a fuse byte looks it up here.
// ─────────────────────────────────────────────────────────────────────────────

use std::fmt;

use crate::error::{FlashError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct McuProfile {
    pub id:          &'static str,
    pub description: &'static str,
    pub clock_hz:    u32,

    // V-USB fuse configuration
    pub fuse_low:      u8,
    pub fuse_high:     u8,
    pub fuse_extended: u8,
    pub fuse_lock:     u8,
    pub fuse_unlock:   u8,

    // USB D+/D- wiring
    pub usb_port_name:  char,   // I/O port letter, e.g. 'B'
    pub usb_dplus_bit:  u8,     // bit index 0–7
    pub usb_dminus_bit: u8,
}

impl fmt::Display for McuProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.description)
    }
}

impl McuProfile {
    /// Return the full profile table.
    pub fn catalog() -> &'static [McuProfile] {
        PROFILES
    }

    /// Find a profile by MCU id (case-insensitive).
    pub fn lookup(id: &str) -> Result<&'static McuProfile> {
        PROFILES
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| FlashError::UnknownMcu(id.to_owned()))
    }

    /// Fuse bytes written during provisioning, in write order.
    /// The lock byte is deliberately not part of this set — locking is an
    /// explicit, separate operation.
    pub fn provisioning_fuses(&self) -> [(crate::programmer::Fuse, u8); 3] {
        use crate::programmer::Fuse;
        [
            (Fuse::Low, self.fuse_low),
            (Fuse::High, self.fuse_high),
            (Fuse::Extended, self.fuse_extended),
        ]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Static profile table
// ─────────────────────────────────────────────────────────────────────────────

static PROFILES: &[McuProfile] = &[
    McuProfile {
        id: "atmega328p",
        description: "Arduino Uno / Nano (ATmega328P)",
        clock_hz: 16_000_000,
        fuse_low: 0xDF, fuse_high: 0xDA, fuse_extended: 0x05,
        fuse_lock: 0x0F, fuse_unlock: 0x3F,
        usb_port_name: 'B', usb_dplus_bit: 4, usb_dminus_bit: 3,
    },
    McuProfile {
        id: "atmega32u4",
        description: "Arduino Micro / Leonardo (ATmega32U4)",
        clock_hz: 16_000_000,
        fuse_low: 0xDF, fuse_high: 0xD9, fuse_extended: 0xC3,
        fuse_lock: 0x0F, fuse_unlock: 0x3F,
        usb_port_name: 'D', usb_dplus_bit: 4, usb_dminus_bit: 3,
    },
    McuProfile {
        id: "attiny85",
        description: "ATtiny85",
        clock_hz: 16_500_000,
        fuse_low: 0xE1, fuse_high: 0xDD, fuse_extended: 0xFF,
        fuse_lock: 0x0F, fuse_unlock: 0x3F,
        usb_port_name: 'B', usb_dplus_bit: 4, usb_dminus_bit: 3,
    },
];

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lookup_is_pure_and_deterministic() {
        let a = McuProfile::lookup("atmega328p").unwrap();
        let b = McuProfile::lookup("atmega328p").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fuse_low, 0xDF);
        assert_eq!(a.fuse_high, 0xDA);
        assert_eq!(a.fuse_extended, 0x05);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let p = McuProfile::lookup("ATmega32U4").unwrap();
        assert_eq!(p.id, "atmega32u4");
        assert_eq!(p.usb_port_name, 'D');
    }

    #[test]
    fn unknown_mcu_fails() {
        match McuProfile::lookup("nonexistent") {
            Err(FlashError::UnknownMcu(id)) => assert_eq!(id, "nonexistent"),
            other => panic!("expected UnknownMcu, got {:?}", other),
        }
    }

    #[test]
    fn one_profile_per_id() {
        for p in McuProfile::catalog() {
            let count = McuProfile::catalog()
                .iter()
                .filter(|q| q.id.eq_ignore_ascii_case(p.id))
                .count();
            assert_eq!(count, 1, "duplicate profile for {}", p.id);
        }
    }

    #[test]
    fn provisioning_fuses_exclude_lock() {
        use crate::programmer::Fuse;
        let p = McuProfile::lookup("attiny85").unwrap();
        let fuses = p.provisioning_fuses();
        assert_eq!(fuses.len(), 3);
        assert!(fuses.iter().all(|(f, _)| *f != Fuse::Lock));
        assert_eq!(fuses[0], (Fuse::Low, 0xE1));
    }
}
