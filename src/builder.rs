// ─────────────────────────────────────────────────────────────────────────────
//  vuflash :: builder  —  V-USB bootloader firmware build
//
//  Generates a usbconfig.h and a Makefile from an MCU profile, assembles a
//  build tree next to the V-USB sources, and runs `make`.  The rest of the
//  toolkit treats this as a black box: profile + source tree in, hex path
//  (or build failure) out.
// ─────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::{FlashError, Result};
use crate::mcu::McuProfile;
use crate::programmer::run_with_timeout;
use crate::usb::normalize_usb_id;

const MAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// V-USB shared VID/PID pair, the default identity for built firmware.
pub const DEFAULT_VENDOR_ID: &str = "0x16c0";
pub const DEFAULT_PRODUCT_ID: &str = "0x05df";

/// USB string descriptors cap the device name.
const MAX_DEVICE_NAME: usize = 32;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub mcu_id: String,
    /// USB device name embedded in the descriptor (truncated to 32 chars).
    pub device_name: String,
    pub vendor_id:  String,
    pub product_id: String,
    /// Root of the V-USB source checkout (contains usbdrv/).
    pub vusb_dir:  PathBuf,
    /// Where build trees and the final hex land.
    pub output_dir: PathBuf,
}

/// Build the bootloader for the requested MCU.  Returns the path of the
/// produced hex image.
pub fn build(req: &BuildRequest) -> Result<PathBuf> {
    let profile = McuProfile::lookup(&req.mcu_id)?;

    let usbdrv_src = req.vusb_dir.join("usbdrv");
    if !usbdrv_src.is_dir() {
        return Err(FlashError::VusbSourceNotFound(
            req.vusb_dir.display().to_string(),
        ));
    }

    let device_name: String = req.device_name.chars().take(MAX_DEVICE_NAME).collect();
    let safe_name = device_name.replace(' ', "_");

    let build_dir = req
        .output_dir
        .join(format!("build_{}_{}", profile.id, safe_name));
    std::fs::create_dir_all(&build_dir)?;

    // ── Assemble the build tree ───────────────────────────────────────────
    log::info!("assembling build tree in {}", build_dir.display());

    let usbdrv_dst = build_dir.join("usbdrv");
    if usbdrv_dst.exists() {
        std::fs::remove_dir_all(&usbdrv_dst)?;
    }
    copy_tree(&usbdrv_src, &usbdrv_dst)?;

    std::fs::write(
        build_dir.join("usbconfig.h"),
        generate_usbconfig(profile, &device_name, &req.vendor_id, &req.product_id)?,
    )?;
    std::fs::write(
        build_dir.join("Makefile"),
        generate_makefile(profile, &device_name),
    )?;

    copy_firmware_sources(&req.vusb_dir, &build_dir)?;

    // ── Compile ───────────────────────────────────────────────────────────
    let mut make = Command::new("make");
    make.args(["clean", "all"]).current_dir(&build_dir);

    let captured = run_with_timeout(&mut make, MAKE_TIMEOUT)?;
    if captured.timed_out {
        return Err(FlashError::BuildFailed {
            output: "make timed out".into(),
        });
    }
    if !captured.success {
        return Err(FlashError::BuildFailed {
            output: captured.output,
        });
    }

    let hex = build_dir.join("bootloader.hex");
    if !hex.exists() {
        return Err(FlashError::BuildFailed {
            output: "make succeeded but bootloader.hex was not produced".into(),
        });
    }

    // Publish under a stable name next to the other builds
    let published = req
        .output_dir
        .join(format!("bootloader_{}_{}.hex", profile.id, safe_name));
    std::fs::copy(&hex, &published)?;

    Ok(published)
}

// ─────────────────────────────────────────────────────────────────────────────
//  Generated files
// ─────────────────────────────────────────────────────────────────────────────

/// Render usbconfig.h for the given profile and USB identity.
pub fn generate_usbconfig(
    profile: &McuProfile,
    device_name: &str,
    vendor_id: &str,
    product_id: &str,
) -> Result<String> {
    let vid = format!("0x{}", normalize_usb_id(vendor_id)?.to_lowercase());
    let pid = format!("0x{}", normalize_usb_id(product_id)?.to_lowercase());
    let device_name: String = device_name.chars().take(MAX_DEVICE_NAME).collect();

    Ok(format!(
        r#"/* Name: usbconfig.h
 * Project: V-USB Bootloader for {description}
 * Device Name: {name}
 * Auto-generated configuration
 */

#ifndef __usbconfig_h_included__
#define __usbconfig_h_included__

/* USB Vendor and Product ID */
#define USB_CFG_VENDOR_ID       {vid}
#define USB_CFG_DEVICE_ID       {pid}

/* Device Name String */
#define USB_CFG_DEVICE_NAME     "{name}"
#define USB_CFG_DEVICE_NAME_LEN {name_len}

/* MCU Configuration */
#define USB_CFG_IOPORTNAME      {port}
#define USB_CFG_DMINUS_BIT      {dminus}
#define USB_CFG_DPLUS_BIT       {dplus}

/* USB Speed */
#define USB_CFG_CLOCK_KHZ       (F_CPU/1000)

/* Features */
#define USB_CFG_HAS_INTRIN_ENDPOINT     1
#define USB_CFG_HAS_INTRIN_ENDPOINT3    0
#define USB_CFG_HAS_INTERRUPT_IN        1
#define USB_CFG_HAS_INTERRUPT_IN3       0
#define USB_CFG_SUPPRESS_INTR_CODE      0
#define USB_CFG_INTR_POLL_INTERVAL      10

/* Device Classes */
#define USB_CFG_IS_SELF_POWERED         0
#define USB_CFG_MAX_BUS_POWER           100
#define USB_CFG_IMPLEMENT_FN_WRITE      1
#define USB_CFG_IMPLEMENT_FN_READ       1
#define USB_CFG_IMPLEMENT_FN_WRITEOUT   0

/* Strings */
#define USB_CFG_HAVE_INTRIN_ENDPOINT    1
#define USB_CFG_HAVE_INTRIN_ENDPOINT3   0
#define USB_CFG_HAVE_INTERRUPT_IN       1
#define USB_CFG_HAVE_INTERRUPT_IN3      0

#define USB_CFG_LONG_TRANSFERS          1

#endif
"#,
        description = profile.description,
        name = device_name,
        name_len = device_name.len(),
        vid = vid,
        pid = pid,
        port = profile.usb_port_name,
        dminus = profile.usb_dminus_bit,
        dplus = profile.usb_dplus_bit,
    ))
}

/// Render the build Makefile for the given profile.
pub fn generate_makefile(profile: &McuProfile, device_name: &str) -> String {
    format!(
        r#"# Makefile for V-USB Bootloader
# MCU: {description}
# Device: {name}

MCU = {mcu}
F_CPU = {f_cpu}
FORMAT = ihex
TARGET = bootloader

OBJECTS = main.o usbdrv/usbdrv.o usbdrv/usbdrvasm.o oddebug.o

CFLAGS = -g -Os -Wall -Wextra -std=gnu99
CFLAGS += -mmcu=$(MCU) -DF_CPU=$(F_CPU)UL
CFLAGS += -fno-move-loop-invariants -fno-tree-scev-cprop -fno-inline-small-functions
CFLAGS += -fno-split-wide-types -fno-strict-aliasing -fshort-enums
CFLAGS += -Wall -Wstrict-prototypes
CFLAGS += -funsigned-char -funsigned-bitfields -fpack-struct

LDFLAGS = -Wl,--relax,--gc-sections

CC = avr-gcc
OBJCOPY = avr-objcopy
OBJDUMP = avr-objdump
SIZE = avr-size
AR = avr-ar
NM = avr-nm
AVRDUDE = avrdude
REMOVE = rm -f
REMOVEDIR = rm -rf

all: $(TARGET).hex $(TARGET).eep size

%.o: %.c
	$(CC) -c $(CFLAGS) -o $@ $<

%.o: %.S
	$(CC) -c $(CFLAGS) -o $@ $<

$(TARGET).elf: $(OBJECTS)
	$(CC) $(LDFLAGS) -o $@ $^

$(TARGET).hex: $(TARGET).elf
	$(OBJCOPY) -O $(FORMAT) -R .eeprom $< $@

$(TARGET).eep: $(TARGET).elf
	-$(OBJCOPY) -j .eeprom --set-section-flags=.eeprom="alloc,load" \
	--change-section-lma .eeprom=0 -O $(FORMAT) $< $@

size: $(TARGET).elf
	@$(SIZE) --format=avr --mcu=$(MCU) $(TARGET).elf

clean:
	$(REMOVE) $(TARGET).hex $(TARGET).eep $(TARGET).elf
	$(REMOVE) $(OBJECTS)
	$(REMOVE) $(TARGET).map

.PHONY: all clean size
"#,
        description = profile.description,
        name = device_name,
        mcu = profile.id,
        f_cpu = profile.clock_hz,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Copy main.c (and oddebug, generating minimal stubs if the V-USB checkout
/// ships without them) into the build tree.
fn copy_firmware_sources(vusb_dir: &Path, build_dir: &Path) -> Result<()> {
    let firmware = vusb_dir.join("examples/hid-data/firmware");

    std::fs::copy(firmware.join("main.c"), build_dir.join("main.c"))?;

    let oddebug_c = firmware.join("oddebug.c");
    if oddebug_c.exists() {
        std::fs::copy(&oddebug_c, build_dir.join("oddebug.c"))?;
        std::fs::copy(firmware.join("oddebug.h"), build_dir.join("oddebug.h"))?;
    } else {
        std::fs::write(
            build_dir.join("oddebug.c"),
            "#include \"oddebug.h\"\nvoid odDebugInit(void) {}\n",
        )?;
        std::fs::write(
            build_dir.join("oddebug.h"),
            "#ifndef __oddebug_h_included__\n\
             #define __oddebug_h_included__\n\
             #define odDebugInit()\n\
             #define DBG1(x,y,z)\n\
             #endif\n",
        )?;
    }

    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Check that the AVR build toolchain is installed.
pub fn check_build_tools() -> Result<()> {
    let mut missing = Vec::new();
    for tool in ["avr-gcc", "avr-objcopy", "make"] {
        let probe = Command::new(tool)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        if matches!(&probe, Err(e) if e.kind() == std::io::ErrorKind::NotFound) {
            missing.push(tool);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FlashError::BuildToolsMissing(missing.join(", ")))
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
    fn usbconfig_embeds_profile_wiring() {
        let profile = McuProfile::lookup("atmega32u4").unwrap();
        let cfg = generate_usbconfig(profile, "Button Box", "16C0", "0x05df").unwrap();

        assert!(cfg.contains("#define USB_CFG_VENDOR_ID       0x16c0"));
        assert!(cfg.contains("#define USB_CFG_DEVICE_ID       0x05df"));
        assert!(cfg.contains("#define USB_CFG_IOPORTNAME      D"));
        assert!(cfg.contains("#define USB_CFG_DPLUS_BIT       4"));
        assert!(cfg.contains("#define USB_CFG_DMINUS_BIT      3"));
        assert!(cfg.contains("#define USB_CFG_DEVICE_NAME     \"Button Box\""));
        assert!(cfg.contains("#define USB_CFG_DEVICE_NAME_LEN 10"));
    }

    #[test]
    fn usbconfig_truncates_long_names() {
        let profile = McuProfile::lookup("atmega328p").unwrap();
        let long = "A".repeat(64);
        let cfg = generate_usbconfig(profile, &long, "16c0", "05df").unwrap();
        assert!(cfg.contains(&format!("\"{}\"", "A".repeat(32))));
        assert!(cfg.contains("USB_CFG_DEVICE_NAME_LEN 32"));
    }

    #[test]
    fn usbconfig_rejects_bad_ids() {
        let profile = McuProfile::lookup("atmega328p").unwrap();
        assert!(generate_usbconfig(profile, "X", "notahexid", "05df").is_err());
    }

    #[test]
    fn makefile_carries_mcu_and_clock() {
        let profile = McuProfile::lookup("attiny85").unwrap();
        let mk = generate_makefile(profile, "Tiny");
        assert!(mk.contains("MCU = attiny85"));
        assert!(mk.contains("F_CPU = 16500000"));
        assert!(mk.contains("TARGET = bootloader"));
    }

    #[test]
    fn build_fails_without_vusb_sources() {
        let dir = tempfile::tempdir().unwrap();
        let req = BuildRequest {
            mcu_id: "atmega328p".into(),
            device_name: "Test".into(),
            vendor_id: DEFAULT_VENDOR_ID.into(),
            product_id: DEFAULT_PRODUCT_ID.into(),
            vusb_dir: dir.path().join("missing"),
            output_dir: dir.path().to_owned(),
        };
        match build(&req) {
            Err(FlashError::VusbSourceNotFound(_)) => {}
            other => panic!("expected VusbSourceNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn copy_tree_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.c"), "int a;").unwrap();
        std::fs::write(src.join("nested/b.h"), "int b;").unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(std::fs::read_to_string(dst.join("a.c")).unwrap(), "int a;");
        assert_eq!(
            std::fs::read_to_string(dst.join("nested/b.h")).unwrap(),
            "int b;"
        );
    }
}
