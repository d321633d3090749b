// ─────────────────────────────────────────────────────────────────────────────
//  vuflash :: driver  —  Windows driver package generation
//
//  Emits a static INF installation descriptor for a V-USB device.  Pure
//  text templating, no runtime behavior — installation itself is the OS
//  driver subsystem's business.
// ─────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::usb::normalize_usb_id;

pub const DEFAULT_MANUFACTURER: &str = "V-USB Project";

/// Render the INF file content for one device identity.
pub fn generate_inf(
    device_name: &str,
    vendor_id: &str,
    product_id: &str,
    manufacturer: &str,
) -> Result<String> {
    // INF hardware IDs carry bare 4-digit uppercase hex, no 0x prefix
    let vid = normalize_usb_id(vendor_id)?;
    let pid = normalize_usb_id(product_id)?;

    Ok(format!(
        r#"[Version]
Signature="$Windows NT$"
Class=USB
ClassGuid={{36FC9E60-C465-11CF-8056-444553540000}}
Provider=%MANUFACTURER%
DriverVer=01/01/2024,1.0.0.0
CatalogFile=vusb_driver.cat

[Manufacturer]
%MANUFACTURER%=Devices,NT,NTx86

[Devices.NT]
%DEVICE_NAME%=USB_Install, USB\VID_{vid}&PID_{pid}

[Devices.NTx86]
%DEVICE_NAME%=USB_Install, USB\VID_{vid}&PID_{pid}

[USB_Install.NT]
Include=winusb.inf
Needs=WINUSB.NT

[USB_Install.NT.Services]
Include=winusb.inf
Needs=WINUSB.NT.Services

[USB_Install.NT.HW]
AddReg=Dev_AddReg

[Dev_AddReg]
HKR,,DeviceInterfaceGUIDs,0x10000,"{{12345678-1234-1234-1234-123456789ABC}}"

[Strings]
MANUFACTURER="{manufacturer}"
DEVICE_NAME="{device_name}"
"#,
        vid = vid,
        pid = pid,
        manufacturer = manufacturer,
        device_name = device_name,
    ))
}

/// Write a driver package (INF + README) into `output_dir`.  Returns the
/// INF path.
pub fn write_package(
    output_dir: &Path,
    device_name: &str,
    vendor_id: &str,
    product_id: &str,
    manufacturer: &str,
) -> Result<PathBuf> {
    let inf = generate_inf(device_name, vendor_id, product_id, manufacturer)?;

    std::fs::create_dir_all(output_dir)?;

    let safe_name = device_name.replace(' ', "_").to_lowercase();
    let inf_path = output_dir.join(format!("{}.inf", safe_name));
    std::fs::write(&inf_path, inf)?;

    let readme = format!(
        "{name} driver package\n\
         =====================\n\n\
         Hardware ID: USB\\VID_{vid}&PID_{pid}\n\n\
         Install by right-clicking {file} and choosing Install, or point\n\
         Device Manager's driver update dialog at this folder.\n",
        name = device_name,
        vid = normalize_usb_id(vendor_id)?,
        pid = normalize_usb_id(product_id)?,
        file = inf_path.file_name().unwrap_or_default().to_string_lossy(),
    );
    std::fs::write(output_dir.join("README.txt"), readme)?;

    Ok(inf_path)
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn inf_carries_normalized_hardware_id() {
        let inf = generate_inf("Button Box", "0x16c0", "5df", DEFAULT_MANUFACTURER).unwrap();
        assert!(inf.contains(r"USB\VID_16C0&PID_05DF"));
        assert!(inf.contains("DEVICE_NAME=\"Button Box\""));
        assert!(inf.contains("MANUFACTURER=\"V-USB Project\""));
        assert!(!inf.contains("0x16c0"));
    }

    #[test]
    fn inf_rejects_invalid_ids() {
        assert!(generate_inf("X", "xyzzy", "05df", DEFAULT_MANUFACTURER).is_err());
    }

    #[test]
    fn package_writes_inf_and_readme() {
        let dir = tempfile::tempdir().unwrap();
        let inf_path = write_package(
            dir.path(),
            "Button Box",
            "16c0",
            "05df",
            DEFAULT_MANUFACTURER,
        )
        .unwrap();

        assert_eq!(
            inf_path.file_name().unwrap().to_string_lossy(),
            "button_box.inf"
        );
        let inf = std::fs::read_to_string(&inf_path).unwrap();
        assert!(inf.contains(r"USB\VID_16C0&PID_05DF"));

        let readme = std::fs::read_to_string(dir.path().join("README.txt")).unwrap();
        assert!(readme.contains("button_box.inf"));
    }
}
