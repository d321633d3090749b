// ─────────────────────────────────────────────────────────────────────────────
//  vuflash :: usb  —  USB device descriptor matching
//
//  Matches a (vendor id, product id) pair against whatever is physically
//  attached right now.  Enumeration is platform-specific and hidden behind
//  the UsbEnumerator trait:
//
//  Windows
//    `powershell Get-WmiObject Win32_PnPEntity` filtered to USB device IDs,
//    emitted as JSON.  The PNP device ID carries the VID/PID as embedded
//    substrings (e.g. USB\VID_16C0&PID_05DF\...).
//
//  Linux / WSL
//    Walk /sys/bus/usb/devices; every real device node has idVendor and
//    idProduct files.  A synthetic VID_/PID_ identifier string is built so
//    downstream matching is platform-independent.
//
//  A fresh scan is taken on every query — attachment state changes between
//  calls and the result is never cached.
// ─────────────────────────────────────────────────────────────────────────────

use crate::error::{FlashError, Result};

// ─────────────────────────────────────────────────────────────────────────────
//  Data model
// ─────────────────────────────────────────────────────────────────────────────

/// Live status of an enumerated device as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Present,
    Absent,
    Unknown,
}

impl DeviceStatus {
    /// Map a platform status string onto the three-valued status.
    /// WMI reports "OK" for live devices and "Error"/"Degraded" for ghost
    /// entries of devices that were unplugged.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "OK" => DeviceStatus::Present,
            "Error" | "Degraded" => DeviceStatus::Absent,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// A matched USB device.  `(vendor_id, product_id)` identifies a class of
/// device, not a physical unit — two units of the same product are
/// indistinguishable here.
#[derive(Debug, Clone, PartialEq)]
pub struct UsbDevice {
    /// Canonical 4-hex-digit uppercase form, e.g. "16C0".
    pub vendor_id:  String,
    pub product_id: String,
    pub display_name: String,
    /// Opaque platform identifier (PNP device ID on Windows, sysfs-derived
    /// string on Linux).  Not parsed beyond the VID_/PID_ substrings.
    pub raw_platform_id: String,
    pub status: DeviceStatus,
}

/// One raw record from the enumeration collaborator.
#[derive(Debug, Clone, Default)]
pub struct RawUsbRecord {
    pub name:        String,
    pub description: String,
    pub device_id:   String,
    pub status:      String,
}

/// Source of raw device records.  `scan` must return a fresh, finite
/// snapshot on every call.
pub trait UsbEnumerator {
    fn scan(&self) -> Vec<RawUsbRecord>;
}

// ─────────────────────────────────────────────────────────────────────────────
//  Matching
// ─────────────────────────────────────────────────────────────────────────────

/// Normalize a USB vendor/product id to canonical 4-hex-digit uppercase
/// form.  Accepts "0x16c0", "16C0", "5df", …
pub fn normalize_usb_id(id: &str) -> Result<String> {
    let trimmed = id.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty()
        || digits.len() > 4
        || !digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(FlashError::InvalidUsbId(id.to_owned()));
    }

    Ok(format!("{:0>4}", digits.to_uppercase()))
}

/// Extract the VID/PID substrings embedded in a platform device identifier,
/// already canonicalized.  Returns None for whichever half is missing.
pub fn parse_device_id(device_id: &str) -> (Option<String>, Option<String>) {
    let upper = device_id.to_uppercase();
    (extract_hex4(&upper, "VID_"), extract_hex4(&upper, "PID_"))
}

fn extract_hex4(haystack: &str, tag: &str) -> Option<String> {
    let pos = haystack.find(tag)?;
    let rest = &haystack[pos + tag.len()..];
    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .take(4)
        .collect();
    if digits.len() == 4 {
        Some(digits)
    } else {
        None
    }
}

/// Find the first attached device matching the given VID/PID pair.
///
/// `None` is the normal "device unplugged" outcome, not an error.  Malformed
/// records are skipped — one unparsable entry must not hide a real match.
/// When several physical units of the same product are attached, enumeration
/// order decides which one is returned, and that order is not stable across
/// calls.
pub fn find_device(
    enumerator: &dyn UsbEnumerator,
    vendor_id: &str,
    product_id: &str,
) -> Result<Option<UsbDevice>> {
    let vid = normalize_usb_id(vendor_id)?;
    let pid = normalize_usb_id(product_id)?;

    for record in enumerator.scan() {
        let (rec_vid, rec_pid) = parse_device_id(&record.device_id);
        let (Some(rec_vid), Some(rec_pid)) = (rec_vid, rec_pid) else {
            continue;
        };

        if rec_vid == vid && rec_pid == pid {
            log::debug!("matched {}:{} on '{}'", vid, pid, record.device_id);
            return Ok(Some(UsbDevice {
                vendor_id: rec_vid,
                product_id: rec_pid,
                display_name: if record.name.is_empty() {
                    record.description.clone()
                } else {
                    record.name.clone()
                },
                raw_platform_id: record.device_id,
                status: DeviceStatus::from_raw(&record.status),
            }));
        }
    }

    Ok(None)
}

/// All attached USB devices with a recognizable VID/PID, for diagnostics
/// listings.
pub fn list_devices(enumerator: &dyn UsbEnumerator) -> Vec<UsbDevice> {
    enumerator
        .scan()
        .into_iter()
        .filter_map(|record| {
            let (vid, pid) = parse_device_id(&record.device_id);
            Some(UsbDevice {
                vendor_id: vid?,
                product_id: pid?,
                display_name: if record.name.is_empty() {
                    record.description.clone()
                } else {
                    record.name.clone()
                },
                raw_platform_id: record.device_id,
                status: DeviceStatus::from_raw(&record.status),
            })
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
//  Platform enumerator
// ─────────────────────────────────────────────────────────────────────────────

/// Enumerator backed by the host OS.
pub struct SystemEnumerator;

impl UsbEnumerator for SystemEnumerator {
    fn scan(&self) -> Vec<RawUsbRecord> {
        #[cfg(target_os = "windows")]
        return windows_scan();

        #[cfg(target_os = "linux")]
        return linux_scan();

        #[cfg(not(any(target_os = "windows", target_os = "linux")))]
        return Vec::new();
    }
}

// ─── Windows ─────────────────────────────────────────────────────────────────

#[cfg(target_os = "windows")]
fn windows_scan() -> Vec<RawUsbRecord> {
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct PnpEntity {
        #[serde(rename = "Name", default)]
        name: Option<String>,
        #[serde(rename = "Description", default)]
        description: Option<String>,
        #[serde(rename = "DeviceID", default)]
        device_id: Option<String>,
        #[serde(rename = "Status", default)]
        status: Option<String>,
    }

    const PS_QUERY: &str = r#"
        Get-WmiObject Win32_PnPEntity | Where-Object {
            $_.DeviceID -match "USB"
        } | Select-Object Name, Description, DeviceID, Status | ConvertTo-Json
    "#;

    let out = match std::process::Command::new("powershell")
        .args(["-NoProfile", "-Command", PS_QUERY])
        .output()
    {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).to_string(),
        _ => return Vec::new(),
    };

    if out.trim().is_empty() {
        return Vec::new();
    }

    // ConvertTo-Json emits a bare object for a single result, an array
    // otherwise.
    let entities: Vec<PnpEntity> = match serde_json::from_str::<Vec<PnpEntity>>(&out) {
        Ok(v) => v,
        Err(_) => match serde_json::from_str::<PnpEntity>(&out) {
            Ok(one) => vec![one],
            Err(e) => {
                log::warn!("unparsable WMI output: {}", e);
                return Vec::new();
            }
        },
    };

    entities
        .into_iter()
        .map(|e| RawUsbRecord {
            name:        e.name.unwrap_or_default(),
            description: e.description.unwrap_or_default(),
            device_id:   e.device_id.unwrap_or_default(),
            status:      e.status.unwrap_or_default(),
        })
        .collect()
}

// ─── Linux / WSL ─────────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
fn linux_scan() -> Vec<RawUsbRecord> {
    let mut records = Vec::new();

    let entries = match std::fs::read_dir("/sys/bus/usb/devices") {
        Ok(e) => e,
        Err(_) => return records,
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        let vid = read_sysfs_id(&dir.join("idVendor"));
        let pid = read_sysfs_id(&dir.join("idProduct"));

        // Interface nodes and hubs without id files are not devices
        let (Some(vid), Some(pid)) = (vid, pid) else {
            continue;
        };

        let product = std::fs::read_to_string(dir.join("product"))
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();

        records.push(RawUsbRecord {
            name: product.clone(),
            description: product,
            device_id: format!(
                r"USB\VID_{}&PID_{}\{}",
                vid,
                pid,
                entry.file_name().to_string_lossy()
            ),
            // Anything visible in sysfs is attached
            status: "OK".into(),
        });
    }

    records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    records
}

#[cfg(target_os = "linux")]
fn read_sysfs_id(path: &std::path::Path) -> Option<String> {
    let s = std::fs::read_to_string(path).ok()?;
    let digits = s.trim();
    if digits.len() == 4 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digits.to_uppercase())
    } else {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedEnumerator(Vec<RawUsbRecord>);

    impl UsbEnumerator for FixedEnumerator {
        fn scan(&self) -> Vec<RawUsbRecord> {
            self.0.clone()
        }
    }

    fn record(device_id: &str, name: &str, status: &str) -> RawUsbRecord {
        RawUsbRecord {
            name: name.into(),
            description: format!("{} (desc)", name),
            device_id: device_id.into(),
            status: status.into(),
        }
    }

    #[test]
    fn normalization_is_canonical() {
        assert_eq!(normalize_usb_id("0x16c0").unwrap(), "16C0");
        assert_eq!(normalize_usb_id("16C0").unwrap(), "16C0");
        assert_eq!(normalize_usb_id("16c0").unwrap(), "16C0");
        assert_eq!(normalize_usb_id("5df").unwrap(), "05DF");
        assert_eq!(normalize_usb_id("0X05DF").unwrap(), "05DF");
    }

    #[test]
    fn normalization_rejects_garbage() {
        assert!(normalize_usb_id("").is_err());
        assert!(normalize_usb_id("0x").is_err());
        assert!(normalize_usb_id("16c0f").is_err());
        assert!(normalize_usb_id("butn").is_err());
    }

    #[test]
    fn parse_device_id_extracts_both_halves() {
        let (vid, pid) = parse_device_id(r"USB\VID_16C0&PID_05DF\5&3A8D1E9B&0&1");
        assert_eq!(vid.as_deref(), Some("16C0"));
        assert_eq!(pid.as_deref(), Some("05DF"));

        let (vid, pid) = parse_device_id(r"ROOT\HUB30");
        assert_eq!(vid, None);
        assert_eq!(pid, None);
    }

    #[test]
    fn parse_device_id_is_case_insensitive() {
        let (vid, pid) = parse_device_id(r"usb\vid_16c0&pid_05df\x");
        assert_eq!(vid.as_deref(), Some("16C0"));
        assert_eq!(pid.as_deref(), Some("05DF"));
    }

    #[test]
    fn find_matches_regardless_of_query_form() {
        let en = FixedEnumerator(vec![
            record(r"USB\VID_2341&PID_0043\A", "Arduino Uno", "OK"),
            record(r"USB\VID_16C0&PID_05DF\B", "Button Box", "OK"),
        ]);

        for (vid, pid) in [("0x16C0", "0x05DF"), ("16c0", "05df"), ("16C0", "05DF")] {
            let found = find_device(&en, vid, pid).unwrap().unwrap();
            assert_eq!(found.vendor_id, "16C0");
            assert_eq!(found.product_id, "05DF");
            assert_eq!(found.display_name, "Button Box");
            assert_eq!(found.status, DeviceStatus::Present);
        }
    }

    #[test]
    fn absent_device_is_none_not_error() {
        let en = FixedEnumerator(vec![record(r"USB\VID_2341&PID_0043\A", "Uno", "OK")]);
        let found = find_device(&en, "0x16c0", "0x05df").unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn malformed_records_do_not_hide_a_match() {
        let en = FixedEnumerator(vec![
            record("", "", ""),
            record(r"ROOT\COMPOSITE", "Hub", "OK"),
            record(r"USB\VID_16C0&PID_05DF\B", "Button Box", "OK"),
        ]);
        let found = find_device(&en, "16c0", "5df").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn first_of_duplicate_units_wins() {
        let en = FixedEnumerator(vec![
            record(r"USB\VID_16C0&PID_05DF\UNIT1", "Box 1", "OK"),
            record(r"USB\VID_16C0&PID_05DF\UNIT2", "Box 2", "OK"),
        ]);
        let found = find_device(&en, "16c0", "05df").unwrap().unwrap();
        assert_eq!(found.raw_platform_id, r"USB\VID_16C0&PID_05DF\UNIT1");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(DeviceStatus::from_raw("OK"), DeviceStatus::Present);
        assert_eq!(DeviceStatus::from_raw("Error"), DeviceStatus::Absent);
        assert_eq!(DeviceStatus::from_raw(""), DeviceStatus::Unknown);
        assert_eq!(DeviceStatus::from_raw("Starting"), DeviceStatus::Unknown);
    }

    #[test]
    fn list_devices_skips_unparsable_entries() {
        let en = FixedEnumerator(vec![
            record(r"ROOT\HUB30", "Root Hub", "OK"),
            record(r"USB\VID_2341&PID_0043\A", "Uno", "OK"),
        ]);
        let listed = list_devices(&en);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].vendor_id, "2341");
    }
}
