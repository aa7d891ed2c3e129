//! Device model detection and sysfs endpoints
//!
//! The daemon drives a fixed set of sysfs-like endpoints: power-supply
//! presence, backlight power, keyboard presence, three indicator LEDs and the
//! system sleep-state node. Which concrete paths back those endpoints depends
//! on the device model, detected once at startup from the devicetree
//! compatible string (with an existence probe as fallback). The resolved
//! table is immutable for the process lifetime.
//!
//! All endpoint I/O is one line of ASCII, "0"/"1" for booleans. Read and
//! write failures are transient: callers log and retry on the next cycle.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const DEVICE_CLASS_FILE: &str = "/sys/firmware/devicetree/base/compatible";

/// Endpoint table for the PinePhone Pro
const PINEPHONE_PRO: [&str; Endpoint::COUNT] = [
    "/sys/class/power_supply/rk818-usb/present",
    "/sys/class/backlight/backlight/bl_power",
    "/sys/class/power_supply/ip5xxx-usb/present",
    "/sys/class/leds/red:indicator/brightness",
    "/sys/class/leds/blue:indicator/brightness",
    "/sys/class/leds/green:indicator/brightness",
    "/sys/power/state",
];

/// Endpoint table for the original PinePhone
const PINEPHONE: [&str; Endpoint::COUNT] = [
    "/sys/class/power_supply/axp20x-usb/online",
    "/sys/class/backlight/backlight/bl_power",
    "/sys/class/power_supply/ip5xxx-usb/present",
    "/sys/class/leds/red:indicator/brightness",
    "/sys/class/leds/blue:indicator/brightness",
    "/sys/class/leds/green:indicator/brightness",
    "/sys/power/state",
];

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("could not determine device model")]
    UnknownDevice,

    #[error("{path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("{path}: unparsable value {value:?}")]
    Parse { path: String, value: String },
}

/// Abstract hardware endpoints, in device-table order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// External power present (read, "1" = charging)
    PowerSupply,
    /// Backlight power (read, "0" = display on)
    Display,
    /// Attached keyboard battery present (read)
    Keyboard,
    LedRed,
    LedBlue,
    LedGreen,
    /// Kernel sleep-state control node
    SleepState,
}

impl Endpoint {
    pub const COUNT: usize = 7;

    fn index(self) -> usize {
        match self {
            Self::PowerSupply => 0,
            Self::Display => 1,
            Self::Keyboard => 2,
            Self::LedRed => 3,
            Self::LedBlue => 4,
            Self::LedGreen => 5,
            Self::SleepState => 6,
        }
    }
}

/// Resolved endpoint paths for the detected device model
#[derive(Debug, Clone)]
pub struct DeviceMap {
    paths: [PathBuf; Endpoint::COUNT],
}

impl DeviceMap {
    /// Detect the device model and resolve its endpoint table.
    ///
    /// Tries the devicetree compatible string first, then falls back to
    /// probing each model's power-supply endpoint for existence.
    pub fn detect() -> Result<Self, HardwareError> {
        if let Ok(compatible) = std::fs::read(DEVICE_CLASS_FILE) {
            // The compatible node holds NUL-separated model strings
            let compatible = String::from_utf8_lossy(&compatible);
            if compatible.contains("pinephone-pro") {
                log::info!("detected PinePhone Pro");
                return Ok(Self::from_table(&PINEPHONE_PRO));
            }
            if compatible.contains("pinephone") {
                log::info!("detected PinePhone");
                return Ok(Self::from_table(&PINEPHONE));
            }
        }

        if Path::new(PINEPHONE_PRO[0]).exists() {
            log::info!("probed PinePhone Pro power supply");
            return Ok(Self::from_table(&PINEPHONE_PRO));
        }
        if Path::new(PINEPHONE[0]).exists() {
            log::info!("probed PinePhone power supply");
            return Ok(Self::from_table(&PINEPHONE));
        }

        Err(HardwareError::UnknownDevice)
    }

    fn from_table(table: &[&str; Endpoint::COUNT]) -> Self {
        Self {
            paths: table.map(PathBuf::from),
        }
    }

    /// Build a map from explicit paths, in `Endpoint` order
    pub fn from_paths(paths: [PathBuf; Endpoint::COUNT]) -> Self {
        Self { paths }
    }

    pub fn path(&self, endpoint: Endpoint) -> &Path {
        &self.paths[endpoint.index()]
    }

    /// Read a boolean endpoint: one trimmed ASCII integer, nonzero = true
    pub fn read_flag(&self, endpoint: Endpoint) -> Result<bool, HardwareError> {
        let path = self.path(endpoint);
        let raw = std::fs::read_to_string(path).map_err(|e| HardwareError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let value = raw.trim();
        let parsed: i64 = value.parse().map_err(|_| HardwareError::Parse {
            path: path.display().to_string(),
            value: value.to_string(),
        })?;

        Ok(parsed != 0)
    }

    /// Write a boolean endpoint as "1"/"0"
    pub fn write_flag(&self, endpoint: Endpoint, on: bool) -> Result<(), HardwareError> {
        let path = self.path(endpoint);
        let io = |e| HardwareError::Io {
            path: path.display().to_string(),
            source: e,
        };

        let mut file = OpenOptions::new().append(true).open(path).map_err(io)?;
        file.write_all(if on { b"1" } else { b"0" }).map_err(io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_map() -> (PathBuf, DeviceMap) {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = PathBuf::from(format!("/tmp/sleepwalkd-hw-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let paths = [
            dir.join("psu"),
            dir.join("display"),
            dir.join("keyboard"),
            dir.join("led_red"),
            dir.join("led_blue"),
            dir.join("led_green"),
            dir.join("sleep_state"),
        ];
        (dir.clone(), DeviceMap::from_paths(paths))
    }

    #[test]
    fn read_flag_parses_ascii_booleans() {
        let (_dir, map) = scratch_map();
        std::fs::write(map.path(Endpoint::PowerSupply), "1\n").unwrap();
        assert!(map.read_flag(Endpoint::PowerSupply).unwrap());

        std::fs::write(map.path(Endpoint::PowerSupply), "0\n").unwrap();
        assert!(!map.read_flag(Endpoint::PowerSupply).unwrap());
    }

    #[test]
    fn read_flag_missing_file_is_io_error() {
        let (_dir, map) = scratch_map();
        let err = map.read_flag(Endpoint::Keyboard).unwrap_err();
        assert!(matches!(err, HardwareError::Io { .. }));
    }

    #[test]
    fn read_flag_garbage_is_parse_error() {
        let (_dir, map) = scratch_map();
        std::fs::write(map.path(Endpoint::Display), "auto\n").unwrap();
        let err = map.read_flag(Endpoint::Display).unwrap_err();
        assert!(matches!(err, HardwareError::Parse { .. }));
    }

    #[test]
    fn write_flag_appends_ascii() {
        let (_dir, map) = scratch_map();
        std::fs::write(map.path(Endpoint::LedRed), "").unwrap();
        map.write_flag(Endpoint::LedRed, true).unwrap();
        map.write_flag(Endpoint::LedRed, false).unwrap();
        assert_eq!(
            std::fs::read_to_string(map.path(Endpoint::LedRed)).unwrap(),
            "10"
        );
    }
}
