//! Updater configuration.
//!
//! Loaded from a TOML file; one [`DeviceProfile`] per supported hardware
//! family plus a couple of global switches. Immutable for the duration of
//! a run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// How to talk to a single hardware family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    /// Friendly name for logs.
    pub name: String,

    /// USB IDs of the bootloader as listed in the firmware image.
    pub vendor_id: u16,
    pub product_id: u16,

    /// Path to the firmware image (FDT blob) for this family.
    pub image_path: PathBuf,

    pub usb_config: u8,
    pub usb_interface: u8,
    pub usb_alternate: u8,

    /// Bulk IN endpoint number (direction bit is added internally).
    pub usb_input_endpoint: u8,
    /// Bytes per buffered IN transfer.
    pub usb_read_size: usize,
    /// IN transfers kept in flight; values above 1 enable the read ring.
    pub usb_read_buffer_size: usize,

    /// Bulk OUT endpoint number.
    pub usb_output_endpoint: u8,
    /// Bytes per buffered OUT transfer.
    pub usb_write_size: usize,
    /// OUT transfers kept in flight; values above 1 enable the write ring.
    pub usb_write_buffer_size: usize,

    /// Per-operation USB timeout in milliseconds; 0 disables the bound.
    pub usb_op_timeout_ms: u64,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            vendor_id: 0,
            product_id: 0,
            image_path: PathBuf::new(),
            usb_config: 1,
            usb_interface: 0,
            usb_alternate: 0,
            usb_input_endpoint: 1,
            usb_read_size: 512,
            usb_read_buffer_size: 1,
            usb_output_endpoint: 1,
            usb_write_size: 4096,
            usb_write_buffer_size: 1,
            usb_op_timeout_ms: 10_000,
        }
    }
}

impl DeviceProfile {
    /// Operation timeout, `None` when unbounded.
    pub fn usb_op_timeout(&self) -> Option<Duration> {
        if self.usb_op_timeout_ms > 0 {
            Some(Duration::from_millis(self.usb_op_timeout_ms))
        } else {
            None
        }
    }
}

/// Top-level updater configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub devices: Vec<DeviceProfile>,

    /// libusb verbosity, 0 (silent) to 3.
    pub libusb_debug_level: u8,

    /// Leave the device in the bootloader after flashing.
    pub skip_reboot_after_flash: bool,
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UpdateConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
