//! prime-core: fastboot firmware updater for Denon Prime hardware.
//!
//! Drives Prime 4 family units over USB while they are halted in a
//! bootloader speaking the Android fastboot protocol: validates a vendor
//! firmware image shaped as a Flattened Device Tree, decompresses payloads
//! on the fly, streams them into device RAM and flashes named partitions.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Fdt**: read-only view over the firmware container
//! - **Xz**: uncompressed-size inspection of XZ streams (footer + index)
//! - **Manifest**: image inventory, device list and hash verification
//! - **Transport**: cancellable USB bulk I/O (rusb, ring buffers, mock)
//! - **Fastboot**: framed request/response channel with a demux task
//! - **Updater**: the orchestrating state machine
//!
//! # Example
//!
//! ```no_run
//! use prime_core::{CancelToken, UpdateConfig, Updater};
//!
//! let config = UpdateConfig::load_from_file("config.toml").expect("config");
//! let updater = Updater::new(config).expect("at least one device profile");
//!
//! let root = CancelToken::new();
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! std::thread::spawn(move || {
//!     for progress in rx.iter() {
//!         eprintln!("{}", progress.text);
//!     }
//! });
//! updater.run(&root, tx).expect("update failed");
//! ```

pub mod cancel;
pub mod config;
pub mod fastboot;
pub mod fdt;
pub mod manifest;
pub mod progress;
pub mod transport;
pub mod updater;
pub mod xz;

// Re-exports for convenience
pub use cancel::{CancelState, CancelToken};
pub use config::{DeviceProfile, UpdateConfig};
pub use fastboot::{FastbootChannel, FastbootError, Frame};
pub use fdt::{Fdt, FdtError};
pub use manifest::{Compression, DeviceId, HashAlgo, ImageEntry, Manifest, ManifestError};
pub use progress::Progress;
pub use transport::{
    ContextReader, ContextWriter, MockDevice, MockTransport, RusbBackend, TransportError,
    UsbBackend, UsbLink,
};
pub use updater::{UpdateError, Updater};
pub use xz::XzError;
