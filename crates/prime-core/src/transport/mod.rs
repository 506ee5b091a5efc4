//! USB transport layer.
//!
//! Abstracts the opened device behind a cancellable reader/writer pair so
//! the fastboot channel and the orchestrator never touch libusb directly,
//! and so tests can substitute a scripted mock.

pub mod mock;
pub mod rusb;
pub mod stream;
pub mod traits;

pub use self::mock::{MockDevice, MockTransport};
pub use self::rusb::RusbBackend;
pub use self::stream::{ReadStream, WriteStream};
pub use self::traits::{ContextReader, ContextWriter, TransportError, UsbBackend, UsbLink};
