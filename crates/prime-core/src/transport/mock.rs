//! Mock USB transport for exercising the fastboot channel and the
//! orchestrator without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::traits::{
    ContextReader, ContextWriter, POLL_INTERVAL, TransportError, UsbBackend, UsbLink,
};
use crate::cancel::{CancelState, CancelToken};
use crate::config::DeviceProfile;
use crate::manifest::DeviceId;

#[derive(Default)]
struct MockState {
    /// Scripted inbound frames, one bulk IN transaction each.
    frames: Mutex<VecDeque<Vec<u8>>>,
    /// Every bulk OUT transaction, commands and payload chunks alike.
    writes: Mutex<Vec<Vec<u8>>>,
    written_bytes: AtomicU64,
    /// Writes stall (until cancelled) once this many bytes went out.
    write_limit: Mutex<Option<u64>>,
}

/// One scripted device. Clones share the same state, so tests keep a handle
/// for assertions while the orchestrator owns the opened link.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw response frame to be returned on a future read.
    pub fn queue_frame(&self, frame: &[u8]) {
        self.state.frames.lock().unwrap().push_back(frame.to_vec());
    }

    /// Queue an `OKAY` response with the given payload.
    pub fn queue_okay(&self, payload: &str) {
        self.queue_frame(format!("OKAY{payload}").as_bytes());
    }

    /// Queue a `DATA` ready-notification for `size` bytes.
    pub fn queue_data(&self, size: u32) {
        self.queue_frame(format!("DATA{size:08x}").as_bytes());
    }

    /// Queue a `FAIL` response.
    pub fn queue_fail(&self, message: &str) {
        self.queue_frame(format!("FAIL{message}").as_bytes());
    }

    /// All captured writes, in wire order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.writes.lock().unwrap().clone()
    }

    /// Total bytes written to the OUT endpoint.
    pub fn written_bytes(&self) -> u64 {
        self.state.written_bytes.load(Ordering::SeqCst)
    }

    /// Make writes beyond `limit` bytes stall until the caller cancels,
    /// simulating a wedged device mid-transfer.
    pub fn stall_writes_after(&self, limit: u64) {
        *self.state.write_limit.lock().unwrap() = Some(limit);
    }

    /// Reader/writer pair backed by this device's script.
    pub fn link(&self) -> UsbLink {
        UsbLink {
            reader: Box::new(MockReader {
                state: self.state.clone(),
            }),
            writer: Box::new(MockWriter {
                state: self.state.clone(),
            }),
            guard: Box::new(()),
        }
    }
}

struct MockReader {
    state: Arc<MockState>,
}

impl ContextReader for MockReader {
    fn read_context(&self, ctx: &CancelToken, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            if let Some(frame) = self.state.frames.lock().unwrap().pop_front() {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                return Ok(n);
            }
            let state = ctx.state();
            if state != CancelState::Active {
                return Err(TransportError::from_cancel(state));
            }
            thread::sleep(POLL_INTERVAL / 10);
        }
    }
}

struct MockWriter {
    state: Arc<MockState>,
}

impl ContextWriter for MockWriter {
    fn write_context(&self, ctx: &CancelToken, buf: &[u8]) -> Result<usize, TransportError> {
        let limit = *self.state.write_limit.lock().unwrap();
        if let Some(limit) = limit {
            while self.state.written_bytes.load(Ordering::SeqCst) + buf.len() as u64 > limit {
                let state = ctx.state();
                if state != CancelState::Active {
                    return Err(TransportError::from_cancel(state));
                }
                thread::sleep(POLL_INTERVAL / 10);
            }
        }
        self.state.writes.lock().unwrap().push(buf.to_vec());
        self.state
            .written_bytes
            .fetch_add(buf.len() as u64, Ordering::SeqCst);
        Ok(buf.len())
    }
}

/// Backend presenting a configurable set of scripted devices; anything else
/// reports [`TransportError::NotFound`].
#[derive(Default)]
pub struct MockTransport {
    devices: Vec<(DeviceId, MockDevice)>,
    open_attempts: Vec<DeviceId>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a present device.
    pub fn add_device(&mut self, id: DeviceId, device: MockDevice) {
        self.devices.push((id, device));
    }

    /// Every `(vid, pid)` the orchestrator tried to open, in order.
    pub fn open_attempts(&self) -> &[DeviceId] {
        &self.open_attempts
    }
}

impl UsbBackend for MockTransport {
    fn open(&mut self, _profile: &DeviceProfile, id: DeviceId) -> Result<UsbLink, TransportError> {
        self.open_attempts.push(id);
        self.devices
            .iter()
            .find(|(device_id, _)| *device_id == id)
            .map(|(_, device)| device.link())
            .ok_or(TransportError::NotFound)
    }
}
