//! Ring-buffered endpoint streams.
//!
//! Mirrors libusb stream transfers in blocking form: a pump thread keeps up
//! to `depth` transfers of `chunk_size` bytes moving between the endpoint
//! and a bounded channel, so large downloads are not gated on one transfer
//! completing at a time.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::debug;

use super::traits::{ContextReader, ContextWriter, POLL_INTERVAL, TransportError};
use crate::cancel::{CancelState, CancelToken};

/// Buffered IN endpoint. The pump thread reads ahead of the consumer.
pub struct ReadStream {
    rx: Receiver<Result<Vec<u8>, TransportError>>,
    leftover: Mutex<Leftover>,
    stop: CancelToken,
    pump: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Leftover {
    buf: Vec<u8>,
    pos: usize,
}

impl ReadStream {
    pub fn spawn(inner: Box<dyn ContextReader>, chunk_size: usize, depth: usize) -> Self {
        let stop = CancelToken::new();
        let (tx, rx) = bounded(depth.max(1));
        let pump_ctx = stop.clone();
        let chunk_size = chunk_size.max(64);
        let pump = thread::spawn(move || read_pump(inner, pump_ctx, tx, chunk_size));
        Self {
            rx,
            leftover: Mutex::new(Leftover::default()),
            stop,
            pump: Some(pump),
        }
    }
}

fn read_pump(
    inner: Box<dyn ContextReader>,
    ctx: CancelToken,
    tx: Sender<Result<Vec<u8>, TransportError>>,
    chunk_size: usize,
) {
    loop {
        let mut buf = vec![0u8; chunk_size];
        match inner.read_context(&ctx, &mut buf) {
            Ok(0) => {
                let _ = tx.send(Ok(Vec::new()));
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                if tx.send(Ok(buf)).is_err() {
                    return;
                }
            }
            Err(TransportError::Cancelled) => return,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

impl ContextReader for ReadStream {
    fn read_context(&self, ctx: &CancelToken, buf: &mut [u8]) -> Result<usize, TransportError> {
        {
            let mut leftover = self.leftover.lock().unwrap();
            if leftover.pos < leftover.buf.len() {
                let n = (leftover.buf.len() - leftover.pos).min(buf.len());
                buf[..n].copy_from_slice(&leftover.buf[leftover.pos..leftover.pos + n]);
                leftover.pos += n;
                return Ok(n);
            }
        }

        loop {
            let state = ctx.state();
            if state != CancelState::Active {
                return Err(TransportError::from_cancel(state));
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(data)) => {
                    if data.is_empty() {
                        return Ok(0);
                    }
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        let mut leftover = self.leftover.lock().unwrap();
                        leftover.buf = data;
                        leftover.pos = n;
                    }
                    return Ok(n);
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        debug!("read stream closed");
    }
}

/// Buffered OUT endpoint. Writes are queued and drained by the pump thread
/// in submission order, so commands written after a payload still arrive
/// after it on the wire.
pub struct WriteStream {
    tx: Option<Sender<Vec<u8>>>,
    chunk_size: usize,
    error: Arc<Mutex<Option<TransportError>>>,
    stop: CancelToken,
    pump: Option<JoinHandle<()>>,
}

impl WriteStream {
    pub fn spawn(inner: Box<dyn ContextWriter>, chunk_size: usize, depth: usize) -> Self {
        let stop = CancelToken::new();
        let (tx, rx) = bounded::<Vec<u8>>(depth.max(1));
        let error = Arc::new(Mutex::new(None));
        let pump_ctx = stop.clone();
        let pump_error = error.clone();
        let pump = thread::spawn(move || {
            for chunk in rx.iter() {
                if let Err(e) = inner.write_context(&pump_ctx, &chunk) {
                    *pump_error.lock().unwrap() = Some(e);
                    return;
                }
            }
        });
        Self {
            tx: Some(tx),
            chunk_size: chunk_size.max(64),
            error,
            stop,
            pump: Some(pump),
        }
    }

    fn take_error(&self) -> Option<TransportError> {
        self.error.lock().unwrap().take()
    }
}

impl ContextWriter for WriteStream {
    fn write_context(&self, ctx: &CancelToken, buf: &[u8]) -> Result<usize, TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::TransferError("endpoint stream closed".into()))?;

        for chunk in buf.chunks(self.chunk_size) {
            let mut pending = chunk.to_vec();
            loop {
                if let Some(e) = self.take_error() {
                    return Err(e);
                }
                let state = ctx.state();
                if state != CancelState::Active {
                    return Err(TransportError::from_cancel(state));
                }
                match tx.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(returned)) => {
                        pending = returned;
                        thread::sleep(POLL_INTERVAL);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        return Err(self.take_error().unwrap_or_else(|| {
                            TransportError::TransferError("endpoint stream closed".into())
                        }));
                    }
                }
            }
        }
        Ok(buf.len())
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        // The protocol awaits the device's final OKAY before tearing a
        // session down, so the queue is already drained on graceful paths;
        // cancelling first keeps teardown prompt when it is not.
        self.stop.cancel();
        self.tx.take();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        debug!("write stream closed");
    }
}
