//! Framed fastboot channel over a cancellable reader/writer pair.
//!
//! A background task demultiplexes inbound frames onto bounded pipelines,
//! one per response class. The orchestrator is the only command producer,
//! so every pipeline has capacity 1: a protocol violation (say, two `OKAY`s
//! for one command) shows up as backpressure and is converted into an error
//! by the operation deadline instead of growing memory.

use std::io::{Read, Seek, SeekFrom};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, trace};

use super::FastbootError;
use super::frame::{Frame, MAX_COMMAND_LEN, MAX_FRAME_LEN};
use crate::cancel::{CancelState, CancelToken};
use crate::transport::{ContextReader, ContextWriter, TransportError};

/// Payload streaming granularity for `download`.
const DOWNLOAD_CHUNK: usize = 128 * 1024;

/// Every pipeline holds exactly one pending frame.
const PIPELINE_DEPTH: usize = 1;

/// Poll slice for selects and pipeline publishes.
const POLL: Duration = Duration::from_millis(10);

pub struct FastbootChannel {
    ctx: CancelToken,
    writer: Box<dyn ContextWriter>,
    result_rx: Receiver<Vec<u8>>,
    ready_rx: Receiver<u32>,
    error_rx: Receiver<FastbootError>,
    info_rx: Option<Receiver<String>>,
    text_rx: Option<Receiver<String>>,
    reader_task: Option<JoinHandle<()>>,
}

impl FastbootChannel {
    /// Spawns the reader task and takes ownership of both endpoint halves.
    /// The task exits on end-of-stream, cancellation of `parent`, or any
    /// terminal protocol error.
    pub fn new(
        parent: &CancelToken,
        reader: Box<dyn ContextReader>,
        writer: Box<dyn ContextWriter>,
    ) -> Self {
        let ctx = parent.child();
        let (info_tx, info_rx) = bounded(PIPELINE_DEPTH);
        let (text_tx, text_rx) = bounded(PIPELINE_DEPTH);
        let (result_tx, result_rx) = bounded(PIPELINE_DEPTH);
        let (ready_tx, ready_rx) = bounded(PIPELINE_DEPTH);
        let (error_tx, error_rx) = bounded(PIPELINE_DEPTH);

        let task_ctx = ctx.clone();
        let reader_task = thread::spawn(move || {
            reader_loop(
                task_ctx,
                reader,
                Pipelines {
                    info: info_tx,
                    text: text_tx,
                    result: result_tx,
                    ready: ready_tx,
                    error: error_tx,
                },
            );
        });

        Self {
            ctx,
            writer,
            result_rx,
            ready_rx,
            error_rx,
            info_rx: Some(info_rx),
            text_rx: Some(text_rx),
            reader_task: Some(reader_task),
        }
    }

    /// Receiver for `INFO` lines; can be taken once.
    pub fn take_info(&mut self) -> Option<Receiver<String>> {
        self.info_rx.take()
    }

    /// Receiver for reassembled `TEXT` strings; can be taken once.
    pub fn take_text(&mut self) -> Option<Receiver<String>> {
        self.text_rx.take()
    }

    /// Executes an arbitrary command and returns the `OKAY` payload.
    ///
    /// `INFO` and `TEXT` frames drain on their own pipelines and never
    /// complete a command; a `FAIL` or any terminal channel error does.
    pub fn command(&self, ctx: &CancelToken, cmd: &str) -> Result<Vec<u8>, FastbootError> {
        self.send_command(ctx, cmd)?;
        self.await_result(ctx)
    }

    /// Requests a variable. An empty payload means the bootloader does not
    /// know the variable; that is not an error here.
    pub fn get_var(&self, ctx: &CancelToken, name: &str) -> Result<String, FastbootError> {
        let payload = self.command(ctx, &format!("getvar:{name}"))?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    /// Streams `size` bytes from `r` into device RAM.
    ///
    /// Sends `download:%08x`, awaits the `DATA` handshake (a premature
    /// `OKAY` is a protocol violation, a size disagreement aborts before
    /// any payload byte), then streams in 128 KiB chunks and awaits the
    /// final `OKAY`.
    pub fn download<R: Read + ?Sized>(
        &self,
        ctx: &CancelToken,
        r: &mut R,
        size: u32,
    ) -> Result<Vec<u8>, FastbootError> {
        self.send_command(ctx, &format!("download:{size:08x}"))?;

        let reported = loop {
            if let Some(err) = self.cancel_error(ctx) {
                return Err(err);
            }
            crossbeam_channel::select! {
                recv(self.ready_rx) -> msg => {
                    break msg.map_err(|_| FastbootError::ChannelClosed)?;
                }
                recv(self.result_rx) -> msg => {
                    msg.map_err(|_| FastbootError::ChannelClosed)?;
                    return Err(FastbootError::UnexpectedResponse);
                }
                recv(self.error_rx) -> msg => {
                    return Err(msg.unwrap_or(FastbootError::ChannelClosed));
                }
                default(POLL) => continue,
            }
        };
        if reported != size {
            return Err(FastbootError::UnexpectedDataSize {
                purpose: "allocated data buffer",
                expected: u64::from(size),
                actual: u64::from(reported),
            });
        }

        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            trace!(len = n, "H->C payload chunk");
            self.writer.write_context(ctx, &buf[..n])?;
        }

        self.await_result(ctx)
    }

    /// Like [`download`](Self::download) with the size taken from the end
    /// position of a seekable source.
    pub fn download_from_seeker<R: Read + Seek + ?Sized>(
        &self,
        ctx: &CancelToken,
        r: &mut R,
    ) -> Result<Vec<u8>, FastbootError> {
        let len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(0))?;
        let size = u32::try_from(len).map_err(|_| FastbootError::MaxLengthExceeded)?;
        self.download(ctx, r, size)
    }

    /// Writes the previously downloaded image to the named partition.
    pub fn flash(&self, ctx: &CancelToken, partition: &str) -> Result<(), FastbootError> {
        self.command(ctx, &format!("flash:{partition}")).map(drop)
    }

    /// Erases the named partition.
    pub fn erase(&self, ctx: &CancelToken, partition: &str) -> Result<(), FastbootError> {
        self.command(ctx, &format!("erase:{partition}")).map(drop)
    }

    /// Boots the previously downloaded boot image.
    pub fn boot(&self, ctx: &CancelToken) -> Result<(), FastbootError> {
        self.command(ctx, "boot").map(drop)
    }

    /// Continues the normal boot process.
    pub fn continue_boot(&self, ctx: &CancelToken) -> Result<(), FastbootError> {
        self.command(ctx, "continue").map(drop)
    }

    /// Reboots the device.
    pub fn reboot(&self, ctx: &CancelToken) -> Result<(), FastbootError> {
        self.command(ctx, "reboot").map(drop)
    }

    /// Reboots back into the bootloader, e.g. after a bootloader update.
    pub fn reboot_bootloader(&self, ctx: &CancelToken) -> Result<(), FastbootError> {
        self.command(ctx, "reboot-bootloader").map(drop)
    }

    fn send_command(&self, ctx: &CancelToken, cmd: &str) -> Result<(), FastbootError> {
        if cmd.len() > MAX_COMMAND_LEN {
            return Err(FastbootError::MaxLengthExceeded);
        }
        trace!(cmd, "H->C");
        self.writer.write_context(ctx, cmd.as_bytes())?;
        Ok(())
    }

    fn await_result(&self, ctx: &CancelToken) -> Result<Vec<u8>, FastbootError> {
        loop {
            if let Some(err) = self.cancel_error(ctx) {
                return Err(err);
            }
            crossbeam_channel::select! {
                recv(self.result_rx) -> msg => {
                    return msg.map_err(|_| FastbootError::ChannelClosed);
                }
                recv(self.error_rx) -> msg => {
                    return Err(msg.unwrap_or(FastbootError::ChannelClosed));
                }
                default(POLL) => continue,
            }
        }
    }

    fn cancel_error(&self, ctx: &CancelToken) -> Option<FastbootError> {
        match ctx.state() {
            CancelState::Active => None,
            state => Some(TransportError::from_cancel(state).into()),
        }
    }
}

impl Drop for FastbootChannel {
    fn drop(&mut self) {
        self.ctx.cancel();
        if let Some(task) = self.reader_task.take() {
            let _ = task.join();
        }
        debug!("fastboot channel closed");
    }
}

struct Pipelines {
    info: Sender<String>,
    text: Sender<String>,
    result: Sender<Vec<u8>>,
    ready: Sender<u32>,
    error: Sender<FastbootError>,
}

fn reader_loop(ctx: CancelToken, reader: Box<dyn ContextReader>, pipes: Pipelines) {
    let mut text_buf: Vec<u8> = Vec::new();
    let mut buf = [0u8; MAX_FRAME_LEN];

    loop {
        let n = match reader.read_context(&ctx, &mut buf) {
            Ok(0) => {
                debug!("fastboot reader reached end of stream");
                return;
            }
            Ok(n) => n,
            // pending commands observe the token themselves; exiting quietly
            // keeps cancellation from masquerading as a device error
            Err(TransportError::Cancelled) => return,
            Err(e) => {
                publish(&ctx, &pipes.error, e.into());
                return;
            }
        };
        trace!(len = n, "H<-C");

        match Frame::parse(&buf[..n]) {
            Ok(Frame::Okay(payload)) => {
                if !publish(&ctx, &pipes.result, payload) {
                    return;
                }
            }
            Ok(Frame::Fail(message)) => {
                // FAIL terminates the pending command, not the channel
                if !publish(&ctx, &pipes.error, FastbootError::Device { message }) {
                    return;
                }
            }
            Ok(Frame::Data(size)) => {
                if !publish(&ctx, &pipes.ready, size) {
                    return;
                }
            }
            Ok(Frame::Info(message)) => {
                if !publish(&ctx, &pipes.info, message) {
                    return;
                }
            }
            Ok(Frame::Text(payload)) => {
                let mut rest = payload.as_slice();
                while !rest.is_empty() {
                    match rest.iter().position(|&b| b == 0) {
                        Some(nul) => {
                            text_buf.extend_from_slice(&rest[..nul]);
                            let line = String::from_utf8_lossy(&text_buf).into_owned();
                            text_buf.clear();
                            if !publish(&ctx, &pipes.text, line) {
                                return;
                            }
                            rest = &rest[nul + 1..];
                        }
                        None => {
                            text_buf.extend_from_slice(rest);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                publish(&ctx, &pipes.error, e);
                return;
            }
        }
    }
}

/// Capacity-1 publish that honors backpressure without wedging shutdown.
/// Returns `false` once the channel is being torn down.
fn publish<T>(ctx: &CancelToken, tx: &Sender<T>, value: T) -> bool {
    let mut value = value;
    loop {
        match tx.try_send(value) {
            Ok(()) => return true,
            Err(TrySendError::Full(returned)) => {
                if ctx.is_done() {
                    return false;
                }
                value = returned;
                thread::sleep(POLL);
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockDevice;
    use std::io::Cursor;

    fn channel_for(device: &MockDevice) -> (CancelToken, FastbootChannel) {
        let root = CancelToken::new();
        let link = device.link();
        let channel = FastbootChannel::new(&root, link.reader, link.writer);
        (root, channel)
    }

    #[test]
    fn test_command_returns_okay_payload() {
        let device = MockDevice::new();
        device.queue_okay("0.4");

        let (root, fb) = channel_for(&device);
        let payload = fb.command(&root, "getvar:version").unwrap();
        assert_eq!(payload, b"0.4");
        assert_eq!(device.writes()[0], b"getvar:version");
    }

    #[test]
    fn test_info_drains_between_results() {
        let device = MockDevice::new();
        device.queue_okay("foo");
        device.queue_frame(b"INFObar");
        device.queue_okay("baz");

        let (root, mut fb) = channel_for(&device);
        let info_rx = fb.take_info().unwrap();

        assert_eq!(fb.command(&root, "first").unwrap(), b"foo");
        assert_eq!(
            info_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "bar"
        );
        assert_eq!(fb.command(&root, "second").unwrap(), b"baz");
    }

    #[test]
    fn test_fail_surfaces_as_device_error() {
        let device = MockDevice::new();
        device.queue_fail("unknown command");

        let (root, fb) = channel_for(&device);
        match fb.command(&root, "frobnicate") {
            Err(FastbootError::Device { message }) => assert_eq!(message, "unknown command"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_text_reassembles_across_frames() {
        let device = MockDevice::new();
        device.queue_frame(b"TEXThe");
        device.queue_frame(b"TEXTllo\0wo");
        device.queue_frame(b"TEXTrld\0");

        let (_root, mut fb) = channel_for(&device);
        let text_rx = fb.take_text().unwrap();

        assert_eq!(text_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "hello");
        assert_eq!(text_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "world");
    }

    #[test]
    fn test_download_handshake_and_stream() {
        let device = MockDevice::new();
        device.queue_data(256);
        device.queue_okay("");

        let (root, fb) = channel_for(&device);
        let payload = vec![0xa5u8; 256];
        fb.download(&root, &mut Cursor::new(&payload), 256).unwrap();

        let writes = device.writes();
        assert_eq!(writes[0], b"download:00000100");
        assert_eq!(writes[1].len(), 256);
        assert_eq!(writes[1], payload);
    }

    #[test]
    fn test_download_rejects_size_mismatch() {
        let device = MockDevice::new();
        device.queue_data(255);

        let (root, fb) = channel_for(&device);
        let payload = vec![0u8; 256];
        match fb.download(&root, &mut Cursor::new(&payload), 256) {
            Err(FastbootError::UnexpectedDataSize {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 256);
                assert_eq!(actual, 255);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // nothing but the command reached the wire
        assert_eq!(device.writes().len(), 1);
    }

    #[test]
    fn test_download_from_seeker_derives_size() {
        let device = MockDevice::new();
        device.queue_data(256);
        device.queue_okay("");

        let (root, fb) = channel_for(&device);
        let payload = vec![0x3cu8; 256];
        let mut source = Cursor::new(&payload);
        // leave the cursor mid-stream; the size must come from seeking
        source.set_position(100);
        fb.download_from_seeker(&root, &mut source).unwrap();

        let writes = device.writes();
        assert_eq!(writes[0], b"download:00000100");
        assert_eq!(writes[1], payload);
    }

    /// Read + Seek source reporting a length just past the u32 range.
    struct HugeSource;

    impl Read for HugeSource {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    impl Seek for HugeSource {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            match pos {
                SeekFrom::End(offset) => Ok((u64::from(u32::MAX) + 1).wrapping_add_signed(offset)),
                SeekFrom::Start(offset) => Ok(offset),
                SeekFrom::Current(_) => Ok(0),
            }
        }
    }

    #[test]
    fn test_download_from_seeker_rejects_oversized_source() {
        let device = MockDevice::new();

        let (root, fb) = channel_for(&device);
        assert!(matches!(
            fb.download_from_seeker(&root, &mut HugeSource),
            Err(FastbootError::MaxLengthExceeded)
        ));
        // rejected locally, nothing reached the wire
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_download_rejects_premature_okay() {
        let device = MockDevice::new();
        device.queue_okay("");

        let (root, fb) = channel_for(&device);
        let payload = vec![0u8; 16];
        assert!(matches!(
            fb.download(&root, &mut Cursor::new(&payload), 16),
            Err(FastbootError::UnexpectedResponse)
        ));
    }

    #[test]
    fn test_unknown_tag_closes_channel() {
        let device = MockDevice::new();
        device.queue_frame(b"WHAToops");

        let (root, fb) = channel_for(&device);
        assert!(matches!(
            fb.command(&root, "anything"),
            Err(FastbootError::UnexpectedResponse)
        ));
    }

    #[test]
    fn test_short_frame_is_protocol_error() {
        let device = MockDevice::new();
        device.queue_frame(b"OK");

        let (root, fb) = channel_for(&device);
        assert!(matches!(
            fb.command(&root, "anything"),
            Err(FastbootError::TooShortPayload {
                purpose: "message type",
                ..
            })
        ));
    }

    #[test]
    fn test_command_too_long() {
        let device = MockDevice::new();
        let (root, fb) = channel_for(&device);
        let cmd = "x".repeat(MAX_COMMAND_LEN + 1);
        assert!(matches!(
            fb.command(&root, &cmd),
            Err(FastbootError::MaxLengthExceeded)
        ));
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_cancellation_unblocks_pending_command() {
        let device = MockDevice::new(); // no scripted response

        let (root, fb) = channel_for(&device);
        let cancel = root.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let result = fb.command(&root, "getvar:version");
        canceller.join().unwrap();
        assert!(matches!(
            result,
            Err(FastbootError::Transport(TransportError::Cancelled))
        ));
    }

    #[test]
    fn test_deadline_converts_stall_into_timeout() {
        let device = MockDevice::new(); // device never answers

        let (root, fb) = channel_for(&device);
        let op = root.with_timeout(Duration::from_millis(50));
        assert!(matches!(
            fb.command(&op, "getvar:version"),
            Err(FastbootError::Transport(TransportError::Timeout))
        ));
    }

    #[test]
    fn test_get_var_empty_payload_is_not_an_error() {
        let device = MockDevice::new();
        device.queue_okay("");

        let (root, fb) = channel_for(&device);
        assert_eq!(fb.get_var(&root, "is-userspace").unwrap(), "");
    }
}
