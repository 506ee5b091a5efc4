//! Update orchestrator.
//!
//! Drives the full run: load and inventory the firmware image, open the
//! bootloader over USB, unlock, probe, stream every image into device RAM
//! and flash it, then reboot. Progress is reported against the total
//! uncompressed payload across all images.

use std::io::{self, Cursor, Read};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;

use crate::cancel::CancelToken;
use crate::config::{DeviceProfile, UpdateConfig};
use crate::fastboot::{FastbootChannel, FastbootError};
use crate::fdt::Fdt;
use crate::manifest::{Compression, Manifest, ManifestError};
use crate::progress::{CountingReader, Progress, ProgressSink, human_bytes};
use crate::transport::{RusbBackend, TransportError, UsbBackend, UsbLink};

/// Vendor magic that unlocks flashing on inMusic bootloaders.
const UNLOCK_COMMAND: &str = "oem:inmusic-unlock-magic-7de5fbc22b8c524e";

/// Identity variables logged after unlock. Bootloaders are allowed not to
/// implement any of them.
const PROBE_VARIABLES: &[&str] = &[
    "version",
    "version-bootloader",
    "version-baseband",
    "product",
    "serialno",
    "secure",
    "is-userspace",
];

/// Settle time after a flash before the next command.
const FLASH_SETTLE: Duration = Duration::from_secs(1);

/// Stand-in duration for a flash in dry-run mode.
const DRY_RUN_FLASH_DELAY: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("no matching devices")]
    NoMatchingDevices,

    #[error("unsupported configuration")]
    UnsupportedConfiguration,

    #[error("update cancelled")]
    Cancelled,

    #[error("download failed: {0}")]
    DownloadFailed(#[source] FastbootError),

    #[error("flash failed: {0}")]
    FlashFailed(#[source] FastbootError),

    /// The flash itself already happened when this is reported.
    #[error("reboot failed: {0}")]
    RebootFailed(#[source] FastbootError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Fastboot(FastbootError),

    #[error(transparent)]
    Transport(TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FastbootError> for UpdateError {
    fn from(e: FastbootError) -> Self {
        if e.is_cancelled() {
            UpdateError::Cancelled
        } else {
            UpdateError::Fastboot(e)
        }
    }
}

impl From<TransportError> for UpdateError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => UpdateError::Cancelled,
            other => UpdateError::Transport(other),
        }
    }
}

/// Top-level updater handle.
pub struct Updater {
    config: UpdateConfig,

    /// When set, nothing is transmitted over USB: unlock, probe, download,
    /// flash and reboot are all skipped, while the verification and
    /// decompression pipelines still run. Checked at every USB-side action.
    pub dry_run: bool,
}

impl Updater {
    /// Fails with [`UpdateError::UnsupportedConfiguration`] when the config
    /// carries no device profile.
    pub fn new(config: UpdateConfig) -> Result<Self, UpdateError> {
        if config.devices.is_empty() {
            return Err(UpdateError::UnsupportedConfiguration);
        }
        Ok(Self {
            config,
            dry_run: false,
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Runs the full state machine against real hardware. Progress events
    /// go to `progress`; the sink is closed when this returns.
    pub fn run(&self, ctx: &CancelToken, progress: Sender<Progress>) -> Result<(), UpdateError> {
        let mut backend = RusbBackend::new(self.config.libusb_debug_level)?;
        self.run_with_backend(ctx, progress, &mut backend)
    }

    /// Like [`run`](Self::run) with a caller-supplied transport; the test
    /// harness injects a mock backend here.
    pub fn run_with_backend(
        &self,
        ctx: &CancelToken,
        progress: Sender<Progress>,
        backend: &mut dyn UsbBackend,
    ) -> Result<(), UpdateError> {
        let sink = ProgressSink::new(progress);
        // the config holds a list, but a run drives exactly one profile;
        // multi-device sequencing is left to a future revision
        let profile = &self.config.devices[0];
        self.run_device(ctx, &sink, backend, profile)
    }

    fn run_device(
        &self,
        ctx: &CancelToken,
        sink: &ProgressSink,
        backend: &mut dyn UsbBackend,
        profile: &DeviceProfile,
    ) -> Result<(), UpdateError> {
        sink.push(Progress::busy("Preparing update..."));

        let blob = std::fs::read(&profile.image_path)?;
        let fdt = Fdt::parse(&blob).map_err(ManifestError::from)?;
        let manifest = Manifest::from_fdt(&fdt)?;
        info!(
            version = manifest.version,
            images = manifest.images.len(),
            total_size = manifest.total_uncompressed_size,
            "inventoried firmware image"
        );

        let mut devices_matched = 0usize;
        for id in &manifest.compatible_devices {
            if ctx.is_done() {
                return Err(UpdateError::Cancelled);
            }
            debug!(device = %id, "probing for device");
            let link = match backend.open(profile, *id) {
                Ok(link) => link,
                Err(TransportError::NotFound) => {
                    debug!(device = %id, "device not present");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            devices_matched += 1;
            info!(device = %id, name = %profile.name, "device opened");
            self.flash_device(ctx, sink, profile, &manifest, link)?;
        }

        if devices_matched == 0 {
            return Err(UpdateError::NoMatchingDevices);
        }
        Ok(())
    }

    fn flash_device(
        &self,
        ctx: &CancelToken,
        sink: &ProgressSink,
        profile: &DeviceProfile,
        manifest: &Manifest<'_>,
        link: UsbLink,
    ) -> Result<(), UpdateError> {
        let UsbLink {
            reader,
            writer,
            guard,
        } = link;
        // declared before the channel so the interface claim is released
        // only after the reader task has been joined
        let _guard = guard;
        let mut channel = FastbootChannel::new(ctx, reader, writer);

        let info_rx = channel.take_info().ok_or_else(|| {
            UpdateError::Fastboot(FastbootError::ChannelClosed)
        })?;
        let text_rx = channel.take_text().ok_or_else(|| {
            UpdateError::Fastboot(FastbootError::ChannelClosed)
        })?;
        let info_drain = thread::spawn(move || {
            for line in info_rx.iter() {
                info!(target: "fastboot::bootloader", "{line}");
            }
        });
        let text_drain = thread::spawn(move || {
            for line in text_rx.iter() {
                info!(target: "fastboot::text", "{line}");
            }
        });

        let result = self.flash_with_channel(ctx, sink, profile, manifest, &channel);

        // joins the reader task and closes all pipelines, which ends the
        // drain threads; the interface claim goes last
        drop(channel);
        let _ = info_drain.join();
        let _ = text_drain.join();
        result
    }

    fn flash_with_channel(
        &self,
        ctx: &CancelToken,
        sink: &ProgressSink,
        profile: &DeviceProfile,
        manifest: &Manifest<'_>,
        fb: &FastbootChannel,
    ) -> Result<(), UpdateError> {
        // UNLOCK
        if self.dry_run {
            info!("dry run, skipping unlock");
        } else {
            info!("unlocking device for flashing");
            fb.command(&op_token(ctx, profile), UNLOCK_COMMAND)?;
        }

        // PROBE
        if !self.dry_run {
            let mut fields = Vec::new();
            for &name in PROBE_VARIABLES {
                match fb.get_var(&op_token(ctx, profile), name) {
                    Ok(value) => fields.push(format!("{name}={value:?}")),
                    Err(e) if e.is_cancelled() => return Err(UpdateError::Cancelled),
                    Err(_) => warn!(var = name, "bootloader does not support variable"),
                }
            }
            info!(variables = %fields.join(" "), "read bootloader variables");
        }

        // DOWNLOAD + FLASH, one image at a time, manifest order
        let total = manifest.total_uncompressed_size;
        let mut total_sent: u64 = 0;
        let status = format!("Updating to version {}...", manifest.version);
        for image in &manifest.images {
            if ctx.is_done() {
                return Err(UpdateError::Cancelled);
            }
            info!(
                image = image.name,
                partition = image.partition,
                compressed_size = image.raw.len(),
                size = image.uncompressed_size,
                compression = ?image.compression,
                "now writing image"
            );

            let raw = Cursor::new(image.raw);
            let decoded: Box<dyn Read + '_> = match image.compression {
                Compression::None => Box::new(raw),
                Compression::Xz => Box::new(XzDecoder::new(raw)),
            };
            let image_size_text = human_bytes(image.uncompressed_size);
            let mut image_sent: u64 = 0;
            let mut stream = CountingReader::new(decoded, |n| {
                image_sent += n;
                total_sent += n;
                let ratio = if total > 0 {
                    total_sent as f64 / total as f64
                } else {
                    1.0
                };
                sink.tick(Progress::at(
                    format!(
                        "{status}\n({}, transferred {}/{})",
                        image.name,
                        human_bytes(image_sent),
                        image_size_text
                    ),
                    ratio,
                ));
            });

            let size = u32::try_from(image.uncompressed_size)
                .map_err(|_| UpdateError::Fastboot(FastbootError::MaxLengthExceeded))?;
            info!(image = image.name, dry_run = self.dry_run, "download started");
            if self.dry_run {
                io::copy(&mut stream, &mut io::sink())?;
            } else {
                // the per-transfer timeout bounds each read and write, the
                // stream as a whole is unbounded
                fb.download(ctx, &mut stream, size).map_err(|e| {
                    if e.is_cancelled() {
                        UpdateError::Cancelled
                    } else {
                        UpdateError::DownloadFailed(e)
                    }
                })?;
            }
            drop(stream);
            info!("download ok");

            sink.push(Progress::at(
                format!("{status}\n({}, flashing)", image.name),
                if total > 0 {
                    total_sent as f64 / total as f64
                } else {
                    1.0
                },
            ));
            info!(
                image = image.name,
                partition = image.partition,
                dry_run = self.dry_run,
                "flash started"
            );
            if self.dry_run {
                if !ctx.sleep(DRY_RUN_FLASH_DELAY) {
                    return Err(UpdateError::Cancelled);
                }
            } else {
                fb.flash(&op_token(ctx, profile), image.partition)
                    .map_err(|e| {
                        if e.is_cancelled() {
                            UpdateError::Cancelled
                        } else {
                            UpdateError::FlashFailed(e)
                        }
                    })?;
            }
            info!("flash ok");

            if !ctx.sleep(FLASH_SETTLE) {
                return Err(UpdateError::Cancelled);
            }
        }

        sink.push(Progress::busy("Finishing update..."));
        if !self.config.skip_reboot_after_flash && !self.dry_run {
            info!("requesting reboot");
            fb.reboot(&op_token(ctx, profile)).map_err(|e| {
                if e.is_cancelled() {
                    UpdateError::Cancelled
                } else {
                    UpdateError::RebootFailed(e)
                }
            })?;
            info!("reboot ok");
        }
        ctx.sleep(FLASH_SETTLE);
        Ok(())
    }
}

/// Per-operation context, bounded by the profile timeout when configured.
fn op_token(ctx: &CancelToken, profile: &DeviceProfile) -> CancelToken {
    match profile.usb_op_timeout() {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx.child(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::TestNode;
    use crate::manifest::{DEVICES_PROPERTY, DeviceId, VERSION_PROPERTY};
    use crate::transport::{MockDevice, MockTransport};
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;

    const XZ_DATA: &[u8] = include_bytes!("../assets/test/lorem_ipsum.txt.xz");
    const PLAIN_DATA: &[u8] = include_bytes!("../assets/test/lorem_ipsum.txt");

    const PRIME_ID: DeviceId = DeviceId {
        vendor_id: 0x191c,
        product_id: 0x0002,
    };
    const OTHER_ID: DeviceId = DeviceId {
        vendor_id: 0x191c,
        product_id: 0x0003,
    };

    fn sha1_of(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    fn device_list() -> Vec<u8> {
        let mut bytes = Vec::new();
        for id in [PRIME_ID, OTHER_ID] {
            bytes.extend_from_slice(&id.vendor_id.to_be_bytes());
            bytes.extend_from_slice(&id.product_id.to_be_bytes());
        }
        bytes
    }

    fn xz_image_blob() -> Vec<u8> {
        TestNode::root()
            .str_prop(VERSION_PROPERTY, "1.2.3")
            .prop(DEVICES_PROPERTY, &device_list())
            .child(
                TestNode::named("images").child(
                    TestNode::named("firmware")
                        .str_prop("partition", "firmware")
                        .prop("data", XZ_DATA)
                        .str_prop("compression", "xz")
                        .child(
                            TestNode::named("hash")
                                .str_prop("algo", "sha1")
                                .prop("value", &sha1_of(XZ_DATA)),
                        ),
                ),
            )
            .build()
    }

    fn plain_image_blob(data: &[u8]) -> Vec<u8> {
        TestNode::root()
            .str_prop(VERSION_PROPERTY, "1.2.3")
            .prop(DEVICES_PROPERTY, &device_list())
            .child(
                TestNode::named("images").child(
                    TestNode::named("firmware")
                        .str_prop("partition", "firmware")
                        .prop("data", data)
                        .child(
                            TestNode::named("hash")
                                .str_prop("algo", "sha1")
                                .prop("value", &sha1_of(data)),
                        ),
                ),
            )
            .build()
    }

    fn write_image(blob: &[u8]) -> (tempfile_like::TempPath, PathBuf) {
        tempfile_like::write(blob)
    }

    /// Minimal scoped temp file helper for image blobs.
    mod tempfile_like {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU32, Ordering};

        static COUNTER: AtomicU32 = AtomicU32::new(0);

        pub struct TempPath(pub PathBuf);

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }

        pub fn write(data: &[u8]) -> (TempPath, PathBuf) {
            let path = std::env::temp_dir().join(format!(
                "prime-core-test-{}-{}.img",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::SeqCst)
            ));
            std::fs::write(&path, data).unwrap();
            (TempPath(path.clone()), path)
        }
    }

    fn updater_for(path: PathBuf, skip_reboot: bool) -> Updater {
        let config = UpdateConfig {
            devices: vec![DeviceProfile {
                name: "Test Device".into(),
                image_path: path,
                usb_op_timeout_ms: 5_000,
                ..Default::default()
            }],
            libusb_debug_level: 0,
            skip_reboot_after_flash: skip_reboot,
        };
        Updater::new(config).unwrap()
    }

    /// Scripts the full happy-path conversation for one image.
    fn script_happy_path(device: &MockDevice, download_size: u32, with_reboot: bool) {
        device.queue_okay(""); // unlock
        for _ in PROBE_VARIABLES {
            device.queue_okay("value");
        }
        device.queue_data(download_size);
        device.queue_okay(""); // download complete
        device.queue_okay(""); // flash
        if with_reboot {
            device.queue_okay(""); // reboot
        }
    }

    fn commands_of(writes: &[Vec<u8>]) -> Vec<String> {
        writes
            .iter()
            .filter(|w| w.len() <= 64)
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    #[test]
    fn test_happy_path_one_xz_image() {
        let (_keep, path) = write_image(&xz_image_blob());
        let updater = updater_for(path, false);

        let device = MockDevice::new();
        script_happy_path(&device, PLAIN_DATA.len() as u32, true);
        let mut transport = MockTransport::new();
        transport.add_device(PRIME_ID, device.clone());

        let root = CancelToken::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        updater.run_with_backend(&root, tx, &mut transport).unwrap();

        // progress: monotone, ends at 1.0
        let ticks: Vec<Progress> = rx.iter().collect();
        assert!(ticks[0].indeterminate);
        let determinate: Vec<&Progress> = ticks.iter().filter(|p| !p.indeterminate).collect();
        assert!(!determinate.is_empty());
        for pair in determinate.windows(2) {
            assert!(pair[1].percentage >= pair[0].percentage);
        }
        assert!(determinate.last().unwrap().percentage >= 0.999);

        // wire: unlock, probes, download, payload, flash, reboot
        let writes = device.writes();
        assert_eq!(writes[0], UNLOCK_COMMAND.as_bytes());
        assert!(writes.iter().any(|w| w == b"getvar:serialno"));
        let expected_download = format!("download:{:08x}", PLAIN_DATA.len());
        let download_at = writes
            .iter()
            .position(|w| w == expected_download.as_bytes())
            .expect("download command on the wire");
        let flash_at = writes
            .iter()
            .position(|w| w == b"flash:firmware")
            .expect("flash command on the wire");
        assert!(download_at < flash_at);
        assert_eq!(writes.last().unwrap().as_slice(), b"reboot");

        // everything between download and flash is the decompressed payload
        let payload: Vec<u8> = writes[download_at + 1..flash_at].concat();
        assert_eq!(payload, PLAIN_DATA);

        // both candidate ids were probed
        assert_eq!(transport.open_attempts(), &[PRIME_ID, OTHER_ID]);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let (_keep, path) = write_image(&xz_image_blob());
        let mut updater = updater_for(path, false);
        updater.dry_run = true;

        let device = MockDevice::new(); // no script needed
        let mut transport = MockTransport::new();
        transport.add_device(PRIME_ID, device.clone());

        let root = CancelToken::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        updater.run_with_backend(&root, tx, &mut transport).unwrap();

        assert_eq!(device.written_bytes(), 0);
        let determinate: Vec<Progress> = rx.iter().filter(|p| !p.indeterminate).collect();
        assert!(determinate.last().unwrap().percentage >= 0.999);
    }

    #[test]
    fn test_missing_hash_fails_before_usb() {
        let blob = TestNode::root()
            .str_prop(VERSION_PROPERTY, "1.2.3")
            .prop(DEVICES_PROPERTY, &device_list())
            .child(
                TestNode::named("images").child(
                    TestNode::named("firmware")
                        .str_prop("partition", "firmware")
                        .prop("data", b"payload"),
                ),
            )
            .build();
        let (_keep, path) = write_image(&blob);
        let updater = updater_for(path, false);

        let device = MockDevice::new();
        let mut transport = MockTransport::new();
        transport.add_device(PRIME_ID, device.clone());

        let root = CancelToken::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = updater
            .run_with_backend(&root, tx, &mut transport)
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Manifest(ManifestError::MissingImageHash)
        ));
        assert!(transport.open_attempts().is_empty());
        assert_eq!(device.written_bytes(), 0);
    }

    #[test]
    fn test_corrupt_image_never_reaches_device() {
        // data flipped after the digest was taken
        let mut data = PLAIN_DATA.to_vec();
        data[0] ^= 1;
        let corrupt_blob = TestNode::root()
            .str_prop(VERSION_PROPERTY, "1.2.3")
            .prop(DEVICES_PROPERTY, &device_list())
            .child(
                TestNode::named("images").child(
                    TestNode::named("firmware")
                        .str_prop("partition", "firmware")
                        .prop("data", &data)
                        .child(
                            TestNode::named("hash")
                                .str_prop("algo", "sha1")
                                .prop("value", &sha1_of(PLAIN_DATA)),
                        ),
                ),
            )
            .build();
        let (_keep, path) = write_image(&corrupt_blob);
        let updater = updater_for(path, false);

        let device = MockDevice::new();
        let mut transport = MockTransport::new();
        transport.add_device(PRIME_ID, device.clone());

        let root = CancelToken::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = updater
            .run_with_backend(&root, tx, &mut transport)
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Manifest(ManifestError::ChecksumMismatch)
        ));
        assert_eq!(device.written_bytes(), 0);
    }

    #[test]
    fn test_wrong_data_size_from_device() {
        let (_keep, path) = write_image(&xz_image_blob());
        let updater = updater_for(path, false);

        let device = MockDevice::new();
        device.queue_okay(""); // unlock
        for _ in PROBE_VARIABLES {
            device.queue_okay("value");
        }
        device.queue_data(0x1000); // device allocates the wrong size
        let mut transport = MockTransport::new();
        transport.add_device(PRIME_ID, device.clone());

        let root = CancelToken::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = updater
            .run_with_backend(&root, tx, &mut transport)
            .unwrap_err();
        match err {
            UpdateError::DownloadFailed(FastbootError::UnexpectedDataSize {
                expected,
                actual,
                ..
            }) => {
                assert_eq!(expected, PLAIN_DATA.len() as u64);
                assert_eq!(actual, 0x1000);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // the command went out, the payload never did
        let writes = device.writes();
        let expected_download = format!("download:{:08x}", PLAIN_DATA.len());
        assert_eq!(writes.last().unwrap().as_slice(), expected_download.as_bytes());
    }

    #[test]
    fn test_skip_reboot() {
        let (_keep, path) = write_image(&xz_image_blob());
        let updater = updater_for(path, true);

        let device = MockDevice::new();
        script_happy_path(&device, PLAIN_DATA.len() as u32, false);
        let mut transport = MockTransport::new();
        transport.add_device(PRIME_ID, device.clone());

        let root = CancelToken::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        updater.run_with_backend(&root, tx, &mut transport).unwrap();

        let commands = commands_of(&device.writes());
        assert!(commands.iter().all(|c| c != "reboot"));
        assert!(commands.iter().any(|c| c == "flash:firmware"));
    }

    #[test]
    fn test_no_device_present() {
        let (_keep, path) = write_image(&xz_image_blob());
        let updater = updater_for(path, false);

        let mut transport = MockTransport::new(); // nothing registered

        let root = CancelToken::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = updater
            .run_with_backend(&root, tx, &mut transport)
            .unwrap_err();
        assert!(matches!(err, UpdateError::NoMatchingDevices));
        // every candidate id was tried
        assert_eq!(transport.open_attempts(), &[PRIME_ID, OTHER_ID]);
    }

    #[test]
    fn test_cancellation_mid_download() {
        // large uncompressed image so the download spans several chunks
        let data = vec![0x5au8; 512 * 1024];
        let blob = plain_image_blob(&data);
        let (_keep, path) = write_image(&blob);
        let updater = updater_for(path, false);

        let device = MockDevice::new();
        device.queue_okay(""); // unlock
        for _ in PROBE_VARIABLES {
            device.queue_okay("value");
        }
        device.queue_data(data.len() as u32);
        // stall once roughly one payload chunk is out
        device.stall_writes_after(200 * 1024);
        let mut transport = MockTransport::new();
        transport.add_device(PRIME_ID, device.clone());

        let root = CancelToken::new();
        let cancel = root.clone();
        let watcher_device = device.clone();
        let watcher = thread::spawn(move || {
            // wait until the download is visibly in flight, then cancel
            while watcher_device.written_bytes() < 128 * 1024 {
                thread::sleep(Duration::from_millis(5));
            }
            cancel.cancel();
        });

        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = updater
            .run_with_backend(&root, tx, &mut transport)
            .unwrap_err();
        watcher.join().unwrap();
        assert!(matches!(err, UpdateError::Cancelled));
    }

    #[test]
    fn test_empty_device_list_is_unsupported() {
        let config = UpdateConfig::default();
        assert!(matches!(
            Updater::new(config),
            Err(UpdateError::UnsupportedConfiguration)
        ));
    }

    #[test]
    fn test_device_fail_on_unlock_aborts_run() {
        let (_keep, path) = write_image(&xz_image_blob());
        let updater = updater_for(path, false);

        let device = MockDevice::new();
        device.queue_fail("locked");
        let mut transport = MockTransport::new();
        transport.add_device(PRIME_ID, device.clone());

        let root = CancelToken::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = updater
            .run_with_backend(&root, tx, &mut transport)
            .unwrap_err();
        match err {
            UpdateError::Fastboot(FastbootError::Device { message }) => {
                assert_eq!(message, "locked")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // no image data was sent
        let commands = commands_of(&device.writes());
        assert!(commands.iter().all(|c| !c.starts_with("download:")));
    }
}
