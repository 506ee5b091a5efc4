//! Firmware manifest extraction and verification.
//!
//! The vendor image is an FDT whose root carries the version string and the
//! compatible-device list, with one subnode per flashable image under
//! `/images`. Walking the tree yields a [`Manifest`]; every image hash is
//! verified here, before any USB activity, so a corrupt image never reaches
//! a device.

use std::fmt;
use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{error, info};

use crate::fdt::{Fdt, FdtError, Node};
use crate::xz::{self, XzError};

/// Root property holding the firmware version string.
pub const VERSION_PROPERTY: &str = "inmusic,version";

/// Root property holding the compatible `(vid, pid)` pairs.
pub const DEVICES_PROPERTY: &str = "inmusic,devices";

const IMAGES_NODE: &str = "images";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("no images in device tree")]
    NoImagesInDeviceTree,

    #[error("missing version")]
    MissingVersion,

    #[error("bad version")]
    BadVersion,

    #[error("missing compatible device list")]
    MissingDeviceList,

    #[error("missing partition")]
    MissingPartition,

    #[error("missing image data")]
    MissingData,

    #[error("missing image hash")]
    MissingImageHash,

    #[error("checksum algorithm not supported yet: {0}")]
    UnsupportedHashAlgorithm(String),

    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid length")]
    InvalidLength,

    #[error(transparent)]
    Fdt(#[from] FdtError),

    #[error(transparent)]
    Xz(#[from] XzError),
}

/// USB vendor/product pair a firmware image declares itself compatible with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Decodes the `inmusic,devices` property: big-endian u16 pairs, so the
/// byte length must be a multiple of 4.
pub fn parse_device_list(bytes: &[u8]) -> Result<Vec<DeviceId>, ManifestError> {
    if bytes.len() % 4 != 0 {
        return Err(ManifestError::InvalidLength);
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| DeviceId {
            vendor_id: BigEndian::read_u16(&chunk[0..2]),
            product_id: BigEndian::read_u16(&chunk[2..4]),
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha1,
}

/// One flashable payload.
pub struct ImageEntry<'a> {
    /// FDT subnode name.
    pub name: &'a str,
    /// Target partition.
    pub partition: &'a str,
    pub compression: Compression,
    /// On-wire payload exactly as stored in the blob.
    pub raw: &'a [u8],
    /// Size after decompression; equals `raw.len()` for uncompressed images.
    pub uncompressed_size: u64,
    pub hash_algo: HashAlgo,
    /// Expected digest over `raw` (the stored, still-compressed bytes).
    pub expected_digest: &'a [u8],
}

/// Everything the orchestrator needs from one firmware image.
pub struct Manifest<'a> {
    pub version: &'a str,
    pub compatible_devices: Vec<DeviceId>,
    pub images: Vec<ImageEntry<'a>>,
    /// Sum of `uncompressed_size` over all images; progress denominator.
    pub total_uncompressed_size: u64,
}

impl<'a> Manifest<'a> {
    /// Walks the tree, decodes every image entry and verifies its hash.
    pub fn from_fdt(fdt: &'a Fdt<'a>) -> Result<Self, ManifestError> {
        let root = fdt.root();

        let version = root
            .property(VERSION_PROPERTY)
            .ok_or(ManifestError::MissingVersion)?
            .as_str()
            .map_err(|_| ManifestError::BadVersion)?;
        if version.is_empty() {
            return Err(ManifestError::BadVersion);
        }

        let devices = root
            .property(DEVICES_PROPERTY)
            .ok_or(ManifestError::MissingDeviceList)?;
        let compatible_devices = parse_device_list(devices.as_bytes())?;

        let images_node = root
            .walk(IMAGES_NODE)
            .ok_or(ManifestError::NoImagesInDeviceTree)?;

        let mut images = Vec::new();
        let mut total: u64 = 0;
        for child in images_node.children() {
            let entry = parse_image(child)?;
            verify_hash(&entry)?;
            total = total
                .checked_add(entry.uncompressed_size)
                .ok_or(ManifestError::InvalidLength)?;
            images.push(entry);
        }

        Ok(Manifest {
            version,
            compatible_devices,
            images,
            total_uncompressed_size: total,
        })
    }
}

fn parse_image(node: Node<'_>) -> Result<ImageEntry<'_>, ManifestError> {
    let partition = node
        .property("partition")
        .ok_or(ManifestError::MissingPartition)?
        .as_str()?;
    let raw = node
        .property("data")
        .ok_or(ManifestError::MissingData)?
        .as_bytes();

    let compression = match node.property("compression") {
        None => Compression::None,
        Some(prop) => match prop.as_str()? {
            "xz" => Compression::Xz,
            other => return Err(ManifestError::UnsupportedCompression(other.to_string())),
        },
    };

    let uncompressed_size = match compression {
        Compression::None => raw.len() as u64,
        Compression::Xz => {
            let size = xz::uncompressed_size(&mut Cursor::new(raw))?;
            u64::try_from(size).map_err(|_| ManifestError::InvalidLength)?
        }
    };

    let hash = node.walk("hash").ok_or(ManifestError::MissingImageHash)?;
    let algo = hash
        .property("algo")
        .ok_or(ManifestError::MissingImageHash)?
        .as_str()?;
    let hash_algo = match algo {
        "sha1" => HashAlgo::Sha1,
        other => return Err(ManifestError::UnsupportedHashAlgorithm(other.to_string())),
    };
    let expected_digest = hash
        .property("value")
        .ok_or(ManifestError::MissingImageHash)?
        .as_bytes();

    Ok(ImageEntry {
        name: node.name(),
        partition,
        compression,
        raw,
        uncompressed_size,
        hash_algo,
        expected_digest,
    })
}

/// Digest over the stored bytes (not the decompressed stream).
fn verify_hash(entry: &ImageEntry<'_>) -> Result<(), ManifestError> {
    info!(
        image = entry.name,
        algo = "sha1",
        wanted = %hex::encode(entry.expected_digest),
        "verifying image checksum"
    );
    let digest = match entry.hash_algo {
        HashAlgo::Sha1 => {
            let mut hasher = Sha1::new();
            hasher.update(entry.raw);
            hasher.finalize()
        }
    };
    if digest.as_slice() != entry.expected_digest {
        error!(
            image = entry.name,
            wanted = %hex::encode(entry.expected_digest),
            actual = %hex::encode(digest.as_slice()),
            "checksum mismatch"
        );
        return Err(ManifestError::ChecksumMismatch);
    }
    info!(image = entry.name, "image checksum ok");
    Ok(())
}
