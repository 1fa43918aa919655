//! Capture device abstraction and frame sources.
//!
//! A device is opened once per duty cycle and yields an owned handle; the
//! handle is the only way to read frames and releases the device when it
//! is dropped, which guarantees release on every exit path of a cycle.
//!
//! Sources are selected by URL scheme:
//! - `stub://<name>`: synthetic frames (testing, demo deployments)
//! - `file://<path>`: re-reads an image file each cycle

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

/// A single captured frame. The bytes are whatever the device produces;
/// the producer attaches the media type when it builds the envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
}

/// An open capture session. Dropping the handle releases the device.
pub trait CaptureHandle: Send {
    /// Read the next frame. `Ok(None)` means no frame was available right
    /// now; the caller decides how long to keep trying.
    fn read_frame(&mut self) -> Result<Option<Frame>>;
}

pub type BoxedHandle = Box<dyn CaptureHandle>;

/// A capture device that can be opened repeatedly, once per cycle.
pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<BoxedHandle>;

    fn source_id(&self) -> &str;
}

/// Processing applied to the single frame selected in a capture window,
/// never to the whole window.
pub trait FrameProcessor: Send {
    fn process(&mut self, frame: Frame) -> Result<Frame>;
}

/// Default processor: publish the frame as captured.
pub struct Passthrough;

impl FrameProcessor for Passthrough {
    fn process(&mut self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }
}

/// Select a capture device from a source URL.
pub fn open_capture_device(source_id: &str) -> Result<Box<dyn CaptureDevice>> {
    if let Some(name) = source_id.strip_prefix("stub://") {
        return Ok(Box::new(SyntheticDevice::new(source_id, name)));
    }
    if let Some(path) = source_id.strip_prefix("file://") {
        return Ok(Box::new(FileDevice::new(source_id, path)));
    }
    Err(anyhow!(
        "unsupported capture source '{}' (expected stub:// or file://)",
        source_id
    ))
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

const SYNTHETIC_FRAME_BYTES: usize = 4096;

/// Deterministic frame generator. Always opens, always has a frame.
pub struct SyntheticDevice {
    source_id: String,
    name: String,
    frame_count: u64,
}

impl SyntheticDevice {
    pub fn new(source_id: &str, name: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            name: name.to_string(),
            frame_count: 0,
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn open(&mut self) -> Result<BoxedHandle> {
        log::debug!("opened synthetic source {}", self.name);
        let seed = self.frame_count;
        self.frame_count += 1;
        Ok(Box::new(SyntheticHandle { seed, reads: 0 }))
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}

struct SyntheticHandle {
    seed: u64,
    reads: u64,
}

impl CaptureHandle for SyntheticHandle {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.reads += 1;
        let mut bytes = vec![0u8; SYNTHETIC_FRAME_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = ((i as u64 + self.seed + self.reads) % 256) as u8;
        }
        Ok(Some(Frame { bytes }))
    }
}

// ----------------------------------------------------------------------------
// File source (file://)
// ----------------------------------------------------------------------------

/// Reads an image file from disk each cycle. Opening fails when the file
/// is missing, which exercises the producer's backoff path until the file
/// appears.
pub struct FileDevice {
    source_id: String,
    path: PathBuf,
}

impl FileDevice {
    pub fn new(source_id: &str, path: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            path: PathBuf::from(path),
        }
    }
}

impl CaptureDevice for FileDevice {
    fn open(&mut self) -> Result<BoxedHandle> {
        if !self.path.is_file() {
            return Err(anyhow!("capture file {} not found", self.path.display()));
        }
        Ok(Box::new(FileHandle {
            path: self.path.clone(),
        }))
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}

struct FileHandle {
    path: PathBuf,
}

impl CaptureHandle for FileHandle {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("read capture file {}", self.path.display()))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(Frame { bytes }))
    }
}
