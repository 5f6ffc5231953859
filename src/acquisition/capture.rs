//! Raw capture files.
//!
//! A capture is the sequence of raw buffers exactly as the board delivered
//! them, so that a session can be replayed through the same reconstruction
//! path later.
//!
//! # Layout
//!
//! All integers little-endian.
//!
//! ```text
//! offset 0   magic            8 bytes  "OCTRAW01"
//! offset 8   record_len       u32      interferogram samples per line
//! offset 12  encoder_len      u32      encoder samples per line
//! offset 16  lines_per_buffer u32
//! offset 20  reserved         u32      zero
//! offset 24  buffers...
//! ```
//!
//! Each buffer is a `u64` sequence number, then `lines * record_len`
//! interferogram samples, then `lines * encoder_len` encoder samples, all
//! `u16`. A trailing partial buffer (interrupted recording) is ignored.

use memmap2::Mmap;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Acquired, AcquisitionParams, DataSource};
use crate::data::RawBuffer;
use crate::error::{AppResult, OctError};
use oct_pool::OverflowPolicy;

/// File signature.
pub const MAGIC: &[u8; 8] = b"OCTRAW01";
/// Bytes before the first buffer.
pub const HEADER_SIZE: usize = 24;

/// Buffer shape stored at the start of a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureHeader {
    /// Samples per record.
    pub record_len: u32,
    /// Encoder samples per record.
    pub encoder_len: u32,
    /// Records per buffer.
    pub lines_per_buffer: u32,
}

impl CaptureHeader {
    /// Header describing buffers of `params`' shape.
    #[must_use]
    pub fn from_params(params: &AcquisitionParams) -> Self {
        Self {
            record_len: params.record_length as u32,
            encoder_len: params.encoder_record_length as u32,
            lines_per_buffer: params.lines_per_buffer as u32,
        }
    }

    /// Bytes one stored buffer occupies.
    #[must_use]
    pub fn buffer_bytes(&self) -> usize {
        let lines = self.lines_per_buffer as usize;
        8 + 2 * lines * (self.record_len as usize + self.encoder_len as usize)
    }

    fn matches(&self, raw: &RawBuffer) -> bool {
        raw.record_len() == self.record_len as usize
            && raw.encoder_len() == self.encoder_len as usize
            && raw.lines() == self.lines_per_buffer as usize
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(MAGIC);
        out[8..12].copy_from_slice(&self.record_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.encoder_len.to_le_bytes());
        out[16..20].copy_from_slice(&self.lines_per_buffer.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> AppResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(OctError::Playback(format!(
                "capture too short for header: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[..8] != MAGIC {
            return Err(OctError::Playback(format!(
                "bad capture magic {:?}",
                String::from_utf8_lossy(&bytes[..8])
            )));
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let header = Self {
            record_len: word(8),
            encoder_len: word(12),
            lines_per_buffer: word(16),
        };
        if header.record_len == 0 || header.lines_per_buffer == 0 {
            return Err(OctError::Playback(format!(
                "capture header has empty buffers: {header:?}"
            )));
        }
        Ok(header)
    }
}

/// Appends raw buffers to a capture file.
pub struct CaptureWriter {
    writer: BufWriter<File>,
    header: CaptureHeader,
    path: PathBuf,
    scratch: Vec<u8>,
    buffers: u64,
}

impl CaptureWriter {
    /// Create `path` (and its parent directory) and write the header.
    pub fn create(path: &Path, header: CaptureHeader) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&header.encode())?;
        info!(path = %path.display(), ?header, "Recording raw capture");
        Ok(Self {
            writer,
            header,
            path: path.to_path_buf(),
            scratch: Vec::with_capacity(header.buffer_bytes()),
            buffers: 0,
        })
    }

    /// Append one buffer. Every line is stored, filled or not.
    pub fn write_buffer(&mut self, raw: &RawBuffer) -> AppResult<()> {
        if !self.header.matches(raw) {
            return Err(OctError::Playback(format!(
                "buffer shape {}x{}+{} does not match capture {:?}",
                raw.lines(),
                raw.record_len(),
                raw.encoder_len(),
                self.header
            )));
        }
        let (samples, encoder) = raw.planes();
        self.scratch.clear();
        self.scratch.extend_from_slice(&raw.sequence.to_le_bytes());
        for sample in samples.iter().chain(encoder) {
            self.scratch.extend_from_slice(&sample.to_le_bytes());
        }
        self.writer.write_all(&self.scratch)?;
        self.buffers += 1;
        Ok(())
    }

    /// Buffers written so far.
    #[must_use]
    pub fn buffers_written(&self) -> u64 {
        self.buffers
    }

    /// Capture file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close. Returns the number of buffers written.
    pub fn finish(mut self) -> AppResult<u64> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), buffers = self.buffers, "Capture closed");
        Ok(self.buffers)
    }
}

/// Read-only, memory-mapped view of a capture file.
pub struct CaptureReader {
    mmap: Mmap,
    header: CaptureHeader,
    buffers: usize,
    path: PathBuf,
}

impl std::fmt::Debug for CaptureReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureReader")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("buffers", &self.buffers)
            .finish()
    }
}

impl CaptureReader {
    /// Map `path` and validate its header and length.
    pub fn open(path: &Path) -> AppResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(OctError::Playback(format!(
                "{} is not a capture file ({len} bytes)",
                path.display()
            )));
        }

        // SAFETY: the mapping is read-only and captures are never modified
        // while a session replays them.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };

        let header = CaptureHeader::decode(&mmap)?;
        let body = mmap.len() - HEADER_SIZE;
        let buffers = body / header.buffer_bytes();
        let trailing = body % header.buffer_bytes();
        if trailing != 0 {
            warn!(
                path = %path.display(),
                trailing,
                "Capture ends with a partial buffer; ignoring it"
            );
        }
        debug!(path = %path.display(), ?header, buffers, "Opened capture");

        Ok(Self {
            mmap,
            header,
            buffers,
            path: path.to_path_buf(),
        })
    }

    /// Capture header.
    #[must_use]
    pub fn header(&self) -> CaptureHeader {
        self.header
    }

    /// Number of complete buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers
    }

    /// True when the capture holds no buffers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers == 0
    }

    /// Capture file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode buffer `index` into `raw`, marking every line valid.
    pub fn read_into(&self, index: usize, raw: &mut RawBuffer) -> AppResult<()> {
        if index >= self.buffers {
            return Err(OctError::Playback(format!(
                "buffer {index} out of range (capture holds {})",
                self.buffers
            )));
        }
        if !self.header.matches(raw) {
            return Err(OctError::Playback(format!(
                "pool buffer {}x{}+{} does not match capture {:?}",
                raw.lines(),
                raw.record_len(),
                raw.encoder_len(),
                self.header
            )));
        }

        let start = HEADER_SIZE + index * self.header.buffer_bytes();
        let bytes = &self.mmap[start..start + self.header.buffer_bytes()];
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[..8]);

        let (samples, encoder) = raw.planes_mut();
        let (sample_bytes, encoder_bytes) = bytes[8..].split_at(samples.len() * 2);
        for (dst, src) in samples.iter_mut().zip(sample_bytes.chunks_exact(2)) {
            *dst = u16::from_le_bytes([src[0], src[1]]);
        }
        for (dst, src) in encoder.iter_mut().zip(encoder_bytes.chunks_exact(2)) {
            *dst = u16::from_le_bytes([src[0], src[1]]);
        }
        raw.sequence = u64::from_le_bytes(sequence);
        raw.valid_lines = raw.lines();
        Ok(())
    }
}

/// Wraps a source and writes every filled buffer to a capture.
pub struct RecordingSource {
    inner: Box<dyn DataSource>,
    path: PathBuf,
    writer: Option<CaptureWriter>,
}

impl RecordingSource {
    /// Wrap `inner`; the capture file is created on the first `configure`.
    #[must_use]
    pub fn new(inner: Box<dyn DataSource>, path: &Path) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            writer: None,
        }
    }

    /// Buffers written to the capture so far.
    #[must_use]
    pub fn buffers_written(&self) -> u64 {
        self.writer.as_ref().map_or(0, CaptureWriter::buffers_written)
    }
}

impl DataSource for RecordingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn configure(&mut self, params: &AcquisitionParams) -> AppResult<()> {
        self.inner.configure(params)?;
        let header = CaptureHeader::from_params(params);
        match &mut self.writer {
            // Restarts with the same shape keep appending.
            Some(writer) if writer.header == header => writer.writer.flush()?,
            _ => self.writer = Some(CaptureWriter::create(&self.path, header)?),
        }
        Ok(())
    }

    fn acquire_next(&mut self, buffer: &mut RawBuffer, timeout: Duration) -> AppResult<Acquired> {
        let acquired = self.inner.acquire_next(buffer, timeout)?;
        if acquired == Acquired::Filled {
            let writer = self.writer.as_mut().ok_or_else(|| {
                OctError::Playback("recording source used before configure".into())
            })?;
            writer.write_buffer(buffer)?;
        }
        Ok(acquired)
    }

    fn policy(&self) -> OverflowPolicy {
        self.inner.policy()
    }

    fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    fn shutdown(&mut self) -> AppResult<()> {
        if let Some(writer) = self.writer.take() {
            let buffers = writer.finish()?;
            info!(path = %self.path.display(), buffers, "Raw capture complete");
        }
        self.inner.shutdown()
    }
}
