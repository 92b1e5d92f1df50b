//! Segment files: the primary log on disk.
//!
//! A data directory holds `log/NNNN.dat` files. Each record is framed as a
//! `u32` little-endian length followed by the record bytes (canonical event
//! encoding plus the 32-byte tag trailer). Appends go to the highest-numbered
//! segment; a segment rolls once it passes the size threshold.
//!
//! Scanning tolerates a torn tail: a final record whose frame is incomplete
//! marks the valid prefix and is truncated by recovery.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::encoding::TAG_LEN;
use crate::error::StoreError;

/// Roll to a new segment after this many bytes.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;

/// File name for a segment id: `0001.dat`, `0002.dat`, …
#[must_use]
pub fn segment_file_name(segment_id: u32) -> String {
    format!("{segment_id:04}.dat")
}

/// List segment files under `log_dir`, sorted by id.
pub fn list_segments(log_dir: &Path) -> Result<Vec<(u32, PathBuf)>, StoreError> {
    let mut segments = Vec::new();
    if !log_dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".dat") else {
            continue;
        };
        if let Ok(id) = stem.parse::<u32>() {
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// A raw record read back from a segment.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Byte offset of the frame start within its segment.
    pub offset: u64,
    /// Canonical event bytes (tag excluded).
    pub canonical: Vec<u8>,
    /// Stored integrity tag.
    pub tag: [u8; TAG_LEN],
}

/// Result of scanning one segment.
#[derive(Debug)]
pub struct SegmentScan {
    pub records: Vec<RawRecord>,
    /// Length of the well-framed prefix. Anything past it is a torn tail.
    pub valid_len: u64,
    /// Total bytes present in the file.
    pub file_len: u64,
}

impl SegmentScan {
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Scan a segment file, stopping at the first incomplete frame.
pub fn scan_segment(path: &Path) -> Result<SegmentScan, StoreError> {
    let mut file = File::open(path)?;
    let file_len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut records = Vec::new();
    let mut pos: usize = 0;
    loop {
        let remaining = buf.len() - pos;
        if remaining == 0 {
            break;
        }
        if remaining < 4 {
            // Dangling length prefix.
            break;
        }
        let frame_len =
            u32::from_le_bytes(buf[pos..pos + 4].try_into().expect("len checked")) as usize;
        if frame_len < TAG_LEN || remaining < 4 + frame_len {
            // Frame shorter than a tag, or cut off mid-record.
            break;
        }
        let frame = &buf[pos + 4..pos + 4 + frame_len];
        let (canonical, tag) = frame.split_at(frame_len - TAG_LEN);
        records.push(RawRecord {
            offset: pos as u64,
            canonical: canonical.to_vec(),
            tag: tag.try_into().expect("tag length checked"),
        });
        pos += 4 + frame_len;
    }

    Ok(SegmentScan {
        records,
        valid_len: pos as u64,
        file_len,
    })
}

/// Read a single record at a known offset.
pub fn read_record_at(path: &Path, offset: u64) -> Result<RawRecord, StoreError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let frame_len = u32::from_le_bytes(len_buf) as usize;
    if frame_len < TAG_LEN {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame shorter than tag",
        )));
    }
    let mut frame = vec![0u8; frame_len];
    file.read_exact(&mut frame)?;
    let (canonical, tag) = frame.split_at(frame_len - TAG_LEN);
    Ok(RawRecord {
        offset,
        canonical: canonical.to_vec(),
        tag: tag.try_into().expect("tag length checked"),
    })
}

/// Truncate a segment to its valid prefix.
pub fn truncate_segment(path: &Path, valid_len: u64) -> Result<(), StoreError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(valid_len)?;
    file.sync_data()?;
    Ok(())
}

/// Appending writer over the active segment.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    segment_id: u32,
    len: u64,
}

impl SegmentWriter {
    /// Open (or create) the segment for appending.
    pub fn open(log_dir: &Path, segment_id: u32) -> Result<Self, StoreError> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(segment_file_name(segment_id));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            path,
            segment_id,
            len,
        })
    }

    #[must_use]
    pub const fn segment_id(&self) -> u32 {
        self.segment_id
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one framed record and fsync. Returns the frame's offset.
    pub fn append_record(
        &mut self,
        canonical: &[u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<u64, StoreError> {
        let offset = self.len;
        let frame_len = (canonical.len() + TAG_LEN) as u32;
        self.file.write_all(&frame_len.to_le_bytes())?;
        self.file.write_all(canonical)?;
        self.file.write_all(tag)?;
        self.file.sync_data()?;
        self.len += 4 + u64::from(frame_len);
        Ok(offset)
    }
}
