// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Trial log segment files
//!
//! **File Structure:**
//! ```text
//! ┌─────────────────────────────────────┐
//! │         Header (16 bytes)           │  Magic, version, reserved
//! ├─────────────────────────────────────┤
//! │  Frame: len u32 | crc32 u32 | body  │  body = bincode(LogRecord)
//! ├─────────────────────────────────────┤
//! │  Frame ...                          │  arrival order
//! └─────────────────────────────────────┘
//! ```
//!
//! A crash can leave a partially written last frame. The reader drops such a
//! torn tail and reports the length of the valid prefix so the caller can
//! truncate it; a bad frame followed by more data is corruption.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use trialhub_core::{LogRecord, Result, TrialhubError};

/// Segment magic: "TRLOGv1\0"
pub const SEGMENT_MAGIC: &[u8; 8] = b"TRLOGv1\0";

pub const SEGMENT_VERSION: u32 = 1;

pub const HEADER_LEN: u64 = 16;

const FRAME_HEADER_LEN: u64 = 8;

/// Append-only writer for one trial's segment.
pub struct SegmentWriter {
    path: PathBuf,
    out: BufWriter<File>,
    frames: u64,
}

impl SegmentWriter {
    /// Create a new segment. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut out = BufWriter::new(file);
        out.write_all(SEGMENT_MAGIC)?;
        out.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        out.write_u32::<LittleEndian>(0)?;
        out.flush()?;
        Ok(Self {
            path,
            out,
            frames: 0,
        })
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let body = bincode::serialize(record)?;
        let len = u32::try_from(body.len()).map_err(|_| {
            TrialhubError::IngestionOverflow(format!("record of {} bytes", body.len()))
        })?;
        self.out.write_u32::<LittleEndian>(len)?;
        self.out.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        self.out.write_all(&body)?;
        self.frames += 1;
        Ok(())
    }

    /// Push buffered frames to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Flush and fsync.
    pub fn sync(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of scanning a segment.
#[derive(Debug)]
pub struct SegmentScan {
    pub records: Vec<LogRecord>,
    /// Byte length of the valid prefix.
    pub valid_len: u64,
    /// Whether a partial trailing frame was found past `valid_len`.
    pub torn_tail: bool,
}

/// Read every intact frame of a segment.
pub fn read_segment(path: impl AsRef<Path>) -> Result<SegmentScan> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut input = BufReader::new(file);

    let mut magic = [0u8; 8];
    input.read_exact(&mut magic).map_err(|_| {
        TrialhubError::Corruption(format!("{}: truncated segment header", path.display()))
    })?;
    if &magic != SEGMENT_MAGIC {
        return Err(TrialhubError::Corruption(format!(
            "{}: invalid segment magic {:?}",
            path.display(),
            magic
        )));
    }
    let version = input.read_u32::<LittleEndian>()?;
    if version != SEGMENT_VERSION {
        return Err(TrialhubError::Corruption(format!(
            "{}: unsupported segment version {}",
            path.display(),
            version
        )));
    }
    let _reserved = input.read_u32::<LittleEndian>()?;

    let mut records = Vec::new();
    let mut offset = HEADER_LEN;
    loop {
        if offset == file_len {
            break;
        }
        if file_len - offset < FRAME_HEADER_LEN {
            return Ok(torn(records, offset));
        }
        let len = input.read_u32::<LittleEndian>()? as u64;
        let crc = input.read_u32::<LittleEndian>()?;
        let frame_end = offset + FRAME_HEADER_LEN + len;
        if frame_end > file_len {
            return Ok(torn(records, offset));
        }

        let mut body = vec![0u8; len as usize];
        match input.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(torn(records, offset)),
            Err(e) => return Err(e.into()),
        }

        if crc32fast::hash(&body) != crc {
            if frame_end == file_len {
                return Ok(torn(records, offset));
            }
            return Err(TrialhubError::Corruption(format!(
                "{}: checksum mismatch at offset {}",
                path.display(),
                offset
            )));
        }

        records.push(bincode::deserialize(&body)?);
        offset = frame_end;
    }

    Ok(SegmentScan {
        records,
        valid_len: offset,
        torn_tail: false,
    })
}

fn torn(records: Vec<LogRecord>, valid_len: u64) -> SegmentScan {
    SegmentScan {
        records,
        valid_len,
        torn_tail: true,
    }
}

/// Drop everything past `valid_len`.
pub fn truncate_segment(path: impl AsRef<Path>, valid_len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path.as_ref())?;
    file.set_len(valid_len)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialhub_core::TrialId;

    fn record(seq: u64, payload: &[u8]) -> LogRecord {
        LogRecord {
            trial_id: TrialId(3),
            rank: 1,
            seq,
            timestamp_us: 1_000 + seq,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_write_then_scan_preserves_binary_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3.seg");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.append(&record(0, b"plain line")).unwrap();
        writer.append(&record(1, b"null\0inside\xff\xfe")).unwrap();
        writer.sync().unwrap();
        assert_eq!(writer.frames(), 2);

        let scan = read_segment(&path).unwrap();
        assert!(!scan.torn_tail);
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.records[1].payload, b"null\0inside\xff\xfe".to_vec());
        assert_eq!(scan.valid_len, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_create_refuses_existing_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.seg");
        SegmentWriter::create(&path).unwrap();
        assert!(SegmentWriter::create(&path).is_err());
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3.seg");
        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.append(&record(0, b"kept")).unwrap();
        writer.append(&record(1, b"this frame gets cut")).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let full = std::fs::metadata(&path).unwrap().len();
        truncate_segment(&path, full - 5).unwrap();

        let scan = read_segment(&path).unwrap();
        assert!(scan.torn_tail);
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].payload, b"kept".to_vec());

        truncate_segment(&path, scan.valid_len).unwrap();
        let rescan = read_segment(&path).unwrap();
        assert!(!rescan.torn_tail);
        assert_eq!(rescan.records.len(), 1);
    }

    #[test]
    fn test_mid_file_corruption_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3.seg");
        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.append(&record(0, b"first")).unwrap();
        writer.append(&record(1, b"second")).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte inside the first frame body.
        let idx = (HEADER_LEN + FRAME_HEADER_LEN + 2) as usize;
        bytes[idx] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            read_segment(&path),
            Err(TrialhubError::Corruption(_))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.seg");
        std::fs::write(&path, b"NOTASEGMENTFILE!").unwrap();
        assert!(matches!(
            read_segment(&path),
            Err(TrialhubError::Corruption(_))
        ));
    }
}
