//! Disk ring file of recent raw records.
//!
//! ```text
//! header (16 bytes, big-endian)
//! +--------+------------+----------+----------+
//! | "WLRF" | record_len | capacity | next_seq |
//! +--------+------------+----------+----------+
//!
//! slot i (8 + record_len bytes), i = seq % capacity
//! +-------------+-------------+-----------------------+
//! | seq (u32)   | len (u32)   | payload (record_len)  |
//! +-------------+-------------+-----------------------+
//! ```
//!
//! The writer stamps every slot with the sequence it holds, so a reader
//! asking for a sequence the writer has since lapped sees a mismatched
//! stamp and reports the record as gone instead of returning newer data.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// ---

use super::error::{Result, WaveLinkError};
use super::unit::seq_gap;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const RING_MAGIC: &[u8; 4] = b"WLRF";

pub const RING_HEADER_LEN: u64 = 16;

const SLOT_PREFIX_LEN: u64 = 8;

// ---------------------------------------------------------------------------
// RingHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    // ---
    /// Largest payload a slot can hold.
    pub record_len: u32,

    /// Number of slots.
    pub capacity: u32,

    /// Sequence the writer will assign next.
    pub next_seq: u32,
}

// ---

impl RingHeader {
    // ---
    fn encode(&self) -> [u8; RING_HEADER_LEN as usize] {
        // ---
        let mut out = [0u8; RING_HEADER_LEN as usize];
        out[0..4].copy_from_slice(RING_MAGIC);
        out[4..8].copy_from_slice(&self.record_len.to_be_bytes());
        out[8..12].copy_from_slice(&self.capacity.to_be_bytes());
        out[12..16].copy_from_slice(&self.next_seq.to_be_bytes());
        out
    }

    fn decode(raw: &[u8; RING_HEADER_LEN as usize]) -> Result<Self> {
        // ---
        if &raw[0..4] != RING_MAGIC {
            return Err(WaveLinkError::RingFile("bad magic".into()));
        }
        let word = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let header = Self {
            record_len: word(4),
            capacity: word(8),
            next_seq: word(12),
        };
        if header.capacity == 0 || header.record_len == 0 {
            return Err(WaveLinkError::RingFile(format!(
                "degenerate geometry: capacity {} record_len {}",
                header.capacity, header.record_len
            )));
        }
        Ok(header)
    }

    // ---

    fn slot_len(&self) -> u64 {
        SLOT_PREFIX_LEN + self.record_len as u64
    }

    fn slot_offset(&self, seq: u32) -> u64 {
        RING_HEADER_LEN + (seq % self.capacity) as u64 * self.slot_len()
    }

    /// Total file size implied by the geometry.
    pub fn file_len(&self) -> u64 {
        RING_HEADER_LEN + self.capacity as u64 * self.slot_len()
    }

    /// `true` if `seq` was written and has not been lapped yet.
    pub fn holds(&self, seq: u32) -> bool {
        let behind = seq_gap(seq, self.next_seq);
        behind >= 1 && behind <= self.capacity
    }
}

// ---

fn read_header(file: &mut File) -> Result<RingHeader> {
    // ---
    let mut raw = [0u8; RING_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut raw)?;
    RingHeader::decode(&raw)
}

// ---------------------------------------------------------------------------
// RingReader
// ---------------------------------------------------------------------------

/// Sequential reader over a ring file.
#[derive(Debug)]
pub struct RingReader {
    // ---
    path: PathBuf,
    file: File,
    header: RingHeader,
}

// ---

impl RingReader {
    // ---
    pub fn open(path: &Path) -> Result<Self> {
        // ---
        let mut file = File::open(path).map_err(|e| {
            WaveLinkError::RingFile(format!("cannot open {}: {e}", path.display()))
        })?;
        let header = read_header(&mut file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> RingHeader {
        self.header
    }

    /// Re-read the header to learn about newly written records.
    pub fn refresh(&mut self) -> Result<RingHeader> {
        self.header = read_header(&mut self.file)?;
        Ok(self.header)
    }

    // ---

    /// Payload stored for `seq`, or `None` if it is not (or no longer) in
    /// the ring.
    pub fn read(&mut self, seq: u32) -> Result<Option<Vec<u8>>> {
        // ---
        if !self.header.holds(seq) {
            return Ok(None);
        }

        let offset = self.header.slot_offset(seq);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut prefix = [0u8; SLOT_PREFIX_LEN as usize];
        self.file.read_exact(&mut prefix)?;

        let stamp = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if stamp != seq {
            return Ok(None);
        }
        if len > self.header.record_len {
            return Err(WaveLinkError::RingFile(format!(
                "slot for seq {seq} claims {len} bytes, limit {}",
                self.header.record_len
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload)?;

        // The writer restamps a slot before rewriting its payload, so an
        // unchanged stamp means the copy is not torn.
        if self.stamp_at(offset)? != seq {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    fn stamp_at(&mut self, offset: u64) -> Result<u32> {
        // ---
        let mut stamp = [0u8; 4];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut stamp)?;
        Ok(u32::from_be_bytes(stamp))
    }
}

// ---------------------------------------------------------------------------
// RingWriter
// ---------------------------------------------------------------------------

/// Appends records to a ring file.  One writer per file.
#[derive(Debug)]
pub struct RingWriter {
    // ---
    file: File,
    header: RingHeader,
}

// ---

impl RingWriter {
    // ---
    /// Create (or truncate) a ring file with the given geometry.
    pub fn create(path: &Path, record_len: u32, capacity: u32) -> Result<Self> {
        // ---
        let header = RingHeader {
            record_len,
            capacity,
            next_seq: 0,
        };
        let raw = header.encode();
        RingHeader::decode(&raw)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(header.file_len())?;
        file.write_all(&raw)?;
        file.flush()?;
        Ok(Self { file, header })
    }

    /// Reopen an existing ring file, continuing at its `next_seq`.
    pub fn open(path: &Path) -> Result<Self> {
        // ---
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = read_header(&mut file)?;
        Ok(Self { file, header })
    }

    pub fn header(&self) -> RingHeader {
        self.header
    }

    // ---

    /// Store `payload` under the next sequence and publish it.
    pub fn append(&mut self, payload: &[u8]) -> Result<u32> {
        // ---
        if payload.len() > self.header.record_len as usize {
            return Err(WaveLinkError::RingFile(format!(
                "record of {} bytes exceeds slot size {}",
                payload.len(),
                self.header.record_len
            )));
        }

        let seq = self.header.next_seq;
        let mut prefix = [0u8; SLOT_PREFIX_LEN as usize];
        prefix[0..4].copy_from_slice(&seq.to_be_bytes());
        prefix[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        self.file
            .seek(SeekFrom::Start(self.header.slot_offset(seq)))?;
        self.file.write_all(&prefix)?;
        self.file.write_all(payload)?;

        // Publish only after the slot is complete.
        self.header.next_seq = seq.wrapping_add(1);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.flush()?;
        Ok(seq)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn written_records_read_back() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.dat");
        let mut writer = RingWriter::create(&path, 64, 8).unwrap();
        for i in 0..5u8 {
            assert_eq!(writer.append(&[i; 10]).unwrap(), i as u32);
        }

        let mut reader = RingReader::open(&path).unwrap();
        assert_eq!(reader.header().next_seq, 5);
        assert_eq!(reader.read(3).unwrap(), Some(vec![3u8; 10]));
        assert_eq!(reader.read(5).unwrap(), None);
    }

    #[test]
    fn lapped_records_are_gone() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.dat");
        let mut writer = RingWriter::create(&path, 16, 4).unwrap();
        let mut reader = RingReader::open(&path).unwrap();

        for i in 0..6u8 {
            writer.append(&[i]).unwrap();
        }
        reader.refresh().unwrap();
        assert_eq!(reader.read(1).unwrap(), None);
        assert_eq!(reader.read(2).unwrap(), Some(vec![2]));
        assert_eq!(reader.read(5).unwrap(), Some(vec![5]));
    }

    #[test]
    fn slot_rewritten_under_a_stale_reader_is_not_returned() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.dat");
        let mut writer = RingWriter::create(&path, 16, 4).unwrap();
        for i in 0..2u8 {
            writer.append(&[i; 4]).unwrap();
        }
        let mut reader = RingReader::open(&path).unwrap();
        let offset = reader.header().slot_offset(1);
        assert_eq!(reader.stamp_at(offset).unwrap(), 1);

        // Lap slot 1 while the reader still trusts its old header.
        for i in 2..6u8 {
            writer.append(&[i; 4]).unwrap();
        }
        assert_eq!(reader.stamp_at(offset).unwrap(), 5);
        assert_eq!(reader.read(1).unwrap(), None);
    }

    #[test]
    fn oversize_record_is_refused() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.dat");
        let mut writer = RingWriter::create(&path, 4, 4).unwrap();
        assert!(writer.append(&[0; 5]).is_err());
        assert_eq!(writer.header().next_seq, 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.dat");
        std::fs::write(&path, [0u8; 32]).unwrap();
        assert!(matches!(
            RingReader::open(&path),
            Err(WaveLinkError::RingFile(_))
        ));
    }

    #[test]
    fn writer_reopen_continues_sequence() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.dat");
        RingWriter::create(&path, 8, 4).unwrap().append(b"a").unwrap();
        let mut writer = RingWriter::open(&path).unwrap();
        assert_eq!(writer.append(b"b").unwrap(), 1);
    }
}
