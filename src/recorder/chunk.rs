//! Chunk file format (`chunk_NNNN.dat`)
//!
//! # Layout
//!
//! ```text
//! +----------------------------------------------------------------+
//! | Header (20 bytes)                                              |
//! |  magic "NNCHUNK\0" (8) | version (4) | chunk_index (4)         |
//! |  channel_count (2) | reserved (2)                              |
//! +----------------------------------------------------------------+
//! | Record*                                                        |
//! |  tag (1) | body_len (4) | body (body_len) | crc32 (4)          |
//! +----------------------------------------------------------------+
//! | Footer record (tag 0x7F), present only once the chunk is closed |
//! |  sample_count (8) | first_seq (8) | last_seq (8) | digest (4)  |
//! +----------------------------------------------------------------+
//! ```
//!
//! Sample body: `sequence (8) | timestamp_us (8) | n (2) | n x f32`.
//! Marker body: `kind (1) | after_sequence (8) | timestamp_us (8) | wall_clock_ms (8)`.
//!
//! Each record carries its own CRC, so a torn write at the tail is detected
//! and cut at the last intact record boundary. The footer digest is the
//! CRC32 of every record byte that precedes it.

use super::state::{ChunkRef, MarkerKind};
use crate::bus::Sample;
use crate::utils::error::StorageError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes: "NNCHUNK\0"
pub const MAGIC: [u8; 8] = *b"NNCHUNK\0";

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

const TAG_SAMPLE: u8 = 0x01;
const TAG_MARKER: u8 = 0x02;
const TAG_FOOTER: u8 = 0x7F;

/// tag + body_len + crc
const RECORD_OVERHEAD: usize = 1 + 4 + 4;

/// Upper bound for a single record body; anything larger is corruption
const MAX_RECORD_BODY: usize = 1 << 20;

/// File name for a chunk index
pub fn chunk_file_name(index: u32) -> String {
    format!("chunk_{:04}.dat", index)
}

/// Parse the index back out of a chunk file name
pub fn parse_chunk_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("chunk_")?
        .strip_suffix(".dat")?
        .parse()
        .ok()
}

/// Chunk file header (20 bytes, fixed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u32,
    pub chunk_index: u32,
    pub channel_count: u16,
}

impl ChunkHeader {
    pub const SIZE: usize = 20;

    pub fn new(chunk_index: u32, channel_count: u16) -> Self {
        Self {
            version: FORMAT_VERSION,
            chunk_index,
            channel_count,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&MAGIC)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u32::<LittleEndian>(self.chunk_index)?;
        w.write_u16::<LittleEndian>(self.channel_count)?;
        w.write_u16::<LittleEndian>(0)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self, StorageError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(StorageError::InvalidChunk("bad magic".to_string()));
        }

        let version = r.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(StorageError::InvalidChunk(format!(
                "unsupported version {}",
                version
            )));
        }

        let chunk_index = r.read_u32::<LittleEndian>()?;
        let channel_count = r.read_u16::<LittleEndian>()?;
        let _reserved = r.read_u16::<LittleEndian>()?;

        Ok(Self {
            version,
            chunk_index,
            channel_count,
        })
    }
}

/// A marker record as stored in a chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMarker {
    pub kind: MarkerKind,
    pub after_sequence: u64,
    pub timestamp_us: u64,
    pub wall_clock_ms: i64,
}

/// A decoded chunk record
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkRecord {
    Sample(Sample),
    Marker(ChunkMarker),
}

/// Closing footer of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub sample_count: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub digest: u32,
}

fn encode_record(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + body.len());
    buf.push(tag);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn encode_sample(sample: &Sample) -> io::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(18 + sample.values.len() * 4);
    body.write_u64::<LittleEndian>(sample.sequence)?;
    body.write_u64::<LittleEndian>(sample.timestamp_us)?;
    body.write_u16::<LittleEndian>(sample.values.len() as u16)?;
    for value in &sample.values {
        body.write_f32::<LittleEndian>(*value)?;
    }
    Ok(body)
}

fn encode_marker(marker: &ChunkMarker) -> io::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(25);
    body.write_u8(marker.kind.code())?;
    body.write_u64::<LittleEndian>(marker.after_sequence)?;
    body.write_u64::<LittleEndian>(marker.timestamp_us)?;
    body.write_i64::<LittleEndian>(marker.wall_clock_ms)?;
    Ok(body)
}

fn encode_footer(footer: &ChunkFooter) -> io::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(28);
    body.write_u64::<LittleEndian>(footer.sample_count)?;
    body.write_u64::<LittleEndian>(footer.first_sequence)?;
    body.write_u64::<LittleEndian>(footer.last_sequence)?;
    body.write_u32::<LittleEndian>(footer.digest)?;
    Ok(body)
}

fn decode_sample(body: &[u8]) -> Option<Sample> {
    let mut r = Cursor::new(body);
    let sequence = r.read_u64::<LittleEndian>().ok()?;
    let timestamp_us = r.read_u64::<LittleEndian>().ok()?;
    let n = r.read_u16::<LittleEndian>().ok()? as usize;
    if body.len() != 18 + n * 4 {
        return None;
    }
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(r.read_f32::<LittleEndian>().ok()?);
    }
    Some(Sample {
        sequence,
        timestamp_us,
        values,
    })
}

fn decode_marker(body: &[u8]) -> Option<ChunkMarker> {
    if body.len() != 25 {
        return None;
    }
    let mut r = Cursor::new(body);
    let kind = MarkerKind::from_code(r.read_u8().ok()?)?;
    Some(ChunkMarker {
        kind,
        after_sequence: r.read_u64::<LittleEndian>().ok()?,
        timestamp_us: r.read_u64::<LittleEndian>().ok()?,
        wall_clock_ms: r.read_i64::<LittleEndian>().ok()?,
    })
}

fn decode_footer(body: &[u8]) -> Option<ChunkFooter> {
    if body.len() != 28 {
        return None;
    }
    let mut r = Cursor::new(body);
    Some(ChunkFooter {
        sample_count: r.read_u64::<LittleEndian>().ok()?,
        first_sequence: r.read_u64::<LittleEndian>().ok()?,
        last_sequence: r.read_u64::<LittleEndian>().ok()?,
        digest: r.read_u32::<LittleEndian>().ok()?,
    })
}

/// Split one CRC-valid record off the front of `buf`.
/// Returns `(tag, body, total_len)`, or `None` for a torn or corrupt record.
fn next_record(buf: &[u8]) -> Option<(u8, &[u8], usize)> {
    if buf.len() < RECORD_OVERHEAD {
        return None;
    }
    let tag = buf[0];
    let body_len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if body_len > MAX_RECORD_BODY {
        return None;
    }
    let total = RECORD_OVERHEAD + body_len;
    if buf.len() < total {
        return None;
    }
    let crc_at = 5 + body_len;
    let stored = u32::from_le_bytes([
        buf[crc_at],
        buf[crc_at + 1],
        buf[crc_at + 2],
        buf[crc_at + 3],
    ]);
    if crc32fast::hash(&buf[..crc_at]) != stored {
        return None;
    }
    Some((tag, &buf[5..crc_at], total))
}

/// Append-only writer for the open chunk
pub struct ChunkWriter {
    file: BufWriter<File>,
    path: PathBuf,
    index: u32,
    sample_count: u64,
    first_sequence: Option<u64>,
    last_sequence: Option<u64>,
    byte_size: u64,
    unflushed: usize,
    digest: crc32fast::Hasher,
    closed: bool,
}

impl ChunkWriter {
    /// Create a new chunk file. Fails if the file already exists.
    pub fn create(path: &Path, index: u32, channel_count: u16) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;
        let mut file = BufWriter::new(file);

        ChunkHeader::new(index, channel_count).write(&mut file)?;

        tracing::debug!("Opened chunk {} at {:?}", index, path);

        Ok(Self {
            file,
            path: path.to_path_buf(),
            index,
            sample_count: 0,
            first_sequence: None,
            last_sequence: None,
            byte_size: ChunkHeader::SIZE as u64,
            unflushed: ChunkHeader::SIZE,
            digest: crc32fast::Hasher::new(),
            closed: false,
        })
    }

    fn append_record(&mut self, tag: u8, body: &[u8]) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::ChunkClosed { index: self.index });
        }
        let record = encode_record(tag, body);
        self.file.write_all(&record)?;
        self.digest.update(&record);
        self.byte_size += record.len() as u64;
        self.unflushed += record.len();
        Ok(())
    }

    /// Append one sample record
    pub fn append_sample(&mut self, sample: &Sample) -> Result<(), StorageError> {
        let body = encode_sample(sample)?;
        self.append_record(TAG_SAMPLE, &body)?;

        self.sample_count += 1;
        self.first_sequence.get_or_insert(sample.sequence);
        self.last_sequence = Some(sample.sequence);
        Ok(())
    }

    /// Append one marker record
    pub fn append_marker(&mut self, marker: &ChunkMarker) -> Result<(), StorageError> {
        let body = encode_marker(marker)?;
        self.append_record(TAG_MARKER, &body)
    }

    /// Push buffered records to the file and fsync
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.unflushed == 0 {
            return Ok(());
        }
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.unflushed = 0;
        Ok(())
    }

    /// Write the footer, fsync and hand back the chunk reference.
    /// The file is never touched again afterwards.
    pub fn close(mut self) -> Result<ChunkRef, StorageError> {
        let footer = ChunkFooter {
            sample_count: self.sample_count,
            first_sequence: self.first_sequence.unwrap_or(0),
            last_sequence: self.last_sequence.unwrap_or(0),
            digest: self.digest.clone().finalize(),
        };
        let body = encode_footer(&footer)?;
        let record = encode_record(TAG_FOOTER, &body);

        self.file.write_all(&record)?;
        self.byte_size += record.len() as u64;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        self.closed = true;

        tracing::debug!(
            "Closed chunk {}: {} samples, {} bytes",
            self.index,
            self.sample_count,
            self.byte_size
        );

        Ok(ChunkRef {
            index: self.index,
            file_name: chunk_file_name(self.index),
            first_sequence: self.first_sequence,
            last_sequence: self.last_sequence,
            sample_count: self.sample_count,
            byte_size: self.byte_size,
            checksum: footer.digest,
            closed: true,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn unflushed_bytes(&self) -> usize {
        self.unflushed
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Leave an intact prefix behind on every exit path; recovery seals it
        if let Err(e) = self.flush() {
            tracing::warn!("Failed to flush chunk {} on drop: {}", self.index, e);
        }
    }
}

/// Result of reading a chunk file
#[derive(Debug, Clone)]
pub struct ChunkScan {
    pub header: ChunkHeader,
    pub records: Vec<ChunkRecord>,
    pub footer: Option<ChunkFooter>,
    /// CRC32 of the intact records (excluding header and footer)
    pub digest: u32,
    /// Byte length of header + intact records (+ footer if present)
    pub intact_len: u64,
    /// Bytes after the intact prefix (torn writes)
    pub trailing_bytes: u64,
    /// A valid footer found at the very end of the file although the scan
    /// stopped before reaching it: a closed chunk with a damaged body
    pub tail_footer: Option<ChunkFooter>,
}

impl ChunkScan {
    /// Closed means a footer is present and agrees with the records
    pub fn is_closed(&self) -> bool {
        self.footer
            .map(|f| f.digest == self.digest && f.sample_count == self.sample_count())
            .unwrap_or(false)
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.records.iter().filter_map(|r| match r {
            ChunkRecord::Sample(s) => Some(s),
            ChunkRecord::Marker(_) => None,
        })
    }

    pub fn sample_count(&self) -> u64 {
        self.samples().count() as u64
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.samples().next().map(|s| s.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.samples().last().map(|s| s.sequence)
    }

    /// Closed at some point, whether or not its body still checks out
    pub fn has_footer(&self) -> bool {
        self.footer.is_some() || self.tail_footer.is_some()
    }

    /// Chunk reference describing the scanned contents
    pub fn to_chunk_ref(&self) -> ChunkRef {
        ChunkRef {
            index: self.header.chunk_index,
            file_name: chunk_file_name(self.header.chunk_index),
            first_sequence: self.first_sequence(),
            last_sequence: self.last_sequence(),
            sample_count: self.sample_count(),
            byte_size: self.intact_len,
            checksum: self.digest,
            closed: self.is_closed(),
        }
    }
}

/// Read and validate a chunk file, stopping at the first torn or corrupt record
pub fn scan_chunk(path: &Path) -> Result<ChunkScan, StorageError> {
    let data = fs::read(path)?;
    if data.len() < ChunkHeader::SIZE {
        return Err(StorageError::InvalidChunk(format!(
            "{:?}: truncated header",
            path
        )));
    }
    let header = ChunkHeader::read(&mut Cursor::new(&data[..ChunkHeader::SIZE]))?;

    let mut offset = ChunkHeader::SIZE;
    let mut records = Vec::new();
    let mut footer = None;
    let mut digest = crc32fast::Hasher::new();

    while let Some((tag, body, total)) = next_record(&data[offset..]) {
        let record = match tag {
            TAG_SAMPLE => decode_sample(body).map(ChunkRecord::Sample),
            TAG_MARKER => decode_marker(body).map(ChunkRecord::Marker),
            TAG_FOOTER => {
                footer = decode_footer(body);
                if footer.is_some() {
                    offset += total;
                }
                break;
            }
            _ => None,
        };

        let Some(record) = record else { break };
        digest.update(&data[offset..offset + total]);
        records.push(record);
        offset += total;
    }

    let tail_footer = if footer.is_none() {
        trailing_footer(&data[offset..])
    } else {
        None
    };

    Ok(ChunkScan {
        header,
        records,
        footer,
        digest: digest.finalize(),
        intact_len: offset as u64,
        trailing_bytes: (data.len() - offset) as u64,
        tail_footer,
    })
}

const FOOTER_RECORD_LEN: usize = RECORD_OVERHEAD + 28;

fn trailing_footer(rest: &[u8]) -> Option<ChunkFooter> {
    if rest.len() < FOOTER_RECORD_LEN {
        return None;
    }
    let tail = &rest[rest.len() - FOOTER_RECORD_LEN..];
    match next_record(tail) {
        Some((TAG_FOOTER, body, _)) => decode_footer(body),
        _ => None,
    }
}

/// Close an abnormally terminated chunk: cut it at the last intact record
/// and append a footer. A chunk that is already closed is never rewritten.
pub fn seal_chunk(path: &Path, scan: &ChunkScan) -> Result<ChunkRef, StorageError> {
    if scan.is_closed() {
        return Ok(scan.to_chunk_ref());
    }
    if scan.has_footer() {
        return Err(StorageError::ChunkClosed {
            index: scan.header.chunk_index,
        });
    }

    let records_len = scan.intact_len;

    let footer = ChunkFooter {
        sample_count: scan.sample_count(),
        first_sequence: scan.first_sequence().unwrap_or(0),
        last_sequence: scan.last_sequence().unwrap_or(0),
        digest: scan.digest,
    };
    let record = encode_record(TAG_FOOTER, &encode_footer(&footer)?);

    let mut file = OpenOptions::new().write(true).open(path)?;
    file.set_len(records_len)?;
    file.seek(SeekFrom::End(0))?;
    file.write_all(&record)?;
    file.sync_all()?;

    let byte_size = records_len + record.len() as u64;
    tracing::info!(
        "Sealed chunk {:?}: kept {} samples, dropped {} torn bytes",
        path,
        footer.sample_count,
        scan.trailing_bytes
    );

    Ok(ChunkRef {
        index: scan.header.chunk_index,
        file_name: chunk_file_name(scan.header.chunk_index),
        first_sequence: scan.first_sequence(),
        last_sequence: scan.last_sequence(),
        sample_count: footer.sample_count,
        byte_size,
        checksum: footer.digest,
        closed: true,
    })
}

/// Decode every intact record of a chunk
pub fn read_chunk_records(path: &Path) -> Result<Vec<ChunkRecord>, StorageError> {
    Ok(scan_chunk(path)?.records)
}
