//! Segment files and sequential readers over them.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use data_types::TraceId;
use observability_deps::tracing::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::ResultExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

use crate::{
    codec::{self, RECORD_HEADER_LEN},
    Result, UnableToCreateSegmentSnafu, UnableToOpenSegmentSnafu, UnableToReadDirSnafu,
    UnableToReadSegmentSnafu, UnableToSyncSegmentSnafu, UnableToWriteSegmentSnafu,
    WriteSummary, MAX_RECORD_LEN,
};

static SEGMENT_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{10})\.wal$").expect("valid regex"));

/// Monotonically increasing identifier of a segment within one tenant's WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Construct from a raw value.
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// The raw value.
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// The id following this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    fn file_name(&self) -> String {
        format!("{:010}.wal", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A segment no longer accepting appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSegment {
    id: SegmentId,
    path: PathBuf,
    size: u64,
}

impl ClosedSegment {
    /// Segment id.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the segment file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Scan `dir` for segment files left behind by a previous process.
pub(crate) async fn scan_dir(dir: &Path) -> Result<Vec<ClosedSegment>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .context(UnableToReadDirSnafu {
            path: dir.to_owned(),
        })?;
    while let Some(entry) = entries.next_entry().await.context(UnableToReadDirSnafu {
        path: dir.to_owned(),
    })? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(captures) = SEGMENT_FILE_RE.captures(name) else {
            continue;
        };
        let id = captures[1].parse::<u64>().expect("regex enforces digits");
        let metadata = entry.metadata().await.context(UnableToReadSegmentSnafu {
            path: entry.path(),
        })?;
        out.push(ClosedSegment {
            id: SegmentId::new(id),
            path: entry.path(),
            size: metadata.len(),
        });
    }
    Ok(out)
}

/// The segment currently accepting appends.
#[derive(Debug)]
pub(crate) struct OpenSegmentFile {
    id: SegmentId,
    path: PathBuf,
    file: tokio::fs::File,
    len: u64,
}

impl OpenSegmentFile {
    pub(crate) async fn create(dir: &Path, id: SegmentId) -> Result<Self> {
        let path = dir.join(id.file_name());
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(UnableToCreateSegmentSnafu { path: path.clone() })?;
        Ok(Self {
            id,
            path,
            file,
            len: 0,
        })
    }

    pub(crate) fn id(&self) -> SegmentId {
        self.id
    }

    /// Write `encoded` and fsync before returning, so the caller may
    /// acknowledge the record as durable.
    pub(crate) async fn write_all_sync(&mut self, encoded: &[u8]) -> Result<WriteSummary> {
        self.file
            .write_all(encoded)
            .await
            .context(UnableToWriteSegmentSnafu {
                path: self.path.clone(),
            })?;
        self.file
            .sync_data()
            .await
            .context(UnableToSyncSegmentSnafu {
                path: self.path.clone(),
            })?;
        self.len += encoded.len() as u64;
        Ok(WriteSummary {
            segment_id: self.id,
            total_bytes: self.len,
            bytes_written: encoded.len() as u64,
        })
    }

    pub(crate) fn close(self) -> ClosedSegment {
        ClosedSegment {
            id: self.id,
            path: self.path,
            size: self.len,
        }
    }
}

/// One record read back from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// The trace the record belongs to.
    pub trace_id: TraceId,

    /// The opaque object bytes as they were appended.
    pub payload: Bytes,
}

/// Sequential reader over one closed segment.
///
/// [`SegmentReader::next_record`] distinguishes three terminal conditions: a
/// clean end of file (`Ok(None)`), a torn final record from a crash mid-write
/// (also `Ok(None)`, logged), and a corrupt record body
/// ([`Error::CorruptRecord`]) after which reading may continue with the next
/// record.
#[derive(Debug)]
pub struct SegmentReader {
    id: SegmentId,
    path: PathBuf,
    reader: BufReader<tokio::fs::File>,
    offset: u64,
}

impl SegmentReader {
    pub(crate) async fn open(segment: ClosedSegment) -> Result<Self> {
        let file = tokio::fs::File::open(segment.path())
            .await
            .context(UnableToOpenSegmentSnafu {
                path: segment.path().to_owned(),
            })?;
        Ok(Self {
            id: segment.id(),
            path: segment.path().to_owned(),
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// The id of the segment being read.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Read the next record, or `None` at end of segment.
    pub async fn next_record(&mut self) -> Result<Option<WalRecord>> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => {
                return Err(e).context(UnableToReadSegmentSnafu {
                    path: self.path.clone(),
                })
            }
        }

        let record_offset = self.offset;
        let (len, crc) = codec::read_header(&header);
        if len == 0 || len > MAX_RECORD_LEN {
            // A nonsense length means the tail of the segment cannot be
            // trusted; there is no resync marker to recover at.
            warn!(
                segment = %self.id,
                offset = record_offset,
                len,
                "implausible record length, discarding segment tail"
            );
            return Ok(None);
        }

        let mut compressed = vec![0u8; len as usize];
        match self.reader.read_exact(&mut compressed).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(
                    segment = %self.id,
                    offset = record_offset,
                    "torn record at segment tail, discarding"
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(e).context(UnableToReadSegmentSnafu {
                    path: self.path.clone(),
                })
            }
        }
        self.offset += (RECORD_HEADER_LEN + len as usize) as u64;

        let (trace_id, payload) = codec::decode_record(&compressed, crc, self.id, record_offset)?;
        Ok(Some(WalRecord { trace_id, payload }))
    }
}
