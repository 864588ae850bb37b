use crate::error::LeafError;
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

pub const LOG_MAGIC: [u8; 4] = *b"LKVL";
pub const LOG_FORMAT_VERSION: u32 = 1;
pub const LOG_HEADER_BYTES: u64 = 8;
pub const MAX_FRAME_BODY_BYTES: usize = 64 * 1024 * 1024;

const FRAME_OVERHEAD: usize = 8 + 4;

/// The net effect of one committed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub puts: Vec<(String, String)>,
    pub deletes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame")]
    Corruption,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub fn encode_frame(seq: u64, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let body_len = FRAME_OVERHEAD + payload.len();
    if body_len > MAX_FRAME_BODY_BYTES {
        return Err(FrameError::Corruption);
    }
    let frame_length = u32::try_from(body_len).map_err(|_| FrameError::Corruption)?;
    let mut bytes = Vec::with_capacity(4 + body_len);
    bytes.extend_from_slice(&frame_length.to_be_bytes());
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(payload);
    let crc = crc32c(&bytes);
    bytes.extend_from_slice(&crc.to_be_bytes());
    Ok(bytes)
}

pub struct FrameReader<R: Read> {
    inner: R,
    consumed: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }

    /// Bytes belonging to fully validated frames read so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut len_buf = [0u8; 4];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        read_exact_or_truncated(&mut self.inner, &mut len_buf[1..4])?;
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_BODY_BYTES).contains(&body_len) {
            return Err(FrameError::Corruption);
        }

        let mut body = vec![0u8; body_len];
        read_exact_or_truncated(&mut self.inner, &mut body)?;

        let crc_offset = body_len - 4;
        let stored_crc = u32::from_be_bytes(
            body[crc_offset..]
                .try_into()
                .map_err(|_| FrameError::Corruption)?,
        );
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if stored_crc != crc32c(&crc_input) {
            return Err(FrameError::Corruption);
        }

        let seq = u64::from_be_bytes(body[0..8].try_into().map_err(|_| FrameError::Corruption)?);
        let payload = body[8..crc_offset].to_vec();
        self.consumed += 4 + body_len as u64;
        Ok(Some(Frame { seq, payload }))
    }
}

fn read_exact_or_truncated(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Truncation),
        Err(e) => Err(FrameError::Io(e.to_string())),
    }
}

/// Everything recovered from a log on open.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<(u64, CommitRecord)>,
    pub last_seq: u64,
    pub truncated_bytes: u64,
}

/// Append-only commit log backing the MVCC store.
///
/// Layout: an 8-byte header (`LKVL` magic, big-endian `u32` format version)
/// followed by frames of
///
/// ```text
/// | len: u32 | seq: u64 | payload: [u8] | crc32c: u32 |
/// ```
///
/// where `len` counts everything after itself and the checksum covers the
/// length, sequence and payload. Payloads are `rmp_serde`-encoded
/// [`CommitRecord`]s.
pub struct CommitLog {
    path: PathBuf,
    file: File,
    fsync: bool,
    frames: u64,
    poisoned: bool,
}

impl CommitLog {
    /// Opens the log at `path`, creating it if missing, and replays every
    /// intact frame. A torn final frame is cut off; anything else that fails
    /// validation refuses the open.
    pub fn open(path: &Path, fsync: bool) -> Result<(Self, Replay), LeafError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            let mut header = Vec::with_capacity(LOG_HEADER_BYTES as usize);
            header.extend_from_slice(&LOG_MAGIC);
            header.extend_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
            info!(path = %path.display(), "created commit log");
            let log = Self::from_file(path, file, fsync, 0)?;
            return Ok((log, Replay::default()));
        }

        let mut reader = BufReader::new(&file);
        check_header(&mut reader, path)?;
        let mut frames = FrameReader::new(reader);
        let mut replay = Replay::default();
        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => {
                    if frame.seq <= replay.last_seq {
                        return Err(corrupt(path, "commit sequence is not increasing"));
                    }
                    let record: CommitRecord = rmp_serde::from_slice(&frame.payload)
                        .map_err(|e| LeafError::Decode(e.to_string()))?;
                    replay.last_seq = frame.seq;
                    replay.records.push((frame.seq, record));
                }
                Ok(None) => break,
                Err(FrameError::Truncation) => {
                    let valid = LOG_HEADER_BYTES + frames.consumed();
                    replay.truncated_bytes = len - valid;
                    warn!(
                        path = %path.display(),
                        bytes = replay.truncated_bytes,
                        "discarding torn commit log tail"
                    );
                    break;
                }
                Err(FrameError::Corruption) => {
                    return Err(corrupt(path, "checksum or length mismatch"));
                }
                Err(FrameError::Io(e)) => return Err(LeafError::Storage(e)),
            }
        }
        drop(frames);
        if replay.truncated_bytes > 0 {
            file.set_len(len - replay.truncated_bytes)?;
            file.sync_all()?;
        }
        let count = replay.records.len() as u64;
        let log = Self::from_file(path, file, fsync, count)?;
        Ok((log, replay))
    }

    fn from_file(path: &Path, file: File, fsync: bool, frames: u64) -> Result<Self, LeafError> {
        drop(file);
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            fsync,
            frames,
            poisoned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Appends one commit. Returns only once the frame is durable when the
    /// log was opened with `fsync`.
    pub fn append(&mut self, seq: u64, record: &CommitRecord) -> Result<(), LeafError> {
        if self.poisoned {
            return Err(LeafError::Storage(format!(
                "commit log {} failed an earlier write",
                self.path.display()
            )));
        }
        let payload = rmp_serde::to_vec(record).map_err(|e| LeafError::Encode(e.to_string()))?;
        let frame = encode_frame(seq, &payload)
            .map_err(|_| LeafError::Storage(format!("commit {seq} exceeds frame size limit")))?;
        let written = self.file.write_all(&frame).and_then(|()| {
            if self.fsync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            self.poisoned = true;
            return Err(e.into());
        }
        self.frames += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), LeafError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replaces the log with a single frame holding `snapshot` as of `seq`.
    /// The new file is written beside the old one and renamed over it.
    pub fn compact(&mut self, seq: u64, snapshot: &CommitRecord) -> Result<(), LeafError> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let payload =
            rmp_serde::to_vec(snapshot).map_err(|e| LeafError::Encode(e.to_string()))?;
        let frame = encode_frame(seq, &payload)
            .map_err(|_| LeafError::Storage("snapshot exceeds frame size limit".into()))?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&LOG_MAGIC)?;
        tmp.write_all(&LOG_FORMAT_VERSION.to_be_bytes())?;
        tmp.write_all(&frame)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| LeafError::Io(e.error))?;
        File::open(&dir)?.sync_all()?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.frames = 1;
        self.poisoned = false;
        info!(path = %self.path.display(), seq, keys = snapshot.puts.len(), "compacted commit log");
        Ok(())
    }
}

fn check_header(reader: &mut impl Read, path: &Path) -> Result<(), LeafError> {
    let mut header = [0u8; LOG_HEADER_BYTES as usize];
    reader
        .read_exact(&mut header)
        .map_err(|_| corrupt(path, "file is too short to hold a header"))?;
    if header[..4] != LOG_MAGIC {
        return Err(LeafError::Storage(format!(
            "{} is not a leafkv commit log",
            path.display()
        )));
    }
    let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if version > LOG_FORMAT_VERSION {
        return Err(LeafError::Storage(format!(
            "{} has commit log format {version}, newer than supported {LOG_FORMAT_VERSION}",
            path.display()
        )));
    }
    Ok(())
}

fn corrupt(path: &Path, detail: &str) -> LeafError {
    LeafError::Storage(format!("corrupt commit log {}: {detail}", path.display()))
}
