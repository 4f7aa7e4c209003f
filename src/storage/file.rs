//! File-backed managed ledgers
//!
//! Each logical name owns a directory under the data dir. Each ledger id is a
//! segment file in that directory:
//!
//! ```text
//! +------------------+---------------------------------------------+
//! | header (8 bytes) | frame | frame | ...                         |
//! +------------------+---------------------------------------------+
//! header = "MLED" magic + u16 version + u16 reserved
//! frame  = u32 length (LE) + u32 crc32 (LE) + payload
//! ```
//!
//! On open, every segment is scanned to rebuild its entry index. A frame that
//! is cut short or fails its checksum at the end of the newest segment is an
//! interrupted write: it is truncated with a warning. The same damage inside
//! an older segment is reported as corruption.
//!
//! Segment I/O runs on tokio's blocking pool through `spawn_blocking`; only
//! the in-memory entry index is consulted on the async side.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ledger::{
    LedgerConfig, LedgerEntry, ManagedLedger, ManagedLedgerFactory, OpenLedgers, Position,
};
use crate::error::LedgerError;

const SEGMENT_MAGIC: &[u8; 4] = b"MLED";
const SEGMENT_VERSION: u16 = 1;
const SEGMENT_HEADER_SIZE: u64 = 8;
const FRAME_HEADER_SIZE: u64 = 8;
const SEGMENT_EXTENSION: &str = "ledger";

/// Factory storing ledgers under a data directory
pub struct FileLedgerFactory {
    root: PathBuf,
    sync_every_write: bool,
    open: OpenLedgers,
}

impl FileLedgerFactory {
    pub fn new(root: impl Into<PathBuf>, sync_every_write: bool) -> Result<Self, LedgerError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| LedgerError::io(root.display().to_string(), "create data dir", e))?;
        Ok(Self {
            root,
            sync_every_write,
            open: OpenLedgers::default(),
        })
    }

    fn ledger_dir(&self, name: &str) -> PathBuf {
        self.root.join(encode_name(name))
    }
}

/// Map a ledger name onto a relative path
///
/// `/` separates directories; `.` and `..` components and every byte outside
/// `[A-Za-z0-9_-.]` are percent-encoded.
fn encode_name(name: &str) -> PathBuf {
    let mut path = PathBuf::new();
    for component in name.split('/') {
        let mut encoded = String::with_capacity(component.len());
        if component.is_empty() || component == "." || component == ".." {
            for b in component.bytes() {
                encoded.push_str(&format!("%{:02X}", b));
            }
            if component.is_empty() {
                encoded.push_str("%00");
            }
        } else {
            for b in component.bytes() {
                if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.') {
                    encoded.push(b as char);
                } else {
                    encoded.push_str(&format!("%{:02X}", b));
                }
            }
        }
        path.push(encoded);
    }
    path
}

/// Run blocking segment I/O for ledger `name` off the async worker threads
async fn blocking<T, F>(name: &str, op: F) -> Result<T, LedgerError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| LedgerError::io(name, "join blocking task", e))?
}

fn segment_path(dir: &Path, ledger_id: i64) -> PathBuf {
    dir.join(format!("{:020}.{}", ledger_id, SEGMENT_EXTENSION))
}

fn list_segments(dir: &Path) -> std::io::Result<Vec<i64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn encode_frame(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE as usize + data.len());
    buf.put_u32_le(data.len() as u32);
    buf.put_u32_le(crc32fast::hash(data));
    buf.put_slice(data);
    buf.freeze()
}

fn segment_header() -> [u8; SEGMENT_HEADER_SIZE as usize] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[..4].copy_from_slice(SEGMENT_MAGIC);
    header[4..6].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header
}

/// Entry offsets of one segment
#[derive(Debug)]
struct SegmentIndex {
    path: PathBuf,
    offsets: Vec<u64>,
}

/// Scan a segment and return its entry offsets plus the end of the last valid frame
fn scan_segment(path: &Path, name: &str) -> Result<(Vec<u64>, u64, bool), LedgerError> {
    let io_err = |e: std::io::Error| LedgerError::io(name, "scan segment", e);
    let file_len = fs::metadata(path).map_err(io_err)?.len();
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);

    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    if reader.read_exact(&mut header).is_err() || &header[..4] != SEGMENT_MAGIC {
        // A segment without a full header never received an entry
        return Ok((Vec::new(), 0, file_len > 0));
    }

    let mut offsets = Vec::new();
    let mut position = SEGMENT_HEADER_SIZE;
    loop {
        let mut frame_header = [0u8; FRAME_HEADER_SIZE as usize];
        match reader.read_exact(&mut frame_header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok((offsets, position, position < file_len));
            }
            Err(e) => return Err(io_err(e)),
        }
        let len = u32::from_le_bytes([
            frame_header[0],
            frame_header[1],
            frame_header[2],
            frame_header[3],
        ]) as u64;
        let crc = u32::from_le_bytes([
            frame_header[4],
            frame_header[5],
            frame_header[6],
            frame_header[7],
        ]);
        if position + FRAME_HEADER_SIZE + len > file_len {
            return Ok((offsets, position, true));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).map_err(io_err)?;
        if crc32fast::hash(&payload) != crc {
            return Ok((offsets, position, true));
        }
        offsets.push(position);
        position += FRAME_HEADER_SIZE + len;
    }
}

fn read_frame(file: &mut File, offset: u64, name: &str) -> Result<Bytes, LedgerError> {
    let io_err = |e: std::io::Error| LedgerError::io(name, "read entry", e);
    file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
    let mut frame_header = [0u8; FRAME_HEADER_SIZE as usize];
    file.read_exact(&mut frame_header).map_err(io_err)?;
    let len = u32::from_le_bytes([
        frame_header[0],
        frame_header[1],
        frame_header[2],
        frame_header[3],
    ]) as usize;
    let crc = u32::from_le_bytes([
        frame_header[4],
        frame_header[5],
        frame_header[6],
        frame_header[7],
    ]);
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload).map_err(io_err)?;
    if crc32fast::hash(&payload) != crc {
        return Err(LedgerError::corrupted(
            name,
            format!("checksum mismatch at offset {}", offset),
        ));
    }
    Ok(Bytes::from(payload))
}

#[async_trait]
impl ManagedLedgerFactory for FileLedgerFactory {
    async fn open(
        &self,
        name: &str,
        config: LedgerConfig,
    ) -> Result<Arc<dyn ManagedLedger>, LedgerError> {
        self.open
            .get_or_open(name, || async {
                let owned = name.to_string();
                let dir = self.ledger_dir(name);
                let config = config.clone();
                let sync_every_write = self.sync_every_write;
                let ledger = blocking(name, move || {
                    FileLedger::open(&owned, dir, config, sync_every_write)
                })
                .await?;
                Ok(Arc::new(ledger) as Arc<dyn ManagedLedger>)
            })
            .await
    }

    fn is_open(&self, name: &str) -> bool {
        self.open.is_open(name)
    }

    fn evict(&self, name: &str) -> Option<Arc<dyn ManagedLedger>> {
        self.open.remove(name)
    }

    async fn exists(&self, name: &str) -> bool {
        let dir = self.ledger_dir(name);
        blocking(name, move || {
            Ok(list_segments(&dir).map(|ids| !ids.is_empty()).unwrap_or(false))
        })
        .await
        .unwrap_or(false)
    }

    async fn delete(&self, name: &str) -> Result<(), LedgerError> {
        if let Some(ledger) = self.open.remove(name) {
            ledger.close().await?;
        }
        let dir = self.ledger_dir(name);
        let owned = name.to_string();
        blocking(name, move || {
            if !dir.exists() {
                return Err(LedgerError::NotFound { name: owned });
            }
            fs::remove_dir_all(&dir).map_err(|e| LedgerError::io(owned, "delete", e))
        })
        .await?;
        info!(ledger = name, "Deleted ledger");
        Ok(())
    }

    async fn close_all(&self) {
        for ledger in self.open.drain() {
            if let Err(e) = ledger.close().await {
                warn!(ledger = ledger.name(), error = %e, "Failed to close ledger");
            }
        }
    }
}

#[derive(Debug)]
struct FileLedgerState {
    segments: BTreeMap<i64, SegmentIndex>,
    writer: File,
    write_offset: u64,
}

#[derive(Debug)]
struct FileLedger {
    name: String,
    ledger_id: i64,
    sync_every_write: bool,
    state: Arc<Mutex<FileLedgerState>>,
    closed: AtomicBool,
    config: LedgerConfig,
}

impl FileLedger {
    fn open(
        name: &str,
        dir: PathBuf,
        config: LedgerConfig,
        sync_every_write: bool,
    ) -> Result<Self, LedgerError> {
        let io_err = |op: &str, e: std::io::Error| LedgerError::io(name, op, e);
        fs::create_dir_all(&dir).map_err(|e| io_err("create dir", e))?;

        let ids = list_segments(&dir).map_err(|e| io_err("list segments", e))?;
        let newest = ids.last().copied();
        let mut segments = BTreeMap::new();
        for id in ids {
            let path = segment_path(&dir, id);
            let (offsets, valid_len, damaged) = scan_segment(&path, name)?;
            if damaged {
                if Some(id) != newest {
                    return Err(LedgerError::corrupted(
                        name,
                        format!("segment {} is damaged at offset {}", id, valid_len),
                    ));
                }
                warn!(
                    ledger = name,
                    ledger_id = id,
                    valid_len,
                    "Truncating interrupted write at end of segment"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| io_err("truncate", e))?;
                file.set_len(valid_len.max(SEGMENT_HEADER_SIZE))
                    .map_err(|e| io_err("truncate", e))?;
                if valid_len < SEGMENT_HEADER_SIZE {
                    let mut file = file;
                    file.seek(SeekFrom::Start(0))
                        .map_err(|e| io_err("truncate", e))?;
                    file.write_all(&segment_header())
                        .map_err(|e| io_err("truncate", e))?;
                }
            }
            segments.insert(id, SegmentIndex { path, offsets });
        }

        let ledger_id = newest.map_or(0, |id| id + 1);
        let path = segment_path(&dir, ledger_id);
        let mut writer = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| io_err("create segment", e))?;
        writer
            .write_all(&segment_header())
            .map_err(|e| io_err("write header", e))?;
        if sync_every_write {
            writer.sync_all().map_err(|e| io_err("sync", e))?;
        }
        segments.insert(
            ledger_id,
            SegmentIndex {
                path,
                offsets: Vec::new(),
            },
        );

        info!(
            ledger = name,
            ledger_id,
            segments = segments.len(),
            "Opened file ledger"
        );

        Ok(Self {
            name: name.to_string(),
            ledger_id,
            sync_every_write,
            state: Arc::new(Mutex::new(FileLedgerState {
                segments,
                writer,
                write_offset: SEGMENT_HEADER_SIZE,
            })),
            closed: AtomicBool::new(false),
            config,
        })
    }
}

#[async_trait]
impl ManagedLedger for FileLedger {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_ledger_id(&self) -> i64 {
        self.ledger_id
    }

    async fn append(&self, data: Bytes) -> Result<Position, LedgerError> {
        if self.is_closed() {
            return Err(LedgerError::closed(&self.name));
        }
        let frame = encode_frame(&data);
        let state = self.state.clone();
        let name = self.name.clone();
        let ledger_id = self.ledger_id;
        let sync_every_write = self.sync_every_write;
        blocking(&self.name, move || {
            let mut guard = state.lock();
            let state = &mut *guard;
            let offset = state.write_offset;
            state
                .writer
                .seek(SeekFrom::Start(offset))
                .map_err(|e| LedgerError::io(&name, "append", e))?;
            state
                .writer
                .write_all(&frame)
                .map_err(|e| LedgerError::io(&name, "append", e))?;
            if sync_every_write {
                state
                    .writer
                    .sync_data()
                    .map_err(|e| LedgerError::io(&name, "sync", e))?;
            }
            state.write_offset += frame.len() as u64;
            let segment = state
                .segments
                .get_mut(&ledger_id)
                .ok_or_else(|| LedgerError::NotFound { name: name.clone() })?;
            segment.offsets.push(offset);
            Ok(Position::new(ledger_id, segment.offsets.len() as i64 - 1))
        })
        .await
    }

    async fn read_entries(
        &self,
        from: Position,
        max: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        // Plan the reads from the index, then leave the lock for the file I/O
        let mut plan: Vec<(i64, PathBuf, Vec<(i64, u64)>)> = Vec::new();
        {
            let state = self.state.lock();
            let mut planned = 0usize;
            for (&ledger_id, segment) in state.segments.range(from.ledger_id.max(0)..) {
                if planned >= max {
                    break;
                }
                let start = if ledger_id == from.ledger_id {
                    from.entry_id.max(0) as usize
                } else {
                    0
                };
                let reads: Vec<(i64, u64)> = segment
                    .offsets
                    .iter()
                    .enumerate()
                    .skip(start)
                    .take(max - planned)
                    .map(|(entry_id, &offset)| (entry_id as i64, offset))
                    .collect();
                if reads.is_empty() {
                    continue;
                }
                planned += reads.len();
                plan.push((ledger_id, segment.path.clone(), reads));
            }
        }
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let name = self.name.clone();
        blocking(&self.name, move || {
            let mut out = Vec::new();
            for (ledger_id, path, reads) in plan {
                let mut file =
                    File::open(&path).map_err(|e| LedgerError::io(&name, "open segment", e))?;
                for (entry_id, offset) in reads {
                    out.push(LedgerEntry {
                        position: Position::new(ledger_id, entry_id),
                        data: read_frame(&mut file, offset, &name)?,
                    });
                }
            }
            Ok(out)
        })
        .await
    }

    fn last_confirmed_position(&self) -> Position {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .rev()
            .find(|(_, s)| !s.offsets.is_empty())
            .map(|(&id, s)| Position::new(id, s.offsets.len() as i64 - 1))
            .unwrap_or(Position::new(self.ledger_id, -1))
    }

    fn first_position(&self) -> Option<Position> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .find(|(_, s)| !s.offsets.is_empty())
            .map(|(&id, _)| Position::new(id, 0))
    }

    fn entry_count(&self) -> u64 {
        let state = self.state.lock();
        state
            .segments
            .values()
            .map(|s| s.offsets.len() as u64)
            .sum()
    }

    async fn trim_ledgers_before(&self, ledger_id: i64) -> Result<u64, LedgerError> {
        let bound = ledger_id.min(self.ledger_id);
        let removed = {
            let mut state = self.state.lock();
            let kept = state.segments.split_off(&bound);
            std::mem::replace(&mut state.segments, kept)
        };
        let name = self.name.clone();
        blocking(&self.name, move || {
            let mut count = 0;
            for (id, segment) in removed {
                fs::remove_file(&segment.path).map_err(|e| LedgerError::io(&name, "trim", e))?;
                count += segment.offsets.len() as u64;
                debug!(ledger = %name, ledger_id = id, "Trimmed ledger");
            }
            Ok(count)
        })
        .await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), LedgerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let state = self.state.clone();
        let name = self.name.clone();
        blocking(&self.name, move || {
            state
                .lock()
                .writer
                .sync_all()
                .map_err(|e| LedgerError::io(name, "close", e))
        })
        .await?;
        debug!(ledger = %self.name, ledger_id = self.ledger_id, "Closed file ledger");
        Ok(())
    }

    fn config(&self) -> &LedgerConfig {
        &self.config
    }
}
