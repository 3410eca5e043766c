//! Durable FIFO queue of request strings.
//!
//! The index (`id -> byte offset`) is the only source of truth for order and
//! size. Payloads live in one of three places:
//! - the bounded in-memory cache (fresh entries)
//! - the backing file, one request per line, referenced by byte offset
//! - the read-ahead window of lines decoded from the file
//!
//! Entries reach the file in id order: evicting or flushing an entry also
//! writes every older cached entry that is not on disk yet. Together with the
//! persisted cursor (queue length, offset of the head entry) this lets a new
//! instance map file lines back to entries after a restart.
//!
//! Nothing here fails towards the caller. I/O problems are logged and, when
//! the file cannot produce an indexed entry, that entry is dropped so the
//! rest of the queue keeps moving.

mod cache;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::prefs::{Preferences, QueueCursor};
use cache::PayloadCache;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// An entry at the head of the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: u64,
    pub payload: String,
}

/// Durable request queue; all index mutations happen under one lock.
pub struct DurableQueue {
    state: Mutex<QueueState>,
}

struct QueueState {
    path: PathBuf,
    prefs: Arc<Preferences>,
    /// id -> byte offset in the backing file, `None` while only in memory
    index: BTreeMap<u64, Option<u64>>,
    cache: PayloadCache,
    /// Decoded lines keyed by id, with the file position right after each line
    window: HashMap<u64, (String, u64)>,
    read_batch_size: usize,
    next_id: u64,
    /// Highest id whose line is (or is assumed to be) in the file
    last_written: Option<u64>,
    /// File position right after the most recently consumed line
    consumed_end: u64,
}

impl DurableQueue {
    /// Open the queue over `path`, resuming from the persisted cursor.
    pub fn open(path: impl Into<PathBuf>, prefs: Arc<Preferences>, storage: &StorageConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        terminate_partial_line(&path)?;

        let mut state = QueueState {
            path,
            prefs,
            index: BTreeMap::new(),
            cache: PayloadCache::new(storage.cache_capacity),
            window: HashMap::new(),
            read_batch_size: storage.read_batch_size.max(1),
            next_id: 0,
            last_written: None,
            consumed_end: 0,
        };
        state.restore();

        tracing::info!(
            path = %state.path.display(),
            size = state.index.len(),
            "Durable queue opened"
        );

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a request string.
    pub fn enqueue(&self, payload: &str) {
        let payload = sanitize(payload);
        let mut state = self.state();

        let id = state.next_id;
        state.next_id += 1;
        state.index.insert(id, None);
        if let Some(evicted) = state.cache.insert(id, payload) {
            state.spill(evicted);
        }
        state.persist_cursor();
        tracing::trace!(id, "Enqueued request");
    }

    /// Payload of the oldest entry.
    pub fn peek(&self) -> Option<String> {
        self.peek_entry().map(|e| e.payload)
    }

    /// Oldest entry together with its id.
    pub fn peek_entry(&self) -> Option<QueueEntry> {
        self.state().peek()
    }

    /// Pop the oldest entry; no-op when empty.
    pub fn remove_last_url(&self) {
        let mut state = self.state();
        if let Some((&head, _)) = state.index.first_key_value() {
            state.remove(head);
            state.persist_cursor();
        }
    }

    /// Remove a specific entry previously returned by [`peek_entry`](Self::peek_entry).
    ///
    /// Returns `false` if the entry is already gone (e.g. after a clear).
    pub fn remove_entry(&self, id: u64) -> bool {
        let mut state = self.state();
        if !state.index.contains_key(&id) {
            return false;
        }
        state.remove(id);
        state.persist_cursor();
        true
    }

    pub fn size(&self) -> usize {
        self.state().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Write every cached entry that is not on disk yet, then persist the cursor.
    pub fn flush(&self) {
        let mut state = self.state();
        if let Some(max_id) = state.cache.max_id() {
            if let Err(e) = state.write_through(max_id, None) {
                tracing::error!(error = %e, "Failed to flush queue to disk");
            }
        }
        state.persist_cursor();
        tracing::debug!(size = state.index.len(), "Queue flushed");
    }

    /// Rebuild the index from the persisted cursor, only if the queue is empty.
    pub fn reset(&self) {
        let mut state = self.state();
        if state.index.is_empty() {
            state.restore();
        } else {
            tracing::debug!(size = state.index.len(), "Queue not empty, skipping reset");
        }
    }

    /// Forget every entry and remove the backing file.
    pub fn clear_all_tracking_data(&self) {
        let mut state = self.state();
        let removed = state.index.len();
        state.index.clear();
        state.cache.clear();
        state.window.clear();
        state.last_written = state.next_id.checked_sub(1);
        state.remove_file();
        state.persist_cursor();
        tracing::info!(removed, "Cleared all tracking data");
    }

    /// Remove the backing file if no entries remain; returns whether it was removed.
    pub fn delete_requests_file(&self) -> bool {
        let mut state = self.state();
        if !state.index.is_empty() {
            tracing::info!(
                size = state.index.len(),
                "Not deleting requests file, queue still has entries"
            );
            return false;
        }
        state.remove_file();
        state.persist_cursor();
        true
    }

    /// Path of the backing file
    pub fn path(&self) -> PathBuf {
        self.state().path.clone()
    }
}

impl QueueState {
    fn restore(&mut self) {
        let cursor = match self.prefs.queue_cursor() {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read queue cursor, starting empty");
                QueueCursor::default()
            }
        };

        self.index.clear();
        self.cache.clear();
        self.window.clear();

        // Renumber from next_id so ids are never reused within a process
        let base = self.next_id;
        for n in 0..cursor.length {
            self.index.insert(base + n, None);
        }
        if cursor.length > 0 && cursor.head_offset >= 0 {
            self.index.insert(base, Some(cursor.head_offset as u64));
        }
        self.next_id = base + cursor.length;
        self.last_written = self.next_id.checked_sub(1);
        self.consumed_end = cursor.head_offset.max(0) as u64;

        if cursor.length > 0 {
            tracing::info!(
                length = cursor.length,
                head_offset = cursor.head_offset,
                "Restored queue from cursor"
            );
        }
    }

    fn resident(&mut self, id: u64) -> Option<String> {
        if let Some(payload) = self.cache.get(id) {
            return Some(payload.to_string());
        }
        self.window.get(&id).map(|(payload, _)| payload.clone())
    }

    fn is_resident(&self, id: u64) -> bool {
        self.cache.contains(id) || self.window.contains_key(&id)
    }

    fn peek(&mut self) -> Option<QueueEntry> {
        loop {
            let head = *self.index.first_key_value()?.0;
            if let Some(payload) = self.resident(head) {
                return Some(QueueEntry { id: head, payload });
            }

            self.window.clear();
            if let Err(e) = self.load_window(head) {
                tracing::warn!(id = head, error = %e, "Failed to read queue file");
            }
            if let Some(payload) = self.resident(head) {
                return Some(QueueEntry { id: head, payload });
            }

            self.drop_unrecoverable_prefix(head);
        }
    }

    /// Decode up to `read_batch_size` lines starting at the head entry.
    fn load_window(&mut self, head: u64) -> Result<()> {
        let start = self
            .index
            .get(&head)
            .copied()
            .flatten()
            .unwrap_or(self.consumed_end);

        // Offsets already owned by a known entry cannot belong to another one
        let claimed: HashMap<u64, u64> = self
            .index
            .range(head..)
            .filter_map(|(id, offset)| offset.map(|o| (o, *id)))
            .collect();
        let ids: Vec<(u64, Option<u64>)> = self
            .index
            .range(head..)
            .map(|(id, offset)| (*id, *offset))
            .collect();

        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(start))?;
        let mut pos = start;
        let mut lost = Vec::new();
        let mut loaded = 0usize;
        let mut line = Vec::new();

        for (id, offset) in ids {
            if loaded >= self.read_batch_size || self.cache.contains(id) {
                break;
            }

            match offset {
                Some(o) if o != pos => {
                    reader.seek(SeekFrom::Start(o))?;
                    pos = o;
                }
                Some(_) => {}
                None => {
                    if claimed.get(&pos).is_some_and(|owner| *owner != id) {
                        lost.push(id);
                        continue;
                    }
                }
            }

            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 || line.last() != Some(&b'\n') {
                break;
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            self.index.insert(id, Some(pos));
            pos += n as u64;
            self.window
                .insert(id, (String::from_utf8_lossy(&line).into_owned(), pos));
            loaded += 1;
        }

        for id in &lost {
            self.index.remove(id);
        }
        if !lost.is_empty() {
            tracing::warn!(count = lost.len(), "Dropped queue entries missing from file");
            self.persist_cursor();
        }

        tracing::debug!(head, loaded, "Loaded read-ahead window");
        Ok(())
    }

    /// Drop the head and any following entries that cannot be located.
    fn drop_unrecoverable_prefix(&mut self, head: u64) {
        self.index.remove(&head);
        let mut dropped = 1usize;

        while let Some((&id, &offset)) = self.index.first_key_value() {
            if offset.is_some() || self.is_resident(id) {
                break;
            }
            self.index.remove(&id);
            dropped += 1;
        }

        tracing::warn!(
            first_id = head,
            dropped,
            "Dropped unrecoverable queue entries"
        );
        self.persist_cursor();
    }

    fn remove(&mut self, id: u64) {
        let offset = self.index.remove(&id).flatten();
        let cached = self.cache.remove(id);
        let windowed = self.window.remove(&id);

        let end = match (windowed, cached, offset) {
            (Some((_, end)), _, _) => Some(end),
            (None, Some(payload), Some(offset)) => Some(offset + payload.len() as u64 + 1),
            // Cached only, never written
            (None, Some(_), None) => None,
            (None, None, Some(offset)) => self.line_end(offset),
            // Restored entry never read: it starts where the last consumed line ended
            (None, None, None) => {
                let start = self.consumed_end;
                if self.index.values().any(|o| *o == Some(start)) {
                    None
                } else {
                    self.line_end(start)
                }
            }
        };

        if let Some(end) = end {
            self.consumed_end = end;
        }
    }

    /// File position right after the line starting at `offset`.
    fn line_end(&self, offset: u64) -> Option<u64> {
        let read = || -> Result<u64> {
            let mut reader = BufReader::new(File::open(&self.path)?);
            reader.seek(SeekFrom::Start(offset))?;
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line)?;
            Ok(offset + n as u64)
        };
        match read() {
            Ok(end) if end > offset => Some(end),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(offset, error = %e, "Failed to locate consumed line");
                None
            }
        }
    }

    /// Handle a payload reclaimed from the cache.
    fn spill(&mut self, evicted: (u64, String)) {
        let id = evicted.0;
        match self.index.get(&id) {
            Some(None) => {}
            // Already on disk or already consumed
            _ => return,
        }

        if let Err(e) = self.write_through(id, Some(evicted)) {
            tracing::error!(id, error = %e, "Failed to spill request to disk");
        }
        if let Some(None) = self.index.get(&id) {
            self.index.remove(&id);
            tracing::warn!(id, "Dropped request that could not be written");
        }
    }

    /// Append every in-memory entry with `id <= upto` that is not on disk yet.
    fn write_through(&mut self, upto: u64, mut evicted: Option<(u64, String)>) -> Result<()> {
        let mut from = self.last_written.map_or(0, |id| id + 1);
        if let Some((id, _)) = &evicted {
            from = from.min(*id);
        }
        if upto < from {
            return Ok(());
        }

        let pending: Vec<u64> = self
            .index
            .range(from..=upto)
            .filter(|(_, offset)| offset.is_none())
            .map(|(id, _)| *id)
            .collect();

        let mut lines = Vec::with_capacity(pending.len());
        for id in pending {
            let payload = match evicted.take() {
                Some((eid, payload)) if eid == id => Some(payload),
                other => {
                    evicted = other;
                    self.cache.peek(id).map(str::to_owned)
                }
            };
            // Restored entries are already in the file
            if let Some(payload) = payload {
                lines.push((id, payload));
            }
        }

        if !lines.is_empty() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let mut offset = file.seek(SeekFrom::End(0))?;
            let mut writer = BufWriter::new(file);
            let mut written = Vec::with_capacity(lines.len());

            for (id, payload) in &lines {
                writer.write_all(payload.as_bytes())?;
                writer.write_all(b"\n")?;
                written.push((*id, offset));
                offset += payload.len() as u64 + 1;
            }
            writer.flush()?;

            for (id, offset) in written {
                self.index.insert(id, Some(offset));
            }
            tracing::debug!(count = lines.len(), upto, "Wrote requests to disk");
        }

        self.last_written = Some(self.last_written.map_or(upto, |w| w.max(upto)));
        Ok(())
    }

    fn remove_file(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed requests file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "Failed to remove requests file"),
        }
        self.consumed_end = 0;
    }

    fn persist_cursor(&self) {
        let head_offset = match self.index.first_key_value() {
            Some((_, Some(offset))) => *offset as i64,
            Some((_, None)) => self.consumed_end as i64,
            None => -1,
        };
        let cursor = QueueCursor {
            length: self.index.len() as u64,
            head_offset,
        };
        if let Err(e) = self.prefs.set_queue_cursor(&cursor) {
            tracing::warn!(error = %e, "Failed to persist queue cursor");
        }
    }
}

/// Newlines would split one request over two lines.
fn sanitize(payload: &str) -> String {
    if payload.contains(['\n', '\r']) {
        tracing::warn!("Request contains line breaks, encoding them");
        payload.replace('\n', "%0A").replace('\r', "%0D")
    } else {
        payload.to_string()
    }
}

/// A crash mid-append can leave a line without its newline; close it so the
/// next append starts on a fresh line.
fn terminate_partial_line(path: &Path) -> Result<()> {
    let mut file = match OpenOptions::new().read(true).append(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() == 0 {
        return Ok(());
    }

    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        tracing::warn!(path = %path.display(), "Requests file ends mid-line, terminating it");
        file.write_all(b"\n")?;
    }
    Ok(())
}
