use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Upper bound on a single encoded record; a larger length prefix is garbage.
const MAX_ENTRY_BYTES: usize = 1 << 20;

/// Encode a single event to [len][bincode][crc32] format. Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + payload.len() as u64)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append-only Write-Ahead Log. One file per tenant holds both the quota
/// records and the allocation ledger.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
/// - A failed flush is rolled back to the last synced length, so bytes of a
///   rejected batch never reach the file behind a later successful one.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    synced_len: u64,
    unsynced_bytes: u64,
    unsynced_appends: u64,
    /// Set when a rollback itself failed; refuses appends until compaction rewrites the file.
    poisoned: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced_bytes: 0,
            unsynced_appends: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Append a single event to the WAL and fsync. Used by tests only —
    /// production code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append a single event to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered events.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL unusable after a failed rollback"));
        }
        self.unsynced_bytes += encode_event(&mut self.writer, event)?;
        self.unsynced_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected fsync failure"));
        }
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.unsynced_bytes;
        self.unsynced_bytes = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, both
    /// still-buffered bytes and any already written to the file.
    ///
    /// If the file cannot be cut back, the log is poisoned and every later
    /// append fails until a compaction replaces the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.appends_since_compact -= self.unsynced_appends;
        self.unsynced_appends = 0;
        self.unsynced_bytes = 0;
        let result = self.reopen_at_synced_len();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn reopen_at_synced_len(&mut self) -> io::Result<()> {
        // Replace the writer first: dropping a BufWriter would flush its buffer.
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(open_append(&self.path)?));
        let (file, _discarded) = stale.into_parts();
        drop(file);
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.writer.buffer().len()
    }

    /// Return the WAL file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file and fsync. This is the slow I/O phase.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        // Persist the rename itself, not just the file contents.
        #[cfg(unix)]
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        let file = open_append(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // Anything still buffered belongs to the replaced file.
        let _ = stale.into_parts();
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.unsynced_bytes = 0;
        self.unsynced_appends = 0;
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Replace the WAL with a minimal set of events that recreates the current state.
    /// Both phases in one call. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.events)
    }

    /// Replay the log, cut off any torn or corrupt tail, and open it for appending.
    ///
    /// Without the cut, records appended after a corrupt entry would sit behind
    /// it and never be replayed again.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let scan = Self::scan(path)?;
        if let Some(len) = scan.discard_from {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(len)?;
            file.sync_all()?;
            tracing::warn!(
                "{}: discarded corrupt WAL tail at byte {len}",
                path.display()
            );
        }
        Ok((Self::open(path)?, scan.events))
    }

    fn scan(path: &Path) -> io::Result<Scan> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Scan { events: Vec::new(), discard_from: None });
            }
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut offset: u64 = 0;

        loop {
            match read_entry(&mut reader)? {
                Entry::Valid(event, size) => {
                    events.push(event);
                    offset += size;
                }
                Entry::End => break,
                Entry::Torn => break,
            }
        }

        let discard_from = (offset < file_len).then_some(offset);
        Ok(Scan { events, discard_from })
    }
}

struct Scan {
    events: Vec<Event>,
    /// Byte offset of the first unreadable entry, if the file extends past it.
    discard_from: Option<u64>,
}

enum Entry {
    Valid(Event, u64),
    /// Clean end of file.
    End,
    /// Partial write, CRC mismatch or undecodable payload.
    Torn,
}

fn read_entry(reader: &mut impl Read) -> io::Result<Entry> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Entry::End),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_ENTRY_BYTES {
        return Ok(Entry::Torn);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [&mut payload[..], &mut crc_buf[..]] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Entry::Torn),
            Err(e) => return Err(e),
        }
    }

    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Entry::Torn);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Entry::Valid(event, 8 + len as u64)),
        Err(_) => Ok(Entry::Torn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::model::{Allocation, QuotaParams, VersionToken};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("quotad_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn created(id: Ulid) -> Event {
        Event::QuotaCreated {
            id,
            params: QuotaParams {
                name: "Hotel Miramar, sea view".into(),
                product_type: "room-night".into(),
                travel_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                capacity: 20,
                overbooking_limit: 2,
            },
            version: VersionToken::fresh(),
        }
    }

    fn allocated(quota_id: Ulid, quantity: u32) -> Event {
        Event::QuotaAllocated {
            allocation: Allocation {
                id: Ulid::new(),
                quota_id,
                reservation_ref: Some("BK-1042".into()),
                quantity,
                assigned_at: 1_750_000_000_000,
            },
            version: VersionToken::fresh(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let qid = Ulid::new();
        let events = vec![created(qid), allocated(qid, 3)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let event = created(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // Append garbage to simulate a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let event = allocated(Ulid::new(), 1);

        {
            let payload = bincode::serialize(&event).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_corrupt_tail_before_appending() {
        let path = tmp_path("recover_tail.wal");
        let _ = fs::remove_file(&path);

        let qid = Ulid::new();
        let first = created(qid);
        let later = allocated(qid, 2);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        // Entry with a bad checksum, as left by a crash mid-write.
        {
            let payload = bincode::serialize(&allocated(qid, 1)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0u32.to_le_bytes()).unwrap();
        }

        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&later).unwrap();
        }

        // The record written after recovery must survive the next replay.
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, later]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_oversized_length_prefix() {
        let path = tmp_path("oversized.wal");
        let _ = fs::remove_file(&path);
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_clean_file_keeps_everything() {
        let path = tmp_path("recover_clean.wal");
        let _ = fs::remove_file(&path);
        let qid = Ulid::new();
        let events = vec![created(qid), allocated(qid, 1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let size = fs::metadata(&path).unwrap().len();
        let (_wal, replayed) = Wal::recover(&path).unwrap();
        assert_eq!(replayed, events);
        assert_eq!(fs::metadata(&path).unwrap().len(), size);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        let qid = Ulid::new();
        let create = created(qid);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&create).unwrap();
            for _ in 0..10 {
                if let Event::QuotaCreated { id, params, .. } = &create {
                    wal.append(&Event::QuotaRevised {
                        id: *id,
                        params: params.clone(),
                        version: VersionToken::fresh(),
                    })
                    .unwrap();
                }
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        let compacted_events = vec![create];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted_events).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, compacted_events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let qid = Ulid::new();
        let compacted = vec![created(qid)];
        let new_event = allocated(qid, 4);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&compacted[0]).unwrap();
            wal.compact(&compacted).unwrap();
            wal.append(&new_event).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let qid = Ulid::new();
        let mut events = vec![created(qid)];
        events.extend((1..5).map(|n| allocated(qid, n)));

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn failed_sync_does_not_leak_into_next_flush() {
        let path = tmp_path("failed_sync.wal");
        let _ = fs::remove_file(&path);

        let qid = Ulid::new();
        let first = created(qid);
        let rejected = allocated(qid, 1);
        let later = allocated(qid, 1);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();

            wal.append_buffered(&rejected).unwrap();
            wal.fail_next_sync();
            assert!(wal.flush_sync().is_err());
            wal.rollback().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);

            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_cuts_bytes_already_spilled_to_file() {
        let path = tmp_path("rollback_spill.wal");
        let _ = fs::remove_file(&path);

        let qid = Ulid::new();
        let first = created(qid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            let synced = fs::metadata(&path).unwrap().len();

            // Enough records to overflow the write buffer.
            for _ in 0..500 {
                wal.append_buffered(&allocated(qid, 1)).unwrap();
            }
            assert!(fs::metadata(&path).unwrap().len() > synced);

            wal.rollback().unwrap();
            assert_eq!(wal.buffered_len(), 0);
            assert_eq!(fs::metadata(&path).unwrap().len(), synced);
            assert!(!wal.is_poisoned());
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn full_device_drops_buffered_batch() {
        let path = Path::new("/dev/full");
        if !path.exists() {
            return;
        }
        let mut wal = Wal::open(path).unwrap();
        wal.append_buffered(&created(Ulid::new())).unwrap();
        assert!(wal.flush_sync().is_err());

        let rolled_back = wal.rollback();
        assert_eq!(wal.buffered_len(), 0);
        // A device cannot be truncated: the log refuses further appends.
        assert_eq!(wal.is_poisoned(), rolled_back.is_err());
        if wal.is_poisoned() {
            assert!(wal.append_buffered(&created(Ulid::new())).is_err());
        }
    }
}
