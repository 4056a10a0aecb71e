use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format. Returns the
/// frame size in bytes.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Result of reading a WAL from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte offset just past the last intact entry.
    pub valid_len: u64,
    /// True if bytes after `valid_len` were ignored (torn write or corruption).
    pub discarded_tail: bool,
}

/// Append-only write-ahead log of booking events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A torn last entry is detected by the length prefix and CRC and cut off
/// before the log is reopened for appending.
///
/// Bytes past `synced_len` belong to appends nobody has acknowledged yet.
/// After a failed append or flush, `rollback` cuts the file back to
/// `synced_len` so those frames can never be replayed.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    synced_len: u64,
    pending_bytes: u64,
    pending_appends: u64,
    /// Set while a rollback is owed; appends refuse to run until it succeeds.
    needs_rollback: bool,
}

impl Wal {
    /// Open (or create) the WAL at `path`, first truncating it to `valid_len`
    /// so new entries never land behind a corrupt tail.
    pub fn open_truncated(path: &Path, valid_len: u64) -> io::Result<Self> {
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Self::open(path)
    }

    /// Open (or create) the WAL file at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            pending_bytes: 0,
            pending_appends: 0,
            needs_rollback: false,
        })
    }

    /// Append and fsync one event. Tests only; the engine goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without flushing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.needs_rollback {
            self.rollback()?;
        }
        self.needs_rollback = true;
        self.pending_bytes += encode_event(&mut self.writer, event)?;
        self.needs_rollback = false;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.needs_rollback = true;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.needs_rollback = false;
        self.synced_len += self.pending_bytes;
        self.pending_bytes = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop every append since the last successful `flush_sync`: buffered
    /// bytes are discarded unwritten and the file is truncated to
    /// `synced_len`.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.needs_rollback = true;
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let old = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        // into_parts hands back the buffer without flushing it.
        let (_, _unwritten) = old.into_parts();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_bytes = 0;
        self.pending_appends = 0;

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.needs_rollback = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn synced_len(&self) -> u64 {
        self.synced_len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a compacted snapshot to `<path>.tmp` and fsync it.
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

    /// Rename the snapshot over the live WAL and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_bytes = 0;
        self.pending_appends = 0;
        self.needs_rollback = false;
        Ok(())
    }

    /// Both compaction phases in one call.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let Some(len_buf) = read_array::<4>(&mut reader)? else { break };
            let len = u32::from_le_bytes(len_buf) as usize;
            if (len as u64) > file_len {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let Some(crc_buf) = read_array::<4>(&mut reader)? else { break };
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => break,
            }
            replay.valid_len += 8 + len as u64;
        }

        replay.discarded_tail = replay.valid_len < file_len;
        Ok(replay)
    }
}

/// Read exactly N bytes, or `None` on a clean or torn end of file.
fn read_array<const N: usize>(reader: &mut impl Read) -> io::Result<Option<[u8; N]>> {
    let mut buf = [0u8; N];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(buf)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("meetd_test_wal")
            .join(Ulid::new().to_string());
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn user_created() -> Event {
        Event::UserCreated {
            id: Ulid::new(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            created_at: 1,
        }
    }

    fn meeting_created(user_id: Ulid, start: i64, end: i64) -> Event {
        Event::MeetingCreated {
            id: Ulid::new(),
            user_id,
            title: "Planning".into(),
            description: None,
            span: Span::new(start, end),
            created_at: 2,
            updated_at: 2,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let user = user_created();
        let events = vec![user.clone(), meeting_created(user.user_id(), 1000, 2000)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert!(!replay.discarded_tail);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn torn_tail_is_discarded_and_truncated() {
        let path = tmp_path("torn_tail.wal");
        let event = user_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event.clone()]);
        assert!(replay.discarded_tail);

        // Appending after truncation must keep the new entry reachable.
        let next = meeting_created(event.user_id(), 10, 20);
        {
            let mut wal = Wal::open_truncated(&path, replay.valid_len).unwrap();
            wal.append(&next).unwrap();
        }
        let again = Wal::replay(&path).unwrap();
        assert_eq!(again.events, vec![event, next]);
        assert!(!again.discarded_tail);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let event = Event::MeetingDeleted {
            id: Ulid::new(),
            user_id: Ulid::new(),
        };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(replay.discarded_tail);
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let user = user_created();
        let uid = user.user_id();
        let keep = meeting_created(uid, 0, 1000);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&user).unwrap();
        for i in 0..10 {
            let churn = meeting_created(uid, 5000 + i, 6000 + i);
            wal.append(&churn).unwrap();
            if let Event::MeetingCreated { id, .. } = churn {
                wal.append(&Event::MeetingDeleted { id, user_id: uid }).unwrap();
            }
        }
        wal.append(&keep).unwrap();
        assert_eq!(wal.appends_since_compact(), 22);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![user.clone(), keep.clone()];
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let later = meeting_created(uid, 2000, 3000);
        wal.append(&later).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![user, keep, later]);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| user_created()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }

    #[test]
    fn rollback_discards_unsynced_appends() {
        let path = tmp_path("rollback_buffered.wal");
        let user = user_created();
        let uid = user.user_id();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&user).unwrap();
        let synced = wal.synced_len();

        wal.append_buffered(&meeting_created(uid, 0, 1000)).unwrap();
        wal.append_buffered(&meeting_created(uid, 500, 1500)).unwrap();
        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        assert_eq!(wal.appends_since_compact(), 1);

        let next = meeting_created(uid, 2000, 3000);
        wal.append(&next).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![user, next]);
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn rollback_truncates_bytes_past_last_sync() {
        let path = tmp_path("rollback_partial.wal");
        let user = user_created();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&user).unwrap();
        let synced = wal.synced_len();
        assert_eq!(synced, fs::metadata(&path).unwrap().len());

        // A frame that reached the file before its write or fsync failed.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 11]).unwrap();
        }
        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);

        let next = meeting_created(user.user_id(), 10, 20);
        wal.append(&next).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![user, next]);
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn synced_len_follows_flush_and_compaction() {
        let path = tmp_path("synced_len.wal");
        let user = user_created();
        let mut wal = Wal::open(&path).unwrap();
        assert_eq!(wal.synced_len(), 0);

        wal.append_buffered(&user).unwrap();
        assert_eq!(wal.synced_len(), 0);
        wal.flush_sync().unwrap();
        assert_eq!(wal.synced_len(), fs::metadata(&path).unwrap().len());

        wal.append(&meeting_created(user.user_id(), 0, 10)).unwrap();
        wal.compact(std::slice::from_ref(&user)).unwrap();
        assert_eq!(wal.synced_len(), fs::metadata(&path).unwrap().len());
        drop(wal);

        let reopened = Wal::open(&path).unwrap();
        assert_eq!(reopened.synced_len(), fs::metadata(&path).unwrap().len());
    }
}
