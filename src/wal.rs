use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// File header; bumped when the record layout changes.
const MAGIC: &[u8; 8] = b"ESWAL\x00\x00\x01";

/// Upper bound on a single record payload. Anything larger is treated as a
/// torn length prefix rather than an allocation request.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Record {
    Event(Event),
    End,
    /// Partial write or checksum mismatch; nothing after it is trusted.
    Torn,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<(Record, u64)> {
    let mut len_buf = [0u8; 4];
    match reader.read(&mut len_buf[..1])? {
        0 => return Ok((Record::End, 0)),
        _ => {
            if !read_exact_or_eof(reader, &mut len_buf[1..])? {
                return Ok((Record::Torn, 0));
            }
        }
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok((Record::Torn, 0));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut payload)? || !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok((Record::Torn, 0));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok((Record::Torn, 0));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok((Record::Event(event), (len + 8) as u64)),
        Err(_) => Ok((Record::Torn, 0)),
    }
}

/// Append-only write-ahead log of provider events.
///
/// Layout: an 8-byte magic header, then records of
/// `[u32 len][bincode Event][u32 crc32]`, little-endian.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful fsync.
    synced_len: u64,
    /// Records buffered or written since that fsync.
    unsynced: u64,
    /// Set when a failed batch could not be cut back off the file.
    poisoned: bool,
}

impl Wal {
    /// Open (or create) the log at `path` for appending. Does not validate
    /// existing content; use [`Wal::recover`] at startup.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(MAGIC)?;
            file.sync_all()?;
        }
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced: 0,
            poisoned: false,
        })
    }

    /// Replay every intact event, cut off a torn tail so later appends land
    /// on a clean boundary, and return the log ready for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::scan(path)?;
        if let Some(valid_len) = valid_len {
            let file = OpenOptions::new().write(true).open(path)?;
            if file.metadata()?.len() > valid_len {
                warn!(path = %path.display(), valid_len, "truncating torn WAL tail");
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }
        let wal = Self::open(path)?;
        Ok((wal, events))
    }

    /// Read every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Returns the events and the byte length of the valid prefix (`None`
    /// when the file does not exist).
    fn scan(path: &Path) -> io::Result<(Vec<Event>, Option<u64>)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 8];
        if !read_exact_or_eof(&mut reader, &mut header)? {
            // Crashed while writing the header of a fresh log.
            return Ok((Vec::new(), Some(0)));
        }
        if &header != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not an easyslot WAL", path.display()),
            ));
        }

        let mut events = Vec::new();
        let mut offset = MAGIC.len() as u64;
        loop {
            match read_record(&mut reader)? {
                (Record::Event(event), size) => {
                    events.push(event);
                    offset += size;
                }
                (Record::End, _) => break,
                (Record::Torn, _) => {
                    warn!(
                        path = %path.display(),
                        offset,
                        "WAL record torn or corrupt; ignoring the rest"
                    );
                    break;
                }
            }
        }
        Ok((events, Some(offset)))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL has an unrecoverable partial write"));
        }
        self.unsynced += 1;
        encode_event(&mut self.writer, event)
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact += self.unsynced;
        self.unsynced = 0;
        Ok(())
    }

    /// Throw away everything since the last successful [`Wal::flush_sync`],
    /// both the buffer and any bytes already handed to the file. If the file
    /// cannot be cut back the log refuses further appends.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        self.unsynced = 0;
        let result = self.truncate_to_synced();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        // `into_parts` drops the buffered bytes without writing them.
        let _ = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a fresh log holding just `events` next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let mut file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.synced_len = file.seek(SeekFrom::End(0))?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use ulid::Ulid;

    use super::*;
    use crate::model::DateSpecificOverride;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("easyslot_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(name: &str) -> Event {
        Event::ProviderCreated {
            id: Ulid::new(),
            name: Some(name.into()),
        }
    }

    fn override_event(provider_id: Ulid, day: u32) -> Event {
        Event::OverrideUpserted {
            entry: DateSpecificOverride {
                provider_id,
                date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
                start: 600,
                end: 720,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let provider = created("Dr. Ames");
        let pid = provider.provider_id();
        let events = vec![provider, override_event(pid, 4)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn fresh_log_starts_with_header() {
        let path = tmp_path("header.wal");
        drop(Wal::open(&path).unwrap());
        assert_eq!(fs::read(&path).unwrap(), MAGIC.to_vec());
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn foreign_file_is_rejected() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP\x01\x0e\x00 not a wal").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn recover_truncates_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let first = created("Front desk");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let second = created("Back office");
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&second).unwrap();
        }

        // Without the truncation the second record would sit behind garbage.
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let path = tmp_path("corrupt_crc.wal");
        let good = created("kept");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::ProviderDeleted { id: Ulid::new() }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let provider = created("Dr. Ames");
        let pid = provider.provider_id();

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&provider).unwrap();
        for day in 1..=20 {
            wal.append(&override_event(pid, day)).unwrap();
            wal.append(&Event::OverrideRemoved {
                provider_id: pid,
                date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            })
            .unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&provider)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = override_event(pid, 25);
        wal.append(&later).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![provider, later]);
    }

    #[test]
    fn discarded_batch_leaves_no_bytes_behind() {
        let path = tmp_path("discard_unsynced.wal");
        let first = created("kept");
        let dropped = created("dropped");
        let later = created("later");

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&first).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        // Bytes of a batch that reached the file but never got its fsync.
        wal.append_buffered(&dropped).unwrap();
        wal.writer.flush().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > synced);

        wal.discard_unsynced().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        wal.append(&later).unwrap();
        assert_eq!(wal.appends_since_compact(), 2);
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }

    #[test]
    fn buffered_only_batch_is_discarded() {
        let path = tmp_path("discard_buffered.wal");
        let first = created("kept");

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&first).unwrap();
        wal.append_buffered(&created("dropped")).unwrap();
        wal.discard_unsynced().unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|i| created(&format!("p{i}"))).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
