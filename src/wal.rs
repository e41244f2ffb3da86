use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload a frame may carry. A length word above this is treated as
/// a corrupt header rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes a frame adds around its payload: length word and checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("event of {} bytes exceeds the frame limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Outcome of reading one frame during replay.
enum Frame {
    /// An intact event and the number of bytes its frame occupies.
    Event(Event, u64),
    /// Clean end of file, or a torn/corrupt tail left by a crash mid-write.
    End,
}

/// `read_exact` that maps a short read to `None`.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if read_or_eof(reader, &mut word)?.is_none() {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::End);
    }
    let mut payload = vec![0u8; len];
    if read_or_eof(reader, &mut payload)?.is_none() {
        return Ok(Frame::End);
    }
    if read_or_eof(reader, &mut word)?.is_none() {
        return Ok(Frame::End);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::End);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .map(|event| Frame::Event(event, len as u64 + FRAME_OVERHEAD))
        .unwrap_or(Frame::End))
}

/// Intact events and the length of the prefix of the file they occupy.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact = 0u64;
    while let Frame::Event(event, len) = read_frame(&mut reader)? {
        events.push(event);
        intact += len;
    }
    Ok((events, intact))
}

/// Append-only write-ahead log for one business.
///
/// Replay stops at the first frame that is short or fails its checksum, and
/// [`Wal::recover`] cuts that tail off before new appends land. A batch that
/// fails to reach disk is rolled back, so an error always means nothing from
/// the batch survives a restart.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful fsync.
    synced_len: u64,
    /// Frames buffered or written since that fsync.
    pending: u64,
    /// Set while a rollback has failed to restore `synced_len`; writes are
    /// refused until a later rollback or compaction succeeds.
    poisoned: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = Self::open_append(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            pending: 0,
            poisoned: false,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("wal is poisoned by a failed rollback"));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.check_writable()?;
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        self.pending += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_writable()?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.pending = 0;
        Ok(())
    }

    /// Drop every frame appended since the last successful
    /// [`Wal::flush_sync`], both from the buffer and from the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.appends_since_compact -= self.pending;
        self.pending = 0;
        let result = self.truncate_to_synced();
        self.poisoned = result.is_err();
        result
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(Self::open_append(&self.path)?);
        // `into_parts` hands back the unwritten buffer instead of flushing it.
        let (file, _unwritten) = mem::replace(&mut self.writer, fresh).into_parts();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted event list next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = Self::open_append(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending = 0;
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

    /// Every intact event in the log, in append order. A missing file is an
    /// empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(read_log(path)?.0)
    }

    /// Like [`Wal::replay`], then truncate the file to its intact prefix so
    /// the next append does not land behind a torn frame.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact) = read_log(path)?;
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        if len > intact {
            tracing::warn!(
                "discarding {} byte(s) of torn wal tail in {}",
                len - intact,
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Service, Span, TimeBlock};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn service(id: Ulid) -> Event {
        Event::ServiceCreated {
            service: Service {
                id,
                name: "Corte".into(),
                duration_minutes: 30,
                capacity: 1,
                price_cents: Some(5000),
                requires_payment: false,
                active: true,
            },
        }
    }

    fn block(id: Ulid, start: i64) -> Event {
        Event::TimeBlockAdded {
            block: TimeBlock {
                id,
                title: "Almoço".into(),
                span: Span::new(start, start + 3_600_000),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![service(Ulid::new()), block(Ulid::new(), 1_000)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let event = service(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let first = Event::ServiceDeleted { id: Ulid::new() };
        let second = Event::ClientDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let payload = bincode::serialize(&second).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_shrinks_log_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let service_id = Ulid::new();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&service(service_id)).unwrap();
        for i in 0..20 {
            let id = Ulid::new();
            wal.append(&block(id, i * 10_000_000)).unwrap();
            wal.append(&Event::TimeBlockRemoved { id }).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        assert_eq!(wal.appends_since_compact(), 41);

        wal.compact(&[service(service_id)]).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "{after} < {before}");

        let late = block(Ulid::new(), 5_000);
        wal.append(&late).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![service(service_id), late]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_land_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| service(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_new_appends() {
        let path = tmp_path("recover.wal");
        let first = service(Ulid::new());
        let second = block(Ulid::new(), 2_000);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[3u8; 7]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_missing_file_is_empty_log() {
        let path = tmp_path("recover_missing.wal");
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn oversized_length_word_ends_replay() {
        let path = tmp_path("oversized.wal");
        let first = service(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 32]).unwrap();
        }
        assert_eq!(Wal::recover(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_unsynced_frames() {
        let path = tmp_path("rollback.wal");
        let kept = service(Ulid::new());
        let later = block(Ulid::new(), 9_000);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        // Enough frames to spill past the write buffer onto the file.
        for i in 0..2_000 {
            wal.append_buffered(&block(Ulid::new(), i * 10_000)).unwrap();
        }
        assert!(fs::metadata(&path).unwrap().len() > synced);
        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        assert_eq!(wal.appends_since_compact(), 1);

        wal.append(&later).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }
}
