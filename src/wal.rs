use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// One committed transaction: its events, applied in order, all or none.
pub type Record = Vec<Event>;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// The transaction log behind the store.
///
/// Each record is framed as `[u32 len][bincode Vec<Event>][u32 crc32]`, little-endian,
/// with `len` counting payload bytes only. A record that fails the length or checksum
/// test on replay ends the log there, so a transaction comes back whole or not at all.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Write one record and fsync it. The writer task batches with
    /// `append_buffered` and `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, record: &[Event]) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, record: &[Event]) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log next to the live one (`.wal.tmp`), synced.
    pub fn write_compact_file(path: &Path, records: &[Record]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the compacted file over the log and start appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the log from disk, returning every complete record in order.
    /// A torn or corrupt tail (crash mid-write) ends the replay and is cut off
    /// the file, so records appended afterwards follow the last good one.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut good_len: u64 = 0;
        loop {
            match read_record(&mut reader)? {
                Next::Record(record, size) => {
                    records.push(record);
                    good_len += size;
                }
                Next::End => break,
                Next::Torn(reason) => {
                    tracing::warn!(
                        path = %path.display(),
                        kept = records.len(),
                        offset = good_len,
                        "discarding WAL tail: {reason}"
                    );
                    drop(reader);
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(good_len)?;
                    file.sync_all()?;
                    break;
                }
            }
        }
        Ok(records)
    }
}

/// Upper bound on one encoded transaction; anything larger is a corrupt length prefix.
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

enum Next {
    /// A decoded record and its size on disk, framing included.
    Record(Record, u64),
    End,
    Torn(&'static str),
}

/// Fill `buf`, or report `Ok(false)` if the file ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Next> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(Next::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(Next::Torn("record length out of range"));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut crc_buf)? {
        return Ok(Next::Torn("truncated record"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Next::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Record>(&payload) {
        Ok(record) => Ok(Next::Record(record, len as u64 + 8)),
        Err(_) => Ok(Next::Torn("undecodable record")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn fresh(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("kitroom_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn write_log(path: &Path, records: &[Record]) {
        let mut wal = Wal::open(path).unwrap();
        for record in records {
            wal.append(record).unwrap();
        }
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    fn location() -> Event {
        Event::LocationRegistered {
            location: Location {
                id: Ulid::new(),
                name: "Media Lab".into(),
            },
        }
    }

    /// Ledger side of a cable reservation that was later cancelled.
    fn cable_reservation(key: SlotKey, units: u32) -> Record {
        vec![
            Event::StockTaken { key, quantity: units },
            Event::LoanCancelled { loan_id: Ulid::new() },
            Event::StockReleased { key, quantity: units },
        ]
    }

    #[test]
    fn records_come_back_in_commit_order() {
        let path = fresh("order.wal");
        let key = SlotKey::new(Ulid::new(), Ulid::new());
        let records = vec![
            vec![location()],
            vec![Event::StockTotalSet { key, total: 10 }],
            cable_reservation(key, 4),
        ];
        write_log(&path, &records);
        assert_eq!(Wal::replay(&path).unwrap(), records);
    }

    #[test]
    fn missing_log_is_empty() {
        let path = fresh("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn short_garbage_tail_is_dropped() {
        let path = fresh("garbage_tail.wal");
        let committed = vec![location()];
        write_log(&path, std::slice::from_ref(&committed));
        append_raw(&path, &[0u8; 6]);
        assert_eq!(Wal::replay(&path).unwrap(), vec![committed]);
    }

    #[test]
    fn records_after_a_torn_tail_survive_the_next_replay() {
        let path = fresh("append_after_tear.wal");
        let first = vec![location()];
        write_log(&path, std::slice::from_ref(&first));
        let good_len = fs::metadata(&path).unwrap().len();
        append_raw(&path, &[200, 0, 0, 0, 1, 2, 3]);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        let later = vec![location()];
        write_log(&path, std::slice::from_ref(&later));
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }

    #[test]
    fn half_written_transaction_is_dropped_whole() {
        let path = fresh("half_written.wal");
        let key = SlotKey::new(Ulid::new(), Ulid::new());
        let first = vec![Event::StockTotalSet { key, total: 10 }];
        write_log(&path, &[first.clone(), cable_reservation(key, 3)]);

        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 5).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn oversized_length_prefix_ends_replay() {
        let path = fresh("oversized.wal");
        write_log(&path, &[vec![location()]]);
        append_raw(&path, &u32::MAX.to_le_bytes());
        append_raw(&path, &[1, 2, 3]);
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn checksum_mismatch_ends_replay() {
        let path = fresh("bad_crc.wal");
        let payload = bincode::serialize(&vec![location()]).unwrap();
        let mut f = File::create(&path).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&payload).unwrap();
        f.write_all(&(crc32fast::hash(&payload) ^ 1).to_le_bytes()).unwrap();
        drop(f);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compaction_shrinks_log_and_keeps_appending() {
        let path = fresh("compact.wal");
        let key = SlotKey::new(Ulid::new(), Ulid::new());
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&[Event::StockTotalSet { key, total: 10 }]).unwrap();
        for _ in 0..10 {
            wal.append(&cable_reservation(key, 2)).unwrap();
            wal.append(&[Event::StockReleased { key, quantity: 2 }]).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 21);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![vec![Event::StockTotalSet { key, total: 10 }]];
        Wal::write_compact_file(wal.path(), &snapshot).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = cable_reservation(key, 1);
        wal.append(&later).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
    }

    #[test]
    fn buffered_records_land_after_flush() {
        let path = fresh("buffered.wal");
        let key = SlotKey::new(Ulid::new(), Ulid::new());
        let records: Vec<Record> = (1..=5).map(|n| cable_reservation(key, n)).collect();

        let mut wal = Wal::open(&path).unwrap();
        for record in &records {
            wal.append_buffered(record).unwrap();
        }
        wal.flush_sync().unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), records);
    }
}
