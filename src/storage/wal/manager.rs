//! File-backed WAL sink.
//!
//! Records are buffered in memory and appended to the current WAL file as
//! length-prefixed bincode frames. A new file is started once the current one
//! would grow past `max_file_size`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use super::record::{DeltaRecord, Lsn, WalRecord};
use super::WalSink;
use crate::storage::error::{StorageError, StorageResult};

/// Size of the WAL buffer in bytes (1MB).
const WAL_BUFFER_SIZE: usize = 1024 * 1024;

const WAL_FILE_PREFIX: &str = "wal_";
const WAL_FILE_EXTENSION: &str = ".log";

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory where WAL files are stored.
    pub wal_dir: PathBuf,
    /// Maximum size of a single WAL file in bytes.
    pub max_file_size: u64,
    /// Whether `flush` also fsyncs the file.
    pub sync_on_flush: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            wal_dir: PathBuf::from("wal"),
            max_file_size: 64 * 1024 * 1024,
            sync_on_flush: true,
        }
    }
}

struct WalFile {
    file: BufWriter<File>,
    size: u64,
}

impl WalFile {
    fn create(path: PathBuf) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;

        Ok(WalFile {
            file: BufWriter::new(file),
            size: 0,
        })
    }

    fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.get_mut().sync_all()?;
        Ok(())
    }
}

struct WalState {
    buffer: Vec<u8>,
    /// Highest LSN appended to `buffer`.
    buffered_lsn: u64,
    file: WalFile,
    file_seq: u64,
}

pub struct WalManager {
    config: WalConfig,
    current_lsn: AtomicU64,
    flush_lsn: AtomicU64,
    state: Mutex<WalState>,
}

impl WalManager {
    /// Creates the WAL directory if needed and starts a new WAL file in it.
    pub fn new(config: WalConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.wal_dir)?;

        let existing = list_wal_files(&config.wal_dir)?;
        let file_seq = existing
            .iter()
            .filter_map(|p| file_seq_of(p))
            .max()
            .map_or(0, |s| s + 1);
        let file = WalFile::create(wal_file_path(&config.wal_dir, file_seq))?;

        Ok(WalManager {
            config,
            current_lsn: AtomicU64::new(0),
            flush_lsn: AtomicU64::new(0),
            state: Mutex::new(WalState {
                buffer: Vec::with_capacity(WAL_BUFFER_SIZE),
                buffered_lsn: 0,
                file,
                file_seq,
            }),
        })
    }

    pub fn current_lsn(&self) -> Lsn {
        Lsn(self.current_lsn.load(Ordering::SeqCst))
    }

    /// All records up to this LSN reached the WAL file.
    pub fn flush_lsn(&self) -> Lsn {
        Lsn(self.flush_lsn.load(Ordering::SeqCst))
    }

    /// Appends a record to the buffer, writing the buffer out first if the
    /// record would not fit.
    pub fn write_record(&self, record: &WalRecord) -> StorageResult<()> {
        let serialized = record.serialize()?;

        let mut state = self.state.lock();
        if state.buffer.len() + 4 + serialized.len() > WAL_BUFFER_SIZE {
            self.flush_buffer(&mut state)?;
        }
        state
            .buffer
            .extend_from_slice(&(serialized.len() as u32).to_le_bytes());
        state.buffer.extend_from_slice(&serialized);
        state.buffered_lsn = state.buffered_lsn.max(record.lsn.0);
        Ok(())
    }

    /// Writes buffered records to the WAL file.
    pub fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.flush_buffer(&mut state)?;
        if self.config.sync_on_flush {
            state.file.sync()?;
        }
        Ok(())
    }

    fn flush_buffer(&self, state: &mut WalState) -> StorageResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        if state.file.size > 0
            && state.file.size + state.buffer.len() as u64 > self.config.max_file_size
        {
            state.file.flush()?;
            state.file.sync()?;
            state.file_seq += 1;
            state.file = WalFile::create(wal_file_path(&self.config.wal_dir, state.file_seq))?;
            debug!("Rotated WAL to file #{}", state.file_seq);
        }

        let WalState { buffer, file, .. } = &mut *state;
        file.write(buffer)?;
        file.flush()?;
        buffer.clear();

        self.flush_lsn.store(state.buffered_lsn, Ordering::SeqCst);
        Ok(())
    }

    /// Reads every record of one WAL file.
    pub fn read_records_from_file(path: &Path) -> StorageResult<Vec<WalRecord>> {
        let mut file = File::open(path)?;
        let mut records = Vec::new();

        loop {
            let mut size_bytes = [0u8; 4];
            match file.read_exact(&mut size_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(StorageError::Io(e)),
            }

            let size = u32::from_le_bytes(size_bytes) as usize;
            let mut record_data = vec![0u8; size];
            file.read_exact(&mut record_data)?;
            records.push(WalRecord::deserialize(&record_data)?);
        }

        Ok(records)
    }

    /// WAL files of this manager's directory, oldest first.
    pub fn wal_files(&self) -> StorageResult<Vec<PathBuf>> {
        list_wal_files(&self.config.wal_dir)
    }
}

impl WalSink for WalManager {
    fn log(&self, record: DeltaRecord) -> StorageResult<Lsn> {
        // LSN assignment and buffering happen under one lock so the file
        // order matches LSN order.
        let mut state = self.state.lock();
        let lsn = Lsn(self.current_lsn.fetch_add(1, Ordering::SeqCst) + 1);
        let serialized = WalRecord::new(lsn, record).serialize()?;
        if state.buffer.len() + 4 + serialized.len() > WAL_BUFFER_SIZE {
            self.flush_buffer(&mut state)?;
        }
        state
            .buffer
            .extend_from_slice(&(serialized.len() as u32).to_le_bytes());
        state.buffer.extend_from_slice(&serialized);
        state.buffered_lsn = lsn.0;
        Ok(lsn)
    }
}

fn wal_file_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{}{:020}{}", WAL_FILE_PREFIX, seq, WAL_FILE_EXTENSION))
}

fn file_seq_of(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(WAL_FILE_PREFIX)?
        .strip_suffix(WAL_FILE_EXTENSION)?
        .parse()
        .ok()
}

fn list_wal_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if file_seq_of(&path).is_some() {
            files.push(path);
        }
    }
    // Zero-padded sequence numbers sort by name.
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageId;
    use anyhow::Result;
    use tempfile::TempDir;

    fn create_test_wal_manager(max_file_size: u64) -> Result<(WalManager, TempDir)> {
        let temp_dir = TempDir::new()?;
        let config = WalConfig {
            wal_dir: temp_dir.path().to_path_buf(),
            max_file_size,
            sync_on_flush: false,
        };
        Ok((WalManager::new(config)?, temp_dir))
    }

    fn insert(idx: u16) -> DeltaRecord {
        DeltaRecord::Insert {
            page_id: PageId(10),
            idx,
            item: vec![idx as u8; 16],
            right_id: PageId::NONE,
        }
    }

    #[test]
    fn test_log_and_read_back() -> Result<()> {
        let (manager, _temp_dir) = create_test_wal_manager(1024 * 1024)?;

        let lsn1 = manager.log(insert(0))?;
        let lsn2 = manager.log(DeltaRecord::MetaPageCutRoot { page_id: PageId(1) })?;
        assert_eq!(lsn1, Lsn(1));
        assert_eq!(lsn2, Lsn(2));
        assert_eq!(manager.flush_lsn(), Lsn(0));

        manager.flush()?;
        assert_eq!(manager.flush_lsn(), manager.current_lsn());

        let files = manager.wal_files()?;
        assert_eq!(files.len(), 1);
        let records = WalManager::read_records_from_file(&files[0])?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], WalRecord::new(lsn1, insert(0)));
        assert_eq!(records[1].lsn, lsn2);
        Ok(())
    }

    #[test]
    fn test_write_record_keeps_given_lsn() -> Result<()> {
        let (manager, _temp_dir) = create_test_wal_manager(1024 * 1024)?;
        let record = WalRecord::new(Lsn(42), insert(1));
        manager.write_record(&record)?;
        manager.flush()?;

        let files = manager.wal_files()?;
        assert_eq!(WalManager::read_records_from_file(&files[0])?, vec![record]);
        Ok(())
    }

    #[test]
    fn test_file_rotation() -> Result<()> {
        let (manager, _temp_dir) = create_test_wal_manager(256)?;

        for i in 0..100 {
            manager.log(insert(i))?;
            if i % 10 == 0 {
                manager.flush()?;
            }
        }
        manager.flush()?;

        let files = manager.wal_files()?;
        assert!(files.len() > 1);

        let mut total = 0;
        let mut last = Lsn(0);
        for file in &files {
            for record in WalManager::read_records_from_file(file)? {
                assert!(record.lsn > last);
                last = record.lsn;
                total += 1;
            }
        }
        assert_eq!(total, 100);
        Ok(())
    }

    #[test]
    fn test_new_manager_continues_file_sequence() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = WalConfig {
            wal_dir: temp_dir.path().to_path_buf(),
            max_file_size: 1024,
            sync_on_flush: false,
        };
        {
            let manager = WalManager::new(config.clone())?;
            manager.log(insert(0))?;
            manager.flush()?;
        }
        let manager = WalManager::new(config)?;
        let files = manager.wal_files()?;
        assert_eq!(files.len(), 2);
        assert_eq!(WalManager::read_records_from_file(&files[0])?.len(), 1);
        Ok(())
    }
}
