//! File-backed ordered map.

use crate::error::{Result, StoreError};
use fs2::FileExt;
use lru::LruCache;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes for mirror files.
const MIRROR_MAGIC: &[u8; 4] = b"MIR\0";

/// Current mirror format version.
const MIRROR_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Longest key accepted.
const MAX_KEY_LEN: usize = 64 * 1024;

/// Where the latest record of a key lives.
#[derive(Clone, Copy, Debug)]
struct Location {
    /// Offset of the record start.
    offset: u64,
    value_len: u64,
}

/// How a record scan ended.
enum ScanStop {
    /// Clean end of file.
    End,
    /// Incomplete or damaged record at the tail, to be truncated.
    TornTail(String),
}

/// Durable string-keyed map of raw values.
///
/// Records are appended to a single log file and fsynced before `put`
/// returns; the newest record of a key wins. Opening rebuilds the ordered
/// index by scanning the log. The file is held under an exclusive lock, and
/// all methods take `&mut self`, so there is exactly one writer.
pub struct MirrorStore {
    path: PathBuf,
    file: Option<File>,
    lock_file: Option<File>,
    index: BTreeMap<String, Location>,
    file_size: u64,
    cache: LruCache<String, Vec<u8>>,
}

impl MirrorStore {
    /// Open or create the mirror at `path`.
    pub fn open(path: impl AsRef<Path>, cache_entries: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(&path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (index, file_size) = if len == 0 {
            file.write_all(MIRROR_MAGIC)?;
            file.write_all(&[MIRROR_VERSION])?;
            file.sync_all()?;
            (BTreeMap::new(), HEADER_SIZE)
        } else {
            Self::verify_header(&mut file)?;
            Self::rebuild_index(&mut file, len)?
        };

        info!(path = %path.display(), keys = index.len(), "mirror opened");

        let cache_entries = NonZeroUsize::new(cache_entries.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            file: Some(file),
            lock_file: Some(lock_file),
            index,
            file_size,
            cache: LruCache::new(cache_entries),
        })
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// The record is on disk when this returns.
    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::InvalidFormat(format!(
                "key of {} bytes exceeds {} bytes",
                key.len(),
                MAX_KEY_LEN
            )));
        }

        let offset = self.file_size;
        let record = encode_record(key, value);
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;

        let written = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(&record))
            .and_then(|_| file.sync_all());
        if let Err(e) = written {
            // Drop the partial record so later appends stay readable.
            if let Err(trunc) = file.set_len(offset) {
                warn!(path = %self.path.display(), error = %trunc, "failed to roll back partial mirror write");
            }
            return Err(e.into());
        }

        self.file_size = offset + record.len() as u64;
        self.index.insert(
            key.to_string(),
            Location {
                offset,
                value_len: value.len() as u64,
            },
        );
        self.cache.put(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Read the value stored under `key`.
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.file.is_none() {
            return Err(StoreError::Closed);
        }
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value.clone()));
        }
        let Some(location) = self.index.get(key).copied() else {
            return Ok(None);
        };

        let remaining = self.file_size - location.offset;
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let (stored_key, value) = read_record(&mut *file, remaining)?
            .ok_or_else(|| StoreError::InvalidFormat(format!("record for {key} is truncated")))?;
        if stored_key != key || value.len() as u64 != location.value_len {
            return Err(StoreError::InvalidFormat(format!(
                "index entry for {key} does not match the record on disk"
            )));
        }

        self.cache.put(key.to_string(), value.clone());
        Ok(Some(value))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Stored keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes used by the log file.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Release the file and its lock. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        self.cache.clear();
        let synced = file.sync_all();
        drop(file);
        if let Some(lock_file) = self.lock_file.take() {
            let _ = lock_file.unlock();
        }
        debug!(path = %self.path.display(), "mirror closed");
        synced.map_err(StoreError::from)
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        path.with_file_name(name)
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(Self::lock_path(path))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }

    fn verify_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| StoreError::InvalidFormat("Mirror header truncated".into()))?;
        if &magic != MIRROR_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid mirror magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)
            .map_err(|_| StoreError::InvalidFormat("Mirror header truncated".into()))?;
        if version[0] != MIRROR_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported mirror version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    /// Scan every record, keeping the newest location per key.
    ///
    /// A record cut short by the end of the file is a write torn by a crash
    /// and is cut off, as is a bad body checksum on the last record. A bad
    /// header or a bad body followed by more data is corruption and fails
    /// the open without touching the file.
    fn rebuild_index(file: &mut File, len: u64) -> Result<(BTreeMap<String, Location>, u64)> {
        let mut index = BTreeMap::new();
        let mut reader = BufReader::new(&mut *file);
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut offset = HEADER_SIZE;

        let stop = loop {
            if offset == len {
                break ScanStop::End;
            }
            match read_record(&mut reader, len - offset) {
                Ok(Some((key, value))) => {
                    let value_len = value.len() as u64;
                    index.insert(key.clone(), Location { offset, value_len });
                    offset += record_len(key.len(), value.len());
                }
                Ok(None) => break ScanStop::TornTail("incomplete record".into()),
                Err(StoreError::ChecksumMismatch { expected, got }) => {
                    let end = reader.stream_position()?;
                    if end < len {
                        return Err(StoreError::ChecksumMismatch { expected, got });
                    }
                    break ScanStop::TornTail("checksum mismatch".into());
                }
                Err(e) => return Err(e),
            }
        };
        drop(reader);

        if let ScanStop::TornTail(reason) = stop {
            warn!(
                offset,
                dropped = len - offset,
                reason = %reason,
                "truncating torn mirror tail"
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }

        Ok((index, offset))
    }
}

impl Drop for MirrorStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.close();
    }
}

/// Size of the fixed record header: key length, value length, header CRC.
const RECORD_HEADER_SIZE: usize = 4 + 8 + 4;

/// Size of an encoded record.
fn record_len(key_len: usize, value_len: usize) -> u64 {
    (RECORD_HEADER_SIZE + key_len + value_len + 4) as u64
}

/// Encode one record: key length, value length, CRC32 of both lengths, key,
/// value, CRC32 of key and value.
fn encode_record(key: &str, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record_len(key.len(), value.len()) as usize);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
    let header_checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&header_checksum.to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(value);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf
}

/// Read one record. `Ok(None)` means the data ends mid-record.
///
/// `remaining` is the number of bytes left from the record start. Lengths
/// are only trusted once the header checksum matches, so a damaged length
/// field is an error rather than a short record.
fn read_record(reader: &mut impl Read, remaining: u64) -> Result<Option<(String, Vec<u8>)>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    if !read_full(reader, &mut header)? {
        return Ok(None);
    }

    let (lengths, checksum_bytes) = header.split_at(12);
    let stored_header_checksum = u32::from_le_bytes([
        checksum_bytes[0],
        checksum_bytes[1],
        checksum_bytes[2],
        checksum_bytes[3],
    ]);
    let computed_header_checksum = crc32fast::hash(lengths);
    if stored_header_checksum != computed_header_checksum {
        return Err(StoreError::InvalidFormat(format!(
            "record header checksum mismatch: expected {stored_header_checksum:#010x}, got {computed_header_checksum:#010x}"
        )));
    }

    let mut key_len_bytes = [0u8; 4];
    key_len_bytes.copy_from_slice(&lengths[..4]);
    let key_len = u32::from_le_bytes(key_len_bytes) as usize;
    let mut value_len_bytes = [0u8; 8];
    value_len_bytes.copy_from_slice(&lengths[4..]);
    let value_len = u64::from_le_bytes(value_len_bytes);

    if key_len > MAX_KEY_LEN {
        return Err(StoreError::InvalidFormat(format!(
            "record key of {key_len} bytes exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    let claimed = (RECORD_HEADER_SIZE + key_len + 4) as u64;
    if claimed.saturating_add(value_len) > remaining {
        return Ok(None);
    }

    let mut key = vec![0u8; key_len];
    if !read_full(reader, &mut key)? {
        return Ok(None);
    }

    let mut value = vec![0u8; value_len as usize];
    if !read_full(reader, &mut value)? {
        return Ok(None);
    }

    let mut checksum_bytes = [0u8; 4];
    if !read_full(reader, &mut checksum_bytes)? {
        return Ok(None);
    }
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key);
    hasher.update(&value);
    let computed_checksum = hasher.finalize();
    if stored_checksum != computed_checksum {
        return Err(StoreError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let key = String::from_utf8(key)
        .map_err(|_| StoreError::InvalidFormat("mirror key is not UTF-8".into()))?;
    Ok(Some((key, value)))
}

/// `read_exact` that reports a short read as `false`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> MirrorStore {
        MirrorStore::open(dir.path().join("mirror"), 4).unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let mut mirror = open(&dir);

        mirror.put("T two", b"small").unwrap();
        assert_eq!(mirror.get("T two").unwrap().as_deref(), Some(&b"small"[..]));
        assert_eq!(mirror.get("missing").unwrap(), None);
        assert!(mirror.contains("T two"));
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let mut mirror = open(&dir);

        mirror.put("k", b"first").unwrap();
        mirror.put("k", b"second").unwrap();
        mirror.put("k", b"").unwrap();
        assert_eq!(mirror.get("k").unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let big = vec![0xabu8; 500_000];
        {
            let mut mirror = open(&dir);
            mirror.put("b", b"bee").unwrap();
            mirror.put("a", &big).unwrap();
            mirror.put("b", b"bee2").unwrap();
            mirror.close().unwrap();
        }

        let mut mirror = open(&dir);
        assert_eq!(mirror.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(mirror.get("a").unwrap(), Some(big));
        assert_eq!(mirror.get("b").unwrap().as_deref(), Some(&b"bee2"[..]));
    }

    #[test]
    fn test_reads_bypassing_cache() {
        let dir = TempDir::new().unwrap();
        let mut mirror = open(&dir);
        for i in 0..10 {
            mirror.put(&format!("k{i}"), format!("v{i}").as_bytes()).unwrap();
        }
        // Cache holds 4 entries, so early keys come from disk.
        for i in 0..10 {
            assert_eq!(
                mirror.get(&format!("k{i}")).unwrap(),
                Some(format!("v{i}").into_bytes())
            );
        }
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mirror");
        {
            let mut mirror = MirrorStore::open(&path, 4).unwrap();
            mirror.put("kept", b"value").unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();

        // Half a record, as if the process died mid-append.
        let partial = encode_record("lost", b"never finished");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let mut mirror = MirrorStore::open(&path, 4).unwrap();
        assert_eq!(mirror.get("kept").unwrap().as_deref(), Some(&b"value"[..]));
        assert!(!mirror.contains("lost"));
        assert_eq!(mirror.file_size(), good_len);

        // Appends after recovery are readable after another reopen.
        mirror.put("after", b"crash").unwrap();
        mirror.close().unwrap();
        let mut mirror = MirrorStore::open(&path, 4).unwrap();
        assert_eq!(mirror.get("after").unwrap().as_deref(), Some(&b"crash"[..]));
    }

    #[test]
    fn test_corruption_in_middle_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mirror");
        {
            let mut mirror = MirrorStore::open(&path, 4).unwrap();
            mirror.put("first", b"aaaa").unwrap();
            mirror.put("second", b"bbbb").unwrap();
        }

        // Flip a value byte of the first record.
        let mut bytes = fs::read(&path).unwrap();
        let value_at = HEADER_SIZE as usize + RECORD_HEADER_SIZE + "first".len();
        bytes[value_at] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            MirrorStore::open(&path, 4),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_damaged_length_field_is_not_a_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mirror");
        {
            let mut mirror = MirrorStore::open(&path, 4).unwrap();
            mirror.put("first", b"aaaa").unwrap();
            mirror.put("second", b"bbbb").unwrap();
            mirror.put("third", b"cccc").unwrap();
        }
        let size_before = fs::metadata(&path).unwrap().len();

        // High byte of the first record's value length.
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE as usize + 4 + 7] = 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            MirrorStore::open(&path, 4),
            Err(StoreError::InvalidFormat(_))
        ));
        assert_eq!(fs::metadata(&path).unwrap().len(), size_before);

        // Same for the key length of a later record.
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE as usize + 4 + 7] = 0;
        let second_at = HEADER_SIZE + record_len("first".len(), 4);
        bytes[second_at as usize] = 0xee;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            MirrorStore::open(&path, 4),
            Err(StoreError::InvalidFormat(_))
        ));
        assert_eq!(fs::metadata(&path).unwrap().len(), size_before);
    }

    #[test]
    fn test_torn_tail_with_complete_header_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mirror");
        {
            let mut mirror = MirrorStore::open(&path, 4).unwrap();
            mirror.put("kept", b"value").unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();

        // Header and key made it to disk, the value did not.
        let partial = encode_record("lost", &[7u8; 1000]);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..RECORD_HEADER_SIZE + 4 + 10]).unwrap();
        drop(file);

        let mirror = MirrorStore::open(&path, 4).unwrap();
        assert!(!mirror.contains("lost"));
        assert_eq!(mirror.file_size(), good_len);
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mirror");
        fs::write(&path, b"not a mirror").unwrap();

        assert!(matches!(
            MirrorStore::open(&path, 4),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_second_opener_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let mut first = open(&dir);

        assert!(matches!(
            MirrorStore::open(dir.path().join("mirror"), 4),
            Err(StoreError::Locked)
        ));

        first.close().unwrap();
        let second = MirrorStore::open(dir.path().join("mirror"), 4);
        assert!(second.is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut mirror = open(&dir);
        mirror.put("k", b"v").unwrap();

        mirror.close().unwrap();
        mirror.close().unwrap();
        assert!(mirror.is_closed());
        assert!(matches!(mirror.put("k", b"v"), Err(StoreError::Closed)));
        assert!(matches!(mirror.get("k"), Err(StoreError::Closed)));
    }
}
