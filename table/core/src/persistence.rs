//! Streaming persistence boundary.
//!
//! A table is saved and loaded through a [`KvFile`]: a sink/source of
//! `(key, value vector, meta)` triples moved in chunks. Adapters may accept
//! or return fewer entries than asked for; the table keeps calling until the
//! chunk is done (save) or the source returns zero entries (load).
//!
//! Two adapters are provided:
//!
//! - [`MemoryKvFile`] keeps triples in vectors and can cap how many entries
//!   each call moves.
//! - [`LocalKvFile`] streams to three flat files next to each other:
//!   `<base>.keys`, `<base>.values` and `<base>.metas`.
//!
//! # LocalKvFile layout
//!
//! ```text
//! <base>.keys    KvFileHeader (64 bytes) | key 0 | key 1 | ...
//! <base>.values  vector 0 (dim elements) | vector 1 | ...
//! <base>.metas   meta 0 | meta 1 | ...
//! ```
//!
//! All elements are written in native byte order.

use crate::element::{Key, Meta, Value, value_bytes, value_bytes_mut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Chunked source and sink of table entries.
///
/// `values` buffers hold `dim` elements per entry.
pub trait KvFile<K, V, M> {
    /// Read up to `n` entries into the output buffers.
    ///
    /// Returns the number of entries read. Zero means the stream is exhausted.
    fn read(
        &mut self,
        n: usize,
        keys: &mut [K],
        values: &mut [V],
        metas: &mut [M],
    ) -> io::Result<usize>;

    /// Write up to `n` entries from the input buffers.
    ///
    /// Returns the number of leading entries accepted.
    fn write(&mut self, n: usize, keys: &[K], values: &[V], metas: &[M]) -> io::Result<usize>;
}

/// In-memory [`KvFile`].
#[derive(Debug, Clone)]
pub struct MemoryKvFile<K, V, M> {
    dim: usize,
    keys: Vec<K>,
    values: Vec<V>,
    metas: Vec<M>,
    cursor: usize,
    max_per_call: Option<usize>,
}

impl<K: Copy, V: Copy, M: Copy> MemoryKvFile<K, V, M> {
    /// Create an empty file for vectors of `dim` elements.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            keys: Vec::new(),
            values: Vec::new(),
            metas: Vec::new(),
            cursor: 0,
            max_per_call: None,
        }
    }

    /// Move at most `max` entries per `read`/`write` call.
    pub fn with_max_per_call(mut self, max: usize) -> Self {
        self.max_per_call = Some(max);
        self
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Stored keys.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Stored vectors, `dim` elements each.
    pub fn values(&self) -> &[V] {
        &self.values
    }

    /// Stored metas.
    pub fn metas(&self) -> &[M] {
        &self.metas
    }

    /// Restart reading from the first entry.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn limit(&self, n: usize) -> usize {
        self.max_per_call.map_or(n, |max| n.min(max))
    }

    /// Reject buffers too small for `count` entries of this file's `dim`.
    fn check_buffers(
        &self,
        count: usize,
        keys: usize,
        values: usize,
        metas: usize,
    ) -> io::Result<()> {
        if keys < count || metas < count || values / self.dim.max(1) < count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "buffers hold {keys} keys, {values} values, {metas} metas; \
                     need {count} entries of dim {}",
                    self.dim
                ),
            ));
        }
        Ok(())
    }
}

impl<K: Copy, V: Copy, M: Copy> KvFile<K, V, M> for MemoryKvFile<K, V, M> {
    fn read(
        &mut self,
        n: usize,
        keys: &mut [K],
        values: &mut [V],
        metas: &mut [M],
    ) -> io::Result<usize> {
        let count = self.limit(n).min(self.keys.len() - self.cursor);
        self.check_buffers(count, keys.len(), values.len(), metas.len())?;
        let (start, end) = (self.cursor, self.cursor + count);

        keys[..count].copy_from_slice(&self.keys[start..end]);
        values[..count * self.dim].copy_from_slice(&self.values[start * self.dim..end * self.dim]);
        metas[..count].copy_from_slice(&self.metas[start..end]);

        self.cursor = end;
        Ok(count)
    }

    fn write(&mut self, n: usize, keys: &[K], values: &[V], metas: &[M]) -> io::Result<usize> {
        let count = self.limit(n);
        self.check_buffers(count, keys.len(), values.len(), metas.len())?;
        self.keys.extend_from_slice(&keys[..count]);
        self.values.extend_from_slice(&values[..count * self.dim]);
        self.metas.extend_from_slice(&metas[..count]);
        Ok(count)
    }
}

/// Magic bytes identifying a keys file.
pub const FILE_MAGIC: [u8; 8] = *b"TIERKV\0\0";

/// Current file format version.
pub const FILE_VERSION: u32 = 1;

/// Header size (64 bytes).
pub const HEADER_SIZE: usize = 64;

/// Header stored at the beginning of the keys file.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvFileHeader {
    /// Magic bytes: "TIERKV"
    pub magic: [u8; 8],
    /// File format version
    pub version: u32,
    /// Elements per vector
    pub dim: u32,
    /// Size of a key in bytes
    pub key_size: u16,
    /// Size of a vector element in bytes
    pub value_size: u16,
    /// Size of a meta in bytes
    pub meta_size: u16,
    /// Reserved for future use
    pub _reserved: [u8; 42],
}

impl KvFileHeader {
    /// Create a header for the given element types.
    pub fn new<K, V, M>(dim: usize) -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            dim: dim as u32,
            key_size: std::mem::size_of::<K>() as u16,
            value_size: std::mem::size_of::<V>() as u16,
            meta_size: std::mem::size_of::<M>() as u16,
            _reserved: [0u8; 42],
        }
    }

    /// Validate magic and version.
    pub fn validate(&self) -> io::Result<()> {
        if self.magic != FILE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes in keys file",
            ));
        }
        if self.version != FILE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Unsupported file version {} (expected {})",
                    self.version, FILE_VERSION
                ),
            ));
        }
        Ok(())
    }

    /// Read a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "File too small to contain header",
            ));
        }

        // Safety: We're reading into a repr(C) struct with known layout
        let header = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const KvFileHeader) };
        header.validate()?;
        Ok(header)
    }

    /// Write the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        // Safety: We're writing from a repr(C) struct with known layout
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const KvFileHeader as *const u8,
                bytes.as_mut_ptr(),
                std::mem::size_of::<KvFileHeader>(),
            );
        }
        bytes
    }
}

/// [`KvFile`] backed by three flat local files.
#[derive(Debug)]
pub struct LocalKvFile {
    keys: File,
    values: File,
    metas: File,
    dim: usize,
}

impl LocalKvFile {
    /// Create (or truncate) the files at `base` for writing.
    pub fn create<K, V, M>(base: impl AsRef<Path>, dim: usize) -> io::Result<Self> {
        let [keys_path, values_path, metas_path] = paths(base.as_ref());
        let open = |path: &Path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
        };

        let mut keys = open(&keys_path)?;
        keys.write_all(&KvFileHeader::new::<K, V, M>(dim).to_bytes())?;

        Ok(Self {
            keys,
            values: open(&values_path)?,
            metas: open(&metas_path)?,
            dim,
        })
    }

    /// Open existing files at `base` for reading.
    ///
    /// Fails with `InvalidData` if the header does not match the element
    /// types or `dim`.
    pub fn open<K, V, M>(base: impl AsRef<Path>, dim: usize) -> io::Result<Self> {
        let [keys_path, values_path, metas_path] = paths(base.as_ref());

        let mut keys = File::open(&keys_path)?;
        let mut bytes = [0u8; HEADER_SIZE];
        keys.read_exact(&mut bytes).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "File too small to contain header")
        })?;
        let header = KvFileHeader::from_bytes(&bytes)?;

        let expected = KvFileHeader::new::<K, V, M>(dim);
        if header != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Layout mismatch: file has dim={} sizes={}/{}/{}, expected dim={} sizes={}/{}/{}",
                    header.dim,
                    header.key_size,
                    header.value_size,
                    header.meta_size,
                    expected.dim,
                    expected.key_size,
                    expected.value_size,
                    expected.meta_size,
                ),
            ));
        }

        Ok(Self {
            keys,
            values: File::open(&values_path)?,
            metas: File::open(&metas_path)?,
            dim,
        })
    }

    /// Flush written data to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.keys.sync_all()?;
        self.values.sync_all()?;
        self.metas.sync_all()
    }
}

fn paths(base: &Path) -> [PathBuf; 3] {
    let with = |ext: &str| {
        let mut path = base.as_os_str().to_owned();
        path.push(".");
        path.push(ext);
        PathBuf::from(path)
    };
    [with("keys"), with("values"), with("metas")]
}

/// Read until `buf` is full or the file ends. Returns bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl<K, V, M> KvFile<K, V, M> for LocalKvFile
where
    K: Key + Value,
    V: Value,
    M: Meta + Value,
{
    fn read(
        &mut self,
        n: usize,
        keys: &mut [K],
        values: &mut [V],
        metas: &mut [M],
    ) -> io::Result<usize> {
        let key_size = std::mem::size_of::<K>();
        let bytes = read_full(&mut self.keys, value_bytes_mut(&mut keys[..n]))?;
        if bytes % key_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Truncated record in keys file",
            ));
        }

        let count = bytes / key_size;
        self.values
            .read_exact(value_bytes_mut(&mut values[..count * self.dim]))?;
        self.metas.read_exact(value_bytes_mut(&mut metas[..count]))?;
        Ok(count)
    }

    fn write(&mut self, n: usize, keys: &[K], values: &[V], metas: &[M]) -> io::Result<usize> {
        self.keys.write_all(value_bytes(&keys[..n]))?;
        self.values.write_all(value_bytes(&values[..n * self.dim]))?;
        self.metas.write_all(value_bytes(&metas[..n]))?;
        Ok(n)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = KvFileHeader::new::<u64, f32, u64>(16);
        assert_eq!(std::mem::size_of::<KvFileHeader>(), HEADER_SIZE);
        let parsed = KvFileHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.dim, 16);
        assert_eq!(parsed.key_size, 8);
        assert_eq!(parsed.value_size, 4);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = KvFileHeader::new::<u64, f32, u64>(4).to_bytes();
        bytes[0] = b'X';
        assert!(KvFileHeader::from_bytes(&bytes).is_err());
        assert!(KvFileHeader::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_memory_file_short_io() {
        let mut file = MemoryKvFile::<u64, f32, u64>::new(2).with_max_per_call(2);
        let keys = [1, 2, 3];
        let values = [1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        let metas = [10, 20, 30];

        assert_eq!(file.write(3, &keys, &values, &metas).unwrap(), 2);
        assert_eq!(file.write(1, &keys[2..], &values[4..], &metas[2..]).unwrap(), 1);
        assert_eq!(file.len(), 3);

        let mut k = [0u64; 3];
        let mut v = [0.0f32; 6];
        let mut m = [0u64; 3];
        assert_eq!(file.read(3, &mut k, &mut v, &mut m).unwrap(), 2);
        assert_eq!(file.read(1, &mut k[2..], &mut v[4..], &mut m[2..]).unwrap(), 1);
        assert_eq!(file.read(3, &mut k, &mut v, &mut m).unwrap(), 0);
        assert_eq!(k, keys);
        assert_eq!(v, values);
        assert_eq!(m, metas);
    }

    #[test]
    fn test_memory_file_rejects_short_buffers() {
        let mut file = MemoryKvFile::<u64, f32, u64>::new(4);
        let values = [1.0f32; 8];
        assert_eq!(file.write(2, &[1, 2], &values, &[0, 0]).unwrap(), 2);

        // Buffers sized for dim 2.
        let mut k = [0u64; 2];
        let mut v = [0.0f32; 4];
        let mut m = [0u64; 2];
        let err = file.read(2, &mut k, &mut v, &mut m).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = file.write(2, &[3, 4], &values[..4], &[0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(file.len(), 2);
    }

    #[test]
    fn test_local_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("snapshot");

        let keys = [7u64, 8, 9];
        let values = [0.5f32, 1.5, 2.5, 3.5, 4.5, 5.5];
        let metas = [1u64, 2, 3];

        {
            let mut file = LocalKvFile::create::<u64, f32, u64>(&base, 2).unwrap();
            let file_ref: &mut dyn KvFile<u64, f32, u64> = &mut file;
            assert_eq!(file_ref.write(2, &keys, &values, &metas).unwrap(), 2);
            assert_eq!(file_ref.write(1, &keys[2..], &values[4..], &metas[2..]).unwrap(), 1);
            file.sync().unwrap();
        }
        assert!(dir.path().join("snapshot.keys").exists());
        assert!(dir.path().join("snapshot.values").exists());
        assert!(dir.path().join("snapshot.metas").exists());

        let mut file = LocalKvFile::open::<u64, f32, u64>(&base, 2).unwrap();
        let mut k = [0u64; 8];
        let mut v = [0.0f32; 16];
        let mut m = [0u64; 8];
        let n = KvFile::<u64, f32, u64>::read(&mut file, 8, &mut k, &mut v, &mut m).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&k[..3], &keys);
        assert_eq!(&v[..6], &values);
        assert_eq!(&m[..3], &metas);
        assert_eq!(
            KvFile::<u64, f32, u64>::read(&mut file, 8, &mut k, &mut v, &mut m).unwrap(),
            0
        );
    }

    #[test]
    fn test_local_file_layout_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("snapshot");
        LocalKvFile::create::<u64, f32, u64>(&base, 4).unwrap();

        let err = LocalKvFile::open::<u64, f32, u64>(&base, 8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = LocalKvFile::open::<u32, f32, u64>(&base, 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_local_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalKvFile::open::<u64, f32, u64>(dir.path().join("absent"), 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
