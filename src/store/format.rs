//! Binary container for persisted identity catalogs.
//!
//! Header (20 bytes):
//! - magic: [u8; 4] (`FGDB`)
//! - version: u8 (1)
//! - kind: u8 (0 = exact, 1 = indexed)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, in insertion/slot order):
//! - name_len: u16, name: [u8; name_len] (UTF-8)
//! - image_count: u32
//! - stale: u8 (always 0 for the exact variant)
//! - created_at: i64 (unix millis), updated_at: i64 (unix millis)
//! - description_len: u32 (`u32::MAX` = none), description: [u8; description_len]
//! - embedding: [f32; dimensions]
//!
//! Trailer:
//! - checksum: u32 (CRC32 of the entry section)
//!
//! All integers and floats are little-endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};

use super::{Identity, StoreError, StoreKind};

const MAGIC: [u8; 4] = *b"FGDB";

/// Current file format version
pub const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: magic(4) + version(1) + kind(1) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 20;

const NO_DESCRIPTION: u32 = u32::MAX;

/// One persisted entry. `stale` is only meaningful for the indexed variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub identity: Identity,
    pub stale: bool,
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    kind: StoreKind,
    dimensions: u16,
    entry_count: u64,
}

/// Write a catalog to `path`.
///
/// Uses atomic write: temp file -> fsync -> rename. The previous file stays in
/// place until the rename succeeds.
pub fn write<'a>(
    path: &Path,
    kind: StoreKind,
    dimensions: usize,
    records: impl ExactSizeIterator<Item = (&'a Identity, bool)>,
) -> Result<(), StoreError> {
    let temp_path = path.with_extension("tmp");

    let result = write_to_file(&temp_path, kind, dimensions, records);

    if result.is_err() {
        // Clean up temp file on error
        let _ = std::fs::remove_file(&temp_path);
        return result;
    }

    std::fs::rename(&temp_path, path)?;

    Ok(())
}

/// Read a catalog from `path`, checking it matches the expected variant and
/// dimension.
pub fn read(
    path: &Path,
    expected_kind: StoreKind,
    expected_dimensions: usize,
) -> Result<Vec<Record>, StoreError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header = read_header(&mut reader)?;

    if header.kind != expected_kind {
        return Err(StoreError::KindMismatch {
            expected: expected_kind,
            got: header.kind,
        });
    }

    if header.dimensions as usize != expected_dimensions {
        return Err(StoreError::DimensionMismatch {
            expected: expected_dimensions,
            got: header.dimensions as usize,
        });
    }

    let mut body = ChecksumReader::new(&mut reader);
    let mut records = Vec::with_capacity(header.entry_count.min(1 << 16) as usize);
    for _ in 0..header.entry_count {
        records.push(read_entry(&mut body, header.dimensions as usize)?);
    }
    let computed = body.finalize();

    let mut trailer = [0u8; 4];
    reader.read_exact(&mut trailer)?;
    if u32::from_le_bytes(trailer) != computed {
        return Err(StoreError::ChecksumMismatch);
    }

    log::debug!(
        "read {} records (format v{}) from {}",
        records.len(),
        header.version,
        path.display()
    );

    Ok(records)
}

fn write_to_file<'a>(
    path: &Path,
    kind: StoreKind,
    dimensions: usize,
    records: impl ExactSizeIterator<Item = (&'a Identity, bool)>,
) -> Result<(), StoreError> {
    let dimensions_u16 = u16::try_from(dimensions).map_err(|_| {
        StoreError::InvalidFormat(format!("dimension {dimensions} does not fit the format"))
    })?;

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let header = Header {
        version: FORMAT_VERSION,
        kind,
        dimensions: dimensions_u16,
        entry_count: records.len() as u64,
    };
    write_header(&mut writer, &header)?;

    let mut body = ChecksumWriter::new(&mut writer);
    for (identity, stale) in records {
        write_entry(&mut body, identity, stale, dimensions)?;
    }
    let checksum = body.finalize();
    writer.write_all(&checksum.to_le_bytes())?;

    // Flush and sync
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, StoreError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            StoreError::InvalidFormat("file shorter than header".to_string())
        }
        _ => StoreError::Io(e),
    })?;

    if header_bytes[0..4] != MAGIC {
        return Err(StoreError::InvalidFormat("bad magic bytes".to_string()));
    }

    let version = header_bytes[4];
    if version > FORMAT_VERSION || version == 0 {
        return Err(StoreError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([
        header_bytes[16],
        header_bytes[17],
        header_bytes[18],
        header_bytes[19],
    ]);
    if stored_checksum != crc32fast::hash(&header_bytes[0..16]) {
        return Err(StoreError::ChecksumMismatch);
    }

    let kind = StoreKind::from_byte(header_bytes[5])
        .ok_or_else(|| StoreError::InvalidFormat(format!("unknown store kind {}", header_bytes[5])))?;
    let dimensions = u16::from_le_bytes([header_bytes[6], header_bytes[7]]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[8..16]);
    let entry_count = u64::from_le_bytes(count_bytes);

    Ok(Header {
        version,
        kind,
        dimensions,
        entry_count,
    })
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), StoreError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0..4].copy_from_slice(&MAGIC);
    header_bytes[4] = header.version;
    header_bytes[5] = header.kind.as_byte();
    header_bytes[6..8].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[8..16].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..16]);
    header_bytes[16..20].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn write_entry(
    writer: &mut impl Write,
    identity: &Identity,
    stale: bool,
    dimensions: usize,
) -> Result<(), StoreError> {
    if identity.embedding.len() != dimensions {
        return Err(StoreError::DimensionMismatch {
            expected: dimensions,
            got: identity.embedding.len(),
        });
    }

    let name = identity.name.as_bytes();
    let name_len = u16::try_from(name.len())
        .map_err(|_| StoreError::InvalidFormat(format!("name too long: {} bytes", name.len())))?;
    writer.write_all(&name_len.to_le_bytes())?;
    writer.write_all(name)?;

    writer.write_all(&identity.image_count.to_le_bytes())?;
    writer.write_all(&[stale as u8])?;
    writer.write_all(&identity.created_at.timestamp_millis().to_le_bytes())?;
    writer.write_all(&identity.updated_at.timestamp_millis().to_le_bytes())?;

    match &identity.description {
        Some(description) => {
            let bytes = description.as_bytes();
            let len = u32::try_from(bytes.len())
                .ok()
                .filter(|len| *len != NO_DESCRIPTION)
                .ok_or_else(|| StoreError::InvalidFormat("description too long".to_string()))?;
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(bytes)?;
        }
        None => writer.write_all(&NO_DESCRIPTION.to_le_bytes())?,
    }

    for &value in &identity.embedding {
        writer.write_all(&value.to_le_bytes())?;
    }

    Ok(())
}

fn read_entry(reader: &mut impl Read, dimensions: usize) -> Result<Record, StoreError> {
    let name_len = u16::from_le_bytes(read_array(reader)?) as usize;
    let mut name = vec![0u8; name_len];
    reader.read_exact(&mut name)?;
    let name = String::from_utf8(name)
        .map_err(|_| StoreError::InvalidFormat("name is not valid UTF-8".to_string()))?;

    let image_count = u32::from_le_bytes(read_array(reader)?);
    let [stale] = read_array::<1>(reader)?;
    let created_at = read_timestamp(reader)?;
    let updated_at = read_timestamp(reader)?;

    let description_len = u32::from_le_bytes(read_array(reader)?);
    let description = if description_len == NO_DESCRIPTION {
        None
    } else {
        // the length field is untrusted until the body checksum is verified
        let mut bytes = Vec::new();
        (&mut *reader)
            .take(description_len as u64)
            .read_to_end(&mut bytes)?;
        if bytes.len() != description_len as usize {
            return Err(StoreError::InvalidFormat(format!(
                "description of {name} is truncated"
            )));
        }
        Some(String::from_utf8(bytes).map_err(|_| {
            StoreError::InvalidFormat(format!("description of {name} is not valid UTF-8"))
        })?)
    };

    let mut embedding = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        embedding.push(f32::from_le_bytes(read_array(reader)?));
    }

    Ok(Record {
        identity: Identity {
            name,
            embedding,
            image_count,
            description,
            created_at,
            updated_at,
        },
        stale: stale != 0,
    })
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N], StoreError> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_timestamp(reader: &mut impl Read) -> Result<DateTime<Utc>, StoreError> {
    let millis = i64::from_le_bytes(read_array(reader)?);
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::InvalidFormat(format!("timestamp out of range: {millis}")))
}

/// Reader that feeds everything it reads into a CRC32 hasher.
struct ChecksumReader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: Read> ChecksumReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer that feeds everything it writes into a CRC32 hasher.
struct ChecksumWriter<W> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> ChecksumWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use std::path::PathBuf;

    fn identity(name: &str, embedding: Vec<f32>, description: Option<&str>) -> Identity {
        let now = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        Identity {
            name: name.to_string(),
            embedding,
            image_count: 3,
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_write_and_read_with_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("face_db.bin");

        let alice = identity("Alice", vec![1.0, 0.0, 0.0], Some("Engineer\nBadge 7"));
        let bob = identity("Bob Smith", vec![0.0, 1.0, 0.0], None);
        let records = vec![(&alice, false), (&bob, true)];

        write(&path, StoreKind::Indexed, 3, records.into_iter()).unwrap();
        let loaded = read(&path, StoreKind::Indexed, 3).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].identity, alice);
        assert!(!loaded[0].stale);
        assert_eq!(loaded[1].identity, bob);
        assert!(loaded[1].stale);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_kind_and_dimension_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("face_db.bin");
        write(&path, StoreKind::Exact, 3, Vec::new().into_iter()).unwrap();

        assert!(matches!(
            read(&path, StoreKind::Indexed, 3),
            Err(StoreError::KindMismatch { .. })
        ));
        assert!(matches!(
            read(&path, StoreKind::Exact, 512),
            Err(StoreError::DimensionMismatch { expected: 512, got: 3 })
        ));
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/face_db.bin");
        let result = write(&path, StoreKind::Exact, 3, Vec::new().into_iter());

        assert!(result.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("face_db.bin");
        let alice = identity("Alice", vec![1.0, 0.0, 0.0], None);
        write(&path, StoreKind::Exact, 3, vec![(&alice, false)].into_iter()).unwrap();

        // wrong dimension fails mid-write
        let broken = identity("Broken", vec![1.0, 0.0], None);
        assert!(write(&path, StoreKind::Exact, 3, vec![(&broken, false)].into_iter()).is_err());

        let loaded = read(&path, StoreKind::Exact, 3).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identity.name, "Alice");
    }

    #[test]
    fn test_header_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("face_db.bin");
        let alice = identity("Alice", vec![1.0, 0.0, 0.0], None);
        write(&path, StoreKind::Exact, 3, vec![(&alice, false)].into_iter()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        assert!(matches!(
            read(&path, StoreKind::Exact, 3),
            Err(StoreError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_body_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("face_db.bin");
        let alice = identity("Alice", vec![1.0, 0.0, 0.0], None);
        write(&path, StoreKind::Exact, 3, vec![(&alice, false)].into_iter()).unwrap();

        // flip a byte inside the embedding of the only entry
        let len = std::fs::metadata(&path).unwrap().len();
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(len - 6)).unwrap();
        file.write_all(&[0x7F]).unwrap();

        assert!(matches!(
            read(&path, StoreKind::Exact, 3),
            Err(StoreError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_oversized_description_length_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("face_db.bin");
        let alice = identity("Alice", vec![1.0, 0.0, 0.0], None);
        write(&path, StoreKind::Exact, 3, vec![(&alice, false)].into_iter()).unwrap();

        // header + name_len + "Alice" + image_count + stale + created_at + updated_at
        let offset = (HEADER_SIZE + 2 + 5 + 4 + 1 + 8 + 8) as u64;
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&(u32::MAX - 1).to_le_bytes()).unwrap();

        assert!(matches!(
            read(&path, StoreKind::Exact, 3),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("face_db.pkl");
        std::fs::write(&path, b"\x80\x04\x95 pickle data that is long enough").unwrap();

        assert!(matches!(
            read(&path, StoreKind::Exact, 3),
            Err(StoreError::InvalidFormat(_))
        ));
    }
}
