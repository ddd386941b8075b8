//! Block store: maps block keys to storage objects and applies codecs
//!
//! Each stored block is a record: a bincode [`RecordHeader`] (codec, raw
//! length, CRC32 of the payload) followed by the encoded payload. Records live
//! either in their own object or in a container file whose fixed-size header
//! table gives the offset and length of every slot.

use crate::compression::{CodecRegistry, CodecSpec};
use crate::descriptor::{Descriptor, StorageLayout};
use crate::error::{IdxError, Result};
use crate::io::IOManager;
use crate::utils::{block_path, calculate_checksum, packed_path, DATA_PREFIX};
use bincode::Options;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

const RECORD_MAGIC: u32 = 0x4944_5842; // "IDXB"
const PACKED_MAGIC: u32 = 0x4944_5850; // "IDXP"
const PACKED_VERSION: u16 = 1;
const MAX_RECORD_HEADER: u64 = 4096;

/// Identifies one block of one field at one timestep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub field: usize,
    pub timestep: u32,
    pub block: u64,
}

impl BlockKey {
    pub fn new(field: usize, timestep: u32, block: u64) -> Self {
        Self {
            field,
            timestep,
            block,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field {} time {} block {}", self.field, self.timestep, self.block)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    magic: u32,
    codec: String,
    raw_len: u64,
    crc: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct PackedEntry {
    offset: u64,
    len: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PackedHeader {
    magic: u32,
    version: u16,
    entries: Vec<PackedEntry>,
}

fn record_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_RECORD_HEADER)
}

fn table_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encoded record and what it decodes to
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub codec: CodecSpec,
    pub raw_len: u64,
    pub stored_len: u64,
}

/// Reads and writes blocks through an [`IOManager`]
pub struct BlockStore {
    io: Arc<dyn IOManager>,
    descriptor: Arc<RwLock<Descriptor>>,
    registry: Arc<CodecRegistry>,
    storage: StorageLayout,
    total_blocks: u64,
    /// Serializes read-modify-write of container files
    packed_writes: tokio::sync::Mutex<()>,
}

impl BlockStore {
    pub fn new(
        io: Arc<dyn IOManager>,
        descriptor: Arc<RwLock<Descriptor>>,
        registry: Arc<CodecRegistry>,
    ) -> Self {
        let (storage, total_blocks) = {
            let d = descriptor.read();
            (d.storage, d.total_blocks())
        };
        Self {
            io,
            descriptor,
            registry,
            storage,
            total_blocks,
            packed_writes: tokio::sync::Mutex::new(()),
        }
    }

    pub fn io(&self) -> &Arc<dyn IOManager> {
        &self.io
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> StorageLayout {
        self.storage
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Decoded size of every block of `field`
    pub fn block_size(&self, field: usize) -> Result<usize> {
        let d = self.descriptor.read();
        let f = d
            .fields
            .get(field)
            .ok_or_else(|| IdxError::OutOfBounds(format!("field index {}", field)))?;
        Ok(f.dtype.byte_size(1u64 << d.bits_per_block))
    }

    fn check_key(&self, key: &BlockKey) -> Result<(String, crate::types::DType, CodecSpec)> {
        let d = self.descriptor.read();
        let field = d
            .fields
            .get(key.field)
            .ok_or_else(|| IdxError::OutOfBounds(format!("field index {}", key.field)))?;
        if key.timestep >= d.timesteps {
            return Err(IdxError::OutOfBounds(format!(
                "timestep {} (dataset has {})",
                key.timestep, d.timesteps
            )));
        }
        if key.block >= self.total_blocks {
            return Err(IdxError::OutOfBounds(format!(
                "block {} (dataset has {})",
                key.block, self.total_blocks
            )));
        }
        Ok((field.name.clone(), field.dtype, field.codec))
    }

    fn blocks_per_file(&self) -> Option<u64> {
        match self.storage {
            StorageLayout::PerBlock => None,
            StorageLayout::Packed { blocks_per_file } => Some(blocks_per_file.max(1)),
        }
    }

    /// Blocks sharing one storage object; 1 for per-block storage
    pub fn blocks_per_container(&self) -> u64 {
        self.blocks_per_file().unwrap_or(1)
    }

    /// Object holding `key` and, for containers, the slot inside it
    pub fn object_path(&self, field_name: &str, key: &BlockKey) -> (String, Option<usize>) {
        match self.blocks_per_file() {
            None => (
                block_path(field_name, key.timestep, key.block, self.total_blocks),
                None,
            ),
            Some(bpf) => {
                let total_files = (self.total_blocks + bpf - 1) / bpf;
                (
                    packed_path(field_name, key.timestep, key.block / bpf, total_files),
                    Some((key.block % bpf) as usize),
                )
            }
        }
    }

    fn table_len(bpf: u64) -> Result<u64> {
        let empty = PackedHeader {
            magic: PACKED_MAGIC,
            version: PACKED_VERSION,
            entries: Vec::new(),
        };
        let entry = table_options().serialized_size(&PackedEntry::default())?;
        Ok(table_options().serialized_size(&empty)? + entry * bpf)
    }

    /// A slot must lie after the table and inside the container
    fn check_entry(path: &str, slot: usize, entry: &PackedEntry, table_len: u64, file_len: u64) -> Result<()> {
        match entry.offset.checked_add(entry.len) {
            Some(end) if entry.offset >= table_len && end <= file_len => Ok(()),
            _ => Err(IdxError::ReadFailure(format!(
                "{}: slot {} points outside the container",
                path, slot
            ))),
        }
    }

    fn parse_table(path: &str, bytes: &[u8], bpf: u64) -> Result<PackedHeader> {
        let header: PackedHeader = table_options()
            .deserialize(bytes)
            .map_err(|e| IdxError::ReadFailure(format!("{}: bad container header: {}", path, e)))?;
        if header.magic != PACKED_MAGIC || header.entries.len() as u64 != bpf {
            return Err(IdxError::ReadFailure(format!(
                "{}: container header does not match the layout",
                path
            )));
        }
        if header.version != PACKED_VERSION {
            return Err(IdxError::UnsupportedVersion(header.version));
        }
        Ok(header)
    }

    /// Stored record of a block, still encoded
    pub async fn read_record(&self, key: &BlockKey) -> Result<Bytes> {
        let (field_name, _, _) = self.check_key(key)?;
        let (path, slot) = self.object_path(&field_name, key);

        match (slot, self.blocks_per_file()) {
            (Some(slot), Some(bpf)) => {
                let table_len = Self::table_len(bpf)?;
                let table = self.io.read_range(&path, 0, table_len).await?;
                let header = Self::parse_table(&path, &table, bpf)?;
                let entry = header.entries[slot];
                if entry.len == 0 {
                    return Err(IdxError::NotFound(format!("{} ({})", key, path)));
                }
                let file_len = self.io.size(&path).await?;
                Self::check_entry(&path, slot, &entry, table_len, file_len)?;
                debug!(%key, %path, offset = entry.offset, len = entry.len, "reading packed block");
                self.io.read_range(&path, entry.offset, entry.len).await
            }
            _ => {
                debug!(%key, %path, "reading block");
                self.io.read(&path).await
            }
        }
    }

    fn encode_record(&self, codec: &CodecSpec, dtype: crate::types::DType, raw: &[u8]) -> Result<Vec<u8>> {
        let payload = self.registry.encode(codec, raw, dtype)?;
        let header = RecordHeader {
            magic: RECORD_MAGIC,
            codec: codec.to_string(),
            raw_len: raw.len() as u64,
            crc: calculate_checksum(&payload),
        };
        let mut out = record_options().serialize(&header)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse a record header without decoding the payload
    pub fn inspect_record(record: &[u8]) -> Result<RecordInfo> {
        let mut cursor = Cursor::new(record);
        let header: RecordHeader = record_options()
            .deserialize_from(&mut cursor)
            .map_err(|e| IdxError::ReadFailure(format!("bad record header: {}", e)))?;
        if header.magic != RECORD_MAGIC {
            return Err(IdxError::ReadFailure("bad record magic".to_string()));
        }
        let codec: CodecSpec = header
            .codec
            .parse()
            .map_err(|e| IdxError::ReadFailure(format!("record codec: {}", e)))?;
        Ok(RecordInfo {
            codec,
            raw_len: header.raw_len,
            stored_len: record.len() as u64 - cursor.position(),
        })
    }

    fn decode_record(&self, key: &BlockKey, dtype: crate::types::DType, record: &[u8]) -> Result<Bytes> {
        let mut cursor = Cursor::new(record);
        let header: RecordHeader = record_options()
            .deserialize_from(&mut cursor)
            .map_err(|e| IdxError::ReadFailure(format!("{}: bad record header: {}", key, e)))?;
        if header.magic != RECORD_MAGIC {
            return Err(IdxError::ReadFailure(format!("{}: bad record magic", key)));
        }
        let payload = &record[cursor.position() as usize..];
        if calculate_checksum(payload) != header.crc {
            warn!(%key, "block checksum mismatch");
            return Err(IdxError::ReadFailure(format!("{}: checksum mismatch", key)));
        }
        let codec: CodecSpec = header
            .codec
            .parse()
            .map_err(|e| IdxError::ReadFailure(format!("{}: {}", key, e)))?;

        let expected = self.block_size(key.field)?;
        if header.raw_len != expected as u64 {
            return Err(IdxError::ReadFailure(format!(
                "{}: record holds {} bytes, blocks are {}",
                key, header.raw_len, expected
            )));
        }
        match self.registry.decode(&codec, payload, dtype, expected) {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(e @ IdxError::UnsupportedCodec(_)) => Err(e),
            Err(e) => Err(IdxError::ReadFailure(format!("{}: {}", key, e))),
        }
    }

    /// Decoded block content; [`IdxError::NotFound`] when never written
    pub async fn read_block(&self, key: &BlockKey) -> Result<Bytes> {
        let (_, dtype, _) = self.check_key(key)?;
        let record = self.read_record(key).await?;
        self.decode_record(key, dtype, &record)
    }

    /// Encode with the field's current codec and store
    pub async fn write_block(&self, key: &BlockKey, data: &[u8]) -> Result<()> {
        let (_, _, codec) = self.check_key(key)?;
        self.write_block_with(key, data, &codec).await
    }

    /// Encode with an explicit codec and store
    pub async fn write_block_with(&self, key: &BlockKey, data: &[u8], codec: &CodecSpec) -> Result<()> {
        let (field_name, record) = self.prepare_record(key, data, Some(codec))?;
        self.store_record(&field_name, key, Some(Bytes::from(record)))
            .await
            .map_err(|e| write_error(&key.to_string(), e))
    }

    /// Encode and store several blocks, publishing each container once.
    ///
    /// `codec` overrides the field codec for every block. Nothing is stored
    /// when a block fails validation or encoding.
    pub async fn write_blocks(&self, blocks: &[(BlockKey, Bytes)], codec: Option<&CodecSpec>) -> Result<()> {
        let mut objects = Vec::new();
        let mut containers: BTreeMap<String, Vec<(usize, Option<Bytes>)>> = BTreeMap::new();
        for (key, data) in blocks {
            let (field_name, record) = self.prepare_record(key, data, codec)?;
            let record = Some(Bytes::from(record));
            match self.object_path(&field_name, key) {
                (path, Some(slot)) => containers.entry(path).or_default().push((slot, record)),
                (path, None) => objects.push((key, path, record)),
            }
        }

        for (key, path, record) in objects {
            self.store_object(&path, record)
                .await
                .map_err(|e| write_error(&key.to_string(), e))?;
        }
        if let Some(bpf) = self.blocks_per_file() {
            for (path, updates) in containers {
                debug!(%path, blocks = updates.len(), "publishing container");
                self.update_container(&path, bpf, updates)
                    .await
                    .map_err(|e| write_error(&path, e))?;
            }
        }
        Ok(())
    }

    /// Validate and encode a block; returns the field name and the record
    fn prepare_record(&self, key: &BlockKey, data: &[u8], codec: Option<&CodecSpec>) -> Result<(String, Vec<u8>)> {
        let (field_name, dtype, field_codec) = self.check_key(key)?;
        let expected = self.block_size(key.field)?;
        if data.len() != expected {
            return Err(IdxError::WriteError(format!(
                "{}: got {} bytes, blocks are {}",
                key,
                data.len(),
                expected
            )));
        }
        let codec = codec.unwrap_or(&field_codec);
        let record = self.encode_record(codec, dtype, data)?;
        debug!(%key, codec = %codec, raw = data.len(), stored = record.len(), "encoded block");
        Ok((field_name, record))
    }

    /// Remove a block; missing blocks are not an error
    pub async fn delete_block(&self, key: &BlockKey) -> Result<()> {
        let (field_name, _, _) = self.check_key(key)?;
        debug!(%key, "deleting block");
        self.store_record(&field_name, key, None).await
    }

    async fn store_record(&self, field_name: &str, key: &BlockKey, record: Option<Bytes>) -> Result<()> {
        match (self.object_path(field_name, key), self.blocks_per_file()) {
            ((path, Some(slot)), Some(bpf)) => self.update_container(&path, bpf, vec![(slot, record)]).await,
            ((path, _), _) => self.store_object(&path, record).await,
        }
    }

    async fn store_object(&self, path: &str, record: Option<Bytes>) -> Result<()> {
        match record {
            Some(record) => self.io.write(path, &record).await,
            None => match self.io.delete(path).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
        }
    }

    /// Apply slot updates to a container and publish it in one write
    async fn update_container(&self, path: &str, bpf: u64, updates: Vec<(usize, Option<Bytes>)>) -> Result<()> {
        let _guard = self.packed_writes.lock().await;
        let table_len = Self::table_len(bpf)?;
        let mut records: Vec<Option<Bytes>> = vec![None; bpf as usize];
        match self.io.read(path).await {
            Ok(existing) => {
                let header = Self::parse_table(path, &existing, bpf)?;
                for (i, entry) in header.entries.iter().enumerate() {
                    if entry.len == 0 {
                        continue;
                    }
                    Self::check_entry(path, i, entry, table_len, existing.len() as u64)?;
                    records[i] = Some(existing.slice(entry.offset as usize..(entry.offset + entry.len) as usize));
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        for (slot, record) in updates {
            records[slot] = record;
        }

        if records.iter().all(Option::is_none) {
            return match self.io.delete(path).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            };
        }

        let mut entries = Vec::with_capacity(records.len());
        let mut offset = table_len;
        for record in &records {
            let len = record.as_ref().map(|r| r.len() as u64).unwrap_or(0);
            entries.push(PackedEntry {
                offset: if len == 0 { 0 } else { offset },
                len,
            });
            offset += len;
        }
        let header = PackedHeader {
            magic: PACKED_MAGIC,
            version: PACKED_VERSION,
            entries,
        };
        let mut file = table_options().serialize(&header)?;
        debug_assert_eq!(file.len() as u64, table_len);
        for record in records.iter().flatten() {
            file.extend_from_slice(record);
        }
        self.io.write(path, &file).await
    }

    /// Block ids stored for a field and timestep, ascending
    pub async fn stored_blocks(&self, field: usize, timestep: u32) -> Result<Vec<u64>> {
        let (field_name, _, _) = self.check_key(&BlockKey::new(field, timestep, 0))?;
        let prefix = format!("{}/{}/{}", DATA_PREFIX, field_name, timestep);
        let objects = self.io.list(&prefix).await?;

        let mut ret = Vec::new();
        for object in objects {
            let rest = match object.strip_prefix(&prefix) {
                Some(rest) => rest.trim_start_matches('/'),
                None => continue,
            };
            match self.blocks_per_file() {
                None => {
                    if let Some(hex) = rest.strip_suffix(".bin") {
                        if let Ok(block) = u64::from_str_radix(&hex.replace('/', ""), 16) {
                            ret.push(block);
                        }
                    }
                }
                Some(bpf) => {
                    let file_index = match rest
                        .strip_suffix(".idx")
                        .and_then(|hex| u64::from_str_radix(&hex.replace('/', ""), 16).ok())
                    {
                        Some(i) => i,
                        None => continue,
                    };
                    let table = self.io.read_range(&object, 0, Self::table_len(bpf)?).await?;
                    let header = Self::parse_table(&object, &table, bpf)?;
                    for (slot, entry) in header.entries.iter().enumerate() {
                        let block = file_index * bpf + slot as u64;
                        if entry.len > 0 && block < self.total_blocks {
                            ret.push(block);
                        }
                    }
                }
            }
        }
        ret.sort_unstable();
        Ok(ret)
    }
}

fn write_error(what: &str, err: IdxError) -> IdxError {
    match err {
        IdxError::WriteError(_) => err,
        other => IdxError::WriteError(format!("{}: {}", what, other)),
    }
}

impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("backend", &self.io.backend())
            .field("storage", &self.storage)
            .field("total_blocks", &self.total_blocks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Field;
    use crate::geometry::LogicBox;
    use crate::io::testing::FaultyIOManager;
    use crate::io::{FileSystemIOManager, MemoryIOManager};
    use crate::types::{DType, DataType};
    use tempfile::TempDir;

    fn store_with(io: Arc<dyn IOManager>, storage: StorageLayout, codec: CodecSpec) -> BlockStore {
        let descriptor = Descriptor::create(
            LogicBox::from_dims(&[16, 16]).unwrap(),
            vec![Field::new("v", DType::scalar(DataType::U16)).with_codec(codec)],
            &[4, 4],
        )
        .unwrap()
        .with_timesteps(2)
        .with_storage(storage);
        BlockStore::new(
            io,
            Arc::new(RwLock::new(descriptor)),
            Arc::new(CodecRegistry::with_defaults()),
        )
    }

    fn block_data(seed: u8) -> Vec<u8> {
        (0..32u8).map(|i| i.wrapping_mul(seed)).collect()
    }

    async fn round_trip(store: &BlockStore) {
        assert_eq!(store.total_blocks(), 16);
        assert_eq!(store.block_size(0).unwrap(), 32);

        let missing = store.read_block(&BlockKey::new(0, 0, 3)).await.unwrap_err();
        assert!(missing.is_not_found());

        for b in [0u64, 3, 7, 15] {
            store
                .write_block(&BlockKey::new(0, 1, b), &block_data(b as u8 + 1))
                .await
                .unwrap();
        }
        for b in [0u64, 3, 7, 15] {
            let got = store.read_block(&BlockKey::new(0, 1, b)).await.unwrap();
            assert_eq!(&got[..], &block_data(b as u8 + 1)[..]);
        }
        // other timestep untouched
        assert!(store.read_block(&BlockKey::new(0, 0, 3)).await.unwrap_err().is_not_found());
        assert_eq!(store.stored_blocks(0, 1).await.unwrap(), vec![0, 3, 7, 15]);

        // overwrite then delete
        store.write_block(&BlockKey::new(0, 1, 3), &block_data(9)).await.unwrap();
        assert_eq!(&store.read_block(&BlockKey::new(0, 1, 3)).await.unwrap()[..], &block_data(9)[..]);
        store.delete_block(&BlockKey::new(0, 1, 3)).await.unwrap();
        assert!(store.read_block(&BlockKey::new(0, 1, 3)).await.unwrap_err().is_not_found());
        store.delete_block(&BlockKey::new(0, 1, 3)).await.unwrap();
        assert_eq!(&store.read_block(&BlockKey::new(0, 1, 7)).await.unwrap()[..], &block_data(8)[..]);
    }

    #[tokio::test]
    async fn test_per_block_layout() {
        let store = store_with(Arc::new(MemoryIOManager::new()), StorageLayout::PerBlock, CodecSpec::zip());
        round_trip(&store).await;
    }

    #[tokio::test]
    async fn test_packed_layout() {
        let store = store_with(
            Arc::new(MemoryIOManager::new()),
            StorageLayout::Packed { blocks_per_file: 4 },
            CodecSpec::Lz4,
        );
        round_trip(&store).await;
    }

    #[tokio::test]
    async fn test_monolithic_layout_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let io = Arc::new(FileSystemIOManager::new(temp_dir.path()));
        let store = store_with(io.clone(), StorageLayout::Packed { blocks_per_file: 16 }, CodecSpec::zstd());
        round_trip(&store).await;
        assert_eq!(io.list("data").await.unwrap(), vec!["data/v/1/0000.idx".to_string()]);
    }

    #[tokio::test]
    async fn test_bad_key_and_size() {
        let store = store_with(Arc::new(MemoryIOManager::new()), StorageLayout::PerBlock, CodecSpec::Raw);
        assert!(matches!(
            store.read_block(&BlockKey::new(1, 0, 0)).await,
            Err(IdxError::OutOfBounds(_))
        ));
        assert!(matches!(
            store.read_block(&BlockKey::new(0, 2, 0)).await,
            Err(IdxError::OutOfBounds(_))
        ));
        assert!(matches!(
            store.read_block(&BlockKey::new(0, 0, 16)).await,
            Err(IdxError::OutOfBounds(_))
        ));
        assert!(matches!(
            store.write_block(&BlockKey::new(0, 0, 0), &[0u8; 5]).await,
            Err(IdxError::WriteError(_))
        ));
    }

    #[tokio::test]
    async fn test_corruption_is_read_failure() {
        let io = Arc::new(MemoryIOManager::new());
        let store = store_with(io.clone(), StorageLayout::PerBlock, CodecSpec::Raw);
        let key = BlockKey::new(0, 0, 5);
        store.write_block(&key, &block_data(3)).await.unwrap();

        let (path, _) = store.object_path("v", &key);
        let mut record = io.read(&path).await.unwrap().to_vec();
        let last = record.len() - 1;
        record[last] ^= 0xff;
        io.write(&path, &record).await.unwrap();
        assert!(matches!(store.read_block(&key).await, Err(IdxError::ReadFailure(_))));

        io.write(&path, b"garbage").await.unwrap();
        assert!(matches!(store.read_block(&key).await, Err(IdxError::ReadFailure(_))));
    }

    #[tokio::test]
    async fn test_record_keeps_its_codec() {
        let store = store_with(Arc::new(MemoryIOManager::new()), StorageLayout::PerBlock, CodecSpec::Raw);
        let key = BlockKey::new(0, 0, 1);
        store.write_block_with(&key, &block_data(2), &CodecSpec::zip()).await.unwrap();
        let info = BlockStore::inspect_record(&store.read_record(&key).await.unwrap()).unwrap();
        assert_eq!(info.codec, CodecSpec::zip());
        assert_eq!(info.raw_len, 32);
        assert_eq!(&store.read_block(&key).await.unwrap()[..], &block_data(2)[..]);
    }

    #[tokio::test]
    async fn test_bad_container_slot_is_read_failure() {
        let temp_dir = TempDir::new().unwrap();
        let io = Arc::new(FileSystemIOManager::new(temp_dir.path()));
        let store = store_with(io.clone(), StorageLayout::Packed { blocks_per_file: 4 }, CodecSpec::Raw);
        let key = BlockKey::new(0, 0, 1);
        store.write_block(&key, &block_data(5)).await.unwrap();
        let (path, slot) = store.object_path("v", &key);
        assert_eq!(slot, Some(1));

        // magic, version and the entry count precede 16-byte (offset, len) slots
        let slot_at = 4 + 2 + 8 + 16;
        let original = io.read(&path).await.unwrap().to_vec();

        let mut huge_len = original.clone();
        huge_len[slot_at + 8..slot_at + 16].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        io.write(&path, &huge_len).await.unwrap();
        assert!(matches!(store.read_block(&key).await, Err(IdxError::ReadFailure(_))));

        let mut wrapping = original.clone();
        wrapping[slot_at..slot_at + 8].copy_from_slice(&(u64::MAX - 4).to_le_bytes());
        io.write(&path, &wrapping).await.unwrap();
        assert!(matches!(store.read_block(&key).await, Err(IdxError::ReadFailure(_))));
        assert!(matches!(
            store.write_block(&BlockKey::new(0, 0, 2), &block_data(6)).await,
            Err(IdxError::WriteError(_))
        ));

        io.write(&path, &original).await.unwrap();
        assert_eq!(&store.read_block(&key).await.unwrap()[..], &block_data(5)[..]);
    }

    #[tokio::test]
    async fn test_batch_publishes_each_container_once() {
        let io = Arc::new(FaultyIOManager::default());
        let store = store_with(io.clone(), StorageLayout::Packed { blocks_per_file: 4 }, CodecSpec::Raw);
        assert_eq!(store.blocks_per_container(), 4);

        let blocks: Vec<(BlockKey, Bytes)> = (0..16u64)
            .map(|b| (BlockKey::new(0, 0, b), Bytes::from(block_data(b as u8 + 1))))
            .collect();
        store.write_blocks(&blocks, None).await.unwrap();

        let (count, bytes) = *io.writes.read();
        assert_eq!(count, 4);
        // payload plus one table and one record header per block, nothing rewritten
        assert!(bytes < 16 * 32 * 4, "{} bytes written", bytes);
        assert_eq!(store.stored_blocks(0, 0).await.unwrap(), (0..16).collect::<Vec<_>>());
        for (key, data) in &blocks {
            assert_eq!(&store.read_block(key).await.unwrap(), data);
        }

        // a batch with a bad block stores nothing
        let bad = vec![
            (BlockKey::new(0, 1, 0), Bytes::from(block_data(1))),
            (BlockKey::new(0, 1, 1), Bytes::from(vec![0u8; 3])),
        ];
        assert!(matches!(store.write_blocks(&bad, None).await, Err(IdxError::WriteError(_))));
        assert!(store.stored_blocks(0, 1).await.unwrap().is_empty());
        assert_eq!(io.writes.read().0, 4);
    }
}
