//! I/O managers for different storage backends

use crate::error::{IdxError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// In-process object map
    Memory,
    /// Remote block endpoint over HTTP
    Http,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "memory" => Ok(StorageBackend::Memory),
                "http" | "https" => Ok(StorageBackend::Http),
                _ => Err(IdxError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Object storage seen by the block store. Paths are `/`-separated keys
/// relative to the dataset root.
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read a whole object; a missing object is [`IdxError::NotFound`]
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Read `len` bytes starting at `offset`
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Replace an object. Readers see either the old or the new content.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete an object
    async fn delete(&self, path: &str) -> Result<()>;

    /// Keys under a prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the size of an object in bytes
    async fn size(&self, path: &str) -> Result<u64>;

    /// Create the lock object exclusively. `Ok(false)` when it already exists.
    async fn try_lock(&self, path: &str, owner: &str) -> Result<bool>;

    /// Remove the lock object. Synchronous so that it can run from `Drop`.
    fn unlock(&self, path: &str) -> Result<()>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

/// End of `offset..offset + len`, rejecting ranges that overflow
fn range_end(path: &str, offset: u64, len: u64) -> Result<u64> {
    offset.checked_add(len).ok_or_else(|| {
        IdxError::ReadFailure(format!("{}: range of {} bytes at offset {} overflows", path, len, offset))
    })
}

fn not_found(path: &str, err: std::io::Error) -> IdxError {
    if err.kind() == std::io::ErrorKind::NotFound {
        IdxError::NotFound(path.to_string())
    } else {
        IdxError::Io(err)
    }
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the full path for a relative path
    fn full_path(&self, path: &str) -> PathBuf {
        let mut ret = self.base_path.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            ret.push(segment);
        }
        ret
    }

    async fn ensure_parent(full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.full_path(path);
        let data = fs::read(&full_path).await.map_err(|e| not_found(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        let full_path = self.full_path(path);
        let mut file = fs::File::open(&full_path)
            .await
            .map_err(|e| not_found(path, e))?;
        let end = range_end(path, offset, len)?;
        let file_len = file.metadata().await?.len();
        if end > file_len {
            return Err(IdxError::ReadFailure(format!(
                "{}: range {}..{} beyond object of {} bytes",
                path, offset, end, file_len
            )));
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IdxError::ReadFailure(format!(
                    "{}: short read of {} bytes at offset {}",
                    path, len, offset
                ))
            } else {
                IdxError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        Self::ensure_parent(&full_path).await?;

        // write next to the target, then rename over it
        let file_name = full_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| IdxError::InvalidUrl(format!("invalid object path '{}'", path)))?;
        let tmp_path = full_path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &full_path).await?;
            Ok::<_, IdxError>(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        Ok(fs::try_exists(&full_path).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::remove_file(&full_path)
            .await
            .map_err(|e| not_found(path, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.full_path(prefix);
        let mut entries = Vec::new();
        let mut pending = vec![(root, prefix.trim_matches('/').to_string())];

        while let Some((dir, key)) = pending.pop() {
            if !fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            let mut read_dir = fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let name = match entry.file_name().to_str() {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                // skip in-flight temporaries
                if name.starts_with('.') && name.ends_with(".tmp") {
                    continue;
                }
                let child = if key.is_empty() {
                    name
                } else {
                    format!("{}/{}", key, name)
                };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), child));
                } else {
                    entries.push(child);
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| not_found(path, e))?;
        Ok(metadata.len())
    }

    async fn try_lock(&self, path: &str, owner: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        Self::ensure_parent(&full_path).await?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await
        {
            Ok(mut file) => {
                file.write_all(owner.as_bytes()).await?;
                file.sync_all().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(IdxError::Io(e)),
        }
    }

    fn unlock(&self, path: &str) -> Result<()> {
        match std::fs::remove_file(self.full_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IdxError::Io(e)),
        }
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-process object store. Clones share the same objects.
#[derive(Clone, Default)]
pub struct MemoryIOManager {
    objects: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl IOManager for MemoryIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(&Self::key(path))
            .cloned()
            .ok_or_else(|| IdxError::NotFound(path.to_string()))
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        let data = self.read(path).await?;
        let end = range_end(path, offset, len)?;
        if end > data.len() as u64 {
            return Err(IdxError::ReadFailure(format!(
                "{}: range {}..{} beyond object of {} bytes",
                path,
                offset,
                end,
                data.len()
            )));
        }
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects
            .write()
            .insert(Self::key(path), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(&Self::key(path)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .remove(&Self::key(path))
            .map(|_| ())
            .ok_or_else(|| IdxError::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Self::key(prefix);
        Ok(self
            .objects
            .read()
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| prefix.is_empty() || *k == &prefix || k[prefix.len()..].starts_with('/'))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn size(&self, path: &str) -> Result<u64> {
        Ok(self.read(path).await?.len() as u64)
    }

    async fn try_lock(&self, path: &str, owner: &str) -> Result<bool> {
        let mut objects = self.objects.write();
        let key = Self::key(path);
        if objects.contains_key(&key) {
            return Ok(false);
        }
        objects.insert(key, Bytes::copy_from_slice(owner.as_bytes()));
        Ok(true)
    }

    fn unlock(&self, path: &str) -> Result<()> {
        self.objects.write().remove(&Self::key(path));
        Ok(())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Remote endpoint serving objects at `<base_url>/<path>` through GET, PUT,
/// HEAD and DELETE. Locking is left to the server.
#[cfg(feature = "http-client")]
pub struct HttpIOManager {
    base_url: String,
    client: reqwest::Client,
}

#[cfg(feature = "http-client")]
impl HttpIOManager {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| IdxError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn check(path: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(IdxError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(IdxError::Network(format!("{}: HTTP {}", path, status.as_u16())));
        }
        Ok(response)
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl IOManager for HttpIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let response = self.client.get(self.url(path)).send().await?;
        Ok(Self::check(path, response)?.bytes().await?)
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let end = range_end(path, offset, len)?;
        let range_header = format!("bytes={}-{}", offset, end - 1);
        let response = self
            .client
            .get(self.url(path))
            .header("Range", range_header)
            .send()
            .await?;
        let response = Self::check(path, response)?;
        let partial = response.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let data = response.bytes().await?;
        // servers ignoring Range answer with the whole object
        let data = if partial {
            data
        } else {
            if end > data.len() as u64 {
                return Err(IdxError::ReadFailure(format!("{}: short read", path)));
            }
            data.slice(offset as usize..end as usize)
        };
        if data.len() as u64 != len {
            return Err(IdxError::ReadFailure(format!("{}: short read", path)));
        }
        Ok(data)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let response = self
            .client
            .put(self.url(path))
            .body(data.to_vec())
            .send()
            .await?;
        Self::check(path, response)
            .map(|_| ())
            .map_err(|e| IdxError::WriteError(e.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let response = self.client.head(self.url(path)).send().await?;
        match Self::check(path, response) {
            Ok(_) => Ok(true),
            Err(IdxError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self.client.delete(self.url(path)).send().await?;
        Self::check(path, response).map(|_| ())
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(IdxError::Configuration(
            "listing is not supported by the HTTP backend".to_string(),
        ))
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let response = self.client.head(self.url(path)).send().await?;
        let response = Self::check(path, response)?;
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| IdxError::Network(format!("{}: missing content length", path)))
    }

    async fn try_lock(&self, _path: &str, _owner: &str) -> Result<bool> {
        Ok(true)
    }

    fn unlock(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Http
    }
}

/// Parse URL and create appropriate I/O manager
///
/// `file://` (or a bare path) opens a directory, `memory://` a fresh
/// in-process store, and `http(s)://` a remote endpoint when the
/// `http-client` feature is enabled.
pub fn create_io_manager(url: &str) -> Result<Arc<dyn IOManager>> {
    let backend = StorageBackend::from_url(url)?;

    match backend {
        StorageBackend::FileSystem => {
            // Extract path from file:// URL or use as-is
            let path = url.strip_prefix("file://").unwrap_or(url);
            if path.is_empty() {
                return Err(IdxError::InvalidUrl("empty dataset path".to_string()));
            }
            Ok(Arc::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::Memory => Ok(Arc::new(MemoryIOManager::new())),
        #[cfg(feature = "http-client")]
        StorageBackend::Http => Ok(Arc::new(HttpIOManager::new(url)?)),
        #[cfg(not(feature = "http-client"))]
        StorageBackend::Http => Err(IdxError::Configuration(format!(
            "{} needs the http-client feature",
            url
        ))),
    }
}

/// Memory backend with injectable faults, for tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Default)]
    pub(crate) struct FaultyIOManager {
        pub inner: MemoryIOManager,
        /// Fail every read like an HTTP 500
        pub fail_reads: std::sync::atomic::AtomicBool,
        /// Fail writes to this path
        pub fail_writes_to: RwLock<Option<String>>,
        /// Number of writes and bytes written
        pub writes: RwLock<(usize, u64)>,
    }

    impl FaultyIOManager {
        fn check_read(&self, path: &str) -> Result<()> {
            if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(IdxError::Network(format!("{}: HTTP 500", path)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl IOManager for FaultyIOManager {
        async fn read(&self, path: &str) -> Result<Bytes> {
            self.check_read(path)?;
            self.inner.read(path).await
        }
        async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
            self.check_read(path)?;
            self.inner.read_range(path, offset, len).await
        }
        async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
            if self.fail_writes_to.read().as_deref() == Some(path) {
                return Err(IdxError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    path.to_string(),
                )));
            }
            {
                let mut writes = self.writes.write();
                writes.0 += 1;
                writes.1 += data.len() as u64;
            }
            self.inner.write(path, data).await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        async fn size(&self, path: &str) -> Result<u64> {
            self.inner.size(path).await
        }
        async fn try_lock(&self, path: &str, owner: &str) -> Result<bool> {
            self.inner.try_lock(path, owner).await
        }
        fn unlock(&self, path: &str) -> Result<()> {
            self.inner.unlock(path)
        }
        fn backend(&self) -> StorageBackend {
            StorageBackend::Memory
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise(io: &dyn IOManager) {
        // Write
        let data = b"Hello, blocks!";
        io.write("data/a/test.dat", data).await.unwrap();

        // Read
        let read_data = io.read("data/a/test.dat").await.unwrap();
        assert_eq!(&read_data[..], data);
        let range = io.read_range("data/a/test.dat", 7, 6).await.unwrap();
        assert_eq!(&range[..], b"blocks");
        assert!(io.read_range("data/a/test.dat", 10, 10).await.is_err());
        assert!(matches!(
            io.read_range("data/a/test.dat", 7, u64::MAX / 2).await,
            Err(IdxError::ReadFailure(_))
        ));
        assert!(matches!(
            io.read_range("data/a/test.dat", u64::MAX, 2).await,
            Err(IdxError::ReadFailure(_))
        ));

        // Overwrite
        io.write("data/a/test.dat", b"v2").await.unwrap();
        assert_eq!(&io.read("data/a/test.dat").await.unwrap()[..], b"v2");

        // Exists
        assert!(io.exists("data/a/test.dat").await.unwrap());
        assert!(!io.exists("nonexistent.dat").await.unwrap());
        assert!(io.read("nonexistent.dat").await.unwrap_err().is_not_found());

        // Size
        assert_eq!(io.size("data/a/test.dat").await.unwrap(), 2);

        // List
        io.write("data/b/other.dat", b"x").await.unwrap();
        io.write("dataset.json", b"{}").await.unwrap();
        assert_eq!(
            io.list("data").await.unwrap(),
            vec!["data/a/test.dat".to_string(), "data/b/other.dat".to_string()]
        );

        // Delete
        io.delete("data/a/test.dat").await.unwrap();
        assert!(!io.exists("data/a/test.dat").await.unwrap());
        assert!(io.delete("data/a/test.dat").await.unwrap_err().is_not_found());

        // Lock
        assert!(io.try_lock("dataset.lock", "one").await.unwrap());
        assert!(!io.try_lock("dataset.lock", "two").await.unwrap());
        io.unlock("dataset.lock").unwrap();
        assert!(io.try_lock("dataset.lock", "two").await.unwrap());
        io.unlock("dataset.lock").unwrap();
        io.unlock("dataset.lock").unwrap();
    }

    #[tokio::test]
    async fn test_file_system_io() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        exercise(&io).await;
    }

    #[tokio::test]
    async fn test_memory_io() {
        let io = MemoryIOManager::new();
        exercise(&io).await;
        let shared = io.clone();
        io.write("x", b"1").await.unwrap();
        assert!(shared.exists("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_system_write_leaves_no_temporaries() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        for i in 0..5u8 {
            io.write("obj.bin", &[i; 16]).await.unwrap();
        }
        let names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["obj.bin".to_string()]);
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            StorageBackend::from_url("file:///data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("/data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("memory://scratch").unwrap(),
            StorageBackend::Memory
        );
        assert_eq!(
            StorageBackend::from_url("https://host/ds").unwrap(),
            StorageBackend::Http
        );
        assert!(StorageBackend::from_url("s3://bucket/volume").is_err());
    }

    #[test]
    fn test_create_io_manager() {
        assert_eq!(
            create_io_manager("memory://x").unwrap().backend(),
            StorageBackend::Memory
        );
        assert_eq!(
            create_io_manager("file:///tmp/ds").unwrap().backend(),
            StorageBackend::FileSystem
        );
        assert!(create_io_manager("file://").is_err());
    }
}
