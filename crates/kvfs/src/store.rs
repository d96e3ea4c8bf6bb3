//! Key-value stores the file tree can be served from.

use {
    async_trait::async_trait,
    bitflags::bitflags,
    kv9p::{Error, Result, io_err, res},
    log::{debug, warn},
    std::{
        collections::HashMap,
        fmt::Write as _,
        io,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
    },
    tokio::{fs, io::AsyncWriteExt, sync::RwLock},
};

/// Access to a flat byte-valued key space.
///
/// Implementations do their own locking; every method may be called from
/// many tasks at once.
#[async_trait]
pub trait Store: Send + Sync {
    async fn exists(&self, key: &str) -> bool;

    /// Length of the value under `key`
    async fn size_of(&self, key: &str) -> Result<u64>;

    /// The whole value under `key`
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;

    /// Insert or replace the value under `key`
    async fn store(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Flush whatever the store buffers. The store stays usable.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn exists(&self, key: &str) -> bool {
        (**self).exists(key).await
    }

    async fn size_of(&self, key: &str) -> Result<u64> {
        (**self).size_of(key).await
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        (**self).fetch(key).await
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).store(key, value).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// A store living in memory only
#[derive(Debug, Default)]
pub struct MemStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        Default::default()
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for MemStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        MemStore {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn exists(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    async fn size_of(&self, key: &str) -> Result<u64> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|v| v.len() as u64)
            .ok_or(Error::NotFound)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.entries.read().await;
        entries.get(key).cloned().ok_or(Error::NotFound)
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}

bitflags! {
    /// How a [`DirStore`] is opened
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StoreFlags: u32 {
        /// Create the database directory if it is missing
        const CREATE = 0x1;
        /// Sync every value to disk before `store` returns
        const SYNC   = 0x2;
    }
}

/// A store keeping one file per key under `<directory>/<name>`.
///
/// File names are the keys with everything but ASCII alphanumerics, `-` and
/// `_` escaped as `%XX`, so any key maps to a single plain file name.
/// Values are written to a temporary file and renamed into place, readers
/// never see half a value.
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
    flags: StoreFlags,
    tmp_seq: AtomicU64,
}

impl DirStore {
    /// Open the database `name` inside `directory`
    pub async fn open(
        directory: impl AsRef<Path>,
        name: &str,
        flags: StoreFlags,
    ) -> Result<DirStore> {
        if name.is_empty() {
            return res!(io_err!(InvalidInput, "empty database name"));
        }
        let root = directory.as_ref().join(escape_key(name));

        if flags.contains(StoreFlags::CREATE) {
            fs::create_dir_all(&root).await?;
        }
        if !fs::metadata(&root).await?.is_dir() {
            return res!(io_err!(Other, "database must be a directory"));
        }

        debug!("opened store {:?} with {:?}", root, flags);
        Ok(DirStore {
            root,
            flags,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return res!(io_err!(InvalidInput, "empty key"));
        }
        Ok(self.root.join(escape_key(key)))
    }
}

/// Escape a key into a file name, see [`DirStore`]
pub fn escape_key(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            name.push(b as char);
        } else {
            let _ = write!(name, "%{:02X}", b);
        }
    }
    name
}

fn not_found(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound,
        _ => Error::Io(e),
    }
}

#[async_trait]
impl Store for DirStore {
    async fn exists(&self, key: &str) -> bool {
        let Ok(path) = self.path_of(key) else {
            return false;
        };
        match fs::try_exists(&path).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("exists {:?}: {}", path, e);
                false
            }
        }
    }

    async fn size_of(&self, key: &str) -> Result<u64> {
        let path = self.path_of(key)?;
        let attr = fs::metadata(&path).await.map_err(not_found)?;
        Ok(attr.len())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        fs::read(&path).await.map_err(not_found)
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_of(key)?;
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        // Escaped names never start with a dot
        let tmp = self.root.join(format!(".tmp-{}-{}", seq, escape_key(key)));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(value).await?;
        if self.flags.contains(StoreFlags::SYNC) {
            file.sync_all().await?;
        }
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path).await {
            if let Err(e) = fs::remove_file(&tmp).await {
                warn!("leaving {:?} behind: {}", tmp, e);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.flags.contains(StoreFlags::SYNC) {
            fs::File::open(&self.root).await?.sync_all().await?;
        }
        Ok(())
    }
}
