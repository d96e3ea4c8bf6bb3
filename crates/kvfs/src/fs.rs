//! The key-value store seen as a read-only 9P file tree.
//!
//! A path of walked names maps to the store key made by joining the names
//! with `/`. The root is a directory that always exists, `/ctl` is a
//! synthetic file that is never looked up in the store, and every other path
//! exists exactly when its key does.

use {
    crate::store::Store,
    async_trait::async_trait,
    kv9p::{
        serialize::{Decodable, Encodable},
        session::{Binding, Conn},
        srv::Filesystem,
        *,
    },
    log::{debug, warn},
    std::time::{SystemTime, UNIX_EPOCH},
};

/// Name of the synthetic control file at the root
pub const CTL_NAME: &str = "ctl";

/// Prefix of the keys holding cached stat records
pub const META_PREFIX: &str = "_ofsmeta_";

/// Transfer size announced by open
pub const IOUNIT: u32 = 4096;

const OWNER: &str = "none";

const ROOT_QID: Qid = Qid {
    typ: QidType::DIR,
    version: 1,
    path: 0,
};

const CTL_QID: Qid = Qid {
    typ: QidType::FILE,
    version: 1,
    path: 1,
};

const FILE_QID: Qid = Qid {
    typ: QidType::FILE,
    version: 1,
    path: 0,
};

/// Store key of a walked path
pub fn key(path: &[String]) -> String {
    path.join("/")
}

fn is_ctl(path: &[String]) -> bool {
    matches!(path, [name] if name == CTL_NAME)
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

fn synthetic_stat(qid: Qid, mode: u32, atime: u32, mtime: u32, length: u64, name: String) -> Stat {
    Stat {
        typ: 0,
        dev: 0,
        qid,
        mode,
        atime,
        mtime,
        length,
        name,
        uid: OWNER.to_owned(),
        gid: OWNER.to_owned(),
        muid: OWNER.to_owned(),
    }
}

/// Serves the keys of `S` as files
#[derive(Debug)]
pub struct KvFs<S> {
    store: S,
}

impl<S: Store> KvFs<S> {
    pub fn new(store: S) -> KvFs<S> {
        KvFs { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Identity of the file at `path`
    pub async fn qid(&self, path: &[String]) -> Result<Qid> {
        if path.is_empty() {
            Ok(ROOT_QID)
        } else if is_ctl(path) {
            Ok(CTL_QID)
        } else if self.store.exists(&key(path)).await {
            Ok(FILE_QID)
        } else {
            Err(Error::NotFound)
        }
    }

    /// Metadata of the file at `path`.
    ///
    /// The record of a stored key is made once, on its first stat, and kept
    /// next to the value. Later changes to the value do not update it.
    pub async fn meta(&self, path: &[String]) -> Result<Stat> {
        if path.is_empty() {
            let now = now();
            return Ok(synthetic_stat(ROOT_QID, dm::DIR, now, now, 0, String::new()));
        }
        if is_ctl(path) {
            return Ok(synthetic_stat(CTL_QID, dm::DIR, now(), 0, 0, CTL_NAME.to_owned()));
        }

        let key = key(path);
        if !self.store.exists(&key).await {
            return Err(Error::NotFound);
        }

        let meta_key = format!("{}{}", META_PREFIX, key);
        if self.store.exists(&meta_key).await {
            let record = self.store.fetch(&meta_key).await?;
            match Stat::decode(&mut &record[..]) {
                Ok(stat) => return Ok(stat),
                Err(e) => warn!("ignoring bad stat record {:?}: {}", meta_key, e),
            }
        }

        let now = now();
        let length = self.store.size_of(&key).await?;
        let stat = synthetic_stat(FILE_QID, 0, now, now, length, key);

        let mut record = Vec::new();
        match stat.encode(&mut record) {
            Ok(_) => self.store.store(&meta_key, &record).await?,
            Err(e) => warn!("not caching stat of {:?}: {}", stat.name, e),
        }
        Ok(stat)
    }
}

#[async_trait]
impl<S: Store> Filesystem for KvFs<S> {
    async fn rattach(&self, conn: &Conn, fid: u32, _afid: u32, uname: &str, _aname: &str) -> Result<FCall> {
        debug!("attach fid {} for {:?} on connection {}", fid, uname, conn.id());
        conn.attach(fid, Binding::new(ROOT_QID, Vec::new())).await;

        Ok(FCall::RAttach { qid: ROOT_QID })
    }

    async fn rwalk(&self, conn: &Conn, fid: u32, newfid: u32, wnames: &[String]) -> Result<FCall> {
        let Binding { mut qid, mut path } = conn.lookup(fid).await?;

        let mut wqids = Vec::with_capacity(wnames.len());
        for name in wnames {
            match name.as_str() {
                "." => {}
                ".." => {
                    path.pop();
                    qid = self.qid(&path).await?;
                }
                _ => {
                    path.push(name.clone());
                    qid = self.qid(&path).await?;
                }
            }
            wqids.push(qid);
        }

        let binding = Binding::new(qid, path);
        if newfid == fid {
            conn.rebind(fid, binding).await?;
        } else {
            conn.bind(newfid, binding).await?;
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, conn: &Conn, fid: u32, _mode: u8) -> Result<FCall> {
        let binding = conn.lookup(fid).await?;

        Ok(FCall::ROpen {
            qid: binding.qid,
            iounit: IOUNIT,
        })
    }

    async fn rread(&self, conn: &Conn, fid: u32, offset: u64, count: u32) -> Result<FCall> {
        let binding = conn.lookup(fid).await?;

        if binding.qid.is_dir() {
            // TODO: list the keys under the directory as stat records
            return Err(Error::NotImplemented);
        }
        if is_ctl(&binding.path) {
            return Ok(FCall::RRead { data: Data(Vec::new()) });
        }

        let key = key(&binding.path);
        if !self.store.exists(&key).await {
            return Err(Error::NotFound);
        }
        if offset > self.store.size_of(&key).await? {
            return Ok(FCall::RRead { data: Data(Vec::new()) });
        }

        let mut value = self.store.fetch(&key).await?;
        let len = value.len() as u64;
        let end = offset.saturating_add(count as u64).min(len);
        let start = offset.min(end);
        value.truncate(end as usize);
        value.drain(..start as usize);

        Ok(FCall::RRead { data: Data(value) })
    }

    async fn rclunk(&self, conn: &Conn, fid: u32) -> Result<FCall> {
        conn.release(fid).await?;

        Ok(FCall::RClunk)
    }

    async fn rstat(&self, conn: &Conn, fid: u32) -> Result<FCall> {
        let binding = conn.lookup(fid).await?;

        Ok(FCall::RStat {
            stat: self.meta(&binding.path).await?,
        })
    }
}
