//! Per-connection fid tables.
//!
//! Every accepted connection gets a [`ConnId`]. Its session, the table of
//! fids the client has bound, is created by the first attach and dropped when
//! the connection goes away. Sessions of different connections never share
//! state: each one sits behind its own mutex and the table lock is only held
//! long enough to find or insert an entry.

use {
    crate::{error::Error, fcall::Qid, utils::Result},
    std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
    },
    tokio::sync::{Mutex, RwLock},
};

/// Identity of one accepted connection
pub type ConnId = u64;

/// What a fid currently points at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Binding {
    pub qid: Qid,
    /// Path components from the root, empty for the root itself
    pub path: Vec<String>,
}

impl Binding {
    pub fn new(qid: Qid, path: Vec<String>) -> Binding {
        Binding { qid, path }
    }
}

/// Fids bound on one connection
#[derive(Debug, Default)]
pub struct Session {
    fids: HashMap<u32, Binding>,
}

impl Session {
    pub fn len(&self) -> usize {
        self.fids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fids.is_empty()
    }
}

/// All live sessions, keyed by connection
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<ConnId, Arc<Mutex<Session>>>>,
    next_conn: AtomicU64,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        Default::default()
    }

    /// Hand out an identity for a freshly accepted connection
    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    async fn session(&self, conn: ConnId) -> Result<Arc<Mutex<Session>>> {
        let sessions = self.sessions.read().await;
        sessions.get(&conn).cloned().ok_or(Error::AccessDenied)
    }

    /// Bind `fid`, creating the connection's session if it has none yet
    pub async fn attach(&self, conn: ConnId, fid: u32, binding: Binding) {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.entry(conn).or_default().clone()
        };
        session.lock().await.fids.insert(fid, binding);
    }

    /// Bind `fid` on an existing session, replacing any previous binding
    pub async fn bind(&self, conn: ConnId, fid: u32, binding: Binding) -> Result<()> {
        let session = self.session(conn).await?;
        session.lock().await.fids.insert(fid, binding);
        Ok(())
    }

    /// Replace the binding of a fid that must already be bound
    pub async fn rebind(&self, conn: ConnId, fid: u32, binding: Binding) -> Result<()> {
        let session = self.session(conn).await?;
        let mut session = session.lock().await;
        let slot = session.fids.get_mut(&fid).ok_or(Error::UnknownFid)?;
        *slot = binding;
        Ok(())
    }

    pub async fn lookup(&self, conn: ConnId, fid: u32) -> Result<Binding> {
        let session = self.session(conn).await?;
        let session = session.lock().await;
        session.fids.get(&fid).cloned().ok_or(Error::UnknownFid)
    }

    /// Forget a fid, returning what it was bound to
    pub async fn release(&self, conn: ConnId, fid: u32) -> Result<Binding> {
        let session = self.session(conn).await?;
        let mut session = session.lock().await;
        session.fids.remove(&fid).ok_or(Error::UnknownFid)
    }

    /// Tear down the session of a closed connection, releasing all its fids
    pub async fn drop_connection(&self, conn: ConnId) -> Option<Session> {
        let session = self.sessions.write().await.remove(&conn)?;
        let session = std::mem::take(&mut *session.lock().await);
        Some(session)
    }

    /// Number of connections holding a session
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Handle on the session table scoped to one connection.
///
/// Passed to every `Filesystem` callback.
#[derive(Clone, Debug)]
pub struct Conn {
    id: ConnId,
    sessions: Arc<SessionTable>,
}

impl Conn {
    pub fn new(id: ConnId, sessions: Arc<SessionTable>) -> Conn {
        Conn { id, sessions }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub async fn attach(&self, fid: u32, binding: Binding) {
        self.sessions.attach(self.id, fid, binding).await
    }

    pub async fn bind(&self, fid: u32, binding: Binding) -> Result<()> {
        self.sessions.bind(self.id, fid, binding).await
    }

    pub async fn rebind(&self, fid: u32, binding: Binding) -> Result<()> {
        self.sessions.rebind(self.id, fid, binding).await
    }

    pub async fn lookup(&self, fid: u32) -> Result<Binding> {
        self.sessions.lookup(self.id, fid).await
    }

    pub async fn release(&self, fid: u32) -> Result<Binding> {
        self.sessions.release(self.id, fid).await
    }
}
