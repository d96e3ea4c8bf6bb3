//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::{self, Error},
        errstr,
        fcall::*,
        io_err, serialize,
        session::{Conn, SessionTable},
        utils::{self, ListenAddr, Result},
    },
    async_trait::async_trait,
    bytes::Bytes,
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::Mutex,
        task::JoinSet,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{BytesCodec, FramedWrite, length_delimited::LengthDelimitedCodec},
};

/// Filesystem server trait for implementing 9P2000 servers.
///
/// Implementors can represent an error condition by returning an `Err`.
/// Otherwise, they must return the appropriate `FCall` response with required fields.
///
/// Every operation has a default implementation, so a filesystem only
/// overrides what it supports. Operations left alone answer "not implemented",
/// except `rauth` whose default tells the client that no authentication is
/// required. Version negotiation and flush are answered by the dispatcher
/// itself and never reach the filesystem.
///
/// The fids of a connection live in its session table, reached through the
/// [`Conn`] handed to every call. `rattach` is expected to create the session
/// with [`Conn::attach`]; the dispatcher drops it when the connection closes.
///
/// # Example
/// ```no_run
/// use kv9p::{FCall, Qid, QidType, Result, session::{Binding, Conn}, srv::Filesystem};
/// use async_trait::async_trait;
///
/// struct Empty;
///
/// #[async_trait]
/// impl Filesystem for Empty {
///     async fn rattach(&self, conn: &Conn, fid: u32, _afid: u32, _uname: &str, _aname: &str) -> Result<FCall> {
///         let qid = Qid { typ: QidType::DIR, version: 1, path: 0 };
///         conn.attach(fid, Binding::new(qid, Vec::new())).await;
///         Ok(FCall::RAttach { qid })
///     }
/// }
/// ```
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Start an authentication conversation on `afid`.
    ///
    /// # Returns
    /// `FCall::RAuth` with the qid of the auth file, or an error. The
    /// default answers "auth not required".
    async fn rauth(&self, _: &Conn, _afid: u32, _uname: &str, _aname: &str) -> Result<FCall> {
        Err(Error::from(errstr::ENOAUTH))
    }

    /// Attach to the filesystem root.
    ///
    /// This is the first operation performed by a client to reach the tree.
    /// It binds `fid` to the root (or the tree named by `aname`) and creates
    /// the connection's session.
    ///
    /// # Returns
    /// `FCall::RAttach` containing the root qid, or an error.
    async fn rattach(
        &self,
        _: &Conn,
        _fid: u32,
        _afid: u32,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Walk the directory tree.
    ///
    /// Traverses the tree from `fid` by following `wnames` and binds `newfid`
    /// to the destination. `newfid` may equal `fid`.
    ///
    /// # Returns
    /// `FCall::RWalk` containing a qid for each traversed component, or an error.
    async fn rwalk(&self, _: &Conn, _fid: u32, _newfid: u32, _wnames: &[String]) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Prepare a fid for I/O.
    ///
    /// # Returns
    /// `FCall::ROpen` containing the qid and the maximum transfer size, or an error.
    async fn ropen(&self, _: &Conn, _fid: u32, _mode: u8) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Create a file in the directory of `fid`.
    async fn rcreate(
        &self,
        _: &Conn,
        _fid: u32,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Read data from a file.
    ///
    /// # Returns
    /// `FCall::RRead` containing at most `count` bytes starting at `offset`,
    /// or an error.
    async fn rread(&self, _: &Conn, _fid: u32, _offset: u64, _count: u32) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Write data to a file.
    async fn rwrite(&self, _: &Conn, _fid: u32, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Forget a fid.
    ///
    /// # Returns
    /// `FCall::RClunk` on success, or an error.
    async fn rclunk(&self, _: &Conn, _fid: u32) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Remove the file of `fid` and clunk it.
    async fn rremove(&self, _: &Conn, _fid: u32) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Get file metadata.
    ///
    /// # Returns
    /// `FCall::RStat` with the file's `Stat`, or an error.
    async fn rstat(&self, _: &Conn, _fid: u32) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Change file metadata.
    async fn rwstat(&self, _: &Conn, _fid: u32, _stat: &Stat) -> Result<FCall> {
        Err(Error::NotImplemented)
    }

    /// Called when a connection fails at the transport level.
    /// The connection is closed afterwards.
    fn conn_error(&self, conn: &Conn, err: &Error) {
        error!("connection {}: {}: {:?}", conn.id(), err, err);
    }
}

#[rustfmt::skip]
async fn dispatch_once<Fs>(msg: &Msg, fs: &Fs, conn: &Conn) -> Result<FCall>
where
    Fs: Filesystem + ?Sized,
{
    use crate::FCall::*;

    match msg.body {
        TVersion { msize, ref version }             => Ok(RVersion { msize, version: version.clone() }),
        TFlush { oldtag: _ }                        => Ok(RFlush),
        TAuth { afid, ref uname, ref aname }        => fs.rauth(conn, afid, uname, aname).await,
        TAttach { fid, afid, ref uname, ref aname } => fs.rattach(conn, fid, afid, uname, aname).await,
        TWalk { fid, newfid, ref wnames }           => fs.rwalk(conn, fid, newfid, wnames).await,
        TOpen { fid, mode }                         => fs.ropen(conn, fid, mode).await,
        TCreate { fid, ref name, perm, mode }       => fs.rcreate(conn, fid, name, perm, mode).await,
        TRead { fid, offset, count }                => fs.rread(conn, fid, offset, count).await,
        TWrite { fid, offset, ref data }            => fs.rwrite(conn, fid, offset, data).await,
        TClunk { fid }                              => fs.rclunk(conn, fid).await,
        TRemove { fid }                             => fs.rremove(conn, fid).await,
        TStat { fid }                               => fs.rstat(conn, fid).await,
        TWStat { fid, ref stat }                    => fs.rwstat(conn, fid, stat).await,
        _                                           => Err(Error::Protocol),
    }
}

/// Drive one connection: read frames in order, handle each one on its own
/// task and write the replies back through a single locked writer.
async fn dispatch<Fs, Reader, Writer>(
    filesystem: Arc<Fs>,
    conn: Conn,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    Fs: 'static + Filesystem + ?Sized,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    // The size field counts itself; keep it in the frame
    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(0)
        .num_skip(0)
        .little_endian()
        .new_read(reader);
    let framedwrite = Arc::new(Mutex::new(FramedWrite::new(writer, BytesCodec::new())));

    let mut inflight = JoinSet::new();

    let result: Result<()> = loop {
        let bytes = match framedread.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        };

        let (header, msg) = match serialize::decode_frame(&bytes) {
            Ok(decoded) => decoded,
            Err(e) => break Err(e.into()),
        };
        debug!("\t← {:?}", msg);

        let fs = filesystem.clone();
        let conn = conn.clone();
        let framedwrite = framedwrite.clone();

        inflight.spawn(async move {
            let response_fcall = dispatch_once(&msg, &*fs, &conn)
                .await
                .unwrap_or_else(|e| {
                    error!("{:?}: Error: \"{}\": {:?}", header.typ, e, e);
                    FCall::RError { ename: e.ename() }
                });

            let Some((response, frame)) = reply_frame(msg.tag, response_fcall) else {
                return;
            };

            {
                let mut framedwrite_locked = framedwrite.lock().await;
                if let Err(e) = framedwrite_locked.send(frame).await {
                    fs.conn_error(&conn, &e.into());
                    return;
                }
            }
            debug!("\t→ {:?}", response);
        });

        // Reap finished handlers so the set only holds in-flight ones
        while inflight.try_join_next().is_some() {}
    };

    // Let pending replies go out before the session disappears
    while inflight.join_next().await.is_some() {}

    result
}

/// Frame the reply to `tag`. A reply that cannot be sent as is turns into
/// an Rerror, so the tag is always answered.
fn reply_frame(tag: u16, body: FCall) -> Option<(Msg, Bytes)> {
    let body = if body.is_r() {
        body
    } else {
        error!("Handler for tag {} returned a non-reply {:?}", tag, body);
        FCall::RError {
            ename: errstr::EBADREPLY.to_owned(),
        }
    };

    let response = Msg { tag, body };
    let e = match serialize::encode_frame(&response) {
        Ok(frame) => return Some((response, Bytes::from(frame))),
        Err(e) => e,
    };
    error!("Failed to serialize response for tag {}: {:?}", tag, e);

    let response = Msg {
        tag,
        body: FCall::RError { ename: e.to_string() },
    };
    match serialize::encode_frame(&response) {
        Ok(frame) => Some((response, Bytes::from(frame))),
        Err(e) => {
            error!("Failed to serialize error for tag {}: {:?}", tag, e);
            None
        }
    }
}

/// Serve one established connection until the peer goes away.
///
/// A fresh connection id is taken from `sessions`. Transport errors are
/// reported through [`Filesystem::conn_error`]; in every case the
/// connection's session is dropped on return.
pub async fn serve_conn<Fs, Reader, Writer>(
    filesystem: Arc<Fs>,
    sessions: Arc<SessionTable>,
    reader: Reader,
    writer: Writer,
) where
    Fs: 'static + Filesystem + ?Sized,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let conn = Conn::new(sessions.next_conn_id(), sessions.clone());

    if let Err(e) = dispatch(filesystem.clone(), conn.clone(), reader, writer).await {
        filesystem.conn_error(&conn, &e);
    }

    if let Some(session) = sessions.drop_connection(conn.id()).await {
        debug!("connection {} closed, released {} fids", conn.id(), session.len());
    }
}

/// Accept connections from an already bound TCP listener forever
pub async fn serve_tcp<Fs>(filesystem: Arc<Fs>, listener: TcpListener) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let sessions = Arc::new(SessionTable::new());

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            serve_conn(fs, sessions, readhalf, writehalf).await;
        });
    }
}

pub async fn srv_async_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    serve_tcp(Arc::new(filesystem), listener).await
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// Serve on a unix domain socket until SIGINT or SIGTERM.
///
/// The socket file is removed on the way out.
pub async fn srv_async_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;
    info!("listening on {:?}", listener.path);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let filesystem = Arc::new(filesystem);
    let sessions = Arc::new(SessionTable::new());

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    info!("accepted: {:?}", peer);

                    let fs = filesystem.clone();
                    let sessions = sessions.clone();
                    tokio::spawn(async move {
                        let (readhalf, writehalf) = tokio::io::split(stream);
                        serve_conn(fs, sessions, readhalf, writehalf).await;
                    });
                }
                Err(e) => error!("accept: {}", e),
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Serve `filesystem` on `addr`, see [`utils::parse_listen_addr`] for the
/// accepted address forms.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    match utils::parse_listen_addr(addr) {
        Some(ListenAddr::Tcp(listen_addr)) => srv_async_tcp(filesystem, &listen_addr).await,
        Some(ListenAddr::Unix(path)) => srv_async_unix(filesystem, path).await,
        None => Err(error::Error::from(io_err!(
            InvalidInput,
            "Invalid protocol or address"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::session::Binding,
        byteorder::{ByteOrder, LittleEndian},
        std::collections::HashSet,
        tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    };

    /// Implements nothing at all
    struct Nothing;

    #[async_trait]
    impl Filesystem for Nothing {}

    /// Attaches, and answers reads with `count` copies of the low byte of
    /// `offset` after a delay that shrinks as the offset grows
    struct Slow;

    #[async_trait]
    impl Filesystem for Slow {
        async fn rattach(&self, conn: &Conn, fid: u32, _: u32, _: &str, _: &str) -> Result<FCall> {
            let qid = Qid {
                typ: QidType::DIR,
                version: 1,
                path: 0,
            };
            conn.attach(fid, Binding::new(qid, Vec::new())).await;
            Ok(FCall::RAttach { qid })
        }

        async fn rread(&self, conn: &Conn, fid: u32, offset: u64, count: u32) -> Result<FCall> {
            conn.lookup(fid).await?;
            tokio::time::sleep(Duration::from_millis(20 - (offset % 20))).await;
            Ok(FCall::RRead {
                data: Data(vec![offset as u8; count as usize]),
            })
        }
    }

    /// Answers stat with an error too long to encode and clunk with a request
    struct Broken;

    #[async_trait]
    impl Filesystem for Broken {
        async fn rstat(&self, _: &Conn, _fid: u32) -> Result<FCall> {
            Ok(FCall::RError {
                ename: "x".repeat(70000),
            })
        }

        async fn rclunk(&self, _: &Conn, fid: u32) -> Result<FCall> {
            Ok(FCall::TClunk { fid })
        }
    }

    fn start<Fs: 'static + Filesystem>(fs: Fs) -> (DuplexStream, Arc<SessionTable>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let sessions = Arc::new(SessionTable::new());
        let (r, w) = tokio::io::split(server);
        tokio::spawn(serve_conn(Arc::new(fs), sessions.clone(), r, w));
        (client, sessions)
    }

    async fn send(client: &mut DuplexStream, tag: u16, body: FCall) {
        let frame = serialize::encode_frame(&Msg { tag, body }).unwrap();
        client.write_all(&frame).await.unwrap();
    }

    async fn recv(client: &mut DuplexStream) -> Msg {
        let mut size = [0; 4];
        client.read_exact(&mut size).await.unwrap();
        let mut frame = size.to_vec();
        frame.resize(LittleEndian::read_u32(&size) as usize, 0);
        client.read_exact(&mut frame[4..]).await.unwrap();
        serialize::decode_frame(&frame).unwrap().1
    }

    async fn rpc(client: &mut DuplexStream, tag: u16, body: FCall) -> FCall {
        send(client, tag, body).await;
        let reply = recv(client).await;
        assert_eq!(reply.tag, tag);
        reply.body
    }

    fn rerror(s: &str) -> FCall {
        FCall::RError {
            ename: s.to_owned(),
        }
    }

    #[tokio::test]
    async fn version_is_echoed() {
        let (mut client, _) = start(Nothing);
        let reply = rpc(
            &mut client,
            NOTAG,
            FCall::TVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
        )
        .await;
        assert_eq!(
            reply,
            FCall::RVersion {
                msize: 8192,
                version: P92000.to_owned()
            }
        );

        // No negotiation, whatever the client says comes back
        let reply = rpc(
            &mut client,
            NOTAG,
            FCall::TVersion {
                msize: 77,
                version: "9P2000.L".to_owned(),
            },
        )
        .await;
        assert_eq!(
            reply,
            FCall::RVersion {
                msize: 77,
                version: "9P2000.L".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn defaults_answer_with_errors() {
        let (mut client, _) = start(Nothing);

        let auth = FCall::TAuth {
            afid: 0,
            uname: "glenda".to_owned(),
            aname: String::new(),
        };
        assert_eq!(rpc(&mut client, 1, auth).await, rerror("auth not required"));

        let attach = FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
        };
        assert_eq!(rpc(&mut client, 2, attach).await, rerror("not implemented"));

        let create = FCall::TCreate {
            fid: 0,
            name: "x".to_owned(),
            perm: 0o644,
            mode: om::WRITE,
        };
        assert_eq!(rpc(&mut client, 3, create).await, rerror("not implemented"));

        // The connection survives handler failures
        assert_eq!(rpc(&mut client, 4, FCall::TFlush { oldtag: 2 }).await, FCall::RFlush);
    }

    #[tokio::test]
    async fn unknown_and_reply_messages_are_unknown_commands() {
        let (mut client, _) = start(Nothing);

        let unknown = FCall::Unknown {
            typ: 12,
            raw: vec![1, 2, 3, 4],
        };
        assert_eq!(rpc(&mut client, 9, unknown).await, rerror("unknown command"));
        assert_eq!(rpc(&mut client, 10, FCall::RClunk).await, rerror("unknown command"));
    }

    #[tokio::test]
    async fn session_is_dropped_with_the_connection() {
        let (mut client, sessions) = start(Slow);
        let attach = FCall::TAttach {
            fid: 1,
            afid: NOFID,
            uname: String::new(),
            aname: String::new(),
        };
        assert!(matches!(rpc(&mut client, 1, attach).await, FCall::RAttach { .. }));
        assert_eq!(sessions.len().await, 1);

        drop(client);
        for _ in 0..100 {
            if sessions.is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session outlived its connection");
    }

    #[tokio::test]
    async fn concurrent_replies_are_never_interleaved() {
        let (mut client, _) = start(Slow);
        let attach = FCall::TAttach {
            fid: 1,
            afid: NOFID,
            uname: String::new(),
            aname: String::new(),
        };
        assert!(matches!(rpc(&mut client, 0, attach).await, FCall::RAttach { .. }));

        const N: u16 = 64;
        for tag in 1..=N {
            let read = FCall::TRead {
                fid: 1,
                offset: tag as u64,
                count: 1000 + tag as u32,
            };
            send(&mut client, tag, read).await;
        }

        let mut seen = HashSet::new();
        for _ in 1..=N {
            let reply = recv(&mut client).await;
            match reply.body {
                FCall::RRead { data } => {
                    assert_eq!(data.0.len(), 1000 + reply.tag as usize);
                    assert!(data.0.iter().all(|&b| b == reply.tag as u8));
                }
                other => panic!("unexpected reply {:?}", other),
            }
            assert!(seen.insert(reply.tag));
        }
        assert_eq!(seen.len(), N as usize);
    }

    #[tokio::test]
    async fn unsendable_replies_become_errors() {
        let (mut client, _) = start(Broken);

        match rpc(&mut client, 21, FCall::TStat { fid: 1 }).await {
            FCall::RError { ename } => assert_eq!(ename, "String too long"),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(
            rpc(&mut client, 22, FCall::TClunk { fid: 1 }).await,
            rerror("invalid reply")
        );
        assert_eq!(rpc(&mut client, 23, FCall::TFlush { oldtag: 21 }).await, FCall::RFlush);
    }

    #[tokio::test]
    async fn pending_replies_survive_a_bad_frame() {
        let (mut client, _) = start(Slow);
        let attach = FCall::TAttach {
            fid: 1,
            afid: NOFID,
            uname: String::new(),
            aname: String::new(),
        };
        assert!(matches!(rpc(&mut client, 0, attach).await, FCall::RAttach { .. }));

        let read = FCall::TRead {
            fid: 1,
            offset: 0,
            count: 10,
        };
        send(&mut client, 5, read).await;
        // Too short to hold a header
        client.write_all(&[5, 0, 0, 0, 100]).await.unwrap();

        let reply = recv(&mut client).await;
        assert_eq!(reply.tag, 5);
        assert_eq!(
            reply.body,
            FCall::RRead {
                data: Data(vec![0; 10])
            }
        );

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
