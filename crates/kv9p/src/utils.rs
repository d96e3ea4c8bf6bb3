use {
    crate::{error, fcall::DEFAULT_PORT},
    std::path::PathBuf,
};

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Where the server listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenAddr {
    /// `host:port` suitable for `TcpListener::bind`
    Tcp(String),
    /// Path of a unix domain socket
    Unix(PathBuf),
}

pub fn parse_proto(arg: &str) -> Option<(&str, &str, Option<&str>)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next());

    Some((proto, addr, port))
}

/// Parse a listen address.
///
/// Accepted forms are `tcp!host!port`, `unix!path[!suffix]` and a bare
/// `host[:port]`. A host of `*` (or a leading `*`) listens on all interfaces
/// and a missing port falls back to the 9P default port.
pub fn parse_listen_addr(arg: &str) -> Option<ListenAddr> {
    if arg.contains('!') {
        return match parse_proto(arg)? {
            ("tcp", host, port) => Some(ListenAddr::Tcp(tcp_addr(host, port))),
            ("unix", path, _) if !path.is_empty() => Some(ListenAddr::Unix(PathBuf::from(path))),
            _ => None,
        };
    }

    let (host, port) = match arg.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (arg, None),
    };
    Some(ListenAddr::Tcp(tcp_addr(host, port)))
}

fn tcp_addr(host: &str, port: Option<&str>) -> String {
    let host = match host.strip_prefix('*').unwrap_or(host) {
        "" => "0.0.0.0",
        host => host,
    };
    match port {
        Some(port) if !port.is_empty() => format!("{}:{}", host, port),
        _ => format!("{}:{}", host, DEFAULT_PORT),
    }
}
