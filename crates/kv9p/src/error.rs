//! 9P error representations.
//!
//! In 9P2000, errors are reported to the client as a free-form string in
//! `RError`. Handlers return an [`Error`] and the dispatcher turns it into
//! that string with [`Error::ename`].

use std::{fmt, io};

/// Error strings carried in `RError`
pub mod string {
    pub const EDENIED: &str = "access denied";
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const ENOTFOUND: &str = "file not found";
    pub const ENOTIMPL: &str = "not implemented";
    pub const EUNKNOWNCMD: &str = "unknown command";
    pub const ENOAUTH: &str = "auth not required";
    pub const EBADREPLY: &str = "invalid reply";
}

/// Error type of the library and of `Filesystem` implementations
#[derive(Debug)]
pub enum Error {
    /// The connection has no session, i.e. it never attached
    AccessDenied,
    /// The fid is not bound on this connection
    UnknownFid,
    /// The path does not name anything in the tree
    NotFound,
    /// The operation is intentionally unsupported
    NotImplemented,
    /// The message type is not understood
    Protocol,
    /// Any other error string to hand to the client verbatim
    Ename(String),
    /// I/O error of the transport or the backing store
    Io(io::Error),
}

impl Error {
    /// The string sent to the client in `RError`
    pub fn ename(&self) -> String {
        match *self {
            Error::AccessDenied => string::EDENIED.to_owned(),
            Error::UnknownFid => string::EUNKNOWNFID.to_owned(),
            Error::NotFound => string::ENOTFOUND.to_owned(),
            Error::NotImplemented => string::ENOTIMPL.to_owned(),
            Error::Protocol => string::EUNKNOWNCMD.to_owned(),
            Error::Ename(ref s) => s.clone(),
            Error::Io(ref e) => e.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.ename())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl<'a> From<&'a str> for Error {
    fn from(s: &'a str) -> Self {
        Error::Ename(s.to_owned())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Ename(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_wire_strings() {
        assert_eq!(Error::AccessDenied.ename(), "access denied");
        assert_eq!(Error::UnknownFid.ename(), "unknown fid");
        assert_eq!(Error::NotImplemented.ename(), "not implemented");
        assert_eq!(Error::Protocol.ename(), "unknown command");
        assert_eq!(Error::from(string::ENOAUTH).to_string(), "auth not required");
    }

    #[test]
    fn io_errors_keep_their_message() {
        let e = Error::from(io::Error::other("disk on fire"));
        assert_eq!(e.ename(), "disk on fire");
        assert!(std::error::Error::source(&e).is_some());
    }
}
