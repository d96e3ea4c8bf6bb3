//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/*
 * 9P magic numbers
 */
/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that authentication is
/// not required, the afid field in the attach message should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Size of the frame header: size[4] type[1] tag[2]
pub const HEADER_SIZE: u32 = 7;

/// Ample room for `TWrite`/`RRead` header
///
/// size[4] TRead/TWrite[1] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// 9P default port
pub const DEFAULT_PORT: u16 = 564;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 64;
}

/// Bits in Stat.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in Qid.typ
    ///
    /// # Protocol
    /// 9P2000
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bits for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bits for hard-link (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
///
/// # Protocol
/// 9P2000
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qid {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl Qid {
    /// Encoded size: typ[1] version[4] path[8]
    pub const SIZE: u16 = (size_of::<u8>() + size_of::<u32>() + size_of::<u64>()) as u16;

    pub fn is_dir(&self) -> bool {
        self.typ.contains(QidType::DIR)
    }
}

/// Plan 9 namespace metadata (somewhat like a unix fstat)
///
/// NOTE: Defined as `Dir` in libc.h of Plan 9
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: Qid,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Stat {
    /// Fixed part of the record, including its own size field
    pub const FIXED_SIZE: u16 = 41;

    /// Largest record that still fits behind the `n[2]` count of Rstat and Twstat
    pub const MAX_SIZE: usize = u16::MAX as usize - size_of::<u16>();

    /// Value of the leading size field: the encoded record minus the field itself.
    ///
    /// Only records up to [`Stat::MAX_SIZE`] can be encoded.
    pub fn size(&self) -> usize {
        Self::FIXED_SIZE as usize - size_of::<u16>()
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()
    }
}

/// Data type used in `RRead` and `TWrite`
///
/// # Protocol
/// 9P2000
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TError          = 106,  // Illegal, never used
        RError,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    ///
    /// Request and reply codes are paired, the reply being the odd one.
    pub fn is_r(&self) -> bool {
        (*self as u8) & 1 == 1
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: Qid,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: Qid,
    },
    RError {
        ename: String,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<Qid>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: Qid,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    RCreate {
        qid: Qid,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
    /// A message whose type this server does not understand.
    /// `raw` holds everything after the tag.
    Unknown {
        typ: u8,
        raw: Vec<u8>,
    },
}

impl FCall {
    /// Message type of a known message, `None` for `Unknown`
    pub fn msg_type(&self) -> Option<MsgType> {
        use crate::FCall::*;

        Some(match *self {
            TVersion { .. } => MsgType::TVersion,
            RVersion { .. } => MsgType::RVersion,
            TAuth { .. } => MsgType::TAuth,
            RAuth { .. } => MsgType::RAuth,
            TAttach { .. } => MsgType::TAttach,
            RAttach { .. } => MsgType::RAttach,
            RError { .. } => MsgType::RError,
            TFlush { .. } => MsgType::TFlush,
            RFlush => MsgType::RFlush,
            TWalk { .. } => MsgType::TWalk,
            RWalk { .. } => MsgType::RWalk,
            TOpen { .. } => MsgType::TOpen,
            ROpen { .. } => MsgType::ROpen,
            TCreate { .. } => MsgType::TCreate,
            RCreate { .. } => MsgType::RCreate,
            TRead { .. } => MsgType::TRead,
            RRead { .. } => MsgType::RRead,
            TWrite { .. } => MsgType::TWrite,
            RWrite { .. } => MsgType::RWrite,
            TClunk { .. } => MsgType::TClunk,
            RClunk => MsgType::RClunk,
            TRemove { .. } => MsgType::TRemove,
            RRemove => MsgType::RRemove,
            TStat { .. } => MsgType::TStat,
            RStat { .. } => MsgType::RStat,
            TWStat { .. } => MsgType::TWStat,
            RWStat => MsgType::RWStat,
            Unknown { .. } => return None,
        })
    }

    /// Raw type byte as it appears on the wire
    pub fn type_code(&self) -> u8 {
        match *self {
            FCall::Unknown { typ, .. } => typ,
            _ => self.msg_type().map_or(MsgType::TError as u8, |t| t as u8),
        }
    }

    /// If this is a reply the server may send back
    pub fn is_r(&self) -> bool {
        self.msg_type().is_some_and(|t| t.is_r())
    }

    /// Get the fids which self contains
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            FCall::TAttach { fid, afid, .. } if afid != NOFID => vec![fid, afid],
            FCall::TAttach { fid, .. } => vec![fid],
            FCall::TWalk { fid, newfid, .. } => vec![fid, newfid],
            FCall::TOpen { fid, .. } => vec![fid],
            FCall::TCreate { fid, .. } => vec![fid],
            FCall::TRead { fid, .. } => vec![fid],
            FCall::TWrite { fid, .. } => vec![fid],
            FCall::TClunk { fid } => vec![fid],
            FCall::TRemove { fid } => vec![fid],
            FCall::TStat { fid } => vec![fid],
            FCall::TWStat { fid, .. } => vec![fid],
            _ => Vec::new(),
        }
    }

    /// Get the qids which self contains
    pub fn qids(&self) -> Vec<Qid> {
        match *self {
            FCall::RAuth { aqid } => vec![aqid],
            FCall::RAttach { qid } => vec![qid],
            FCall::RWalk { ref wqids } => wqids.clone(),
            FCall::ROpen { qid, .. } => vec![qid],
            FCall::RCreate { qid, .. } => vec![qid],
            FCall::RStat { ref stat } => vec![stat.qid],
            _ => Vec::new(),
        }
    }
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: FCall,
}

/// Fixed header of a frame as it was read off the wire
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Total frame length, the size field included
    pub size: u32,
    pub typ: u8,
    pub tag: u16,
}
