//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err, res};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result, Write};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return res!(io_err!(InvalidInput, "String too long"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Record size of `stat` as written on the wire
fn stat_size(stat: &Stat) -> Result<u16> {
    match stat.size() {
        size if size <= Stat::MAX_SIZE => Ok(size as u16),
        _ => res!(io_err!(InvalidInput, "Stat too large")),
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = stat_size(self)?;
        match Encoder::new(w)
            << &size
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let buf = Encoder::new(w) << &self.body.type_code() << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            // stat[n] is preceded by its own byte count n[2]
            RStat { ref stat } => match stat_size(stat) {
                Ok(size) => buf << &(size + 2) << stat,
                Err(e) => SResult(Err(e)),
            },
            TWStat { ref fid, ref stat } => match stat_size(stat) {
                Ok(size) => buf << fid << &(size + 2) << stat,
                Err(e) => SResult(Err(e)),
            },
            RWStat => buf,
            Unknown { ref raw, .. } => match buf {
                SResult(Ok(mut enc)) => {
                    enc.bytes += raw.len();
                    match enc.writer.write_all(raw) {
                        Ok(()) => SResult(Ok(enc)),
                        Err(e) => SResult(Err(e)),
                    }
                }
                err => err,
            },
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let buf = read_exact(r, len as usize)?;
        if buf.contains(&0) {
            return res!(io_err!(InvalidData, "NUL in string"));
        }
        String::from_utf8(buf).map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: decode!(QidType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let stat = Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        };
        if stat.size() != size as usize {
            return res!(io_err!(InvalidData, "Stat record length mismatch"));
        }
        Ok(stat)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let typ: u8 = decode!(buf);
        let tag = decode!(buf);
        let body = match MsgType::from_u8(typ) {
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => {
                let _n: u16 = decode!(buf);
                FCall::RStat { stat: decode!(buf) }
            }
            Some(TWStat) => {
                let fid = decode!(buf);
                let _n: u16 = decode!(buf);
                FCall::TWStat {
                    fid,
                    stat: decode!(buf),
                }
            }
            Some(RWStat) => FCall::RWStat,
            Some(TError) | None => {
                let mut raw = Vec::new();
                buf.read_to_end(&mut raw)?;
                FCall::Unknown { typ, raw }
            }
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message (type, tag and body) from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message (type, tag and body) into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Decode one complete frame, size field included.
///
/// Bytes past the declared size are ignored.
pub fn decode_frame(frame: &[u8]) -> Result<(Header, Msg)> {
    if frame.len() < HEADER_SIZE as usize {
        return res!(io_err!(UnexpectedEof, "Short frame"));
    }
    let size = LittleEndian::read_u32(&frame[..4]);
    let mut body = frame
        .get(4..size as usize)
        .ok_or_else(|| io_err!(UnexpectedEof, "Frame shorter than its declared size"))?;

    let msg = read_msg(&mut body)?;
    let header = Header {
        size,
        typ: msg.body.type_code(),
        tag: msg.tag,
    };
    Ok((header, msg))
}

/// Encode a message into a complete frame whose leading size field
/// is `7 + body length`
pub fn encode_frame(msg: &Msg) -> Result<Vec<u8>> {
    let mut frame = vec![0; mem::size_of::<u32>()];
    let bytes = write_msg(&mut frame, msg)?;
    let size = u32::try_from(bytes + mem::size_of::<u32>())
        .map_err(|_| io_err!(InvalidInput, "Message too large"))?;
    LittleEndian::write_u32(&mut frame[..4], size);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn file_qid(path: u64) -> Qid {
        Qid {
            typ: QidType::FILE,
            version: 1,
            path,
        }
    }

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn decoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut decoder = Cursor::new(expected.clone());
        let mut actual: Vec<u8> = Vec::new();
        while let Ok(i) = Decodable::decode(&mut decoder) {
            actual.push(i);
        }
        assert_eq!(expected, actual);
    }

    #[test]
    fn rversion_is_bit_exact() {
        let msg = Msg {
            tag: NOTAG,
            body: FCall::RVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
        };
        let frame = encode_frame(&msg).unwrap();
        let expected: Vec<u8> = vec![
            19, 0, 0, 0, // size
            101, // RVersion
            0xff, 0xff, // tag
            0x00, 0x20, 0, 0, // msize
            6, 0, b'9', b'P', b'2', b'0', b'0', b'0',
        ];
        assert_eq!(frame, expected);
    }

    #[test]
    fn qid_is_thirteen_bytes() {
        let mut buf = Vec::new();
        let n = Qid {
            typ: QidType::DIR,
            version: 1,
            path: 0x0102030405060708,
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(n, 13);
        assert_eq!(buf, [0x80, 1, 0, 0, 0, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn stat_record_length_excludes_itself() {
        let stat = Stat {
            qid: file_qid(0),
            atime: 7,
            mtime: 9,
            length: 3,
            name: "foo".to_owned(),
            uid: "none".to_owned(),
            gid: "none".to_owned(),
            muid: "none".to_owned(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        let n = stat.encode(&mut buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(LittleEndian::read_u16(&buf[..2]) as usize, buf.len() - 2);
        // fixed header, then the name string
        assert_eq!(&buf[41..43], &[3, 0]);
        assert_eq!(&buf[43..46], b"foo");

        let decoded: Stat = Decodable::decode(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, stat);
    }

    #[test]
    fn frames_round_trip() {
        let stat = Stat {
            qid: file_qid(0),
            name: "a/b".to_owned(),
            uid: "none".to_owned(),
            gid: "none".to_owned(),
            muid: "none".to_owned(),
            ..Default::default()
        };
        let bodies = vec![
            FCall::TVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
            FCall::TAuth {
                afid: 5,
                uname: "glenda".to_owned(),
                aname: String::new(),
            },
            FCall::RAuth { aqid: file_qid(9) },
            FCall::TAttach {
                fid: 1,
                afid: NOFID,
                uname: "glenda".to_owned(),
                aname: "/".to_owned(),
            },
            FCall::RError {
                ename: "unknown fid".to_owned(),
            },
            FCall::TFlush { oldtag: 3 },
            FCall::RFlush,
            FCall::TWalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a".to_owned(), "..".to_owned()],
            },
            FCall::RWalk {
                wqids: vec![file_qid(0), file_qid(1)],
            },
            FCall::TOpen { fid: 2, mode: om::READ },
            FCall::ROpen {
                qid: file_qid(0),
                iounit: 4096,
            },
            FCall::TCreate {
                fid: 2,
                name: "new".to_owned(),
                perm: 0o644,
                mode: om::RDWR,
            },
            FCall::TRead {
                fid: 2,
                offset: 1 << 40,
                count: 4096,
            },
            FCall::RRead {
                data: Data(b"hello".to_vec()),
            },
            FCall::TWrite {
                fid: 2,
                offset: 0,
                data: Data(vec![0, 1, 2]),
            },
            FCall::RWrite { count: 3 },
            FCall::TClunk { fid: 2 },
            FCall::RClunk,
            FCall::TRemove { fid: 2 },
            FCall::TStat { fid: 2 },
            FCall::RStat { stat: stat.clone() },
            FCall::TWStat { fid: 2, stat },
            FCall::RWStat,
            FCall::Unknown {
                typ: 12,
                raw: vec![0xde, 0xad],
            },
        ];

        for (tag, body) in bodies.into_iter().enumerate() {
            let msg = Msg {
                tag: tag as u16,
                body,
            };
            let frame = encode_frame(&msg).unwrap();
            let (header, decoded) = decode_frame(&frame).unwrap();

            assert_eq!(decoded, msg);
            assert_eq!(header.size as usize, frame.len());
            assert_eq!(header.typ, msg.body.type_code());
            assert_eq!(header.tag, msg.tag);
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let frame = [10, 0, 0, 0, 30, 0x34, 0x12, 1, 2, 3];
        let (header, msg) = decode_frame(&frame).unwrap();
        assert_eq!(header.typ, 30);
        assert_eq!(header.tag, 0x1234);
        assert_eq!(
            msg.body,
            FCall::Unknown {
                typ: 30,
                raw: vec![1, 2, 3]
            }
        );

        // Terror is illegal on the wire and treated the same way
        let frame = [7, 0, 0, 0, 106, 0, 0];
        let (_, msg) = decode_frame(&frame).unwrap();
        assert_eq!(
            msg.body,
            FCall::Unknown {
                typ: 106,
                raw: Vec::new()
            }
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let msg = Msg {
            tag: 1,
            body: FCall::TClunk { fid: 7 },
        };
        let frame = encode_frame(&msg).unwrap();
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
        assert!(decode_frame(&frame[..3]).is_err());
    }

    fn stat_named(name: String) -> Stat {
        Stat {
            qid: file_qid(0),
            name,
            uid: "none".to_owned(),
            gid: "none".to_owned(),
            muid: "none".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn largest_stat_still_encodes() {
        let fixed = stat_named(String::new()).size();
        let stat = stat_named("k".repeat(Stat::MAX_SIZE - fixed));
        assert_eq!(stat.size(), Stat::MAX_SIZE);

        let msg = Msg {
            tag: 3,
            body: FCall::RStat { stat: stat.clone() },
        };
        let frame = encode_frame(&msg).unwrap();
        // size[4] type[1] tag[2] n[2] stat[n]
        assert_eq!(LittleEndian::read_u16(&frame[7..9]) as usize, Stat::MAX_SIZE + 2);
        assert_eq!(decode_frame(&frame).unwrap().1, msg);
    }

    #[test]
    fn oversized_stat_is_refused() {
        let fixed = stat_named(String::new()).size();
        for extra in [1, 2, 30] {
            let stat = stat_named("k".repeat(Stat::MAX_SIZE - fixed + extra));
            assert!(stat.encode(&mut Vec::new()).is_err());

            let rstat = Msg {
                tag: 3,
                body: FCall::RStat { stat: stat.clone() },
            };
            let err = encode_frame(&rstat).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

            let twstat = Msg {
                tag: 4,
                body: FCall::TWStat { fid: 1, stat },
            };
            assert!(encode_frame(&twstat).is_err());
        }
    }

    #[test]
    fn stat_length_must_match_its_strings() {
        let mut buf = Vec::new();
        stat_named("foo".to_owned()).encode(&mut buf).unwrap();
        let size = LittleEndian::read_u16(&buf[..2]);
        LittleEndian::write_u16(&mut buf[..2], size - 1);

        let r: Result<Stat> = Decodable::decode(&mut Cursor::new(buf));
        assert_eq!(r.unwrap_err().kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn nul_in_string_is_rejected() {
        let buf = vec![3, 0, b'a', 0, b'b'];
        let r: Result<String> = Decodable::decode(&mut Cursor::new(buf));
        assert!(r.is_err());
    }
}
