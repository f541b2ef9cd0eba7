//! Serialize/deserialize 9P messages into/from binary.
//!
//! Encoding produces complete messages, size field included: the size is
//! computed up front from [`Encodable::encoded_len`] and never patched
//! afterwards. Decoding works on a single frame, i.e. the bytes that follow
//! the size field, as delivered by the connection's dispatch loop.

use crate::{error::Error, fcall::*, res, utils::Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use log::warn;
use num_traits::FromPrimitive;
use std::io::{self, Cursor, Read};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_retain(decode!($buf))
    };
}

fn short_read(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Decode("message truncated".to_owned()),
        _ => Error::decode(e),
    }
}

/// Read exactly `size` bytes without trusting `size` for the allocation
fn read_exact<R: Read>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(size as u64).read_to_end(&mut buf).map_err(short_read)?;
    if buf.len() != size {
        return res!(Error::Decode(format!(
            "message truncated: wanted {} bytes, {} left",
            size,
            buf.len()
        )));
    }
    Ok(buf)
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(Result<T>);

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

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
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

impl<W> SResult<Encoder<W>> {
    fn written(self) -> Result<usize> {
        self.0.map(|enc| enc.bytes)
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;

    /// Number of bytes `encode` will produce
    fn encoded_len(&self) -> usize;
}

macro_rules! encodable_int {
    ($typ:ty, $write:ident $(, $endian:ty)?) => {
        impl Encodable for $typ {
            fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
                w.$write$(::<$endian>)?(*self)?;
                Ok(mem::size_of::<Self>())
            }

            fn encoded_len(&self) -> usize {
                mem::size_of::<Self>()
            }
        }
    };
}

encodable_int!(u8, write_u8);
encodable_int!(u16, write_u16, LittleEndian);
encodable_int!(u32, write_u32, LittleEndian);
encodable_int!(u64, write_u64, LittleEndian);

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len()).map_err(|_| {
            Error::Encode(format!("string of {} bytes exceeds 65535", self.len()))
        })?;
        let bytes = len.encode(w)?;
        w.write_all(self.as_bytes())?;
        Ok(bytes + self.len())
    }

    fn encoded_len(&self) -> usize {
        mem::size_of::<u16>() + self.len()
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.typ.bits() << &self.version << &self.path).written()
    }

    fn encoded_len(&self) -> usize {
        self.size() as usize
    }
}

impl Encodable for OpenMode {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.bits().encode(w)
    }

    fn encoded_len(&self) -> usize {
        mem::size_of::<u8>()
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = u16::try_from(self.size())
            .map_err(|_| Error::Encode(format!("stat record of {} bytes", self.size())))?;
        (Encoder::new(w)
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
            << &self.muid)
            .written()
    }

    fn encoded_len(&self) -> usize {
        mem::size_of::<u16>() + self.size()
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = u32::try_from(self.0.len())
            .map_err(|_| Error::Encode(format!("{} byte payload", self.0.len())))?;
        let bytes = size.encode(w)? + self.0.len();
        w.write_all(&self.0)?;
        Ok(bytes)
    }

    fn encoded_len(&self) -> usize {
        mem::size_of::<u32>() + self.0.len()
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let count = u16::try_from(self.len())
            .map_err(|_| Error::Encode(format!("list of {} elements", self.len())))?;
        self.iter()
            .fold(Encoder::new(w) << &count, |acc, s| acc << s)
            .written()
    }

    fn encoded_len(&self) -> usize {
        self.iter()
            .fold(mem::size_of::<u16>(), |a, e| a + e.encoded_len())
    }
}

/// The `stat[n]` field of `RStat`/`TWStat`: a count followed by the record,
/// which carries its own size prefix.
struct StatField<'a>(&'a Stat);

impl Encodable for StatField<'_> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let n = u16::try_from(self.0.encoded_len())
            .map_err(|_| Error::Encode(format!("stat record of {} bytes", self.0.size())))?;
        (Encoder::new(w) << &n << self.0).written()
    }

    fn encoded_len(&self) -> usize {
        mem::size_of::<u16>() + self.0.encoded_len()
    }
}

impl FCall {
    /// Encoded length of the message body, header excluded
    pub fn encoded_len(&self) -> usize {
        use crate::FCall::*;

        match *self {
            TVersion { ref version, .. } | RVersion { ref version, .. } => 4 + version.encoded_len(),
            TAuth {
                ref uname,
                ref aname,
                ..
            } => 4 + uname.encoded_len() + aname.encoded_len(),
            RAuth { ref aqid } => aqid.encoded_len(),
            TAttach {
                ref uname,
                ref aname,
                ..
            } => 4 + 4 + uname.encoded_len() + aname.encoded_len(),
            RAttach { ref qid } => qid.encoded_len(),
            RError { ref ename } => ename.encoded_len(),
            TFlush { .. } => 2,
            RFlush => 0,
            TWalk { ref wnames, .. } => 4 + 4 + wnames.encoded_len(),
            RWalk { ref wqids } => wqids.encoded_len(),
            TOpen { .. } => 4 + 1,
            ROpen { ref qid, .. } | RCreate { ref qid, .. } => qid.encoded_len() + 4,
            TCreate { ref name, .. } => 4 + name.encoded_len() + 4 + 1,
            TRead { .. } => 4 + 8 + 4,
            RRead { ref data } => data.encoded_len(),
            TWrite { ref data, .. } => 4 + 8 + data.encoded_len(),
            RWrite { .. } => 4,
            TClunk { .. } | TRemove { .. } | TStat { .. } => 4,
            RClunk | RRemove | RWStat => 0,
            RStat { ref stat } => StatField(stat).encoded_len(),
            TWStat { ref stat, .. } => 4 + StatField(stat).encoded_len(),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let size = u32::try_from(self.encoded_len())
            .map_err(|_| Error::Encode("message exceeds 4GiB".to_owned()))?;
        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &size << &(typ as u8) << &self.tag;

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
            RStat { ref stat } => buf << &StatField(stat),
            TWStat { ref fid, ref stat } => buf << fid << &StatField(stat),
            RWStat => buf,
        };

        let written = buf.written()?;
        if written != size as usize {
            return res!(Error::Encode(format!(
                "{:?}: computed size {} but wrote {} bytes",
                typ, size, written
            )));
        }
        Ok(written)
    }

    fn encoded_len(&self) -> usize {
        HEADER_SIZE as usize + self.body.encoded_len()
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8().map_err(short_read)
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>().map_err(short_read)
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>().map_err(short_read)
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>().map_err(short_read)
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| Error::Decode("invalid UTF-8 sequence".to_owned()))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for OpenMode {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(decode!(OpenMode, *r))
    }
}

impl Decodable for Stat {
    /// Decodes one size-prefixed record; the declared size must be consumed exactly.
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let mut record = Cursor::new(read_exact(r, size as usize)?);
        let stat = Stat {
            typ: decode!(record),
            dev: decode!(record),
            qid: decode!(record),
            mode: decode!(record),
            atime: decode!(record),
            mtime: decode!(record),
            length: decode!(record),
            name: decode!(record),
            uid: decode!(record),
            gid: decode!(record),
            muid: decode!(record),
        };
        let trailing = size as u64 - record.position();
        if trailing != 0 {
            return res!(Error::Decode(format!(
                "stat record declares {} bytes but its fields use {}",
                size,
                record.position()
            )));
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
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

fn decode_stat_field<R: ReadBytesExt>(r: &mut R) -> Result<Stat> {
    let n: u16 = Decodable::decode(r)?;
    let stat: Stat = Decodable::decode(r)?;
    if n as usize != stat.encoded_len() {
        return res!(Error::Decode(format!(
            "stat field declares {} bytes, record holds {}",
            n,
            stat.encoded_len()
        )));
    }
    Ok(stat)
}

impl Decodable for Msg {
    /// Decodes a frame: type[1] tag[2] and the body, without the size field
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let raw_type: u8 = decode!(buf);
        let msg_type = MsgType::from_u8(raw_type);
        let tag = decode!(buf);
        let body = match msg_type {
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
            Some(RStat) => FCall::RStat {
                stat: decode_stat_field(buf)?,
            },
            Some(TWStat) => FCall::TWStat {
                fid: decode!(buf),
                stat: decode_stat_field(buf)?,
            },
            Some(RWStat) => FCall::RWStat,
            Some(TError) | None => {
                return res!(Error::Decode(format!("invalid message type {}", raw_type)));
            }
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a frame
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a complete 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Encode a message into a fresh buffer ready for the wire
pub fn encode_msg(msg: &Msg) -> Result<Bytes> {
    let mut writer = BytesMut::with_capacity(msg.encoded_len()).writer();
    write_msg(&mut writer, msg)?;
    Ok(writer.into_inner().freeze())
}

/// Tag of a frame, if it is long enough to carry one
pub fn frame_tag(frame: &[u8]) -> Option<u16> {
    match frame {
        [_, lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Decode a frame which must hold a message of type `expected`.
///
/// When an R-message is expected and the server sent `RError`, the error
/// string is surfaced as [`Error::Remote`]. Any other type mismatch is
/// [`Error::UnexpectedMessage`].
pub fn expect_msg(frame: &[u8], expected: MsgType) -> Result<Msg> {
    let Some(&raw_type) = frame.first() else {
        return res!(Error::Decode("empty message".to_owned()));
    };

    if expected.is_r() && raw_type == MsgType::RError as u8 {
        return match read_msg(&mut Cursor::new(frame))?.body {
            FCall::RError { ename } => Err(Error::Remote(ename)),
            _ => res!(Error::Decode("malformed RError".to_owned())),
        };
    }
    if raw_type != expected as u8 {
        return res!(Error::UnexpectedMessage {
            expected,
            got: raw_type,
        });
    }

    let mut cursor = Cursor::new(frame);
    let msg = read_msg(&mut cursor)?;
    let trailing = frame.len() as u64 - cursor.position();
    if trailing != 0 {
        warn!("{:?}: ignoring {} trailing bytes", expected, trailing);
    }
    Ok(msg)
}

/// Decode the concatenated stat records returned by reading a directory
pub fn stat_records(data: &[u8]) -> Result<Vec<Stat>> {
    let mut cursor = Cursor::new(data);
    let mut stats = Vec::new();
    while (cursor.position() as usize) < data.len() {
        stats.push(Decodable::decode(&mut cursor)?);
    }
    Ok(stats)
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
    loop {
        match Decodable::decode(&mut decoder) {
            Ok(i) => actual.push(i),
            Err(_) => break,
        }
    }
    assert_eq!(expected, actual);
}

#[test]
fn msg_encode_decode1() {
    let expected = Msg {
        tag: 0xdead,
        body: FCall::RVersion {
            msize: 40,
            version: P92000.to_owned(),
        },
    };
    let buf = encode_msg(&expected).unwrap();

    let mut readbuf = Cursor::new(&buf[4..]);
    let actual = read_msg(&mut readbuf);

    assert_eq!(expected, actual.unwrap());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(msg: &Msg) -> Bytes {
        encode_msg(msg).unwrap().slice(4..)
    }

    fn round_trip(body: FCall) {
        let msg = Msg { tag: 7, body };
        let wire = encode_msg(&msg).unwrap();
        let size = u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]);
        assert_eq!(size as usize, wire.len(), "{:?}", msg);
        assert_eq!(msg.encoded_len(), wire.len());
        let mut cursor = Cursor::new(&wire[4..]);
        let decoded = read_msg(&mut cursor).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(cursor.position() as usize, wire.len() - 4);
    }

    fn sample_stat() -> Stat {
        Stat {
            typ: 1,
            dev: 2,
            qid: QId {
                typ: QIdType::DIR,
                version: 3,
                path: 0x1122334455667788,
            },
            mode: dm::DIR | 0o755,
            atime: 1_600_000_000,
            mtime: 1_600_000_001,
            length: 0,
            name: "foo".to_owned(),
            uid: "u".to_owned(),
            gid: "g".to_owned(),
            muid: "m".to_owned(),
        }
    }

    #[test]
    fn every_message_round_trips() {
        let qid = QId {
            typ: QIdType::FILE,
            version: 1,
            path: 42,
        };
        for body in [
            FCall::TVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
            FCall::RVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
            FCall::TAuth {
                afid: 1,
                uname: "user".to_owned(),
                aname: String::new(),
            },
            FCall::RAuth { aqid: qid },
            FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "user".to_owned(),
                aname: String::new(),
            },
            FCall::RAttach { qid },
            FCall::RError {
                ename: "no such file".to_owned(),
            },
            FCall::TFlush { oldtag: 3 },
            FCall::RFlush,
            FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["a".to_owned(), "b.txt".to_owned()],
            },
            FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: Vec::new(),
            },
            FCall::RWalk {
                wqids: vec![qid, qid],
            },
            FCall::TOpen {
                fid: 1,
                mode: OpenMode::RDWR | OpenMode::TRUNC,
            },
            FCall::ROpen { qid, iounit: 0 },
            FCall::TCreate {
                fid: 1,
                name: "new".to_owned(),
                perm: 0o644,
                mode: OpenMode::WRITE,
            },
            FCall::RCreate { qid, iounit: 8168 },
            FCall::TRead {
                fid: 1,
                offset: u64::MAX,
                count: 100,
            },
            FCall::RRead {
                data: Data(b"hello".to_vec()),
            },
            FCall::RRead { data: Data(vec![]) },
            FCall::TWrite {
                fid: 1,
                offset: 0,
                data: Data(vec![0xff; 300]),
            },
            FCall::RWrite { count: 300 },
            FCall::TClunk { fid: 1 },
            FCall::RClunk,
            FCall::TRemove { fid: 1 },
            FCall::RRemove,
            FCall::TStat { fid: 1 },
            FCall::RStat {
                stat: sample_stat(),
            },
            FCall::TWStat {
                fid: 1,
                stat: Stat::unchanged(),
            },
            FCall::RWStat,
        ] {
            round_trip(body);
        }
    }

    #[test]
    fn string_edge_lengths() {
        round_trip(FCall::RError {
            ename: String::new(),
        });
        round_trip(FCall::RError {
            ename: "x".repeat(65535),
        });
        round_trip(FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "u".repeat(65535),
            aname: String::new(),
        });
        round_trip(FCall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec![String::new(), "w".repeat(65535)],
        });
    }

    #[test]
    fn oversized_string_is_encode_error() {
        let msg = Msg {
            tag: 1,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["x".repeat(65536)],
            },
        };
        assert!(matches!(encode_msg(&msg), Err(Error::Encode(_))));
    }

    #[test]
    fn rattach_layout() {
        let wire = encode_msg(&Msg {
            tag: 1,
            body: FCall::RAttach {
                qid: QId {
                    typ: QIdType::DIR,
                    version: 0x01020304,
                    path: 0x0a0b0c0d0e0f1011,
                },
            },
        })
        .unwrap();
        assert_eq!(
            &wire[..],
            &[
                20, 0, 0, 0, 105, 1, 0, 0x80, 4, 3, 2, 1, 0x11, 0x10, 0x0f, 0x0e, 0x0d, 0x0c,
                0x0b, 0x0a
            ]
        );
    }

    #[test]
    fn stat_inner_size_matches_fields() {
        let stat = sample_stat();
        let mut buf = Vec::new();
        stat.encode(&mut buf).unwrap();
        let inner = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(inner, 39 + (2 + 3) + (2 + 1) + (2 + 1) + (2 + 1));
        assert_eq!(buf.len(), inner + 2);

        let decoded: Stat = Decodable::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, stat);
    }

    #[test]
    fn stat_with_slack_is_rejected() {
        let stat = sample_stat();
        let mut buf = Vec::new();
        stat.encode(&mut buf).unwrap();
        let inner = u16::from_le_bytes([buf[0], buf[1]]) + 1;
        buf[..2].copy_from_slice(&inner.to_le_bytes());
        buf.push(0);

        let result: Result<Stat> = Decodable::decode(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn rstat_count_must_match_record() {
        let msg = Msg {
            tag: 2,
            body: FCall::RStat {
                stat: sample_stat(),
            },
        };
        let mut frame = frame_of(&msg).to_vec();
        // n sits right after type[1] tag[2]
        let n = u16::from_le_bytes([frame[3], frame[4]]) - 1;
        frame[3..5].copy_from_slice(&n.to_le_bytes());
        assert!(matches!(
            expect_msg(&frame, MsgType::RStat),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn rerror_surfaces_as_remote() {
        let frame = frame_of(&Msg {
            tag: 4,
            body: FCall::RError {
                ename: "no such file".to_owned(),
            },
        });
        match expect_msg(&frame, MsgType::RRead) {
            Err(Error::Remote(ename)) => assert_eq!(ename, "no such file"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn request_type_is_checked() {
        let frame = frame_of(&Msg {
            tag: 4,
            body: FCall::TClunk { fid: 9 },
        });
        assert!(matches!(
            expect_msg(&frame, MsgType::TRead),
            Err(Error::UnexpectedMessage {
                expected: MsgType::TRead,
                got: 120
            })
        ));
    }

    #[test]
    fn truncated_body_is_decode_error() {
        let frame = frame_of(&Msg {
            tag: 4,
            body: FCall::RRead {
                data: Data(vec![1, 2, 3, 4]),
            },
        });
        let short = &frame[..frame.len() - 2];
        assert!(matches!(
            expect_msg(short, MsgType::RRead),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn invalid_type_is_decode_error() {
        assert!(matches!(
            read_msg(&mut Cursor::new(&[106u8, 0, 0][..])),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            read_msg(&mut Cursor::new(&[3u8, 0, 0][..])),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn directory_data_holds_consecutive_records() {
        let mut data = Vec::new();
        let mut second = sample_stat();
        second.name = "bar".to_owned();
        sample_stat().encode(&mut data).unwrap();
        second.encode(&mut data).unwrap();

        let stats = stat_records(&data).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].name, "bar");
        assert!(stat_records(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn frame_tag_peeks_header() {
        assert_eq!(frame_tag(&[117, 0x34, 0x12, 0]), Some(0x1234));
        assert_eq!(frame_tag(&[117, 0x34]), None);
    }
}
