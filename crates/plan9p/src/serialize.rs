//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

/// Read `size` bytes. The buffer grows with the input, so a lying count
/// cannot force a large allocation.
fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    Read::take(&mut *r, size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return res!(io_err!(InvalidData, "Truncated message"));
    }
    Ok(buf)
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

/// Size field of a stat record. Leaves room for the `n[2]` count that wraps
/// a stat inside Rstat and Twstat.
fn stat_size(stat: &Stat) -> Result<u16> {
    match u16::try_from(stat.size()) {
        Ok(size) if size <= u16::MAX - 2 => Ok(size),
        _ => res!(io_err!(InvalidInput, "Stat too long")),
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &stat_size(self)?
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
        if size > u32::MAX as usize {
            return res!(io_err!(InvalidInput, "Data too long"));
        }
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return res!(io_err!(InvalidInput, "Too many elements"));
        }
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
        use crate::Fcall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

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
            // stat[n]: the record is preceded by its own total length
            RStat { ref stat } => buf << &(stat_size(stat)? + 2) << stat,
            TWStat { ref fid, ref stat } => buf << fid << &(stat_size(stat)? + 2) << stat,
            RWStat => buf,
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
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: QidType::from_bits_retain(decode!(*r)),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
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

        if record.position() != size as u64 {
            return res!(io_err!(InvalidData, "Stat size does not match its fields"));
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

/// Decode a `stat[n]` field: a 2-byte count followed by exactly one stat record.
fn decode_stat_n<R: ReadBytesExt>(r: &mut R) -> Result<Stat> {
    let n: u16 = Decodable::decode(r)?;
    let mut field = Cursor::new(read_exact(r, n as usize)?);
    let stat: Stat = decode!(field);
    if field.position() != n as u64 {
        return res!(io_err!(InvalidData, "Trailing bytes after stat"));
    }
    Ok(stat)
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(TVersion) => Fcall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => Fcall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => Fcall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => Fcall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => Fcall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => Fcall::RAttach { qid: decode!(buf) },
            Some(RError) => Fcall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => Fcall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => Fcall::RFlush,
            Some(TWalk) => Fcall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => Fcall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => Fcall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => Fcall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => Fcall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => Fcall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => Fcall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => Fcall::RRead { data: decode!(buf) },
            Some(TWrite) => Fcall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => Fcall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => Fcall::TClunk { fid: decode!(buf) },
            Some(RClunk) => Fcall::RClunk,
            Some(TRemove) => Fcall::TRemove { fid: decode!(buf) },
            Some(RRemove) => Fcall::RRemove,
            Some(TStat) => Fcall::TStat { fid: decode!(buf) },
            Some(RStat) => Fcall::RStat {
                stat: decode_stat_n(&mut buf)?,
            },
            Some(TWStat) => Fcall::TWStat {
                fid: decode!(buf),
                stat: decode_stat_n(&mut buf)?,
            },
            Some(RWStat) => Fcall::RWStat,
            Some(TError) => return res!(io_err!(InvalidData, "There is no Terror message")),
            None => return res!(io_err!(InvalidData, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
///
/// The stream is positioned after the size field of the frame.
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
///
/// Writes everything after the size field of the frame.
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Encode a complete frame: size[4] type[1] tag[2] payload
pub fn encode_msg(msg: &Msg) -> Result<Vec<u8>> {
    let mut frame = vec![0u8; mem::size_of::<u32>()];
    let body = write_msg(&mut frame, msg)?;
    let size = u32::try_from(body + mem::size_of::<u32>())
        .map_err(|_| io_err!(InvalidInput, "Message too large"))?;
    (&mut frame[..4]).write_u32::<LittleEndian>(size)?;
    Ok(frame)
}

/// Decode one complete frame, size field included
///
/// The declared size must match the buffer and every byte must belong to a field.
pub fn decode_msg(frame: &[u8]) -> Result<Msg> {
    if frame.len() < HEADER_SIZE {
        return res!(io_err!(InvalidData, "Truncated message header"));
    }
    let mut r = Cursor::new(frame);
    let size: u32 = decode!(r);
    if size as usize != frame.len() {
        return res!(io_err!(InvalidData, "Frame size does not match its length"));
    }

    let msg = read_msg(&mut r).map_err(|e| match e.kind() {
        ::std::io::ErrorKind::UnexpectedEof => io_err!(InvalidData, "Truncated message"),
        _ => e,
    })?;
    if r.position() != frame.len() as u64 {
        return res!(io_err!(InvalidData, "Trailing bytes after message"));
    }
    Ok(msg)
}

/// Decode the contents of a directory read into its stat records
///
/// Records are consumed back to back until the buffer ends exactly. A remainder
/// shorter than the record it announces is corruption, not a partial record.
pub fn read_dir(data: &[u8]) -> Result<Vec<Stat>> {
    let mut stats = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < mem::size_of::<u16>() {
            return res!(io_err!(InvalidData, "Partial stat record in directory"));
        }
        let size = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        if rest.len() < size + 2 {
            return res!(io_err!(InvalidData, "Partial stat record in directory"));
        }

        let stat: Stat = Decodable::decode(&mut &rest[..size + 2])?;
        stats.push(stat);
        offset += size + 2;
    }

    Ok(stats)
}

/// Pack stat records into a directory read reply of at most `budget` bytes
///
/// Returns the packed bytes and the number of records that fit. Only whole
/// records are packed.
pub fn pack_dir<'a, I>(stats: I, budget: usize) -> Result<(Vec<u8>, usize)>
where
    I: IntoIterator<Item = &'a Stat>,
{
    let mut buf = Vec::new();
    let mut count = 0;
    for stat in stats {
        if buf.len() + stat.size() + 2 > budget {
            break;
        }
        stat.encode(&mut buf)?;
        count += 1;
    }
    Ok((buf, count))
}

#[cfg(test)]
fn sample_stat(name: &str) -> Stat {
    Stat {
        typ: 0,
        dev: 0,
        qid: Qid {
            typ: QidType::FILE,
            version: 3,
            path: 0x1234,
        },
        mode: 0o644,
        atime: 1_700_000_000,
        mtime: 1_700_000_100,
        length: 42,
        name: name.to_owned(),
        uid: "glenda".to_owned(),
        gid: "sys".to_owned(),
        muid: String::new(),
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
    loop {
        match Decodable::decode(&mut decoder) {
            Ok(i) => actual.push(i),
            Err(_) => break,
        }
    }
    assert_eq!(expected, actual);
}

#[test]
fn tversion_wire_layout() {
    let msg = Msg {
        tag: 0,
        body: Fcall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };
    let frame = encode_msg(&msg).unwrap();

    let expected: Vec<u8> = vec![
        19, 0, 0, 0, // size
        100, // TVersion
        0, 0, // tag
        0x00, 0x20, 0, 0, // msize
        6, 0, b'9', b'P', b'2', b'0', b'0', b'0',
    ];
    assert_eq!(expected, frame);
    assert_eq!(msg, decode_msg(&frame).unwrap());
}

#[test]
fn msg_encode_decode_every_kind() {
    let qid = Qid {
        typ: QidType::DIR,
        version: 1,
        path: 7,
    };
    let bodies = vec![
        Fcall::TVersion { msize: 40, version: P92000.to_owned() },
        Fcall::RVersion { msize: 40, version: VERSION_UNKNOWN.to_owned() },
        Fcall::TAuth { afid: 5, uname: "glenda".to_owned(), aname: String::new() },
        Fcall::RAuth { aqid: qid },
        Fcall::TAttach { fid: 1, afid: NOFID, uname: String::new(), aname: String::new() },
        Fcall::RAttach { qid },
        Fcall::RError { ename: "file not found".to_owned() },
        Fcall::TFlush { oldtag: 0xdead },
        Fcall::RFlush,
        Fcall::TWalk { fid: 1, newfid: 2, wnames: vec![] },
        Fcall::TWalk { fid: 1, newfid: 2, wnames: vec!["usr".to_owned(), String::new()] },
        Fcall::RWalk { wqids: vec![] },
        Fcall::RWalk { wqids: vec![qid, qid] },
        Fcall::TOpen { fid: 2, mode: om::RDWR | om::TRUNC },
        Fcall::ROpen { qid, iounit: 8168 },
        Fcall::TCreate { fid: 2, name: "new".to_owned(), perm: dm::DIR | 0o755, mode: om::READ },
        Fcall::RCreate { qid, iounit: 0 },
        Fcall::TRead { fid: 2, offset: u64::MAX, count: 100 },
        Fcall::RRead { data: Data(vec![]) },
        Fcall::RRead { data: Data(b"hello".to_vec()) },
        Fcall::TWrite { fid: 2, offset: 3, data: Data(b"world".to_vec()) },
        Fcall::RWrite { count: 5 },
        Fcall::TClunk { fid: 2 },
        Fcall::RClunk,
        Fcall::TRemove { fid: 2 },
        Fcall::RRemove,
        Fcall::TStat { fid: 2 },
        Fcall::RStat { stat: sample_stat("motd") },
        Fcall::TWStat { fid: 2, stat: Stat::dont_touch() },
        Fcall::RWStat,
    ];

    for (i, body) in bodies.into_iter().enumerate() {
        let expected = Msg { tag: i as u16, body };
        let frame = encode_msg(&expected).unwrap();
        let actual = decode_msg(&frame).unwrap();
        assert_eq!(expected, actual);
    }
}

#[test]
fn qid_extremes() {
    let expected = Qid {
        typ: QidType::DIR | QidType::APPEND,
        version: u32::MAX,
        path: u64::MAX,
    };
    let mut buf = Vec::new();
    assert_eq!(expected.encode(&mut buf).unwrap(), QID_SIZE);
    assert_eq!(buf.len(), QID_SIZE);
    assert_eq!(expected, Decodable::decode(&mut Cursor::new(buf)).unwrap());
}

#[test]
fn stat_size_field() {
    let stat = sample_stat("motd");
    let mut buf = Vec::new();
    let written = stat.encode(&mut buf).unwrap();

    assert_eq!(written, buf.len());
    assert_eq!(u16::from_le_bytes([buf[0], buf[1]]) as usize, buf.len() - 2);
    assert_eq!(stat, Decodable::decode(&mut Cursor::new(buf)).unwrap());
}

#[test]
fn stat_with_lying_size_is_rejected() {
    let mut buf = Vec::new();
    sample_stat("motd").encode(&mut buf).unwrap();
    buf.push(0);
    let size = (buf.len() - 2) as u16;
    buf[..2].copy_from_slice(&size.to_le_bytes());

    let res: Result<Stat> = Decodable::decode(&mut Cursor::new(buf));
    assert!(res.is_err());
}

#[test]
fn read_dir_keeps_order() {
    let stats: Vec<Stat> = ["a", "bb", ""].iter().map(|n| sample_stat(n)).collect();
    let (data, count) = pack_dir(&stats, usize::MAX).unwrap();
    assert_eq!(count, 3);
    assert_eq!(stats, read_dir(&data).unwrap());
    assert!(read_dir(&[]).unwrap().is_empty());
}

#[test]
fn read_dir_rejects_partial_record() {
    let stats: Vec<Stat> = ["a", "b"].iter().map(|n| sample_stat(n)).collect();
    let (mut data, _) = pack_dir(&stats, usize::MAX).unwrap();

    let whole = data.len();
    data.truncate(whole - 5);
    assert!(read_dir(&data).is_err());

    data.truncate(whole / 2 + 1);
    assert!(read_dir(&data).is_err());
}

#[test]
fn pack_dir_stops_at_whole_records() {
    let stats: Vec<Stat> = ["a", "b", "c"].iter().map(|n| sample_stat(n)).collect();
    let one = stats[0].size() + 2;

    let (data, count) = pack_dir(&stats, one * 2 + one / 2).unwrap();
    assert_eq!(count, 2);
    assert_eq!(data.len(), one * 2);

    let (data, count) = pack_dir(&stats, one - 1).unwrap();
    assert_eq!(count, 0);
    assert!(data.is_empty());
}

#[test]
fn terror_is_rejected() {
    let frame = vec![9, 0, 0, 0, MsgType::TError as u8, 1, 0, 0, 0];
    assert!(decode_msg(&frame).is_err());

    let frame = vec![7, 0, 0, 0, 99, 1, 0];
    assert!(decode_msg(&frame).is_err());
}

#[test]
fn truncated_payload_is_rejected() {
    let msg = Msg {
        tag: 1,
        body: Fcall::TWalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["usr".to_owned(), "glenda".to_owned()],
        },
    };
    let mut frame = encode_msg(&msg).unwrap();
    frame.truncate(frame.len() - 3);
    let size = frame.len() as u32;
    frame[..4].copy_from_slice(&size.to_le_bytes());
    assert!(decode_msg(&frame).is_err());

    // Declared data count larger than what follows
    let mut frame = encode_msg(&Msg {
        tag: 1,
        body: Fcall::RRead { data: Data(b"abc".to_vec()) },
    })
    .unwrap();
    frame[7] = 200;
    assert!(decode_msg(&frame).is_err());
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut frame = encode_msg(&Msg { tag: 1, body: Fcall::TClunk { fid: 1 } }).unwrap();
    frame.push(0);
    let size = frame.len() as u32;
    frame[..4].copy_from_slice(&size.to_le_bytes());
    assert!(decode_msg(&frame).is_err());
}

#[test]
fn oversized_stat_is_refused() {
    let mut stat = sample_stat("motd");
    stat.name = "n".repeat(40_000);
    stat.uid = "u".repeat(40_000);
    assert!(stat.size() > u16::MAX as usize);
    assert!(stat.encode(&mut Vec::new()).is_err());

    // Fits the size field but not the n[2] count of Twstat
    let mut stat = Stat::dont_touch();
    stat.name = "n".repeat(u16::MAX as usize - 2 - stat.size());
    assert_eq!(stat.size(), u16::MAX as usize - 2);
    assert!(stat.encode(&mut Vec::new()).is_ok());
    stat.name.push('n');
    let msg = Msg { tag: 1, body: Fcall::TWStat { fid: 1, stat } };
    assert!(encode_msg(&msg).is_err());
}

#[test]
fn huge_counts_fail_without_allocating() {
    // Twrite announcing 4 GiB of data in a 23-byte frame
    let mut frame = encode_msg(&Msg {
        tag: 1,
        body: Fcall::TWrite { fid: 1, offset: 0, data: Data(vec![]) },
    })
    .unwrap();
    frame[19..23].copy_from_slice(&u32::MAX.to_le_bytes());
    assert_eq!(frame.len(), 23);
    assert!(decode_msg(&frame).is_err());
}
