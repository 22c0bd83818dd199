//! Length-prefixed framing of 9P messages over a byte stream.
//!
//! Every message starts with its total size as a little-endian `u32`. The codec
//! accumulates reads until a whole frame is buffered, slices it off and keeps the
//! remainder, so several pipelined messages may arrive in a single read.

use {
    crate::{
        error::Error,
        fcall::{HEADER_SIZE, Msg},
        io_err, serialize,
        utils::Result,
    },
    byteorder::{ByteOrder, LittleEndian},
    bytes::{BufMut, BytesMut},
    log::debug,
    std::{
        mem,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
    },
    tokio_util::codec::{Decoder, Encoder},
};

/// Codec turning a byte stream into [`Msg`]s and back.
///
/// Clones share one msize limit, so the read and write halves of a connection
/// both follow a renegotiation.
#[derive(Clone, Debug)]
pub struct MsgCodec {
    msize: Arc<AtomicU32>,
}

impl MsgCodec {
    pub fn new(msize: u32) -> MsgCodec {
        MsgCodec {
            msize: Arc::new(AtomicU32::new(msize)),
        }
    }

    /// Largest frame accepted or produced.
    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    pub fn set_msize(&self, msize: u32) {
        self.msize.store(msize, Ordering::Release);
    }
}

impl Decoder for MsgCodec {
    type Item = Msg;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>> {
        if src.len() < mem::size_of::<u32>() {
            return Ok(None);
        }

        let size = LittleEndian::read_u32(&src[..4]) as usize;
        if size < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "frame of {} bytes is shorter than a message header",
                size
            )));
        }
        let msize = self.msize() as usize;
        if size > msize {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds msize {}",
                size, msize
            )));
        }

        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let frame = src.split_to(size);
        if !src.is_empty() {
            debug!("{} bytes of the next frame already buffered", src.len());
        }
        serialize::decode_msg(&frame)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Msg>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::Io(io_err!(
                UnexpectedEof,
                "connection closed in the middle of a message"
            ))),
        }
    }
}

impl Encoder<Msg> for MsgCodec {
    type Error = Error;

    fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        dst.put_u32_le(0);

        if let Err(e) = serialize::write_msg(&mut (&mut *dst).writer(), &msg) {
            dst.truncate(start);
            return Err(Error::Protocol(format!("cannot encode message: {}", e)));
        }

        let size = dst.len() - start;
        let msize = self.msize() as usize;
        if size > msize {
            dst.truncate(start);
            return Err(Error::Protocol(format!(
                "message of {} bytes exceeds msize {}",
                size, msize
            )));
        }

        LittleEndian::write_u32(&mut dst[start..start + 4], size as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::fcall::*,
        tokio_stream::StreamExt,
        tokio_util::codec::FramedRead,
    };

    fn tattach() -> Msg {
        Msg {
            tag: 1,
            body: Fcall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "u".to_owned(),
                aname: String::new(),
            },
        }
    }

    #[test]
    fn split_delivery_yields_one_message() {
        let frame = serialize::encode_msg(&tattach()).unwrap();
        assert_eq!(frame.len(), 20);

        let mut codec = MsgCodec::new(8192);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..9]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&frame[9..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(tattach()));
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn pipelined_messages_keep_order() {
        let clunk = Msg {
            tag: 2,
            body: Fcall::TClunk { fid: 0 },
        };
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&serialize::encode_msg(&tattach()).unwrap());
        buf.extend_from_slice(&serialize::encode_msg(&clunk).unwrap());

        let mut codec = MsgCodec::new(8192);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(tattach()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(clunk));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn pipelined_messages_from_one_read() {
        let clunk = Msg {
            tag: 2,
            body: Fcall::TClunk { fid: 0 },
        };
        let mut bytes = serialize::encode_msg(&tattach()).unwrap();
        bytes.extend(serialize::encode_msg(&clunk).unwrap());

        let mut framed = FramedRead::new(&bytes[..], MsgCodec::new(8192));
        assert_eq!(framed.next().await.unwrap().unwrap(), tattach());
        assert_eq!(framed.next().await.unwrap().unwrap(), clunk);
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_an_error() {
        let frame = serialize::encode_msg(&tattach()).unwrap();
        let mut framed = FramedRead::new(&frame[..12], MsgCodec::new(8192));
        match framed.next().await {
            Some(Err(Error::Io(e))) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn frame_size_limits() {
        let mut codec = MsgCodec::new(16);
        let mut buf = BytesMut::from(&serialize::encode_msg(&tattach()).unwrap()[..4]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));

        let mut buf = BytesMut::from(&[3u8, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));

        let mut out = BytesMut::new();
        assert!(codec.encode(tattach(), &mut out).is_err());
        assert!(out.is_empty());

        codec.clone().set_msize(8192);
        assert_eq!(codec.msize(), 8192);
        codec.encode(tattach(), &mut out).unwrap();
        assert_eq!(&out[..], &serialize::encode_msg(&tattach()).unwrap()[..]);
    }
}
