//! Asynchronous client side 9P library.
//!
//! A [`Client`] drives one session over any byte stream: it negotiates the
//! version, then issues one request at a time and waits for its answer. The
//! fids it has bound are tracked locally so obvious misuse fails before
//! anything is sent.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        config::{Config, MIN_MSIZE},
        error::{Error, string::*},
        fcall::*,
        fid::{Fid, FidTable},
        framing::MsgCodec,
        io_err, serialize,
        tag::TagAllocator,
        utils::{self, Result},
    },
    futures::sink::SinkExt,
    log::{debug, info},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{
            TcpStream,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Where a session stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, nothing sent yet.
    Disconnected,
    /// Tversion sent, waiting for Rversion.
    Negotiating,
    /// Version agreed; requests may be issued.
    Ready,
    /// Negotiation failed, the transport broke or the session was closed.
    Closed,
}

/// A 9P2000 client session.
pub struct Client<R, W> {
    reader: FramedRead<R, MsgCodec>,
    writer: FramedWrite<W, MsgCodec>,
    codec: MsgCodec,
    config: Config,
    msize: u32,
    tags: TagAllocator,
    fids: FidTable<()>,
    state: SessionState,
}

impl Client<OwnedReadHalf, OwnedWriteHalf> {
    /// Connect to a server over TCP and negotiate the version.
    ///
    /// `addr` is either a dial string such as `tcp!server!564` or `host:port`.
    pub async fn dial(addr: &str, config: Config) -> Result<Self> {
        let addr = utils::listen_addr(addr).ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;
        let stream = TcpStream::connect(&addr).await?;
        info!("connected: {}", addr);

        let (readhalf, writehalf) = stream.into_split();
        let mut client = Client::new(readhalf, writehalf, config);
        client.connect().await?;
        Ok(client)
    }
}

impl<R, W> Client<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap a transport. Nothing is sent until [`connect`](Self::connect).
    pub fn new(reader: R, writer: W, config: Config) -> Self {
        let codec = MsgCodec::new(config.msize);
        Client {
            reader: FramedRead::new(reader, codec.clone()),
            writer: FramedWrite::new(writer, codec.clone()),
            codec,
            msize: config.msize,
            config,
            tags: TagAllocator::new(),
            fids: FidTable::new(),
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Largest read or write payload a single request can carry.
    pub fn iounit(&self) -> u32 {
        Config::iounit(self.msize)
    }

    /// The local record of `fid`, if bound.
    pub fn fid(&self, fid: u32) -> Option<&Fid<()>> {
        self.fids.get(fid).ok()
    }

    /// Negotiate the protocol version on a fresh session.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(Error::Protocol(format!("cannot connect a session that is {:?}", self.state)));
        }
        self.negotiate().await
    }

    /// Renegotiate the version, abandoning every fid and outstanding tag.
    pub async fn version(&mut self) -> Result<()> {
        self.ready()?;
        self.negotiate().await
    }

    async fn negotiate(&mut self) -> Result<()> {
        self.state = SessionState::Negotiating;
        self.tags.reset();
        self.fids.clear();

        match self.tversion().await {
            Ok(msize) => {
                self.msize = msize;
                self.codec.set_msize(msize);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    async fn tversion(&mut self) -> Result<u32> {
        let tag = self.tags.alloc()?;
        let req = Msg {
            tag,
            body: Fcall::TVersion {
                msize: self.config.msize,
                version: self.config.version.clone(),
            },
        };
        info!("\t→ {:?}", req);
        self.writer.send(req).await?;

        let msg = self.recv().await?;
        if msg.tag != tag {
            return Err(Error::Protocol(format!("Rversion carries tag {}, expected {}", msg.tag, tag)));
        }
        self.tags.complete(tag)?;

        match msg.body {
            Fcall::RVersion { msize, version } if version == self.config.version => {
                let msize = msize.min(self.config.msize);
                if msize < MIN_MSIZE {
                    return Err(Error::Protocol(format!("msize {} is too small", msize)));
                }
                Ok(msize)
            }
            Fcall::RVersion { version, .. } => Err(Error::Protocol(format!(
                "server speaks {:?}, not {:?}",
                version, self.config.version
            ))),
            Fcall::RError { ename } => Err(Error::Remote(ename)),
            body => Err(Error::botch(format!("{:?} in response to TVersion", MsgType::from(&body)))),
        }
    }

    /// Release the transport. The write side is only shut down if the
    /// session was ever established.
    pub async fn close(&mut self) -> Result<()> {
        let was = self.state;
        self.state = SessionState::Closed;
        if was == SessionState::Ready {
            self.writer.close().await?;
        }
        Ok(())
    }

    fn ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            _ => Err(Error::No(ENOVERSION)),
        }
    }

    async fn recv(&mut self) -> Result<Msg> {
        let msg = match self.reader.next().await {
            Some(msg) => msg?,
            None => return Err(Error::Io(io_err!(UnexpectedEof, "connection closed by server"))),
        };
        info!("\t← {:?}", msg);
        Ok(msg)
    }

    /// Send `req` under `tag` and wait for its answer.
    async fn transact(&mut self, tag: u16, body: Fcall) -> Result<Fcall> {
        let typ = MsgType::from(&body);
        let req = Msg { tag, body };
        info!("\t→ {:?}", req);
        self.writer.send(req).await?;

        loop {
            let msg = self.recv().await?;
            self.tags.complete(msg.tag)?;
            if msg.tag != tag {
                debug!("discarding late response for tag {}", msg.tag);
                continue;
            }

            return match msg.body {
                Fcall::RError { ename } => Err(Error::Remote(ename)),
                body if typ.response() == Some(MsgType::from(&body)) => Ok(body),
                body => Err(Error::botch(format!("{:?} in response to {:?}", MsgType::from(&body), typ))),
            };
        }
    }

    async fn rpc_tagged(&mut self, tag: u16, body: Fcall) -> Result<Fcall> {
        let r = self.transact(tag, body).await;
        if let Err(ref e) = r {
            if e.is_fatal() {
                self.state = SessionState::Closed;
            }
        }
        r
    }

    async fn rpc(&mut self, body: Fcall) -> Result<Fcall> {
        self.ready()?;
        let tag = self.tags.alloc()?;
        self.rpc_tagged(tag, body).await
    }

    /// Open an authentication fid.
    pub async fn auth(&mut self, afid: u32, uname: &str, aname: &str) -> Result<Qid> {
        self.fids.check_unused(afid)?;
        let r = self.rpc(Fcall::TAuth {
            afid,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        })
        .await?;
        let Fcall::RAuth { aqid } = r else {
            return Err(Error::botch("expected RAuth"));
        };
        self.fids.attach(Fid::new(afid, aqid, ()))?;
        Ok(aqid)
    }

    /// Bind `fid` to the root of the tree `aname`.
    pub async fn attach(&mut self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<Qid> {
        self.ready()?;
        self.fids.check_unused(fid)?;
        if afid != NOFID {
            self.fids.get(afid)?;
        }
        let r = self.rpc(Fcall::TAttach {
            fid,
            afid,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        })
        .await?;
        let Fcall::RAttach { qid } = r else {
            return Err(Error::botch("expected RAttach"));
        };
        self.fids.attach(Fid::new(fid, qid, ()))?;
        Ok(qid)
    }

    /// Walk `names` from `fid`.
    ///
    /// Returns the qids of the names that resolved. `newfid` is bound only if
    /// all of them did.
    pub async fn walk<S: AsRef<str>>(&mut self, fid: u32, newfid: u32, names: &[S]) -> Result<Vec<Qid>> {
        self.ready()?;
        let from = self.fids.get(fid)?;
        if from.is_open() {
            return Err(Error::No(EWALKOPEN));
        }
        let qid = from.qid();
        if newfid != fid {
            self.fids.check_unused(newfid)?;
        }
        if names.len() > MAXWELEM {
            return Err(Error::No(ETOOMANYWNAMES));
        }

        let wnames: Vec<String> = names.iter().map(|s| s.as_ref().to_owned()).collect();
        let r = self.rpc(Fcall::TWalk { fid, newfid, wnames }).await?;
        let Fcall::RWalk { wqids } = r else {
            return Err(Error::botch("expected RWalk"));
        };
        if wqids.len() > names.len() {
            return Err(Error::botch(format!("{} qids for {} names", wqids.len(), names.len())));
        }

        if wqids.len() == names.len() {
            let qid = wqids.last().copied().unwrap_or(qid);
            self.fids.bind(Fid::new(newfid, qid, ()));
        }
        Ok(wqids)
    }

    /// Open `fid`. Returns the file's qid and iounit.
    pub async fn open(&mut self, fid: u32, mode: u8) -> Result<(Qid, u32)> {
        self.ready()?;
        if self.fids.get(fid)?.is_open() {
            return Err(Error::No(EOPEN));
        }
        let r = self.rpc(Fcall::TOpen { fid, mode }).await?;
        let Fcall::ROpen { qid, iounit } = r else {
            return Err(Error::botch("expected ROpen"));
        };
        self.fids.open(fid, mode, qid)?;
        Ok((qid, iounit))
    }

    /// Create `name` in the directory `fid` names. On success `fid` names the
    /// new file, open with `mode`.
    pub async fn create(&mut self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<(Qid, u32)> {
        self.ready()?;
        let f = self.fids.get(fid)?;
        if f.is_open() {
            return Err(Error::No(EOPEN));
        }
        if !f.is_dir() {
            return Err(Error::No(ECREATENONDIR));
        }
        let r = self
            .rpc(Fcall::TCreate {
                fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await?;
        let Fcall::RCreate { qid, iounit } = r else {
            return Err(Error::botch("expected RCreate"));
        };
        self.fids.open(fid, mode, qid)?;
        Ok((qid, iounit))
    }

    /// Read up to `count` bytes at `offset`. The count is clamped to what fits
    /// in one message.
    pub async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        self.ready()?;
        self.fids.get(fid)?;
        let count = count.min(self.iounit());
        let r = self.rpc(Fcall::TRead { fid, offset, count }).await?;
        let Fcall::RRead { data } = r else {
            return Err(Error::botch("expected RRead"));
        };
        if data.0.len() > count as usize {
            return Err(Error::botch(format!("{} bytes read of {} asked", data.0.len(), count)));
        }
        Ok(data.0)
    }

    /// Read a directory and decode its entries.
    pub async fn read_dir(&mut self, fid: u32, offset: u64, count: u32) -> Result<Vec<Stat>> {
        let data = self.read(fid, offset, count).await?;
        serialize::read_dir(&data).map_err(Error::botch)
    }

    /// Write `data` at `offset`. Returns the number of bytes written.
    pub async fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        self.ready()?;
        self.fids.get(fid)?;
        if data.len() > self.iounit() as usize {
            return Err(Error::No(EBADCOUNT));
        }
        let r = self
            .rpc(Fcall::TWrite {
                fid,
                offset,
                data: Data(data.to_vec()),
            })
            .await?;
        match r {
            Fcall::RWrite { count } if count as usize <= data.len() => Ok(count),
            _ => Err(Error::botch("bad RWrite")),
        }
    }

    /// Release `fid`. The fid is forgotten even if the server objects.
    pub async fn clunk(&mut self, fid: u32) -> Result<()> {
        self.ready()?;
        self.fids.retire(fid)?;
        self.rpc(Fcall::TClunk { fid }).await.map(|_| ())
    }

    /// Remove the file `fid` names. The fid is forgotten even if the removal
    /// fails.
    pub async fn remove(&mut self, fid: u32) -> Result<()> {
        self.ready()?;
        self.fids.retire(fid)?;
        self.rpc(Fcall::TRemove { fid }).await.map(|_| ())
    }

    pub async fn stat(&mut self, fid: u32) -> Result<Stat> {
        self.ready()?;
        self.fids.get(fid)?;
        match self.rpc(Fcall::TStat { fid }).await? {
            Fcall::RStat { stat } => Ok(stat),
            _ => Err(Error::botch("expected RStat")),
        }
    }

    pub async fn wstat(&mut self, fid: u32, stat: &Stat) -> Result<()> {
        self.ready()?;
        self.fids.get(fid)?;
        self.rpc(Fcall::TWStat { fid, stat: stat.clone() }).await.map(|_| ())
    }

    /// Cancel the request outstanding under `oldtag`.
    ///
    /// A response to `oldtag` that arrives before the `Rflush` is discarded.
    pub async fn flush(&mut self, oldtag: u16) -> Result<()> {
        self.ready()?;
        let tag = self.tags.alloc_flush(oldtag)?;
        self.rpc_tagged(tag, Fcall::TFlush { oldtag }).await.map(|_| ())
    }
}
