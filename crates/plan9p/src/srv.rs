//! Asynchronous server side 9P library.
//!
//! One task serves every connection. Accepted sockets are split, their read
//! halves framed and merged into a single stream, and each decoded request is
//! answered before the next frame of that connection is taken.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        config::{Config, MIN_MSIZE},
        error::{Error, string::*},
        fcall::*,
        fid::FidTable,
        framing::MsgCodec,
        io_err, serialize,
        tag::PendingTags,
        utils::{self, Result},
    },
    async_trait::async_trait,
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    std::{collections::HashMap, future::Future, io, net::SocketAddr, pin::Pin, time::Duration},
    tokio::net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    tokio_stream::{Stream, StreamExt, StreamMap},
    tokio_util::codec::{FramedRead, FramedWrite},
};

pub use crate::fid::Fid;

/// Filesystem server trait for implementing 9P2000 servers.
///
/// Implementors can represent an error condition by returning an `Err`.
/// Otherwise, they must return the appropriate `Fcall` response with required fields.
///
/// The server checks fid existence, open modes and walk limits before calling
/// into the filesystem, and checks the shape of every response afterwards.
/// Permission checks against the file's owner and mode are up to the filesystem.
///
/// # Error Handling
/// Return `Err(Error::No(string))` with one of the strings in
/// [`errstr`](crate::errstr) to send an `Rerror`. Common choices:
/// - `ENOTFOUND` - File not found
/// - `EPERM` - Permission denied
/// - `EEXIST` - Name already taken on create
/// - `ENOTEMPTY` - Removing a directory that still has entries
///
/// An `Error::Io` is also answered with `Rerror`, carrying the io error's text.
///
/// # Minimum Implementation
///
/// A read-only name space needs [`rattach`](Self::rattach),
/// [`rwalk`](Self::rwalk), [`ropen`](Self::ropen), [`rread`](Self::rread) and
/// [`rstat`](Self::rstat). Everything else defaults to "operation not supported",
/// except [`rclunk`](Self::rclunk) which succeeds.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// User defined state associated with a client's fid.
    ///
    /// Stores whatever is needed to service later requests on the fid, such as
    /// a path or a node reference.
    type Fid: Send + Sync + Default;

    /// Authenticate a user (9P2000).
    ///
    /// The default refuses: this server does not require authentication.
    ///
    /// # Returns
    /// `Fcall::RAuth` with the qid of the authentication file.
    async fn rauth(&self, _afid: &mut Fid<Self::Fid>, _uname: &str, _aname: &str) -> Result<Fcall> {
        Err(Error::No(ENOAUTH))
    }

    /// Attach to the root of a file tree (9P2000).
    ///
    /// # Arguments
    /// * `fid` - The new fid, to be set up as the root of the tree named by `aname`
    /// * `afid` - The authentication fid, if the client supplied one
    /// * `uname` - User name
    /// * `aname` - Which tree to attach to
    ///
    /// # Returns
    /// `Fcall::RAttach` with the qid of the root.
    async fn rattach(
        &self,
        _fid: &mut Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }

    /// Walk a path from `fid` (9P2000).
    ///
    /// Resolve `wnames` one at a time starting at `fid`, stopping at the first
    /// name that does not resolve. `newfid` must be set up to name the last
    /// file reached; it is only kept if every name resolved. With no names,
    /// `newfid` is a copy of `fid` and its state should be cloned.
    ///
    /// # Returns
    /// `Fcall::RWalk` with one qid per resolved name.
    async fn rwalk(
        &self,
        _fid: &Fid<Self::Fid>,
        _newfid: &mut Fid<Self::Fid>,
        _wnames: &[String],
    ) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }

    /// Open a file for I/O (9P2000).
    ///
    /// # Returns
    /// `Fcall::ROpen` with the file's qid and an iounit, 0 meaning msize less
    /// the I/O header.
    async fn ropen(&self, _fid: &mut Fid<Self::Fid>, _mode: u8) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }

    /// Create a file in the directory named by `fid` and open it (9P2000).
    ///
    /// On success `fid` names the new file.
    async fn rcreate(&self, _fid: &mut Fid<Self::Fid>, _name: &str, _perm: u32, _mode: u8) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }

    /// Read at most `count` bytes at `offset` (9P2000).
    ///
    /// Reads of a directory return whole stat records, never a partial one.
    async fn rread(&self, _fid: &mut Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }

    async fn rwrite(&self, _fid: &mut Fid<Self::Fid>, _offset: u64, _data: &Data) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }

    /// Forget a fid (9P2000).
    ///
    /// Called for every retired fid, including those still bound when the
    /// connection ends or the session is renegotiated.
    async fn rclunk(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Ok(Fcall::RClunk)
    }

    /// Remove the file named by `fid` (9P2000).
    ///
    /// The fid is clunked whatever the outcome.
    async fn rremove(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }

    async fn rstat(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }

    /// Change file attributes (9P2000).
    ///
    /// Fields of `stat` holding their "don't touch" value (`!0` or an empty
    /// string) are to be left alone.
    async fn rwstat(&self, _fid: &mut Fid<Self::Fid>, _stat: &Stat) -> Result<Fcall> {
        Err(Error::No(ENOTSUP))
    }
}

fn botch<T>(typ: MsgType, got: &Fcall) -> Result<T> {
    warn!("filesystem answered {:?} with {:?}", typ, MsgType::from(got));
    Err(Error::No(EBOTCH))
}

/// State of one client connection.
struct Connection<Fs: Filesystem> {
    peer: SocketAddr,
    codec: MsgCodec,
    config: Config,
    fids: FidTable<Fs::Fid>,
    tags: PendingTags,
    negotiated: bool,
}

impl<Fs: Filesystem> Connection<Fs> {
    fn new(peer: SocketAddr, codec: MsgCodec, config: Config) -> Connection<Fs> {
        Connection {
            peer,
            codec,
            config,
            fids: FidTable::new(),
            tags: PendingTags::new(),
            negotiated: false,
        }
    }

    /// Answer one request.
    ///
    /// `Ok(None)` means the request was flushed and gets no answer. An `Err` is
    /// a protocol violation and ends the connection.
    async fn dispatch(&mut self, fs: &Fs, msg: Msg) -> Result<Option<Msg>> {
        let Msg { tag, body } = msg;
        let typ = MsgType::from(&body);
        if typ.is_r() {
            return Err(Error::Protocol(format!("{:?} sent to the server", typ)));
        }

        if let Fcall::TVersion { msize, ref version } = body {
            let body = self.version(fs, msize, version).await;
            return Ok(Some(Msg { tag, body }));
        }

        if let Err(e) = self.tags.begin(tag) {
            return Ok(Some(Msg {
                tag,
                body: Fcall::RError { ename: e.ename() },
            }));
        }

        let body = self.execute(fs, body).await;
        Ok(self.respond(tag, body))
    }

    /// Run a request whose tag is in flight. Failures become `Rerror`.
    async fn execute(&mut self, fs: &Fs, body: Fcall) -> Fcall {
        if !self.negotiated {
            return Fcall::RError {
                ename: ENOVERSION.to_owned(),
            };
        }

        let typ = MsgType::from(&body);
        self.handle(fs, body).await.unwrap_or_else(|e| {
            debug!("{}: {:?}: {}", self.peer, typ, e);
            Fcall::RError { ename: e.ename() }
        })
    }

    /// Retire `tag` and release its answer, unless a Tflush got there first.
    fn respond(&mut self, tag: u16, body: Fcall) -> Option<Msg> {
        if self.tags.finish(tag) {
            Some(Msg { tag, body })
        } else {
            info!("{}: tag {} flushed, dropping {:?}", self.peer, tag, body);
            None
        }
    }

    /// Negotiate, or refuse with `Rerror` and leave the session as it was.
    async fn version(&mut self, fs: &Fs, msize: u32, version: &str) -> Fcall {
        if msize < MIN_MSIZE {
            return Fcall::RError {
                ename: ESMALLMSIZE.to_owned(),
            };
        }
        self.hangup(fs).await;
        self.tags.reset();

        let msize = msize.min(self.config.msize);
        let version = if version.starts_with(P92000) {
            self.negotiated = true;
            self.codec.set_msize(msize);
            self.config.version.clone()
        } else {
            self.negotiated = false;
            VERSION_UNKNOWN.to_owned()
        };

        Fcall::RVersion { msize, version }
    }

    /// Clunk every fid still bound.
    async fn hangup(&mut self, fs: &Fs) {
        let fids: Vec<_> = self.fids.drain().collect();
        for fid in fids {
            if let Err(e) = release(fs, fid).await {
                debug!("{}: clunk on hangup: {}", self.peer, e);
            }
        }
    }

    #[rustfmt::skip]
    async fn handle(&mut self, fs: &Fs, body: Fcall) -> Result<Fcall> {
        use crate::Fcall::*;
        match body {
            TAuth { afid, uname, aname }            => self.auth(fs, afid, &uname, &aname).await,
            TAttach { fid, afid, uname, aname }     => self.attach(fs, fid, afid, &uname, &aname).await,
            TFlush { oldtag }                       => {
                if !self.tags.flush(oldtag) {
                    debug!("{}: flush of idle tag {}", self.peer, oldtag);
                }
                Ok(RFlush)
            }
            TWalk { fid, newfid, wnames }           => self.walk(fs, fid, newfid, wnames).await,
            TOpen { fid, mode }                     => self.open(fs, fid, mode).await,
            TCreate { fid, name, perm, mode }       => self.create(fs, fid, &name, perm, mode).await,
            TRead { fid, offset, count }            => self.read(fs, fid, offset, count).await,
            TWrite { fid, offset, data }            => self.write(fs, fid, offset, data).await,
            TClunk { fid }                          => release(fs, self.fids.retire(fid)?).await,
            TRemove { fid }                         => {
                let fid = self.fids.retire(fid)?;
                let r = fs.rremove(&fid).await?;
                match r { RRemove => Ok(r), _ => botch(MsgType::TRemove, &r) }
            }
            TStat { fid }                           => {
                let r = fs.rstat(self.fids.get(fid)?).await?;
                match r { RStat { .. } => Ok(r), _ => botch(MsgType::TStat, &r) }
            }
            TWStat { fid, stat }                    => self.wstat(fs, fid, &stat).await,
            _                                       => Err(Error::No(ENOTSUP)),
        }
    }

    async fn auth(&mut self, fs: &Fs, afid: u32, uname: &str, aname: &str) -> Result<Fcall> {
        self.fids.check_unused(afid)?;
        let mut new = Fid::new(afid, Qid::default(), Default::default());

        let r = fs.rauth(&mut new, uname, aname).await?;
        let Fcall::RAuth { aqid } = r else {
            return botch(MsgType::TAuth, &r);
        };
        new.set_qid(aqid);
        self.fids.attach(new)?;
        Ok(r)
    }

    async fn attach(&mut self, fs: &Fs, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<Fcall> {
        self.fids.check_unused(fid)?;
        let afid = match afid {
            NOFID => None,
            afid => Some(self.fids.get(afid)?),
        };
        let mut new = Fid::new(fid, Qid::default(), Default::default());

        let r = fs.rattach(&mut new, afid, uname, aname).await?;
        let Fcall::RAttach { qid } = r else {
            return botch(MsgType::TAttach, &r);
        };
        new.set_qid(qid);
        self.fids.attach(new)?;
        Ok(r)
    }

    async fn walk(&mut self, fs: &Fs, fid: u32, newfid: u32, wnames: Vec<String>) -> Result<Fcall> {
        if wnames.len() > MAXWELEM {
            return Err(Error::No(ETOOMANYWNAMES));
        }
        let from = self.fids.get(fid)?;
        if from.is_open() {
            return Err(Error::No(EWALKOPEN));
        }
        if !wnames.is_empty() && !from.is_dir() {
            return Err(Error::No(EWALKNODIR));
        }
        if newfid != fid {
            self.fids.check_unused(newfid)?;
        }
        let mut new = Fid::new(newfid, from.qid(), Default::default());

        let r = fs.rwalk(from, &mut new, &wnames).await?;
        let Fcall::RWalk { wqids } = r else {
            return botch(MsgType::TWalk, &r);
        };
        if wqids.len() > wnames.len() {
            return botch(MsgType::TWalk, &Fcall::RWalk { wqids });
        }
        if wqids.is_empty() && !wnames.is_empty() {
            return Err(Error::No(ENOTFOUND));
        }

        if wqids.len() == wnames.len() {
            if let Some(qid) = wqids.last() {
                new.set_qid(*qid);
            }
            self.fids.bind(new);
        }
        Ok(Fcall::RWalk { wqids })
    }

    async fn open(&mut self, fs: &Fs, fid: u32, mode: u8) -> Result<Fcall> {
        let f = self.fids.get_mut(fid)?;
        if f.is_open() {
            return Err(Error::No(EOPEN));
        }
        if f.is_dir() && (om::writable(mode) || mode & om::TRUNC != 0) {
            return Err(Error::No(EISDIR));
        }

        let r = fs.ropen(f, mode).await?;
        let Fcall::ROpen { qid, .. } = r else {
            return botch(MsgType::TOpen, &r);
        };
        self.fids.open(fid, mode, qid)?;
        Ok(r)
    }

    async fn create(&mut self, fs: &Fs, fid: u32, name: &str, perm: u32, mode: u8) -> Result<Fcall> {
        let f = self.fids.get_mut(fid)?;
        if f.is_open() {
            return Err(Error::No(EOPEN));
        }
        if !f.is_dir() {
            return Err(Error::No(ECREATENONDIR));
        }
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::No(EBADNAME));
        }
        if perm & dm::DIR != 0 && (om::writable(mode) || mode & om::TRUNC != 0) {
            return Err(Error::No(EISDIR));
        }

        let r = fs.rcreate(f, name, perm, mode).await?;
        let Fcall::RCreate { qid, .. } = r else {
            return botch(MsgType::TCreate, &r);
        };
        self.fids.open(fid, mode, qid)?;
        Ok(r)
    }

    async fn read(&mut self, fs: &Fs, fid: u32, offset: u64, count: u32) -> Result<Fcall> {
        let count = count.min(Config::iounit(self.codec.msize()));
        let f = self.fids.get_mut(fid)?;
        match f.mode() {
            None => return Err(Error::No(ENOTOPEN)),
            Some(mode) if !om::readable(mode) => return Err(Error::No(EPERM)),
            Some(_) => {}
        }
        let is_dir = f.is_dir();

        let r = fs.rread(f, offset, count).await?;
        let Fcall::RRead { ref data } = r else {
            return botch(MsgType::TRead, &r);
        };
        if data.0.len() > count as usize {
            warn!("{}: read of {} bytes returned {}", self.peer, count, data.0.len());
            return Err(Error::No(EBOTCH));
        }
        if is_dir && serialize::read_dir(&data.0).is_err() {
            warn!("{}: directory read returned partial stat records", self.peer);
            return Err(Error::No(EBOTCH));
        }
        Ok(r)
    }

    async fn write(&mut self, fs: &Fs, fid: u32, offset: u64, data: Data) -> Result<Fcall> {
        let f = self.fids.get_mut(fid)?;
        match f.mode() {
            None => return Err(Error::No(ENOTOPEN)),
            Some(mode) if !om::writable(mode) => return Err(Error::No(EPERM)),
            Some(_) => {}
        }
        if f.is_dir() {
            return Err(Error::No(EISDIR));
        }

        let r = fs.rwrite(f, offset, &data).await?;
        match r {
            Fcall::RWrite { count } if count as usize <= data.0.len() => Ok(r),
            _ => botch(MsgType::TWrite, &r),
        }
    }

    async fn wstat(&mut self, fs: &Fs, fid: u32, stat: &Stat) -> Result<Fcall> {
        let f = self.fids.get_mut(fid)?;
        if stat.mode != !0 && (stat.mode & dm::DIR != 0) != f.is_dir() {
            return Err(Error::No(EBADDIR));
        }

        let r = fs.rwstat(f, stat).await?;
        match r {
            Fcall::RWStat => Ok(r),
            _ => botch(MsgType::TWStat, &r),
        }
    }
}

/// Clunk a retired fid, removing the file if it was opened remove-on-close.
async fn release<Fs: Filesystem>(fs: &Fs, fid: Fid<Fs::Fid>) -> Result<Fcall> {
    if fid.mode().is_some_and(|mode| mode & om::RCLOSE != 0) {
        if let Err(e) = fs.rremove(&fid).await {
            debug!("remove on close of fid {}: {}", fid.fid(), e);
        }
        return Ok(Fcall::RClunk);
    }

    let r = fs.rclunk(&fid).await?;
    match r {
        Fcall::RClunk => Ok(r),
        _ => botch(MsgType::TClunk, &r),
    }
}

type ConnId = u64;

enum ConnEvent {
    Frame(Result<Msg>),
    Closed,
}

type Frames = Pin<Box<dyn Stream<Item = ConnEvent> + Send>>;

struct Served<Fs: Filesystem> {
    conn: Connection<Fs>,
    writer: FramedWrite<OwnedWriteHalf, MsgCodec>,
}

/// Handle one event of a connection. Returns whether to keep the connection.
async fn serve_event<Fs: Filesystem>(fs: &Fs, served: &mut Served<Fs>, event: ConnEvent) -> bool {
    let peer = served.conn.peer;
    let msg = match event {
        ConnEvent::Frame(Ok(msg)) => msg,
        ConnEvent::Frame(Err(e)) => {
            error!("{}: {}", peer, e);
            return false;
        }
        ConnEvent::Closed => {
            info!("{}: disconnected", peer);
            return false;
        }
    };

    info!("\t← {:?}", msg);
    let response = match served.conn.dispatch(fs, msg).await {
        Ok(Some(response)) => response,
        Ok(None) => return true,
        Err(e) => {
            error!("{}: {}", peer, e);
            return false;
        }
    };

    if let Err(e) = served.writer.send(response.clone()).await {
        error!("{}: failed to send response for tag {}: {}", peer, response.tag, e);
        return false;
    }
    info!("\t→ {:?}", response);
    true
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Start serving an accepted socket as connection `id`.
///
/// A failed accept is logged and skipped. It ends no connection and not the
/// server.
fn admit<Fs: Filesystem>(
    accepted: io::Result<(TcpStream, SocketAddr)>,
    id: ConnId,
    config: &Config,
    served: &mut HashMap<ConnId, Served<Fs>>,
    frames: &mut StreamMap<ConnId, Frames>,
) -> bool {
    let (stream, peer) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("accept failed: {}", e);
            return false;
        }
    };
    info!("accepted: {:?}", peer);

    let codec = MsgCodec::new(config.msize);
    let (readhalf, writehalf) = stream.into_split();
    let reader = FramedRead::new(readhalf, codec.clone())
        .map(ConnEvent::Frame)
        .chain(tokio_stream::once(ConnEvent::Closed));

    frames.insert(id, Box::pin(reader));
    served.insert(id, Served {
        conn: Connection::new(peer, codec.clone(), config.clone()),
        writer: FramedWrite::new(writehalf, codec),
    });
    true
}

/// Serve `filesystem` on an already bound listener until `shutdown` resolves.
///
/// Every fid still bound when a connection ends, or when the server shuts down,
/// is clunked.
pub async fn srv_async_on<Fs, S>(filesystem: Fs, listener: TcpListener, config: Config, shutdown: S) -> Result<()>
where
    Fs: Filesystem,
    S: Future<Output = ()>,
{
    let mut served: HashMap<ConnId, Served<Fs>> = HashMap::new();
    let mut frames: StreamMap<ConnId, Frames> = StreamMap::new();
    let mut next_id: ConnId = 0;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Server shutdown complete");
                break;
            }
            accepted = listener.accept() => {
                if admit(accepted, next_id, &config, &mut served, &mut frames) {
                    next_id += 1;
                } else {
                    // e.g. EMFILE, which persists until a descriptor is freed
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
            Some((id, event)) = frames.next(), if !frames.is_empty() => {
                let keep = match served.get_mut(&id) {
                    Some(s) => serve_event(&filesystem, s, event).await,
                    None => false,
                };
                if !keep {
                    frames.remove(&id);
                    if let Some(mut s) = served.remove(&id) {
                        s.conn.hangup(&filesystem).await;
                    }
                }
            }
        }
    }

    for (_, mut s) in served.drain() {
        s.conn.hangup(&filesystem).await;
    }
    Ok(())
}

/// Serve `filesystem` at `addr` until interrupted.
///
/// `addr` is either a dial string such as `tcp!0.0.0.0!564` or `host:port`.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str, config: Config) -> Result<()>
where
    Fs: Filesystem,
{
    let listen_addr =
        utils::listen_addr(addr).ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("listening on {}", listen_addr);

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, shutting down gracefully"),
            Err(e) => {
                error!("cannot listen for SIGINT: {}", e);
                std::future::pending::<()>().await
            }
        }
    };
    srv_async_on(filesystem, listener, config, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `/a/b`, with `b` a five byte file.
    struct TreeFs;

    fn qid(path: u64) -> Qid {
        Qid {
            typ: if path == 2 { QidType::FILE } else { QidType::DIR },
            version: 0,
            path,
        }
    }

    fn lookup(dir: u64, name: &str) -> Option<u64> {
        match (dir, name) {
            (0, "a") => Some(1),
            (1, "b") => Some(2),
            (1, "..") | (0, "..") => Some(0),
            _ => None,
        }
    }

    #[async_trait]
    impl Filesystem for TreeFs {
        type Fid = u64;

        async fn rattach(&self, fid: &mut Fid<u64>, _: Option<&Fid<u64>>, _: &str, _: &str) -> Result<Fcall> {
            fid.aux = 0;
            Ok(Fcall::RAttach { qid: qid(0) })
        }

        async fn rwalk(&self, fid: &Fid<u64>, newfid: &mut Fid<u64>, wnames: &[String]) -> Result<Fcall> {
            let mut path = fid.aux;
            let mut wqids = Vec::new();
            for name in wnames {
                match lookup(path, name) {
                    Some(p) => {
                        path = p;
                        wqids.push(qid(p));
                    }
                    None => break,
                }
            }
            newfid.aux = path;
            Ok(Fcall::RWalk { wqids })
        }

        async fn ropen(&self, fid: &mut Fid<u64>, _: u8) -> Result<Fcall> {
            Ok(Fcall::ROpen {
                qid: fid.qid(),
                iounit: 0,
            })
        }

        async fn rread(&self, fid: &mut Fid<u64>, _: u64, count: u32) -> Result<Fcall> {
            let data = match fid.aux {
                2 => vec![b'x'; count as usize],
                _ => b"junk".to_vec(),
            };
            Ok(Fcall::RRead { data: Data(data) })
        }

        async fn rremove(&self, _: &Fid<u64>) -> Result<Fcall> {
            Err(Error::No(ENOREMOVE))
        }

        async fn rstat(&self, fid: &Fid<u64>) -> Result<Fcall> {
            Ok(Fcall::RStat {
                stat: Stat {
                    qid: fid.qid(),
                    ..Default::default()
                },
            })
        }

        async fn rwstat(&self, _: &mut Fid<u64>, _: &Stat) -> Result<Fcall> {
            Ok(Fcall::RWStat)
        }
    }

    fn conn() -> Connection<TreeFs> {
        let peer = "127.0.0.1:564".parse().unwrap();
        Connection::new(peer, MsgCodec::new(8192), Config::new(8192, P92000))
    }

    async fn call(conn: &mut Connection<TreeFs>, body: Fcall) -> Fcall {
        let msg = Msg { tag: 1, body };
        conn.dispatch(&TreeFs, msg).await.unwrap().unwrap().body
    }

    async fn ready() -> Connection<TreeFs> {
        let mut c = conn();
        call(&mut c, Fcall::TVersion {
            msize: 65536,
            version: "9P2000".to_owned(),
        })
        .await;
        let r = call(&mut c, Fcall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
        })
        .await;
        assert_eq!(r, Fcall::RAttach { qid: qid(0) });
        c
    }

    fn walk(fid: u32, newfid: u32, names: &[&str]) -> Fcall {
        Fcall::TWalk {
            fid,
            newfid,
            wnames: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn rerror(ename: &str) -> Fcall {
        Fcall::RError {
            ename: ename.to_owned(),
        }
    }

    #[tokio::test]
    async fn version_negotiation() {
        let mut c = conn();
        let r = call(&mut c, Fcall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: String::new(),
            aname: String::new(),
        })
        .await;
        assert_eq!(r, rerror(ENOVERSION));

        let r = call(&mut c, Fcall::TVersion {
            msize: 65536,
            version: "9P2000.u".to_owned(),
        })
        .await;
        assert_eq!(r, Fcall::RVersion {
            msize: 8192,
            version: "9P2000".to_owned(),
        });

        let r = call(&mut c, Fcall::TVersion {
            msize: 4096,
            version: "9P1".to_owned(),
        })
        .await;
        assert_eq!(r, Fcall::RVersion {
            msize: 4096,
            version: "unknown".to_owned(),
        });
        assert!(!c.negotiated);
    }

    #[tokio::test]
    async fn renegotiation_clears_fids() {
        let mut c = ready().await;
        assert_eq!(c.fids.len(), 1);
        call(&mut c, Fcall::TVersion {
            msize: 1024,
            version: "9P2000".to_owned(),
        })
        .await;
        assert!(c.fids.is_empty());
        assert_eq!(c.codec.msize(), 1024);
    }

    #[tokio::test]
    async fn duplicate_attach() {
        let mut c = ready().await;
        let r = call(&mut c, Fcall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
        })
        .await;
        assert_eq!(r, rerror("duplicate fid"));
    }

    #[tokio::test]
    async fn auth_is_not_required() {
        let mut c = ready().await;
        let r = call(&mut c, Fcall::TAuth {
            afid: 5,
            uname: "glenda".to_owned(),
            aname: String::new(),
        })
        .await;
        assert_eq!(r, rerror(ENOAUTH));
        assert!(!c.fids.contains(5));
    }

    #[tokio::test]
    async fn partial_walk_leaves_newfid_unbound() {
        let mut c = ready().await;
        let r = call(&mut c, walk(0, 1, &["a", "nope", "b"])).await;
        assert_eq!(r, Fcall::RWalk { wqids: vec![qid(1)] });
        assert!(!c.fids.contains(1));
        assert_eq!(call(&mut c, Fcall::TStat { fid: 1 }).await, rerror("unknown fid"));

        let r = call(&mut c, walk(0, 1, &["nope"])).await;
        assert_eq!(r, rerror(ENOTFOUND));
    }

    #[tokio::test]
    async fn walk_checks() {
        let mut c = ready().await;
        let r = call(&mut c, walk(0, 1, &["a", "b"])).await;
        assert_eq!(r, Fcall::RWalk {
            wqids: vec![qid(1), qid(2)]
        });
        assert_eq!(c.fids.get(1).unwrap().aux, 2);

        assert_eq!(call(&mut c, walk(1, 2, &["c"])).await, rerror(EWALKNODIR));
        assert_eq!(call(&mut c, walk(0, 1, &[])).await, rerror(EDUPFID));
        assert_eq!(call(&mut c, walk(0, 3, &["a"; 17])).await, rerror(ETOOMANYWNAMES));

        assert_eq!(call(&mut c, walk(0, 0, &["a"])).await, Fcall::RWalk { wqids: vec![qid(1)] });
        assert_eq!(c.fids.get(0).unwrap().qid(), qid(1));

        call(&mut c, Fcall::TOpen { fid: 0, mode: om::READ }).await;
        assert_eq!(call(&mut c, walk(0, 4, &[])).await, rerror(EWALKOPEN));
    }

    #[tokio::test]
    async fn open_and_read() {
        let mut c = ready().await;
        call(&mut c, walk(0, 1, &["a", "b"])).await;

        assert_eq!(
            call(&mut c, Fcall::TRead { fid: 1, offset: 0, count: 5 }).await,
            rerror(ENOTOPEN)
        );
        assert_eq!(
            call(&mut c, Fcall::TOpen { fid: 0, mode: om::WRITE }).await,
            rerror(EISDIR)
        );

        let r = call(&mut c, Fcall::TOpen { fid: 1, mode: om::READ }).await;
        assert_eq!(r, Fcall::ROpen { qid: qid(2), iounit: 0 });
        assert_eq!(call(&mut c, Fcall::TOpen { fid: 1, mode: om::READ }).await, rerror(EOPEN));

        let r = call(&mut c, Fcall::TRead { fid: 1, offset: 0, count: 1 << 20 }).await;
        match r {
            Fcall::RRead { data } => assert_eq!(data.0.len(), 8192 - IOHDRSZ as usize),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            call(&mut c, Fcall::TWrite { fid: 1, offset: 0, data: Data(b"hi".to_vec()) }).await,
            rerror(EPERM)
        );
    }

    #[tokio::test]
    async fn garbage_directory_read_is_a_botch() {
        let mut c = ready().await;
        call(&mut c, Fcall::TOpen { fid: 0, mode: om::READ }).await;
        let r = call(&mut c, Fcall::TRead { fid: 0, offset: 0, count: 100 }).await;
        assert_eq!(r, rerror(EBOTCH));
    }

    #[tokio::test]
    async fn clunk_and_remove_retire_the_fid() {
        let mut c = ready().await;
        call(&mut c, walk(0, 1, &["a"])).await;
        call(&mut c, walk(0, 2, &["a"])).await;

        assert_eq!(call(&mut c, Fcall::TClunk { fid: 1 }).await, Fcall::RClunk);
        assert!(!c.fids.contains(1));
        assert_eq!(call(&mut c, Fcall::TClunk { fid: 1 }).await, rerror(EUNKNOWNFID));

        assert_eq!(call(&mut c, Fcall::TRemove { fid: 2 }).await, rerror(ENOREMOVE));
        assert!(!c.fids.contains(2));
    }

    #[tokio::test]
    async fn wstat_cannot_flip_directory_bit() {
        let mut c = ready().await;
        let mut stat = Stat::dont_touch();
        stat.mode = 0o644;
        let r = call(&mut c, Fcall::TWStat { fid: 0, stat }).await;
        assert_eq!(r, rerror(EBADDIR));

        let r = call(&mut c, Fcall::TWStat {
            fid: 0,
            stat: Stat::dont_touch(),
        })
        .await;
        assert_eq!(r, Fcall::RWStat);
    }

    #[tokio::test]
    async fn flush_answers_rflush() {
        let mut c = ready().await;
        let r = call(&mut c, Fcall::TFlush { oldtag: 9 }).await;
        assert_eq!(r, Fcall::RFlush);
    }

    #[tokio::test]
    async fn flushed_read_gets_no_answer() {
        let mut c = ready().await;
        call(&mut c, walk(0, 1, &["a", "b"])).await;
        call(&mut c, Fcall::TOpen { fid: 1, mode: om::READ }).await;

        // Tread on tag 9 runs; its Tflush is handled before the answer goes out
        c.tags.begin(9).unwrap();
        let body = c.execute(&TreeFs, Fcall::TRead { fid: 1, offset: 0, count: 5 }).await;
        assert_eq!(body, Fcall::RRead { data: Data(b"xxxxx".to_vec()) });

        let r = c
            .dispatch(&TreeFs, Msg { tag: 10, body: Fcall::TFlush { oldtag: 9 } })
            .await
            .unwrap();
        assert_eq!(r, Some(Msg { tag: 10, body: Fcall::RFlush }));
        assert_eq!(c.respond(9, body), None);

        // The tag is free again
        let r = c
            .dispatch(&TreeFs, Msg { tag: 9, body: Fcall::TClunk { fid: 1 } })
            .await
            .unwrap();
        assert_eq!(r, Some(Msg { tag: 9, body: Fcall::RClunk }));
    }

    #[tokio::test]
    async fn tiny_msize_is_refused() {
        let mut c = ready().await;
        let r = call(&mut c, Fcall::TVersion {
            msize: 16,
            version: P92000.to_owned(),
        })
        .await;
        assert_eq!(r, rerror(ESMALLMSIZE));

        // The session survives the refusal
        assert_eq!(c.codec.msize(), 8192);
        let r = call(&mut c, Fcall::TStat { fid: 0 }).await;
        assert!(matches!(r, Fcall::RStat { .. }));
    }

    #[tokio::test]
    async fn failed_accept_is_skipped() {
        let mut served: HashMap<ConnId, Served<TreeFs>> = HashMap::new();
        let mut frames: StreamMap<ConnId, Frames> = StreamMap::new();
        let config = Config::default();

        let aborted = Err(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(!admit(aborted, 0, &config, &mut served, &mut frames));
        assert!(served.is_empty() && frames.is_empty());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        assert!(admit(listener.accept().await, 0, &config, &mut served, &mut frames));
        assert_eq!(served.len(), 1);
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test]
    async fn r_message_is_fatal() {
        let mut c = ready().await;
        let r = c.dispatch(&TreeFs, Msg { tag: 1, body: Fcall::RClunk }).await;
        assert!(matches!(r, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        use tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::TcpStream,
            sync::oneshot,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(srv_async_on(TreeFs, listener, Config::default(), async {
            let _ = stopped.await;
        }));

        async fn rpc(stream: &mut TcpStream, body: Fcall) -> Msg {
            let msg = Msg { tag: 0, body };
            stream.write_all(&serialize::encode_msg(&msg).unwrap()).await.unwrap();

            let mut size = [0u8; 4];
            stream.read_exact(&mut size).await.unwrap();
            let mut frame = size.to_vec();
            frame.resize(u32::from_le_bytes(size) as usize, 0);
            stream.read_exact(&mut frame[4..]).await.unwrap();
            serialize::decode_msg(&frame).unwrap()
        }

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let tiny = rpc(&mut stream, Fcall::TVersion {
            msize: 16,
            version: P92000.to_owned(),
        })
        .await;
        assert_eq!(tiny.body, rerror(ESMALLMSIZE));

        let rversion = rpc(&mut stream, Fcall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        })
        .await;
        assert_eq!(rversion, Msg {
            tag: 0,
            body: Fcall::RVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
        });

        stream.write_all(&[3, 0, 0, 0]).await.unwrap();
        assert_eq!(stream.read(&mut [0u8; 4]).await.unwrap(), 0);

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
