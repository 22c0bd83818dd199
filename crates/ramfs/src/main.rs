use {
    async_trait::async_trait,
    clap::Parser,
    log::info,
    plan9p::{
        config::DEFAULT_MSIZE,
        srv::{Fid, Filesystem, srv_async},
        *,
    },
    tokio::sync::Mutex,
};

mod tree;
use crate::tree::{ROOT, Tree};

#[derive(Default)]
struct RamfsFid {
    path: u64,
    uname: String,
}

struct Ramfs {
    tree: Mutex<Tree>,
}

impl Ramfs {
    fn new(owner: &str) -> Ramfs {
        Ramfs {
            tree: Mutex::new(Tree::new(owner)),
        }
    }
}

/// Permission bits needed to open a file with `mode`.
fn open_perm(mode: u8) -> u32 {
    let need = match mode & 3 {
        om::READ => dm::READ,
        om::WRITE => dm::WRITE,
        om::RDWR => dm::READ | dm::WRITE,
        _ => dm::EXEC,
    };
    if mode & om::TRUNC != 0 { need | dm::WRITE } else { need }
}

#[async_trait]
impl Filesystem for Ramfs {
    type Fid = RamfsFid;

    async fn rattach(
        &self,
        fid: &mut Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        uname: &str,
        aname: &str,
    ) -> Result<Fcall> {
        if !aname.is_empty() && aname != "/" {
            return Err(Error::No(errstr::EBADATTACH));
        }
        let tree = self.tree.lock().await;
        fid.aux = RamfsFid {
            path: ROOT,
            uname: uname.to_owned(),
        };
        Ok(Fcall::RAttach { qid: tree.qid(ROOT)? })
    }

    async fn rwalk(&self, fid: &Fid<Self::Fid>, newfid: &mut Fid<Self::Fid>, wnames: &[String]) -> Result<Fcall> {
        let tree = self.tree.lock().await;
        let mut path = fid.aux.path;
        let mut wqids = Vec::with_capacity(wnames.len());

        for name in wnames {
            if !tree.allows(path, &fid.aux.uname, dm::EXEC) {
                if wqids.is_empty() {
                    return Err(Error::No(errstr::EPERM));
                }
                break;
            }
            match tree.lookup(path, name) {
                Some(next) => {
                    path = next;
                    wqids.push(tree.qid(path)?);
                }
                None => break,
            }
        }

        newfid.aux = RamfsFid {
            path,
            uname: fid.aux.uname.clone(),
        };
        Ok(Fcall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &mut Fid<Self::Fid>, mode: u8) -> Result<Fcall> {
        let mut tree = self.tree.lock().await;
        let RamfsFid { path, ref uname } = fid.aux;

        if !tree.allows(path, uname, open_perm(mode)) {
            return Err(Error::No(errstr::EPERM));
        }
        if mode & om::RCLOSE != 0 && !tree.allows(tree.parent(path)?, uname, dm::WRITE) {
            return Err(Error::No(errstr::EPERM));
        }
        if mode & om::TRUNC != 0 {
            tree.truncate(path, uname)?;
        }

        Ok(Fcall::ROpen {
            qid: tree.qid(path)?,
            iounit: 0,
        })
    }

    async fn rcreate(&self, fid: &mut Fid<Self::Fid>, name: &str, perm: u32, _mode: u8) -> Result<Fcall> {
        let mut tree = self.tree.lock().await;
        if !tree.allows(fid.aux.path, &fid.aux.uname, dm::WRITE) {
            return Err(Error::No(errstr::EPERM));
        }

        let path = tree.create(fid.aux.path, name, perm, &fid.aux.uname)?;
        info!("{}: created {} as {}", fid.aux.uname, name, path);
        fid.aux.path = path;
        Ok(Fcall::RCreate {
            qid: tree.qid(path)?,
            iounit: 0,
        })
    }

    async fn rread(&self, fid: &mut Fid<Self::Fid>, offset: u64, count: u32) -> Result<Fcall> {
        let mut tree = self.tree.lock().await;
        let data = tree.read(fid.aux.path, offset, count)?;
        Ok(Fcall::RRead { data: Data(data) })
    }

    async fn rwrite(&self, fid: &mut Fid<Self::Fid>, offset: u64, data: &Data) -> Result<Fcall> {
        let mut tree = self.tree.lock().await;
        let count = tree.write(fid.aux.path, offset, &data.0, &fid.aux.uname)?;
        Ok(Fcall::RWrite { count })
    }

    async fn rremove(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        let mut tree = self.tree.lock().await;
        let parent = tree.parent(fid.aux.path)?;
        if !tree.allows(parent, &fid.aux.uname, dm::WRITE) {
            return Err(Error::No(errstr::EPERM));
        }
        tree.remove(fid.aux.path)?;
        Ok(Fcall::RRemove)
    }

    async fn rstat(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        let tree = self.tree.lock().await;
        Ok(Fcall::RStat {
            stat: tree.stat(fid.aux.path)?,
        })
    }

    async fn rwstat(&self, fid: &mut Fid<Self::Fid>, stat: &Stat) -> Result<Fcall> {
        let mut tree = self.tree.lock().await;
        tree.wstat(fid.aux.path, stat, &fid.aux.uname)?;
        Ok(Fcall::RWStat)
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port or host:port
    /// where: proto = tcp
    address: String,

    /// Largest message to negotiate
    #[arg(long, default_value_t = DEFAULT_MSIZE)]
    msize: u32,

    /// Protocol version to speak
    #[arg(long, default_value = P92000)]
    version: String,

    /// Owner of the root directory
    #[arg(long, default_value = "glenda")]
    owner: String,
}

async fn ramfs_main(
    Cli {
        address,
        msize,
        version,
        owner,
    }: Cli,
) -> plan9p::Result<i32> {
    let config = Config::new(msize, version);

    println!("[*] Root owned by: {}", owner);
    println!("[*] Ready to accept clients: {}", address);
    srv_async(Ramfs::new(&owner), &address, config).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ramfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        plan9p::{client::Client, srv::srv_async_on},
        tokio::{net::TcpListener, sync::oneshot},
    };

    #[test]
    fn open_modes_need_permission_bits() {
        assert_eq!(open_perm(om::READ), dm::READ);
        assert_eq!(open_perm(om::RDWR | om::TRUNC), dm::READ | dm::WRITE);
        assert_eq!(open_perm(om::READ | om::TRUNC), dm::READ | dm::WRITE);
        assert_eq!(open_perm(om::EXEC), dm::EXEC);
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["ramfs", "tcp!127.0.0.1!5640"]);
        assert_eq!(cli.msize, 32768);
        assert_eq!(cli.version, "9P2000");
        assert_eq!(cli.owner, "glenda");

        let cli = Cli::parse_from(["ramfs", "127.0.0.1:5640", "--msize", "8192", "--owner", "rob"]);
        assert_eq!(cli.msize, 8192);
        assert_eq!(cli.owner, "rob");
    }

    #[tokio::test]
    async fn session_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(srv_async_on(Ramfs::new("glenda"), listener, Config::default(), async {
            let _ = stopped.await;
        }));

        let mut client = Client::dial(&addr, Config::new(8192, P92000)).await.unwrap();
        assert_eq!(client.msize(), 8192);

        let root = client.attach(0, NOFID, "glenda", "").await.unwrap();
        assert!(root.is_dir());

        assert!(client.walk::<&str>(0, 1, &[]).await.unwrap().is_empty());
        let (qid, _) = client.create(1, "motd", 0o644, om::RDWR).await.unwrap();
        assert!(!qid.is_dir());
        assert_eq!(client.write(1, 0, b"hello, world\n").await.unwrap(), 13);
        assert_eq!(client.read(1, 7, 100).await.unwrap(), b"world\n");

        // Nothing is outstanding under tag 40; the server still answers Rflush
        client.flush(40).await.unwrap();
        assert_eq!(client.read(1, 0, 5).await.unwrap(), b"hello");
        client.clunk(1).await.unwrap();

        let wqids = client.walk(0, 2, &["motd"]).await.unwrap();
        assert_eq!(wqids, vec![client.stat(2).await.unwrap().qid]);
        let stat = client.stat(2).await.unwrap();
        assert_eq!(stat.name, "motd");
        assert_eq!(stat.length, 13);
        assert_eq!(stat.uid, "glenda");
        assert!(!stat.is_dir());

        client.walk::<&str>(0, 3, &[]).await.unwrap();
        client.open(3, om::READ).await.unwrap();
        let entries = client.read_dir(3, 0, 8192).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "motd");
        client.clunk(3).await.unwrap();

        client.remove(2).await.unwrap();
        match client.walk(0, 4, &["motd"]).await {
            Err(Error::Remote(e)) => assert_eq!(e, errstr::ENOTFOUND),
            other => panic!("unexpected {:?}", other),
        }

        let wqids = client.walk(0, 4, &["..", "motd"]).await;
        assert!(matches!(wqids, Ok(ref q) if q.len() == 1));
        assert!(client.fid(4).is_none());

        client.close().await.unwrap();
        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn other_users_cannot_write_the_root() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(srv_async_on(Ramfs::new("glenda"), listener, Config::default(), async {
            let _ = stopped.await;
        }));

        let mut client = Client::dial(&format!("tcp!{}", addr.replace(':', "!")), Config::default())
            .await
            .unwrap();
        client.attach(0, NOFID, "rob", "").await.unwrap();
        match client.create(0, "x", 0o644, om::WRITE).await {
            Err(Error::Remote(e)) => assert_eq!(e, errstr::EPERM),
            other => panic!("unexpected {:?}", other),
        }
        assert!(client.attach(1, NOFID, "rob", "nonsense").await.is_err());

        client.close().await.unwrap();
        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
