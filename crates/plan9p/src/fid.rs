//! Per-connection fid tables.

use {
    crate::{
        error::{Error, string::*},
        fcall::{NOFID, Qid},
        utils::Result,
    },
    std::collections::HashMap,
};

/// A fid bound on a connection.
///
/// `aux` carries whatever the owner of the table wants to remember about the
/// file: the server keeps the filesystem's per-fid state there, the client
/// keeps nothing.
#[derive(Debug)]
pub struct Fid<T> {
    fid: u32,
    qid: Qid,
    mode: Option<u8>,
    pub aux: T,
}

impl<T> Fid<T> {
    pub fn new(fid: u32, qid: Qid, aux: T) -> Fid<T> {
        Fid {
            fid,
            qid,
            mode: None,
            aux,
        }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn qid(&self) -> Qid {
        self.qid
    }

    pub fn set_qid(&mut self, qid: Qid) {
        self.qid = qid;
    }

    /// Open mode, `None` until the fid is opened or created.
    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.mode.is_some()
    }

    pub fn is_dir(&self) -> bool {
        self.qid.is_dir()
    }
}

/// Fids of one connection, keyed by number.
#[derive(Debug)]
pub struct FidTable<T> {
    fids: HashMap<u32, Fid<T>>,
}

impl<T> Default for FidTable<T> {
    fn default() -> Self {
        FidTable {
            fids: HashMap::new(),
        }
    }
}

impl<T> FidTable<T> {
    pub fn new() -> FidTable<T> {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.fids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fids.is_empty()
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.fids.contains_key(&fid)
    }

    /// Fails with "duplicate fid" if `fid` is bound or is `NOFID`.
    pub fn check_unused(&self, fid: u32) -> Result<()> {
        if fid == NOFID || self.contains(fid) {
            return Err(Error::No(EDUPFID));
        }
        Ok(())
    }

    pub fn get(&self, fid: u32) -> Result<&Fid<T>> {
        self.fids.get(&fid).ok_or(Error::No(EUNKNOWNFID))
    }

    pub fn get_mut(&mut self, fid: u32) -> Result<&mut Fid<T>> {
        self.fids.get_mut(&fid).ok_or(Error::No(EUNKNOWNFID))
    }

    /// Bind a fresh root fid after a successful attach.
    pub fn attach(&mut self, fid: Fid<T>) -> Result<()> {
        self.check_unused(fid.fid)?;
        self.fids.insert(fid.fid, fid);
        Ok(())
    }

    /// Bind the target of a completed walk, replacing the source when the walk
    /// reused its fid.
    pub fn bind(&mut self, fid: Fid<T>) {
        self.fids.insert(fid.fid, fid);
    }

    /// Record that `fid` was opened (or created) with `mode`.
    pub fn open(&mut self, fid: u32, mode: u8, qid: Qid) -> Result<()> {
        let f = self.get_mut(fid)?;
        if f.is_open() {
            return Err(Error::No(EOPEN));
        }
        f.mode = Some(mode);
        f.qid = qid;
        Ok(())
    }

    /// Drop `fid` from the table, returning its state.
    pub fn retire(&mut self, fid: u32) -> Result<Fid<T>> {
        self.fids.remove(&fid).ok_or(Error::No(EUNKNOWNFID))
    }

    pub fn clear(&mut self) {
        self.fids.clear();
    }

    /// Retire every fid at once.
    pub fn drain(&mut self) -> impl Iterator<Item = Fid<T>> + '_ {
        self.fids.drain().map(|(_, fid)| fid)
    }
}
