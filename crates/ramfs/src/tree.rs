use {
    plan9p::{errstr::*, serialize, *},
    std::{
        collections::{BTreeMap, HashMap},
        time::{SystemTime, UNIX_EPOCH},
    },
};

pub const ROOT: u64 = 0;

/// Largest file the tree will hold.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

/// Check that a file may grow to `len` bytes.
fn file_size(len: Option<u64>) -> Result<usize> {
    match len {
        Some(len) if len <= MAX_FILE_SIZE => Ok(len as usize),
        _ => Err(Error::No(ENOMEM)),
    }
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[derive(Debug)]
struct Node {
    qid: Qid,
    name: String,
    mode: u32,
    uid: String,
    gid: String,
    muid: String,
    atime: u32,
    mtime: u32,
    data: Vec<u8>,
    parent: u64,
    children: BTreeMap<String, u64>,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }

    fn stat(&self) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid,
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: if self.is_dir() { 0 } else { self.data.len() as u64 },
            name: self.name.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            muid: self.muid.clone(),
        }
    }
}

/// An in-memory file tree. Files are identified by their qid path.
#[derive(Debug)]
pub struct Tree {
    nodes: HashMap<u64, Node>,
    next_path: u64,
}

impl Tree {
    pub fn new(owner: &str) -> Tree {
        let t = now();
        let root = Node {
            qid: Qid {
                typ: QidType::DIR,
                version: 0,
                path: ROOT,
            },
            name: "/".to_owned(),
            mode: dm::DIR | 0o775,
            uid: owner.to_owned(),
            gid: owner.to_owned(),
            muid: owner.to_owned(),
            atime: t,
            mtime: t,
            data: Vec::new(),
            parent: ROOT,
            children: BTreeMap::new(),
        };

        Tree {
            nodes: HashMap::from([(ROOT, root)]),
            next_path: ROOT + 1,
        }
    }

    fn node(&self, path: u64) -> Result<&Node> {
        self.nodes.get(&path).ok_or(Error::No(ENOTFOUND))
    }

    fn node_mut(&mut self, path: u64) -> Result<&mut Node> {
        self.nodes.get_mut(&path).ok_or(Error::No(ENOTFOUND))
    }

    pub fn qid(&self, path: u64) -> Result<Qid> {
        Ok(self.node(path)?.qid)
    }

    pub fn stat(&self, path: u64) -> Result<Stat> {
        Ok(self.node(path)?.stat())
    }

    pub fn parent(&self, path: u64) -> Result<u64> {
        Ok(self.node(path)?.parent)
    }

    /// Resolve one path element below `dir`.
    pub fn lookup(&self, dir: u64, name: &str) -> Option<u64> {
        let node = self.nodes.get(&dir)?;
        if !node.is_dir() {
            return None;
        }
        match name {
            "." => Some(dir),
            ".." => Some(node.parent),
            _ => node.children.get(name).copied(),
        }
    }

    /// Whether `uname` may access `path` for the rwx bits in `need`.
    pub fn allows(&self, path: u64, uname: &str, need: u32) -> bool {
        let Ok(node) = self.node(path) else {
            return false;
        };
        let shift = if node.uid == uname {
            6
        } else if node.gid == uname {
            3
        } else {
            0
        };
        (node.mode >> shift) & need == need
    }

    pub fn create(&mut self, dir: u64, name: &str, perm: u32, uid: &str) -> Result<u64> {
        let parent = self.node(dir)?;
        if !parent.is_dir() {
            return Err(Error::No(ECREATENONDIR));
        }
        if parent.children.contains_key(name) {
            return Err(Error::No(EEXIST));
        }

        let mode = if perm & dm::DIR != 0 {
            perm & (!0o777 | (parent.mode & 0o777))
        } else {
            perm & (!0o666 | (parent.mode & 0o666))
        };
        let gid = parent.gid.clone();

        let path = self.next_path;
        self.next_path += 1;
        let t = now();
        self.nodes.insert(path, Node {
            qid: Qid {
                typ: QidType::from_mode(mode),
                version: 0,
                path,
            },
            name: name.to_owned(),
            mode,
            uid: uid.to_owned(),
            gid,
            muid: uid.to_owned(),
            atime: t,
            mtime: t,
            data: Vec::new(),
            parent: dir,
            children: BTreeMap::new(),
        });

        let parent = self.node_mut(dir)?;
        parent.children.insert(name.to_owned(), path);
        parent.mtime = t;
        parent.qid.version = parent.qid.version.wrapping_add(1);
        Ok(path)
    }

    pub fn remove(&mut self, path: u64) -> Result<()> {
        if path == ROOT {
            return Err(Error::No(ENOREMOVE));
        }
        let node = self.node(path)?;
        if !node.children.is_empty() {
            return Err(Error::No(ENOTEMPTY));
        }
        let (name, dir) = (node.name.clone(), node.parent);

        self.nodes.remove(&path);
        let parent = self.node_mut(dir)?;
        parent.children.remove(&name);
        parent.mtime = now();
        parent.qid.version = parent.qid.version.wrapping_add(1);
        Ok(())
    }

    pub fn truncate(&mut self, path: u64, uid: &str) -> Result<()> {
        let node = self.node_mut(path)?;
        if !node.is_dir() {
            node.data.clear();
            node.mtime = now();
            node.muid = uid.to_owned();
            node.qid.version = node.qid.version.wrapping_add(1);
        }
        Ok(())
    }

    /// Read file contents, or the stat records of a directory.
    ///
    /// Directory offsets count bytes of the packed record stream and must land
    /// on a record boundary.
    pub fn read(&mut self, path: u64, offset: u64, count: u32) -> Result<Vec<u8>> {
        let node = self.node_mut(path)?;
        node.atime = now();

        if !node.is_dir() {
            let start = (offset as usize).min(node.data.len());
            let end = start.saturating_add(count as usize).min(node.data.len());
            return Ok(node.data[start..end].to_vec());
        }

        let children: Vec<u64> = node.children.values().copied().collect();
        let mut stats = Vec::with_capacity(children.len());
        for child in children {
            stats.push(self.stat(child)?);
        }

        let mut skipped = 0u64;
        let mut rest = stats.iter();
        let mut remaining = rest.as_slice();
        while skipped < offset {
            match rest.next() {
                Some(stat) => skipped += stat.size() as u64 + 2,
                None => break,
            }
            remaining = rest.as_slice();
        }
        if skipped != offset {
            return Err(Error::No(EBADOFFSET));
        }

        let (data, _) = serialize::pack_dir(remaining, count as usize)?;
        Ok(data)
    }

    pub fn write(&mut self, path: u64, offset: u64, data: &[u8], uid: &str) -> Result<u32> {
        let node = self.node_mut(path)?;
        if node.is_dir() {
            return Err(Error::No(EISDIR));
        }

        let start = if node.mode & dm::APPEND != 0 {
            node.data.len() as u64
        } else {
            offset
        };
        let end = file_size(start.checked_add(data.len() as u64))?;
        let start = end - data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        node.mtime = now();
        node.muid = uid.to_owned();
        node.qid.version = node.qid.version.wrapping_add(1);
        Ok(data.len() as u32)
    }

    /// Apply the fields of `stat` that are not "don't touch".
    pub fn wstat(&mut self, path: u64, stat: &Stat, uname: &str) -> Result<()> {
        let node = self.node(path)?;
        let owner = node.uid == uname;
        let (dir, old_name) = (node.parent, node.name.clone());

        if !stat.uid.is_empty() && stat.uid != node.uid {
            return Err(Error::No(ENOWSTAT));
        }
        if stat.length != !0 && stat.length != 0 && node.is_dir() {
            return Err(Error::No(EISDIR));
        }
        if (stat.mode != !0 || stat.mtime != !0 || !stat.gid.is_empty()) && !owner {
            return Err(Error::No(EPERM));
        }
        let length = if stat.length != !0 && !node.is_dir() {
            if !self.allows(path, uname, dm::WRITE) {
                return Err(Error::No(EPERM));
            }
            Some(file_size(Some(stat.length))?)
        } else {
            None
        };
        let rename = !stat.name.is_empty() && stat.name != old_name;
        if rename {
            if path == ROOT || stat.name == "." || stat.name == ".." || stat.name.contains('/') {
                return Err(Error::No(EBADNAME));
            }
            if !self.allows(dir, uname, dm::WRITE) {
                return Err(Error::No(EPERM));
            }
            if self.lookup(dir, &stat.name).is_some() {
                return Err(Error::No(EEXIST));
            }
        }

        let node = self.node_mut(path)?;
        if stat.mode != !0 {
            node.mode = (node.mode & dm::DIR) | (stat.mode & !dm::DIR);
            node.qid.typ = QidType::from_mode(node.mode);
        }
        if stat.mtime != !0 {
            node.mtime = stat.mtime;
        }
        if !stat.gid.is_empty() {
            node.gid = stat.gid.clone();
        }
        if let Some(length) = length {
            node.data.resize(length, 0);
            node.qid.version = node.qid.version.wrapping_add(1);
        }
        if rename {
            node.name = stat.name.clone();
            let parent = self.node_mut(dir)?;
            parent.children.remove(&old_name);
            parent.children.insert(stat.name.clone(), path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_remove() {
        let mut tree = Tree::new("glenda");
        let lib = tree.create(ROOT, "lib", dm::DIR | 0o777, "glenda").unwrap();
        let motd = tree.create(lib, "motd", 0o666, "glenda").unwrap();

        assert_eq!(tree.lookup(ROOT, "lib"), Some(lib));
        assert_eq!(tree.lookup(lib, "motd"), Some(motd));
        assert_eq!(tree.lookup(lib, ".."), Some(ROOT));
        assert_eq!(tree.lookup(motd, "x"), None);

        // Permissions are masked by the parent.
        assert_eq!(tree.stat(lib).unwrap().mode, dm::DIR | 0o775);
        assert_eq!(tree.stat(motd).unwrap().mode, 0o664);
        assert!(tree.qid(lib).unwrap().is_dir());

        assert!(matches!(tree.create(lib, "motd", 0o644, "glenda"), Err(Error::No(EEXIST))));
        assert!(matches!(tree.remove(lib), Err(Error::No(ENOTEMPTY))));
        assert!(matches!(tree.remove(ROOT), Err(Error::No(ENOREMOVE))));
        tree.remove(motd).unwrap();
        tree.remove(lib).unwrap();
        assert_eq!(tree.lookup(ROOT, "lib"), None);
    }

    #[test]
    fn read_and_write_files() {
        let mut tree = Tree::new("glenda");
        let f = tree.create(ROOT, "f", 0o644, "glenda").unwrap();
        assert_eq!(tree.write(f, 3, b"abc", "glenda").unwrap(), 3);
        assert_eq!(tree.read(f, 0, 100).unwrap(), b"\0\0\0abc");
        assert_eq!(tree.read(f, 4, 1).unwrap(), b"b");
        assert!(tree.read(f, 100, 10).unwrap().is_empty());
        assert_eq!(tree.qid(f).unwrap().version, 1);

        tree.truncate(f, "glenda").unwrap();
        assert_eq!(tree.stat(f).unwrap().length, 0);
    }

    #[test]
    fn directory_reads_resume_at_record_boundaries() {
        let mut tree = Tree::new("glenda");
        for name in ["a", "b", "c"] {
            tree.create(ROOT, name, 0o644, "glenda").unwrap();
        }

        let all = serialize::read_dir(&tree.read(ROOT, 0, 8192).unwrap()).unwrap();
        let names: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let first = all[0].size() as u32 + 2;
        let page = tree.read(ROOT, 0, first + 1).unwrap();
        assert_eq!(page.len() as u32, first);

        let rest = serialize::read_dir(&tree.read(ROOT, first as u64, 8192).unwrap()).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].name, "b");

        assert!(matches!(tree.read(ROOT, 1, 8192), Err(Error::No(EBADOFFSET))));
    }

    #[test]
    fn permissions() {
        let mut tree = Tree::new("glenda");
        let f = tree.create(ROOT, "f", 0o640, "glenda").unwrap();
        assert!(tree.allows(f, "glenda", dm::READ | dm::WRITE));
        assert!(!tree.allows(f, "rob", dm::READ));
        assert!(tree.allows(ROOT, "rob", dm::READ | dm::EXEC));
        assert!(!tree.allows(ROOT, "rob", dm::WRITE));
    }

    #[test]
    fn wstat_renames_and_chmods() {
        let mut tree = Tree::new("glenda");
        let f = tree.create(ROOT, "f", 0o644, "glenda").unwrap();

        let mut stat = Stat::dont_touch();
        stat.name = "g".to_owned();
        stat.mode = dm::DIR | 0o600;
        tree.wstat(f, &stat, "glenda").unwrap();
        assert_eq!(tree.lookup(ROOT, "g"), Some(f));
        assert_eq!(tree.lookup(ROOT, "f"), None);
        assert_eq!(tree.stat(f).unwrap().mode, 0o600);

        assert!(matches!(tree.wstat(f, &stat, "rob"), Err(Error::No(EPERM))));

        let mut stat = Stat::dont_touch();
        stat.length = 4;
        tree.wstat(f, &stat, "glenda").unwrap();
        assert_eq!(tree.stat(f).unwrap().length, 4);
    }

    #[test]
    fn writes_past_the_size_limit_fail() {
        let mut tree = Tree::new("glenda");
        let f = tree.create(ROOT, "f", 0o644, "glenda").unwrap();
        assert!(matches!(tree.write(f, u64::MAX, b"abc", "glenda"), Err(Error::No(ENOMEM))));
        assert!(matches!(tree.write(f, 1 << 40, b"abc", "glenda"), Err(Error::No(ENOMEM))));
        assert!(matches!(tree.write(f, MAX_FILE_SIZE - 2, b"abc", "glenda"), Err(Error::No(ENOMEM))));
        assert_eq!(tree.stat(f).unwrap().length, 0);
        assert_eq!(tree.qid(f).unwrap().version, 0);

        let mut stat = Stat::dont_touch();
        stat.length = 1 << 40;
        assert!(matches!(tree.wstat(f, &stat, "glenda"), Err(Error::No(ENOMEM))));
        assert_eq!(tree.stat(f).unwrap().length, 0);
    }

    #[test]
    fn length_change_needs_write_permission() {
        let mut tree = Tree::new("glenda");
        let f = tree.create(ROOT, "f", 0o644, "glenda").unwrap();
        tree.write(f, 0, b"secret", "glenda").unwrap();

        let mut stat = Stat::dont_touch();
        stat.length = 0;
        assert!(matches!(tree.wstat(f, &stat, "rob"), Err(Error::No(EPERM))));
        assert_eq!(tree.stat(f).unwrap().length, 6);

        tree.wstat(f, &stat, "glenda").unwrap();
        assert_eq!(tree.stat(f).unwrap().length, 0);
    }

    #[test]
    fn versions_wrap() {
        let mut tree = Tree::new("glenda");
        let f = tree.create(ROOT, "f", 0o644, "glenda").unwrap();
        tree.node_mut(f).unwrap().qid.version = u32::MAX;
        tree.write(f, 0, b"x", "glenda").unwrap();
        assert_eq!(tree.qid(f).unwrap().version, 0);
    }
}
