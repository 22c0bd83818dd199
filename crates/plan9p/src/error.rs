//! 9P error representations.
//!
//! In 9P2000 an error is carried back to the client as a string in `Rerror`.
//! The canonical strings used by Plan 9 file servers live in [`string`].

use std::{fmt, io};

/// Error strings sent in `Rerror`, as used by the Plan 9 file servers.
pub mod string {
    pub const EBADATTACH: &str = "unknown specifier in attach";
    pub const EBADOFFSET: &str = "bad offset";
    pub const EBADCOUNT: &str = "bad count";
    pub const EBOTCH: &str = "9P protocol botch";
    pub const ECREATENONDIR: &str = "create in non-directory";
    pub const EDUPFID: &str = "duplicate fid";
    pub const EDUPTAG: &str = "duplicate tag";
    pub const EISDIR: &str = "is a directory";
    pub const ENOCREATE: &str = "create prohibited";
    pub const ENOMEM: &str = "out of memory";
    pub const ENOREMOVE: &str = "remove prohibited";
    pub const ENOSTAT: &str = "stat prohibited";
    pub const ENOTFOUND: &str = "file not found";
    pub const ENOWRITE: &str = "write prohibited";
    pub const ENOWSTAT: &str = "wstat prohibited";
    pub const EPERM: &str = "permission denied";
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const EBADDIR: &str = "bad directory in wstat";
    pub const EWALKNODIR: &str = "walk in non-directory";

    pub const EOPEN: &str = "fid already open";
    pub const ENOTOPEN: &str = "fid not open";
    pub const EWALKOPEN: &str = "cannot walk an open fid";
    pub const ETOOMANYWNAMES: &str = "too many names in walk";
    pub const EBADNAME: &str = "bad file name";
    pub const EEXIST: &str = "file already exists";
    pub const ENOTEMPTY: &str = "directory not empty";
    pub const ENOAUTH: &str = "authentication not required";
    pub const ENOVERSION: &str = "version not negotiated";
    pub const ESMALLMSIZE: &str = "version: message size too small";
    pub const ENOTSUP: &str = "operation not supported";
}

/// The error type of this crate.
#[derive(Debug)]
pub enum Error {
    /// The request was refused. The string is sent to the peer in `Rerror`.
    No(&'static str),
    /// The peer answered the request with `Rerror`.
    Remote(String),
    /// The peer broke the protocol. Fatal to the connection.
    Protocol(String),
    /// Transport failure.
    Io(io::Error),
}

impl Error {
    /// The text to put in an `Rerror` for this error.
    pub fn ename(&self) -> String {
        match *self {
            Error::No(e) => e.to_owned(),
            Error::Remote(ref e) | Error::Protocol(ref e) => e.clone(),
            Error::Io(ref e) => match e.kind() {
                io::ErrorKind::NotFound => string::ENOTFOUND.to_owned(),
                io::ErrorKind::PermissionDenied => string::EPERM.to_owned(),
                io::ErrorKind::AlreadyExists => string::EEXIST.to_owned(),
                io::ErrorKind::OutOfMemory => string::ENOMEM.to_owned(),
                _ => e.to_string(),
            },
        }
    }

    /// Whether the connection that produced this error must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(*self, Error::Protocol(_) | Error::Io(_))
    }

    pub(crate) fn botch(msg: impl fmt::Display) -> Error {
        Error::Protocol(format!("{}: {}", string::EBOTCH, msg))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(e) => write!(f, "{}", e),
            Error::Remote(ref e) => write!(f, "remote error: {}", e),
            Error::Protocol(ref e) => write!(f, "protocol violation: {}", e),
            Error::Io(ref e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[test]
fn ename_of_io_errors() {
    let e = Error::from(crate::io_err!(NotFound, "no such file"));
    assert_eq!(e.ename(), string::ENOTFOUND);
    assert!(e.is_fatal());

    let e = Error::from(io::Error::other("disk on fire"));
    assert_eq!(e.ename(), "disk on fire");

    let e = Error::No(string::EDUPFID);
    assert_eq!(e.ename(), "duplicate fid");
    assert!(!e.is_fatal());
}
