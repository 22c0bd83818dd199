use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a Plan 9 style dial string, `proto!addr!port`.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

/// Turn either a dial string or a plain `host:port` into a socket address string.
pub fn listen_addr(arg: &str) -> Option<String> {
    match parse_proto(arg) {
        Some(("tcp", addr, port)) => Some(format!("{}:{}", addr, port)),
        Some(_) => None,
        None if arg.contains(':') => Some(arg.to_owned()),
        None => None,
    }
}

#[test]
fn parse_dial_strings() {
    assert_eq!(parse_proto("tcp!0.0.0.0!564"), Some(("tcp", "0.0.0.0", "564")));
    assert_eq!(parse_proto("localhost:564"), None);

    assert_eq!(listen_addr("tcp!127.0.0.1!5640").as_deref(), Some("127.0.0.1:5640"));
    assert_eq!(listen_addr("127.0.0.1:5640").as_deref(), Some("127.0.0.1:5640"));
    assert_eq!(listen_addr("unix!/tmp/sock!0"), None);
    assert_eq!(listen_addr("localhost"), None);
}
