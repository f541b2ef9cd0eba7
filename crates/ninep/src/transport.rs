//! Service name → byte stream.
//!
//! Accepted forms:
//!
//! * `tcp!host!port` and `unix!path!suffix`
//! * `sources`, the public Plan 9 file server
//! * `host:port`
//! * anything else names a socket in the plan9port namespace directory,
//!   `/tmp/ns.$USER.$DISPLAY/<service>`

use std::env;
use std::path::PathBuf;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::{error::Error, fcall::STYX_PORT, utils::parse_proto, utils::Result};

/// A transport stream a connection can run on
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

/// Directory plan9port services announce their sockets in
pub fn namespace_dir() -> PathBuf {
    let user = env::var("USER").unwrap_or_else(|_| "none".to_owned());
    let display = env::var("DISPLAY").unwrap_or_else(|_| ":0".to_owned());
    PathBuf::from("/tmp").join(format!("ns.{}.{}", user, display))
}

pub fn resolve(service: &str) -> Result<Endpoint> {
    if service.is_empty() {
        return Err(Error::Config("empty service name".to_owned()));
    }

    if let Some((proto, addr, port)) = parse_proto(service) {
        return match proto {
            "tcp" => Ok(Endpoint::Tcp(format!("{}:{}", addr, port))),
            "unix" => Ok(Endpoint::Unix(PathBuf::from(addr))),
            _ => Err(Error::Config(format!("unsupported protocol {:?}", proto))),
        };
    }

    if service == "sources" {
        return Ok(Endpoint::Tcp(format!("sources.9p.io:{}", STYX_PORT)));
    }
    if service.contains(':') {
        return Ok(Endpoint::Tcp(service.to_owned()));
    }
    if service.contains('/') {
        return Err(Error::Config(format!("invalid service name {:?}", service)));
    }

    Ok(Endpoint::Unix(namespace_dir().join(service)))
}

pub async fn connect(endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
    debug!("connecting to {:?}", endpoint);
    Ok(match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
        Endpoint::Unix(path) => Box::new(UnixStream::connect(path).await?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_notation() {
        assert_eq!(
            resolve("tcp!127.0.0.1!564").unwrap(),
            Endpoint::Tcp("127.0.0.1:564".to_owned())
        );
        assert_eq!(
            resolve("unix!/tmp/9p.sock!0").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/9p.sock"))
        );
        assert!(matches!(resolve("udp!host!1"), Err(Error::Config(_))));
    }

    #[test]
    fn well_known_and_host_port() {
        assert_eq!(
            resolve("sources").unwrap(),
            Endpoint::Tcp("sources.9p.io:564".to_owned())
        );
        assert_eq!(
            resolve("localhost:5640").unwrap(),
            Endpoint::Tcp("localhost:5640".to_owned())
        );
    }

    #[test]
    fn plain_name_is_namespace_socket() {
        let Endpoint::Unix(path) = resolve("acme").unwrap() else {
            panic!("expected a unix socket");
        };
        assert_eq!(path, namespace_dir().join("acme"));
        assert!(path.starts_with("/tmp"));
        assert!(resolve("").is_err());
        assert!(resolve("a/b").is_err());
    }
}
