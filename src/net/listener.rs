//! Client listener.
//!
//! The etcd endpoint listens on either a TCP `host:port` or a UNIX domain
//! socket given as `unix://<path>`. The listener is bound before the gRPC
//! server starts so the actual address (port 0 included) is known when the
//! advertised client URL is built.

use anyhow::{Context, Result};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";

/// A parsed listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// TCP `host:port`.
    Tcp(String),
    /// UNIX domain socket path.
    Unix(PathBuf),
}

impl ListenAddress {
    /// Parse a listen address. Anything without the `unix://` scheme is
    /// treated as TCP; a leading `tcp://` is accepted and ignored.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if let Some(path) = address.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                anyhow::bail!("unix listen address has no socket path");
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let host_port = address.strip_prefix(TCP_SCHEME).unwrap_or(address);
        match host_port.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => Ok(Self::Tcp(host_port.to_string())),
            _ => anyhow::bail!("invalid listen address {address:?}: expected host:port or unix://path"),
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => f.write_str(addr),
            Self::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
        }
    }
}

/// PEM-encoded server certificate chain and private key.
#[derive(Clone)]
pub struct TlsIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Load the certificate chain and key from disk.
    pub fn load(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("failed to read cert chain: {cert_path}"))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("failed to read private key: {key_path}"))?;
        Ok(Self { cert_pem, key_pem })
    }
}

/// A bound listener, ready to hand to the gRPC server.
#[derive(Debug)]
pub enum BoundListener {
    Tcp {
        listener: TcpListener,
        local_addr: SocketAddr,
    },
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl BoundListener {
    /// Bind `address`. A stale socket file left by a previous run is
    /// removed first.
    pub async fn bind(address: &ListenAddress) -> Result<Self> {
        match address {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .with_context(|| format!("failed to bind {addr}"))?;
                let local_addr = listener.local_addr()?;
                Ok(Self::Tcp {
                    listener,
                    local_addr,
                })
            }
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = tokio::net::UnixListener::bind(path)
                    .with_context(|| format!("failed to bind {}", path.display()))?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            ListenAddress::Unix(path) => {
                anyhow::bail!("unix sockets are not supported here: {}", path.display())
            }
        }
    }

    /// TCP address the listener is bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp { local_addr, .. } => Some(*local_addr),
            #[cfg(unix)]
            Self::Unix { .. } => None,
        }
    }

    /// URL clients should use to reach this listener.
    ///
    /// Wildcard TCP binds advertise the loopback address.
    pub fn client_url(&self, tls: bool) -> String {
        match self {
            Self::Tcp { local_addr, .. } => {
                let scheme = if tls { "https" } else { "http" };
                let mut addr = *local_addr;
                if addr.ip().is_unspecified() {
                    addr.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
                }
                format!("{scheme}://{addr}")
            }
            #[cfg(unix)]
            Self::Unix { path, .. } => format!("{UNIX_SCHEME}{}", path.display()),
        }
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            tracing::debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Ok(_) => anyhow::bail!("{} exists and is not a socket", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            ListenAddress::parse("127.0.0.1:2379").unwrap(),
            ListenAddress::Tcp("127.0.0.1:2379".to_string())
        );
        assert_eq!(
            ListenAddress::parse("tcp://0.0.0.0:2379").unwrap(),
            ListenAddress::Tcp("0.0.0.0:2379".to_string())
        );
        assert!(ListenAddress::parse("localhost").is_err());
        assert!(ListenAddress::parse("host:port").is_err());
    }

    #[test]
    fn test_parse_unix() {
        let addr = ListenAddress::parse("unix:///run/strata.sock").unwrap();
        assert_eq!(addr, ListenAddress::Unix(PathBuf::from("/run/strata.sock")));
        assert_eq!(addr.to_string(), "unix:///run/strata.sock");
        assert!(ListenAddress::parse("unix://").is_err());
    }

    #[tokio::test]
    async fn test_tcp_client_url_uses_loopback() {
        let addr = ListenAddress::parse("0.0.0.0:0").unwrap();
        let bound = BoundListener::bind(&addr).await.unwrap();
        let port = bound.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(bound.client_url(false), format!("http://127.0.0.1:{port}"));
        assert_eq!(bound.client_url(true), format!("https://127.0.0.1:{port}"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_rebinds_over_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.sock");
        let addr = ListenAddress::Unix(path.clone());

        let first = BoundListener::bind(&addr).await.unwrap();
        drop(first);
        // The socket file survives the listener.
        assert!(path.exists());

        let second = BoundListener::bind(&addr).await.unwrap();
        assert_eq!(
            second.client_url(false),
            format!("unix://{}", path.display())
        );
    }

    #[test]
    fn test_missing_identity_files() {
        let err = TlsIdentity::load("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
        assert!(err.to_string().contains("cert chain"));
    }
}
