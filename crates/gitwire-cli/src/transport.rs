//! Stream setup for the two supported transports: a `git daemon` over TCP
//! and a local `git-upload-pack`/`git-receive-pack` child process.

use gitwire_protocol::{daemon_request, Service, DEFAULT_DAEMON_PORT};
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

/// Where a repository lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remote {
    /// Served by `git daemon`.
    Daemon {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
        /// Repository path on the daemon.
        path: String,
    },
    /// A repository on the local filesystem.
    Local {
        /// Path to the repository.
        path: String,
    },
}

impl Remote {
    /// Builds a remote from the command-line arguments.
    pub fn new(repository: String, host: Option<String>, port: Option<u16>) -> Self {
        match host {
            Some(host) => Self::Daemon {
                host,
                port: port.unwrap_or(DEFAULT_DAEMON_PORT),
                path: repository,
            },
            None => Self::Local { path: repository },
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// An open duplex stream to a git service.
pub struct Connection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Local service process, if any.
    pub child: Option<Child>,
}

/// Waits for a local service process to exit.
///
/// The session must have released the writer first, otherwise the child
/// never sees end of input.
pub async fn wait(child: Option<Child>) -> io::Result<()> {
    if let Some(mut child) = child {
        let status = child.wait().await?;
        tracing::debug!(%status, "service process exited");
    }
    Ok(())
}

/// Opens a connection to `service` on `remote`.
pub async fn connect(remote: &Remote, service: Service) -> io::Result<Connection> {
    match remote {
        Remote::Daemon { host, port, path } => {
            tracing::info!(%host, port, %path, %service, "connecting to git daemon");
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            let (reader, mut writer) = stream.into_split();
            let host_header = if *port == DEFAULT_DAEMON_PORT {
                host.clone()
            } else {
                format!("{}:{}", host, port)
            };
            writer
                .write_all(&daemon_request(service, path, &host_header).encode())
                .await?;
            Ok(Connection {
                reader: Box::new(reader),
                writer: Box::new(writer),
                child: None,
            })
        }
        Remote::Local { path } => {
            tracing::info!(%path, %service, "spawning local service");
            let mut child = Command::new(service.as_str())
                .arg(path)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdin missing"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdout missing"))?;
            Ok(Connection {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                child: Some(child),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_selection() {
        assert_eq!(
            Remote::new("/srv/repo.git".into(), None, Some(1)),
            Remote::Local {
                path: "/srv/repo.git".into()
            }
        );
        assert_eq!(
            Remote::new("/repo.git".into(), Some("example.com".into()), None),
            Remote::Daemon {
                host: "example.com".into(),
                port: DEFAULT_DAEMON_PORT,
                path: "/repo.git".into()
            }
        );
    }
}
