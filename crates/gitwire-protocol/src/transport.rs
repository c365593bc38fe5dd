//! git:// daemon request line.

use crate::pktline::PktLine;
use std::fmt;

/// Default port of `git daemon`.
pub const DEFAULT_DAEMON_PORT: u16 = 9418;

/// Server-side program a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Serves fetches.
    UploadPack,
    /// Serves pushes.
    ReceivePack,
}

impl Service {
    /// Program name as used on the wire and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the first pkt-line sent to a git daemon:
/// `git-upload-pack /path\0host=<host>\0`.
pub fn daemon_request(service: Service, path: &str, host: &str) -> PktLine {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    PktLine::from_string(&format!("{} {}\0host={}\0", service, path, host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_pack_request() {
        let pkt = daemon_request(Service::UploadPack, "/project.git", "example.com");
        assert_eq!(
            pkt.encode(),
            b"0032git-upload-pack /project.git\0host=example.com\0"
        );
    }

    #[test]
    fn test_relative_path_gets_leading_slash() {
        let pkt = daemon_request(Service::ReceivePack, "repo", "localhost:9418");
        assert_eq!(
            pkt.data().unwrap(),
            b"git-receive-pack /repo\0host=localhost:9418\0"
        );
    }
}
