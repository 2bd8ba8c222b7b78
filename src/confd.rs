//! Client for the network configuration daemon's status socket.
//!
//! After boot the daemon loads every interface config section and
//! publishes one `{target, success, comment}` record per section.
//! Until that has settled it answers with an empty report, so the
//! caller polls.  Startup cannot proceed without this signal, which
//! is why the wait is unbounded.

use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::sleep;

use crate::errors::ChuteError;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One config section the daemon attempted to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSectionStatus {
    pub target: String,
    pub success: bool,
    #[serde(default)]
    pub comment: String,
}

pub struct ConfdClient {
    socket: PathBuf,
}

impl ConfdClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Single status request.  An empty report means the daemon is up
    /// but interface configuration has not settled yet.
    pub async fn query_status(&self) -> Result<Vec<ConfigSectionStatus>, ChuteError> {
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| ChuteError::Daemon(format!("connect {}: {}", self.socket.display(), e)))?;
        stream
            .write_all(b"waitSystemUp\n")
            .await
            .map_err(|e| ChuteError::Daemon(format!("request failed: {}", e)))?;
        stream
            .shutdown()
            .await
            .map_err(|e| ChuteError::Daemon(format!("request failed: {}", e)))?;

        let mut body = String::new();
        stream
            .read_to_string(&mut body)
            .await
            .map_err(|e| ChuteError::Daemon(format!("reading status failed: {}", e)))?;
        let body = body.trim();
        if body.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(body)
            .map_err(|e| ChuteError::Daemon(format!("malformed status report: {}", e)))
    }

    /// Block until the daemon publishes a non-empty status report,
    /// retrying every second.
    pub async fn wait_system_up(&self) -> Vec<ConfigSectionStatus> {
        loop {
            match self.query_status().await {
                Ok(report) if !report.is_empty() => return report,
                Ok(_) => debug!("network daemon is up, config not settled yet"),
                Err(e) => debug!("waiting for network daemon: {}", e),
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn reads_a_status_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 64];
            let n = stream.read(&mut req).await.unwrap();
            assert!(String::from_utf8_lossy(&req[..n]).starts_with("waitSystemUp"));
            stream
                .write_all(br#"[{"target":"app1","success":true,"comment":""}]"#)
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        });

        let client = ConfdClient::new(&path);
        let report = client.query_status().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].target, "app1");
        assert!(report[0].success);
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_error_not_a_panic() {
        let client = ConfdClient::new("/nonexistent/confd.sock");
        assert!(matches!(
            client.query_status().await,
            Err(ChuteError::Daemon(_))
        ));
    }
}
