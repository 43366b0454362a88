//! TCP connect helper.
//!
//! # Example
//!
//! ```rust,no_run
//! use latch_proto::ssh::client;
//! use latch_proto::ssh::config::TransportConfig;
//! use latch_proto::ssh::hostkey::AcceptAnyHostKey;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransportConfig::builder()
//!     .with_host("127.0.0.1")
//!     .with_port(22)
//!     .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
//!     .build()?;
//! let session = client::connect(config).await?;
//!
//! let channel = session.open_session_channel().await?;
//! channel.exec("uname -a").await?;
//! let output = channel.read_to_end().await?;
//! println!("{}", String::from_utf8_lossy(&output));
//! # Ok(())
//! # }
//! ```

use crate::ssh::config::TransportConfig;
use crate::ssh::session::{Role, Session};
use latch_platform::{LatchError, LatchResult};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Connects to the configured host and port and establishes a session.
///
/// The connect timeout covers the TCP connect as well as the banner and
/// initial key exchange.
pub async fn connect(config: TransportConfig) -> LatchResult<Session> {
    let addr = format!("{}:{}", config.host(), config.port());
    connect_addr(&addr, config).await
}

/// Connects to `addr` and establishes a session with `config`.
pub async fn connect_addr(addr: &str, config: TransportConfig) -> LatchResult<Session> {
    if config.role() != Role::Client {
        return Err(LatchError::Config(
            "Outbound connections need a client configuration".to_string(),
        ));
    }

    let started = Instant::now();
    let limit = config.connect_timeout();
    debug!(addr, "Connecting");
    let stream = tokio::time::timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| LatchError::Timeout(format!("Connecting to {} timed out", addr)))??;
    stream.set_nodelay(true)?;
    info!(addr, peer = ?stream.peer_addr().ok(), "TCP connection established");

    let remaining = limit.saturating_sub(started.elapsed());
    let config = config
        .to_builder()
        .with_connect_timeout(remaining)
        .build()?;
    Session::establish(stream, Arc::new(config)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{AcceptAnyHostKey, Ed25519HostKey};
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_config_rejected() {
        let config = TransportConfig::builder()
            .with_role(Role::Server)
            .with_host_key_signer(Arc::new(Ed25519HostKey::generate()))
            .build()
            .unwrap();
        let err = connect_addr("127.0.0.1:1", config).await.unwrap_err();
        assert!(matches!(err, LatchError::Config(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = TransportConfig::builder()
            .with_host("127.0.0.1")
            .with_port(addr.port())
            .with_connect_timeout(Duration::from_secs(5))
            .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
            .build()
            .unwrap();
        let err = connect(config).await.unwrap_err();
        assert!(matches!(err, LatchError::Io(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let config = TransportConfig::builder()
            .with_host("127.0.0.1")
            .with_port(addr.port())
            .with_connect_timeout(Duration::from_millis(200))
            .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
            .build()
            .unwrap();
        let err = connect(config).await.unwrap_err();
        assert!(matches!(err, LatchError::Timeout(_)));
    }
}
