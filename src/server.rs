use crate::ber::{self, BerNode};
use crate::config::ServiceIdentity;
use crate::handler::HandlerRegistry;
use crate::session::Session;
use crate::stats::Stats;
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Client transport. Concrete connections are TCP; tests use in-memory
/// duplex streams.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// One client connection: the transport plus a peer label for logs. Handlers
/// receive this to stream search entries; the session loop owns it.
pub struct ClientConn {
    stream: Box<dyn Transport>,
    peer: String,
}

impl ClientConn {
    pub fn new(stream: impl Transport + 'static, peer: String) -> Self {
        Self {
            stream: Box::new(stream),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Next complete envelope from the wire; None on clean end of stream.
    pub async fn read_envelope(&mut self, buf: &mut BytesMut) -> Result<Option<BerNode>> {
        ber::read_envelope(&mut self.stream, buf).await
    }

    /// Encode and send one response envelope. A failure here is fatal to the
    /// session.
    pub async fn send(&mut self, envelope: &BerNode) -> Result<()> {
        let data = envelope.to_bytes();
        self.stream
            .write_all(&data)
            .await
            .with_context(|| format!("send to {}", self.peer))?;
        self.stream
            .flush()
            .await
            .with_context(|| format!("flush to {}", self.peer))?;
        Ok(())
    }
}

pub struct LdapFrontend {
    listen_url: String,
    registry: Arc<HandlerRegistry>,
    stats: Arc<Stats>,
    service: Arc<ServiceIdentity>,
}

impl LdapFrontend {
    pub fn new(
        listen_url: String,
        registry: Arc<HandlerRegistry>,
        stats: Arc<Stats>,
        service: Arc<ServiceIdentity>,
    ) -> Self {
        Self {
            listen_url,
            registry,
            stats,
            service,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let addr = parse_listen_url(&self.listen_url)?;

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("LDAP front end listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    self.stats.count_connection();
                    let session = Session::new(
                        Arc::clone(&self.registry),
                        Arc::clone(&self.stats),
                        Arc::clone(&self.service),
                    );
                    tokio::spawn(async move {
                        let conn = ClientConn::new(stream, peer_addr.to_string());
                        session.run(conn).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    let url = url
        .strip_prefix("ldap://")
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap://"))?;

    let url = url.trim_start_matches('/');

    if url.starts_with(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = url
            .trim_start_matches(':')
            .parse()
            .context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, ResultCode};

    #[test]
    fn test_parse_listen_url() {
        let addr = parse_listen_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_parse_listen_url_port_only() {
        let addr = parse_listen_url("ldap://:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn test_parse_listen_url_with_slashes() {
        let addr = parse_listen_url("ldap:///127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
    }

    #[test]
    fn test_parse_listen_url_invalid() {
        assert!(parse_listen_url("http://127.0.0.1:1389").is_err());
        assert!(parse_listen_url("ldap://:99999").is_err());
        assert!(parse_listen_url("ldap://invalid:address").is_err());
    }

    #[tokio::test]
    async fn test_client_conn_send_and_read() {
        use tokio::io::AsyncReadExt;
        let (mut client, server) = tokio::io::duplex(4096);
        let mut conn = ClientConn::new(server, "test".to_string());
        conn.send(&protocol::bind_response(1, ResultCode::Success))
            .await
            .unwrap();
        drop(conn);
        let mut data = Vec::new();
        client.read_to_end(&mut data).await.unwrap();
        let parsed = crate::ber::parse(&data).unwrap();
        assert_eq!(parsed.children[0].as_unsigned(), Some(1));
    }
}
