use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::filter::engine::PolicyEngine;

/// Errors from the DNS filtering front end
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("DNS Protocol error: {0}")]
    ProtocolError(#[from] hickory_proto::ProtoError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout waiting for upstream DNS Server")]
    UpstreamTimeout,
}

/// Result type for DNS front end operations
pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub upstream_servers: Vec<SocketAddr>,
    pub upstream_timeout_ms: u64,
}

/// UDP front end: every query goes through the policy engine, blocked
/// names are answered with NXDOMAIN and the rest are forwarded upstream.
pub struct DnsFilter {
    socket: Arc<UdpSocket>,
    engine: Arc<PolicyEngine>,
    config: Arc<ListenerConfig>,
    buffer_size: usize,
}

impl DnsFilter {
    pub async fn bind(bind_addr: SocketAddr, engine: Arc<PolicyEngine>, config: ListenerConfig) -> ServerResult<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let buffer_size = if cfg!(target_os = "linux") { 8192 } else { 4096 };

        Ok(Self {
            socket: Arc::new(socket),
            engine,
            config: Arc::new(config),
            buffer_size,
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until a non-transient socket error
    pub async fn run(&self) -> ServerResult<()> {
        info!("DNS filter listening on {}", self.socket.local_addr()?);
        let mut recv_buffer = vec![0u8; self.buffer_size];

        loop {
            match self.socket.recv_from(&mut recv_buffer).await {
                Ok((size, client_addr)) => {
                    let socket = self.socket.clone();
                    let engine = self.engine.clone();
                    let config = self.config.clone();
                    let request_data = recv_buffer[..size].to_vec();

                    tokio::spawn(async move {
                        let start_time = Instant::now();
                        match Self::handle_request(&socket, &request_data, client_addr, &engine, &config).await {
                            Ok(()) => debug!("Request from {} handled in {:?}", client_addr, start_time.elapsed()),
                            Err(e) => {
                                warn!("Error processing request from {}: {}", client_addr, e);
                                if let Ok(reply) = error_response(&request_data, ResponseCode::ServFail) {
                                    if let Err(send_err) = socket.send_to(&reply, client_addr).await {
                                        warn!("Failed to send error response: {}", send_err);
                                    }
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to receive data: {}", e);
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::ConnectionReset
                    {
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_request(
        socket: &UdpSocket,
        request_data: &[u8],
        client_addr: SocketAddr,
        engine: &PolicyEngine,
        config: &ListenerConfig,
    ) -> ServerResult<()> {
        let outcome = engine.decide_packet(request_data, Some(client_addr.ip()));

        if outcome.decision.is_blocked() {
            info!(
                "Blocked {} for {} ({})",
                outcome.name.as_deref().unwrap_or("?"),
                client_addr.ip(),
                outcome.decision
            );
            let reply = error_response(request_data, ResponseCode::NXDomain)?;
            socket.send_to(&reply, client_addr).await?;
            return Ok(());
        }

        let reply = forward_to_upstream(request_data, &config.upstream_servers, config.upstream_timeout_ms).await?;
        socket.send_to(&reply, client_addr).await?;
        Ok(())
    }
}

/// Answer `request_data` locally with `code` and no records
pub fn error_response(request_data: &[u8], code: ResponseCode) -> ServerResult<Vec<u8>> {
    let request = Message::from_vec(request_data)?;

    let mut response = request.clone();
    response.set_message_type(MessageType::Response);
    response.set_response_code(code);
    response.set_recursion_available(true);
    response.take_answers();
    response.take_name_servers();
    response.take_additionals();

    Ok(response.to_vec()?)
}

/// Send the raw query to each upstream in turn; the first valid reply wins
pub async fn forward_to_upstream(
    request_data: &[u8],
    upstream_servers: &[SocketAddr],
    timeout_ms: u64,
) -> ServerResult<Vec<u8>> {
    let timeout = Duration::from_millis(timeout_ms);

    for server in upstream_servers {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let upstream_socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to bind upstream socket: {}", e);
                return Err(e.into());
            }
        };

        if let Err(e) = upstream_socket.send_to(request_data, server).await {
            warn!("Failed to send to upstream server {}: {}", server, e);
            continue;
        }

        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(timeout, upstream_socket.recv_from(&mut buf)).await {
            Ok(Ok((size, from))) if from == *server => match Message::from_vec(&buf[..size]) {
                Ok(_) => return Ok(buf[..size].to_vec()),
                Err(e) => warn!("Invalid response from upstream server {}: {}", server, e),
            },
            Ok(Ok((_, from))) => warn!("Ignoring reply from unexpected address {}", from),
            Ok(Err(e)) => warn!("Error receiving from upstream server {}: {}", server, e),
            Err(_) => warn!("Timeout waiting for response from upstream server {}", server),
        }
    }

    error!("All upstream DNS servers failed to respond");
    Err(ServerError::UpstreamTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::query::tests::query_packet;
    use crate::filter::categories::Category;
    use crate::models::BlockedEntry;
    use crate::sync::bundle::ConfigBundle;
    use crate::sync::snapshot::{PolicySnapshot, SnapshotSlot};

    fn engine() -> Arc<PolicyEngine> {
        let bundle = ConfigBundle {
            revision: 1,
            blocked_domains: vec![BlockedEntry::new("blocked.com", Category::Custom)],
            ..ConfigBundle::default()
        };
        let slot = Arc::new(SnapshotSlot::new());
        slot.publish(Arc::new(PolicySnapshot::from_bundle(&bundle)));
        Arc::new(PolicyEngine::new(slot))
    }

    #[test]
    fn test_nxdomain_response_echoes_question() {
        let request = query_packet("blocked.com");
        let reply = error_response(&request, ResponseCode::NXDomain).unwrap();
        let message = Message::from_vec(&reply).unwrap();

        assert_eq!(message.id(), 0x1234);
        assert_eq!(message.message_type(), MessageType::Response);
        assert_eq!(message.response_code(), ResponseCode::NXDomain);
        assert_eq!(message.queries().len(), 1);
        assert!(message.answers().is_empty());
    }

    #[test]
    fn test_error_response_needs_parsable_request() {
        assert!(error_response(&[0u8; 4], ResponseCode::ServFail).is_err());
    }

    #[tokio::test]
    async fn test_blocked_and_forwarded_queries() {
        // Fake upstream that answers every query with REFUSED
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((size, from)) = upstream.recv_from(&mut buf).await {
                if let Ok(reply) = error_response(&buf[..size], ResponseCode::Refused) {
                    let _ = upstream.send_to(&reply, from).await;
                }
            }
        });

        let config = ListenerConfig {
            upstream_servers: vec![upstream_addr],
            upstream_timeout_ms: 2000,
        };
        let filter = DnsFilter::bind("127.0.0.1:0".parse().unwrap(), engine(), config).await.unwrap();
        let filter_addr = filter.local_addr().unwrap();
        let server = tokio::spawn(async move { filter.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = vec![0u8; 512];

        client.send_to(&query_packet("ads.blocked.com"), filter_addr).await.unwrap();
        let (size, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::from_vec(&buf[..size]).unwrap().response_code(), ResponseCode::NXDomain);

        client.send_to(&query_packet("example.org"), filter_addr).await.unwrap();
        let (size, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::from_vec(&buf[..size]).unwrap().response_code(), ResponseCode::Refused);

        server.abort();
    }

    #[tokio::test]
    async fn test_all_upstreams_silent() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let result = forward_to_upstream(&query_packet("example.org"), &[addr], 50).await;
        assert!(matches!(result, Err(ServerError::UpstreamTimeout)));
        drop(silent);
    }
}
