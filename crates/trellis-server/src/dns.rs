//! Overlay DNS resolver
//!
//! Single-question responder bound on UDP and TCP. Node names resolve to
//! overlay gateway IPs and win over peer names, which resolve to
//! allocated peer IPs (multiple answers allowed). Anything else is
//! forwarded to the upstream resolver and its reply is relayed verbatim,
//! so off-overlay resolution behaves exactly as if the client had asked
//! the upstream itself.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trust_dns_proto::op::{Message, MessageType, Query};
use trust_dns_proto::rr::{rdata::A, RData, Record, RecordType};

use crate::error::Result;
use crate::registry::Registry;

/// TTL of overlay answers
const ANSWER_TTL: u32 = 10;

/// Timeout for an upstream exchange
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Overlay DNS server
pub struct DnsServer {
    registry: Arc<Registry>,
    listen: SocketAddr,
    upstream: SocketAddr,
}

impl DnsServer {
    pub fn new(registry: Arc<Registry>, listen: SocketAddr, upstream: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            registry,
            listen,
            upstream,
        })
    }

    /// Bind both listeners and serve until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let udp = Arc::new(UdpSocket::bind(self.listen).await?);
        let tcp = TcpListener::bind(self.listen).await?;
        info!(addr = %udp.local_addr()?, "DNS server listening");

        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.serve_udp(udp) => result,
            result = self.serve_tcp(tcp) => result,
        }
    }

    async fn serve_udp(self: &Arc<Self>, socket: Arc<UdpSocket>) -> Result<()> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            let query = buf[..len].to_vec();
            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(reply) = server.handle_query(&query).await {
                    let _ = socket.send_to(&reply, from).await;
                }
            });
        }
    }

    async fn serve_tcp(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, from) = listener.accept().await?;
            debug!(%from, "DNS TCP connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_tcp(stream).await {
                    debug!(error = %e, "DNS TCP exchange failed");
                }
            });
        }
    }

    async fn handle_tcp(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        if let Some(reply) = self.handle_query(&query).await {
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&reply).await?;
        }
        Ok(())
    }

    /// Answer a single raw query
    ///
    /// Returns `None` for unparseable input; malformed packets are
    /// dropped rather than answered.
    pub async fn handle_query(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let msg = Message::from_vec(raw).ok()?;
        let query = msg.queries().first()?.clone();
        let name = extract_name(&query.name().to_utf8(), query.query_type());
        debug!(name = %name, qtype = %query.query_type(), "DNS query");

        let ips = match self.resolve(&name).await {
            Ok(ips) => ips,
            Err(e) => {
                warn!(error = %e, "DNS lookup failed");
                return reply_to(&msg, &query, &[]);
            }
        };

        if ips.is_empty() {
            return self.forward(raw).await;
        }
        reply_to(&msg, &query, &ips)
    }

    /// Overlay lookup: nodes by name first, then peers
    async fn resolve(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        for node in self.registry.nodes().await? {
            if node.name == name {
                if let Ok(ip) = node.gateway_ip.parse() {
                    return Ok(vec![ip]);
                }
            }
        }

        let mut ips = Vec::new();
        for peer in self.registry.peers().await? {
            if peer.name == name && !peer.peer_ip.is_empty() {
                if let Ok(ip) = peer.peer_ip.parse() {
                    ips.push(ip);
                }
            }
        }
        Ok(ips)
    }

    /// Relay the raw query to the upstream and hand back its reply bytes
    /// untouched
    async fn forward(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
        socket.send_to(raw, self.upstream).await.ok()?;

        let mut buf = vec![0u8; 4096];
        let len = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .ok()?
            .ok()?;
        buf.truncate(len);
        Some(buf)
    }
}

fn reply_to(msg: &Message, query: &Query, ips: &[Ipv4Addr]) -> Option<Vec<u8>> {
    let mut response = Message::new();
    response
        .set_id(msg.id())
        .set_message_type(MessageType::Response)
        .set_op_code(msg.op_code())
        .set_recursion_desired(msg.recursion_desired())
        .set_recursion_available(true)
        .add_query(query.clone());

    for ip in ips {
        response.add_answer(Record::from_rdata(
            query.name().clone(),
            ANSWER_TTL,
            RData::A(A::from(*ip)),
        ));
    }
    response.to_vec().ok()
}

/// Extract the bare name from a query
///
/// Strips the final dot; SRV queries additionally drop the two leading
/// service/protocol labels.
fn extract_name(query: &str, query_type: RecordType) -> String {
    let trimmed = query.strip_suffix('.').unwrap_or(query);
    if query_type == RecordType::SRV {
        let labels: Vec<&str> = trimmed.split('.').collect();
        if labels.len() > 2 {
            return labels[2..].join(".");
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use trellis_proto::{KeyPair, Node, Peer};
    use trellis_store::{KvStore, MemoryStore, StoreHandle};
    use trust_dns_proto::rr::Name;

    fn registry() -> Arc<Registry> {
        let local: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        Arc::new(Registry::new(local.clone(), StoreHandle::new(local)))
    }

    fn server(registry: Arc<Registry>, upstream: SocketAddr) -> Arc<DnsServer> {
        DnsServer::new(registry, "127.0.0.1:0".parse().unwrap(), upstream)
    }

    fn key_pair() -> KeyPair {
        KeyPair {
            private_key: "priv".to_string(),
            public_key: "pub".to_string(),
        }
    }

    async fn put_node(registry: &Registry, name: &str, gateway: &str) {
        registry
            .put_node(
                &Node {
                    id: name.to_string(),
                    name: name.to_string(),
                    addr: "127.0.0.1:9000".to_string(),
                    key_pair: key_pair(),
                    endpoint_ip: "203.0.113.10".to_string(),
                    endpoint_port: 51820,
                    gateway_ip: gateway.to_string(),
                    interface_name: "trellis0".to_string(),
                    updated_at: 0,
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
    }

    async fn put_peer(registry: &Registry, id: &str, name: &str, ip: &str) {
        registry
            .put_peer(&Peer {
                id: id.to_string(),
                name: name.to_string(),
                key_pair: key_pair(),
                allowed_ips: vec![format!("{ip}/32")],
                endpoint: String::new(),
                peer_ip: String::new(),
            })
            .await
            .unwrap();
        registry
            .local()
            .hset("trellis:peerips", id, ip)
            .await
            .unwrap();
    }

    fn query_bytes(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(42).set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        msg.to_vec().unwrap()
    }

    fn answers(reply: &[u8]) -> Vec<Ipv4Addr> {
        Message::from_vec(reply)
            .unwrap()
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::A(a)) => Some(Ipv4Addr::from(*a)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_extract_name() {
        assert_eq!(extract_name("alpha.", RecordType::A), "alpha");
        assert_eq!(
            extract_name("_http._tcp.alpha.", RecordType::SRV),
            "alpha"
        );
        assert_eq!(extract_name("alpha.example.", RecordType::A), "alpha.example");
    }

    #[tokio::test]
    async fn test_node_name_resolves_to_gateway() {
        let registry = registry();
        put_node(&registry, "alpha", "10.10.0.1").await;
        let server = server(registry, "127.0.0.1:1".parse().unwrap());

        let reply = server
            .handle_query(&query_bytes("alpha.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(answers(&reply), vec!["10.10.0.1".parse::<Ipv4Addr>().unwrap()]);

        let msg = Message::from_vec(&reply).unwrap();
        assert_eq!(msg.id(), 42);
        assert_eq!(msg.answers()[0].ttl(), ANSWER_TTL);
    }

    #[tokio::test]
    async fn test_node_wins_over_peer() {
        let registry = registry();
        put_node(&registry, "alpha", "10.10.0.1").await;
        put_peer(&registry, "p1", "alpha", "10.51.0.2").await;
        let server = server(registry, "127.0.0.1:1".parse().unwrap());

        let reply = server
            .handle_query(&query_bytes("alpha.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(answers(&reply), vec!["10.10.0.1".parse::<Ipv4Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_peer_name_can_answer_multiple() {
        let registry = registry();
        put_peer(&registry, "p1", "shared", "10.51.0.2").await;
        put_peer(&registry, "p2", "shared", "10.51.0.3").await;
        let server = server(registry, "127.0.0.1:1".parse().unwrap());

        let reply = server
            .handle_query(&query_bytes("shared.", RecordType::A))
            .await
            .unwrap();
        let mut ips = answers(&reply);
        ips.sort();
        assert_eq!(
            ips,
            vec![
                "10.51.0.2".parse::<Ipv4Addr>().unwrap(),
                "10.51.0.3".parse::<Ipv4Addr>().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_name_relays_upstream_bytes() {
        // stub upstream echoing a fixed response
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let canned = b"\x00\x2a\x81\x80upstream-reply".to_vec();
        let canned_clone = canned.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (_, from) = upstream.recv_from(&mut buf).await.unwrap();
            upstream.send_to(&canned_clone, from).await.unwrap();
        });

        let server = server(registry(), upstream_addr);
        let reply = server
            .handle_query(&query_bytes("elsewhere.example.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(reply, canned);
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let server = server(registry(), "127.0.0.1:1".parse().unwrap());
        assert!(server.handle_query(b"\x01\x02not-dns").await.is_none());
    }
}
