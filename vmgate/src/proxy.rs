//! SOCKS5 gate between a guest and the outside world.
//!
//! One [`ProxyServer`] runs per running machine, on its own thread with a
//! current-thread runtime. Accepts, handshakes and byte relays all share that
//! loop. Decisions that may need a reverse lookup or a human go to the
//! [`DecisionPool`]; rule hits are answered inline. A client gets
//! [`HANDSHAKE_TIMEOUT`] to deliver its greeting and request.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use vmgate_protocol::socks5::{
    self, Address, Command, ReplyCode, RequestHeader, Socks5Error, Target, ATYP_DOMAIN,
    METHOD_NO_ACCEPTABLE,
};

use crate::firewall::{DecisionPool, Destination, FirewallEngine};
use crate::resolver::Resolver;

/// Time allowed from accept until the CONNECT request is read.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens outbound connections for allowed requests.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Plain TCP connect with a timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }
}

/// Map an outbound connect failure to the closest SOCKS5 reply.
pub fn reply_for_connect_error(e: &io::Error) -> ReplyCode {
    match e.raw_os_error() {
        Some(libc::ECONNREFUSED) => return ReplyCode::ConnectionRefused,
        Some(libc::ENETUNREACH) => return ReplyCode::NetworkUnreachable,
        Some(libc::EHOSTUNREACH) => return ReplyCode::HostUnreachable,
        Some(libc::ETIMEDOUT) => return ReplyCode::HostUnreachable,
        _ => {}
    }
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
        _ => ReplyCode::GeneralFailure,
    }
}

pub struct ProxyServer {
    engine: Arc<FirewallEngine>,
    pool: DecisionPool,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    handshake_timeout: Duration,
}

/// Handle to a running proxy. Dropping it signals the proxy to stop without
/// waiting for it; [`ProxyHandle::shutdown`] also waits.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ProxyServer {
    pub fn new(
        engine: Arc<FirewallEngine>,
        pool: DecisionPool,
        resolver: Arc<dyn Resolver>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            engine,
            pool,
            resolver,
            dialer,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Bind `addr` and start serving on a dedicated thread. Bind errors are
    /// returned here, before any thread is started.
    pub fn start(self, addr: SocketAddr) -> Result<ProxyHandle> {
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("binding SOCKS5 proxy on {}", addr))?;
        listener
            .set_nonblocking(true)
            .context("setting proxy listener non-blocking")?;
        let local_addr = listener.local_addr().context("reading proxy address")?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building proxy runtime")?;
        let (tx, rx) = oneshot::channel();
        let machine = self.engine.machine().to_string();
        let server = Arc::new(self);

        let thread = std::thread::Builder::new()
            .name(format!("vmgate-proxy-{}", machine))
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => server.serve(listener, rx).await,
                        Err(e) => warn!(machine = %machine, error = %e, "proxy listener unusable"),
                    }
                });
            })
            .context("spawning proxy thread")?;

        info!(%local_addr, "SOCKS5 proxy listening");
        Ok(ProxyHandle {
            local_addr,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let span = info_span!("socks", machine = %self.engine.machine(), %peer);
                        connections.spawn(async move { server.handle(stream).await }.instrument(span));
                    }
                    Err(e) => {
                        // EMFILE and friends: back off instead of spinning.
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        debug!(live = connections.len(), "proxy stopping, aborting connections");
        connections.shutdown().await;
    }

    async fn handle(&self, mut client: TcpStream) {
        let request = tokio::time::timeout(self.handshake_timeout, read_request(&mut client));
        let target = match request.await {
            Ok(Ok(Some(target))) => target,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                trace!(error = %e, "connection dropped during handshake");
                return;
            }
            Err(_) => {
                debug!(timeout = ?self.handshake_timeout, "handshake timed out");
                return;
            }
        };
        match self.open(&mut client, target).await {
            Ok(Some((dest, upstream))) => {
                let (sent, received) = relay(client, upstream).await;
                debug!(%dest, sent, received, "connection closed");
            }
            Ok(None) => {}
            Err(e) => trace!(error = %e, "connection dropped before relaying"),
        }
    }

    /// Decide on `target` and connect it. Returns the outbound stream when
    /// allowed and connected; `None` when a refusal was already sent.
    async fn open(
        &self,
        client: &mut TcpStream,
        target: Target,
    ) -> io::Result<Option<(Destination, TcpStream)>> {
        let (ip, hostname) = match &target.addr {
            Address::Ip(ip) => (*ip, None),
            Address::Domain(name) => match self.resolve(name, target.port).await {
                Some(ip) => (ip, Some(name.clone())),
                None => {
                    send_reply(client, ReplyCode::HostUnreachable, None).await?;
                    return Ok(None);
                }
            },
        };
        let dest = Destination::new(ip, target.port);

        let decision = match self.engine.cached(&dest, hostname.as_deref()).await {
            Some(decision) => decision,
            None => {
                self.pool
                    .decide(self.engine.clone(), dest, hostname.clone())
                    .await
            }
        };
        if !decision.is_allowed() {
            info!(%dest, hostname = hostname.as_deref().unwrap_or("-"), origin = ?decision.origin, "denied");
            send_reply(client, ReplyCode::NotAllowed, None).await?;
            return Ok(None);
        }

        let upstream = match self.dialer.dial(dest.socket_addr()).await {
            Ok(stream) => stream,
            Err(e) => {
                let code = reply_for_connect_error(&e);
                debug!(%dest, error = %e, reply = ?code, "outbound connect failed");
                send_reply(client, code, None).await?;
                return Ok(None);
            }
        };
        let bound = upstream.local_addr().ok();
        send_reply(client, ReplyCode::Succeeded, bound).await?;
        debug!(%dest, origin = ?decision.origin, "relaying");
        Ok(Some((dest, upstream)))
    }

    async fn resolve(&self, name: &str, port: u16) -> Option<IpAddr> {
        match self.resolver.resolve(name, port).await {
            // Prefer IPv4: slirp-style guests rarely have a v6 route out.
            Ok(ips) => ips
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| ips.first())
                .copied(),
            Err(e) => {
                debug!(host = name, error = %e, "name resolution failed");
                None
            }
        }
    }
}

/// Read the greeting and the request. `None` when the client was
/// refused (a reply, if any, is already sent).
async fn read_request(client: &mut TcpStream) -> io::Result<Option<Target>> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let nmethods = match socks5::parse_greeting(greeting) {
        Ok(n) => n,
        Err(e) => {
            debug!(error = %e, "rejecting handshake");
            return Ok(None);
        }
    };
    let mut methods = vec![0u8; nmethods];
    client.read_exact(&mut methods).await?;
    match socks5::select_method(&methods) {
        Ok(method) => client.write_all(&[socks5::VERSION, method]).await?,
        Err(e) => {
            debug!(error = %e, "rejecting handshake");
            client
                .write_all(&[socks5::VERSION, METHOD_NO_ACCEPTABLE])
                .await?;
            return Ok(None);
        }
    }

    let mut head = [0u8; 4];
    client.read_exact(&mut head).await?;
    let header = match RequestHeader::parse(head) {
        Ok(h) => h,
        Err(e) => {
            debug!(error = %e, "malformed request");
            return Ok(None);
        }
    };

    let body_len = match header.fixed_address_len() {
        Some(len) => len,
        None if header.atyp == ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            len[0] as usize
        }
        None => {
            debug!(atyp = header.atyp, "unsupported address type");
            send_reply(client, ReplyCode::AddressTypeNotSupported, None).await?;
            return Ok(None);
        }
    };
    let mut body = vec![0u8; body_len];
    client.read_exact(&mut body).await?;
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let target = match socks5::decode_address(header.atyp, &body) {
        Ok(addr) => Target {
            addr,
            port: u16::from_be_bytes(port),
        },
        Err(Socks5Error::UnsupportedAddressType(_)) => {
            send_reply(client, ReplyCode::AddressTypeNotSupported, None).await?;
            return Ok(None);
        }
        Err(e) => {
            debug!(error = %e, "malformed address");
            send_reply(client, ReplyCode::GeneralFailure, None).await?;
            return Ok(None);
        }
    };

    if header.command != Command::Connect {
        debug!(command = ?header.command, %target, "unsupported command");
        send_reply(client, ReplyCode::CommandNotSupported, None).await?;
        return Ok(None);
    }
    Ok(Some(target))
}

async fn send_reply(
    client: &mut TcpStream,
    code: ReplyCode,
    bound: Option<SocketAddr>,
) -> io::Result<()> {
    client.write_all(&socks5::encode_reply(code, bound)).await
}

/// Copy both directions until one of them ends, then drop both sockets.
async fn relay(client: TcpStream, upstream: TcpStream) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let outbound = async {
        let n = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        n.unwrap_or(0)
    };
    let inbound = async {
        let n = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        n.unwrap_or(0)
    };

    tokio::select! {
        sent = outbound => (sent, 0),
        received = inbound => (0, received),
    }
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting, abort live connections and wait for the thread
    /// without blocking the caller's runtime.
    pub async fn shutdown(mut self) {
        self.signal();
        let Some(thread) = self.thread.take() else {
            return;
        };
        let addr = self.local_addr;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => debug!(%addr, "proxy stopped"),
            _ => warn!(%addr, "proxy thread panicked"),
        }
    }

    fn signal(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.signal();
    }
}
