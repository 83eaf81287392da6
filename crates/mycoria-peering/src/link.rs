//! One live peering link.
//!
//! A link owns two tasks: a reader draining the byte stream and a writer
//! fed by two bounded queues, priority (100) and regular (1000). The writer
//! always drains priority first. Sends into a full queue are dropped; the
//! overlay is best-effort. A single network I/O error closes the link;
//! tolerable parse errors are counted and close it after 100 in a row.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mycoria_addr::RouterAddress;
use mycoria_frame::frame::{FlowFlags, Frame};
use mycoria_frame::FrameBuilder;
use mycoria_session::aead::AeadSession;
use mycoria_session::session::SessionManager;
use mycoria_session::signing::SigningSession;
use mycoria_switch::SwitchLabel;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::linkframe;
use crate::manager::LinkManager;
use crate::protocol::{self, Handshake, HandshakeConfig, HandshakeOutcome, PeeringMsg};
use crate::{PeeringError, Result};

/// Priority queue depth.
pub const PRIORITY_QUEUE_LEN: usize = 100;

/// Regular queue depth.
pub const REGULAR_QUEUE_LEN: usize = 1000;

/// Tolerable consecutive parse errors before the link closes.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 100;

/// Socket read deadline during the handshake; none afterwards.
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Socket write deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Rolling latency sample count.
const LATENCY_SAMPLES: usize = 10;

/// Rolling one-way-delay tracker with an address-class fallback.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: Vec<u16>,
    next: usize,
    fallback: u16,
}

impl LatencyTracker {
    /// Fallback by peer address class: private networks answer in a few
    /// milliseconds, global unicast in the order of a hundred, unknown
    /// peers in between.
    pub fn new(peer: Option<SocketAddr>) -> Self {
        let fallback = match peer {
            Some(SocketAddr::V4(addr)) => {
                let ip = addr.ip();
                if ip.is_private() || ip.is_link_local() || ip.is_loopback() {
                    5
                } else {
                    100
                }
            }
            Some(SocketAddr::V6(addr)) => {
                let ip = addr.ip();
                let first = ip.octets()[0];
                if ip.is_loopback() || first == 0xFE || first & 0xFE == 0xFC {
                    5
                } else {
                    100
                }
            }
            None => 50,
        };
        Self {
            samples: Vec::with_capacity(LATENCY_SAMPLES),
            next: 0,
            fallback,
        }
    }

    /// Record a measured one-way delay.
    pub fn record(&mut self, delay_ms: u16) {
        if self.samples.len() < LATENCY_SAMPLES {
            self.samples.push(delay_ms);
        } else {
            self.samples[self.next] = delay_ms;
            self.next = (self.next + 1) % LATENCY_SAMPLES;
        }
    }

    /// The rolling average, rounded to whole milliseconds, never zero.
    pub fn latency_ms(&self) -> u16 {
        if self.samples.is_empty() {
            return self.fallback.max(1);
        }
        let sum: u32 = self.samples.iter().map(|s| u32::from(*s)).sum();
        let avg = (sum + self.samples.len() as u32 / 2) / self.samples.len() as u32;
        (avg as u16).max(1)
    }
}

/// A live link to one peer.
pub struct Link {
    remote: RouterAddress,
    label: SwitchLabel,
    peer_addr: Option<SocketAddr>,
    client: bool,
    lite: bool,
    link_session: AeadSession,
    priority_tx: mpsc::Sender<Frame>,
    regular_tx: mpsc::Sender<Frame>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    closing: AtomicBool,
    flow: AtomicU8,
    peer_recv_rate: AtomicU8,
    latency: Mutex<LatencyTracker>,
    cancel: CancellationToken,
}

impl Link {
    /// Complete a handshake and start the reader and writer tasks over the
    /// stream. Registers the link with the manager.
    pub async fn establish<S>(
        mut stream: S,
        peer_addr: Option<SocketAddr>,
        config: HandshakeConfig,
        manager: Arc<LinkManager>,
    ) -> Result<Arc<Link>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client = config.client;
        let outcome = match run_handshake(&mut stream, config, manager.sessions(), manager.frames()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::debug!(%err, "peering handshake failed");
                return Err(err);
            }
        };

        let (priority_tx, priority_rx) = mpsc::channel(PRIORITY_QUEUE_LEN);
        let (regular_tx, regular_rx) = mpsc::channel(REGULAR_QUEUE_LEN);

        let remote = outcome.remote.clone();
        let link = manager.register_link(&remote, |label| {
            Arc::new(Link {
                label,
                peer_addr,
                client,
                lite: outcome.remote_lite,
                remote: outcome.remote,
                link_session: outcome.link_session,
                priority_tx,
                regular_tx,
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                flow: AtomicU8::new(FlowFlags::INCREASE.bits()),
                peer_recv_rate: AtomicU8::new(100),
                latency: Mutex::new(LatencyTracker::new(peer_addr)),
                cancel: CancellationToken::new(),
            })
        })?;

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(read_worker(read_half, link.clone(), manager.clone()));
        tokio::spawn(write_worker(write_half, link.clone(), manager, priority_rx, regular_rx));

        Ok(link)
    }

    /// The peer's address record.
    pub fn remote(&self) -> &RouterAddress {
        &self.remote
    }

    /// The peer's overlay IP.
    pub fn remote_ip(&self) -> std::net::Ipv6Addr {
        self.remote.ip
    }

    /// The switch label assigned to this link.
    pub fn label(&self) -> SwitchLabel {
        self.label
    }

    /// Whether this side dialed the connection.
    pub fn is_client(&self) -> bool {
        self.client
    }

    /// The peer asked for reduced background traffic.
    pub fn is_lite(&self) -> bool {
        self.lite
    }

    /// The transport-layer peer address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a frame for sending. Priority frames use the priority queue.
    /// Returns false when the queue is full and the frame was dropped.
    pub fn send(&self, frame: Frame) -> bool {
        if self.closing.load(Ordering::Relaxed) {
            return false;
        }
        let queue = if frame.message_type().is_priority() {
            &self.priority_tx
        } else {
            &self.regular_tx
        };
        match queue.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                tracing::trace!(remote = %self.remote.ip, "send queue full, frame dropped");
                false
            }
        }
    }

    /// Current flow-control indication, derived from the regular queue
    /// fill: 70 % asks for decrease, 30 % for hold, below that invites
    /// increase.
    pub fn flow_indicator(&self) -> FlowFlags {
        FlowFlags::from_bits(self.flow.load(Ordering::Relaxed))
    }

    fn update_flow(&self) -> FlowFlags {
        let max = self.regular_tx.max_capacity();
        let fill_pct = ((max - self.regular_tx.capacity()) * 100) / max.max(1);
        let flow = if fill_pct >= 70 {
            FlowFlags::DECREASE
        } else if fill_pct >= 30 {
            FlowFlags::HOLD
        } else {
            FlowFlags::INCREASE
        };
        self.flow.store(flow.bits(), Ordering::Relaxed);
        self.link_session
            .set_recv_rate((100 - fill_pct.min(100)) as u8);
        flow
    }

    /// The receive rate the peer last advertised, in percent.
    pub fn peer_recv_rate(&self) -> u8 {
        self.peer_recv_rate.load(Ordering::Relaxed)
    }

    /// Record a measured one-way delay.
    pub fn record_latency(&self, delay_ms: u16) {
        self.latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(delay_ms);
    }

    /// The rolling-average one-way delay.
    pub fn latency_ms(&self) -> u16 {
        self.latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latency_ms()
    }

    /// Bytes received over this link.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes sent over this link.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Whether the link is shutting down.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Close the link: cancels both workers; the workers deregister the
    /// link as they wind down.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::Relaxed) {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("remote", &self.remote.ip)
            .field("label", &self.label)
            .field("client", &self.client)
            .finish()
    }
}

/// Drive the peering handshake over a fresh stream.
///
/// Handshake records are plain `u16 len ‖ frame`; sealed link frames only
/// begin once both sides hold the link session.
pub async fn run_handshake<S>(
    stream: &mut S,
    config: HandshakeConfig,
    sessions: &SessionManager,
    frames: &FrameBuilder,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = config.local.clone();
    let client = config.client;
    let mut handshake = Handshake::new(config);

    // Both sides open with a request; the dialing side sends first. The
    // request is signed with a session against our own address since the
    // remote is still unknown.
    let bootstrap_signer = SigningSession::new(local.clone(), local.address().clone());
    let request = handshake.request();
    let frame = build_signed_msg(frames, &bootstrap_signer, &local, &request)?;
    write_handshake_record(stream, frame.as_bytes()).await?;

    let mut signing: Option<Arc<mycoria_session::Session>> = None;

    while !handshake.is_complete() {
        let record = read_handshake_record(stream).await?;
        let mut frame = Frame::from_bytes(record)?;
        frame.parse_payload()?;
        let msg = protocol::decode(frame.message_data()?)?;

        // Authenticate the frame: requests by their embedded identity,
        // later messages by the established session.
        if !msg.err.is_empty() {
            return Err(PeeringError::RemoteDeniedPeering(msg.err));
        }
        if let Some(address) = &msg.public_address {
            address
                .verify()
                .map_err(|e| PeeringError::HandshakeFailed(format!("remote address invalid: {e}")))?;
            frame.verify_with(address)?;
            signing = Some(sessions.get_or_create(address.clone()));
        } else if let Some(session) = &signing {
            frame.verify(session.signing())?;
        } else {
            return Err(PeeringError::HandshakeFailed(
                "unauthenticated handshake message".into(),
            ));
        }

        let reply = match handshake.handle(msg) {
            Ok(reply) => reply,
            Err(err) => {
                // One best-effort error frame, then the link dies.
                let denial = PeeringMsg::error(&err.to_string());
                if let Ok(frame) = build_signed_msg(frames, &bootstrap_signer, &local, &denial) {
                    let _ = write_handshake_record(stream, frame.as_bytes()).await;
                }
                return Err(err);
            }
        };

        if let Some(reply) = reply {
            let frame = match &signing {
                Some(session) => build_signed_msg(frames, session.signing(), &local, &reply)?,
                None => build_signed_msg(frames, &bootstrap_signer, &local, &reply)?,
            };
            write_handshake_record(stream, frame.as_bytes()).await?;
        }

        // The client finishes as soon as its ack is on the wire.
        if client && handshake.is_complete() {
            break;
        }
    }

    if let Some(remote) = handshake.remote() {
        sessions.get_or_create(remote.clone()).touch();
    }
    handshake.into_outcome()
}

/// Destination of handshake frames: the peer's overlay address is unknown
/// until its request arrives, so they address the all-routers group.
const HANDSHAKE_DST: std::net::Ipv6Addr = std::net::Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

fn build_signed_msg(
    frames: &FrameBuilder,
    signer: &SigningSession,
    local: &mycoria_addr::PrivateIdentity,
    msg: &PeeringMsg,
) -> Result<Frame> {
    let payload = protocol::encode(msg)?;
    let mut frame = frames.build(
        mycoria_frame::FrameOpts {
            // Signed at 0, sent at 1: the signature is TTL-independent.
            ttl: 0,
            flow: FlowFlags::HOLD,
            message_type: mycoria_frame::MessageType::RouterPing,
            src: local.ip(),
            dst: HANDSHAKE_DST,
        },
        &[],
        &payload,
        &[],
        true,
    );
    frame.sign(signer)?;
    frame.set_ttl(1);
    Ok(frame)
}

async fn write_handshake_record<S>(stream: &mut S, frame: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(frame.len())
        .map_err(|_| PeeringError::NetworkWriteError("handshake frame too large".into()))?;
    let write = async {
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(frame).await?;
        stream.flush().await
    };
    tokio::time::timeout(WRITE_TIMEOUT, write)
        .await
        .map_err(|_| PeeringError::NetworkWriteError("handshake write timed out".into()))?
        .map_err(|e| PeeringError::NetworkWriteError(e.to_string()))
}

async fn read_handshake_record<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let read = async {
        let mut len_bytes = [0u8; 2];
        stream.read_exact(&mut len_bytes).await?;
        let len = u16::from_be_bytes(len_bytes) as usize;
        let mut record = vec![0u8; len];
        stream.read_exact(&mut record).await?;
        Ok::<Vec<u8>, std::io::Error>(record)
    };
    tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, read)
        .await
        .map_err(|_| PeeringError::NetworkReadError("handshake read timed out".into()))?
        .map_err(|e| PeeringError::NetworkReadError(e.to_string()))
}

async fn read_worker<R>(mut stream: R, link: Arc<Link>, manager: Arc<LinkManager>)
where
    R: AsyncRead + Unpin,
{
    let mut consecutive_errors = 0u32;

    loop {
        let mut len_bytes = [0u8; 2];
        let read = tokio::select! {
            biased;
            () = link.cancel.cancelled() => break,
            read = stream.read_exact(&mut len_bytes) => read,
        };
        if let Err(err) = read {
            tracing::debug!(remote = %link.remote.ip, %err, "link read failed");
            break;
        }

        let total = u16::from_be_bytes(len_bytes) as usize;
        if total < linkframe::LINK_HEADER_SIZE + linkframe::TAG_SIZE {
            // A nonsense length means the stream framing is lost for good.
            tracing::debug!(remote = %link.remote.ip, total, "link record framing lost");
            break;
        }

        let mut record = vec![0u8; total];
        record[..2].copy_from_slice(&len_bytes);
        if let Err(err) = stream.read_exact(&mut record[2..]).await {
            tracing::debug!(remote = %link.remote.ip, %err, "link read failed");
            break;
        }
        link.bytes_in.fetch_add(total as u64, Ordering::Relaxed);
        if let Some(rate) = linkframe::peer_recv_rate(&record) {
            link.peer_recv_rate.store(rate.min(100), Ordering::Relaxed);
        }

        match linkframe::unseal(&link.link_session, &mut record)
            .and_then(|inner| Frame::from_bytes(inner).map_err(PeeringError::from))
        {
            Ok(frame) => {
                consecutive_errors = 0;
                manager.dispatch(&link, frame).await;
            }
            Err(err) => {
                consecutive_errors += 1;
                tracing::trace!(remote = %link.remote.ip, %err, consecutive_errors, "bad link record");
                if consecutive_errors > MAX_CONSECUTIVE_ERRORS {
                    tracing::debug!(remote = %link.remote.ip, "too many bad records, closing link");
                    break;
                }
            }
        }
    }

    link.close();
    manager.remove_link(&link);
}

async fn write_worker<W>(
    mut stream: W,
    link: Arc<Link>,
    manager: Arc<LinkManager>,
    mut priority_rx: mpsc::Receiver<Frame>,
    mut regular_rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        // Priority first, without waiting.
        let frame = match priority_rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(_) => {
                tokio::select! {
                    biased;
                    () = link.cancel.cancelled() => None,
                    frame = priority_rx.recv() => frame,
                    frame = regular_rx.recv() => frame,
                }
            }
        };
        let Some(frame) = frame else { break };

        link.update_flow();
        let record = match linkframe::seal(&link.link_session, frame.as_bytes()) {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(remote = %link.remote.ip, %err, "link seal failed");
                continue;
            }
        };
        manager.frames().recycle_frame(frame);

        let write = async {
            stream.write_all(&record).await?;
            stream.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {
                link.bytes_out.fetch_add(record.len() as u64, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                tracing::debug!(remote = %link.remote.ip, %err, "link write failed");
                break;
            }
            Err(_) => {
                tracing::debug!(remote = %link.remote.ip, "link write timed out");
                break;
            }
        }
    }

    link.close();
    manager.remove_link(&link);
}
