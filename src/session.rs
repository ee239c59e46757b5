//! MQTT session controller.
//!
//! Owns the two pipelines, the keep-alive ticker and the identifier tables,
//! and exposes the caller-facing operations: fire-and-forget `send`,
//! correlated `send_receive`, the delivered-message stream and teardown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::inbound::Inbound;
use crate::keepalive::Ticker;
use crate::outbound::Outbound;
use crate::pending::{Ack, AckSender, PacketMap};
use crate::protocol::v4::{
    Connect, Packet, Publish, Subscribe, SubscribeFilter, SubscribeReasonCode, Unsubscribe,
};
use crate::types::{ConnectReturnCode, Message, QoS};

/// Bounded capacity of the delivered-message sink.
const MESSAGE_SINK_CAPACITY: usize = 64;

/// Boolean stop signal shared by the pipelines.
///
/// Set once, never cleared. The notification path has a single waiter
/// (the outbound pipeline), so `notify_one` suffices and its stored
/// permit covers the set-before-wait race.
#[derive(Debug, Default)]
pub(crate) struct Stop {
    flag: AtomicBool,
    notify: Notify,
}

impl Stop {
    pub(crate) fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        while !self.flag.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
    }
}

/// An established MQTT 3.1.1 session.
///
/// Created by [`Session::connect`]; all operations take `&self` and may be
/// used concurrently. Dropping the session cancels it.
pub struct Session {
    queue: mpsc::Sender<Packet>,
    messages: Mutex<mpsc::Receiver<Message>>,
    pending: Arc<PacketMap<AckSender>>,
    in_flight: Arc<PacketMap<Packet>>,
    ticker: Ticker,
    stop: Arc<Stop>,
    next_pkid: AtomicU16,
    client_id: String,
    cancelled: AtomicBool,
    out_handle: JoinHandle<()>,
    in_handle: JoinHandle<()>,
    tick_handle: Option<JoinHandle<()>>,
}

impl Session {
    /// Connect to the broker at `config.addr` over plain TCP.
    pub async fn connect(config: SessionConfig) -> Result<Session> {
        let stream = TcpStream::connect(&config.addr).await?;
        Self::connect_with(config, stream).await
    }

    /// Establish a session over an already-connected byte stream, for
    /// example a TLS stream or an in-memory duplex.
    pub async fn connect_with<T>(config: SessionConfig, io: T) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        config.validate()?;
        debug!("connecting as {} (MQTT 3.1.1)", config.client_id);

        let (reader, writer) = tokio::io::split(io);

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_SINK_CAPACITY);
        let (connack_tx, connack_rx) = oneshot::channel();
        let in_flight = Arc::new(PacketMap::new());
        let pending: Arc<PacketMap<AckSender>> = Arc::new(PacketMap::new());
        let pong_pending = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Stop::default());

        let (ticker, tick_handle) = if config.keep_alive > 0 {
            let (ticker, handle) = Ticker::start(
                config.keep_alive,
                queue_tx.clone(),
                Arc::clone(&pong_pending),
                Arc::clone(&stop),
            );
            (ticker, Some(handle))
        } else {
            (Ticker::disabled(), None)
        };

        let out_handle = tokio::spawn(
            Outbound {
                rx: queue_rx,
                writer,
                in_flight: Arc::clone(&in_flight),
                ticker: ticker.clone(),
                stop: Arc::clone(&stop),
            }
            .run(),
        );

        let in_handle = tokio::spawn(
            Inbound {
                reader,
                read_buf: BytesMut::with_capacity(4096),
                max_packet_size: config.max_packet_size,
                queue: queue_tx.clone(),
                sink: msg_tx,
                in_flight: Arc::clone(&in_flight),
                pending: Arc::clone(&pending),
                connack: Some(connack_tx),
                pong_pending,
                stop: Arc::clone(&stop),
                qos2_inbound: HashSet::new(),
            }
            .run(),
        );

        let connect = Connect {
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive,
            clean_session: config.clean_session,
            username: config.username.clone(),
            password: config.password.clone(),
            will: config.will.clone(),
        };
        if queue_tx.send(Packet::Connect(connect)).await.is_err() {
            abort_tasks(&ticker, &tick_handle, &out_handle, &in_handle);
            return Err(Error::ConnectionClosed);
        }

        let connack = match connack_rx.await {
            Ok(connack) => connack,
            Err(_) => {
                abort_tasks(&ticker, &tick_handle, &out_handle, &in_handle);
                return Err(Error::ConnectionClosed);
            }
        };

        if connack.code != ConnectReturnCode::Accepted {
            warn!("connection refused: {}", connack.code);
            abort_tasks(&ticker, &tick_handle, &out_handle, &in_handle);
            return Err(Error::ConnectionRefused(connack.code));
        }
        debug!("connected, session_present={}", connack.session_present);

        Ok(Session {
            queue: queue_tx,
            messages: Mutex::new(msg_rx),
            pending,
            in_flight,
            ticker,
            stop,
            next_pkid: AtomicU16::new(1),
            client_id: config.client_id,
            cancelled: AtomicBool::new(false),
            out_handle,
            in_handle,
            tick_handle,
        })
    }

    /// Get the client ID.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Allocate the next packet identifier (never 0).
    pub fn next_packet_id(&self) -> u16 {
        loop {
            let pkid = self.next_pkid.fetch_add(1, Ordering::SeqCst);
            if pkid != 0 {
                return pkid;
            }
        }
    }

    /// Enqueue a frame for transmission.
    ///
    /// Returns once the frame is accepted by the bounded outbound queue; no
    /// acknowledgement is awaited. Any packet identifier inside the frame
    /// is the caller's responsibility.
    pub async fn send(&self, frame: Packet) -> Result<()> {
        self.queue
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Enqueue a frame and suspend until the broker answers the exchange
    /// registered under `pkid`.
    ///
    /// No deadline is imposed; if the broker never answers (for example a
    /// lost SUBACK), wrap the call in [`tokio::time::timeout`]. Registering
    /// a second exchange under an identifier that is still pending replaces
    /// the first registration.
    pub async fn send_receive(&self, frame: Packet, pkid: u16) -> Result<Ack> {
        // A registration after the inbound pipeline stopped can never be
        // completed in-band.
        if self.stop.is_set() {
            return Err(Error::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        if self.pending.insert(pkid, tx).is_some() {
            warn!("replacing pending result registration for pkid={}", pkid);
        }

        if self.queue.send(frame).await.is_err() {
            self.pending.remove(pkid);
            return Err(Error::ConnectionClosed);
        }

        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Receive the next message.
    ///
    /// Messages arrive in broker order. Returns
    /// [`Error::ConnectionClosed`] once the inbound pipeline has stopped
    /// and all buffered messages are drained.
    pub async fn recv(&self) -> Result<Message> {
        self.messages
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    /// Receive a message with timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Publish a message.
    ///
    /// QoS 0 returns once the frame is queued; QoS 1 and 2 suspend until
    /// the corresponding handshake completes.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        let publish = Publish {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos,
            retain,
            dup: false,
            pkid: if qos == QoS::AtMostOnce {
                0
            } else {
                self.next_packet_id()
            },
        };

        if qos == QoS::AtMostOnce {
            return self.send(Packet::Publish(publish)).await;
        }

        let pkid = publish.pkid;
        match self.send_receive(Packet::Publish(publish), pkid).await? {
            Ack::Cancelled => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Subscribe to topic filters, returning the granted QoS per filter.
    pub async fn subscribe(
        &self,
        filters: &[(&str, QoS)],
    ) -> Result<Vec<SubscribeReasonCode>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }

        let pkid = self.next_packet_id();
        debug!("subscribing to {:?} with pkid={}", filters, pkid);

        let subscribe = Subscribe {
            pkid,
            filters: filters
                .iter()
                .map(|(path, qos)| SubscribeFilter {
                    path: path.to_string(),
                    qos: *qos,
                })
                .collect(),
        };

        match self.send_receive(Packet::Subscribe(subscribe), pkid).await? {
            Ack::Granted(codes) => Ok(codes),
            Ack::Cancelled => Err(Error::Cancelled),
            Ack::Empty => Err(Error::Protocol(
                "SUBSCRIBE acknowledged without return codes".to_string(),
            )),
        }
    }

    /// Unsubscribe from topics.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }

        let pkid = self.next_packet_id();
        debug!("unsubscribing from {:?} with pkid={}", topics, pkid);

        let unsubscribe = Unsubscribe {
            pkid,
            topics: topics.iter().map(|t| t.to_string()).collect(),
        };

        match self
            .send_receive(Packet::Unsubscribe(unsubscribe), pkid)
            .await?
        {
            Ack::Cancelled => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Send a ping request.
    pub async fn ping(&self) -> Result<()> {
        self.send(Packet::PingReq).await
    }

    /// Send DISCONNECT and stop keep-alive pings.
    ///
    /// The session winds down once the broker closes the connection; call
    /// [`cancel`](Session::cancel) to tear down immediately instead.
    pub async fn disconnect(&self) -> Result<()> {
        debug!("disconnecting");
        self.ticker.cancel();
        self.send(Packet::Disconnect).await
    }

    /// PUBLISH and PUBREL frames sent but not yet terminally acknowledged.
    pub fn in_flight(&self) -> Vec<(u16, Packet)> {
        self.in_flight.snapshot()
    }

    /// Whether the pipelines have stopped (transport closed, fatal
    /// protocol error or cancellation).
    pub fn is_stopped(&self) -> bool {
        self.stop.is_set()
    }

    /// Tear the session down: keep-alive ticker first, then the outbound
    /// and inbound pipelines. Queued frames are not flushed. Every
    /// suspended [`send_receive`](Session::send_receive) caller resumes
    /// with [`Ack::Cancelled`]. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("cancelling session");

        self.ticker.cancel();
        if let Some(handle) = &self.tick_handle {
            handle.abort();
        }
        self.stop.set();
        self.out_handle.abort();
        self.in_handle.abort();

        for (_, slot) in self.pending.take_all() {
            let _ = slot.send(Ack::Cancelled);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn abort_tasks(
    ticker: &Ticker,
    tick_handle: &Option<JoinHandle<()>>,
    out_handle: &JoinHandle<()>,
    in_handle: &JoinHandle<()>,
) {
    ticker.cancel();
    if let Some(handle) = tick_handle {
        handle.abort();
    }
    out_handle.abort();
    in_handle.abort();
}
