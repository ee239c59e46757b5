//! Inbound pipeline.
//!
//! Reads packets from the transport and dispatches on packet type and QoS:
//! delivers application messages in arrival order, drives both directions of
//! the QoS handshakes, completes pending request results and gates the
//! initial CONNACK. Packets a broker must never send are fatal.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::pending::{Ack, AckSender, PacketMap};
use crate::protocol::v4::{self, ConnAck, Packet, PubAck, PubComp, PubRec, PubRel, Publish};
use crate::session::Stop;
use crate::types::{Message, QoS};

pub(crate) struct Inbound<R> {
    pub(crate) reader: R,
    pub(crate) read_buf: BytesMut,
    pub(crate) max_packet_size: usize,
    /// Outbound frame queue, for acknowledgements this pipeline generates.
    pub(crate) queue: mpsc::Sender<Packet>,
    /// Delivered-message sink.
    pub(crate) sink: mpsc::Sender<Message>,
    pub(crate) in_flight: Arc<PacketMap<Packet>>,
    pub(crate) pending: Arc<PacketMap<AckSender>>,
    /// One-shot CONNACK slot; a second CONNACK is a protocol violation.
    pub(crate) connack: Option<oneshot::Sender<ConnAck>>,
    pub(crate) pong_pending: Arc<AtomicBool>,
    pub(crate) stop: Arc<Stop>,
    /// Inbound QoS 2 identifiers with PUBREC sent but PUBREL not yet seen.
    pub(crate) qos2_inbound: HashSet<u16>,
}

impl<R: AsyncRead + Unpin> Inbound<R> {
    pub(crate) async fn run(mut self) {
        if let Err(e) = self.read_loop().await {
            match e {
                Error::ConnectionClosed => debug!("connection closed by broker"),
                e => warn!("inbound pipeline failed: {}", e),
            }
        }

        self.stop.set();
        // Unblock every suspended send_receive caller. Dropping the sink
        // ends the message stream.
        for (_, slot) in self.pending.take_all() {
            let _ = slot.send(Ack::Cancelled);
        }
        trace!("inbound pipeline stopped");
    }

    async fn read_loop(&mut self) -> Result<()> {
        loop {
            let packet =
                v4::read_packet(&mut self.reader, &mut self.read_buf, self.max_packet_size).await?;
            trace!("received {:?}", packet.packet_type());
            self.dispatch(packet).await?;
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,

            // Terminating ack of an outbound QoS 1 publish.
            Packet::PubAck(PubAck { pkid }) => {
                self.in_flight.remove(pkid);
                self.complete(pkid, Ack::Empty);
                Ok(())
            }

            // First ack of an outbound QoS 2 publish: the exchange now
            // rides on PUBREL, which replaces the stored PUBLISH. The
            // caller stays suspended until PUBCOMP.
            Packet::PubRec(PubRec { pkid }) => {
                let rel = Packet::PubRel(PubRel { pkid });
                self.in_flight.update(pkid, rel.clone());
                self.enqueue(rel).await
            }

            // Broker releases an inbound QoS 2 publish.
            Packet::PubRel(PubRel { pkid }) => {
                self.qos2_inbound.remove(&pkid);
                self.enqueue(Packet::PubComp(PubComp { pkid })).await
            }

            // Terminating ack of an outbound QoS 2 publish.
            Packet::PubComp(PubComp { pkid }) => {
                self.in_flight.remove(pkid);
                self.complete(pkid, Ack::Empty);
                Ok(())
            }

            Packet::SubAck(suback) => {
                self.complete(suback.pkid, Ack::Granted(suback.return_codes));
                Ok(())
            }

            Packet::UnsubAck(unsuback) => {
                self.complete(unsuback.pkid, Ack::Empty);
                Ok(())
            }

            Packet::PingResp => {
                trace!("received PingResp");
                self.pong_pending.store(false, Ordering::SeqCst);
                Ok(())
            }

            Packet::ConnAck(connack) => match self.connack.take() {
                Some(slot) => {
                    let _ = slot.send(connack);
                    Ok(())
                }
                None => Err(Error::Protocol("duplicate CONNACK".to_string())),
            },

            // A broker never sends these to a client.
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq
            | Packet::Disconnect => Err(Error::Protocol(format!(
                "unexpected {:?} from broker",
                packet.packet_type()
            ))),
        }
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<()> {
        match publish.qos {
            QoS::AtMostOnce => self.deliver(publish).await,

            QoS::AtLeastOnce => {
                let pkid = self.require_pkid(&publish)?;
                self.deliver(publish).await?;
                self.enqueue(Packet::PubAck(PubAck { pkid })).await
            }

            QoS::ExactlyOnce => {
                let pkid = self.require_pkid(&publish)?;
                if self.qos2_inbound.contains(&pkid) {
                    // Retransmit of a publish we already delivered but the
                    // broker has not released yet. Ack again, deliver never.
                    trace!("duplicate QoS 2 publish pkid={}, suppressing redelivery", pkid);
                    self.enqueue(Packet::PubRec(PubRec { pkid })).await
                } else {
                    self.deliver(publish).await?;
                    self.enqueue(Packet::PubRec(PubRec { pkid })).await?;
                    self.qos2_inbound.insert(pkid);
                    Ok(())
                }
            }
        }
    }

    fn require_pkid(&self, publish: &Publish) -> Result<u16> {
        if publish.pkid == 0 {
            return Err(Error::Protocol(format!(
                "QoS {} PUBLISH without packet identifier",
                publish.qos as u8
            )));
        }
        Ok(publish.pkid)
    }

    async fn deliver(&self, publish: Publish) -> Result<()> {
        trace!("delivering message on {}", publish.topic);
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };
        self.sink
            .send(message)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn enqueue(&self, frame: Packet) -> Result<()> {
        self.queue
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    fn complete(&self, pkid: u16, ack: Ack) {
        if let Some(slot) = self.pending.remove(pkid) {
            let _ = slot.send(ack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::Empty;
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::protocol::v4::{SubAck, SubscribeReasonCode, UnsubAck};
    use crate::protocol::MAX_PACKET_SIZE;
    use crate::types::ConnectReturnCode;

    struct Harness {
        inbound: Inbound<Empty>,
        queue: mpsc::Receiver<Packet>,
        sink: mpsc::Receiver<Message>,
    }

    fn harness() -> Harness {
        let (queue_tx, queue_rx) = mpsc::channel(16);
        let (msg_tx, msg_rx) = mpsc::channel(16);
        Harness {
            inbound: Inbound {
                reader: tokio::io::empty(),
                read_buf: BytesMut::new(),
                max_packet_size: MAX_PACKET_SIZE,
                queue: queue_tx,
                sink: msg_tx,
                in_flight: Arc::new(PacketMap::new()),
                pending: Arc::new(PacketMap::new()),
                connack: None,
                pong_pending: Arc::new(AtomicBool::new(false)),
                stop: Arc::new(Stop::default()),
                qos2_inbound: HashSet::new(),
            },
            queue: queue_rx,
            sink: msg_rx,
        }
    }

    fn publish(qos: QoS, pkid: u16, payload: &'static [u8]) -> Publish {
        Publish {
            topic: "t".to_string(),
            payload: Bytes::from_static(payload),
            qos,
            retain: false,
            dup: false,
            pkid,
        }
    }

    fn register(h: &Harness, pkid: u16) -> oneshot::Receiver<Ack> {
        let (tx, rx) = oneshot::channel();
        h.inbound.pending.update(pkid, tx);
        rx
    }

    #[tokio::test]
    async fn test_qos0_publish_delivers_without_ack() {
        let mut h = harness();

        h.inbound
            .dispatch(Packet::Publish(publish(QoS::AtMostOnce, 0, b"m")))
            .await
            .unwrap();

        assert_eq!(h.sink.try_recv().unwrap().payload.as_ref(), b"m");
        assert!(matches!(h.queue.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_qos1_publish_delivers_then_acks() {
        let mut h = harness();

        h.inbound
            .dispatch(Packet::Publish(publish(QoS::AtLeastOnce, 5, b"m")))
            .await
            .unwrap();

        assert_eq!(h.sink.try_recv().unwrap().payload.as_ref(), b"m");
        assert!(matches!(
            h.queue.try_recv().unwrap(),
            Packet::PubAck(PubAck { pkid: 5 })
        ));
    }

    #[tokio::test]
    async fn test_qos1_publish_without_identifier_is_fatal() {
        let mut h = harness();

        let result = h
            .inbound
            .dispatch(Packet::Publish(publish(QoS::AtLeastOnce, 0, b"m")))
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_qos2_first_receipt_delivers_and_tracks() {
        let mut h = harness();

        h.inbound
            .dispatch(Packet::Publish(publish(QoS::ExactlyOnce, 9, b"m")))
            .await
            .unwrap();

        assert_eq!(h.sink.try_recv().unwrap().payload.as_ref(), b"m");
        assert!(matches!(
            h.queue.try_recv().unwrap(),
            Packet::PubRec(PubRec { pkid: 9 })
        ));
        assert!(h.inbound.qos2_inbound.contains(&9));
    }

    #[tokio::test]
    async fn test_qos2_retransmit_acks_without_redelivery() {
        let mut h = harness();

        h.inbound
            .dispatch(Packet::Publish(publish(QoS::ExactlyOnce, 9, b"m")))
            .await
            .unwrap();
        assert!(h.sink.try_recv().is_ok());

        h.inbound
            .dispatch(Packet::Publish(publish(QoS::ExactlyOnce, 9, b"m")))
            .await
            .unwrap();

        assert!(matches!(h.sink.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(
            h.queue.try_recv().unwrap(),
            Packet::PubRec(PubRec { pkid: 9 })
        ));
        assert!(matches!(
            h.queue.try_recv().unwrap(),
            Packet::PubRec(PubRec { pkid: 9 })
        ));
    }

    #[tokio::test]
    async fn test_pubrel_releases_inbound_qos2() {
        let mut h = harness();
        h.inbound.qos2_inbound.insert(9);

        h.inbound
            .dispatch(Packet::PubRel(PubRel { pkid: 9 }))
            .await
            .unwrap();

        assert!(!h.inbound.qos2_inbound.contains(&9));
        assert!(matches!(
            h.queue.try_recv().unwrap(),
            Packet::PubComp(PubComp { pkid: 9 })
        ));
    }

    #[tokio::test]
    async fn test_puback_completes_and_clears_in_flight() {
        let mut h = harness();
        h.inbound
            .in_flight
            .update(7, Packet::Publish(publish(QoS::AtLeastOnce, 7, b"m")));
        let mut rx = register(&h, 7);

        h.inbound
            .dispatch(Packet::PubAck(PubAck { pkid: 7 }))
            .await
            .unwrap();

        assert!(h.inbound.in_flight.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Ack::Empty);
    }

    #[tokio::test]
    async fn test_pubrec_converts_publish_to_pubrel() {
        let mut h = harness();
        h.inbound
            .in_flight
            .update(42, Packet::Publish(publish(QoS::ExactlyOnce, 42, b"m")));
        let mut rx = register(&h, 42);

        h.inbound
            .dispatch(Packet::PubRec(PubRec { pkid: 42 }))
            .await
            .unwrap();

        // The stored frame is now the PUBREL and the caller is still
        // suspended.
        assert!(matches!(
            h.inbound.in_flight.snapshot().as_slice(),
            [(42, Packet::PubRel(PubRel { pkid: 42 }))]
        ));
        assert!(matches!(
            h.queue.try_recv().unwrap(),
            Packet::PubRel(PubRel { pkid: 42 })
        ));
        assert!(rx.try_recv().is_err());

        h.inbound
            .dispatch(Packet::PubComp(PubComp { pkid: 42 }))
            .await
            .unwrap();

        assert!(h.inbound.in_flight.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Ack::Empty);
    }

    #[tokio::test]
    async fn test_completion_fires_at_most_once() {
        let mut h = harness();
        let mut rx = register(&h, 7);

        h.inbound
            .dispatch(Packet::PubComp(PubComp { pkid: 7 }))
            .await
            .unwrap();
        // A stray second terminating ack finds nothing to complete.
        h.inbound
            .dispatch(Packet::PubComp(PubComp { pkid: 7 }))
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), Ack::Empty);
    }

    #[tokio::test]
    async fn test_suback_carries_granted_qos() {
        let mut h = harness();
        let mut rx = register(&h, 3);

        let codes = vec![
            SubscribeReasonCode::Success(QoS::AtMostOnce),
            SubscribeReasonCode::Success(QoS::ExactlyOnce),
        ];
        h.inbound
            .dispatch(Packet::SubAck(SubAck {
                pkid: 3,
                return_codes: codes.clone(),
            }))
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), Ack::Granted(codes));
        // SUBSCRIBE never populates the in-flight table.
        assert!(h.inbound.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_unsuback_completes_empty() {
        let mut h = harness();
        let mut rx = register(&h, 4);

        h.inbound
            .dispatch(Packet::UnsubAck(UnsubAck { pkid: 4 }))
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), Ack::Empty);
    }

    #[tokio::test]
    async fn test_pingresp_clears_pong_pending() {
        let mut h = harness();
        h.inbound.pong_pending.store(true, Ordering::SeqCst);

        h.inbound.dispatch(Packet::PingResp).await.unwrap();

        assert!(!h.inbound.pong_pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connack_fills_slot_exactly_once() {
        let mut h = harness();
        let (tx, mut rx) = oneshot::channel();
        h.inbound.connack = Some(tx);

        let connack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        };
        h.inbound.dispatch(Packet::ConnAck(connack)).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().code, ConnectReturnCode::Accepted);

        let result = h.inbound.dispatch(Packet::ConnAck(connack)).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_server_illegal_packets_are_fatal() {
        let mut h = harness();

        for packet in [Packet::PingReq, Packet::Disconnect] {
            let result = h.inbound.dispatch(packet).await;
            assert!(matches!(result, Err(Error::Protocol(_))));
        }
    }
}
