//! Outbound pipeline.
//!
//! Drains the bounded frame queue in enqueue order, records in-flight
//! PUBLISH frames, writes each frame to the transport and resets the
//! keep-alive ticker.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::keepalive::Ticker;
use crate::pending::PacketMap;
use crate::protocol::v4::{self, Packet};
use crate::session::Stop;
use crate::types::QoS;

pub(crate) struct Outbound<W> {
    pub(crate) rx: mpsc::Receiver<Packet>,
    pub(crate) writer: W,
    pub(crate) in_flight: Arc<PacketMap<Packet>>,
    pub(crate) ticker: Ticker,
    pub(crate) stop: Arc<Stop>,
}

impl<W: AsyncWrite + Unpin> Outbound<W> {
    pub(crate) async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                frame = self.rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = self.stop.wait() => break,
            };

            // A PUBLISH with an identifier stays in the in-flight table
            // until its terminating ack arrives; re-sends replace the
            // entry so it always reflects the latest sent form.
            if let Packet::Publish(publish) = &frame {
                if publish.qos != QoS::AtMostOnce {
                    self.in_flight.update(publish.pkid, frame.clone());
                }
            }

            trace!("writing {:?}", frame.packet_type());
            if let Err(e) = v4::write_packet(&mut self.writer, &frame).await {
                warn!("outbound write failed: {}", e);
                self.stop.set();
                break;
            }

            self.ticker.reset();
        }

        // Half-close so the broker observes EOF and closes, which in turn
        // terminates the inbound pipeline.
        let _ = self.writer.shutdown().await;
        trace!("outbound pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use tokio::io::DuplexStream;

    use crate::protocol::v4::Publish;
    use crate::protocol::MAX_PACKET_SIZE;

    fn start_outbound() -> (
        mpsc::Sender<Packet>,
        DuplexStream,
        Arc<PacketMap<Packet>>,
        tokio::task::JoinHandle<()>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(8);
        let in_flight = Arc::new(PacketMap::new());
        let handle = tokio::spawn(
            Outbound {
                rx,
                writer: client,
                in_flight: Arc::clone(&in_flight),
                ticker: Ticker::disabled(),
                stop: Arc::new(Stop::default()),
            }
            .run(),
        );
        (tx, server, in_flight, handle)
    }

    #[tokio::test]
    async fn test_publish_with_identifier_is_recorded_in_flight() {
        let (tx, mut server, in_flight, handle) = start_outbound();

        let publish = Publish {
            topic: "t".to_string(),
            payload: Bytes::from_static(&[1]),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            pkid: 7,
        };
        tx.send(Packet::Publish(publish)).await.unwrap();

        let mut buf = BytesMut::new();
        let frame = v4::read_packet(&mut server, &mut buf, MAX_PACKET_SIZE)
            .await
            .unwrap();
        match frame {
            Packet::Publish(p) => assert_eq!(p.pkid, 7),
            other => panic!("expected Publish, got {other:?}"),
        }
        assert!(matches!(
            in_flight.snapshot().as_slice(),
            [(7, Packet::Publish(_))]
        ));

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_qos0_and_control_frames_skip_bookkeeping() {
        let (tx, mut server, in_flight, handle) = start_outbound();

        tx.send(v4::create_publish("t", b"x", false)).await.unwrap();
        tx.send(Packet::PingReq).await.unwrap();

        let mut buf = BytesMut::new();
        let first = v4::read_packet(&mut server, &mut buf, MAX_PACKET_SIZE)
            .await
            .unwrap();
        assert!(matches!(first, Packet::Publish(_)));
        let second = v4::read_packet(&mut server, &mut buf, MAX_PACKET_SIZE)
            .await
            .unwrap();
        assert!(matches!(second, Packet::PingReq));

        assert!(in_flight.is_empty());

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_preserve_enqueue_order() {
        let (tx, mut server, _in_flight, handle) = start_outbound();

        for i in 0..5u8 {
            tx.send(v4::create_publish("t", &[i], false)).await.unwrap();
        }

        let mut buf = BytesMut::new();
        for i in 0..5u8 {
            let frame = v4::read_packet(&mut server, &mut buf, MAX_PACKET_SIZE)
                .await
                .unwrap();
            match frame {
                Packet::Publish(p) => assert_eq!(p.payload.as_ref(), &[i]),
                other => panic!("expected Publish, got {other:?}"),
            }
        }

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_signal_terminates_pipeline() {
        let (client, _server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel::<Packet>(8);
        let stop = Arc::new(Stop::default());
        let handle = tokio::spawn(
            Outbound {
                rx,
                writer: client,
                in_flight: Arc::new(PacketMap::new()),
                ticker: Ticker::disabled(),
                stop: Arc::clone(&stop),
            }
            .run(),
        );

        stop.set();
        handle.await.unwrap();
        drop(tx);
    }
}
