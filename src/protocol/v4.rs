//! MQTT 3.1.1 (v4) protocol implementation.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::types::{ConnectFlags, ConnectReturnCode, FixedHeader, PacketType, QoS};

use super::codec::{parse_fixed_header, remaining_length_width, Reader, Writer};
use super::PROTOCOL_NAME;

/// Protocol level byte carried in CONNECT.
const PROTOCOL_LEVEL: u8 = 4;

/// MQTT 3.1.1 packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
}

/// Last Will and Testament.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
///
/// `pkid` is meaningful only when `qos` is above [`QoS::AtMostOnce`]; the
/// identifier is absent from the wire for QoS 0 and decoded as 0.
#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub pkid: u16,
}

/// PUBACK packet (QoS 1 publish acknowledgement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

/// PUBREC packet (QoS 2 publish received, part 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
}

/// PUBREL packet (QoS 2 publish release, part 2).
///
/// Encoded with fixed header flags `0b0010` as the standard requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

/// PUBCOMP packet (QoS 2 publish complete, part 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub pkid: u16,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// Subscribe filter.
#[derive(Debug, Clone)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

/// SUBACK packet.
#[derive(Debug, Clone)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
}

/// Subscribe reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    Failure,
}

impl SubscribeReasonCode {
    pub fn from_u8(value: u8) -> Self {
        match QoS::from_u8(value) {
            Some(qos) => SubscribeReasonCode::Success(qos),
            None => SubscribeReasonCode::Failure,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReasonCode::Success(qos) => qos as u8,
            SubscribeReasonCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

/// UNSUBACK packet.
#[derive(Debug, Clone, Copy)]
pub struct UnsubAck {
    pub pkid: u16,
}

// ============================================================================
// Packet parsing
// ============================================================================

/// Total frame size for a given body length.
fn framed_size(body_len: usize) -> usize {
    1 + remaining_length_width(body_len as u32) + body_len
}

impl Packet {
    /// Parse a packet from buffer, returning it and the frame length
    /// consumed.
    pub fn read(buf: &[u8], max_size: usize) -> Result<(Packet, usize)> {
        let header = parse_fixed_header(buf)?;
        let frame_len = header.header_length + header.remaining_length as usize;

        if frame_len > max_size {
            return Err(Error::PacketTooLarge {
                size: frame_len,
                max: max_size,
            });
        }
        if buf.len() < frame_len {
            return Err(Error::Incomplete {
                needed: frame_len - buf.len(),
            });
        }

        let body = &buf[header.header_length..frame_len];
        // The body slice is complete per the remaining length, so a short
        // body is a framing violation rather than a short read.
        let packet = Self::decode_body(&header, body).map_err(|e| match e {
            Error::Incomplete { .. } => Error::Protocol("truncated packet body".to_string()),
            e => e,
        })?;

        Ok((packet, frame_len))
    }

    fn decode_body(header: &FixedHeader, body: &[u8]) -> Result<Packet> {
        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(body)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(body)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, body)?),
            PacketType::PubAck => Packet::PubAck(PubAck { pkid: ack_pkid(body)? }),
            PacketType::PubRec => Packet::PubRec(PubRec { pkid: ack_pkid(body)? }),
            PacketType::PubRel => Packet::PubRel(PubRel { pkid: ack_pkid(body)? }),
            PacketType::PubComp => Packet::PubComp(PubComp { pkid: ack_pkid(body)? }),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(body)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(body)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(body)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck { pkid: ack_pkid(body)? }),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };
        Ok(packet)
    }

    /// Write packet to buffer.
    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => p.write(buf),
            Packet::Publish(p) => p.write(buf),
            Packet::PubAck(p) => write_ack(buf, PacketType::PubAck, 0, p.pkid),
            Packet::PubRec(p) => write_ack(buf, PacketType::PubRec, 0, p.pkid),
            Packet::PubRel(p) => write_ack(buf, PacketType::PubRel, 0x02, p.pkid),
            Packet::PubComp(p) => write_ack(buf, PacketType::PubComp, 0, p.pkid),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => p.write(buf),
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::UnsubAck(p) => write_ack(buf, PacketType::UnsubAck, 0, p.pkid),
            Packet::PingReq => write_bare(buf, PacketType::PingReq),
            Packet::PingResp => write_bare(buf, PacketType::PingResp),
            Packet::Disconnect => write_bare(buf, PacketType::Disconnect),
        }
    }

    /// Calculate packet size.
    pub fn size(&self) -> usize {
        match self {
            Packet::Connect(p) => p.size(),
            Packet::Publish(p) => p.size(),
            Packet::Subscribe(p) => p.size(),
            Packet::SubAck(p) => p.size(),
            Packet::Unsubscribe(p) => p.size(),
            Packet::ConnAck(_)
            | Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 4,
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 2,
        }
    }

    /// Control packet type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

fn ack_pkid(body: &[u8]) -> Result<u16> {
    Reader::new(body).u16()
}

fn write_ack(buf: &mut [u8], packet_type: PacketType, flags: u8, pkid: u16) -> Result<usize> {
    let mut w = Writer::new(buf);
    w.header(packet_type, flags, 2)?;
    w.u16(pkid)?;
    Ok(w.position())
}

fn write_bare(buf: &mut [u8], packet_type: PacketType) -> Result<usize> {
    let mut w = Writer::new(buf);
    w.header(packet_type, 0, 0)?;
    Ok(w.position())
}

// ============================================================================
// Individual packet implementations
// ============================================================================

impl Connect {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);

        if r.string()?.as_bytes() != PROTOCOL_NAME {
            return Err(Error::Protocol("invalid protocol name".to_string()));
        }
        let level = r.u8()?;
        if level != PROTOCOL_LEVEL {
            return Err(Error::InvalidProtocolVersion(level));
        }

        let flags = ConnectFlags::decode(r.u8()?)
            .ok_or_else(|| Error::Protocol("invalid connect flags".to_string()))?;
        let keep_alive = r.u16()?;
        let client_id = r.string()?.to_string();

        let will = if flags.will {
            Some(Will {
                topic: r.string()?.to_string(),
                payload: r.binary()?.to_vec(),
                qos: flags.will_qos,
                retain: flags.will_retain,
            })
        } else {
            None
        };
        let username = if flags.username {
            Some(r.string()?.to_string())
        } else {
            None
        };
        let password = if flags.password {
            Some(r.binary()?.to_vec())
        } else {
            None
        };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session: flags.clean_session,
            username,
            password,
            will,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let mut flags = ConnectFlags {
            clean_session: self.clean_session,
            username: self.username.is_some(),
            password: self.password.is_some(),
            ..Default::default()
        };
        if let Some(will) = &self.will {
            flags.will = true;
            flags.will_qos = will.qos;
            flags.will_retain = will.retain;
        }

        let mut w = Writer::new(buf);
        w.header(PacketType::Connect, 0, self.body_len() as u32)?;
        w.string("MQTT")?;
        w.u8(PROTOCOL_LEVEL)?;
        w.u8(flags.encode())?;
        w.u16(self.keep_alive)?;
        w.string(&self.client_id)?;
        if let Some(will) = &self.will {
            w.string(&will.topic)?;
            w.binary(&will.payload)?;
        }
        if let Some(username) = &self.username {
            w.string(username)?;
        }
        if let Some(password) = &self.password {
            w.binary(password)?;
        }
        Ok(w.position())
    }

    fn body_len(&self) -> usize {
        // Variable header is 10 bytes: name (6), level, flags, keep alive.
        let mut len = 10 + 2 + self.client_id.len();
        if let Some(will) = &self.will {
            len += 4 + will.topic.len() + will.payload.len();
        }
        if let Some(username) = &self.username {
            len += 2 + username.len();
        }
        if let Some(password) = &self.password {
            len += 2 + password.len();
        }
        len
    }

    pub fn size(&self) -> usize {
        framed_size(self.body_len())
    }
}

impl ConnAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let session_present = r.u8()? & 0x01 != 0;
        let code_byte = r.u8()?;
        let code = ConnectReturnCode::from_u8(code_byte)
            .ok_or_else(|| Error::Protocol(format!("invalid connack return code: {code_byte}")))?;

        Ok(ConnAck {
            session_present,
            code,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        w.header(PacketType::ConnAck, 0, 2)?;
        w.u8(self.session_present as u8)?;
        w.u8(self.code as u8)?;
        Ok(w.position())
    }
}

impl Publish {
    pub fn read(flags: u8, buf: &[u8]) -> Result<Self> {
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(Error::InvalidQoS(qos_bits))?;

        let mut r = Reader::new(buf);
        let topic = r.string()?.to_string();
        let pkid = if qos == QoS::AtMostOnce { 0 } else { r.u16()? };

        Ok(Publish {
            topic,
            payload: Bytes::copy_from_slice(r.rest()),
            qos,
            retain: flags & 0x01 != 0,
            dup: flags & 0x08 != 0,
            pkid,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let mut flags = ((self.qos as u8) << 1) | self.retain as u8;
        if self.dup {
            flags |= 0x08;
        }

        let mut w = Writer::new(buf);
        w.header(PacketType::Publish, flags, self.body_len() as u32)?;
        w.string(&self.topic)?;
        if self.qos != QoS::AtMostOnce {
            w.u16(self.pkid)?;
        }
        w.raw(&self.payload)?;
        Ok(w.position())
    }

    fn body_len(&self) -> usize {
        let id_len = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
        2 + self.topic.len() + id_len + self.payload.len()
    }

    pub fn size(&self) -> usize {
        framed_size(self.body_len())
    }
}

impl Subscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let pkid = r.u16()?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            let path = r.string()?.to_string();
            let byte = r.u8()?;
            let qos = QoS::from_u8(byte & 0x03).ok_or(Error::InvalidQoS(byte))?;
            filters.push(SubscribeFilter { path, qos });
        }

        Ok(Subscribe { pkid, filters })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        // Subscribe carries mandatory flags 0b0010.
        w.header(PacketType::Subscribe, 0x02, self.body_len() as u32)?;
        w.u16(self.pkid)?;
        for filter in &self.filters {
            w.string(&filter.path)?;
            w.u8(filter.qos as u8)?;
        }
        Ok(w.position())
    }

    fn body_len(&self) -> usize {
        2 + self.filters.iter().map(|f| 3 + f.path.len()).sum::<usize>()
    }

    pub fn size(&self) -> usize {
        framed_size(self.body_len())
    }
}

impl SubAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let pkid = r.u16()?;
        let return_codes = r
            .rest()
            .iter()
            .map(|&b| SubscribeReasonCode::from_u8(b))
            .collect();

        Ok(SubAck { pkid, return_codes })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        w.header(PacketType::SubAck, 0, (2 + self.return_codes.len()) as u32)?;
        w.u16(self.pkid)?;
        for code in &self.return_codes {
            w.u8(code.to_u8())?;
        }
        Ok(w.position())
    }

    pub fn size(&self) -> usize {
        framed_size(2 + self.return_codes.len())
    }
}

impl Unsubscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let pkid = r.u16()?;

        let mut topics = Vec::new();
        while !r.is_empty() {
            topics.push(r.string()?.to_string());
        }

        Ok(Unsubscribe { pkid, topics })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        // Unsubscribe carries mandatory flags 0b0010.
        w.header(PacketType::Unsubscribe, 0x02, self.body_len() as u32)?;
        w.u16(self.pkid)?;
        for topic in &self.topics {
            w.string(topic)?;
        }
        Ok(w.position())
    }

    fn body_len(&self) -> usize {
        2 + self.topics.iter().map(|t| 2 + t.len()).sum::<usize>()
    }

    pub fn size(&self) -> usize {
        framed_size(self.body_len())
    }
}

// ============================================================================
// Async packet IO
// ============================================================================

/// Read a single MQTT 3.1.1 packet from an async reader.
///
/// `buf` carries partial reads between calls; bytes beyond the returned
/// packet stay buffered for the next call.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        match Packet::read(buf, max_size) {
            Ok((packet, consumed)) => {
                buf.advance(consumed);
                return Ok(packet);
            }
            Err(Error::Incomplete { .. }) => {}
            Err(e) => return Err(e),
        }

        if reader.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Write a single MQTT 3.1.1 packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let mut buf = vec![0u8; packet.size()];
    let written = packet.write(&mut buf)?;
    writer.write_all(&buf[..written]).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Helper functions for creating packets
// ============================================================================

/// Create a CONNECT packet.
pub fn create_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&[u8]>,
    keep_alive: u16,
    clean_session: bool,
) -> Packet {
    Packet::Connect(Connect {
        client_id: client_id.to_string(),
        keep_alive,
        clean_session,
        username: username.map(|s| s.to_string()),
        password: password.map(|p| p.to_vec()),
        will: None,
    })
}

/// Create a PUBLISH packet (QoS 0).
pub fn create_publish(topic: &str, payload: &[u8], retain: bool) -> Packet {
    Packet::Publish(Publish {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
        qos: QoS::AtMostOnce,
        retain,
        dup: false,
        pkid: 0,
    })
}

/// Create a SUBSCRIBE packet.
pub fn create_subscribe(pkid: u16, filters: &[(&str, QoS)]) -> Packet {
    let filters = filters
        .iter()
        .map(|(path, qos)| SubscribeFilter {
            path: path.to_string(),
            qos: *qos,
        })
        .collect();

    Packet::Subscribe(Subscribe { pkid, filters })
}

/// Create an UNSUBSCRIBE packet.
pub fn create_unsubscribe(pkid: u16, topics: &[&str]) -> Packet {
    let topics = topics.iter().map(|t| t.to_string()).collect();
    Packet::Unsubscribe(Unsubscribe { pkid, topics })
}
