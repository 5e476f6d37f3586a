/// RTP endpoint for one dialog
/// Reference: RFC 3550 (RTP), RFC 2833 (telephone-event)
///
/// One session per dialog, strictly nested inside the dialog lifetime.
/// The socket is polled, never awaited: the bridge tick owns the cadence.

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use rand::Rng;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, trace, warn};

use super::g711::G711Codec;
use crate::config::DTMF_DIGITS;

/// Static payload types from the RTP/AVP profile
pub const PT_PCMU: u8 = 0;
pub const PT_PCMA: u8 = 8;
/// Default telephone-event payload type; may be re-keyed by the remote SDP
pub const PT_EVENT: u8 = 101;

const RTP_VERSION: u8 = 2;
const RTP_HEADER_LEN: usize = 12;
const RTP_PACKET_MAX_SIZE: usize = 1440;

pub struct RtpSession {
    socket: tokio::net::UdpSocket,
    remote: SocketAddr,
    codec: G711Codec,
    /// Negotiated telephone-event payload type
    event_pt: u8,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    dtmf: VecDeque<char>,
}

impl RtpSession {
    /// Bind the local RTP port and aim the session at the remote endpoint
    /// taken from the peer's SDP.
    pub fn bind(
        local_ip: IpAddr,
        local_port: u16,
        remote: SocketAddr,
        codec: G711Codec,
        event_pt: u8,
    ) -> Result<Self> {
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(local_ip, local_port))
            .context(format!("Failed to bind RTP socket on port {}", local_port))?;
        std_socket
            .set_nonblocking(true)
            .context("Failed to set RTP socket non-blocking")?;
        let socket = tokio::net::UdpSocket::from_std(std_socket)
            .context("Failed to register RTP socket")?;

        let mut rng = rand::thread_rng();
        debug!(
            "RTP session {} <-> {} using {}",
            local_port,
            remote,
            codec.name()
        );

        Ok(Self {
            socket,
            remote,
            codec,
            event_pt,
            sequence: rng.gen_range(1..100),
            timestamp: rng.gen_range(1..10000),
            ssrc: rng.gen_range(1000..65530),
            dtmf: VecDeque::new(),
        })
    }

    /// Pull one datagram if present. Audio payloads come back as unsigned
    /// 8-bit PCM for the modem side; telephone-event packets feed the DTMF
    /// queue and yield no audio.
    pub fn read_audio(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; RTP_PACKET_MAX_SIZE];
        let len = match self.socket.try_recv(&mut buf) {
            Ok(len) => len,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                trace!("RTP receive error: {}", e);
                return None;
            }
        };
        if len < RTP_HEADER_LEN {
            return None;
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            debug!("RTP version {} not compatible", version);
            return None;
        }
        let csrc_count = (buf[0] & 0x0F) as usize;
        let marker = buf[1] & 0x80 != 0;
        let pt = buf[1] & 0x7F;

        let payload_start = RTP_HEADER_LEN + csrc_count * 4;
        if len <= payload_start {
            return None;
        }
        let payload = &buf[payload_start..len];

        if pt == self.codec.payload_type() {
            return Some(self.codec.decode_to_unsigned(payload));
        }

        if pt == self.event_pt || G711Codec::from_payload_type(pt).is_none() {
            // Non-audio payload: a telephone-event packet carries the event
            // id in its first byte; only marker packets count so refreshes
            // do not repeat the digit.
            if marker {
                if let Some(digit) = DTMF_DIGITS.chars().nth(payload[0] as usize) {
                    debug!("DTMF {} received from RTP peer", digit);
                    self.dtmf.push_back(digit);
                } else {
                    debug!("telephone-event id {} out of range", payload[0]);
                }
            }
            return None;
        }

        warn!("RTP payload type {} not negotiated, packet dropped", pt);
        None
    }

    /// Push one frame of unsigned 8-bit PCM toward the peer.
    pub fn write_audio(&mut self, frame: &[u8]) {
        if frame.is_empty() || frame.len() > RTP_PACKET_MAX_SIZE - RTP_HEADER_LEN {
            return;
        }
        let payload = self.codec.encode_from_unsigned(frame);

        let mut packet = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        packet.put_u8(0x80); // V=2, P=0, X=0, CC=0
        packet.put_u8(self.codec.payload_type()); // M=0
        packet.put_u16(self.sequence);
        packet.put_u32(self.timestamp);
        packet.put_u32(self.ssrc);
        packet.put_slice(&payload);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(payload.len() as u32);

        if let Err(e) = self.socket.try_send_to(&packet, self.remote) {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                trace!("RTP send error: {}", e);
            }
        }
    }

    /// Emit one RFC 2833 telephone-event packet for the digit. A single
    /// marker packet with a fixed duration interoperates with the usual
    /// PBXes; the timestamp advances by one per event.
    pub fn send_dtmf(&mut self, digit: char) {
        let event = match DTMF_DIGITS.find(digit) {
            Some(event) => event as u8,
            None => return,
        };

        let mut packet = BytesMut::with_capacity(RTP_HEADER_LEN + 4);
        packet.put_u8(0x80);
        packet.put_u8(0x80 | self.event_pt); // marker bit set
        packet.put_u16(self.sequence);
        packet.put_u32(self.timestamp);
        packet.put_u32(self.ssrc);
        packet.put_u8(event);
        packet.put_u8(0x0A); // E=0, R=0, volume 10
        packet.put_u8(0x00); // duration high
        packet.put_u8(0xA0); // duration low

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(1);

        if let Err(e) = self.socket.try_send_to(&packet, self.remote) {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                trace!("RTP send error: {}", e);
            }
        }
        debug!("DTMF {} sent to RTP peer", digit);
    }

    /// Pop one received DTMF digit, oldest first.
    pub fn read_dtmf(&mut self) -> Option<char> {
        self.dtmf.pop_front()
    }

    /// Preload digits into the receive queue (used when the callee
    /// caller-ID doubles as a dial-out number).
    pub fn queue_dtmf(&mut self, digits: &str) {
        self.dtmf.extend(digits.chars());
    }

    #[cfg(test)]
    fn test_pair(codec: G711Codec) -> (Self, std::net::UdpSocket) {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();
        let session = Self::bind(
            "127.0.0.1".parse().unwrap(),
            0,
            peer.local_addr().unwrap(),
            codec,
            PT_EVENT,
        )
        .unwrap();
        (session, peer)
    }
}
