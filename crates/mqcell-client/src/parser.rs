//! Incremental packet parser and dispatcher.
//!
//! Incoming bytes arrive as arbitrarily fragmented transport buffers. A
//! byte-at-a-time state machine reassembles them into discrete control
//! packets and dispatches each packet as soon as it completes. A packet
//! body lying entirely within one linear fragment is dispatched in place,
//! without copying into the scratch buffer.

use log::{debug, trace, warn};

use mqcell_core::packet::{self, PacketType, QoS};

use crate::client::{MqttClient, SessionState};
use crate::events::{ConnectStatus, Event, EventHandler, RequestError};
use crate::transport::{RecvBuf, Transport};

/// Parser states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ParserState {
    /// Waiting for a fixed-header byte.
    #[default]
    Init,
    /// Accumulating the variable-length remaining-length field.
    CalcRemLen,
    /// Copying body bytes into the scratch buffer.
    ReadRem,
}

/// Working state of the incoming-packet parser.
#[derive(Debug, Default)]
pub(crate) struct Parser {
    pub state: ParserState,
    /// Fixed-header byte of the packet being assembled.
    pub hdr_byte: u8,
    /// Accumulated remaining-length value.
    pub rem_len: usize,
    /// VLI group counter (7 bits per group).
    pub rem_len_mult: u8,
    /// Body byte counter; counts every byte even when the scratch buffer
    /// is too small to hold it.
    pub pos: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl<T: Transport, A> MqttClient<T, A> {
    /// Feed one receive buffer through the parser state machine.
    pub(crate) fn parse_incoming<H: EventHandler<A>>(
        &mut self,
        buf: &dyn RecvBuf,
        handler: &mut H,
    ) {
        let mut offset = 0;
        while let Some(segment) = buf.linear(offset) {
            if segment.is_empty() {
                break;
            }
            offset += segment.len();

            let mut idx = 0;
            while idx < segment.len() {
                let ch = segment[idx];
                match self.parser.state {
                    ParserState::Init => {
                        trace!("first byte of packet: {:#04x}", ch);
                        self.parser.hdr_byte = ch;
                        self.parser.rem_len = 0;
                        self.parser.rem_len_mult = 0;
                        self.parser.pos = 0;
                        self.parser.state = ParserState::CalcRemLen;
                    }
                    ParserState::CalcRemLen => {
                        // Length is LSB first, 7 bits per byte, at most 4 bytes
                        self.parser.rem_len |=
                            usize::from(ch & 0x7F) << (7 * u32::from(self.parser.rem_len_mult));
                        self.parser.rem_len_mult += 1;

                        if ch & 0x80 == 0 {
                            trace!("remaining length: {} bytes", self.parser.rem_len);
                            let rem_len = self.parser.rem_len;
                            if rem_len == 0 {
                                self.dispatch_packet(&[], handler);
                                self.parser.state = ParserState::Init;
                            } else if segment.len() - idx > rem_len {
                                // Whole body inside this fragment: dispatch
                                // in place, skip past it
                                let body = &segment[idx + 1..idx + 1 + rem_len];
                                self.dispatch_packet(body, handler);
                                self.parser.state = ParserState::Init;
                                idx += rem_len;
                            } else {
                                self.parser.state = ParserState::ReadRem;
                            }
                        } else if self.parser.rem_len_mult == 4 {
                            warn!("malformed remaining length, resetting parser");
                            self.parser.state = ParserState::Init;
                        }
                    }
                    ParserState::ReadRem => {
                        if self.parser.pos < self.rx.len() {
                            self.rx[self.parser.pos] = ch;
                        }
                        self.parser.pos += 1;

                        if self.parser.pos == self.parser.rem_len {
                            if self.parser.pos <= self.rx.len() {
                                // Detach the scratch buffer so the dispatch
                                // can borrow the body while acks are written
                                let scratch = std::mem::take(&mut self.rx);
                                self.dispatch_packet(&scratch[..self.parser.rem_len], handler);
                                self.rx = scratch;
                            } else {
                                warn!(
                                    "{} byte packet exceeds the {} byte receive buffer, discarding",
                                    self.parser.rem_len,
                                    self.rx.len()
                                );
                            }
                            self.parser.state = ParserState::Init;
                        }
                    }
                }
                idx += 1;
            }
        }
    }

    /// Interpret one fully assembled packet body.
    fn dispatch_packet<H: EventHandler<A>>(&mut self, body: &[u8], handler: &mut H) {
        let hdr = self.parser.hdr_byte;
        let Ok(packet_type) = packet::packet_type(hdr) else {
            debug!("ignoring unknown packet type in header {:#04x}", hdr);
            return;
        };
        debug!("processing {:?} packet", packet_type);

        match packet_type {
            PacketType::Connack => self.on_connack(body, handler),
            PacketType::Publish => self.on_publish(hdr, body, handler),
            PacketType::Pingresp => handler.on_event(Event::KeepAlive),
            PacketType::Puback
            | PacketType::Pubrec
            | PacketType::Pubrel
            | PacketType::Pubcomp
            | PacketType::Suback
            | PacketType::Unsuback => self.on_ack(packet_type, body, handler),
            _ => trace!("{:?} ignored", packet_type),
        }
    }

    fn on_connack<H: EventHandler<A>>(&mut self, body: &[u8], handler: &mut H) {
        let Some(&code) = body.get(1) else {
            warn!("protocol violation: truncated CONNACK");
            return;
        };
        if self.state != SessionState::Connecting {
            warn!("protocol violation: CONNACK while already connected");
            return;
        }

        let status = ConnectStatus::from_code(code);
        if status.is_accepted() {
            self.state = SessionState::Connected;
        }
        debug!("CONNACK received with status {:?}", status);
        handler.on_event(Event::Connect { status });
    }

    fn on_publish<H: EventHandler<A>>(&mut self, hdr: u8, body: &[u8], handler: &mut H) {
        let Ok(qos) = packet::publish_qos(hdr) else {
            warn!("protocol violation: PUBLISH with reserved QoS");
            return;
        };
        let dup = packet::publish_dup(hdr);
        let retain = packet::publish_retain(hdr);

        if body.len() < 2 {
            warn!("protocol violation: truncated PUBLISH");
            return;
        }
        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        let mut data_at = 2 + topic_len;
        if body.len() < data_at {
            warn!("protocol violation: PUBLISH shorter than its topic");
            return;
        }
        let topic = &body[2..data_at];

        // Packet id is only present when QoS > 0
        let packet_id = if qos > QoS::AtMostOnce {
            let Some(id_bytes) = body.get(data_at..data_at + 2) else {
                warn!("protocol violation: PUBLISH missing packet id");
                return;
            };
            data_at += 2;
            u16::from_be_bytes([id_bytes[0], id_bytes[1]])
        } else {
            0
        };
        let payload = &body[data_at..];

        trace!(
            "publish received on topic {}, qos {:?}, packet id {}, {} payload bytes",
            String::from_utf8_lossy(topic),
            qos,
            packet_id,
            payload.len()
        );

        // QoS > 0 must be answered, with PUBACK or PUBREC depending on level
        match qos {
            QoS::AtLeastOnce => self.write_ack(PacketType::Puback, packet_id),
            QoS::ExactlyOnce => self.write_ack(PacketType::Pubrec, packet_id),
            QoS::AtMostOnce => {}
        }

        handler.on_event(Event::PublishRecv {
            topic,
            payload,
            dup,
            qos,
            retain,
        });
    }

    fn on_ack<H: EventHandler<A>>(
        &mut self,
        packet_type: PacketType,
        body: &[u8],
        handler: &mut H,
    ) {
        let Some(id_bytes) = body.get(..2) else {
            warn!("protocol violation: truncated {:?}", packet_type);
            return;
        };
        let packet_id = u16::from_be_bytes([id_bytes[0], id_bytes[1]]);

        match packet_type {
            PacketType::Pubrec => self.write_ack(PacketType::Pubrel, packet_id),
            PacketType::Pubrel => self.write_ack(PacketType::Pubcomp, packet_id),
            PacketType::Suback | PacketType::Unsuback => {
                let Some(request) = self.requests.take_pending(packet_id) else {
                    warn!(
                        "protocol violation: {:?} without a pending request",
                        packet_type
                    );
                    return;
                };
                // SUBACK: a return code below 3 means granted. UNSUBACK
                // carries no code byte and always counts as success.
                let res = match body.get(2) {
                    Some(&code) if code >= 3 => Err(RequestError::Rejected),
                    _ => Ok(()),
                };
                handler.on_event(if packet_type == PacketType::Suback {
                    Event::Subscribe {
                        arg: request.arg,
                        res,
                    }
                } else {
                    Event::Unsubscribe {
                        arg: request.arg,
                        res,
                    }
                });
            }
            PacketType::Puback | PacketType::Pubcomp => {
                let Some(request) = self.requests.take_pending(packet_id) else {
                    warn!(
                        "protocol violation: {:?} without a pending request",
                        packet_type
                    );
                    return;
                };
                handler.on_event(Event::Publish {
                    arg: request.arg,
                    res: Ok(()),
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SegmentedBuf;

    #[derive(Default)]
    struct NullTransport {
        sent: Vec<Vec<u8>>,
    }

    impl Transport for NullTransport {
        fn connect(&mut self, _host: &str, _port: u16) -> std::io::Result<()> {
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Seen {
        PublishRecv {
            topic: Vec<u8>,
            payload: Vec<u8>,
            dup: bool,
            qos: QoS,
            retain: bool,
        },
        KeepAlive,
    }

    #[derive(Default)]
    struct Collector(Vec<Seen>);

    impl EventHandler<u32> for Collector {
        fn on_event(&mut self, event: Event<'_, u32>) {
            match event {
                Event::PublishRecv {
                    topic,
                    payload,
                    dup,
                    qos,
                    retain,
                } => self.0.push(Seen::PublishRecv {
                    topic: topic.to_vec(),
                    payload: payload.to_vec(),
                    dup,
                    qos,
                    retain,
                }),
                Event::KeepAlive => self.0.push(Seen::KeepAlive),
                _ => {}
            }
        }
    }

    fn client_with_rx(rx_cap: usize) -> MqttClient<NullTransport, u32> {
        let mut client = MqttClient::new(NullTransport::default(), 256, rx_cap);
        client.state = SessionState::Connected;
        client
    }

    fn feed(client: &mut MqttClient<NullTransport, u32>, handler: &mut Collector, bytes: &[u8]) {
        client.parse_incoming(&bytes, handler);
    }

    // PUBLISH "ab" -> "xyz", QoS 0
    const PUBLISH_QOS0: &[u8] = &[0x30, 0x07, 0x00, 0x02, b'a', b'b', b'x', b'y', b'z'];

    fn expected_publish() -> Seen {
        Seen::PublishRecv {
            topic: b"ab".to_vec(),
            payload: b"xyz".to_vec(),
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    #[test]
    fn test_whole_packet_single_fragment() {
        let mut client = client_with_rx(64);
        let mut handler = Collector::default();
        feed(&mut client, &mut handler, PUBLISH_QOS0);
        assert_eq!(handler.0, vec![expected_publish()]);
    }

    #[test]
    fn test_byte_by_byte_matches_single_fragment() {
        let mut client = client_with_rx(64);
        let mut handler = Collector::default();
        for &byte in PUBLISH_QOS0 {
            feed(&mut client, &mut handler, &[byte]);
        }
        assert_eq!(handler.0, vec![expected_publish()]);
    }

    #[test]
    fn test_every_split_point_matches_single_fragment() {
        for split in 1..PUBLISH_QOS0.len() {
            let mut client = client_with_rx(64);
            let mut handler = Collector::default();

            let mut buf = SegmentedBuf::new();
            buf.push(PUBLISH_QOS0[..split].to_vec());
            buf.push(PUBLISH_QOS0[split..].to_vec());
            client.parse_incoming(&buf, &mut handler);

            assert_eq!(handler.0, vec![expected_publish()], "split at {}", split);
        }
    }

    #[test]
    fn test_coalesced_packets() {
        let mut client = client_with_rx(64);
        let mut handler = Collector::default();

        let mut bytes = PUBLISH_QOS0.to_vec();
        bytes.extend_from_slice(&[0xD0, 0x00]); // PINGRESP
        bytes.extend_from_slice(PUBLISH_QOS0);
        feed(&mut client, &mut handler, &bytes);

        assert_eq!(
            handler.0,
            vec![expected_publish(), Seen::KeepAlive, expected_publish()]
        );
    }

    #[test]
    fn test_split_inside_multi_byte_remaining_length() {
        // PUBLISH with a 130-byte body forces a two-byte length encoding
        let topic = [0x00, 0x02, b'a', b'b'];
        let payload = vec![0x55u8; 126];
        let mut packet = vec![0x30, 0x82, 0x01];
        packet.extend_from_slice(&topic);
        packet.extend_from_slice(&payload);

        // Split between the two length bytes
        let mut client = client_with_rx(256);
        let mut handler = Collector::default();
        let mut buf = SegmentedBuf::new();
        buf.push(packet[..2].to_vec());
        buf.push(packet[2..].to_vec());
        client.parse_incoming(&buf, &mut handler);

        assert_eq!(
            handler.0,
            vec![Seen::PublishRecv {
                topic: b"ab".to_vec(),
                payload,
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
            }]
        );
    }

    #[test]
    fn test_oversize_packet_discarded_and_resyncs() {
        let mut client = client_with_rx(4);
        let mut handler = Collector::default();

        // 7-byte body cannot fit the 4-byte scratch buffer; force the
        // scratch path by splitting the packet
        let mut buf = SegmentedBuf::new();
        buf.push(PUBLISH_QOS0[..3].to_vec());
        buf.push(PUBLISH_QOS0[3..].to_vec());
        client.parse_incoming(&buf, &mut handler);
        assert!(handler.0.is_empty());

        // The parser is back in sync for the next packet
        feed(&mut client, &mut handler, &[0xD0, 0x00]);
        assert_eq!(handler.0, vec![Seen::KeepAlive]);
    }

    #[test]
    fn test_zero_copy_path_skips_scratch_buffer() {
        // Scratch buffer is far too small, but a packet contained in one
        // fragment never touches it
        let mut client = client_with_rx(2);
        let mut handler = Collector::default();
        feed(&mut client, &mut handler, PUBLISH_QOS0);
        assert_eq!(handler.0, vec![expected_publish()]);
    }

    #[test]
    fn test_qos1_publish_is_acknowledged() {
        let mut client = client_with_rx(64);
        let mut handler = Collector::default();

        // PUBLISH "t" QoS 1, packet id 7, payload "hi"
        feed(
            &mut client,
            &mut handler,
            &[0x32, 0x07, 0x00, 0x01, b't', 0x00, 0x07, b'h', b'i'],
        );

        assert_eq!(
            handler.0,
            vec![Seen::PublishRecv {
                topic: b"t".to_vec(),
                payload: b"hi".to_vec(),
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
            }]
        );
        assert_eq!(client.transport_mut().sent[0], [0x40, 0x02, 0x00, 0x07]);
    }

    #[test]
    fn test_truncated_body_is_ignored() {
        let mut client = client_with_rx(64);
        let mut handler = Collector::default();

        // PUBLISH whose topic length field points past the body
        feed(&mut client, &mut handler, &[0x30, 0x03, 0x00, 0x09, b'a']);
        assert!(handler.0.is_empty());

        // Parser resyncs on the next packet
        feed(&mut client, &mut handler, PUBLISH_QOS0);
        assert_eq!(handler.0, vec![expected_publish()]);
    }

    #[test]
    fn test_stray_ack_is_ignored() {
        let mut client = client_with_rx(64);
        let mut handler = Collector::default();
        feed(&mut client, &mut handler, &[0x40, 0x02, 0x00, 0x01]);
        assert!(handler.0.is_empty());
        assert!(client.is_connected());
    }
}
