//! MQTT session engine: state machine, outbound API, transport event
//! dispatch.

use log::{debug, trace, warn};

use mqcell_core::packet::{self, PacketType, QoS};
use mqcell_core::varint;

use crate::buffer::TxBuffer;
use crate::error::{ClientError, Result};
use crate::events::{ConnectStatus, Event, EventHandler, RequestError};
use crate::options::SessionOptions;
use crate::parser::Parser;
use crate::requests::{RequestKind, RequestTable};
use crate::transport::{RecvBuf, Transport, TransportEvent};

/// Interval between transport poll ticks, in milliseconds. The keep-alive
/// arithmetic in the poll handler depends on ticks arriving at this rate.
pub const CONN_POLL_INTERVAL_MS: u32 = 500;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// MQTT 3.1.1 client session engine.
///
/// The engine owns a [`Transport`] and is driven entirely by transport
/// events: the host calls [`on_transport_event`](Self::on_transport_event)
/// for every connection event and receives session [`Event`]s back through
/// the supplied [`EventHandler`]. All outbound work is enqueued into a
/// bounded ring buffer and handed to the transport one contiguous block at
/// a time; nothing in the engine blocks.
///
/// `A` is the opaque per-request argument handed back with completion
/// events.
pub struct MqttClient<T: Transport, A = ()> {
    transport: T,
    pub(crate) state: SessionState,
    options: Option<SessionOptions>,
    /// Poll ticks since the last keep-alive reset.
    poll_ticks: u32,
    tx: TxBuffer,
    /// Scratch buffer for packet bodies that span receive fragments.
    pub(crate) rx: Box<[u8]>,
    pub(crate) parser: Parser,
    pub(crate) requests: RequestTable<A>,
    /// True from the moment a block is handed to the transport until the
    /// matching send-complete event arrives.
    is_sending: bool,
    /// Total bytes handed to the transport.
    written_total: u64,
    /// Total bytes the transport has confirmed sent.
    sent_total: u64,
    last_packet_id: u16,
    arg: Option<A>,
}

impl<T: Transport, A> MqttClient<T, A> {
    /// Create a new client over `transport` with the given transmit ring
    /// and receive scratch capacities in bytes.
    pub fn new(transport: T, tx_buf_capacity: usize, rx_buf_capacity: usize) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
            options: None,
            poll_ticks: 0,
            tx: TxBuffer::new(tx_buf_capacity),
            rx: vec![0u8; rx_buf_capacity].into_boxed_slice(),
            parser: Parser::new(),
            requests: RequestTable::new(),
            is_sending: false,
            written_total: 0,
            sent_total: 0,
            last_packet_id: 0,
            arg: None,
        }
    }

    /// Begin a session: open the transport and, once it reports
    /// [`TransportEvent::Connected`], send the MQTT CONNECT packet.
    pub fn connect(&mut self, host: &str, port: u16, options: SessionOptions) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(ClientError::InvalidState("already connected or connecting"));
        }
        self.options = Some(options);
        self.transport.connect(host, port)?;
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Close the session. Pending requests are completed with an error
    /// once the transport reports [`TransportEvent::Closed`].
    pub fn disconnect(&mut self) -> Result<()> {
        if matches!(
            self.state,
            SessionState::Disconnected | SessionState::Disconnecting
        ) {
            return Err(ClientError::NotConnected);
        }
        self.close();
        Ok(())
    }

    /// True once the broker has accepted the session.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Number of requests awaiting completion.
    pub fn pending_count(&self) -> usize {
        self.requests.pending_count()
    }

    /// Set the opaque client-level argument.
    pub fn set_arg(&mut self, arg: A) {
        self.arg = Some(arg);
    }

    /// Client-level argument, if set.
    pub fn arg(&self) -> Option<&A> {
        self.arg.as_ref()
    }

    /// The underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Subscribe to `topic` at the given maximum QoS.
    ///
    /// Returns the packet identifier awaiting SUBACK; completion is
    /// reported as [`Event::Subscribe`] carrying `arg`.
    pub fn subscribe(&mut self, topic: &str, qos: QoS, arg: A) -> Result<u16> {
        self.sub_unsub(topic, qos, arg, true)
    }

    /// Unsubscribe from `topic`.
    ///
    /// Returns the packet identifier awaiting UNSUBACK; completion is
    /// reported as [`Event::Unsubscribe`] carrying `arg`.
    pub fn unsubscribe(&mut self, topic: &str, arg: A) -> Result<u16> {
        self.sub_unsub(topic, QoS::AtMostOnce, arg, false)
    }

    fn sub_unsub(&mut self, topic: &str, qos: QoS, arg: A, sub: bool) -> Result<u16> {
        if topic.is_empty() || u16::try_from(topic.len()).is_err() {
            return Err(ClientError::InvalidTopic);
        }
        if self.state != SessionState::Connected {
            return Err(ClientError::NotConnected);
        }

        // topic length prefix + topic + packet id, plus the requested QoS
        // byte on subscribe
        let rem_len = 2 + topic.len() + 2 + usize::from(sub);
        self.check_tx_capacity(rem_len)?;

        let packet_id = self.next_packet_id();
        let kind = if sub {
            RequestKind::Subscribe
        } else {
            RequestKind::Unsubscribe
        };
        let idx = self
            .requests
            .create(kind, packet_id, arg)
            .ok_or(ClientError::RequestsFull)?;

        let packet_type = if sub {
            PacketType::Subscribe
        } else {
            PacketType::Unsubscribe
        };
        self.write_fixed_header(packet_type, false, QoS::AtMostOnce, false, rem_len);
        self.write_u16(packet_id);
        self.write_string(topic);
        if sub {
            self.write_u8(qos as u8);
        }

        self.requests.set_pending(idx);
        self.flush();
        Ok(packet_id)
    }

    /// Publish `payload` on `topic`.
    ///
    /// Returns the packet identifier for QoS 1/2, or `None` for QoS 0.
    /// Completion is reported as [`Event::Publish`] carrying `arg`: on ack
    /// arrival for QoS 1/2, or once the transport has confirmed the
    /// packet's bytes sent for QoS 0.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        arg: A,
    ) -> Result<Option<u16>> {
        if topic.is_empty() || u16::try_from(topic.len()).is_err() {
            return Err(ClientError::InvalidTopic);
        }
        if self.state != SessionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let rem_len =
            2 + topic.len() + payload.len() + if qos > QoS::AtMostOnce { 2 } else { 0 };
        let raw_len = self.check_tx_capacity(rem_len)?;

        let packet_id = if qos > QoS::AtMostOnce {
            self.next_packet_id()
        } else {
            0
        };
        let idx = self
            .requests
            .create(RequestKind::Publish, packet_id, arg)
            .ok_or(ClientError::RequestsFull)?;
        if let Some(request) = self.requests.get_mut(idx) {
            // QoS-0 completion sentinel: every byte of this packet
            // confirmed sent, not merely enqueued
            request.expected_sent_len = self.written_total + raw_len as u64;
        }

        self.write_fixed_header(PacketType::Publish, false, qos, retain, rem_len);
        self.write_string(topic);
        if packet_id != 0 {
            self.write_u16(packet_id);
        }
        self.write_data(payload);

        self.requests.set_pending(idx);
        self.flush();
        trace!("publish queued, qos {:?}, packet id {}", qos, packet_id);
        Ok((packet_id != 0).then_some(packet_id))
    }

    /// Transport event entry point.
    ///
    /// The host must deliver events serialized on one logical thread.
    /// Session events produced while handling the transport event are
    /// dispatched synchronously through `handler`.
    pub fn on_transport_event<H: EventHandler<A>>(
        &mut self,
        event: TransportEvent<'_>,
        handler: &mut H,
    ) {
        match event {
            TransportEvent::Connected => self.transport_connected(),
            TransportEvent::Received(buf) => self.transport_received(buf, handler),
            TransportEvent::Sent { len, ok } => self.transport_sent(len, ok, handler),
            TransportEvent::Poll => self.transport_poll(),
            TransportEvent::Closed { .. } => self.transport_closed(handler),
            TransportEvent::Error => self.transport_error(handler),
        }
    }

    /// Transport connected: queue the CONNECT packet.
    fn transport_connected(&mut self) {
        let Some(options) = self.options.take() else {
            warn!("transport connected with no session options");
            return;
        };

        let mut flags = packet::CONNECT_FLAG_CLEAN_SESSION;

        // Fixed part of the variable header: protocol name length + "MQTT"
        // + level + flags + keep-alive
        let mut rem_len = 10 + 2 + options.client_id.len();

        if let Some(will) = &options.will {
            flags |= packet::CONNECT_FLAG_WILL;
            flags |= (will.qos as u8) << packet::CONNECT_FLAG_WILL_QOS_SHIFT;
            rem_len += 2 + will.topic.len() + 2 + will.payload.len();
        }
        if let Some(username) = &options.username {
            flags |= packet::CONNECT_FLAG_USERNAME;
            rem_len += 2 + username.len();
        }
        if let Some(password) = &options.password {
            flags |= packet::CONNECT_FLAG_PASSWORD;
            rem_len += 2 + password.len();
        }

        if self.check_tx_capacity(rem_len).is_err() {
            warn!("not enough room in the transmit buffer for CONNECT");
            self.options = Some(options);
            return;
        }

        self.write_fixed_header(PacketType::Connect, false, QoS::AtMostOnce, false, rem_len);
        self.write_string("MQTT");
        self.write_u8(4); // protocol level
        self.write_u8(flags);
        self.write_u16(options.keep_alive);
        self.write_string(&options.client_id);
        if let Some(will) = &options.will {
            self.write_string(&will.topic);
            self.write_bytes_prefixed(&will.payload);
        }
        if let Some(username) = &options.username {
            self.write_string(username);
        }
        if let Some(password) = &options.password {
            self.write_bytes_prefixed(password);
        }
        self.options = Some(options);

        self.parser.reset();
        self.poll_ticks = 0;
        self.state = SessionState::Connecting;

        self.flush();
    }

    fn transport_received<H: EventHandler<A>>(&mut self, buf: &dyn RecvBuf, handler: &mut H) {
        self.parse_incoming(buf, handler);
    }

    /// Send-complete: advance the ring, retire satisfied QoS-0 publishes,
    /// and try to send more.
    fn transport_sent<H: EventHandler<A>>(&mut self, len: usize, ok: bool, handler: &mut H) {
        self.is_sending = false;
        self.sent_total += len as u64;
        self.poll_ticks = 0;

        if !ok {
            warn!("failed to send {} bytes, closing connection", len);
            self.close();
            return;
        }
        self.tx.skip(len);

        // QoS-0 publishes complete once their last byte is confirmed sent
        while let Some(request) = self.requests.take_completed_qos0(self.sent_total) {
            handler.on_event(Event::Publish {
                arg: request.arg,
                res: Ok(()),
            });
        }

        self.flush();
    }

    /// Periodic tick: run the keep-alive schedule.
    fn transport_poll(&mut self) {
        self.poll_ticks += 1;

        if self.state == SessionState::Disconnecting {
            return;
        }
        let keep_alive = self.options.as_ref().map_or(0, |o| o.keep_alive);
        if keep_alive == 0 {
            return;
        }

        // Ticks are in units of CONN_POLL_INTERVAL_MS, keep-alive in seconds
        if u64::from(self.poll_ticks) * u64::from(CONN_POLL_INTERVAL_MS)
            >= u64::from(keep_alive) * 1000
        {
            if self.check_tx_capacity(0).is_ok() {
                self.write_fixed_header(PacketType::Pingreq, false, QoS::AtMostOnce, false, 0);
                self.flush();
                self.poll_ticks = 0;
                debug!("PINGREQ queued");
            } else {
                warn!("no room in the transmit buffer for PINGREQ");
            }
        }
    }

    /// Connection closed: notify the user, fan an error out to every
    /// pending request, and reset all per-session state.
    fn transport_closed<H: EventHandler<A>>(&mut self, handler: &mut H) {
        let prior = self.state;
        self.state = SessionState::Disconnected;

        let is_accepted = matches!(
            prior,
            SessionState::Connected | SessionState::Disconnecting
        );
        handler.on_event(Event::Disconnect { is_accepted });

        while let Some(request) = self.requests.take_any_pending() {
            let res = Err(RequestError::ConnectionClosed);
            handler.on_event(match request.kind {
                RequestKind::Subscribe => Event::Subscribe {
                    arg: request.arg,
                    res,
                },
                RequestKind::Unsubscribe => Event::Unsubscribe {
                    arg: request.arg,
                    res,
                },
                RequestKind::Publish => Event::Publish {
                    arg: request.arg,
                    res,
                },
            });
        }
        self.requests.clear();

        self.is_sending = false;
        self.sent_total = 0;
        self.written_total = 0;
        self.parser.reset();
        self.tx.reset();
    }

    /// Connection could not be established.
    fn transport_error<H: EventHandler<A>>(&mut self, handler: &mut H) {
        self.state = SessionState::Disconnected;
        handler.on_event(Event::Connect {
            status: ConnectStatus::TcpFailed,
        });
    }

    /// Initiate a transport close unless one is already underway.
    fn close(&mut self) {
        if matches!(
            self.state,
            SessionState::Disconnected | SessionState::Disconnecting
        ) {
            return;
        }
        if self.transport.close().is_ok() {
            self.state = SessionState::Disconnecting;
        }
    }

    /// Hand the largest contiguous readable block to the transport, if no
    /// send is already in flight.
    fn flush(&mut self) {
        if self.is_sending {
            return;
        }
        let block = self.tx.linear_read();
        if block.is_empty() {
            // Drained: rewind so the next packet goes out in one piece
            self.tx.reset();
            return;
        }
        let len = block.len();
        match self.transport.send(block) {
            Ok(()) => {
                self.written_total += len as u64;
                self.is_sending = true;
            }
            Err(err) => warn!("transport send failed: {}", err),
        }
    }

    /// Total raw size of a packet with `rem_len` body bytes (header byte +
    /// encoded length + body), or an error when the transmit ring cannot
    /// take it in one piece.
    fn check_tx_capacity(&self, rem_len: usize) -> Result<usize> {
        let total = 1 + varint::encoded_len(rem_len as u32) + rem_len;
        if self.tx.free() >= total {
            Ok(total)
        } else {
            Err(ClientError::BufferFull)
        }
    }

    /// Queue a two-byte acknowledgement packet (PUBACK/PUBREC/PUBREL/
    /// PUBCOMP), dropping it silently when the ring has no room.
    pub(crate) fn write_ack(&mut self, packet_type: PacketType, packet_id: u16) {
        if self.check_tx_capacity(2).is_ok() {
            self.write_fixed_header(packet_type, false, QoS::AtMostOnce, false, 2);
            self.write_u16(packet_id);
            self.flush();
            trace!("{:?} response queued for packet id {}", packet_type, packet_id);
        } else {
            debug!("no room in the transmit buffer for {:?}", packet_type);
        }
    }

    fn write_fixed_header(
        &mut self,
        packet_type: PacketType,
        dup: bool,
        qos: QoS,
        retain: bool,
        rem_len: usize,
    ) {
        trace!("writing {:?} to the output buffer", packet_type);
        self.tx
            .write(&[packet::fixed_header_byte(packet_type, dup, qos, retain)]);
        let mut encoded = [0u8; 4];
        let n = varint::encode(rem_len as u32, &mut encoded);
        self.tx.write(&encoded[..n]);
    }

    fn write_u8(&mut self, value: u8) {
        self.tx.write(&[value]);
    }

    fn write_u16(&mut self, value: u16) {
        self.tx.write(&value.to_be_bytes());
    }

    fn write_data(&mut self, data: &[u8]) {
        self.tx.write(data);
    }

    fn write_string(&mut self, value: &str) {
        self.write_bytes_prefixed(value.as_bytes());
    }

    /// Length-prefixed byte field (16-bit big-endian count).
    fn write_bytes_prefixed(&mut self, data: &[u8]) {
        self.write_u16(data.len() as u16);
        self.tx.write(data);
    }

    /// Next packet identifier, wrapping 65535 to 1 and never yielding 0.
    fn next_packet_id(&mut self) -> u16 {
        self.last_packet_id = self.last_packet_id.wrapping_add(1);
        if self.last_packet_id == 0 {
            self.last_packet_id = 1;
        }
        self.last_packet_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn connected_client(tx_cap: usize) -> MqttClient<NullTransport, u32> {
        let mut client = MqttClient::new(NullTransport::default(), tx_cap, 256);
        client.state = SessionState::Connected;
        client
    }

    #[test]
    fn test_packet_id_wraps_past_zero() {
        let mut client = connected_client(256);
        client.last_packet_id = 65534;
        assert_eq!(client.next_packet_id(), 65535);
        assert_eq!(client.next_packet_id(), 1);
        assert_eq!(client.next_packet_id(), 2);
    }

    #[test]
    fn test_api_requires_connected_state() {
        let mut client: MqttClient<NullTransport, u32> =
            MqttClient::new(NullTransport::default(), 256, 256);
        assert!(matches!(
            client.subscribe("a", QoS::AtMostOnce, 0),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.publish("a", b"x", QoS::AtMostOnce, false, 0),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(client.disconnect(), Err(ClientError::NotConnected)));
    }

    #[test]
    fn test_empty_topic_rejected() {
        let mut client = connected_client(256);
        assert!(matches!(
            client.publish("", b"x", QoS::AtMostOnce, false, 0),
            Err(ClientError::InvalidTopic)
        ));
        assert!(matches!(
            client.subscribe("", QoS::AtMostOnce, 0),
            Err(ClientError::InvalidTopic)
        ));
    }

    #[test]
    fn test_oversized_packet_leaves_buffer_untouched() {
        let mut client = connected_client(16);
        let payload = [0u8; 64];
        assert!(matches!(
            client.publish("t", &payload, QoS::AtMostOnce, false, 0),
            Err(ClientError::BufferFull)
        ));
        assert!(client.tx.is_empty());
        assert!(client.requests.is_empty());
        assert!(client.transport.sent.is_empty());
    }

    #[test]
    fn test_registry_exhaustion_produces_no_wire_traffic() {
        let mut client = connected_client(4096);
        for i in 0..crate::requests::MAX_REQUESTS {
            client
                .publish("t", b"x", QoS::AtLeastOnce, false, i as u32)
                .unwrap();
        }
        let queued = client.tx.len() + client.transport.sent[0].len();
        assert!(matches!(
            client.publish("t", b"x", QoS::AtLeastOnce, false, 99),
            Err(ClientError::RequestsFull)
        ));
        assert_eq!(client.tx.len() + client.transport.sent[0].len(), queued);
    }

    #[test]
    fn test_subscribe_packet_layout() {
        let mut client = connected_client(256);
        let packet_id = client.subscribe("a/b", QoS::AtLeastOnce, 0).unwrap();
        assert_eq!(packet_id, 1);
        assert_eq!(
            client.transport.sent[0],
            [0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x01]
        );
    }

    #[test]
    fn test_unsubscribe_packet_layout() {
        let mut client = connected_client(256);
        let packet_id = client.unsubscribe("a/b", 0).unwrap();
        assert_eq!(
            client.transport.sent[0],
            [0xA2, 0x07, 0x00, packet_id as u8, 0x00, 0x03, b'a', b'/', b'b']
        );
    }

    #[test]
    fn test_single_send_in_flight() {
        struct Sink;

        impl EventHandler<u32> for Sink {
            fn on_event(&mut self, _event: Event<'_, u32>) {}
        }

        let mut client = connected_client(256);
        client.publish("t", b"one", QoS::AtMostOnce, false, 1).unwrap();
        client.publish("t", b"two", QoS::AtMostOnce, false, 2).unwrap();
        // The second publish queues behind the in-flight block
        assert_eq!(client.transport.sent.len(), 1);

        let len = client.transport.sent[0].len();
        client.on_transport_event(TransportEvent::Sent { len, ok: true }, &mut Sink);
        assert_eq!(client.transport.sent.len(), 2);
    }
}
