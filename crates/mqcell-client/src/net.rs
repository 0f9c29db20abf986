//! mio-backed TCP transport and readiness driver.
//!
//! Bridges the sans-IO session engine to a non-blocking TCP socket. The
//! [`TcpDriver`] pumps mio readiness into engine transport events and
//! synthesizes the periodic poll tick the keep-alive machinery runs on.

use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::client::{MqttClient, CONN_POLL_INTERVAL_MS};
use crate::events::EventHandler;
use crate::transport::{Transport, TransportEvent};

const SOCKET: Token = Token(0);
const READ_CHUNK: usize = 4096;

/// Socket phase tracked by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Idle,
    Opening,
    Open,
    Closing,
}

/// Non-blocking TCP transport driven by [`TcpDriver`].
pub struct TcpTransport {
    registry: Registry,
    stream: Option<TcpStream>,
    /// Block handed over by the engine, not yet fully on the socket.
    staged: Vec<u8>,
    /// Bytes of the staged block already written.
    staged_sent: usize,
    state: SocketState,
}

impl TcpTransport {
    fn new(registry: Registry) -> Self {
        Self {
            registry,
            stream: None,
            staged: Vec::new(),
            staged_sent: 0,
            state: SocketState::Idle,
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "could not resolve address")
        })?;

        let mut stream = TcpStream::connect(addr)?;
        self.registry
            .register(&mut stream, SOCKET, Interest::READABLE | Interest::WRITABLE)?;
        self.stream = Some(stream);
        self.state = SocketState::Opening;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.staged.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "send already in flight",
            ));
        }
        self.staged.extend_from_slice(data);
        self.staged_sent = 0;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.state = SocketState::Closing;
        Ok(())
    }
}

/// Outcome of a non-blocking connect probe.
enum ConnectProgress {
    InFlight,
    Established,
    Failed,
}

/// Readiness loop binding a [`MqttClient`] to a [`TcpTransport`].
pub struct TcpDriver<A = ()> {
    poll: Poll,
    events: Events,
    client: MqttClient<TcpTransport, A>,
    last_tick: Instant,
}

impl<A> TcpDriver<A> {
    /// Create a driver and its client with the given transmit ring and
    /// receive scratch capacities in bytes.
    pub fn new(tx_buf_capacity: usize, rx_buf_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let transport = TcpTransport::new(poll.registry().try_clone()?);
        Ok(Self {
            poll,
            events: Events::with_capacity(16),
            client: MqttClient::new(transport, tx_buf_capacity, rx_buf_capacity),
            last_tick: Instant::now(),
        })
    }

    /// The driven client.
    pub fn client(&mut self) -> &mut MqttClient<TcpTransport, A> {
        &mut self.client
    }

    /// Run one poll cycle: deliver socket readiness to the engine and,
    /// when due, the periodic poll tick. Blocks at most until the next
    /// tick.
    pub fn drive<H: EventHandler<A>>(&mut self, handler: &mut H) -> io::Result<()> {
        let tick = Duration::from_millis(u64::from(CONN_POLL_INTERVAL_MS));
        let timeout = tick.saturating_sub(self.last_tick.elapsed());
        self.poll.poll(&mut self.events, Some(timeout))?;

        let mut readable = false;
        let mut writable = false;
        for event in self.events.iter() {
            if event.token() == SOCKET {
                readable |= event.is_readable();
                writable |= event.is_writable();
            }
        }

        if writable {
            self.handle_writable(handler)?;
        }
        if readable {
            self.handle_readable(handler)?;
        }
        self.finish_close(handler);

        if self.last_tick.elapsed() >= tick {
            self.last_tick = Instant::now();
            self.client.on_transport_event(TransportEvent::Poll, handler);
        }
        Ok(())
    }

    fn handle_writable<H: EventHandler<A>>(&mut self, handler: &mut H) -> io::Result<()> {
        let progress = {
            let transport = self.client.transport_mut();
            if transport.state != SocketState::Opening {
                None
            } else if let Some(stream) = transport.stream.as_ref() {
                if let Some(err) = stream.take_error()? {
                    debug!("connect failed: {}", err);
                    Some(ConnectProgress::Failed)
                } else {
                    // peer_addr fails until the handshake has finished
                    match stream.peer_addr() {
                        Ok(_) => Some(ConnectProgress::Established),
                        Err(err)
                            if err.kind() == io::ErrorKind::NotConnected
                                || err.kind() == io::ErrorKind::WouldBlock =>
                        {
                            Some(ConnectProgress::InFlight)
                        }
                        Err(err) => {
                            debug!("connect failed: {}", err);
                            Some(ConnectProgress::Failed)
                        }
                    }
                }
            } else {
                Some(ConnectProgress::InFlight)
            }
        };

        match progress {
            Some(ConnectProgress::InFlight) => return Ok(()),
            Some(ConnectProgress::Failed) => {
                self.drop_stream();
                self.client
                    .on_transport_event(TransportEvent::Error, handler);
                return Ok(());
            }
            Some(ConnectProgress::Established) => {
                self.client.transport_mut().state = SocketState::Open;
                self.client
                    .on_transport_event(TransportEvent::Connected, handler);
            }
            None => {}
        }

        self.flush_staged(handler);
        Ok(())
    }

    fn flush_staged<H: EventHandler<A>>(&mut self, handler: &mut H) {
        let mut result: Option<(usize, bool)> = None;
        {
            let transport = self.client.transport_mut();
            if transport.state != SocketState::Open || transport.staged.is_empty() {
                return;
            }
            let Some(stream) = transport.stream.as_mut() else {
                return;
            };
            loop {
                match stream.write(&transport.staged[transport.staged_sent..]) {
                    Ok(0) => {
                        result = Some((transport.staged_sent, false));
                        break;
                    }
                    Ok(n) => {
                        transport.staged_sent += n;
                        if transport.staged_sent == transport.staged.len() {
                            result = Some((transport.staged.len(), true));
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("socket write failed: {}", err);
                        result = Some((transport.staged_sent, false));
                        break;
                    }
                }
            }
            if result.is_some() {
                transport.staged.clear();
                transport.staged_sent = 0;
            }
        }
        if let Some((len, ok)) = result {
            self.client
                .on_transport_event(TransportEvent::Sent { len, ok }, handler);
        }
    }

    fn handle_readable<H: EventHandler<A>>(&mut self, handler: &mut H) -> io::Result<()> {
        let mut closed = false;
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let n = {
                let transport = self.client.transport_mut();
                let Some(stream) = transport.stream.as_mut() else {
                    return Ok(());
                };
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("socket read failed: {}", err);
                        closed = true;
                        break;
                    }
                }
            };
            let block = &chunk[..n];
            self.client
                .on_transport_event(TransportEvent::Received(&block), handler);
        }

        if closed {
            self.drop_stream();
            self.client
                .on_transport_event(TransportEvent::Closed { forced: false }, handler);
        }
        Ok(())
    }

    /// Deliver the `Closed` event for a close the engine initiated.
    fn finish_close<H: EventHandler<A>>(&mut self, handler: &mut H) {
        if self.client.transport_mut().state == SocketState::Closing {
            self.drop_stream();
            self.client
                .on_transport_event(TransportEvent::Closed { forced: true }, handler);
        }
    }

    fn drop_stream(&mut self) {
        let transport = self.client.transport_mut();
        if let Some(mut stream) = transport.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        transport.staged.clear();
        transport.staged_sent = 0;
        transport.state = SocketState::Idle;
    }
}
