//! SSH Transport Layer State Machine (RFC 4253).
//!
//! [`SshTransport`] drives one connection from the identification exchange
//! through key exchange to an established connection carrying a service. It
//! performs no I/O itself: bytes from the peer are fed in with
//! [`data_received`](SshTransport::data_received) and bytes for the peer are
//! drained with [`take_outgoing`](SshTransport::take_outgoing). The
//! [`io`](crate::ssh::io) module pumps a tokio stream through it.
//!
//! # Transport States
//!
//! 1. **ExpectVersion** - Our identification line is sent; waiting for the peer's
//! 2. **ExpectKexInit** - Our KEXINIT is sent; waiting for the peer's
//! 3. **KeyExchange** - First Diffie-Hellman exchange and NEWKEYS in progress
//! 4. **Established** - Keys installed; a service may be attached
//! 5. **Closed** - Disconnected or the stream went away
//!
//! # Rekeying
//!
//! A rekey keeps the state at `Established` with [`is_rekeying`](SshTransport::is_rekeying)
//! set. It starts when either side sends KEXINIT, or automatically once the
//! configured byte or time limit is reached:
//! - Data transferred (1 GB by default)
//! - Time elapsed (1 hour by default)
//!
//! While a key exchange runs, outgoing messages that RFC 4253 Section 7.1
//! does not allow are queued and sent in order after both NEWKEYS.
//!
//! # Example
//!
//! ```rust
//! use kiln_proto::ssh::config::TransportConfig;
//! use kiln_proto::ssh::transport::{LoggingHandler, SshTransport, State};
//! use std::sync::Arc;
//!
//! let config = Arc::new(TransportConfig::default());
//! let mut client = SshTransport::client(config, Box::new(LoggingHandler));
//! client.connection_made(None, None);
//!
//! assert_eq!(client.state(), State::ExpectVersion);
//! assert!(client.take_outgoing().starts_with(b"SSH-2.0-Kiln_"));
//! ```

use crate::ssh::compression::{Compressor, Decompressor};
use crate::ssh::config::{Role, TransportConfig};
use crate::ssh::crypto::{CipherAlgorithm, CipherSuite, MacAlgorithm, Opener};
use crate::ssh::disconnect::{Disconnect, DisconnectCause, DisconnectReason};
use crate::ssh::hostkey::{self, HostKey};
use crate::ssh::kex::{negotiate, should_ignore_guess, KexInit, NegotiatedAlgorithms, NewKeys};
use crate::ssh::kex_dh::{ExchangeContext, KexMethod, KexOutcome, KexStep, KeyExchange};
use crate::ssh::message::{allowed_during_kex, is_kex_method_message, MessageType};
use crate::ssh::packet::{Packet, PacketCodec};
use crate::ssh::service::{Service, ServiceRegistry, ServiceTransport};
use crate::ssh::version::{take_identification_line, Version};
use crate::ssh::wire::{put_bool, put_string, WireReader};
use bytes::{BufMut, Bytes, BytesMut};
use kiln_platform::{Clock, KilnError, KilnResult, OsRandom, SecureRandom, SystemClock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// SSH transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the peer's identification line.
    ExpectVersion,

    /// Waiting for the peer's first SSH_MSG_KEXINIT.
    ExpectKexInit,

    /// First key exchange in progress.
    KeyExchange,

    /// Keys installed. A rekey may be running.
    Established,

    /// Connection finished; nothing more is processed.
    Closed,
}

/// Traffic direction, from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Packets we receive.
    Incoming,
    /// Packets we send.
    Outgoing,
    /// Both directions.
    #[default]
    Both,
}

/// Connection-level events surfaced to the application.
///
/// Every method has a default that logs the event, so implementors only
/// override what they care about. A client must override
/// [`verify_host_key`](Self::verify_host_key): the default rejects every key.
pub trait TransportHandler: Send {
    /// The peer sent SSH_MSG_DISCONNECT.
    fn receive_error(&mut self, reason: DisconnectReason, description: &str) {
        warn!(%reason, description, "peer disconnected");
    }

    /// The peer sent SSH_MSG_DEBUG.
    fn receive_debug(&mut self, always_display: bool, message: &str, language: &str) {
        if always_display {
            info!(message, language, "peer debug message");
        } else {
            debug!(message, language, "peer debug message");
        }
    }

    /// The peer sent SSH_MSG_IGNORE.
    fn receive_ignore(&mut self, data: &[u8]) {
        trace!(len = data.len(), "peer ignore message");
    }

    /// The peer could not handle our packet with this sequence number.
    fn receive_unimplemented(&mut self, sequence: u32) {
        warn!(sequence, "peer sent unimplemented");
    }

    /// Decides whether the server host key is trusted (client only).
    ///
    /// `fingerprint` is `SHA256:` followed by the base64 digest of the key blob.
    fn verify_host_key(&mut self, host_key_blob: &[u8], fingerprint: &str) -> bool {
        let _ = host_key_blob;
        warn!(fingerprint, "no host key verifier installed, rejecting key");
        false
    }

    /// The first key exchange finished and the host key was accepted (client only).
    fn connection_secure(&mut self) {
        info!("connection secured");
    }

    /// The connection ended.
    fn connection_lost(&mut self, cause: &DisconnectCause) {
        info!(%cause, "connection lost");
    }
}

/// Handler that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl TransportHandler for LoggingHandler {}

/// The state of the key exchange we take part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KexState {
    /// No key exchange running.
    Idle,
    /// Our KEXINIT is sent; the peer's has not arrived.
    Requested,
    /// Both KEXINITs seen; DH messages and NEWKEYS pending.
    Progressing,
}

/// Keys derived for the direction we receive in, waiting for the peer's NEWKEYS.
struct PendingIncoming {
    opener: Opener,
    decompressor: Decompressor,
}

/// Sans-IO SSH transport for one connection.
pub struct SshTransport {
    config: Arc<TransportConfig>,
    role: Role,
    state: State,
    rng: Box<dyn SecureRandom>,
    clock: Box<dyn Clock>,
    handler: Box<dyn TransportHandler>,
    host_keys: Vec<Arc<dyn HostKey>>,
    services: Option<Arc<ServiceRegistry>>,

    codec: PacketCodec,
    inbound: BytesMut,
    outbound: BytesMut,
    connected: bool,
    wants_close: bool,
    local_address: Option<SocketAddr>,
    peer_address: Option<SocketAddr>,

    local_version: String,
    peer_version: Option<String>,
    banner_lines: usize,

    kex_state: KexState,
    our_kexinit: Option<(KexInit, Vec<u8>)>,
    their_kexinit: Option<(KexInit, Vec<u8>)>,
    negotiated: Option<NegotiatedAlgorithms>,
    kex: Option<KeyExchange>,
    pending_incoming: Option<PendingIncoming>,
    ignore_next_kex_packet: bool,
    queued: VecDeque<(u8, Vec<u8>)>,
    session_id: Option<Vec<u8>>,
    last_kex_time: u64,

    service: Option<Box<dyn Service>>,
    service_started: bool,
    requested_service: Option<Box<dyn Service>>,
    closed_cause: Option<DisconnectCause>,
}

impl SshTransport {
    /// Creates a client transport.
    pub fn client(config: Arc<TransportConfig>, handler: Box<dyn TransportHandler>) -> Self {
        Self::new(Role::Client, config, handler, Vec::new(), None)
    }

    /// Creates a server transport offering `host_keys` and the services in `services`.
    ///
    /// Only host key algorithms that appear in the configuration and have a
    /// key in `host_keys` are advertised.
    pub fn server(
        config: Arc<TransportConfig>,
        host_keys: Vec<Arc<dyn HostKey>>,
        services: Arc<ServiceRegistry>,
        handler: Box<dyn TransportHandler>,
    ) -> Self {
        Self::new(Role::Server, config, handler, host_keys, Some(services))
    }

    fn new(
        role: Role,
        config: Arc<TransportConfig>,
        handler: Box<dyn TransportHandler>,
        host_keys: Vec<Arc<dyn HostKey>>,
        services: Option<Arc<ServiceRegistry>>,
    ) -> Self {
        let local_version = config.version().to_string();
        let max_packet_len = config.max_packet_len;
        Self {
            config,
            role,
            state: State::ExpectVersion,
            rng: Box::new(OsRandom::new()),
            clock: Box::new(SystemClock),
            handler,
            host_keys,
            services,
            codec: PacketCodec::new(max_packet_len),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            connected: false,
            wants_close: false,
            local_address: None,
            peer_address: None,
            local_version,
            peer_version: None,
            banner_lines: 0,
            kex_state: KexState::Idle,
            our_kexinit: None,
            their_kexinit: None,
            negotiated: None,
            kex: None,
            pending_incoming: None,
            ignore_next_kex_packet: false,
            queued: VecDeque::new(),
            session_id: None,
            last_kex_time: 0,
            service: None,
            service_started: false,
            requested_service: None,
            closed_cause: None,
        }
    }

    /// Replaces the random source.
    pub fn with_random(mut self, rng: Box<dyn SecureRandom>) -> Self {
        self.rng = rng;
        self
    }

    /// Replaces the clock used for the rekey time limit.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ---------------------------------------------------------------------
    // Byte stream callbacks
    // ---------------------------------------------------------------------

    /// The byte stream is open. Sends our identification line.
    pub fn connection_made(&mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) {
        if self.connected || self.state == State::Closed {
            return;
        }
        self.connected = true;
        self.local_address = local;
        self.peer_address = peer;
        self.last_kex_time = self.clock.now_secs();
        debug!(role = %self.role, version = %self.local_version, ?peer, "connection made");
        self.outbound.put_slice(self.local_version.as_bytes());
        self.outbound.put_slice(b"\r\n");
    }

    /// Feeds bytes received from the peer.
    pub fn data_received(&mut self, data: &[u8]) {
        if self.state == State::Closed {
            return;
        }
        self.inbound.extend_from_slice(data);

        while self.state != State::Closed {
            let result = if self.state == State::ExpectVersion {
                match self.read_version() {
                    Ok(true) => Ok(()),
                    Ok(false) => break,
                    Err(err) => Err(err),
                }
            } else {
                let sequence = self.codec.incoming_sequence();
                match self.codec.decode(&mut self.inbound) {
                    Ok(Some(packet)) => self.dispatch(packet, sequence),
                    Ok(None) => break,
                    Err(err) => Err(err.into()),
                }
            };
            if let Err(err) = result {
                self.fail(err);
            }
        }

        self.check_rekey();
    }

    /// The byte stream closed or failed underneath us.
    ///
    /// Any key exchange in progress is abandoned. The attached service and
    /// the handler are told unless the connection had already been closed.
    pub fn connection_lost(&mut self, reason: Option<&str>) {
        if self.state == State::Closed {
            return;
        }
        let cause = DisconnectCause::Transport(reason.unwrap_or("connection closed").to_string());
        self.close(cause);
    }

    /// Drains the bytes that must be written to the peer.
    pub fn take_outgoing(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Whether bytes are waiting in [`take_outgoing`](Self::take_outgoing).
    pub fn has_outgoing(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Whether the byte stream should be closed once outgoing bytes are written.
    pub fn wants_close(&self) -> bool {
        self.wants_close
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether a key exchange runs on an established connection.
    pub fn is_rekeying(&self) -> bool {
        self.state == State::Established && self.kex_state != KexState::Idle
    }

    /// Our identification line, without CR LF.
    pub fn local_version(&self) -> &str {
        &self.local_version
    }

    /// The peer's identification line as received, without CR LF.
    pub fn peer_version(&self) -> Option<&str> {
        self.peer_version.as_deref()
    }

    /// Algorithms chosen by the most recent key exchange.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Address of the local end, if known.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    /// Address of the remote end, if known.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    /// Why the connection ended, once it has.
    pub fn closed_cause(&self) -> Option<&DisconnectCause> {
        self.closed_cause.as_ref()
    }

    /// Sequence numbers of the next packet sent and received.
    pub fn sequence_numbers(&self) -> (u32, u32) {
        (self.codec.outgoing_sequence(), self.codec.incoming_sequence())
    }

    /// Whether traffic in `direction` is encrypted with a cipher other than `none`.
    pub fn is_encrypted(&self, direction: Direction) -> bool {
        let out = self.codec.sealer().cipher() != CipherAlgorithm::None;
        let inc = self.codec.opener().cipher() != CipherAlgorithm::None;
        match direction {
            Direction::Outgoing => out,
            Direction::Incoming => inc,
            Direction::Both => out && inc,
        }
    }

    /// Whether traffic in `direction` is protected by a MAC other than `none`.
    pub fn is_verified(&self, direction: Direction) -> bool {
        let out = self.codec.sealer().mac() != MacAlgorithm::None;
        let inc = self.codec.opener().mac() != MacAlgorithm::None;
        match direction {
            Direction::Outgoing => out,
            Direction::Incoming => inc,
            Direction::Both => out && inc,
        }
    }

    /// Name of the active service, if any.
    pub fn service_name(&self) -> Option<&str> {
        self.service.as_ref().map(|s| s.name())
    }

    // ---------------------------------------------------------------------
    // Outbound API
    // ---------------------------------------------------------------------

    /// Sends a message, queueing it while a key exchange runs if RFC 4253
    /// Section 7.1 does not allow it during key exchange.
    ///
    /// # Errors
    ///
    /// [`KilnError::InvalidState`] before [`connection_made`](Self::connection_made)
    /// for messages that cannot be queued, after the connection closed, or
    /// for KEXINIT and NEWKEYS, which only the transport itself sends.
    pub fn send_packet(&mut self, msg_type: u8, payload: &[u8]) -> KilnResult<()> {
        if self.state == State::Closed {
            return Err(KilnError::InvalidState("transport is closed".to_string()));
        }
        if msg_type == MessageType::KexInit as u8 || msg_type == MessageType::NewKeys as u8 {
            return Err(KilnError::InvalidState(format!(
                "message {} is driven by the transport, use send_kex_init",
                msg_type
            )));
        }
        if self.must_queue(msg_type) {
            trace!(msg_type, queued = self.queued.len() + 1, "queueing packet during key exchange");
            self.queued.push_back((msg_type, payload.to_vec()));
            return Ok(());
        }
        if !self.connected {
            return Err(KilnError::InvalidState(
                "cannot send before the connection is made".to_string(),
            ));
        }
        self.write_packet(msg_type, payload)?;
        self.check_rekey();
        Ok(())
    }

    /// Sends SSH_MSG_IGNORE carrying `data`.
    pub fn send_ignore(&mut self, data: &[u8]) -> KilnResult<()> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, data);
        self.send_packet(MessageType::Ignore as u8, &buf)
    }

    /// Sends SSH_MSG_DEBUG.
    pub fn send_debug(&mut self, message: &str, always_display: bool) -> KilnResult<()> {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, always_display);
        put_string(&mut buf, message.as_bytes());
        put_string(&mut buf, b"");
        self.send_packet(MessageType::Debug as u8, &buf)
    }

    /// Sends SSH_MSG_UNIMPLEMENTED for the peer's packet `sequence`.
    pub fn send_unimplemented(&mut self, sequence: u32) -> KilnResult<()> {
        self.send_packet(MessageType::Unimplemented as u8, &sequence.to_be_bytes())
    }

    /// Starts a key exchange on an established connection.
    ///
    /// # Errors
    ///
    /// [`KilnError::InvalidState`] if a key exchange is already running or
    /// the connection is not established.
    pub fn send_kex_init(&mut self) -> KilnResult<()> {
        if self.kex_state != KexState::Idle {
            return Err(KilnError::InvalidState(format!(
                "cannot send KEXINIT while key exchange state is {:?}",
                self.kex_state
            )));
        }
        if self.state != State::Established {
            return Err(KilnError::InvalidState(format!(
                "cannot start a key exchange in state {:?}",
                self.state
            )));
        }
        self.start_kex()
    }

    /// Asks the server for `service` (client only).
    ///
    /// SERVICE_REQUEST is queued until the first key exchange finishes; the
    /// service starts when SERVICE_ACCEPT arrives.
    ///
    /// # Errors
    ///
    /// [`KilnError::InvalidState`] on a server, while another request is
    /// outstanding, or after the connection closed.
    pub fn request_service(&mut self, service: Box<dyn Service>) -> KilnResult<()> {
        if !self.role.is_client() {
            return Err(KilnError::InvalidState(
                "only a client can request a service".to_string(),
            ));
        }
        if self.requested_service.is_some() {
            return Err(KilnError::InvalidState(
                "a service request is already outstanding".to_string(),
            ));
        }
        let mut buf = BytesMut::new();
        put_string(&mut buf, service.name().as_bytes());
        self.send_packet(MessageType::ServiceRequest as u8, &buf)?;
        debug!(service = service.name(), "requested service");
        self.requested_service = Some(service);
        Ok(())
    }

    /// Attaches `service` directly, without a SERVICE_REQUEST exchange.
    ///
    /// The service starts now if the first key exchange has finished, or as
    /// soon as it does.
    pub fn attach_service(&mut self, service: Box<dyn Service>) {
        if self.state == State::Established {
            self.start_service(service);
        } else if self.state != State::Closed {
            self.stop_service();
            self.service = Some(service);
            self.service_started = false;
        }
    }

    /// Sends SSH_MSG_DISCONNECT and closes the connection.
    ///
    /// Does nothing once the connection is closed.
    pub fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        if self.state == State::Closed {
            return;
        }
        info!(%reason, description, "disconnecting");
        if self.connected {
            let mut buf = BytesMut::new();
            buf.put_u32(reason.code());
            put_string(&mut buf, description.as_bytes());
            put_string(&mut buf, b"");
            if let Err(err) = self.write_packet(MessageType::Disconnect as u8, &buf) {
                debug!(%err, "could not encode disconnect");
            }
        }
        self.close(DisconnectCause::Local {
            reason,
            description: description.to_string(),
        });
    }

    /// Disconnects with SSH_DISCONNECT_CONNECTION_LOST.
    ///
    /// Repeated calls have no further effect.
    pub fn lose_connection(&mut self) {
        self.disconnect(DisconnectReason::ConnectionLost, "user closed connection");
    }

    /// Starts a rekey if the byte or time limit has been reached.
    ///
    /// Called after every batch of received data and every sent packet; a
    /// driver may also call it from a timer.
    pub fn check_rekey(&mut self) {
        if self.state != State::Established || self.kex_state != KexState::Idle {
            return;
        }
        let bytes_limit = self.config.rekey_bytes_limit;
        let time_limit = self.config.rekey_time_limit;
        let bytes = self.codec.bytes_since_rekey();
        let elapsed = self.clock.now_secs().saturating_sub(self.last_kex_time);

        let over_bytes = bytes_limit > 0 && bytes >= bytes_limit;
        let over_time = time_limit > 0 && elapsed >= time_limit;
        if over_bytes || over_time {
            info!(bytes, elapsed, "rekey limit reached");
            if let Err(err) = self.start_kex() {
                self.fail(Disconnect::from(err));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn must_queue(&self, msg_type: u8) -> bool {
        !allowed_during_kex(msg_type)
            && (self.state != State::Established || self.kex_state != KexState::Idle)
    }

    fn write_packet(&mut self, msg_type: u8, payload: &[u8]) -> KilnResult<()> {
        let bytes = self.codec.encode(msg_type, payload, self.rng.as_mut())?;
        self.outbound.put_slice(&bytes);
        Ok(())
    }

    fn fail(&mut self, err: Disconnect) {
        warn!(reason = %err.reason, description = %err.description, "protocol failure");
        self.disconnect(err.reason, &err.description);
    }

    fn close(&mut self, cause: DisconnectCause) {
        self.state = State::Closed;
        self.wants_close = true;
        self.kex_state = KexState::Idle;
        self.kex = None;
        self.pending_incoming = None;
        self.queued.clear();
        self.closed_cause = Some(cause.clone());

        if let Some(mut service) = self.service.take() {
            service.connection_lost(&cause);
        }
        if let Some(mut service) = self.requested_service.take() {
            service.connection_lost(&cause);
        }
        self.handler.connection_lost(&cause);
    }

    /// Returns `Ok(true)` once the identification line has been handled.
    fn read_version(&mut self) -> Result<bool, Disconnect> {
        let line = match take_identification_line(&mut self.inbound, &mut self.banner_lines)? {
            Some(line) => line,
            None => return Ok(false),
        };
        debug!(peer_version = %line, "received identification");

        let supported = Version::parse(&line)
            .map(|v| v.is_supported(&self.config.supported_versions))
            .unwrap_or(false);
        self.peer_version = Some(line.clone());
        self.state = State::ExpectKexInit;
        self.start_kex()?;

        if !supported {
            return Err(Disconnect::new(
                DisconnectReason::ProtocolVersionNotSupported,
                format!("bad version {}", line),
            ));
        }
        Ok(true)
    }

    fn host_key_algorithms(&self) -> Vec<String> {
        match self.role {
            Role::Client => self.config.host_key_algorithms.clone(),
            Role::Server => self
                .config
                .host_key_algorithms
                .iter()
                .filter(|name| self.host_keys.iter().any(|k| k.algorithm_name() == *name))
                .cloned()
                .collect(),
        }
    }

    fn host_key(&self, algorithm: &str) -> Option<Arc<dyn HostKey>> {
        self.host_keys
            .iter()
            .find(|k| k.algorithm_name() == algorithm)
            .cloned()
    }

    fn start_kex(&mut self) -> KilnResult<()> {
        let kexinit = KexInit::from_config(&self.config, self.host_key_algorithms(), self.rng.as_mut());
        let bytes = kexinit.to_bytes();
        self.write_packet(MessageType::KexInit as u8, &bytes[1..])?;
        debug!(role = %self.role, rekey = self.state == State::Established, "sent KEXINIT");
        self.our_kexinit = Some((kexinit, bytes));
        self.kex_state = KexState::Requested;
        Ok(())
    }

    fn dispatch(&mut self, packet: Packet, sequence: u32) -> Result<(), Disconnect> {
        let msg_type = packet.msg_type();
        let payload = packet.payload();
        trace!(msg_type, sequence, len = payload.len(), "dispatching packet");

        if self.ignore_next_kex_packet && is_kex_method_message(msg_type) {
            self.ignore_next_kex_packet = false;
            debug!(msg_type, "discarding mismatched guessed key exchange packet");
            return Ok(());
        }

        match msg_type {
            1 => self.on_disconnect(payload),
            2 => {
                let data = WireReader::new(payload).read_string()?;
                self.handler.receive_ignore(data);
                Ok(())
            }
            3 => {
                let sequence = WireReader::new(payload).read_u32()?;
                self.handler.receive_unimplemented(sequence);
                Ok(())
            }
            4 => {
                let mut reader = WireReader::new(payload);
                let always_display = reader.read_bool()?;
                let message = String::from_utf8_lossy(reader.read_string()?).into_owned();
                let language = reader
                    .read_string()
                    .map(|l| String::from_utf8_lossy(l).into_owned())
                    .unwrap_or_default();
                self.handler.receive_debug(always_display, &message, &language);
                Ok(())
            }
            5 if self.role == Role::Server => self.on_service_request(payload),
            6 if self.role.is_client() => self.on_service_accept(payload),
            20 => self.on_kexinit(payload),
            21 => self.on_newkeys(payload),
            30..=49 => self.on_kex_method(msg_type, payload),
            50..=255 => {
                if self.service.is_some() && self.service_started {
                    self.deliver_to_service(msg_type, payload)
                } else {
                    self.reply_unimplemented(msg_type, sequence)
                }
            }
            _ => self.reply_unimplemented(msg_type, sequence),
        }
    }

    fn reply_unimplemented(&mut self, msg_type: u8, sequence: u32) -> Result<(), Disconnect> {
        debug!(msg_type, sequence, "unhandled message, replying unimplemented");
        self.write_packet(MessageType::Unimplemented as u8, &sequence.to_be_bytes())?;
        Ok(())
    }

    fn on_disconnect(&mut self, payload: &[u8]) -> Result<(), Disconnect> {
        let mut reader = WireReader::new(payload);
        let reason = DisconnectReason::from_code(reader.read_u32()?);
        let description = String::from_utf8_lossy(reader.read_string()?).into_owned();
        self.handler.receive_error(reason, &description);
        self.close(DisconnectCause::Remote {
            reason,
            description,
        });
        Ok(())
    }

    fn on_kexinit(&mut self, payload: &[u8]) -> Result<(), Disconnect> {
        if self.their_kexinit.is_some() {
            return Err(Disconnect::protocol_error("duplicate KEXINIT"));
        }

        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(MessageType::KexInit as u8);
        bytes.extend_from_slice(payload);
        let theirs = KexInit::from_bytes(&bytes)?;

        if self.kex_state == KexState::Idle {
            // Peer-initiated key exchange.
            self.start_kex()?;
        }
        if self.state == State::ExpectKexInit {
            self.state = State::KeyExchange;
        }
        self.kex_state = KexState::Progressing;

        let (ours, our_bytes) = self
            .our_kexinit
            .as_ref()
            .ok_or_else(|| Disconnect::protocol_error("no local KEXINIT"))?;
        let negotiated = negotiate(self.role, ours, &theirs)?;
        self.ignore_next_kex_packet = should_ignore_guess(ours, &theirs);

        let method = KexMethod::from_name(&negotiated.kex).ok_or_else(|| {
            Disconnect::key_exchange_failed(format!("unsupported key exchange {}", negotiated.kex))
        })?;
        let peer_version = self.peer_version.clone().unwrap_or_default();
        let context = match self.role {
            Role::Client => ExchangeContext {
                client_version: self.local_version.clone(),
                server_version: peer_version,
                client_kexinit: our_bytes.clone(),
                server_kexinit: bytes.clone(),
            },
            Role::Server => ExchangeContext {
                client_version: peer_version,
                server_version: self.local_version.clone(),
                client_kexinit: bytes.clone(),
                server_kexinit: our_bytes.clone(),
            },
        };
        info!(
            kex = %negotiated.kex,
            host_key = %negotiated.host_key,
            cipher_out = %negotiated.outgoing_cipher,
            cipher_in = %negotiated.incoming_cipher,
            mac_out = %negotiated.outgoing_mac,
            mac_in = %negotiated.incoming_mac,
            ignore_guess = self.ignore_next_kex_packet,
            "negotiated algorithms"
        );

        let mut kex = KeyExchange::new(method, &negotiated.host_key, self.role, context);
        let gex_bits = (
            self.config.gex_min_bits,
            self.config.gex_preferred_bits,
            self.config.gex_max_bits,
        );
        let first = kex.start(self.rng.as_mut(), gex_bits)?;

        self.their_kexinit = Some((theirs, bytes));
        self.negotiated = Some(negotiated);
        self.kex = Some(kex);
        if let Some((msg_type, payload)) = first {
            self.write_packet(msg_type, &payload)?;
        }
        Ok(())
    }

    fn on_kex_method(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), Disconnect> {
        let host_key = self
            .negotiated
            .as_ref()
            .and_then(|n| self.host_key(&n.host_key));
        let kex = self.kex.as_mut().ok_or_else(|| {
            Disconnect::protocol_error(format!(
                "key exchange message {} outside key exchange",
                msg_type
            ))
        })?;

        match kex.handle(msg_type, payload, self.rng.as_mut(), host_key.as_deref())? {
            KexStep::Continue { msg_type, payload } => {
                self.write_packet(msg_type, &payload)?;
                Ok(())
            }
            KexStep::Complete { reply, outcome } => {
                if let Some((msg_type, payload)) = reply {
                    self.write_packet(msg_type, &payload)?;
                }
                if self.role.is_client() {
                    let fingerprint = hostkey::fingerprint(&outcome.host_key_blob);
                    if !self.handler.verify_host_key(&outcome.host_key_blob, &fingerprint) {
                        return Err(Disconnect::key_exchange_failed(format!(
                            "host key {} rejected",
                            fingerprint
                        )));
                    }
                }
                self.send_newkeys(outcome)
            }
        }
    }

    fn send_newkeys(&mut self, outcome: KexOutcome) -> Result<(), Disconnect> {
        let negotiated = self
            .negotiated
            .as_ref()
            .ok_or_else(|| Disconnect::protocol_error("no negotiated algorithms"))?;
        let session_id = self
            .session_id
            .get_or_insert_with(|| outcome.exchange_hash.clone())
            .clone();

        let mut suite = CipherSuite::new(
            &negotiated.outgoing_cipher,
            &negotiated.incoming_cipher,
            &negotiated.outgoing_mac,
            &negotiated.incoming_mac,
        )?;
        let keys = suite.derive_keys(
            outcome.hash,
            self.role,
            &outcome.shared_secret,
            &outcome.exchange_hash,
            &session_id,
        );
        suite.set_keys(&keys)?;
        let (sealer, opener) = suite.into_halves()?;
        let compressor = Compressor::new(&negotiated.outgoing_compression)?;
        let decompressor = Decompressor::new(&negotiated.incoming_compression)?;

        self.kex = None;
        self.pending_incoming = Some(PendingIncoming {
            opener,
            decompressor,
        });

        self.write_packet(MessageType::NewKeys as u8, &[])?;
        self.codec.set_outgoing(sealer, compressor);
        debug!("sent NEWKEYS, outgoing keys active");
        Ok(())
    }

    fn on_newkeys(&mut self, payload: &[u8]) -> Result<(), Disconnect> {
        let mut bytes = vec![MessageType::NewKeys as u8];
        bytes.extend_from_slice(payload);
        NewKeys::from_bytes(&bytes)?;

        let pending = self
            .pending_incoming
            .take()
            .ok_or_else(|| Disconnect::protocol_error("NEWKEYS before key exchange finished"))?;
        self.codec.set_incoming(pending.opener, pending.decompressor);
        debug!("received NEWKEYS, incoming keys active");
        self.finish_kex()
    }

    fn finish_kex(&mut self) -> Result<(), Disconnect> {
        self.kex_state = KexState::Idle;
        self.our_kexinit = None;
        self.their_kexinit = None;
        self.ignore_next_kex_packet = false;
        self.codec.reset_rekey_counter();
        self.last_kex_time = self.clock.now_secs();

        let first = self.state == State::KeyExchange;
        self.state = State::Established;
        info!(
            role = %self.role,
            rekey = !first,
            encrypted = self.is_encrypted(Direction::Both),
            "key exchange complete"
        );

        while let Some((msg_type, payload)) = self.queued.pop_front() {
            self.write_packet(msg_type, &payload)?;
        }

        if first {
            if self.role.is_client() {
                self.handler.connection_secure();
            }
            if !self.service_started {
                if let Some(service) = self.service.take() {
                    self.start_service(service);
                }
            }
        }
        Ok(())
    }

    fn on_service_request(&mut self, payload: &[u8]) -> Result<(), Disconnect> {
        if self.session_id.is_none() {
            return Err(Disconnect::protocol_error(
                "SERVICE_REQUEST before key exchange",
            ));
        }
        let name = WireReader::new(payload).read_utf8()?.to_string();
        let service = self
            .services
            .as_ref()
            .and_then(|registry| registry.create(&name))
            .ok_or_else(|| {
                Disconnect::new(
                    DisconnectReason::ServiceNotAvailable,
                    format!("unknown service {}", name),
                )
            })?;

        let mut buf = BytesMut::new();
        put_string(&mut buf, name.as_bytes());
        // Held back with everything else while a rekey runs.
        self.send_packet(MessageType::ServiceAccept as u8, &buf)?;
        self.start_service(service);
        Ok(())
    }

    fn on_service_accept(&mut self, payload: &[u8]) -> Result<(), Disconnect> {
        let name = WireReader::new(payload).read_utf8()?.to_string();
        let service = self
            .requested_service
            .take()
            .ok_or_else(|| Disconnect::protocol_error("SERVICE_ACCEPT without request"))?;
        if service.name() != name {
            return Err(Disconnect::protocol_error(format!(
                "SERVICE_ACCEPT for {} but requested {}",
                name,
                service.name()
            )));
        }
        self.start_service(service);
        Ok(())
    }

    fn stop_service(&mut self) {
        if let Some(mut old) = self.service.take() {
            if self.service_started {
                debug!(service = old.name(), "stopping service");
                old.service_stopped();
            }
        }
        self.service_started = false;
    }

    fn start_service(&mut self, mut service: Box<dyn Service>) {
        self.stop_service();
        info!(service = service.name(), "starting service");
        service.service_started(self);
        self.restore_service(service);
    }

    fn deliver_to_service(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), Disconnect> {
        let mut service = match self.service.take() {
            Some(service) => service,
            None => return Ok(()),
        };
        let result = service.packet_received(self, msg_type, payload);
        self.restore_service(service);
        result
    }

    /// Puts a service back after a callback, or reports the loss to it if
    /// the callback closed the connection.
    fn restore_service(&mut self, mut service: Box<dyn Service>) {
        match &self.closed_cause {
            Some(cause) => service.connection_lost(cause),
            None => {
                self.service = Some(service);
                self.service_started = true;
            }
        }
    }
}

impl ServiceTransport for SshTransport {
    fn send_packet(&mut self, msg_type: u8, payload: &[u8]) -> KilnResult<()> {
        SshTransport::send_packet(self, msg_type, payload)
    }

    fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        SshTransport::disconnect(self, reason, description)
    }

    fn lose_connection(&mut self) {
        SshTransport::lose_connection(self)
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    fn is_encrypted(&self, direction: Direction) -> bool {
        SshTransport::is_encrypted(self, direction)
    }
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("kex_state", &self.kex_state)
            .field("peer_version", &self.peer_version)
            .field("service", &self.service_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::version::MAX_BANNER_LINES;
    use kiln_platform::mock::MockRandom;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl TransportHandler for Recorder {
        fn connection_lost(&mut self, cause: &DisconnectCause) {
            self.0.lock().unwrap().push(cause.to_string());
        }
    }

    fn client(handler: Recorder) -> SshTransport {
        SshTransport::client(Arc::new(TransportConfig::default()), Box::new(handler))
            .with_random(Box::new(MockRandom::new(9)))
    }

    /// Splits our output into the identification line and the packets after it.
    fn parse_output(bytes: &[u8]) -> (String, Vec<Packet>) {
        let end = bytes.windows(2).position(|w| w == b"\r\n").unwrap();
        let line = String::from_utf8(bytes[..end].to_vec()).unwrap();
        let mut rest = BytesMut::from(&bytes[end + 2..]);
        let mut codec = PacketCodec::new(256 * 1024);
        let mut packets = Vec::new();
        while let Some(packet) = codec.decode(&mut rest).unwrap() {
            packets.push(packet);
        }
        (line, packets)
    }

    #[test]
    fn test_sends_version_on_connect() {
        let mut transport = client(Recorder::default());
        assert!(!transport.has_outgoing());
        transport.connection_made(None, None);
        let out = transport.take_outgoing();
        assert!(out.starts_with(b"SSH-2.0-Kiln_"));
        assert!(out.ends_with(b"\r\n"));
        assert_eq!(transport.state(), State::ExpectVersion);
    }

    #[test]
    fn test_banner_skipped_then_kexinit_sent() {
        let mut transport = client(Recorder::default());
        transport.connection_made(None, None);
        transport.data_received(b"Welcome to the server\r\nSSH-2.0-Peer");
        assert_eq!(transport.state(), State::ExpectVersion);
        transport.data_received(b"_1.0 comment\r\n");

        assert_eq!(transport.state(), State::ExpectKexInit);
        assert_eq!(transport.peer_version(), Some("SSH-2.0-Peer_1.0 comment"));
        let (_, packets) = parse_output(&transport.take_outgoing());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].msg_type(), MessageType::KexInit as u8);
    }

    #[test]
    fn test_unsupported_version_sends_kexinit_then_disconnect() {
        let recorder = Recorder::default();
        let mut transport = client(recorder.clone());
        transport.connection_made(None, None);
        transport.data_received(b"SSH-1.5-Ancient\r\n");

        assert_eq!(transport.state(), State::Closed);
        assert!(transport.wants_close());
        let (_, packets) = parse_output(&transport.take_outgoing());
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].msg_type(), MessageType::KexInit as u8);
        assert_eq!(packets[1].msg_type(), MessageType::Disconnect as u8);
        let code = WireReader::new(packets[1].payload()).read_u32().unwrap();
        assert_eq!(code, DisconnectReason::ProtocolVersionNotSupported.code());
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_one_point_ninety_nine_accepted() {
        let mut transport = client(Recorder::default());
        transport.connection_made(None, None);
        transport.data_received(b"SSH-1.99-Compat\n");
        assert_eq!(transport.state(), State::ExpectKexInit);
    }

    #[test]
    fn test_send_kex_init_requires_established() {
        let mut transport = client(Recorder::default());
        transport.connection_made(None, None);
        assert!(matches!(
            transport.send_kex_init(),
            Err(KilnError::InvalidState(_))
        ));
        transport.data_received(b"SSH-2.0-Peer\r\n");
        // Our KEXINIT is out; a second one is a caller error.
        assert!(matches!(
            transport.send_kex_init(),
            Err(KilnError::InvalidState(_))
        ));
    }

    #[test]
    fn test_lose_connection_is_idempotent() {
        let recorder = Recorder::default();
        let mut transport = client(recorder.clone());
        transport.connection_made(None, None);
        transport.lose_connection();
        transport.lose_connection();
        transport.connection_lost(Some("reset"));

        let (_, packets) = parse_output(&transport.take_outgoing());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].msg_type(), MessageType::Disconnect as u8);
        let causes = recorder.0.lock().unwrap();
        assert_eq!(causes.len(), 1);
        assert!(causes[0].contains("disconnected locally"));
        assert!(matches!(
            transport.closed_cause(),
            Some(DisconnectCause::Local {
                reason: DisconnectReason::ConnectionLost,
                ..
            })
        ));
    }

    #[test]
    fn test_stream_loss_is_transport_cause() {
        let recorder = Recorder::default();
        let mut transport = client(recorder.clone());
        transport.connection_made(None, None);
        transport.data_received(b"SSH-2.0-Peer\r\n");
        transport.connection_lost(None);

        assert_eq!(transport.state(), State::Closed);
        assert!(matches!(
            transport.closed_cause(),
            Some(DisconnectCause::Transport(_))
        ));
        assert!(matches!(
            transport.send_packet(94, b"late"),
            Err(KilnError::InvalidState(_))
        ));
        // Data after close is ignored.
        transport.data_received(b"garbage");
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_send_rules_before_handshake() {
        let mut transport = client(Recorder::default());
        assert!(matches!(
            transport.send_ignore(b"x"),
            Err(KilnError::InvalidState(_))
        ));
        // Upper-layer messages are held until keys are in place.
        transport.send_packet(94, b"early").unwrap();
        transport.connection_made(None, None);
        transport.send_debug("hello", false).unwrap();
        let (_, packets) = parse_output(&transport.take_outgoing());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].msg_type(), MessageType::Debug as u8);
    }

    #[test]
    fn test_raw_kexinit_and_newkeys_rejected() {
        let mut transport = client(Recorder::default());
        transport.connection_made(None, None);
        transport.take_outgoing();
        for msg_type in [MessageType::KexInit as u8, MessageType::NewKeys as u8] {
            assert!(matches!(
                transport.send_packet(msg_type, &[]),
                Err(KilnError::InvalidState(_))
            ));
        }
        assert!(!transport.has_outgoing());
        assert_eq!(transport.state(), State::ExpectVersion);
    }

    #[test]
    fn test_endless_banner_rejected() {
        let mut transport = client(Recorder::default());
        transport.connection_made(None, None);
        for _ in 0..MAX_BANNER_LINES {
            transport.data_received(b"still not a version line\r\n");
        }
        assert_eq!(transport.state(), State::ExpectVersion);
        transport.data_received(b"one too many\r\n");
        assert!(matches!(
            transport.closed_cause(),
            Some(DisconnectCause::Local {
                reason: DisconnectReason::ProtocolError,
                ..
            })
        ));
    }

    #[test]
    fn test_server_cannot_request_service() {
        struct Dummy;
        impl Service for Dummy {
            fn name(&self) -> &str {
                "dummy"
            }
            fn packet_received(
                &mut self,
                _transport: &mut dyn ServiceTransport,
                _msg_type: u8,
                _payload: &[u8],
            ) -> Result<(), Disconnect> {
                Ok(())
            }
        }

        let mut server = SshTransport::server(
            Arc::new(TransportConfig::default()),
            Vec::new(),
            Arc::new(ServiceRegistry::new()),
            Box::new(LoggingHandler),
        );
        assert!(matches!(
            server.request_service(Box::new(Dummy)),
            Err(KilnError::InvalidState(_))
        ));
    }

    #[test]
    fn test_garbage_after_version_is_protocol_error() {
        let mut transport = client(Recorder::default());
        transport.connection_made(None, None);
        // Declared packet length far above the limit.
        transport.data_received(b"SSH-2.0-Peer\r\n\xff\xff\xff\xff\x00\x00\x00\x00");
        assert_eq!(transport.state(), State::Closed);
        assert!(matches!(
            transport.closed_cause(),
            Some(DisconnectCause::Local {
                reason: DisconnectReason::ProtocolError,
                ..
            })
        ));
    }
}
