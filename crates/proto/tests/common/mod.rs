//! Shared fixtures for the transport integration tests.

#![allow(dead_code)]

use kiln_platform::mock::MockRandom;
use kiln_proto::ssh::disconnect::{Disconnect, DisconnectCause, DisconnectReason};
use kiln_proto::ssh::hostkey::{Ed25519HostKey, HostKey, SshRsaHostKey};
use kiln_proto::ssh::service::{Service, ServiceRegistry, ServiceTransport};
use kiln_proto::ssh::transport::{SshTransport, TransportHandler};
use kiln_proto::ssh::TransportConfig;
use std::sync::{Arc, Mutex};

pub const TEST_RSA_PEM: &str = include_str!("../data/test_rsa.pem");

/// Something a handler or service observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Secure,
    HostKey(String),
    Debug(String),
    Ignore(Vec<u8>),
    Unimplemented(u32),
    PeerError(DisconnectReason, String),
    Lost(String),
    ServiceStarted(String),
    ServiceStopped(String),
    ServiceLost(String),
    Packet(String, u8, Vec<u8>),
}

/// Shared, cloneable event log.
#[derive(Debug, Clone, Default)]
pub struct Events(Arc<Mutex<Vec<Event>>>);

impl Events {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn all(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.all().iter().filter(|e| pred(e)).count()
    }

    pub fn packets(&self) -> Vec<(u8, Vec<u8>)> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Event::Packet(_, t, p) => Some((t, p)),
                _ => None,
            })
            .collect()
    }
}

/// Handler that records everything and trusts host keys unless told otherwise.
pub struct RecordingHandler {
    pub events: Events,
    pub trust_host_keys: bool,
}

impl RecordingHandler {
    pub fn new(events: &Events) -> Box<Self> {
        Box::new(Self {
            events: events.clone(),
            trust_host_keys: true,
        })
    }

    pub fn distrusting(events: &Events) -> Box<Self> {
        Box::new(Self {
            events: events.clone(),
            trust_host_keys: false,
        })
    }
}

impl TransportHandler for RecordingHandler {
    fn receive_error(&mut self, reason: DisconnectReason, description: &str) {
        self.events
            .push(Event::PeerError(reason, description.to_string()));
    }

    fn receive_debug(&mut self, _always_display: bool, message: &str, _language: &str) {
        self.events.push(Event::Debug(message.to_string()));
    }

    fn receive_ignore(&mut self, data: &[u8]) {
        self.events.push(Event::Ignore(data.to_vec()));
    }

    fn receive_unimplemented(&mut self, sequence: u32) {
        self.events.push(Event::Unimplemented(sequence));
    }

    fn verify_host_key(&mut self, _host_key_blob: &[u8], fingerprint: &str) -> bool {
        self.events.push(Event::HostKey(fingerprint.to_string()));
        self.trust_host_keys
    }

    fn connection_secure(&mut self) {
        self.events.push(Event::Secure);
    }

    fn connection_lost(&mut self, cause: &DisconnectCause) {
        self.events.push(Event::Lost(cause.to_string()));
    }
}

/// Service that records its lifecycle and optionally echoes packets back.
pub struct RecordingService {
    pub name: String,
    pub events: Events,
    pub echo: bool,
}

impl RecordingService {
    pub fn boxed(name: &str, events: &Events, echo: bool) -> Box<dyn Service> {
        Box::new(Self {
            name: name.to_string(),
            events: events.clone(),
            echo,
        })
    }
}

impl Service for RecordingService {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_started(&mut self, _transport: &mut dyn ServiceTransport) {
        self.events.push(Event::ServiceStarted(self.name.clone()));
    }

    fn service_stopped(&mut self) {
        self.events.push(Event::ServiceStopped(self.name.clone()));
    }

    fn packet_received(
        &mut self,
        transport: &mut dyn ServiceTransport,
        msg_type: u8,
        payload: &[u8],
    ) -> Result<(), Disconnect> {
        self.events
            .push(Event::Packet(self.name.clone(), msg_type, payload.to_vec()));
        if self.echo {
            transport.send_packet(msg_type, payload)?;
        }
        Ok(())
    }

    fn connection_lost(&mut self, cause: &DisconnectCause) {
        self.events.push(Event::ServiceLost(cause.to_string()));
    }
}

pub fn rsa_host_key() -> Arc<dyn HostKey> {
    Arc::new(SshRsaHostKey::from_pkcs1_pem(TEST_RSA_PEM).unwrap())
}

pub fn ed25519_host_key() -> Arc<dyn HostKey> {
    Arc::new(Ed25519HostKey::from_bytes(&[0x42; 32]).unwrap())
}

/// Configuration with a single algorithm per category.
pub fn single_config(kex: &str, host_key: &str, cipher: &str, mac: &str, compression: &str) -> TransportConfig {
    let config = TransportConfig::default()
        .with_kex_algorithms(&[kex])
        .with_host_key_algorithms(&[host_key])
        .with_ciphers(&[cipher])
        .with_macs(&[mac])
        .with_compressions(&[compression]);
    config.validate().unwrap();
    config
}

/// A connected client/server pair with their event logs.
pub struct Pair {
    pub client: SshTransport,
    pub server: SshTransport,
    pub client_events: Events,
    pub server_events: Events,
}

impl Pair {
    pub fn new(client_config: TransportConfig, server_config: TransportConfig) -> Self {
        Self::with_host_keys(client_config, server_config, vec![rsa_host_key(), ed25519_host_key()])
    }

    pub fn with_host_keys(
        client_config: TransportConfig,
        server_config: TransportConfig,
        host_keys: Vec<Arc<dyn HostKey>>,
    ) -> Self {
        let client_events = Events::default();
        let server_events = Events::default();

        let service_events = server_events.clone();
        let echo_events = server_events.clone();
        let registry = ServiceRegistry::new()
            .with_service("ssh-userauth", move || {
                RecordingService::boxed("ssh-userauth", &service_events, false)
            })
            .with_service("echo@kiln", move || {
                RecordingService::boxed("echo@kiln", &echo_events, true)
            });

        let client = SshTransport::client(
            Arc::new(client_config),
            RecordingHandler::new(&client_events),
        )
        .with_random(Box::new(MockRandom::new(1)));
        let server = SshTransport::server(
            Arc::new(server_config),
            host_keys,
            Arc::new(registry),
            RecordingHandler::new(&server_events),
        )
        .with_random(Box::new(MockRandom::new(2)));

        Self {
            client,
            server,
            client_events,
            server_events,
        }
    }

    pub fn connect(&mut self) {
        self.client.connection_made(None, None);
        self.server.connection_made(None, None);
        self.pump();
    }

    /// Moves bytes both ways until neither side has anything to send.
    pub fn pump(&mut self) {
        pump(&mut self.client, &mut self.server);
    }
}

pub fn pump(a: &mut SshTransport, b: &mut SshTransport) {
    for _ in 0..1000 {
        let from_a = a.take_outgoing();
        let from_b = b.take_outgoing();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        if !from_a.is_empty() {
            b.data_received(&from_a);
        }
        if !from_b.is_empty() {
            a.data_received(&from_b);
        }
    }
    panic!("transports never went quiet");
}
