//! Upper-layer services bound to a transport (RFC 4253 Section 10).
//!
//! A service such as `ssh-userauth` is started once the first key exchange
//! has finished and the peer accepted (client) or requested (server) it by
//! name. The transport hands every message numbered 50 and above to the
//! active service and never looks inside it.
//!
//! # Example
//!
//! ```rust
//! use kiln_proto::ssh::disconnect::Disconnect;
//! use kiln_proto::ssh::service::{Service, ServiceRegistry, ServiceTransport};
//!
//! struct Echo;
//!
//! impl Service for Echo {
//!     fn name(&self) -> &str {
//!         "echo@kiln"
//!     }
//!
//!     fn packet_received(
//!         &mut self,
//!         transport: &mut dyn ServiceTransport,
//!         msg_type: u8,
//!         payload: &[u8],
//!     ) -> Result<(), Disconnect> {
//!         transport.send_packet(msg_type, payload)?;
//!         Ok(())
//!     }
//! }
//!
//! let registry = ServiceRegistry::new().with_service("echo@kiln", || Box::new(Echo));
//! assert!(registry.contains("echo@kiln"));
//! ```

use crate::ssh::disconnect::{Disconnect, DisconnectCause, DisconnectReason};
use crate::ssh::transport::Direction;
use kiln_platform::KilnResult;
use std::fmt;
use std::net::SocketAddr;

/// What a running service may do with the transport it is attached to.
pub trait ServiceTransport {
    /// Sends a message. While a key exchange is running, messages that are
    /// not allowed during key exchange are queued and sent after NEWKEYS.
    fn send_packet(&mut self, msg_type: u8, payload: &[u8]) -> KilnResult<()>;

    /// Sends SSH_MSG_DISCONNECT with `reason` and closes the connection.
    fn disconnect(&mut self, reason: DisconnectReason, description: &str);

    /// Disconnects with SSH_DISCONNECT_CONNECTION_LOST. Repeated calls do nothing.
    fn lose_connection(&mut self);

    /// Address of the remote end, if known.
    fn peer_address(&self) -> Option<SocketAddr>;

    /// Address of the local end, if known.
    fn local_address(&self) -> Option<SocketAddr>;

    /// Exchange hash of the first key exchange.
    fn session_id(&self) -> Option<&[u8]>;

    /// Whether traffic in `direction` is encrypted.
    fn is_encrypted(&self, direction: Direction) -> bool;
}

/// An upper-layer protocol running on top of the transport.
pub trait Service: Send {
    /// Service name sent in SERVICE_REQUEST / SERVICE_ACCEPT.
    fn name(&self) -> &str;

    /// Called once the service becomes active.
    fn service_started(&mut self, _transport: &mut dyn ServiceTransport) {}

    /// Called when another service replaces this one.
    fn service_stopped(&mut self) {}

    /// Handles a message numbered 50 or above.
    ///
    /// Returning `Err` disconnects with the carried reason.
    fn packet_received(
        &mut self,
        transport: &mut dyn ServiceTransport,
        msg_type: u8,
        payload: &[u8],
    ) -> Result<(), Disconnect>;

    /// Called once when the connection ends, whichever side ended it.
    fn connection_lost(&mut self, _cause: &DisconnectCause) {}
}

type ServiceFactory = Box<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Services a server offers, by name.
///
/// Built once and shared read-only between connections.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: Vec<(String, ServiceFactory)>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing an earlier registration.
    pub fn with_service<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.factories.retain(|(n, _)| n != name);
        self.factories.push((name.to_string(), Box::new(factory)));
        self
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|(n, _)| n == name)
    }

    /// Creates a fresh instance of the service registered as `name`.
    pub fn create(&self, name: &str) -> Option<Box<dyn Service>> {
        self.factories
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, factory)| factory())
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(n, _)| n.as_str())
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Service for Named {
        fn name(&self) -> &str {
            self.0
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

    #[test]
    fn test_registry_create() {
        let registry = ServiceRegistry::new()
            .with_service("ssh-userauth", || Box::new(Named("ssh-userauth")))
            .with_service("ssh-connection", || Box::new(Named("ssh-connection")));

        assert!(registry.contains("ssh-userauth"));
        assert!(!registry.contains("ssh-unknown"));
        assert_eq!(registry.create("ssh-connection").unwrap().name(), "ssh-connection");
        assert!(registry.create("ssh-unknown").is_none());
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["ssh-userauth", "ssh-connection"]
        );
    }

    #[test]
    fn test_registry_replaces_duplicate() {
        let registry = ServiceRegistry::new()
            .with_service("svc", || Box::new(Named("first")))
            .with_service("svc", || Box::new(Named("second")));
        assert_eq!(registry.names().count(), 1);
        assert_eq!(registry.create("svc").unwrap().name(), "second");
        assert_eq!(format!("{:?}", registry), "[\"svc\"]");
    }
}
