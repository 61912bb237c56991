//! Contract between the protocol engines and whatever moves bytes.
//!
//! The engines never touch sockets. They hold `Connection` handles, drive a
//! server-side [`Listener`] or a client-side [`Connector`], and receive
//! lifecycle notifications through [`ServerHooks`] (server) or
//! [`ClientEvent`]s (client). [`crate::tcp`] is the production implementation;
//! unit tests plug in in-memory fakes.

use std::{fmt, future::Future, io, net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{ClientToServer, ServerToClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One duplex channel to a peer. `M` is the outbound frame type.
pub trait Connection<M>: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queues a frame for delivery. Must not block.
    fn send(&self, message: M) -> Result<(), TransportError>;

    /// Flushes anything already queued, then shuts the channel down.
    fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

pub type ServerConnection = Arc<dyn Connection<ServerToClient>>;
pub type ClientConnection = Arc<dyn Connection<ClientToServer>>;

/// Callbacks a server transport fires from its own tasks.
pub trait ServerHooks: Send + Sync {
    fn client_connected(&self, connection: ServerConnection);
    fn message_from_client(&self, id: ConnectionId, message: ClientToServer);
    fn client_disconnected(&self, id: ConnectionId);
    fn client_exception(&self, id: ConnectionId, error: TransportError);
    fn listening_started(&self, addr: SocketAddr);
    fn listening_stopped(&self);
}

/// Accepting side of the server transport.
pub trait Listener: Send + Sync {
    /// Starts accepting on `port`, reporting through `hooks`.
    fn listen(&self, port: u16, hooks: Arc<dyn ServerHooks>) -> Result<SocketAddr, TransportError>;

    /// Stops accepting. Established connections are left alone.
    fn stop_listening(&self);

    fn is_listening(&self) -> bool;
}

#[derive(Debug)]
pub struct ClientEvent {
    pub connection: ConnectionId,
    pub kind: ClientEventKind,
}

#[derive(Debug)]
pub enum ClientEventKind {
    Message(ServerToClient),
    Closed,
    Failed(TransportError),
}

pub type ClientEvents = mpsc::UnboundedSender<ClientEvent>;

/// Connecting side of the client transport.
pub trait Connector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        events: ClientEvents,
    ) -> impl Future<Output = Result<ClientConnection, TransportError>> + Send;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    };

    use super::{Connection, ConnectionId, TransportError};

    /// In-memory connection that records what it was sent.
    pub(crate) struct FakeConnection<M> {
        id: ConnectionId,
        sent: Mutex<Vec<M>>,
        open: AtomicBool,
        fail_sends: AtomicBool,
        fail_close: AtomicBool,
    }

    impl<M> FakeConnection<M> {
        pub(crate) fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId(id),
                sent: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
                fail_sends: AtomicBool::new(false),
                fail_close: AtomicBool::new(false),
            })
        }

        pub(crate) fn fail_sends(&self) {
            self.fail_sends.store(true, Ordering::SeqCst);
        }

        pub(crate) fn fail_close(&self) {
            self.fail_close.store(true, Ordering::SeqCst);
        }

        /// Simulates the peer vanishing: sends fail from now on.
        pub(crate) fn drop_link(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    impl<M: Clone> FakeConnection<M> {
        pub(crate) fn sent(&self) -> Vec<M> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl<M: Send> Connection<M> for FakeConnection<M> {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn send(&self, message: M) -> Result<(), TransportError> {
            if !self.is_open() || self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn close(&self) -> Result<(), TransportError> {
            self.open.store(false, Ordering::SeqCst);
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }
}
