//! Tokio TCP transport.
//!
//! Every socket gets one task that owns both halves. The task writes frames
//! queued through [`TcpConnection::send`], reads inbound frames and hands them
//! to a callback, and reports how the connection ended. Dropping the queue
//! sender (what [`TcpConnection::close`] does) lets the task flush what is
//! already queued, shut the write half down and exit.

use std::{
    future::{Future, poll_fn},
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::Poll,
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, warn};

use crate::{
    message::{ClientToServer, ServerToClient, decode_line, write_message},
    transport::{
        ClientConnection, ClientEvent, ClientEventKind, ClientEvents, Connection, ConnectionId,
        Connector, Listener, ServerHooks, TransportError,
    },
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TcpConnection<M> {
    id: ConnectionId,
    outbound: Mutex<Option<mpsc::UnboundedSender<M>>>,
}

impl<M> TcpConnection<M> {
    fn new(id: ConnectionId) -> (Arc<Self>, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            outbound: Mutex::new(Some(tx)),
        });
        (connection, rx)
    }
}

impl<M: Send> Connection<M> for TcpConnection<M> {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: M) -> Result<(), TransportError> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        lock(&self.outbound).take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.outbound)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// Join handles of live connection tasks, so a supervisor can let queued
/// frames drain before the runtime goes away.
#[derive(Default)]
struct ConnectionTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionTasks {
    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = lock(&self.handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    async fn wait(&self, limit: Duration) {
        let handles = std::mem::take(&mut *lock(&self.handles));
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if timeout(limit, drain).await.is_err() {
            warn!("connections still open after {limit:?}; abandoning them");
        }
    }
}

fn spawn_driver<In, Out>(
    stream: TcpStream,
    outbound: mpsc::UnboundedReceiver<Out>,
    on_message: impl Fn(In) + Send + 'static,
    on_end: impl FnOnce(Option<io::Error>) + Send + 'static,
) -> JoinHandle<()>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let outcome = drive_connection(stream, outbound, on_message).await;
        on_end(outcome.err());
    })
}

async fn drive_connection<In, Out>(
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Out>,
    on_message: impl Fn(In),
) -> io::Result<()>
where
    In: DeserializeOwned,
    Out: Serialize,
{
    let (reader, mut writer) = stream.into_split();
    // `Lines::next_line` is cancel safe, so a frame is never lost when the
    // outbound branch wins the select.
    let mut lines = BufReader::new(reader).lines();

    loop {
        select! {
            queued = outbound.recv() => match queued {
                Some(message) => write_message(&mut writer, &message).await?,
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(message) = decode_line(&line)? {
                        on_message(message);
                    }
                }
                None => break,
            },
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down writer cleanly");
    }
    Ok(())
}

/// The bound socket, shared with the accept task only for the duration of
/// each poll so that taking it out closes the port on the spot.
type SharedListener = Arc<Mutex<Option<TcpListener>>>;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct AcceptTask {
    handle: JoinHandle<()>,
    listener: SharedListener,
    hooks: Arc<dyn ServerHooks>,
    addr: SocketAddr,
}

/// Server side of the transport: binds `<host>:<port>` on demand and runs an
/// accept loop until told to stop.
pub struct TcpAcceptor {
    host: IpAddr,
    next_id: Arc<AtomicU64>,
    accept: Mutex<Option<AcceptTask>>,
    tasks: Arc<ConnectionTasks>,
}

impl TcpAcceptor {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            next_id: Arc::new(AtomicU64::new(1)),
            accept: Mutex::new(None),
            tasks: Arc::new(ConnectionTasks::default()),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.accept).as_ref().map(|task| task.addr)
    }

    /// Waits up to `limit` for every connection task to finish.
    pub async fn wait_for_connections(&self, limit: Duration) {
        self.tasks.wait(limit).await;
    }
}

impl Listener for TcpAcceptor {
    fn listen(&self, port: u16, hooks: Arc<dyn ServerHooks>) -> Result<SocketAddr, TransportError> {
        let mut accept = lock(&self.accept);
        if let Some(task) = accept.as_ref() {
            return Ok(task.addr);
        }

        // Binding synchronously keeps `listen` usable from non-async callers.
        let std_listener = std::net::TcpListener::bind((self.host, port))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let addr = listener.local_addr()?;
        let listener: SharedListener = Arc::new(Mutex::new(Some(listener)));

        hooks.listening_started(addr);
        let handle = tokio::spawn(accept_loop(
            Arc::clone(&listener),
            Arc::clone(&hooks),
            Arc::clone(&self.next_id),
            Arc::clone(&self.tasks),
        ));
        *accept = Some(AcceptTask {
            handle,
            listener,
            hooks,
            addr,
        });
        Ok(addr)
    }

    /// Closes the listening socket before returning, so the port can be
    /// bound again straight away.
    fn stop_listening(&self) {
        let stopped = lock(&self.accept).take();
        if let Some(task) = stopped {
            drop(lock(&task.listener).take());
            task.handle.abort();
            task.hooks.listening_stopped();
        }
    }

    fn is_listening(&self) -> bool {
        lock(&self.accept)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

async fn accept_loop(
    listener: SharedListener,
    hooks: Arc<dyn ServerHooks>,
    next_id: Arc<AtomicU64>,
    tasks: Arc<ConnectionTasks>,
) {
    loop {
        let accepted = poll_fn(|cx| match lock(&listener).as_ref() {
            Some(bound) => bound.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        })
        .await;

        match accepted {
            Some(Ok((stream, peer))) => {
                let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));
                debug!(%peer, connection = %id, "accepted connection");
                tasks.track(accept_connection(stream, id, &hooks));
            }
            Some(Err(err)) => {
                warn!(error = ?err, "failed to accept connection");
                sleep(ACCEPT_BACKOFF).await;
            }
            None => break,
        }
    }
}

fn accept_connection(stream: TcpStream, id: ConnectionId, hooks: &Arc<dyn ServerHooks>) -> JoinHandle<()> {
    let (connection, outbound) = TcpConnection::<ServerToClient>::new(id);
    // Registered before the first read so no early frame arrives unannounced.
    hooks.client_connected(connection);

    let message_hooks = Arc::clone(hooks);
    let end_hooks = Arc::clone(hooks);
    spawn_driver(
        stream,
        outbound,
        move |message: ClientToServer| message_hooks.message_from_client(id, message),
        move |error: Option<io::Error>| match error {
            None => end_hooks.client_disconnected(id),
            Some(error) => end_hooks.client_exception(id, error.into()),
        },
    )
}

/// Client side of the transport.
#[derive(Default)]
pub struct TcpConnector {
    next_id: AtomicU64,
    tasks: Arc<ConnectionTasks>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait_for_connections(&self, limit: Duration) {
        self.tasks.wait(limit).await;
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        events: ClientEvents,
    ) -> impl Future<Output = Result<ClientConnection, TransportError>> + Send {
        let host = host.to_string();
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let tasks = Arc::clone(&self.tasks);

        async move {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            let (connection, outbound) = TcpConnection::<ClientToServer>::new(id);

            let message_events = events.clone();
            let handle = spawn_driver(
                stream,
                outbound,
                move |message: ServerToClient| {
                    let _ = message_events.send(ClientEvent {
                        connection: id,
                        kind: ClientEventKind::Message(message),
                    });
                },
                move |error: Option<io::Error>| {
                    let kind = match error {
                        None => ClientEventKind::Closed,
                        Some(error) => ClientEventKind::Failed(error.into()),
                    };
                    let _ = events.send(ClientEvent {
                        connection: id,
                        kind,
                    });
                },
            );
            tasks.track(handle);

            Ok(connection as ClientConnection)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct QuietHooks;

    impl ServerHooks for QuietHooks {
        fn client_connected(&self, _connection: crate::transport::ServerConnection) {}
        fn message_from_client(&self, _id: ConnectionId, _message: ClientToServer) {}
        fn client_disconnected(&self, _id: ConnectionId) {}
        fn client_exception(&self, _id: ConnectionId, _error: TransportError) {}
        fn listening_started(&self, _addr: SocketAddr) {}
        fn listening_stopped(&self) {}
    }

    #[tokio::test]
    async fn stop_listening_frees_the_port_before_returning() {
        let acceptor = TcpAcceptor::new(IpAddr::from([127, 0, 0, 1]));
        let hooks: Arc<dyn ServerHooks> = Arc::new(QuietHooks);
        let addr = acceptor.listen(0, Arc::clone(&hooks)).expect("first bind");

        // No await in between: the rebind must not depend on the accept task
        // being polled again.
        acceptor.stop_listening();
        assert!(!acceptor.is_listening());
        let again = acceptor.listen(addr.port(), hooks).expect("rebind same port");

        assert_eq!(again, addr);
        assert!(acceptor.is_listening());
        TcpStream::connect(addr).await.expect("connect after rebind");
    }

    #[tokio::test]
    async fn stopped_acceptor_refuses_connections() {
        let acceptor = TcpAcceptor::new(IpAddr::from([127, 0, 0, 1]));
        let addr = acceptor
            .listen(0, Arc::new(QuietHooks))
            .expect("bind");

        acceptor.stop_listening();

        assert!(TcpStream::connect(addr).await.is_err());
        assert_eq!(acceptor.local_addr(), None);
    }
}
