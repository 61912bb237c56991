//! Server Protocol Engine.
//!
//! [`ServerEngine`] interprets the server operator's console lines and every
//! frame a client sends, keeps the `{listening, closed, port}` state, and owns
//! the [`SessionRegistry`]. It is shared as `Arc<ServerEngine>` between the
//! console loop and the transport's per-connection tasks, which reach it
//! through [`ServerHooks`].

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ServerArgs,
    command::{ClientRequest, Input, ServerCommand, tokenize},
    console::{Console, Flow, StdoutConsole},
    message::{ClientToServer, ServerToClient},
    registry::{Session, SessionRegistry},
    tcp::TcpAcceptor,
    transport::{ConnectionId, Listener, ServerConnection, ServerHooks, TransportError},
};

/// Sender name used for chat from a connection that never logged in.
pub const ANONYMOUS: &str = "anonymous";
pub const STOP_WARNING: &str = "WARNING - Server has stopped listening for connections.";
pub const SHUTDOWN_NOTICE: &str = "SERVER SHUTTING DOWN! DISCONNECTING!";
pub const MISSING_LOGIN: &str = "You must provide a login ID.";
pub const LOGIN_REQUIRED: &str = "You must log in with #login <id> before chatting.";

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub unique_logins: bool,
    pub require_login: bool,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            port: args.port,
            unique_logins: args.unique_logins,
            require_login: args.require_login,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerState {
    pub listening: bool,
    pub closed: bool,
    pub port: u16,
}

pub struct ServerEngine {
    registry: SessionRegistry,
    state: Mutex<ServerState>,
    listener: Arc<dyn Listener>,
    console: Arc<dyn Console>,
    unique_logins: bool,
    require_login: bool,
}

impl ServerEngine {
    pub fn new(config: ServerConfig, listener: Arc<dyn Listener>, console: Arc<dyn Console>) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            state: Mutex::new(ServerState {
                listening: false,
                closed: false,
                port: config.port,
            }),
            listener,
            console,
            unique_logins: config.unique_logins,
            require_login: config.require_login,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServerState {
        *self.lock_state()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Starts accepting on the configured port. Leaves the Closed state.
    pub fn listen(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let port = self.lock_state().port;
        // No state lock across the call: the listener reports back through hooks.
        let addr = self
            .listener
            .listen(port, Arc::clone(self) as Arc<dyn ServerHooks>)?;

        let mut state = self.lock_state();
        state.listening = true;
        state.closed = false;
        Ok(addr)
    }

    pub fn handle_operator_line(self: &Arc<Self>, line: &str) -> Flow {
        match tokenize(line) {
            Input::Empty => Flow::Continue,
            Input::Text(text) => {
                let message = ServerToClient::Server {
                    text: text.to_string(),
                };
                self.console.display(&message.to_string());
                self.registry.broadcast(&message);
                Flow::Continue
            }
            Input::Command { name, args } => match ServerCommand::parse(name, &args) {
                Ok(command) => self.run_command(command),
                Err(error) => {
                    self.console.display(&error.to_string());
                    Flow::Continue
                }
            },
        }
    }

    fn run_command(self: &Arc<Self>, command: ServerCommand) -> Flow {
        match command {
            ServerCommand::Start => self.start(),
            ServerCommand::Stop => self.stop(),
            ServerCommand::Close => self.close(),
            ServerCommand::SetPort(port) => self.set_port(port),
            ServerCommand::GetPort => {
                let port = self.lock_state().port;
                self.console.display(&format!("The port number is {port}"));
            }
            ServerCommand::Quit => return self.quit(),
        }
        Flow::Continue
    }

    fn start(self: &Arc<Self>) {
        if self.lock_state().listening {
            self.console
                .display("The server is already listening to clients.");
            return;
        }
        if let Err(error) = self.listen() {
            warn!(%error, "failed to start listening");
            self.console
                .display(&format!("Could not start listening: {error}"));
        }
    }

    fn stop(&self) {
        self.listener.stop_listening();
        self.lock_state().listening = false;
        self.registry.broadcast(&ServerToClient::notice(STOP_WARNING));
    }

    fn close(&self) {
        self.shut_down();
        self.console.display("The server is closed.");
    }

    fn set_port(&self, port: u16) {
        let mut state = self.lock_state();
        if !state.closed {
            drop(state);
            self.console.display("Can't set a port number when open.");
            return;
        }
        state.port = port;
        drop(state);
        self.console.display(&format!("Port set to: {port}."));
    }

    /// Warns every client, closes every connection and stops accepting, then
    /// asks the console loop to exit.
    pub fn quit(&self) -> Flow {
        self.shut_down();
        Flow::Exit
    }

    fn shut_down(&self) {
        self.listener.stop_listening();

        let drained = {
            let mut sessions = self.registry.lock();
            sessions.broadcast(&ServerToClient::notice(SHUTDOWN_NOTICE));
            sessions.drain()
        };
        for session in &drained {
            close_quietly(session.connection());
        }
        info!(connections = drained.len(), "closed all client connections");

        let mut state = self.lock_state();
        state.listening = false;
        state.closed = true;
    }

    pub fn handle_client_message(&self, id: ConnectionId, text: &str) {
        debug!(connection = %id, login = ?self.registry.login_of(id), text, "message received");
        match ClientRequest::parse(text) {
            Some(ClientRequest::Login(login)) => self.login(id, login),
            Some(ClientRequest::Logoff) => {
                if let Some(session) = self.disconnect(id) {
                    close_quietly(session.connection());
                }
            }
            Some(ClientRequest::Chat(text)) => self.chat(id, text),
            None => {}
        }
    }

    fn login(&self, id: ConnectionId, login: Option<&str>) {
        let mut sessions = self.registry.lock();
        let Some(session) = sessions.get(id) else {
            debug!(connection = %id, "login from unregistered connection");
            return;
        };
        let connection = Arc::clone(session.connection());

        if let Some(existing) = session.login() {
            let notice = format!("You are already logged in under the name {existing}.");
            send_quietly(&connection, ServerToClient::notice(notice));
            return;
        }

        let Some(login) = login else {
            drop(sessions);
            info!(connection = %id, "rejecting login without an ID");
            send_quietly(&connection, ServerToClient::notice(MISSING_LOGIN));
            close_quietly(&connection);
            self.disconnect(id);
            return;
        };

        match sessions.bind(id, login, self.unique_logins) {
            Ok(()) => {
                info!(connection = %id, login, "client logged on");
                sessions.broadcast(&ServerToClient::LoggedOn {
                    login: login.to_string(),
                });
            }
            Err(error) => send_quietly(&connection, ServerToClient::notice(error.to_string())),
        }
    }

    fn chat(&self, id: ConnectionId, text: &str) {
        let sessions = self.registry.lock();
        let Some(session) = sessions.get(id) else {
            debug!(connection = %id, "chat from unregistered connection");
            return;
        };

        let sender = match session.login() {
            Some(login) => login.to_string(),
            None if self.require_login => {
                send_quietly(session.connection(), ServerToClient::notice(LOGIN_REQUIRED));
                return;
            }
            None => ANONYMOUS.to_string(),
        };
        sessions.broadcast(&ServerToClient::Chat {
            sender,
            text: text.to_string(),
        });
    }

    /// Drops the connection's session and announces the departure.
    ///
    /// Removal and announcement happen under one registry lock, so concurrent
    /// calls for the same connection announce it exactly once. Returns the
    /// removed session for whichever caller won.
    pub fn disconnect(&self, id: ConnectionId) -> Option<Session> {
        let mut sessions = self.registry.lock();
        let session = sessions.remove(id)?;
        match session.login() {
            Some(login) => {
                sessions.broadcast(&ServerToClient::Disconnected {
                    login: login.to_string(),
                });
                info!(connection = %id, login, "client has disconnected");
            }
            None => info!(connection = %id, "client disconnected before logging in"),
        }
        Some(session)
    }
}

impl ServerHooks for ServerEngine {
    fn client_connected(&self, connection: ServerConnection) {
        info!(connection = %connection.id(), "a new client is attempting to connect");
        self.registry.register(connection);
    }

    fn message_from_client(&self, id: ConnectionId, message: ClientToServer) {
        self.handle_client_message(id, &message.text);
    }

    fn client_disconnected(&self, id: ConnectionId) {
        self.disconnect(id);
    }

    fn client_exception(&self, id: ConnectionId, error: TransportError) {
        warn!(connection = %id, %error, "client connection failed");
        self.disconnect(id);
    }

    fn listening_started(&self, addr: SocketAddr) {
        info!("server listening for connections on {addr}");
        self.lock_state().listening = true;
    }

    fn listening_stopped(&self) {
        info!("server has stopped listening for connections");
        self.lock_state().listening = false;
    }
}

fn send_quietly(connection: &ServerConnection, message: ServerToClient) {
    if let Err(error) = connection.send(message) {
        debug!(connection = %connection.id(), %error, "dropping notice");
    }
}

fn close_quietly(connection: &ServerConnection) {
    if let Err(error) = connection.close() {
        warn!(connection = %connection.id(), %error, "failed to close connection");
    }
}

pub async fn run(args: ServerArgs) -> Result<()> {
    let acceptor = Arc::new(TcpAcceptor::new(args.host));
    let engine = ServerEngine::new(
        ServerConfig::from(&args),
        Arc::clone(&acceptor) as Arc<dyn Listener>,
        Arc::new(StdoutConsole),
    );
    engine
        .listen()
        .with_context(|| format!("failed to listen on {}:{}", args.host, args.port))?;

    run_console_loop(&engine).await?;
    acceptor.wait_for_connections(DRAIN_TIMEOUT).await;

    Ok(())
}

async fn run_console_loop(engine: &Arc<ServerEngine>) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        select! {
            line = stdin.next_line(), if console_open => match line? {
                Some(line) => {
                    if engine.handle_operator_line(&line) == Flow::Exit {
                        break;
                    }
                }
                None => {
                    info!("console closed; serving until interrupted");
                    console_open = false;
                }
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                engine.quit();
                break;
            }
        }
    }

    Ok(())
}
