//! Client Protocol Engine.
//!
//! [`ClientEngine`] owns the local connection settings and at most one live
//! connection. Operator lines come in through
//! [`ClientEngine::handle_operator_line`]; everything the transport reports
//! (server frames, closes, failures) comes in as [`ClientEvent`]s on the same
//! task, so the engine needs no locking.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    command::{ClientCommand, Input, tokenize},
    console::{Console, Flow, StdoutConsole},
    message::ClientToServer,
    tcp::TcpConnector,
    transport::{ClientConnection, ClientEvent, ClientEventKind, ClientEvents, Connector},
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub login_id: String,
    pub host: String,
    pub port: u16,
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            login_id: args.login.clone(),
            host: args.host.clone(),
            port: args.port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub login_id: String,
}

pub struct ClientEngine<C> {
    connector: C,
    config: ClientConfig,
    connection: Option<ClientConnection>,
    events: ClientEvents,
    console: Arc<dyn Console>,
}

impl<C: Connector> ClientEngine<C> {
    pub fn new(
        config: ClientConfig,
        connector: C,
        events: ClientEvents,
        console: Arc<dyn Console>,
    ) -> Self {
        Self {
            connector,
            config,
            connection: None,
            events,
            console,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn state(&self) -> ClientState {
        ClientState {
            host: self.config.host.clone(),
            port: self.config.port,
            connected: self.is_connected(),
            login_id: self.config.login_id.clone(),
        }
    }

    /// Connects and sends `#login <id>`. A failed attempt leaves the engine
    /// disconnected; the operator can retry with `#login`.
    pub async fn open(&mut self) -> bool {
        let ClientConfig {
            login_id,
            host,
            port,
        } = &self.config;

        let connection = match self.connector.connect(host, *port, self.events.clone()).await {
            Ok(connection) => connection,
            Err(error) => {
                warn!(%host, port, %error, "failed to connect");
                self.console.display(&format!(
                    "Could not connect to {host}:{port}: {error}. Use #login to retry."
                ));
                return false;
            }
        };

        info!(%host, port, connection = %connection.id(), "connected to server");
        if let Err(error) = connection.send(ClientToServer::new(format!("#login {login_id}"))) {
            warn!(%error, "failed to send login");
            self.console
                .display(&format!("Could not log in: {error}. Use #login to retry."));
            if let Err(error) = connection.close() {
                debug!(%error, "failed to close connection");
            }
            return false;
        }

        self.connection = Some(connection);
        true
    }

    pub async fn handle_operator_line(&mut self, line: &str) -> Flow {
        match tokenize(line) {
            Input::Empty => Flow::Continue,
            Input::Text(text) => self.send_chat(text),
            Input::Command { name, args } => match ClientCommand::parse(name, &args) {
                Ok(command) => self.run_command(command, line).await,
                Err(error) => {
                    self.console.display(&error.to_string());
                    Flow::Continue
                }
            },
        }
    }

    async fn run_command(&mut self, command: ClientCommand, line: &str) -> Flow {
        match command {
            ClientCommand::Quit => return self.quit(),
            ClientCommand::Logoff => self.logoff(),
            ClientCommand::SetHost(host) => {
                if self.reject_while_connected("host") {
                    return Flow::Continue;
                }
                self.console.display(&format!("Host set to: {host}."));
                self.config.host = host;
            }
            ClientCommand::SetPort(port) => {
                if self.reject_while_connected("port") {
                    return Flow::Continue;
                }
                self.config.port = port;
                self.console.display(&format!("Port set to: {port}."));
            }
            ClientCommand::GetHost => {
                let message = format!("The host name is {}", self.config.host);
                self.console.display(&message);
            }
            ClientCommand::GetPort => {
                let message = format!("The port number is {}", self.config.port);
                self.console.display(&message);
            }
            ClientCommand::Login(login) => self.login(login.is_some(), line).await,
        }
        Flow::Continue
    }

    fn reject_while_connected(&self, setting: &str) -> bool {
        if self.is_connected() {
            self.console
                .display(&format!("Can't change {setting} when connected."));
        }
        self.is_connected()
    }

    async fn login(&mut self, has_argument: bool, line: &str) {
        if self.connection.is_none() {
            if has_argument {
                let message = format!("Logging in as {}.", self.config.login_id);
                self.console.display(&message);
            }
            self.open().await;
            return;
        }

        if has_argument {
            // The server owns the answer to a second login.
            self.notify_server(line.trim());
        } else {
            self.console.display("Already connected.");
        }
    }

    /// Tells the server, closes the connection and asks the console loop to
    /// exit. Never fails.
    pub fn quit(&mut self) -> Flow {
        self.notify_server("#quit");
        self.close_connection();
        Flow::Exit
    }

    fn logoff(&mut self) {
        if self.connection.is_none() {
            self.console.display("You are not connected.");
            return;
        }
        self.notify_server("#logoff");
        self.close_connection();
        self.console.display("You have logged off.");
    }

    fn send_chat(&mut self, text: &str) -> Flow {
        let Some(connection) = &self.connection else {
            self.console
                .display("You are not connected. Use #login to connect.");
            return Flow::Continue;
        };

        match connection.send(ClientToServer::new(text)) {
            Ok(()) => Flow::Continue,
            Err(error) => {
                warn!(%error, "failed to send chat");
                self.console
                    .display("Could not send message to server.  Terminating client.");
                self.quit()
            }
        }
    }

    fn notify_server(&self, text: &str) {
        let Some(connection) = &self.connection else {
            return;
        };
        if let Err(error) = connection.send(ClientToServer::new(text)) {
            debug!(%error, text, "could not notify server");
        }
    }

    fn close_connection(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if let Err(error) = connection.close() {
            debug!(%error, "failed to close connection");
        }
    }

    pub fn handle_event(&mut self, event: ClientEvent) {
        let current = self.connection.as_ref().map(|c| c.id()) == Some(event.connection);

        match event.kind {
            ClientEventKind::Message(message) => self.console.display(&message.to_string()),
            _ if !current => {
                debug!(connection = %event.connection, "ignoring event from stale connection");
            }
            ClientEventKind::Closed => {
                self.connection = None;
                info!(connection = %event.connection, "connection closed");
                self.console
                    .display("The connection has been closed. Use #login to reconnect.");
            }
            ClientEventKind::Failed(error) => {
                self.connection = None;
                warn!(connection = %event.connection, %error, "connection failed");
                self.console.display(&format!(
                    "ERROR: {error}. The server has shut down. Use #login to reconnect."
                ));
            }
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut engine = ClientEngine::new(
        ClientConfig::from(&args),
        TcpConnector::new(),
        events_tx,
        Arc::new(StdoutConsole),
    );
    engine.open().await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = stdin.next_line() => {
                let flow = match line? {
                    Some(line) => engine.handle_operator_line(&line).await,
                    None => engine.quit(),
                };
                if flow == Flow::Exit {
                    break;
                }
            }
            Some(event) = events_rx.recv() => engine.handle_event(event),
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                engine.quit();
                break;
            }
        }
    }

    engine.connector().wait_for_connections(DRAIN_TIMEOUT).await;
    Ok(())
}
