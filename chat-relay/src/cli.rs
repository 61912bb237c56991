use std::net::IpAddr;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_PORT: u16 = 5555;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server and its operator console.
    Server(ServerArgs),
    /// Connect to a relay server and chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to accept connections on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on at startup. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Refuse a login ID that another connection already uses.
    #[arg(long)]
    pub unique_logins: bool,

    /// Refuse chat text from connections that have not sent `#login`.
    #[arg(long)]
    pub require_login: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Login ID announced to the server; fixed for the life of the client.
    #[arg(long)]
    pub login: String,

    /// Server host name.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Server port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::try_parse_from(["chat_relay", "server"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.host, IpAddr::from([0, 0, 0, 0]));
        assert!(!args.unique_logins);
        assert!(!args.require_login);
    }

    #[test]
    fn client_requires_a_login() {
        assert!(Cli::try_parse_from(["chat_relay", "client"]).is_err());

        let cli = Cli::try_parse_from([
            "chat_relay", "client", "--login", "alice", "--port", "7000",
        ])
        .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.login, "alice");
        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, 7000);
    }
}
