//! Line tokenizer shared by both consoles and the server's inbound path.
//!
//! A line whose first non-blank character is [`COMMAND_PREFIX`] is a command:
//! the first whitespace-separated token (prefix stripped, case kept) names it
//! and the rest are arguments. Anything else is chat text and is passed along
//! untouched.

use thiserror::Error;

pub const COMMAND_PREFIX: char = '#';

#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    Command { name: &'a str, args: Vec<&'a str> },
    Text(&'a str),
}

pub fn tokenize(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }

    let Some(rest) = trimmed.strip_prefix(COMMAND_PREFIX) else {
        return Input::Text(line.trim_end_matches(['\r', '\n']));
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    Input::Command {
        name,
        args: parts.collect(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("No {what} was provided.")]
    MissingArgument { what: &'static str },
    #[error("Invalid port number: {0}")]
    InvalidPort(String),
    #[error("Unknown command: #{0}")]
    Unknown(String),
}

/// Operator commands understood by the server console.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerCommand {
    Start,
    Stop,
    Close,
    SetPort(u16),
    GetPort,
    Quit,
}

impl ServerCommand {
    pub fn parse(name: &str, args: &[&str]) -> Result<Self, CommandError> {
        match name {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "close" => Ok(Self::Close),
            "setport" => parse_port(args).map(Self::SetPort),
            "getport" => Ok(Self::GetPort),
            "quit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Operator commands understood by the client console.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientCommand {
    Quit,
    Logoff,
    SetHost(String),
    SetPort(u16),
    GetHost,
    GetPort,
    Login(Option<String>),
}

impl ClientCommand {
    pub fn parse(name: &str, args: &[&str]) -> Result<Self, CommandError> {
        match name {
            "quit" => Ok(Self::Quit),
            "logoff" => Ok(Self::Logoff),
            "sethost" => args
                .first()
                .map(|host| Self::SetHost(host.to_string()))
                .ok_or(CommandError::MissingArgument { what: "host name" }),
            "setport" => parse_port(args).map(Self::SetPort),
            "gethost" => Ok(Self::GetHost),
            "getport" => Ok(Self::GetPort),
            "login" => Ok(Self::Login(args.first().map(|id| id.to_string()))),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// What a connected client asked the server to do.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientRequest<'a> {
    Login(Option<&'a str>),
    Logoff,
    Chat(&'a str),
}

impl<'a> ClientRequest<'a> {
    /// Returns `None` for blank frames.
    pub fn parse(text: &'a str) -> Option<Self> {
        match tokenize(text) {
            Input::Empty => None,
            Input::Command { name, args } => match name {
                "login" => Some(Self::Login(args.first().copied())),
                "quit" | "logoff" => Some(Self::Logoff),
                _ => Some(Self::Chat(text)),
            },
            Input::Text(text) => Some(Self::Chat(text)),
        }
    }
}

fn parse_port(args: &[&str]) -> Result<u16, CommandError> {
    let raw = args
        .first()
        .ok_or(CommandError::MissingArgument { what: "port number" })?;
    raw.parse()
        .map_err(|_| CommandError::InvalidPort(raw.to_string()))
}
