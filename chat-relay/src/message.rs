use std::{fmt, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Raw operator text forwarded by a client; the server tokenizes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientToServer {
    pub text: String,
}

impl ClientToServer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToClient {
    Chat { sender: String, text: String },
    LoggedOn { login: String },
    Disconnected { login: String },
    Server { text: String },
    Notice { text: String },
}

impl ServerToClient {
    pub fn notice(text: impl Into<String>) -> Self {
        Self::Notice { text: text.into() }
    }
}

impl fmt::Display for ServerToClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat { sender, text } => write!(f, "{sender}: {text}"),
            Self::LoggedOn { login } => write!(f, "{login} has logged on."),
            Self::Disconnected { login } => write!(f, "{login} has disconnected."),
            Self::Server { text } => write!(f, "SERVER MSG> {text}"),
            Self::Notice { text } => f.write_str(text),
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        if let Some(parsed) = decode_line(&line)? {
            return Ok(Some(parsed));
        }
    }
}

/// Decodes one frame; blank lines yield `None` so callers can skip them.
pub fn decode_line<T>(line: &str) -> io::Result<Option<T>>
where
    T: DeserializeOwned,
{
    let trimmed = line.trim_end_matches(LINE_ENDINGS);
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some).map_err(to_io_error)
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_skips_blank_lines_between_frames() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"\r\n\n").await.expect("write blanks");
        write_message(&mut writer, &ClientToServer::new("#login alice"))
            .await
            .expect("write frame");

        let parsed = read_message::<_, ClientToServer>(&mut reader)
            .await
            .expect("read message")
            .expect("expected frame");
        assert_eq!(parsed.text, "#login alice");
    }

    #[test]
    fn server_frames_use_snake_case_tags() {
        let encoded = serde_json::to_string(&ServerToClient::LoggedOn {
            login: "alice".into(),
        })
        .expect("encode");
        assert_eq!(encoded, r#"{"type":"logged_on","login":"alice"}"#);
    }

    #[test]
    fn malformed_line_is_invalid_data() {
        let err = decode_line::<ClientToServer>("not json\n").expect_err("should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn frames_render_as_console_lines() {
        let cases = [
            (
                ServerToClient::Chat {
                    sender: "alice".into(),
                    text: "hi all".into(),
                },
                "alice: hi all",
            ),
            (
                ServerToClient::LoggedOn {
                    login: "bob".into(),
                },
                "bob has logged on.",
            ),
            (
                ServerToClient::Disconnected {
                    login: "bob".into(),
                },
                "bob has disconnected.",
            ),
            (
                ServerToClient::Server {
                    text: "maintenance at noon".into(),
                },
                "SERVER MSG> maintenance at noon",
            ),
            (ServerToClient::notice("You must provide a login ID."), "You must provide a login ID."),
        ];

        for (message, expected) in cases {
            assert_eq!(message.to_string(), expected);
        }
    }
}
