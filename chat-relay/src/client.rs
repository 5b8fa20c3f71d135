use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    codec::{CodecError, Frame, FrameCodec},
    message::Message,
};

type Frames = FramedRead<OwnedReadHalf, FrameCodec>;
type Sink = FramedWrite<OwnedWriteHalf, FrameCodec>;

const USAGE: &str = "usage: /msg <number> <text> | /who | /quit";

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut frames, mut sink) = establish_connection(&args).await?;
    send_message(
        &mut sink,
        Message::ConnectionRequest {
            display_name: args.name.clone(),
        },
    )
    .await?;

    let mut roster = Roster::default();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let connected = run_client_loop(&mut frames, &mut sink, &mut stdin, &mut input, &mut roster).await?;
    if connected {
        leave(&mut sink).await;
    }

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(Frames, Sink)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((
        FramedRead::new(reader, FrameCodec),
        FramedWrite::new(writer, FrameCodec),
    ))
}

async fn send_message(sink: &mut Sink, message: Message) -> Result<()> {
    sink.send(Frame::from(message))
        .await
        .context("failed to send frame to relay")
}

/// Returns whether the relay connection is still open when the loop ends.
async fn run_client_loop(
    frames: &mut Frames,
    sink: &mut Sink,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    roster: &mut Roster,
) -> Result<bool> {
    loop {
        input.clear();
        select! {
            server_frame = frames.next() => {
                if !handle_server_frame(server_frame, roster).await? {
                    return Ok(false);
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, sink, roster).await? {
                    return Ok(true);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                return Ok(true);
            }
        }
    }
}

async fn handle_server_frame(
    frame: Option<Result<Frame, CodecError>>,
    roster: &mut Roster,
) -> Result<bool> {
    let Some(frame) = frame else {
        write_stdout("*** relay closed the connection").await?;
        return Ok(false);
    };

    match Message::try_from(frame.context("failed to read frame from relay")?) {
        Ok(message) => {
            roster.apply(&message);
            render_server_message(message).await?;
        }
        Err(err) => warn!(error = %err, "ignoring invalid message from relay"),
    }
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    sink: &mut Sink,
    roster: &Roster,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    match ClientInput::parse(input) {
        ClientInput::Empty => {}
        ClientInput::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        ClientInput::Who => write_stdout(&roster.describe()).await?,
        ClientInput::Direct { target, text } => match roster.direct(&target, text) {
            Ok(message) => send_message(sink, message).await?,
            Err(reason) => write_stderr(&format!("!!! {reason}")).await?,
        },
        ClientInput::Invalid => write_stderr(USAGE).await?,
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn leave(sink: &mut Sink) {
    if let Err(error) = send_message(sink, Message::DisconnectRequest).await {
        warn!(?error, "failed to send disconnect request");
    }
    if let Err(error) = sink.get_mut().shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_server_message(message: Message) -> io::Result<()> {
    match message {
        Message::ConnectionAccepted { identifier, roster } => {
            write_stdout(&format!("*** connected as {identifier}")).await?;
            if roster.is_empty() {
                return Ok(());
            }
            write_stdout(&format!("*** currently online: {}", roster.join(", "))).await
        }
        Message::UserJoined { identifier } => {
            write_stdout(&format!("*** {identifier} joined the chat")).await
        }
        Message::UserLeft { identifier } => {
            write_stdout(&format!("*** {identifier} left the chat")).await
        }
        Message::Direct { sender, text, .. } => write_stdout(&format!("<{sender}> {text}")).await,
        Message::ConnectionRequest { .. } | Message::DisconnectRequest => Ok(()),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

/// One line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum ClientInput {
    Empty,
    Direct { target: String, text: String },
    Who,
    Quit,
    Invalid,
}

impl ClientInput {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ClientInput::Empty;
        }

        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match command.to_ascii_lowercase().as_str() {
            "/quit" => ClientInput::Quit,
            "/who" => ClientInput::Who,
            "/msg" => match rest.trim_start().split_once(char::is_whitespace) {
                Some((target, text)) if !text.trim().is_empty() => ClientInput::Direct {
                    target: target.to_string(),
                    text: text.trim().to_string(),
                },
                _ => ClientInput::Invalid,
            },
            _ => ClientInput::Invalid,
        }
    }
}

/// What this client knows about itself and the other participants.
#[derive(Debug, Default)]
struct Roster {
    me: Option<String>,
    others: Vec<String>,
}

impl Roster {
    fn apply(&mut self, message: &Message) {
        match message {
            Message::ConnectionAccepted { identifier, roster } => {
                self.me = Some(identifier.clone());
                self.others = roster.clone();
            }
            Message::UserJoined { identifier } => {
                if !self.others.contains(identifier) {
                    self.others.push(identifier.clone());
                }
            }
            Message::UserLeft { identifier } => self.others.retain(|other| other != identifier),
            _ => {}
        }
    }

    /// Resolves `target` (a sequence number or a full identifier) and builds
    /// the message to send.
    fn direct(&self, target: &str, text: String) -> Result<Message, String> {
        let sender = self.me.clone().ok_or("not connected yet")?;
        let prefix = format!("{target} - ");
        let recipient = self
            .others
            .iter()
            .find(|other| *other == target || other.starts_with(&prefix))
            .ok_or_else(|| format!("nobody online as {target}"))?;

        Ok(Message::Direct {
            sender,
            recipient: recipient.clone(),
            text,
        })
    }

    fn describe(&self) -> String {
        if self.others.is_empty() {
            "*** nobody else is online".to_string()
        } else {
            format!("*** currently online: {}", self.others.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(ClientInput::parse("   \n"), ClientInput::Empty);
        assert_eq!(ClientInput::parse("/quit\n"), ClientInput::Quit);
        assert_eq!(ClientInput::parse("/WHO"), ClientInput::Who);
        assert_eq!(
            ClientInput::parse("/msg 2 hola  mundo \n"),
            ClientInput::Direct {
                target: "2".into(),
                text: "hola  mundo".into()
            }
        );
        assert_eq!(ClientInput::parse("/msg 2"), ClientInput::Invalid);
        assert_eq!(ClientInput::parse("/msg 2   "), ClientInput::Invalid);
        assert_eq!(ClientInput::parse("hello"), ClientInput::Invalid);
    }

    #[test]
    fn roster_tracks_joins_and_leaves() {
        let mut roster = Roster::default();
        roster.apply(&Message::ConnectionAccepted {
            identifier: "3 - Carla".into(),
            roster: vec!["1 - Ana".into(), "2 - Beto".into()],
        });
        roster.apply(&Message::UserJoined {
            identifier: "4 - Dani".into(),
        });
        roster.apply(&Message::UserLeft {
            identifier: "1 - Ana".into(),
        });

        assert_eq!(roster.me.as_deref(), Some("3 - Carla"));
        assert_eq!(roster.others, vec!["2 - Beto".to_string(), "4 - Dani".to_string()]);
        assert_eq!(roster.describe(), "*** currently online: 2 - Beto, 4 - Dani");
    }

    #[test]
    fn direct_resolves_sequence_numbers() {
        let mut roster = Roster::default();
        roster.apply(&Message::ConnectionAccepted {
            identifier: "1 - Ana".into(),
            roster: vec![],
        });
        roster.apply(&Message::UserJoined {
            identifier: "12 - Beto".into(),
        });

        assert_eq!(
            roster.direct("12", "hola".into()),
            Ok(Message::Direct {
                sender: "1 - Ana".into(),
                recipient: "12 - Beto".into(),
                text: "hola".into(),
            })
        );
        // "1" must not match "12 - Beto".
        assert!(roster.direct("1", "hola".into()).is_err());
    }

    #[test]
    fn direct_requires_a_confirmed_identity() {
        let roster = Roster::default();
        assert_eq!(
            roster.direct("1", "hola".into()),
            Err("not connected yet".to_string())
        );
    }
}
