use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{
        ClientPacket, Credentials, DEFAULT_MAX_FRAME_LEN, Response, SearchQuery, ServerPacket,
        UserInfo, read_packet, write_packet,
    },
    store::Message,
};

/// A line typed at the client prompt, already mapped to its wire packet.
#[derive(Debug, PartialEq)]
pub struct ClientCommand(pub ClientPacket);

impl ClientCommand {
    /// Parses one non-empty input line.
    ///
    /// Lines starting with a known `/command` become that request; anything
    /// else is sent as chat.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            bail!("empty command");
        }

        let mut parts = trimmed.split_whitespace();
        let head = parts.next().unwrap_or_default().to_lowercase();
        let args: Vec<&str> = parts.collect();

        let packet = match head.as_str() {
            "/register" => ClientPacket::Register(credentials("/register", &args)?),
            "/login" => ClientPacket::Login(credentials("/login", &args)?),
            "/history" => match args.as_slice() {
                [] => ClientPacket::History { limit: None },
                [limit] => ClientPacket::History {
                    limit: Some(
                        limit
                            .parse()
                            .map_err(|_| anyhow!("history limit must be a number, got {limit:?}"))?,
                    ),
                },
                _ => bail!("usage: /history [n]"),
            },
            "/search" => ClientPacket::Search(search_query(&args)?),
            "/users" => ClientPacket::Users {},
            "/quit" => ClientPacket::Quit {},
            _ => ClientPacket::Chat {
                content: trimmed.to_string(),
            },
        };
        Ok(Self(packet))
    }

    pub fn is_quit(&self) -> bool {
        matches!(self.0, ClientPacket::Quit {})
    }
}

fn credentials(command: &str, args: &[&str]) -> Result<Credentials> {
    match args {
        [username, password] => Ok(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }),
        _ => Err(anyhow!("usage: {command} <username> <password>")),
    }
}

fn search_query(args: &[&str]) -> Result<SearchQuery> {
    let mut query = SearchQuery::default();
    let mut words = Vec::new();
    for arg in args {
        if let Some(username) = arg.strip_prefix("user=") {
            query.username = Some(username.to_string());
        } else if let Some(from) = arg.strip_prefix("from=") {
            query.from = Some(timestamp(from)?);
        } else if let Some(to) = arg.strip_prefix("to=") {
            query.to = Some(timestamp(to)?);
        } else {
            words.push(*arg);
        }
    }
    if !words.is_empty() {
        query.query = Some(words.join(" "));
    }
    Ok(query)
}

fn timestamp(text: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("expected an RFC 3339 timestamp, got {text:?}"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Where a rendered line goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Out(String),
    Err(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DataItem {
    Message(Message),
    User(UserInfo),
}

pub fn render(packet: ServerPacket) -> Vec<Line> {
    match packet {
        ServerPacket::System { message } => vec![Line::Out(format!("*** {message}"))],
        ServerPacket::Broadcast(broadcast) => {
            vec![Line::Out(format!("<{}> {}", broadcast.username, broadcast.content))]
        }
        ServerPacket::Response(Response {
            success: false,
            message,
            ..
        }) => vec![Line::Err(format!("!!! {message}"))],
        ServerPacket::Response(Response { message, data, .. }) => {
            let mut lines = vec![Line::Out(format!("ok: {message}"))];
            lines.extend(data.map(render_data).unwrap_or_default().into_iter().map(Line::Out));
            lines
        }
    }
}

fn render_data(data: Value) -> Vec<String> {
    let Ok(items) = serde_json::from_value::<Vec<DataItem>>(data) else {
        return Vec::new();
    };
    items
        .into_iter()
        .map(|item| match item {
            DataItem::Message(message) => format!(
                "[{}] <{}> {}",
                message.timestamp.format("%H:%M:%S"),
                message.username,
                message.content
            ),
            DataItem::User(user) => format!("- {}", user.username),
        })
        .collect()
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    let mut incoming = tokio::spawn(print_incoming(reader));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        select! {
            finished = &mut incoming => {
                finished.context("server reader task failed")??;
                write_stdout("*** server closed the connection").await?;
                return Ok(());
            }
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 || handle_stdin_input(&input, &mut writer).await? {
                    break;
                }
                input.clear();
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    // Let the server answer and close before exiting.
    shutdown_connection(&mut writer).await;
    incoming.await.context("server reader task failed")??;
    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn print_incoming(mut reader: BufReader<OwnedReadHalf>) -> Result<()> {
    while let Some(packet) = read_packet::<_, ServerPacket>(&mut reader, DEFAULT_MAX_FRAME_LEN).await? {
        print(render(packet)).await?;
    }
    Ok(())
}

/// Sends the typed command. Returns `true` once `/quit` has been sent.
async fn handle_stdin_input(input: &str, writer: &mut OwnedWriteHalf) -> Result<bool> {
    let text = input.trim_end();
    if text.trim().is_empty() {
        return Ok(false);
    }

    let command = match ClientCommand::parse(text) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(false);
        }
    };

    if command.is_quit() {
        write_stdout("*** leaving chat").await?;
    }
    write_packet(writer, &command.0).await?;
    Ok(command.is_quit())
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn print(lines: Vec<Line>) -> io::Result<()> {
    for line in lines {
        match line {
            Line::Out(text) => write_stdout(&text).await?,
            Line::Err(text) => write_stderr(&text).await?,
        }
    }
    Ok(())
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
