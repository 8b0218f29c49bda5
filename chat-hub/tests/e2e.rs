use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-hub");
    let data_dir = TempDir::new()?;
    let server = HubProcess::start(&binary, data_dir.path()).await?;

    let mut alice = Participant::join(&binary, &server.addr, "alice").await?;
    alice.say("/register alice wonderland").await?;
    alice
        .expect(&[
            "ok: registered and logged in as \"alice\"",
            "*** alice joined the chat",
        ])
        .await?;

    let mut bob = Participant::join(&binary, &server.addr, "bob").await?;
    bob.say("/register bob builder").await?;
    bob.expect(&[
        "ok: registered and logged in as \"bob\"",
        "*** bob joined the chat",
    ])
    .await?;
    alice.expect(&["*** bob joined the chat"]).await?;

    alice.say("Hello from Alice").await?;
    bob.expect(&["<alice> Hello from Alice"]).await?;
    alice.expect(&["<alice> Hello from Alice"]).await?;

    bob.say("/users").await?;
    bob.expect(&["ok: 2 user(s) online", "- alice", "- bob"])
        .await?;

    alice.say("/quit").await?;
    alice.expect(&["*** leaving chat", "ok: goodbye"]).await?;
    bob.expect(&["*** alice left the chat"]).await?;
    alice.exited().await?;

    bob.say("/quit").await?;
    bob.expect(&["*** leaving chat"]).await?;
    bob.exited().await?;

    server.stop().await;
    assert!(data_dir.path().join("users.json").exists());
    Ok(())
}

/// A `chat-hub serve` child bound to an ephemeral port.
struct HubProcess {
    child: Child,
    addr: String,
    logs: JoinHandle<()>,
}

impl HubProcess {
    async fn start(binary: &Path, data_dir: &Path) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["serve", "--listen", "127.0.0.1:0", "--data-dir"])
            .arg(data_dir)
            .env("RUST_LOG", "info")
            .env("NO_COLOR", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn server")?;
        let mut lines = BufReader::new(child.stdout.take().context("server stdout not piped")?).lines();

        let addr = loop {
            let line = next_line(&mut lines, "server banner").await?;
            let addr = line
                .split_once("server listening on ")
                .and_then(|(_, rest)| rest.split_whitespace().next());
            if let Some(addr) = addr {
                break addr.to_string();
            }
        };

        // Keep the pipe drained so server logging never blocks.
        let logs = tokio::spawn(async move {
            while let Ok(Some(_)) = lines.next_line().await {}
        });
        Ok(Self { child, addr, logs })
    }

    async fn stop(mut self) {
        let _ = self.child.kill().await;
        let _ = self.logs.await;
    }
}

/// A `chat-hub client` child driven through its stdin and stdout.
struct Participant {
    name: &'static str,
    child: Child,
    input: ChildStdin,
    output: Lines<BufReader<ChildStdout>>,
}

impl Participant {
    /// Connects a client and consumes the server's welcome notice.
    async fn join(binary: &Path, addr: &str, name: &'static str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["client", "--server", addr])
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn client for {name}"))?;
        let input = child.stdin.take().context("client stdin not piped")?;
        let output = BufReader::new(child.stdout.take().context("client stdout not piped")?).lines();

        let mut participant = Self {
            name,
            child,
            input,
            output,
        };
        let welcome = participant.hear().await?;
        ensure!(
            welcome.starts_with("*** Welcome"),
            "{name} expected a welcome notice, got {welcome:?}"
        );
        Ok(participant)
    }

    async fn say(&mut self, line: &str) -> Result<()> {
        self.input.write_all(format!("{line}\n").as_bytes()).await?;
        self.input.flush().await?;
        Ok(())
    }

    async fn hear(&mut self) -> Result<String> {
        next_line(&mut self.output, self.name).await
    }

    /// Asserts the next lines on this client's screen, in order.
    async fn expect(&mut self, lines: &[&str]) -> Result<()> {
        for expected in lines {
            let line = self.hear().await?;
            ensure!(
                line == *expected,
                "{} expected {expected:?}, got {line:?}",
                self.name
            );
        }
        Ok(())
    }

    async fn exited(mut self) -> Result<()> {
        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .with_context(|| format!("{} client did not exit", self.name))??;
        ensure!(status.success(), "{} client exited with {status}", self.name);
        Ok(())
    }
}

async fn next_line(lines: &mut Lines<BufReader<ChildStdout>>, who: &str) -> Result<String> {
    match timeout(READ_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => bail!("{who}: output closed"),
        Ok(Err(err)) => Err(err).context(format!("{who}: failed to read output")),
        Err(_) => bail!("{who}: timed out waiting for output"),
    }
}
