//! Newline-delimited JSON over the engine's Unix control socket.

use super::{Command, CommandChannel, CommandSink, PushFrame};
use async_trait::async_trait;
use mf_types::ControlError;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// Socket file name inside the engine working directory.
pub const COMMAND_SOCKET: &str = "command.sock";

const FRAME_BUFFER: usize = 64;

pub struct UnixCommandChannel {
    path: PathBuf,
}

impl UnixCommandChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<work_dir>/command.sock`.
    pub fn in_dir(work_dir: &Path) -> Self {
        Self::new(work_dir.join(COMMAND_SOCKET))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct UnixSink {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl CommandSink for UnixSink {
    async fn send(&mut self, command: Command) -> Result<(), ControlError> {
        let mut line =
            serde_json::to_vec(&command).map_err(|e| ControlError::Protocol(e.to_string()))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| ControlError::Connect(format!("write command: {e}")))
    }
}

#[async_trait]
impl CommandChannel for UnixCommandChannel {
    async fn open(&self) -> Result<(Box<dyn CommandSink>, mpsc::Receiver<PushFrame>), ControlError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| ControlError::Connect(format!("{}: {e}", self.path.display())))?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<PushFrame>(&line) {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "skipping unknown control frame"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "control socket read failed");
                        break;
                    }
                }
            }
        });

        Ok((Box::new(UnixSink { writer }), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn frames_and_commands_cross_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let channel = UnixCommandChannel::in_dir(dir.path());
        let listener = UnixListener::bind(channel.path()).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            w.write_all(b"{\"type\":\"bogus\"}\n\n{\"type\":\"log\",\"level\":\"info\",\"message\":\"up\"}\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(r).lines();
            lines.next_line().await.unwrap().unwrap()
        });

        let (mut sink, mut frames) = channel.open().await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert!(matches!(frame, PushFrame::Log(ref l) if l.message == "up"));

        sink.send(Command::UrlTest {
            group: "proxy".into(),
        })
        .await
        .unwrap();
        let received = server.await.unwrap();
        assert_eq!(received, r#"{"command":"url_test","group":"proxy"}"#);
    }

    #[tokio::test]
    async fn missing_socket_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let channel = UnixCommandChannel::in_dir(dir.path());
        assert!(matches!(channel.open().await, Err(ControlError::Connect(_))));
    }
}
