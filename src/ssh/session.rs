// ABOUTME: Single-use execution context over an established connection.
// ABOUTME: Runs one command and collects its output and exit status.

use super::error::{Error, Result};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// How the remote process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Code(u32),
    Signal(String),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit status {}", code),
            ExitStatus::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Which remote streams end up in the captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// stdout and stderr interleaved in arrival order.
    Combined,
    /// stdout only; stderr is discarded.
    Stdout,
}

/// Captured output of a finished command.
///
/// The output is kept even when the command failed, so callers can inspect
/// partial output alongside the failure.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub output: Vec<u8>,
    pub exit: ExitStatus,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit.success()
    }

    /// `Some` exactly when the command did not exit with status 0.
    pub fn exit_error(&self) -> Option<Error> {
        (!self.success()).then(|| Error::Exit(self.exit.clone()))
    }

    pub fn into_output(self) -> Result<Vec<u8>> {
        match self.exit_error() {
            Some(err) => Err(err),
            None => Ok(self.output),
        }
    }
}

/// Accumulates channel messages until the command has finished.
#[derive(Debug)]
struct OutputCollector {
    capture: Capture,
    output: Vec<u8>,
    exit: Option<ExitStatus>,
    got_eof: bool,
}

impl OutputCollector {
    fn new(capture: Capture) -> Self {
        Self {
            capture,
            output: Vec::new(),
            exit: None,
            got_eof: false,
        }
    }

    /// Feed one message. Returns true once no more messages are needed.
    fn feed(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                self.output.extend_from_slice(&data);
            }
            ChannelMsg::ExtendedData { data, ext } => {
                // ext 1 is stderr
                if ext == 1 && self.capture == Capture::Combined {
                    self.output.extend_from_slice(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit = Some(ExitStatus::Code(exit_status));
                return self.got_eof;
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                self.exit = Some(ExitStatus::Signal(format!("{:?}", signal_name)));
                return self.got_eof;
            }
            ChannelMsg::Eof => {
                self.got_eof = true;
                return self.exit.is_some();
            }
            ChannelMsg::Close => return true,
            _ => {}
        }
        false
    }

    fn finish(self) -> Result<CommandResult> {
        // No exit status means the channel died underneath the command.
        let exit = self.exit.ok_or(Error::ChannelClosed)?;
        Ok(CommandResult {
            output: self.output,
            exit,
        })
    }
}

/// A session channel. Consumed by every operation so it cannot be reused.
pub struct Session {
    channel: Channel<Msg>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel.id())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(channel: Channel<Msg>) -> Self {
        Self { channel }
    }

    /// Run a command to completion and close the channel.
    pub async fn run(mut self, command: &str, capture: Capture) -> Result<CommandResult> {
        let result = self.run_inner(command, capture).await;
        self.close().await;
        result
    }

    async fn run_inner(&mut self, command: &str, capture: Capture) -> Result<CommandResult> {
        tracing::debug!(command, "executing remote command");
        self.channel.exec(true, command).await?;

        let mut collector = OutputCollector::new(capture);
        while let Some(msg) = self.channel.wait().await {
            if collector.feed(msg) {
                break;
            }
        }
        collector.finish()
    }

    /// Start a command and hand its stdin/stdout over as a byte stream.
    pub(crate) async fn exec_stream(
        self,
        command: &str,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + use<>> {
        tracing::debug!(command, "executing remote command with streamed I/O");
        if let Err(e) = self.channel.exec(true, command).await {
            self.close().await;
            return Err(e.into());
        }
        Ok(self.channel.into_stream())
    }

    /// Close the channel. Failures mean the connection is already gone.
    pub async fn close(self) {
        if let Err(e) = self.channel.close().await {
            tracing::debug!(error = %e, "session close failed");
        }
    }
}
