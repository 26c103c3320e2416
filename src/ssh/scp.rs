// ABOUTME: Client side of the SCP copy sub-protocol for uploading a single file.
// ABOUTME: Speaks to a remote `scp -t` sink over any bidirectional byte stream.

use super::error::{Error, Result};
use super::shell;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SCP protocol status codes.
const SCP_OK: u8 = 0;
const SCP_WARNING: u8 = 1;
const SCP_ERROR: u8 = 2;

/// Upper bound on a status message line from the sink.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Permissions used when the caller does not pick any.
pub const DEFAULT_MODE: u32 = 0o644;

/// Where a file lands on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub directory: String,
    pub file_name: String,
}

impl RemoteTarget {
    /// Split a remote path into the sink directory and the file name.
    pub fn parse(remote_path: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Transfer {
            remote_path: remote_path.to_string(),
            reason: reason.to_string(),
        };

        if remote_path.is_empty() || remote_path.ends_with('/') {
            return Err(invalid("remote path must name a file"));
        }
        if remote_path.contains('\n') {
            return Err(invalid("remote path must not contain newlines"));
        }

        let (directory, file_name) = match remote_path.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => (".", remote_path),
        };
        if file_name == "." || file_name == ".." {
            return Err(invalid("remote path must name a file"));
        }

        Ok(Self {
            directory: directory.to_string(),
            file_name: file_name.to_string(),
        })
    }

    /// Remote command that starts the sink in the target directory.
    ///
    /// A leading `~` stays unquoted so the remote shell expands it to the
    /// login user's home directory.
    pub fn sink_command(&self) -> String {
        let directory = match self.directory.as_str() {
            "~" => "~".to_string(),
            dir => match dir.strip_prefix("~/") {
                Some("") => "~/".to_string(),
                Some(rest) => format!("~/{}", shell::quote(rest)),
                None => shell::quote(dir),
            },
        };
        format!("scp -qt {}", directory)
    }
}

fn file_header(mode: u32, len: u64, name: &str) -> String {
    format!("C{:04o} {} {}\n", mode & 0o7777, len, name)
}

/// Send one file to a sink that is already running on `stream`.
pub async fn send_file<S, R>(
    stream: &mut S,
    target: &RemoteTarget,
    mode: u32,
    len: u64,
    content: &mut R,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let remote_path = format!("{}/{}", target.directory, target.file_name);
    let fail = |reason: String| Error::Transfer {
        remote_path: remote_path.clone(),
        reason,
    };

    read_ack(stream).await.map_err(&fail)?;

    stream
        .write_all(file_header(mode, len, &target.file_name).as_bytes())
        .await?;
    stream.flush().await?;
    read_ack(stream).await.map_err(&fail)?;

    let copied = tokio::io::copy(&mut content.take(len), stream).await?;
    if copied != len {
        return Err(fail(format!(
            "local content ended after {} of {} bytes",
            copied, len
        )));
    }
    stream.write_all(&[SCP_OK]).await?;
    stream.flush().await?;
    read_ack(stream).await.map_err(&fail)?;

    stream.shutdown().await?;
    tracing::debug!(remote_path = %remote_path, bytes = len, "scp transfer complete");
    Ok(())
}

/// Read one status byte, plus its message line for warnings and errors.
async fn read_ack<S: AsyncRead + Unpin>(stream: &mut S) -> std::result::Result<(), String> {
    let mut code = [0u8; 1];
    match stream.read(&mut code).await {
        Ok(0) => return Err("remote closed the stream before acknowledging".to_string()),
        Ok(_) => {}
        Err(e) => return Err(format!("failed to read acknowledgement: {}", e)),
    }

    match code[0] {
        SCP_OK => Ok(()),
        SCP_WARNING | SCP_ERROR => {
            let message = read_line(stream).await;
            let level = if code[0] == SCP_WARNING { "warning" } else { "error" };
            Err(format!("remote {}: {}", level, message.trim_end()))
        }
        other => Err(format!("unexpected acknowledgement byte {:#04x}", other)),
    }
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while line.len() < MAX_LINE_LENGTH {
        match stream.read(&mut byte).await {
            Ok(1) if byte[0] != b'\n' => line.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&line).into_owned()
}
