// ABOUTME: Local staging of content for remote file transfer.
// ABOUTME: The staged temporary file is removed when the staging value is dropped, on every path.

use super::error::{Error, Result};
use super::scp::{self, RemoteTarget};
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWrite};

const TEMP_PREFIX: &str = "machine-ssh-";

/// Content written to a scoped local temporary file.
#[derive(Debug)]
pub struct StagedFile {
    file: NamedTempFile,
    len: u64,
}

impl StagedFile {
    /// Stage `content` in the system temporary directory.
    pub fn stage(content: &[u8]) -> Result<Self> {
        Self::stage_in(std::env::temp_dir(), content)
    }

    pub fn stage_in(dir: impl AsRef<Path>, content: &[u8]) -> Result<Self> {
        Self::stage_reader(dir, content)
    }

    /// Stage everything `reader` yields. If reading or writing fails midway
    /// the partially written file is removed before returning.
    pub fn stage_reader(dir: impl AsRef<Path>, mut reader: impl Read) -> Result<Self> {
        // Deletion is bound to `file` from this point on.
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(Error::TempFile)?;

        let len = std::io::copy(&mut reader, &mut file).map_err(Error::TempFile)?;
        file.flush().map_err(Error::TempFile)?;

        tracing::trace!(path = %file.path().display(), bytes = len, "staged transfer content");
        Ok(Self { file, len })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    async fn open(&self) -> Result<tokio::fs::File> {
        let std_file = self.file.reopen().map_err(Error::TempFile)?;
        Ok(tokio::fs::File::from_std(std_file))
    }
}

/// Copy staged content to a running sink, consuming (and so deleting) the staged file.
pub async fn copy_staged<S>(
    staged: StagedFile,
    stream: &mut S,
    target: &RemoteTarget,
    mode: u32,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut content = staged.open().await?;
    scp::send_file(stream, target, mode, staged.len(), &mut content).await
}
