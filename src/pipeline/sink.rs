//! Appendable artifact writer
//!
//! New runs create (or truncate) the artifact. Resumed runs reopen it after
//! checking it against the checkpoint: the file must be at least
//! `last_valid_byte_offset` long and the byte just before that offset must
//! be a record boundary. Anything past the offset (an unflushed tail, a
//! JSON closing bracket written on pause) is truncated away.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::error::{ExportError, Result};
use crate::model::Checkpoint;

use super::encoder::RecordEncoder;

const SINK_BUFFER_CAPACITY: usize = 8 * 1024 * 1024;

pub struct ArtifactSink {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
}

impl ArtifactSink {
    /// Create a fresh artifact, replacing any previous file
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(path).await?;
        debug!(path = %path.display(), "created artifact");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(SINK_BUFFER_CAPACITY, file),
            position: 0,
        })
    }

    /// Reopen an artifact at its checkpoint
    ///
    /// Returns the sink and the number of bytes truncated past the
    /// checkpoint. A missing, short, or misaligned artifact is reported as
    /// structural corruption.
    pub async fn resume(
        path: &Path,
        checkpoint: &Checkpoint,
        encoder: &dyn RecordEncoder,
    ) -> Result<(Self, u64)> {
        let offset = checkpoint.last_valid_byte_offset;
        let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExportError::corruption(
                    path.display(),
                    "artifact is missing",
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if offset == 0 {
            return Err(ExportError::corruption(
                path.display(),
                "checkpoint does not cover the artifact header",
            ));
        }
        if len < offset {
            return Err(ExportError::corruption(
                path.display(),
                format!("artifact has {len} bytes, checkpoint expects {offset}"),
            ));
        }

        file.seek(SeekFrom::Start(offset - 1)).await?;
        let mut boundary = [0u8; 1];
        file.read_exact(&mut boundary).await?;
        if !encoder.is_boundary(boundary[0]) {
            return Err(ExportError::corruption(
                path.display(),
                format!("byte {:#04x} before offset {offset} is not a record boundary", boundary[0]),
            ));
        }

        let truncated = len - offset;
        if truncated > 0 {
            file.set_len(offset).await?;
            file.sync_data().await?;
            if truncated > encoder.footer().len() as u64 {
                warn!(
                    path = %path.display(),
                    truncated,
                    "truncated unflushed tail past checkpoint"
                );
            }
        }
        file.seek(SeekFrom::Start(offset)).await?;

        debug!(path = %path.display(), offset, truncated, "resumed artifact");
        Ok((
            Self {
                path: path.to_path_buf(),
                writer: BufWriter::with_capacity(SINK_BUFFER_CAPACITY, file),
                position: offset,
            },
            truncated,
        ))
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Flush buffered bytes and sync them to disk
    pub async fn flush_durable(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        Ok(())
    }

    /// Logical length of the artifact including buffered bytes
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove an artifact, ignoring one that is already gone
    pub async fn delete(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
