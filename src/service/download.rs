//! Download handle for completed artifacts

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::error::{ArtifactError, Result};
use crate::model::{ExportJob, JobStatus};

/// An opened, completed artifact ready to be streamed to a client
#[derive(Debug)]
pub struct Download {
    pub filename: String,
    pub content_type: &'static str,
    pub size: u64,
    pub path: PathBuf,
    file: File,
}

impl Download {
    /// Open the artifact of a completed job
    pub async fn open(job: &ExportJob) -> Result<Self> {
        if job.status != JobStatus::Completed {
            return Err(ArtifactError::NotReady {
                job_id: job.id.clone(),
                status: job.status,
            }
            .into());
        }
        let Some(ref artifact) = job.result else {
            return Err(ArtifactError::Missing(job.filename.clone()).into());
        };
        let file = match File::open(&artifact.temp_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::Missing(artifact.temp_path.display().to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok(Self {
            filename: artifact.filename.clone(),
            content_type: job.format.content_type(),
            size,
            path: artifact.temp_path.clone(),
            file,
        })
    }

    /// Value for the `Content-Disposition` header
    pub fn content_disposition(&self) -> String {
        let escaped = self.filename.replace('\\', "\\\\").replace('"', "\\\"");
        format!("attachment; filename=\"{escaped}\"")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_file(self) -> File {
        self.file
    }

    /// Stream of the artifact's bytes
    pub fn into_stream(self) -> ReaderStream<File> {
        ReaderStream::new(self.file)
    }

    /// Copy the whole artifact to `dest`, returning the bytes written
    pub async fn save_to(self, dest: &Path) -> Result<u64> {
        let mut out = File::create(dest).await?;
        let mut file = self.file;
        let copied = tokio::io::copy(&mut file, &mut out).await?;
        tokio::io::AsyncWriteExt::flush(&mut out).await?;
        Ok(copied)
    }
}
