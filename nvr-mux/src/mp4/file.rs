use {
    super::{errors::Mp4Error, writer::{Mp4Stats, Mp4Writer}},
    crate::packet::{MediaPacket, TrackSet},
    chrono::{DateTime, Utc},
    std::path::{Path, PathBuf},
    tokio::{
        fs::File,
        io::{AsyncWriteExt, BufWriter},
    },
    tracing::{debug, warn},
};

/// Samples are small; batch them into larger writes.
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// A finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Summary {
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stats: Mp4Stats,
}

/// An `.mp4` being written under `<name>.partial`, renamed on finish.
pub struct Mp4File {
    final_path: PathBuf,
    partial_path: PathBuf,
    started_at: DateTime<Utc>,
    writer: Mp4Writer<BufWriter<File>>,
}

fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

impl Mp4File {
    pub async fn create(final_path: impl Into<PathBuf>, tracks: &TrackSet) -> Result<Self, Mp4Error> {
        let final_path = final_path.into();
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial_path = partial_path(&final_path);
        let file = BufWriter::with_capacity(WRITE_BUFFER_SIZE, File::create(&partial_path).await?);
        let writer = match Mp4Writer::new(tracks, file).await {
            Ok(writer) => writer,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Err(e);
            }
        };
        debug!(path = %partial_path.display(), "Opened MP4 file");

        Ok(Self {
            final_path,
            partial_path,
            started_at: Utc::now(),
            writer,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    #[must_use]
    pub fn tracks(&self) -> TrackSet {
        self.writer.tracks()
    }

    pub async fn write_packet(&mut self, packet: &MediaPacket) -> Result<(), Mp4Error> {
        self.writer.write_packet(packet).await
    }

    /// Complete the file and move it to its final name.
    ///
    /// A file without samples is removed and `None` returned. A failed finish
    /// removes the partial file too.
    pub async fn finish(self) -> Result<Option<Mp4Summary>, Mp4Error> {
        if !self.writer.has_samples() {
            drop(self.writer);
            tokio::fs::remove_file(&self.partial_path).await?;
            debug!(path = %self.partial_path.display(), "Removed empty MP4 file");
            return Ok(None);
        }

        let (stats, file) = match self.writer.finish().await {
            Ok(finished) => finished,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&self.partial_path).await {
                    warn!(path = %self.partial_path.display(), error = %rm, "Failed to remove partial MP4 file");
                }
                return Err(e);
            }
        };
        let mut file = file;
        file.flush().await?;
        let file = file.into_inner();
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.partial_path, &self.final_path).await?;

        Ok(Some(Mp4Summary {
            path: self.final_path,
            started_at: self.started_at,
            ended_at: Utc::now(),
            stats,
        }))
    }

    /// Drop the file without finishing it.
    pub async fn abandon(self) {
        drop(self.writer);
        if let Err(e) = tokio::fs::remove_file(&self.partial_path).await {
            warn!(path = %self.partial_path.display(), error = %e, "Failed to remove partial MP4 file");
        }
    }
}
