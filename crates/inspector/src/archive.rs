use chrono::{DateTime, Local};
use schema::Camera;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Suffixed names tried when a timestamped name is already taken.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Writes inspected images to `<root>/<YYYYMMDD>/<line>/<ROLE>_<YYYYMMDD_HHMMSS_mmm>.jpg`.
/// Images that land on the same millisecond get `_1`, `_2`, ... before the extension.
#[derive(Debug, Clone)]
pub struct CaptureArchive {
    root: PathBuf,
}

impl CaptureArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, line: &str, camera: Camera, at: &DateTime<Local>) -> PathBuf {
        self.root
            .join(at.format("%Y%m%d").to_string())
            .join(line)
            .join(format!(
                "{}_{}.jpg",
                camera.role(),
                at.format("%Y%m%d_%H%M%S_%3f")
            ))
    }

    pub async fn save(
        &self,
        line: &str,
        camera: Camera,
        image: &[u8],
        at: &DateTime<Local>,
    ) -> io::Result<PathBuf> {
        let base = self.path_for(line, camera, at);
        if let Some(dir) = base.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut path = base.clone();
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(image).await?;
                    file.flush().await?;
                    tracing::debug!(path = %path.display(), bytes = image.len(), "Image archived");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    path = suffixed(&base, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free archive name next to {}", base.display()),
        ))
    }

    /// Saves an image, turning a failure into a missing path.
    pub async fn save_or_log(
        &self,
        line: &str,
        camera: Camera,
        image: &[u8],
        at: &DateTime<Local>,
    ) -> Option<PathBuf> {
        match self.save(line, camera, image, at).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(line, camera = %camera, error = %e, "Failed to archive image");
                None
            }
        }
    }
}

fn suffixed(base: &Path, n: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{stem}_{n}.jpg"))
}
