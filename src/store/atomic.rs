use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

static PENDING_COUNTER: AtomicU64 = AtomicU64::new(0);
const PENDING_PREFIX: &str = ".callmerge.pending.";

/// A sibling file that is removed on drop unless it was moved into place.
struct PendingFile {
    path: PathBuf,
    file: Option<File>,
}

impl PendingFile {
    fn create_beside(target: &Path) -> io::Result<Self> {
        let parent = parent_dir(target)?;
        let name = target
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target filename"))?;
        let path = parent.join(format!(
            "{PENDING_PREFIX}{name}.{}.{}",
            std::process::id(),
            PENDING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn write_durably(&mut self, bytes: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("pending file already closed"))?;
        file.write_all(bytes)?;
        file.sync_all()
    }

    fn persist(mut self, target: &Path) -> io::Result<()> {
        self.file.take();
        fs::rename(&self.path, target)?;
        self.path = PathBuf::new();
        Ok(())
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Replaces `path` with `bytes` so readers see either the old or the new
/// content, never a prefix.
pub fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(&parent)?;

    let mut pending = PendingFile::create_beside(path)?;
    pending.write_durably(bytes)?;
    pending.persist(path)?;
    sync_dir(&parent)?;
    debug!(path = %path.display(), bytes = bytes.len(), "replaced file");
    Ok(())
}

fn parent_dir(path: &Path) -> io::Result<PathBuf> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(PathBuf::from(".")),
        Some(parent) => Ok(parent.to_path_buf()),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path `{}` has no parent directory", path.display()),
        )),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
