//! Output-file handling for image builds.
//!
//! Images are built into a hidden sibling of the destination and only
//! moved into place once complete, so a failed or interrupted build never
//! leaves a truncated image under the requested name.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{n}")
}

/// Fail if anything (including a dangling symlink) already exists at `path`.
pub fn ensure_absent(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => bail!("refusing to overwrite existing '{}'", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

/// A build-in-progress file. Removed on drop unless published.
#[derive(Debug)]
pub struct PartialFile {
    path: PathBuf,
    published: bool,
}

impl PartialFile {
    /// Create a fresh read/write file next to `dest`.
    pub fn create(dest: &Path) -> Result<(Self, File)> {
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let name = dest
            .file_name()
            .with_context(|| format!("'{}' does not name a file", dest.display()))?
            .to_string_lossy();
        let path = parent.join(tmp_name(&format!(".{name}.partial")));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok((
            Self {
                path,
                published: false,
            },
            file,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the finished file to `dest` without replacing anything that
    /// appeared there in the meantime.
    pub fn publish(mut self, dest: &Path) -> Result<()> {
        match fs::hard_link(&self.path, dest) {
            Ok(()) => {
                self.published = true;
                fs::remove_file(&self.path)
                    .with_context(|| format!("Failed to remove {}", self.path.display()))?;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!("refusing to overwrite existing '{}'", dest.display())
            }
            Err(_) => {
                // No hard links on this filesystem; fall back to a checked rename.
                ensure_absent(dest)?;
                fs::rename(&self.path, dest).with_context(|| {
                    format!(
                        "Failed to move {} to {}",
                        self.path.display(),
                        dest.display()
                    )
                })?;
                self.published = true;
            }
        }
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.path);
        }
    }
}
