//! Size-bounded output log file
//!
//! Receives a copy of every line a service produces. When the file grows past
//! its maximum size the oldest half is cut off, starting the kept part at a
//! line boundary. Trimming writes the kept tail to a temp file and renames it
//! over the original.

use crate::{CoreError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default maximum size of an output log file (5 MiB)
pub const DEFAULT_OUTPUT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Append-only file that keeps itself below a maximum size
#[derive(Debug)]
pub struct BoundedFile {
    path: PathBuf,
    file: File,
    max_bytes: u64,
}

impl BoundedFile {
    /// Open `path` for appending, creating parent directories when needed
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file,
            max_bytes: max_bytes.max(2),
        })
    }

    /// Open `path` after discarding any previous contents
    pub fn create(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Self::open(path, max_bytes)
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Maximum size in bytes
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Append text and trim the file if it became too large
    pub fn write(&mut self, text: &str) -> Result<()> {
        self.file.write_all(text.as_bytes())?;
        self.file.flush()?;
        self.check_size()
    }

    fn check_size(&mut self) -> Result<()> {
        let length = fs::metadata(&self.path)?.len();
        if length <= self.max_bytes {
            return Ok(());
        }
        debug!(
            "Trimming output log {} ({} > {} bytes)",
            self.path.display(),
            length,
            self.max_bytes
        );

        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(length - self.max_bytes / 2))?;
        // skip to the first complete line
        let mut partial = Vec::new();
        reader.read_until(b'\n', &mut partial)?;
        let mut kept = Vec::new();
        reader.read_to_end(&mut kept)?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&kept)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            CoreError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to replace {}: {}", self.path.display(), e),
            ))
        })?;
        self.file = open_append(&self.path)?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            CoreError::IoError(std::io::Error::new(
                e.kind(),
                format!("Unable to open {} for writing: {}", path.display(), e),
            ))
        })
}
