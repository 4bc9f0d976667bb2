//! Scoped local staging for the write path.
//!
//! Points are buffered into one local file per storage bucket, named and
//! laid out exactly like the object keys they will be uploaded to. The
//! staging root is removed when the area is dropped, success or failure.

use crate::naming::{self, SEPARATOR};
use crate::protocol::LineWriter;
use crate::{Error, Result};

use chrono::Utc;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A staging directory holding per-bucket buffer files.
pub struct StagingArea {
    root: PathBuf,
    writers: HashMap<String, LineWriter<BufWriter<File>>>,
    custom_uniquifier: Option<String>,
}

impl StagingArea {
    /// Creates (or adopts) the staging root.
    ///
    /// # Panics
    ///
    /// An existing, non-empty root is a precondition violation: the area
    /// deletes its root on drop and must never adopt files it did not write.
    pub fn create(root: PathBuf) -> Result<Self> {
        if root.exists() {
            let occupied = fs::read_dir(&root)?.next().is_some();
            assert!(
                !occupied,
                "staging root {} must be empty, it is deleted when the staging area drops",
                root.display()
            );
        } else {
            fs::create_dir_all(&root)?;
        }
        Ok(Self {
            root,
            writers: HashMap::new(),
            custom_uniquifier: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Overrides the write-time uniquifier (used by compaction to place the
    /// replacement object after the keys it replaces).
    ///
    /// # Panics
    ///
    /// The uniquifier must not contain the key separator.
    pub fn set_custom_uniquifier(&mut self, uniquifier: impl Into<String>) {
        let uniquifier = uniquifier.into();
        assert!(
            !uniquifier.contains(SEPARATOR),
            "custom uniquifier '{}' must not contain '{}'",
            uniquifier,
            SEPARATOR
        );
        self.custom_uniquifier = Some(uniquifier);
    }

    /// The buffer writer for the bucket holding `(metric, source, time)`,
    /// creating the file on first use.
    ///
    /// If opening a new buffer fails with a resource limit (commonly "too
    /// many open files"), all open buffers are flushed and closed and the
    /// open is retried once, in append mode.
    pub fn writer_for(
        &mut self,
        metric_name: &str,
        source_id: &str,
        timestamp_ms: i64,
    ) -> Result<&mut LineWriter<BufWriter<File>>> {
        let bucket = naming::bucket_path_for_metric(metric_name, source_id, timestamp_ms);
        let bucket_key = bucket.key();

        if !self.writers.contains_key(&bucket_key) {
            let directory = self.root.join(&bucket.directory);
            let file_name = format!(
                "{}{}{}{}",
                bucket.file_name,
                SEPARATOR,
                self.uniquifier(),
                naming::METRICS_EXT
            );
            let full_path = directory.join(file_name);

            let file = match Self::open_new(&directory, &full_path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(
                        path = %full_path.display(),
                        error = %e,
                        "buffer open failed, closing all writers and retrying once"
                    );
                    self.close_all()?;
                    Self::open_append(&directory, &full_path)?
                }
            };
            debug!(path = %full_path.display(), "opened staging buffer");
            self.writers
                .insert(bucket_key.clone(), LineWriter::new(BufWriter::new(file)));
        }

        Ok(self
            .writers
            .get_mut(&bucket_key)
            .ok_or_else(|| Error::Internal("staging writer vanished".to_string()))?)
    }

    fn open_new(directory: &Path, path: &Path) -> Result<File> {
        if !directory.exists() {
            fs::create_dir_all(directory)?;
        }
        Ok(File::create(path)?)
    }

    fn open_append(directory: &Path, path: &Path) -> Result<File> {
        if !directory.exists() {
            fs::create_dir_all(directory)?;
        }
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn uniquifier(&self) -> String {
        match &self.custom_uniquifier {
            Some(custom) => custom.clone(),
            // Microsecond wall-clock time keeps keys unique and sorted by
            // creation time.
            None => Utc::now().format("%Y.%m.%d.%H.%M.%S.%6f").to_string(),
        }
    }

    /// Flushes and closes every open buffer. Files stay on disk for upload.
    pub fn close_all(&mut self) -> Result<()> {
        for (_, mut writer) in self.writers.drain() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Every staged file, as `(object key, local path)` pairs.
    pub fn staged_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    let key = path
                        .strip_prefix(&self.root)
                        .map_err(|_| {
                            Error::Internal(format!(
                                "staged file {} escaped the staging root",
                                path.display()
                            ))
                        })?
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push((key, path));
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        self.writers.clear();
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(root = %self.root.display(), error = %e, "failed to remove staging root");
        }
    }
}
