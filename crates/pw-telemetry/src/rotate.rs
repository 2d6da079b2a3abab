//! Rotation and gzip compression of finalized telemetry files.
//!
//! A rotation renames the active file to the lowest unused sequence for
//! its day, then compresses it. The uncompressed copy is deleted only
//! once the compressed artifact is fully written and synced.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::layout::{LogFileKind, LogLayout};
use crate::stats::Statistics;
use crate::COMPRESSION_LEVEL;

/// Errors from rotation.
#[derive(Error, Debug)]
pub enum RotateError {
    #[error("failed to rename {} to {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a successful rotation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub seq: u32,
    /// Renamed file. Already deleted when `compressed` is set.
    pub rotated: PathBuf,
    /// Compressed artifact, or None if compression failed.
    pub compressed: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Rotator {
    layout: LogLayout,
    level: Compression,
    stats: Arc<Statistics>,
}

impl Rotator {
    pub fn new(layout: LogLayout, stats: Arc<Statistics>) -> Self {
        Rotator {
            layout,
            level: Compression::new(COMPRESSION_LEVEL),
            stats,
        }
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    /// Finalize `active` (belonging to `date`) and compress it.
    ///
    /// The caller must have closed its handle. A rename failure leaves the
    /// file untouched; a compression failure leaves the rotated copy.
    pub fn rotate(&self, active: &Path, date: NaiveDate) -> Result<RotationOutcome, RotateError> {
        let seq = self.layout.next_sequence(date);
        let rotated = self.layout.rotated_path(date, seq);

        fs::rename(active, &rotated).map_err(|source| RotateError::Rename {
            from: active.to_path_buf(),
            to: rotated.clone(),
            source,
        })?;
        self.stats.record_rotated();
        info!(file = %rotated.display(), seq, "rotated telemetry file");

        let target = self.layout.compressed_path(date, seq);
        let compressed = match self.compress_and_remove(&rotated, &target) {
            Ok(()) => Some(target),
            Err(e) => {
                warn!(file = %rotated.display(), error = %e, "compression failed, keeping uncompressed file");
                None
            }
        };

        Ok(RotationOutcome {
            seq,
            rotated,
            compressed,
        })
    }

    /// Compress rotated files left uncompressed by an earlier failure.
    pub fn compress_pending(&self) -> io::Result<usize> {
        let mut done = 0;
        for path in self.layout.list()? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(LogFileKind::Rotated { date, seq }) = self.layout.classify(name) {
                let target = self.layout.compressed_path(date, seq);
                if target.exists() {
                    continue;
                }
                match self.compress_and_remove(&path, &target) {
                    Ok(()) => done += 1,
                    Err(e) => warn!(file = %path.display(), error = %e, "deferred compression failed"),
                }
            }
        }
        Ok(done)
    }

    fn compress_and_remove(&self, source: &Path, target: &Path) -> io::Result<()> {
        let bytes = self.compress(source, target)?;
        self.stats.record_compressed();
        debug!(file = %target.display(), bytes, "compressed");
        if let Err(e) = fs::remove_file(source) {
            warn!(file = %source.display(), error = %e, "failed to remove rotated file after compression");
        }
        Ok(())
    }

    /// Gzip `source` into `target` via a temporary file. Returns input bytes.
    pub fn compress(&self, source: &Path, target: &Path) -> io::Result<u64> {
        let tmp = tmp_path(target);
        let result = (|| -> io::Result<u64> {
            let mut input = BufReader::new(File::open(source)?);
            let output = BufWriter::new(File::create(&tmp)?);
            let mut encoder = GzEncoder::new(output, self.level);
            let bytes = io::copy(&mut input, &mut encoder)?;
            let file = encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&tmp, target)?;
            Ok(bytes)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
