//! Parallel ranged download of a single file.
//!
//! The file is split into contiguous byte ranges fetched concurrently into
//! hidden part files next to the destination. Parts are merged in order
//! once every worker has finished; a failed part leaves no part files and
//! no destination behind.

mod http;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::executor::pipe::panic_message;

pub use http::HttpRangeSource;

/// Something that serves a fixed-length byte sequence in ranges.
pub trait RangeSource: Send + Sync {
    /// Total length in bytes.
    fn content_length(&self) -> Result<u64>;

    /// Writes bytes `start..=end` into `sink`.
    fn fetch_range(&self, start: u64, end: u64, sink: &mut dyn Write) -> Result<()>;
}

/// Download tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Number of ranges fetched concurrently.
    pub parts: usize,
    /// Retries per part after the first attempt.
    pub retry_limit: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub initial_backoff: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            parts: 4,
            retry_limit: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Exponential retry delay owned by one worker.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration) -> Self {
        Self { next: initial }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2);
        delay
    }
}

/// One contiguous byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Part {
    index: usize,
    start: u64,
    end: u64,
}

impl Part {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Splits `length` bytes into at most `parts` ranges; the last range takes
/// the remainder.
fn split_ranges(length: u64, parts: usize) -> Vec<Part> {
    if length == 0 {
        return Vec::new();
    }
    let count = (parts as u64).clamp(1, length);
    let chunk = length / count;
    (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = if i == count - 1 { length - 1 } else { start + chunk - 1 };
            Part {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

fn part_path(dest: &Utf8Path, index: usize) -> Utf8PathBuf {
    let name = dest.file_name().unwrap_or("download");
    let file = format!(".{}.part-{}.tmp", name, index);
    match dest.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir.join(file),
        _ => Utf8PathBuf::from(file),
    }
}

/// Counts bytes into the shared progress counter as they are written.
struct ProgressWriter<'a, W> {
    inner: W,
    progress: &'a AtomicU64,
    written: u64,
}

impl<W: Write> Write for ProgressWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        self.progress.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn fetch_attempt(
    source: &dyn RangeSource,
    part: &Part,
    path: &Utf8Path,
    progress: &AtomicU64,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = ProgressWriter {
        inner: BufWriter::new(file),
        progress,
        written: 0,
    };
    let result = source.fetch_range(part.start, part.end, &mut writer).and_then(|()| {
        writer.flush()?;
        if writer.written != part.len() {
            anyhow::bail!("expected {} bytes, got {}", part.len(), writer.written);
        }
        Ok(())
    });
    if result.is_err() {
        progress.fetch_sub(writer.written, Ordering::Relaxed);
    }
    result
}

/// Fetches one part, retrying up to `retry_limit` times.
fn fetch_part(
    source: &dyn RangeSource,
    part: &Part,
    path: &Utf8Path,
    options: &DownloadOptions,
    progress: &AtomicU64,
) -> Result<()> {
    let mut backoff = Backoff::new(options.initial_backoff);
    let mut attempt = 0;
    loop {
        match fetch_attempt(source, part, path, progress) {
            Ok(()) => {
                debug!(part = part.index, "fetched bytes {}-{}", part.start, part.end);
                return Ok(());
            }
            Err(e) if attempt < options.retry_limit => {
                let delay = backoff.next_delay();
                warn!(part = part.index, attempt = attempt + 1, "retrying in {:?}: {:#}", delay, e);
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("giving up after {} attempt(s)", attempt + 1))),
        }
    }
}

fn remove_parts(paths: &[Utf8PathBuf]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove part file {}: {}", path, e),
        }
    }
}

fn create(dest: &Utf8Path) -> Result<File, ProvisionError> {
    File::create(dest).map_err(|e| ProvisionError::io(format!("failed to create {}", dest), e))
}

fn merge_parts(dest: &Utf8Path, paths: &[Utf8PathBuf]) -> Result<u64, ProvisionError> {
    let file = create(dest)?;
    let mut out = BufWriter::new(file);
    let mut total = 0;
    for path in paths {
        let mut part = File::open(path)
            .map_err(|e| ProvisionError::io(format!("failed to open {}", path), e))?;
        total += io::copy(&mut part, &mut out)
            .map_err(|e| ProvisionError::io(format!("failed to append {} to {}", path, dest), e))?;
        drop(part);
        fs::remove_file(path)
            .map_err(|e| ProvisionError::io(format!("failed to remove {}", path), e))?;
    }
    out.flush()
        .map_err(|e| ProvisionError::io(format!("failed to write {}", dest), e))?;
    Ok(total)
}

/// Downloads everything `source` serves into `dest`.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// [`ProvisionError::Download`] lists every part that still failed after
/// its retries, or a length mismatch after merging.
#[tracing::instrument(skip(source, options), fields(parts = options.parts))]
pub fn download(
    source: &dyn RangeSource,
    dest: &Utf8Path,
    options: &DownloadOptions,
) -> Result<u64, ProvisionError> {
    if options.parts == 0 {
        return Err(ProvisionError::Validation("parts must be at least 1".to_string()));
    }

    let length = source.content_length().map_err(|e| ProvisionError::Download {
        failures: vec![format!("content length: {:#}", e)],
    })?;
    info!("downloading {} bytes to {}", length, dest);

    let parts = split_ranges(length, options.parts);
    if parts.is_empty() {
        create(dest)?;
        return Ok(0);
    }
    let paths: Vec<Utf8PathBuf> = parts.iter().map(|p| part_path(dest, p.index)).collect();
    let progress = AtomicU64::new(0);

    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = parts
            .iter()
            .zip(&paths)
            .map(|(part, path)| {
                let progress = &progress;
                scope.spawn(move || {
                    let result = fetch_part(source, part, path, options, progress);
                    debug!("progress: {}/{} bytes", progress.load(Ordering::Relaxed), length);
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|e| {
                    Err(anyhow::anyhow!("worker panicked: {}", panic_message(&*e)))
                })
            })
            .collect()
    });

    let failures: Vec<String> = results
        .into_iter()
        .zip(&parts)
        .filter_map(|(result, part)| result.err().map(|e| format!("part {}: {:#}", part.index, e)))
        .collect();
    if !failures.is_empty() {
        remove_parts(&paths);
        return Err(ProvisionError::Download { failures });
    }

    let total = assemble(dest, &paths, length)?;
    info!("downloaded {} ({} bytes)", dest, total);
    Ok(total)
}

/// Merges the fetched parts into `dest` and checks the merged length.
///
/// On any failure neither the part files nor `dest` are left behind.
fn assemble(dest: &Utf8Path, paths: &[Utf8PathBuf], length: u64) -> Result<u64, ProvisionError> {
    let total = merge_parts(dest, paths).inspect_err(|_| {
        remove_parts(paths);
        discard(dest);
    })?;
    if total != length {
        discard(dest);
        return Err(ProvisionError::Download {
            failures: vec![format!("merged {} bytes but {} were advertised", total, length)],
        });
    }
    Ok(total)
}

fn discard(dest: &Utf8Path) {
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {}", dest, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ranges_remainder_in_last() {
        let parts = split_ranges(10, 3);
        assert_eq!(
            parts,
            vec![
                Part { index: 0, start: 0, end: 2 },
                Part { index: 1, start: 3, end: 5 },
                Part { index: 2, start: 6, end: 9 },
            ]
        );
    }

    #[test]
    fn test_split_ranges_more_parts_than_bytes() {
        let parts = split_ranges(2, 8);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.iter().map(Part::len).sum::<u64>(), 2);
        assert!(split_ranges(0, 4).is_empty());
    }

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = Backoff::new(Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn test_failed_merge_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let dest = base.join("image.iso");
        let paths = vec![part_path(&dest, 0), part_path(&dest, 1)];
        fs::write(&paths[0], b"abc").unwrap();

        let err = assemble(&dest, &paths, 6).unwrap_err();

        assert!(matches!(err, ProvisionError::Io { .. }), "got {:?}", err);
        assert!(!dest.exists());
        assert!(!paths[0].exists());
    }

    #[test]
    fn test_short_merge_removes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let dest = base.join("image.iso");
        let paths = vec![part_path(&dest, 0)];
        fs::write(&paths[0], b"abc").unwrap();

        let err = assemble(&dest, &paths, 4).unwrap_err();

        assert!(matches!(err, ProvisionError::Download { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_part_path_is_hidden_sibling() {
        assert_eq!(part_path(Utf8Path::new("/tmp/x/image.iso"), 2), "/tmp/x/.image.iso.part-2.tmp");
        assert_eq!(part_path(Utf8Path::new("image.iso"), 0), ".image.iso.part-0.tmp");
    }
}
