//! Line sources feeding the tailers.
//!
//! A [`LineSource`] yields complete lines as they become available and
//! `Ok(None)` when nothing new is there yet. [`FileFollower`] follows a live
//! file across rotation and truncation; [`StaticLines`] replays a fixed list
//! and is what the tests drive the pipeline with.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info};

/// Something that produces newline-delimited lines over time.
#[async_trait]
pub trait LineSource: Send {
    /// Next complete line (including its terminator, if any), or `None` when
    /// no new data is currently available. Errors are transient: the caller
    /// may back off and call again.
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Fixed list of lines, handed out in order and then idle forever.
#[derive(Debug, Default)]
pub struct StaticLines {
    lines: VecDeque<Vec<u8>>,
}

impl StaticLines {
    pub fn new<I, L>(lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<Vec<u8>>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.lines.len()
    }
}

#[async_trait]
impl LineSource for StaticLines {
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lines.pop_front())
    }
}

#[cfg(unix)]
type FileId = (u64, u64);

#[cfg(not(unix))]
type FileId = ();

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<FileId> {
    None
}

/// Follows a growing file from its current end, like `tail -F -n 0`.
///
/// - The first open starts at the end of the file; existing content is skipped.
/// - Reopening the same file (after an I/O error) resumes at the saved offset.
/// - A file replaced at the same path (rotation) is drained to EOF, then the
///   new file is read from its start.
/// - A file that shrinks below the read offset (truncation) is re-read from 0.
/// - A missing file is waited for; it is read from the start once it appears.
#[derive(Debug)]
pub struct FileFollower {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    identity: Option<FileId>,
    offset: u64,
    partial: Vec<u8>,
    started: bool,
}

impl FileFollower {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            identity: None,
            offset: 0,
            partial: Vec::new(),
            started: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next unread byte in the current file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Open the file at `path`. Returns `false` if it does not exist yet.
    async fn open(&mut self) -> io::Result<bool> {
        let first = !self.started;
        self.started = true;

        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        let meta = file.metadata().await?;
        let id = file_id(&meta);
        let len = meta.len();
        let same_file = match (id, self.identity) {
            (Some(new), Some(old)) => new == old,
            _ => self.identity.is_some() || id.is_none(),
        };

        let start = if first {
            len
        } else if same_file && len >= self.offset {
            self.offset
        } else {
            self.partial.clear();
            0
        };

        file.seek(SeekFrom::Start(start)).await?;
        debug!(path = %self.path.display(), offset = start, "Opened source");

        self.reader = Some(BufReader::new(file));
        self.identity = id;
        self.offset = start;
        Ok(true)
    }

    /// Forget the bytes a failed read appended past `held` and reopen on the
    /// next call. Those bytes lie beyond the saved offset and will be read again.
    fn rewind_failed_read(&mut self, held: usize) {
        self.partial.truncate(held);
        self.reader = None;
    }

    /// At EOF: detect replacement or truncation of the followed file.
    ///
    /// Returns a trailing unterminated line left behind by a replaced file.
    async fn check_rotation(&mut self) -> io::Result<Option<Vec<u8>>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            // moved away and not recreated yet; keep reading the old handle
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if let (Some(current), Some(followed)) = (file_id(&meta), self.identity) {
            if current != followed {
                info!(path = %self.path.display(), "Source replaced, following new file");
                self.reader = None;
                self.offset = 0;
                let leftover = std::mem::take(&mut self.partial);
                return Ok(Some(leftover).filter(|l| !l.is_empty()));
            }
        }

        if meta.len() < self.offset {
            info!(
                path = %self.path.display(),
                offset = self.offset,
                len = meta.len(),
                "Source truncated, reading from start"
            );
            if let Some(reader) = self.reader.as_mut() {
                reader.seek(SeekFrom::Start(0)).await?;
            }
            self.offset = 0;
            self.partial.clear();
        }

        Ok(None)
    }
}

#[async_trait]
impl LineSource for FileFollower {
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.reader.is_none() && !self.open().await? {
            return Ok(None);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let held = self.partial.len();
        let read = match reader.read_until(b'\n', &mut self.partial).await {
            Ok(read) => read,
            Err(e) => {
                self.rewind_failed_read(held);
                return Err(e);
            }
        };

        if read > 0 {
            self.offset += read as u64;
            if self.partial.ends_with(b"\n") {
                return Ok(Some(std::mem::take(&mut self.partial)));
            }
            return Ok(None);
        }

        self.check_rotation().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    async fn next(follower: &mut FileFollower) -> String {
        for _ in 0..100 {
            if let Some(line) = follower.next_line().await.unwrap() {
                return String::from_utf8(line).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no line from {}", follower.path().display());
    }

    async fn assert_idle(follower: &mut FileFollower) {
        for _ in 0..3 {
            assert!(follower.next_line().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_static_lines_in_order_then_idle() {
        let mut source = StaticLines::new(["one", "two"]);
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.next_line().await.unwrap().unwrap(), b"one");
        assert_eq!(source.next_line().await.unwrap().unwrap(), b"two");
        assert!(source.next_line().await.unwrap().is_none());
        assert!(source.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_starts_at_end_of_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "old line\n");

        let mut follower = FileFollower::new(&path);
        assert_idle(&mut follower).await;
        assert_eq!(follower.offset(), 9);

        append(&path, "new line\n");
        assert_eq!(next(&mut follower).await, "new line\n");
    }

    #[tokio::test]
    async fn test_holds_partial_line_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut follower = FileFollower::new(&path);
        assert_idle(&mut follower).await;

        append(&path, "part");
        assert_idle(&mut follower).await;
        append(&path, "ial\nnext\n");
        assert_eq!(next(&mut follower).await, "partial\n");
        assert_eq!(next(&mut follower).await, "next\n");
    }

    #[tokio::test]
    async fn test_truncation_rereads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut follower = FileFollower::new(&path);
        assert_idle(&mut follower).await;
        append(&path, "a fairly long line written before truncation\n");
        assert_eq!(
            next(&mut follower).await,
            "a fairly long line written before truncation\n"
        );

        std::fs::write(&path, "fresh\n").unwrap();
        assert_eq!(next(&mut follower).await, "fresh\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_drains_old_then_follows_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let rotated = dir.path().join("app.log.1");
        append(&path, "");

        let mut follower = FileFollower::new(&path);
        assert_idle(&mut follower).await;
        append(&path, "before\n");
        assert_eq!(next(&mut follower).await, "before\n");

        std::fs::rename(&path, &rotated).unwrap();
        append(&rotated, "late write to old file\n");
        append(&path, "after rotation\n");

        assert_eq!(next(&mut follower).await, "late write to old file\n");
        assert_eq!(next(&mut follower).await, "after rotation\n");
        assert_idle(&mut follower).await;
    }

    #[tokio::test]
    async fn test_waits_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");

        let mut follower = FileFollower::new(&path);
        assert_idle(&mut follower).await;

        append(&path, "hello\n");
        assert_eq!(next(&mut follower).await, "hello\n");
    }

    #[tokio::test]
    async fn test_failed_read_does_not_duplicate_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut follower = FileFollower::new(&path);
        assert_idle(&mut follower).await;
        append(&path, "part");
        assert_idle(&mut follower).await;
        assert_eq!(follower.offset(), 4);

        // a read that pulled "ial" in and then failed
        append(&path, "ial\n");
        follower.partial.extend_from_slice(b"ial");
        follower.rewind_failed_read(4);

        assert_eq!(next(&mut follower).await, "partial\n");
        assert_eq!(follower.offset(), 8);
    }
}
