//! Streaming zip encoder for rendered output trees.
//!
//! Encoding happens in two steps. [`ZipStreamEncoder::plan`] walks the output
//! directory and fixes the entry list up front, so a broken tree is reported
//! before the first byte leaves. [`ZipStreamEncoder::stream`] then writes the
//! archive on the blocking pool into a chunking sink whose chunks are handed
//! to the caller through a bounded channel.

use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Zip byte stream; single pass, ends after the last chunk
pub type ZipStream = ReceiverStream<io::Result<Bytes>>;

/// One regular file to be stored in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    /// Archive name, `/`-separated and relative to the output root
    pub name: String,
    /// Location on disk
    pub path: PathBuf,
}

/// Ordered entry list for one output directory
#[derive(Debug, Clone)]
pub struct ZipPlan {
    root: PathBuf,
    entries: Vec<ZipEntry>,
}

impl ZipPlan {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a finished encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSummary {
    pub entries: usize,
    pub bytes: u64,
}

/// Serializes directory trees into chunked deflate zip streams
#[derive(Debug, Clone)]
pub struct ZipStreamEncoder {
    chunk_size: usize,
    channel_capacity: usize,
}

impl Default for ZipStreamEncoder {
    fn default() -> Self {
        Self::new(64 * 1024, 8)
    }
}

impl ZipStreamEncoder {
    pub fn new(chunk_size: usize, channel_capacity: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Collect every regular file below `output_dir`, sorted by archive name.
    ///
    /// Directories are not stored; symlinks are not followed.
    pub fn plan(&self, output_dir: &Path) -> io::Result<ZipPlan> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(output_dir).min_depth(1).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(output_dir)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            entries.push(ZipEntry {
                name: archive_name(relative),
                path: entry.path().to_path_buf(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ZipPlan {
            root: output_dir.to_path_buf(),
            entries,
        })
    }

    /// Plan and stream `output_dir` with no completion hook
    pub fn encode(&self, output_dir: &Path) -> io::Result<ZipStream> {
        let plan = self.plan(output_dir)?;
        Ok(self.stream(plan, |_| {}))
    }

    /// Stream the archive for `plan`.
    ///
    /// `on_complete` runs on the encoding thread once writing has stopped,
    /// after the last chunk is queued and before the stream ends. It always
    /// runs, including when the consumer drops the stream early.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stream<F>(&self, plan: ZipPlan, on_complete: F) -> ZipStream
    where
        F: FnOnce(&io::Result<EncodeSummary>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let chunk_size = self.chunk_size;

        tokio::task::spawn_blocking(move || {
            let sink = ChunkSink::new(tx.clone(), chunk_size);
            let result = write_archive(&plan, sink);

            if let Err(ref e) = result {
                // Receiver may already be gone; nothing to report to then
                let _ = tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
            }

            on_complete(&result);
            drop(tx);
        });

        ReceiverStream::new(rx)
    }
}

fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn zip_to_io(e: zip::result::ZipError) -> io::Error {
    match e {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

fn write_archive(plan: &ZipPlan, sink: ChunkSink) -> io::Result<EncodeSummary> {
    let sent = sink.sent.clone();
    let mut zip = ZipWriter::new_stream(sink);

    for entry in &plan.entries {
        let mut file = File::open(&entry.path)?;
        let metadata = file.metadata()?;

        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(metadata.len() >= u32::MAX as u64);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            options = options.unix_permissions(metadata.permissions().mode() & 0o777);
        }

        zip.start_file(entry.name.as_str(), options).map_err(zip_to_io)?;
        io::copy(&mut file, &mut zip)?;

        debug!(entry = %entry.name, size_bytes = metadata.len(), "Zip entry written");
    }

    let mut inner = zip.finish().map_err(zip_to_io)?;
    inner.flush()?;

    Ok(EncodeSummary {
        entries: plan.entries.len(),
        bytes: sent.load(Ordering::Relaxed),
    })
}

/// `Write` adapter cutting the zip output into fixed-size chunks
struct ChunkSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buffer: BytesMut,
    chunk_size: usize,
    sent: Arc<AtomicU64>,
}

impl ChunkSink {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>, chunk_size: usize) -> Self {
        Self {
            tx,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        let len = chunk.len() as u64;
        self.tx.blocking_send(Ok(chunk)).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "zip stream consumer went away")
        })?;
        self.sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

impl Write for ChunkSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);

        while self.buffer.len() >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            self.send(chunk)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.send(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::fs;
    use std::io::{Cursor, Read};
    use zip::ZipArchive;

    fn write_tree(root: &Path) {
        fs::create_dir_all(root.join("src/bin")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("README.md"), "# demo\n").unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn demo() {}\n").unwrap();
        fs::write(root.join("src/bin/cli.rs"), "fn main() {}\n").unwrap();
        fs::write(root.join("a.txt"), "a".repeat(10_000)).unwrap();
    }

    async fn collect(stream: ZipStream) -> Vec<u8> {
        let chunks: Vec<io::Result<Bytes>> = stream.collect().await;
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn read_entries(bytes: Vec<u8>) -> Vec<(String, String)> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entries = Vec::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).unwrap();
            let mut content = String::new();
            file.read_to_string(&mut content).unwrap();
            entries.push((file.name().to_string(), content));
        }
        entries
    }

    #[test]
    fn test_plan_orders_files_and_skips_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_tree(tmp.path());

        let plan = ZipStreamEncoder::default().plan(tmp.path()).unwrap();
        let names: Vec<&str> = plan.entries().iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["README.md", "a.txt", "src/bin/cli.rs", "src/lib.rs"]);
    }

    #[test]
    fn test_plan_missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(ZipStreamEncoder::default().plan(&tmp.path().join("gone")).is_err());
    }

    #[tokio::test]
    async fn test_encode_round_trips_tree() {
        let tmp = tempfile::tempdir().unwrap();
        write_tree(tmp.path());

        let encoder = ZipStreamEncoder::new(128, 2);
        let entries = read_entries(collect(encoder.encode(tmp.path()).unwrap()).await);

        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], ("README.md".to_string(), "# demo\n".to_string()));
        assert_eq!(entries[1].1.len(), 10_000);
        assert_eq!(entries[3], ("src/lib.rs".to_string(), "pub fn demo() {}\n".to_string()));
    }

    #[tokio::test]
    async fn test_encode_is_chunked() {
        let tmp = tempfile::tempdir().unwrap();
        write_tree(tmp.path());

        let stream = ZipStreamEncoder::new(64, 4).encode(tmp.path()).unwrap();
        let chunks: Vec<io::Result<Bytes>> = stream.collect().await;

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.as_ref().map(|b| b.len() <= 64).unwrap_or(false)));
    }

    #[tokio::test]
    async fn test_repeated_encodes_match() {
        let tmp = tempfile::tempdir().unwrap();
        write_tree(tmp.path());
        let encoder = ZipStreamEncoder::default();

        let first = read_entries(collect(encoder.encode(tmp.path()).unwrap()).await);
        let second = read_entries(collect(encoder.encode(tmp.path()).unwrap()).await);

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_directory_yields_empty_archive() {
        let tmp = tempfile::tempdir().unwrap();

        let entries = read_entries(collect(ZipStreamEncoder::default().encode(tmp.path()).unwrap()).await);

        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_on_complete_runs_before_stream_ends() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("out");
        write_tree(&output);

        let encoder = ZipStreamEncoder::default();
        let plan = encoder.plan(&output).unwrap();
        let dir = output.clone();
        let stream = encoder.stream(plan, move |result| {
            assert!(result.is_ok());
            fs::remove_dir_all(&dir).unwrap();
        });

        let entries = read_entries(collect(stream).await);

        assert_eq!(entries.len(), 4);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_dropped_consumer_aborts_encoding() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("big.bin"), vec![7u8; 1024 * 1024]).unwrap();

        let encoder = ZipStreamEncoder::new(16, 1);
        let plan = encoder.plan(tmp.path()).unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let mut stream = encoder.stream(plan, move |result| {
            let kind = result.as_ref().err().map(|e| e.kind());
            let _ = done_tx.send(kind);
        });

        assert!(stream.next().await.is_some());
        drop(stream);

        let kind = done_rx.await.unwrap();
        assert_eq!(kind, Some(io::ErrorKind::BrokenPipe));
    }
}
