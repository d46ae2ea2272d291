//! Frame sources and output sinks.
//!
//! A source yields fixed-size raw frames until fewer bytes than one frame
//! remain (end of stream) and can be rewound for another loop pass. A sink
//! receives codec output one sample at a time and is finished once.
//! [`MediaIo`] opens both for a test.

use crate::config::HarnessConfig;
use crate::definition::TestDefinition;
use crate::result::{BenchError, BenchResult};
use crate::session::EncodedSample;
use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::debug;

// =============================================================================
// Sources
// =============================================================================

/// Sequential raw frame reader
#[async_trait]
pub trait FrameSource: Send {
    /// Source identifier for reports
    fn describe(&self) -> String;

    /// Next frame of `frame_size` bytes, or `None` at end of stream
    async fn read_frame(&mut self, frame_size: usize) -> BenchResult<Option<Vec<u8>>>;

    /// Rewind to the first frame
    async fn restart(&mut self) -> BenchResult<()>;

    /// Release the underlying handle
    async fn close(&mut self) -> BenchResult<()>;
}

/// Raw frames read from a file
#[derive(Debug)]
pub struct RawFileSource {
    path: PathBuf,
    file: Option<File>,
}

impl RawFileSource {
    /// Open `path` for reading
    pub async fn open(path: impl Into<PathBuf>) -> BenchResult<Self> {
        let path = path.into();
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn file(&mut self) -> BenchResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| BenchError::io(format!("{} is closed", self.path.display())))
    }
}

#[async_trait]
impl FrameSource for RawFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn read_frame(&mut self, frame_size: usize) -> BenchResult<Option<Vec<u8>>> {
        let mut frame = vec![0; frame_size];
        match self.file()?.read_exact(&mut frame).await {
            Ok(_) => Ok(Some(frame)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn restart(&mut self) -> BenchResult<()> {
        self.file()?.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    async fn close(&mut self) -> BenchResult<()> {
        self.file = None;
        Ok(())
    }
}

/// Generated frames, for runs without source material
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    frames_per_pass: u64,
    position: u64,
}

impl SyntheticSource {
    /// Source of `frames_per_pass` frames per loop pass
    #[must_use]
    pub const fn new(frames_per_pass: u64) -> Self {
        Self {
            frames_per_pass,
            position: 0,
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic:{}", self.frames_per_pass)
    }

    async fn read_frame(&mut self, frame_size: usize) -> BenchResult<Option<Vec<u8>>> {
        if self.position >= self.frames_per_pass {
            return Ok(None);
        }
        let fill = (self.position % 256) as u8;
        self.position += 1;
        Ok(Some(vec![fill; frame_size]))
    }

    async fn restart(&mut self) -> BenchResult<()> {
        self.position = 0;
        Ok(())
    }

    async fn close(&mut self) -> BenchResult<()> {
        Ok(())
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Receiver of codec output
#[async_trait]
pub trait OutputSink: Send {
    /// Output identifier for reports
    fn describe(&self) -> String;

    /// Persist one sample
    async fn append(&mut self, sample: &EncodedSample) -> BenchResult<()>;

    /// Flush and release; no appends follow
    async fn finish(&mut self) -> BenchResult<()>;
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl OutputSink for NullSink {
    fn describe(&self) -> String {
        String::new()
    }

    async fn append(&mut self, _sample: &EncodedSample) -> BenchResult<()> {
        Ok(())
    }

    async fn finish(&mut self) -> BenchResult<()> {
        Ok(())
    }
}

/// Writes the raw elementary stream to a file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl FileSink {
    /// Create (or truncate) `path`
    pub async fn create(path: impl Into<PathBuf>) -> BenchResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            bytes_written: 0,
        })
    }

    /// Bytes appended so far
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[async_trait]
impl OutputSink for FileSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn append(&mut self, sample: &EncodedSample) -> BenchResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BenchError::io(format!("{} is finished", self.path.display())))?;
        writer.write_all(&sample.data).await?;
        self.bytes_written += sample.data.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> BenchResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            debug!(path = %self.path.display(), bytes = self.bytes_written, "output finished");
        }
        Ok(())
    }
}

/// File extension for a codec's raw elementary stream
#[must_use]
pub fn output_extension(codec: &str) -> &'static str {
    let codec = codec.to_ascii_lowercase();
    if codec.contains("264") || codec.contains("avc") {
        "h264"
    } else if codec.contains("265") || codec.contains("hevc") {
        "hevc"
    } else if ["vp8", "vp9", "av1", "av01"].iter().any(|c| codec.contains(c)) {
        "ivf"
    } else {
        "bin"
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Opens the source and sink of a test
#[async_trait]
pub trait MediaIo: Send + Sync {
    /// Open the test's frame source
    async fn open_source(&self, test: &TestDefinition) -> BenchResult<Box<dyn FrameSource>>;

    /// Open the test's output sink
    async fn open_sink(
        &self,
        test: &TestDefinition,
        stats_id: &str,
    ) -> BenchResult<Box<dyn OutputSink>>;
}

/// Files under the harness work directory
#[derive(Debug, Clone)]
pub struct FileMediaIo {
    config: HarnessConfig,
}

impl FileMediaIo {
    /// Provider using the configured work directory
    #[must_use]
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl MediaIo for FileMediaIo {
    async fn open_source(&self, test: &TestDefinition) -> BenchResult<Box<dyn FrameSource>> {
        let source = RawFileSource::open(self.config.resolve(&test.input.source)).await?;
        Ok(Box::new(source))
    }

    async fn open_sink(
        &self,
        test: &TestDefinition,
        stats_id: &str,
    ) -> BenchResult<Box<dyn OutputSink>> {
        if !self.config.write_output || !test.configure.encode {
            return Ok(Box::new(NullSink));
        }
        let name = format!("{stats_id}.{}", output_extension(&test.configure.codec));
        Ok(Box::new(FileSink::create(self.config.work_dir.join(name)).await?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample(data: &[u8]) -> EncodedSample {
        EncodedSample {
            pts_usec: 0,
            data: data.to_vec(),
            is_key_frame: false,
        }
    }

    #[tokio::test]
    async fn test_raw_source_short_read_is_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.yuv");
        // Two whole frames of 6 bytes plus a partial one
        std::fs::write(&path, [1u8; 15]).unwrap();

        let mut source = RawFileSource::open(&path).await.unwrap();
        assert!(source.read_frame(6).await.unwrap().is_some());
        assert!(source.read_frame(6).await.unwrap().is_some());
        assert!(source.read_frame(6).await.unwrap().is_none());

        source.restart().await.unwrap();
        assert_eq!(source.read_frame(6).await.unwrap(), Some(vec![1u8; 6]));

        source.close().await.unwrap();
        assert!(source.read_frame(6).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = RawFileSource::open("/nonexistent/clip.yuv").await.unwrap_err();
        assert!(matches!(err, BenchError::Io(_)));
    }

    #[tokio::test]
    async fn test_synthetic_source_passes() {
        let mut source = SyntheticSource::new(3);
        let mut frames = Vec::new();
        while let Some(frame) = source.read_frame(4).await.unwrap() {
            frames.push(frame[0]);
        }
        assert_eq!(frames, vec![0, 1, 2]);
        source.restart().await.unwrap();
        assert_eq!(source.read_frame(4).await.unwrap(), Some(vec![0; 4]));
        assert_eq!(source.describe(), "synthetic:3");
    }

    #[tokio::test]
    async fn test_file_sink_writes_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("bench_1.h264");
        let mut sink = FileSink::create(&path).await.unwrap();
        sink.append(&sample(b"abc")).await.unwrap();
        sink.append(&sample(b"de")).await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(sink.bytes_written(), 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcde");
        assert!(sink.append(&sample(b"f")).await.is_err());
    }

    #[test]
    fn test_output_extension() {
        assert_eq!(output_extension("OMX.google.h264.encoder"), "h264");
        assert_eq!(output_extension("hevc"), "hevc");
        assert_eq!(output_extension("libvpx-vp9"), "ivf");
        assert_eq!(output_extension("mock"), "bin");
    }

    #[tokio::test]
    async fn test_file_media_io_resolves_and_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.yuv"), [0u8; 64]).unwrap();
        let config = HarnessConfig::builder()
            .work_dir(dir.path())
            .write_output(true)
            .build();
        let io = FileMediaIo::new(&config);
        let test = TestDefinition::new("t", "h264", "clip.yuv");

        let source = io.open_source(&test).await.unwrap();
        assert!(source.describe().ends_with("clip.yuv"));

        let sink = io.open_sink(&test, "bench_abc").await.unwrap();
        assert!(sink.describe().ends_with("bench_abc.h264"));

        let quiet = FileMediaIo::new(&HarnessConfig::builder().work_dir(dir.path()).build());
        assert_eq!(quiet.open_sink(&test, "bench_abc").await.unwrap().describe(), "");
    }
}
