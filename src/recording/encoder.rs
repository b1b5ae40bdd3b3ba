use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::EncoderConfig;
use crate::storage::StreamKind;

/// Lifecycle of one encoder process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Started,
    Ending,
    Closed,
}

/// One chunk being encoded for one (device, stream kind)
///
/// Implementations:
/// - `SubprocessEncoder`: pipes raw frames into an external transcoder's stdin
/// - `RawFileEncoder`: writes raw frames straight into the chunk file
#[async_trait::async_trait]
pub trait EncoderProcess: Send {
    /// Feed one raw frame
    ///
    /// Best effort: returns `false` and drops the frame unless the encoder is
    /// `Started` and can take it right away. Callers hold the session lock, so
    /// this must not wait on a slow consumer. A write error closes the encoder
    /// instead of failing the caller.
    async fn write(&mut self, frame: &[u8]) -> bool;

    /// Signal end of input and wait until the chunk file is closed
    async fn stop(&mut self) -> Result<()>;

    fn state(&self) -> EncoderState;

    /// Get encoder name for logging
    fn name(&self) -> &str;
}

/// External transcoder fed through stdin
///
/// Frames go through a bounded queue drained by a writer task, so `write`
/// never waits on the pipe. When the transcoder falls behind and the queue is
/// full, frames are dropped.
pub struct SubprocessEncoder {
    label: String,
    child: Child,
    frames: Option<mpsc::Sender<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
    stop_timeout: Duration,
    state: EncoderState,
}

impl SubprocessEncoder {
    pub fn spawn(
        program: &str,
        args: &[String],
        end_sentinel: Option<Vec<u8>>,
        queue_frames: usize,
        stop_timeout: Duration,
        label: String,
    ) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn encoder {} for {}", program, label))?;

        let stdin = child
            .stdin
            .take()
            .with_context(|| format!("Encoder {} has no stdin", label))?;

        // Diagnostics only; the output is never parsed
        if let Some(stderr) = child.stderr.take() {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", label, line);
                }
            });
        }

        let (frames, frame_rx) = mpsc::channel(queue_frames.max(1));
        let writer = tokio::spawn(feed_stdin(stdin, frame_rx, end_sentinel, label.clone()));

        info!("Encoder started: {} ({})", label, program);

        Ok(Self {
            label,
            child,
            frames: Some(frames),
            writer: Some(writer),
            stop_timeout,
            state: EncoderState::Started,
        })
    }

    async fn drain_and_wait(&mut self) -> Result<ExitStatus> {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.await;
            self.writer = None;
        }
        self.child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for encoder {}", self.label))
    }
}

/// Copy queued frames into the transcoder until the queue closes
async fn feed_stdin(
    mut stdin: ChildStdin,
    mut frames: mpsc::Receiver<Vec<u8>>,
    end_sentinel: Option<Vec<u8>>,
    label: String,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = stdin.write_all(&frame).await {
            warn!("Encoder {} rejected a frame, closing input: {}", label, e);
            return;
        }
    }

    if let Some(sentinel) = end_sentinel {
        if let Err(e) = stdin.write_all(&sentinel).await {
            warn!("Failed to write end sentinel to {}: {}", label, e);
        }
    }
    if let Err(e) = stdin.shutdown().await {
        debug!("Encoder {} input already closed: {}", label, e);
    }
}

#[async_trait::async_trait]
impl EncoderProcess for SubprocessEncoder {
    async fn write(&mut self, frame: &[u8]) -> bool {
        if self.state != EncoderState::Started {
            return false;
        }
        let Some(frames) = self.frames.as_ref() else {
            return false;
        };

        match frames.try_send(frame.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Encoder {} is behind, dropping frame", self.label);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.frames = None;
                self.state = EncoderState::Closed;
                false
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == EncoderState::Closed && self.writer.is_none() {
            return Ok(());
        }
        self.state = EncoderState::Ending;
        // Closing the queue lets the writer flush, send the sentinel and close stdin
        self.frames = None;

        let status = match timeout(self.stop_timeout, self.drain_and_wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "Encoder {} did not exit within {:?}, killing it",
                    self.label, self.stop_timeout
                );
                if let Some(writer) = self.writer.take() {
                    writer.abort();
                }
                if let Err(e) = self.child.start_kill() {
                    warn!("Failed to kill encoder {}: {}", self.label, e);
                }
                self.child
                    .wait()
                    .await
                    .with_context(|| format!("Failed to reap encoder {}", self.label))?
            }
        };
        self.state = EncoderState::Closed;

        if status.success() {
            info!("Encoder finished: {}", self.label);
        } else {
            warn!("Encoder {} exited with {}", self.label, status);
        }

        Ok(())
    }

    fn state(&self) -> EncoderState {
        self.state
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Writes raw frames into the chunk file without transcoding
pub struct RawFileEncoder {
    label: String,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    state: EncoderState,
}

impl RawFileEncoder {
    pub fn create(path: &Path, label: String) -> Result<Self> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create chunk file {:?}", path))?;

        Ok(Self {
            label,
            path: path.to_path_buf(),
            file: Some(tokio::fs::File::from_std(file)),
            state: EncoderState::Started,
        })
    }
}

#[async_trait::async_trait]
impl EncoderProcess for RawFileEncoder {
    async fn write(&mut self, frame: &[u8]) -> bool {
        if self.state != EncoderState::Started {
            return false;
        }
        let Some(file) = self.file.as_mut() else {
            return false;
        };

        if let Err(e) = file.write_all(frame).await {
            warn!("Failed to write frame to {:?}: {}", self.path, e);
            self.file = None;
            self.state = EncoderState::Closed;
            return false;
        }
        true
    }

    async fn stop(&mut self) -> Result<()> {
        self.state = EncoderState::Ending;
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .with_context(|| format!("Failed to flush chunk {:?}", self.path))?;
            file.sync_all()
                .await
                .with_context(|| format!("Failed to sync chunk {:?}", self.path))?;
        }
        self.state = EncoderState::Closed;
        Ok(())
    }

    fn state(&self) -> EncoderState {
        self.state
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Spawns one encoder per chunk and stream kind
pub trait EncoderFactory: Send + Sync {
    fn spawn(&self, kind: StreamKind, output: &Path) -> Result<Box<dyn EncoderProcess>>;
}

/// Spawns the configured transcoder, substituting `{output}` in its arguments
pub struct SubprocessEncoderFactory {
    config: EncoderConfig,
}

impl SubprocessEncoderFactory {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    fn args_for(&self, kind: StreamKind, output: &Path) -> Vec<String> {
        let template = match kind {
            StreamKind::Depth => &self.config.depth_args,
            _ => &self.config.color_args,
        };
        let output = output.display().to_string();
        template
            .iter()
            .map(|arg| arg.replace("{output}", &output))
            .collect()
    }
}

impl EncoderFactory for SubprocessEncoderFactory {
    fn spawn(&self, kind: StreamKind, output: &Path) -> Result<Box<dyn EncoderProcess>> {
        let label = label_for(kind, output);
        let encoder = SubprocessEncoder::spawn(
            &self.config.program,
            &self.args_for(kind, output),
            self.config.end_sentinel.as_ref().map(|s| s.as_bytes().to_vec()),
            self.config.queue_frames,
            Duration::from_millis(self.config.stop_timeout_ms),
            label,
        )?;
        Ok(Box::new(encoder))
    }
}

pub struct RawFileEncoderFactory;

impl EncoderFactory for RawFileEncoderFactory {
    fn spawn(&self, kind: StreamKind, output: &Path) -> Result<Box<dyn EncoderProcess>> {
        Ok(Box::new(RawFileEncoder::create(output, label_for(kind, output))?))
    }
}

fn label_for(kind: StreamKind, output: &Path) -> String {
    let file = output
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{}:{}", kind, file)
}

/// Pick the encoder factory from configuration
pub fn encoder_factory(config: &EncoderConfig) -> Arc<dyn EncoderFactory> {
    if config.program.trim().is_empty() {
        info!("No encoder program configured, writing raw chunks");
        Arc::new(RawFileEncoderFactory)
    } else {
        Arc::new(SubprocessEncoderFactory::new(config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_raw_encoder_drops_writes_after_stop() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("chunk.bin");

        let mut encoder = RawFileEncoderFactory.spawn(StreamKind::Color, &path)?;
        assert!(encoder.write(b"abc").await);
        encoder.stop().await?;
        assert_eq!(encoder.state(), EncoderState::Closed);
        assert!(!encoder.write(b"def").await);

        assert_eq!(std::fs::read(&path)?, b"abc");
        Ok(())
    }

    #[tokio::test]
    async fn test_subprocess_spawn_failure_is_an_error() {
        let factory = SubprocessEncoderFactory::new(EncoderConfig {
            program: "/nonexistent/encoder-binary".to_string(),
            ..EncoderConfig::default()
        });
        let result = factory.spawn(StreamKind::Depth, Path::new("/tmp/never.mp4"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stalled_transcoder_drops_frames_and_is_killed() -> Result<()> {
        // `sleep` never reads its stdin
        let mut encoder = SubprocessEncoder::spawn(
            "sleep",
            &["1000".to_string()],
            None,
            2,
            Duration::from_millis(200),
            "color:stalled".to_string(),
        )?;

        let frame = vec![0u8; 1024 * 1024];
        let mut accepted = 0;
        for _ in 0..8 {
            let written = tokio::time::timeout(Duration::from_secs(1), encoder.write(&frame)).await?;
            if written {
                accepted += 1;
            }
        }
        assert!(accepted < 8, "a stalled pipe must not accept every frame");

        tokio::time::timeout(Duration::from_secs(3), encoder.stop()).await??;
        assert_eq!(encoder.state(), EncoderState::Closed);
        assert!(!encoder.write(&frame).await);
        Ok(())
    }

    #[test]
    fn test_output_placeholder_substitution() {
        let factory = SubprocessEncoderFactory::new(EncoderConfig {
            program: "ffmpeg".to_string(),
            color_args: vec!["-i".into(), "-".into(), "{output}".into()],
            depth_args: vec!["-f".into(), "gray16le".into(), "{output}".into()],
            ..EncoderConfig::default()
        });
        assert_eq!(
            factory.args_for(StreamKind::Depth, Path::new("/x/d.mp4")),
            vec!["-f", "gray16le", "/x/d.mp4"]
        );
        assert_eq!(
            factory.args_for(StreamKind::Color, Path::new("/x/c.mp4")),
            vec!["-i", "-", "/x/c.mp4"]
        );
    }
}
