use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// External media tool used to post-process and join chunk files
///
/// Implementations:
/// - `FfmpegTool`: stream-copy remux and the concat demuxer
/// - `PassthroughTool`: plain file copy and byte append (raw streams, tests)
#[async_trait::async_trait]
pub trait MediaTool: Send + Sync {
    /// Turn one closed unprocessed chunk into its processed form
    async fn remux(&self, input: &Path, output: &Path) -> Result<()>;

    /// Join `inputs` in the given order into `output`
    ///
    /// `list_file` is a scratch path the tool may use for a file list.
    async fn concat(&self, inputs: &[PathBuf], list_file: &Path, output: &Path) -> Result<()>;

    /// Get tool name for logging
    fn name(&self) -> &str;
}

/// Runs an ffmpeg-compatible binary
pub struct FfmpegTool {
    program: String,
}

impl FfmpegTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        debug!("Running {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}:\n{}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl MediaTool for FfmpegTool {
    async fn remux(&self, input: &Path, output: &Path) -> Result<()> {
        let args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.display().to_string(),
        ];
        self.run(&args).await
    }

    async fn concat(&self, inputs: &[PathBuf], list_file: &Path, output: &Path) -> Result<()> {
        let mut list = String::new();
        for input in inputs {
            let escaped = input.display().to_string().replace('\'', "'\\''");
            list.push_str(&format!("file '{}'\n", escaped));
        }
        tokio::fs::write(list_file, list)
            .await
            .with_context(|| format!("Failed to write concat list {:?}", list_file))?;

        let args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list_file.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.display().to_string(),
        ];
        self.run(&args).await
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Copies and appends bytes without interpreting them
pub struct PassthroughTool;

#[async_trait::async_trait]
impl MediaTool for PassthroughTool {
    async fn remux(&self, input: &Path, output: &Path) -> Result<()> {
        tokio::fs::copy(input, output)
            .await
            .with_context(|| format!("Failed to copy {:?} to {:?}", input, output))?;
        Ok(())
    }

    async fn concat(&self, inputs: &[PathBuf], _list_file: &Path, output: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(output)
            .await
            .with_context(|| format!("Failed to create {:?}", output))?;

        for input in inputs {
            let bytes = tokio::fs::read(input)
                .await
                .with_context(|| format!("Failed to read chunk {:?}", input))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("Failed to append to {:?}", output))?;
        }

        file.flush().await.context("Failed to flush concatenated file")?;
        Ok(())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Media tool factory
pub struct MediaToolFactory;

impl MediaToolFactory {
    /// An empty program name selects the passthrough tool
    pub fn create(program: &str) -> Box<dyn MediaTool> {
        if program.trim().is_empty() {
            info!("Using passthrough media tool");
            Box::new(PassthroughTool)
        } else {
            info!("Using media tool: {}", program);
            Box::new(FfmpegTool::new(program))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_passthrough_concat_keeps_input_order() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        tokio::fs::write(&a, b"first").await?;
        tokio::fs::write(&b, b"second").await?;

        let out = temp_dir.path().join("out");
        PassthroughTool
            .concat(&[b.clone(), a.clone()], &temp_dir.path().join("list"), &out)
            .await?;

        assert_eq!(tokio::fs::read(&out).await?, b"secondfirst");
        Ok(())
    }

    #[test]
    fn test_factory_selects_by_program() {
        assert_eq!(MediaToolFactory::create("").name(), "passthrough");
        assert_eq!(MediaToolFactory::create("ffmpeg").name(), "ffmpeg");
    }
}
