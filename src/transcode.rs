//! Incremental transcoding of a live byte stream.
//!
//! A [`Transcoder`] spawns one external process per preparation. The raw
//! stream is piped into the process while it is still being downloaded, and
//! the encoded output is written to the temporary file as it is produced.
//!
//! Whether transcoding succeeded is decided by the exit status of the
//! process, tracked in [`State`], and never by looking at the file system.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use bytes::Bytes;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, Command},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TranscoderConfig,
    error::{Error, Result},
};

/// Amount of transcoded output read and written at a time (32 KiB).
pub const BUFFER_LEN: usize = 32 * 1024;

/// Lifecycle of a transcoding process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// The process was started and has not been reaped yet.
    Running,

    /// The process was killed, either by cancellation or because the
    /// preparation failed elsewhere.
    Canceled,

    /// The process exited on its own with this status.
    Completed(ExitStatus),
}

impl State {
    /// Whether the process exited on its own and successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(status) if status.success())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Canceled => write!(f, "canceled"),
            Self::Completed(status) => write!(f, "completed ({status})"),
        }
    }
}

/// Starts transcoding processes.
#[derive(Clone, Debug)]
pub struct Transcoder {
    config: TranscoderConfig,
}

impl Transcoder {
    #[must_use]
    pub fn new(config: &TranscoderConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Starts transcoding into `temp_path`.
    ///
    /// The file at `temp_path` is created, or truncated if it exists. The
    /// process is killed when the returned [`Transcode`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file could not be created or the process
    /// could not be started.
    pub async fn spawn(&self, temp_path: &Path) -> Result<Transcode> {
        let output = File::create(temp_path).await?;

        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::unavailable(format!("failed to start {}: {e}", self.config.program))
            });

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                drop(output);
                remove_temp(temp_path).await;
                return Err(e);
            }
        };

        trace!(
            "started {} (pid {}) for {}",
            self.config.program,
            child.id().unwrap_or_default(),
            temp_path.display()
        );

        Ok(Transcode {
            child,
            output: Some(output),
            temp_path: temp_path.to_owned(),
            state: State::Running,
        })
    }
}

/// A running transcoding process and its temporary output file.
#[derive(Debug)]
pub struct Transcode {
    child: Child,
    output: Option<File>,
    temp_path: PathBuf,
    state: State,
}

impl Transcode {
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Pipes `input` through the process into the temporary file.
    ///
    /// `on_write` is called with the length of every chunk after it was
    /// written to the temporary file. Standard input of the process is closed
    /// when `input` ends. On success the temporary file is synced, closed and
    /// left in place for promotion, and the number of bytes written is
    /// returned.
    ///
    /// On any error, and when `cancel` fires, the process is killed and the
    /// temporary file removed before returning.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when `cancel` fires, `Internal` when the process
    /// exits unsuccessfully, and I/O errors from reading, writing or syncing.
    pub async fn run<F>(
        &mut self,
        input: mpsc::Receiver<Bytes>,
        cancel: &CancellationToken,
        on_write: F,
    ) -> Result<u64>
    where
        F: FnMut(usize) + Send,
    {
        let outcome = tokio::select! {
            biased;

            () = cancel.cancelled() => None,
            result = self.pipe(input, on_write) => Some(result),
        };

        let result = match outcome {
            Some(result) => result,
            None => {
                self.terminate().await;
                Err(Error::cancelled(format!(
                    "canceled transcoding into {}",
                    self.temp_path.display()
                )))
            }
        };

        if result.is_err() {
            self.terminate().await;
            self.remove_output().await;
        }

        result
    }

    async fn pipe<F>(&mut self, mut input: mpsc::Receiver<Bytes>, mut on_write: F) -> Result<u64>
    where
        F: FnMut(usize) + Send,
    {
        let mut stdin = self
            .child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("transcoder input not captured"))?;
        let mut stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("transcoder output not captured"))?;
        let stderr = self.child.stderr.take();
        let mut output = self
            .output
            .take()
            .ok_or_else(|| Error::internal("temporary file already closed"))?;

        let feed = async move {
            while let Some(chunk) = input.recv().await {
                if let Err(e) = stdin.write_all(&chunk).await {
                    // The process stopped reading; its exit status tells why.
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        debug!("transcoder closed its input");
                        break;
                    }
                    return Err(e);
                }
            }

            // Dropping `stdin` signals the end of input.
            Ok(())
        };

        let drain = async {
            let mut buf = vec![0; BUFFER_LEN];
            let mut written = 0;

            loop {
                let len = stdout.read(&mut buf).await?;
                if len == 0 {
                    break;
                }

                output.write_all(&buf[..len]).await?;
                written += len as u64;
                on_write(len);
            }

            output.flush().await?;
            output.sync_all().await?;
            Ok::<_, std::io::Error>(written)
        };

        let (_, written, last_line) = tokio::try_join!(feed, drain, diagnostics(stderr))?;
        drop(output);

        let status = self.child.wait().await?;
        self.state = State::Completed(status);

        if status.success() {
            trace!("transcoding into {} ended", self.temp_path.display());
            Ok(written)
        } else {
            let reason = last_line.map(|line| format!(": {line}")).unwrap_or_default();
            Err(Error::internal(format!("transcoder exited with {status}{reason}")))
        }
    }

    /// Kills the process if it is still running, and reaps it.
    pub async fn terminate(&mut self) {
        if self.state != State::Running {
            return;
        }

        if let Err(e) = self.child.kill().await {
            warn!("failed to kill transcoder: {e}");
        }
        self.state = State::Canceled;
    }

    /// Removes the temporary output file if present.
    async fn remove_output(&mut self) {
        drop(self.output.take());
        remove_temp(&self.temp_path).await;
    }
}

/// Removes a temporary output file, logging failures other than its absence.
async fn remove_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => trace!("removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("failed to remove {}: {e}", path.display()),
    }
}

/// Logs what the process reports on standard error, returning the last line.
async fn diagnostics(stderr: Option<ChildStderr>) -> std::io::Result<Option<String>> {
    let Some(stderr) = stderr else {
        return Ok(None);
    };

    let mut lines = BufReader::new(stderr).lines();
    let mut last = None;
    while let Some(line) = lines.next_line().await? {
        trace!("transcoder: {line}");
        last = Some(line);
    }

    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn shell(script: &str) -> Transcoder {
        Transcoder::new(&TranscoderConfig {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned()],
            extension: "opus".to_owned(),
        })
    }

    async fn feed(chunks: &[&'static [u8]]) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            tx.send(Bytes::from_static(chunk)).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn writes_output_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("song.opus");

        let mut transcode = shell("cat").spawn(&temp_path).await.unwrap();
        assert_eq!(transcode.state(), State::Running);

        let input = feed(&[b"hello ", b"world"]).await;
        let mut reported = 0;
        let written = transcode
            .run(input, &CancellationToken::new(), |len| reported += len)
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(reported, 11);
        assert!(transcode.state().is_success());
        assert_eq!(tokio::fs::read(&temp_path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn unsuccessful_exit_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("song.opus");

        let mut transcode = shell("cat >/dev/null; echo 'invalid data' >&2; exit 3")
            .spawn(&temp_path)
            .await
            .unwrap();

        let input = feed(&[b"not audio"]).await;
        let err = transcode
            .run(input, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.to_string().contains("invalid data"));
        assert!(matches!(transcode.state(), State::Completed(status) if !status.success()));
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn cancellation_kills_process_and_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("song.opus");

        let mut transcode = shell("cat").spawn(&temp_path).await.unwrap();

        // Keep the sender alive so that input never ends.
        let (tx, rx) = mpsc::channel(1);
        tx.send(Bytes::from_static(b"partial")).await.unwrap();

        let cancel = CancellationToken::new();
        let canceler = cancel.clone();
        let err = transcode
            .run(rx, &cancel, move |_| canceler.cancel())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(transcode.state(), State::Canceled);
        assert!(!temp_path.exists());
        drop(tx);
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("song.opus");

        let transcoder = Transcoder::new(&TranscoderConfig {
            program: "songprep-no-such-transcoder".to_owned(),
            args: Vec::new(),
            extension: "opus".to_owned(),
        });

        let err = transcoder.spawn(&temp_path).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn remove_temp_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("song.opus");

        tokio::fs::write(&temp_path, b"partial").await.unwrap();
        remove_temp(&temp_path).await;
        assert!(!temp_path.exists());

        remove_temp(&temp_path).await;
        assert!(!temp_path.exists());
    }
}
