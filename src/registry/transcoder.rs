//! Transcoder process spawning
//!
//! The transcoder reads FLV on stdin and writes HLS artifacts into the
//! session's output directory. Its stdout and stderr are forwarded to the
//! log line by line and never interpreted.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};

use crate::error::SessionError;

/// Replaced by the session output directory in every argument
pub const OUTPUT_DIR_PLACEHOLDER: &str = "{output_dir}";

/// Program and argument template for the transcoder
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscoderConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TranscoderConfig {
    /// ffmpeg remuxing FLV from stdin into a rolling 3 x 1s HLS window
    fn default() -> Self {
        Self::new(
            "ffmpeg",
            [
                "-re",
                "-fflags",
                "+nobuffer",
                "-flags",
                "low_delay",
                "-f",
                "flv",
                "-i",
                "pipe:0",
                "-c:v",
                "copy",
                "-c:a",
                "copy",
                "-f",
                "hls",
                "-hls_time",
                "1",
                "-hls_list_size",
                "3",
                "-hls_flags",
                "delete_segments+temp_file+independent_segments",
                "-hls_segment_type",
                "mpegts",
                "-hls_allow_cache",
                "0",
                "-hls_segment_filename",
                "{output_dir}/live_%03d.ts",
                "{output_dir}/live.m3u8",
            ],
        )
    }
}

impl TranscoderConfig {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Arguments with the output directory substituted
    pub fn args_for(&self, output_dir: &Path) -> Vec<String> {
        let dir = output_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(OUTPUT_DIR_PLACEHOLDER, &dir))
            .collect()
    }

    /// Spawn the transcoder for `output_dir` with all standard streams piped
    pub fn spawn(&self, output_dir: &Path) -> Result<SpawnedTranscoder, SessionError> {
        let mut cmd = Command::new(&self.program);

        cmd.args(self.args_for(output_dir))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SessionError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;

        // Dropping `child` on the error path kills it
        let stdin = child
            .stdin
            .take()
            .ok_or(SessionError::MissingPipe("stdin"))?;
        let pid = child.id();

        Ok(SpawnedTranscoder { child, stdin, pid })
    }
}

/// A running transcoder with its input pipe split off
pub struct SpawnedTranscoder {
    /// Child handle, still owning stdout and stderr
    pub child: Child,
    /// FLV input
    pub stdin: ChildStdin,
    /// OS process ID
    pub pid: Option<u32>,
}

/// Forward a child output stream to the log until it closes
pub(crate) fn forward_output<R>(identity: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(identity = %identity, stream = stream, "{}", line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(identity = %identity, stream = stream, error = %e, "Transcoder output read failed");
                    break;
                }
            }
        }
    });
}
