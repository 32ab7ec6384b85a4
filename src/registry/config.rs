//! Registry configuration

use std::path::PathBuf;
use std::time::Duration;

use super::transcoder::TranscoderConfig;

/// Settings shared by every session the registry creates
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base directory; each identity gets `<output_dir>/<identity>`
    pub output_dir: PathBuf,

    /// How long a stopping transcoder may take to exit before it is killed
    pub termination_timeout: Duration,

    /// Delay between termination and removal of the output directory
    pub cleanup_delay: Duration,

    /// Transcoder program and arguments
    pub transcoder: TranscoderConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./streams"),
            termination_timeout: Duration::from_secs(2),
            cleanup_delay: Duration::from_secs(2),
            transcoder: TranscoderConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Set the output base directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the forced-termination timeout
    pub fn termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    /// Set the output directory cleanup delay
    pub fn cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }

    /// Set the transcoder command
    pub fn transcoder(mut self, transcoder: TranscoderConfig) -> Self {
        self.transcoder = transcoder;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();

        assert_eq!(config.output_dir, PathBuf::from("./streams"));
        assert_eq!(config.termination_timeout, Duration::from_secs(2));
        assert_eq!(config.cleanup_delay, Duration::from_secs(2));
        assert_eq!(config.transcoder.program, "ffmpeg");
    }

    #[test]
    fn test_builder_chaining() {
        let config = RegistryConfig::default()
            .output_dir("/tmp/hls")
            .termination_timeout(Duration::from_millis(500))
            .cleanup_delay(Duration::ZERO)
            .transcoder(TranscoderConfig::new("sh", ["-c", "cat"]));

        assert_eq!(config.output_dir, PathBuf::from("/tmp/hls"));
        assert_eq!(config.termination_timeout, Duration::from_millis(500));
        assert_eq!(config.cleanup_delay, Duration::ZERO);
        assert_eq!(config.transcoder.program, "sh");
    }
}
