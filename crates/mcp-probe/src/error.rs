use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode outbound message: {0}")]
    Encoding(#[source] serde_json::Error),
    #[error("outbound channel to child is closed")]
    ChannelClosed,
    #[error("malformed line ({reason}): {line}")]
    MalformedLine { line: String, reason: String },
    #[error("invalid script: {0}")]
    InvalidScript(String),
    #[error("failed to signal child {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProbeError {
    /// Launch and encoding failures abort the run; everything else degrades
    /// toward termination.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Launch { .. } | Self::Encoding(_) | Self::InvalidScript(_)
        )
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch_error",
            Self::Encoding(_) => "encoding_error",
            Self::ChannelClosed => "channel_closed",
            Self::MalformedLine { .. } => "malformed_line",
            Self::InvalidScript(_) => "invalid_script",
            Self::Signal { .. } => "signal_error",
            Self::Io(_) => "io_error",
        }
    }
}

pub(crate) const fn is_closed_pipe(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::ProbeError;

    #[test]
    fn only_launch_and_encoding_are_fatal() {
        let launch = ProbeError::Launch {
            command: "missing".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(launch.is_fatal());
        assert!(!ProbeError::ChannelClosed.is_fatal());
        assert!(
            !ProbeError::MalformedLine {
                line: "not json".to_string(),
                reason: "expected value".to_string(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn launch_error_names_command() {
        let err = ProbeError::Launch {
            command: "/nope/server".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/nope/server"));
        assert_eq!(err.kind(), "launch_error");
    }
}
