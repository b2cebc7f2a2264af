use std::{io, path::PathBuf};

use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to initialize redirection to {target}: {source}")]
    Redirect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to open {target} ({status}): {detail}")]
    Open {
        target: String,
        status: i32,
        detail: String,
    },
    #[error("unrecognized command: {0}")]
    NotFound(String),
    #[error("cannot delegate to a subshell: SHEXSPEC is not set")]
    NoSubshell,
    #[error("cannot read {path}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Parse(#[from] crate::parse::CommandParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl ExecError {
    /// Whether direct creation was refused in a way the desktop opener may
    /// still be able to handle.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Launch { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    pub fn is_redirection(&self) -> bool {
        matches!(self, Self::Redirect { .. })
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("process parameters unavailable: {0}")]
    Parameters(String),
    #[error("cannot read process memory: {0}")]
    MemoryRead(#[source] nix::Error),
    #[error("environment read fell below one page")]
    ProbeExhausted,
    #[error("environment block is not terminated")]
    InvalidEnvironment,
    #[error("environment block is empty")]
    EmptyEnvironment,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_recognized() {
        let err = ExecError::Launch {
            program: "doc.txt".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(err.is_permission_denied());

        let err = ExecError::Launch {
            program: "missing".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(!err.is_permission_denied());
    }

    #[test]
    fn redirect_error_names_target() {
        let err = ExecError::Redirect {
            target: "/nope/out.txt".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.is_redirection());
        assert!(err.to_string().contains("/nope/out.txt"));
    }
}
