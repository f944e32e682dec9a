use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to launch decoder `{program}`: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },
    #[error("decoder `{program}` exited with {status} for {path}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        path: PathBuf,
    },
}

/// Converts a carved segment whose payload this tool does not interpret.
/// Decode failures are reported to the caller but never invalidate the
/// extraction itself; the carved bytes stay on disk either way.
pub trait ExternalDecoder: Sync {
    fn decode(&self, input: &Path) -> Result<(), DecodeError>;
}

/// Runs a configured command per segment, `{input}` in the argument list
/// standing for the carved file's path. Output lands next to the input,
/// which is the convention of the usual companion tools.
pub struct CommandDecoder {
    program: String,
    args: Vec<String>,
}

impl CommandDecoder {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl ExternalDecoder for CommandDecoder {
    fn decode(&self, input: &Path) -> Result<(), DecodeError> {
        let mut cmd = Command::new(&self.program);
        let mut saw_placeholder = false;
        for arg in &self.args {
            if arg == "{input}" {
                saw_placeholder = true;
                cmd.arg(input);
            } else {
                cmd.arg(arg);
            }
        }
        if !saw_placeholder {
            cmd.arg(input);
        }

        debug!(program = %self.program, input = %input.display(), "invoking external decoder");
        let status = cmd.status().map_err(|source| DecodeError::Launch {
            program: self.program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(DecodeError::Failed {
                program: self.program.clone(),
                status,
                path: input.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_command_is_ok() {
        let decoder = CommandDecoder::new("true", vec![]);
        assert!(decoder.decode(Path::new("/tmp/x.msf")).is_ok());
    }

    #[test]
    fn failing_command_reports_status() {
        let decoder = CommandDecoder::new("false", vec![]);
        let err = decoder.decode(Path::new("/tmp/x.msf")).unwrap_err();
        assert!(matches!(err, DecodeError::Failed { .. }));
    }

    #[test]
    fn missing_program_reports_launch_error() {
        let decoder = CommandDecoder::new("definitely-not-a-real-decoder", vec![]);
        let err = decoder.decode(Path::new("/tmp/x.msf")).unwrap_err();
        assert!(matches!(err, DecodeError::Launch { .. }));
    }

    #[test]
    fn placeholder_substitution() {
        // `test -f {input}` succeeds only when the path exists.
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let decoder = CommandDecoder::new(
            "test",
            vec!["-f".to_string(), "{input}".to_string()],
        );
        assert!(decoder.decode(tmp.path()).is_ok());
        assert!(decoder.decode(Path::new("/no/such/file")).is_err());
    }
}
