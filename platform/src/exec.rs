//! Shared subprocess-invocation helper: logs argv at `debug`, and any
//! nonzero exit at `warn`, matching the original `common/exec.c` /
//! `common/err.c` diagnostic-prefix convention.

use std::path::PathBuf;
use std::process::{Command, Output};

use cvmboot_core::{CvmbootError, Result};

/// Resolves `name` on `$PATH`, failing with a clear `NotFound` rather than
/// letting `Command::output` surface an opaque ENOENT later.
pub fn require_tool(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| CvmbootError::NotFound(format!("required external tool not found on PATH: {name}")))
}

pub fn run(cmd: &mut Command) -> Result<Output> {
    tracing::debug!(?cmd, "running external command");
    let output = cmd.output().map_err(|e| {
        CvmbootError::ExternalToolFailure(format!("failed to spawn {:?}: {e}", cmd.get_program()))
    })?;

    if !output.status.success() {
        tracing::warn!(
            program = ?cmd.get_program(),
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "external command exited nonzero"
        );
        return Err(CvmbootError::ExternalToolFailure(format!(
            "{:?} exited with {}: {}",
            cmd.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_tool_fails_for_unknown_binary() {
        assert!(require_tool("cvmboot-definitely-not-a-real-tool").is_err());
    }

    #[test]
    fn run_reports_nonzero_exit() {
        let err = run(Command::new("false")).unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }
}
