//! Shell completions.

use clap::CommandFactory;
use clap_complete::Shell;

use crate::cli::args::Cli;
use crate::error::RollsyncError;

/// Generate the completion script for `shell`.
///
/// # Errors
///
/// Returns `RollsyncError::Config` if the generated script is not UTF-8.
pub fn completions(shell: Shell) -> Result<String, RollsyncError> {
    let mut cmd = Cli::command();
    let mut buf = Vec::new();
    clap_complete::generate(shell, &mut cmd, "rollsync", &mut buf);
    String::from_utf8(buf).map_err(|e| RollsyncError::Config(format!("UTF-8 error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_completions_name_the_binary() {
        let script = completions(Shell::Bash).unwrap();
        assert!(script.contains("rollsync"));
    }
}
