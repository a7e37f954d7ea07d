//! Shell completion generation.

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::env;
use std::io;
use std::path::Path;

use crate::{Cli, CliError};

/// Generate shell completions to stdout.
///
/// Without an explicit shell, the one named by `$SHELL` is used.
pub(crate) fn cmd_completions(shell: Option<Shell>) -> Result<()> {
    let shell = match shell.or_else(detect_shell_type) {
        Some(shell) => shell,
        None => {
            return Err(CliError::Usage(
                "Could not detect your shell. Please specify it explicitly:\n  \
                 blinkflash completions bash"
                    .to_string(),
            )
            .into());
        },
    };

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }

    // On Windows, try PSModulePath for PowerShell detection
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }

    None
}

/// Map a shell binary path to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path_known() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/local/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("/usr/bin/elvish"), Some(Shell::Elvish));
        assert_eq!(shell_from_path("/usr/bin/pwsh"), Some(Shell::PowerShell));
    }

    #[test]
    fn test_shell_from_path_just_name() {
        assert_eq!(shell_from_path("bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("fish"), Some(Shell::Fish));
    }

    #[test]
    fn test_shell_from_path_unknown() {
        assert_eq!(shell_from_path("/usr/bin/tcsh"), None);
        assert_eq!(shell_from_path("/usr/bin/ksh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_completions_explicit_shell() {
        assert!(cmd_completions(Some(Shell::Bash)).is_ok());
    }
}
