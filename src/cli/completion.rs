//! Shell completion generation for exportd

use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io;

use crate::cli::CliArgs;

/// Write the completion script for `shell` to stdout
pub fn generate_completion(shell: Shell) {
    let mut cmd = CliArgs::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

/// Completion script for `shell` as a string
pub fn completion_script(shell: Shell) -> String {
    let mut cmd = CliArgs::command();
    let name = cmd.get_name().to_string();
    let mut buffer = Vec::new();
    generate(shell, &mut cmd, name, &mut buffer);
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_script_mentions_subcommands() {
        let script = completion_script(Shell::Bash);
        assert!(script.contains("exportd"));
        assert!(script.contains("download"));
    }

    #[test]
    fn test_zsh_and_fish_generate() {
        assert!(!completion_script(Shell::Zsh).is_empty());
        assert!(!completion_script(Shell::Fish).is_empty());
    }
}
