//! Shell command inspection used by the command-prefix and file-path rules.
//!
//! Commands are tokenized with `shlex`; a command that does not tokenize (unbalanced
//! quotes and the like) yields `None` so the request goes to the model instead.

/// Tools whose subcommand is part of the prefix (`git commit`, `cargo test`).
const TWO_WORD_COMMANDS: &[&str] = &["git", "npm", "docker", "kubectl", "cargo", "go", "pip", "yarn"];

/// Commands whose positional arguments are the files they read.
const READING_COMMANDS: &[&str] = &["cat", "head", "tail", "less", "more", "bat", "type"];

pub const INJECTION_DETECTED: &str = "command_injection_detected";
pub const NO_PREFIX: &str = "none";

/// Prefix of `command` for the permission policy check.
pub fn extract_prefix(command: &str) -> Option<String> {
    if command.contains('`') || command.contains("$(") {
        return Some(INJECTION_DETECTED.to_string());
    }

    let parts = shlex::split(command)?;

    // Skip leading `VAR=value` assignments.
    let cmd_parts: Vec<&str> = parts
        .iter()
        .map(String::as_str)
        .skip_while(|p| p.contains('=') && !p.starts_with('-'))
        .collect();

    let Some(first) = cmd_parts.first() else {
        return Some(NO_PREFIX.to_string());
    };

    if TWO_WORD_COMMANDS.contains(first) {
        if let Some(second) = cmd_parts.get(1) {
            if !second.starts_with('-') {
                return Some(format!("{first} {second}"));
            }
        }
    }

    Some((*first).to_string())
}

/// Files a command read, as a `<filepaths>` block. Anything that is not a reading
/// command answers an empty block.
pub fn extract_filepaths(command: &str) -> Option<String> {
    let parts = shlex::split(command)?;

    let paths: Vec<&str> = match parts.first() {
        Some(program) if READING_COMMANDS.contains(&base_name(program).as_str()) => parts[1..]
            .iter()
            .map(String::as_str)
            .filter(|p| !p.starts_with('-'))
            .collect(),
        _ => Vec::new(),
    };

    if paths.is_empty() {
        Some("<filepaths>\n</filepaths>".to_string())
    } else {
        Some(format!("<filepaths>\n{}\n</filepaths>", paths.join("\n")))
    }
}

/// Text after the last `Command:` marker.
pub fn command_after_marker(text: &str) -> Option<&str> {
    let start = text.rfind("Command:")? + "Command:".len();
    Some(text[start..].trim())
}

/// The command of a "Command: ... Output: ..." prompt.
pub fn command_before_output(text: &str) -> Option<&str> {
    let start = text.find("Command:")? + "Command:".len();
    let output_at = start + text[start..].find("Output:")?;
    Some(text[start..output_at].trim())
}

fn base_name(program: &str) -> String {
    program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(program)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(cmd: &str) -> String {
        extract_prefix(cmd).unwrap()
    }

    #[test]
    fn test_single_word_prefix() {
        assert_eq!(prefix("ls -la /tmp"), "ls");
        assert_eq!(prefix("rm -rf build"), "rm");
    }

    #[test]
    fn test_two_word_prefix() {
        assert_eq!(prefix("git commit -m 'fix bug'"), "git commit");
        assert_eq!(prefix("cargo test --workspace"), "cargo test");
        assert_eq!(prefix("git --version"), "git");
        assert_eq!(prefix("npm"), "npm");
    }

    #[test]
    fn test_env_assignments_skipped() {
        assert_eq!(prefix("RUST_LOG=debug cargo run"), "cargo run");
        assert_eq!(prefix("A=1 B=2"), NO_PREFIX);
    }

    #[test]
    fn test_injection_detected() {
        assert_eq!(prefix("echo `whoami`"), INJECTION_DETECTED);
        assert_eq!(prefix("echo $(cat /etc/passwd)"), INJECTION_DETECTED);
    }

    #[test]
    fn test_empty_and_unparseable() {
        assert_eq!(prefix("   "), NO_PREFIX);
        assert_eq!(extract_prefix("echo 'unterminated"), None);
    }

    #[test]
    fn test_filepaths_for_reading_commands() {
        assert_eq!(
            extract_filepaths("cat -n src/main.rs Cargo.toml").unwrap(),
            "<filepaths>\nsrc/main.rs\nCargo.toml\n</filepaths>"
        );
        assert_eq!(
            extract_filepaths("/usr/bin/head -20 README.md").unwrap(),
            "<filepaths>\nREADME.md\n</filepaths>"
        );
    }

    #[test]
    fn test_filepaths_empty_for_other_commands() {
        assert_eq!(extract_filepaths("ls -la").unwrap(), "<filepaths>\n</filepaths>");
        assert_eq!(extract_filepaths("cargo build").unwrap(), "<filepaths>\n</filepaths>");
        assert_eq!(extract_filepaths("cat").unwrap(), "<filepaths>\n</filepaths>");
    }

    #[test]
    fn test_command_markers() {
        let text = "<policy_spec>...</policy_spec>\nCommand: git status";
        assert_eq!(command_after_marker(text), Some("git status"));

        let text = "Command: cat a.txt\nOutput: hello\n\nExtract the filepaths";
        assert_eq!(command_before_output(text), Some("cat a.txt"));
        assert_eq!(command_before_output("Output: first Command: x"), None);
    }
}
