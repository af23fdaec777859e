//! Post-processing shell command templates.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

use crate::ConfigError;

/// The single substitution slot in a command template.
pub const PLACEHOLDER: &str = "{}";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: String,
        stderr: String,
    },
}

/// Captured result of a successful command run.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
}

/// A shell command with exactly one `{}` slot for the output file path.
///
/// Validated when parsed so a malformed template fails the run before any
/// file is converted. Quotes written directly around the slot (`'{}'` or
/// `"{}"`) are absorbed: the path is always passed as a single word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    template: String,
    prefix: String,
    suffix: String,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        if template.trim().is_empty() {
            return Err(invalid("template is empty"));
        }
        match template.matches(PLACEHOLDER).count() {
            0 => Err(invalid("missing `{}` placeholder for the output path")),
            1 => {
                let (prefix, suffix) = template
                    .split_once(PLACEHOLDER)
                    .ok_or_else(|| invalid("missing `{}` placeholder for the output path"))?;
                let (prefix, suffix) = strip_slot_quotes(prefix, suffix);
                Ok(Self {
                    template: template.to_string(),
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                })
            }
            _ => Err(invalid("more than one `{}` placeholder")),
        }
    }

    /// The command line as the shell receives it, for logs.
    pub fn render(&self, path: &Path) -> String {
        format!("{}{}{}", self.prefix, quote(path), self.suffix)
    }

    /// Run the command once for `path`.
    ///
    /// On Unix the path is passed to `sh -c` as `$1` rather than spliced into
    /// the script, so spaces and quotes in file names survive intact.
    pub fn run(&self, path: &Path) -> Result<CommandOutcome, CommandError> {
        let rendered = self.render(path);
        let output = self
            .build(path)
            .output()
            .map_err(|source| CommandError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| format!("exit code {c}"))
                .unwrap_or_else(|| "a signal".to_string());
            return Err(CommandError::NonZeroExit {
                command: rendered,
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutcome { stdout, stderr })
    }

    #[cfg(unix)]
    fn build(&self, path: &Path) -> Command {
        let script = format!("{}\"$1\"{}", self.prefix, self.suffix);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).arg("sh").arg(path);
        cmd
    }

    #[cfg(not(unix))]
    fn build(&self, path: &Path) -> Command {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(self.render(path));
        cmd
    }
}

/// Drop one pair of matching quotes that directly encloses the slot.
fn strip_slot_quotes<'a>(prefix: &'a str, suffix: &'a str) -> (&'a str, &'a str) {
    for q in ['\'', '"'] {
        if let (Some(p), Some(s)) = (prefix.strip_suffix(q), suffix.strip_prefix(q)) {
            return (p, s);
        }
    }
    (prefix, suffix)
}

#[cfg(unix)]
fn quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

#[cfg(not(unix))]
fn quote(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

impl std::str::FromStr for CommandTemplate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_exactly_one_placeholder() {
        assert!(CommandTemplate::parse("wc -l {}").is_ok());
        assert!(matches!(
            CommandTemplate::parse("wc -l"),
            Err(ConfigError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            CommandTemplate::parse("cp {} {}.bak"),
            Err(ConfigError::InvalidTemplate { .. })
        ));
        assert!(CommandTemplate::parse("   ").is_err());
    }

    #[test]
    fn display_keeps_the_original_template() {
        let t = CommandTemplate::parse("gzip -t '{}' && echo ok").unwrap();
        assert_eq!(t.to_string(), "gzip -t '{}' && echo ok");
    }

    #[cfg(unix)]
    #[test]
    fn render_shows_the_quoted_path() {
        let t = CommandTemplate::parse("gzip -t {} && echo ok").unwrap();
        assert_eq!(
            t.render(Path::new("/out/a.txt")),
            "gzip -t '/out/a.txt' && echo ok"
        );
        let t = CommandTemplate::parse("cat \"{}\"").unwrap();
        assert_eq!(t.render(Path::new("/out/it's.txt")), r"cat '/out/it'\''s.txt'");
    }

    #[test]
    fn quotes_around_the_slot_are_absorbed() {
        for template in ["cat '{}'", "cat \"{}\"", "cat {}"] {
            let t = CommandTemplate::parse(template).unwrap();
            assert_eq!(t.prefix, "cat ");
            assert_eq!(t.suffix, "");
        }
        // Only a pair that directly encloses the slot
        let t = CommandTemplate::parse("echo '{}.bak").unwrap();
        assert_eq!(t.prefix, "echo '");
        assert_eq!(t.suffix, ".bak");
    }

    #[cfg(unix)]
    #[test]
    fn run_passes_path_with_spaces_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my file's name.txt");
        std::fs::write(&path, "hello\n").unwrap();

        let t = CommandTemplate::parse("cat {}").unwrap();
        let outcome = t.run(&path).unwrap();
        assert_eq!(outcome.stdout, "hello\n");
    }

    #[cfg(unix)]
    #[test]
    fn run_handles_quoted_slot_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my file.txt");
        std::fs::write(&path, "quoted\n").unwrap();

        for template in ["cat '{}'", "cat \"{}\""] {
            let outcome = CommandTemplate::parse(template).unwrap().run(&path).unwrap();
            assert_eq!(outcome.stdout, "quoted\n", "template {template}");
            assert!(outcome.stderr.is_empty());
        }
    }

    #[cfg(unix)]
    #[test]
    fn run_reports_non_zero_exit() {
        let t = CommandTemplate::parse("test -d {}").unwrap();
        let err = t.run(Path::new("/definitely/not/here")).unwrap_err();
        match err {
            CommandError::NonZeroExit { code, .. } => assert_eq!(code, "exit code 1"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
