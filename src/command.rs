//! Running external programs with a deadline
//!
//! Every external binary (supervisor, compose, proxy, build tools) goes
//! through [`run`], which captures output and kills the child if the
//! deadline passes.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Characters of output kept when attaching output to errors
pub const OUTPUT_TAIL_CHARS: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("empty command line")]
    Empty,
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },
}

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.trim().to_string(),
            (false, true) => self.stdout.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
        }
    }

    /// The last [`OUTPUT_TAIL_CHARS`] characters of combined output
    pub fn tail(&self) -> String {
        tail(&self.combined(), OUTPUT_TAIL_CHARS)
    }
}

/// Last `max` characters of `text`
pub fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        text.chars().skip(count - max).collect()
    }
}

/// Build a command from an argv array
pub fn command_from(argv: &[String]) -> Result<Command, CommandError> {
    let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Build a command from an argv array, running in `dir`
pub fn command_in(argv: &[String], dir: &Path) -> Result<Command, CommandError> {
    let mut cmd = command_from(argv)?;
    cmd.current_dir(dir);
    Ok(cmd)
}

/// Substitute `{name}` placeholders in every argument
pub fn expand(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

/// Run a command to completion, killing it if `timeout` elapses.
///
/// A non-zero exit is not an error here; callers inspect
/// [`CommandOutput::success`].
pub async fn run(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput, CommandError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd.kill_on_drop(true);

    debug!(program = %program, "Running command");

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => return Err(CommandError::Spawn { program, source }),
        Err(_) => {
            return Err(CommandError::TimedOut {
                program,
                secs: timeout.as_secs(),
            })
        }
    };

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expand() {
        let template = argv(&["nginx", "-t", "-c", "{config}", "--site={name}-{name}"]);
        let expanded = expand(&template, &[("config", "/tmp/x.conf"), ("name", "blog")]);
        assert_eq!(expanded, argv(&["nginx", "-t", "-c", "/tmp/x.conf", "--site=blog-blog"]));
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello world", 5), "world");
    }

    #[test]
    fn test_command_from_empty() {
        assert!(matches!(command_from(&[]), Err(CommandError::Empty)));
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let mut cmd = command_from(&argv(&["sh", "-c", "echo out; echo err >&2; exit 3"])).unwrap();
        let output = run(&mut cmd, Duration::from_secs(10)).await.unwrap();

        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.combined(), "out\nerr");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let mut cmd = command_from(&argv(&["sleep", "5"])).unwrap();
        let result = run(&mut cmd, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(CommandError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn test_run_missing_binary() {
        let mut cmd = command_from(&argv(&["/nonexistent/siteplane-binary"])).unwrap();
        let result = run(&mut cmd, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CommandError::Spawn { .. })));
    }
}
