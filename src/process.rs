//! Execution of external tools without a shell.
//!
//! Every tool the backup and restore pipelines depend on (`pg_dump`, `psql`,
//! `git`, the dependency installer, ...) is described by a [CommandSpec] and
//! executed through a [CommandRunner]. Arguments are passed as a list, never
//! interpolated into a shell string.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use derive_more::{Display, Error};

/// Interval in which a running child is checked for termination.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where the standard output of a command ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stdout {
    /// Captured into [CommandOutput::stdout].
    Capture,
    /// Streamed into the given file, which is created or truncated.
    File(PathBuf),
}

/// Description of a single external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Additional environment. Values are never logged.
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    pub stdout: Stdout,
    /// Overrides the default timeout of the [CommandRunner].
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
            stdout: Stdout::Capture,
            timeout: None,
        }
    }

    /// Build a command from an argv style list, e.g. taken from the settings file.
    ///
    /// Returns [None] for an empty list.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Stdout::File(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; [None] if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Display, Error)]
/// Errors of external tool invocations.
pub enum CommandError {
    /// The program could not be started at all.
    #[display("Unable to run `{command}`: {source}")]
    NotRun { command: String, source: io::Error },
    /// The program exited unsuccessfully.
    #[display("`{command}` failed with exit code {}: {}", code_display(output.code), output.stderr.trim())]
    Failed {
        command: String,
        output: CommandOutput,
    },
    /// The program did not finish in time and was killed.
    #[display("`{command}` timed out after {}s", timeout.as_secs())]
    TimedOut {
        command: String,
        timeout: Duration,
    },
    /// Waiting for the program or collecting its output failed.
    #[display("I/O error while running `{command}`: {source}")]
    Io { command: String, source: io::Error },
}

fn code_display(code: Option<i32>) -> String {
    code.map_or_else(|| "<signal>".into(), |c| c.to_string())
}

/// Executes [CommandSpec]s.
///
/// Implemented by [SystemRunner] for real processes. Tests substitute
/// their own implementation to script tool behaviour.
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion.
    ///
    /// A non-zero exit code is reported as [CommandError::Failed].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as child processes of the current process.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    default_timeout: Duration,
}

impl SystemRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let command = spec.to_string();
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let io_err = |source| CommandError::Io {
            command: command.clone(),
            source,
        };
        log::trace!(target: "process", "Running: {command}");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        match &spec.stdout {
            Stdout::Capture => {
                cmd.stdout(Stdio::piped());
            }
            Stdout::File(path) => {
                cmd.stdout(File::create(path).map_err(io_err)?);
            }
        }

        let mut child = cmd.spawn().map_err(|source| CommandError::NotRun {
            command: command.clone(),
            source,
        })?;

        // drain pipes concurrently, a full pipe would block the child forever
        let stdout_reader = child.stdout.take().map(|pipe| thread::spawn(move || read_all(pipe)));
        let stderr_reader = child.stderr.take().map(|pipe| thread::spawn(move || read_all(pipe)));

        let deadline = Instant::now() + timeout;
        let status: ExitStatus = loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                break status;
            }
            if Instant::now() >= deadline {
                log::warn!(target: "process", "Killing `{command}` after {}s", timeout.as_secs());
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::TimedOut { command, timeout });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = join_reader(stdout_reader).map_err(io_err)?;
        let stderr = join_reader(stderr_reader).map_err(io_err)?;
        let output = CommandOutput {
            code: status.code(),
            stdout,
            stderr,
        };

        if !output.success() {
            return Err(CommandError::Failed { command, output });
        }

        // relay stderr
        if !output.stderr.trim().is_empty() {
            log::debug!(target: "process", "{}: {}", spec.program, output.stderr.trim_end());
        }

        Ok(output)
    }
}

fn read_all(mut pipe: impl Read) -> io::Result<String> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn join_reader(reader: Option<thread::JoinHandle<io::Result<String>>>) -> io::Result<String> {
    match reader {
        None => Ok(String::new()),
        Some(handle) => handle
            .join()
            .map_err(|_| io::Error::other("output reader thread panicked"))?,
    }
}
