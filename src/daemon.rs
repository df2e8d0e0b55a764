//! PID-file based lifecycle for long-running services.

use crate::error::PipelineError;
use crate::process::{command_line, pid_alive, terminate};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Expected argument vector of a managed process. The program is compared by
/// file name so that PATH lookups and absolute paths match each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSignature {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSignature {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    pub fn matches(&self, cmd: &[String]) -> bool {
        let Some((first, rest)) = cmd.split_first() else {
            return false;
        };
        Path::new(first).file_name() == self.program.file_name() && rest == self.args.as_slice()
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running { pid: u32 },
    Dead { pid: u32 },
    /// Alive, but the PID now belongs to something else.
    Foreign { pid: u32, command_line: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    NotRunning,
    Running(Vec<u32>),
    /// PID file exists but at least one recorded process is dead or foreign.
    Stale(Vec<ProcessState>),
}

impl ServiceStatus {
    /// LSB init-script status codes.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceStatus::Running(_) => 0,
            ServiceStatus::Stale(_) => 1,
            ServiceStatus::NotRunning => 3,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::NotRunning => write!(f, "not running"),
            ServiceStatus::Running(pids) => write!(f, "running (pids {:?})", pids),
            ServiceStatus::Stale(states) => {
                write!(f, "stale PID file:")?;
                for state in states {
                    match state {
                        ProcessState::Running { pid } => write!(f, " {} running;", pid)?,
                        ProcessState::Dead { pid } => write!(f, " {} dead;", pid)?,
                        ProcessState::Foreign { pid, command_line } => {
                            write!(f, " {} is now {:?};", pid, command_line.join(" "))?
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct DaemonManager {
    name: String,
    pid_file: PathBuf,
    stop_timeout: Duration,
}

impl DaemonManager {
    pub fn new(name: &str, pid_file: PathBuf) -> Self {
        Self { name: name.to_string(), pid_file, stop_timeout: DEFAULT_STOP_TIMEOUT }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Launch every command detached in its own process group and record the PIDs.
    ///
    /// The PID file is claimed with `O_EXCL` before anything is spawned, so
    /// of two concurrent starts only one launches the service.
    pub fn start(&self, commands: &[CommandSignature]) -> Result<Vec<u32>, PipelineError> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.pid_file) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PipelineError::AlreadyRunning(self.pid_file.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut pids = Vec::with_capacity(commands.len());
        for signature in commands {
            let spawned = signature
                .command()
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .process_group(0)
                .spawn();
            match spawned {
                Ok(child) => pids.push(child.id()),
                Err(e) => {
                    for pid in &pids {
                        terminate(*pid);
                    }
                    drop(file);
                    let _ = fs::remove_file(&self.pid_file);
                    return Err(PipelineError::Subprocess {
                        program: signature.program.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        let body: String = pids.iter().map(|pid| format!("{}\n", pid)).collect();
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        info!(service = %self.name, pids = ?pids, "service started");
        Ok(pids)
    }

    fn read_pids(&self) -> Result<Vec<u32>, PipelineError> {
        let text = match fs::read_to_string(&self.pid_file) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::NotRunning(self.pid_file.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                l.trim().parse::<u32>().map_err(|_| {
                    PipelineError::Config(format!("corrupt PID file {}: {:?}", self.pid_file.display(), l))
                })
            })
            .collect()
    }

    /// Ask every recorded process to terminate, wait for them to exit and
    /// remove the PID file. Processes still alive after the stop timeout
    /// keep their PID file and the call fails.
    pub fn stop(&self) -> Result<(), PipelineError> {
        let pids = self.read_pids()?;
        for pid in &pids {
            if terminate(*pid) {
                info!(service = %self.name, pid = pid, "sent SIGTERM");
            } else {
                warn!(service = %self.name, pid = pid, "process already gone");
            }
        }
        let lingering = self.wait_for_exit(&pids);
        if !lingering.is_empty() {
            warn!(service = %self.name, pids = ?lingering, "processes did not exit after SIGTERM");
            return Err(PipelineError::Subprocess {
                program: self.name.clone(),
                reason: format!("pids {:?} still running after {:?}", lingering, self.stop_timeout),
            });
        }
        fs::remove_file(&self.pid_file)?;
        Ok(())
    }

    fn wait_for_exit(&self, pids: &[u32]) -> Vec<u32> {
        let deadline = Instant::now() + self.stop_timeout;
        loop {
            let alive: Vec<u32> = pids.iter().copied().filter(|pid| pid_alive(*pid)).collect();
            if alive.is_empty() || Instant::now() >= deadline {
                return alive;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Check each recorded PID against the expected signatures; each
    /// signature may account for one process only.
    pub fn status(&self, expected: &[CommandSignature]) -> Result<ServiceStatus, PipelineError> {
        let pids = match self.read_pids() {
            Ok(pids) => pids,
            Err(PipelineError::NotRunning(_)) => return Ok(ServiceStatus::NotRunning),
            Err(e) => return Err(e),
        };
        let mut unmatched: Vec<&CommandSignature> = expected.iter().collect();
        let mut states = Vec::with_capacity(pids.len());
        for pid in pids {
            let state = match command_line(pid) {
                None => ProcessState::Dead { pid },
                Some(cmd) => match unmatched.iter().position(|s| s.matches(&cmd)) {
                    Some(index) => {
                        unmatched.remove(index);
                        ProcessState::Running { pid }
                    }
                    None => ProcessState::Foreign { pid, command_line: cmd },
                },
            };
            states.push(state);
        }
        if states.iter().all(|s| matches!(s, ProcessState::Running { .. })) && !states.is_empty() {
            Ok(ServiceStatus::Running(
                states
                    .iter()
                    .filter_map(|s| match s {
                        ProcessState::Running { pid } => Some(*pid),
                        _ => None,
                    })
                    .collect(),
            ))
        } else {
            Ok(ServiceStatus::Stale(states))
        }
    }
}
