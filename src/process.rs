//! Launching the external renderer and tearing down its process tree.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use crate::error::{QueueError, QueueResult};
use crate::invocation::CommandPlan;

/// How a render process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
}

/// A running render process.
pub trait RenderProcess: Send {
    fn id(&self) -> u32;

    /// Polls for exit without blocking. Once this returns `Some`, every output
    /// line of the process has already been forwarded.
    fn try_wait(&mut self) -> QueueResult<Option<ProcessExit>>;

    /// Terminates the process and every process it started.
    fn terminate_tree(&mut self) -> QueueResult<()>;
}

/// Starts render processes whose output lines are forwarded to `lines`.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, plan: &CommandPlan, lines: Sender<String>)
        -> QueueResult<Box<dyn RenderProcess>>;
}

/// Launches real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(
        &self,
        plan: &CommandPlan,
        lines: Sender<String>,
    ) -> QueueResult<Box<dyn RenderProcess>> {
        let mut command = Command::new(&plan.program);
        command
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &plan.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so the whole tree can be signalled at once.
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|error| {
            QueueError::process_launch(format!("{}: {error}", plan.display_command()))
        })?;
        tracing::debug!(pid = child.id(), program = %plan.program.display(), "renderer started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader("renderq-stdout", stdout, lines.clone())?);
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader("renderq-stderr", stderr, lines)?);
        }

        Ok(Box::new(SystemProcess { child, readers }))
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    name: &str,
    stream: R,
    lines: Sender<String>,
) -> QueueResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buffer = Vec::new();
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buffer);
                        let line = line.trim_end_matches(['\r', '\n']);
                        tracing::debug!(target: "renderq::render_output", "{line}");
                        if lines.send(line.to_owned()).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to read renderer output");
                        break;
                    }
                }
            }
        })
        .map_err(|error| QueueError::process_launch(format!("failed to spawn {name} reader: {error}")))
}

struct SystemProcess {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

impl SystemProcess {
    fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

impl RenderProcess for SystemProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> QueueResult<Option<ProcessExit>> {
        let status = self
            .child
            .try_wait()
            .map_err(|error| QueueError::process_launch(format!("failed to poll renderer: {error}")))?;
        Ok(status.map(|status| {
            self.join_readers();
            ProcessExit {
                code: status.code(),
                success: status.success(),
            }
        }))
    }

    fn terminate_tree(&mut self) -> QueueResult<()> {
        let pid = self.child.id();
        if let Err(error) = kill_tree(pid) {
            tracing::warn!(pid, %error, "process tree kill failed, killing renderer only");
        }
        match self.child.kill() {
            Ok(()) => {}
            // Already exited.
            Err(error) if error.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(error) => {
                return Err(QueueError::process_launch(format!(
                    "failed to kill renderer {pid}: {error}"
                )))
            }
        }
        let _ = self.child.wait();
        self.join_readers();
        Ok(())
    }
}

#[cfg(unix)]
fn kill_tree(pid: u32) -> std::io::Result<()> {
    let status = Command::new("kill")
        .args(["-TERM", "--", &format!("-{pid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("kill exited with {status}")))
    }
}

#[cfg(windows)]
fn kill_tree(pid: u32) -> std::io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}
