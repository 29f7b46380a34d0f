// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, internal_error};
use log::{debug, info, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::launch_error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

// How long a terminated tool gets to exit on SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

// Bound on waiting for the output readers once the tool has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// Process groups of tools that have been started and not yet reaped. A
// terminal interrupt reaches only our own group, so these are killed
// explicitly on shutdown.
static ACTIVE_GROUPS: Mutex<BTreeSet<i32>> = Mutex::new(BTreeSet::new());

fn active_groups() -> std::sync::MutexGuard<'static, BTreeSet<i32>> {
    match ACTIVE_GROUPS.lock() {
        Ok(groups) => groups,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Process groups of the external tools currently running.
pub fn active_process_groups() -> Vec<i32> {
    active_groups().iter().copied().collect()
}

/// Kills every running tool's process group. For use from an interrupt
/// handler just before exiting.
pub fn kill_active_tools() {
    let groups = active_process_groups();
    for group in groups {
        warn!("Killing tool process group {}", group);
        if let Err(e) = killpg(Pid::from_raw(group), Signal::SIGKILL) {
            debug!("SIGKILL to group {} failed: {:?}", group, e);
        }
    }
}

/// Result of running an external tool to completion or to its deadline.
#[derive(Debug)]
pub struct ToolOutput {
    // None if the exit status could not be collected.
    pub status: Option<ExitStatus>,

    // True if the tool was still running at the deadline and was killed.
    pub timed_out: bool,

    // Interleaved stdout and stderr lines, in arrival order.
    pub lines: Vec<String>,

    // Just the stdout lines.
    pub stdout: Vec<String>,

    pub elapsed: Duration,
}

impl ToolOutput {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// A running external tool. The tool is started in its own process group so
/// that termination also reaches any helpers it spawned. Dropping a
/// ToolSubprocess that has not been waited on terminates it.
pub struct ToolSubprocess {
    name: String,
    child: Child,
    output: Arc<Mutex<Vec<String>>>,
    stdout: Arc<Mutex<Vec<String>>>,
    stdout_worker: Option<JoinHandle<()>>,
    stderr_worker: Option<JoinHandle<()>>,
    status: Option<ExitStatus>,
    reaped: bool,
}

impl Drop for ToolSubprocess {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
        }
    }
}

impl ToolSubprocess {
    pub fn spawn<I, S>(program: &Path, args: I) -> Result<Self, CanonicalError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let name = program.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        let mut command = Command::new(program);
        command.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        debug!("Running {:?}", command);
        let mut child = match command.spawn() {
            Err(e) => {
                return Err(launch_error(
                    format!("Command::spawn error for {:?}: {:?}", program, e).as_str()));
            },
            Ok(child) => {
                info!("{} subprocess started (pid {})", name, child.id());
                child
            }
        };
        // With process_group(0) the group id is the child's pid.
        active_groups().insert(child.id() as i32);
        let output = Arc::new(Mutex::new(Vec::<String>::new()));
        let stdout_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let stdout_worker = child.stdout.take().map(
            |stdout| Self::make_output_worker(
                name.clone(), stdout, vec![output.clone(), stdout_lines.clone()]));
        let stderr_worker = child.stderr.take().map(
            |stderr| Self::make_output_worker(
                name.clone(), stderr, vec![output.clone()]));
        Ok(ToolSubprocess{
            name,
            child,
            output,
            stdout: stdout_lines,
            stdout_worker,
            stderr_worker,
            status: None,
            reaped: false,
        })
    }

    fn make_output_worker(name: String,
                          stream: impl Read + Send + 'static,
                          sinks: Vec<Arc<Mutex<Vec<String>>>>) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::<u8>::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,  // Reached EOF.
                    Ok(_) => {},
                    Err(e) => {
                        debug!("{} output read error: {:?}", name, e);
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                debug!("{}: {}", name, line);
                for sink in &sinks {
                    match sink.lock() {
                        Ok(mut lines) => lines.push(line.clone()),
                        Err(poisoned) => poisoned.into_inner().push(line.clone()),
                    }
                }
            }
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Blocks until the tool exits or `timeout` elapses, whichever is first.
    /// On expiry the tool is terminated; output produced up to that point is
    /// still returned.
    pub fn wait_timeout(mut self, timeout: Duration)
                        -> Result<ToolOutput, CanonicalError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut timed_out = false;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.status = Some(status);
                    self.mark_reaped();
                    break;
                },
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!("{} still running after {:?}; terminating",
                              self.name, timeout);
                        timed_out = true;
                        self.terminate();
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                },
                Err(e) => {
                    self.terminate();
                    return Err(internal_error(
                        format!("wait error for {}: {:?}", self.name, e).as_str()));
                }
            }
        }
        let (lines, stdout) = self.drain();
        debug!("{} finished with {:?} after {:?}",
               self.name, self.status, start.elapsed());
        Ok(ToolOutput{
            status: self.status,
            timed_out,
            lines,
            stdout,
            elapsed: start.elapsed(),
        })
    }

    // Sends SIGTERM to the tool's process group, then SIGKILL if the tool has
    // not exited within TERMINATE_GRACE. Always reaps the tool.
    fn terminate(&mut self) {
        let group = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!("SIGTERM to {} group failed: {:?}", self.name, e);
        }
        let deadline = Instant::now() + TERMINATE_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.status = Some(status);
                    break;
                },
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(POLL_INTERVAL);
                },
                _ => {
                    warn!("{} ignored SIGTERM; sending SIGKILL", self.name);
                    if let Err(e) = self.child.kill() {
                        debug!("kill of {} failed: {:?}", self.name, e);
                    }
                    self.status = self.child.wait().ok();
                    break;
                }
            }
        }
        // Helpers spawned by the tool may still hold its output pipes.
        let _ = killpg(group, Signal::SIGKILL);
        self.mark_reaped();
        info!("{} subprocess stopped", self.name);
    }

    fn mark_reaped(&mut self) {
        self.reaped = true;
        active_groups().remove(&(self.child.id() as i32));
    }

    // Returns all lines, then the stdout lines.
    fn drain(&mut self) -> (Vec<String>, Vec<String>) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let workers = [self.stdout_worker.take(), self.stderr_worker.take()];
        for worker in workers.into_iter().flatten() {
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!("{} output still open after exit; not waiting for it",
                      self.name);
            }
        }
        (snapshot(&self.output), snapshot(&self.stdout))
    }
}

fn snapshot(lines: &Mutex<Vec<String>>) -> Vec<String> {
    match lines.lock() {
        Ok(lines) => lines.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Runs `program` with `args`, blocking for at most `timeout` (plus a small
/// termination overhead).
pub fn run_tool<I, S>(program: &Path, args: I, timeout: Duration)
                      -> Result<ToolOutput, CanonicalError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    ToolSubprocess::spawn(program, args)?.wait_timeout(timeout)
}
