use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::config::SandboxConfig;
use crate::environment::EnvironmentDescriptor;

use super::{SessionError, Workspace};

/// Upper bound for the external kill command, e.g. `docker kill`
const KILL_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A running sandbox runtime process bound to one workspace
///
/// Owned by the controller for the whole session. The child is spawned with
/// `kill_on_drop`, so dropping the handle never leaves it running.
pub struct SandboxProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdin_writer: Option<JoinHandle<io::Result<()>>>,
    kill_command: Option<Vec<String>>,
    /// Id of the process group led by the runtime process
    process_group: Option<u32>,
    exited: bool,
    terminated: bool,
}

/// Starts the sandbox runtime against `workspace`
///
/// When `input` is given, stdin is piped and a task writes the whole payload
/// and closes the pipe while output is being read. Otherwise stdin is null so
/// the program sees end-of-input immediately.
pub fn launch(
    config: &SandboxConfig,
    descriptor: &EnvironmentDescriptor,
    workspace: &Workspace,
    session_id: &str,
    input: Option<Vec<u8>>,
) -> Result<SandboxProcess, SessionError> {
    let workspace_path = workspace.path().to_string_lossy();
    let mut mapping = HashMap::<&str, &str>::new();
    mapping.insert("%WORKSPACE%", &workspace_path);
    mapping.insert("%FILE%", &descriptor.file_name);
    mapping.insert("%TAG%", &descriptor.sandbox_tag);
    mapping.insert("%SESSION%", session_id);
    mapping.insert("%ENV%", &descriptor.id);

    let command = apply_template(&config.command, &mapping);
    let kill_command = config
        .kill_command
        .as_ref()
        .map(|template| apply_template(template, &mapping));

    let Some((program, args)) = command.split_first() else {
        return Err(SessionError::Launch("empty sandbox command".to_string()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workspace.path())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so termination reaches everything the runtime forks
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| SessionError::Launch(format!("{program}: {e}")))?;
    log::debug!(
        "Session {session_id} spawned {program} (pid {:?})",
        child.id()
    );

    let stdin_writer = match input {
        Some(payload) => {
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| SessionError::Launch("stdin was not captured".to_string()))?;
            Some(tokio::spawn(write_input(stdin, payload)))
        }
        None => None,
    };

    Ok(SandboxProcess {
        process_group: child.id(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        child,
        stdin_writer,
        kill_command,
        exited: false,
        terminated: false,
    })
}

impl SandboxProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Waits for the runtime process to exit
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.exited = true;
        Ok(status)
    }

    /// Forcibly stops the sandboxed program
    ///
    /// Kills the whole process group, then runs the configured kill command
    /// since stopping a container client does not stop the container itself.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        // Once reaped, the group id may be reused by another session's runtime
        if !self.exited {
            self.kill_process_group();
            if let Err(e) = self.child.start_kill() {
                log::debug!("start_kill failed: {e}");
            }
        }

        if let Some(kill_command) = &self.kill_command {
            run_kill_command(kill_command).await;
        }
    }

    fn kill_process_group(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.process_group {
            // SAFETY: killpg takes no pointers. The group id is still ours since
            // callers only get here while the leader has not been reaped.
            let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                log::trace!("killpg({pgid}): {}", io::Error::last_os_error());
            }
        }
    }

    /// Joins the stdin writer; a closed pipe only means the program stopped reading
    pub async fn finish_input(&mut self) {
        let Some(writer) = self.stdin_writer.take() else {
            return;
        };
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                log::debug!("Program closed stdin before reading all input");
            }
            Ok(Err(e)) => log::warn!("Failed to write program input: {e}"),
            Err(e) => log::warn!("Input writer task failed: {e}"),
        }
    }
}

impl Drop for SandboxProcess {
    fn drop(&mut self) {
        if self.exited || self.terminated {
            return;
        }
        // Session future dropped mid-run; `kill_on_drop` handles the child itself
        log::warn!("Sandbox process {:?} dropped while running", self.process_group);
        self.kill_process_group();
        if let (Some(kill_command), Ok(handle)) = (
            self.kill_command.take(),
            tokio::runtime::Handle::try_current(),
        ) {
            handle.spawn(async move { run_kill_command(&kill_command).await });
        }
    }
}

async fn write_input(stdin: ChildStdin, payload: Vec<u8>) -> io::Result<()> {
    let mut stdin = tokio::io::BufWriter::new(stdin);
    stdin.write_all(&payload).await?;
    stdin.flush().await?;
    // Dropping the writer closes the pipe and signals end-of-input
    Ok(())
}

async fn run_kill_command(command: &[String]) {
    let Some((program, args)) = command.split_first() else {
        return;
    };
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(KILL_COMMAND_TIMEOUT, status).await {
        Ok(Ok(status)) if status.success() => log::debug!("Kill command {program} succeeded"),
        // The runtime may already be gone, which is the normal case after an exit
        Ok(Ok(status)) => log::debug!("Kill command {program} exited with {status}"),
        Ok(Err(e)) => log::warn!("Failed to run kill command {program}: {e}"),
        Err(_) => log::warn!("Kill command {program} timed out"),
    }
}

/// Applies placeholder substitutions to every argument of a command template
fn apply_template(template: &[String], mapping: &HashMap<&str, &str>) -> Vec<String> {
    template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}
