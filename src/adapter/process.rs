use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::errors::TransportError;

fn create_process(command: &str, args: &[String]) -> Result<Child, TransportError> {
    let mut cmd = Command::new(command);
    // stdout is never read, a piped one would eventually block the server
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    cmd.spawn().map_err(|source| TransportError::Spawn {
        binary: command.to_owned(),
        source,
    })
}

fn wait_for_process_exit(child: &mut Child, max_duration: Duration) -> Result<(), TransportError> {
    let deadline = Instant::now() + max_duration;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if Instant::now() > deadline {
            return Err(TransportError::KillTimeout {
                pid: child.id(),
                waited: max_duration,
            });
        }
        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
}

/// A game server child process, killed when dropped.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    cleaned_up: bool,
}

impl ServerProcess {
    pub fn launch(command: &str, args: &[String]) -> Result<ServerProcess, TransportError> {
        let child = create_process(command, args)?;
        Ok(ServerProcess {
            child,
            cleaned_up: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the process and wait up to `max_duration` for it to be reaped.
    pub fn try_kill(&mut self, max_duration: Duration) -> Result<(), TransportError> {
        if self.is_running() {
            self.child.kill()?;
        }
        wait_for_process_exit(&mut self.child, max_duration)?;
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_millis(100);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!("server process {} was not cleaned up: {e}", self.child.id());
            }
        }
    }
}
