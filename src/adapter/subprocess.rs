use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::process::{ChildStderr, ChildStdin};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::{EventStream, GameAdapter, KickCommand, ServerProcess, SubprocessConfig};
use crate::bridge::{AsyncBridge, CommandDispatcher, CommandSender, ShutdownSignal};
use crate::errors::TransportError;
use crate::event::ParsedEvent;
use crate::processor::{MessageProcessor, OpenArenaProcessor};

/// How long the console loop waits for a line before checking the shutdown flag again.
const IDLE_WAIT: Duration = Duration::from_millis(10);
const DISCONNECT_WAIT: Duration = Duration::from_secs(5);

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// Writes `command\r\n` to the server's stdin.
struct StdinWriter {
    stdin: SharedStdin,
}

impl StdinWriter {
    fn write(&self, command: &str) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        let stdin = guard.as_mut().ok_or(TransportError::NotConnected)?;
        stdin
            .write_all(format!("{command}\r\n").as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| match e.kind() {
                ErrorKind::BrokenPipe => TransportError::BrokenPipe {
                    command: command.to_owned(),
                },
                _ => TransportError::Io(e),
            })
    }
}

#[async_trait]
impl CommandSender for StdinWriter {
    async fn send_command(&self, command: String) {
        match self.write(&command) {
            Ok(()) => debug!(command, "command written"),
            Err(e) => error!("failed to send command: {e}"),
        }
    }
}

fn spawn_console_reader(stderr: ChildStderr, tx: Sender<String>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("console-reader".into())
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim_end().to_owned();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("failed to read from server: {e}");
                        break;
                    }
                }
            }
            debug!("console reader finished");
        })
}

/// Adapter for a dedicated server run as a child process.
///
/// The server logs on stderr, one event per line. Commands go to stdin terminated by CRLF;
/// a broken pipe is logged and otherwise ignored.
pub struct SubprocessAdapter {
    config: SubprocessConfig,
    process: Option<ServerProcess>,
    stdin: SharedStdin,
    lines: Option<Receiver<String>>,
    reader: Option<JoinHandle<()>>,
    processor: OpenArenaProcessor,
    commands: CommandDispatcher,
    shutdown: ShutdownSignal,
}

impl SubprocessAdapter {
    pub fn new(config: SubprocessConfig, bridge: AsyncBridge) -> Self {
        let stdin: SharedStdin = Arc::new(Mutex::new(None));
        let shutdown = bridge.shutdown_signal();
        let commands = CommandDispatcher::new(
            Arc::new(StdinWriter {
                stdin: stdin.clone(),
            }),
            bridge,
        );
        let processor = OpenArenaProcessor::new(Some(commands.callback()));

        Self {
            config,
            process: None,
            stdin,
            lines: None,
            reader: None,
            processor,
            commands,
            shutdown,
        }
    }

    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }

    /// Pid of the running server, if any.
    pub fn server_pid(&self) -> Option<u32> {
        self.process.as_ref().map(ServerProcess::id)
    }

    pub fn current_map(&self) -> Option<&str> {
        self.processor.current_map()
    }

    fn is_connected(&mut self) -> bool {
        self.lines.is_some() && self.process.as_mut().is_some_and(|p| p.is_running())
    }

    fn release(&mut self) {
        // closing stdin first lets a well-behaved server exit on its own
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut process) = self.process.take() {
            match process.try_kill(DISCONNECT_WAIT) {
                Ok(()) => info!(pid = process.id(), "game server stopped"),
                Err(e) => warn!("could not stop game server: {e}"),
            }
        }
        self.lines = None;
        if let Some(reader) = self.reader.take() {
            if !reader.is_finished() {
                // a grandchild may still hold stderr open
                debug!("detaching console reader");
            }
        }
    }

    fn next_event(&mut self) -> Option<ParsedEvent> {
        loop {
            if self.shutdown.is_requested() {
                info!("shutdown requested, leaving console loop");
                return None;
            }
            let lines = self.lines.as_ref()?;
            match lines.recv_timeout(IDLE_WAIT) {
                Ok(line) => {
                    if line.trim().is_empty() && !self.processor.is_in_block() {
                        continue;
                    }
                    return Some(self.processor.process(&line));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("server console closed");
                    self.lines = None;
                    return None;
                }
            }
        }
    }
}

impl GameAdapter for SubprocessAdapter {
    fn name(&self) -> &'static str {
        "openarena"
    }

    #[instrument(skip_all, fields(binary = %self.config.binary))]
    fn connect(&mut self) -> bool {
        if self.is_connected() {
            debug!("already connected");
            return true;
        }
        if self.process.is_some() {
            // previous server died without a disconnect
            self.release();
        }

        let mut process = match ServerProcess::launch(&self.config.binary, &self.config.args) {
            Ok(process) => process,
            Err(e) => {
                error!("could not start game server: {e}");
                return false;
            }
        };
        let (Some(stdin), Some(stderr)) = (process.take_stdin(), process.take_stderr()) else {
            error!("game server started without piped stdio");
            return false;
        };
        let (tx, rx) = mpsc::channel();
        let reader = match spawn_console_reader(stderr, tx) {
            Ok(reader) => reader,
            Err(e) => {
                error!("could not start console reader: {e}");
                return false;
            }
        };

        info!(pid = process.id(), "game server started");
        *self.stdin.lock().unwrap_or_else(PoisonError::into_inner) = Some(stdin);
        self.process = Some(process);
        self.lines = Some(rx);
        self.reader = Some(reader);
        self.processor.reset();
        self.shutdown.clear();
        true
    }

    fn events(&mut self) -> EventStream<'_> {
        Box::new(std::iter::from_fn(move || self.next_event()))
    }

    fn commands(&self) -> CommandDispatcher {
        self.commands.clone()
    }

    fn disconnect(&mut self) {
        self.shutdown.request();
        self.release();
    }

    fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    fn kick_format(&self) -> KickCommand {
        |client_id| format!("clientkick {client_id}")
    }
}

impl Drop for SubprocessAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod subprocess_tests {
    use super::*;

    #[test]
    fn writing_without_a_process_is_not_connected() {
        let writer = StdinWriter {
            stdin: Arc::new(Mutex::new(None)),
        };
        assert!(matches!(
            writer.write("status"),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn write_after_server_closed_stdin_is_a_broken_pipe() {
        let mut adapter = SubprocessAdapter::new(
            SubprocessConfig {
                binary: "sh".into(),
                args: vec!["-c".into(), "exec 0<&-; sleep 0.2".into()],
            },
            AsyncBridge::new(),
        );
        assert!(adapter.connect());
        assert_eq!(adapter.events().next(), None);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while adapter.process.as_mut().is_some_and(|p| p.is_running())
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }

        // logged by the sender, never raised to the caller
        adapter.send_command("say one");
        adapter.send_command("say two");

        let writer = StdinWriter {
            stdin: adapter.stdin.clone(),
        };
        for _ in 0..2 {
            assert!(matches!(
                writer.write("status"),
                Err(TransportError::BrokenPipe { command }) if command == "status"
            ));
        }
        adapter.disconnect();
    }

    #[test]
    fn connect_fails_for_missing_binary() {
        let mut adapter = SubprocessAdapter::new(
            SubprocessConfig {
                binary: "/nonexistent/oa_ded".into(),
                args: vec![],
            },
            AsyncBridge::new(),
        );
        assert!(!adapter.connect());
        assert_eq!(adapter.server_pid(), None);
        assert_eq!(adapter.events().next(), None);
        adapter.disconnect();
        adapter.disconnect();
    }
}
