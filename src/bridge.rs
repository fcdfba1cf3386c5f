//! Bridge between the blocking ingestion loop and the asynchronous side-effect runtime.
//!
//! Event handlers run on the ingestion thread and must never await side effects inline. They
//! hand work over through [`AsyncBridge::schedule_async`], which spawns it on the side-effect
//! runtime if one is attached, and drops it once a shutdown was requested.
//!
//! Commands to the game server go through [`CommandDispatcher::send_sync`], which has two
//! explicit paths:
//! - an [`AsyncContext`] is attached: the command is queued and the call returns at once. Each
//!   dispatcher has a single queue drained by one task on the context, so commands reach the
//!   server in the order they were sent;
//! - no context is attached: the command runs to completion on a one-shot current-thread
//!   runtime before the call returns.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc::{self, error::SendError, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::TransportError;
use crate::processor::CommandCallback;

/// Cooperative cancellation flag shared by an adapter, its event loop and the bridge.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the flag for a new session.
    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runtime currently accepting side-effect work.
#[derive(Debug, Clone)]
pub struct AsyncContext {
    pub handle: Handle,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct BridgeInner {
    context: RwLock<Option<AsyncContext>>,
    shutdown: ShutdownSignal,
}

/// Handle used by event handlers to submit asynchronous work. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct AsyncBridge {
    inner: Arc<BridgeInner>,
}

impl AsyncBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// The attached context, if any.
    pub fn context(&self) -> Option<AsyncContext> {
        match self.inner.context.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.inner.shutdown.request();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shutdown.is_requested()
    }

    fn set_context(&self, context: Option<AsyncContext>) {
        match self.inner.context.write() {
            Ok(mut guard) => *guard = context,
            Err(poisoned) => *poisoned.into_inner() = context,
        }
    }

    /// Hand `work` to the side-effect runtime without waiting for it.
    ///
    /// Dropped (debug log) once a shutdown was requested. Work still running when the runtime
    /// shuts down is cancelled.
    pub fn schedule_async<F>(&self, label: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown_requested() {
            debug!(task = label, "shutdown requested, dropping scheduled work");
            return;
        }
        let Some(context) = self.context() else {
            warn!(task = label, "no async context attached, dropping scheduled work");
            return;
        };
        let cancel = context.cancel.clone();
        context.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(task = label, "cancelled"),
                _ = work => debug!(task = label, "done"),
            }
        });
    }
}

/// Owner of the multi-threaded side-effect runtime.
///
/// While alive, the runtime is attached to the [`AsyncBridge`] it was started with.
pub struct SideEffectRuntime {
    runtime: Option<Runtime>,
    bridge: AsyncBridge,
    cancel: CancellationToken,
}

impl SideEffectRuntime {
    pub fn start(bridge: &AsyncBridge) -> Result<Self, TransportError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("side-effects")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;
        let cancel = CancellationToken::new();
        bridge.set_context(Some(AsyncContext {
            handle: runtime.handle().clone(),
            cancel: cancel.clone(),
        }));
        info!("side-effect runtime started");

        Ok(Self {
            runtime: Some(runtime),
            bridge: bridge.clone(),
            cancel,
        })
    }

    pub fn handle(&self) -> Option<Handle> {
        self.runtime.as_ref().map(|rt| rt.handle().clone())
    }

    /// Drive `work` from a non-async thread for at most `limit`.
    pub fn block_on_timeout<F>(&self, limit: Duration, work: F) -> Option<F::Output>
    where
        F: Future,
    {
        let runtime = self.runtime.as_ref()?;
        runtime.block_on(tokio::time::timeout(limit, work)).ok()
    }

    /// Detach from the bridge, cancel scheduled work and wait at most `grace` for the workers.
    pub fn shutdown(mut self, grace: Duration) {
        self.bridge.set_context(None);
        self.cancel.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(grace);
        }
        info!("side-effect runtime stopped");
    }
}

impl Drop for SideEffectRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.bridge.set_context(None);
            self.cancel.cancel();
            runtime.shutdown_background();
        }
    }
}

/// Transport level write of one console command.
///
/// Delivery is best-effort: implementations log failures instead of returning them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_command(&self, command: String);
}

/// Sends commands from any thread, with or without an attached [`AsyncContext`].
#[derive(Clone)]
pub struct CommandDispatcher {
    sender: Arc<dyn CommandSender>,
    bridge: AsyncBridge,
    /// Shared by clones. Closed once the drain task is gone with its runtime.
    queue: Arc<Mutex<Option<UnboundedSender<String>>>>,
}

impl CommandDispatcher {
    pub fn new(sender: Arc<dyn CommandSender>, bridge: AsyncBridge) -> Self {
        Self {
            sender,
            bridge,
            queue: Arc::default(),
        }
    }

    pub fn bridge(&self) -> &AsyncBridge {
        &self.bridge
    }

    /// Fire-and-forget from synchronous code.
    pub fn send_sync(&self, command: impl Into<String>) {
        let command = command.into();
        debug!(command, "CMD_SEND");
        match self.bridge.context() {
            Some(context) => self.enqueue(&context, command),
            None => {
                if let Err(e) = run_one_shot(self.sender.send_command(command)) {
                    error!("could not deliver command: {e}");
                }
            }
        }
    }

    fn enqueue(&self, context: &AsyncContext, command: String) {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let command = match queue.as_ref() {
            Some(tx) => match tx.send(command) {
                Ok(()) => return,
                Err(SendError(command)) => command,
            },
            None => command,
        };
        let tx = self.spawn_drain(context);
        if let Err(SendError(command)) = tx.send(command) {
            warn!(command, "side-effect runtime is gone, dropping command");
        }
        *queue = Some(tx);
    }

    /// Start the task delivering queued commands one at a time on `context`.
    fn spawn_drain(&self, context: &AsyncContext) -> UnboundedSender<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let sender = self.sender.clone();
        let cancel = context.cancel.clone();
        context.handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(command) => sender.send_command(command).await,
                        None => break,
                    },
                }
            }
            debug!("command queue closed");
        });
        tx
    }

    /// Send from async code, awaiting the transport write.
    pub async fn send(&self, command: impl Into<String>) {
        let command = command.into();
        debug!(command, "CMD_SEND");
        self.sender.send_command(command).await;
    }

    /// Callback form of [`send_sync`](Self::send_sync), for the console processors.
    pub fn callback(&self) -> CommandCallback {
        let dispatcher = self.clone();
        Arc::new(move |command: &str| dispatcher.send_sync(command))
    }
}

/// Run `work` to completion on a fresh current-thread runtime.
///
/// The runtime lives on a scoped thread so this also works when the caller is itself inside
/// a runtime.
fn run_one_shot<F>(work: F) -> Result<F::Output, TransportError>
where
    F: Future + Send,
    F::Output: Send,
{
    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                let runtime = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(TransportError::Runtime)?;
                Ok(runtime.block_on(work))
            })
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    })
}
