use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::environment::{EnvironmentDescriptor, EnvironmentRegistry};
use crate::tracker::SessionTracker;

use super::{
    CancelReason, ExecutionRequest, OutputSink, SessionError, SessionStatus, TransportError,
    Workspace, forward, launch, spawn_readers,
};

/// How long output is still forwarded after a session was terminated
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Runs code-execution sessions from request to cleanup
///
/// Shared by all request handlers; every call to [`run_session`] owns its own
/// workspace, process and output queue.
///
/// [`run_session`]: SessionController::run_session
pub struct SessionController {
    registry: Arc<EnvironmentRegistry>,
    config: SandboxConfig,
    tracker: Arc<SessionTracker>,
}

impl SessionController {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        config: SandboxConfig,
        tracker: Arc<SessionTracker>,
    ) -> Self {
        Self {
            registry,
            config,
            tracker,
        }
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    /// Executes one request, streaming its output into `sink`
    ///
    /// Whatever happens after the workspace exists, it is removed before this
    /// returns. Unknown environments fail before anything touches the disk.
    pub async fn run_session<S>(&self, request: ExecutionRequest, sink: &mut S) -> SessionStatus
    where
        S: OutputSink + ?Sized,
    {
        self.run_session_with(request, sink, &CancellationToken::new())
            .await
    }

    /// Like [`run_session`](Self::run_session), for transports that can tell
    /// when the peer went away without a write failing
    ///
    /// Cancelling `disconnected` terminates the program and yields
    /// [`CancelReason::Disconnected`].
    pub async fn run_session_with<S>(
        &self,
        request: ExecutionRequest,
        sink: &mut S,
        disconnected: &CancellationToken,
    ) -> SessionStatus
    where
        S: OutputSink + ?Sized,
    {
        let ExecutionRequest {
            environment_id,
            source_code,
            input,
        } = request;

        let Some(descriptor) = self.registry.lookup(&environment_id) else {
            log::info!("Rejected run for unknown environment '{environment_id}'");
            return SessionStatus::Failed(SessionError::Configuration(environment_id));
        };

        let session_id = format!("{}-{}", descriptor.id, Uuid::new_v4().simple());
        let mut workspace = match Workspace::prepare(
            &self.config.workspace_root,
            &session_id,
            descriptor,
            &source_code,
        ) {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Session {session_id} could not prepare its workspace: {e}");
                return SessionStatus::Failed(e);
            }
        };

        let guard = self.tracker.register(&session_id, &descriptor.id);
        log::info!("Session {session_id} started");

        let status = self
            .execute(
                &session_id,
                descriptor,
                &workspace,
                input,
                sink,
                guard.token(),
                disconnected,
            )
            .await;

        if let Err(e) = workspace.teardown().await {
            log::error!(
                "Failed to remove workspace {} of session {session_id}, directory leaked: {e}",
                workspace.path().display()
            );
        }
        drop(guard);

        log::info!("Session {session_id} finished: {status:?}");
        status
    }

    /// Launch, stream and wait; the workspace is torn down by the caller
    async fn execute<S>(
        &self,
        session_id: &str,
        descriptor: &EnvironmentDescriptor,
        workspace: &Workspace,
        input: Option<Vec<u8>>,
        sink: &mut S,
        token: &CancellationToken,
        disconnected: &CancellationToken,
    ) -> SessionStatus
    where
        S: OutputSink + ?Sized,
    {
        if let Err(e) = sink.session_started(session_id).await {
            log::warn!("Session {session_id} lost its transport before launch: {e}");
            return SessionStatus::Cancelled {
                reason: CancelReason::Disconnected,
            };
        }

        let mut process = match launch(&self.config, descriptor, workspace, session_id, input) {
            Ok(process) => process,
            Err(e) => {
                log::error!("Session {session_id}: {e}");
                return SessionStatus::Failed(e);
            }
        };

        let (Some(stdout), Some(stderr)) = (process.take_stdout(), process.take_stderr()) else {
            process.terminate().await;
            let _ = process.wait().await;
            return SessionStatus::Failed(SessionError::Launch(
                "output streams were not captured".to_string(),
            ));
        };
        let (queue, readers) = spawn_readers(
            stdout,
            stderr,
            self.config.chunk_size,
            self.config.queue_capacity,
        );

        let forwarding = forward(queue, sink);
        tokio::pin!(forwarding);

        let timeout = self.config.timeout();
        let deadline = tokio::time::sleep(timeout.unwrap_or(Duration::ZERO));
        tokio::pin!(deadline);

        // Started on cancellation; bounds how long leftover output is drained
        let drain_limit = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(drain_limit);

        let mut exit_status: Option<io::Result<ExitStatus>> = None;
        let mut delivery: Option<Result<usize, TransportError>> = None;
        let mut cancel_reason: Option<CancelReason> = None;
        // Set when the sink is dead or draining took too long
        let mut abandoned = false;

        // Running, then Draining: the queue only closes once both readers hit
        // end-of-input, so a finished delivery means every byte written was
        // forwarded and the sink was closed.
        while exit_status.is_none() || (delivery.is_none() && !abandoned) {
            tokio::select! {
                result = process.wait(), if exit_status.is_none() => {
                    exit_status = Some(result);
                }
                result = &mut forwarding, if delivery.is_none() && !abandoned => {
                    if let Err(e) = &result {
                        log::warn!("Session {session_id} output transport failed: {e}");
                        cancel_reason.get_or_insert(CancelReason::Disconnected);
                        process.terminate().await;
                    }
                    delivery = Some(result);
                }
                _ = &mut deadline, if timeout.is_some() && cancel_reason.is_none() => {
                    log::warn!(
                        "Session {session_id} exceeded its time limit of {:?}",
                        timeout.unwrap_or_default()
                    );
                    cancel_reason = Some(CancelReason::TimedOut);
                    drain_limit.as_mut().reset(tokio::time::Instant::now() + DRAIN_GRACE);
                    process.terminate().await;
                }
                _ = token.cancelled(), if cancel_reason.is_none() => {
                    cancel_reason = Some(if self.tracker.is_shutting_down() {
                        CancelReason::Shutdown
                    } else {
                        CancelReason::Requested
                    });
                    drain_limit.as_mut().reset(tokio::time::Instant::now() + DRAIN_GRACE);
                    process.terminate().await;
                }
                _ = disconnected.cancelled(), if cancel_reason.is_none() => {
                    log::info!("Session {session_id} peer disconnected");
                    cancel_reason = Some(CancelReason::Disconnected);
                    abandoned = true;
                    process.terminate().await;
                }
                _ = &mut drain_limit, if cancel_reason.is_some() && delivery.is_none() && !abandoned => {
                    log::warn!(
                        "Session {session_id} output still open {DRAIN_GRACE:?} after termination, dropping the rest"
                    );
                    abandoned = true;
                }
            }
        }

        // Closing
        if delivery.is_none() {
            readers.abort();
        }
        process.finish_input().await;
        readers.join(session_id).await;

        if let Some(Ok(delivered)) = &delivery {
            log::debug!("Session {session_id} delivered {delivered} chunk(s)");
        }

        match (cancel_reason, exit_status) {
            (Some(reason), _) => SessionStatus::Cancelled { reason },
            (None, Some(Ok(status))) => {
                log::debug!("Session {session_id} sandbox exited with {status}");
                SessionStatus::Succeeded {
                    exit_code: status.code(),
                }
            }
            (None, Some(Err(e))) => SessionStatus::Failed(SessionError::Launch(format!(
                "failed to wait for sandbox: {e}"
            ))),
            (None, None) => SessionStatus::Failed(SessionError::Launch(
                "sandbox exit status unavailable".to_string(),
            )),
        }
    }
}
