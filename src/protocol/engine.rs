//! Finite-state interpreter over a protocol's step table.
//!
//! One engine instance exists per run. Each step takes a fresh parameter
//! snapshot, dispatches its command through the multiplexer, and awaits the
//! response against the step deadline. `Error`/`Nack`/`Timeout` consult the
//! step's retry budget (100 ms backoff between attempts); exhaustion, a
//! permanently unavailable channel, or external cancellation all route into
//! the abort path, which runs the protocol's cleanup commands best-effort.
//! The terminal [`Outcome`] is delivered over a oneshot to whoever spawned
//! the run.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{Outcome, Protocol, StepDef, RETRY_BACKOFF};
use crate::error::{bounded_msg, Fault, FaultKind};
use crate::monitor::ErrorMonitor;
use crate::parameter::ParameterStore;
use crate::rpc::{Args, RpcError, RpcMux, Status};
use crate::runlog::{LogEvent, RunLogger};

/// Executes one experiment run.
pub struct ProtocolEngine {
    protocol: Arc<Protocol>,
    rpc: Arc<RpcMux>,
    params: Arc<ParameterStore>,
    log: RunLogger,
    monitor: Arc<ErrorMonitor>,
    cancel: CancellationToken,
}

enum StepVerdict {
    Advance,
    Abort(&'static str),
    Fail(String),
}

impl ProtocolEngine {
    pub fn new(
        protocol: Arc<Protocol>,
        rpc: Arc<RpcMux>,
        params: Arc<ParameterStore>,
        log: RunLogger,
        monitor: Arc<ErrorMonitor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            protocol,
            rpc,
            params,
            log,
            monitor,
            cancel,
        }
    }

    /// Spawn the run; the outcome arrives on the returned oneshot.
    pub fn spawn(self) -> (tokio::task::JoinHandle<()>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let outcome = self.run().await;
            let _ = tx.send(outcome);
        });
        (handle, rx)
    }

    /// Execute every step in order, then terminate with an [`Outcome`].
    pub async fn run(self) -> Outcome {
        tracing::info!(protocol = %self.protocol.name, steps = self.protocol.steps.len(), "protocol run starting");
        for step in &self.protocol.steps {
            if self.cancel.is_cancelled() {
                return self.abort("cancelled before step entry").await;
            }
            self.log.log(LogEvent::StepEntered {
                protocol: bounded_msg(&self.protocol.name),
                step: bounded_msg(&step.name),
            });
            match self.execute_step(step).await {
                StepVerdict::Advance => {}
                StepVerdict::Abort(reason) => return self.abort(reason).await,
                StepVerdict::Fail(reason) => {
                    tracing::error!(step = %step.name, reason = %reason, "protocol run failed");
                    return Outcome::Failed { reason };
                }
            }
        }
        tracing::info!(protocol = %self.protocol.name, "protocol run completed");
        Outcome::Completed
    }

    /// Run one step to its verdict, consuming the retry budget. Only
    /// dispatched attempts count against the budget; a channel that is
    /// mid-reconnect is waited out (the multiplexer's reconnect budget
    /// bounds that wait with `ChannelUnavailable`).
    async fn execute_step(&self, step: &StepDef) -> StepVerdict {
        // One consistent view of the parameters for every attempt of this
        // step.
        let snapshot = self.params.snapshot();
        let mut args = Args::new();
        for source in &step.args {
            let _ = args.push(source.resolve(&snapshot));
        }

        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return StepVerdict::Abort("cancelled");
            }

            let deadline = tokio::time::Instant::now() + step.deadline;
            let pending = match self.rpc.send(step.device, step.opcode, &args, deadline).await {
                Ok(pending) => pending,
                Err(RpcError::ChannelUnavailable) => {
                    return StepVerdict::Abort("channel permanently unavailable");
                }
                Err(RpcError::ChannelDown) => {
                    if !self.pause_for_retry().await {
                        return StepVerdict::Abort("cancelled while channel was down");
                    }
                    continue;
                }
                Err(RpcError::NotConnected) => {
                    return StepVerdict::Fail("multiplexer not connected".into());
                }
                Err(RpcError::TooLarge) => {
                    return StepVerdict::Fail(format!(
                        "step '{}' renders an oversize command",
                        step.name
                    ));
                }
                Err(err @ (RpcError::Timeout | RpcError::Cancelled)) => {
                    // send() never returns these; treat defensively as fatal.
                    return StepVerdict::Fail(err.to_string());
                }
            };
            attempt += 1;

            self.log.log(LogEvent::CommandSent {
                device: step.device,
                token: pending.token(),
                opcode: step.opcode,
            });
            let sent_at = pending.sent_at();

            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.rpc.abort_in_flight(step.device);
                    return StepVerdict::Abort("cancelled while awaiting response");
                }
                result = pending.wait() => result,
            };

            let failure = match result {
                Ok(response) => {
                    self.log.log(LogEvent::ResponseReceived {
                        token: response.token,
                        status: response.status,
                        latency_us: sent_at.elapsed().as_micros() as u64,
                    });
                    match response.status {
                        Status::Ok => return StepVerdict::Advance,
                        Status::Error | Status::Nack => "rejected by peripheral",
                    }
                }
                Err(RpcError::Timeout) => "response timed out",
                Err(RpcError::ChannelDown) => "channel lost mid-step",
                Err(RpcError::Cancelled) => {
                    return StepVerdict::Abort("in-flight command cancelled");
                }
                Err(RpcError::ChannelUnavailable) => {
                    return StepVerdict::Abort("channel permanently unavailable");
                }
                Err(err @ (RpcError::NotConnected | RpcError::TooLarge)) => {
                    return StepVerdict::Fail(err.to_string());
                }
            };

            tracing::warn!(step = %step.name, attempt, failure, "step attempt failed");
            if attempt > step.retries {
                tracing::warn!(step = %step.name, attempts = attempt, "retry budget exhausted");
                return StepVerdict::Abort("step retries exhausted");
            }
            if !self.pause_for_retry().await {
                return StepVerdict::Abort("cancelled during retry backoff");
            }
        }
    }

    /// Cancellable retry pause; `false` means cancellation arrived.
    async fn pause_for_retry(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(RETRY_BACKOFF) => true,
        }
    }

    /// Run the protocol's cleanup sequence best-effort and terminate with
    /// `Aborted`. Cleanup failures are logged but never chain further
    /// aborts.
    async fn abort(&self, reason: &'static str) -> Outcome {
        tracing::warn!(protocol = %self.protocol.name, reason, "entering abort path");
        self.monitor.notify(Fault::new(
            FaultKind::ProtocolAbort,
            "engine",
            &format!("{}: {}", self.protocol.name, reason),
        ));

        let snapshot = self.params.snapshot();
        for cleanup in &self.protocol.abort_sequence {
            let mut args = Args::new();
            for source in &cleanup.args {
                let _ = args.push(source.resolve(&snapshot));
            }
            let deadline = tokio::time::Instant::now() + cleanup.deadline;
            match self
                .rpc
                .send(cleanup.device, cleanup.opcode, &args, deadline)
                .await
            {
                Ok(pending) => {
                    self.log.log(LogEvent::CommandSent {
                        device: cleanup.device,
                        token: pending.token(),
                        opcode: cleanup.opcode,
                    });
                    let sent_at = pending.sent_at();
                    match pending.wait().await {
                        Ok(response) => {
                            self.log.log(LogEvent::ResponseReceived {
                                token: response.token,
                                status: response.status,
                                latency_us: sent_at.elapsed().as_micros() as u64,
                            });
                        }
                        Err(err) => {
                            tracing::warn!(device = %cleanup.device, opcode = %cleanup.opcode, error = %err, "cleanup command unanswered");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(device = %cleanup.device, opcode = %cleanup.opcode, error = %err, "cleanup dispatch failed");
                }
            }
        }
        Outcome::Aborted
    }
}
