// Invocation isolation: a panicking or overrunning processor must not take a worker down
use super::constants::CANCEL_GRACE_PERIOD;
use crate::port::{Env, InvocationContext, Processor, ProcessorOutcome};
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;
use tokio::time::{timeout, timeout_at};
use tokio_util::task::AbortOnDropHandle;
use tracing::error;

/// Result of a guarded processor invocation
#[derive(Debug)]
pub enum InvocationResult {
    /// The processor returned before the deadline
    Completed(ProcessorOutcome),
    /// The deadline passed first; the invocation was cancelled and abandoned
    TimedOut,
    /// The processor panicked
    Panicked(String),
}

/// Run one processor invocation in its own task, raced against the context deadline
///
/// On timeout the context is cancelled; a processor that has not returned
/// within [`CANCEL_GRACE_PERIOD`] after that is aborted. Dropping the returned
/// future aborts the invocation task as well.
pub async fn invoke_guarded(
    processor: Arc<dyn Processor>,
    ctx: InvocationContext,
    env: Env,
    payload: Bytes,
) -> InvocationResult {
    let task_ctx = ctx.clone();
    let mut handle = AbortOnDropHandle::new(tokio::spawn(async move {
        processor.process(&task_ctx, env, payload).await
    }));

    match timeout_at(ctx.deadline(), &mut handle).await {
        Ok(Ok(outcome)) => InvocationResult::Completed(outcome),
        Ok(Err(join_err)) => {
            let msg = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                "invocation task cancelled".to_string()
            };
            error!(queue = %ctx.queue(), panic_msg = %msg, "Processor invocation panicked");
            InvocationResult::Panicked(msg)
        }
        Err(_) => {
            ctx.cancel();
            if timeout(CANCEL_GRACE_PERIOD, &mut handle).await.is_err() {
                handle.abort();
            }
            InvocationResult::TimedOut
        }
    }
}

fn panic_message(panic_info: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
