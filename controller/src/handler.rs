//! Handler defines the context-passing pipeline the reconciler is composed
//! from, and the queue collaborator stages defer work to.

use std::pin::Pin;
use std::sync::Mutex;

use futures::Future;
use kube::runtime::controller::Action;
use tokio::time::Duration;
use tracing::debug;

use crate::context::ReconcileContext;
use crate::{Error, Result};

/// HandlerFuture is the boxed future a pipeline stage returns.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Handler is one stage of the reconciliation pipeline.
///
/// A stage performs its own external effects and then either invokes the next
/// stage exactly once, or short-circuits the rest of the pipeline. Deferral
/// is requested through the context's [QueueOperations], never by sleeping or
/// scheduling directly.
pub trait Handler: Send + Sync {
    /// Handle runs the stage against the per-reconcile context.
    fn handle<'c>(&'c self, ctx: &'c mut ReconcileContext) -> HandlerFuture<'c>;
}

/// Terminal ends a pipeline. It performs no effects.
#[derive(Default)]
pub struct Terminal;

impl Handler for Terminal {
    fn handle<'c>(&'c self, _ctx: &'c mut ReconcileContext) -> HandlerFuture<'c> {
        Box::pin(async {})
    }
}

/// QueueOperations is the deferral surface handlers use instead of owning
/// retry timing themselves.
pub trait QueueOperations: Send + Sync {
    /// Requeue re-enqueues the cluster at the standard cadence.
    fn requeue(&self);
    /// Requeue_err re-enqueues the cluster with error backoff.
    fn requeue_err(&self, err: Error);
    /// Requeue_api_err re-enqueues the cluster under cluster-API rate limits.
    fn requeue_api_err(&self, err: Error);
}

enum Decision {
    Requeue,
    RequeueErr(Error),
    RequeueApiErr(Error),
}

/// STANDARD_REQUEUE is the cadence for plain `requeue()` deferrals.
const STANDARD_REQUEUE: Duration = Duration::from_secs(5);

/// RequeueSink records the first deferral requested during a reconcile and
/// replays it as the reconcile's outcome once the pipeline has run.
///
/// Error deferrals become reconcile errors, so the controller's queue applies
/// its own backoff; the sink never schedules anything itself.
#[derive(Default)]
pub struct RequeueSink {
    decision: Mutex<Option<Decision>>,
}

impl RequeueSink {
    fn record(&self, decision: Decision) {
        let mut held = self.decision.lock().expect("requeue sink lock");
        if held.is_none() {
            *held = Some(decision);
        }
    }

    /// Outcome consumes the recorded deferral; `default` is used when no
    /// stage asked for one.
    pub fn outcome(&self, default: Action) -> Result<Action> {
        match self.decision.lock().expect("requeue sink lock").take() {
            None => Ok(default),
            Some(Decision::Requeue) => Ok(Action::requeue(STANDARD_REQUEUE)),
            Some(Decision::RequeueErr(err)) => Err(err),
            Some(Decision::RequeueApiErr(err)) => Err(err),
        }
    }
}

impl QueueOperations for RequeueSink {
    fn requeue(&self) {
        debug!("requeue requested");
        self.record(Decision::Requeue);
    }

    fn requeue_err(&self, err: Error) {
        debug!(error = %err, "requeue with backoff requested");
        self.record(Decision::RequeueErr(err));
    }

    fn requeue_api_err(&self, err: Error) {
        debug!(error = %err, "requeue for API error requested");
        self.record(Decision::RequeueApiErr(err));
    }
}
