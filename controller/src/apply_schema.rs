//! Apply_schema writes the configured policy schema into a running cluster
//! over its management RPC once the workload has been applied.

use std::sync::Arc;

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tonic::Code;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::context::{NamespacedName, ReconcileContext};
use crate::handler::{Handler, HandlerFuture};
use crate::Error;

/// SchemaConnection is an open management-RPC channel to one deployment.
///
/// Dropping the value releases the channel; the handler scopes a connection
/// to a single invocation.
pub trait SchemaConnection: Send {
    /// Write_schema replaces the schema held by the connected deployment.
    fn write_schema<'a>(&'a mut self, schema: &'a str)
    -> BoxFuture<'a, Result<(), tonic::Status>>;
}

/// DialFn opens a [SchemaConnection] for the service coordinates in the
/// effective configuration.
pub type DialFn = Box<
    dyn Fn(&Config) -> BoxFuture<'static, Result<Box<dyn SchemaConnection>, Error>> + Send + Sync,
>;

/// PatchStatusFn records a newly written schema hash on the cluster status.
pub type PatchStatusFn = Box<
    dyn Fn(&NamespacedName, &str) -> BoxFuture<'static, Result<(), kube::Error>> + Send + Sync,
>;

/// InvalidSchemaHook surfaces a permanently rejected schema; the pipeline
/// still advances afterwards.
pub type InvalidSchemaHook = Box<
    dyn Fn(&ReconcileContext, &tonic::Status) -> BoxFuture<'static, ()> + Send + Sync,
>;

/// SchemaApplyHandler writes the effective configuration's schema into the
/// deployed service and records its hash in the cluster status.
///
/// A schema whose hash already matches `status.schemaHash` is skipped without
/// opening a connection. A failed dial is tolerated: the workload may simply
/// not be reachable yet.
pub struct SchemaApplyHandler {
    dial: DialFn,
    patch_status: PatchStatusFn,
    invalid_schema: InvalidSchemaHook,
    next: Arc<dyn Handler>,
}

impl SchemaApplyHandler {
    /// New assembles the handler.
    pub fn new(
        dial: DialFn,
        patch_status: PatchStatusFn,
        invalid_schema: InvalidSchemaHook,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            dial,
            patch_status,
            invalid_schema,
            next,
        }
    }

    /// Hash is the content hash recorded in `status.schemaHash`.
    pub fn hash(schema: &str) -> String {
        hex::encode(Sha256::digest(schema.as_bytes()))
    }
}

impl Handler for SchemaApplyHandler {
    fn handle<'c>(&'c self, ctx: &'c mut ReconcileContext) -> HandlerFuture<'c> {
        Box::pin(async move {
            let schema = ctx.must_config().schema.clone();
            if schema.is_empty() {
                trace!("no schema configured");
                return self.next.handle(ctx).await;
            }

            let hash = Self::hash(&schema);
            if ctx
                .cluster()
                .status
                .as_ref()
                .is_some_and(|s| s.schema_hash == hash)
            {
                trace!("schema hash unchanged");
                return self.next.handle(ctx).await;
            }

            let mut conn = match (self.dial)(ctx.must_config()).await {
                Ok(conn) => conn,
                Err(err) => {
                    // Expected while the workload is still coming up.
                    debug!(error = %err, "management RPC dial failed, deferring schema write");
                    return self.next.handle(ctx).await;
                }
            };

            match conn.write_schema(&schema).await {
                Ok(()) => {
                    let nn = ctx.cluster_nn().clone();
                    if let Err(err) = (self.patch_status)(&nn, &hash).await {
                        warn!(error = %err, "unable to record schema hash");
                    }
                }
                Err(status) => match status.code() {
                    Code::FailedPrecondition | Code::InvalidArgument => {
                        warn!(code = ?status.code(), error = %status, "schema rejected");
                        (self.invalid_schema)(ctx, &status).await;
                    }
                    _ => ctx.queue().requeue_err(Error::Grpc(status)),
                },
            }
            drop(conn);

            self.next.handle(ctx).await
        })
    }
}
