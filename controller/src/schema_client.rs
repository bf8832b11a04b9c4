//! Schema_client is a minimal client for the `authzed.api.v1.SchemaService`
//! management RPC of a running SpiceDB deployment.

use futures::future::BoxFuture;
use http::uri::PathAndQuery;
use tonic::codec::ProstCodec;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};

use crate::apply_schema::SchemaConnection;
use crate::{Error, SPICEDB_GRPC_PORT};

/// WriteSchemaRequest mirrors `authzed.api.v1.WriteSchemaRequest`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteSchemaRequest {
    /// Schema is the full schema text to write.
    #[prost(string, tag = "1")]
    pub schema: ::prost::alloc::string::String,
}

/// WriteSchemaResponse mirrors `authzed.api.v1.WriteSchemaResponse`.
///
/// The response payload is not consumed; unknown fields are discarded on
/// decode.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteSchemaResponse {}

const WRITE_SCHEMA_PATH: &str = "/authzed.api.v1.SchemaService/WriteSchema";

/// Endpoint_for formats the in-cluster address of a managed deployment's
/// management API.
pub fn endpoint_for<S: AsRef<str>, T: AsRef<str>>(name: S, namespace: T) -> String {
    format!(
        "{}.{}.svc:{SPICEDB_GRPC_PORT}",
        name.as_ref(),
        namespace.as_ref()
    )
}

/// SchemaServiceClient issues unary calls against one SpiceDB deployment,
/// carrying the preshared key on every call.
///
/// The underlying channel is released when the client is dropped.
pub struct SchemaServiceClient {
    inner: tonic::client::Grpc<Channel>,
    auth: MetadataValue<Ascii>,
}

impl SchemaServiceClient {
    /// Connect dials `endpoint` over insecure transport.
    pub async fn connect<S: AsRef<str>>(endpoint: S, preshared_key: &str) -> Result<Self, Error> {
        let auth = MetadataValue::try_from(format!("Bearer {preshared_key}"))
            .map_err(|err| Error::Other(anyhow::anyhow!("invalid preshared key: {err}")))?;
        let channel = Endpoint::from_shared(format!("http://{}", endpoint.as_ref()))?
            .connect()
            .await?;
        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
            auth,
        })
    }

    /// Write_schema replaces the schema held by the connected deployment.
    pub async fn write_schema(&mut self, schema: &str) -> Result<(), tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|err| tonic::Status::unavailable(format!("service not ready: {err}")))?;
        let codec: ProstCodec<WriteSchemaRequest, WriteSchemaResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static(WRITE_SCHEMA_PATH);
        let mut request = tonic::Request::new(WriteSchemaRequest {
            schema: schema.to_string(),
        });
        request.metadata_mut().insert("authorization", self.auth.clone());
        self.inner.unary(request, path, codec).await.map(|_| ())
    }
}

impl SchemaConnection for SchemaServiceClient {
    fn write_schema<'a>(
        &'a mut self,
        schema: &'a str,
    ) -> BoxFuture<'a, Result<(), tonic::Status>> {
        Box::pin(async move { SchemaServiceClient::write_schema(self, schema).await })
    }
}
