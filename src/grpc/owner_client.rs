use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::acquirer::{ClaimReply, ClaimRequest, ResourceOwner};
use crate::claim::ClaimId;
use crate::error::{Result, SchedError};
use crate::grpc::convert::claim_reply_from_proto;
use crate::proto;
use crate::proto::resource_owner_service_client::ResourceOwnerServiceClient;

/// Upper bound on establishing a connection to a resource owner.
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to resource owners over gRPC, one cached channel per peer.
///
/// Channels connect lazily, so the pool lock is never held across network
/// I/O and an unreachable owner only delays its own RPCs.
pub struct GrpcResourceOwner {
    clients: Mutex<HashMap<String, ResourceOwnerServiceClient<Channel>>>,
    rpc_timeout: Duration,
}

impl GrpcResourceOwner {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            rpc_timeout,
        }
    }

    async fn client(&self, peer: &str) -> Result<ResourceOwnerServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(peer) {
            return Ok(client.clone());
        }
        let endpoint = Endpoint::from_shared(format!("http://{peer}"))
            .map_err(|e| SchedError::Internal(format!("Invalid peer address {peer}: {e}")))?
            .connect_timeout(self.rpc_timeout.min(MAX_CONNECT_TIMEOUT))
            .timeout(self.rpc_timeout);
        let client = ResourceOwnerServiceClient::new(endpoint.connect_lazy());
        clients.insert(peer.to_string(), client.clone());
        Ok(client)
    }

    /// Forget a peer's connection after a transport failure.
    async fn evict(&self, peer: &str) {
        self.clients.lock().await.remove(peer);
    }
}

#[tonic::async_trait]
impl ResourceOwner for GrpcResourceOwner {
    async fn request_claim(&self, request: ClaimRequest) -> Result<ClaimReply> {
        let peer = request.peer.clone();
        let deadline = request.deadline;
        let mut client = self.client(&peer).await?;
        let mut rpc = tonic::Request::new(proto::RequestClaimRequest::from(request));
        if !deadline.is_zero() {
            rpc.set_timeout(deadline);
        }
        let reply = match client.request_claim(rpc).await {
            Ok(reply) => reply.into_inner(),
            Err(status) => {
                self.evict(&peer).await;
                return Err(status.into());
            }
        };
        Ok(claim_reply_from_proto(reply)?)
    }

    async fn release_claim(&self, peer: &str, claim_id: &ClaimId) -> Result<()> {
        let mut client = self.client(peer).await?;
        let request = proto::ReleaseClaimRequest {
            claim_id: claim_id.as_secret_str().to_string(),
        };
        if let Err(status) = client.release_claim(request).await {
            self.evict(peer).await;
            return Err(status.into());
        }
        Ok(())
    }
}
