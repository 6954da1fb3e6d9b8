use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::core::SchedulerHandle;
use crate::grpc::schedd_service::ScheddService;
use crate::proto::scheduler_service_server::SchedulerServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    handle: SchedulerHandle,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, handle: SchedulerHandle) -> Self {
        Self { addr, handle }
    }

    /// Serve until `stop` is canceled.
    pub async fn run(self, stop: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = ScheddService::new(self.handle);

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(SchedulerServiceServer::new(service))
            .serve_with_shutdown(self.addr, stop.cancelled_owned())
            .await
    }
}
