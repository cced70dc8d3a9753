use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::broker_service::BrokerGrpcService;
use crate::proto::broker_service_server::BrokerServiceServer;

/// Upper bound on a decoded message; layer chunks are 1 MiB.
const MAX_MESSAGE_BYTES: usize = 16 << 20;

pub struct GrpcServer {
    listener: TcpListener,
    service: BrokerGrpcService,
}

impl GrpcServer {
    pub fn new(listener: TcpListener, service: BrokerGrpcService) -> Self {
        Self { listener, service }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }

        let service = BrokerServiceServer::new(self.service)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);

        Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(self.listener),
                shutdown.cancelled_owned(),
            )
            .await
    }
}
