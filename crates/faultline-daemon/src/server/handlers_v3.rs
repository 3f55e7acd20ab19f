use super::*;

#[tonic::async_trait]
impl RuntimeDiscoveryV3 for RuntimeStreamService {
    type StreamRuntimeStream =
        Pin<Box<dyn Stream<Item = Result<v3::DiscoveryResponse, Status>> + Send + 'static>>;

    async fn stream_runtime(
        &self,
        request: Request<Streaming<v3::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRuntimeStream>, Status> {
        let inbound = request.into_inner();
        let rx = self.spawn_stream(inbound, ProtocolVersion::V3);
        Ok(Response::new(Box::pin(ReceiverStream::new(rx).map(Ok))))
    }
}
