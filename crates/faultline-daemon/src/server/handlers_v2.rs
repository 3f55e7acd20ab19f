use super::*;

#[tonic::async_trait]
impl RuntimeDiscoveryV2 for RuntimeStreamService {
    type StreamRuntimeStream =
        Pin<Box<dyn Stream<Item = Result<v2::DiscoveryResponse, Status>> + Send + 'static>>;

    async fn stream_runtime(
        &self,
        request: Request<Streaming<v2::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRuntimeStream>, Status> {
        // v2 shares the v3 state machine; the byte-compatible messages are
        // transcoded at the stream boundary.
        let inbound = request
            .into_inner()
            .map(|message| message.and_then(transcode_message::<_, v3::DiscoveryRequest>));
        let rx = self.spawn_stream(inbound, ProtocolVersion::V2);
        Ok(Response::new(Box::pin(
            ReceiverStream::new(rx).map(transcode_message::<_, v2::DiscoveryResponse>),
        )))
    }
}
