// Copyright (c) 2026 Faultline Contributors
// SPDX-License-Identifier: Apache-2.0

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prost::Message;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use faultline_protocol::{
    pack_message, pb, RESOURCE_TYPE_URL_V2, RESOURCE_TYPE_URL_V3, RUNTIME_TYPE_URL_V2,
    RUNTIME_TYPE_URL_V3,
};
use pb::v2;
use pb::v2::runtime_discovery_service_server::RuntimeDiscoveryService as RuntimeDiscoveryV2;
use pb::v3;
use pb::v3::runtime_discovery_service_server::RuntimeDiscoveryService as RuntimeDiscoveryV3;

use crate::cache::{SnapshotCache, Subscription};
use crate::config::{ClusterKey, ControllerConfig};
use crate::snapshot::RuntimeSnapshot;
use crate::telemetry::{StreamGuard, Telemetry};

mod handlers_v2;
mod handlers_v3;

/// The two wire revisions served from one port. Semantics are identical;
/// only message packages (and therefore resource type URLs) and the metrics
/// scope differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolVersion {
    V2,
    V3,
}

impl ProtocolVersion {
    fn label(self) -> &'static str {
        match self {
            ProtocolVersion::V2 => "v2",
            ProtocolVersion::V3 => "v3",
        }
    }

    fn runtime_type_url(self) -> &'static str {
        match self {
            ProtocolVersion::V2 => RUNTIME_TYPE_URL_V2,
            ProtocolVersion::V3 => RUNTIME_TYPE_URL_V3,
        }
    }

    fn resource_type_url(self) -> &'static str {
        match self {
            ProtocolVersion::V2 => RESOURCE_TYPE_URL_V2,
            ProtocolVersion::V3 => RESOURCE_TYPE_URL_V3,
        }
    }
}

struct StreamShared {
    config: ControllerConfig,
    cache: Arc<SnapshotCache>,
    telemetry: Telemetry,
    nonce_seq: AtomicU64,
}

/// Serves `StreamRuntime` for both wire revisions. Each accepted stream gets
/// its own driver task owning the protocol state machine; the service itself
/// is just shared wiring.
#[derive(Clone)]
pub struct RuntimeStreamService {
    shared: Arc<StreamShared>,
}

impl RuntimeStreamService {
    pub fn new(config: ControllerConfig, cache: Arc<SnapshotCache>, telemetry: Telemetry) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                config,
                cache,
                telemetry,
                nonce_seq: AtomicU64::new(1),
            }),
        }
    }

    fn spawn_stream<S>(
        &self,
        inbound: S,
        protocol: ProtocolVersion,
    ) -> mpsc::Receiver<v3::DiscoveryResponse>
    where
        S: Stream<Item = Result<v3::DiscoveryRequest, Status>> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(8);
        let driver = StreamDriver::new(Arc::clone(&self.shared), protocol);
        tokio::spawn(driver.run(inbound, tx));
        rx
    }
}

fn transcode_message<T: Message, U: Message + Default>(value: T) -> Result<U, Status> {
    let mut buf = Vec::with_capacity(value.encoded_len());
    value
        .encode(&mut buf)
        .map_err(|_| Status::internal("protobuf transcode encode failure"))?;
    U::decode(buf.as_slice()).map_err(|_| Status::internal("protobuf transcode decode failure"))
}

/// The peer hung up; the driver has nothing left to do.
struct StreamClosed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Nack,
    Ack,
    Initial,
    Stale,
}

fn classify_request(
    request: &v3::DiscoveryRequest,
    last_sent_version: Option<&str>,
    last_sent_nonce: Option<&str>,
) -> RequestKind {
    if request.error_detail.is_some() {
        return RequestKind::Nack;
    }
    if request.response_nonce.is_empty() && request.version_info.is_empty() {
        return RequestKind::Initial;
    }
    if Some(request.response_nonce.as_str()) == last_sent_nonce
        && Some(request.version_info.as_str()) == last_sent_version
    {
        return RequestKind::Ack;
    }
    RequestKind::Stale
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Heartbeat,
    NonceExpiry,
}

/// Per-stream protocol state machine.
///
/// At most one response is in flight: after a content push the driver is in
/// `AwaitingAck` (`awaiting_ack == true`) until the client echoes the nonce,
/// rejects it, or the nonce expiry fires. Heartbeats never enter that state
/// and are suppressed while it holds.
struct StreamDriver {
    shared: Arc<StreamShared>,
    protocol: ProtocolVersion,
    scope: String,
    cluster: Option<String>,
    resource_names: Vec<String>,
    subscription: Option<Subscription>,
    last_sent_version: Option<String>,
    last_sent_nonce: Option<String>,
    last_acked_version: Option<String>,
    awaiting_ack: bool,
    last_send_at: Instant,
    nonce_deadline: Option<Instant>,
}

impl StreamDriver {
    fn new(shared: Arc<StreamShared>, protocol: ProtocolVersion) -> Self {
        let scope = format!("{}.{}", shared.config.rtds_layer_name, protocol.label());
        Self {
            shared,
            protocol,
            scope,
            cluster: None,
            resource_names: Vec::new(),
            subscription: None,
            last_sent_version: None,
            last_sent_nonce: None,
            last_acked_version: None,
            awaiting_ack: false,
            last_send_at: Instant::now(),
            nonce_deadline: None,
        }
    }

    async fn run<S>(mut self, mut inbound: S, tx: mpsc::Sender<v3::DiscoveryResponse>)
    where
        S: Stream<Item = Result<v3::DiscoveryRequest, Status>> + Unpin,
    {
        let _guard = StreamGuard::new(&self.shared.telemetry, &self.scope);

        loop {
            let timer = self.next_deadline();
            tokio::select! {
                message = inbound.next() => {
                    match message {
                        Some(Ok(request)) => {
                            if self.handle_request(request, &tx).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(status)) => {
                            tracing::debug!(scope = %self.scope, status = %status, "stream terminated with error");
                            return;
                        }
                        None => return,
                    }
                }
                _ = async {
                    match self.subscription.as_mut() {
                        Some(subscription) => subscription.changed().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if !self.awaiting_ack && self.push_if_newer(&tx).await.is_err() {
                        return;
                    }
                }
                kind = async {
                    match timer {
                        Some((at, kind)) => {
                            tokio::time::sleep_until(at).await;
                            kind
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    match kind {
                        TimerKind::NonceExpiry => {
                            tracing::debug!(
                                scope = %self.scope,
                                nonce = self.last_sent_nonce.as_deref().unwrap_or(""),
                                "response expired without acknowledgement"
                            );
                            self.awaiting_ack = false;
                            self.nonce_deadline = None;
                            if self.on_idle(&tx).await.is_err() {
                                return;
                            }
                        }
                        TimerKind::Heartbeat => {
                            if self.send_heartbeat(&tx).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_request(
        &mut self,
        request: v3::DiscoveryRequest,
        tx: &mpsc::Sender<v3::DiscoveryResponse>,
    ) -> Result<(), StreamClosed> {
        match classify_request(
            &request,
            self.last_sent_version.as_deref(),
            self.last_sent_nonce.as_deref(),
        ) {
            RequestKind::Nack => {
                let detail = request.error_detail.unwrap_or_default();
                tracing::warn!(
                    scope = %self.scope,
                    code = detail.code,
                    message = %detail.message,
                    "client rejected runtime update"
                );
                self.shared.telemetry.record_stream_error(&self.scope);
                self.awaiting_ack = false;
                self.nonce_deadline = None;
                self.on_idle(tx).await
            }
            RequestKind::Ack => {
                self.last_acked_version = Some(request.version_info);
                tracing::debug!(
                    scope = %self.scope,
                    version = self.last_acked_version.as_deref().unwrap_or(""),
                    "client acknowledged runtime version"
                );
                self.awaiting_ack = false;
                self.nonce_deadline = None;
                self.on_idle(tx).await
            }
            RequestKind::Initial => {
                if self.cluster.is_none() {
                    let cluster = self.derive_cluster(request.node.as_ref());
                    tracing::debug!(scope = %self.scope, cluster = %cluster, "stream subscribed");
                    self.subscription = Some(self.shared.cache.subscribe(&cluster));
                    self.cluster = Some(cluster);
                    self.resource_names = request.resource_names;
                }
                if self.awaiting_ack {
                    Ok(())
                } else {
                    self.push_if_newer(tx).await
                }
            }
            RequestKind::Stale => {
                tracing::debug!(
                    scope = %self.scope,
                    nonce = %request.response_nonce,
                    "dropping stale request"
                );
                Ok(())
            }
        }
    }

    fn derive_cluster(&self, node: Option<&v3::Node>) -> String {
        let derived = node.map(|n| match self.shared.config.cluster_key {
            ClusterKey::Cluster => n.cluster.as_str(),
            ClusterKey::Id => n.id.as_str(),
        });
        match derived {
            Some(cluster) if !cluster.is_empty() => cluster.to_string(),
            _ => self.shared.config.default_cluster.clone(),
        }
    }

    /// The push rule: send only when idle and the cache holds a version the
    /// client has not been sent yet.
    async fn push_if_newer(
        &mut self,
        tx: &mpsc::Sender<v3::DiscoveryResponse>,
    ) -> Result<(), StreamClosed> {
        let Some(cluster) = self.cluster.as_deref() else {
            return Ok(());
        };
        let (snapshot, revision) = match self.shared.cache.get(cluster) {
            Some((snapshot, revision)) => (snapshot, revision),
            None => (Arc::new(RuntimeSnapshot::empty()), 0),
        };
        let version = wire_version(revision, &snapshot.version);
        if self.last_sent_version.as_deref() == Some(version.as_str()) {
            return Ok(());
        }
        self.send_snapshot(&snapshot, version, tx).await
    }

    async fn send_snapshot(
        &mut self,
        snapshot: &RuntimeSnapshot,
        version: String,
        tx: &mpsc::Sender<v3::DiscoveryResponse>,
    ) -> Result<(), StreamClosed> {
        let nonce = self.next_nonce();
        let resources = if self.serves_layer() {
            vec![self.encode_runtime_resource(snapshot)]
        } else {
            Vec::new()
        };
        let count = resources.len() as u64;
        let response = v3::DiscoveryResponse {
            version_info: version.clone(),
            resources,
            nonce: nonce.clone(),
        };
        tx.send(response).await.map_err(|_| StreamClosed)?;

        self.shared
            .telemetry
            .record_resources_served(&self.scope, count);
        self.last_sent_version = Some(version);
        self.last_sent_nonce = Some(nonce);
        self.last_send_at = Instant::now();
        self.awaiting_ack = true;
        self.nonce_deadline = Some(Instant::now() + self.shared.config.nonce_expiry);
        Ok(())
    }

    /// TTL-only refresh of the last sent version; does not await
    /// acknowledgement and does not count as a content change.
    async fn send_heartbeat(
        &mut self,
        tx: &mpsc::Sender<v3::DiscoveryResponse>,
    ) -> Result<(), StreamClosed> {
        let (Some(version), Some(ttl)) = (
            self.last_sent_version.clone(),
            self.shared.config.resource_ttl,
        ) else {
            return Ok(());
        };

        let resources = if self.serves_layer() {
            let resource = v3::Resource {
                name: self.shared.config.rtds_layer_name.clone(),
                ttl: Some(proto_duration(ttl)),
                resource: None,
            };
            vec![pack_message(self.protocol.resource_type_url(), &resource)]
        } else {
            Vec::new()
        };
        let count = resources.len() as u64;
        let response = v3::DiscoveryResponse {
            version_info: version,
            resources,
            nonce: self.next_nonce(),
        };
        tx.send(response).await.map_err(|_| StreamClosed)?;

        self.shared
            .telemetry
            .record_resources_served(&self.scope, count);
        self.last_send_at = Instant::now();
        Ok(())
    }

    /// Runs when the stream returns to idle: newer content wins, then an
    /// overdue heartbeat.
    async fn on_idle(
        &mut self,
        tx: &mpsc::Sender<v3::DiscoveryResponse>,
    ) -> Result<(), StreamClosed> {
        self.push_if_newer(tx).await?;
        if !self.awaiting_ack && self.heartbeat_due() {
            self.send_heartbeat(tx).await?;
        }
        Ok(())
    }

    fn heartbeat_due(&self) -> bool {
        match (
            self.shared.config.heartbeat_interval,
            &self.last_sent_version,
        ) {
            (Some(interval), Some(_)) => self.last_send_at.elapsed() >= interval,
            _ => false,
        }
    }

    fn next_deadline(&self) -> Option<(Instant, TimerKind)> {
        if self.awaiting_ack {
            return self
                .nonce_deadline
                .map(|at| (at, TimerKind::NonceExpiry));
        }
        let heartbeat = self.shared.config.heartbeat_interval?;
        self.last_sent_version.as_ref()?;
        Some((self.last_send_at + heartbeat, TimerKind::Heartbeat))
    }

    fn serves_layer(&self) -> bool {
        self.resource_names.is_empty()
            || self
                .resource_names
                .iter()
                .any(|name| *name == self.shared.config.rtds_layer_name)
    }

    fn encode_runtime_resource(&self, snapshot: &RuntimeSnapshot) -> prost_types::Any {
        let runtime = v3::Runtime {
            name: self.shared.config.rtds_layer_name.clone(),
            entries: snapshot
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        match self.shared.config.resource_ttl {
            Some(ttl) => {
                let resource = v3::Resource {
                    name: self.shared.config.rtds_layer_name.clone(),
                    ttl: Some(proto_duration(ttl)),
                    resource: Some(pack_message(self.protocol.runtime_type_url(), &runtime)),
                };
                pack_message(self.protocol.resource_type_url(), &resource)
            }
            None => pack_message(self.protocol.runtime_type_url(), &runtime),
        }
    }

    fn next_nonce(&self) -> String {
        self.shared
            .nonce_seq
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }
}

fn proto_duration(duration: std::time::Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

/// On-wire `version_info`: the cache's install revision, zero-padded so
/// successive versions compare greater as strings, followed by the content
/// hash so unchanged content keeps an identical content component.
fn wire_version(revision: u64, content_version: &str) -> String {
    format!("{revision:020}:{content_version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: &str, nonce: &str) -> v3::DiscoveryRequest {
        v3::DiscoveryRequest {
            version_info: version.to_string(),
            response_nonce: nonce.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn classification_matches_protocol_rules() {
        // A request with error detail is a NACK regardless of other fields.
        let mut nack = request("v", "7");
        nack.error_detail = Some(v3::ErrorDetail {
            code: 2,
            message: "bad".to_string(),
        });
        assert_eq!(
            classify_request(&nack, Some("v"), Some("7")),
            RequestKind::Nack
        );

        // Empty version and nonce open the stream.
        assert_eq!(
            classify_request(&request("", ""), None, None),
            RequestKind::Initial
        );

        // Echoing the last version and nonce acknowledges it.
        assert_eq!(
            classify_request(&request("v", "7"), Some("v"), Some("7")),
            RequestKind::Ack
        );

        // Anything else is stale.
        assert_eq!(
            classify_request(&request("v", "6"), Some("v"), Some("7")),
            RequestKind::Stale
        );
        assert_eq!(
            classify_request(&request("old", "7"), Some("v"), Some("7")),
            RequestKind::Stale
        );
    }

    #[test]
    fn proto_duration_preserves_subseconds() {
        let d = proto_duration(std::time::Duration::from_millis(1500));
        assert_eq!(d.seconds, 1);
        assert_eq!(d.nanos, 500_000_000);
    }

    #[test]
    fn wire_versions_order_by_install_revision() {
        // Content hashes alone carry no temporal order; the revision prefix
        // must dominate the comparison regardless of how the hashes sort.
        let older = wire_version(9, "ffff");
        let newer = wire_version(10, "0000");
        assert!(newer > older);

        let a = wire_version(1, "aa");
        let b = wire_version(2, "aa");
        let c = wire_version(3, "bb");
        assert!(a < b && b < c);
    }

    #[test]
    fn wire_version_keeps_the_content_component() {
        let v = wire_version(7, "cafe");
        assert!(v.ends_with(":cafe"));
        assert_eq!(
            wire_version(7, "cafe"),
            wire_version(7, "cafe"),
            "same install must map to the same wire version"
        );
    }

    #[test]
    fn protocol_versions_pick_their_own_type_urls() {
        assert_eq!(ProtocolVersion::V2.runtime_type_url(), RUNTIME_TYPE_URL_V2);
        assert_eq!(ProtocolVersion::V3.runtime_type_url(), RUNTIME_TYPE_URL_V3);
        assert_ne!(
            ProtocolVersion::V2.resource_type_url(),
            ProtocolVersion::V3.resource_type_url()
        );
    }
}
