use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use faultline_protocol::pb::chaos;
use faultline_protocol::{unpack_message, EGRESS_FAULT_TYPE_URL, INGRESS_FAULT_TYPE_URL};

use crate::experiment::Experiment;

/// The full set of runtime overrides for one cluster at one version. The
/// version is a content hash: equal content hashes to the same version, any
/// content change produces a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub entries: BTreeMap<String, String>,
    pub version: String,
}

impl RuntimeSnapshot {
    pub fn from_entries(entries: BTreeMap<String, String>) -> Self {
        let version = content_version(&entries);
        Self { entries, version }
    }

    pub fn empty() -> Self {
        Self::from_entries(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn content_version(entries: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.len().to_be_bytes());
        hasher.update(value.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

/// Flattens the running experiment set into per-cluster runtime snapshots.
///
/// Pure and total: experiments with unrecognized config type URLs are skipped,
/// and the same input always produces byte-identical output.
pub fn build_snapshots(
    experiments: &[Experiment],
    ingress_prefix: &str,
    egress_prefix: &str,
) -> BTreeMap<String, RuntimeSnapshot> {
    let mut per_cluster: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

    for experiment in experiments {
        match experiment.config.type_url.as_str() {
            url if url == INGRESS_FAULT_TYPE_URL => {
                match unpack_message::<chaos::IngressFaultConfig>(
                    &experiment.config,
                    INGRESS_FAULT_TYPE_URL,
                ) {
                    Ok(config) => flatten_ingress(&mut per_cluster, ingress_prefix, &config),
                    Err(err) => {
                        tracing::warn!(experiment_id = experiment.id, error = %err, "skipping undecodable ingress fault config");
                    }
                }
            }
            url if url == EGRESS_FAULT_TYPE_URL => {
                match unpack_message::<chaos::EgressFaultConfig>(
                    &experiment.config,
                    EGRESS_FAULT_TYPE_URL,
                ) {
                    Ok(config) => flatten_egress(&mut per_cluster, egress_prefix, &config),
                    Err(err) => {
                        tracing::warn!(experiment_id = experiment.id, error = %err, "skipping undecodable egress fault config");
                    }
                }
            }
            other => {
                tracing::debug!(
                    experiment_id = experiment.id,
                    type_url = other,
                    "ignoring experiment with unrecognized config type"
                );
            }
        }
    }

    per_cluster
        .into_iter()
        .map(|(cluster, entries)| (cluster, RuntimeSnapshot::from_entries(entries)))
        .collect()
}

fn flatten_ingress(
    per_cluster: &mut BTreeMap<String, BTreeMap<String, String>>,
    prefix: &str,
    config: &chaos::IngressFaultConfig,
) {
    if config.cluster.is_empty() {
        tracing::debug!("ignoring ingress fault config without a target cluster");
        return;
    }
    let entries = per_cluster.entry(config.cluster.clone()).or_default();
    match &config.fault {
        Some(chaos::ingress_fault_config::Fault::Abort(abort)) => {
            entries.insert(
                format!("{prefix}.{}.abort.abort_percent", config.cluster),
                abort.percent.to_string(),
            );
            entries.insert(
                format!("{prefix}.{}.abort.http_status", config.cluster),
                abort.http_status.to_string(),
            );
        }
        Some(chaos::ingress_fault_config::Fault::Latency(latency)) => {
            entries.insert(
                format!("{prefix}.{}.delay.fixed_delay_percent", config.cluster),
                latency.percent.to_string(),
            );
            entries.insert(
                format!("{prefix}.{}.delay.fixed_duration_ms", config.cluster),
                latency.duration_ms.to_string(),
            );
        }
        None => {
            tracing::debug!(cluster = %config.cluster, "ignoring ingress fault config without a fault");
        }
    }
}

fn flatten_egress(
    per_cluster: &mut BTreeMap<String, BTreeMap<String, String>>,
    prefix: &str,
    config: &chaos::EgressFaultConfig,
) {
    if config.cluster.is_empty() || config.upstream_cluster.is_empty() {
        tracing::debug!("ignoring egress fault config without a cluster pair");
        return;
    }
    let entries = per_cluster.entry(config.cluster.clone()).or_default();
    let pair = format!("{}.{}", config.cluster, config.upstream_cluster);
    match &config.fault {
        Some(chaos::egress_fault_config::Fault::Abort(abort)) => {
            entries.insert(
                format!("{prefix}.{pair}.abort.abort_percent"),
                abort.percent.to_string(),
            );
            entries.insert(
                format!("{prefix}.{pair}.abort.http_status"),
                abort.http_status.to_string(),
            );
        }
        Some(chaos::egress_fault_config::Fault::Latency(latency)) => {
            entries.insert(
                format!("{prefix}.{pair}.delay.fixed_delay_percent"),
                latency.percent.to_string(),
            );
            entries.insert(
                format!("{prefix}.{pair}.delay.fixed_duration_ms"),
                latency.duration_ms.to_string(),
            );
        }
        None => {
            tracing::debug!(cluster = %config.cluster, "ignoring egress fault config without a fault");
        }
    }
}
