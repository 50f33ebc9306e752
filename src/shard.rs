//! Static work partitioning across horizontally scaled replicas.
//!
//! Every replica hashes the same work keys with FNV-1a-32 and keeps the keys
//! whose hash lands on its own index, so N replicas split the work without a
//! coordination service. Membership (`total`, `index`) is resolved once at
//! startup.

// ============================================================================
// SHARD RESOLVER
// ============================================================================

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ClusterSettings;
use crate::error::ClusterError;

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// FNV-1a, 32-bit
pub fn fnv1a_32(key: &str) -> u32 {
    let mut hash = FNV32_OFFSET_BASIS;
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// Shard that owns `key` among `total` replicas. `total` of zero is treated as one.
pub fn shard_index(key: &str, total: usize) -> usize {
    let total = total.max(1);
    fnv1a_32(key) as usize % total
}

/// True when replica `index` of `total` owns `key`. `index` is reduced modulo `total`.
pub fn should_process(key: &str, total: usize, index: usize) -> bool {
    let total = total.max(1);
    shard_index(key, total) == index % total
}

/// Work key from its parts, `|`-joined
pub fn work_key(parts: &[&str]) -> String {
    parts.join("|")
}

// ----------------------------------------------------------------------------
// Shard Spec
// ----------------------------------------------------------------------------

/// This replica's position in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardSpec {
    pub total: usize,
    pub index: usize,
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self::single()
    }
}

impl ShardSpec {
    /// Normalizes `total` to at least one and `index` into range.
    pub fn new(total: usize, index: usize) -> Self {
        let total = total.max(1);
        Self {
            total,
            index: index % total,
        }
    }

    pub const fn single() -> Self {
        Self { total: 1, index: 0 }
    }

    pub fn owns(&self, key: &str) -> bool {
        should_process(key, self.total, self.index)
    }
}

// ----------------------------------------------------------------------------
// Membership Resolution
// ----------------------------------------------------------------------------

/// Position of `me` in the sorted, deduplicated member list
fn position_in<T: Ord>(members: BTreeSet<T>, me: &T) -> Option<ShardSpec> {
    let total = members.len();
    members.iter().position(|m| m == me).map(|index| ShardSpec::new(total, index))
}

fn pod_name(settings: &ClusterSettings) -> Option<String> {
    settings
        .pod_name
        .clone()
        .or_else(|| std::env::var("POD_NAME").ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|s| !s.trim().is_empty())
}

fn pod_ip(settings: &ClusterSettings) -> Option<IpAddr> {
    settings
        .pod_ip
        .clone()
        .or_else(|| std::env::var("POD_IP").ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Resolve via a headless service: every replica's IP is one A record.
async fn resolve_from_dns(service: &str, port: u16, me: IpAddr) -> Result<Option<ShardSpec>, ClusterError> {
    let addrs = tokio::net::lookup_host((service, port)).await.map_err(|e| ClusterError::DnsLookup {
        service: service.to_string(),
        message: e.to_string(),
    })?;
    let ips: BTreeSet<IpAddr> = addrs.map(|a| a.ip()).collect();
    if ips.is_empty() {
        return Ok(None);
    }
    match position_in(ips, &me) {
        Some(spec) => Ok(Some(spec)),
        None => Err(ClusterError::NotAMember { identity: me.to_string() }),
    }
}

/// Resolve via a member list file: one pod name per line.
fn resolve_from_file(path: &Path, me: &str) -> Result<Option<ShardSpec>, ClusterError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ClusterError::MemberFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let members: BTreeSet<String> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect();
    if members.is_empty() {
        return Ok(None);
    }
    match position_in(members, &me.to_string()) {
        Some(spec) => Ok(Some(spec)),
        None => Err(ClusterError::NotAMember { identity: me.to_string() }),
    }
}

/// Determine (total, index) for this process.
///
/// Tried in order: headless-service DNS, member list file, static settings.
/// Failures of one source fall through to the next; the static fallback
/// defaults to a single shard.
pub async fn resolve_cluster(settings: &ClusterSettings) -> ShardSpec {
    if let Some(service) = settings.headless_service.as_deref().filter(|s| !s.is_empty()) {
        match pod_ip(settings) {
            Some(ip) => match resolve_from_dns(service, settings.port, ip).await {
                Ok(Some(spec)) => {
                    info!(target: "exporter::cluster", service, total = spec.total, index = spec.index, "Resolved shard from DNS");
                    return spec;
                }
                Ok(None) => debug!(target: "exporter::cluster", service, "Headless service returned no addresses"),
                Err(e) => warn!(target: "exporter::cluster", error = %e, "DNS membership failed"),
            },
            None => debug!(target: "exporter::cluster", "Pod IP unknown, skipping DNS membership"),
        }
    }

    if let Some(path) = settings.members_file.as_deref() {
        match pod_name(settings) {
            Some(name) => match resolve_from_file(path, &name) {
                Ok(Some(spec)) => {
                    info!(target: "exporter::cluster", path = %path.display(), total = spec.total, index = spec.index, "Resolved shard from member list");
                    return spec;
                }
                Ok(None) => debug!(target: "exporter::cluster", path = %path.display(), "Member list is empty"),
                Err(e) => warn!(target: "exporter::cluster", error = %e, "Member list membership failed"),
            },
            None => debug!(target: "exporter::cluster", "Pod name unknown, skipping member list"),
        }
    }

    let spec = ShardSpec::new(settings.total, settings.index);
    info!(target: "exporter::cluster", total = spec.total, index = spec.index, "Using static shard assignment");
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_fnv1a_32_vectors() {
        assert_eq!(fnv1a_32(""), 0x811c_9dc5);
        assert_eq!(fnv1a_32("a"), 0xe40c_292c);
        assert_eq!(fnv1a_32("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_shard_index_is_deterministic() {
        let first = shard_index("acct-1|aws", 4);
        for _ in 0..100 {
            assert_eq!(shard_index("acct-1|aws", 4), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn test_degenerate_totals() {
        assert!(should_process("anything", 0, 0));
        assert!(should_process("anything", 1, 0));
        assert!(should_process("anything", 1, 7));
        let spec = ShardSpec::new(3, 7);
        assert_eq!(spec.index, 1);
    }

    #[test]
    fn test_spread_is_roughly_even() {
        let total = 4;
        let mut counts = [0usize; 4];
        for i in 0..4000 {
            counts[shard_index(&format!("account-{i}|cn-hangzhou|acs_slb_dashboard"), total)] += 1;
        }
        for count in counts {
            assert!(count > 700 && count < 1300, "uneven spread: {counts:?}");
        }
    }

    #[tokio::test]
    async fn test_resolve_from_member_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "exporter-2\nexporter-0\n\nexporter-1\n").unwrap();

        let settings = ClusterSettings {
            members_file: Some(file.path().to_path_buf()),
            pod_name: Some("exporter-1".into()),
            ..ClusterSettings::default()
        };
        assert_eq!(resolve_cluster(&settings).await, ShardSpec { total: 3, index: 1 });
    }

    #[tokio::test]
    async fn test_not_a_member_falls_back_to_static() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "exporter-0\nexporter-1").unwrap();

        let settings = ClusterSettings {
            members_file: Some(file.path().to_path_buf()),
            pod_name: Some("stranger".into()),
            total: 2,
            index: 5,
            ..ClusterSettings::default()
        };
        assert_eq!(resolve_cluster(&settings).await, ShardSpec { total: 2, index: 1 });
    }

    #[test]
    fn test_position_of_ip_in_sorted_set() {
        let ips: BTreeSet<IpAddr> = ["10.0.0.9", "10.0.0.2", "10.0.0.5"].iter().map(|s| s.parse().unwrap()).collect();
        let me: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(position_in(ips, &me), Some(ShardSpec { total: 3, index: 1 }));
    }

    proptest! {
        #[test]
        fn prop_exactly_one_owner(keys in prop::collection::vec("[a-z0-9|-]{0,24}", 1..64), total in 1usize..16) {
            for key in &keys {
                let owners = (0..total).filter(|i| should_process(key, total, *i)).count();
                prop_assert_eq!(owners, 1);
            }
        }

        #[test]
        fn prop_union_covers_all_keys_once(keys in prop::collection::btree_set("[a-z0-9|-]{1,24}", 1..64), total in 1usize..16) {
            let mut assigned: Vec<&String> = Vec::new();
            for index in 0..total {
                let spec = ShardSpec::new(total, index);
                assigned.extend(keys.iter().filter(|k| spec.owns(k)));
            }
            assigned.sort();
            let expected: Vec<&String> = keys.iter().collect();
            prop_assert_eq!(assigned, expected);
        }
    }
}
