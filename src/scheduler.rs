// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Tiered, score-weighted placement.
//!
//! Tiers are tried in order and the first tier with any candidate wins:
//! warm pool, template affinity (nodes with the image cached), then load
//! balance. Nodes that are not online or have hit the consecutive-failure
//! threshold are never candidates. Ties break by lower load, then node id,
//! so identical inputs always place identically.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::db::nodes::NodeRecord;
use crate::db::{self, DbPool};
use crate::error::ApiError;
use crate::warm_pool::{WarmContainer, WarmPool};

/// What a session asks the scheduler for.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub template_id: String,
    pub template_name: String,
    pub image: String,
    pub cpu_millis: i64,
    pub memory_mb: i64,
    pub persistent: bool,
    pub agent_affinity_id: Option<String>,
    /// Extra requested packages rule the warm tier out: a warm container
    /// has already booted past its install phase.
    pub has_extra_dependencies: bool,
}

/// The scheduler's verdict.
#[derive(Debug)]
pub enum Placement {
    /// A pre-instantiated container claimed from the warm pool.
    Warm(WarmContainer),
    /// Create a fresh container on this node.
    Node(ScoredNode),
}

/// Which tier produced a node placement (the warm tier returns containers,
/// not nodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementTier {
    Affinity,
    LoadBalance,
}

#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node_id: String,
    pub score: i64,
    pub tier: PlacementTier,
}

pub struct Scheduler {
    pool: Arc<WarmPool>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(pool: Arc<WarmPool>, config: SchedulerConfig) -> Self {
        Self { pool, config }
    }

    pub fn warm_pool(&self) -> &Arc<WarmPool> {
        &self.pool
    }

    /// Pick a placement, or surface capacity exhaustion.
    pub async fn place(
        &self,
        pool: &DbPool,
        request: &PlacementRequest,
    ) -> Result<Placement, ApiError> {
        // Tier 1: warm pool.
        if !request.has_extra_dependencies {
            if let Some(warm) = self.pool.claim(&request.template_id) {
                return Ok(Placement::Warm(warm));
            }
        }

        let nodes = db::nodes::list_online(pool).await?;

        // Tier 2: template affinity.
        if let Some(node) = pick_affinity(&nodes, request, &self.config) {
            return Ok(Placement::Node(node));
        }

        // Tier 3: load balance.
        if let Some(node) = pick_load_balanced(&nodes, request, &self.config) {
            return Ok(Placement::Node(node));
        }

        Err(ApiError::capacity_exhausted(format!(
            "no schedulable node for template {} ({}m CPU, {}Mi)",
            request.template_name, request.cpu_millis, request.memory_mb
        )))
    }
}

fn fits(node: &NodeRecord, request: &PlacementRequest) -> bool {
    node.is_schedulable()
        && node.free_cpu_millis() >= request.cpu_millis
        && node.free_memory_mb() >= request.memory_mb
        && node.running_containers < node.max_containers
}

/// 0..=1000 margin score: how much headroom a node keeps after placement.
fn margin_permille(node: &NodeRecord) -> i64 {
    let cpu = if node.total_cpu_millis > 0 {
        node.free_cpu_millis() * 500 / node.total_cpu_millis
    } else {
        0
    };
    let mem = if node.total_memory_mb > 0 {
        node.free_memory_mb() * 500 / node.total_memory_mb
    } else {
        0
    };
    cpu + mem
}

/// Deterministic best-of: highest score, then lowest load, then node id.
fn best<'a>(
    candidates: impl Iterator<Item = (&'a NodeRecord, i64)>,
    tier: PlacementTier,
) -> Option<ScoredNode> {
    candidates
        .min_by(|(a, score_a), (b, score_b)| {
            score_b
                .cmp(score_a)
                .then(a.running_containers.cmp(&b.running_containers))
                .then(a.id.cmp(&b.id))
        })
        .map(|(node, score)| ScoredNode { node_id: node.id.clone(), score, tier })
}

/// Tier 2: nodes that already cache the template image, with a bonus for a
/// persistent session landing on its preferred agent node.
pub fn pick_affinity(
    nodes: &[NodeRecord],
    request: &PlacementRequest,
    config: &SchedulerConfig,
) -> Option<ScoredNode> {
    best(
        nodes
            .iter()
            .filter(|n| fits(n, request) && n.has_cached_image(&request.image))
            .map(|n| {
                let mut score = config.affinity_weight * 1000 + margin_permille(n);
                if request.persistent {
                    if let Some(agent) = &request.agent_affinity_id {
                        let matches = n
                            .labels
                            .get("agent_affinity")
                            .and_then(|v| v.as_str())
                            .map(|v| v == agent)
                            .unwrap_or(false);
                        if matches {
                            score += config.affinity_agent_bonus * 1000;
                        }
                    }
                }
                (n, score)
            }),
        PlacementTier::Affinity,
    )
}

/// Tier 3: any node with room, preferring the largest free margin.
pub fn pick_load_balanced(
    nodes: &[NodeRecord],
    request: &PlacementRequest,
    config: &SchedulerConfig,
) -> Option<ScoredNode> {
    best(
        nodes
            .iter()
            .filter(|n| fits(n, request))
            .map(|n| (n, config.load_weight * 1000 + margin_permille(n))),
        PlacementTier::LoadBalance,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            warm_pool_enabled: true,
            warm_pool_default_target: 5,
            warm_pool_targets: vec![],
            replenish_interval_secs: 15,
            warm_weight: 100,
            affinity_weight: 50,
            load_weight: 30,
            affinity_agent_bonus: 25,
        }
    }

    fn request() -> PlacementRequest {
        PlacementRequest {
            template_id: "tmpl_py".into(),
            template_name: "python-basic".into(),
            image: "python:3.12-slim".into(),
            cpu_millis: 1000,
            memory_mb: 512,
            persistent: false,
            agent_affinity_id: None,
            has_extra_dependencies: false,
        }
    }

    fn node(id: &str, free_cpu: i64, free_mem: i64, cached: bool, containers: i32) -> NodeRecord {
        let total_cpu = 8000;
        let total_mem = 16384;
        NodeRecord {
            id: id.into(),
            hostname: format!("{}.local", id),
            runtime_type: "docker".into(),
            endpoint: "http://10.0.0.1:8080".into(),
            status: "online".into(),
            total_cpu_millis: total_cpu,
            total_memory_mb: total_mem,
            allocated_cpu_millis: total_cpu - free_cpu,
            allocated_memory_mb: total_mem - free_mem,
            running_containers: containers,
            max_containers: 32,
            cached_images: if cached {
                serde_json::json!(["python:3.12-slim"])
            } else {
                serde_json::json!([])
            },
            labels: serde_json::json!({}),
            last_heartbeat_at: Some(Utc::now()),
            consecutive_failures: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_affinity_requires_cached_image() {
        let nodes = vec![node("node_b", 4000, 8192, false, 1)];
        assert!(pick_affinity(&nodes, &request(), &config()).is_none());

        let nodes = vec![node("node_b", 4000, 8192, true, 1)];
        let picked = pick_affinity(&nodes, &request(), &config()).unwrap();
        assert_eq!(picked.node_id, "node_b");
    }

    #[test]
    fn test_affinity_prefers_higher_margin() {
        let nodes = vec![
            node("node_a", 1000, 1024, true, 4),
            node("node_b", 7000, 12000, true, 4),
        ];
        let picked = pick_affinity(&nodes, &request(), &config()).unwrap();
        assert_eq!(picked.node_id, "node_b");
    }

    #[test]
    fn test_agent_affinity_bonus_beats_margin() {
        let mut favored = node("node_z", 2000, 2048, true, 4);
        favored.labels = serde_json::json!({"agent_affinity": "agent-42"});
        let nodes = vec![node("node_a", 7000, 12000, true, 4), favored];

        let mut req = request();
        req.persistent = true;
        req.agent_affinity_id = Some("agent-42".into());

        let picked = pick_affinity(&nodes, &req, &config()).unwrap();
        assert_eq!(picked.node_id, "node_z");
    }

    #[test]
    fn test_load_balance_skips_full_nodes() {
        let mut full = node("node_a", 500, 256, false, 2);
        full.allocated_cpu_millis = full.total_cpu_millis - 500;
        let nodes = vec![full, node("node_b", 4000, 8192, false, 2)];
        let picked = pick_load_balanced(&nodes, &request(), &config()).unwrap();
        assert_eq!(picked.node_id, "node_b");
    }

    #[test]
    fn test_non_online_nodes_never_chosen() {
        let mut draining = node("node_a", 8000, 16384, true, 0);
        draining.status = "draining".into();
        let mut failing = node("node_b", 8000, 16384, true, 0);
        failing.consecutive_failures = 3;
        let nodes = vec![draining, failing];
        assert!(pick_affinity(&nodes, &request(), &config()).is_none());
        assert!(pick_load_balanced(&nodes, &request(), &config()).is_none());
    }

    #[test]
    fn test_ties_break_by_load_then_id() {
        let nodes = vec![
            node("node_c", 4000, 8192, false, 2),
            node("node_a", 4000, 8192, false, 2),
            node("node_b", 4000, 8192, false, 1),
        ];
        let picked = pick_load_balanced(&nodes, &request(), &config()).unwrap();
        // node_b has the lowest load; among equals node_a would win on id.
        assert_eq!(picked.node_id, "node_b");

        let nodes = vec![
            node("node_c", 4000, 8192, false, 2),
            node("node_a", 4000, 8192, false, 2),
        ];
        let picked = pick_load_balanced(&nodes, &request(), &config()).unwrap();
        assert_eq!(picked.node_id, "node_a");
    }

    #[test]
    fn test_max_containers_respected() {
        let mut node_full = node("node_a", 4000, 8192, false, 32);
        node_full.max_containers = 32;
        assert!(pick_load_balanced(&[node_full], &request(), &config()).is_none());
    }
}
