use olivinedb::core::cluster::{ClusterView, HashPartitionService, PartitionService};
use olivinedb::core::query::Query;
use std::sync::Arc;

fn service(members: &[&str], local: &str) -> HashPartitionService {
    let view = Arc::new(ClusterView::new(local));
    view.update_members(members.iter().map(|m| m.to_string()).collect());
    HashPartitionService::new(view, 271, 1)
}

#[tokio::test]
async fn test_leader_is_lexicographically_smallest() {
    let view = ClusterView::new("node-b");
    view.update_members(vec!["node-c".into(), "node-a".into(), "node-b".into()]);
    assert_eq!(view.leader(), "node-a");
    assert!(!view.is_leader());
}

#[tokio::test]
async fn test_update_members_always_retains_local_node() {
    let view = ClusterView::new("node-b");
    let version = view.update_members(vec!["node-a".into()]);
    assert_eq!(version, 2);
    assert!(view.members().contains(&"node-b".to_string()));
}

#[tokio::test]
async fn test_every_key_has_exactly_one_owner() {
    let a = service(&["a", "b", "c"], "a");
    let b = service(&["a", "b", "c"], "b");
    let c = service(&["a", "b", "c"], "c");
    for key in ["users:1", "tasks:42", "x", ""] {
        let owners = [&a, &b, &c]
            .iter()
            .filter(|s| s.is_local_owner(key))
            .count();
        assert_eq!(owners, 1, "key {key:?} must have one owner");
    }
}

#[tokio::test]
async fn test_single_node_owns_everything() {
    let solo = service(&["only"], "only");
    assert!(solo.is_local_owner("anything"));
    assert!(solo.relevant_peers(&Query::default()).is_empty());
}

#[tokio::test]
async fn test_partition_map_lists_every_partition() {
    let svc = service(&["a", "b"], "a");
    let (version, partitions) = svc.partition_map();
    assert!(version >= 1);
    assert_eq!(partitions.len(), 271);
    assert!(partitions.iter().all(|p| !p.owner.is_empty()));
}
