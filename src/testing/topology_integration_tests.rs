//! Topology lifecycle scenarios: id monotonicity, outdated command
//! rejection, the rebalancing policy switch, protocol gating, and
//! coordinator handover.

#[cfg(test)]
mod tests {
    use crate::error::{Error, MembershipError, TopologyError};
    use crate::rpc::{JoinInfo, PolicyAction, TopologyCommand, TopologyResponse};
    use crate::testing::cluster::TestGrid;
    use crate::types::PROTOCOL_VERSION;
    use bytes::Bytes;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_topology_ids_strictly_increase() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;
        let mut last = grid.node(1).local.current_topology().unwrap().topology_id();
        assert_eq!(last, 1);

        for node in 2..=4 {
            grid.start_node(node).await;
            let members: Vec<u64> = (1..=node).collect();
            grid.wait_for_stable_topology(&members).await;
            let id = grid.node(1).local.current_topology().unwrap().topology_id();
            // One rebalancing step and one stable step per join.
            assert!(id >= last + 2, "id {id} did not advance past {last}");
            last = id;
        }
    }

    #[tokio::test]
    async fn test_all_nodes_converge_on_same_topology() {
        let mut grid = TestGrid::new(16, 2);
        for node in 1..=3 {
            grid.start_node(node).await;
        }
        grid.wait_for_stable_topology(&[1, 2, 3]).await;

        let reference = grid.node(1).local.current_topology().unwrap();
        for node in 2..=3 {
            let topology = grid.node(node).local.current_topology().unwrap();
            assert_eq!(topology, reference, "node {node} diverged");
        }
        // Every segment is fully replicated.
        for segment in 0..16 {
            assert_eq!(reference.read_owners(segment).len(), 2);
        }
    }

    #[tokio::test]
    async fn test_command_with_outdated_topology_rejected() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        let current = grid.node(2).local.current_topology().unwrap().topology_id();
        let err = grid
            .send_from(
                1,
                2,
                TopologyCommand::Put {
                    cache: "grid-test".into(),
                    key: b"k".to_vec(),
                    value: Bytes::from_static(b"v"),
                    topology_id: current - 1,
                    forwarded: false,
                },
            )
            .await
            .unwrap_err();
        match err {
            Error::Topology(TopologyError::Outdated {
                command_topology_id,
                current_topology_id,
            }) => {
                assert_eq!(command_topology_id, current - 1);
                assert_eq!(current_topology_id, current);
            }
            other => panic!("expected outdated error, got {other}"),
        }
        assert!(Error::outdated(current - 1, current).is_retryable());

        // A command from the future is served rather than bounced.
        let response = grid
            .send_from(
                1,
                2,
                TopologyCommand::Get {
                    cache: "grid-test".into(),
                    key: b"k".to_vec(),
                    topology_id: current + 1,
                },
            )
            .await
            .unwrap();
        assert!(matches!(response, TopologyResponse::Value(None)));
    }

    #[tokio::test]
    async fn test_rebalancing_disable_queues_until_enabled() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;

        let response = grid
            .send_from(
                1,
                1,
                TopologyCommand::RebalancePolicy {
                    action: PolicyAction::Disable,
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            response,
            TopologyResponse::PolicyStatus {
                rebalancing_enabled: false,
                ..
            }
        ));

        grid.start_node(2).await;
        // The joiner is admitted but no segments move.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let topology = grid.node(1).local.current_topology().unwrap();
        assert!(!topology.is_rebalancing());
        assert_eq!(topology.actual_members(), &[1]);
        assert!(grid.node(2).container.is_empty());

        let response = grid
            .send_from(
                1,
                1,
                TopologyCommand::RebalancePolicy {
                    action: PolicyAction::Enable,
                },
            )
            .await
            .unwrap();
        match response {
            TopologyResponse::PolicyStatus {
                rebalancing_enabled,
                mixed_cluster,
                oldest_member,
            } => {
                assert!(rebalancing_enabled);
                assert!(!mixed_cluster, "uniform versions flagged as mixed");
                assert_eq!(oldest_member, Some(1));
            }
            other => panic!("expected policy status, got {other:?}"),
        }
        grid.wait_for_stable_topology(&[1, 2]).await;
    }

    #[tokio::test]
    async fn test_join_with_old_protocol_version_rejected() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;

        let err = grid
            .send_from(
                1,
                1,
                TopologyCommand::JoinRequest {
                    cache: "grid-test".into(),
                    info: JoinInfo {
                        node: 9,
                        capacity_factor: 1.0,
                        protocol_version: PROTOCOL_VERSION - 2,
                        persistent_uuid: Uuid::new_v4(),
                        num_segments: 8,
                        num_owners: 1,
                    },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Membership(MembershipError::VersionMismatch { .. })
        ));
        // The stale joiner never makes it into the topology.
        let topology = grid.node(1).local.current_topology().unwrap();
        assert_eq!(topology.actual_members(), &[1]);
    }

    #[tokio::test]
    async fn test_coordinator_only_commands_bounce_elsewhere() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        let err = grid
            .send_from(
                1,
                2,
                TopologyCommand::RebalancePolicy {
                    action: PolicyAction::Query,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Topology(TopologyError::NotCoordinator)
        ));
    }

    #[tokio::test]
    async fn test_coordinator_handover_preserves_data() {
        let mut grid = TestGrid::new(8, 2);
        for node in 1..=3 {
            grid.start_node(node).await;
        }
        grid.wait_for_stable_topology(&[1, 2, 3]).await;

        let mut expected = Vec::new();
        for i in 0..80 {
            let key = format!("handover-{i}").into_bytes();
            grid.node(2)
                .local
                .put(&key, Bytes::from(format!("v{i}")))
                .await
                .unwrap();
            expected.push((key, Bytes::from(format!("v{i}"))));
        }
        let before = grid.node(2).local.current_topology().unwrap().topology_id();

        // The coordinator dies; node 2 recovers cluster state from the
        // survivors and rebalances the dead node away.
        grid.hub.crash(1);
        grid.promote(2).await;
        grid.wait_for_stable_topology(&[2, 3]).await;

        let after = grid.node(2).local.current_topology().unwrap();
        assert!(after.topology_id() > before, "topology went backwards");
        for (key, want) in &expected {
            let got = grid.node(3).local.get(key).await.unwrap();
            assert_eq!(got.as_ref(), Some(want));
        }
        assert!(grid.node(2).local.lost_segments().is_empty());
        assert!(grid.node(3).local.lost_segments().is_empty());
    }

    #[tokio::test]
    async fn test_stale_failure_report_does_not_evict_member() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        // A failure report left over from the finished rebalance arrives
        // late; no rebalance expects it, so the member stays.
        let old_id = grid.node(1).local.current_topology().unwrap().topology_id() - 1;
        grid.send_from(
            2,
            1,
            TopologyCommand::RebalancePhaseConfirm {
                cache: "grid-test".into(),
                origin: 2,
                topology_id: old_id,
                failure: Some("transfer timed out".into()),
                view_id: grid.hub.view_id(),
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let topology = grid.node(1).local.current_topology().unwrap();
        assert!(!topology.is_rebalancing());
        assert_eq!(topology.actual_members(), &[1, 2]);
    }

    #[tokio::test]
    async fn test_stale_leave_notification_discarded() {
        let mut grid = TestGrid::new(8, 2);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        let cluster = grid.node(1).cluster.clone().unwrap();
        let current_view = grid.hub.view_id();
        // Drive the view forward, then replay an event from the past.
        grid.hub.advance_view();
        cluster.handle_leave(2, grid.hub.view_id()).await.unwrap();
        let err = cluster.handle_leave(1, current_view).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Membership(MembershipError::StaleView { .. })
        ));
    }

    #[tokio::test]
    async fn test_lost_segments_cleared_when_ownership_moves_on() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;
        grid.crash(2).await;
        grid.wait_for_stable_topology(&[1]).await;

        let lost = grid.node(1).local.lost_segments();
        assert!(!lost.is_empty());

        // A new node takes over some segments; loss markers for segments
        // node 1 no longer owns go with them.
        grid.start_node(3).await;
        grid.wait_for_stable_topology(&[1, 3]).await;
        let still_lost = grid.node(1).local.lost_segments();
        let topology = grid.node(1).local.current_topology().unwrap();
        for segment in still_lost {
            assert_eq!(topology.read_owners(segment), &[1]);
        }
    }
}
