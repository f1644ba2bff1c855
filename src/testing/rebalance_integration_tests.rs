//! End-to-end rebalance scenarios: scale up, scale down, chunked transfer,
//! and data loss when a sole owner dies.

#[cfg(test)]
mod tests {
    use crate::testing::cluster::{wait_for, TestGrid};
    use crate::types::segment_of;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::time::Duration;

    fn value(i: usize) -> Bytes {
        Bytes::from(format!("value-{i}"))
    }

    async fn fill(grid: &TestGrid, origin: u64, count: usize) -> HashMap<Vec<u8>, Bytes> {
        let mut expected = HashMap::new();
        for i in 0..count {
            let key = format!("key-{i}").into_bytes();
            grid.node(origin)
                .local
                .put(&key, value(i))
                .await
                .unwrap_or_else(|e| panic!("put key-{i} failed: {e}"));
            expected.insert(key, value(i));
        }
        expected
    }

    async fn assert_all_readable(grid: &TestGrid, origin: u64, expected: &HashMap<Vec<u8>, Bytes>) {
        for (key, want) in expected {
            let got = grid.node(origin).local.get(key).await.unwrap();
            assert_eq!(
                got.as_ref(),
                Some(want),
                "wrong value for {}",
                String::from_utf8_lossy(key)
            );
        }
    }

    #[tokio::test]
    async fn test_single_node_serves_all_segments() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;

        let topology = grid.node(1).local.current_topology().unwrap();
        assert_eq!(topology.topology_id(), 1);
        assert_eq!(topology.actual_members(), &[1]);
        for segment in 0..8 {
            assert_eq!(topology.read_owners(segment), &[1]);
        }

        let expected = fill(&grid, 1, 50).await;
        assert_all_readable(&grid, 1, &expected).await;
        assert_eq!(grid.node(1).container.len(), 50);
    }

    #[tokio::test]
    async fn test_scale_up_migrates_without_loss_or_duplication() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;
        let expected = fill(&grid, 1, 100).await;

        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        let topology = grid.node(1).local.current_topology().unwrap();
        // Both nodes own a non-trivial share.
        let owned_by = |node: u64| {
            (0..8)
                .filter(|&s| topology.read_owners(s) == [node])
                .count()
        };
        assert_eq!(owned_by(1) + owned_by(2), 8);
        assert!(owned_by(1) >= 3, "node 1 owns too few segments");
        assert!(owned_by(2) >= 3, "node 2 owns too few segments");

        // Every key readable from either node, exactly one copy in total.
        assert_all_readable(&grid, 1, &expected).await;
        assert_all_readable(&grid, 2, &expected).await;
        assert_eq!(
            grid.node(1).container.len() + grid.node(2).container.len(),
            100,
            "keys were lost or duplicated during migration"
        );
        assert!(grid.node(2).container.len() > 0, "nothing migrated");
    }

    #[tokio::test]
    async fn test_large_segment_travels_in_multiple_chunks() {
        // chunk_size is 16 in the fixture; 300 keys force several chunks
        // per segment.
        let mut grid = TestGrid::new(4, 1);
        grid.start_node(1).await;
        let expected = fill(&grid, 1, 300).await;

        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        assert_all_readable(&grid, 2, &expected).await;
        assert_eq!(
            grid.node(1).container.len() + grid.node(2).container.len(),
            300
        );
    }

    #[tokio::test]
    async fn test_backup_owner_covers_crashed_node() {
        let mut grid = TestGrid::new(8, 2);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;
        grid.start_node(3).await;
        grid.wait_for_stable_topology(&[1, 2, 3]).await;

        let expected = fill(&grid, 1, 100).await;

        grid.crash(3).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        // Two owners per segment: the surviving replica reseeds everything.
        assert_all_readable(&grid, 1, &expected).await;
        assert!(grid.node(1).local.lost_segments().is_empty());
        assert!(grid.node(2).local.lost_segments().is_empty());
    }

    #[tokio::test]
    async fn test_sole_owner_crash_surfaces_data_loss() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        let expected = fill(&grid, 1, 60).await;
        let topology = grid.node(1).local.current_topology().unwrap();
        let doomed_segments: Vec<u32> = (0..8)
            .filter(|&s| topology.read_owners(s) == [2])
            .collect();
        assert!(!doomed_segments.is_empty());

        grid.crash(2).await;
        grid.wait_for_stable_topology(&[1]).await;

        // Node 1 gained node 2's segments but nobody could provide them.
        let lost = grid.node(1).local.lost_segments();
        assert_eq!(lost, doomed_segments);

        for (key, want) in &expected {
            let segment = segment_of(key, 8);
            let result = grid.node(1).local.get(key).await;
            if doomed_segments.contains(&segment) {
                let err = result.unwrap_err();
                assert!(err.is_data_loss(), "expected data loss, got {err}");
                assert!(!err.is_retryable(), "data loss must not look transient");
            } else {
                assert_eq!(result.unwrap().as_ref(), Some(want));
            }
        }

        // Operator acknowledges the loss; the segments serve again, empty.
        for segment in &lost {
            assert!(grid.node(1).local.clear_lost_segment(*segment));
        }
        for (key, _) in expected {
            if doomed_segments.contains(&segment_of(&key, 8)) {
                assert_eq!(grid.node(1).local.get(&key).await.unwrap(), None);
            }
        }
    }

    #[tokio::test]
    async fn test_write_to_dead_owner_fails_then_recovers() {
        let mut grid = TestGrid::new(8, 1);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        let topology = grid.node(1).local.current_topology().unwrap();
        let key = (0..)
            .map(|i| format!("probe-{i}").into_bytes())
            .find(|k| topology.read_owners(segment_of(k, 8)) == [2])
            .unwrap();

        grid.hub.crash(2);
        // The owner is gone and no new topology exists yet: the write burns
        // its retry budget and surfaces a timeout.
        let err = grid
            .node(1)
            .local
            .put(&key, Bytes::from_static(b"v"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // Once the leave is processed and the topology moves on, the same
        // write lands on the new owner.
        let view_id = grid.hub.advance_view();
        let cluster = grid.node(1).cluster.clone().unwrap();
        cluster.handle_leave(2, view_id).await.unwrap();
        grid.wait_for_stable_topology(&[1]).await;

        grid.node(1)
            .local
            .clear_lost_segment(segment_of(&key, 8));
        grid.node(1)
            .local
            .put(&key, Bytes::from_static(b"v2"))
            .await
            .unwrap();
        assert_eq!(
            grid.node(1).local.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn test_confirm_timeout_unwedges_rebalance() {
        let mut grid = TestGrid::new(8, 2);
        grid.start_node(1).await;
        grid.start_node(2).await;
        grid.wait_for_stable_topology(&[1, 2]).await;

        // Node 3 joins and immediately dies without confirming. No leave
        // event is delivered: only the watchdog can unstick the rebalance.
        grid.start_node(3).await;
        grid.hub.crash(3);

        let settled = wait_for(Duration::from_secs(10), || {
            grid.node(1)
                .local
                .current_topology()
                .map(|t| !t.is_rebalancing() && !t.actual_members().contains(&3))
                .unwrap_or(false)
        })
        .await;
        assert!(settled, "watchdog did not evict the silent member");
    }
}
