use std::sync::{Arc, Barrier};
use std::thread;
use strata::{BBox, TierKind};
use strata_int_test::test_util::{
    cleanup, create_quadtree_context, create_test_context, random_cloud, run_test,
};

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_depth_ranges_partition_results() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            tree.insert(&random_cloud(tree.schema(), tree.bounds(), 3000, 3), 1)?;

            let total = tree.get_points(0, 8)?.len();
            let split: usize = [(0, 2), (2, 5), (5, 8)]
                .iter()
                .map(|(b, e)| tree.get_points(*b, *e).map(|r| r.len()))
                .sum::<Result<usize, _>>()?;
            assert_eq!(split, total);
            assert_eq!(total as u64, tree.num_placed());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_results_are_partitioned_by_tier() {
    run_test(
        create_quadtree_context,
        |ctx| {
            let tree = ctx.tree();
            tree.insert(&random_cloud(tree.schema(), tree.bounds(), 100, 9), 1)?;

            let results = tree.get_points(0, 4)?;
            let kinds: Vec<TierKind> = results.tiers().iter().map(|t| t.kind).collect();
            assert_eq!(kinds, vec![TierKind::Resident, TierKind::Flat, TierKind::Paged]);
            assert_eq!(results.tiers()[0].len(), 1);
            assert!(results.tiers()[1].len() <= 4);

            let deep_only = tree.get_points(2, 4)?;
            assert_eq!(deep_only.tiers().len(), 1);
            assert_eq!(deep_only.tiers()[0].kind, TierKind::Paged);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_region_query_matches_filtered_scan() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            tree.insert(&random_cloud(tree.schema(), tree.bounds(), 4000, 21), 1)?;

            let region = BBox::new_3d(100.0, 200.0, 10.0, 450.0, 700.0, 60.0);
            let mut expected: Vec<Vec<u8>> = tree
                .get_points(1, 7)?
                .into_points()
                .into_iter()
                .filter(|p| region.contains(&p.point))
                .map(|p| p.data)
                .collect();
            let mut actual: Vec<Vec<u8>> = tree
                .get_points_in(&region, 1, 7)?
                .into_points()
                .into_iter()
                .map(|p| p.data)
                .collect();

            expected.sort();
            actual.sort();
            assert!(!actual.is_empty());
            assert_eq!(actual, expected);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_queries_do_not_mutate() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            tree.insert(&random_cloud(tree.schema(), tree.bounds(), 1000, 4), 1)?;
            let before = (tree.num_points(), tree.num_placed());

            let first = tree.get_points(0, 8)?;
            let region = BBox::new_3d(0.0, 0.0, 0.0, 500.0, 500.0, 50.0);
            tree.get_points_in(&region, 0, 8)?;
            let second = tree.get_points(0, 8)?;

            assert_eq!(first, second);
            assert_eq!((tree.num_points(), tree.num_placed()), before);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_empty_and_disjoint_queries() {
    run_test(
        create_quadtree_context,
        |ctx| {
            let tree = ctx.tree();
            assert!(tree.get_points(0, 4)?.is_empty());

            tree.insert(&random_cloud(tree.schema(), tree.bounds(), 50, 1), 1)?;
            let outside = BBox::new_2d(200.0, 200.0, 300.0, 300.0);
            assert!(tree.get_points_in(&outside, 0, 4)?.is_empty());
            assert!(tree.get_points(3, 3)?.is_empty());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_queries_run_alongside_inserts() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            let barrier = Arc::new(Barrier::new(3));

            let mut handles = vec![];
            for t in 0..2u64 {
                let tree = tree.clone();
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || {
                    let buffer = random_cloud(tree.schema(), tree.bounds(), 2000, 100 + t);
                    barrier.wait();
                    tree.insert(&buffer, t).map(|_| ())
                }));
            }

            barrier.wait();
            let mut last = 0;
            for _ in 0..20 {
                // Occupied cells are never emptied, so counts never shrink
                let seen = tree.get_points(0, 8)?.len();
                assert!(seen >= last);
                last = seen;
            }

            for handle in handles {
                handle.join().unwrap()?;
            }
            assert_eq!(tree.get_points(0, 8)?.len() as u64, tree.num_placed());
            Ok(())
        },
        cleanup,
    )
}
