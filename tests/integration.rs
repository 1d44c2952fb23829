//! End-to-end scenarios: oracle-checked recall, boundary sizes, split
//! stress and persistence across reopen.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slimdb::{
    ChooseMethod, DiskPageManager, EuclideanDistance, FeatureVector, Object, SlimOptions,
    SlimTree, SplitMethod, VectorObject, WeightedEuclideanDistance,
};
use tempfile::NamedTempFile;

fn point(oid: u32, coords: &[f64]) -> VectorObject {
    VectorObject::new(oid, format!("o{}", oid), coords.to_vec())
}

fn l2(a: &VectorObject, b: &VectorObject) -> f64 {
    a.features()
        .iter()
        .zip(b.features())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn random_points(rng: &mut StdRng, n: usize, dim: usize, scale: f64) -> Vec<VectorObject> {
    (0..n)
        .map(|i| {
            let coords: Vec<f64> = (0..dim).map(|_| rng.gen_range(-scale..scale)).collect();
            point(i as u32, &coords)
        })
        .collect()
}

fn build_tree(
    page_size: usize,
    options: SlimOptions,
    points: &[VectorObject],
) -> (NamedTempFile, SlimTree<VectorObject, EuclideanDistance>) {
    let tmp = NamedTempFile::new().unwrap();
    let pager = DiskPageManager::create(tmp.path(), page_size).unwrap();
    let mut tree = SlimTree::create(pager, EuclideanDistance::new(), options).unwrap();
    for p in points {
        tree.add(p).unwrap();
    }
    (tmp, tree)
}

fn oracle_range(points: &[VectorObject], sample: &VectorObject, radius: f64) -> Vec<u32> {
    let mut oids: Vec<u32> = points
        .iter()
        .filter(|p| l2(p, sample) <= radius)
        .map(|p| p.oid().unwrap())
        .collect();
    oids.sort_unstable();
    oids
}

#[test]
fn invariants_hold_after_every_insert() {
    let mut rng = StdRng::seed_from_u64(7);
    let points = random_points(&mut rng, 60, 2, 50.0);
    let tmp = NamedTempFile::new().unwrap();
    let pager = DiskPageManager::create(tmp.path(), 256).unwrap();
    let mut tree = SlimTree::create(pager, EuclideanDistance::new(), SlimOptions::default()).unwrap();
    for (i, p) in points.iter().enumerate() {
        tree.add(p).unwrap();
        tree.validate().unwrap();
        assert_eq!(tree.object_count(), i as u64 + 1);
    }
}

#[test]
fn range_query_matches_linear_scan_oracle() {
    let mut rng = StdRng::seed_from_u64(11);
    let points = random_points(&mut rng, 120, 3, 20.0);
    let (_tmp, mut tree) = build_tree(384, SlimOptions::default(), &points);
    for radius in [0.0, 3.0, 10.0, 45.0] {
        for _ in 0..10 {
            let sample = point(
                9999,
                &[
                    rng.gen_range(-20.0..20.0),
                    rng.gen_range(-20.0..20.0),
                    rng.gen_range(-20.0..20.0),
                ],
            );
            let result = tree.range_query(&sample, radius).unwrap();
            let mut got: Vec<u32> = result
                .iter()
                .map(|p| p.object().oid().unwrap())
                .collect();
            got.sort_unstable();
            assert_eq!(got, oracle_range(&points, &sample, radius));
            // Ascending distance order and exact distances.
            let mut prev = 0.0;
            for pair in result.iter() {
                assert!(pair.distance() >= prev);
                prev = pair.distance();
                assert!((pair.distance() - l2(pair.object(), &sample)).abs() < 1e-9);
            }
        }
    }
}

#[test]
fn knn_matches_linear_scan_oracle() {
    let mut rng = StdRng::seed_from_u64(23);
    let points = random_points(&mut rng, 100, 2, 30.0);
    let (_tmp, mut tree) = build_tree(320, SlimOptions::default(), &points);
    for k in [1, 5, 17] {
        for _ in 0..10 {
            let sample = point(
                9999,
                &[rng.gen_range(-30.0..30.0), rng.gen_range(-30.0..30.0)],
            );
            let result = tree.nearest_query(&sample, k, false).unwrap();
            assert_eq!(result.len(), k);
            let mut oracle: Vec<f64> = points.iter().map(|p| l2(p, &sample)).collect();
            oracle.sort_by(f64::total_cmp);
            for (i, pair) in result.iter().enumerate() {
                assert!((pair.distance() - oracle[i]).abs() < 1e-9);
            }
        }
    }
}

#[test]
fn insert_then_zero_range_query_finds_the_object() {
    let mut rng = StdRng::seed_from_u64(31);
    let points = random_points(&mut rng, 50, 2, 10.0);
    let (_tmp, mut tree) = build_tree(256, SlimOptions::default(), &points);
    for p in &points {
        let r = tree.range_query(p, 0.0).unwrap();
        assert!(r.iter().any(|pair| pair.object() == p));
    }
}

#[test]
fn boundary_object_sizes() {
    let tmp = NamedTempFile::new().unwrap();
    let pager = DiskPageManager::create(tmp.path(), 256).unwrap();
    let mut tree =
        SlimTree::create(pager, EuclideanDistance::new(), SlimOptions::default()).unwrap();
    let max = tree.maximum_object_size();
    // A one-feature VectorObject costs 20 bytes plus the name.
    let exact = VectorObject::new(1, "n".repeat(max - 20), vec![0.5]);
    assert_eq!(exact.serialized_size(), max);
    tree.add(&exact).unwrap();
    let over = VectorObject::new(2, "n".repeat(max - 19), vec![0.5]);
    assert_eq!(over.serialized_size(), max + 1);
    assert!(tree.add(&over).is_err());
    assert_eq!(tree.object_count(), 1);
    tree.validate().unwrap();
}

#[test]
fn split_stress_on_four_object_pages() {
    // 20-byte objects, 12-byte leaf entries: a 160-byte page holds exactly
    // four objects per leaf.
    let points: Vec<VectorObject> = (0..17)
        .map(|i| VectorObject::new(i, "", vec![(i as f64 * 7.3) % 29.0]))
        .collect();
    assert_eq!(points[0].serialized_size(), 20);
    let tmp = NamedTempFile::new().unwrap();
    let pager = DiskPageManager::create(tmp.path(), 160).unwrap();
    let mut tree =
        SlimTree::create(pager, EuclideanDistance::new(), SlimOptions::default()).unwrap();
    for p in &points {
        tree.add(p).unwrap();
    }
    assert_eq!(tree.object_count(), 17);
    assert!(tree.height() >= 2);
    tree.validate().unwrap();
    // Every object is still reachable.
    for p in &points {
        let r = tree.range_query(p, 0.0).unwrap();
        assert!(r.iter().any(|pair| pair.object() == p));
    }
}

#[test]
fn knn_tie_handling_matches_oracle() {
    // Four points at distance 1 from the origin.
    let points = vec![
        point(0, &[0.0, 0.0]),
        point(1, &[1.0, 0.0]),
        point(2, &[-1.0, 0.0]),
        point(3, &[0.0, 1.0]),
        point(4, &[0.0, -1.0]),
        point(5, &[3.0, 3.0]),
    ];
    let (_tmp, mut tree) = build_tree(512, SlimOptions::default(), &points);
    let origin = point(9999, &[0.0, 0.0]);
    let strict = tree.nearest_query(&origin, 2, false).unwrap();
    assert_eq!(strict.len(), 2);
    let with_ties = tree.nearest_query(&origin, 2, true).unwrap();
    assert_eq!(with_ties.len(), 5);
    assert!(with_ties.iter().skip(1).all(|p| p.distance() == 1.0));
}

#[test]
fn weight_toggle_matches_oracle() {
    let mut rng = StdRng::seed_from_u64(43);
    let tmp = NamedTempFile::new().unwrap();
    let pager = DiskPageManager::create(tmp.path(), 192).unwrap();
    let mut tree: SlimTree<VectorObject, _> = SlimTree::create(
        pager,
        WeightedEuclideanDistance::new(),
        SlimOptions::default(),
    )
    .unwrap();
    let points = random_points(&mut rng, 10, 3, 9.0);
    for p in &points {
        tree.add(p).unwrap();
    }
    tree.metric_mut().set_weights(vec![1.0, 0.0, 0.0]).unwrap();
    let r = tree
        .nearest_query(&point(9999, &[0.0, 0.0, 0.0]), 1, false)
        .unwrap();
    let best = points
        .iter()
        .min_by(|a, b| a.features()[0].abs().total_cmp(&b.features()[0].abs()))
        .unwrap();
    assert_eq!(r.pair(0).object().oid(), best.oid());
    assert!((r.pair(0).distance() - best.features()[0].abs()).abs() < 1e-12);
}

#[test]
fn persistence_across_reopen() {
    let mut rng = StdRng::seed_from_u64(57);
    let points = random_points(&mut rng, 300, 3, 40.0);
    let samples: Vec<VectorObject> = (0..10)
        .map(|i| {
            point(
                10_000 + i,
                &[
                    rng.gen_range(-40.0..40.0),
                    rng.gen_range(-40.0..40.0),
                    rng.gen_range(-40.0..40.0),
                ],
            )
        })
        .collect();

    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    let mut before = Vec::new();
    {
        let pager = DiskPageManager::create(&path, 512).unwrap();
        let options = SlimOptions {
            choose_method: ChooseMethod::MinDist,
            split_method: SplitMethod::SpanningTree,
        };
        let mut tree: SlimTree<VectorObject, _> =
            SlimTree::create(pager, EuclideanDistance::new(), options).unwrap();
        for p in &points {
            tree.add(p).unwrap();
        }
        tree.validate().unwrap();
        for s in &samples {
            let r = tree.nearest_query(s, 5, false).unwrap();
            before.push(
                r.iter()
                    .map(|p| (p.object().oid().unwrap(), p.distance()))
                    .collect::<Vec<_>>(),
            );
        }
        tree.flush().unwrap();
    }

    let pager = DiskPageManager::open(&path).unwrap();
    let mut tree: SlimTree<VectorObject, _> =
        SlimTree::open(pager, EuclideanDistance::new()).unwrap();
    assert_eq!(tree.object_count(), 300);
    tree.validate().unwrap();
    for (s, expected) in samples.iter().zip(&before) {
        let r = tree.nearest_query(s, 5, false).unwrap();
        let got: Vec<(u32, f64)> = r
            .iter()
            .map(|p| (p.object().oid().unwrap(), p.distance()))
            .collect();
        assert_eq!(&got, expected);
    }
}

#[test]
fn slim_down_preserves_query_results() {
    let mut rng = StdRng::seed_from_u64(71);
    let points = random_points(&mut rng, 80, 2, 25.0);
    let (_tmp, mut tree) = build_tree(256, SlimOptions::default(), &points);
    let sample = point(9999, &[1.0, -2.0]);
    let before = oracle_range(&points, &sample, 12.0);
    tree.slim_down().unwrap();
    tree.validate().unwrap();
    let result = tree.range_query(&sample, 12.0).unwrap();
    let mut got: Vec<u32> = result.iter().map(|p| p.object().oid().unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, before);
}
