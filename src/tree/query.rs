//! Range and nearest-neighbour traversals. Both lean on the triangle
//! inequality twice: stored entry distances prune objects without
//! evaluating the metric, and index radii prune whole subtrees. Pruning is
//! suspended once the metric's weights diverge from the epoch the tree was
//! opened under (see the notes on `SlimTree`).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::distance::DistanceFunction;
use crate::error::Result;
use crate::object::Object;
use crate::result::QueryResult;
use crate::storage::{node_kind, IndexNode, LeafNode, NodeKind};

use super::SlimTree;

/// A subtree scheduled for a best-first kNN visit, ordered by the lower
/// bound of any distance inside it.
struct Candidate {
    lower_bound: f64,
    page_id: u32,
    rep_distance: Option<f64>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.lower_bound == other.lower_bound
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // BinaryHeap is a max-heap; reverse so the smallest bound pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.lower_bound.total_cmp(&self.lower_bound)
    }
}

impl<O: Object, D: DistanceFunction<O>> SlimTree<O, D> {
    /// All objects within `range` of `sample`, ascending by distance. An
    /// empty tree yields an empty result without touching a page.
    pub fn range_query(&mut self, sample: &O, range: f64) -> Result<QueryResult<O>> {
        let mut result = QueryResult::new_range(sample.clone(), range);
        if self.header.root == 0 {
            return Ok(result);
        }
        let prune = self.pruning_valid();
        self.range_visit(self.header.root, sample, range, None, prune, &mut result)?;
        Ok(result)
    }

    fn range_visit(
        &mut self,
        page_id: u32,
        sample: &O,
        range: f64,
        rep_distance: Option<f64>,
        prune: bool,
        result: &mut QueryResult<O>,
    ) -> Result<()> {
        let mut page = self.pager.get_page(page_id)?;
        match node_kind(&page)? {
            NodeKind::Leaf => {
                let leaf = LeafNode::attach(&mut page)?;
                let d_rep = match rep_distance {
                    Some(d) => d,
                    None => {
                        let rep = O::from_bytes(leaf.object(0))?;
                        self.metric.distance(&rep, sample)?
                    }
                };
                for i in 0..leaf.num_entries() {
                    let e = leaf.entry(i);
                    if prune && (d_rep - e.distance).abs() > range {
                        continue;
                    }
                    let obj = O::from_bytes(leaf.object(i))?;
                    let d = self.metric.distance(&obj, sample)?;
                    if d <= range {
                        result.add_pair(obj, d);
                    }
                }
            }
            NodeKind::Index => {
                let node = IndexNode::attach(&mut page)?;
                let d_rep = match rep_distance {
                    Some(d) => d,
                    None => {
                        let rep = O::from_bytes(node.object(0))?;
                        self.metric.distance(&rep, sample)?
                    }
                };
                let mut descents = Vec::new();
                for i in 0..node.num_entries() {
                    let e = node.entry(i);
                    if prune && (d_rep - e.distance).abs() - e.radius > range {
                        continue;
                    }
                    let rep = O::from_bytes(node.object(i))?;
                    let d = self.metric.distance(&rep, sample)?;
                    if prune && d - e.radius > range {
                        continue;
                    }
                    descents.push((e.page_id, d));
                }
                drop(node);
                self.pager.release_page(page, false)?;
                for (child, d) in descents {
                    self.range_visit(child, sample, range, Some(d), prune, result)?;
                }
                return Ok(());
            }
        }
        self.pager.release_page(page, false)?;
        Ok(())
    }

    /// The k objects nearest to `sample`. With `tie` set, objects tied
    /// with the k-th distance are included as well. Asking for more
    /// objects than the tree holds returns them all.
    pub fn nearest_query(&mut self, sample: &O, k: usize, tie: bool) -> Result<QueryResult<O>> {
        let mut result = QueryResult::new_knn(sample.clone(), k, tie);
        if self.header.root == 0 || k == 0 {
            return Ok(result);
        }
        let prune = self.pruning_valid();

        let mut queue = BinaryHeap::new();
        queue.push(Candidate {
            lower_bound: 0.0,
            page_id: self.header.root,
            rep_distance: None,
        });

        while let Some(candidate) = queue.pop() {
            if candidate.lower_bound > result.maximum_distance() {
                break;
            }
            let mut page = self.pager.get_page(candidate.page_id)?;
            match node_kind(&page)? {
                NodeKind::Leaf => {
                    let leaf = LeafNode::attach(&mut page)?;
                    let d_rep = match candidate.rep_distance {
                        Some(d) => d,
                        None => {
                            let rep = O::from_bytes(leaf.object(0))?;
                            self.metric.distance(&rep, sample)?
                        }
                    };
                    for i in 0..leaf.num_entries() {
                        let e = leaf.entry(i);
                        if prune && (d_rep - e.distance).abs() > result.maximum_distance() {
                            continue;
                        }
                        let obj = O::from_bytes(leaf.object(i))?;
                        let d = self.metric.distance(&obj, sample)?;
                        if d <= result.maximum_distance() {
                            result.add_pair(obj, d);
                            if result.len() >= k {
                                result.cut();
                            }
                        }
                    }
                }
                NodeKind::Index => {
                    let node = IndexNode::attach(&mut page)?;
                    let d_rep = match candidate.rep_distance {
                        Some(d) => d,
                        None => {
                            let rep = O::from_bytes(node.object(0))?;
                            self.metric.distance(&rep, sample)?
                        }
                    };
                    let tau = result.maximum_distance();
                    for i in 0..node.num_entries() {
                        let e = node.entry(i);
                        if prune && (d_rep - e.distance).abs() - e.radius > tau {
                            continue;
                        }
                        let rep = O::from_bytes(node.object(i))?;
                        let d = self.metric.distance(&rep, sample)?;
                        let lower_bound = if prune {
                            (d - e.radius).max(0.0)
                        } else {
                            0.0
                        };
                        if lower_bound <= tau {
                            queue.push(Candidate {
                                lower_bound,
                                page_id: e.page_id,
                                rep_distance: Some(d),
                            });
                        }
                    }
                }
            }
            self.pager.release_page(page, false)?;
        }
        Ok(result)
    }

    fn pruning_valid(&self) -> bool {
        self.metric.weights_epoch() == self.prune_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{EuclideanDistance, WeightedEuclideanDistance};
    use crate::object::VectorObject;
    use crate::result::QueryKind;
    use crate::storage::DiskPageManager;
    use crate::tree::SlimOptions;
    use tempfile::NamedTempFile;

    fn point(oid: u32, coords: &[f64]) -> VectorObject {
        VectorObject::new(oid, format!("p{}", oid), coords.to_vec())
    }

    fn grid_tree(
        page_size: usize,
    ) -> (NamedTempFile, SlimTree<VectorObject, EuclideanDistance>) {
        let tmp = NamedTempFile::new().unwrap();
        let pager = DiskPageManager::create(tmp.path(), page_size).unwrap();
        let mut tree =
            SlimTree::create(pager, EuclideanDistance::new(), SlimOptions::default()).unwrap();
        for (i, (x, y)) in [(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0), (10.0, 10.0)]
            .iter()
            .enumerate()
        {
            tree.add(&point(i as u32, &[*x, *y])).unwrap();
        }
        (tmp, tree)
    }

    #[test]
    fn range_query_returns_cluster_in_distance_order() {
        let (_tmp, mut tree) = grid_tree(512);
        let r = tree
            .range_query(&point(99, &[0.0, 0.0]), 1.5)
            .unwrap();
        assert_eq!(r.kind(), QueryKind::Range);
        assert_eq!(r.len(), 4);
        let distances: Vec<f64> = r.iter().map(|p| p.distance()).collect();
        assert_eq!(distances[0], 0.0);
        assert_eq!(distances[1], 1.0);
        assert_eq!(distances[2], 1.0);
        assert!((distances[3] - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn knn_returns_nearest_three() {
        let (_tmp, mut tree) = grid_tree(512);
        let r = tree
            .nearest_query(&point(99, &[0.1, 0.1]), 3, false)
            .unwrap();
        assert_eq!(r.len(), 3);
        assert!((r.pair(0).distance() - 0.1414213562).abs() < 1e-6);
        assert!((r.pair(1).distance() - 0.9055385138).abs() < 1e-6);
        assert!((r.pair(2).distance() - 0.9055385138).abs() < 1e-6);
    }

    #[test]
    fn knn_tie_inclusion() {
        let (_tmp, mut tree) = grid_tree(512);
        let r = tree
            .nearest_query(&point(99, &[0.0, 0.0]), 2, true)
            .unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(r.pair(0).distance(), 0.0);
        assert_eq!(r.pair(1).distance(), 1.0);
        assert_eq!(r.pair(2).distance(), 1.0);
    }

    #[test]
    fn empty_tree_queries_touch_no_pages() {
        let tmp = NamedTempFile::new().unwrap();
        let pager = DiskPageManager::create(tmp.path(), 256).unwrap();
        let mut tree =
            SlimTree::create(pager, EuclideanDistance::new(), SlimOptions::default()).unwrap();
        tree.reset_statistics();
        let r = tree.range_query(&point(0, &[1.0]), 5.0).unwrap();
        assert!(r.is_empty());
        let r = tree.nearest_query(&point(0, &[1.0]), 3, false).unwrap();
        assert!(r.is_empty());
        assert_eq!(tree.pager().read_count(), 0);
    }

    #[test]
    fn knn_with_k_beyond_population_returns_all() {
        let (_tmp, mut tree) = grid_tree(512);
        let r = tree
            .nearest_query(&point(99, &[0.0, 0.0]), 50, false)
            .unwrap();
        assert_eq!(r.len(), 5);
    }

    #[test]
    fn zero_radius_on_absent_sample_is_empty() {
        let (_tmp, mut tree) = grid_tree(512);
        let r = tree
            .range_query(&point(99, &[5.0, 5.0]), 0.0)
            .unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn distance_count_grows_with_queries() {
        let (_tmp, mut tree) = grid_tree(512);
        tree.reset_statistics();
        tree.range_query(&point(99, &[0.0, 0.0]), 1.0).unwrap();
        let after_range = tree.distance_count();
        assert!(after_range > 0);
        tree.nearest_query(&point(99, &[0.0, 0.0]), 2, false).unwrap();
        assert!(tree.distance_count() > after_range);
    }

    #[test]
    fn weight_change_disables_pruning_but_stays_exact() {
        let tmp = NamedTempFile::new().unwrap();
        let pager = DiskPageManager::create(tmp.path(), 192).unwrap();
        let mut tree = SlimTree::create(
            pager,
            WeightedEuclideanDistance::new(),
            SlimOptions::default(),
        )
        .unwrap();
        let coords: [[f64; 3]; 10] = [
            [4.0, 0.2, 9.1],
            [-3.0, 7.7, 0.4],
            [0.5, -6.2, 2.2],
            [8.8, 1.1, -4.0],
            [-0.2, 3.3, 5.5],
            [2.4, -9.0, 1.0],
            [-7.1, 0.6, 0.9],
            [6.0, 6.0, -6.0],
            [0.1, 0.1, 8.8],
            [-1.5, -2.5, -3.5],
        ];
        for (i, c) in coords.iter().enumerate() {
            tree.add(&point(i as u32, c)).unwrap();
        }
        tree.metric_mut().set_weights(vec![1.0, 0.0, 0.0]).unwrap();
        let r = tree
            .nearest_query(&point(99, &[0.0, 0.0, 0.0]), 1, false)
            .unwrap();
        // Smallest |x| wins under weights (1, 0, 0).
        let best = coords
            .iter()
            .enumerate()
            .min_by(|a, b| a.1[0].abs().total_cmp(&b.1[0].abs()))
            .unwrap()
            .0;
        assert_eq!(r.pair(0).object().oid(), Some(best as u32));
        assert!((r.pair(0).distance() - coords[best][0].abs()).abs() < 1e-12);
    }
}
