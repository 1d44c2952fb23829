//! Slim-Tree: a paged, disk-backed dynamic metric index. Objects are
//! stored in leaf pages under a representative per node; index entries
//! carry a covering radius used for triangle-inequality pruning during
//! range and nearest-neighbour queries.

mod query;
mod split;

use std::marker::PhantomData;

use serde::Deserialize;

use crate::distance::DistanceFunction;
use crate::error::{Error, Result};
use crate::object::Object;
use crate::storage::{
    node_kind, DiskPageManager, IndexNode, LeafNode, MemoryLeafNode, NodeKind, Page,
    INDEX_ENTRY_LEN, LEAF_ENTRY_LEN, NODE_HEADER_LEN,
};

use split::{split_groups, DistanceMatrix};

/// Family magic stored in the header page.
pub const TREE_MAGIC: [u8; 4] = *b"SL-7";

const HEADER_OFFSET_MAGIC: usize = 0;
const HEADER_OFFSET_HEIGHT: usize = 4;
const HEADER_OFFSET_OBJECT_COUNT: usize = 8;
const HEADER_OFFSET_NODE_COUNT: usize = 16;
const HEADER_OFFSET_ROOT: usize = 20;
const HEADER_OFFSET_CHOOSE: usize = 24;
const HEADER_OFFSET_SPLIT: usize = 25;

/// Subtree selection policy during insertion descent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChooseMethod {
    /// Prefer the covering entry with the smallest distance; otherwise the
    /// entry whose radius needs the least enlargement.
    #[default]
    MinDist,
    /// Among covering entries prefer the emptiest subtree; fall back to
    /// minimum distance when none covers the object.
    MinOccup,
}

impl ChooseMethod {
    fn as_u8(self) -> u8 {
        match self {
            ChooseMethod::MinDist => 0,
            ChooseMethod::MinOccup => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ChooseMethod::MinDist),
            1 => Ok(ChooseMethod::MinOccup),
            other => Err(Error::Format(format!("unknown choose policy {}", other))),
        }
    }
}

/// Representative selection policy for node splits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMethod {
    /// Two distinct entries drawn at random.
    Random,
    /// The pair minimizing the larger covering radius (O(n^3)).
    MinMax,
    /// Cut the heaviest edge of the minimum spanning tree and promote each
    /// component's minimax center.
    #[default]
    SpanningTree,
}

impl SplitMethod {
    fn as_u8(self) -> u8 {
        match self {
            SplitMethod::Random => 0,
            SplitMethod::MinMax => 1,
            SplitMethod::SpanningTree => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(SplitMethod::Random),
            1 => Ok(SplitMethod::MinMax),
            2 => Ok(SplitMethod::SpanningTree),
            other => Err(Error::Format(format!("unknown split policy {}", other))),
        }
    }
}

/// Construction-time policy choices; persisted in the header page.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlimOptions {
    pub choose_method: ChooseMethod,
    pub split_method: SplitMethod,
}

/// Persistent tree header (kept in the distinguished header page).
#[derive(Debug, Clone, Copy)]
struct TreeHeader {
    height: u32,
    object_count: u64,
    node_count: u32,
    root: u32,
    choose_method: ChooseMethod,
    split_method: SplitMethod,
}

impl TreeHeader {
    fn encode(&self, page: &mut Page) {
        let d = page.data_mut();
        d[HEADER_OFFSET_MAGIC..HEADER_OFFSET_MAGIC + 4].copy_from_slice(&TREE_MAGIC);
        d[HEADER_OFFSET_HEIGHT..HEADER_OFFSET_HEIGHT + 4]
            .copy_from_slice(&self.height.to_le_bytes());
        d[HEADER_OFFSET_OBJECT_COUNT..HEADER_OFFSET_OBJECT_COUNT + 8]
            .copy_from_slice(&self.object_count.to_le_bytes());
        d[HEADER_OFFSET_NODE_COUNT..HEADER_OFFSET_NODE_COUNT + 4]
            .copy_from_slice(&self.node_count.to_le_bytes());
        d[HEADER_OFFSET_ROOT..HEADER_OFFSET_ROOT + 4].copy_from_slice(&self.root.to_le_bytes());
        d[HEADER_OFFSET_CHOOSE] = self.choose_method.as_u8();
        d[HEADER_OFFSET_SPLIT] = self.split_method.as_u8();
    }

    fn decode(page: &Page) -> Result<Self> {
        let d = page.data();
        if d[HEADER_OFFSET_MAGIC..HEADER_OFFSET_MAGIC + 4] != TREE_MAGIC {
            return Err(Error::Format("bad tree magic".into()));
        }
        Ok(Self {
            height: u32::from_le_bytes(
                d[HEADER_OFFSET_HEIGHT..HEADER_OFFSET_HEIGHT + 4].try_into().unwrap(),
            ),
            object_count: u64::from_le_bytes(
                d[HEADER_OFFSET_OBJECT_COUNT..HEADER_OFFSET_OBJECT_COUNT + 8]
                    .try_into()
                    .unwrap(),
            ),
            node_count: u32::from_le_bytes(
                d[HEADER_OFFSET_NODE_COUNT..HEADER_OFFSET_NODE_COUNT + 4]
                    .try_into()
                    .unwrap(),
            ),
            root: u32::from_le_bytes(
                d[HEADER_OFFSET_ROOT..HEADER_OFFSET_ROOT + 4].try_into().unwrap(),
            ),
            choose_method: ChooseMethod::from_u8(d[HEADER_OFFSET_CHOOSE])?,
            split_method: SplitMethod::from_u8(d[HEADER_OFFSET_SPLIT])?,
        })
    }
}

/// Result of a recursive insert, reported to the parent level.
enum InsertOutcome<O> {
    /// The child absorbed the object and kept its representative; `radius`
    /// is its fresh covering radius.
    Updated { radius: f64 },
    /// The child re-anchored to a new representative.
    RepChanged { rep: O, radius: f64 },
    /// The child split in two.
    Promoted { left: Subtree<O>, right: Subtree<O> },
}

/// Everything a parent needs to reference a (possibly new) subtree.
struct Subtree<O> {
    page_id: u32,
    rep: O,
    radius: f64,
    object_count: u32,
}

/// An index entry lifted into memory for an index-node split.
struct IndexItem<O> {
    object: O,
    page_id: u32,
    radius: f64,
    n_entries: u32,
}

/// The Slim-Tree. Parameterized over the stored object type and the
/// metric; single-writer.
///
/// Changing the metric's weights after the tree was built invalidates the
/// stored distances and radii for pruning purposes. The tree snapshots the
/// metric's `weights_epoch` when constructed; while the epoch still
/// matches, queries prune with the triangle inequality, and after any
/// `set_weights` they fall back to full traversals, which keeps recall
/// exact at the cost of extra distance computations.
pub struct SlimTree<O, D> {
    pager: DiskPageManager,
    metric: D,
    header: TreeHeader,
    header_page: Page,
    header_dirty: bool,
    prune_epoch: u64,
    _object: PhantomData<O>,
}

impl<O: Object, D: DistanceFunction<O>> SlimTree<O, D> {
    /// Initialize a new tree on an empty page file.
    pub fn create(mut pager: DiskPageManager, metric: D, options: SlimOptions) -> Result<Self> {
        if !pager.is_empty() {
            return Err(Error::Format("page file already contains data".into()));
        }
        let mut header_page = pager.get_header_page()?;
        let header = TreeHeader {
            height: 0,
            object_count: 0,
            node_count: 0,
            root: 0,
            choose_method: options.choose_method,
            split_method: options.split_method,
        };
        header.encode(&mut header_page);
        pager.write_page(&header_page)?;
        tracing::info!(
            page_size = pager.page_size(),
            choose = ?options.choose_method,
            split = ?options.split_method,
            "created slim-tree"
        );
        let prune_epoch = metric.weights_epoch();
        Ok(Self {
            pager,
            metric,
            header,
            header_page,
            header_dirty: false,
            prune_epoch,
            _object: PhantomData,
        })
    }

    /// Load an existing tree, validating the header magic.
    pub fn open(mut pager: DiskPageManager, metric: D) -> Result<Self> {
        let header_page = pager.get_header_page()?;
        let header = TreeHeader::decode(&header_page)?;
        tracing::info!(
            objects = header.object_count,
            height = header.height,
            "opened slim-tree"
        );
        let prune_epoch = metric.weights_epoch();
        Ok(Self {
            pager,
            metric,
            header,
            header_page,
            header_dirty: false,
            prune_epoch,
            _object: PhantomData,
        })
    }

    /// Largest serialized object an empty leaf can hold.
    pub fn maximum_object_size(&self) -> usize {
        self.pager.min_page_size() - NODE_HEADER_LEN - LEAF_ENTRY_LEN
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn object_count(&self) -> u64 {
        self.header.object_count
    }

    pub fn node_count(&self) -> u32 {
        self.header.node_count
    }

    pub fn metric(&self) -> &D {
        &self.metric
    }

    /// Mutable access to the metric, e.g. to change weights between
    /// queries. See the type-level notes on what that does to pruning.
    pub fn metric_mut(&mut self) -> &mut D {
        &mut self.metric
    }

    pub fn pager(&self) -> &DiskPageManager {
        &self.pager
    }

    /// Distance evaluations since the last statistics reset.
    pub fn distance_count(&self) -> u64 {
        self.metric.distance_count()
    }

    /// Reset page-access and distance counters.
    pub fn reset_statistics(&mut self) {
        self.pager.reset_statistics();
        self.metric.reset_statistics();
    }

    /// Persist the header page and sync the page file.
    pub fn flush(&mut self) -> Result<()> {
        if self.header_dirty {
            self.header.encode(&mut self.header_page);
            self.pager.write_page(&self.header_page)?;
            self.header_dirty = false;
        }
        self.pager.flush()
    }

    /// Insert one object.
    pub fn add(&mut self, object: &O) -> Result<()> {
        let bytes = object.to_bytes();
        let max = self.maximum_object_size();
        if bytes.len() > max {
            return Err(Error::ObjectTooLarge {
                size: bytes.len(),
                max,
            });
        }

        if self.header.root == 0 {
            let mut page = self.pager.new_page()?;
            let root_id = page.id();
            let mut leaf = LeafNode::create(&mut page);
            if leaf.add_entry(&bytes, 0.0).is_none() {
                return Err(Error::Invariant("fresh leaf cannot hold the object".into()));
            }
            drop(leaf);
            self.pager.release_page(page, true)?;
            self.header.root = root_id;
            self.header.height = 1;
            self.header.node_count = 1;
            self.header.object_count = 1;
            self.header_dirty = true;
            return Ok(());
        }

        match self.insert_at(self.header.root, object, &bytes)? {
            InsertOutcome::Updated { .. } | InsertOutcome::RepChanged { .. } => {}
            InsertOutcome::Promoted { left, right } => {
                let d = self.metric.distance(&left.rep, &right.rep)?;
                let mut page = self.pager.new_page()?;
                let root_id = page.id();
                let mut node = IndexNode::create(&mut page);
                node.add_entry(
                    &left.rep.to_bytes(),
                    left.page_id,
                    0.0,
                    left.radius,
                    left.object_count,
                )
                .ok_or_else(|| Error::Invariant("new root cannot hold its entries".into()))?;
                node.add_entry(
                    &right.rep.to_bytes(),
                    right.page_id,
                    d,
                    right.radius,
                    right.object_count,
                )
                .ok_or_else(|| Error::Invariant("new root cannot hold its entries".into()))?;
                drop(node);
                self.pager.release_page(page, true)?;
                self.header.root = root_id;
                self.header.height += 1;
                self.header.node_count += 1;
                tracing::debug!(root = root_id, height = self.header.height, "root split");
            }
        }
        self.header.object_count += 1;
        self.header_dirty = true;
        Ok(())
    }

    fn insert_at(&mut self, page_id: u32, object: &O, bytes: &[u8]) -> Result<InsertOutcome<O>> {
        let page = self.pager.get_page(page_id)?;
        match node_kind(&page)? {
            NodeKind::Leaf => self.insert_into_leaf(page, object, bytes),
            NodeKind::Index => self.insert_into_index(page, object, bytes),
        }
    }

    fn insert_into_leaf(
        &mut self,
        mut page: Page,
        object: &O,
        bytes: &[u8],
    ) -> Result<InsertOutcome<O>> {
        let mut leaf = LeafNode::attach(&mut page)?;
        let rep = O::from_bytes(leaf.object(0))?;
        let d = self.metric.distance(&rep, object)?;
        if leaf.add_entry(bytes, d).is_some() {
            let radius = leaf.minimum_radius();
            drop(leaf);
            self.pager.release_page(page, true)?;
            return Ok(InsertOutcome::Updated { radius });
        }
        drop(leaf);
        let (left, right) = self.split_leaf(page, object.clone(), d)?;
        Ok(InsertOutcome::Promoted { left, right })
    }

    fn insert_into_index(
        &mut self,
        mut page: Page,
        object: &O,
        bytes: &[u8],
    ) -> Result<InsertOutcome<O>> {
        let mut node = IndexNode::attach(&mut page)?;
        let n = node.num_entries();
        if n == 0 {
            return Err(Error::Invariant(format!("index page {} is empty", page.id())));
        }
        let mut dists = Vec::with_capacity(n);
        for i in 0..n {
            let rep = O::from_bytes(node.object(i))?;
            dists.push(self.metric.distance(&rep, object)?);
        }
        let idx = match self.header.choose_method {
            ChooseMethod::MinDist => choose_min_dist(&node, &dists),
            ChooseMethod::MinOccup => choose_min_occup(&node, &dists),
        };
        let chosen = node.entry(idx);

        match self.insert_at(chosen.page_id, object, bytes)? {
            InsertOutcome::Updated { radius } => {
                node.set_radius(idx, radius);
                node.set_n_entries(idx, chosen.n_entries + 1);
                let radius = node.minimum_radius();
                drop(node);
                self.pager.release_page(page, true)?;
                Ok(InsertOutcome::Updated { radius })
            }
            InsertOutcome::RepChanged { rep, radius } => {
                drop(node);
                let pending = vec![Subtree {
                    page_id: chosen.page_id,
                    rep,
                    radius,
                    object_count: chosen.n_entries + 1,
                }];
                self.replace_child_entries(page, idx, pending)
            }
            InsertOutcome::Promoted { left, right } => {
                drop(node);
                self.replace_child_entries(page, idx, vec![left, right])
            }
        }
    }

    /// Swap the entry at `idx` for the pending subtree references,
    /// splitting this node when they do not fit. Re-anchors the node when
    /// the removed entry was its representative.
    fn replace_child_entries(
        &mut self,
        mut page: Page,
        idx: usize,
        pending: Vec<Subtree<O>>,
    ) -> Result<InsertOutcome<O>> {
        let page_id = page.id();
        let mut node = IndexNode::attach(&mut page)?;
        node.remove_entry(idx);

        let need: usize = pending
            .iter()
            .map(|p| INDEX_ENTRY_LEN + p.rep.serialized_size())
            .sum();
        if need > node.free_space() {
            let mut items = Vec::with_capacity(node.num_entries() + pending.len());
            for i in 0..node.num_entries() {
                let e = node.entry(i);
                items.push(IndexItem {
                    object: O::from_bytes(node.object(i))?,
                    page_id: e.page_id,
                    radius: e.radius,
                    n_entries: e.n_entries,
                });
            }
            for p in pending {
                items.push(IndexItem {
                    object: p.rep,
                    page_id: p.page_id,
                    radius: p.radius,
                    n_entries: p.object_count,
                });
            }
            drop(node);
            let (left, right) = self.split_index(page, items)?;
            return Ok(InsertOutcome::Promoted { left, right });
        }

        match node.representative_entry() {
            Some(rep_idx) => {
                let rep = O::from_bytes(node.object(rep_idx))?;
                for p in &pending {
                    let d = self.metric.distance(&rep, &p.rep)?;
                    node.add_entry(&p.rep.to_bytes(), p.page_id, d, p.radius, p.object_count)
                        .ok_or_else(|| {
                            Error::Invariant("index entry does not fit after size check".into())
                        })?;
                }
                let radius = node.minimum_radius();
                drop(node);
                self.pager.release_page(page, true)?;
                Ok(InsertOutcome::Updated { radius })
            }
            None => {
                // The removed entry anchored this node; re-anchor on the
                // first pending representative and recompute every
                // distance.
                let anchor = pending[0].rep.clone();
                let mut existing = Vec::with_capacity(node.num_entries());
                for i in 0..node.num_entries() {
                    let e = node.entry(i);
                    existing.push((
                        O::from_bytes(node.object(i))?,
                        e.page_id,
                        e.radius,
                        e.n_entries,
                    ));
                }
                node.remove_all();
                for (obj, pid, radius, count) in existing {
                    let d = self.metric.distance(&anchor, &obj)?;
                    node.add_entry(&obj.to_bytes(), pid, d, radius, count)
                        .ok_or_else(|| {
                            Error::Invariant("re-anchored entry does not fit".into())
                        })?;
                }
                for p in &pending {
                    let d = self.metric.distance(&anchor, &p.rep)?;
                    node.add_entry(&p.rep.to_bytes(), p.page_id, d, p.radius, p.object_count)
                        .ok_or_else(|| {
                            Error::Invariant("re-anchored entry does not fit".into())
                        })?;
                }
                let radius = node.minimum_radius();
                drop(node);
                self.pager.release_page(page, true)?;
                tracing::debug!(page = page_id, "index node re-anchored");
                Ok(InsertOutcome::RepChanged {
                    rep: anchor,
                    radius,
                })
            }
        }
    }

    fn split_leaf(
        &mut self,
        mut page: Page,
        object: O,
        distance: f64,
    ) -> Result<(Subtree<O>, Subtree<O>)> {
        let capacity = self.pager.page_size() - NODE_HEADER_LEN;
        let mut leaf = LeafNode::attach(&mut page)?;
        let mut staging: MemoryLeafNode<O> = MemoryLeafNode::from_leaf(&mut leaf, 2 * capacity)?;
        if !staging.add(object, distance) {
            return Err(Error::Invariant("split staging overflow".into()));
        }
        let n = staging.len();
        let mut matrix = DistanceMatrix::new(n);
        for i in 0..n {
            for j in i + 1..n {
                let d = self
                    .metric
                    .distance(staging.object_at(i), staging.object_at(j))?;
                matrix.set(i, j, d);
            }
        }
        let costs: Vec<usize> = (0..n).map(|i| staging.object_at(i).serialized_size()).collect();
        let g = split_groups(
            &matrix,
            &costs,
            capacity,
            LEAF_ENTRY_LEN,
            self.header.split_method,
        )?;

        // New (right) page first; the reused page is only rewritten once
        // the sibling is safely on disk.
        let mut rpage = self.pager.new_page()?;
        let mut rleaf = LeafNode::create(&mut rpage);
        for &i in &g.group2 {
            rleaf
                .add_entry(&staging.object_at(i).to_bytes(), matrix.get(i, g.rep2))
                .ok_or_else(|| Error::Invariant("split group does not fit its page".into()))?;
        }
        drop(rleaf);
        let right = Subtree {
            page_id: rpage.id(),
            rep: staging.object_at(g.rep2).clone(),
            radius: g.radius2,
            object_count: g.group2.len() as u32,
        };
        self.pager.release_page(rpage, true)?;

        for &i in &g.group1 {
            leaf.add_entry(&staging.object_at(i).to_bytes(), matrix.get(i, g.rep1))
                .ok_or_else(|| Error::Invariant("split group does not fit its page".into()))?;
        }
        drop(leaf);
        let left = Subtree {
            page_id: page.id(),
            rep: staging.object_at(g.rep1).clone(),
            radius: g.radius1,
            object_count: g.group1.len() as u32,
        };
        self.pager.release_page(page, true)?;
        self.header.node_count += 1;
        tracing::debug!(left = left.page_id, right = right.page_id, "leaf split");
        Ok((left, right))
    }

    fn split_index(
        &mut self,
        mut page: Page,
        items: Vec<IndexItem<O>>,
    ) -> Result<(Subtree<O>, Subtree<O>)> {
        let capacity = self.pager.page_size() - NODE_HEADER_LEN;
        let n = items.len();
        let mut matrix = DistanceMatrix::new(n);
        for i in 0..n {
            for j in i + 1..n {
                let d = self.metric.distance(&items[i].object, &items[j].object)?;
                matrix.set(i, j, d);
            }
        }
        let costs: Vec<usize> = items.iter().map(|it| it.object.serialized_size()).collect();
        let g = split_groups(
            &matrix,
            &costs,
            capacity,
            INDEX_ENTRY_LEN,
            self.header.split_method,
        )?;

        let covering = |group: &[usize], rep: usize| {
            group
                .iter()
                .map(|&i| matrix.get(i, rep) + items[i].radius)
                .fold(0.0, f64::max)
        };

        let mut rpage = self.pager.new_page()?;
        let mut rnode = IndexNode::create(&mut rpage);
        for &i in &g.group2 {
            rnode
                .add_entry(
                    &items[i].object.to_bytes(),
                    items[i].page_id,
                    matrix.get(i, g.rep2),
                    items[i].radius,
                    items[i].n_entries,
                )
                .ok_or_else(|| Error::Invariant("split group does not fit its page".into()))?;
        }
        drop(rnode);
        let right = Subtree {
            page_id: rpage.id(),
            rep: items[g.rep2].object.clone(),
            radius: covering(&g.group2, g.rep2),
            object_count: g.group2.iter().map(|&i| items[i].n_entries).sum(),
        };
        self.pager.release_page(rpage, true)?;

        let mut lnode = IndexNode::create(&mut page);
        for &i in &g.group1 {
            lnode
                .add_entry(
                    &items[i].object.to_bytes(),
                    items[i].page_id,
                    matrix.get(i, g.rep1),
                    items[i].radius,
                    items[i].n_entries,
                )
                .ok_or_else(|| Error::Invariant("split group does not fit its page".into()))?;
        }
        drop(lnode);
        let left = Subtree {
            page_id: page.id(),
            rep: items[g.rep1].object.clone(),
            radius: covering(&g.group1, g.rep1),
            object_count: g.group1.iter().map(|&i| items[i].n_entries).sum(),
        };
        self.pager.release_page(page, true)?;
        self.header.node_count += 1;
        tracing::debug!(left = left.page_id, right = right.page_id, "index split");
        Ok((left, right))
    }

    /// One Slim-Down pass: for every index node one level above the
    /// leaves, migrate each leaf's farthest entries to siblings whose
    /// representative covers them strictly closer, then shrink the parent
    /// radii. Returns the number of migrated entries.
    pub fn slim_down(&mut self) -> Result<usize> {
        if self.header.root == 0 || self.header.height < 2 {
            return Ok(0);
        }
        let moved = self.slim_down_from(self.header.root)?;
        if moved > 0 {
            tracing::debug!(moved, "slim-down migrated entries");
        }
        Ok(moved)
    }

    fn slim_down_from(&mut self, page_id: u32) -> Result<usize> {
        let mut page = self.pager.get_page(page_id)?;
        let node = IndexNode::attach(&mut page)?;
        let entries: Vec<_> = (0..node.num_entries()).map(|i| node.entry(i)).collect();
        drop(node);

        let first = self.pager.get_page(entries[0].page_id)?;
        let children_kind = node_kind(&first)?;
        self.pager.release_page(first, false)?;

        if children_kind == NodeKind::Index {
            self.pager.release_page(page, false)?;
            let mut moved = 0;
            for e in &entries {
                moved += self.slim_down_from(e.page_id)?;
            }
            return Ok(moved);
        }

        let m = entries.len();
        let capacity = self.pager.page_size() - NODE_HEADER_LEN;
        let mut pages = Vec::with_capacity(m);
        let mut mems: Vec<MemoryLeafNode<O>> = Vec::with_capacity(m);
        for e in &entries {
            let mut cpage = self.pager.get_page(e.page_id)?;
            let mut leaf = LeafNode::attach(&mut cpage)?;
            mems.push(MemoryLeafNode::from_leaf(&mut leaf, capacity)?);
            drop(leaf);
            pages.push(cpage);
        }
        let reps: Vec<O> = mems
            .iter()
            .map(|mm| {
                mm.rep_object()
                    .cloned()
                    .ok_or_else(|| Error::Invariant("empty leaf during slim-down".into()))
            })
            .collect::<Result<_>>()?;

        let mut moved = 0usize;
        let mut changed = vec![false; m];
        for _ in 0..2 * m + 2 {
            let mut pass_moves = 0usize;
            for i in 0..m {
                if mems[i].len() <= 1 {
                    continue;
                }
                let candidate = mems[i].last_object().unwrap().clone();
                let d_last = mems[i].minimum_radius();
                let mut best: Option<(usize, f64)> = None;
                for j in 0..m {
                    if j == i {
                        continue;
                    }
                    let d = self.metric.distance(&reps[j], &candidate)?;
                    if d < d_last
                        && d <= mems[j].minimum_radius()
                        && mems[j].can_add(&candidate)
                        && best.map_or(true, |(_, bd)| d < bd)
                    {
                        best = Some((j, d));
                    }
                }
                if let Some((j, d)) = best {
                    let (obj, _) = mems[i].pop_last().unwrap();
                    mems[j].add(obj, d);
                    changed[i] = true;
                    changed[j] = true;
                    pass_moves += 1;
                }
            }
            if pass_moves == 0 {
                break;
            }
            moved += pass_moves;
        }

        let stats: Vec<(f64, u32)> = mems
            .iter()
            .map(|mm| (mm.minimum_radius(), mm.len() as u32))
            .collect();
        for ((mut cpage, mm), &was_changed) in
            pages.into_iter().zip(mems).zip(changed.iter())
        {
            if was_changed {
                let mut leaf = LeafNode::attach(&mut cpage)?;
                mm.release_into(&mut leaf)?;
                drop(leaf);
                self.pager.release_page(cpage, true)?;
            } else {
                self.pager.release_page(cpage, false)?;
            }
        }

        let any_change = changed.iter().any(|&c| c);
        let mut node = IndexNode::attach(&mut page)?;
        for (i, &(radius, len)) in stats.iter().enumerate() {
            if changed[i] {
                node.set_radius(i, radius);
                node.set_n_entries(i, len);
            }
        }
        drop(node);
        self.pager.release_page(page, any_change)?;
        Ok(moved)
    }

    /// Walk the whole tree checking the structural invariants: exact
    /// stored distances, covering radii, ascending entry order, anchored
    /// representatives, subtree counts and header bookkeeping.
    pub fn validate(&mut self) -> Result<()> {
        if self.header.root == 0 {
            if self.header.object_count != 0 {
                return Err(Error::Invariant(
                    "no root but a non-zero object count".into(),
                ));
            }
            return Ok(());
        }
        if self.header.object_count == 0 {
            return Err(Error::Invariant("root set on an empty tree".into()));
        }
        let info = self.validate_node(self.header.root, None)?;
        if info.objects.len() as u64 != self.header.object_count {
            return Err(Error::Invariant(format!(
                "header counts {} objects, tree holds {}",
                self.header.object_count,
                info.objects.len()
            )));
        }
        if info.nodes != self.header.node_count {
            return Err(Error::Invariant(format!(
                "header counts {} nodes, tree holds {}",
                self.header.node_count, info.nodes
            )));
        }
        if info.min_depth != info.max_depth || info.max_depth != self.header.height {
            return Err(Error::Invariant(format!(
                "leaf depths {}..{} disagree with height {}",
                info.min_depth, info.max_depth, self.header.height
            )));
        }
        Ok(())
    }

    fn validate_node(
        &mut self,
        page_id: u32,
        parent: Option<(O, f64)>,
    ) -> Result<ValidationInfo<O>> {
        let mut page = self.pager.get_page(page_id)?;
        let info = match node_kind(&page)? {
            NodeKind::Leaf => {
                let leaf = LeafNode::attach(&mut page)?;
                let n = leaf.num_entries();
                if n == 0 {
                    return Err(Error::Invariant(format!("leaf {} is empty", page_id)));
                }
                if leaf.entry(0).distance != 0.0 {
                    return Err(Error::Invariant(format!(
                        "leaf {} has no anchored representative",
                        page_id
                    )));
                }
                let rep = O::from_bytes(leaf.object(0))?;
                let mut objects = Vec::with_capacity(n);
                let mut prev = 0.0;
                for i in 0..n {
                    let e = leaf.entry(i);
                    if e.distance < prev {
                        return Err(Error::Invariant(format!(
                            "leaf {} entries out of distance order",
                            page_id
                        )));
                    }
                    prev = e.distance;
                    let obj = O::from_bytes(leaf.object(i))?;
                    let d = self.metric.distance(&rep, &obj)?;
                    if !approx_eq(d, e.distance) {
                        return Err(Error::Invariant(format!(
                            "leaf {} entry {} stores distance {} but metric says {}",
                            page_id, i, e.distance, d
                        )));
                    }
                    objects.push(obj);
                }
                ValidationInfo {
                    objects,
                    rep,
                    nodes: 1,
                    min_depth: 1,
                    max_depth: 1,
                }
            }
            NodeKind::Index => {
                let node = IndexNode::attach(&mut page)?;
                let n = node.num_entries();
                if n == 0 {
                    return Err(Error::Invariant(format!("index {} is empty", page_id)));
                }
                if node.entry(0).distance != 0.0 {
                    return Err(Error::Invariant(format!(
                        "index {} has no anchored representative",
                        page_id
                    )));
                }
                let rep = O::from_bytes(node.object(0))?;
                let mut children = Vec::with_capacity(n);
                let mut prev = 0.0;
                for i in 0..n {
                    let e = node.entry(i);
                    if e.distance < prev {
                        return Err(Error::Invariant(format!(
                            "index {} entries out of distance order",
                            page_id
                        )));
                    }
                    prev = e.distance;
                    let obj = O::from_bytes(node.object(i))?;
                    let d = self.metric.distance(&rep, &obj)?;
                    if !approx_eq(d, e.distance) {
                        return Err(Error::Invariant(format!(
                            "index {} entry {} stores distance {} but metric says {}",
                            page_id, i, e.distance, d
                        )));
                    }
                    children.push((obj, e));
                }
                drop(node);
                self.pager.release_page(page, false)?;

                let mut objects = Vec::new();
                let mut nodes = 1;
                let mut min_depth = u32::MAX;
                let mut max_depth = 0;
                for (obj, e) in children {
                    let child =
                        self.validate_node(e.page_id, Some((obj.clone(), e.radius)))?;
                    if child.objects.len() as u32 != e.n_entries {
                        return Err(Error::Invariant(format!(
                            "index {} counts {} objects under page {}, found {}",
                            page_id,
                            e.n_entries,
                            e.page_id,
                            child.objects.len()
                        )));
                    }
                    nodes += child.nodes;
                    min_depth = min_depth.min(child.min_depth + 1);
                    max_depth = max_depth.max(child.max_depth + 1);
                    objects.extend(child.objects);
                }
                return self.check_parent_bound(
                    parent,
                    ValidationInfo {
                        objects,
                        rep,
                        nodes,
                        min_depth,
                        max_depth,
                    },
                );
            }
        };
        self.pager.release_page(page, false)?;
        self.check_parent_bound(parent, info)
    }

    fn check_parent_bound(
        &mut self,
        parent: Option<(O, f64)>,
        info: ValidationInfo<O>,
    ) -> Result<ValidationInfo<O>> {
        if let Some((pobj, pradius)) = parent {
            if pobj != info.rep {
                return Err(Error::Invariant(
                    "child representative differs from its parent entry".into(),
                ));
            }
            for obj in &info.objects {
                let d = self.metric.distance(&pobj, obj)?;
                if d > pradius && !approx_eq(d, pradius) {
                    return Err(Error::Invariant(format!(
                        "object at distance {} escapes covering radius {}",
                        d, pradius
                    )));
                }
            }
        }
        Ok(info)
    }
}

struct ValidationInfo<O> {
    objects: Vec<O>,
    rep: O,
    nodes: u32,
    min_depth: u32,
    max_depth: u32,
}

impl<O, D> Drop for SlimTree<O, D> {
    fn drop(&mut self) {
        if self.header_dirty {
            self.header.encode(&mut self.header_page);
            if let Err(e) = self.pager.write_page(&self.header_page) {
                tracing::warn!(error = %e, "failed to persist tree header on drop");
                return;
            }
            self.header_dirty = false;
        }
        if let Err(e) = self.pager.flush() {
            tracing::warn!(error = %e, "failed to sync page file on drop");
        }
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * f64::max(1.0, f64::max(a.abs(), b.abs()))
}

fn choose_min_dist(node: &IndexNode<'_>, dists: &[f64]) -> usize {
    let mut best = 0;
    let mut best_key = (f64::INFINITY, f64::INFINITY);
    for (i, &d) in dists.iter().enumerate() {
        let e = node.entry(i);
        let key = if d <= e.radius {
            (0.0, d)
        } else {
            (d - e.radius, d)
        };
        if key < best_key {
            best = i;
            best_key = key;
        }
    }
    best
}

fn choose_min_occup(node: &IndexNode<'_>, dists: &[f64]) -> usize {
    let mut best: Option<(usize, u32, f64)> = None;
    for (i, &d) in dists.iter().enumerate() {
        let e = node.entry(i);
        if d > e.radius {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, n, bd)) => e.n_entries < n || (e.n_entries == n && d < bd),
        };
        if better {
            best = Some((i, e.n_entries, d));
        }
    }
    match best {
        Some((i, _, _)) => i,
        None => choose_min_dist(node, dists),
    }
}
