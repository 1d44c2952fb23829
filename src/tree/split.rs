//! Split policies: pick two representatives for an overflowing node and
//! distribute the entries between them. Policies work on a precomputed
//! pairwise distance matrix so the metric is only consulted once per pair.

use rand::Rng;

use crate::error::{Error, Result};

use super::SplitMethod;

/// Symmetric pairwise distances between the n entries taking part in a
/// split (original entries plus the incoming one).
pub(crate) struct DistanceMatrix {
    n: usize,
    d: Vec<f64>,
}

impl DistanceMatrix {
    pub fn new(n: usize) -> Self {
        Self { n, d: vec![0.0; n * n] }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.d[i * self.n + j] = v;
        self.d[j * self.n + i] = v;
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.d[i * self.n + j]
    }
}

/// Outcome of a split decision: the two representatives and the member
/// lists, each sorted ascending by distance to its own representative
/// (representative first), plus the resulting covering radii.
pub(crate) struct Grouping {
    pub rep1: usize,
    pub rep2: usize,
    pub group1: Vec<usize>,
    pub group2: Vec<usize>,
    pub radius1: f64,
    pub radius2: f64,
}

/// Split the n entries behind `matrix` into two page-sized groups.
/// `costs[i]` is the serialized size of entry i's object; an entry charges
/// `entry_len + costs[i]` bytes against `capacity`.
pub(crate) fn split_groups(
    matrix: &DistanceMatrix,
    costs: &[usize],
    capacity: usize,
    entry_len: usize,
    method: SplitMethod,
) -> Result<Grouping> {
    let n = matrix.len();
    if n < 2 {
        return Err(Error::Invariant("cannot split fewer than two entries".into()));
    }
    match method {
        SplitMethod::Random => {
            let mut rng = rand::thread_rng();
            let rep1 = rng.gen_range(0..n);
            let mut rep2 = rng.gen_range(0..n - 1);
            if rep2 >= rep1 {
                rep2 += 1;
            }
            partition_by_reps(matrix, costs, capacity, entry_len, rep1, rep2)
        }
        SplitMethod::MinMax => min_max_groups(matrix, costs, capacity, entry_len),
        SplitMethod::SpanningTree => spanning_tree_groups(matrix, costs, capacity, entry_len),
    }
}

/// Assign every entry to the nearer representative, overflowing to the
/// other side when a page would not fit. Entries are considered in
/// ascending order of their distance to the closer representative, so the
/// tight assignments happen first.
fn partition_by_reps(
    matrix: &DistanceMatrix,
    costs: &[usize],
    capacity: usize,
    entry_len: usize,
    rep1: usize,
    rep2: usize,
) -> Result<Grouping> {
    let n = matrix.len();
    let mut group1 = vec![rep1];
    let mut group2 = vec![rep2];
    let mut used1 = entry_len + costs[rep1];
    let mut used2 = entry_len + costs[rep2];

    let mut order: Vec<usize> = (0..n).filter(|&i| i != rep1 && i != rep2).collect();
    order.sort_by(|&a, &b| {
        let ka = matrix.get(a, rep1).min(matrix.get(a, rep2));
        let kb = matrix.get(b, rep1).min(matrix.get(b, rep2));
        ka.total_cmp(&kb)
    });

    for i in order {
        let cost = entry_len + costs[i];
        let to_first = matrix.get(i, rep1) <= matrix.get(i, rep2);
        let fits1 = used1 + cost <= capacity;
        let fits2 = used2 + cost <= capacity;
        if (to_first && fits1) || (!to_first && !fits2 && fits1) {
            group1.push(i);
            used1 += cost;
        } else if fits2 {
            group2.push(i);
            used2 += cost;
        } else {
            return Err(Error::Invariant(
                "split entries do not fit in two pages".into(),
            ));
        }
    }

    Ok(finish(matrix, rep1, rep2, group1, group2))
}

fn finish(
    matrix: &DistanceMatrix,
    rep1: usize,
    rep2: usize,
    mut group1: Vec<usize>,
    mut group2: Vec<usize>,
) -> Grouping {
    group1.sort_by(|&a, &b| matrix.get(a, rep1).total_cmp(&matrix.get(b, rep1)));
    group2.sort_by(|&a, &b| matrix.get(a, rep2).total_cmp(&matrix.get(b, rep2)));
    let radius1 = group1
        .iter()
        .map(|&i| matrix.get(i, rep1))
        .fold(0.0, f64::max);
    let radius2 = group2
        .iter()
        .map(|&i| matrix.get(i, rep2))
        .fold(0.0, f64::max);
    Grouping {
        rep1,
        rep2,
        group1,
        group2,
        radius1,
        radius2,
    }
}

/// Try every representative pair and keep the one minimizing the larger
/// covering radius. O(n^3) on the node's entries.
fn min_max_groups(
    matrix: &DistanceMatrix,
    costs: &[usize],
    capacity: usize,
    entry_len: usize,
) -> Result<Grouping> {
    let n = matrix.len();
    let mut best: Option<Grouping> = None;
    for i in 0..n {
        for j in i + 1..n {
            let Ok(g) = partition_by_reps(matrix, costs, capacity, entry_len, i, j) else {
                continue;
            };
            let score = g.radius1.max(g.radius2);
            if best
                .as_ref()
                .map_or(true, |b| score < b.radius1.max(b.radius2))
            {
                best = Some(g);
            }
        }
    }
    best.ok_or_else(|| Error::Invariant("no representative pair fits two pages".into()))
}

/// Build the minimum spanning tree, drop the heaviest edge whose two
/// components both fit a page, and take each component's minimax center as
/// representative. Falls back to capacity-aware distribution around the
/// heaviest-edge centers when no edge yields a fitting cut.
fn spanning_tree_groups(
    matrix: &DistanceMatrix,
    costs: &[usize],
    capacity: usize,
    entry_len: usize,
) -> Result<Grouping> {
    let n = matrix.len();
    let edges = prim_edges(matrix);

    let mut order: Vec<usize> = (0..edges.len()).collect();
    order.sort_by(|&a, &b| edges[b].2.total_cmp(&edges[a].2));

    for &cut in &order {
        let (comp1, comp2) = components_without(&edges, cut, n);
        let fits = |comp: &[usize]| {
            comp.iter().map(|&i| entry_len + costs[i]).sum::<usize>() <= capacity
        };
        if fits(&comp1) && fits(&comp2) {
            let rep1 = minimax_center(matrix, &comp1);
            let rep2 = minimax_center(matrix, &comp2);
            return Ok(finish(matrix, rep1, rep2, comp1, comp2));
        }
    }

    // No cut fits as-is; keep the heaviest-edge centers and let the
    // distribution balance the bytes.
    let (comp1, comp2) = components_without(&edges, order[0], n);
    let rep1 = minimax_center(matrix, &comp1);
    let rep2 = minimax_center(matrix, &comp2);
    partition_by_reps(matrix, costs, capacity, entry_len, rep1, rep2)
}

/// Prim's algorithm over the complete graph; returns the n-1 tree edges.
fn prim_edges(matrix: &DistanceMatrix) -> Vec<(usize, usize, f64)> {
    let n = matrix.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n - 1);
    in_tree[0] = true;
    for i in 1..n {
        best[i] = matrix.get(0, i);
    }
    for _ in 1..n {
        let mut next = usize::MAX;
        for i in 0..n {
            if !in_tree[i] && (next == usize::MAX || best[i] < best[next]) {
                next = i;
            }
        }
        in_tree[next] = true;
        edges.push((from[next], next, best[next]));
        for i in 0..n {
            if !in_tree[i] && matrix.get(next, i) < best[i] {
                best[i] = matrix.get(next, i);
                from[i] = next;
            }
        }
    }
    edges
}

/// Connected components of the spanning tree with one edge removed.
fn components_without(
    edges: &[(usize, usize, f64)],
    cut: usize,
    n: usize,
) -> (Vec<usize>, Vec<usize>) {
    let mut adj = vec![Vec::new(); n];
    for (k, &(u, v, _)) in edges.iter().enumerate() {
        if k == cut {
            continue;
        }
        adj[u].push(v);
        adj[v].push(u);
    }
    let start = edges[cut].0;
    let mut seen = vec![false; n];
    let mut stack = vec![start];
    seen[start] = true;
    while let Some(u) = stack.pop() {
        for &v in &adj[u] {
            if !seen[v] {
                seen[v] = true;
                stack.push(v);
            }
        }
    }
    let mut comp1 = Vec::new();
    let mut comp2 = Vec::new();
    for i in 0..n {
        if seen[i] {
            comp1.push(i);
        } else {
            comp2.push(i);
        }
    }
    (comp1, comp2)
}

/// The member minimizing its maximum distance to the rest of the group.
fn minimax_center(matrix: &DistanceMatrix, comp: &[usize]) -> usize {
    let mut center = comp[0];
    let mut best = f64::INFINITY;
    for &i in comp {
        let worst = comp
            .iter()
            .map(|&j| matrix.get(i, j))
            .fold(0.0, f64::max);
        if worst < best {
            best = worst;
            center = i;
        }
    }
    center
}
