//! Query results: (object, distance) pairs kept in ascending distance
//! order, with top-k trimming for nearest-neighbour queries.

/// What kind of query produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Range,
    Knn,
}

/// One qualifying object with its distance to the query sample.
#[derive(Debug, Clone)]
pub struct ResultPair<O> {
    object: O,
    distance: f64,
}

impl<O> ResultPair<O> {
    pub fn object(&self) -> &O {
        &self.object
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn into_object(self) -> O {
        self.object
    }
}

/// Ordered result collection plus the query descriptor that produced it.
#[derive(Debug, Clone)]
pub struct QueryResult<O> {
    pairs: Vec<ResultPair<O>>,
    sample: O,
    kind: QueryKind,
    k: usize,
    radius: f64,
    allow_ties: bool,
}

impl<O> QueryResult<O> {
    pub fn new_range(sample: O, radius: f64) -> Self {
        Self {
            pairs: Vec::new(),
            sample,
            kind: QueryKind::Range,
            k: 0,
            radius,
            allow_ties: false,
        }
    }

    pub fn new_knn(sample: O, k: usize, allow_ties: bool) -> Self {
        Self {
            pairs: Vec::new(),
            sample,
            kind: QueryKind::Knn,
            k,
            radius: f64::INFINITY,
            allow_ties,
        }
    }

    /// Insert keeping ascending distance order; equal distances keep
    /// arrival order.
    pub fn add_pair(&mut self, object: O, distance: f64) {
        let at = self.pairs.partition_point(|p| p.distance <= distance);
        self.pairs.insert(at, ResultPair { object, distance });
    }

    /// Trim to the first k pairs. With `allow_ties`, pairs tied with the
    /// k-th distance are kept as well.
    pub fn cut(&mut self) {
        if self.k == 0 || self.pairs.len() <= self.k {
            return;
        }
        if self.allow_ties {
            let kd = self.pairs[self.k - 1].distance;
            let end = self.pairs.partition_point(|p| p.distance <= kd);
            self.pairs.truncate(end);
        } else {
            self.pairs.truncate(self.k);
        }
    }

    /// Distance of the last kept pair, or +inf while fewer pairs than
    /// requested have been collected.
    pub fn maximum_distance(&self) -> f64 {
        match self.kind {
            QueryKind::Knn if self.pairs.len() < self.k => f64::INFINITY,
            _ => self.pairs.last().map_or(f64::INFINITY, |p| p.distance),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pair(&self, idx: usize) -> &ResultPair<O> {
        &self.pairs[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultPair<O>> {
        self.pairs.iter()
    }

    pub fn sample(&self) -> &O {
        &self.sample
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn allow_ties(&self) -> bool {
        self.allow_ties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_stay_sorted() {
        let mut r = QueryResult::new_range((), 10.0);
        r.add_pair((), 3.0);
        r.add_pair((), 1.0);
        r.add_pair((), 2.0);
        let distances: Vec<f64> = r.iter().map(|p| p.distance()).collect();
        assert_eq!(distances, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn cut_without_ties() {
        let mut r = QueryResult::new_knn((), 2, false);
        for d in [1.0, 1.0, 1.0, 0.5] {
            r.add_pair((), d);
        }
        r.cut();
        assert_eq!(r.len(), 2);
        assert_eq!(r.maximum_distance(), 1.0);
    }

    #[test]
    fn cut_keeps_ties() {
        let mut r = QueryResult::new_knn((), 2, true);
        for d in [0.0, 1.0, 1.0, 1.0, 2.0] {
            r.add_pair((), d);
        }
        r.cut();
        assert_eq!(r.len(), 4);
        assert_eq!(r.maximum_distance(), 1.0);
    }

    #[test]
    fn maximum_distance_is_infinite_until_filled() {
        let mut r: QueryResult<()> = QueryResult::new_knn((), 3, false);
        assert_eq!(r.maximum_distance(), f64::INFINITY);
        r.add_pair((), 1.0);
        r.add_pair((), 2.0);
        assert_eq!(r.maximum_distance(), f64::INFINITY);
        r.add_pair((), 3.0);
        assert_eq!(r.maximum_distance(), 3.0);
    }

    #[test]
    fn range_descriptor() {
        let r: QueryResult<()> = QueryResult::new_range((), 2.5);
        assert_eq!(r.kind(), QueryKind::Range);
        assert_eq!(r.radius(), 2.5);
        assert!(r.is_empty());
    }
}
