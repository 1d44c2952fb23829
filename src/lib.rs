//! SlimDB — a disk-backed dynamic metric index (Slim-Tree family) for
//! similarity search over user-defined objects and metrics.

pub mod config;
pub mod distance;
pub mod error;
pub mod object;
pub mod result;
pub mod storage;
pub mod tree;

// re export for convenience.
pub use config::Config;
pub use distance::{
    DistanceFunction, EuclideanDistance, ManhattanDistance, WeightedEuclideanDistance,
};
pub use error::{Error, Result};
pub use object::{FeatureVector, Object, VectorObject};
pub use result::{QueryKind, QueryResult, ResultPair};
pub use storage::{DiskPageManager, Page};
pub use tree::{ChooseMethod, SlimOptions, SlimTree, SplitMethod};
