//! Path finding over the liquidity mesh
//!
//! - [`entropy`]: Shannon entropy of a node's outgoing liquidity, capped
//!   into a volatility penalty
//! - [`mesh`]: node/edge records and the [`MeshStore`] query adapter
//! - [`scoring`]: the Heuristic Settlement Score used as edge weight
//! - [`path_finder`]: hop-bounded K-shortest paths (Yen) over healthy,
//!   active nodes

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod entropy;
pub mod error;
pub mod mesh;
pub mod path_finder;
pub mod scoring;

pub use entropy::{normalized_entropy, shannon_entropy, volatility, Distribution};
pub use error::{Error, Result};
pub use mesh::{Edge, EdgeId, EdgeUpdate, InMemoryMesh, MeshSnapshot, MeshStore, Node, NodeType};
pub use path_finder::{CandidatePath, PathFinder, PathHop, PathQuery};
pub use scoring::ScoringWeights;

/// Upper bound on candidate paths returned by one search
pub const MAX_CANDIDATE_PATHS: usize = 10;

/// Default hop bound for a search
pub const DEFAULT_MAX_HOPS: usize = 4;
