//! KGX Cluster - Density clustering and pair filtering
//!
//! The batch filter state machine lives here:
//! Raw -> ScoreFiltered -> (optional) Clustered -> PersistenceFiltered ->
//! ThresholdFiltered -> Final.
//!
//! Clustering is density-based over combined pair embeddings: mutual
//! reachability distances, a minimum spanning tree, and a condensed
//! single-linkage hierarchy with per-cluster persistence scores.

pub mod density;
pub mod filter;

pub use density::{cluster, cosine_distance_matrix, standardize, DensityParams};
pub use filter::{dedup_pairs, filter_by_cluster_persistence, FilterParams, PairFilter};
