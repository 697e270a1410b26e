//! Density-based clustering
//!
//! A compact single-linkage variant of hierarchical density clustering:
//! core distances from the `min_samples`-th neighbor, mutual reachability
//! edges, a minimum spanning tree, and bottom-up component merging that
//! finalizes leaf clusters of at least `min_cluster_size` members. Points
//! that never join a finalized cluster are labeled noise (`-1`).
//!
//! Output is deterministic for a fixed distance matrix and parameters:
//! ties are broken by edge endpoint indices, never by randomness.

use std::collections::HashMap;

use ndarray::{Array2, Axis};
use petgraph::algo::min_spanning_tree;
use petgraph::data::FromElements;
use petgraph::graph::UnGraph;
use tracing::trace;

use kgx_core::{ClusterAssignment, KgxError, Result, NOISE_LABEL};

/// Guard against division by zero when converting distances to lambdas
const MIN_DISTANCE: f32 = 1e-6;

/// Clustering parameters
#[derive(Debug, Clone, Copy)]
pub struct DensityParams {
    /// Minimum members for a component to become a cluster
    pub min_cluster_size: usize,

    /// Neighbor count for core distances
    pub min_samples: usize,
}

/// Cluster a batch given its pairwise distance matrix.
///
/// The matrix must be square and symmetric; NaN entries mark it
/// degenerate and fail the batch.
pub fn cluster(distance: &Array2<f32>, params: &DensityParams) -> Result<ClusterAssignment> {
    let n = distance.nrows();
    if n == 0 || distance.ncols() != n {
        return Err(KgxError::Clustering(format!(
            "degenerate distance matrix: {}x{}",
            n,
            distance.ncols()
        )));
    }
    if distance.iter().any(|v| v.is_nan()) {
        return Err(KgxError::Clustering(
            "degenerate distance matrix: NaN entries".to_string(),
        ));
    }

    if n == 1 {
        return Ok(ClusterAssignment {
            labels: vec![NOISE_LABEL],
            persistence: HashMap::new(),
        });
    }

    let core = core_distances(distance, params.min_samples);
    let edges = mst_edges(distance, &core)?;

    Ok(condense(n, &edges, params.min_cluster_size))
}

/// Distance to each point's `min_samples`-th nearest neighbor
fn core_distances(distance: &Array2<f32>, min_samples: usize) -> Vec<f32> {
    let n = distance.nrows();
    let k = min_samples.min(n - 1).max(1);

    (0..n)
        .map(|i| {
            let mut row: Vec<f32> = (0..n).filter(|&j| j != i).map(|j| distance[[i, j]]).collect();
            row.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            row[k - 1]
        })
        .collect()
}

/// Minimum spanning tree over mutual reachability distances, sorted
/// ascending with index tie-breaks
fn mst_edges(distance: &Array2<f32>, core: &[f32]) -> Result<Vec<(usize, usize, f32)>> {
    let n = distance.nrows();

    let mut graph = UnGraph::<u32, f32>::new_undirected();
    let nodes: Vec<_> = (0..n).map(|i| graph.add_node(i as u32)).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            let reach = distance[[i, j]].max(core[i]).max(core[j]);
            graph.add_edge(nodes[i], nodes[j], reach);
        }
    }

    let mst: UnGraph<u32, f32> = UnGraph::from_elements(min_spanning_tree(&graph));

    let mut edges: Vec<(usize, usize, f32)> = mst
        .edge_indices()
        .filter_map(|e| {
            let (a, b) = mst.edge_endpoints(e)?;
            let (a, b) = (mst[a] as usize, mst[b] as usize);
            let (a, b) = if a <= b { (a, b) } else { (b, a) };
            Some((a, b, mst[e]))
        })
        .collect();

    if edges.len() != n - 1 {
        return Err(KgxError::Clustering(format!(
            "spanning tree has {} edges for {} points",
            edges.len(),
            n
        )));
    }

    edges.sort_by(|x, y| {
        x.2.partial_cmp(&y.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(x.0.cmp(&y.0))
            .then(x.1.cmp(&y.1))
    });

    Ok(edges)
}

/// Union-find component state during condensation
struct Component {
    parent: Vec<usize>,
    size: Vec<usize>,
    /// Cluster id once a component's members are finalized
    finalized: Vec<bool>,
}

impl Component {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
            finalized: vec![false; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }
}

/// Bottom-up merge pass over ascending MST edges.
///
/// A component whose size first reaches `min_cluster_size` is a cluster
/// candidate. When two candidates meet, each is finalized as a leaf
/// cluster; the merged component can never become a cluster itself, which
/// realizes leaf-first cluster selection.
fn condense(n: usize, edges: &[(usize, usize, f32)], min_cluster_size: usize) -> ClusterAssignment {
    let mut uf = Component::new(n);

    // Members per live component root
    let mut members: HashMap<usize, Vec<usize>> = (0..n).map(|i| (i, vec![i])).collect();
    // Lambda at which each point first merged with anything
    let mut join_lambda = vec![f32::INFINITY; n];

    let mut labels = vec![NOISE_LABEL; n];
    let mut persistence: HashMap<i32, f32> = HashMap::new();
    let mut next_cluster: i32 = 0;

    for &(a, b, w) in edges {
        let lambda = 1.0 / w.max(MIN_DISTANCE);

        let ra = uf.find(a);
        let rb = uf.find(b);
        if ra == rb {
            continue;
        }

        // Record first-merge lambda for any singleton side
        if uf.size[ra] == 1 {
            let point = members[&ra][0];
            join_lambda[point] = lambda;
        }
        if uf.size[rb] == 1 {
            let point = members[&rb][0];
            join_lambda[point] = lambda;
        }

        let a_candidate = uf.size[ra] >= min_cluster_size && !uf.finalized[ra];
        let b_candidate = uf.size[rb] >= min_cluster_size && !uf.finalized[rb];
        let any_finalized = uf.finalized[ra] || uf.finalized[rb];

        if (a_candidate && b_candidate) || (any_finalized && (a_candidate || b_candidate)) {
            // Two dense components meet: each unfinalized candidate dies
            // here as a leaf cluster
            if a_candidate {
                finalize_cluster(
                    ra,
                    &mut members,
                    &mut labels,
                    &mut persistence,
                    &mut next_cluster,
                    &join_lambda,
                    lambda,
                );
            }
            if b_candidate {
                finalize_cluster(
                    rb,
                    &mut members,
                    &mut labels,
                    &mut persistence,
                    &mut next_cluster,
                    &join_lambda,
                    lambda,
                );
            }
        }

        // Union (by size)
        let (big, small) = if uf.size[ra] >= uf.size[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        uf.parent[small] = big;
        uf.size[big] += uf.size[small];
        uf.finalized[big] = uf.finalized[big]
            || uf.finalized[small]
            || (a_candidate && b_candidate)
            || (any_finalized && (a_candidate || b_candidate));

        let small_members = members.remove(&small).unwrap_or_default();
        members.entry(big).or_default().extend(small_members);
    }

    // Whatever survives to the root unfinalized and dense enough is the
    // final cluster of the sweep
    let root = uf.find(0);
    if !uf.finalized[root] && uf.size[root] >= min_cluster_size {
        finalize_cluster(
            root,
            &mut members,
            &mut labels,
            &mut persistence,
            &mut next_cluster,
            &join_lambda,
            0.0,
        );
    }

    trace!(clusters = next_cluster, points = n, "condensed hierarchy");

    ClusterAssignment {
        labels,
        persistence,
    }
}

/// Assign a fresh cluster id to a dying component's members and record
/// its persistence: the mean normalized gap between each member's join
/// lambda and the component's death lambda.
fn finalize_cluster(
    root: usize,
    members: &mut HashMap<usize, Vec<usize>>,
    labels: &mut [i32],
    persistence: &mut HashMap<i32, f32>,
    next_cluster: &mut i32,
    join_lambda: &[f32],
    death_lambda: f32,
) {
    let member_list = members.remove(&root).unwrap_or_default();
    if member_list.is_empty() {
        return;
    }

    let mut score = 0.0f32;
    for &p in &member_list {
        let lambda = join_lambda[p];
        if lambda.is_finite() && lambda > 0.0 {
            score += 1.0 - (death_lambda / lambda).min(1.0);
        } else {
            score += 1.0;
        }
        labels[p] = *next_cluster;
    }

    persistence.insert(*next_cluster, score / member_list.len() as f32);
    *next_cluster += 1;
}

// ============================================================================
// Matrix helpers
// ============================================================================

/// Standardize columns in place to zero mean and unit variance.
///
/// Constant columns are centered only.
pub fn standardize(matrix: &mut Array2<f32>) {
    let n = matrix.nrows();
    if n == 0 {
        return;
    }

    for mut column in matrix.columns_mut() {
        let mean = column.sum() / n as f32;
        let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n as f32;
        let std = var.sqrt();

        for value in column.iter_mut() {
            *value -= mean;
            if std > f32::EPSILON {
                *value /= std;
            }
        }
    }
}

/// Pairwise cosine distance matrix over row vectors.
///
/// Zero-norm rows are treated as maximally distant from everything but
/// themselves.
pub fn cosine_distance_matrix(matrix: &Array2<f32>) -> Array2<f32> {
    let n = matrix.nrows();
    let norms: Vec<f32> = matrix
        .axis_iter(Axis(0))
        .map(|row| row.dot(&row).sqrt())
        .collect();

    let mut distance = Array2::<f32>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = if norms[i] <= f32::EPSILON || norms[j] <= f32::EPSILON {
                1.0
            } else {
                let cos = matrix.row(i).dot(&matrix.row(j)) / (norms[i] * norms[j]);
                (1.0 - cos.clamp(-1.0, 1.0)).max(0.0)
            };
            distance[[i, j]] = d;
            distance[[j, i]] = d;
        }
    }

    distance
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn params(min_cluster_size: usize, min_samples: usize) -> DensityParams {
        DensityParams {
            min_cluster_size,
            min_samples,
        }
    }

    /// Two tight groups far apart, plus one outlier
    fn grouped_distance() -> Array2<f32> {
        let points: Vec<[f32; 2]> = vec![
            [0.0, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.0],
            [10.0, 10.1],
            [50.0, -50.0],
        ];

        let n = points.len();
        let mut distance = Array2::<f32>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                let dx = points[i][0] - points[j][0];
                let dy = points[i][1] - points[j][1];
                distance[[i, j]] = (dx * dx + dy * dy).sqrt();
            }
        }
        distance
    }

    #[test]
    fn test_two_groups_found() {
        let assignment = cluster(&grouped_distance(), &params(2, 2)).unwrap();

        // First three points share a label, next three share another
        assert_eq!(assignment.labels[0], assignment.labels[1]);
        assert_eq!(assignment.labels[1], assignment.labels[2]);
        assert_eq!(assignment.labels[3], assignment.labels[4]);
        assert_eq!(assignment.labels[4], assignment.labels[5]);
        assert_ne!(assignment.labels[0], assignment.labels[3]);

        // The outlier is noise
        assert_eq!(assignment.labels[6], NOISE_LABEL);
    }

    #[test]
    fn test_persistence_reported_per_cluster() {
        let assignment = cluster(&grouped_distance(), &params(2, 2)).unwrap();

        for id in assignment.cluster_ids() {
            let p = assignment.persistence_of(id);
            assert!((0.0..=1.0).contains(&p), "persistence {p} out of range");
        }
    }

    #[test]
    fn test_clustering_is_deterministic() {
        let distance = grouped_distance();
        let a = cluster(&distance, &params(2, 2)).unwrap();
        let b = cluster(&distance, &params(2, 2)).unwrap();

        assert_eq!(a.labels, b.labels);
        for id in a.cluster_ids() {
            assert_eq!(a.persistence_of(id), b.persistence_of(id));
        }
    }

    #[test]
    fn test_min_cluster_size_promotes_noise() {
        // min_cluster_size larger than any group: everything is noise or
        // one root cluster
        let assignment = cluster(&grouped_distance(), &params(7, 2)).unwrap();
        let non_noise: Vec<i32> = assignment
            .labels
            .iter()
            .copied()
            .filter(|&l| l != NOISE_LABEL)
            .collect();

        // The root component holds all seven points
        assert!(non_noise.is_empty() || non_noise.len() == 7);
    }

    #[test]
    fn test_nan_matrix_rejected() {
        let mut distance = grouped_distance();
        distance[[0, 1]] = f32::NAN;
        assert!(cluster(&distance, &params(2, 2)).is_err());
    }

    #[test]
    fn test_single_point_is_noise() {
        let distance = Array2::<f32>::zeros((1, 1));
        let assignment = cluster(&distance, &params(2, 2)).unwrap();
        assert_eq!(assignment.labels, vec![NOISE_LABEL]);
    }

    #[test]
    fn test_empty_matrix_rejected() {
        let distance = Array2::<f32>::zeros((0, 0));
        assert!(cluster(&distance, &params(2, 2)).is_err());
    }

    #[test]
    fn test_standardize_centers_columns() {
        let mut matrix = arr2(&[[1.0f32, 10.0], [3.0, 10.0], [5.0, 10.0]]);
        standardize(&mut matrix);

        let col0_mean: f32 = matrix.column(0).sum() / 3.0;
        assert!(col0_mean.abs() < 1e-5);
        // Constant column is centered to zero
        assert!(matrix.column(1).iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_cosine_distance_properties() {
        let matrix = arr2(&[[1.0f32, 0.0], [0.0, 1.0], [2.0, 0.0]]);
        let distance = cosine_distance_matrix(&matrix);

        // Self-distance zero, orthogonal vectors distance 1, parallel 0
        assert_eq!(distance[[0, 0]], 0.0);
        assert!((distance[[0, 1]] - 1.0).abs() < 1e-5);
        assert!(distance[[0, 2]].abs() < 1e-5);
        // Symmetry
        assert_eq!(distance[[1, 2]], distance[[2, 1]]);
    }
}
