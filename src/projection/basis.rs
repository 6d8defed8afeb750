//! Fitted 3-D PCA projection.
//!
//! [`PcaBasis::fit`] centers the fit set and finds its top three principal
//! directions by block power (subspace) iteration on `XᵀX`, with a
//! Rayleigh–Ritz step each round so the columns come out ordered by explained
//! variance. Only `n×d` and `d×3` products are formed, never the `d×d`
//! covariance, so fitting the 3000-word default corpus stays cheap.
//!
//! Fits are deterministic for identical input: the starting block is seeded
//! from a fixed sequence and each direction is sign-normalized so that its
//! largest-magnitude loading is positive.

use ndarray::{s, Array1, Array2, Axis};

use super::error::{ProjectionError, Result};

/// Number of retained principal components.
pub const COMPONENTS: usize = 3;

/// A projected point.
pub type Coordinate = [f64; COMPONENTS];

const MAX_ITERATIONS: usize = 300;
/// Extra block columns beyond the retained components; widens the spectral
/// gap the iteration converges on.
const OVERSAMPLE: usize = 5;
const CONVERGENCE_TOL: f64 = 1e-13;
/// Residual norm (relative to the largest column) below which a direction is
/// considered degenerate and replaced.
const DEGENERATE_TOL: f64 = 1e-10;
const BLOB_MAGIC: &[u8; 4] = b"LDB1";

/// Mean vector plus a `d×3` projection matrix (one direction per column).
#[derive(Debug, Clone, PartialEq)]
pub struct PcaBasis {
    mean: Array1<f64>,
    components: Array2<f64>,
    explained_variance: [f64; COMPONENTS],
    fitted_on: usize,
}

impl PcaBasis {
    /// Fit a basis on `embeddings`. Needs at least three rows of one common
    /// dimensionality `d >= 3`.
    pub fn fit<E: AsRef<[f32]>>(embeddings: &[E]) -> Result<Self> {
        if embeddings.len() < COMPONENTS {
            return Err(ProjectionError::InsufficientData {
                required: COMPONENTS,
                got: embeddings.len(),
            });
        }

        let dim = embeddings[0].as_ref().len();
        if dim < COMPONENTS {
            return Err(ProjectionError::DimensionMismatch {
                expected: COMPONENTS,
                got: dim,
            });
        }

        let rows = embeddings.len();
        let mut data = Array2::<f64>::zeros((rows, dim));
        for (i, embedding) in embeddings.iter().enumerate() {
            let embedding = embedding.as_ref();
            if embedding.len() != dim {
                return Err(ProjectionError::DimensionMismatch {
                    expected: dim,
                    got: embedding.len(),
                });
            }
            for (j, &v) in embedding.iter().enumerate() {
                data[[i, j]] = f64::from(v);
            }
        }

        let mean = data
            .mean_axis(Axis(0))
            .ok_or(ProjectionError::InsufficientData {
                required: COMPONENTS,
                got: 0,
            })?;
        let centered = &data - &mean;

        let (mut components, eigenvalues) = principal_directions(&centered);
        normalize_signs(&mut components);

        let denom = (rows - 1).max(1) as f64;
        let explained_variance = [
            eigenvalues[0] / denom,
            eigenvalues[1] / denom,
            eigenvalues[2] / denom,
        ];

        tracing::debug!(rows, dim, ?explained_variance, "fitted PCA basis");

        Ok(Self {
            mean,
            components,
            explained_variance,
            fitted_on: rows,
        })
    }

    /// Project each embedding: subtract the mean, multiply by the projection
    /// matrix. Works for embeddings outside the fit set.
    pub fn transform<E: AsRef<[f32]>>(&self, embeddings: &[E]) -> Result<Vec<Coordinate>> {
        embeddings
            .iter()
            .map(|e| self.transform_one(e.as_ref()))
            .collect()
    }

    pub fn transform_one(&self, embedding: &[f32]) -> Result<Coordinate> {
        if embedding.len() != self.dimensions() {
            return Err(ProjectionError::DimensionMismatch {
                expected: self.dimensions(),
                got: embedding.len(),
            });
        }
        let x = Array1::from_iter(embedding.iter().map(|&v| f64::from(v)));
        let projected = (&x - &self.mean).dot(&self.components);
        Ok([projected[0], projected[1], projected[2]])
    }

    /// Embedding dimensionality `d` this basis accepts.
    pub fn dimensions(&self) -> usize {
        self.mean.len()
    }

    /// Number of embeddings the basis was fit on.
    pub fn fitted_on(&self) -> usize {
        self.fitted_on
    }

    /// Variance of the fit set along each component, largest first.
    pub fn explained_variance(&self) -> [f64; COMPONENTS] {
        self.explained_variance
    }

    /// Serialize to a little-endian blob for the durable basis store.
    pub fn to_bytes(&self) -> Vec<u8> {
        let dim = self.dimensions();
        let mut out = Vec::with_capacity(16 + 8 * (COMPONENTS + dim * (1 + COMPONENTS)));
        out.extend_from_slice(BLOB_MAGIC);
        out.extend_from_slice(&(dim as u32).to_le_bytes());
        out.extend_from_slice(&(self.fitted_on as u64).to_le_bytes());
        for v in self.explained_variance {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.mean.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.components.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Inverse of [`PcaBasis::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| ProjectionError::Storage(format!("corrupt basis blob: {what}"));

        let header = 4 + 4 + 8;
        if bytes.len() < header || &bytes[..4] != BLOB_MAGIC {
            return Err(corrupt("bad header"));
        }
        let dim = u32::from_le_bytes(bytes[4..8].try_into().map_err(|_| corrupt("dim"))?) as usize;
        let fitted_on =
            u64::from_le_bytes(bytes[8..16].try_into().map_err(|_| corrupt("row count"))?) as usize;

        let floats = COMPONENTS + dim + dim * COMPONENTS;
        if bytes.len() != header + floats * 8 {
            return Err(corrupt("length does not match dimensionality"));
        }

        let values: Vec<f64> = bytes[header..]
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect();

        let explained_variance = [values[0], values[1], values[2]];
        let mean = Array1::from(values[COMPONENTS..COMPONENTS + dim].to_vec());
        let components =
            Array2::from_shape_vec((dim, COMPONENTS), values[COMPONENTS + dim..].to_vec())
                .map_err(|e| corrupt(&e.to_string()))?;

        Ok(Self {
            mean,
            components,
            explained_variance,
            fitted_on,
        })
    }
}

/// Top-3 right singular vectors of `centered` (as columns) and the matching
/// eigenvalues of `XᵀX`, largest first.
fn principal_directions(centered: &Array2<f64>) -> (Array2<f64>, [f64; COMPONENTS]) {
    let dim = centered.ncols();
    let width = (COMPONENTS + OVERSAMPLE).min(dim);
    let mut q = seed_block(dim, width);
    orthonormalize(&mut q);
    let mut eigenvalues = vec![0.0; width];

    for iteration in 0..MAX_ITERATIONS {
        let mut z = centered.t().dot(&centered.dot(&q));
        orthonormalize(&mut z);

        // Rayleigh–Ritz: rotate the block onto the eigenvectors of its
        // projected Gram matrix.
        let xz = centered.dot(&z);
        let gram = xz.t().dot(&xz);
        let (values, vectors) = symmetric_eigen(&gram);
        let next = z.dot(&vectors);

        let converged = (0..COMPONENTS).all(|j| {
            let overlap = next.column(j).dot(&q.column(j)).abs();
            1.0 - overlap <= CONVERGENCE_TOL
        });

        q = next;
        eigenvalues = values;
        if converged {
            tracing::trace!(iteration, "subspace iteration converged");
            break;
        }
    }

    let components = q.slice(s![.., ..COMPONENTS]).to_owned();
    let top = [
        eigenvalues[0].max(0.0),
        eigenvalues[1].max(0.0),
        eigenvalues[2].max(0.0),
    ];
    (components, top)
}

/// Deterministic pseudo-random starting block (splitmix64 stream in [-1, 1]).
fn seed_block(dim: usize, width: usize) -> Array2<f64> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    Array2::from_shape_fn((dim, width), |_| {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
    })
}

/// Modified Gram–Schmidt over the columns of `m`. A column that collapses
/// (the data has fewer directions of variance than the block is wide) is
/// replaced by the first standard basis vector independent of the previous
/// columns.
fn orthonormalize(m: &mut Array2<f64>) {
    let dim = m.nrows();
    let scale = m
        .columns()
        .into_iter()
        .map(|c| c.dot(&c).sqrt())
        .fold(0.0, f64::max);

    for j in 0..m.ncols() {
        let mut column = m.column(j).to_owned();
        remove_projections(&mut column, m, j);
        let mut norm = column.dot(&column).sqrt();

        if scale == 0.0 || norm <= scale * DEGENERATE_TOL {
            for k in 0..dim {
                let mut candidate = Array1::<f64>::zeros(dim);
                candidate[k] = 1.0;
                remove_projections(&mut candidate, m, j);
                norm = candidate.dot(&candidate).sqrt();
                if norm > 0.5 {
                    column = candidate;
                    break;
                }
            }
        }

        column /= norm;
        m.column_mut(j).assign(&column);
    }
}

fn remove_projections(v: &mut Array1<f64>, basis: &Array2<f64>, upto: usize) {
    for i in 0..upto {
        let b = basis.column(i);
        let coeff = v.dot(&b);
        v.scaled_add(-coeff, &b);
    }
}

/// Flip each direction so its largest-magnitude loading is positive.
fn normalize_signs(components: &mut Array2<f64>) {
    for mut column in components.columns_mut() {
        let pivot = column
            .iter()
            .copied()
            .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }
}

/// Cyclic Jacobi eigensolver for a small symmetric matrix. Returns the
/// eigenvalues in descending order and the matching eigenvectors as columns.
fn symmetric_eigen(a: &Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut a = a.clone();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..64 {
        let mut off = 0.0;
        for p in 0..n {
            for q in p + 1..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        let diag = a.diag().dot(&a.diag());
        if off <= f64::EPSILON * f64::EPSILON * diag.max(f64::MIN_POSITIVE) {
            break;
        }

        for p in 0..n.saturating_sub(1) {
            for q in p + 1..n {
                if a[[p, q]] == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));

    let values = order.iter().map(|&i| a[[i, i]]).collect();
    let mut vectors = Array2::<f64>::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        vectors.column_mut(dst).assign(&v.column(src));
    }
    (values, vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distance(a: &Coordinate, b: &Coordinate) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Points spread mostly along three axes of a 6-dim space.
    fn spread_points() -> Vec<Vec<f32>> {
        (0..12)
            .map(|i| {
                let t = i as f32;
                vec![
                    5.0 * t.sin(),
                    3.0 * (0.7 * t).cos(),
                    1.5 * (1.3 * t).sin(),
                    0.01 * t,
                    0.0,
                    0.02 * (2.0 * t).cos(),
                ]
            })
            .collect()
    }

    #[test]
    fn colinear_points_keep_distance_ratio() {
        let points = vec![vec![1.0f32, 0.0, 0.0], vec![2.0, 0.0, 0.0], vec![3.0, 0.0, 0.0]];
        let basis = PcaBasis::fit(&points).unwrap();
        let coords = basis.transform(&points).unwrap();

        let d1 = distance(&coords[0], &coords[1]);
        let d2 = distance(&coords[1], &coords[2]);
        assert!((d1 / d2 - 1.0).abs() < 1e-9, "ratio was {}", d1 / d2);
        assert!((d1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn uneven_colinear_ratio_is_preserved() {
        let points = vec![vec![0.0f32, 1.0, 0.0, 0.0], vec![0.0, 2.0, 0.0, 0.0], vec![0.0, 5.0, 0.0, 0.0]];
        let basis = PcaBasis::fit(&points).unwrap();
        let coords = basis.transform(&points).unwrap();
        let ratio = distance(&coords[0], &coords[1]) / distance(&coords[1], &coords[2]);
        assert!((ratio - 1.0 / 3.0).abs() < 1e-9, "ratio was {ratio}");
    }

    #[test]
    fn transform_is_deterministic() {
        let points = spread_points();
        let basis = PcaBasis::fit(&points).unwrap();
        let first = basis.transform_one(&points[4]).unwrap();
        let second = basis.transform_one(&points[4]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fit_is_deterministic_for_identical_input() {
        let points = spread_points();
        let a = PcaBasis::fit(&points).unwrap();
        let b = PcaBasis::fit(&points).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shape_is_n_by_three() {
        let points = spread_points();
        let basis = PcaBasis::fit(&points).unwrap();
        for n in [1, 5, 12] {
            let coords = basis.transform(&points[..n]).unwrap();
            assert_eq!(coords.len(), n);
        }
        assert_eq!(basis.dimensions(), 6);
        assert_eq!(basis.fitted_on(), 12);
    }

    #[test]
    fn out_of_sample_projection() {
        let points = spread_points();
        let basis = PcaBasis::fit(&points).unwrap();
        let unseen = vec![0.3f32, -2.0, 0.7, 9.0, 1.0, -4.0];
        let coord = basis.transform_one(&unseen).unwrap();
        assert!(coord.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn components_are_orthonormal_and_ordered() {
        let points = spread_points();
        let basis = PcaBasis::fit(&points).unwrap();
        let gram = basis.components.t().dot(&basis.components);
        for i in 0..COMPONENTS {
            for j in 0..COMPONENTS {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-9);
            }
        }
        let ev = basis.explained_variance();
        assert!(ev[0] >= ev[1] && ev[1] >= ev[2]);
    }

    #[test]
    fn in_sample_distances_match_for_rank_three_data() {
        // Fifth coordinate is a linear combination of the first two, so the
        // centered data spans three directions and projection is an isometry.
        let base = [
            [1.0f32, 0.0, 0.0],
            [0.0, 3.0, 0.0],
            [0.0, 0.0, 2.0],
            [1.0, 1.0, 1.0],
            [2.0, -1.0, 0.5],
        ];
        let points: Vec<Vec<f32>> = base
            .iter()
            .map(|p| vec![p[0], p[1], p[2], 0.0, p[0] + p[1]])
            .collect();
        let basis = PcaBasis::fit(&points).unwrap();
        let coords = basis.transform(&points).unwrap();

        for i in 0..points.len() {
            for j in i + 1..points.len() {
                let original: f64 = points[i]
                    .iter()
                    .zip(&points[j])
                    .map(|(a, b)| f64::from(a - b).powi(2))
                    .sum::<f64>()
                    .sqrt();
                let projected = distance(&coords[i], &coords[j]);
                assert!((original - projected).abs() < 1e-6, "{original} vs {projected}");
            }
        }
    }

    #[test]
    fn fewer_than_three_rows_is_insufficient() {
        let points = vec![vec![1.0f32, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let err = PcaBasis::fit(&points).unwrap_err();
        assert!(matches!(
            err,
            ProjectionError::InsufficientData { required: 3, got: 2 }
        ));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let points = vec![vec![1.0f32, 2.0, 3.0], vec![4.0, 5.0, 6.0], vec![7.0, 8.0]];
        let err = PcaBasis::fit(&points).unwrap_err();
        assert!(matches!(
            err,
            ProjectionError::DimensionMismatch { expected: 3, got: 2 }
        ));
    }

    #[test]
    fn transform_rejects_wrong_length() {
        let basis = PcaBasis::fit(&spread_points()).unwrap();
        let err = basis.transform_one(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            ProjectionError::DimensionMismatch { expected: 6, got: 3 }
        ));
    }

    #[test]
    fn identical_rows_project_to_origin() {
        let points = vec![vec![2.0f32, 2.0, 2.0, 2.0]; 4];
        let basis = PcaBasis::fit(&points).unwrap();
        let coord = basis.transform_one(&points[0]).unwrap();
        assert_eq!(coord, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn blob_restores_identical_basis() {
        let basis = PcaBasis::fit(&spread_points()).unwrap();
        let restored = PcaBasis::from_bytes(&basis.to_bytes()).unwrap();
        assert_eq!(basis, restored);
    }

    #[test]
    fn truncated_blob_is_a_storage_error() {
        let basis = PcaBasis::fit(&spread_points()).unwrap();
        let bytes = basis.to_bytes();
        let err = PcaBasis::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), "storage");
    }
}
