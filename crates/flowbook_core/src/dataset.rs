//! Sampled trajectories and point clouds.

use anyhow::{bail, Result};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// An ordered sequence of `(t, state)` samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub t: Vec<f64>,
    pub u: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            t: Vec::with_capacity(capacity),
            u: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, t: f64, state: &[f64]) {
        self.t.push(t);
        self.u.push(state.to_vec());
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.u.first().map_or(0, Vec::len)
    }

    pub fn final_state(&self) -> Option<&[f64]> {
        self.u.last().map(Vec::as_slice)
    }

    /// Time series of a single state component.
    pub fn component(&self, index: usize) -> Vec<f64> {
        self.u.iter().map(|row| row[index]).collect()
    }

    /// States as an `n_samples × dimension` matrix.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        let rows = self.len();
        let cols = self.dimension();
        DMatrix::from_fn(rows, cols, |i, j| self.u[i][j])
    }

    pub fn to_dataset(&self) -> Dataset {
        Dataset {
            dimension: self.dimension(),
            points: self.u.clone(),
        }
    }

    /// Copy with zero-mean Gaussian noise added to every state component.
    ///
    /// The standard deviation of component `j` is `magnitude` times the mean
    /// absolute value of that component over the trajectory, so quantities of
    /// different scale are perturbed proportionally.
    pub fn with_noise(&self, magnitude: f64, seed: u64) -> Result<Trajectory> {
        if magnitude < 0.0 || !magnitude.is_finite() {
            bail!("Noise magnitude must be a non-negative finite number.");
        }
        let mut noisy = self.clone();
        if magnitude == 0.0 || self.is_empty() {
            return Ok(noisy);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let standard = Normal::new(0.0, 1.0)?;
        let scales: Vec<f64> = (0..self.dimension())
            .map(|j| {
                let mean_abs = self.u.iter().map(|row| row[j].abs()).sum::<f64>()
                    / self.len() as f64;
                magnitude * mean_abs
            })
            .collect();

        for row in &mut noisy.u {
            for (value, scale) in row.iter_mut().zip(scales.iter()) {
                *value += scale * standard.sample(&mut rng);
            }
        }
        Ok(noisy)
    }
}

/// Summary of how far two trajectories on the same time grid drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryComparison {
    pub max_abs_error: f64,
    pub rmse: f64,
    pub samples: usize,
}

pub fn compare_trajectories(reference: &Trajectory, other: &Trajectory) -> Result<TrajectoryComparison> {
    if reference.len() != other.len() {
        bail!(
            "Trajectories have different lengths ({} vs {}).",
            reference.len(),
            other.len()
        );
    }
    if reference.dimension() != other.dimension() {
        bail!(
            "Trajectories have different dimensions ({} vs {}).",
            reference.dimension(),
            other.dimension()
        );
    }
    for (a, b) in reference.t.iter().zip(other.t.iter()) {
        if (a - b).abs() > 1e-9 * a.abs().max(1.0) {
            bail!("Trajectories are sampled on different time grids.");
        }
    }

    let diff = reference.to_matrix() - other.to_matrix();
    let count = diff.len();
    let (max_abs_error, rmse) = if count == 0 {
        (0.0, 0.0)
    } else {
        (diff.amax(), diff.norm() / (count as f64).sqrt())
    };

    Ok(TrajectoryComparison {
        max_abs_error,
        rmse,
        samples: reference.len(),
    })
}

/// A cloud of equal-dimension points (row per sample).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub dimension: usize,
    pub points: Vec<Vec<f64>>,
}

impl Dataset {
    pub fn new(points: Vec<Vec<f64>>) -> Result<Self> {
        let dimension = points.first().map_or(0, Vec::len);
        if points.iter().any(|p| p.len() != dimension) {
            bail!("All points in a dataset must share the same dimension.");
        }
        Ok(Self { dimension, points })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Per-dimension `(min, max)`.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        let mut bounds = vec![(f64::INFINITY, f64::NEG_INFINITY); self.dimension];
        for point in &self.points {
            for (b, &v) in bounds.iter_mut().zip(point.iter()) {
                b.0 = b.0.min(v);
                b.1 = b.1.max(v);
            }
        }
        bounds
    }

    /// Largest side length of the bounding box.
    pub fn extent(&self) -> f64 {
        self.bounds()
            .iter()
            .map(|(lo, hi)| hi - lo)
            .fold(0.0, f64::max)
    }
}
