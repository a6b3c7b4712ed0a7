//! Entropy and fractal-dimension estimators on point clouds and time series.

use crate::dataset::Dataset;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Box occupation probabilities of `data` on a grid of side `eps` anchored at
/// the dataset's lower corner.
pub fn box_probabilities(data: &Dataset, eps: f64) -> Result<Vec<f64>> {
    if data.is_empty() {
        bail!("Dataset is empty.");
    }
    if !(eps > 0.0) || !eps.is_finite() {
        bail!("Box size must be positive and finite (got {eps}).");
    }
    let mins: Vec<f64> = data.bounds().iter().map(|(lo, _)| *lo).collect();
    let mut counts: HashMap<Vec<i64>, usize> = HashMap::new();
    for point in &data.points {
        let key: Vec<i64> = point
            .iter()
            .zip(mins.iter())
            .map(|(v, lo)| ((v - lo) / eps).floor() as i64)
            .collect();
        *counts.entry(key).or_insert(0) += 1;
    }
    let total = data.len() as f64;
    Ok(counts.into_values().map(|c| c as f64 / total).collect())
}

/// Rényi entropy of order `q` (natural log) of a probability vector.
/// `q = 1` is the Shannon entropy; `q = ∞` the min-entropy.
pub fn renyi_entropy(q: f64, probabilities: &[f64]) -> f64 {
    let nonzero = probabilities.iter().copied().filter(|&p| p > 0.0);
    if q == 1.0 {
        -nonzero.map(|p| p * p.ln()).sum::<f64>()
    } else if q == 0.0 {
        (nonzero.count() as f64).ln()
    } else if q.is_infinite() {
        -nonzero.fold(0.0, f64::max).ln()
    } else {
        nonzero.map(|p| p.powf(q)).sum::<f64>().ln() / (1.0 - q)
    }
}

/// Generalized entropy `H_q(ε)` of the natural measure sampled by `data`.
pub fn generalized_entropy(q: f64, eps: f64, data: &Dataset) -> Result<f64> {
    if q < 0.0 {
        bail!("Entropy order q must be non-negative (got {q}).");
    }
    let probabilities = box_probabilities(data, eps)?;
    Ok(renyi_entropy(q, &probabilities))
}

/// `count` box sizes spaced geometrically by `√2`, starting at a quarter of
/// the dataset's largest extent.
pub fn estimate_box_sizes(data: &Dataset, count: usize) -> Result<Vec<f64>> {
    let extent = data.extent();
    if !(extent > 0.0) {
        bail!("Dataset has zero extent; cannot choose box sizes.");
    }
    if count < 2 {
        bail!("At least two box sizes are needed.");
    }
    let upper = extent / 4.0;
    Ok((0..count)
        .map(|i| upper * std::f64::consts::SQRT_2.powi(-(i as i32)))
        .collect())
}

/// The largest contiguous segment of `(x, y)` with approximately constant
/// slope, and the least-squares slope over it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearRegion {
    pub start: usize,
    /// Inclusive end index.
    pub end: usize,
    pub slope: f64,
}

/// Finds the longest run of consecutive local slopes that stay within
/// `tolerance` (relative) of the run's first slope.
pub fn linear_region(x: &[f64], y: &[f64], tolerance: f64) -> Result<LinearRegion> {
    if x.len() != y.len() {
        bail!("x and y must have equal length.");
    }
    if x.len() < 2 {
        bail!("A linear region needs at least two points.");
    }
    let slopes: Vec<f64> = x
        .windows(2)
        .zip(y.windows(2))
        .map(|(xw, yw)| (yw[1] - yw[0]) / (xw[1] - xw[0]))
        .collect();

    let mut best = (0usize, 0usize);
    for i in 0..slopes.len() {
        let reference = slopes[i];
        let allowed = tolerance * reference.abs().max(1e-12);
        let mut j = i;
        while j + 1 < slopes.len() && (slopes[j + 1] - reference).abs() <= allowed {
            j += 1;
        }
        if j - i > best.1 - best.0 {
            best = (i, j);
        }
    }

    // Segment indices i..=j span points i..=j+1.
    let (start, end) = (best.0, best.1 + 1);
    let slope = least_squares_slope(&x[start..=end], &y[start..=end]);
    Ok(LinearRegion { start, end, slope })
}

fn least_squares_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (a, b) in x.iter().zip(y.iter()) {
        sxy += (a - mean_x) * (b - mean_y);
        sxx += (a - mean_x) * (a - mean_x);
    }
    sxy / sxx
}

/// Result of a generalized-dimension fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionEstimate {
    pub q: f64,
    pub dimension: f64,
    pub box_sizes: Vec<f64>,
    pub entropies: Vec<f64>,
    pub region: LinearRegion,
}

/// Rényi dimension `D_q`: the slope of `H_q(ε)` against `ln(1/ε)` over its
/// linear region.
pub fn generalized_dimension(q: f64, data: &Dataset, box_sizes: &[f64]) -> Result<DimensionEstimate> {
    if box_sizes.len() < 2 {
        bail!("At least two box sizes are needed.");
    }
    let mut sizes = box_sizes.to_vec();
    sizes.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let x: Vec<f64> = sizes.iter().map(|e| -e.ln()).collect();
    let entropies = sizes
        .iter()
        .map(|&eps| generalized_entropy(q, eps, data))
        .collect::<Result<Vec<f64>>>()?;
    let region = linear_region(&x, &entropies, 0.25)?;
    debug!(q, dimension = region.slope, start = region.start, end = region.end, "generalized dimension");

    Ok(DimensionEstimate {
        q,
        dimension: region.slope,
        box_sizes: sizes,
        entropies,
        region,
    })
}

/// Normalised permutation entropy of a scalar series: the Shannon entropy of
/// ordinal patterns of length `order` (with lag `delay`) divided by
/// `ln(order!)`.
pub fn permutation_entropy(series: &[f64], order: usize, delay: usize) -> Result<f64> {
    if order < 2 {
        bail!("Pattern order must be at least 2.");
    }
    if delay == 0 {
        bail!("Delay must be at least 1.");
    }
    let span = (order - 1) * delay;
    if series.len() <= span {
        bail!(
            "Series of length {} is too short for order {} and delay {}.",
            series.len(),
            order,
            delay
        );
    }

    let mut counts: HashMap<Vec<usize>, usize> = HashMap::new();
    let windows = series.len() - span;
    for start in 0..windows {
        let mut pattern: Vec<usize> = (0..order).collect();
        pattern.sort_by(|&a, &b| {
            series[start + a * delay]
                .partial_cmp(&series[start + b * delay])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        *counts.entry(pattern).or_insert(0) += 1;
    }

    let probabilities: Vec<f64> = counts
        .into_values()
        .map(|c| c as f64 / windows as f64)
        .collect();
    let max_entropy: f64 = (2..=order).map(|k| (k as f64).ln()).sum();
    Ok(renyi_entropy(1.0, &probabilities) / max_entropy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::{attractor, LyapunovSettings};
    use crate::systems::Henon;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn unit_square_grid(n: usize) -> Dataset {
        let mut points = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                points.push(vec![(i as f64 + 0.5) / n as f64, (j as f64 + 0.5) / n as f64]);
            }
        }
        Dataset::new(points).expect("dataset")
    }

    #[test]
    fn renyi_entropy_of_uniform_distribution_is_log_n() {
        let p = vec![0.25; 4];
        for q in [0.0, 0.5, 1.0, 2.0, f64::INFINITY] {
            assert!((renyi_entropy(q, &p) - 4.0_f64.ln()).abs() < 1e-12, "q = {q}");
        }
    }

    #[test]
    fn renyi_entropy_is_non_increasing_in_q() {
        let p = [0.5, 0.25, 0.125, 0.125];
        let h0 = renyi_entropy(0.0, &p);
        let h1 = renyi_entropy(1.0, &p);
        let h2 = renyi_entropy(2.0, &p);
        assert!(h0 >= h1 && h1 >= h2);
    }

    #[test]
    fn generalized_entropy_of_grid_counts_boxes() {
        let points = (0..10)
            .flat_map(|i| (0..10).map(move |j| vec![i as f64, j as f64]))
            .collect();
        let data = Dataset::new(points).expect("dataset");
        // Box side 2 on a 10x10 integer grid: 25 boxes with 4 points each.
        let h = generalized_entropy(1.0, 2.0, &data).expect("entropy");
        assert!((h - 25.0_f64.ln()).abs() < 1e-9);
        assert!(generalized_entropy(-1.0, 2.0, &data).is_err());
        assert!(generalized_entropy(1.0, 0.0, &data).is_err());
    }

    #[test]
    fn linear_region_finds_straight_segment() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&v| if v < 7.0 { 2.0 * v } else { 14.0 }).collect();
        let region = linear_region(&x, &y, 0.1).expect("region");
        assert_eq!(region.start, 0);
        assert_eq!(region.end, 7);
        assert!((region.slope - 2.0).abs() < 1e-12);
    }

    #[test]
    fn filled_square_has_dimension_two() {
        let data = unit_square_grid(200);
        let sizes = estimate_box_sizes(&data, 8).expect("sizes");
        let estimate = generalized_dimension(1.0, &data, &sizes).expect("dimension");
        assert!((estimate.dimension - 2.0).abs() < 0.2, "{estimate:?}");
    }

    #[test]
    fn henon_attractor_is_fractal() {
        let settings = LyapunovSettings::for_map(50_000);
        let data = attractor(&Henon, &Henon::PARAMS, &[0.1, 0.1], &settings).expect("attractor");
        let sizes = estimate_box_sizes(&data, 10).expect("sizes");
        let estimate = generalized_dimension(1.0, &data, &sizes).expect("dimension");
        assert!(estimate.dimension > 1.0 && estimate.dimension < 1.45, "{estimate:?}");
    }

    #[test]
    fn permutation_entropy_bounds() {
        let monotone: Vec<f64> = (0..200).map(|i| i as f64).collect();
        assert!(permutation_entropy(&monotone, 3, 1).expect("pe").abs() < 1e-12);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let noise: Vec<f64> = (0..20_000).map(|_| rng.gen::<f64>()).collect();
        let pe = permutation_entropy(&noise, 3, 1).expect("pe");
        assert!(pe > 0.98 && pe <= 1.0 + 1e-12, "pe {pe}");

        assert!(permutation_entropy(&monotone[..2], 3, 1).is_err());
    }
}
