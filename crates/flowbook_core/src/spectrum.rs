//! One-sided power spectra of uniformly sampled series.

use anyhow::{bail, Result};
use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSpectrum {
    /// Frequencies in cycles per unit time, `0..=1/(2 dt)`.
    pub frequencies: Vec<f64>,
    pub power: Vec<f64>,
}

impl PowerSpectrum {
    /// Frequency carrying the most power, ignoring the zero bin.
    pub fn dominant_frequency(&self) -> Option<f64> {
        self.power
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| self.frequencies[i])
    }

    /// Spectral flatness (geometric over arithmetic mean of the non-zero bins).
    /// Close to 1 for broadband signals, close to 0 for a few sharp lines.
    pub fn flatness(&self) -> f64 {
        let bins: Vec<f64> = self.power.iter().skip(1).copied().filter(|&p| p > 0.0).collect();
        if bins.is_empty() {
            return 0.0;
        }
        let n = bins.len() as f64;
        let log_mean = bins.iter().map(|p| p.ln()).sum::<f64>() / n;
        let mean = bins.iter().sum::<f64>() / n;
        log_mean.exp() / mean
    }
}

/// Periodogram of `series` sampled every `dt`, after removing the mean.
pub fn power_spectrum(series: &[f64], dt: f64) -> Result<PowerSpectrum> {
    if series.len() < 2 {
        bail!("Power spectrum needs at least two samples.");
    }
    if !(dt > 0.0) {
        bail!("Sampling interval dt must be positive.");
    }
    if series.iter().any(|v| !v.is_finite()) {
        bail!("Series contains non-finite values.");
    }

    let n = series.len();
    let mean = series.iter().sum::<f64>() / n as f64;
    let mut buffer: Vec<Complex<f64>> = series
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    let bins = n / 2 + 1;
    let norm = n as f64;
    let frequencies = (0..bins).map(|k| k as f64 / (n as f64 * dt)).collect();
    let power = buffer[..bins].iter().map(|c| c.norm_sqr() / norm).collect();
    Ok(PowerSpectrum { frequencies, power })
}
