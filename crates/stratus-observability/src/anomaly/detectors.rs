//! Statistical and pattern anomaly detectors
//!
//! Each detector looks at a window of values with the newest point last and
//! returns a confidence score when that point is anomalous. Confidence scales
//! differ per method; the engine combines them by agreement, not magnitude.

/// Z-score against the mean and stddev of prior points; flags above 3.0.
pub fn z_score(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return None;
    }
    let (history, current) = split_last(values);
    let mean = mean(history);
    let stdev = stdev(history, mean);
    if stdev == 0.0 {
        return None;
    }
    let score = (current - mean).abs() / stdev;
    (score > 3.0).then_some(score)
}

/// Modified z-score using median absolute deviation; flags above 3.5.
pub fn modified_z_score(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return None;
    }
    let (history, current) = split_last(values);
    let med = median(history);
    let deviations: Vec<f64> = history.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&deviations);
    if mad == 0.0 {
        return None;
    }
    let score = (0.6745 * (current - med) / mad).abs();
    (score > 3.5).then_some(score)
}

/// Interquartile-range fence with factor 1.5; confidence is the distance
/// beyond the fence in IQR units.
pub fn iqr(values: &[f64]) -> Option<f64> {
    if values.len() < 5 {
        return None;
    }
    let (history, current) = split_last(values);
    let mut sorted = history.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q1 = percentile(&sorted, 25.0);
    let q3 = percentile(&sorted, 75.0);
    let range = q3 - q1;
    if range <= 0.0 {
        return None;
    }

    let lower = q1 - 1.5 * range;
    let upper = q3 + 1.5 * range;
    if current < lower {
        Some((lower - current) / range)
    } else if current > upper {
        Some((current - upper) / range)
    } else {
        None
    }
}

/// Exponential smoothing (alpha 0.3); flags when the newest residual exceeds
/// twice the mean historical residual.
pub fn exponential_smoothing(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return None;
    }
    let alpha = 0.3;
    let mut smoothed = vec![values[0]];
    for value in &values[1..values.len() - 1] {
        let next = alpha * value + (1.0 - alpha) * smoothed.last().unwrap();
        smoothed.push(next);
    }

    let residuals: Vec<f64> =
        (1..smoothed.len()).map(|i| (values[i] - smoothed[i]).abs()).collect();
    if residuals.is_empty() {
        return None;
    }
    let avg_residual = mean(&residuals);
    if avg_residual == 0.0 {
        return None;
    }

    let current_residual = (values[values.len() - 1] - smoothed.last().unwrap()).abs();
    let confidence = current_residual / avg_residual;
    (confidence > 2.0).then_some(confidence)
}

/// Sudden level shift: mean of the last three points against the mean of
/// everything before them, ratio above 2 (or below 1/2).
pub fn sudden_change(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let recent = if values.len() >= 3 {
        mean(&values[values.len() - 3..])
    } else {
        values[values.len() - 1]
    };
    let historical =
        if values.len() > 3 { mean(&values[..values.len() - 3]) } else { values[0] };
    if historical == 0.0 {
        return None;
    }

    let ratio = recent / historical;
    if ratio <= 0.0 {
        return None;
    }
    let confidence = ratio.max(1.0 / ratio);
    (ratio > 2.0 || ratio < 0.5).then_some(confidence)
}

/// Residual against a least-squares linear fit of (timestamp, value); flags
/// when the newest residual exceeds twice the mean of the prior residuals.
pub fn trend(values: &[f64], timestamps: &[f64]) -> Option<f64> {
    if values.len() < 5 || values.len() != timestamps.len() {
        return None;
    }

    let t_mean = mean(timestamps);
    let v_mean = mean(values);
    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (t, v) in timestamps.iter().zip(values) {
        covariance += (t - t_mean) * (v - v_mean);
        variance += (t - t_mean) * (t - t_mean);
    }
    if variance == 0.0 {
        return None;
    }
    let slope = covariance / variance;
    let intercept = v_mean - slope * t_mean;

    let residuals: Vec<f64> = timestamps
        .iter()
        .zip(values)
        .map(|(t, v)| (v - (slope * t + intercept)).abs())
        .collect();

    let prior_mean = mean(&residuals[..residuals.len() - 1]);
    if prior_mean == 0.0 {
        return None;
    }
    let confidence = residuals[residuals.len() - 1] / prior_mean;
    (confidence > 2.0).then_some(confidence)
}

fn split_last(values: &[f64]) -> (&[f64], f64) {
    (&values[..values.len() - 1], values[values.len() - 1])
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn stdev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

pub(crate) fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Linear-interpolation percentile over a pre-sorted slice
pub(crate) fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady_then(spike: f64) -> Vec<f64> {
        let mut values: Vec<f64> = (0..50).map(|i| 50.0 + ((i % 5) as f64 - 2.0)).collect();
        values.push(spike);
        values
    }

    #[test]
    fn z_score_flags_a_spike() {
        let confidence = z_score(&steady_then(500.0)).expect("spike flagged");
        assert!(confidence > 3.0);
        assert!(z_score(&steady_then(50.0)).is_none());
    }

    #[test]
    fn z_score_ignores_constant_series() {
        let values = vec![5.0; 20];
        assert!(z_score(&values).is_none());
    }

    #[test]
    fn modified_z_score_flags_a_spike() {
        assert!(modified_z_score(&steady_then(500.0)).is_some());
        assert!(modified_z_score(&steady_then(51.0)).is_none());
    }

    #[test]
    fn iqr_flags_points_outside_the_fence() {
        assert!(iqr(&steady_then(500.0)).is_some());
        assert!(iqr(&steady_then(49.0)).is_none());
    }

    #[test]
    fn sudden_change_detects_level_shift() {
        let mut values = vec![10.0; 20];
        values.extend([30.0, 32.0, 31.0]);
        let confidence = sudden_change(&values).expect("shift flagged");
        assert!(confidence > 2.0);

        let steady = vec![10.0; 23];
        assert!(sudden_change(&steady).is_none());
    }

    #[test]
    fn trend_flags_departure_from_fit() {
        let timestamps: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let mut values: Vec<f64> = timestamps.iter().map(|t| 2.0 * t + 1.0).collect();
        values[19] = 200.0;
        assert!(trend(&values, &timestamps).is_some());

        // noisy but conforming data does not flag
        let noisy: Vec<f64> =
            timestamps.iter().enumerate().map(|(i, t)| 2.0 * t + 1.0 + (i % 3) as f64).collect();
        assert!(trend(&noisy, &timestamps).is_none());
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 25.0), 1.75);
        assert_eq!(percentile(&sorted, 50.0), 2.5);
        assert_eq!(percentile(&sorted, 100.0), 4.0);
    }
}
