use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::sample::SampleValue;

/// How the samples inside one decimation window combine into an output
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecimationMode {
    /// Output an actual scanned sample: the window minimum when the
    /// window trends downward, the maximum when it trends upward. Peaks
    /// and valleys survive; averaging would flatten them.
    PeakPick,
    /// Output the arithmetic mean of the window as a float.
    Average,
}

/// A decimation request: reduce a series to at most `output_count`
/// points.
#[derive(Debug, Clone, Copy)]
pub struct Decimation {
    pub output_count: usize,
    pub mode: DecimationMode,
}

/// Reduces a time-ordered series to at most `output_count` points.
///
/// The series is scanned in tumbling windows of `len / output_count`
/// samples (fractional windows handled by a running budget); each window
/// emits one point stamped at the midpoint of the window's time span. A
/// trailing partial window still emits, so the newest samples are never
/// silently dropped. Series already at or under the requested count pass
/// through unchanged.
pub fn decimate(
    series: &[(DateTime<Utc>, SampleValue)],
    decimation: Decimation,
) -> Vec<(DateTime<Utc>, SampleValue)> {
    let Decimation { output_count, mode } = decimation;
    if output_count == 0 || series.len() <= output_count {
        return series.to_vec();
    }

    let outputs_per_sample = output_count as f64 / series.len() as f64;
    let mut out = Vec::with_capacity(output_count);
    let mut window: Vec<&(DateTime<Utc>, SampleValue)> = Vec::new();
    let mut budget = 0.0;

    for sample in series {
        window.push(sample);
        budget += outputs_per_sample;
        if budget >= 1.0 {
            budget -= 1.0;
            out.push(emit(&window, mode));
            window.clear();
        }
    }
    if !window.is_empty() && out.len() < output_count {
        out.push(emit(&window, mode));
    }
    out
}

fn emit(
    window: &[&(DateTime<Utc>, SampleValue)],
    mode: DecimationMode,
) -> (DateTime<Utc>, SampleValue) {
    let first = window.first().expect("window is non-empty");
    let last = window.last().expect("window is non-empty");
    let center = midpoint(first.0, last.0);

    // Tags have no interpolation: a window ending on one passes it
    // through at its own timestamp.
    if let SampleValue::Tag(_) = last.1 {
        return (last.0, last.1.clone());
    }

    let numeric: Vec<(&(DateTime<Utc>, SampleValue), f64)> = window
        .iter()
        .filter_map(|s| double_value(&s.1).map(|d| (*s, d)))
        .collect();
    if numeric.is_empty() {
        return (center, SampleValue::Missing);
    }

    match mode {
        DecimationMode::Average => {
            let sum: f64 = numeric.iter().map(|(_, d)| d).sum();
            (center, SampleValue::Float(sum / numeric.len() as f64))
        }
        DecimationMode::PeakPick => {
            // Trend of the window: compare the older half against the
            // newer half, then output the real sample at the extreme the
            // trend points to.
            let half = numeric.len().div_ceil(2);
            let first_sum: f64 = numeric[..half].iter().map(|(_, d)| d).sum();
            let last_sum: f64 = numeric[numeric.len() - half..].iter().map(|(_, d)| d).sum();
            let pick = if first_sum > last_sum {
                numeric
                    .iter()
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .expect("numeric is non-empty")
            } else {
                numeric
                    .iter()
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .expect("numeric is non-empty")
            };
            (center, pick.0 .1.clone())
        }
    }
}

fn double_value(value: &SampleValue) -> Option<f64> {
    match value {
        SampleValue::Int(i) => Some(*i as f64),
        SampleValue::Float(f) => Some(*f),
        SampleValue::Missing | SampleValue::Tag(_) => None,
    }
}

fn midpoint(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    let mid = (a.timestamp_millis() + b.timestamp_millis()) / 2;
    DateTime::from_timestamp_millis(mid).unwrap_or(a)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn series(values: &[i64]) -> Vec<(DateTime<Utc>, SampleValue)> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| (ts(i as i64), SampleValue::Int(v)))
            .collect()
    }

    #[test]
    fn test_short_series_passes_through() {
        let input = series(&[1, 2, 3]);
        let out = decimate(
            &input,
            Decimation {
                output_count: 8,
                mode: DecimationMode::PeakPick,
            },
        );
        assert_eq!(out, input);
    }

    #[test]
    fn test_peak_pick_keeps_rising_spike() {
        // The spike sits in a window trending upward: the maximum wins.
        let input = series(&[0, 0, 0, 100, 0, 0, 0, 0]);
        let out = decimate(
            &input,
            Decimation {
                output_count: 2,
                mode: DecimationMode::PeakPick,
            },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1, SampleValue::Int(100));
        assert_eq!(out[1].1, SampleValue::Int(0));
    }

    #[test]
    fn test_peak_pick_keeps_falling_valley() {
        // A window trending downward outputs its minimum.
        let input = series(&[100, 90, 5, 80, 0, 0, 0, 0]);
        let out = decimate(
            &input,
            Decimation {
                output_count: 2,
                mode: DecimationMode::PeakPick,
            },
        );
        assert_eq!(out[0].1, SampleValue::Int(5));
    }

    #[test]
    fn test_average_mode_emits_mean() {
        let input = series(&[10, 20, 30, 40]);
        let out = decimate(
            &input,
            Decimation {
                output_count: 2,
                mode: DecimationMode::Average,
            },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1, SampleValue::Float(15.0));
        assert_eq!(out[1].1, SampleValue::Float(35.0));
        // Each point sits at the midpoint of its window's time span.
        assert_eq!(out[0].0.timestamp_millis(), 500);
        assert_eq!(out[1].0.timestamp_millis(), 2_500);
    }

    #[test]
    fn test_gaps_are_excluded_from_the_math() {
        let input = vec![
            (ts(0), SampleValue::Int(10)),
            (ts(1), SampleValue::Missing),
            (ts(2), SampleValue::Missing),
            (ts(3), SampleValue::Int(30)),
        ];
        let out = decimate(
            &input,
            Decimation {
                output_count: 1,
                mode: DecimationMode::Average,
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, SampleValue::Float(20.0));
        assert_eq!(out[0].0.timestamp_millis(), 1_500);
    }

    #[test]
    fn test_all_missing_window_stays_missing() {
        let input = vec![
            (ts(0), SampleValue::Missing),
            (ts(1), SampleValue::Missing),
            (ts(2), SampleValue::Missing),
            (ts(3), SampleValue::Missing),
        ];
        let out = decimate(
            &input,
            Decimation {
                output_count: 2,
                mode: DecimationMode::PeakPick,
            },
        );
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|(_, v)| v.is_missing()));
    }

    #[test]
    fn test_tag_sample_passes_through() {
        let input = vec![
            (ts(0), SampleValue::Int(1)),
            (ts(1), SampleValue::Tag("maintenance".to_string())),
            (ts(2), SampleValue::Int(2)),
            (ts(3), SampleValue::Int(3)),
        ];
        let out = decimate(
            &input,
            Decimation {
                output_count: 2,
                mode: DecimationMode::PeakPick,
            },
        );
        assert_eq!(out[0], (ts(1), SampleValue::Tag("maintenance".to_string())));
    }

    #[test]
    fn test_uneven_windows_keep_the_newest_samples() {
        // 5 samples into 2 outputs: the windows split 3/2 and the short
        // second window must still surface its samples.
        let input = series(&[1, 1, 1, 1, 99]);
        let out = decimate(
            &input,
            Decimation {
                output_count: 2,
                mode: DecimationMode::PeakPick,
            },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].1, SampleValue::Int(99));
    }
}
