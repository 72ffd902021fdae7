use serde::{Deserialize, Serialize};

/// Longest run a single token may encode. Larger gaps are split into
/// multiple tokens so the run count always fits in one byte on the wire.
pub const MAX_RUN: u16 = u8::MAX as u16;

/// A single scalar observation.
///
/// `Missing` is the explicit "no value" marker used for gap filling; it is
/// a first-class variant rather than a sentinel number so the codec stays
/// type-safe end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleValue {
    Missing,
    Int(i64),
    Float(f64),
    Tag(String),
}

impl SampleValue {
    /// True if this is the explicit gap marker.
    pub fn is_missing(&self) -> bool {
        matches!(self, SampleValue::Missing)
    }
}

/// One run-length cell of an in-progress timeline: `count` consecutive
/// samples sharing the same value. `count` never exceeds [`MAX_RUN`].
#[derive(Debug, Clone, PartialEq)]
pub struct SampleToken {
    pub value: SampleValue,
    pub count: u16,
}

/// The in-progress, uncompressed timeline for one metric inside one
/// accumulator window. Appends collapse repeated values into bounded
/// runs; the token list is what the payload codec serializes.
#[derive(Debug, Default)]
pub struct MetricTimeline {
    tokens: Vec<SampleToken>,
    sample_count: usize,
}

impl MetricTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a timeline for a metric first seen mid-window, back-filled
    /// with `count` gap markers so it is length-aligned with its siblings.
    pub fn with_placeholders(count: usize) -> Self {
        let mut timeline = Self::new();
        timeline.append_missing_run(count);
        timeline
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    pub fn tokens(&self) -> &[SampleToken] {
        &self.tokens
    }

    /// Appends one sample, extending the trailing run when the value
    /// repeats and the run has not hit the bound.
    pub fn append(&mut self, value: SampleValue) {
        if let Some(last) = self.tokens.last_mut() {
            if last.value == value && last.count < MAX_RUN {
                last.count += 1;
                self.sample_count += 1;
                return;
            }
        }
        self.tokens.push(SampleToken { value, count: 1 });
        self.sample_count += 1;
    }

    /// Appends a single gap marker.
    pub fn append_missing(&mut self) {
        self.append(SampleValue::Missing);
    }

    /// Appends `count` gap markers as one or more bounded runs.
    pub fn append_missing_run(&mut self, mut count: usize) {
        // Extend the trailing missing run first, if any.
        if let Some(last) = self.tokens.last_mut() {
            if last.value.is_missing() {
                let room = usize::from(MAX_RUN - last.count);
                let take = room.min(count);
                last.count += take as u16;
                self.sample_count += take;
                count -= take;
            }
        }
        while count > 0 {
            let take = count.min(usize::from(MAX_RUN));
            self.tokens.push(SampleToken {
                value: SampleValue::Missing,
                count: take as u16,
            });
            self.sample_count += take;
            count -= take;
        }
    }

    /// Expands the run-length tokens back into individual values.
    /// Used by tests and diagnostics, not the hot path.
    pub fn expand(&self) -> Vec<SampleValue> {
        let mut out = Vec::with_capacity(self.sample_count);
        for token in &self.tokens {
            for _ in 0..token.count {
                out.push(token.value.clone());
            }
        }
        out
    }

    /// Resets the timeline to empty, keeping the allocation.
    pub fn reset(&mut self) {
        self.tokens.clear();
        self.sample_count = 0;
    }
}
