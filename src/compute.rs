//! # Signal parsing and classification
//!
//! ## Responsibility
//! Turn an uploaded EEG file into a numeric signal and classify it into one
//! of four dream labels with a confidence and four band features.
//!
//! ## Guarantees
//! - Pure: [`parse_signal`], [`synthetic_signal`] and every
//!   [`ComputeFunction`] implementation here are deterministic and have no
//!   side effects, so they are safe to run on the offload pool.
//! - Bounded: parsing reads at most 1000 lines, 100 cells per line and
//!   10 000 values; classification looks at the first 1000 samples.
//! - Fixed shape: band features are a four-field record, never an open map.
//!
//! ## NOT Responsible For
//! - Running work off the request path (see `offload`)
//! - Substituting fallback data on failure (see `pipeline`)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of lines read from an uploaded file.
pub const MAX_LINES: usize = 1000;
/// Maximum number of cells read from one line.
pub const MAX_CELLS_PER_LINE: usize = 100;
/// Maximum number of values kept from one upload.
pub const MAX_VALUES: usize = 10_000;
/// Number of leading samples the classifier looks at.
pub const CLASSIFY_WINDOW: usize = 1000;
/// Number of samples echoed back to the client for plotting.
pub const SIGNAL_PREFIX_LEN: usize = 200;
/// Length of the deterministic synthetic signal used when parsing fails.
pub const SYNTHETIC_SIGNAL_LEN: usize = 500;

/// Errors raised while parsing or classifying a signal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputeError {
    /// The uploaded payload was empty or whitespace only.
    #[error("empty input")]
    EmptyInput,

    /// The payload contained no parseable numeric cell.
    #[error("no numeric values found in input")]
    NoNumericValues,

    /// The classifier was handed a zero-length signal.
    #[error("cannot classify an empty signal")]
    EmptySignal,

    /// The classifier produced a non-finite score.
    #[error("classification failed: {0}")]
    Failed(String),
}

// ============================================================================
// Labels and features
// ============================================================================

/// The four dream classes the classifier distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DreamLabel {
    /// Lucid dreaming.
    #[serde(rename = "Lucid Dream")]
    LucidDream,
    /// Nightmare.
    #[serde(rename = "Nightmare")]
    Nightmare,
    /// Memory recall.
    #[serde(rename = "Memory Recall")]
    MemoryRecall,
    /// Ordinary sleep with no notable dream activity.
    #[serde(rename = "Normal Sleep")]
    NormalSleep,
}

impl DreamLabel {
    /// All labels in classifier output order.
    pub const ALL: [DreamLabel; 4] = [
        DreamLabel::LucidDream,
        DreamLabel::Nightmare,
        DreamLabel::MemoryRecall,
        DreamLabel::NormalSleep,
    ];

    /// Human-readable label, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DreamLabel::LucidDream => "Lucid Dream",
            DreamLabel::Nightmare => "Nightmare",
            DreamLabel::MemoryRecall => "Memory Recall",
            DreamLabel::NormalSleep => "Normal Sleep",
        }
    }

    /// Position of this label in [`DreamLabel::ALL`].
    pub fn index(self) -> usize {
        match self {
            DreamLabel::LucidDream => 0,
            DreamLabel::Nightmare => 1,
            DreamLabel::MemoryRecall => 2,
            DreamLabel::NormalSleep => 3,
        }
    }

    /// Parse a human-readable label. Returns `None` for unknown text.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == s)
    }
}

impl fmt::Display for DreamLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mean absolute amplitude per frequency band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandPowers {
    /// Delta band (deep sleep).
    pub delta: f64,
    /// Theta band (imagination).
    pub theta: f64,
    /// Alpha band (relaxed visualisation).
    pub alpha: f64,
    /// Beta band (active thinking).
    pub beta: f64,
}

impl BandPowers {
    /// Bands reported for signals too short to split into quarters.
    pub const SHORT_SIGNAL: BandPowers = BandPowers {
        delta: 0.5,
        theta: 0.3,
        alpha: 0.8,
        beta: 0.6,
    };

    /// Bands of the canned default result.
    pub const DEFAULT_RESULT: BandPowers = BandPowers {
        delta: 0.45,
        theta: 0.32,
        alpha: 0.78,
        beta: 0.61,
    };

    /// Mean absolute amplitude of each quarter of the signal, in
    /// delta/theta/alpha/beta order.
    ///
    /// Signals of four samples or fewer get [`BandPowers::SHORT_SIGNAL`].
    pub fn from_signal(signal: &[f64]) -> Self {
        let n = signal.len();
        if n <= 4 {
            return Self::SHORT_SIGNAL;
        }
        let mean_abs = |s: &[f64]| s.iter().map(|v| v.abs()).sum::<f64>() / s.len() as f64;
        Self {
            delta: mean_abs(&signal[..n / 4]),
            theta: mean_abs(&signal[n / 4..n / 2]),
            alpha: mean_abs(&signal[n / 2..3 * n / 4]),
            beta: mean_abs(&signal[3 * n / 4..]),
        }
    }

    /// Sum of all four bands.
    pub fn total(&self) -> f64 {
        self.delta + self.theta + self.alpha + self.beta
    }

    /// Each band as a share of the total. An all-zero (or negative) total
    /// yields an even 0.25 split.
    pub fn shares(&self) -> BandPowers {
        let total = self.total();
        if total <= 0.0 || !total.is_finite() {
            return BandPowers {
                delta: 0.25,
                theta: 0.25,
                alpha: 0.25,
                beta: 0.25,
            };
        }
        BandPowers {
            delta: self.delta / total,
            theta: self.theta / total,
            alpha: self.alpha / total,
            beta: self.beta / total,
        }
    }
}

/// One probability (or percentage) per label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelProbabilities {
    /// Lucid Dream.
    #[serde(rename = "Lucid Dream")]
    pub lucid_dream: f64,
    /// Nightmare.
    #[serde(rename = "Nightmare")]
    pub nightmare: f64,
    /// Memory Recall.
    #[serde(rename = "Memory Recall")]
    pub memory_recall: f64,
    /// Normal Sleep.
    #[serde(rename = "Normal Sleep")]
    pub normal_sleep: f64,
}

impl LabelProbabilities {
    /// Build from values in [`DreamLabel::ALL`] order.
    pub fn from_array(v: [f64; 4]) -> Self {
        Self {
            lucid_dream: v[0],
            nightmare: v[1],
            memory_recall: v[2],
            normal_sleep: v[3],
        }
    }

    /// Values in [`DreamLabel::ALL`] order.
    pub fn to_array(&self) -> [f64; 4] {
        [
            self.lucid_dream,
            self.nightmare,
            self.memory_recall,
            self.normal_sleep,
        ]
    }

    /// Value for one label.
    pub fn get(&self, label: DreamLabel) -> f64 {
        self.to_array()[label.index()]
    }

    /// Convert 0–1 probabilities into percentages rounded to two decimals.
    pub fn as_percentages(&self) -> Self {
        Self::from_array(self.to_array().map(percent))
    }
}

/// Convert a 0–1 fraction to a percentage rounded to two decimals.
pub fn percent(fraction: f64) -> f64 {
    (fraction * 100.0 * 100.0).round() / 100.0
}

// ============================================================================
// Compute contract
// ============================================================================

/// Output of a [`ComputeFunction`].
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Winning label.
    pub label: DreamLabel,
    /// Probability of the winning label, in `[0, 1]`.
    pub confidence: f64,
    /// Per-band features.
    pub bands: BandPowers,
    /// Probability of every label, in `[0, 1]`, summing to 1.
    pub probabilities: LabelProbabilities,
}

/// A pure, deterministic, CPU-bound classifier.
///
/// Implementations must be `Send + Sync` so one instance can be shared by
/// every offload worker behind an `Arc`.
pub trait ComputeFunction: Send + Sync {
    /// Classify `signal`.
    ///
    /// # Errors
    ///
    /// Implementations return [`ComputeError`] for inputs they cannot
    /// classify. Callers substitute [`ComputeResult::fallback`].
    fn compute(&self, signal: &[f64]) -> Result<Classification, ComputeError>;
}

/// A completed classification plus a diagnostic echo of the input.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeResult {
    /// Winning label.
    pub label: DreamLabel,
    /// Probability of the winning label, in `[0, 1]`.
    pub confidence: f64,
    /// Per-band features.
    pub bands: BandPowers,
    /// Probability of every label, in `[0, 1]`.
    pub probabilities: LabelProbabilities,
    /// First [`SIGNAL_PREFIX_LEN`] samples of the classified signal.
    pub signal_prefix: Vec<f64>,
}

impl ComputeResult {
    /// Attach the signal echo to a classification.
    pub fn new(classification: Classification, signal: &[f64]) -> Self {
        Self {
            label: classification.label,
            confidence: classification.confidence,
            bands: classification.bands,
            probabilities: classification.probabilities,
            signal_prefix: signal.iter().take(SIGNAL_PREFIX_LEN).copied().collect(),
        }
    }

    /// The canned result served when classification fails.
    pub fn fallback() -> Self {
        Self {
            label: DreamLabel::LucidDream,
            confidence: 0.857,
            bands: BandPowers::DEFAULT_RESULT,
            probabilities: LabelProbabilities::from_array([0.857, 0.083, 0.042, 0.018]),
            signal_prefix: synthetic_signal(SIGNAL_PREFIX_LEN),
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse an uploaded file into a numeric signal.
///
/// Decodes UTF-8 (a leading BOM is ignored; invalid UTF-8 is read as
/// Latin-1), treats `;` and tabs as commas, and collects every cell that
/// parses as a finite `f64`. Non-numeric cells are skipped.
///
/// # Errors
///
/// - [`ComputeError::EmptyInput`] if the text is empty after trimming.
/// - [`ComputeError::NoNumericValues`] if no cell parsed.
pub fn parse_signal(raw: &[u8]) -> Result<Vec<f64>, ComputeError> {
    let text = decode_text(raw);
    let text = text.trim();
    if text.is_empty() {
        return Err(ComputeError::EmptyInput);
    }

    let normalized = text.replace(|c| c == ';' || c == '\t', ",");
    let mut values = Vec::new();

    'lines: for line in normalized.lines().take(MAX_LINES) {
        for cell in line.split(',').take(MAX_CELLS_PER_LINE) {
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            if let Ok(v) = cell.parse::<f64>() {
                if v.is_finite() {
                    values.push(v);
                    if values.len() >= MAX_VALUES {
                        break 'lines;
                    }
                }
            }
        }
    }

    if values.is_empty() {
        return Err(ComputeError::NoNumericValues);
    }
    Ok(values)
}

fn decode_text(raw: &[u8]) -> String {
    let raw = raw.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        // Latin-1 maps every byte to the code point of the same value.
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

/// Deterministic pseudo-gaussian signal used in place of an unparseable upload.
///
/// Same `len` always yields the same samples (LCG seeded with a constant).
pub fn synthetic_signal(len: usize) -> Vec<f64> {
    let mut state: u64 = 0x1234_5678_9abc_def0;
    let mut next_uniform = move || {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    (0..len)
        .map(|_| {
            // Irwin–Hall with 12 terms: mean 6, variance 1.
            let sum: f64 = (0..12).map(|_| next_uniform()).sum();
            sum - 6.0
        })
        .collect()
}

// ============================================================================
// Default classifier
// ============================================================================

/// Summary statistics the classifier scores on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalFeatures {
    /// Arithmetic mean.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Maximum sample.
    pub max: f64,
    /// Minimum sample.
    pub min: f64,
    /// Median sample.
    pub median: f64,
    /// Mean absolute amplitude.
    pub mean_abs: f64,
    /// Fraction of strictly positive samples.
    pub positive_ratio: f64,
}

impl SignalFeatures {
    /// Compute features over `signal`. Returns `None` for an empty slice.
    pub fn extract(signal: &[f64]) -> Option<Self> {
        if signal.is_empty() {
            return None;
        }
        let n = signal.len() as f64;
        let mean = signal.iter().sum::<f64>() / n;
        let var = signal.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let max = signal.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = signal.iter().copied().fold(f64::INFINITY, f64::min);
        let mut sorted = signal.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        let mean_abs = signal.iter().map(|v| v.abs()).sum::<f64>() / n;
        let positive_ratio = signal.iter().filter(|v| **v > 0.0).count() as f64 / n;
        Some(Self {
            mean,
            std: var.sqrt(),
            max,
            min,
            median,
            mean_abs,
            positive_ratio,
        })
    }
}

/// Deterministic feature-based classifier.
///
/// Scores each label from band shares and amplitude statistics, then
/// normalises with a softmax. This is a stand-in for a trained model: it
/// is reproducible and cheap, and makes no claim about dream semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalClassifier;

impl SignalClassifier {
    /// Create the classifier.
    pub fn new() -> Self {
        Self
    }
}

impl ComputeFunction for SignalClassifier {
    fn compute(&self, signal: &[f64]) -> Result<Classification, ComputeError> {
        let window = &signal[..signal.len().min(CLASSIFY_WINDOW)];
        let features = SignalFeatures::extract(window).ok_or(ComputeError::EmptySignal)?;
        let bands = BandPowers::from_signal(signal);
        let shares = bands.shares();

        let spread = (features.max - features.min).abs().ln_1p();
        let logits = [
            4.0 * shares.alpha + 2.0 * shares.theta,
            4.0 * shares.beta + features.std.ln_1p(),
            4.0 * shares.theta + features.positive_ratio + 0.1 * spread,
            4.0 * shares.delta + 1.0 / (1.0 + features.mean_abs) + 0.1 * features.median.tanh(),
        ];
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(ComputeError::Failed("non-finite score".to_string()));
        }

        let max_logit = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps = logits.map(|l| (l - max_logit).exp());
        let sum: f64 = exps.iter().sum();
        let probs = exps.map(|e| e / sum);

        let (idx, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            });

        Ok(Classification {
            label: DreamLabel::ALL[idx],
            confidence,
            bands,
            probabilities: LabelProbabilities::from_array(probs),
        })
    }
}
