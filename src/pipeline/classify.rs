//! Digit classification adapter.
//!
//! The digit model is an external oracle: given one digit cell it returns
//! ten log-likelihoods, one per digit class. Nothing here depends on a
//! model format; plug any implementation of [`DigitClassifier`] in.
//!
//! Only relative values matter to the matcher, so outputs may carry an
//! arbitrary additive constant. A failed cell is kept as `None` and later
//! costs as infinite rather than aborting the paper or the batch.

use crate::error::{ClassifierError, PageError};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-class log-likelihoods for a single digit cell.
pub type DigitScores = [f64; 10];

/// Probabilities below this are clamped before taking the log.
const PROB_FLOOR: f64 = 1e-12;

/// A pluggable digit-cell classifier.
pub trait DigitClassifier: Send + Sync {
    /// Return exactly ten log-likelihoods, index = digit.
    fn classify(&self, cell: &GrayImage) -> Result<Vec<f64>, ClassifierError>;
}

/// Classifier output for one paper's ID box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperDigits {
    pub paper_number: u32,
    /// One entry per digit position; `None` where classification failed.
    pub digits: Vec<Option<DigitScores>>,
}

/// Convert a probability vector into log-likelihoods.
///
/// Zero probabilities are floored so every score stays finite.
pub fn log_likelihoods_from_probabilities(probs: &[f64]) -> Vec<f64> {
    probs.iter().map(|p| p.max(PROB_FLOOR).ln()).collect()
}

/// Split an ID box into `n` equal-width digit cells, left to right.
///
/// The last cell absorbs any remainder. Returns an empty vector when the
/// box is narrower than `n` pixels.
pub fn split_digit_cells(id_box: &GrayImage, n: usize) -> Vec<GrayImage> {
    let (w, h) = id_box.dimensions();
    if n == 0 || (w as usize) < n || h == 0 {
        return Vec::new();
    }
    let cell_w = w / n as u32;
    (0..n as u32)
        .map(|i| {
            let x = i * cell_w;
            let width = if i + 1 == n as u32 { w - x } else { cell_w };
            image::imageops::crop_imm(id_box, x, 0, width, h).to_image()
        })
        .collect()
}

/// Classify every digit cell of a paper's ID box.
///
/// Never fails as a whole: each failing cell becomes `None` in the result
/// and a [`PageError::ClassifierFailed`] in the returned error list.
pub fn classify_id_box(
    id_box: &GrayImage,
    paper: u32,
    id_length: usize,
    classifier: &dyn DigitClassifier,
) -> (PaperDigits, Vec<PageError>) {
    let cells = split_digit_cells(id_box, id_length);
    let mut errors = Vec::new();

    if cells.len() != id_length {
        errors.push(PageError::ClassifierFailed {
            paper,
            position: 0,
            detail: format!(
                "ID box {}px wide cannot hold {} digit cells",
                id_box.width(),
                id_length
            ),
        });
        return (
            PaperDigits {
                paper_number: paper,
                digits: vec![None; id_length],
            },
            errors,
        );
    }

    let digits = cells
        .iter()
        .enumerate()
        .map(|(position, cell)| match score_cell(classifier, cell) {
            Ok(scores) => Some(scores),
            Err(e) => {
                warn!(paper, position, "Digit classification failed: {}", e);
                errors.push(PageError::ClassifierFailed {
                    paper,
                    position,
                    detail: e.to_string(),
                });
                None
            }
        })
        .collect();

    (
        PaperDigits {
            paper_number: paper,
            digits,
        },
        errors,
    )
}

fn score_cell(classifier: &dyn DigitClassifier, cell: &GrayImage) -> Result<DigitScores, ClassifierError> {
    let raw = classifier.classify(cell)?;
    let scores: DigitScores = raw
        .as_slice()
        .try_into()
        .map_err(|_| ClassifierError::WrongArity { got: raw.len() })?;
    if scores.iter().any(|s| s.is_nan()) {
        return Err(ClassifierError::Failed("NaN score".into()));
    }
    Ok(scores)
}
