//! ID matching: assign identified-page classifier output to classlist entries.
//!
//! This is a batch barrier. It runs once over every paper the ingestion
//! runs have accumulated, because the optimality guarantee holds for the
//! whole batch and not for any incremental slice of it.
//!
//! ```text
//! PaperDigits[] ──▶ cost ──▶ pad ──▶ lap (MLLAP, primary)
//! Classlist[]          └──────────▶ greedy (MLGreedy, secondary)
//! ```
//!
//! Every prediction is a proposal. Predictions over the review threshold,
//! or (with [`TieBreak::FlagForReview`]) not unique among optimal
//! assignments, carry `needs_review = true`.

pub mod cost;
pub mod greedy;
pub mod lap;

pub use cost::{CostMatrix, INFEASIBLE_COST};

use crate::config::{MatchConfig, TieBreak};
use crate::error::MatchError;
use crate::model::{ClasslistEntry, Method, Prediction};
use crate::pipeline::classify::PaperDigits;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Input to one matching run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRequest {
    /// Classifier output per paper.
    pub papers: Vec<PaperDigits>,
    /// Validated classlist (see [`crate::roster::load_classlist`]).
    pub roster: Vec<ClasslistEntry>,
    /// Papers already confirmed to a student, keyed by paper number.
    /// Both sides are removed from the assignment.
    #[serde(default)]
    pub already_identified: BTreeMap<u32, String>,
}

/// Output of one matching run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchReport {
    pub predictions: Vec<Prediction>,
    /// Per-paper failures. Never abort the batch.
    pub errors: Vec<MatchError>,
    /// Sum of `MLLAP` prediction costs.
    pub total_cost: f64,
}

impl MatchReport {
    pub fn by_method(&self, method: Method) -> impl Iterator<Item = &Prediction> {
        self.predictions.iter().filter(move |p| p.method == method)
    }
}

/// Run the matcher over a batch.
pub fn match_papers(request: &MatchRequest, config: &MatchConfig) -> MatchReport {
    let mut report = MatchReport::default();

    let roster_ids: HashSet<&str> = request
        .roster
        .iter()
        .map(|e| e.student_id.as_str())
        .collect();
    for (&paper, student_id) in &request.already_identified {
        if !roster_ids.contains(student_id.as_str()) {
            report.errors.push(MatchError::UnknownPrenamedStudent {
                paper,
                student_id: student_id.clone(),
            });
        }
    }

    let taken: HashSet<&str> = request
        .already_identified
        .values()
        .map(String::as_str)
        .collect();
    let students: Vec<&ClasslistEntry> = request
        .roster
        .iter()
        .filter(|e| !taken.contains(e.student_id.as_str()))
        .collect();

    let mut papers: Vec<&PaperDigits> = request
        .papers
        .iter()
        .filter(|p| !request.already_identified.contains_key(&p.paper_number))
        .collect();
    papers.sort_by_key(|p| p.paper_number);

    if papers.is_empty() {
        return report;
    }

    let owned_papers: Vec<PaperDigits> = papers.iter().map(|p| (*p).clone()).collect();
    let owned_students: Vec<ClasslistEntry> = students.iter().map(|s| (*s).clone()).collect();
    let matrix = CostMatrix::build(&owned_papers, &owned_students);
    info!(
        papers = matrix.rows(),
        students = matrix.cols(),
        "Solving ID assignment"
    );

    // ── MLLAP ────────────────────────────────────────────────────────────
    let padded = matrix.padded_square();
    let assignment = lap::solve(&padded);
    let ambiguous = match config.tie_break {
        TieBreak::FlagForReview => lap::ambiguous_rows(&padded, &assignment),
        TieBreak::SolverOrder => vec![false; padded.rows()],
    };

    for (row, paper) in papers.iter().enumerate() {
        let col = assignment.row_to_col[row];
        let cost = padded.get(row, col);
        if col >= students.len() || !cost::is_feasible(cost) {
            let paper = paper.paper_number;
            if matrix.row(row).iter().any(|&c| cost::is_feasible(c)) {
                warn!(paper, "Every compatible classlist entry already assigned");
                report.errors.push(MatchError::RosterExhausted { paper });
            } else {
                warn!(paper, "No feasible classlist entry");
                report.errors.push(MatchError::AssignmentInfeasible { paper });
            }
            continue;
        }
        if ambiguous[row] {
            debug!(paper = paper.paper_number, "Assignment not unique among optima");
        }
        report.total_cost += cost;
        report.predictions.push(prediction(
            paper.paper_number,
            Method::Lap,
            students[col],
            cost,
            cost > config.review_cost_threshold || ambiguous[row],
        ));
    }

    // ── MLGreedy ─────────────────────────────────────────────────────────
    if config.run_greedy {
        for (row, col) in greedy::solve(&matrix).into_iter().enumerate() {
            if let Some(col) = col {
                let cost = matrix.get(row, col);
                report.predictions.push(prediction(
                    papers[row].paper_number,
                    Method::Greedy,
                    students[col],
                    cost,
                    cost > config.review_cost_threshold,
                ));
            }
        }
    }

    info!(
        predictions = report.predictions.len(),
        errors = report.errors.len(),
        total_cost = report.total_cost,
        "ID matching complete"
    );
    report
}

fn prediction(
    paper_number: u32,
    method: Method,
    student: &ClasslistEntry,
    cost: f64,
    needs_review: bool,
) -> Prediction {
    Prediction {
        paper_number,
        method,
        predicted_student_id: student.student_id.clone(),
        student_name: student.student_name.clone(),
        confidence_cost: cost,
        needs_review,
    }
}
