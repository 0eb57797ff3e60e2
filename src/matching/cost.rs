//! Cost aggregation: classifier log-likelihoods → assignment costs.
//!
//! The cost of giving paper `p` to student `s` is the negative sum, over
//! digit positions, of the log-likelihood the classifier gave to the digit
//! `s`'s id has at that position. Lower is better.
//!
//! Pairs that cannot be matched (length mismatch, failed digit cell,
//! non-finite score) get [`INFEASIBLE_COST`], a large finite sentinel that
//! keeps the solver well-defined.

use crate::model::ClasslistEntry;
use crate::pipeline::classify::{DigitScores, PaperDigits};

/// Sentinel for "no such pairing". Every pair at or above it is infeasible.
pub const INFEASIBLE_COST: f64 = 1.0e9;

pub fn is_feasible(cost: f64) -> bool {
    cost < INFEASIBLE_COST
}

/// Cost of matching one paper's digit scores to one student id.
pub fn pair_cost(digits: &[Option<DigitScores>], student_id: &str) -> f64 {
    if digits.len() != student_id.len() {
        return INFEASIBLE_COST;
    }
    let mut total = 0.0;
    for (scores, ch) in digits.iter().zip(student_id.bytes()) {
        let Some(scores) = scores else {
            return INFEASIBLE_COST;
        };
        if !ch.is_ascii_digit() {
            return INFEASIBLE_COST;
        }
        let ll = scores[(ch - b'0') as usize];
        if !ll.is_finite() {
            return INFEASIBLE_COST;
        }
        total -= ll;
    }
    total.min(INFEASIBLE_COST)
}

/// Dense row-major cost matrix. Rows are papers, columns are students.
#[derive(Debug, Clone, PartialEq)]
pub struct CostMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl CostMatrix {
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Build from nested rows. Ragged rows are padded with
    /// [`INFEASIBLE_COST`] up to the longest row.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Self {
        let cols = rows.iter().map(|r| r.as_ref().len()).max().unwrap_or(0);
        let mut m = Self::filled(rows.len(), cols, INFEASIBLE_COST);
        for (i, row) in rows.iter().enumerate() {
            for (j, &c) in row.as_ref().iter().enumerate() {
                m.set(i, j, c);
            }
        }
        m
    }

    /// Papers × students cost matrix.
    pub fn build(papers: &[PaperDigits], roster: &[ClasslistEntry]) -> Self {
        let mut m = Self::filled(papers.len(), roster.len(), INFEASIBLE_COST);
        for (i, paper) in papers.iter().enumerate() {
            for (j, student) in roster.iter().enumerate() {
                m.set(i, j, pair_cost(&paper.digits, &student.student_id));
            }
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Square copy with zero-cost dummy rows or columns appended.
    pub fn padded_square(&self) -> Self {
        let n = self.rows.max(self.cols);
        let mut m = Self::filled(n, n, 0.0);
        for i in 0..self.rows {
            for j in 0..self.cols {
                m.set(i, j, self.get(i, j));
            }
        }
        m
    }

    /// Total cost of a complete row → column assignment.
    pub fn assignment_cost(&self, row_to_col: &[usize]) -> f64 {
        row_to_col
            .iter()
            .enumerate()
            .map(|(i, &j)| self.get(i, j))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn certain(digits: &str) -> Vec<Option<DigitScores>> {
        digits
            .bytes()
            .map(|b| {
                let mut s = [-10.0; 10];
                s[(b - b'0') as usize] = 0.0;
                Some(s)
            })
            .collect()
    }

    #[test]
    fn exact_match_costs_nothing() {
        assert_eq!(pair_cost(&certain("1234"), "1234"), 0.0);
        assert_eq!(pair_cost(&certain("1234"), "1235"), 10.0);
    }

    #[test]
    fn length_mismatch_is_infeasible() {
        assert!(!is_feasible(pair_cost(&certain("123"), "1234")));
    }

    #[test]
    fn failed_digit_is_infeasible() {
        let mut d = certain("12");
        d[1] = None;
        assert_eq!(pair_cost(&d, "12"), INFEASIBLE_COST);
    }

    #[test]
    fn non_finite_score_is_infeasible() {
        let mut d = certain("12");
        if let Some(s) = d[0].as_mut() {
            s[1] = f64::NEG_INFINITY;
        }
        assert_eq!(pair_cost(&d, "12"), INFEASIBLE_COST);
    }

    #[test]
    fn additive_constant_preserves_order() {
        let shifted: Vec<_> = certain("42")
            .into_iter()
            .map(|s| s.map(|a| a.map(|v| v - 3.0)))
            .collect();
        assert!(pair_cost(&shifted, "42") < pair_cost(&shifted, "41"));
    }

    #[test]
    fn padding_adds_zero_cost_dummies() {
        let m = CostMatrix::from_rows(&[vec![1.0, 2.0, 3.0]]);
        let p = m.padded_square();
        assert_eq!((p.rows(), p.cols()), (3, 3));
        assert_eq!(p.row(0), &[1.0, 2.0, 3.0]);
        assert_eq!(p.row(2), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn ragged_rows_padded_infeasible() {
        let m = CostMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]);
        assert_eq!(m.get(0, 1), INFEASIBLE_COST);
    }
}
