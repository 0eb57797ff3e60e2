//! Greedy lowest-cost-first matching.
//!
//! Repeatedly takes the cheapest remaining feasible pair whose paper and
//! student are both still free. Fast and easy to explain, but not optimal;
//! its predictions are labelled `MLGreedy` and never replace the exact ones.

use super::cost::{is_feasible, CostMatrix};

/// Column chosen for each row, or `None` when no feasible column was left.
///
/// Ties break on row index, then column index.
pub fn solve(cost: &CostMatrix) -> Vec<Option<usize>> {
    let mut pairs: Vec<(f64, usize, usize)> = (0..cost.rows())
        .flat_map(|i| (0..cost.cols()).map(move |j| (i, j)))
        .map(|(i, j)| (cost.get(i, j), i, j))
        .filter(|(c, _, _)| is_feasible(*c))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut row_to_col = vec![None; cost.rows()];
    let mut col_taken = vec![false; cost.cols()];
    for (_, i, j) in pairs {
        if row_to_col[i].is_none() && !col_taken[j] {
            row_to_col[i] = Some(j);
            col_taken[j] = true;
        }
    }
    row_to_col
}
