//! Page routing: the page lifecycle state machine.
//!
//! ```text
//!              ┌─ decode valid, novel ───────────▶ ValidRouted ──┐
//!              ├─ decode valid, digest pushed ───▶ DuplicateRejected
//!              ├─ decode valid, TPV taken ───────▶ DuplicateRejected (reportable)
//! Unprocessed ─┼─ decode unknown ────────────────▶ UnknownRouted ├─ ack ─▶ Pushed
//!              ├─ decode wrong magic ────────────▶ WrongTestRouted ─ confirm ─▶ Discarded
//!              └─ copies disagree ───────────────▶ PendingReview
//! ```
//!
//! Routing consults the [`PushLedger`] for digests and TPV codes already
//! pushed, plus in-flight claims from other runs. The caller holds the
//! ledger lock for the whole bundle, so two pages can never race for the
//! same TPV code.

use crate::model::{ContentDigest, PageImage, RouteCategory, TpvCode};
use crate::pipeline::qr::DecodeResult;
use crate::workspace::PushLedger;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Where a page is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PageState {
    Unprocessed,
    ValidRouted {
        tpv: TpvCode,
    },
    UnknownRouted,
    WrongTestRouted {
        tpv: TpvCode,
    },
    /// QR copies disagree. Never auto-routed; waits for human triage.
    PendingReview {
        codes: Vec<TpvCode>,
    },
    /// Acknowledged by the push gateway.
    Pushed {
        category: RouteCategory,
        tpv: Option<TpvCode>,
    },
    DuplicateRejected {
        tpv: Option<TpvCode>,
        /// Different content claims the same paper/page/version.
        reportable: bool,
        existing: ContentDigest,
    },
    Discarded {
        category: RouteCategory,
    },
}

/// An action that is not allowed from the current state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot {action} a page in state '{from}'")]
pub struct TransitionError {
    pub from: &'static str,
    pub action: &'static str,
}

impl PageState {
    pub fn name(&self) -> &'static str {
        match self {
            PageState::Unprocessed => "unprocessed",
            PageState::ValidRouted { .. } => "valid-routed",
            PageState::UnknownRouted => "unknown-routed",
            PageState::WrongTestRouted { .. } => "wrong-test-routed",
            PageState::PendingReview { .. } => "pending-review",
            PageState::Pushed { .. } => "pushed",
            PageState::DuplicateRejected { .. } => "duplicate-rejected",
            PageState::Discarded { .. } => "discarded",
        }
    }

    /// The routing category, fixed at routing time and carried through to
    /// the terminal state. `None` only for unprocessed pages.
    ///
    /// Pending-review pages count as Unknown: they need a human before
    /// they can be identified.
    pub fn category(&self) -> Option<RouteCategory> {
        match self {
            PageState::Unprocessed => None,
            PageState::ValidRouted { .. } => Some(RouteCategory::Valid),
            PageState::UnknownRouted | PageState::PendingReview { .. } => {
                Some(RouteCategory::Unknown)
            }
            PageState::WrongTestRouted { .. } => Some(RouteCategory::WrongTest),
            PageState::Pushed { category, .. } | PageState::Discarded { category } => {
                Some(*category)
            }
            PageState::DuplicateRejected { .. } => Some(RouteCategory::Duplicate),
        }
    }

    /// Terminal states allow the owning bundle to be archived.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PageState::Pushed { .. }
                | PageState::DuplicateRejected { .. }
                | PageState::Discarded { .. }
                | PageState::PendingReview { .. }
        )
    }

    /// Routed but not yet acknowledged by the gateway.
    pub fn is_pushable(&self) -> bool {
        matches!(self, PageState::ValidRouted { .. } | PageState::UnknownRouted)
    }

    pub fn tpv(&self) -> Option<&TpvCode> {
        match self {
            PageState::ValidRouted { tpv } | PageState::WrongTestRouted { tpv } => Some(tpv),
            PageState::Pushed { tpv, .. } | PageState::DuplicateRejected { tpv, .. } => {
                tpv.as_ref()
            }
            _ => None,
        }
    }

    /// The only way into `Pushed`: a gateway acknowledgement.
    pub fn acknowledge(self) -> Result<PageState, TransitionError> {
        match self {
            PageState::ValidRouted { tpv } => Ok(PageState::Pushed {
                category: RouteCategory::Valid,
                tpv: Some(tpv),
            }),
            PageState::UnknownRouted => Ok(PageState::Pushed {
                category: RouteCategory::Unknown,
                tpv: None,
            }),
            other => Err(TransitionError {
                from: other.name(),
                action: "acknowledge",
            }),
        }
    }

    /// Operator-confirmed discard of a wrong-test or unknown page.
    pub fn discard(self) -> Result<PageState, TransitionError> {
        match self {
            PageState::WrongTestRouted { .. } => Ok(PageState::Discarded {
                category: RouteCategory::WrongTest,
            }),
            PageState::UnknownRouted => Ok(PageState::Discarded {
                category: RouteCategory::Unknown,
            }),
            other => Err(TransitionError {
                from: other.name(),
                action: "discard",
            }),
        }
    }
}

/// Routes the pages of one bundle against the push ledger.
///
/// Holds the ledger mutably for its lifetime; drop it to let other bundles
/// route. Claims made here stay in the ledger until the page is pushed or
/// the run calls [`PushLedger::release_claims`].
pub struct PageRouter<'a> {
    bundle: &'a str,
    ledger: &'a mut PushLedger,
}

impl<'a> PageRouter<'a> {
    pub fn new(bundle: &'a str, ledger: &'a mut PushLedger) -> Self {
        Self { bundle, ledger }
    }

    /// Move a page out of `Unprocessed` given its decode result.
    pub fn route(&mut self, page: &PageImage, decode: DecodeResult) -> PageState {
        let state = self.route_inner(page, decode);
        debug!(
            bundle = self.bundle,
            page = page.index,
            state = state.name(),
            "Page routed"
        );
        state
    }

    fn route_inner(&mut self, page: &PageImage, decode: DecodeResult) -> PageState {
        // Resume: this exact page was pushed by an earlier, interrupted run.
        if let Some(entry) = self.ledger.entry(&page.digest) {
            if entry.bundle == self.bundle && entry.page == page.index {
                return PageState::Pushed {
                    category: entry.category,
                    tpv: entry.tpv.clone(),
                };
            }
        }

        let tpv = match &decode {
            DecodeResult::Valid(tpv) | DecodeResult::WrongMagic(tpv) => Some(tpv.clone()),
            _ => None,
        };

        // Content-identical to something pushed or claimed elsewhere.
        if self.ledger.entry(&page.digest).is_some()
            || self.ledger.digest_claimed_by_other(&page.digest, self.bundle, page.index)
        {
            return PageState::DuplicateRejected {
                tpv,
                reportable: false,
                existing: page.digest.clone(),
            };
        }

        match decode {
            DecodeResult::Unknown => {
                self.ledger.claim_digest(&page.digest, self.bundle, page.index);
                PageState::UnknownRouted
            }
            DecodeResult::Inconsistent(codes) => {
                self.ledger.claim_digest(&page.digest, self.bundle, page.index);
                PageState::PendingReview { codes }
            }
            DecodeResult::WrongMagic(tpv) => {
                self.ledger.claim_digest(&page.digest, self.bundle, page.index);
                PageState::WrongTestRouted { tpv }
            }
            DecodeResult::Valid(tpv) => {
                if let Some(existing) = self.ledger.tpv_holder(&tpv.key()) {
                    if existing != page.digest {
                        return PageState::DuplicateRejected {
                            tpv: Some(tpv),
                            reportable: true,
                            existing,
                        };
                    }
                }
                self.ledger.claim_digest(&page.digest, self.bundle, page.index);
                self.ledger.claim_tpv(tpv.key(), &page.digest);
                PageState::ValidRouted { tpv }
            }
        }
    }
}
