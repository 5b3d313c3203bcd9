//! Corporate action conflict resolution

use super::{CorporateAction, CorporateActionKind};
use crate::error::EngineError;
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Two or more contradictory records for one (symbol, ex-date, kind)
#[derive(Debug, Clone, PartialEq)]
pub struct ActionConflict {
    pub kept: CorporateAction,
    pub discarded: Vec<CorporateAction>,
}

impl ActionConflict {
    /// Error describing this conflict, for the run's event stream
    pub fn to_error(&self) -> EngineError {
        EngineError::CorporateActionConflict {
            symbol: self.kept.symbol.clone(),
            ex_date: self.kept.ex_date,
            detail: format!(
                "{} record(s) for {} disagree; kept ratio={} amount={}",
                self.discarded.len() + 1,
                self.kept.kind,
                self.kept.ratio,
                self.kept.amount
            ),
        }
    }
}

/// Collapse duplicate and contradictory records.
///
/// Records are grouped by (symbol, ex-date, kind). Identical duplicates merge
/// silently. When terms differ the record with the latest `published` date
/// wins; equal publication dates fall back to the one listed last. The result
/// is ordered by ex-date, symbol, kind.
pub fn resolve_conflicts(
    actions: Vec<CorporateAction>,
) -> (Vec<CorporateAction>, Vec<ActionConflict>) {
    let mut groups: BTreeMap<(NaiveDate, String, CorporateActionKind), Vec<CorporateAction>> =
        BTreeMap::new();
    for action in actions {
        groups
            .entry((action.ex_date, action.symbol.clone(), action.kind))
            .or_default()
            .push(action);
    }

    let mut resolved = Vec::with_capacity(groups.len());
    let mut conflicts = Vec::new();

    for (_, mut records) in groups {
        // max_by_key returns the last maximum, which gives "listed last" on ties
        let winner_idx = records
            .iter()
            .enumerate()
            .max_by_key(|(_, a)| a.published)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let kept = records.swap_remove(winner_idx);

        let discarded: Vec<CorporateAction> =
            records.into_iter().filter(|a| !a.same_terms(&kept)).collect();

        if !discarded.is_empty() {
            conflicts.push(ActionConflict {
                kept: kept.clone(),
                discarded,
            });
        }
        resolved.push(kept);
    }

    (resolved, conflicts)
}
