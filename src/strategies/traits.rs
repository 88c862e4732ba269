// src/strategies/traits.rs
use crate::types::{CarrySide, Decision, Snapshot};

pub trait Strategy: Send + Sync {
    fn name(&self) -> String;

    // Flat: should we open, and on which side?
    fn decide_open(&self, snap: &Snapshot) -> Decision;

    // In position: should the held side be closed?
    fn should_close(&self, snap: &Snapshot, current_side: CarrySide) -> Decision;

    /// (prem_gap, fund_gap) to the entry thresholds, never negative. Diagnostics only.
    fn entry_gaps(&self, snap: &Snapshot) -> (f64, f64);

    fn decide(&self, snap: &Snapshot, current_side: Option<CarrySide>) -> Decision {
        match current_side {
            None => self.decide_open(snap),
            Some(side) => self.should_close(snap, side),
        }
    }
}
