use crate::config::{DoseEntry, DoseTrigger};
use crate::error::SimError;
use crate::propensity::{Species, SpeciesCounts};

/// Ordered dosing schedule consumed front to back. Entries fire at most once
/// and strictly in their configured order.
#[derive(Clone, Debug, Default)]
pub struct DosingController {
    entries: Vec<DoseEntry>,
    next_idx: usize,
}

impl DosingController {
    pub fn new(entries: Vec<DoseEntry>) -> Self {
        Self {
            entries,
            next_idx: 0,
        }
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.next_idx >= self.entries.len()
    }

    pub fn pending(&self) -> &[DoseEntry] {
        &self.entries[self.next_idx..]
    }

    pub fn fired_count(&self) -> usize {
        self.next_idx
    }

    pub fn entry(&self, idx: usize) -> Option<&DoseEntry> {
        self.entries.get(idx)
    }

    /// Index of the head entry if it fires no later than `horizon` given the
    /// current conversion. Errors when a later entry is already due while the
    /// head is not, since firing it would break the configured order.
    pub fn next_due(&self, horizon: f64, conversion: f64) -> Result<Option<usize>, SimError> {
        let Some(head) = self.entries.get(self.next_idx) else {
            return Ok(None);
        };
        if is_due(head.trigger, horizon, conversion) {
            return Ok(Some(self.next_idx));
        }
        // Entries of one trigger kind are ascending, so only the first later
        // entry of the other kind can overtake the head.
        let overtaking = self.entries[self.next_idx + 1..]
            .iter()
            .position(|e| !same_kind(e.trigger, head.trigger))
            .map(|offset| self.next_idx + 1 + offset);
        if let Some(idx) = overtaking {
            if is_due(self.entries[idx].trigger, horizon, conversion) {
                return Err(SimError::ScheduleOrder {
                    pending: self.next_idx,
                    due: idx,
                });
            }
        }
        Ok(None)
    }

    /// Applies entry `idx` to the species counts and marks it consumed.
    /// Returns the species that changed.
    pub fn fire(
        &mut self,
        idx: usize,
        counts: &mut SpeciesCounts,
    ) -> Result<(DoseEntry, Vec<Species>), SimError> {
        if idx != self.next_idx {
            return Err(SimError::ScheduleOrder {
                pending: self.next_idx,
                due: idx,
            });
        }
        let entry = *self.entries.get(idx).ok_or_else(|| {
            SimError::Invariant(format!("dose {idx} does not exist"))
        })?;
        let monomer = counts.monomer.checked_add(entry.monomer);
        let initiator = counts.initiator.checked_add(entry.initiator);
        let (Some(monomer), Some(initiator)) = (monomer, initiator) else {
            return Err(SimError::Invariant(format!("dose {idx} overflows species counts")));
        };
        let mut changed = Vec::with_capacity(2);
        if entry.monomer > 0 {
            changed.push(Species::Monomer);
        }
        if entry.initiator > 0 {
            changed.push(Species::Initiator);
        }
        counts.monomer = monomer;
        counts.initiator = initiator;
        self.next_idx += 1;
        Ok((entry, changed))
    }
}

#[inline]
fn is_due(trigger: DoseTrigger, horizon: f64, conversion: f64) -> bool {
    match trigger {
        DoseTrigger::Time(t) => t <= horizon,
        DoseTrigger::Conversion(c) => conversion >= c,
    }
}

#[inline]
fn same_kind(a: DoseTrigger, b: DoseTrigger) -> bool {
    matches!(
        (a, b),
        (DoseTrigger::Time(_), DoseTrigger::Time(_))
            | (DoseTrigger::Conversion(_), DoseTrigger::Conversion(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> DosingController {
        DosingController::new(vec![
            DoseEntry::at_time(1.0, 100),
            DoseEntry::at_conversion(0.5, 50).with_initiator(3),
            DoseEntry::at_time(4.0, 25),
        ])
    }

    #[test]
    fn head_fires_once_its_time_is_reached() {
        let ctl = controller();
        assert_eq!(ctl.next_due(0.5, 0.0).unwrap(), None);
        assert_eq!(ctl.next_due(1.0, 0.0).unwrap(), Some(0));
    }

    #[test]
    fn firing_adds_species_and_advances() {
        let mut ctl = controller();
        let mut counts = SpeciesCounts::default();
        let (entry, changed) = ctl.fire(0, &mut counts).unwrap();
        assert_eq!(entry.monomer, 100);
        assert_eq!(changed, vec![Species::Monomer]);
        assert_eq!(counts.monomer, 100);
        let (_, changed) = ctl.fire(1, &mut counts).unwrap();
        assert_eq!(changed, vec![Species::Monomer, Species::Initiator]);
        assert_eq!(counts.initiator, 3);
        assert_eq!(ctl.pending().len(), 1);
    }

    #[test]
    fn entries_cannot_fire_twice_or_out_of_order() {
        let mut ctl = controller();
        let mut counts = SpeciesCounts::default();
        assert!(matches!(
            ctl.fire(1, &mut counts),
            Err(SimError::ScheduleOrder { pending: 0, due: 1 })
        ));
        ctl.fire(0, &mut counts).unwrap();
        assert!(ctl.fire(0, &mut counts).is_err());
        assert_eq!(counts.monomer, 100);
    }

    #[test]
    fn later_trigger_overtaking_pending_head_is_reported() {
        let mut ctl = controller();
        let mut counts = SpeciesCounts::default();
        ctl.fire(0, &mut counts).unwrap();
        // Head waits for 50 % conversion, but the time dose at t = 4 is due.
        let err = ctl.next_due(4.5, 0.2).unwrap_err();
        assert!(matches!(err, SimError::ScheduleOrder { pending: 1, due: 2 }));
        assert_eq!(ctl.next_due(4.5, 0.6).unwrap(), Some(1));
    }

    #[test]
    fn conversion_trigger_is_checked_against_current_conversion() {
        let ctl = DosingController::new(vec![DoseEntry::at_conversion(0.25, 10)]);
        assert_eq!(ctl.next_due(f64::INFINITY, 0.24).unwrap(), None);
        assert_eq!(ctl.next_due(0.0, 0.25).unwrap(), Some(0));
    }

    #[test]
    fn empty_schedule_is_exhausted() {
        let ctl = DosingController::default();
        assert!(ctl.is_exhausted());
        assert_eq!(ctl.next_due(f64::INFINITY, 1.0).unwrap(), None);
    }
}
