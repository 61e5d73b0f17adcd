use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::rng::VariateSource;

pub type ChainId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainStatus {
    Growing,
    Terminated,
}

#[derive(Clone, Copy, Debug)]
struct ChainRecord {
    dp: u64,
    status: ChainStatus,
    // Position inside `growing`; meaningless once terminated.
    slot: usize,
}

/// Authoritative store of every chain created during a run.
///
/// Records are indexed by [`ChainId`]. Growing chains are additionally kept in
/// a dense id array with swap-remove so that uniform selection and removal are
/// both O(1). Running sums of DP and DP² let the engine read Mn and Mw without
/// rescanning the population.
#[derive(Clone, Debug, Default)]
pub struct ChainPopulation {
    records: Vec<Option<ChainRecord>>,
    growing: Vec<ChainId>,
    chain_count: u64,
    dp_sum: u64,
    dp_sq_sum: u128,
}

impl ChainPopulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_chain(&mut self) -> ChainId {
        let id = self.records.len() as ChainId;
        self.records.push(Some(ChainRecord {
            dp: 1,
            status: ChainStatus::Growing,
            slot: self.growing.len(),
        }));
        self.growing.push(id);
        self.chain_count += 1;
        self.dp_sum += 1;
        self.dp_sq_sum += 1;
        id
    }

    pub fn grow(&mut self, id: ChainId) -> Result<(), SimError> {
        let record = self.growing_record_mut(id)?;
        let old = record.dp;
        record.dp += 1;
        self.dp_sum += 1;
        self.dp_sq_sum += 2 * old as u128 + 1;
        Ok(())
    }

    /// Merges two growing chains into one terminated chain carrying the summed
    /// DP. The merged chain keeps the identifier of `id_a`; `id_b` ceases to
    /// exist.
    pub fn terminate_combination(
        &mut self,
        id_a: ChainId,
        id_b: ChainId,
    ) -> Result<ChainId, SimError> {
        if id_a == id_b {
            return Err(SimError::InvalidChainState {
                id: id_a,
                reason: "a chain cannot combine with itself",
            });
        }
        let dp_a = self.growing_record(id_a)?.dp;
        let dp_b = self.growing_record(id_b)?.dp;

        self.detach_growing(id_a)?;
        self.detach_growing(id_b)?;
        self.records[id_b as usize] = None;
        if let Some(record) = self.records[id_a as usize].as_mut() {
            record.dp = dp_a + dp_b;
            record.status = ChainStatus::Terminated;
        }
        self.chain_count -= 1;
        self.dp_sq_sum += 2 * dp_a as u128 * dp_b as u128;
        Ok(id_a)
    }

    /// Terminates `id` (and `partner`, if given) without changing any DP.
    pub fn terminate_disproportionation(
        &mut self,
        id: ChainId,
        partner: Option<ChainId>,
    ) -> Result<(), SimError> {
        if partner == Some(id) {
            return Err(SimError::InvalidChainState {
                id,
                reason: "a chain cannot disproportionate with itself",
            });
        }
        self.growing_record(id)?;
        if let Some(other) = partner {
            self.growing_record(other)?;
        }
        self.finish(id)?;
        if let Some(other) = partner {
            self.finish(other)?;
        }
        Ok(())
    }

    pub fn select_random_growing_chain(
        &self,
        rng: &mut VariateSource,
    ) -> Result<ChainId, SimError> {
        if self.growing.is_empty() {
            return Err(SimError::Invariant(
                "chain selection requested from an empty growing set".into(),
            ));
        }
        Ok(self.growing[rng.index(self.growing.len())])
    }

    /// Draws two distinct growing chains without replacement.
    pub fn select_growing_pair(
        &self,
        rng: &mut VariateSource,
    ) -> Result<(ChainId, ChainId), SimError> {
        if self.growing.len() < 2 {
            return Err(SimError::Invariant(format!(
                "bimolecular termination selected with {} growing chain(s)",
                self.growing.len()
            )));
        }
        let (a, b) = rng.distinct_pair(self.growing.len());
        Ok((self.growing[a], self.growing[b]))
    }

    /// DP of every existing chain, growing and terminated, in creation order.
    pub fn snapshot(&self) -> Vec<u64> {
        self.records.iter().flatten().map(|r| r.dp).collect()
    }

    pub fn terminated_lengths(&self) -> Vec<u64> {
        self.records
            .iter()
            .flatten()
            .filter(|r| r.status == ChainStatus::Terminated)
            .map(|r| r.dp)
            .collect()
    }

    pub fn dp(&self, id: ChainId) -> Option<u64> {
        self.record(id).map(|r| r.dp)
    }

    pub fn status(&self, id: ChainId) -> Option<ChainStatus> {
        self.record(id).map(|r| r.status)
    }

    #[inline]
    pub fn growing_len(&self) -> usize {
        self.growing.len()
    }

    #[inline]
    pub fn chain_count(&self) -> u64 {
        self.chain_count
    }

    /// Total monomer units held in chains.
    #[inline]
    pub fn dp_sum(&self) -> u64 {
        self.dp_sum
    }

    #[inline]
    pub fn dp_sq_sum(&self) -> u128 {
        self.dp_sq_sum
    }

    pub fn number_average(&self) -> f64 {
        if self.chain_count == 0 {
            0.0
        } else {
            self.dp_sum as f64 / self.chain_count as f64
        }
    }

    pub fn weight_average(&self) -> f64 {
        if self.dp_sum == 0 {
            0.0
        } else {
            self.dp_sq_sum as f64 / self.dp_sum as f64
        }
    }

    fn record(&self, id: ChainId) -> Option<&ChainRecord> {
        self.records.get(id as usize).and_then(Option::as_ref)
    }

    fn growing_record(&self, id: ChainId) -> Result<&ChainRecord, SimError> {
        match self.record(id) {
            Some(record) if record.status == ChainStatus::Growing => Ok(record),
            Some(_) => Err(SimError::InvalidChainState {
                id,
                reason: "chain is already terminated",
            }),
            None => Err(SimError::InvalidChainState {
                id,
                reason: "no such chain",
            }),
        }
    }

    fn growing_record_mut(&mut self, id: ChainId) -> Result<&mut ChainRecord, SimError> {
        self.growing_record(id)?;
        self.records[id as usize]
            .as_mut()
            .ok_or(SimError::InvalidChainState {
                id,
                reason: "no such chain",
            })
    }

    fn finish(&mut self, id: ChainId) -> Result<(), SimError> {
        self.detach_growing(id)?;
        let record = self.records[id as usize]
            .as_mut()
            .ok_or(SimError::InvalidChainState {
                id,
                reason: "no such chain",
            })?;
        record.status = ChainStatus::Terminated;
        Ok(())
    }

    fn detach_growing(&mut self, id: ChainId) -> Result<(), SimError> {
        let slot = self.growing_record(id)?.slot;
        if self.growing.get(slot) != Some(&id) {
            return Err(SimError::Invariant(format!(
                "growing index for chain {id} points at slot {slot} held by another chain"
            )));
        }
        self.growing.swap_remove(slot);
        if let Some(&moved) = self.growing.get(slot) {
            if let Some(record) = self.records[moved as usize].as_mut() {
                record.slot = slot;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn population_with(dps: &[u64]) -> (ChainPopulation, Vec<ChainId>) {
        let mut population = ChainPopulation::new();
        let ids: Vec<_> = dps
            .iter()
            .map(|&dp| {
                let id = population.create_chain();
                for _ in 1..dp {
                    population.grow(id).unwrap();
                }
                id
            })
            .collect();
        (population, ids)
    }

    #[test]
    fn new_chain_starts_growing_at_dp_one() {
        let mut population = ChainPopulation::new();
        let id = population.create_chain();
        assert_eq!(population.dp(id), Some(1));
        assert_eq!(population.status(id), Some(ChainStatus::Growing));
        assert_eq!(population.growing_len(), 1);
    }

    #[test]
    fn combination_sums_lengths_and_keeps_running_moments() {
        let (mut population, ids) = population_with(&[3, 5, 2]);
        let merged = population.terminate_combination(ids[0], ids[1]).unwrap();
        assert_eq!(population.dp(merged), Some(8));
        assert_eq!(population.status(merged), Some(ChainStatus::Terminated));
        assert_eq!(population.dp(ids[1]), None);
        assert_eq!(population.growing_len(), 1);
        assert_eq!(population.chain_count(), 2);
        assert_eq!(population.dp_sum(), 10);
        assert_eq!(population.dp_sq_sum(), 64 + 4);
    }

    #[test]
    fn disproportionation_keeps_lengths() {
        let (mut population, ids) = population_with(&[4, 6, 1]);
        population
            .terminate_disproportionation(ids[2], Some(ids[0]))
            .unwrap();
        assert_eq!(population.terminated_lengths(), vec![4, 1]);
        assert_eq!(population.growing_len(), 1);
        assert_eq!(population.snapshot(), vec![4, 6, 1]);
    }

    #[test]
    fn growing_a_terminated_chain_fails() {
        let (mut population, ids) = population_with(&[2, 2]);
        population.terminate_disproportionation(ids[0], None).unwrap();
        let err = population.grow(ids[0]).unwrap_err();
        assert!(matches!(err, SimError::InvalidChainState { id, .. } if id == ids[0]));
    }

    #[test]
    fn swap_remove_keeps_slots_consistent() {
        let (mut population, ids) = population_with(&[1, 1, 1, 1, 1]);
        population.terminate_disproportionation(ids[0], None).unwrap();
        population.terminate_disproportionation(ids[3], None).unwrap();
        for &id in &[ids[1], ids[2], ids[4]] {
            population.grow(id).unwrap();
        }
        population.terminate_combination(ids[4], ids[1]).unwrap();
        assert_eq!(population.growing_len(), 1);
        assert_eq!(population.snapshot(), vec![1, 2, 1, 4]);
    }

    #[test]
    fn pair_selection_needs_two_growing_chains() {
        let (population, _) = population_with(&[7]);
        let mut rng = VariateSource::seeded(1);
        let err = population.select_growing_pair(&mut rng).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn selection_from_empty_set_fails() {
        let population = ChainPopulation::new();
        let mut rng = VariateSource::seeded(1);
        assert!(population.select_random_growing_chain(&mut rng).is_err());
    }
}
