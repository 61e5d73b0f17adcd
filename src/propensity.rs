use serde::{Deserialize, Serialize};

use crate::config::RateConstants;
use crate::error::SimError;

pub const CHANNEL_COUNT: usize = 5;
const SPECIES_COUNT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Initiation,
    Propagation,
    Combination,
    Disproportionation,
    Transfer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Species {
    Monomer,
    Initiator,
    Radical,
}

/// Scalar counts of every non-polymeric species. `radicals` mirrors the
/// number of growing chains held by the population store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesCounts {
    pub monomer: u64,
    pub initiator: u64,
    pub radicals: u64,
}

#[derive(Clone, Copy, Debug)]
struct SpeciesDelta {
    species: Species,
    delta: i64,
}

impl Channel {
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Initiation,
        Channel::Propagation,
        Channel::Combination,
        Channel::Disproportionation,
        Channel::Transfer,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    fn reads(self) -> &'static [Species] {
        match self {
            Channel::Initiation => &[Species::Monomer, Species::Initiator],
            Channel::Propagation | Channel::Transfer => &[Species::Monomer, Species::Radical],
            Channel::Combination | Channel::Disproportionation => &[Species::Radical],
        }
    }

    fn deltas(self) -> &'static [SpeciesDelta] {
        const INITIATION: [SpeciesDelta; 3] = [
            SpeciesDelta {
                species: Species::Monomer,
                delta: -1,
            },
            SpeciesDelta {
                species: Species::Initiator,
                delta: -1,
            },
            SpeciesDelta {
                species: Species::Radical,
                delta: 1,
            },
        ];
        const MONOMER_UPTAKE: [SpeciesDelta; 1] = [SpeciesDelta {
            species: Species::Monomer,
            delta: -1,
        }];
        const RADICAL_PAIR_LOSS: [SpeciesDelta; 1] = [SpeciesDelta {
            species: Species::Radical,
            delta: -2,
        }];
        match self {
            Channel::Initiation => &INITIATION,
            Channel::Propagation | Channel::Transfer => &MONOMER_UPTAKE,
            Channel::Combination | Channel::Disproportionation => &RADICAL_PAIR_LOSS,
        }
    }

    /// Species whose counts this channel changes when it fires.
    pub fn touched_species(self) -> impl Iterator<Item = Species> {
        self.deltas().iter().map(|d| d.species)
    }
}

impl Species {
    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl SpeciesCounts {
    #[inline]
    pub fn get(&self, species: Species) -> u64 {
        match species {
            Species::Monomer => self.monomer,
            Species::Initiator => self.initiator,
            Species::Radical => self.radicals,
        }
    }

    fn slot_mut(&mut self, species: Species) -> &mut u64 {
        match species {
            Species::Monomer => &mut self.monomer,
            Species::Initiator => &mut self.initiator,
            Species::Radical => &mut self.radicals,
        }
    }

    /// Counts after `channel` fires; fails rather than let any count go
    /// negative.
    pub fn after(&self, channel: Channel) -> Result<SpeciesCounts, SimError> {
        let mut next = *self;
        for delta in channel.deltas() {
            let slot = next.slot_mut(delta.species);
            *slot = slot.checked_add_signed(delta.delta).ok_or_else(|| {
                SimError::Invariant(format!(
                    "{:?} would drive {:?} count below zero",
                    channel, delta.species
                ))
            })?;
        }
        Ok(next)
    }

    /// All-or-nothing version of [`SpeciesCounts::after`].
    pub fn apply(&mut self, channel: Channel) -> Result<(), SimError> {
        *self = self.after(channel)?;
        Ok(())
    }
}

#[inline]
fn falling_factorial(value: u64, count: u32) -> f64 {
    match count {
        0 => 1.0,
        1 => value as f64,
        _ if value < count as u64 => 0.0,
        _ => (0..count as u64).map(|i| (value - i) as f64).product(),
    }
}

const LEAVES: usize = CHANNEL_COUNT.next_power_of_two();

/// Binary sum tree with one leaf per channel. Node `1` holds the total and
/// node `n` has children `2n` and `2n + 1`; leaves past the last channel stay
/// at zero.
#[derive(Clone, Debug)]
struct SumTree {
    nodes: [f64; 2 * LEAVES],
}

impl SumTree {
    fn from_leaves(values: &[f64; CHANNEL_COUNT]) -> Self {
        let mut nodes = [0.0; 2 * LEAVES];
        nodes[LEAVES..LEAVES + CHANNEL_COUNT].copy_from_slice(values);
        for node in (1..LEAVES).rev() {
            nodes[node] = nodes[2 * node] + nodes[2 * node + 1];
        }
        Self { nodes }
    }

    #[inline]
    fn total(&self) -> f64 {
        self.nodes[1]
    }

    fn set(&mut self, channel: Channel, value: f64) {
        let mut node = LEAVES + channel.index();
        self.nodes[node] = value;
        while node > 1 {
            node /= 2;
            self.nodes[node] = self.nodes[2 * node] + self.nodes[2 * node + 1];
        }
    }

    /// Channel whose cumulative range contains `target`. A subtree with zero
    /// weight is never entered, so rounding at the upper edge cannot land on
    /// a disabled channel or a padding leaf.
    fn pick(&self, mut target: f64) -> Channel {
        let mut node = 1;
        while node < LEAVES {
            let left = self.nodes[2 * node];
            let right = self.nodes[2 * node + 1];
            node = if right <= 0.0 || (left > 0.0 && target <= left) {
                2 * node
            } else {
                target -= left;
                2 * node + 1
            };
        }
        Channel::ALL
            .get(node - LEAVES)
            .copied()
            .unwrap_or(Channel::Transfer)
    }
}

/// Propensity of every reaction channel, maintained incrementally: after an
/// event only the channels that read a changed species are recomputed.
#[derive(Clone, Debug)]
pub struct PropensityModel {
    rates: [f64; CHANNEL_COUNT],
    propensities: [f64; CHANNEL_COUNT],
    tree: SumTree,
    // Bit `c` set when channel `c` reads the species / is touched by the channel.
    species_dependents: [u8; SPECIES_COUNT],
    channel_dependents: [u8; CHANNEL_COUNT],
}

impl PropensityModel {
    pub fn new(rates: &RateConstants) -> Self {
        let species_dependents = build_species_dependents();
        let channel_dependents = build_channel_dependents(&species_dependents);
        Self {
            rates: [
                rates.initiation,
                rates.propagation,
                rates.combination,
                rates.disproportionation,
                rates.transfer,
            ],
            propensities: [0.0; CHANNEL_COUNT],
            tree: SumTree::from_leaves(&[0.0; CHANNEL_COUNT]),
            species_dependents,
            channel_dependents,
        }
    }

    pub fn propensity_of(&self, channel: Channel, counts: &SpeciesCounts) -> f64 {
        let rate = self.rates[channel.index()];
        if rate == 0.0 {
            return 0.0;
        }
        let m = counts.monomer;
        let g = counts.radicals;
        match channel {
            Channel::Initiation => rate * counts.initiator as f64 * m as f64,
            Channel::Propagation | Channel::Transfer => rate * m as f64 * g as f64,
            Channel::Combination | Channel::Disproportionation => {
                rate * falling_factorial(g, 2) / 2.0
            }
        }
    }

    /// Full recomputation of every channel.
    pub fn rebuild(&mut self, counts: &SpeciesCounts) -> f64 {
        for channel in Channel::ALL {
            self.propensities[channel.index()] = self.propensity_of(channel, counts);
        }
        self.tree = SumTree::from_leaves(&self.propensities);
        self.tree.total()
    }

    /// Recomputes the channels that depend on anything `fired` changed.
    pub fn after_event(&mut self, fired: Channel, counts: &SpeciesCounts) -> f64 {
        self.refresh_mask(self.channel_dependents[fired.index()], counts);
        self.tree.total()
    }

    /// Recomputes the channels that read any of `changed`.
    pub fn after_species_change(&mut self, changed: &[Species], counts: &SpeciesCounts) -> f64 {
        let mask = changed
            .iter()
            .fold(0u8, |acc, s| acc | self.species_dependents[s.index()]);
        self.refresh_mask(mask, counts);
        self.tree.total()
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.tree.total()
    }

    #[inline]
    pub fn propensity(&self, channel: Channel) -> f64 {
        self.propensities[channel.index()]
    }

    /// Channel drawn with probability proportional to its propensity, given a
    /// uniform deviate in `[0, 1)`.
    pub fn select(&self, u: f64) -> Channel {
        self.tree.pick(u * self.tree.total())
    }

    /// Zero total propensity is only legitimate when nothing can propagate.
    pub fn check_not_underflowed(&self, counts: &SpeciesCounts) -> Result<(), SimError> {
        if self.total() <= 0.0 && counts.radicals > 0 && counts.monomer > 0 {
            return Err(SimError::InvalidState(format!(
                "all propensities are zero with {} growing chains and {} monomer units",
                counts.radicals, counts.monomer
            )));
        }
        Ok(())
    }

    fn refresh_mask(&mut self, mask: u8, counts: &SpeciesCounts) {
        for channel in Channel::ALL {
            if mask & (1 << channel.index()) != 0 {
                let value = self.propensity_of(channel, counts);
                self.propensities[channel.index()] = value;
                self.tree.set(channel, value);
            }
        }
    }
}

fn build_species_dependents() -> [u8; SPECIES_COUNT] {
    let mut dependents = [0u8; SPECIES_COUNT];
    for channel in Channel::ALL {
        for species in channel.reads() {
            dependents[species.index()] |= 1 << channel.index();
        }
    }
    dependents
}

fn build_channel_dependents(species_dependents: &[u8; SPECIES_COUNT]) -> [u8; CHANNEL_COUNT] {
    let mut dependents = [0u8; CHANNEL_COUNT];
    for channel in Channel::ALL {
        for species in channel.touched_species() {
            dependents[channel.index()] |= species_dependents[species.index()];
        }
    }
    dependents
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rates() -> RateConstants {
        RateConstants {
            initiation: 2.0,
            propagation: 3.0,
            combination: 4.0,
            disproportionation: 1.0,
            transfer: 0.5,
        }
    }

    fn counts(monomer: u64, initiator: u64, radicals: u64) -> SpeciesCounts {
        SpeciesCounts {
            monomer,
            initiator,
            radicals,
        }
    }

    #[test]
    fn falling_factorial_basics() {
        assert_eq!(falling_factorial(5, 0), 1.0);
        assert_eq!(falling_factorial(5, 2), 20.0);
        assert_eq!(falling_factorial(1, 2), 0.0);
    }

    #[test]
    fn mass_action_propensities() {
        let mut model = PropensityModel::new(&rates());
        let state = counts(10, 4, 3);
        let total = model.rebuild(&state);
        assert_relative_eq!(model.propensity(Channel::Initiation), 80.0);
        assert_relative_eq!(model.propensity(Channel::Propagation), 90.0);
        assert_relative_eq!(model.propensity(Channel::Combination), 12.0);
        assert_relative_eq!(model.propensity(Channel::Disproportionation), 3.0);
        assert_relative_eq!(model.propensity(Channel::Transfer), 15.0);
        assert_relative_eq!(total, 200.0);
    }

    #[test]
    fn single_radical_cannot_terminate() {
        let mut model = PropensityModel::new(&rates());
        model.rebuild(&counts(10, 0, 1));
        assert_eq!(model.propensity(Channel::Combination), 0.0);
        assert_eq!(model.propensity(Channel::Disproportionation), 0.0);
    }

    #[test]
    fn incremental_update_matches_full_rebuild() {
        let mut incremental = PropensityModel::new(&rates());
        let mut state = counts(50, 5, 0);
        incremental.rebuild(&state);
        let script = [
            Channel::Initiation,
            Channel::Initiation,
            Channel::Propagation,
            Channel::Initiation,
            Channel::Transfer,
            Channel::Combination,
            Channel::Propagation,
        ];
        for channel in script {
            state.apply(channel).unwrap();
            let total = incremental.after_event(channel, &state);
            let mut fresh = PropensityModel::new(&rates());
            assert_relative_eq!(total, fresh.rebuild(&state));
            for c in Channel::ALL {
                assert_relative_eq!(incremental.propensity(c), fresh.propensity(c));
            }
        }
    }

    #[test]
    fn species_change_refreshes_only_readers() {
        let mut model = PropensityModel::new(&rates());
        let mut state = counts(0, 2, 2);
        model.rebuild(&state);
        assert_eq!(model.propensity(Channel::Propagation), 0.0);
        state.monomer = 10;
        let total = model.after_species_change(&[Species::Monomer], &state);
        assert_relative_eq!(model.propensity(Channel::Propagation), 60.0);
        assert_relative_eq!(model.propensity(Channel::Initiation), 40.0);
        assert_relative_eq!(total, 40.0 + 60.0 + 4.0 + 1.0 + 10.0);
    }

    #[test]
    fn selection_follows_cumulative_propensity() {
        let mut model = PropensityModel::new(&rates());
        model.rebuild(&counts(10, 4, 3));
        assert_eq!(model.select(0.0), Channel::Initiation);
        assert_eq!(model.select(0.39), Channel::Initiation);
        assert_eq!(model.select(0.41), Channel::Propagation);
        assert_eq!(model.select(0.86), Channel::Combination);
        assert_eq!(model.select(0.9999), Channel::Transfer);
    }

    #[test]
    fn selection_skips_zero_channels_at_upper_edge() {
        let mut model = PropensityModel::new(&RateConstants {
            transfer: 0.0,
            disproportionation: 0.0,
            combination: 0.0,
            ..rates()
        });
        model.rebuild(&counts(10, 0, 1));
        assert_eq!(model.select(0.999_999_999), Channel::Propagation);
    }

    #[test]
    fn tree_overshoot_never_reaches_padding_leaves() {
        let mut tree = SumTree::from_leaves(&[1.0, 2.0, 0.0, 0.0, 3.0]);
        assert_relative_eq!(tree.total(), 6.0);
        assert_eq!(tree.pick(6.5), Channel::Transfer);
        tree.set(Channel::Transfer, 0.0);
        assert_relative_eq!(tree.total(), 3.0);
        assert_eq!(tree.pick(3.5), Channel::Propagation);
    }

    #[test]
    fn counts_refuse_to_go_negative() {
        let mut state = counts(0, 1, 0);
        let err = state.apply(Channel::Initiation).unwrap_err();
        assert!(matches!(err, SimError::Invariant(_)));
        assert_eq!(state, counts(0, 1, 0));
        let mut state = counts(5, 0, 1);
        assert!(state.apply(Channel::Combination).is_err());
    }

    #[test]
    fn dependency_masks_cover_touched_readers() {
        let model = PropensityModel::new(&rates());
        let propagation = model.channel_dependents[Channel::Propagation.index()];
        assert_eq!(propagation & (1 << Channel::Combination.index()), 0);
        assert_ne!(propagation & (1 << Channel::Transfer.index()), 0);
        assert_eq!(model.channel_dependents[Channel::Initiation.index()], 0b1_1111);
    }

    #[test]
    fn underflow_with_live_chains_is_an_error() {
        let state = counts(1, 0, 1);
        let mut frozen = PropensityModel::new(&rates());
        frozen.rates = [0.0; CHANNEL_COUNT];
        frozen.rebuild(&state);
        assert!(matches!(
            frozen.check_not_underflowed(&state),
            Err(SimError::InvalidState(_))
        ));
        assert!(frozen.check_not_underflowed(&counts(0, 0, 3)).is_ok());
    }
}
