//! Partition of machines into activity tiers.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use indexmap::IndexSet;

use crate::common::{CpuArch, MachineId};
use crate::error::InvariantViolation;

/// Activity tier of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Running,
    Standby,
    Off,
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Tier::Running => write!(f, "running"),
            Tier::Standby => write!(f, "standby"),
            Tier::Off => write!(f, "off"),
        }
    }
}

/// Machines of one architecture, split by tier. Each set keeps the order in which machines entered it.
#[derive(Clone, Debug, Default)]
pub struct Pool {
    running: IndexSet<MachineId>,
    standby: IndexSet<MachineId>,
    off: IndexSet<MachineId>,
}

impl Pool {
    fn set(&self, tier: Tier) -> &IndexSet<MachineId> {
        match tier {
            Tier::Running => &self.running,
            Tier::Standby => &self.standby,
            Tier::Off => &self.off,
        }
    }

    fn set_mut(&mut self, tier: Tier) -> &mut IndexSet<MachineId> {
        match tier {
            Tier::Running => &mut self.running,
            Tier::Standby => &mut self.standby,
            Tier::Off => &mut self.off,
        }
    }
}

/// Partition of all known machines into disjoint tiers, organised as one pool per architecture.
///
/// Membership changes only through [`TierSet::move_to`]. Every registration or move stamps the machine with a
/// sequence number, so the order of entering a tier is also known across architectures.
#[derive(Clone, Debug, Default)]
pub struct TierSet {
    pools: BTreeMap<CpuArch, Pool>,
    membership: BTreeMap<MachineId, Membership>,
    next_seq: u64,
}

#[derive(Clone, Copy, Debug)]
struct Membership {
    arch: CpuArch,
    tier: Tier,
    seq: u64,
}

impl TierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a machine. Returns `false` if the machine is already registered.
    pub fn insert(&mut self, machine: MachineId, arch: CpuArch, tier: Tier) -> bool {
        if self.membership.contains_key(&machine) {
            return false;
        }
        self.pools.entry(arch).or_default().set_mut(tier).insert(machine);
        self.stamp(machine, arch, tier);
        true
    }

    /// Moves a machine to another tier, appending it at the end of that tier.
    /// Returns the previous tier or `None` for unknown machines.
    pub fn move_to(&mut self, machine: MachineId, tier: Tier) -> Option<Tier> {
        let Membership { arch, tier: prev, .. } = *self.membership.get(&machine)?;
        if prev == tier {
            return Some(prev);
        }
        let pool = self.pools.entry(arch).or_default();
        pool.set_mut(prev).shift_remove(&machine);
        pool.set_mut(tier).insert(machine);
        self.stamp(machine, arch, tier);
        Some(prev)
    }

    pub fn tier_of(&self, machine: MachineId) -> Option<Tier> {
        self.membership.get(&machine).map(|m| m.tier)
    }

    pub fn arch_of(&self, machine: MachineId) -> Option<CpuArch> {
        self.membership.get(&machine).map(|m| m.arch)
    }

    /// Machines of the architecture in the tier, in the order they entered it.
    pub fn machines(&self, arch: CpuArch, tier: Tier) -> Vec<MachineId> {
        self.pools
            .get(&arch)
            .map(|pool| pool.set(tier).iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Machines of all architectures in the tier, in the order they entered it.
    pub fn all(&self, tier: Tier) -> Vec<MachineId> {
        let mut machines: Vec<(u64, MachineId)> = self
            .membership
            .iter()
            .filter(|(_, m)| m.tier == tier)
            .map(|(machine, m)| (m.seq, *machine))
            .collect();
        machines.sort_unstable();
        machines.into_iter().map(|(_, machine)| machine).collect()
    }

    pub fn first_in(&self, arch: CpuArch, tier: Tier) -> Option<MachineId> {
        self.pools.get(&arch).and_then(|pool| pool.set(tier).iter().next().cloned())
    }

    pub fn count(&self, tier: Tier) -> usize {
        self.pools.values().map(|pool| pool.set(tier).len()).sum()
    }

    pub fn len(&self) -> usize {
        self.membership.len()
    }

    pub fn is_empty(&self) -> bool {
        self.membership.is_empty()
    }

    /// Checks that machines `0..total` are each in exactly one tier.
    pub fn check_partition(&self, total: u32) -> Result<(), InvariantViolation> {
        let mut seen = BTreeMap::<MachineId, u32>::new();
        for pool in self.pools.values() {
            for tier in [Tier::Running, Tier::Standby, Tier::Off] {
                for machine in pool.set(tier) {
                    *seen.entry(*machine).or_insert(0) += 1;
                }
            }
        }
        for machine in 0..total {
            match seen.get(&machine) {
                None => return Err(InvariantViolation::MachineWithoutTier(machine)),
                Some(count) if *count > 1 => return Err(InvariantViolation::MachineInSeveralTiers(machine)),
                _ => {}
            }
        }
        if seen.len() as u32 != total {
            return Err(InvariantViolation::TierCountMismatch {
                expected: total,
                actual: seen.len() as u32,
            });
        }
        Ok(())
    }

    fn stamp(&mut self, machine: MachineId, arch: CpuArch, tier: Tier) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.membership.insert(machine, Membership { arch, tier, seq });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_keeps_partition() {
        let mut tiers = TierSet::new();
        tiers.insert(0, CpuArch::X86, Tier::Running);
        tiers.insert(1, CpuArch::X86, Tier::Standby);
        tiers.insert(2, CpuArch::Arm, Tier::Off);
        assert!(!tiers.insert(2, CpuArch::Arm, Tier::Running));

        assert_eq!(tiers.move_to(1, Tier::Running), Some(Tier::Standby));
        assert_eq!(tiers.move_to(2, Tier::Standby), Some(Tier::Off));
        assert_eq!(tiers.move_to(7, Tier::Off), None);

        assert_eq!(tiers.machines(CpuArch::X86, Tier::Running), vec![0, 1]);
        assert_eq!(tiers.first_in(CpuArch::Arm, Tier::Standby), Some(2));
        assert_eq!(tiers.count(Tier::Off), 0);
        assert_eq!(tiers.check_partition(3), Ok(()));
    }

    #[test]
    fn test_all_follows_entry_order_across_architectures() {
        let mut tiers = TierSet::new();
        tiers.insert(0, CpuArch::X86, Tier::Running);
        tiers.insert(1, CpuArch::Arm, Tier::Running);
        tiers.insert(2, CpuArch::X86, Tier::Off);
        tiers.move_to(2, Tier::Running);
        assert_eq!(tiers.all(Tier::Running), vec![0, 1, 2]);

        tiers.move_to(0, Tier::Standby);
        tiers.move_to(0, Tier::Running);
        assert_eq!(tiers.all(Tier::Running), vec![1, 2, 0]);
    }

    #[test]
    fn test_missing_machine_is_reported() {
        let mut tiers = TierSet::new();
        tiers.insert(0, CpuArch::X86, Tier::Running);
        tiers.insert(2, CpuArch::X86, Tier::Off);
        assert_eq!(tiers.check_partition(3), Err(InvariantViolation::MachineWithoutTier(1)));
    }
}
