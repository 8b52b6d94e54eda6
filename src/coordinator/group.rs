// =============================================================================
// Group membership: partition ownership for one consumer group
// =============================================================================
//
// Members join and leave; every change bumps the group generation and
// recomputes ownership by sorted round-robin:
//
//   owner(p) = sorted_members[p % member_count]
//
// A worker holds a `Lease` for one partition, stamped with the generation at
// which the partition last changed hands.  A lease stays valid across
// rebalances that leave the partition with the same owner; once the partition
// moves, the old lease is fenced and its commits fail.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::errors::PipelineError;

/// Right of one member to process (and commit) one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub member: String,
    pub partition: u32,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    generation: u64,
    members: BTreeSet<String>,
    /// partition -> (owner, generation at which the owner took it)
    owners: BTreeMap<u32, (String, u64)>,
}

/// In-process group coordinator shared by all workers of a stage.
pub struct GroupCoordinator {
    group: String,
    partitions: u32,
    state: RwLock<GroupState>,
}

impl GroupCoordinator {
    pub fn new(group: impl Into<String>, partitions: u32) -> Self {
        Self {
            group: group.into(),
            partitions,
            state: RwLock::new(GroupState::default()),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Join with a fresh member id.
    pub fn join(&self) -> String {
        let member = format!("{}-{}", self.group, Uuid::new_v4());
        self.join_as(&member);
        member
    }

    /// Join with a caller-chosen member id (idempotent).
    pub fn join_as(&self, member: &str) {
        let mut state = self.state.write();
        if state.members.insert(member.to_string()) {
            self.rebalance(&mut state);
            info!(group = %self.group, member, generation = state.generation, "member joined");
        }
    }

    pub fn leave(&self, member: &str) {
        let mut state = self.state.write();
        if state.members.remove(member) {
            self.rebalance(&mut state);
            info!(group = %self.group, member, generation = state.generation, "member left");
        }
    }

    fn rebalance(&self, state: &mut GroupState) {
        state.generation += 1;
        let members: Vec<String> = state.members.iter().cloned().collect();
        if members.is_empty() {
            state.owners.clear();
            return;
        }
        for partition in 0..self.partitions {
            let owner = &members[partition as usize % members.len()];
            let keep = matches!(state.owners.get(&partition), Some((current, _)) if current == owner);
            if !keep {
                state
                    .owners
                    .insert(partition, (owner.clone(), state.generation));
            }
        }
    }

    /// Leases currently held by `member`, ascending by partition.
    pub fn assignment(&self, member: &str) -> Vec<Lease> {
        let state = self.state.read();
        state
            .owners
            .iter()
            .filter(|(_, (owner, _))| owner == member)
            .map(|(partition, (owner, generation))| Lease {
                member: owner.clone(),
                partition: *partition,
                generation: *generation,
            })
            .collect()
    }

    #[cfg(test)]
    pub fn owner_of(&self, partition: u32) -> Option<String> {
        self.state.read().owners.get(&partition).map(|(m, _)| m.clone())
    }

    /// Whether `lease` is still the current ownership of its partition.
    pub fn is_current(&self, lease: &Lease) -> bool {
        self.check(lease).is_ok()
    }

    /// `Err(Fenced)` unless `lease` is still current.
    pub fn check(&self, lease: &Lease) -> Result<(), PipelineError> {
        let state = self.state.read();
        match state.owners.get(&lease.partition) {
            Some((owner, generation)) if *owner == lease.member && *generation == lease.generation => Ok(()),
            _ => Err(PipelineError::Fenced {
                member: lease.member.clone(),
                partition: lease.partition,
                generation: lease.generation,
            }),
        }
    }
}
