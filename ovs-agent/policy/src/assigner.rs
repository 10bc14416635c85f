use crate::{OutOfSpace, POLICY_BOTTOM_PRIORITY, POLICY_TOP_PRIORITY};
use ahash::AHashMap as HashMap;
use ovs_agent_core::Priority;
use std::{collections::BTreeMap, fmt, ops::Bound};
use tracing::debug;

/// Numeric re-assignments coincident with an insertion, keyed old → new.
/// The caller patches the data plane with exactly these moves.
pub type PriorityUpdates = HashMap<u16, u16>;

/// The outcome of [`PriorityAssigner::get_of_priority`].
#[derive(Debug)]
pub struct Assignment {
    /// The numeric priority now assigned to the requested rule priority.
    pub of_priority: u16,
    /// Every other entry that had to move to make room.
    pub updates: PriorityUpdates,
    /// Token restoring the assigner to its exact pre-call state, for when
    /// the data plane refuses the resulting flows.
    pub revert: Revert,
}

/// Pre-mutation state captured by a successful assignment. Passing it to
/// [`PriorityAssigner::revert`] restores both maps exactly; a token for a
/// call that assigned nothing new restores nothing.
#[must_use = "dropping the token forfeits rollback of the assignment"]
#[derive(Debug, Default)]
pub struct Revert(Option<Snapshot>);

#[derive(Debug)]
struct Snapshot {
    priority_map: BTreeMap<Priority, u16>,
    of_priority_map: BTreeMap<u16, Priority>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Sift {
    Up,
    Down,
}

/// Maintains the order-preserving bijection between rule priorities and the
/// numeric priorities programmed on the switch.
///
/// A smaller rule priority is a higher-precedence rule and holds a larger
/// numeric priority, so walking the numeric table in ascending order yields
/// rule priorities in descending order. Callers serialize access; the
/// borrow on `&mut self` enforces the single-writer discipline.
pub struct PriorityAssigner {
    /// Rule priority → numeric. Ordered so the logical neighbors of an
    /// unassigned priority are a range query away.
    priority_map: BTreeMap<Priority, u16>,
    /// Numeric → rule priority, the inverse of `priority_map`. Doubles as
    /// the sorted occupancy table consulted during sifts.
    of_priority_map: BTreeMap<u16, Priority>,
    initial_of_priority: Box<dyn Fn(&Priority, bool) -> u16 + Send + Sync>,
    single_tier: bool,
}

impl fmt::Debug for PriorityAssigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityAssigner")
            .field("priority_map", &self.priority_map)
            .field("of_priority_map", &self.of_priority_map)
            .field("single_tier", &self.single_tier)
            .finish_non_exhaustive()
    }
}

impl PriorityAssigner {
    pub fn new(
        initial_of_priority: impl Fn(&Priority, bool) -> u16 + Send + Sync + 'static,
        single_tier: bool,
    ) -> Self {
        Self {
            priority_map: BTreeMap::new(),
            of_priority_map: BTreeMap::new(),
            initial_of_priority: Box::new(initial_of_priority),
            single_tier,
        }
    }

    /// Total number of assignable numeric priorities.
    pub const fn capacity() -> usize {
        (POLICY_TOP_PRIORITY - POLICY_BOTTOM_PRIORITY) as usize + 1
    }

    pub fn len(&self) -> usize {
        self.priority_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priority_map.is_empty()
    }

    /// The numeric priorities currently in use, ascending.
    pub fn sorted_of_priorities(&self) -> Vec<u16> {
        self.of_priority_map.keys().copied().collect()
    }

    /// Ensures every priority in the batch is assigned. Idempotent: already
    /// assigned priorities are left untouched. Fails without mutating
    /// anything when the distinct priorities cannot fit the numeric range.
    ///
    /// Interior re-assignments are not reported: registration happens
    /// before any of the batch's flows exist on the switch, so there is
    /// nothing to patch.
    pub fn register_priorities(&mut self, priorities: &[Priority]) -> Result<(), OutOfSpace> {
        let new: std::collections::BTreeSet<_> = priorities
            .iter()
            .filter(|p| !self.priority_map.contains_key(*p))
            .collect();
        if self.priority_map.len() + new.len() > Self::capacity() {
            return Err(OutOfSpace);
        }
        for &p in priorities {
            if !self.priority_map.contains_key(&p) {
                self.assign(p)?;
            }
        }
        Ok(())
    }

    /// Returns the numeric priority for `p`, assigning one if necessary.
    /// Alongside the assignment come the coincident moves of other entries
    /// and a revert token; the caller applies the moves to the data plane
    /// and reverts if the plane refuses the result.
    pub fn get_of_priority(&mut self, p: Priority) -> Result<Assignment, OutOfSpace> {
        if let Some(&of_priority) = self.priority_map.get(&p) {
            return Ok(Assignment {
                of_priority,
                updates: PriorityUpdates::new(),
                revert: Revert(None),
            });
        }
        let snapshot = Snapshot {
            priority_map: self.priority_map.clone(),
            of_priority_map: self.of_priority_map.clone(),
        };
        let (of_priority, updates) = self.assign(p)?;
        Ok(Assignment {
            of_priority,
            updates,
            revert: Revert(Some(snapshot)),
        })
    }

    /// Restores the state captured by a prior assignment. A no-op token
    /// (from a call that assigned nothing) restores nothing.
    pub fn revert(&mut self, revert: Revert) {
        if let Some(snapshot) = revert.0 {
            self.priority_map = snapshot.priority_map;
            self.of_priority_map = snapshot.of_priority_map;
        }
    }

    /// Drops the mapping occupying `of_priority`, if any.
    pub fn release(&mut self, of_priority: u16) {
        if let Some(p) = self.of_priority_map.remove(&of_priority) {
            self.priority_map.remove(&p);
        }
    }

    /// Records the pair in both maps. The caller is responsible for having
    /// picked a slot that keeps the table order-consistent.
    pub(crate) fn update_priority_assignment(&mut self, of_priority: u16, p: Priority) {
        self.priority_map.insert(p, of_priority);
        self.of_priority_map.insert(of_priority, p);
    }

    fn assign(&mut self, p: Priority) -> Result<(u16, PriorityUpdates), OutOfSpace> {
        let (target, occupied) = self.get_insertion_point(&p);
        if !occupied && (POLICY_BOTTOM_PRIORITY..=POLICY_TOP_PRIORITY).contains(&target) {
            self.update_priority_assignment(target, p);
            return Ok((target, PriorityUpdates::new()));
        }
        self.reassign_priorities(target, p)
    }

    /// Picks the numeric slot `p` should occupy. `occupied == false` with an
    /// in-range slot means the caller may assign directly; anything else is
    /// routed through [`Self::reassign_priorities`] with the returned value
    /// as the sift target.
    fn get_insertion_point(&self, p: &Priority) -> (u16, bool) {
        let seed = (self.initial_of_priority)(p, self.single_tier);
        if self.of_priority_map.is_empty() {
            return (seed, false);
        }
        // The closest higher-precedence priority bounds p's slot from
        // above; the closest lower-precedence one bounds it from below.
        let above = self.priority_map.range(..*p).next_back().map(|(_, &n)| n);
        let below = self
            .priority_map
            .range((Bound::Excluded(*p), Bound::Unbounded))
            .next()
            .map(|(_, &n)| n);
        match (above, below) {
            (Some(above), Some(below)) => {
                if above - below > 1 {
                    // Room in the open interval; prefer the seed when it
                    // lands inside.
                    let slot = if below < seed && seed < above {
                        seed
                    } else if seed >= above {
                        above - 1
                    } else {
                        below + 1
                    };
                    (slot, false)
                } else {
                    (above, true)
                }
            }
            // p sorts below everything assigned. At the bottom bound the
            // target clamps onto the occupied minimum so the sift-up rule
            // ("place at target") stays in range.
            (Some(min), None) => {
                if POLICY_BOTTOM_PRIORITY <= seed && seed < min {
                    (seed, false)
                } else if min > POLICY_BOTTOM_PRIORITY {
                    (min - 1, false)
                } else {
                    (POLICY_BOTTOM_PRIORITY, true)
                }
            }
            // p sorts above everything assigned. max + 1 may exceed the top
            // bound; the out-of-range value tells the caller a sift-down is
            // required.
            (None, Some(max)) => {
                if max < seed && seed <= POLICY_TOP_PRIORITY {
                    (seed, false)
                } else {
                    (max + 1, false)
                }
            }
            (None, None) => (seed, false),
        }
    }

    /// Opens a slot at `target` by shifting a contiguous run of entries one
    /// step toward the nearest gap. Sift-up places `p` at `target` itself;
    /// sift-down places it at `target - 1`. The cheaper direction wins; a
    /// direction whose run reaches the range bound before a gap is
    /// infeasible, and if both are the space is exhausted.
    fn reassign_priorities(
        &mut self,
        target: u16,
        p: Priority,
    ) -> Result<(u16, PriorityUpdates), OutOfSpace> {
        let up = (target <= POLICY_TOP_PRIORITY)
            .then(|| self.gap_above(target))
            .flatten()
            .map(|gap| (gap, gap - target));
        let down = (target > POLICY_BOTTOM_PRIORITY && target - 1 <= POLICY_TOP_PRIORITY)
            .then(|| self.gap_below(target - 1))
            .flatten()
            .map(|gap| (gap, target - 1 - gap));
        let (direction, gap) = match (up, down) {
            (None, None) => return Err(OutOfSpace),
            (Some((gap, _)), None) => (Sift::Up, gap),
            (None, Some((gap, _))) => (Sift::Down, gap),
            (Some((up_gap, up_cost)), Some((down_gap, down_cost))) => {
                if up_cost < down_cost {
                    (Sift::Up, up_gap)
                } else if down_cost < up_cost {
                    (Sift::Down, down_gap)
                } else if POLICY_TOP_PRIORITY - up_gap >= down_gap - POLICY_BOTTOM_PRIORITY {
                    // Tie: shift toward the bound with more headroom left.
                    (Sift::Up, up_gap)
                } else {
                    (Sift::Down, down_gap)
                }
            }
        };
        debug!(priority = %p, target, ?direction, "re-packing numeric priorities");
        let mut updates = PriorityUpdates::new();
        let assigned = match direction {
            Sift::Up => {
                let run: Vec<(u16, Priority)> = self
                    .of_priority_map
                    .range(target..gap)
                    .map(|(&n, &q)| (n, q))
                    .collect();
                for (n, q) in run.into_iter().rev() {
                    self.of_priority_map.remove(&n);
                    self.of_priority_map.insert(n + 1, q);
                    self.priority_map.insert(q, n + 1);
                    updates.insert(n, n + 1);
                }
                self.update_priority_assignment(target, p);
                target
            }
            Sift::Down => {
                let run: Vec<(u16, Priority)> = self
                    .of_priority_map
                    .range(gap + 1..target)
                    .map(|(&n, &q)| (n, q))
                    .collect();
                for (n, q) in run {
                    self.of_priority_map.remove(&n);
                    self.of_priority_map.insert(n - 1, q);
                    self.priority_map.insert(q, n - 1);
                    updates.insert(n, n - 1);
                }
                self.update_priority_assignment(target - 1, p);
                target - 1
            }
        };
        Ok((assigned, updates))
    }

    /// First free numeric at or above `from`, walking the occupied run.
    /// None when the run reaches the top bound without a gap.
    fn gap_above(&self, from: u16) -> Option<u16> {
        let mut expected = from;
        for &occupied in self.of_priority_map.range(from..=POLICY_TOP_PRIORITY).map(|(n, _)| n) {
            if occupied != expected {
                break;
            }
            if expected == POLICY_TOP_PRIORITY {
                return None;
            }
            expected += 1;
        }
        Some(expected)
    }

    /// First free numeric at or below `from`. None when the run reaches the
    /// bottom bound without a gap.
    fn gap_below(&self, from: u16) -> Option<u16> {
        let mut expected = from;
        for &occupied in self
            .of_priority_map
            .range(POLICY_BOTTOM_PRIORITY..=from)
            .rev()
            .map(|(n, _)| n)
        {
            if occupied != expected {
                break;
            }
            if expected == POLICY_BOTTOM_PRIORITY {
                return None;
            }
            expected -= 1;
        }
        Some(expected)
    }
}
