#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Maps the multi-field rule priorities of tiered network policies onto the
//! single `u16` priority space of the switch, preserving relative order and
//! re-packing assigned values when the space around an insertion point is
//! exhausted.

mod assigner;

pub use self::assigner::{Assignment, PriorityAssigner, PriorityUpdates, Revert};

use ovs_agent_core::Priority;

/// Bounds of the numeric priority range reserved for policy rules. Flows
/// outside this range belong to the fixed pipeline and are never touched by
/// the assigner.
pub const POLICY_BOTTOM_PRIORITY: u16 = 100;
pub const POLICY_TOP_PRIORITY: u16 = 65_000;

/// Seed-spacing offsets. Single-tier mode spreads policies wide apart so
/// consecutive policies rarely collide; multi-tier mode reserves room for
/// every tier and packs policies tighter within each.
pub const TIER_OFFSET_SINGLE_TIER: i64 = 0;
pub const PRIORITY_OFFSET_SINGLE_TIER: i64 = 640;
pub const TIER_OFFSET_MULTI_TIER: i64 = 250;
pub const PRIORITY_OFFSET_MULTI_TIER: i64 = 20;

/// The numeric priority space is exhausted: either every slot in the policy
/// range is assigned, or no sift direction can open the required slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no assignable OpenFlow priority remains in [{POLICY_BOTTOM_PRIORITY}, {POLICY_TOP_PRIORITY}]")]
pub struct OutOfSpace;

/// The default seed function: the preferred starting slot for a rule
/// priority, before any collision handling. Descends from the top of the
/// range as precedence drops, clamping at the bottom.
pub fn initial_of_priority(p: &Priority, single_tier: bool) -> u16 {
    let (tier_offset, priority_offset) = if single_tier {
        (TIER_OFFSET_SINGLE_TIER, PRIORITY_OFFSET_SINGLE_TIER)
    } else {
        (TIER_OFFSET_MULTI_TIER, PRIORITY_OFFSET_MULTI_TIER)
    };
    let offset = i64::from(p.tier) * tier_offset
        + p.policy.as_millis() * priority_offset / 1000
        + i64::from(p.rule);
    let span = i64::from(POLICY_TOP_PRIORITY - POLICY_BOTTOM_PRIORITY);
    if offset <= 0 {
        POLICY_TOP_PRIORITY
    } else if offset >= span {
        POLICY_BOTTOM_PRIORITY
    } else {
        POLICY_TOP_PRIORITY - offset as u16
    }
}
