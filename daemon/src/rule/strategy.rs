//! Priority ranks and affinity strategies
//!
//! Pure functions: everything here is deterministic and free of OS calls so the
//! rule engine can decide what to write before touching the process.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling priority, totally ordered from `Idle` to `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Idle,
        Priority::BelowNormal,
        Priority::Normal,
        Priority::AboveNormal,
        Priority::High,
    ];

    pub fn rank(self) -> u8 {
        match self {
            Priority::Idle => 0,
            Priority::BelowNormal => 1,
            Priority::Normal => 2,
            Priority::AboveNormal => 3,
            Priority::High => 4,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.get(rank as usize).copied()
    }

    /// Nice value written for this rank.
    pub fn nice(self) -> i32 {
        match self {
            Priority::Idle => 19,
            Priority::BelowNormal => 10,
            Priority::Normal => 0,
            Priority::AboveNormal => -5,
            Priority::High => -10,
        }
    }

    /// Bucket an arbitrary nice value into a rank.
    pub fn from_nice(nice: i32) -> Self {
        match nice {
            n if n >= 15 => Priority::Idle,
            n if n >= 5 => Priority::BelowNormal,
            n if n > -5 => Priority::Normal,
            n if n > -10 => Priority::AboveNormal,
            _ => Priority::High,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Idle => "idle",
            Priority::BelowNormal => "below_normal",
            Priority::Normal => "normal",
            Priority::AboveNormal => "above_normal",
            Priority::High => "high",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityStrategy {
    #[default]
    None,
    /// Only raise the priority.
    Increase,
    /// Only lower the priority.
    Decrease,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityStrategy {
    #[default]
    None,
    /// Never grow the number of cores the process already has.
    Limit,
    Force,
    /// One core per process, rotating through the target mask.
    Scatter,
}

/// Decide whether `current` should be replaced by `target` under `strategy`.
///
/// Returns the priority to write, or `None` when nothing should be written.
pub fn resolve_priority(
    current: Priority,
    target: Priority,
    strategy: PriorityStrategy,
) -> Option<Priority> {
    if current == target {
        return None;
    }
    let permitted = match strategy {
        PriorityStrategy::None => false,
        PriorityStrategy::Force => true,
        PriorityStrategy::Increase => target.rank() > current.rank(),
        PriorityStrategy::Decrease => target.rank() < current.rank(),
    };
    permitted.then_some(target)
}

pub fn bit_count(mask: u64) -> u32 {
    mask.count_ones()
}

/// Mask with the lowest `cores` bits set.
pub fn full_mask(cores: u32) -> u64 {
    match cores {
        0 => 1,
        c if c >= 64 => u64::MAX,
        c => (1u64 << c) - 1,
    }
}

/// Force strategy: the target verbatim, with zero meaning all cores.
pub fn force_affinity(target: u64, all_cores: u64) -> u64 {
    if target == 0 {
        all_cores
    } else {
        target
    }
}

/// Limit strategy.
///
/// When `target` selects more cores than `current`, bits of `target` that are
/// not in `current` are cleared from the lowest index upward until the counts
/// match. Since the excess can never exceed the non-overlapping bits, the
/// overlap with `current` survives intact.
pub fn limit_affinity(current: u64, target: u64) -> u64 {
    if current == 0 {
        return target;
    }
    if target == 0 {
        // all cores limited to the current count is the current mask itself
        return current;
    }

    let have = bit_count(current);
    let want = bit_count(target);
    if want <= have {
        return target;
    }

    let mut excess = want - have;
    let mut result = target;
    let mut candidates = target & !current;
    while excess > 0 && candidates != 0 {
        let lowest = candidates & candidates.wrapping_neg();
        result &= !lowest;
        candidates &= !lowest;
        excess -= 1;
    }
    result
}

/// Scatter strategy: pick a single core of `target` based on `cursor`.
pub fn scatter_affinity(target: u64, all_cores: u64, cursor: u32) -> u64 {
    let pool = force_affinity(target, all_cores);
    let count = bit_count(pool);
    if count == 0 {
        return 0;
    }
    let skip = cursor % count;
    let mut remaining = pool;
    for _ in 0..skip {
        remaining &= remaining - 1;
    }
    remaining & remaining.wrapping_neg()
}

/// Compute the mask to write for `strategy`, or `None` if the current mask is
/// already what the strategy wants.
pub fn resolve_affinity(
    current: u64,
    target: u64,
    strategy: AffinityStrategy,
    all_cores: u64,
    scatter_cursor: u32,
) -> Option<u64> {
    let desired = match strategy {
        AffinityStrategy::None => return None,
        AffinityStrategy::Force => force_affinity(target, all_cores),
        AffinityStrategy::Limit => limit_affinity(current, target),
        AffinityStrategy::Scatter => scatter_affinity(target, all_cores, scatter_cursor),
    };
    (desired != 0 && desired != current).then_some(desired)
}

/// Render a mask as a binary string, most significant core first.
pub fn format_mask(mask: u64, cores: u32) -> String {
    let width = cores.clamp(1, 64) as usize;
    format!("{:0width$b}", mask, width = width)
}
