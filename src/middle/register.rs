//! The register model.
//!
//! A register is identified structurally by its class (general / branch /
//! link), cluster index, and register number. Free-register search ranges
//! are architectural constants of the target ABI (spec §9 DESIGN NOTES:
//! "must be a compile-time constant in the target").

use derive_more::Display;
use std::collections::BTreeSet;

/// First and last (inclusive) indices of the ABI-reserved general-register
/// windows in cluster 0. Registers in these ranges are never handed out by
/// free-register search.
const FIXED_LOW: std::ops::RangeInclusive<u32> = 0..=10;
const FIXED_HIGH: std::ops::RangeInclusive<u32> = 56..=63;

/// Free-register search window for general registers.
const GENERAL_FREE_RANGE: std::ops::RangeInclusive<u32> = 11..=55;
/// Free-register search window for branch registers.
const BRANCH_FREE_RANGE: std::ops::RangeInclusive<u32> = 0..=7;

/// A single architectural register.
///
/// Equality and ordering are structural over `(class tag, cluster, n)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Register {
    #[display("$r{cluster}.{n}")]
    General { cluster: u32, n: u32 },
    #[display("$b{cluster}.{n}")]
    Branch { cluster: u32, n: u32 },
    #[display("$l{cluster}.{n}")]
    Link { cluster: u32, n: u32 },
}

impl Register {
    pub fn general(cluster: u32, n: u32) -> Register {
        Register::General { cluster, n }
    }

    pub fn branch(cluster: u32, n: u32) -> Register {
        Register::Branch { cluster, n }
    }

    pub fn link(cluster: u32, n: u32) -> Register {
        Register::Link { cluster, n }
    }

    /// The "discard" sink used by [`crate::middle::bundle::fix_same_reg_writes`]:
    /// general register 0 of cluster 0.
    pub fn discard() -> Register {
        Register::general(0, 0)
    }

    /// The stack pointer: general register 1 of cluster 0.
    pub fn stack_pointer() -> Register {
        Register::general(0, 1)
    }

    pub fn cluster(&self) -> u32 {
        match *self {
            Register::General { cluster, .. }
            | Register::Branch { cluster, .. }
            | Register::Link { cluster, .. } => cluster,
        }
    }

    pub fn is_general(&self) -> bool {
        matches!(self, Register::General { .. })
    }

    /// Is this register part of the ABI-fixed set (never chosen by free
    /// register search, always live across function boundaries)?
    pub fn is_fixed(&self) -> bool {
        match *self {
            Register::General { cluster: 0, n } => FIXED_LOW.contains(&n) || FIXED_HIGH.contains(&n),
            _ => false,
        }
    }

    /// Find a register of the same class as `self` that is not a member of
    /// `used`. Free-register search is always performed over cluster 0,
    /// regardless of which cluster `self` belongs to (see DESIGN.md, Open
    /// Question: free-register search cluster).
    pub fn get_free_reg(&self, used: &BTreeSet<Register>) -> Option<Register> {
        match self {
            Register::General { .. } => GENERAL_FREE_RANGE
                .filter(|&n| !FIXED_LOW.contains(&n) && !FIXED_HIGH.contains(&n))
                .map(|n| Register::general(0, n))
                .find(|r| !used.contains(r)),
            Register::Branch { .. } => BRANCH_FREE_RANGE
                .map(|n| Register::branch(0, n))
                .find(|r| !used.contains(r)),
            Register::Link { .. } => None,
        }
    }
}

/// The set of general registers reserved by the ABI in cluster 0.
pub fn fixed_regs() -> BTreeSet<Register> {
    FIXED_LOW
        .chain(FIXED_HIGH)
        .map(|n| Register::general(0, n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_input_grammar() {
        assert_eq!(Register::general(0, 11).to_string(), "$r0.11");
        assert_eq!(Register::branch(1, 2).to_string(), "$b1.2");
        assert_eq!(Register::link(0, 0).to_string(), "$l0.0");
    }

    #[test]
    fn fixed_regs_excluded_from_free_search() {
        let used = BTreeSet::new();
        for n in 0..=10u32 {
            assert_ne!(
                Register::general(0, 11).get_free_reg(&used),
                Some(Register::general(0, n))
            );
        }
    }

    #[test]
    fn free_general_register_skips_used() {
        let mut used = BTreeSet::new();
        used.insert(Register::general(0, 11));
        used.insert(Register::general(0, 12));
        assert_eq!(
            Register::general(0, 99).get_free_reg(&used),
            Some(Register::general(0, 13))
        );
    }

    #[test]
    fn free_register_search_is_cluster_0_always() {
        let used = BTreeSet::new();
        assert_eq!(
            Register::general(3, 20).get_free_reg(&used),
            Some(Register::general(0, 11))
        );
    }

    #[test]
    fn no_free_branch_register_when_all_used() {
        let used: BTreeSet<Register> = (0..=7u32).map(|n| Register::branch(0, n)).collect();
        assert_eq!(Register::branch(0, 0).get_free_reg(&used), None);
    }
}
