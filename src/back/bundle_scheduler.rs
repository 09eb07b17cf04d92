//! Packability and cost estimation for a candidate set of operations
//! (spec §4.3).

use crate::common::Map;
use crate::config::MachineConfig;
use crate::middle::depgraph;
use crate::middle::instruction::{FuClass, Instruction};

pub struct BundleScheduler<'a> {
    pub cfg: &'a MachineConfig,
}

impl<'a> BundleScheduler<'a> {
    pub fn new(cfg: &'a MachineConfig) -> BundleScheduler<'a> {
        BundleScheduler { cfg }
    }

    /// `sum of 1 + has_long_imm` over the candidate set.
    pub fn size(&self, insns: &[Instruction]) -> usize {
        insns.iter().map(|i| 1 + i.has_long_imm() as usize).sum()
    }

    fn cost2(width: usize, size: usize) -> usize {
        size / width + if size == 0 || size % width != 0 { 1 } else { 0 }
    }

    /// Estimated generic-binary footprint across three issue widths at
    /// once; the selection metric the rescheduler minimizes.
    pub fn cost(&self, size: usize) -> usize {
        Self::cost2(2, size) + Self::cost2(4, size) + Self::cost2(8, size)
    }

    /// Fast yes/no test: does `insns` fit a bundle at all, ignoring the
    /// exact packing search? Used as a cheap filter before `schedule2`.
    pub fn schedule(&self, insns: &[Instruction]) -> bool {
        if self.size(insns) > 8 {
            return false;
        }
        let mut counts: Map<FuClass, usize> = Map::new();
        for insn in insns {
            *counts.entry(insn.get_fu()).or_insert(0) += 1;
        }
        for (class, count) in counts {
            if count > *self.cfg.fus.get(&class).unwrap_or(&0) {
                return false;
            }
        }
        true
    }

    /// Exact packability via the intra-bundle backtracking search.
    pub fn schedule2(&self, insns: &[Instruction]) -> bool {
        depgraph::schedule2(insns, self.cfg)
    }
}
