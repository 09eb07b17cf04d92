//! A function: its bundle list, label table, control-flow graph, liveness,
//! and the register-rewrite passes that run over them (spec §4.4, §4.5).

use crate::common::{Map, Set};
use crate::error::{CoreError, CoreResult};
use crate::middle::bundle::{self, Bundle};
use crate::middle::instruction::{BranchTarget, Instruction};
use crate::middle::register::Register;

pub struct Function {
    pub name: String,
    pub bundles: Vec<Bundle>,
}

impl Function {
    pub fn new(name: String, bundles: Vec<Bundle>) -> Function {
        Function { name, bundles }
    }

    /// Label name -> `(bundle index, is_local)`.
    pub fn build_label_table(&self) -> Map<String, (usize, bool)> {
        let mut table = Map::new();
        for (i, bundle) in self.bundles.iter().enumerate() {
            for label in bundle.labels() {
                table.insert(label.name.clone(), (i, label.is_local));
            }
        }
        table
    }

    /// Successor indices per bundle (spec §4.4).
    pub fn build_successor_graph(&self) -> Vec<Set<usize>> {
        let n = self.bundles.len();
        let labels = self.build_label_table();
        let mut succ: Vec<Set<usize>> = vec![Set::new(); n];
        let link0 = Register::link(0, 0);
        for i in 0..n {
            match &self.bundles[i] {
                Bundle::Exit => {}
                Bundle::Entry | Bundle::Call { .. } => {
                    if i + 1 < n {
                        succ[i].insert(i + 1);
                    }
                }
                Bundle::Insn(b) => {
                    let targets = match b.insns.iter().find(|insn| insn.is_branch()) {
                        Some(insn) => insn.get_branch_destination(),
                        None => vec![BranchTarget::Next],
                    };
                    for target in targets {
                        match target {
                            BranchTarget::Next => {
                                if i + 1 < n {
                                    succ[i].insert(i + 1);
                                }
                            }
                            BranchTarget::Return => {
                                succ[i].insert(n - 1);
                            }
                            BranchTarget::Label(name) => match labels.get(&name) {
                                Some(&(idx, _)) => {
                                    succ[i].insert(idx);
                                }
                                // Unknown label: treated as a return (spec §4.4).
                                None => {
                                    succ[i].insert(n - 1);
                                }
                            },
                            BranchTarget::Reg(r) if r == link0 => {
                                // Goto through the link register: over-approximate
                                // with every local label (spec §9 Open Question,
                                // preserved deliberately; see DESIGN.md).
                                for &(idx, is_local) in labels.values() {
                                    if is_local {
                                        succ[i].insert(idx);
                                    }
                                }
                            }
                            BranchTarget::Reg(_) => {
                                succ[i].insert(n - 1);
                            }
                        }
                    }
                }
            }
        }
        succ
    }

    pub fn build_predecessor_graph(&self) -> Vec<Set<usize>> {
        let succ = self.build_successor_graph();
        let mut pred: Vec<Set<usize>> = vec![Set::new(); succ.len()];
        for (i, outs) in succ.iter().enumerate() {
            for &j in outs {
                pred[j].insert(i);
            }
        }
        pred
    }

    /// Backwards fixpoint over the bundle CFG: `live[i] = (U live[succ] -
    /// written[i]) U read[i]` (spec §4.4).
    pub fn build_register_live_table(&self) -> Vec<Set<Register>> {
        let n = self.bundles.len();
        let succ = self.build_successor_graph();
        let written: Vec<Set<Register>> = self.bundles.iter().map(Bundle::get_written).collect();
        let read: Vec<Set<Register>> = self.bundles.iter().map(Bundle::get_read).collect();
        let mut live = vec![Set::new(); n];
        let mut changed = true;
        while changed {
            changed = false;
            for i in (0..n).rev() {
                let mut new_live: Set<Register> = Set::new();
                for &s in &succ[i] {
                    new_live.extend(live[s].iter().copied());
                }
                for r in &written[i] {
                    new_live.remove(r);
                }
                new_live.extend(read[i].iter().copied());
                if new_live != live[i] {
                    live[i] = new_live;
                    changed = true;
                }
            }
        }
        live
    }

    fn first_line_of(&self, bundle_idx: usize) -> usize {
        match &self.bundles[bundle_idx] {
            Bundle::Insn(b) => b.insns.first().map(|i| i.line_no).unwrap_or(0),
            _ => 0,
        }
    }

    fn forward_reads(&self, starts: &Set<usize>, succ: &[Set<usize>], reg: Register) -> Set<usize> {
        let mut result = Set::new();
        let mut visited: Set<usize> = Set::new();
        let mut queue: Vec<usize> = starts.iter().copied().collect();
        while let Some(b) = queue.pop() {
            if !visited.insert(b) {
                continue;
            }
            if self.bundles[b].get_read().contains(&reg) {
                result.insert(b);
            }
            if self.bundles[b].get_written().contains(&reg) {
                continue;
            }
            for &s in &succ[b] {
                queue.push(s);
            }
        }
        result
    }

    fn backward_defs(&self, starts: impl Iterator<Item = usize>, pred: &[Set<usize>], reg: Register) -> Set<usize> {
        let mut result = Set::new();
        let mut visited: Set<usize> = Set::new();
        let mut queue: Vec<usize> = starts.collect();
        while let Some(b) = queue.pop() {
            if !visited.insert(b) {
                continue;
            }
            if self.bundles[b].get_written().contains(&reg) {
                result.insert(b);
                continue;
            }
            for &p in &pred[b] {
                queue.push(p);
            }
        }
        result
    }

    /// Rename every occurrence of `reg` in its def-use cluster rooted at
    /// `index` to a freshly chosen register. Returns `false` (no mutation)
    /// when the cluster touches a fake bundle or no free register exists
    /// (spec §4.5).
    pub fn rewrite(&mut self, reg: Register, index: usize) -> bool {
        let succ = self.build_successor_graph();
        let pred = self.build_predecessor_graph();

        let mut defs: Set<usize> = Set::new();
        if self.bundles[index].get_written().contains(&reg) {
            defs.insert(index);
        }
        let mut uses: Set<usize> = Set::new();

        loop {
            let new_uses: Set<usize> = defs.iter().flat_map(|&d| self.forward_reads(&succ[d], &succ, reg)).collect();
            let new_defs: Set<usize> = new_uses.iter().flat_map(|&u| self.backward_defs(pred[u].iter().copied(), &pred, reg)).collect();
            let combined_defs: Set<usize> = defs.union(&new_defs).copied().collect();
            let combined_uses: Set<usize> = uses.union(&new_uses).copied().collect();
            if combined_defs == defs && combined_uses == uses {
                break;
            }
            defs = combined_defs;
            uses = combined_uses;
        }

        let cluster: Set<usize> = defs.union(&uses).copied().collect();
        for &b in &cluster {
            if matches!(self.bundles[b], Bundle::Entry | Bundle::Exit | Bundle::Call { .. }) {
                return false;
            }
        }

        let live = self.build_register_live_table();
        let mut used: Set<Register> = Set::new();
        for &b in &cluster {
            used.extend(self.bundles[b].get_written());
            used.extend(self.bundles[b].get_read());
        }
        for &d in &defs {
            used.extend(live[d].iter().copied());
        }

        let Some(new_reg) = reg.get_free_reg(&used) else {
            return false;
        };

        for &b in &cluster {
            self.bundles[b].rename_written(reg, new_reg);
            self.bundles[b].rename_read(reg, new_reg);
        }
        true
    }

    /// Fuse `return`+stack-pop `add` pairs in every bundle (spec §4.1, §11
    /// item: this is the first step of the §5 fix-up pipeline).
    pub fn fix_return_and_stack_pop(&mut self) {
        for bundle in &mut self.bundles {
            if let Bundle::Insn(b) = bundle {
                if b.insns.iter().any(Instruction::is_return) {
                    bundle::fix_stack_pop(&mut b.insns);
                }
            }
        }
    }

    pub fn fix_same_reg_writes(&mut self) -> CoreResult<()> {
        for bundle in &mut self.bundles {
            if let Bundle::Insn(b) = bundle {
                bundle::fix_same_reg_writes(&mut b.insns)?;
            }
        }
        Ok(())
    }

    /// Rewrite load destinations that are read elsewhere in the same
    /// bundle; best-effort, warns rather than failing (spec §8 allows
    /// rewriting to be impossible).
    pub fn fix_load_dependency(&mut self) {
        for i in 0..self.bundles.len() {
            let conflict = match &self.bundles[i] {
                Bundle::Insn(b) => bundle::has_load_dependency(&b.insns),
                _ => Set::new(),
            };
            let Some(&load_dest) = conflict.iter().next() else { continue };
            if self.rewrite(load_dest, i) {
                continue;
            }
            let mut fixed = false;
            for j in 0..self.bundles.len() {
                if j != i && self.bundles[j].get_written().contains(&load_dest) && self.rewrite(load_dest, j) {
                    fixed = true;
                    break;
                }
            }
            if !fixed {
                tracing::warn!(bundle = i, register = %load_dest, "could not rewrite load-use hazard");
            }
        }
    }

    /// Break intra-bundle dependency cycles by renaming one of the cycle's
    /// registers at a time until the cycle is gone (spec §4.5). Fatal if
    /// every candidate register in a cycle fails to rewrite (spec §7).
    pub fn fix_cycles(&mut self) -> CoreResult<()> {
        for i in 0..self.bundles.len() {
            loop {
                let has_cycle = match &self.bundles[i] {
                    Bundle::Insn(b) => bundle::has_cycle(&b.insns),
                    _ => false,
                };
                if !has_cycle {
                    break;
                }
                let candidates = match &self.bundles[i] {
                    Bundle::Insn(b) => bundle::get_cycle_regs(&b.insns),
                    _ => Set::new(),
                };
                let broke = candidates.iter().any(|&reg| self.rewrite(reg, i));
                if !broke {
                    return Err(CoreError::UnschedulableBlock { first_line: self.first_line_of(i) });
                }
            }
        }
        Ok(())
    }
}
