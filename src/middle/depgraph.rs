//! Per-bundle dependency graph and backtracking intra-bundle packing search
//! (spec §4.2). This is the exact packability test behind
//! [`crate::back::bundle_scheduler::BundleScheduler::schedule2`].

use crate::common::Set;
use crate::config::MachineConfig;
use crate::middle::instruction::Instruction;

/// A node to place into a lane: either a real operation, or a "follow" node
/// trailing a long-immediate operation that must land in one of its
/// parent's borrow-eligible slots.
struct PackNode {
    insn_index: usize,
    parent: Option<usize>,
}

struct PackGraph {
    nodes: Vec<PackNode>,
    /// Direct-successor edges between real nodes: `succ[a]` contains `b`
    /// when `b` reads a register `a` writes, or `b` is a branch.
    succ: Vec<Set<usize>>,
    pred: Vec<Set<usize>>,
}

impl PackGraph {
    fn build(insns: &[Instruction]) -> PackGraph {
        let mut nodes = Vec::new();
        for (i, insn) in insns.iter().enumerate() {
            nodes.push(PackNode { insn_index: i, parent: None });
            if insn.has_long_imm() {
                let parent = nodes.len() - 1;
                nodes.push(PackNode { insn_index: i, parent: Some(parent) });
            }
        }
        let n = nodes.len();
        let mut succ = vec![Set::new(); n];
        let mut pred = vec![Set::new(); n];
        for a in 0..n {
            if nodes[a].parent.is_some() {
                continue;
            }
            let ai = nodes[a].insn_index;
            let written = insns[ai].get_written_registers();
            for b in 0..n {
                if a == b || nodes[b].parent.is_some() {
                    continue;
                }
                let bi = nodes[b].insn_index;
                if ai == bi {
                    continue;
                }
                let reads_written = written.intersection(&insns[bi].get_read_registers()).next().is_some();
                if reads_written || insns[ai].is_branch() {
                    succ[a].insert(b);
                    pred[b].insert(a);
                }
            }
        }
        PackGraph { nodes, succ, pred }
    }

    fn is_follow(&self, node: usize) -> bool {
        self.nodes[node].parent.is_some()
    }
}

fn floor_pair(x: usize) -> usize {
    x - (x % 2)
}

fn can_issue(
    graph: &PackGraph,
    node: usize,
    slot: usize,
    insns: &[Instruction],
    cfg: &MachineConfig,
    slots: &[Option<usize>],
    assigned: &Set<usize>,
) -> bool {
    if assigned.contains(&slot) {
        return false;
    }
    if let Some(parent) = graph.nodes[node].parent {
        let Some(parent_slot) = slots[parent] else { return false };
        return cfg.borrow[parent_slot].contains(&slot);
    }
    let insn = &insns[graph.nodes[node].insn_index];
    if !cfg.layout[slot].contains(&insn.get_fu()) {
        return false;
    }
    if insn.has_long_imm() {
        let free_borrow = cfg.borrow[slot].iter().any(|s| !assigned.contains(s));
        if !free_borrow {
            return false;
        }
    }
    true
}

/// Exact intra-bundle packability: can every node (operation, plus one
/// follow node per long-immediate operation) be assigned a distinct lane
/// consistent with the FU layout and borrow topology?
pub fn schedule2(insns: &[Instruction], cfg: &MachineConfig) -> bool {
    let graph = PackGraph::build(insns);
    let order: Vec<usize> = (0..graph.nodes.len()).collect();
    let mut slots: Vec<Option<usize>> = vec![None; graph.nodes.len()];
    let mut assigned: Set<usize> = Set::new();
    place(&graph, &order, 0, insns, cfg, &mut slots, &mut assigned)
}

fn place(
    graph: &PackGraph,
    order: &[usize],
    pos: usize,
    insns: &[Instruction],
    cfg: &MachineConfig,
    slots: &mut Vec<Option<usize>>,
    assigned: &mut Set<usize>,
) -> bool {
    if pos == order.len() {
        return true;
    }
    let node = order[pos];
    let n_lanes = cfg.lanes();

    let first = graph.succ[node]
        .iter()
        .filter_map(|&c| slots[c])
        .max()
        .map(floor_pair)
        .unwrap_or(0);
    let last = graph.pred[node]
        .iter()
        .filter_map(|&p| slots[p])
        .min()
        .map(|s| floor_pair(s) + 1)
        .unwrap_or(n_lanes.saturating_sub(1))
        .min(n_lanes.saturating_sub(1));

    if first > last {
        return false;
    }
    for slot in first..=last {
        if can_issue(graph, node, slot, insns, cfg, slots, assigned) {
            slots[node] = Some(slot);
            assigned.insert(slot);
            if place(graph, order, pos + 1, insns, cfg, slots, assigned) {
                return true;
            }
            assigned.remove(&slot);
            slots[node] = None;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::instruction::InstructionKind;
    use crate::middle::instruction::Operand;
    use crate::middle::register::Register;

    fn alu(line: usize) -> Instruction {
        Instruction::new(
            0,
            "add".into(),
            vec![Operand::Reg(Register::general(0, 11))],
            vec![Operand::Imm("1".into())],
            InstructionKind::Plain,
            String::new(),
            line,
        )
    }

    fn mem(line: usize) -> Instruction {
        Instruction::new(
            0,
            "ldw".into(),
            vec![Operand::Reg(Register::general(0, 11))],
            vec![Operand::Imm("0".into()), Operand::Reg(Register::general(0, 1))],
            InstructionKind::Load,
            String::new(),
            line,
        )
    }

    #[test]
    fn single_alu_op_packs() {
        let cfg = MachineConfig::default();
        assert!(schedule2(&[alu(1)], &cfg));
    }

    #[test]
    fn two_loads_exceed_mem_cap_of_one() {
        let cfg = MachineConfig::default();
        assert!(!schedule2(&[mem(1), mem(2)], &cfg));
    }

    #[test]
    fn long_immediate_requires_free_borrow_slot() {
        let mut cfg = MachineConfig::default();
        cfg.layout = vec![cfg.layout[0].clone(), cfg.layout[1].clone()];
        cfg.borrow = vec![vec![1], vec![0]];
        let long_imm_a = Instruction::new(
            0,
            "add".into(),
            vec![Operand::Reg(Register::general(0, 11))],
            vec![Operand::Imm("99999".into())],
            InstructionKind::Plain,
            String::new(),
            1,
        );
        let long_imm_b = Instruction::new(
            0,
            "add".into(),
            vec![Operand::Reg(Register::general(0, 12))],
            vec![Operand::Imm("99998".into())],
            InstructionKind::Plain,
            String::new(),
            2,
        );
        assert!(!schedule2(&[long_imm_a, long_imm_b], &cfg));
    }
}
