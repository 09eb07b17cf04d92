//! Bundles: groups of operations issued together, plus the intra-bundle
//! analyses that run before scheduling (spec §4.1).

use crate::common::Set;
use crate::middle::instruction::{Instruction, Operand};
use crate::middle::register::{fixed_regs, Register};

/// A label attached to the start of a bundle. A trailing `::` in the source
/// marks it exported (non-local); plain `:` is local to the function.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Label {
    pub name: String,
    pub is_local: bool,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_local {
            write!(f, "{}:", self.name)
        } else {
            write!(f, "{}::", self.name)
        }
    }
}

/// A real instruction bundle (as opposed to a synthetic fake).
#[derive(Clone, Debug, Default)]
pub struct InsnBundle {
    pub insns: Vec<Instruction>,
    pub labels: Vec<Label>,
}

/// One item of a function's bundle list. Entry/Exit/Call are synthetic
/// "fakes" that model ABI register traffic without carrying real operations
/// (spec §3 Bundle variants).
#[derive(Clone, Debug)]
pub enum Bundle {
    Insn(InsnBundle),
    Entry,
    Exit,
    /// `reads`/`writes` come from a `.call arg(...) ret(...)` pseudo-op when
    /// present; otherwise the ABI-fixed set is assumed (spec §11 item 3).
    Call {
        reads: Option<Set<Register>>,
        writes: Option<Set<Register>>,
    },
}

impl Bundle {
    pub fn insn(insns: Vec<Instruction>) -> Bundle {
        Bundle::Insn(InsnBundle { insns, labels: Vec::new() })
    }

    pub fn get_written(&self) -> Set<Register> {
        match self {
            Bundle::Insn(b) => b.insns.iter().flat_map(Instruction::get_written_registers).collect(),
            Bundle::Entry => fixed_regs(),
            Bundle::Exit => Set::new(),
            Bundle::Call { writes, .. } => writes.clone().unwrap_or_else(fixed_regs),
        }
    }

    pub fn get_read(&self) -> Set<Register> {
        match self {
            Bundle::Insn(b) => b.insns.iter().flat_map(Instruction::get_read_registers).collect(),
            Bundle::Entry => Set::new(),
            Bundle::Exit => fixed_regs(),
            Bundle::Call { reads, .. } => reads.clone().unwrap_or_else(fixed_regs),
        }
    }

    pub fn ends_bb(&self) -> bool {
        match self {
            Bundle::Insn(b) => b.insns.iter().any(Instruction::is_branch),
            _ => false,
        }
    }

    pub fn begins_bb(&self) -> bool {
        match self {
            Bundle::Insn(b) => !b.labels.is_empty(),
            _ => false,
        }
    }

    pub fn has_call(&self) -> bool {
        matches!(self, Bundle::Insn(b) if b.insns.iter().any(Instruction::is_call))
    }

    pub fn labels(&self) -> &[Label] {
        match self {
            Bundle::Insn(b) => &b.labels,
            _ => &[],
        }
    }

    pub fn rename_written(&mut self, from: Register, to: Register) {
        if let Bundle::Insn(b) = self {
            for insn in &mut b.insns {
                insn.change_dest_reg(from, to);
            }
        }
    }

    pub fn rename_read(&mut self, from: Register, to: Register) {
        if let Bundle::Insn(b) = self {
            for insn in &mut b.insns {
                insn.change_source_reg(from, to);
            }
        }
    }
}

/// Build the same-bundle producer/consumer graph used by [`has_cycle`] and
/// [`get_cycle_regs`]: an edge from the writer of a register to every reader
/// of it, plus an edge from every non-branch operation to every branch (a
/// branch must issue last within its bundle).
fn build_bundle_graph(insns: &[Instruction]) -> Vec<Set<usize>> {
    let n = insns.len();
    let mut adj = vec![Set::new(); n];
    for i in 0..n {
        let written = insns[i].get_written_registers();
        for j in 0..n {
            if i == j {
                continue;
            }
            let read = insns[j].get_read_registers();
            if written.intersection(&read).next().is_some() {
                adj[i].insert(j);
            }
        }
        if !insns[i].is_branch() {
            for (j, other) in insns.iter().enumerate() {
                if j != i && other.is_branch() {
                    adj[i].insert(j);
                }
            }
        }
    }
    adj
}

/// Indices left over after Kahn's algorithm removes all source nodes — the
/// residual set is non-empty exactly when the bundle's graph has a cycle.
fn residual_nodes(insns: &[Instruction]) -> Vec<usize> {
    let n = insns.len();
    let adj = build_bundle_graph(insns);
    let mut indegree = vec![0usize; n];
    for edges in &adj {
        for &j in edges {
            indegree[j] += 1;
        }
    }
    let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut removed = vec![false; n];
    while let Some(i) = queue.pop() {
        if removed[i] {
            continue;
        }
        removed[i] = true;
        for &j in &adj[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                queue.push(j);
            }
        }
    }
    (0..n).filter(|&i| !removed[i]).collect()
}

pub fn has_cycle(insns: &[Instruction]) -> bool {
    !residual_nodes(insns).is_empty()
}

pub fn get_cycle_regs(insns: &[Instruction]) -> Set<Register> {
    residual_nodes(insns)
        .into_iter()
        .flat_map(|i| insns[i].get_written_registers())
        .collect()
}

/// If the bundle contains exactly one load, the registers it defines that
/// some other operation in the same bundle also reads (spec §4.1).
pub fn has_load_dependency(insns: &[Instruction]) -> Set<Register> {
    let loads: Vec<usize> = (0..insns.len()).filter(|&i| insns[i].is_load()).collect();
    let [li] = loads[..] else { return Set::new() };
    let load_dests: Set<Register> = insns[li].dests.iter().filter_map(Operand::as_register).collect();
    let mut result = Set::new();
    for (i, insn) in insns.iter().enumerate() {
        if i == li {
            continue;
        }
        result.extend(load_dests.intersection(&insn.get_read_registers()).copied());
    }
    result
}

/// Retarget duplicate same-cycle writes to the discard register, last
/// operation to first (spec §4.1). Fails if the duplicate write targets a
/// non-general register, which cannot be safely discarded.
pub fn fix_same_reg_writes(insns: &mut [Instruction]) -> Result<(), crate::error::CoreError> {
    let mut seen: Set<Register> = Set::new();
    for insn in insns.iter_mut().rev() {
        for dest in insn.dests.iter_mut() {
            let Operand::Reg(r) = dest else { continue };
            if seen.contains(r) {
                if !r.is_general() {
                    return Err(crate::error::CoreError::NonGeneralDuplicateWrite { line: insn.line_no });
                }
                tracing::warn!(line = insn.line_no, register = %r, "duplicate write in bundle retargeted to discard register");
                *dest = Operand::Reg(Register::discard());
            } else {
                seen.insert(*r);
            }
        }
    }
    Ok(())
}

/// Fuse a trailing stack-pointer `add` into a `return` in the same bundle.
/// Returns `false` (and leaves the bundle unchanged) when the shapes don't
/// match, which the caller reports as a non-fatal warning (spec §7).
pub fn fix_stack_pop(insns: &mut Vec<Instruction>) -> bool {
    let ret_idx = insns.iter().position(Instruction::is_return);
    let add_idx = insns.iter().position(|i| {
        i.mnemonic == "add" && i.dests.first().and_then(Operand::as_register) == Some(Register::stack_pointer())
    });
    let (Some(ret_idx), Some(add_idx)) = (ret_idx, add_idx) else {
        return true;
    };
    let add = &insns[add_idx];
    let shape_ok = add.srcs.len() == 2
        && add.srcs[0] == Operand::Reg(Register::stack_pointer())
        && matches!(&add.srcs[1], Operand::Imm(_));
    if !shape_ok {
        tracing::warn!(line = insns[ret_idx].line_no, "return + stack-pop add present but not fusable");
        return false;
    }
    let delta = match &add.srcs[1] {
        Operand::Imm(s) => s.clone(),
        Operand::Reg(_) => unreachable!(),
    };
    let ret = &mut insns[ret_idx];
    if ret.srcs.len() >= 2 {
        if let Operand::Imm(existing) = &mut ret.srcs[1] {
            *existing = format!("{existing} + {delta}");
        }
    } else {
        ret.srcs.insert(0, Operand::Reg(Register::stack_pointer()));
        ret.srcs.insert(1, Operand::Imm(delta));
    }
    if ret.dests.is_empty() {
        ret.dests.push(Operand::Reg(Register::stack_pointer()));
    }
    insns.remove(add_idx);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::instruction::{ControlKind, InstructionKind};

    fn plain(line: usize, dests: Vec<Operand>, srcs: Vec<Operand>) -> Instruction {
        Instruction::new(0, "add".into(), dests, srcs, InstructionKind::Plain, String::new(), line)
    }

    #[test]
    fn no_cycle_in_straight_line_chain() {
        let r0 = Register::general(0, 11);
        let r1 = Register::general(0, 12);
        let insns = vec![
            plain(1, vec![Operand::Reg(r0)], vec![Operand::Imm("1".into())]),
            plain(2, vec![Operand::Reg(r1)], vec![Operand::Reg(r0)]),
        ];
        assert!(!has_cycle(&insns));
    }

    #[test]
    fn cycle_detected_on_mutual_dependency() {
        let r0 = Register::general(0, 11);
        let r1 = Register::general(0, 12);
        let insns = vec![
            plain(1, vec![Operand::Reg(r0)], vec![Operand::Reg(r1)]),
            plain(2, vec![Operand::Reg(r1)], vec![Operand::Reg(r0)]),
        ];
        assert!(has_cycle(&insns));
        assert_eq!(get_cycle_regs(&insns), [r0, r1].into());
    }

    #[test]
    fn duplicate_write_retargets_earlier_to_discard() {
        let r = Register::general(0, 11);
        let mut insns = vec![
            plain(1, vec![Operand::Reg(r)], vec![Operand::Imm("1".into())]),
            plain(2, vec![Operand::Reg(r)], vec![Operand::Imm("2".into())]),
        ];
        fix_same_reg_writes(&mut insns).unwrap();
        assert_eq!(insns[0].dests[0], Operand::Reg(Register::discard()));
        assert_eq!(insns[1].dests[0], Operand::Reg(r));
    }

    #[test]
    fn stack_pop_fuse_moves_delta_into_return() {
        let sp = Register::stack_pointer();
        let link = Register::link(0, 0);
        let mut insns = vec![
            plain(1, vec![Operand::Reg(sp)], vec![Operand::Reg(sp), Operand::Imm("32".into())]),
            Instruction::new(
                0,
                "return".into(),
                vec![],
                vec![Operand::Reg(link)],
                InstructionKind::Control(ControlKind::Return),
                String::new(),
                2,
            ),
        ];
        assert!(fix_stack_pop(&mut insns));
        assert_eq!(insns.len(), 1);
        assert_eq!(
            insns[0].srcs,
            vec![Operand::Reg(sp), Operand::Imm("32".into()), Operand::Reg(link)]
        );
    }

    #[test]
    fn unfusable_stack_pop_reports_failure_and_leaves_bundle() {
        let sp = Register::stack_pointer();
        let mut insns = vec![
            plain(1, vec![Operand::Reg(sp)], vec![Operand::Imm("7".into()), Operand::Imm("32".into())]),
            Instruction::new(
                0,
                "return".into(),
                vec![],
                vec![],
                InstructionKind::Control(ControlKind::Return),
                String::new(),
                2,
            ),
        ];
        assert!(!fix_stack_pop(&mut insns));
        assert_eq!(insns.len(), 2);
    }
}
