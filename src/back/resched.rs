//! Basic-block list scheduler and whole-function reschedule (spec §4.6,
//! §4.7), plus the `-O2` legacy ALAP smoothing pass (spec §11 item 10).

use crate::back::bundle_scheduler::BundleScheduler;
use crate::common::{Map, Set};
use crate::config::MachineConfig;
use crate::error::{CoreError, CoreResult};
use crate::middle::bundle::{Bundle, InsnBundle, Label};
use crate::middle::function::Function;
use crate::middle::instruction::Instruction;
use crate::middle::register::Register;

/// One maximal straight-line run of operations between labels/branches.
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    pub insns: Vec<Instruction>,
    pub labels: Vec<Label>,
}

/// A unit of a function's bundle list as split for rescheduling: either a
/// schedulable basic block, or a fake bundle that passes through untouched.
pub enum Segment {
    Block(BasicBlock),
    Fake(Bundle),
}

/// Split a bundle list into basic blocks by labels (starts) and branches
/// (ends); fakes (Entry/Exit/Call) are segment boundaries of their own
/// (spec §4.7).
pub fn split_into_basic_blocks(bundles: Vec<Bundle>) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current: Option<BasicBlock> = None;
    for bundle in bundles {
        match bundle {
            Bundle::Entry | Bundle::Exit | Bundle::Call { .. } => {
                if let Some(b) = current.take() {
                    segments.push(Segment::Block(b));
                }
                segments.push(Segment::Fake(bundle));
            }
            Bundle::Insn(b) => {
                if !b.labels.is_empty() {
                    if let Some(prev) = current.take() {
                        segments.push(Segment::Block(prev));
                    }
                }
                let ends = b.insns.iter().any(Instruction::is_branch);
                let cur = current.get_or_insert_with(BasicBlock::default);
                if cur.insns.is_empty() && cur.labels.is_empty() {
                    cur.labels = b.labels.clone();
                }
                cur.insns.extend(b.insns);
                if ends {
                    segments.push(Segment::Block(current.take().unwrap()));
                }
            }
        }
    }
    if let Some(b) = current.take() {
        segments.push(Segment::Block(b));
    }
    segments
}

const LANES_CAP: usize = 8;

struct Graph {
    /// `succ[i]` = `(node, delay)` edges out of node `i`. Node `n` (where
    /// `n = insns.len()`) is the synthetic end-of-BB node.
    succ: Vec<Vec<(usize, u32)>>,
    pred: Vec<Vec<(usize, u32)>>,
}

fn build_graph(insns: &[Instruction], succ_regs: &Map<Register, u32>) -> Graph {
    let n = insns.len();
    let end = n;
    let mut succ = vec![Vec::new(); n + 1];
    let mut pred = vec![Vec::new(); n + 1];
    let add_edge = |succ: &mut Vec<Vec<(usize, u32)>>, pred: &mut Vec<Vec<(usize, u32)>>, from: usize, to: usize, delay: u32| {
        succ[from].push((to, delay));
        pred[to].push((from, delay));
    };

    let mut last_write: Map<Register, usize> = Map::new();
    let mut readers_since_write: Map<Register, Vec<usize>> = Map::new();
    for (i, insn) in insns.iter().enumerate() {
        for r in insn.get_read_registers() {
            if let Some(&w) = last_write.get(&r) {
                add_edge(&mut succ, &mut pred, w, i, insns[w].cost()); // RAW
            }
            readers_since_write.entry(r).or_default().push(i);
        }
        for r in insn.get_written_registers() {
            if let Some(&w) = last_write.get(&r) {
                add_edge(&mut succ, &mut pred, w, i, 1); // WAW
            }
            for &reader in readers_since_write.get(&r).cloned().unwrap_or_default().iter() {
                if reader != i {
                    add_edge(&mut succ, &mut pred, reader, i, 0); // WAR
                }
            }
            last_write.insert(r, i);
            readers_since_write.insert(r, Vec::new());
        }
    }

    // Memory ordering: consecutive loads/stores get a program-order WAW edge.
    let mut last_mem: Option<usize> = None;
    for (i, insn) in insns.iter().enumerate() {
        if insn.is_load() || insn.is_store() {
            if let Some(m) = last_mem {
                add_edge(&mut succ, &mut pred, m, i, 1);
            }
            last_mem = Some(i);
        }
    }

    // Control anchor: every non-branch forces every branch to issue after it.
    let branches: Vec<usize> = (0..n).filter(|&i| insns[i].is_branch()).collect();
    for i in 0..n {
        if insns[i].is_branch() {
            continue;
        }
        for &b in &branches {
            if b != i {
                add_edge(&mut succ, &mut pred, i, b, 0);
            }
        }
    }

    // Successor coupling: the end node reads succ_regs; a register needed
    // `distance` bundles into the successor gives its producer here that
    // much extra slack.
    for (&reg, &distance) in succ_regs {
        if let Some(&w) = last_write.get(&reg) {
            let delay = insns[w].cost().saturating_sub(distance);
            add_edge(&mut succ, &mut pred, w, end, delay);
        }
    }

    Graph { succ, pred }
}

fn compute_priorities(n: usize, graph: &Graph) -> Vec<u32> {
    let mut memo: Vec<Option<u32>> = vec![None; n + 1];
    fn go(i: usize, graph: &Graph, memo: &mut Vec<Option<u32>>) -> u32 {
        if let Some(v) = memo[i] {
            return v;
        }
        let v = graph.succ[i].iter().map(|&(s, d)| d + go(s, graph, memo)).max().unwrap_or(0);
        memo[i] = Some(v);
        v
    }
    (0..=n).map(|i| go(i, graph, &mut memo)).collect()
}

/// List-schedule one basic block (spec §4.6). `succ_regs` maps a register
/// the successor block reads early to how many bundles into that block the
/// read occurs.
pub fn reschedule_block(block: &BasicBlock, cfg: &MachineConfig, succ_regs: &Map<Register, u32>, first_line: usize) -> CoreResult<Vec<InsnBundle>> {
    let insns = &block.insns;
    let n = insns.len();
    if n == 0 {
        return Ok(vec![InsnBundle { insns: Vec::new(), labels: block.labels.clone() }]);
    }
    let end = n;
    let graph = build_graph(insns, succ_regs);
    let prio = compute_priorities(n, &graph);
    let scheduler = BundleScheduler::new(cfg);

    let mut total_length = prio[..n].iter().copied().max().unwrap_or(0).max(((n + 7) / 8).saturating_sub(1) as u32);

    let mut placed: Vec<Option<u32>> = vec![None; n + 1];
    let mut remaining_preds: Vec<usize> = (0..=n).map(|i| graph.pred[i].len()).collect();
    let mut to_schedule: Set<usize> = (0..n).collect();
    let mut ready: Set<usize> = (0..n).filter(|&i| remaining_preds[i] == 0).collect();
    let mut scheduled: Map<u32, Vec<usize>> = Map::new();
    let mut end_done = false;
    let mut extensions = 0usize;

    let node_start = |placed: &[Option<u32>], graph: &Graph, i: usize| -> u32 {
        graph.pred[i].iter().map(|&(p, d)| placed[p].expect("predecessor placed") + d).max().unwrap_or(0)
    };

    loop {
        if remaining_preds[end] == 0 && !end_done {
            let start = node_start(&placed, &graph, end);
            total_length = total_length.max(start);
            end_done = true;
        }
        if to_schedule.is_empty() {
            break;
        }

        let mut best: Option<(usize, u32)> = None; // (node, start)
        let mut best_key: Option<(i64, i64, usize)> = None;
        for &i in &ready {
            let start = node_start(&placed, &graph, i);
            let key = (
                total_length as i64 - prio[i] as i64 - start as i64,
                total_length as i64 - prio[i] as i64,
                insns[i].line_no,
            );
            if best_key.is_none() || key < *best_key.as_ref().unwrap() {
                best_key = Some(key);
                best = Some((i, start));
            }
        }
        let Some((node, start)) = best else {
            // Nothing ready yet but nodes remain: graph is malformed (would
            // imply a cycle survived earlier fix-up passes).
            return Err(CoreError::UnschedulableBlock { first_line });
        };

        let deadline = total_length.saturating_sub(prio[node]);
        let mut placement: Option<(i64, u32, usize)> = None;
        for cycle in start..=deadline.max(start) {
            let bucket = scheduled.entry(cycle).or_default();
            if bucket.len() >= LANES_CAP {
                continue;
            }
            let before: Vec<Instruction> = bucket.iter().map(|&i| insns[i].clone()).collect();
            let mut after = before.clone();
            after.push(insns[node].clone());
            if !scheduler.schedule2(&after) {
                continue;
            }
            let cost_before = scheduler.cost(scheduler.size(&before));
            let cost_after = scheduler.cost(scheduler.size(&after));
            let mut delta = cost_after as i64 - cost_before as i64;

            let forced_here = to_schedule
                .iter()
                .filter(|&&other| other != node && node_start(&placed, &graph, other) == cycle && total_length.saturating_sub(prio[other]) == cycle)
                .count();
            if scheduler.size(&after) + forced_here > 8 {
                delta += 2;
            }

            let key = (delta, cycle, after.len());
            if placement.is_none() || key < *placement.as_ref().unwrap() {
                placement = Some(key);
            }
        }

        let Some((_, cycle, _)) = placement else {
            extensions += 1;
            if extensions > n {
                return Err(CoreError::ScheduleBlowup {
                    first_line,
                    placed: n - to_schedule.len(),
                    total: n,
                });
            }
            total_length += 1;
            continue;
        };

        placed[node] = Some(cycle);
        scheduled.entry(cycle).or_default().push(node);
        to_schedule.remove(&node);
        ready.remove(&node);
        for &(s, _) in &graph.succ[node] {
            remaining_preds[s] -= 1;
            if remaining_preds[s] == 0 && s != end {
                ready.insert(s);
            }
        }
    }

    let max_cycle = *scheduled.keys().max().unwrap_or(&0);
    let bundle_count = (total_length.max(max_cycle) + 1) as usize;
    let mut bundles = vec![InsnBundle::default(); bundle_count];
    for (cycle, nodes) in &scheduled {
        let mut nodes = nodes.clone();
        nodes.sort_by_key(|&i| insns[i].line_no);
        bundles[*cycle as usize].insns = nodes.into_iter().map(|i| insns[i].clone()).collect();
    }
    bundles[0].labels = block.labels.clone();
    Ok(bundles)
}

/// The `-O2` legacy smoothing pass: for each node, recompute its ALAP bound
/// and try every legal cycle in `[start, alap]`, keeping the move with the
/// lowest incremental cost, iterating to a fixed point (spec §11 item 10).
pub fn do_asap(bundles: &mut Vec<InsnBundle>, cfg: &MachineConfig) {
    let scheduler = BundleScheduler::new(cfg);
    loop {
        let mut changed = false;
        let n = bundles.len();
        for i in 0..n {
            let insns_in_cycle: Vec<Instruction> = bundles[i].insns.clone();
            for insn in insns_in_cycle {
                let current = i;
                let alap = (current..n).find(|&c| !would_fit(bundles, cfg, c, &insn)).map(|c| c.saturating_sub(1)).unwrap_or(n - 1);
                let mut best_cycle = current;
                let mut best_cost = bundle_cost(&scheduler, &bundles[current].insns);
                for cycle in current..=alap {
                    if cycle == current {
                        continue;
                    }
                    if !would_fit(bundles, cfg, cycle, &insn) {
                        break;
                    }
                    let cost = bundle_cost(&scheduler, &bundles[cycle].insns) + scheduler.cost(scheduler.size(&[insn.clone()]));
                    if (cost as i64) < best_cost as i64 {
                        best_cost = cost;
                        best_cycle = cycle;
                    }
                }
                if best_cycle != current {
                    if let Some(pos) = bundles[current].insns.iter().position(|x| x.line_no == insn.line_no) {
                        bundles[current].insns.remove(pos);
                    }
                    bundles[best_cycle].insns.push(insn);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

fn would_fit(bundles: &[InsnBundle], cfg: &MachineConfig, cycle: usize, insn: &Instruction) -> bool {
    let scheduler = BundleScheduler::new(cfg);
    let mut tentative = bundles[cycle].insns.clone();
    tentative.push(insn.clone());
    scheduler.schedule2(&tentative)
}

fn bundle_cost(scheduler: &BundleScheduler, insns: &[Instruction]) -> usize {
    scheduler.cost(scheduler.size(insns))
}

/// Reschedule every basic block of a function, in reverse program order so
/// each block knows which registers its successor reads early (spec §4.7).
pub fn reschedule_function(func: &mut Function, cfg: &MachineConfig) -> CoreResult<()> {
    let bundles = std::mem::take(&mut func.bundles);
    let segments = split_into_basic_blocks(bundles);

    let mut rescheduled_blocks: Vec<Option<Vec<InsnBundle>>> = vec![None; segments.len()];
    let mut next_succ_regs: Map<Register, u32> = Map::new();

    for idx in (0..segments.len()).rev() {
        if let Segment::Block(block) = &segments[idx] {
            let first_line = block.insns.first().map(|i| i.line_no).unwrap_or(0);
            let mut new_bundles = reschedule_block(block, cfg, &next_succ_regs, first_line)?;
            if cfg.opt >= 2 {
                do_asap(&mut new_bundles, cfg);
            }
            next_succ_regs = successor_read_map(&new_bundles, cfg);
            rescheduled_blocks[idx] = Some(new_bundles);
        }
    }

    let mut out = Vec::new();
    for (idx, segment) in segments.into_iter().enumerate() {
        match segment {
            Segment::Fake(bundle) => out.push(bundle),
            Segment::Block(_) => {
                let new_bundles = rescheduled_blocks[idx].take().expect("every block rescheduled");
                out.extend(new_bundles.into_iter().map(Bundle::Insn));
            }
        }
    }
    func.bundles = out;
    Ok(())
}

/// Registers read in the first `max_latency - 1` bundles of a rescheduled
/// block, with the distance in bundles, for coupling into the predecessor's
/// schedule (spec §4.6).
fn successor_read_map(bundles: &[InsnBundle], _cfg: &MachineConfig) -> Map<Register, u32> {
    const MAX_LATENCY: usize = 2;
    let mut map = Map::new();
    for (distance, bundle) in bundles.iter().take(MAX_LATENCY.saturating_sub(1).max(1)).enumerate() {
        for insn in &bundle.insns {
            for reg in insn.get_read_registers() {
                map.entry(reg).or_insert(distance as u32);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::instruction::{ControlKind, InstructionKind, Operand};

    fn plain(line_no: usize, dests: Vec<Operand>, srcs: Vec<Operand>) -> Instruction {
        Instruction::new(0, "add".into(), dests, srcs, InstructionKind::Plain, String::new(), line_no)
    }

    fn load(line_no: usize, dest: Register, addr: Register) -> Instruction {
        Instruction::new(0, "ldw".into(), vec![Operand::Reg(dest)], vec![Operand::Imm("0".into()), Operand::Reg(addr)], InstructionKind::Load, String::new(), line_no)
    }

    fn branch(line_no: usize, src: Register) -> Instruction {
        Instruction::new(0, "br".into(), vec![], vec![Operand::Reg(src)], InstructionKind::Control(ControlKind::Branch), String::new(), line_no)
    }

    /// Scenario 1 (spec §8): a single ALU op schedules into one bundle.
    #[test]
    fn single_alu_op_schedules_into_one_bundle() {
        let r = Register::general(0, 11);
        let block = BasicBlock {
            insns: vec![plain(1, vec![Operand::Reg(r)], vec![Operand::Reg(r), Operand::Imm("1".into())])],
            labels: vec![],
        };
        let cfg = MachineConfig::default();
        let bundles = reschedule_block(&block, &cfg, &Map::new(), 1).unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].insns.len(), 1);
    }

    /// Scenario 5 (spec §8): two loads with `fus[Mem] = 1` cannot share a
    /// bundle and must spread across (at least) two cycles.
    #[test]
    fn mem_cap_spreads_two_loads_across_cycles() {
        let a = Register::general(0, 1);
        let d1 = Register::general(0, 11);
        let d2 = Register::general(0, 12);
        let block = BasicBlock {
            insns: vec![load(1, d1, a), load(2, d2, a)],
            labels: vec![],
        };
        let cfg = MachineConfig::default();
        assert_eq!(*cfg.fus.get(&crate::middle::instruction::FuClass::Mem).unwrap(), 1);
        let bundles = reschedule_block(&block, &cfg, &Map::new(), 1).unwrap();
        let cycles_with_loads: Vec<usize> = bundles.iter().enumerate().filter(|(_, b)| !b.insns.is_empty()).map(|(i, _)| i).collect();
        assert_eq!(cycles_with_loads.len(), 2, "the two loads must not share a bundle under fus[Mem]=1");
        for b in &bundles {
            assert!(BundleScheduler::new(&cfg).schedule2(&b.insns));
        }
    }

    /// Spec §8 invariant: for every basic block containing a branch, the
    /// branch is the last operation in the block's last bundle.
    #[test]
    fn branch_is_anchored_last_in_its_bundle() {
        let r = Register::general(0, 11);
        let link = Register::link(0, 0);
        let block = BasicBlock {
            insns: vec![
                plain(1, vec![Operand::Reg(r)], vec![Operand::Reg(r), Operand::Imm("1".into())]),
                branch(2, link),
            ],
            labels: vec![],
        };
        let cfg = MachineConfig::default();
        let bundles = reschedule_block(&block, &cfg, &Map::new(), 1).unwrap();
        let last = bundles.last().unwrap();
        assert!(last.insns.last().unwrap().is_branch());
        for b in &bundles[..bundles.len() - 1] {
            assert!(b.insns.iter().all(|i| !i.is_branch()));
        }
    }

    /// Empty blocks still preserve their labels in the (sole) output bundle.
    #[test]
    fn empty_block_keeps_labels() {
        let block = BasicBlock { insns: vec![], labels: vec![Label { name: "L".into(), is_local: true }] };
        let cfg = MachineConfig::default();
        let bundles = reschedule_block(&block, &cfg, &Map::new(), 1).unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].labels, block.labels);
    }

    #[test]
    fn split_into_basic_blocks_breaks_on_labels_and_branches() {
        let link = Register::link(0, 0);
        let mut b1 = InsnBundle::default();
        b1.insns.push(plain(1, vec![Operand::Reg(Register::general(0, 11))], vec![Operand::Imm("1".into())]));
        let mut b2 = InsnBundle::default();
        b2.labels.push(Label { name: "loop".into(), is_local: true });
        b2.insns.push(branch(2, link));
        let segments = split_into_basic_blocks(vec![Bundle::Insn(b1), Bundle::Insn(b2)]);
        assert_eq!(segments.len(), 2);
        assert!(matches!(segments[0], Segment::Block(_)));
        assert!(matches!(segments[1], Segment::Block(_)));
    }
}
