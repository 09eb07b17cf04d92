//! Parsed operations.
//!
//! Source dispatches dynamically across instruction subclasses (plain,
//! multiply, control transfer, load, store, stop); here that is a tagged
//! [`InstructionKind`] rather than a class hierarchy (spec §9 DESIGN NOTES).

use crate::middle::register::Register;
use derive_more::Display;
use std::collections::BTreeSet;

/// Functional-unit class an operation requires to issue.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum FuClass {
    #[display("ALU")]
    Alu,
    #[display("MUL")]
    Mul,
    #[display("MEM")]
    Mem,
    #[display("BR")]
    Br,
}

impl FuClass {
    /// All four classes, in the bit order used by `--config` (bit 0 = ALU,
    /// bit 1 = MUL, bit 2 = MEM, bit 3 = BR; spec §6).
    pub const ALL: [FuClass; 4] = [FuClass::Alu, FuClass::Mul, FuClass::Mem, FuClass::Br];

    pub fn config_bit(self) -> u8 {
        match self {
            FuClass::Alu => 0b0001,
            FuClass::Mul => 0b0010,
            FuClass::Mem => 0b0100,
            FuClass::Br => 0b1000,
        }
    }
}

/// A control-transfer instruction's specific flavor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControlKind {
    Branch,
    Goto,
    Call,
    Return,
}

/// What kind of operation this is, mirroring the original's subclass split.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InstructionKind {
    Plain,
    Mul,
    Load,
    Store,
    Stop,
    Control(ControlKind),
}

impl InstructionKind {
    pub fn fu(self) -> FuClass {
        match self {
            InstructionKind::Plain => FuClass::Alu,
            InstructionKind::Mul => FuClass::Mul,
            InstructionKind::Load | InstructionKind::Store => FuClass::Mem,
            InstructionKind::Stop => FuClass::Br,
            InstructionKind::Control(_) => FuClass::Br,
        }
    }

    pub fn cost(self) -> u32 {
        match self {
            InstructionKind::Mul | InstructionKind::Load => 2,
            _ => 1,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, InstructionKind::Control(_))
    }

    pub fn is_call(self) -> bool {
        matches!(self, InstructionKind::Control(ControlKind::Call))
    }

    pub fn is_return(self) -> bool {
        matches!(self, InstructionKind::Control(ControlKind::Return))
    }

    pub fn is_load(self) -> bool {
        matches!(self, InstructionKind::Load)
    }

    pub fn is_store(self) -> bool {
        matches!(self, InstructionKind::Store)
    }

    pub fn is_stop(self) -> bool {
        matches!(self, InstructionKind::Stop)
    }
}

/// An operand: either a register or a raw (possibly symbolic) immediate
/// expression, kept as text so that stack-pop fusion (spec §4.1) can
/// string-concatenate immediates the way the downstream assembler expects.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum Operand {
    #[display("{_0}")]
    Reg(Register),
    #[display("{_0}")]
    Imm(String),
}

impl Operand {
    pub fn as_register(&self) -> Option<Register> {
        match self {
            Operand::Reg(r) => Some(*r),
            Operand::Imm(_) => None,
        }
    }
}

/// Branch/goto/call/return destination, per spec §3: a symbolic label, the
/// literal `next`/`return`, or (for an indirect goto through a register) the
/// register itself.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BranchTarget {
    Next,
    Return,
    Label(String),
    Reg(Register),
}

/// Parse an immediate expression as "short" (fits in `[-256, 255]`) or
/// "long". Source embeds a Python `eval()` of the text; here we parse
/// signed decimal/hex literals and treat anything else (names, arithmetic
/// operators, unparsable text) as long (spec §9 DESIGN NOTES).
fn eval_short_imm(text: &str) -> Option<i64> {
    let t = text.trim();
    let (neg, rest) = match t.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, t),
    };
    let value = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse::<i64>().ok()?
    };
    Some(if neg { -value } else { value })
}

fn operand_is_long_imm(op: &Operand) -> bool {
    match op {
        Operand::Reg(_) => false,
        Operand::Imm(text) => match eval_short_imm(text) {
            Some(v) => !(-256..=255).contains(&v),
            None => true,
        },
    }
}

/// A single parsed operation.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub cluster: u32,
    pub mnemonic: String,
    pub dests: Vec<Operand>,
    pub srcs: Vec<Operand>,
    pub kind: InstructionKind,
    pub pseudo_op: Option<String>,
    pub comment: String,
    pub line_no: usize,
}

impl Instruction {
    pub fn new(
        cluster: u32,
        mnemonic: String,
        dests: Vec<Operand>,
        srcs: Vec<Operand>,
        kind: InstructionKind,
        comment: String,
        line_no: usize,
    ) -> Instruction {
        Instruction {
            cluster,
            mnemonic,
            dests,
            srcs,
            kind,
            pseudo_op: None,
            comment,
            line_no,
        }
    }

    pub fn get_fu(&self) -> FuClass {
        self.kind.fu()
    }

    pub fn cost(&self) -> u32 {
        self.kind.cost()
    }

    pub fn is_branch(&self) -> bool {
        self.kind.is_branch()
    }

    pub fn is_call(&self) -> bool {
        self.kind.is_call()
    }

    pub fn is_return(&self) -> bool {
        self.kind.is_return()
    }

    pub fn is_load(&self) -> bool {
        self.kind.is_load()
    }

    pub fn is_store(&self) -> bool {
        self.kind.is_store()
    }

    pub fn is_stop(&self) -> bool {
        self.kind.is_stop()
    }

    /// `true` iff any source carries a long immediate. Control instructions
    /// never carry a long immediate slot (the original hardcodes this for
    /// `ControlInstruction`).
    pub fn has_long_imm(&self) -> bool {
        if self.is_branch() {
            return false;
        }
        self.srcs.iter().any(operand_is_long_imm)
    }

    pub fn get_written_registers(&self) -> BTreeSet<Register> {
        if self.kind.is_return() {
            return if self.dests.is_empty() {
                [Register::stack_pointer()].into_iter().collect()
            } else {
                self.dests.iter().filter_map(Operand::as_register).collect()
            };
        }
        self.dests.iter().filter_map(Operand::as_register).collect()
    }

    pub fn get_read_registers(&self) -> BTreeSet<Register> {
        let mut regs: BTreeSet<Register> =
            self.srcs.iter().filter_map(Operand::as_register).collect();
        if self.kind.is_return() && self.srcs.len() == 1 {
            regs.insert(Register::stack_pointer());
        }
        regs
    }

    pub fn change_source_reg(&mut self, orig: Register, new: Register) {
        for s in &mut self.srcs {
            if *s == Operand::Reg(orig) {
                *s = Operand::Reg(new);
            }
        }
    }

    pub fn change_dest_reg(&mut self, orig: Register, new: Register) {
        for d in &mut self.dests {
            if *d == Operand::Reg(orig) {
                *d = Operand::Reg(new);
            }
        }
    }

    /// The destination(s) this operation can transfer control to. Defaults
    /// to `["next"]` for anything that is not a control instruction.
    pub fn get_branch_destination(&self) -> Vec<BranchTarget> {
        match self.kind {
            InstructionKind::Control(ControlKind::Branch) => {
                let target = self.srcs.last().expect("branch has a target operand");
                vec![BranchTarget::Next, operand_to_target(target)]
            }
            InstructionKind::Control(ControlKind::Return) => vec![BranchTarget::Return],
            InstructionKind::Control(ControlKind::Goto) => {
                let target = self.srcs.last().expect("goto has a target operand");
                if matches!(target, Operand::Imm(s) if s == "1-1") {
                    vec![BranchTarget::Next]
                } else {
                    vec![operand_to_target(target)]
                }
            }
            // Call falls through to the next bundle; the CallBundle fake
            // that follows it models the ABI traffic of the call itself.
            _ => vec![BranchTarget::Next],
        }
    }
}

fn operand_to_target(op: &Operand) -> BranchTarget {
    match op {
        Operand::Reg(r) => BranchTarget::Reg(*r),
        Operand::Imm(s) => BranchTarget::Label(s.clone()),
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(pseudo) = &self.pseudo_op {
            writeln!(f, "{pseudo}")?;
        }
        match self.kind {
            InstructionKind::Load => {
                write!(
                    f,
                    "c{0} {1} {2} = {3}[{4}]",
                    self.cluster, self.mnemonic, self.dests[0], self.srcs[0], self.srcs[1]
                )?;
            }
            InstructionKind::Store => {
                write!(
                    f,
                    "c{0} {1} {2}[{3}] = {4}",
                    self.cluster, self.mnemonic, self.srcs[0], self.srcs[1], self.srcs[2]
                )?;
            }
            InstructionKind::Stop => {
                write!(f, "c{0} {1}", self.cluster, self.mnemonic)?;
            }
            InstructionKind::Control(ControlKind::Branch | ControlKind::Goto) => {
                write!(f, "c{0} {1} ", self.cluster, self.mnemonic)?;
                write!(f, "{}", join(&self.srcs))?;
            }
            InstructionKind::Control(ControlKind::Call | ControlKind::Return) | InstructionKind::Plain | InstructionKind::Mul => {
                write!(f, "c{0} {1} ", self.cluster, self.mnemonic)?;
                write!(f, "{}", join(&self.dests))?;
                if !self.dests.is_empty() {
                    write!(f, " = ")?;
                }
                write!(f, "{}", join(&self.srcs))?;
            }
        }
        if !self.comment.is_empty() {
            write!(f, " #{}", self.comment)?;
        }
        Ok(())
    }
}

fn join(ops: &[Operand]) -> String {
    ops.iter().map(Operand::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(dests: Vec<Operand>, srcs: Vec<Operand>) -> Instruction {
        Instruction::new(0, "add".into(), dests, srcs, InstructionKind::Plain, String::new(), 1)
    }

    #[test]
    fn short_immediate_within_range_is_not_long() {
        let i = plain(vec![], vec![Operand::Imm("255".into())]);
        assert!(!i.has_long_imm());
        let i = plain(vec![], vec![Operand::Imm("-256".into())]);
        assert!(!i.has_long_imm());
    }

    #[test]
    fn out_of_range_or_symbolic_immediate_is_long() {
        assert!(plain(vec![], vec![Operand::Imm("256".into())]).has_long_imm());
        assert!(plain(vec![], vec![Operand::Imm("-257".into())]).has_long_imm());
        assert!(plain(vec![], vec![Operand::Imm("foo+1".into())]).has_long_imm());
    }

    #[test]
    fn control_instructions_never_report_long_imm() {
        let i = Instruction::new(
            0,
            "br".into(),
            vec![],
            vec![Operand::Imm("999999".into())],
            InstructionKind::Control(ControlKind::Branch),
            String::new(),
            1,
        );
        assert!(!i.has_long_imm());
    }

    #[test]
    fn single_operand_return_reads_link_and_sp() {
        let i = Instruction::new(
            0,
            "return".into(),
            vec![],
            vec![Operand::Reg(Register::link(0, 0))],
            InstructionKind::Control(ControlKind::Return),
            String::new(),
            1,
        );
        assert!(i.get_read_registers().contains(&Register::stack_pointer()));
        assert_eq!(i.get_written_registers(), [Register::stack_pointer()].into());
    }

    #[test]
    fn goto_self_target_is_fallthrough() {
        let i = Instruction::new(
            0,
            "goto".into(),
            vec![],
            vec![Operand::Imm("1-1".into())],
            InstructionKind::Control(ControlKind::Goto),
            String::new(),
            1,
        );
        assert_eq!(i.get_branch_destination(), vec![BranchTarget::Next]);
    }
}
