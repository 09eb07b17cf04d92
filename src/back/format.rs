//! Textual emission matching the §6 input/output grammar, for the
//! round-trip property (spec §8).

use crate::front::parse::{Program, TopLevelItem};
use crate::middle::bundle::Bundle;
use crate::middle::function::Function;

fn format_function(f: &Function) -> String {
    let mut out = String::new();
    out.push_str(&format!(".proc {}\n", f.name));
    for bundle in &f.bundles {
        match bundle {
            Bundle::Entry | Bundle::Exit => {}
            Bundle::Call { .. } => {}
            Bundle::Insn(b) => {
                for label in &b.labels {
                    out.push_str(&format!("{label}\n"));
                }
                for insn in &b.insns {
                    out.push_str(&format!("{insn}\n"));
                }
                out.push_str(";;\n");
            }
        }
    }
    out.push_str(".endp\n");
    out
}

/// Render a parsed [`Program`] back to source text.
pub fn format_program(program: &Program) -> String {
    let mut out = String::new();
    for item in &program.items {
        match item {
            TopLevelItem::Verbatim(line) => {
                out.push_str(line);
                out.push('\n');
            }
            TopLevelItem::Function(f) => out.push_str(&format_function(f)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_alu_op_round_trips() {
        let src = ".proc f\nc0 add $r0.11 = $r0.11, 1\n;;\n.endp\n";
        let program = parse(src).unwrap();
        assert_eq!(format_program(&program), src);
    }

    #[test]
    fn verbatim_top_level_lines_survive() {
        let src = ".file \"foo.c\"\n.proc f\nc0 stop\n;;\n.endp\n";
        let program = parse(src).unwrap();
        assert_eq!(format_program(&program), src);
    }

    #[test]
    fn label_and_comment_round_trip() {
        let src = "loop:\nc0 add $r0.11 = $r0.11, 1 #bump\n;;\n.endp\n";
        let src = format!(".proc f\n{src}");
        let program = parse(&src).unwrap();
        assert_eq!(format_program(&program), src);
    }
}
