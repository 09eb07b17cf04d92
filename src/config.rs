//! Machine configuration: lane layout, functional-unit caps, and borrow
//! topology (spec §5, §6). Read-only after construction and shared by value
//! into the schedulers.

use crate::common::Map;
use crate::error::{CoreError, CoreResult};
use crate::middle::instruction::FuClass;

/// `layout`, `fus`, `borrow` plus the requested optimization level (`-O`).
#[derive(Clone, Debug)]
pub struct MachineConfig {
    pub layout: Vec<Vec<FuClass>>,
    pub fus: Map<FuClass, usize>,
    pub borrow: Vec<Vec<usize>>,
    pub opt: u8,
}

impl MachineConfig {
    pub fn lanes(&self) -> usize {
        self.layout.len()
    }
}

impl Default for MachineConfig {
    /// The §6 default machine: 8 lanes, borrow pairs `i <-> i^1`.
    fn default() -> MachineConfig {
        use FuClass::*;
        let layout = vec![
            vec![Alu, Br, Mul],
            vec![Alu, Mul, Mem],
            vec![Alu, Mul, Br],
            vec![Alu, Mul],
            vec![Alu, Mul, Br],
            vec![Alu, Mul],
            vec![Alu, Mul, Br],
            vec![Alu, Mul],
        ];
        let mut fus = Map::new();
        fus.insert(Alu, 8);
        fus.insert(Mul, 4);
        fus.insert(Mem, 1);
        fus.insert(Br, 1);
        let borrow = (0..layout.len()).map(|i| vec![i ^ 1]).collect();
        MachineConfig { layout, fus, borrow, opt: 0 }
    }
}

/// Parse `--config`: 8 hex nibbles, lane 0 leftmost, bit 1=ALU 2=MUL 4=MEM
/// 8=BR.
pub fn parse_config_opt(text: &str) -> CoreResult<Vec<Vec<FuClass>>> {
    if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CoreError::InvalidConfig(format!(
            "--config must be exactly 8 hex nibbles, got {text:?}"
        )));
    }
    text.chars()
        .map(|c| {
            let bits = c.to_digit(16).expect("validated hex digit");
            let mut classes = Vec::new();
            if bits & 0x1 != 0 {
                classes.push(FuClass::Alu);
            }
            if bits & 0x2 != 0 {
                classes.push(FuClass::Mul);
            }
            if bits & 0x4 != 0 {
                classes.push(FuClass::Mem);
            }
            if bits & 0x8 != 0 {
                classes.push(FuClass::Br);
            }
            Ok(classes)
        })
        .collect()
}

/// Parse `--borrow`: `lane0.lane1. ... .lane7`, each lane a comma-list of
/// acceptable borrow-host slot indices.
pub fn parse_borrow_opt(text: &str) -> CoreResult<Vec<Vec<usize>>> {
    text.split('.')
        .map(|lane| {
            lane.split(',')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.trim()
                        .parse::<usize>()
                        .map_err(|_| CoreError::InvalidConfig(format!("invalid borrow slot {s:?}")))
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_machine_matches_spec_layout() {
        let cfg = MachineConfig::default();
        assert_eq!(cfg.lanes(), 8);
        assert_eq!(cfg.fus[&FuClass::Mem], 1);
        assert_eq!(cfg.borrow[0], vec![1]);
        assert_eq!(cfg.borrow[3], vec![2]);
    }

    #[test]
    fn config_hex_decodes_bitmask() {
        let layout = parse_config_opt("f0000000").unwrap();
        assert_eq!(layout[0].len(), 4);
        assert!(layout[1].is_empty());
    }

    #[test]
    fn config_rejects_wrong_length() {
        assert!(parse_config_opt("f0").is_err());
    }

    #[test]
    fn borrow_parses_per_lane_lists() {
        let borrow = parse_borrow_opt("1.0.3,2.2,3..4.5.6.7").unwrap();
        assert_eq!(borrow[0], vec![1]);
        assert_eq!(borrow[2], vec![3, 2]);
        assert_eq!(borrow[4], Vec::<usize>::new());
    }
}
