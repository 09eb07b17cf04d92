//! The rescheduler binary: reads a `.s` file, runs the fix-up pipeline and
//! (optionally) the list scheduler, and writes the result back out.
//!
//! Run with `--help` for more info.

use clap::Parser;
use std::io::Write;
use std::process::ExitCode;

use vexresched::back::{format_program, resched};
use vexresched::common::Map;
use vexresched::config::{self, MachineConfig};
use vexresched::error::{CoreError, CoreResult};
use vexresched::front::{parse, TopLevelItem};
use vexresched::middle::instruction::FuClass;

/// Post-assembly bundle rescheduler for a multi-cluster VLIW target.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: String,
    /// write the result here instead of stdout
    #[arg(short, long)]
    out: Option<String>,
    /// run the basic-block list scheduler (otherwise only the fix-up
    /// passes run, and `-O` has no effect; spec §11 item 9)
    #[arg(long)]
    resched: bool,
    /// optimization level: 0 = fix-up + packing only, 1 = list schedule,
    /// 2 = list schedule plus the legacy ALAP smoothing pass
    #[arg(short = 'O', default_value_t = 0)]
    opt: u8,
    /// per-lane borrow-slot lists: `lane0.lane1. ... .lane7`
    #[arg(long)]
    borrow: Option<String>,
    /// lane functional-unit layout: 8 hex nibbles, bit 1=ALU 2=MUL 4=MEM 8=BR
    #[arg(long)]
    config: Option<String>,
    /// override the ALU functional-unit cap
    #[arg(long)]
    nalu: Option<usize>,
    /// override the MUL functional-unit cap
    #[arg(long)]
    nmul: Option<usize>,
    /// override the MEM functional-unit cap
    #[arg(long)]
    nmem: Option<usize>,
    /// override the BR functional-unit cap
    #[arg(long)]
    nbr: Option<usize>,
    /// raise the tracing filter level (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .try_init();
}

fn build_config(args: &Args) -> CoreResult<MachineConfig> {
    let mut cfg = MachineConfig::default();
    cfg.opt = args.opt;
    if let Some(text) = &args.config {
        cfg.layout = config::parse_config_opt(text)?;
    }
    if let Some(text) = &args.borrow {
        cfg.borrow = config::parse_borrow_opt(text)?;
    }
    if cfg.borrow.len() != cfg.layout.len() {
        return Err(CoreError::InvalidConfig(format!(
            "borrow table has {} lanes but layout has {}",
            cfg.borrow.len(),
            cfg.layout.len()
        )));
    }
    let mut fus: Map<FuClass, usize> = cfg.fus.clone();
    if let Some(n) = args.nalu {
        fus.insert(FuClass::Alu, n);
    }
    if let Some(n) = args.nmul {
        fus.insert(FuClass::Mul, n);
    }
    if let Some(n) = args.nmem {
        fus.insert(FuClass::Mem, n);
    }
    if let Some(n) = args.nbr {
        fus.insert(FuClass::Br, n);
    }
    cfg.fus = fus;
    Ok(cfg)
}

fn run(args: &Args) -> CoreResult<String> {
    let cfg = build_config(args)?;

    let input = std::fs::read_to_string(&args.file).map_err(|e| CoreError::InvalidConfig(format!("reading {}: {e}", args.file)))?;

    let mut program = parse(&input)?;

    for item in &mut program.items {
        let TopLevelItem::Function(f) = item else { continue };
        let span = tracing::info_span!("rewrite", function = %f.name);
        let _enter = span.enter();
        f.fix_return_and_stack_pop();
        f.fix_same_reg_writes()?;
        f.fix_load_dependency();
        f.fix_cycles()?;
        drop(_enter);

        if args.resched && cfg.opt > 0 {
            let span = tracing::info_span!("reschedule", function = %f.name);
            let _enter = span.enter();
            resched::reschedule_function(f, &cfg)?;
        }
    }

    Ok(format_program(&program))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let output = match run(&args) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("vexresched: {err}");
            return ExitCode::FAILURE;
        }
    };

    let wrote = match &args.out {
        Some(path) => std::fs::write(path, output),
        None => std::io::stdout().write_all(output.as_bytes()),
    };
    if let Err(e) = wrote {
        eprintln!("vexresched: failed to write output: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
