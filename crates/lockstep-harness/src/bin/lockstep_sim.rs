use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use lockstep_core::ProtocolConfig;
use lockstep_harness::{
    DEFAULT_INJECTION_SEED, OpClass, Program, SimOptions, Simulation, StuckAtSpec,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct CliConfig {
    options: SimOptions,
    program: ProgramChoice,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgramChoice {
    Demo,
    Random(usize),
}

fn print_help() {
    let help = "\
lockstep_sim - run the lockstep checkers against a toy program with fault injection

USAGE:
    cargo run -p lockstep-harness --bin lockstep_sim -- [OPTIONS]

OPTIONS:
    --config <PATH>          Load ProtocolConfig from JSON before applying flags
    --instructions <u64>     Instructions per main unit (default: 2000)
    --seed <u64>             Injection seed (default: 258958529)
    --mains <u32>            Main units
    --checkers <u32>         Checkers per main unit
    --extra-slots <u32>      Cache slots per checker beyond the primary
    --timeout <u64>          Initial checkpoint timeout in instructions
    --adaptive               AIMD timeout; syscalls close only a full syscall log
    --no-rollback            Record faults without recovering
    --hashing                Compare running digests of the log
    --rate-loadstore <f64>   Mean interval of log payload injections
    --rate-arch <f64>        Mean interval of checker start-state injections
    --rate-tc <f64>          Mean interval of checker register injections
    --rate-opclass <f64>     Mean interval of op-class destination injections
    --opclass <NAME>         Op class targeted by --rate-opclass (repeatable)
    --target-stores          Let load/store injections hit store payloads
    --injection-limit <u64>  Stop scheduled injections after this many
    --stuck-at <SPEC>        structure,arg,bit,0|1,mask (e.g. fu_dest,1,3,1,0x1)
    --program <P>            demo | random:<len>[:<seed>] (default: demo)
    --max-ticks <u64>        Abort when the run has not settled by then
    --out <DIR>              Write histograms, pcs and error_log reports here
    -h, --help               Show this help
";
    println!("{help}");
}

fn parse_u64(value: &str) -> Result<u64, String> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|_| format!("invalid hex u64 value: {value}"))
    } else {
        value
            .parse::<u64>()
            .map_err(|_| format!("invalid u64 value: {value}"))
    }
}

fn parse_u32(value: &str) -> Result<u32, String> {
    u32::try_from(parse_u64(value)?).map_err(|_| format!("value out of range: {value}"))
}

fn parse_f64(value: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .map_err(|_| format!("invalid rate: {value}"))
}

fn parse_program(value: &str) -> Result<(ProgramChoice, Option<u64>), String> {
    if value == "demo" {
        return Ok((ProgramChoice::Demo, None));
    }
    let Some(rest) = value.strip_prefix("random:") else {
        return Err(format!("unknown program: {value}"));
    };
    let (len, seed) = match rest.split_once(':') {
        Some((len, seed)) => (len, Some(parse_u64(seed)?)),
        None => (rest, None),
    };
    let len = usize::try_from(parse_u64(len)?).map_err(|_| format!("length out of range: {len}"))?;
    Ok((ProgramChoice::Random(len), seed))
}

fn next_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> Result<&'a str, String> {
    *index += 1;
    args.get(*index)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<(CliConfig, u64), String> {
    let mut options = SimOptions::default();
    let mut program = ProgramChoice::Demo;
    let mut program_seed = None;
    let mut output = None;
    let mut op_classes = Vec::new();

    // --config first so later flags override it.
    if let Some(pos) = args.iter().position(|arg| arg == "--config") {
        let path = args
            .get(pos + 1)
            .ok_or_else(|| "--config requires a value".to_owned())?;
        options.protocol = ProtocolConfig::from_json_file(&PathBuf::from(path))
            .map_err(|error| format!("config_load_failed path={path} error={error}"))?;
    }

    let mut index = 0;
    while index < args.len() {
        let flag = args[index].as_str();
        match flag {
            "--config" => {
                next_value(args, &mut index, flag)?;
            }
            "--instructions" => options.instructions = parse_u64(next_value(args, &mut index, flag)?)?,
            "--seed" => options.injection_seed = parse_u64(next_value(args, &mut index, flag)?)?,
            "--mains" => options.protocol.main_units = parse_u32(next_value(args, &mut index, flag)?)?,
            "--checkers" => {
                options.protocol.checkers_per_main = parse_u32(next_value(args, &mut index, flag)?)?;
            }
            "--extra-slots" => {
                options.protocol.extra_slots_per_checker =
                    parse_u32(next_value(args, &mut index, flag)?)?;
            }
            "--timeout" => {
                options.protocol.checkpoint_timeout = parse_u64(next_value(args, &mut index, flag)?)?;
            }
            "--adaptive" => options.protocol.adaptive_timeout = true,
            "--no-rollback" => options.protocol.rollback_enabled = false,
            "--hashing" => options.protocol.hashing = true,
            "--rate-loadstore" => {
                options.protocol.injection.load_store = parse_f64(next_value(args, &mut index, flag)?)?;
            }
            "--rate-arch" => {
                options.protocol.injection.arch_state = parse_f64(next_value(args, &mut index, flag)?)?;
            }
            "--rate-tc" => {
                options.protocol.injection.tc_state = parse_f64(next_value(args, &mut index, flag)?)?;
            }
            "--rate-opclass" => {
                options.protocol.injection.op_class = parse_f64(next_value(args, &mut index, flag)?)?;
            }
            "--opclass" => {
                let name = next_value(args, &mut index, flag)?;
                let class =
                    OpClass::from_name(name).ok_or_else(|| format!("unknown op class: {name}"))?;
                op_classes.push(class);
            }
            "--target-stores" => options.target_stores = true,
            "--injection-limit" => {
                options.injection_limit = Some(parse_u64(next_value(args, &mut index, flag)?)?);
            }
            "--stuck-at" => {
                let text = next_value(args, &mut index, flag)?;
                options.stuck_at = Some(StuckAtSpec::parse(text).map_err(|error| error.to_string())?);
            }
            "--program" => {
                (program, program_seed) = parse_program(next_value(args, &mut index, flag)?)?;
            }
            "--max-ticks" => options.max_ticks = parse_u64(next_value(args, &mut index, flag)?)?,
            "--out" => output = Some(PathBuf::from(next_value(args, &mut index, flag)?)),
            "-h" | "--help" => {
                print_help();
                return Err(String::new());
            }
            unknown => return Err(format!("unknown option: {unknown}")),
        }
        index += 1;
    }

    if !op_classes.is_empty() {
        options.op_class_targets = op_classes;
    }
    let program_seed = program_seed.unwrap_or(options.injection_seed);
    Ok((
        CliConfig {
            options,
            program,
            output,
        },
        program_seed,
    ))
}

fn run(args: &[String]) -> Result<(), String> {
    let (config, program_seed) = parse_args(args)?;
    let program = match config.program {
        ProgramChoice::Demo => Program::demo(),
        ProgramChoice::Random(len) => Program::random(program_seed, len),
    };

    let mut sim = Simulation::new(config.options, program).map_err(|error| error.to_string())?;
    let summary = sim.run().map_err(|error| format!("run_failed: {error}"))?;
    sim.self_check()
        .map_err(|error| format!("accounting_failed: {error}"))?;
    if let Some(dir) = &config.output {
        sim.write_reports(dir)
            .map_err(|error| format!("report_write_failed dir={} error={error}", dir.display()))?;
    }

    let payload = serde_json::json!({
        "ticks": summary.ticks,
        "committed": summary.committed,
        "recoveries": summary.recoveries,
        "rollbacks": summary.metrics.rollbacks,
        "faults_detected": summary.metrics.faults_detected,
        "faults_accepted": summary.metrics.faults_accepted,
        "segments_closed": summary.metrics.segments_closed(),
        "events": summary.events,
        "ledger": summary.ledger,
    });
    let text = serde_json::to_string_pretty(&payload)
        .map_err(|error| format!("summary_json_serialize_failed: {error}"))?;
    println!("{text}");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) if error.is_empty() => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ERROR lockstep_sim failed: {error}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_parse_defaults() {
        let (config, seed) = parse_args(&[]).unwrap();
        assert_eq!(config.program, ProgramChoice::Demo);
        assert_eq!(config.options.injection_seed, DEFAULT_INJECTION_SEED);
        assert_eq!(seed, DEFAULT_INJECTION_SEED);
        assert!(config.output.is_none());
    }

    #[test]
    fn test_parse_flags() {
        let (config, seed) = parse_args(&args(&[
            "--checkers",
            "2",
            "--timeout",
            "0x20",
            "--no-rollback",
            "--rate-loadstore",
            "50",
            "--opclass",
            "mem_read",
            "--program",
            "random:64:9",
            "--stuck-at",
            "log_entry,-,3,1,1",
        ]))
        .unwrap();
        assert_eq!(config.options.protocol.checkers_per_main, 2);
        assert_eq!(config.options.protocol.checkpoint_timeout, 32);
        assert!(!config.options.protocol.rollback_enabled);
        assert!((config.options.protocol.injection.load_store - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.options.op_class_targets, vec![OpClass::MemRead]);
        assert_eq!(config.program, ProgramChoice::Random(64));
        assert_eq!(seed, 9);
        assert!(config.options.stuck_at.is_some());
    }

    #[test]
    fn test_parse_rejects_unknown_and_missing() {
        assert!(parse_args(&args(&["--bogus"])).is_err());
        assert!(parse_args(&args(&["--seed"])).is_err());
        assert!(parse_args(&args(&["--program", "fib"])).is_err());
    }
}
