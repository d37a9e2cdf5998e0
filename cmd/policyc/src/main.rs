//! policyc - compile policy source and print the assembled programs
//!
//! Usage:
//!   policyc --import PROTOCOL FILE [PROTOCOL...]
//!   policyc --export TAGSTART FILE [PROTOCOL...]
//!
//! Compiles FILE against variable maps for the listed protocols
//! (default: ospf, rip, bgp, static, connected) and prints each
//! target's instruction stream and tag table.

use std::process::ExitCode;

use routerd_policy::{parse_policies, Code, PolicyCompiler, SetMap, VarMap};
use tracing::error;

const DEFAULT_PROTOCOLS: &[&str] = &["ospf", "rip", "bgp", "static", "connected"];

fn usage() -> ExitCode {
    eprintln!("usage: policyc --import PROTOCOL FILE [PROTOCOL...]");
    eprintln!("       policyc --export TAGSTART FILE [PROTOCOL...]");
    ExitCode::from(2)
}

fn print_code(code: &Code) {
    let target = code.target.as_ref().expect("compiled code has a target");
    println!("=== target {target} ===");
    print!("{}", code.code);
    for (name, stream) in &code.subroutines {
        println!("--- subroutine {name} ---");
        print!("{stream}");
    }
    if !code.tags.is_empty() {
        let tags: Vec<String> = code
            .tags
            .iter()
            .map(|(tag, redist)| {
                format!("{tag}{}", if *redist { "" } else { " (non-redist)" })
            })
            .collect();
        println!("--- tags: {} ---", tags.join(", "));
    }
    if !code.referenced_sets.is_empty() {
        let sets: Vec<&str> = code.referenced_sets.iter().map(String::as_str).collect();
        println!("--- sets: {} ---", sets.join(", "));
    }
    println!();
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, rest) = match args.split_first() {
        Some((m, rest)) if m == "--import" || m == "--export" => (m.clone(), rest.to_vec()),
        _ => return Err("mode required".into()),
    };
    let (selector, file, extra_protocols) = match rest.split_first() {
        Some((sel, more)) => match more.split_first() {
            Some((file, protos)) => (sel.clone(), file.clone(), protos.to_vec()),
            None => return Err("file required".into()),
        },
        None => return Err("argument required".into()),
    };

    let source = std::fs::read_to_string(&file).map_err(|e| format!("read {file}: {e}"))?;
    let policies = parse_policies(&source).map_err(|e| e.to_string())?;

    let mut protocols: Vec<&str> = DEFAULT_PROTOCOLS.to_vec();
    protocols.extend(extra_protocols.iter().map(String::as_str));
    let varmap = VarMap::with_defaults(&protocols);
    let set_map = SetMap::new();
    let compiler = PolicyCompiler::new(&varmap, &set_map);

    match mode.as_str() {
        "--import" => {
            let code = compiler
                .compile_import(&policies, &selector)
                .map_err(|e| e.to_string())?;
            print_code(&code);
        }
        "--export" => {
            let tagstart: u32 = selector
                .parse()
                .map_err(|_| format!("bad tag start `{selector}`"))?;
            let result = compiler
                .compile_export(&policies, tagstart)
                .map_err(|e| e.to_string())?;
            for code in result.source_match.iter().chain(result.export.iter()) {
                print_code(code);
            }
            println!("next tag: {}", result.next_tag);
            for (protocol, tags) in &result.protocol_tags {
                let tags: Vec<String> = tags.iter().map(u32::to_string).collect();
                println!("{protocol} tags: {{{}}}", tags.join(","));
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            usage()
        }
    }
}
