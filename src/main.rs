// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command line driver for the paging audit.
//!
//! Audits a platform snapshot, optionally replacing its range
//! table with one flattened from a raw image of physical memory
//! and a page table root.  Alternatively, dumps the snapshot
//! that would be audited.
//!
//! Exits 0 if every check passed, 1 if any failed, and 2 if the
//! audit could not be run at all.

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgGroup, ArgMatches, Command};
use log::{info, LevelFilter};
use paging_audit::snapshot::Snapshot;
use paging_audit::{checks, mmu, AuditContext, Check};
use std::env;
use std::path::PathBuf;
use std::process;

mod console;

fn main() {
    let matches = parse_args();
    let verbosity = matches.get_count("verbose");
    let level = env_or("PAGING_AUDIT_LOG", "info")
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    console::init(console::raise(level, verbosity));
    match run(&matches) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("paging-audit: {e:#}");
            process::exit(2);
        }
    }
}

/// Parse program arguments and return the match structure.
fn parse_args() -> ArgMatches {
    command().get_matches()
}

fn command() -> Command {
    Command::new("paging-audit")
        .version("0.1.0")
        .author("Oxide Computer Company")
        .about("Audits page tables and memory inventory for memory protection")
        .args([
            Arg::new("run")
                .short('r')
                .long("run")
                .action(ArgAction::SetTrue)
                .help("Run the audit (default)"),
            Arg::new("dump")
                .short('d')
                .long("dump")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Write the snapshot to be audited to PATH"),
            Arg::new("snapshot")
                .long("snapshot")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Platform snapshot to audit (JSON)"),
            Arg::new("memory")
                .long("memory")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .requires("cr3")
                .help("Raw physical memory image holding the page tables"),
            Arg::new("cr3")
                .long("cr3")
                .value_name("ADDR")
                .value_parser(parse_addr)
                .requires("memory")
                .help("Physical address of the root page table"),
            Arg::new("check")
                .long("check")
                .value_name("NAME")
                .value_parser(parse_check)
                .action(ArgAction::Append)
                .help("Run only the named check (repeatable)"),
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Log more detail (repeatable)"),
        ])
        .group(ArgGroup::new("command").args(["run", "dump"]))
        .group(
            ArgGroup::new("input")
                .args(["snapshot", "memory"])
                .multiple(true)
                .required(true),
        )
        .after_help(check_list())
}

/// Lists the checks, for the help text.
fn check_list() -> String {
    let mut help = String::from("Checks:\n");
    for check in Check::ALL {
        help.push_str(&format!("  {:<28} {}\n", check.name(), check.description()));
    }
    help
}

/// Parses a physical address, in hex with a `0x` prefix or
/// decimal.
fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse::<u64>(),
    };
    parsed.map_err(|e| format!("bad address {s:?}: {e}"))
}

fn parse_check(s: &str) -> Result<Check, String> {
    s.parse::<Check>().map_err(|_| format!("unknown check {s:?}"))
}

/// Loads the platform, then audits or dumps it.  Returns whether
/// the audit passed.
fn run(matches: &ArgMatches) -> anyhow::Result<bool> {
    let mut snapshot = match matches.get_one::<PathBuf>("snapshot") {
        Some(path) => Snapshot::load(path)?,
        None => Snapshot::default(),
    };
    if let Some(path) = matches.get_one::<PathBuf>("memory") {
        let cr3 = *matches.get_one::<u64>("cr3").context("--memory requires --cr3")?;
        let memory = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        snapshot.range_table = mmu::flatten(memory.as_slice(), cr3)
            .with_context(|| format!("flattening page tables at {cr3:#x}"))?;
    }
    let mut ctx = AuditContext::new(snapshot);

    if let Some(path) = matches.get_one::<PathBuf>("dump") {
        let captured = Snapshot::capture(&mut ctx)?;
        captured.store(path)?;
        info!("Wrote snapshot to {}", path.display());
        return Ok(true);
    }

    let selected = matches
        .get_many::<Check>("check")
        .map(|checks| checks.copied().collect::<Vec<_>>())
        .unwrap_or_else(|| Check::ALL.to_vec());
    let report = checks::run(&mut ctx, &selected);
    println!("{report}");
    Ok(report.passed())
}

/// Returns the value of the given environment variable,
/// or the default if unspecified.
fn env_or(var: &str, default: &str) -> String {
    env::var(var).unwrap_or(default.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert_eq!(parse_addr("0x1000"), Ok(0x1000));
        assert_eq!(parse_addr("0xFFFF_F000"), Ok(0xFFFF_F000));
        assert_eq!(parse_addr("4096"), Ok(4096));
        assert!(parse_addr("0xZZ").is_err());
    }

    #[test]
    fn check_names() {
        assert_eq!(parse_check("null-page-rp"), Ok(Check::NullPageIsReadProtected));
        assert!(parse_check("everything").is_err());
    }

    #[test]
    fn command_line() {
        command().debug_assert();
    }

    #[test]
    fn run_and_dump_conflict() {
        let args = ["paging-audit", "--snapshot", "s.json", "-r", "-d", "out.json"];
        assert!(command().try_get_matches_from(args).is_err());
    }

    #[test]
    fn memory_requires_cr3() {
        let args = ["paging-audit", "--memory", "mem.bin"];
        assert!(command().try_get_matches_from(args).is_err());
        let args = ["paging-audit", "--memory", "mem.bin", "--cr3", "0x1000"];
        let matches = command().try_get_matches_from(args).unwrap();
        assert_eq!(matches.get_one::<u64>("cr3"), Some(&0x1000));
    }

    #[test]
    fn input_is_required() {
        assert!(command().try_get_matches_from(["paging-audit"]).is_err());
    }

    #[test]
    fn repeated_checks() {
        let args = [
            "paging-audit",
            "--snapshot",
            "s.json",
            "--check",
            "no-rwx",
            "--check",
            "stack-guard",
            "-vv",
        ];
        let matches = command().try_get_matches_from(args).unwrap();
        let checks: Vec<Check> = matches.get_many::<Check>("check").unwrap().copied().collect();
        assert_eq!(checks, [Check::NoReadWriteExecute, Check::StackGuarded]);
        assert_eq!(matches.get_count("verbose"), 2);
    }
}
