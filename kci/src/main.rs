//! kci: trigger, watch and bisect KernelCI Maestro runs.
//!
//! `checkout --watch` and `watch` exit with the verdict codes from
//! [`kci::exit_codes`]; `bisect` runs until git names the first bad commit and
//! can be killed and restarted at any point.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use kci::bisect::{BisectEvent, BisectOptions, ensure_workdir, resolve_state, run_bisect};
use kci::checkout::{
    CommitTestRequest, CommitTester, MaestroTester, SubprocessTester, trigger_and_watch,
};
use kci::core::types::WatchVerdict;
use kci::core::watch_tracker::WatchPhase;
use kci::exit_codes;
use kci::io::bisect_state::{BisectParams, BisectState, StateLock};
use kci::io::config::{KciConfig, load_config, resolve_settings_path};
use kci::io::git::Git;
use kci::io::maestro::{HttpMaestro, MaestroApi};
use kci::io::pacer::SystemPacer;
use kci::logging;
use kci::watch::{WatchEvent, WatchRequest, WatchSettings, watch_tree};

const DEFAULT_STATE_FILE: &str = "kci-bisect.json";

#[derive(Parser)]
#[command(
    name = "kci",
    version,
    about = "Trigger, watch and bisect KernelCI Maestro runs"
)]
struct Cli {
    /// Settings file (default: ./.kci-dev.toml, then ~/.config/kci-dev/kci-dev.toml).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Maestro instance from the settings file.
    #[arg(long, global = true)]
    instance: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trigger a checkout of one commit, optionally waiting for its result.
    Checkout(CheckoutArgs),
    /// Follow the jobs of an already triggered tree.
    Watch(WatchArgs),
    /// Bisect a regression between a good and a bad commit.
    Bisect(BisectArgs),
}

#[derive(Args)]
struct CheckoutArgs {
    #[arg(long)]
    giturl: String,

    #[arg(long)]
    branch: String,

    #[arg(long, required_unless_present = "tipoftree", conflicts_with = "tipoftree")]
    commit: Option<String>,

    /// Use the current head of the remote branch.
    #[arg(long)]
    tipoftree: bool,

    #[arg(long = "job-filter")]
    job_filter: Vec<String>,

    #[arg(long = "platform-filter")]
    platform_filter: Vec<String>,

    /// Wait for the jobs and exit with the verdict code.
    #[arg(long)]
    watch: bool,

    /// Decisive test; its result becomes the exit code.
    #[arg(long, requires = "watch")]
    test: Option<String>,
}

#[derive(Args)]
struct WatchArgs {
    #[arg(long)]
    treeid: String,

    #[arg(long = "job-filter")]
    job_filter: Vec<String>,

    #[arg(long)]
    test: Option<String>,
}

/// Boundary arguments are only needed to start a bisection; a saved state
/// file resumes without them.
#[derive(Args)]
struct BisectArgs {
    #[arg(long)]
    giturl: Option<String>,

    #[arg(long)]
    branch: Option<String>,

    #[arg(long)]
    good: Option<String>,

    #[arg(long)]
    bad: Option<String>,

    /// Local clone used for `git bisect`; cloned if missing.
    #[arg(long)]
    workdir: Option<PathBuf>,

    #[arg(long)]
    test: Option<String>,

    #[arg(long = "job-filter")]
    job_filter: Vec<String>,

    #[arg(long = "platform-filter")]
    platform_filter: Vec<String>,

    /// Retries for flaky tests (recorded in the state file).
    #[arg(long = "retry-fail", default_value_t = 0)]
    retry_fail: u32,

    #[arg(long = "state-file", default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// Start over even if a saved state exists.
    #[arg(long = "ignore-state")]
    ignore_state: bool,

    /// Test each commit through a `kci checkout --watch` child process.
    #[arg(long)]
    isolate: bool,
}

fn main() {
    // Usage errors must not exit with clap's code 2, which means "skipped" here.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::ERROR
            } else {
                exit_codes::PASSED
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    logging::init();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let cfg = match resolve_settings_path(cli.settings.as_deref()) {
        Some(path) => load_config(&path)?,
        None => KciConfig::default(),
    };
    match cli.command {
        Command::Checkout(ref args) => cmd_checkout(&cli, &cfg, args),
        Command::Watch(ref args) => cmd_watch(&cli, &cfg, args),
        Command::Bisect(ref args) => cmd_bisect(&cli, &cfg, args),
    }
}

fn cmd_checkout(cli: &Cli, cfg: &KciConfig, args: &CheckoutArgs) -> Result<i32> {
    let api = HttpMaestro::new(&cfg.instance(cli.instance.as_deref())?)?;
    let commit = match &args.commit {
        Some(commit) => commit.clone(),
        None => {
            let head = Git::ls_remote_head(&args.giturl, &args.branch)?;
            println!("tip of {}: {head}", args.branch);
            head
        }
    };
    let request = CommitTestRequest {
        tree_url: args.giturl.clone(),
        branch: args.branch.clone(),
        commit,
        job_filter: args.job_filter.clone(),
        platform_filter: args.platform_filter.clone(),
        test_name: args.test.clone(),
    };

    if !args.watch {
        let run = api.trigger_checkout(&request.checkout_request())?;
        print_triggered(&run.treeid, &run.node_id, run.message.as_deref());
        return Ok(exit_codes::PASSED);
    }

    let settings = WatchSettings::from(&cfg.watch);
    let (run, verdict) =
        trigger_and_watch(&api, &SystemPacer, &settings, &request, print_watch_event)?;
    print_triggered(&run.treeid, &run.node_id, run.message.as_deref());
    Ok(finish_watch(&verdict))
}

fn cmd_watch(cli: &Cli, cfg: &KciConfig, args: &WatchArgs) -> Result<i32> {
    let api = HttpMaestro::new(&cfg.instance(cli.instance.as_deref())?)?;
    let request = WatchRequest {
        treeid: args.treeid.clone(),
        jobs: args.job_filter.clone(),
        test: args.test.clone(),
    };
    let verdict = watch_tree(
        &api,
        &SystemPacer,
        &WatchSettings::from(&cfg.watch),
        &request,
        print_watch_event,
    );
    Ok(finish_watch(&verdict))
}

fn cmd_bisect(cli: &Cli, cfg: &KciConfig, args: &BisectArgs) -> Result<i32> {
    let lock = StateLock::acquire(&args.state_file)?;
    let overrides = args.good.as_deref().zip(args.bad.as_deref());
    let state = resolve_state(&lock, args.ignore_state, overrides, || {
        fresh_params(args)
    })?;
    print_state_summary(&state);
    let git = ensure_workdir(&state)?;

    let tester: Box<dyn CommitTester> = if args.isolate {
        Box::new(SubprocessTester {
            program: env::current_exe().context("locate kci executable")?,
            global_args: global_args(cli),
            timeout: cfg.bisect.subprocess_timeout_secs.map(Duration::from_secs),
            output_limit_bytes: cfg.bisect.output_limit_bytes,
        })
    } else {
        Box::new(MaestroTester::new(
            HttpMaestro::new(&cfg.instance(cli.instance.as_deref())?)?,
            SystemPacer,
            WatchSettings::from(&cfg.watch),
            print_watch_event,
        ))
    };
    let options = BisectOptions {
        infra_retry_delay: Duration::from_secs(cfg.bisect.infra_retry_delay_secs),
        max_infra_retries: cfg.bisect.max_infra_retries,
    };

    let report = run_bisect(
        &lock,
        state,
        &git,
        tester.as_ref(),
        &SystemPacer,
        &options,
        print_bisect_event,
    )?;
    println!(
        "first bad commit: {} ({} tested, {} in this run)",
        report.first_bad, report.tested_total, report.tested_now
    );
    Ok(exit_codes::PASSED)
}

/// Parameters for a new bisection; every boundary argument is required.
fn fresh_params(args: &BisectArgs) -> Result<BisectParams> {
    let mut missing = Vec::new();
    for (name, present) in [
        ("--giturl", args.giturl.is_some()),
        ("--branch", args.branch.is_some()),
        ("--good", args.good.is_some()),
        ("--bad", args.bad.is_some()),
        ("--workdir", args.workdir.is_some()),
        ("--test", args.test.is_some()),
    ] {
        if !present {
            missing.push(name);
        }
    }
    if !missing.is_empty() {
        bail!("starting a bisection requires {}", missing.join(", "));
    }
    Ok(BisectParams {
        tree_url: args.giturl.clone().unwrap_or_default(),
        branch: args.branch.clone().unwrap_or_default(),
        good_commit: args.good.clone().unwrap_or_default(),
        bad_commit: args.bad.clone().unwrap_or_default(),
        retry_count: args.retry_fail,
        job_filter: args.job_filter.clone(),
        platform_filter: args.platform_filter.clone(),
        test_name: args.test.clone().unwrap_or_default(),
        workdir: args.workdir.clone().unwrap_or_default(),
    })
}

/// Global flags forwarded to isolated checkout children.
fn global_args(cli: &Cli) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(path) = &cli.settings {
        out.push("--settings".to_string());
        out.push(path.display().to_string());
    }
    if let Some(name) = &cli.instance {
        out.push("--instance".to_string());
        out.push(name.clone());
    }
    out
}

fn finish_watch(verdict: &WatchVerdict) -> i32 {
    println!("{verdict}");
    verdict.exit_code()
}

fn print_triggered(treeid: &str, node_id: &str, message: Option<&str>) {
    match message {
        Some(message) => println!("treeid: {treeid} (checkout node {node_id}): {message}"),
        None => println!("treeid: {treeid} (checkout node {node_id})"),
    }
}

fn print_state_summary(state: &BisectState) {
    println!("tree:     {} ({})", state.tree_url, state.branch);
    println!("good:     {}", state.good_commit);
    println!("bad:      {}", state.bad_commit);
    println!("test:     {}", state.test_name);
    if !state.job_filter.is_empty() {
        println!("jobs:     {}", state.job_filter.join(", "));
    }
    if !state.platform_filter.is_empty() {
        println!("platform: {}", state.platform_filter.join(", "));
    }
    println!("retries:  {}", state.retry_count);
    println!("workdir:  {}", state.workdir.display());
}

fn print_watch_event(event: &WatchEvent) {
    match event {
        WatchEvent::Polled {
            nodes,
            pending,
            phase,
        } => {
            let phase = match phase {
                WatchPhase::Running => "running",
                WatchPhase::AwaitingResult => "waiting for test result",
                WatchPhase::AwaitingDelayedResult => "test result delayed",
            };
            if pending.is_empty() {
                println!("{nodes} nodes, {phase}");
            } else {
                println!("{nodes} nodes, {phase}, pending: {}", pending.join(", "));
            }
        }
        WatchEvent::Unchanged => {}
        WatchEvent::Retrying { reason } => println!("no nodes yet ({reason}), retrying"),
        WatchEvent::ResultDelayed { test } => {
            println!("result of {test} not available yet, still waiting");
        }
    }
}

fn print_bisect_event(event: &BisectEvent) {
    match event {
        BisectEvent::Started {
            good,
            bad,
            retry_count,
        } => println!("starting bisection {good}..{bad} (retries: {retry_count})"),
        BisectEvent::Resumed { tested, next } => match next {
            Some(next) => println!("resuming: {tested} commits tested, next {next}"),
            None => println!("resuming finished bisection ({tested} commits tested)"),
        },
        BisectEvent::Replayed { marks } => {
            println!("git bisect session rebuilt from {marks} saved marks");
        }
        BisectEvent::Testing { commit, remaining } => match remaining {
            Some(n) => println!("testing {commit} ({n} revisions left)"),
            None => println!("testing {commit}"),
        },
        BisectEvent::Tested { commit, mark } => println!("{commit}: {mark}"),
        BisectEvent::InfraRetry { commit, reason } => {
            println!("{commit}: infrastructure failure ({reason}), retrying");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_checkout_with_watch_and_filters() {
        let cli = Cli::parse_from([
            "kci",
            "--instance",
            "staging",
            "checkout",
            "--giturl",
            "https://git.example.org/linux.git",
            "--branch",
            "master",
            "--commit",
            "ccc333",
            "--job-filter",
            "baseline",
            "--job-filter",
            "kselftest",
            "--watch",
            "--test",
            "baseline.login",
        ]);
        assert_eq!(cli.instance.as_deref(), Some("staging"));
        let Command::Checkout(args) = cli.command else {
            panic!("expected checkout");
        };
        assert_eq!(args.commit.as_deref(), Some("ccc333"));
        assert_eq!(args.job_filter, vec!["baseline", "kselftest"]);
        assert!(args.watch);
        assert_eq!(args.test.as_deref(), Some("baseline.login"));
    }

    #[test]
    fn checkout_needs_commit_or_tipoftree() {
        let parse = |extra: &[&str]| {
            let mut argv = vec!["kci", "checkout", "--giturl", "u", "--branch", "b"];
            argv.extend_from_slice(extra);
            Cli::try_parse_from(argv)
        };
        assert!(parse(&[]).is_err());
        assert!(parse(&["--tipoftree"]).is_ok());
        assert!(parse(&["--tipoftree", "--commit", "abc"]).is_err());
    }

    #[test]
    fn checkout_test_requires_watch() {
        let result = Cli::try_parse_from([
            "kci", "checkout", "--giturl", "u", "--branch", "b", "--commit", "c", "--test", "t",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn bisect_defaults_and_global_args() {
        let cli = Cli::parse_from(["kci", "bisect", "--settings", "/tmp/kci.toml", "--isolate"]);
        let Command::Bisect(ref args) = cli.command else {
            panic!("expected bisect");
        };
        assert_eq!(args.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert_eq!(args.retry_fail, 0);
        assert!(args.isolate);
        assert!(!args.ignore_state);
        assert_eq!(global_args(&cli), vec!["--settings", "/tmp/kci.toml"]);
    }

    #[test]
    fn fresh_params_lists_missing_arguments() {
        let cli = Cli::parse_from(["kci", "bisect", "--good", "aaa111", "--bad", "bbb222"]);
        let Command::Bisect(args) = cli.command else {
            panic!("expected bisect");
        };
        let err = fresh_params(&args).expect_err("incomplete");
        assert_eq!(
            err.to_string(),
            "starting a bisection requires --giturl, --branch, --workdir, --test"
        );
    }

    #[test]
    fn fresh_params_carries_arguments() {
        let cli = Cli::parse_from([
            "kci",
            "bisect",
            "--giturl",
            "https://git.example.org/linux.git",
            "--branch",
            "master",
            "--good",
            "aaa111",
            "--bad",
            "bbb222",
            "--workdir",
            "/tmp/linux",
            "--test",
            "baseline.login",
            "--retry-fail",
            "2",
        ]);
        let Command::Bisect(args) = cli.command else {
            panic!("expected bisect");
        };
        let params = fresh_params(&args).expect("params");
        assert_eq!(params.retry_count, 2);
        assert_eq!(params.workdir, PathBuf::from("/tmp/linux"));
        assert_eq!(params.test_name, "baseline.login");
    }
}
