use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use scap_runner::{
    capabilities::{CapabilityProbe, Capabilities},
    diagnostics::{DiagnosticLevel, DiagnosticMessage, DiagnosticsSink},
    process::ProcessRunner,
    progress::RuleResult,
    request::{ArtifactKind, RemoteConnection, ScanOptions, ScanRequest, Tailoring},
    session::{ScanSession, SessionEvent, SessionReport, SessionState},
    transport::{RemoteTransport, SshTransport},
    RunnerConfig,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn build_cli() -> Command {
    let remote = Arg::new("remote")
        .short('r')
        .long("remote")
        .value_name("[USER@]HOST[:PORT]")
        .help("Scan a remote machine over ssh instead of the local one");
    let tool = Arg::new("tool")
        .long("tool")
        .value_name("PATH")
        .help("Scanner executable (default: oscap)");
    let json = Arg::new("json")
        .long("json")
        .help("Print the final report as JSON")
        .action(ArgAction::SetTrue);

    Command::new("scap-runner")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Run SCAP evaluations locally or over ssh with live per-rule progress")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: ~/.scap-runner.toml)")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Show debug logging")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Only show warnings and errors from the scanner")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("scan")
                .about("Evaluate a profile of an XCCDF file or source datastream")
                .arg(
                    Arg::new("input")
                        .value_name("INPUT")
                        .help("XCCDF or source datastream file")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("profile")
                        .short('p')
                        .long("profile")
                        .value_name("ID")
                        .help("Profile to evaluate")
                        .required(true),
                )
                .arg(remote.clone())
                .arg(
                    Arg::new("sudo")
                        .long("sudo")
                        .help("Run the remote scanner through 'sudo -n'")
                        .requires("remote")
                        .action(ArgAction::SetTrue),
                )
                .arg(tool.clone())
                .arg(
                    Arg::new("tailoring")
                        .long("tailoring-file")
                        .value_name("FILE")
                        .help("Tailoring file applied on top of the profile"),
                )
                .arg(
                    Arg::new("datastream-id")
                        .long("datastream-id")
                        .value_name("ID")
                        .help("Datastream to use from a datastream collection"),
                )
                .arg(
                    Arg::new("xccdf-id")
                        .long("xccdf-id")
                        .value_name("ID")
                        .help("XCCDF component to use from the datastream"),
                )
                .arg(
                    Arg::new("results")
                        .long("results")
                        .value_name("FILE")
                        .help("Write XCCDF results to FILE"),
                )
                .arg(
                    Arg::new("report")
                        .long("report")
                        .value_name("FILE")
                        .help("Write the HTML report to FILE"),
                )
                .arg(
                    Arg::new("arf")
                        .long("results-arf")
                        .value_name("FILE")
                        .help("Write the result datastream (ARF) to FILE"),
                )
                .arg(
                    Arg::new("output-dir")
                        .short('o')
                        .long("output-dir")
                        .value_name("DIR")
                        .help("Directory for result files without an explicit path"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .help("Only print the scanner command line")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("remediate")
                        .long("remediate")
                        .help("Run remediation of failed rules")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("online-remediation")
                        .long("online-remediation")
                        .help("Remediate each failed rule right after it is evaluated")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("fetch-remote-resources")
                        .long("fetch-remote-resources")
                        .help("Allow the scanner to download referenced content")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("skip-valid")
                        .long("skip-valid")
                        .help("Skip validation of the input content")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("niceness")
                        .long("nice")
                        .value_name("N")
                        .help("Run the local scanner with the given niceness")
                        .allow_negative_numbers(true)
                        .value_parser(clap::value_parser!(i32)),
                )
                .arg(json.clone()),
        )
        .subcommand(
            Command::new("capabilities")
                .about("Show the scanner version and supported features")
                .arg(remote)
                .arg(tool)
                .arg(json),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<RunnerConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => RunnerConfig::from_toml_file(path)?,
        None => RunnerConfig::load_default_config(),
    };

    if let Some(tool) = matches.get_one::<String>("tool") {
        config.tool_path = tool.clone();
    }
    Ok(config)
}

fn build_request(matches: &ArgMatches) -> anyhow::Result<ScanRequest> {
    let input = matches
        .get_one::<String>("input")
        .map(PathBuf::from)
        .unwrap_or_default();
    let profile = matches.get_one::<String>("profile").cloned().unwrap_or_default();

    let mut request = match matches.get_one::<String>("remote") {
        Some(remote) => {
            let connection: RemoteConnection = remote.parse()?;
            ScanRequest::remote(input, profile, connection.with_sudo(matches.get_flag("sudo")))
        }
        None => ScanRequest::local(input, profile),
    };

    if let Some(tailoring) = matches.get_one::<String>("tailoring") {
        request = request.with_tailoring(Tailoring::File(PathBuf::from(tailoring)));
    }
    if let Some(id) = matches.get_one::<String>("datastream-id") {
        request = request.with_datastream_id(id);
    }
    if let Some(id) = matches.get_one::<String>("xccdf-id") {
        request = request.with_xccdf_id(id);
    }

    let explicit: Vec<(ArtifactKind, &String)> = [
        (ArtifactKind::Results, "results"),
        (ArtifactKind::Report, "report"),
        (ArtifactKind::Arf, "arf"),
    ]
    .into_iter()
    .filter_map(|(kind, name)| matches.get_one::<String>(name).map(|path| (kind, path)))
    .collect();

    // explicit outputs replace the default "everything" selection
    if !explicit.is_empty() {
        let kinds: Vec<ArtifactKind> = explicit.iter().map(|(kind, _)| *kind).collect();
        request = request.with_outputs(&kinds);
        for (kind, path) in explicit {
            request = request.with_output_path(kind, path);
        }
    }
    if let Some(dir) = matches.get_one::<String>("output-dir") {
        request = request.with_output_dir(dir);
    }

    Ok(request.with_options(ScanOptions {
        dry_run: matches.get_flag("dry-run"),
        fetch_remote_resources: matches.get_flag("fetch-remote-resources"),
        remediate: matches.get_flag("remediate"),
        online_remediation: matches.get_flag("online-remediation"),
        skip_valid: matches.get_flag("skip-valid"),
    }))
}

fn colored_result(result: RuleResult) -> ColoredString {
    let text = format!("{:<14}", result.as_str());
    match result {
        RuleResult::Pass | RuleResult::Fixed => text.bright_green(),
        RuleResult::Fail => text.bright_red(),
        RuleResult::Error | RuleResult::Unknown => text.bright_magenta(),
        RuleResult::Processing => text.bright_blue(),
        _ => text.bright_white(),
    }
}

fn print_diagnostic(bar: &ProgressBar, message: &DiagnosticMessage, quiet: bool) {
    let line = match message.level {
        DiagnosticLevel::Info if quiet => return,
        DiagnosticLevel::Info => format!("[~] {}", message.text).dimmed().to_string(),
        DiagnosticLevel::Warning => format!("[!] {}", message.text).bright_yellow().to_string(),
        DiagnosticLevel::Error | DiagnosticLevel::Exception => {
            format!("[!] {}", message.text).bright_red().to_string()
        }
    };
    bar.println(line);
}

fn print_summary(report: &SessionReport) {
    let state = match report.state {
        SessionState::Finished => report.state.to_string().bright_green().bold(),
        SessionState::Cancelled => report.state.to_string().bright_yellow().bold(),
        _ => report.state.to_string().bright_red().bold(),
    };

    println!("{}", "------------------------------------------------------".bright_blue());
    println!("Scan {} in {:.1}s", state, report.duration.as_secs_f64());

    let count = |result: RuleResult| report.progress.iter().filter(|p| p.result == result).count();
    println!(
        "Rules: {} evaluated, {} pass, {} fail, {} error",
        report.progress.len().to_string().bright_cyan(),
        count(RuleResult::Pass).to_string().bright_green(),
        count(RuleResult::Fail).to_string().bright_red(),
        count(RuleResult::Error).to_string().bright_magenta()
    );

    for kind in ArtifactKind::ALL {
        if let Some(path) = report.artifacts.get(kind) {
            println!("{}: {}", kind, path.display().to_string().bright_cyan());
        }
    }

    if let Some(failure) = &report.failure {
        println!("{} {} ({})", "[!]".bright_red(), failure.message, failure.stage);
    }
}

fn print_capabilities(caps: &Capabilities) {
    println!("Scanner version: {}", caps.raw_version.bright_cyan().bold());
    for (name, supported) in caps.features() {
        let mark = if supported { "[✓]".bright_green() } else { "[✗]".bright_red() };
        println!("  {} {}", mark, name);
    }

    let specs = [
        ("XCCDF", &caps.xccdf_version),
        ("OVAL", &caps.oval_version),
        ("CPE", &caps.cpe_version),
        ("Script check engine", &caps.sce_version),
    ];
    for (name, version) in specs {
        if let Some(version) = version {
            println!("  {} {}", name.bright_white(), version);
        }
    }
}

async fn run_scan(matches: &ArgMatches, mut config: RunnerConfig, quiet: bool) -> anyhow::Result<i32> {
    if let Some(niceness) = matches.get_one::<i32>("niceness") {
        config.niceness = Some(*niceness);
    }

    let request = build_request(matches)?;
    let json = matches.get_flag("json");
    let mut handle = ScanSession::new(request, config)?.spawn();

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "[~] Interrupted, cancelling the scan...".bright_yellow());
            cancel.cancel();
        }
    });

    let bar = if json {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    };

    let mut evaluated = 0usize;
    let mut state = SessionState::Idle;
    while let Some(event) = handle.next_event().await {
        let terminal = event.is_terminal();
        match event {
            SessionEvent::StateChanged(next) => {
                state = next;
                bar.set_message(state.to_string());
            }
            SessionEvent::Progress(progress) => {
                evaluated += 1;
                bar.set_message(format!("{} - {} rules evaluated", state, evaluated));
                bar.println(format!("{} {}", colored_result(progress.result), progress.rule_id));
            }
            SessionEvent::Diagnostic(message) => print_diagnostic(&bar, &message, quiet),
        }
        if terminal {
            break;
        }
    }
    bar.finish_and_clear();

    let report = handle.wait().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    Ok(match report.state {
        SessionState::Finished => 0,
        SessionState::Cancelled => 130,
        _ => 1,
    })
}

async fn run_capabilities(matches: &ArgMatches, config: RunnerConfig) -> anyhow::Result<i32> {
    let config = Arc::new(config);
    let runner = ProcessRunner::new(config.termination_grace(), DiagnosticsSink::new());

    let caps = match matches.get_one::<String>("remote") {
        Some(remote) => {
            let connection: RemoteConnection = remote.parse()?;
            let mut transport = SshTransport::new(connection, Arc::clone(&config), runner);
            transport.connect().await?;
            let probed = CapabilityProbe::remote(&config.tool_path, &transport).probe().await;
            if let Err(e) = transport.disconnect().await {
                log::warn!("{}", e);
            }
            probed?
        }
        None => {
            CapabilityProbe::local(&config.tool_path, &runner, config.transport_timeout())
                .probe()
                .await?
        }
    };

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&caps)?);
    } else {
        print_capabilities(&caps);
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    let verbose = matches
        .subcommand()
        .map(|(_, sub)| sub.get_flag("verbose"))
        .unwrap_or(false);
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let result = match matches.subcommand() {
        Some(("scan", sub)) => match load_config(sub) {
            Ok(config) => run_scan(sub, config, sub.get_flag("quiet")).await,
            Err(e) => Err(e),
        },
        Some(("capabilities", sub)) => match load_config(sub) {
            Ok(config) => run_capabilities(sub, config).await,
            Err(e) => Err(e),
        },
        _ => Ok(2),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "[!] ERROR:".bright_red(), e);
            process::exit(1);
        }
    }
}
