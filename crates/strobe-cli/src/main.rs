//! strobescan entry point

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use strobe_cli::{Args, NdjsonSink, OutputFormat, TextSink};
use strobe_core::{OutputSink, ResumeState};
use strobe_network::{Datalink, LinkType, NullLink};
use strobe_scanner::{LogStatus, ScanFlags, Scanner};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

static CTRL_C_PRESSES: AtomicU32 = AtomicU32::new(0);
static SCAN_FLAGS: OnceLock<Arc<ScanFlags>> = OnceLock::new();

/// First press stops transmit, second stops receive, third gives up
#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    let presses = CTRL_C_PRESSES.fetch_add(1, Ordering::SeqCst);
    if let Some(flags) = SCAN_FLAGS.get() {
        match presses {
            0 => flags.set_finish_tx(),
            1 => flags.set_finish_rx(),
            _ => std::process::exit(1),
        }
    }
}

#[cfg(unix)]
fn install_sigint() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_sigint() {}

fn run() -> anyhow::Result<bool> {
    let args = Args::parse();

    if args.list_modules {
        println!("scan modules:");
        for name in strobe_scanner::list_scan_modules() {
            let module = strobe_scanner::create_scan_module(name).unwrap();
            println!("  {:12} {}", name, module.desc());
        }
        println!("probe modules:");
        for name in strobe_scanner::list_probe_modules() {
            let probe = strobe_scanner::create_probe_module(name).unwrap();
            println!("  {:12} {}", name, probe.desc());
        }
        return Ok(false);
    }

    let mut config = args.to_config().context("invalid configuration")?;
    let targets = args.build_targets().context("invalid targets")?;

    // continuing an interrupted scan reuses its seed and position
    if let Some(path) = &args.resume {
        let state = ResumeState::load(path).context("cannot load resume state")?;
        if config.seed != 0 {
            state.check_compatible(config.seed, config.shard)?;
        }
        config.seed = state.seed;
        config.shard = state.shard;
        config.resume_index = state.index;
        info!("resuming at index {} with seed {:#x}", state.index, state.seed);
    }

    // The live capture path (raw sockets / libpcap, NIC discovery) plugs in
    // at the Datalink seam and ships separately; this binary carries the
    // offline backend.
    let link: Arc<dyn Datalink> = if config.offline {
        Arc::new(NullLink::new(LinkType::Ethernet))
    } else {
        anyhow::bail!(
            "no live capture backend in this build; \
             run with --offline or plug a capture backend into the datalink seam"
        );
    };

    let sink: Box<dyn OutputSink> = match args.output {
        OutputFormat::Text => Box::new(TextSink::create(args.output_file.as_deref())?),
        OutputFormat::Ndjson => Box::new(NdjsonSink::create(args.output_file.as_deref())?),
    };

    let mut scanner = Scanner::new(config, targets, link, sink)?;
    SCAN_FLAGS
        .set(scanner.flags())
        .ok()
        .context("scanner initialized twice")?;
    install_sigint();

    let summary = scanner.run(&mut LogStatus)?;
    info!(
        "done in {:.1}s: {} sent, {} found, {} failed, {} info{}",
        summary.elapsed.as_secs_f64(),
        summary.total_sent,
        summary.total_success,
        summary.total_failed,
        summary.total_info,
        if summary.interrupted { " (interrupted)" } else { "" },
    );
    Ok(summary.interrupted)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    match run() {
        // an interrupted scan is still a successful exit
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            if CTRL_C_PRESSES.load(Ordering::SeqCst) > 0 {
                warn!("scan aborted by interrupt");
            }
            ExitCode::FAILURE
        }
    }
}
