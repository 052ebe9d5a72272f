//! epoxy-client requests action documents from the ePoxy server and
//! executes them.
//!
//! The client is embedded in initram images served by ePoxy. Once the
//! network is up, it completes the actions for the current boot stage:
//! download the config for this stage, download the referenced artifacts,
//! and hand off (typically via kexec) to the next stage. Success or failure
//! is reported back to the server; a persistently failing machine is
//! rebooted so it can restart the sequence from stage 1.

mod download;
mod runner;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use epoxy_core::kargs;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::runner::Runner;

/// Give up on retries after this long and reboot instead.
const RETRY_DEADLINE: Duration = Duration::from_secs(6 * 60 * 60);

/// Pause between failed attempts.
const RETRY_PAUSE: Duration = Duration::from_secs(60);

/// ePoxy boot client.
#[derive(Parser, Debug)]
#[command(name = "epoxy-client")]
#[command(version, about, long_about = None)]
struct Args {
    /// Read kernel cmdline parameters from the contents of this file.
    #[arg(long, default_value = "/proc/cmdline")]
    cmdline: PathBuf,

    /// Execute the config loaded from the URL in this kernel parameter.
    #[arg(long, default_value = "epoxy.stage2")]
    action: String,

    /// Report success or errors to the URL in this kernel parameter.
    #[arg(long, default_value = "epoxy.report")]
    report: String,

    /// Request all configs but do not download or run commands. May still
    /// change state in the ePoxy server.
    #[arg(long)]
    dryrun: bool,

    /// Combine local kargs with those returned from the action URL.
    /// Existing kargs are never replaced. Only useful for stage1.
    #[arg(long = "add-kargs")]
    add_kargs: bool,

    /// Do not retry in case of failure.
    #[arg(long = "no-retry")]
    no_retry: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cmdline = std::fs::read_to_string(&args.cmdline)
        .with_context(|| format!("failed to read {}", args.cmdline.display()))?;
    info!(cmdline = cmdline.trim(), "parsed kernel parameters");
    let kargs = kargs::parse(&cmdline);

    let mut runner = Runner::new(kargs, args.dryrun, args.add_kargs)
        .context("failed to build HTTP clients")?;
    let deadline = Instant::now() + RETRY_DEADLINE;

    loop {
        let outcome = runner.run(&args.action);
        let message = match &outcome {
            Ok(()) => "success".to_string(),
            Err(err) => format!("error: {err}"),
        };
        info!(%message, "run finished");

        if let Err(err) = runner.report(&args.report, &message) {
            error!(%err, "failed to report result");
        }

        if outcome.is_ok() {
            return Ok(());
        }
        if args.no_retry {
            anyhow::bail!("action failed and retries are disabled: {message}");
        }
        if Instant::now() >= deadline {
            // Out of time: force the machine back to stage 1.
            error!(%message, "retry deadline exhausted, rebooting");
            reboot().context("failed to trigger reboot")?;
            return Ok(());
        }
        info!("waiting 1 minute before retrying");
        std::thread::sleep(RETRY_PAUSE);
    }
}

/// Forces an immediate reboot through the kernel's sysrq facility.
fn reboot() -> Result<()> {
    std::fs::write("/proc/sys/kernel/sysrq", b"1").context("failed to enable sysrq")?;
    std::fs::write("/proc/sysrq-trigger", b"b").context("failed to trigger sysrq reboot")?;
    Ok(())
}
