use std::fmt::Display;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use sender_verifier::dkim::DkimLocator;
use sender_verifier::{
    Address, Config, DnsResolver, PlainReport, RunMode, SmtpDialer, Verifier, logging,
    tls_connector,
};

/// Reads a message on stdin and mails its sender a report on how their
/// domain's mail infrastructure looks from the outside.
#[derive(Parser)]
struct Cli {
    /// Envelope sender of the message
    #[arg(short, long, env = "SENDER")]
    sender: Option<String>,

    /// Path to the config file (default ~/.nyms/verify_config)
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Log to stderr and print the report instead of sending it
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            logging::init(Path::new(""), true);
            fatal(e);
        }
    };
    logging::init(&config.log_path, cli.debug);

    if let Err(e) = run(&cli, &config).await {
        fatal(format!("{:#}", e));
    }
}

async fn run(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let sender = match cli.sender.as_deref() {
        Some(s) if !s.trim().is_empty() => s.trim(),
        _ => bail!("no sender given with -s and SENDER is not set"),
    };
    let sender = Address::from_mailbox(sender)?;

    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .context("error reading message from stdin")?;
    log::info!("verifying {} ({} byte message)", sender, raw.len());

    let tls = tls_connector(config.network.ca_bundle.as_deref())?;
    let mode = if cli.debug {
        RunMode::Debug
    } else {
        RunMode::Deliver
    };

    let mut verifier = Verifier::new(
        DnsResolver::new()?,
        SmtpDialer::new(config.smtp_options(), tls),
        DkimLocator::new(config.nameserver_source(), config.dns_timeout()),
        PlainReport,
        mode,
        Box::new(std::io::stdout()),
    );
    let disposition = verifier.process(config, &sender, &raw).await?;
    log::debug!("finished: {:?}", disposition);
    Ok(())
}

/// Logs and exits cleanly so the delivering MTA never bounces the message.
fn fatal(err: impl Display) -> ! {
    log::error!("{}", err);
    std::process::exit(0)
}
