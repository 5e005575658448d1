use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use ftplite::cli::ServerOpts;
use ftplite::log::TransferLog;
use ftplite::logger::TextLogger;
use ftplite::Server;

fn main() -> Result<()> {
    let opts = ServerOpts::parse();
    let config = opts.config()?;

    let mut logger = TextLogger::new(&opts.log_file)
        .with_context(|| format!("Failed to open log file: {}", opts.log_file.display()))?
        .with_console(!opts.quiet);
    let mut journaled = None;
    if let Some(path) = &opts.transfer_log {
        journaled = Some(TransferLog::load(path)?.len());
        logger = logger.with_journal(TransferLog::open(path)?);
    }

    if !opts.quiet {
        println!("Starting ftplited:");
        println!("  Root: {}", config.root.display());
        println!("  Bind: {}", config.bind);
        println!("  Mode: {}", config.mode);
        if let Some(limit) = config.max_sessions {
            println!("  Session limit: {}", limit);
        }
        if let (Some(path), Some(count)) = (&opts.transfer_log, journaled) {
            println!("  Transfer log: {} ({} earlier transfers)", path.display(), count);
        }
    }

    let server = Server::bind(config, Arc::new(logger))?;
    let handle = server.handle();
    ctrlc::set_handler(move || {
        // A second Ctrl-C gives up on draining
        if handle.is_shutdown() {
            std::process::exit(130);
        }
        handle.shutdown();
    })
    .context("Failed to install Ctrl-C handler")?;

    server.run()
}
