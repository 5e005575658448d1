//! ftplite - interactive client
//!
//! Reads commands from stdin at an `ftp>` prompt. Transfers run in the
//! background; their results are printed as they finish.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use ftplite::cli::ClientOpts;
use ftplite::command::Command;
use ftplite::fs_enum::list_files;
use ftplite::logger::Logger;
use ftplite::protocol::HELP;
use ftplite::transfer::TransferOutcome;
use ftplite::Client;

const PROMPT: &str = "ftp> ";

/// Prints finished transfers over the current prompt line.
struct PromptLogger;

impl Logger for PromptLogger {
    fn transfer_done(&self, outcome: &TransferOutcome) {
        let mut out = io::stdout().lock();
        let _ = write!(out, "\r{}", outcome.summary());
        if let Some(err) = &outcome.error {
            let _ = write!(out, " ({})", err);
        }
        let _ = write!(out, "\n{}", PROMPT);
        let _ = out.flush();
    }
}

fn prompt() {
    print!("{}", PROMPT);
    let _ = io::stdout().flush();
}

fn print_names(names: &[String]) {
    for name in names {
        println!("{}", name);
    }
}

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    let mut client = Client::connect(&opts.host, opts.port, &opts.dir, Arc::new(PromptLogger))?;
    println!("Connected to {}", client.server_addr());

    let transfers = client.transfers();
    ctrlc::set_handler(move || {
        transfers.cancel_all();
        eprintln!("\nInterrupted");
        std::process::exit(130);
    })
    .context("Failed to install Ctrl-C handler")?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        prompt();
        // End of input behaves like quit
        let Some(line) = lines.next() else {
            println!();
            break;
        };
        let line = line.context("Failed to read from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let cmd = match Command::parse(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                println!("Invalid input: {}", e);
                println!("{}", HELP);
                continue;
            }
        };
        let result = match &cmd {
            Command::Quit => break,
            Command::Help => {
                println!("{}", HELP);
                Ok(())
            }
            Command::Lls => {
                match list_files(client.local_dir()) {
                    Ok(names) => print_names(&names),
                    Err(e) => println!("Can not list {}: {}", client.local_dir().display(), e),
                }
                Ok(())
            }
            Command::Ls => client.list().map(|names| print_names(&names)),
            Command::Get(name) => client.get(name).map(|_| ()),
            Command::Put(name) => client.put(name).map(|_| ()),
        };
        if let Err(e) = result {
            if e.is_fatal() {
                return Err(e).context("Lost connection to the server");
            }
            println!("{}", e);
        }
    }

    let outcomes = client.quit().context("Failed to close the session")?;
    let failed = outcomes.iter().filter(|o| !o.is_complete()).count();
    if failed > 0 {
        eprintln!("{} transfer(s) did not complete", failed);
    }
    Ok(())
}
