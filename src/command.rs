//! Command line parsing shared by the client prompt and the server session

use std::fmt;

use crate::error::{Error, Result};
use crate::protocol::verb;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get(String),
    Put(String),
    Ls,
    Quit,
    /// List the client's own directory
    Lls,
    Help,
}

impl Command {
    /// Tokenize on whitespace, lower-case the verb, and check the argument
    /// count. Anything else is an `InvalidCommand`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let verb = tokens
            .next()
            .ok_or_else(|| Error::InvalidCommand(line.to_string()))?
            .to_lowercase();
        let args: Vec<&str> = tokens.collect();

        let cmd = match (verb.as_str(), args.as_slice()) {
            (verb::GET, [name]) => Command::Get((*name).to_string()),
            (verb::PUT, [name]) => Command::Put((*name).to_string()),
            (verb::LS, []) => Command::Ls,
            (verb::QUIT, []) => Command::Quit,
            (verb::LLS, []) => Command::Lls,
            (verb::HELP, []) => Command::Help,
            _ => return Err(Error::InvalidCommand(line.trim().to_string())),
        };
        Ok(cmd)
    }

    /// Commands that travel over the control channel.
    pub fn is_remote(&self) -> bool {
        !matches!(self, Command::Lls | Command::Help)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Get(name) => write!(f, "{} {}", verb::GET, name),
            Command::Put(name) => write!(f, "{} {}", verb::PUT, name),
            Command::Ls => f.write_str(verb::LS),
            Command::Quit => f.write_str(verb::QUIT),
            Command::Lls => f.write_str(verb::LLS),
            Command::Help => f.write_str(verb::HELP),
        }
    }
}
