//! Chat command parsing
//!
//! Commands are recognised on the trimmed, lowercased line. Anything that
//! does not parse is plain chat, including unknown `/`-prefixed words.

/// Reply sent when `/name` has the wrong number of arguments
pub const INVALID_COMMAND: &str = "Invalid command";

/// A recognised command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/exit`: disconnect the issuer
    Exit,
    /// `/who`: list every session
    Who,
    /// `/stopserver`: stop the whole server
    StopServer,
    /// `/whoami`: tell the issuer its display name
    WhoAmI,
    /// `/name <newName>`
    Rename(String),
    /// `/name` with the wrong arity; still counts as handled
    InvalidArity,
}

impl Command {
    /// Parse a lowercased, trimmed line
    ///
    /// Returns `None` when the line is not a command.
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "/exit" => return Some(Self::Exit),
            "/who" => return Some(Self::Who),
            "/stopserver" => return Some(Self::StopServer),
            "/whoami" => return Some(Self::WhoAmI),
            _ => {}
        }

        // Split on single spaces so doubled spaces count as empty arguments
        let parts: Vec<&str> = line.split(' ').collect();
        match parts.as_slice() {
            ["/name", name] => Some(Self::Rename((*name).to_string())),
            ["/name", ..] => Some(Self::InvalidArity),
            _ => None,
        }
    }
}
