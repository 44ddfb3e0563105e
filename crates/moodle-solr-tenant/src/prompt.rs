//! Typed confirmations for destructive operations.

use std::io::{self, BufRead, Write};

pub trait Prompt: Send + Sync {
    /// Shows `message` and asks the operator to type `phrase`. Anything else,
    /// including end of input, declines.
    fn confirm(&self, message: &str, phrase: &str) -> io::Result<bool>;
}

/// Asks on stderr and reads the answer from stdin.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn confirm(&self, message: &str, phrase: &str) -> io::Result<bool> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{message}")?;
        write!(stderr, "Type '{phrase}' to continue: ")?;
        stderr.flush()?;

        read_confirmation(&mut io::stdin().lock(), phrase)
    }
}

fn read_confirmation(input: &mut impl BufRead, phrase: &str) -> io::Result<bool> {
    let mut answer = String::new();
    if input.read_line(&mut answer)? == 0 {
        return Ok(false);
    }
    Ok(answer.trim_end_matches(['\r', '\n']) == phrase)
}
