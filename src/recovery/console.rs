use std::fmt::Display;
use std::io::{self, BufRead, StdinLock, Stdout, Write};

use crate::errors::{AppError, Result};

/// Line-oriented operator prompt over any reader/writer pair.
pub struct Console<R, W> {
    input: R,
    output: W,
}

pub fn stdio() -> Console<StdinLock<'static>, Stdout> {
    Console::new(io::stdin().lock(), io::stdout())
}

impl<R: BufRead, W: Write> Console<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn say(&mut self, line: impl Display) -> Result<()> {
        writeln!(self.output, "{}", line)?;
        Ok(())
    }

    /// Reads one trimmed line. End of input aborts the session.
    pub fn ask(&mut self, question: &str) -> Result<String> {
        write!(self.output, "{}: ", question)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(AppError::Cancelled("input closed".to_string()));
        }
        Ok(line.trim().to_string())
    }

    pub fn ask_required(&mut self, question: &str) -> Result<String> {
        let answer = self.ask(question)?;
        if answer.is_empty() {
            return Err(AppError::InvalidInput(format!("{} is required", question)));
        }
        Ok(answer)
    }

    pub fn ask_optional(&mut self, question: &str) -> Result<Option<String>> {
        let answer = self.ask(&format!("{} (optional)", question))?;
        Ok((!answer.is_empty()).then_some(answer))
    }

    /// Picks an entry from a 1-based numbered list of `count` items; returns its 0-based index.
    pub fn choose(&mut self, question: &str, count: usize) -> Result<usize> {
        let answer = self.ask(&format!("{} [1-{}]", question, count))?;
        match answer.parse::<usize>() {
            Ok(n) if (1..=count).contains(&n) => Ok(n - 1),
            _ => Err(AppError::InvalidInput(format!(
                "'{}' is not a number between 1 and {}",
                answer, count
            ))),
        }
    }

    /// Requires the operator to type `phrase` exactly.
    pub fn confirm_phrase(&mut self, phrase: &str) -> Result<()> {
        let answer = self.ask(&format!("Type {} to continue", phrase))?;
        if answer != phrase {
            return Err(AppError::Cancelled(
                "confirmation phrase did not match, nothing was changed".to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn into_output(self) -> W {
        self.output
    }
}
