use std::io::BufRead;

use anyhow::{bail, Result};
use rustix::termios::{LocalModes, OptionalActions, Termios};

/// Reads one line from stdin with terminal echo turned off.
///
/// The original terminal settings come back when this is dropped.
pub struct PromptPassword {
    termios: Option<Termios>,
    prompt: String,
}

impl PromptPassword {
    pub fn new(prompt: &str) -> Result<Self> {
        let stdin = rustix::stdio::stdin();
        let termios = if rustix::termios::isatty(stdin) {
            Some(rustix::termios::tcgetattr(stdin)?)
        } else {
            None
        };

        Ok(Self {
            termios,
            prompt: prompt.to_string(),
        })
    }

    pub fn prompt(self) -> Result<String> {
        if let Some(termios) = &self.termios {
            let mut no_echo = termios.clone();
            no_echo.local_modes &= !LocalModes::ECHO;
            no_echo.local_modes |= LocalModes::ECHONL;
            rustix::termios::tcsetattr(std::io::stdin(), OptionalActions::Now, &no_echo)?;
        }
        println!("{}", self.prompt);

        let Some(line) = std::io::stdin().lock().lines().next() else {
            bail!("no password supplied on stdin");
        };
        Ok(line?)
    }
}

impl Drop for PromptPassword {
    fn drop(&mut self) {
        if let Some(termios) = &self.termios {
            _ = rustix::termios::tcsetattr(std::io::stdin(), OptionalActions::Now, termios);
        }
    }
}

/// First line of `path`, for unattended registration.
pub fn password_from_file(path: &std::path::Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)?;
    match contents.lines().next() {
        Some(line) if !line.is_empty() => Ok(line.to_string()),
        _ => bail!("the password file '{}' can't be empty", path.display()),
    }
}
