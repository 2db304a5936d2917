//! Terminal prompts

use std::io::{self, BufRead, BufReader, IsTerminal, Stdin, Stdout, Write};
use std::sync::Mutex;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use keel_common::{Error, Result};
use keel_restore::Prompt;

/// [`Prompt`] reading answers line by line from a terminal.
///
/// When attached to a tty, passwords are read in raw mode so the typed
/// characters are never echoed.
pub struct TerminalPrompt<R, W> {
    io: Mutex<(R, W)>,
    hide_secrets: bool,
}

impl TerminalPrompt<BufReader<Stdin>, Stdout> {
    /// Prompt on the process's stdin and stdout
    pub fn stdio() -> Self {
        let hide_secrets = io::stdin().is_terminal();
        Self {
            hide_secrets,
            ..Self::new(BufReader::new(io::stdin()), io::stdout())
        }
    }
}

/// What a key press does to a secret being typed
#[derive(Debug, PartialEq, Eq)]
enum SecretKey {
    Continue,
    Submit,
    Abort,
}

fn edit_secret(secret: &mut String, key: KeyEvent) -> SecretKey {
    if key.kind == KeyEventKind::Release {
        return SecretKey::Continue;
    }
    match key.code {
        KeyCode::Enter => SecretKey::Submit,
        KeyCode::Char('c') | KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            SecretKey::Abort
        }
        KeyCode::Char(c) => {
            secret.push(c);
            SecretKey::Continue
        }
        KeyCode::Backspace => {
            secret.pop();
            SecretKey::Continue
        }
        _ => SecretKey::Continue,
    }
}

fn read_secret_keys() -> io::Result<Option<String>> {
    let mut secret = String::new();
    loop {
        if let Event::Key(key) = event::read()? {
            match edit_secret(&mut secret, key) {
                SecretKey::Continue => {}
                SecretKey::Submit => return Ok(Some(secret)),
                SecretKey::Abort => return Ok(None),
            }
        }
    }
}

impl<R: BufRead, W: Write> TerminalPrompt<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new((reader, writer)),
            hide_secrets: false,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, (R, W)>> {
        self.io
            .lock()
            .map_err(|_| Error::internal_with_context("prompt", "terminal lock poisoned"))
    }

    fn ask(&self, question: &str) -> Result<String> {
        let mut guard = self.lock()?;
        let (reader, writer) = &mut *guard;

        write!(writer, "{} ", question).map_err(io_err)?;
        writer.flush().map_err(io_err)?;

        let mut line = String::new();
        if reader.read_line(&mut line).map_err(io_err)? == 0 {
            return Err(Error::validation(format!("no answer given to {:?}", question)));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn ask_hidden(&self, question: &str) -> Result<String> {
        let mut guard = self.lock()?;
        let (_, writer) = &mut *guard;

        write!(writer, "{} ", question).map_err(io_err)?;
        writer.flush().map_err(io_err)?;

        terminal::enable_raw_mode().map_err(io_err)?;
        let secret = read_secret_keys();
        let restored = terminal::disable_raw_mode();
        writeln!(writer).map_err(io_err)?;
        restored.map_err(io_err)?;

        match secret.map_err(io_err)? {
            Some(secret) => Ok(secret),
            None => Err(Error::stopped(format!("no answer given to {:?}", question))),
        }
    }
}

fn io_err(e: io::Error) -> Error {
    Error::internal_with_context("prompt", e.to_string())
}

impl<R, W> Prompt for TerminalPrompt<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            let answer = self.ask(&format!("{} {}", message, hint))?;
            match answer.trim().to_ascii_lowercase().as_str() {
                "" => return Ok(default),
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => continue,
            }
        }
    }

    fn input(&self, message: &str, default: &str, required: bool) -> Result<String> {
        let question = if default.is_empty() {
            message.to_string()
        } else {
            format!("{} [{}]", message, default)
        };
        loop {
            let answer = self.ask(&question)?;
            if !answer.trim().is_empty() {
                return Ok(answer);
            }
            if !default.is_empty() || !required {
                return Ok(default.to_string());
            }
        }
    }

    fn password(&self, message: &str) -> Result<String> {
        if self.hide_secrets {
            self.ask_hidden(message)
        } else {
            self.ask(message)
        }
    }
}
