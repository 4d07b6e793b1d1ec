//! Operator interaction

use std::io::{self, BufRead, Write};

/// The human running the ceremony
pub trait Operator {
    /// Display text to the operator
    fn show(&mut self, text: &str) -> io::Result<()>;

    /// Ask a question and read one line, without its line terminator.
    /// `None` means end of input.
    fn prompt(&mut self, question: &str) -> io::Result<Option<String>>;
}

/// Operator on the controlling terminal via stdout/stdin
#[derive(Debug, Default)]
pub struct TerminalOperator;

impl Operator for TerminalOperator {
    fn show(&mut self, text: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            stdout.write_all(b"\n")?;
        }
        stdout.flush()
    }

    fn prompt(&mut self, question: &str) -> io::Result<Option<String>> {
        {
            let mut stdout = io::stdout().lock();
            write!(stdout, "{}", question)?;
            stdout.flush()?;
        }

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(chomp(line)))
    }
}

/// Strip exactly one trailing line terminator
pub fn chomp(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}
