//! Terminal output for status lines and agent text.
//!
//! Status, notices and approvals go to stderr; only the agent's own text is
//! written to stdout so it can be piped.

use crossterm::style::{Color, Stylize};
use std::io::{self, Write};

const LABEL_WARNING: &str = "warning:";
const LABEL_ERROR: &str = "error:";
const GLYPH_BULLET: &str = "•";
const INDENT: &str = "  ";

/// Most source lines shown in a tool output block.
const BLOCK_PREVIEW_LINES: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    /// Streamed assistant text, written without a newline.
    pub fn assistant_delta(&self, text: &str) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    /// A complete assistant message.
    pub fn assistant_message(&self, text: &str) {
        println!("{}", text.trim_end());
    }

    pub fn warn(&self, msg: &str) {
        if self.color {
            eprintln!("\r{} {msg}", LABEL_WARNING.with(Color::Yellow).bold());
        } else {
            eprintln!("\r{LABEL_WARNING} {msg}");
        }
    }

    pub fn error(&self, msg: &str) {
        if self.color {
            eprintln!("\r{} {msg}", LABEL_ERROR.with(Color::Red).bold());
        } else {
            eprintln!("\r{LABEL_ERROR} {msg}");
        }
    }

    pub fn section(&self, title: &str) {
        if self.color {
            eprintln!(
                "\r{} {}",
                GLYPH_BULLET.with(Color::DarkGrey),
                title.with(Color::Cyan).bold()
            );
        } else {
            eprintln!("\r{title}:");
        }
    }

    /// Lifecycle text such as notices and tool starts.
    pub fn activity(&self, text: &str) {
        if self.color {
            eprintln!(
                "\r{} {}",
                GLYPH_BULLET.with(Color::DarkGrey),
                text.with(Color::Grey).bold()
            );
        } else {
            eprintln!("\r{text}");
        }
    }

    pub fn field(&self, key: &str, value: &str) {
        if self.color {
            eprintln!(
                "\r{INDENT}{} {}",
                format!("{key}:").with(Color::DarkGrey),
                value.with(Color::White)
            );
        } else {
            eprintln!("\r{INDENT}{key}: {value}");
        }
    }

    pub fn detail(&self, text: &str) {
        for line in text.lines() {
            if self.color {
                eprintln!("\r{INDENT}{}", line.with(Color::DarkGrey));
            } else {
                eprintln!("\r{INDENT}{line}");
            }
        }
    }

    /// Indented preview of command output, clipped to a few lines.
    pub fn output_block(&self, text: &str) {
        self.detail(&block_preview(text, BLOCK_PREVIEW_LINES));
    }

    pub fn approval_block(&self, command: &str) {
        let block = format_command_block(command);
        for line in block.lines() {
            if self.color {
                eprintln!("\r{INDENT}{}", line.with(Color::Magenta).bold());
            } else {
                eprintln!("\r{INDENT}{line}");
            }
        }
    }
}

/// `$ `-prefixed command, continuation lines indented to match.
pub fn format_command_block(command: &str) -> String {
    if command.trim().is_empty() {
        return "$".to_string();
    }
    command
        .lines()
        .enumerate()
        .map(|(idx, line)| {
            if idx == 0 {
                format!("$ {line}")
            } else {
                format!("  {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First `max_lines` lines of `text`, with a count of what was left out.
pub fn block_preview(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    if lines.len() <= max_lines {
        return lines.join("\n");
    }
    let hidden = lines.len() - max_lines;
    format!("{}\n... ({hidden} more lines)", lines[..max_lines].join("\n"))
}
