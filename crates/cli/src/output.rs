//! Terminal output: colored per-image status lines and JSON.
//!
//! Successes and informational lines go to stdout; failures and skips go to
//! stderr so a failing run still shows its per-image summary when stdout is
//! redirected.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const SKIPPED: &str = "-";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Success,
  Error,
  Skipped,
  Info,
}

impl Status {
  fn symbol(self) -> &'static str {
    match self {
      Status::Success => symbols::SUCCESS,
      Status::Error => symbols::ERROR,
      Status::Skipped => symbols::SKIPPED,
      Status::Info => symbols::INFO,
    }
  }

  fn stream(self) -> Stream {
    match self {
      Status::Success | Status::Info => Stream::Stdout,
      Status::Error | Status::Skipped => Stream::Stderr,
    }
  }
}

/// Print `message` behind the status symbol on the status's stream.
pub fn print_status(status: Status, message: &str) {
  let stream = status.stream();
  let raw_symbol = status.symbol();
  let symbol = raw_symbol.if_supports_color(stream, |s| match status {
    Status::Success => s.green().to_string(),
    Status::Error => s.red().to_string(),
    Status::Skipped => s.yellow().to_string(),
    Status::Info => s.blue().to_string(),
  });

  match stream {
    Stream::Stdout => println!("{symbol} {message}"),
    _ => eprintln!("{symbol} {message}"),
  }
}

pub fn print_success(message: &str) {
  print_status(Status::Success, message);
}

pub fn print_error(message: &str) {
  print_status(Status::Error, message);
}

pub fn print_skipped(message: &str) {
  print_status(Status::Skipped, message);
}

pub fn print_info(message: &str) {
  print_status(Status::Info, message);
}

/// An indented `label: value` line.
pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

/// Wall-clock time rounded to whole seconds, e.g. `1m 5s`.
pub fn format_elapsed(elapsed: Duration) -> String {
  if elapsed < Duration::from_secs(1) {
    return format!("{}ms", elapsed.as_millis());
  }
  humantime::format_duration(Duration::from_secs(elapsed.as_secs())).to_string()
}

pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{json}");
  Ok(())
}
