//! Terminal rendering: status lines, key/value details and tables, or the
//! raw response as JSON or YAML.

use anyhow::Result;
use clap::ValueEnum;
use colored::{ColoredString, Colorize};
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable details and tables
    #[default]
    Table,
    Json,
    Yaml,
}

enum Tag {
    Ok,
    Error,
    Warn,
    Info,
}

impl Tag {
    fn render(&self) -> ColoredString {
        match self {
            Self::Ok => "[OK]".green().bold(),
            Self::Error => "[ERROR]".red().bold(),
            Self::Warn => "[WARN]".yellow().bold(),
            Self::Info => "[INFO]".blue().bold(),
        }
    }
}

pub fn print_success(msg: &str) {
    println!("{} {}", Tag::Ok.render(), msg);
}

/// Errors go to stderr so `-o json` output stays parseable.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", Tag::Error.render(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", Tag::Warn.render(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", Tag::Info.render(), msg);
}

pub fn print_header(title: &str) {
    println!("\n{}\n", title.bold().underline());
}

pub fn print_detail(key: &str, value: impl std::fmt::Display) {
    println!("  {:<16} {}", format!("{}:", key).cyan(), value);
}

/// Rows as a table in table mode; otherwise the whole `value` it came from.
pub fn print_rows<R: Tabled, V: Serialize + ?Sized>(
    rows: &[R],
    value: &V,
    format: OutputFormat,
) -> Result<()> {
    if !matches!(format, OutputFormat::Table) {
        return print_item(value, format);
    }
    if rows.is_empty() {
        println!("{}", "Nothing to show.".dimmed());
    } else {
        let mut table = Table::new(rows);
        table
            .with(Style::rounded())
            .with(Modify::new(Columns::first()).with(Alignment::left()));
        println!("{}", table);
    }
    Ok(())
}

/// Structured output; table mode falls back to pretty JSON.
pub fn print_item<T: Serialize + ?Sized>(item: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(item)?),
        OutputFormat::Table | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item)?)
        }
    }
    Ok(())
}
