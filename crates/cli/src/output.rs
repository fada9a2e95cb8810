//! Output formatting utilities

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table of rows, or the raw objects as JSON
pub fn print_table<T: Tabled, S: Serialize>(rows: Vec<T>, objects: &S, format: OutputFormat, what: &str) {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                print_warning(&format!("No {} found", what));
                return;
            }
            let count = rows.len();
            let table = Table::new(rows).with(Style::rounded()).to_string();
            println!("{}", table);
            println!("\nTotal: {} {}", count, what);
        }
        OutputFormat::Json => print_json(objects),
    }
}

pub fn print_json<S: Serialize>(value: &S) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => print_error(&format!("Failed to serialize output: {}", e)),
    }
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// `cpu=250m, memory=200Mi`, or `-` when empty
pub fn format_resources(list: &BTreeMap<String, Quantity>) -> String {
    if list.is_empty() {
        return "-".to_string();
    }
    list.iter()
        .map(|(name, quantity)| format!("{}={}", name, quantity.0))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Coarse age like `kubectl` prints: `45s`, `12m`, `5h`, `3d`
pub fn format_age(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(since) = since else {
        return "-".to_string();
    };
    let secs = (now - since).num_seconds().max(0);
    match secs {
        s if s < 120 => format!("{}s", s),
        s if s < 2 * 3600 => format!("{}m", s / 60),
        s if s < 2 * 86400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86400),
    }
}

pub fn format_optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Color an update mode by how disruptive it is
pub fn color_mode(mode: &str) -> String {
    match mode {
        "Off" => mode.dimmed().to_string(),
        "Initial" => mode.blue().to_string(),
        "Recreate" | "Auto" => mode.green().to_string(),
        "InPlaceOrRecreate" => mode.cyan().to_string(),
        _ => mode.to_string(),
    }
}

/// Color a condition status
pub fn color_condition(status: &str) -> String {
    match status {
        "True" => status.green().to_string(),
        "False" => status.red().to_string(),
        _ => status.yellow().to_string(),
    }
}
