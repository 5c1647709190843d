//! Common display utilities for CLI commands.

use colored::Colorize;
use strata::{SearchError, SearchResult, SymbolKind};

const MAX_DISPLAY_ITEMS: usize = 5;

/// Print ranked results with their score, line range and excerpt.
pub fn print_results(results: &[SearchResult]) {
    for (rank, result) in results.iter().enumerate() {
        let location = match (result.start_line, result.end_line) {
            (Some(start), Some(end)) if start != end => {
                format!("{}:{start}-{end}", result.path.display())
            }
            (Some(start), _) => format!("{}:{start}", result.path.display()),
            _ => result.path.display().to_string(),
        };
        println!(
            "  {} {} {}",
            format!("{:>2}.", rank + 1).dimmed(),
            location.white().bold(),
            format!("({:.3})", result.score).dimmed()
        );
        if let (Some(name), Some(kind)) = (&result.symbol_name, result.symbol_kind) {
            println!("      {} {}", name.cyan(), format!("({})", format_kind(kind)).dimmed());
        }
        if let Some(excerpt) = &result.excerpt {
            let line = excerpt.lines().map(str::trim).find(|l| !l.is_empty());
            if let Some(line) = line {
                println!("      {}", line.dimmed());
            }
        }
    }
}

/// Print non-fatal search problems, truncated.
pub fn print_search_errors(errors: &[SearchError]) {
    if errors.is_empty() {
        return;
    }
    println!();
    println!("{} ({}):", "Warnings".yellow().bold(), errors.len());
    for err in errors.iter().take(MAX_DISPLAY_ITEMS) {
        println!("  {} {err}", "•".yellow());
    }
    if errors.len() > MAX_DISPLAY_ITEMS {
        println!("  ... and {} more", errors.len() - MAX_DISPLAY_ITEMS);
    }
}

/// Human-readable kind name.
pub fn format_kind(kind: SymbolKind) -> &'static str {
    match kind {
        SymbolKind::TypeAlias => "type alias",
        other => other.as_str(),
    }
}
