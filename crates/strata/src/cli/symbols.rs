//! `strata symbols` command implementation.

use std::path::Path;

use colored::Colorize;
use strata::SymbolKind;

use super::display::format_kind;
use super::{Context, search_root};

/// Run the symbols command.
pub fn run(
    context: &Context,
    name: &str,
    path: Option<&Path>,
    kind: Option<&str>,
    limit: usize,
) -> Result<(), strata::Error> {
    let kind = kind
        .map(str::parse::<SymbolKind>)
        .transpose()
        .map_err(strata::Error::Config)?;
    let root = search_root(path)?;
    let engine = context.engine()?;

    let symbols = engine.search_symbols(name, &root, kind, limit)?;

    if symbols.is_empty() {
        println!("No symbols matching \"{name}\"");
        return Ok(());
    }

    println!(
        "{} {} symbols matching \"{name}\":",
        "Found".cyan().bold(),
        symbols.len()
    );
    println!();

    for symbol in &symbols {
        let location = symbol
            .file_path
            .as_deref()
            .map_or_else(String::new, |p| format!("{}:{}", p.display(), symbol.start_line));
        println!(
            "  {} {} {}",
            symbol.name.white().bold(),
            format!("({})", format_kind(symbol.kind)).dimmed(),
            location.cyan()
        );
    }

    Ok(())
}
