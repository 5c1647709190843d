//! `strata index` command implementation.

use std::path::Path;

use colored::Colorize;
use strata::IndexBuilder;

use super::Context;

const MAX_DISPLAY_ERRORS: usize = 5;

/// Run the index command.
pub fn run(context: &Context, path: &Path, force: bool) -> Result<(), strata::Error> {
    println!(
        "{} {}{}",
        "Indexing".cyan().bold(),
        path.display(),
        if force { " (forced)" } else { "" }
    );

    let registry = context.registry()?;
    let stats = IndexBuilder::new(registry).force(force).build(path)?;

    println!();
    println!("{}", "Index complete".green().bold());
    println!("  Files indexed:   {}", stats.files_indexed);
    println!("  Files unchanged: {}", stats.files_unchanged);
    if stats.files_removed > 0 {
        println!("  Files removed:   {}", stats.files_removed);
    }
    println!("  Directories:     {}", stats.dirs_indexed);
    println!("  Symbols found:   {}", stats.symbols_found);
    println!("  Duration:        {:.2?}", stats.duration);

    if !stats.errors.is_empty() {
        println!();
        println!(
            "{} ({} files):",
            "Errors".yellow().bold(),
            stats.errors.len()
        );
        for err in stats.errors.iter().take(MAX_DISPLAY_ERRORS) {
            println!("  {} {err}", "•".yellow());
        }
        if stats.errors.len() > MAX_DISPLAY_ERRORS {
            println!("  ... and {} more", stats.errors.len() - MAX_DISPLAY_ERRORS);
        }
    }

    Ok(())
}
