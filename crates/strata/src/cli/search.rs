//! `strata search` command implementation.

use std::path::Path;

use colored::Colorize;
use strata::SearchOptions;

use super::display::{print_results, print_search_errors};
use super::{Context, search_root};

/// Run the search command.
pub fn run(
    context: &Context,
    query: &str,
    path: Option<&Path>,
    limit: usize,
    files_only: bool,
) -> Result<(), strata::Error> {
    let root = search_root(path)?;
    let engine = context.engine()?;

    if files_only {
        let paths = engine.search_files_only(query, &root)?;
        if paths.is_empty() {
            println!("No files matching \"{query}\"");
            return Ok(());
        }
        for path in paths.iter().take(limit) {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let options = SearchOptions {
        total_limit: limit,
        ..context.config().search.clone()
    };
    let result = engine.search_with_options(query, &root, &options)?;

    if result.results.is_empty() {
        println!("No results for \"{query}\"");
        println!(
            "{}",
            format!(
                "Hint: run 'strata index {}' if the tree changed since it was indexed.",
                root.display()
            )
            .dimmed()
        );
        print_search_errors(&result.stats.errors);
        return Ok(());
    }

    println!(
        "{} {} results for \"{}\" ({} dirs, {:.1} ms):",
        "Found".cyan().bold(),
        result.results.len(),
        query,
        result.stats.dirs_searched,
        result.stats.time_ms
    );
    println!();
    print_results(&result.results);
    print_search_errors(&result.stats.errors);

    Ok(())
}
