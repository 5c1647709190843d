//! `strata cascade` command implementation.

use std::path::Path;

use colored::Colorize;
use strata::CascadeMode;

use super::display::{print_results, print_search_errors};
use super::{Context, search_root};

/// Run the cascade command.
pub fn run(
    context: &Context,
    query: &str,
    path: Option<&Path>,
    mode: &str,
    limit: Option<usize>,
) -> Result<(), strata::Error> {
    let mode: CascadeMode = mode.parse().map_err(strata::Error::Config)?;
    let root = search_root(path)?;
    let engine = context.engine()?;

    let cascade = &context.config().cascade;
    let k = limit.unwrap_or(cascade.target_count);
    let result = engine.cascade_search(mode, query, &root, k, cascade.coarse_k)?;

    if let Some(stats) = &result.cascade {
        let fallback = if stats.stage1_fallback_used == 1 {
            " (text fallback)"
        } else {
            ""
        };
        println!(
            "{} {mode}: {} candidates{fallback}, +{} expanded, {} clustered, {} reranked",
            "Cascade".cyan().bold(),
            stats.stage1_candidates,
            stats.stage2_expanded,
            stats.stage3_clustered,
            stats.stage4_reranked,
        );
    }

    if result.results.is_empty() {
        println!("No results for \"{query}\"");
        print_search_errors(&result.stats.errors);
        return Ok(());
    }

    println!();
    print_results(&result.results);
    print_search_errors(&result.stats.errors);

    Ok(())
}
