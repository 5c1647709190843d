//! `strata status` command implementation.

use colored::Colorize;
use strata::GlobalSymbolIndex;
use strata::global_index::global_index_db;

use super::Context;

/// Run the status command.
pub fn run(context: &Context) -> Result<(), strata::Error> {
    let registry = context.registry()?;
    let projects = registry.list_projects()?;

    println!(
        "{} {}",
        "Index root:".cyan().bold(),
        registry.mapper().index_root().display()
    );

    if projects.is_empty() {
        println!();
        println!("No projects indexed");
        println!("{}", "Hint: run 'strata index <path>' to add one.".dimmed());
        return Ok(());
    }

    for project in &projects {
        println!();
        println!("{}", project.source_root.display().to_string().white().bold());
        println!("  Index:       {}", project.index_root.display());
        println!("  Files:       {}", project.total_files);
        println!("  Directories: {}", project.total_dirs);

        let db = global_index_db(registry.mapper(), &project.source_root);
        if db.exists() {
            let symbols = GlobalSymbolIndex::open(&db, project.id)?.len()?;
            println!("  Symbols:     {symbols}");
        }

        match project.last_indexed {
            Some(ts) => println!("  Indexed:     {}", format_age(now_secs() - ts)),
            None => println!("  Indexed:     {}", "never".dimmed()),
        }
    }

    Ok(())
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn format_age(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}
