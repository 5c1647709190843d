//! Integration tests for symbol lookup through the global index and the
//! directory chain.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::Fixture;
use rstest::rstest;
use strata::global_index::global_index_db;
use strata::{
    ChainSearchEngine, EngineConfig, GlobalSymbolIndex, ProjectId, Symbol, SymbolKind,
};

fn auth_project() -> Fixture {
    let fixture = Fixture::new(&[
        ("src/auth.py", "class AuthManager:\n    pass\n"),
        ("src/session.py", "fn login() { check() }\nfn check() {}\n"),
    ]);
    fixture.index();
    fixture
}

fn engine(fixture: &Fixture, fast_path: bool) -> ChainSearchEngine {
    let mut config = EngineConfig::default();
    config.search.enable_global_index_fast_path = fast_path;
    ChainSearchEngine::new(Arc::clone(&fixture.registry), config).expect("failed to create engine")
}

fn project_id(fixture: &Fixture) -> ProjectId {
    fixture
        .registry
        .find_project(&fixture.root)
        .expect("lookup failed")
        .expect("project registered")
        .id
}

#[rstest]
#[case(true)]
#[case(false)]
fn prefix_lookup_finds_the_class(#[case] fast_path: bool) {
    let fixture = auth_project();

    let symbols = engine(&fixture, fast_path)
        .search_symbols("Auth", &fixture.path("src"), None, 20)
        .expect("symbol search failed");

    assert_eq!(symbols.len(), 1);
    assert_eq!(symbols[0].name, "AuthManager");
    assert_eq!(symbols[0].kind.as_str(), "class");
    assert_eq!(symbols[0].start_line, 1);
}

#[test]
fn kind_filter_narrows_results() {
    let fixture = auth_project();
    let engine = engine(&fixture, true);

    let functions = engine
        .search_symbols("check", &fixture.root, Some(SymbolKind::Function), 20)
        .expect("symbol search failed");
    assert_eq!(functions.len(), 1);

    let classes = engine
        .search_symbols("check", &fixture.root, Some(SymbolKind::Class), 20)
        .expect("symbol search failed");
    assert!(classes.is_empty());
}

#[test]
fn reindexing_replaces_file_symbols() {
    let fixture = auth_project();
    common::write_file(&fixture.root, "src/auth.py", "class TokenStore:\n    pass\n");
    fixture.index();

    let engine = engine(&fixture, true);
    assert!(
        engine
            .search_symbols("Auth", &fixture.root, None, 20)
            .expect("symbol search failed")
            .is_empty()
    );
    assert_eq!(
        engine
            .search_symbols("TokenStore", &fixture.root, None, 20)
            .expect("symbol search failed")
            .len(),
        1
    );
}

#[test]
fn update_file_symbols_is_a_full_replace() {
    let fixture = auth_project();
    let db = global_index_db(fixture.registry.mapper(), &fixture.root);
    let global = GlobalSymbolIndex::open(&db, project_id(&fixture)).expect("open global index");
    let file = fixture.path("src/extra.py");
    let index_path = Path::new("/unused/_index.db");
    let sym = |name: &str, line: u32| {
        Symbol::new(name, SymbolKind::Function, line, line)
            .expect("valid symbol")
            .with_file_path(&file)
    };

    global
        .update_file_symbols(&file, &[sym("first", 1), sym("second", 2)], index_path)
        .expect("first update failed");
    global
        .update_file_symbols(&file, &[sym("third", 3)], index_path)
        .expect("second update failed");

    for gone in ["first", "second"] {
        assert!(global.search(gone, None, 10, false).expect("search").is_empty());
    }
    assert_eq!(global.search("third", None, 10, false).expect("search").len(), 1);
}

#[test]
fn hits_outside_the_project_are_dropped() {
    let fixture = auth_project();
    let db = global_index_db(fixture.registry.mapper(), &fixture.root);
    let global = GlobalSymbolIndex::open(&db, project_id(&fixture)).expect("open global index");

    let elsewhere = if cfg!(windows) {
        Path::new(r"Z:\elsewhere\auth.py").to_path_buf()
    } else {
        Path::new("/elsewhere/auth.py").to_path_buf()
    };
    let stray = Symbol::new("AuthStray", SymbolKind::Class, 1, 1)
        .expect("valid symbol")
        .with_file_path(&elsewhere);
    global
        .add_symbol(&stray, Path::new("/elsewhere/_index.db"))
        .expect("add stray symbol");

    let symbols = engine(&fixture, true)
        .search_symbols("Auth", &fixture.root, None, 20)
        .expect("symbol search failed");

    let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["AuthManager"]);
}

#[test]
fn unindexed_path_is_not_found() {
    let fixture = auth_project();
    let outside = fixture.dir.path().join("elsewhere");
    std::fs::create_dir_all(&outside).expect("create dir");

    let err = engine(&fixture, true)
        .search_symbols("Auth", &outside, None, 20)
        .expect_err("no index covers this path");
    assert!(matches!(err, strata::Error::NotFound(_)));
}
