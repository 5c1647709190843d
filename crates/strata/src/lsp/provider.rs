//! LSP provider trait and implementations for different language servers.

use crate::types::Language;
use serde_json::Value;

/// Trait for configuring LSP server providers.
///
/// Implementations define how to spawn and configure a specific LSP server.
///
/// # Example
///
/// ```rust
/// use strata::lsp::LspProvider;
///
/// struct MyCustomLsp;
///
/// impl LspProvider for MyCustomLsp {
///     fn command(&self) -> &'static str { "my-lsp" }
///     fn args(&self) -> Vec<&str> { vec!["--stdio"] }
///     fn language_id(&self) -> &'static str { "my-lang" }
/// }
/// ```
pub trait LspProvider: Send + Sync {
    /// The command to spawn (e.g., "rust-analyzer", "pyright-langserver").
    fn command(&self) -> &'static str;

    /// Additional command-line arguments for the LSP server.
    fn args(&self) -> Vec<&str> {
        vec![]
    }

    /// Language-specific initialization options for the LSP server.
    fn initialize_options(&self) -> Option<Value> {
        None
    }

    /// Installation hint shown when the LSP server is not found.
    fn install_hint(&self) -> &'static str {
        "Please install the language server and ensure it's in your PATH."
    }

    /// `languageId` sent with `textDocument/didOpen`.
    fn language_id(&self) -> &'static str;
}

/// LSP provider for rust-analyzer.
///
/// Install via: `rustup component add rust-analyzer`
#[derive(Debug, Clone, Copy, Default)]
pub struct RustAnalyzerProvider;

impl LspProvider for RustAnalyzerProvider {
    fn command(&self) -> &'static str {
        "rust-analyzer"
    }

    fn install_hint(&self) -> &'static str {
        "Install rust-analyzer: https://rust-analyzer.github.io/manual.html#installation"
    }

    fn language_id(&self) -> &'static str {
        "rust"
    }
}

/// LSP provider for pyright.
#[derive(Debug, Clone, Copy, Default)]
pub struct PyrightProvider;

impl LspProvider for PyrightProvider {
    fn command(&self) -> &'static str {
        "pyright-langserver"
    }

    fn args(&self) -> Vec<&str> {
        vec!["--stdio"]
    }

    fn install_hint(&self) -> &'static str {
        "Install pyright: npm install --global pyright"
    }

    fn language_id(&self) -> &'static str {
        "python"
    }
}

/// Provider type that can be used with dynamic dispatch.
#[derive(Debug, Clone, Copy)]
pub enum AnyProvider {
    /// rust-analyzer for Rust files
    Rust(RustAnalyzerProvider),
    /// pyright for Python files
    Python(PyrightProvider),
}

impl Default for AnyProvider {
    fn default() -> Self {
        Self::Rust(RustAnalyzerProvider)
    }
}

impl LspProvider for AnyProvider {
    fn command(&self) -> &'static str {
        match self {
            Self::Rust(p) => p.command(),
            Self::Python(p) => p.command(),
        }
    }

    fn args(&self) -> Vec<&str> {
        match self {
            Self::Rust(p) => p.args(),
            Self::Python(p) => p.args(),
        }
    }

    fn initialize_options(&self) -> Option<Value> {
        match self {
            Self::Rust(p) => p.initialize_options(),
            Self::Python(p) => p.initialize_options(),
        }
    }

    fn install_hint(&self) -> &'static str {
        match self {
            Self::Rust(p) => p.install_hint(),
            Self::Python(p) => p.install_hint(),
        }
    }

    fn language_id(&self) -> &'static str {
        match self {
            Self::Rust(p) => p.language_id(),
            Self::Python(p) => p.language_id(),
        }
    }
}

impl AnyProvider {
    /// Select the LSP provider for a language, if one is known.
    #[must_use]
    pub fn for_language(language: Language) -> Option<Self> {
        match language {
            Language::Rust => Some(Self::Rust(RustAnalyzerProvider)),
            Language::Python => Some(Self::Python(PyrightProvider)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_analyzer_runs_without_args() {
        let provider = RustAnalyzerProvider;
        assert_eq!(provider.command(), "rust-analyzer");
        assert!(provider.args().is_empty());
        assert!(provider.initialize_options().is_none());
        assert!(provider.install_hint().contains("rust-analyzer"));
    }

    #[test]
    fn pyright_needs_stdio_flag() {
        let provider = PyrightProvider;
        assert_eq!(provider.args(), vec!["--stdio"]);
        assert_eq!(provider.language_id(), "python");
    }

    #[test]
    fn any_provider_selects_by_language() {
        assert_eq!(
            AnyProvider::for_language(Language::Rust).map(|p| p.command()),
            Some("rust-analyzer")
        );
        assert_eq!(
            AnyProvider::for_language(Language::Python).map(|p| p.language_id()),
            Some("python")
        );
        assert!(AnyProvider::for_language(Language::Markdown).is_none());
    }

    #[test]
    fn default_provider_is_rust_analyzer() {
        assert_eq!(AnyProvider::default().command(), "rust-analyzer");
    }
}
