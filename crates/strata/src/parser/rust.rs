//! Rust symbol and relationship extraction.
//!
//! Walks a tree-sitter-rust syntax tree once. Definitions become [`Symbol`]s
//! in source order. Calls, struct literals and type mentions inside a
//! function become [`Relationship`]s whose source is the enclosing function,
//! and `impl Trait for Type` becomes an inheritance edge from the type.

use std::collections::HashSet;

use super::LanguageSupport;
use super::tree_sitter_utils::{node_lines, node_text, start_line};
use crate::collaborators::ParsedSource;
use crate::types::{Language, Relationship, RelationshipType, Symbol, SymbolKind};

/// Node kinds of the tree-sitter-rust grammar that the walk acts on.
mod node_kinds {
    pub const FUNCTION_ITEM: &str = "function_item";
    pub const FUNCTION_SIGNATURE_ITEM: &str = "function_signature_item";
    pub const STRUCT_ITEM: &str = "struct_item";
    pub const ENUM_ITEM: &str = "enum_item";
    pub const UNION_ITEM: &str = "union_item";
    pub const TRAIT_ITEM: &str = "trait_item";
    pub const IMPL_ITEM: &str = "impl_item";
    pub const CONST_ITEM: &str = "const_item";
    pub const STATIC_ITEM: &str = "static_item";
    pub const TYPE_ITEM: &str = "type_item";
    pub const MACRO_DEFINITION: &str = "macro_definition";
    pub const MOD_ITEM: &str = "mod_item";
    pub const USE_DECLARATION: &str = "use_declaration";

    pub const CALL_EXPRESSION: &str = "call_expression";
    pub const STRUCT_EXPRESSION: &str = "struct_expression";
    pub const FIELD_EXPRESSION: &str = "field_expression";
    pub const GENERIC_FUNCTION: &str = "generic_function";
    pub const GENERIC_TYPE: &str = "generic_type";
    pub const IDENTIFIER: &str = "identifier";
    pub const SCOPED_IDENTIFIER: &str = "scoped_identifier";
    pub const SCOPED_TYPE_IDENTIFIER: &str = "scoped_type_identifier";
    pub const TYPE_IDENTIFIER: &str = "type_identifier";
}

/// Rust language support.
pub struct RustLanguage;

impl LanguageSupport for RustLanguage {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn tree_sitter_language(&self) -> tree_sitter::Language {
        tree_sitter_rust::LANGUAGE.into()
    }

    fn extract(&self, tree: &tree_sitter::Tree, content: &[u8]) -> ParsedSource {
        extract(tree, content)
    }
}

/// Where an item sits; decides whether a `fn` is a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Module,
    Impl,
    Trait,
}

struct Extraction<'c> {
    content: &'c [u8],
    out: ParsedSource,
    seen: HashSet<(String, String, RelationshipType)>,
}

/// Extract symbols and relationships from a parsed Rust file.
pub fn extract(tree: &tree_sitter::Tree, content: &[u8]) -> ParsedSource {
    let mut ex = Extraction {
        content,
        out: ParsedSource::default(),
        seen: HashSet::new(),
    };
    ex.walk(&tree.root_node(), None, Container::Module);
    ex.out
}

impl Extraction<'_> {
    fn walk(&mut self, node: &tree_sitter::Node, enclosing: Option<&str>, container: Container) {
        use node_kinds::{
            CALL_EXPRESSION, CONST_ITEM, ENUM_ITEM, FUNCTION_ITEM, FUNCTION_SIGNATURE_ITEM,
            IMPL_ITEM, MACRO_DEFINITION, MOD_ITEM, STATIC_ITEM, STRUCT_EXPRESSION, STRUCT_ITEM,
            TRAIT_ITEM, TYPE_IDENTIFIER, TYPE_ITEM, UNION_ITEM, USE_DECLARATION,
        };

        match node.kind() {
            USE_DECLARATION => return,

            FUNCTION_ITEM => {
                let kind = if container == Container::Module {
                    SymbolKind::Function
                } else {
                    SymbolKind::Method
                };
                let Some(name) = self.define(node, kind) else {
                    return;
                };
                self.walk_children(node, Some(name.as_str()), Container::Module);
                return;
            }

            FUNCTION_SIGNATURE_ITEM => {
                self.define(node, SymbolKind::Method);
                return;
            }

            STRUCT_ITEM | UNION_ITEM => {
                self.define(node, SymbolKind::Struct);
                return;
            }
            ENUM_ITEM => {
                self.define(node, SymbolKind::Enum);
                return;
            }
            CONST_ITEM => {
                self.define(node, SymbolKind::Const);
                return;
            }
            STATIC_ITEM => {
                self.define(node, SymbolKind::Variable);
                return;
            }
            TYPE_ITEM => {
                self.define(node, SymbolKind::TypeAlias);
                return;
            }
            MACRO_DEFINITION => {
                self.define(node, SymbolKind::Macro);
                return;
            }

            TRAIT_ITEM => {
                self.define(node, SymbolKind::Trait);
                if let Some(body) = node.child_by_field_name("body") {
                    self.walk_children(&body, None, Container::Trait);
                }
                return;
            }

            MOD_ITEM => {
                self.define(node, SymbolKind::Module);
                if let Some(body) = node.child_by_field_name("body") {
                    self.walk_children(&body, None, Container::Module);
                }
                return;
            }

            IMPL_ITEM => {
                self.impl_block(node);
                return;
            }

            CALL_EXPRESSION => {
                if let (Some(source), Some(function)) =
                    (enclosing, node.child_by_field_name("function"))
                {
                    if let Some(target) = self.callee(&function) {
                        self.relate(source, target, RelationshipType::Call, node);
                    }
                }
            }

            STRUCT_EXPRESSION => {
                if let (Some(source), Some(name)) = (enclosing, node.child_by_field_name("name")) {
                    if let Some(target) = self.type_name(&name) {
                        self.relate(source, target, RelationshipType::Reference, node);
                    }
                }
            }

            TYPE_IDENTIFIER => {
                if let (Some(source), Some(target)) = (enclosing, node_text(node, self.content)) {
                    self.relate(source, target, RelationshipType::Reference, node);
                }
                return;
            }

            _ => {}
        }

        self.walk_children(node, enclosing, container);
    }

    fn walk_children(&mut self, node: &tree_sitter::Node, enclosing: Option<&str>, container: Container) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            self.walk(&child, enclosing, container);
        }
    }

    fn impl_block(&mut self, node: &tree_sitter::Node) {
        let self_type = node
            .child_by_field_name("type")
            .and_then(|t| self.type_name(&t));

        if let (Some(self_type), Some(trait_node)) = (&self_type, node.child_by_field_name("trait")) {
            if let Some(trait_name) = self.type_name(&trait_node) {
                self.relate(self_type, trait_name, RelationshipType::Inherit, node);
            }
        }

        if let Some(body) = node.child_by_field_name("body") {
            self.walk_children(&body, None, Container::Impl);
        }
    }

    /// Record a definition and return its name.
    fn define(&mut self, node: &tree_sitter::Node, kind: SymbolKind) -> Option<String> {
        let name = node_text(&node.child_by_field_name("name")?, self.content)?;
        let (start, end) = node_lines(node);
        let symbol = Symbol::new(name.clone(), kind, start, end)?;
        self.out.symbols.push(symbol);
        Some(name)
    }

    fn relate(&mut self, source: &str, target: String, kind: RelationshipType, at: &tree_sitter::Node) {
        if source == target {
            return;
        }
        if !self.seen.insert((source.to_string(), target.clone(), kind)) {
            return;
        }
        self.out.relationships.push(Relationship {
            source_symbol: source.to_string(),
            target_qualified_name: target,
            relationship_type: kind,
            source_line: start_line(at),
            target_file: None,
        });
    }

    /// Qualified name of what a call expression invokes.
    fn callee(&self, function: &tree_sitter::Node) -> Option<String> {
        use node_kinds::{FIELD_EXPRESSION, GENERIC_FUNCTION, IDENTIFIER, SCOPED_IDENTIFIER};

        match function.kind() {
            IDENTIFIER => node_text(function, self.content),
            SCOPED_IDENTIFIER => {
                let mut segments = Vec::new();
                self.collect_path(function, &mut segments);
                (!segments.is_empty()).then(|| segments.join("::"))
            }
            // `user.greet()`: the method name is the field
            FIELD_EXPRESSION => node_text(&function.child_by_field_name("field")?, self.content),
            // `parse::<u32>()`
            GENERIC_FUNCTION => self.callee(&function.child_by_field_name("function")?),
            _ => None,
        }
    }

    /// Name of a type, without generic arguments.
    fn type_name(&self, node: &tree_sitter::Node) -> Option<String> {
        use node_kinds::{GENERIC_TYPE, SCOPED_IDENTIFIER, SCOPED_TYPE_IDENTIFIER, TYPE_IDENTIFIER};

        match node.kind() {
            TYPE_IDENTIFIER => node_text(node, self.content),
            GENERIC_TYPE => self.type_name(&node.child_by_field_name("type")?),
            SCOPED_TYPE_IDENTIFIER | SCOPED_IDENTIFIER => {
                node_text(&node.child_by_field_name("name")?, self.content)
            }
            _ => None,
        }
    }

    fn collect_path(&self, node: &tree_sitter::Node, segments: &mut Vec<String>) {
        if node.kind() == node_kinds::SCOPED_IDENTIFIER {
            if let Some(path) = node.child_by_field_name("path") {
                self.collect_path(&path, segments);
            }
            if let Some(text) = node
                .child_by_field_name("name")
                .and_then(|n| node_text(&n, self.content))
            {
                segments.push(text);
            }
        } else if let Some(text) = node_text(node, self.content) {
            segments.push(text);
        }
    }
}
