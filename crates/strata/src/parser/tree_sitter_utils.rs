//! Shared tree-sitter helpers for the language extractors.

/// Text of a node.
///
/// Returns `None` if the node's byte range is not valid UTF-8.
pub fn node_text(node: &tree_sitter::Node, content: &[u8]) -> Option<String> {
    match std::str::from_utf8(&content[node.byte_range()]) {
        Ok(s) => Some(s.to_string()),
        Err(e) => {
            tracing::trace!(
                byte_range = ?node.byte_range(),
                error = %e,
                node_kind = %node.kind(),
                "Failed to decode node text as UTF-8"
            );
            None
        }
    }
}

/// 1-indexed line a node starts on.
pub fn start_line(node: &tree_sitter::Node) -> u32 {
    u32::try_from(node.start_position().row)
        .unwrap_or(u32::MAX - 1)
        .saturating_add(1)
}

/// 1-indexed, inclusive line range of a node.
///
/// A node ending at column 0 of a line does not cover that line.
pub fn node_lines(node: &tree_sitter::Node) -> (u32, u32) {
    let start = start_line(node);
    let end_pos = node.end_position();
    let mut end = u32::try_from(end_pos.row)
        .unwrap_or(u32::MAX - 1)
        .saturating_add(1);
    if end_pos.column == 0 && end > start {
        end -= 1;
    }
    (start, end.max(start))
}
