//! Special treatment of whitespace before `#set` directives, reproducing
//! Velocity's spacing quirks rather than anything principled.

use crate::core::nodes::Node;

/// Decides whether the last of `nodes` should be removed because a `#set` is
/// about to be appended after it.
///
/// If you have *thing*, then whitespace, then `#set`, the whitespace is
/// deleted when the *thing* is a reference and the whitespace is horizontal,
/// and deleted regardless of newlines when the *thing* is a comment or
/// another directive. Whitespace at the very start of the template counts
/// only when horizontal. The asymmetry is deliberate and load-bearing.
pub(crate) fn should_elide_before_set(nodes: &[Node]) -> bool {
    let Some(last) = nodes.last() else {
        return false;
    };
    if !last.is_whitespace() {
        return false;
    }
    if nodes.len() == 1 {
        return last.is_horizontal_whitespace();
    }
    let before = &nodes[nodes.len() - 2];
    if before.is_reference() {
        last.is_horizontal_whitespace()
    } else {
        before.is_comment() || before.is_directive()
    }
}

/// Removes a single all-whitespace node at the start of a macro body when the
/// next node is a `#set`. The newline directly after `#macro (...)` was
/// already skipped by the parser, so this catches the remaining indentation
/// or blank lines.
pub(crate) fn strip_leading_space_before_set(nodes: &mut Vec<Node>) {
    if nodes.len() >= 2 && nodes[0].is_whitespace() && nodes[1].is_set() {
        nodes.remove(0);
    }
}
