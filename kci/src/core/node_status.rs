//! Classification of Maestro node lifecycle states.

use crate::core::types::{Node, NodeStatus};

/// Derive the watch status of a node.
///
/// - `running` is always RUNNING.
/// - A checkout node that is `available` or `closing` has fetched its source
///   and is DONE even though the node itself stays open for child jobs.
/// - `done` is DONE only with a `pass` result.
/// - Everything else is FAIL.
pub fn node_status(node: &Node) -> NodeStatus {
    match node.state.as_str() {
        "running" => NodeStatus::Running,
        "available" | "closing" if node.kind == "checkout" => NodeStatus::Done,
        "done" if node.result.as_deref() == Some("pass") => NodeStatus::Done,
        _ => NodeStatus::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::node;

    #[test]
    fn running_is_running_regardless_of_result() {
        assert_eq!(
            node_status(&node("baseline", "job", "running", None)),
            NodeStatus::Running
        );
        assert_eq!(
            node_status(&node("baseline", "job", "running", Some("fail"))),
            NodeStatus::Running
        );
    }

    #[test]
    fn checkout_available_or_closing_is_done() {
        assert_eq!(
            node_status(&node("checkout", "checkout", "available", None)),
            NodeStatus::Done
        );
        assert_eq!(
            node_status(&node("checkout", "checkout", "closing", None)),
            NodeStatus::Done
        );
    }

    #[test]
    fn available_non_checkout_is_fail() {
        assert_eq!(
            node_status(&node("baseline", "job", "available", None)),
            NodeStatus::Fail
        );
    }

    #[test]
    fn done_depends_on_result() {
        assert_eq!(
            node_status(&node("kbuild", "kbuild", "done", Some("pass"))),
            NodeStatus::Done
        );
        assert_eq!(
            node_status(&node("kbuild", "kbuild", "done", Some("fail"))),
            NodeStatus::Fail
        );
        assert_eq!(
            node_status(&node("kbuild", "kbuild", "done", None)),
            NodeStatus::Fail
        );
    }
}
