/*
 * Copyright (C) 2024 The AMT Rebooter Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::rebooter::k8s::node::{Node, NodeCondition};

const READY_CONDITION: &str = "Ready";

/// A node is ready only when it reports exactly one `Ready` condition whose
/// status is `true` (any case). Every other shape counts as not ready.
pub fn is_ready(conditions: Option<&[NodeCondition]>) -> bool {
    let Some(conditions) = conditions else {
        return false;
    };
    let mut ready = conditions
        .iter()
        .filter(|condition| condition.condition_type == READY_CONDITION);
    match (ready.next(), ready.next()) {
        (Some(condition), None) => condition.status.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

pub fn node_is_ready(node: &Node) -> bool {
    is_ready(node.conditions())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: &str) -> NodeCondition {
        NodeCondition::new("Ready", status)
    }

    #[test]
    fn missing_or_empty_conditions_are_not_ready() {
        assert!(!is_ready(None));
        assert!(!is_ready(Some(&[])));
        assert!(!is_ready(Some(&[NodeCondition::new("MemoryPressure", "False")])));
    }

    #[test]
    fn single_ready_condition_is_compared_case_insensitively() {
        assert!(is_ready(Some(&[ready("True")])));
        assert!(is_ready(Some(&[ready("TRUE")])));
        assert!(is_ready(Some(&[
            NodeCondition::new("DiskPressure", "False"),
            ready("true"),
        ])));
        assert!(!is_ready(Some(&[ready("False")])));
        assert!(!is_ready(Some(&[ready("Unknown")])));
        assert!(!is_ready(Some(&[ready("")])));
    }

    #[test]
    fn duplicate_ready_conditions_are_not_ready() {
        assert!(!is_ready(Some(&[ready("True"), ready("True")])));
        assert!(!is_ready(Some(&[ready("True"), ready("False")])));
    }

    #[test]
    fn type_match_is_exact() {
        assert!(!is_ready(Some(&[NodeCondition::new("ready", "True")])));
    }

    #[test]
    fn node_wrapper_reads_status_conditions() {
        assert!(node_is_ready(&Node::new("worker-1", Some(vec![ready("True")]))));
        assert!(!node_is_ready(&Node::new("worker-1", None)));
    }
}
