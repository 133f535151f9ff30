// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Trie storing at most one retained message per topic.

use std::collections::HashMap;

use codec::QoS;

use crate::topic::split_levels;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

#[derive(Debug, Default)]
struct Node {
    message: Option<RetainedMessage>,
    children: HashMap<String, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.message.is_none() && self.children.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RetainTree {
    root: Node,
}

impl RetainTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or clear the retained message at `topic`. Wildcards are not
    /// permitted; callers validate with [`crate::topic::validate_pub_topic`]
    /// beforehand. Empty payload deletes the retained entry.
    pub fn retain(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) {
        let levels = split_levels(topic);
        retain_at(&mut self.root, &levels, topic, payload, qos);
    }

    /// Walk `filter` the same wildcard-aware way subscriptions do,
    /// invoking `emit` for every retained message it matches. `client_qos`
    /// caps the emitted QoS (`min(stored_qos, client_qos)`).
    pub fn replay_filter(
        &self,
        filter: &str,
        client_qos: QoS,
        mut emit: impl FnMut(&RetainedMessage, QoS),
    ) {
        let levels = split_levels(filter);
        let root_is_internal = levels.first().is_some_and(|l| l.starts_with('$'));
        replay_at(&self.root, &levels, root_is_internal, client_qos, &mut emit);
    }
}

fn retain_at(node: &mut Node, levels: &[&str], topic: &str, payload: Vec<u8>, qos: QoS) -> bool {
    match levels.split_first() {
        None => {
            if payload.is_empty() {
                node.message = None;
            } else {
                node.message = Some(RetainedMessage {
                    topic: topic.to_string(),
                    payload,
                    qos,
                });
            }
            node.is_empty()
        }
        Some((head, rest)) => {
            let child = node.children.entry((*head).to_string()).or_default();
            if retain_at(child, rest, topic, payload, qos) {
                node.children.remove(*head);
            }
            node.is_empty()
        }
    }
}

fn emit_subtree(node: &Node, client_qos: QoS, emit: &mut impl FnMut(&RetainedMessage, QoS)) {
    if let Some(message) = &node.message {
        emit(message, message.qos.min(client_qos));
    }
    for child in node.children.values() {
        emit_subtree(child, client_qos, emit);
    }
}

fn replay_at(
    node: &Node,
    levels: &[&str],
    root_is_internal: bool,
    client_qos: QoS,
    emit: &mut impl FnMut(&RetainedMessage, QoS),
) {
    match levels.split_first() {
        None => {
            if let Some(message) = &node.message {
                emit(message, message.qos.min(client_qos));
            }
        }
        Some((head, rest)) => match *head {
            "#" => {
                if !root_is_internal {
                    emit_subtree(node, client_qos, emit);
                }
            }
            "+" => {
                if !root_is_internal {
                    for child in node.children.values() {
                        replay_at(child, rest, false, client_qos, emit);
                    }
                }
            }
            head => {
                if let Some(child) = node.children.get(head) {
                    replay_at(child, rest, false, client_qos, emit);
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_then_clear_suppresses_replay() {
        let mut tree = RetainTree::new();
        tree.retain("room/temp", b"22".to_vec(), QoS::AtMostOnce);
        tree.retain("room/temp", Vec::new(), QoS::AtMostOnce);

        let mut seen = Vec::new();
        tree.replay_filter("room/#", QoS::ExactlyOnce, |msg, qos| seen.push((msg.topic.clone(), qos)));
        assert!(seen.is_empty());
    }

    #[test]
    fn retained_replay_scenario() {
        let mut tree = RetainTree::new();
        tree.retain("room/temp", b"22".to_vec(), QoS::AtMostOnce);

        let mut seen = Vec::new();
        tree.replay_filter("room/#", QoS::AtMostOnce, |msg, qos| {
            seen.push((msg.topic.clone(), msg.payload.clone(), qos))
        });
        assert_eq!(seen, vec![("room/temp".to_string(), b"22".to_vec(), QoS::AtMostOnce)]);
    }

    #[test]
    fn replay_preserves_stored_qos_capped_by_client() {
        let mut tree = RetainTree::new();
        tree.retain("a/b", b"x".to_vec(), QoS::ExactlyOnce);

        let mut seen = Vec::new();
        tree.replay_filter("a/b", QoS::AtLeastOnce, |_, qos| seen.push(qos));
        assert_eq!(seen, vec![QoS::AtLeastOnce]);
    }

    #[test]
    fn hash_at_any_position_emits_whole_subtree() {
        let mut tree = RetainTree::new();
        tree.retain("a/b/c", b"1".to_vec(), QoS::AtMostOnce);
        tree.retain("a/b/d", b"2".to_vec(), QoS::AtMostOnce);

        let mut seen = Vec::new();
        tree.replay_filter("a/#", QoS::AtMostOnce, |msg, _| seen.push(msg.topic.clone()));
        seen.sort();
        assert_eq!(seen, vec!["a/b/c".to_string(), "a/b/d".to_string()]);
    }
}
