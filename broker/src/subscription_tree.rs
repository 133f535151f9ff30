// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Trie-shaped index from subscription filters to granted QoS per client.

use std::collections::HashMap;

use codec::QoS;

use crate::topic::split_levels;

#[derive(Debug, Default)]
struct Node {
    subscribers: HashMap<String, QoS>,
    children: HashMap<String, Node>,
    filter: String,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty()
    }
}

/// One matched subscriber, deduplicated by client id keeping the highest
/// granted QoS across every path that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched {
    pub client_id: String,
    pub qos: QoS,
}

#[derive(Debug, Default)]
pub struct SubscriptionTree {
    root: Node,
}

impl SubscriptionTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `client`'s subscription to `filter`, returning the granted
    /// QoS, or `None` if `#` does not occupy the terminal level.
    pub fn subscribe(
        &mut self,
        filter: &str,
        client_id: &str,
        requested_qos: QoS,
        broker_max_qos: QoS,
    ) -> Option<QoS> {
        let levels = split_levels(filter);
        let last = levels.len() - 1;
        for (index, level) in levels.iter().enumerate() {
            if *level == "#" && index != last {
                return None;
            }
        }

        let mut node = &mut self.root;
        for level in &levels {
            node = node.children.entry((*level).to_string()).or_default();
        }
        let granted = requested_qos.min(broker_max_qos);
        node.subscribers.insert(client_id.to_string(), granted);
        node.filter = filter.to_string();
        Some(granted)
    }

    /// Remove `client_id`'s subscription to the exact `filter`, pruning
    /// emptied nodes bottom-up.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) {
        let levels = split_levels(filter);
        unsubscribe_at(&mut self.root, &levels, client_id);
    }

    /// Remove `client_id` from every node in the trie.
    pub fn unsubscribe_all(&mut self, client_id: &str) {
        unsubscribe_all_at(&mut self.root, client_id);
    }

    /// Match `topic` against every subscription filter in the trie,
    /// invoking `emit` once per distinct client with its highest granted
    /// QoS across all matching filters.
    pub fn match_topic(&self, topic: &str) -> Vec<Matched> {
        let levels = split_levels(topic);
        let root_is_internal = levels.first().is_some_and(|l| l.starts_with('$'));
        let mut out: HashMap<String, QoS> = HashMap::new();
        match_at(&self.root, &levels, root_is_internal, &mut out);
        out.into_iter()
            .map(|(client_id, qos)| Matched { client_id, qos })
            .collect()
    }

    /// Every `(filter, qos)` pair `client_id` is currently subscribed to.
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<(String, QoS)> {
        let mut out = Vec::new();
        collect_subscriptions_of(&self.root, client_id, &mut out);
        out
    }
}

fn unsubscribe_at(node: &mut Node, levels: &[&str], client_id: &str) -> bool {
    match levels.split_first() {
        None => {
            node.subscribers.remove(client_id);
            node.is_empty()
        }
        Some((head, rest)) => {
            let Some(child) = node.children.get_mut(*head) else {
                return node.is_empty();
            };
            if unsubscribe_at(child, rest, client_id) {
                node.children.remove(*head);
            }
            node.is_empty()
        }
    }
}

fn unsubscribe_all_at(node: &mut Node, client_id: &str) {
    node.subscribers.remove(client_id);
    node.children.retain(|_, child| {
        unsubscribe_all_at(child, client_id);
        !child.is_empty()
    });
}

fn match_at(node: &Node, levels: &[&str], root_is_internal: bool, out: &mut HashMap<String, QoS>) {
    merge_hash_child(node, root_is_internal, out);

    match levels.split_first() {
        None => merge_subscribers(node, out),
        Some((head, rest)) => {
            if let Some(child) = node.children.get(*head) {
                match_at(child, rest, false, out);
            }
            if !root_is_internal {
                if let Some(plus_child) = node.children.get("+") {
                    match_at(plus_child, rest, false, out);
                }
            }
        }
    }
}

fn merge_hash_child(node: &Node, root_is_internal: bool, out: &mut HashMap<String, QoS>) {
    if root_is_internal {
        return;
    }
    if let Some(hash_child) = node.children.get("#") {
        merge_subscribers(hash_child, out);
    }
}

fn merge_subscribers(node: &Node, out: &mut HashMap<String, QoS>) {
    for (client_id, qos) in &node.subscribers {
        out.entry(client_id.clone())
            .and_modify(|existing| *existing = (*existing).max(*qos))
            .or_insert(*qos);
    }
}

fn collect_subscriptions_of(node: &Node, client_id: &str, out: &mut Vec<(String, QoS)>) {
    if let Some(qos) = node.subscribers.get(client_id) {
        out.push((node.filter.clone(), *qos));
    }
    for child in node.children.values() {
        collect_subscriptions_of(child, client_id, out);
    }
}
