//! Branching message history and its traversal/mutation operations.
//!
//! Every mutation validates before it writes: a node is fully built before it
//! is linked into its parent, and a failed operation returns an error with the
//! history unchanged.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::errors::{TreeError, TreeResult};
use crate::core::ids::MessageId;
use crate::tree::message::Message;

/// All messages of one chat plus the tip of the displayed branch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    #[serde(default)]
    messages: HashMap<MessageId, Message>,
    #[serde(default)]
    current_id: Option<MessageId>,
}

impl History {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tip of the displayed branch.
    #[must_use]
    pub const fn current_id(&self) -> Option<MessageId> {
        self.current_id
    }

    /// Point the displayed branch at an existing message (or clear it).
    ///
    /// # Errors
    /// Returns `MessageNotFound` if `id` is set but absent.
    pub fn set_current_id(&mut self, id: Option<MessageId>) -> TreeResult<()> {
        if let Some(id) = id {
            if !self.messages.contains_key(&id) {
                return Err(TreeError::MessageNotFound(id));
            }
        }
        self.current_id = id;
        Ok(())
    }

    /// Borrow a message.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)
    }

    /// Mutably borrow a message for content/metadata edits.
    ///
    /// Link fields are crate-private, so callers cannot break tree invariants here.
    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.get_mut(&id)
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Iterate over all messages in arbitrary order.
    #[must_use]
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Append a user message under `parent_id` and make it current.
    ///
    /// # Errors
    /// Returns `ParentNotFound` if `parent_id` is set but absent.
    pub fn append_user_message(
        &mut self,
        parent_id: Option<MessageId>,
        content: impl Into<String>,
    ) -> TreeResult<MessageId> {
        self.attach(parent_id, Message::user(content))
    }

    /// Append an empty assistant placeholder for `model_id` and make it current.
    ///
    /// # Errors
    /// Returns `ParentNotFound` if `parent_id` is set but absent.
    pub fn append_response_placeholder(
        &mut self,
        parent_id: Option<MessageId>,
        model_id: &str,
    ) -> TreeResult<MessageId> {
        self.attach(parent_id, Message::assistant_placeholder(model_id))
    }

    /// Link a fully built, unlinked node under `parent_id` and make it current.
    ///
    /// # Errors
    /// Returns `ParentNotFound` if the parent is absent, or `CorruptTree` if the
    /// node's id is already taken.
    pub fn attach(&mut self, parent_id: Option<MessageId>, mut message: Message) -> TreeResult<MessageId> {
        if let Some(parent) = parent_id {
            if !self.messages.contains_key(&parent) {
                return Err(TreeError::ParentNotFound(parent));
            }
        }
        let id = message.id;
        if self.messages.contains_key(&id) {
            return Err(TreeError::CorruptTree(format!("duplicate message id {id}")));
        }

        message.parent_id = parent_id;
        message.children_ids.clear();
        self.messages.insert(id, message);

        if let Some(parent) = parent_id.and_then(|p| self.messages.get_mut(&p)) {
            parent.children_ids.push(id);
        }
        self.current_id = Some(id);
        Ok(id)
    }

    /// Remove `message_id` and all its descendants.
    ///
    /// `current_id` moves to the removed node's parent only if it pointed inside
    /// the removed subtree. Returns the removed ids in depth-first order.
    ///
    /// # Errors
    /// Returns `MessageNotFound` if absent, or `CorruptTree` if the subtree
    /// references a missing or repeated node.
    pub fn delete_subtree(&mut self, message_id: MessageId) -> TreeResult<Vec<MessageId>> {
        let root = self
            .messages
            .get(&message_id)
            .ok_or(TreeError::MessageNotFound(message_id))?;
        let parent_id = root.parent_id;

        let mut removed = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![message_id];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(TreeError::CorruptTree(format!("cycle through {id}")));
            }
            let node = self
                .messages
                .get(&id)
                .ok_or_else(|| TreeError::CorruptTree(format!("dangling child {id}")))?;
            removed.push(id);
            stack.extend(node.children_ids.iter().rev().copied());
        }

        for id in &removed {
            self.messages.remove(id);
        }
        if let Some(parent) = parent_id.and_then(|p| self.messages.get_mut(&p)) {
            parent.children_ids.retain(|child| *child != message_id);
        }
        if self.current_id.is_some_and(|current| seen.contains(&current)) {
            self.current_id = parent_id.filter(|p| self.messages.contains_key(p));
        }

        Ok(removed)
    }

    /// Messages from the root down to `message_id`, inclusive.
    ///
    /// # Errors
    /// Returns `MessageNotFound` if absent, or `CorruptTree` on a dangling
    /// parent reference or a cycle.
    pub fn path_to_root(&self, message_id: MessageId) -> TreeResult<Vec<&Message>> {
        let mut path = Vec::new();
        let mut cursor = Some(message_id);
        while let Some(id) = cursor {
            if path.len() > self.messages.len() {
                return Err(TreeError::CorruptTree(format!(
                    "cycle detected walking up from {message_id}"
                )));
            }
            let node = match self.messages.get(&id) {
                Some(node) => node,
                None if id == message_id => return Err(TreeError::MessageNotFound(id)),
                None => {
                    return Err(TreeError::CorruptTree(format!("dangling parent {id}")));
                }
            };
            path.push(node);
            cursor = node.parent_id;
        }
        path.reverse();
        Ok(path)
    }

    /// Follow the last child repeatedly until reaching a leaf.
    ///
    /// # Errors
    /// Returns `MessageNotFound` if absent, or `CorruptTree` on a dangling
    /// child reference or a cycle.
    pub fn last_leaf(&self, message_id: MessageId) -> TreeResult<MessageId> {
        let mut current = self
            .messages
            .get(&message_id)
            .ok_or(TreeError::MessageNotFound(message_id))?;
        let mut steps = 0_usize;
        while let Some(&next) = current.children_ids.last() {
            steps += 1;
            if steps > self.messages.len() {
                return Err(TreeError::CorruptTree(format!(
                    "cycle detected walking down from {message_id}"
                )));
            }
            current = self
                .messages
                .get(&next)
                .ok_or_else(|| TreeError::CorruptTree(format!("dangling child {next}")))?;
        }
        Ok(current.id)
    }

    /// Root message ids (nodes without a parent), ordered by timestamp.
    #[must_use]
    pub fn roots(&self) -> Vec<MessageId> {
        let mut roots: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.parent_id.is_none())
            .collect();
        roots.sort_by_key(|m| m.timestamp);
        roots.into_iter().map(|m| m.id).collect()
    }

    /// Check bidirectional parent/child consistency and the current pointer.
    ///
    /// # Errors
    /// Returns `CorruptTree` describing the first violation found.
    pub fn verify(&self) -> TreeResult<()> {
        for (id, message) in &self.messages {
            if message.id != *id {
                return Err(TreeError::CorruptTree(format!("key {id} holds message {}", message.id)));
            }
            if let Some(parent_id) = message.parent_id {
                let parent = self
                    .messages
                    .get(&parent_id)
                    .ok_or_else(|| TreeError::CorruptTree(format!("{id} has missing parent {parent_id}")))?;
                if !parent.children_ids.contains(id) {
                    return Err(TreeError::CorruptTree(format!(
                        "{parent_id} does not list child {id}"
                    )));
                }
            }
            let mut seen = HashSet::new();
            for child_id in &message.children_ids {
                if !seen.insert(child_id) {
                    return Err(TreeError::CorruptTree(format!("{id} lists {child_id} twice")));
                }
                let child = self
                    .messages
                    .get(child_id)
                    .ok_or_else(|| TreeError::CorruptTree(format!("{id} lists missing child {child_id}")))?;
                if child.parent_id != Some(*id) {
                    return Err(TreeError::CorruptTree(format!(
                        "{child_id} does not point back to {id}"
                    )));
                }
            }
        }
        if let Some(current) = self.current_id {
            if !self.messages.contains_key(&current) {
                return Err(TreeError::CorruptTree(format!("current id {current} is missing")));
            }
        }
        for id in self.messages.keys() {
            self.path_to_root(*id)?;
        }
        Ok(())
    }

    /// Build a history from linked messages, without touching `current_id`.
    ///
    /// # Errors
    /// Returns `CorruptTree` if ids repeat or links are inconsistent.
    pub(crate) fn from_linked(messages: Vec<Message>) -> TreeResult<Self> {
        let mut map = HashMap::with_capacity(messages.len());
        for message in messages {
            let id = message.id;
            if map.insert(id, message).is_some() {
                return Err(TreeError::CorruptTree(format!("duplicate message id {id}")));
            }
        }
        let history = Self {
            messages: map,
            current_id: None,
        };
        history.verify()?;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(history: &mut History, depth: usize) -> Vec<MessageId> {
        let mut ids = Vec::new();
        let mut parent = None;
        for i in 0..depth {
            let id = if i % 2 == 0 {
                history.append_user_message(parent, format!("q{i}")).unwrap()
            } else {
                history.append_response_placeholder(parent, "m").unwrap()
            };
            ids.push(id);
            parent = Some(id);
        }
        ids
    }

    #[test]
    fn append_links_both_directions() {
        let mut history = History::new();
        let user = history.append_user_message(None, "hello").unwrap();
        let reply = history.append_response_placeholder(Some(user), "llama3").unwrap();

        assert_eq!(history.current_id(), Some(reply));
        assert_eq!(history.get(user).unwrap().children_ids(), &[reply]);
        assert_eq!(history.get(reply).unwrap().parent_id(), Some(user));
        history.verify().unwrap();
    }

    #[test]
    fn append_to_missing_parent_fails_without_change() {
        let mut history = History::new();
        let root = history.append_user_message(None, "hello").unwrap();
        let missing = MessageId::new();

        let err = history.append_user_message(Some(missing), "x").unwrap_err();
        assert_eq!(err, TreeError::ParentNotFound(missing));
        assert_eq!(history.len(), 1);
        assert_eq!(history.current_id(), Some(root));
    }

    #[test]
    fn delete_outside_current_branch_leaves_current_untouched() {
        let mut history = History::new();
        let ids = chain(&mut history, 2);
        // Branch: second answer under the same user message.
        let other = history.append_response_placeholder(Some(ids[0]), "m").unwrap();
        let side_question = history.append_user_message(Some(ids[1]), "follow-up").unwrap();
        history.set_current_id(Some(other)).unwrap();

        history.delete_subtree(ids[1]).unwrap();

        assert_eq!(history.current_id(), Some(other));
        assert!(history.get(side_question).is_none());
        assert_eq!(history.get(ids[0]).unwrap().children_ids(), &[other]);
        history.verify().unwrap();
    }

    #[test]
    fn delete_ancestor_containing_current_reparents() {
        let mut history = History::new();
        let ids = chain(&mut history, 4);
        assert_eq!(history.current_id(), Some(ids[3]));

        let removed = history.delete_subtree(ids[2]).unwrap();

        assert_eq!(removed, vec![ids[2], ids[3]]);
        assert_eq!(history.current_id(), Some(ids[1]));
        history.verify().unwrap();
    }

    #[test]
    fn delete_current_itself_moves_to_parent() {
        let mut history = History::new();
        let ids = chain(&mut history, 3);
        history.delete_subtree(ids[2]).unwrap();
        assert_eq!(history.current_id(), Some(ids[1]));
    }

    #[test]
    fn delete_root_clears_current() {
        let mut history = History::new();
        let ids = chain(&mut history, 3);
        history.delete_subtree(ids[0]).unwrap();
        assert!(history.is_empty());
        assert_eq!(history.current_id(), None);
    }

    #[test]
    fn delete_removes_every_branch_depth_first() {
        let mut history = History::new();
        let root = history.append_user_message(None, "q").unwrap();
        let a = history.append_response_placeholder(Some(root), "a").unwrap();
        let b = history.append_response_placeholder(Some(root), "b").unwrap();
        let a_child = history.append_user_message(Some(a), "qa").unwrap();

        let removed = history.delete_subtree(root).unwrap();
        assert_eq!(removed, vec![root, a, a_child, b]);
    }

    #[test]
    fn delete_missing_fails() {
        let mut history = History::new();
        let id = MessageId::new();
        assert_eq!(history.delete_subtree(id), Err(TreeError::MessageNotFound(id)));
    }

    #[test]
    fn path_to_root_returns_ancestors_in_order() {
        let mut history = History::new();
        let ids = chain(&mut history, 5);

        let path: Vec<MessageId> = history
            .path_to_root(ids[4])
            .unwrap()
            .iter()
            .map(|m| m.id())
            .collect();
        assert_eq!(path, ids);

        let again: Vec<MessageId> = history
            .path_to_root(ids[4])
            .unwrap()
            .iter()
            .map(|m| m.id())
            .collect();
        assert_eq!(again, path);
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn path_to_root_detects_cycles() {
        let mut history = History::new();
        let ids = chain(&mut history, 2);
        history.get_mut(ids[0]).unwrap().parent_id = Some(ids[1]);

        assert!(matches!(
            history.path_to_root(ids[1]),
            Err(TreeError::CorruptTree(_))
        ));
    }

    #[test]
    fn last_leaf_follows_most_recent_child() {
        let mut history = History::new();
        let root = history.append_user_message(None, "q").unwrap();
        let first = history.append_response_placeholder(Some(root), "a").unwrap();
        let _first_child = history.append_user_message(Some(first), "deeper").unwrap();
        let second = history.append_response_placeholder(Some(root), "b").unwrap();

        assert_eq!(history.last_leaf(root).unwrap(), second);
    }

    #[test]
    fn invariants_hold_after_mixed_operations() {
        let mut history = History::new();
        let ids = chain(&mut history, 6);
        let branch = history.append_user_message(Some(ids[1]), "branch").unwrap();
        let _ = history.append_response_placeholder(Some(branch), "m").unwrap();
        history.delete_subtree(ids[3]).unwrap();
        let _ = history.append_response_placeholder(Some(ids[2]), "m2").unwrap();
        history.delete_subtree(branch).unwrap();

        history.verify().unwrap();
        for message in history.messages() {
            for child in message.children_ids() {
                assert_eq!(history.get(*child).unwrap().parent_id(), Some(message.id()));
            }
        }
    }

    /// xorshift64, enough to vary the operation mix reproducibly.
    fn next(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn invariants_hold_under_seeded_appends_and_deletes() {
        for seed in [1_u64, 7, 42, 0x9E37_79B9, 0xDEAD_BEEF] {
            let mut state = seed;
            let mut history = History::new();
            let mut live: Vec<MessageId> = Vec::new();

            for step in 0..200 {
                let roll = next(&mut state);
                let pick = |state: &mut u64, len: usize| {
                    usize::try_from(next(state) % u64::try_from(len).unwrap()).unwrap()
                };
                if live.is_empty() || roll % 4 != 0 {
                    let parent = if live.is_empty() || roll % 10 == 1 {
                        None
                    } else {
                        Some(live[pick(&mut state, live.len())])
                    };
                    let id = if roll % 2 == 0 {
                        history.append_user_message(parent, format!("u{step}")).unwrap()
                    } else {
                        history.append_response_placeholder(parent, "m").unwrap()
                    };
                    assert_eq!(history.current_id(), Some(id));
                    live.push(id);
                } else {
                    let target = live[pick(&mut state, live.len())];
                    let removed = history.delete_subtree(target).unwrap();
                    assert_eq!(removed.first(), Some(&target));
                    live.retain(|id| !removed.contains(id));
                }

                history.verify().unwrap();
                assert_eq!(history.len(), live.len(), "seed {seed} step {step}");
                for id in &live {
                    assert!(history.get(*id).is_some());
                }
            }
        }
    }
}
