//! Persisted chat document and history reconstruction.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::request::ChatParams;
use crate::core::errors::TreeResult;
use crate::tree::history::History;
use crate::tree::message::Message;

/// Chat document handed to the persistence service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedChat {
    /// Chat title.
    pub title: String,
    /// Selected model ids.
    pub models: Vec<String>,
    /// Messages of the displayed branch, root first.
    pub messages: Vec<Message>,
    /// Full tree; older documents only carry `messages`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<History>,
    /// Request parameters.
    pub params: ChatParams,
    /// Chat-level files.
    pub files: Vec<Value>,
    /// Tags.
    pub tags: Vec<String>,
    /// Last update (unix seconds).
    pub updated_at: i64,
}

impl PersistedChat {
    /// Snapshot a history together with its chat metadata.
    ///
    /// # Errors
    /// Returns an error if the current branch cannot be walked.
    pub fn snapshot(
        title: &str,
        models: &[String],
        history: &History,
        params: &ChatParams,
        files: &[Value],
        tags: &[String],
    ) -> TreeResult<Self> {
        let messages = match history.current_id() {
            Some(current) => history
                .path_to_root(current)?
                .into_iter()
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(Self {
            title: title.to_string(),
            models: models.to_vec(),
            messages,
            history: Some(history.clone()),
            params: params.clone(),
            files: files.to_vec(),
            tags: tags.to_vec(),
            updated_at: Utc::now().timestamp(),
        })
    }

    /// Rebuild the history, preferring the stored tree over the flat list.
    ///
    /// The current message is marked done, since nothing is streaming into a
    /// freshly loaded chat.
    ///
    /// # Errors
    /// Returns an error if the stored links are inconsistent.
    pub fn to_history(&self) -> TreeResult<History> {
        let mut history = match &self.history {
            Some(history) => {
                history.verify()?;
                history.clone()
            }
            None => history_from_flat(self.messages.clone())?,
        };
        if let Some(current) = history.current_id().and_then(|id| history.get_mut(id)) {
            current.done = true;
        }
        Ok(history)
    }
}

/// Rebuild a history from a flat message list.
///
/// Linked lists (with parent/child ids) keep their links, dropping references
/// to messages that were not stored; unlinked lists are chained in order. The
/// current tip is resolved with [`History::last_leaf`] from the oldest root.
///
/// # Errors
/// Returns an error if the links are inconsistent.
pub fn history_from_flat(mut messages: Vec<Message>) -> TreeResult<History> {
    if messages.is_empty() {
        return Ok(History::new());
    }

    let linked = messages
        .iter()
        .any(|m| m.parent_id.is_some() || !m.children_ids.is_empty());

    if linked {
        let present: HashSet<_> = messages.iter().map(|m| m.id).collect();
        for message in &mut messages {
            message.children_ids.retain(|child| present.contains(child));
            if message.parent_id.is_some_and(|p| !present.contains(&p)) {
                message.parent_id = None;
            }
        }
    } else {
        let ids: Vec<_> = messages.iter().map(|m| m.id).collect();
        for (index, message) in messages.iter_mut().enumerate() {
            message.parent_id = index.checked_sub(1).map(|prev| ids[prev]);
            message.children_ids = ids.get(index + 1).copied().into_iter().collect();
        }
    }

    let mut history = History::from_linked(messages)?;
    if let Some(root) = history.roots().first().copied() {
        let tip = history.last_leaf(root)?;
        history.set_current_id(Some(tip))?;
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::MessageId;

    fn branching_history() -> (History, MessageId) {
        let mut history = History::new();
        let q1 = history.append_user_message(None, "first").unwrap();
        let _a1_alt = history.append_response_placeholder(Some(q1), "b").unwrap();
        let a1 = history.append_response_placeholder(Some(q1), "a").unwrap();
        let q2 = history.append_user_message(Some(a1), "second").unwrap();
        let _old = history.append_response_placeholder(Some(q2), "a").unwrap();
        let tip = history.append_response_placeholder(Some(q2), "a").unwrap();
        (history, tip)
    }

    #[test]
    fn snapshot_keeps_current_branch_root_first() {
        let (history, tip) = branching_history();
        let chat = PersistedChat::snapshot(
            "t",
            &["a".to_string()],
            &history,
            &ChatParams::default(),
            &[],
            &[],
        )
        .unwrap();

        assert_eq!(chat.messages.len(), 4);
        assert_eq!(chat.messages.first().unwrap().content, "first");
        assert_eq!(chat.messages.last().unwrap().id(), tip);
    }

    #[test]
    fn flat_round_trip_resolves_same_tip() {
        let (history, tip) = branching_history();
        let root = history.roots()[0];
        assert_eq!(history.last_leaf(root).unwrap(), tip);

        let mut chat = PersistedChat::snapshot("t", &[], &history, &ChatParams::default(), &[], &[])
            .unwrap();
        chat.history = None;
        let json = serde_json::to_string(&chat).unwrap();
        let restored: PersistedChat = serde_json::from_str(&json).unwrap();

        let rebuilt = restored.to_history().unwrap();
        assert_eq!(rebuilt.current_id(), Some(tip));
        rebuilt.verify().unwrap();
    }

    #[test]
    fn full_history_round_trip_is_lossless() {
        let (history, tip) = branching_history();
        let chat = PersistedChat::snapshot("t", &[], &history, &ChatParams::default(), &[], &[])
            .unwrap();
        let json = serde_json::to_string(&chat).unwrap();
        let restored: PersistedChat = serde_json::from_str(&json).unwrap();

        let rebuilt = restored.to_history().unwrap();
        assert_eq!(rebuilt.len(), history.len());
        assert_eq!(rebuilt.current_id(), Some(tip));
        assert!(rebuilt.get(tip).unwrap().done);
    }

    #[test]
    fn unlinked_messages_are_chained() {
        let messages = vec![Message::user("a"), Message::system("b"), Message::user("c")];
        let last = messages[2].id();
        let history = history_from_flat(messages).unwrap();

        assert_eq!(history.current_id(), Some(last));
        assert_eq!(history.path_to_root(last).unwrap().len(), 3);
    }
}
