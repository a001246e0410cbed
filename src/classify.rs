//! Turns raw remote records into typed conversations.

use std::collections::BTreeSet;

use crate::model::{Conversation, ConversationId, ConversationKind};
use crate::remote::RawConversation;
use crate::whitelist::normalize;

/// A conversation plus the normalized identifiers used for whitelist lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub conversation: Conversation,
    pub identifiers: BTreeSet<String>,
}

/// First matching rule wins: channel, group, bot, deleted account, private chat.
pub fn kind_of(raw: &RawConversation) -> ConversationKind {
    if raw.is_channel {
        ConversationKind::Channel
    } else if raw.is_group {
        ConversationKind::Group
    } else if raw.is_bot {
        ConversationKind::Bot
    } else if raw.is_deleted {
        ConversationKind::DeletedAccountChat
    } else {
        ConversationKind::PrivateChat
    }
}

/// Best human-readable name: title, then full name, then username, then id.
pub fn display_name(raw: &RawConversation) -> String {
    let non_blank = |s: &Option<String>| s.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned);

    if let Some(title) = non_blank(&raw.title) {
        return title;
    }
    match (non_blank(&raw.first_name), non_blank(&raw.last_name)) {
        (Some(first), Some(last)) => return format!("{first} {last}"),
        (Some(first), None) => return first,
        (None, Some(last)) => return last,
        (None, None) => {}
    }
    if let Some(username) = non_blank(&raw.username) {
        return format!("@{}", username.trim_start_matches('@'));
    }
    format!("ID: {}", raw.id)
}

pub fn classify(raw: &RawConversation) -> Classified {
    let name = display_name(raw);
    let identifiers = [raw.username.as_deref(), raw.link.as_deref(), Some(name.as_str())]
        .into_iter()
        .flatten()
        .filter_map(normalize)
        .collect();

    Classified {
        conversation: Conversation {
            id: ConversationId(raw.id),
            kind: kind_of(raw),
            display_name: name,
            username: raw.username.clone().filter(|u| !u.trim().is_empty()),
            link: raw.link.clone().filter(|l| !l.trim().is_empty()),
        },
        identifiers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: i64) -> RawConversation {
        RawConversation {
            id,
            ..Default::default()
        }
    }

    #[test]
    fn priority_order() {
        let mut r = raw(1);
        r.is_channel = true;
        r.is_group = true;
        r.is_bot = true;
        assert_eq!(kind_of(&r), ConversationKind::Channel);

        r.is_channel = false;
        assert_eq!(kind_of(&r), ConversationKind::Group);

        r.is_group = false;
        r.is_deleted = true;
        assert_eq!(kind_of(&r), ConversationKind::Bot);

        r.is_bot = false;
        assert_eq!(kind_of(&r), ConversationKind::DeletedAccountChat);

        r.is_deleted = false;
        assert_eq!(kind_of(&r), ConversationKind::PrivateChat);
    }

    #[test]
    fn display_name_fallbacks() {
        let mut r = raw(42);
        assert_eq!(display_name(&r), "ID: 42");
        r.username = Some("someone".into());
        assert_eq!(display_name(&r), "@someone");
        r.last_name = Some("Lovelace".into());
        assert_eq!(display_name(&r), "Lovelace");
        r.first_name = Some("Ada".into());
        assert_eq!(display_name(&r), "Ada Lovelace");
        r.title = Some("  ".into());
        assert_eq!(display_name(&r), "Ada Lovelace");
        r.title = Some("Analytical".into());
        assert_eq!(display_name(&r), "Analytical");
    }

    #[test]
    fn identifiers_are_normalized() {
        let c = classify(&RawConversation {
            id: 7,
            title: Some("News Room".into()),
            username: Some("@NewsRoom".into()),
            link: Some("https://t.me/newsroom_backup".into()),
            is_channel: true,
            ..Default::default()
        });
        let ids: Vec<_> = c.identifiers.iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["news room", "newsroom", "newsroom_backup"]);
        assert_eq!(c.conversation.kind, ConversationKind::Channel);
        assert_eq!(c.conversation.id, ConversationId(7));
    }
}
