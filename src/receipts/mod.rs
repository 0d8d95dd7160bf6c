//! Receipt composition. Retry *orchestration* — deciding whether and when
//! to resend — stays with the caller; composing the `<receipt>` stanza
//! itself is this module's job.

use crate::binary::Node;
use crate::types::{Jid, MessageId};
use std::collections::HashMap;

/// `<receipt type=…>`. `Delivery` is the unmarked default — whatsmeow/
/// Baileys omit the `type` attribute entirely for plain delivery
/// receipts, which [`ReceiptType::as_attr`] models by returning `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptType {
    Delivery,
    Read,
    /// Used when the user's privacy setting disables read receipts.
    ReadSelf,
    Sender,
    Played,
}

impl ReceiptType {
    pub fn as_attr(&self) -> Option<&'static str> {
        match self {
            Self::Delivery => None,
            Self::Read => Some("read"),
            Self::ReadSelf => Some("read-self"),
            Self::Sender => Some("sender"),
            Self::Played => Some("played"),
        }
    }
}

/// One incoming message to be acknowledged.
#[derive(Clone, Debug)]
pub struct ReceiptEntry {
    pub jid: Jid,
    pub participant: Option<Jid>,
    pub message_id: MessageId,
    pub is_from_me: bool,
}

/// Grouping key: `(jid, participant) → [ids]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReceiptGroupKey {
    pub jid: Jid,
    pub participant: Option<Jid>,
}

/// Group entries not authored by this device by `(jid, participant)`;
/// messages from me never need a receipt and are dropped.
pub fn aggregate(entries: &[ReceiptEntry]) -> HashMap<ReceiptGroupKey, Vec<MessageId>> {
    let mut grouped: HashMap<ReceiptGroupKey, Vec<MessageId>> = HashMap::new();
    for entry in entries {
        if entry.is_from_me {
            continue;
        }
        let key = ReceiptGroupKey {
            jid: entry.jid.clone(),
            participant: entry.participant.clone(),
        };
        grouped.entry(key).or_default().push(entry.message_id.clone());
    }
    grouped
}

/// Build one `<receipt>` node for a single `(jid, participant)` group. The
/// first id becomes the stanza's `id` attribute; any remainder is carried
/// as a `<list>` of `<item>` children.
pub fn build_receipt(kind: ReceiptType, key: &ReceiptGroupKey, ids: &[MessageId]) -> Option<Node> {
    let (first, rest) = ids.split_first()?;
    let mut node = Node::new("receipt")
        .with_attr("to", key.jid.to_string())
        .with_attr("id", first.clone());
    if let Some(participant) = &key.participant {
        node = node.with_attr("participant", participant.to_string());
    }
    if let Some(type_attr) = kind.as_attr() {
        node = node.with_attr("type", type_attr);
    }
    if !rest.is_empty() {
        let items: Vec<Node> = rest
            .iter()
            .map(|id| Node::new("item").with_attr("id", id.clone()))
            .collect();
        node = node.with_children(vec![Node::new("list").with_children(items)]);
    }
    Some(node)
}

/// Aggregate `entries` and build one `<receipt>` node per group. Groups
/// with no surviving ids (all from-me) are skipped.
pub fn build_receipts(kind: ReceiptType, entries: &[ReceiptEntry]) -> Vec<Node> {
    aggregate(entries)
        .into_iter()
        .filter_map(|(key, ids)| build_receipt(kind, &key, &ids))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_USER_SERVER;

    fn jid(n: &str) -> Jid {
        Jid::new(n, DEFAULT_USER_SERVER)
    }

    #[test]
    fn delivery_receipt_omits_type_attr() {
        let key = ReceiptGroupKey {
            jid: jid("1"),
            participant: None,
        };
        let node = build_receipt(ReceiptType::Delivery, &key, &["A".to_string()]).unwrap();
        assert_eq!(node.attr("type"), None);
        assert_eq!(node.attr("id"), Some("A"));
    }

    #[test]
    fn read_self_sets_type_attr() {
        let key = ReceiptGroupKey {
            jid: jid("1"),
            participant: None,
        };
        let node = build_receipt(ReceiptType::ReadSelf, &key, &["A".to_string()]).unwrap();
        assert_eq!(node.attr("type"), Some("read-self"));
    }

    #[test]
    fn multiple_ids_become_list_of_items_after_the_first() {
        let key = ReceiptGroupKey {
            jid: jid("1"),
            participant: None,
        };
        let ids = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let node = build_receipt(ReceiptType::Read, &key, &ids).unwrap();
        assert_eq!(node.attr("id"), Some("A"));
        let list = node.get_child_by_tag("list").unwrap();
        let items: Vec<&str> = list
            .get_children_by_tag("item")
            .map(|n| n.attr("id").unwrap())
            .collect();
        assert_eq!(items, vec!["B", "C"]);
    }

    #[test]
    fn group_participant_sets_participant_attr() {
        let key = ReceiptGroupKey {
            jid: Jid::new("g1", crate::types::GROUP_SERVER),
            participant: Some(jid("2").with_device(0)),
        };
        let node = build_receipt(ReceiptType::Read, &key, &["A".to_string()]).unwrap();
        assert_eq!(node.attr("participant"), Some("2@s.whatsapp.net"));
    }

    #[test]
    fn aggregate_drops_from_me_and_groups_the_rest() {
        let entries = vec![
            ReceiptEntry {
                jid: jid("1"),
                participant: None,
                message_id: "A".to_string(),
                is_from_me: false,
            },
            ReceiptEntry {
                jid: jid("1"),
                participant: None,
                message_id: "B".to_string(),
                is_from_me: false,
            },
            ReceiptEntry {
                jid: jid("1"),
                participant: None,
                message_id: "C".to_string(),
                is_from_me: true,
            },
        ];
        let grouped = aggregate(&entries);
        assert_eq!(grouped.len(), 1);
        let key = ReceiptGroupKey {
            jid: jid("1"),
            participant: None,
        };
        assert_eq!(grouped.get(&key).unwrap(), &vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn build_receipts_end_to_end() {
        let entries = vec![ReceiptEntry {
            jid: jid("1"),
            participant: None,
            message_id: "A".to_string(),
            is_from_me: false,
        }];
        let nodes = build_receipts(ReceiptType::Read, &entries);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].tag, "receipt");
    }
}
