//! StanzaBuilder: assembles the final `<message>` node for each outbound
//! shape. Pure functions over already-encrypted ciphertext — this module
//! owns node shape, not encryption or device resolution.

use crate::crypto::CiphertextType;
use crate::binary::Node;
use crate::types::{EditType, Jid, MediaType, MessageId, MessageType};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// One already-encrypted per-device recipient (`<to jid=…><enc…>`).
pub struct EncryptedRecipient {
    pub jid: Jid,
    pub ciphertext_type: CiphertextType,
    pub ciphertext: Vec<u8>,
}

/// One pairwise SKDM recipient added alongside the group `skmsg` payload,
/// for every device not yet in sender-key-memory.
pub struct SkdmRecipient {
    pub jid: Jid,
    pub ciphertext_type: CiphertextType,
    pub ciphertext: Vec<u8>,
}

/// Caller-controlled knobs that vary a stanza shape without changing its
/// routing class (message type, media type, retry bookkeeping, …).
#[derive(Default)]
pub struct StanzaOptions {
    pub message_type: MessageType,
    pub media_type: Option<MediaType>,
    pub pin_decrypt_fail_hide: bool,
    /// Any `pkmsg` was emitted in this send, or the caller marks a
    /// retry-resend — both require `device-identity`.
    pub needs_device_identity: bool,
    pub device_identity: Option<Vec<u8>>,
    pub additional_nodes: Vec<Node>,
    /// `edit` ∈ {1 edit, 2 pin, 7 delete-own, 8 delete-as-admin}.
    pub edit: Option<EditType>,
}

/// Generate the `phash` fan-out-integrity attribute: sort the wire JIDs,
/// concatenate, SHA-256, and take a `2:`-prefixed base64 fingerprint.
pub fn participant_hash_v2(jids: &[Jid]) -> String {
    let mut sorted: Vec<String> = jids.iter().map(|j| j.to_string()).collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for jid in &sorted {
        hasher.update(jid.as_bytes());
    }
    let digest = hasher.finalize();
    let encoded = STANDARD.encode(digest.as_slice());
    format!("2:{}", &encoded[..6.min(encoded.len())])
}

/// `<biz>` business/button sub-node for interactive media types; shape
/// follows the whatsmeow/Baileys `list`/`buttons`/`native_flow` attachment
/// convention.
pub fn biz_node(media_type: MediaType) -> Option<Node> {
    if !media_type.is_interactive() {
        return None;
    }
    let child = match media_type {
        MediaType::List | MediaType::ListResponse => Node::new("list").with_attr("v", "2"),
        MediaType::ButtonsResponse => Node::new("buttons").with_attr("v", "1"),
        MediaType::NativeFlowResponse => Node::new("native_flow").with_attr("v", "1"),
        _ => return None,
    };
    Some(Node::new("biz").with_children(vec![child]))
}

/// Append `device-identity`, `biz`, and caller-supplied `additionalNodes`,
/// in that order, when present.
fn finalize(mut message: Node, opts: &StanzaOptions) -> Node {
    let mut extra = Vec::new();
    if opts.needs_device_identity {
        if let Some(identity) = &opts.device_identity {
            extra.push(Node::new("device-identity").with_content(identity.clone()));
        }
    }
    if let Some(media_type) = opts.media_type {
        if let Some(biz) = biz_node(media_type) {
            extra.push(biz);
        }
    }
    extra.extend(opts.additional_nodes.iter().cloned());

    if !extra.is_empty() {
        let mut children = match message.content {
            crate::binary::NodeContent::Nodes(n) => n,
            crate::binary::NodeContent::Empty => Vec::new(),
            crate::binary::NodeContent::Bytes(_) => Vec::new(),
        };
        children.extend(extra);
        message = message.with_children(children);
    }
    message
}

fn base_message(to: Jid, id: &MessageId, opts: &StanzaOptions) -> Node {
    let mut node = Node::new("message")
        .with_attr("to", to.to_string())
        .with_attr("id", id.clone())
        .with_attr("type", opts.message_type.as_str());
    if let Some(edit) = opts.edit {
        node = node.with_attr("edit", edit.as_str());
    }
    node
}

fn enc_attrs(node: Node, opts: &StanzaOptions) -> Node {
    let mut node = node;
    if let Some(media_type) = opts.media_type {
        node = node.with_attr("mediatype", media_type.as_str());
    }
    if opts.pin_decrypt_fail_hide {
        node = node.with_attr("decrypt-fail", "hide");
    }
    node
}

/// Newsletter send: a single `<plaintext>` child with the encoded message
/// bytes, no per-device encryption.
pub fn build_newsletter_message(
    newsletter: Jid,
    id: &MessageId,
    plaintext: &[u8],
    opts: &StanzaOptions,
) -> Node {
    let message = base_message(newsletter, id, opts)
        .with_children(vec![Node::new("plaintext").with_content(plaintext.to_vec())]);
    finalize(message, opts)
}

/// 1:1 direct send: `meRecipients` (other own devices, DSM-wrapped) and
/// `otherRecipients` (the peer, raw message), both grouped under
/// `<participants>` with a `phash`.
pub fn build_direct_message(
    peer: Jid,
    id: &MessageId,
    me_recipients: Vec<EncryptedRecipient>,
    other_recipients: Vec<EncryptedRecipient>,
    opts: &StanzaOptions,
) -> Node {
    let all_jids: Vec<Jid> = me_recipients
        .iter()
        .chain(other_recipients.iter())
        .map(|r| r.jid.clone())
        .collect();
    let phash = participant_hash_v2(&all_jids);

    let to_nodes: Vec<Node> = me_recipients
        .iter()
        .chain(other_recipients.iter())
        .map(|r| enc_attrs_to(r, opts))
        .collect();

    let participants = Node::new("participants")
        .with_attr("phash", phash)
        .with_children(to_nodes);

    let message = base_message(peer, id, opts).with_children(vec![participants]);
    finalize(message, opts)
}

fn enc_attrs_to(recipient: &EncryptedRecipient, opts: &StanzaOptions) -> Node {
    let enc = enc_attrs(
        Node::new("enc")
            .with_attr("v", "2")
            .with_attr("type", recipient.ciphertext_type.as_str())
            .with_content(recipient.ciphertext.clone()),
        opts,
    );
    Node::new("to")
        .with_attr("jid", recipient.jid.to_string())
        .with_children(vec![enc])
}

/// Group or status-broadcast send: the group `skmsg` ciphertext as a
/// direct child, plus a `<participants>` wrapper carrying the pairwise
/// SKDM for any device not yet in sender-key-memory.
pub fn build_group_message(
    group: Jid,
    id: &MessageId,
    addressing_mode: crate::types::AddressingMode,
    skmsg_ciphertext: &[u8],
    skdm_recipients: Vec<SkdmRecipient>,
    ephemeral_duration: Option<u32>,
    opts: &StanzaOptions,
) -> Node {
    let enc = enc_attrs(
        Node::new("enc")
            .with_attr("v", "2")
            .with_attr("type", "skmsg")
            .with_content(skmsg_ciphertext.to_vec()),
        opts,
    );

    let mut message = base_message(group, id, opts)
        .with_attr("addressing_mode", addressing_mode.to_string())
        .with_children(vec![enc]);

    if let Some(expiration) = ephemeral_duration {
        message = message.with_attr("expiration", expiration.to_string());
    }

    if !skdm_recipients.is_empty() {
        let jids: Vec<Jid> = skdm_recipients.iter().map(|r| r.jid.clone()).collect();
        let phash = participant_hash_v2(&jids);
        let to_nodes: Vec<Node> = skdm_recipients
            .into_iter()
            .map(|r| {
                let enc = Node::new("enc")
                    .with_attr("v", "2")
                    .with_attr("type", r.ciphertext_type.as_str())
                    .with_content(r.ciphertext);
                Node::new("to")
                    .with_attr("jid", r.jid.to_string())
                    .with_children(vec![enc])
            })
            .collect();
        let participants = Node::new("participants")
            .with_attr("phash", phash)
            .with_children(to_nodes);
        let mut children = match message.content {
            crate::binary::NodeContent::Nodes(n) => n,
            _ => Vec::new(),
        };
        children.push(participants);
        message = message.with_children(children);
    }

    finalize(message, opts)
}

/// Identifies the retry target for a retry-resend stanza.
pub struct RetryParticipant {
    pub jid: Jid,
    pub count: u32,
    /// `true` when the participant is the sender's own other device
    /// (`to=self, recipient=destinationJid` routing).
    pub is_self: bool,
}

/// Retry-resend: the message is encrypted pairwise exactly
/// once to `participant`; `<enc>` carries `count=<n>`. Non-group routing
/// is `to=participant.jid` (or `to=self, recipient=destinationJid` when
/// the participant is the sender's own device); group routing is
/// `to=groupJid, participant=participant.jid`.
pub fn build_retry_resend_message(
    dest: Jid,
    self_jid: &Jid,
    group: Option<&Jid>,
    id: &MessageId,
    participant: &RetryParticipant,
    ciphertext_type: CiphertextType,
    ciphertext: &[u8],
    opts: &StanzaOptions,
) -> Node {
    let mut message = if let Some(group) = group {
        base_message(group.clone(), id, opts).with_attr("participant", participant.jid.to_string())
    } else if participant.is_self {
        base_message(self_jid.clone(), id, opts).with_attr("recipient", dest.to_string())
    } else {
        base_message(participant.jid.clone(), id, opts)
    };
    message = message.with_attr("device_fanout", "false");

    let enc = enc_attrs(
        Node::new("enc")
            .with_attr("v", "2")
            .with_attr("type", ciphertext_type.as_str())
            .with_attr("count", participant.count.to_string()),
        opts,
    )
    .with_content(ciphertext.to_vec());

    message = message.with_children(vec![enc]);
    finalize(message, opts)
}

/// Peer-data category: no `<participants>` wrapper, the inner `<enc>` is
/// a direct child of `<message>`. Also requires `push_priority=high_force`
/// and a `<meta appdata=default>` child.
pub fn build_peer_message(
    peer: Jid,
    id: &MessageId,
    ciphertext_type: CiphertextType,
    ciphertext: &[u8],
    opts: &StanzaOptions,
) -> Node {
    let enc = enc_attrs(
        Node::new("enc")
            .with_attr("v", "2")
            .with_attr("type", ciphertext_type.as_str())
            .with_content(ciphertext.to_vec()),
        opts,
    );
    let meta = Node::new("meta").with_attr("appdata", "default");

    let message = base_message(peer, id, opts)
        .with_attr("category", "peer")
        .with_attr("push_priority", "high_force")
        .with_children(vec![enc, meta]);
    finalize(message, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddressingMode, DEFAULT_USER_SERVER, GROUP_SERVER};

    fn jid(n: &str) -> Jid {
        Jid::new(n, DEFAULT_USER_SERVER)
    }

    #[test]
    fn newsletter_message_has_plaintext_child_and_no_encryption() {
        let msg = build_newsletter_message(
            Jid::new("n1", crate::types::NEWSLETTER_SERVER),
            &"ABC123".to_string(),
            b"hello",
            &StanzaOptions::default(),
        );
        assert_eq!(msg.tag, "message");
        assert_eq!(msg.attr("type"), Some("text"));
        let plaintext = msg.get_child_by_tag("plaintext").unwrap();
        assert!(matches!(plaintext.content, crate::binary::NodeContent::Bytes(_)));
    }

    #[test]
    fn direct_message_splits_me_and_other_with_phash() {
        let peer = jid("111").with_device(0);
        let me_device = jid("999").with_device(1);

        let me_recipients = vec![EncryptedRecipient {
            jid: me_device.clone(),
            ciphertext_type: CiphertextType::Msg,
            ciphertext: vec![1, 2, 3],
        }];
        let other_recipients = vec![EncryptedRecipient {
            jid: peer.clone(),
            ciphertext_type: CiphertextType::PkMsg,
            ciphertext: vec![4, 5, 6],
        }];

        let msg = build_direct_message(
            peer.clone(),
            &"MSG1".to_string(),
            me_recipients,
            other_recipients,
            &StanzaOptions::default(),
        );

        let participants = msg.get_child_by_tag("participants").unwrap();
        assert!(participants.attr("phash").is_some());
        let to_nodes = participants.get_children_by_tag("to").count();
        assert_eq!(to_nodes, 2);

        // round trips through the real binary codec
        let encoded = msg.encode().unwrap();
        let decoded = Node::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn group_message_carries_skmsg_and_skdm_participants() {
        let group = Jid::new("g1", GROUP_SERVER);
        let skdm_recipients = vec![SkdmRecipient {
            jid: jid("1").with_device(0),
            ciphertext_type: CiphertextType::PkMsg,
            ciphertext: vec![7, 8],
        }];

        let msg = build_group_message(
            group,
            &"GMSG1".to_string(),
            AddressingMode::Pn,
            b"group-ciphertext",
            skdm_recipients,
            Some(86400),
            &StanzaOptions::default(),
        );

        assert_eq!(msg.attr("addressing_mode"), Some("pn"));
        assert_eq!(msg.attr("expiration"), Some("86400"));
        let enc = msg.get_child_by_tag("enc").unwrap();
        assert_eq!(enc.attr("type"), Some("skmsg"));
        let participants = msg.get_child_by_tag("participants").unwrap();
        assert_eq!(participants.get_children_by_tag("to").count(), 1);
    }

    #[test]
    fn retry_resend_carries_count_and_routes_to_participant() {
        let participant = RetryParticipant {
            jid: jid("222").with_device(0),
            count: 3,
            is_self: false,
        };
        let msg = build_retry_resend_message(
            jid("222"),
            &jid("999"),
            None,
            &"RETRY1".to_string(),
            &participant,
            CiphertextType::Msg,
            b"ciphertext",
            &StanzaOptions::default(),
        );
        assert_eq!(msg.attr("to"), Some("222@s.whatsapp.net"));
        let enc = msg.get_child_by_tag("enc").unwrap();
        assert_eq!(enc.attr("count"), Some("3"));
    }

    #[test]
    fn retry_resend_to_self_device_routes_via_recipient() {
        let participant = RetryParticipant {
            jid: jid("999").with_device(2),
            count: 1,
            is_self: true,
        };
        let msg = build_retry_resend_message(
            jid("222"),
            &jid("999"),
            None,
            &"RETRY2".to_string(),
            &participant,
            CiphertextType::Msg,
            b"ciphertext",
            &StanzaOptions::default(),
        );
        assert_eq!(msg.attr("to"), Some("999@s.whatsapp.net"));
        assert_eq!(msg.attr("recipient"), Some("222@s.whatsapp.net"));
    }

    #[test]
    fn peer_message_lifts_enc_and_sets_category() {
        let msg = build_peer_message(
            jid("1"),
            &"PEER1".to_string(),
            CiphertextType::Msg,
            b"ciphertext",
            &StanzaOptions::default(),
        );
        assert_eq!(msg.attr("category"), Some("peer"));
        assert_eq!(msg.attr("push_priority"), Some("high_force"));
        assert!(msg.get_child_by_tag("participants").is_none());
        assert!(msg.get_child_by_tag("enc").is_some());
        assert!(msg.get_child_by_tag("meta").is_some());
    }

    #[test]
    fn device_identity_and_biz_and_additional_nodes_append_in_order() {
        let opts = StanzaOptions {
            needs_device_identity: true,
            device_identity: Some(vec![1, 1, 1]),
            media_type: Some(MediaType::List),
            additional_nodes: vec![Node::new("custom")],
            ..Default::default()
        };
        let msg = build_peer_message(jid("1"), &"X".to_string(), CiphertextType::Msg, b"c", &opts);
        let children = msg.get_children();
        let tags: Vec<&str> = children.iter().map(|n| n.tag.as_str()).collect();
        let di = tags.iter().position(|t| *t == "device-identity").unwrap();
        let biz = tags.iter().position(|t| *t == "biz").unwrap();
        let custom = tags.iter().position(|t| *t == "custom").unwrap();
        assert!(di < biz && biz < custom);
    }

    #[test]
    fn pin_message_sets_decrypt_fail_hide() {
        let opts = StanzaOptions {
            pin_decrypt_fail_hide: true,
            ..Default::default()
        };
        let msg = build_peer_message(jid("1"), &"X".to_string(), CiphertextType::Msg, b"c", &opts);
        let enc = msg.get_child_by_tag("enc").unwrap();
        assert_eq!(enc.attr("decrypt-fail"), Some("hide"));
    }

    #[test]
    fn media_type_sets_enc_mediatype_attribute() {
        let opts = StanzaOptions {
            media_type: Some(MediaType::Image),
            ..Default::default()
        };
        let msg = build_peer_message(jid("1"), &"X".to_string(), CiphertextType::Msg, b"c", &opts);
        let enc = msg.get_child_by_tag("enc").unwrap();
        assert_eq!(enc.attr("mediatype"), Some("image"));
    }

    #[test]
    fn edit_sets_message_edit_attribute() {
        let opts = StanzaOptions {
            edit: Some(crate::types::EditType::Pin),
            ..Default::default()
        };
        let msg = build_peer_message(jid("1"), &"X".to_string(), CiphertextType::Msg, b"c", &opts);
        assert_eq!(msg.attr("edit"), Some("2"));
    }

    #[test]
    fn retry_resend_sets_device_fanout_false() {
        let participant = RetryParticipant {
            jid: jid("222").with_device(0),
            count: 1,
            is_self: false,
        };
        let msg = build_retry_resend_message(
            jid("222"),
            &jid("999"),
            None,
            &"RETRY3".to_string(),
            &participant,
            CiphertextType::Msg,
            b"ciphertext",
            &StanzaOptions::default(),
        );
        assert_eq!(msg.attr("device_fanout"), Some("false"));
    }
}
