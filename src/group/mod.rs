//! GroupState: group metadata cache plus the durable sender-key-memory
//! ledger that drives SKDM fan-out.

use crate::binary::Node;
use crate::error::GroupError;
use crate::store::SenderKeyMemoryStore;
use crate::types::{AddressingMode, Jid, GROUP_SERVER};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One participant of a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Participant {
    /// PN-space JID.
    pub id: Jid,
    /// LID-space JID, when the group is LID-addressed.
    pub lid: Option<Jid>,
    pub admin: bool,
}

/// Group metadata snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMetadata {
    pub id: Jid,
    pub addressing_mode: AddressingMode,
    pub participants: Vec<Participant>,
    pub ephemeral_duration: Option<u32>,
    pub owner_pn: Option<Jid>,
    pub owner_lid: Option<Jid>,
}

/// The `<iq type="get" xmlns="w:g2">` group metadata round trip. External
/// collaborator, exposed as a trait for testability.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self, group: &Jid) -> Result<GroupMetadata>;
}

/// Builds the `<group>` node shape a `w:g2` metadata response carries.
/// Exact inverse of [`extract_group_metadata`]: round-tripping any
/// `GroupMetadata` this crate produces through build-then-extract yields
/// the same value back.
pub fn build_group_metadata_node(metadata: &GroupMetadata) -> Node {
    let participants = metadata
        .participants
        .iter()
        .map(|p| {
            Node::new("participant")
                .with_attr("jid", p.id.to_string())
                .with_optional_attr("lid", p.lid.as_ref().map(|l| l.to_string()))
                .with_optional_attr("type", if p.admin { Some("admin") } else { None })
        })
        .collect();

    Node::new("group")
        .with_attr("id", metadata.id.user.clone())
        .with_attr("addressing_mode", metadata.addressing_mode.to_string())
        .with_optional_attr("ephemeral", metadata.ephemeral_duration.map(|d| d.to_string()))
        .with_optional_attr("creator", metadata.owner_pn.as_ref().map(|o| o.to_string()))
        .with_optional_attr("creator_lid", metadata.owner_lid.as_ref().map(|o| o.to_string()))
        .with_children(participants)
}

/// Inverse of [`build_group_metadata_node`]. Returns `None` if `node` is
/// missing an attribute or child a valid `<group>` node must carry.
pub fn extract_group_metadata(node: &Node) -> Option<GroupMetadata> {
    let id = Jid::new(node.attr("id")?, GROUP_SERVER);
    let addressing_mode = match node.attr("addressing_mode")? {
        "pn" => AddressingMode::Pn,
        "lid" => AddressingMode::Lid,
        _ => return None,
    };
    let ephemeral_duration = node.attr("ephemeral").and_then(|s| s.parse().ok());
    let owner_pn = node.attr("creator").and_then(|s| s.parse().ok());
    let owner_lid = node.attr("creator_lid").and_then(|s| s.parse().ok());
    let participants = node
        .get_children_by_tag("participant")
        .map(|p| {
            let id = p.attr("jid")?.parse().ok()?;
            let lid = p.attr("lid").and_then(|s| s.parse().ok());
            let admin = p.attr("type") == Some("admin");
            Some(Participant { id, lid, admin })
        })
        .collect::<Option<Vec<_>>>()?;

    Some(GroupMetadata {
        id,
        addressing_mode,
        participants,
        ephemeral_duration,
        owner_pn,
        owner_lid,
    })
}

struct CachedMetadata {
    value: GroupMetadata,
    fetched_at: Instant,
}

/// Group metadata cache (5-minute freshness window) plus the
/// sender-key-memory ledger, the sole writer of which is
/// [`GroupState::mark_sent`].
pub struct GroupState<F: MetadataFetcher, S: SenderKeyMemoryStore> {
    fetcher: Arc<F>,
    sender_key_memory: Arc<S>,
    ttl: Duration,
    cache: DashMap<String, CachedMetadata>,
}

impl<F: MetadataFetcher, S: SenderKeyMemoryStore> GroupState<F, S> {
    pub fn new(fetcher: Arc<F>, sender_key_memory: Arc<S>, ttl: Duration) -> Self {
        Self {
            fetcher,
            sender_key_memory,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Return fresh group metadata, consulting `cache_hint` first (a
    /// caller-supplied cached-metadata callback), then the in-process
    /// cache, then the [`MetadataFetcher`] collaborator.
    pub async fn get_or_fetch(
        &self,
        jid: &Jid,
        cache_hint: Option<&GroupMetadata>,
    ) -> Result<GroupMetadata> {
        if let Some(hint) = cache_hint {
            return Ok(hint.clone());
        }
        if let Some(entry) = self.cache.get(&jid.to_string()) {
            if entry.fetched_at.elapsed() <= self.ttl {
                return Ok(entry.value.clone());
            }
        }
        let metadata = self.fetcher.fetch(jid).await.map_err(|e| {
            crate::Error::Group(GroupError::MetadataFetchFailed(jid.to_string(), e.to_string()))
        })?;
        self.cache.insert(
            jid.to_string(),
            CachedMetadata {
                value: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(metadata)
    }

    /// Wire JIDs that already hold the group's current sender key.
    pub async fn sender_key_memory(&self, jid: &Jid) -> Result<HashSet<Jid>> {
        let raw = self.sender_key_memory.get(&jid.to_string()).await?;
        Ok(raw.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    /// Record that `wire_jids` have received the current sender-key
    /// distribution message. The only public mutator of sender-key-memory —
    /// callers must invoke this only after a successful send, per the
    /// `mark_sent`-after-commit note in DESIGN.md.
    pub async fn mark_sent(&self, jid: &Jid, wire_jids: &[Jid]) -> Result<()> {
        let strings: Vec<String> = wire_jids.iter().map(|j| j.to_string()).collect();
        self.sender_key_memory.mark_sent(&jid.to_string(), &strings).await
    }
}
