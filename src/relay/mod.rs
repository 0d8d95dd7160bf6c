//! Relay: the top-level outbound send orchestrator.
//!
//! Dispatches an application message to the per-destination-class algorithm
//! (newsletter, status broadcast, group, peer-data, 1:1 direct, or
//! retry-resend), driving [`crate::identity::IdentityMap`],
//! [`crate::devices::DeviceResolver`], [`crate::session::SessionGuard`],
//! [`crate::group::GroupState`], and [`crate::crypto::Encryptor`] in turn,
//! and handing the assembled [`crate::binary::Node`] to the transport
//! inside a single keystore transaction scoped to the sender's own id.

use crate::binary::Node;
use crate::crypto::{CiphertextType, Encryptor, SignalRepository};
use crate::devices::{DeviceResolver, ResolveOptions, UsyncClient};
use crate::error::RelayError;
use crate::group::{GroupState, MetadataFetcher};
use crate::identity::IdentityMap;
use crate::retry::RetryCache;
use crate::session::{KeyStore, PreKeyClient, ProtocolAddress, SessionGuard};
use crate::stanza::{self, EncryptedRecipient, SkdmRecipient, StanzaOptions};
use crate::store::{DeviceListStore, LidMapStore, SenderKeyMemoryStore, TransactionManager};
use crate::types::{AddressingMode, Jid, MediaType, MessageId, MessageType, WireMessage};
use crate::config::RelayConfig;
use crate::Result;
use async_trait::async_trait;
use sha2::Digest;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Hands an assembled stanza to the wire. The relay core's only outbound
/// collaborator; production code typically implements this by calling
/// [`crate::binary::Node::encode`] then [`crate::transport::Transport::send`].
#[async_trait]
pub trait SendNode: Send + Sync {
    async fn send_node(&self, node: &Node) -> Result<()>;
}

/// A caller-supplied override of the plaintext to encrypt, either for
/// every recipient or per wire JID (`patchMessageBeforeSending`).
pub enum PatchedMessage {
    Single(WireMessage),
    PerRecipient(Vec<(Jid, WireMessage)>),
}

type PatchFn = dyn Fn(&WireMessage, Option<&Jid>) -> PatchedMessage + Send + Sync;

/// One pending retry-resend target, supplied by the caller (retry
/// *orchestration* — deciding whether to resend at all — stays with the
/// caller; it already knows which participant asked).
#[derive(Clone, Debug)]
pub struct RetryInput {
    /// The wire JID to re-encrypt and resend to.
    pub jid: Jid,
    pub count: u32,
    pub is_self: bool,
}

/// Per-call knobs threaded through to [`stanza::StanzaOptions`] plus the
/// destination-class-specific inputs a send needs.
#[derive(Default)]
pub struct RelayOptions {
    pub message_id: Option<MessageId>,
    pub message_type: MessageType,
    pub media_type: Option<MediaType>,
    pub additional_nodes: Vec<Node>,
    pub pin_decrypt_fail_hide: bool,
    /// `edit` ∈ {1 edit, 2 pin, 7 delete-own, 8 delete-as-admin}.
    pub edit: Option<crate::types::EditType>,
    /// `category=peer` routing.
    pub category_peer: bool,
    /// Explicit recipient list for a status-broadcast send; the group
    /// metadata cache is never consulted for status sends.
    pub status_jid_list: Option<Vec<Jid>>,
    /// The caller-supplied `cachedGroupMetadata` callback result, consulted
    /// before the in-process cache or a fresh fetch.
    pub cached_group_metadata: Option<crate::group::GroupMetadata>,
    /// Set for a retry-resend call; routes through [`Relay::build_retry_stanza`]
    /// instead of the normal per-class dispatch.
    pub retry: Option<RetryInput>,
}

/// `{ message_id, timestamp }`.
#[derive(Clone, Debug)]
pub struct RelayResult {
    pub message_id: MessageId,
    pub timestamp: SystemTime,
}

enum PostSend {
    None,
    MarkGroupSent { group: Jid, wire_jids: Vec<Jid> },
}

struct PendingStanza {
    node: Node,
    post_send: PostSend,
}

fn generate_message_id() -> MessageId {
    use std::time::UNIX_EPOCH;
    let mut data = Vec::with_capacity(24);
    let t = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    data.extend_from_slice(&t.to_be_bytes());
    data.extend_from_slice(&rand::random::<[u8; 16]>());
    let hash = sha2::Sha256::digest(&data);
    format!("3EB0{}", hex::encode(&hash[..9]))
}

/// `DeviceSentMessage`-style wrap for the `meRecipients` branch of a 1:1
/// send: length-prefixed destination JID followed by the original bytes.
/// The full DSM protobuf schema is higher-level developer ergonomics out
/// of scope for this crate; `WireMessage` is already opaque bytes, so
/// wrapping is this minimal envelope rather than a protobuf re-encode.
fn wrap_device_sent_message(original: &[u8], destination: &Jid) -> Vec<u8> {
    let dest = destination.to_string();
    let mut out = Vec::with_capacity(2 + dest.len() + original.len());
    out.extend_from_slice(&(dest.len() as u16).to_be_bytes());
    out.extend_from_slice(dest.as_bytes());
    out.extend_from_slice(original);
    out
}

fn message_for(patched: &PatchedMessage, original: &WireMessage, recipient: &Jid) -> WireMessage {
    match patched {
        PatchedMessage::Single(m) => m.clone(),
        PatchedMessage::PerRecipient(list) => list
            .iter()
            .find(|(jid, _)| jid == recipient)
            .map(|(_, m)| m.clone())
            .unwrap_or_else(|| original.clone()),
    }
}

/// Top-level send orchestrator. Generic over the five collaborator seams
/// the rest of this crate already defines: a keystore
/// bundle `KS`, the USync/pre-key/group-metadata external round trips, and
/// the Signal repository doing the actual ratchet math.
pub struct Relay<KS, U, P, F, R, T>
where
    KS: LidMapStore + SenderKeyMemoryStore + DeviceListStore + KeyStore,
    U: UsyncClient,
    P: PreKeyClient,
    F: MetadataFetcher,
    R: SignalRepository,
    T: SendNode,
{
    me: Jid,
    me_device: u16,
    me_lid: Option<Jid>,
    identity: Arc<IdentityMap<KS>>,
    devices: DeviceResolver<U, KS>,
    sessions: SessionGuard<KS, P>,
    groups: GroupState<F, KS>,
    encryptor: Encryptor<R>,
    txn: TransactionManager,
    retry_cache: Option<RetryCache>,
    config: RelayConfig,
    transport: Arc<T>,
    device_identity: Option<Vec<u8>>,
    patch_message_before_sending: Option<Box<PatchFn>>,
}

impl<KS, U, P, F, R, T> Relay<KS, U, P, F, R, T>
where
    KS: LidMapStore + SenderKeyMemoryStore + DeviceListStore + KeyStore,
    U: UsyncClient,
    P: PreKeyClient,
    F: MetadataFetcher,
    R: SignalRepository,
    T: SendNode,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        me: Jid,
        me_device: u16,
        me_lid: Option<Jid>,
        keystore: Arc<KS>,
        usync: Arc<U>,
        prekeys: Arc<P>,
        metadata_fetcher: Arc<F>,
        signal_repo: Arc<R>,
        transport: Arc<T>,
        config: RelayConfig,
    ) -> Self {
        let identity = Arc::new(IdentityMap::new(Arc::clone(&keystore), config.lid_mapping_idle_ttl));
        let devices = DeviceResolver::new(
            Arc::clone(&usync),
            Arc::clone(&keystore),
            Arc::clone(&identity),
            config.user_devices_ttl,
        );
        let sessions = SessionGuard::new(
            Arc::clone(&keystore),
            Arc::clone(&prekeys),
            config.peer_sessions_ttl,
            config.compat_v6_group_send,
        );
        let groups = GroupState::new(Arc::clone(&metadata_fetcher), Arc::clone(&keystore), config.group_metadata_ttl);
        let encryptor = Encryptor::new(Arc::clone(&signal_repo), config.compat_v6_group_send);
        let retry_cache = if config.enable_recent_message_cache {
            Some(RetryCache::new(config.recent_messages_cache_size))
        } else {
            None
        };
        Self {
            me,
            me_device,
            me_lid,
            identity,
            devices,
            sessions,
            groups,
            encryptor,
            txn: TransactionManager::new(),
            retry_cache,
            config,
            transport,
            device_identity: None,
            patch_message_before_sending: None,
        }
    }

    /// Attaches the signed device identity blob appended to any stanza
    /// that emits a `pkmsg` or is a retry-resend.
    pub fn with_device_identity(mut self, device_identity: Vec<u8>) -> Self {
        self.device_identity = Some(device_identity);
        self
    }

    /// Installs a `patchMessageBeforeSending`-style hook.
    pub fn with_patch_message_before_sending<Fun>(mut self, f: Fun) -> Self
    where
        Fun: Fn(&WireMessage, Option<&Jid>) -> PatchedMessage + Send + Sync + 'static,
    {
        self.patch_message_before_sending = Some(Box::new(f));
        self
    }

    fn resolve_message(&self, original: &WireMessage, dest: Option<&Jid>) -> PatchedMessage {
        match &self.patch_message_before_sending {
            Some(f) => f(original, dest),
            None => PatchedMessage::Single(original.clone()),
        }
    }

    fn stanza_opts(&self, opts: &RelayOptions, needs_device_identity: bool) -> StanzaOptions {
        StanzaOptions {
            message_type: opts.message_type,
            media_type: opts.media_type,
            pin_decrypt_fail_hide: opts.pin_decrypt_fail_hide,
            edit: opts.edit,
            needs_device_identity,
            device_identity: if needs_device_identity {
                self.device_identity.clone()
            } else {
                None
            },
            additional_nodes: opts.additional_nodes.clone(),
        }
    }

    /// Entry point. Opens the sender-scoped keystore transaction, builds
    /// the destination-appropriate stanza, sends it,
    /// and — only once the send has succeeded — runs any post-send
    /// bookkeeping (sender-key-memory commit, recent-message retention).
    pub async fn relay(&self, dest: Jid, message: WireMessage, opts: RelayOptions) -> Result<RelayResult> {
        let message_id = opts.message_id.clone().unwrap_or_else(generate_message_id);
        let is_retry = opts.retry.is_some();
        let scope = format!("relay:{}", self.me);

        self.txn
            .transaction(scope, || async {
                let pending = self.build_stanza(&dest, &message, &opts, &message_id).await?;
                self.transport
                    .send_node(&pending.node)
                    .await
                    .map_err(|e| crate::Error::Relay(RelayError::SendNodeRejected(e.to_string())))?;
                if let PostSend::MarkGroupSent { group, wire_jids } = &pending.post_send {
                    self.groups.mark_sent(group, wire_jids).await?;
                }
                Ok(())
            })
            .await?;

        if !is_retry {
            if let Some(cache) = &self.retry_cache {
                cache.insert(&dest, &message_id, message);
            }
        }

        Ok(RelayResult {
            message_id,
            timestamp: SystemTime::now(),
        })
    }

    async fn build_stanza(
        &self,
        dest: &Jid,
        message: &WireMessage,
        opts: &RelayOptions,
        message_id: &MessageId,
    ) -> Result<PendingStanza> {
        if let Some(retry) = &opts.retry {
            return self.build_retry_stanza(dest, message, opts, message_id, retry).await;
        }
        if opts.category_peer {
            return self.build_peer_stanza(dest, message, opts, message_id).await;
        }
        if dest.is_newsletter() {
            return Ok(self.build_newsletter_stanza(dest, message, opts, message_id));
        }
        if dest.is_status_broadcast() {
            return self.build_status_stanza(dest, message, opts, message_id).await;
        }
        if dest.is_group() {
            return self.build_group_stanza(dest, message, opts, message_id).await;
        }
        self.build_direct_stanza(dest, message, opts, message_id).await
    }

    fn build_newsletter_stanza(
        &self,
        dest: &Jid,
        message: &WireMessage,
        opts: &RelayOptions,
        message_id: &MessageId,
    ) -> PendingStanza {
        let patched = self.resolve_message(message, Some(dest));
        let bytes = message_for(&patched, message, dest);
        let stanza_opts = self.stanza_opts(opts, false);
        let node = stanza::build_newsletter_message(dest.clone(), message_id, bytes.as_bytes(), &stanza_opts);
        PendingStanza { node, post_send: PostSend::None }
    }

    /// 1:1 direct send: resolve self + peer devices, drop the sender's own
    /// exact wire device (invariant: no `<to>` targets the sending
    /// device), split the rest into
    /// `meRecipients` (other own devices, DSM-wrapped) and
    /// `otherRecipients` (the peer, raw), assert sessions, encrypt each.
    async fn build_direct_stanza(
        &self,
        peer: &Jid,
        message: &WireMessage,
        opts: &RelayOptions,
        message_id: &MessageId,
    ) -> Result<PendingStanza> {
        let self_bare = self.me.clone();
        let resolved = self
            .devices
            .resolve(&[self_bare.clone(), peer.clone()], &ResolveOptions::default())
            .await?;

        let my_own_wire = self_bare.with_device(self.me_device);

        let mut me_wire = Vec::new();
        let mut other_wire = Vec::new();
        for d in &resolved {
            if d.jid == my_own_wire {
                continue;
            }
            if d.jid.same_user(&self_bare) {
                me_wire.push(d.jid.clone());
            } else {
                other_wire.push(d.jid.clone());
            }
        }

        let addrs: Vec<ProtocolAddress> = me_wire
            .iter()
            .chain(other_wire.iter())
            .map(ProtocolAddress::from_jid)
            .collect();
        self.sessions.assert_sessions(&addrs).await?;

        let patched = self.resolve_message(message, Some(peer));
        let mut needs_device_identity = false;

        let mut me_recipients = Vec::new();
        for jid in &me_wire {
            let plaintext = message_for(&patched, message, jid);
            let dsm = wrap_device_sent_message(plaintext.as_bytes(), peer);
            let (ctype, ciphertext) = self.encryptor.encrypt(jid, &dsm).await?;
            needs_device_identity |= ctype == CiphertextType::PkMsg;
            me_recipients.push(EncryptedRecipient { jid: jid.clone(), ciphertext_type: ctype, ciphertext });
        }

        let mut other_recipients = Vec::new();
        for jid in &other_wire {
            let plaintext = message_for(&patched, message, jid);
            let (ctype, ciphertext) = self.encryptor.encrypt(jid, plaintext.as_bytes()).await?;
            needs_device_identity |= ctype == CiphertextType::PkMsg;
            other_recipients.push(EncryptedRecipient { jid: jid.clone(), ciphertext_type: ctype, ciphertext });
        }

        let stanza_opts = self.stanza_opts(opts, needs_device_identity);
        let node = stanza::build_direct_message(peer.clone(), message_id, me_recipients, other_recipients, &stanza_opts);
        Ok(PendingStanza { node, post_send: PostSend::None })
    }

    /// Group send: resolve the LID/PN-transformed participant set (plus
    /// the sender's own primary device), encrypt
    /// once via sender-key, fan out SKDM only to devices not already in
    /// sender-key-memory (or all devices under `compat_v6_group_send`),
    /// and mark sender-key-memory only once the send has committed.
    async fn build_group_stanza(
        &self,
        group: &Jid,
        message: &WireMessage,
        opts: &RelayOptions,
        message_id: &MessageId,
    ) -> Result<PendingStanza> {
        let metadata = self.groups.get_or_fetch(group, opts.cached_group_metadata.as_ref()).await?;

        let mut participant_jids = Vec::with_capacity(metadata.participants.len());
        for p in &metadata.participants {
            match metadata.addressing_mode {
                AddressingMode::Lid => {
                    let lid = match &p.lid {
                        Some(l) => l.clone(),
                        None => match self.identity.lid_for_pn(&p.id).await? {
                            Some(l) => l,
                            None => {
                                tracing::warn!(pn = %p.id, group = %group, "no LID mapping for LID-addressed participant, falling back to PN");
                                p.id.clone()
                            }
                        },
                    };
                    participant_jids.push(lid);
                }
                AddressingMode::Pn => participant_jids.push(p.id.clone()),
            }
        }

        let me_id = match metadata.addressing_mode {
            AddressingMode::Lid => self.me_lid.clone().unwrap_or_else(|| self.me.clone()),
            AddressingMode::Pn => self.me.clone(),
        };
        if !participant_jids.iter().any(|j| j.same_user(&me_id)) {
            participant_jids.push(me_id.clone());
        }

        let resolved = self.devices.resolve(&participant_jids, &ResolveOptions::default()).await?;
        let device_wire_jids: Vec<Jid> = resolved.into_iter().map(|d| d.jid).collect();

        let patched = self.resolve_message(message, Some(group));
        let plaintext = match &patched {
            PatchedMessage::Single(m) => m.as_bytes().to_vec(),
            PatchedMessage::PerRecipient(_) => {
                tracing::warn!(group = %group, "patch_message_before_sending returned per-recipient messages for a group send; the sender-key ciphertext is shared, falling back to the original message");
                message.as_bytes().to_vec()
            }
        };
        let group_result = self.encryptor.encrypt_group(group, &me_id, &plaintext).await?;

        let sender_key_memory = self.groups.sender_key_memory(group).await?;
        let skdm_targets: Vec<Jid> = if self.config.compat_v6_group_send {
            device_wire_jids.clone()
        } else {
            device_wire_jids
                .iter()
                .filter(|j| !sender_key_memory.contains(*j))
                .cloned()
                .collect()
        };

        let skdm_addrs: Vec<ProtocolAddress> = skdm_targets.iter().map(ProtocolAddress::from_jid).collect();
        self.sessions
            .assert_sessions_batched(
                &skdm_addrs,
                self.config.group_assert_chunk,
                Duration::from_millis(self.config.group_assert_delay_ms),
            )
            .await?;

        let mut needs_device_identity = false;
        let mut skdm_recipients = Vec::with_capacity(skdm_targets.len());
        for jid in &skdm_targets {
            let (ctype, ciphertext) = self.encryptor.encrypt(jid, &group_result.distribution_message).await?;
            needs_device_identity |= ctype == CiphertextType::PkMsg;
            skdm_recipients.push(SkdmRecipient { jid: jid.clone(), ciphertext_type: ctype, ciphertext });
        }

        let stanza_opts = self.stanza_opts(opts, needs_device_identity);
        let node = stanza::build_group_message(
            group.clone(),
            message_id,
            metadata.addressing_mode,
            &group_result.ciphertext,
            skdm_recipients,
            metadata.ephemeral_duration,
            &stanza_opts,
        );

        Ok(PendingStanza {
            node,
            post_send: PostSend::MarkGroupSent { group: group.clone(), wire_jids: skdm_targets },
        })
    }

    /// Status-broadcast send: same sender-key fan-out shape as a group,
    /// addressed to a caller-supplied recipient list instead of group
    /// membership, and never consulting
    /// [`crate::group::GroupState::get_or_fetch`].
    async fn build_status_stanza(
        &self,
        dest: &Jid,
        message: &WireMessage,
        opts: &RelayOptions,
        message_id: &MessageId,
    ) -> Result<PendingStanza> {
        let status_jids = opts.status_jid_list.clone().unwrap_or_default();
        let resolved = self.devices.resolve(&status_jids, &ResolveOptions::default()).await?;
        let device_wire_jids: Vec<Jid> = resolved.into_iter().map(|d| d.jid).collect();

        let patched = self.resolve_message(message, Some(dest));
        let plaintext = match &patched {
            PatchedMessage::Single(m) => m.as_bytes().to_vec(),
            PatchedMessage::PerRecipient(_) => {
                tracing::warn!(dest = %dest, "patch_message_before_sending returned per-recipient messages for a status send; falling back to the original message");
                message.as_bytes().to_vec()
            }
        };
        let group_result = self.encryptor.encrypt_group(dest, &self.me, &plaintext).await?;

        let sender_key_memory = self.groups.sender_key_memory(dest).await?;
        let skdm_targets: Vec<Jid> = if self.config.compat_v6_group_send {
            device_wire_jids.clone()
        } else {
            device_wire_jids
                .iter()
                .filter(|j| !sender_key_memory.contains(*j))
                .cloned()
                .collect()
        };

        let skdm_addrs: Vec<ProtocolAddress> = skdm_targets.iter().map(ProtocolAddress::from_jid).collect();
        self.sessions
            .assert_sessions_batched(
                &skdm_addrs,
                self.config.group_assert_chunk,
                Duration::from_millis(self.config.group_assert_delay_ms),
            )
            .await?;

        let mut needs_device_identity = false;
        let mut skdm_recipients = Vec::with_capacity(skdm_targets.len());
        for jid in &skdm_targets {
            let (ctype, ciphertext) = self.encryptor.encrypt(jid, &group_result.distribution_message).await?;
            needs_device_identity |= ctype == CiphertextType::PkMsg;
            skdm_recipients.push(SkdmRecipient { jid: jid.clone(), ciphertext_type: ctype, ciphertext });
        }

        let stanza_opts = self.stanza_opts(opts, needs_device_identity);
        let node = stanza::build_group_message(
            dest.clone(),
            message_id,
            AddressingMode::Pn,
            &group_result.ciphertext,
            skdm_recipients,
            None,
            &stanza_opts,
        );

        Ok(PendingStanza {
            node,
            post_send: PostSend::MarkGroupSent { group: dest.clone(), wire_jids: skdm_targets },
        })
    }

    /// Peer-data send: a single device-qualified wire JID, one inline
    /// `<enc>`, no `<participants>` wrapper.
    async fn build_peer_stanza(
        &self,
        dest: &Jid,
        message: &WireMessage,
        opts: &RelayOptions,
        message_id: &MessageId,
    ) -> Result<PendingStanza> {
        let addr = ProtocolAddress::from_jid(dest);
        self.sessions.assert_sessions(&[addr]).await?;

        let patched = self.resolve_message(message, Some(dest));
        let plaintext = message_for(&patched, message, dest);
        let (ctype, ciphertext) = self.encryptor.encrypt(dest, plaintext.as_bytes()).await?;
        let needs_device_identity = ctype == CiphertextType::PkMsg;

        let stanza_opts = self.stanza_opts(opts, needs_device_identity);
        let node = stanza::build_peer_message(dest.clone(), message_id, ctype, &ciphertext, &stanza_opts);
        Ok(PendingStanza { node, post_send: PostSend::None })
    }

    /// Retry-resend: encrypt pairwise exactly once to `retry.jid` and
    /// route per whether the destination is a group, self-device, or a
    /// plain peer. Always carries `device-identity`. Never touches group
    /// metadata or the self-push block of [`Self::build_group_stanza`] —
    /// the dispatch in [`Self::build_stanza`] routes retries here before
    /// either branch runs, which is how a self-push-on-retry bug is
    /// avoided structurally (see DESIGN.md).
    async fn build_retry_stanza(
        &self,
        dest: &Jid,
        message: &WireMessage,
        opts: &RelayOptions,
        message_id: &MessageId,
        retry: &RetryInput,
    ) -> Result<PendingStanza> {
        let group = if dest.is_group() { Some(dest.clone()) } else { None };

        let addr = ProtocolAddress::from_jid(&retry.jid);
        self.sessions.assert_sessions(&[addr]).await?;

        let patched = self.resolve_message(message, Some(&retry.jid));
        let plaintext = message_for(&patched, message, &retry.jid);
        let (ctype, ciphertext) = self.encryptor.encrypt(&retry.jid, plaintext.as_bytes()).await?;

        let stanza_opts = self.stanza_opts(opts, true);
        let participant = stanza::RetryParticipant { jid: retry.jid.clone(), count: retry.count, is_self: retry.is_self };
        let self_wire = self.me.with_device(self.me_device);
        let node = stanza::build_retry_resend_message(
            dest.clone(),
            &self_wire,
            group.as_ref(),
            message_id,
            &participant,
            ctype,
            &ciphertext,
            &stanza_opts,
        );

        Ok(PendingStanza { node, post_send: PostSend::None })
    }
}
