//! Encryptor: pairwise and group message encryption.

pub mod mutex;
pub mod ratchet;

pub use mutex::KeyedMutex;

use crate::error::SessionError;
use crate::session::ProtocolAddress;
use crate::types::Jid;
use crate::Result;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

/// The wire `type=` attribute on a pairwise `<enc>` node: `pkmsg` carries
/// the X3DH preamble for session establishment, `msg` is used for every
/// message after.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CiphertextType {
    Msg,
    PkMsg,
}

impl CiphertextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Msg => "msg",
            Self::PkMsg => "pkmsg",
        }
    }
}

/// Result of a group encrypt call: the SKMSG ciphertext plus the sender-key
/// distribution message to attach for any device that hasn't seen the
/// current chain.
pub struct GroupEncryptResult {
    pub ciphertext: Vec<u8>,
    pub distribution_message: Vec<u8>,
}

/// The actual Double Ratchet/X3DH math, modeled as an external
/// collaborator trait (key persistence is the caller's concern) — this
/// crate ships [`InMemorySignalRepository`], a real, self-contained
/// reference implementation over [`ratchet`].
#[async_trait]
pub trait SignalRepository: Send + Sync {
    async fn encrypt_pairwise(
        &self,
        addr: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<(CiphertextType, Vec<u8>)>;

    async fn decrypt_pairwise(
        &self,
        addr: &ProtocolAddress,
        ctype: CiphertextType,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    async fn encrypt_group(
        &self,
        group: &Jid,
        me: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<GroupEncryptResult>;

    async fn decrypt_group(
        &self,
        group: &Jid,
        sender: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;
}

fn aes_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(&(*key).into());
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| crate::Error::Session(SessionError::EncryptionFailed("aes-gcm".into(), e.to_string())))?;
    let mut out = nonce_bytes.to_vec();
    out.extend(ciphertext);
    Ok(out)
}

fn aes_decrypt(key: &[u8; 32], framed_ciphertext: &[u8]) -> Result<Vec<u8>> {
    if framed_ciphertext.len() < 12 {
        return Err(crate::Error::Session(SessionError::EncryptionFailed(
            "aes-gcm".into(),
            "ciphertext too short for nonce".into(),
        )));
    }
    let (nonce_bytes, ciphertext) = framed_ciphertext.split_at(12);
    let cipher = Aes256Gcm::new(&(*key).into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| crate::Error::Session(SessionError::EncryptionFailed("aes-gcm".into(), e.to_string())))
}

struct PairwiseRuntime {
    session: ratchet::RatchetSession,
    sent_first: bool,
}

struct SenderKeyRuntime {
    chain_key: [u8; 32],
    iteration: u32,
    signing_key: SigningKey,
}

impl SenderKeyRuntime {
    fn new() -> Self {
        let mut chain_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut chain_key);
        Self {
            chain_key,
            iteration: 0,
            signing_key: SigningKey::generate(&mut rand::thread_rng()),
        }
    }
}

fn encode_distribution(signing_public: &[u8; 32], chain_key: &[u8; 32], iteration: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 32 + 32);
    out.extend_from_slice(&iteration.to_be_bytes());
    out.extend_from_slice(chain_key);
    out.extend_from_slice(signing_public);
    out
}

fn decode_distribution(bytes: &[u8]) -> Option<(u32, [u8; 32], [u8; 32])> {
    if bytes.len() != 4 + 32 + 32 {
        return None;
    }
    let iteration = u32::from_be_bytes(bytes[..4].try_into().ok()?);
    let chain_key: [u8; 32] = bytes[4..36].try_into().ok()?;
    let signing_public: [u8; 32] = bytes[36..68].try_into().ok()?;
    Some((iteration, chain_key, signing_public))
}

/// In-memory reference [`SignalRepository`]: real X3DH/ratchet math, no
/// durable persistence. Sessions must be established out of band via
/// [`Self::install_outgoing`]/[`Self::install_incoming`] before
/// `encrypt_pairwise`/`decrypt_pairwise` will find them — that handshake is
/// [`crate::session::SessionGuard`]'s job in the full pipeline.
#[derive(Default)]
pub struct InMemorySignalRepository {
    pairwise: DashMap<ProtocolAddress, StdMutex<PairwiseRuntime>>,
    sender_keys: DashMap<String, StdMutex<SenderKeyRuntime>>,
    incoming_sender_keys: DashMap<(String, ProtocolAddress), StdMutex<(u32, [u8; 32], VerifyingKey)>>,
}

impl InMemorySignalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session as the initiator (X3DH against a fetched
    /// pre-key bundle). Mirrors [`ratchet::initiate_session`].
    pub fn install_outgoing(&self, addr: ProtocolAddress, session: ratchet::RatchetSession) {
        self.pairwise.insert(
            addr,
            StdMutex::new(PairwiseRuntime {
                session,
                sent_first: false,
            }),
        );
    }

    /// Install a session as the receiver of a `pkmsg`. Mirrors
    /// [`ratchet::accept_session`].
    pub fn install_incoming(&self, addr: ProtocolAddress, session: ratchet::RatchetSession) {
        self.pairwise.insert(
            addr,
            StdMutex::new(PairwiseRuntime {
                session,
                sent_first: true,
            }),
        );
    }

    /// Register a sender key this repository received via SKDM, so
    /// `decrypt_group` can follow the chain forward.
    pub fn install_incoming_sender_key(&self, group: &Jid, sender: ProtocolAddress, distribution: &[u8]) -> bool {
        match decode_distribution(distribution) {
            Some((iteration, chain_key, signing_public_bytes)) => {
                let Ok(signing_public) = VerifyingKey::from_bytes(&signing_public_bytes) else {
                    return false;
                };
                self.incoming_sender_keys.insert(
                    (group.to_string(), sender),
                    StdMutex::new((iteration, chain_key, signing_public)),
                );
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SignalRepository for InMemorySignalRepository {
    async fn encrypt_pairwise(
        &self,
        addr: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<(CiphertextType, Vec<u8>)> {
        let entry = self
            .pairwise
            .get(addr)
            .ok_or_else(|| crate::Error::Session(SessionError::NoPreKeyBundle(addr.user.clone())))?;
        let mut state = entry.lock().expect("pairwise runtime lock poisoned");
        let was_first = !state.sent_first;
        let (message_key, _counter) = ratchet::step_send(&mut state.session);
        let ciphertext = aes_encrypt(&message_key, plaintext)?;
        state.sent_first = true;
        Ok((
            if was_first {
                CiphertextType::PkMsg
            } else {
                CiphertextType::Msg
            },
            ciphertext,
        ))
    }

    async fn decrypt_pairwise(
        &self,
        addr: &ProtocolAddress,
        _ctype: CiphertextType,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let entry = self
            .pairwise
            .get(addr)
            .ok_or_else(|| crate::Error::Session(SessionError::NoPreKeyBundle(addr.user.clone())))?;
        let mut state = entry.lock().expect("pairwise runtime lock poisoned");
        let counter = state.session.recv_counter;
        let message_key = ratchet::step_recv(&mut state.session, counter).ok_or_else(|| {
            crate::Error::Session(SessionError::EncryptionFailed(
                addr.user.clone(),
                "out-of-order message".into(),
            ))
        })?;
        aes_decrypt(&message_key, ciphertext)
    }

    async fn encrypt_group(
        &self,
        group: &Jid,
        _me: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<GroupEncryptResult> {
        let entry = self
            .sender_keys
            .entry(group.to_string())
            .or_insert_with(|| StdMutex::new(SenderKeyRuntime::new()));
        let mut state = entry.lock().expect("sender key runtime lock poisoned");

        let distribution = encode_distribution(
            state.signing_key.verifying_key().as_bytes(),
            &state.chain_key,
            state.iteration,
        );

        let (message_key, next_chain_key) = ratchet::derive_message_key(&state.chain_key);
        let signature = state.signing_key.sign(plaintext);

        let mut payload = Vec::with_capacity(4 + plaintext.len() + 64);
        payload.extend_from_slice(&state.iteration.to_be_bytes());
        payload.extend_from_slice(plaintext);
        payload.extend_from_slice(&signature.to_bytes());
        let ciphertext = aes_encrypt(&message_key, &payload)?;

        state.chain_key = next_chain_key;
        state.iteration += 1;

        Ok(GroupEncryptResult {
            ciphertext,
            distribution_message: distribution,
        })
    }

    async fn decrypt_group(
        &self,
        group: &Jid,
        sender: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let key = (group.to_string(), sender.clone());
        let entry = self.incoming_sender_keys.get(&key).ok_or_else(|| {
            crate::Error::Group(crate::error::GroupError::NotFound(group.to_string()))
        })?;
        let mut state = entry.lock().expect("incoming sender key lock poisoned");
        let (iteration, chain_key, signing_public) = (state.0, state.1, state.2.clone());
        let (message_key, next_chain_key) = ratchet::derive_message_key(&chain_key);
        let payload = aes_decrypt(&message_key, ciphertext)?;

        if payload.len() < 4 + 64 {
            return Err(crate::Error::Session(SessionError::EncryptionFailed(
                sender.user.clone(),
                "truncated group payload".into(),
            )));
        }
        let payload_iteration = u32::from_be_bytes(payload[..4].try_into().unwrap());
        if payload_iteration != iteration {
            return Err(crate::Error::Session(SessionError::EncryptionFailed(
                sender.user.clone(),
                "sender key iteration mismatch".into(),
            )));
        }
        let body_end = payload.len() - 64;
        let body = &payload[4..body_end];
        let sig_bytes: [u8; 64] = payload[body_end..].try_into().unwrap();
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        signing_public.verify(body, &signature).map_err(|_| {
            crate::Error::Session(SessionError::EncryptionFailed(
                sender.user.clone(),
                "sender key signature verification failed".into(),
            ))
        })?;

        *state = (iteration + 1, next_chain_key, signing_public);
        Ok(body.to_vec())
    }
}

/// Encrypts outbound plaintext, serializing concurrent pairwise encrypts
/// to the same peer through [`KeyedMutex`] — except under
/// `compat_v6_group_send`, which bypasses the mutex entirely.
pub struct Encryptor<R: SignalRepository> {
    repo: Arc<R>,
    mutex: KeyedMutex<String>,
    compat_v6_group_send: bool,
}

impl<R: SignalRepository> Encryptor<R> {
    pub fn new(repo: Arc<R>, compat_v6_group_send: bool) -> Self {
        Self {
            repo,
            mutex: KeyedMutex::new(),
            compat_v6_group_send,
        }
    }

    pub async fn encrypt(&self, wire_jid: &Jid, plaintext: &[u8]) -> Result<(CiphertextType, Vec<u8>)> {
        let addr = ProtocolAddress::from_jid(wire_jid);
        if self.compat_v6_group_send {
            return self.repo.encrypt_pairwise(&addr, plaintext).await;
        }
        let repo = Arc::clone(&self.repo);
        let plaintext = plaintext.to_vec();
        self.mutex
            .with_lock(&wire_jid.to_string(), move || async move {
                repo.encrypt_pairwise(&addr, &plaintext).await
            })
            .await
    }

    pub async fn encrypt_group(&self, group_jid: &Jid, me: &Jid, plaintext: &[u8]) -> Result<GroupEncryptResult> {
        let me_addr = ProtocolAddress::from_jid(me);
        self.repo.encrypt_group(group_jid, &me_addr, plaintext).await
    }

    /// Thin wrapper over [`SignalRepository::decrypt_pairwise`], included
    /// for ratchet test verification; the relay pipeline itself never
    /// calls it.
    pub async fn decrypt(&self, wire_jid: &Jid, ctype: CiphertextType, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let addr = ProtocolAddress::from_jid(wire_jid);
        self.repo.decrypt_pairwise(&addr, ctype, ciphertext).await
    }

    /// Thin wrapper over [`SignalRepository::decrypt_group`] (see
    /// [`Self::decrypt`]).
    pub async fn decrypt_group(&self, group_jid: &Jid, sender: &Jid, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let addr = ProtocolAddress::from_jid(sender);
        self.repo.decrypt_group(group_jid, &addr, ciphertext).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_USER_SERVER;

    fn established_pair() -> (Arc<InMemorySignalRepository>, ProtocolAddress, ProtocolAddress) {
        let alice_identity = ratchet::KeyPair::generate();
        let bob_identity = ratchet::KeyPair::generate();
        let bob_signed_prekey = ratchet::KeyPair::generate();
        let bob_one_time_prekey = ratchet::KeyPair::generate();

        let bundle = ratchet::RemoteBundle {
            identity_public: bob_identity.public,
            signed_prekey_public: bob_signed_prekey.public,
            one_time_prekey_public: Some(bob_one_time_prekey.public),
        };
        let (alice_session, alice_ephemeral_public) = ratchet::initiate_session(&alice_identity, &bundle);
        let bob_session = ratchet::accept_session(
            &bob_identity,
            &bob_signed_prekey,
            Some(&bob_one_time_prekey),
            &alice_identity.public,
            &alice_ephemeral_public,
        );

        let alice_addr = ProtocolAddress {
            user: "alice".into(),
            device: 0,
        };
        let bob_addr = ProtocolAddress {
            user: "bob".into(),
            device: 0,
        };

        let repo = Arc::new(InMemorySignalRepository::new());
        repo.install_outgoing(bob_addr.clone(), alice_session);
        repo.install_incoming(alice_addr.clone(), bob_session);
        (repo, alice_addr, bob_addr)
    }

    #[tokio::test]
    async fn pairwise_encrypt_decrypt_roundtrip() {
        let (repo, alice_addr, bob_addr) = established_pair();
        let encryptor = Encryptor::new(Arc::clone(&repo), false);

        let bob_jid = Jid::new(&bob_addr.user, DEFAULT_USER_SERVER);
        let (ctype, ciphertext) = encryptor.encrypt(&bob_jid, b"hello bob").await.unwrap();
        assert_eq!(ctype, CiphertextType::PkMsg);

        let alice_jid = Jid::new(&alice_addr.user, DEFAULT_USER_SERVER);
        let plaintext = encryptor.decrypt(&alice_jid, ctype, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"hello bob");

        let (ctype2, ciphertext2) = encryptor.encrypt(&bob_jid, b"second message").await.unwrap();
        assert_eq!(ctype2, CiphertextType::Msg);
        let plaintext2 = encryptor.decrypt(&alice_jid, ctype2, &ciphertext2).await.unwrap();
        assert_eq!(plaintext2, b"second message");
    }

    #[tokio::test]
    async fn group_encrypt_decrypt_roundtrip() {
        let repo = Arc::new(InMemorySignalRepository::new());
        let encryptor = Encryptor::new(Arc::clone(&repo), false);
        let group = Jid::new("g1", crate::types::GROUP_SERVER);
        let me = Jid::new("alice", DEFAULT_USER_SERVER);

        let result = encryptor.encrypt_group(&group, &me, b"hello group").await.unwrap();

        let me_addr = ProtocolAddress::from_jid(&me);
        repo.install_incoming_sender_key(&group, me_addr.clone(), &result.distribution_message);

        let plaintext = encryptor
            .decrypt_group(&group, &me, &result.ciphertext)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello group");
    }

    #[tokio::test]
    async fn compat_v6_bypasses_mutex_without_erroring() {
        let (repo, _alice_addr, bob_addr) = established_pair();
        let encryptor = Encryptor::new(Arc::clone(&repo), true);
        let bob_jid = Jid::new(&bob_addr.user, DEFAULT_USER_SERVER);
        let (ctype, _ct) = encryptor.encrypt(&bob_jid, b"hi").await.unwrap();
        assert_eq!(ctype, CiphertextType::PkMsg);
    }
}
