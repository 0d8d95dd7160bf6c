//! Self-contained reference Double-Ratchet/X3DH-style session math.
//!
//! Persistence and the full Signal protocol surface (out-of-order message
//! handling, session archiving, many-to-many fan-out optimizations) are an
//! external collaborator concern; this module exists so the crate is
//! runnable standalone, grounded on the
//! corpus's own hand-rolled signal-session sketch (3-DH shared secret,
//! HMAC chain-key advance) rather than depending on a full
//! `libsignal-protocol` crate, matching how this crate ships its own
//! Noise/pairing crypto instead of an external protocol dependency.
//!
//! Limitation: this reference ratchet only advances the sending/receiving
//! chain in strict order (no skipped-message key storage), which is
//! sufficient for the relay's own round-trip tests but not a drop-in
//! libsignal replacement.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

/// A long-term or signed-prekey X25519 keypair.
#[derive(Clone)]
pub struct KeyPair {
    pub public: [u8; 32],
    pub private: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret).to_bytes();
        Self {
            public,
            private: seed,
        }
    }

    fn dh(private: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(*private);
        secret.diffie_hellman(&PublicKey::from(*public)).to_bytes()
    }
}

/// The public half of a pre-key bundle, used to initiate a session as the
/// sender.
pub struct RemoteBundle {
    pub identity_public: [u8; 32],
    pub signed_prekey_public: [u8; 32],
    pub one_time_prekey_public: Option<[u8; 32]>,
}

/// HKDF-like extract-and-expand over HMAC-SHA256 (RFC 5869 shape), used to
/// turn the concatenated X3DH DH outputs into a root key and chain key.
fn hkdf(ikm: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let mut extract = HmacSha256::new_from_slice(&[0u8; 32]).expect("static key length");
    extract.update(ikm);
    let prk = extract.finalize().into_bytes();

    let mut okm = Vec::with_capacity(out_len);
    let mut t = Vec::new();
    let mut counter: u8 = 1;
    while okm.len() < out_len {
        let mut expand = HmacSha256::new_from_slice(&prk).expect("prk length");
        expand.update(&t);
        expand.update(info);
        expand.update(&[counter]);
        t = expand.finalize().into_bytes().to_vec();
        okm.extend_from_slice(&t);
        counter += 1;
    }
    okm.truncate(out_len);
    okm
}

fn split_root_and_chain(material: &[u8]) -> ([u8; 32], [u8; 32]) {
    let okm = hkdf(material, b"wa-relay-core ratchet init", 64);
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    (root, chain)
}

/// Advance a chain key one step, deriving the message key used at this
/// step (Signal's `HMAC(chain_key, 0x01)` / `HMAC(chain_key, 0x02)` split).
/// Shared by pairwise sessions and the group sender-key chain in
/// [`crate::crypto`].
pub(crate) fn derive_message_key(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mk_mac = HmacSha256::new_from_slice(chain_key).expect("chain key length");
    mk_mac.update(&[0x01]);
    let message_key = mk_mac.finalize().into_bytes();

    let mut ck_mac = HmacSha256::new_from_slice(chain_key).expect("chain key length");
    ck_mac.update(&[0x02]);
    let next_chain_key = ck_mac.finalize().into_bytes();

    let mut mk = [0u8; 32];
    let mut nck = [0u8; 32];
    mk.copy_from_slice(&message_key);
    nck.copy_from_slice(&next_chain_key);
    (mk, nck)
}

/// An established pairwise ratchet session.
pub struct RatchetSession {
    #[allow(dead_code)]
    root_key: [u8; 32],
    send_chain_key: [u8; 32],
    recv_chain_key: [u8; 32],
    pub send_counter: u32,
    pub recv_counter: u32,
}

/// Initiate a session as the sender (X3DH): combines our identity key, a
/// fresh ephemeral key, and the peer's pre-key bundle into
/// a shared root/chain key pair. Returns the session plus our ephemeral
/// public key, which must accompany the first (`pkmsg`) ciphertext.
pub fn initiate_session(my_identity: &KeyPair, their_bundle: &RemoteBundle) -> (RatchetSession, [u8; 32]) {
    let ephemeral = KeyPair::generate();

    let dh1 = KeyPair::dh(&my_identity.private, &their_bundle.signed_prekey_public);
    let dh2 = KeyPair::dh(&ephemeral.private, &their_bundle.identity_public);
    let dh3 = KeyPair::dh(&ephemeral.private, &their_bundle.signed_prekey_public);
    let dh4 = their_bundle
        .one_time_prekey_public
        .map(|opk| KeyPair::dh(&ephemeral.private, &opk));

    let mut material = Vec::with_capacity(32 * 4);
    material.extend_from_slice(&dh1);
    material.extend_from_slice(&dh2);
    material.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        material.extend_from_slice(&dh4);
    }

    let (root_key, chain_key) = split_root_and_chain(&material);
    (
        RatchetSession {
            root_key,
            send_chain_key: chain_key,
            recv_chain_key: chain_key,
            send_counter: 0,
            recv_counter: 0,
        },
        ephemeral.public,
    )
}

/// Accept a session as the receiver of a `pkmsg`, given our own identity
/// key, signed-prekey keypair, the one-time prekey used (if any), and the
/// sender's identity/ephemeral public keys. Produces the same root/chain
/// key pair `initiate_session` derived.
pub fn accept_session(
    my_identity: &KeyPair,
    my_signed_prekey: &KeyPair,
    my_one_time_prekey: Option<&KeyPair>,
    their_identity_public: &[u8; 32],
    their_ephemeral_public: &[u8; 32],
) -> RatchetSession {
    let dh1 = KeyPair::dh(&my_signed_prekey.private, their_identity_public);
    let dh2 = KeyPair::dh(&my_identity.private, their_ephemeral_public);
    let dh3 = KeyPair::dh(&my_signed_prekey.private, their_ephemeral_public);
    let dh4 = my_one_time_prekey.map(|opk| KeyPair::dh(&opk.private, their_ephemeral_public));

    let mut material = Vec::with_capacity(32 * 4);
    material.extend_from_slice(&dh1);
    material.extend_from_slice(&dh2);
    material.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        material.extend_from_slice(&dh4);
    }

    let (root_key, chain_key) = split_root_and_chain(&material);
    RatchetSession {
        root_key,
        send_chain_key: chain_key,
        recv_chain_key: chain_key,
        send_counter: 0,
        recv_counter: 0,
    }
}

/// Derive the next sending message key and advance the send chain.
pub fn step_send(session: &mut RatchetSession) -> ([u8; 32], u32) {
    let (message_key, next_chain_key) = derive_message_key(&session.send_chain_key);
    session.send_chain_key = next_chain_key;
    let counter = session.send_counter;
    session.send_counter += 1;
    (message_key, counter)
}

/// Derive the next receiving message key and advance the receive chain.
/// Strict-order only: `expected_counter` must equal the session's current
/// `recv_counter`.
pub fn step_recv(session: &mut RatchetSession, expected_counter: u32) -> Option<[u8; 32]> {
    if expected_counter != session.recv_counter {
        return None;
    }
    let (message_key, next_chain_key) = derive_message_key(&session.recv_chain_key);
    session.recv_chain_key = next_chain_key;
    session.recv_counter += 1;
    Some(message_key)
}
