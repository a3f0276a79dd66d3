//! On-the-wire and on-disk encoding of an LXMF message, plus the
//! propagation/paper encryption envelopes used to hand a message to a
//! party we have no direct path to.

use crate::error::LxmfError;
use crate::payload::Payload;
use base64::Engine;
use ed25519_dalek::Signature;
use rand_core::CryptoRngCore;
use reticulum::crypt::fernet::{Fernet, PlainText, FERNET_MAX_PADDING_SIZE, FERNET_OVERHEAD_SIZE};
use reticulum::identity::{DerivedKey, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;
pub const LXM_URI_PREFIX: &str = "lxm://";
const STORAGE_MAGIC: &[u8; 8] = b"MESHLXM0";
const STORAGE_VERSION: u8 = 1;
const STORAGE_FLAG_HAS_SIGNATURE: u8 = 0x01;

/// The packed, signable, transmittable form of an LXMF message.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub destination: [u8; 16],
    pub source: [u8; 16],
    pub signature: Option<[u8; SIGNATURE_LENGTH]>,
    pub payload: Payload,
}

impl WireMessage {
    pub fn new(destination: [u8; 16], source: [u8; 16], payload: Payload) -> Self {
        Self { destination, source, signature: None, payload }
    }

    /// Content-addressed 32-byte identifier, fixed once computed.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.destination);
        hasher.update(self.source);
        hasher.update(self.payload.to_msgpack().unwrap_or_default());
        let bytes = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        out
    }

    fn signed_material(&self) -> Result<Vec<u8>, LxmfError> {
        let payload = self.payload.to_msgpack()?;
        let mut data = Vec::with_capacity(16 + 16 + payload.len() + 32);
        data.extend_from_slice(&self.destination);
        data.extend_from_slice(&self.source);
        data.extend_from_slice(&payload);
        data.extend_from_slice(&self.hash());
        Ok(data)
    }

    pub fn sign(&mut self, signer: &PrivateIdentity) -> Result<(), LxmfError> {
        let data = self.signed_material()?;
        let signature = signer.sign(&data);
        self.signature = Some(signature.to_bytes());
        Ok(())
    }

    pub fn verify(&self, identity: &Identity) -> Result<bool, LxmfError> {
        let Some(sig_bytes) = self.signature else {
            return Ok(false);
        };
        let signature = Signature::from_slice(&sig_bytes).map_err(|e| LxmfError::Decode(e.to_string()))?;
        let data = self.signed_material()?;
        Ok(identity.verify(&data, &signature).is_ok())
    }

    pub fn pack(&self) -> Result<Vec<u8>, LxmfError> {
        let signature = self.signature.ok_or_else(|| LxmfError::Encode("missing signature".into()))?;
        let mut out = Vec::new();
        out.extend_from_slice(&self.destination);
        out.extend_from_slice(&self.source);
        out.extend_from_slice(&signature);
        out.extend_from_slice(&self.payload.to_msgpack()?);
        Ok(out)
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, LxmfError> {
        let min_len = 16 + 16 + SIGNATURE_LENGTH;
        if bytes.len() < min_len {
            return Err(LxmfError::Decode("wire message too short".into()));
        }
        let mut dest = [0u8; 16];
        let mut src = [0u8; 16];
        let mut signature = [0u8; SIGNATURE_LENGTH];
        dest.copy_from_slice(&bytes[0..16]);
        src.copy_from_slice(&bytes[16..32]);
        signature.copy_from_slice(&bytes[32..32 + SIGNATURE_LENGTH]);
        let payload = Payload::from_msgpack(&bytes[32 + SIGNATURE_LENGTH..])?;
        Ok(Self { destination: dest, source: src, signature: Some(signature), payload })
    }

    /// Storage form: same as `pack` but tolerates an absent signature (a
    /// message saved before signing, e.g. while still `Generating`).
    pub fn pack_storage(&self) -> Result<Vec<u8>, LxmfError> {
        let payload = self.payload.to_msgpack()?;
        let mut out = Vec::with_capacity(STORAGE_MAGIC.len() + 2 + 32 + SIGNATURE_LENGTH + payload.len());
        out.extend_from_slice(STORAGE_MAGIC);
        out.push(STORAGE_VERSION);
        let mut flags = 0u8;
        if self.signature.is_some() {
            flags |= STORAGE_FLAG_HAS_SIGNATURE;
        }
        out.push(flags);
        out.extend_from_slice(&self.destination);
        out.extend_from_slice(&self.source);
        if let Some(signature) = self.signature {
            out.extend_from_slice(&signature);
        }
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn unpack_storage(bytes: &[u8]) -> Result<Self, LxmfError> {
        if !bytes.starts_with(STORAGE_MAGIC) {
            return Self::unpack(bytes);
        }
        let magic_len = STORAGE_MAGIC.len();
        if bytes.len() < magic_len + 2 + 32 {
            return Err(LxmfError::Decode("storage message too short".into()));
        }
        let version = bytes[magic_len];
        if version != STORAGE_VERSION {
            return Err(LxmfError::Decode("unsupported storage version".into()));
        }
        let flags = bytes[magic_len + 1];
        let mut idx = magic_len + 2;
        let mut dest = [0u8; 16];
        let mut src = [0u8; 16];
        dest.copy_from_slice(&bytes[idx..idx + 16]);
        idx += 16;
        src.copy_from_slice(&bytes[idx..idx + 16]);
        idx += 16;
        let signature = if flags & STORAGE_FLAG_HAS_SIGNATURE != 0 {
            if bytes.len() < idx + SIGNATURE_LENGTH {
                return Err(LxmfError::Decode("storage signature missing".into()));
            }
            let mut sig = [0u8; SIGNATURE_LENGTH];
            sig.copy_from_slice(&bytes[idx..idx + SIGNATURE_LENGTH]);
            idx += SIGNATURE_LENGTH;
            Some(sig)
        } else {
            None
        };
        let payload = Payload::from_msgpack(&bytes[idx..])?;
        Ok(Self { destination: dest, source: src, signature, payload })
    }

    /// Encrypts the packed message for `destination` and wraps it in the
    /// propagation-node sync envelope: `(timestamp, [encrypted_lxmf_data])`.
    pub fn pack_propagation_with_rng<R: CryptoRngCore + Copy>(
        &self,
        destination: &Identity,
        timestamp: f64,
        rng: R,
    ) -> Result<Vec<u8>, LxmfError> {
        let packed = self.pack()?;
        let encrypted = encrypt_for_identity(destination, &packed[16..], rng)?;
        let mut lxmf_data = Vec::with_capacity(16 + encrypted.len());
        lxmf_data.extend_from_slice(&packed[..16]);
        lxmf_data.extend_from_slice(&encrypted);
        let envelope = (timestamp, vec![serde_bytes::ByteBuf::from(lxmf_data)]);
        rmp_serde::to_vec(&envelope).map_err(|e| LxmfError::Encode(e.to_string()))
    }

    /// Encrypts the packed message for `destination`, for offline ("paper")
    /// hand-off. Unlike the propagation envelope this is the raw
    /// `destination || encrypted` bytes with no timestamp wrapper.
    pub fn pack_paper_with_rng<R: CryptoRngCore + Copy>(&self, destination: &Identity, rng: R) -> Result<Vec<u8>, LxmfError> {
        let packed = self.pack()?;
        let encrypted = encrypt_for_identity(destination, &packed[16..], rng)?;
        let mut out = Vec::with_capacity(16 + encrypted.len());
        out.extend_from_slice(&packed[..16]);
        out.extend_from_slice(&encrypted);
        Ok(out)
    }

    pub fn pack_paper_uri_with_rng<R: CryptoRngCore + Copy>(&self, destination: &Identity, rng: R) -> Result<String, LxmfError> {
        let packed = self.pack_paper_with_rng(destination, rng)?;
        Ok(Self::encode_lxm_uri(&packed))
    }

    pub fn encode_lxm_uri(paper_bytes: &[u8]) -> String {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(paper_bytes);
        format!("{LXM_URI_PREFIX}{encoded}")
    }

    pub fn decode_lxm_uri(uri: &str) -> Result<Vec<u8>, LxmfError> {
        let encoded = uri.strip_prefix(LXM_URI_PREFIX).ok_or_else(|| LxmfError::Decode("invalid lxm uri prefix".into()))?;
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(encoded))
            .map_err(|e| LxmfError::Decode(format!("invalid lxm uri payload: {e}")))
    }
}

/// Tag prefixing an enveloped inbound datagram on the `lxmf.delivery`
/// aspect: either an ordinary message or a [`DeliveryProof`] confirming one.
const ENVELOPE_TAG_MESSAGE: u8 = 0x00;
const ENVELOPE_TAG_PROOF: u8 = 0x01;

/// Signed acknowledgement that `message_hash` reached its destination,
/// returned to the sender over the same direct path the message arrived on.
#[derive(Debug, Clone)]
pub struct DeliveryProof {
    pub message_hash: [u8; 32],
    pub source: [u8; 16],
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl DeliveryProof {
    pub fn new(message_hash: [u8; 32], source: [u8; 16], signer: &PrivateIdentity) -> Self {
        let signature = signer.sign(&message_hash).to_bytes();
        Self { message_hash, source, signature }
    }

    pub fn verify(&self, identity: &Identity) -> bool {
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        identity.verify(&self.message_hash, &signature).is_ok()
    }

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 16 + SIGNATURE_LENGTH);
        out.extend_from_slice(&self.message_hash);
        out.extend_from_slice(&self.source);
        out.extend_from_slice(&self.signature);
        out
    }

    fn unpack(bytes: &[u8]) -> Result<Self, LxmfError> {
        if bytes.len() != 32 + 16 + SIGNATURE_LENGTH {
            return Err(LxmfError::Decode("delivery proof malformed".into()));
        }
        let mut message_hash = [0u8; 32];
        let mut source = [0u8; 16];
        let mut signature = [0u8; SIGNATURE_LENGTH];
        message_hash.copy_from_slice(&bytes[0..32]);
        source.copy_from_slice(&bytes[32..48]);
        signature.copy_from_slice(&bytes[48..48 + SIGNATURE_LENGTH]);
        Ok(Self { message_hash, source, signature })
    }
}

/// Either side of what can arrive on the `lxmf.delivery` aspect.
pub enum InboundEnvelope {
    Message(WireMessage),
    Proof(DeliveryProof),
}

impl WireMessage {
    /// Packs for direct transmission, tagged so the receiver's
    /// [`decode_envelope`] can tell it apart from a [`DeliveryProof`].
    pub fn pack_envelope(&self) -> Result<Vec<u8>, LxmfError> {
        let mut out = vec![ENVELOPE_TAG_MESSAGE];
        out.extend_from_slice(&self.pack()?);
        Ok(out)
    }
}

impl DeliveryProof {
    pub fn pack_envelope(&self) -> Vec<u8> {
        let mut out = vec![ENVELOPE_TAG_PROOF];
        out.extend_from_slice(&self.pack());
        out
    }
}

/// Reads the envelope tag and dispatches to the matching unpack routine.
pub fn decode_envelope(raw: &[u8]) -> Result<InboundEnvelope, LxmfError> {
    let (tag, rest) = raw.split_first().ok_or_else(|| LxmfError::Decode("empty envelope".into()))?;
    match *tag {
        ENVELOPE_TAG_MESSAGE => Ok(InboundEnvelope::Message(WireMessage::unpack(rest)?)),
        ENVELOPE_TAG_PROOF => Ok(InboundEnvelope::Proof(DeliveryProof::unpack(rest)?)),
        other => Err(LxmfError::Decode(format!("unknown envelope tag {other}"))),
    }
}

fn encrypt_for_identity<R: CryptoRngCore + Copy>(destination: &Identity, plaintext: &[u8], rng: R) -> Result<Vec<u8>, LxmfError> {
    let secret = EphemeralSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&destination.public_key);
    let derived = DerivedKey::new(&shared, Some(destination.address_hash.as_slice()));
    let key_bytes = derived.as_bytes();
    let split = key_bytes.len() / 2;

    let fernet = Fernet::new_from_slices(&key_bytes[..split], &key_bytes[split..], rng);
    let token_capacity = plaintext.len() + FERNET_OVERHEAD_SIZE + FERNET_MAX_PADDING_SIZE;
    let mut out = vec![0u8; PUBLIC_KEY_LENGTH + token_capacity];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    let token = fernet
        .encrypt(PlainText::from(plaintext), &mut out[PUBLIC_KEY_LENGTH..])
        .map_err(|e| LxmfError::Encode(format!("{e:?}")))?;
    let total = PUBLIC_KEY_LENGTH + token.len();
    out.truncate(total);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    fn sample() -> WireMessage {
        let payload = Payload::new(1700000000.0, b"hello mesh".to_vec(), b"greeting".to_vec(), None);
        WireMessage::new([0x11; 16], [0x22; 16], payload)
    }

    #[test]
    fn hash_is_stable_across_clones() {
        let a = sample();
        let b = a.clone();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let identity = PrivateIdentity::new_from_rand(rand_core::OsRng);
        let mut msg = sample();
        msg.sign(&identity).unwrap();
        assert!(msg.verify(identity.as_identity()).unwrap());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let identity = PrivateIdentity::new_from_rand(rand_core::OsRng);
        let mut msg = sample();
        msg.sign(&identity).unwrap();
        msg.payload.content = b"tampered".to_vec();
        assert!(!msg.verify(identity.as_identity()).unwrap());
    }

    #[test]
    fn pack_unpack_round_trip() {
        let identity = PrivateIdentity::new_from_rand(rand_core::OsRng);
        let mut msg = sample();
        msg.sign(&identity).unwrap();
        let packed = msg.pack().unwrap();
        let unpacked = WireMessage::unpack(&packed).unwrap();
        assert_eq!(unpacked.destination, msg.destination);
        assert_eq!(unpacked.source, msg.source);
        assert_eq!(unpacked.payload, msg.payload);
    }

    #[test]
    fn storage_round_trip_without_signature() {
        let msg = sample();
        let packed = msg.pack_storage().unwrap();
        let unpacked = WireMessage::unpack_storage(&packed).unwrap();
        assert_eq!(unpacked.destination, msg.destination);
        assert!(unpacked.signature.is_none());
    }

    #[test]
    fn lxm_uri_round_trips() {
        let bytes = vec![1, 2, 3, 4, 5];
        let uri = WireMessage::encode_lxm_uri(&bytes);
        assert!(uri.starts_with(LXM_URI_PREFIX));
        assert_eq!(WireMessage::decode_lxm_uri(&uri).unwrap(), bytes);
    }

    #[test]
    fn decode_lxm_uri_rejects_bad_prefix() {
        assert!(WireMessage::decode_lxm_uri("not-an-lxm-uri").is_err());
    }

    #[test]
    fn message_envelope_round_trips() {
        let identity = PrivateIdentity::new_from_rand(rand_core::OsRng);
        let mut msg = sample();
        msg.sign(&identity).unwrap();
        let enveloped = msg.pack_envelope().unwrap();
        match decode_envelope(&enveloped).unwrap() {
            InboundEnvelope::Message(unpacked) => assert_eq!(unpacked.destination, msg.destination),
            InboundEnvelope::Proof(_) => panic!("expected a message envelope"),
        }
    }

    #[test]
    fn proof_envelope_round_trips_and_verifies() {
        let identity = PrivateIdentity::new_from_rand(rand_core::OsRng);
        let proof = DeliveryProof::new([0x42; 32], [0x11; 16], &identity);
        let enveloped = proof.pack_envelope();
        match decode_envelope(&enveloped).unwrap() {
            InboundEnvelope::Proof(unpacked) => {
                assert_eq!(unpacked.message_hash, [0x42; 32]);
                assert!(unpacked.verify(identity.as_identity()));
            }
            InboundEnvelope::Message(_) => panic!("expected a proof envelope"),
        }
    }

    #[test]
    fn tampered_proof_fails_verification() {
        let identity = PrivateIdentity::new_from_rand(rand_core::OsRng);
        let mut proof = DeliveryProof::new([0x42; 32], [0x11; 16], &identity);
        proof.message_hash = [0x99; 32];
        assert!(!proof.verify(identity.as_identity()));
    }
}
