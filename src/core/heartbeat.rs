//! Heartbeats: signed attestations that a node advanced its VDF.
//!
//! Each node maintains its own heartbeat chain; `prev_heartbeat` names the
//! node's previous heartbeat or the zero hash at the chain's genesis. The
//! chain link is what makes heartbeats replay-proof.

use crate::core::codec::{Decodable, Encodable, Reader, Writer};
use crate::core::crypto::{sha256, verify_signature, KeyStore, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::core::errors::{DecodeError, MontanaError, MontanaResult};
use crate::core::types::{Address, Hash};
use crate::core::vdf::{self, VdfProof, VdfStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Producing node's address.
    pub node_id: Address,
    /// Producer public key, carried so verification needs no account lookup.
    pub public_key: Vec<u8>,
    /// Previous heartbeat by the same node, or zero at chain genesis.
    pub prev_heartbeat: Hash,
    /// Input the node's VDF run was seeded from.
    pub vdf_input: Hash,
    /// Chain state the node attests to.
    pub vdf_output: Hash,
    /// Cumulative iterations of the run.
    pub vdf_iterations: u64,
    /// Encoded segment proof ending at `vdf_output`.
    pub vdf_proof: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Heartbeat {
    /// Build and sign a heartbeat from the current VDF status.
    pub fn create(keys: &dyn KeyStore, prev_heartbeat: Hash, vdf: &VdfStatus) -> Option<Self> {
        let checkpoint = vdf.last_checkpoint.as_ref()?;
        let mut hb = Heartbeat {
            node_id: keys.address(),
            public_key: keys.public_key_bytes().to_vec(),
            prev_heartbeat,
            vdf_input: vdf.input,
            vdf_output: checkpoint.output,
            vdf_iterations: checkpoint.total_iterations,
            vdf_proof: checkpoint.proof.encode(),
            signature: Vec::new(),
        };
        hb.signature = keys.sign(&hb.signing_bytes());
        Some(hb)
    }

    /// Canonical encoding of every field except the signature. This is
    /// both the signed preimage and the hash preimage.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_raw(self.node_id.as_bytes());
        w.put_bytes(&self.public_key);
        w.put_hash(&self.prev_heartbeat);
        w.put_hash(&self.vdf_input);
        w.put_hash(&self.vdf_output);
        w.put_u64(self.vdf_iterations);
        w.put_bytes(&self.vdf_proof);
        w.into_bytes()
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.signing_bytes())
    }

    /// Stateless validity: identity binding, signature and VDF proof.
    /// The chain-link check against account state happens at apply time.
    pub fn verify(&self) -> MontanaResult<()> {
        if Address::from_public_key(&self.public_key) != Some(self.node_id) {
            return Err(MontanaError::BadStructure("heartbeat key/id mismatch"));
        }
        if !verify_signature(&self.public_key, &self.signing_bytes(), &self.signature)? {
            return Err(MontanaError::SignatureInvalid);
        }

        let proof = VdfProof::decode(&self.vdf_proof)
            .map_err(|_| MontanaError::BadVdfProof { reason: "undecodable proof" })?;
        if proof.segment_end != self.vdf_output {
            return Err(MontanaError::BadVdfProof {
                reason: "proof does not end at attested output",
            });
        }
        if proof.segment_iterations > self.vdf_iterations {
            return Err(MontanaError::BadVdfProof {
                reason: "segment longer than cumulative iterations",
            });
        }
        if !vdf::verify_segment(&proof) {
            return Err(MontanaError::BadVdfProof {
                reason: "segment re-derivation mismatch",
            });
        }
        Ok(())
    }
}

impl Encodable for Heartbeat {
    fn encode_into(&self, w: &mut Writer) {
        w.put_raw(self.node_id.as_bytes());
        w.put_bytes(&self.public_key);
        w.put_hash(&self.prev_heartbeat);
        w.put_hash(&self.vdf_input);
        w.put_hash(&self.vdf_output);
        w.put_u64(self.vdf_iterations);
        w.put_bytes(&self.vdf_proof);
        w.put_bytes(&self.signature);
    }
}

impl Decodable for Heartbeat {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let node_id = Address::from_slice(r.take(32)?).expect("fixed width");
        Ok(Heartbeat {
            node_id,
            public_key: r.bytes_max(PUBLIC_KEY_SIZE)?,
            prev_heartbeat: r.hash()?,
            vdf_input: r.hash()?,
            vdf_output: r.hash()?,
            vdf_iterations: r.u64()?,
            vdf_proof: r.bytes_max(256)?,
            signature: r.bytes_max(SIGNATURE_SIZE)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::NodeKeys;
    use crate::core::vdf::{advance, VdfCheckpoint};
    use crate::core::types::now_ms;

    fn test_status(seed: u8, iterations: u64) -> VdfStatus {
        let input = Hash([seed; 32]);
        let (output, proof) = advance(&input, iterations);
        VdfStatus {
            input,
            output,
            total_iterations: iterations,
            last_checkpoint: Some(VdfCheckpoint {
                input,
                output,
                segment_iterations: iterations,
                total_iterations: iterations,
                proof,
                timestamp_ms: now_ms(),
            }),
        }
    }

    #[test]
    fn test_heartbeat_verifies() {
        let keys = NodeKeys::from_secret_bytes(&[1u8; 32]).unwrap();
        let hb = Heartbeat::create(&keys, Hash::ZERO, &test_status(1, 200)).unwrap();
        hb.verify().unwrap();
    }

    #[test]
    fn test_no_checkpoint_no_heartbeat() {
        let keys = NodeKeys::from_secret_bytes(&[1u8; 32]).unwrap();
        let status = VdfStatus {
            input: Hash::ZERO,
            output: Hash::ZERO,
            total_iterations: 0,
            last_checkpoint: None,
        };
        assert!(Heartbeat::create(&keys, Hash::ZERO, &status).is_none());
    }

    #[test]
    fn test_tampered_output_rejected() {
        let keys = NodeKeys::from_secret_bytes(&[2u8; 32]).unwrap();
        let mut hb = Heartbeat::create(&keys, Hash::ZERO, &test_status(2, 200)).unwrap();
        hb.vdf_output = Hash([0xee; 32]);
        // Signature breaks first; re-sign to reach the proof check.
        hb.signature = keys.sign(&hb.signing_bytes());
        assert!(matches!(
            hb.verify(),
            Err(MontanaError::BadVdfProof { .. })
        ));
    }

    #[test]
    fn test_forged_signature_rejected() {
        let keys = NodeKeys::from_secret_bytes(&[3u8; 32]).unwrap();
        let other = NodeKeys::from_secret_bytes(&[4u8; 32]).unwrap();
        let mut hb = Heartbeat::create(&keys, Hash::ZERO, &test_status(3, 100)).unwrap();
        hb.signature = other.sign(&hb.signing_bytes());
        assert!(matches!(hb.verify(), Err(MontanaError::SignatureInvalid)));
    }

    #[test]
    fn test_iteration_claim_below_segment_rejected() {
        let keys = NodeKeys::from_secret_bytes(&[5u8; 32]).unwrap();
        let mut hb = Heartbeat::create(&keys, Hash::ZERO, &test_status(5, 300)).unwrap();
        hb.vdf_iterations = 10;
        hb.signature = keys.sign(&hb.signing_bytes());
        assert!(matches!(
            hb.verify(),
            Err(MontanaError::BadVdfProof { .. })
        ));
    }

    #[test]
    fn test_codec_round_trip() {
        let keys = NodeKeys::from_secret_bytes(&[6u8; 32]).unwrap();
        let hb = Heartbeat::create(&keys, Hash([1u8; 32]), &test_status(6, 128)).unwrap();
        let bytes = hb.encode();
        let parsed = Heartbeat::decode(&bytes).unwrap();
        assert_eq!(parsed, hb);
        assert_eq!(parsed.hash(), hb.hash());
    }

    #[test]
    fn test_chain_link_changes_hash() {
        let keys = NodeKeys::from_secret_bytes(&[7u8; 32]).unwrap();
        let status = test_status(7, 99);
        let first = Heartbeat::create(&keys, Hash::ZERO, &status).unwrap();
        let second = Heartbeat::create(&keys, first.hash(), &status).unwrap();
        assert_ne!(first.hash(), second.hash());
    }
}
