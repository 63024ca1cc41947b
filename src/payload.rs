// Hybrid delivery of the current topology:
//   encrypted_payload = AES-256-GCM(K, json({chain_topology, coordinator_address}))
//   encrypted_key     = seal(K, client_public_key)

use tracing::debug;

use crate::error::{CommError, Result};
use crate::key_management::{seal, IdentityKeypair, PublicKey, SymmetricKey};
use crate::relay_protocol::{decode, encode, LockCyclePayload, PayloadResponse};
use crate::topology::ChainTopology;

/// Encrypt `topology` for the holder of `client_public_key` (base64 X25519).
///
/// The key is validated before any encryption happens.
pub fn get_payload(topology: &ChainTopology, coordinator_address: &str, client_public_key: &str) -> Result<PayloadResponse> {
    let client_key = PublicKey::from_base64(client_public_key).map_err(|e| CommError::KeyWrapFailure(e.to_string()))?;

    let payload = LockCyclePayload {
        chain_topology: topology.clone(),
        coordinator_address: coordinator_address.to_string(),
    };
    let key = SymmetricKey::generate();
    let encrypted_payload = key.encrypt(&encode(&payload)?)?;
    let encrypted_key = seal(key.as_bytes(), &client_key).map_err(|e| CommError::KeyWrapFailure(e.to_string()))?;

    debug!(hops = topology.len(), "payload prepared");
    Ok(PayloadResponse {
        encrypted_payload,
        encrypted_key,
    })
}

/// Client side inverse of [`get_payload`].
pub fn decrypt_payload(keypair: &IdentityKeypair, response: &PayloadResponse) -> Result<LockCyclePayload> {
    let key = SymmetricKey::from_slice(&keypair.open(&response.encrypted_key)?)?;
    let plaintext = key.decrypt(&response.encrypted_payload)?;
    let payload: LockCyclePayload = decode(&plaintext)?;
    payload.chain_topology.validate()?;
    Ok(payload)
}
