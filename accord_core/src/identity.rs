//! DID-shaped agent identities: RSA-2048 key pairs, signing, and verification.
//!
//! An [`AgentIdentity`] is created once via [`AgentIdentity::create_key_based`]
//! and never changes its `did` afterwards. Verification status only ever
//! advances from [`VerificationStatus::Pending`] to
//! [`VerificationStatus::Verified`] or [`VerificationStatus::Failed`]; it can
//! revert only through an explicit call to [`AgentIdentity::reverify`].

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::EncodePublicKey,
    pss::{BlindedSigningKey, Signature, VerifyingKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::IdentityError;

const RSA_KEY_BITS: usize = 2048;
const FINGERPRINT_BYTES: usize = 16;

/// Lifecycle state of an [`AgentIdentity`].
///
/// May only advance `Pending -> Verified | Failed`; reverting requires an
/// explicit call to [`AgentIdentity::reverify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
}

/// A decentralized identifier with its key material.
///
/// `private_key` is `None` for identities the local process only needs to
/// verify against (e.g. a peer's public identity received over the wire);
/// it is `Some` only for identities this process can sign with.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    did: String,
    #[serde(with = "public_key_b64")]
    public_key: RsaPublicKey,
    #[serde(skip)]
    private_key: Option<RsaPrivateKey>,
    verification_status: VerificationStatus,
    created_at: DateTime<Utc>,
    metadata: BTreeMap<String, Value>,
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("did", &self.did)
            .field("verification_status", &self.verification_status)
            .field("created_at", &self.created_at)
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

impl AgentIdentity {
    /// Generates an RSA-2048 key pair and derives a `did:key:<fingerprint>`
    /// identity from it, already in the `Verified` state (the key pair was
    /// minted locally, there is nothing further to verify).
    pub fn create_key_based() -> Result<Self, IdentityError> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| IdentityError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        let did = did_key_from_public_key(&public_key)?;

        Ok(Self {
            did,
            public_key,
            private_key: Some(private_key),
            verification_status: VerificationStatus::Verified,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        })
    }

    /// Builds a verification-only identity for a peer whose public key is
    /// already known (e.g. received in a registration payload). The DID must
    /// be a well-formed `did:key:` or `did:ethr:` string; this does not
    /// perform real DID-document resolution (see the module-level note in
    /// the design document) — it preserves the interface so a resolver can
    /// be swapped in later without changing callers.
    pub fn from_public_key(
        did: impl Into<String>,
        public_key: RsaPublicKey,
        status: VerificationStatus,
    ) -> Result<Self, IdentityError> {
        let did = did.into();
        if !is_well_formed_did(&did) {
            return Err(IdentityError::UnsupportedDid(did));
        }
        Ok(Self {
            did,
            public_key,
            private_key: None,
            verification_status: status,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        })
    }

    /// Convenience wrapper over [`AgentIdentity::from_public_key`] for
    /// `did:ethr:` peers: these are always verification-only, so there is no
    /// private key parameter to get wrong.
    pub fn from_ethr_address(
        address: impl Into<String>,
        public_key: RsaPublicKey,
        status: VerificationStatus,
    ) -> Result<Self, IdentityError> {
        Self::from_public_key(address, public_key, status)
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn verification_status(&self) -> VerificationStatus {
        self.verification_status
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// Re-runs verification for this identity, the only path by which
    /// `verification_status` may move backwards from `Verified`.
    pub fn reverify(&mut self, status: VerificationStatus) {
        self.verification_status = status;
    }

    /// Signs `content` with RSA-PSS/SHA-256 using the maximum salt length,
    /// base64-encoding the result. Fails if this identity has no private key.
    pub fn sign(&self, content: &str) -> Result<String, IdentityError> {
        let private_key = self
            .private_key
            .as_ref()
            .ok_or(IdentityError::NoPrivateKey)?;
        let signing_key = BlindedSigningKey::<Sha256>::new(private_key.clone());
        let mut rng = OsRng;
        let signature: Signature = signing_key
            .try_sign_with_rng(&mut rng, content.as_bytes())
            .map_err(|e| IdentityError::Signing(e.to_string()))?;
        Ok(BASE64.encode(signature.to_bytes()))
    }

    /// Verifies `signature` (base64-encoded) over `content` under this
    /// identity's public key. Never panics or propagates a crypto error
    /// across the boundary: any failure collapses to `false`.
    pub fn verify(&self, content: &str, signature: &str) -> bool {
        let Ok(raw) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(raw.as_slice()) else {
            return false;
        };
        let verifying_key = VerifyingKey::<Sha256>::new(self.public_key.clone());
        verifying_key.verify(content.as_bytes(), &signature).is_ok()
    }
}

/// Validates the shape of a DID string without resolving it: `did:key:` must
/// be followed by a non-empty base64url fingerprint, `did:ethr:` by exactly
/// 40 hex characters prefixed with `0x`.
pub fn is_well_formed_did(did: &str) -> bool {
    if let Some(fp) = did.strip_prefix("did:key:") {
        !fp.is_empty() && fp.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    } else if let Some(addr) = did.strip_prefix("did:ethr:") {
        addr.strip_prefix("0x")
            .map(|hex| hex.len() == 40 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .unwrap_or(false)
    } else {
        false
    }
}

/// Stub for real DID-document resolution: today this only checks the DID's
/// shape is well-formed. Kept `async` so a network-backed resolver can
/// replace the body without changing any call site.
pub async fn verify_identity_format(did: &str) -> bool {
    is_well_formed_did(did)
}

fn did_key_from_public_key(public_key: &RsaPublicKey) -> Result<String, IdentityError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| IdentityError::KeyGeneration(e.to_string()))?;
    let digest = Sha256::digest(der.as_bytes());
    let fingerprint = &digest[..FINGERPRINT_BYTES];
    Ok(format!("did:key:{}", URL_SAFE_NO_PAD.encode(fingerprint)))
}

mod public_key_b64 {
    use base64::Engine;
    use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
    use rsa::RsaPublicKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &RsaPublicKey, s: S) -> Result<S::Ok, S::Error> {
        let der = key
            .to_public_key_der()
            .map_err(serde::ser::Error::custom)?;
        base64::engine::general_purpose::STANDARD
            .encode(der.as_bytes())
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<RsaPublicKey, D::Error> {
        use base64::Engine;
        let s = String::deserialize(d)?;
        let der = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)?;
        RsaPublicKey::from_public_key_der(&der).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_key_based_produces_verified_did_key_identity() {
        let identity = AgentIdentity::create_key_based().expect("keygen");
        assert!(identity.did().starts_with("did:key:"));
        assert_eq!(identity.verification_status(), VerificationStatus::Verified);
        assert!(identity.has_private_key());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let identity = AgentIdentity::create_key_based().expect("keygen");
        let sig = identity.sign("hello world").expect("sign");
        assert!(identity.verify("hello world", &sig));
        assert!(!identity.verify("goodbye world", &sig));
    }

    #[test]
    fn signing_without_private_key_fails() {
        let identity = AgentIdentity::create_key_based().expect("keygen");
        let public_only =
            AgentIdentity::from_public_key(identity.did().to_string(), identity.public_key.clone(), VerificationStatus::Pending)
                .expect("construct");
        assert!(matches!(
            public_only.sign("x"),
            Err(IdentityError::NoPrivateKey)
        ));
    }

    #[test]
    fn well_formed_did_checks() {
        assert!(is_well_formed_did("did:key:AbCd-_12"));
        assert!(is_well_formed_did(
            "did:ethr:0x1234567890123456789012345678901234567890"
        ));
        assert!(!is_well_formed_did("did:ethr:0x123"));
        assert!(!is_well_formed_did("not-a-did"));
    }

    #[tokio::test]
    async fn verify_identity_format_accepts_well_formed_dids() {
        assert!(verify_identity_format("did:key:abc123").await);
        assert!(!verify_identity_format("garbage").await);
    }
}
