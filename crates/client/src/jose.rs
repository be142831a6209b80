//! JWS request signing over account keys
//!
//! Every authenticated ACME request body is a detached-signature JSON
//! envelope `{protected, payload, signature}` where the protected header
//! binds the anti-replay nonce and the target URL into the signature
//! (RFC 8555 §6.2). Account keys are ECDSA P-256 and sign with ES256.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::AcmeError;

/// Signed request envelope, serialized as the POST body
#[derive(Debug, Clone, Serialize)]
pub struct SignedRequest {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// ES256 account signing key
pub struct AccountKey {
    key_pair: EcdsaKeyPair,
    pkcs8: Vec<u8>,
    rng: SystemRandom,
}

impl AccountKey {
    /// Generate a fresh P-256 account key
    pub fn generate() -> Result<Self, AcmeError> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|e| AcmeError::Signing(format!("key generation failed: {:?}", e)))?;
        Self::from_pkcs8_der(document.as_ref())
    }

    /// Load an account key from PKCS#8 DER bytes
    ///
    /// Persistence of the key material is the caller's concern; this is
    /// the interface boundary for it.
    pub fn from_pkcs8_der(pkcs8: &[u8]) -> Result<Self, AcmeError> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
            .map_err(|e| AcmeError::Signing(format!("invalid PKCS#8 key: {:?}", e)))?;
        Ok(Self {
            key_pair,
            pkcs8: pkcs8.to_vec(),
            rng,
        })
    }

    /// PKCS#8 DER encoding of the key, for the caller to persist
    pub fn to_pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Public key as a JWK object
    ///
    /// serde_json's default map keeps keys sorted, which yields the
    /// canonical `{"crv","kty","x","y"}` member order RFC 7638 requires
    /// for thumbprinting.
    pub fn jwk(&self) -> Value {
        let public = self.key_pair.public_key().as_ref();
        // Uncompressed SEC1 point: 0x04 || x (32 bytes) || y (32 bytes)
        let x = &public[1..33];
        let y = &public[33..65];
        json!({
            "crv": "P-256",
            "kty": "EC",
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        })
    }

    /// RFC 7638 JWK thumbprint: base64url(SHA-256(canonical JWK JSON))
    pub fn thumbprint(&self) -> String {
        let digest = Sha256::digest(self.jwk().to_string().as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// Key authorization for a challenge token: `<token>.<thumbprint>`
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, self.thumbprint())
    }

    /// Sign a request envelope
    ///
    /// The protected header carries `kid` once an account URL is known,
    /// and the full JWK before one exists (newAccount). `None` payload
    /// produces the zero-length payload of a POST-as-GET read.
    pub fn sign(
        &self,
        url: &str,
        nonce: &str,
        kid: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<SignedRequest, AcmeError> {
        let mut protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        match kid {
            Some(kid) => {
                protected["kid"] = Value::String(kid.to_string());
            }
            None => {
                protected["jwk"] = self.jwk();
            }
        }

        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string().as_bytes());
        let payload_b64 = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(value.to_string().as_bytes()),
            None => String::new(),
        };

        let signature = self.sign_input(&protected_b64, &payload_b64)?;
        Ok(SignedRequest {
            protected: protected_b64,
            payload: payload_b64,
            signature,
        })
    }

    /// Inner key-change JWS (RFC 8555 §7.3.5)
    ///
    /// Signed by the NEW key with a jwk header and no nonce; the result
    /// becomes the payload of an outer envelope signed by the old key.
    pub fn key_change_jws(
        new_key: &AccountKey,
        old_key: &AccountKey,
        account_url: &str,
        key_change_url: &str,
    ) -> Result<Value, AcmeError> {
        let protected = json!({
            "alg": "ES256",
            "jwk": new_key.jwk(),
            "url": key_change_url,
        });
        let payload = json!({
            "account": account_url,
            "oldKey": old_key.jwk(),
        });

        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string().as_bytes());
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        let signature = new_key.sign_input(&protected_b64, &payload_b64)?;

        Ok(json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": signature,
        }))
    }

    fn sign_input(&self, protected_b64: &str, payload_b64: &str) -> Result<String, AcmeError> {
        let signing_input = format!("{}.{}", protected_b64, payload_b64);
        let signature = self
            .key_pair
            .sign(&self.rng, signing_input.as_bytes())
            .map_err(|e| AcmeError::Signing(format!("JWS signing failed: {:?}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(signature.as_ref()))
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

/// Decode the protected header of a signed request back into JSON
///
/// Test helper for inspecting what a request actually bound.
#[cfg(test)]
pub(crate) fn decode_protected(request: &SignedRequest) -> Value {
    let bytes = URL_SAFE_NO_PAD.decode(&request.protected).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_reload_round_trip() {
        let key = AccountKey::generate().unwrap();
        let reloaded = AccountKey::from_pkcs8_der(key.to_pkcs8_der()).unwrap();
        assert_eq!(key.thumbprint(), reloaded.thumbprint());
    }

    #[test]
    fn test_jwk_canonical_member_order() {
        let key = AccountKey::generate().unwrap();
        let jwk = key.jwk().to_string();

        // RFC 7638 requires crv, kty, x, y in lexicographic order
        let crv = jwk.find("\"crv\"").unwrap();
        let kty = jwk.find("\"kty\"").unwrap();
        let x = jwk.find("\"x\"").unwrap();
        let y = jwk.find("\"y\"").unwrap();
        assert!(crv < kty && kty < x && x < y);
    }

    #[test]
    fn test_thumbprint_shape() {
        let key = AccountKey::generate().unwrap();
        let thumbprint = key.thumbprint();

        // base64url of 32 digest bytes, unpadded
        assert_eq!(thumbprint.len(), 43);
        assert!(!thumbprint.contains('+'));
        assert!(!thumbprint.contains('/'));
        assert!(!thumbprint.contains('='));
    }

    #[test]
    fn test_key_authorization_format() {
        let key = AccountKey::generate().unwrap();
        let key_auth = key.key_authorization("token-abc");
        assert!(key_auth.starts_with("token-abc."));
        assert_eq!(key_auth, format!("token-abc.{}", key.thumbprint()));
    }

    #[test]
    fn test_protected_header_is_deterministic() {
        let key = AccountKey::generate().unwrap();
        let payload = json!({"hello": "world"});

        let first = key.sign("https://ca.test/new-order", "nonce-1", Some("kid-1"), Some(&payload)).unwrap();
        let second = key.sign("https://ca.test/new-order", "nonce-1", Some("kid-1"), Some(&payload)).unwrap();

        // ECDSA signatures are randomized; the signed header bytes are not
        assert_eq!(first.protected, second.protected);
        assert_eq!(first.payload, second.payload);
    }

    #[test]
    fn test_header_binds_nonce_and_url() {
        let key = AccountKey::generate().unwrap();
        let request = key.sign("https://ca.test/acme/authz/1", "nonce-xyz", Some("kid-1"), None).unwrap();

        let protected = decode_protected(&request);
        assert_eq!(protected["alg"], "ES256");
        assert_eq!(protected["nonce"], "nonce-xyz");
        assert_eq!(protected["url"], "https://ca.test/acme/authz/1");
        assert_eq!(protected["kid"], "kid-1");
        assert!(protected.get("jwk").is_none());
    }

    #[test]
    fn test_jwk_header_before_account_exists() {
        let key = AccountKey::generate().unwrap();
        let request = key.sign("https://ca.test/acme/new-acct", "nonce-1", None, Some(&json!({}))).unwrap();

        let protected = decode_protected(&request);
        assert!(protected.get("kid").is_none());
        assert_eq!(protected["jwk"]["kty"], "EC");
        assert_eq!(protected["jwk"]["crv"], "P-256");
    }

    #[test]
    fn test_post_as_get_has_empty_payload() {
        let key = AccountKey::generate().unwrap();
        let request = key.sign("https://ca.test/acme/order/1", "nonce-1", Some("kid-1"), None).unwrap();
        assert!(request.payload.is_empty());
        assert!(!request.signature.is_empty());
    }

    #[test]
    fn test_key_change_nesting() {
        let old_key = AccountKey::generate().unwrap();
        let new_key = AccountKey::generate().unwrap();

        let inner = AccountKey::key_change_jws(
            &new_key,
            &old_key,
            "https://ca.test/acme/acct/7",
            "https://ca.test/acme/key-change",
        )
        .unwrap();

        let protected: Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(inner["protected"].as_str().unwrap()).unwrap(),
        )
        .unwrap();
        let payload: Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(inner["payload"].as_str().unwrap()).unwrap(),
        )
        .unwrap();

        // Inner JWS: new key in the header, no nonce, old key in the payload
        assert_eq!(protected["jwk"], new_key.jwk());
        assert!(protected.get("nonce").is_none());
        assert_eq!(payload["account"], "https://ca.test/acme/acct/7");
        assert_eq!(payload["oldKey"], old_key.jwk());
    }
}

