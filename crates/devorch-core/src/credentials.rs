//! GitHub App credential handling: RS256 JWT minting from a per-installation
//! RSA key, accepting both PKCS#1 and PKCS#8 PEM input.

use crate::error::{Error, Result};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

const JWT_LIFETIME_SECS: i64 = 600;

#[derive(Debug, Serialize, Deserialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Normalize a PEM body that may arrive base64-wrapped or with escaped
/// newlines (spec §9), and accept both PKCS#1 and PKCS#8 envelopes.
fn normalize_pem(raw: &str) -> String {
    let unescaped = raw.replace("\\n", "\n");
    let trimmed = unescaped.trim();
    if trimmed.starts_with("-----BEGIN") {
        return trimmed.to_string();
    }
    // Possibly base64-wrapped: decode and retry.
    use base64::Engine;
    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
        if let Ok(s) = String::from_utf8(decoded) {
            return s.replace("\\n", "\n");
        }
    }
    trimmed.to_string()
}

/// Build a PKCS#8 DER-encoded document from either a PKCS#1 or a PKCS#8
/// RSA private-key PEM, per the "wrapped in the PKCS#8 ASN.1 envelope
/// in-line" requirement.
fn to_pkcs8_der(pem: &str) -> Result<Vec<u8>> {
    let key = if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| Error::Credential(format!("invalid PKCS#1 key: {e}")))?
    } else if pem.contains("BEGIN PRIVATE KEY") {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::Credential(format!("invalid PKCS#8 key: {e}")))?
    } else {
        return Err(Error::Credential(
            "unrecognized private key PEM header".to_string(),
        ));
    };
    let doc = key
        .to_pkcs8_der()
        .map_err(|e| Error::Credential(format!("pkcs8 conversion failed: {e}")))?;
    Ok(doc.as_bytes().to_vec())
}

/// A GitHub App's credentials: app id plus an RSA private key used to
/// mint short-lived RS256 JWTs.
#[derive(Clone)]
pub struct AppCredentials {
    pub app_id: String,
    private_key_der: SecretString,
}

impl AppCredentials {
    pub fn new(app_id: impl Into<String>, pem: &str) -> Result<Self> {
        let normalized = normalize_pem(pem);
        let der = to_pkcs8_der(&normalized)?;
        Ok(Self {
            app_id: app_id.into(),
            private_key_der: SecretString::new(hex::encode(der)),
        })
    }

    /// Mint an RS256 JWT: `iat = now`, `exp = now + 600s`, `iss = app_id`.
    pub fn mint_jwt(&self) -> Result<String> {
        let der = hex::decode(self.private_key_der.expose_secret().as_bytes())
            .map_err(|e| Error::Credential(format!("key decode failed: {e}")))?;
        let now = chrono::Utc::now().timestamp();
        let claims = AppClaims {
            iat: now,
            exp: now + JWT_LIFETIME_SECS,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_der(&der);
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| Error::Credential(format!("jwt signing failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::LineEnding;

    fn gen_pkcs1_pem() -> String {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        key.to_pkcs1_pem(LineEnding::LF).unwrap().to_string()
    }

    fn gen_pkcs8_pem() -> String {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    }

    #[test]
    fn accepts_pkcs1_key() {
        let pem = gen_pkcs1_pem();
        let creds = AppCredentials::new("12345", &pem).unwrap();
        let jwt = creds.mint_jwt().unwrap();
        assert!(jwt.split('.').count() == 3);
    }

    #[test]
    fn accepts_pkcs8_key() {
        let pem = gen_pkcs8_pem();
        let creds = AppCredentials::new("12345", &pem).unwrap();
        creds.mint_jwt().unwrap();
    }

    #[test]
    fn accepts_escaped_newlines() {
        let pem = gen_pkcs8_pem().replace('\n', "\\n");
        let creds = AppCredentials::new("12345", &pem).unwrap();
        creds.mint_jwt().unwrap();
    }

    #[test]
    fn jwt_claims_have_600s_lifetime() {
        let pem = gen_pkcs8_pem();
        let creds = AppCredentials::new("app1", &pem).unwrap();
        let jwt = creds.mint_jwt().unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        use base64::Engine;
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(parts[1])
            .unwrap();
        let claims: AppClaims = serde_json::from_slice(&payload).unwrap();
        assert_eq!(claims.exp - claims.iat, 600);
        assert_eq!(claims.iss, "app1");
    }
}
