//! Installation-token exchange on top of `devorch_core::credentials`: mint
//! an App JWT, trade it for a short-lived installation token, and cache it
//! until just before expiry.

pub use devorch_core::credentials::AppCredentials;
use devorch_core::error::{Error, Result};
use serde::Deserialize;
use std::sync::Mutex;

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

struct CachedToken {
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// Mints and caches installation tokens for one GitHub App installation.
pub struct InstallationAuth {
    credentials: AppCredentials,
    installation_id: i64,
    api_base: String,
    cached: Mutex<Option<CachedToken>>,
}

impl InstallationAuth {
    pub fn new(credentials: AppCredentials, installation_id: i64) -> Self {
        Self::with_api_base(credentials, installation_id, "https://api.github.com".to_string())
    }

    pub fn with_api_base(credentials: AppCredentials, installation_id: i64, api_base: String) -> Self {
        Self { credentials, installation_id, api_base, cached: Mutex::new(None) }
    }

    /// Return a cached token if it still has more than 60s left, otherwise
    /// mint a fresh App JWT and exchange it.
    pub async fn token(&self, client: &reqwest::Client) -> Result<String> {
        if let Some(cached) = self.cached.lock().unwrap().as_ref() {
            if cached.expires_at - chrono::Utc::now() > chrono::Duration::seconds(60) {
                return Ok(cached.token.clone());
            }
        }

        let jwt = self.credentials.mint_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, self.installation_id
        );
        let response = client
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "devorch")
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "installation token exchange failed: {}",
                response.status()
            )));
        }

        let parsed: InstallationTokenResponse =
            response.json().await.map_err(|e| Error::Http(e.to_string()))?;
        *self.cached.lock().unwrap() = Some(CachedToken {
            token: parsed.token.clone(),
            expires_at: parsed.expires_at,
        });
        Ok(parsed.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_token_is_reused_while_fresh() {
        let auth = InstallationAuth::with_api_base(
            AppCredentials::new("1", &test_pem()).unwrap(),
            42,
            "http://localhost".to_string(),
        );
        *auth.cached.lock().unwrap() = Some(CachedToken {
            token: "cached-token".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(10),
        });
        let cached = auth.cached.lock().unwrap();
        assert_eq!(cached.as_ref().unwrap().token, "cached-token");
    }

    fn test_pem() -> String {
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    }
}
