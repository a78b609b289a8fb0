//! Client for the identity directory REST service.
//!
//! The directory resolves an 8-byte ID to the peer's long-term public key
//! and handles identity enrollment. The resolver side sits behind a trait
//! so the session can be wired to a test double.

use async_trait::async_trait;
use base64::Engine;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::crypto::{box_seal, generate_keypair, Nonce};
use crate::errors::DirectoryError;
use crate::identity::{Identity, PeerId};
use crate::{KEY_SIZE, NONCE_SIZE};

/// The fixed, domain-separating nonce used to seal identity-creation
/// challenge responses. Exactly 24 ASCII bytes.
const CREATE_RESPONSE_NONCE: &[u8; NONCE_SIZE] = b"createIdentity response.";

/// Resolves peer IDs to long-term public keys.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup(&self, id: PeerId) -> Result<[u8; KEY_SIZE], DirectoryError>;
}

/// Directory client against the production REST endpoints.
pub struct RestDirectory {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    public_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest {
    public_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChallenge {
    token: String,
    token_resp_key_pub: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    public_key: String,
    token: String,
    response: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResult {
    success: bool,
    identity: Option<String>,
    #[allow(dead_code)]
    server_group: Option<String>,
}

impl RestDirectory {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(RestDirectory {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Register a fresh identity with the directory.
    ///
    /// The server issues a token together with a one-off public key; the
    /// client proves possession of its new secret key by sealing the
    /// token back under the fixed response nonce.
    pub async fn create_identity(&self) -> Result<Identity, DirectoryError> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let keypair = generate_keypair();
        let public_key_b64 = b64.encode(keypair.public_key);

        let response = self
            .http
            .post(format!("{}/identity/create", self.base_url))
            .json(&CreateRequest {
                public_key: public_key_b64.clone(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        let challenge: CreateChallenge = response.json().await?;

        let token = b64
            .decode(&challenge.token)
            .map_err(|_| DirectoryError::BadKey)?;
        let token_key_bytes = b64
            .decode(&challenge.token_resp_key_pub)
            .map_err(|_| DirectoryError::BadKey)?;
        let token_key: [u8; KEY_SIZE] = token_key_bytes
            .try_into()
            .map_err(|_| DirectoryError::BadKey)?;

        let nonce = Nonce::from_bytes(*CREATE_RESPONSE_NONCE);
        let sealed = box_seal(&token, &nonce, &token_key, &keypair.secret_key)
            .map_err(|_| DirectoryError::CreateRejected)?;

        let response = self
            .http
            .post(format!("{}/identity/create_stage2", self.base_url))
            .json(&CreateResponse {
                public_key: public_key_b64,
                token: challenge.token,
                response: b64.encode(sealed),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        let result: CreateResult = response.json().await?;
        if !result.success {
            return Err(DirectoryError::CreateRejected);
        }

        let id_string = result.identity.ok_or(DirectoryError::BadIdentity)?;
        let id = PeerId::new(&id_string).map_err(|_| DirectoryError::BadIdentity)?;
        info!("created identity {id}");
        Ok(Identity::new(id, keypair.secret_key))
    }
}

#[async_trait]
impl Directory for RestDirectory {
    async fn lookup(&self, id: PeerId) -> Result<[u8; KEY_SIZE], DirectoryError> {
        debug!("resolving {id} via directory");
        let response = self
            .http
            .get(format!("{}/identity/{}", self.base_url, id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound(id));
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }

        let body: IdentityResponse = response.json().await?;
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(&body.public_key)
            .map_err(|_| DirectoryError::BadKey)?;
        key_bytes.try_into().map_err(|_| DirectoryError::BadKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_response_nonce_is_24_ascii_bytes() {
        assert_eq!(CREATE_RESPONSE_NONCE.len(), NONCE_SIZE);
        assert!(CREATE_RESPONSE_NONCE.is_ascii());
    }

    #[test]
    fn test_base_url_is_normalised() {
        let dir = RestDirectory::new("https://api.example.org/", "test").unwrap();
        assert_eq!(dir.base_url, "https://api.example.org");
    }
}
