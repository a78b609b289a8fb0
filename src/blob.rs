//! Client for the external blob store.
//!
//! Media never travels over the chat session. The sender uploads an
//! opaque ciphertext over HTTPS, gets a 16-byte blob ID back and only
//! references it in the message; the receiver fetches and decrypts it out
//! of band. Two envelopes exist: an asymmetric one for direct images
//! (sealed between the two long-term keys under a fresh random nonce that
//! rides in the message) and a symmetric one for audio and group media (a
//! fresh secretbox key embedded in the message, fixed nonce).

use log::debug;

use crate::crypto::{
    box_open, box_seal, generate_symmetric_key, secretbox_open, secretbox_seal, Nonce,
};
use crate::errors::BlobError;
use crate::{BLOB_ID_SIZE, KEY_SIZE, NONCE_SIZE};

pub type BlobId = [u8; BLOB_ID_SIZE];

/// Endpoints and TLS trust for the blob store.
#[derive(Clone, Debug)]
pub struct BlobConfig {
    /// Upload endpoint, POST multipart.
    pub upload_url: String,
    /// Domain for downloads; the shard subdomain is prepended per blob.
    pub download_domain: String,
    pub user_agent: String,
    /// Pinned server certificate in PEM form. When set, it is the only
    /// trust anchor.
    pub root_certificate_pem: Option<Vec<u8>>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        BlobConfig {
            upload_url: "https://upload.blob.o3net.org/upload".to_string(),
            download_domain: "blob.o3net.org".to_string(),
            user_agent: "ozone/0.1".to_string(),
            root_certificate_pem: None,
        }
    }
}

pub struct BlobClient {
    http: reqwest::Client,
    config: BlobConfig,
}

impl BlobClient {
    pub fn new(config: BlobConfig) -> Result<Self, BlobError> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
        if let Some(pem) = &config.root_certificate_pem {
            let cert = reqwest::Certificate::from_pem(pem)?;
            builder = builder
                .add_root_certificate(cert)
                .tls_built_in_root_certs(false);
        }
        Ok(BlobClient {
            http: builder.build()?,
            config,
        })
    }

    /// Upload an opaque ciphertext and return the assigned blob ID.
    pub async fn upload(&self, blob: Vec<u8>) -> Result<BlobId, BlobError> {
        let part = reqwest::multipart::Part::bytes(blob).file_name("blob.bin");
        let form = reqwest::multipart::Form::new().part("blob", part);

        let response = self
            .http
            .post(&self.config.upload_url)
            .multipart(form)
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(BlobError::Status(response.status().as_u16()));
        }

        // The body is the hex-encoded 16-byte blob ID.
        let body = response.text().await?;
        let bytes = hex::decode(body.trim()).map_err(|_| BlobError::BadId)?;
        let blob_id: BlobId = bytes.try_into().map_err(|_| BlobError::BadId)?;
        debug!("uploaded blob {}", hex::encode(blob_id));
        Ok(blob_id)
    }

    /// Download the ciphertext for a blob ID.
    pub async fn download(&self, blob_id: &BlobId) -> Result<Vec<u8>, BlobError> {
        let url = self.download_url(blob_id);
        debug!("downloading blob from {url}");

        let response = self.http.get(&url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(BlobError::Status(response.status().as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Seal a plaintext for one recipient and upload it.
    ///
    /// Returns the nonce to embed in the image message, the ciphertext
    /// size and the blob ID.
    pub async fn seal_and_upload(
        &self,
        plaintext: &[u8],
        recipient_public_key: &[u8; KEY_SIZE],
        own_secret_key: &[u8; KEY_SIZE],
    ) -> Result<(Nonce, u32, BlobId), BlobError> {
        let nonce = Nonce::random();
        let ciphertext = box_seal(plaintext, &nonce, recipient_public_key, own_secret_key)?;
        let size = ciphertext.len() as u32;
        let blob_id = self.upload(ciphertext).await?;
        Ok((nonce, size, blob_id))
    }

    /// Fetch and open an asymmetrically sealed blob.
    pub async fn download_and_open(
        &self,
        blob_id: &BlobId,
        nonce: &Nonce,
        sender_public_key: &[u8; KEY_SIZE],
        own_secret_key: &[u8; KEY_SIZE],
    ) -> Result<Vec<u8>, BlobError> {
        let ciphertext = self.download(blob_id).await?;
        Ok(box_open(
            &ciphertext,
            nonce,
            sender_public_key,
            own_secret_key,
        )?)
    }

    /// Seal a plaintext under a fresh symmetric key and upload it.
    ///
    /// Returns the key to embed in the message, the ciphertext size and
    /// the blob ID.
    pub async fn seal_and_upload_symmetric(
        &self,
        plaintext: &[u8],
    ) -> Result<([u8; KEY_SIZE], u32, BlobId), BlobError> {
        let key = generate_symmetric_key();
        let ciphertext = secretbox_seal(plaintext, &symmetric_blob_nonce(), &key)?;
        let size = ciphertext.len() as u32;
        let blob_id = self.upload(ciphertext).await?;
        Ok((key, size, blob_id))
    }

    /// Fetch and open a symmetrically sealed blob.
    pub async fn download_and_open_symmetric(
        &self,
        blob_id: &BlobId,
        key: &[u8; KEY_SIZE],
    ) -> Result<Vec<u8>, BlobError> {
        let ciphertext = self.download(blob_id).await?;
        Ok(secretbox_open(&ciphertext, &symmetric_blob_nonce(), key)?)
    }

    /// Download URL for a blob. The first ID byte selects the storage
    /// shard subdomain.
    fn download_url(&self, blob_id: &BlobId) -> String {
        format!(
            "https://{:02x}.{}/{}",
            blob_id[0],
            self.config.download_domain,
            hex::encode(blob_id)
        )
    }
}

/// The fixed nonce of the symmetric blob envelope: 23 zero bytes followed
/// by a one. Safe because every blob uses a fresh key.
fn symmetric_blob_nonce() -> Nonce {
    let mut bytes = [0u8; NONCE_SIZE];
    bytes[NONCE_SIZE - 1] = 1;
    Nonce::from_bytes(bytes)
}
