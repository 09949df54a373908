//! Dataset upload boundary. The transport is an external collaborator in
//! principle, but a `reqwest`-backed blocking implementation is provided
//! here, fired on a background worker so the triggering callback never
//! blocks on network I/O.

use url::Url;

use crate::error::UploadError;

pub trait DatasetUploader: Send + Sync {
    fn upload_wav(&self, url: &Url, audio: &[u8], filename: &str) -> Result<(), UploadError>;
}

pub struct ReqwestUploader {
    client: reqwest::blocking::Client,
}

impl Default for ReqwestUploader {
    fn default() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl DatasetUploader for ReqwestUploader {
    fn upload_wav(&self, url: &Url, audio: &[u8], filename: &str) -> Result<(), UploadError> {
        let part = reqwest::blocking::multipart::Part::bytes(audio.to_vec())
            .file_name(filename.to_string())
            .mime_str("audio/wav")
            .unwrap_or_else(|_| reqwest::blocking::multipart::Part::bytes(audio.to_vec()));
        let form = reqwest::blocking::multipart::Form::new().part("audio", part);
        self.client.post(url.clone()).multipart(form).send()?;
        Ok(())
    }
}

/// Submits an upload on a background thread so the VoiceLoop callback
/// that triggered it never blocks on network I/O.
pub fn upload_in_background(uploader: std::sync::Arc<dyn DatasetUploader>, url: Url, audio: Vec<u8>, filename: String) {
    std::thread::spawn(move || {
        if let Err(err) = uploader.upload_wav(&url, &audio, &filename) {
            tracing::warn!(error = %err, "dataset upload failed");
        }
    });
}
