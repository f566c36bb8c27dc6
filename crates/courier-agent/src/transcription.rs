//! Speech-to-text adapter: posts audio to an OpenAI-compatible
//! transcriptions endpoint and returns the transcript with the reported
//! duration (which drives per-minute billing).

use serde::Deserialize;
use tracing::debug;

use courier_core::config::TranscriptionConfig;
use courier_core::{config, CourierError, Result};

pub struct TranscriptionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Audio duration in seconds, as reported by the service.
    #[serde(default)]
    pub duration: f64,
}

impl TranscriptionClient {
    /// Build from config; `None` when no API key is configured.
    pub fn from_config(cfg: &TranscriptionConfig) -> Result<Option<Self>> {
        let Some(key_file) = &cfg.api_key_file else {
            return Ok(None);
        };
        Ok(Some(Self {
            client: reqwest::Client::new(),
            base_url: cfg.base_url.clone(),
            api_key: config::read_secret_file(key_file)?,
            model: cfg.model.clone(),
        }))
    }

    /// Transcribe one audio payload. `language` is an ISO code hint;
    /// `None` lets the service auto-detect.
    pub async fn transcribe(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        mime: &str,
        language: Option<&str>,
    ) -> Result<Transcript> {
        let url = format!("{}/v1/audio/transcriptions", self.base_url);

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| CourierError::Internal(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CourierError::ApiTimeout("transcription".into())
                } else {
                    CourierError::ApiConnection(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(CourierError::Provider(format!(
                "transcription failed with status {}",
                resp.status().as_u16()
            )));
        }

        let transcript: Transcript = resp
            .json()
            .await
            .map_err(|e| CourierError::Provider(e.to_string()))?;
        debug!(
            chars = transcript.text.len(),
            duration = transcript.duration,
            language = transcript.language.as_deref().unwrap_or("auto"),
            "transcription complete"
        );
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_json_shape_parses() {
        let body = r#"{"text": "привет как дела", "language": "ru", "duration": 14.6}"#;
        let t: Transcript = serde_json::from_str(body).unwrap();
        assert_eq!(t.text, "привет как дела");
        assert_eq!(t.language.as_deref(), Some("ru"));
        assert!((t.duration - 14.6).abs() < f64::EPSILON);
    }

    #[test]
    fn minimal_response_defaults() {
        let t: Transcript = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(t.text, "hi");
        assert!(t.language.is_none());
        assert_eq!(t.duration, 0.0);
    }
}
