use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::RecognitionBackend;
use crate::error::PipelineError;
use crate::types::AudioSegment;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Serialize)]
struct RecognizeParams {
    language: String,
    use_gpu: bool,
    beam_size: u32,
    temperature: f32,
}

/// Per-segment HTTP client dispatching to a local precise-recognition service.
pub struct PreciseServerClient {
    base_url: String,
    client: Client,
    language: String,
    use_gpu: bool,
    result_sender: mpsc::UnboundedSender<(String, Instant)>,
}

impl PreciseServerClient {
    pub fn new(
        base_url: String,
        language: String,
        use_gpu: bool,
        result_sender: mpsc::UnboundedSender<(String, Instant)>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            language,
            use_gpu,
            result_sender,
        }
    }

    pub async fn test_connection(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("precise server health check failed: {}", e);
                false
            }
        }
    }

    async fn recognize(&self, segment: &AudioSegment) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(&segment.file_path).await?;
        let content_type = content_type_for(&segment.file_path);
        let params = RecognizeParams {
            language: self.language.clone(),
            use_gpu: self.use_gpu,
            beam_size: 5,
            temperature: 0.0,
        };

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=MAX_RETRIES {
            let part = reqwest::multipart::Part::bytes(bytes.clone())
                .file_name(
                    segment
                        .file_path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("segment.wav")
                        .to_string(),
                )
                .mime_str(content_type)?;
            let form = reqwest::multipart::Form::new()
                .part("file", part)
                .text("params", serde_json::to_string(&params)?);

            let response = self
                .client
                .post(format!("{}/recognize", self.base_url))
                .header("X-Request-ID", segment.sequence_number.to_string())
                .multipart(form)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    if body.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
                        return Ok(body
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string());
                    }
                    let message = body
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown recognition error")
                        .to_string();
                    return Err(PipelineError::RecognitionProtocol(message).into());
                }
                Ok(resp) if resp.status().as_u16() == 403 => {
                    return Err(PipelineError::RecognitionProtocol(
                        "content operation not permitted (403)".into(),
                    )
                    .into());
                }
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(PipelineError::RecognitionProtocol(format!(
                        "client error: {}",
                        resp.status()
                    ))
                    .into());
                }
                Ok(resp) => {
                    last_err = Some(
                        PipelineError::RecognitionTransport(format!(
                            "server error {} (attempt {}/{})",
                            resp.status(),
                            attempt,
                            MAX_RETRIES
                        ))
                        .into(),
                    );
                }
                Err(e) => {
                    last_err = Some(
                        PipelineError::RecognitionTransport(format!(
                            "network error (attempt {}/{}): {}",
                            attempt, MAX_RETRIES, e
                        ))
                        .into(),
                    );
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
        }

        Err(last_err
            .unwrap_or_else(|| PipelineError::RecognitionTransport("exhausted retries".into()).into()))
    }
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl RecognitionBackend for PreciseServerClient {
    async fn start(&self) -> anyhow::Result<()> {
        if !self.test_connection().await {
            warn!("precise server at {} did not respond to health check", self.base_url);
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn dispatch(&self, segment: AudioSegment) -> anyhow::Result<()> {
        let seq = segment.sequence_number;
        let is_last = segment.is_last;
        match self.recognize(&segment).await {
            Ok(text) => {
                debug!("precise server returned {} chars for segment {}", text.len(), seq);
                let payload = json!({
                    "text": text,
                    "sequence": seq,
                    "is_last": is_last,
                })
                .to_string();
                let _ = self.result_sender.send((payload, Instant::now()));
                Ok(())
            }
            Err(e) => {
                error!("precise recognition failed for segment {}: {}", seq, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn content_type_matches_extension() {
        assert_eq!(content_type_for(&PathBuf::from("a.mp3")), "audio/mpeg");
        assert_eq!(content_type_for(&PathBuf::from("a.wav")), "audio/wav");
        assert_eq!(content_type_for(&PathBuf::from("a.xyz")), "application/octet-stream");
    }
}
