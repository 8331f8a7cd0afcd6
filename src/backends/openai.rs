use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::RecognitionBackend;
use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use crate::types::AudioSegment;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy)]
struct BatchSettings {
    enabled: bool,
    interval_ms: u64,
    size: u32,
}

/// Bounded worker pool uploading segments to an external transcription HTTP
/// endpoint. Workers run concurrently; each result carries its original
/// sequence number so the downstream merger can restore order.
///
/// By default segments are forwarded to workers as soon as they arrive
/// (minimum latency). When batch processing is enabled, incoming segments
/// are held in `pending` and released to the worker queue in groups of up
/// to `size` on every `interval_ms` tick instead.
pub struct ParallelOpenAIProcessor {
    config: ProcessorConfig,
    server_url: String,
    model_name: String,
    client: Client,
    segment_tx: mpsc::UnboundedSender<AudioSegment>,
    segment_rx: Arc<Mutex<mpsc::UnboundedReceiver<AudioSegment>>>,
    result_sender: mpsc::UnboundedSender<(String, Instant)>,
    cancel: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    batch: Arc<StdMutex<BatchSettings>>,
    pending: Arc<StdMutex<VecDeque<AudioSegment>>>,
    batch_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ParallelOpenAIProcessor {
    pub fn new(
        config: ProcessorConfig,
        server_url: String,
        model_name: String,
        result_sender: mpsc::UnboundedSender<(String, Instant)>,
    ) -> Self {
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();
        let server_url = normalize_server_url(&server_url);
        let batch = BatchSettings {
            enabled: config.batch_processing_enabled,
            interval_ms: config.batch_interval_ms.max(1),
            size: config.batch_size.max(1),
        };
        Self {
            config,
            server_url,
            model_name,
            client: Client::new(),
            segment_tx,
            segment_rx: Arc::new(Mutex::new(segment_rx)),
            result_sender,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            batch: Arc::new(StdMutex::new(batch)),
            pending: Arc::new(StdMutex::new(VecDeque::new())),
            batch_handle: Mutex::new(None),
        }
    }

    /// Enable or disable batch coalescing and set its interval/size. Takes
    /// effect immediately: segments already queued in `pending` are released
    /// by the running batch timer on its next tick once `enabled` is true.
    pub fn set_batch_processing(&self, enabled: bool, interval_ms: u64, size: u32) {
        let mut batch = self.batch.lock().unwrap();
        batch.enabled = enabled;
        batch.interval_ms = interval_ms.max(1);
        batch.size = size.max(1);
    }

    pub fn add_segment(&self, segment: AudioSegment) {
        if self.batch.lock().unwrap().enabled {
            self.pending.lock().unwrap().push_back(segment);
            return;
        }
        if self.segment_tx.send(segment).is_err() {
            warn!("openai processor: segment queue closed, dropping segment");
        }
    }

    async fn run_batch_timer(
        pending: Arc<StdMutex<VecDeque<AudioSegment>>>,
        segment_tx: mpsc::UnboundedSender<AudioSegment>,
        batch: Arc<StdMutex<BatchSettings>>,
        cancel: CancellationToken,
    ) {
        let interval_ms = batch.lock().unwrap().interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (enabled, size) = {
                        let b = batch.lock().unwrap();
                        (b.enabled, b.size as usize)
                    };
                    if !enabled {
                        continue;
                    }
                    let batch_items: Vec<AudioSegment> = {
                        let mut queue = pending.lock().unwrap();
                        let take = size.min(queue.len());
                        queue.drain(..take).collect()
                    };
                    for segment in batch_items {
                        if segment_tx.send(segment).is_err() {
                            warn!("openai processor: segment queue closed while flushing batch");
                        }
                    }
                }
            }
        }

        let remaining: Vec<AudioSegment> = pending.lock().unwrap().drain(..).collect();
        for segment in remaining {
            let _ = segment_tx.send(segment);
        }
    }

    async fn run_worker(
        worker_id: u32,
        client: Client,
        server_url: String,
        model_name: String,
        segment_rx: Arc<Mutex<mpsc::UnboundedReceiver<AudioSegment>>>,
        result_sender: mpsc::UnboundedSender<(String, Instant)>,
        cancel: CancellationToken,
    ) {
        loop {
            let segment = {
                let mut rx = segment_rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    segment = rx.recv() => segment,
                }
            };
            let Some(segment) = segment else {
                debug!("openai worker {} shutting down", worker_id);
                return;
            };

            match upload_with_retry(&client, &server_url, &model_name, &segment).await {
                Ok(text) => {
                    let payload = json!({
                        "text": text,
                        "sequence": segment.sequence_number,
                        "is_last": segment.is_last,
                        "filename": segment.file_path.file_name().and_then(|n| n.to_str()),
                    })
                    .to_string();
                    let _ = result_sender.send((payload, Instant::now()));
                }
                Err(e) => {
                    error!(
                        "openai worker {} failed segment {}: {}",
                        worker_id, segment.sequence_number, e
                    );
                }
            }
        }
    }
}

#[async_trait]
impl RecognitionBackend for ParallelOpenAIProcessor {
    async fn start(&self) -> anyhow::Result<()> {
        let worker_count = self.config.max_parallel_requests.clamp(1, 20);
        let mut workers = self.workers.lock().await;
        for id in 0..worker_count {
            let handle = tokio::spawn(Self::run_worker(
                id,
                self.client.clone(),
                self.server_url.clone(),
                self.model_name.clone(),
                self.segment_rx.clone(),
                self.result_sender.clone(),
                self.cancel.clone(),
            ));
            workers.push(handle);
        }
        info!("openai processor started with {} workers", worker_count);

        let batch_handle = tokio::spawn(Self::run_batch_timer(
            self.pending.clone(),
            self.segment_tx.clone(),
            self.batch.clone(),
            self.cancel.clone(),
        ));
        *self.batch_handle.lock().await = Some(batch_handle);

        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("openai worker did not shut down within grace period");
            }
        }
        if let Some(handle) = self.batch_handle.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("openai batch timer did not shut down within grace period");
            }
        }
        Ok(())
    }

    async fn dispatch(&self, segment: AudioSegment) -> anyhow::Result<()> {
        self.add_segment(segment);
        Ok(())
    }
}

fn normalize_server_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/transcribe") {
        trimmed.to_string()
    } else {
        format!("{}/transcribe", trimmed)
    }
}

async fn upload_with_retry(
    client: &Client,
    server_url: &str,
    model_name: &str,
    segment: &AudioSegment,
) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(&segment.file_path).await?;

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=RETRY_ATTEMPTS {
        let part = reqwest::multipart::Part::bytes(bytes.clone())
            .file_name("segment.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model_name.to_string())
            .text("sequence", segment.sequence_number.to_string());

        let response = client.post(server_url).multipart(form).send().await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return parse_transcribe_response(resp).await;
                }
                if status.as_u16() == 400 {
                    return Err(PipelineError::RecognitionProtocol(format!(
                        "malformed multipart request (400): segment {}",
                        segment.sequence_number
                    ))
                    .into());
                }
                last_err = Some(
                    PipelineError::RecognitionTransport(format!(
                        "server returned {} (attempt {}/{})",
                        status, attempt, RETRY_ATTEMPTS
                    ))
                    .into(),
                );
            }
            Err(e) => {
                last_err = Some(
                    PipelineError::RecognitionTransport(format!(
                        "network error (attempt {}/{}): {}",
                        attempt, RETRY_ATTEMPTS, e
                    ))
                    .into(),
                );
            }
        }

        if attempt < RETRY_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    Err(last_err.unwrap_or_else(|| {
        PipelineError::RecognitionTransport("exhausted retries".into()).into()
    }))
}

async fn parse_transcribe_response(response: reqwest::Response) -> anyhow::Result<String> {
    let body = response.text().await?;
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => Ok(value
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or(&body)
            .to_string()),
        Err(_) => Ok(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_appends_transcribe_path() {
        assert_eq!(
            normalize_server_url("http://localhost:9000"),
            "http://localhost:9000/transcribe"
        );
        assert_eq!(
            normalize_server_url("http://localhost:9000/transcribe"),
            "http://localhost:9000/transcribe"
        );
        assert_eq!(
            normalize_server_url("http://localhost:9000/"),
            "http://localhost:9000/transcribe"
        );
    }

    fn test_segment(sequence_number: u64) -> AudioSegment {
        AudioSegment {
            file_path: std::path::PathBuf::from(format!("segment_{}.wav", sequence_number)),
            sequence_number,
            timestamp: Instant::now(),
            duration_ms: 0.0,
            is_last: false,
            has_overlap: false,
            overlap_ms: 0,
        }
    }

    #[tokio::test]
    async fn add_segment_bypasses_queue_when_batching_disabled() {
        let config = ProcessorConfig {
            max_parallel_requests: 1,
            batch_processing_enabled: false,
            batch_interval_ms: 500,
            batch_size: 4,
        };
        let (result_tx, _result_rx) = mpsc::unbounded_channel();
        let processor =
            ParallelOpenAIProcessor::new(config, "http://localhost:0".into(), "test-model".into(), result_tx);

        processor.add_segment(test_segment(0));
        assert_eq!(processor.pending.lock().unwrap().len(), 0);

        let mut rx = processor.segment_rx.lock().await;
        let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(received.is_ok());
    }

    #[tokio::test]
    async fn batch_timer_releases_up_to_size_per_tick_and_flushes_on_shutdown() {
        let config = ProcessorConfig {
            max_parallel_requests: 1,
            batch_processing_enabled: true,
            batch_interval_ms: 20,
            batch_size: 2,
        };
        let (result_tx, _result_rx) = mpsc::unbounded_channel();
        let processor =
            ParallelOpenAIProcessor::new(config, "http://localhost:0".into(), "test-model".into(), result_tx);

        processor.add_segment(test_segment(0));
        processor.add_segment(test_segment(1));
        processor.add_segment(test_segment(2));
        assert_eq!(processor.pending.lock().unwrap().len(), 3);

        let batch_handle = tokio::spawn(ParallelOpenAIProcessor::run_batch_timer(
            processor.pending.clone(),
            processor.segment_tx.clone(),
            processor.batch.clone(),
            processor.cancel.clone(),
        ));

        // One tick releases `size` (2) segments; the rest is flushed once cancelled.
        tokio::time::sleep(Duration::from_millis(50)).await;
        processor.cancel.cancel();
        batch_handle.await.unwrap();

        assert_eq!(processor.pending.lock().unwrap().len(), 0);

        let mut rx = processor.segment_rx.lock().await;
        let mut received = 0;
        while tokio::time::timeout(Duration::from_millis(10), rx.recv())
            .await
            .is_ok_and(|segment| segment.is_some())
        {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[test]
    fn set_batch_processing_updates_settings() {
        let config = ProcessorConfig::default();
        let (result_tx, _result_rx) = mpsc::unbounded_channel();
        let processor =
            ParallelOpenAIProcessor::new(config, "http://localhost:0".into(), "test-model".into(), result_tx);

        processor.set_batch_processing(true, 250, 8);
        let batch = processor.batch.lock().unwrap();
        assert!(batch.enabled);
        assert_eq!(batch.interval_ms, 250);
        assert_eq!(batch.size, 8);
    }
}
