use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backends::RecognitionBackend;
use crate::config::PipelineConfig;
use crate::dedup::DedupCache;
use crate::error::PipelineError;
use crate::merger::ResultMerger;
use crate::preprocessor::AudioPreprocessor;
use crate::segment_handler::RealtimeSegmentHandler;
use crate::types::{AudioFrame, AudioSource, PipelineEvent};
use crate::vad::VoiceActivityDetector;

type EventSink = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

static LOGGING_INIT: std::sync::Once = std::sync::Once::new();

fn init_logging() {
    LOGGING_INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Thin coordinator binding one input source to a segmenter, VAD, and an
/// active recognition backend, and forwarding merged results to an
/// event sink. Exactly one recognition backend is active per session.
pub struct AudioProcessor {
    session_id: Uuid,
    config: PipelineConfig,
    preprocessor: Arc<Mutex<AudioPreprocessor>>,
    vad: Arc<Mutex<VoiceActivityDetector>>,
    segment_handler: Arc<Mutex<RealtimeSegmentHandler>>,
    backend: Arc<dyn RecognitionBackend>,
    merger: Arc<Mutex<ResultMerger>>,
    dedup: Arc<DedupCache>,
    event_sink: Mutex<Option<EventSink>>,
    running: AtomicBool,
    paused: AtomicBool,
    merge_timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioProcessor {
    pub fn new(config: PipelineConfig, backend: Arc<dyn RecognitionBackend>) -> Result<Self> {
        init_logging();
        let mut validated = config;
        validated.validate().context("invalid pipeline configuration")?;

        let session_id = Uuid::new_v4();
        let segment_handler =
            RealtimeSegmentHandler::new(validated.segmentation.segment_size_ms, None)
                .context("constructing segment handler")?;

        Ok(Self {
            session_id,
            preprocessor: Arc::new(Mutex::new(AudioPreprocessor::new(
                validated.preprocessing.clone(),
            ))),
            vad: Arc::new(Mutex::new(VoiceActivityDetector::new(validated.vad.clone()))),
            segment_handler: Arc::new(Mutex::new(segment_handler)),
            backend,
            merger: Arc::new(Mutex::new(ResultMerger::new(validated.merger.clone()))),
            dedup: Arc::new(DedupCache::new(256)),
            event_sink: Mutex::new(None),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            merge_timer_handle: Mutex::new(None),
            config: validated,
        })
    }

    pub async fn on_event(&self, callback: EventSink) {
        *self.event_sink.lock().await = Some(callback);
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(sink) = self.event_sink.lock().await.as_ref() {
            sink(event);
        }
    }

    /// Start a session for the given source. `result_rx` carries JSON text
    /// results produced by the active backend, tagged with the instant they
    /// arrived, used to drive the merger's timeout bookkeeping.
    pub async fn start_processing(
        self: &Arc<Self>,
        source: AudioSource,
        mut result_rx: mpsc::UnboundedReceiver<(String, Instant)>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::Processing("session already running".into()).into());
        }
        info!("session {} starting for source {:?}", self.session_id, source);

        self.backend.start().await?;

        {
            let mut handler = self.segment_handler.lock().await;
            let backend = self.backend.clone();
            handler.set_segment_ready_callback(Box::new(move |segment| {
                let backend = backend.clone();
                tokio::spawn(async move {
                    if let Err(e) = backend.dispatch(segment).await {
                        error!("backend dispatch failed: {}", e);
                    }
                });
            }));
            handler.start();
        }

        let processor = self.clone();
        let merge_interval_ms = self.config.merger.merge_interval_ms;
        let use_timer_merge = self.config.merger.use_timer_merge;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(merge_interval_ms));
            loop {
                tokio::select! {
                    incoming = result_rx.recv() => {
                        match incoming {
                            Some((json_text, received_at)) => {
                                let mut merger = processor.merger.lock().await;
                                merger.add_result(&json_text, received_at);
                                let output = merger.merge_and_emit(received_at);
                                drop(merger);
                                processor.emit_merge_output(output).await;
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick(), if use_timer_merge => {
                        let now = Instant::now();
                        let mut merger = processor.merger.lock().await;
                        let output = merger.merge_and_emit(now);
                        drop(merger);
                        processor.emit_merge_output(output).await;
                    }
                }
            }
        });
        *self.merge_timer_handle.lock().await = Some(handle);

        self.emit(PipelineEvent::Started).await;
        Ok(())
    }

    async fn emit_merge_output(&self, output: crate::merger::MergeOutput) {
        for line in output.text_lines {
            if self.dedup.check_and_insert(&line, "session") {
                continue;
            }
            self.emit(PipelineEvent::ResultReady { text: line.clone() }).await;
            self.emit(PipelineEvent::MergedTextReady { text: line }).await;
        }
    }

    /// Feed one captured/decoded frame through the preprocessing chain, the
    /// VAD, and into the segment handler. Non-blocking: segment emission
    /// (if any) spawns its own backend dispatch task.
    pub async fn feed_frame(&self, mut frame: AudioFrame) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }

        if !frame.is_last {
            let mut pre = self.preprocessor.lock().await;
            pre.process(&mut frame.samples, frame.sample_rate);
            drop(pre);

            let mut vad = self.vad.lock().await;
            let is_voice = vad.detect(&frame.samples);
            frame.is_silence = !is_voice;
            frame.voice_end = vad.has_voice_ended_detected();
        }

        let mut handler = self.segment_handler.lock().await;
        handler.add_buffer(frame);
    }

    pub fn pause_processing(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_processing(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub async fn stop_processing(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut handler = self.segment_handler.lock().await;
            handler.stop();
        }

        if let Err(e) = self.backend.stop().await {
            warn!("backend stop reported an error: {}", e);
        }

        if let Some(handle) = self.merge_timer_handle.lock().await.take() {
            handle.abort();
        }

        self.emit(PipelineEvent::Stopped).await;
        info!("session {} stopped", self.session_id);
        Ok(())
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::RecognitionBackend;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct NullBackend;

    #[async_trait]
    impl RecognitionBackend for NullBackend {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn dispatch(&self, _segment: crate::types::AudioSegment) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_stop_round_trip_emits_started_and_stopped() {
        let config = PipelineConfig::default();
        let processor = Arc::new(AudioProcessor::new(config, Arc::new(NullBackend)).unwrap());

        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        processor
            .on_event(Arc::new(move |event: PipelineEvent| {
                events_clone.lock().unwrap().push(format!("{:?}", event));
            }))
            .await;

        let (_tx, rx) = mpsc::unbounded_channel();
        processor
            .start_processing(
                AudioSource::Microphone { device_name: None },
                rx,
            )
            .await
            .unwrap();
        processor.stop_processing().await.unwrap();

        let captured = events.lock().unwrap();
        assert!(captured.iter().any(|e| e.contains("Started")));
        assert!(captured.iter().any(|e| e.contains("Stopped")));
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let config = PipelineConfig::default();
        let processor = Arc::new(AudioProcessor::new(config, Arc::new(NullBackend)).unwrap());
        let (_tx, rx) = mpsc::unbounded_channel();
        processor
            .start_processing(AudioSource::Microphone { device_name: None }, rx)
            .await
            .unwrap();

        let (_tx2, rx2) = mpsc::unbounded_channel();
        let second = processor
            .start_processing(AudioSource::Microphone { device_name: None }, rx2)
            .await;
        assert!(second.is_err());
        processor.stop_processing().await.unwrap();
    }
}
