//! Speech Orchestrator
//!
//! Resolves one speak request to exactly one audible stream:
//!
//! - **Catalog**: a resolvable clip id plays its recording. No text-to-speech
//!   is attempted for that request.
//! - **Text-to-speech**: cloud first (configured, breaker closed, retried),
//!   then the local engine. When neither produces audio the request resolves
//!   silently.
//!
//! Every `speak` and `stop` advances a generation counter. Work belonging to
//! an older generation is abandoned at its next await point and never
//! touches state again.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use avatar_config::{is_valid_catalog_id, PreferredProvider, Settings};
use avatar_core::{
    AppEvent, AudioPlayer, AudioSource, BackendKind, Catalog, CatalogEntry, CloudSpeechProvider,
    CloudTtsError, EventBus, LocalSpeechEngine, PlaybackOutcome, Segment, StartCallback,
    StatePatch, StateStore, Utterance,
};

use crate::lipsync::{LipSyncDriver, LipSyncSettings};
use crate::resilience::{
    with_retry, BreakerError, BreakerPolicy, BreakerStats, CircuitBreaker, RetryPolicy,
};
use crate::script::SpeechScript;
use crate::subtitles::SubtitleDriver;
use crate::tts::{LocalOutcome, LocalSpeaker, NudgePolicy};
use crate::PipelineError;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub breaker: BreakerPolicy,
    pub retry: RetryPolicy,
    pub nudge: NudgePolicy,
    /// Fall back to the local engine when the cloud cannot serve a request
    pub local_fallback_enabled: bool,
    pub preferred_provider: PreferredProvider,
    pub local_voice: Option<String>,
    /// Speaking-rate estimate for free-text pause offsets
    pub ms_per_char: u64,
    pub volume: f32,
    pub lip_sync: LipSyncSettings,
    pub subtitle_tick: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            breaker: BreakerPolicy::from(&settings.breaker),
            retry: RetryPolicy::from(&settings.retry),
            nudge: NudgePolicy::from(&settings.speech),
            local_fallback_enabled: settings.speech.local_fallback_enabled,
            preferred_provider: settings.speech.preferred_provider,
            local_voice: settings.speech.local_voice.clone(),
            ms_per_char: settings.speech.ms_per_char,
            volume: settings.speech.volume,
            lip_sync: LipSyncSettings::from(&settings.lip_sync),
            subtitle_tick: Duration::from_millis(settings.subtitles.tick_ms),
        }
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(PipelineError::Config(format!(
                "volume must be within [0, 1], got {}",
                self.volume
            )));
        }
        if self.lip_sync.shape_count < 2 {
            return Err(PipelineError::Config(
                "lip-sync needs at least two mouth shapes".into(),
            ));
        }
        if self.lip_sync.tick.is_zero() || self.subtitle_tick.is_zero() {
            return Err(PipelineError::Config("tick intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// One speak intent; a resolvable `catalog_id` wins over `text`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakRequest {
    pub text: Option<String>,
    pub catalog_id: Option<String>,
}

impl SpeakRequest {
    pub fn new(text: Option<String>, catalog_id: Option<String>) -> Self {
        Self { text, catalog_id }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            catalog_id: None,
        }
    }

    pub fn clip(id: impl Into<String>) -> Self {
        Self {
            text: None,
            catalog_id: Some(id.into()),
        }
    }
}

/// How a speak request resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Played to the end on this backend
    Completed(BackendKind),
    /// Superseded by `stop()` or a newer request
    Cancelled,
    /// Nothing to say, or no backend could say it
    Silent,
    /// Catalog playback failed
    Failed(BackendKind),
}

enum Plan {
    Clip { entry: CatalogEntry, uri: String },
    Speech {
        script: SpeechScript,
        /// Recorded catalog text; its segments drive subtitles
        from_catalog: bool,
    },
    Nothing,
}

enum Attempt {
    Completed,
    Cancelled,
    Failed(String),
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    catalog: Arc<Catalog>,
    store: Arc<StateStore>,
    bus: EventBus,
    player: Arc<dyn AudioPlayer>,
    cloud: Option<Arc<dyn CloudSpeechProvider>>,
    local: Option<Arc<dyn LocalSpeechEngine>>,
}

impl OrchestratorBuilder {
    pub fn cloud(mut self, provider: Arc<dyn CloudSpeechProvider>) -> Self {
        self.cloud = Some(provider);
        self
    }

    pub fn local(mut self, engine: Arc<dyn LocalSpeechEngine>) -> Self {
        self.local = Some(engine);
        self
    }

    pub fn build(self) -> Result<SpeechOrchestrator, PipelineError> {
        self.config.validate()?;

        let breaker = CircuitBreaker::new("cloud-tts", self.config.breaker);
        breaker.set_observer(|new, old, stats| {
            tracing::info!(
                from = %old,
                to = %new,
                failures = stats.failures,
                "Cloud speech breaker transition"
            );
        });
        self.player.set_volume(self.config.volume);

        let (generation, _) = watch::channel(0u64);
        let lipsync = LipSyncDriver::new(self.config.lip_sync);
        let subtitles = SubtitleDriver::new(self.config.subtitle_tick);
        let local = self
            .local
            .map(|engine| LocalSpeaker::new(engine, self.config.nudge));

        Ok(SpeechOrchestrator {
            inner: Arc::new(Inner {
                volume: Mutex::new(self.config.volume),
                preferred: Mutex::new(self.config.preferred_provider),
                config: self.config,
                catalog: self.catalog,
                store: self.store,
                bus: self.bus,
                player: self.player,
                cloud: self.cloud,
                local,
                breaker,
                lipsync,
                subtitles,
                generation,
                last_backend: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}

struct Inner {
    config: OrchestratorConfig,
    catalog: Arc<Catalog>,
    store: Arc<StateStore>,
    bus: EventBus,
    player: Arc<dyn AudioPlayer>,
    cloud: Option<Arc<dyn CloudSpeechProvider>>,
    local: Option<LocalSpeaker>,
    breaker: CircuitBreaker,
    lipsync: LipSyncDriver,
    subtitles: SubtitleDriver,
    generation: watch::Sender<u64>,
    volume: Mutex<f32>,
    preferred: Mutex<PreferredProvider>,
    last_backend: Mutex<Option<BackendKind>>,
    destroyed: AtomicBool,
}

/// Speech orchestrator handle; clones share one orchestrator
#[derive(Clone)]
pub struct SpeechOrchestrator {
    inner: Arc<Inner>,
}

impl SpeechOrchestrator {
    pub fn builder(
        config: OrchestratorConfig,
        catalog: Arc<Catalog>,
        store: Arc<StateStore>,
        bus: EventBus,
        player: Arc<dyn AudioPlayer>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            catalog,
            store,
            bus,
            player,
            cloud: None,
            local: None,
        }
    }

    /// Start speaking `request`
    ///
    /// Cancelling the current speech, the generation bump and
    /// `isSpeaking = true` happen before this returns, so requests take
    /// effect in call order. The returned future drives playback and must be
    /// polled (usually spawned) for the request to make progress.
    pub fn speak(&self, request: SpeakRequest) -> BoxFuture<'static, SpeakOutcome> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return futures::future::ready(SpeakOutcome::Silent).boxed();
        }

        if self.inner.store.is_speaking() {
            self.stop();
        }
        let generation = self.inner.advance_generation();
        self.inner.store.update(StatePatch::new().speaking(true));

        let plan = self.inner.plan(request);
        let inner = Arc::clone(&self.inner);
        async move { inner.run(generation, plan).await }.boxed()
    }

    /// Halt whatever is speaking; a no-op when idle
    pub fn stop(&self) {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        self.inner.advance_generation();
        self.inner.halt_backends();
        self.inner.lipsync.stop();
        self.inner.subtitles.stop();
        if self.inner.store.is_speaking() {
            self.inner.store.update(StatePatch::new().speaking(false));
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.store.is_speaking()
    }

    /// Backend that finished the most recent completed request
    pub fn last_used_backend(&self) -> Option<BackendKind> {
        *self.inner.last_backend.lock()
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        *self.inner.volume.lock() = volume;
        self.inner.player.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        *self.inner.volume.lock()
    }

    pub fn set_preferred_provider(&self, provider: PreferredProvider) {
        *self.inner.preferred.lock() = provider;
    }

    pub fn preferred_provider(&self) -> PreferredProvider {
        *self.inner.preferred.lock()
    }

    pub fn cloud_breaker_stats(&self) -> BreakerStats {
        self.inner.breaker.stats()
    }

    pub fn reset_cloud_breaker(&self) {
        self.inner.breaker.force_reset();
    }

    /// Ask the player to warm its cache with every catalog clip
    pub fn preload_catalog(&self) {
        let uris = self.inner.catalog.audio_uris();
        tracing::debug!(clips = uris.len(), "Preloading catalog audio");
        self.inner.player.preload(&uris);
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    pub fn lip_sync(&self) -> watch::Receiver<u8> {
        self.inner.lipsync.subscribe()
    }

    pub fn subtitles(&self) -> watch::Receiver<String> {
        self.inner.subtitles.subscribe()
    }

    /// Show a fixed subtitle line, e.g. chat text from the remote peer
    pub fn show_subtitle(&self, text: impl Into<String>) {
        if !self.inner.destroyed.load(Ordering::Acquire) {
            self.inner.subtitles.show_static(text);
        }
    }

    /// Stop speaking and release timers; every later call is a no-op
    pub fn destroy(&self) {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        self.stop();
        self.inner.destroyed.store(true, Ordering::Release);
        self.inner.breaker.destroy();
        tracing::debug!("Speech orchestrator destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl Inner {
    fn advance_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            next = *g;
        });
        next
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation
    }

    /// Resolves once `generation` is no longer the current one
    async fn superseded(&self, generation: u64) {
        let mut rx = self.generation.subscribe();
        loop {
            if *rx.borrow_and_update() != generation {
                return;
            }
            if rx.changed().await.is_err() {
                // sender lives as long as `self`
                std::future::pending::<()>().await;
            }
        }
    }

    fn halt_backends(&self) {
        self.player.stop();
        if let Some(local) = &self.local {
            local.cancel();
        }
    }

    fn plan(&self, request: SpeakRequest) -> Plan {
        let SpeakRequest { text, catalog_id } = request;

        if let Some(id) = catalog_id.filter(|id| !id.is_empty()) {
            let entry = if is_valid_catalog_id(&id) {
                self.catalog.get(&id)
            } else {
                tracing::warn!(clip = %id, "Malformed clip id");
                None
            };
            match entry {
                Some(entry) => {
                    return match entry.audio_uri.clone().filter(|uri| !uri.is_empty()) {
                        Some(uri) => Plan::Clip {
                            entry: entry.clone(),
                            uri,
                        },
                        None => {
                            tracing::debug!(clip = %id, "Clip has no audio, speaking its text");
                            let script = SpeechScript::from_entry(entry);
                            if script.is_empty() {
                                Plan::Nothing
                            } else {
                                Plan::Speech {
                                    script,
                                    from_catalog: true,
                                }
                            }
                        }
                    };
                }
                None => tracing::warn!(clip = %id, "Unknown clip id"),
            }
        }

        match text {
            Some(text) => self.script_plan(&text),
            None => Plan::Nothing,
        }
    }

    fn script_plan(&self, text: &str) -> Plan {
        let script = SpeechScript::from_text(text, self.config.ms_per_char);
        if script.is_empty() {
            Plan::Nothing
        } else {
            Plan::Speech {
                script,
                from_catalog: false,
            }
        }
    }

    async fn run(self: Arc<Self>, generation: u64, plan: Plan) -> SpeakOutcome {
        match plan {
            Plan::Clip { entry, uri } => self.play_clip(generation, entry, uri).await,
            Plan::Speech {
                script,
                from_catalog,
            } => self.speak_script(generation, script, from_catalog).await,
            Plan::Nothing => {
                tracing::warn!("Speak request had nothing to say");
                self.finish_silently(generation);
                SpeakOutcome::Silent
            }
        }
    }

    async fn play_clip(
        self: &Arc<Self>,
        generation: u64,
        entry: CatalogEntry,
        uri: String,
    ) -> SpeakOutcome {
        let on_start = self.start_callback(
            generation,
            BackendKind::Catalog,
            entry.pause_offsets.clone(),
            self.captions(&entry.segments),
        );

        let result = tokio::select! {
            biased;
            _ = self.superseded(generation) => return SpeakOutcome::Cancelled,
            result = self.player.play(AudioSource::Uri(uri.clone()), on_start) => result,
        };

        match result {
            Ok(PlaybackOutcome::Finished) => {
                self.finish(generation, BackendKind::Catalog);
                SpeakOutcome::Completed(BackendKind::Catalog)
            }
            Ok(PlaybackOutcome::Cancelled) => {
                self.finish_silently(generation);
                SpeakOutcome::Cancelled
            }
            Err(e) => {
                tracing::error!(clip = %entry.id, uri = %uri, error = %e, "Clip playback failed");
                if self.is_current(generation) {
                    self.bus.emit(AppEvent::SpeechError {
                        generation,
                        backend: BackendKind::Catalog,
                        message: e.to_string(),
                    });
                }
                self.finish_silently(generation);
                SpeakOutcome::Failed(BackendKind::Catalog)
            }
        }
    }

    async fn speak_script(
        self: &Arc<Self>,
        generation: u64,
        script: SpeechScript,
        from_catalog: bool,
    ) -> SpeakOutcome {
        let mut skipped: Option<BackendKind> = None;
        let captions = if from_catalog {
            self.captions(&script.segments)
        } else {
            Vec::new()
        };

        for backend in self.cascade() {
            if !self.is_current(generation) {
                return SpeakOutcome::Cancelled;
            }
            if !self.is_ready(backend) {
                skipped.get_or_insert(backend);
                continue;
            }
            if let Some(from) = skipped {
                tracing::info!(%from, to = %backend, "Falling back to next speech backend");
                self.bus.emit(AppEvent::SpeechFallback {
                    generation,
                    from,
                    to: backend,
                });
            }

            let attempt = match backend {
                BackendKind::Cloud => self.attempt_cloud(generation, &script, &captions).await,
                BackendKind::Local => self.attempt_local(generation, &script, &captions).await,
                BackendKind::Catalog => continue,
            };

            match attempt {
                Attempt::Completed => {
                    self.finish(generation, backend);
                    return SpeakOutcome::Completed(backend);
                }
                Attempt::Cancelled => {
                    self.finish_silently(generation);
                    return SpeakOutcome::Cancelled;
                }
                Attempt::Failed(message) => {
                    if self.is_current(generation) {
                        self.bus.emit(AppEvent::SpeechError {
                            generation,
                            backend,
                            message,
                        });
                    }
                    skipped.get_or_insert(backend);
                }
            }
        }

        if !self.is_current(generation) {
            return SpeakOutcome::Cancelled;
        }
        tracing::warn!("No speech backend available, request dropped");
        self.finish_silently(generation);
        SpeakOutcome::Silent
    }

    /// Text-to-speech backends in the order they are tried
    fn cascade(&self) -> Vec<BackendKind> {
        match *self.preferred.lock() {
            PreferredProvider::Cloud if self.config.local_fallback_enabled => {
                vec![BackendKind::Cloud, BackendKind::Local]
            }
            PreferredProvider::Cloud => vec![BackendKind::Cloud],
            PreferredProvider::Local => vec![BackendKind::Local],
        }
    }

    fn is_ready(&self, backend: BackendKind) -> bool {
        match backend {
            BackendKind::Cloud => {
                let Some(cloud) = &self.cloud else {
                    return false;
                };
                if !cloud.is_configured() {
                    tracing::debug!("Cloud speech not configured, skipping");
                    return false;
                }
                if !self.breaker.is_allowed() {
                    tracing::warn!("Cloud speech breaker open, skipping");
                    return false;
                }
                true
            }
            BackendKind::Local => self.local.as_ref().is_some_and(|l| l.is_available()),
            BackendKind::Catalog => false,
        }
    }

    /// Subtitle segments for a catalog clip; empty outside presentation mode
    fn captions(&self, segments: &[Segment]) -> Vec<Segment> {
        if self.store.state().is_presentation_mode {
            segments.to_vec()
        } else {
            Vec::new()
        }
    }

    async fn attempt_cloud(
        self: &Arc<Self>,
        generation: u64,
        script: &SpeechScript,
        captions: &[Segment],
    ) -> Attempt {
        let Some(provider) = self.cloud.clone() else {
            return Attempt::Failed("cloud speech provider missing".into());
        };
        let text = script.text.as_str();
        let retry = self.config.retry;

        let synthesis = self.breaker.execute(|| {
            with_retry(
                &retry,
                |_| provider.synthesize(text),
                CloudTtsError::is_retryable,
                |e, attempt, delay| {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Cloud speech failed, retrying"
                    );
                },
            )
        });

        let result = tokio::select! {
            biased;
            _ = self.superseded(generation) => return Attempt::Cancelled,
            result = synthesis => result,
        };

        let audio = match result {
            Ok(audio) => audio,
            Err(BreakerError::Open(stats)) => {
                tracing::warn!(failures = stats.failures, "Cloud speech breaker open");
                return Attempt::Failed("circuit breaker open".into());
            }
            Err(BreakerError::Inner(e)) if e.is_client_error() => {
                tracing::error!(
                    provider = provider.name(),
                    error = %e,
                    "Cloud speech rejected the request, check credentials and voice settings"
                );
                return Attempt::Failed(e.to_string());
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(provider = provider.name(), error = %e, "Cloud speech unavailable");
                return Attempt::Failed(e.to_string());
            }
        };

        let source = AudioSource::Bytes {
            data: Arc::from(audio),
            mime: provider.mime_type().to_string(),
        };
        let on_start = self.start_callback(
            generation,
            BackendKind::Cloud,
            script.pauses.clone(),
            captions.to_vec(),
        );

        let played = tokio::select! {
            biased;
            _ = self.superseded(generation) => return Attempt::Cancelled,
            played = self.player.play(source, on_start) => played,
        };

        match played {
            Ok(PlaybackOutcome::Finished) => Attempt::Completed,
            Ok(PlaybackOutcome::Cancelled) => Attempt::Cancelled,
            Err(e) => {
                tracing::warn!(error = %e, "Cloud speech playback failed");
                Attempt::Failed(e.to_string())
            }
        }
    }

    async fn attempt_local(
        self: &Arc<Self>,
        generation: u64,
        script: &SpeechScript,
        captions: &[Segment],
    ) -> Attempt {
        let Some(local) = &self.local else {
            return Attempt::Failed("local speech engine missing".into());
        };
        let utterance = Utterance {
            text: script.text.clone(),
            voice: self.config.local_voice.clone(),
            volume: *self.volume.lock(),
            rate: 1.0,
        };
        let on_start = self.start_callback(
            generation,
            BackendKind::Local,
            script.pauses.clone(),
            captions.to_vec(),
        );

        let result = tokio::select! {
            biased;
            _ = self.superseded(generation) => return Attempt::Cancelled,
            result = local.speak(utterance, on_start) => result,
        };

        match result {
            Ok(LocalOutcome::Finished) => Attempt::Completed,
            Ok(LocalOutcome::Interrupted) => Attempt::Cancelled,
            Err(e) => {
                tracing::warn!(error = %e, "Local speech failed");
                Attempt::Failed(e.to_string())
            }
        }
    }

    /// Start animation when audio becomes audible, if still current
    fn start_callback(
        self: &Arc<Self>,
        generation: u64,
        backend: BackendKind,
        pauses: Vec<u64>,
        segments: Vec<Segment>,
    ) -> StartCallback {
        let weak = Arc::downgrade(self);
        Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.is_current(generation) {
                return;
            }
            inner.lipsync.start(&pauses);
            if !segments.is_empty() {
                inner.subtitles.start(segments);
            }
            tracing::debug!(generation, %backend, "Speech started");
            inner.bus.emit(AppEvent::SpeechStart {
                generation,
                backend,
            });
        })
    }

    fn finish(&self, generation: u64, backend: BackendKind) {
        if !self.is_current(generation) {
            return;
        }
        self.lipsync.stop();
        self.subtitles.stop();
        *self.last_backend.lock() = Some(backend);
        self.store.update(StatePatch::new().speaking(false));
        tracing::debug!(generation, %backend, "Speech finished");
        self.bus.emit(AppEvent::SpeechEnd {
            generation,
            backend,
        });
    }

    fn finish_silently(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.lipsync.stop();
        self.subtitles.stop();
        if self.store.is_speaking() {
            self.store.update(StatePatch::new().speaking(false));
        }
    }
}
