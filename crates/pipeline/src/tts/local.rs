//! Local speech with start-deadline nudging
//!
//! Some on-device engines accept an utterance and never begin speaking it.
//! [`LocalSpeaker::speak`] waits a bounded time for
//! [`UtteranceEvent::Started`]; if it does not arrive the engine is
//! cancelled and the utterance resubmitted, up to `max_nudges` times.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use avatar_config::SpeechConfig;
use avatar_core::{LocalSpeechEngine, SpeechEngineError, StartCallback, Utterance, UtteranceEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NudgePolicy {
    pub start_deadline: Duration,
    pub max_nudges: u32,
    /// Pause between cancel and resubmit
    pub resubmit_delay: Duration,
}

impl Default for NudgePolicy {
    fn default() -> Self {
        Self::from(&SpeechConfig::default())
    }
}

impl From<&SpeechConfig> for NudgePolicy {
    fn from(config: &SpeechConfig) -> Self {
        Self {
            start_deadline: Duration::from_millis(config.local_start_deadline_ms),
            max_nudges: config.local_max_nudges,
            resubmit_delay: Duration::from_millis(50),
        }
    }
}

/// How a local utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOutcome {
    Finished,
    /// Cancelled by a newer request; a normal end, not an error
    Interrupted,
}

pub struct LocalSpeaker {
    engine: Arc<dyn LocalSpeechEngine>,
    policy: NudgePolicy,
}

impl LocalSpeaker {
    pub fn new(engine: Arc<dyn LocalSpeechEngine>, policy: NudgePolicy) -> Self {
        Self { engine, policy }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_available()
    }

    pub fn cancel(&self) {
        self.engine.cancel();
    }

    /// Speak `utterance`, invoking `on_start` once the engine reports it began
    pub async fn speak(
        &self,
        utterance: Utterance,
        on_start: StartCallback,
    ) -> Result<LocalOutcome, SpeechEngineError> {
        if !self.engine.is_available() {
            return Err(SpeechEngineError::Unavailable);
        }

        let mut events = self.submit_until_started(utterance).await?;
        on_start();

        loop {
            match events.recv().await {
                Some(UtteranceEvent::Ended) => return Ok(LocalOutcome::Finished),
                Some(UtteranceEvent::Interrupted) => return Ok(LocalOutcome::Interrupted),
                Some(UtteranceEvent::Failed(reason)) => {
                    return Err(SpeechEngineError::Rejected(reason))
                }
                Some(UtteranceEvent::Started) => continue,
                None => {
                    return Err(SpeechEngineError::Rejected(
                        "engine dropped the utterance".into(),
                    ))
                }
            }
        }
    }

    async fn submit_until_started(
        &self,
        utterance: Utterance,
    ) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, SpeechEngineError> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut events = self.engine.submit(utterance.clone())?;

            match tokio::time::timeout(self.policy.start_deadline, events.recv()).await {
                Ok(Some(UtteranceEvent::Started)) => return Ok(events),
                // ended or interrupted before a start was seen
                Ok(Some(event @ (UtteranceEvent::Ended | UtteranceEvent::Interrupted))) => {
                    return Ok(single_event_receiver(event))
                }
                Ok(Some(UtteranceEvent::Failed(reason))) => {
                    return Err(SpeechEngineError::Rejected(reason))
                }
                Ok(None) => {
                    return Err(SpeechEngineError::Rejected(
                        "engine dropped the utterance".into(),
                    ))
                }
                Err(_) if attempts > self.policy.max_nudges => {
                    self.engine.cancel();
                    tracing::warn!(attempts, "Local speech never started, giving up");
                    return Err(SpeechEngineError::NeverStarted { attempts });
                }
                Err(_) => {
                    tracing::warn!(
                        attempt = attempts,
                        deadline_ms = self.policy.start_deadline.as_millis() as u64,
                        "Local speech did not start, nudging engine"
                    );
                    self.engine.cancel();
                    tokio::time::sleep(self.policy.resubmit_delay).await;
                }
            }
        }
    }
}

fn single_event_receiver(event: UtteranceEvent) -> mpsc::UnboundedReceiver<UtteranceEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(event);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scripted behaviour for each submitted utterance
    #[derive(Clone)]
    enum Script {
        /// Accept but never start
        Stall,
        Speak(Duration),
        Fail,
    }

    struct MockEngine {
        scripts: Mutex<VecDeque<Script>>,
        submits: AtomicU32,
        cancels: AtomicU32,
        available: AtomicBool,
    }

    impl MockEngine {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                submits: AtomicU32::new(0),
                cancels: AtomicU32::new(0),
                available: AtomicBool::new(true),
            })
        }
    }

    impl LocalSpeechEngine for MockEngine {
        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn submit(
            &self,
            _utterance: Utterance,
        ) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, SpeechEngineError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().pop_front().unwrap_or(Script::Stall);
            let (tx, rx) = mpsc::unbounded_channel();
            match script {
                Script::Stall => {
                    // keep the sender alive so the receiver stays pending
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        drop(tx);
                    });
                }
                Script::Speak(duration) => {
                    tokio::spawn(async move {
                        let _ = tx.send(UtteranceEvent::Started);
                        tokio::time::sleep(duration).await;
                        let _ = tx.send(UtteranceEvent::Ended);
                    });
                }
                Script::Fail => {
                    let _ = tx.send(UtteranceEvent::Failed("synthesis-failed".into()));
                }
            }
            Ok(rx)
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy() -> NudgePolicy {
        NudgePolicy {
            start_deadline: Duration::from_millis(500),
            max_nudges: 2,
            resubmit_delay: Duration::from_millis(50),
        }
    }

    fn started_flag() -> (Arc<AtomicBool>, StartCallback) {
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        (flag, Box::new(move || f.store(true, Ordering::SeqCst)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaks_normally() {
        let engine = MockEngine::new(vec![Script::Speak(Duration::from_secs(2))]);
        let speaker = LocalSpeaker::new(engine.clone(), policy());
        let (started, on_start) = started_flag();

        let outcome = speaker.speak(Utterance::new("hola"), on_start).await;
        assert_eq!(outcome, Ok(LocalOutcome::Finished));
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(engine.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nudges_stalled_engine() {
        let engine = MockEngine::new(vec![
            Script::Stall,
            Script::Speak(Duration::from_millis(300)),
        ]);
        let speaker = LocalSpeaker::new(engine.clone(), policy());
        let (started, on_start) = started_flag();

        let outcome = speaker.speak(Utterance::new("hola"), on_start).await;
        assert_eq!(outcome, Ok(LocalOutcome::Finished));
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(engine.submits.load(Ordering::SeqCst), 2);
        assert_eq!(engine.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_nudges() {
        let engine = MockEngine::new(vec![Script::Stall, Script::Stall, Script::Stall]);
        let speaker = LocalSpeaker::new(engine.clone(), policy());
        let (started, on_start) = started_flag();

        let outcome = speaker.speak(Utterance::new("hola"), on_start).await;
        assert_eq!(outcome, Err(SpeechEngineError::NeverStarted { attempts: 3 }));
        assert!(!started.load(Ordering::SeqCst));
        assert_eq!(engine.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_failure_is_reported() {
        let engine = MockEngine::new(vec![Script::Fail]);
        let speaker = LocalSpeaker::new(engine, policy());
        let (_, on_start) = started_flag();
        assert_eq!(
            speaker.speak(Utterance::new("hola"), on_start).await,
            Err(SpeechEngineError::Rejected("synthesis-failed".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_engine() {
        let engine = MockEngine::new(vec![]);
        engine.available.store(false, Ordering::SeqCst);
        let speaker = LocalSpeaker::new(engine.clone(), policy());
        let (_, on_start) = started_flag();
        assert_eq!(
            speaker.speak(Utterance::new("hola"), on_start).await,
            Err(SpeechEngineError::Unavailable)
        );
        assert_eq!(engine.submits.load(Ordering::SeqCst), 0);
    }
}
