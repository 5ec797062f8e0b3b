//! Analysis subsystem — orchestrates one analysis session
//!
//! Flow: look up the captured chain record for a key, build the prompt,
//! stream the model's answer, and push updates to the rendering sink. Each
//! delta re-sends the **full accumulated text** — downstream rendering is an
//! idempotent re-render, not an incremental append. Terminal failures carry
//! whatever partial output had accumulated.
//!
//! At most one session is live; starting a new one aborts the previous task,
//! which drops its delta stream and thereby the transport connection.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tracelens_core::models::{AnalysisSession, SessionState};
use tracelens_core::{
    build_prompt, AnalysisBackend, ChatError, FormatError, PromptOutcome, TraceCorrelator,
};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("No captured chain record for key {0}")]
    UnknownChain(String),

    #[error("Chain record holds no usable step data")]
    EmptyChain,

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

/// Updates pushed to the rendering sink.
#[derive(Debug, Clone)]
pub enum AnalysisUpdate {
    /// Session metadata, sent once before any other update.
    Started { session: AnalysisSession },
    /// Full accumulated text so far.
    Progress { text: String },
    /// Final text plus the prompt that produced it.
    Done { text: String, prompt: String },
    /// Terminal failure; accumulated partial output is preserved.
    Failed { message: String, partial: String },
}

/// Run one analysis session to its terminal state, pushing updates into the
/// sink channel. A closed sink means the consumer went away; the session
/// stops quietly (dropping the stream aborts the transport).
pub async fn run_analysis(
    mut session: AnalysisSession,
    correlator: Arc<TraceCorrelator>,
    backend: Arc<dyn AnalysisBackend>,
    updates: mpsc::Sender<AnalysisUpdate>,
) {
    tracing::info!(
        session = %session.id,
        chain_key = %session.chain_key,
        categories = ?session.categories,
        "Starting analysis session"
    );

    if updates
        .send(AnalysisUpdate::Started {
            session: session.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    match drive(&mut session, correlator, backend, &updates).await {
        Ok(true) => {
            session.state = SessionState::Done;
            tracing::info!(session = %session.id, bytes = session.accumulated.len(), "Analysis complete");
            let _ = updates
                .send(AnalysisUpdate::Done {
                    text: session.accumulated.clone(),
                    prompt: session.prompt_text.clone().unwrap_or_default(),
                })
                .await;
        }
        Ok(false) => {
            tracing::debug!(session = %session.id, "Analysis sink closed, session abandoned");
        }
        Err(e) => {
            session.state = SessionState::Failed;
            tracing::error!(session = %session.id, error = %e, "Analysis failed");
            let _ = updates
                .send(AnalysisUpdate::Failed {
                    message: e.to_string(),
                    partial: session.accumulated.clone(),
                })
                .await;
        }
    }
}

/// Returns Ok(true) on normal completion, Ok(false) when the sink closed
/// mid-stream.
async fn drive(
    session: &mut AnalysisSession,
    correlator: Arc<TraceCorrelator>,
    backend: Arc<dyn AnalysisBackend>,
    updates: &mpsc::Sender<AnalysisUpdate>,
) -> Result<bool, AnalysisError> {
    let raw = correlator
        .lookup(&session.chain_key)
        .ok_or_else(|| AnalysisError::UnknownChain(session.chain_key.clone()))?;

    let prompt = match build_prompt(&raw, &session.categories)? {
        PromptOutcome::Prompt(prompt) => prompt,
        PromptOutcome::EmptyChain => return Err(AnalysisError::EmptyChain),
    };
    session.prompt_text = Some(prompt.clone());

    let mut stream = backend.stream_analysis(&prompt).await?;
    session.state = SessionState::Streaming;

    while let Some(event) = stream.next().await {
        let delta = event?;
        session.accumulated.push_str(&delta);
        let update = AnalysisUpdate::Progress {
            text: session.accumulated.clone(),
        };
        if updates.send(update).await.is_err() {
            return Ok(false);
        }
    }

    Ok(true)
}

// ============================================================================
// Session registry
// ============================================================================

struct LiveSession {
    id: Uuid,
    chain_key: String,
    handle: JoinHandle<()>,
}

/// Single-slot registry enforcing the one-live-session rule. Replacing the
/// slot aborts the previous task (cancel-and-replace).
#[derive(Default)]
pub struct SessionRegistry {
    live: Mutex<Option<LiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, id: Uuid, chain_key: String, handle: JoinHandle<()>) {
        let mut slot = self.live.lock().expect("session registry poisoned");
        if let Some(previous) = slot.take() {
            tracing::info!(
                previous = %previous.id,
                chain_key = %previous.chain_key,
                "Replacing in-flight analysis session"
            );
            previous.handle.abort();
        }
        *slot = Some(LiveSession {
            id,
            chain_key,
            handle,
        });
    }

    /// (id, chain key) of the live session, if any.
    pub fn current(&self) -> Option<(Uuid, String)> {
        self.live
            .lock()
            .expect("session registry poisoned")
            .as_ref()
            .map(|live| (live.id, live.chain_key.clone()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tracelens_core::DeltaStream;

    /// Backend that replays a scripted event sequence.
    struct ScriptedBackend {
        events: Mutex<Option<Vec<Result<String, ChatError>>>>,
    }

    impl ScriptedBackend {
        fn new(events: Vec<Result<String, ChatError>>) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Some(events)),
            })
        }
    }

    #[async_trait]
    impl AnalysisBackend for ScriptedBackend {
        async fn stream_analysis(&self, _prompt: &str) -> Result<DeltaStream, ChatError> {
            let events = self
                .events
                .lock()
                .unwrap()
                .take()
                .expect("scripted backend exhausted");
            Ok(DeltaStream::from_results(events))
        }
    }

    fn correlator_with_record(guid: &str, record: &str) -> Arc<TraceCorrelator> {
        let correlator = TraceCorrelator::new("/api/trace/detail", "/api/trace/search");
        correlator.record_detail(
            &format!(r#"{{"condition":{{"guid":"{guid}"}}}}"#),
            200,
            record,
        );
        Arc::new(correlator)
    }

    fn chain_record() -> &'static str {
        r#"{"data":[{"appName":"svc","requestTime":"2024-05-01 12:00:00","result":0}]}"#
    }

    async fn collect_updates(
        guid: &str,
        categories: Vec<String>,
        correlator: Arc<TraceCorrelator>,
        backend: Arc<dyn AnalysisBackend>,
    ) -> Vec<AnalysisUpdate> {
        let (tx, mut rx) = mpsc::channel(32);
        let session = AnalysisSession::new(guid, categories);
        run_analysis(session, correlator, backend, tx).await;

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn progress_carries_cumulative_text_and_ends_done() {
        let backend = ScriptedBackend::new(vec![Ok("Hi".to_string()), Ok(" there".to_string())]);
        let updates = collect_updates(
            "g1",
            Vec::new(),
            correlator_with_record("g1", chain_record()),
            backend,
        )
        .await;

        assert!(matches!(updates[0], AnalysisUpdate::Started { .. }));
        let progress: Vec<&str> = updates
            .iter()
            .filter_map(|u| match u {
                AnalysisUpdate::Progress { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec!["Hi", "Hi there"]);

        match updates.last().unwrap() {
            AnalysisUpdate::Done { text, prompt } => {
                assert_eq!(text, "Hi there");
                assert!(prompt.contains("### Analysis Report"));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_chain_fails_without_contacting_the_backend() {
        let backend = ScriptedBackend::new(vec![Ok("never".to_string())]);
        let correlator = Arc::new(TraceCorrelator::new("/d", "/s"));
        let updates = collect_updates("missing", Vec::new(), correlator, backend.clone()).await;

        match updates.last().unwrap() {
            AnalysisUpdate::Failed { message, partial } => {
                assert!(message.contains("missing"));
                assert!(partial.is_empty());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        // The scripted events were never consumed.
        assert!(backend.events.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_chain_short_circuits_without_contacting_the_backend() {
        let backend = ScriptedBackend::new(vec![Ok("never".to_string())]);
        let correlator = correlator_with_record("g1", r#"{"data":[]}"#);
        let updates = collect_updates("g1", Vec::new(), correlator, backend.clone()).await;

        assert!(matches!(
            updates.last().unwrap(),
            AnalysisUpdate::Failed { .. }
        ));
        assert!(backend.events.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn stream_error_preserves_partial_output() {
        let backend = ScriptedBackend::new(vec![
            Ok("partial".to_string()),
            Err(ChatError::Decode {
                fragment: "{bad".to_string(),
                source: serde_json::from_str::<serde_json::Value>("{bad").unwrap_err(),
            }),
        ]);
        let updates = collect_updates(
            "g1",
            Vec::new(),
            correlator_with_record("g1", chain_record()),
            backend,
        )
        .await;

        match updates.last().unwrap() {
            AnalysisUpdate::Failed { message, partial } => {
                assert!(message.contains("{bad"));
                assert_eq!(partial, "partial");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn category_filter_reaches_the_prompt() {
        let backend = ScriptedBackend::new(vec![Ok("done".to_string())]);
        let updates = collect_updates(
            "g1",
            vec!["X".to_string(), "Y".to_string()],
            correlator_with_record("g1", chain_record()),
            backend,
        )
        .await;

        match updates.last().unwrap() {
            AnalysisUpdate::Done { prompt, .. } => {
                assert!(prompt.contains("\"X\""));
                assert!(prompt.contains("\"Y\""));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn registry_replace_aborts_the_previous_task() {
        let registry = SessionRegistry::new();

        let first = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        let second = tokio::spawn(async {});

        let first_id = Uuid::new_v4();
        registry.replace(first_id, "g1".to_string(), first);
        let (current, _) = registry.current().unwrap();
        assert_eq!(current, first_id);

        let second_id = Uuid::new_v4();
        registry.replace(second_id, "g2".to_string(), second);
        let (current, key) = registry.current().unwrap();
        assert_eq!(current, second_id);
        assert_eq!(key, "g2");
    }
}
