use crate::engine::RecommendationEngine;
use crate::error::RecommendationError;
use crate::models::{
    BookId, FeedbackAction, FeedbackEvent, InteractionEvent, RecommendationRequest, SignalType,
    UserId,
};
use crate::services::signals::{SignalError, SignalOutcome, TrainingSignal};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// One NDJSON line of the inbound stream, tagged by `event`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    Interaction {
        user_id: UserId,
        book_id: BookId,
        signal: SignalType,
        timestamp: Option<DateTime<Utc>>,
        weight: Option<f64>,
    },
    Feedback {
        user_id: UserId,
        book_id: BookId,
        action: FeedbackAction,
        timestamp: Option<DateTime<Utc>>,
    },
    Signal(TrainingSignal),
    Refresh {
        user_id: UserId,
    },
    Recommend {
        user_id: UserId,
        #[serde(default)]
        request: RecommendationRequest,
    },
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Rejected(#[from] RecommendationError),

    #[error(transparent)]
    Signal(#[from] SignalError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub processed: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

/// What handling one line produced
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    Applied,
    Duplicate,
    /// Response line to write back
    Response(String),
}

pub struct EventConsumer {
    engine: Arc<RecommendationEngine>,
}

impl EventConsumer {
    pub fn new(engine: Arc<RecommendationEngine>) -> Self {
        Self { engine }
    }

    pub async fn handle_line(&self, line: &str) -> Result<Handled, ConsumerError> {
        let event: InboundEvent = serde_json::from_str(line)?;
        self.handle(event).await
    }

    pub async fn handle(&self, event: InboundEvent) -> Result<Handled, ConsumerError> {
        match event {
            InboundEvent::Interaction {
                user_id,
                book_id,
                signal,
                timestamp,
                weight,
            } => {
                let event = InteractionEvent {
                    book_id,
                    signal,
                    timestamp: timestamp.unwrap_or_else(Utc::now),
                    weight: weight.unwrap_or(1.0),
                };
                self.engine.apply_interaction(&user_id, event)?;
                Ok(Handled::Applied)
            }
            InboundEvent::Feedback {
                user_id,
                book_id,
                action,
                timestamp,
            } => {
                let appended = self.engine.record_feedback(FeedbackEvent {
                    user_id,
                    book_id,
                    action,
                    timestamp: timestamp.unwrap_or_else(Utc::now),
                })?;
                Ok(if appended {
                    Handled::Applied
                } else {
                    Handled::Duplicate
                })
            }
            InboundEvent::Signal(signal) => match self.engine.handle_signal(signal)? {
                SignalOutcome::Processed => Ok(Handled::Applied),
                SignalOutcome::AlreadyProcessed => Ok(Handled::Duplicate),
            },
            InboundEvent::Refresh { user_id } => {
                self.engine.refresh(&user_id)?;
                Ok(Handled::Applied)
            }
            InboundEvent::Recommend { user_id, request } => {
                let set = self.engine.recommend(&user_id, request).await?;
                Ok(Handled::Response(serde_json::to_string(set.as_ref())?))
            }
        }
    }

    /// Consume NDJSON until EOF; malformed or rejected events are logged and dropped
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<ConsumerStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut stats = ConsumerStats::default();
        let mut lines = reader.lines();

        while let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read event stream")?
        {
            if line.trim().is_empty() {
                continue;
            }

            match self.handle_line(&line).await {
                Ok(Handled::Applied) => stats.processed += 1,
                Ok(Handled::Duplicate) => {
                    stats.duplicates += 1;
                    debug!("Duplicate event absorbed");
                }
                Ok(Handled::Response(body)) => {
                    stats.processed += 1;
                    writer
                        .write_all(body.as_bytes())
                        .await
                        .context("Failed to write response")?;
                    writer
                        .write_all(b"\n")
                        .await
                        .context("Failed to write response")?;
                    writer.flush().await.context("Failed to flush response")?;
                }
                Err(e) => {
                    stats.dropped += 1;
                    warn!(error = %e, "Dropping inbound event");
                }
            }
        }

        info!(
            processed = stats.processed,
            duplicates = stats.duplicates,
            dropped = stats.dropped,
            "Event stream closed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{Book, RecommendationSet};
    use std::collections::BTreeMap;

    fn engine() -> Arc<RecommendationEngine> {
        let books = vec![Book {
            id: "b1".to_string(),
            features: BTreeMap::from([("genre:mystery".to_string(), 1.0)]),
            genre: "mystery".to_string(),
            language: "en".to_string(),
            page_count: 200,
            popularity: 3.0,
        }];
        Arc::new(RecommendationEngine::new(Config::default(), books, None))
    }

    #[test]
    fn test_event_deserialize() {
        let json = r#"{"event":"interaction","user_id":"u1","book_id":"b1","signal":"like"}"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            InboundEvent::Interaction {
                user_id: "u1".to_string(),
                book_id: "b1".to_string(),
                signal: SignalType::Like,
                timestamp: None,
                weight: None,
            }
        );

        let json = r#"{"event":"signal","event_id":"evt-9","kind":"embeddings_updated"}"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, InboundEvent::Signal(s) if s.event_id.as_deref() == Some("evt-9")));
    }

    #[tokio::test]
    async fn test_stream_processing() {
        let engine = engine();
        let consumer = EventConsumer::new(engine.clone());
        let input = [
            r#"{"event":"interaction","user_id":"u1","book_id":"b1","signal":"rate","weight":1.0}"#,
            r#"{"event":"feedback","user_id":"u1","book_id":"b1","action":"clicked","timestamp":"2024-05-01T10:00:00Z"}"#,
            r#"{"event":"feedback","user_id":"u1","book_id":"b1","action":"clicked","timestamp":"2024-05-01T10:00:00Z"}"#,
            "",
            "not json",
            r#"{"event":"interaction","user_id":"","book_id":"b1","signal":"like"}"#,
            r#"{"event":"recommend","user_id":"u2","request":{"type":"personalized","count":3}}"#,
            r#"{"event":"refresh","user_id":"u1"}"#,
        ]
        .join("\n");

        let mut output = Vec::new();
        let stats = consumer
            .run(input.as_bytes(), &mut output)
            .await
            .unwrap();

        assert_eq!(
            stats,
            ConsumerStats {
                processed: 4,
                duplicates: 1,
                dropped: 2,
            }
        );
        assert!(engine.profile("u1").interests["genre:mystery"] > 0.0);

        let response = String::from_utf8(output).unwrap();
        let set: RecommendationSet = serde_json::from_str(response.trim()).unwrap();
        assert_eq!(set.user_id, "u2");
        assert_eq!(set.book_ids(), vec!["b1"]);
    }
}
