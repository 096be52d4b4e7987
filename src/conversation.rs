//! One conversation: the in-memory turn list and the streaming turn loop.
//!
//! A turn appends the user's message and an empty assistant message, opens
//! the answer stream through the retrying executor, and mirrors every
//! aggregator snapshot into the turn list so observers see the answer grow.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::generation::aggregator::{AnswerAggregator, TurnEnd};
use crate::generation::retry::{RetryConfig, RetryingExecutor};
use crate::generation::{GenerationBackend, GenerationRequest, HistoryTurn, UserTurn};
use crate::message::{ImageAttachment, Message, Role};

const REPLY_SNIPPET_CHARS: usize = 120;

#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    pub text: String,
    pub image: Option<ImageAttachment>,
    pub reply_to: Option<Uuid>,
}

impl UserQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

pub struct Conversation {
    config: GenerationConfig,
    backend: Arc<dyn GenerationBackend>,
    executor: RetryingExecutor,
    messages: Mutex<Vec<Message>>,
    turn_lock: AsyncMutex<()>,
    active_turn: Mutex<Option<CancellationToken>>,
}

impl Conversation {
    pub fn new(config: GenerationConfig, intro_greeting: &str, backend: Arc<dyn GenerationBackend>) -> Self {
        let executor = RetryingExecutor::new(RetryConfig {
            max_retries: config.max_retries,
            backoff_unit: config.backoff_unit(),
        });

        let mut messages = Vec::new();
        if !intro_greeting.trim().is_empty() {
            messages.push(Message::assistant(intro_greeting.trim()));
        }

        Self {
            config,
            backend,
            executor,
            messages: Mutex::new(messages),
            turn_lock: AsyncMutex::new(()),
            active_turn: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn message(&self, id: Uuid) -> Option<Message> {
        self.lock().iter().find(|m| m.id == id).cloned()
    }

    /// The most recent assistant answer that did not fail.
    pub fn last_answer(&self) -> Option<Message> {
        self.lock()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.failed && !m.content.is_empty())
            .cloned()
    }

    /// Cancel the turn in progress, if any.
    pub fn cancel_turn(&self) -> bool {
        match self
            .active_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_turn_active(&self) -> bool {
        self.active_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn set_active_turn(&self, token: Option<CancellationToken>) {
        *self.active_turn.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn remove(&self, id: Uuid) {
        self.lock().retain(|m| m.id != id);
    }

    fn update(&self, message: &Message) {
        let mut messages = self.lock();
        if let Some(slot) = messages.iter_mut().find(|m| m.id == message.id) {
            *slot = message.clone();
        }
    }

    /// Run one streaming turn. `on_snapshot` sees the assistant message after
    /// each meaningful chunk. Turns are serialized.
    pub async fn ask<F>(&self, query: UserQuery, cancel: CancellationToken, mut on_snapshot: F) -> Message
    where
        F: FnMut(&Message),
    {
        let _turn = self.turn_lock.lock().await;
        self.set_active_turn(Some(cancel.clone()));

        let mut user = Message::user(query.text.clone());
        user.image = query.image.clone();
        let assistant = Message::assistant("");
        let mut guard = TurnGuard {
            conversation: self,
            assistant_id: assistant.id,
            done: false,
        };

        let request = {
            let mut messages = self.lock();
            user.reply_to = query
                .reply_to
                .and_then(|id| messages.iter().find(|m| m.id == id))
                .map(|m| m.reply_ref(REPLY_SNIPPET_CHARS));

            let request = GenerationRequest {
                model: self.config.model.clone(),
                system_instruction: self.config.system_instruction.clone(),
                allowed_domains: self.config.allowed_domains.clone(),
                history: history_window(&messages, self.config.history_turns),
                turn: UserTurn {
                    text: query.text,
                    image: query.image,
                },
            };
            messages.push(user);
            messages.push(assistant.clone());
            request
        };

        debug!("Turn started with {} history turn(s)", request.history.len());

        let backend = self.backend.clone();
        let opened = self
            .executor
            .execute(
                || {
                    let backend = backend.clone();
                    let request = request.clone();
                    async move { backend.open_stream(&request).await }
                },
                &cancel,
            )
            .await;

        let mut aggregator = AnswerAggregator::new(assistant);
        let (message, end) = match opened {
            Ok(mut stream) => {
                debug!("Answer stream opened after {} attempt(s)", stream.attempts());
                aggregator
                    .run(&mut stream, &cancel, |m| {
                        self.update(m);
                        on_snapshot(m);
                    })
                    .await
            }
            Err(err) => {
                aggregator.fail(&err);
                let message = aggregator.into_message();
                self.update(&message);
                on_snapshot(&message);
                (message, TurnEnd::Failed(err))
            }
        };

        self.update(&message);
        guard.done = true;
        drop(guard);

        match &end {
            TurnEnd::Completed => info!("Turn complete ({} chars)", message.content.len()),
            TurnEnd::Cancelled => info!("Turn cancelled"),
            TurnEnd::Failed(err) => info!("Turn failed: {err}"),
        }
        message
    }
}

/// Clears the active turn however `ask` exits. If the turn was abandoned
/// (its future dropped), an assistant message that never received text is
/// removed from the list.
struct TurnGuard<'a> {
    conversation: &'a Conversation,
    assistant_id: Uuid,
    done: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.conversation.set_active_turn(None);
        if self.done {
            return;
        }
        let empty = self
            .conversation
            .message(self.assistant_id)
            .is_some_and(|m| m.content.is_empty());
        if empty {
            self.conversation.remove(self.assistant_id);
        }
        info!("Turn abandoned");
    }
}

fn answered(message: &Message) -> bool {
    message.role == Role::Assistant && !message.failed && !message.content.trim().is_empty()
}

/// The last `turns` usable messages, starting with a user turn. A user
/// message counts only when the message after it is a usable answer.
fn history_window(messages: &[Message], turns: usize) -> Vec<HistoryTurn> {
    let usable: Vec<&Message> = messages
        .iter()
        .enumerate()
        .filter(|(i, m)| match m.role {
            Role::User => messages.get(i + 1).is_some_and(answered),
            Role::Assistant => answered(m),
        })
        .map(|(_, m)| m)
        .collect();
    let start = usable.len().saturating_sub(turns);

    usable[start..]
        .iter()
        .skip_while(|m| m.role == Role::Assistant)
        .map(|m| HistoryTurn {
            role: m.role,
            text: m.content.clone(),
        })
        .collect()
}
