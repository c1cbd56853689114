//! One user turn: stream a reply, run requested tools, resubmit, repeat.

use futures_util::StreamExt;
use tracing::{debug, warn};

use super::{ChatEngine, TurnOutcome, TurnTarget, DELIVERY_ERROR_MESSAGE};
use crate::api::{ApiError, ChatOptions, ChatRequest, ChatToolCall};
use crate::core::cancellation::CancellationController;
use crate::core::chat_stream::{open_chat_stream, StreamEvent};
use crate::core::message::{new_id, Message};
use crate::core::reducer::apply_to_conversations;

/// How a single streamed generation ended.
#[derive(Debug)]
enum GenerationEnd {
    Completed,
    ToolCalls(Vec<ChatToolCall>),
    Cancelled,
    /// Transport failure, or a body with nothing decodable in it.
    Undelivered(String),
    /// The server reported an error in-band.
    ServerError(String),
    /// The reply row vanished, usually because its conversation was deleted.
    Orphaned,
}

impl ChatEngine {
    /// Drive generations for `conversation_id` until the model stops asking
    /// for tools, the round limit is hit, or the turn is cancelled.
    pub(crate) async fn run_turn(
        &self,
        conversation_id: &str,
        target: &TurnTarget,
        controller: &CancellationController,
    ) -> TurnOutcome {
        let mut tool_rounds = 0usize;

        loop {
            if controller.is_stopped() {
                return TurnOutcome::Cancelled;
            }
            let Some(request) = self.build_request(conversation_id, target) else {
                return TurnOutcome::Abandoned;
            };

            let message_id = new_id();
            let placeholder = Message::assistant_placeholder(message_id.clone());
            if self
                .conversations()
                .try_mutate(|state| state.with_message_appended(conversation_id, placeholder))
                .is_none()
            {
                return TurnOutcome::Abandoned;
            }

            let end = self
                .stream_generation(conversation_id, &message_id, target, &request, controller)
                .await;
            debug!(conversation = %conversation_id, round = tool_rounds, ?end, "Generation ended");

            let calls = match end {
                GenerationEnd::Completed => return TurnOutcome::Completed,
                GenerationEnd::Orphaned => return TurnOutcome::Abandoned,
                GenerationEnd::Cancelled => {
                    self.seal_partial(conversation_id, &message_id);
                    return TurnOutcome::Cancelled;
                }
                GenerationEnd::Undelivered(reason) => {
                    warn!(conversation = %conversation_id, %reason, "Reply could not be delivered");
                    self.replace_message(
                        conversation_id,
                        Message::assistant_notice(message_id, DELIVERY_ERROR_MESSAGE),
                    );
                    return TurnOutcome::Failed;
                }
                GenerationEnd::ServerError(reason) => {
                    warn!(conversation = %conversation_id, %reason, "Server reported an error");
                    self.replace_message(
                        conversation_id,
                        Message::assistant_notice(
                            message_id,
                            format!("The model server reported an error: {reason}"),
                        ),
                    );
                    return TurnOutcome::Failed;
                }
                GenerationEnd::ToolCalls(calls) => calls,
            };

            if tool_rounds >= self.options.max_tool_rounds {
                warn!(
                    conversation = %conversation_id,
                    limit = self.options.max_tool_rounds,
                    "Tool round limit reached"
                );
                self.replace_message(
                    conversation_id,
                    Message::assistant_notice(
                        message_id,
                        format!(
                            "Stopped after {} consecutive tool calls without a final answer.",
                            self.options.max_tool_rounds
                        ),
                    ),
                );
                return TurnOutcome::ToolLimitReached;
            }
            tool_rounds += 1;

            // The first result takes over the reply row; further calls from
            // the same generation get rows of their own.
            for (index, call) in calls.iter().enumerate() {
                if controller.is_stopped() {
                    if index == 0 {
                        self.seal_partial(conversation_id, &message_id);
                    }
                    return TurnOutcome::Cancelled;
                }
                let outcome = self.tools.execute(call, controller.token()).await;
                debug!(tool = %outcome.tool_name, action = %outcome.action, "Tool round");
                // A tool cut short by stop() leaves no row behind.
                if controller.is_stopped() {
                    if index == 0 {
                        self.seal_partial(conversation_id, &message_id);
                    }
                    return TurnOutcome::Cancelled;
                }

                let inserted = if index == 0 {
                    self.replace_message(
                        conversation_id,
                        Message::tool_result(message_id.clone(), outcome.content, outcome.action),
                    )
                } else {
                    self.conversations()
                        .try_mutate(|state| {
                            state.with_message_appended(
                                conversation_id,
                                Message::tool_result(new_id(), outcome.content, outcome.action),
                            )
                        })
                        .is_some()
                };
                if !inserted {
                    return TurnOutcome::Abandoned;
                }
            }
        }
    }

    fn build_request(&self, conversation_id: &str, target: &TurnTarget) -> Option<ChatRequest> {
        let state = self.conversations().get();
        let conversation = state.find(conversation_id)?;
        Some(ChatRequest {
            model: target.model.clone(),
            messages: conversation
                .messages
                .iter()
                .filter(|message| message.complete)
                .map(Message::to_api_message)
                .collect(),
            options: target
                .context_length
                .map(|num_ctx| ChatOptions { num_ctx }),
            tools: self.tools.descriptors(),
        })
    }

    async fn stream_generation(
        &self,
        conversation_id: &str,
        message_id: &str,
        target: &TurnTarget,
        request: &ChatRequest,
        controller: &CancellationController,
    ) -> GenerationEnd {
        let opened =
            open_chat_stream(&self.client, &target.api_base, request, controller.token()).await;
        let stream = match opened {
            Ok(stream) => stream,
            Err(ApiError::Cancelled) => return GenerationEnd::Cancelled,
            Err(err) => return GenerationEnd::Undelivered(err.to_string()),
        };
        let mut stream = Box::pin(stream);

        let mut tool_calls: Vec<ChatToolCall> = Vec::new();
        let mut saw_done = false;

        while let Some(item) = stream.next().await {
            if controller.is_stopped() {
                return GenerationEnd::Cancelled;
            }
            let mut event = match item {
                Ok(event) => event,
                Err(err) => return GenerationEnd::Undelivered(err.to_string()),
            };
            if let Some(error) = event.error.take() {
                return GenerationEnd::ServerError(error);
            }
            if let Some(calls) = event.tool_calls.take() {
                tool_calls.extend(calls);
            }
            saw_done |= event.done;

            // A reply that turns into tool calls is replaced by the tool
            // result, so it is never sealed as a finished assistant message.
            if !tool_calls.is_empty() {
                event.done = false;
            }
            if event.delta_content.is_none() && !event.done {
                continue;
            }
            if !self.apply(conversation_id, message_id, &event) {
                debug!(conversation = %conversation_id, message = %message_id, "Reply row is gone; abandoning stream");
                return GenerationEnd::Orphaned;
            }
        }

        if controller.is_stopped() {
            return GenerationEnd::Cancelled;
        }
        if !tool_calls.is_empty() {
            return GenerationEnd::ToolCalls(tool_calls);
        }
        if !saw_done {
            debug!(conversation = %conversation_id, "Stream ended without a final frame");
            let sealed = StreamEvent {
                done: true,
                ..Default::default()
            };
            self.apply(conversation_id, message_id, &sealed);
        }
        GenerationEnd::Completed
    }

    fn apply(&self, conversation_id: &str, message_id: &str, event: &StreamEvent) -> bool {
        self.conversations()
            .try_mutate(|state| apply_to_conversations(state, conversation_id, message_id, event))
            .is_some()
    }

    /// Mark a partially streamed reply as finished, keeping its content.
    fn seal_partial(&self, conversation_id: &str, message_id: &str) {
        let sealed = StreamEvent {
            done: true,
            ..Default::default()
        };
        self.apply(conversation_id, message_id, &sealed);
    }

    fn replace_message(&self, conversation_id: &str, message: Message) -> bool {
        self.conversations()
            .try_mutate(|state| state.with_message_replaced(conversation_id, message))
            .is_some()
    }
}
