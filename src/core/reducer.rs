//! Pure reduction of stream events into conversation state.
//!
//! Every function here takes the previous state by reference and returns a
//! replacement. The caller swaps the whole value in one step, so an update can
//! never be computed from a stale read of a single field.

use crate::core::chat_stream::StreamEvent;
use crate::core::message::Message;
use crate::core::state::ConversationsState;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Generation speed rounded to one decimal place.
///
/// Returns `None` when the server reported no elapsed time.
pub fn tokens_per_second(eval_count: u64, eval_duration_nanos: u64) -> Option<f64> {
    if eval_duration_nanos == 0 {
        return None;
    }
    let seconds = eval_duration_nanos as f64 / NANOS_PER_SECOND;
    let rate = eval_count as f64 / seconds;
    Some((rate * 10.0).round() / 10.0)
}

/// Fold one event into a still-streaming message.
pub fn reduce_message(message: &Message, event: &StreamEvent) -> Message {
    let mut next = message.clone();
    if let Some(delta) = &event.delta_content {
        next.content.push_str(delta);
    }
    if event.done {
        next.complete = true;
        next.input_tokens = event.prompt_eval_count;
        next.tokens = event.eval_count;
        next.tokens_per_second = match (event.eval_count, event.eval_duration_nanos) {
            (Some(count), Some(nanos)) => tokens_per_second(count, nanos),
            _ => None,
        };
    }
    next
}

/// Replace the message with `message_id` by its reduced form.
///
/// `None` means nothing changed: the id is unknown or the message is already
/// complete, which is immutable.
pub fn apply_event(
    messages: &[Message],
    message_id: &str,
    event: &StreamEvent,
) -> Option<Vec<Message>> {
    let index = messages
        .iter()
        .position(|message| message.id == message_id)?;
    let current = &messages[index];
    if current.complete {
        return None;
    }

    let mut next = messages.to_vec();
    next[index] = reduce_message(current, event);
    Some(next)
}

/// [`apply_event`] lifted to the conversation store.
pub fn apply_to_conversations(
    state: &ConversationsState,
    conversation_id: &str,
    message_id: &str,
    event: &StreamEvent,
) -> Option<ConversationsState> {
    let conversation = state.find(conversation_id)?;
    let messages = apply_event(&conversation.messages, message_id, event)?;
    Some(state.with_messages(conversation_id, messages))
}
