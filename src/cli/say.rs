//! Non-interactive "say" command

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;

use crate::core::engine::{ChatEngine, EngineError, TurnOutcome};
use crate::core::message::{Attachment, Message, Role};
use crate::core::state::ConversationsState;

pub async fn run_say(
    engine: &ChatEngine,
    prompt: Vec<String>,
    model: Option<String>,
    new: bool,
    attachment_paths: Vec<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    let attachments = attachment_paths
        .iter()
        .map(|path| read_attachment(path))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(model) = model {
        engine
            .settings()
            .mutate(|settings| settings.with_selected_model(model));
    }
    if new {
        engine.new_conversation();
    }

    let interrupt = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                engine.stop();
            }
        })
    };

    let mut changes = engine.conversations().subscribe();
    let mut printer = ReplyPrinter::new(&engine.conversations().get());
    let send = engine.send_message(&prompt, attachments);
    tokio::pin!(send);

    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            Ok(()) = changes.changed() => {
                let state = changes.borrow_and_update().clone();
                emit(printer.render(&state))?;
            }
        }
    };
    interrupt.abort();
    emit(printer.render(&engine.conversations().get()))?;

    match result {
        Ok(TurnOutcome::Completed) => {
            if let Some(stats) = printer.last_stats() {
                eprintln!("{stats}");
            }
            Ok(())
        }
        Ok(TurnOutcome::Cancelled) => {
            eprintln!("⏹  Stopped");
            Ok(())
        }
        Ok(TurnOutcome::Failed) => Err("the reply could not be generated".into()),
        Ok(TurnOutcome::ToolLimitReached) => Err("the tool round limit was reached".into()),
        Ok(TurnOutcome::Abandoned) => Err("the conversation went away mid-reply".into()),
        Err(EngineError::NoModelSelected) => {
            eprintln!("❌ No model selected.");
            eprintln!("Run 'splat models' to pick the first installed model, or pass -m <model>.");
            Err(EngineError::NoModelSelected.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn emit(text: String) -> io::Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    let mut stdout = io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

/// Build an attachment from a file, typed by its extension.
pub fn read_attachment(path: &Path) -> Result<Attachment, Box<dyn Error>> {
    let bytes = std::fs::read(path)
        .map_err(|err| format!("Failed to read attachment {}: {err}", path.display()))?;
    let file_type = mime_for(path);
    let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(Attachment {
        contents: format!("data:{file_type};base64,{payload}"),
        file_type,
    })
}

fn mime_for(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png".to_string(),
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        "gif" => "image/gif".to_string(),
        "webp" => "image/webp".to_string(),
        "" | "txt" => "text/plain".to_string(),
        other => format!("text/{other}"),
    }
}

/// Turns successive conversation snapshots into terminal output for replies
/// that did not exist when the printer was created.
pub struct ReplyPrinter {
    existing: HashSet<String>,
    printed: HashMap<String, String>,
    finished: HashSet<String>,
    last_stats: Option<String>,
}

impl ReplyPrinter {
    pub fn new(state: &ConversationsState) -> Self {
        let existing = state
            .conversations
            .iter()
            .flat_map(|conversation| conversation.messages.iter())
            .map(|message| message.id.clone())
            .collect();
        Self {
            existing,
            printed: HashMap::new(),
            finished: HashSet::new(),
            last_stats: None,
        }
    }

    pub fn render(&mut self, state: &ConversationsState) -> String {
        let mut out = String::new();
        for message in state.active_messages() {
            if self.existing.contains(&message.id) || self.finished.contains(&message.id) {
                continue;
            }
            match message.role {
                Role::Assistant => self.render_assistant(message, &mut out),
                Role::Tool if message.complete => {
                    // Tool rows may reuse the id of a reply that was printed
                    // while it streamed.
                    if self.printed.remove(&message.id).is_some_and(|text| !text.is_empty()) {
                        out.push('\n');
                    }
                    out.push_str("[tool result received]\n");
                    self.finished.insert(message.id.clone());
                }
                _ => {}
            }
        }
        out
    }

    fn render_assistant(&mut self, message: &Message, out: &mut String) {
        let printed = self.printed.entry(message.id.clone()).or_default();
        match message.content.strip_prefix(printed.as_str()) {
            Some(rest) => out.push_str(rest),
            None => {
                // Replaced wholesale, e.g. by an error notice.
                out.push('\n');
                out.push_str(&message.content);
            }
        }
        *printed = message.content.clone();

        if message.complete {
            out.push('\n');
            if let (Some(tokens), Some(rate)) = (message.tokens, message.tokens_per_second) {
                self.last_stats = Some(format!("{tokens} tokens, {rate:.1} tokens/s"));
            }
            self.finished.insert(message.id.clone());
        }
    }

    pub fn last_stats(&self) -> Option<&str> {
        self.last_stats.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Conversation;
    use tempfile::TempDir;

    fn state_with(messages: Vec<Message>) -> ConversationsState {
        let mut conversation = Conversation::blank();
        conversation.messages = messages;
        ConversationsState {
            active_conversation_id: Some(conversation.id.clone()),
            conversations: vec![conversation],
        }
    }

    #[test]
    fn prints_only_new_text() {
        let user = Message::user("Hi", Vec::new());
        let mut reply = Message::assistant_placeholder("reply".into());
        let initial = state_with(vec![user.clone()]);
        let mut printer = ReplyPrinter::new(&initial);
        assert_eq!(printer.render(&initial), "");

        reply.content = "Hel".into();
        assert_eq!(printer.render(&state_with(vec![user.clone(), reply.clone()])), "Hel");

        reply.content = "Hello".into();
        reply.complete = true;
        reply.tokens = Some(50);
        reply.tokens_per_second = Some(25.0);
        let done = state_with(vec![user, reply]);
        assert_eq!(printer.render(&done), "lo\n");
        assert_eq!(printer.render(&done), "");
        assert_eq!(printer.last_stats(), Some("50 tokens, 25.0 tokens/s"));
    }

    #[test]
    fn replaced_reply_is_printed_whole() {
        let mut reply = Message::assistant_placeholder("reply".into());
        let mut printer = ReplyPrinter::new(&state_with(Vec::new()));

        reply.content = "Partial".into();
        assert_eq!(printer.render(&state_with(vec![reply])), "Partial");

        let notice = Message::assistant_notice("reply".into(), "Something failed");
        assert_eq!(
            printer.render(&state_with(vec![notice])),
            "\nSomething failed\n"
        );
    }

    #[test]
    fn attachments_are_typed_by_extension() {
        let dir = TempDir::new().expect("temp dir");
        let notes = dir.path().join("notes.md");
        std::fs::write(&notes, "# Notes").expect("write");

        let attachment = read_attachment(&notes).expect("attachment");
        assert_eq!(attachment.file_type, "text/md");
        assert!(!attachment.is_image());
        assert!(attachment.contents.starts_with("data:text/md;base64,"));
        assert_eq!(mime_for(Path::new("photo.JPG")), "image/jpeg");

        let missing = read_attachment(&dir.path().join("missing.txt"));
        assert!(missing.is_err());
    }
}
