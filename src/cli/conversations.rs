//! Conversation and project management commands

use std::error::Error;

use crate::cli::{ConversationCommands, ProjectCommands};
use crate::core::engine::ChatEngine;
use crate::core::message::Role;

pub fn run_conversations(
    engine: &ChatEngine,
    command: ConversationCommands,
) -> Result<(), Box<dyn Error>> {
    match command {
        ConversationCommands::List => {
            let state = engine.conversations().get();
            if state.conversations.is_empty() {
                println!("No conversations yet. Start one with 'splat say <message>'.");
                return Ok(());
            }
            let active = state.active_conversation_id.as_deref();
            for conversation in &state.conversations {
                let marker = if active == Some(conversation.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {}  {} ({} messages)",
                    conversation.id,
                    conversation.summary,
                    conversation.messages.len()
                );
            }
        }
        ConversationCommands::Show { id } => {
            let state = engine.conversations().get();
            let conversation = match id.as_deref() {
                Some(id) => state.find(id),
                None => state.active(),
            }
            .ok_or("no such conversation")?;
            println!("# {}", conversation.summary);
            for message in &conversation.messages {
                let label = match message.role {
                    Role::User => "You",
                    Role::Assistant => "Assistant",
                    Role::System => "System",
                    Role::Tool => "Tool",
                };
                println!();
                println!("{label}:");
                println!("{}", message.content);
            }
        }
        ConversationCommands::Switch { id } => {
            engine.switch_conversation(&id)?;
            println!("✅ Switched to {id}");
        }
        ConversationCommands::Delete { id } => {
            engine.delete_conversation(&id)?;
            println!("✅ Deleted {id}");
        }
        ConversationCommands::New => {
            let id = engine.new_conversation();
            println!("✅ Active conversation: {id}");
        }
    }
    Ok(())
}

pub fn run_projects(engine: &ChatEngine, command: ProjectCommands) -> Result<(), Box<dyn Error>> {
    let projects = engine.projects();
    match command {
        ProjectCommands::List => {
            let state = projects.get();
            if state.projects.is_empty() {
                println!("No projects. Add one with 'splat projects add <name>'.");
                return Ok(());
            }
            let selected = state.selected_project_id.as_deref();
            for project in &state.projects {
                let marker = if selected == Some(project.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                let model = if project.model.is_empty() {
                    "(selected model)"
                } else {
                    project.model.as_str()
                };
                let context = project
                    .context_length
                    .map(|length| format!(", num_ctx {length}"))
                    .unwrap_or_default();
                println!("{marker} {}  {} [{model}{context}]", project.id, project.name);
            }
        }
        ProjectCommands::Add {
            name,
            model,
            context_length,
            system_prompt,
            select,
        } => {
            let mut added = String::new();
            projects.mutate(|state| {
                let (next, id) =
                    state.with_project_added(name.clone(), model, context_length, system_prompt);
                added = id;
                if select {
                    next.with_selected(&added)
                } else {
                    next
                }
            });
            println!("✅ Added project {name} ({added})");
        }
        ProjectCommands::Remove { id } => {
            ensure_project(engine, &id)?;
            projects.mutate(|state| state.without_project(&id));
            println!("✅ Removed project {id}");
        }
        ProjectCommands::Select { id } => {
            ensure_project(engine, &id)?;
            projects.mutate(|state| state.with_selected(&id));
            println!("✅ Selected project {id}");
        }
        ProjectCommands::Clear => {
            projects.mutate(|state| state.with_selection_cleared());
            println!("✅ Cleared project selection");
        }
    }
    Ok(())
}

fn ensure_project(engine: &ChatEngine, id: &str) -> Result<(), Box<dyn Error>> {
    if engine
        .projects()
        .get()
        .projects
        .iter()
        .any(|project| project.id == id)
    {
        Ok(())
    } else {
        Err(format!("no project with id {id}").into())
    }
}
