use super::*;
use crate::core::message::Role;
use crate::utils::test_utils::{Reply, ScriptedServer};
use serde_json::json;

fn parse_args(argv: &[&str]) -> Args {
    Args::try_parse_from(argv)
        .unwrap_or_else(|err| panic!("argv={argv:?} should parse successfully: {err}"))
}

#[test]
fn say_collects_trailing_words() {
    let args = parse_args(&["splat", "say", "-m", "llama3.2", "--new", "list", "-the", "files"]);
    match args.command {
        Commands::Say {
            model, new, prompt, ..
        } => {
            assert_eq!(model.as_deref(), Some("llama3.2"));
            assert!(new);
            assert_eq!(prompt, vec!["list", "-the", "files"]);
        }
        _ => panic!("expected say"),
    }
}

#[test]
fn say_requires_a_prompt() {
    assert!(Args::try_parse_from(["splat", "say"]).is_err());
}

#[test]
fn global_flags_work_after_subcommand() {
    let args = parse_args(&["splat", "models", "--ephemeral", "--log", "splat.log"]);
    assert!(args.ephemeral);
    assert_eq!(args.log, Some(PathBuf::from("splat.log")));
    assert!(matches!(args.command, Commands::Models));
}

#[test]
fn conversations_subcommand_is_optional() {
    let args = parse_args(&["splat", "conversations"]);
    assert!(matches!(
        args.command,
        Commands::Conversations { command: None }
    ));

    let args = parse_args(&["splat", "conversations", "switch", "abc"]);
    assert!(matches!(
        args.command,
        Commands::Conversations {
            command: Some(ConversationCommands::Switch { ref id })
        } if id == "abc"
    ));
}

#[test]
fn project_add_parses_options() {
    let args = parse_args(&[
        "splat", "projects", "add", "Docs", "-m", "qwen2.5", "-c", "8192", "-s", "Be terse",
        "--select",
    ]);
    match args.command {
        Commands::Projects {
            command:
                Some(ProjectCommands::Add {
                    name,
                    model,
                    context_length,
                    system_prompt,
                    select,
                }),
        } => {
            assert_eq!(name, "Docs");
            assert_eq!(model, "qwen2.5");
            assert_eq!(context_length, Some(8192));
            assert_eq!(system_prompt, "Be terse");
            assert!(select);
        }
        _ => panic!("expected projects add"),
    }
}

#[tokio::test]
async fn ephemeral_session_runs_a_turn() {
    let server = ScriptedServer::start(vec![Reply::ndjson(&[
        json!({"message": {"role": "assistant", "content": "Hello"}, "done": false}),
        json!({"message": {"role": "assistant", "content": ""}, "done": true, "eval_count": 4, "eval_duration": 1_000_000_000u64}),
    ])])
    .await;
    let config = Config {
        api_url: Some(server.base_url()),
        ..Default::default()
    };

    let session = Session::open(&config, true).await.expect("session");
    assert_eq!(session.engine.settings().get().api_url, server.base_url());

    run_projects(
        &session.engine,
        ProjectCommands::Add {
            name: "Scratch".into(),
            model: "llama3.2".into(),
            context_length: None,
            system_prompt: String::new(),
            select: true,
        },
    )
    .expect("add project");

    run_say(
        &session.engine,
        vec!["Hi".into()],
        None,
        false,
        Vec::new(),
    )
    .await
    .expect("say");

    let state = session.engine.conversations().get();
    let messages = state.active_messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello");
    assert_eq!(messages[1].tokens_per_second, Some(4.0));

    session.close().await.expect("close");
}
