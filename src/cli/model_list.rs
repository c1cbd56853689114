//! Model listing and management commands

use std::error::Error;
use std::io::{self, Write};

use tokio_util::sync::CancellationToken;

use crate::api::PullProgressLine;
use crate::core::engine::ChatEngine;

pub async fn list_models(engine: &ChatEngine) -> Result<(), Box<dyn Error>> {
    let models = engine.refresh_models().await?;
    let settings = engine.settings().get();

    println!("🤖 Installed models at {}", settings.api_url);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if models.is_empty() {
        println!("No models installed. Use 'splat pull <model>' to download one.");
        return Ok(());
    }
    for model in &models {
        let marker = if *model == settings.selected_model { "*" } else { " " };
        println!("{marker} {model}");
    }
    println!();
    println!("* selected model");
    Ok(())
}

pub async fn load_model(engine: &ChatEngine, model: &str) -> Result<(), Box<dyn Error>> {
    engine.load_model(model).await?;
    println!("✅ Loaded {model}");
    Ok(())
}

pub async fn unload_model(engine: &ChatEngine, model: &str) -> Result<(), Box<dyn Error>> {
    engine.unload_model(model).await?;
    println!("✅ Unloaded {model}");
    Ok(())
}

pub async fn pull_model(engine: &ChatEngine, model: &str) -> Result<(), Box<dyn Error>> {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = engine
        .pull_model(model, cancel, |frame| {
            let mut stderr = io::stderr().lock();
            let _ = write!(stderr, "\r\x1b[2K{}", progress_line(frame));
            let _ = stderr.flush();
        })
        .await;
    interrupt.abort();
    eprintln!();

    result?;
    println!("✅ Pulled {model}");
    Ok(())
}

fn progress_line(frame: &PullProgressLine) -> String {
    match frame.percent() {
        Some(percent) => format!("{} {percent:.0}%", frame.status),
        None => frame.status.clone(),
    }
}
