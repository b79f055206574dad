// Interactive terminal chat: one prompt per line, each answered with the
// diagram summary and the artifact paths.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::pipeline::{Pipeline, PipelineOutput};
use crate::session::{ChatSession, SessionError};

const EXIT_WORDS: &[&str] = &["exit", "quit", ":q"];

/// Human-readable answer for one finished run.
pub fn describe(output: &PipelineOutput) -> String {
    let mut lines = vec![format!(
        "{}: {} nodes, {} edges, {} frames{}",
        output.spec.title_or_default(),
        output.spec.nodes.len(),
        output.spec.edges.len(),
        output.frames.len(),
        if output.cache_hit { " (cached)" } else { "" }
    )];
    for artifact in &output.artifacts {
        lines.push(format!("  {:?}: {}", artifact.format, artifact.path.display()));
    }
    let dropped = output.trace.dropped().count();
    if dropped > 0 {
        lines.push(format!("  ({} fragment(s) of the model answer were ignored)", dropped));
    }
    lines.join("\n")
}

/// Reads prompts from stdin until EOF or an exit word.
pub async fn run_chat(pipeline: Arc<Pipeline>) -> Result<()> {
    let session = ChatSession::new(pipeline);
    info!("Chat session {} started", session.id());
    println!("Describe a process and I will draw it. Type 'exit' to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("Failed to read from stdin")? else {
            break;
        };
        let line = line.trim();
        if EXIT_WORDS.contains(&line.to_ascii_lowercase().as_str()) {
            break;
        }

        match session.submit(line).await {
            Ok(output) => println!("{}", describe(&output)),
            Err(SessionError::EmptyPrompt) => continue,
            Err(SessionError::Pipeline(err)) => println!("{}", err.user_message()),
            Err(err) => println!("{}", err),
        }
    }

    debug!(messages = session.history().await.len(), "Chat finished");
    Ok(())
}
