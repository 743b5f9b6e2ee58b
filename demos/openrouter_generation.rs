//! Demo: generate a site against OpenRouter (or any OpenAI-compatible server).
//!
//! Run with:
//! `OPENROUTER_API_KEY=... cargo run --example openrouter_generation -- [config.toml] "brief"`

use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use webgen_pipeline::{
    Event, EventHandler, FnEventHandler, GenerationInput, GeneratorConfig, RunStatus, UsageTracker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webgen_pipeline=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.first() {
        Some(path) if path.ends_with(".toml") => {
            let config = GeneratorConfig::from_file(path)?;
            args.remove(0);
            config
        }
        _ => GeneratorConfig::default(),
    };
    let brief = args
        .first()
        .cloned()
        .unwrap_or_else(|| "A portfolio site for a freelance ceramicist".to_string());

    let backend = config.backend();
    if !backend.has_api_key() {
        anyhow::bail!("set {} to run this demo", config.endpoint.api_key_env);
    }

    let tracker = Arc::new(UsageTracker::new());
    let runner = config.build_runner(Arc::new(backend), Some(Arc::clone(&tracker)))?;
    let run = runner.create_run(GenerationInput::new(brief));

    let cancel = run.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let printer: Arc<dyn EventHandler> = Arc::new(FnEventHandler(|event: Event| match event {
        Event::StepStarted { step, .. } => eprintln!("\n== {step} =="),
        Event::Token { delta, .. } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        Event::TransportRetry { attempt, delay_ms, reason, .. } => {
            eprintln!("\n(retry {attempt} in {delay_ms}ms: {reason})")
        }
        _ => {}
    }));
    let run = runner.run_with(run, Some(printer), None).await;

    eprintln!("\n\nstatus: {}", run.status);
    for result in &run.history {
        eprintln!(
            "  {:<12} ok={} tokens={} cost=${:.5} retries={} {}ms",
            result.step.as_str(),
            result.success,
            result.token_usage.total,
            result.estimated_cost,
            result.retry_count,
            result.latency_ms
        );
    }
    match run.status {
        RunStatus::Completed => {
            if let Some(output) = run.final_output() {
                println!("{}", serde_json::to_string_pretty(output)?);
            }
        }
        RunStatus::Failed => {
            if let Some(error) = &run.error {
                eprintln!("{}", error.summary());
            }
        }
        _ => {}
    }
    eprintln!("total: {} tokens, ${:.5}", run.totals.tokens.total, run.totals.cost);
    Ok(())
}
