//! Demo: a full three-step run against the scripted mock backend.
//!
//! Run with: `cargo run --example mock_generation`
//! Set `RUST_LOG=webgen_pipeline=debug` to see the step spans.

use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use webgen_pipeline::{
    Event, ExecutorOptions, GenerationInput, GenerationService, MockBackend, MockReply,
    PipelineRunner, ResiliencePolicy, RunStatus, StepExecutor, StepId, StepRegistry, UsageTracker,
};

// Single-threaded so the progress subscription is in place before the run task starts.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // The first architecture call fails once to show a transport retry.
    let mock = MockBackend::new(vec![
        MockReply::provider(503, "upstream overloaded"),
        MockReply::json(&json!({
            "sitemap": ["home", "menu", "contact"],
            "pages": [
                {"slug": "home", "title": "Home", "purpose": "Welcome visitors", "sections": ["hero", "story"]},
                {"slug": "menu", "title": "Menu", "purpose": "Show the bakes", "sections": ["list"]},
                {"slug": "contact", "title": "Contact", "purpose": "Opening hours", "sections": ["map"]}
            ]
        })),
        MockReply::text(
            "<think>Keep it warm and short.</think>```json\n{\"pages\": [{\"slug\": \"home\", \"sections\": [{\"type\": \"hero\", \"heading\": \"Bread worth waking up for\"}]}], \"seo\": {\"title\": \"Crumb Bakery\"}}\n```",
        ),
        MockReply::text("{pages: [{slug: 'home', components: [{type: 'Hero', props: {}, children: []}]}], theme: {primary: '#b5651d'},}"),
    ])
    .with_chunk_chars(24);

    let tracker = Arc::new(UsageTracker::new());
    let executor = StepExecutor::new(Arc::new(mock), Arc::new(StepRegistry::standard()))
        .with_policy(ResiliencePolicy::from_millis(3, 200, 2_000, 10_000))
        .with_tracker(Arc::clone(&tracker));
    let runner = PipelineRunner::new(
        Arc::new(executor),
        vec![StepId::Architecture, StepId::Content, StepId::Layout],
        ExecutorOptions::default().with_streaming(true),
    )?;
    let service = GenerationService::new(Arc::new(runner));

    let input = GenerationInput::new("A cosy neighbourhood bakery with a short daily menu")
        .with_site_name("Crumb")
        .with_business_type("bakery")
        .with_style("warm, handwritten");
    let run_id = service.start_run(input);

    service.on_step_progress(run_id, |event| match event {
        Event::StepStarted { step, .. } => println!("-> {step}"),
        Event::TransportRetry { attempt, delay_ms, reason, .. } => {
            println!("   retry {attempt} in {delay_ms}ms ({reason})")
        }
        Event::Token { accumulated, .. } => println!("   ... {} chars", accumulated.len()),
        Event::StepFinished { step, success, latency_ms } => {
            println!("<- {step} ok={success} in {latency_ms}ms")
        }
        _ => {}
    })?;

    let run = service.wait_for_run(run_id).await?;
    println!("\nstatus: {}", run.status);
    if run.status == RunStatus::Completed {
        if let Some(layout) = run.final_output() {
            println!("{}", serde_json::to_string_pretty(layout)?);
        }
    } else if let Some(error) = &run.error {
        println!("{}", error.summary());
    }

    let usage = tracker.total();
    println!(
        "\n{} calls, {} tokens, ${:.6}",
        usage.calls, usage.tokens.total, usage.cost
    );
    service.take_run(run_id)?;
    Ok(())
}
