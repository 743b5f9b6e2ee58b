use futures::stream;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use webgen_pipeline::backend::sse::collect_stream;
use webgen_pipeline::{
    build_prompt, ErrorKind, Event, ExecutorOptions, FnEventHandler, GenerationInput,
    GenerationService, MockBackend, MockReply, PipelineContext, PipelineRunner, ResiliencePolicy,
    RunStatus, StepExecutor, StepId, StepRegistry, UsageTracker,
};

fn three_step_script() -> Vec<MockReply> {
    vec![
        MockReply::json(&json!({
            "sitemap": ["home", "about"],
            "pages": [{"slug": "home"}, {"slug": "about"}],
            "navigation": ["home", "about"]
        })),
        MockReply::text(
            "Here is the copy:\n```json\n{\"pages\": [{\"slug\": \"home\", \"headline\": \"Warm bread daily\"}], \"seo\": {\"title\": \"Crumb\"}}\n```",
        ),
        MockReply::text("{'pages': [{'slug': 'home', 'sections': ['hero', 'menu']}], 'theme': {'primary': '#b5651d'},}"),
    ]
}

fn fast_policy(max_retries: u32) -> ResiliencePolicy {
    ResiliencePolicy::none()
        .with_max_retries(max_retries)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
}

fn runner_over(mock: Arc<MockBackend>, tracker: Arc<UsageTracker>, options: ExecutorOptions) -> PipelineRunner {
    let executor = StepExecutor::new(mock, Arc::new(StepRegistry::standard()))
        .with_policy(fast_policy(3))
        .with_tracker(tracker);
    assert_ok!(PipelineRunner::new(
        Arc::new(executor),
        vec![StepId::Architecture, StepId::Content, StepId::Layout],
        options,
    ))
}

#[test]
fn content_prompt_embeds_architecture_output() {
    let registry = StepRegistry::standard();
    let context = PipelineContext::new(GenerationInput::new("A bakery site"))
        .with_output(StepId::Architecture, json!({"sitemap": ["home", "about"]}));

    let prompt = assert_ok!(build_prompt(&registry, StepId::Content, &context));
    assert!(prompt.user.contains("\"home\""));
    assert!(prompt.user.contains("\"about\""));

    let bare = PipelineContext::new(GenerationInput::new("A bakery site"));
    let err = assert_err!(build_prompt(&registry, StepId::Content, &bare));
    assert_eq!(err.kind(), ErrorKind::MissingDependency);
}

#[tokio::test]
async fn three_steps_complete_with_summed_totals() {
    let mock = Arc::new(MockBackend::new(three_step_script()));
    let tracker = Arc::new(UsageTracker::new());
    let runner = runner_over(mock.clone(), tracker.clone(), ExecutorOptions::default());

    let run = runner
        .run(runner.create_run(GenerationInput::new("A bakery site").with_site_name("Crumb")))
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.history.len(), 3);
    let steps: Vec<StepId> = run.history.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![StepId::Architecture, StepId::Content, StepId::Layout]);

    let summed: u64 = run.history.iter().map(|r| r.token_usage.total).sum();
    assert_eq!(run.totals.tokens.total, summed);
    assert_eq!(tracker.total().calls, 3);
    assert_eq!(tracker.total().tokens.total, summed);

    let content = run.context.get(StepId::Content).unwrap();
    assert_eq!(content["seo"]["description"], "");
    let layout = run.final_output().unwrap();
    assert_eq!(layout["theme"]["primary"], "#b5651d");

    // The layout prompt saw both earlier outputs.
    let requests = mock.requests();
    assert!(requests[2].user_prompt.contains("Warm bread daily"));
    assert!(requests[2].user_prompt.contains("\"sitemap\""));
}

#[tokio::test]
async fn provider_errors_twice_then_success() {
    let mock = Arc::new(MockBackend::new(vec![
        MockReply::provider(503, "upstream overloaded"),
        MockReply::provider(502, "bad gateway"),
        MockReply::json(&json!({"sitemap": ["home"], "pages": []})),
    ]));
    let executor = StepExecutor::new(mock.clone(), Arc::new(StepRegistry::standard()))
        .with_policy(fast_policy(3));
    let context = PipelineContext::new(GenerationInput::new("A bakery site"));

    let result = executor
        .execute(StepId::Architecture, &context, &ExecutorOptions::default())
        .await;

    assert!(result.success);
    assert_eq!(result.retry_count, 2);
    assert_eq!(mock.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_run() {
    let mock = Arc::new(MockBackend::new(vec![MockReply::transport("connection reset")]));
    let runner = runner_over(mock.clone(), Arc::new(UsageTracker::new()), ExecutorOptions::default());

    let run = runner.run(runner.create_run(GenerationInput::new("A bakery site"))).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.history.len(), 1);
    assert_eq!(run.history[0].retry_count, 3);
    assert_eq!(mock.calls(), 4);
    let error = run.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Transport);
    assert!(error.message.contains("4 attempts"));
}

#[tokio::test]
async fn failure_halts_before_later_steps() {
    let mut script = three_step_script();
    script[1] = MockReply::auth("invalid key");
    let mock = Arc::new(MockBackend::new(script));
    let runner = runner_over(mock.clone(), Arc::new(UsageTracker::new()), ExecutorOptions::default());

    let run = runner.run(runner.create_run(GenerationInput::new("A bakery site"))).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.history.len(), 2);
    assert!(!run.history.last().unwrap().success);
    assert_eq!(run.history[1].error_kind, Some(ErrorKind::Auth));
    assert_eq!(mock.calls(), 2);
    assert!(!run.context.contains(StepId::Layout));
}

#[tokio::test]
async fn sse_frames_accumulate_in_order() {
    let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![
        Ok(&b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"[..]),
        Ok(&b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n"[..]),
        Ok(&b"data: [DONE]\n\n"[..]),
    ];
    let mut seen = Vec::new();
    let mut on_token = |_: &str, accumulated: &str| seen.push(accumulated.to_string());

    let streamed = assert_ok!(collect_stream(stream::iter(chunks), &mut on_token).await);

    assert_eq!(seen, vec!["Hel", "Hello"]);
    assert_eq!(streamed.text, "Hello");
}

#[tokio::test]
async fn sse_without_done_is_transport_error() {
    let chunks: Vec<Result<&'static [u8], std::io::Error>> =
        vec![Ok(&b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"[..])];
    let mut on_token = |_: &str, _: &str| {};

    let err = assert_err!(collect_stream(stream::iter(chunks), &mut on_token).await);
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn streaming_run_forwards_tokens_to_subscribers() {
    let mock = Arc::new(MockBackend::new(three_step_script()).with_chunk_chars(16));
    let runner = runner_over(
        mock,
        Arc::new(UsageTracker::new()),
        ExecutorOptions::default().with_streaming(true),
    );
    let service = GenerationService::new(Arc::new(runner));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let id = service.start_run(GenerationInput::new("A bakery site"));
    assert_ok!(service.on_step_progress(id, move |event| sink.lock().unwrap().push(event)));

    let run = assert_ok!(service.wait_for_run(id).await);
    assert_eq!(run.status, RunStatus::Completed);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, Event::Token { step: StepId::Layout, .. })));
    assert!(matches!(
        events.last(),
        Some(Event::RunFinished { status: RunStatus::Completed, .. })
    ));
}

#[tokio::test]
async fn cancel_mid_step_never_records_success() {
    let mock = Arc::new(MockBackend::new(vec![
        MockReply::json(&json!({"sitemap": ["home"], "pages": []})),
        MockReply::Hang,
    ]));
    let runner = runner_over(mock, Arc::new(UsageTracker::new()), ExecutorOptions::default());
    let service = GenerationService::new(Arc::new(runner));

    let started = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&started);
    let id = service.start_run(GenerationInput::new("A bakery site"));
    assert_ok!(service.subscribe(
        id,
        Arc::new(FnEventHandler(move |event: Event| {
            if let Event::StepStarted { step, .. } = event {
                sink.lock().unwrap().push(step);
            }
        })),
    ));

    // Wait until the content step is in flight.
    for _ in 0..200 {
        if started.lock().unwrap().contains(&StepId::Content) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_ok!(service.cancel_run(id));

    let run = assert_ok!(service.wait_for_run(id).await);
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.history.len(), 1);
    assert!(run.history.iter().all(|r| r.step != StepId::Content));
    assert!(run.error.is_none());

    let taken = assert_ok!(service.take_run(id));
    assert!(taken.is_some());
    assert!(service.run_ids().is_empty());
}
