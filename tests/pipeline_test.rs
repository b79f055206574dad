mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{settings, ScriptedGateway};
use flowcast::cache::{CacheLimits, ResponseCache};
use flowcast::export::ArtifactFormat;
use flowcast::gateway::{GatewayError, ModelGateway};
use flowcast::prompt::RawModelResponse;
use flowcast::parser::{ParseError, ParseStep};
use flowcast::pipeline::StageError;
use flowcast::{Pipeline, Prompt, Settings, Stage};
use tokio::sync::Notify;

fn pipeline(settings: &Settings, gateway: Arc<ScriptedGateway>) -> Pipeline {
    let cache = ResponseCache::open(&settings.cache_dir, CacheLimits::default()).unwrap();
    Pipeline::new(settings, gateway, Arc::new(cache))
}

/// Holds its answer until released, so a test can finish another run first.
struct GatedGateway {
    answer: &'static str,
    entered: Notify,
    release: Notify,
}

impl GatedGateway {
    fn new(answer: &'static str) -> Arc<Self> {
        Arc::new(Self {
            answer,
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl ModelGateway for GatedGateway {
    async fn generate(&self, prompt: &Prompt) -> Result<RawModelResponse, GatewayError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(RawModelResponse {
            fingerprint: prompt.fingerprint(),
            model: "gated".to_string(),
            text: self.answer.to_string(),
        })
    }
}

fn out_dir_files(settings: &Settings) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(settings.output_dir())
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn out_dir_is_empty(settings: &Settings) -> bool {
    std::fs::read_dir(settings.output_dir())
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[test_log::test(tokio::test)]
async fn test_prompt_to_artifacts_and_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let gateway = ScriptedGateway::new(vec![Ok("Start leads to Validate, Validate leads to End")]);
    let pipeline = pipeline(&settings, gateway.clone());
    let prompt = Prompt::new("Draw a validation flow");

    let first = pipeline.run(&prompt).await.unwrap();
    assert!(!first.cache_hit);
    let ids: Vec<&str> = first.spec.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["start", "validate", "end"]);
    assert!(first.spec.has_edge("start", "validate"));
    assert!(first.spec.has_edge("validate", "end"));
    assert_eq!(first.artifacts.len(), 2);
    for artifact in &first.artifacts {
        assert!(artifact.path.is_file());
        assert!(artifact.file_name().unwrap().starts_with(prompt.fingerprint().as_str()));
    }

    let second = pipeline.run(&Prompt::new("  Draw a   validation flow ")).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(gateway.calls(), 1);
    assert_eq!(second.spec, first.spec);
    assert_eq!(second.layout, first.layout);
    assert_eq!(second.frames, first.frames);
}

#[tokio::test]
async fn test_model_animation_cues_survive_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let answer = r#"{"nodes": [{"id": "a", "label": "Start", "type": "start"},
                              {"id": "b", "label": "Finish", "type": "end"}],
                   "edges": [{"from": "a", "to": "b"}],
                   "animations": [{"element": "b", "effect": "fadeIn", "order": 1},
                                  {"element": "edge_a_b", "effect": "highlight", "order": 2}]}"#;
    let gateway = ScriptedGateway::new(vec![Ok(answer)]);
    let pipeline = pipeline(&settings, gateway.clone());
    let prompt = Prompt::new("reverse reveal");

    let first = pipeline.run(&prompt).await.unwrap();
    assert_eq!(first.spec.animations.len(), 2);
    let first_seen = |id: &str| first.frames.iter().position(|f| f.node(id).is_some());
    assert!(first_seen("b") < first_seen("a"));
    assert!(first
        .frames
        .iter()
        .any(|f| f.edge("a", "b").map_or(false, |e| e.highlighted)));

    let second = pipeline.run(&prompt).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(gateway.calls(), 1);
    assert_eq!(second.spec.animations, first.spec.animations);
    assert_eq!(second.frames, first.frames);
}

#[tokio::test]
async fn test_self_loop_is_dropped_and_traced() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let gateway = ScriptedGateway::new(vec![Ok("A connects to a, then A connects to B")]);
    let output = pipeline(&settings, gateway).run(&Prompt::new("ab")).await.unwrap();

    assert_eq!(output.spec.nodes.len(), 2);
    assert_eq!(output.spec.edges.len(), 1);
    assert!(output.spec.has_edge("a", "b"));
    assert!(output
        .trace
        .steps()
        .iter()
        .any(|step| matches!(step, ParseStep::SelfLoopDropped { node } if node == "a")));
}

#[test_log::test(tokio::test)]
async fn test_gateway_failure_leaves_cache_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let gateway = ScriptedGateway::new(vec![Err(GatewayError::NonSuccessStatus {
        status: 500,
        body: "boom".to_string(),
    })]);
    let pipeline = pipeline(&settings, gateway);
    let prompt = Prompt::new("anything");

    let err = pipeline.run(&prompt).await.unwrap_err();
    assert_eq!(err.stage, Stage::Gateway);
    assert_eq!(err.fingerprint, prompt.fingerprint());
    assert!(matches!(
        err.source,
        StageError::Gateway(GatewayError::NonSuccessStatus { status: 500, .. })
    ));
    assert!(err.user_message().contains("HTTP 500"));

    assert_eq!(pipeline.cache().stats().await.entries, 0);
    assert!(out_dir_is_empty(&settings));
}

#[tokio::test]
async fn test_unparseable_answer_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let gateway = ScriptedGateway::new(vec![Ok("I'm sorry, I cannot help with that request.")]);
    let pipeline = pipeline(&settings, gateway);

    let err = pipeline.run(&Prompt::new("draw")).await.unwrap_err();
    assert_eq!(err.stage, Stage::Parse);
    assert!(matches!(err.source, StageError::Parse(ParseError::NoStructureFound)));
    assert_eq!(pipeline.cache().stats().await.entries, 0);
}

#[tokio::test]
async fn test_cycles_rejected_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        allow_cycles: false,
        ..settings(dir.path())
    };
    let gateway = ScriptedGateway::new(vec![Ok("Fetch leads to Check. Check loops back to Fetch.")]);

    let err = pipeline(&settings, gateway).run(&Prompt::new("loop")).await.unwrap_err();
    assert_eq!(err.stage, Stage::Build);
    assert!(out_dir_is_empty(&settings));
}

#[tokio::test]
async fn test_changed_settings_bypass_stale_entry() {
    let dir = tempfile::tempdir().unwrap();
    let answer = "Start leads to Work. Work leads to End.";
    let prompt = Prompt::new("work flow");

    let fast = Settings {
        animation_speed: 2.0,
        ..settings(dir.path())
    };
    let fast_gateway = ScriptedGateway::new(vec![Ok(answer)]);
    let fast_run = pipeline(&fast, fast_gateway).run(&prompt).await.unwrap();

    let slow = Settings {
        animation_speed: 0.5,
        ..settings(dir.path())
    };
    let slow_gateway = ScriptedGateway::new(vec![Ok(answer)]);
    let slow_pipeline = pipeline(&slow, slow_gateway.clone());
    let slow_run = slow_pipeline.run(&prompt).await.unwrap();

    assert!(!slow_run.cache_hit);
    assert_eq!(slow_gateway.calls(), 1);
    assert!(slow_run.frames.len() > fast_run.frames.len());
    assert!(fast_run.frames.len() >= 2);

    let again = slow_pipeline.run(&prompt).await.unwrap();
    assert!(again.cache_hit);
    assert_eq!(slow_gateway.calls(), 1);
}

#[test_log::test(tokio::test)]
async fn test_slower_concurrent_run_keeps_cached_files_intact() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let cache = Arc::new(ResponseCache::open(&settings.cache_dir, CacheLimits::default()).unwrap());
    let prompt = Prompt::new("race");

    let late_gateway = GatedGateway::new("Alpha leads to Omega");
    let late = Arc::new(Pipeline::new(&settings, late_gateway.clone(), Arc::clone(&cache)));
    let late_run = {
        let late = Arc::clone(&late);
        let prompt = prompt.clone();
        tokio::spawn(async move { late.run(&prompt).await })
    };
    // The late run has missed the cache and is waiting on the model.
    late_gateway.entered.notified().await;

    let early = Pipeline::new(
        &settings,
        ScriptedGateway::new(vec![Ok("Start leads to End")]),
        Arc::clone(&cache),
    );
    let won = early.run(&prompt).await.unwrap();
    assert!(!won.cache_hit);

    late_gateway.release.notify_one();
    let lost = late_run.await.unwrap().unwrap();
    assert_eq!(lost.spec, won.spec);
    assert_eq!(lost.artifacts, won.artifacts);

    let svg = won
        .artifacts
        .iter()
        .find(|a| a.format == ArtifactFormat::Svg)
        .unwrap();
    let drawn = std::fs::read_to_string(&svg.path).unwrap();
    assert!(drawn.contains("Start"));
    assert!(!drawn.contains("Alpha"));

    let fp = prompt.fingerprint();
    assert_eq!(
        out_dir_files(&settings),
        vec![format!("{}.mmd", fp), format!("{}.svg", fp)]
    );
}

#[tokio::test]
async fn test_result_larger_than_cache_is_returned_uncached() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let limits = CacheLimits {
        max_bytes: 10,
        ..CacheLimits::default()
    };
    let cache = ResponseCache::open(&settings.cache_dir, limits).unwrap();
    let gateway = ScriptedGateway::new(vec![Ok("Start leads to End")]);
    let pipeline = Pipeline::new(&settings, gateway, Arc::new(cache));

    let output = pipeline.run(&Prompt::new("big")).await.unwrap();
    assert!(!output.cache_hit);
    assert_eq!(output.artifacts.len(), 2);
    for artifact in &output.artifacts {
        assert!(artifact.path.is_file(), "{} is missing", artifact.path.display());
    }
    assert_eq!(pipeline.cache().stats().await.entries, 0);
}

#[tokio::test]
async fn test_failed_cache_write_leaves_no_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let gateway = ScriptedGateway::new(vec![Ok("Start leads to End")]);
    let pipeline = pipeline(&settings, gateway);
    // A directory where the index file should go makes every index write fail.
    std::fs::create_dir(settings.cache_dir.join("index.json")).unwrap();

    let err = pipeline.run(&Prompt::new("unsaved")).await.unwrap_err();
    assert_eq!(err.stage, Stage::Cache);
    assert_eq!(pipeline.cache().stats().await.entries, 0);
    assert!(out_dir_is_empty(&settings), "left {:?}", out_dir_files(&settings));
}
