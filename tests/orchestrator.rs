//! Orchestrator Integration Tests
//!
//! Tests for skip/invalidate/execute decisions, dependency ordering,
//! force handling and failure behavior against a real SQLite store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use stagehand::core::{
    EngineError, Orchestrator, SignatureStore, SqliteSignatureStore, Stage, StageRegistry,
};
use stagehand::domain::{Signature, StageId, StageState};

/// One observable call made by the engine on a test stage
#[derive(Debug, Clone, PartialEq)]
enum Call {
    Signature(String),
    Invalidate {
        stage: String,
        previous: Option<Signature>,
        current: Signature,
        force: bool,
    },
    Execute(String),
}

/// Shared external world the test stages read from
#[derive(Clone, Default)]
struct World {
    calls: Arc<Mutex<Vec<Call>>>,
    signatures: Arc<Mutex<HashMap<String, String>>>,
    failing_execute: Arc<Mutex<HashSet<String>>>,
    failing_invalidate: Arc<Mutex<HashSet<String>>>,
    failing_signature: Arc<Mutex<HashSet<String>>>,
}

impl World {
    fn set_signature(&self, stage: &str, signature: &str) {
        self.signatures
            .lock()
            .unwrap()
            .insert(stage.to_string(), signature.to_string());
    }

    fn fail_execute(&self, stage: &str, fail: bool) {
        let mut failing = self.failing_execute.lock().unwrap();
        if fail {
            failing.insert(stage.to_string());
        } else {
            failing.remove(stage);
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn position(&self, call: &Call) -> usize {
        self.calls()
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("call {:?} not recorded", call))
    }
}

struct RecordingStage {
    name: String,
    dependencies: Vec<StageId>,
    world: World,
}

#[async_trait]
impl Stage for RecordingStage {
    fn dependencies(&self) -> Vec<StageId> {
        self.dependencies.clone()
    }

    async fn signature(&self) -> Result<Signature> {
        self.world
            .calls
            .lock()
            .unwrap()
            .push(Call::Signature(self.name.clone()));

        if self.world.failing_signature.lock().unwrap().contains(&self.name) {
            anyhow::bail!("upstream unavailable");
        }

        let signatures = self.world.signatures.lock().unwrap();
        let value = signatures
            .get(&self.name)
            .cloned()
            .unwrap_or_else(|| "v0".to_string());
        Ok(Signature::from(value))
    }

    async fn execute(&self) -> Result<()> {
        self.world
            .calls
            .lock()
            .unwrap()
            .push(Call::Execute(self.name.clone()));

        if self.world.failing_execute.lock().unwrap().contains(&self.name) {
            anyhow::bail!("disk full");
        }
        Ok(())
    }

    async fn invalidate(
        &self,
        previous: Option<&Signature>,
        current: &Signature,
        force: bool,
    ) -> Result<()> {
        self.world.calls.lock().unwrap().push(Call::Invalidate {
            stage: self.name.clone(),
            previous: previous.cloned(),
            current: current.clone(),
            force,
        });

        if self.world.failing_invalidate.lock().unwrap().contains(&self.name) {
            anyhow::bail!("permission denied");
        }
        Ok(())
    }
}

fn registry(world: &World, graph: &[(&str, &[&str])]) -> StageRegistry<()> {
    let mut registry = StageRegistry::new();

    for (name, deps) in graph {
        let name = name.to_string();
        let deps: Vec<StageId> = deps.iter().map(|d| StageId::from(*d)).collect();
        let world = world.clone();

        registry.register(name.clone(), move |_, _: &()| {
            Ok(Box::new(RecordingStage {
                name: name.clone(),
                dependencies: deps.clone(),
                world: world.clone(),
            }) as Box<dyn Stage>)
        });
    }

    registry
}

async fn run(
    registry: &StageRegistry<()>,
    store: &mut SqliteSignatureStore,
    root: &str,
    force: bool,
) -> Result<stagehand::RunReport, EngineError> {
    let mut orchestrator = Orchestrator::new(registry, &(), store);
    orchestrator.run(&StageId::from(root), force).await
}

fn recorded(store: &mut SqliteSignatureStore, stage: &str) -> Option<Signature> {
    let store: &mut dyn SignatureStore = store;
    store
        .with_transaction(|tx| tx.get(&StageId::from(stage)))
        .unwrap()
}

fn invalidate(stage: &str, previous: Option<&str>, current: &str, force: bool) -> Call {
    Call::Invalidate {
        stage: stage.to_string(),
        previous: previous.map(Signature::from),
        current: Signature::from(current),
        force,
    }
}

fn execute(stage: &str) -> Call {
    Call::Execute(stage.to_string())
}

#[tokio::test]
async fn test_literal_scenarios() {
    let world = World::default();
    let registry = registry(&world, &[("StageA", &[]), ("StageB", &["StageA"])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    // 1. Empty store: invalidate(absent, v1) then execute
    world.set_signature("StageA", "v1");
    run(&registry, &mut store, "StageA", false).await.unwrap();
    assert_eq!(
        world.take_calls(),
        vec![
            Call::Signature("StageA".into()),
            invalidate("StageA", None, "v1", false),
            execute("StageA"),
        ]
    );
    assert_eq!(recorded(&mut store, "StageA"), Some(Signature::from("v1")));

    // 2. Unchanged signature: nothing happens
    let report = run(&registry, &mut store, "StageA", false).await.unwrap();
    assert_eq!(world.take_calls(), vec![Call::Signature("StageA".into())]);
    assert_eq!(report.skipped(), vec![&StageId::from("StageA")]);

    // 3. Signature changes: invalidate(v1, v2) then execute
    world.set_signature("StageA", "v2");
    run(&registry, &mut store, "StageA", false).await.unwrap();
    assert_eq!(
        world.take_calls(),
        vec![
            Call::Signature("StageA".into()),
            invalidate("StageA", Some("v1"), "v2", false),
            execute("StageA"),
        ]
    );
    assert_eq!(recorded(&mut store, "StageA"), Some(Signature::from("v2")));

    // 4. Forced with unchanged signature
    run(&registry, &mut store, "StageA", true).await.unwrap();
    assert_eq!(
        world.take_calls(),
        vec![
            Call::Signature("StageA".into()),
            invalidate("StageA", Some("v2"), "v2", true),
            execute("StageA"),
        ]
    );

    // 5. StageB depends on StageA; only StageB changed
    world.set_signature("StageB", "b1");
    run(&registry, &mut store, "StageB", false).await.unwrap();
    world.take_calls();

    world.set_signature("StageB", "b2");
    let report = run(&registry, &mut store, "StageB", false).await.unwrap();
    assert_eq!(
        world.take_calls(),
        vec![
            Call::Signature("StageA".into()),
            Call::Signature("StageB".into()),
            invalidate("StageB", Some("b1"), "b2", false),
            execute("StageB"),
        ]
    );
    assert_eq!(report.get(&"StageA".into()).unwrap().state, StageState::Skipped);
    assert_eq!(report.get(&"StageB".into()).unwrap().state, StageState::Recorded);
}

#[tokio::test]
async fn test_idempotent_second_run() {
    let world = World::default();
    let registry = registry(&world, &[("extract", &[])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();
    world.set_signature("extract", "s1");

    run(&registry, &mut store, "extract", false).await.unwrap();
    run(&registry, &mut store, "extract", false).await.unwrap();

    assert_eq!(world.count(|c| matches!(c, Call::Execute(_))), 1);
    assert_eq!(world.count(|c| matches!(c, Call::Invalidate { .. })), 1);
}

#[tokio::test]
async fn test_dependencies_settle_before_dependent_signature() {
    let world = World::default();
    let registry = registry(
        &world,
        &[("load", &["transform"]), ("transform", &["extract"]), ("extract", &[])],
    );
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    let report = run(&registry, &mut store, "load", false).await.unwrap();

    let order: Vec<&str> = report.stages.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(order, vec!["extract", "transform", "load"]);

    assert!(world.position(&execute("extract")) < world.position(&Call::Signature("transform".into())));
    assert!(world.position(&execute("transform")) < world.position(&Call::Signature("load".into())));
}

#[tokio::test]
async fn test_siblings_follow_declaration_order() {
    let world = World::default();
    let registry = registry(
        &world,
        &[("all", &["c", "a", "b"]), ("a", &[]), ("b", &[]), ("c", &[])],
    );
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    let orchestrator = Orchestrator::new(&registry, &(), &mut store);
    let plan = orchestrator.plan(&StageId::from("all")).unwrap();
    let plan: Vec<&str> = plan.iter().map(StageId::as_str).collect();
    assert_eq!(plan, vec!["c", "a", "b", "all"]);
}

#[tokio::test]
async fn test_force_is_not_propagated_to_dependencies() {
    let world = World::default();
    let registry = registry(&world, &[("publish", &["build"]), ("build", &[])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    run(&registry, &mut store, "publish", false).await.unwrap();
    world.take_calls();

    run(&registry, &mut store, "publish", true).await.unwrap();

    assert_eq!(
        world.count(|c| matches!(c, Call::Invalidate { stage, .. } if stage == "build")),
        0
    );
    assert_eq!(world.count(|c| *c == execute("build")), 0);
    assert_eq!(
        world.count(|c| *c == invalidate("publish", Some("v0"), "v0", true)),
        1
    );
    assert_eq!(world.count(|c| *c == execute("publish")), 1);
}

#[tokio::test]
async fn test_failed_execute_keeps_previous_record() {
    let world = World::default();
    let registry = registry(&world, &[("load", &[])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    world.set_signature("load", "v1");
    run(&registry, &mut store, "load", false).await.unwrap();

    world.set_signature("load", "v2");
    world.fail_execute("load", true);
    let err = run(&registry, &mut store, "load", false).await.unwrap_err();

    assert!(matches!(err, EngineError::Execution { ref stage, .. } if stage.as_str() == "load"));
    assert_eq!(recorded(&mut store, "load"), Some(Signature::from("v1")));

    // Still stale, so the next run retries
    world.fail_execute("load", false);
    world.take_calls();
    run(&registry, &mut store, "load", false).await.unwrap();
    assert_eq!(world.count(|c| *c == invalidate("load", Some("v1"), "v2", false)), 1);
    assert_eq!(recorded(&mut store, "load"), Some(Signature::from("v2")));
}

#[tokio::test]
async fn test_failed_first_execute_leaves_no_record() {
    let world = World::default();
    let registry = registry(&world, &[("load", &[])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    world.fail_execute("load", true);
    assert!(run(&registry, &mut store, "load", false).await.is_err());
    assert_eq!(recorded(&mut store, "load"), None);
}

#[tokio::test]
async fn test_failed_invalidate_skips_execute() {
    let world = World::default();
    let registry = registry(&world, &[("load", &[])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();
    world
        .failing_invalidate
        .lock()
        .unwrap()
        .insert("load".to_string());

    let err = run(&registry, &mut store, "load", false).await.unwrap_err();

    assert!(matches!(err, EngineError::Invalidation { .. }));
    assert_eq!(world.count(|c| matches!(c, Call::Execute(_))), 0);
    assert_eq!(recorded(&mut store, "load"), None);
}

#[tokio::test]
async fn test_signature_failure_aborts_dependents() {
    let world = World::default();
    let registry = registry(&world, &[("report", &["fetch"]), ("fetch", &[])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();
    world
        .failing_signature
        .lock()
        .unwrap()
        .insert("fetch".to_string());

    let err = run(&registry, &mut store, "report", false).await.unwrap_err();

    assert!(matches!(err, EngineError::Signature { ref stage, .. } if stage.as_str() == "fetch"));
    assert_eq!(world.count(|c| *c == Call::Signature("report".into())), 0);
    assert_eq!(recorded(&mut store, "fetch"), None);
    assert_eq!(recorded(&mut store, "report"), None);
}

#[tokio::test]
async fn test_partial_failure_keeps_completed_stages() {
    let world = World::default();
    let registry = registry(&world, &[("publish", &["build"]), ("build", &[])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();
    world.set_signature("build", "b1");
    world.set_signature("publish", "p1");
    world.fail_execute("publish", true);

    let err = run(&registry, &mut store, "publish", false).await.unwrap_err();
    assert_eq!(err.stage(), Some(&StageId::from("publish")));

    // build stays recorded; a re-run resumes at publish
    assert_eq!(recorded(&mut store, "build"), Some(Signature::from("b1")));
    assert_eq!(recorded(&mut store, "publish"), None);

    world.fail_execute("publish", false);
    world.take_calls();
    let report = run(&registry, &mut store, "publish", false).await.unwrap();
    assert_eq!(report.executed(), vec![&StageId::from("publish")]);
    assert_eq!(report.skipped(), vec![&StageId::from("build")]);
}

#[tokio::test]
async fn test_unknown_dependency_aborts_before_any_mutation() {
    let world = World::default();
    let registry = registry(&world, &[("all", &["a", "ghost"]), ("a", &[])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    let err = run(&registry, &mut store, "all", false).await.unwrap_err();

    assert!(matches!(err, EngineError::Resolution { ref stage, .. } if stage.as_str() == "ghost"));
    assert!(world.calls().is_empty());
    assert_eq!(recorded(&mut store, "a"), None);
}

#[tokio::test]
async fn test_cycle_is_reported_with_path() {
    let world = World::default();
    let registry = registry(&world, &[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    let err = run(&registry, &mut store, "a", false).await.unwrap_err();

    match err {
        EngineError::Cycle { path } => {
            let path: Vec<&str> = path.iter().map(StageId::as_str).collect();
            assert_eq!(path, vec!["a", "b", "c", "a"]);
        }
        other => panic!("Expected Cycle error, got {:?}", other),
    }
    assert!(world.calls().is_empty());
}

#[tokio::test]
async fn test_shared_dependency_settles_once() {
    let world = World::default();
    let registry = registry(
        &world,
        &[
            ("top", &["left", "right"]),
            ("left", &["base"]),
            ("right", &["base"]),
            ("base", &[]),
        ],
    );
    let mut store = SqliteSignatureStore::open_in_memory().unwrap();

    let report = run(&registry, &mut store, "top", false).await.unwrap();

    let order: Vec<&str> = report.stages.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(order, vec!["base", "left", "right", "top"]);
    assert_eq!(world.count(|c| *c == Call::Signature("base".into())), 1);
}
