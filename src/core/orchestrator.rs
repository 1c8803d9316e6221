//! Signature-driven stage orchestrator.
//!
//! Given a root stage, resolves its dependency graph, then settles every
//! stage (dependencies first) by comparing its current signature against
//! the one recorded in the signature store:
//!
//! - unchanged signature: skip
//! - changed or missing signature, or forced root: invalidate, execute, record
//!
//! Each stage uses two store transactions: a short one for the staleness
//! read and a second one spanning invalidate/execute/record. Nothing holds a
//! lock across the two, so concurrent runs over overlapping graphs need
//! external mutual exclusion (see `RunLock`).
//!
//! `force` applies to the root stage only; dependencies are settled on their
//! signatures alone.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::domain::{RunReport, Signature, StageId, StageReport, StageState};

use super::error::EngineError;
use super::resolver::StageResolver;
use super::signature_store::SignatureStore;
use super::stage::Stage;

/// A resolved stage waiting to be settled
struct PlannedStage {
    id: StageId,
    stage: Box<dyn Stage>,
    force: bool,
}

/// Worklist frame used while walking the dependency graph
struct Frame {
    id: StageId,
    stage: Box<dyn Stage>,
    pending: std::vec::IntoIter<StageId>,
    force: bool,
}

/// Drives stages to an up-to-date state
pub struct Orchestrator<'a, C> {
    resolver: &'a dyn StageResolver<C>,
    config: &'a C,
    store: &'a mut dyn SignatureStore,
}

impl<'a, C> Orchestrator<'a, C> {
    pub fn new(
        resolver: &'a dyn StageResolver<C>,
        config: &'a C,
        store: &'a mut dyn SignatureStore,
    ) -> Self {
        Self {
            resolver,
            config,
            store,
        }
    }

    /// Settle order for `root`: every dependency before its dependents
    pub fn plan(&self, root: &StageId) -> Result<Vec<StageId>, EngineError> {
        settle_order(self.resolver, self.config, root)
    }

    /// Bring `root` and its transitive dependencies up to date
    ///
    /// Stages recorded before a failure stay recorded; the failing stage's
    /// record is left exactly as it was.
    #[instrument(skip(self, root), fields(root = %root))]
    pub async fn run(&mut self, root: &StageId, force: bool) -> Result<RunReport, EngineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "Starting stage run");

        let planned = resolve_graph(self.resolver, self.config, root, force)?;
        debug!(stages = planned.len(), "Dependency graph resolved");

        let mut stages = Vec::with_capacity(planned.len());
        for planned in planned {
            match self.settle(&planned).await {
                Ok(report) => stages.push(report),
                Err(e) => {
                    error!(stage = %planned.id, error = %e, "Stage failed");
                    return Err(e);
                }
            }
        }

        let report = RunReport {
            run_id,
            root: root.clone(),
            force,
            started_at,
            completed_at: Utc::now(),
            stages,
        };

        info!(
            %run_id,
            executed = report.executed().len(),
            skipped = report.skipped().len(),
            "Stage run completed"
        );

        Ok(report)
    }

    /// Settle one stage whose dependencies are already settled
    async fn settle(&mut self, planned: &PlannedStage) -> Result<StageReport, EngineError> {
        let started = Instant::now();
        let id = &planned.id;
        let stage = planned.stage.as_ref();
        let force = planned.force;
        let mut state = StageState::DepsResolved;

        let current = stage
            .signature()
            .await
            .map_err(|source| EngineError::Signature {
                stage: id.clone(),
                source,
            })?;
        advance(id, &mut state, StageState::SignatureComputed);

        // T1: staleness check
        let previous: Option<Signature> = self.store.with_transaction(|tx| tx.get(id))?;

        let need_invalidate = previous.as_ref() != Some(&current);
        let mut need_execute = need_invalidate;
        let mut invalidated = false;

        // T2: invalidate, execute and record; dropped (rolled back) on error
        let mut tx = self.store.begin()?;

        if need_invalidate || force {
            let previous_digest = previous
                .as_ref()
                .map(Signature::digest)
                .unwrap_or_else(|| "none".to_string());
            info!(
                stage = %id,
                previous = %previous_digest,
                current = %current.digest(),
                force,
                "Invalidating stage"
            );
            stage
                .invalidate(previous.as_ref(), &current, force)
                .await
                .map_err(|source| EngineError::Invalidation {
                    stage: id.clone(),
                    source,
                })?;
            tx.delete(id)?;
            need_execute = true;
            invalidated = true;
            advance(id, &mut state, StageState::InvalidatedPendingExecute);
        }

        if need_execute {
            info!(stage = %id, "Executing stage");
            stage
                .execute()
                .await
                .map_err(|source| EngineError::Execution {
                    stage: id.clone(),
                    source,
                })?;
            advance(id, &mut state, StageState::Executed);

            tx.put(id, &current)?;
            tx.commit()?;
            advance(id, &mut state, StageState::Recorded);
        } else {
            tx.commit()?;
            info!(stage = %id, "skipping stage {}", id);
            advance(id, &mut state, StageState::Skipped);
        }

        Ok(StageReport {
            stage: id.clone(),
            state,
            invalidated,
            previous,
            signature: current,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Settle order for `root` without touching any signature store
///
/// Resolves every stage in the graph, so unknown stages and cycles are
/// reported exactly as `Orchestrator::run` would report them.
pub fn settle_order<C>(
    resolver: &dyn StageResolver<C>,
    config: &C,
    root: &StageId,
) -> Result<Vec<StageId>, EngineError> {
    Ok(resolve_graph(resolver, config, root, false)?
        .into_iter()
        .map(|planned| planned.id)
        .collect())
}

/// Resolve the graph below `root` into settle order.
///
/// Depth-first with an explicit stack; dependencies are visited
/// left-to-right and each stage appears once, at its first post-order
/// position. Fails before any store access on unknown stages or cycles.
fn resolve_graph<C>(
    resolver: &dyn StageResolver<C>,
    config: &C,
    root: &StageId,
    force: bool,
) -> Result<Vec<PlannedStage>, EngineError> {
    let mut order = Vec::new();
    let mut settled: HashSet<StageId> = HashSet::new();
    let mut stack = vec![resolve_frame(resolver, config, root.clone(), force)?];

    loop {
        let next = match stack.last_mut() {
            Some(frame) => frame.pending.next(),
            None => break,
        };

        match next {
            Some(dep) => {
                if settled.contains(&dep) {
                    continue;
                }

                if let Some(pos) = stack.iter().position(|f| f.id == dep) {
                    let mut path: Vec<StageId> =
                        stack[pos..].iter().map(|f| f.id.clone()).collect();
                    path.push(dep);
                    return Err(EngineError::Cycle { path });
                }

                stack.push(resolve_frame(resolver, config, dep, false)?);
            }
            None => {
                if let Some(frame) = stack.pop() {
                    debug!(stage = %frame.id, state = ?StageState::DepsResolved, "Stage transition");
                    settled.insert(frame.id.clone());
                    order.push(PlannedStage {
                        id: frame.id,
                        stage: frame.stage,
                        force: frame.force,
                    });
                }
            }
        }
    }

    Ok(order)
}

fn resolve_frame<C>(
    resolver: &dyn StageResolver<C>,
    config: &C,
    id: StageId,
    force: bool,
) -> Result<Frame, EngineError> {
    let stage = resolver.resolve(&id, config)?;
    debug!(stage = %id, state = ?StageState::Start, "Stage transition");
    let pending = stage.dependencies().into_iter();

    Ok(Frame {
        id,
        stage,
        pending,
        force,
    })
}

fn advance(stage: &StageId, state: &mut StageState, next: StageState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal stage transition {:?} -> {:?}",
        state,
        next
    );
    debug!(stage = %stage, from = ?state, to = ?next, "Stage transition");
    *state = next;
}
