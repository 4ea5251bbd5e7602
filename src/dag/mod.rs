//! In-memory stage DAG with an incrementally-maintained runnable frontier.
//!
//! The graph is an adjacency list plus one unfinished-predecessor counter
//! per stage. Finishing a stage decrements each dependent's counter and
//! promotes counters that reach zero onto the frontier, so every completion
//! costs O(out-degree) instead of a full graph scan. At thirty thousand
//! stages that difference is the whole ballgame.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::models::{FailureCause, Fingerprint, Stage, StageId, StageStatus, StageTemplate};

#[derive(Debug, Error)]
pub enum DagError {
    #[error("unknown stage id {0}")]
    UnknownStage(StageId),
    #[error("stage {0:?} cannot depend on itself")]
    SelfDependency(String),
    #[error("dependency cycle involving stage {0:?}")]
    Cycle(String),
    #[error("stage {stage:?} is {status} and cannot be dispatched")]
    NotRunnable { stage: String, status: &'static str },
}

/// Insertion-ordered set of runnable stage ids.
///
/// Backed by a BTreeMap keyed on an insertion counter: iteration follows
/// insertion order, and membership changes stay O(log n) with no stale
/// entries to skip.
#[derive(Debug, Default)]
struct RunnableSet {
    by_order: BTreeMap<u64, StageId>,
    order_of: HashMap<StageId, u64>,
    next_order: u64,
}

impl RunnableSet {
    fn insert(&mut self, id: StageId) {
        if self.order_of.contains_key(&id) {
            return;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.by_order.insert(order, id);
        self.order_of.insert(id, order);
    }

    fn remove(&mut self, id: StageId) -> bool {
        match self.order_of.remove(&id) {
            Some(order) => {
                self.by_order.remove(&order);
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: StageId) -> bool {
        self.order_of.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.order_of.len()
    }

    fn iter(&self) -> impl Iterator<Item = StageId> + '_ {
        self.by_order.values().copied()
    }
}

/// Aggregate stage counts, as reported by the status RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DagCounts {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
    pub running: usize,
    pub runnable: usize,
}

/// The stage DAG and its runtime state.
///
/// Stages are added during the build phase (plus completion-time followups)
/// and never removed; dependency edges only ever connect existing stages.
#[derive(Debug, Default)]
pub struct StageDag {
    stages: Vec<Stage>,
    by_fingerprint: HashMap<Fingerprint, StageId>,
    dependents: Vec<Vec<StageId>>,
    predecessors: Vec<Vec<StageId>>,
    unfinished_preds: Vec<u32>,
    runnable: RunnableSet,
}

impl StageDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a DAG from pipeline-file templates, wiring `depends` by name.
    pub fn from_templates(templates: &[StageTemplate]) -> Result<Self, DagError> {
        let mut dag = Self::new();
        let mut by_name: HashMap<String, StageId> = HashMap::new();
        for template in templates {
            let id = dag.add_stage(template.clone());
            by_name.insert(template.name.clone(), id);
        }
        for template in templates {
            // Unknown names were rejected by pipeline-file validation; a
            // missing entry here means a programmatic builder misfired.
            let Some(&to) = by_name.get(&template.name) else {
                continue;
            };
            for dep in &template.depends {
                if let Some(&from) = by_name.get(dep) {
                    dag.add_dependency(from, to)?;
                }
            }
        }
        dag.topological_validate()?;
        Ok(dag)
    }

    /// Add a stage, deduplicating by fingerprint.
    ///
    /// Registration pipelines routinely construct the same blur or average
    /// stage from several places; the second construction resolves to the
    /// first stage's id instead of scheduling the command twice.
    pub fn add_stage(&mut self, template: StageTemplate) -> StageId {
        let fingerprint = template.fingerprint();
        if let Some(&existing) = self.by_fingerprint.get(&fingerprint) {
            return existing;
        }
        let id = self.stages.len() as StageId;
        self.stages.push(Stage::from_template(id, template));
        self.by_fingerprint.insert(fingerprint, id);
        self.dependents.push(Vec::new());
        self.predecessors.push(Vec::new());
        self.unfinished_preds.push(0);
        id
    }

    /// Add a dependency edge: `to` becomes runnable only after `from`
    /// finishes. Duplicate edges are ignored. An edge from an
    /// already-finished stage (a completion-time followup) does not count
    /// toward the dependent's unfinished predecessors.
    pub fn add_dependency(&mut self, from: StageId, to: StageId) -> Result<(), DagError> {
        let from_idx = from as usize;
        let to_idx = to as usize;
        if from_idx >= self.stages.len() {
            return Err(DagError::UnknownStage(from));
        }
        if to_idx >= self.stages.len() {
            return Err(DagError::UnknownStage(to));
        }
        if from == to {
            return Err(DagError::SelfDependency(self.stages[from_idx].name.clone()));
        }
        if self.dependents[from_idx].contains(&to) {
            return Ok(());
        }
        self.dependents[from_idx].push(to);
        self.predecessors[to_idx].push(from);
        if self.stages[from_idx].status != StageStatus::Finished {
            self.unfinished_preds[to_idx] += 1;
        }
        Ok(())
    }

    /// Kahn's algorithm over a scratch copy of the in-degrees. A cycle is a
    /// fatal build-time error naming one participating stage.
    pub fn topological_validate(&self) -> Result<(), DagError> {
        let mut indegree: Vec<usize> = self.predecessors.iter().map(|p| p.len()).collect();
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &dep in &self.dependents[node] {
                let d = &mut indegree[dep as usize];
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dep as usize);
                }
            }
        }
        if visited == self.stages.len() {
            return Ok(());
        }
        let stuck = indegree
            .iter()
            .position(|&d| d > 0)
            .map(|i| self.stages[i].name.clone())
            .unwrap_or_default();
        Err(DagError::Cycle(stuck))
    }

    /// Mark every stage whose fingerprint appears in `done` as finished,
    /// without touching the completion log. Returns how many were resumed.
    ///
    /// Must run before [`activate`](Self::activate): counters and the
    /// frontier are rebuilt afterwards, so resume order does not matter.
    pub fn resume_finished(&mut self, done: &HashSet<Fingerprint>) -> usize {
        let mut resumed = 0;
        for stage in &mut self.stages {
            if stage.status == StageStatus::NotStarted && done.contains(stage.fingerprint()) {
                stage.status = StageStatus::Finished;
                resumed += 1;
            }
        }
        resumed
    }

    /// Rebuild the unfinished-predecessor counters and populate the
    /// runnable frontier. Called once, after the build phase and any
    /// resume marking; all later maintenance is incremental.
    pub fn activate(&mut self) {
        for (idx, preds) in self.predecessors.iter().enumerate() {
            self.unfinished_preds[idx] = preds
                .iter()
                .filter(|&&p| self.stages[p as usize].status != StageStatus::Finished)
                .count() as u32;
        }
        for idx in 0..self.stages.len() {
            if self.unfinished_preds[idx] == 0 && self.stages[idx].status == StageStatus::NotStarted
            {
                self.stages[idx].status = StageStatus::Runnable;
                self.runnable.insert(idx as StageId);
            }
        }
    }

    /// Move a runnable stage to running, removing it from the frontier.
    pub fn mark_running(&mut self, id: StageId) -> Result<(), DagError> {
        let stage = self.stage_mut(id)?;
        if stage.status != StageStatus::Runnable {
            return Err(DagError::NotRunnable {
                stage: stage.name.clone(),
                status: stage.status.as_str(),
            });
        }
        stage.status = StageStatus::Running;
        self.runnable.remove(id);
        Ok(())
    }

    /// Put a running (or lost) stage back on the frontier for a retry.
    pub fn mark_runnable_again(&mut self, id: StageId) -> Result<(), DagError> {
        let stage = self.stage_mut(id)?;
        stage.status = StageStatus::Runnable;
        self.runnable.insert(id);
        Ok(())
    }

    /// Finish a stage and unblock its dependents. Returns the dependents
    /// that became runnable.
    ///
    /// The caller is responsible for having made the completion durable
    /// first; nothing here may be observed runnable before the fingerprint
    /// hits disk.
    pub fn mark_finished(&mut self, id: StageId) -> Result<Vec<StageId>, DagError> {
        let stage = self.stage_mut(id)?;
        stage.status = StageStatus::Finished;
        stage.failure = None;
        self.runnable.remove(id);

        let mut newly_runnable = Vec::new();
        let dependents = self.dependents[id as usize].clone();
        for dep in dependents {
            let counter = &mut self.unfinished_preds[dep as usize];
            *counter = counter.saturating_sub(1);
            if *counter == 0 && self.stages[dep as usize].status == StageStatus::NotStarted {
                self.stages[dep as usize].status = StageStatus::Runnable;
                self.runnable.insert(dep);
                newly_runnable.push(dep);
            }
        }
        Ok(newly_runnable)
    }

    /// Fail a stage permanently and propagate `DependencyFailed` to every
    /// transitive dependent. Returns the dependents that were failed.
    pub fn mark_failed(
        &mut self,
        id: StageId,
        cause: FailureCause,
    ) -> Result<Vec<StageId>, DagError> {
        {
            let stage = self.stage_mut(id)?;
            stage.status = StageStatus::Failed;
            stage.failure = Some(cause);
        }
        self.runnable.remove(id);

        let mut failed_deps = Vec::new();
        let mut queue: VecDeque<StageId> = self.dependents[id as usize].iter().copied().collect();
        let mut seen: HashSet<StageId> = queue.iter().copied().collect();
        while let Some(dep) = queue.pop_front() {
            let stage = &mut self.stages[dep as usize];
            if !stage.status.is_terminal() {
                stage.status = StageStatus::Failed;
                stage.failure = Some(FailureCause::DependencyFailed);
                self.runnable.remove(dep);
                failed_deps.push(dep);
            }
            for &next in &self.dependents[dep as usize] {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(failed_deps)
    }

    pub fn runnable_iter(&self) -> impl Iterator<Item = &Stage> {
        self.runnable.iter().map(|id| &self.stages[id as usize])
    }

    pub fn is_runnable(&self, id: StageId) -> bool {
        self.runnable.contains(id)
    }

    pub fn dependents_of(&self, id: StageId) -> &[StageId] {
        self.dependents
            .get(id as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn stage(&self, id: StageId) -> Result<&Stage, DagError> {
        self.stages
            .get(id as usize)
            .ok_or(DagError::UnknownStage(id))
    }

    pub fn stage_mut(&mut self, id: StageId) -> Result<&mut Stage, DagError> {
        self.stages
            .get_mut(id as usize)
            .ok_or(DagError::UnknownStage(id))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn counts(&self) -> DagCounts {
        let mut counts = DagCounts {
            total: self.stages.len(),
            runnable: self.runnable.len(),
            ..Default::default()
        };
        for stage in &self.stages {
            match stage.status {
                StageStatus::Finished => counts.finished += 1,
                StageStatus::Failed => counts.failed += 1,
                StageStatus::Running | StageStatus::Lost => counts.running += 1,
                _ => {}
            }
        }
        counts
    }

    /// Whether any stage can still make progress.
    pub fn has_work(&self) -> bool {
        let counts = self.counts();
        counts.runnable > 0 || counts.running > 0
    }

    /// Largest memory estimate on the current frontier, used to size
    /// batch-system submission requests.
    pub fn largest_runnable_memory_gb(&self) -> Option<f64> {
        self.runnable_iter()
            .map(|s| s.memory_gb())
            .max_by(|a, b| a.total_cmp(b))
    }

    pub fn failed_stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_stage(name: &str) -> StageTemplate {
        StageTemplate::new(name, vec!["echo".to_string(), name.to_string()])
    }

    fn chain(names: &[&str]) -> StageDag {
        let mut dag = StageDag::new();
        let ids: Vec<StageId> = names
            .iter()
            .map(|n| dag.add_stage(shell_stage(n)))
            .collect();
        for pair in ids.windows(2) {
            dag.add_dependency(pair[0], pair[1]).unwrap();
        }
        dag.activate();
        dag
    }

    #[test]
    fn frontier_advances_along_a_chain() {
        let mut dag = chain(&["a", "b", "c"]);
        let frontier: Vec<String> = dag.runnable_iter().map(|s| s.name.clone()).collect();
        assert_eq!(frontier, vec!["a"]);

        dag.mark_running(0).unwrap();
        let unblocked = dag.mark_finished(0).unwrap();
        assert_eq!(unblocked, vec![1]);
        assert!(dag.is_runnable(1));
        assert!(!dag.is_runnable(2));
    }

    #[test]
    fn dependent_waits_for_all_predecessors() {
        let mut dag = StageDag::new();
        let a = dag.add_stage(shell_stage("a"));
        let b = dag.add_stage(shell_stage("b"));
        let c = dag.add_stage(shell_stage("c"));
        dag.add_dependency(a, c).unwrap();
        dag.add_dependency(b, c).unwrap();
        dag.activate();

        dag.mark_running(a).unwrap();
        assert!(dag.mark_finished(a).unwrap().is_empty());
        assert!(!dag.is_runnable(c));

        dag.mark_running(b).unwrap();
        assert_eq!(dag.mark_finished(b).unwrap(), vec![c]);
        assert!(dag.is_runnable(c));
    }

    #[test]
    fn failure_propagates_to_transitive_dependents() {
        let mut dag = chain(&["a", "b", "c"]);
        dag.mark_running(0).unwrap();
        let failed = dag
            .mark_failed(0, FailureCause::Command("exit 1".to_string()))
            .unwrap();
        assert_eq!(failed, vec![1, 2]);
        for id in [1, 2] {
            let stage = dag.stage(id).unwrap();
            assert_eq!(stage.status, StageStatus::Failed);
            assert_eq!(stage.failure, Some(FailureCause::DependencyFailed));
        }
        let counts = dag.counts();
        assert_eq!(counts.failed, 3);
        assert_eq!(counts.runnable, 0);
    }

    #[test]
    fn failure_does_not_touch_independent_subgraphs() {
        let mut dag = StageDag::new();
        let a = dag.add_stage(shell_stage("a"));
        let b = dag.add_stage(shell_stage("b"));
        let c = dag.add_stage(shell_stage("c"));
        dag.add_dependency(a, b).unwrap();
        dag.activate();

        dag.mark_running(a).unwrap();
        dag.mark_failed(a, FailureCause::Command("boom".to_string()))
            .unwrap();
        assert!(dag.is_runnable(c));
        assert_eq!(dag.stage(c).unwrap().status, StageStatus::Runnable);
    }

    #[test]
    fn cycle_is_a_build_error() {
        let mut dag = StageDag::new();
        let a = dag.add_stage(shell_stage("a"));
        let b = dag.add_stage(shell_stage("b"));
        dag.add_dependency(a, b).unwrap();
        dag.add_dependency(b, a).unwrap();
        assert!(matches!(dag.topological_validate(), Err(DagError::Cycle(_))));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut dag = StageDag::new();
        let a = dag.add_stage(shell_stage("a"));
        assert!(matches!(
            dag.add_dependency(a, a),
            Err(DagError::SelfDependency(_))
        ));
    }

    #[test]
    fn identical_stages_deduplicate() {
        let mut dag = StageDag::new();
        let a = dag.add_stage(shell_stage("a"));
        let again = dag.add_stage(shell_stage("a"));
        assert_eq!(a, again);
        assert_eq!(dag.len(), 1);
    }

    #[test]
    fn resume_skips_logged_stages() {
        let mut dag = StageDag::new();
        let a = dag.add_stage(shell_stage("a"));
        let b = dag.add_stage(shell_stage("b"));
        let c = dag.add_stage(shell_stage("c"));
        dag.add_dependency(a, b).unwrap();
        dag.add_dependency(b, c).unwrap();

        let mut done = HashSet::new();
        done.insert(dag.stage(a).unwrap().fingerprint().clone());
        done.insert(dag.stage(b).unwrap().fingerprint().clone());

        assert_eq!(dag.resume_finished(&done), 2);
        dag.activate();

        assert_eq!(dag.stage(a).unwrap().status, StageStatus::Finished);
        assert_eq!(dag.stage(b).unwrap().status, StageStatus::Finished);
        assert!(dag.is_runnable(c));
        assert_eq!(dag.counts().finished, 2);
    }

    #[test]
    fn runnable_iteration_follows_insertion_order() {
        let mut dag = StageDag::new();
        let first = dag.add_stage(shell_stage("first"));
        let second = dag.add_stage(shell_stage("second"));
        let third = dag.add_stage(shell_stage("third"));
        dag.activate();

        let order: Vec<StageId> = dag.runnable.iter().collect();
        assert_eq!(order, vec![first, second, third]);

        // A retried stage goes to the back of the line.
        dag.mark_running(first).unwrap();
        dag.mark_runnable_again(first).unwrap();
        let order: Vec<StageId> = dag.runnable.iter().collect();
        assert_eq!(order, vec![second, third, first]);
    }

    #[test]
    fn followup_edge_from_finished_stage_counts_as_satisfied() {
        let mut dag = chain(&["a"]);
        dag.mark_running(0).unwrap();
        dag.mark_finished(0).unwrap();

        let verify = dag.add_stage(shell_stage("verify"));
        dag.add_dependency(0, verify).unwrap();
        // The new stage has no unfinished predecessors; promoting it is the
        // scheduler's job via mark_finished of a live parent or activate of
        // an isolated followup.
        assert_eq!(dag.unfinished_preds[verify as usize], 0);
    }

    #[test]
    fn counters_match_runnable_invariant() {
        let mut dag = chain(&["a", "b"]);
        // Zero counter exactly for the runnable head of the chain.
        assert_eq!(dag.unfinished_preds[0], 0);
        assert_eq!(dag.unfinished_preds[1], 1);

        dag.mark_running(0).unwrap();
        dag.mark_finished(0).unwrap();
        assert_eq!(dag.unfinished_preds[1], 0);
    }
}
