//! Report types for the CLI and their human-readable rendering.

use std::fmt::Write as _;
use std::path::Path;

use coqtop::{Goal, GoalResult, LtacProfResults, LtacProfTree, StateId};
use serde::Serialize;

/// A sentence coqtop accepted.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedSentence {
    pub state_id: StateId,
    /// Byte range in the script.
    pub start: usize,
    pub end: usize,
}

/// The first sentence coqtop rejected.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptFailure {
    pub sentence: String,
    pub message: String,
    /// Byte range of the error in the script, when coqtop reports one.
    pub start: Option<usize>,
    pub end: Option<usize>,
}

/// Outcome of checking a script.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptReport {
    pub script: String,
    pub processed: Vec<ProcessedSentence>,
    pub failure: Option<ScriptFailure>,
    pub goals: Option<GoalResult>,
}

impl ScriptReport {
    pub fn new(script: &Path) -> Self {
        Self {
            script: script.display().to_string(),
            processed: Vec::new(),
            failure: None,
            goals: None,
        }
    }

    /// State id of the last accepted sentence.
    pub fn tip(&self) -> Option<StateId> {
        self.processed.last().map(|s| s.state_id)
    }
}

/// Render a report the way a proof-state panel would show it.
pub fn render_report(report: &ScriptReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}: {} sentence(s) processed",
        report.script,
        report.processed.len()
    );
    if let Some(failure) = &report.failure {
        let _ = match (failure.start, failure.end) {
            (Some(start), Some(end)) => writeln!(
                out,
                "Error at {start}-{end} in `{}`:\n  {}",
                failure.sentence, failure.message
            ),
            _ => writeln!(out, "Error in `{}`:\n  {}", failure.sentence, failure.message),
        };
    }
    if let Some(goals) = &report.goals {
        out.push_str(&render_goals(goals));
    }
    out
}

pub fn render_goals(result: &GoalResult) -> String {
    let Some(goals) = &result.goals else {
        return "No proof in progress.\n".to_string();
    };
    let mut out = String::new();
    if goals.is_empty() {
        let pending = [
            &result.background_goals,
            &result.shelved_goals,
            &result.abandoned_goals,
        ]
        .iter()
        .filter_map(|g| g.as_ref())
        .map(Vec::len)
        .sum::<usize>();
        if pending == 0 {
            out.push_str("No more goals.\n");
        } else {
            let _ = writeln!(out, "No focused goals ({pending} remaining elsewhere).");
        }
        return out;
    }
    let _ = writeln!(out, "{} goal(s)", goals.len());
    for (i, goal) in goals.iter().enumerate() {
        render_goal(&mut out, i + 1, goal, i == 0);
    }
    out
}

fn render_goal(out: &mut String, n: usize, goal: &Goal, with_hypotheses: bool) {
    out.push('\n');
    if with_hypotheses {
        for h in &goal.hypotheses {
            let _ = writeln!(out, "  {} {} {}", h.identifier, h.relation, h.expression);
        }
    }
    let _ = writeln!(out, "  ============================ ({n})");
    let _ = writeln!(out, "  {}", goal.goal);
}

/// Indented profile tree, children sorted by total time.
pub fn render_profile(results: &LtacProfResults) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<40} {:>9} {:>9} {:>7} {:>9}",
        "tactic", "total", "local", "calls", "max"
    );
    render_level(&mut out, &results.results, 0);
    out
}

fn render_level(
    out: &mut String,
    level: &std::collections::BTreeMap<String, LtacProfTree>,
    depth: usize,
) {
    let mut entries: Vec<_> = level.iter().collect();
    entries.sort_by(|a, b| b.1.entry.total.total_cmp(&a.1.entry.total));
    for (name, tree) in entries {
        let label = format!("{}{name}", "  ".repeat(depth));
        let e = &tree.entry;
        let _ = writeln!(
            out,
            "{label:<40} {:>9.3} {:>9.3} {:>7} {:>9.3}",
            e.total, e.local, e.ncalls, e.max_total
        );
        render_level(out, &tree.children, depth + 1);
    }
}
