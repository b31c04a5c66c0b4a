use std::path::{Path, PathBuf};
use std::sync::Arc;

use coqtop::{
    CoqError, CoqTop, ErrorMessage, Failure, Message, MessageLevel, SessionObserver, StateId,
    WorkerStatus,
};

use crate::config::{self, ResolvedConfig, SettingsArgs};
use crate::results::{self, ProcessedSentence, ScriptFailure, ScriptReport};
use crate::script::{self, Sentence};

/// Arguments for the `run` subcommand.
#[derive(Debug)]
pub struct RunArgs {
    pub settings: SettingsArgs,
    pub script: PathBuf,
    pub json: bool,
}

/// Arguments for the `query` subcommand.
#[derive(Debug)]
pub struct QueryArgs {
    pub settings: SettingsArgs,
    pub query: String,
    pub load: Option<PathBuf>,
}

/// Arguments for the `profile` subcommand.
#[derive(Debug)]
pub struct ProfileArgs {
    pub settings: SettingsArgs,
    pub script: PathBuf,
    pub json: bool,
}

/// Forwards session feedback to the log.
struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_state_error(&self, state_id: StateId, _route: i64, error: &ErrorMessage) {
        tracing::warn!(state_id, error = %error.message, "Sentence failed");
    }

    fn on_worker_status(&self, _state_id: StateId, _route: i64, workers: &[WorkerStatus]) {
        for w in workers {
            tracing::debug!(worker = %w.id, state = ?w.state, "Worker status");
        }
    }

    fn on_message(&self, message: &Message) {
        match message.level {
            MessageLevel::Error | MessageLevel::Warning => {
                tracing::warn!(level = ?message.level, "{}", message.message)
            }
            _ => tracing::info!(level = ?message.level, "{}", message.message),
        }
    }

    fn on_closed(&self, reason: &str) {
        tracing::debug!(reason, "coqtop session closed");
    }
}

/// Resolve the config, start coqtop and run `Init`.
async fn start(args: &SettingsArgs, script: Option<&Path>) -> anyhow::Result<(CoqTop, StateId)> {
    let ResolvedConfig { settings, columns } = config::resolve(args)?;
    tracing::info!(
        coqtop = %settings.coqtop_binary().display(),
        wrapper = ?settings.usable_wrapper(),
        "Starting coqtop"
    );
    let coq = CoqTop::new(settings, Arc::new(LogObserver));
    let script_name = script.map(|p| p.display().to_string());
    let root = coq.init_with_script(script_name.as_deref()).await?;
    if let Some(columns) = columns {
        coq.resize_window(columns).await?;
    }
    Ok((coq, root))
}

/// Add every sentence of `path` on top of `root`, stopping at the first failure.
async fn execute(coq: &CoqTop, path: &Path, root: StateId) -> anyhow::Result<ScriptReport> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read script {}: {e}", path.display()))?;
    let sentences = script::split_sentences(&source);
    tracing::info!(script = %path.display(), sentences = sentences.len(), "Checking script");

    let mut report = ScriptReport::new(path);
    let mut tip = root;
    for sentence in &sentences {
        match coq.add(&sentence.text, coq.next_edit_id(), tip, true).await {
            Ok(added) => {
                tip = added.state_id;
                report.processed.push(ProcessedSentence {
                    state_id: tip,
                    start: sentence.start,
                    end: sentence.end,
                });
            }
            Err(CoqError::Failure(failure)) => {
                tracing::warn!(sentence = %sentence.text, error = %failure.message, "Sentence rejected");
                report.failure = Some(script_failure(sentence, &failure));
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(report)
}

/// Map a failure located inside `sentence` to offsets in the whole script.
fn script_failure(sentence: &Sentence, failure: &Failure) -> ScriptFailure {
    let range = failure.location.map(|loc| {
        let clamp = |offset: usize| (sentence.start + offset).min(sentence.end);
        (clamp(loc.start), clamp(loc.stop))
    });
    ScriptFailure {
        sentence: sentence.text.clone(),
        message: failure.message.clone(),
        start: range.map(|r| r.0),
        end: range.map(|r| r.1),
    }
}

pub async fn run_script(args: RunArgs) -> anyhow::Result<()> {
    let start_time = std::time::Instant::now();
    let (coq, root) = start(&args.settings, Some(&args.script)).await?;

    let mut report = execute(&coq, &args.script, root).await?;
    report.goals = match coq.goal().await {
        Ok(goals) => Some(goals),
        Err(e) if !e.is_fatal() => {
            tracing::warn!(error = %e, "Could not fetch goals");
            None
        }
        Err(e) => return Err(e.into()),
    };
    coq.quit().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", results::render_report(&report));
    }
    tracing::info!(
        processed = report.processed.len(),
        elapsed_s = start_time.elapsed().as_secs_f64(),
        "Done"
    );

    if let Some(failure) = &report.failure {
        anyhow::bail!("{} failed: {}", args.script.display(), failure.message);
    }
    Ok(())
}

pub async fn run_query(args: QueryArgs) -> anyhow::Result<()> {
    let (coq, root) = start(&args.settings, args.load.as_deref()).await?;

    let mut tip = root;
    if let Some(path) = &args.load {
        let report = execute(&coq, path, root).await?;
        if let Some(failure) = report.failure {
            coq.quit().await;
            anyhow::bail!("{} failed: {}", path.display(), failure.message);
        }
        tip = report.tip().unwrap_or(root);
    }

    let answer = coq.query(&args.query, tip).await;
    coq.quit().await;
    println!("{}", answer?);
    Ok(())
}

pub async fn run_profile(args: ProfileArgs) -> anyhow::Result<()> {
    let (coq, root) = start(&args.settings, Some(&args.script)).await?;

    coq.ltac_profiling_set(true).await?;
    let report = execute(&coq, &args.script, root).await?;
    if let Some(failure) = &report.failure {
        tracing::warn!(
            processed = report.processed.len(),
            error = %failure.message,
            "Profiling a partially checked script"
        );
    }
    let profile = coq.ltac_profiling_results().await;
    coq.quit().await;
    let profile = profile?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        print!("{}", results::render_profile(&profile));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coqtop::Location;

    fn sentence() -> Sentence {
        Sentence {
            text: "exact foo.".into(),
            start: 40,
            end: 50,
        }
    }

    #[test]
    fn test_failure_offsets_are_absolute() {
        let failure = Failure {
            state_id: Some(3),
            message: "The reference foo was not found.".into(),
            location: Some(Location { start: 6, stop: 9 }),
        };
        let mapped = script_failure(&sentence(), &failure);
        assert_eq!(mapped.start, Some(46));
        assert_eq!(mapped.end, Some(49));
        assert_eq!(mapped.sentence, "exact foo.");
    }

    #[test]
    fn test_failure_offsets_clamped_to_sentence() {
        let failure = Failure {
            state_id: None,
            message: "Syntax error".into(),
            location: Some(Location { start: 8, stop: 30 }),
        };
        let mapped = script_failure(&sentence(), &failure);
        assert_eq!((mapped.start, mapped.end), (Some(48), Some(50)));

        let unlocated = Failure {
            location: None,
            ..failure
        };
        let mapped = script_failure(&sentence(), &unlocated);
        assert!(mapped.start.is_none() && mapped.end.is_none());
    }
}
