use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{error, info, info_span, warn, Instrument};

use crate::checkpoint::{Checkpoint, CheckpointSink};
use crate::context::MigrationContext;
use crate::error::WorkflowError;

pub type StepFuture<'a> = BoxFuture<'a, Result<(), WorkflowError>>;

pub type Action = Arc<dyn for<'a> Fn(&'a mut MigrationContext) -> StepFuture<'a> + Send + Sync>;

fn action<F>(f: F) -> Action
where
    F: for<'a> Fn(&'a mut MigrationContext) -> StepFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps a step body with a span, entry and exit logging, timing and error
/// context naming the step.
pub fn inspect(name: &str, inner: Action) -> Action {
    let name = name.to_string();
    action(move |ctx| {
        let name = name.clone();
        let inner = inner.clone();
        let span = info_span!("step", step = %name);
        Box::pin(
            async move {
                let started = Instant::now();
                info!("step started");
                match inner(ctx).await {
                    Ok(()) => {
                        info!(elapsed_ms = started.elapsed().as_millis() as u64, "step finished");
                        Ok(())
                    }
                    Err(err) => {
                        error!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %err,
                            "step failed"
                        );
                        Err(WorkflowError::Step {
                            step: name,
                            source: Box::new(err),
                        })
                    }
                }
            }
            .instrument(span),
        )
    })
}

/// A named unit of the migration: either one action or an ordered group.
#[derive(Clone)]
pub enum Step {
    Atomic { name: String, action: Action },
    Composite { name: String, children: Vec<Step> },
}

impl Step {
    pub fn atomic<F>(name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut MigrationContext) -> StepFuture<'a> + Send + Sync + 'static,
    {
        Self::Atomic {
            name: name.to_string(),
            action: inspect(name, action(f)),
        }
    }

    pub fn composite(name: &str, children: Vec<Step>) -> Self {
        Self::Composite {
            name: name.to_string(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Atomic { name, .. } | Self::Composite { name, .. } => name,
        }
    }

    fn collect_paths(&self, prefix: Option<&str>, out: &mut Vec<String>) {
        let path = qualify(prefix, self.name());
        match self {
            Self::Atomic { .. } => out.push(path),
            Self::Composite { children, .. } => {
                for child in children {
                    child.collect_paths(Some(&path), out);
                }
            }
        }
    }
}

fn qualify(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}/{name}"),
        None => name.to_string(),
    }
}

/// Ordered list of steps making up one migration.
#[derive(Clone, Default)]
pub struct StepChain {
    steps: Vec<Step>,
}

impl StepChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step>) {
        self.steps.extend(steps);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Qualified names (`parent/child`) of every atomic step, in run order.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for step in &self.steps {
            step.collect_paths(None, &mut out);
        }
        out
    }
}

pub(crate) struct Runner<'r> {
    pub completed: &'r mut Vec<String>,
    pub sink: &'r dyn CheckpointSink,
}

impl<'r> Runner<'r> {
    /// Runs `steps` in order, skipping atomic steps already in `completed`.
    pub(crate) fn run<'a>(
        &'a mut self,
        steps: &'a [Step],
        prefix: Option<&'a str>,
        ctx: &'a mut MigrationContext,
    ) -> BoxFuture<'a, Result<(), WorkflowError>>
    where
        'r: 'a,
    {
        Box::pin(async move {
            for step in steps {
                let path = qualify(prefix, step.name());
                match step {
                    Step::Composite { children, .. } => {
                        self.run(children, Some(&path), &mut *ctx)
                            .instrument(info_span!("composite", step = %path))
                            .await?;
                    }
                    Step::Atomic { action, .. } => {
                        if self.completed.contains(&path) {
                            info!(step = %path, "step already completed, skipping");
                            continue;
                        }
                        let outcome = action(&mut *ctx).await.and_then(|()| {
                            ctx.state
                                .validate()
                                .map_err(|violation| WorkflowError::Step {
                                    step: path.clone(),
                                    source: Box::new(WorkflowError::InvalidState(
                                        violation.to_string(),
                                    )),
                                })
                        });
                        if let Err(err) = outcome {
                            let saved = self
                                .sink
                                .record(Checkpoint {
                                    state: &ctx.state,
                                    completed_steps: self.completed.as_slice(),
                                    last_step: self.completed.last().map(String::as_str),
                                })
                                .await;
                            if let Err(save_err) = saved {
                                warn!(step = %path, error = %save_err, "could not save progress of failed step");
                            }
                            self.sink.step_failed(&path, &err).await;
                            return Err(err);
                        }
                        self.completed.push(path.clone());
                        self.sink
                            .record(Checkpoint {
                                state: &ctx.state,
                                completed_steps: self.completed.as_slice(),
                                last_step: Some(&path),
                            })
                            .await?;
                        self.sink.step_completed(&path).await;
                    }
                }
            }
            Ok(())
        })
    }
}
