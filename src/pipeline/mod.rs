//! Pipeline interpretation
//!
//! A pipeline step either `runs` a shell fragment, `uses` a named
//! pipeline from the search directories, or nests further steps. Steps
//! may declare `needs` (build-time packages accreted into the guest
//! environment before any container starts) and an `if` conditional.

use crate::error::{ForgeError, ForgeResult};
use crate::orchestration::config::ContainerConfig;
use crate::orchestration::runner::Runner;
use crate::recipe::cond;
use crate::recipe::schema::{ImageConfiguration, Pipeline};
use crate::recipe::subst::Substitutions;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Binds one pipeline step to the container config and the pipeline
/// search directories.
pub struct PipelineContext<'a> {
    step: &'a Pipeline,
    /// `None` during the needs scan: nothing runs in a container there
    config: Option<&'a ContainerConfig>,
    pipeline_dirs: &'a [PathBuf],
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        step: &'a Pipeline,
        config: Option<&'a ContainerConfig>,
        pipeline_dirs: &'a [PathBuf],
    ) -> Self {
        Self {
            step,
            config,
            pipeline_dirs,
        }
    }

    /// Pre-flight dependency accretion: append every package this step
    /// (and anything it uses or nests) needs to the environment.
    pub fn apply_needs(&self, env: &mut ImageConfiguration) -> ForgeResult<()> {
        collect_needs(self.step, self.pipeline_dirs, env)?;
        env.contents.packages.sort();
        env.contents.packages.dedup();
        Ok(())
    }

    /// Execute this step inside the pod.
    pub async fn run(&self, runner: &dyn Runner, subs: &Substitutions) -> ForgeResult<()> {
        run_step(self.step, self.config, self.pipeline_dirs, runner, subs).await
    }
}

fn step_label(step: &Pipeline) -> String {
    step.name
        .clone()
        .or_else(|| step.uses.clone())
        .unwrap_or_else(|| "(anonymous step)".to_string())
}

fn collect_needs(
    step: &Pipeline,
    pipeline_dirs: &[PathBuf],
    env: &mut ImageConfiguration,
) -> ForgeResult<()> {
    if let Some(needs) = &step.needs {
        for pkg in &needs.packages {
            debug!("  adding package {pkg} for pipeline requirements");
            env.contents.packages.push(pkg.clone());
        }
    }

    if let Some(uses) = &step.uses {
        let loaded = load_uses(uses, pipeline_dirs)?;
        collect_needs(&loaded, pipeline_dirs, env)?;
    }

    for nested in &step.pipeline {
        collect_needs(nested, pipeline_dirs, env)?;
    }

    Ok(())
}

/// Resolve a `uses` reference against the ordered search directories.
fn load_uses(name: &str, pipeline_dirs: &[PathBuf]) -> ForgeResult<Pipeline> {
    for dir in pipeline_dirs {
        let candidate = dir.join(format!("{name}.yaml"));
        if candidate.is_file() {
            let content = std::fs::read_to_string(&candidate)
                .map_err(|e| ForgeError::io(format!("reading {}", candidate.display()), e))?;
            return Ok(serde_yaml::from_str(&content)?);
        }
    }

    Err(ForgeError::PipelineNotFound {
        name: name.to_string(),
        dirs: pipeline_dirs.to_vec(),
    })
}

fn run_step<'a>(
    step: &'a Pipeline,
    config: Option<&'a ContainerConfig>,
    pipeline_dirs: &'a [PathBuf],
    runner: &'a dyn Runner,
    subs: &'a Substitutions,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ForgeResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let label = step_label(step);

        if let Some(expr) = &step.if_expr {
            if !cond::evaluate(expr, |key| Ok(subs.lookup(key)))? {
                info!("skipping step {label}: condition {expr:?} is false");
                return Ok(());
            }
        }

        if let Some(uses) = &step.uses {
            let loaded = load_uses(uses, pipeline_dirs)?;

            // Effective inputs: declared defaults overlaid by `with`.
            let mut inputs: HashMap<String, String> = HashMap::new();
            for (key, input) in &loaded.inputs {
                match (&input.default, step.with.get(key)) {
                    (_, Some(given)) => {
                        inputs.insert(key.clone(), given.clone());
                    }
                    (Some(default), None) => {
                        inputs.insert(key.clone(), default.clone());
                    }
                    (None, None) if input.required => {
                        return Err(ForgeError::Pipeline {
                            step: uses.clone(),
                            reason: format!("required input {key} not provided"),
                        });
                    }
                    _ => {}
                }
            }
            // Inputs with no declaration still pass through.
            for (key, value) in &step.with {
                inputs.entry(key.clone()).or_insert_with(|| value.clone());
            }

            let scoped = subs.with_inputs(&inputs);
            run_step(&loaded, config, pipeline_dirs, runner, &scoped).await?;
        }

        if let Some(runs) = &step.runs {
            let config = config.ok_or_else(|| ForgeError::Pipeline {
                step: label.clone(),
                reason: "no container bound for execution".into(),
            })?;

            let mut script = String::new();
            script.push_str("set -e\n");
            for (k, v) in &step.environment {
                script.push_str(&format!("export {k}={:?}\n", subs.replace(v)));
            }
            if let Some(dir) = &step.working_directory {
                script.push_str(&format!("cd {}\n", subs.replace(dir)));
            }
            script.push_str(&subs.replace(runs));

            info!("running step {label}");
            runner
                .run_cmd(config, &["sh".into(), "-c".into(), script])
                .await
                .map_err(|e| ForgeError::Pipeline {
                    step: label.clone(),
                    reason: e.to_string(),
                })?;
        }

        for nested in &step.pipeline {
            run_step(nested, config, pipeline_dirs, runner, subs).await?;
        }

        Ok(())
    })
}
