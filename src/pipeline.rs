//! Image composition pipeline
//!
//! A [`PipelineSpec`] is a linear chain of external transforms. Each step
//! reads capture inputs and/or the outputs of earlier steps and writes
//! exactly one new artifact; the last step's artifact is the final image.
//! Every file the run touches (inputs, intermediates, final output) comes
//! from the [`ScratchBroker`] and is handed to a detached cleanup task once
//! the run is over, whether it succeeded, failed or was dropped midway.

use crate::scratch::{ScratchBroker, ScratchSet};
use crate::source::Capture;
use crate::transform::TransformRunner;
use crate::{Error, RenderSettings, Result};
use log::{debug, info};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

const SUFFIX: &str = ".png";

/// One argument of a transform step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Passed through verbatim
    Lit(String),
    /// Scratch path of the n-th input capture
    Input(usize),
    /// Scratch paths of a contiguous run of input captures, in order
    Inputs(Range<usize>),
    /// Output path of an earlier step
    Artifact(usize),
    /// This step's own output path
    Output,
}

impl Arg {
    fn lit(s: impl Into<String>) -> Self {
        Arg::Lit(s.into())
    }
}

/// A single external transform in the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStep {
    pub program: String,
    pub args: Vec<Arg>,
}

impl TransformStep {
    pub fn new(program: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Immutable description of a pipeline: how many captures it expects and
/// the ordered steps that turn them into one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    name: String,
    inputs: usize,
    steps: Vec<TransformStep>,
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, inputs: usize, steps: Vec<TransformStep>) -> Self {
        Self {
            name: name.into(),
            inputs,
            steps,
        }
    }

    /// Rotate, letterbox to the display aspect, drop to 8-bit gray, scale.
    pub fn single_capture(settings: &RenderSettings) -> Self {
        let convert = settings.convert_program.as_str();
        let target = settings.target_geometry();
        let steps = vec![
            TransformStep::new(convert, vec![Arg::Input(0), Arg::lit("-rotate"), Arg::lit("90"), Arg::Output]),
            TransformStep::new(
                settings.aspect_program.as_str(),
                vec![
                    Arg::lit(target.clone()),
                    Arg::lit("-g"),
                    Arg::lit("East"),
                    Arg::lit("-c"),
                    Arg::lit(settings.background.clone()),
                    Arg::Artifact(0),
                    Arg::Output,
                ],
            ),
            TransformStep::new(
                convert,
                vec![
                    Arg::Artifact(1),
                    Arg::lit("-gravity"),
                    Arg::lit("NorthEast"),
                    Arg::lit("-colorspace"),
                    Arg::lit("gray"),
                    Arg::lit("-depth"),
                    Arg::lit("8"),
                    Arg::Output,
                ],
            ),
            TransformStep::new(convert, vec![Arg::Artifact(2), Arg::lit("-scale"), Arg::lit(target), Arg::Output]),
        ];
        Self::new("single", 1, steps)
    }

    /// Stack each side's captures into a strip, tile west then east with a
    /// gap, letterbox, rotate and drop to 8-bit gray.
    ///
    /// Inputs are expected west-first: `0..west` then `west..west + east`,
    /// each side in the caller's order.
    pub fn composite(west: usize, east: usize, settings: &RenderSettings) -> Result<Self> {
        if west == 0 || east == 0 {
            return Err(Error::InvalidPipeline(format!(
                "composite needs captures on both sides (west={}, east={})",
                west, east
            )));
        }
        let convert = settings.convert_program.as_str();
        let bg = settings.background.clone();
        let mut west_args = vec![Arg::Inputs(0..west)];
        west_args.extend([Arg::lit("-append"), Arg::Output]);
        let mut east_args = vec![Arg::Inputs(west..west + east)];
        east_args.extend([Arg::lit("-append"), Arg::Output]);

        let steps = vec![
            TransformStep::new(convert, west_args),
            TransformStep::new(convert, east_args),
            TransformStep::new(
                convert,
                vec![
                    Arg::Artifact(0),
                    Arg::lit("-background"),
                    Arg::lit(bg.clone()),
                    Arg::lit("-size"),
                    Arg::lit(format!("{}x1", settings.tile_gap)),
                    Arg::lit(format!("xc:{}", bg)),
                    Arg::Artifact(1),
                    Arg::lit("+append"),
                    Arg::Output,
                ],
            ),
            TransformStep::new(
                settings.aspect_program.as_str(),
                vec![
                    Arg::lit(settings.landscape_geometry()),
                    Arg::lit("-g"),
                    Arg::lit("North"),
                    Arg::lit("-c"),
                    Arg::lit(bg),
                    Arg::Artifact(2),
                    Arg::Output,
                ],
            ),
            TransformStep::new(convert, vec![Arg::Artifact(3), Arg::lit("-rotate"), Arg::lit("90"), Arg::Output]),
            TransformStep::new(
                convert,
                vec![
                    Arg::Artifact(4),
                    Arg::lit("-colorspace"),
                    Arg::lit("gray"),
                    Arg::lit("-depth"),
                    Arg::lit("8"),
                    Arg::Output,
                ],
            ),
        ];
        Ok(Self::new("composite", west + east, steps))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    pub fn expected_inputs(&self) -> usize {
        self.inputs
    }

    /// Check that every reference points at something that will exist by
    /// the time its step runs.
    pub fn validate(&self, inputs: usize) -> Result<()> {
        if inputs != self.inputs {
            return Err(Error::InvalidPipeline(format!(
                "{} pipeline expects {} capture(s), got {}",
                self.name, self.inputs, inputs
            )));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidPipeline(format!("{} pipeline has no steps", self.name)));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            let outputs = step.args.iter().filter(|a| **a == Arg::Output).count();
            if outputs != 1 {
                return Err(Error::InvalidPipeline(format!(
                    "step {} ({}) must name exactly one output, names {}",
                    idx, step.program, outputs
                )));
            }
            for arg in &step.args {
                match arg {
                    Arg::Input(i) if *i >= inputs => {
                        return Err(Error::InvalidPipeline(format!("step {} reads missing input {}", idx, i)));
                    }
                    Arg::Inputs(r) if r.is_empty() || r.end > inputs => {
                        return Err(Error::InvalidPipeline(format!(
                            "step {} reads input range {:?} of {}",
                            idx, r, inputs
                        )));
                    }
                    Arg::Artifact(k) if *k >= idx => {
                        return Err(Error::InvalidPipeline(format!(
                            "step {} reads artifact {} before it exists",
                            idx, k
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn resolve_args(args: &[Arg], inputs: &[PathBuf], artifacts: &[PathBuf], output: &PathBuf) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Arg::Lit(s) => out.push(s.clone()),
            Arg::Input(i) => out.push(inputs[*i].to_string_lossy().into_owned()),
            Arg::Inputs(r) => out.extend(inputs[r.clone()].iter().map(|p| p.to_string_lossy().into_owned())),
            Arg::Artifact(k) => out.push(artifacts[*k].to_string_lossy().into_owned()),
            Arg::Output => out.push(output.to_string_lossy().into_owned()),
        }
    }
    out
}

/// Executes pipeline specs against scratch files.
#[derive(Clone)]
pub struct Pipeline {
    broker: ScratchBroker,
    runner: Arc<dyn TransformRunner>,
}

impl Pipeline {
    pub fn new(broker: ScratchBroker, runner: Arc<dyn TransformRunner>) -> Self {
        Self { broker, runner }
    }

    /// Run `spec` over `captures` and return the final image bytes.
    ///
    /// Scratch files are released in the background after the final
    /// artifact has been read, when a step fails partway, and when the
    /// returned future is dropped before it completes.
    pub async fn run(&self, spec: &PipelineSpec, captures: &[Capture]) -> Result<Vec<u8>> {
        spec.validate(captures.len())?;

        let started = Instant::now();
        // Dropped on every exit, cancellation included.
        let scratch = self.broker.scope();
        let result = self.execute(spec, captures, &scratch).await;
        drop(scratch);

        match &result {
            Ok(bytes) => info!(
                target: "boardshot::pipeline",
                "{} pipeline produced {} bytes from {} capture(s) in {:?}",
                spec.name(),
                bytes.len(),
                captures.len(),
                started.elapsed()
            ),
            Err(e) => debug!(target: "boardshot::pipeline", "{} pipeline aborted: {}", spec.name(), e),
        }
        result
    }

    async fn execute(&self, spec: &PipelineSpec, captures: &[Capture], scratch: &ScratchSet) -> Result<Vec<u8>> {
        let mut inputs = Vec::with_capacity(captures.len());
        for capture in captures {
            let path = scratch.allocate(SUFFIX).await?;
            tokio::fs::write(&path, &capture.bytes).await?;
            inputs.push(path);
        }

        let mut artifacts: Vec<PathBuf> = Vec::with_capacity(spec.steps().len());
        for (idx, step) in spec.steps().iter().enumerate() {
            let output = scratch.allocate(SUFFIX).await?;
            let args = resolve_args(&step.args, &inputs, &artifacts, &output);
            debug!(target: "boardshot::pipeline", "{} step {}: {}", spec.name(), idx, step.program);
            self.runner.run_transform(&step.program, &args).await?;
            artifacts.push(output);
        }

        let last = artifacts
            .last()
            .ok_or_else(|| Error::InvalidPipeline(format!("{} pipeline has no steps", spec.name())))?;
        Ok(tokio::fs::read(last).await?)
    }
}
