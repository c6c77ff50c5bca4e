//! Engine backed by a Python module, for T5/MLX style model code that only
//! exists in Python. The module must expose:
//!
//! - `predict(input_file, output_file, checkpoint_steps, sampling_keep_top_p)`
//! - `train(spec_json, batches_json, max_steps)`
//! - `evaluate(spec_json, batches_json, checkpoint, name) -> dict[str, float]`
//! - `score(spec_json, examples_json, checkpoint) -> list[str]`

use anyhow::{Context, Result};
use pyo3::prelude::*;
use std::path::Path;
use tracing::{debug, error, info};

use crate::models::engine::{
    Estimator, EstimatorFactory, EstimatorSpec, GenerationEngine, Metrics, PredictOptions,
};
use crate::training::data::{PairBatch, ScoringExample};

pub struct PyEngine {
    module_name: String,
}

impl PyEngine {
    pub fn new(module_name: &str) -> Result<Self> {
        pyo3::prepare_freethreaded_python();

        Python::with_gil(|py| -> Result<()> {
            let executable = py
                .import_bound("sys")
                .and_then(|sys| sys.getattr("executable"))
                .and_then(|exe| exe.extract::<String>())
                .unwrap_or_else(|_| "unknown".to_string());
            debug!("PyO3 using Python: {}", executable);

            if let Err(e) = py.import_bound(module_name) {
                error!("Failed to import engine module {}: {}", module_name, e);
                error!("  PYO3_PYTHON: {:?}", std::env::var("PYO3_PYTHON"));
                error!("  Python executable: {}", executable);
                return Err(anyhow::anyhow!("Failed to import {}: {}", module_name, e));
            }
            Ok(())
        })?;

        info!("Python engine module {} loaded", module_name);
        Ok(Self {
            module_name: module_name.to_string(),
        })
    }

    fn call<T, A>(&self, function: &str, args: A) -> Result<T>
    where
        T: for<'py> FromPyObject<'py>,
        A: IntoPy<Py<pyo3::types::PyTuple>>,
    {
        Python::with_gil(|py| -> Result<T> {
            let module = py
                .import_bound(self.module_name.as_str())
                .map_err(|e| anyhow::anyhow!("Failed to import {}: {}", self.module_name, e))?;
            let result = module
                .getattr(function)
                .and_then(|f| f.call1(args))
                .map_err(|e| anyhow::anyhow!("{}.{} failed: {}", self.module_name, function, e))?;
            result
                .extract::<T>()
                .map_err(|e| anyhow::anyhow!("Unexpected return from {}.{}: {}", self.module_name, function, e))
        })
    }
}

impl GenerationEngine for PyEngine {
    fn predict(&self, input_file: &Path, output_file: &Path, options: &PredictOptions) -> Result<()> {
        let _: PyObject = self.call(
            "predict",
            (
                input_file.display().to_string(),
                output_file.display().to_string(),
                options.checkpoint_steps,
                options.sampling_keep_top_p,
            ),
        )?;
        Ok(())
    }
}

impl EstimatorFactory for PyEngine {
    fn build(&self, spec: &EstimatorSpec) -> Result<Box<dyn Estimator>> {
        Ok(Box::new(PyEstimator {
            engine: PyEngine {
                module_name: self.module_name.clone(),
            },
            spec_json: serde_json::to_string(spec).context("Failed to serialize estimator spec")?,
        }))
    }
}

struct PyEstimator {
    engine: PyEngine,
    spec_json: String,
}

fn to_json_lines<T: serde::Serialize>(items: impl Iterator<Item = T>) -> Result<Vec<String>> {
    items
        .map(|item| serde_json::to_string(&item).context("Failed to serialize engine input"))
        .collect()
}

impl Estimator for PyEstimator {
    fn train(&mut self, batches: &mut dyn Iterator<Item = PairBatch>, max_steps: u64) -> Result<()> {
        let batches = to_json_lines(batches)?;
        let _: PyObject = self
            .engine
            .call("train", (self.spec_json.clone(), batches, max_steps))?;
        Ok(())
    }

    fn evaluate(&mut self, batches: &[PairBatch], checkpoint: &Path, name: &str) -> Result<Metrics> {
        let batches = to_json_lines(batches.iter())?;
        self.engine.call(
            "evaluate",
            (
                self.spec_json.clone(),
                batches,
                checkpoint.display().to_string(),
                name.to_string(),
            ),
        )
    }

    fn predict(&mut self, examples: &[ScoringExample], checkpoint: &Path) -> Result<Vec<String>> {
        let examples = to_json_lines(examples.iter())?;
        self.engine.call(
            "score",
            (self.spec_json.clone(), examples, checkpoint.display().to_string()),
        )
    }
}
