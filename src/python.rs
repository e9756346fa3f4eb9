//! Python bindings (`glacierflow._core`), built with the `python` feature

use crate::config::PipelineConfig;
use crate::core::statistics::pixelwise_median;
use crate::core::{ChainDriver, OrbitIndexer};
use crate::io::FieldIdentifier;
use crate::types::GlacierError;
use ndarray::ArrayView2;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::prelude::*;

fn to_py_err(e: GlacierError) -> PyErr {
    match e {
        GlacierError::MalformedIdentifier { .. } | GlacierError::Config(_) => {
            PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
        }
        other => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", other)),
    }
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyFieldIdentifier>()?;
    m.add_function(wrap_pyfunction!(parse_identifier, m)?)?;
    m.add_function(wrap_pyfunction!(classify_orbits, m)?)?;
    m.add_function(wrap_pyfunction!(nanmedian_stack, m)?)?;
    m.add_function(wrap_pyfunction!(run_batch, m)?)?;
    Ok(())
}

/// Python wrapper for a parsed raw-field name
#[pyclass(name = "FieldIdentifier")]
#[derive(Clone)]
struct PyFieldIdentifier {
    inner: FieldIdentifier,
}

#[pymethods]
impl PyFieldIdentifier {
    #[getter]
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    #[getter]
    fn source(&self) -> String {
        self.inner.source.to_string()
    }

    #[getter]
    fn scene_1_datetime(&self) -> String {
        self.inner.scene1.datetime.to_rfc3339()
    }

    #[getter]
    fn scene_2_datetime(&self) -> String {
        self.inner.scene2.datetime.to_rfc3339()
    }

    #[getter]
    fn orbits(&self) -> (String, String) {
        (self.inner.scene1.orbit.0.clone(), self.inner.scene2.orbit.0.clone())
    }

    #[getter]
    fn baseline_days(&self) -> f64 {
        self.inner.window().baseline_days()
    }

    #[getter]
    fn classification(&self) -> String {
        self.inner.track_class().to_string()
    }

    #[getter]
    fn signature(&self) -> String {
        self.inner.signature().0.token()
    }

    fn __repr__(&self) -> String {
        format!("FieldIdentifier('{}', {})", self.inner.name, self.inner.track_class())
    }
}

/// Parse a Sentinel-2 or Landsat field name
#[pyfunction]
fn parse_identifier(name: &str) -> PyResult<PyFieldIdentifier> {
    FieldIdentifier::parse(name)
        .map(|inner| PyFieldIdentifier { inner })
        .map_err(to_py_err)
}

/// Classify names into (field_id, classification, signature) rows plus (name, reason) rejects
#[pyfunction]
fn classify_orbits(names: Vec<String>) -> (Vec<(String, String, String)>, Vec<(String, String)>) {
    let mut rows = Vec::new();
    let mut malformed = Vec::new();
    for name in names {
        match FieldIdentifier::parse(&name) {
            Ok(id) => {
                let record = OrbitIndexer::record_for(&id);
                rows.push((
                    record.field_id.clone(),
                    record.classification.to_string(),
                    record.signature().0.token(),
                ));
            }
            Err(e) => malformed.push((name, e.to_string())),
        }
    }
    (rows, malformed)
}

/// Pixel-wise NaN median of equally shaped 2-D arrays
#[pyfunction]
#[pyo3(signature = (layers, min_samples = 1))]
fn nanmedian_stack<'py>(
    py: Python<'py>,
    layers: Vec<PyReadonlyArray2<'py, f32>>,
    min_samples: usize,
) -> PyResult<&'py PyArray2<f32>> {
    let views: Vec<ArrayView2<'_, f32>> = layers.iter().map(|l| l.as_array()).collect();
    let stack = pixelwise_median(&views, min_samples).ok_or_else(|| {
        PyErr::new::<pyo3::exceptions::PyValueError, _>(
            "layers must be a non-empty list of equally shaped arrays",
        )
    })?;
    Ok(stack.median.into_pyarray(py))
}

/// Run a whole batch from a TOML configuration; returns (unit, state, steps) rows
#[pyfunction]
fn run_batch(py: Python<'_>, config_path: &str) -> PyResult<Vec<(String, String, usize)>> {
    let config = PipelineConfig::from_toml_file(config_path).map_err(to_py_err)?;
    let batch = py
        .allow_threads(|| ChainDriver::from_config(config).run_batch())
        .map_err(to_py_err)?;
    Ok(batch
        .units
        .iter()
        .map(|u| (u.unit.clone(), u.state.to_string(), u.steps))
        .collect())
}
