use crate::{coupled_quad_system, line_poisson};
use fenris_multiphysics::output::{JsonLinesWriter, PostprocessorHistory};
use fenris_multiphysics::params::Parameters;
use fenris_multiphysics::SystemError;
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::DVector;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

fn with_variable_postprocessors(num_elements: usize, num_threads: usize) -> fenris_multiphysics::CoupledSystem {
    let mut system = line_poisson(num_elements, num_threads);
    for (type_name, name) in [
        ("ElementIntegralVariable", "integral"),
        ("ElementAverageValue", "average"),
        ("NodalMaxValue", "max"),
    ] {
        system
            .add_postprocessor(type_name, name, Parameters::new().with("variable", "u"))
            .unwrap();
    }
    system
        .add_postprocessor("TimestepSize", "dt", Parameters::new())
        .unwrap();
    system.init().unwrap();
    system
}

#[test]
fn postprocessors_of_a_linear_field() {
    for num_threads in [1, 3] {
        let mut system = with_variable_postprocessors(4, num_threads);
        let u = DVector::from_column_slice(&[0.0, 0.25, 0.5, 0.75, 1.0]);
        system.compute_postprocessors(&u).unwrap();

        assert_scalar_eq!(system.postprocessor_value("integral").unwrap(), 0.5, comp = abs, tol = 1e-12);
        assert_scalar_eq!(system.postprocessor_value("average").unwrap(), 0.5, comp = abs, tol = 1e-12);
        assert_scalar_eq!(system.postprocessor_value("max").unwrap(), 1.0, comp = abs, tol = 1e-12);
        assert_scalar_eq!(system.postprocessor_value("dt").unwrap(), 1.0, comp = abs, tol = 1e-12);
    }
}

#[test]
fn unknown_postprocessor_is_reported() {
    let mut system = with_variable_postprocessors(2, 1);
    system.compute_postprocessors(&DVector::zeros(3)).unwrap();
    assert!(matches!(
        system.postprocessor_value("missing"),
        Err(SystemError::Unknown { .. })
    ));
}

#[test]
fn material_property_integral() {
    let mut system = coupled_quad_system(2, 2);
    // The quad system is initialized already, but nothing has been assembled yet
    system
        .add_postprocessor(
            "ElementIntegralMaterialProperty",
            "d_total",
            Parameters::new().with("property", "diffusivity"),
        )
        .unwrap();
    let x = system.solution().clone();
    system.compute_postprocessors(&x).unwrap();
    assert_scalar_eq!(system.postprocessor_value("d_total").unwrap(), 2.0, comp = abs, tol = 1e-12);
}

#[test]
fn residual_can_depend_on_postprocessors() {
    let mut system = line_poisson(2, 1);
    system
        .add_postprocessor("ElementIntegralVariable", "total", Parameters::new().with("variable", "u"))
        .unwrap();
    system
        .add_kernel(
            "PostprocessorSource",
            "source",
            Parameters::new()
                .with("variable", "u")
                .with("postprocessor", "total")
                .with("coef", 2.0),
        )
        .unwrap();
    system.need_postprocessors_for_residuals(true);
    system.init().unwrap();

    // Constant field: no diffusion, body force 1 and a source of 2 * ∫u = 2
    let residual = system.compute_residual(&DVector::from_element(3, 1.0)).unwrap();
    let expected = DVector::from_column_slice(&[-0.75, -1.5, -0.75]);
    assert_matrix_eq!(residual, expected, comp = abs, tol = 1e-12);
}

#[test]
fn postprocessor_history_records_every_output_step() {
    let mut system = with_variable_postprocessors(2, 1);
    let history = PostprocessorHistory::new();
    system.add_output(Box::new(history.clone()));

    for step in 0..3 {
        let u = DVector::from_element(3, step as f64);
        system.compute_postprocessors(&u).unwrap();
        system.output_system(step, step as f64 * 0.5).unwrap();
    }

    let rows = history.rows();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].step, 2);
    assert_scalar_eq!(rows[2].time, 1.0, comp = abs, tol = 1e-14);
    assert_scalar_eq!(rows[2].values.get("integral").unwrap(), 2.0, comp = abs, tol = 1e-12);

    let json: serde_json::Value = serde_json::from_str(&history.to_json().unwrap()).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 3);
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn json_lines_writer_emits_one_document_per_step() {
    let mut system = coupled_quad_system(1, 1);
    let buffer = SharedBuffer::default();
    system.add_output(Box::new(JsonLinesWriter::new(buffer.clone())));
    system.output_system(0, 0.0).unwrap();
    system.output_system(1, 0.5).unwrap();

    let bytes = buffer.0.lock().clone();
    let text = String::from_utf8(bytes).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["step"], 0);
    assert_eq!(first["mesh_changed"], true);
    assert_eq!(first["num_vertices"], 4);
    assert_eq!(first["variables"]["u"].as_array().unwrap().len(), 4);
    // The elemental auxiliary variable has one value per element
    assert_eq!(first["variables"]["k"].as_array().unwrap().len(), 1);

    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second["mesh_changed"], false);
}
