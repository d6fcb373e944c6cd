//! Built-in functions of space and time.
use crate::evaluators::{Evaluable, EvaluatorBase, Function};
use crate::factory::{Factory, SetupContext};
use eyre::eyre;
use itertools::Itertools;
use nalgebra::{Point3, Vector3};

pub(crate) fn register(factory: &mut Factory) {
    factory.register_function("ConstantFunction", |ctx| Ok(Box::new(ConstantFunction::new(ctx)?)));
    factory.register_function("PiecewiseLinear", |ctx| Ok(Box::new(PiecewiseLinear::new(ctx)?)));
    factory.register_function("LinearFunction", |ctx| Ok(Box::new(LinearFunction::new(ctx)?)));
}

#[derive(Debug, Clone)]
pub struct ConstantFunction {
    base: EvaluatorBase,
    value: f64,
}

impl ConstantFunction {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            value: ctx.params.real_or("value", 0.0)?,
        })
    }
}

impl Evaluable for ConstantFunction {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Function for ConstantFunction {
    fn value(&self, _t: f64, _p: &Point3<f64>) -> f64 {
        self.value
    }
}

/// The coordinate a [`PiecewiseLinear`] function is tabulated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Time,
    X,
    Y,
    Z,
}

/// Linear interpolation in a table, held constant beyond its ends.
#[derive(Debug, Clone)]
pub struct PiecewiseLinear {
    base: EvaluatorBase,
    axis: Axis,
    x: Vec<f64>,
    y: Vec<f64>,
    scale: f64,
}

impl PiecewiseLinear {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        let x = ctx.params.real_list("x")?;
        let y = ctx.params.real_list("y")?;
        if x.is_empty() || x.len() != y.len() {
            return Err(eyre!(
                "`x` and `y` must be non-empty and of equal length, got {} and {}",
                x.len(),
                y.len()
            ));
        }
        if !x.iter().tuple_windows().all(|(a, b)| a < b) {
            return Err(eyre!("`x` must be strictly increasing"));
        }
        let axis = match ctx.params.optional_string("axis")?.unwrap_or("t") {
            "t" => Axis::Time,
            "x" => Axis::X,
            "y" => Axis::Y,
            "z" => Axis::Z,
            other => return Err(eyre!("unknown axis `{other}`")),
        };
        Ok(Self {
            base: ctx.base()?,
            axis,
            x,
            y,
            scale: ctx.params.real_or("scale_factor", 1.0)?,
        })
    }

    fn coordinate(&self, t: f64, p: &Point3<f64>) -> f64 {
        match self.axis {
            Axis::Time => t,
            Axis::X => p.x,
            Axis::Y => p.y,
            Axis::Z => p.z,
        }
    }

    /// Index of the interval containing `s`, or `None` outside the table.
    fn interval(&self, s: f64) -> Option<usize> {
        let n = self.x.len();
        if n < 2 || s <= self.x[0] || s >= self.x[n - 1] {
            return None;
        }
        Some(self.x.partition_point(|&xi| xi <= s) - 1)
    }
}

impl Evaluable for PiecewiseLinear {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Function for PiecewiseLinear {
    fn value(&self, t: f64, p: &Point3<f64>) -> f64 {
        let s = self.coordinate(t, p);
        let n = self.x.len();
        let y = match self.interval(s) {
            Some(i) => {
                let w = (s - self.x[i]) / (self.x[i + 1] - self.x[i]);
                (1.0 - w) * self.y[i] + w * self.y[i + 1]
            }
            None if s <= self.x[0] => self.y[0],
            None => self.y[n - 1],
        };
        self.scale * y
    }

    fn gradient(&self, _t: f64, p: &Point3<f64>) -> Vector3<f64> {
        let mut gradient = Vector3::zeros();
        let component = match self.axis {
            Axis::Time => return gradient,
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        };
        if let Some(i) = self.interval(p[component]) {
            gradient[component] = self.scale * (self.y[i + 1] - self.y[i]) / (self.x[i + 1] - self.x[i]);
        }
        gradient
    }
}

/// `a + b t + c x + d y + e z`.
#[derive(Debug, Clone)]
pub struct LinearFunction {
    base: EvaluatorBase,
    offset: f64,
    rate: f64,
    slope: Vector3<f64>,
}

impl LinearFunction {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        let params = ctx.params;
        Ok(Self {
            base: ctx.base()?,
            offset: params.real_or("a", 0.0)?,
            rate: params.real_or("b", 0.0)?,
            slope: Vector3::new(
                params.real_or("c", 0.0)?,
                params.real_or("d", 0.0)?,
                params.real_or("e", 0.0)?,
            ),
        })
    }
}

impl Evaluable for LinearFunction {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Function for LinearFunction {
    fn value(&self, t: f64, p: &Point3<f64>) -> f64 {
        self.offset + self.rate * t + self.slope.dot(&p.coords)
    }

    fn gradient(&self, _t: f64, _p: &Point3<f64>) -> Vector3<f64> {
        self.slope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;
    use crate::variables::VariableRegistry;

    fn build(params: Parameters) -> eyre::Result<PiecewiseLinear> {
        let registry = VariableRegistry::new();
        let ctx = SetupContext {
            name: "f",
            params: &params,
            variables: &registry,
            thread: 0,
        };
        PiecewiseLinear::new(&ctx)
    }

    #[test]
    fn piecewise_linear_interpolates_and_extrapolates_constant() {
        let f = build(
            Parameters::new()
                .with("x", vec![0.0, 1.0, 3.0])
                .with("y", vec![0.0, 2.0, 0.0]),
        )
        .unwrap();
        let origin = Point3::origin();
        assert_eq!(f.value(-1.0, &origin), 0.0);
        assert_eq!(f.value(0.5, &origin), 1.0);
        assert_eq!(f.value(2.0, &origin), 1.0);
        assert_eq!(f.value(10.0, &origin), 0.0);
    }

    #[test]
    fn piecewise_linear_rejects_unsorted_table() {
        let params = Parameters::new()
            .with("x", vec![0.0, 2.0, 1.0])
            .with("y", vec![0.0, 1.0, 2.0]);
        assert!(build(params).is_err());
    }
}
