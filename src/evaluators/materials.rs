//! Built-in materials.
use crate::evaluators::{Evaluable, EvaluatorBase, Material};
use crate::factory::{Factory, SetupContext};
use crate::fe_data::{MaterialWriter, QpContext};
use crate::variables::CoupledVariableId;
use eyre::eyre;

pub(crate) fn register(factory: &mut Factory) {
    factory.register_material("GenericConstantMaterial", |ctx| {
        Ok(Box::new(GenericConstantMaterial::new(ctx)?))
    });
    factory.register_material("RelativePermeabilityVG", |ctx| {
        Ok(Box::new(RelativePermeabilityVanGenuchten::new(ctx)?))
    });
}

/// Declares a list of properties with constant values.
#[derive(Debug, Clone)]
pub struct GenericConstantMaterial {
    base: EvaluatorBase,
    names: Vec<String>,
    values: Vec<f64>,
}

impl GenericConstantMaterial {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        let names = ctx.params.string_list("prop_names")?;
        let values = ctx.params.real_list("prop_values")?;
        if names.len() != values.len() {
            return Err(eyre!(
                "`prop_names` has {} entries but `prop_values` has {}",
                names.len(),
                values.len()
            ));
        }
        Ok(Self {
            base: ctx.base()?,
            names,
            values,
        })
    }
}

impl Evaluable for GenericConstantMaterial {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Material for GenericConstantMaterial {
    fn declared_properties(&self) -> Vec<String> {
        self.names.clone()
    }

    fn compute_qp_properties(&mut self, _qp: &QpContext, out: &mut MaterialWriter) -> eyre::Result<()> {
        for (name, &value) in self.names.iter().zip(&self.values) {
            out.set(name, value)?;
        }
        Ok(())
    }
}

/// van Genuchten relative permeability of a fluid phase as a function of its saturation.
///
/// With effective saturation `s_eff = (s - s_res) / (s_ls - s_res)`,
/// `k_r = sqrt(s_eff) (1 - (1 - s_eff^(1/m))^m)^2`, clamped to zero below the residual
/// saturation and to one above the fully saturated limit.
#[derive(Debug, Clone)]
pub struct RelativePermeabilityVanGenuchten {
    base: EvaluatorBase,
    saturation: CoupledVariableId,
    m: f64,
    s_res: f64,
    s_ls: f64,
}

pub const RELATIVE_PERMEABILITY: &str = "relative_permeability";
pub const RELATIVE_PERMEABILITY_DERIVATIVE: &str = "drelative_permeability_ds";

impl RelativePermeabilityVanGenuchten {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        let m = ctx.params.real("m")?;
        let s_res = ctx.params.real_or("s_res", 0.0)?;
        let s_ls = ctx.params.real_or("s_ls", 1.0)?;
        if !(m > 0.0 && m < 1.0) {
            return Err(eyre!("van Genuchten exponent m = {m} must lie in (0, 1)"));
        }
        if !(0.0..1.0).contains(&s_res) || s_ls <= s_res || s_ls > 1.0 {
            return Err(eyre!(
                "saturation bounds require 0 <= s_res < s_ls <= 1, got s_res = {s_res}, s_ls = {s_ls}"
            ));
        }
        Ok(Self {
            base: ctx.base()?,
            saturation: ctx.coupled("saturation")?,
            m,
            s_res,
            s_ls,
        })
    }

    pub fn relative_permeability(&self, s: f64) -> f64 {
        let seff = (s - self.s_res) / (self.s_ls - self.s_res);
        if seff <= 0.0 {
            0.0
        } else if seff >= 1.0 {
            1.0
        } else {
            let a = 1.0 - seff.powf(1.0 / self.m);
            let b = 1.0 - a.powf(self.m);
            seff.sqrt() * b * b
        }
    }

    pub fn relative_permeability_derivative(&self, s: f64) -> f64 {
        let seff = (s - self.s_res) / (self.s_ls - self.s_res);
        if seff <= 0.0 || seff >= 1.0 {
            return 0.0;
        }
        let m = self.m;
        let a = 1.0 - seff.powf(1.0 / m);
        let b = 1.0 - a.powf(m);
        let dkr_dseff = 0.5 * seff.powf(-0.5) * b * b + 2.0 * seff.powf(1.0 / m - 0.5) * a.powf(m - 1.0) * b;
        dkr_dseff / (self.s_ls - self.s_res)
    }
}

impl Evaluable for RelativePermeabilityVanGenuchten {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Material for RelativePermeabilityVanGenuchten {
    fn declared_properties(&self) -> Vec<String> {
        vec![
            RELATIVE_PERMEABILITY.to_string(),
            RELATIVE_PERMEABILITY_DERIVATIVE.to_string(),
        ]
    }

    fn compute_qp_properties(&mut self, qp: &QpContext, out: &mut MaterialWriter) -> eyre::Result<()> {
        let s = qp.coupled_value(self.saturation);
        out.set(RELATIVE_PERMEABILITY, self.relative_permeability(s))?;
        out.set(RELATIVE_PERMEABILITY_DERIVATIVE, self.relative_permeability_derivative(s))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;
    use crate::variables::{FeType, VariableRegistry};

    fn material(m: f64) -> RelativePermeabilityVanGenuchten {
        let mut registry = VariableRegistry::default();
        registry.add_variable("s", FeType::LAGRANGE_FIRST, None).unwrap();
        let params = Parameters::new().with("m", m).with("saturation", "s");
        let ctx = SetupContext {
            name: "kr",
            params: &params,
            variables: &registry,
            thread: 0,
        };
        RelativePermeabilityVanGenuchten::new(&ctx).unwrap()
    }

    #[test]
    fn relative_permeability_is_clamped_outside_unit_interval() {
        let kr = material(0.5);
        assert_eq!(kr.relative_permeability(-0.1), 0.0);
        assert_eq!(kr.relative_permeability(1.2), 1.0);
        assert_eq!(kr.relative_permeability_derivative(1.2), 0.0);
    }

    #[test]
    fn relative_permeability_derivative_matches_finite_difference() {
        let kr = material(0.6);
        for &s in &[0.2, 0.45, 0.7, 0.9] {
            let h = 1e-6;
            let fd = (kr.relative_permeability(s + h) - kr.relative_permeability(s - h)) / (2.0 * h);
            let exact = kr.relative_permeability_derivative(s);
            assert!((fd - exact).abs() < 1e-5 * exact.abs().max(1.0), "s = {s}: {fd} vs {exact}");
        }
    }

    #[test]
    fn invalid_exponent_is_rejected() {
        let mut registry = VariableRegistry::default();
        registry.add_variable("s", FeType::LAGRANGE_FIRST, None).unwrap();
        let params = Parameters::new().with("m", 1.5).with("saturation", "s");
        let ctx = SetupContext {
            name: "kr",
            params: &params,
            variables: &registry,
            thread: 0,
        };
        assert!(RelativePermeabilityVanGenuchten::new(&ctx).is_err());
    }
}
