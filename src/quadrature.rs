//! Gauss–Legendre quadrature on reference elements and their sides.
use crate::error::{Result, SystemError};
use crate::mesh::ElementType;
use crate::element::side_reference_point;
use nalgebra::Point3;

/// Points and weights of the one-dimensional Gauss–Legendre rule on `[-1, 1]`.
pub fn gauss_legendre_1d(num_points: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let (points, weights) = match num_points {
        1 => (vec![0.0], vec![2.0]),
        2 => {
            let a = 1.0 / 3.0f64.sqrt();
            (vec![-a, a], vec![1.0, 1.0])
        }
        3 => {
            let a = (3.0f64 / 5.0).sqrt();
            (vec![-a, 0.0, a], vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0])
        }
        4 => {
            let (a, b) = (0.339_981_043_584_856_3, 0.861_136_311_594_052_6);
            let (wa, wb) = (0.652_145_154_862_546_1, 0.347_854_845_137_453_8);
            (vec![-b, -a, a, b], vec![wb, wa, wa, wb])
        }
        n => {
            return Err(SystemError::Config(format!(
                "Gauss-Legendre rules are available for 1 to 4 points, requested {n}"
            )))
        }
    };
    Ok((points, weights))
}

/// A quadrature rule in reference coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadratureRule {
    pub weights: Vec<f64>,
    pub points: Vec<Point3<f64>>,
}

impl QuadratureRule {
    /// Tensor-product Gauss rule for the reference element.
    pub fn gauss(kind: ElementType, points_per_dim: usize) -> Result<Self> {
        let (x, w) = gauss_legendre_1d(points_per_dim)?;
        let rule = match kind {
            ElementType::Edge2 => Self {
                weights: w,
                points: x.iter().map(|&xi| Point3::new(xi, 0.0, 0.0)).collect(),
            },
            ElementType::Quad4 => {
                let mut weights = Vec::with_capacity(x.len() * x.len());
                let mut points = Vec::with_capacity(x.len() * x.len());
                for (&eta, &w_eta) in x.iter().zip(&w) {
                    for (&xi, &w_xi) in x.iter().zip(&w) {
                        weights.push(w_xi * w_eta);
                        points.push(Point3::new(xi, eta, 0.0));
                    }
                }
                Self { weights, points }
            }
        };
        Ok(rule)
    }

    /// Rule on one side of the reference element, with points in element reference coordinates.
    ///
    /// Weights refer to the side parametrization `t ∈ [-1, 1]`; the sides of a line segment are
    /// points and carry a single unit weight.
    pub fn side(kind: ElementType, side: usize, points_per_dim: usize) -> Result<Self> {
        match kind {
            ElementType::Edge2 => Ok(Self {
                weights: vec![1.0],
                points: vec![side_reference_point(kind, side, 0.0)],
            }),
            ElementType::Quad4 => {
                let (t, w) = gauss_legendre_1d(points_per_dim)?;
                Ok(Self {
                    weights: w,
                    points: t.iter().map(|&t| side_reference_point(kind, side, t)).collect(),
                })
            }
        }
    }

    /// The side parameters of the rule used on every side of the given element type.
    pub fn side_parameters(kind: ElementType, points_per_dim: usize) -> Result<Vec<f64>> {
        match kind {
            ElementType::Edge2 => Ok(vec![0.0]),
            ElementType::Quad4 => gauss_legendre_1d(points_per_dim).map(|(t, _)| t),
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Element and side rules for every element type, built once per system.
#[derive(Debug, Clone)]
pub struct QuadratureTable {
    points_per_dim: usize,
    edge: QuadratureRule,
    quad: QuadratureRule,
    edge_sides: Vec<QuadratureRule>,
    quad_sides: Vec<QuadratureRule>,
}

impl QuadratureTable {
    pub fn new(points_per_dim: usize) -> Result<Self> {
        Ok(Self {
            points_per_dim,
            edge: QuadratureRule::gauss(ElementType::Edge2, points_per_dim)?,
            quad: QuadratureRule::gauss(ElementType::Quad4, points_per_dim)?,
            edge_sides: (0..2)
                .map(|s| QuadratureRule::side(ElementType::Edge2, s, points_per_dim))
                .collect::<Result<_>>()?,
            quad_sides: (0..4)
                .map(|s| QuadratureRule::side(ElementType::Quad4, s, points_per_dim))
                .collect::<Result<_>>()?,
        })
    }

    pub fn points_per_dim(&self) -> usize {
        self.points_per_dim
    }

    pub fn element_rule(&self, kind: ElementType) -> &QuadratureRule {
        match kind {
            ElementType::Edge2 => &self.edge,
            ElementType::Quad4 => &self.quad,
        }
    }

    pub fn side_rule(&self, kind: ElementType, side: usize) -> &QuadratureRule {
        match kind {
            ElementType::Edge2 => &self.edge_sides[side],
            ElementType::Quad4 => &self.quad_sides[side],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixcompare::assert_scalar_eq;

    #[test]
    fn gauss_rules_integrate_polynomials_exactly() {
        for n in 1..=4 {
            let (x, w) = gauss_legendre_1d(n).unwrap();
            let degree = 2 * n - 1;
            let integral: f64 = x.iter().zip(&w).map(|(x, w)| w * x.powi(degree as i32 - 1)).sum();
            let exact = if (degree - 1) % 2 == 0 { 2.0 / degree as f64 } else { 0.0 };
            assert_scalar_eq!(integral, exact, comp = abs, tol = 1e-14);
        }
    }

    #[test]
    fn quad_rule_weights_sum_to_reference_area() {
        let rule = QuadratureRule::gauss(ElementType::Quad4, 3).unwrap();
        assert_eq!(rule.len(), 9);
        assert_scalar_eq!(rule.weights.iter().sum::<f64>(), 4.0, comp = abs, tol = 1e-14);
    }
}
