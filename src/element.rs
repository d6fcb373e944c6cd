//! Reference elements: basis functions, geometric mapping and side geometry.
//!
//! Both supported element types are isoparametric with linear (bilinear) Lagrange basis
//! functions, so the same basis describes the geometry and the first order Lagrange fields.
use crate::error::{Result, SystemError};
use crate::mesh::ElementType;
use nalgebra::{Matrix2, Point3, Vector2, Vector3};

/// Maximum number of nodes of any supported element.
pub const MAX_NODES: usize = 4;

const QUAD_NODE_SIGNS: [(f64, f64); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

/// Reference basis function values at `xi`. Entries beyond the node count are zero.
pub fn reference_basis(kind: ElementType, xi: &Point3<f64>) -> [f64; MAX_NODES] {
    let mut phi = [0.0; MAX_NODES];
    match kind {
        ElementType::Edge2 => {
            phi[0] = 0.5 * (1.0 - xi.x);
            phi[1] = 0.5 * (1.0 + xi.x);
        }
        ElementType::Quad4 => {
            for (phi, &(a, b)) in phi.iter_mut().zip(&QUAD_NODE_SIGNS) {
                *phi = 0.25 * (1.0 + a * xi.x) * (1.0 + b * xi.y);
            }
        }
    }
    phi
}

/// Gradients of the reference basis functions with respect to the reference coordinates.
pub fn reference_gradients(kind: ElementType, xi: &Point3<f64>) -> [Vector2<f64>; MAX_NODES] {
    let mut grad = [Vector2::zeros(); MAX_NODES];
    match kind {
        ElementType::Edge2 => {
            grad[0] = Vector2::new(-0.5, 0.0);
            grad[1] = Vector2::new(0.5, 0.0);
        }
        ElementType::Quad4 => {
            for (grad, &(a, b)) in grad.iter_mut().zip(&QUAD_NODE_SIGNS) {
                *grad = Vector2::new(
                    0.25 * a * (1.0 + b * xi.y),
                    0.25 * b * (1.0 + a * xi.x),
                );
            }
        }
    }
    grad
}

/// Maps the side parameter `t ∈ [-1, 1]` to reference coordinates of the element.
///
/// Each side is traversed in the counter-clockwise direction of the element, so that
/// `t = -1` coincides with the first node of [`ElementType::side_nodes`].
pub fn side_reference_point(kind: ElementType, side: usize, t: f64) -> Point3<f64> {
    match (kind, side) {
        (ElementType::Edge2, 0) => Point3::new(-1.0, 0.0, 0.0),
        (ElementType::Edge2, _) => Point3::new(1.0, 0.0, 0.0),
        (ElementType::Quad4, 0) => Point3::new(t, -1.0, 0.0),
        (ElementType::Quad4, 1) => Point3::new(1.0, t, 0.0),
        (ElementType::Quad4, 2) => Point3::new(-t, 1.0, 0.0),
        (ElementType::Quad4, _) => Point3::new(-1.0, -t, 0.0),
    }
}

/// Basis values, physical gradients and the mapped point at one reference point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointEvaluation {
    pub x: Point3<f64>,
    pub det_j: f64,
    pub phi: [f64; MAX_NODES],
    pub grad_phi: [Vector3<f64>; MAX_NODES],
}

/// Evaluates the geometric mapping of an element with the given vertices at `xi`.
pub fn evaluate_at(
    kind: ElementType,
    element: usize,
    vertices: &[Point3<f64>],
    xi: &Point3<f64>,
) -> Result<PointEvaluation> {
    let n = kind.num_nodes();
    let phi = reference_basis(kind, xi);
    let ref_grad = reference_gradients(kind, xi);
    let x = vertices
        .iter()
        .zip(&phi)
        .fold(Point3::origin(), |acc, (v, &p)| acc + v.coords * p);

    let mut grad_phi = [Vector3::zeros(); MAX_NODES];
    let det_j = match kind {
        ElementType::Edge2 => {
            let j: f64 = (0..n).map(|a| vertices[a].x * ref_grad[a].x).sum();
            if j == 0.0 || !j.is_finite() {
                return Err(SystemError::DegenerateElement {
                    element,
                    reason: "segment has zero length".to_string(),
                });
            }
            for a in 0..n {
                grad_phi[a] = Vector3::new(ref_grad[a].x / j, 0.0, 0.0);
            }
            j.abs()
        }
        ElementType::Quad4 => {
            let mut jacobian = Matrix2::zeros();
            for a in 0..n {
                let x_a = Vector2::new(vertices[a].x, vertices[a].y);
                jacobian += x_a * ref_grad[a].transpose();
            }
            let det = jacobian.determinant();
            if det <= 0.0 {
                return Err(SystemError::DegenerateElement {
                    element,
                    reason: format!("Jacobian determinant {det:e} is not positive"),
                });
            }
            let j_inv_t = jacobian
                .try_inverse()
                .ok_or_else(|| SystemError::DegenerateElement {
                    element,
                    reason: "Jacobian is singular".to_string(),
                })?
                .transpose();
            for a in 0..n {
                let g = j_inv_t * ref_grad[a];
                grad_phi[a] = Vector3::new(g.x, g.y, 0.0);
            }
            det
        }
    };

    Ok(PointEvaluation {
        x,
        det_j,
        phi,
        grad_phi,
    })
}

/// The length scale of a side, i.e. the factor mapping side weights to physical measure.
///
/// Sides of line segments are points and have unit measure.
pub fn side_measure_factor(kind: ElementType, vertices: &[Point3<f64>], side: usize) -> f64 {
    match kind {
        ElementType::Edge2 => 1.0,
        ElementType::Quad4 => {
            let nodes = kind.side_nodes(side);
            0.5 * (vertices[nodes[1]] - vertices[nodes[0]]).norm()
        }
    }
}

/// Unit outward normal of a side.
pub fn outward_normal(kind: ElementType, vertices: &[Point3<f64>], side: usize) -> Vector3<f64> {
    let n = kind.num_nodes() as f64;
    let centroid = vertices[..kind.num_nodes()]
        .iter()
        .fold(Point3::origin(), |acc, v| acc + v.coords / n);
    let side_nodes = kind.side_nodes(side);
    let midpoint = side_nodes
        .iter()
        .fold(Point3::origin(), |acc, &a| acc + vertices[a].coords / side_nodes.len() as f64);
    let normal = match kind {
        ElementType::Edge2 => Vector3::x(),
        ElementType::Quad4 => {
            let t = vertices[side_nodes[1]] - vertices[side_nodes[0]];
            Vector3::new(t.y, -t.x, 0.0).normalize()
        }
    };
    if (midpoint - centroid).dot(&normal) < 0.0 {
        -normal
    } else {
        normal
    }
}

/// Largest distance between two vertices of the element.
pub fn element_diameter(kind: ElementType, vertices: &[Point3<f64>]) -> f64 {
    let n = kind.num_nodes();
    let mut h: f64 = 0.0;
    for a in 0..n {
        for b in (a + 1)..n {
            h = h.max((vertices[b] - vertices[a]).norm());
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixcompare::assert_scalar_eq;

    fn unit_square() -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(2.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ]
    }

    #[test]
    fn quad_mapping_of_rectangle() {
        let vertices = unit_square();
        let eval = evaluate_at(ElementType::Quad4, 0, &vertices, &Point3::new(0.0, 0.0, 0.0)).unwrap();
        assert_scalar_eq!(eval.det_j, 0.5, comp = abs, tol = 1e-14);
        assert_scalar_eq!(eval.x.x, 1.0, comp = abs, tol = 1e-14);
        assert_scalar_eq!(eval.x.y, 0.5, comp = abs, tol = 1e-14);
        let sum: f64 = eval.phi.iter().sum();
        assert_scalar_eq!(sum, 1.0, comp = abs, tol = 1e-14);
        let grad_sum = eval.grad_phi.iter().fold(Vector3::zeros(), |acc, g| acc + g);
        assert!(grad_sum.norm() < 1e-14);
    }

    #[test]
    fn inverted_quad_is_degenerate() {
        let mut vertices = unit_square();
        vertices.swap(1, 3);
        let result = evaluate_at(ElementType::Quad4, 7, &vertices, &Point3::origin());
        assert!(matches!(result, Err(SystemError::DegenerateElement { element: 7, .. })));
    }

    #[test]
    fn outward_normals_point_away_from_centroid() {
        let vertices = unit_square();
        let expected = [
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(-1.0, 0.0, 0.0),
        ];
        for (side, expected) in expected.iter().enumerate() {
            let normal = outward_normal(ElementType::Quad4, &vertices, side);
            assert!((normal - expected).norm() < 1e-14);
        }
    }
}
