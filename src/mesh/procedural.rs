//! Basic procedural mesh generation routines.
use crate::error::{Result, SystemError};
use crate::mesh::{Element, ElementType, Mesh};
use nalgebra::Point3;

/// Uniform mesh of `num_elements` segments covering `[x0, x1]`.
///
/// The left end point is labelled with boundary 0, the right end point with boundary 1.
pub fn create_uniform_line_mesh(x0: f64, x1: f64, num_elements: usize) -> Result<Mesh> {
    if num_elements == 0 || !(x1 > x0) {
        return Err(SystemError::Setup(format!(
            "cannot create line mesh with {num_elements} elements on [{x0}, {x1}]"
        )));
    }
    let h = (x1 - x0) / num_elements as f64;
    let vertices = (0..=num_elements)
        .map(|i| Point3::new(x0 + i as f64 * h, 0.0, 0.0))
        .collect();
    let elements = (0..num_elements)
        .map(|i| Element::new(ElementType::Edge2, vec![i, i + 1], 0))
        .collect();
    let mut mesh = Mesh::from_vertices_and_elements(1, vertices, elements)?;
    mesh.add_boundary_side(0, 0, 0)?;
    mesh.add_boundary_side(num_elements - 1, 1, 1)?;
    Ok(mesh)
}

/// Uniform grid of `cells_x` by `cells_y` quadrilaterals covering the given rectangle.
///
/// Boundary labels: 0 bottom, 1 right, 2 top, 3 left.
pub fn create_rectangular_uniform_quad_mesh(
    cells_x: usize,
    cells_y: usize,
    x_range: [f64; 2],
    y_range: [f64; 2],
) -> Result<Mesh> {
    if cells_x == 0 || cells_y == 0 || !(x_range[1] > x_range[0]) || !(y_range[1] > y_range[0]) {
        return Err(SystemError::Setup(format!(
            "cannot create {cells_x}x{cells_y} quad mesh on {x_range:?} x {y_range:?}"
        )));
    }
    let hx = (x_range[1] - x_range[0]) / cells_x as f64;
    let hy = (y_range[1] - y_range[0]) / cells_y as f64;
    let vertex_index = |i: usize, j: usize| (cells_x + 1) * j + i;

    let mut vertices = Vec::with_capacity((cells_x + 1) * (cells_y + 1));
    for j in 0..=cells_y {
        for i in 0..=cells_x {
            vertices.push(Point3::new(x_range[0] + i as f64 * hx, y_range[0] + j as f64 * hy, 0.0));
        }
    }

    let mut elements = Vec::with_capacity(cells_x * cells_y);
    for j in 0..cells_y {
        for i in 0..cells_x {
            let nodes = vec![
                vertex_index(i, j),
                vertex_index(i + 1, j),
                vertex_index(i + 1, j + 1),
                vertex_index(i, j + 1),
            ];
            elements.push(Element::new(ElementType::Quad4, nodes, 0));
        }
    }

    let mut mesh = Mesh::from_vertices_and_elements(2, vertices, elements)?;
    let cell_index = |i: usize, j: usize| cells_x * j + i;
    for i in 0..cells_x {
        mesh.add_boundary_side(cell_index(i, 0), 0, 0)?;
        mesh.add_boundary_side(cell_index(i, cells_y - 1), 2, 2)?;
    }
    for j in 0..cells_y {
        mesh.add_boundary_side(cell_index(cells_x - 1, j), 1, 1)?;
        mesh.add_boundary_side(cell_index(0, j), 3, 3)?;
    }
    Ok(mesh)
}

/// Assigns a subdomain id to every element whose centroid satisfies the predicate.
pub fn assign_subdomain<F>(mesh: &mut Mesh, subdomain: u16, predicate: F)
where
    F: Fn(&Point3<f64>) -> bool,
{
    let vertices = mesh.vertices().to_vec();
    for element in mesh.elements_mut() {
        let n = element.nodes.len() as f64;
        let centroid = element
            .nodes
            .iter()
            .fold(Point3::origin(), |acc, &node| acc + vertices[node].coords / n);
        if predicate(&centroid) {
            element.subdomain = subdomain;
        }
    }
}
