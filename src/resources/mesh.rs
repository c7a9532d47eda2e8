//! Mesh data structures and procedural generation

use crate::backend::{BackendResult, GraphicsBackend, MeshHandle, Vertex};
use glam::{Vec2, Vec3, Vec4};

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Upload to the backend
    pub fn upload<B: GraphicsBackend>(&self, backend: &mut B) -> BackendResult<MeshHandle> {
        backend.create_mesh(&self.name, &self.vertices, &self.indices)
    }

    /// Built-in primitive by name, as referenced from a mesh component path
    pub fn primitive(name: &str) -> Option<Self> {
        match name {
            "cube" => Some(Self::cube()),
            "sphere" => Some(Self::sphere(32, 16)),
            "plane" => Some(Self::plane(10.0, 10.0, 1)),
            "quad" => Some(Self::screen_quad()),
            _ => None,
        }
    }

    /// Full-screen quad in clip space. UVs put (0, 0) at the top-left.
    /// Normals are zero.
    pub fn screen_quad() -> Self {
        let mut mesh = Mesh::new("screen_quad");
        let corners = [
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, -1.0),
            Vec2::new(-1.0, -1.0),
            Vec2::new(-1.0, 1.0),
        ];
        for corner in corners {
            let uv = Vec2::new(corner.x * 0.5 + 0.5, 0.5 - corner.y * 0.5);
            mesh.vertices
                .push(Vertex::new(corner.extend(0.0), Vec3::ZERO, uv));
        }
        mesh.indices.extend_from_slice(&[0, 3, 1, 1, 3, 2]);
        mesh
    }

    /// Unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        // (normal, u axis, v axis) per face; v points down the face like image rows
        let faces = [
            (Vec3::Z, Vec3::X, -Vec3::Y),
            (-Vec3::Z, -Vec3::X, -Vec3::Y),
            (Vec3::X, -Vec3::Z, -Vec3::Y),
            (-Vec3::X, Vec3::Z, -Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::Z),
            (-Vec3::Y, Vec3::X, -Vec3::Z),
        ];

        for (normal, u_axis, v_axis) in faces {
            let base = mesh.vertices.len() as u32;
            for (u, v) in [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
                let position = normal * 0.5 + u_axis * (u - 0.5) + v_axis * (v - 0.5);
                mesh.vertices.push(Vertex {
                    position,
                    normal,
                    uv: Vec2::new(u, v),
                    tangent: u_axis.extend(1.0),
                });
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// UV sphere of diameter 1
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");
        let segments = segments.max(3);
        let rings = rings.max(2);

        for ring in 0..=rings {
            let phi = ring as f32 / rings as f32 * std::f32::consts::PI;
            for segment in 0..=segments {
                let theta = segment as f32 / segments as f32 * std::f32::consts::TAU;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex {
                    position: normal * 0.5,
                    normal,
                    uv: Vec2::new(
                        segment as f32 / segments as f32,
                        ring as f32 / rings as f32,
                    ),
                    tangent: Vec4::new(-theta.sin(), 0.0, theta.cos(), 1.0),
                });
            }
        }

        let stride = segments + 1;
        for ring in 0..rings {
            for segment in 0..segments {
                let a = ring * stride + segment;
                let b = a + stride;
                mesh.indices
                    .extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
            }
        }

        mesh
    }

    /// Plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");
        let n = subdivisions.max(1);

        for z in 0..=n {
            for x in 0..=n {
                let (u, v) = (x as f32 / n as f32, z as f32 / n as f32);
                mesh.vertices.push(Vertex {
                    position: Vec3::new((u - 0.5) * width, 0.0, (v - 0.5) * depth),
                    normal: Vec3::Y,
                    uv: Vec2::new(u, v),
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
        }

        for z in 0..n {
            for x in 0..n {
                let a = z * (n + 1) + x;
                let b = a + n + 1;
                mesh.indices
                    .extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
            }
        }

        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_screen_quad_uvs() {
        let quad = Mesh::screen_quad();
        assert_eq!(quad.vertices.len(), 4);
        assert_eq!(quad.triangle_count(), 2);
        // top-left corner samples the first texel row
        assert_eq!(quad.vertices[3].uv, Vec2::new(0.0, 0.0));
        assert_eq!(quad.vertices[1].uv, Vec2::new(1.0, 1.0));
        assert!(quad.vertices.iter().all(|v| v.normal == Vec3::ZERO));
    }

    #[test]
    fn test_cube_faces_point_outward() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        for v in &cube.vertices {
            assert!((v.position.dot(v.normal) - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sphere_indices_in_range() {
        let sphere = Mesh::sphere(8, 4);
        let count = sphere.vertices.len() as u32;
        assert!(sphere.indices.iter().all(|&i| i < count));
        assert!(sphere
            .vertices
            .iter()
            .all(|v| (v.position.length() - 0.5).abs() < 1e-4));
    }

    #[test]
    fn test_primitive_lookup_and_upload() {
        let mut backend = HeadlessBackend::new();
        assert!(Mesh::primitive("teapot").is_none());
        let plane = Mesh::primitive("plane").unwrap();
        assert!(plane.upload(&mut backend).is_ok());
    }
}
