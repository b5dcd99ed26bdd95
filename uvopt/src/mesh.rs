use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::Error;

/// An indexed triangle mesh embedded in 3D.
///
/// Faces are stored as vertex index triples. No connectivity is cached here;
/// adjacency queries build what they need on demand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriMesh {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[usize; 3]>,
}

impl TriMesh {
    pub fn new(vertices: Vec<[f64; 3]>, faces: Vec<[usize; 3]>) -> Self {
        TriMesh { vertices, faces }
    }

    /// Build a mesh lying in the `z = 0` plane.
    pub fn from_planar(vertices: &[[f64; 2]], faces: Vec<[usize; 3]>) -> Self {
        let vertices = vertices.iter().map(|&[x, y]| [x, y, 0.0]).collect();
        TriMesh { vertices, faces }
    }

    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    /// Check that the mesh is non-empty and that every face references an
    /// existing vertex.
    pub fn validate(&self) -> Result<(), Error> {
        if self.vertices.is_empty() || self.faces.is_empty() {
            return Err(Error::EmptyMesh);
        }
        let n = self.num_vertices();
        for (face, f) in self.faces.iter().enumerate() {
            if let Some(&vertex) = f.iter().find(|&&v| v >= n) {
                return Err(Error::InvalidFaceIndex { face, vertex });
            }
        }
        Ok(())
    }

    /// For each vertex, the faces incident to it in increasing face order.
    pub fn vertex_faces(&self) -> Vec<Vec<usize>> {
        let mut vertex_faces = vec![Vec::new(); self.num_vertices()];
        for (fidx, face) in self.faces.iter().enumerate() {
            for &v in face.iter() {
                // Repeated vertices in a face only count the face once.
                if vertex_faces[v].last() != Some(&fidx) {
                    vertex_faces[v].push(fidx);
                }
            }
        }
        vertex_faces
    }

    /// Distinct vertices of the given faces in order of first appearance.
    pub fn face_vertices(&self, faces: &[usize]) -> Vec<usize> {
        let mut seen = AHashSet::new();
        faces
            .iter()
            .flat_map(|&f| self.faces[f].iter().copied())
            .filter(|&v| seen.insert(v))
            .collect()
    }

    /// Unique undirected edges, each stored with the smaller index first.
    pub fn edges(&self) -> Vec<[usize; 2]> {
        let mut edges: Vec<[usize; 2]> = self
            .faces
            .iter()
            .flat_map(|f| (0..3).map(move |i| sorted_edge(f[i], f[(i + 1) % 3])))
            .filter(|[a, b]| a != b)
            .collect();
        edges.sort_unstable();
        edges.dedup();
        edges
    }

    /// Vertex neighbours induced by the face edges.
    pub fn vertex_neighbours(&self) -> Vec<Vec<usize>> {
        let mut neighbours = vec![Vec::new(); self.num_vertices()];
        for [a, b] in self.edges() {
            neighbours[a].push(b);
            neighbours[b].push(a);
        }
        neighbours
    }

    /// The longest closed boundary loop of the mesh, if there is one.
    ///
    /// Boundary edges are directed edges whose opposite is not part of any
    /// face. Loops are traced following face orientation.
    pub fn boundary_loop(&self) -> Option<Vec<usize>> {
        let mut directed = AHashSet::new();
        for f in self.faces.iter() {
            for i in 0..3 {
                directed.insert((f[i], f[(i + 1) % 3]));
            }
        }

        let mut next: AHashMap<usize, usize> = AHashMap::new();
        let mut starts = Vec::new();
        for f in self.faces.iter() {
            for i in 0..3 {
                let (a, b) = (f[i], f[(i + 1) % 3]);
                if a != b && !directed.contains(&(b, a)) && next.insert(a, b).is_none() {
                    starts.push(a);
                }
            }
        }

        let mut visited = AHashSet::new();
        let mut best: Option<Vec<usize>> = None;
        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            let mut boundary = vec![start];
            visited.insert(start);
            let mut cur = start;
            let closed = loop {
                match next.get(&cur) {
                    Some(&v) if v == start => break true,
                    Some(&v) if visited.insert(v) => {
                        boundary.push(v);
                        cur = v;
                    }
                    // Non-manifold boundary or a dead end.
                    _ => break false,
                }
            };
            if !closed {
                log::warn!(
                    "Skipping open boundary chain starting at vertex {} ({} vertices)",
                    start,
                    boundary.len()
                );
                continue;
            }
            if best.as_ref().map_or(true, |b| b.len() < boundary.len()) {
                best = Some(boundary);
            }
        }
        best
    }
}

#[inline]
fn sorted_edge(a: usize, b: usize) -> [usize; 2] {
    if a < b {
        [a, b]
    } else {
        [b, a]
    }
}
