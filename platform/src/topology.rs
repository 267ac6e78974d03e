// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::{TopologyConfiguration, TopologyType};
use crate::error::Error;

/// Outgoing direction on the 2-D fabric. `Local` means the destination is
/// this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
    Local,
}

/// Per-node view of the inter-PE topology: coordinates plus dimension-ordered
/// routing.
///
/// Node ids map to coordinates as `x = id % width`, `y = id / width`.
#[derive(Clone, Debug)]
pub struct TopologyHandler {
    kind: TopologyType,
    width: usize,
    height: usize,
    node_id: u32,
    my_x: usize,
    my_y: usize,
}

impl TopologyHandler {
    pub fn new(config: &TopologyConfiguration, node_id: u32) -> Result<Self, Error> {
        let (width, height) = config.dimensions()?;
        if (node_id as usize) >= width * height {
            return Err(Error::InvalidConfiguration(format!(
                "node {} outside {}x{} fabric",
                node_id, width, height
            )));
        }
        Ok(Self {
            kind: config.topology_type,
            width,
            height,
            node_id,
            my_x: node_id as usize % width,
            my_y: node_id as usize / width,
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn node_count(&self) -> usize {
        self.width * self.height
    }

    fn coord(&self, node: u32) -> (usize, usize) {
        (node as usize % self.width, node as usize / self.width)
    }

    fn node_at(&self, x: usize, y: usize) -> u32 {
        (y * self.width + x) as u32
    }

    /// Signed shortest distance along one torus axis; positive means
    /// forward (increasing coordinate), ties prefer forward.
    fn torus_axis_distance(from: usize, to: usize, size: usize) -> isize {
        let forward = (to + size - from) % size;
        let backward = (from + size - to) % size;
        if forward <= backward {
            forward as isize
        } else {
            -(backward as isize)
        }
    }

    /// Dimension-ordered (XY) next-hop direction toward `dst`: resolve the
    /// X axis fully, then the Y axis.
    pub fn route(&self, dst: u32) -> Direction {
        let (dx, dy) = self.coord(dst);
        match self.kind {
            TopologyType::Mesh2d => {
                if dx < self.my_x {
                    Direction::West
                } else if dx > self.my_x {
                    Direction::East
                } else if dy < self.my_y {
                    Direction::South
                } else if dy > self.my_y {
                    Direction::North
                } else {
                    Direction::Local
                }
            }
            TopologyType::Torus2d => {
                let x_dist = Self::torus_axis_distance(self.my_x, dx, self.width);
                let y_dist = Self::torus_axis_distance(self.my_y, dy, self.height);
                if x_dist > 0 {
                    Direction::East
                } else if x_dist < 0 {
                    Direction::West
                } else if y_dist > 0 {
                    Direction::North
                } else if y_dist < 0 {
                    Direction::South
                } else {
                    Direction::Local
                }
            }
        }
    }

    /// Hop distance to `dst`: Manhattan on the mesh, shortest wrap distance
    /// per axis on the torus.
    pub fn hops(&self, dst: u32) -> usize {
        let (dx, dy) = self.coord(dst);
        match self.kind {
            TopologyType::Mesh2d => {
                dx.abs_diff(self.my_x) + dy.abs_diff(self.my_y)
            }
            TopologyType::Torus2d => {
                Self::torus_axis_distance(self.my_x, dx, self.width).unsigned_abs()
                    + Self::torus_axis_distance(self.my_y, dy, self.height).unsigned_abs()
            }
        }
    }

    /// The neighbor reached by leaving this node in `direction`, if the
    /// topology has one. Mesh edges stop at the boundary; torus edges wrap.
    pub fn neighbor_in(&self, direction: Direction) -> Option<u32> {
        let (x, y, w, h) = (self.my_x, self.my_y, self.width, self.height);
        match self.kind {
            TopologyType::Mesh2d => match direction {
                Direction::West if x > 0 => Some(self.node_at(x - 1, y)),
                Direction::East if x + 1 < w => Some(self.node_at(x + 1, y)),
                Direction::South if y > 0 => Some(self.node_at(x, y - 1)),
                Direction::North if y + 1 < h => Some(self.node_at(x, y + 1)),
                _ => None,
            },
            TopologyType::Torus2d => match direction {
                Direction::West => Some(self.node_at((x + w - 1) % w, y)),
                Direction::East => Some(self.node_at((x + 1) % w, y)),
                Direction::South => Some(self.node_at(x, (y + h - 1) % h)),
                Direction::North => Some(self.node_at(x, (y + 1) % h)),
                Direction::Local => None,
            },
        }
    }

    pub fn neighbors(&self) -> Vec<u32> {
        [
            Direction::West,
            Direction::East,
            Direction::South,
            Direction::North,
        ]
        .iter()
        .filter_map(|&direction| self.neighbor_in(direction))
        .collect()
    }

    pub fn description(&self) -> String {
        let name = match self.kind {
            TopologyType::Mesh2d => "Mesh2D",
            TopologyType::Torus2d => "Torus2D",
        };
        format!(
            "{}[{}x{}] Node({},{})",
            name, self.width, self.height, self.my_x, self.my_y
        )
    }
}

#[cfg(test)]
mod topology_tests {
    use super::*;

    fn handler(kind: TopologyType, shape: &str, node: u32) -> TopologyHandler {
        let config = TopologyConfiguration {
            topology_type: kind,
            topology_shape: shape.to_string(),
        };
        TopologyHandler::new(&config, node).unwrap()
    }

    #[test]
    fn mesh_xy_routing() {
        // Node 5 of a 4x4 mesh sits at (1, 1).
        let topo = handler(TopologyType::Mesh2d, "4x4", 5);
        assert_eq!(topo.route(4), Direction::West);
        assert_eq!(topo.route(6), Direction::East);
        assert_eq!(topo.route(1), Direction::South);
        assert_eq!(topo.route(9), Direction::North);
        assert_eq!(topo.route(5), Direction::Local);
        // X resolves before Y.
        assert_eq!(topo.route(10), Direction::East);
        assert_eq!(topo.route(0), Direction::West);
    }

    #[test]
    fn mesh_hops_are_manhattan() {
        let topo = handler(TopologyType::Mesh2d, "4x4", 0);
        assert_eq!(topo.hops(0), 0);
        assert_eq!(topo.hops(3), 3);
        assert_eq!(topo.hops(15), 6);
        assert_eq!(topo.hops(5), 2);
    }

    #[test]
    fn mesh_boundary_neighbors() {
        let corner = handler(TopologyType::Mesh2d, "4x4", 0);
        assert_eq!(corner.neighbors(), vec![1, 4]);
        let center = handler(TopologyType::Mesh2d, "4x4", 5);
        assert_eq!(center.neighbors(), vec![4, 6, 1, 9]);
    }

    #[test]
    fn torus_wraps_shortest() {
        // From (0,0) to (2,3) on a 4x4 torus: X ties at distance 2 and
        // prefers forward (East); Y wraps backward (South) in one hop.
        let topo = handler(TopologyType::Torus2d, "4x4", 0);
        assert_eq!(topo.route(14), Direction::East);
        assert_eq!(topo.hops(14), 3);

        let at_x2 = handler(TopologyType::Torus2d, "4x4", 2);
        assert_eq!(at_x2.route(14), Direction::South);
        assert_eq!(at_x2.hops(14), 1);
    }

    #[test]
    fn torus_neighbors_always_exist() {
        for node in 0..16 {
            let topo = handler(TopologyType::Torus2d, "4x4", node);
            assert_eq!(topo.neighbors().len(), 4);
        }
        let corner = handler(TopologyType::Torus2d, "4x4", 0);
        assert_eq!(corner.neighbor_in(Direction::West), Some(3));
        assert_eq!(corner.neighbor_in(Direction::South), Some(12));
    }

    #[test]
    fn node_outside_fabric_is_rejected() {
        let config = TopologyConfiguration::default();
        assert!(TopologyHandler::new(&config, 16).is_err());
    }

    #[test]
    fn description_names_shape_and_coords() {
        let topo = handler(TopologyType::Torus2d, "4x4", 14);
        assert_eq!(topo.description(), "Torus2D[4x4] Node(2,3)");
    }
}
