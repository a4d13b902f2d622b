use crate::config::FootprintParams;
use gridnav_lattice::costmap::{CostmapBuffer, CostmapView, Layer};
use gridnav_lattice::environment::CollisionModel;
use gridnav_lattice::{normalize_angle, Pose, NUM_ANGLES};
use itertools::Itertools;

/// Footprint / circle-center collision queries against either costmap layer.
///
/// Two shapes: the padded footprint polygon traced along its boundary
/// (accurate, slower) and a handful of disk centers (fast). Both report the
/// worst cell cost met, or `None` on contact with inscribed/lethal space.
#[derive(Clone)]
pub struct FootprintChecker {
    params: FootprintParams,
}

impl FootprintChecker {
    pub fn new(params: FootprintParams) -> FootprintChecker {
        FootprintChecker { params }
    }

    pub fn params(&self) -> &FootprintParams {
        &self.params
    }

    /// Worst cost under the footprint boundary at `pose`, padded outward by
    /// `padding` meters. `None` on collision or off-map.
    pub fn footprint_cost(
        &self,
        buf: &CostmapBuffer,
        layer: Layer,
        pose: &Pose,
        padding: f64,
    ) -> Option<u8> {
        let pts = transform_polygon(&self.params.footprint, pose, padding, 0.0, 0.0);
        let step = buf.resolution * 0.5;
        let inscribed = buf.thresholds.inscribed;
        polygon_boundary_cost(&pts, step, inscribed, |wx, wy| {
            let (x, y) = buf.world_to_cell(wx, wy)?;
            buf.cost(layer, x, y)
        })
    }

    /// Same query with the footprint stretched by the recovery extends.
    pub fn extended_footprint_cost(
        &self,
        buf: &CostmapBuffer,
        layer: Layer,
        pose: &Pose,
        extend_x: f64,
        extend_y: f64,
    ) -> Option<u8> {
        let pts = transform_polygon(&self.params.footprint, pose, 0.0, extend_x, extend_y);
        let step = buf.resolution * 0.5;
        let inscribed = buf.thresholds.inscribed;
        polygon_boundary_cost(&pts, step, inscribed, |wx, wy| {
            let (x, y) = buf.world_to_cell(wx, wy)?;
            buf.cost(layer, x, y)
        })
    }

    /// Disk-cover check: worst cost at the transformed circle centers.
    pub fn circle_cost(
        &self,
        buf: &CostmapBuffer,
        layer: Layer,
        pose: &Pose,
        extend_y: f64,
    ) -> Option<u8> {
        self.circle_cost_extended(buf, layer, pose, 0.0, extend_y)
    }

    /// Disk-cover check with the centers pushed out along both robot axes.
    pub fn circle_cost_extended(
        &self,
        buf: &CostmapBuffer,
        layer: Layer,
        pose: &Pose,
        extend_x: f64,
        extend_y: f64,
    ) -> Option<u8> {
        let inscribed = buf.thresholds.inscribed;
        centers_cost(&self.params.circle_centers, pose, extend_x, extend_y, inscribed, |wx, wy| {
            let (x, y) = buf.world_to_cell(wx, wy)?;
            buf.cost(layer, x, y)
        })
    }

    /// Disk-cover check over the backward-maneuver centers.
    pub fn backward_cost(&self, buf: &CostmapBuffer, layer: Layer, pose: &Pose) -> Option<u8> {
        let inscribed = buf.thresholds.inscribed;
        centers_cost(&self.params.backward_center_points, pose, 0.0, 0.0, inscribed, |wx, wy| {
            let (x, y) = buf.world_to_cell(wx, wy)?;
            buf.cost(layer, x, y)
        })
    }

    /// Disk-cover check against a snapshotted view (controller-side).
    pub fn circle_cost_view(&self, view: &CostmapView, pose: &Pose) -> Option<u8> {
        let inscribed = view.thresholds.inscribed;
        centers_cost(&self.params.circle_centers, pose, 0.0, 0.0, inscribed, |wx, wy| {
            view.cost_at_world(wx, wy)
        })
    }

    /// Searches in-place rotations around `pose` for a collision-free
    /// footprint (extended by the recovery margins), nearest heading first.
    /// Returns the yaw and the corresponding goal pose.
    pub fn recovery_circle_cost(
        &self,
        buf: &CostmapBuffer,
        pose: &Pose,
        extend_x: f64,
        extend_y: f64,
    ) -> Option<(f64, Pose)> {
        let step = 2.0 * std::f64::consts::PI / NUM_ANGLES as f64;
        let mut offsets: Vec<i32> = (0..NUM_ANGLES as i32).collect();
        offsets.sort_by_key(|&k| k.min(NUM_ANGLES as i32 - k));
        for k in offsets {
            let yaw = normalize_angle(pose.th + k as f64 * step);
            let candidate = Pose::new(pose.x, pose.y, yaw);
            if self
                .extended_footprint_cost(buf, Layer::Live, &candidate, extend_x, extend_y)
                .is_some()
            {
                return Some((yaw, candidate));
            }
        }
        None
    }
}

/// The collision seam handed to the lattice environment: polygon boundary and
/// disk-cover queries against the planner's snapshotted window.
pub struct LatticeCollisionModel {
    params: FootprintParams,
    padding: f64,
}

impl LatticeCollisionModel {
    pub fn new(params: FootprintParams, padding: f64) -> LatticeCollisionModel {
        LatticeCollisionModel { params, padding }
    }
}

impl CollisionModel for LatticeCollisionModel {
    fn footprint_cost(&self, pose: &Pose, view: &CostmapView) -> Option<u8> {
        let pts = transform_polygon(&self.params.footprint, pose, self.padding, 0.0, 0.0);
        let step = view.resolution * 0.5;
        polygon_boundary_cost(&pts, step, view.thresholds.inscribed, |wx, wy| {
            view.cost_at_world(wx, wy)
        })
    }

    fn circle_cost(&self, pose: &Pose, view: &CostmapView) -> Option<u8> {
        centers_cost(&self.params.circle_centers, pose, 0.0, 0.0, view.thresholds.inscribed, |wx, wy| {
            view.cost_at_world(wx, wy)
        })
    }
}

/// Robot-frame polygon to world frame, with outward padding and axis extends.
fn transform_polygon(
    polygon: &[(f64, f64)],
    pose: &Pose,
    padding: f64,
    extend_x: f64,
    extend_y: f64,
) -> Vec<(f64, f64)> {
    let (sin, cos) = pose.th.sin_cos();
    polygon
        .iter()
        .map(|&(x, y)| {
            let x = x + (padding + extend_x) * x.signum();
            let y = y + (padding + extend_y) * y.signum();
            (pose.x + x * cos - y * sin, pose.y + x * sin + y * cos)
        })
        .collect()
}

/// Worst cost sampled along the polygon boundary; `None` when any sample is
/// off-map or at/above the inscribed threshold.
fn polygon_boundary_cost(
    points: &[(f64, f64)],
    step: f64,
    inscribed: u8,
    cost_at: impl Fn(f64, f64) -> Option<u8>,
) -> Option<u8> {
    let mut worst: u8 = 0;
    for (&(ax, ay), &(bx, by)) in points.iter().circular_tuple_windows() {
        let len = (bx - ax).hypot(by - ay);
        let samples = ((len / step).ceil() as usize).max(1);
        for i in 0..=samples {
            let f = i as f64 / samples as f64;
            let c = cost_at(ax + (bx - ax) * f, ay + (by - ay) * f)?;
            if c >= inscribed {
                return None;
            }
            worst = worst.max(c);
        }
    }
    Some(worst)
}

fn centers_cost(
    centers: &[(f64, f64)],
    pose: &Pose,
    extend_x: f64,
    extend_y: f64,
    inscribed: u8,
    cost_at: impl Fn(f64, f64) -> Option<u8>,
) -> Option<u8> {
    let (sin, cos) = pose.th.sin_cos();
    let mut worst: u8 = 0;
    for &(x, y) in centers {
        let x = x + extend_x * x.signum();
        let y = y + extend_y * y.signum();
        let c = cost_at(pose.x + x * cos - y * sin, pose.y + x * sin + y * cos)?;
        if c >= inscribed {
            return None;
        }
        worst = worst.max(c);
    }
    Some(worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FootprintParams;

    fn buffer() -> CostmapBuffer {
        CostmapBuffer::new(200, 200, 0.05, 0.0, 0.0)
    }

    fn checker() -> FootprintChecker {
        FootprintChecker::new(FootprintParams::default())
    }

    #[test]
    fn free_space_has_zero_cost() {
        let buf = buffer();
        let c = checker();
        let pose = Pose::new(5.0, 5.0, 0.7);
        assert_eq!(c.footprint_cost(&buf, Layer::Live, &pose, 0.0), Some(0));
        assert_eq!(c.circle_cost(&buf, Layer::Live, &pose, 0.0), Some(0));
    }

    #[test]
    fn obstacle_under_the_boundary_is_a_collision() {
        let mut buf = buffer();
        // lethal block overlapping the front edge of the footprint at (5, 5)
        buf.stamp_rect(5.2, 4.9, 5.3, 5.1, 254);
        let c = checker();
        let pose = Pose::new(5.0, 5.0, 0.0);
        assert_eq!(c.footprint_cost(&buf, Layer::Live, &pose, 0.0), None);
        // the static layer never saw the obstacle
        assert_eq!(c.footprint_cost(&buf, Layer::Static, &pose, 0.0), Some(0));
    }

    #[test]
    fn padding_widens_the_checked_boundary() {
        let mut buf = buffer();
        // block just beyond the unpadded outline
        buf.stamp_rect(5.31, 4.95, 5.36, 5.05, 254);
        let c = checker();
        let pose = Pose::new(5.0, 5.0, 0.0);
        assert!(c.footprint_cost(&buf, Layer::Live, &pose, 0.0).is_some());
        assert_eq!(c.footprint_cost(&buf, Layer::Live, &pose, 0.12), None);
    }

    #[test]
    fn recovery_sweep_finds_a_free_heading() {
        let mut buf = buffer();
        // block ahead of the robot: the extended footprint reaches it when
        // pointing at it, but not when rotated away
        buf.stamp_rect(5.33, 4.88, 5.47, 5.12, 254);
        let c = FootprintChecker::new(FootprintParams {
            footprint: vec![(0.25, 0.15), (-0.25, 0.15), (-0.25, -0.15), (0.25, -0.15)],
            ..FootprintParams::default()
        });
        let pose = Pose::new(5.0, 5.0, 0.0);
        assert_eq!(
            c.extended_footprint_cost(&buf, Layer::Live, &pose, 0.1, 0.0),
            None
        );
        let (yaw, goal) = c
            .recovery_circle_cost(&buf, &pose, 0.1, 0.0)
            .expect("some heading must be free");
        assert!(yaw.abs() > 0.3, "recovery yaw {yaw} still faces the block");
        assert_eq!(goal.x, pose.x);
        assert_eq!(goal.y, pose.y);
    }

    #[test]
    fn recovery_sweep_reports_fully_enclosed() {
        let mut buf = buffer();
        buf.stamp_rect(4.5, 4.5, 5.5, 5.5, 254);
        let c = checker();
        assert!(c
            .recovery_circle_cost(&buf, &Pose::new(5.0, 5.0, 0.0), 0.0, 0.0)
            .is_none());
    }
}
