use crate::config::{ControllerBackend, ControllerParams};
use crate::footprint::FootprintChecker;
use crate::path::Path;
use crate::status::Twist;
use gridnav_lattice::costmap::CostmapView;
use gridnav_lattice::{normalize_angle, Pose};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ControlError {
    #[error("no path installed")]
    EmptyPath,
    #[error("no valid velocity command found")]
    NoValidCommand,
}

/// Yaw gap below which an in-place rotation counts as finished.
const ROTATE_DONE_YAW: f64 = 0.1;
/// A target change larger than this resets the rotation direction memory.
const ROTATE_TARGET_RESET: f64 = 0.2;
/// Proportional gain of the rotate-to-yaw loop.
const ROTATE_GAIN: f64 = 1.5;
/// Points searched around the head of the path for the nearest waypoint.
const NEAR_WINDOW: usize = 40;

/// Synchronous local trajectory controller.
///
/// Produces one velocity command per call and never blocks; all persistent
/// behavior (goal latch, rotation direction memory) lives in small state
/// fields reset when a new plan is installed.
pub struct LocalController {
    params: ControllerParams,
    /// External velocity scaling, 0.5–1.0 under reduced front clearance.
    pub cmd_vel_ratio: f64,
    latched_xy: bool,
    reached: bool,
    rotate_dir: Option<i8>,
    last_rotate_target: Option<f64>,
}

impl LocalController {
    pub fn new(params: ControllerParams) -> LocalController {
        LocalController {
            params,
            cmd_vel_ratio: 1.0,
            latched_xy: false,
            reached: false,
            rotate_dir: None,
            last_rotate_target: None,
        }
    }

    pub fn params(&self) -> &ControllerParams {
        &self.params
    }

    /// Forgets per-plan state. Called whenever a new global plan is installed.
    pub fn reset(&mut self) {
        self.latched_xy = false;
        self.reached = false;
        self.rotate_dir = None;
        self.last_rotate_target = None;
    }

    pub fn goal_reached(&self) -> bool {
        self.reached
    }

    /// One control step: a velocity command tracking `path` from `pose`, or an
    /// error when every candidate is invalid.
    pub fn compute_velocity(
        &mut self,
        pose: &Pose,
        vel: &Twist,
        path: &Path,
        view: &CostmapView,
        checker: &FootprintChecker,
    ) -> Result<Twist, ControlError> {
        if path.is_empty() {
            return Err(ControlError::EmptyPath);
        }
        let goal = path.last().expect("non-empty").pose;

        // goal latch: once inside the xy tolerance near the end of the plan,
        // stop and rotate to the goal heading
        let dis_to_goal = pose.distance(&goal);
        if self.latched_xy || (dis_to_goal <= self.params.xy_goal_tolerance && path.len() <= 100) {
            self.latched_xy = true;
            if vel.vx.abs() > 0.05 || vel.vy.abs() > 0.05 {
                return Ok(self.stop_with_acc_limits(pose, vel, view, checker));
            }
            let gap = normalize_angle(goal.th - pose.th);
            if gap.abs() <= self.params.yaw_goal_tolerance {
                self.reached = true;
                return Ok(Twist::ZERO);
            }
            return Ok(self.rotate_to_yaw(pose, vel, goal.th));
        }

        let (nearest, _) = path.nearest_index(pose, NEAR_WINDOW).expect("non-empty");
        let point = path.points()[nearest];
        if point.corner {
            let gap = normalize_angle(point.th_out - pose.th);
            if gap.abs() > ROTATE_DONE_YAW {
                return Ok(self.rotate_to_yaw(pose, vel, point.th_out));
            }
            // aligned with the corner exit, fall through to translation
        }

        match self.params.backend {
            ControllerBackend::Rollout => self.rollout(pose, vel, path, nearest, view, checker),
            ControllerBackend::Lookahead => self.lookahead(pose, vel, path, nearest, view, checker),
        }
    }

    /// Decelerates toward zero under the acceleration limits; falls back to a
    /// hard stop when even the decelerating rollout is invalid.
    pub fn stop_with_acc_limits(
        &self,
        pose: &Pose,
        vel: &Twist,
        view: &CostmapView,
        checker: &FootprintChecker,
    ) -> Twist {
        let dt = self.params.control_period;
        let slow = |v: f64, limit: f64| {
            if v > 0.0 {
                (v - limit * dt).max(0.0)
            } else {
                (v + limit * dt).min(0.0)
            }
        };
        let cmd = Twist {
            vx: slow(vel.vx, self.params.acc_lim_x),
            vy: slow(vel.vy, self.params.acc_lim_y),
            wz: slow(vel.wz, self.params.acc_lim_theta),
        };
        if cmd.is_stopped() || self.simulate(pose, cmd.vx, cmd.wz, view, checker).is_some() {
            cmd
        } else {
            Twist::ZERO
        }
    }

    /// In-place rotation toward `target` with a square-root braking profile
    /// and sticky direction choice.
    fn rotate_to_yaw(&mut self, pose: &Pose, vel: &Twist, target: f64) -> Twist {
        if self
            .last_rotate_target
            .map_or(true, |t| normalize_angle(t - target).abs() > ROTATE_TARGET_RESET)
        {
            self.rotate_dir = None;
        }
        self.last_rotate_target = Some(target);

        let gap = normalize_angle(target - pose.th);
        let dir = *self
            .rotate_dir
            .get_or_insert(if gap >= 0.0 { 1 } else { -1 }) as f64;

        let p = &self.params;
        let mut mag = (ROTATE_GAIN * gap.abs()).clamp(p.min_in_place_rotational_vel, p.max_vel_theta);
        // don't overshoot what the braking distance allows
        mag = mag.min((2.0 * p.acc_lim_theta * gap.abs()).sqrt().max(0.05));
        // and respect the angular acceleration from the current command
        let reachable = vel.wz.abs() + p.acc_lim_theta * p.control_period;
        mag = mag.min(reachable.max(p.min_in_place_rotational_vel * 0.5));
        Twist {
            vx: 0.0,
            vy: 0.0,
            wz: mag * dir,
        }
    }

    /// Unicycle forward simulation over `sim_time`. Returns the worst cost met
    /// along the trajectory, `None` when any sample collides.
    fn simulate(
        &self,
        pose: &Pose,
        v: f64,
        w: f64,
        view: &CostmapView,
        checker: &FootprintChecker,
    ) -> Option<u8> {
        let p = &self.params;
        let steps = (p.sim_time / p.sim_granularity).ceil().max(1.0) as usize;
        let dt = p.sim_time / steps as f64;
        let mut x = pose.x;
        let mut y = pose.y;
        let mut th = pose.th;
        let mut worst: u8 = 0;
        for _ in 0..steps {
            x += v * th.cos() * dt;
            y += v * th.sin() * dt;
            th = normalize_angle(th + w * dt);
            let c = checker.circle_cost_view(view, &Pose { x, y, th })?;
            worst = worst.max(c);
        }
        Some(worst)
    }

    fn local_goal(&self, path: &Path, nearest: usize, lookahead: f64) -> Pose {
        let pts = path.points();
        let mut acc = 0.0;
        for i in nearest..pts.len() - 1 {
            acc += pts[i].pose.distance(&pts[i + 1].pose);
            if acc >= lookahead {
                return pts[i + 1].pose;
            }
        }
        pts[pts.len() - 1].pose
    }

    fn path_distance(&self, path: &Path, nearest: usize, pose: &Pose) -> f64 {
        path.points()
            .iter()
            .skip(nearest)
            .take(NEAR_WINDOW)
            .map(|p| p.pose.distance(pose))
            .fold(f64::INFINITY, f64::min)
    }

    /// Samples a (v, ω) grid, simulates every candidate and keeps the best
    /// valid one by the weighted pdist/gdist/occdist score.
    fn rollout(
        &mut self,
        pose: &Pose,
        vel: &Twist,
        path: &Path,
        nearest: usize,
        view: &CostmapView,
        checker: &FootprintChecker,
    ) -> Result<Twist, ControlError> {
        let p = self.params.clone();
        let dt = p.control_period;
        let mut vmax = (p.max_vel_x * self.cmd_vel_ratio).min(path.points()[nearest].max_vel);
        // brake early enough to be stoppable at the end of the plan
        let remaining = path.length_from(nearest);
        vmax = vmax.min((2.0 * p.acc_lim_x * remaining).sqrt().max(0.05));

        let lo = (vel.vx - p.acc_lim_x * dt).max(p.min_vel_x.min(0.05));
        let hi = (vel.vx + p.acc_lim_x * dt).min(vmax).max(lo);
        let wlo = (vel.wz - p.acc_lim_theta * dt).max(-p.max_vel_theta);
        let whi = (vel.wz + p.acc_lim_theta * dt).min(p.max_vel_theta).max(wlo);

        let goal_pose = self.local_goal(path, nearest, (vmax * p.sim_time).max(0.8));
        // inside a highlight stretch, path-following weighs heavier
        let highlight = path.points()[nearest].highlight;

        let mut best: Option<(f64, Twist)> = None;
        for iv in 0..p.vx_samples {
            let v = lerp(lo, hi, iv, p.vx_samples);
            for iw in 0..p.vtheta_samples {
                let w = lerp(wlo, whi, iw, p.vtheta_samples);
                let Some(worst) = self.simulate_endpoint(pose, v, w, view, checker) else {
                    continue;
                };
                let (end, worst_cost) = worst;
                let path_dist = self.path_distance(path, nearest, &end);
                let pdist_scale = if end.distance(pose) <= highlight {
                    p.pdist_scale * 1.5
                } else {
                    p.pdist_scale
                };
                let score = pdist_scale * path_dist
                    + p.gdist_scale * end.distance(&goal_pose)
                    + p.occdist_scale * worst_cost as f64 / 254.0;
                if best.map_or(true, |(s, _)| score < s) {
                    best = Some((score, Twist { vx: v, vy: 0.0, wz: w }));
                }
            }
        }
        best.map(|(_, t)| t).ok_or(ControlError::NoValidCommand)
    }

    fn simulate_endpoint(
        &self,
        pose: &Pose,
        v: f64,
        w: f64,
        view: &CostmapView,
        checker: &FootprintChecker,
    ) -> Option<(Pose, u8)> {
        let p = &self.params;
        let steps = (p.sim_time / p.sim_granularity).ceil().max(1.0) as usize;
        let dt = p.sim_time / steps as f64;
        let mut cur = *pose;
        let mut worst: u8 = 0;
        for _ in 0..steps {
            cur = Pose {
                x: cur.x + v * cur.th.cos() * dt,
                y: cur.y + v * cur.th.sin() * dt,
                th: normalize_angle(cur.th + w * dt),
            };
            let c = checker.circle_cost_view(view, &cur)?;
            worst = worst.max(c);
        }
        Some((cur, worst))
    }

    /// Pure-pursuit style backend: track one lookahead point, validate the
    /// single resulting candidate (halving v on collisions).
    fn lookahead(
        &mut self,
        pose: &Pose,
        vel: &Twist,
        path: &Path,
        nearest: usize,
        view: &CostmapView,
        checker: &FootprintChecker,
    ) -> Result<Twist, ControlError> {
        let p = self.params.clone();
        let lookahead = (vel.vx * p.sim_time).clamp(0.5, 1.2);
        let target = self.local_goal(path, nearest, lookahead);
        let dist = pose.distance(&target).max(1e-6);
        let alpha = normalize_angle((target.y - pose.y).atan2(target.x - pose.x) - pose.th);

        if alpha.abs() > 1.0 {
            let heading = (target.y - pose.y).atan2(target.x - pose.x);
            return Ok(self.rotate_to_yaw(pose, vel, heading));
        }

        let mut vmax = (p.max_vel_x * self.cmd_vel_ratio).min(path.points()[nearest].max_vel);
        let remaining = path.length_from(nearest);
        vmax = vmax.min((2.0 * p.acc_lim_x * remaining).sqrt().max(0.05));
        let mut v = (vmax * (1.0 - 0.6 * alpha.abs())).clamp(p.min_vel_x, vmax.max(p.min_vel_x));
        v = v.min(vel.vx + p.acc_lim_x * p.control_period).max(p.min_vel_x.min(0.05));
        let curvature = 2.0 * alpha.sin() / dist;
        for _ in 0..3 {
            let w = (v * curvature).clamp(p.min_vel_theta, p.max_vel_theta);
            if self.simulate(pose, v, w, view, checker).is_some() {
                return Ok(Twist { vx: v, vy: 0.0, wz: w });
            }
            v *= 0.5;
        }
        Err(ControlError::NoValidCommand)
    }
}

fn lerp(lo: f64, hi: f64, i: u32, n: u32) -> f64 {
    if n <= 1 {
        return lo;
    }
    lo + (hi - lo) * i as f64 / (n - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FootprintParams;
    use gridnav_lattice::costmap::CostmapBuffer;

    fn view_of(build: impl FnOnce(&mut CostmapBuffer)) -> CostmapView {
        let mut buf = CostmapBuffer::new(200, 200, 0.05, 0.0, 0.0);
        build(&mut buf);
        let mut view = CostmapView::empty();
        view.refresh(&buf, &Pose::new(5.0, 5.0, 0.0), 200);
        view
    }

    fn straight_path(from: Pose, len: f64) -> Path {
        let n = (len / 0.1) as usize;
        let poses = (0..=n)
            .map(|i| Pose::new(from.x + i as f64 * 0.1, from.y, 0.0))
            .collect();
        Path::from_fix(poses, 0.5)
    }

    fn controller() -> LocalController {
        LocalController::new(ControllerParams::default())
    }

    fn checker() -> FootprintChecker {
        FootprintChecker::new(FootprintParams::default())
    }

    #[test]
    fn drives_forward_on_a_straight_path() {
        let view = view_of(|_| {});
        let mut c = controller();
        let pose = Pose::new(5.0, 5.0, 0.0);
        let path = straight_path(pose, 3.0);
        let cmd = c
            .compute_velocity(&pose, &Twist::ZERO, &path, &view, &checker())
            .unwrap();
        assert!(cmd.vx > 0.0);
        assert!(cmd.wz.abs() < 0.2);
    }

    #[test]
    fn all_candidates_blocked_is_an_error() {
        let view = view_of(|buf| {
            // lethal wall immediately ahead, inside every simulated arc
            buf.stamp_rect(5.2, 3.0, 5.4, 7.0, 254);
        });
        let mut c = controller();
        let pose = Pose::new(5.0, 5.0, 0.0);
        let path = straight_path(pose, 3.0);
        let r = c.compute_velocity(&pose, &Twist { vx: 0.4, vy: 0.0, wz: 0.0 }, &path, &view, &checker());
        assert_eq!(r, Err(ControlError::NoValidCommand));
    }

    #[test]
    fn latches_near_goal_and_rotates_to_goal_yaw() {
        let view = view_of(|_| {});
        let mut c = controller();
        let path = Path::from_fix(
            vec![Pose::new(5.0, 5.0, 0.0), Pose::new(5.3, 5.0, 1.2)],
            0.5,
        );
        // at the last point but 1.2 rad off in yaw, already stopped
        let pose = Pose::new(5.3, 5.0, 0.0);
        let cmd = c
            .compute_velocity(&pose, &Twist::ZERO, &path, &view, &checker())
            .unwrap();
        assert_eq!(cmd.vx, 0.0);
        assert!(cmd.wz > 0.0);
        assert!(!c.goal_reached());

        // aligned: reached, zero command
        let aligned = Pose::new(5.3, 5.0, 1.15);
        let cmd = c
            .compute_velocity(&aligned, &Twist::ZERO, &path, &view, &checker())
            .unwrap();
        assert_eq!(cmd, Twist::ZERO);
        assert!(c.goal_reached());
    }

    #[test]
    fn moving_robot_decelerates_before_goal_rotation() {
        let view = view_of(|_| {});
        let mut c = controller();
        let path = Path::from_fix(
            vec![Pose::new(5.0, 5.0, 0.0), Pose::new(5.3, 5.0, 1.2)],
            0.5,
        );
        let pose = Pose::new(5.3, 5.0, 0.0);
        let vel = Twist { vx: 0.4, vy: 0.0, wz: 0.0 };
        let cmd = c.compute_velocity(&pose, &vel, &path, &view, &checker()).unwrap();
        assert!(cmd.vx < 0.4 && cmd.vx >= 0.0);
        assert_eq!(cmd.wz, 0.0);
    }

    #[test]
    fn corner_point_rotates_in_place_first() {
        let view = view_of(|_| {});
        let mut c = controller();
        // L-shaped path turning left at (5.5, 5)
        let mut poses: Vec<Pose> = (0..=5).map(|i| Pose::new(5.0 + i as f64 * 0.1, 5.0, 0.0)).collect();
        poses.extend((1..=8).map(|i| Pose::new(5.5, 5.0 + i as f64 * 0.1, std::f64::consts::FRAC_PI_2)));
        let path = Path::from_fix(poses, 0.5);
        // standing at the apex, still facing +x
        let pose = Pose::new(5.5, 5.0, 0.0);
        let cmd = c
            .compute_velocity(&pose, &Twist::ZERO, &path, &view, &checker())
            .unwrap();
        assert_eq!(cmd.vx, 0.0);
        assert!(cmd.wz > 0.0, "should rotate toward the corner exit");
    }

    #[test]
    fn stop_with_acc_limits_ramps_down() {
        let view = view_of(|_| {});
        let c = controller();
        let vel = Twist { vx: 0.5, vy: 0.0, wz: 0.2 };
        let cmd = c.stop_with_acc_limits(&Pose::new(5.0, 5.0, 0.0), &vel, &view, &checker());
        assert!((cmd.vx - 0.45).abs() < 1e-9);
        assert!((cmd.wz - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rotation_direction_is_sticky_until_target_moves() {
        let view = view_of(|_| {});
        let mut c = controller();
        let path = Path::from_fix(
            vec![Pose::new(5.0, 5.0, 0.0), Pose::new(5.3, 5.0, 3.0)],
            0.5,
        );
        let pose = Pose::new(5.3, 5.0, 0.0);
        let first = c
            .compute_velocity(&pose, &Twist::ZERO, &path, &view, &checker())
            .unwrap();
        // near π the shorter way is counter-clockwise; once chosen, a slight
        // overshoot of the target must not flip the direction
        assert!(first.wz > 0.0);
        let overshot = Pose::new(5.3, 5.0, 3.12);
        let again = c
            .compute_velocity(&overshot, &Twist { vx: 0.0, vy: 0.0, wz: first.wz }, &path, &view, &checker())
            .unwrap();
        assert!(again.wz > 0.0, "direction memory flipped: {}", again.wz);
    }
}
