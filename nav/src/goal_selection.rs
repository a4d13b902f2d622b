use crate::config::SupervisorParams;
use crate::footprint::FootprintChecker;
use crate::path::Path;
use gridnav_lattice::costmap::{CostmapBuffer, Layer};
use gridnav_lattice::Pose;

/// Picks a safe replanning target on the installed path.
///
/// Scans forward from `begin_index` over at most four rounds with a shrinking
/// standoff distance, accepting the first point that is footprint-safe, has
/// clear neighbors within the (ahead, behind) clearance window, and stands far
/// enough from the robot. Falls back to the global goal when the scan comes up
/// empty and the goal itself is safe.
pub fn get_astar_goal(
    path: &Path,
    checker: &FootprintChecker,
    buf: &CostmapBuffer,
    cur: &Pose,
    params: &SupervisorParams,
    extend_x: f64,
    extend_y: f64,
    begin_index: usize,
) -> Option<(usize, Pose)> {
    if path.is_empty() {
        return None;
    }
    let mut dis_a = params.goal_safe_dis_a;
    for round in 0..4 {
        for (i, pt) in path.points().iter().enumerate().skip(begin_index) {
            if pt.pose.distance(cur) <= dis_a {
                continue;
            }
            if checker
                .circle_cost_extended(buf, Layer::Live, &pt.pose, extend_x, extend_y)
                .is_none()
            {
                continue;
            }
            if !clearance_free(path, checker, buf, i, dis_a, params.goal_safe_dis_b, extend_x, extend_y) {
                continue;
            }
            tracing::debug!(index = i, round, "safe replanning goal selected");
            return Some((i, pt.pose));
        }
        dis_a *= 0.7;
    }

    let last = path.len() - 1;
    let goal = path.last().expect("non-empty").pose;
    if checker
        .circle_cost_extended(buf, Layer::Live, &goal, extend_x, extend_y)
        .is_some()
    {
        return Some((last, goal));
    }
    None
}

/// True when every path point within `ahead` meters after and `behind` meters
/// before index `i` passes the circle-center check.
fn clearance_free(
    path: &Path,
    checker: &FootprintChecker,
    buf: &CostmapBuffer,
    i: usize,
    ahead: f64,
    behind: f64,
    extend_x: f64,
    extend_y: f64,
) -> bool {
    let pts = path.points();
    let mut acc = 0.0;
    for j in i..pts.len() - 1 {
        if checker
            .circle_cost_extended(buf, Layer::Live, &pts[j].pose, extend_x, extend_y)
            .is_none()
        {
            return false;
        }
        acc += pts[j].pose.distance(&pts[j + 1].pose);
        if acc >= ahead {
            break;
        }
    }
    let mut acc = 0.0;
    for j in (0..i).rev() {
        if checker
            .circle_cost_extended(buf, Layer::Live, &pts[j].pose, extend_x, extend_y)
            .is_none()
        {
            return false;
        }
        acc += pts[j].pose.distance(&pts[j + 1].pose);
        if acc >= behind {
            break;
        }
    }
    true
}
