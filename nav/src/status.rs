use gridnav_lattice::Pose;

/// Status codes surfaced to the task layer over the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavStatus {
    GoalPlanning,
    GoalHeading,
    GoalReached,
    GoalUnreached,
    GoalUnreachable,
    PathNotSafe,
    GoalNotSafe,
    LocationInvalid,
}

/// A velocity command: linear x/y in m/s, angular z in rad/s.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Twist {
    pub vx: f64,
    pub vy: f64,
    pub wz: f64,
}

impl Twist {
    pub const ZERO: Twist = Twist {
        vx: 0.0,
        vy: 0.0,
        wz: 0.0,
    };

    pub fn is_stopped(&self) -> bool {
        self.vx.abs() < 1e-3 && self.vy.abs() < 1e-3 && self.wz.abs() < 1e-3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalKind {
    Normal,
    Origin,
    /// Docking goal: the effective target backs off along the goal heading and
    /// tolerances tighten.
    Charging,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Goal {
    pub pose: Pose,
    pub kind: GoalKind,
}

impl Goal {
    pub fn normal(pose: Pose) -> Goal {
        Goal {
            pose,
            kind: GoalKind::Normal,
        }
    }

    /// The pose the planner actually aims at. Charging goals are shifted back
    /// by the inscribed radius along the goal heading so the dock itself stays
    /// outside the footprint.
    pub fn effective_pose(&self, inscribed_radius: f64) -> Pose {
        match self.kind {
            GoalKind::Charging => Pose::new(
                self.pose.x - inscribed_radius * self.pose.th.cos(),
                self.pose.y - inscribed_radius * self.pose.th.sin(),
                self.pose.th,
            ),
            _ => self.pose,
        }
    }

    /// (xy, yaw) tolerance override for this goal kind, if any.
    pub fn tolerance_override(&self) -> Option<(f64, f64)> {
        match self.kind {
            GoalKind::Charging => Some((0.05, 0.05)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charging_goal_backs_off_along_heading() {
        let g = Goal {
            pose: Pose::new(2.0, 1.0, 0.0),
            kind: GoalKind::Charging,
        };
        let e = g.effective_pose(0.3);
        assert!((e.x - 1.7).abs() < 1e-9);
        assert!((e.y - 1.0).abs() < 1e-9);
        assert_eq!(g.tolerance_override(), Some((0.05, 0.05)));
        assert_eq!(Goal::normal(g.pose).tolerance_override(), None);
    }
}
