use crate::config::{NavConfig, SupervisorParams};
use crate::footprint::LatticeCollisionModel;
use crate::io::NavIo;
use crate::path::Path;
use crate::status::{Goal, NavStatus};
use crossbeam_channel::Sender;
use gridnav_lattice::costmap::SharedCostmap;
use gridnav_lattice::environment::Environment;
use gridnav_lattice::search::{AnytimePlanner, PlanError};
use gridnav_lattice::{normalize_angle, Pose};
use pathfinding::prelude::astar;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How the supervisor wants the next planning result spliced into the
/// installed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningState {
    InsertingNone,
    InsertingBegin,
    InsertingEnd,
    InsertingMiddle,
    InsertingSbpl,
}

/// The shared planning state: everything the supervisor and the worker
/// exchange lives here, guarded by the single mutex of [`PlanCell`].
pub struct PlanInput {
    /// Wake signal: a planning cycle is wanted.
    pub run_planner: bool,
    /// Global run/cancel flag for the active goal.
    pub run_flag: bool,
    /// Worker shutdown flag, only set when the owning runtime stops.
    pub exit: bool,
    pub goal: Option<Goal>,
    /// The worker is aiming at the global goal (not an intermediate one).
    pub taken_global_goal: bool,
    pub planning_state: PlanningState,
    /// Splice bounds for [`PlanningState::InsertingMiddle`].
    pub middle_segment: Option<(Pose, Pose)>,
    /// Queue-of-one handshake: set by the worker after writing `path`.
    pub new_global_plan: bool,
    /// The installed path buffer.
    pub path: Path,
    /// Staging slot for a candidate front path the supervisor may switch to.
    pub switch_path: Option<Path>,
    pub consecutive_failures: u32,
}

impl Default for PlanInput {
    fn default() -> Self {
        PlanInput {
            run_planner: false,
            run_flag: false,
            exit: false,
            goal: None,
            taken_global_goal: true,
            planning_state: PlanningState::InsertingNone,
            middle_segment: None,
            new_global_plan: false,
            path: Path::new(),
            switch_path: None,
            consecutive_failures: 0,
        }
    }
}

/// The one mutex + condition variable pair coordinating the two threads.
pub struct PlanCell {
    pub state: Mutex<PlanInput>,
    pub cv: Condvar,
}

impl Default for PlanCell {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanCell {
    pub fn new() -> PlanCell {
        PlanCell {
            state: Mutex::new(PlanInput::default()),
            cv: Condvar::new(),
        }
    }

    /// Requests one planning cycle.
    pub fn wake(&self) {
        let mut st = self.state.lock().unwrap();
        st.run_planner = true;
        drop(st);
        self.cv.notify_all();
    }

    /// Cancels the active goal.
    pub fn cancel(&self) {
        let mut st = self.state.lock().unwrap();
        st.run_flag = false;
        drop(st);
        self.cv.notify_all();
    }

    /// Asks the worker thread to exit.
    pub fn shutdown(&self) {
        let mut st = self.state.lock().unwrap();
        st.exit = true;
        drop(st);
        self.cv.notify_all();
    }

    /// Stages a candidate path the supervisor may switch to when it proves
    /// shorter and safe.
    pub fn offer_switch_path(&self, path: Path) {
        let mut st = self.state.lock().unwrap();
        st.switch_path = Some(path);
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("robot pose unavailable")]
    NoPose,
    #[error("costmap is stale")]
    StaleCostmap,
    #[error("coarse grid search found no route")]
    NoCoarseRoute,
    #[error(transparent)]
    Plan(#[from] PlanError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Direct,
    Bezier,
    Lattice,
    Coarse,
}

/// The background global-planning thread.
///
/// Sleeps on the plan cell's condition variable; each wake snapshots the goal,
/// runs one planning cycle and hands the result back through the path buffer
/// with `new_global_plan` raised. It never publishes velocities.
pub struct PlannerWorker {
    cell: Arc<PlanCell>,
    costmap: SharedCostmap,
    io: NavIo,
    status_tx: Sender<NavStatus>,
    env: Environment,
    search: AnytimePlanner,
    params: SupervisorParams,
    max_vel: f64,
    last_using_bezier: bool,
}

impl PlannerWorker {
    pub fn new(
        cfg: &NavConfig,
        costmap: SharedCostmap,
        io: NavIo,
        cell: Arc<PlanCell>,
        status_tx: Sender<NavStatus>,
    ) -> PlannerWorker {
        let collision =
            LatticeCollisionModel::new(cfg.footprint.clone(), cfg.supervisor.sbpl_footprint_padding);
        PlannerWorker {
            cell,
            costmap,
            io,
            status_tx,
            env: Environment::new(cfg.lattice.clone(), Box::new(collision)),
            search: AnytimePlanner::new(cfg.search.clone()),
            params: cfg.supervisor.clone(),
            max_vel: cfg.controller.max_vel_x,
            last_using_bezier: false,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("gridnav-planner".into())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        tracing::debug!("planner worker up");
        'main: loop {
            let (goal, planning_state) = {
                let mut st = self.cell.state.lock().unwrap();
                loop {
                    if st.exit {
                        tracing::debug!("planner worker exiting");
                        return;
                    }
                    if st.run_planner {
                        break;
                    }
                    st = self.cell.cv.wait(st).unwrap();
                }
                st.run_planner = false;
                if !st.run_flag {
                    continue 'main;
                }
                let Some(goal) = st.goal else { continue 'main };
                (goal, st.planning_state)
            };

            let t_start = Instant::now();
            match self.plan_cycle(&goal, planning_state) {
                Ok(path) => {
                    let mut st = self.cell.state.lock().unwrap();
                    if st.run_flag {
                        match planning_state {
                            PlanningState::InsertingNone | PlanningState::InsertingSbpl => {
                                st.path = path;
                            }
                            PlanningState::InsertingBegin => st.path.insert_begin(path),
                            PlanningState::InsertingEnd => st.path.insert_end(path),
                            PlanningState::InsertingMiddle => match st.middle_segment.take() {
                                Some((a, b)) => st.path.insert_middle(path, &a, &b),
                                None => st.path = path,
                            },
                        }
                        st.planning_state = PlanningState::InsertingNone;
                        st.new_global_plan = true;
                        st.consecutive_failures = 0;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "planning cycle failed");
                    let mut st = self.cell.state.lock().unwrap();
                    st.consecutive_failures += 1;
                    if st.consecutive_failures > 4 && st.path.is_empty() {
                        // nothing ever planned for this goal: give up on it
                        st.run_flag = false;
                        let _ = self.status_tx.send(NavStatus::GoalUnreachable);
                    }
                }
            }

            // rate-limit to the planner frequency, but stay responsive to wakes
            let period = Duration::from_secs_f64(1.0 / self.params.planner_frequency.max(0.1));
            let elapsed = t_start.elapsed();
            if elapsed < period {
                let st = self.cell.state.lock().unwrap();
                if !st.run_planner && !st.exit {
                    let _ = self.cell.cv.wait_timeout(st, period - elapsed).unwrap();
                }
            }
        }
    }

    /// One planning cycle: refresh the window, pick the planner variant by
    /// goal distance, produce a path.
    fn plan_cycle(&mut self, goal: &Goal, _planning_state: PlanningState) -> Result<Path, WorkerError> {
        let pose = self.io.pose.current_pose().ok_or(WorkerError::NoPose)?;
        {
            let buf = self.costmap.read().unwrap();
            if buf.is_stale() {
                return Err(WorkerError::StaleCostmap);
            }
            let changed = self.env.refresh_view(&buf, &pose);
            drop(buf);
            self.search.costs_changed(&mut self.env, &changed);
        }

        let target = goal.pose;
        let d = pose.distance(&target);
        let selection = if d <= 0.25 {
            Selection::Direct
        } else if d <= 2.0 && !self.last_using_bezier {
            Selection::Bezier
        } else if d <= self.params.sbpl_max_distance {
            Selection::Lattice
        } else {
            Selection::Coarse
        };

        let budget = self.search.params().allocated_time;
        let path = match selection {
            Selection::Direct => {
                let heading = (target.y - pose.y).atan2(target.x - pose.x);
                Ok(Path::from_fix(
                    vec![Pose::new(pose.x, pose.y, heading), target],
                    self.max_vel,
                ))
            }
            Selection::Bezier => match self.io.bezier.curve(&pose, &target) {
                Some(pts) => {
                    self.last_using_bezier = true;
                    Ok(Path::from_bezier(pts, self.max_vel))
                }
                None => {
                    // declined curve clears the latch and falls back to the lattice
                    self.last_using_bezier = false;
                    self.search
                        .plan(&mut self.env, &pose, &target, budget)
                        .map(|lp| Path::from_short_lattice(&lp, self.max_vel))
                        .map_err(WorkerError::from)
                }
            },
            Selection::Lattice => self
                .search
                .plan(&mut self.env, &pose, &target, budget)
                .map(|lp| Path::from_lattice(&lp, self.max_vel))
                .map_err(WorkerError::from),
            Selection::Coarse => self.coarse_plan(&pose, &target),
        };
        if selection != Selection::Bezier {
            self.last_using_bezier = false;
        }

        let path = path?;
        tracing::debug!(
            distance = d,
            points = path.len(),
            ?selection,
            "planning cycle done"
        );
        Ok(path)
    }

    /// Far goals: a coarse 2-D A* over the window, sampled into a fix path,
    /// with an optional lattice repair of the head section.
    fn coarse_plan(&mut self, pose: &Pose, target: &Pose) -> Result<Path, WorkerError> {
        let view = &self.env.view;
        let start = view.world_to_cell(pose.x, pose.y);
        let goal_c = view.world_to_cell(target.x, target.y);
        let inscribed = view.thresholds.inscribed;

        let route = astar(
            &start,
            |&(x, y)| {
                let mut out: Vec<((i32, i32), u32)> = Vec::with_capacity(8);
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let n = (x + dx, y + dy);
                        let Some(c) = view.cost(n.0, n.1) else { continue };
                        if c >= inscribed {
                            continue;
                        }
                        let base = if dx != 0 && dy != 0 { 14 } else { 10 };
                        out.push((n, base * c.max(1) as u32));
                    }
                }
                out
            },
            |&(x, y)| {
                let dx = (x - goal_c.0).abs() as u32;
                let dy = (y - goal_c.1).abs() as u32;
                10 * (dx + dy) - 6 * dx.min(dy)
            },
            |&c| c == goal_c,
        )
        .ok_or(WorkerError::NoCoarseRoute)?;

        // sample the cell route down to waypoints; a sample is emitted every
        // `init_path_sample_dis` meters or when the heading swings by more
        // than `init_path_sample_yaw`
        let mut kept: Vec<(f64, f64)> = vec![(pose.x, pose.y)];
        let mut acc = 0.0;
        let mut last = (pose.x, pose.y);
        let mut kept_heading: Option<f64> = None;
        for &(cx, cy) in &route.0 {
            let w = view.cell_to_world(cx, cy);
            let step = (w.0 - last.0).hypot(w.1 - last.1);
            if step < 1e-9 {
                continue;
            }
            let heading = (w.1 - last.1).atan2(w.0 - last.0);
            acc += step;
            last = w;
            let turned = kept_heading
                .map_or(false, |h| normalize_angle(heading - h).abs() > self.params.init_path_sample_yaw);
            if acc >= self.params.init_path_sample_dis || turned {
                kept.push(w);
                kept_heading = Some(heading);
                acc = 0.0;
            }
        }
        kept.push((target.x, target.y));

        let mut poses: Vec<Pose> = Vec::with_capacity(kept.len());
        for i in 0..kept.len() {
            let th = if i + 1 < kept.len() {
                (kept[i + 1].1 - kept[i].1).atan2(kept[i + 1].0 - kept[i].0)
            } else {
                target.th
            };
            poses.push(Pose::new(kept[i].0, kept[i].1, th));
        }
        let mut path = Path::from_fix(poses, self.max_vel);

        if self.params.use_farther_planner {
            // replace the head with a kinematically feasible lattice section
            let join = path
                .points()
                .iter()
                .find(|p| p.pose.distance(pose) >= 2.0)
                .map(|p| p.pose);
            if let Some(join) = join {
                let budget = self.search.params().allocated_time;
                match self.search.plan(&mut self.env, pose, &join, budget) {
                    Ok(lp) => {
                        let head = Path::from_lattice(&lp, self.max_vel);
                        path.erase_to_point(&join);
                        path.insert_begin(head);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "head repair declined, keeping coarse path");
                    }
                }
            }
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{AlwaysLocalized, NoBezier, NoRotateHardware, QuietProtector};
    use crate::status::GoalKind;
    use crate::Twist;
    use gridnav_lattice::costmap::CostmapBuffer;

    struct FixedPose(Pose);

    impl crate::io::PoseSource for FixedPose {
        fn current_pose(&self) -> Option<Pose> {
            Some(self.0)
        }

        fn current_velocity(&self) -> Twist {
            Twist::ZERO
        }
    }

    fn io_at(pose: Pose) -> NavIo {
        NavIo {
            pose: Arc::new(FixedPose(pose)),
            localization: Arc::new(AlwaysLocalized),
            protector: Arc::new(QuietProtector),
            rotate: Arc::new(NoRotateHardware),
            bezier: Arc::new(NoBezier),
        }
    }

    fn worker_at(pose: Pose) -> (PlannerWorker, crossbeam_channel::Receiver<NavStatus>) {
        let mut cfg = NavConfig::default();
        cfg.lattice.map_size = 160;
        let buf = CostmapBuffer::new(160, 160, 0.05, 0.0, 0.0);
        let costmap = buf.shared();
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = PlannerWorker::new(
            &cfg,
            costmap,
            io_at(pose),
            Arc::new(PlanCell::new()),
            tx,
        );
        (worker, rx)
    }

    #[test]
    fn short_goal_gets_a_two_point_path() {
        let pose = Pose::new(3.0, 3.0, 0.0);
        let (mut w, _rx) = worker_at(pose);
        let goal = Goal {
            pose: Pose::new(3.2, 3.0, 0.0),
            kind: GoalKind::Normal,
        };
        let path = w.plan_cycle(&goal, PlanningState::InsertingNone).unwrap();
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn medium_goal_uses_the_lattice_when_bezier_declines() {
        let pose = Pose::new(3.0, 3.0, 0.0);
        let (mut w, _rx) = worker_at(pose);
        let goal = Goal {
            pose: Pose::new(4.5, 3.0, 0.0),
            kind: GoalKind::Normal,
        };
        let path = w.plan_cycle(&goal, PlanningState::InsertingNone).unwrap();
        assert_eq!(path.source(), crate::path::PathSource::ShortLattice);
        assert!(!w.last_using_bezier);
        assert!(path.length() > 1.0);
    }

    #[test]
    fn far_goal_takes_the_coarse_planner() {
        let pose = Pose::new(0.5, 0.5, 0.0);
        let (mut w, _rx) = worker_at(pose);
        w.params.sbpl_max_distance = 3.0;
        let goal = Goal {
            pose: Pose::new(7.0, 7.0, 0.0),
            kind: GoalKind::Normal,
        };
        let path = w.plan_cycle(&goal, PlanningState::InsertingNone).unwrap();
        assert!(path.length() > 8.0);
        let last = path.last().unwrap().pose;
        assert!(last.distance(&goal.pose) < 0.1);
    }
}
