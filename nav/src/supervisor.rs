use crate::config::NavConfig;
use crate::controller::LocalController;
use crate::footprint::FootprintChecker;
use crate::goal_selection::get_astar_goal;
use crate::io::NavIo;
use crate::path::Path;
use crate::status::{Goal, NavStatus, Twist};
use crate::worker::{PlanCell, PlannerWorker, PlanningState};
use crossbeam_channel::{Receiver, Sender};
use gridnav_lattice::costmap::{CostmapView, Layer, SharedCostmap};
use gridnav_lattice::{normalize_angle, Pose};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
    Planning,
    Controlling,
    Clearing,
}

/// What sent the machine into FIX_CLEARING; selects the recovery behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    Location,
    Backward,
    LocalPlanner,
    GlobalPlanner,
    GetNewGoal,
    Oscillation,
}

// escalation caps of the recovery hierarchy
const MAX_CONTROLLER_TIMEOUTS: u32 = 10;
const CLEAR_FOOTPRINT_TIMEOUTS: u32 = 5;
const CLEAR_FOOTPRINT_PLANNER_ERRORS: u32 = 7;
const MAX_PLANNER_TIMEOUTS: u32 = 12;
const MAX_RECOVERY_ATTEMPTS: u32 = 8;
const MAX_LOCATION_ROTATIONS: u32 = 3;
const CONTROLLER_FAILURE_LIMIT: u32 = 3;
const FRONT_SLOW_TICK_LIMIT: u32 = 10;
/// Velocity of software-commanded backward maneuvers.
const BACKWARD_VEL: f64 = 0.1;

/// The navigation supervisor: a single-threaded state machine clocked at the
/// controller frequency. Sole publisher of velocity commands.
pub struct Supervisor {
    cfg: NavConfig,
    cell: Arc<PlanCell>,
    costmap: SharedCostmap,
    io: NavIo,
    controller: LocalController,
    checker: FootprintChecker,
    vel_tx: Sender<Twist>,
    status_tx: Sender<NavStatus>,

    state: NavState,
    trigger: RecoveryTrigger,
    view: CostmapView,

    global_goal: Pose,
    xy_tolerance: f64,
    yaw_tolerance: f64,

    pose: Pose,
    last_vel: Twist,
    planning_started: Instant,
    oscillation_reset: Instant,
    oscillation_pose: Pose,
    last_valid_control: Instant,
    first_tick_after_plan: bool,

    controller_failures: u32,
    controller_timeouts: u32,
    planner_timeouts: u32,
    recovery_attempts: u32,
    location_rotations: u32,
    location_rotate_started: Option<Instant>,
    front_slow_ticks: u32,
    stop_started: Option<Instant>,
    stop_clear_checks: u32,
    goal_check_started: Option<Instant>,

    done: bool,
    result: Option<NavStatus>,
}

impl Supervisor {
    pub fn new(
        cfg: NavConfig,
        costmap: SharedCostmap,
        io: NavIo,
        cell: Arc<PlanCell>,
        vel_tx: Sender<Twist>,
        status_tx: Sender<NavStatus>,
    ) -> Supervisor {
        let now = Instant::now();
        Supervisor {
            controller: LocalController::new(cfg.controller.clone()),
            checker: FootprintChecker::new(cfg.footprint.clone()),
            xy_tolerance: cfg.controller.xy_goal_tolerance,
            yaw_tolerance: cfg.controller.yaw_goal_tolerance,
            cfg,
            cell,
            costmap,
            io,
            vel_tx,
            status_tx,
            state: NavState::Planning,
            trigger: RecoveryTrigger::GetNewGoal,
            view: CostmapView::empty(),
            global_goal: Pose::new(0.0, 0.0, 0.0),
            pose: Pose::new(0.0, 0.0, 0.0),
            last_vel: Twist::ZERO,
            planning_started: now,
            oscillation_reset: now,
            oscillation_pose: Pose::new(0.0, 0.0, 0.0),
            last_valid_control: now,
            first_tick_after_plan: true,
            controller_failures: 0,
            controller_timeouts: 0,
            planner_timeouts: 0,
            recovery_attempts: 0,
            location_rotations: 0,
            location_rotate_started: None,
            front_slow_ticks: 0,
            stop_started: None,
            stop_clear_checks: 0,
            goal_check_started: None,
            done: false,
            result: None,
        }
    }

    pub fn state(&self) -> NavState {
        self.state
    }

    pub fn result(&self) -> Option<NavStatus> {
        self.result
    }

    /// The pose the robot terminated at, once a goal has been reached.
    pub fn reached_pose(&self) -> Option<Pose> {
        (self.result == Some(NavStatus::GoalReached)).then_some(self.pose)
    }

    pub fn cell(&self) -> Arc<PlanCell> {
        self.cell.clone()
    }

    /// Accepts a goal and starts planning toward it. Returns false when the
    /// goal is rejected outright (target footprint already in collision).
    pub fn set_goal(&mut self, goal: Goal) -> bool {
        let target = goal.effective_pose(self.cfg.footprint.inscribed_radius);
        let (xy, yaw) = goal
            .tolerance_override()
            .unwrap_or((self.cfg.controller.xy_goal_tolerance, self.cfg.controller.yaw_goal_tolerance));
        self.xy_tolerance = xy;
        self.yaw_tolerance = yaw;
        self.global_goal = target;

        // unreachability screen before any planning is spent on it
        let blocked = {
            let buf = self.costmap.read().unwrap();
            self.checker.footprint_cost(&buf, Layer::Live, &target, 0.0).is_none()
        };
        if blocked {
            tracing::warn!(x = target.x, y = target.y, "goal footprint in collision, rejecting");
            self.emit(NavStatus::GoalUnreachable);
            self.done = true;
            self.result = Some(NavStatus::GoalUnreachable);
            return false;
        }

        {
            let mut st = self.cell.state.lock().unwrap();
            st.run_flag = true;
            st.exit = false;
            st.goal = Some(Goal {
                pose: target,
                kind: goal.kind,
            });
            st.taken_global_goal = true;
            st.planning_state = PlanningState::InsertingNone;
            st.middle_segment = None;
            st.new_global_plan = false;
            st.path = Path::new();
            st.switch_path = None;
            st.consecutive_failures = 0;
        }
        self.cell.wake();

        let now = Instant::now();
        self.state = NavState::Planning;
        self.planning_started = now;
        self.oscillation_reset = now;
        self.last_valid_control = now;
        self.controller.reset();
        self.controller_failures = 0;
        self.controller_timeouts = 0;
        self.planner_timeouts = 0;
        self.recovery_attempts = 0;
        self.location_rotations = 0;
        self.front_slow_ticks = 0;
        self.stop_started = None;
        self.goal_check_started = None;
        self.done = false;
        self.result = None;
        self.emit(NavStatus::GoalPlanning);
        true
    }

    /// Runs the machine until the goal terminates or is cancelled.
    pub fn run(&mut self) {
        let period = Duration::from_secs_f64(1.0 / self.cfg.supervisor.controller_frequency.max(0.1));
        loop {
            let t = Instant::now();
            if !self.step() {
                break;
            }
            let elapsed = t.elapsed();
            if elapsed < period {
                std::thread::sleep(period - elapsed);
            }
        }
    }

    /// One supervisor tick. Returns false once the goal has terminated.
    pub fn step(&mut self) -> bool {
        if self.done {
            return false;
        }
        let cancelled = {
            let st = self.cell.state.lock().unwrap();
            !st.run_flag
        };
        if cancelled {
            // external cancel, or the worker gave up with no initial plan
            self.publish(Twist::ZERO);
            self.done = true;
            return false;
        }
        match self.state {
            NavState::Planning => self.tick_planning(),
            NavState::Controlling => self.tick_controlling(),
            NavState::Clearing => self.tick_clearing(),
        }
        !self.done
    }

    fn tick_planning(&mut self) {
        if self.absorb_new_plan() {
            self.state = NavState::Controlling;
            self.emit(NavStatus::GoalHeading);
            return;
        }
        self.publish(Twist::ZERO);
        if self.planning_started.elapsed() > self.cfg.supervisor.planner_patience {
            self.planner_timeouts += 1;
            tracing::warn!(timeouts = self.planner_timeouts, "planner patience exceeded");
            self.trigger = RecoveryTrigger::GlobalPlanner;
            self.state = NavState::Clearing;
            return;
        }
        self.cell.wake();
    }

    fn tick_controlling(&mut self) {
        let p = self.cfg.supervisor.clone();

        // 1. refresh pose, feed the oscillation watchdog
        let Some(pose) = self.io.pose.current_pose() else {
            self.publish(Twist::ZERO);
            return;
        };
        self.pose = pose;
        if pose.distance(&self.oscillation_pose) >= p.oscillation_distance {
            self.oscillation_pose = pose;
            self.oscillation_reset = Instant::now();
        }

        // 2. stale costmap: hold position this tick
        {
            let buf = self.costmap.read().unwrap();
            if buf.is_stale() {
                drop(buf);
                self.publish(Twist::ZERO);
                return;
            }
            self.view.refresh(&buf, &pose, self.cfg.lattice.map_size);
        }

        // 3. absorb a freshly delivered plan
        self.absorb_new_plan();

        // 4. localization health
        if !self.io.localization.valid() {
            self.publish(Twist::ZERO);
            self.trigger = RecoveryTrigger::Location;
            self.state = NavState::Clearing;
            return;
        }

        // 5. terminal goal check
        if pose.distance(&self.global_goal) <= self.xy_tolerance
            && normalize_angle(pose.th - self.global_goal.th).abs() <= self.yaw_tolerance
        {
            self.finish(NavStatus::GoalReached);
            return;
        }

        // 6. a stashed front path may be worth switching to
        self.maybe_switch_front_path(&pose);

        // 7. prune behind the robot (not on the tick a plan was installed)
        if self.first_tick_after_plan {
            self.first_tick_after_plan = false;
        } else {
            let pruned = {
                let mut st = self.cell.state.lock().unwrap();
                st.path.prune(&pose, p.max_offroad_dis, p.max_offroad_yaw, true)
            };
            if let Err(e) = pruned {
                tracing::warn!(error = %e, "robot left the installed path");
                self.publish(Twist::ZERO);
                self.emit(NavStatus::PathNotSafe);
                self.trigger = RecoveryTrigger::GetNewGoal;
                self.state = NavState::Clearing;
                return;
            }
        }

        // 8. oscillation watchdog
        if self.oscillation_reset.elapsed() > p.oscillation_timeout {
            self.publish(Twist::ZERO);
            self.trigger = RecoveryTrigger::Oscillation;
            self.state = NavState::Clearing;
            return;
        }

        // 9. protector bus
        let mask = self.io.protector.status();
        if p.front_protector_list.iter().any(|b| mask & (1 << b) != 0) {
            tracing::warn!(mask, "front protector tripped");
            self.publish(Twist::ZERO);
            self.backward_maneuver();
            self.replan_from_scratch();
            return;
        }

        // 10. front-clearance scan along the installed path
        let clear = self.front_clear_distance();
        let mut ratio = 1.0;
        if clear < p.front_safe_check_dis {
            if clear < 0.35 && pose.distance(&self.global_goal) <= p.goal_safe_check_dis + 0.35 {
                // blocked right at the goal: wait it out, then give up
                self.publish_decel();
                match self.goal_check_started {
                    None => self.goal_check_started = Some(Instant::now()),
                    Some(t) if t.elapsed() > p.goal_safe_check_duration => {
                        self.emit(NavStatus::GoalNotSafe);
                        self.finish(NavStatus::GoalUnreached);
                    }
                    Some(_) => {}
                }
                return;
            }
            self.goal_check_started = None;

            if clear <= 0.6 {
                self.publish_decel();
                self.stop_clear_checks = 0;
                match self.stop_started {
                    None => {
                        self.emit(NavStatus::PathNotSafe);
                        self.stop_started = Some(Instant::now());
                    }
                    Some(t) if t.elapsed() > p.stop_duration => {
                        self.stop_started = None;
                        self.request_middle_replan(&pose);
                    }
                    Some(_) => {}
                }
                return;
            }
            if clear <= 1.0 {
                ratio = 0.5;
            } else if clear <= 1.7 {
                ratio = 0.7;
                self.front_slow_ticks += 1;
                if self.front_slow_ticks >= FRONT_SLOW_TICK_LIMIT && clear < 1.5 {
                    self.front_slow_ticks = 0;
                    self.request_middle_replan(&pose);
                }
            } else {
                self.front_slow_ticks = 0;
            }
        } else {
            self.front_slow_ticks = 0;
            self.goal_check_started = None;
        }
        // a stop wait clears after two consecutive safe scans
        if self.stop_started.is_some() {
            if clear > 0.6 {
                self.stop_clear_checks += 1;
                if self.stop_clear_checks >= 2 {
                    self.stop_started = None;
                } else {
                    self.publish(Twist::ZERO);
                    return;
                }
            } else {
                self.publish(Twist::ZERO);
                return;
            }
        }

        // 11-12. local controller and command publication
        self.controller.cmd_vel_ratio = ratio;
        let path = {
            let st = self.cell.state.lock().unwrap();
            st.path.clone()
        };
        let vel = self.last_vel;
        match self
            .controller
            .compute_velocity(&pose, &vel, &path, &self.view, &self.checker)
        {
            Ok(cmd) => {
                self.publish(cmd);
                self.last_valid_control = Instant::now();
                self.controller_failures = 0;
                if self.controller.goal_reached() {
                    self.finish(NavStatus::GoalReached);
                } else {
                    self.emit(NavStatus::GoalHeading);
                }
            }
            Err(e) => {
                self.controller_failures += 1;
                tracing::debug!(error = %e, failures = self.controller_failures, "no valid command");
                self.publish_decel();
                if self.controller_failures > CONTROLLER_FAILURE_LIMIT
                    && self.last_valid_control.elapsed() > p.controller_patience
                {
                    self.controller_timeouts += 1;
                    self.trigger = RecoveryTrigger::LocalPlanner;
                    self.state = NavState::Clearing;
                }
            }
        }
    }

    fn tick_clearing(&mut self) {
        self.publish(Twist::ZERO);
        match self.trigger {
            RecoveryTrigger::Location => self.recover_location(),
            RecoveryTrigger::Oscillation => {
                self.recovery_attempts += 1;
                self.replan_from_scratch();
            }
            RecoveryTrigger::GetNewGoal => self.recover_get_new_goal(),
            RecoveryTrigger::Backward => {
                if self.backward_maneuver() {
                    self.replan_from_scratch();
                } else {
                    self.trigger = RecoveryTrigger::LocalPlanner;
                }
            }
            RecoveryTrigger::LocalPlanner => {
                let planner_errors = {
                    let st = self.cell.state.lock().unwrap();
                    st.consecutive_failures
                };
                if self.controller_timeouts >= MAX_CONTROLLER_TIMEOUTS {
                    self.finish(NavStatus::GoalUnreachable);
                } else if self.controller_timeouts >= CLEAR_FOOTPRINT_TIMEOUTS
                    || planner_errors >= CLEAR_FOOTPRINT_PLANNER_ERRORS
                {
                    self.clear_footprint_cells();
                    self.controller_failures = 0;
                    self.last_valid_control = Instant::now();
                    self.controller.reset();
                    self.state = NavState::Controlling;
                } else {
                    self.trigger = RecoveryTrigger::GlobalPlanner;
                }
            }
            RecoveryTrigger::GlobalPlanner => {
                self.recovery_attempts += 1;
                if self.planner_timeouts > MAX_PLANNER_TIMEOUTS
                    || self.recovery_attempts > MAX_RECOVERY_ATTEMPTS
                {
                    self.finish(NavStatus::GoalUnreachable);
                    return;
                }
                let stuck = {
                    let buf = self.costmap.read().unwrap();
                    self.checker
                        .footprint_cost(&buf, Layer::Live, &self.pose, 0.0)
                        .is_none()
                };
                if stuck && !self.backward_maneuver() {
                    self.escape();
                }
                self.replan_from_scratch();
            }
        }
    }

    /// LOCATION_RECOVERY_R: rotate in place through the hardware service until
    /// localization returns, up to the configured number of rotations.
    fn recover_location(&mut self) {
        if self.io.localization.valid() {
            self.io.rotate.stop();
            self.location_rotate_started = None;
            self.trigger = RecoveryTrigger::GetNewGoal;
            return;
        }
        match self.location_rotate_started {
            None => {
                self.location_rotations += 1;
                if self.location_rotations > MAX_LOCATION_ROTATIONS {
                    self.finish(NavStatus::LocationInvalid);
                    return;
                }
                let target = normalize_angle(self.pose.th + std::f64::consts::PI);
                if !self.io.rotate.start(target) {
                    // no hardware: fall back to a commanded spin
                    self.publish(Twist {
                        vx: 0.0,
                        vy: 0.0,
                        wz: self.cfg.controller.min_in_place_rotational_vel,
                    });
                }
                self.location_rotate_started = Some(Instant::now());
            }
            Some(t) => {
                if t.elapsed() > self.cfg.supervisor.localization_duration || self.io.rotate.is_done() {
                    self.io.rotate.stop();
                    self.location_rotate_started = None;
                } else {
                    self.publish(Twist {
                        vx: 0.0,
                        vy: 0.0,
                        wz: self.cfg.controller.min_in_place_rotational_vel,
                    });
                }
            }
        }
    }

    /// FIX_GETNEWGOAL_R: pick a safe target on the remaining path and replan
    /// toward it, splicing the result into the installed path.
    fn recover_get_new_goal(&mut self) {
        let path = {
            let st = self.cell.state.lock().unwrap();
            st.path.clone()
        };
        if path.is_empty() {
            self.replan_from_scratch();
            return;
        }
        let picked = {
            let buf = self.costmap.read().unwrap();
            get_astar_goal(
                &path,
                &self.checker,
                &buf,
                &self.pose,
                &self.cfg.supervisor,
                self.cfg.supervisor.recovery_footprint_extend_x,
                self.cfg.supervisor.init_path_circle_center_extend_y,
                0,
            )
        };
        match picked {
            Some((_, target)) => {
                let mut st = self.cell.state.lock().unwrap();
                st.goal = Some(Goal::normal(target));
                st.taken_global_goal = false;
                st.middle_segment = Some((self.pose, target));
                st.planning_state = PlanningState::InsertingMiddle;
                drop(st);
                self.cell.wake();
                self.planning_started = Instant::now();
                self.state = NavState::Planning;
                self.emit(NavStatus::GoalPlanning);
            }
            None => {
                // nothing safe yet; keep trying at the clearing rate
                self.emit(NavStatus::GoalNotSafe);
            }
        }
    }

    /// Mid-path replan: splice a detour between the robot and a safe point
    /// beyond the blockage (P_INSERTING_MIDDLE). The machine keeps
    /// controlling; the worker delivers the splice asynchronously.
    fn request_middle_replan(&mut self, pose: &Pose) {
        let path = {
            let st = self.cell.state.lock().unwrap();
            st.path.clone()
        };
        let picked = {
            let buf = self.costmap.read().unwrap();
            get_astar_goal(
                &path,
                &self.checker,
                &buf,
                pose,
                &self.cfg.supervisor,
                self.cfg.supervisor.recovery_footprint_extend_x,
                self.cfg.supervisor.init_path_circle_center_extend_y,
                0,
            )
        };
        match picked {
            Some((_, target)) => {
                self.emit(NavStatus::PathNotSafe);
                let mut st = self.cell.state.lock().unwrap();
                st.goal = Some(Goal::normal(target));
                st.taken_global_goal = false;
                st.middle_segment = Some((*pose, target));
                st.planning_state = PlanningState::InsertingMiddle;
                drop(st);
                self.cell.wake();
            }
            None => {
                // no safe splice target ahead: make room first, then re-aim
                self.trigger = RecoveryTrigger::Backward;
                self.state = NavState::Clearing;
            }
        }
    }

    /// Installs a freshly delivered plan, restoring the worker's target to the
    /// global goal for subsequent cycles.
    fn absorb_new_plan(&mut self) -> bool {
        let pose = self.io.pose.current_pose().unwrap_or(self.pose);
        let absorbed = {
            let mut st = self.cell.state.lock().unwrap();
            if st.new_global_plan {
                st.new_global_plan = false;
                st.goal = Some(Goal::normal(self.global_goal));
                st.taken_global_goal = true;
                // a restart on a corner the robot already rotated through
                // must not rotate again
                st.path.prune_corner_on_start(&pose);
                true
            } else {
                false
            }
        };
        if absorbed {
            tracing::debug!("new global plan installed");
            self.controller.reset();
            self.controller_failures = 0;
            self.first_tick_after_plan = true;
            self.last_valid_control = Instant::now();
        }
        absorbed
    }

    /// Distance along the installed path that is circle-center safe, capped at
    /// `front_safe_check_dis`.
    fn front_clear_distance(&self) -> f64 {
        let cap = self.cfg.supervisor.front_safe_check_dis;
        let path = {
            let st = self.cell.state.lock().unwrap();
            st.path.clone()
        };
        if path.is_empty() {
            return cap;
        }
        let buf = self.costmap.read().unwrap();
        let pts = path.points();
        let mut acc = 0.0;
        for i in 0..pts.len() {
            if self
                .checker
                .circle_cost(&buf, Layer::Live, &pts[i].pose, 0.0)
                .is_none()
            {
                return acc;
            }
            if i + 1 < pts.len() {
                acc += pts[i].pose.distance(&pts[i + 1].pose);
                if acc >= cap {
                    break;
                }
            }
        }
        cap
    }

    /// Adopts the stashed front path when it is shorter, safe, and consistent
    /// with the robot's heading.
    fn maybe_switch_front_path(&mut self, pose: &Pose) {
        let (candidate, current_len) = {
            let st = self.cell.state.lock().unwrap();
            (st.switch_path.clone(), st.path.length())
        };
        let Some(candidate) = candidate else { return };
        let p = &self.cfg.supervisor;

        // margin against switching at the very end of the current path
        let worthwhile = current_len > 0.30
            && candidate.length() + p.max_path_length_diff < current_len;
        let consistent = candidate.first().map_or(false, |head| {
            let dis = head.pose.distance(pose);
            let yaw = normalize_angle(head.pose.th - pose.th).abs();
            if head.corner {
                dis < p.switch_corner_dis_diff && yaw < p.switch_corner_yaw_diff
            } else {
                dis < p.switch_normal_dis_diff && yaw < p.switch_normal_yaw_diff
            }
        });
        let safe = consistent && {
            let padding = p.fixpattern_footprint_padding;
            let buf = self.costmap.read().unwrap();
            let mut acc = 0.0;
            let pts = candidate.points();
            let mut ok = true;
            for i in 0..pts.len() {
                if self
                    .checker
                    .footprint_cost(&buf, Layer::Live, &pts[i].pose, padding)
                    .is_none()
                {
                    ok = false;
                    break;
                }
                if i + 1 < pts.len() {
                    acc += pts[i].pose.distance(&pts[i + 1].pose);
                    if acc >= 1.0 {
                        break;
                    }
                }
            }
            ok
        };

        let mut st = self.cell.state.lock().unwrap();
        if worthwhile && safe {
            tracing::debug!(len = candidate.length(), "switching to the stashed front path");
            st.path = candidate;
            st.switch_path = None;
            drop(st);
            self.controller.reset();
            self.first_tick_after_plan = true;
        } else {
            st.switch_path = None;
        }
    }

    /// Backs up `backward_check_dis` meters at a fixed crawl, aborting when
    /// the rear footprint becomes unsafe or the goal is cancelled. Blocking,
    /// bounded, 10 Hz.
    fn backward_maneuver(&mut self) -> bool {
        let dis = self.cfg.supervisor.backward_check_dis;
        let dt = Duration::from_millis(100);
        let steps = (dis / (BACKWARD_VEL * 0.1)).ceil() as u32;
        for _ in 0..steps {
            {
                let st = self.cell.state.lock().unwrap();
                let run_flag = st.run_flag;
                drop(st);
                if !run_flag {
                    self.publish(Twist::ZERO);
                    return false;
                }
            }
            let pose = self.io.pose.current_pose().unwrap_or(self.pose);
            let safe = {
                let buf = self.costmap.read().unwrap();
                self.checker.backward_cost(&buf, Layer::Live, &pose).is_some()
            };
            if !safe {
                self.publish(Twist::ZERO);
                return false;
            }
            self.publish(Twist {
                vx: -BACKWARD_VEL,
                vy: 0.0,
                wz: 0.0,
            });
            std::thread::sleep(dt);
        }
        self.publish(Twist::ZERO);
        true
    }

    /// Escape: rotate toward a collision-free heading, then creep forward.
    fn escape(&mut self) {
        let found = {
            let buf = self.costmap.read().unwrap();
            self.checker.recovery_circle_cost(
                &buf,
                &self.pose,
                self.cfg.supervisor.recovery_footprint_extend_x,
                self.cfg.supervisor.recovery_footprint_extend_y,
            )
        };
        let Some((yaw, _)) = found else {
            tracing::warn!("escape found no free heading");
            return;
        };
        tracing::debug!(yaw, "escaping toward a free heading");
        let dt = Duration::from_millis(100);
        for _ in 0..100 {
            {
                let st = self.cell.state.lock().unwrap();
                if !st.run_flag {
                    return;
                }
            }
            let pose = self.io.pose.current_pose().unwrap_or(self.pose);
            let gap = normalize_angle(yaw - pose.th);
            if gap.abs() < 0.15 {
                break;
            }
            self.publish(Twist {
                vx: 0.0,
                vy: 0.0,
                wz: self.cfg.controller.min_in_place_rotational_vel * gap.signum(),
            });
            std::thread::sleep(dt);
        }
        for _ in 0..10 {
            self.publish(Twist {
                vx: BACKWARD_VEL,
                vy: 0.0,
                wz: 0.0,
            });
            std::thread::sleep(dt);
        }
        self.publish(Twist::ZERO);
    }

    /// Clears the robot's own cells from the live costmap, the way the
    /// recovery of last resort does before retrying the controller.
    fn clear_footprint_cells(&mut self) {
        let r = self.cfg.footprint.circle_radius;
        let centers = self.cfg.footprint.footprint_center_points.clone();
        let (sin, cos) = self.pose.th.sin_cos();
        let mut buf = self.costmap.write().unwrap();
        for (cx, cy) in centers {
            let wx = self.pose.x + cx * cos - cy * sin;
            let wy = self.pose.y + cx * sin + cy * cos;
            buf.clear_rect(wx - r, wy - r, wx + r, wy + r);
        }
        tracing::debug!("cleared footprint cells from the live costmap");
    }

    fn replan_from_scratch(&mut self) {
        {
            let mut st = self.cell.state.lock().unwrap();
            st.goal = Some(Goal::normal(self.global_goal));
            st.taken_global_goal = true;
            st.planning_state = PlanningState::InsertingNone;
            st.middle_segment = None;
        }
        self.cell.wake();
        self.planning_started = Instant::now();
        self.state = NavState::Planning;
        self.emit(NavStatus::GoalPlanning);
    }

    fn finish(&mut self, status: NavStatus) {
        self.publish(Twist::ZERO);
        self.emit(status);
        {
            let mut st = self.cell.state.lock().unwrap();
            st.run_flag = false;
            st.path.finish();
        }
        self.cell.cv.notify_all();
        self.done = true;
        self.result = Some(status);
        tracing::info!(?status, "goal terminated");
    }

    fn publish(&mut self, t: Twist) {
        self.last_vel = t;
        let _ = self.vel_tx.send(t);
    }

    /// Publishes one deceleration step toward zero. Safety-event braking may
    /// ramp down harder than the nominal limit (`stop_to_zero_acc`).
    fn publish_decel(&mut self) {
        let c = &self.cfg.controller;
        let dt = c.control_period;
        let lin = self.cfg.supervisor.stop_to_zero_acc.max(c.acc_lim_x);
        let slow = |v: f64, a: f64| {
            if v > 0.0 {
                (v - a * dt).max(0.0)
            } else {
                (v + a * dt).min(0.0)
            }
        };
        let cmd = Twist {
            vx: slow(self.last_vel.vx, lin),
            vy: slow(self.last_vel.vy, lin),
            wz: slow(self.last_vel.wz, c.acc_lim_theta),
        };
        self.publish(cmd);
    }

    fn emit(&self, s: NavStatus) {
        let _ = self.status_tx.send(s);
    }
}

/// The assembled stack: supervisor plus its worker thread and the outbound
/// channels.
pub struct NavStack {
    pub supervisor: Supervisor,
    pub worker: JoinHandle<()>,
    pub cell: Arc<PlanCell>,
    pub vel_rx: Receiver<Twist>,
    pub status_rx: Receiver<NavStatus>,
}

/// Wires the supervisor, the worker thread and the output channels together.
pub fn build_stack(cfg: NavConfig, costmap: SharedCostmap, io: NavIo) -> std::io::Result<NavStack> {
    let cell = Arc::new(PlanCell::new());
    let (vel_tx, vel_rx) = crossbeam_channel::unbounded();
    let (status_tx, status_rx) = crossbeam_channel::unbounded();
    let worker = PlannerWorker::new(&cfg, costmap.clone(), io.clone(), cell.clone(), status_tx.clone());
    let handle = worker.spawn()?;
    let supervisor = Supervisor::new(cfg, costmap, io, cell.clone(), vel_tx, status_tx);
    Ok(NavStack {
        supervisor,
        worker: handle,
        cell,
        vel_rx,
        status_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{NoBezier, NoRotateHardware, PoseSource, QuietProtector};
    use crate::status::GoalKind;
    use gridnav_lattice::costmap::CostmapBuffer;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct SimPose(Mutex<Pose>);

    impl PoseSource for SimPose {
        fn current_pose(&self) -> Option<Pose> {
            Some(*self.0.lock().unwrap())
        }

        fn current_velocity(&self) -> Twist {
            Twist::ZERO
        }
    }

    struct SwitchableLocalization(AtomicBool);

    impl crate::io::LocalizationSource for SwitchableLocalization {
        fn valid(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Rig {
        sup: Supervisor,
        pose: Arc<SimPose>,
        loc: Arc<SwitchableLocalization>,
        costmap: SharedCostmap,
        vel_rx: Receiver<Twist>,
        status_rx: Receiver<NavStatus>,
    }

    /// A supervisor without a live worker thread: plans are installed by hand.
    fn rig(build: impl FnOnce(&mut CostmapBuffer)) -> Rig {
        let mut buf = CostmapBuffer::new(160, 160, 0.05, 0.0, 0.0);
        build(&mut buf);
        let costmap = buf.shared();
        let pose = Arc::new(SimPose(Mutex::new(Pose::new(3.0, 3.0, 0.0))));
        let loc = Arc::new(SwitchableLocalization(AtomicBool::new(true)));
        let io = NavIo {
            pose: pose.clone(),
            localization: loc.clone(),
            protector: Arc::new(QuietProtector),
            rotate: Arc::new(NoRotateHardware),
            bezier: Arc::new(NoBezier),
        };
        let (vel_tx, vel_rx) = crossbeam_channel::unbounded();
        let (status_tx, status_rx) = crossbeam_channel::unbounded();
        let mut cfg = NavConfig::default();
        cfg.lattice.map_size = 160;
        let sup = Supervisor::new(cfg, costmap.clone(), io, Arc::new(PlanCell::new()), vel_tx, status_tx);
        Rig {
            sup,
            pose,
            loc,
            costmap,
            vel_rx,
            status_rx,
        }
    }

    fn install_plan(rig: &mut Rig, poses: Vec<Pose>) {
        let cell = rig.sup.cell();
        let mut st = cell.state.lock().unwrap();
        st.path = Path::from_fix(poses, 0.5);
        st.new_global_plan = true;
    }

    fn straight(from: Pose, len: f64) -> Vec<Pose> {
        let n = (len / 0.1) as usize;
        (0..=n)
            .map(|i| Pose::new(from.x + i as f64 * 0.1, from.y, 0.0))
            .collect()
    }

    fn statuses(rig: &Rig) -> Vec<NavStatus> {
        rig.status_rx.try_iter().collect()
    }

    #[test]
    fn goal_in_a_wall_is_rejected_before_planning() {
        let mut r = rig(|buf| {
            buf.stamp_rect(5.5, 5.5, 6.5, 6.5, 254);
        });
        let accepted = r.sup.set_goal(Goal {
            pose: Pose::new(6.0, 6.0, 0.0),
            kind: GoalKind::Normal,
        });
        assert!(!accepted);
        assert_eq!(r.sup.result(), Some(NavStatus::GoalUnreachable));
        assert!(statuses(&r).contains(&NavStatus::GoalUnreachable));
        assert!(!r.sup.step());
    }

    #[test]
    fn installed_plan_moves_the_machine_to_controlling() {
        let mut r = rig(|_| {});
        assert!(r.sup.set_goal(Goal::normal(Pose::new(5.0, 3.0, 0.0))));
        assert_eq!(r.sup.state(), NavState::Planning);
        r.sup.step();
        assert_eq!(r.sup.state(), NavState::Planning); // no plan yet, still waiting
        install_plan(&mut r, straight(Pose::new(3.0, 3.0, 0.0), 2.0));
        r.sup.step();
        assert_eq!(r.sup.state(), NavState::Controlling);
        assert!(statuses(&r).contains(&NavStatus::GoalHeading));
    }

    #[test]
    fn reaching_the_goal_terminates_with_goal_reached() {
        let mut r = rig(|_| {});
        r.sup.set_goal(Goal::normal(Pose::new(5.0, 3.0, 0.0)));
        install_plan(&mut r, straight(Pose::new(3.0, 3.0, 0.0), 2.0));
        r.sup.step(); // absorb, -> controlling
        *r.pose.0.lock().unwrap() = Pose::new(5.0, 3.0, 0.0);
        assert!(!r.sup.step());
        assert_eq!(r.sup.result(), Some(NavStatus::GoalReached));
        // velocity is zeroed on termination
        let last = r.vel_rx.try_iter().last().unwrap();
        assert_eq!(last, Twist::ZERO);
    }

    #[test]
    fn controlling_publishes_forward_motion() {
        let mut r = rig(|_| {});
        r.sup.set_goal(Goal::normal(Pose::new(6.0, 3.0, 0.0)));
        install_plan(&mut r, straight(Pose::new(3.0, 3.0, 0.0), 3.0));
        r.sup.step(); // -> controlling
        r.sup.step(); // first control tick
        let cmds: Vec<Twist> = r.vel_rx.try_iter().collect();
        assert!(cmds.iter().any(|c| c.vx > 0.0), "no forward command in {cmds:?}");
        assert!(statuses(&r).contains(&NavStatus::GoalHeading));
    }

    #[test]
    fn lost_localization_enters_location_recovery() {
        let mut r = rig(|_| {});
        r.sup.set_goal(Goal::normal(Pose::new(6.0, 3.0, 0.0)));
        install_plan(&mut r, straight(Pose::new(3.0, 3.0, 0.0), 3.0));
        r.sup.step(); // -> controlling
        r.loc.0.store(false, Ordering::SeqCst);
        r.sup.step();
        assert_eq!(r.sup.state(), NavState::Clearing);
        // velocity zeroed within the same tick
        let last = r.vel_rx.try_iter().last().unwrap();
        assert_eq!(last, Twist::ZERO);
        // once localization returns, recovery re-aims instead of terminating
        r.loc.0.store(true, Ordering::SeqCst);
        r.sup.step();
        r.sup.step();
        assert_ne!(r.sup.result(), Some(NavStatus::LocationInvalid));
    }

    #[test]
    fn oscillation_timeout_triggers_recovery_replan() {
        let mut r = rig(|_| {});
        r.sup.cfg.supervisor.oscillation_timeout = Duration::ZERO;
        r.sup.set_goal(Goal::normal(Pose::new(6.0, 3.0, 0.0)));
        install_plan(&mut r, straight(Pose::new(3.0, 3.0, 0.0), 3.0));
        r.sup.step(); // -> controlling
        r.sup.step(); // oscillation fires (no displacement at all)
        assert_eq!(r.sup.state(), NavState::Clearing);
        r.sup.step(); // oscillation recovery replans
        assert_eq!(r.sup.state(), NavState::Planning);
        assert!(statuses(&r).contains(&NavStatus::GoalPlanning));
    }

    #[test]
    fn front_blockage_stops_and_reports_path_not_safe() {
        let mut r = rig(|_| {});
        r.sup.set_goal(Goal::normal(Pose::new(6.0, 3.0, 0.0)));
        install_plan(&mut r, straight(Pose::new(3.0, 3.0, 0.0), 3.0));
        r.sup.step(); // -> controlling
        // drop a wall half a meter ahead of the robot, then tick
        r.costmap.write().unwrap().stamp_rect(3.4, 2.7, 3.7, 3.3, 254);
        r.sup.step();
        assert!(statuses(&r).contains(&NavStatus::PathNotSafe));
        assert_eq!(r.sup.state(), NavState::Controlling); // waiting out the stop
        let last = r.vel_rx.try_iter().last().unwrap();
        assert!(last.vx.abs() < 1e-6);
    }

    #[test]
    fn stashed_front_path_is_adopted_when_shorter_and_safe() {
        let mut r = rig(|_| {});
        r.sup.set_goal(Goal::normal(Pose::new(6.0, 3.0, 0.0)));
        // current plan takes a long detour; the stash goes straight
        let mut detour = straight(Pose::new(3.0, 3.0, 0.0), 1.0);
        detour.extend((0..=20).map(|i| Pose::new(4.0, 3.0 + i as f64 * 0.1, 0.0)));
        detour.extend((0..=20).map(|i| Pose::new(4.0 + i as f64 * 0.1, 5.0, 0.0)));
        install_plan(&mut r, detour);
        r.sup.step(); // -> controlling
        r.sup.cell().offer_switch_path(Path::from_fix(straight(Pose::new(3.0, 3.0, 0.0), 3.0), 0.5));
        r.sup.step();
        let len = {
            let cell = r.sup.cell();
            let st = cell.state.lock().unwrap();
            st.path.length()
        };
        assert!(len < 3.5, "switch path not adopted, length {len}");
    }
}
