//! The recognized parameter surface, as construction-time injected structs.
//! Loading (files, CLI, middleware parameters) happens outside the core.

use gridnav_lattice::environment::LatticeParams;
use gridnav_lattice::search::SearchParams;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerBackend {
    /// Sample a (v, ω) grid, simulate each candidate forward, score it.
    Rollout,
    /// Track a lookahead point on the path, validate the single candidate.
    Lookahead,
}

#[derive(Debug, Clone)]
pub struct ControllerParams {
    pub backend: ControllerBackend,
    pub max_vel_x: f64,
    pub min_vel_x: f64,
    pub max_vel_theta: f64,
    pub min_vel_theta: f64,
    pub min_in_place_rotational_vel: f64,
    pub acc_lim_x: f64,
    pub acc_lim_y: f64,
    pub acc_lim_theta: f64,
    pub xy_goal_tolerance: f64,
    pub yaw_goal_tolerance: f64,
    pub sim_time: f64,
    pub sim_granularity: f64,
    pub vx_samples: u32,
    pub vtheta_samples: u32,
    pub pdist_scale: f64,
    pub gdist_scale: f64,
    pub occdist_scale: f64,
    /// One control period, seconds (1 / controller_frequency).
    pub control_period: f64,
}

impl Default for ControllerParams {
    fn default() -> Self {
        ControllerParams {
            backend: ControllerBackend::Rollout,
            max_vel_x: 0.6,
            min_vel_x: 0.1,
            max_vel_theta: 0.8,
            min_vel_theta: -0.8,
            min_in_place_rotational_vel: 0.3,
            acc_lim_x: 0.5,
            acc_lim_y: 0.5,
            acc_lim_theta: 1.0,
            xy_goal_tolerance: 0.1,
            yaw_goal_tolerance: 0.1,
            sim_time: 1.5,
            sim_granularity: 0.05,
            vx_samples: 6,
            vtheta_samples: 20,
            pdist_scale: 0.6,
            gdist_scale: 0.8,
            occdist_scale: 0.1,
            control_period: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FootprintParams {
    /// Footprint polygon vertices, robot frame, counter-clockwise.
    pub footprint: Vec<(f64, f64)>,
    /// Disk-cover centers for the fast check.
    pub circle_centers: Vec<(f64, f64)>,
    pub circle_radius: f64,
    /// Centers swept when checking a backward maneuver.
    pub backward_center_points: Vec<(f64, f64)>,
    /// Centers used when clearing the robot's own cells from the costmap.
    pub footprint_center_points: Vec<(f64, f64)>,
    pub inscribed_radius: f64,
}

impl Default for FootprintParams {
    fn default() -> Self {
        FootprintParams {
            footprint: vec![(0.25, 0.2), (-0.25, 0.2), (-0.25, -0.2), (0.25, -0.2)],
            circle_centers: vec![(0.12, 0.0), (-0.12, 0.0)],
            circle_radius: 0.22,
            backward_center_points: vec![(-0.25, 0.0), (-0.4, 0.0)],
            footprint_center_points: vec![(0.0, 0.0), (0.15, 0.0), (-0.15, 0.0)],
            inscribed_radius: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorParams {
    pub controller_frequency: f64,
    pub planner_frequency: f64,
    pub planner_patience: Duration,
    pub controller_patience: Duration,
    pub oscillation_timeout: Duration,
    pub oscillation_distance: f64,
    pub max_offroad_dis: f64,
    pub max_offroad_yaw: f64,
    pub front_safe_check_dis: f64,
    pub goal_safe_check_dis: f64,
    pub goal_safe_check_duration: Duration,
    pub goal_safe_dis_a: f64,
    pub goal_safe_dis_b: f64,
    pub backward_check_dis: f64,
    pub stop_duration: Duration,
    pub stop_to_zero_acc: f64,
    pub localization_duration: Duration,
    pub sbpl_max_distance: f64,
    pub sbpl_footprint_padding: f64,
    pub fixpattern_footprint_padding: f64,
    pub recovery_footprint_extend_x: f64,
    pub recovery_footprint_extend_y: f64,
    pub init_path_circle_center_extend_y: f64,
    pub init_path_sample_dis: f64,
    pub init_path_sample_yaw: f64,
    pub max_path_length_diff: f64,
    pub switch_corner_dis_diff: f64,
    pub switch_corner_yaw_diff: f64,
    pub switch_normal_dis_diff: f64,
    pub switch_normal_yaw_diff: f64,
    pub use_farther_planner: bool,
    /// Protector-bus bit indexes that count as front-facing.
    pub front_protector_list: Vec<u32>,
}

impl Default for SupervisorParams {
    fn default() -> Self {
        SupervisorParams {
            controller_frequency: 10.0,
            planner_frequency: 2.0,
            planner_patience: Duration::from_secs(5),
            controller_patience: Duration::from_secs(3),
            oscillation_timeout: Duration::from_secs(10),
            oscillation_distance: 0.2,
            max_offroad_dis: 0.6,
            max_offroad_yaw: 0.8,
            front_safe_check_dis: 2.0,
            goal_safe_check_dis: 0.5,
            goal_safe_check_duration: Duration::from_secs(5),
            goal_safe_dis_a: 0.5,
            goal_safe_dis_b: 0.3,
            backward_check_dis: 0.35,
            stop_duration: Duration::from_secs(3),
            stop_to_zero_acc: 0.5,
            localization_duration: Duration::from_secs(5),
            sbpl_max_distance: 10.0,
            sbpl_footprint_padding: 0.05,
            fixpattern_footprint_padding: 0.1,
            recovery_footprint_extend_x: 0.05,
            recovery_footprint_extend_y: 0.05,
            init_path_circle_center_extend_y: 0.1,
            init_path_sample_dis: 0.1,
            init_path_sample_yaw: 0.2,
            max_path_length_diff: 1.0,
            switch_corner_dis_diff: 0.2,
            switch_corner_yaw_diff: 0.3,
            switch_normal_dis_diff: 0.5,
            switch_normal_yaw_diff: 0.6,
            use_farther_planner: true,
            front_protector_list: vec![0, 1],
        }
    }
}

/// Everything the stack needs, bundled for injection.
#[derive(Debug, Clone, Default)]
pub struct NavConfig {
    pub lattice: LatticeParams,
    pub search: SearchParams,
    pub controller: ControllerParams,
    pub footprint: FootprintParams,
    pub supervisor: SupervisorParams,
}
