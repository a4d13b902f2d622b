//! Navigation control core: the supervisor state machine, local trajectory
//! controller, footprint safety layer and planner worker that together drive
//! a service robot along paths produced by the lattice planner.

pub mod config;
pub mod controller;
pub mod footprint;
pub mod goal_selection;
pub mod io;
pub mod path;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use config::NavConfig;
pub use status::{Goal, GoalKind, NavStatus, Twist};
pub use supervisor::Supervisor;
