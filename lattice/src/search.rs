use crate::environment::{Environment, INFINITE_COST};
use crate::{CellId, GridPose, Pose, NUM_ANGLES};
use gridnav_collections::heap::OpenList;
use gridnav_collections::set::IterSet;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("start or goal falls outside the planning window")]
    OutOfMap,
    #[error("no collision-free kinematic path exists")]
    NoPath,
    #[error("time budget exhausted before a first solution")]
    Timeout,
}

/// Priority of an entry: `(min(g, rhs) + ε·h, min(g, rhs))`, lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct SearchKey {
    pub k1: f64,
    pub k2: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    pub expansions: u64,
    pub underconsistent_expansions: u64,
    pub iterations: u32,
    pub final_epsilon: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Default time budget of one planning cycle.
    pub allocated_time: Duration,
    pub initial_epsilon: f64,
    /// Amount ε shrinks by between anytime iterations.
    pub epsilon_decrease: f64,
    /// A cost-change batch larger than this forces planning from scratch.
    pub force_scratch_limit: usize,
    /// Seed a 7×7×3 halo around the goal so a slightly displaced start can match.
    pub broader_start_and_goal: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            allocated_time: Duration::from_secs(1),
            initial_epsilon: 3.0,
            epsilon_decrease: 1.0,
            force_scratch_limit: 500,
            broader_start_and_goal: false,
        }
    }
}

/// A primitive-expanded lattice path. `cost` is the g-value of its origin,
/// `epsilon` the inflation the producing iteration ran with.
#[derive(Debug, Clone)]
pub struct LatticePath {
    pub poses: Vec<Pose>,
    pub cost: u32,
    pub epsilon: f64,
}

enum Outcome {
    Solved,
    Exhausted,
    Timeout,
}

const HALO_XY: i32 = 3;
const HALO_TH: i32 = 1;

/// Anytime repairing search over the state lattice.
///
/// Carries its bookkeeping (open list, inconsistent stash, ε) across calls:
/// planning again toward the same goal repairs the previous search instead of
/// starting over, unless [`AnytimePlanner::costs_changed`] crossed the
/// from-scratch thresholds or the goal moved.
pub struct AnytimePlanner {
    params: SearchParams,
    epsilon: f64,
    iteration: u32,
    open: OpenList<CellId, SearchKey>,
    incons: IterSet<CellId>,
    seeds: IterSet<CellId>,
    last_goal: Option<GridPose>,
    need_reinit: bool,
    pub stats: SearchStats,
}

fn key_of(env: &Environment, id: CellId, epsilon: f64) -> SearchKey {
    let e = env.get(id);
    let m = e.g.min(e.rhs);
    if m == INFINITE_COST {
        return SearchKey {
            k1: f64::INFINITY,
            k2: f64::INFINITY,
        };
    }
    let h = env.heuristic_of(&e.pose);
    let k1 = if h == INFINITE_COST {
        f64::INFINITY
    } else {
        m as f64 + epsilon * h as f64
    };
    SearchKey { k1, k2: m as f64 }
}

impl AnytimePlanner {
    pub fn new(params: SearchParams) -> AnytimePlanner {
        AnytimePlanner {
            epsilon: params.initial_epsilon,
            params,
            iteration: 0,
            open: OpenList::new(),
            incons: IterSet::new(),
            seeds: IterSet::new(),
            last_goal: None,
            need_reinit: true,
            stats: SearchStats::default(),
        }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    /// Produces a path whose cost is within the current ε of optimal, lowering
    /// ε toward 1 for as long as the budget allows. Never returns a partial
    /// plan: on failure the error tells whether the lattice was exhausted or
    /// the clock ran out first.
    pub fn plan(
        &mut self,
        env: &mut Environment,
        start: &Pose,
        goal: &Pose,
        budget: Duration,
    ) -> Result<LatticePath, PlanError> {
        let t0 = Instant::now();
        let deadline = t0 + budget;

        let start_id = env.set_start(start)?;
        let goal_id = env.set_goal(goal)?;
        let goal_cell = env.get(goal_id).pose;
        if self.need_reinit || self.last_goal != Some(goal_cell) {
            self.reinitialize(env, goal_id);
        }
        env.ensure_heuristic_updated();
        env.touch(start_id);

        self.stats = SearchStats::default();
        let mut best: Option<LatticePath> = None;
        loop {
            self.iteration += 1;
            self.stats.iterations += 1;

            // resurface the inconsistent stash, then re-key the whole open
            // list against the current ε and heuristic anchor
            let stash: Vec<CellId> = self.incons.drain().collect();
            for id in stash {
                let e = env.get(id);
                if e.g != e.rhs && !self.open.contains(id) {
                    self.open.push(id, SearchKey { k1: 0.0, k2: 0.0 });
                }
            }
            let epsilon = self.epsilon;
            self.open.rebuild(|id| key_of(env, id, epsilon));

            match self.compute_or_improve(env, start_id, deadline) {
                Outcome::Solved => {
                    let path = self.extract_path(env, start_id)?;
                    tracing::debug!(
                        epsilon = self.epsilon,
                        cost = path.cost,
                        expansions = self.stats.expansions,
                        "lattice solution"
                    );
                    let done = self.epsilon <= 1.0 + 1e-9;
                    best = Some(path);
                    if done {
                        break;
                    }
                    self.epsilon = (self.epsilon - self.params.epsilon_decrease).max(1.0);
                }
                Outcome::Timeout => break,
                Outcome::Exhausted => {
                    if best.is_none() {
                        // a dead search holds nothing worth repairing
                        self.need_reinit = true;
                        self.finish_stats(t0);
                        return Err(PlanError::NoPath);
                    }
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        self.finish_stats(t0);
        best.ok_or(PlanError::Timeout)
    }

    fn finish_stats(&mut self, t0: Instant) {
        self.stats.elapsed = t0.elapsed();
        self.stats.final_epsilon = self.epsilon;
    }

    fn reinitialize(&mut self, env: &mut Environment, goal_id: CellId) {
        self.open.clear();
        self.incons.clear();
        self.seeds.clear();
        env.bump_iteration();
        self.epsilon = self.params.initial_epsilon;
        self.need_reinit = false;

        let goal_pose = env.get(goal_id).pose;
        self.last_goal = Some(goal_pose);
        env.touch(goal_id);
        env.get_mut(goal_id).rhs = 0;
        self.seeds.insert(goal_id);
        if self.params.broader_start_and_goal {
            for dth in -HALO_TH..=HALO_TH {
                for dy in -HALO_XY..=HALO_XY {
                    for dx in -HALO_XY..=HALO_XY {
                        let pose = GridPose {
                            x: goal_pose.x + dx,
                            y: goal_pose.y + dy,
                            th: rotate_bin(goal_pose.th, dth),
                        };
                        if !env.view.contains(pose.x, pose.y) {
                            continue;
                        }
                        let id = env.entry_id(pose);
                        env.touch(id);
                        env.get_mut(id).rhs = 0;
                        self.seeds.insert(id);
                    }
                }
            }
        }
        for id in self.seeds.iter().collect::<Vec<_>>() {
            self.open.push(id, SearchKey { k1: 0.0, k2: 0.0 });
        }
        tracing::debug!(seeds = self.seeds.len(), "search reinitialized");
    }

    fn compute_or_improve(&mut self, env: &mut Environment, start_id: CellId, deadline: Instant) -> Outcome {
        let mut since_check = 0u32;
        loop {
            since_check += 1;
            if since_check >= 64 {
                since_check = 0;
                if Instant::now() >= deadline {
                    return Outcome::Timeout;
                }
            }

            let start_key = key_of(env, start_id, self.epsilon);
            let se = env.get(start_id);
            let start_inconsistent = se.g != se.rhs;
            let proceed = match self.open.peek() {
                Some((_, top)) => top < start_key || start_inconsistent,
                None => false,
            };
            if !proceed {
                if self.open.is_empty() && env.get(start_id).rhs == INFINITE_COST {
                    return Outcome::Exhausted;
                }
                return Outcome::Solved;
            }

            let (id, _) = self.open.pop().expect("open not empty");
            let e = env.get(id);
            if e.g > e.rhs {
                let rhs = e.rhs;
                let e = env.get_mut(id);
                e.g = rhs;
                e.closed_iteration = self.iteration;
                self.stats.expansions += 1;
                let preds = env.preds(id);
                for p in preds {
                    self.update_state(env, p.target);
                }
            } else {
                env.get_mut(id).g = INFINITE_COST;
                self.stats.underconsistent_expansions += 1;
                self.update_state(env, id);
                let preds = env.preds(id);
                for p in preds {
                    self.update_state(env, p.target);
                }
            }
        }
    }

    /// Recomputes `rhs` (and the successor pointer) of one entry and fixes its
    /// open/inconsistent membership.
    fn update_state(&mut self, env: &mut Environment, id: CellId) {
        if self.seeds.contains(id) {
            return;
        }
        env.touch(id);

        let succs = env.succs(id);
        let mut rhs = INFINITE_COST;
        let mut best_next = None;
        let mut best_prim = None;
        for edge in succs {
            env.touch(edge.target);
            let g = env.get(edge.target).g;
            if g == INFINITE_COST {
                continue;
            }
            let via = g.saturating_add(edge.cost);
            if via < rhs {
                rhs = via;
                best_next = Some(edge.target);
                best_prim = Some(edge.prim);
            }
        }

        let e = env.get_mut(id);
        e.rhs = rhs;
        e.best_next = best_next;
        e.best_prim = best_prim;
        let inconsistent = e.g != e.rhs;
        let closed_now = e.closed_iteration == self.iteration;

        if inconsistent {
            if closed_now {
                self.incons.insert(id);
            } else {
                let key = key_of(env, id, self.epsilon);
                if self.open.contains(id) {
                    self.open.adjust(id, key);
                } else {
                    self.open.push(id, key);
                }
            }
        } else if self.open.contains(id) {
            self.open.erase(id);
        }
    }

    /// Incremental repair entry point: each changed cell invalidates the
    /// predecessor states reaching over it. Crossing either batch threshold
    /// schedules a from-scratch search instead.
    pub fn costs_changed(&mut self, env: &mut Environment, cells: &[(i32, i32)]) {
        if cells.is_empty() {
            return;
        }
        if cells.len() > self.params.force_scratch_limit || cells.len() * 10 > env.window_cells() {
            tracing::debug!(changed = cells.len(), "cost change too broad, replanning from scratch");
            self.need_reinit = true;
            return;
        }
        self.epsilon = self.params.initial_epsilon;
        let offsets: Vec<(i32, i32, u8)> = env.affected_pred_offsets().to_vec();
        for &(cx, cy) in cells {
            for &(dx, dy, th) in &offsets {
                let pose = GridPose {
                    x: cx + dx,
                    y: cy + dy,
                    th,
                };
                if let Some(id) = env.lookup(&pose) {
                    if env.get(id).visited_iteration == env.iteration {
                        self.update_state(env, id);
                    }
                }
            }
        }
    }

    fn extract_path(&self, env: &Environment, start_id: CellId) -> Result<LatticePath, PlanError> {
        let mut origin = start_id;
        if env.get(start_id).rhs == INFINITE_COST {
            origin = self
                .closest_reachable_near(env, start_id)
                .ok_or(PlanError::NoPath)?;
        }

        let cost = env.get(origin).rhs;
        let mut poses = vec![env.continuize(&env.get(origin).pose)];
        let mut cur = origin;
        let mut hops = 0usize;
        while !self.seeds.contains(cur) {
            let e = env.get(cur);
            let (Some(next), Some(prim)) = (e.best_next, e.best_prim) else {
                return Err(PlanError::NoPath);
            };
            let base = env.continuize(&e.pose);
            let prim = env.primitive(prim);
            for off in prim.poses.iter().skip(1) {
                poses.push(Pose {
                    x: base.x + off.x,
                    y: base.y + off.y,
                    th: off.th,
                });
            }
            cur = next;
            hops += 1;
            if hops > env.num_entries() {
                return Err(PlanError::NoPath);
            }
        }
        Ok(LatticePath {
            poses,
            cost,
            epsilon: self.epsilon,
        })
    }

    /// With the goal halo enabled, a start displaced off the reachable set may
    /// still sit next to a solved entry; walk out from the nearest one.
    fn closest_reachable_near(&self, env: &Environment, start_id: CellId) -> Option<CellId> {
        if !self.params.broader_start_and_goal {
            return None;
        }
        let sp = env.get(start_id).pose;
        let mut best: Option<(f64, CellId)> = None;
        for dth in -HALO_TH..=HALO_TH {
            for dy in -HALO_XY..=HALO_XY {
                for dx in -HALO_XY..=HALO_XY {
                    let pose = GridPose {
                        x: sp.x + dx,
                        y: sp.y + dy,
                        th: rotate_bin(sp.th, dth),
                    };
                    let Some(id) = env.lookup(&pose) else { continue };
                    let e = env.get(id);
                    if e.visited_iteration != env.iteration || e.rhs == INFINITE_COST {
                        continue;
                    }
                    let d = ((dx * dx + dy * dy) as f64).sqrt();
                    if best.map_or(true, |(bd, _)| d < bd) {
                        best = Some((d, id));
                    }
                }
            }
        }
        best.map(|(_, id)| id)
    }
}

fn rotate_bin(th: u8, delta: i32) -> u8 {
    ((th as i32 + delta).rem_euclid(NUM_ANGLES as i32)) as u8
}
