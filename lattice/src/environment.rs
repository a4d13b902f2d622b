use crate::costmap::{CostmapBuffer, CostmapView};
use crate::primitives::{PrimitiveCosts, PrimitiveSet};
use crate::search::PlanError;
use crate::{continuize_angle, discretize_angle, CellId, GridPose, Pose};
use gridnav_collections::heap::OpenList;
use hashbrown::HashMap;
use smallvec::SmallVec;

/// Sentinel for an unknown / unreachable cost. All cost arithmetic saturates.
pub const INFINITE_COST: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct LatticeParams {
    /// Cell edge length, meters.
    pub resolution: f64,
    /// Edge length of the robot-centered planning window, cells.
    pub map_size: u32,
    pub nominalvel_mpersecs: f64,
    pub timetoturn45degsinplace_secs: f64,
    pub forward_cost_mult: u32,
    pub forward_and_turn_cost_mult: u32,
    pub turn_in_place_cost_mult: u32,
}

impl Default for LatticeParams {
    fn default() -> Self {
        LatticeParams {
            resolution: 0.05,
            map_size: 400,
            nominalvel_mpersecs: 0.4,
            timetoturn45degsinplace_secs: 0.6,
            forward_cost_mult: 1,
            forward_and_turn_cost_mult: 2,
            turn_in_place_cost_mult: 5,
        }
    }
}

impl LatticeParams {
    fn primitive_costs(&self) -> PrimitiveCosts {
        PrimitiveCosts {
            resolution: self.resolution,
            nominalvel_mpersecs: self.nominalvel_mpersecs,
            timetoturn45degsinplace_secs: self.timetoturn45degsinplace_secs,
            forward_cost_mult: self.forward_cost_mult,
            forward_and_turn_cost_mult: self.forward_and_turn_cost_mult,
            turn_in_place_cost_mult: self.turn_in_place_cost_mult,
        }
    }
}

/// Collision checking seam. The polygon/disk primitives themselves live with
/// the footprint layer; the environment only needs the two query shapes.
pub trait CollisionModel: Send {
    /// Max cost under the full footprint, `None` when the pose collides or
    /// leaves the window.
    fn footprint_cost(&self, pose: &Pose, view: &CostmapView) -> Option<u8>;
    /// Cheaper disk-cover approximation of the same query.
    fn circle_cost(&self, pose: &Pose, view: &CostmapView) -> Option<u8>;
}

/// Treats the robot as a point. Used by unit tests and the coarse fallback
/// planner, where inflation already accounts for the robot body.
pub struct PointCollisionModel;

impl CollisionModel for PointCollisionModel {
    fn footprint_cost(&self, pose: &Pose, view: &CostmapView) -> Option<u8> {
        let c = view.cost_at_world(pose.x, pose.y)?;
        (c < view.thresholds.inscribed).then_some(c)
    }

    fn circle_cost(&self, pose: &Pose, view: &CostmapView) -> Option<u8> {
        self.footprint_cost(pose, view)
    }
}

/// One lazily materialized lattice entry.
///
/// `visited_iteration` gates reuse across environment re-initializations:
/// an entry whose tag lags the environment's counter is logically reset.
#[derive(Debug, Clone)]
pub struct CellEntry {
    pub pose: GridPose,
    pub g: u32,
    pub rhs: u32,
    pub best_next: Option<CellId>,
    pub best_prim: Option<u16>,
    pub visited_iteration: u32,
    pub closed_iteration: u32,
}

/// An outgoing (or incoming) lattice transition.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub target: CellId,
    pub cost: u32,
    pub prim: u16,
}

pub struct Environment {
    pub params: LatticeParams,
    prims: PrimitiveSet,
    collision: Box<dyn CollisionModel>,
    pub(crate) arena: Vec<CellEntry>,
    index: HashMap<GridPose, CellId>,
    start: Option<CellId>,
    goal: Option<CellId>,
    pub(crate) iteration: u32,
    pub view: CostmapView,
    view_generation: u64,
    cell_ms: f64,
    dijkstra: Vec<u32>,
    dijkstra_anchor: Option<(i32, i32)>,
    dijkstra_generation: u64,
}

impl Environment {
    pub fn new(params: LatticeParams, collision: Box<dyn CollisionModel>) -> Environment {
        let prims = PrimitiveSet::generate(&params.primitive_costs());
        let cell_ms = params.resolution / params.nominalvel_mpersecs * 1000.0;
        Environment {
            params,
            prims,
            collision,
            arena: Vec::new(),
            index: HashMap::new(),
            start: None,
            goal: None,
            iteration: 1,
            view: CostmapView::empty(),
            view_generation: 0,
            cell_ms,
            dijkstra: Vec::new(),
            dijkstra_anchor: None,
            dijkstra_generation: u64::MAX,
        }
    }

    /// Re-snapshots the planning window around the robot; returns the cells
    /// whose cost changed (for incremental repair).
    pub fn refresh_view(&mut self, buf: &CostmapBuffer, center: &Pose) -> Vec<(i32, i32)> {
        let changed = self.view.refresh(buf, center, self.params.map_size);
        self.view_generation += 1;
        changed
    }

    pub fn discretize(&self, p: &Pose) -> GridPose {
        let (x, y) = self.view.world_to_cell(p.x, p.y);
        GridPose {
            x,
            y,
            th: discretize_angle(p.th),
        }
    }

    pub fn continuize(&self, gp: &GridPose) -> Pose {
        let (x, y) = self.view.cell_to_world(gp.x, gp.y);
        Pose {
            x,
            y,
            th: continuize_angle(gp.th),
        }
    }

    pub fn lookup(&self, pose: &GridPose) -> Option<CellId> {
        self.index.get(pose).copied()
    }

    /// Materializes (or finds) the entry for a lattice cell.
    pub fn entry_id(&mut self, pose: GridPose) -> CellId {
        match self.index.get(&pose) {
            Some(&id) => id,
            None => {
                let id = CellId::from_u32(self.arena.len() as u32);
                self.arena.push(CellEntry {
                    pose,
                    g: INFINITE_COST,
                    rhs: INFINITE_COST,
                    best_next: None,
                    best_prim: None,
                    visited_iteration: 0,
                    closed_iteration: 0,
                });
                self.index.insert(pose, id);
                id
            }
        }
    }

    pub fn get(&self, id: CellId) -> &CellEntry {
        &self.arena[id]
    }

    pub fn get_mut(&mut self, id: CellId) -> &mut CellEntry {
        &mut self.arena[id]
    }

    pub fn num_entries(&self) -> usize {
        self.arena.len()
    }

    pub fn set_start(&mut self, p: &Pose) -> Result<CellId, PlanError> {
        let cell = self.discretize(p);
        if !self.view.contains(cell.x, cell.y) {
            return Err(PlanError::OutOfMap);
        }
        let id = self.entry_id(cell);
        self.start = Some(id);
        Ok(id)
    }

    pub fn set_goal(&mut self, p: &Pose) -> Result<CellId, PlanError> {
        let cell = self.discretize(p);
        if !self.view.contains(cell.x, cell.y) {
            return Err(PlanError::OutOfMap);
        }
        let id = self.entry_id(cell);
        self.goal = Some(id);
        Ok(id)
    }

    pub fn start(&self) -> Option<CellId> {
        self.start
    }

    pub fn goal(&self) -> Option<CellId> {
        self.goal
    }

    /// Resets every entry logically (lazily, via the iteration tag).
    pub fn bump_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Resets an entry that has not been visited since the last
    /// re-initialization.
    pub(crate) fn touch(&mut self, id: CellId) {
        let it = self.iteration;
        let e = &mut self.arena[id];
        if e.visited_iteration != it {
            e.g = INFINITE_COST;
            e.rhs = INFINITE_COST;
            e.best_next = None;
            e.best_prim = None;
            e.closed_iteration = 0;
            e.visited_iteration = it;
        }
    }

    /// Applies every primitive whose start heading matches the entry's.
    pub fn succs(&mut self, id: CellId) -> SmallVec<[Edge; 8]> {
        let pose = self.arena[id].pose;
        let base = self.continuize(&pose);
        let mut out = SmallVec::new();
        let prim_ids: SmallVec<[u16; 8]> = self.prims.starting_at(pose.th).iter().copied().collect();
        for pid in prim_ids {
            let prim = self.prims.get(pid);
            let target = GridPose {
                x: pose.x + prim.dx,
                y: pose.y + prim.dy,
                th: prim.end_th,
            };
            if !self.view.contains(target.x, target.y) {
                continue;
            }
            if let Some(cost) = self.traversal_cost(&base, pid) {
                let target = self.entry_id(target);
                out.push(Edge { target, cost, prim: pid });
            }
        }
        out
    }

    /// Symmetric expansion via primitive reversal: states from which a
    /// primitive lands exactly on `id`.
    pub fn preds(&mut self, id: CellId) -> SmallVec<[Edge; 8]> {
        let pose = self.arena[id].pose;
        let mut out = SmallVec::new();
        let prim_ids: SmallVec<[u16; 8]> = self.prims.ending_at(pose.th).iter().copied().collect();
        for pid in prim_ids {
            let prim = self.prims.get(pid);
            let pred = GridPose {
                x: pose.x - prim.dx,
                y: pose.y - prim.dy,
                th: prim.start_th,
            };
            if !self.view.contains(pred.x, pred.y) {
                continue;
            }
            let base = self.continuize(&pred);
            if let Some(cost) = self.traversal_cost(&base, pid) {
                let pred = self.entry_id(pred);
                out.push(Edge { target: pred, cost, prim: pid });
            }
        }
        out
    }

    /// Max-cost scan along a primitive anchored at `base`; `None` rejects it.
    fn traversal_cost(&self, base: &Pose, prim: u16) -> Option<u32> {
        let prim = self.prims.get(prim);
        let thresholds = self.view.thresholds;
        let mut worst: u8 = 0;
        for off in &prim.poses {
            let wp = Pose {
                x: base.x + off.x,
                y: base.y + off.y,
                th: off.th,
            };
            let cell_cost = self.view.cost_at_world(wp.x, wp.y)?;
            if cell_cost >= thresholds.inscribed {
                return None;
            }
            self.collision.circle_cost(&wp, &self.view)?;
            if cell_cost > thresholds.possibly_circumscribed {
                self.collision.footprint_cost(&wp, &self.view)?;
            }
            worst = worst.max(cell_cost);
        }
        Some(prim.base_cost.saturating_mul(worst.max(1) as u32))
    }

    pub fn affected_pred_offsets(&self) -> &[(i32, i32, u8)] {
        self.prims.affected_pred_offsets()
    }

    pub fn primitive(&self, id: u16) -> &crate::primitives::MotionPrimitive {
        self.prims.get(id)
    }

    /// Grid size of the current planning window, in cells.
    pub fn window_cells(&self) -> usize {
        self.view.cell_count()
    }

    /// Recomputes (if stale) the 2-D cost grid the heuristic is read from.
    /// The grid is seeded at the search anchor: the start cell, since the
    /// lattice search runs toward the start.
    pub fn ensure_heuristic_updated(&mut self) {
        let Some(start) = self.start else { return };
        let anchor = {
            let p = self.arena[start].pose;
            (p.x, p.y)
        };
        if self.dijkstra_anchor == Some(anchor) && self.dijkstra_generation == self.view_generation {
            return;
        }

        let w = self.view.w as i32;
        let h = self.view.h as i32;
        let n = (w * h) as usize;
        let mut dist = vec![INFINITE_COST; n];
        let mut open: OpenList<usize, u32> = OpenList::new();

        let local = |x: i32, y: i32| ((y - self.view.oy) * w + (x - self.view.ox)) as usize;
        let ortho = self.cell_ms.ceil() as u32;
        let diag = (self.cell_ms * std::f64::consts::SQRT_2).ceil() as u32;

        if self.view.contains(anchor.0, anchor.1) {
            dist[local(anchor.0, anchor.1)] = 0;
            open.push(local(anchor.0, anchor.1), 0);
        }

        while let Some((li, d)) = open.pop() {
            if d > dist[li] {
                continue;
            }
            let x = self.view.ox + (li as i32 % w);
            let y = self.view.oy + (li as i32 / w);
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let (nx, ny) = (x + dx, y + dy);
                    if !self.view.contains(nx, ny) {
                        continue;
                    }
                    let cell = self.view.cost(nx, ny).unwrap_or(u8::MAX);
                    if cell >= self.view.thresholds.inscribed {
                        continue;
                    }
                    let step = if dx != 0 && dy != 0 { diag } else { ortho };
                    let nd = d.saturating_add(step.saturating_mul(cell.max(1) as u32));
                    let ni = local(nx, ny);
                    if nd < dist[ni] {
                        dist[ni] = nd;
                        if open.contains(ni) {
                            open.adjust(ni, nd);
                        } else {
                            open.push(ni, nd);
                        }
                    }
                }
            }
        }

        self.dijkstra = dist;
        self.dijkstra_anchor = Some(anchor);
        self.dijkstra_generation = self.view_generation;
        tracing::trace!(cells = n, "heuristic grid recomputed");
    }

    /// Admissible estimate of the cost between the anchor and this cell:
    /// max of the 2-D grid value and the kinematic straight-line bound.
    pub fn heuristic_of(&self, pose: &GridPose) -> u32 {
        let Some((ax, ay)) = self.dijkstra_anchor else {
            return 0;
        };
        let grid = if self.view.contains(pose.x, pose.y) {
            let w = self.view.w as i32;
            let li = ((pose.y - self.view.oy) * w + (pose.x - self.view.ox)) as usize;
            self.dijkstra.get(li).copied().unwrap_or(INFINITE_COST)
        } else {
            INFINITE_COST
        };
        let dx = (pose.x - ax) as f64;
        let dy = (pose.y - ay) as f64;
        let euclid = (dx.hypot(dy) * self.cell_ms).floor() as u32;
        grid.max(euclid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::costmap::CostmapBuffer;

    fn env_with_map(build: impl FnOnce(&mut CostmapBuffer)) -> Environment {
        let mut buf = CostmapBuffer::new(120, 120, 0.05, 0.0, 0.0);
        build(&mut buf);
        let mut env = Environment::new(
            LatticeParams {
                map_size: 120,
                ..LatticeParams::default()
            },
            Box::new(PointCollisionModel),
        );
        env.refresh_view(&buf, &Pose::new(3.0, 3.0, 0.0));
        env
    }

    #[test]
    fn succs_and_preds_are_symmetric() {
        let mut env = env_with_map(|_| {});
        let s = env.set_start(&Pose::new(3.0, 3.0, 0.0)).unwrap();
        let succs = env.succs(s);
        assert_eq!(succs.len(), 5);
        for edge in succs {
            let back = env.preds(edge.target);
            assert!(
                back.iter().any(|e| e.target == s && e.cost == edge.cost),
                "missing reverse edge"
            );
        }
    }

    #[test]
    fn lethal_wall_blocks_forward_primitives() {
        let mut env = env_with_map(|buf| {
            // wall in the cell directly ahead of the robot
            buf.stamp_rect(3.05, 2.5, 3.2, 3.5, 254);
        });
        let s = env.set_start(&Pose::new(3.0, 3.0, 0.0)).unwrap();
        let succs = env.succs(s);
        // only the two in-place turns survive
        assert_eq!(succs.len(), 2);
        for e in &succs {
            let prim = env.primitive(e.prim);
            assert_eq!((prim.dx, prim.dy), (0, 0));
        }
    }

    #[test]
    fn heuristic_is_zero_at_anchor_and_grows_with_distance() {
        let mut env = env_with_map(|_| {});
        env.set_start(&Pose::new(3.0, 3.0, 0.0)).unwrap();
        env.set_goal(&Pose::new(4.0, 3.0, 0.0)).unwrap();
        env.ensure_heuristic_updated();
        let start_pose = env.get(env.start().unwrap()).pose;
        assert_eq!(env.heuristic_of(&start_pose), 0);
        let goal_pose = env.get(env.goal().unwrap()).pose;
        let h = env.heuristic_of(&goal_pose);
        // 1 m at 0.4 m/s is 2500 ms of travel; the bound must not exceed it
        assert!(h > 0 && h <= 2500, "h = {h}");
    }

    #[test]
    fn heuristic_respects_walls() {
        let mut env = env_with_map(|buf| {
            // a wall with a gap far to the side forces a detour
            buf.stamp_rect(3.5, 0.0, 3.55, 5.0, 254);
        });
        env.set_start(&Pose::new(3.0, 3.0, 0.0)).unwrap();
        env.set_goal(&Pose::new(4.0, 3.0, 0.0)).unwrap();
        env.ensure_heuristic_updated();
        let goal_pose = env.get(env.goal().unwrap()).pose;
        let h = env.heuristic_of(&goal_pose);
        // detour around y = 5.0 is much longer than the straight line
        assert!(h > 2500, "h = {h}");
    }

    #[test]
    fn entries_are_reset_lazily_on_iteration_bump() {
        let mut env = env_with_map(|_| {});
        let s = env.set_start(&Pose::new(3.0, 3.0, 0.0)).unwrap();
        env.touch(s);
        env.get_mut(s).g = 42;
        env.bump_iteration();
        assert_eq!(env.get(s).g, 42); // untouched: stale value still visible
        env.touch(s);
        assert_eq!(env.get(s).g, INFINITE_COST);
    }
}
