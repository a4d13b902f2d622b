use crate::{continuize_angle, normalize_angle, Pose, NUM_ANGLES};
use hashbrown::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Forward,
    ForwardTurn,
    TurnInPlace,
}

/// A short pre-computed trajectory template, anchored at the center of its
/// start cell. `poses` are offsets from that center with absolute headings.
#[derive(Debug, Clone)]
pub struct MotionPrimitive {
    pub start_th: u8,
    pub end_th: u8,
    pub dx: i32,
    pub dy: i32,
    pub kind: PrimitiveKind,
    /// Cost before scaling by the worst cell traversed.
    pub base_cost: u32,
    pub poses: Vec<Pose>,
}

/// Generation knobs, derived from the lattice parameters.
pub struct PrimitiveCosts {
    pub resolution: f64,
    pub nominalvel_mpersecs: f64,
    pub timetoturn45degsinplace_secs: f64,
    pub forward_cost_mult: u32,
    pub forward_and_turn_cost_mult: u32,
    pub turn_in_place_cost_mult: u32,
}

/// The full primitive catalogue plus the indexes the environment queries.
pub struct PrimitiveSet {
    prims: Vec<MotionPrimitive>,
    by_start: Vec<Vec<u16>>,
    by_end: Vec<Vec<u16>>,
    affected_pred_offsets: Vec<(i32, i32, u8)>,
}

/// Canonical one-step displacement of a heading bin, the smallest integer
/// vector whose direction approximates the bin angle (e.g. (2, 1) for 22.5°).
pub fn canonical_step(bin: u8) -> (i32, i32) {
    const FIRST_QUADRANT: [(i32, i32); 4] = [(1, 0), (2, 1), (1, 1), (1, 2)];
    let (mut x, mut y) = FIRST_QUADRANT[(bin % 4) as usize];
    for _ in 0..bin / 4 {
        let t = x;
        x = -y;
        y = t;
    }
    (x, y)
}

impl PrimitiveSet {
    pub fn generate(costs: &PrimitiveCosts) -> PrimitiveSet {
        let mut prims = Vec::with_capacity(NUM_ANGLES as usize * 5);
        for th in 0..NUM_ANGLES {
            let (dx, dy) = canonical_step(th);
            prims.push(make_move(th, th, dx, dy, PrimitiveKind::Forward, costs));
            for turn in [1i8, -1i8] {
                let end = rotate_bin(th, turn);
                prims.push(make_move(th, end, dx, dy, PrimitiveKind::ForwardTurn, costs));
                prims.push(make_move(th, end, 0, 0, PrimitiveKind::TurnInPlace, costs));
            }
        }

        let mut by_start = vec![Vec::new(); NUM_ANGLES as usize];
        let mut by_end = vec![Vec::new(); NUM_ANGLES as usize];
        for (i, p) in prims.iter().enumerate() {
            by_start[p.start_th as usize].push(i as u16);
            by_end[p.end_th as usize].push(i as u16);
        }

        let mut affected: HashSet<(i32, i32, u8)> = HashSet::new();
        for p in &prims {
            for pose in &p.poses {
                let cx = (pose.x / costs.resolution).round() as i32;
                let cy = (pose.y / costs.resolution).round() as i32;
                affected.insert((-cx, -cy, p.start_th));
            }
        }
        let mut affected_pred_offsets: Vec<_> = affected.into_iter().collect();
        affected_pred_offsets.sort_unstable();

        PrimitiveSet {
            prims,
            by_start,
            by_end,
            affected_pred_offsets,
        }
    }

    pub fn get(&self, id: u16) -> &MotionPrimitive {
        &self.prims[id as usize]
    }

    pub fn len(&self) -> usize {
        self.prims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prims.is_empty()
    }

    /// Primitives applicable from a state with the given heading bin.
    pub fn starting_at(&self, th: u8) -> &[u16] {
        &self.by_start[th as usize]
    }

    /// Primitives arriving at a state with the given heading bin.
    pub fn ending_at(&self, th: u8) -> &[u16] {
        &self.by_end[th as usize]
    }

    /// The (Δx, Δy, θ) offsets whose predecessor set a unit cell change can
    /// invalidate: adding an offset to the changed cell yields the cell of a
    /// state whose outgoing transitions may have changed cost.
    pub fn affected_pred_offsets(&self) -> &[(i32, i32, u8)] {
        &self.affected_pred_offsets
    }
}

fn rotate_bin(th: u8, turn: i8) -> u8 {
    ((th as i16 + turn as i16).rem_euclid(NUM_ANGLES as i16)) as u8
}

fn make_move(
    start_th: u8,
    end_th: u8,
    dx: i32,
    dy: i32,
    kind: PrimitiveKind,
    costs: &PrimitiveCosts,
) -> MotionPrimitive {
    let r = costs.resolution;
    let (ex, ey) = (dx as f64 * r, dy as f64 * r);
    let length = ex.hypot(ey);
    let th0 = continuize_angle(start_th);
    let th1 = continuize_angle(end_th);
    let dth = normalize_angle(th1 - th0);

    // half-cell spacing keeps every traversed cell on the sample list
    let steps = if length > 0.0 {
        ((length / (r * 0.5)).ceil() as usize).max(2)
    } else {
        2
    };
    let poses = (0..=steps)
        .map(|i| {
            let f = i as f64 / steps as f64;
            Pose::new(ex * f, ey * f, th0 + dth * f)
        })
        .collect();

    let ms_per_bin = costs.timetoturn45degsinplace_secs * 1000.0 / 2.0;
    let base_cost = match kind {
        PrimitiveKind::Forward => {
            (length / costs.nominalvel_mpersecs * 1000.0).ceil() as u32 * costs.forward_cost_mult
        }
        PrimitiveKind::ForwardTurn => {
            (length / costs.nominalvel_mpersecs * 1000.0).ceil() as u32 * costs.forward_and_turn_cost_mult
        }
        PrimitiveKind::TurnInPlace => (ms_per_bin.ceil() as u32).max(1) * costs.turn_in_place_cost_mult,
    };

    MotionPrimitive {
        start_th,
        end_th,
        dx,
        dy,
        kind,
        base_cost: base_cost.max(1),
        poses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn costs() -> PrimitiveCosts {
        PrimitiveCosts {
            resolution: 0.05,
            nominalvel_mpersecs: 0.4,
            timetoturn45degsinplace_secs: 0.6,
            forward_cost_mult: 1,
            forward_and_turn_cost_mult: 2,
            turn_in_place_cost_mult: 5,
        }
    }

    #[test]
    fn every_bin_gets_five_primitives() {
        let set = PrimitiveSet::generate(&costs());
        assert_eq!(set.len(), NUM_ANGLES as usize * 5);
        for th in 0..NUM_ANGLES {
            assert_eq!(set.starting_at(th).len(), 5);
            let kinds: Vec<_> = set.starting_at(th).iter().map(|&i| set.get(i).kind).collect();
            assert_eq!(kinds.iter().filter(|k| **k == PrimitiveKind::TurnInPlace).count(), 2);
        }
    }

    #[test]
    fn canonical_steps_point_along_their_bin() {
        for th in 0..NUM_ANGLES {
            let (dx, dy) = canonical_step(th);
            let step_angle = (dy as f64).atan2(dx as f64);
            let gap = normalize_angle(step_angle - continuize_angle(th)).abs();
            assert!(gap < 0.1, "bin {th}: step ({dx},{dy}) is {gap} rad off");
        }
    }

    #[test]
    fn turn_in_place_has_no_displacement_and_rotates_one_bin() {
        let set = PrimitiveSet::generate(&costs());
        for th in 0..NUM_ANGLES {
            for &i in set.starting_at(th) {
                let p = set.get(i);
                if p.kind == PrimitiveKind::TurnInPlace {
                    assert_eq!((p.dx, p.dy), (0, 0));
                    let gap = (p.end_th as i16 - p.start_th as i16).rem_euclid(NUM_ANGLES as i16);
                    assert!(gap == 1 || gap == NUM_ANGLES as i16 - 1);
                }
            }
        }
    }

    #[test]
    fn reversal_symmetry_of_indexes() {
        let set = PrimitiveSet::generate(&costs());
        for th in 0..NUM_ANGLES {
            for &i in set.ending_at(th) {
                assert_eq!(set.get(i).end_th, th);
            }
        }
    }

    #[test]
    fn affected_offsets_cover_the_backwards_step() {
        let set = PrimitiveSet::generate(&costs());
        // a change at a cell must at least affect the state sitting on it
        for th in 0..NUM_ANGLES {
            assert!(set.affected_pred_offsets().contains(&(0, 0, th)));
        }
        // and the state one canonical step behind heading 0
        assert!(set.affected_pred_offsets().contains(&(-1, 0, 0)));
    }
}
