use gridnav_lattice::search::LatticePath;
use gridnav_lattice::{normalize_angle, Pose};
use itertools::Itertools;
use thiserror::Error;

/// Corner marking spreads this far back along the path from each apex.
pub const MIN_BEFORE_CORNER_LENGTH: f64 = 0.6;
/// And a quarter of this far forward.
pub const MIN_AFTER_CORNER_LENGTH: f64 = 0.8;

/// Heading change at which a waypoint counts as a corner apex.
const CORNER_YAW_THRESH: f64 = std::f64::consts::PI / 6.0;
/// Consecutive poses closer than this collapse into one waypoint.
const MERGE_EPS: f64 = 1e-4;

#[derive(Debug, Error, PartialEq)]
pub enum PruneError {
    #[error("robot is {0:.2} m away from every point in the prune window")]
    OffDistance(f64),
    #[error("robot heading is {0:.2} rad away from the path")]
    OffYaw(f64),
    #[error("path is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSource {
    Fix,
    Lattice,
    ShortLattice,
    Bezier,
}

#[derive(Debug, Clone, Copy)]
pub struct PathPoint {
    pub pose: Pose,
    pub max_vel: f64,
    /// Distance over which path-following cost is weighted more heavily.
    pub highlight: f64,
    pub radius: f64,
    pub corner: bool,
    /// Heading to rotate to before moving past a corner point.
    pub th_out: f64,
    /// +1 counter-clockwise, -1 clockwise, 0 when not a corner.
    pub rotate_dir: i8,
}

impl PathPoint {
    fn plain(pose: Pose, max_vel: f64) -> PathPoint {
        PathPoint {
            pose,
            max_vel,
            highlight: 1.0,
            radius: 0.0,
            corner: false,
            th_out: pose.th,
            rotate_dir: 0,
        }
    }
}

/// The installed path: an ordered polyline of waypoints with corner markers
/// and per-point speed caps. All mutators keep corner marking consistent by
/// re-deriving it from the geometry afterwards.
#[derive(Debug, Clone)]
pub struct Path {
    points: Vec<PathPoint>,
    source: PathSource,
    finished: bool,
}

impl Default for Path {
    fn default() -> Self {
        Path::new()
    }
}

impl Path {
    pub fn new() -> Path {
        Path {
            points: Vec::new(),
            source: PathSource::Fix,
            finished: false,
        }
    }

    /// A path from raw poses, e.g. the sampled coarse plan or a two-point
    /// straight segment.
    pub fn from_fix(poses: Vec<Pose>, max_vel: f64) -> Path {
        Path::assemble(poses, max_vel, PathSource::Fix)
    }

    pub fn from_lattice(plan: &LatticePath, max_vel: f64) -> Path {
        Path::assemble(plan.poses.clone(), max_vel, PathSource::Lattice)
    }

    pub fn from_short_lattice(plan: &LatticePath, max_vel: f64) -> Path {
        Path::assemble(plan.poses.clone(), max_vel, PathSource::ShortLattice)
    }

    pub fn from_bezier(poses: Vec<Pose>, max_vel: f64) -> Path {
        Path::assemble(poses, max_vel, PathSource::Bezier)
    }

    fn assemble(poses: Vec<Pose>, max_vel: f64, source: PathSource) -> Path {
        let mut points: Vec<PathPoint> = Vec::with_capacity(poses.len());
        for pose in poses {
            match points.last() {
                // in-place rotations collapse into one waypoint
                Some(last) if last.pose.distance(&pose) < MERGE_EPS => {}
                _ => points.push(PathPoint::plain(pose, max_vel)),
            }
        }
        let mut path = Path {
            points,
            source,
            finished: false,
        };
        path.refresh_corners();
        path
    }

    pub fn source(&self) -> PathSource {
        self.source
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    pub fn get(&self, i: usize) -> Option<&PathPoint> {
        self.points.get(i)
    }

    pub fn first(&self) -> Option<&PathPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&PathPoint> {
        self.points.last()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sum of Euclidean segment lengths.
    pub fn length(&self) -> f64 {
        self.points
            .iter()
            .tuple_windows()
            .map(|(a, b)| a.pose.distance(&b.pose))
            .sum()
    }

    /// Remaining length from a given index.
    pub fn length_from(&self, index: usize) -> f64 {
        if index >= self.points.len() {
            return 0.0;
        }
        self.points[index..]
            .iter()
            .tuple_windows()
            .map(|(a, b)| a.pose.distance(&b.pose))
            .sum()
    }

    /// Index and distance of the point closest to `pose` among the first
    /// `window` points.
    pub fn nearest_index(&self, pose: &Pose, window: usize) -> Option<(usize, f64)> {
        self.points
            .iter()
            .take(window.max(1))
            .enumerate()
            .map(|(i, p)| (i, p.pose.distance(pose)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Trims everything strictly behind the closest in-tolerance point.
    ///
    /// Fails (leaving the path untouched) only when no point in the search
    /// window is within `max_offroad_dis` / `max_offroad_yaw` of the robot;
    /// with `strict` unset, an off-path robot is tolerated and nothing is
    /// pruned.
    pub fn prune(
        &mut self,
        pose: &Pose,
        max_offroad_dis: f64,
        max_offroad_yaw: f64,
        strict: bool,
    ) -> Result<(), PruneError> {
        if self.points.is_empty() {
            return if strict { Err(PruneError::Empty) } else { Ok(()) };
        }
        let window = 40usize;
        let (idx, dis) = self.nearest_index(pose, window).expect("non-empty path");
        if dis > max_offroad_dis {
            return if strict {
                Err(PruneError::OffDistance(dis))
            } else {
                Ok(())
            };
        }
        let point = self.points[idx];
        let yaw_gap = if point.corner {
            0.0 // rotating through a corner legitimately disagrees in yaw
        } else {
            normalize_angle(point.pose.th - pose.th).abs()
        };
        if yaw_gap > max_offroad_yaw {
            return if strict { Err(PruneError::OffYaw(yaw_gap)) } else { Ok(()) };
        }
        self.points.drain(..idx);
        self.refresh_corners();
        Ok(())
    }

    /// Clears the corner flags of the leading corner run once the robot
    /// already faces its exit heading, so the controller does not rotate again
    /// after a restart on a corner.
    pub fn prune_corner_on_start(&mut self, pose: &Pose) {
        let Some(first) = self.points.first() else { return };
        if !first.corner {
            return;
        }
        if normalize_angle(first.th_out - pose.th).abs() > 0.1 {
            return;
        }
        for p in self.points.iter_mut() {
            if !p.corner {
                break;
            }
            p.corner = false;
            p.rotate_dir = 0;
        }
    }

    /// Drops every point up to the one closest to `pose`, without tolerance
    /// checks.
    pub fn erase_to_point(&mut self, pose: &Pose) {
        if let Some((idx, _)) = self.nearest_index(pose, self.points.len()) {
            self.points.drain(..idx);
            self.refresh_corners();
        }
    }

    pub fn insert_begin(&mut self, segment: Path) {
        let mut points = segment.points;
        points.append(&mut self.points);
        self.points = points;
        self.refresh_corners();
    }

    pub fn insert_end(&mut self, segment: Path) {
        self.append_dedup(segment.points);
        self.refresh_corners();
    }

    /// Splices `segment` between the points closest to `start` and `goal`,
    /// discarding the replaced interior.
    pub fn insert_middle(&mut self, segment: Path, start: &Pose, goal: &Pose) {
        if self.points.is_empty() {
            self.points = segment.points;
            self.refresh_corners();
            return;
        }
        let (istart, _) = self.nearest_index(start, self.points.len()).expect("non-empty");
        let igoal = self
            .points
            .iter()
            .enumerate()
            .skip(istart)
            .map(|(i, p)| (i, p.pose.distance(goal)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .unwrap_or(istart);
        let tail: Vec<PathPoint> = self.points.drain(igoal..).skip(1).collect();
        self.points.truncate(istart);
        self.points.extend(segment.points);
        self.append_dedup(tail);
        self.refresh_corners();
    }

    /// Appends a segment, e.g. a goal extension.
    pub fn extend(&mut self, segment: Path) {
        self.append_dedup(segment.points);
        self.refresh_corners();
    }

    /// Terminates the path: empties it and marks it finished.
    pub fn finish(&mut self) {
        self.points.clear();
        self.finished = true;
    }

    fn append_dedup(&mut self, points: Vec<PathPoint>) {
        for p in points {
            match self.points.last() {
                Some(last) if last.pose.distance(&p.pose) < MERGE_EPS => {}
                _ => self.points.push(p),
            }
        }
    }

    /// Re-derives corner marking from geometry: finds apexes, then marks the
    /// neighbors within the configured windows with the apex's exit heading.
    /// Idempotent, since it never reads the previous flags.
    pub fn refresh_corners(&mut self) {
        let n = self.points.len();
        for p in self.points.iter_mut() {
            p.corner = false;
            p.rotate_dir = 0;
            p.th_out = p.pose.th;
        }
        if n < 2 {
            return;
        }

        let dirs: Vec<Option<f64>> = (0..n)
            .map(|i| {
                if i + 1 < n {
                    let a = self.points[i].pose;
                    let b = self.points[i + 1].pose;
                    (a.distance(&b) >= MERGE_EPS).then(|| (b.y - a.y).atan2(b.x - a.x))
                } else {
                    None
                }
            })
            .collect();

        let mut apexes: Vec<(usize, f64, i8)> = Vec::new();
        for i in 1..n {
            let Some(din) = dirs[i - 1] else { continue };
            let Some(dout) = dirs[i] else { continue };
            let turn = normalize_angle(dout - din);
            if turn.abs() > CORNER_YAW_THRESH {
                apexes.push((i, dout, if turn >= 0.0 { 1 } else { -1 }));
            }
        }

        for (apex, th_out, dir) in apexes {
            self.mark_corner(apex, th_out, dir);
            // behind the apex
            let mut acc = 0.0;
            let mut i = apex;
            while i > 0 && acc < MIN_BEFORE_CORNER_LENGTH {
                acc += self.points[i - 1].pose.distance(&self.points[i].pose);
                i -= 1;
                self.mark_corner(i, th_out, dir);
            }
            // and a short stretch after it
            let mut acc = 0.0;
            let mut i = apex;
            while i + 1 < n && acc < 0.25 * MIN_AFTER_CORNER_LENGTH {
                acc += self.points[i].pose.distance(&self.points[i + 1].pose);
                i += 1;
                self.mark_corner(i, th_out, dir);
            }
        }
    }

    fn mark_corner(&mut self, i: usize, th_out: f64, dir: i8) {
        let p = &mut self.points[i];
        p.corner = true;
        p.th_out = th_out;
        p.rotate_dir = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l_shaped() -> Path {
        // 1 m along +x, then 1 m along +y, sampled at 10 cm
        let mut poses = Vec::new();
        for i in 0..=10 {
            poses.push(Pose::new(i as f64 * 0.1, 0.0, 0.0));
        }
        for i in 1..=10 {
            poses.push(Pose::new(1.0, i as f64 * 0.1, std::f64::consts::FRAC_PI_2));
        }
        Path::from_fix(poses, 0.5)
    }

    #[test]
    fn length_sums_segments() {
        let p = l_shaped();
        assert!((p.length() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn corner_is_detected_and_contiguous() {
        let p = l_shaped();
        let corners: Vec<usize> = p
            .points()
            .iter()
            .enumerate()
            .filter(|(_, pt)| pt.corner)
            .map(|(i, _)| i)
            .collect();
        assert!(!corners.is_empty());
        // contiguous run
        assert!(corners.windows(2).all(|w| w[1] == w[0] + 1));
        // the apex at index 10 is inside the run and exits along +y
        assert!(corners.contains(&10));
        let apex = p.get(10).unwrap();
        assert!((apex.th_out - std::f64::consts::FRAC_PI_2).abs() < 1e-6);
        assert_eq!(apex.rotate_dir, 1);
    }

    #[test]
    fn corner_marking_is_idempotent() {
        let mut p = l_shaped();
        let once: Vec<(bool, f64, i8)> = p
            .points()
            .iter()
            .map(|pt| (pt.corner, pt.th_out, pt.rotate_dir))
            .collect();
        p.refresh_corners();
        let twice: Vec<(bool, f64, i8)> = p
            .points()
            .iter()
            .map(|pt| (pt.corner, pt.th_out, pt.rotate_dir))
            .collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn prune_drops_passed_points_and_is_idempotent() {
        let mut p = l_shaped();
        let here = Pose::new(0.52, 0.02, 0.0);
        p.prune(&here, 0.6, 0.8, true).unwrap();
        let first = p.first().unwrap().pose;
        assert!((first.x - 0.5).abs() < 1e-6);
        let len_after = p.len();
        p.prune(&here, 0.6, 0.8, true).unwrap();
        assert_eq!(p.len(), len_after);
    }

    #[test]
    fn strict_prune_rejects_an_offroad_robot() {
        let mut p = l_shaped();
        let lost = Pose::new(0.5, 3.0, 0.0);
        assert!(matches!(
            p.prune(&lost, 0.6, 0.8, true),
            Err(PruneError::OffDistance(_))
        ));
        assert_eq!(p.len(), 21);
        // lenient mode tolerates it
        p.prune(&lost, 0.6, 0.8, false).unwrap();
        assert_eq!(p.len(), 21);
    }

    #[test]
    fn insert_middle_replaces_the_interior() {
        let mut p = l_shaped();
        let detour = Path::from_fix(
            vec![
                Pose::new(0.3, 0.0, 0.0),
                Pose::new(0.5, 0.2, 0.0),
                Pose::new(0.7, 0.0, 0.0),
            ],
            0.5,
        );
        let before = p.len();
        p.insert_middle(detour, &Pose::new(0.3, 0.0, 0.0), &Pose::new(0.7, 0.0, 0.0));
        // 5 interior points replaced by 3, end points deduplicated
        assert_eq!(p.len(), before - 2);
        assert!(p.points().iter().any(|pt| (pt.pose.y - 0.2).abs() < 1e-6));
        // the tail is intact
        let last = p.last().unwrap().pose;
        assert!((last.x - 1.0).abs() < 1e-6 && (last.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn leading_corner_is_cleared_once_rotated_through() {
        let mut p = l_shaped();
        // drop the first half meter so the path starts inside the corner run
        p.erase_to_point(&Pose::new(0.5, 0.0, 0.0));
        assert!(p.first().unwrap().corner);

        // still facing the old direction: the corner must stay
        p.prune_corner_on_start(&Pose::new(0.5, 0.0, 0.0));
        assert!(p.first().unwrap().corner);

        // already facing the exit heading: the leading run clears
        p.prune_corner_on_start(&Pose::new(0.5, 0.0, std::f64::consts::FRAC_PI_2));
        assert!(!p.first().unwrap().corner);
    }

    #[test]
    fn assemble_collapses_in_place_rotations() {
        let poses = vec![
            Pose::new(0.0, 0.0, 0.0),
            Pose::new(0.5, 0.0, 0.0),
            Pose::new(0.5, 0.0, 0.8),
            Pose::new(0.5, 0.0, 1.5),
            Pose::new(0.5, 0.5, 1.5),
        ];
        let p = Path::from_fix(poses, 0.5);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn finish_empties_the_path() {
        let mut p = l_shaped();
        p.finish();
        assert!(p.is_empty());
        assert!(p.is_finished());
    }
}
