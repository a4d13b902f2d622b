use crate::Pose;
use std::sync::{Arc, RwLock};

/// Cost of a cell known to be free of any obstacle influence.
pub const FREE: u8 = 0;

/// Cost classification thresholds, provided by the external inflation layer.
#[derive(Debug, Clone, Copy)]
pub struct CostThresholds {
    /// A cell holding an actual obstacle.
    pub lethal: u8,
    /// A cell the robot body would touch regardless of heading.
    pub inscribed: u8,
    /// Above this value the robot *may* be in collision depending on heading,
    /// and a full footprint check is required.
    pub possibly_circumscribed: u8,
}

impl Default for CostThresholds {
    fn default() -> Self {
        CostThresholds {
            lethal: 254,
            inscribed: 253,
            possibly_circumscribed: 128,
        }
    }
}

/// Which cost layer a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// The map-only overlay, ignoring dynamic obstacles.
    Static,
    /// The combined map + sensed-obstacle grid.
    Live,
}

/// The cost grid as maintained by the external costmap layer.
///
/// Two layers are kept: the static map and the live grid that also carries
/// sensed obstacles. `stamp_rect`/`clear_rect` exist so that tests and the
/// demo can script dynamic obstacles.
pub struct CostmapBuffer {
    pub size_x: u32,
    pub size_y: u32,
    pub resolution: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub thresholds: CostThresholds,
    static_costs: Vec<u8>,
    live_costs: Vec<u8>,
    stale: bool,
    revision: u64,
}

pub type SharedCostmap = Arc<RwLock<CostmapBuffer>>;

impl CostmapBuffer {
    pub fn new(size_x: u32, size_y: u32, resolution: f64, origin_x: f64, origin_y: f64) -> CostmapBuffer {
        let n = (size_x * size_y) as usize;
        CostmapBuffer {
            size_x,
            size_y,
            resolution,
            origin_x,
            origin_y,
            thresholds: CostThresholds::default(),
            static_costs: vec![FREE; n],
            live_costs: vec![FREE; n],
            stale: false,
            revision: 0,
        }
    }

    pub fn shared(self) -> SharedCostmap {
        Arc::new(RwLock::new(self))
    }

    fn idx(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.size_x as i32 || y >= self.size_y as i32 {
            None
        } else {
            Some(y as usize * self.size_x as usize + x as usize)
        }
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        self.idx(x, y).is_some()
    }

    pub fn cost(&self, layer: Layer, x: i32, y: i32) -> Option<u8> {
        let i = self.idx(x, y)?;
        Some(match layer {
            Layer::Static => self.static_costs[i],
            Layer::Live => self.live_costs[i],
        })
    }

    pub fn world_to_cell(&self, wx: f64, wy: f64) -> Option<(i32, i32)> {
        let x = ((wx - self.origin_x) / self.resolution).floor() as i32;
        let y = ((wy - self.origin_y) / self.resolution).floor() as i32;
        self.in_bounds(x, y).then_some((x, y))
    }

    pub fn cell_to_world(&self, x: i32, y: i32) -> (f64, f64) {
        (
            self.origin_x + (x as f64 + 0.5) * self.resolution,
            self.origin_y + (y as f64 + 0.5) * self.resolution,
        )
    }

    /// Writes a static-map cost; the live layer is raised to match.
    pub fn set_static_cost(&mut self, x: i32, y: i32, cost: u8) {
        if let Some(i) = self.idx(x, y) {
            self.static_costs[i] = cost;
            self.live_costs[i] = self.live_costs[i].max(cost);
            self.revision += 1;
        }
    }

    /// Stamps a world-frame rectangle of the live layer with the given cost.
    pub fn stamp_rect(&mut self, wx0: f64, wy0: f64, wx1: f64, wy1: f64, cost: u8) {
        self.for_rect(wx0, wy0, wx1, wy1, |buf, i| {
            buf.live_costs[i] = buf.live_costs[i].max(cost);
        });
    }

    /// Restores a world-frame rectangle of the live layer to the static map.
    pub fn clear_rect(&mut self, wx0: f64, wy0: f64, wx1: f64, wy1: f64) {
        self.for_rect(wx0, wy0, wx1, wy1, |buf, i| {
            buf.live_costs[i] = buf.static_costs[i];
        });
    }

    fn for_rect(&mut self, wx0: f64, wy0: f64, wx1: f64, wy1: f64, f: impl Fn(&mut Self, usize)) {
        let x0 = ((wx0.min(wx1) - self.origin_x) / self.resolution).floor() as i32;
        let x1 = ((wx0.max(wx1) - self.origin_x) / self.resolution).ceil() as i32;
        let y0 = ((wy0.min(wy1) - self.origin_y) / self.resolution).floor() as i32;
        let y1 = ((wy0.max(wy1) - self.origin_y) / self.resolution).ceil() as i32;
        for y in y0..=y1 {
            for x in x0..=x1 {
                if let Some(i) = self.idx(x, y) {
                    f(self, i);
                }
            }
        }
        self.revision += 1;
    }

    /// Naive inflation of the live and static layers around lethal cells.
    /// Only meant for building synthetic maps in tests and the demo; the real
    /// costmap arrives pre-inflated from the external layer.
    pub fn reinflate(&mut self, inscribed_radius_m: f64, inflation_radius_m: f64) {
        let ins = (inscribed_radius_m / self.resolution).ceil() as i32;
        let inf = (inflation_radius_m / self.resolution).ceil() as i32;
        for layer in 0..2 {
            let src: Vec<u8> = if layer == 0 {
                self.static_costs.clone()
            } else {
                self.live_costs.clone()
            };
            let lethal = self.thresholds.lethal;
            let inscribed = self.thresholds.inscribed;
            for y in 0..self.size_y as i32 {
                for x in 0..self.size_x as i32 {
                    if src[y as usize * self.size_x as usize + x as usize] < lethal {
                        continue;
                    }
                    for dy in -inf..=inf {
                        for dx in -inf..=inf {
                            let Some(i) = self.idx(x + dx, y + dy) else { continue };
                            let d = ((dx * dx + dy * dy) as f64).sqrt();
                            let value = if d <= ins as f64 {
                                inscribed
                            } else if d <= inf as f64 {
                                let span = (inf - ins).max(1) as f64;
                                let frac = 1.0 - (d - ins as f64) / span;
                                (inscribed as f64 * 0.9 * frac) as u8
                            } else {
                                continue;
                            };
                            let dst = if layer == 0 {
                                &mut self.static_costs[i]
                            } else {
                                &mut self.live_costs[i]
                            };
                            *dst = (*dst).max(value);
                        }
                    }
                }
            }
        }
        self.revision += 1;
    }

    pub fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// A robot-centered window over a [`CostmapBuffer`], snapshotted once per
/// planning or control cycle. Cell coordinates are those of the buffer.
#[derive(Clone)]
pub struct CostmapView {
    pub ox: i32,
    pub oy: i32,
    pub w: u32,
    pub h: u32,
    pub resolution: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub thresholds: CostThresholds,
    costs: Vec<u8>,
}

impl CostmapView {
    pub fn empty() -> CostmapView {
        CostmapView {
            ox: 0,
            oy: 0,
            w: 0,
            h: 0,
            resolution: 1.0,
            origin_x: 0.0,
            origin_y: 0.0,
            thresholds: CostThresholds::default(),
            costs: Vec::new(),
        }
    }

    /// Re-snapshots a `map_size`-cell window centered on the robot and returns
    /// the cells (buffer coordinates) whose cost changed since the previous
    /// snapshot. Cells entering or leaving the window are not reported.
    pub fn refresh(&mut self, buf: &CostmapBuffer, center: &Pose, map_size: u32) -> Vec<(i32, i32)> {
        let (cx, cy) = match buf.world_to_cell(center.x, center.y) {
            Some(c) => c,
            None => (buf.size_x as i32 / 2, buf.size_y as i32 / 2),
        };
        let half = (map_size / 2) as i32;
        let ox = (cx - half).clamp(0, (buf.size_x as i32 - 1).max(0));
        let oy = (cy - half).clamp(0, (buf.size_y as i32 - 1).max(0));
        let w = map_size.min(buf.size_x - ox as u32);
        let h = map_size.min(buf.size_y - oy as u32);

        let mut changed = Vec::new();
        let mut costs = vec![FREE; (w * h) as usize];
        for y in 0..h as i32 {
            for x in 0..w as i32 {
                let bx = ox + x;
                let by = oy + y;
                let c = buf.cost(Layer::Live, bx, by).unwrap_or(buf.thresholds.lethal);
                costs[(y * w as i32 + x) as usize] = c;
                if let Some(prev) = self.cost(bx, by) {
                    if prev != c {
                        changed.push((bx, by));
                    }
                }
            }
        }
        self.ox = ox;
        self.oy = oy;
        self.w = w;
        self.h = h;
        self.resolution = buf.resolution;
        self.origin_x = buf.origin_x;
        self.origin_y = buf.origin_y;
        self.thresholds = buf.thresholds;
        self.costs = costs;
        changed
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.ox && y >= self.oy && x < self.ox + self.w as i32 && y < self.oy + self.h as i32
    }

    /// Cost of a buffer cell, or `None` when it lies outside the window.
    pub fn cost(&self, x: i32, y: i32) -> Option<u8> {
        if !self.contains(x, y) {
            return None;
        }
        let lx = (x - self.ox) as usize;
        let ly = (y - self.oy) as usize;
        Some(self.costs[ly * self.w as usize + lx])
    }

    pub fn cost_at_world(&self, wx: f64, wy: f64) -> Option<u8> {
        let x = ((wx - self.origin_x) / self.resolution).floor() as i32;
        let y = ((wy - self.origin_y) / self.resolution).floor() as i32;
        self.cost(x, y)
    }

    pub fn world_to_cell(&self, wx: f64, wy: f64) -> (i32, i32) {
        (
            ((wx - self.origin_x) / self.resolution).floor() as i32,
            ((wy - self.origin_y) / self.resolution).floor() as i32,
        )
    }

    pub fn cell_to_world(&self, x: i32, y: i32) -> (f64, f64) {
        (
            self.origin_x + (x as f64 + 0.5) * self.resolution,
            self.origin_y + (y as f64 + 0.5) * self.resolution,
        )
    }

    pub fn cell_count(&self) -> usize {
        (self.w * self.h) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> CostmapBuffer {
        CostmapBuffer::new(100, 100, 0.05, 0.0, 0.0)
    }

    #[test]
    fn stamp_and_clear_affect_only_the_live_layer() {
        let mut buf = buffer();
        buf.stamp_rect(1.0, 1.0, 1.2, 1.2, 254);
        let (x, y) = buf.world_to_cell(1.1, 1.1).unwrap();
        assert_eq!(buf.cost(Layer::Live, x, y), Some(254));
        assert_eq!(buf.cost(Layer::Static, x, y), Some(FREE));
        buf.clear_rect(0.9, 0.9, 1.3, 1.3);
        assert_eq!(buf.cost(Layer::Live, x, y), Some(FREE));
    }

    #[test]
    fn view_reports_changed_cells_on_refresh() {
        let mut buf = buffer();
        let mut view = CostmapView::empty();
        let robot = Pose::new(2.5, 2.5, 0.0);
        let changed = view.refresh(&buf, &robot, 100);
        assert!(changed.is_empty()); // first snapshot has no history

        buf.stamp_rect(2.0, 2.0, 2.1, 2.1, 200);
        let changed = view.refresh(&buf, &robot, 100);
        assert!(!changed.is_empty());
        for (x, y) in &changed {
            assert_eq!(view.cost(*x, *y), Some(200));
        }
        // a refresh without any mutation reports nothing
        assert!(view.refresh(&buf, &robot, 100).is_empty());
    }

    #[test]
    fn out_of_window_queries_return_none() {
        let buf = buffer();
        let mut view = CostmapView::empty();
        view.refresh(&buf, &Pose::new(0.0, 0.0, 0.0), 20);
        assert_eq!(view.cost(50, 50), None);
        assert!(view.cost(5, 5).is_some());
    }
}
