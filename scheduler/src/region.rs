// region.rs — Concrete regions and loop nests
//
// Intervals and multi-dimensional regions in concrete coordinates, the dense
// storage layout derived from a region, and `ConcreteNest`: a stage's loop
// nest with split factors evaluated for one realization, which yields the
// region of the stage covered by each loop iteration.
//
// Preconditions: the symbolic `LoopNest` comes from a validated schedule.
// Postconditions: `region_at` covers exactly the points visited by the loops
//                 inside the fixed prefix.
// Failure modes: non-positive split factors and unbound parameters.
// Side effects: none.

use std::fmt;

use crate::error::{Result, RuntimeError};
use crate::expr::{evaluate, ParamBindings};
use crate::schedule::{LoopNest, LoopRole};
use crate::stage::Stage;

// ── Intervals ───────────────────────────────────────────────────────────────

/// Half-open range `[min, min + extent)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub min: i64,
    pub extent: i64,
}

impl Interval {
    pub fn new(min: i64, extent: i64) -> Self {
        Interval { min, extent }
    }

    pub fn point(at: i64) -> Self {
        Interval { min: at, extent: 1 }
    }

    /// One past the last coordinate.
    pub fn end(&self) -> i64 {
        self.min + self.extent
    }

    /// Last coordinate (inclusive). Equals `min - 1` for an empty interval.
    pub fn max(&self) -> i64 {
        self.end() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.extent <= 0
    }

    pub fn shift(&self, offset: i64) -> Self {
        Interval::new(self.min + offset, self.extent)
    }

    /// Smallest interval containing both. Empty intervals contribute nothing.
    pub fn hull(&self, other: &Interval) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let min = self.min.min(other.min);
        let end = self.end().max(other.end());
        Interval::new(min, end - min)
    }

    pub fn contains(&self, coord: i64) -> bool {
        coord >= self.min && coord < self.end()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.end())
    }
}

// ── Regions ─────────────────────────────────────────────────────────────────

/// One interval per dimension, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub dims: Vec<Interval>,
}

impl Region {
    pub fn new(dims: Vec<Interval>) -> Self {
        Region { dims }
    }

    /// Region `[0, extent)` in every dimension.
    pub fn from_extents(extents: &[i64]) -> Self {
        Region::new(extents.iter().map(|&e| Interval::new(0, e)).collect())
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of points covered (0 if any dimension is empty), or `None`
    /// if the count does not fit in `usize`.
    pub fn checked_size(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, d| {
            acc.checked_mul(usize::try_from(d.extent.max(0)).ok()?)
        })
    }

    /// Like `checked_size`, saturating at `usize::MAX`.
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    pub fn hull(&self, other: &Region) -> Region {
        Region::new(
            self.dims
                .iter()
                .zip(&other.dims)
                .map(|(a, b)| a.hull(b))
                .collect(),
        )
    }

    pub fn contains(&self, coords: &[i64]) -> bool {
        coords.len() == self.dims.len()
            && self.dims.iter().zip(coords).all(|(d, &c)| d.contains(c))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, " x ")?;
            }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

// ── Layout ──────────────────────────────────────────────────────────────────

/// Dense element layout of a region: `stride[0] = 1`,
/// `stride[i] = stride[i-1] * extent[i-1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub region: Region,
    pub strides: Vec<usize>,
}

impl Layout {
    pub fn dense(region: Region) -> Self {
        let mut strides = Vec::with_capacity(region.rank());
        let mut stride = 1usize;
        for d in &region.dims {
            strides.push(stride);
            let extent = usize::try_from(d.extent.max(0)).unwrap_or(usize::MAX);
            stride = stride.saturating_mul(extent);
        }
        Layout { region, strides }
    }

    pub fn len(&self) -> usize {
        self.region.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element index of `coords`, or `None` outside the region.
    pub fn index_of(&self, coords: &[i64]) -> Option<usize> {
        if !self.region.contains(coords) {
            return None;
        }
        Some(
            self.region
                .dims
                .iter()
                .zip(&self.strides)
                .zip(coords)
                .map(|((d, &stride), &c)| (c - d.min) as usize * stride)
                .sum(),
        )
    }
}

// ── Concrete loop nest ──────────────────────────────────────────────────────

/// Evaluated form of one loop.
#[derive(Debug, Clone)]
pub enum ConcreteRole {
    /// Iterates the whole dimension.
    Whole,
    /// Iterates tiles of exactly `factor` points.
    Outer { factor: i64 },
    /// Iterates within one tile.
    Inner { factor: i64 },
}

#[derive(Debug, Clone)]
pub struct ConcreteLoop {
    pub var: String,
    pub dim: usize,
    pub role: ConcreteRole,
    /// First loop value.
    pub start: i64,
    /// Number of iterations.
    pub count: i64,
    pub parallel: bool,
}

impl ConcreteLoop {
    pub fn values(&self) -> std::ops::Range<i64> {
        self.start..self.start + self.count
    }
}

/// A stage's loop nest over one concrete region.
#[derive(Debug, Clone)]
pub struct ConcreteNest {
    pub region: Region,
    /// Outermost first.
    pub loops: Vec<ConcreteLoop>,
}

impl ConcreteNest {
    /// Evaluate split factors under `bindings` and bind the nest to `region`.
    ///
    /// Tails shift inwards: the last tile is moved back so it ends at the
    /// region's end. A factor larger than the extent gives a single tile
    /// that starts before the region's min; callers skip points outside
    /// `region`, but the tile's footprint keeps the full factor.
    pub fn new(
        stage: &Stage,
        nest: &LoopNest,
        region: &Region,
        bindings: &ParamBindings,
    ) -> Result<Self> {
        let mut loops = Vec::with_capacity(nest.loops.len());
        for lp in &nest.loops {
            let dom = region.dims[lp.dim];
            let (role, start, count) = match &lp.role {
                LoopRole::Whole => (ConcreteRole::Whole, dom.min, dom.extent.max(0)),
                LoopRole::Outer { factor } | LoopRole::Inner { factor } => {
                    let value = evaluate(factor, bindings)?;
                    if value <= 0 {
                        return Err(RuntimeError::NonPositiveSplitFactor {
                            stage: stage.name.clone(),
                            var: lp.var.clone(),
                            factor: value,
                        });
                    }
                    let extent = dom.extent.max(0);
                    if matches!(lp.role, LoopRole::Outer { .. }) {
                        let tiles = if extent == 0 {
                            0
                        } else {
                            (extent - 1) / value + 1
                        };
                        (ConcreteRole::Outer { factor: value }, 0, tiles)
                    } else {
                        (ConcreteRole::Inner { factor: value }, 0, value)
                    }
                }
            };
            loops.push(ConcreteLoop {
                var: lp.var.clone(),
                dim: lp.dim,
                role,
                start,
                count,
                parallel: lp.parallel,
            });
        }
        Ok(ConcreteNest {
            region: region.clone(),
            loops,
        })
    }

    /// Base coordinate of tile `outer` along `dim`.
    fn tile_base(&self, dim: usize, factor: i64, outer: i64) -> i64 {
        let dom = self.region.dims[dim];
        (dom.min + outer * factor).min(dom.end() - factor)
    }

    /// Region covered by all iterations of the loops after the fixed prefix.
    ///
    /// `fixed[i]` is the current value of `loops[i]`.
    pub fn region_at(&self, fixed: &[i64]) -> Region {
        let mut dims = self.region.dims.clone();
        for (pos, lp) in self.loops.iter().enumerate() {
            let Some(&value) = fixed.get(pos) else {
                break;
            };
            match lp.role {
                ConcreteRole::Whole => dims[lp.dim] = Interval::point(value),
                ConcreteRole::Outer { factor } => {
                    dims[lp.dim] = Interval::new(self.tile_base(lp.dim, factor, value), factor);
                }
                ConcreteRole::Inner { .. } => {
                    // The matching outer loop sits directly before this one.
                    dims[lp.dim] = Interval::point(dims[lp.dim].min + value);
                }
            }
        }
        Region::new(dims)
    }

    /// Coordinates of the point reached once every loop is fixed.
    pub fn coords(&self, fixed: &[i64]) -> Vec<i64> {
        self.region_at(fixed).dims.iter().map(|d| d.min).collect()
    }

    pub fn depth(&self) -> usize {
        self.loops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::schedule::ScheduleDescriptor;
    use crate::stage::{Definition, Stages};

    fn split_nest(factor: Expr, extent: i64, bindings: &ParamBindings) -> ConcreteNest {
        let mut stages = Stages::new();
        stages.define("g", &["x"], Definition::var("x")).unwrap();
        let mut schedule = ScheduleDescriptor::new();
        schedule.set_split("g", "x", "xo", "xi", factor);
        let g = stages.lookup("g").unwrap();
        let nest = schedule.loop_nest(g).unwrap();
        ConcreteNest::new(g, &nest, &Region::from_extents(&[extent]), bindings).unwrap()
    }

    #[test]
    fn interval_bounds() {
        let i = Interval::new(0, 8);
        assert_eq!(i.end(), 8);
        assert_eq!(i.max(), 7);
        assert!(i.contains(7));
        assert!(!i.contains(8));
        assert!(Interval::new(3, 0).is_empty());
    }

    #[test]
    fn hull_ignores_empty_intervals() {
        let a = Interval::new(-1, 4);
        let b = Interval::new(2, 5);
        assert_eq!(a.hull(&b), Interval::new(-1, 8));
        assert_eq!(Interval::new(100, 0).hull(&b), b);
    }

    #[test]
    fn dense_layout_strides() {
        let layout = Layout::dense(Region::new(vec![Interval::new(2, 4), Interval::new(-1, 3)]));
        assert_eq!(layout.strides, vec![1, 4]);
        assert_eq!(layout.len(), 12);
        assert_eq!(layout.index_of(&[2, -1]), Some(0));
        assert_eq!(layout.index_of(&[5, 1]), Some(11));
        assert_eq!(layout.index_of(&[6, 1]), None);
    }

    #[test]
    fn oversized_regions_do_not_overflow() {
        let huge = Region::new(vec![Interval::new(0, i64::MAX / 2), Interval::new(0, 16)]);
        assert_eq!(huge.checked_size(), None);
        assert_eq!(huge.size(), usize::MAX);
        assert_eq!(Region::from_extents(&[3, 0, 5]).checked_size(), Some(0));
        assert_eq!(Layout::dense(huge).strides, vec![1, (i64::MAX / 2) as usize]);
    }

    #[test]
    fn split_divides_evenly() {
        let nest = split_nest(Expr::param("p"), 20, &[("p", 5)].into_iter().collect());
        assert_eq!(nest.loops[0].count, 4);
        assert_eq!(nest.loops[1].count, 5);
        assert_eq!(nest.region_at(&[2]), Region::new(vec![Interval::new(10, 5)]));
        assert_eq!(nest.coords(&[2, 3]), vec![13]);
    }

    #[test]
    fn split_tail_shifts_inwards() {
        let nest = split_nest(Expr::constant(8), 20, &ParamBindings::new());
        assert_eq!(nest.loops[0].count, 3);
        assert_eq!(nest.region_at(&[2]), Region::new(vec![Interval::new(12, 8)]));
    }

    #[test]
    fn oversized_factor_gives_single_shifted_tile() {
        let nest = split_nest(Expr::constant(32), 20, &ParamBindings::new());
        assert_eq!(nest.loops[0].count, 1);
        assert_eq!(nest.loops[1].count, 32);
        assert_eq!(nest.region_at(&[0]), Region::new(vec![Interval::new(-12, 32)]));
        assert_eq!(nest.coords(&[0, 12]), vec![0]);
    }

    #[test]
    fn non_positive_factor_is_rejected() {
        let mut stages = Stages::new();
        stages.define("g", &["x"], Definition::var("x")).unwrap();
        let mut schedule = ScheduleDescriptor::new();
        schedule.set_split("g", "x", "xo", "xi", Expr::param("p"));
        let g = stages.lookup("g").unwrap();
        let nest = schedule.loop_nest(g).unwrap();
        let err = ConcreteNest::new(
            g,
            &nest,
            &Region::from_extents(&[20]),
            &[("p", 0)].into_iter().collect(),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::NonPositiveSplitFactor { factor: 0, .. }));
    }
}
