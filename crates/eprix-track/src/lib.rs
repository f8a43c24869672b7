//! Closed-circuit track descriptors and sampled geometry for the eprix simulator.
//!
//! A [`Track`] is built once from an ordered list of [`Segment`]s, validated for
//! closure, and then shared read-only for the lifetime of a simulation. The
//! constructor precomputes a cumulative-length table for `O(log n)` segment
//! lookup and a fixed-spacing geometry table mapping arc length to world
//! position, heading, and signed curvature.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard gravity in m/s². Shared single source of truth for the workspace.
pub const GRAVITY: f64 = 9.81;

/// Arc-length spacing of the precomputed geometry table, in metres.
pub const GEOMETRY_SAMPLE_SPACING: f64 = 1.0;

/// Maximum tolerated heading mismatch (radians) between track start and end.
const CLOSURE_HEADING_EPSILON: f64 = 1e-3;

/// Errors raised while validating a track descriptor.
#[derive(Debug, Error, PartialEq)]
pub enum TrackError {
    /// The segment list was empty.
    #[error("track must contain at least one segment")]
    Empty,
    /// A segment had a zero or negative length.
    #[error("segment {index} has non-positive length {length}")]
    NonPositiveLength { index: usize, length: f64 },
    /// A corner or chicane had an unusable radius.
    #[error("segment {index} has invalid radius {radius}; corners need a positive finite radius")]
    InvalidRadius { index: usize, radius: f64 },
    /// A segment's surface grip multiplier fell outside the calibrated band.
    #[error("segment {index} grip multiplier {grip} outside 0.9..=1.1")]
    GripOutOfRange { index: usize, grip: f64 },
    /// The loop does not close: heading at the end differs from the start.
    #[error("track does not close: final heading off by {mismatch} rad")]
    OpenLoop { mismatch: f64 },
}

/// Segment classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    Straight,
    LeftCorner,
    RightCorner,
    /// Two curvature reversals of equal magnitude summing to zero net turn.
    Chicane,
}

impl SegmentKind {
    /// Returns true for left/right corners (not chicanes).
    #[must_use]
    pub const fn is_corner(self) -> bool {
        matches!(self, Self::LeftCorner | Self::RightCorner)
    }

    /// Returns true for anything with finite curvature somewhere along it.
    #[must_use]
    pub const fn is_curved(self) -> bool {
        !matches!(self, Self::Straight)
    }
}

/// One element of the circuit. All units are SI (metres, radians).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Arc length in metres.
    pub length: f64,
    /// Turn radius in metres; `f64::INFINITY` for straights.
    pub radius: f64,
    /// Banking angle in radians (positive banks into the corner).
    pub banking: f64,
    /// Road camber in radians.
    pub camber: f64,
    /// Elevation gained over the segment, metres (positive is uphill).
    pub elevation_delta: f64,
    /// Surface grip multiplier, calibrated to 0.9..=1.1.
    pub grip_multiplier: f64,
    /// Authored reference speed for the segment, m/s.
    pub ideal_speed: f64,
    /// Whether attack mode may be armed while inside this segment.
    pub in_attack_zone: bool,
}

impl Segment {
    /// Convenience constructor for a flat straight.
    #[must_use]
    pub fn straight(length: f64, ideal_speed: f64) -> Self {
        Self {
            kind: SegmentKind::Straight,
            length,
            radius: f64::INFINITY,
            banking: 0.0,
            camber: 0.0,
            elevation_delta: 0.0,
            grip_multiplier: 1.0,
            ideal_speed,
            in_attack_zone: false,
        }
    }

    /// Convenience constructor for a constant-radius corner.
    #[must_use]
    pub fn corner(kind: SegmentKind, length: f64, radius: f64, ideal_speed: f64) -> Self {
        Self {
            kind,
            length,
            radius,
            banking: 0.0,
            camber: 0.0,
            elevation_delta: 0.0,
            grip_multiplier: 1.0,
            ideal_speed,
            in_attack_zone: false,
        }
    }

    /// Net heading change contributed by this segment, radians.
    #[must_use]
    pub fn turn_angle(&self) -> f64 {
        match self.kind {
            SegmentKind::Straight | SegmentKind::Chicane => 0.0,
            SegmentKind::LeftCorner => self.length / self.radius,
            SegmentKind::RightCorner => -self.length / self.radius,
        }
    }

    /// Road gradient angle, radians, derived from the elevation delta.
    #[must_use]
    pub fn gradient_angle(&self) -> f64 {
        if self.length > 0.0 {
            (self.elevation_delta / self.length).atan()
        } else {
            0.0
        }
    }

    /// Signed curvature at `local_s` metres into the segment (left positive).
    #[must_use]
    pub fn curvature_at(&self, local_s: f64) -> f64 {
        match self.kind {
            SegmentKind::Straight => 0.0,
            SegmentKind::LeftCorner => 1.0 / self.radius,
            SegmentKind::RightCorner => -1.0 / self.radius,
            SegmentKind::Chicane => {
                if local_s < self.length * 0.5 {
                    1.0 / self.radius
                } else {
                    -1.0 / self.radius
                }
            }
        }
    }
}

/// Interpolated geometry at a point along the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeomPoint {
    pub x: f64,
    pub y: f64,
    /// Heading in radians, wrapped to `(-PI, PI]`.
    pub heading: f64,
    /// Signed curvature in 1/m (left positive, 0 on straights).
    pub curvature: f64,
}

/// Maximum cornering speed from the lateral force balance.
///
/// `v = sqrt(mu_eff * g * r * (1 + 0.5 * tan(banking)))`, capped at `v_max`.
/// An infinite radius (straight) returns `v_max`; degenerate inputs return 0
/// rather than NaN so a hairpin request saturates the brakes instead of
/// poisoning the state.
#[must_use]
pub fn corner_speed_limit(radius: f64, mu_eff: f64, banking: f64, v_max: f64) -> f64 {
    if radius.is_infinite() {
        return v_max;
    }
    let bank_factor = 1.0 + 0.5 * banking.tan();
    let v = (mu_eff * GRAVITY * radius * bank_factor).max(0.0).sqrt();
    v.min(v_max)
}

/// Wraps an angle to `(-PI, PI]`.
#[must_use]
pub fn wrap_angle(theta: f64) -> f64 {
    let two_pi = std::f64::consts::TAU;
    let wrapped = theta.rem_euclid(two_pi);
    if wrapped > std::f64::consts::PI {
        wrapped - two_pi
    } else {
        wrapped
    }
}

/// Pose carried across segment boundaries while walking the circuit.
#[derive(Debug, Clone, Copy)]
struct Pose {
    x: f64,
    y: f64,
    /// Unwrapped cumulative heading.
    heading: f64,
}

/// Immutable closed-circuit descriptor with precomputed lookup tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    segments: Vec<Segment>,
    total_length: f64,
    /// Cumulative arc length at the start of each segment.
    cumulative: Vec<f64>,
    /// Geometry samples at `GEOMETRY_SAMPLE_SPACING` plus one at `total_length`.
    samples: Vec<GeomSample>,
    attack_zones: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct GeomSample {
    s: f64,
    x: f64,
    y: f64,
    /// Unwrapped heading so interpolation never crosses a wrap seam.
    heading: f64,
}

impl Track {
    /// Validates the segment list and builds the lookup tables.
    pub fn new(segments: Vec<Segment>) -> Result<Self, TrackError> {
        if segments.is_empty() {
            return Err(TrackError::Empty);
        }
        let mut total_turn = 0.0;
        for (index, segment) in segments.iter().enumerate() {
            if segment.length <= 0.0 || !segment.length.is_finite() {
                return Err(TrackError::NonPositiveLength {
                    index,
                    length: segment.length,
                });
            }
            if segment.kind.is_curved()
                && (!segment.radius.is_finite() || segment.radius <= 0.0)
            {
                return Err(TrackError::InvalidRadius {
                    index,
                    radius: segment.radius,
                });
            }
            if !(0.9..=1.1).contains(&segment.grip_multiplier) {
                return Err(TrackError::GripOutOfRange {
                    index,
                    grip: segment.grip_multiplier,
                });
            }
            total_turn += segment.turn_angle();
        }
        let mismatch = wrap_angle(total_turn);
        if mismatch.abs() > CLOSURE_HEADING_EPSILON {
            return Err(TrackError::OpenLoop { mismatch });
        }

        let mut cumulative = Vec::with_capacity(segments.len());
        let mut total_length = 0.0;
        for segment in &segments {
            cumulative.push(total_length);
            total_length += segment.length;
        }

        let mut attack_zones = Vec::new();
        for (start, segment) in cumulative.iter().zip(&segments) {
            if segment.in_attack_zone {
                attack_zones.push((*start, start + segment.length));
            }
        }

        let samples = Self::build_samples(&segments, total_length);

        Ok(Self {
            segments,
            total_length,
            cumulative,
            samples,
            attack_zones,
        })
    }

    fn build_samples(segments: &[Segment], total_length: f64) -> Vec<GeomSample> {
        // Segment-start poses are computed exactly so sampling error never
        // accumulates across the circuit.
        let mut starts = Vec::with_capacity(segments.len());
        let mut pose = Pose {
            x: 0.0,
            y: 0.0,
            heading: 0.0,
        };
        for segment in segments {
            starts.push(pose);
            pose = advance_pose(pose, segment, segment.length);
        }

        let count = (total_length / GEOMETRY_SAMPLE_SPACING).ceil() as usize;
        let mut samples = Vec::with_capacity(count + 1);
        let mut seg_index = 0usize;
        let mut seg_start = 0.0;
        for i in 0..count {
            let s = i as f64 * GEOMETRY_SAMPLE_SPACING;
            while seg_index + 1 < segments.len()
                && s >= seg_start + segments[seg_index].length
            {
                seg_start += segments[seg_index].length;
                seg_index += 1;
            }
            let local = s - seg_start;
            let p = advance_pose(starts[seg_index], &segments[seg_index], local);
            samples.push(GeomSample {
                s,
                x: p.x,
                y: p.y,
                heading: p.heading,
            });
        }
        samples.push(GeomSample {
            s: total_length,
            x: pose.x,
            y: pose.y,
            heading: pose.heading,
        });
        samples
    }

    /// Total circuit length in metres.
    #[must_use]
    pub fn total_length(&self) -> f64 {
        self.total_length
    }

    /// The ordered segment catalog.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Attack-mode arming windows as `(start_s, end_s)` ranges.
    #[must_use]
    pub fn attack_zones(&self) -> &[(f64, f64)] {
        &self.attack_zones
    }

    /// Segment index and local offset containing arc length `s` (wrapped).
    #[must_use]
    pub fn segment_index_at(&self, s: f64) -> (usize, f64) {
        let s = s.rem_euclid(self.total_length);
        let index = self
            .cumulative
            .partition_point(|&start| start <= s)
            .saturating_sub(1);
        (index, s - self.cumulative[index])
    }

    /// Segment and local offset containing arc length `s`.
    #[must_use]
    pub fn segment_at(&self, s: f64) -> (&Segment, f64) {
        let (index, local) = self.segment_index_at(s);
        (&self.segments[index], local)
    }

    /// Surface grip multiplier at `s`.
    #[must_use]
    pub fn grip_at(&self, s: f64) -> f64 {
        self.segment_at(s).0.grip_multiplier
    }

    /// Authored reference speed at `s`, m/s.
    #[must_use]
    pub fn ideal_speed_at(&self, s: f64) -> f64 {
        self.segment_at(s).0.ideal_speed
    }

    /// Whether `s` lies inside an attack-mode arming zone.
    #[must_use]
    pub fn in_attack_zone(&self, s: f64) -> bool {
        self.segment_at(s).0.in_attack_zone
    }

    /// Interpolated world geometry at arc length `s` (wrapped).
    #[must_use]
    pub fn geometry_at(&self, s: f64) -> GeomPoint {
        let s = s.rem_euclid(self.total_length);
        let index = ((s / GEOMETRY_SAMPLE_SPACING) as usize).min(self.samples.len() - 2);
        let a = &self.samples[index];
        let b = &self.samples[index + 1];
        let span = b.s - a.s;
        let frac = if span > 0.0 { (s - a.s) / span } else { 0.0 };
        let (segment, local) = self.segment_at(s);
        GeomPoint {
            x: a.x + (b.x - a.x) * frac,
            y: a.y + (b.y - a.y) * frac,
            heading: wrap_angle(a.heading + (b.heading - a.heading) * frac),
            curvature: segment.curvature_at(local),
        }
    }
}

/// Advances a pose `local` metres into `segment` using exact arc geometry.
fn advance_pose(start: Pose, segment: &Segment, local: f64) -> Pose {
    match segment.kind {
        SegmentKind::Straight => Pose {
            x: start.x + local * start.heading.cos(),
            y: start.y + local * start.heading.sin(),
            heading: start.heading,
        },
        SegmentKind::LeftCorner => arc_pose(start, segment.radius, 1.0, local),
        SegmentKind::RightCorner => arc_pose(start, segment.radius, -1.0, local),
        SegmentKind::Chicane => {
            let half = segment.length * 0.5;
            if local <= half {
                arc_pose(start, segment.radius, 1.0, local)
            } else {
                let mid = arc_pose(start, segment.radius, 1.0, half);
                arc_pose(mid, segment.radius, -1.0, local - half)
            }
        }
    }
}

/// Exact position on a circular arc of `radius`, turning `dir` (+1 left).
fn arc_pose(start: Pose, radius: f64, dir: f64, local: f64) -> Pose {
    let center_angle = start.heading + dir * std::f64::consts::FRAC_PI_2;
    let cx = start.x + radius * center_angle.cos();
    let cy = start.y + radius * center_angle.sin();
    let swept = dir * local / radius;
    let from_center = center_angle + std::f64::consts::PI + swept;
    Pose {
        x: cx + radius * from_center.cos(),
        y: cy + radius * from_center.sin(),
        heading: start.heading + swept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_circuit() -> Vec<Segment> {
        // Four straights joined by four 90-degree left corners: closes exactly.
        let corner_len = 40.0 * std::f64::consts::FRAC_PI_2;
        let mut segments = Vec::new();
        for _ in 0..4 {
            segments.push(Segment::straight(250.0, 80.0));
            segments.push(Segment::corner(
                SegmentKind::LeftCorner,
                corner_len,
                40.0,
                24.0,
            ));
        }
        segments
    }

    #[test]
    fn square_circuit_closes() {
        let track = Track::new(square_circuit()).expect("track");
        let start = track.geometry_at(0.0);
        let end = track.geometry_at(track.total_length() - 1e-9);
        assert!((start.x - end.x).abs() < 0.5, "x: {} vs {}", start.x, end.x);
        assert!((start.y - end.y).abs() < 0.5, "y: {} vs {}", start.y, end.y);
        assert!(wrap_angle(start.heading - end.heading).abs() < 1e-3);
    }

    #[test]
    fn rejects_empty_and_degenerate_segments() {
        assert!(matches!(Track::new(Vec::new()), Err(TrackError::Empty)));

        let mut bad_len = square_circuit();
        bad_len[0].length = 0.0;
        assert!(matches!(
            Track::new(bad_len),
            Err(TrackError::NonPositiveLength { index: 0, .. })
        ));

        let mut bad_radius = square_circuit();
        bad_radius[1].radius = -5.0;
        assert!(matches!(
            Track::new(bad_radius),
            Err(TrackError::InvalidRadius { index: 1, .. })
        ));

        let mut bad_grip = square_circuit();
        bad_grip[2].grip_multiplier = 1.4;
        assert!(matches!(
            Track::new(bad_grip),
            Err(TrackError::GripOutOfRange { index: 2, .. })
        ));
    }

    #[test]
    fn open_loop_is_rejected() {
        let segments = vec![
            Segment::straight(500.0, 80.0),
            Segment::corner(SegmentKind::LeftCorner, 40.0 * std::f64::consts::FRAC_PI_2, 40.0, 24.0),
        ];
        assert!(matches!(
            Track::new(segments),
            Err(TrackError::OpenLoop { .. })
        ));
    }

    #[test]
    fn single_straight_wrap_is_permitted() {
        // Sprint layouts close purely through the distance wrap.
        let track = Track::new(vec![Segment::straight(1000.0, 89.0)]).expect("track");
        assert!((track.total_length() - 1000.0).abs() < 1e-12);
        let p = track.geometry_at(1250.0);
        assert!((p.x - 250.0).abs() < 1e-9);
        assert!(p.y.abs() < 1e-9);
    }

    #[test]
    fn segment_lookup_is_consistent() {
        let track = Track::new(square_circuit()).expect("track");
        let (index, local) = track.segment_index_at(0.0);
        assert_eq!(index, 0);
        assert!(local.abs() < 1e-12);

        let (index, local) = track.segment_index_at(260.0);
        assert_eq!(index, 1);
        assert!((local - 10.0).abs() < 1e-9);

        // Wrapping past the end lands back on the first segment.
        let (index, _) = track.segment_index_at(track.total_length() + 5.0);
        assert_eq!(index, 0);
    }

    #[test]
    fn corner_speed_limit_matches_closed_form() {
        let v = corner_speed_limit(50.0, 1.2, 0.0, 120.0);
        assert!((v - (1.2 * GRAVITY * 50.0).sqrt()).abs() < 1e-9);
        assert!((v - 24.26).abs() < 0.05);

        // Banking raises the limit.
        let banked = corner_speed_limit(50.0, 1.2, 0.2, 120.0);
        assert!(banked > v);

        // Straights are capped by v_max; hairpins collapse to zero, not NaN.
        assert_eq!(corner_speed_limit(f64::INFINITY, 1.2, 0.0, 89.4), 89.4);
        let hairpin = corner_speed_limit(0.0, 1.2, 0.0, 89.4);
        assert_eq!(hairpin, 0.0);
        assert!(!hairpin.is_nan());
    }

    #[test]
    fn chicane_reverses_curvature_and_keeps_heading() {
        let chicane = Segment::corner(SegmentKind::Chicane, 60.0, 28.0, 23.0);
        assert!(chicane.curvature_at(10.0) > 0.0);
        assert!(chicane.curvature_at(50.0) < 0.0);
        assert_eq!(chicane.turn_angle(), 0.0);

        let end = advance_pose(
            Pose {
                x: 0.0,
                y: 0.0,
                heading: 0.0,
            },
            &chicane,
            60.0,
        );
        assert!(end.heading.abs() < 1e-9, "chicane must restore heading");
        assert!(end.x > 0.0);
    }

    #[test]
    fn attack_zones_follow_segment_flags() {
        let mut segments = square_circuit();
        segments[2].in_attack_zone = true;
        let track = Track::new(segments).expect("track");
        assert_eq!(track.attack_zones().len(), 1);
        let (start, end) = track.attack_zones()[0];
        assert!(track.in_attack_zone(start + 1.0));
        assert!(!track.in_attack_zone(end + 1.0));
    }

    #[test]
    fn geometry_heading_follows_corners() {
        let track = Track::new(square_circuit()).expect("track");
        // Mid-way through the first corner the heading has turned ~45 degrees.
        let corner_mid = 250.0 + 40.0 * std::f64::consts::FRAC_PI_2 * 0.5;
        let p = track.geometry_at(corner_mid);
        assert!((p.heading - std::f64::consts::FRAC_PI_4).abs() < 0.05);
        assert!((p.curvature - 1.0 / 40.0).abs() < 1e-12);
    }

    #[test]
    fn ideal_speed_and_grip_lookups() {
        let track = Track::new(square_circuit()).expect("track");
        assert!((track.ideal_speed_at(10.0) - 80.0).abs() < 1e-12);
        assert!((track.ideal_speed_at(255.0) - 24.0).abs() < 1e-12);
        assert!((track.grip_at(10.0) - 1.0).abs() < 1e-12);
    }
}
