//! Axis-aligned bounding box

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create AABB from center and half-extents
    pub fn from_center_half_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    /// Empty box ready to accumulate points via `expand`
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    /// True if no point was ever added to an `empty()` box
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Get half-extents
    pub fn half_extent(&self) -> Vec3 {
        self.size() * 0.5
    }

    /// Check if point is inside AABB
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x &&
        p.y >= self.min.y && p.y <= self.max.y &&
        p.z >= self.min.z && p.z <= self.max.z
    }

    /// Check if two AABBs intersect
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y &&
        self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Expand AABB to include point
    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Grow the box outward by a margin on every face
    pub fn inflate(&self, margin: Vec3) -> Aabb {
        Aabb {
            min: self.min - margin,
            max: self.max + margin,
        }
    }

    /// Distance from a point to the box surface (0 inside)
    pub fn distance_to_point(&self, p: Vec3) -> f32 {
        let clamped = p.clamp(self.min, self.max);
        p.distance(clamped)
    }

    /// Get child octant AABB for octree subdivision.
    ///
    /// index: 0-7 with bit 2 = x-high, bit 1 = y-high, bit 0 = z-high.
    pub fn child_octant(&self, index: u8) -> Aabb {
        debug_assert!(index < 8);
        let half = self.half_extent();
        let offset = Vec3::new(
            if index & 4 != 0 { half.x } else { 0.0 },
            if index & 2 != 0 { half.y } else { 0.0 },
            if index & 1 != 0 { half.z } else { 0.0 },
        );
        let min = self.min + offset;
        Aabb { min, max: min + half }
    }

    /// Octant index of a point relative to the box center.
    ///
    /// Inverse of `child_octant`: the returned index selects the octant
    /// whose box contains the point.
    pub fn octant_of_point(&self, p: Vec3) -> u8 {
        let c = self.center();
        (if p.x > c.x { 4 } else { 0 })
            | (if p.y > c.y { 2 } else { 0 })
            | (if p.z > c.z { 1 } else { 0 })
    }
}
