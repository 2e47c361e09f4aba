// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use crate::geo::{get_31_latitude_y, get_31_longitude_x, get_31_tile_number_x, get_31_tile_number_y};

/// A point in the 31-bit tile coordinate space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointI {
    pub x: i32,
    pub y: i32,
}

impl PointI {
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn from_lat_lon(lat: f64, lon: f64) -> Self {
        Self::new(get_31_tile_number_x(lon), get_31_tile_number_y(lat))
    }

    /// Returns the `(latitude, longitude)` of the point.
    pub fn lat_lon(&self) -> (f64, f64) {
        (get_31_latitude_y(self.y), get_31_longitude_x(self.x))
    }
}

/// Axis-aligned bounding box in the 31-bit tile coordinate space.
/// All edges are inclusive; `top <= bottom` as y31 grows southwards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AreaI {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl AreaI {
    #[inline]
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Area covered by the tile `(x, y)` at the given zoom.
    pub fn from_tile(zoom: u8, x: i32, y: i32) -> Self {
        let shift = 31 - zoom as u32;
        let left = x << shift;
        let top = y << shift;
        let size = (1i64 << shift) - 1;
        Self::new(
            left,
            top,
            (left as i64 + size).min(i32::MAX as i64) as i32,
            (top as i64 + size).min(i32::MAX as i64) as i32,
        )
    }

    /// Smallest area containing both points.
    pub fn from_points(a: PointI, b: PointI) -> Self {
        Self::new(a.x.min(b.x), a.y.min(b.y), a.x.max(b.x), a.y.max(b.y))
    }

    #[inline]
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.left <= x && x <= self.right && self.top <= y && y <= self.bottom
    }

    /// Checks whether `other` lies completely inside this area.
    #[inline]
    pub fn contains(&self, other: &AreaI) -> bool {
        self.left <= other.left
            && other.right <= self.right
            && self.top <= other.top
            && other.bottom <= self.bottom
    }

    /// Checks whether both areas share at least one point. This includes the cases
    /// where one area contains the other; only strictly disjoint areas are rejected.
    #[inline]
    pub fn intersects(&self, other: &AreaI) -> bool {
        !(other.right < self.left
            || other.left > self.right
            || other.bottom < self.top
            || other.top > self.bottom)
    }

    pub fn enlarge_to_include(&mut self, other: &AreaI) {
        self.left = self.left.min(other.left);
        self.top = self.top.min(other.top);
        self.right = self.right.max(other.right);
        self.bottom = self.bottom.max(other.bottom);
    }

    pub fn enlarge_to_include_point(&mut self, x: i32, y: i32) {
        self.left = self.left.min(x);
        self.top = self.top.min(y);
        self.right = self.right.max(x);
        self.bottom = self.bottom.max(y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_includes_containment() {
        let outer = AreaI::new(0, 0, 100, 100);
        let inner = AreaI::new(10, 10, 20, 20);
        let overlapping = AreaI::new(90, 90, 200, 200);
        let touching = AreaI::new(100, 0, 150, 50);
        let disjoint = AreaI::new(101, 0, 150, 50);

        assert!(outer.intersects(&inner));
        assert!(inner.intersects(&outer));
        assert!(outer.intersects(&overlapping));
        assert!(outer.intersects(&touching));
        assert!(!outer.intersects(&disjoint));

        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(!outer.contains(&overlapping));
    }

    #[test]
    fn tile_area() {
        let a = AreaI::from_tile(30, 1, 2);
        assert_eq!(a, AreaI::new(2, 4, 3, 5));
        let world = AreaI::from_tile(0, 0, 0);
        assert_eq!(world, AreaI::new(0, 0, i32::MAX, i32::MAX));
    }
}
