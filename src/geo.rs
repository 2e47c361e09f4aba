// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Geometry over the 31-bit tile coordinate space used by OBF files.
//!
//! A position is stored as a pair of `x31, y31` integers, which are
//! [slippy map tile numbers](https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames)
//! at zoom level 31. Two kinds of distances are used: a fast "tile metric"
//! (a flat approximation, good enough for comparisons and heuristics), and the
//! [haversine](https://en.wikipedia.org/wiki/Haversine_formula) distance
//! for everything presented to the user.

use std::f64::consts::PI;

/// Earth radius used by the haversine formula, in kilometers.
const EARTH_RADIUS: f64 = 6372.8;

/// Number of tiles along one axis at zoom 31.
const TILES_31: f64 = 2147483648.0;

/// Maximum latitude representable in the web mercator projection.
const MAX_LATITUDE: f64 = 85.0511;

/// Meters per x31 unit in the tile metric.
const X31_TO_METERS: f64 = 0.011;

/// Meters per y31 unit in the tile metric.
const Y31_TO_METERS: f64 = 0.01863;

/// Calculates the great-circle distance between two lat-lon positions
/// on Earth using the haversine formula. Returns the result in meters.
pub fn earth_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let sin_dlat_half = ((lat2 - lat1).to_radians() * 0.5).sin();
    let sin_dlon_half = ((lon2 - lon1).to_radians() * 0.5).sin();

    let h = sin_dlat_half * sin_dlat_half
        + lat1.to_radians().cos() * lat2.to_radians().cos() * sin_dlon_half * sin_dlon_half;

    2.0 * EARTH_RADIUS * 1000.0 * h.sqrt().asin()
}

/// Packs a 31-bit position into a single 62-bit key, `(x31 << 31) + y31`.
#[inline]
pub fn pack_point(x: i32, y: i32) -> u64 {
    ((x as u64) << 31) + (y as u32 as u64)
}

/// Converts an x31 tile number into a longitude.
pub fn get_31_longitude_x(x: i32) -> f64 {
    x as f64 / TILES_31 * 360.0 - 180.0
}

/// Converts a y31 tile number into a latitude.
pub fn get_31_latitude_y(y: i32) -> f64 {
    (PI * (1.0 - 2.0 * y as f64 / TILES_31)).sinh().atan().to_degrees()
}

/// Converts a longitude into an x31 tile number.
pub fn get_31_tile_number_x(lon: f64) -> i32 {
    let lon = check_longitude(lon);
    ((lon + 180.0) / 360.0 * TILES_31) as i64 as i32
}

/// Converts a latitude into an y31 tile number.
pub fn get_31_tile_number_y(lat: f64) -> i32 {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let eval = (lat.tan() + 1.0 / lat.cos()).ln().min(PI);
    ((1.0 - eval / PI) / 2.0 * TILES_31) as i64 as i32
}

fn check_longitude(mut lon: f64) -> f64 {
    while lon < -180.0 || lon > 180.0 {
        if lon < 0.0 {
            lon += 360.0;
        } else {
            lon -= 360.0;
        }
    }
    lon
}

/// Horizontal difference `x1 - x2` in the tile metric, in meters.
#[inline]
pub fn convert_31_x_to_meters(x1: i32, x2: i32) -> f64 {
    (x1 as f64 - x2 as f64) * X31_TO_METERS
}

/// Vertical difference `y1 - y2` in the tile metric, in meters.
#[inline]
pub fn convert_31_y_to_meters(y1: i32, y2: i32) -> f64 {
    (y1 as f64 - y2 as f64) * Y31_TO_METERS
}

/// Squared tile-metric distance between two points, in square meters.
pub fn square_dist_31_tile_metric(x1: i32, y1: i32, x2: i32, y2: i32) -> f64 {
    let dx = convert_31_x_to_meters(x1, x2);
    let dy = convert_31_y_to_meters(y1, y2);
    dx * dx + dy * dy
}

/// Tile-metric distance between two points, in meters.
pub fn square_root_dist_31(x1: i32, y1: i32, x2: i32, y2: i32) -> f64 {
    square_dist_31_tile_metric(x1, y1, x2, y2).sqrt()
}

/// Haversine distance between two 31-bit points, in meters.
pub fn measured_dist_31(x1: i32, y1: i32, x2: i32, y2: i32) -> f64 {
    earth_distance(
        get_31_latitude_y(y1),
        get_31_longitude_x(x1),
        get_31_latitude_y(y2),
        get_31_longitude_x(x2),
    )
}

/// Scalar product of vectors AB and AC, in the tile metric.
pub fn calculate_projection_31_tile_metric(
    xa: i32,
    ya: i32,
    xb: i32,
    yb: i32,
    xc: i32,
    yc: i32,
) -> f64 {
    convert_31_x_to_meters(xb, xa) * convert_31_x_to_meters(xc, xa)
        + convert_31_y_to_meters(yb, ya) * convert_31_y_to_meters(yc, ya)
}

/// Projects point P onto the segment AB, returning the closest point of the segment.
pub fn get_projection_point(px: i32, py: i32, xa: i32, ya: i32, xb: i32, yb: i32) -> (i32, i32) {
    let m_dist_sq = square_dist_31_tile_metric(xa, ya, xb, yb);
    let projection = calculate_projection_31_tile_metric(xa, ya, xb, yb, px, py);
    if projection < 0.0 {
        (xa, ya)
    } else if projection >= m_dist_sq {
        (xb, yb)
    } else {
        let c = projection / m_dist_sq;
        (
            (xa as f64 + (xb as f64 - xa as f64) * c) as i32,
            (ya as f64 + (yb as f64 - ya as f64) * c) as i32,
        )
    }
}

/// Wraps an angle difference (in radians) into the `(-π, π]` range.
pub fn align_angle_difference(mut diff: f64) -> f64 {
    while diff > PI {
        diff -= 2.0 * PI;
    }
    while diff <= -PI {
        diff += 2.0 * PI;
    }
    diff
}

/// Difference `a1 - a2` between two bearings in degrees, wrapped into `(-180, 180]`.
pub fn degrees_diff(a1: f64, a2: f64) -> f64 {
    let mut diff = a1 - a2;
    while diff > 180.0 {
        diff -= 360.0;
    }
    while diff <= -180.0 {
        diff += 360.0;
    }
    diff
}

/// Returns the x coordinate where the segment (prev, cur) crosses the horizontal
/// line at `middle_y`, or `None` if it doesn't cross it. Used for even-odd
/// point-in-polygon tests.
pub fn ray_intersect_x(
    mut prev_x: i32,
    mut prev_y: i32,
    mut x: i32,
    mut y: i32,
    mut middle_y: i32,
) -> Option<i32> {
    if prev_y > y {
        std::mem::swap(&mut prev_x, &mut x);
        std::mem::swap(&mut prev_y, &mut y);
    }
    if y == middle_y || prev_y == middle_y {
        middle_y -= 1;
    }
    if prev_y > middle_y || y < middle_y {
        return None;
    }
    if y == prev_y {
        return Some(x);
    }
    let rx = x as f64 + (middle_y as f64 - y as f64) * (x as f64 - prev_x as f64) / (y as f64 - prev_y as f64);
    Some(rx as i32)
}

/// Checks whether segments (1, 2) and (3, 4) properly intersect.
pub fn lines_intersect(
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    x3: f64,
    y3: f64,
    x4: f64,
    y4: f64,
) -> bool {
    let d = (y4 - y3) * (x2 - x1) - (x4 - x3) * (y2 - y1);
    if d == 0.0 {
        return false;
    }
    let ua = ((x4 - x3) * (y1 - y3) - (y4 - y3) * (x1 - x3)) / d;
    let ub = ((x2 - x1) * (y1 - y3) - (y2 - y1) * (x1 - x3)) / d;
    ua > 0.0 && ua < 1.0 && ub > 0.0 && ub < 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! assert_almost_eq {
        ($a:expr, $b:expr, $eps:expr) => {
            assert!(
                (($a - $b).abs() < $eps),
                "assertion failed: {} ≈ {}",
                $a,
                $b
            )
        };
    }

    #[test]
    fn earth_distance_known_pair() {
        let d = earth_distance(52.2288, 21.0036, 52.2513, 21.0527);
        assert_almost_eq!(d, 4_177.0, 10.0);
    }

    #[test]
    fn tile_round_trip() {
        let x = get_31_tile_number_x(21.0036);
        let y = get_31_tile_number_y(52.2288);
        assert_almost_eq!(get_31_longitude_x(x), 21.0036, 1e-6);
        assert_almost_eq!(get_31_latitude_y(y), 52.2288, 1e-6);
    }

    #[test]
    fn packed_points_are_unique() {
        assert_ne!(pack_point(1, 0), pack_point(0, 1));
        assert_eq!(pack_point(3, 5), (3u64 << 31) + 5);
    }

    #[test]
    fn projection_clamps_to_segment() {
        assert_eq!(get_projection_point(-10, 5, 0, 0, 100, 0), (0, 0));
        assert_eq!(get_projection_point(200, 5, 0, 0, 100, 0), (100, 0));
        let (x, y) = get_projection_point(40, 30, 0, 0, 100, 0);
        assert!((x - 40).abs() <= 1);
        assert_eq!(y, 0);
    }

    #[test]
    fn angle_wrapping() {
        assert_almost_eq!(align_angle_difference(3.0 * PI / 2.0), -PI / 2.0, 1e-9);
        assert_almost_eq!(align_angle_difference(-PI), PI, 1e-9);
        assert_almost_eq!(degrees_diff(350.0, 10.0), -20.0, 1e-9);
        assert_almost_eq!(degrees_diff(-180.0, 0.0), 180.0, 1e-9);
    }

    #[test]
    fn ray_crossing() {
        assert_eq!(ray_intersect_x(0, 0, 10, 10, 5), Some(5));
        assert_eq!(ray_intersect_x(0, 0, 10, 10, 20), None);
    }

    #[test]
    fn segment_intersection() {
        assert!(lines_intersect(0.0, 0.0, 10.0, 10.0, 0.0, 10.0, 10.0, 0.0));
        assert!(!lines_intersect(0.0, 0.0, 10.0, 0.0, 0.0, 1.0, 10.0, 1.0));
    }
}
