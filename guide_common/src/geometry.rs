//! Planar geometry for camera and mount vectors.
//!
//! Camera offsets are measured in pixels with +x to the right and +y down
//! the sensor. Mount offsets use the same pixel scale projected on the RA (x)
//! and Dec (y) axes.

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// A 2-D vector in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    /// The null vector.
    pub const ORIGIN: Self = Self { x: 0.0, y: 0.0 };

    #[inline]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// True when both components are finite numbers.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Euclidean length.
    #[inline]
    pub fn magnitude(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Direction of the vector in radians, 0 for the null vector.
    #[inline]
    pub fn angle(&self) -> f64 {
        if self.x == 0.0 && self.y == 0.0 {
            0.0
        } else {
            self.y.atan2(self.x)
        }
    }

    /// Distance between two points.
    #[inline]
    pub fn distance(&self, other: &Point) -> f64 {
        (*self - *other).magnitude()
    }

    /// Direction of the displacement that leads from `other` to `self`.
    #[inline]
    pub fn angle_from(&self, other: &Point) -> f64 {
        (*self - *other).angle()
    }

    /// Unit vector, or `None` for the null vector.
    pub fn unit(&self) -> Option<Point> {
        let len = self.magnitude();
        (len > 0.0).then(|| Point::new(self.x / len, self.y / len))
    }

    #[inline]
    pub fn dot(&self, other: &Point) -> f64 {
        self.x * other.x + self.y * other.y
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point {
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Point {
    type Output = Point;
    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;
    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

/// Normalize an angle into `(-π, π]`.
pub fn norm_angle(angle: f64) -> f64 {
    let mut a = angle % TAU;
    if a <= -PI {
        a += TAU;
    } else if a > PI {
        a -= TAU;
    }
    a
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_angle_range() {
        for k in -20..=20 {
            let a = norm_angle(k as f64 * 0.7);
            assert!(a > -PI && a <= PI, "angle {a} out of range");
        }
        assert!((norm_angle(PI) - PI).abs() < 1e-12);
        assert!((norm_angle(-PI) - PI).abs() < 1e-12);
        assert!((norm_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn angle_from_points_back_to_origin() {
        let start = Point::new(0.0, 0.0);
        let current = Point::new(-10.0, 0.0);
        // displacement current -> start points along +x
        assert!(start.angle_from(&current).abs() < 1e-12);
        assert!((current.angle_from(&start) - PI).abs() < 1e-12);
    }

    #[test]
    fn null_vector_has_zero_angle_and_no_unit() {
        assert_eq!(Point::ORIGIN.angle(), 0.0);
        assert!(Point::ORIGIN.unit().is_none());
    }

    #[test]
    fn arithmetic() {
        let a = Point::new(1.0, 2.0);
        let b = Point::new(4.0, 6.0);
        assert_eq!(b - a, Point::new(3.0, 4.0));
        assert_eq!(a.distance(&b), 5.0);
        assert_eq!(-a, Point::new(-1.0, -2.0));
        assert_eq!(a * 2.0, Point::new(2.0, 4.0));
        assert!(!Point::new(f64::NAN, 0.0).is_finite());
    }
}
