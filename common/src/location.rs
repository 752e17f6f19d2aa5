use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// A machine coordinate in millimeters plus a rotation in degrees.
///
/// Motion itself is owned by the machine collaborator; this is only the
/// value type passed across that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub rotation: f64,
}

impl Location {
    pub const ORIGIN: Location = Location {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        rotation: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64, rotation: f64) -> Self {
        Self { x, y, z, rotation }
    }

    pub fn with_x(self, x: f64) -> Self {
        Self { x, ..self }
    }

    pub fn with_y(self, y: f64) -> Self {
        Self { y, ..self }
    }

    pub fn with_z(self, z: f64) -> Self {
        Self { z, ..self }
    }

    /// Length of the XYZ vector, rotation ignored.
    pub fn xyz_length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn xyz_distance_to(&self, other: &Location) -> f64 {
        (*other - *self).xyz_length()
    }

    /// XY distance, Z and rotation ignored.
    pub fn linear_distance_to(&self, other: &Location) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    /// Unit XYZ vector pointing from `self` to `other`, zero if they coincide.
    pub fn unit_vector_to(&self, other: &Location) -> Location {
        let delta = *other - *self;
        let length = delta.xyz_length();
        if length == 0.0 {
            return Location::ORIGIN;
        }
        Location::new(delta.x / length, delta.y / length, delta.z / length, 0.0)
    }
}

impl Add for Location {
    type Output = Location;

    fn add(self, rhs: Location) -> Location {
        Location::new(
            self.x + rhs.x,
            self.y + rhs.y,
            self.z + rhs.z,
            self.rotation + rhs.rotation,
        )
    }
}

impl Sub for Location {
    type Output = Location;

    fn sub(self, rhs: Location) -> Location {
        Location::new(
            self.x - rhs.x,
            self.y - rhs.y,
            self.z - rhs.z,
            self.rotation - rhs.rotation,
        )
    }
}

impl Mul<f64> for Location {
    type Output = Location;

    fn mul(self, factor: f64) -> Location {
        Location::new(
            self.x * factor,
            self.y * factor,
            self.z * factor,
            self.rotation * factor,
        )
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.4}, {:.4}, {:.4}, {:.3}°)",
            self.x, self.y, self.z, self.rotation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_vector_has_length_one() {
        let a = Location::new(1.0, 2.0, 3.0, 0.0);
        let b = Location::new(4.0, 6.0, 3.0, 45.0);
        let u = a.unit_vector_to(&b);
        assert!((u.xyz_length() - 1.0).abs() < 1e-12);
        assert!((u.x - 0.6).abs() < 1e-12);
        assert_eq!(u.rotation, 0.0);
    }

    #[test]
    fn unit_vector_of_coincident_points_is_zero() {
        let a = Location::new(1.0, 1.0, 1.0, 0.0);
        assert_eq!(a.unit_vector_to(&a), Location::ORIGIN);
    }

    #[test]
    fn linear_distance_ignores_z() {
        let a = Location::new(0.0, 0.0, 0.0, 0.0);
        let b = Location::new(3.0, 4.0, 100.0, 0.0);
        assert_eq!(a.linear_distance_to(&b), 5.0);
        assert!(a.xyz_distance_to(&b) > 100.0);
    }
}
