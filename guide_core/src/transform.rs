//! Camera ↔ mount vector transform.
//!
//! ## Model
//!
//! The RA axis sits at `x_angle` in the camera frame. The Dec axis is
//! described by its deviation from RA + 90°, the *y angle error*:
//!
//! | `y_angle_error` | Meaning                                |
//! |-----------------|----------------------------------------|
//! | ≈ 0             | Dec at RA + 90° (right-handed)         |
//! | ≈ ±π            | Dec at RA − 90° (mirrored Dec output)  |
//! | anything else   | Non-orthogonal axes                    |
//!
//! `mount_to_camera` is exact only for orthogonal axes. With a skewed Dec
//! axis the round trip carries a residual proportional to the skew; that
//! approximation is accepted and must not be "corrected" here.

use std::f64::consts::FRAC_PI_2;

use guide_common::geometry::Point;
use guide_common::guide::calibration::Calibration;
use guide_common::guide::error::GuideError;
use tracing::trace;

/// Project a camera-pixel vector onto the mount axes.
///
/// # Errors
///
/// `GuideError::InvalidVector` when either component is not finite.
pub fn camera_to_mount(camera: Point, cal: &Calibration) -> Result<Point, GuideError> {
    if !camera.is_finite() {
        return Err(GuideError::InvalidVector);
    }

    let hyp = camera.magnitude();
    let camera_theta = camera.angle();

    // RA rotation is measured from the camera x axis, Dec adds the skew
    let x_angle = camera_theta - cal.x_angle;
    let y_angle = camera_theta - (cal.x_angle + cal.y_angle_error());

    let mount = Point::new(x_angle.cos() * hyp, y_angle.sin() * hyp);
    trace!(
        cam_x = camera.x,
        cam_y = camera.y,
        mount_x = mount.x,
        mount_y = mount.y,
        "camera to mount"
    );
    Ok(mount)
}

/// Map a mount-axis vector back into camera pixels.
///
/// # Errors
///
/// `GuideError::InvalidVector` when either component is not finite.
pub fn mount_to_camera(mount: Point, cal: &Calibration) -> Result<Point, GuideError> {
    if !mount.is_finite() {
        return Err(GuideError::InvalidVector);
    }

    let hyp = mount.magnitude();
    let mut mount_theta = mount.angle();

    if cal.y_angle_error().abs() > FRAC_PI_2 {
        mount_theta = -mount_theta;
    }

    let x_angle = mount_theta + cal.x_angle;
    let camera = Point::new(x_angle.cos() * hyp, x_angle.sin() * hyp);
    trace!(
        mount_x = mount.x,
        mount_y = mount.y,
        cam_x = camera.x,
        cam_y = camera.y,
        "mount to camera"
    );
    Ok(camera)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use guide_common::geometry::norm_angle;
    use std::f64::consts::PI;

    fn orthogonal(x_angle: f64, mirrored: bool) -> Calibration {
        let y_angle = if mirrored {
            norm_angle(x_angle - FRAC_PI_2)
        } else {
            norm_angle(x_angle + FRAC_PI_2)
        };
        Calibration {
            x_angle: norm_angle(x_angle),
            y_angle,
            is_valid: true,
            ..Default::default()
        }
    }

    fn close(a: Point, b: Point, tol: f64) -> bool {
        a.distance(&b) <= tol * b.magnitude().max(1.0)
    }

    #[test]
    fn identity_when_axes_match_camera() {
        let cal = orthogonal(0.0, false);
        let m = camera_to_mount(Point::new(3.0, -4.0), &cal).unwrap();
        assert!(close(m, Point::new(3.0, -4.0), 1e-12));
    }

    #[test]
    fn rotated_ra_axis() {
        // RA axis along camera +y: a star moved along +y is pure RA
        let cal = orthogonal(FRAC_PI_2, false);
        let m = camera_to_mount(Point::new(0.0, 5.0), &cal).unwrap();
        assert!(close(m, Point::new(5.0, 0.0), 1e-12));
    }

    #[test]
    fn mirrored_dec_negates_y() {
        let cal = orthogonal(0.0, true);
        let m = camera_to_mount(Point::new(0.0, 2.0), &cal).unwrap();
        assert!(close(m, Point::new(0.0, -2.0), 1e-12));
    }

    #[test]
    fn round_trip_orthogonal_calibrations() {
        for k in 0..24 {
            let x_angle = -PI + (k as f64 + 0.5) * (PI / 12.0);
            for mirrored in [false, true] {
                let cal = orthogonal(x_angle, mirrored);
                for j in 0..16 {
                    let a = j as f64 * PI / 8.0;
                    let r = 0.5 + j as f64 * 1.7;
                    let v = Point::new(r * a.cos(), r * a.sin());
                    let m = camera_to_mount(v, &cal).unwrap();
                    let back = mount_to_camera(m, &cal).unwrap();
                    assert!(
                        close(back, v, 1e-2),
                        "x_angle={x_angle} mirrored={mirrored} v={v:?} back={back:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn skewed_axes_have_bounded_residual() {
        let skew = 5.0f64.to_radians();
        let cal = Calibration {
            x_angle: 0.2,
            y_angle: norm_angle(0.2 + FRAC_PI_2 + skew),
            is_valid: true,
            ..Default::default()
        };
        let v = Point::new(7.0, 7.0);
        let back = mount_to_camera(camera_to_mount(v, &cal).unwrap(), &cal).unwrap();
        let residual = back.distance(&v) / v.magnitude();
        assert!(residual > 0.0);
        assert!(residual < 2.0 * skew, "residual {residual}");
    }

    #[test]
    fn non_finite_input_rejected() {
        let cal = orthogonal(0.3, false);
        assert_eq!(
            camera_to_mount(Point::new(f64::NAN, 1.0), &cal),
            Err(GuideError::InvalidVector)
        );
        assert_eq!(
            mount_to_camera(Point::new(1.0, f64::INFINITY), &cal),
            Err(GuideError::InvalidVector)
        );
    }

    #[test]
    fn null_vector_maps_to_null() {
        let cal = orthogonal(1.0, true);
        let m = camera_to_mount(Point::ORIGIN, &cal).unwrap();
        assert!(m.magnitude() < 1e-12);
    }
}
