//! Camera model, plane homographies and the pose of a square marker from its four corners.

use anyhow::{Result, anyhow};
use nalgebra::{
    DMatrix, Isometry3, Matrix3, Point2, Point3, Rotation3, Translation3, UnitQuaternion, Vector2,
    Vector3,
};
use serde::{Deserialize, Serialize};

use crate::parameter_error::ParameterError;

/// Undistortion iterations of the inverse Brown-Conrady model.
const UNDISTORT_ITERATIONS: usize = 8;

/// Pinhole camera with Brown-Conrady distortion, OpenCV conventions: x right, y down,
/// z forward, pixel centres at integer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// k1, k2, p1, p2, k3
    #[serde(default)]
    pub distortion: [f64; 5],
}

impl Default for CameraIntrinsics {
    /// Typical 640x480 webcam with no distortion.
    fn default() -> Self {
        CameraIntrinsics {
            fx: 600.0,
            fy: 600.0,
            cx: 319.5,
            cy: 239.5,
            distortion: [0.0; 5],
        }
    }
}

impl CameraIntrinsics {
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        CameraIntrinsics {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 5],
        }
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        for (field, value) in [("fx", self.fx), ("fy", self.fy), ("cx", self.cx), ("cy", self.cy)] {
            crate::parameter_error::require_finite(field, value)?;
        }
        for value in self.distortion {
            crate::parameter_error::require_finite("distortion", value)?;
        }
        if self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(ParameterError::InvalidConfiguration(
                "focal lengths must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    fn distort(&self, n: Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let x_tan = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let y_tan = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        Vector2::new(x * radial + x_tan, y * radial + y_tan)
    }

    /// Pixel to undistorted normalized image coordinates (z = 1 plane).
    pub fn undistort(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let distorted = Vector2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy);
        if self.distortion == [0.0; 5] {
            return Point2::from(distorted);
        }
        let mut n = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            n -= self.distort(n) - distorted;
        }
        Point2::from(n)
    }

    /// Pixel of a point given in camera coordinates, None behind the camera.
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= f64::EPSILON {
            return None;
        }
        let d = self.distort(Vector2::new(point.x / point.z, point.y / point.z));
        Some(Point2::new(self.fx * d.x + self.cx, self.fy * d.y + self.cy))
    }
}

/// Homography H with `image ~ H * plane` from four or more correspondences (DLT).
pub fn find_homography(plane: &[Point2<f64>], image: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    let n = plane.len();
    if n < 4 || image.len() != n {
        return Err(anyhow!("need at least 4 point correspondences, got {}", n.min(image.len())));
    }

    // Conditioning keeps pixel-sized coordinates from dominating the SVD.
    let (plane_norm, plane_t) = conditioned(plane);
    let (image_norm, image_t) = conditioned(image);

    // At least nine rows, otherwise the thin SVD drops the null vector.
    let mut a = DMatrix::<f64>::zeros(2 * n.max(5), 9);
    for (i, (p, q)) in plane_norm.iter().zip(image_norm.iter()).enumerate() {
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // Null vector of A: the right singular vector of the smallest singular value.
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| anyhow!("homography SVD failed"))?;
    let (smallest, _) = svd.singular_values.argmin();
    let h = v_t.row(smallest);

    let mut h_norm = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_norm[(r, c)] = h[3 * r + c];
        }
    }

    let image_t_inv = image_t
        .try_inverse()
        .ok_or_else(|| anyhow!("degenerate image points"))?;
    let mut h_mat = image_t_inv * h_norm * plane_t;
    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    if h_mat.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("degenerate homography"));
    }
    Ok(h_mat)
}

/// Translates points to their centroid and scales them to a mean distance of sqrt(2).
fn conditioned(points: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p.coords) / n;
    let mean_distance = points.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n;
    let s = if mean_distance > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_distance
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * centroid.x, 0.0, s, -s * centroid.y, 0.0, 0.0, 1.0);
    let moved = points
        .iter()
        .map(|p| Point2::from((p.coords - centroid) * s))
        .collect();
    (moved, t)
}

pub fn apply_homography(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Pose of the plane z = 0 in camera coordinates from a homography between plane coordinates
/// and undistorted normalized image coordinates. The plane is placed in front of the camera.
pub fn planar_pose_from_homography(h: &Matrix3<f64>) -> Result<Isometry3<f64>> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = (h1.norm() + h2.norm()) * 0.5;
    if norm < f64::EPSILON {
        return Err(anyhow!("degenerate homography"));
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r_mat = Matrix3::from_columns(&[r1, r2, r3]);

    // Nearest rotation (polar decomposition).
    let svd = r_mat.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(anyhow!("failed to orthonormalize rotation by SVD"));
    };
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        rotation = u_fixed * v_t;
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation));
    Ok(Isometry3::from_parts(Translation3::from(h3 * lambda), rotation))
}

/// Corners of a square marker of side `size` in its own frame (x right, y up, z out of the
/// pattern): top left, top right, bottom right, bottom left.
pub fn marker_object_corners(size: f64) -> [Point3<f64>; 4] {
    let h = size / 2.0;
    [
        Point3::new(-h, h, 0.0),
        Point3::new(h, h, 0.0),
        Point3::new(h, -h, 0.0),
        Point3::new(-h, -h, 0.0),
    ]
}

/// Pose of a square marker in camera coordinates from its image corners
/// (top left, top right, bottom right, bottom left of the pattern).
pub fn estimate_marker_pose(
    corners: &[Point2<f64>; 4],
    size: f64,
    intrinsics: &CameraIntrinsics,
) -> Result<Isometry3<f64>> {
    let object: Vec<Point2<f64>> = marker_object_corners(size)
        .iter()
        .map(|p| Point2::new(p.x, p.y))
        .collect();
    let image: Vec<Point2<f64>> = corners.iter().map(|c| intrinsics.undistort(c)).collect();
    let h = find_homography(&object, &image)?;
    planar_pose_from_homography(&h)
}

/// Root mean square pixel distance between observed points and the projections
/// of their 3D counterparts given in camera coordinates.
pub fn reprojection_rms(
    intrinsics: &CameraIntrinsics,
    points: &[(Point3<f64>, Point2<f64>)],
) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    for (object, observed) in points {
        let projected = intrinsics.project(object)?;
        sum += (projected - observed).norm_squared();
    }
    Some((sum / points.len() as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::pinhole(800.0, 780.0, 320.0, 240.0)
    }

    #[test]
    fn test_homography_of_scaled_square() {
        let plane = [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ];
        let image = [
            Point2::new(10.0, 20.0),
            Point2::new(30.0, 20.0),
            Point2::new(30.0, 40.0),
            Point2::new(10.0, 40.0),
        ];
        let h = find_homography(&plane, &image).unwrap();
        let mapped = apply_homography(&h, &Point2::new(0.5, 0.5));
        assert_abs_diff_eq!(mapped.x, 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(mapped.y, 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_homography_needs_four_points() {
        let p = [Point2::new(0.0, 0.0); 3];
        assert!(find_homography(&p, &p).is_err());
    }

    #[test]
    fn test_marker_pose_recovered_from_projected_corners() {
        let camera = camera();
        let truth = Isometry3::from_parts(
            Translation3::new(0.05, -0.03, 0.6),
            UnitQuaternion::from_euler_angles(0.3, -0.2, 0.9),
        );
        let size = 0.04;
        let projected: Vec<Point2<f64>> = marker_object_corners(size)
            .iter()
            .map(|p| camera.project(&(truth * p)).unwrap())
            .collect();
        let corners = [projected[0], projected[1], projected[2], projected[3]];

        let pose = estimate_marker_pose(&corners, size, &camera).unwrap();
        assert_abs_diff_eq!(pose.translation.vector, truth.translation.vector, epsilon = 1e-9);
        assert!(pose.rotation.angle_to(&truth.rotation) < 1e-9);
    }

    #[test]
    fn test_undistort_inverts_distortion() {
        let camera = CameraIntrinsics {
            distortion: [-0.12, 0.03, 0.001, -0.0005, 0.0],
            ..camera()
        };
        let point = Point3::new(0.1, -0.05, 0.5);
        let pixel = camera.project(&point).unwrap();
        let n = camera.undistort(&pixel);
        assert_abs_diff_eq!(n.x, 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(n.y, -0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_reprojection_of_exact_points_is_zero() {
        let camera = camera();
        let p = Point3::new(0.0, 0.1, 1.0);
        let pixel = camera.project(&p).unwrap();
        assert_abs_diff_eq!(reprojection_rms(&camera, &[(p, pixel)]).unwrap(), 0.0, epsilon = 1e-12);
        assert!(reprojection_rms(&camera, &[]).is_none());
    }
}
