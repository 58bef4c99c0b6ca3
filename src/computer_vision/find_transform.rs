use anyhow::{Result, anyhow};
use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Rigid transform (rotation and translation, no scaling) that best maps the `observed`
/// points onto the `reference` points in the least squares sense:
/// `reference[i] ≈ transform * observed[i]`.
///
/// Needs at least three points that are not collinear.
pub fn find_rigid_transform(
    observed: &[Point3<f64>],
    reference: &[Point3<f64>],
) -> Result<Isometry3<f64>> {
    if observed.len() != reference.len() {
        return Err(anyhow!(
            "{} observed points but {} reference points",
            observed.len(),
            reference.len()
        ));
    }
    if observed.len() < 3 {
        return Err(anyhow!("at least 3 points are needed, got {}", observed.len()));
    }

    let n = observed.len() as f64;
    let centroid_obs = observed.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let centroid_ref = reference.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;

    // Cross covariance of the centred point sets
    let mut covariance = Matrix3::zeros();
    for (o, r) in observed.iter().zip(reference) {
        covariance += (r.coords - centroid_ref) * (o.coords - centroid_obs).transpose();
    }

    let svd = covariance.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(anyhow!("Failed to compute rigid alignment by SVD."));
    };

    // Two vanishing singular values: the points are collinear and the rotation about their line
    // is undetermined.
    let singular = svd.singular_values;
    if singular[1] <= 1e-12 * singular[0].max(1e-300) {
        return Err(anyhow!("points are collinear, rotation is undetermined"));
    }

    let mut rotation_matrix = u * v_t;

    // Ensure a proper rotation (no reflection)
    if rotation_matrix.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut(); // Flip the last column
        rotation_matrix = u_fixed * v_t;
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_matrix));
    let translation = Translation3::from(centroid_ref - rotation * centroid_obs);
    Ok(Isometry3::from_parts(translation, rotation))
}

/// Root mean square distance between the reference points and the transformed observed points.
pub fn alignment_rms(
    transform: &Isometry3<f64>,
    observed: &[Point3<f64>],
    reference: &[Point3<f64>],
) -> f64 {
    if observed.is_empty() {
        return 0.0;
    }
    let sum: f64 = observed
        .iter()
        .zip(reference)
        .map(|(o, r)| (transform * o - r).norm_squared())
        .sum();
    (sum / observed.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn points() -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.3, 0.0, 0.0),
            Point3::new(0.0, 0.2, 0.0),
            Point3::new(0.1, 0.1, 0.4),
            Point3::new(-0.2, 0.05, 0.1),
        ]
    }

    #[test]
    fn test_recovers_known_transform() {
        let truth = Isometry3::from_parts(
            Translation3::new(1.0, -2.0, 0.5),
            UnitQuaternion::from_euler_angles(0.4, -1.1, 2.5),
        );
        let observed = points();
        let reference: Vec<Point3<f64>> = observed.iter().map(|p| truth * p).collect();

        let found = find_rigid_transform(&observed, &reference).unwrap();
        assert_abs_diff_eq!(found.translation.vector, truth.translation.vector, epsilon = 1e-9);
        assert!(found.rotation.angle_to(&truth.rotation) < 1e-9);
        assert!(alignment_rms(&found, &observed, &reference) < 1e-9);
    }

    #[test]
    fn test_mirrored_points_give_a_rotation() {
        let observed = points();
        let reference: Vec<Point3<f64>> = observed
            .iter()
            .map(|p| Point3::new(p.x, p.y, -p.z))
            .collect();
        let found = find_rigid_transform(&observed, &reference).unwrap();
        let det = found.rotation.to_rotation_matrix().matrix().determinant();
        assert_abs_diff_eq!(det, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_inputs_are_rejected() {
        let line = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        assert!(find_rigid_transform(&line, &line).is_err());
        assert!(find_rigid_transform(&line[..2], &line[..2]).is_err());
        assert!(find_rigid_transform(&line, &line[..2]).is_err());
    }
}
