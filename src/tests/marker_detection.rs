//! Detection and pose estimation on rendered camera frames.

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use crate::computer_vision::dictionary::MarkerDictionary;
    use crate::computer_vision::{CameraIntrinsics, DetectorSettings, MarkerDetector};
    use crate::tests::test_utils::{PlacedMarker, assert_pose_near, facing_camera, render_scene};

    const SIZE: f64 = 0.08;

    fn detector() -> MarkerDetector {
        MarkerDetector::new(CameraIntrinsics::default(), SIZE, DetectorSettings::default()).unwrap()
    }

    #[test]
    fn test_pose_of_tilted_marker() {
        let detector = detector();
        let cases = [
            (Vector3::new(0.0, 0.0, 0.4), 0.0, 0.0, 0.0),
            (Vector3::new(0.05, -0.03, 0.45), 0.25, 0.0, 0.3),
            (Vector3::new(-0.08, 0.04, 0.5), 0.0, -0.3, -1.2),
            (Vector3::new(0.02, 0.06, 0.35), -0.2, 0.2, 2.5),
        ];
        for (id, (position, roll, pitch, yaw)) in cases.into_iter().enumerate() {
            let id = id as u32 + 3;
            let pose = facing_camera(position, roll, pitch, yaw);
            let frame = render_scene(
                detector.dictionary(),
                detector.intrinsics(),
                640,
                480,
                &[PlacedMarker { id, size: SIZE, pose }],
            );

            let markers = detector.detect(&frame, 1.0);
            assert_eq!(markers.len(), 1, "case {}", id);
            let found = markers.get(id).unwrap();
            assert!(found.confidence > 0.9, "confidence {}", found.confidence);
            assert_pose_near(&found.pose(), &pose, 0.005, 5f64.to_radians());
        }
    }

    #[test]
    fn test_two_rendered_markers_keep_their_ids() {
        let detector = detector();
        let left = facing_camera(Vector3::new(-0.1, 0.0, 0.5), 0.0, 0.15, 0.0);
        let right = facing_camera(Vector3::new(0.1, 0.02, 0.55), 0.1, 0.0, 0.4);
        let frame = render_scene(
            detector.dictionary(),
            detector.intrinsics(),
            640,
            480,
            &[
                PlacedMarker { id: 0, size: SIZE, pose: left },
                PlacedMarker { id: 1, size: SIZE, pose: right },
            ],
        );

        let markers = detector.detect(&frame, 0.25);
        assert_eq!(markers.len(), 2);
        assert_pose_near(&markers.get(0).unwrap().pose(), &left, 0.005, 5f64.to_radians());
        assert_pose_near(&markers.get(1).unwrap().pose(), &right, 0.005, 5f64.to_radians());
        assert_eq!(markers.timestamp(), 0.25);
    }

    #[test]
    fn test_marker_outside_dictionary_is_ignored() {
        let detector = detector();
        // A larger dictionary prints ids the detector does not know.
        let wide = MarkerDictionary::generate(5, 52, 5).unwrap();
        let frame = render_scene(
            &wide,
            detector.intrinsics(),
            640,
            480,
            &[PlacedMarker {
                id: 51,
                size: SIZE,
                pose: facing_camera(Vector3::new(0.0, 0.0, 0.4), 0.0, 0.0, 0.0),
            }],
        );
        assert!(detector.detect(&frame, 0.0).is_empty());
    }
}
