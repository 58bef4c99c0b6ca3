//! Marker detection, camera model and rigid alignment.

pub mod detection;
pub mod dictionary;
pub mod find_transform;
pub mod markers;
pub mod pose_estimation;
pub mod transform_io;

pub use detection::{DecodedMarker, DetectorSettings, MarkerDetector};
pub use dictionary::MarkerDictionary;
pub use markers::{MarkerCollection, MarkerObservation};
pub use pose_estimation::CameraIntrinsics;
pub use transform_io::CameraExtrinsics;
