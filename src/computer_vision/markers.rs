//! Marker observations produced by the detector for a single frame.

use std::collections::BTreeMap;

use nalgebra::{Isometry3, Point2, Translation3, UnitQuaternion, Vector3};

/// One decoded marker with its pose in the camera frame (x right, y down, z forward).
/// The marker frame has x to the right of the printed pattern, y up and z out of the paper.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerObservation {
    pub id: u32,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,

    /// 0 (barely decodable) to 1 (every bit clean, high contrast).
    pub confidence: f64,

    /// Capture time of the frame, seconds.
    pub timestamp: f64,

    /// Image corners in pixels: top left, top right, bottom right, bottom left of the pattern.
    pub corners: [Point2<f64>; 4],
}

impl MarkerObservation {
    pub fn pose(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }
}

/// All markers seen in one frame, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerCollection {
    timestamp: f64,
    markers: BTreeMap<u32, MarkerObservation>,
}

impl MarkerCollection {
    pub fn empty(timestamp: f64) -> Self {
        MarkerCollection {
            timestamp,
            markers: BTreeMap::new(),
        }
    }

    /// Adds the observation. If the id was already seen in this frame, the more confident
    /// detection is kept.
    pub fn insert(&mut self, observation: MarkerObservation) {
        match self.markers.get(&observation.id) {
            Some(existing) if existing.confidence >= observation.confidence => {}
            _ => {
                self.markers.insert(observation.id, observation);
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&MarkerObservation> {
        self.markers.get(&id)
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerObservation> {
        self.markers.values()
    }
}

impl FromIterator<MarkerObservation> for MarkerCollection {
    fn from_iter<T: IntoIterator<Item = MarkerObservation>>(iter: T) -> Self {
        let mut collection = MarkerCollection::default();
        for observation in iter {
            collection.timestamp = observation.timestamp;
            collection.insert(observation);
        }
        collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(id: u32, confidence: f64) -> MarkerObservation {
        MarkerObservation {
            id,
            position: Vector3::new(0.0, 0.0, 0.5),
            orientation: UnitQuaternion::identity(),
            confidence,
            timestamp: 1.0,
            corners: [Point2::origin(); 4],
        }
    }

    #[test]
    fn test_duplicate_ids_keep_most_confident() {
        let mut markers = MarkerCollection::empty(1.0);
        markers.insert(observation(7, 0.4));
        markers.insert(observation(7, 0.9));
        markers.insert(observation(7, 0.6));
        assert_eq!(markers.len(), 1);
        assert_eq!(markers.get(7).unwrap().confidence, 0.9);
    }

    #[test]
    fn test_absent_marker_is_not_an_error() {
        let markers: MarkerCollection = vec![observation(1, 1.0)].into_iter().collect();
        assert!(markers.get(2).is_none());
        assert_eq!(markers.timestamp(), 1.0);
    }
}
