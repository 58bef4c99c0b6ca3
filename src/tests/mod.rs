
mod marker_detection;
