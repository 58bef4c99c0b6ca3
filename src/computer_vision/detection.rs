//! Square fiducial marker detection on grayscale frames.
//!
//! 1. Adaptive threshold: a pixel is dark if it is darker than the mean of its window by more
//!    than the offset.
//! 2. Connected dark regions not touching the image border become candidates.
//! 3. The convex hull of each region is reduced to a quadrilateral; its sides are refined by
//!    line fitting through the region outline.
//! 4. The cell grid is sampled through the quad homography and decoded against the dictionary.
//! 5. The pose follows from the four corners and the known marker size.

use image::GrayImage;
use nalgebra::{Point2, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::computer_vision::dictionary::{MarkerDictionary, pack_bits};
use crate::computer_vision::markers::{MarkerCollection, MarkerObservation};
use crate::computer_vision::pose_estimation::{
    CameraIntrinsics, apply_homography, estimate_marker_pose, find_homography,
};
use crate::parameter_error::ParameterError;

/// Hull area the quad must cover. Rejects round and ragged blobs.
const MIN_QUAD_FILL: f64 = 0.9;

/// Refined corners further than this from the raw hull corner are discarded.
const MAX_CORNER_SHIFT_PX: f64 = 3.0;

/// Cell samples per side, placed in the inner part of the cell.
const CELL_SAMPLES: [f64; 3] = [0.3, 0.5, 0.7];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorSettings {
    /// Side of the adaptive threshold window, pixels (odd).
    pub threshold_window: u32,

    /// Intensity levels a pixel must be below its window mean to count as dark.
    pub threshold_offset: f64,

    /// Smallest marker outline considered, pixels.
    pub min_perimeter_px: f64,

    /// Intensity levels between the darkest and the brightest cell.
    pub min_contrast: f64,

    /// Payload cells a decode may correct.
    pub max_corrections: u32,

    pub bits_per_side: usize,
    pub dictionary_size: usize,
    pub min_code_distance: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        DetectorSettings {
            threshold_window: 41,
            threshold_offset: 7.0,
            min_perimeter_px: 40.0,
            min_contrast: 40.0,
            max_corrections: 2,
            bits_per_side: 5,
            dictionary_size: 50,
            min_code_distance: 5,
        }
    }
}

impl DetectorSettings {
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.threshold_window < 3 {
            return Err(ParameterError::OutOfRange {
                field: "detector.threshold_window".into(),
                value: self.threshold_window as f64,
                min: 3.0,
                max: f64::INFINITY,
            });
        }
        crate::parameter_error::require_finite("detector.threshold_offset", self.threshold_offset)?;
        crate::parameter_error::require_finite("detector.min_perimeter_px", self.min_perimeter_px)?;
        crate::parameter_error::require_finite("detector.min_contrast", self.min_contrast)?;
        if self.dictionary_size == 0 {
            return Err(ParameterError::InvalidConfiguration(
                "detector.dictionary_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn dictionary(&self) -> Result<MarkerDictionary, ParameterError> {
        let dictionary =
            MarkerDictionary::generate(self.bits_per_side, self.dictionary_size, self.min_code_distance)?;
        Ok(dictionary.with_max_correction(self.max_corrections))
    }
}

/// A decoded marker before pose estimation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMarker {
    pub id: u32,
    /// Top left, top right, bottom right, bottom left of the printed pattern, pixels.
    pub corners: [Point2<f64>; 4],
    pub confidence: f64,
}

pub struct MarkerDetector {
    intrinsics: CameraIntrinsics,
    dictionary: MarkerDictionary,
    marker_size: f64,
    settings: DetectorSettings,
}

impl MarkerDetector {
    /// Detector for markers of side `marker_size` meters, printed from the dictionary
    /// described by the settings.
    pub fn new(
        intrinsics: CameraIntrinsics,
        marker_size: f64,
        settings: DetectorSettings,
    ) -> Result<Self, ParameterError> {
        intrinsics.validate()?;
        settings.validate()?;
        if !(marker_size.is_finite() && marker_size > 0.0) {
            return Err(ParameterError::OutOfRange {
                field: "marker_size".into(),
                value: marker_size,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        Ok(MarkerDetector {
            intrinsics,
            dictionary: settings.dictionary()?,
            marker_size,
            settings,
        })
    }

    pub fn dictionary(&self) -> &MarkerDictionary {
        &self.dictionary
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    /// Markers with their poses in the camera frame. Markers that cannot be decoded or whose
    /// pose cannot be solved are simply absent.
    pub fn detect(&self, image: &GrayImage, timestamp: f64) -> MarkerCollection {
        let mut collection = MarkerCollection::empty(timestamp);
        for marker in self.find_markers(image) {
            match estimate_marker_pose(&marker.corners, self.marker_size, &self.intrinsics) {
                Ok(pose) => collection.insert(MarkerObservation {
                    id: marker.id,
                    position: pose.translation.vector,
                    orientation: pose.rotation,
                    confidence: marker.confidence,
                    timestamp,
                    corners: marker.corners,
                }),
                Err(e) => trace!("marker {} has no pose: {}", marker.id, e),
            }
        }
        collection
    }

    /// Decoded markers with image corners, highest confidence first for repeated ids.
    pub fn find_markers(&self, image: &GrayImage) -> Vec<DecodedMarker> {
        let (width, height) = image.dimensions();
        if width < 3 || height < 3 {
            return Vec::new();
        }
        let dark = adaptive_threshold(
            image,
            self.settings.threshold_window,
            self.settings.threshold_offset,
        );
        let regions = dark_regions(&dark, width as usize, height as usize);
        let quads: Vec<[Point2<f64>; 4]> = regions
            .iter()
            .filter(|r| r.perimeter() >= self.settings.min_perimeter_px)
            .filter_map(|r| r.quad())
            .collect();
        trace!("{} regions, {} quads", regions.len(), quads.len());

        let mut markers: Vec<DecodedMarker> = quads
            .par_iter()
            .filter_map(|quad| self.decode(image, quad))
            .collect();
        markers.sort_by(|a, b| a.id.cmp(&b.id).then(b.confidence.total_cmp(&a.confidence)));
        markers
    }

    fn decode(&self, image: &GrayImage, quad: &[Point2<f64>; 4]) -> Option<DecodedMarker> {
        let cells = self.dictionary.cells_per_side();
        let n = cells as f64;
        let grid = [
            Point2::new(0.0, 0.0),
            Point2::new(n, 0.0),
            Point2::new(n, n),
            Point2::new(0.0, n),
        ];
        let h = find_homography(&grid, quad).ok()?;

        let mut means = Vec::with_capacity(cells * cells);
        for row in 0..cells {
            for col in 0..cells {
                let mut sum = 0.0;
                for dy in CELL_SAMPLES {
                    for dx in CELL_SAMPLES {
                        let p = apply_homography(&h, &Point2::new(col as f64 + dx, row as f64 + dy));
                        sum += bilinear(image, p.x, p.y)?;
                    }
                }
                means.push(sum / (CELL_SAMPLES.len() * CELL_SAMPLES.len()) as f64);
            }
        }

        let (lo, hi) = means
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), &m| (lo.min(m), hi.max(m)));
        let contrast = hi - lo;
        if contrast < self.settings.min_contrast {
            return None;
        }
        let threshold = (lo + hi) / 2.0;

        let is_border = |i: usize| {
            let (row, col) = (i / cells, i % cells);
            row == 0 || col == 0 || row == cells - 1 || col == cells - 1
        };
        if means.iter().enumerate().any(|(i, &m)| is_border(i) && m >= threshold) {
            return None;
        }
        let payload = pack_bits(
            means
                .iter()
                .enumerate()
                .filter(|(i, _)| !is_border(*i))
                .map(|(_, &m)| m >= threshold),
        );
        let found = self.dictionary.identify(payload)?;

        let clean = means
            .iter()
            .filter(|&&m| (m - threshold).abs() >= 0.25 * contrast)
            .count() as f64
            / means.len() as f64;
        let correction = 1.0 - found.distance as f64 / (self.dictionary.max_correction() + 1) as f64;

        let mut corners = [Point2::origin(); 4];
        for (k, corner) in corners.iter_mut().enumerate() {
            *corner = quad[(k + found.rotation) % 4];
        }
        Some(DecodedMarker {
            id: found.id,
            corners,
            confidence: (correction * clean).clamp(0.0, 1.0),
        })
    }
}

/// Dark pixel mask, row major.
fn adaptive_threshold(image: &GrayImage, window: u32, offset: f64) -> Vec<bool> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let stride = w + 1;
    let mut integral = vec![0u64; stride * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += image.get_pixel(x as u32, y as u32)[0] as u64;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row_sum;
        }
    }

    let r = (window / 2) as usize;
    let mut dark = vec![false; w * h];
    dark.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let (y0, y1) = (y.saturating_sub(r), (y + r + 1).min(h));
        for (x, out) in row.iter_mut().enumerate() {
            let (x0, x1) = (x.saturating_sub(r), (x + r + 1).min(w));
            let sum = integral[y1 * stride + x1] + integral[y0 * stride + x0]
                - integral[y0 * stride + x1]
                - integral[y1 * stride + x0];
            let area = ((x1 - x0) * (y1 - y0)) as f64;
            let value = image.get_pixel(x as u32, y as u32)[0] as f64;
            *out = value * area < sum as f64 - offset * area;
        }
    });
    dark
}

struct Region {
    min_x: usize,
    max_x: usize,
    min_y: usize,
    max_y: usize,
    /// Leftmost and rightmost pixel of every row, topmost and bottommost of every column.
    outline: Vec<Point2<f64>>,
}

/// 4-connected dark regions that do not touch the image border.
fn dark_regions(dark: &[bool], width: usize, height: usize) -> Vec<Region> {
    let mut visited = vec![false; dark.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();
    let mut pixels = Vec::new();

    for start in 0..dark.len() {
        if !dark[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        pixels.clear();
        let mut touches_border = false;

        while let Some(i) = stack.pop() {
            let (x, y) = (i % width, i / width);
            pixels.push((x, y));
            if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
                touches_border = true;
            }
            let neighbours = [
                (x > 0).then(|| i - 1),
                (x + 1 < width).then(|| i + 1),
                (y > 0).then(|| i - width),
                (y + 1 < height).then(|| i + width),
            ];
            for j in neighbours.into_iter().flatten() {
                if dark[j] && !visited[j] {
                    visited[j] = true;
                    stack.push(j);
                }
            }
        }

        if !touches_border && pixels.len() >= 16 {
            regions.push(Region::from_pixels(&pixels));
        }
    }
    regions
}

impl Region {
    fn from_pixels(pixels: &[(usize, usize)]) -> Region {
        let min_x = pixels.iter().map(|p| p.0).min().unwrap_or(0);
        let max_x = pixels.iter().map(|p| p.0).max().unwrap_or(0);
        let min_y = pixels.iter().map(|p| p.1).min().unwrap_or(0);
        let max_y = pixels.iter().map(|p| p.1).max().unwrap_or(0);

        let mut rows = vec![(usize::MAX, 0usize); max_y - min_y + 1];
        let mut cols = vec![(usize::MAX, 0usize); max_x - min_x + 1];
        for &(x, y) in pixels {
            let row = &mut rows[y - min_y];
            row.0 = row.0.min(x);
            row.1 = row.1.max(x);
            let col = &mut cols[x - min_x];
            col.0 = col.0.min(y);
            col.1 = col.1.max(y);
        }

        let mut outline = Vec::with_capacity(2 * (rows.len() + cols.len()));
        for (dy, &(lo, hi)) in rows.iter().enumerate() {
            if lo != usize::MAX {
                let y = (min_y + dy) as f64;
                outline.push(Point2::new(lo as f64, y));
                outline.push(Point2::new(hi as f64, y));
            }
        }
        for (dx, &(lo, hi)) in cols.iter().enumerate() {
            if lo != usize::MAX {
                let x = (min_x + dx) as f64;
                outline.push(Point2::new(x, lo as f64));
                outline.push(Point2::new(x, hi as f64));
            }
        }

        Region {
            min_x,
            max_x,
            min_y,
            max_y,
            outline,
        }
    }

    fn perimeter(&self) -> f64 {
        2.0 * ((self.max_x - self.min_x + 1) + (self.max_y - self.min_y + 1)) as f64
    }

    /// Corners in clockwise image order (y down), starting anywhere.
    fn quad(&self) -> Option<[Point2<f64>; 4]> {
        let hull = convex_hull(&self.outline);
        if hull.len() < 4 {
            return None;
        }

        // The diameter of a convex quad is one of its diagonals.
        let (mut a, mut b, mut longest) = (0, 0, 0.0);
        for i in 0..hull.len() {
            for j in (i + 1)..hull.len() {
                let d = (hull[j] - hull[i]).norm_squared();
                if d > longest {
                    (a, b, longest) = (i, j, d);
                }
            }
        }
        let diagonal = hull[b] - hull[a];
        let length = diagonal.norm();
        let (mut c, mut c_dist, mut d, mut d_dist) = (0, 0.0, 0, 0.0);
        for (i, p) in hull.iter().enumerate() {
            let side = cross(&diagonal, &(p - hull[a])) / length;
            if side > c_dist {
                (c, c_dist) = (i, side);
            }
            if side < d_dist {
                (d, d_dist) = (i, side);
            }
        }
        if c_dist < 0.15 * length || -d_dist < 0.15 * length {
            return None;
        }

        let mut quad = [hull[a], hull[c], hull[b], hull[d]];
        if signed_area(&quad) < 0.0 {
            quad.swap(1, 3);
        }
        if signed_area(&quad) < MIN_QUAD_FILL * signed_area(&hull).abs() {
            return None;
        }
        Some(self.refine(quad))
    }

    /// Moves the quad sides onto lines fitted through the outline, shifted half a pixel outwards
    /// from the pixel centres onto the region edge.
    fn refine(&self, quad: [Point2<f64>; 4]) -> [Point2<f64>; 4] {
        let centre = Point2::from((quad[0].coords + quad[1].coords + quad[2].coords + quad[3].coords) / 4.0);
        let mut lines = [(Point2::origin(), Vector2::zeros()); 4];
        for (i, line) in lines.iter_mut().enumerate() {
            let (p, q) = (quad[i], quad[(i + 1) % 4]);
            let side = q - p;
            let length = side.norm();
            let direction = side / length;
            let near: Vec<Point2<f64>> = self
                .outline
                .iter()
                .filter(|o| {
                    let t = (*o - p).dot(&direction) / length;
                    (0.1..=0.9).contains(&t) && cross(&direction, &(*o - p)).abs() < 1.5
                })
                .copied()
                .collect();
            let (origin, direction) = fit_line(&near).unwrap_or((p, direction));

            let mut normal = Vector2::new(direction.y, -direction.x);
            if normal.dot(&(origin - centre)) < 0.0 {
                normal = -normal;
            }
            let shift = 0.5 * normal.x.abs().max(normal.y.abs());
            *line = (origin + normal * shift, direction);
        }

        let mut refined = quad;
        for (i, corner) in refined.iter_mut().enumerate() {
            let previous = lines[(i + 3) % 4];
            if let Some(p) = intersect(previous, lines[i]) {
                if (p - quad[i]).norm() <= MAX_CORNER_SHIFT_PX {
                    *corner = p;
                }
            }
        }
        refined
    }
}

fn cross(a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

/// Shoelace area, positive for clockwise order in image coordinates.
fn signed_area(polygon: &[Point2<f64>]) -> f64 {
    let n = polygon.len();
    (0..n)
        .map(|i| cross(&polygon[i].coords, &polygon[(i + 1) % n].coords))
        .sum::<f64>()
        / 2.0
}

/// Monotone chain convex hull without collinear points.
fn convex_hull(points: &[Point2<f64>]) -> Vec<Point2<f64>> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    sorted.dedup();
    if sorted.len() < 3 {
        return sorted;
    }

    let mut hull = half_hull(sorted.iter());
    hull.extend(half_hull(sorted.iter().rev()));
    hull
}

/// One chain of the monotone chain hull, without its last point.
fn half_hull<'a>(points: impl Iterator<Item = &'a Point2<f64>>) -> Vec<Point2<f64>> {
    let turn = |o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>| cross(&(a - o), &(b - o));
    let mut chain: Vec<Point2<f64>> = Vec::new();
    for p in points {
        while chain.len() >= 2 && turn(&chain[chain.len() - 2], &chain[chain.len() - 1], p) <= 0.0 {
            chain.pop();
        }
        chain.push(*p);
    }
    chain.pop();
    chain
}

/// Total least squares line: a point on it and its unit direction.
fn fit_line(points: &[Point2<f64>]) -> Option<(Point2<f64>, Vector2<f64>)> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p.coords) / n;
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in points {
        let d = p.coords - mean;
        sxx += d.x * d.x;
        sxy += d.x * d.y;
        syy += d.y * d.y;
    }
    let angle = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    Some((Point2::from(mean), Vector2::new(angle.cos(), angle.sin())))
}

fn intersect(
    (p, d1): (Point2<f64>, Vector2<f64>),
    (q, d2): (Point2<f64>, Vector2<f64>),
) -> Option<Point2<f64>> {
    let denominator = cross(&d1, &d2);
    if denominator.abs() < 1e-9 {
        return None;
    }
    let s = cross(&(q - p), &d2) / denominator;
    Some(p + d1 * s)
}

/// Bilinear intensity at a sub-pixel position, None outside the image.
fn bilinear(image: &GrayImage, x: f64, y: f64) -> Option<f64> {
    let (w, h) = image.dimensions();
    if x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    if x0 + 1 >= w || y0 + 1 >= h {
        return None;
    }
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let p = |x: u32, y: u32| image.get_pixel(x, y)[0] as f64;
    Some(
        (1.0 - fx) * (1.0 - fy) * p(x0, y0)
            + fx * (1.0 - fy) * p(x0 + 1, y0)
            + (1.0 - fx) * fy * p(x0, y0 + 1)
            + fx * fy * p(x0 + 1, y0 + 1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn detector() -> MarkerDetector {
        MarkerDetector::new(CameraIntrinsics::default(), 0.05, DetectorSettings::default()).unwrap()
    }

    /// Marker printed axis aligned at (left, top), turned `quarter_turns` clockwise.
    fn paste_marker(canvas: &mut GrayImage, marker: &GrayImage, left: u32, top: u32, quarter_turns: u32) {
        let marker = match quarter_turns % 4 {
            0 => marker.clone(),
            1 => image::imageops::rotate90(marker),
            2 => image::imageops::rotate180(marker),
            _ => image::imageops::rotate270(marker),
        };
        for (x, y, pixel) in marker.enumerate_pixels() {
            canvas.put_pixel(left + x, top + y, *pixel);
        }
    }

    #[test]
    fn test_convex_hull_of_square_with_inner_points() {
        let points = vec![
            Point2::new(0.0, 0.0),
            Point2::new(4.0, 0.0),
            Point2::new(2.0, 0.0),
            Point2::new(4.0, 4.0),
            Point2::new(0.0, 4.0),
            Point2::new(2.0, 2.0),
        ];
        let hull = convex_hull(&points);
        assert_eq!(hull.len(), 4);
        assert!((signed_area(&hull).abs() - 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_detects_axis_aligned_marker_with_edge_corners() {
        let detector = detector();
        let marker = detector.dictionary().render_marker(4, 12, 0).unwrap();
        let mut canvas = GrayImage::from_pixel(320, 240, Luma([255]));
        paste_marker(&mut canvas, &marker, 100, 60, 0);

        let found = detector.find_markers(&canvas);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 4);
        assert!(found[0].confidence > 0.99);

        // The outer edge of pixel 100 is at 99.5 (pixel centres at integers).
        let expected = [(99.5, 59.5), (183.5, 59.5), (183.5, 143.5), (99.5, 143.5)];
        for (corner, (x, y)) in found[0].corners.iter().zip(expected) {
            assert!((corner.x - x).abs() < 0.1, "{:?}", found[0].corners);
            assert!((corner.y - y).abs() < 0.1, "{:?}", found[0].corners);
        }
    }

    #[test]
    fn test_rotated_marker_corners_follow_pattern() {
        let detector = detector();
        let marker = detector.dictionary().render_marker(9, 12, 0).unwrap();
        let mut canvas = GrayImage::from_pixel(320, 240, Luma([255]));
        paste_marker(&mut canvas, &marker, 100, 60, 1);

        let found = detector.find_markers(&canvas);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 9);
        // Turned clockwise: the pattern's top left corner is now at the top right.
        let top_left = found[0].corners[0];
        assert!((top_left.x - 183.5).abs() < 0.1 && (top_left.y - 59.5).abs() < 0.1);
    }

    #[test]
    fn test_blank_and_uniform_frames_have_no_markers() {
        let detector = detector();
        let blank = GrayImage::from_pixel(160, 120, Luma([255]));
        assert!(detector.detect(&blank, 0.0).is_empty());

        let mut square = blank.clone();
        for y in 30..90 {
            for x in 50..110 {
                square.put_pixel(x, y, Luma([0]));
            }
        }
        assert!(detector.detect(&square, 0.0).is_empty());
    }

    #[test]
    fn test_two_markers_in_one_frame() {
        let detector = detector();
        let dictionary = detector.dictionary();
        let mut canvas = GrayImage::from_pixel(400, 200, Luma([255]));
        paste_marker(&mut canvas, &dictionary.render_marker(0, 10, 0).unwrap(), 40, 50, 0);
        paste_marker(&mut canvas, &dictionary.render_marker(1, 10, 0).unwrap(), 250, 60, 3);

        let markers = detector.detect(&canvas, 2.5);
        assert_eq!(markers.len(), 2);
        assert!(markers.get(0).is_some() && markers.get(1).is_some());
        assert_eq!(markers.get(1).unwrap().timestamp, 2.5);
        assert!(markers.get(0).unwrap().position.z > 0.0);
    }
}
