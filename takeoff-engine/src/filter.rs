//! 进入处理器之前的几何过滤：注释类图层、自定义排除规则以及最小尺寸阈值。

use once_cell::sync::Lazy;
use regex::Regex;
use takeoff_core::geometry;
use takeoff_core::model::{EntityKind, RawEntityEvent};
use takeoff_core::units::UnitScaleManager;
use tracing::{debug, trace};

use crate::errors::EngineError;

pub const DEFAULT_MIN_LINE_LENGTH: f64 = 0.05;
pub const DEFAULT_MIN_AREA: f64 = 0.01;

/// 清理多段线时视为重合的真实距离（米）。
const DUPLICATE_VERTEX_DISTANCE: f64 = 0.001;

static ANNOTATION_LAYER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ANNO|TEXT|DIM|HATCH|GRID|NOTE|LABEL|SYMB|LEGEND|TITLE|MARK")
        .expect("invalid annotation layer pattern")
});

const FILL_LAYER_TOKENS: [&str; 3] = ["HATCH", "FILL", "PATT"];
const ANNOTATION_BLOCK_TOKENS: [&str; 6] = ["TEXT", "DIM", "ARROW", "SYMBOL", "TITLE", "NOTE"];
const HIGHLIGHT_COLORS: [i32; 3] = [1, 2, 3];

#[derive(Debug, Clone)]
pub struct GeometryFilter {
    min_line_length: f64,
    min_area: f64,
    exclusions: Vec<Regex>,
}

impl Default for GeometryFilter {
    fn default() -> Self {
        Self {
            min_line_length: DEFAULT_MIN_LINE_LENGTH,
            min_area: DEFAULT_MIN_AREA,
            exclusions: Vec::new(),
        }
    }
}

impl GeometryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最小长度（米），非法值被忽略。
    pub fn with_min_line_length(mut self, meters: f64) -> Self {
        if meters.is_finite() && meters >= 0.0 {
            self.min_line_length = meters;
        }
        self
    }

    /// 最小面积（平方米）。
    pub fn with_min_area(mut self, square_meters: f64) -> Self {
        if square_meters.is_finite() && square_meters >= 0.0 {
            self.min_area = square_meters;
        }
        self
    }

    /// 追加排除规则，需与整个图层名匹配。
    pub fn add_exclusion_pattern(&mut self, pattern: &str) -> Result<(), EngineError> {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|source| EngineError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        debug!(pattern, "添加图层排除规则");
        self.exclusions.push(regex);
        Ok(())
    }

    #[inline]
    pub fn min_line_length(&self) -> f64 {
        self.min_line_length
    }

    #[inline]
    pub fn min_area(&self) -> f64 {
        self.min_area
    }

    pub fn is_annotation_layer(&self, layer: &str) -> bool {
        ANNOTATION_LAYER.is_match(layer) || self.should_exclude_layer(layer)
    }

    /// 只检查自定义排除规则。
    pub fn should_exclude_layer(&self, layer: &str) -> bool {
        self.exclusions.iter().any(|pattern| pattern.is_match(layer))
    }

    /// 尺寸阈值按真实单位比较：长度乘系数，面积乘系数平方。
    pub fn meets_minimum_size(&self, event: &RawEntityEvent, units: &UnitScaleManager) -> bool {
        let coordinates = &event.coordinates;
        if coordinates.len() < 2 {
            return false;
        }
        match event.kind {
            EntityKind::Line | EntityKind::LwPolyline | EntityKind::Polyline => {
                units.to_meters(geometry::length(coordinates)) >= self.min_line_length
            }
            EntityKind::Circle => match coordinates.get(2) {
                Some(radius) => {
                    units.to_square_meters(geometry::circle_area(*radius)) >= self.min_area
                }
                None => false,
            },
            EntityKind::Insert | EntityKind::Block => true,
        }
    }

    pub fn should_include(&self, event: &RawEntityEvent, units: &UnitScaleManager) -> bool {
        if self.is_annotation_layer(&event.layer) {
            trace!(layer = %event.layer, kind = %event.kind, "注释图层，过滤");
            return false;
        }
        if !self.meets_minimum_size(event, units) {
            trace!(layer = %event.layer, kind = %event.kind, "低于最小尺寸，过滤");
            return false;
        }
        let keep = match event.kind {
            EntityKind::Line => self.keeps_line(event, units),
            EntityKind::LwPolyline | EntityKind::Polyline => self.keeps_polyline(event, units),
            EntityKind::Circle => self.keeps_circle(event, units),
            EntityKind::Insert => Self::keeps_insert(event),
            EntityKind::Block => true,
        };
        if !keep {
            trace!(layer = %event.layer, kind = %event.kind, "二次过滤未通过");
        }
        keep
    }

    /// 红 / 黄 / 绿色的短线多为标记线。
    fn keeps_line(&self, event: &RawEntityEvent, units: &UnitScaleManager) -> bool {
        match event.color() {
            Some(color) if HIGHLIGHT_COLORS.contains(&color) => {
                units.to_meters(geometry::length(&event.coordinates)) >= self.min_line_length * 2.0
            }
            _ => true,
        }
    }

    fn keeps_polyline(&self, event: &RawEntityEvent, units: &UnitScaleManager) -> bool {
        let flagged_closed = event.flags().is_some_and(|flags| flags & 1 == 1);
        if flagged_closed {
            let layer = event.layer.to_uppercase();
            if FILL_LAYER_TOKENS.iter().any(|token| layer.contains(token)) {
                return false;
            }
        }
        if geometry::is_closed_by_endpoints(&event.coordinates) {
            let area = geometry::polygon_area(&event.coordinates);
            if units.to_square_meters(area) < self.min_area {
                return false;
            }
        }
        true
    }

    fn keeps_circle(&self, event: &RawEntityEvent, units: &UnitScaleManager) -> bool {
        match event.coordinates.get(2) {
            Some(radius) => units.to_meters(*radius) >= self.min_line_length / 2.0,
            None => true,
        }
    }

    fn keeps_insert(event: &RawEntityEvent) -> bool {
        match event.block_name() {
            Some(name) => {
                let upper = name.to_uppercase();
                !ANNOTATION_BLOCK_TOKENS
                    .iter()
                    .any(|token| upper.contains(token))
            }
            None => true,
        }
    }

    /// 去掉与前一个保留点距离不超过 1 mm 的顶点；首点始终保留，末点单独判断。
    pub fn clean_polyline(coordinates: &[f64], units: &UnitScaleManager) -> Vec<f64> {
        if coordinates.len() < 4 {
            return coordinates.to_vec();
        }
        let min_distance = units.from_meters(DUPLICATE_VERTEX_DISTANCE);
        let usable = coordinates.len() - coordinates.len() % 2;
        let mut cleaned = vec![coordinates[0], coordinates[1]];

        let keep_if_apart = |x: f64, y: f64, cleaned: &mut Vec<f64>| {
            let last_x = cleaned[cleaned.len() - 2];
            let last_y = cleaned[cleaned.len() - 1];
            if ((x - last_x).powi(2) + (y - last_y).powi(2)).sqrt() > min_distance {
                cleaned.push(x);
                cleaned.push(y);
            }
        };

        let mut index = 2;
        while index + 2 < usable {
            keep_if_apart(coordinates[index], coordinates[index + 1], &mut cleaned);
            index += 2;
        }
        keep_if_apart(coordinates[usable - 2], coordinates[usable - 1], &mut cleaned);
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use takeoff_core::units::UnitType;

    fn meters() -> UnitScaleManager {
        UnitScaleManager::with_unit(UnitType::Meters)
    }

    fn circle(layer: &str, radius: f64) -> RawEntityEvent {
        RawEntityEvent::new(EntityKind::Circle, vec![0.0, 0.0, radius], layer)
    }

    #[test]
    fn annotation_layers_are_excluded_regardless_of_size() {
        let filter = GeometryFilter::new();
        let line = RawEntityEvent::new(EntityKind::Line, vec![0.0, 0.0, 100.0, 0.0], "A-ANNO-TEXT");
        assert!(!filter.should_include(&line, &meters()));
        assert!(filter.is_annotation_layer("s-dims"));
        assert!(!filter.is_annotation_layer("A-WALL"));
    }

    #[test]
    fn circle_area_threshold() {
        let filter = GeometryFilter::new();
        assert!(filter.should_include(&circle("PITS", 0.06), &meters()));
        assert!(!filter.should_include(&circle("PITS", 0.05), &meters()));
    }

    #[test]
    fn thresholds_are_measured_in_real_units() {
        let filter = GeometryFilter::new();
        let mm = UnitScaleManager::with_unit(UnitType::Millimeters);
        let short = RawEntityEvent::new(EntityKind::Line, vec![0.0, 0.0, 40.0, 0.0], "A-WALL");
        let long = RawEntityEvent::new(EntityKind::Line, vec![0.0, 0.0, 60.0, 0.0], "A-WALL");
        assert!(!filter.should_include(&short, &mm));
        assert!(filter.should_include(&long, &mm));
    }

    #[test]
    fn custom_patterns_must_match_whole_layer_name() {
        let mut filter = GeometryFilter::new();
        filter.add_exclusion_pattern("Z-.*").expect("valid pattern");
        assert!(filter.should_exclude_layer("Z-TEMP"));
        assert!(!filter.should_exclude_layer("AZ-TEMP"));
        assert!(filter.add_exclusion_pattern("(").is_err());
    }

    #[test]
    fn short_highlight_lines_are_dropped() {
        let filter = GeometryFilter::new();
        let red = RawEntityEvent::new(EntityKind::Line, vec![0.0, 0.0, 0.08, 0.0], "A-WALL")
            .with_property("62", "1");
        let white = red.clone().with_property("62", "7");
        assert!(!filter.should_include(&red, &meters()));
        assert!(filter.should_include(&white, &meters()));
    }

    #[test]
    fn closed_polylines_on_fill_layers_are_dropped() {
        let filter = GeometryFilter::new();
        let square = vec![0.0, 0.0, 2.0, 0.0, 2.0, 2.0, 0.0, 2.0];
        let fill = RawEntityEvent::new(EntityKind::LwPolyline, square.clone(), "SOLID-FILL")
            .with_property("70", "1");
        let slab = RawEntityEvent::new(EntityKind::LwPolyline, square, "S-SLAB")
            .with_property("70", "1");
        assert!(!filter.should_include(&fill, &meters()));
        assert!(filter.should_include(&slab, &meters()));
    }

    #[test]
    fn annotation_blocks_are_dropped() {
        let filter = GeometryFilter::new();
        let arrow = RawEntityEvent::new(EntityKind::Insert, vec![0.0, 0.0], "A-DOOR")
            .with_block_name("NORTH_ARROW");
        let door = RawEntityEvent::new(EntityKind::Insert, vec![0.0, 0.0], "A-DOOR")
            .with_block_name("DOOR-01");
        assert!(!filter.should_include(&arrow, &meters()));
        assert!(filter.should_include(&door, &meters()));
    }

    #[test]
    fn clean_polyline_drops_near_duplicate_vertices() {
        let mm = UnitScaleManager::with_unit(UnitType::Millimeters);
        let raw = [0.0, 0.0, 0.5, 0.0, 100.0, 0.0, 100.0, 0.2, 100.0, 100.0];
        let cleaned = GeometryFilter::clean_polyline(&raw, &mm);
        assert_eq!(cleaned, vec![0.0, 0.0, 100.0, 0.0, 100.0, 100.0]);
    }
}
