//! 算量编排：解析 → 单位解析 → 过滤 → 处理器 → 聚合 → 数量条目。
//!
//! 每次运行读取文件两遍。第一遍只收集单位证据（HEADER、文字、块定义范围），
//! 第二遍在单位确定之后做过滤与统计。运行之间互不共享聚合数据，
//! 唯一共享的是材料目录，运行开始时取快照。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use takeoff_core::errors::EntityError;
use takeoff_core::geometry::{self, Bounds2D, Point2};
use takeoff_core::model::{EntityKind, LayerAggregate, QuantityItem, RawEntityEvent};
use takeoff_core::units::{ResolveOptions, ScaleEvidence, ScaleSource, UnitScaleManager, UnitType};
use takeoff_io::{DxfEventHandler, DxfStreamParser, HeaderVariables, TextEvent, fingerprint};
use tracing::{debug, info, trace, warn};

use crate::errors::EngineError;
use crate::filter::{DEFAULT_MIN_AREA, DEFAULT_MIN_LINE_LENGTH, GeometryFilter};
use crate::material::{MaterialCatalog, SharedCatalog};
use crate::normalizer::LayerNormalizer;
use crate::processor::{ProcessContext, ProcessorRegistry};
use crate::services::{TakeoffStore, TakeoffSubmission};

pub const DEFAULT_HEADER_SCALE_VARIABLE: &str = "$USERR1";

#[derive(Debug, Clone, PartialEq)]
pub struct TakeoffOptions {
    /// 输出前把长度 / 面积换算为米 / 平方米。
    pub convert_to_meters: bool,
    pub merge_similar_layers: bool,
    pub dedupe_entities: bool,
    /// 块定义内部的几何是否计入统计。
    pub include_block_definitions: bool,
    pub filter_enabled: bool,
    pub clean_polylines: bool,
    pub min_line_length: f64,
    pub min_area: f64,
    pub exclusion_patterns: Vec<String>,
    pub apply_text_scale: bool,
    pub honor_header_scale: bool,
    pub header_scale_variable: String,
    /// 显式标定：(参照物名称, 图纸单位下的尺寸)，优先于块定义推断。
    pub calibration: Option<(String, f64)>,
    pub reference_objects: Vec<(String, f64)>,
}

impl Default for TakeoffOptions {
    fn default() -> Self {
        Self {
            convert_to_meters: true,
            merge_similar_layers: false,
            dedupe_entities: false,
            include_block_definitions: true,
            filter_enabled: true,
            clean_polylines: false,
            min_line_length: DEFAULT_MIN_LINE_LENGTH,
            min_area: DEFAULT_MIN_AREA,
            exclusion_patterns: Vec::new(),
            apply_text_scale: true,
            honor_header_scale: true,
            header_scale_variable: DEFAULT_HEADER_SCALE_VARIABLE.to_string(),
            calibration: None,
            reference_objects: Vec::new(),
        }
    }
}

/// 运行计数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub processed: usize,
    pub errors: usize,
    pub filtered: usize,
    pub duplicates: usize,
    pub discarded: usize,
    pub aggregates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TakeoffReport {
    pub source: PathBuf,
    pub unit_type: UnitType,
    pub scale_factor: f64,
    pub scale_source: ScaleSource,
    pub items: Vec<QuantityItem>,
    pub stats: RunStats,
}

impl TakeoffReport {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug)]
pub struct TakeoffEngine {
    options: TakeoffOptions,
    registry: ProcessorRegistry,
    filter: GeometryFilter,
    catalog: SharedCatalog,
    normalizer: LayerNormalizer,
}

impl TakeoffEngine {
    pub fn builder() -> TakeoffEngineBuilder {
        TakeoffEngineBuilder::default()
    }

    /// 使用默认选项与内置材料表。
    pub fn new() -> Self {
        Self {
            options: TakeoffOptions::default(),
            registry: ProcessorRegistry::new(),
            filter: GeometryFilter::new(),
            catalog: SharedCatalog::default(),
            normalizer: LayerNormalizer::new(),
        }
    }

    #[inline]
    pub fn options(&self) -> &TakeoffOptions {
        &self.options
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    pub fn normalizer(&self) -> &LayerNormalizer {
        &self.normalizer
    }

    /// 运行期覆盖图层材料映射；已开始的运行不受影响。
    pub fn update_layer_mapping(&self, layer: &str, material: &str) {
        self.catalog
            .update(|catalog| catalog.update_layer_mapping(layer, material));
    }

    pub fn update_block_mapping(&self, block_name: &str, material: &str) {
        self.catalog
            .update(|catalog| catalog.update_block_mapping(block_name, material));
    }

    pub fn run(&self, path: &Path) -> Result<TakeoffReport, EngineError> {
        let started = Instant::now();
        info!(path = %path.display(), "开始算量");
        let catalog = self.catalog.snapshot();

        let mut scan = EvidenceScan::default();
        DxfStreamParser::new().parse_file(path, &mut scan)?;
        let mut units = self.unit_manager();
        let scale_source = units.resolve(&scan.evidence(&self.options), self.resolve_options());

        let mut aggregates = HashMap::new();
        let mut parser = DxfStreamParser::new();
        let counters = {
            let mut pass = TakeoffPass {
                options: &self.options,
                registry: &self.registry,
                filter: &self.filter,
                units: &units,
                context: ProcessContext {
                    aggregates: &mut aggregates,
                    catalog: &catalog,
                },
                seen: HashSet::new(),
                counters: PassCounters::default(),
            };
            parser.parse_file(path, &mut pass)?;
            pass.counters
        };
        let parse_stats = parser.stats();

        let (length_factor, area_factor) = if self.options.convert_to_meters {
            (units.scale_factor(), units.scale_factor() * units.scale_factor())
        } else {
            (1.0, 1.0)
        };
        let mut items = collect_items(&aggregates, length_factor, area_factor);
        if self.options.merge_similar_layers {
            items = merge_similar(items, &self.normalizer);
        }

        let stats = RunStats {
            processed: counters.processed,
            errors: parse_stats.errors,
            filtered: counters.filtered,
            duplicates: counters.duplicates,
            discarded: parse_stats.discarded,
            aggregates: aggregates.len(),
        };
        info!(
            path = %path.display(),
            items = items.len(),
            processed = stats.processed,
            errors = stats.errors,
            filtered = stats.filtered,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "算量完成"
        );

        Ok(TakeoffReport {
            source: path.to_path_buf(),
            unit_type: units.unit_type(),
            scale_factor: units.scale_factor(),
            scale_source,
            items,
            stats,
        })
    }

    /// 把报告交给存档服务，返回记录编号。
    pub fn submit(
        &self,
        report: &TakeoffReport,
        identity: &str,
        store: &dyn TakeoffStore,
        rendered_document: Option<&Path>,
    ) -> Result<u64, EngineError> {
        let source_name = report
            .source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| report.source.display().to_string());
        let submission = TakeoffSubmission {
            identity,
            source_name: &source_name,
            items: &report.items,
            rendered_document,
        };
        let id = store.save(&submission)?;
        debug!(store = store.name(), id, source = %source_name, "报告已提交");
        Ok(id)
    }

    fn unit_manager(&self) -> UnitScaleManager {
        let mut units = UnitScaleManager::new();
        for (name, size) in &self.options.reference_objects {
            units.add_reference_object(name, *size);
        }
        units
    }

    fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            apply_text_scale: self.options.apply_text_scale,
            honor_header_scale: self.options.honor_header_scale,
        }
    }
}

impl Default for TakeoffEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct TakeoffEngineBuilder {
    options: TakeoffOptions,
    catalog: MaterialCatalog,
}

impl TakeoffEngineBuilder {
    pub fn options(mut self, options: TakeoffOptions) -> Self {
        self.options = options;
        self
    }

    pub fn catalog(mut self, catalog: MaterialCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn convert_to_meters(mut self, enabled: bool) -> Self {
        self.options.convert_to_meters = enabled;
        self
    }

    pub fn merge_similar_layers(mut self, enabled: bool) -> Self {
        self.options.merge_similar_layers = enabled;
        self
    }

    pub fn dedupe_entities(mut self, enabled: bool) -> Self {
        self.options.dedupe_entities = enabled;
        self
    }

    pub fn include_block_definitions(mut self, enabled: bool) -> Self {
        self.options.include_block_definitions = enabled;
        self
    }

    pub fn filter_enabled(mut self, enabled: bool) -> Self {
        self.options.filter_enabled = enabled;
        self
    }

    pub fn exclude_layers(mut self, pattern: impl Into<String>) -> Self {
        self.options.exclusion_patterns.push(pattern.into());
        self
    }

    pub fn calibration(mut self, object: impl Into<String>, measured: f64) -> Self {
        self.options.calibration = Some((object.into(), measured));
        self
    }

    pub fn layer_mapping(mut self, layer: &str, material: &str) -> Self {
        self.catalog.update_layer_mapping(layer, material);
        self
    }

    pub fn block_mapping(mut self, block_name: &str, material: &str) -> Self {
        self.catalog.update_block_mapping(block_name, material);
        self
    }

    pub fn material_scale(mut self, material: &str, factor: f64) -> Self {
        self.catalog.set_scale_factor(material, factor);
        self
    }

    /// 排除规则在这里编译，非法规则直接报错。
    pub fn build(self) -> Result<TakeoffEngine, EngineError> {
        let mut filter = GeometryFilter::new()
            .with_min_line_length(self.options.min_line_length)
            .with_min_area(self.options.min_area);
        for pattern in &self.options.exclusion_patterns {
            filter.add_exclusion_pattern(pattern)?;
        }
        Ok(TakeoffEngine {
            options: self.options,
            registry: ProcessorRegistry::new(),
            filter,
            catalog: SharedCatalog::new(self.catalog),
            normalizer: LayerNormalizer::new(),
        })
    }
}

/// 第一遍：收集单位证据。
#[derive(Debug, Default)]
struct EvidenceScan {
    header: HeaderVariables,
    texts: Vec<String>,
    block_order: Vec<String>,
    block_extents: HashMap<String, Bounds2D>,
}

impl EvidenceScan {
    fn include_extent(&mut self, owner: &str, event: &RawEntityEvent) {
        let extent = entity_extent(event);
        if extent.is_empty() {
            return;
        }
        if !self.block_extents.contains_key(owner) {
            self.block_order.push(owner.to_string());
        }
        self.block_extents
            .entry(owner.to_string())
            .or_insert_with(Bounds2D::empty)
            .include_bounds(&extent);
    }

    fn evidence(&self, options: &TakeoffOptions) -> ScaleEvidence {
        let mut calibrations = Vec::new();
        if let Some((name, measured)) = &options.calibration {
            calibrations.push((name.clone(), *measured));
        }
        for name in &self.block_order {
            if let Some(extent) = self.block_extents.get(name) {
                calibrations.push((name.clone(), extent.major_extent()));
            }
        }
        ScaleEvidence {
            insunits: self.header.insunits(),
            title: self.header.title().map(str::to_string),
            header_scale: self.header.number(&options.header_scale_variable),
            texts: self.texts.clone(),
            calibrations,
        }
    }
}

impl DxfEventHandler for EvidenceScan {
    fn handle_entity(&mut self, event: RawEntityEvent) -> Result<(), EntityError> {
        if let Some(owner) = event.owner_block() {
            self.include_extent(owner, &event);
        }
        Ok(())
    }

    fn handle_header(&mut self, header: &HeaderVariables) {
        self.header = header.clone();
    }

    fn handle_text(&mut self, text: TextEvent) {
        self.texts.push(text.content);
    }
}

fn entity_extent(event: &RawEntityEvent) -> Bounds2D {
    let coordinates = &event.coordinates;
    match event.kind {
        EntityKind::Line | EntityKind::LwPolyline | EntityKind::Polyline => {
            geometry::bounds_of(coordinates)
        }
        EntityKind::Circle if coordinates.len() >= 3 => {
            let (x, y, r) = (coordinates[0], coordinates[1], coordinates[2].abs());
            let mut bounds = Bounds2D::empty();
            bounds.include_point(Point2::new(x - r, y - r));
            bounds.include_point(Point2::new(x + r, y + r));
            bounds
        }
        _ => Bounds2D::empty(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PassCounters {
    processed: usize,
    filtered: usize,
    duplicates: usize,
}

/// 第二遍：过滤并分发到处理器。
struct TakeoffPass<'a> {
    options: &'a TakeoffOptions,
    registry: &'a ProcessorRegistry,
    filter: &'a GeometryFilter,
    units: &'a UnitScaleManager,
    context: ProcessContext<'a>,
    seen: HashSet<String>,
    counters: PassCounters,
}

impl DxfEventHandler for TakeoffPass<'_> {
    fn handle_entity(&mut self, mut event: RawEntityEvent) -> Result<(), EntityError> {
        if !self.options.include_block_definitions && event.owner_block().is_some() {
            self.counters.filtered += 1;
            return Ok(());
        }
        if self.options.dedupe_entities && !self.seen.insert(fingerprint(&event)) {
            self.counters.duplicates += 1;
            return Ok(());
        }
        if self.options.filter_enabled && !self.filter.should_include(&event, self.units) {
            self.counters.filtered += 1;
            return Ok(());
        }
        if self.options.clean_polylines && event.kind.is_polyline() {
            event.coordinates = GeometryFilter::clean_polyline(&event.coordinates, self.units);
        }
        self.registry.dispatch(&event, &mut self.context)?;
        self.counters.processed += 1;
        Ok(())
    }
}

/// 生成数量条目并按材料名升序排列。
///
/// 不同聚合（例如 DOOR-01 与 DOOR-02）解析到同一材料时，同单位的数量相加成一条；
/// 同一材料的不同单位按聚合键顺序中首次出现的先后排列。
fn collect_items(
    aggregates: &HashMap<String, LayerAggregate>,
    length_factor: f64,
    area_factor: f64,
) -> Vec<QuantityItem> {
    let mut ordered: Vec<&LayerAggregate> = aggregates.values().collect();
    ordered.sort_by(|a, b| a.key().cmp(b.key()));

    let mut items: Vec<QuantityItem> = Vec::new();
    for aggregate in ordered {
        let produced = aggregate.quantity_items(length_factor, area_factor);
        if produced.is_empty() {
            warn!(key = aggregate.key(), "聚合没有可报告的数量");
        }
        for item in produced {
            let existing = items
                .iter_mut()
                .find(|existing| existing.material == item.material && existing.unit == item.unit);
            match existing {
                Some(existing) => {
                    trace!(key = aggregate.key(), material = %item.material, "合并同材料条目");
                    existing.quantity += item.quantity;
                }
                None => items.push(item),
            }
        }
    }
    items.sort_by(|a, b| a.material.cmp(&b.material));
    items
}

/// 合并单位相同且材料名相似的条目，保留先出现的材料名。
fn merge_similar(items: Vec<QuantityItem>, normalizer: &LayerNormalizer) -> Vec<QuantityItem> {
    let mut merged: Vec<QuantityItem> = Vec::new();
    for item in items {
        let target = merged.iter_mut().find(|existing| {
            existing.unit == item.unit && normalizer.are_similar(&existing.material, &item.material)
        });
        match target {
            Some(existing) => {
                debug!(into = %existing.material, from = %item.material, "合并相似材料");
                existing.quantity += item.quantity;
            }
            None => merged.push(item),
        }
    }
    merged.sort_by(|a, b| a.material.cmp(&b.material));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use takeoff_core::model::QuantityUnit;

    #[test]
    fn items_are_sorted_by_material() {
        let mut aggregates = HashMap::new();
        let mut walls = LayerAggregate::new("Z-LAYER", "Alpha");
        walls.record(EntityKind::Line);
        walls.add_length(3.0);
        let mut roads = LayerAggregate::new("A-LAYER", "Beta");
        roads.record(EntityKind::Line);
        roads.add_length(4.0);
        aggregates.insert("Z-LAYER".to_string(), walls);
        aggregates.insert("A-LAYER".to_string(), roads);

        let items = collect_items(&aggregates, 1.0, 1.0);
        let materials: Vec<&str> = items.iter().map(|item| item.material.as_str()).collect();
        assert_eq!(materials, vec!["Alpha", "Beta"]);
    }

    #[test]
    fn aggregates_sharing_a_material_collapse_into_one_item() {
        let mut aggregates = HashMap::new();
        for key in ["DOOR-02", "DOOR-01"] {
            let mut door = LayerAggregate::new(key, "Doors");
            door.record(EntityKind::Insert);
            door.add_area(1.0);
            aggregates.insert(key.to_string(), door);
        }
        let mut frame = LayerAggregate::new("A-DOOR", "Doors");
        frame.record(EntityKind::Line);
        frame.add_length(2.5);
        aggregates.insert("A-DOOR".to_string(), frame);

        let items = collect_items(&aggregates, 1.0, 1.0);
        assert_eq!(
            items,
            vec![
                QuantityItem::new("Doors", 2.5, QuantityUnit::Meters),
                QuantityItem::new("Doors", 2.0, QuantityUnit::Pieces),
            ]
        );
    }

    #[test]
    fn similar_materials_merge_when_units_match() {
        let normalizer = LayerNormalizer::new();
        let items = vec![
            QuantityItem::new("A-WALL", 2.0, QuantityUnit::Meters),
            QuantityItem::new("A-2000", 3.0, QuantityUnit::Meters),
            QuantityItem::new("A-WALL", 1.0, QuantityUnit::SquareMeters),
        ];
        let merged = merge_similar(items, &normalizer);
        assert_eq!(merged.len(), 2);
        let meters = merged
            .iter()
            .find(|item| item.unit == QuantityUnit::Meters)
            .expect("meters item");
        assert_eq!(meters.material, "A-WALL");
        assert!((meters.quantity - 5.0).abs() < 1e-9);
    }

    #[test]
    fn circle_extent_covers_radius() {
        let event = RawEntityEvent::new(EntityKind::Circle, vec![10.0, 10.0, 2.0], "0");
        let extent = entity_extent(&event);
        assert!((extent.width() - 4.0).abs() < 1e-12);
        assert!((extent.min().x() - 8.0).abs() < 1e-12);
    }

    #[test]
    fn builder_rejects_invalid_exclusion_pattern() {
        let result = TakeoffEngine::builder().exclude_layers("[unclosed").build();
        assert!(matches!(result, Err(EngineError::InvalidPattern { .. })));
    }
}
