use std::collections::HashMap;

use takeoff_core::errors::EntityError;
use takeoff_core::geometry;
use takeoff_core::model::{EntityKind, LayerAggregate, RawEntityEvent};
use tracing::{debug, trace, warn};

use crate::material::MaterialCatalog;

/// 多段线面积低于该值（图纸单位）时按长度统计。
const MIN_POLYLINE_AREA: f64 = 0.01;

/// 处理器运行所需的上下文：当前运行独占的聚合表与材料目录快照。
pub struct ProcessContext<'a> {
    pub aggregates: &'a mut HashMap<String, LayerAggregate>,
    pub catalog: &'a MaterialCatalog,
}

impl ProcessContext<'_> {
    /// 取出（或创建）指定键的聚合，并写入最新的材料标签。
    fn aggregate(&mut self, key: &str, material: &str) -> &mut LayerAggregate {
        let aggregate = self
            .aggregates
            .entry(key.to_string())
            .or_insert_with(|| LayerAggregate::new(key, material));
        aggregate.set_material(material);
        aggregate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Line,
    Polyline(EntityKind),
    Circle,
    Insert,
}

impl Processor {
    pub fn kind(self) -> EntityKind {
        match self {
            Processor::Line => EntityKind::Line,
            Processor::Polyline(kind) => kind,
            Processor::Circle => EntityKind::Circle,
            Processor::Insert => EntityKind::Insert,
        }
    }

    pub fn process(
        self,
        event: &RawEntityEvent,
        context: &mut ProcessContext<'_>,
    ) -> Result<(), EntityError> {
        match self {
            Processor::Line => process_line(event, context),
            Processor::Polyline(kind) => process_polyline(kind, event, context),
            Processor::Circle => process_circle(event, context),
            Processor::Insert => process_insert(event, context),
        }
    }
}

fn require(event: &RawEntityEvent, kind: EntityKind, required: usize) -> Result<(), EntityError> {
    let found = event.coordinates.len();
    if found < required {
        return Err(EntityError::insufficient(kind, required, found));
    }
    Ok(())
}

fn process_line(
    event: &RawEntityEvent,
    context: &mut ProcessContext<'_>,
) -> Result<(), EntityError> {
    require(event, EntityKind::Line, 4)?;
    let material = context.catalog.layer_material(&event.layer);
    let factor = context.catalog.scale_factor(&material);
    let length = geometry::length(&event.coordinates) * factor;

    let aggregate = context.aggregate(&event.layer, &material);
    aggregate.add_length(length);
    aggregate.record(EntityKind::Line);
    trace!(layer = %event.layer, material = %material, length, "处理 LINE");
    Ok(())
}

fn process_polyline(
    kind: EntityKind,
    event: &RawEntityEvent,
    context: &mut ProcessContext<'_>,
) -> Result<(), EntityError> {
    require(event, kind, 4)?;
    let material = context.catalog.layer_material(&event.layer);
    let factor = context.catalog.scale_factor(&material);
    let coordinates = &event.coordinates;

    let flagged_closed = match event.property("70") {
        Some(raw) => match raw.trim().parse::<i32>() {
            Ok(flags) => flags & 1 == 1,
            Err(_) => {
                warn!(layer = %event.layer, flags = raw, "多段线标志无法解析");
                false
            }
        },
        None => false,
    };
    let closed = flagged_closed || geometry::is_closed_by_endpoints(coordinates);

    let aggregate = context.aggregate(&event.layer, &material);
    if closed && geometry::vertex_count(coordinates) >= 3 {
        let area = geometry::polygon_area(coordinates);
        if area > MIN_POLYLINE_AREA {
            aggregate.add_area(area * factor);
            aggregate.record(kind);
            trace!(layer = %event.layer, kind = %kind, area, "处理闭合多段线");
            return Ok(());
        }
    }

    let length = geometry::length(coordinates) * factor;
    aggregate.add_length(length);
    aggregate.record(kind);
    trace!(layer = %event.layer, kind = %kind, length, "处理开放多段线");
    Ok(())
}

fn process_circle(
    event: &RawEntityEvent,
    context: &mut ProcessContext<'_>,
) -> Result<(), EntityError> {
    require(event, EntityKind::Circle, 3)?;
    let material = context.catalog.layer_material(&event.layer);
    let factor = context.catalog.scale_factor(&material);
    let radius = event.coordinates[2];
    let area = geometry::circle_area(radius) * factor;

    let aggregate = context.aggregate(&event.layer, &material);
    aggregate.add_area(area);
    aggregate.record(EntityKind::Circle);
    trace!(layer = %event.layer, radius, area, "处理 CIRCLE");
    Ok(())
}

fn process_insert(
    event: &RawEntityEvent,
    context: &mut ProcessContext<'_>,
) -> Result<(), EntityError> {
    let Some(block_name) = event.block_name() else {
        warn!(layer = %event.layer, "INSERT 缺少块名，跳过");
        return Ok(());
    };

    let material = if context.catalog.is_known_block_type(block_name) {
        context.catalog.block_material(block_name)
    } else {
        debug!(
            block = block_name,
            layer = %event.layer,
            "未识别的块类型，按图层材料统计"
        );
        context.catalog.layer_material(&event.layer)
    };

    let aggregate = context.aggregate(block_name, &material);
    aggregate.record(EntityKind::Insert);
    if event.coordinates.len() >= 2 {
        let scale_x = parse_scale(event.property("41"));
        let scale_y = parse_scale(event.property("42"));
        let footprint = (scale_x * scale_y).abs();
        aggregate.add_area(if footprint > 0.0 { footprint } else { 1.0 });
    }
    debug!(
        block = block_name,
        layer = %event.layer,
        material = %aggregate.material(),
        count = aggregate.entity_count(),
        "处理 INSERT"
    );
    Ok(())
}

fn parse_scale(raw: Option<&str>) -> f64 {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .unwrap_or(1.0)
}

/// 实体种类到处理器的注册表。
#[derive(Debug, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<EntityKind, Processor>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Processor::Line);
        registry.register(Processor::Polyline(EntityKind::LwPolyline));
        registry.register(Processor::Polyline(EntityKind::Polyline));
        registry.register(Processor::Circle);
        registry.register(Processor::Insert);
        registry
    }

    pub fn empty() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    pub fn register(&mut self, processor: Processor) {
        self.processors.insert(processor.kind(), processor);
    }

    pub fn dispatch(
        &self,
        event: &RawEntityEvent,
        context: &mut ProcessContext<'_>,
    ) -> Result<(), EntityError> {
        match self.processors.get(&event.kind) {
            Some(processor) => processor.process(event, context),
            None => Err(EntityError::UnknownEntityKind(event.kind.to_string())),
        }
    }

    pub fn handles(&self, kind: EntityKind) -> bool {
        self.processors.contains_key(&kind)
    }

    pub fn registered_kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.processors.keys().copied()
    }
}
