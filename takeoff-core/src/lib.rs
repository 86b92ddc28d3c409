pub mod units;

pub mod geometry {
    use std::f64::consts::PI;

    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 端点重合判定容差（图纸单位）。
    pub const ENDPOINT_TOLERANCE: f64 = 1e-4;

    /// 二维点，内部以 `glam::DVec2` 表示。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn distance(self, other: Point2) -> f64 {
            self.0.distance(other.0)
        }

        /// 两点在两个轴向上的差值都小于容差时视为重合。
        #[inline]
        pub fn coincides_with(self, other: Point2, tolerance: f64) -> bool {
            (self.x() - other.x()).abs() < tolerance && (self.y() - other.y()).abs() < tolerance
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 轴对齐边界框，用于估算块定义的外形尺寸。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds2D {
        min: Point2,
        max: Point2,
    }

    impl Bounds2D {
        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point2::new(f64::INFINITY, f64::INFINITY),
                max: Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        pub fn include_point(&mut self, point: Point2) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            self.min = Point2(self.min.as_vec2().min(point.as_vec2()));
            self.max = Point2(self.max.as_vec2().max(point.as_vec2()));
        }

        pub fn include_bounds(&mut self, other: &Bounds2D) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }

        #[inline]
        pub fn width(&self) -> f64 {
            if self.is_empty() {
                0.0
            } else {
                self.max.x() - self.min.x()
            }
        }

        #[inline]
        pub fn height(&self) -> f64 {
            if self.is_empty() {
                0.0
            } else {
                self.max.y() - self.min.y()
            }
        }

        /// 宽高中的较大值，作为参照物（门、窗等）的测量尺寸。
        #[inline]
        pub fn major_extent(&self) -> f64 {
            self.width().max(self.height())
        }
    }

    /// 将按 x,y,x,y 排列的坐标序列视为顶点迭代；末尾落单的分量被忽略。
    pub fn points(coordinates: &[f64]) -> impl Iterator<Item = Point2> + '_ {
        coordinates
            .chunks_exact(2)
            .map(|pair| Point2::new(pair[0], pair[1]))
    }

    #[inline]
    pub fn vertex_count(coordinates: &[f64]) -> usize {
        coordinates.len() / 2
    }

    fn first_and_last(coordinates: &[f64]) -> Option<(Point2, Point2)> {
        let count = vertex_count(coordinates);
        if count == 0 {
            return None;
        }
        let first = Point2::new(coordinates[0], coordinates[1]);
        let last = Point2::new(coordinates[2 * count - 2], coordinates[2 * count - 1]);
        Some((first, last))
    }

    /// 路径长度。两点时直接求距离；三点及以上逐段累加，
    /// 若首尾未闭合且闭合段超过容差，再补上一段闭合边。
    pub fn length(coordinates: &[f64]) -> f64 {
        if coordinates.len() < 4 {
            return 0.0;
        }
        if coordinates.len() == 4 {
            return Point2::new(coordinates[0], coordinates[1])
                .distance(Point2::new(coordinates[2], coordinates[3]));
        }

        let vertices: Vec<Point2> = points(coordinates).collect();
        let mut total: f64 = vertices
            .windows(2)
            .map(|pair| pair[0].distance(pair[1]))
            .sum();

        if !is_closed_by_endpoints(coordinates) {
            if let Some((first, last)) = first_and_last(coordinates) {
                let closing = last.distance(first);
                if closing > ENDPOINT_TOLERANCE {
                    total += closing;
                }
            }
        }
        total
    }

    /// 鞋带公式求多边形面积（含首尾回绕项），取绝对值的一半。
    pub fn polygon_area(coordinates: &[f64]) -> f64 {
        if coordinates.len() < 6 {
            return 0.0;
        }
        let vertices: Vec<Point2> = points(coordinates).collect();
        let mut sum = 0.0;
        for (index, current) in vertices.iter().enumerate() {
            let next = vertices[(index + 1) % vertices.len()];
            sum += current.x() * next.y() - next.x() * current.y();
        }
        (sum / 2.0).abs()
    }

    #[inline]
    pub fn circle_area(radius: f64) -> f64 {
        PI * radius * radius
    }

    /// 至少三个顶点且首尾重合（两个轴向均小于 1e-4）。
    pub fn is_closed_by_endpoints(coordinates: &[f64]) -> bool {
        if coordinates.len() < 6 {
            return false;
        }
        match first_and_last(coordinates) {
            Some((first, last)) => first.coincides_with(last, ENDPOINT_TOLERANCE),
            None => false,
        }
    }

    pub fn bounds_of(coordinates: &[f64]) -> Bounds2D {
        let mut bounds = Bounds2D::empty();
        for point in points(coordinates) {
            bounds.include_point(point);
        }
        bounds
    }

}

pub mod errors {
    use thiserror::Error;

    use crate::model::EntityKind;

    /// 单个实体级别的可恢复错误：记录并计数后跳过，不会中断整次解析。
    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum EntityError {
        #[error("insufficient coordinates for {kind}: need {required}, found {found}")]
        InsufficientCoordinates {
            kind: EntityKind,
            required: usize,
            found: usize,
        },
        #[error("unparseable value {value:?} for group code {code}")]
        UnparseableValue { code: i32, value: String },
        #[error("no processor registered for entity kind {0}")]
        UnknownEntityKind(String),
    }

    impl EntityError {
        pub fn insufficient(kind: EntityKind, required: usize, found: usize) -> Self {
            Self::InsufficientCoordinates {
                kind,
                required,
                found,
            }
        }
    }
}

pub mod model {
    use std::collections::{BTreeMap, HashMap};
    use std::fmt;

    use serde::{Deserialize, Serialize};

    /// 参与算量的实体种类（封闭集合）。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub enum EntityKind {
        Line,
        LwPolyline,
        Polyline,
        Circle,
        Insert,
        /// 整个块作为一件计数的事件。流式解析器不产生该种类：块定义内部的实体按各自种类上报，
        /// 块名记在 `ownerBlock` 属性上；手工构造事件的调用方可以用它按件计数。
        Block,
    }

    impl EntityKind {
        /// 由 DXF 实体起始标记识别种类。`BLOCK` 是块定义记录，不在这里识别。
        pub fn from_dxf_name(name: &str) -> Option<Self> {
            match name {
                "LINE" => Some(EntityKind::Line),
                "LWPOLYLINE" => Some(EntityKind::LwPolyline),
                "POLYLINE" => Some(EntityKind::Polyline),
                "CIRCLE" => Some(EntityKind::Circle),
                "INSERT" => Some(EntityKind::Insert),
                _ => None,
            }
        }

        pub fn dxf_name(self) -> &'static str {
            match self {
                EntityKind::Line => "LINE",
                EntityKind::LwPolyline => "LWPOLYLINE",
                EntityKind::Polyline => "POLYLINE",
                EntityKind::Circle => "CIRCLE",
                EntityKind::Insert => "INSERT",
                EntityKind::Block => "BLOCK",
            }
        }

        #[inline]
        pub fn is_polyline(self) -> bool {
            matches!(self, EntityKind::LwPolyline | EntityKind::Polyline)
        }

        #[inline]
        pub fn is_counted(self) -> bool {
            matches!(self, EntityKind::Insert | EntityKind::Block)
        }

        #[inline]
        pub fn yields_area(self) -> bool {
            matches!(
                self,
                EntityKind::Circle | EntityKind::LwPolyline | EntityKind::Polyline
            )
        }
    }

    impl fmt::Display for EntityKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.dxf_name())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub enum QuantityUnit {
        #[serde(rename = "m")]
        Meters,
        #[serde(rename = "m²")]
        SquareMeters,
        #[serde(rename = "pcs")]
        Pieces,
    }

    impl QuantityUnit {
        pub fn symbol(self) -> &'static str {
            match self {
                QuantityUnit::Meters => "m",
                QuantityUnit::SquareMeters => "m²",
                QuantityUnit::Pieces => "pcs",
            }
        }
    }

    impl fmt::Display for QuantityUnit {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.symbol())
        }
    }

    /// 块定义内部实体的属性键，值为所属块名。
    pub const OWNER_BLOCK_KEY: &str = "ownerBlock";

    /// 解析器解码出的一个实体。坐标按遇到的顺序保存，平面实体按 x,y 成对排列。
    #[derive(Debug, Clone, PartialEq)]
    pub struct RawEntityEvent {
        pub kind: EntityKind,
        pub coordinates: Vec<f64>,
        pub layer: String,
        pub block_name: Option<String>,
        pub properties: HashMap<String, String>,
    }

    impl RawEntityEvent {
        pub fn new(kind: EntityKind, coordinates: Vec<f64>, layer: impl Into<String>) -> Self {
            Self {
                kind,
                coordinates,
                layer: layer.into(),
                block_name: None,
                properties: HashMap::new(),
            }
        }

        pub fn with_block_name(mut self, name: impl Into<String>) -> Self {
            self.block_name = Some(name.into());
            self
        }

        pub fn with_property(mut self, code: impl Into<String>, value: impl Into<String>) -> Self {
            self.properties.insert(code.into(), value.into());
            self
        }

        #[inline]
        pub fn property(&self, code: &str) -> Option<&str> {
            self.properties.get(code).map(String::as_str)
        }

        /// 组码 70 的位标志，无法解析时返回 `None`。
        pub fn flags(&self) -> Option<i32> {
            self.property("70")
                .and_then(|raw| raw.trim().parse::<i32>().ok())
        }

        /// 组码 62 的 ACI 颜色号。
        pub fn color(&self) -> Option<i32> {
            self.property("62")
                .and_then(|raw| raw.trim().parse::<i32>().ok())
        }

        pub fn block_name(&self) -> Option<&str> {
            self.block_name.as_deref().filter(|name| !name.is_empty())
        }

        /// 所在块定义的名称；模型空间中的实体返回 `None`。
        pub fn owner_block(&self) -> Option<&str> {
            self.property(OWNER_BLOCK_KEY).filter(|name| !name.is_empty())
        }
    }

    /// 单次算量过程中按图层（或块名）累积的统计。
    #[derive(Debug, Clone, PartialEq)]
    pub struct LayerAggregate {
        key: String,
        material: String,
        total_length: f64,
        total_area: f64,
        entity_count: u64,
        kind_counts: BTreeMap<EntityKind, u64>,
        primary_kind: Option<EntityKind>,
    }

    impl LayerAggregate {
        pub fn new(key: impl Into<String>, material: impl Into<String>) -> Self {
            Self {
                key: key.into(),
                material: material.into(),
                total_length: 0.0,
                total_area: 0.0,
                entity_count: 0,
                kind_counts: BTreeMap::new(),
                primary_kind: None,
            }
        }

        #[inline]
        pub fn key(&self) -> &str {
            &self.key
        }

        #[inline]
        pub fn material(&self) -> &str {
            &self.material
        }

        /// 材料标签以最后一次写入为准。
        pub fn set_material(&mut self, material: &str) {
            if self.material != material {
                self.material = material.to_string();
            }
        }

        #[inline]
        pub fn add_length(&mut self, length: f64) {
            self.total_length += length;
        }

        #[inline]
        pub fn add_area(&mut self, area: f64) {
            self.total_area += area;
        }

        #[inline]
        pub fn total_length(&self) -> f64 {
            self.total_length
        }

        #[inline]
        pub fn total_area(&self) -> f64 {
            self.total_area
        }

        #[inline]
        pub fn entity_count(&self) -> u64 {
            self.entity_count
        }

        /// 计数加一，并在严格超过当前主种类计数时更新主种类。
        pub fn record(&mut self, kind: EntityKind) {
            self.entity_count += 1;
            let count = {
                let slot = self.kind_counts.entry(kind).or_insert(0);
                *slot += 1;
                *slot
            };
            match self.primary_kind {
                None => self.primary_kind = Some(kind),
                Some(primary) if primary != kind && count > self.kind_count(primary) => {
                    self.primary_kind = Some(kind);
                }
                Some(_) => {}
            }
        }

        #[inline]
        pub fn kind_count(&self, kind: EntityKind) -> u64 {
            self.kind_counts.get(&kind).copied().unwrap_or(0)
        }

        #[inline]
        pub fn contains_kind(&self, kind: EntityKind) -> bool {
            self.kind_count(kind) > 0
        }

        #[inline]
        pub fn primary_kind(&self) -> Option<EntityKind> {
            self.primary_kind
        }

        pub fn kind_counts(&self) -> impl Iterator<Item = (EntityKind, u64)> + '_ {
            self.kind_counts.iter().map(|(kind, count)| (*kind, *count))
        }

        fn has_kind_where(&self, predicate: impl Fn(EntityKind) -> bool) -> bool {
            self.kind_counts
                .iter()
                .any(|(kind, count)| *count > 0 && predicate(*kind))
        }

        /// 生成数量条目：计数 → 长度 → 面积。`length_factor` 与 `area_factor`
        /// 把图纸单位换算为米 / 平方米。
        pub fn quantity_items(&self, length_factor: f64, area_factor: f64) -> Vec<QuantityItem> {
            let mut items = Vec::new();
            if self.entity_count > 0 && self.has_kind_where(EntityKind::is_counted) {
                items.push(QuantityItem::new(
                    &self.material,
                    self.entity_count as f64,
                    QuantityUnit::Pieces,
                ));
            }
            if self.total_length > 0.0 {
                items.push(QuantityItem::new(
                    &self.material,
                    self.total_length * length_factor,
                    QuantityUnit::Meters,
                ));
            }
            if self.total_area > 0.0 && self.has_kind_where(EntityKind::yields_area) {
                items.push(QuantityItem::new(
                    &self.material,
                    self.total_area * area_factor,
                    QuantityUnit::SquareMeters,
                ));
            }
            items
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct QuantityItem {
        pub material: String,
        pub quantity: f64,
        pub unit: QuantityUnit,
    }

    impl QuantityItem {
        pub fn new(material: impl Into<String>, quantity: f64, unit: QuantityUnit) -> Self {
            Self {
                material: material.into(),
                quantity,
                unit,
            }
        }
    }

}
