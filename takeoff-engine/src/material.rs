//! 图层 / 块名到材料类别的映射。
//!
//! 映射表按固定顺序保存，名称转大写后做子串包含匹配，第一个命中的条目生效。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

pub const UNKNOWN_LAYER: &str = "Unknown";
pub const UNKNOWN_BLOCK: &str = "Unknown Block";

const LAYER_TOKENS: &[(&str, &str)] = &[
    ("A-WALL", "Walls"),
    ("A-COLS", "Columns"),
    ("A-BEAM", "Beams"),
    ("A-FLOR", "Floor"),
    ("A-ROOF", "Roof"),
    ("C-ROAD", "Roads"),
    ("P-PIPE", "Pipes"),
    ("E-CABL", "Cables"),
    ("A_WALL", "Walls"),
    ("A_COLS", "Columns"),
    ("A_BEAM", "Beams"),
    ("A_FLOR", "Floor"),
    ("A_ROOF", "Roof"),
    ("C_ROAD", "Roads"),
    ("P_PIPE", "Pipes"),
    ("E_CABL", "Cables"),
    ("WALL", "Walls"),
    ("COLUMN", "Columns"),
    ("BEAM", "Beams"),
    ("FLOOR", "Floor"),
    ("ROOF", "Roof"),
    ("DOOR", "Doors"),
    ("WINDOW", "Windows"),
];

const BLOCK_TOKENS: &[(&str, &str)] = &[
    ("DOOR", "Doors"),
    ("WINDOW", "Windows"),
    ("PLUMB", "Plumbing Fixtures"),
    ("SINK", "Sinks"),
    ("BASIN", "Sinks"),
    ("TOILET", "Toilets"),
    ("WC", "Toilets"),
    ("SWITCH", "Switches"),
    ("OUTLET", "Outlets"),
    ("SOCKET", "Outlets"),
    ("FURNITURE", "Furniture"),
    ("CHAIR", "Furniture"),
    ("TABLE", "Furniture"),
    ("DESK", "Furniture"),
    ("BED", "Furniture"),
    ("SOFA", "Furniture"),
    ("CABINET", "Cabinets"),
    ("APPLIANCE", "Appliances"),
    ("FRIDGE", "Appliances"),
    ("STOVE", "Appliances"),
    ("OVEN", "Appliances"),
    ("DISHWASHER", "Appliances"),
    ("SHOWER", "Plumbing Fixtures"),
    ("BATH", "Plumbing Fixtures"),
    ("LIGHT", "Lighting"),
    ("FIXTURE", "Lighting"),
];

const DEFAULT_SCALE_FACTORS: &[(&str, f64)] = &[
    ("Walls", 1.0),
    ("Columns", 1.0),
    ("Beams", 1.0),
    ("Floor", 1.0),
    ("Roof", 1.0),
];

/// 有序的 token → 材料表。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialTable {
    entries: Vec<(String, String)>,
}

impl MaterialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a (&'a str, &'a str)>) -> Self {
        let mut table = Self::new();
        for (token, material) in pairs {
            table.push(token, material);
        }
        table
    }

    fn push(&mut self, token: &str, material: &str) {
        self.entries
            .push((token.trim().to_uppercase(), material.to_string()));
    }

    /// 覆盖映射：条目移到表头，优先于内置条目和更早的覆盖。
    pub fn update(&mut self, token: &str, material: &str) {
        let key = token.trim().to_uppercase();
        if key.is_empty() {
            warn!(material, "忽略空的材料映射名称");
            return;
        }
        self.entries.retain(|(existing, _)| *existing != key);
        self.entries.insert(0, (key, material.to_string()));
        debug!(token, material, "更新材料映射");
    }

    /// 第一个被名称包含的 token 对应的材料。
    pub fn lookup(&self, name: &str) -> Option<&str> {
        let upper = name.to_uppercase();
        self.entries
            .iter()
            .find(|(token, _)| upper.contains(token.as_str()))
            .map(|(_, material)| material.as_str())
    }
}

pub trait MaterialProvider {
    fn material(&self, name: &str) -> String;
}

/// 图层材料：直接返回图层名，映射表只通过 [`LayerMaterialProvider::lookup`] 暴露。
#[derive(Debug, Clone, PartialEq)]
pub struct LayerMaterialProvider {
    table: MaterialTable,
}

impl Default for LayerMaterialProvider {
    fn default() -> Self {
        Self {
            table: MaterialTable::from_pairs(LAYER_TOKENS),
        }
    }
}

impl LayerMaterialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, layer: &str) -> Option<&str> {
        self.table.lookup(layer)
    }

    pub fn update_mapping(&mut self, layer: &str, material: &str) {
        self.table.update(layer, material);
    }
}

impl MaterialProvider for LayerMaterialProvider {
    fn material(&self, layer: &str) -> String {
        if layer.is_empty() {
            UNKNOWN_LAYER.to_string()
        } else {
            layer.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockMaterialProvider {
    table: MaterialTable,
}

impl Default for BlockMaterialProvider {
    fn default() -> Self {
        Self {
            table: MaterialTable::from_pairs(BLOCK_TOKENS),
        }
    }
}

impl BlockMaterialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_mapping(&mut self, block_name: &str, material: &str) {
        self.table.update(block_name, material);
    }

    /// 块名是否包含任一已知 token。
    pub fn is_known_block_type(&self, name: &str) -> bool {
        !name.is_empty() && self.table.lookup(name).is_some()
    }
}

impl MaterialProvider for BlockMaterialProvider {
    fn material(&self, block_name: &str) -> String {
        if block_name.is_empty() {
            return UNKNOWN_BLOCK.to_string();
        }
        self.table
            .lookup(block_name)
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN_BLOCK.to_string())
    }
}

/// 一次算量使用的材料目录：图层 / 块映射以及按材料的放大系数。
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialCatalog {
    layers: LayerMaterialProvider,
    blocks: BlockMaterialProvider,
    scale_factors: HashMap<String, f64>,
    resolve_layer_materials: bool,
}

impl Default for MaterialCatalog {
    fn default() -> Self {
        Self {
            layers: LayerMaterialProvider::default(),
            blocks: BlockMaterialProvider::default(),
            scale_factors: DEFAULT_SCALE_FACTORS
                .iter()
                .map(|(material, factor)| (material.to_string(), *factor))
                .collect(),
            resolve_layer_materials: false,
        }
    }
}

impl MaterialCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开启后图层材料先查映射表，未命中再回退为图层名。
    pub fn with_resolved_layers(mut self, enabled: bool) -> Self {
        self.resolve_layer_materials = enabled;
        self
    }

    pub fn layer_material(&self, layer: &str) -> String {
        if self.resolve_layer_materials {
            if let Some(material) = self.layers.lookup(layer) {
                return material.to_string();
            }
        }
        self.layers.material(layer)
    }

    pub fn block_material(&self, block_name: &str) -> String {
        self.blocks.material(block_name)
    }

    /// 材料的放大系数，未配置时为 1.0。
    pub fn scale_factor(&self, material: &str) -> f64 {
        self.scale_factors.get(material).copied().unwrap_or(1.0)
    }

    pub fn set_scale_factor(&mut self, material: &str, factor: f64) {
        if factor.is_finite() && factor > 0.0 {
            self.scale_factors.insert(material.to_string(), factor);
        } else {
            warn!(material, factor, "忽略非法的材料放大系数");
        }
    }

    pub fn update_layer_mapping(&mut self, layer: &str, material: &str) {
        self.layers.update_mapping(layer, material);
    }

    pub fn update_block_mapping(&mut self, block_name: &str, material: &str) {
        self.blocks.update_mapping(block_name, material);
    }

    pub fn is_known_block_type(&self, name: &str) -> bool {
        self.blocks.is_known_block_type(name)
    }
}

/// 多次算量共享的目录。每次运行开始时取快照，运行中的更新不影响进行中的运行。
#[derive(Debug, Clone, Default)]
pub struct SharedCatalog {
    inner: Arc<RwLock<MaterialCatalog>>,
}

impl SharedCatalog {
    pub fn new(catalog: MaterialCatalog) -> Self {
        Self {
            inner: Arc::new(RwLock::new(catalog)),
        }
    }

    pub fn snapshot(&self) -> MaterialCatalog {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut MaterialCatalog),
    {
        match self.inner.write() {
            Ok(mut guard) => mutate(&mut guard),
            Err(poisoned) => mutate(&mut poisoned.into_inner()),
        }
    }
}
