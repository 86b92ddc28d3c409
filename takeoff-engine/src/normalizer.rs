//! 图层命名规范化与相似度判断。
//!
//! 不同事务所的图层命名差异很大（`A-WALL`、`A-2000`、`Walls - Exterior`、`MURO`），
//! 这里把它们改写为统一的 `学科前缀-类别` 形式，便于合并同类图层。

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

pub const SIMILARITY_THRESHOLD: f64 = 0.85;

const UNKNOWN_LAYER: &str = "UNKNOWN";

/// AIA 数字编码到标准图层名的对照。
const NUMERIC_LAYERS: &[(&str, &str)] = &[
    ("A-WALL", "A-2000"),
    ("A-WALL-FULL", "A-2010"),
    ("A-WALL-PRHT", "A-2020"),
    ("A-WALL-MOVE", "A-2030"),
    ("A-DOOR", "A-2200"),
    ("A-GLAZ", "A-2300"),
    ("A-FLOR", "A-2400"),
    ("A-CEIL", "A-2500"),
    ("A-ROOF", "A-2600"),
    ("A-STRS", "A-2700"),
    ("S-COLS", "S-3000"),
    ("S-BEAM", "S-3100"),
    ("S-FNDN", "S-3200"),
    ("S-SLAB", "S-3300"),
    ("S-WALL", "S-3400"),
];

const DISCIPLINE_PREFIXES: &[(&str, &str)] = &[
    ("A-", "ARCH-"),
    ("A_", "ARCH-"),
    ("AR-", "ARCH-"),
    ("AR_", "ARCH-"),
    ("ARCH-", "ARCH-"),
    ("ARCH_", "ARCH-"),
    ("S-", "STRUCT-"),
    ("S_", "STRUCT-"),
    ("ST-", "STRUCT-"),
    ("ST_", "STRUCT-"),
    ("STR-", "STRUCT-"),
    ("STR_", "STRUCT-"),
    ("STRUCT-", "STRUCT-"),
    ("STRUCT_", "STRUCT-"),
    ("M-", "MECH-"),
    ("M_", "MECH-"),
    ("ME-", "MECH-"),
    ("ME_", "MECH-"),
    ("MECH-", "MECH-"),
    ("MECH_", "MECH-"),
    ("H-", "HVAC-"),
    ("H_", "HVAC-"),
    ("HV-", "HVAC-"),
    ("HV_", "HVAC-"),
    ("HVAC-", "HVAC-"),
    ("HVAC_", "HVAC-"),
    ("E-", "ELEC-"),
    ("E_", "ELEC-"),
    ("EL-", "ELEC-"),
    ("EL_", "ELEC-"),
    ("ELEC-", "ELEC-"),
    ("ELEC_", "ELEC-"),
    ("P-", "PLUMB-"),
    ("P_", "PLUMB-"),
    ("PL-", "PLUMB-"),
    ("PL_", "PLUMB-"),
    ("PLUMB-", "PLUMB-"),
    ("PLUMB_", "PLUMB-"),
    ("F-", "FIRE-"),
    ("F_", "FIRE-"),
    ("FP-", "FIRE-"),
    ("FP_", "FIRE-"),
    ("FIRE-", "FIRE-"),
    ("FIRE_", "FIRE-"),
    ("C-", "CIVIL-"),
    ("C_", "CIVIL-"),
    ("CV-", "CIVIL-"),
    ("CV_", "CIVIL-"),
    ("CIVIL-", "CIVIL-"),
    ("CIVIL_", "CIVIL-"),
    ("L-", "LANDSCAPE-"),
    ("L_", "LANDSCAPE-"),
    ("LA-", "LANDSCAPE-"),
    ("LA_", "LANDSCAPE-"),
    ("LAND-", "LANDSCAPE-"),
    ("LAND_", "LANDSCAPE-"),
    ("LANDSCAPE-", "LANDSCAPE-"),
    ("LANDSCAPE_", "LANDSCAPE-"),
    ("I-", "INTERIOR-"),
    ("I_", "INTERIOR-"),
    ("ID-", "INTERIOR-"),
    ("ID_", "INTERIOR-"),
    ("INT-", "INTERIOR-"),
    ("INT_", "INTERIOR-"),
    ("INTERIOR-", "INTERIOR-"),
    ("INTERIOR_", "INTERIOR-"),
];

/// 类别及其多语言关键字，按此顺序匹配。
const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("WALL", r"WALL|PARTITION|WAND|MUR|PARED|MURO|W-|W_|WA-|WA_"),
    ("COLUMN", r"COL|COLUMN|PILLAR|STÜTZE|COLONNE|COLUMNA|PILAR|C-|C_|CO-|CO_"),
    ("BEAM", r"BEAM|GIRDER|TRÄGER|POUTRE|VIGA|TRAVE|B-|B_|BM-|BM_"),
    ("SLAB", r"SLAB|FLOOR|DECKE|BODEN|DALLE|PLANCHER|LOSA|PISO|PLACA|FL-|FL_|SL-|SL_"),
    ("ROOF", r"ROOF|CEILING|DACH|TOIT|TECHO|CUBIERTA|SOFFITTO|RF-|RF_|CE-|CE_"),
    ("FOUNDATION", r"FOUND|FOUNDATION|FUNDAMENT|FONDATION|CIMIENTO|FND-|FND_|FDN"),
    ("STAIR", r"STAIR|STEP|TREPPE|ESCALIER|ESCALERA|ST-|ST_|STR-|STR_"),
    ("RAILING", r"RAIL|RAILING|GELÄNDER|GARDE-CORPS|BARANDILLA|RL-|RL_"),
    ("DOOR", r"DOOR|TÜR|PORTE|PUERTA|PORTA|D-|D_|DR-|DR_"),
    ("WINDOW", r"WINDOW|FENSTER|FENÊTRE|VENTANA|FINESTRA|W-|W_|WN-|WN_"),
    ("FURNITURE", r"FURN|FURNITURE|MÖBEL|MEUBLE|MUEBLE|MOBILI|FFE|FF&E|F-|F_"),
    ("PLUMBING", r"PLUMB|PLUMBING|SANITÄR|PLOMBERIE|FONTANERÍA|P-|P_|PL-|PL_"),
    ("ELECTRICAL", r"ELEC|ELECTRICAL|ELEKTRO|ÉLECTRIQUE|ELÉCTRICO|E-|E_|EL-|EL_"),
    ("HVAC", r"HVAC|MECHANICAL|KLIMA|CVC|CLIMATIZACIÓN|H-|H_|MH-|MH_|MC-|MC_"),
];

static CATEGORY_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    CATEGORY_KEYWORDS
        .iter()
        .map(|(category, keywords)| {
            let pattern =
                Regex::new(&format!("(?i){keywords}")).expect("invalid layer category pattern");
            (*category, pattern)
        })
        .collect()
});

/// 带缓存的图层名规范化器，可在多个线程间共享。
#[derive(Debug, Default)]
pub struct LayerNormalizer {
    cache: Mutex<HashMap<String, String>>,
}

impl LayerNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&self, original: &str) -> String {
        if original.is_empty() {
            return UNKNOWN_LAYER.to_string();
        }
        if let Some(cached) = self.cached(original) {
            return cached;
        }

        let normalized = Self::compute(original);
        trace!(original, normalized = %normalized, "图层名规范化");
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(original.to_string(), normalized.clone());
        }
        normalized
    }

    fn cached(&self, original: &str) -> Option<String> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(original).cloned())
    }

    fn compute(original: &str) -> String {
        let mut normalized = original.trim().to_uppercase();

        if let Some((standard, _)) = NUMERIC_LAYERS
            .iter()
            .find(|(_, numeric)| *numeric == normalized)
        {
            return standard.to_string();
        }

        if let Some((prefix, replacement)) = DISCIPLINE_PREFIXES
            .iter()
            .find(|(prefix, _)| normalized.starts_with(prefix))
        {
            normalized = format!("{replacement}{}", &normalized[prefix.len()..]);
        }

        if let Some((term, suffix)) = normalized.split_once(" - ") {
            if let Some(category) = term_category(term) {
                normalized = format!("ARCH-{category}-{}", suffix.replace(' ', "_"));
            }
        }

        if !contains_category(&normalized) {
            if let Some(category) = identify_category(&normalized) {
                normalized = format!("{normalized}-{category}");
            }
        }
        normalized
    }

    /// 规范化后相同，或 Jaro-Winkler 相似度不低于阈值。
    pub fn are_similar(&self, first: &str, second: &str) -> bool {
        let left = self.normalize(first);
        let right = self.normalize(second);
        left == right || jaro_winkler(&left, &right) >= SIMILARITY_THRESHOLD
    }

    /// 规范化名称中出现的第一个类别名；没有时按多语言关键字识别。
    pub fn category(&self, layer: &str) -> Option<&'static str> {
        let normalized = self.normalize(layer);
        CATEGORY_KEYWORDS
            .iter()
            .map(|(category, _)| *category)
            .find(|category| normalized.contains(category))
            .or_else(|| identify_category(&normalized))
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

fn term_category(term: &str) -> Option<&'static str> {
    let category = match term.trim().to_uppercase().as_str() {
        "WALL" | "WALLS" => "WALL",
        "COLUMN" | "COLUMNS" => "COLUMN",
        "BEAM" | "BEAMS" => "BEAM",
        "FLOOR" | "FLOORS" | "SLAB" | "SLABS" => "SLAB",
        "CEILING" | "CEILINGS" => "CEILING",
        "ROOF" | "ROOFS" => "ROOF",
        "DOOR" | "DOORS" => "DOOR",
        "WINDOW" | "WINDOWS" => "WINDOW",
        "STAIR" | "STAIRS" => "STAIR",
        "RAILING" | "RAILINGS" => "RAILING",
        "FURNITURE" => "FURNITURE",
        "PLUMBING" | "FIXTURES" => "PLUMBING",
        "ELECTRICAL" => "ELECTRICAL",
        "HVAC" | "MECHANICAL" => "HVAC",
        _ => return None,
    };
    Some(category)
}

fn contains_category(name: &str) -> bool {
    CATEGORY_KEYWORDS
        .iter()
        .any(|(category, _)| name.contains(category))
}

fn identify_category(name: &str) -> Option<&'static str> {
    CATEGORY_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(name))
        .map(|(category, _)| *category)
}

/// Jaro-Winkler 相似度，取值 0..=1。
///
/// Jaro 分数不低于 0.7 时才加公共前缀奖励；前缀最多 4 个字符，
/// 奖励系数取 `min(0.1, 1 / 较长串长度)`。
pub fn jaro_winkler(first: &str, second: &str) -> f64 {
    let left: Vec<char> = first.chars().collect();
    let right: Vec<char> = second.chars().collect();
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let (shorter, longer) = if left.len() <= right.len() {
        (&left, &right)
    } else {
        (&right, &left)
    };
    let window = (longer.len() / 2).saturating_sub(1);

    let mut shorter_matched = vec![false; shorter.len()];
    let mut longer_matched = vec![false; longer.len()];
    let mut matches = 0usize;
    for (i, ch) in shorter.iter().enumerate() {
        let start = i.saturating_sub(window);
        let end = (i + window + 1).min(longer.len());
        for j in start..end {
            if !longer_matched[j] && longer[j] == *ch {
                shorter_matched[i] = true;
                longer_matched[j] = true;
                matches += 1;
                break;
            }
        }
    }
    if matches == 0 {
        return 0.0;
    }

    let shorter_seq = shorter
        .iter()
        .zip(&shorter_matched)
        .filter(|(_, matched)| **matched)
        .map(|(ch, _)| *ch);
    let longer_seq = longer
        .iter()
        .zip(&longer_matched)
        .filter(|(_, matched)| **matched)
        .map(|(ch, _)| *ch);
    let half_transpositions = shorter_seq
        .zip(longer_seq)
        .filter(|(a, b)| a != b)
        .count();
    let transpositions = (half_transpositions / 2) as f64;

    let m = matches as f64;
    let jaro =
        (m / shorter.len() as f64 + m / longer.len() as f64 + (m - transpositions) / m) / 3.0;
    if jaro < 0.7 {
        return jaro;
    }

    let prefix = left
        .iter()
        .zip(&right)
        .take(4)
        .take_while(|(a, b)| a == b)
        .count() as f64;
    let boost = 0.1_f64.min(1.0 / longer.len() as f64);
    jaro + boost * prefix * (1.0 - jaro)
}
