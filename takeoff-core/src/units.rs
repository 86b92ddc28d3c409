//! 图纸单位与比例换算。
//!
//! 解析顺序：HEADER 中的 `$INSUNITS` → `$TITLE` 中的单位提示 → 文字中的
//! “SCALE 1:N” 标注 → 参照物标定 → 默认毫米。HEADER 中的比例变量存在时
//! 直接覆盖换算系数。

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const MM_TO_M: f64 = 0.001;
pub const CM_TO_M: f64 = 0.01;
pub const M_TO_M: f64 = 1.0;
pub const INCH_TO_M: f64 = 0.0254;
pub const FOOT_TO_M: f64 = 0.3048;

static SCALE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)SCALE\s*:?\s*(?:1\s*:\s*(\d+(?:\.\d+)?)|(\d+(?:\.\d+)?)\s*=\s*1\b)")
        .expect("invalid scale pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitType {
    Millimeters,
    Centimeters,
    Meters,
    Inches,
    Feet,
    Unknown,
}

impl UnitType {
    /// 按最近距离匹配时的比较顺序，相等时靠前者优先。
    const RESOLVED: [UnitType; 5] = [
        UnitType::Millimeters,
        UnitType::Centimeters,
        UnitType::Meters,
        UnitType::Inches,
        UnitType::Feet,
    ];

    /// 每个图纸单位对应的米数；`Unknown` 没有固定值。
    pub fn meters_per_unit(self) -> Option<f64> {
        match self {
            UnitType::Millimeters => Some(MM_TO_M),
            UnitType::Centimeters => Some(CM_TO_M),
            UnitType::Meters => Some(M_TO_M),
            UnitType::Inches => Some(INCH_TO_M),
            UnitType::Feet => Some(FOOT_TO_M),
            UnitType::Unknown => None,
        }
    }

    /// `$INSUNITS` 代码：1=英寸，2=英尺，4=毫米，5=厘米，6=米。
    pub fn from_insunits(code: i32) -> Option<Self> {
        match code {
            1 => Some(UnitType::Inches),
            2 => Some(UnitType::Feet),
            4 => Some(UnitType::Millimeters),
            5 => Some(UnitType::Centimeters),
            6 => Some(UnitType::Meters),
            _ => None,
        }
    }

    /// 与给定系数距离最近的单位。
    pub fn nearest_to_factor(factor: f64) -> Self {
        let mut best = UnitType::Millimeters;
        let mut best_diff = f64::INFINITY;
        for unit in Self::RESOLVED {
            let diff = (factor - unit.meters_per_unit().unwrap_or(M_TO_M)).abs();
            if diff < best_diff {
                best = unit;
                best_diff = diff;
            }
        }
        best
    }

    /// 从图纸标题里的单位字样推断，例如 "PLAN (MM)"。
    pub fn from_title(title: &str) -> Option<Self> {
        let upper = title.to_uppercase();
        if upper.contains("MM") || upper.contains("MILLIMET") {
            Some(UnitType::Millimeters)
        } else if upper.contains("CM") || upper.contains("CENTIMET") {
            Some(UnitType::Centimeters)
        } else if upper.contains(" M ") || upper.contains("METER") || upper.contains("METRE") {
            Some(UnitType::Meters)
        } else if upper.contains('"') || upper.contains("INCH") {
            Some(UnitType::Inches)
        } else if upper.contains('\'') || upper.contains("FT") || upper.contains("FEET") {
            Some(UnitType::Feet)
        } else {
            None
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitType::Millimeters => "millimeters",
            UnitType::Centimeters => "centimeters",
            UnitType::Meters => "meters",
            UnitType::Inches => "inches",
            UnitType::Feet => "feet",
            UnitType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// 单位最终由哪类依据确定，便于报告与日志。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleSource {
    Header,
    Title,
    TextCallout,
    Calibration,
    Default,
}

/// 一次解析收集到的单位证据。
#[derive(Debug, Clone, Default)]
pub struct ScaleEvidence {
    pub insunits: Option<i32>,
    pub title: Option<String>,
    pub header_scale: Option<f64>,
    pub texts: Vec<String>,
    /// (参照物名称, 图纸单位下测得的尺寸)，按优先级排列。
    pub calibrations: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub apply_text_scale: bool,
    pub honor_header_scale: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            apply_text_scale: true,
            honor_header_scale: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitScaleManager {
    unit_type: UnitType,
    scale_factor: f64,
    reference_objects: Vec<(String, f64)>,
}

impl Default for UnitScaleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitScaleManager {
    pub fn new() -> Self {
        Self {
            unit_type: UnitType::Unknown,
            scale_factor: 1.0,
            reference_objects: vec![
                ("DOOR".to_string(), 0.9),
                ("WINDOW".to_string(), 1.2),
                ("PARKING".to_string(), 2.5),
                ("STAIR".to_string(), 0.3),
                ("TOILET".to_string(), 0.7),
                ("COLUMN".to_string(), 0.3),
            ],
        }
    }

    /// 以固定单位构造，常用于测试或调用方已知单位的场景。
    pub fn with_unit(unit_type: UnitType) -> Self {
        let mut manager = Self::new();
        manager.set_unit_type(unit_type);
        manager
    }

    #[inline]
    pub fn unit_type(&self) -> UnitType {
        self.unit_type
    }

    #[inline]
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn set_unit_type(&mut self, unit_type: UnitType) {
        self.unit_type = unit_type;
        if let Some(factor) = unit_type.meters_per_unit() {
            self.scale_factor = factor;
        }
        debug!(unit = %unit_type, factor = self.scale_factor, "设置图纸单位");
    }

    /// 非正数被忽略。
    pub fn set_scale_factor(&mut self, factor: f64) {
        if factor > 0.0 && factor.is_finite() {
            self.scale_factor = factor;
            debug!(factor, "设置换算系数");
        } else {
            warn!(factor, "忽略非法的换算系数");
        }
    }

    /// 应用 `$INSUNITS`，未知代码保持当前状态并返回 `false`。
    pub fn apply_header_units(&mut self, code: i32) -> bool {
        match UnitType::from_insunits(code) {
            Some(unit) => {
                self.set_unit_type(unit);
                true
            }
            None => {
                warn!(code, "未知的 $INSUNITS 单位代码");
                false
            }
        }
    }

    /// 在文字内容中查找 “SCALE 1:N” 或 “SCALE N=1”，返回第一个 N。
    pub fn detect_scale_from_text<'a>(texts: impl IntoIterator<Item = &'a str>) -> Option<f64> {
        for text in texts {
            let Some(captures) = SCALE_PATTERN.captures(text) else {
                continue;
            };
            let raw = captures.get(1).or_else(|| captures.get(2));
            if let Some(ratio) = raw.and_then(|m| m.as_str().parse::<f64>().ok()) {
                if ratio > 0.0 {
                    debug!(ratio, text, "从文字中识别到比例标注");
                    return Some(ratio);
                }
            }
        }
        None
    }

    /// 比例标注只影响换算系数：系数 = 当前单位基准 × N，单位类型不变。
    pub fn apply_scale_callout(&mut self, ratio: f64) {
        let base = self.unit_type.meters_per_unit().unwrap_or(MM_TO_M);
        self.set_scale_factor(base * ratio);
    }

    /// 新增或替换参照物（名称不区分大小写）。新名称追加在表尾。
    pub fn add_reference_object(&mut self, name: &str, real_size_meters: f64) {
        let key = name.to_uppercase();
        match self.reference_objects.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = real_size_meters,
            None => self.reference_objects.push((key, real_size_meters)),
        }
    }

    /// 名称中包含的第一个参照物（按表顺序）的真实尺寸。
    pub fn reference_size(&self, name: &str) -> Option<f64> {
        let upper = name.to_uppercase();
        self.reference_objects
            .iter()
            .find(|(key, _)| upper.contains(key.as_str()))
            .map(|(_, size)| *size)
    }

    /// 用参照物标定：系数 = 期望真实尺寸 / 测得尺寸，单位取最接近的固定单位。
    pub fn calibrate(&mut self, object_name: &str, measured_size: f64) -> bool {
        let Some(expected) = self.reference_size(object_name) else {
            return false;
        };
        if measured_size <= 0.0 || !measured_size.is_finite() {
            return false;
        }
        let factor = expected / measured_size;
        self.unit_type = UnitType::nearest_to_factor(factor);
        self.set_scale_factor(factor);
        info!(
            object = object_name,
            measured_size,
            factor,
            unit = %self.unit_type,
            "通过参照物完成比例标定"
        );
        true
    }

    /// 按优先级消费证据，返回最终依据。
    pub fn resolve(&mut self, evidence: &ScaleEvidence, options: ResolveOptions) -> ScaleSource {
        let mut source = ScaleSource::Default;
        let mut callout = None;

        if let Some(code) = evidence.insunits {
            if self.apply_header_units(code) {
                source = ScaleSource::Header;
            }
        }

        if source == ScaleSource::Default {
            if let Some(unit) = evidence.title.as_deref().and_then(UnitType::from_title) {
                self.set_unit_type(unit);
                source = ScaleSource::Title;
            }
        }

        if source == ScaleSource::Default && options.apply_text_scale {
            callout = Self::detect_scale_from_text(evidence.texts.iter().map(String::as_str));
            if callout.is_some() {
                source = ScaleSource::TextCallout;
            }
        }

        if source == ScaleSource::Default {
            for (name, measured) in &evidence.calibrations {
                if self.calibrate(name, *measured) {
                    source = ScaleSource::Calibration;
                    break;
                }
            }
        }

        if self.unit_type == UnitType::Unknown {
            info!("未能识别图纸单位，默认按毫米处理");
            self.set_unit_type(UnitType::Millimeters);
        }

        if let Some(ratio) = callout {
            self.apply_scale_callout(ratio);
        }

        if options.honor_header_scale {
            if let Some(factor) = evidence.header_scale {
                self.set_scale_factor(factor);
            }
        }

        info!(
            unit = %self.unit_type,
            factor = self.scale_factor,
            source = ?source,
            "单位解析完成"
        );
        source
    }

    #[inline]
    pub fn to_meters(&self, value: f64) -> f64 {
        value * self.scale_factor
    }

    #[inline]
    pub fn from_meters(&self, meters: f64) -> f64 {
        meters / self.scale_factor
    }

    /// 面积按系数平方换算。
    #[inline]
    pub fn to_square_meters(&self, area: f64) -> f64 {
        area * self.scale_factor * self.scale_factor
    }
}
