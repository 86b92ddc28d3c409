use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "TAKEOFF_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub units: UnitsConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub materials: MaterialsConfig,
    #[serde(default)]
    pub takeoff: TakeoffConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 自动发现配置文件：优先读取环境变量 `TAKEOFF_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 参照物标定：图纸中某个参照物的测量尺寸（图纸单位）。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalibrationConfig {
    pub object: String,
    pub measured_size: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitsConfig {
    #[serde(default = "default_true")]
    pub honor_header_scale: bool,
    #[serde(default = "UnitsConfig::default_header_scale_variable")]
    pub header_scale_variable: String,
    #[serde(default = "default_true")]
    pub apply_text_scale: bool,
    #[serde(default)]
    pub calibration: Option<CalibrationConfig>,
    /// 追加或覆盖参照物的真实尺寸（米）。
    #[serde(default)]
    pub reference_objects: BTreeMap<String, f64>,
}

impl UnitsConfig {
    fn default_header_scale_variable() -> String {
        "$USERR1".to_string()
    }
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            honor_header_scale: true,
            header_scale_variable: Self::default_header_scale_variable(),
            apply_text_scale: true,
            calibration: None,
            reference_objects: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "FilterConfig::default_min_line_length")]
    pub min_line_length: f64,
    #[serde(default = "FilterConfig::default_min_area")]
    pub min_area: f64,
    #[serde(default)]
    pub exclude_layers: Vec<String>,
    #[serde(default)]
    pub clean_polylines: bool,
}

impl FilterConfig {
    fn default_min_line_length() -> f64 {
        0.05
    }

    fn default_min_area() -> f64 {
        0.01
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_line_length: Self::default_min_line_length(),
            min_area: Self::default_min_area(),
            exclude_layers: Vec::new(),
            clean_polylines: false,
        }
    }
}

/// 一条 token → 材料映射。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MaterialMapping {
    pub token: String,
    pub material: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaterialsConfig {
    /// 图层映射，优先于内置映射；多条同时命中时文件中靠前的生效。
    #[serde(default)]
    pub layers: Vec<MaterialMapping>,
    #[serde(default)]
    pub blocks: Vec<MaterialMapping>,
    /// 材料 → 放大系数。
    #[serde(default)]
    pub scale_factors: BTreeMap<String, f64>,
    /// 图层材料是否按映射表解析；关闭时直接使用图层名。
    #[serde(default)]
    pub resolve_layer_materials: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TakeoffConfig {
    #[serde(default = "default_true")]
    pub convert_to_meters: bool,
    #[serde(default)]
    pub merge_similar_layers: bool,
    #[serde(default)]
    pub dedupe_entities: bool,
    #[serde(default = "default_true")]
    pub include_block_definitions: bool,
}

impl Default for TakeoffConfig {
    fn default() -> Self {
        Self {
            convert_to_meters: true,
            merge_similar_layers: false,
            dedupe_entities: false,
            include_block_definitions: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_engine_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.units.honor_header_scale);
        assert_eq!(cfg.units.header_scale_variable, "$USERR1");
        assert!(cfg.filter.enabled);
        assert!((cfg.filter.min_line_length - 0.05).abs() < 1e-12);
        assert!((cfg.filter.min_area - 0.01).abs() < 1e-12);
        assert!(cfg.materials.layers.is_empty());
        assert!(!cfg.materials.resolve_layer_materials);
        assert!(cfg.takeoff.convert_to_meters);
        assert!(cfg.takeoff.include_block_definitions);
    }

    #[test]
    fn load_from_temp_file() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(
            file,
            r#"
            [logging]
            level = "debug"

            [units]
            apply_text_scale = false
            calibration = {{ object = "DOOR", measured_size = 900.0 }}
            reference_objects = {{ GATE = 3.0 }}

            [filter]
            min_line_length = 0.1
            exclude_layers = ["Z-.*", "TEMP"]

            [materials]
            resolve_layer_materials = true
            blocks = [{{ token = "FD-", material = "Fire Doors" }}]
            scale_factors = {{ Walls = 1.05 }}

            [[materials.layers]]
            token = "A-GLAZ"
            material = "External Glazing"

            [[materials.layers]]
            token = "GLAZ"
            material = "Glazing"

            [takeoff]
            merge_similar_layers = true
            "#
        )
        .expect("write temp file");

        let cfg = AppConfig::from_file(file.path()).expect("load config");
        assert_eq!(cfg.logging.level, "debug");
        assert!(!cfg.units.apply_text_scale);
        assert!(cfg.units.honor_header_scale);
        assert_eq!(
            cfg.units.calibration,
            Some(CalibrationConfig {
                object: "DOOR".to_string(),
                measured_size: 900.0,
            })
        );
        assert_eq!(cfg.units.reference_objects.get("GATE"), Some(&3.0));
        assert!((cfg.filter.min_line_length - 0.1).abs() < 1e-12);
        assert!((cfg.filter.min_area - 0.01).abs() < 1e-12);
        assert_eq!(cfg.filter.exclude_layers.len(), 2);
        assert!(cfg.materials.resolve_layer_materials);
        let tokens: Vec<&str> = cfg
            .materials
            .layers
            .iter()
            .map(|mapping| mapping.token.as_str())
            .collect();
        assert_eq!(tokens, vec!["A-GLAZ", "GLAZ"]);
        assert_eq!(
            cfg.materials.blocks,
            vec![MaterialMapping {
                token: "FD-".to_string(),
                material: "Fire Doors".to_string(),
            }]
        );
        assert_eq!(cfg.materials.scale_factors.get("Walls"), Some(&1.05));
        assert!(cfg.takeoff.merge_similar_layers);
        assert!(cfg.takeoff.convert_to_meters);
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[filter]\nmin_line_length = \"short\"").expect("write temp file");
        let err = AppConfig::from_file(file.path()).expect_err("type mismatch");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_reports_io_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let err = AppConfig::from_file(dir.path().join("absent.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
