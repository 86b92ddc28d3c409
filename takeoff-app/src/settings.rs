use takeoff_config::AppConfig;
use takeoff_engine::material::MaterialCatalog;
use takeoff_engine::{EngineError, TakeoffEngine, TakeoffOptions};

/// 命令行上可覆盖配置文件的开关。
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub merge_similar: bool,
    pub raw_units: bool,
    pub no_filter: bool,
}

pub fn takeoff_options(config: &AppConfig, overrides: Overrides) -> TakeoffOptions {
    let units = &config.units;
    let filter = &config.filter;
    let takeoff = &config.takeoff;
    TakeoffOptions {
        convert_to_meters: takeoff.convert_to_meters && !overrides.raw_units,
        merge_similar_layers: takeoff.merge_similar_layers || overrides.merge_similar,
        dedupe_entities: takeoff.dedupe_entities,
        include_block_definitions: takeoff.include_block_definitions,
        filter_enabled: filter.enabled && !overrides.no_filter,
        clean_polylines: filter.clean_polylines,
        min_line_length: filter.min_line_length,
        min_area: filter.min_area,
        exclusion_patterns: filter.exclude_layers.clone(),
        apply_text_scale: units.apply_text_scale,
        honor_header_scale: units.honor_header_scale,
        header_scale_variable: units.header_scale_variable.clone(),
        calibration: units
            .calibration
            .as_ref()
            .map(|calibration| (calibration.object.clone(), calibration.measured_size)),
        reference_objects: units
            .reference_objects
            .iter()
            .map(|(name, size)| (name.clone(), *size))
            .collect(),
    }
}

pub fn material_catalog(config: &AppConfig) -> MaterialCatalog {
    let materials = &config.materials;
    let mut catalog =
        MaterialCatalog::new().with_resolved_layers(materials.resolve_layer_materials);
    // 每条覆盖都插到表头，倒序写入后文件中靠前的条目优先。
    for mapping in materials.layers.iter().rev() {
        catalog.update_layer_mapping(&mapping.token, &mapping.material);
    }
    for mapping in materials.blocks.iter().rev() {
        catalog.update_block_mapping(&mapping.token, &mapping.material);
    }
    for (material, factor) in &materials.scale_factors {
        catalog.set_scale_factor(material, *factor);
    }
    catalog
}

pub fn build_engine(
    config: &AppConfig,
    overrides: Overrides,
) -> Result<TakeoffEngine, EngineError> {
    TakeoffEngine::builder()
        .options(takeoff_options(config, overrides))
        .catalog(material_catalog(config))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use takeoff_config::{CalibrationConfig, MaterialMapping};

    fn mapping(token: &str, material: &str) -> MaterialMapping {
        MaterialMapping {
            token: token.to_string(),
            material: material.to_string(),
        }
    }

    #[test]
    fn default_config_maps_to_default_options() {
        let options = takeoff_options(&AppConfig::default(), Overrides::default());
        assert_eq!(options, TakeoffOptions::default());
    }

    #[test]
    fn overrides_win_over_config() {
        let mut config = AppConfig::default();
        config.units.calibration = Some(CalibrationConfig {
            object: "DOOR".to_string(),
            measured_size: 90.0,
        });
        config.units.reference_objects.insert("GATE".to_string(), 3.0);
        let options = takeoff_options(
            &config,
            Overrides {
                merge_similar: true,
                raw_units: true,
                no_filter: true,
            },
        );
        assert!(options.merge_similar_layers);
        assert!(!options.convert_to_meters);
        assert!(!options.filter_enabled);
        assert_eq!(options.calibration, Some(("DOOR".to_string(), 90.0)));
        assert_eq!(options.reference_objects, vec![("GATE".to_string(), 3.0)]);
    }

    #[test]
    fn catalog_receives_configured_mappings() {
        let mut config = AppConfig::default();
        config.materials.resolve_layer_materials = true;
        config.materials.layers = vec![
            mapping("A-GLAZ", "External Glazing"),
            mapping("GLAZ", "Glazing"),
        ];
        config.materials.blocks = vec![mapping("FD-", "Fire Doors")];
        config.materials.scale_factors.insert("Glazing".to_string(), 1.1);

        let catalog = material_catalog(&config);
        assert_eq!(catalog.layer_material("A-GLAZ-EXT"), "External Glazing");
        assert_eq!(catalog.layer_material("S-GLAZ"), "Glazing");
        assert_eq!(catalog.block_material("FD-90"), "Fire Doors");
        assert!((catalog.scale_factor("Glazing") - 1.1).abs() < 1e-12);
    }

    #[test]
    fn earlier_mappings_in_the_file_take_precedence() {
        let mut config = AppConfig::default();
        config.materials.resolve_layer_materials = true;
        config.materials.layers = vec![
            mapping("GLAZ", "Glazing"),
            mapping("A-GLAZ", "External Glazing"),
        ];
        let catalog = material_catalog(&config);
        assert_eq!(catalog.layer_material("A-GLAZ-EXT"), "Glazing");
    }

    #[test]
    fn invalid_exclusion_pattern_fails_engine_build() {
        let mut config = AppConfig::default();
        config.filter.exclude_layers.push("(".to_string());
        let err = build_engine(&config, Overrides::default()).expect_err("非法正则应当报错");
        assert!(matches!(err, EngineError::InvalidPattern { .. }));
    }
}
