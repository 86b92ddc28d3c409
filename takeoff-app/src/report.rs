use std::fmt::Write as _;

use takeoff_engine::TakeoffReport;

/// 终端文本形式的报告。
pub fn render_text(report: &TakeoffReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "图纸：{}", report.source.display());
    let _ = writeln!(
        out,
        "单位={}, 比例系数={}, 依据={:?}",
        report.unit_type, report.scale_factor, report.scale_source
    );

    if report.is_empty() {
        let _ = writeln!(out, "未统计到任何工程量。");
    } else {
        let width = report
            .items
            .iter()
            .map(|item| item.material.chars().count())
            .max()
            .unwrap_or(0);
        let _ = writeln!(out, "工程量清单：");
        for item in &report.items {
            let _ = writeln!(
                out,
                "  - {:<width$}  {:>12.3} {}",
                item.material,
                item.quantity,
                item.unit,
                width = width
            );
        }
    }

    let stats = &report.stats;
    let _ = writeln!(
        out,
        "实体：处理 {}，过滤 {}，重复 {}，错误 {}，丢弃 {}",
        stats.processed, stats.filtered, stats.duplicates, stats.errors, stats.discarded
    );
    out
}

pub fn render_json(reports: &[TakeoffReport]) -> serde_json::Result<String> {
    match reports {
        [single] => serde_json::to_string_pretty(single),
        _ => serde_json::to_string_pretty(reports),
    }
}
