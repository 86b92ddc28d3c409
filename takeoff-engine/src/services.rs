//! 外部协作方的接口：图纸格式转换与算量结果存档。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use takeoff_core::model::QuantityItem;
use tracing::{debug, info};

use crate::errors::EngineError;

/// 把其它 CAD 格式转换为可解析的 DXF，返回转换结果的路径。
pub trait DrawingConverter: Send + Sync {
    fn name(&self) -> &'static str;
    fn convert(&self, source: &Path) -> Result<PathBuf, EngineError>;
}

/// 只接受 `.dxf` 文件，原样返回路径。
#[derive(Debug, Default, Clone, Copy)]
pub struct DxfPassthrough;

impl DrawingConverter for DxfPassthrough {
    fn name(&self) -> &'static str {
        "dxf-passthrough"
    }

    fn convert(&self, source: &Path) -> Result<PathBuf, EngineError> {
        let is_dxf = source
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("dxf"));
        if is_dxf {
            debug!(path = %source.display(), "DXF 文件无需转换");
            Ok(source.to_path_buf())
        } else {
            Err(EngineError::Service {
                service: self.name(),
                message: format!("不支持的图纸格式: {}", source.display()),
            })
        }
    }
}

/// 一次待存档的算量结果。
#[derive(Debug, Clone, Copy)]
pub struct TakeoffSubmission<'a> {
    pub identity: &'a str,
    pub source_name: &'a str,
    pub items: &'a [QuantityItem],
    pub rendered_document: Option<&'a Path>,
}

pub trait TakeoffStore: Send + Sync {
    fn name(&self) -> &'static str;
    /// 保存成功时返回记录编号。
    fn save(&self, submission: &TakeoffSubmission<'_>) -> Result<u64, EngineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredTakeoff {
    pub id: u64,
    pub identity: String,
    pub source_name: String,
    pub items: Vec<QuantityItem>,
    pub rendered_document: Option<PathBuf>,
}

/// 进程内存档，编号从 1 开始递增。
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredTakeoff>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StoredTakeoff> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl TakeoffStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory-store"
    }

    fn save(&self, submission: &TakeoffSubmission<'_>) -> Result<u64, EngineError> {
        let mut records = self.records.lock().map_err(|_| EngineError::Service {
            service: self.name(),
            message: "存档锁已损坏".to_string(),
        })?;
        let id = records.len() as u64 + 1;
        records.push(StoredTakeoff {
            id,
            identity: submission.identity.to_string(),
            source_name: submission.source_name.to_string(),
            items: submission.items.to_vec(),
            rendered_document: submission.rendered_document.map(Path::to_path_buf),
        });
        info!(
            id,
            source = submission.source_name,
            items = submission.items.len(),
            "算量结果已存档"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use takeoff_core::model::QuantityUnit;

    #[test]
    fn passthrough_accepts_dxf_only() {
        let converter = DxfPassthrough;
        assert_eq!(
            converter.convert(Path::new("plans/L1.DXF")).expect("dxf accepted"),
            PathBuf::from("plans/L1.DXF")
        );
        let err = converter
            .convert(Path::new("plans/L1.dwg"))
            .expect_err("dwg rejected");
        assert!(matches!(err, EngineError::Service { service: "dxf-passthrough", .. }));
    }

    #[test]
    fn memory_store_assigns_sequential_ids() {
        let store = MemoryStore::new();
        let items = vec![QuantityItem::new("Walls", 12.5, QuantityUnit::Meters)];
        let submission = TakeoffSubmission {
            identity: "estimator",
            source_name: "L1.dxf",
            items: &items,
            rendered_document: None,
        };
        assert_eq!(store.save(&submission).expect("save"), 1);
        assert_eq!(store.save(&submission).expect("save"), 2);
        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].items, items);
    }
}
