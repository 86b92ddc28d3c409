use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem;
use std::path::{Path, PathBuf};

use takeoff_core::errors::EntityError;
use takeoff_core::geometry::{self, Point2};
use takeoff_core::model::{EntityKind, OWNER_BLOCK_KEY, RawEntityEvent};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("DXF file {path:?} does not exist")]
    NotFound { path: PathBuf },
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// HEADER 段中的 `$变量` 及其首个取值。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderVariables {
    values: HashMap<String, String>,
}

impl HeaderVariables {
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.entry(name.into()).or_insert_with(|| value.into());
    }

    /// `$INSUNITS` 单位代码。
    pub fn insunits(&self) -> Option<i32> {
        self.get("$INSUNITS")
            .and_then(|raw| raw.trim().parse::<i32>().ok())
    }

    pub fn title(&self) -> Option<&str> {
        self.get("$TITLE")
    }

    /// 读取数值型变量，例如 `$DIMSCALE`。
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|raw| raw.trim().parse::<f64>().ok())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Text,
    MText,
}

/// TEXT / MTEXT 实体的文字内容，用于识别比例标注。
#[derive(Debug, Clone, PartialEq)]
pub struct TextEvent {
    pub kind: TextKind,
    pub layer: String,
    pub content: String,
    pub position: Option<Point2>,
    pub block_name: Option<String>,
}

/// 解析事件的接收方。只有实体处理失败会被计入错误。
pub trait DxfEventHandler {
    fn handle_entity(&mut self, event: RawEntityEvent) -> Result<(), EntityError>;

    fn handle_header(&mut self, _header: &HeaderVariables) {}

    fn handle_text(&mut self, _text: TextEvent) {}

    fn handle_layer(&mut self, _name: &str) {}
}

impl<F> DxfEventHandler for F
where
    F: FnMut(RawEntityEvent) -> Result<(), EntityError>,
{
    fn handle_entity(&mut self, event: RawEntityEvent) -> Result<(), EntityError> {
        self(event)
    }
}

/// 单次解析的计数器。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub processed: usize,
    pub errors: usize,
    pub discarded: usize,
    pub layers: usize,
    pub blocks: usize,
}

/// 流式 DXF 解析器：逐对读取组码/值，驱动 SECTION/LAYER/BLOCK/ENTITY 状态机，
/// 把识别出的实体交给处理器。单个实体的失败只记录计数，读文件失败才会返回错误。
#[derive(Debug, Default)]
pub struct DxfStreamParser {
    stats: ParseStats,
}

impl DxfStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    pub fn parse_file<H>(&mut self, path: &Path, handler: &mut H) -> Result<(), IoError>
    where
        H: DxfEventHandler + ?Sized,
    {
        if !path.is_file() {
            return Err(IoError::NotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "开始解析 DXF");
        let file = File::open(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::with_capacity(BUFFER_SIZE, file);
        self.parse_reader(reader, handler)
            .map_err(|source| IoError::ReadError {
                path: path.to_path_buf(),
                source,
            })?;

        if self.stats.errors > 0 {
            warn!(
                path = %path.display(),
                processed = self.stats.processed,
                errors = self.stats.errors,
                "DXF 解析完成，存在出错的实体"
            );
        } else {
            info!(
                path = %path.display(),
                processed = self.stats.processed,
                "DXF 解析完成"
            );
        }
        Ok(())
    }

    /// 从任意缓冲读取源解析；只有底层读取失败才返回错误。
    pub fn parse_reader<R, H>(&mut self, reader: R, handler: &mut H) -> std::io::Result<()>
    where
        R: BufRead,
        H: DxfEventHandler + ?Sized,
    {
        self.stats = ParseStats::default();
        let mut lines = LineReader::new(reader);
        let mut state = ParseState::default();

        while let Some(code_line) = lines.next_line()? {
            let code = match code_line.trim().parse::<i32>() {
                Ok(code) => code,
                Err(_) => {
                    warn!(
                        line = lines.line_number,
                        content = %code_line.trim(),
                        "组码无法解析为整数，丢弃当前实体并从下一行继续"
                    );
                    self.record_anomaly(&mut state);
                    continue;
                }
            };
            let Some(value_line) = lines.next_line()? else {
                debug!(line = lines.line_number, "文件在组码之后结束，缺少值行");
                break;
            };
            self.handle_pair(code, value_line.trim(), &mut state, handler);
        }

        // 文字只作单位证据，已读到的内容照常交付；几何实体不完整则丢弃。
        match mem::take(&mut state.record) {
            Record::Entity(frame) => {
                debug!(kind = %frame.kind, "文件在实体中途结束，丢弃未完成的实体");
                self.stats.discarded += 1;
            }
            Record::Text(frame) => {
                debug!(layer = %frame.layer, "文件在文字实体中途结束，交付已读取的内容");
                handler.handle_text(frame.finish());
            }
            Record::Idle | Record::Layer | Record::Block => {}
        }
        Ok(())
    }

    fn record_anomaly(&mut self, state: &mut ParseState) {
        self.stats.errors += 1;
        if state.has_open_frame() {
            self.stats.discarded += 1;
        }
        state.record = Record::Idle;
    }

    fn handle_pair<H>(&mut self, code: i32, value: &str, state: &mut ParseState, handler: &mut H)
    where
        H: DxfEventHandler + ?Sized,
    {
        if code == 0 {
            self.start_record(value, state, handler);
            return;
        }
        if code == 999 {
            return;
        }
        if state.awaiting_section_name {
            state.awaiting_section_name = false;
            if code == 2 {
                state.section = Section::from_name(value);
                trace!(section = value, "进入 SECTION");
                return;
            }
        }
        if state.section == Section::Header {
            match code {
                9 => state.pending_variable = Some(value.to_string()),
                _ => {
                    if let Some(name) = state.pending_variable.take() {
                        state.header.insert(name, value);
                    }
                }
            }
            return;
        }

        match &mut state.record {
            Record::Idle => {}
            Record::Layer => {
                if code == 2 {
                    state.current_layer = value.to_string();
                    self.stats.layers += 1;
                    handler.handle_layer(value);
                }
            }
            Record::Block => {
                if code == 2 && state.current_block.is_none() {
                    state.current_block = Some(value.to_string());
                    self.stats.blocks += 1;
                    trace!(block = value, "进入块定义");
                }
            }
            Record::Text(frame) => {
                if code == 8 {
                    state.current_layer = value.to_string();
                }
                frame.accept(code, value);
            }
            Record::Entity(frame) => {
                if let Err(err) = frame.accept(code, value, &mut state.current_layer) {
                    warn!(kind = %frame.kind, error = %err, "实体数值无法解析，跳过该实体");
                    self.record_anomaly(state);
                }
            }
        }
    }

    fn start_record<H>(&mut self, value: &str, state: &mut ParseState, handler: &mut H)
    where
        H: DxfEventHandler + ?Sized,
    {
        match mem::replace(&mut state.record, Record::Idle) {
            Record::Entity(mut frame) if frame.kind == EntityKind::Polyline => match value {
                "VERTEX" => {
                    frame.in_vertex = true;
                    state.record = Record::Entity(frame);
                    return;
                }
                "SEQEND" => {
                    self.close_frame(frame, handler);
                    return;
                }
                _ => self.close_frame(frame, handler),
            },
            Record::Entity(frame) => self.close_frame(frame, handler),
            Record::Text(frame) => handler.handle_text(frame.finish()),
            Record::Idle | Record::Layer | Record::Block => {}
        }

        match value {
            "SECTION" => state.awaiting_section_name = true,
            "ENDSEC" => {
                if state.section == Section::Header {
                    debug!(variables = state.header.len(), "HEADER 段读取完成");
                    handler.handle_header(&state.header);
                }
                state.section = Section::None;
                state.pending_variable = None;
            }
            "LAYER" => state.record = Record::Layer,
            "BLOCK" => {
                state.in_block = true;
                state.current_block = None;
                state.record = Record::Block;
            }
            "ENDBLK" => {
                state.in_block = false;
                state.current_block = None;
            }
            "TEXT" | "MTEXT" => {
                let kind = if value == "TEXT" {
                    TextKind::Text
                } else {
                    TextKind::MText
                };
                state.record = Record::Text(TextFrame::open(kind, state));
            }
            other => {
                if let Some(kind) = EntityKind::from_dxf_name(other) {
                    let block_name = if state.in_block {
                        state.current_block.clone()
                    } else {
                        None
                    };
                    state.record = Record::Entity(EntityFrame::open(
                        kind,
                        state.current_layer.clone(),
                        block_name,
                    ));
                }
            }
        }
    }

    fn close_frame<H>(&mut self, frame: EntityFrame, handler: &mut H)
    where
        H: DxfEventHandler + ?Sized,
    {
        if frame.coordinates.is_empty() {
            trace!(kind = %frame.kind, "实体没有坐标，丢弃");
            self.stats.discarded += 1;
            return;
        }
        let event = frame.into_event();
        let kind = event.kind;
        let layer = event.layer.clone();
        match handler.handle_entity(event) {
            Ok(()) => self.stats.processed += 1,
            Err(err) => {
                warn!(kind = %kind, layer = %layer, error = %err, "处理实体失败");
                self.stats.errors += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Section {
    #[default]
    None,
    Header,
    Tables,
    Blocks,
    Entities,
    Other,
}

impl Section {
    fn from_name(name: &str) -> Self {
        match name {
            "HEADER" => Section::Header,
            "TABLES" => Section::Tables,
            "BLOCKS" => Section::Blocks,
            "ENTITIES" => Section::Entities,
            _ => Section::Other,
        }
    }
}

#[derive(Debug, Default)]
enum Record {
    #[default]
    Idle,
    Layer,
    Block,
    Entity(EntityFrame),
    Text(TextFrame),
}

#[derive(Debug, Default)]
struct ParseState {
    section: Section,
    awaiting_section_name: bool,
    current_layer: String,
    current_block: Option<String>,
    in_block: bool,
    record: Record,
    header: HeaderVariables,
    pending_variable: Option<String>,
}

impl ParseState {
    fn has_open_frame(&self) -> bool {
        matches!(self.record, Record::Entity(_))
    }
}

#[derive(Debug)]
struct EntityFrame {
    kind: EntityKind,
    layer: String,
    block_name: Option<String>,
    coordinates: Vec<f64>,
    properties: HashMap<String, String>,
    in_vertex: bool,
}

impl EntityFrame {
    fn open(kind: EntityKind, layer: String, block_name: Option<String>) -> Self {
        let mut properties = HashMap::new();
        properties.insert("type".to_string(), kind.dxf_name().to_string());
        if let Some(owner) = &block_name {
            properties.insert(OWNER_BLOCK_KEY.to_string(), owner.clone());
        }
        Self {
            kind,
            layer,
            block_name,
            coordinates: Vec::new(),
            properties,
            in_vertex: false,
        }
    }

    /// 每种实体写入平面坐标序列的组码；其余坐标类组码（Z 值、宽度、凸度等）
    /// 以原文记入属性表。
    fn is_planar_code(&self, code: i32) -> bool {
        match self.kind {
            EntityKind::Line => matches!(code, 10 | 20 | 11 | 21),
            EntityKind::LwPolyline => matches!(code, 10 | 20),
            EntityKind::Polyline => self.in_vertex && matches!(code, 10 | 20),
            EntityKind::Circle => matches!(code, 10 | 20 | 40),
            EntityKind::Insert => matches!(code, 10 | 20 | 41 | 42),
            EntityKind::Block => false,
        }
    }

    fn accept(
        &mut self,
        code: i32,
        value: &str,
        current_layer: &mut String,
    ) -> Result<(), EntityError> {
        match code {
            8 => {
                if !self.in_vertex {
                    *current_layer = value.to_string();
                    self.layer = value.to_string();
                }
            }
            2 if self.kind == EntityKind::Insert => {
                self.block_name = Some(value.to_string());
            }
            10 | 20 | 30 | 11 | 21 | 31 | 40 | 41 | 42 => {
                let number = value
                    .parse::<f64>()
                    .map_err(|_| EntityError::UnparseableValue {
                        code,
                        value: value.to_string(),
                    })?;
                if self.is_planar_code(code) {
                    self.coordinates.push(number);
                }
                let keep_as_property = !self.is_planar_code(code)
                    || (self.kind == EntityKind::Insert && matches!(code, 41 | 42));
                if keep_as_property && !self.in_vertex {
                    self.properties.insert(code.to_string(), value.to_string());
                }
            }
            70 | 71 | 72 | 73 | 62 | 6 => {
                if !self.in_vertex {
                    self.properties.insert(code.to_string(), value.to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn into_event(self) -> RawEntityEvent {
        let mut properties = self.properties;
        properties.insert("layer".to_string(), self.layer.clone());
        if let Some(name) = &self.block_name {
            properties.insert("blockName".to_string(), name.clone());
        }
        RawEntityEvent {
            kind: self.kind,
            coordinates: self.coordinates,
            layer: self.layer,
            block_name: self.block_name,
            properties,
        }
    }
}

#[derive(Debug)]
struct TextFrame {
    kind: TextKind,
    layer: String,
    block_name: Option<String>,
    chunks: Vec<String>,
    primary: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
}

impl TextFrame {
    fn open(kind: TextKind, state: &ParseState) -> Self {
        Self {
            kind,
            layer: state.current_layer.clone(),
            block_name: if state.in_block {
                state.current_block.clone()
            } else {
                None
            },
            chunks: Vec::new(),
            primary: None,
            x: None,
            y: None,
        }
    }

    fn accept(&mut self, code: i32, value: &str) {
        match code {
            8 => self.layer = value.to_string(),
            1 => self.primary = Some(value.to_string()),
            3 => self.chunks.push(value.to_string()),
            10 => self.x = value.parse::<f64>().ok(),
            20 => self.y = value.parse::<f64>().ok(),
            _ => {}
        }
    }

    fn finish(self) -> TextEvent {
        // MTEXT 的组码 3 是前置分段，组码 1 是最后一段。
        let mut raw = self.chunks.concat();
        if let Some(primary) = self.primary {
            raw.push_str(&primary);
        }
        let position = match (self.x, self.y) {
            (Some(x), Some(y)) => Some(Point2::new(x, y)),
            _ => None,
        };
        TextEvent {
            kind: self.kind,
            layer: self.layer,
            content: decode_text_content(&raw),
            position,
            block_name: self.block_name,
        }
    }
}

/// 实体指纹：种类、图层、块名与保留两位小数的关键坐标拼接而成，同一几何重复出现时相同。
///
/// 直线取两端点，多段线取包围盒，圆取圆心与半径，其余取前六个坐标值。
/// 块名对 INSERT 是被插入的块，对块定义内部的实体是所属块。
pub fn fingerprint(event: &RawEntityEvent) -> String {
    let coordinates = &event.coordinates;
    let key_values: Vec<f64> = match event.kind {
        EntityKind::Line if coordinates.len() >= 4 => coordinates[..4].to_vec(),
        kind if kind.is_polyline() && coordinates.len() >= 4 => {
            let bounds = geometry::bounds_of(coordinates);
            vec![
                bounds.min().x(),
                bounds.min().y(),
                bounds.max().x(),
                bounds.max().y(),
            ]
        }
        EntityKind::Circle if coordinates.len() >= 3 => coordinates[..3].to_vec(),
        _ => coordinates.iter().take(6).copied().collect(),
    };
    let rounded: Vec<String> = key_values
        .iter()
        .map(|value| format!("{:.2}", (value * 100.0).round() / 100.0))
        .collect();
    match event.block_name() {
        Some(block) => format!(
            "{}-{}-{}-{}",
            event.kind.dxf_name(),
            event.layer,
            block,
            rounded.join("-")
        ),
        None => format!("{}-{}-{}", event.kind.dxf_name(), event.layer, rounded.join("-")),
    }
}

struct LineReader<R> {
    reader: R,
    buffer: Vec<u8>,
    line_number: usize,
}

impl<R: BufRead> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            line_number: 0,
        }
    }

    /// 读取一行并去掉行尾的 `\n` / `\r\n`；非 UTF-8 字节按替换字符处理。
    fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buffer.clear();
        let read = self.reader.read_until(b'\n', &mut self.buffer)?;
        if read == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        while matches!(self.buffer.last(), Some(b'\n') | Some(b'\r')) {
            self.buffer.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buffer).into_owned()))
    }
}

/// 去掉常见的 MTEXT 格式控制符：`\P` 换行、`\~` 空格、`\S..;` 堆叠分数、
/// 以及 `{}` 分组括号。
fn decode_text_content(raw: &str) -> String {
    let mut result = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('P') | Some('p') => result.push('\n'),
                Some('~') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('S') | Some('s') => {
                    for next in chars.by_ref() {
                        if next == ';' {
                            break;
                        }
                    }
                }
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            },
            '{' | '}' => {}
            other => result.push(other),
        }
    }
    result
}
