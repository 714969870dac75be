//! Page layout analysis over a PDF content stream.
//!
//! Coordinates are PDF user space after the CTM is applied, so `y` grows
//! upward and reading order is descending `y`, then ascending `x`.

use crate::error::ExtractError;
use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};

/// Average glyph advance as a fraction of the font size. Font metrics are not
/// consulted, so run widths are estimates.
const GLYPH_ADVANCE: f32 = 0.5;
const DESCENT: f32 = 0.2;
const ASCENT: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    /// All four edges of `other` lie within this rectangle.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x0 >= self.x0 && other.x1 <= self.x1 && other.y0 >= self.y0 && other.y1 <= self.y1
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn intersects(&self, other: &Rect, tolerance: f32) -> bool {
        self.x0 - tolerance <= other.x1
            && other.x0 - tolerance <= self.x1
            && self.y0 - tolerance <= other.y1
            && other.y0 - tolerance <= self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }
}

/// A string drawn by one text-showing operator.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub bbox: Rect,
    pub baseline: f32,
    pub font_size: f32,
}

impl TextRun {
    pub fn new(text: impl Into<String>, x: f32, baseline: f32, font_size: f32) -> Self {
        let text = text.into();
        let width = text.chars().count() as f32 * font_size * GLYPH_ADVANCE;
        Self {
            bbox: Rect::new(
                x,
                baseline - DESCENT * font_size,
                x + width,
                baseline + ASCENT * font_size,
            ),
            text,
            baseline,
            font_size,
        }
    }
}

/// A straight painted path segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Segment {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn bbox(&self) -> Rect {
        Rect::new(self.x0, self.y0, self.x1, self.y1)
    }

    pub fn is_horizontal(&self) -> bool {
        (self.y1 - self.y0).abs() <= 1.0 && (self.x1 - self.x0).abs() >= 3.0
    }

    pub fn is_vertical(&self) -> bool {
        (self.x1 - self.x0).abs() <= 1.0 && (self.y1 - self.y0).abs() >= 3.0
    }
}

/// A group of text lines that read as one paragraph or cell.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub bbox: Rect,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageLayout {
    pub page_number: u32,
    pub runs: Vec<TextRun>,
    pub rulings: Vec<Segment>,
    /// Strings skipped because their encoding could not be decoded.
    pub undecoded_runs: usize,
}

impl PageLayout {
    pub fn analyse(
        document: &Document,
        page_number: u32,
        page_id: ObjectId,
    ) -> Result<Self, ExtractError> {
        let page_error = |details: String| ExtractError::Page {
            page: page_number,
            details,
        };

        let raw = document
            .get_page_content(page_id)
            .map_err(|error| page_error(error.to_string()))?;
        let content = Content::decode(&raw).map_err(|error| page_error(error.to_string()))?;

        let mut interpreter = Interpreter::default();
        for operation in &content.operations {
            interpreter.apply(&operation.operator, &operation.operands);
        }

        Ok(Self {
            page_number,
            runs: interpreter.runs,
            rulings: interpreter.rulings,
            undecoded_runs: interpreter.undecoded,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f32; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    fn translate(tx: f32, ty: f32) -> Matrix {
        Matrix([1.0, 0.0, 0.0, 1.0, tx, ty])
    }

    /// `self` applied first, then `other`.
    fn then(&self, other: &Matrix) -> Matrix {
        let [a1, b1, c1, d1, e1, f1] = self.0;
        let [a2, b2, c2, d2, e2, f2] = other.0;
        Matrix([
            a1 * a2 + b1 * c2,
            a1 * b2 + b1 * d2,
            c1 * a2 + d1 * c2,
            c1 * b2 + d1 * d2,
            e1 * a2 + f1 * c2 + e2,
            e1 * b2 + f1 * d2 + f2,
        ])
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [a, b, c, d, e, f] = self.0;
        (a * x + c * y + e, b * x + d * y + f)
    }

    fn vertical_scale(&self) -> f32 {
        let [_, _, c, d, _, _] = self.0;
        (c * c + d * d).sqrt()
    }
}

#[derive(Debug)]
struct Interpreter {
    ctm: Matrix,
    saved: Vec<Matrix>,
    text_matrix: Matrix,
    line_matrix: Matrix,
    font_size: f32,
    leading: f32,
    rise: f32,
    path: Vec<Segment>,
    cursor: Option<(f32, f32)>,
    subpath_start: Option<(f32, f32)>,
    runs: Vec<TextRun>,
    rulings: Vec<Segment>,
    undecoded: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self {
            ctm: Matrix::IDENTITY,
            saved: Vec::new(),
            text_matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
            font_size: 12.0,
            leading: 0.0,
            rise: 0.0,
            path: Vec::new(),
            cursor: None,
            subpath_start: None,
            runs: Vec::new(),
            rulings: Vec::new(),
            undecoded: 0,
        }
    }
}

impl Interpreter {
    fn apply(&mut self, operator: &str, operands: &[Object]) {
        let nums = || operands.iter().filter_map(number).collect::<Vec<f32>>();

        match operator {
            "q" => self.saved.push(self.ctm),
            "Q" => {
                if let Some(ctm) = self.saved.pop() {
                    self.ctm = ctm;
                }
            }
            "cm" => {
                if let [a, b, c, d, e, f] = nums()[..] {
                    self.ctm = Matrix([a, b, c, d, e, f]).then(&self.ctm);
                }
            }
            "BT" => {
                self.text_matrix = Matrix::IDENTITY;
                self.line_matrix = Matrix::IDENTITY;
            }
            "Tf" => {
                if let Some(size) = operands.get(1).and_then(number) {
                    self.font_size = size;
                }
            }
            "TL" => {
                if let [leading] = nums()[..] {
                    self.leading = leading;
                }
            }
            "Ts" => {
                if let [rise] = nums()[..] {
                    self.rise = rise;
                }
            }
            "Tm" => {
                if let [a, b, c, d, e, f] = nums()[..] {
                    self.text_matrix = Matrix([a, b, c, d, e, f]);
                    self.line_matrix = self.text_matrix;
                }
            }
            "Td" => {
                if let [tx, ty] = nums()[..] {
                    self.next_line(tx, ty);
                }
            }
            "TD" => {
                if let [tx, ty] = nums()[..] {
                    self.leading = -ty;
                    self.next_line(tx, ty);
                }
            }
            "T*" => self.next_line(0.0, -self.leading),
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    self.show(bytes);
                }
            }
            "'" => {
                self.next_line(0.0, -self.leading);
                if let Some(Object::String(bytes, _)) = operands.first() {
                    self.show(bytes);
                }
            }
            "\"" => {
                self.next_line(0.0, -self.leading);
                if let Some(Object::String(bytes, _)) = operands.get(2) {
                    self.show(bytes);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    for item in items {
                        match item {
                            Object::String(bytes, _) => self.show(bytes),
                            other => {
                                if let Some(adjust) = number(other) {
                                    let tx = -adjust / 1000.0 * self.font_size;
                                    self.text_matrix = Matrix::translate(tx, 0.0).then(&self.text_matrix);
                                }
                            }
                        }
                    }
                }
            }
            "m" => {
                if let [x, y] = nums()[..] {
                    let point = self.ctm.apply(x, y);
                    self.cursor = Some(point);
                    self.subpath_start = Some(point);
                }
            }
            "l" => {
                if let [x, y] = nums()[..] {
                    let point = self.ctm.apply(x, y);
                    if let Some((cx, cy)) = self.cursor {
                        self.path.push(Segment::new(cx, cy, point.0, point.1));
                    }
                    self.cursor = Some(point);
                }
            }
            "c" | "v" | "y" => {
                let values = nums();
                if values.len() >= 2 {
                    let (x, y) = (values[values.len() - 2], values[values.len() - 1]);
                    self.cursor = Some(self.ctm.apply(x, y));
                }
            }
            "h" => {
                if let (Some((cx, cy)), Some((sx, sy))) = (self.cursor, self.subpath_start) {
                    self.path.push(Segment::new(cx, cy, sx, sy));
                    self.cursor = Some((sx, sy));
                }
            }
            "re" => {
                if let [x, y, w, h] = nums()[..] {
                    self.rectangle(x, y, w, h);
                }
            }
            "S" | "s" | "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" => {
                self.rulings.append(&mut self.path);
                self.cursor = None;
                self.subpath_start = None;
            }
            "n" => {
                self.path.clear();
                self.cursor = None;
                self.subpath_start = None;
            }
            _ => {}
        }
    }

    fn next_line(&mut self, tx: f32, ty: f32) {
        self.line_matrix = Matrix::translate(tx, ty).then(&self.line_matrix);
        self.text_matrix = self.line_matrix;
    }

    fn rectangle(&mut self, x: f32, y: f32, w: f32, h: f32) {
        let corners = [
            self.ctm.apply(x, y),
            self.ctm.apply(x + w, y),
            self.ctm.apply(x + w, y + h),
            self.ctm.apply(x, y + h),
        ];

        // Thin filled rectangles are how many producers draw rules.
        if w.abs() < 2.0 || h.abs() < 2.0 {
            let (x0, y0) = corners[0];
            let (x2, y2) = corners[2];
            if w.abs() < 2.0 {
                let mid = (x0 + x2) / 2.0;
                self.path.push(Segment::new(mid, y0, mid, y2));
            } else {
                let mid = (y0 + y2) / 2.0;
                self.path.push(Segment::new(x0, mid, x2, mid));
            }
            return;
        }

        for index in 0..4 {
            let (ax, ay) = corners[index];
            let (bx, by) = corners[(index + 1) % 4];
            self.path.push(Segment::new(ax, ay, bx, by));
        }
    }

    fn show(&mut self, bytes: &[u8]) {
        let rendering = self.text_matrix.then(&self.ctm);
        let size = self.font_size * rendering.vertical_scale();
        let advance = bytes_glyph_count(bytes) as f32 * self.font_size * GLYPH_ADVANCE;

        let (x, y) = rendering.apply(0.0, self.rise);
        let (end_x, _) = rendering.apply(advance, self.rise);
        self.text_matrix = Matrix::translate(advance, 0.0).then(&self.text_matrix);

        let Some(text) = decode_pdf_string(bytes) else {
            self.undecoded += 1;
            return;
        };
        if text.trim().is_empty() {
            return;
        }

        let size = if size > 0.0 { size } else { self.font_size.abs().max(1.0) };
        self.runs.push(TextRun {
            text,
            bbox: Rect::new(x, y - DESCENT * size, end_x, y + ASCENT * size),
            baseline: y,
            font_size: size,
        });
    }
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

fn bytes_glyph_count(bytes: &[u8]) -> usize {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        (bytes.len() - 2) / 2
    } else {
        bytes.len()
    }
}

/// Decodes a PDF string operand. Returns `None` for strings that look like
/// two-byte glyph identifiers, which cannot be mapped without the font's CMap.
pub fn decode_pdf_string(bytes: &[u8]) -> Option<String> {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units = rest
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        return Some(String::from_utf16_lossy(&units));
    }

    let zeros = bytes.iter().filter(|byte| **byte == 0).count();
    if !bytes.is_empty() && zeros * 3 >= bytes.len() {
        return None;
    }

    Some(
        bytes
            .iter()
            .map(|byte| *byte as char)
            .filter(|ch| !ch.is_control())
            .collect(),
    )
}

#[derive(Debug, Clone)]
struct LineSegment {
    text: String,
    bbox: Rect,
    baseline: f32,
    font_size: f32,
    region: Option<usize>,
}

fn region_of(bbox: &Rect, regions: &[Rect]) -> Option<usize> {
    regions.iter().position(|region| region.contains(bbox))
}

/// Groups runs into blocks in reading order. Lines inside different table
/// regions (or one inside and one outside) never share a block.
pub fn build_blocks(runs: &[TextRun], regions: &[Rect]) -> Vec<TextBlock> {
    let mut ordered = runs.to_vec();
    ordered.sort_by(|left, right| {
        right
            .baseline
            .total_cmp(&left.baseline)
            .then(left.bbox.x0.total_cmp(&right.bbox.x0))
    });

    let mut lines: Vec<LineSegment> = Vec::new();
    for run in ordered {
        let run_region = region_of(&run.bbox, regions);
        if let Some(line) = lines.last_mut() {
            let size = line.font_size.max(run.font_size);
            let same_baseline = (line.baseline - run.baseline).abs() <= 0.3 * size;
            let gap = run.bbox.x0 - line.bbox.x1;
            if same_baseline && gap <= size && gap >= -size && line.region == run_region {
                if gap > 0.15 * size && !line.text.ends_with(' ') && !run.text.starts_with(' ') {
                    line.text.push(' ');
                }
                line.text.push_str(&run.text);
                line.bbox = line.bbox.union(&run.bbox);
                continue;
            }
        }

        lines.push(LineSegment {
            text: run.text.clone(),
            bbox: run.bbox,
            baseline: run.baseline,
            font_size: run.font_size,
            region: run_region,
        });
    }

    struct OpenBlock {
        block: TextBlock,
        last_baseline: f32,
        font_size: f32,
        region: Option<usize>,
    }

    let mut blocks: Vec<OpenBlock> = Vec::new();
    for line in lines {
        let target = blocks.iter_mut().rev().find(|open| {
            let size = open.font_size.max(line.font_size);
            let drop = open.last_baseline - line.baseline;
            open.region == line.region
                && drop > 0.0
                && drop <= 1.6 * size
                && line.bbox.x0 < open.block.bbox.x1
                && line.bbox.x1 > open.block.bbox.x0
        });

        match target {
            Some(open) => {
                open.block.text.push('\n');
                open.block.text.push_str(line.text.trim());
                open.block.bbox = open.block.bbox.union(&line.bbox);
                open.last_baseline = line.baseline;
            }
            None => blocks.push(OpenBlock {
                block: TextBlock {
                    bbox: line.bbox,
                    text: line.text.trim().to_string(),
                },
                last_baseline: line.baseline,
                font_size: line.font_size,
                region: line.region,
            }),
        }
    }

    let mut blocks = blocks.into_iter().map(|open| open.block).collect::<Vec<_>>();
    blocks.sort_by(|left, right| {
        right
            .bbox
            .y1
            .total_cmp(&left.bbox.y1)
            .then(left.bbox.x0.total_cmp(&right.bbox.x0))
    });
    blocks
}
