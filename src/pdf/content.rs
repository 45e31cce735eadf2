//! Content stream interpretation: just enough of the PDF imaging model to
//! recover where text was drawn and where ruling lines were painted.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use regex::Regex;
use tracing::warn;

static BFCHAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)beginbfchar(.*?)endbfchar").unwrap());
static BFRANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)beginbfrange(.*?)endbfrange").unwrap());
static PAIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([0-9A-Fa-f]+)>\s*<([0-9A-Fa-f]+)>").unwrap());
static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([0-9A-Fa-f]+)>\s*<([0-9A-Fa-f]+)>\s*(?:<([0-9A-Fa-f]*)>|\[([^\]]*)\])").unwrap()
});
static HEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<([0-9A-Fa-f]*)>").unwrap());
/// Byte table for strings shown without a usable font.
static WIN_ANSI: LazyLock<Vec<String>> = LazyLock::new(|| byte_table("WinAnsiEncoding"));

type Matrix = [f64; 6];

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
const MAX_FORM_DEPTH: usize = 4;
const MAX_INHERIT_DEPTH: usize = 16;
/// Glyph width (thousandths of an em) when the font gives none.
const DEFAULT_GLYPH_WIDTH: f64 = 500.0;

/// One glyph drawn by a show operator, in user space.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    /// Baseline start.
    pub x: f64,
    pub y: f64,
    /// Glyph advance with character spacing, without word spacing.
    pub width: f64,
    /// Rendered font size.
    pub size: f64,
    pub text: String,
}

/// A painted straight line, in user space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

#[derive(Debug, Default)]
pub struct PageLayout {
    pub spans: Vec<TextSpan>,
    pub segments: Vec<Segment>,
}

/// Interpret one page's content stream.
pub fn read_page(doc: &Document, page_id: ObjectId) -> Result<PageLayout> {
    let data = doc
        .get_page_content(page_id)
        .context("Failed to read page content")?;
    let resources = page_resources(doc, page_id);
    let mut interp = Interpreter::new(doc);
    interp.run(&data, resources, GraphicsState::new(IDENTITY), 0)?;
    Ok(interp.layout)
}

// ── Interpreter ──

#[derive(Clone)]
struct GraphicsState {
    ctm: Matrix,
    font: Option<Rc<FontDecoder>>,
    font_size: f64,
    leading: f64,
    char_spacing: f64,
    word_spacing: f64,
    h_scale: f64,
}

impl GraphicsState {
    fn new(ctm: Matrix) -> Self {
        Self {
            ctm,
            font: None,
            font_size: 0.0,
            leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            h_scale: 1.0,
        }
    }
}

struct TextState {
    tm: Matrix,
    tlm: Matrix,
}

impl TextState {
    fn new() -> Self {
        Self {
            tm: IDENTITY,
            tlm: IDENTITY,
        }
    }

    fn next_line(&mut self, tx: f64, ty: f64) {
        self.tlm = multiply(&[1.0, 0.0, 0.0, 1.0, tx, ty], &self.tlm);
        self.tm = self.tlm;
    }

    fn advance(&mut self, tx: f64) {
        self.tm = multiply(&[1.0, 0.0, 0.0, 1.0, tx, 0.0], &self.tm);
    }
}

struct Interpreter<'a> {
    doc: &'a Document,
    layout: PageLayout,
}

impl<'a> Interpreter<'a> {
    fn new(doc: &'a Document) -> Self {
        Self {
            doc,
            layout: PageLayout::default(),
        }
    }

    /// Run a content stream starting from `gs`, the state of the caller.
    fn run(
        &mut self,
        data: &[u8],
        resources: Option<&'a Dictionary>,
        mut gs: GraphicsState,
        depth: usize,
    ) -> Result<()> {
        let content = Content::decode(data).context("Failed to decode content stream")?;
        // the decoder stops silently at the first token it cannot read
        if content.operations.is_empty() && data.iter().any(|b| !b.is_ascii_whitespace()) {
            bail!("Content stream could not be decoded");
        }
        let fonts = resources
            .map(|r| load_fonts(self.doc, r))
            .unwrap_or_default();

        let mut saved: Vec<GraphicsState> = Vec::new();
        let mut text = TextState::new();
        let mut path: Vec<Segment> = Vec::new();
        let mut current: Option<(f64, f64)> = None;
        let mut start: Option<(f64, f64)> = None;

        for op in &content.operations {
            let nums: Vec<f64> = op.operands.iter().filter_map(number).collect();
            match op.operator.as_str() {
                "q" => saved.push(gs.clone()),
                "Q" => {
                    if let Some(prev) = saved.pop() {
                        gs = prev;
                    }
                }
                "cm" => {
                    if let Some(m) = matrix(&nums) {
                        gs.ctm = multiply(&m, &gs.ctm);
                    }
                }
                "BT" => text = TextState::new(),
                "Tf" => {
                    gs.font = op
                        .operands
                        .first()
                        .and_then(|o| o.as_name().ok())
                        .and_then(|n| fonts.get(n))
                        .cloned();
                    if let Some(size) = op.operands.get(1).and_then(number) {
                        gs.font_size = size;
                    }
                }
                "TL" => {
                    if let Some(&tl) = nums.first() {
                        gs.leading = tl;
                    }
                }
                "Tc" => {
                    if let Some(&tc) = nums.first() {
                        gs.char_spacing = tc;
                    }
                }
                "Tw" => {
                    if let Some(&tw) = nums.first() {
                        gs.word_spacing = tw;
                    }
                }
                "Tz" => {
                    if let Some(&tz) = nums.first() {
                        gs.h_scale = tz / 100.0;
                    }
                }
                "Td" => {
                    if let &[tx, ty] = nums.as_slice() {
                        text.next_line(tx, ty);
                    }
                }
                "TD" => {
                    if let &[tx, ty] = nums.as_slice() {
                        gs.leading = -ty;
                        text.next_line(tx, ty);
                    }
                }
                "Tm" => {
                    if let Some(m) = matrix(&nums) {
                        text.tm = m;
                        text.tlm = m;
                    }
                }
                "T*" => text.next_line(0.0, -gs.leading),
                "Tj" | "'" | "\"" => {
                    if op.operator == "\"" {
                        if let [aw, ac, ..] = nums.as_slice() {
                            gs.word_spacing = *aw;
                            gs.char_spacing = *ac;
                        }
                    }
                    if op.operator != "Tj" {
                        text.next_line(0.0, -gs.leading);
                    }
                    if let Some(Object::String(bytes, _)) = op.operands.last() {
                        let glyphs = decode_glyphs(gs.font.as_deref(), bytes);
                        self.show(&gs, &mut text, &glyphs);
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = op.operands.first() {
                        for item in items {
                            match item {
                                Object::String(bytes, _) => {
                                    let glyphs = decode_glyphs(gs.font.as_deref(), bytes);
                                    self.show(&gs, &mut text, &glyphs);
                                }
                                other => {
                                    if let Some(adjust) = number(other) {
                                        text.advance(-adjust / 1000.0 * gs.font_size * gs.h_scale);
                                    }
                                }
                            }
                        }
                    }
                }
                "m" => {
                    if let &[x, y] = nums.as_slice() {
                        let p = apply(&gs.ctm, x, y);
                        current = Some(p);
                        start = Some(p);
                    }
                }
                "l" => {
                    if let (&[x, y], Some(from)) = (nums.as_slice(), current) {
                        let to = apply(&gs.ctm, x, y);
                        path.push(Segment::new(from, to));
                        current = Some(to);
                    }
                }
                "re" => {
                    if let &[x, y, w, h] = nums.as_slice() {
                        let corners = [
                            apply(&gs.ctm, x, y),
                            apply(&gs.ctm, x + w, y),
                            apply(&gs.ctm, x + w, y + h),
                            apply(&gs.ctm, x, y + h),
                        ];
                        for i in 0..4 {
                            path.push(Segment::new(corners[i], corners[(i + 1) % 4]));
                        }
                        current = Some(corners[0]);
                        start = Some(corners[0]);
                    }
                }
                "h" => close_path(&mut path, &mut current, start),
                "S" | "f" | "F" | "f*" | "B" | "B*" => {
                    self.layout.segments.append(&mut path);
                }
                "s" | "b" | "b*" => {
                    close_path(&mut path, &mut current, start);
                    self.layout.segments.append(&mut path);
                }
                "n" => path.clear(),
                "Do" if depth < MAX_FORM_DEPTH => {
                    let name = op.operands.first().and_then(|o| o.as_name().ok());
                    if let (Some(name), Some(res)) = (name, resources) {
                        self.run_form(name, res, &gs, depth);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Interpret a form XObject in place; images and broken forms are skipped.
    fn run_form(
        &mut self,
        name: &[u8],
        resources: &'a Dictionary,
        gs: &GraphicsState,
        depth: usize,
    ) {
        let Some(stream) = resources
            .get(b"XObject")
            .ok()
            .and_then(|x| resolve_dict(self.doc, x))
            .and_then(|x| x.get(name).ok())
            .and_then(|o| resolve(self.doc, o).as_stream().ok())
        else {
            return;
        };
        let is_form = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|s| s.as_name().ok())
            == Some(b"Form".as_slice());
        if !is_form {
            return;
        }

        let form_matrix = stream
            .dict
            .get(b"Matrix")
            .ok()
            .and_then(|m| resolve(self.doc, m).as_array().ok())
            .and_then(|a| matrix(&a.iter().filter_map(number).collect::<Vec<_>>()))
            .unwrap_or(IDENTITY);
        let form_resources = stream
            .dict
            .get(b"Resources")
            .ok()
            .and_then(|r| resolve_dict(self.doc, r))
            .or(Some(resources));
        let data = stream
            .decompressed_content()
            .unwrap_or_else(|_| stream.content.clone());

        let mut form_gs = gs.clone();
        form_gs.ctm = multiply(&form_matrix, &gs.ctm);
        if let Err(e) = self.run(&data, form_resources, form_gs, depth + 1) {
            warn!("Skipping form XObject {}: {:#}", String::from_utf8_lossy(name), e);
        }
    }

    /// Place each glyph at the current text position, then advance past it.
    fn show(&mut self, gs: &GraphicsState, text: &mut TextState, glyphs: &[Glyph]) {
        for glyph in glyphs {
            let trm = multiply(&text.tm, &gs.ctm);
            let advance = (glyph.width / 1000.0 * gs.font_size + gs.char_spacing) * gs.h_scale;
            if !glyph.text.trim().is_empty() {
                let (x, y) = apply(&trm, 0.0, 0.0);
                let x_scale = (trm[0] * trm[0] + trm[1] * trm[1]).sqrt();
                let y_scale = (trm[2] * trm[2] + trm[3] * trm[3]).sqrt();
                self.layout.spans.push(TextSpan {
                    x,
                    y,
                    width: advance * x_scale,
                    size: gs.font_size * y_scale,
                    text: glyph.text.clone(),
                });
            }
            let word = if glyph.space { gs.word_spacing } else { 0.0 };
            text.advance(advance + word * gs.h_scale);
        }
    }
}

impl Segment {
    fn new(from: (f64, f64), to: (f64, f64)) -> Self {
        Self {
            x0: from.0,
            y0: from.1,
            x1: to.0,
            y1: to.1,
        }
    }
}

fn close_path(path: &mut Vec<Segment>, current: &mut Option<(f64, f64)>, start: Option<(f64, f64)>) {
    if let (Some(from), Some(to)) = (*current, start) {
        if from != to {
            path.push(Segment::new(from, to));
        }
    }
    *current = start;
}

// ── Fonts ──

/// Maps character codes of one font to text and glyph widths.
#[derive(Debug, Default)]
struct FontDecoder {
    code_bytes: usize,
    to_unicode: HashMap<u32, String>,
    /// Text of each single-byte code under the font's base encoding.
    byte_map: Vec<String>,
    widths: HashMap<u32, f64>,
    default_width: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct Glyph {
    text: String,
    /// In thousandths of an em.
    width: f64,
    /// Single-byte code 32, which also takes word spacing.
    space: bool,
}

impl FontDecoder {
    fn from_dict(doc: &Document, font: &Dictionary) -> Self {
        let composite = font
            .get(b"Subtype")
            .ok()
            .and_then(|s| resolve(doc, s).as_name().ok())
            == Some(b"Type0".as_slice());

        let mut decoder = FontDecoder {
            code_bytes: if composite { 2 } else { 1 },
            default_width: if composite { 1000.0 } else { DEFAULT_GLYPH_WIDTH },
            ..Default::default()
        };

        if !composite {
            let encoding = match font.get(b"Encoding").ok().and_then(|e| resolve_dict(doc, e)) {
                Some(differences) => differences
                    .get(b"BaseEncoding")
                    .and_then(Object::as_name_str)
                    .unwrap_or("StandardEncoding"),
                None => font.get_font_encoding(),
            };
            decoder.byte_map = byte_table(match encoding {
                "MacRomanEncoding" | "MacExpertEncoding" | "WinAnsiEncoding" => encoding,
                _ => "StandardEncoding",
            });
        }

        if let Some(stream) = font
            .get(b"ToUnicode")
            .ok()
            .and_then(|o| resolve(doc, o).as_stream().ok())
        {
            let data = stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone());
            decoder.to_unicode = parse_cmap(&String::from_utf8_lossy(&data));
        }

        if !composite {
            let first = font
                .get(b"FirstChar")
                .ok()
                .and_then(|o| number(resolve(doc, o)))
                .unwrap_or(0.0) as u32;
            if let Some(widths) = font
                .get(b"Widths")
                .ok()
                .and_then(|o| resolve(doc, o).as_array().ok())
            {
                for (i, w) in widths.iter().enumerate() {
                    if let Some(w) = number(resolve(doc, w)) {
                        decoder.widths.insert(first + i as u32, w);
                    }
                }
            }
        }
        decoder
    }
}

fn load_fonts(doc: &Document, resources: &Dictionary) -> HashMap<Vec<u8>, Rc<FontDecoder>> {
    let Some(fonts) = resources
        .get(b"Font")
        .ok()
        .and_then(|f| resolve_dict(doc, f))
    else {
        return HashMap::new();
    };
    fonts
        .iter()
        .filter_map(|(name, obj)| {
            resolve_dict(doc, obj).map(|f| (name.clone(), Rc::new(FontDecoder::from_dict(doc, f))))
        })
        .collect()
}

/// Text of every byte value under a named simple-font encoding.
fn byte_table(encoding: &str) -> Vec<String> {
    (0..=u8::MAX)
        .map(|b| printable(Document::decode_text(Some(encoding), &[b])))
        .collect()
}

fn printable(text: String) -> String {
    if text.chars().any(char::is_control) {
        text.chars().filter(|c| !c.is_control()).collect()
    } else {
        text
    }
}

/// Split a shown string into glyphs with their text and width.
fn decode_glyphs(font: Option<&FontDecoder>, bytes: &[u8]) -> Vec<Glyph> {
    let Some(font) = font else {
        if let Some(utf16) = bytes.strip_prefix(&[0xFE_u8, 0xFF][..]) {
            let units = utf16.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
            return char::decode_utf16(units)
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .map(|c| Glyph {
                    text: printable(c.to_string()),
                    width: DEFAULT_GLYPH_WIDTH,
                    space: false,
                })
                .collect();
        }
        return bytes
            .iter()
            .map(|&b| Glyph {
                text: WIN_ANSI[b as usize].clone(),
                width: DEFAULT_GLYPH_WIDTH,
                space: b == b' ',
            })
            .collect();
    };

    bytes
        .chunks(font.code_bytes.max(1))
        .map(|chunk| {
            let code = chunk.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
            let text = match font.to_unicode.get(&code) {
                Some(s) => printable(s.clone()),
                None if font.code_bytes == 1 => {
                    font.byte_map.get(code as usize).cloned().unwrap_or_default()
                }
                None => char::from_u32(code)
                    .map(|c| printable(c.to_string()))
                    .unwrap_or_default(),
            };
            Glyph {
                text,
                width: font.widths.get(&code).copied().unwrap_or(font.default_width),
                space: font.code_bytes == 1 && code == 32,
            }
        })
        .collect()
}

/// Read `bfchar` and `bfrange` mappings out of a ToUnicode CMap.
fn parse_cmap(cmap: &str) -> HashMap<u32, String> {
    let mut map = HashMap::new();

    for block in BFCHAR_RE.captures_iter(cmap) {
        for pair in PAIR_RE.captures_iter(&block[1]) {
            if let Some(code) = hex_code(&pair[1]) {
                map.insert(code, utf16_hex(&pair[2]));
            }
        }
    }

    for block in BFRANGE_RE.captures_iter(cmap) {
        for range in RANGE_RE.captures_iter(&block[1]) {
            let (Some(lo), Some(hi)) = (hex_code(&range[1]), hex_code(&range[2])) else {
                continue;
            };
            if hi < lo || hi - lo > 0xFFFF {
                continue;
            }
            if let Some(dst) = range.get(3) {
                let base = hex_units(dst.as_str());
                for (offset, code) in (lo..=hi).enumerate() {
                    let mut units = base.clone();
                    if let Some(last) = units.last_mut() {
                        *last = last.wrapping_add(offset as u16);
                    }
                    map.insert(code, String::from_utf16_lossy(&units));
                }
            } else if let Some(list) = range.get(4) {
                for (code, dst) in (lo..=hi).zip(HEX_RE.captures_iter(list.as_str())) {
                    map.insert(code, utf16_hex(&dst[1]));
                }
            }
        }
    }
    map
}

fn hex_code(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex, 16).ok()
}

fn hex_units(hex: &str) -> Vec<u16> {
    if hex.len() <= 2 {
        return hex_code(hex).map(|c| vec![c as u16]).unwrap_or_default();
    }
    hex.as_bytes()
        .chunks(4)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .filter_map(|c| u16::from_str_radix(c, 16).ok())
        .collect()
}

fn utf16_hex(hex: &str) -> String {
    String::from_utf16_lossy(&hex_units(hex))
}

// ── Object helpers ──

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, obj) {
        Object::Dictionary(d) => Some(d),
        Object::Stream(s) => Some(&s.dict),
        _ => None,
    }
}

/// Resources of a page, inherited from the page tree when absent.
fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_INHERIT_DEPTH {
        if let Ok(res) = node.get(b"Resources") {
            return resolve_dict(doc, res);
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

fn matrix(nums: &[f64]) -> Option<Matrix> {
    match *nums {
        [a, b, c, d, e, f] => Some([a, b, c, d, e, f]),
        _ => None,
    }
}

/// `m × n` in PDF row-vector convention.
fn multiply(m: &Matrix, n: &Matrix) -> Matrix {
    [
        m[0] * n[0] + m[1] * n[2],
        m[0] * n[1] + m[1] * n[3],
        m[2] * n[0] + m[3] * n[2],
        m[2] * n[1] + m[3] * n[3],
        m[4] * n[0] + m[5] * n[2] + n[4],
        m[4] * n[1] + m[5] * n[3] + n[5],
    ]
}

fn apply(m: &Matrix, x: f64, y: f64) -> (f64, f64) {
    (m[0] * x + m[2] * y + m[4], m[1] * x + m[3] * y + m[5])
}
