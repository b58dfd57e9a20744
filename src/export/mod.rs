//! Paginated export of inbox letters.
//!
//! Layout runs in points on a letter-sized page: each block is a `From:` line,
//! a `When:` line and the word-wrapped body. The rendered document is plain
//! text with a form feed between pages.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use time::UtcOffset;
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

use crate::clock::display_time;
use crate::config::ExportOptions;
use crate::letters::Letter;

const PAGE_BREAK: char = '\u{c}';
/// Average glyph advance relative to the font size.
const GLYPH_RATIO: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct ExportBlock {
    /// Baseline of the `From:` line on its page.
    pub top: f32,
    pub from: String,
    pub when: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportPage {
    pub blocks: Vec<ExportBlock>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportDocument {
    pub pages: Vec<ExportPage>,
}

impl ExportDocument {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn block_count(&self) -> usize {
        self.pages.iter().map(|page| page.blocks.len()).sum()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, page) in self.pages.iter().enumerate() {
            if idx > 0 {
                out.push(PAGE_BREAK);
                out.push('\n');
            }
            for block in &page.blocks {
                out.push_str(&format!("From: {}\n", block.from));
                out.push_str(&format!("When: {}\n", block.when));
                for line in &block.lines {
                    out.push_str(line);
                    out.push('\n');
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Lays letters out in the order given.
pub fn layout<'a, I>(letters: I, options: &ExportOptions, offset: UtcOffset) -> ExportDocument
where
    I: IntoIterator<Item = &'a Letter>,
{
    let columns = wrap_columns(options);
    let letters: Vec<&Letter> = letters.into_iter().collect();
    let mut document = ExportDocument::default();
    if letters.is_empty() {
        return document;
    }

    let mut page = ExportPage::default();
    let mut y = options.top;
    for (idx, letter) in letters.iter().enumerate() {
        let lines = wrap_text(&letter.message, columns);
        page.blocks.push(ExportBlock {
            top: y,
            from: letter.from.clone(),
            when: display_time(letter.deliver_at, offset),
            lines: lines.clone(),
        });
        y += options.header_advance * 2.0;
        y += lines.len() as f32 * options.line_height + options.item_gap;
        if y > options.page_limit && idx < letters.len() - 1 {
            document.pages.push(std::mem::take(&mut page));
            y = options.top;
        }
    }
    document.pages.push(page);
    document
}

pub fn wrap_columns(options: &ExportOptions) -> usize {
    let glyph = (options.font_size * GLYPH_RATIO).max(1.0);
    ((options.wrap_width / glyph).floor() as usize).max(1)
}

/// Greedy word wrap by display width. Words wider than a line are split on
/// grapheme boundaries; explicit newlines are kept.
pub fn wrap_text(text: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let paragraph = paragraph.trim_end_matches('\r');
        let mut line = String::new();
        let mut width = 0;
        for word in paragraph.split_whitespace() {
            let word_width = word.width();
            if word_width > columns {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                width = 0;
                for grapheme in word.graphemes(true) {
                    let g_width = grapheme.width();
                    if width + g_width > columns && !line.is_empty() {
                        lines.push(std::mem::take(&mut line));
                        width = 0;
                    }
                    line.push_str(grapheme);
                    width += g_width;
                }
                continue;
            }
            let needed = if line.is_empty() { word_width } else { width + 1 + word_width };
            if needed > columns {
                lines.push(std::mem::take(&mut line));
                width = 0;
            }
            if !line.is_empty() {
                line.push(' ');
                width += 1;
            }
            line.push_str(word);
            width += word_width;
        }
        lines.push(line);
    }
    lines
}

/// Writes the rendered document through a temporary file.
pub fn write_document(document: &ExportDocument, path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating export directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, document.render())
        .with_context(|| format!("writing export {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("persisting export {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        pages = document.page_count(),
        letters = document.block_count(),
        "exported letters"
    );
    Ok(path.to_path_buf())
}
