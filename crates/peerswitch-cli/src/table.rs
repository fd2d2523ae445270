//! Box-drawn tables for list output (peers, hosts, devices, trust).

use colored::Colorize;

/// Column alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

/// Collects headers and rows, then renders with Unicode borders.
pub struct Table {
    headers: Vec<String>,
    alignments: Vec<Align>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// All columns start left-aligned.
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            alignments: vec![Align::Left; headers.len()],
            rows: Vec::new(),
        }
    }

    /// Out-of-range columns are ignored.
    pub fn align(mut self, col: usize, alignment: Align) -> Self {
        if let Some(slot) = self.alignments.get_mut(col) {
            *slot = alignment;
        }
        self
    }

    /// Extra cells are dropped; missing cells render empty.
    pub fn add_row<S: AsRef<str>>(&mut self, cells: &[S]) {
        let row = (0..self.headers.len())
            .map(|i| cells.get(i).map(|c| c.as_ref().to_string()).unwrap_or_default())
            .collect();
        self.rows.push(row);
    }

    // Host names and device names may carry non-ASCII characters.
    fn width_of(text: &str) -> usize {
        text.chars().count()
    }

    fn column_widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| Self::width_of(h)).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(Self::width_of(cell));
            }
        }
        widths
    }

    fn pad(text: &str, width: usize, alignment: Align) -> String {
        let fill = " ".repeat(width.saturating_sub(Self::width_of(text)));
        match alignment {
            Align::Left => format!("{text}{fill}"),
            Align::Right => format!("{fill}{text}"),
        }
    }

    fn border(widths: &[usize], left: char, mid: char, right: char) -> String {
        let segments: Vec<String> = widths.iter().map(|w| "\u{2500}".repeat(w + 2)).collect();
        format!("{left}{}{right}", segments.join(&mid.to_string()))
    }

    fn line(&self, cells: &[String], widths: &[usize], bold: bool) -> String {
        let cells: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let padded = Self::pad(cell, widths[i], self.alignments[i]);
                if bold {
                    format!(" {} ", padded.bold())
                } else {
                    format!(" {padded} ")
                }
            })
            .collect();
        format!("\u{2502}{}\u{2502}", cells.join("\u{2502}"))
    }

    pub fn render(&self) -> String {
        let widths = self.column_widths();
        let mut lines = vec![
            Self::border(&widths, '\u{250c}', '\u{252c}', '\u{2510}'),
            self.line(&self.headers, &widths, true),
            Self::border(&widths, '\u{251c}', '\u{253c}', '\u{2524}'),
        ];
        lines.extend(self.rows.iter().map(|row| self.line(row, &widths, false)));
        lines.push(Self::border(&widths, '\u{2514}', '\u{2534}', '\u{2518}'));
        lines.join("\n")
    }

    pub fn print(&self) {
        println!("{}", self.render());
    }
}
