//! Ruling-line table detection and markdown serialisation.

use super::layout::{Rect, Segment, TextRun};

const JOIN_TOLERANCE: f32 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedTable {
    pub bbox: Rect,
    /// Cell text, top row first. The first row is the header.
    pub rows: Vec<Vec<String>>,
}

impl DetectedTable {
    /// Markdown rendering, or `None` when the header row has no text.
    pub fn to_markdown(&self) -> Option<String> {
        let header = self.rows.first()?;
        if header.iter().all(|cell| cell.trim().is_empty()) {
            return None;
        }

        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        lines.push(markdown_row(header));
        lines.push(format!("| {} |", vec!["---"; header.len()].join(" | ")));
        for row in &self.rows[1..] {
            lines.push(markdown_row(row));
        }
        Some(lines.join("\n"))
    }
}

fn markdown_row(cells: &[String]) -> String {
    let cells = cells
        .iter()
        .map(|cell| cell.trim().replace('\n', " ").replace('|', "\\|"))
        .collect::<Vec<_>>();
    format!("| {} |", cells.join(" | "))
}

/// Finds grids of horizontal and vertical rulings and fills their cells with
/// the runs whose centre falls inside each cell.
pub fn detect_tables(rulings: &[Segment], runs: &[TextRun]) -> Vec<DetectedTable> {
    let lines = rulings
        .iter()
        .filter(|segment| segment.is_horizontal() || segment.is_vertical())
        .copied()
        .collect::<Vec<_>>();

    let mut tables = Vec::new();
    for component in connected_components(&lines) {
        let horizontals = component
            .iter()
            .filter(|segment| segment.is_horizontal())
            .map(|segment| (segment.y0 + segment.y1) / 2.0)
            .collect::<Vec<_>>();
        let verticals = component
            .iter()
            .filter(|segment| segment.is_vertical())
            .map(|segment| (segment.x0 + segment.x1) / 2.0)
            .collect::<Vec<_>>();

        let mut row_edges = distinct(horizontals);
        row_edges.reverse();
        let column_edges = distinct(verticals);

        if row_edges.len() < 2 || column_edges.len() < 2 {
            continue;
        }
        // A lone framed box is decoration, not a table.
        if (row_edges.len() - 1) * (column_edges.len() - 1) < 2 {
            continue;
        }

        let bbox = component
            .iter()
            .map(Segment::bbox)
            .reduce(|left, right| left.union(&right))
            .unwrap_or(Rect::new(0.0, 0.0, 0.0, 0.0));

        tables.push(DetectedTable {
            bbox,
            rows: fill_cells(&row_edges, &column_edges, runs),
        });
    }

    tables.sort_by(|left, right| right.bbox.y1.total_cmp(&left.bbox.y1));
    tables
}

fn fill_cells(row_edges: &[f32], column_edges: &[f32], runs: &[TextRun]) -> Vec<Vec<String>> {
    let mut rows = vec![vec![String::new(); column_edges.len() - 1]; row_edges.len() - 1];

    let mut ordered = runs.iter().collect::<Vec<_>>();
    ordered.sort_by(|left, right| {
        right
            .baseline
            .total_cmp(&left.baseline)
            .then(left.bbox.x0.total_cmp(&right.bbox.x0))
    });

    for run in ordered {
        let (cx, cy) = run.bbox.center();
        let row = row_edges
            .windows(2)
            .position(|edge| cy <= edge[0] && cy > edge[1]);
        let column = column_edges
            .windows(2)
            .position(|edge| cx >= edge[0] && cx < edge[1]);

        if let (Some(row), Some(column)) = (row, column) {
            let cell = &mut rows[row][column];
            if !cell.is_empty() {
                cell.push(' ');
            }
            cell.push_str(run.text.trim());
        }
    }

    let mut kept = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        if index == 0 || row.iter().any(|cell| !cell.is_empty()) {
            kept.push(row);
        }
    }
    kept
}

/// Sorted coordinates with near-duplicates collapsed.
fn distinct(mut values: Vec<f32>) -> Vec<f32> {
    values.sort_by(f32::total_cmp);
    let mut result: Vec<f32> = Vec::new();
    for value in values {
        match result.last() {
            Some(last) if (value - last).abs() <= JOIN_TOLERANCE => {}
            _ => result.push(value),
        }
    }
    result
}

fn connected_components(lines: &[Segment]) -> Vec<Vec<Segment>> {
    let mut parent = (0..lines.len()).collect::<Vec<_>>();

    fn find(parent: &mut [usize], index: usize) -> usize {
        let mut root = index;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cursor = index;
        while parent[cursor] != root {
            let next = parent[cursor];
            parent[cursor] = root;
            cursor = next;
        }
        root
    }

    for left in 0..lines.len() {
        for right in (left + 1)..lines.len() {
            if lines[left]
                .bbox()
                .intersects(&lines[right].bbox(), JOIN_TOLERANCE)
            {
                let a = find(&mut parent, left);
                let b = find(&mut parent, right);
                if a != b {
                    parent[a] = b;
                }
            }
        }
    }

    let mut groups: Vec<(usize, Vec<Segment>)> = Vec::new();
    for index in 0..lines.len() {
        let root = find(&mut parent, index);
        match groups.iter_mut().find(|(group_root, _)| *group_root == root) {
            Some((_, members)) => members.push(lines[index]),
            None => groups.push((root, vec![lines[index]])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Rulings of a grid with the given column and row edges.
    pub(crate) fn grid(xs: &[f32], ys: &[f32]) -> Vec<Segment> {
        let (left, right) = (xs[0], xs[xs.len() - 1]);
        let (bottom, top) = (ys[0], ys[ys.len() - 1]);
        let mut segments = Vec::new();
        for y in ys {
            segments.push(Segment::new(left, *y, right, *y));
        }
        for x in xs {
            segments.push(Segment::new(*x, bottom, *x, top));
        }
        segments
    }

    #[test]
    fn two_by_two_grid_becomes_markdown() {
        let rulings = grid(&[50.0, 150.0, 250.0], &[600.0, 620.0, 640.0]);
        let runs = vec![
            TextRun::new("Term", 55.0, 626.0, 8.0),
            TextRun::new("Meaning", 155.0, 626.0, 8.0),
            TextRun::new("ATP", 55.0, 606.0, 8.0),
            TextRun::new("Energy carrier", 155.0, 606.0, 8.0),
        ];

        let tables = detect_tables(&rulings, &runs);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].bbox, Rect::new(50.0, 600.0, 250.0, 640.0));
        assert_eq!(
            tables[0].to_markdown().as_deref(),
            Some("| Term | Meaning |\n| --- | --- |\n| ATP | Energy carrier |")
        );
    }

    #[test]
    fn empty_header_produces_no_markdown() {
        let rulings = grid(&[50.0, 150.0, 250.0], &[600.0, 620.0, 640.0]);
        let runs = vec![TextRun::new("ATP", 55.0, 606.0, 8.0)];

        let tables = detect_tables(&rulings, &runs);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].to_markdown(), None);
    }

    #[test]
    fn a_single_framed_box_is_not_a_table() {
        let rulings = grid(&[50.0, 250.0], &[600.0, 640.0]);
        assert!(detect_tables(&rulings, &[]).is_empty());
    }

    #[test]
    fn separate_grids_are_separate_tables() {
        let mut rulings = grid(&[50.0, 150.0, 250.0], &[600.0, 620.0, 640.0]);
        rulings.extend(grid(&[50.0, 150.0, 250.0], &[300.0, 320.0, 340.0]));
        let tables = detect_tables(&rulings, &[]);
        assert_eq!(tables.len(), 2);
        assert!(tables[0].bbox.y1 > tables[1].bbox.y1);
    }
}
