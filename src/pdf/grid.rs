//! Lattice table detection: ruling lines → intersections → cells → tables.

use std::collections::HashMap;

use super::content::{PageLayout, Segment, TextSpan};
use super::{RawRow, Table};

/// Collinear rulings closer than this are treated as one line.
const SNAP_TOLERANCE: f64 = 3.0;
/// Gap bridged when joining pieces of the same ruling.
const JOIN_TOLERANCE: f64 = 3.0;
const INTERSECTION_TOLERANCE: f64 = 3.0;
const MIN_EDGE_LENGTH: f64 = 3.0;
/// Segments tilted less than this still count as axis-aligned.
const AXIS_TOLERANCE: f64 = 0.5;
/// Horizontal gap, as a fraction of font size, that separates two words.
const WORD_GAP: f64 = 0.15;

/// A merged ruling: `pos` is y for horizontal and x for vertical edges,
/// `from..to` the covered span along the other axis.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Edge {
    pos: f64,
    from: f64,
    to: f64,
}

#[derive(Debug, Clone, Copy)]
struct Point {
    x: f64,
    y: f64,
    h: usize,
    v: usize,
}

/// A grid cell in PDF user space (y grows upward, so `top > bottom`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
    corners: [usize; 4],
}

impl Cell {
    fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.left && x <= self.right && y >= self.bottom && y <= self.top
    }
}

/// Every ruled table on the page, top to bottom then left to right.
pub fn find_tables(layout: &PageLayout) -> Vec<Table> {
    let (horizontal, vertical) = split_edges(&layout.segments);
    let horizontal = merge_edges(horizontal);
    let vertical = merge_edges(vertical);

    let points = intersections(&horizontal, &vertical);
    let cells = build_cells(&points);

    let mut groups = group_cells(&cells);
    groups.sort_by(|a, b| {
        let (a_top, a_left) = origin(a);
        let (b_top, b_left) = origin(b);
        b_top.total_cmp(&a_top).then(a_left.total_cmp(&b_left))
    });

    groups
        .iter()
        .map(|group| build_table(group, &layout.spans))
        .collect()
}

fn split_edges(segments: &[Segment]) -> (Vec<Edge>, Vec<Edge>) {
    let mut horizontal = Vec::new();
    let mut vertical = Vec::new();
    for s in segments {
        let (dx, dy) = ((s.x1 - s.x0).abs(), (s.y1 - s.y0).abs());
        if dy <= AXIS_TOLERANCE && dx >= MIN_EDGE_LENGTH {
            horizontal.push(Edge {
                pos: (s.y0 + s.y1) / 2.0,
                from: s.x0.min(s.x1),
                to: s.x0.max(s.x1),
            });
        } else if dx <= AXIS_TOLERANCE && dy >= MIN_EDGE_LENGTH {
            vertical.push(Edge {
                pos: (s.x0 + s.x1) / 2.0,
                from: s.y0.min(s.y1),
                to: s.y0.max(s.y1),
            });
        }
    }
    (horizontal, vertical)
}

/// Snap near-collinear edges to a shared position, then join overlapping ones.
fn merge_edges(mut edges: Vec<Edge>) -> Vec<Edge> {
    edges.sort_by(|a, b| a.pos.total_cmp(&b.pos));

    let mut snapped = Vec::with_capacity(edges.len());
    let mut cluster: Vec<Edge> = Vec::new();
    for e in edges {
        if cluster.last().is_some_and(|last| e.pos - last.pos > SNAP_TOLERANCE) {
            flush_cluster(&mut cluster, &mut snapped);
        }
        cluster.push(e);
    }
    flush_cluster(&mut cluster, &mut snapped);

    snapped.sort_by(|a, b| a.pos.total_cmp(&b.pos).then(a.from.total_cmp(&b.from)));
    let mut merged: Vec<Edge> = Vec::new();
    for e in snapped {
        match merged.last_mut() {
            Some(last) if last.pos == e.pos && e.from <= last.to + JOIN_TOLERANCE => {
                last.to = last.to.max(e.to);
            }
            _ => merged.push(e),
        }
    }
    merged
}

fn flush_cluster(cluster: &mut Vec<Edge>, out: &mut Vec<Edge>) {
    if cluster.is_empty() {
        return;
    }
    let mean = cluster.iter().map(|e| e.pos).sum::<f64>() / cluster.len() as f64;
    out.extend(cluster.drain(..).map(|e| Edge { pos: mean, ..e }));
}

fn intersections(horizontal: &[Edge], vertical: &[Edge]) -> Vec<Point> {
    let t = INTERSECTION_TOLERANCE;
    let mut points = Vec::new();
    for (h, he) in horizontal.iter().enumerate() {
        for (v, ve) in vertical.iter().enumerate() {
            let crosses = ve.pos >= he.from - t
                && ve.pos <= he.to + t
                && he.pos >= ve.from - t
                && he.pos <= ve.to + t;
            if crosses {
                points.push(Point {
                    x: ve.pos,
                    y: he.pos,
                    h,
                    v,
                });
            }
        }
    }
    points
}

/// For each intersection, the smallest rectangle hanging down and to the
/// right of it whose corners are joined by rulings.
fn build_cells(points: &[Point]) -> Vec<Cell> {
    let mut by_h: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut by_v: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut index: HashMap<(usize, usize), usize> = HashMap::new();
    for (i, p) in points.iter().enumerate() {
        by_h.entry(p.h).or_default().push(i);
        by_v.entry(p.v).or_default().push(i);
        index.insert((p.h, p.v), i);
    }
    for row in by_h.values_mut() {
        row.sort_by(|&a, &b| points[a].x.total_cmp(&points[b].x));
    }
    for col in by_v.values_mut() {
        col.sort_by(|&a, &b| points[b].y.total_cmp(&points[a].y));
    }

    let mut cells = Vec::new();
    for (i, p) in points.iter().enumerate() {
        let below = by_v[&p.v].iter().copied().filter(|&j| points[j].y < p.y - AXIS_TOLERANCE);
        'search: for b in below {
            let right = by_h[&p.h].iter().copied().filter(|&j| points[j].x > p.x + AXIS_TOLERANCE);
            for r in right {
                if let Some(&corner) = index.get(&(points[b].h, points[r].v)) {
                    cells.push(Cell {
                        left: p.x,
                        right: points[r].x,
                        top: p.y,
                        bottom: points[b].y,
                        corners: [i, r, b, corner],
                    });
                    break 'search;
                }
            }
        }
    }
    cells
}

/// Cells sharing a corner belong to the same table. Lone cells are frames,
/// not tables.
fn group_cells(cells: &[Cell]) -> Vec<Vec<Cell>> {
    let mut parent: Vec<usize> = (0..cells.len()).collect();
    let mut owner: HashMap<usize, usize> = HashMap::new();
    for (i, cell) in cells.iter().enumerate() {
        for corner in cell.corners {
            match owner.get(&corner) {
                Some(&other) => union(&mut parent, i, other),
                None => {
                    owner.insert(corner, i);
                }
            }
        }
    }

    let mut groups: HashMap<usize, Vec<Cell>> = HashMap::new();
    for (i, cell) in cells.iter().enumerate() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(*cell);
    }
    groups.into_values().filter(|g| g.len() > 1).collect()
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        parent[ra.max(rb)] = ra.min(rb);
    }
}

fn origin(cells: &[Cell]) -> (f64, f64) {
    let top = cells.iter().map(|c| c.top).fold(f64::MIN, f64::max);
    let left = cells.iter().map(|c| c.left).fold(f64::MAX, f64::min);
    (top, left)
}

/// Lay cells out as rows over the table's distinct column starts. A grid
/// position covered by a spanning cell stays `None`.
fn build_table(cells: &[Cell], spans: &[TextSpan]) -> Table {
    let columns = distinct(cells.iter().map(|c| c.left), false);
    let tops = distinct(cells.iter().map(|c| c.top), true);

    tops.iter()
        .map(|&top| {
            let mut row: RawRow = vec![None; columns.len()];
            for cell in cells.iter().filter(|c| (c.top - top).abs() < SNAP_TOLERANCE) {
                if let Some(col) = columns.iter().position(|&x| (x - cell.left).abs() < SNAP_TOLERANCE) {
                    row[col] = Some(cell_text(cell, spans));
                }
            }
            row
        })
        .collect()
}

fn distinct(values: impl Iterator<Item = f64>, descending: bool) -> Vec<f64> {
    let mut v: Vec<f64> = values.collect();
    v.sort_by(|a, b| a.total_cmp(b));
    if descending {
        v.reverse();
    }
    v.dedup_by(|a, b| (*a - *b).abs() < SNAP_TOLERANCE);
    v
}

/// Text of the glyphs centred inside the cell: glyphs on one baseline are
/// joined, baselines are separated by `\n`.
fn cell_text(cell: &Cell, spans: &[TextSpan]) -> String {
    let mut inside: Vec<&TextSpan> = spans
        .iter()
        .filter(|s| {
            let ax = s.x + s.width / 2.0;
            let ay = s.y + s.size * 0.3;
            cell.contains(ax, ay)
        })
        .collect();
    inside.sort_by(|a, b| b.y.total_cmp(&a.y).then(a.x.total_cmp(&b.x)));

    let mut lines: Vec<Vec<&TextSpan>> = Vec::new();
    for s in inside {
        match lines.last_mut() {
            Some(line) if (line[0].y - s.y).abs() <= line[0].size.max(s.size) * 0.5 => line.push(s),
            _ => lines.push(vec![s]),
        }
    }

    lines
        .iter_mut()
        .map(|line| {
            line.sort_by(|a, b| a.x.total_cmp(&b.x));
            let mut out = String::new();
            let mut end: Option<f64> = None;
            for s in line.iter() {
                if let Some(prev_end) = end {
                    let gap = s.x - prev_end;
                    if gap > s.size * WORD_GAP && !out.ends_with(' ') && !s.text.starts_with(' ') {
                        out.push(' ');
                    }
                }
                out.push_str(&s.text);
                end = Some(s.x + s.width);
            }
            out.trim().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}
