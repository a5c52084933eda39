// Reading-order grouping of raw text detections.
//
// Regions are first tagged with the panel and bubble they fall in, then
// unioned into dialogue groups with an explicit disjoint-set over region
// indices. Two regions whose centers sit in two different detected bubbles
// are never merged, no matter how close they are.

use crate::analysis::AnalyzerTuning;
use crate::core::types::{BBox, Bubble, Group, Panel, Region};

/// Union-find over region indices with path compression.
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    /// Member lists keyed by root, ordered by smallest member index.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let n = self.parent.len();
        let mut by_root: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            let root = self.find(i);
            by_root[root].push(i);
        }
        by_root.retain(|members| !members.is_empty());
        by_root
    }
}

/// Assign each region the panel whose area its center falls in, falling
/// back to the panel with the best bbox overlap.
fn assign_panel(bbox: &BBox, panels: &[Panel]) -> Option<usize> {
    let (cx, cy) = bbox.center();
    if let Some(p) = panels.iter().find(|p| p.bbox.contains_point(cx, cy)) {
        return Some(p.id);
    }
    panels
        .iter()
        .map(|p| (p.id, bbox.overlap_ratio(&p.bbox)))
        .filter(|(_, r)| *r > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id)
}

/// Same as panels, but the overlap fallback requires a floor ratio.
fn assign_bubble(bbox: &BBox, bubbles: &[Bubble], floor: f64) -> Option<usize> {
    let (cx, cy) = bbox.center();
    if let Some(b) = bubbles.iter().find(|b| b.bbox.contains_point(cx, cy)) {
        return Some(b.id);
    }
    bubbles
        .iter()
        .map(|b| (b.id, bbox.overlap_ratio(&b.bbox)))
        .filter(|(_, r)| *r >= floor)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id)
}

fn adjacent(a: &Region, b: &Region, tuning: &AnalyzerTuning) -> bool {
    let (cxa, cya) = a.bbox.center();
    let (cxb, cyb) = b.bbox.center();
    let dx = (cxa - cxb).abs();
    let dy = (cya - cyb).abs();

    let max_w = a.bbox.w.max(b.bbox.w) as f32;
    let max_h = a.bbox.h.max(b.bbox.h) as f32;

    // Horizontally close, vertically within reach, centers aligned.
    if dx < tuning.group_h_gap
        && dy < tuning.group_v_limit
        && dx < max_w * tuning.group_center_align_factor
    {
        return true;
    }
    // Vertically close and horizontally close.
    if dy < tuning.group_v_gap && dx < tuning.group_h_gap {
        return true;
    }
    // Very close in both axes.
    if dx < tuning.group_tight_gap && dy < tuning.group_tight_gap {
        return true;
    }
    // Substantial bbox overlap either way.
    if a.bbox.overlap_ratio(&b.bbox) > tuning.group_overlap_merge
        || b.bbox.overlap_ratio(&a.bbox) > tuning.group_overlap_merge
    {
        return true;
    }
    // Two single-character-sized boxes on the same line and inline-close
    // (vertically stacked CJK glyphs read as one run).
    let small = |r: &Region| {
        r.bbox.w <= tuning.single_char_max_w && r.bbox.h <= tuning.single_char_max_h
    };
    if small(a) && small(b) {
        let same_line = dy < max_h * tuning.single_char_same_line_factor;
        let inline = dx < max_w * tuning.single_char_inline_factor;
        if same_line && inline {
            return true;
        }
    }
    false
}

/// Union regions into reading-order dialogue groups.
///
/// Every input region lands in exactly one group. Grouping is confined to a
/// single panel; regions in two different detected bubbles are vetoed from
/// merging. Returns the annotated regions and the final ordered groups.
pub fn group_text_by_structure(
    regions: &[Region],
    bubbles: &[Bubble],
    panels: &[Panel],
    rtl: bool,
    tuning: &AnalyzerTuning,
) -> (Vec<Region>, Vec<Group>) {
    let mut annotated: Vec<Region> = regions.to_vec();
    for r in &mut annotated {
        r.panel_id = assign_panel(&r.bbox, panels);
        r.bubble_id = assign_bubble(&r.bbox, bubbles, tuning.bubble_overlap_floor);
    }

    let mut ds = DisjointSet::new(annotated.len());
    for i in 0..annotated.len() {
        for j in (i + 1)..annotated.len() {
            let a = &annotated[i];
            let b = &annotated[j];
            if a.panel_id != b.panel_id {
                continue;
            }
            if let (Some(ba), Some(bb)) = (a.bubble_id, b.bubble_id) {
                if ba != bb {
                    continue;
                }
            }
            if adjacent(a, b, tuning) {
                ds.union(i, j);
            }
        }
    }

    let mut groups: Vec<Group> = ds
        .components()
        .into_iter()
        .map(|mut members| {
            members.sort_by(|&a, &b| {
                let ra = &annotated[a].bbox;
                let rb = &annotated[b].bbox;
                match ra.y.cmp(&rb.y) {
                    std::cmp::Ordering::Equal if rtl => rb.x.cmp(&ra.x),
                    std::cmp::Ordering::Equal => ra.x.cmp(&rb.x),
                    other => other,
                }
            });
            let bbox = members
                .iter()
                .map(|&i| annotated[i].bbox)
                .reduce(|a, b| a.union(&b))
                .unwrap_or(BBox::new(0, 0, 0, 0));
            let panel_id = annotated[members[0]].panel_id;
            Group {
                id: 0,
                is_ungrouped: members.len() == 1,
                region_indices: members,
                bbox,
                panel_id,
            }
        })
        .collect();

    // Final reading order: panel order first (panel ids are already in
    // reading order), then top-to-bottom, then x (mirrored for rtl).
    groups.sort_by(|a, b| {
        let pa = a.panel_id.map(|p| p as i64).unwrap_or(i64::MAX);
        let pb = b.panel_id.map(|p| p as i64).unwrap_or(i64::MAX);
        pa.cmp(&pb)
            .then(a.bbox.y.cmp(&b.bbox.y))
            .then(if rtl {
                b.bbox.x.cmp(&a.bbox.x)
            } else {
                a.bbox.x.cmp(&b.bbox.x)
            })
    });
    for (i, g) in groups.iter_mut().enumerate() {
        g.id = i;
    }

    (annotated, groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: i32, y: i32, w: i32, h: i32) -> Region {
        Region::new(BBox::new(x, y, w, h), "text", 0.9)
    }

    fn tuning() -> AnalyzerTuning {
        AnalyzerTuning::default()
    }

    #[test]
    fn disjoint_set_unions_and_compresses() {
        let mut ds = DisjointSet::new(5);
        ds.union(0, 1);
        ds.union(1, 2);
        ds.union(3, 4);
        assert_eq!(ds.find(0), ds.find(2));
        assert_ne!(ds.find(0), ds.find(3));
        let comps = ds.components();
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0], vec![0, 1, 2]);
        assert_eq!(comps[1], vec![3, 4]);
    }

    #[test]
    fn vertically_stacked_lines_form_one_group_top_to_bottom() {
        // Three regions stacked with <40px gaps and matching centers.
        let regions = vec![
            region(100, 200, 120, 30),
            region(100, 100, 120, 30),
            region(100, 150, 120, 30),
        ];
        let (_, groups) = group_text_by_structure(&regions, &[], &[], false, &tuning());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].region_indices, vec![1, 2, 0]);
        assert!(!groups[0].is_ungrouped);
        assert_eq!(groups[0].bbox, BBox::new(100, 100, 120, 130));
    }

    #[test]
    fn every_region_appears_exactly_once() {
        let regions = vec![
            region(0, 0, 50, 20),
            region(0, 30, 50, 20),
            region(500, 500, 50, 20),
            region(800, 100, 40, 20),
        ];
        let (_, groups) = group_text_by_structure(&regions, &[], &[], false, &tuning());
        let mut seen: Vec<usize> = groups
            .iter()
            .flat_map(|g| g.region_indices.iter().copied())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn grouping_is_deterministic() {
        let regions = vec![
            region(10, 10, 60, 20),
            region(10, 40, 60, 20),
            region(300, 10, 60, 20),
            region(300, 45, 60, 20),
        ];
        let (_, first) = group_text_by_structure(&regions, &[], &[], false, &tuning());
        for _ in 0..5 {
            let (_, again) = group_text_by_structure(&regions, &[], &[], false, &tuning());
            let a: Vec<_> = first.iter().map(|g| g.region_indices.clone()).collect();
            let b: Vec<_> = again.iter().map(|g| g.region_indices.clone()).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn different_bubbles_are_never_merged() {
        let bubbles = vec![
            Bubble {
                id: 0,
                bbox: BBox::new(0, 0, 100, 60),
                area: 6000.0,
                solidity: 0.9,
            },
            Bubble {
                id: 1,
                bbox: BBox::new(0, 70, 100, 60),
                area: 6000.0,
                solidity: 0.9,
            },
        ];
        // Geometrically close, but centers in different bubbles.
        let regions = vec![region(20, 20, 60, 20), region(20, 90, 60, 20)];
        let (annotated, groups) =
            group_text_by_structure(&regions, &bubbles, &[], false, &tuning());
        assert_eq!(annotated[0].bubble_id, Some(0));
        assert_eq!(annotated[1].bubble_id, Some(1));
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.is_ungrouped));
    }

    #[test]
    fn regions_are_confined_to_their_panels() {
        let panels = vec![
            Panel {
                id: 0,
                bbox: BBox::new(0, 0, 200, 200),
            },
            Panel {
                id: 1,
                bbox: BBox::new(0, 210, 200, 200),
            },
        ];
        // Close across the panel border.
        let regions = vec![region(50, 180, 60, 20), region(50, 220, 60, 20)];
        let (annotated, groups) =
            group_text_by_structure(&regions, &[], &panels, false, &tuning());
        assert_eq!(annotated[0].panel_id, Some(0));
        assert_eq!(annotated[1].panel_id, Some(1));
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn rtl_orders_same_row_groups_right_first() {
        let regions = vec![region(10, 10, 40, 20), region(400, 10, 40, 20)];
        let (_, groups) = group_text_by_structure(&regions, &[], &[], true, &tuning());
        assert_eq!(groups[0].region_indices, vec![1]);
        assert_eq!(groups[1].region_indices, vec![0]);
    }
}
