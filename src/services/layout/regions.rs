//! Responsive canvas regions
//!
//! The canvas is split into a title row, a main row, a row of supporting
//! regions, and a footer. The supporting column count follows canvas-width
//! breakpoints. Resizing rebuilds every region and invalidates existing
//! placements.

use crate::models::layout::{Bounds, CanvasElement, LayoutRegion, RegionLayoutHints, RegionType};
use tracing::debug;

/// Width breakpoints and their supporting-column counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakpoint {
    Small,
    Medium,
    Large,
    XLarge,
}

impl Breakpoint {
    pub fn for_width(width: f64) -> Self {
        if width < 640.0 {
            Breakpoint::Small
        } else if width < 1024.0 {
            Breakpoint::Medium
        } else if width < 1440.0 {
            Breakpoint::Large
        } else {
            Breakpoint::XLarge
        }
    }

    pub fn columns(self) -> usize {
        match self {
            Breakpoint::Small => 2,
            Breakpoint::Medium => 3,
            Breakpoint::Large => 4,
            Breakpoint::XLarge => 5,
        }
    }
}

/// Builds and manages the canvas region set for one layout frame
pub struct ResponsiveRegionManager {
    canvas_width: f64,
    canvas_height: f64,
    regions: Vec<LayoutRegion>,
}

impl ResponsiveRegionManager {
    pub fn new(canvas_width: f64, canvas_height: f64) -> Self {
        let mut manager = Self {
            canvas_width,
            canvas_height,
            regions: Vec::new(),
        };
        manager.rebuild();
        manager
    }

    /// Rebuild all regions for the current canvas size
    ///
    /// Row split: title 12%, main 53%, supporting 25%, footer 10%.
    fn rebuild(&mut self) {
        let width = self.canvas_width;
        let height = self.canvas_height;
        let breakpoint = Breakpoint::for_width(width);
        let columns = breakpoint.columns();
        let margin = 16.0;

        let title_height = height * 0.12;
        let main_height = height * 0.53;
        let supporting_height = height * 0.25;
        let footer_height = height * 0.10;

        let mut regions = Vec::new();

        regions.push(LayoutRegion {
            id: "title".to_string(),
            bounds: Bounds::new(margin, 0.0, width - 2.0 * margin, title_height),
            region_type: RegionType::Title,
            priority: 100,
            capacity: 1,
            current_load: 0,
            semantic_roles: vec!["definition".to_string(), "formula".to_string()],
            layout_hints: RegionLayoutHints {
                alignment: "center".to_string(),
                ..RegionLayoutHints::default()
            },
        });

        regions.push(LayoutRegion {
            id: "main".to_string(),
            bounds: Bounds::new(margin, title_height, width - 2.0 * margin, main_height),
            region_type: RegionType::Main,
            priority: 90,
            capacity: 4,
            current_load: 0,
            semantic_roles: Vec::new(),
            layout_hints: RegionLayoutHints::default(),
        });

        let supporting_y = title_height + main_height;
        let column_width = (width - margin * (columns as f64 + 1.0)) / columns as f64;
        for column in 0..columns {
            let x = margin + column as f64 * (column_width + margin);
            regions.push(LayoutRegion {
                id: format!("supporting-{column}"),
                bounds: Bounds::new(x, supporting_y, column_width, supporting_height),
                region_type: RegionType::Supporting,
                priority: 60,
                capacity: 2,
                current_load: 0,
                semantic_roles: vec![
                    "example".to_string(),
                    "comparison".to_string(),
                    "list".to_string(),
                ],
                layout_hints: RegionLayoutHints::default(),
            });
        }

        regions.push(LayoutRegion {
            id: "footer".to_string(),
            bounds: Bounds::new(
                margin,
                supporting_y + supporting_height,
                width - 2.0 * margin,
                footer_height,
            ),
            region_type: RegionType::Footer,
            priority: 30,
            capacity: 2,
            current_load: 0,
            semantic_roles: vec!["story".to_string()],
            layout_hints: RegionLayoutHints {
                allow_overflow: true,
                ..RegionLayoutHints::default()
            },
        });

        debug!(
            event = "regions_rebuilt",
            width = width,
            height = height,
            columns = columns,
            region_count = regions.len(),
            "Canvas regions rebuilt"
        );

        self.regions = regions;
    }

    /// Resize the canvas, rebuilding regions and invalidating placements
    pub fn resize(&mut self, width: f64, height: f64) {
        self.canvas_width = width;
        self.canvas_height = height;
        self.rebuild();
    }

    /// Clear per-frame occupancy without rebuilding geometry
    pub fn reset_loads(&mut self) {
        for region in self.regions.iter_mut() {
            region.current_load = 0;
        }
    }

    /// All regions, highest priority first
    pub fn regions(&self) -> &[LayoutRegion] {
        &self.regions
    }

    /// Pick the best region for a semantic role
    ///
    /// Regions that explicitly list the role win first, by priority; then
    /// generalist regions with capacity; finally anything with capacity or
    /// an overflow allowance.
    pub fn select_region(&self, semantic_role: Option<&str>) -> Option<String> {
        fn best(mut candidates: Vec<&LayoutRegion>) -> Option<String> {
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
            candidates.first().map(|r| r.id.clone())
        }

        if let Some(role) = semantic_role {
            let explicit: Vec<&LayoutRegion> = self
                .regions
                .iter()
                .filter(|r| r.current_load < r.capacity)
                .filter(|r| r.semantic_roles.iter().any(|x| x == role))
                .collect();
            if let Some(id) = best(explicit) {
                return Some(id);
            }
        }

        let general: Vec<&LayoutRegion> = self
            .regions
            .iter()
            .filter(|r| r.current_load < r.capacity)
            .filter(|r| r.semantic_roles.is_empty())
            .collect();
        if let Some(id) = best(general) {
            return Some(id);
        }

        best(self.regions.iter().filter(|r| r.has_capacity()).collect())
    }

    /// Reserve a slot in a region and position the element there
    ///
    /// Position follows the region's alignment and current occupancy;
    /// elements are clipped to the region bounds unless overflow is
    /// allowed. Returns the assigned bounds.
    pub fn reserve(&mut self, region_id: &str, element: &mut CanvasElement) -> Option<Bounds> {
        let region = self.regions.iter_mut().find(|r| r.id == region_id)?;
        if !region.has_capacity() {
            return None;
        }

        let slot = region.current_load;
        region.current_load += 1;

        let hints = &region.layout_hints;
        let bounds = region.bounds;

        if !hints.allow_overflow {
            if let Some(max) = hints.max_element_size {
                element.width = element.width.min(max);
                element.height = element.height.min(max);
            }
            element.width = element.width.min(bounds.width);
            element.height = element.height.min(bounds.height);
        }

        let y = bounds.y + slot as f64 * (element.height + hints.spacing);
        let x = match hints.alignment.as_str() {
            "center" => bounds.x + (bounds.width - element.width) / 2.0,
            "end" => bounds.right() - element.width,
            _ => bounds.x,
        };

        element.place_at(x, y);

        if !hints.allow_overflow {
            // Clip the slot back inside the region
            let clipped_y = y.min(bounds.bottom() - element.height).max(bounds.y);
            element.y = clipped_y;
        }

        Some(element.bounds())
    }

    /// Bounds of a region by id
    pub fn region_bounds(&self, region_id: &str) -> Option<Bounds> {
        self.regions
            .iter()
            .find(|r| r.id == region_id)
            .map(|r| r.bounds)
    }
}
