use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in canvas pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Right edge
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Center point
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Whether two boxes overlap
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Area of the intersection, zero when disjoint
    pub fn intersection_area(&self, other: &Bounds) -> f64 {
        let w = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let h = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        w * h
    }

    /// Whether `other` lies entirely inside this box
    pub fn contains(&self, other: &Bounds) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Drawable element kinds understood by the element surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Text,
    Rectangle,
    Ellipse,
    Arrow,
    Line,
    Image,
}

/// Visual styling for a canvas element
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementStyle {
    /// Stroke color (CSS color string)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,

    /// Fill color (CSS color string)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,

    /// Stroke width in pixels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,

    /// Opacity in `[0, 1]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
}

impl Default for ElementStyle {
    fn default() -> Self {
        Self {
            stroke: Some("#1a1a2e".to_string()),
            fill: None,
            stroke_width: Some(2.0),
            opacity: Some(1.0),
        }
    }
}

/// An abstract drawable on the lesson canvas
///
/// Exclusively owned by the layout engine while visible; rendering surfaces
/// receive cloned snapshots per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasElement {
    /// Unique identifier
    pub id: String,

    /// Drawable kind
    pub kind: ElementKind,

    /// Left edge in canvas pixels
    pub x: f64,

    /// Top edge in canvas pixels
    pub y: f64,

    /// Width in canvas pixels
    pub width: f64,

    /// Height in canvas pixels
    pub height: f64,

    /// Visual styling
    #[serde(default)]
    pub style: ElementStyle,

    /// Text content for text elements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Font size in pixels for text elements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,

    /// Id of the timeline event that produced this element
    pub source_event_id: String,
}

impl CanvasElement {
    /// The element's bounding box
    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.x, self.y, self.width, self.height)
    }

    /// Move the element so its top-left corner sits at `(x, y)`
    pub fn place_at(&mut self, x: f64, y: f64) {
        self.x = x;
        self.y = y;
    }
}

/// Region roles on the canvas, from most to least prominent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionType {
    Title,
    Main,
    Supporting,
    Sidebar,
    Footer,
    Floating,
}

/// Per-region layout behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionLayoutHints {
    /// Whether elements may exceed the region's capacity and bounds
    pub allow_overflow: bool,

    /// Horizontal alignment of reserved slots ("start", "center", "end")
    pub alignment: String,

    /// Gap between stacked elements in pixels
    pub spacing: f64,

    /// Upper bound on a single element's size inside this region
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_element_size: Option<f64>,
}

impl Default for RegionLayoutHints {
    fn default() -> Self {
        Self {
            allow_overflow: false,
            alignment: "start".to_string(),
            spacing: 12.0,
            max_element_size: None,
        }
    }
}

/// A rectangular slot of the canvas that accepts elements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutRegion {
    /// Unique identifier
    pub id: String,

    /// Region bounds in canvas pixels
    pub bounds: Bounds,

    /// Region role
    pub region_type: RegionType,

    /// Selection priority; higher wins when several regions qualify
    pub priority: u32,

    /// Maximum number of elements before the region is full
    pub capacity: usize,

    /// Number of elements currently placed
    pub current_load: usize,

    /// Semantic roles this region supports (e.g. "definition", "process")
    pub semantic_roles: Vec<String>,

    /// Layout behavior
    pub layout_hints: RegionLayoutHints,
}

impl LayoutRegion {
    /// Whether the region can take one more element
    pub fn has_capacity(&self) -> bool {
        self.current_load < self.capacity || self.layout_hints.allow_overflow
    }

    /// Whether the region supports a given semantic role
    pub fn supports_role(&self, role: &str) -> bool {
        self.semantic_roles.is_empty() || self.semantic_roles.iter().any(|r| r == role)
    }
}

/// Enter/exit animation attached to an element between layout states
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementTransition {
    /// Element being animated
    pub element_id: String,

    /// "enter" or "exit"
    pub kind: TransitionKind,

    /// Animation length in milliseconds
    pub duration: u64,

    /// Easing curve
    pub easing: String,
}

/// Direction of an element transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Enter,
    Exit,
}

/// The layout engine's answer to a seek: what is visible and what animates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSnapshot {
    /// Visible elements at the requested timestamp
    pub elements: Vec<CanvasElement>,

    /// Enter/exit transitions relative to the previous visible state
    pub transitions: Vec<ElementTransition>,

    /// How long the reconstruction took, in milliseconds
    pub seek_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_intersection() {
        let a = Bounds::new(0.0, 0.0, 100.0, 100.0);
        let b = Bounds::new(50.0, 50.0, 100.0, 100.0);
        let c = Bounds::new(200.0, 200.0, 10.0, 10.0);

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.intersection_area(&b), 2500.0);
        assert_eq!(a.intersection_area(&c), 0.0);
    }

    #[test]
    fn test_bounds_contains() {
        let outer = Bounds::new(0.0, 0.0, 100.0, 100.0);
        let inner = Bounds::new(10.0, 10.0, 20.0, 20.0);
        let straddling = Bounds::new(90.0, 90.0, 20.0, 20.0);

        assert!(outer.contains(&inner));
        assert!(!outer.contains(&straddling));
    }

    #[test]
    fn test_region_capacity_and_roles() {
        let mut region = LayoutRegion {
            id: "main-0".to_string(),
            bounds: Bounds::new(0.0, 100.0, 800.0, 400.0),
            region_type: RegionType::Main,
            priority: 80,
            capacity: 2,
            current_load: 0,
            semantic_roles: vec!["definition".to_string(), "process".to_string()],
            layout_hints: RegionLayoutHints::default(),
        };

        assert!(region.has_capacity());
        assert!(region.supports_role("process"));
        assert!(!region.supports_role("story"));

        region.current_load = 2;
        assert!(!region.has_capacity());

        region.layout_hints.allow_overflow = true;
        assert!(region.has_capacity());
    }
}
