//! Overlay Geometry Manager - the floating step inspector.
//!
//! Geometry is in terminal cells. The overlay opens beside the clicked
//! timeline step and can then be dragged by its header or resized from any
//! edge or corner. Every rectangle it produces satisfies
//! `margin' <= x && x + width <= viewport.width - margin'` (and the same for
//! y), where `margin'` is the configured margin shrunk to fit tiny viewports.
//!
//! Pointer handling is a small state machine with one active interaction:
//!
//! ```text
//!          down(header)             down(edge)
//!   Dragging ◄────────── Idle ──────────► Resizing(direction)
//!        └──── up ──────► ▲ ◄───── up ──────┘
//! ```

use crate::config::OverlayConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// One past the last column.
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    /// One past the last row.
    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewport {
    pub width: i32,
    pub height: i32,
}

impl Viewport {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width: width.max(0),
            height: height.max(0),
        }
    }
}

/// Active resize handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResizeDirection {
    Left,
    Right,
    Top,
    Bottom,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl ResizeDirection {
    /// `Some(true)` when the right edge moves, `Some(false)` for the left.
    pub const fn horizontal_edge(self) -> Option<bool> {
        match self {
            Self::Left | Self::TopLeft | Self::BottomLeft => Some(false),
            Self::Right | Self::TopRight | Self::BottomRight => Some(true),
            Self::Top | Self::Bottom => None,
        }
    }

    /// `Some(true)` when the bottom edge moves, `Some(false)` for the top.
    pub const fn vertical_edge(self) -> Option<bool> {
        match self {
            Self::Top | Self::TopLeft | Self::TopRight => Some(false),
            Self::Bottom | Self::BottomLeft | Self::BottomRight => Some(true),
            Self::Left | Self::Right => None,
        }
    }

    fn from_edges(horizontal: Option<bool>, vertical: Option<bool>) -> Option<Self> {
        match (horizontal, vertical) {
            (Some(false), None) => Some(Self::Left),
            (Some(true), None) => Some(Self::Right),
            (None, Some(false)) => Some(Self::Top),
            (None, Some(true)) => Some(Self::Bottom),
            (Some(false), Some(false)) => Some(Self::TopLeft),
            (Some(true), Some(false)) => Some(Self::TopRight),
            (Some(false), Some(true)) => Some(Self::BottomLeft),
            (Some(true), Some(true)) => Some(Self::BottomRight),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Interaction {
    #[default]
    Idle,
    Dragging {
        /// Pointer offset from the overlay origin at grab time
        grab: Point,
    },
    Resizing {
        direction: ResizeDirection,
        start_pointer: Point,
        start_rect: Rect,
    },
}

/// Where a pointer landed relative to the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayHit {
    Outside,
    /// Border cell; resizes
    Edge(ResizeDirection),
    /// First inner row; drags
    Header,
    Body,
}

/// Result of routing a pointer-down through the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerDown {
    /// No overlay open
    Ignored,
    /// Landed outside; the overlay was closed
    Closed,
    DragStarted,
    ResizeStarted(ResizeDirection),
    /// Landed in the body, or an interaction was already active
    Inside,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayState {
    pub title: String,
    pub content: String,
    pub rect: Rect,
    /// Index of the timeline step the overlay was opened from
    pub anchor_step: usize,
}

#[derive(Debug, Clone)]
pub struct OverlayManager {
    config: OverlayConfig,
    viewport: Viewport,
    overlay: Option<OverlayState>,
    interaction: Interaction,
}

impl OverlayManager {
    pub fn new(config: OverlayConfig, viewport: Viewport) -> Self {
        Self {
            config,
            viewport,
            overlay: None,
            interaction: Interaction::Idle,
        }
    }

    pub fn overlay(&self) -> Option<&OverlayState> {
        self.overlay.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.overlay.is_some()
    }

    pub fn interaction(&self) -> Interaction {
        self.interaction
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Adopts a new viewport and re-clamps the open overlay.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.rect = clamp_rect(&self.config, viewport, overlay.rect);
        }
    }

    // =========================================================================
    // OPEN / CLOSE
    // =========================================================================

    /// Opens the overlay beside `anchor`.
    ///
    /// Left of the anchor when it fits, else right of it, else pinned to the
    /// left edge. Vertically aligned with the anchor, clamped on-screen.
    pub fn open(&mut self, anchor: Rect, anchor_step: usize, title: impl Into<String>, content: impl Into<String>) -> Rect {
        let (mx, my) = effective_margins(&self.config, self.viewport);
        let width = clamp_extent(
            self.config.default_width,
            self.config.min_width,
            self.config.max_width,
            self.viewport.width - 2 * mx,
        );
        let height = clamp_extent(
            self.config.default_height,
            self.config.min_height,
            self.config.max_height,
            self.viewport.height - 2 * my,
        );

        let left = anchor.x - self.config.margin - width;
        let right = anchor.right() + self.config.margin;
        let x = if left >= mx {
            left
        } else if right + width <= self.viewport.width - mx {
            right
        } else {
            mx
        };

        let rect = clamp_rect(&self.config, self.viewport, Rect::new(x, anchor.y, width, height));
        self.overlay = Some(OverlayState {
            title: title.into(),
            content: content.into(),
            rect,
            anchor_step,
        });
        self.interaction = Interaction::Idle;
        rect
    }

    pub fn close(&mut self) {
        self.overlay = None;
        self.interaction = Interaction::Idle;
    }

    /// Cancel key: closes unconditionally.
    pub fn cancel_key(&mut self) {
        self.close();
    }

    // =========================================================================
    // POINTER DISPATCH
    // =========================================================================

    pub fn hit_test(&self, p: Point) -> OverlayHit {
        let Some(overlay) = self.overlay.as_ref() else {
            return OverlayHit::Outside;
        };
        let r = overlay.rect;
        if !r.contains(p) {
            return OverlayHit::Outside;
        }
        let horizontal = if p.x == r.x {
            Some(false)
        } else if p.x == r.right() - 1 {
            Some(true)
        } else {
            None
        };
        let vertical = if p.y == r.y {
            Some(false)
        } else if p.y == r.bottom() - 1 {
            Some(true)
        } else {
            None
        };
        if let Some(direction) = ResizeDirection::from_edges(horizontal, vertical) {
            return OverlayHit::Edge(direction);
        }
        if p.y == r.y + 1 {
            OverlayHit::Header
        } else {
            OverlayHit::Body
        }
    }

    /// Routes a pointer press. Outside the overlay closes it.
    pub fn pointer_down(&mut self, p: Point) -> PointerDown {
        let Some(rect) = self.overlay.as_ref().map(|o| o.rect) else {
            return PointerDown::Ignored;
        };
        if self.interaction != Interaction::Idle {
            return PointerDown::Inside;
        }
        match self.hit_test(p) {
            OverlayHit::Outside => {
                self.close();
                PointerDown::Closed
            }
            OverlayHit::Header => {
                self.interaction = Interaction::Dragging {
                    grab: Point::new(p.x - rect.x, p.y - rect.y),
                };
                PointerDown::DragStarted
            }
            OverlayHit::Edge(direction) => {
                self.interaction = Interaction::Resizing {
                    direction,
                    start_pointer: p,
                    start_rect: rect,
                };
                PointerDown::ResizeStarted(direction)
            }
            OverlayHit::Body => PointerDown::Inside,
        }
    }

    /// Applies pointer motion to the active interaction. Returns the new
    /// rectangle when it changed.
    pub fn pointer_move(&mut self, p: Point) -> Option<Rect> {
        let interaction = self.interaction;
        let overlay = self.overlay.as_mut()?;
        let next = match interaction {
            Interaction::Idle => return None,
            Interaction::Dragging { grab } => {
                let moved = Rect::new(p.x - grab.x, p.y - grab.y, overlay.rect.width, overlay.rect.height);
                clamp_rect(&self.config, self.viewport, moved)
            }
            Interaction::Resizing {
                direction,
                start_pointer,
                start_rect,
            } => resize_rect(
                &self.config,
                self.viewport,
                start_rect,
                direction,
                p.x - start_pointer.x,
                p.y - start_pointer.y,
            ),
        };
        if next == overlay.rect {
            return None;
        }
        overlay.rect = next;
        Some(next)
    }

    /// Ends whichever interaction is active.
    pub fn pointer_up(&mut self) {
        self.interaction = Interaction::Idle;
    }
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// Configured margin, shrunk so it never exceeds half the viewport.
fn effective_margins(config: &OverlayConfig, viewport: Viewport) -> (i32, i32) {
    let margin = config.margin.max(0);
    (margin.min(viewport.width / 2), margin.min(viewport.height / 2))
}

fn clamp_extent(value: i32, min: i32, max: i32, available: i32) -> i32 {
    value.clamp(min, max.max(min)).min(available.max(0)).max(0)
}

/// Clamps size to `[min, max]` (and to what fits), then position on-screen.
pub fn clamp_rect(config: &OverlayConfig, viewport: Viewport, rect: Rect) -> Rect {
    let viewport = Viewport::new(viewport.width, viewport.height);
    let (mx, my) = effective_margins(config, viewport);
    let width = clamp_extent(rect.width, config.min_width, config.max_width, viewport.width - 2 * mx);
    let height = clamp_extent(rect.height, config.min_height, config.max_height, viewport.height - 2 * my);
    let x = rect.x.clamp(mx, viewport.width - width - mx);
    let y = rect.y.clamp(my, viewport.height - height - my);
    Rect::new(x, y, width, height)
}

/// Applies a pointer delta to `start` for the given handle.
///
/// Moving a left or top edge keeps the opposite edge fixed; an edge pushed
/// past the viewport margin is cut back to it.
pub fn resize_rect(
    config: &OverlayConfig,
    viewport: Viewport,
    start: Rect,
    direction: ResizeDirection,
    dx: i32,
    dy: i32,
) -> Rect {
    let viewport = Viewport::new(viewport.width, viewport.height);
    let (mx, my) = effective_margins(config, viewport);
    let (x, width) = resize_axis(
        start.x,
        start.width,
        direction.horizontal_edge(),
        dx,
        config.min_width,
        config.max_width,
        mx,
        viewport.width,
    );
    let (y, height) = resize_axis(
        start.y,
        start.height,
        direction.vertical_edge(),
        dy,
        config.min_height,
        config.max_height,
        my,
        viewport.height,
    );
    clamp_rect(config, viewport, Rect::new(x, y, width, height))
}

#[allow(clippy::too_many_arguments)]
fn resize_axis(
    origin: i32,
    extent: i32,
    edge: Option<bool>,
    delta: i32,
    min: i32,
    max: i32,
    margin: i32,
    limit: i32,
) -> (i32, i32) {
    let available = limit - 2 * margin;
    match edge {
        None => (origin, extent),
        Some(true) => {
            let far_limit = limit - margin - origin;
            let size = clamp_extent(extent + delta, min, max, available).min(far_limit.max(0));
            (origin, size)
        }
        Some(false) => {
            let far = origin + extent;
            let size = clamp_extent(extent - delta, min, max, available).min((far - margin).max(0));
            (far - size, size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager(width: i32, height: i32) -> OverlayManager {
        OverlayManager::new(OverlayConfig::default(), Viewport::new(width, height))
    }

    fn in_bounds(rect: Rect, viewport: Viewport) -> bool {
        rect.x >= 0
            && rect.y >= 0
            && rect.width >= 0
            && rect.height >= 0
            && rect.right() <= viewport.width
            && rect.bottom() <= viewport.height
    }

    #[test]
    fn test_open_prefers_left_of_anchor() {
        let mut m = manager(200, 50);
        let rect = m.open(Rect::new(100, 10, 30, 1), 0, "step", "");
        assert_eq!(rect.x, 100 - 2 - 48);
        assert_eq!(rect.y, 10);
    }

    #[test]
    fn test_open_falls_back_to_right() {
        let mut m = manager(200, 50);
        let rect = m.open(Rect::new(10, 10, 30, 1), 0, "step", "");
        assert_eq!(rect.x, 10 + 30 + 2);
    }

    #[test]
    fn test_open_near_right_edge_stays_in_bounds() {
        let mut m = manager(80, 24);
        let rect = m.open(Rect::new(30, 20, 48, 1), 3, "step", "");
        // Neither side fits; pinned to the left margin.
        assert_eq!(rect.x, 2);
        assert!(rect.x >= 2 && rect.right() <= 80 - 2);
        assert!(rect.bottom() <= 24 - 2);
        assert_eq!(m.overlay().unwrap().anchor_step, 3);
    }

    #[test]
    fn test_hit_test_regions() {
        let mut m = manager(200, 50);
        let r = m.open(Rect::new(100, 10, 30, 1), 0, "step", "");
        assert_eq!(m.hit_test(Point::new(r.x, r.y)), OverlayHit::Edge(ResizeDirection::TopLeft));
        assert_eq!(
            m.hit_test(Point::new(r.right() - 1, r.bottom() - 1)),
            OverlayHit::Edge(ResizeDirection::BottomRight)
        );
        assert_eq!(m.hit_test(Point::new(r.x + 5, r.y)), OverlayHit::Edge(ResizeDirection::Top));
        assert_eq!(m.hit_test(Point::new(r.x + 5, r.y + 1)), OverlayHit::Header);
        assert_eq!(m.hit_test(Point::new(r.x + 5, r.y + 4)), OverlayHit::Body);
        assert_eq!(m.hit_test(Point::new(0, 0)), OverlayHit::Outside);
    }

    #[test]
    fn test_drag_clamps_to_viewport() {
        let mut m = manager(100, 40);
        let r = m.open(Rect::new(60, 10, 10, 1), 0, "step", "");
        assert_eq!(m.pointer_down(Point::new(r.x + 3, r.y + 1)), PointerDown::DragStarted);

        let moved = m.pointer_move(Point::new(r.x + 13, r.y + 6)).unwrap();
        assert_eq!((moved.x, moved.y), (r.x + 10, r.y + 5));

        let pinned = m.pointer_move(Point::new(-500, -500)).unwrap();
        assert_eq!((pinned.x, pinned.y), (2, 2));
        let pinned = m.pointer_move(Point::new(500, 500)).unwrap();
        assert_eq!(pinned.right(), 98);
        assert_eq!(pinned.bottom(), 38);

        m.pointer_up();
        assert_eq!(m.interaction(), Interaction::Idle);
        assert!(m.pointer_move(Point::new(10, 10)).is_none());
    }

    #[test]
    fn test_resize_left_edge_keeps_right_edge() {
        let mut m = manager(200, 60);
        let r = m.open(Rect::new(100, 10, 10, 1), 0, "step", "");
        let p = Point::new(r.x, r.y + 5);
        assert_eq!(m.pointer_down(p), PointerDown::ResizeStarted(ResizeDirection::Left));
        let resized = m.pointer_move(Point::new(p.x - 10, p.y)).unwrap();
        assert_eq!(resized.width, r.width + 10);
        assert_eq!(resized.right(), r.right());
    }

    #[test]
    fn test_resize_respects_min_and_max() {
        let config = OverlayConfig::default();
        let viewport = Viewport::new(300, 100);
        let start = Rect::new(50, 20, 48, 14);
        let shrunk = resize_rect(&config, viewport, start, ResizeDirection::BottomRight, -100, -100);
        assert_eq!((shrunk.width, shrunk.height), (config.min_width, config.min_height));
        let grown = resize_rect(&config, viewport, start, ResizeDirection::BottomRight, 500, 500);
        assert_eq!(grown.width, config.max_width);
        assert!(grown.bottom() <= 98);
    }

    #[test]
    fn test_single_active_interaction() {
        let mut m = manager(200, 50);
        let r = m.open(Rect::new(100, 10, 30, 1), 0, "step", "");
        m.pointer_down(Point::new(r.x + 3, r.y + 1));
        assert_eq!(m.pointer_down(Point::new(r.x, r.y)), PointerDown::Inside);
        assert!(matches!(m.interaction(), Interaction::Dragging { .. }));
    }

    #[test]
    fn test_click_outside_and_cancel_close() {
        let mut m = manager(200, 50);
        m.open(Rect::new(100, 10, 30, 1), 0, "step", "");
        assert_eq!(m.pointer_down(Point::new(199, 49)), PointerDown::Closed);
        assert!(!m.is_open());
        assert_eq!(m.pointer_down(Point::new(1, 1)), PointerDown::Ignored);

        m.open(Rect::new(100, 10, 30, 1), 0, "step", "");
        m.cancel_key();
        assert!(!m.is_open());
    }

    #[test]
    fn test_tiny_viewport_never_negative() {
        let mut m = manager(5, 3);
        let rect = m.open(Rect::new(2, 1, 1, 1), 0, "step", "");
        assert!(in_bounds(rect, m.viewport()));
    }

    fn direction() -> impl Strategy<Value = ResizeDirection> {
        prop_oneof![
            Just(ResizeDirection::Left),
            Just(ResizeDirection::Right),
            Just(ResizeDirection::Top),
            Just(ResizeDirection::Bottom),
            Just(ResizeDirection::TopLeft),
            Just(ResizeDirection::TopRight),
            Just(ResizeDirection::BottomLeft),
            Just(ResizeDirection::BottomRight),
        ]
    }

    proptest! {
        #[test]
        fn test_open_always_in_bounds(
            vw in 0i32..250, vh in 0i32..80,
            ax in -50i32..300, ay in -50i32..100, aw in 0i32..60,
        ) {
            let mut m = manager(vw, vh);
            let rect = m.open(Rect::new(ax, ay, aw, 1), 0, "", "");
            prop_assert!(in_bounds(rect, m.viewport()));
        }

        #[test]
        fn test_drag_always_in_bounds(
            vw in 60i32..250, vh in 20i32..80,
            moves in prop::collection::vec((-400i32..400, -400i32..400), 1..20),
        ) {
            let mut m = manager(vw, vh);
            let r = m.open(Rect::new(vw / 2, vh / 2, 4, 1), 0, "", "");
            prop_assert_eq!(
                m.pointer_down(Point::new(r.x + r.width / 2, r.y + 1)),
                PointerDown::DragStarted
            );
            for (x, y) in moves {
                m.pointer_move(Point::new(x, y));
                let rect = m.overlay().unwrap().rect;
                prop_assert!(in_bounds(rect, m.viewport()));
            }
        }

        #[test]
        fn test_resize_always_in_bounds(
            vw in 0i32..250, vh in 0i32..80,
            x in -20i32..260, y in -20i32..90, w in -10i32..200, h in -10i32..60,
            dir in direction(), dx in -400i32..400, dy in -400i32..400,
        ) {
            let config = OverlayConfig::default();
            let viewport = Viewport::new(vw, vh);
            let start = clamp_rect(&config, viewport, Rect::new(x, y, w, h));
            let rect = resize_rect(&config, viewport, start, dir, dx, dy);
            prop_assert!(in_bounds(rect, viewport));
        }
    }
}
