//! Device-space rectangles used for op bounds.
//!
//! ## Usage
//!
//! Track op and chain bounds, and decide whether two regions may be reordered.

/// An axis-aligned float rectangle stored as left/top/right/bottom edges.
///
/// Empty and inverted rectangles are allowed; op bounds may legitimately be
/// empty (a zero-area draw still occupies a slot in painter's order).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    /// Left edge.
    pub left: f32,
    /// Top edge.
    pub top: f32,
    /// Right edge (exclusive).
    pub right: f32,
    /// Bottom edge (exclusive).
    pub bottom: f32,
}

impl Rect {
    /// The zero-area rectangle at the origin.
    pub const EMPTY: Self = Self::from_ltrb(0.0, 0.0, 0.0, 0.0);

    /// A maximally inverted rectangle.
    ///
    /// Joining any non-empty rectangle into it yields that rectangle, and it
    /// overlaps nothing. Used as the seed for running unions.
    pub const LARGEST_INVERTED: Self = Self::from_ltrb(f32::MAX, f32::MAX, -f32::MAX, -f32::MAX);

    /// Creates a rectangle from its four edges.
    #[must_use]
    pub const fn from_ltrb(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Creates a rectangle from an origin and a size.
    ///
    /// # Examples
    ///
    /// ```
    /// use tessera_ops::Rect;
    ///
    /// let rect = Rect::from_xywh(20.0, 20.0, 10.0, 10.0);
    /// assert_eq!(rect.right, 30.0);
    /// assert_eq!(rect.height(), 10.0);
    /// ```
    #[must_use]
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::from_ltrb(x, y, x + width, y + height)
    }

    /// Returns the width; negative for inverted rectangles.
    #[must_use]
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    /// Returns the height; negative for inverted rectangles.
    #[must_use]
    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Returns true if the rectangle encloses no area (including NaN edges).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.left < self.right && self.top < self.bottom)
    }

    /// Returns true if all four edges are finite numbers.
    ///
    /// # Examples
    ///
    /// ```
    /// use tessera_ops::Rect;
    ///
    /// assert!(Rect::from_xywh(0.0, 0.0, 1.0, 1.0).is_finite());
    /// assert!(!Rect::from_xywh(f32::NAN, 0.0, 1.0, 1.0).is_finite());
    /// assert!(!Rect::from_ltrb(0.0, 0.0, f32::INFINITY, 1.0).is_finite());
    /// ```
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.left.is_finite()
            && self.top.is_finite()
            && self.right.is_finite()
            && self.bottom.is_finite()
    }

    /// Returns true if the interiors of the two rectangles intersect.
    ///
    /// Rectangles that only share an edge do not overlap. Empty rectangles are
    /// compared by their edges, so a degenerate rectangle strictly inside a
    /// larger one still counts as overlapping.
    ///
    /// # Examples
    ///
    /// ```
    /// use tessera_ops::Rect;
    ///
    /// let a = Rect::from_xywh(0.0, 0.0, 10.0, 10.0);
    /// assert!(a.overlaps(&Rect::from_xywh(5.0, 5.0, 10.0, 10.0)));
    /// assert!(!a.overlaps(&Rect::from_xywh(10.0, 0.0, 10.0, 10.0)));
    /// ```
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.right > other.left
            && self.bottom > other.top
            && other.right > self.left
            && other.bottom > self.top
    }

    /// Like [`Rect::overlaps`] but shared edges count as contact.
    #[must_use]
    pub fn touches_or_overlaps(&self, other: &Self) -> bool {
        self.right >= other.left
            && self.bottom >= other.top
            && other.right >= self.left
            && other.bottom >= self.top
    }

    /// Returns true if `other` lies within this rectangle, allowing either to be
    /// empty.
    #[must_use]
    pub fn contains_allow_empty(&self, other: &Self) -> bool {
        self.left <= other.left
            && self.top <= other.top
            && self.right >= other.right
            && self.bottom >= other.bottom
    }

    /// Returns the union with `other`, ignoring `other` if it is empty and
    /// replacing `self` if `self` is empty.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        if other.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *other;
        }
        self.join_possibly_empty(other)
    }

    /// Returns the union with a non-empty `other`.
    ///
    /// Unlike [`Rect::join`], an inverted `self` is replaced wholesale; this is
    /// what running unions seeded with [`Rect::LARGEST_INVERTED`] rely on.
    #[must_use]
    pub fn join_non_empty_arg(&self, other: &Self) -> Self {
        if self.left >= self.right || self.top >= self.bottom {
            *other
        } else {
            self.join_possibly_empty(other)
        }
    }

    /// Returns the edge-wise union, treating empty rectangles as points or
    /// segments that still extend the result.
    #[must_use]
    pub fn join_possibly_empty(&self, other: &Self) -> Self {
        Self {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Returns the intersection, or `None` if the rectangles do not overlap.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        (left < right && top < bottom).then_some(Self::from_ltrb(left, top, right, bottom))
    }

    /// Returns the smallest integer rectangle containing this one.
    #[must_use]
    pub fn round_out(&self) -> IRect {
        IRect::from_ltrb(
            self.left.floor() as i32,
            self.top.floor() as i32,
            self.right.ceil() as i32,
            self.bottom.ceil() as i32,
        )
    }
}

/// Returns true if ops confined to `a` and `b` may execute in either order.
///
/// Two regions that never overlap cannot observe each other's paint order.
#[must_use]
pub fn can_reorder(a: &Rect, b: &Rect) -> bool {
    !a.overlaps(b)
}

/// An integer rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IRect {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Right edge (exclusive).
    pub right: i32,
    /// Bottom edge (exclusive).
    pub bottom: i32,
}

impl IRect {
    /// The zero-area rectangle at the origin.
    pub const EMPTY: Self = Self::from_ltrb(0, 0, 0, 0);

    /// Creates a rectangle from its four edges.
    #[must_use]
    pub const fn from_ltrb(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Creates a rectangle covering `width` x `height` pixels at the origin.
    #[must_use]
    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::from_ltrb(0, 0, width, height)
    }

    /// Returns the width.
    #[must_use]
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    /// Returns the height.
    #[must_use]
    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Returns true if the rectangle encloses no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Returns the union, ignoring empty operands.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        if other.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *other;
        }
        Self::from_ltrb(
            self.left.min(other.left),
            self.top.min(other.top),
            self.right.max(other.right),
            self.bottom.max(other.bottom),
        )
    }

    /// Converts to a float rectangle.
    #[must_use]
    pub fn to_rect(&self) -> Rect {
        Rect::from_ltrb(
            self.left as f32,
            self.top as f32,
            self.right as f32,
            self.bottom as f32,
        )
    }
}
