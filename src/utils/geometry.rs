use std::fmt;
use std::marker::PhantomData;

/// Type-level marker for the physical coordinate space of a display
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// A point as defined by its x and y coordinates
#[repr(C)]
pub struct Point<Kind> {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Point<Kind> {
    /// Create a new point
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<Kind> From<(i32, i32)> for Point<Kind> {
    #[inline]
    fn from((x, y): (i32, i32)) -> Self {
        Point::new(x, y)
    }
}

impl<Kind> Clone for Point<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Point<Kind> {}

impl<Kind> PartialEq for Point<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<Kind> Eq for Point<Kind> {}

impl<Kind> Default for Point<Kind> {
    fn default() -> Self {
        Point::new(0, 0)
    }
}

impl<Kind> fmt::Debug for Point<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

/// A size as defined by its width and height
///
/// Negative extents are clamped to zero on construction.
#[repr(C)]
pub struct Size<Kind> {
    /// horizontal extent
    pub w: i32,
    /// vertical extent
    pub h: i32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Size<Kind> {
    /// Create a new size
    #[inline]
    pub fn new(w: i32, h: i32) -> Self {
        Size {
            w: w.max(0),
            h: h.max(0),
            _kind: PhantomData,
        }
    }

    /// Check if this [`Size`] is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

impl<Kind> From<(i32, i32)> for Size<Kind> {
    #[inline]
    fn from((w, h): (i32, i32)) -> Self {
        Size::new(w, h)
    }
}

impl<Kind> Clone for Size<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Size<Kind> {}

impl<Kind> PartialEq for Size<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<Kind> Eq for Size<Kind> {}

impl<Kind> Default for Size<Kind> {
    fn default() -> Self {
        Size::new(0, 0)
    }
}

impl<Kind> fmt::Debug for Size<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

/// A rectangle defined by its top-left corner and dimensions
#[repr(C)]
pub struct Rectangle<Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<Kind>,
}

impl<Kind> Rectangle<Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn new(loc: impl Into<Point<Kind>>, size: impl Into<Size<Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its bottom-right corner
    #[inline]
    pub fn from_extremities(topleft: impl Into<Point<Kind>>, bottomright: impl Into<Point<Kind>>) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: Size::new(bottomright.x - topleft.x, bottomright.y - topleft.y),
        }
    }

    /// Check if this [`Rectangle`] is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }
}

impl Rectangle<Buffer> {
    /// Source rectangle in the 16.16 fixed point representation the kernel expects for plane sources
    ///
    /// Negative coordinates are clamped to the buffer origin.
    pub fn to_fixed_16_16(&self) -> (u32, u32, u32, u32) {
        (
            (self.loc.x.max(0) as u32) << 16,
            (self.loc.y.max(0) as u32) << 16,
            (self.size.w as u32) << 16,
            (self.size.h as u32) << 16,
        )
    }
}

impl<Kind> Clone for Rectangle<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Rectangle<Kind> {}

impl<Kind> PartialEq for Rectangle<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<Kind> Eq for Rectangle<Kind> {}

impl<Kind> Default for Rectangle<Kind> {
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

impl<Kind> fmt::Debug for Rectangle<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}
