/// Array metadata model.
///
/// Plain data describing a remote array: its attributes (the interleaved
/// fields of a cell), its two dimensions, and an optional spatial reference
/// overlay. Nothing in here talks to the gateway.
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

/// Dimension name assumed to be horizontal when no spatial reference says otherwise.
pub const DEFAULT_X_DIM: &str = "x";

/// Dimension name assumed to be vertical when no spatial reference says otherwise.
pub const DEFAULT_Y_DIM: &str = "y";

/// Null indicator byte of a present value in a nullable attribute.
pub const NULL_INDICATOR_PRESENT: u8 = 0xFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Bool,
    Char,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl ScalarType {
    /// Number of bytes a value of this type occupies in a binary cell.
    pub fn width(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::Char | ScalarType::Int8 | ScalarType::Uint8 => 1,
            ScalarType::Int16 | ScalarType::Uint16 => 2,
            ScalarType::Int32 | ScalarType::Uint32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::Uint64 | ScalarType::Float64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::Char => "char",
            ScalarType::Int8 => "int8",
            ScalarType::Int16 => "int16",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::Uint8 => "uint8",
            ScalarType::Uint16 => "uint16",
            ScalarType::Uint32 => "uint32",
            ScalarType::Uint64 => "uint64",
            ScalarType::Float32 => "float32",
            ScalarType::Float64 => "float64",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScalarType {
    type Err = String;

    /// Parse a type id as reported by the gateway. The store's own spellings
    /// `float` and `double` are accepted next to the sized names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let parsed = match lowered.as_str() {
            "bool" => ScalarType::Bool,
            "char" => ScalarType::Char,
            "int8" => ScalarType::Int8,
            "int16" => ScalarType::Int16,
            "int32" => ScalarType::Int32,
            "int64" => ScalarType::Int64,
            "uint8" => ScalarType::Uint8,
            "uint16" => ScalarType::Uint16,
            "uint32" => ScalarType::Uint32,
            "uint64" => ScalarType::Uint64,
            "float" | "float32" => ScalarType::Float32,
            "double" | "float64" => ScalarType::Float64,
            _ => return Err(format!("unsupported attribute type '{}'", s)),
        };
        Ok(parsed)
    }
}

/// One interleaved field of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub type_id: ScalarType,
    pub nullable: bool,
}

impl Attribute {
    pub fn new(name: &str, type_id: ScalarType, nullable: bool) -> Attribute {
        Attribute {
            name: name.to_string(),
            type_id,
            nullable,
        }
    }

    /// Bytes this attribute takes in one binary record, null indicator included.
    pub fn cell_width(&self) -> usize {
        self.type_id.width() + if self.nullable { 1 } else { 0 }
    }

    /// Binary format tag, e.g. `int16` or `uint8 NULL`.
    pub fn format_tag(&self) -> String {
        if self.nullable {
            format!("{} NULL", self.type_id)
        } else {
            self.type_id.to_string()
        }
    }
}

/// One integer-indexed dimension. `low..=high` is the valid index range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub low: i64,
    pub high: i64,
    pub chunk_size: u32,
    #[serde(default)]
    pub overlap: u32,
    pub type_id: String,
}

impl Dimension {
    pub fn new(name: &str, low: i64, high: i64, chunk_size: u32) -> Dimension {
        Dimension {
            name: name.to_string(),
            low,
            high,
            chunk_size,
            overlap: 0,
            type_id: "int64".to_string(),
        }
    }

    /// Number of valid indices along this dimension.
    pub fn len(&self) -> u64 {
        if self.high < self.low {
            0
        } else {
            (self.high - self.low) as u64 + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Six-coefficient affine geotransform.
///
/// Maps (first dimension index, second dimension index) to projected
/// coordinates:
///
/// * `x = x0 + a11 * i + a12 * j`
/// * `y = y0 + a21 * i + a22 * j`
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub x0: f64,
    pub a11: f64,
    pub a12: f64,
    pub y0: f64,
    pub a21: f64,
    pub a22: f64,
}

impl Default for AffineTransform {
    fn default() -> Self {
        AffineTransform {
            x0: 0.0,
            a11: 1.0,
            a12: 0.0,
            y0: 0.0,
            a21: 0.0,
            a22: 1.0,
        }
    }
}

impl AffineTransform {
    /// Build from a geotransform array ordered `(x0, a11, a12, y0, a21, a22)`.
    pub fn from_geotransform(gt: [f64; 6]) -> AffineTransform {
        AffineTransform {
            x0: gt[0],
            a11: gt[1],
            a12: gt[2],
            y0: gt[3],
            a21: gt[4],
            a22: gt[5],
        }
    }

    pub fn to_geotransform(&self) -> [f64; 6] {
        [self.x0, self.a11, self.a12, self.y0, self.a21, self.a22]
    }

    pub fn is_identity(&self) -> bool {
        *self == AffineTransform::default()
    }

    pub fn apply(&self, i: f64, j: f64) -> (f64, f64) {
        (
            self.x0 + self.a11 * i + self.a12 * j,
            self.y0 + self.a21 * i + self.a22 * j,
        )
    }
}

impl fmt::Display for AffineTransform {
    /// Wire form used by the gateway's spatial reference functions.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x0={} y0={} a11={} a22={} a12={} a21={}",
            self.x0, self.y0, self.a11, self.a22, self.a12, self.a21
        )
    }
}

impl FromStr for AffineTransform {
    type Err = String;

    /// Parse `key=value` pairs separated by whitespace. Missing keys keep
    /// their identity value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = AffineTransform::default();
        for pair in s.split_whitespace() {
            let mut kv = pair.splitn(2, '=');
            let key = kv.next().unwrap_or("");
            let value: f64 = kv
                .next()
                .ok_or_else(|| format!("malformed transform term '{}'", pair))?
                .parse()
                .map_err(|_| format!("malformed transform value in '{}'", pair))?;
            match key {
                "x0" => out.x0 = value,
                "y0" => out.y0 = value,
                "a11" => out.a11 = value,
                "a12" => out.a12 = value,
                "a21" => out.a21 = value,
                "a22" => out.a22 = value,
                _ => return Err(format!("unknown transform coefficient '{}'", key)),
            }
        }
        Ok(out)
    }
}

/// Georeferencing overlay of an array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpatialReference {
    pub wkt: String,
    pub proj4: String,
    pub horizontal_dim: String,
    pub vertical_dim: String,
    pub authority_name: String,
    pub authority_srid: u32,
    pub transform: AffineTransform,
}

impl SpatialReference {
    /// True iff both axis names are set and at least one of the reference
    /// texts is non-empty.
    pub fn is_spatial(&self) -> bool {
        !self.horizontal_dim.is_empty()
            && !self.vertical_dim.is_empty()
            && (!self.wkt.is_empty() || !self.proj4.is_empty())
    }
}

/// Which native dimension is horizontal (`x`) and which is vertical (`y`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Axes {
    pub x: usize,
    pub y: usize,
}

impl Axes {
    /// Match the caller's axis convention against the native dimension order.
    ///
    /// Explicit axis names win when both are set, otherwise the default names
    /// are tried. When only one name matches, the other axis takes the
    /// remaining dimension. No match, or both names on the same dimension,
    /// means positional order.
    pub fn resolve(dimensions: &[Dimension], spatial: Option<&SpatialReference>) -> Axes {
        let (x_name, y_name) = match spatial {
            Some(srs) if !srs.horizontal_dim.is_empty() && !srs.vertical_dim.is_empty() => {
                (srs.horizontal_dim.as_str(), srs.vertical_dim.as_str())
            }
            _ => (DEFAULT_X_DIM, DEFAULT_Y_DIM),
        };

        let find = |name: &str| dimensions.iter().take(2).position(|d| d.name == name);
        match (find(x_name), find(y_name)) {
            (Some(x), Some(y)) if x != y => Axes { x, y },
            (Some(x), None) => Axes { x, y: 1 - x },
            (None, Some(y)) => Axes { x: 1 - y, y },
            _ => Axes { x: 0, y: 1 },
        }
    }
}

/// Inclusive rectangle in the caller's horizontal/vertical convention.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Rectangle {
    pub x_min: i64,
    pub x_max: i64,
    pub y_min: i64,
    pub y_max: i64,
}

impl Rectangle {
    pub fn new(x_min: i64, x_max: i64, y_min: i64, y_max: i64) -> Rectangle {
        Rectangle {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x[{}:{}] y[{}:{}]",
            self.x_min, self.x_max, self.y_min, self.y_max
        )
    }
}

/// Inclusive index ranges in the array's native dimension order.
///
/// Cells of a slab are laid out row-major: the first native dimension
/// selects the row, the second the column.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Slab {
    pub low: [i64; 2],
    pub high: [i64; 2],
}

impl Slab {
    /// Number of indices along native dimension `d`, `None` when it does not
    /// fit in `usize`.
    fn extent(&self, d: usize) -> Option<usize> {
        if self.high[d] < self.low[d] {
            return Some(0);
        }
        let span = self.high[d].checked_sub(self.low[d])?.checked_add(1)?;
        usize::try_from(span).ok()
    }

    /// (rows, columns) of the slab; zero when a range is inverted. Saturates
    /// for slabs larger than the address space, see `byte_len`.
    pub fn shape(&self) -> (usize, usize) {
        (
            self.extent(0).unwrap_or(usize::MAX),
            self.extent(1).unwrap_or(usize::MAX),
        )
    }

    pub fn cells(&self) -> usize {
        let (rows, cols) = self.shape();
        rows.saturating_mul(cols)
    }

    /// Bytes needed to hold the slab at `width` bytes per cell, `None` on
    /// overflow.
    pub fn byte_len(&self, width: usize) -> Option<usize> {
        self.extent(0)?
            .checked_mul(self.extent(1)?)?
            .checked_mul(width)
    }

    /// Intersect with the valid ranges of `dimensions`, `None` when disjoint.
    pub fn clip(&self, dimensions: &[Dimension]) -> Option<Slab> {
        let mut clipped = *self;
        for d in 0..2 {
            let dim = dimensions.get(d)?;
            if dim.is_empty() {
                return None;
            }
            clipped.low[d] = self.low[d].max(dim.low);
            clipped.high[d] = self.high[d].min(dim.high);
            if clipped.low[d] > clipped.high[d] {
                return None;
            }
        }
        Some(clipped)
    }
}

/// Aggregate statistics of one attribute over the whole array.
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct AttributeStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stdev: f64,
}

/// Complete description of a remote two-dimensional array.
///
/// Built once (by describing an existing array, or by the caller before a
/// create) and read freely afterwards. The only mutation is replacing the
/// spatial reference overlay, which also re-resolves the axes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayMetadata {
    name: String,
    attributes: Vec<Attribute>,
    dimensions: Vec<Dimension>,
    spatial: Option<SpatialReference>,
    axes: Axes,
}

impl ArrayMetadata {
    pub fn new(name: &str, attributes: Vec<Attribute>, dimensions: Vec<Dimension>) -> ArrayMetadata {
        let axes = Axes::resolve(&dimensions, None);
        ArrayMetadata {
            name: name.to_string(),
            attributes,
            dimensions,
            spatial: None,
            axes,
        }
    }

    /// Merge an optional spatial reference into freshly built metadata.
    pub fn with_spatial_reference(mut self, spatial: Option<SpatialReference>) -> ArrayMetadata {
        self.set_spatial_reference(spatial);
        self
    }

    /// Replace the spatial reference overlay.
    pub fn set_spatial_reference(&mut self, spatial: Option<SpatialReference>) {
        self.axes = Axes::resolve(&self.dimensions, spatial.as_ref());
        self.spatial = spatial;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, index: usize) -> Option<&Attribute> {
        self.attributes.get(index)
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn spatial_reference(&self) -> Option<&SpatialReference> {
        self.spatial.as_ref()
    }

    pub fn is_spatial(&self) -> bool {
        self.spatial.as_ref().map_or(false, |s| s.is_spatial())
    }

    pub fn axes(&self) -> Axes {
        self.axes
    }

    pub fn horizontal(&self) -> Option<&Dimension> {
        self.dimensions.get(self.axes.x)
    }

    pub fn vertical(&self) -> Option<&Dimension> {
        self.dimensions.get(self.axes.y)
    }

    /// Bytes of one full binary record (all attributes).
    pub fn cell_width(&self) -> usize {
        self.attributes.iter().map(Attribute::cell_width).sum()
    }

    /// Binary format string of a full record, e.g. `(int16,uint8 NULL)`.
    pub fn format_string(&self) -> String {
        let tags: Vec<String> = self.attributes.iter().map(Attribute::format_tag).collect();
        format!("({})", tags.join(","))
    }

    /// Translate a caller rectangle into native dimension order.
    pub fn slab(&self, rect: &Rectangle) -> Slab {
        let mut slab = Slab {
            low: [rect.x_min, rect.y_min],
            high: [rect.x_max, rect.y_max],
        };
        if self.axes.x == 1 {
            slab.low.swap(0, 1);
            slab.high.swap(0, 1);
        }
        slab
    }
}

impl fmt::Display for ArrayMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}':", self.name)?;
        for dim in &self.dimensions {
            write!(f, "<'{}',{}:{},{}>", dim.name, dim.low, dim.high, dim.type_id)?;
        }
        for attr in &self.attributes {
            write!(f, "['{}',{},{}]", attr.name, attr.type_id, attr.nullable)?;
        }
        Ok(())
    }
}
