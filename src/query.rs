/// Query builder.
///
/// Renders each logical operation into the gateway's textual query
/// language, together with the save format that decides which endpoint the
/// result is read from (`/read_lines` for csv, `/read_bytes` for binary, or
/// nothing at all).
use crate::error::{ShimError, ShimResult};
use crate::model::{ArrayMetadata, Slab, SpatialReference};

/// Linear cell index dimension of an uploaded file.
const UPLOAD_INDEX_DIM: &str = "__i";

/// How the gateway should materialize a query's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveFormat {
    /// Text records, read back line by line.
    Csv,
    /// Binary records in the given cell format, e.g. `(int16)`.
    Binary(String),
}

impl SaveFormat {
    pub fn as_param(&self) -> &str {
        match self {
            SaveFormat::Csv => "csv",
            SaveFormat::Binary(format) => format,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    /// `None` for queries whose result is not read.
    pub save: Option<SaveFormat>,
}

impl Query {
    fn csv(text: String) -> Query {
        Query {
            text,
            save: Some(SaveFormat::Csv),
        }
    }

    fn silent(text: String) -> Query {
        Query { text, save: None }
    }
}

/// Reject anything that is not a plain identifier, so names can be embedded
/// in query text unquoted.
pub fn validate_name(name: &str) -> ShimResult<()> {
    let mut chars = name.chars();
    let first_ok = match chars.next() {
        Some(c) => c.is_ascii_alphabetic() || c == '_',
        None => return Err(ShimError::QueryBuild("array name is empty".to_string())),
    };
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ShimError::QueryBuild(format!("'{}' is not a valid identifier", name)));
    }
    Ok(())
}

/// Checks shared by every operation that renders a schema or cell format.
pub fn validate_metadata(meta: &ArrayMetadata) -> ShimResult<()> {
    validate_name(meta.name())?;
    if meta.attributes().is_empty() {
        return Err(ShimError::QueryBuild(format!(
            "array '{}' needs at least one attribute",
            meta.name()
        )));
    }
    if meta.dimensions().is_empty() {
        return Err(ShimError::QueryBuild(format!(
            "array '{}' needs at least one dimension",
            meta.name()
        )));
    }
    for attr in meta.attributes() {
        validate_name(&attr.name)?;
    }
    for dim in meta.dimensions() {
        validate_name(&dim.name)?;
    }
    Ok(())
}

/// Single-quoted string literal with `\` escapes.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn attribute_schema(meta: &ArrayMetadata) -> String {
    let attrs: Vec<String> = meta
        .attributes()
        .iter()
        .map(|a| format!("{}:{}", a.name, a.format_tag()))
        .collect();
    format!("<{}>", attrs.join(","))
}

/// Schema string of `meta`, e.g. `<band1:int16>[x=0:999,512,0,y=0:999,512,0]`.
pub fn schema(meta: &ArrayMetadata) -> ShimResult<String> {
    validate_metadata(meta)?;
    let dims: Vec<String> = meta
        .dimensions()
        .iter()
        .map(|d| format!("{}={}:{},{},{}", d.name, d.low, d.high, d.chunk_size, d.overlap))
        .collect();
    Ok(format!("{}[{}]", attribute_schema(meta), dims.join(",")))
}

pub fn array_exists(name: &str) -> ShimResult<Query> {
    validate_name(name)?;
    Ok(Query::csv(format!(
        "project(filter(list('arrays'),name={}),name)",
        quote(name)
    )))
}

pub fn attributes(name: &str) -> ShimResult<Query> {
    validate_name(name)?;
    Ok(Query::csv(format!(
        "project(attributes({}),name,type_id,nullable)",
        name
    )))
}

pub fn dimensions(name: &str) -> ShimResult<Query> {
    validate_name(name)?;
    Ok(Query::csv(format!(
        "project(dimensions({}),name,low,high,chunk_interval,type)",
        name
    )))
}

pub fn spatial_reference(name: &str) -> ShimResult<Query> {
    validate_name(name)?;
    Ok(Query::csv(format!(
        "project(eo_getsrs({}),xdim,ydim,auth_name,auth_srid,srtext,proj4text,A)",
        name
    )))
}

pub fn create_array(meta: &ArrayMetadata, temporary: bool) -> ShimResult<Query> {
    Ok(Query::silent(format!(
        "create_array({},{},{})",
        meta.name(),
        schema(meta)?,
        temporary
    )))
}

pub fn remove_array(name: &str) -> ShimResult<Query> {
    validate_name(name)?;
    Ok(Query::silent(format!("remove({})", name)))
}

pub fn copy_array(source: &str, destination: &str) -> ShimResult<Query> {
    validate_name(source)?;
    validate_name(destination)?;
    Ok(Query::silent(format!("store({},{})", source, destination)))
}

/// Binary extraction of one attribute over `slab` (native dimension order).
pub fn subarray(meta: &ArrayMetadata, attribute: usize, slab: &Slab) -> ShimResult<Query> {
    validate_metadata(meta)?;
    let attr = meta.attribute(attribute).ok_or_else(|| {
        ShimError::QueryBuild(format!(
            "attribute index {} out of range for '{}' ({} attributes)",
            attribute,
            meta.name(),
            meta.attributes().len()
        ))
    })?;
    Ok(Query {
        text: format!(
            "project(between({},{},{},{},{}),{})",
            meta.name(),
            slab.low[0],
            slab.low[1],
            slab.high[0],
            slab.high[1],
            attr.name
        ),
        save: Some(SaveFormat::Binary(format!("({})", attr.format_tag()))),
    })
}

/// Insert an uploaded file of full records covering `slab` row-major.
///
/// # Arguments
///
/// * `meta` - Target array; the file's records follow its attribute order
/// * `slab` - Native-order ranges the file covers, already clipped
/// * `path` - Server-side path returned by the upload
///
pub fn insert(meta: &ArrayMetadata, slab: &Slab, path: &str) -> ShimResult<Query> {
    validate_metadata(meta)?;
    if meta.dimensions().len() != 2 {
        return Err(ShimError::QueryBuild(format!(
            "insert into '{}' needs exactly two dimensions",
            meta.name()
        )));
    }
    let (_, cols) = slab.shape();
    let cells = slab.cells();
    if cells == 0 {
        return Err(ShimError::QueryBuild("insert of an empty slab".to_string()));
    }
    let dims = meta.dimensions();
    Ok(Query::silent(format!(
        "insert(redimension(apply(input({attrs}[{i}=0:{last},{n},0],{path},-2,{format}),{d0},{lo0}+{i}/{cols},{d1},{lo1}+{i}%{cols}),{name}),{name})",
        attrs = attribute_schema(meta),
        i = UPLOAD_INDEX_DIM,
        last = cells - 1,
        n = cells,
        path = quote(path),
        format = quote(&meta.format_string()),
        d0 = dims[0].name,
        lo0 = slab.low[0],
        d1 = dims[1].name,
        lo1 = slab.low[1],
        cols = cols,
        name = meta.name(),
    )))
}

/// Attach a complete spatial reference to an array.
pub fn update_spatial_reference(name: &str, srs: &SpatialReference) -> ShimResult<Query> {
    validate_name(name)?;
    if !srs.is_spatial() {
        return Err(ShimError::QueryBuild(format!(
            "spatial reference for '{}' is incomplete",
            name
        )));
    }
    Ok(Query::silent(format!(
        "eo_setsrs({},{},{},{},{},{},{},{})",
        name,
        quote(&srs.horizontal_dim),
        quote(&srs.vertical_dim),
        quote(&srs.authority_name),
        srs.authority_srid,
        quote(&srs.transform.to_string()),
        quote(&srs.wkt),
        quote(&srs.proj4)
    )))
}

pub fn attribute_stats(meta: &ArrayMetadata, attribute: usize) -> ShimResult<Query> {
    validate_metadata(meta)?;
    let attr = meta.attribute(attribute).ok_or_else(|| {
        ShimError::QueryBuild(format!(
            "attribute index {} out of range for '{}'",
            attribute,
            meta.name()
        ))
    })?;
    Ok(Query::csv(format!(
        "aggregate({name},min({a}),max({a}),avg({a}),stdev({a}))",
        name = meta.name(),
        a = attr.name
    )))
}
