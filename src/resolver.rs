/// Metadata resolver.
///
/// Describing an array takes three independent lookups (attributes,
/// dimensions, spatial reference). This module runs them on one session,
/// decodes the text records the gateway returns and merges the pieces into
/// a single `ArrayMetadata`. It is the only place that decides whether an
/// array is usable; everything downstream trusts its result.
use crate::error::{ShimError, ShimResult};
use crate::model::{ArrayMetadata, Attribute, AttributeStats, Dimension, ScalarType, SpatialReference};
use crate::query::{self, Query};
use crate::session::{Outcome, Session};
use crate::transport::{Endpoint, Gateway};
use tracing::{debug, instrument, warn};

/// Dimensionality this client supports.
pub const SUPPORTED_DIMENSIONS: usize = 2;

fn protocol_error(message: String) -> ShimError {
    ShimError::Protocol {
        endpoint: Endpoint::ReadLines.path(),
        message,
    }
}

/// Split one text record into fields.
///
/// Fields are comma separated. Strings may be quoted with `'` or `"`;
/// inside quotes commas are kept and `\` escapes the next character.
/// Unquoted fields are trimmed.
pub fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quote: Option<char> = None;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        field.push(next);
                    }
                } else if c == q {
                    quote = None;
                } else {
                    field.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    quoted = true;
                }
                ',' => {
                    fields.push(finish_field(&mut field, quoted));
                    quoted = false;
                }
                _ => field.push(c),
            },
        }
    }
    fields.push(finish_field(&mut field, quoted));
    fields
}

fn finish_field(field: &mut String, quoted: bool) -> String {
    let done = std::mem::take(field);
    if quoted {
        done
    } else {
        done.trim().to_string()
    }
}

fn expect_fields(line: &str, count: usize, what: &str) -> ShimResult<Vec<String>> {
    let fields = split_record(line);
    if fields.len() != count {
        return Err(protocol_error(format!(
            "{} record has {} fields, expected {}: {}",
            what,
            fields.len(),
            count,
            line
        )));
    }
    Ok(fields)
}

fn parse_field<T: std::str::FromStr>(value: &str, what: &str) -> ShimResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| protocol_error(format!("cannot parse {} from '{}'", what, value)))
}

fn parse_bool(value: &str) -> ShimResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(protocol_error(format!("cannot parse bool from '{}'", value))),
    }
}

/// Decode `name,type_id,nullable` records.
pub fn parse_attributes(lines: &[String]) -> ShimResult<Vec<Attribute>> {
    lines
        .iter()
        .map(|line| -> ShimResult<Attribute> {
            let f = expect_fields(line, 3, "attribute")?;
            let type_id: ScalarType = f[1].parse().map_err(protocol_error)?;
            Ok(Attribute {
                name: f[0].clone(),
                type_id,
                nullable: parse_bool(&f[2])?,
            })
        })
        .collect()
}

/// Decode `name,low,high,chunk_interval,type` records.
pub fn parse_dimensions(lines: &[String]) -> ShimResult<Vec<Dimension>> {
    lines
        .iter()
        .map(|line| -> ShimResult<Dimension> {
            let f = expect_fields(line, 5, "dimension")?;
            Ok(Dimension {
                name: f[0].clone(),
                low: parse_field(&f[1], "dimension low")?,
                high: parse_field(&f[2], "dimension high")?,
                chunk_size: parse_field(&f[3], "chunk interval")?,
                overlap: 0,
                type_id: f[4].clone(),
            })
        })
        .collect()
}

/// Decode the `xdim,ydim,auth_name,auth_srid,srtext,proj4text,A` record.
///
/// No record means the array carries no spatial reference.
pub fn parse_spatial_reference(lines: &[String]) -> ShimResult<Option<SpatialReference>> {
    let line = match lines.first() {
        Some(line) => line,
        None => return Ok(None),
    };
    let f = expect_fields(line, 7, "spatial reference")?;
    let authority_srid = if f[3].trim().is_empty() {
        0
    } else {
        parse_field(&f[3], "authority srid")?
    };
    Ok(Some(SpatialReference {
        horizontal_dim: f[0].clone(),
        vertical_dim: f[1].clone(),
        authority_name: f[2].clone(),
        authority_srid,
        wkt: f[4].clone(),
        proj4: f[5].clone(),
        transform: f[6].parse().map_err(protocol_error)?,
    }))
}

/// Decode the single `min,max,mean,stdev` record of an aggregate.
pub fn parse_stats(lines: &[String]) -> ShimResult<AttributeStats> {
    let line = lines
        .first()
        .ok_or_else(|| protocol_error("aggregate returned no record".to_string()))?;
    let f = expect_fields(line, 4, "statistics")?;
    Ok(AttributeStats {
        min: parse_field(&f[0], "min")?,
        max: parse_field(&f[1], "max")?,
        mean: parse_field(&f[2], "mean")?,
        stdev: parse_field(&f[3], "stdev")?,
    })
}

/// Run a csv query and return its records.
pub fn fetch_lines<G: Gateway>(session: &Session<'_, G>, query: &Query) -> ShimResult<Vec<String>> {
    match session.run(query)? {
        Outcome::Lines(lines) => Ok(lines),
        other => Err(protocol_error(format!("expected text records, got {:?}", other))),
    }
}

pub fn array_exists<G: Gateway>(session: &Session<'_, G>, name: &str) -> ShimResult<bool> {
    let lines = fetch_lines(session, &query::array_exists(name)?)?;
    Ok(lines
        .iter()
        .any(|line| split_record(line).first().map_or(false, |n| n == name)))
}

/// Look up attributes, dimensions and spatial reference of `name`.
///
/// # Arguments
///
/// * `session` - An open session; all three lookups run on it in turn
/// * `name` - Array name
///
/// # Returns
///
/// * Fully resolved metadata, or `NotFound` when the array is missing or
///   is not a two-dimensional array with at least one attribute
///
#[instrument(skip(session))]
pub fn describe<G: Gateway>(session: &Session<'_, G>, name: &str) -> ShimResult<ArrayMetadata> {
    if !array_exists(session, name)? {
        return Err(ShimError::NotFound(format!("array '{}' does not exist", name)));
    }

    let attributes = parse_attributes(&fetch_lines(session, &query::attributes(name)?)?)?;
    if attributes.is_empty() {
        return Err(ShimError::NotFound(format!("array '{}' has no attributes", name)));
    }

    let dimensions = parse_dimensions(&fetch_lines(session, &query::dimensions(name)?)?)?;
    if dimensions.len() != SUPPORTED_DIMENSIONS {
        return Err(ShimError::NotFound(format!(
            "array '{}' has {} dimensions, only {} are supported",
            name,
            dimensions.len(),
            SUPPORTED_DIMENSIONS
        )));
    }

    let spatial = lookup_spatial_reference(session, name)?;
    let meta = ArrayMetadata::new(name, attributes, dimensions).with_spatial_reference(spatial);
    debug!(array = %meta, spatial = meta.is_spatial(), "Resolved array metadata");
    Ok(meta)
}

/// A rejected or malformed lookup means "no reference"; connection
/// problems still fail.
fn lookup_spatial_reference<G: Gateway>(
    session: &Session<'_, G>,
    name: &str,
) -> ShimResult<Option<SpatialReference>> {
    let lines = match fetch_lines(session, &query::spatial_reference(name)?) {
        Ok(lines) => lines,
        Err(ShimError::Query { message, .. }) => {
            debug!(array = name, reason = %message, "No spatial reference");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    match parse_spatial_reference(&lines) {
        Ok(srs) => Ok(srs),
        Err(e) => {
            warn!(array = name, error = %e, "Ignoring malformed spatial reference");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_record_quotes() {
        assert_eq!(vec!["band1", "int16", "false"], split_record("'band1','int16',false"));
        assert_eq!(
            vec!["GEOGCS[\"WGS 84\",DATUM[x]]", "it's", " 3"],
            split_record(r#"'GEOGCS["WGS 84",DATUM[x]]','it\'s',' 3'"#)
        );
        assert_eq!(vec!["a", "", "b"], split_record("a, ,b"));
    }

    #[test]
    fn test_parse_attributes() {
        let attrs = parse_attributes(&lines(&["'band1','int16',false", "'q','uint8',true"])).unwrap();
        assert_eq!(Attribute::new("band1", ScalarType::Int16, false), attrs[0]);
        assert_eq!(Attribute::new("q", ScalarType::Uint8, true), attrs[1]);
    }

    #[test]
    fn test_parse_attributes_unknown_type() {
        assert!(matches!(
            parse_attributes(&lines(&["'s','string',false"])),
            Err(ShimError::Protocol { .. })
        ));
    }

    #[test]
    fn test_parse_dimensions() {
        let dims = parse_dimensions(&lines(&["'x',0,999,512,'int64'", "'y',-5,994,256,'int64'"])).unwrap();
        assert_eq!(Dimension::new("x", 0, 999, 512), dims[0]);
        assert_eq!(-5, dims[1].low);
        assert_eq!(256, dims[1].chunk_size);
    }

    #[test]
    fn test_parse_spatial_reference() {
        let srs = parse_spatial_reference(&lines(&[
            "'x','y','EPSG',4326,'GEOGCS[\"WGS 84\"]','+proj=longlat +datum=WGS84 +no_defs','x0=7 y0=52 a11=0.1 a22=-0.1 a12=0 a21=0'",
        ]))
        .unwrap()
        .unwrap();
        assert!(srs.is_spatial());
        assert_eq!(4326, srs.authority_srid);
        assert_eq!(7.0, srs.transform.x0);
        assert_eq!(-0.1, srs.transform.a22);
        assert_eq!(None, parse_spatial_reference(&[]).unwrap());
    }

    #[test]
    fn test_parse_stats() {
        let stats = parse_stats(&lines(&["-3,250,101.5,12.25"])).unwrap();
        assert_eq!(
            AttributeStats {
                min: -3.0,
                max: 250.0,
                mean: 101.5,
                stdev: 12.25
            },
            stats
        );
        assert!(parse_stats(&[]).is_err());
        assert!(parse_stats(&lines(&["null,null,null,null"])).is_err());
    }
}
