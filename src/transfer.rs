/// Binary transfer engine.
///
/// Moves rectangles of raw cells between caller buffers and the gateway.
/// Buffers are row-major over the array's native dimension order: the first
/// native dimension selects the row, the second the column, and every cell
/// is one fixed-width record.
///
/// A rectangle that reaches past the array's valid range is a boundary
/// fragment. On read, the valid part is fetched into a scratch buffer sized
/// to the clipped extent and copied row by row into the caller's buffer at
/// the caller's full stride; bytes of out-of-range cells are never touched.
/// On write, the valid part is repacked row by row into a tight scratch
/// buffer before upload and the rest is discarded.
use crate::error::{ShimError, ShimResult};
use crate::model::{ArrayMetadata, Rectangle, Slab};
use crate::query;
use crate::session::{Outcome, Session};
use crate::transport::{Endpoint, Gateway};
use ndarray::{s, ArrayView2, ArrayViewMut2, ShapeError};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// How boundary fragments get their scratch buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScratchStrategy {
    /// Allocate a new buffer for every fragment.
    Fresh,
    /// Keep one buffer in the engine and grow it as needed.
    Reuse,
}

/// Copy a tightly packed `inner` block into `dest`, which is laid out with
/// the stride of `outer`. Cells of `outer` outside `inner` keep their bytes.
///
/// # Arguments
///
/// * `src` - `inner.cells() * width` bytes, row-major
/// * `inner` - The clipped ranges, contained in `outer`
/// * `dest` - At least `outer.cells() * width` bytes
/// * `outer` - The ranges the caller's buffer was sized for
/// * `width` - Bytes per cell
///
pub fn scatter_rows(
    src: &[u8],
    inner: &Slab,
    dest: &mut [u8],
    outer: &Slab,
    width: usize,
) -> Result<(), ShapeError> {
    let (rows, cols) = inner.shape();
    let (outer_rows, outer_cols) = outer.shape();
    let row_offset = (inner.low[0] - outer.low[0]) as usize;
    let col_offset = (inner.low[1] - outer.low[1]) as usize * width;

    let packed = ArrayView2::from_shape((rows, cols * width), &src[..rows * cols * width])?;
    let mut strided = ArrayViewMut2::from_shape(
        (outer_rows, outer_cols * width),
        &mut dest[..outer_rows * outer_cols * width],
    )?;
    strided
        .slice_mut(s![
            row_offset..row_offset + rows,
            col_offset..col_offset + cols * width
        ])
        .assign(&packed);
    Ok(())
}

/// Inverse of `scatter_rows`: pack the `inner` cells of a buffer laid out
/// with the stride of `outer` into `dest`.
pub fn gather_rows(
    src: &[u8],
    outer: &Slab,
    dest: &mut [u8],
    inner: &Slab,
    width: usize,
) -> Result<(), ShapeError> {
    let (rows, cols) = inner.shape();
    let (outer_rows, outer_cols) = outer.shape();
    let row_offset = (inner.low[0] - outer.low[0]) as usize;
    let col_offset = (inner.low[1] - outer.low[1]) as usize * width;

    let strided = ArrayView2::from_shape(
        (outer_rows, outer_cols * width),
        &src[..outer_rows * outer_cols * width],
    )?;
    let mut packed = ArrayViewMut2::from_shape((rows, cols * width), &mut dest[..rows * cols * width])?;
    packed.assign(&strided.slice(s![
        row_offset..row_offset + rows,
        col_offset..col_offset + cols * width
    ]));
    Ok(())
}

pub struct TransferEngine {
    strategy: ScratchStrategy,
    scratch: Vec<u8>,
}

impl TransferEngine {
    pub fn new(strategy: ScratchStrategy) -> TransferEngine {
        TransferEngine {
            strategy,
            scratch: Vec::new(),
        }
    }

    pub fn strategy(&self) -> ScratchStrategy {
        self.strategy
    }

    /// Bytes currently held for boundary fragments.
    pub fn scratch_capacity(&self) -> usize {
        self.scratch.len()
    }

    fn scratch(&mut self, len: usize) -> &mut [u8] {
        match self.strategy {
            ScratchStrategy::Fresh => self.scratch = vec![0; len],
            ScratchStrategy::Reuse => {
                if self.scratch.len() < len {
                    self.scratch.resize(len, 0);
                }
            }
        }
        &mut self.scratch[..len]
    }

    /// Read one attribute of `rect` into `buf`.
    ///
    /// `buf` must hold the whole requested rectangle at the attribute's cell
    /// width (null indicator included for nullable attributes). When the
    /// rectangle is a boundary fragment only the in-range cells are written;
    /// the response body is the fragment buffer.
    #[instrument(skip(self, session, meta, buf), fields(array = %meta.name()))]
    pub fn read<G: Gateway>(
        &mut self,
        session: &Session<'_, G>,
        meta: &ArrayMetadata,
        attribute: usize,
        rect: Rectangle,
        buf: &mut [u8],
    ) -> ShimResult<()> {
        let width = meta
            .attribute(attribute)
            .ok_or_else(|| {
                ShimError::QueryBuild(format!(
                    "attribute index {} out of range for '{}'",
                    attribute,
                    meta.name()
                ))
            })?
            .cell_width();
        let (slab, clipped) = plan(meta, rect, width, buf.len())?;
        let query = query::subarray(meta, attribute, &clipped)?;

        let payload = fetch(session, &query).map_err(|e| e.during_transfer(meta.name(), rect))?;
        let expected = clipped.cells() * width;
        if payload.len() != expected {
            return Err(transfer_error(
                meta,
                rect,
                format!("payload has {} bytes, expected {}", payload.len(), expected),
            ));
        }

        if clipped == slab {
            buf[..expected].copy_from_slice(&payload);
            debug!(%rect, bytes = expected, "Read rectangle");
            return Ok(());
        }
        scatter_rows(&payload, &clipped, buf, &slab, width)
            .map_err(|e| transfer_error(meta, rect, format!("cannot place boundary fragment: {}", e)))?;
        debug!(%rect, rows = clipped.shape().0, cols = clipped.shape().1, "Read boundary fragment");
        Ok(())
    }

    /// Write full records of `rect` from `buf` into the array.
    ///
    /// `buf` holds pre-interleaved records at full stride, attributes in
    /// declared order, each nullable value preceded by its null indicator.
    /// Cells outside the array's valid range are dropped.
    #[instrument(skip(self, session, meta, buf), fields(array = %meta.name()))]
    pub fn write<G: Gateway>(
        &mut self,
        session: &Session<'_, G>,
        meta: &ArrayMetadata,
        rect: Rectangle,
        buf: &[u8],
    ) -> ShimResult<()> {
        query::validate_metadata(meta)?;
        let width = meta.cell_width();
        let (slab, clipped) = plan(meta, rect, width, buf.len())?;

        let payload: &[u8] = if clipped == slab {
            &buf[..slab.cells() * width]
        } else {
            let scratch = self.scratch(clipped.cells() * width);
            gather_rows(buf, &slab, scratch, &clipped, width)
                .map_err(|e| transfer_error(meta, rect, format!("cannot pack boundary fragment: {}", e)))?;
            scratch
        };
        let path = session
            .upload(payload)
            .map_err(|e| e.during_transfer(meta.name(), rect))?;

        let query = query::insert(meta, &clipped, &path)?;
        session
            .execute(&query)
            .map_err(|e| e.during_transfer(meta.name(), rect))?;
        debug!(%rect, cells = clipped.cells(), "Wrote rectangle");
        Ok(())
    }
}

fn transfer_error(meta: &ArrayMetadata, rect: Rectangle, reason: String) -> ShimError {
    ShimError::Transfer {
        array: meta.name().to_string(),
        rect,
        reason,
    }
}

/// Validate a transfer of `rect` against `meta` and a buffer of `buf_len`
/// bytes; returns the requested slab and its clipped counterpart.
fn plan(meta: &ArrayMetadata, rect: Rectangle, width: usize, buf_len: usize) -> ShimResult<(Slab, Slab)> {
    if rect.x_min > rect.x_max || rect.y_min > rect.y_max {
        return Err(ShimError::QueryBuild(format!("rectangle {} is empty", rect)));
    }
    let slab = meta.slab(&rect);
    let required = slab
        .byte_len(width)
        .ok_or_else(|| transfer_error(meta, rect, "rectangle needs more bytes than addressable".to_string()))?;
    if buf_len < required {
        return Err(transfer_error(
            meta,
            rect,
            format!("buffer holds {} bytes, rectangle needs {}", buf_len, required),
        ));
    }
    let clipped = slab
        .clip(meta.dimensions())
        .ok_or_else(|| transfer_error(meta, rect, "rectangle lies outside the array".to_string()))?;
    Ok((slab, clipped))
}

/// Execute a binary query and return its payload.
fn fetch<G: Gateway>(session: &Session<'_, G>, query: &query::Query) -> ShimResult<Vec<u8>> {
    match session.run(query)? {
        Outcome::Bytes(payload) => Ok(payload),
        other => Err(ShimError::Protocol {
            endpoint: Endpoint::ReadBytes.path(),
            message: format!("expected binary payload, got {:?}", other),
        }),
    }
}
