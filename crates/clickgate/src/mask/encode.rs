//! Mask encoding: pixel grid -> fixed-row RLE.

use std::fs;
use std::path::Path;

use clickgate_common::{MaskError, Symbol};
use image::GrayImage;

use super::MaskHeader;

/// Luma at or above this value counts as clickable
const CLICKABLE_LUMA: u8 = 128;

/// Binary classification of an image, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    rows: u32,
    cols: u32,
    cells: Vec<Symbol>,
}

impl PixelGrid {
    /// Build from explicit rows; all rows must share one width
    pub fn from_rows(rows: Vec<Vec<Symbol>>) -> Result<Self, MaskError> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|row| row.len() != cols) {
            return Err(MaskError::Format(format!(
                "row {bad} has {} pixels, expected {cols}",
                rows[bad].len()
            )));
        }

        Ok(Self {
            rows: rows.len() as u32,
            cols: cols as u32,
            cells: rows.into_iter().flatten().collect(),
        })
    }

    pub fn from_fn(rows: u32, cols: u32, mut f: impl FnMut(u32, u32) -> Symbol) -> Self {
        let mut cells = Vec::with_capacity(rows as usize * cols as usize);
        for y in 0..rows {
            for x in 0..cols {
                cells.push(f(x, y));
            }
        }
        Self { rows, cols, cells }
    }

    /// Classify a grayscale raster mask
    pub fn from_luma(image: &GrayImage) -> Self {
        Self::from_fn(image.height(), image.width(), |x, y| {
            if image.get_pixel(x, y).0[0] >= CLICKABLE_LUMA {
                Symbol::White
            } else {
                Symbol::Black
            }
        })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Symbol> {
        if x >= self.cols || y >= self.rows {
            return None;
        }
        self.cells.get(y as usize * self.cols as usize + x as usize).copied()
    }

    pub fn row(&self, y: u32) -> &[Symbol] {
        let start = y as usize * self.cols as usize;
        &self.cells[start..start + self.cols as usize]
    }
}

/// Collapse one row into `<count><symbol>` runs.
///
/// Runs come from non-empty groups, so a zero count is never emitted.
pub fn encode_row(row: &[Symbol]) -> String {
    row.chunk_by(|a, b| a == b)
        .map(|run| format!("{}{}", run.len(), run[0]))
        .collect()
}

/// A complete encoded mask held in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMask {
    header: MaskHeader,
    body: Vec<u8>,
}

impl EncodedMask {
    pub fn header(&self) -> &MaskHeader {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encoded bytes of row `y`, padding included
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.header.rows {
            return None;
        }
        let start = y as usize * self.header.row_width;
        self.body.get(start..start + self.header.row_width)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header.to_line().into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn write_to(&self, path: &Path) -> Result<(), MaskError> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

/// Encode a grid into a fixed-row mask
pub fn encode(grid: &PixelGrid) -> EncodedMask {
    let encoded: Vec<String> = (0..grid.rows()).map(|y| encode_row(grid.row(y))).collect();
    let row_width = encoded.iter().map(String::len).max().unwrap_or(0);

    let mut body = Vec::with_capacity(row_width * encoded.len());
    for row in &encoded {
        body.extend_from_slice(row.as_bytes());
        body.resize(body.len() + row_width - row.len(), b'0');
    }

    EncodedMask {
        header: MaskHeader::new(grid.rows(), grid.cols(), row_width),
        body,
    }
}

/// Load a raster solution mask and encode it
pub fn encode_image(path: &Path) -> Result<EncodedMask, MaskError> {
    let image = image::open(path).map_err(|e| match e {
        image::ImageError::IoError(io) => MaskError::Io(io),
        other => MaskError::Format(format!("{}: {other}", path.display())),
    })?;
    Ok(encode(&PixelGrid::from_luma(&image.to_luma8())))
}

/// Convert a raster solution mask on disk into an RLE mask file
pub fn convert_image_to_mask(input: &Path, output: &Path) -> Result<MaskHeader, MaskError> {
    let mask = encode_image(input)?;
    mask.write_to(output)?;

    tracing::debug!(
        input = %input.display(),
        output = %output.display(),
        rows = mask.header.rows,
        cols = mask.header.cols,
        row_width = mask.header.row_width,
        "Converted raster mask to RLE"
    );

    Ok(mask.header)
}
