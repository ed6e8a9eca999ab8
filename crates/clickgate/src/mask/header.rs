//! Mask header line: `<magic> <direction> <rows>x<cols> <row_width> <header_len>\n`.

use clickgate_common::constants::MASK_MAGIC;
use clickgate_common::{MaskError, ScanDirection};

/// Parsed mask header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskHeader {
    pub direction: ScanDirection,
    /// Image height
    pub rows: u32,
    /// Image width
    pub cols: u32,
    /// Byte width of every encoded row
    pub row_width: usize,
    /// Byte length of the header line, newline included
    pub header_len: usize,
}

impl MaskHeader {
    /// Build a row-major header, sizing the trailing length field
    pub fn new(rows: u32, cols: u32, row_width: usize) -> Self {
        let prefix = Self::prefix(ScanDirection::Row, rows, cols, row_width);
        Self {
            direction: ScanDirection::Row,
            rows,
            cols,
            row_width,
            header_len: self_inclusive_len(prefix.len()),
        }
    }

    fn prefix(direction: ScanDirection, rows: u32, cols: u32, row_width: usize) -> String {
        format!(
            "{} {} {}x{} {}",
            MASK_MAGIC,
            direction.as_char(),
            rows,
            cols,
            row_width
        )
    }

    pub fn width(&self) -> u32 {
        self.cols
    }

    pub fn height(&self) -> u32 {
        self.rows
    }

    /// Absolute byte offset of row `y`
    pub fn row_offset(&self, y: u32) -> u64 {
        self.header_len as u64 + self.row_width as u64 * y as u64
    }

    /// Expected body length in bytes
    pub fn body_len(&self) -> u64 {
        self.row_width as u64 * self.rows as u64
    }

    /// Serialize the header line, trailing newline included
    pub fn to_line(&self) -> String {
        format!(
            "{} {}\n",
            Self::prefix(self.direction, self.rows, self.cols, self.row_width),
            self.header_len
        )
    }

    /// Parse a header line (with its trailing newline)
    pub fn parse(line: &[u8]) -> Result<Self, MaskError> {
        let text = line
            .strip_suffix(b"\n")
            .ok_or_else(|| MaskError::Format("header line is not newline-terminated".into()))?;
        let text = std::str::from_utf8(text)
            .map_err(|_| MaskError::Format("header is not ASCII".into()))?;

        let fields: Vec<&str> = text.split(' ').collect();
        let [magic, direction, size, row_width, header_len] = fields.as_slice() else {
            return Err(MaskError::Format(format!(
                "expected 5 header fields, found {}",
                fields.len()
            )));
        };

        if *magic != MASK_MAGIC {
            return Err(MaskError::Format(format!("bad magic {magic:?}")));
        }
        let direction = ScanDirection::from_token(direction)
            .ok_or_else(|| MaskError::Format(format!("unknown scan direction {direction:?}")))?;
        let (rows, cols) = size
            .split_once('x')
            .ok_or_else(|| MaskError::Format(format!("bad image size {size:?}")))?;

        let header = Self {
            direction,
            rows: parse_field(rows, "rows")?,
            cols: parse_field(cols, "cols")?,
            row_width: parse_field(row_width, "row width")?,
            header_len: parse_field(header_len, "header length")?,
        };

        let max_width = max_row_width(header.cols);
        if header.row_width > max_width {
            return Err(MaskError::Format(format!(
                "row width {} exceeds the {max_width} bytes a {}-pixel row can need",
                header.row_width, header.cols
            )));
        }
        if header.cols > 0 && header.row_width < 2 {
            return Err(MaskError::Format(format!(
                "row width {} cannot hold a run of a {}-pixel row",
                header.row_width, header.cols
            )));
        }

        if header.header_len != line.len() {
            return Err(MaskError::Format(format!(
                "declared header length {} but line is {} bytes",
                header.header_len,
                line.len()
            )));
        }

        Ok(header)
    }
}

fn parse_field<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, MaskError> {
    raw.parse()
        .map_err(|_| MaskError::Format(format!("{name} is not numeric: {raw:?}")))
}

/// Widest encoding of a `cols`-pixel row: one single-pixel run per column,
/// each `<digits><symbol>`
fn max_row_width(cols: u32) -> usize {
    let cols = cols as usize;
    (cols * (digits(cols) + 1)).max(2)
}

/// Length of `prefix + " " + <len> + "\n"` where `<len>` is that same length.
///
/// The field's width depends on its own value, so grow it until the
/// digit count stops changing.
fn self_inclusive_len(prefix_len: usize) -> usize {
    let mut len = prefix_len + 3;
    loop {
        let next = prefix_len + 2 + digits(len);
        if next == len {
            return len;
        }
        len = next;
    }
}

fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}
