//! Random-access mask reading and pixel checks.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use clickgate_common::constants::MAX_HEADER_LEN;
use clickgate_common::{MaskError, ScanDirection, Symbol};

use super::{MaskHeader, PixelGrid};

/// One `<count><symbol>` run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub count: u32,
    pub symbol: Symbol,
}

/// Iterate the runs of one encoded row.
///
/// Padding is a trailing group of `0` bytes with no symbol after it; it ends
/// the iteration without contributing to the pixel offset. A run with a zero
/// count, or a digit group that is neither a run nor pure zeros, is a
/// format error.
pub fn parse_row(row: &[u8]) -> impl Iterator<Item = Result<Run, MaskError>> + '_ {
    Runs { row, pos: 0 }
}

struct Runs<'a> {
    row: &'a [u8],
    pos: usize,
}

impl Runs<'_> {
    fn fail(&mut self, message: String) -> Option<Result<Run, MaskError>> {
        self.pos = self.row.len();
        Some(Err(MaskError::Format(message)))
    }
}

impl Iterator for Runs<'_> {
    type Item = Result<Run, MaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.row;
        if self.pos >= row.len() {
            return None;
        }

        let start = self.pos;
        while self.pos < row.len() && row[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &row[start..self.pos];

        if digits.is_empty() {
            return self.fail(format!("unexpected byte {:?} at column {start}", row[start] as char));
        }

        let Some(&next) = row.get(self.pos) else {
            if digits.iter().all(|&b| b == b'0') {
                return None;
            }
            return self.fail(format!("run at column {start} has no symbol"));
        };

        let Some(symbol) = Symbol::from_byte(next) else {
            let column = self.pos;
            return self.fail(format!("unexpected byte {:?} at column {column}", next as char));
        };
        self.pos += 1;

        // digits are ASCII, so this only fails on overflow
        let count: u32 = match std::str::from_utf8(digits).ok().and_then(|s| s.parse().ok()) {
            Some(count) => count,
            None => return self.fail(format!("run length too large at column {start}")),
        };
        if count == 0 {
            return self.fail(format!("zero-length run at column {start}"));
        }

        Some(Ok(Run { count, symbol }))
    }
}

/// Symbol covering column `x` of an encoded row, or `None` if the runs end
/// before reaching it
pub fn pixel_at(row: &[u8], x: u32) -> Result<Option<Symbol>, MaskError> {
    let x = x as u64;
    let mut offset = 0u64;

    for run in parse_row(row) {
        let run = run?;
        if offset <= x && x < offset + run.count as u64 {
            return Ok(Some(run.symbol));
        }
        offset += run.count as u64;
    }

    Ok(None)
}

/// Read exactly one encoded row, touching no other row.
///
/// A row extending past the end of `storage` is an `UnexpectedEof` I/O
/// error, reported before any buffer is sized from the header.
pub fn read_row<R: Read + Seek>(
    storage: &mut R,
    row_index: u32,
    row_width: usize,
    header_len: usize,
) -> Result<Vec<u8>, MaskError> {
    let offset = header_len as u64 + row_width as u64 * row_index as u64;
    let len = storage.seek(SeekFrom::End(0))?;
    if offset.saturating_add(row_width as u64) > len {
        return Err(MaskError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("row {row_index} ends past the {len}-byte mask"),
        )));
    }
    storage.seek(SeekFrom::Start(offset))?;

    let mut row = vec![0u8; row_width];
    storage.read_exact(&mut row)?;
    Ok(row)
}

/// Check whether pixel `(x, y)` carries `expected`.
///
/// A pixel inside the declared bounds but past the last run of its row is
/// treated as [`Symbol::BACKGROUND`], so an inconsistent row can never make
/// a click succeed.
pub fn check_pixel<R: Read + Seek>(
    storage: &mut R,
    header: &MaskHeader,
    x: i64,
    y: i64,
    expected: Symbol,
) -> Result<bool, MaskError> {
    if x < 0 || y < 0 || x >= header.width() as i64 || y >= header.height() as i64 {
        return Err(MaskError::OutOfRange {
            x,
            y,
            width: header.width(),
            height: header.height(),
        });
    }

    let row = read_row(storage, y as u32, header.row_width, header.header_len)?;
    let actual = pixel_at(&row, x as u32)?.unwrap_or(Symbol::BACKGROUND);
    Ok(actual == expected)
}

/// Decode a whole mask back into a pixel grid
pub fn decode(bytes: &[u8]) -> Result<PixelGrid, MaskError> {
    let line_end = bytes
        .iter()
        .take(MAX_HEADER_LEN)
        .position(|&b| b == b'\n')
        .ok_or_else(|| MaskError::Format("header line missing or too long".into()))?;
    let header = MaskHeader::parse(&bytes[..=line_end])?;
    require_row_major(&header)?;

    let body = &bytes[header.header_len..];
    if body.len() as u64 != header.body_len() {
        return Err(MaskError::Format(format!(
            "body is {} bytes, expected {}",
            body.len(),
            header.body_len()
        )));
    }

    if header.cols == 0 {
        return Ok(PixelGrid::from_fn(header.rows, 0, |_, _| Symbol::BACKGROUND));
    }
    if header.row_width == 0 {
        return Err(MaskError::Format(format!(
            "empty rows cannot cover {} pixels",
            header.cols
        )));
    }

    let mut rows = Vec::with_capacity(header.rows as usize);
    for (y, encoded) in body.chunks(header.row_width).enumerate() {
        let mut row = Vec::with_capacity(header.cols as usize);
        for run in parse_row(encoded) {
            let run = run?;
            row.extend(std::iter::repeat_n(run.symbol, run.count as usize));
        }
        if row.len() != header.cols as usize {
            return Err(MaskError::Format(format!(
                "row {y} covers {} pixels, expected {}",
                row.len(),
                header.cols
            )));
        }
        rows.push(row);
    }

    PixelGrid::from_rows(rows)
}

fn require_row_major(header: &MaskHeader) -> Result<(), MaskError> {
    match header.direction {
        ScanDirection::Row => Ok(()),
        ScanDirection::Column => Err(MaskError::Format(
            "column-major masks are not supported".into(),
        )),
    }
}

/// An open mask with its parsed header
pub struct MaskReader<R> {
    inner: R,
    header: MaskHeader,
}

impl MaskReader<BufReader<File>> {
    /// Open a mask file and parse its header
    pub fn open(path: &Path) -> Result<Self, MaskError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Open a mask and check one pixel
    pub fn open_and_check(path: &Path, x: i64, y: i64, expected: Symbol) -> Result<bool, MaskError> {
        Self::open(path)?.check_pixel(x, y, expected)
    }
}

impl<R: BufRead + Seek> MaskReader<R> {
    pub fn from_reader(mut inner: R) -> Result<Self, MaskError> {
        let mut line = Vec::with_capacity(64);
        (&mut inner)
            .take(MAX_HEADER_LEN as u64)
            .read_until(b'\n', &mut line)?;
        if line.last() != Some(&b'\n') {
            return Err(MaskError::Format("header line missing or too long".into()));
        }

        let header = MaskHeader::parse(&line)?;
        require_row_major(&header)?;
        Ok(Self { inner, header })
    }

    pub fn header(&self) -> &MaskHeader {
        &self.header
    }

    pub fn read_row(&mut self, y: u32) -> Result<Vec<u8>, MaskError> {
        read_row(&mut self.inner, y, self.header.row_width, self.header.header_len)
    }

    pub fn check_pixel(&mut self, x: i64, y: i64, expected: Symbol) -> Result<bool, MaskError> {
        check_pixel(&mut self.inner, &self.header, x, y, expected)
    }
}
