//! Fixed-row run-length encoded solution masks.
//!
//! A mask file is one ASCII header line followed by `rows` records of
//! exactly `row_width` bytes each:
//!
//! ```text
//! 3DC R 2x4 4 15\n
//! 2B2W
//! 4W00
//! ```
//!
//! Each record is a sequence of `<count><B|W>` runs, right-padded with bare
//! `0` bytes. Because every record has the same width, row `y` starts at
//! `header_len + row_width * y` and a click can be checked by reading a
//! single row from disk.

mod encode;
mod header;
mod reader;

pub use encode::{EncodedMask, PixelGrid, convert_image_to_mask, encode, encode_image, encode_row};
pub use header::MaskHeader;
pub use reader::{MaskReader, Run, check_pixel, decode, parse_row, pixel_at, read_row};
