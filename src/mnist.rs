use braille_rs::BrailleChar;
use nalgebra::DVector;
use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};
use tracing::debug;

use crate::error::{Error, Result};

pub const IMAGE_MAGIC: u32 = 2051;
pub const LABEL_MAGIC: u32 = 2049;

/// Images and labels from an idx file pair, index aligned.
///
/// Images are stored as raw bytes, row-major, already downsampled to
/// `rows x cols`. Labels are exactly as they appear on disk.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Dataset {
    images: Vec<Vec<u8>>,
    labels: Vec<u8>,
    rows: usize,
    cols: usize,
}

impl Dataset {
    /// Read an image file and a label file, averaging every
    /// `factor x factor` block of pixels into one.
    pub fn load(
        image_path: impl AsRef<Path>,
        label_path: impl AsRef<Path>,
        factor: usize,
    ) -> Result<Self> {
        let image_path = image_path.as_ref();
        let label_path = label_path.as_ref();

        let images = File::open(image_path).map_err(Error::io(image_path))?;
        let labels = File::open(label_path).map_err(Error::io(label_path))?;

        let data = Self::from_readers(BufReader::new(images), BufReader::new(labels), factor)?;
        debug!(
            path = %image_path.display(),
            images = data.len(),
            rows = data.rows,
            cols = data.cols,
            factor,
            "read dataset"
        );
        Ok(data)
    }

    pub fn from_readers(mut images: impl Read, mut labels: impl Read, factor: usize) -> Result<Self> {
        if factor == 0 {
            return Err(Error::InvalidConfig("sample factor must be at least 1".into()));
        }

        read_header(&mut images, IMAGE_MAGIC, "image file")?;
        read_header(&mut labels, LABEL_MAGIC, "label file")?;

        let n_images = read_u32(&mut images)? as usize;
        let n_labels = read_u32(&mut labels)? as usize;
        if n_images != n_labels {
            return Err(Error::SizeMismatch {
                images: n_images,
                labels: n_labels,
            });
        }

        let raw_rows = read_u32(&mut images)? as usize;
        let raw_cols = read_u32(&mut images)? as usize;
        let raw_size = raw_rows
            .checked_mul(raw_cols)
            .ok_or_else(|| Error::Header {
                what: "image file",
                reason: format!("{raw_rows}x{raw_cols} images do not fit in memory"),
            })?;

        // header counts are untrusted, buffers grow only as bytes arrive
        let mut label_bytes = Vec::new();
        read_block(&mut labels, n_labels, &mut label_bytes)?;

        let mut raw = Vec::new();
        let mut data = Vec::new();
        for _ in 0..n_images {
            read_block(&mut images, raw_size, &mut raw)?;
            data.push(downsample(&raw, raw_rows, raw_cols, factor));
        }

        Ok(Self {
            images: data,
            labels: label_bytes,
            rows: raw_rows / factor,
            cols: raw_cols / factor,
        })
    }

    /// Build a dataset from already decoded images.
    pub fn from_parts(images: Vec<Vec<u8>>, labels: Vec<u8>, rows: usize, cols: usize) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(Error::SizeMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }
        if let Some(bad) = images.iter().find(|image| image.len() != rows * cols) {
            return Err(Error::InvalidConfig(format!(
                "image of {} bytes in a {rows}x{cols} dataset",
                bad.len()
            )));
        }

        Ok(Self {
            images,
            labels,
            rows,
            cols,
        })
    }

    pub fn images(&self) -> &[Vec<u8>] {
        &self.images
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Length of every image vector.
    pub fn input_size(&self) -> usize {
        self.rows * self.cols
    }

    /// Smallest and largest label, `None` when empty.
    pub fn label_range(&self) -> Option<(u8, u8)> {
        let min = *self.labels.iter().min()?;
        let max = *self.labels.iter().max()?;
        Some((min, max))
    }

    pub fn render(&self, index: usize, threshold: f64) -> String {
        render(&self.images[index], self.cols, threshold)
    }
}

/// Scale raw intensities into `[0, 1)`.
pub fn normalize(raw: &[u8]) -> DVector<f64> {
    DVector::from_iterator(raw.len(), raw.iter().map(|&byte| byte as f64 / 256.))
}

/// Average non-overlapping `factor x factor` blocks. Rows and columns that
/// do not fill a whole block are dropped.
pub fn downsample(raw: &[u8], raw_rows: usize, raw_cols: usize, factor: usize) -> Vec<u8> {
    if factor == 1 {
        return raw.to_vec();
    }

    let rows = raw_rows / factor;
    let cols = raw_cols / factor;
    let area = (factor as u64).saturating_mul(factor as u64);

    let mut out = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            let mut sum = 0u64;
            for ii in i * factor..(i + 1) * factor {
                let row = &raw[ii * raw_cols..ii * raw_cols + raw_cols];
                sum += row[j * factor..(j + 1) * factor]
                    .iter()
                    .map(|&byte| byte as u64)
                    .sum::<u64>();
            }
            out.push((sum / area) as u8);
        }
    }
    out
}

/// Read exactly `len` bytes into `buf`, failing with `UnexpectedEof` on a
/// short file.
fn read_block(handle: &mut impl Read, len: usize, buf: &mut Vec<u8>) -> Result<()> {
    buf.clear();
    handle.by_ref().take(len as u64).read_to_end(buf)?;
    if buf.len() != len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

fn read_u32(handle: &mut impl Read) -> Result<u32> {
    let mut bytes = [0u8; 4];
    handle.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_header(handle: &mut impl Read, magic: u32, what: &'static str) -> Result<()> {
    match read_u32(handle)? {
        found if found == magic => Ok(()),
        found => Err(Error::Format {
            what,
            expected: magic,
            found,
        }),
    }
}

/// Draw an image as braille, one character per 2x4 pixel cell. Pixels at or
/// above `threshold` (on the normalized scale) are raised dots.
pub fn render(data: &[u8], cols: usize, threshold: f64) -> String {
    if cols == 0 {
        return String::new();
    }

    let rows = data.len() / cols;
    let lit = |r: usize, c: usize| -> u8 {
        (r < rows && c < cols && data[r * cols + c] as f64 / 256. >= threshold) as u8
    };

    let mut canvas = String::new();
    for r in (0..rows).step_by(4) {
        for c in (0..cols).step_by(2) {
            let byte = lit(r, c)
                | (lit(r + 1, c) << 1)
                | (lit(r + 2, c) << 2)
                | (lit(r + 3, c) << 3)
                | (lit(r, c + 1) << 4)
                | (lit(r + 1, c + 1) << 5)
                | (lit(r + 2, c + 1) << 6)
                | (lit(r + 3, c + 1) << 7);

            canvas.push(BrailleChar::with_data(byte).into())
        }
        canvas.push('\n')
    }

    canvas
}

/// Serialize images and labels in idx format.
pub fn encode(images: &[Vec<u8>], labels: &[u8], rows: usize, cols: usize) -> (Vec<u8>, Vec<u8>) {
    let mut image_bytes = Vec::with_capacity(16 + images.len() * rows * cols);
    for field in [IMAGE_MAGIC, images.len() as u32, rows as u32, cols as u32] {
        image_bytes.extend_from_slice(&field.to_be_bytes());
    }
    images.iter().for_each(|image| image_bytes.extend_from_slice(image));

    let mut label_bytes = Vec::with_capacity(8 + labels.len());
    for field in [LABEL_MAGIC, labels.len() as u32] {
        label_bytes.extend_from_slice(&field.to_be_bytes());
    }
    label_bytes.extend_from_slice(labels);

    (image_bytes, label_bytes)
}
