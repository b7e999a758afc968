//! Splits a concatenated still-image byte stream (as produced by an
//! `image2pipe` muxer) back into individual frames.
//!
//! The reader is synchronous and works on any [`Read`]. Decoder output is
//! usually bridged in with `tokio_util::io::SyncIoBridge` and driven from a
//! blocking task.

use std::{
    fmt,
    io::{self, BufReader, ErrorKind, Read},
    str::FromStr,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const PNG_IEND: [u8; 4] = *b"IEND";
const RIFF_TAG: [u8; 4] = *b"RIFF";

const JPEG_MARKER: u8 = 0xFF;
const JPEG_SOI: u8 = 0xD8;
const JPEG_EOI: u8 = 0xD9;
const JPEG_SOS: u8 = 0xDA;
const JPEG_TEM: u8 = 0x01;

/// Still-image container used for frames between the tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
    Webp,
}

impl ImageFormat {
    /// File extension used for staged frame files.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }

    /// ffmpeg encoder that writes this container into a pipe.
    pub fn pipe_encoder(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "mjpeg",
            ImageFormat::Webp => "libwebp",
        }
    }

    /// ffmpeg decoder that reads this container from a pipe.
    pub fn pipe_decoder(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "mjpeg",
            ImageFormat::Webp => "webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            other => Err(anyhow::anyhow!("unsupported image format: {}", other)),
        }
    }
}

/// Buffered frame reader over a byte source.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    format: ImageFormat,
    truncated: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, format: ImageFormat) -> Self {
        Self {
            inner: BufReader::new(inner),
            format,
            truncated: false,
        }
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// True when the last non-empty frame ended before its terminator.
    pub fn last_truncated(&self) -> bool {
        self.truncated
    }

    /// Returns the next frame, or an empty buffer at end of stream.
    pub fn next_frame(&mut self) -> io::Result<Bytes> {
        let mut out = Vec::new();
        let complete = read_frame(&mut self.inner, self.format, &mut out)?;
        self.truncated = !complete && !out.is_empty();
        Ok(Bytes::from(out))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_frame() {
            Ok(frame) if frame.is_empty() => None,
            other => Some(other),
        }
    }
}

/// Reads one frame from an unbuffered source.
///
/// Noise before the first signature is discarded. If the source ends before
/// the frame terminator, whatever was accumulated is returned; an empty
/// result means end of stream.
pub fn next_frame<R: Read>(source: &mut R, format: ImageFormat) -> io::Result<Bytes> {
    let mut out = Vec::new();
    read_frame(source, format, &mut out)?;
    Ok(Bytes::from(out))
}

fn read_frame<R: Read>(src: &mut R, format: ImageFormat, out: &mut Vec<u8>) -> io::Result<bool> {
    match format {
        ImageFormat::Png => read_png(src, out),
        ImageFormat::Jpeg => read_jpeg(src, out),
        ImageFormat::Webp => read_riff(src, out),
    }
}

fn read_png<R: Read>(src: &mut R, out: &mut Vec<u8>) -> io::Result<bool> {
    if !scan_for(src, &PNG_SIGNATURE)? {
        return Ok(false);
    }
    out.extend_from_slice(&PNG_SIGNATURE);

    loop {
        // length (be32) + chunk type
        let mut header = [0u8; 8];
        let n = read_up_to(src, &mut header)?;
        out.extend_from_slice(&header[..n]);
        if n < header.len() {
            return Ok(false);
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if length > i32::MAX as u32 {
            return Ok(false);
        }
        // payload + crc
        if !copy_exact(src, out, u64::from(length) + 4)? {
            return Ok(false);
        }
        if header[4..] == PNG_IEND {
            return Ok(true);
        }
    }
}

fn read_jpeg<R: Read>(src: &mut R, out: &mut Vec<u8>) -> io::Result<bool> {
    let mut prev = 0u8;
    loop {
        let Some(b) = read_byte(src)? else {
            return Ok(false);
        };
        if prev == JPEG_MARKER && b == JPEG_SOI {
            break;
        }
        prev = b;
    }
    out.extend_from_slice(&[JPEG_MARKER, JPEG_SOI]);

    let mut pending = None;
    loop {
        let marker = match pending.take() {
            Some(marker) => marker,
            None => match read_marker(src, out)? {
                Some(marker) => marker,
                None => return Ok(false),
            },
        };

        match marker {
            JPEG_EOI => return Ok(true),
            0xD0..=0xD7 | JPEG_TEM => {}
            JPEG_SOS => {
                if !copy_segment(src, out)? {
                    return Ok(false);
                }
                match scan_entropy(src, out)? {
                    Some(next) => pending = Some(next),
                    None => return Ok(false),
                }
            }
            _ => {
                if !copy_segment(src, out)? {
                    return Ok(false);
                }
            }
        }
    }
}

/// Copies bytes up to and including the next marker code.
fn read_marker<R: Read>(src: &mut R, out: &mut Vec<u8>) -> io::Result<Option<u8>> {
    loop {
        match copy_byte(src, out)? {
            None => return Ok(None),
            Some(JPEG_MARKER) => break,
            Some(_) => {}
        }
    }
    // fill bytes
    loop {
        match copy_byte(src, out)? {
            None => return Ok(None),
            Some(JPEG_MARKER) => {}
            Some(marker) => return Ok(Some(marker)),
        }
    }
}

/// Copies a big-endian length-prefixed segment.
fn copy_segment<R: Read>(src: &mut R, out: &mut Vec<u8>) -> io::Result<bool> {
    let mut len = [0u8; 2];
    let n = read_up_to(src, &mut len)?;
    out.extend_from_slice(&len[..n]);
    if n < len.len() {
        return Ok(false);
    }
    let len = u16::from_be_bytes(len);
    if len < 2 {
        return Ok(false);
    }
    copy_exact(src, out, u64::from(len) - 2)
}

/// Copies entropy-coded data and returns the marker that ends it.
fn scan_entropy<R: Read>(src: &mut R, out: &mut Vec<u8>) -> io::Result<Option<u8>> {
    loop {
        match copy_byte(src, out)? {
            None => return Ok(None),
            Some(JPEG_MARKER) => {}
            Some(_) => continue,
        }
        let mut next = copy_byte(src, out)?;
        while next == Some(JPEG_MARKER) {
            next = copy_byte(src, out)?;
        }
        match next {
            None => return Ok(None),
            Some(0x00) | Some(0xD0..=0xD7) => {}
            Some(marker) => return Ok(Some(marker)),
        }
    }
}

fn read_riff<R: Read>(src: &mut R, out: &mut Vec<u8>) -> io::Result<bool> {
    if !scan_for(src, &RIFF_TAG)? {
        return Ok(false);
    }
    out.extend_from_slice(&RIFF_TAG);

    let mut size = [0u8; 4];
    let n = read_up_to(src, &mut size)?;
    out.extend_from_slice(&size[..n]);
    if n < size.len() {
        return Ok(false);
    }
    copy_exact(src, out, u64::from(u32::from_le_bytes(size)))
}

/// Consumes bytes until `signature` has been read.
///
/// A byte equal to the first signature byte restarts the match at 1.
fn scan_for<R: Read>(src: &mut R, signature: &[u8]) -> io::Result<bool> {
    let mut matched = 0;
    while matched < signature.len() {
        let Some(b) = read_byte(src)? else {
            return Ok(false);
        };
        if b == signature[matched] {
            matched += 1;
        } else if b == signature[0] {
            matched = 1;
        } else {
            matched = 0;
        }
    }
    Ok(true)
}

fn read_byte<R: Read>(src: &mut R) -> io::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match src.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn copy_byte<R: Read>(src: &mut R, out: &mut Vec<u8>) -> io::Result<Option<u8>> {
    let b = read_byte(src)?;
    if let Some(b) = b {
        out.push(b);
    }
    Ok(b)
}

fn read_up_to<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn copy_exact<R: Read>(src: &mut R, out: &mut Vec<u8>, len: u64) -> io::Result<bool> {
    let copied = src.by_ref().take(len).read_to_end(out)?;
    Ok(copied as u64 == len)
}

#[cfg(test)]
#[path = "framer_test.rs"]
mod framer_test;
