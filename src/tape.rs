// Copyright (c) 2023 Marek Benc <benc.marek.elektro98@proton.me>
//
// Permission to use, copy, modify, and distribute this software for any
// purpose with or without fee is hereby granted, provided that the above
// copyright notice and this permission notice appear in all copies.
//
// THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR DISCLAIMS ALL WARRANTIES
// WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
// MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL THE AUTHOR BE LIABLE FOR
// ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
// WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
// ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
// OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
//

use log::{info, warn};
use thiserror::Error;

use std::fs;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path;

use crate::bitstream::{BitCursor, FileStore};


// Two tape image flavors exist in the wild.  The modern one, shared with
// the X millennium emulator family, starts with a 40-byte header whose
// magic tag spells "TAPE"; the legacy one is nothing but a sample rate
// followed by the raw bitstream.
//
// Modern header layout (all integers little-endian):
//
//   0x00  magic tag "TAPE"
//   0x04  tape name, NUL-terminated, 17 bytes
//   0x15  reserved, 5 bytes
//   0x1A  write-protect notch (0x00 = writable, 0x10 = protected)
//   0x1B  sampling format
//   0x1C  sample rate, in Hz
//   0x20  tape data size, in bits
//   0x24  tape position, in bits
//
pub const TAPE_MAGIC:        u32   = 0x4550_4154;
pub const MODERN_HEADER_LEN: usize = 40;
pub const LEGACY_HEADER_LEN: usize = 4;
pub const PROTECT_NOTCH:     u8    = 0x10;

const NAME_LEN:    usize = 17;
const RESERVE_LEN: usize = 5;

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to access the tape image: {0}")]
    Io(#[from] io::Error),

    #[error("the tape image is shorter than its header")]
    Truncated,

    #[error("the tape sample rate of {0}Hz is outside of the supported 8000..48000Hz range")]
    SampleRateOutOfRange(u32),
}

struct TapeHeader {
    name:         [u8; NAME_LEN],
    reserve:      [u8; RESERVE_LEN],
    protect:      u8,
    format:       u8,
    sample_rate:  u32,
    data_bits:    u32,
    position:     u32,
}

impl TapeHeader {
    fn decode(raw: &[u8; MODERN_HEADER_LEN], file_len: usize) -> TapeHeader {
        let mut name    = [0; NAME_LEN];
        let mut reserve = [0; RESERVE_LEN];
        name.copy_from_slice(&raw[0x04..0x15]);
        reserve.copy_from_slice(&raw[0x15..0x1A]);

        TapeHeader {
            name,
            reserve,
            protect:      raw[0x1A],
            format:       raw[0x1B],
            sample_rate:  u32_le(&raw[0x1C..0x20]),

            // The size field on disk is not to be trusted, the file is.
            data_bits:    ((file_len - MODERN_HEADER_LEN) * 8) as u32,
            position:     u32_le(&raw[0x24..0x28]),
        }
    }
    fn encode(&self) -> [u8; MODERN_HEADER_LEN] {
        let mut raw = [0; MODERN_HEADER_LEN];

        raw[0x00..0x04].copy_from_slice(&TAPE_MAGIC.to_le_bytes());
        raw[0x04..0x15].copy_from_slice(&self.name);
        raw[0x15..0x1A].copy_from_slice(&self.reserve);
        raw[0x1A] = self.protect;
        raw[0x1B] = self.format;
        raw[0x1C..0x20].copy_from_slice(&self.sample_rate.to_le_bytes());
        raw[0x20..0x24].copy_from_slice(&self.data_bits.to_le_bytes());
        raw[0x24..0x28].copy_from_slice(&self.position.to_le_bytes());

        raw
    }
}

fn u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// A parsed, opened tape image.
//
// The bit cursor addresses the data region only; the header is kept aside
// and, for writable modern images, written back with the current position
// when the image is closed.
pub struct TapeImage {
    cursor:    BitCursor<FileStore>,
    header:    TapeHeader,
    legacy:    bool,
    readonly:  bool,
    path:      path::PathBuf,
    closed:    bool,
}

impl TapeImage {
    pub fn open<P: AsRef<path::Path>>(path: P) -> Result<TapeImage, OpenError> {
        let path = path.as_ref();

        let metadata = fs::metadata(path)?;
        let readonly = metadata.permissions().readonly();
        let file_len = metadata.len() as usize;

        let mut file = fs::OpenOptions::new()
                           .read(true)
                           .write(!readonly)
                           .open(path)?;

        if file_len < LEGACY_HEADER_LEN {
            return Err(OpenError::Truncated);
        }
        let mut raw = [0; MODERN_HEADER_LEN];
        let raw_len = file_len.min(MODERN_HEADER_LEN);
        file.read_exact(&mut raw[..raw_len])?;

        let tag = u32_le(&raw[0..4]);
        let (header, legacy) = if tag == TAPE_MAGIC && file_len >= MODERN_HEADER_LEN {
            (TapeHeader::decode(&raw, file_len), false)
        } else {
            // Anything else is a legacy image, and the leading word is its
            // sample rate.
            let header = TapeHeader {
                name:         [0; NAME_LEN],
                reserve:      [0; RESERVE_LEN],
                protect:      if readonly { PROTECT_NOTCH } else { 0 },
                format:       0,
                sample_rate:  tag,
                data_bits:    ((file_len - LEGACY_HEADER_LEN) * 8) as u32,
                position:     0,
            };
            (header, true)
        };

        if header.sample_rate < MIN_SAMPLE_RATE || header.sample_rate > MAX_SAMPLE_RATE {
            return Err(OpenError::SampleRateOutOfRange(header.sample_rate));
        }

        let data_base = if legacy { LEGACY_HEADER_LEN } else { MODERN_HEADER_LEN };
        let store = FileStore::new(file, data_base as u64, file_len - data_base);
        let mut cursor = BitCursor::new(store)?;
        cursor.seek(header.position as usize)?;

        info!("Opened the tape image `{}': {} format, {}Hz, {} bits, position {}.",
              path.display(),
              if legacy { "legacy" } else { "modern" },
              header.sample_rate,
              header.data_bits,
              cursor.pos());

        Ok(TapeImage {
            cursor,
            header,
            legacy,
            readonly,
            path:    path.to_owned(),
            closed:  false,
        })
    }
    pub fn sample_rate(&self) -> u32 {
        self.header.sample_rate
    }
    pub fn total_bits(&self) -> u32 {
        self.header.data_bits
    }
    pub fn bit_pos(&self) -> u32 {
        self.cursor.pos() as u32
    }
    pub fn name(&self) -> String {
        let terminator = self.header.name
                             .iter()
                             .position(|&byte| byte == 0)
                             .unwrap_or(NAME_LEN);

        String::from_utf8_lossy(&self.header.name[..terminator]).into_owned()
    }
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }
    pub fn is_write_protected(&self) -> bool {
        (self.header.protect != 0) || self.readonly
    }
    pub fn cursor_mut(&mut self) -> &mut BitCursor<FileStore> {
        &mut self.cursor
    }
    // Flush pending bits out and, for writable modern images, persist the
    // current position back into the header.  Invoked by Drop as well, so
    // letting the image fall out of scope is a valid way to close it.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(error) = self.cursor.flush() {
            warn!("Failed to flush `{}' on close: {}.", self.path.display(), error);
        }
        if !self.legacy && !self.readonly {
            self.header.position = self.cursor.pos() as u32;
            let raw = self.header.encode();

            let file = self.cursor.store_mut().file_mut();
            let written = file.seek(SeekFrom::Start(0))
                              .and_then(|_| file.write_all(&raw));
            match written {
                Ok(())     => {
                    info!("Stored position {} back into `{}'.",
                          self.header.position, self.path.display());
                },
                Err(error) => {
                    warn!("Failed to update the header of `{}': {}.",
                          self.path.display(), error);
                },
            }
        }
    }
}

impl Drop for TapeImage {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::Step;

    use std::io::Write as _;

    fn temp_image(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    fn modern_image(rate: u32, position: u32, data: &[u8]) -> tempfile::NamedTempFile {
        let header = TapeHeader {
            name:         *b"TEST TAPE\0\0\0\0\0\0\0\0",
            reserve:      [0; RESERVE_LEN],
            protect:      0,
            format:       0x01,
            sample_rate:  rate,
            data_bits:    (data.len() * 8) as u32,
            position,
        };
        let mut contents = header.encode().to_vec();
        contents.extend_from_slice(data);

        temp_image(&contents)
    }

    fn legacy_image(rate: u32, data: &[u8]) -> tempfile::NamedTempFile {
        let mut contents = rate.to_le_bytes().to_vec();
        contents.extend_from_slice(data);

        temp_image(&contents)
    }

    #[test]
    fn modern_magic_selects_the_modern_format() {
        let file  = modern_image(48_000, 0, &[0xAA; 8]);
        let image = TapeImage::open(file.path()).unwrap();

        assert!(!image.is_legacy());
        assert_eq!(image.sample_rate(), 48_000);
        assert_eq!(image.total_bits(), 64);
        assert_eq!(image.name(), "TEST TAPE");
        assert!(!image.is_write_protected());
    }

    #[test]
    fn anything_else_falls_back_to_legacy() {
        let file  = legacy_image(32_000, &[0x55; 7996]);
        let image = TapeImage::open(file.path()).unwrap();

        assert!(image.is_legacy());
        assert_eq!(image.sample_rate(), 32_000);
        assert_eq!(image.total_bits(), 7996 * 8);
        assert_eq!(image.bit_pos(), 0);
    }

    #[test]
    fn out_of_range_sample_rates_are_rejected() {
        let file = legacy_image(96_000, &[0; 16]);
        match TapeImage::open(file.path()) {
            Err(OpenError::SampleRateOutOfRange(96_000)) => { },
            other => panic!("unexpected open outcome: {:?}", other.map(|_| ())),
        }

        let file = legacy_image(4_000, &[0; 16]);
        assert!(TapeImage::open(file.path()).is_err());
    }

    #[test]
    fn truncated_images_are_rejected() {
        let file = temp_image(&[0x40, 0x1F]);
        match TapeImage::open(file.path()) {
            Err(OpenError::Truncated) => { },
            other => panic!("unexpected open outcome: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn modern_start_position_is_honored_and_clamped() {
        let file  = modern_image(48_000, 24, &[0; 8]);
        let image = TapeImage::open(file.path()).unwrap();
        assert_eq!(image.bit_pos(), 24);

        let file  = modern_image(48_000, 100_000, &[0; 8]);
        let image = TapeImage::open(file.path()).unwrap();
        assert_eq!(image.bit_pos(), 63);
    }

    #[test]
    fn close_persists_the_position_of_writable_modern_images() {
        let file = modern_image(48_000, 0, &[0; 64]);

        {
            let mut image = TapeImage::open(file.path()).unwrap();
            image.cursor_mut().seek(123).unwrap();
            // Dropped here; Drop runs close().
        }

        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(u32_le(&contents[0x24..0x28]), 123);

        let image = TapeImage::open(file.path()).unwrap();
        assert_eq!(image.bit_pos(), 123);
    }

    #[test]
    fn legacy_images_are_never_header_rewritten() {
        let file = legacy_image(48_000, &[0x12, 0x34]);

        {
            let mut image = TapeImage::open(file.path()).unwrap();
            image.cursor_mut().seek(9).unwrap();
        }

        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(contents, vec![0x80, 0xBB, 0x00, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn cursor_edits_reach_the_data_region() {
        let file = legacy_image(48_000, &[0x00, 0x00]);

        {
            let mut image = TapeImage::open(file.path()).unwrap();
            let cursor = image.cursor_mut();
            cursor.write(1);
            assert_eq!(cursor.step_forward().unwrap(), Step::Moved);
        }

        let contents = std::fs::read(file.path()).unwrap();
        // The header stays untouched, the first data byte carries the bit.
        assert_eq!(&contents[..4], &48_000u32.to_le_bytes());
        assert_eq!(contents[4], 0x80);
    }
}
