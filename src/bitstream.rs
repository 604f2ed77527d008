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

use std::fs;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};

// A byte-granular backing store for a bitstream.
//
// The cursor on top of it only ever touches a single byte at a time, which
// allows file-backed stores to get away without buffering whole images.
pub trait ByteStore {
    fn read_byte(&mut self, index: usize) -> io::Result<u8>;
    fn write_byte(&mut self, index: usize, value: u8) -> io::Result<()>;
    fn byte_count(&self) -> usize;
}

// An in-memory store, used for scratch chunks arriving from the host link.
pub struct MemStore {
    data: Vec<u8>,
}

impl MemStore {
    pub fn new(data: Vec<u8>) -> MemStore {
        MemStore { data }
    }
}

impl ByteStore for MemStore {
    fn read_byte(&mut self, index: usize) -> io::Result<u8> {
        Ok(self.data[index])
    }
    fn write_byte(&mut self, index: usize, value: u8) -> io::Result<()> {
        self.data[index] = value;
        Ok(())
    }
    fn byte_count(&self) -> usize {
        self.data.len()
    }
}

// A file-backed store; the base offset hides the image header from bit
// addressing.  Every access is a positioned single-byte transfer, so tape
// images may be arbitrarily large.
pub struct FileStore {
    file:    fs::File,
    base:    u64,
    length:  usize,
}

impl FileStore {
    pub fn new(file: fs::File, base: u64, length: usize) -> FileStore {
        FileStore { file, base, length }
    }
    pub fn file_mut(&mut self) -> &mut fs::File {
        &mut self.file
    }
}

impl ByteStore for FileStore {
    fn read_byte(&mut self, index: usize) -> io::Result<u8> {
        let mut byte = [0; 1];

        self.file.seek(SeekFrom::Start(self.base + (index as u64)))?;
        self.file.read_exact(&mut byte)?;
        Ok(byte[0])
    }
    fn write_byte(&mut self, index: usize, value: u8) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.base + (index as u64)))?;
        self.file.write_all(&[value])?;
        Ok(())
    }
    fn byte_count(&self) -> usize {
        self.length
    }
}

// Outcome of a single-bit cursor movement.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Step {
    Moved,
    Boundary,
}

// A bit-addressable read/write cursor over a byte store.
//
// The byte under the cursor is cached; writes are staged into the cache and
// only reach the store once the cursor crosses a byte boundary or flush()
// is called.  Bit offset 0 is the most significant bit of a byte.
pub struct BitCursor<S: ByteStore> {
    store:         S,
    byte_offset:   usize,
    bit_offset:    u8,
    current_byte:  u8,
    dirty:         bool,
}

impl<S: ByteStore> BitCursor<S> {
    pub fn new(store: S) -> io::Result<BitCursor<S>> {
        let mut cursor = BitCursor {
            store,
            byte_offset:   0,
            bit_offset:    0,
            current_byte:  0,
            dirty:         false,
        };
        cursor.load_current_byte()?;

        Ok(cursor)
    }
    pub fn bit_len(&self) -> usize {
        self.store.byte_count() * 8
    }
    pub fn pos(&self) -> usize {
        (self.byte_offset * 8) + (self.bit_offset as usize)
    }
    // Reposition the cursor, clamping the target into the valid range.
    //
    // Staged bits are flushed out first, they'd otherwise be lost with the
    // cache reload.
    pub fn seek(&mut self, bit_pos: usize) -> io::Result<()> {
        self.flush()?;

        let clamped = if self.bit_len() == 0 {
            0
        } else {
            bit_pos.min(self.bit_len() - 1)
        };
        self.byte_offset = clamped / 8;
        self.bit_offset  = (clamped % 8) as u8;

        self.load_current_byte()
    }
    pub fn read(&self) -> u8 {
        if (self.current_byte & self.mask()) != 0 { 1 } else { 0 }
    }
    pub fn read_inverted(&self) -> u8 {
        self.read() ^ 1
    }
    pub fn write(&mut self, bit: u8) {
        if bit != 0 {
            self.current_byte |= self.mask();
        } else {
            self.current_byte &= !self.mask();
        }
        self.dirty = true;
    }
    pub fn flush(&mut self) -> io::Result<()> {
        if self.dirty && self.byte_offset < self.store.byte_count() {
            self.store.write_byte(self.byte_offset, self.current_byte)?;
        }
        self.dirty = false;

        Ok(())
    }
    pub fn step_forward(&mut self) -> io::Result<Step> {
        if self.bit_len() == 0 {
            return Ok(Step::Boundary);
        }
        if self.bit_offset < 7 {
            self.bit_offset += 1;
            return Ok(Step::Moved);
        }
        self.flush()?;
        if (self.byte_offset + 1) >= self.store.byte_count() {
            return Ok(Step::Boundary);
        }
        self.byte_offset += 1;
        self.bit_offset   = 0;
        self.load_current_byte()?;

        Ok(Step::Moved)
    }
    pub fn step_backward(&mut self) -> io::Result<Step> {
        if self.bit_len() == 0 {
            return Ok(Step::Boundary);
        }
        if self.bit_offset > 0 {
            self.bit_offset -= 1;
            return Ok(Step::Moved);
        }
        self.flush()?;
        if self.byte_offset == 0 {
            return Ok(Step::Boundary);
        }
        self.byte_offset -= 1;
        self.bit_offset   = 7;
        self.load_current_byte()?;

        Ok(Step::Moved)
    }
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
    fn mask(&self) -> u8 {
        0x80 >> self.bit_offset
    }
    fn load_current_byte(&mut self) -> io::Result<()> {
        self.dirty = false;
        self.current_byte = if self.byte_offset < self.store.byte_count() {
            self.store.read_byte(self.byte_offset)?
        } else {
            0
        };

        Ok(())
    }
}
