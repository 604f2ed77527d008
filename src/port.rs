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

use thiserror::Error;

// Single-byte commands accepted from the machine side of the link:
pub const COM_EJECT:  u8 = 0x00;
pub const COM_STOP:   u8 = 0x01;
pub const COM_PLAY:   u8 = 0x02;
pub const COM_FF:     u8 = 0x03;
pub const COM_REW:    u8 = 0x04;
pub const COM_AFF:    u8 = 0x05;
pub const COM_AREW:   u8 = 0x06;
pub const COM_REC:    u8 = 0x0A;
pub const COM_STATUS: u8 = 0x80;
pub const COM_SENSOR: u8 = 0x81;

// First byte of every two-byte response sent back over the link; the
// second byte is the payload.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Response {
    SensorChange     = 0,
    StatusChange     = 1,
    Request          = 2,
    SampleRateChange = 3,
}

// The sampling clock classes the device side can run the line at.  The
// alternate 44.1kHz class exists for bridge boards whose crystal needs a
// different divider setup for the same nominal rate.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum SampleRateClass {
    R48000    = 0,
    R44100    = 1,
    R44100Alt = 2,
    R32000    = 3,
}

impl SampleRateClass {
    pub fn host_rate(self) -> u32 {
        match self {
            SampleRateClass::R48000    => 48_000,
            SampleRateClass::R44100    => 44_100,
            SampleRateClass::R44100Alt => 44_100,
            SampleRateClass::R32000    => 32_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("the pending transfer was cancelled")]
    Cancelled,

    #[error("the device is disconnected")]
    Disconnected,

    #[error("device transfer failed: {0}")]
    Transfer(String),
}

// The device side of the recorder: whatever shuffles sample chunks and
// command bytes between this machine and the bridge hardware.
//
// Blocking calls must return `PortError::Cancelled` once cancel() is
// invoked, otherwise the recorder cannot stop a mode that's waiting on
// the device.
pub trait CassettePort: Send + Sync {
    /// Block until the device delivers a command byte.
    fn receive_command(&self) -> Result<u8, PortError>;

    /// Send a two-byte `{kind, value}` response to the device.
    fn send_response(&self, kind: Response, value: u8) -> Result<(), PortError>;

    /// Ship one chunk of playback samples to the device.
    fn send_chunk(&self, chunk: &[u8]) -> Result<(), PortError>;

    /// Block until the device delivers a chunk of recorded samples;
    /// returns the number of bytes placed into the buffer.
    fn receive_chunk(&self, buffer: &mut [u8]) -> Result<usize, PortError>;

    /// Abort any blocked transfer, making it fail with `Cancelled`.
    fn cancel(&self);
}
