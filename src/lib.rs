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

//! Tape mechanism emulation for the Sharp X1's CZ-8RL1 data recorder.
//!
//! This crate implements the deck itself: tape images with their two
//! header flavors, the frequency-modulated tape bit codec, rate-converted
//! playback and demodulating record paths, fast winding with automatic
//! program search, and the command-driven mode state machine tying it all
//! together.
//!
//! The machine side of the link is abstracted behind the
//! [`CassettePort`](port::CassettePort) trait: whatever USB bridge (or
//! test double) implements it supplies command bytes and consumes sample
//! chunks.  Front-ends drive the recorder through
//! [`DataRecorder`](recorder::DataRecorder)'s command and query surface
//! and observe it through [`DeckEvent`](recorder::DeckEvent) listeners.

pub mod bitstream;
pub mod port;
pub mod recorder;
pub mod tape;
pub mod transport;
pub mod util;

pub use crate::port::{CassettePort, PortError, Response, SampleRateClass};
pub use crate::recorder::{DataRecorder, DeckEvent, DeckMode, Sensor};
pub use crate::tape::{OpenError, TapeImage};
pub use crate::transport::TapeTransport;
pub use crate::util::Sink;
